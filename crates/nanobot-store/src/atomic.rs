//! One-JSON-file-per-key directory with atomic replace.
//!
//! A record is written to a hidden staging file, fsynced, then renamed over
//! the live file. The rename is the commit point, so readers only ever see
//! the previous or the new record.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nanobot_common::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

const STAGING_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub(crate) struct JsonDir {
    dir: PathBuf,
}

impl JsonDir {
    /// Open (and create) the directory, discarding staging files left by a crash.
    pub(crate) fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::Store(format!("failed to create {}: {e}", dir.display()))
        })?;
        let store = Self { dir };
        store.sweep_staging()?;
        Ok(store)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    pub(crate) fn staging_path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!(".{}.json{STAGING_SUFFIX}", encode_key(key)))
    }

    pub(crate) fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|e| Error::Store(format!("corrupt record {}: {e}", path.display())))
    }

    pub(crate) fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key);
        let staging = self.staging_path_for(key);
        let json = serde_json::to_vec_pretty(value)?;

        let staged = (|| -> std::io::Result<()> {
            let mut file = File::create(&staging)?;
            file.write_all(&json)?;
            file.sync_all()
        })();
        if let Err(e) = staged {
            let _ = fs::remove_file(&staging);
            return Err(Error::Store(format!(
                "failed to stage {}: {e}",
                staging.display()
            )));
        }

        fs::rename(&staging, &path).map_err(|e| {
            Error::Store(format!("failed to commit {}: {e}", path.display()))
        })?;
        sync_dir(&self.dir);
        debug!(path = %path.display(), "record committed");
        Ok(())
    }

    fn sweep_staging(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::Store(format!("failed to list {}: {e}", self.dir.display()))
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(STAGING_SUFFIX) {
                warn!(file = %name, "removing staging file left by interrupted write");
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

/// Make the rename durable. Best effort: not every platform can open a directory.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Map a key to a file stem, escaping anything outside `[A-Za-z0-9_-]`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
