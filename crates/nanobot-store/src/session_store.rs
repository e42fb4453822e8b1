use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use nanobot_common::{ConnectorId, Error, PairingStatus, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atomic::JsonDir;

/// Audit entries kept per session; older ones are dropped first.
const MAX_HISTORY: usize = 64;

/// Persisted authentication material for one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub connector_id: ConnectorId,
    /// Opaque blob produced by the bridge at pairing time.
    #[serde(with = "blob")]
    pub credential: Vec<u8>,
    pub status: PairingStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<SessionEvent>,
}

/// One status change in a session's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    pub status: PairingStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

/// File-backed session store, one record per connector under `sessions/`.
///
/// Every write is an atomic replace, and writes for the same connector are
/// serialized, so a reader never observes a torn or interleaved record.
pub struct SessionStore {
    records: JsonDir,
    locks: Mutex<HashMap<ConnectorId, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn open(dir: &Path) -> Result<Self> {
        info!("opening session store at {}", dir.display());
        Ok(Self {
            records: JsonDir::open(dir)?,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The persisted session for `connector_id`, if there is one.
    pub fn load(&self, connector_id: &ConnectorId) -> Result<Option<Session>> {
        self.records.read(connector_id.as_str())
    }

    /// Atomically replace the session for `connector_id`.
    pub fn save(
        &self,
        connector_id: &ConnectorId,
        credential: &[u8],
        status: PairingStatus,
    ) -> Result<Session> {
        self.save_with_reason(connector_id, credential, status, None)
    }

    /// Like [`save`](Self::save), recording why the status changed.
    pub fn save_with_reason(
        &self,
        connector_id: &ConnectorId,
        credential: &[u8],
        status: PairingStatus,
        reason: Option<&str>,
    ) -> Result<Session> {
        let lock = self.lock_for(connector_id);
        let _guard = lock
            .lock()
            .map_err(|_| Error::Store("session lock poisoned".into()))?;

        let history = self
            .load(connector_id)?
            .map(|previous| previous.history)
            .unwrap_or_default();

        let session = self.commit(connector_id, credential.to_vec(), status, reason, history)?;
        info!(connector = %connector_id, status = %status, "session saved");
        Ok(session)
    }

    /// Mark the session revoked, keeping its history for audit.
    ///
    /// Returns `None` when the connector never had a session.
    pub fn invalidate(&self, connector_id: &ConnectorId, reason: &str) -> Result<Option<Session>> {
        let lock = self.lock_for(connector_id);
        let _guard = lock
            .lock()
            .map_err(|_| Error::Store("session lock poisoned".into()))?;

        let Some(previous) = self.load(connector_id)? else {
            return Ok(None);
        };

        let session = self.commit(
            connector_id,
            previous.credential,
            PairingStatus::Revoked,
            Some(reason),
            previous.history,
        )?;
        info!(connector = %connector_id, reason, "session revoked");
        Ok(Some(session))
    }

    fn commit(
        &self,
        connector_id: &ConnectorId,
        credential: Vec<u8>,
        status: PairingStatus,
        reason: Option<&str>,
        mut history: Vec<SessionEvent>,
    ) -> Result<Session> {
        let now = Utc::now();
        history.push(SessionEvent {
            at: now,
            status,
            reason: reason.map(str::to_string),
        });
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }

        let session = Session {
            connector_id: connector_id.clone(),
            credential,
            status,
            updated_at: now,
            history,
        };
        self.records.write(connector_id.as_str(), &session)?;
        Ok(session)
    }

    fn lock_for(&self, connector_id: &ConnectorId) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(connector_id.clone()).or_default())
    }
}

mod blob {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
