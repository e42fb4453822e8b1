use std::path::Path;

use chrono::{DateTime, Utc};
use nanobot_common::{ConnectorId, Result};
use serde::{Deserialize, Serialize};

use crate::atomic::JsonDir;

/// Supervisor restart state for one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRecord {
    pub connector_id: ConnectorId,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub failed: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RestartRecord {
    pub fn new(connector_id: ConnectorId) -> Self {
        Self {
            connector_id,
            restart_count: 0,
            consecutive_failures: 0,
            failed: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Restart state under `supervisor/`, written with the same atomic path as sessions.
pub struct RestartLedger {
    records: JsonDir,
}

impl RestartLedger {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            records: JsonDir::open(dir)?,
        })
    }

    pub fn load(&self, connector_id: &ConnectorId) -> Result<Option<RestartRecord>> {
        self.records.read(connector_id.as_str())
    }

    pub fn save(&self, record: &RestartRecord) -> Result<()> {
        self.records.write(record.connector_id.as_str(), record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RestartLedger::open(dir.path()).unwrap();
        let id = ConnectorId::from_string("wa1");
        assert!(ledger.load(&id).unwrap().is_none());

        let mut record = RestartRecord::new(id.clone());
        record.restart_count = 4;
        record.failed = true;
        record.last_error = Some("heartbeat timeout".into());
        ledger.save(&record).unwrap();

        let reopened = RestartLedger::open(dir.path()).unwrap();
        assert_eq!(reopened.load(&id).unwrap(), Some(record));
    }
}
