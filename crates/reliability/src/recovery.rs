//! Crash-recovery snapshot.
//!
//! A small marker written before a turn submits anything, so that a host
//! restarted mid-generation can tell the last turn never finished.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_core::EphemeralStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    pub session_id: String,
    /// Index of the user message that started the interrupted turn
    pub last_message_index: usize,
    pub was_generating: bool,
    pub saved_at: DateTime<Utc>,
}

impl RecoverySnapshot {
    /// A snapshot for a generation that is about to start.
    pub fn generating(session_id: impl Into<String>, last_message_index: usize) -> Self {
        Self {
            session_id: session_id.into(),
            last_message_index,
            was_generating: true,
            saved_at: Utc::now(),
        }
    }
}

/// Reads and writes the snapshot in one well-known storage slot.
///
/// Storage problems never reach the caller: they are logged and the
/// operation degrades to a no-op.
#[derive(Clone)]
pub struct RecoveryStore {
    store: Arc<dyn EphemeralStore>,
    key: String,
}

impl RecoveryStore {
    pub fn new(store: Arc<dyn EphemeralStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn save(&self, snapshot: &RecoverySnapshot) {
        let json = match serde_json::to_string(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to serialize recovery snapshot");
                return;
            }
        };
        match self.store.set(&self.key, &json) {
            Ok(()) => debug!(session_id = %snapshot.session_id, "Recovery snapshot saved"),
            Err(e) => warn!(key = %self.key, error = %e, "Failed to save recovery snapshot"),
        }
    }

    /// The stored snapshot, or `None` when absent, unreadable or malformed.
    pub fn load(&self) -> Option<RecoverySnapshot> {
        let raw = match self.store.get(&self.key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to read recovery snapshot");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Discarding malformed recovery snapshot");
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            warn!(key = %self.key, error = %e, "Failed to clear recovery snapshot");
        }
    }

    pub fn exists(&self) -> bool {
        self.load().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{InMemoryStore, StorageError};

    /// Rejects every operation.
    struct BrokenStore;

    impl EphemeralStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("disabled".into()))
        }
        fn set(&self, key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::QuotaExceeded { key: key.into() })
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disabled".into()))
        }
    }

    #[test]
    fn save_load_clear() {
        let recovery = RecoveryStore::new(Arc::new(InMemoryStore::new()), "parley.recovery");
        assert!(!recovery.exists());

        let snapshot = RecoverySnapshot::generating("session-1", 7);
        recovery.save(&snapshot);
        assert!(recovery.exists());
        assert_eq!(recovery.load(), Some(snapshot));

        recovery.clear();
        assert!(recovery.load().is_none());
    }

    #[test]
    fn stored_as_camel_case_json() {
        let store = Arc::new(InMemoryStore::new());
        let recovery = RecoveryStore::new(store.clone(), "parley.recovery");
        recovery.save(&RecoverySnapshot::generating("s", 2));

        let raw = store.get("parley.recovery").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["sessionId"], "s");
        assert_eq!(value["lastMessageIndex"], 2);
        assert_eq!(value["wasGenerating"], true);
        assert!(value["savedAt"].is_string());
    }

    #[test]
    fn malformed_data_loads_as_none() {
        let store = Arc::new(InMemoryStore::new());
        store.set("parley.recovery", "{not json").unwrap();
        let recovery = RecoveryStore::new(store, "parley.recovery");
        assert!(recovery.load().is_none());
        assert!(!recovery.exists());
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let recovery = RecoveryStore::new(Arc::new(BrokenStore), "parley.recovery");
        recovery.save(&RecoverySnapshot::generating("s", 0));
        assert!(recovery.load().is_none());
        recovery.clear();
    }
}
