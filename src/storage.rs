//! Local persistence of tracker state
//!
//! Everything needed to resume a session across restarts: the chain, the
//! time-gating anchor, accrued points and the commit state machine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::commit::CommitState;
use crate::error::NotabotError;
use crate::types::{Commitment, NotabotEvent, PendingCommit};

/// Current persisted state layout
pub const STATE_VERSION: u32 = 1;

/// Snapshot written on every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    /// Address of the identity that signed the chain
    pub identity_address: String,
    /// Hex public key of that identity
    pub public_key: String,
    /// Time-gating anchor
    pub session_start: DateTime<Utc>,
    /// Last session-duration observation, for once-a-minute spacing
    #[serde(default)]
    pub last_session_event: Option<DateTime<Utc>>,
    pub chain: Vec<NotabotEvent>,
    pub current_points: u64,
    #[serde(default)]
    pub last_accepted: Option<Commitment>,
    #[serde(default)]
    pub pending_commit: Option<PendingCommit>,
    #[serde(default)]
    pub commit_state: CommitState,
}

impl PersistedState {
    pub fn from_json(json: &str) -> Result<Self, NotabotError> {
        let state: PersistedState = serde_json::from_str(json)?;
        if state.version > STATE_VERSION {
            return Err(NotabotError::Persistence(format!(
                "state version {} is newer than supported {}",
                state.version, STATE_VERSION
            )));
        }
        Ok(state)
    }

    pub fn to_json(&self) -> Result<String, NotabotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Storage backend for [`PersistedState`]
pub trait StateStore: Send {
    /// `Ok(None)` when nothing has been saved yet
    fn load(&self) -> Result<Option<PersistedState>, NotabotError>;

    fn save(&self, state: &PersistedState) -> Result<(), NotabotError>;
}

/// JSON file store; writes go to a sibling temp file and are renamed into place
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<PersistedState>, NotabotError> {
        match fs::read_to_string(&self.path) {
            Ok(json) => PersistedState::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), NotabotError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.temp_path();
        fs::write(&tmp, state.to_json()?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store for tests and embedders that persist elsewhere
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    /// Copy of the last saved state
    pub fn snapshot(&self) -> Option<PersistedState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<PersistedState>, NotabotError> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| NotabotError::Persistence("state lock poisoned".to_string()))
    }

    fn save(&self, state: &PersistedState) -> Result<(), NotabotError> {
        let mut slot = self
            .state
            .lock()
            .map_err(|_| NotabotError::Persistence("state lock poisoned".to_string()))?;
        *slot = Some(state.clone());
        Ok(())
    }
}

impl<T: StateStore + Sync> StateStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<PersistedState>, NotabotError> {
        (**self).load()
    }

    fn save(&self, state: &PersistedState) -> Result<(), NotabotError> {
        (**self).save(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn sample_state() -> PersistedState {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();
        PersistedState {
            version: STATE_VERSION,
            identity_address: "0xabc".to_string(),
            public_key: "00".repeat(32),
            session_start: start,
            last_session_event: Some(start + chrono::Duration::minutes(12)),
            chain: Vec::new(),
            current_points: 42,
            last_accepted: None,
            pending_commit: None,
            commit_state: CommitState::PendingDeferred {
                retry_at: start + chrono::Duration::minutes(30),
            },
        }
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("nested").join("state.json"));

        assert_eq!(store.load().unwrap(), None);

        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        let store = FileStateStore::new(&path);
        assert!(matches!(store.load(), Err(NotabotError::JsonError(_))));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut state = sample_state();
        state.version = STATE_VERSION + 1;
        let json = state.to_json().unwrap();
        assert!(matches!(
            PersistedState::from_json(&json),
            Err(NotabotError::Persistence(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&sample_state()).unwrap();
        assert_eq!(store.snapshot().unwrap().current_points, 42);
    }
}
