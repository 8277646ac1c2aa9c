//! Branch → agent session map, persisted as JSON.
//!
//! The store is an explicit object shared by `Arc`; there is no process-wide
//! cache. Every mutation runs under one mutex and is written through to the
//! backing [`SessionPersistence`] before the in-memory map changes, so a
//! failed write leaves both the file and the map as they were.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::SpeckitError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether an agent conversation already runs under this id.
    ///
    /// A fresh record has never been touched, so both timestamps are equal.
    pub fn has_conversation(&self) -> bool {
        self.last_used_at > self.created_at
    }
}

pub type SessionMap = BTreeMap<String, SessionRecord>;

/// Where the session map lives between runs.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<SessionMap, SpeckitError>;

    /// Durably replace the stored map with `sessions`.
    fn save(&self, sessions: &SessionMap) -> Result<(), SpeckitError>;
}

/// Pretty JSON object keyed by branch, rewritten whole on each save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn failure(&self, source: std::io::Error) -> SpeckitError {
        SpeckitError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}

impl SessionPersistence for JsonFilePersistence {
    fn load(&self) -> Result<SessionMap, SpeckitError> {
        if !self.path.exists() {
            return Ok(SessionMap::new());
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| self.failure(e))?;
        if contents.trim().is_empty() {
            return Ok(SessionMap::new());
        }
        serde_json::from_str(&contents).map_err(|e| self.failure(e.into()))
    }

    fn save(&self, sessions: &SessionMap) -> Result<(), SpeckitError> {
        let mut buf = serde_json::to_string_pretty(sessions).map_err(|e| self.failure(e.into()))?;
        buf.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.failure(e))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, buf).map_err(|e| self.failure(e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| self.failure(e))
    }
}

/// Keeps the saved map in memory. Used when nothing should touch disk.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    saved: Mutex<SessionMap>,
}

impl MemoryPersistence {
    pub fn with_sessions(sessions: SessionMap) -> Self {
        Self {
            saved: Mutex::new(sessions),
        }
    }

    /// Last map handed to `save`.
    pub fn saved(&self) -> SessionMap {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> Result<SessionMap, SpeckitError> {
        Ok(self.saved())
    }

    fn save(&self, sessions: &SessionMap) -> Result<(), SpeckitError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = sessions.clone();
        Ok(())
    }
}

pub struct SessionStore {
    persistence: Box<dyn SessionPersistence>,
    sessions: Mutex<SessionMap>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Load the full map from `persistence`.
    pub fn open(persistence: impl SessionPersistence + 'static) -> Result<Self, SpeckitError> {
        let sessions = persistence.load()?;
        debug!(count = sessions.len(), "loaded sessions");
        Ok(Self {
            persistence: Box::new(persistence),
            sessions: Mutex::new(sessions),
        })
    }

    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, SpeckitError> {
        Self::open(JsonFilePersistence::new(path))
    }

    /// Session id for `branch`, creating and persisting one if absent.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, branch: &str) -> Result<String, SpeckitError> {
        let mut sessions = self.lock();
        if let Some(record) = sessions.get(branch) {
            return Ok(record.session_id.clone());
        }

        let now = Utc::now();
        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            created_at: now,
            last_used_at: now,
        };
        let session_id = record.session_id.clone();
        let mut next = sessions.clone();
        next.insert(branch.to_string(), record);
        self.commit(&mut sessions, next)?;
        debug!(%session_id, "created session");
        Ok(session_id)
    }

    pub fn get(&self, branch: &str) -> Option<String> {
        self.lock()
            .get(branch)
            .map(|record| record.session_id.clone())
    }

    pub fn record(&self, branch: &str) -> Option<SessionRecord> {
        self.lock().get(branch).cloned()
    }

    /// Refresh `last_used_at`. Returns false (and writes nothing) for unknown branches.
    #[instrument(skip(self))]
    pub fn touch(&self, branch: &str) -> Result<bool, SpeckitError> {
        let mut sessions = self.lock();
        if !sessions.contains_key(branch) {
            return Ok(false);
        }
        let mut next = sessions.clone();
        if let Some(record) = next.get_mut(branch) {
            record.last_used_at = Utc::now();
        }
        self.commit(&mut sessions, next)?;
        Ok(true)
    }

    /// Store the session id the agent reported for `branch` and mark it used.
    ///
    /// Keeps `created_at`. Returns false (and writes nothing) for unknown branches.
    #[instrument(skip(self))]
    pub fn bind(&self, branch: &str, session_id: &str) -> Result<bool, SpeckitError> {
        let mut sessions = self.lock();
        if !sessions.contains_key(branch) {
            return Ok(false);
        }
        let mut next = sessions.clone();
        if let Some(record) = next.get_mut(branch) {
            if record.session_id != session_id {
                debug!(previous = %record.session_id, "agent reported a new session id");
                record.session_id = session_id.to_string();
            }
            record.last_used_at = Utc::now();
        }
        self.commit(&mut sessions, next)?;
        Ok(true)
    }

    /// Remove the record for `branch`. Returns whether one existed.
    #[instrument(skip(self))]
    pub fn clear(&self, branch: &str) -> Result<bool, SpeckitError> {
        let mut sessions = self.lock();
        if !sessions.contains_key(branch) {
            return Ok(false);
        }
        let mut next = sessions.clone();
        next.remove(branch);
        self.commit(&mut sessions, next)?;
        debug!("cleared session");
        Ok(true)
    }

    /// Snapshot of every record. Changing it does not affect the store.
    pub fn list(&self) -> SessionMap {
        self.lock().clone()
    }

    fn commit(&self, sessions: &mut SessionMap, next: SessionMap) -> Result<(), SpeckitError> {
        self.persistence.save(&next)?;
        *sessions = next;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct FlakyPersistence {
        inner: MemoryPersistence,
        fail: AtomicBool,
    }

    impl SessionPersistence for Arc<FlakyPersistence> {
        fn load(&self) -> Result<SessionMap, SpeckitError> {
            self.inner.load()
        }

        fn save(&self, sessions: &SessionMap) -> Result<(), SpeckitError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SpeckitError::Persistence {
                    path: PathBuf::from("memory"),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.save(sessions)
        }
    }

    #[test]
    fn get_or_create_is_stable_until_cleared() {
        let store = SessionStore::open(MemoryPersistence::default()).expect("open");
        let first = store.get_or_create("017-foo").expect("create");
        let second = store.get_or_create("017-foo").expect("get");
        assert_eq!(first, second);

        assert!(store.clear("017-foo").expect("clear"));
        let third = store.get_or_create("017-foo").expect("recreate");
        assert_ne!(first, third);
    }

    #[test]
    fn touch_and_clear_ignore_unknown_branches() {
        let store = SessionStore::open(MemoryPersistence::default()).expect("open");
        assert!(!store.touch("missing").expect("touch"));
        assert!(!store.clear("missing").expect("clear"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn touch_refreshes_last_used_only() {
        let store = SessionStore::open(MemoryPersistence::default()).expect("open");
        let id = store.get_or_create("001-a").expect("create");
        let before = store.record("001-a").expect("record");

        assert!(store.touch("001-a").expect("touch"));
        let after = store.record("001-a").expect("record");
        assert_eq!(after.session_id, id);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.last_used_at >= before.last_used_at);
    }

    #[test]
    fn bind_replaces_the_id_and_marks_the_conversation() {
        let store = SessionStore::open(MemoryPersistence::default()).expect("open");
        store.get_or_create("017-foo").expect("create");
        let before = store.record("017-foo").expect("record");
        assert!(!before.has_conversation());

        assert!(store.bind("017-foo", "agent-forked").expect("bind"));
        let after = store.record("017-foo").expect("record");
        assert_eq!(after.session_id, "agent-forked");
        assert_eq!(after.created_at, before.created_at);
        assert!(after.has_conversation());
        assert_eq!(store.get_or_create("017-foo").expect("get"), "agent-forked");

        assert!(!store.bind("missing", "x").expect("bind unknown"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn bind_is_persisted() {
        let persistence = Arc::new(FlakyPersistence::default());
        let store = SessionStore::open(Arc::clone(&persistence)).expect("open");
        store.get_or_create("001-a").expect("create");
        store.bind("001-a", "s-2").expect("bind");
        assert_eq!(persistence.inner.saved()["001-a"].session_id, "s-2");

        persistence.fail.store(true, Ordering::SeqCst);
        assert!(store.bind("001-a", "s-3").is_err());
        assert_eq!(store.get("001-a").as_deref(), Some("s-2"));
    }

    #[test]
    fn list_is_a_detached_copy() {
        let store = SessionStore::open(MemoryPersistence::default()).expect("open");
        store.get_or_create("001-a").expect("create");
        let mut snapshot = store.list();
        snapshot.clear();
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn failed_save_propagates_and_rolls_back() {
        let persistence = Arc::new(FlakyPersistence::default());
        let store = SessionStore::open(Arc::clone(&persistence)).expect("open");
        let kept = store.get_or_create("001-a").expect("create");

        persistence.fail.store(true, Ordering::SeqCst);
        let err = store.get_or_create("002-b").expect_err("save fails");
        assert!(matches!(err, SpeckitError::Persistence { .. }));
        assert_eq!(store.get("002-b"), None);
        assert!(store.clear("001-a").is_err());
        assert_eq!(store.get("001-a"), Some(kept));
        assert_eq!(persistence.inner.saved().len(), 1);
    }

    #[test]
    fn json_file_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".speckit/sessions.json");

        let store = SessionStore::open_file(&path).expect("open");
        let id = store.get_or_create("003-c").expect("create");
        drop(store);

        let raw = fs::read_to_string(&path).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed["003-c"]["session_id"], id.as_str());
        assert!(parsed["003-c"]["created_at"].is_string());

        let reopened = SessionStore::open_file(&path).expect("reopen");
        assert_eq!(reopened.get("003-c"), Some(id));
    }

    #[test]
    fn corrupt_file_is_a_persistence_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("sessions.json");
        fs::write(&path, "{not json").expect("write");
        let err = SessionStore::open_file(&path).expect_err("corrupt");
        assert!(matches!(err, SpeckitError::Persistence { .. }));
    }

    #[test]
    fn concurrent_get_or_create_yields_one_id() {
        let store = Arc::new(SessionStore::open(MemoryPersistence::default()).expect("open"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get_or_create("017-foo").expect("create"))
            })
            .collect();
        let ids: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
