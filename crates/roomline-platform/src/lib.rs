//! Persistent key-value settings and the per-room activity log built on them.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::debug;

const ACTIVITY_NAMESPACE: &str = "roomline";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsStoreError {
    #[error("setting not found")]
    NotFound,
    #[error("settings store unavailable: {0}")]
    Unavailable(String),
    #[error("settings store backend failure: {0}")]
    Backend(String),
    #[error("setting {key} holds unreadable value '{value}'")]
    Corrupt { key: String, value: String },
}

pub trait SettingsStore: Send + Sync {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsStoreError>;

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, SettingsStoreError>;

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), SettingsStoreError>;
}

impl<S: SettingsStore + ?Sized> SettingsStore for Arc<S> {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsStoreError> {
        (**self).set_value(namespace, key, value)
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, SettingsStoreError> {
        (**self).get_value(namespace, key)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), SettingsStoreError> {
        (**self).delete_value(namespace, key)
    }
}

#[derive(Clone, Default)]
pub struct InMemorySettingsStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl SettingsStore for InMemorySettingsStore {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SettingsStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, SettingsStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| SettingsStoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(namespace.to_owned(), key.to_owned()))
            .cloned()
            .ok_or(SettingsStoreError::NotFound)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), SettingsStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| SettingsStoreError::Backend("poisoned lock".to_owned()))?;
        if data
            .remove(&(namespace.to_owned(), key.to_owned()))
            .is_none()
        {
            return Err(SettingsStoreError::NotFound);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScopedSettingsStore<S: SettingsStore> {
    inner: S,
    namespace: String,
}

impl<S: SettingsStore> ScopedSettingsStore<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), SettingsStoreError> {
        self.inner.set_value(&self.namespace, key, value)
    }

    pub fn get(&self, key: &str) -> Result<String, SettingsStoreError> {
        self.inner.get_value(&self.namespace, key)
    }

    /// Like [`Self::get`], but a missing key is `Ok(None)`.
    pub fn get_optional(&self, key: &str) -> Result<Option<String>, SettingsStoreError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(SettingsStoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), SettingsStoreError> {
        self.inner.delete_value(&self.namespace, key)
    }
}

/// Per-room timestamps persisted across sessions.
///
/// Keys are `room_activity:<room>` for the last outgoing send activity and
/// `room_read_ts:<room>` for the local read marker.
#[derive(Clone)]
pub struct ActivityLog {
    store: ScopedSettingsStore<Arc<dyn SettingsStore>>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store: ScopedSettingsStore::new(store, ACTIVITY_NAMESPACE),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySettingsStore::default()))
    }

    pub fn record_activity(&self, room_id: &str, ts_ms: u64) -> Result<(), SettingsStoreError> {
        debug!(room_id = %room_id, ts_ms, "recording room activity");
        self.store.set(&activity_key(room_id), &ts_ms.to_string())
    }

    pub fn last_activity(&self, room_id: &str) -> Result<Option<u64>, SettingsStoreError> {
        self.read_ts(&activity_key(room_id))
    }

    /// Persist the read marker if it is newer than the stored one.
    ///
    /// Returns `true` when the stored value changed.
    pub fn record_read_ts(&self, room_id: &str, ts_ms: u64) -> Result<bool, SettingsStoreError> {
        let key = read_ts_key(room_id);
        if let Some(stored) = self.read_ts(&key)?
            && stored >= ts_ms
        {
            return Ok(false);
        }
        debug!(room_id = %room_id, ts_ms, "recording read marker");
        self.store.set(&key, &ts_ms.to_string())?;
        Ok(true)
    }

    pub fn last_read_ts(&self, room_id: &str) -> Result<Option<u64>, SettingsStoreError> {
        self.read_ts(&read_ts_key(room_id))
    }

    fn read_ts(&self, key: &str) -> Result<Option<u64>, SettingsStoreError> {
        let Some(raw) = self.store.get_optional(key)? else {
            return Ok(None);
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SettingsStoreError::Corrupt {
                key: key.to_owned(),
                value: raw,
            })
    }
}

fn activity_key(room_id: &str) -> String {
    format!("room_activity:{room_id}")
}

fn read_ts_key(room_id: &str) -> String {
    format!("room_read_ts:{room_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "!room:example.org";

    #[test]
    fn in_memory_roundtrip() {
        let store = InMemorySettingsStore::default();
        store
            .set_value("roomline", "theme", "dark")
            .expect("set should work");

        let got = store
            .get_value("roomline", "theme")
            .expect("get should work");
        assert_eq!(got, "dark");

        store
            .delete_value("roomline", "theme")
            .expect("delete should work");
        assert_eq!(
            store.get_value("roomline", "theme"),
            Err(SettingsStoreError::NotFound)
        );
    }

    #[test]
    fn scoped_store_isolates_namespaces() {
        let base = InMemorySettingsStore::default();
        let a = ScopedSettingsStore::new(base.clone(), "profile-a");
        let b = ScopedSettingsStore::new(base.clone(), "profile-b");

        a.set("theme", "dark").expect("set a");
        b.set("theme", "light").expect("set b");

        assert_eq!(a.get("theme").expect("get a"), "dark");
        assert_eq!(b.get("theme").expect("get b"), "light");
        assert_eq!(a.get_optional("missing").expect("lookup a"), None);
    }

    #[test]
    fn activity_log_records_latest_send_activity() {
        let log = ActivityLog::in_memory();
        assert_eq!(log.last_activity(ROOM).expect("read"), None);

        log.record_activity(ROOM, 1_000).expect("record");
        log.record_activity(ROOM, 900).expect("record");
        assert_eq!(log.last_activity(ROOM).expect("read"), Some(900));
    }

    #[test]
    fn read_marker_only_moves_forward() {
        let log = ActivityLog::in_memory();
        assert!(log.record_read_ts(ROOM, 500).expect("record"));
        assert!(!log.record_read_ts(ROOM, 400).expect("record"));
        assert!(log.record_read_ts(ROOM, 800).expect("record"));
        assert_eq!(log.last_read_ts(ROOM).expect("read"), Some(800));
    }

    #[test]
    fn unreadable_timestamp_is_reported() {
        let base = InMemorySettingsStore::default();
        base.set_value(ACTIVITY_NAMESPACE, &read_ts_key(ROOM), "soon")
            .expect("seed");
        let log = ActivityLog::new(Arc::new(base));

        let err = log.last_read_ts(ROOM).expect_err("garbage must not parse");
        assert!(matches!(err, SettingsStoreError::Corrupt { .. }));
    }

    #[derive(Default)]
    struct FailingStore;

    impl SettingsStore for FailingStore {
        fn set_value(&self, _ns: &str, _key: &str, _value: &str) -> Result<(), SettingsStoreError> {
            Err(SettingsStoreError::Unavailable("mock outage".to_owned()))
        }

        fn get_value(&self, _ns: &str, _key: &str) -> Result<String, SettingsStoreError> {
            Err(SettingsStoreError::Unavailable("mock outage".to_owned()))
        }

        fn delete_value(&self, _ns: &str, _key: &str) -> Result<(), SettingsStoreError> {
            Err(SettingsStoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn mock_failure_propagates_through_activity_log() {
        let log = ActivityLog::new(Arc::new(FailingStore));
        let err = log
            .record_read_ts(ROOM, 1)
            .expect_err("record must fail");
        assert_eq!(err, SettingsStoreError::Unavailable("mock outage".to_owned()));
    }
}
