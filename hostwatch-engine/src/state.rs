use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// One exclusive lock per connector id, handed out to force-serialized
/// sources and criteria. Guards the protocol session, not the monitor store.
#[derive(Debug, Default)]
pub struct SerializationLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SerializationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, connector_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(connector_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `f` while holding the connector lock. Returns `None` when the lock
    /// could not be acquired within `timeout`.
    pub fn serialize<T>(&self, connector_id: &str, timeout: Duration, f: impl FnOnce() -> T) -> Option<T> {
        let lock = self.lock_for(connector_id);
        let _guard = lock.try_lock_for(timeout)?;
        Some(f())
    }
}
