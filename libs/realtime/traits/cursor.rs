use crate::traits::error::{Result, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Storage behind the resumption cursor
///
/// Both operations may fail; callers treat them as best effort.
pub trait CursorStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Process-local cursor store
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCursorStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store that keeps nothing; resumption is disabled
#[derive(Debug, Default)]
pub struct NoCursorStore;

impl CursorStore for NoCursorStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(TransportError::Storage("cursor persistence disabled".into()))
    }
}

/// Best-effort view of one key in a [`CursorStore`]
#[derive(Debug, Clone)]
pub struct ResumeCursor {
    store: Arc<dyn CursorStore>,
    key: String,
}

impl ResumeCursor {
    pub fn new(store: Arc<dyn CursorStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Stored cursor, or `None` if absent or unreadable
    pub fn load(&self) -> Option<String> {
        match self.store.get(&self.key) {
            Ok(value) => value,
            Err(e) => {
                debug!("Ignoring cursor read failure for '{}': {}", self.key, e);
                None
            }
        }
    }

    /// Persist `id`; failures are logged and dropped
    pub fn persist(&self, id: &str) {
        if let Err(e) = self.store.set(&self.key, id) {
            debug!("Ignoring cursor write failure for '{}': {}", self.key, e);
        }
    }
}
