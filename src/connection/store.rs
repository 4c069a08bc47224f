use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

type Value = Arc<dyn Any + Send + Sync>;

/// Named values attached to a connection by the application.
#[derive(Default)]
pub struct Store {
    values: Mutex<HashMap<String, Value>>,
}

impl Store {
    pub fn new() -> Self {
        Default::default()
    }

    /// Associates `value` with `key`, replacing any previous value.
    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.lock().insert(key.into(), Arc::new(value));
    }

    /// Associates `value` with `key` only if the key is absent. Returns true if inserted.
    pub fn try_set<T>(&self, key: impl Into<String>, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        let ref mut values = *self.values.lock();
        let key = key.into();

        if values.contains_key(&key) {
            return false;
        }

        values.insert(key, Arc::new(value));
        true
    }

    /// Returns the value stored under `key` if it exists and has type `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.values.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes `key`. Returns true if it was present.
    pub fn del(&self, key: &str) -> bool {
        self.values.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.values.lock().clear();
    }
}
