//! Typed attribute store attached to a request, connection or session.
//!
//! Used to cache Context instances on the container-side unit they belong to,
//! and for application user properties.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

type Value = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Attributes {
    values: RwLock<HashMap<String, Value>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attribute stored under `name`, if it holds a `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let value = self.values.read().get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Store `value` under `name`, returning whatever was there before.
    pub fn insert<T: Send + Sync + 'static>(&self, name: impl Into<String>, value: Arc<T>) -> Option<Value> {
        self.values.write().insert(name.into(), value)
    }

    /// The `T` stored under `name`, creating it with `init` if absent or of another type.
    ///
    /// `init` runs under the write lock and must not touch this store.
    pub fn get_or_insert_with<T: Send + Sync + 'static>(&self, name: &str, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get::<T>(name) {
            return existing;
        }
        let mut values = self.values.write();
        if let Some(existing) = values.get(name).cloned().and_then(|v| v.downcast::<T>().ok()) {
            return existing;
        }
        let created = Arc::new(init());
        values.insert(name.to_string(), created.clone());
        created
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.values.write());
        drop(drained);
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes").field("names", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_typed() {
        let attrs = Attributes::new();
        attrs.insert("user", Arc::new(String::from("alice")));
        assert_eq!(attrs.get::<String>("user").as_deref().map(String::as_str), Some("alice"));
        assert!(attrs.get::<u32>("user").is_none());
    }

    #[test]
    fn get_or_insert_with_keeps_first_value() {
        let attrs = Attributes::new();
        let first = attrs.get_or_insert_with("count", || 1u32);
        let second = attrs.get_or_insert_with("count", || 2u32);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 1);
    }
}
