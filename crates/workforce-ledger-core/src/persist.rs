use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable key-value home for serialized collections.
///
/// The ledger writes whole collections: one JSON array per key.
pub trait CollectionStore {
    #[allow(clippy::missing_errors_doc)]
    fn load(&self, key: &str) -> Result<Option<Value>>;

    #[allow(clippy::missing_errors_doc)]
    fn save(&mut self, key: &str, value: &Value) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// A collection that could not be restored at startup and was reset to empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadDiagnostic {
    pub collection: String,
    pub message: String,
}

/// In-process store, used by tests and by hosts that persist elsewhere.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryCollectionStore {
    collections: BTreeMap<String, Value>,
}

impl MemoryCollectionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.collections.get(key)
    }

    /// Seeds a raw value, bypassing the ledger.
    pub fn insert_raw(&mut self, key: &str, value: Value) {
        self.collections.insert(key.to_string(), value);
    }
}

impl CollectionStore for MemoryCollectionStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.collections.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        self.collections.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.collections.remove(key);
        Ok(())
    }
}

impl<S: CollectionStore + ?Sized> CollectionStore for &mut S {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        (**self).load(key)
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        (**self).save(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn memory_store_round_trips_and_removes() {
        let mut store = MemoryCollectionStore::new();
        assert_eq!(must(store.load("portfolios")), None);

        must(store.save("portfolios", &json!([{"name": "Caixa"}])));
        assert_eq!(
            must(store.load("portfolios")),
            Some(json!([{"name": "Caixa"}]))
        );

        must(store.remove("portfolios"));
        assert_eq!(must(store.load("portfolios")), None);
        assert!(store.get("portfolios").is_none());
    }
}
