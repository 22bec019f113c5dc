//! In-memory `KeyValueStore`.

use super::{KeyValueStore, StorageResult};
use std::collections::BTreeMap;

/// Volatile store for tests and memory-only shells.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &str) -> StorageResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_all(&self) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .values
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn delete(&mut self, key: &str) -> StorageResult<()> {
        self.values.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.values.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::storage::KeyValueStore;

    #[test]
    fn get_all_is_ordered_by_key() {
        let mut store = MemoryStore::new();
        store.put("b", "2").unwrap();
        store.put("a", "1").unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(
            all,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn delete_and_clear_remove_values() {
        let mut store = MemoryStore::new();
        store.put("a", "1").unwrap();
        store.put("b", "2").unwrap();

        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.len(), 1);

        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
