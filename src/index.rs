use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{DatabaseError, DatabaseResult};
use crate::rid::RID;

/// Unique mapping from primary-key value to base RID. Backed by a hash map;
/// no ordering is required of it.
pub struct PrimaryIndex {
    key_to_rid: Mutex<HashMap<i64, RID>>,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        PrimaryIndex {
            key_to_rid: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_map(key_to_rid: HashMap<i64, RID>) -> Self {
        PrimaryIndex {
            key_to_rid: Mutex::new(key_to_rid),
        }
    }

    /// Register a fresh key. Fails when the key is already present.
    pub fn add(&self, key: i64, rid: RID) -> DatabaseResult<()> {
        let mut map = self.key_to_rid.lock().unwrap();
        if map.contains_key(&key) {
            return Err(DatabaseError::DuplicateKey(key));
        }
        map.insert(key, rid);
        Ok(())
    }

    pub fn get(&self, key: i64) -> DatabaseResult<RID> {
        self.key_to_rid
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .ok_or(DatabaseError::KeyNotFound(key))
    }

    pub fn exists(&self, key: i64) -> bool {
        self.key_to_rid.lock().unwrap().contains_key(&key)
    }

    pub fn delete(&self, key: i64) -> DatabaseResult<RID> {
        self.key_to_rid
            .lock()
            .unwrap()
            .remove(&key)
            .ok_or(DatabaseError::KeyNotFound(key))
    }

    /// RIDs of every key in the inclusive range. Used by range aggregation.
    pub fn rids_in_key_range(&self, start: i64, end: i64) -> Vec<RID> {
        self.key_to_rid
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| (start..=end).contains(*key))
            .map(|(_, rid)| *rid)
            .collect()
    }

    /// Snapshot of every (key, RID) pair. Used by brute-force search.
    pub fn snapshot(&self) -> Vec<(i64, RID)> {
        self.key_to_rid
            .lock()
            .unwrap()
            .iter()
            .map(|(key, rid)| (*key, *rid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.key_to_rid.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_rid.lock().unwrap().is_empty()
    }
}

impl Default for PrimaryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_add_is_rejected() {
        let index = PrimaryIndex::new();
        index.add(5, 1).unwrap();
        assert!(matches!(index.add(5, 2), Err(DatabaseError::DuplicateKey(5))));
        assert_eq!(index.get(5).unwrap(), 1);
    }

    #[test]
    fn delete_then_reuse() {
        let index = PrimaryIndex::new();
        index.add(5, 1).unwrap();
        assert_eq!(index.delete(5).unwrap(), 1);
        assert!(matches!(index.get(5), Err(DatabaseError::KeyNotFound(5))));
        index.add(5, 9).unwrap();
        assert_eq!(index.get(5).unwrap(), 9);
    }

    #[test]
    fn key_range_scan() {
        let index = PrimaryIndex::new();
        for key in 1..=10 {
            index.add(key, key * 100).unwrap();
        }
        let mut rids = index.rids_in_key_range(3, 5);
        rids.sort();
        assert_eq!(rids, vec![300, 400, 500]);
    }
}
