//! In-memory store for tests.
//!
//! Not durable and not leak-resistant; exists so engine and wallet logic can
//! be exercised without touching the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{StorageError, StorageResult};

use super::{BatchOp, KvStore};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Memory-backed implementation of the backing-store contract.
#[derive(Default)]
pub struct MemoryStore {
    dbs: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn create_db(&self, name: &str) -> StorageResult<()> {
        let mut dbs = self.dbs.write().expect("store lock poisoned");
        dbs.entry(name.to_string()).or_default();
        Ok(())
    }

    fn has_db(&self, name: &str) -> StorageResult<bool> {
        let dbs = self.dbs.read().expect("store lock poisoned");
        Ok(dbs.contains_key(name))
    }

    fn get(&self, db: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let dbs = self.dbs.read().expect("store lock poisoned");
        let table = dbs
            .get(db)
            .ok_or_else(|| StorageError::InvalidDbName(db.to_string()))?;
        Ok(table.get(key).cloned())
    }

    fn scan(&self, db: &str) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let dbs = self.dbs.read().expect("store lock poisoned");
        let table = dbs
            .get(db)
            .ok_or_else(|| StorageError::InvalidDbName(db.to_string()))?;
        Ok(table.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn write_batch(&self, db: &str, ops: Vec<BatchOp>) -> StorageResult<()> {
        let mut dbs = self.dbs.write().expect("store lock poisoned");
        let table = dbs
            .get_mut(db)
            .ok_or_else(|| StorageError::InvalidDbName(db.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    table.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    table.remove(&key);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dbs = self.dbs.read().expect("store lock poisoned");
        f.debug_struct("MemoryStore")
            .field("db_count", &dbs.len())
            .finish_non_exhaustive()
    }
}
