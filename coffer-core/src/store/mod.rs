//! Backing-store abstraction.
//!
//! The engine depends on an ordered, byte-keyed store with named sub-DBs
//! inside one environment, atomic write batches, and ascending key
//! enumeration. Everything above this seam is store-agnostic; the two
//! implementations are [`SqliteStore`] for wallet files on disk and
//! [`MemoryStore`] for tests.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StorageResult;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// Record key.
        key: Vec<u8>,
        /// Record value.
        value: Vec<u8>,
    },
    /// Remove a key if present.
    Delete {
        /// Record key.
        key: Vec<u8>,
    },
}

/// Contract the engine requires from a backing store.
///
/// Implementations must apply [`write_batch`](KvStore::write_batch)
/// atomically: either every operation in the batch lands or none do.
/// Operations apply in order, so an overwrite followed by a delete of the
/// same key leaves the key absent with the overwritten bytes gone.
pub trait KvStore: Send + Sync {
    /// Creates a sub-DB if it does not exist.
    fn create_db(&self, name: &str) -> StorageResult<()>;

    /// Returns `true` if the sub-DB exists.
    fn has_db(&self, name: &str) -> StorageResult<bool>;

    /// Reads one value.
    fn get(&self, db: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns every record in ascending key order.
    fn scan(&self, db: &str) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies a batch of mutations atomically, in order.
    fn write_batch(&self, db: &str, ops: Vec<BatchOp>) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn exercise(store: &dyn KvStore) {
        store.create_db("test").unwrap();
        assert!(store.has_db("test").unwrap());
        assert!(!store.has_db("absent").unwrap());
        assert!(store.get("test", b"k").unwrap().is_none());

        store
            .write_batch(
                "test",
                vec![
                    BatchOp::Put {
                        key: vec![0, 0, 0, 2],
                        value: b"two".to_vec(),
                    },
                    BatchOp::Put {
                        key: vec![0, 0, 0, 1],
                        value: b"one".to_vec(),
                    },
                    BatchOp::Put {
                        key: vec![0, 0, 1, 0],
                        value: b"256".to_vec(),
                    },
                ],
            )
            .unwrap();

        // Ascending byte order regardless of insertion order.
        let entries = store.scan("test").unwrap();
        assert_eq!(
            entries.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![vec![0, 0, 0, 1], vec![0, 0, 0, 2], vec![0, 0, 1, 0]]
        );

        // Overwrite then delete within one batch, applied in order.
        store
            .write_batch(
                "test",
                vec![
                    BatchOp::Put {
                        key: vec![0, 0, 0, 1],
                        value: b"overwritten".to_vec(),
                    },
                    BatchOp::Delete {
                        key: vec![0, 0, 0, 1],
                    },
                ],
            )
            .unwrap();
        assert!(store.get("test", &[0, 0, 0, 1]).unwrap().is_none());
        assert_eq!(store.get("test", &[0, 0, 0, 2]).unwrap().unwrap(), b"two");
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sqlite_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("contract.wallet")).unwrap();
        exercise(&store);
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.wallet");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_db("db").unwrap();
            store
                .write_batch(
                    "db",
                    vec![BatchOp::Put {
                        key: b"key".to_vec(),
                        value: b"value".to_vec(),
                    }],
                )
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("db", b"key").unwrap().unwrap(), b"value");
    }

    #[test]
    fn stores_are_shareable_across_threads() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.create_db("db").unwrap();
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .write_batch(
                            "db",
                            vec![BatchOp::Put {
                                key: vec![i],
                                value: vec![i],
                            }],
                        )
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.scan("db").unwrap().len(), 4);
    }
}
