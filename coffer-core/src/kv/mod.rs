//! Encrypted key-value engine.
//!
//! Layers per-record authenticated encryption and transactional access over
//! the backing store. See [`interface`] for the storage layout and
//! [`transaction`] for the concurrency contract.

pub mod ies;
mod interface;
mod transaction;

pub use interface::DbInterface;
pub use transaction::DbTransaction;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::buffer::SecureBytes;
    use crate::error::StorageError;
    use crate::store::{KvStore, MemoryStore};

    use super::*;

    fn fresh_db(salt: &[u8; 32], root: &[u8; 32]) -> (Arc<dyn KvStore>, Arc<DbInterface>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let db = DbInterface::new(Arc::clone(&store), "test", salt, root).unwrap();
        db.load_all_entries().unwrap();
        (store, db)
    }

    #[test]
    fn roundtrip_within_and_across_transactions() {
        let (_store, db) = fresh_db(&[1; 32], &[2; 32]);

        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k1", b"v1").unwrap();
            tx.insert(b"k2", b"v2").unwrap();
            assert_eq!(tx.get(b"k1").unwrap(), b"v1");
        }

        let tx = db.begin_transaction(false).unwrap();
        assert_eq!(tx.get(b"k1").unwrap(), b"v1");
        assert_eq!(tx.get(b"k2").unwrap(), b"v2");
        assert!(tx.get(b"k3").is_none());
        assert_eq!(db.entry_count(), 2);
    }

    #[test]
    fn same_transaction_upsert_writes_one_record() {
        let (store, db) = fresh_db(&[1; 32], &[2; 32]);

        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k", b"first").unwrap();
            tx.insert(b"k", b"second").unwrap();
            assert_eq!(tx.get(b"k").unwrap(), b"second");
        }

        // Cycle marker at counter 0 plus exactly one data record.
        assert_eq!(store.scan("test").unwrap().len(), 2);
        let tx = db.begin_transaction(false).unwrap();
        assert_eq!(tx.get(b"k").unwrap(), b"second");
    }

    #[test]
    fn replacement_retires_the_old_record() {
        let (store, db) = fresh_db(&[3; 32], &[4; 32]);

        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k", b"old").unwrap();
        }
        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k", b"new").unwrap();
        }

        // cycle(0), old slot gone, sentinel, new record.
        let raw = store.scan("test").unwrap();
        let counters: Vec<u32> = raw
            .iter()
            .map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(counters, vec![0, 2, 3]);

        let tx = db.begin_transaction(false).unwrap();
        assert_eq!(tx.get(b"k").unwrap(), b"new");
        assert_eq!(db.entry_count(), 1);
    }

    #[test]
    fn erase_hides_key_and_leaves_gap() {
        let (store, db) = fresh_db(&[5; 32], &[6; 32]);

        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"keep", b"a").unwrap();
            tx.insert(b"drop", b"b").unwrap();
        }
        {
            let tx = db.begin_transaction(true).unwrap();
            tx.erase(b"drop").unwrap();
            assert!(tx.get(b"drop").is_none());
            assert_eq!(tx.get(b"keep").unwrap(), b"a");
        }

        let tx = db.begin_transaction(false).unwrap();
        assert!(tx.get(b"drop").is_none());
        assert_eq!(db.entry_count(), 1);

        let counters: Vec<u32> = store
            .scan("test")
            .unwrap()
            .iter()
            .map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap()))
            .collect();
        // 0 cycle, 1 keep, gap at 2 (dropped record), 3 sentinel.
        assert_eq!(counters, vec![0, 1, 3]);
    }

    #[test]
    fn reload_resumes_after_rotation() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let salt = [7u8; 32];
        let root = [8u8; 32];

        {
            let db = DbInterface::new(Arc::clone(&store), "test", &salt, &root).unwrap();
            db.load_all_entries().unwrap();
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k1", b"v1").unwrap();
        }

        // Second session appends its own cycle marker before its data.
        let db = DbInterface::new(Arc::clone(&store), "test", &salt, &root).unwrap();
        db.load_all_entries().unwrap();
        assert_eq!(db.entry_count(), 1);
        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k2", b"v2").unwrap();
        }

        let db = DbInterface::new(Arc::clone(&store), "test", &salt, &root).unwrap();
        db.load_all_entries().unwrap();
        let tx = db.begin_transaction(false).unwrap();
        assert_eq!(tx.get(b"k1").unwrap(), b"v1");
        assert_eq!(tx.get(b"k2").unwrap(), b"v2");
    }

    #[test]
    fn wrong_root_fails_load_with_corrupt() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        {
            let db = DbInterface::new(Arc::clone(&store), "test", &[1; 32], &[2; 32]).unwrap();
            db.load_all_entries().unwrap();
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k", b"v").unwrap();
        }

        let db = DbInterface::new(Arc::clone(&store), "test", &[1; 32], &[3; 32]).unwrap();
        assert!(matches!(
            db.load_all_entries(),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn nested_write_shares_view_and_commits_once() {
        let (store, db) = fresh_db(&[9; 32], &[10; 32]);

        {
            let outer = db.begin_transaction(true).unwrap();
            outer.insert(b"outer", b"1").unwrap();
            {
                let inner = db.begin_transaction(true).unwrap();
                assert_eq!(inner.get(b"outer").unwrap(), b"1");
                inner.insert(b"inner", b"2").unwrap();
            }
            // Inner exit must not have committed anything.
            assert!(store.scan("test").unwrap().is_empty());
            assert_eq!(outer.get(b"inner").unwrap(), b"2");

            // A nested read under a writer yields the writer view.
            let nested_read = db.begin_transaction(false).unwrap();
            assert_eq!(nested_read.get(b"inner").unwrap(), b"2");
        }

        assert_eq!(db.entry_count(), 2);
    }

    #[test]
    fn read_conflicts_with_other_threads_writer() {
        let (_store, db) = fresh_db(&[11; 32], &[12; 32]);

        let tx = db.begin_transaction(true).unwrap();
        tx.insert(b"k", b"v").unwrap();

        let db2 = Arc::clone(&db);
        let handle = std::thread::spawn(move || {
            matches!(db2.begin_transaction(false), Err(StorageError::TxConflict))
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn write_under_read_on_same_thread_conflicts() {
        let (_store, db) = fresh_db(&[13; 32], &[14; 32]);

        let _reader = db.begin_transaction(false).unwrap();
        assert!(matches!(
            db.begin_transaction(true),
            Err(StorageError::TxConflict)
        ));
    }

    #[test]
    fn readers_keep_their_snapshot_across_commits() {
        let (_store, db) = fresh_db(&[15; 32], &[16; 32]);
        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"k", b"before").unwrap();
        }

        let reader = db.begin_transaction(false).unwrap();
        assert_eq!(reader.get(b"k").unwrap(), b"before");

        let db2 = Arc::clone(&db);
        std::thread::spawn(move || {
            let tx = db2.begin_transaction(true).unwrap();
            tx.insert(b"k", b"after").unwrap();
        })
        .join()
        .unwrap();

        // The live reader still sees its snapshot.
        assert_eq!(reader.get(b"k").unwrap(), b"before");
        drop(reader);

        let fresh = db.begin_transaction(false).unwrap();
        assert_eq!(fresh.get(b"k").unwrap(), b"after");
    }

    #[test]
    fn blocked_writer_proceeds_after_release() {
        let (_store, db) = fresh_db(&[17; 32], &[18; 32]);

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let db_writer = Arc::clone(&db);
        let holder = std::thread::spawn(move || {
            let tx = db_writer.begin_transaction(true).unwrap();
            tx.insert(b"first", b"1").unwrap();
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        started_rx.recv().unwrap();

        let db_blocked = Arc::clone(&db);
        let blocked = std::thread::spawn(move || {
            let tx = db_blocked.begin_transaction(true).unwrap();
            // The first writer committed before this one acquired the gate.
            assert_eq!(tx.get(b"first").unwrap(), b"1");
            tx.insert(b"second", b"2").unwrap();
        });

        // Give the second writer time to park, then release the first.
        std::thread::sleep(std::time::Duration::from_millis(50));
        release_tx.send(()).unwrap();
        holder.join().unwrap();
        blocked.join().unwrap();

        let tx = db.begin_transaction(false).unwrap();
        assert_eq!(tx.get(b"first").unwrap(), b"1");
        assert_eq!(tx.get(b"second").unwrap(), b"2");
    }

    #[test]
    fn entries_iterate_in_insertion_order() {
        let (_store, db) = fresh_db(&[19; 32], &[20; 32]);
        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"zz", b"1").unwrap();
            tx.insert(b"aa", b"2").unwrap();
            tx.insert(b"mm", b"3").unwrap();
        }
        let tx = db.begin_transaction(false).unwrap();
        let keys: Vec<Vec<u8>> = tx.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"zz".to_vec(), b"aa".to_vec(), b"mm".to_vec()]);
    }

    #[test]
    fn secure_bytes_root_material_never_hits_store() {
        // The raw control root must not appear in any stored record.
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let root = SecureBytes::random(32);
        let db = DbInterface::new(Arc::clone(&store), "test", &[21; 32], &root).unwrap();
        db.load_all_entries().unwrap();
        {
            let tx = db.begin_transaction(true).unwrap();
            tx.insert(b"needle-key", b"needle-value").unwrap();
        }
        for (_, packet) in store.scan("test").unwrap() {
            assert!(!contains(&packet, b"needle-key"));
            assert!(!contains(&packet, b"needle-value"));
            assert!(!contains(&packet, &root));
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
