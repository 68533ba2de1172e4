//! Wallet-DB interface: headers, the control sub-DB, and the multi-sub-DB
//! envelope over one backing file.

pub mod header;
mod interface;

pub use interface::{encrypt_raw, prefixed_key, WalletDbInterface};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::buffer::SecureBytes;
    use crate::container::{fixed_passphrase, PassphraseProvider};
    use crate::error::{ContainerError, StorageError, WalletError};
    use crate::kdf::KdfRomix;
    use crate::store::{KvStore, MemoryStore};

    use super::header::{WalletHeader, WalletHeaderKind};
    use super::WalletDbInterface;

    fn test_kdf() -> KdfRomix {
        KdfRomix::new(4096, 1, SecureBytes::random(32)).unwrap()
    }

    fn custom_header(name: &str) -> WalletHeader {
        WalletHeader {
            kind: WalletHeaderKind::Custom,
            db_name: name.to_string(),
            control_salt: SecureBytes::default(),
            default_kdf_id: Vec::new(),
            master_key_id: Vec::new(),
            default_key: SecureBytes::default(),
            db_count: 0,
        }
    }

    fn pass(bytes: &[u8]) -> PassphraseProvider {
        fixed_passphrase(SecureBytes::from_slice(bytes))
    }

    #[test]
    fn setup_and_reopen_with_passphrase() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        {
            let iface =
                WalletDbInterface::setup_env(Arc::clone(&store), &pass(b"abcd"), Some(test_kdf()))
                    .unwrap();
            iface.shutdown().unwrap();
        }

        // Wrong (empty) passphrase fails.
        let give_up: PassphraseProvider = Arc::new(|_| SecureBytes::default());
        match WalletDbInterface::setup_env(Arc::clone(&store), &give_up, None) {
            Err(WalletError::Container(ContainerError::EmptyPassphrase)) => {}
            other => panic!("expected EmptyPassphrase, got {other:?}"),
        }

        // Correct passphrase opens.
        WalletDbInterface::setup_env(Arc::clone(&store), &pass(b"abcd"), None).unwrap();
    }

    #[test]
    fn unencrypted_env_never_invokes_provider_on_open() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        {
            let empty: PassphraseProvider = Arc::new(|_| SecureBytes::default());
            WalletDbInterface::setup_env(Arc::clone(&store), &empty, Some(test_kdf())).unwrap();
        }

        let must_not_run: PassphraseProvider =
            Arc::new(|_| panic!("provider must not be invoked"));
        WalletDbInterface::setup_env(store, &must_not_run, None).unwrap();
    }

    #[test]
    fn add_header_requires_control_lock_and_db_count() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let iface =
            WalletDbInterface::setup_env(store, &pass(b"abcd"), Some(test_kdf())).unwrap();

        // Unlocked control container refuses registration.
        assert!(matches!(
            iface.add_header(custom_header("db1")),
            Err(WalletError::Container(ContainerError::NotLocked))
        ));

        iface.lock_control_container(&pass(b"abcd")).unwrap();
        iface.add_header(custom_header("db1")).unwrap();
        iface.unlock_control_container();
        assert_eq!(iface.db_count(), 1);

        // A second header exceeds the declared count of 1.
        iface.lock_control_container(&pass(b"abcd")).unwrap();
        assert!(matches!(
            iface.add_header(custom_header("db2")),
            Err(WalletError::Storage(StorageError::DbCountTooLow))
        ));
        iface.unlock_control_container();

        iface.set_db_count(2).unwrap();
        iface.lock_control_container(&pass(b"abcd")).unwrap();
        iface.add_header(custom_header("db2")).unwrap();

        // Duplicate names are rejected.
        assert!(matches!(
            iface.add_header(custom_header("db2")),
            Err(WalletError::Storage(StorageError::HeaderExists(_)))
        ));
        iface.unlock_control_container();
        assert_eq!(iface.db_count(), 2);
    }

    #[test]
    fn sub_db_roundtrip_across_reopen() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        {
            let iface = WalletDbInterface::setup_env(
                Arc::clone(&store),
                &pass(b"abcd"),
                Some(test_kdf()),
            )
            .unwrap();
            iface.lock_control_container(&pass(b"abcd")).unwrap();
            iface.add_header(custom_header("db1")).unwrap();
            iface.unlock_control_container();

            let tx = iface.begin_write_transaction("db1").unwrap();
            tx.insert(b"key", b"value").unwrap();
            drop(tx);
            iface.shutdown().unwrap();
        }

        let iface = WalletDbInterface::setup_env(store, &pass(b"abcd"), None).unwrap();
        assert_eq!(iface.db_count(), 1);
        let tx = iface.begin_read_transaction("db1").unwrap();
        assert_eq!(tx.get(b"key").unwrap(), b"value");
    }

    #[test]
    fn live_transactions_block_db_count_and_shutdown() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let iface =
            WalletDbInterface::setup_env(store, &pass(b"abcd"), Some(test_kdf())).unwrap();
        iface.lock_control_container(&pass(b"abcd")).unwrap();
        iface.add_header(custom_header("db1")).unwrap();
        iface.unlock_control_container();

        {
            let _tx = iface.begin_read_transaction("db1").unwrap();
            assert!(matches!(
                iface.set_db_count(5),
                Err(WalletError::Storage(StorageError::LiveTransactions(_)))
            ));
            assert!(matches!(
                iface.shutdown(),
                Err(WalletError::Storage(StorageError::LiveTransactions(_)))
            ));
        }

        iface.set_db_count(5).unwrap();
        // Declared count grows; registered count does not.
        assert_eq!(iface.db_count(), 1);
        iface.shutdown().unwrap();
    }

    #[test]
    fn unknown_and_shutdown_names_are_invalid() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let iface =
            WalletDbInterface::setup_env(store, &pass(b"abcd"), Some(test_kdf())).unwrap();

        assert!(matches!(
            iface.begin_read_transaction("nope"),
            Err(WalletError::Storage(StorageError::InvalidDbName(_)))
        ));

        iface.shutdown().unwrap();
        assert!(matches!(
            iface.begin_read_transaction("db1"),
            Err(WalletError::Storage(StorageError::InvalidDbName(_)))
        ));
    }

    #[test]
    fn main_wallet_designation_roundtrip() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        {
            let iface = WalletDbInterface::setup_env(
                Arc::clone(&store),
                &pass(b"ctl"),
                Some(test_kdf()),
            )
            .unwrap();
            assert_eq!(iface.main_wallet().unwrap(), None);
            iface.set_main_wallet("wallet-id").unwrap();
            iface.shutdown().unwrap();
        }
        let iface = WalletDbInterface::setup_env(store, &pass(b"ctl"), None).unwrap();
        assert_eq!(iface.main_wallet().unwrap().as_deref(), Some("wallet-id"));
    }
}
