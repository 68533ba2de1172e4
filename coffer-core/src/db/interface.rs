//! Multi-sub-DB wallet envelope.
//!
//! A [`WalletDbInterface`] owns one backing store holding the distinguished
//! `"control"` sub-DB, the IES-encrypted header registry, and one sub-DB per
//! declared wallet.
//!
//! The control sub-DB stores plaintext-keyed records — the control header,
//! KDF parameters, the control master key, and the encrypted seed whose
//! plaintext is the `control_root`. Their secret payloads are KDF+AES
//! protected; everything else in the file sits behind the IES envelope
//! seeded by that root, so no wallet identifier or payload is recoverable
//! without the control passphrase.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::SecureBytes;
use crate::container::{ContainerLock, DecryptedDataContainer, PassphraseProvider};
use crate::error::{ContainerError, StorageError, WalletError, WalletResult};
use crate::kdf::{KdfRomix, DEFAULT_KDF_MAX_MEMORY, DEFAULT_KDF_TARGET_SEC};
use crate::kv::{DbInterface, DbTransaction};
use crate::secrets::{CipherData, EncryptedData, MasterKey};
use crate::store::{BatchOp, KvStore};

use super::header::{
    u32_key, unwrap_value, wrap_value, WalletHeader, WalletHeaderKind, CONTROL_DB_NAME,
    HEADERS_DB_NAME, KDF_PREFIX, MAINWALLET_KEY, MASTERKEY_PREFIX, WALLETHEADER_PREFIX,
    WALLET_SEED_KEY,
};

struct IfaceState {
    dbs: HashMap<String, Arc<DbInterface>>,
    headers_db: Option<Arc<DbInterface>>,
    headers: HashMap<String, WalletHeader>,
    container: Option<Arc<DecryptedDataContainer>>,
    control_root: Option<SecureBytes>,
    control_lock: Option<ContainerLock>,
    declared_db_count: u32,
    open: bool,
}

/// Interface over one wallet file.
pub struct WalletDbInterface {
    store: Arc<dyn KvStore>,
    state: Mutex<IfaceState>,
}

impl WalletDbInterface {
    /// Opens the wallet environment in `store`, creating the control
    /// structures on first use.
    ///
    /// `provider` supplies the control passphrase; an empty return on
    /// creation makes an unencrypted control layer, and an unencrypted
    /// layer never invokes the provider on open. `kdf` overrides the
    /// default calibrated KDF parameters at creation time.
    pub fn setup_env(
        store: Arc<dyn KvStore>,
        provider: &PassphraseProvider,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        if !store.has_db(CONTROL_DB_NAME)? {
            Self::create_control(&store, provider, kdf)?;
        }
        let iface = Arc::new(Self {
            store,
            state: Mutex::new(IfaceState {
                dbs: HashMap::new(),
                headers_db: None,
                headers: HashMap::new(),
                container: None,
                control_root: None,
                control_lock: None,
                declared_db_count: 1,
                open: false,
            }),
        });
        iface.open_env(provider)?;
        Ok(iface)
    }

    /// Writes the control sub-DB of a fresh wallet file.
    fn create_control(
        store: &Arc<dyn KvStore>,
        provider: &PassphraseProvider,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<()> {
        let kdf = match kdf {
            Some(kdf) => kdf,
            None => KdfRomix::calibrate(DEFAULT_KDF_TARGET_SEC, DEFAULT_KDF_MAX_MEMORY)?,
        };
        store.create_db(CONTROL_DB_NAME)?;

        let default_key = SecureBytes::random(32);
        let staging = DecryptedDataContainer::new(
            Vec::new(),
            default_key.clone(),
            kdf.kdf_id().to_vec(),
        );
        staging.register_kdf(kdf.clone());

        let mut ids = std::collections::BTreeSet::new();
        ids.insert(CONTROL_DB_NAME.as_bytes().to_vec());
        let passphrase = (provider.as_ref())(&ids);
        let (master, master_plain, slot_kdf) =
            staging.create_master_key(&passphrase).map_err(WalletError::Container)?;

        let control_root = SecureBytes::random(32);
        let seed = encrypt_raw(&master_plain, &master.id, &control_root)?;

        let header = WalletHeader {
            kind: WalletHeaderKind::Control,
            db_name: CONTROL_DB_NAME.to_string(),
            control_salt: SecureBytes::random(32),
            default_kdf_id: kdf.kdf_id().to_vec(),
            master_key_id: master.id.clone(),
            default_key,
            db_count: 1,
        };

        let mut batch = vec![
            BatchOp::Put {
                key: WalletHeader::db_key(CONTROL_DB_NAME),
                value: wrap_value(&header.serialize()),
            },
            BatchOp::Put {
                key: prefixed_key(KDF_PREFIX, kdf.kdf_id()),
                value: wrap_value(&kdf.serialize()),
            },
            BatchOp::Put {
                key: prefixed_key(MASTERKEY_PREFIX, &master.id),
                value: wrap_value(&master.serialize()),
            },
            BatchOp::Put {
                key: u32_key(WALLET_SEED_KEY),
                value: wrap_value(&seed.serialize()),
            },
        ];
        if let Some(slot_kdf) = slot_kdf {
            batch.push(BatchOp::Put {
                key: prefixed_key(KDF_PREFIX, slot_kdf.kdf_id()),
                value: wrap_value(&slot_kdf.serialize()),
            });
        }
        store.write_batch(CONTROL_DB_NAME, batch)?;
        tracing::debug!("created control sub-db");
        Ok(())
    }

    /// Opens the control layer, recovers the control root, and loads the
    /// header registry plus every declared sub-DB.
    fn open_env(self: &Arc<Self>, provider: &PassphraseProvider) -> WalletResult<()> {
        let header_raw = self
            .store
            .get(CONTROL_DB_NAME, &WalletHeader::db_key(CONTROL_DB_NAME))?
            .ok_or_else(|| StorageError::corrupt("missing control header"))?;
        let control_header = WalletHeader::deserialize(&unwrap_value(&header_raw)?)?;

        let container = Arc::new(DecryptedDataContainer::new(
            control_header.master_key_id.clone(),
            control_header.default_key.clone(),
            control_header.default_kdf_id.clone(),
        ));
        container.set_passphrase_provider(provider.clone());

        for (key, value) in self.store.scan(CONTROL_DB_NAME)? {
            match key.first() {
                Some(&KDF_PREFIX) => {
                    container.register_kdf(KdfRomix::deserialize(&unwrap_value(&value)?)?);
                }
                Some(&MASTERKEY_PREFIX) => {
                    container.register_master_key(MasterKey::deserialize(&unwrap_value(
                        &value,
                    )?)?);
                }
                _ => {}
            }
        }

        let seed_raw = self
            .store
            .get(CONTROL_DB_NAME, &u32_key(WALLET_SEED_KEY))?
            .ok_or_else(|| StorageError::corrupt("missing control seed"))?;
        let seed = EncryptedData::deserialize(&unwrap_value(&seed_raw)?)?;

        let control_root = {
            let guard = container.lock();
            let root = container
                .get_decrypted_value(&seed)
                .map_err(WalletError::Container)?;
            drop(guard);
            root
        };

        let headers_db = DbInterface::new(
            Arc::clone(&self.store),
            HEADERS_DB_NAME,
            &control_header.control_salt,
            &control_root,
        )?;
        headers_db.load_all_entries()?;

        let mut headers = HashMap::new();
        let mut dbs = HashMap::new();
        {
            let tx = headers_db.begin_transaction(false)?;
            for (key, value) in tx.entries() {
                if key.first() != Some(&WALLETHEADER_PREFIX) {
                    continue;
                }
                let header = WalletHeader::deserialize(&unwrap_value(&value)?)?;
                let db = DbInterface::new(
                    Arc::clone(&self.store),
                    &header.db_name,
                    &header.control_salt,
                    &control_root,
                )?;
                db.load_all_entries()?;
                dbs.insert(header.db_name.clone(), db);
                headers.insert(header.db_name.clone(), header);
            }
        }

        tracing::debug!(wallets = headers.len(), "opened wallet environment");

        let mut state = self.lock_state();
        state.declared_db_count = control_header.db_count.max(headers.len() as u32).max(1);
        state.dbs = dbs;
        state.headers = headers;
        state.headers_db = Some(headers_db);
        state.container = Some(container);
        state.control_root = Some(control_root);
        state.open = true;
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, IfaceState> {
        self.state.lock().expect("interface state poisoned")
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    /// Number of registered data sub-DBs.
    #[must_use]
    pub fn db_count(&self) -> usize {
        self.lock_state().headers.len()
    }

    /// Names of the registered data sub-DBs.
    #[must_use]
    pub fn db_names(&self) -> Vec<String> {
        self.lock_state().headers.keys().cloned().collect()
    }

    /// Returns a clone of the header registered under `name`.
    #[must_use]
    pub fn wallet_header(&self, name: &str) -> Option<WalletHeader> {
        self.lock_state().headers.get(name).cloned()
    }

    /// Returns `true` while any transaction is live on any sub-DB.
    #[must_use]
    pub fn has_live_transactions(&self) -> bool {
        let state = self.lock_state();
        state
            .dbs
            .values()
            .chain(state.headers_db.as_ref())
            .any(|db| db.has_live_transactions())
    }

    /// Grows the declared sub-DB count. The count never shrinks below the
    /// number of registered headers.
    pub fn set_db_count(&self, count: u32) -> WalletResult<()> {
        if self.has_live_transactions() {
            return Err(StorageError::LiveTransactions("change dbCount").into());
        }
        let mut state = self.lock_state();
        if !state.open {
            return Err(StorageError::InvalidDbName("environment is shut down".into()).into());
        }
        if (count as usize) < state.headers.len() {
            return Err(StorageError::DbCountTooLow.into());
        }
        state.declared_db_count = count;
        drop(state);
        self.persist_control_db_count(count)?;
        Ok(())
    }

    fn persist_control_db_count(&self, count: u32) -> WalletResult<()> {
        let header_raw = self
            .store
            .get(CONTROL_DB_NAME, &WalletHeader::db_key(CONTROL_DB_NAME))?
            .ok_or_else(|| StorageError::corrupt("missing control header"))?;
        let mut control_header = WalletHeader::deserialize(&unwrap_value(&header_raw)?)?;
        control_header.db_count = count;
        self.store.write_batch(
            CONTROL_DB_NAME,
            vec![BatchOp::Put {
                key: WalletHeader::db_key(CONTROL_DB_NAME),
                value: wrap_value(&control_header.serialize()),
            }],
        )?;
        Ok(())
    }

    /// Locks the control container with a fresh provider, keeping the guard
    /// until [`unlock_control_container`](Self::unlock_control_container).
    pub fn lock_control_container(&self, provider: &PassphraseProvider) -> WalletResult<()> {
        let container = {
            let state = self.lock_state();
            state
                .container
                .clone()
                .ok_or_else(|| StorageError::InvalidDbName("environment is shut down".into()))?
        };
        container.set_passphrase_provider(provider.clone());
        let guard = container.lock();
        self.lock_state().control_lock = Some(guard);
        Ok(())
    }

    /// Releases the control-container guard.
    pub fn unlock_control_container(&self) {
        self.lock_state().control_lock.take();
    }

    /// Registers a new data sub-DB under a fresh control salt.
    ///
    /// Requires the control container to be locked. The stored header (with
    /// the generated salt) is returned.
    pub fn add_header(&self, mut header: WalletHeader) -> WalletResult<WalletHeader> {
        let (headers_db, control_root) = {
            let state = self.lock_state();
            if state.control_lock.is_none() {
                return Err(ContainerError::NotLocked.into());
            }
            if state.headers.contains_key(&header.db_name) {
                return Err(StorageError::HeaderExists(header.db_name.clone()).into());
            }
            if state.headers.len() + 1 > state.declared_db_count as usize {
                return Err(StorageError::DbCountTooLow.into());
            }
            (
                state
                    .headers_db
                    .clone()
                    .ok_or_else(|| StorageError::corrupt("header registry not loaded"))?,
                state
                    .control_root
                    .clone()
                    .ok_or_else(|| StorageError::corrupt("control root not decrypted"))?,
            )
        };

        header.control_salt = SecureBytes::random(32);
        if header.default_key.is_empty() {
            header.default_key = SecureBytes::random(32);
        }

        {
            let tx = headers_db.begin_transaction(true)?;
            tx.insert(
                &WalletHeader::db_key(&header.db_name),
                &wrap_value(&header.serialize()),
            )?;
        }

        let db = DbInterface::new(
            Arc::clone(&self.store),
            &header.db_name,
            &header.control_salt,
            &control_root,
        )?;
        db.load_all_entries()?;

        let mut state = self.lock_state();
        state.dbs.insert(header.db_name.clone(), db);
        state.headers.insert(header.db_name.clone(), header.clone());
        tracing::debug!(db = %header.db_name, "registered sub-db header");
        Ok(header)
    }

    fn db(&self, name: &str) -> WalletResult<Arc<DbInterface>> {
        let state = self.lock_state();
        if !state.open {
            return Err(StorageError::InvalidDbName(name.to_string()).into());
        }
        state
            .dbs
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::InvalidDbName(name.to_string()).into())
    }

    /// Opens a read transaction on a data sub-DB.
    pub fn begin_read_transaction(&self, name: &str) -> WalletResult<DbTransaction> {
        Ok(self.db(name)?.begin_transaction(false)?)
    }

    /// Opens a write transaction on a data sub-DB.
    pub fn begin_write_transaction(&self, name: &str) -> WalletResult<DbTransaction> {
        Ok(self.db(name)?.begin_transaction(true)?)
    }

    /// Records the main wallet designation in the header registry.
    pub fn set_main_wallet(&self, name: &str) -> WalletResult<()> {
        let headers_db = self
            .lock_state()
            .headers_db
            .clone()
            .ok_or_else(|| StorageError::corrupt("header registry not loaded"))?;
        let tx = headers_db.begin_transaction(true)?;
        tx.insert(&u32_key(MAINWALLET_KEY), &wrap_value(name.as_bytes()))?;
        Ok(())
    }

    /// Reads the main wallet designation.
    pub fn main_wallet(&self) -> WalletResult<Option<String>> {
        let headers_db = self
            .lock_state()
            .headers_db
            .clone()
            .ok_or_else(|| StorageError::corrupt("header registry not loaded"))?;
        let tx = headers_db.begin_transaction(false)?;
        match tx.get(&u32_key(MAINWALLET_KEY)) {
            Some(value) => {
                let name = String::from_utf8(unwrap_value(&value)?)
                    .map_err(|_| StorageError::corrupt("main wallet name is not utf-8"))?;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    /// The control container.
    pub fn control_container(&self) -> WalletResult<Arc<DecryptedDataContainer>> {
        self.lock_state()
            .container
            .clone()
            .ok_or_else(|| StorageError::InvalidDbName("environment is shut down".into()).into())
    }

    /// Closes the environment. Fails while any transaction is live.
    pub fn shutdown(&self) -> WalletResult<()> {
        if self.has_live_transactions() {
            return Err(StorageError::LiveTransactions("shutdown env").into());
        }
        let mut state = self.lock_state();
        state.control_lock.take();
        state.dbs.clear();
        state.headers.clear();
        state.headers_db = None;
        state.container = None;
        state.control_root = None;
        state.open = false;
        tracing::debug!("wallet environment shut down");
        Ok(())
    }
}

impl std::fmt::Debug for WalletDbInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("WalletDbInterface")
            .field("open", &state.open)
            .field("db_count", &state.headers.len())
            .finish_non_exhaustive()
    }
}

/// Builds a prefixed record key.
#[must_use]
pub fn prefixed_key(prefix: u8, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + suffix.len());
    key.push(prefix);
    key.extend_from_slice(suffix);
    key
}

/// Encrypts a payload directly under a raw key (used for the control seed,
/// whose master key is in hand at creation time).
pub fn encrypt_raw(
    key: &SecureBytes,
    key_id: &[u8],
    plaintext: &[u8],
) -> WalletResult<EncryptedData> {
    let iv = SecureBytes::random(crate::crypto::cipher::AES_IV_LEN);
    let cipher_text = crate::crypto::cipher::aes_cbc_encrypt(key, &iv, plaintext)?;
    Ok(EncryptedData {
        cipher_data: CipherData {
            iv,
            cipher_text: SecureBytes::new(cipher_text),
            kdf_id: Vec::new(),
            encryption_key_id: key_id.to_vec(),
        },
    })
}
