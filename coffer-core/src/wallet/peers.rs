//! Authorized-peers store.
//!
//! An ordered map of peer names — IPv4/IPv6 literals or DNS-style
//! hostnames — to one compressed public key each, plus the inverse key set.
//! Persisted in its own sub-DB of a dedicated backing file; an ephemeral
//! variant keeps everything in memory for one-shot identities.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::buffer::SecureBytes;
use crate::container::PassphraseProvider;
use crate::crypto::ecc;
use crate::db::header::{unwrap_value, wrap_value, WalletHeader, WalletHeaderKind, PEER_PREFIX};
use crate::db::{prefixed_key, WalletDbInterface};
use crate::error::{StorageError, WalletResult};
use crate::kdf::KdfRomix;
use crate::store::SqliteStore;

const PEERS_DB_NAME: &str = "peers";

/// Name-to-key registry of authorized peers.
pub struct AuthorizedPeers {
    iface: Option<Arc<WalletDbInterface>>,
    peers: Mutex<BTreeMap<String, [u8; 33]>>,
}

impl AuthorizedPeers {
    /// Opens (or creates) a peers file under `home_dir`.
    pub fn new(
        home_dir: &Path,
        filename: &str,
        provider: &PassphraseProvider,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Self> {
        let store = Arc::new(SqliteStore::open(home_dir.join(filename))?);
        let iface = WalletDbInterface::setup_env(store, provider, kdf)?;

        if iface.wallet_header(PEERS_DB_NAME).is_none() {
            let header = WalletHeader {
                kind: WalletHeaderKind::Custom,
                db_name: PEERS_DB_NAME.to_string(),
                control_salt: SecureBytes::default(),
                default_kdf_id: Vec::new(),
                master_key_id: Vec::new(),
                default_key: SecureBytes::default(),
                db_count: 0,
            };
            iface.lock_control_container(provider)?;
            let result = iface.add_header(header);
            iface.unlock_control_container();
            result?;
        }

        let mut peers = BTreeMap::new();
        {
            let tx = iface.begin_read_transaction(PEERS_DB_NAME)?;
            for (key, value) in tx.entries() {
                if key.first() != Some(&PEER_PREFIX) {
                    continue;
                }
                let name = String::from_utf8(key[1..].to_vec())
                    .map_err(|_| StorageError::corrupt("peer name is not utf-8"))?;
                let pub_key: [u8; 33] = unwrap_value(&value)?
                    .try_into()
                    .map_err(|_| StorageError::corrupt("peer public key length"))?;
                peers.insert(name, pub_key);
            }
        }

        Ok(Self {
            iface: Some(iface),
            peers: Mutex::new(peers),
        })
    }

    /// Creates an in-memory store with no persistence.
    #[must_use]
    pub fn new_ephemeral() -> Self {
        Self {
            iface: None,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    fn persist(&self, name: &str, pub_key: Option<&[u8; 33]>) -> WalletResult<()> {
        let Some(iface) = &self.iface else {
            return Ok(());
        };
        let tx = iface.begin_write_transaction(PEERS_DB_NAME)?;
        let key = prefixed_key(PEER_PREFIX, name.as_bytes());
        match pub_key {
            Some(pub_key) => tx.insert(&key, &wrap_value(pub_key))?,
            None => tx.erase(&key)?,
        }
        Ok(())
    }

    /// Registers a peer key under each provided name. The key may be
    /// compressed or uncompressed; it is stored compressed.
    pub fn add_peer(&self, pub_key: &[u8], names: &[&str]) -> WalletResult<()> {
        let compressed = ecc::compress_point(pub_key)?;
        for name in names {
            self.persist(name, Some(&compressed))?;
            self.peers
                .lock()
                .expect("peer map poisoned")
                .insert((*name).to_string(), compressed);
        }
        Ok(())
    }

    /// Removes one name. The key disappears from the key set when its last
    /// name goes.
    pub fn erase_name(&self, name: &str) -> WalletResult<()> {
        self.persist(name, None)?;
        self.peers.lock().expect("peer map poisoned").remove(name);
        Ok(())
    }

    /// Removes every name pointing at a key.
    pub fn erase_peer(&self, pub_key: &[u8]) -> WalletResult<()> {
        let compressed = ecc::compress_point(pub_key)?;
        let names: Vec<String> = {
            let peers = self.peers.lock().expect("peer map poisoned");
            peers
                .iter()
                .filter(|(_, key)| **key == compressed)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            self.erase_name(&name)?;
        }
        Ok(())
    }

    /// Name-to-key map.
    #[must_use]
    pub fn get_peer_name_map(&self) -> BTreeMap<String, [u8; 33]> {
        self.peers.lock().expect("peer map poisoned").clone()
    }

    /// The set of registered public keys.
    #[must_use]
    pub fn get_public_key_set(&self) -> BTreeSet<[u8; 33]> {
        self.peers
            .lock()
            .expect("peer map poisoned")
            .values()
            .copied()
            .collect()
    }
}

impl std::fmt::Debug for AuthorizedPeers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.lock().expect("peer map poisoned");
        f.debug_struct("AuthorizedPeers")
            .field("names", &peers.len())
            .field("ephemeral", &self.iface.is_none())
            .finish()
    }
}
