//! Wallet façade.
//!
//! [`AssetWallet`] ties the layers together: one sub-DB of a wallet file,
//! its decrypted-data container, and its accounts. Creators cover the
//! supported shapes (BIP32 from seed, Armory135 from private or public
//! root, blank BIP32, seedless watch-only); [`AssetWallet::fork_watching_only`]
//! produces a second file with all private material stripped.

mod manager;
mod peers;

pub use manager::{WalletContainer, WalletManager};
pub use peers::AuthorizedPeers;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::address::{AddressEntry, AddressType};
use crate::assets::derivation::{armory135, Bip32Node};
use crate::assets::{AccountId, AccountKind, AssetAccount, AssetBip32Root, AssetEntry, AssetId, AssetSingle};
use crate::buffer::SecureBytes;
use crate::container::{fixed_passphrase, ContainerLock, DecryptedDataContainer, PassphraseProvider};
use crate::crypto::ecc;
use crate::crypto::hashes::hash256;
use crate::db::header::{
    u32_key, unwrap_value, wrap_value, WalletHeader, WalletHeaderKind, ACCOUNT_PREFIX,
    ASSET_PREFIX, COMMENT_PREFIX, KDF_PREFIX, MAIN_ACCOUNT_KEY, MASTERKEY_PREFIX,
    WALLET_SEED_KEY,
};
use crate::db::{prefixed_key, WalletDbInterface};
use crate::error::{AssetError, StorageError, WalletError, WalletResult};
use crate::kdf::KdfRomix;
use crate::kv::DbTransaction;
use crate::secrets::{EncryptedData, MasterKey};
use crate::store::SqliteStore;

/// Derives a wallet id from public root material.
fn wallet_id_from_pub(pub_key: &[u8]) -> String {
    bs58::encode(&hash256(pub_key)[..6]).into_string()
}

/// A loaded wallet bound to one sub-DB of a wallet file.
pub struct AssetWallet {
    iface: Arc<WalletDbInterface>,
    path: PathBuf,
    db_name: String,
    container: Arc<DecryptedDataContainer>,
    accounts: Mutex<BTreeMap<AccountId, AssetAccount>>,
    main_account: Mutex<Option<AccountId>>,
    encrypted_seed: Mutex<Option<EncryptedData>>,
}

/// Parameters for creating a BIP32 (optionally salted) account.
#[derive(Clone)]
pub struct AccountTypeBip32 {
    /// Derivation path of the account root under the seed.
    pub derivation_path: Vec<u32>,
    /// Point-multiplication salt for salted accounts.
    pub salt: Option<SecureBytes>,
    /// Lookahead window size.
    pub lookup: u32,
    /// Address types the account may issue.
    pub address_types: BTreeSet<AddressType>,
    /// Default address type.
    pub default_type: AddressType,
    /// Make this the wallet's main account.
    pub main: bool,
}

/// Parameters for creating an ECDH account.
#[derive(Clone)]
pub struct AccountTypeEcdh {
    /// Static private key.
    pub priv_key: SecureBytes,
    /// Static public key (any encoding).
    pub pub_key: Vec<u8>,
    /// Address types the account may issue.
    pub address_types: BTreeSet<AddressType>,
    /// Default address type.
    pub default_type: AddressType,
    /// Make this the wallet's main account.
    pub main: bool,
}

impl AssetWallet {
    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Creates a wallet from a BIP32 seed with one account at
    /// `derivation_path`.
    pub fn create_from_seed_bip32(
        home_dir: &Path,
        seed: &SecureBytes,
        derivation_path: &[u32],
        priv_passphrase: SecureBytes,
        control_passphrase: SecureBytes,
        lookup: u32,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        let wallet = Self::create_from_seed_bip32_blank(
            home_dir,
            seed,
            priv_passphrase.clone(),
            control_passphrase,
            kdf,
        )?;

        let spec = AccountTypeBip32 {
            derivation_path: derivation_path.to_vec(),
            salt: None,
            lookup,
            address_types: BTreeSet::from([
                AddressType::P2pkh,
                AddressType::P2wpkh,
                AddressType::NestedP2wpkh,
            ]),
            default_type: AddressType::P2wpkh,
            main: true,
        };
        wallet.set_passphrase_prompt(fixed_passphrase(priv_passphrase));
        wallet.create_bip32_account(&spec)?;
        wallet.reset_passphrase_prompt();
        Ok(wallet)
    }

    /// Creates a wallet holding an encrypted seed and no accounts.
    pub fn create_from_seed_bip32_blank(
        home_dir: &Path,
        seed: &SecureBytes,
        priv_passphrase: SecureBytes,
        control_passphrase: SecureBytes,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        let master_node = Bip32Node::init_from_seed(seed)?;
        let wallet_id = wallet_id_from_pub(master_node.public_key());

        let wallet = Self::create_shell(
            &home_dir.join(format!("{wallet_id}.wallet")),
            &wallet_id,
            &priv_passphrase,
            &fixed_passphrase(control_passphrase),
            kdf,
        )?;

        // Store the encrypted seed.
        wallet.set_passphrase_prompt(fixed_passphrase(priv_passphrase));
        {
            let guard = wallet.container.lock();
            let seed_enc = wallet.container.encrypt_under_master(seed)?;
            let tx = wallet.iface.begin_write_transaction(&wallet.db_name)?;
            tx.insert(&u32_key(WALLET_SEED_KEY), &wrap_value(&seed_enc.serialize()))?;
            drop(tx);
            *wallet.encrypted_seed.lock().expect("wallet state poisoned") = Some(seed_enc);
            drop(guard);
        }
        wallet.reset_passphrase_prompt();
        Ok(wallet)
    }

    /// Creates an Armory 1.35 wallet from a private root.
    pub fn create_from_private_root_armory135(
        home_dir: &Path,
        root: SecureBytes,
        priv_passphrase: SecureBytes,
        control_passphrase: SecureBytes,
        lookup: u32,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        let root_pub = ecc::compute_public_key(&root, false)?;
        let chaincode = armory135::compute_chaincode(&root);
        let wallet_id = wallet_id_from_pub(&root_pub);

        let wallet = Self::create_shell(
            &home_dir.join(format!("{wallet_id}.wallet")),
            &wallet_id,
            &priv_passphrase,
            &fixed_passphrase(control_passphrase),
            kdf,
        )?;

        wallet.set_passphrase_prompt(fixed_passphrase(priv_passphrase));
        {
            let guard = wallet.container.lock();
            let seed_enc = wallet.container.encrypt_under_master(&root)?;
            let root_enc = wallet.container.encrypt_under_master(&root)?;
            {
                let tx = wallet.iface.begin_write_transaction(&wallet.db_name)?;
                tx.insert(&u32_key(WALLET_SEED_KEY), &wrap_value(&seed_enc.serialize()))?;
            }
            *wallet.encrypted_seed.lock().expect("wallet state poisoned") =
                Some(seed_enc);

            let account = AssetAccount {
                id: AccountId(0),
                kind: AccountKind::Armory135 {
                    root: AssetSingle {
                        index: 0,
                        pub_key: root_pub,
                        priv_key: Some(root_enc),
                    },
                    chaincode,
                },
                assets: BTreeMap::new(),
                lookup,
                issued: 0,
                address_types: BTreeSet::from([
                    AddressType::P2pkh,
                    AddressType::P2pkhUncompressed,
                ]),
                default_type: AddressType::P2pkhUncompressed,
                type_overrides: BTreeMap::new(),
            };
            wallet.install_account(account, true, true)?;
            drop(guard);
        }
        wallet.reset_passphrase_prompt();
        Ok(wallet)
    }

    /// Creates a watch-only Armory 1.35 wallet from a public root and
    /// chaincode.
    pub fn create_from_public_root_armory135(
        home_dir: &Path,
        root_pub: &[u8],
        chaincode: SecureBytes,
        control_passphrase: SecureBytes,
        lookup: u32,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        let root_pub = ecc::uncompress_point(root_pub)?.to_vec();
        let wallet_id = wallet_id_from_pub(&root_pub);

        let wallet = Self::create_shell(
            &home_dir.join(format!("{wallet_id}.wallet")),
            &wallet_id,
            &SecureBytes::default(),
            &fixed_passphrase(control_passphrase),
            kdf,
        )?;

        let account = AssetAccount {
            id: AccountId(0),
            kind: AccountKind::Armory135 {
                root: AssetSingle {
                    index: 0,
                    pub_key: root_pub,
                    priv_key: None,
                },
                chaincode,
            },
            assets: BTreeMap::new(),
            lookup,
            issued: 0,
            address_types: BTreeSet::from([
                AddressType::P2pkh,
                AddressType::P2pkhUncompressed,
            ]),
            default_type: AddressType::P2pkhUncompressed,
            type_overrides: BTreeMap::new(),
        };
        wallet.install_account(account, true, false)?;
        Ok(wallet)
    }

    /// Creates an empty watch-only wallet with no seed and no accounts.
    pub fn create_seedless_watching_only(
        home_dir: &Path,
        control_passphrase: SecureBytes,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        let throwaway = ecc::create_new_private_key();
        let wallet_id = wallet_id_from_pub(&ecc::compute_public_key(&throwaway, true)?);
        Self::create_shell(
            &home_dir.join(format!("{wallet_id}.wallet")),
            &wallet_id,
            &SecureBytes::default(),
            &fixed_passphrase(control_passphrase),
            kdf,
        )
    }

    /// Builds the common wallet scaffolding: the file, the control layer,
    /// the wallet header, and the wallet's own master key.
    fn create_shell(
        path: &Path,
        wallet_id: &str,
        wallet_passphrase: &SecureBytes,
        control_provider: &PassphraseProvider,
        kdf: Option<KdfRomix>,
    ) -> WalletResult<Arc<Self>> {
        let kdf = match kdf {
            Some(kdf) => kdf,
            None => KdfRomix::calibrate(
                crate::kdf::DEFAULT_KDF_TARGET_SEC,
                crate::kdf::DEFAULT_KDF_MAX_MEMORY,
            )?,
        };

        let store = Arc::new(SqliteStore::open(path)?);
        let iface = WalletDbInterface::setup_env(store, control_provider, Some(kdf.clone()))?;

        let default_key = SecureBytes::random(32);
        let staging =
            DecryptedDataContainer::new(Vec::new(), default_key.clone(), kdf.kdf_id().to_vec());
        staging.register_kdf(kdf.clone());
        let (master, _master_plain, slot_kdf) = staging
            .create_master_key(wallet_passphrase)
            .map_err(WalletError::Container)?;

        let header = WalletHeader {
            kind: WalletHeaderKind::Single,
            db_name: wallet_id.to_string(),
            control_salt: SecureBytes::default(),
            default_kdf_id: kdf.kdf_id().to_vec(),
            master_key_id: master.id.clone(),
            default_key: default_key.clone(),
            db_count: 0,
        };

        let declared = iface.db_count() as u32 + 1;
        if declared > 1 {
            iface.set_db_count(declared)?;
        }
        iface.lock_control_container(control_provider)?;
        let result = iface.add_header(header);
        iface.unlock_control_container();
        result?;

        let container = Arc::new(DecryptedDataContainer::new(
            master.id.clone(),
            default_key,
            kdf.kdf_id().to_vec(),
        ));
        container.register_kdf(kdf.clone());
        if let Some(slot_kdf) = slot_kdf.clone() {
            container.register_kdf(slot_kdf);
        }
        container.register_master_key(master.clone());

        {
            let tx = iface.begin_write_transaction(wallet_id)?;
            write_master_key(&tx, &master)?;
            write_kdf(&tx, &kdf)?;
            if let Some(slot_kdf) = slot_kdf {
                write_kdf(&tx, &slot_kdf)?;
            }
        }
        iface.set_main_wallet(wallet_id)?;

        tracing::info!(wallet = wallet_id, "created wallet");
        Ok(Arc::new(Self {
            iface,
            path: path.to_path_buf(),
            db_name: wallet_id.to_string(),
            container,
            accounts: Mutex::new(BTreeMap::new()),
            main_account: Mutex::new(None),
            encrypted_seed: Mutex::new(None),
        }))
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Opens the main wallet of a wallet file.
    pub fn load_main_wallet_from_file(
        path: &Path,
        control_provider: &PassphraseProvider,
    ) -> WalletResult<Arc<Self>> {
        let store = Arc::new(SqliteStore::open(path)?);
        let iface = WalletDbInterface::setup_env(store, control_provider, None)?;

        let db_name = match iface.main_wallet()? {
            Some(name) => name,
            None => iface
                .db_names()
                .into_iter()
                .next()
                .ok_or_else(|| StorageError::corrupt("wallet file holds no wallets"))?,
        };
        let header = iface
            .wallet_header(&db_name)
            .ok_or_else(|| StorageError::InvalidDbName(db_name.clone()))?;

        let mut master_keys: Vec<MasterKey> = Vec::new();
        let mut kdfs: Vec<KdfRomix> = Vec::new();
        let mut seed: Option<EncryptedData> = None;
        let mut main_account: Option<AccountId> = None;
        let mut accounts: BTreeMap<AccountId, AssetAccount> = BTreeMap::new();
        let mut assets: Vec<(u32, AssetSingle)> = Vec::new();

        {
            let tx = iface.begin_read_transaction(&db_name)?;
            for (key, value) in tx.entries() {
                if key == u32_key(WALLET_SEED_KEY) {
                    seed = Some(EncryptedData::deserialize(&unwrap_value(&value)?)?);
                } else if key == u32_key(MAIN_ACCOUNT_KEY) {
                    let payload = unwrap_value(&value)?;
                    let arr: [u8; 4] = payload
                        .as_slice()
                        .try_into()
                        .map_err(|_| StorageError::corrupt("main account record"))?;
                    main_account = Some(AccountId(u32::from_be_bytes(arr)));
                } else {
                    match key.first() {
                        Some(&MASTERKEY_PREFIX) => {
                            master_keys.push(MasterKey::deserialize(&unwrap_value(&value)?)?);
                        }
                        Some(&KDF_PREFIX) => {
                            kdfs.push(KdfRomix::deserialize(&unwrap_value(&value)?)?);
                        }
                        Some(&ACCOUNT_PREFIX) => {
                            let account =
                                AssetAccount::deserialize(&unwrap_value(&value)?)?;
                            accounts.insert(account.id, account);
                        }
                        Some(&ASSET_PREFIX) => {
                            if key.len() != 9 {
                                return Err(StorageError::corrupt("asset record key").into());
                            }
                            let account = u32::from_be_bytes(
                                key[1..5].try_into().expect("length checked"),
                            );
                            let entry = AssetEntry::deserialize(&unwrap_value(&value)?)?;
                            let AssetEntry::Single(single) = entry else {
                                return Err(AssetError::UnknownAssetType(0).into());
                            };
                            assets.push((account, single));
                        }
                        _ => {}
                    }
                }
            }
        }

        let master_id = if !header.master_key_id.is_empty() {
            header.master_key_id.clone()
        } else {
            master_keys
                .first()
                .map(|m| m.id.clone())
                .unwrap_or_default()
        };

        let container = Arc::new(DecryptedDataContainer::new(
            master_id,
            header.default_key.clone(),
            header.default_kdf_id.clone(),
        ));
        for kdf in kdfs {
            container.register_kdf(kdf);
        }
        for master in master_keys {
            container.register_master_key(master);
        }

        for (account_id, asset) in assets {
            if let Some(account) = accounts.get_mut(&AccountId(account_id)) {
                account.assets.insert(asset.index, asset);
            }
        }

        tracing::debug!(wallet = %db_name, accounts = accounts.len(), "loaded wallet");
        Ok(Arc::new(Self {
            iface,
            path: path.to_path_buf(),
            db_name,
            container,
            accounts: Mutex::new(accounts),
            main_account: Mutex::new(main_account),
            encrypted_seed: Mutex::new(seed),
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Wallet id (also the sub-DB name).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.db_name
    }

    /// Path of the backing wallet file.
    #[must_use]
    pub fn db_filename(&self) -> &Path {
        &self.path
    }

    /// The wallet's decrypted-data container.
    #[must_use]
    pub fn container(&self) -> &Arc<DecryptedDataContainer> {
        &self.container
    }

    /// The encrypted wallet seed, if one is stored.
    #[must_use]
    pub fn encrypted_seed(&self) -> Option<EncryptedData> {
        self.encrypted_seed
            .lock()
            .expect("wallet state poisoned")
            .clone()
    }

    /// Returns `true` when no account carries private material.
    #[must_use]
    pub fn is_watch_only(&self) -> bool {
        let accounts = self.accounts.lock().expect("wallet state poisoned");
        accounts.values().all(AssetAccount::is_watch_only)
    }

    /// Installs the per-wallet passphrase prompt.
    pub fn set_passphrase_prompt(&self, provider: PassphraseProvider) {
        self.container.set_passphrase_provider(provider);
    }

    /// Removes the passphrase prompt.
    pub fn reset_passphrase_prompt(&self) {
        self.container.reset_passphrase_provider();
    }

    /// Acquires the scoped decrypted-data lock.
    #[must_use]
    pub fn lock_decrypted_container(&self) -> ContainerLock {
        self.container.lock()
    }

    /// Decrypts an encrypted object. Requires the scoped lock.
    pub fn get_decrypted_value(&self, obj: &EncryptedData) -> WalletResult<SecureBytes> {
        Ok(self.container.get_decrypted_value(obj)?)
    }

    /// Clone of an account's state.
    pub fn get_account_for_id(&self, id: AccountId) -> WalletResult<AssetAccount> {
        self.accounts
            .lock()
            .expect("wallet state poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| AssetError::UnknownAccount.into())
    }

    /// Id of the main account.
    pub fn main_account_id(&self) -> WalletResult<AccountId> {
        self.main_account
            .lock()
            .expect("wallet state poisoned")
            .ok_or_else(|| AssetError::UnknownAccount.into())
    }

    /// All registered account ids.
    #[must_use]
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts
            .lock()
            .expect("wallet state poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// The asset at `index` on the main account.
    pub fn get_main_account_asset_for_index(&self, index: u32) -> WalletResult<AssetSingle> {
        let main = self.main_account_id()?;
        let accounts = self.accounts.lock().expect("wallet state poisoned");
        let account = accounts.get(&main).ok_or(AssetError::UnknownAccount)?;
        Ok(account.get_asset_for_index(index)?.clone())
    }

    /// Prefixed address hashes across every account's derived window.
    #[must_use]
    pub fn get_addr_hash_set(&self) -> BTreeSet<Vec<u8>> {
        let accounts = self.accounts.lock().expect("wallet state poisoned");
        let mut out = BTreeSet::new();
        for account in accounts.values() {
            out.extend(account.address_hashes());
        }
        out
    }

    /// Finds the account, index, and type matching an address hash.
    #[must_use]
    pub fn get_asset_pair_for_key(&self, hash: &[u8]) -> Option<(AccountId, u32, AddressType)> {
        let accounts = self.accounts.lock().expect("wallet state poisoned");
        for (id, account) in accounts.iter() {
            if let Some((index, addr_type)) = account.get_asset_pair_for_key(hash) {
                return Some((*id, index, addr_type));
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    fn next_account_id(&self) -> AccountId {
        let accounts = self.accounts.lock().expect("wallet state poisoned");
        AccountId(accounts.keys().map(|id| id.0 + 1).max().unwrap_or(0))
    }

    /// Creates a BIP32 (optionally salted) account from the wallet seed.
    ///
    /// Requires the passphrase prompt when the wallet is encrypted.
    pub fn create_bip32_account(&self, spec: &AccountTypeBip32) -> WalletResult<AccountId> {
        let seed_enc = self
            .encrypted_seed()
            .ok_or(AssetError::WatchOnly)?;

        let guard = self.container.lock();
        let seed = self.container.get_decrypted_value(&seed_enc)?;

        let master_node = Bip32Node::init_from_seed(&seed)?;
        let seed_fingerprint = master_node.fingerprint();
        let mut node = master_node;
        for step in &spec.derivation_path {
            node.derive_private(*step)?;
        }
        let root_enc = self
            .container
            .encrypt_under_master(node.private_key()?)?;

        let root = AssetBip32Root {
            index: 0,
            pub_key: *node.public_key(),
            priv_key: Some(root_enc),
            chaincode: node.chaincode().clone(),
            depth: node.depth(),
            leaf_id: node.leaf_id(),
            parent_fingerprint: node.parent_fingerprint(),
            seed_fingerprint,
            derivation_path: spec.derivation_path.clone(),
        };
        let kind = match &spec.salt {
            Some(salt) => AccountKind::Bip32Salted {
                root,
                salt: salt.clone(),
            },
            None => AccountKind::Bip32 { root },
        };

        let account = AssetAccount {
            id: self.next_account_id(),
            kind,
            assets: BTreeMap::new(),
            lookup: spec.lookup,
            issued: 0,
            address_types: spec.address_types.clone(),
            default_type: spec.default_type,
            type_overrides: BTreeMap::new(),
        };
        let id = self.install_account(account, spec.main, true)?;
        drop(guard);
        Ok(id)
    }

    /// Creates an ECDH account around a static key pair.
    pub fn create_ecdh_account(&self, spec: &AccountTypeEcdh) -> WalletResult<AccountId> {
        let pub_key: [u8; 33] = ecc::compress_point(&spec.pub_key)?;

        let guard = self.container.lock();
        let priv_enc = self.container.encrypt_under_master(&spec.priv_key)?;
        let account = AssetAccount {
            id: self.next_account_id(),
            kind: AccountKind::Ecdh {
                pub_key,
                priv_key: Some(priv_enc),
                salts: BTreeMap::new(),
            },
            assets: BTreeMap::new(),
            lookup: 1,
            issued: 0,
            address_types: spec.address_types.clone(),
            default_type: spec.default_type,
            type_overrides: BTreeMap::new(),
        };
        let id = self.install_account(account, spec.main, false)?;
        drop(guard);
        Ok(id)
    }

    /// Extends the lookahead, optionally fills private material, persists,
    /// and registers an account.
    fn install_account(
        &self,
        mut account: AssetAccount,
        main: bool,
        fill_private: bool,
    ) -> WalletResult<AccountId> {
        let missing = account.lookup.saturating_sub(account.chain_top());
        account.extend_public_chain(missing)?;
        if fill_private && !account.is_watch_only() {
            account.extend_private_chain(&self.container)?;
        }

        let id = account.id;
        {
            let tx = self.iface.begin_write_transaction(&self.db_name)?;
            let indices: Vec<u32> = account.assets.keys().copied().collect();
            persist_account(&tx, &account, &indices)?;
            if main {
                tx.insert(
                    &u32_key(MAIN_ACCOUNT_KEY),
                    &wrap_value(&id.to_bytes()),
                )?;
            }
        }

        self.accounts
            .lock()
            .expect("wallet state poisoned")
            .insert(id, account);
        if main {
            *self.main_account.lock().expect("wallet state poisoned") = Some(id);
        }
        Ok(id)
    }

    /// Issues a new address on the main account.
    pub fn get_new_address(
        &self,
        addr_type: Option<AddressType>,
    ) -> WalletResult<AddressEntry> {
        let main = self.main_account_id()?;
        self.get_new_address_for_account(main, addr_type)
    }

    /// Issues a new address on a specific account.
    pub fn get_new_address_for_account(
        &self,
        id: AccountId,
        addr_type: Option<AddressType>,
    ) -> WalletResult<AddressEntry> {
        let mut accounts = self.accounts.lock().expect("wallet state poisoned");
        let account = accounts
            .get_mut(&id)
            .ok_or(AssetError::UnknownAccount)?;

        let top_before = account.chain_top();
        let (_, entry) = account.get_new_address(addr_type)?;
        let new_indices: Vec<u32> = (top_before..account.chain_top()).collect();

        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        persist_account(&tx, account, &new_indices)?;
        drop(tx);
        Ok(entry)
    }

    /// Extends an account's public chain by `count` entries.
    pub fn extend_public_chain(&self, id: AccountId, count: u32) -> WalletResult<()> {
        let mut accounts = self.accounts.lock().expect("wallet state poisoned");
        let account = accounts
            .get_mut(&id)
            .ok_or(AssetError::UnknownAccount)?;
        let added = account.extend_public_chain(count)?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        persist_account(&tx, account, &added)?;
        Ok(())
    }

    /// Extends an account's encrypted private chain to cover its derived
    /// assets. Requires the container lock.
    pub fn extend_private_chain(&self, id: AccountId) -> WalletResult<()> {
        let mut accounts = self.accounts.lock().expect("wallet state poisoned");
        let account = accounts
            .get_mut(&id)
            .ok_or(AssetError::UnknownAccount)?;
        let filled = account.extend_private_chain(&self.container)?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        persist_account(&tx, account, &filled)?;
        Ok(())
    }

    /// Appends a salt to an ECDH account and persists the definition.
    pub fn add_ecdh_salt(&self, id: AccountId, salt: SecureBytes) -> WalletResult<u32> {
        let mut accounts = self.accounts.lock().expect("wallet state poisoned");
        let account = accounts
            .get_mut(&id)
            .ok_or(AssetError::UnknownAccount)?;
        let salt_id = account.add_salt(salt)?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        persist_account(&tx, account, &[])?;
        Ok(salt_id)
    }

    // ------------------------------------------------------------------
    // Passphrase management
    // ------------------------------------------------------------------

    /// Adds a passphrase slot to the wallet master key.
    pub fn add_passphrase(&self, new_passphrase: &SecureBytes) -> WalletResult<()> {
        let (master, kdf) = self.container.add_passphrase(new_passphrase)?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        write_master_key(&tx, &master)?;
        write_kdf(&tx, &kdf)?;
        Ok(())
    }

    /// Replaces the active passphrase slot.
    pub fn change_passphrase(&self, new_passphrase: &SecureBytes) -> WalletResult<()> {
        let (master, kdf) = self.container.change_passphrase(new_passphrase)?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        write_master_key(&tx, &master)?;
        if let Some(kdf) = kdf {
            write_kdf(&tx, &kdf)?;
        }
        Ok(())
    }

    /// Removes the active passphrase slot.
    pub fn erase_passphrase(&self) -> WalletResult<()> {
        let master = self.container.erase_passphrase()?;
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        write_master_key(&tx, &master)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Comment store
    // ------------------------------------------------------------------

    /// Sets (or replaces) the comment stored under `key`.
    pub fn set_comment(&self, key: &[u8], comment: &str) -> WalletResult<()> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        tx.insert(
            &prefixed_key(COMMENT_PREFIX, key),
            &wrap_value(comment.as_bytes()),
        )?;
        Ok(())
    }

    /// Reads the comment stored under `key`.
    pub fn get_comment(&self, key: &[u8]) -> WalletResult<Option<String>> {
        let tx = self.iface.begin_read_transaction(&self.db_name)?;
        match tx.get(&prefixed_key(COMMENT_PREFIX, key)) {
            Some(value) => {
                let text = String::from_utf8(unwrap_value(&value)?)
                    .map_err(|_| StorageError::corrupt("comment is not utf-8"))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    /// Deletes the comment stored under `key`.
    pub fn delete_comment(&self, key: &[u8]) -> WalletResult<()> {
        let tx = self.iface.begin_write_transaction(&self.db_name)?;
        tx.erase(&prefixed_key(COMMENT_PREFIX, key))?;
        Ok(())
    }

    /// Reads every stored comment.
    pub fn get_comment_map(&self) -> WalletResult<BTreeMap<Vec<u8>, String>> {
        let tx = self.iface.begin_read_transaction(&self.db_name)?;
        let mut out = BTreeMap::new();
        for (key, value) in tx.entries() {
            if key.first() == Some(&COMMENT_PREFIX) {
                let text = String::from_utf8(unwrap_value(&value)?)
                    .map_err(|_| StorageError::corrupt("comment is not utf-8"))?;
                out.insert(key[1..].to_vec(), text);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Watch-only fork
    // ------------------------------------------------------------------

    /// Produces a new wallet file containing this file's main wallet with
    /// all private material stripped. Returns the fork's path.
    pub fn fork_watching_only(
        path: &Path,
        control_provider: &PassphraseProvider,
    ) -> WalletResult<PathBuf> {
        let source = Self::load_main_wallet_from_file(path, control_provider)?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("wallet");
        let fork_path = path.with_file_name(format!("{stem}_watchonly.wallet"));
        if fork_path.exists() {
            std::fs::remove_file(&fork_path)
                .map_err(|e| StorageError::io("remove stale fork", e))?;
        }

        // The fork keeps the source KDF cost parameters with a fresh salt.
        let template = source.container.kdf(&source.header_kdf_id()?)?;
        let fork_kdf = KdfRomix::new(
            template.memory_bytes(),
            template.iterations(),
            SecureBytes::random(32),
        )?;

        let fork = Self::create_shell(
            &fork_path,
            &source.db_name,
            &SecureBytes::default(),
            control_provider,
            Some(fork_kdf),
        )?;

        {
            let accounts = source.accounts.lock().expect("wallet state poisoned");
            let main = *source.main_account.lock().expect("wallet state poisoned");
            for account in accounts.values() {
                let watch_only = account.to_watch_only();
                fork.install_account(watch_only, main == Some(account.id), false)?;
            }
        }
        for (key, comment) in source.get_comment_map()? {
            fork.set_comment(&key, &comment)?;
        }

        tracing::info!(wallet = %source.db_name, fork = %fork_path.display(), "forked watch-only copy");
        Ok(fork_path)
    }

    fn header_kdf_id(&self) -> WalletResult<Vec<u8>> {
        let header = self
            .iface
            .wallet_header(&self.db_name)
            .ok_or_else(|| StorageError::InvalidDbName(self.db_name.clone()))?;
        Ok(header.default_kdf_id)
    }
}

impl std::fmt::Debug for AssetWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetWallet")
            .field("id", &self.db_name)
            .field("watch_only", &self.is_watch_only())
            .finish_non_exhaustive()
    }
}

fn write_master_key(tx: &DbTransaction, master: &MasterKey) -> WalletResult<()> {
    tx.insert(
        &prefixed_key(MASTERKEY_PREFIX, &master.id),
        &wrap_value(&master.serialize()),
    )?;
    Ok(())
}

fn write_kdf(tx: &DbTransaction, kdf: &KdfRomix) -> WalletResult<()> {
    tx.insert(
        &prefixed_key(KDF_PREFIX, kdf.kdf_id()),
        &wrap_value(&kdf.serialize()),
    )?;
    Ok(())
}

/// Writes an account definition plus the asset records named in `indices`.
fn persist_account(
    tx: &DbTransaction,
    account: &AssetAccount,
    indices: &[u32],
) -> WalletResult<()> {
    tx.insert(
        &prefixed_key(ACCOUNT_PREFIX, &account.id.to_bytes()),
        &wrap_value(&account.serialize()),
    )?;
    for index in indices {
        let asset = account.get_asset_for_index(*index)?;
        let asset_id = AssetId {
            account: account.id.0,
            index: *index,
        };
        tx.insert(
            &prefixed_key(ASSET_PREFIX, &asset_id.to_bytes()),
            &wrap_value(&AssetEntry::Single(asset.clone()).serialize()),
        )?;
    }
    Ok(())
}
