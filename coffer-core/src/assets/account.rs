//! Asset accounts.
//!
//! An account owns one deterministic chain of assets. Four shapes exist:
//!
//! * **Armory135** — the historical chained derivation; asset `i+1` derives
//!   from asset `i`'s key pair and the account chaincode.
//! * **BIP32** — soft derivation under a stored node root; asset `i` is the
//!   root's non-hardened child `i`.
//! * **BIP32 salted** — BIP32 with every derived point multiplied by a
//!   fixed account salt, unlinkable to its parent without the salt.
//! * **ECDH** — one static key pair plus an append-only salt map; asset `i`
//!   is `static_pub * salt_i`.
//!
//! Public derivation never needs private material, which is what makes
//! watch-only forks equivalent for address generation. Private extension
//! runs under the decrypted-data container lock and stores each derived key
//! encrypted under the wallet's master key.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::{AddressEntry, AddressType};
use crate::buffer::SecureBytes;
use crate::codec::{Reader, Writer};
use crate::container::DecryptedDataContainer;
use crate::crypto::ecc;
use crate::error::{AssetError, AssetResult, StorageError};
use crate::secrets::EncryptedData;

use super::derivation::{armory135, Bip32Node};
use super::entry::{AssetBip32Root, AssetEntry, AssetSingle};

/// Identifies an account inside a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(pub u32);

impl AccountId {
    /// Storage-key suffix.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

const ACCOUNT_KIND_ARMORY135: u8 = 0x01;
const ACCOUNT_KIND_BIP32: u8 = 0x02;
const ACCOUNT_KIND_BIP32_SALTED: u8 = 0x03;
const ACCOUNT_KIND_ECDH: u8 = 0x04;

/// Derivation shape of an account.
#[derive(Clone, Debug)]
pub enum AccountKind {
    /// Armory 1.35 chained derivation.
    Armory135 {
        /// Root key pair (uncompressed public form).
        root: AssetSingle,
        /// Account chaincode.
        chaincode: SecureBytes,
    },
    /// BIP32 soft derivation under a node root.
    Bip32 {
        /// The stored node root.
        root: AssetBip32Root,
    },
    /// BIP32 derivation with a fixed point-multiplication salt.
    Bip32Salted {
        /// The stored node root.
        root: AssetBip32Root,
        /// The account salt.
        salt: SecureBytes,
    },
    /// Static key pair with per-index salts.
    Ecdh {
        /// Compressed static public key.
        pub_key: [u8; 33],
        /// Static private key, encrypted under the wallet master key.
        priv_key: Option<EncryptedData>,
        /// Append-only salt map.
        salts: BTreeMap<u32, SecureBytes>,
    },
}

/// One deterministic chain of assets plus its issuance state.
#[derive(Clone, Debug)]
pub struct AssetAccount {
    /// Account id inside the owning wallet.
    pub id: AccountId,
    /// Derivation shape.
    pub kind: AccountKind,
    /// Derived assets by chain index.
    pub assets: BTreeMap<u32, AssetSingle>,
    /// Lookahead window kept derived past the last issued index.
    pub lookup: u32,
    /// Number of addresses issued so far.
    pub issued: u32,
    /// Address types this account may issue.
    pub address_types: BTreeSet<AddressType>,
    /// Type used when the caller does not pick one.
    pub default_type: AddressType,
    /// Per-index overrides where a non-default type was issued.
    pub type_overrides: BTreeMap<u32, AddressType>,
}

impl AssetAccount {
    /// Returns `true` when the account carries no private material.
    #[must_use]
    pub fn is_watch_only(&self) -> bool {
        match &self.kind {
            AccountKind::Armory135 { root, .. } => !root.has_private_key(),
            AccountKind::Bip32 { root } | AccountKind::Bip32Salted { root, .. } => {
                root.priv_key.is_none()
            }
            AccountKind::Ecdh { priv_key, .. } => priv_key.is_none(),
        }
    }

    /// Strips private material for a watch-only fork.
    #[must_use]
    pub fn to_watch_only(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy.kind {
            AccountKind::Armory135 { root, .. } => root.priv_key = None,
            AccountKind::Bip32 { root } | AccountKind::Bip32Salted { root, .. } => {
                root.priv_key = None;
            }
            AccountKind::Ecdh { priv_key, .. } => *priv_key = None,
        }
        for asset in copy.assets.values_mut() {
            asset.priv_key = None;
        }
        copy
    }

    /// The account's public root material (outer asset root).
    pub fn get_outer_asset_root(&self) -> AssetResult<AssetEntry> {
        Ok(match &self.kind {
            AccountKind::Armory135 { root, .. } => AssetEntry::Single(root.clone()),
            AccountKind::Bip32 { root } | AccountKind::Bip32Salted { root, .. } => {
                AssetEntry::Bip32Root(root.clone())
            }
            AccountKind::Ecdh { pub_key, priv_key, .. } => AssetEntry::Single(AssetSingle {
                index: 0,
                pub_key: pub_key.to_vec(),
                priv_key: priv_key.clone(),
            }),
        })
    }

    fn public_node(root: &AssetBip32Root) -> AssetResult<Bip32Node> {
        Bip32Node::init_from_public(
            &root.pub_key,
            root.chaincode.clone(),
            root.depth,
            root.leaf_id,
            root.parent_fingerprint,
        )
    }

    /// Derives the public key of chain index `index`.
    fn derive_public_key(&self, index: u32) -> AssetResult<Vec<u8>> {
        match &self.kind {
            AccountKind::Armory135 { root, chaincode } => {
                let prev = if index == 0 {
                    root.uncompressed_key()?.to_vec()
                } else {
                    self.assets
                        .get(&(index - 1))
                        .ok_or(AssetError::UnknownAsset(index))?
                        .uncompressed_key()?
                        .to_vec()
                };
                armory135::chained_public_key(&prev, chaincode)
            }
            AccountKind::Bip32 { root } => {
                let mut node = Self::public_node(root)?;
                node.derive_public(index)?;
                Ok(node.public_key().to_vec())
            }
            AccountKind::Bip32Salted { root, salt } => {
                let mut node = Self::public_node(root)?;
                node.derive_public(index)?;
                ecc::pubkey_scalar_multiply(node.public_key(), salt)
                    .map_err(AssetError::Storage)
            }
            AccountKind::Ecdh { pub_key, salts, .. } => {
                let salt = salts
                    .get(&index)
                    .ok_or(AssetError::UnknownAsset(index))?;
                ecc::pubkey_scalar_multiply(pub_key, salt).map_err(AssetError::Storage)
            }
        }
    }

    /// Number of derived assets (the chain is dense from 0).
    #[must_use]
    pub fn chain_top(&self) -> u32 {
        self.assets.len() as u32
    }

    /// Highest index the chain can reach (ECDH chains stop at their salts).
    fn chain_capacity(&self) -> Option<u32> {
        match &self.kind {
            AccountKind::Ecdh { salts, .. } => Some(salts.len() as u32),
            _ => None,
        }
    }

    /// Extends the public chain by up to `count` entries. Returns the
    /// indices added.
    pub fn extend_public_chain(&mut self, count: u32) -> AssetResult<Vec<u32>> {
        let start = self.chain_top();
        let mut end = start.saturating_add(count);
        if let Some(capacity) = self.chain_capacity() {
            end = end.min(capacity);
        }
        let mut added = Vec::new();
        for index in start..end {
            let pub_key = self.derive_public_key(index)?;
            self.assets.insert(index, AssetSingle {
                index,
                pub_key,
                priv_key: None,
            });
            added.push(index);
        }
        if !added.is_empty() {
            tracing::trace!(account = %self.id, new_top = end, "extended public chain");
        }
        Ok(added)
    }

    /// Extends encrypted private material to cover every derived asset.
    ///
    /// Requires the container lock; fails with `WatchOnly` on accounts
    /// without private roots.
    pub fn extend_private_chain(
        &mut self,
        container: &DecryptedDataContainer,
    ) -> AssetResult<Vec<u32>> {
        let top = self.chain_top();
        let mut filled = Vec::new();
        match &self.kind {
            AccountKind::Armory135 { root, chaincode } => {
                let enc = root.encrypted_priv_key()?;
                let mut current = container.get_decrypted_value(enc)?;
                let chaincode = chaincode.clone();
                for index in 0..top {
                    current = armory135::chained_private_key(&current, &chaincode)?;
                    let asset = self
                        .assets
                        .get_mut(&index)
                        .expect("chain is dense up to top");
                    if asset.priv_key.is_none() {
                        asset.priv_key = Some(container.encrypt_under_master(&current)?);
                        filled.push(index);
                    }
                }
            }
            AccountKind::Bip32 { root } | AccountKind::Bip32Salted { root, .. } => {
                let enc = root.priv_key.as_ref().ok_or(AssetError::WatchOnly)?;
                let root_priv = container.get_decrypted_value(enc)?;
                let node = Bip32Node::init_from_private(
                    root_priv,
                    root.chaincode.clone(),
                    root.depth,
                    root.leaf_id,
                    root.parent_fingerprint,
                )?;
                let salt = match &self.kind {
                    AccountKind::Bip32Salted { salt, .. } => Some(salt.clone()),
                    _ => None,
                };
                for index in 0..top {
                    let needs_key = self
                        .assets
                        .get(&index)
                        .is_some_and(|a| a.priv_key.is_none());
                    if !needs_key {
                        continue;
                    }
                    let mut child = node.clone();
                    child.derive_private(index)?;
                    let priv_key = match &salt {
                        Some(salt) => {
                            ecc::privkey_scalar_multiply(child.private_key()?, salt)?
                        }
                        None => child.private_key()?.clone(),
                    };
                    let asset = self
                        .assets
                        .get_mut(&index)
                        .expect("chain is dense up to top");
                    asset.priv_key = Some(container.encrypt_under_master(&priv_key)?);
                    filled.push(index);
                }
            }
            AccountKind::Ecdh {
                priv_key, salts, ..
            } => {
                let enc = priv_key.as_ref().ok_or(AssetError::WatchOnly)?;
                let static_priv = container.get_decrypted_value(enc)?;
                let salts = salts.clone();
                for index in 0..top {
                    let needs_key = self
                        .assets
                        .get(&index)
                        .is_some_and(|a| a.priv_key.is_none());
                    if !needs_key {
                        continue;
                    }
                    let salt = salts
                        .get(&index)
                        .ok_or(AssetError::UnknownAsset(index))?;
                    let salted = ecc::privkey_scalar_multiply(&static_priv, salt)?;
                    let asset = self
                        .assets
                        .get_mut(&index)
                        .expect("chain is dense up to top");
                    asset.priv_key = Some(container.encrypt_under_master(&salted)?);
                    filled.push(index);
                }
            }
        }
        Ok(filled)
    }

    /// Appends a salt to an ECDH account. Re-adding an existing salt is
    /// idempotent and returns its id.
    pub fn add_salt(&mut self, salt: SecureBytes) -> AssetResult<u32> {
        let AccountKind::Ecdh { salts, .. } = &mut self.kind else {
            return Err(AssetError::InvalidDerivationPath(
                "salts only apply to ECDH accounts".to_string(),
            ));
        };
        if let Some((id, _)) = salts.iter().find(|(_, s)| **s == salt) {
            return Ok(*id);
        }
        let id = salts.len() as u32;
        salts.insert(id, salt);
        Ok(id)
    }

    /// The asset at `index`.
    pub fn get_asset_for_index(&self, index: u32) -> AssetResult<&AssetSingle> {
        self.assets
            .get(&index)
            .ok_or(AssetError::UnknownAsset(index))
    }

    /// Builds the address entry for an asset under an address type.
    pub fn entry_for_index(&self, index: u32, addr_type: AddressType) -> AssetResult<AddressEntry> {
        let asset = self.get_asset_for_index(index)?;
        AddressEntry::from_type(
            addr_type,
            &asset.compressed_key()?,
            &asset.uncompressed_key()?,
        )
    }

    /// The address type in effect for an issued index.
    #[must_use]
    pub fn type_for_index(&self, index: u32) -> AddressType {
        self.type_overrides
            .get(&index)
            .copied()
            .unwrap_or(self.default_type)
    }

    /// Issues the next address, keeping the lookahead window derived.
    pub fn get_new_address(
        &mut self,
        addr_type: Option<AddressType>,
    ) -> AssetResult<(u32, AddressEntry)> {
        let addr_type = addr_type.unwrap_or(self.default_type);
        if !self.address_types.contains(&addr_type) {
            return Err(AssetError::InvalidAddress(
                "address type not enabled on this account".to_string(),
            ));
        }

        let index = self.issued;
        if index >= self.chain_top() {
            self.extend_public_chain(self.lookup.max(1))?;
        }
        if index >= self.chain_top() {
            return Err(AssetError::UnknownAsset(index));
        }

        let entry = self.entry_for_index(index, addr_type)?;
        if addr_type != self.default_type {
            self.type_overrides.insert(index, addr_type);
        }
        self.issued += 1;
        Ok((index, entry))
    }

    /// Finds the asset and type matching an address hash.
    #[must_use]
    pub fn get_asset_pair_for_key(&self, hash: &[u8]) -> Option<(u32, AddressType)> {
        for index in self.assets.keys() {
            for addr_type in &self.address_types {
                if let Ok(entry) = self.entry_for_index(*index, *addr_type) {
                    if entry.hash() == hash {
                        return Some((*index, *addr_type));
                    }
                }
            }
        }
        None
    }

    /// Prefixed address hashes over the whole derived window, one per
    /// enabled address type.
    #[must_use]
    pub fn address_hashes(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for index in self.assets.keys() {
            for addr_type in &self.address_types {
                if let Ok(entry) = self.entry_for_index(*index, *addr_type) {
                    out.push(entry.prefixed_hash());
                }
            }
        }
        out
    }

    /// Serializes the account definition (assets persist separately).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u32_be(self.id.0);
        match &self.kind {
            AccountKind::Armory135 { root, chaincode } => {
                w.put_u8(ACCOUNT_KIND_ARMORY135);
                w.put_var_bytes(&AssetEntry::Single(root.clone()).serialize());
                w.put_var_bytes(chaincode);
            }
            AccountKind::Bip32 { root } => {
                w.put_u8(ACCOUNT_KIND_BIP32);
                w.put_var_bytes(&AssetEntry::Bip32Root(root.clone()).serialize());
            }
            AccountKind::Bip32Salted { root, salt } => {
                w.put_u8(ACCOUNT_KIND_BIP32_SALTED);
                w.put_var_bytes(&AssetEntry::Bip32Root(root.clone()).serialize());
                w.put_var_bytes(salt);
            }
            AccountKind::Ecdh {
                pub_key,
                priv_key,
                salts,
            } => {
                w.put_u8(ACCOUNT_KIND_ECDH);
                w.put_var_bytes(pub_key);
                match priv_key {
                    Some(enc) => {
                        w.put_u8(1);
                        w.put_var_bytes(&enc.serialize());
                    }
                    None => w.put_u8(0),
                }
                w.put_var_int(salts.len() as u64);
                for (id, salt) in salts {
                    w.put_u32_be(*id);
                    w.put_var_bytes(salt);
                }
            }
        }
        w.put_u32_be(self.lookup);
        w.put_u32_be(self.issued);
        w.put_u8(self.default_type.to_u8());
        w.put_var_int(self.address_types.len() as u64);
        for addr_type in &self.address_types {
            w.put_u8(addr_type.to_u8());
        }
        w.put_var_int(self.type_overrides.len() as u64);
        for (index, addr_type) in &self.type_overrides {
            w.put_u32_be(*index);
            w.put_u8(addr_type.to_u8());
        }
        w.into_bytes()
    }

    /// Deserializes an account definition.
    pub fn deserialize(data: &[u8]) -> AssetResult<Self> {
        let mut r = Reader::new(data);
        let id = AccountId(r.get_u32_be().map_err(AssetError::Storage)?);
        let kind_tag = r.get_u8().map_err(AssetError::Storage)?;
        let kind = match kind_tag {
            ACCOUNT_KIND_ARMORY135 => {
                let root_bytes = r.get_var_bytes().map_err(AssetError::Storage)?;
                let AssetEntry::Single(root) = AssetEntry::deserialize(root_bytes)? else {
                    return Err(AssetError::UnknownAssetType(kind_tag));
                };
                let chaincode =
                    SecureBytes::from_slice(r.get_var_bytes().map_err(AssetError::Storage)?);
                AccountKind::Armory135 { root, chaincode }
            }
            ACCOUNT_KIND_BIP32 | ACCOUNT_KIND_BIP32_SALTED => {
                let root_bytes = r.get_var_bytes().map_err(AssetError::Storage)?;
                let AssetEntry::Bip32Root(root) = AssetEntry::deserialize(root_bytes)? else {
                    return Err(AssetError::UnknownAssetType(kind_tag));
                };
                if kind_tag == ACCOUNT_KIND_BIP32 {
                    AccountKind::Bip32 { root }
                } else {
                    let salt =
                        SecureBytes::from_slice(r.get_var_bytes().map_err(AssetError::Storage)?);
                    AccountKind::Bip32Salted { root, salt }
                }
            }
            ACCOUNT_KIND_ECDH => {
                let pub_key: [u8; 33] = r
                    .get_var_bytes()
                    .map_err(AssetError::Storage)?
                    .try_into()
                    .map_err(|_| {
                        AssetError::Storage(StorageError::malformed("ecdh public key length"))
                    })?;
                let priv_key = match r.get_u8().map_err(AssetError::Storage)? {
                    0 => None,
                    _ => Some(EncryptedData::deserialize(
                        r.get_var_bytes().map_err(AssetError::Storage)?,
                    )?),
                };
                let count = r.get_var_int().map_err(AssetError::Storage)?;
                let mut salts = BTreeMap::new();
                for _ in 0..count {
                    let id = r.get_u32_be().map_err(AssetError::Storage)?;
                    let salt =
                        SecureBytes::from_slice(r.get_var_bytes().map_err(AssetError::Storage)?);
                    salts.insert(id, salt);
                }
                AccountKind::Ecdh {
                    pub_key,
                    priv_key,
                    salts,
                }
            }
            other => return Err(AssetError::UnknownAssetType(other)),
        };

        let lookup = r.get_u32_be().map_err(AssetError::Storage)?;
        let issued = r.get_u32_be().map_err(AssetError::Storage)?;
        let default_type = AddressType::from_u8(r.get_u8().map_err(AssetError::Storage)?)?;
        let type_count = r.get_var_int().map_err(AssetError::Storage)?;
        let mut address_types = BTreeSet::new();
        for _ in 0..type_count {
            address_types.insert(AddressType::from_u8(
                r.get_u8().map_err(AssetError::Storage)?,
            )?);
        }
        let override_count = r.get_var_int().map_err(AssetError::Storage)?;
        let mut type_overrides = BTreeMap::new();
        for _ in 0..override_count {
            let index = r.get_u32_be().map_err(AssetError::Storage)?;
            let addr_type = AddressType::from_u8(r.get_u8().map_err(AssetError::Storage)?)?;
            type_overrides.insert(index, addr_type);
        }
        r.expect_end().map_err(AssetError::Storage)?;

        Ok(Self {
            id,
            kind,
            assets: BTreeMap::new(),
            lookup,
            issued,
            address_types,
            default_type,
            type_overrides,
        })
    }
}
