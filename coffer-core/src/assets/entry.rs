//! Asset entries.
//!
//! An asset is one unit of key material: a single public key with optional
//! encrypted private material, a multisig bundle of such keys, or a BIP32
//! root carrying its derivation context. Assets live in accounts and are
//! persisted as individual records in the owning wallet's sub-DB.

use crate::buffer::SecureBytes;
use crate::codec::{Reader, Writer};
use crate::crypto::ecc;
use crate::error::{AssetError, AssetResult, StorageResult};
use crate::secrets::EncryptedData;

/// Identifies an asset inside a wallet: owning account plus chain index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId {
    /// Owning account.
    pub account: u32,
    /// Index within the account's chain.
    pub index: u32,
}

impl AssetId {
    /// Storage-key suffix: `be32(account) || be32(index)`.
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.account.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out
    }
}

const ASSET_TYPE_SINGLE: u8 = 0x01;
const ASSET_TYPE_MULTISIG: u8 = 0x02;
const ASSET_TYPE_BIP32_ROOT: u8 = 0x03;

/// A single public key with optional encrypted private material.
#[derive(Clone, Debug)]
pub struct AssetSingle {
    /// Chain index.
    pub index: u32,
    /// Public key as issued (compressed or uncompressed).
    pub pub_key: Vec<u8>,
    /// Private key, encrypted under the wallet's master key.
    pub priv_key: Option<EncryptedData>,
}

impl AssetSingle {
    /// The compressed form of the public key.
    pub fn compressed_key(&self) -> AssetResult<[u8; 33]> {
        ecc::compress_point(&self.pub_key).map_err(AssetError::Storage)
    }

    /// The uncompressed form of the public key.
    pub fn uncompressed_key(&self) -> AssetResult<[u8; 65]> {
        ecc::uncompress_point(&self.pub_key).map_err(AssetError::Storage)
    }

    /// Returns the encrypted private key or fails with `WatchOnly`.
    pub fn encrypted_priv_key(&self) -> AssetResult<&EncryptedData> {
        self.priv_key.as_ref().ok_or(AssetError::WatchOnly)
    }

    /// Returns `true` when encrypted private material is present.
    #[must_use]
    pub fn has_private_key(&self) -> bool {
        self.priv_key.is_some()
    }

    fn write_to(&self, w: &mut Writer) {
        w.put_u32_be(self.index);
        w.put_var_bytes(&self.pub_key);
        match &self.priv_key {
            Some(enc) => {
                w.put_u8(1);
                w.put_var_bytes(&enc.serialize());
            }
            None => w.put_u8(0),
        }
    }

    fn read_from(r: &mut Reader<'_>) -> StorageResult<Self> {
        let index = r.get_u32_be()?;
        let pub_key = r.get_var_bytes()?.to_vec();
        let priv_key = match r.get_u8()? {
            0 => None,
            _ => Some(EncryptedData::deserialize(r.get_var_bytes()?)?),
        };
        Ok(Self {
            index,
            pub_key,
            priv_key,
        })
    }
}

/// A BIP32 root asset: public key plus the context needed to resolve its
/// derivation path from the seed.
#[derive(Clone, Debug)]
pub struct AssetBip32Root {
    /// Chain index (root assets sit at the head of their account).
    pub index: u32,
    /// Compressed public key.
    pub pub_key: [u8; 33],
    /// Private key, encrypted under the wallet's master key.
    pub priv_key: Option<EncryptedData>,
    /// Chain code.
    pub chaincode: SecureBytes,
    /// Depth on the derivation path.
    pub depth: u8,
    /// Child index of this node.
    pub leaf_id: u32,
    /// Fingerprint of the parent node.
    pub parent_fingerprint: [u8; 4],
    /// Fingerprint of the seed's master node.
    pub seed_fingerprint: [u8; 4],
    /// Full derivation path from the seed.
    pub derivation_path: Vec<u32>,
}

/// One asset entry.
#[derive(Clone, Debug)]
pub enum AssetEntry {
    /// A single key pair.
    Single(AssetSingle),
    /// An m-of-n bundle of single entries.
    Multisig {
        /// Chain index.
        index: u32,
        /// Required signer count.
        m: u8,
        /// Total signer count.
        n: u8,
        /// The participating entries, in script order.
        entries: Vec<AssetSingle>,
    },
    /// A BIP32 root with derivation context.
    Bip32Root(AssetBip32Root),
}

impl AssetEntry {
    /// Chain index of the entry.
    #[must_use]
    pub fn index(&self) -> u32 {
        match self {
            Self::Single(single) => single.index,
            Self::Multisig { index, .. } => *index,
            Self::Bip32Root(root) => root.index,
        }
    }

    /// Serializes the entry.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Single(single) => {
                w.put_u8(ASSET_TYPE_SINGLE);
                single.write_to(&mut w);
            }
            Self::Multisig {
                index,
                m,
                n,
                entries,
            } => {
                w.put_u8(ASSET_TYPE_MULTISIG);
                w.put_u32_be(*index);
                w.put_u8(*m);
                w.put_u8(*n);
                w.put_var_int(entries.len() as u64);
                for entry in entries {
                    entry.write_to(&mut w);
                }
            }
            Self::Bip32Root(root) => {
                w.put_u8(ASSET_TYPE_BIP32_ROOT);
                w.put_u32_be(root.index);
                w.put_var_bytes(&root.pub_key);
                match &root.priv_key {
                    Some(enc) => {
                        w.put_u8(1);
                        w.put_var_bytes(&enc.serialize());
                    }
                    None => w.put_u8(0),
                }
                w.put_var_bytes(&root.chaincode);
                w.put_u8(root.depth);
                w.put_u32_be(root.leaf_id);
                w.put_bytes(&root.parent_fingerprint);
                w.put_bytes(&root.seed_fingerprint);
                w.put_var_int(root.derivation_path.len() as u64);
                for step in &root.derivation_path {
                    w.put_u32_be(*step);
                }
            }
        }
        w.into_bytes()
    }

    /// Deserializes an entry.
    pub fn deserialize(data: &[u8]) -> AssetResult<Self> {
        let mut r = Reader::new(data);
        let tag = r.get_u8().map_err(AssetError::Storage)?;
        let entry = match tag {
            ASSET_TYPE_SINGLE => Self::Single(AssetSingle::read_from(&mut r)?),
            ASSET_TYPE_MULTISIG => {
                let index = r.get_u32_be().map_err(AssetError::Storage)?;
                let m = r.get_u8().map_err(AssetError::Storage)?;
                let n = r.get_u8().map_err(AssetError::Storage)?;
                let count = r.get_var_int().map_err(AssetError::Storage)?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(AssetSingle::read_from(&mut r)?);
                }
                Self::Multisig {
                    index,
                    m,
                    n,
                    entries,
                }
            }
            ASSET_TYPE_BIP32_ROOT => {
                let index = r.get_u32_be().map_err(AssetError::Storage)?;
                let pub_key: [u8; 33] = r
                    .get_var_bytes()
                    .map_err(AssetError::Storage)?
                    .try_into()
                    .map_err(|_| {
                        AssetError::Storage(crate::error::StorageError::malformed(
                            "bip32 root public key length",
                        ))
                    })?;
                let priv_key = match r.get_u8().map_err(AssetError::Storage)? {
                    0 => None,
                    _ => Some(EncryptedData::deserialize(
                        r.get_var_bytes().map_err(AssetError::Storage)?,
                    )?),
                };
                let chaincode =
                    SecureBytes::from_slice(r.get_var_bytes().map_err(AssetError::Storage)?);
                let depth = r.get_u8().map_err(AssetError::Storage)?;
                let leaf_id = r.get_u32_be().map_err(AssetError::Storage)?;
                let parent_fingerprint: [u8; 4] = r
                    .get_bytes(4)
                    .map_err(AssetError::Storage)?
                    .try_into()
                    .expect("length checked");
                let seed_fingerprint: [u8; 4] = r
                    .get_bytes(4)
                    .map_err(AssetError::Storage)?
                    .try_into()
                    .expect("length checked");
                let count = r.get_var_int().map_err(AssetError::Storage)?;
                let mut derivation_path = Vec::new();
                for _ in 0..count {
                    derivation_path.push(r.get_u32_be().map_err(AssetError::Storage)?);
                }
                Self::Bip32Root(AssetBip32Root {
                    index,
                    pub_key,
                    priv_key,
                    chaincode,
                    depth,
                    leaf_id,
                    parent_fingerprint,
                    seed_fingerprint,
                    derivation_path,
                })
            }
            other => return Err(AssetError::UnknownAssetType(other)),
        };
        r.expect_end().map_err(AssetError::Storage)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::CipherData;

    fn sample_encrypted() -> EncryptedData {
        EncryptedData {
            cipher_data: CipherData {
                iv: SecureBytes::from_slice(&[1; 16]),
                cipher_text: SecureBytes::from_slice(&[2; 48]),
                kdf_id: Vec::new(),
                encryption_key_id: vec![3; 16],
            },
        }
    }

    #[test]
    fn single_roundtrip() {
        let priv_key = ecc::create_new_private_key();
        let entry = AssetEntry::Single(AssetSingle {
            index: 7,
            pub_key: ecc::compute_public_key(&priv_key, true).unwrap(),
            priv_key: Some(sample_encrypted()),
        });
        let restored = AssetEntry::deserialize(&entry.serialize()).unwrap();
        match restored {
            AssetEntry::Single(single) => {
                assert_eq!(single.index, 7);
                assert!(single.has_private_key());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn watch_only_single_has_no_private_key() {
        let priv_key = ecc::create_new_private_key();
        let single = AssetSingle {
            index: 0,
            pub_key: ecc::compute_public_key(&priv_key, false).unwrap(),
            priv_key: None,
        };
        assert!(matches!(
            single.encrypted_priv_key(),
            Err(AssetError::WatchOnly)
        ));
        // Both key forms recoverable from the stored uncompressed key.
        assert_eq!(
            single.compressed_key().unwrap().to_vec(),
            ecc::compute_public_key(&priv_key, true).unwrap()
        );
    }

    #[test]
    fn multisig_roundtrip() {
        let entries: Vec<AssetSingle> = (0..3)
            .map(|i| AssetSingle {
                index: i,
                pub_key: ecc::compute_public_key(&ecc::create_new_private_key(), true).unwrap(),
                priv_key: None,
            })
            .collect();
        let entry = AssetEntry::Multisig {
            index: 0,
            m: 2,
            n: 3,
            entries,
        };
        match AssetEntry::deserialize(&entry.serialize()).unwrap() {
            AssetEntry::Multisig { m, n, entries, .. } => {
                assert_eq!((m, n), (2, 3));
                assert_eq!(entries.len(), 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn bip32_root_roundtrip() {
        let priv_key = ecc::create_new_private_key();
        let entry = AssetEntry::Bip32Root(AssetBip32Root {
            index: 0,
            pub_key: ecc::compute_public_key(&priv_key, true)
                .unwrap()
                .try_into()
                .unwrap(),
            priv_key: Some(sample_encrypted()),
            chaincode: SecureBytes::from_slice(&[9; 32]),
            depth: 4,
            leaf_id: 0x8000_0000,
            parent_fingerprint: [1, 2, 3, 4],
            seed_fingerprint: [5, 6, 7, 8],
            derivation_path: vec![0x8000_0050, 0x8000_5421, 785],
        });
        match AssetEntry::deserialize(&entry.serialize()).unwrap() {
            AssetEntry::Bip32Root(root) => {
                assert_eq!(root.depth, 4);
                assert_eq!(root.leaf_id, 0x8000_0000);
                assert_eq!(root.seed_fingerprint, [5, 6, 7, 8]);
                assert_eq!(root.derivation_path, vec![0x8000_0050, 0x8000_5421, 785]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_is_reported() {
        assert!(matches!(
            AssetEntry::deserialize(&[0x7f, 0, 0]),
            Err(AssetError::UnknownAssetType(0x7f))
        ));
    }
}
