//! Address entries.
//!
//! An [`AddressEntry`] describes how one asset's public material turns into
//! a spendable script: bare key forms, SegWit forms, bare multisig, and the
//! nested P2SH/P2WSH wrappers. Each entry produces its script, its address
//! hash, the prefixed hash used in watcher sets, and its address string.

use crate::crypto::hashes::{hash160, sha256};
use crate::error::{AssetError, AssetResult, StorageError};

use super::encode::{encode_base58, encode_segwit};
use super::network::{
    current_params, SCRIPT_PREFIX_MULTISIG, SCRIPT_PREFIX_P2WPKH, SCRIPT_PREFIX_P2WSH,
};

const OP_1: u8 = 0x51;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

/// Address kinds an account can issue, persisted per account and per index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressType {
    /// Legacy pay-to-pubkey-hash over the compressed key.
    P2pkh,
    /// Legacy pay-to-pubkey-hash over the uncompressed key.
    P2pkhUncompressed,
    /// Bare pay-to-pubkey.
    P2pk,
    /// Native SegWit v0 pay-to-witness-pubkey-hash.
    P2wpkh,
    /// P2WPKH nested inside P2SH.
    NestedP2wpkh,
    /// Bare pay-to-pubkey nested inside P2SH.
    NestedP2pk,
}

impl AddressType {
    /// Persistence tag.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::P2pkh => 0x01,
            Self::P2pkhUncompressed => 0x02,
            Self::P2pk => 0x03,
            Self::P2wpkh => 0x04,
            Self::NestedP2wpkh => 0x05,
            Self::NestedP2pk => 0x06,
        }
    }

    /// Reverses [`to_u8`](Self::to_u8).
    pub fn from_u8(tag: u8) -> AssetResult<Self> {
        match tag {
            0x01 => Ok(Self::P2pkh),
            0x02 => Ok(Self::P2pkhUncompressed),
            0x03 => Ok(Self::P2pk),
            0x04 => Ok(Self::P2wpkh),
            0x05 => Ok(Self::NestedP2wpkh),
            0x06 => Ok(Self::NestedP2pk),
            other => Err(AssetError::Storage(StorageError::corrupt(format!(
                "unknown address type {other:#04x}"
            )))),
        }
    }
}

/// One spendable script shape over concrete public material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEntry {
    /// Bare pay-to-pubkey.
    P2pk {
        /// Public key (compressed or uncompressed).
        pub_key: Vec<u8>,
    },
    /// Pay-to-pubkey-hash; the key's encoding decides the hash preimage.
    P2pkh {
        /// Public key (compressed or uncompressed).
        pub_key: Vec<u8>,
    },
    /// SegWit v0 pay-to-witness-pubkey-hash; enforces compressed keys.
    P2wpkh {
        /// Compressed public key.
        pub_key: Vec<u8>,
    },
    /// Bare m-of-n multisig.
    Multisig {
        /// Required signer count.
        m: u8,
        /// Compressed public keys, in script order.
        pub_keys: Vec<Vec<u8>>,
    },
    /// Script-hash wrapper.
    P2sh {
        /// The nested entry whose script is hashed.
        inner: Box<AddressEntry>,
    },
    /// Witness-script-hash wrapper.
    P2wsh {
        /// The nested entry whose script is hashed.
        inner: Box<AddressEntry>,
    },
}

impl AddressEntry {
    /// Builds the entry for an address type over a compressed /
    /// uncompressed key pair.
    pub fn from_type(
        addr_type: AddressType,
        compressed: &[u8],
        uncompressed: &[u8],
    ) -> AssetResult<Self> {
        Ok(match addr_type {
            AddressType::P2pkh => Self::P2pkh {
                pub_key: compressed.to_vec(),
            },
            AddressType::P2pkhUncompressed => Self::P2pkh {
                pub_key: uncompressed.to_vec(),
            },
            AddressType::P2pk => Self::P2pk {
                pub_key: compressed.to_vec(),
            },
            AddressType::P2wpkh => Self::P2wpkh {
                pub_key: compressed.to_vec(),
            },
            AddressType::NestedP2wpkh => Self::P2sh {
                inner: Box::new(Self::P2wpkh {
                    pub_key: compressed.to_vec(),
                }),
            },
            AddressType::NestedP2pk => Self::P2sh {
                inner: Box::new(Self::P2pk {
                    pub_key: compressed.to_vec(),
                }),
            },
        })
    }

    /// The script this entry locks to (the preimage of nested hashes).
    #[must_use]
    pub fn script(&self) -> Vec<u8> {
        match self {
            Self::P2pk { pub_key } => {
                let mut script = Vec::with_capacity(pub_key.len() + 2);
                script.push(pub_key.len() as u8);
                script.extend_from_slice(pub_key);
                script.push(OP_CHECKSIG);
                script
            }
            Self::P2pkh { pub_key } => {
                let hash = hash160(pub_key);
                let mut script = Vec::with_capacity(25);
                script.push(OP_DUP);
                script.push(OP_HASH160);
                script.push(20);
                script.extend_from_slice(&hash);
                script.push(OP_EQUALVERIFY);
                script.push(OP_CHECKSIG);
                script
            }
            Self::P2wpkh { pub_key } => {
                let hash = hash160(pub_key);
                let mut script = Vec::with_capacity(22);
                script.push(0x00);
                script.push(20);
                script.extend_from_slice(&hash);
                script
            }
            Self::Multisig { m, pub_keys } => {
                let mut script = Vec::new();
                script.push(OP_1 + m - 1);
                for key in pub_keys {
                    script.push(key.len() as u8);
                    script.extend_from_slice(key);
                }
                script.push(OP_1 + pub_keys.len() as u8 - 1);
                script.push(OP_CHECKMULTISIG);
                script
            }
            Self::P2sh { inner } | Self::P2wsh { inner } => inner.script(),
        }
    }

    /// The public material this entry commits to (the salted or derived key
    /// for key-based entries, the nested script otherwise).
    #[must_use]
    pub fn preimage(&self) -> Vec<u8> {
        match self {
            Self::P2pk { pub_key } | Self::P2pkh { pub_key } | Self::P2wpkh { pub_key } => {
                pub_key.clone()
            }
            Self::Multisig { .. } => self.script(),
            Self::P2sh { inner } | Self::P2wsh { inner } => inner.script(),
        }
    }

    /// The address hash (20 bytes, or 32 for P2WSH).
    #[must_use]
    pub fn hash(&self) -> Vec<u8> {
        match self {
            Self::P2pk { pub_key } | Self::P2pkh { pub_key } | Self::P2wpkh { pub_key } => {
                hash160(pub_key).to_vec()
            }
            Self::Multisig { .. } => hash160(&self.script()).to_vec(),
            Self::P2sh { inner } => hash160(&inner.script()).to_vec(),
            Self::P2wsh { inner } => sha256(&inner.script()).to_vec(),
        }
    }

    /// The hash prefixed with its script-kind byte, as stored in watcher
    /// hash sets.
    #[must_use]
    pub fn prefixed_hash(&self) -> Vec<u8> {
        let params = current_params();
        let prefix = match self {
            Self::P2pk { .. } | Self::P2pkh { .. } => params.p2pkh_prefix,
            Self::P2wpkh { .. } => SCRIPT_PREFIX_P2WPKH,
            Self::Multisig { .. } => SCRIPT_PREFIX_MULTISIG,
            Self::P2sh { .. } => params.p2sh_prefix,
            Self::P2wsh { .. } => SCRIPT_PREFIX_P2WSH,
        };
        let mut out = Vec::with_capacity(33);
        out.push(prefix);
        out.extend_from_slice(&self.hash());
        out
    }

    /// The address string for this entry.
    pub fn address(&self) -> AssetResult<String> {
        let params = current_params();
        match self {
            Self::P2pk { pub_key } | Self::P2pkh { pub_key } => {
                Ok(encode_base58(params.p2pkh_prefix, &hash160(pub_key)))
            }
            Self::P2wpkh { pub_key } => encode_segwit(&hash160(pub_key)),
            Self::P2sh { inner } => Ok(encode_base58(
                params.p2sh_prefix,
                &hash160(&inner.script()),
            )),
            Self::P2wsh { inner } => encode_segwit(&sha256(&inner.script())),
            Self::Multisig { .. } => Err(AssetError::InvalidAddress(
                "bare multisig has no address form".to_string(),
            )),
        }
    }
}
