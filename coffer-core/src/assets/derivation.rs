//! Deterministic key derivation.
//!
//! [`Bip32Node`] implements BIP32 hardened and non-hardened derivation with
//! extended-key serialization. The `armory135` functions implement the
//! historical chained derivation of Armory 1.35 wallets:
//!
//! ```text
//! chaincode = HMAC-SHA256(key = hash256(root), msg = "Derive Chaincode from Root Key")
//! k_{i+1}   = k_i * (hash256(uncompressed(P_i)) XOR chaincode) mod n
//! P_{i+1}   = P_i * (hash256(uncompressed(P_i)) XOR chaincode)
//! ```
//!
//! The multiplier mixes the hash of the public key into the chaincode so
//! chain generation is not a bare scalar ladder.

use crate::address::network::current_params;
use crate::buffer::SecureBytes;
use crate::crypto::ecc;
use crate::crypto::hashes::{hash160, hash256, hmac_sha512};
use crate::error::{AssetError, AssetResult};

/// Mask marking hardened child indices.
pub const HARDENED: u32 = 0x8000_0000;

/// A BIP32 node: one point on a derivation path.
#[derive(Clone)]
pub struct Bip32Node {
    priv_key: Option<SecureBytes>,
    pub_key: [u8; 33],
    chaincode: SecureBytes,
    depth: u8,
    leaf_id: u32,
    parent_fingerprint: [u8; 4],
}

impl Bip32Node {
    /// Builds the master node from a seed.
    pub fn init_from_seed(seed: &[u8]) -> AssetResult<Self> {
        let stretched = hmac_sha512(b"Bitcoin seed", seed);
        let priv_key = SecureBytes::from_slice(&stretched[..32]);
        if !ecc::private_key_valid(&priv_key) {
            return Err(AssetError::InvalidDerivationPath(
                "seed produces an invalid master key".to_string(),
            ));
        }
        let pub_key = ecc::compute_public_key(&priv_key, true)?
            .try_into()
            .expect("compressed public key is 33 bytes");
        Ok(Self {
            priv_key: Some(priv_key),
            pub_key,
            chaincode: SecureBytes::from_slice(&stretched[32..]),
            depth: 0,
            leaf_id: 0,
            parent_fingerprint: [0; 4],
        })
    }

    /// Builds a node from public parts (watch-only reconstruction).
    pub fn init_from_public(
        pub_key: &[u8],
        chaincode: SecureBytes,
        depth: u8,
        leaf_id: u32,
        parent_fingerprint: [u8; 4],
    ) -> AssetResult<Self> {
        let pub_key = ecc::compress_point(pub_key).map_err(AssetError::Storage)?;
        Ok(Self {
            priv_key: None,
            pub_key,
            chaincode,
            depth,
            leaf_id,
            parent_fingerprint,
        })
    }

    /// Builds a node from private parts.
    pub fn init_from_private(
        priv_key: SecureBytes,
        chaincode: SecureBytes,
        depth: u8,
        leaf_id: u32,
        parent_fingerprint: [u8; 4],
    ) -> AssetResult<Self> {
        let pub_key = ecc::compute_public_key(&priv_key, true)?
            .try_into()
            .expect("compressed public key is 33 bytes");
        Ok(Self {
            priv_key: Some(priv_key),
            pub_key,
            chaincode,
            depth,
            leaf_id,
            parent_fingerprint,
        })
    }

    /// Parses an extended key in Base58Check form.
    pub fn init_from_base58(encoded: &str) -> AssetResult<Self> {
        let params = current_params();
        let payload = bs58::decode(encoded)
            .with_check(None)
            .into_vec()
            .map_err(|_| AssetError::InvalidAddress(encoded.to_string()))?;
        if payload.len() != 78 {
            return Err(AssetError::InvalidAddress(encoded.to_string()));
        }

        let version: [u8; 4] = payload[0..4].try_into().expect("length checked");
        let depth = payload[4];
        let parent_fingerprint: [u8; 4] = payload[5..9].try_into().expect("length checked");
        let leaf_id = u32::from_be_bytes(payload[9..13].try_into().expect("length checked"));
        let chaincode = SecureBytes::from_slice(&payload[13..45]);
        let key_field = &payload[45..78];

        if version == params.xprv_version {
            if key_field[0] != 0x00 {
                return Err(AssetError::InvalidAddress(encoded.to_string()));
            }
            Self::init_from_private(
                SecureBytes::from_slice(&key_field[1..]),
                chaincode,
                depth,
                leaf_id,
                parent_fingerprint,
            )
        } else if version == params.xpub_version {
            Self::init_from_public(key_field, chaincode, depth, leaf_id, parent_fingerprint)
        } else {
            Err(AssetError::InvalidAddress(encoded.to_string()))
        }
    }

    /// Serializes the node as an extended key (private form when private
    /// material is present).
    #[must_use]
    pub fn to_base58(&self) -> String {
        let params = current_params();
        let mut payload = Vec::with_capacity(78);
        match &self.priv_key {
            Some(priv_key) => {
                payload.extend_from_slice(&params.xprv_version);
                payload.push(self.depth);
                payload.extend_from_slice(&self.parent_fingerprint);
                payload.extend_from_slice(&self.leaf_id.to_be_bytes());
                payload.extend_from_slice(&self.chaincode);
                payload.push(0x00);
                payload.extend_from_slice(priv_key);
            }
            None => {
                payload.extend_from_slice(&params.xpub_version);
                payload.push(self.depth);
                payload.extend_from_slice(&self.parent_fingerprint);
                payload.extend_from_slice(&self.leaf_id.to_be_bytes());
                payload.extend_from_slice(&self.chaincode);
                payload.extend_from_slice(&self.pub_key);
            }
        }
        bs58::encode(payload).with_check().into_string()
    }

    /// Derives the child at `index` in place, keeping private material.
    pub fn derive_private(&mut self, index: u32) -> AssetResult<()> {
        let priv_key = self.priv_key.as_ref().ok_or(AssetError::WatchOnly)?;

        let mut data = Vec::with_capacity(37);
        if index & HARDENED != 0 {
            data.push(0x00);
            data.extend_from_slice(priv_key);
        } else {
            data.extend_from_slice(&self.pub_key);
        }
        data.extend_from_slice(&index.to_be_bytes());

        let stretched = hmac_sha512(&self.chaincode, &data);
        let child_priv = ecc::privkey_add_tweak(priv_key, &stretched[..32])
            .map_err(AssetError::Storage)?;
        let child_pub = ecc::compute_public_key(&child_priv, true)?;

        self.parent_fingerprint = self.fingerprint();
        self.priv_key = Some(child_priv);
        self.pub_key = child_pub.try_into().expect("compressed public key is 33 bytes");
        self.chaincode = SecureBytes::from_slice(&stretched[32..]);
        self.depth += 1;
        self.leaf_id = index;
        Ok(())
    }

    /// Derives the non-hardened child at `index` in place using public
    /// material only.
    pub fn derive_public(&mut self, index: u32) -> AssetResult<()> {
        if index & HARDENED != 0 {
            return Err(AssetError::InvalidDerivationPath(format!(
                "hardened step {index:#010x} requires private material"
            )));
        }

        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.pub_key);
        data.extend_from_slice(&index.to_be_bytes());

        let stretched = hmac_sha512(&self.chaincode, &data);
        let child_pub = ecc::pubkey_add_tweak(&self.pub_key, &stretched[..32])
            .map_err(AssetError::Storage)?;

        self.parent_fingerprint = self.fingerprint();
        self.priv_key = None;
        self.pub_key = child_pub.try_into().expect("compressed public key is 33 bytes");
        self.chaincode = SecureBytes::from_slice(&stretched[32..]);
        self.depth += 1;
        self.leaf_id = index;
        Ok(())
    }

    /// Returns a copy with private material stripped.
    #[must_use]
    pub fn get_public_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.priv_key = None;
        copy
    }

    /// BIP32 fingerprint of this node.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 4] {
        hash160(&self.pub_key)[..4]
            .try_into()
            .expect("hash160 yields 20 bytes")
    }

    /// Fingerprint of the parent node.
    #[must_use]
    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    /// Depth on the derivation path.
    #[must_use]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Child index of this node.
    #[must_use]
    pub fn leaf_id(&self) -> u32 {
        self.leaf_id
    }

    /// Chain code.
    #[must_use]
    pub fn chaincode(&self) -> &SecureBytes {
        &self.chaincode
    }

    /// Compressed public key.
    #[must_use]
    pub fn public_key(&self) -> &[u8; 33] {
        &self.pub_key
    }

    /// Private key, or [`AssetError::WatchOnly`] when stripped.
    pub fn private_key(&self) -> AssetResult<&SecureBytes> {
        self.priv_key.as_ref().ok_or(AssetError::WatchOnly)
    }

    /// Returns `true` when private material is present.
    #[must_use]
    pub fn has_private_key(&self) -> bool {
        self.priv_key.is_some()
    }
}

impl std::fmt::Debug for Bip32Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bip32Node")
            .field("depth", &self.depth)
            .field("leaf_id", &self.leaf_id)
            .field("watch_only", &self.priv_key.is_none())
            .finish_non_exhaustive()
    }
}

/// Armory 1.35 chained derivation.
pub mod armory135 {
    use super::{
        ecc, hash256, AssetError, AssetResult, SecureBytes,
    };
    use crate::crypto::hashes::hmac_sha256;

    /// Derives the chaincode of an Armory 1.35 wallet from its root key.
    #[must_use]
    pub fn compute_chaincode(root: &[u8]) -> SecureBytes {
        SecureBytes::from_slice(&hmac_sha256(
            &hash256(root),
            b"Derive Chaincode from Root Key",
        ))
    }

    /// The per-step multiplier: `hash256(uncompressed(P)) XOR chaincode`.
    fn chain_multiplier(pub_uncompressed: &[u8], chaincode: &[u8]) -> [u8; 32] {
        let digest = hash256(pub_uncompressed);
        let mut out = [0u8; 32];
        for (o, (a, b)) in out.iter_mut().zip(digest.iter().zip(chaincode.iter())) {
            *o = a ^ b;
        }
        out
    }

    /// Derives the next private key in the chain.
    pub fn chained_private_key(
        priv_key: &[u8],
        chaincode: &[u8],
    ) -> AssetResult<SecureBytes> {
        let pub_key = ecc::compute_public_key(priv_key, false)?;
        let multiplier = chain_multiplier(&pub_key, chaincode);
        ecc::privkey_scalar_multiply(priv_key, &multiplier).map_err(AssetError::Storage)
    }

    /// Derives the next public key in the chain (uncompressed in and out).
    pub fn chained_public_key(pub_key: &[u8], chaincode: &[u8]) -> AssetResult<Vec<u8>> {
        let uncompressed = ecc::uncompress_point(pub_key)?;
        let multiplier = chain_multiplier(&uncompressed, chaincode);
        ecc::pubkey_scalar_multiply(&uncompressed, &multiplier).map_err(AssetError::Storage)
    }
}
