//! secp256k1 operations.
//!
//! Thin byte-oriented façade over the `secp256k1` crate: scalar validation,
//! public-key computation, point compression, tweak arithmetic for
//! derivation and ECDH, and deterministic (RFC 6979) signing.

use once_cell::sync::Lazy;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};

use crate::buffer::SecureBytes;
use crate::crypto::hashes::sha256;
use crate::crypto::prng;
use crate::error::{StorageError, StorageResult};

/// Compressed public key length in bytes.
pub const PUBKEY_COMPRESSED_LEN: usize = 33;

/// Uncompressed public key length in bytes.
pub const PUBKEY_UNCOMPRESSED_LEN: usize = 65;

/// Private scalar length in bytes.
pub const PRIVKEY_LEN: usize = 32;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

fn parse_secret(priv_key: &[u8]) -> StorageResult<SecretKey> {
    SecretKey::from_slice(priv_key)
        .map_err(|_| StorageError::InvalidArgument("invalid private scalar".into()))
}

fn parse_public(pub_key: &[u8]) -> StorageResult<PublicKey> {
    PublicKey::from_slice(pub_key)
        .map_err(|_| StorageError::InvalidArgument("invalid public key".into()))
}

fn parse_scalar(scalar: &[u8]) -> StorageResult<Scalar> {
    let arr: [u8; 32] = scalar
        .try_into()
        .map_err(|_| StorageError::InvalidArgument("scalar must be 32 bytes".into()))?;
    Scalar::from_be_bytes(arr)
        .map_err(|_| StorageError::InvalidArgument("scalar exceeds curve order".into()))
}

/// Serializes a point in the same form (compressed or uncompressed) as a
/// reference encoding.
fn serialize_like(point: &PublicKey, reference: &[u8]) -> Vec<u8> {
    if reference.len() == PUBKEY_UNCOMPRESSED_LEN {
        point.serialize_uncompressed().to_vec()
    } else {
        point.serialize().to_vec()
    }
}

/// Returns `true` if `priv_key` is a valid scalar in `[1, n-1]`.
#[must_use]
pub fn private_key_valid(priv_key: &[u8]) -> bool {
    priv_key.len() == PRIVKEY_LEN && SecretKey::from_slice(priv_key).is_ok()
}

/// Returns `true` if `pub_key` parses as a point on the curve.
#[must_use]
pub fn public_key_valid(pub_key: &[u8]) -> bool {
    PublicKey::from_slice(pub_key).is_ok()
}

/// Draws private scalars from the CSPRNG until a valid one appears.
#[must_use]
pub fn create_new_private_key() -> SecureBytes {
    loop {
        let candidate = prng::generate_random(PRIVKEY_LEN);
        if private_key_valid(&candidate) {
            return candidate;
        }
    }
}

/// Computes the public point of a private scalar.
pub fn compute_public_key(priv_key: &[u8], compressed: bool) -> StorageResult<Vec<u8>> {
    let sk = parse_secret(priv_key)?;
    let pk = PublicKey::from_secret_key(&SECP, &sk);
    Ok(if compressed {
        pk.serialize().to_vec()
    } else {
        pk.serialize_uncompressed().to_vec()
    })
}

/// Compresses a 65-byte public key to 33 bytes.
pub fn compress_point(pub_key: &[u8]) -> StorageResult<[u8; PUBKEY_COMPRESSED_LEN]> {
    Ok(parse_public(pub_key)?.serialize())
}

/// Expands a 33-byte public key to 65 bytes.
pub fn uncompress_point(pub_key: &[u8]) -> StorageResult<[u8; PUBKEY_UNCOMPRESSED_LEN]> {
    Ok(parse_public(pub_key)?.serialize_uncompressed())
}

/// Multiplies a public point by a scalar, preserving the input encoding.
pub fn pubkey_scalar_multiply(pub_key: &[u8], scalar: &[u8]) -> StorageResult<Vec<u8>> {
    let pk = parse_public(pub_key)?;
    let s = parse_scalar(scalar)?;
    let product = pk
        .mul_tweak(&SECP, &s)
        .map_err(|_| StorageError::InvalidArgument("degenerate scalar multiply".into()))?;
    Ok(serialize_like(&product, pub_key))
}

/// Multiplies a private scalar by another scalar mod n.
pub fn privkey_scalar_multiply(priv_key: &[u8], scalar: &[u8]) -> StorageResult<SecureBytes> {
    let sk = parse_secret(priv_key)?;
    let s = parse_scalar(scalar)?;
    let product = sk
        .mul_tweak(&s)
        .map_err(|_| StorageError::InvalidArgument("degenerate scalar multiply".into()))?;
    Ok(SecureBytes::from_slice(&product.secret_bytes()))
}

/// Adds a scalar to a private key mod n (BIP32 child derivation).
pub fn privkey_add_tweak(priv_key: &[u8], tweak: &[u8]) -> StorageResult<SecureBytes> {
    let sk = parse_secret(priv_key)?;
    let s = parse_scalar(tweak)?;
    let sum = sk
        .add_tweak(&s)
        .map_err(|_| StorageError::InvalidArgument("tweak produces invalid key".into()))?;
    Ok(SecureBytes::from_slice(&sum.secret_bytes()))
}

/// Adds `tweak * G` to a public point (BIP32 public child derivation).
pub fn pubkey_add_tweak(pub_key: &[u8], tweak: &[u8]) -> StorageResult<Vec<u8>> {
    let pk = parse_public(pub_key)?;
    let s = parse_scalar(tweak)?;
    let sum = pk
        .add_exp_tweak(&SECP, &s)
        .map_err(|_| StorageError::InvalidArgument("tweak produces invalid point".into()))?;
    Ok(serialize_like(&sum, pub_key))
}

/// Computes the ECDH shared encryption key: SHA-256 of the compressed
/// product point `scalar * point`.
pub fn ecdh_shared_key(pub_key: &[u8], priv_key: &[u8]) -> StorageResult<SecureBytes> {
    let pk = parse_public(pub_key)?;
    let s = parse_scalar(priv_key)?;
    let shared = pk
        .mul_tweak(&SECP, &s)
        .map_err(|_| StorageError::InvalidArgument("degenerate ECDH scalar".into()))?;
    Ok(SecureBytes::from_slice(&sha256(&shared.serialize())))
}

/// Signs `data` with deterministic RFC 6979 nonces over SHA-256, returning a
/// low-S normalized DER signature.
pub fn sign(data: &[u8], priv_key: &[u8]) -> StorageResult<Vec<u8>> {
    let sk = parse_secret(priv_key)?;
    let msg = Message::from_digest(sha256(data));
    let mut sig = SECP.sign_ecdsa(&msg, &sk);
    sig.normalize_s();
    Ok(sig.serialize_der().to_vec())
}

/// Verifies a DER signature over `data`.
#[must_use]
pub fn verify(data: &[u8], sig: &[u8], pub_key: &[u8]) -> bool {
    let Ok(pk) = PublicKey::from_slice(pub_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(sig) else {
        return false;
    };
    let msg = Message::from_digest(sha256(data));
    SECP.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_range_checks() {
        assert!(!private_key_valid(&[0u8; 32]));
        assert!(private_key_valid(&[1u8; 32]));
        // n itself is out of range.
        let order =
            hex::decode("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141")
                .unwrap();
        assert!(!private_key_valid(&order));
    }

    #[test]
    fn compress_uncompress_roundtrip() {
        let priv_key = create_new_private_key();
        let full = compute_public_key(&priv_key, false).unwrap();
        let compressed = compress_point(&full).unwrap();
        assert_eq!(compressed.to_vec(), compute_public_key(&priv_key, true).unwrap());
        assert_eq!(uncompress_point(&compressed).unwrap().to_vec(), full);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = create_new_private_key();
        let b = create_new_private_key();
        let pub_a = compute_public_key(&a, true).unwrap();
        let pub_b = compute_public_key(&b, true).unwrap();

        let ab = ecdh_shared_key(&pub_b, &a).unwrap();
        let ba = ecdh_shared_key(&pub_a, &b).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn scalar_multiply_matches_on_both_sides() {
        let priv_key = create_new_private_key();
        let salt = create_new_private_key();
        let pub_key = compute_public_key(&priv_key, true).unwrap();

        let salted_priv = privkey_scalar_multiply(&priv_key, &salt).unwrap();
        let salted_pub = pubkey_scalar_multiply(&pub_key, &salt).unwrap();
        assert_eq!(
            compute_public_key(&salted_priv, true).unwrap(),
            salted_pub
        );
    }

    #[test]
    fn sign_verify_deterministic() {
        let priv_key = create_new_private_key();
        let pub_key = compute_public_key(&priv_key, true).unwrap();

        let sig1 = sign(b"message", &priv_key).unwrap();
        let sig2 = sign(b"message", &priv_key).unwrap();
        assert_eq!(sig1, sig2);
        assert!(verify(b"message", &sig1, &pub_key));
        assert!(!verify(b"other message", &sig1, &pub_key));
    }
}
