//! IES record envelope and key-stream derivation.
//!
//! Every on-disk record is an IES packet:
//!
//! ```text
//! ephemeral_pub(33) || iv(16) || AES-CBC(shared_key,
//!     hmac(32) || varint(klen) || key || varint(vlen) || value)
//! ```
//!
//! where `shared_key = SHA-256(compressed(ephemeral_priv * pub_i))` and the
//! HMAC binds the plaintext to its 4-byte big-endian record counter so two
//! ciphertexts cannot be swapped between storage slots.
//!
//! The per-sub-DB key stream is anchored in the control root:
//!
//! ```text
//! salted_root         = HMAC-SHA256(key = control_salt, msg = control_root)
//! (enc_priv, mac_key) = split(HMAC-SHA512(key = be32(counter), msg = salted_root))
//! ```

use crate::buffer::SecureBytes;
use crate::codec::{Reader, Writer};
use crate::crypto::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, AES_IV_LEN};
use crate::crypto::ecc;
use crate::crypto::hashes::hmac_sha256;
use crate::crypto::hashes::hmac_sha512;
use crate::crypto::prng;
use crate::error::{StorageError, StorageResult};

/// Plaintext value of a cycle-marker record.
pub const CYCLE_FLAG: &[u8] = b"cycle";

/// Leading bytes of an erasure-sentinel value.
pub const ERASED_FLAG: &[u8] = b"erased";

/// Minimum length of a well-formed packet: ephemeral key, IV, one AES block.
pub const MIN_PACKET_LEN: usize = ecc::PUBKEY_COMPRESSED_LEN + AES_IV_LEN + AES_IV_LEN;

/// Encryption and MAC keys for one key-pair counter.
pub struct RecordKeyPair {
    enc_priv: SecureBytes,
    enc_pub: [u8; ecc::PUBKEY_COMPRESSED_LEN],
    mac_key: SecureBytes,
}

/// Derives the per-sub-DB salted root from the control root.
#[must_use]
pub fn salted_root(control_salt: &[u8], control_root: &[u8]) -> SecureBytes {
    SecureBytes::from_slice(&hmac_sha256(control_salt, control_root))
}

/// Derives the key pair for a key-pair counter.
pub fn key_pair_for(salted_root: &[u8], counter: u32) -> StorageResult<RecordKeyPair> {
    let stretched = hmac_sha512(&counter.to_be_bytes(), salted_root);
    let enc_priv = SecureBytes::from_slice(&stretched[..32]);
    let mac_key = SecureBytes::from_slice(&stretched[32..]);

    if !ecc::private_key_valid(&enc_priv) {
        // 2^-128 territory, but the stream would be undecryptable.
        return Err(StorageError::corrupt(
            "key stream produced an invalid decryption key",
        ));
    }
    let enc_pub = ecc::compute_public_key(&enc_priv, true)?
        .try_into()
        .expect("compressed public key is 33 bytes");

    Ok(RecordKeyPair {
        enc_priv,
        enc_pub,
        mac_key,
    })
}

/// HMAC binding a logical pair to its storage slot.
fn record_hmac(mac_key: &[u8], data_key: &[u8], data_val: &[u8], record_counter: u32) -> [u8; 32] {
    let mut w = Writer::new();
    w.put_var_bytes(data_key);
    w.put_var_bytes(data_val);
    w.put_u32_be(record_counter);
    hmac_sha256(mac_key, w.as_slice())
}

/// Encrypts a logical `(key, value)` pair into an IES packet bound to
/// `record_counter`.
pub fn encrypt_record(
    key_pair: &RecordKeyPair,
    record_counter: u32,
    data_key: &[u8],
    data_val: &[u8],
) -> StorageResult<Vec<u8>> {
    let ephemeral = ecc::create_new_private_key();
    let ephemeral_pub = ecc::compute_public_key(&ephemeral, true)?;
    let shared = ecc::ecdh_shared_key(&key_pair.enc_pub, &ephemeral)?;
    let iv = prng::generate_random(AES_IV_LEN);

    let hmac = record_hmac(&key_pair.mac_key, data_key, data_val, record_counter);
    let mut plain = Writer::new();
    plain.put_bytes(&hmac);
    plain.put_var_bytes(data_key);
    plain.put_var_bytes(data_val);

    let cipher_text = aes_cbc_encrypt(&shared, &iv, plain.as_slice())?;

    let mut packet = Writer::new();
    packet.put_bytes(&ephemeral_pub);
    packet.put_bytes(&iv);
    packet.put_bytes(&cipher_text);
    Ok(packet.into_bytes())
}

/// Decrypts an IES packet and verifies its slot binding.
///
/// # Errors
///
/// * [`StorageError::Malformed`] — packet too short, ragged ciphertext,
///   short varint, or trailing plaintext bytes.
/// * [`StorageError::BadKey`] — the packet does not decrypt under this key
///   pair (wrong key-pair counter).
/// * [`StorageError::Tampered`] — decryption succeeded but the HMAC does not
///   match this record counter.
pub fn decrypt_record(
    key_pair: &RecordKeyPair,
    record_counter: u32,
    packet: &[u8],
) -> StorageResult<(Vec<u8>, Vec<u8>)> {
    if packet.len() < MIN_PACKET_LEN {
        return Err(StorageError::malformed("IES packet too short"));
    }
    let mut r = Reader::new(packet);
    let ephemeral_pub = r.get_bytes(ecc::PUBKEY_COMPRESSED_LEN)?;
    let iv = r.get_bytes(AES_IV_LEN)?;
    let cipher_text = r.get_bytes(r.remaining())?;

    if !ecc::public_key_valid(ephemeral_pub) {
        return Err(StorageError::malformed("IES packet ephemeral key"));
    }

    let shared = ecc::ecdh_shared_key(ephemeral_pub, &key_pair.enc_priv)?;
    let plain = aes_cbc_decrypt(&shared, iv, cipher_text)?;

    let mut pr = Reader::new(&plain);
    let hmac = pr.get_bytes(32).map_err(|_| StorageError::BadKey)?;
    let data_key = pr.get_var_bytes()?.to_vec();
    let data_val = pr.get_var_bytes()?.to_vec();
    pr.expect_end()?;

    let expected = record_hmac(&key_pair.mac_key, &data_key, &data_val, record_counter);
    if hmac != expected.as_slice() {
        return Err(StorageError::Tampered(format!(
            "record counter {record_counter}"
        )));
    }

    Ok((data_key, data_val))
}

/// Builds the plaintext value of an erasure sentinel for `erased_counter`.
#[must_use]
pub fn erasure_value(erased_counter: u32) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_bytes(ERASED_FLAG);
    w.put_var_int(4);
    w.put_u32_be(erased_counter);
    w.into_bytes()
}

/// Parses an erasure-sentinel value back into the erased record counter.
pub fn parse_erasure_value(value: &[u8]) -> StorageResult<u32> {
    let mut r = Reader::new(value);
    let flag = r.get_bytes(ERASED_FLAG.len())?;
    if flag != ERASED_FLAG {
        return Err(StorageError::malformed("erasure sentinel flag"));
    }
    if r.get_var_int()? != 4 {
        return Err(StorageError::malformed("erasure sentinel length"));
    }
    let counter = r.get_u32_be()?;
    r.expect_end()?;
    Ok(counter)
}

/// Produces a same-length filler packet under a fresh ephemeral key, used to
/// overwrite a record slot before deletion so none of the original
/// ciphertext survives on disk.
#[must_use]
pub fn filler_packet(len: usize) -> Vec<u8> {
    let ephemeral = ecc::create_new_private_key();
    let ephemeral_pub = ecc::compute_public_key(&ephemeral, true)
        .expect("fresh private keys always yield a public key");

    let mut packet = Vec::with_capacity(len);
    packet.extend_from_slice(&ephemeral_pub);
    if len > packet.len() {
        packet.extend_from_slice(&prng::generate_random(len - packet.len()));
    }
    packet.truncate(len);
    packet
}
