//! Encrypted-object model.
//!
//! [`CipherData`] is one AES-CBC envelope tagged with the KDF and
//! encryption-key pair that produced it. A [`MasterKey`] is a 32-byte
//! symmetric key encrypted under one or more passphrase slots — every slot
//! decrypts to the same plaintext. [`EncryptedData`] is a single-slot
//! object (wallet seeds, per-asset private keys) encrypted under a master
//! key.

use crate::buffer::SecureBytes;
use crate::codec::{Reader, Writer};
use crate::crypto::cipher::AES_IV_LEN;
use crate::crypto::hashes::hmac_sha256;
use crate::error::{StorageError, StorageResult};

/// Length of encryption-key identifiers in bytes.
pub const KEY_ID_LEN: usize = 16;

/// Computes the identity of an encryption key from its raw bytes.
///
/// Recomputable from a decrypted candidate, which is how a wrong passphrase
/// is detected: the candidate's id will not match the stored one.
#[must_use]
pub fn encryption_key_id(key: &[u8]) -> Vec<u8> {
    hmac_sha256(key, b"master key id")[..KEY_ID_LEN].to_vec()
}

/// One encryption envelope: an IV and ciphertext tagged by the KDF and
/// key that protect it.
#[derive(Clone)]
pub struct CipherData {
    /// AES-CBC initialization vector.
    pub iv: SecureBytes,
    /// AES-CBC ciphertext.
    pub cipher_text: SecureBytes,
    /// Id of the KDF whose derived key encrypts this slot; empty when the
    /// encrypting key is used raw (default key or master key).
    pub kdf_id: Vec<u8>,
    /// Id of the key that encrypts this slot.
    pub encryption_key_id: Vec<u8>,
}

impl CipherData {
    /// Serializes the envelope.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_var_bytes(&self.iv);
        w.put_var_bytes(&self.cipher_text);
        w.put_var_bytes(&self.kdf_id);
        w.put_var_bytes(&self.encryption_key_id);
        w.into_bytes()
    }

    fn read_from(r: &mut Reader<'_>) -> StorageResult<Self> {
        let iv = SecureBytes::from_slice(r.get_var_bytes()?);
        if iv.len() != AES_IV_LEN {
            return Err(StorageError::malformed("cipher data iv length"));
        }
        Ok(Self {
            iv,
            cipher_text: SecureBytes::from_slice(r.get_var_bytes()?),
            kdf_id: r.get_var_bytes()?.to_vec(),
            encryption_key_id: r.get_var_bytes()?.to_vec(),
        })
    }

    /// Deserializes an envelope.
    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        let mut r = Reader::new(data);
        let out = Self::read_from(&mut r)?;
        r.expect_end()?;
        Ok(out)
    }
}

impl std::fmt::Debug for CipherData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherData")
            .field("kdf_id", &hex::encode(&self.kdf_id))
            .field("encryption_key_id", &hex::encode(&self.encryption_key_id))
            .finish_non_exhaustive()
    }
}

/// A single-slot encrypted payload (seed or private key).
#[derive(Clone, Debug)]
pub struct EncryptedData {
    /// The one envelope protecting the payload.
    pub cipher_data: CipherData,
}

impl EncryptedData {
    /// Serializes the object.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        self.cipher_data.serialize()
    }

    /// Deserializes the object.
    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        Ok(Self {
            cipher_data: CipherData::deserialize(data)?,
        })
    }
}

/// A master encryption key protected by one or more passphrase slots.
///
/// Invariant: every slot decrypts to the same 32-byte plaintext, and
/// [`encryption_key_id`] of that plaintext equals [`MasterKey::id`].
#[derive(Clone)]
pub struct MasterKey {
    /// Identity of the plaintext key.
    pub id: Vec<u8>,
    /// Passphrase slots.
    pub slots: Vec<CipherData>,
}

impl MasterKey {
    /// Serializes the key object.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_var_bytes(&self.id);
        w.put_var_int(self.slots.len() as u64);
        for slot in &self.slots {
            w.put_var_bytes(&slot.serialize());
        }
        w.into_bytes()
    }

    /// Deserializes the key object.
    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        let mut r = Reader::new(data);
        let id = r.get_var_bytes()?.to_vec();
        if id.len() != KEY_ID_LEN {
            return Err(StorageError::malformed("master key id length"));
        }
        let count = r.get_var_int()?;
        let mut slots = Vec::new();
        for _ in 0..count {
            slots.push(CipherData::deserialize(r.get_var_bytes()?)?);
        }
        r.expect_end()?;
        if slots.is_empty() {
            return Err(StorageError::malformed("master key without slots"));
        }
        Ok(Self { id, slots })
    }

    /// Returns `true` when the only slot is protected by the raw default
    /// key, i.e. the container is effectively unencrypted.
    #[must_use]
    pub fn is_unencrypted(&self, default_key_id: &[u8]) -> bool {
        self.slots.len() == 1 && self.slots[0].encryption_key_id == default_key_id
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("id", &hex::encode(&self.id))
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}
