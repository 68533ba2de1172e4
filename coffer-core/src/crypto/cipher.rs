//! AES-256-CBC with PKCS#7 padding.
//!
//! The symmetric layer of every encrypted object and IES record in the
//! store. Decryption failures are reported as [`StorageError::BadKey`]; the
//! caller decides whether that means a wrong key-pair counter or a wrong
//! passphrase.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::{StorageError, StorageResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256 key length in bytes.
pub const AES_KEY_LEN: usize = 32;

/// AES block and IV length in bytes.
pub const AES_IV_LEN: usize = 16;

/// Encrypts `plaintext` under AES-256-CBC with PKCS#7 padding.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| StorageError::InvalidArgument("AES-CBC key/iv length".into()))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypts an AES-256-CBC ciphertext and strips PKCS#7 padding.
///
/// # Errors
///
/// Returns [`StorageError::BadKey`] when the padding does not verify, which
/// is the usual symptom of decrypting under the wrong key.
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_IV_LEN != 0 {
        return Err(StorageError::malformed("AES-CBC ciphertext length"));
    }
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| StorageError::InvalidArgument("AES-CBC key/iv length".into()))?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| StorageError::BadKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::prng;

    #[test]
    fn roundtrip() {
        let key = prng::generate_random(AES_KEY_LEN);
        let iv = prng::generate_random(AES_IV_LEN);
        let plaintext = b"sixteen byte bl+ some change";

        let ct = aes_cbc_encrypt(&key, &iv, plaintext).unwrap();
        assert_ne!(&ct[..plaintext.len().min(ct.len())], plaintext.as_slice());
        // PKCS#7 always pads to the next block boundary.
        assert_eq!(ct.len() % AES_IV_LEN, 0);
        assert!(ct.len() > plaintext.len());

        let pt = aes_cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let key = prng::generate_random(AES_KEY_LEN);
        let wrong = prng::generate_random(AES_KEY_LEN);
        let iv = prng::generate_random(AES_IV_LEN);

        let ct = aes_cbc_encrypt(&key, &iv, b"payload").unwrap();
        assert!(matches!(
            aes_cbc_decrypt(&wrong, &iv, &ct),
            Err(StorageError::BadKey)
        ));
    }

    #[test]
    fn ragged_ciphertext_is_malformed() {
        let key = prng::generate_random(AES_KEY_LEN);
        let iv = prng::generate_random(AES_IV_LEN);
        assert!(matches!(
            aes_cbc_decrypt(&key, &iv, &[0u8; 17]),
            Err(StorageError::Malformed(_))
        ));
        assert!(matches!(
            aes_cbc_decrypt(&key, &iv, &[]),
            Err(StorageError::Malformed(_))
        ));
    }

    #[test]
    fn empty_plaintext_encrypts_to_one_block() {
        let key = prng::generate_random(AES_KEY_LEN);
        let iv = prng::generate_random(AES_IV_LEN);
        let ct = aes_cbc_encrypt(&key, &iv, b"").unwrap();
        assert_eq!(ct.len(), AES_IV_LEN);
        assert!(aes_cbc_decrypt(&key, &iv, &ct).unwrap().is_empty());
    }
}
