//! Wallet headers and well-known logical keys.
//!
//! Every sub-DB is described by a [`WalletHeader`]: its kind, name, the
//! `control_salt` that anchors its IES key stream, the ids of the KDF and
//! master key that protect its secrets, and its default (no-passphrase)
//! encryption key. The control sub-DB's header also carries the declared
//! sub-DB count.
//!
//! Header records are keyed `0xC0 || name` and their values are
//! `varint(len) || serialized-header`; other well-known logical keys are
//! fixed 4-byte big-endian constants.

use crate::buffer::SecureBytes;
use crate::codec::{Reader, Writer};
use crate::error::{StorageError, StorageResult};

/// Name of the control sub-DB.
pub const CONTROL_DB_NAME: &str = "control";

/// Name of the header-registry sub-DB.
pub const HEADERS_DB_NAME: &str = "headers";

/// Prefix byte of header record keys.
pub const WALLETHEADER_PREFIX: u8 = 0xC0;

/// Logical key of the main-wallet designation in the header registry.
pub const MAINWALLET_KEY: u32 = 0x0000_0001;

/// Logical key of a sub-DB's encrypted seed record.
pub const WALLET_SEED_KEY: u32 = 0x0000_0002;

/// Logical key of a wallet's main-account designation.
pub const MAIN_ACCOUNT_KEY: u32 = 0x0000_0003;

/// Prefix byte of master-key records.
pub const MASTERKEY_PREFIX: u8 = 0xB0;

/// Prefix byte of KDF-parameter records.
pub const KDF_PREFIX: u8 = 0xB1;

/// Prefix byte of account-definition records.
pub const ACCOUNT_PREFIX: u8 = 0xA0;

/// Prefix byte of asset records.
pub const ASSET_PREFIX: u8 = 0xA1;

/// Prefix byte of comment records.
pub const COMMENT_PREFIX: u8 = 0xA2;

/// Prefix byte of authorized-peer records.
pub const PEER_PREFIX: u8 = 0xA3;

/// Kind of a sub-DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletHeaderKind {
    /// The control sub-DB.
    Control,
    /// A single-signature wallet.
    Single,
    /// A multisig wallet.
    Multisig,
    /// An application-defined sub-DB (peers, standalone stores).
    Custom,
}

impl WalletHeaderKind {
    fn to_u8(self) -> u8 {
        match self {
            Self::Control => 0x00,
            Self::Single => 0x01,
            Self::Multisig => 0x02,
            Self::Custom => 0x03,
        }
    }

    fn from_u8(tag: u8) -> StorageResult<Self> {
        match tag {
            0x00 => Ok(Self::Control),
            0x01 => Ok(Self::Single),
            0x02 => Ok(Self::Multisig),
            0x03 => Ok(Self::Custom),
            other => Err(StorageError::corrupt(format!(
                "unknown wallet header kind {other:#04x}"
            ))),
        }
    }
}

/// Per-sub-DB metadata.
#[derive(Clone)]
pub struct WalletHeader {
    /// Kind of the sub-DB this header describes.
    pub kind: WalletHeaderKind,
    /// Sub-DB name (doubles as the wallet id).
    pub db_name: String,
    /// Salt mixed with the control root to seed this sub-DB's key stream.
    pub control_salt: SecureBytes,
    /// Id of the sub-DB's default KDF parameter set.
    pub default_kdf_id: Vec<u8>,
    /// Id of the master key protecting the sub-DB's secrets.
    pub master_key_id: Vec<u8>,
    /// Raw default encryption key used when no passphrase is set.
    pub default_key: SecureBytes,
    /// Declared sub-DB count (meaningful on the control header only).
    pub db_count: u32,
}

impl WalletHeader {
    /// Storage key of the header record for `name`.
    #[must_use]
    pub fn db_key(name: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + name.len());
        key.push(WALLETHEADER_PREFIX);
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// Serializes the header body (without the record-value length prefix).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(self.kind.to_u8());
        w.put_var_bytes(self.db_name.as_bytes());
        w.put_var_bytes(&self.control_salt);
        w.put_var_bytes(&self.default_kdf_id);
        w.put_var_bytes(&self.master_key_id);
        w.put_var_bytes(&self.default_key);
        w.put_u32_be(self.db_count);
        w.into_bytes()
    }

    /// Deserializes a header body.
    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        let mut r = Reader::new(data);
        let kind = WalletHeaderKind::from_u8(r.get_u8()?)?;
        let db_name = String::from_utf8(r.get_var_bytes()?.to_vec())
            .map_err(|_| StorageError::corrupt("header name is not utf-8"))?;
        let control_salt = SecureBytes::from_slice(r.get_var_bytes()?);
        let default_kdf_id = r.get_var_bytes()?.to_vec();
        let master_key_id = r.get_var_bytes()?.to_vec();
        let default_key = SecureBytes::from_slice(r.get_var_bytes()?);
        let db_count = r.get_u32_be()?;
        r.expect_end()?;
        Ok(Self {
            kind,
            db_name,
            control_salt,
            default_kdf_id,
            master_key_id,
            default_key,
            db_count,
        })
    }
}

impl std::fmt::Debug for WalletHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletHeader")
            .field("kind", &self.kind)
            .field("db_name", &self.db_name)
            .field("db_count", &self.db_count)
            .finish_non_exhaustive()
    }
}

/// Encodes a well-known 4-byte logical key.
#[must_use]
pub fn u32_key(key: u32) -> Vec<u8> {
    key.to_be_bytes().to_vec()
}

/// Wraps a serialized payload as a record value: `varint(len) || payload`.
#[must_use]
pub fn wrap_value(payload: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_var_bytes(payload);
    w.into_bytes()
}

/// Unwraps a `varint(len) || payload` record value.
pub fn unwrap_value(value: &[u8]) -> StorageResult<Vec<u8>> {
    let mut r = Reader::new(value);
    let payload = r.get_var_bytes()?.to_vec();
    r.expect_end()?;
    Ok(payload)
}
