//! Error types for the wallet store.
//!
//! Errors are layered the way the crate is: `StorageError` for the encrypted
//! KV engine and the DB interface, `ContainerError` for the decrypted-data
//! container, `AssetError` for derivation and addresses, with [`WalletError`]
//! as the umbrella the façade returns.

use thiserror::Error;

/// Result type for storage-layer operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for decrypted-data container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Result type for asset and address operations.
pub type AssetResult<T> = Result<T, AssetError>;

/// Result type for wallet façade operations.
pub type WalletResult<T> = Result<T, WalletError>;

/// Errors raised by the encrypted KV engine, the backing store, and the
/// wallet DB interface.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A caller-supplied parameter is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocation the KDF or engine needs could not be satisfied.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// An I/O operation failed.
    #[error("i/o error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backing key-value store reported a failure.
    #[error("backing store error: {0}")]
    Backend(String),

    /// On-disk state cannot be loaded.
    #[error("corrupt wallet data: {0}")]
    Corrupt(String),

    /// A record failed HMAC verification.
    #[error("tampered record: {0}")]
    Tampered(String),

    /// A record does not decrypt under the expected key pair.
    #[error("record does not decrypt under this key pair")]
    BadKey,

    /// A decrypted payload does not parse (short varint, trailing bytes).
    #[error("malformed record: {0}")]
    Malformed(String),

    /// Transaction modes conflict on this sub-DB.
    #[error("failed to create db tx")]
    TxConflict,

    /// No sub-DB is registered under this name.
    #[error("invalid db name")]
    InvalidDbName(String),

    /// The operation cannot run while transactions are live.
    #[error("live transactions, cannot {0}")]
    LiveTransactions(&'static str),

    /// The declared sub-DB count does not admit another header.
    #[error("dbCount is too low")]
    DbCountTooLow,

    /// A header is already registered under this name.
    #[error("header already in map: {0}")]
    HeaderExists(String),
}

impl StorageError {
    /// Creates an I/O error with context.
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a corrupt-data error.
    pub fn corrupt<S: Into<String>>(context: S) -> Self {
        Self::Corrupt(context.into())
    }

    /// Creates a malformed-record error.
    pub fn malformed<S: Into<String>>(context: S) -> Self {
        Self::Malformed(context.into())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors raised by the decrypted-data container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The passphrase provider gave up.
    #[error("empty passphrase")]
    EmptyPassphrase,

    /// A supplied passphrase does not unlock any slot.
    #[error("wrong passphrase")]
    WrongPassphrase,

    /// The operation must run outside the container lock.
    #[error("container is already locked")]
    AlreadyLocked,

    /// The operation requires the container lock on this thread.
    #[error("container is not locked")]
    NotLocked,

    /// Passphrase slots cannot be added to an unencrypted container.
    #[error("cannot add passphrase to unencrypted container")]
    CannotAddToUnencrypted,

    /// The new passphrase already unlocks an existing slot.
    #[error("duplicate cipher slot")]
    DuplicateCipher,

    /// No key is registered under this id.
    #[error("unknown encryption key id: {0}")]
    UnknownKey(String),

    /// A storage failure while reading or writing encrypted objects.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors raised by the asset model and address encoders.
#[derive(Debug, Error)]
pub enum AssetError {
    /// Private material was requested from a watch-only wallet.
    #[error("operation not available on watch-only wallet")]
    WatchOnly,

    /// An asset record carries an unrecognized type tag.
    #[error("unknown asset type: {0:#04x}")]
    UnknownAssetType(u8),

    /// A derivation path cannot be honored.
    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// An address string does not decode for the selected network.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No asset exists at this index.
    #[error("unknown asset index: {0}")]
    UnknownAsset(u32),

    /// No account is registered under this id.
    #[error("unknown account id")]
    UnknownAccount,

    /// A storage failure underneath an asset operation.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A container failure underneath an asset operation.
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Umbrella error returned by the wallet façade and manager.
#[derive(Debug, Error)]
pub enum WalletError {
    /// Storage-layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Decrypted-data container failure.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Asset or address failure.
    #[error(transparent)]
    Asset(#[from] AssetError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_conflict_message_is_stable() {
        // Callers match on this exact string in their own retry loops.
        assert_eq!(StorageError::TxConflict.to_string(), "failed to create db tx");
    }

    #[test]
    fn live_transactions_carries_context() {
        let err = StorageError::LiveTransactions("change dbCount");
        assert_eq!(err.to_string(), "live transactions, cannot change dbCount");
    }

    #[test]
    fn layered_conversion_reaches_wallet_error() {
        let inner = StorageError::TxConflict;
        let container: ContainerError = inner.into();
        let wallet: WalletError = container.into();
        assert!(matches!(
            wallet,
            WalletError::Container(ContainerError::Storage(StorageError::TxConflict))
        ));
    }
}
