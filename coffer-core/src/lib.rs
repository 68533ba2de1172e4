//! Encrypted hierarchical wallet store.
//!
//! `coffer-core` is a passphrase-protected container for deterministic key
//! material: seeds, extended keys, derived key pairs, and their salts. It
//! guarantees that every byte written outside the database envelope is
//! indistinguishable from random to an attacker holding the file without
//! the passphrase.
//!
//! # Layers
//!
//! * [`kdf`] — memory-hard passphrase stretching (ROMix over SHA-512) with
//!   wall-clock calibration.
//! * [`crypto`] — the cipher primitive façade: hashes, HMACs, AES-CBC,
//!   secp256k1, and random number generation.
//! * [`buffer`] — [`SecureBytes`](buffer::SecureBytes), the zeroizing
//!   buffer every secret lives in.
//! * [`store`] — the ordered key-value backing-store seam (SQLite file or
//!   in-memory).
//! * [`kv`] — the encrypted KV engine: per-record IES envelopes, HMAC slot
//!   binding, key-stream rotation, secure erasure, and nested reentrant
//!   transactions.
//! * [`container`] — scoped in-memory custody of master keys with
//!   multi-slot passphrase management.
//! * [`db`] — the multi-sub-DB wallet envelope: control sub-DB, header
//!   registry, declared counts.
//! * [`assets`] — the asset model: BIP32, Armory135, salted, and ECDH
//!   accounts with lookahead windows.
//! * [`address`] — address entries and string encodings over asset public
//!   material.
//! * [`wallet`] — the façade: wallet lifecycle, watch-only forks, comment
//!   and authorized-peer stores, and the directory manager.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use coffer_core::buffer::SecureBytes;
//! use coffer_core::wallet::AssetWallet;
//!
//! let seed = SecureBytes::random(32);
//! let wallet = AssetWallet::create_from_seed_bip32(
//!     Path::new("./wallets"),
//!     &seed,
//!     &[0x8000_0050, 785],
//!     SecureBytes::from_slice(b"wallet passphrase"),
//!     SecureBytes::from_slice(b"control passphrase"),
//!     20,
//!     None,
//! )?;
//! let address = wallet.get_new_address(None)?.address()?;
//! # Ok::<(), coffer_core::error::WalletError>(())
//! ```

pub mod address;
pub mod assets;
pub mod buffer;
pub mod codec;
pub mod container;
pub mod crypto;
pub mod db;
pub mod error;
pub mod kdf;
pub mod kv;
pub mod secrets;
pub mod store;
pub mod wallet;

pub use address::{select_network, Network};
pub use buffer::SecureBytes;
pub use error::{AssetError, ContainerError, StorageError, WalletError};
pub use wallet::{AssetWallet, AuthorizedPeers, WalletManager};
