//! Hierarchical asset model: derivation, asset entries, and accounts.

mod account;
pub mod derivation;
mod entry;

pub use account::{AccountId, AccountKind, AssetAccount};
pub use entry::{AssetBip32Root, AssetEntry, AssetId, AssetSingle};
