//! Wallet manager.
//!
//! Scans a directory for wallet files and keeps one container per loaded
//! wallet, keyed by wallet id.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::container::PassphraseProvider;
use crate::error::WalletResult;

use super::AssetWallet;

/// Holds one loaded wallet.
pub struct WalletContainer {
    wallet: Arc<AssetWallet>,
}

impl WalletContainer {
    /// The wallet held by this container.
    #[must_use]
    pub fn wallet_ptr(&self) -> Arc<AssetWallet> {
        Arc::clone(&self.wallet)
    }
}

/// Directory-level registry of wallets.
pub struct WalletManager {
    wallets: BTreeMap<String, WalletContainer>,
}

impl WalletManager {
    /// Loads every `.wallet` file under `home_dir`. Files that fail to open
    /// are skipped with a warning.
    pub fn new(home_dir: &Path, control_provider: &PassphraseProvider) -> WalletResult<Self> {
        let mut wallets = BTreeMap::new();

        let entries = std::fs::read_dir(home_dir)
            .map_err(|e| crate::error::StorageError::io("scan wallet directory", e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wallet") {
                continue;
            }
            match AssetWallet::load_main_wallet_from_file(&path, control_provider) {
                Ok(wallet) => {
                    wallets.insert(wallet.id().to_string(), WalletContainer { wallet });
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable wallet file");
                }
            }
        }

        tracing::debug!(count = wallets.len(), "wallet manager loaded");
        Ok(Self { wallets })
    }

    /// Map of wallet id to container.
    #[must_use]
    pub fn get_map(&self) -> &BTreeMap<String, WalletContainer> {
        &self.wallets
    }
}

impl std::fmt::Debug for WalletManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletManager")
            .field("wallets", &self.wallets.keys().collect::<Vec<_>>())
            .finish()
    }
}
