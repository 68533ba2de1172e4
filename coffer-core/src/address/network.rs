//! Process-global network selection.
//!
//! Address encoders read their version bytes and HRP from the selected
//! network. The core reads no environment variables; callers select the
//! network once at startup.

use std::sync::RwLock;

/// Supported networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Bitcoin mainnet.
    Mainnet,
    /// Bitcoin testnet.
    Testnet,
}

/// Prefix bytes and encoding parameters of a network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkParams {
    /// Base58Check version byte for P2PKH addresses.
    pub p2pkh_prefix: u8,
    /// Base58Check version byte for P2SH addresses.
    pub p2sh_prefix: u8,
    /// Bech32 human-readable part for SegWit addresses.
    pub hrp: &'static str,
    /// BIP32 extended private key version bytes.
    pub xprv_version: [u8; 4],
    /// BIP32 extended public key version bytes.
    pub xpub_version: [u8; 4],
}

const MAINNET: NetworkParams = NetworkParams {
    p2pkh_prefix: 0x00,
    p2sh_prefix: 0x05,
    hrp: "bc",
    xprv_version: [0x04, 0x88, 0xAD, 0xE4],
    xpub_version: [0x04, 0x88, 0xB2, 0x1E],
};

const TESTNET: NetworkParams = NetworkParams {
    p2pkh_prefix: 0x6f,
    p2sh_prefix: 0xc4,
    hrp: "tb",
    xprv_version: [0x04, 0x35, 0x83, 0x94],
    xpub_version: [0x04, 0x35, 0x87, 0xCF],
};

static CURRENT: RwLock<Network> = RwLock::new(Network::Mainnet);

/// Selects the process-wide network.
pub fn select_network(network: Network) {
    *CURRENT.write().expect("network selection poisoned") = network;
}

/// Parameters of the selected network.
#[must_use]
pub fn current_params() -> NetworkParams {
    match *CURRENT.read().expect("network selection poisoned") {
        Network::Mainnet => MAINNET,
        Network::Testnet => TESTNET,
    }
}

/// Internal prefix byte marking P2WPKH entries in address-hash sets.
pub const SCRIPT_PREFIX_P2WPKH: u8 = 0x90;

/// Internal prefix byte marking P2WSH entries in address-hash sets.
pub const SCRIPT_PREFIX_P2WSH: u8 = 0x95;

/// Internal prefix byte marking bare multisig entries in address-hash sets.
pub const SCRIPT_PREFIX_MULTISIG: u8 = 0xfe;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_is_default() {
        select_network(Network::Mainnet);
        let params = current_params();
        assert_eq!(params.p2pkh_prefix, 0x00);
        assert_eq!(params.hrp, "bc");
    }

    #[test]
    fn testnet_swaps_prefixes() {
        select_network(Network::Testnet);
        let params = current_params();
        assert_eq!(params.p2pkh_prefix, 0x6f);
        assert_eq!(params.hrp, "tb");
        select_network(Network::Mainnet);
    }
}
