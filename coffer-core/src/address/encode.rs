//! Address string encoding and decoding.
//!
//! Base58Check with network version bytes for P2PKH/P2SH, Bech32 with the
//! network HRP for SegWit v0. Decoders reject bad checksums, wrong HRPs,
//! wrong witness versions, and length overruns with
//! [`AssetError::InvalidAddress`].

use bech32::Hrp;

use crate::error::{AssetError, AssetResult};

use super::network::current_params;

/// Encodes a 20-byte hash as a Base58Check address under `version`.
#[must_use]
pub fn encode_base58(version: u8, hash: &[u8]) -> String {
    bs58::encode(hash).with_check_version(version).into_string()
}

/// Decodes a Base58Check address into its version byte and payload.
pub fn decode_base58(address: &str) -> AssetResult<(u8, Vec<u8>)> {
    let bytes = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|_| AssetError::InvalidAddress(address.to_string()))?;
    if bytes.len() != 21 {
        return Err(AssetError::InvalidAddress(address.to_string()));
    }
    Ok((bytes[0], bytes[1..].to_vec()))
}

/// Encodes a SegWit v0 program under the selected network's HRP.
pub fn encode_segwit(program: &[u8]) -> AssetResult<String> {
    let hrp = Hrp::parse(current_params().hrp)
        .expect("network HRPs are valid by construction");
    bech32::segwit::encode_v0(hrp, program)
        .map_err(|_| AssetError::InvalidAddress("witness program length".to_string()))
}

/// Decodes a SegWit address, returning the witness version and program.
pub fn decode_segwit(address: &str) -> AssetResult<(u8, Vec<u8>)> {
    let (hrp, version, program) = bech32::segwit::decode(address)
        .map_err(|_| AssetError::InvalidAddress(address.to_string()))?;
    if hrp.as_str() != current_params().hrp {
        return Err(AssetError::InvalidAddress(address.to_string()));
    }
    let version = version.to_u8();
    if version == 0 && program.len() != 20 && program.len() != 32 {
        return Err(AssetError::InvalidAddress(address.to_string()));
    }
    Ok((version, program))
}

/// A decoded address of any supported encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedAddress {
    /// Pay-to-pubkey-hash: a 20-byte key hash.
    P2pkh([u8; 20]),
    /// Pay-to-script-hash: a 20-byte script hash.
    P2sh([u8; 20]),
    /// SegWit v0 pay-to-witness-pubkey-hash.
    P2wpkh([u8; 20]),
    /// SegWit v0 pay-to-witness-script-hash.
    P2wsh([u8; 32]),
}

/// Decodes an address string against the selected network.
pub fn decode_address(address: &str) -> AssetResult<DecodedAddress> {
    let params = current_params();
    if address
        .to_ascii_lowercase()
        .starts_with(&format!("{}1", params.hrp))
    {
        let (version, program) = decode_segwit(address)?;
        if version != 0 {
            return Err(AssetError::InvalidAddress(address.to_string()));
        }
        return match program.len() {
            20 => Ok(DecodedAddress::P2wpkh(
                program.try_into().expect("length checked"),
            )),
            32 => Ok(DecodedAddress::P2wsh(
                program.try_into().expect("length checked"),
            )),
            _ => Err(AssetError::InvalidAddress(address.to_string())),
        };
    }

    let (version, payload) = decode_base58(address)?;
    let hash: [u8; 20] = payload
        .try_into()
        .map_err(|_| AssetError::InvalidAddress(address.to_string()))?;
    if version == params.p2pkh_prefix {
        Ok(DecodedAddress::P2pkh(hash))
    } else if version == params.p2sh_prefix {
        Ok(DecodedAddress::P2sh(hash))
    } else {
        Err(AssetError::InvalidAddress(address.to_string()))
    }
}
