//! Address model: network selection, string encodings, and address
//! entries over asset public material.

mod encode;
mod entry;
pub mod network;

pub use encode::{
    decode_address, decode_base58, decode_segwit, encode_base58, encode_segwit, DecodedAddress,
};
pub use entry::{AddressEntry, AddressType};
pub use network::{current_params, select_network, Network};
