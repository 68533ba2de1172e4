//! Cipher primitives façade.
//!
//! Pure functions over the ecosystem crypto crates: hashes and HMACs,
//! AES-256-CBC, secp256k1 operations, and random number generation. The
//! rest of the crate never touches the underlying crates directly.

pub mod cipher;
pub mod ecc;
pub mod hashes;
pub mod prng;
