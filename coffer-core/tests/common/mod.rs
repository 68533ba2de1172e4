//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::path::Path;

use coffer_core::buffer::SecureBytes;
use coffer_core::container::{fixed_passphrase, PassphraseProvider};
use coffer_core::kdf::KdfRomix;

/// A fast KDF so wallet tests do not pay calibration or stretch costs.
pub fn test_kdf() -> KdfRomix {
    KdfRomix::new(4096, 1, SecureBytes::random(32)).unwrap()
}

/// Fixed-passphrase provider.
pub fn provider(pass: &[u8]) -> PassphraseProvider {
    fixed_passphrase(SecureBytes::from_slice(pass))
}

/// Scans a file for a contiguous byte sequence.
pub fn search_file(path: &Path, needle: &[u8]) -> bool {
    let data = std::fs::read(path).expect("read file under test");
    !needle.is_empty() && data.windows(needle.len()).any(|w| w == needle)
}
