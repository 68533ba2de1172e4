//! Random number generation.
//!
//! [`generate_random`] pulls from the system CSPRNG and is the source for
//! seeds, salts, IVs, and ephemeral keys. [`FortunaPrng`] is an auxiliary
//! generator for randomness that is presented to the outside world (session
//! identifiers and the like), so such draws never expose CSPRNG output
//! directly. It derives bytes with AES-CTR and reseeds its key after every
//! draw.

use std::sync::Mutex;

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::buffer::SecureBytes;
use crate::crypto::hashes::sha256;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Draws `len` bytes from the system CSPRNG.
///
/// # Panics
///
/// Panics if the system's random number generator fails.
#[must_use]
pub fn generate_random(len: usize) -> SecureBytes {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    SecureBytes::new(bytes)
}

struct FortunaState {
    key: SecureBytes,
    counter: u32,
}

/// Fortuna-style auxiliary PRNG.
///
/// The key is seeded once from the system CSPRNG. Each draw produces an
/// AES-CTR keystream under the current key, then replaces the key with
/// `SHA-256(previous_key || counter || extra_entropy)` so no two draws share
/// cipher state.
pub struct FortunaPrng {
    state: Mutex<FortunaState>,
}

impl FortunaPrng {
    /// Creates a generator seeded from the system CSPRNG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FortunaState {
                key: generate_random(32),
                counter: 1,
            }),
        }
    }

    /// Draws `len` pseudo-random bytes.
    #[must_use]
    pub fn generate_random(&self, len: usize, extra_entropy: &[u8]) -> SecureBytes {
        let mut state = self.state.lock().expect("fortuna state poisoned");

        let mut iv = [0u8; 16];
        iv[12..].copy_from_slice(&state.counter.to_be_bytes());
        let mut cipher = Aes256Ctr::new_from_slices(state.key.as_slice(), &iv)
            .expect("key and iv lengths are fixed");

        let mut out = vec![0u8; len];
        cipher.apply_keystream(&mut out);

        // Reseed after every draw.
        let mut reseed_input = Vec::with_capacity(32 + 4 + extra_entropy.len());
        reseed_input.extend_from_slice(state.key.as_slice());
        reseed_input.extend_from_slice(&state.counter.to_be_bytes());
        reseed_input.extend_from_slice(extra_entropy);
        state.key = SecureBytes::from_slice(&sha256(&reseed_input));
        state.counter = state.counter.wrapping_add(1);

        SecureBytes::new(out)
    }
}

impl Default for FortunaPrng {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_draws_differ() {
        assert_ne!(generate_random(16), generate_random(16));
    }

    #[test]
    fn fortuna_draws_differ_across_reseeds() {
        let prng = FortunaPrng::new();
        let a = prng.generate_random(32, &[]);
        let b = prng.generate_random(32, &[]);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn fortuna_instances_are_independent() {
        let a = FortunaPrng::new().generate_random(32, b"x");
        let b = FortunaPrng::new().generate_random(32, b"x");
        assert_ne!(a, b);
    }

    #[test]
    fn fortuna_zero_length_draw() {
        let prng = FortunaPrng::new();
        assert!(prng.generate_random(0, &[]).is_empty());
    }
}
