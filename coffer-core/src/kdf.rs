//! Memory-hard key derivation (ROMix over SHA-512).
//!
//! Stretches user passphrases into symmetric encryption keys. The algorithm
//! is Percival's ROMix (scrypt paper, page 6): fill a lookup table of
//! hash-sized entries by hash chaining, then walk it with data-dependent
//! indices. Memory-hardness per thread is what defeats GPU parallelization;
//! `iterations` is the second tuning axis that raises compute time without
//! raising the memory requirement.
//!
//! [`KdfRomix::calibrate`] sizes the parameters against a wall-clock budget
//! on the machine creating the wallet; the chosen parameters persist and are
//! never recalibrated on open.

use std::time::Instant;

use zeroize::Zeroize;

use crate::buffer::SecureBytes;
use crate::codec::{Reader, Writer};
use crate::crypto::hashes::{hash256, sha512, SHA512_LEN};
use crate::crypto::prng;
use crate::error::{StorageError, StorageResult};

/// Hash function used by the ROMix instance.
pub const KDF_HASH_NAME: &str = "sha512";

/// Default memory ceiling: 32 MiB. A table this large is undeniably easier
/// to compute on a CPU than a GPU.
pub const DEFAULT_KDF_MAX_MEMORY: u32 = 32 * 1024 * 1024;

/// Default wall-clock target for one derivation.
pub const DEFAULT_KDF_TARGET_SEC: f64 = 0.25;

/// Smallest memory size calibration will settle on.
const MIN_MEMORY_BYTES: u32 = 4096;

/// Table size used to sample hash throughput during calibration.
const PROBE_MEMORY_BYTES: u32 = 1024 * 1024;

/// Length of the derived key in bytes.
pub const KDF_OUTPUT_LEN: usize = 32;

/// Length of a KDF identifier in bytes.
pub const KDF_ID_LEN: usize = 16;

/// A ROMix KDF instance with fixed parameters.
#[derive(Clone)]
pub struct KdfRomix {
    memory_bytes: u32,
    sequence_count: u32,
    iterations: u32,
    salt: SecureBytes,
    kdf_id: Vec<u8>,
}

impl KdfRomix {
    /// Builds an instance from explicit parameters.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` unless `memory_bytes` is a nonzero
    /// multiple of the hash output length and `iterations` is nonzero.
    pub fn new(memory_bytes: u32, iterations: u32, salt: SecureBytes) -> StorageResult<Self> {
        if memory_bytes == 0 || memory_bytes as usize % SHA512_LEN != 0 {
            return Err(StorageError::InvalidArgument(
                "memory requirement must be a multiple of the hash output length".into(),
            ));
        }
        if iterations == 0 {
            return Err(StorageError::InvalidArgument(
                "iteration count must be nonzero".into(),
            ));
        }
        let kdf_id = compute_kdf_id(memory_bytes, iterations, &salt);
        Ok(Self {
            memory_bytes,
            sequence_count: memory_bytes / SHA512_LEN as u32,
            iterations,
            salt,
            kdf_id,
        })
    }

    /// Picks parameters so one [`derive`](Self::derive) call runs between
    /// `target_sec / 2` and `target_sec` on this machine, using the largest
    /// power-of-two memory size at or under `max_mem_bytes` whose single
    /// pass fits the budget.
    pub fn calibrate(target_sec: f64, max_mem_bytes: u32) -> StorageResult<Self> {
        if !(target_sec > 0.0) {
            return Err(StorageError::InvalidArgument(
                "target compute time must be positive".into(),
            ));
        }
        if max_mem_bytes < MIN_MEMORY_BYTES {
            return Err(StorageError::InvalidArgument(format!(
                "memory cap below minimum of {MIN_MEMORY_BYTES} bytes"
            )));
        }

        // Sample throughput on a small table, extrapolate linearly: one pass
        // does ~2 hashes per table entry regardless of table size.
        let probe_mem = PROBE_MEMORY_BYTES.min(prev_power_of_two(max_mem_bytes));
        let probe = Self::new(probe_mem, 1, prng::generate_random(32))?;
        let start = Instant::now();
        let _ = probe.derive(b"calibration probe")?;
        let probe_sec = start.elapsed().as_secs_f64().max(1e-6);
        let sec_per_byte = probe_sec / f64::from(probe_mem);

        // Largest power of two whose predicted pass time fits the target;
        // equal candidates therefore resolve to the higher power of two.
        let mut memory_bytes = prev_power_of_two(max_mem_bytes);
        while memory_bytes > MIN_MEMORY_BYTES
            && f64::from(memory_bytes) * sec_per_byte > target_sec
        {
            memory_bytes /= 2;
        }

        // Measure the real pass at the chosen size and fit the iteration
        // count so total time lands in (target/2, target].
        let trial = Self::new(memory_bytes, 1, prng::generate_random(32))?;
        let start = Instant::now();
        let _ = trial.derive(b"calibration probe")?;
        let pass_sec = start.elapsed().as_secs_f64().max(1e-6);

        let iterations = ((target_sec / pass_sec).floor() as u32).max(1);

        let kdf = Self::new(memory_bytes, iterations, prng::generate_random(32))?;
        tracing::debug!(
            memory_bytes,
            iterations,
            pass_ms = pass_sec * 1000.0,
            "calibrated kdf parameters"
        );
        Ok(kdf)
    }

    /// Stretches `password` into a 32-byte key.
    pub fn derive(&self, password: &[u8]) -> StorageResult<SecureBytes> {
        let mut state = SecureBytes::from_slice(password);
        for _ in 0..self.iterations {
            state = self.derive_one_iter(&state)?;
        }
        Ok(SecureBytes::from_slice(&state[..KDF_OUTPUT_LEN]))
    }

    /// Runs a single ROMix pass.
    ///
    /// One large contiguous allocation per call, zeroized before return and
    /// never pooled across threads.
    fn derive_one_iter(&self, password: &[u8]) -> StorageResult<SecureBytes> {
        let table_len = self.memory_bytes as usize;
        let count = self.sequence_count as usize;

        let mut table: Vec<u8> = Vec::new();
        table
            .try_reserve_exact(table_len)
            .map_err(|_| StorageError::OutOfMemory(format!("{table_len} byte lookup table")))?;
        table.resize(table_len, 0);

        // Fill the table by hash chaining from the salted password.
        let mut seeded = Vec::with_capacity(password.len() + self.salt.len());
        seeded.extend_from_slice(password);
        seeded.extend_from_slice(&self.salt);
        table[..SHA512_LEN].copy_from_slice(&sha512(&seeded));
        seeded.zeroize();

        for i in 1..count {
            let (prev, cur) = table.split_at_mut(i * SHA512_LEN);
            cur[..SHA512_LEN]
                .copy_from_slice(&sha512(&prev[(i - 1) * SHA512_LEN..]));
        }

        // Walk the table with data-dependent indices.
        let mut x = sha512(&table[(count - 1) * SHA512_LEN..]);
        let mut mixed = [0u8; SHA512_LEN];
        for _ in 0..count {
            let index = integerify(&x) as usize % count;
            let entry = &table[index * SHA512_LEN..(index + 1) * SHA512_LEN];
            for (out, (a, b)) in mixed.iter_mut().zip(x.iter().zip(entry.iter())) {
                *out = a ^ b;
            }
            x = sha512(&mixed);
        }

        table.zeroize();
        mixed.zeroize();
        let out = SecureBytes::from_slice(&x);
        x.zeroize();
        Ok(out)
    }

    /// Memory requirement in bytes.
    #[must_use]
    pub fn memory_bytes(&self) -> u32 {
        self.memory_bytes
    }

    /// Number of table entries.
    #[must_use]
    pub fn sequence_count(&self) -> u32 {
        self.sequence_count
    }

    /// Number of ROMix passes per derivation.
    #[must_use]
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// The KDF salt.
    #[must_use]
    pub fn salt(&self) -> &SecureBytes {
        &self.salt
    }

    /// Stable identifier for this parameter set.
    #[must_use]
    pub fn kdf_id(&self) -> &[u8] {
        &self.kdf_id
    }

    /// Serializes the parameters for persistence.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_var_bytes(KDF_HASH_NAME.as_bytes());
        w.put_u32_be(self.memory_bytes);
        w.put_u32_be(self.iterations);
        w.put_var_bytes(&self.salt);
        w.into_bytes()
    }

    /// Restores an instance from serialized parameters.
    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        let mut r = Reader::new(data);
        let name = r.get_var_bytes()?;
        if name != KDF_HASH_NAME.as_bytes() {
            return Err(StorageError::corrupt(format!(
                "unsupported kdf hash function {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        let memory_bytes = r.get_u32_be()?;
        let iterations = r.get_u32_be()?;
        let salt = SecureBytes::from_slice(r.get_var_bytes()?);
        r.expect_end()?;
        Self::new(memory_bytes, iterations, salt)
    }
}

impl std::fmt::Debug for KdfRomix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdfRomix")
            .field("hash", &KDF_HASH_NAME)
            .field("memory_bytes", &self.memory_bytes)
            .field("iterations", &self.iterations)
            .field("kdf_id", &hex::encode(&self.kdf_id))
            .finish_non_exhaustive()
    }
}

/// Interprets the trailing bytes of the running hash as an index.
fn integerify(x: &[u8; SHA512_LEN]) -> u32 {
    u32::from_be_bytes([
        x[SHA512_LEN - 4],
        x[SHA512_LEN - 3],
        x[SHA512_LEN - 2],
        x[SHA512_LEN - 1],
    ])
}

fn prev_power_of_two(value: u32) -> u32 {
    let mut p = 1u32;
    while p * 2 <= value && p < (1 << 30) {
        p *= 2;
    }
    p
}

fn compute_kdf_id(memory_bytes: u32, iterations: u32, salt: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_var_bytes(KDF_HASH_NAME.as_bytes());
    w.put_u32_be(memory_bytes);
    w.put_u32_be(iterations);
    w.put_var_bytes(salt);
    hash256(w.as_slice())[..KDF_ID_LEN].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_kdf() -> KdfRomix {
        KdfRomix::new(4096, 2, SecureBytes::from_slice(&[0x5a; 32])).unwrap()
    }

    #[test]
    fn derive_is_deterministic() {
        let kdf = small_kdf();
        let a = kdf.derive(b"passphrase").unwrap();
        let b = kdf.derive(b"passphrase").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), KDF_OUTPUT_LEN);
        assert_ne!(a, kdf.derive(b"other passphrase").unwrap());
    }

    #[test]
    fn salt_changes_output() {
        let a = KdfRomix::new(4096, 1, SecureBytes::from_slice(&[1; 32]))
            .unwrap()
            .derive(b"pass")
            .unwrap();
        let b = KdfRomix::new(4096, 1, SecureBytes::from_slice(&[2; 32]))
            .unwrap()
            .derive(b"pass")
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn iterations_change_output() {
        let salt = SecureBytes::from_slice(&[7; 32]);
        let a = KdfRomix::new(4096, 1, salt.clone()).unwrap().derive(b"pass").unwrap();
        let b = KdfRomix::new(4096, 2, salt).unwrap().derive(b"pass").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn parameter_validation() {
        assert!(matches!(
            KdfRomix::new(100, 1, SecureBytes::random(32)),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            KdfRomix::new(4096, 0, SecureBytes::random(32)),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            KdfRomix::calibrate(0.0, DEFAULT_KDF_MAX_MEMORY),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            KdfRomix::calibrate(-1.0, DEFAULT_KDF_MAX_MEMORY),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn serialization_roundtrip_preserves_id() {
        let kdf = small_kdf();
        let restored = KdfRomix::deserialize(&kdf.serialize()).unwrap();
        assert_eq!(restored.kdf_id(), kdf.kdf_id());
        assert_eq!(restored.memory_bytes(), kdf.memory_bytes());
        assert_eq!(restored.iterations(), kdf.iterations());
        assert_eq!(
            restored.derive(b"pass").unwrap(),
            kdf.derive(b"pass").unwrap()
        );
    }

    #[test]
    fn calibration_respects_memory_cap() {
        let kdf = KdfRomix::calibrate(0.02, 64 * 1024).unwrap();
        assert!(kdf.memory_bytes() <= 64 * 1024);
        assert!(kdf.memory_bytes() >= MIN_MEMORY_BYTES);
        assert!(kdf.iterations() >= 1);
        assert_eq!(u64::from(kdf.memory_bytes()) % SHA512_LEN as u64, 0);
    }

    #[test]
    fn kdf_id_depends_on_parameters() {
        let salt = SecureBytes::from_slice(&[9; 32]);
        let a = KdfRomix::new(4096, 1, salt.clone()).unwrap();
        let b = KdfRomix::new(4096, 2, salt.clone()).unwrap();
        let c = KdfRomix::new(8192, 1, salt).unwrap();
        assert_ne!(a.kdf_id(), b.kdf_id());
        assert_ne!(a.kdf_id(), c.kdf_id());
        assert_eq!(a.kdf_id().len(), KDF_ID_LEN);
    }
}
