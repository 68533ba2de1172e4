//! Decrypted-data container.
//!
//! Holds master encryption keys in memory only while a scoped lock is held.
//! Unlocking walks the master key's passphrase slots: default-key slots
//! decrypt silently, passphrase slots go through the prompt loop — the
//! provider is called with the set of key ids it has not yet satisfied and
//! retried until a slot opens or it returns empty bytes, which surfaces as
//! [`ContainerError::EmptyPassphrase`].
//!
//! Passphrase management (add / change / erase) runs outside the lock and
//! returns the rewritten [`MasterKey`] (plus any freshly minted KDF) for the
//! caller to persist; the container never touches storage itself.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use crate::buffer::SecureBytes;
use crate::crypto::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, AES_IV_LEN};
use crate::error::{ContainerError, ContainerResult};
use crate::kdf::KdfRomix;
use crate::secrets::{encryption_key_id, CipherData, EncryptedData, MasterKey};

/// Callback that produces a passphrase for the given set of unsatisfied
/// key ids. Returning empty bytes means give up.
pub type PassphraseProvider = Arc<dyn Fn(&BTreeSet<Vec<u8>>) -> SecureBytes + Send + Sync>;

/// Wraps a fixed passphrase as a provider.
#[must_use]
pub fn fixed_passphrase(pass: SecureBytes) -> PassphraseProvider {
    Arc::new(move |_ids: &BTreeSet<Vec<u8>>| pass.clone())
}

struct LockGate {
    owner: Option<(ThreadId, usize)>,
    /// Decrypted keys, alive only while the lock is held.
    cache: HashMap<Vec<u8>, SecureBytes>,
}

/// In-memory custody of master keys and the KDFs that protect them.
pub struct DecryptedDataContainer {
    gate: Mutex<LockGate>,
    cond: Condvar,
    master_keys: Mutex<HashMap<Vec<u8>, MasterKey>>,
    kdfs: Mutex<HashMap<Vec<u8>, KdfRomix>>,
    provider: Mutex<Option<PassphraseProvider>>,
    default_key: SecureBytes,
    default_key_id: Vec<u8>,
    default_kdf_id: Vec<u8>,
    master_key_id: Vec<u8>,
}

/// Scoped lock over a container.
///
/// Reentrant on the owning thread, exclusive across threads. Dropping the
/// outermost guard wipes every decrypted key.
pub struct ContainerLock {
    container: Arc<DecryptedDataContainer>,
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        self.container.release_gate();
    }
}

impl DecryptedDataContainer {
    /// Creates a container around one master key id and the wallet's
    /// default (no-passphrase) encryption key.
    #[must_use]
    pub fn new(
        master_key_id: Vec<u8>,
        default_key: SecureBytes,
        default_kdf_id: Vec<u8>,
    ) -> Self {
        let default_key_id = encryption_key_id(&default_key);
        Self {
            gate: Mutex::new(LockGate {
                owner: None,
                cache: HashMap::new(),
            }),
            cond: Condvar::new(),
            master_keys: Mutex::new(HashMap::new()),
            kdfs: Mutex::new(HashMap::new()),
            provider: Mutex::new(None),
            default_key,
            default_key_id,
            default_kdf_id,
            master_key_id,
        }
    }

    /// Id of the container's primary master key.
    #[must_use]
    pub fn master_key_id(&self) -> &[u8] {
        &self.master_key_id
    }

    /// Id of the default (no-passphrase) key.
    #[must_use]
    pub fn default_key_id(&self) -> &[u8] {
        &self.default_key_id
    }

    /// Registers a KDF instance.
    pub fn register_kdf(&self, kdf: KdfRomix) {
        self.kdfs
            .lock()
            .expect("kdf map poisoned")
            .insert(kdf.kdf_id().to_vec(), kdf);
    }

    /// Registers a master key object.
    pub fn register_master_key(&self, key: MasterKey) {
        self.master_keys
            .lock()
            .expect("master key map poisoned")
            .insert(key.id.clone(), key);
    }

    /// Returns a clone of a registered master key object.
    pub fn master_key(&self, id: &[u8]) -> ContainerResult<MasterKey> {
        self.master_keys
            .lock()
            .expect("master key map poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownKey(hex::encode(id)))
    }

    /// Returns a clone of a registered KDF.
    pub fn kdf(&self, id: &[u8]) -> ContainerResult<KdfRomix> {
        self.kdfs
            .lock()
            .expect("kdf map poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ContainerError::UnknownKey(hex::encode(id)))
    }

    /// Installs the passphrase provider.
    pub fn set_passphrase_provider(&self, provider: PassphraseProvider) {
        *self.provider.lock().expect("provider poisoned") = Some(provider);
    }

    /// Removes the passphrase provider.
    pub fn reset_passphrase_provider(&self) {
        *self.provider.lock().expect("provider poisoned") = None;
    }

    /// Returns `true` while any thread holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.gate.lock().expect("lock gate poisoned").owner.is_some()
    }

    /// Acquires the scoped lock. Blocks until other threads release theirs;
    /// reentrant on the owning thread.
    #[must_use]
    pub fn lock(self: &Arc<Self>) -> ContainerLock {
        self.acquire_gate();
        ContainerLock {
            container: Arc::clone(self),
        }
    }

    fn acquire_gate(&self) {
        let tid = std::thread::current().id();
        let mut gate = self.gate.lock().expect("lock gate poisoned");
        loop {
            match gate.owner {
                Some((owner, ref mut depth)) if owner == tid => {
                    *depth += 1;
                    return;
                }
                None => {
                    gate.owner = Some((tid, 1));
                    return;
                }
                Some(_) => {
                    gate = self.cond.wait(gate).expect("lock gate poisoned");
                }
            }
        }
    }

    fn release_gate(&self) {
        let mut gate = self.gate.lock().expect("lock gate poisoned");
        if let Some((_, ref mut depth)) = gate.owner {
            *depth -= 1;
            if *depth == 0 {
                gate.owner = None;
                gate.cache.clear();
                drop(gate);
                self.cond.notify_all();
            }
        }
    }

    fn assert_locked_by_me(&self) -> ContainerResult<()> {
        let gate = self.gate.lock().expect("lock gate poisoned");
        match gate.owner {
            Some((owner, _)) if owner == std::thread::current().id() => Ok(()),
            _ => Err(ContainerError::NotLocked),
        }
    }

    /// Decrypts a single-slot encrypted object. Requires the scoped lock on
    /// this thread.
    pub fn get_decrypted_value(&self, obj: &EncryptedData) -> ContainerResult<SecureBytes> {
        self.assert_locked_by_me()?;
        let slot = &obj.cipher_data;
        let key = self.resolve_key(&slot.encryption_key_id)?;
        let plain = aes_cbc_decrypt(&key, &slot.iv, &slot.cipher_text)?;
        Ok(SecureBytes::new(plain))
    }

    /// Encrypts a payload under the container's master key. Requires the
    /// scoped lock on this thread.
    pub fn encrypt_under_master(&self, plaintext: &[u8]) -> ContainerResult<EncryptedData> {
        self.assert_locked_by_me()?;
        let master = self.resolve_key(&self.master_key_id.clone())?;
        let iv = SecureBytes::random(AES_IV_LEN);
        let cipher_text = aes_cbc_encrypt(&master, &iv, plaintext)?;
        Ok(EncryptedData {
            cipher_data: CipherData {
                iv,
                cipher_text: SecureBytes::new(cipher_text),
                kdf_id: Vec::new(),
                encryption_key_id: self.master_key_id.clone(),
            },
        })
    }

    /// Resolves an encryption key id to its raw bytes, unlocking master
    /// keys through the prompt loop as needed.
    fn resolve_key(&self, key_id: &[u8]) -> ContainerResult<SecureBytes> {
        if key_id == self.default_key_id {
            return Ok(self.default_key.clone());
        }
        {
            let gate = self.gate.lock().expect("lock gate poisoned");
            if let Some(cached) = gate.cache.get(key_id) {
                return Ok(cached.clone());
            }
        }
        let (plain, _) = self.unlock_master_slot(key_id)?;
        let mut gate = self.gate.lock().expect("lock gate poisoned");
        gate.cache.insert(key_id.to_vec(), plain.clone());
        Ok(plain)
    }

    /// Tries every slot of a master key until one decrypts to a plaintext
    /// whose recomputed id matches. Returns the plaintext and the index of
    /// the slot that opened.
    fn unlock_master_slot(&self, key_id: &[u8]) -> ContainerResult<(SecureBytes, usize)> {
        let master = self.master_key(key_id)?;

        // Default-key slots open without a prompt.
        for (index, slot) in master.slots.iter().enumerate() {
            if slot.encryption_key_id == self.default_key_id {
                if let Some(plain) = self.try_slot(slot, &self.default_key, key_id) {
                    return Ok((plain, index));
                }
            }
        }

        let has_passphrase_slots = master.slots.iter().any(|s| !s.kdf_id.is_empty());
        if !has_passphrase_slots {
            return Err(ContainerError::WrongPassphrase);
        }

        // Prompt loop: retry until a slot opens or the provider gives up.
        loop {
            let provider = self
                .provider
                .lock()
                .expect("provider poisoned")
                .clone()
                .ok_or(ContainerError::EmptyPassphrase)?;
            let mut missing = BTreeSet::new();
            missing.insert(key_id.to_vec());
            let passphrase = (provider.as_ref())(&missing);
            if passphrase.is_empty() {
                return Err(ContainerError::EmptyPassphrase);
            }

            for (index, slot) in master.slots.iter().enumerate() {
                if slot.kdf_id.is_empty() {
                    continue;
                }
                let Ok(kdf) = self.kdf(&slot.kdf_id) else {
                    continue;
                };
                let derived = kdf.derive(&passphrase)?;
                if let Some(plain) = self.try_slot(slot, &derived, key_id) {
                    return Ok((plain, index));
                }
            }
            tracing::debug!("passphrase did not open any slot, re-prompting");
        }
    }

    /// Attempts one slot under a candidate key; verifies the decrypted
    /// master key by recomputing its id.
    fn try_slot(&self, slot: &CipherData, key: &[u8], expected_id: &[u8]) -> Option<SecureBytes> {
        let plain = aes_cbc_decrypt(key, &slot.iv, &slot.cipher_text).ok()?;
        let plain = SecureBytes::new(plain);
        (encryption_key_id(&plain) == expected_id).then_some(plain)
    }

    fn fresh_passphrase_slot(
        &self,
        master_plain: &[u8],
        passphrase: &[u8],
    ) -> ContainerResult<(CipherData, KdfRomix)> {
        let template = self.kdf(&self.default_kdf_id)?;
        let kdf = KdfRomix::new(
            template.memory_bytes(),
            template.iterations(),
            SecureBytes::random(32),
        )
        .map_err(ContainerError::Storage)?;
        let derived = kdf.derive(passphrase)?;
        let iv = SecureBytes::random(AES_IV_LEN);
        let cipher_text = aes_cbc_encrypt(&derived, &iv, master_plain)?;
        let slot = CipherData {
            iv,
            cipher_text: SecureBytes::new(cipher_text),
            kdf_id: kdf.kdf_id().to_vec(),
            encryption_key_id: encryption_key_id(&derived),
        };
        Ok((slot, kdf))
    }

    fn default_key_slot(&self, master_plain: &[u8]) -> ContainerResult<CipherData> {
        let iv = SecureBytes::random(AES_IV_LEN);
        let cipher_text = aes_cbc_encrypt(&self.default_key, &iv, master_plain)?;
        Ok(CipherData {
            iv,
            cipher_text: SecureBytes::new(cipher_text),
            kdf_id: Vec::new(),
            encryption_key_id: self.default_key_id.clone(),
        })
    }

    /// Replaces the slot the current provider unlocks with one protected by
    /// `new_passphrase` (or by the default key when empty), using a fresh IV
    /// and a fresh KDF salt. No other slot changes.
    ///
    /// Must be called outside the scoped lock. Returns the rewritten master
    /// key and the new KDF (if any) for persistence.
    pub fn change_passphrase(
        self: &Arc<Self>,
        new_passphrase: &SecureBytes,
    ) -> ContainerResult<(MasterKey, Option<KdfRomix>)> {
        if self.is_locked() {
            return Err(ContainerError::AlreadyLocked);
        }
        let guard = self.lock();
        let (plain, active) = self.unlock_master_slot(&self.master_key_id.clone())?;

        let (slot, kdf) = if new_passphrase.is_empty() {
            (self.default_key_slot(&plain)?, None)
        } else {
            let (slot, kdf) = self.fresh_passphrase_slot(&plain, new_passphrase)?;
            (slot, Some(kdf))
        };

        let mut master = self.master_key(&self.master_key_id.clone())?;
        master.slots[active] = slot;
        self.register_master_key(master.clone());
        if let Some(kdf) = kdf.clone() {
            self.register_kdf(kdf);
        }
        drop(guard);
        tracing::debug!(master = %hex::encode(&master.id), "passphrase changed");
        Ok((master, kdf))
    }

    /// Adds a passphrase slot. Fails with `CannotAddToUnencrypted` when the
    /// only existing slot is the default key, and with `DuplicateCipher`
    /// when the new passphrase already opens a slot.
    ///
    /// Must be called outside the scoped lock.
    pub fn add_passphrase(
        self: &Arc<Self>,
        new_passphrase: &SecureBytes,
    ) -> ContainerResult<(MasterKey, KdfRomix)> {
        if self.is_locked() {
            return Err(ContainerError::AlreadyLocked);
        }
        if new_passphrase.is_empty() {
            return Err(ContainerError::EmptyPassphrase);
        }
        let guard = self.lock();
        let master_id = self.master_key_id.clone();
        let mut master = self.master_key(&master_id)?;
        if master.is_unencrypted(&self.default_key_id) {
            return Err(ContainerError::CannotAddToUnencrypted);
        }
        let (plain, _) = self.unlock_master_slot(&master_id)?;

        for slot in master.slots.iter().filter(|s| !s.kdf_id.is_empty()) {
            let Ok(kdf) = self.kdf(&slot.kdf_id) else {
                continue;
            };
            let derived = kdf.derive(new_passphrase)?;
            if self.try_slot(slot, &derived, &master_id).is_some() {
                return Err(ContainerError::DuplicateCipher);
            }
        }

        let (slot, kdf) = self.fresh_passphrase_slot(&plain, new_passphrase)?;
        master.slots.push(slot);
        self.register_master_key(master.clone());
        self.register_kdf(kdf.clone());
        drop(guard);
        Ok((master, kdf))
    }

    /// Removes the slot the current provider unlocks. When it is the last
    /// slot the master key becomes protected by the default key and the
    /// container is unencrypted again.
    ///
    /// Must be called outside the scoped lock.
    pub fn erase_passphrase(self: &Arc<Self>) -> ContainerResult<MasterKey> {
        if self.is_locked() {
            return Err(ContainerError::AlreadyLocked);
        }
        let guard = self.lock();
        let master_id = self.master_key_id.clone();
        let (plain, active) = self.unlock_master_slot(&master_id)?;
        let mut master = self.master_key(&master_id)?;
        if master.slots.len() > 1 {
            master.slots.remove(active);
        } else {
            master.slots = vec![self.default_key_slot(&plain)?];
        }
        self.register_master_key(master.clone());
        drop(guard);
        Ok(master)
    }

    /// Builds a fresh master key protected by `passphrase` (or by the
    /// default key when empty). Returns the key object, its plaintext, and
    /// the new KDF if one was minted.
    pub fn create_master_key(
        &self,
        passphrase: &SecureBytes,
    ) -> ContainerResult<(MasterKey, SecureBytes, Option<KdfRomix>)> {
        let plain = SecureBytes::random(32);
        let id = encryption_key_id(&plain);
        let (slot, kdf) = if passphrase.is_empty() {
            (self.default_key_slot(&plain)?, None)
        } else {
            let (slot, kdf) = self.fresh_passphrase_slot(&plain, passphrase)?;
            (slot, Some(kdf))
        };
        let master = MasterKey {
            id,
            slots: vec![slot],
        };
        self.register_master_key(master.clone());
        if let Some(kdf) = kdf.clone() {
            self.register_kdf(kdf);
        }
        Ok((master, plain, kdf))
    }
}

impl std::fmt::Debug for DecryptedDataContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedDataContainer")
            .field("master_key_id", &hex::encode(&self.master_key_id))
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}
