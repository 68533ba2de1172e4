//! Per-sub-DB encrypted KV engine.
//!
//! A [`DbInterface`] owns one sub-DB of the backing store. Records live
//! under dense 4-byte big-endian counters; every value is an IES packet.
//! The logical `(key, value)` map is decrypted once at load and served from
//! memory; mutations run through [`DbTransaction`](super::DbTransaction)s
//! and commit as one atomic batch that appends new records, writes erasure
//! sentinels, and wipes replaced slots.
//!
//! # Key rotation
//!
//! The first record a sub-DB ever stores is a cycle marker encrypted to
//! key-pair counter 0; everything after it uses counter 1. Each reopen
//! schedules one more cycle marker at the head of the next commit, so the
//! key-pair counter advances once per open-and-write session. Readers
//! recover the schedule by decrypting cycle markers in counter order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use crate::buffer::SecureBytes;
use crate::error::{StorageError, StorageResult};
use crate::store::{BatchOp, KvStore};

use super::ies;

/// One live logical entry.
#[derive(Clone)]
pub(crate) struct DbEntry {
    pub value: Vec<u8>,
    pub db_key: u32,
}

/// Immutable committed view of a sub-DB.
pub(crate) struct Snapshot {
    pub data: BTreeMap<Vec<u8>, DbEntry>,
    pub top_counter: u32,
    pub keypair_counter: u32,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            data: BTreeMap::new(),
            top_counter: 0,
            keypair_counter: 0,
        }
    }
}

/// A buffered mutation.
pub(crate) enum PendingAction {
    Insert(Vec<u8>),
    Erase,
}

pub(crate) struct PendingOp {
    pub key: Vec<u8>,
    pub action: PendingAction,
}

/// State of the single live writer.
pub(crate) struct WriterGate {
    pub thread: ThreadId,
    pub depth: usize,
    /// Ops in arrival order; coalesced inserts are edited in place and
    /// superseded ops become `None`.
    pub ops: Vec<Option<PendingOp>>,
    /// Position of the pending insert for each key, if any.
    pub insert_index: HashMap<Vec<u8>, usize>,
    /// Keys erased in this transaction and not since re-inserted.
    pub erased: HashSet<Vec<u8>>,
    pub snapshot: Arc<Snapshot>,
}

pub(crate) struct ReaderGate {
    pub depth: usize,
    pub snapshot: Arc<Snapshot>,
}

pub(crate) struct TxState {
    pub committed: Arc<Snapshot>,
    /// One cycle marker is due at the head of the next commit.
    pub needs_cycle: bool,
    pub writer: Option<WriterGate>,
    pub readers: HashMap<ThreadId, ReaderGate>,
    /// FIFO of writer tickets waiting for the gate.
    pub queue: VecDeque<u64>,
    pub next_ticket: u64,
}

/// Encrypted interface over one sub-DB.
pub struct DbInterface {
    name: String,
    store: Arc<dyn KvStore>,
    salted_root: SecureBytes,
    pub(crate) state: Mutex<TxState>,
    pub(crate) cond: Condvar,
}

impl DbInterface {
    /// Binds a sub-DB, creating it in the backing store if needed.
    ///
    /// `control_salt` mixes with the decrypted `control_root` to anchor this
    /// sub-DB's private key stream.
    pub fn new(
        store: Arc<dyn KvStore>,
        name: &str,
        control_salt: &[u8],
        control_root: &[u8],
    ) -> StorageResult<Arc<Self>> {
        store.create_db(name)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            store,
            salted_root: ies::salted_root(control_salt, control_root),
            state: Mutex::new(TxState {
                committed: Arc::new(Snapshot::empty()),
                needs_cycle: true,
                writer: None,
                readers: HashMap::new(),
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            cond: Condvar::new(),
        }))
    }

    /// Sub-DB name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live logical entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.lock_state().committed.data.len()
    }

    /// Returns `true` while any transaction is live on this sub-DB.
    #[must_use]
    pub fn has_live_transactions(&self) -> bool {
        let state = self.lock_state();
        state.writer.is_some() || !state.readers.is_empty() || !state.queue.is_empty()
    }

    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, TxState> {
        self.state.lock().expect("sub-db state poisoned")
    }

    /// Scans every record in counter order, rebuilding the logical map and
    /// the key-pair schedule.
    ///
    /// # Errors
    ///
    /// Any record that fails to decrypt or verify aborts the load with
    /// [`StorageError::Corrupt`].
    pub fn load_all_entries(&self) -> StorageResult<()> {
        let records = self.store.scan(&self.name)?;

        let mut data: BTreeMap<Vec<u8>, DbEntry> = BTreeMap::new();
        let mut keypair_counter = 0u32;
        let mut key_pair = ies::key_pair_for(&self.salted_root, keypair_counter)?;
        let mut top_counter = 0u32;

        for (index, (raw_key, packet)) in records.iter().enumerate() {
            let counter = parse_record_key(raw_key)?;
            if index == 0 && counter != 0 {
                return Err(StorageError::corrupt("first record is not at counter 0"));
            }

            let (data_key, data_val) = ies::decrypt_record(&key_pair, counter, packet)
                .map_err(|err| match err {
                    StorageError::BadKey | StorageError::Tampered(_) => StorageError::corrupt(
                        format!("record {counter} failed verification: {err}"),
                    ),
                    other => other,
                })?;

            if data_key.is_empty() {
                if data_val == ies::CYCLE_FLAG {
                    keypair_counter = keypair_counter.checked_add(1).ok_or_else(|| {
                        StorageError::corrupt("key-pair counter overflow")
                    })?;
                    key_pair = ies::key_pair_for(&self.salted_root, keypair_counter)?;
                } else {
                    // Erasure sentinel; the slot it names is already gone.
                    ies::parse_erasure_value(&data_val)?;
                }
            } else {
                data.insert(data_key, DbEntry {
                    value: data_val,
                    db_key: counter,
                });
            }

            top_counter = counter
                .checked_add(1)
                .ok_or_else(|| StorageError::corrupt("record counter overflow"))?;
        }

        tracing::debug!(
            db = %self.name,
            entries = data.len(),
            keypair_counter,
            "loaded sub-db"
        );

        let mut state = self.lock_state();
        state.committed = Arc::new(Snapshot {
            data,
            top_counter,
            keypair_counter,
        });
        state.needs_cycle = true;
        Ok(())
    }

    /// Applies the live writer's buffered ops as one atomic batch and swaps
    /// in the new committed snapshot. Called with the state lock held when
    /// the outermost write scope exits.
    pub(crate) fn commit_writer(&self, state: &mut TxState) -> StorageResult<()> {
        let writer = state
            .writer
            .as_mut()
            .expect("commit without a live writer");
        let ops = std::mem::take(&mut writer.ops);
        if ops.iter().all(Option::is_none) {
            return Ok(());
        }

        let mut data = state.committed.data.clone();
        let mut top = state.committed.top_counter;
        let mut keypair_counter = state.committed.keypair_counter;
        let mut batch: Vec<BatchOp> = Vec::new();
        let mut wrote_cycle = false;

        if state.needs_cycle {
            let marker_pair = ies::key_pair_for(&self.salted_root, keypair_counter)?;
            let packet = ies::encrypt_record(&marker_pair, top, b"", ies::CYCLE_FLAG)?;
            batch.push(BatchOp::Put {
                key: record_key(top),
                value: packet,
            });
            top = bump(top)?;
            keypair_counter = keypair_counter
                .checked_add(1)
                .ok_or_else(|| StorageError::corrupt("key-pair counter overflow"))?;
            wrote_cycle = true;
            tracing::trace!(db = %self.name, keypair_counter, "cycled record key pair");
        }

        let key_pair = ies::key_pair_for(&self.salted_root, keypair_counter)?;

        for op in ops.into_iter().flatten() {
            match op.action {
                PendingAction::Insert(value) => {
                    if let Some(old) = data.get(&op.key) {
                        let old_key = old.db_key;
                        self.retire_record(&key_pair, old_key, &mut top, &mut batch)?;
                    }
                    let packet = ies::encrypt_record(&key_pair, top, &op.key, &value)?;
                    batch.push(BatchOp::Put {
                        key: record_key(top),
                        value: packet,
                    });
                    data.insert(op.key, DbEntry {
                        value,
                        db_key: top,
                    });
                    top = bump(top)?;
                }
                PendingAction::Erase => {
                    if let Some(old) = data.remove(&op.key) {
                        self.retire_record(&key_pair, old.db_key, &mut top, &mut batch)?;
                    }
                }
            }
        }

        self.store.write_batch(&self.name, batch)?;

        state.committed = Arc::new(Snapshot {
            data,
            top_counter: top,
            keypair_counter,
        });
        if wrote_cycle {
            state.needs_cycle = false;
        }
        Ok(())
    }

    /// Writes the erasure sentinel for a replaced or erased record, then
    /// overwrites its slot with a same-length filler packet and deletes it.
    fn retire_record(
        &self,
        key_pair: &ies::RecordKeyPair,
        old_counter: u32,
        top: &mut u32,
        batch: &mut Vec<BatchOp>,
    ) -> StorageResult<()> {
        let sentinel =
            ies::encrypt_record(key_pair, *top, b"", &ies::erasure_value(old_counter))?;
        batch.push(BatchOp::Put {
            key: record_key(*top),
            value: sentinel,
        });
        *top = bump(*top)?;

        let slot = record_key(old_counter);
        if let Some(old_packet) = self.store.get(&self.name, &slot)? {
            batch.push(BatchOp::Put {
                key: slot.clone(),
                value: ies::filler_packet(old_packet.len()),
            });
        }
        batch.push(BatchOp::Delete { key: slot });
        Ok(())
    }
}

impl std::fmt::Debug for DbInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInterface")
            .field("name", &self.name)
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}

/// Encodes a record counter as its 4-byte big-endian storage key.
#[must_use]
pub(crate) fn record_key(counter: u32) -> Vec<u8> {
    counter.to_be_bytes().to_vec()
}

fn parse_record_key(raw: &[u8]) -> StorageResult<u32> {
    let arr: [u8; 4] = raw
        .try_into()
        .map_err(|_| StorageError::corrupt("record key is not a 4-byte counter"))?;
    Ok(u32::from_be_bytes(arr))
}

fn bump(counter: u32) -> StorageResult<u32> {
    counter
        .checked_add(1)
        .ok_or_else(|| StorageError::corrupt("record counter overflow"))
}
