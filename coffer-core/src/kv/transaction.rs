//! Transactions over a sub-DB.
//!
//! Scoped acquisition with the concurrency contract of the engine:
//!
//! * one writer per sub-DB; cross-thread write requests queue FIFO and
//!   block until the current writer's outermost scope exits;
//! * readers snapshot the committed state at their outermost open and are
//!   undisturbed by later commits;
//! * opening a reader against another thread's live writer fails with
//!   `TxConflict`, as does opening a writer while holding a reader on the
//!   same thread;
//! * nesting on the owning thread is cheap and never blocks — a nested
//!   scope shares the parent's view and buffered mutations, and only the
//!   outermost scope commits.

use std::sync::Arc;

use crate::error::{StorageError, StorageResult};

use super::interface::{DbInterface, PendingAction, PendingOp, ReaderGate, Snapshot, WriterGate};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TxMode {
    Read,
    Write,
}

/// A live transaction on one sub-DB.
///
/// Dropping the outermost write scope commits the buffered mutations; a
/// commit failure is logged and leaves the committed snapshot untouched.
pub struct DbTransaction {
    db: Arc<DbInterface>,
    mode: TxMode,
    snapshot: Arc<Snapshot>,
}

impl DbInterface {
    /// Opens a transaction. `write` selects the mode; see the module docs
    /// for the conflict rules.
    pub fn begin_transaction(self: &Arc<Self>, write: bool) -> StorageResult<DbTransaction> {
        let tid = std::thread::current().id();
        let mut state = self.lock_state();

        // Same-thread nesting under a live writer always yields the writer
        // view, whatever mode was asked for.
        if let Some(writer) = state.writer.as_mut() {
            if writer.thread == tid {
                writer.depth += 1;
                let snapshot = Arc::clone(&writer.snapshot);
                return Ok(DbTransaction {
                    db: Arc::clone(self),
                    mode: TxMode::Write,
                    snapshot,
                });
            }
            if !write {
                // Reader against another thread's writer.
                return Err(StorageError::TxConflict);
            }
        }

        if write {
            if state.readers.contains_key(&tid) {
                return Err(StorageError::TxConflict);
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(ticket);
            while state.writer.is_some() || state.queue.front() != Some(&ticket) {
                state = self
                    .cond
                    .wait(state)
                    .expect("sub-db state poisoned");
            }
            state.queue.pop_front();
            let snapshot = Arc::clone(&state.committed);
            state.writer = Some(WriterGate {
                thread: tid,
                depth: 1,
                ops: Vec::new(),
                insert_index: std::collections::HashMap::new(),
                erased: std::collections::HashSet::new(),
                snapshot: Arc::clone(&snapshot),
            });
            Ok(DbTransaction {
                db: Arc::clone(self),
                mode: TxMode::Write,
                snapshot,
            })
        } else {
            let committed = Arc::clone(&state.committed);
            let gate = state
                .readers
                .entry(tid)
                .or_insert_with(|| ReaderGate {
                    depth: 0,
                    snapshot: committed,
                });
            gate.depth += 1;
            let snapshot = Arc::clone(&gate.snapshot);
            Ok(DbTransaction {
                db: Arc::clone(self),
                mode: TxMode::Read,
                snapshot,
            })
        }
    }
}

impl DbTransaction {
    /// Returns `true` for write-mode views.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.mode == TxMode::Write
    }

    /// Buffers an upsert. Re-inserting a key already pending in this
    /// transaction replaces the pending value in place.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        if self.mode != TxMode::Write {
            return Err(StorageError::InvalidArgument(
                "insert on read-only transaction".into(),
            ));
        }
        let mut state = self.db.lock_state();
        let writer = state.writer.as_mut().expect("write tx without writer gate");
        writer.erased.remove(key);
        if let Some(&pos) = writer.insert_index.get(key) {
            if let Some(op) = writer.ops[pos].as_mut() {
                op.action = PendingAction::Insert(value.to_vec());
                return Ok(());
            }
        }
        writer.insert_index.insert(key.to_vec(), writer.ops.len());
        writer.ops.push(Some(PendingOp {
            key: key.to_vec(),
            action: PendingAction::Insert(value.to_vec()),
        }));
        Ok(())
    }

    /// Buffers an erasure.
    pub fn erase(&self, key: &[u8]) -> StorageResult<()> {
        if self.mode != TxMode::Write {
            return Err(StorageError::InvalidArgument(
                "erase on read-only transaction".into(),
            ));
        }
        let mut state = self.db.lock_state();
        let writer = state.writer.as_mut().expect("write tx without writer gate");
        if let Some(pos) = writer.insert_index.remove(key) {
            writer.ops[pos] = None;
        }
        writer.erased.insert(key.to_vec());
        writer.ops.push(Some(PendingOp {
            key: key.to_vec(),
            action: PendingAction::Erase,
        }));
        Ok(())
    }

    /// Reads a logical key through this transaction's view.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if self.mode == TxMode::Write {
            let state = self.db.lock_state();
            if let Some(writer) = state.writer.as_ref() {
                if writer.erased.contains(key) {
                    return None;
                }
                if let Some(&pos) = writer.insert_index.get(key) {
                    if let Some(PendingOp {
                        action: PendingAction::Insert(value),
                        ..
                    }) = writer.ops[pos].as_ref()
                    {
                        return Some(value.clone());
                    }
                }
            }
        }
        self.snapshot.data.get(key).map(|e| e.value.clone())
    }

    /// Iterates live logical pairs in insertion order of their latest
    /// write. A writer view sees its own pending mutations.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows: Vec<(Vec<u8>, Vec<u8>, u32)> = Vec::new();

        if self.mode == TxMode::Write {
            let state = self.db.lock_state();
            if let Some(writer) = state.writer.as_ref() {
                for (key, entry) in &self.snapshot.data {
                    if writer.erased.contains(key) || writer.insert_index.contains_key(key) {
                        continue;
                    }
                    rows.push((key.clone(), entry.value.clone(), entry.db_key));
                }
                rows.sort_by_key(|(_, _, db_key)| *db_key);
                let mut out: Vec<(Vec<u8>, Vec<u8>)> =
                    rows.into_iter().map(|(k, v, _)| (k, v)).collect();
                for op in writer.ops.iter().flatten() {
                    if let PendingAction::Insert(value) = &op.action {
                        out.push((op.key.clone(), value.clone()));
                    }
                }
                return out;
            }
        }

        for (key, entry) in &self.snapshot.data {
            rows.push((key.clone(), entry.value.clone(), entry.db_key));
        }
        rows.sort_by_key(|(_, _, db_key)| *db_key);
        rows.into_iter().map(|(k, v, _)| (k, v)).collect()
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        let mut state = self.db.lock_state();
        match self.mode {
            TxMode::Write => {
                let depth = {
                    let writer = state.writer.as_mut().expect("write tx without writer gate");
                    writer.depth -= 1;
                    writer.depth
                };
                if depth == 0 {
                    if let Err(err) = self.db.commit_writer(&mut state) {
                        tracing::error!(db = %self.db.name(), %err, "transaction commit failed");
                    }
                    state.writer = None;
                    drop(state);
                    self.db.cond.notify_all();
                }
            }
            TxMode::Read => {
                let tid = std::thread::current().id();
                let done = {
                    let gate = state
                        .readers
                        .get_mut(&tid)
                        .expect("read tx without reader gate");
                    gate.depth -= 1;
                    gate.depth == 0
                };
                if done {
                    state.readers.remove(&tid);
                }
            }
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTransaction")
            .field("db", &self.db.name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
