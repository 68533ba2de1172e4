//! SQLite-backed store.
//!
//! One wallet is one SQLite file; each sub-DB maps to its own table with a
//! `BLOB` primary key, which SQLite orders by memcmp — exactly the ascending
//! byte order the engine's counter keys need. `secure_delete` is switched on
//! so overwritten and deleted record bytes are zeroed in the file rather
//! than left in free pages.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{StorageError, StorageResult};

use super::{BatchOp, KvStore};

/// SQLite implementation of the backing-store contract.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Opens (or creates) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::io("create wallet directory", e))?;
            }
        }
        let conn = Connection::open(&path)?;
        // secure_delete backs the erase-durability guarantee: freed pages
        // are zeroed instead of retaining stale ciphertext. These pragmas
        // report their new value as a row, so they go through query_row.
        conn.query_row("PRAGMA secure_delete = ON", [], |row| row.get::<_, i64>(0))
            .optional()?;
        conn.query_row("PRAGMA journal_mode = TRUNCATE", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Maps a sub-DB name to its table name. Hex keeps arbitrary names out
    /// of SQL identifier territory.
    fn table_name(db: &str) -> String {
        format!("kv_{}", hex::encode(db.as_bytes()))
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Backend("connection mutex poisoned".into()))
    }
}

impl KvStore for SqliteStore {
    fn create_db(&self, name: &str) -> StorageResult<()> {
        let table = Self::table_name(name);
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                 key   BLOB PRIMARY KEY,\
                 value BLOB NOT NULL\
             ) WITHOUT ROWID;"
        ))?;
        Ok(())
    }

    fn has_db(&self, name: &str) -> StorageResult<bool> {
        let table = Self::table_name(name);
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get(&self, db: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let table = Self::table_name(db);
        let conn = self.lock()?;
        let value: Option<Vec<u8>> = conn
            .query_row(
                &format!("SELECT value FROM \"{table}\" WHERE key = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn scan(&self, db: &str) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = Self::table_name(db);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT key, value FROM \"{table}\" ORDER BY key ASC"
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn write_batch(&self, db: &str, ops: Vec<BatchOp>) -> StorageResult<()> {
        let table = Self::table_name(db);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut put = tx.prepare(&format!(
                "INSERT INTO \"{table}\" (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ))?;
            let mut delete = tx.prepare(&format!("DELETE FROM \"{table}\" WHERE key = ?1"))?;
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete { key } => {
                        delete.execute(params![key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
