//! Low-level pooled SQLite connection wrapper. The embedded-file backend
//! only ever needs WAL mode, so there is a single open path with no
//! alternate storage-mode branch to select between.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use super::migrations::run_sqlite_migrations;
use crate::error::Result;

/// A single pooled SQLite connection plus the path it was opened from.
pub struct SqliteStorage {
    db_path: String,
    conn: Arc<Mutex<Connection>>,
}

/// A handle the caller can lock to reach the underlying `rusqlite::Connection`.
pub type PooledConnection = Arc<Mutex<Connection>>;

impl SqliteStorage {
    /// Open or create a database file, running pending migrations.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Self::create_connection(db_path)?;
        run_sqlite_migrations(&conn)?;
        Ok(Self {
            db_path: db_path.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, used by tests and `tests/integration_tests.rs`.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn create_connection(db_path: &str) -> Result<Connection> {
        let conn = if db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(db_path, flags)?
        };
        Self::configure_pragmas(&conn)?;
        Ok(conn)
    }

    fn configure_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA wal_autocheckpoint=1000;
            PRAGMA busy_timeout=30000;
            PRAGMA cache_size=-64000;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
            "#,
        )?;
        Ok(())
    }

    /// Clone the `Arc` handle so callers can move it into `spawn_blocking`.
    pub fn handle(&self) -> PooledConnection {
        self.conn.clone()
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

impl Clone for SqliteStorage {
    fn clone(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            conn: self.conn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
    }

    #[test]
    fn with_transaction_rolls_back_on_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_transaction(|tx| {
            tx.execute_batch("CREATE TABLE t (x INTEGER)")?;
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            Err(crate::error::MementoError::Internal("boom".into()))
        });
        assert!(result.is_err());
        let exists: Result<i64> = storage.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='t'",
                    [],
                    |row| row.get(0),
                )
                .unwrap_or(0))
        });
        assert_eq!(exists.unwrap(), 0);
    }
}
