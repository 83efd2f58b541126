//! The embedded SQL store and its process-wide, re-entrant transaction
//! lock (spec §5 "Locks": "one process-wide DB transaction lock
//! (re-entrant)"). Grounded in `lansync/database.py`'s `atomic()` context
//! manager, which wraps a `threading.RLock` around `peewee`'s own
//! `database.atomic()`.
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, so it is parked behind
//! a `parking_lot::ReentrantMutex` rather than an async mutex: DB work in
//! this crate is blocking I/O dispatched onto the worker pool (spec §5
//! "Scheduling model"), never held across an `.await`.

use std::cell::{Cell, RefCell};
use std::path::Path;

use parking_lot::ReentrantMutex;
use rusqlite::Connection;

use crate::error::Result;

pub struct Db {
    conn: ReentrantMutex<RefCell<Connection>>,
    depth: ReentrantMutex<Cell<u32>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Db> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        let db = Db {
            conn: ReentrantMutex::new(RefCell::new(conn)),
            depth: ReentrantMutex::new(Cell::new(0)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Db> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Db {
            conn: ReentrantMutex::new(RefCell::new(conn)),
            depth: ReentrantMutex::new(Cell::new(0)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Runs `f` inside the process-wide DB lock. Nested calls (the lock is
    /// re-entrant, matching the Python `RLock`) share the outermost
    /// transaction: only the outermost `atomic` call issues `BEGIN` /
    /// `COMMIT`/`ROLLBACK`.
    pub fn atomic<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn_guard = self.conn.lock();
        let depth_guard = self.depth.lock();
        let conn = conn_guard.borrow();

        let top_level = depth_guard.get() == 0;
        if top_level {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        depth_guard.set(depth_guard.get() + 1);

        let result = f(&conn);

        depth_guard.set(depth_guard.get() - 1);
        if top_level {
            match &result {
                Ok(_) => conn.execute_batch("COMMIT")?,
                Err(_) => conn.execute_batch("ROLLBACK")?,
            }
        }
        result
    }

    /// Read-only convenience wrapper: still serialized through the same
    /// lock (readers outside an atomic section may observe any committed
    /// prefix, per spec §5, but must not race the writer thread).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn_guard = self.conn.lock();
        let conn = conn_guard.borrow();
        f(&conn)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespace (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS root_folder (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS device (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS stored_node (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace_id   INTEGER NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
    root_folder_id INTEGER NOT NULL REFERENCES root_folder(id) ON DELETE CASCADE,
    key            TEXT NOT NULL,
    path           TEXT NOT NULL,
    checksum       TEXT,
    size           INTEGER NOT NULL,
    signature      TEXT,
    local_mtime    INTEGER NOT NULL,
    local_ctime    INTEGER NOT NULL,
    ready          INTEGER NOT NULL DEFAULT 0,
    UNIQUE(namespace_id, key)
);
CREATE INDEX IF NOT EXISTS idx_stored_node_key ON stored_node(namespace_id, key);

CREATE TABLE IF NOT EXISTS remote_node (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace_id     INTEGER NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
    key              TEXT NOT NULL,
    sequence_number  INTEGER NOT NULL,
    path             TEXT NOT NULL,
    timestamp        TEXT NOT NULL,
    checksum         TEXT,
    size             INTEGER NOT NULL,
    chunks_json      TEXT NOT NULL,
    signature        TEXT,
    UNIQUE(namespace_id, key)
);
CREATE INDEX IF NOT EXISTS idx_remote_node_seq ON remote_node(namespace_id, sequence_number);

CREATE TABLE IF NOT EXISTS chunk (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS node_chunk (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    stored_node_id INTEGER NOT NULL REFERENCES stored_node(id) ON DELETE CASCADE,
    chunk_id       INTEGER NOT NULL REFERENCES chunk(id) ON DELETE CASCADE,
    offset         INTEGER NOT NULL,
    UNIQUE(stored_node_id, offset)
);
CREATE INDEX IF NOT EXISTS idx_node_chunk_chunk ON node_chunk(chunk_id);

CREATE TABLE IF NOT EXISTS market (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace_id INTEGER NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
    key          TEXT NOT NULL,
    data         BLOB NOT NULL,
    UNIQUE(namespace_id, key)
);

CREATE TABLE IF NOT EXISTS conflicts (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace_id INTEGER NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
    key          TEXT NOT NULL,
    detected_at  TEXT NOT NULL
);
"#;

/// `Namespace.by_name` / `RootFolder.by_path` (`lansync/models.py`):
/// get-or-create by unique name, returning the row id.
pub fn namespace_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO namespace(name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        [name],
    )?;
    let id = conn.query_row("SELECT id FROM namespace WHERE name = ?1", [name], |r| r.get(0))?;
    Ok(id)
}

pub fn root_folder_id(conn: &Connection, path: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO root_folder(path) VALUES (?1) ON CONFLICT(path) DO NOTHING",
        [path],
    )?;
    let id = conn.query_row("SELECT id FROM root_folder WHERE path = ?1", [path], |r| r.get(0))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_atomic_shares_one_transaction() {
        let db = Db::open_in_memory().unwrap();
        db.atomic(|conn| {
            namespace_id(conn, "ns")?;
            db.atomic(|conn| {
                conn.execute("INSERT INTO root_folder(path) VALUES ('/tmp')", [])?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM root_folder", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rollback_on_error_is_atomic() {
        let db = Db::open_in_memory().unwrap();
        let result: Result<()> = db.atomic(|conn| {
            conn.execute("INSERT INTO namespace(name) VALUES ('ns')", [])?;
            Err(crate::error::Error::Protocol("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM namespace", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
