//! The persistent local store (spec §4.B): `StoredNode`/`Chunk`/`NodeChunk`
//! rows plus the on-disk bytes they describe. Grounded in
//! `lansync/node.py` (`LocalNode.write_chunk`, `store_new_node`,
//! `create_node_placeholder`) and `lansync/models.py` (`StoredNode`),
//! adapted from peewee's ORM rows to plain `rusqlite` statements.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::chunker::read_chunk_at;
use crate::db::Db;
use crate::error::Result;
use crate::model::{NodeChunk, StoredNode};

/// A chunk found during local reuse lookup: enough to locate and re-read
/// its bytes without holding the DB lock while doing file I/O.
pub struct FoundChunk {
    pub node_chunk: NodeChunk,
    pub source_path: PathBuf,
}

impl FoundChunk {
    pub fn read(&self) -> Result<Vec<u8>> {
        read_chunk_at(&self.source_path, self.node_chunk.offset, self.node_chunk.size)
    }
}

/// `find_chunk(namespace, hash)` (spec §4.B): first `(NodeChunk, Chunk,
/// StoredNode)` row in `namespace` whose chunk hash matches, paired with a
/// deferred reader. Used both to fulfil local chunk reuse during receive
/// and to serve a peer's `GET /chunk/{namespace}/{hash}`.
pub fn find_chunk(db: &Db, namespace_row_id: i64, hash: &str) -> Result<Option<FoundChunk>> {
    db.with_conn(|conn| {
        let row: Option<(u64, u32, i64, String)> = conn
            .query_row(
                "SELECT nc.offset, c.size, sn.root_folder_id, sn.path \
                 FROM node_chunk nc \
                 JOIN chunk c ON c.id = nc.chunk_id \
                 JOIN stored_node sn ON sn.id = nc.stored_node_id \
                 WHERE sn.namespace_id = ?1 AND c.hash = ?2 AND sn.ready = 1 \
                 LIMIT 1",
                rusqlite::params![namespace_row_id, hash],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .ok();

        let Some((offset, size, root_folder_id, path)) = row else {
            return Ok(None);
        };
        let root_folder: String = conn.query_row(
            "SELECT path FROM root_folder WHERE id = ?1",
            [root_folder_id],
            |r| r.get(0),
        )?;
        Ok(Some(FoundChunk {
            node_chunk: NodeChunk { hash: hash.to_string(), size, offset },
            source_path: PathBuf::from(root_folder).join(path),
        }))
    })
}

/// `write_chunk(node, chunk, data)` (spec §4.B): seek-write the bytes, then
/// upsert the `Chunk`/`NodeChunk` rows in the same atomic section as the
/// file write so readers never observe one without the other.
pub fn write_chunk(db: &Db, stored_node_id: i64, file_path: &Path, chunk: &NodeChunk, data: &[u8]) -> Result<()> {
    db.atomic(|conn| write_chunk_conn(conn, stored_node_id, file_path, chunk, data))
}

/// Same as `write_chunk`, but assumes the caller is already inside a
/// `Db::atomic` section — used by the receive engine to write every
/// offset sharing one chunk hash (spec §4.H step 5, "write bytes at every
/// offset... inside one DB atomic section") without nesting a fresh
/// transaction per offset.
pub fn write_chunk_conn(conn: &rusqlite::Connection, stored_node_id: i64, file_path: &Path, chunk: &NodeChunk, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(file_path)?;
    file.seek(SeekFrom::Start(chunk.offset))?;
    file.write_all(data)?;
    file.flush()?;
    index_chunk(conn, stored_node_id, chunk)
}

/// Upserts the `chunk`/`node_chunk` rows for bytes already correctly
/// present on disk at their offset, without touching the file — used by
/// the send path, where the local file is already complete and only the
/// chunk index needs to catch up (spec §4.H step 1).
pub fn index_chunk(conn: &rusqlite::Connection, stored_node_id: i64, chunk: &NodeChunk) -> Result<()> {
    conn.execute(
        "INSERT INTO chunk(hash, size) VALUES (?1, ?2) ON CONFLICT(hash) DO NOTHING",
        rusqlite::params![chunk.hash, chunk.size],
    )?;
    let chunk_id: i64 = conn.query_row("SELECT id FROM chunk WHERE hash = ?1", [&chunk.hash], |r| r.get(0))?;
    conn.execute(
        "INSERT INTO node_chunk(stored_node_id, chunk_id, offset) VALUES (?1, ?2, ?3) \
         ON CONFLICT(stored_node_id, offset) DO UPDATE SET chunk_id = excluded.chunk_id",
        rusqlite::params![stored_node_id, chunk_id, chunk.offset as i64],
    )?;
    Ok(())
}

/// `create_placeholder(path, size)` (spec §4.B): sparse file of `size`
/// bytes. Idempotent — re-running it on an already-correctly-sized file is
/// a no-op in effect (seek+write-zero-byte is safe to repeat).
pub fn create_placeholder(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).write(true).open(path)?;
    if size > 0 {
        file.seek(SeekFrom::Start(size - 1))?;
        file.write_all(&[0u8])?;
    }
    Ok(())
}

pub struct NewStoredNode<'a> {
    pub namespace_row_id: i64,
    pub root_folder_id: i64,
    pub key: &'a str,
    pub path: &'a str,
    pub checksum: Option<&'a str>,
    pub size: u64,
    pub signature: Option<&'a str>,
    pub local_mtime: i64,
    pub local_ctime: i64,
    pub ready: bool,
}

/// `StoredNode.create` (`lansync/node.py`). Caller is expected to already
/// be inside a `db.atomic` section when this needs to be combined with
/// chunk inserts and the deletion of a superseded row (spec §4.H step 1).
pub fn insert_stored_node(conn: &rusqlite::Connection, new: &NewStoredNode) -> Result<i64> {
    conn.execute(
        "INSERT INTO stored_node(namespace_id, root_folder_id, key, path, checksum, size, signature, local_mtime, local_ctime, ready) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(namespace_id, key) DO UPDATE SET \
            path = excluded.path, checksum = excluded.checksum, size = excluded.size, \
            signature = excluded.signature, local_mtime = excluded.local_mtime, \
            local_ctime = excluded.local_ctime, ready = excluded.ready",
        rusqlite::params![
            new.namespace_row_id,
            new.root_folder_id,
            new.key,
            new.path,
            new.checksum,
            new.size as i64,
            new.signature,
            new.local_mtime,
            new.local_ctime,
            new.ready,
        ],
    )?;
    let id = conn.query_row(
        "SELECT id FROM stored_node WHERE namespace_id = ?1 AND key = ?2",
        rusqlite::params![new.namespace_row_id, new.key],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn delete_stored_node(conn: &rusqlite::Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM stored_node WHERE id = ?1", [id])?;
    Ok(())
}

pub fn stored_node_by_key(db: &Db, namespace_row_id: i64, key: &str) -> Result<Option<StoredNode>> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT id, key, path, checksum, size, signature, local_mtime, local_ctime, ready \
             FROM stored_node WHERE namespace_id = ?1 AND key = ?2",
            rusqlite::params![namespace_row_id, key],
            |r| {
                Ok(StoredNode {
                    id: r.get(0)?,
                    namespace: String::new(),
                    key: r.get(1)?,
                    path: r.get(2)?,
                    checksum: r.get(3)?,
                    size: r.get::<_, i64>(4)? as u64,
                    signature: r.get(5)?,
                    local_mtime: r.get(6)?,
                    local_ctime: r.get(7)?,
                    ready: r.get(8)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            e => Err(e.into()),
        })
    })
}

/// Marks a node's bytes complete: `sync_with_local` (spec §4.H step 7) —
/// `ready=true` plus the mtime/ctime read off the now-finished file.
pub fn mark_ready(conn: &rusqlite::Connection, stored_node_id: i64, mtime: i64, ctime: i64) -> Result<()> {
    conn.execute(
        "UPDATE stored_node SET ready = 1, local_mtime = ?2, local_ctime = ?3 WHERE id = ?1",
        rusqlite::params![stored_node_id, mtime, ctime],
    )?;
    Ok(())
}

pub fn record_conflict(conn: &rusqlite::Connection, namespace_row_id: i64, key: &str, detected_at: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO conflicts(namespace_id, key, detected_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![namespace_row_id, key, detected_at],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Db, i64, i64, tempfile::TempDir) {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ns_id = db.with_conn(|conn| crate::db::namespace_id(conn, "ns")).unwrap();
        let rf_id = db
            .with_conn(|conn| crate::db::root_folder_id(conn, dir.path().to_str().unwrap()))
            .unwrap();
        (db, ns_id, rf_id, dir)
    }

    #[test]
    fn create_placeholder_produces_exact_size_sparse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/placeholder.bin");
        create_placeholder(&path, 4096).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[test]
    fn write_chunk_then_find_chunk_round_trips() {
        let (db, ns_id, rf_id, dir) = setup();
        let file_path = dir.path().join("f.bin");
        create_placeholder(&file_path, 10).unwrap();

        let stored_id = db
            .atomic(|conn| {
                insert_stored_node(
                    conn,
                    &NewStoredNode {
                        namespace_row_id: ns_id,
                        root_folder_id: rf_id,
                        key: "k1",
                        path: "f.bin",
                        checksum: None,
                        size: 10,
                        signature: None,
                        local_mtime: 0,
                        local_ctime: 0,
                        ready: false,
                    },
                )
            })
            .unwrap();

        let chunk = NodeChunk { hash: crate::model::md5_hex(b"hello"), size: 5, offset: 0 };
        write_chunk(&db, stored_id, &file_path, &chunk, b"hello").unwrap();

        let found = find_chunk(&db, ns_id, &chunk.hash).unwrap();
        assert!(found.is_none(), "stored_node not yet ready must not be offered for reuse");

        db.atomic(|conn| {
            mark_ready(conn, stored_id, 100, 100)?;
            Ok(())
        })
        .unwrap();

        let found = find_chunk(&db, ns_id, &chunk.hash).unwrap().expect("now ready");
        assert_eq!(found.read().unwrap(), b"hello");
    }
}
