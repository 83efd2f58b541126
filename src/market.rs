//! The per-file availability bitmap CRDT (spec §4.C) and its persistence.
//! Grounded directly in `lansync/market.py`'s `ChunkSet`/`Market` classes;
//! the merge rule, `exchange_with_db` transaction shape, and binary record
//! layout are all carried over unchanged in meaning.

use std::collections::BTreeMap;

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::Result;

/// A bitset over an ordered, fixed list of chunk positions. All mutating
/// operations return a new value (spec §9 "ChunkSet immutability") rather
/// than mutating in place, which keeps the CRDT reasoning simple: there is
/// never a partially-mutated bitset visible to another thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    pub chunks_count: u32,
    pub chunks: Vec<u8>,
}

impl ChunkSet {
    pub fn empty(chunks_count: u32) -> ChunkSet {
        ChunkSet {
            chunks_count,
            chunks: vec![0u8; chunks_count.div_ceil(8) as usize],
        }
    }

    pub fn full(chunks_count: u32) -> ChunkSet {
        ChunkSet {
            chunks_count,
            chunks: vec![0xFFu8; chunks_count.div_ceil(8) as usize],
        }
    }

    pub fn has(&self, position: usize) -> bool {
        let byte = match self.chunks.get(position / 8) {
            Some(b) => *b,
            None => return false,
        };
        (byte & (1 << (position % 8))) != 0
    }

    pub fn has_all(&self) -> bool {
        (0..self.chunks_count as usize).all(|p| self.has(p))
    }

    pub fn mark(&self, position: usize) -> ChunkSet {
        let mut chunks = self.chunks.clone();
        if position / 8 >= chunks.len() {
            chunks.resize(position / 8 + 1, 0);
        }
        chunks[position / 8] |= 1 << (position % 8);
        ChunkSet {
            chunks_count: self.chunks_count.max(position as u32 + 1),
            chunks,
        }
    }

    fn zip_bytes(a: &[u8], b: &[u8]) -> Vec<(u8, u8)> {
        let len = a.len().max(b.len());
        (0..len)
            .map(|i| (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0)))
            .collect()
    }

    /// Pointwise bitwise OR, count = max of both counts. Commutative,
    /// associative, idempotent (spec §8 "Bitmap laws").
    pub fn merge(&self, other: &ChunkSet) -> ChunkSet {
        ChunkSet {
            chunks_count: self.chunks_count.max(other.chunks_count),
            chunks: Self::zip_bytes(&self.chunks, &other.chunks)
                .into_iter()
                .map(|(x, y)| x | y)
                .collect(),
        }
    }

    /// Pointwise AND-NOT: bits set in `self` but not in `other`.
    pub fn diff(&self, other: &ChunkSet) -> ChunkSet {
        ChunkSet {
            chunks_count: self.chunks_count.max(other.chunks_count),
            chunks: Self::zip_bytes(&self.chunks, &other.chunks)
                .into_iter()
                .map(|(x, y)| x & !y)
                .collect(),
        }
    }

    pub fn pick_random(&self) -> Option<usize> {
        (0..self.chunks_count as usize).filter(|&p| self.has(p)).choose(&mut rand::thread_rng())
    }
}

/// `{namespace, key, peers: Map<device_id, ChunkSet>}` — the grow-only
/// map-of-bitsets CRDT (spec §4.C).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Market {
    pub namespace: String,
    pub key: String,
    pub peers: BTreeMap<String, ChunkSet>,
}

/// Wire record for the binary schema of spec §6 ("Market binary schema"):
/// field order fixed, `chunks` is the packed little-endian bit vector.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct MarketPeerRecord {
    device_id: String,
    chunks_count: u32,
    chunks: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MarketRecord {
    namespace: String,
    key: String,
    peers: Vec<MarketPeerRecord>,
}

impl Market {
    pub fn for_file_provider(namespace: &str, key: &str, src: &str, peers: impl Iterator<Item = String>, chunks_count: u32) -> Market {
        let mut peer_map: BTreeMap<String, ChunkSet> =
            peers.map(|p| (p, ChunkSet::empty(chunks_count))).collect();
        peer_map.insert(src.to_string(), ChunkSet::full(chunks_count));
        Market {
            namespace: namespace.to_string(),
            key: key.to_string(),
            peers: peer_map,
        }
    }

    pub fn for_file_consumer(namespace: &str, key: &str, current: &str, peers: impl Iterator<Item = String>, chunks_count: u32) -> Market {
        let mut peer_map: BTreeMap<String, ChunkSet> =
            peers.map(|p| (p, ChunkSet::empty(chunks_count))).collect();
        peer_map.entry(current.to_string()).or_insert_with(|| ChunkSet::empty(chunks_count));
        Market {
            namespace: namespace.to_string(),
            key: key.to_string(),
            peers: peer_map,
        }
    }

    /// Merges `other` into `self` in place: peers present on both sides
    /// get their ChunkSets OR-ed together; peers present on only one side
    /// are taken as-is. Commutative, associative, idempotent.
    pub fn merge(&mut self, other: &Market) {
        for (device_id, chunk_set) in &other.peers {
            self.peers
                .entry(device_id.clone())
                .and_modify(|existing| *existing = existing.merge(chunk_set))
                .or_insert_with(|| chunk_set.clone());
        }
    }

    fn to_record(&self) -> MarketRecord {
        MarketRecord {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            peers: self
                .peers
                .iter()
                .map(|(device_id, cs)| MarketPeerRecord {
                    device_id: device_id.clone(),
                    chunks_count: cs.chunks_count,
                    chunks: cs.chunks.clone(),
                })
                .collect(),
        }
    }

    fn from_record(record: MarketRecord) -> Market {
        Market {
            namespace: record.namespace,
            key: record.key,
            peers: record
                .peers
                .into_iter()
                .map(|p| (p.device_id, ChunkSet { chunks_count: p.chunks_count, chunks: p.chunks }))
                .collect(),
        }
    }

    pub fn dump(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.to_record())?)
    }

    pub fn load(bytes: &[u8]) -> Result<Market> {
        let record: MarketRecord = bincode::deserialize(bytes)?;
        Ok(Market::from_record(record))
    }

    fn load_from_db(db: &Db, namespace_id: i64, namespace: &str, key: &str) -> Result<Option<Market>> {
        db.with_conn(|conn| {
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM market WHERE namespace_id = ?1 AND key = ?2",
                    rusqlite::params![namespace_id, key],
                    |r| r.get(0),
                )
                .ok();
            match data {
                Some(bytes) => Ok(Some(Market::load(&bytes)?)),
                None => {
                    let _ = namespace;
                    Ok(None)
                }
            }
        })
    }

    /// `exchange_with_db` (spec §4.C "Persistence"): inside the DB atomic
    /// section, read the stored Market; if absent, insert `self`; else
    /// merge the stored value into `self` and write back. Gives
    /// linearizable per-key market updates from any thread.
    pub fn exchange_with_db(&mut self, db: &Db, namespace_row_id: i64) -> Result<()> {
        db.atomic(|conn| {
            let existing: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM market WHERE namespace_id = ?1 AND key = ?2",
                    rusqlite::params![namespace_row_id, self.key],
                    |r| r.get(0),
                )
                .ok();

            match existing {
                None => {
                    conn.execute(
                        "INSERT INTO market(namespace_id, key, data) VALUES (?1, ?2, ?3)",
                        rusqlite::params![namespace_row_id, self.key, self.dump()?],
                    )?;
                }
                Some(bytes) => {
                    let other = Market::load(&bytes)?;
                    self.merge(&other);
                    conn.execute(
                        "UPDATE market SET data = ?1 WHERE namespace_id = ?2 AND key = ?3",
                        rusqlite::params![self.dump()?, namespace_row_id, self.key],
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn load_for_key(db: &Db, namespace_row_id: i64, namespace: &str, key: &str) -> Result<Option<Market>> {
        Market::load_from_db(db, namespace_row_id, namespace, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_has() {
        let cs = ChunkSet::empty(8).mark(3);
        assert!(cs.has(3));
        assert!(!cs.has(4));
    }

    #[test]
    fn merge_is_idempotent() {
        let cs = ChunkSet::empty(8).mark(1).mark(5);
        assert_eq!(cs.merge(&cs), cs);
    }

    #[test]
    fn merge_is_commutative() {
        let a = ChunkSet::empty(8).mark(1);
        let b = ChunkSet::empty(8).mark(5);
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_associative() {
        let a = ChunkSet::empty(8).mark(0);
        let b = ChunkSet::empty(8).mark(3);
        let c = ChunkSet::empty(8).mark(6);
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn merge_has_is_or() {
        let a = ChunkSet::empty(8).mark(1);
        let b = ChunkSet::empty(8).mark(5);
        let merged = a.merge(&b);
        for i in 0..8 {
            assert_eq!(merged.has(i), a.has(i) || b.has(i));
        }
    }

    #[test]
    fn diff_has_is_and_not() {
        let a = ChunkSet::empty(8).mark(1).mark(5);
        let b = ChunkSet::empty(8).mark(5);
        let d = a.diff(&b);
        for i in 0..8 {
            assert_eq!(d.has(i), a.has(i) && !b.has(i));
        }
    }

    #[test]
    fn full_has_all() {
        assert!(ChunkSet::full(17).has_all());
        assert!(!ChunkSet::empty(17).has_all());
    }

    #[test]
    fn market_merge_is_commutative_idempotent_and_associative() {
        let m1 = Market::for_file_provider("ns", "k", "a", ["b".to_string()].into_iter(), 4);
        let mut m2 = Market::for_file_consumer("ns", "k", "b", ["a".to_string()].into_iter(), 4);
        m2.peers.get_mut("b").unwrap().clone_from(&m2.peers["b"].mark(2));
        let m3 = Market::for_file_consumer("ns", "k", "c", ["a".to_string()].into_iter(), 4);

        let mut lhs = m1.clone();
        lhs.merge(&m2);
        let mut rhs = m2.clone();
        rhs.merge(&m1);
        assert_eq!(lhs.peers, rhs.peers);

        let mut idempotent = m1.clone();
        let snapshot = idempotent.clone();
        idempotent.merge(&snapshot);
        assert_eq!(idempotent.peers, m1.peers);

        let mut left_assoc = m1.clone();
        left_assoc.merge(&m2);
        left_assoc.merge(&m3);
        let mut m2_then_m3 = m2.clone();
        m2_then_m3.merge(&m3);
        let mut right_assoc = m1.clone();
        right_assoc.merge(&m2_then_m3);
        assert_eq!(left_assoc.peers, right_assoc.peers);
    }

    #[test]
    fn dump_load_round_trip() {
        let market = Market::for_file_provider("ns", "file:abc", "dev-a", ["dev-b".to_string()].into_iter(), 10);
        let bytes = market.dump().unwrap();
        let loaded = Market::load(&bytes).unwrap();
        assert_eq!(loaded.namespace, market.namespace);
        assert_eq!(loaded.key, market.key);
        assert_eq!(loaded.peers, market.peers);
    }

    #[test]
    fn exchange_with_db_merges_existing() {
        let db = Db::open_in_memory().unwrap();
        let ns_id = db.with_conn(|conn| crate::db::namespace_id(conn, "ns")).unwrap();

        let mut m1 = Market::for_file_provider("ns", "k", "a", std::iter::empty(), 8);
        m1.exchange_with_db(&db, ns_id).unwrap();

        let mut m2 = Market::for_file_consumer("ns", "k", "b", std::iter::empty(), 8);
        m2.peers.get_mut("b").unwrap().clone_from(&m2.peers["b"].mark(2));
        m2.exchange_with_db(&db, ns_id).unwrap();

        // m2 should now also know about "a" being full (merged from stored m1)
        assert!(m2.peers.contains_key("a"));
        assert!(m2.peers["a"].has_all());
        assert!(m2.peers["b"].has(2));
    }
}
