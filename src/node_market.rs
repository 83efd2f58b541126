//! Binds a `Market` to a concrete file's ordered chunk-hash list (spec
//! §4.D). Grounded in `lansync/node_market.py`'s `NodeMarket`.

use std::collections::BTreeSet;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::market::Market;
use crate::model::Hash;

pub struct NodeMarket {
    pub namespace: String,
    pub key: String,
    pub device_id: String,
    pub market: Market,
    /// Sorted, de-duplicated. Position `i` identifies bit `i` in every
    /// peer's `ChunkSet`.
    pub chunk_hashes: Vec<Hash>,
    namespace_row_id: i64,
}

impl NodeMarket {
    pub fn for_file_provider(
        db: &Db,
        namespace_row_id: i64,
        namespace: &str,
        key: &str,
        device_id: &str,
        chunk_hashes: impl IntoIterator<Item = Hash>,
        peers: impl IntoIterator<Item = String>,
    ) -> Result<NodeMarket> {
        let chunk_hashes = sorted_unique(chunk_hashes);
        let mut market = Market::for_file_provider(namespace, key, device_id, peers.into_iter(), chunk_hashes.len() as u32);
        market.exchange_with_db(db, namespace_row_id)?;
        Ok(NodeMarket {
            namespace: namespace.to_string(),
            key: key.to_string(),
            device_id: device_id.to_string(),
            market,
            chunk_hashes,
            namespace_row_id,
        })
    }

    pub fn for_file_consumer(
        db: &Db,
        namespace_row_id: i64,
        namespace: &str,
        key: &str,
        device_id: &str,
        chunk_hashes: impl IntoIterator<Item = Hash>,
        peers: impl IntoIterator<Item = String>,
    ) -> Result<NodeMarket> {
        let chunk_hashes = sorted_unique(chunk_hashes);
        let market = match Market::load_for_key(db, namespace_row_id, namespace, key)? {
            Some(m) => m,
            None => {
                let mut m = Market::for_file_consumer(namespace, key, device_id, peers.into_iter(), chunk_hashes.len() as u32);
                m.exchange_with_db(db, namespace_row_id)?;
                tracing::info!(namespace, key, "created market for file");
                m
            }
        };
        Ok(NodeMarket {
            namespace: namespace.to_string(),
            key: key.to_string(),
            device_id: device_id.to_string(),
            market,
            chunk_hashes,
            namespace_row_id,
        })
    }

    fn index_of(&self, chunk_hash: &str) -> Result<usize> {
        self.chunk_hashes
            .iter()
            .position(|h| h == chunk_hash)
            .ok_or_else(|| Error::Protocol(format!("chunk hash {chunk_hash} not part of this node's market")))
    }

    pub fn find_providers(&self, chunk_hash: &str) -> Result<Vec<String>> {
        let index = self.index_of(chunk_hash)?;
        Ok(self
            .market
            .peers
            .iter()
            .filter(|(_, cs)| cs.has(index))
            .map(|(peer, _)| peer.clone())
            .collect())
    }

    pub fn find_consumers(&self, chunk_hash: &str) -> Result<Vec<String>> {
        let index = self.index_of(chunk_hash)?;
        Ok(self
            .market
            .peers
            .iter()
            .filter(|(_, cs)| !cs.has(index))
            .map(|(peer, _)| peer.clone())
            .collect())
    }

    pub fn provide_chunk(&mut self, db: &Db, chunk_hash: &str) -> Result<()> {
        let index = self.index_of(chunk_hash)?;
        let updated = self
            .market
            .peers
            .get(&self.device_id)
            .cloned()
            .unwrap_or_else(|| crate::market::ChunkSet::empty(self.chunk_hashes.len() as u32))
            .mark(index);
        self.market.peers.insert(self.device_id.clone(), updated);
        self.market.exchange_with_db(db, self.namespace_row_id)
    }

    pub fn exchange(&mut self, db: &Db, other: &Market) -> Result<Market> {
        self.market.merge(other);
        self.market.exchange_with_db(db, self.namespace_row_id)?;
        Ok(self.market.clone())
    }
}

fn sorted_unique(hashes: impl IntoIterator<Item = Hash>) -> Vec<Hash> {
    let set: BTreeSet<Hash> = hashes.into_iter().collect();
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Db, i64) {
        let db = Db::open_in_memory().unwrap();
        let id = db.with_conn(|conn| crate::db::namespace_id(conn, "ns")).unwrap();
        (db, id)
    }

    #[test]
    fn provider_marks_self_full() {
        let (db, ns_id) = setup();
        let nm = NodeMarket::for_file_provider(
            &db, ns_id, "ns", "file:abc", "dev-a",
            vec!["h1".to_string(), "h2".to_string()],
            vec!["dev-b".to_string()],
        )
        .unwrap();
        assert_eq!(nm.find_providers("h1").unwrap(), vec!["dev-a".to_string()]);
        assert_eq!(nm.find_consumers("h1").unwrap(), vec!["dev-b".to_string()]);
    }

    #[test]
    fn consumer_provide_chunk_updates_bit() {
        let (db, ns_id) = setup();
        let mut nm = NodeMarket::for_file_consumer(
            &db, ns_id, "ns", "file:abc", "dev-b",
            vec!["h1".to_string(), "h2".to_string()],
            vec!["dev-a".to_string()],
        )
        .unwrap();
        assert!(nm.find_providers("h1").unwrap().is_empty());
        nm.provide_chunk(&db, "h1").unwrap();
        assert_eq!(nm.find_providers("h1").unwrap(), vec!["dev-b".to_string()]);
    }
}
