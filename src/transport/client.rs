//! Outbound per-peer HTTP client (spec §4.E / §6 wire endpoints). Grounded
//! in `lansync/client.py`'s `Client` class: one `reqwest::Client` per pool
//! slot, talking to `GET /chunk/{namespace}/{hash}`, `POST
//! /market/{namespace}/{key}`, `POST /node/{namespace}`.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::market::Market;
use crate::model::{Peer, RemoteNode};

/// A single outbound connection to one peer. Cheap to build (no I/O until
/// first request), so the pool constructs `clients_per_peer` of these
/// eagerly on first contact with a peer.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    base_url: String,
}

impl PeerClient {
    pub fn new(peer: &Peer, settings: &Settings) -> PeerClient {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("reqwest client builder never fails with these options");
        PeerClient {
            http,
            base_url: peer.base_url(),
        }
    }

    pub async fn download_chunk(&self, namespace: &str, hash: &str) -> Result<Vec<u8>> {
        let url = format!("{}/chunk/{namespace}/{hash}", self.base_url);
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("chunk {hash} not found on peer")));
        }
        let response = response.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// `None` means the peer had nothing to merge back (mirrors the
    /// Python client's "non-200 means no market" treatment — it never
    /// raises on this path).
    pub async fn exchange_market(&self, namespace: &str, key: &str, market: &Market) -> Result<Option<Market>> {
        let url = format!("{}/market/{namespace}/{key}", self.base_url);
        let body = market.dump()?;
        let response = self.http.post(&url).body(body).send().await?;
        if response.status().is_success() {
            let bytes = response.bytes().await?;
            Ok(Some(Market::load(&bytes)?))
        } else {
            Ok(None)
        }
    }

    pub async fn exchange_node(&self, namespace: &str, remote_node: &RemoteNode) -> Result<()> {
        let url = format!("{}/node/{namespace}", self.base_url);
        self.http
            .post(&url)
            .json(remote_node)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
