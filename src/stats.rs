//! Transfer telemetry sink (SPEC_FULL.md §10.F). Grounded in
//! `lansync/stats.py`'s `Stats`: one ndjson line per chunk download or
//! market exchange, written to a dedicated logger so it never interleaves
//! with human-facing log lines. `lansync/log.py` wires that logger to its
//! own file handler (`log/stats-{device_id}.json`); here that's a
//! dedicated `tracing` target instead of a second logging backend.

use serde::Serialize;

use crate::model::Peer;

/// `(namespace, key, checksum)` identifies the file a stats event is
/// about; mirrors `lansync/stats.py`'s `EventKey`.
#[derive(Clone, Copy, Debug)]
pub struct EventKey<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
    pub checksum: &'a str,
}

#[derive(Serialize)]
struct ChunkDownloadEvent<'a> {
    event: &'static str,
    namespace: &'a str,
    key: &'a str,
    checksum: &'a str,
    from_peer: &'a str,
    to_peer: &'a str,
    size: u64,
}

#[derive(Serialize)]
struct MarketExchangeEvent<'a> {
    event: &'static str,
    namespace: &'a str,
    key: &'a str,
    checksum: &'a str,
    from_peer: &'a str,
    to_peer: &'a str,
}

/// Emits one ndjson record per call on the `stats` tracing target. A
/// dedicated `tracing_appender` file layer (wired up in `main.rs`) routes
/// that target to `log/stats-{device_id}.json`, separate from the
/// console's human-readable layer.
pub struct Stats {
    device_id: String,
}

impl Stats {
    pub fn new(device_id: impl Into<String>) -> Stats {
        Stats { device_id: device_id.into() }
    }

    pub fn emit_chunk_download(&self, key: EventKey, from_peer: &Peer, size: u64) {
        let event = ChunkDownloadEvent {
            event: "download_chunk",
            namespace: key.namespace,
            key: key.key,
            checksum: key.checksum,
            from_peer: &from_peer.device_id,
            to_peer: &self.device_id,
            size,
        };
        self.emit(&event);
    }

    pub fn emit_market_exchange(&self, key: EventKey, from_peer: &Peer) {
        let event = MarketExchangeEvent {
            event: "exchange_market",
            namespace: key.namespace,
            key: key.key,
            checksum: key.checksum,
            from_peer: &from_peer.device_id,
            to_peer: &self.device_id,
        };
        self.emit(&event);
    }

    fn emit(&self, event: &impl Serialize) {
        match serde_json::to_string(event) {
            Ok(line) => tracing::info!(target: "stats", "{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize stats event"),
        }
    }
}
