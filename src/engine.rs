//! Orchestrates uploads (`send`) and downloads (`receive`) — spec §4.H.
//! Grounded directly in `lansync/sync_action.py`'s `send`/`receive` and
//! its `DownloadChunkTask`/`ExchangeMarketTask`/`ExchangeNodeTask`. Both
//! task kinds share one `TaskList` there via Python duck typing; here they
//! share one by producing the same `EngineOutcome` enum (spec §9 "one task
//! interface, tagged per-call-site implementations").
//!
//! One deliberate departure from the Python original: `DownloadChunkTask`
//! there submits its opportunistic gossip task directly from inside
//! `on_done`, because the closure captures the enclosing `TaskList` by
//! reference. `Task::on_done` here has no such access, so a finished
//! download instead pushes the follow-up task onto a shared queue; the
//! scheduling loop drains it into the `TaskList` right after `wait_any`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::client_pool::Acquired;
use crate::error::Result;
use crate::event_handler;
use crate::market::Market;
use crate::model::{Hash, LocalNode, NodeChunk, NodeEvent, NodeOperation, RemoteNode, StoredNode};
use crate::node_market::NodeMarket;
use crate::session::Session;
use crate::stats::EventKey;
use crate::store;
use crate::task_list::{Task, TaskList};

/// The single output type both task kinds in this module resolve to, so
/// one `TaskList` can track them together.
enum EngineOutcome {
    Chunk(Vec<u8>),
    Market(Option<Market>),
}

fn unix_time(t: std::time::SystemTime) -> i64 {
    t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// `execute` bodies run on the blocking worker pool (`TaskList::submit`
/// dispatches via `spawn_blocking`), so blocking the thread to drive a
/// `reqwest` call is exactly what that pool exists for.
fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Handle::current().block_on(fut)
}

type GossipQueue = Arc<Mutex<Vec<Arc<dyn Task<EngineOutcome>>>>>;

// ---------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------

/// **Send(local_node, stored_node)** (spec §4.H): persist the new
/// StoredNode and its chunks, announce it to the event server, then gossip
/// a provider market to every live peer.
pub async fn send(
    session: &Arc<Session>,
    local_node: &LocalNode,
    stored: Option<&StoredNode>,
    chunks: Vec<NodeChunk>,
    checksum: Hash,
    signature: String,
) -> Result<()> {
    tracing::info!(path = %local_node.path, "new node");

    let db = session.db.clone();
    let namespace_row_id = session.namespace_row_id;
    let root_folder_id = session.root_folder_id;
    let key = local_node.key.clone();
    let path = local_node.path.clone();
    let size = local_node.size;
    let mtime = local_node.mtime;
    let ctime = local_node.ctime;
    let superseded = stored.map(|s| s.id);
    let chunks_for_db = chunks.clone();
    let checksum_for_db = checksum.clone();
    let signature_for_db = signature.clone();

    tokio::task::spawn_blocking(move || -> Result<i64> {
        db.atomic(|conn| {
            if let Some(id) = superseded {
                store::delete_stored_node(conn, id)?;
            }
            let id = store::insert_stored_node(
                conn,
                &store::NewStoredNode {
                    namespace_row_id,
                    root_folder_id,
                    key: &key,
                    path: &path,
                    checksum: Some(&checksum_for_db),
                    size,
                    signature: Some(&signature_for_db),
                    local_mtime: mtime,
                    local_ctime: ctime,
                    ready: true,
                },
            )?;
            for chunk in &chunks_for_db {
                store::index_chunk(conn, id, chunk)?;
            }
            Ok(id)
        })
    })
    .await
    .expect("blocking task panicked")?;

    let event = NodeEvent {
        key: local_node.key.clone(),
        operation: NodeOperation::Create,
        sequence_number: None,
        path: local_node.path.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        checksum: Some(checksum.clone()),
        size: Some(size),
        chunks: Some(chunks.clone()),
        signature: Some(signature),
    };
    let seq = event_handler::push_events(&session.event_client, &session.namespace, std::slice::from_ref(&event)).await?;
    let mut pushed = event;
    pushed.sequence_number = Some(seq);
    event_handler::apply_remote_event(&session.db, session.namespace_row_id, &pushed)?;

    let live_peers = session.live_peers();
    let market_key = format!("{}:{}", local_node.key, checksum);
    let peer_ids: Vec<String> = live_peers.iter().map(|p| p.device_id.clone()).collect();
    let chunk_hashes: Vec<Hash> = chunks.iter().map(|c| c.hash.clone()).collect();
    let node_market = NodeMarket::for_file_provider(
        &session.db,
        session.namespace_row_id,
        &session.namespace,
        &market_key,
        &session.device_id,
        chunk_hashes,
        peer_ids,
    )?;
    let market = Arc::new(Mutex::new(node_market));

    let remote_node = RemoteNode {
        namespace: session.namespace.clone(),
        key: local_node.key.clone(),
        sequence_number: seq,
        path: local_node.path.clone(),
        timestamp: pushed.timestamp.clone(),
        checksum: Some(checksum),
        size,
        chunks,
        signature: None,
    };

    let mut tasks: TaskList<EngineOutcome> = TaskList::new();
    for peer in &live_peers {
        if let Some(acquired) = session.client_pool.acquire(peer, &session.settings) {
            tracing::info!(peer = %peer.device_id, path = %local_node.path, "exchanging node market");
            tasks.submit(Arc::new(ExchangeNodeTask {
                client: Mutex::new(Some(acquired)),
                remote_node: remote_node.clone(),
                market: market.clone(),
                session: session.clone(),
            }));
        }
    }
    tasks.wait_all().await;
    Ok(())
}

// ---------------------------------------------------------------------
// Receive
// ---------------------------------------------------------------------

/// **Receive(remote_node, stored_node)** (spec §4.H). Aborts as a no-op if
/// no peer is currently visible; otherwise runs the placeholder-then-fetch
/// scheduling loop to completion.
pub async fn receive(session: &Arc<Session>, remote_node: &RemoteNode, stored: Option<&StoredNode>) -> Result<()> {
    let live_peers = session.live_peers();
    if live_peers.is_empty() {
        tracing::info!(path = %remote_node.path, "no peers visible, deferring receive");
        return Ok(());
    }
    tracing::info!(path = %remote_node.path, "downloading node");

    let mut chunks_by_hash: HashMap<Hash, Vec<NodeChunk>> = HashMap::new();
    for chunk in &remote_node.chunks {
        chunks_by_hash.entry(chunk.hash.clone()).or_default().push(chunk.clone());
    }
    let all_hashes: Vec<Hash> = {
        let mut hashes: Vec<Hash> = chunks_by_hash.keys().cloned().collect();
        hashes.sort();
        hashes
    };

    let temp_key = uuid::Uuid::new_v4().simple().to_string();
    let placeholder_path = session.root_folder.join(&temp_key);
    store::create_placeholder(&placeholder_path, remote_node.size)?;

    let superseded = stored.map(|s| s.id);
    let stored_node_id = session.db.atomic(|conn| {
        if let Some(id) = superseded {
            store::delete_stored_node(conn, id)?;
        }
        store::insert_stored_node(
            conn,
            &store::NewStoredNode {
                namespace_row_id: session.namespace_row_id,
                root_folder_id: session.root_folder_id,
                key: &temp_key,
                path: &temp_key,
                checksum: remote_node.checksum.as_deref(),
                size: remote_node.size,
                signature: remote_node.signature.as_deref(),
                local_mtime: 0,
                local_ctime: 0,
                ready: false,
            },
        )
    })?;

    let mut available_chunks: HashSet<Hash> = HashSet::new();
    let mut needed_chunks: HashSet<Hash> = HashSet::new();
    for (hash, chunks) in &chunks_by_hash {
        if let Some(found) = store::find_chunk(&session.db, session.namespace_row_id, hash)? {
            let data = found.read()?;
            session.db.atomic(|conn| {
                for chunk in chunks {
                    store::write_chunk_conn(conn, stored_node_id, &placeholder_path, chunk, &data)?;
                }
                Ok(())
            })?;
            tracing::info!(path = %remote_node.path, hash, "found local chunk for reuse");
            available_chunks.insert(hash.clone());
        } else {
            needed_chunks.insert(hash.clone());
        }
    }

    let final_path = session.root_folder.join(&remote_node.path);
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&placeholder_path, &final_path)?;
    session.db.atomic(|conn| {
        conn.execute(
            "UPDATE stored_node SET key = ?1, path = ?2 WHERE id = ?3",
            rusqlite::params![remote_node.key, remote_node.path, stored_node_id],
        )?;
        Ok(())
    })?;

    let market_key = format!("{}:{}", remote_node.key, remote_node.checksum.clone().unwrap_or_default());
    let peer_ids: Vec<String> = live_peers.iter().map(|p| p.device_id.clone()).collect();
    let mut node_market = NodeMarket::for_file_consumer(
        &session.db,
        session.namespace_row_id,
        &session.namespace,
        &market_key,
        &session.device_id,
        all_hashes.clone(),
        peer_ids,
    )?;
    for hash in &available_chunks {
        node_market.provide_chunk(&session.db, hash)?;
    }
    let market = Arc::new(Mutex::new(node_market));
    let needed = Arc::new(Mutex::new(needed_chunks));
    let available = Arc::new(Mutex::new(available_chunks));
    let gossip_queue: GossipQueue = Arc::new(Mutex::new(Vec::new()));

    let mut tasks: TaskList<EngineOutcome> = TaskList::new();

    loop {
        log_status_line(&remote_node.path, &all_hashes, &available.lock(), &needed.lock());
        if available.lock().len() == all_hashes.len() {
            break;
        }

        let mut submitted_any = false;
        while let Some((acquired, chunk_hash)) = pick_next_chunks(session, &market, &needed) {
            let chunks = chunks_by_hash[&chunk_hash].clone();
            tracing::info!(path = %remote_node.path, hash = %chunk_hash, peer = %acquired.peer().device_id, "downloading chunk");
            tasks.submit(Arc::new(DownloadChunkTask {
                client: Mutex::new(Some(acquired)),
                chunks,
                chunk_hash,
                stored_node_id,
                file_path: final_path.clone(),
                market: market.clone(),
                available: available.clone(),
                needed: needed.clone(),
                gossip_queue: gossip_queue.clone(),
                session: session.clone(),
            }));
            submitted_any = true;
        }

        if !submitted_any && tasks.is_empty() {
            tracing::info!(path = %remote_node.path, "no reachable providers, exchanging market to discover more");
            let mut shuffled_peers = live_peers.clone();
            shuffled_peers.shuffle(&mut rand::thread_rng());
            for peer in &shuffled_peers {
                if let Some(acquired) = session.client_pool.acquire(peer, &session.settings) {
                    tasks.submit(Arc::new(ExchangeMarketTask {
                        client: Mutex::new(Some(acquired)),
                        market_key: market_key.clone(),
                        market: market.clone(),
                        session: session.clone(),
                    }));
                }
            }
        }

        let finished = tasks.wait_any().await;
        for (_, result) in finished {
            if let Err(e) = result {
                tracing::warn!(path = %remote_node.path, error = %e, "transfer task failed, retrying");
            }
        }

        for gossip in gossip_queue.lock().drain(..) {
            tasks.submit(gossip);
        }
    }

    let meta = std::fs::metadata(&final_path)?;
    let mtime = unix_time(meta.modified()?);
    let ctime = unix_time(meta.created().unwrap_or_else(|_| meta.modified().unwrap()));
    session.db.atomic(|conn| store::mark_ready(conn, stored_node_id, mtime, ctime))?;
    tracing::info!(path = %remote_node.path, "node ready");
    Ok(())
}

/// `✔` available, `✖` still needed, `⌛` in flight (spec §4.H step 4).
fn log_status_line(path: &str, all_hashes: &[Hash], available: &HashSet<Hash>, needed: &HashSet<Hash>) {
    let icons: String = all_hashes
        .iter()
        .map(|h| if available.contains(h) { '✔' } else if needed.contains(h) { '✖' } else { '⌛' })
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!(path, "status: {icons}");
}

/// `pick_next_chunks()` (spec §4.H step 4): shuffled pass over `needed`,
/// acquiring the first reachable provider's client.
fn pick_next_chunks(session: &Arc<Session>, market: &Arc<Mutex<NodeMarket>>, needed: &Arc<Mutex<HashSet<Hash>>>) -> Option<(Acquired, Hash)> {
    let live_peers = session.live_peers();
    let live_by_id: HashMap<String, crate::model::Peer> = live_peers.into_iter().map(|p| (p.device_id.clone(), p)).collect();

    let mut shuffled_hashes: Vec<Hash> = needed.lock().iter().cloned().collect();
    shuffled_hashes.shuffle(&mut rand::thread_rng());

    for hash in shuffled_hashes {
        let providers = match market.lock().find_providers(&hash) {
            Ok(p) => p,
            Err(_) => continue,
        };
        for device_id in providers {
            let Some(peer) = live_by_id.get(&device_id) else { continue };
            if let Some(acquired) = session.client_pool.acquire(peer, &session.settings) {
                needed.lock().remove(&hash);
                return Some((acquired, hash));
            }
        }
    }
    None
}

struct DownloadChunkTask {
    client: Mutex<Option<Acquired>>,
    chunks: Vec<NodeChunk>,
    chunk_hash: Hash,
    stored_node_id: i64,
    file_path: PathBuf,
    market: Arc<Mutex<NodeMarket>>,
    available: Arc<Mutex<HashSet<Hash>>>,
    needed: Arc<Mutex<HashSet<Hash>>>,
    gossip_queue: GossipQueue,
    session: Arc<Session>,
}

impl Task<EngineOutcome> for DownloadChunkTask {
    fn execute(&self) -> Result<EngineOutcome> {
        let guard = self.client.lock();
        let acquired = guard.as_ref().expect("client present during execute");
        let bytes = block_on(acquired.client().download_chunk(&self.session.namespace, &self.chunk_hash))?;
        self.chunks[0].check(&bytes)?;
        Ok(EngineOutcome::Chunk(bytes))
    }

    fn on_done(&mut self, output: &EngineOutcome) {
        let EngineOutcome::Chunk(bytes) = output else { return };
        let peer = self.client.lock().as_ref().map(|a| a.peer().clone());

        let write_result = self.session.db.atomic(|conn| {
            for chunk in &self.chunks {
                store::write_chunk_conn(conn, self.stored_node_id, &self.file_path, chunk, bytes)?;
            }
            Ok(())
        });
        if let Err(e) = write_result {
            tracing::error!(hash = %self.chunk_hash, error = %e, "failed to persist downloaded chunk");
            self.needed.lock().insert(self.chunk_hash.clone());
            return;
        }

        if let Err(e) = self.market.lock().provide_chunk(&self.session.db, &self.chunk_hash) {
            tracing::warn!(hash = %self.chunk_hash, error = %e, "failed to record chunk availability");
        }
        self.available.lock().insert(self.chunk_hash.clone());

        if let Some(peer) = &peer {
            self.session.stats.emit_chunk_download(
                EventKey { namespace: &self.session.namespace, key: &self.chunk_hash, checksum: "" },
                peer,
                bytes.len() as u64,
            );
        }

        // At most one gossip target per completed download: a live
        // consumer of this hash (spec §4.H step 5).
        let consumers = self.market.lock().find_consumers(&self.chunk_hash).unwrap_or_default();
        let live_peers = self.session.live_peers();
        if let Some(peer) = live_peers.into_iter().find(|p| consumers.contains(&p.device_id)) {
            if let Some(acquired) = self.session.client_pool.acquire(&peer, &self.session.settings) {
                let market_key = self.market.lock().key.clone();
                self.gossip_queue.lock().push(Arc::new(ExchangeMarketTask {
                    client: Mutex::new(Some(acquired)),
                    market_key,
                    market: self.market.clone(),
                    session: self.session.clone(),
                }));
            }
        }
    }

    fn on_error(&mut self, error: &crate::error::Error) {
        tracing::error!(hash = %self.chunk_hash, error = %error, "chunk download failed");
        self.needed.lock().insert(self.chunk_hash.clone());
    }

    fn cleanup(&mut self) {
        self.client.lock().take();
    }
}

struct ExchangeMarketTask {
    client: Mutex<Option<Acquired>>,
    market_key: String,
    market: Arc<Mutex<NodeMarket>>,
    session: Arc<Session>,
}

impl Task<EngineOutcome> for ExchangeMarketTask {
    fn execute(&self) -> Result<EngineOutcome> {
        let guard = self.client.lock();
        let acquired = guard.as_ref().expect("client present during execute");
        let (to_send, key) = {
            let market = self.market.lock();
            (market.market.clone(), market.key.clone())
        };
        let response = block_on(acquired.client().exchange_market(&self.session.namespace, &key, &to_send))?;
        Ok(EngineOutcome::Market(response))
    }

    fn on_done(&mut self, output: &EngineOutcome) {
        let EngineOutcome::Market(other) = output else { return };
        let peer = self.client.lock().as_ref().map(|a| a.peer().clone());
        let Some(other) = other else { return };
        if let Err(e) = self.market.lock().exchange(&self.session.db, other) {
            tracing::warn!(error = %e, "failed to persist exchanged market");
            return;
        }
        if let Some(peer) = &peer {
            tracing::info!(peer = %peer.device_id, "market exchanged");
            self.session.stats.emit_market_exchange(
                EventKey { namespace: &self.session.namespace, key: &self.market_key, checksum: "" },
                peer,
            );
        }
    }

    fn on_error(&mut self, _error: &crate::error::Error) {
        // gossip is best-effort; a failed exchange is simply not retried
    }

    fn cleanup(&mut self) {
        self.client.lock().take();
    }
}

struct ExchangeNodeTask {
    client: Mutex<Option<Acquired>>,
    remote_node: RemoteNode,
    market: Arc<Mutex<NodeMarket>>,
    session: Arc<Session>,
}

impl Task<EngineOutcome> for ExchangeNodeTask {
    fn execute(&self) -> Result<EngineOutcome> {
        let guard = self.client.lock();
        let acquired = guard.as_ref().expect("client present during execute");
        block_on(acquired.client().exchange_node(&self.session.namespace, &self.remote_node))?;
        let (to_send, key) = {
            let market = self.market.lock();
            (market.market.clone(), market.key.clone())
        };
        let response = block_on(acquired.client().exchange_market(&self.session.namespace, &key, &to_send))?;
        Ok(EngineOutcome::Market(response))
    }

    fn on_done(&mut self, output: &EngineOutcome) {
        let EngineOutcome::Market(other) = output else { return };
        let Some(other) = other else { return };
        if let Err(e) = self.market.lock().exchange(&self.session.db, other) {
            tracing::warn!(error = %e, "failed to persist exchanged market");
        }
    }

    fn on_error(&mut self, error: &crate::error::Error) {
        tracing::warn!(error = %error, "exchange node task failed");
    }

    fn cleanup(&mut self) {
        self.client.lock().take();
    }
}
