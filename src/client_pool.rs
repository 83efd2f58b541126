//! Bounded per-peer pool of transport handles (spec §4.E). Grounded in
//! `lansync/client.py`'s `ClientPool`; the single-lock discipline and the
//! "no network work under the lock" rule come from spec §5.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Settings;
use crate::model::Peer;
use crate::transport::client::PeerClient;

struct PoolState {
    clients: HashMap<String, Vec<PeerClient>>,
}

/// A handle checked out from the pool; `release`s itself back on drop so
/// a panicking task can never leak a slot permanently — the `TaskList`
/// cleanup also releases explicitly, but this is a last line of defense.
pub struct Acquired {
    pool: ClientPool,
    peer: Peer,
    client: Option<PeerClient>,
}

impl Acquired {
    pub fn client(&self) -> &PeerClient {
        self.client.as_ref().expect("client taken")
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(&self.peer, client);
        }
    }
}

#[derive(Clone)]
pub struct ClientPool {
    capacity: usize,
    state: Arc<Mutex<PoolState>>,
}

impl ClientPool {
    pub fn new(settings: &Settings) -> ClientPool {
        ClientPool {
            capacity: settings.clients_per_peer,
            state: Arc::new(Mutex::new(PoolState { clients: HashMap::new() })),
        }
    }

    /// Returns a handle or `None` if the peer's slots are all checked out.
    /// Lazily creates the per-peer slot set on first contact. Handle
    /// construction (`PeerClient::new`, just a reqwest client builder) is
    /// cheap and does no network I/O, so it is fine to do under the lock.
    pub fn acquire(&self, peer: &Peer, settings: &Settings) -> Option<Acquired> {
        let mut state = self.state.lock();
        let slots = state
            .clients
            .entry(peer.device_id.clone())
            .or_insert_with(|| (0..self.capacity).map(|_| PeerClient::new(peer, settings)).collect());
        let client = slots.pop()?;
        Some(Acquired {
            pool: self.clone(),
            peer: peer.clone(),
            client: Some(client),
        })
    }

    fn release(&self, peer: &Peer, client: PeerClient) {
        let mut state = self.state.lock();
        state.clients.entry(peer.device_id.clone()).or_default().push(client);
    }

    /// Lazy iterator yielding up to `max` acquired clients across `peers`.
    pub fn try_acquire_peers<'a>(
        &'a self,
        peers: impl Iterator<Item = Peer> + 'a,
        settings: &'a Settings,
        max: usize,
    ) -> impl Iterator<Item = Acquired> + 'a {
        peers.filter_map(move |peer| self.acquire(&peer, settings)).take(max)
    }

    /// Drops all handles for a peer (called when discovery reports it
    /// gone). In-flight handles already checked out are unaffected; they
    /// simply won't find a slot to return to.
    pub fn remove(&self, peer: &Peer) {
        let mut state = self.state.lock();
        state.clients.remove(&peer.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let cli = crate::config::Cli {
            config: None,
            namespace: None,
            root_folder: None,
            device_id: Some("test-device".into()),
            remote_server_url: None,
            bind_address: None,
            data_dir: Some(std::env::temp_dir().join(format!("lansync-test-{}", uuid::Uuid::new_v4()))),
        };
        let mut settings = Settings::load(cli).unwrap();
        settings.clients_per_peer = 2;
        settings
    }

    #[test]
    fn pool_saturates_then_frees_on_release() {
        let settings = settings();
        let pool = ClientPool::new(&settings);
        let peer = Peer::new("127.0.0.1", 9000, "peer-a");

        let a = pool.acquire(&peer, &settings);
        let b = pool.acquire(&peer, &settings);
        assert!(a.is_some());
        assert!(b.is_some());

        let c = pool.acquire(&peer, &settings);
        assert!(c.is_none(), "pool of capacity 2 must saturate after 2 acquires");

        drop(a);
        let d = pool.acquire(&peer, &settings);
        assert!(d.is_some(), "releasing a handle must free a slot");
    }

    #[test]
    fn remove_drops_peer_slots() {
        let settings = settings();
        let pool = ClientPool::new(&settings);
        let peer = Peer::new("127.0.0.1", 9001, "peer-b");
        let _a = pool.acquire(&peer, &settings).unwrap();
        pool.remove(&peer);
        // after remove, a fresh slot set is lazily created on next acquire
        let b = pool.acquire(&peer, &settings);
        assert!(b.is_some());
    }
}
