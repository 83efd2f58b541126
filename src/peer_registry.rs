//! Peer discovery (spec §9 ambient peer visibility; SPEC_FULL.md §10.G).
//! Grounded in `lansync/broadcast_discovery.py`'s `BroadcastPeerRegistry`:
//! a UDP broadcast sender/receiver pair updating a per-namespace map of
//! `Peer`, with liveness defined by a timestamp window rather than active
//! pings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::config::Settings;
use crate::model::Peer;

/// What the send/receive engine needs from discovery: "who is live right
/// now". Kept as a trait so `Settings::discovery_backend == Static` (fixed
/// peer list, useful for tests and single-host demos) can share call
/// sites with the UDP broadcast implementation.
pub trait PeerRegistry: Send + Sync {
    fn live_peers(&self, namespace: &str) -> Vec<Peer>;
}

#[derive(Serialize, Deserialize)]
struct DiscoveryMessage {
    device_id: String,
    namespace: String,
    port: u16,
}

struct RegistryState {
    peers: HashMap<String, HashMap<String, Peer>>,
}

/// UDP broadcast peer discovery. `start` spawns a receiver task (listens
/// for other devices' announcements) and a sender task (announces this
/// device on an interval) and returns a handle whose `live_peers` reads
/// the shared map built up by the receiver.
pub struct BroadcastPeerRegistry {
    state: Arc<Mutex<RegistryState>>,
    liveness_window: Duration,
}

impl BroadcastPeerRegistry {
    pub async fn start(device_id: String, namespace: String, announce_port: u16, settings: &Settings) -> crate::error::Result<Arc<BroadcastPeerRegistry>> {
        let registry = Arc::new(BroadcastPeerRegistry {
            state: Arc::new(Mutex::new(RegistryState { peers: HashMap::new() })),
            liveness_window: settings.liveness_window(),
        });

        let recv_socket = bind_broadcast_socket(settings.discovery_port).await?;
        let recv_state = registry.state.clone();
        let recv_device_id = device_id.clone();
        tokio::spawn(async move {
            receive_loop(recv_socket, recv_device_id, recv_state).await;
        });

        let send_socket = bind_broadcast_socket(0).await?;
        let send_interval = settings.discovery_ping_interval;
        let discovery_port = settings.discovery_port;
        tokio::spawn(async move {
            send_loop(send_socket, device_id, namespace, announce_port, discovery_port, send_interval).await;
        });

        Ok(registry)
    }
}

impl PeerRegistry for BroadcastPeerRegistry {
    fn live_peers(&self, namespace: &str) -> Vec<Peer> {
        let now = now_secs();
        let state = self.state.lock();
        state
            .peers
            .get(namespace)
            .into_iter()
            .flat_map(|peers| peers.values())
            .filter(|p| now.saturating_sub(p.last_seen) < self.liveness_window.as_secs())
            .cloned()
            .collect()
    }
}

async fn bind_broadcast_socket(port: u16) -> crate::error::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn receive_loop(socket: UdpSocket, own_device_id: String, state: Arc<Mutex<RegistryState>>) {
    let mut buf = [0u8; 1024];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "discovery receive failed");
                continue;
            }
        };
        let Ok(msg) = serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) else {
            continue;
        };
        if msg.device_id == own_device_id {
            continue;
        }
        handle_discovery_message(&state, addr, msg);
    }
}

fn handle_discovery_message(state: &Arc<Mutex<RegistryState>>, addr: SocketAddr, msg: DiscoveryMessage) {
    let mut state = state.lock();
    let namespace_peers = state.peers.entry(msg.namespace.clone()).or_default();
    match namespace_peers.get_mut(&msg.device_id) {
        Some(peer) => peer.touch(&addr.ip().to_string(), msg.port),
        None => {
            let peer = Peer::new(addr.ip().to_string(), msg.port, msg.device_id.clone());
            tracing::info!(device_id = %peer.device_id, address = %peer.address, "new peer joined");
            namespace_peers.insert(msg.device_id, peer);
        }
    }
}

async fn send_loop(socket: UdpSocket, device_id: String, namespace: String, announce_port: u16, discovery_port: u16, interval: Duration) {
    let payload = serde_json::to_vec(&DiscoveryMessage { device_id, namespace, port: announce_port }).expect("discovery message always serializes");
    loop {
        if let Err(e) = socket.send_to(&payload, ("255.255.255.255", discovery_port)).await {
            tracing::warn!(error = %e, "discovery broadcast failed");
        }
        tokio::time::sleep(interval).await;
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Fixed peer list, no network activity: `Settings::discovery_backend ==
/// Static`, used in tests and single-host demo setups where broadcast
/// doesn't reach (e.g. containers without a shared L2 segment).
pub struct StaticPeerRegistry {
    peers: HashMap<String, Vec<Peer>>,
}

impl StaticPeerRegistry {
    pub fn new(peers: HashMap<String, Vec<Peer>>) -> StaticPeerRegistry {
        StaticPeerRegistry { peers }
    }
}

impl PeerRegistry for StaticPeerRegistry {
    fn live_peers(&self, namespace: &str) -> Vec<Peer> {
        self.peers.get(namespace).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_registry_returns_configured_peers() {
        let mut peers = HashMap::new();
        peers.insert("ns".to_string(), vec![Peer::new("10.0.0.2", 9000, "dev-b")]);
        let registry = StaticPeerRegistry::new(peers);
        assert_eq!(registry.live_peers("ns").len(), 1);
        assert_eq!(registry.live_peers("other").len(), 0);
    }

    #[test]
    fn handle_discovery_message_updates_existing_peer_address() {
        let state = Arc::new(Mutex::new(RegistryState { peers: HashMap::new() }));
        let addr: SocketAddr = "10.0.0.5:9001".parse().unwrap();
        handle_discovery_message(&state, addr, DiscoveryMessage { device_id: "dev".into(), namespace: "ns".into(), port: 9001 });
        let addr2: SocketAddr = "10.0.0.6:9002".parse().unwrap();
        handle_discovery_message(&state, addr2, DiscoveryMessage { device_id: "dev".into(), namespace: "ns".into(), port: 9002 });

        let locked = state.lock();
        let peer = &locked.peers["ns"]["dev"];
        assert_eq!(peer.address, "10.0.0.6");
        assert_eq!(peer.port, 9002);
    }
}
