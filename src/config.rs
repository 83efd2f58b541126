//! Configuration loading: CLI flags (`clap`) layered over an optional TOML
//! file, with hardcoded defaults as the final fallback. Grounded in the
//! `dynaconf`-backed `settings` object threaded through the Python
//! original (`lansync/session.py`, `lansync/discovery.py`) and in how the
//! teacher's Linux build (`pea-linux`) loads its own `toml` config.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "lansyncd", about = "Chunked peer-to-peer LAN file sync node")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub namespace: Option<String>,

    #[arg(long)]
    pub root_folder: Option<PathBuf>,

    #[arg(long)]
    pub device_id: Option<String>,

    #[arg(long)]
    pub remote_server_url: Option<String>,

    #[arg(long)]
    pub bind_address: Option<String>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileSettings {
    namespace: Option<String>,
    root_folder: Option<PathBuf>,
    device_id: Option<String>,
    remote_server_url: Option<String>,
    bind_address: Option<String>,
    data_dir: Option<PathBuf>,
    clients_per_peer: Option<usize>,
    chunk_size: Option<usize>,
    worker_threads: Option<usize>,
    discovery_ping_interval_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    discovery_backend: Option<String>,
    discovery_port: Option<u16>,
    sync_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub root_folder: PathBuf,
    pub device_id: String,
    pub remote_server_url: String,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub clients_per_peer: usize,
    pub chunk_size: usize,
    pub worker_threads: usize,
    pub discovery_ping_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub discovery_backend: DiscoveryBackend,
    pub discovery_port: u16,
    /// Idle time between local rescans once a sync pass finds nothing left
    /// to do (`Timeout(interval=3)` in `lansync/sync.py`).
    pub sync_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryBackend {
    Broadcast,
    Static,
}

/// `DISCOVERY_PING_INTERVAL * 3`, per spec §9's Open Question resolution:
/// the canonical liveness window regardless of discovery backend.
impl Settings {
    pub fn liveness_window(&self) -> Duration {
        self.discovery_ping_interval * 3
    }

    pub fn load(cli: Cli) -> crate::error::Result<Settings> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|e| crate::error::Error::Protocol(e.to_string()))?
            }
            None => FileSettings::default(),
        };

        let data_dir = cli
            .data_dir
            .or(file.data_dir)
            .unwrap_or_else(|| PathBuf::from(".lansync"));
        std::fs::create_dir_all(&data_dir)?;

        let device_id = cli
            .device_id
            .or(file.device_id)
            .unwrap_or_else(|| default_device_id(&data_dir));

        let discovery_backend = match file.discovery_backend.as_deref() {
            Some("static") => DiscoveryBackend::Static,
            _ => DiscoveryBackend::Broadcast,
        };

        Ok(Settings {
            namespace: cli.namespace.or(file.namespace).unwrap_or_else(|| "default".into()),
            root_folder: cli
                .root_folder
                .or(file.root_folder)
                .unwrap_or_else(|| PathBuf::from(".")),
            device_id,
            remote_server_url: cli
                .remote_server_url
                .or(file.remote_server_url)
                .unwrap_or_else(|| "http://127.0.0.1:5555".into()),
            bind_address: cli
                .bind_address
                .or(file.bind_address)
                .unwrap_or_else(|| "0.0.0.0:0".into()),
            data_dir,
            clients_per_peer: file.clients_per_peer.unwrap_or(4),
            chunk_size: file.chunk_size.unwrap_or(1024 * 1024),
            worker_threads: file.worker_threads.unwrap_or(32),
            discovery_ping_interval: Duration::from_secs(file.discovery_ping_interval_secs.unwrap_or(2)),
            connect_timeout: Duration::from_secs(file.connect_timeout_secs.unwrap_or(5)),
            read_timeout: Duration::from_secs(file.read_timeout_secs.unwrap_or(30)),
            discovery_backend,
            discovery_port: file.discovery_port.unwrap_or(28980),
            sync_interval: Duration::from_secs(file.sync_interval_secs.unwrap_or(3)),
        })
    }
}

/// Persist a freshly generated device id under `data_dir/device_id`, or
/// reuse one already written there — mirrors `Device.default_device_id`
/// in `lansync/models.py`, minus the SQL round-trip (no namespace exists
/// yet at config-load time).
fn default_device_id(data_dir: &std::path::Path) -> String {
    let marker = data_dir.join("device_id");
    if let Ok(existing) = std::fs::read_to_string(&marker) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    let _ = std::fs::write(&marker, &id);
    id
}
