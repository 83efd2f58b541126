//! Entry point: loads configuration, opens the local store, starts the
//! peer transport server and discovery backend, then runs the sync
//! worker loop forever. Grounded in how `lansync`'s `__main__.py` wires a
//! `Session` together with a `SyncWorker` and the Flask peer server,
//! adapted to tokio tasks instead of separate OS threads/processes.

use std::sync::Arc;

use clap::Parser;
use lansync_core::config::{Cli, Settings};
use lansync_core::db::Db;
use lansync_core::peer_registry::{BroadcastPeerRegistry, PeerRegistry, StaticPeerRegistry};
use lansync_core::session::Session;
use lansync_core::sync_worker;
use lansync_core::transport::{build_router, ServerState};

fn init_tracing(device_id: &str) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    std::fs::create_dir_all("log")?;
    let stats_file = tracing_appender::rolling::never("log", format!("stats-{device_id}.json"));
    let (stats_writer, guard) = tracing_appender::non_blocking(stats_file);

    let console_layer = tracing_subscriber::fmt::layer().with_target(true);
    let stats_layer = tracing_subscriber::fmt::layer()
        .with_writer(stats_writer)
        .json()
        .with_target(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| meta.target() == "stats"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console_layer)
        .with(stats_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli)?;
    let _tracing_guard = init_tracing(&settings.device_id)?;

    tracing::info!(
        device_id = %settings.device_id,
        namespace = %settings.namespace,
        root_folder = %settings.root_folder.display(),
        "starting lansyncd"
    );

    let db = Arc::new(Db::open(&settings.data_dir.join("lansync.db"))?);

    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let peer_registry: Arc<dyn PeerRegistry> = match settings.discovery_backend {
        lansync_core::config::DiscoveryBackend::Broadcast => {
            BroadcastPeerRegistry::start(settings.device_id.clone(), settings.namespace.clone(), local_addr.port(), &settings).await?
        }
        lansync_core::config::DiscoveryBackend::Static => Arc::new(StaticPeerRegistry::new(Default::default())),
    };

    let session = Arc::new(Session::new(settings, db.clone(), peer_registry)?);

    let server_state = Arc::new(ServerState { db: db.clone() });
    let router = build_router(server_state);
    tracing::info!(addr = %local_addr, "peer transport listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "peer transport server exited");
        }
    });

    tokio::select! {
        _ = sync_worker::run_forever(session) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down on ctrl-c");
        }
    }
    Ok(())
}
