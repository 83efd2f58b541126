//! Bundles the per-run dependencies every sync operation needs (spec §9,
//! "session" thread through components). Grounded in `lansync/session.py`,
//! which plays the same role for the Python original: one object handed
//! to `send`/`receive`/the event handler instead of a pile of globals.

use std::path::PathBuf;
use std::sync::Arc;

use crate::client_pool::ClientPool;
use crate::config::Settings;
use crate::db::Db;
use crate::event_client::EventClient;
use crate::peer_registry::PeerRegistry;
use crate::stats::Stats;

pub struct Session {
    pub namespace: String,
    pub namespace_row_id: i64,
    pub root_folder: PathBuf,
    pub root_folder_id: i64,
    pub device_id: String,
    pub settings: Settings,
    pub db: Arc<Db>,
    pub peer_registry: Arc<dyn PeerRegistry>,
    pub client_pool: ClientPool,
    pub stats: Stats,
    pub event_client: EventClient,
}

impl Session {
    pub fn new(settings: Settings, db: Arc<Db>, peer_registry: Arc<dyn PeerRegistry>) -> crate::error::Result<Session> {
        let (namespace_row_id, root_folder_id) = db.with_conn(|conn| {
            let ns = crate::db::namespace_id(conn, &settings.namespace)?;
            let rf = crate::db::root_folder_id(conn, &settings.root_folder.to_string_lossy())?;
            Ok((ns, rf))
        })?;

        Ok(Session {
            namespace: settings.namespace.clone(),
            namespace_row_id,
            root_folder: settings.root_folder.clone(),
            root_folder_id,
            device_id: settings.device_id.clone(),
            client_pool: ClientPool::new(&settings),
            stats: Stats::new(settings.device_id.clone()),
            event_client: EventClient::new(&settings),
            settings,
            db,
            peer_registry,
        })
    }

    pub fn live_peers(&self) -> Vec<crate::model::Peer> {
        self.peer_registry.live_peers(&self.namespace)
    }
}
