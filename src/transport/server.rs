//! Served peer-to-peer endpoints (spec §6): `GET /chunk/{namespace}/{hash}`,
//! `POST /market/{namespace}/{key}`, `POST /node/{namespace}`. Grounded in
//! the routes `lansync/client.py`'s `Client` calls against a peer; the
//! handler bodies mirror `lansync/node.py`'s `find_chunk` reuse path and
//! `lansync/market.py`'s `exchange_with_db`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::db::Db;
use crate::error::Error;
use crate::event_handler;
use crate::market::Market;
use crate::model::{NodeEvent, NodeOperation, RemoteNode};
use crate::store;

pub struct ServerState {
    pub db: Arc<Db>,
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/chunk/:namespace/:hash", get(get_chunk))
        .route("/market/:namespace/:key", post(post_market))
        .route("/node/:namespace", post(post_node))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Protocol(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

async fn get_chunk(State(state): State<Arc<ServerState>>, Path((namespace, hash)): Path<(String, String)>) -> Result<Vec<u8>, Error> {
    let namespace_row_id = state.db.with_conn(|conn| crate::db::namespace_id(conn, &namespace))?;
    let found = store::find_chunk(&state.db, namespace_row_id, &hash)?;
    match found {
        Some(chunk) => chunk.read(),
        None => Err(Error::NotFound(format!("chunk {hash} not found"))),
    }
}

async fn post_market(
    State(state): State<Arc<ServerState>>,
    Path((namespace, key)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Vec<u8>, Error> {
    let namespace_row_id = state.db.with_conn(|conn| crate::db::namespace_id(conn, &namespace))?;
    let mut market = Market::load(&body)?;
    market.namespace = namespace;
    market.key = key;
    market.exchange_with_db(&state.db, namespace_row_id)?;
    market.dump()
}

async fn post_node(
    State(state): State<Arc<ServerState>>,
    Path(namespace): Path<String>,
    axum::Json(remote_node): axum::Json<RemoteNode>,
) -> Result<StatusCode, Error> {
    let namespace_row_id = state.db.with_conn(|conn| crate::db::namespace_id(conn, &namespace))?;
    let event = NodeEvent {
        key: remote_node.key,
        operation: NodeOperation::Create,
        sequence_number: Some(remote_node.sequence_number),
        path: remote_node.path,
        timestamp: remote_node.timestamp,
        checksum: remote_node.checksum,
        size: Some(remote_node.size),
        chunks: Some(remote_node.chunks),
        signature: remote_node.signature,
    };
    event_handler::apply_remote_event(&state.db, namespace_row_id, &event)?;
    Ok(StatusCode::OK)
}
