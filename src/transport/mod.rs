//! Wire transport between peers (spec §6 "served endpoints"): an axum
//! server exposing chunk/market/node-announce routes, and a reqwest-based
//! client used by the client pool to call the same routes on a peer.

pub mod client;
pub mod server;

pub use client::PeerClient;
pub use server::{build_router, ServerState};
