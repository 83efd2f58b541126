use std::io;

/// Error taxonomy for the replication engine (spec §7).
///
/// Variants map 1:1 onto the abstract taxonomy: `IOError`, `NetworkError`,
/// `NotFound`, `IntegrityError`, `ConflictError`, `ProtocolError`, plus two
/// Rust-specific leaves (`Db`, `Serialization`) for the embedded store and
/// wire encodings.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("conflict on {key}")]
    Conflict { key: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::Network(e.to_string())
        } else if e.status().map(|s| s.as_u16()) == Some(404) {
            Error::NotFound(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}
