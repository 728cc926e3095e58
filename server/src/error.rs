//! Error types for routing, the population store, world handoff and
//! configuration loading.

use std::path::PathBuf;
use thiserror::Error;

/// Why a connection could not be admitted to any world.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// Local policy found every world at capacity
    #[error("no world has free capacity")]
    NoCapacity,

    /// Coordinated policy had no candidate, or the chosen world refused the handoff
    #[error("no suitable world found")]
    NoSuitableShard,
}

/// Failures talking to the population store.
///
/// None of these are fatal. Callers substitute a safe default and carry on.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("metrics store did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("metrics store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics store frame could not be encoded or decoded: {0}")]
    Codec(#[from] bincode::Error),

    #[error("metrics store client is shut down")]
    Closed,

    #[error("unexpected reply from metrics store: {0}")]
    Unexpected(String),
}

/// A world refused a connection. The connection is handed back so the
/// caller can close it.
#[derive(Error, Debug)]
pub enum HandoffError<C> {
    #[error("world is full")]
    Full(C),

    #[error("world is not running yet")]
    NotReady(C),

    #[error("connection is already attached to this world")]
    Duplicate(C),
}

impl<C> HandoffError<C> {
    pub fn into_connection(self) -> C {
        match self {
            HandoffError::Full(conn)
            | HandoffError::NotReady(conn)
            | HandoffError::Duplicate(conn) => conn,
        }
    }
}

/// Startup configuration problems. These are the only fatal errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("server cannot start without any configuration file (tried {0:?})")]
    Missing(Vec<PathBuf>),

    #[error("could not read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse configuration file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
