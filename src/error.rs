use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the server lifecycle (configure, bind, start).
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be resolved or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// TLS material could not be loaded or the TLS config is invalid.
    #[error("tls setup failed: {0}")]
    Tls(String),
    /// Configuration file could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// `start` was called on a server that is already running or destroyed.
    #[error("server already started")]
    AlreadyStarted,
    /// The accept coroutine could not be spawned.
    #[error("failed to spawn accept coroutine: {0}")]
    Spawn(#[source] io::Error),
}

/// Errors returned by component registry lookups.
///
/// `Init` carries the failure shared by every caller that observed the same
/// initialization attempt, hence the `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ComponentError {
    #[error("the required component is not found: {0}")]
    NotFound(String),
    #[error("component '{name}' failed to initialize: {cause:#}")]
    Init {
        name: String,
        cause: Arc<anyhow::Error>,
    },
    #[error("component '{0}' is not of the requested type")]
    WrongType(String),
}

impl ComponentError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComponentError::NotFound(_))
    }
}

/// Body codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Protocol-upgrade handshake failures.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("not an upgrade request: {0}")]
    NotUpgrade(&'static str),
    #[error("unsupported upgrade protocol version")]
    UnsupportedVersion,
    #[error("missing handshake key")]
    MissingKey,
    #[error("header check rejected handshake: {0}")]
    Rejected(anyhow::Error),
    #[error("handshake write failed: {0}")]
    Io(#[from] io::Error),
}
