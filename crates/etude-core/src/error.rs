// src/error.rs
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that stop the server from starting or running.
///
/// Per-connection failures never surface here: they end in an error response
/// or a closed socket inside the reactor.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
