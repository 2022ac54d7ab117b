//! Error types for the port relay.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for port-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while setting up or running a relay.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error outside of a relayed connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The local listening port could not be claimed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address the listener was asked to bind.
        addr: SocketAddr,
        /// Underlying bind failure.
        #[source]
        source: std::io::Error,
    },

    /// The readiness event multiplexer failed.
    #[error("Event loop failure: {0}")]
    Poll(#[source] std::io::Error),

    /// Remote host resolution failed.
    #[error("Failed to resolve address: {0}")]
    AddressResolution(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
