//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the connection engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Socket-level I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requires a connected peer
    #[error("connection is not connected")]
    NotConnected,

    /// Transport security requested but the build lacks the `tls` feature
    #[error("tls support is not compiled in")]
    TlsUnavailable,

    /// The connection already carries a transport-security shim
    #[error("tls is already started")]
    TlsAlreadyActive,

    /// TLS protocol failure
    #[cfg(feature = "tls")]
    #[error("tls protocol error: {0}")]
    Tls(#[from] rustls::Error),
}
