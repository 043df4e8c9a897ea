//! Reactor-style TCP connection engine.
//!
//! This crate provides the per-connection state machine for event-driven,
//! nonblocking byte-stream I/O: strict FIFO egress across a mixed queue of
//! buffer kinds (memory, file regions, pull streams, async push streams),
//! partial-write handling driven by readiness, idle eviction through a
//! timing wheel, and an optional transparent TLS shim.
//!
//! ## Features
//!
//! - **Ordered egress**: the order of `send` calls, from any thread, is the
//!   order of bytes on the wire
//! - **Mixed buffer kinds**: in-memory buffers, bounded file regions with a
//!   Linux `sendfile(2)` fast path, caller-driven pull streams and
//!   producer-driven async streams
//! - **Flow control**: a high-water callback fires when buffered egress
//!   crosses a threshold
//! - **Lifecycle**: deferred shutdown (`close_on_empty`), half-close,
//!   idempotent force-close, idle timeout via a timing wheel
//! - **TLS** (feature `tls`): rustls interposed as a byte filter; the
//!   handshake completes before the connection callback fires
//!
//! The event loop, channel, socket and timing-wheel collaborators live in
//! `strand-reactor` and are re-exported here for convenience.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod async_stream;
pub mod connection;
pub mod error;
pub mod node;
pub mod tls;

// Re-export main types
pub use async_stream::AsyncStream;
pub use connection::{
    ConnStatus, ConnectionCallback, HighWaterCallback, MessageCallback, TcpConnection,
};
pub use error::EngineError;
pub use node::BufferNode;
#[cfg(feature = "tls")]
pub use connection::TlsErrorCallback;
#[cfg(feature = "tls")]
pub use tls::{RecvStatus, TlsContext, TlsShim};

pub use strand_reactor::{EventLoop, EventLoopThread, LoopHandle, TimingWheel};

#[cfg(all(test, feature = "tls"))]
pub(crate) mod test_certs {
    //! Static PEM fixtures shared by the TLS tests.

    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};

    pub fn server_config() -> Arc<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &include_bytes!("../testdata/server.pem")[..])
                .collect::<Result<_, _>>()
                .unwrap();
        let key = rustls_pemfile::pkcs8_private_keys(
            &mut &include_bytes!("../testdata/server.key")[..],
        )
        .next()
        .unwrap()
        .unwrap();
        Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, PrivateKeyDer::from(key))
                .unwrap(),
        )
    }

    pub fn client_config() -> Arc<ClientConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &include_bytes!("../testdata/ca.pem")[..]) {
            roots.add(cert.unwrap()).unwrap();
        }
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }
}
