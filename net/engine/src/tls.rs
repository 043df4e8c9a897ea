//! Transparent transport-security shim.
//!
//! The shim turns a `rustls` session into a pair of byte filters: ciphertext
//! in on the read side (plaintext out through an internal buffer), plaintext
//! in on the write side (ciphertext out through the caller's raw-write
//! sink). The connection state machine stays ignorant of TLS internals; it
//! only routes bytes through the shim and reacts to the returned
//! [`RecvStatus`].

#[cfg(feature = "tls")]
mod imp {
    use std::io::{self, Read, Write};
    use std::sync::Arc;

    use bytes::{Buf, BufMut, BytesMut};
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
    use tracing::{debug, trace};

    /// Which side of the session this connection plays, plus its
    /// configuration. The config objects are opaque to the engine.
    pub enum TlsContext {
        /// Accepting side.
        Server(Arc<ServerConfig>),
        /// Initiating side; `server_name` is used for SNI and verification.
        Client {
            /// Client session configuration.
            config: Arc<ClientConfig>,
            /// Name presented for SNI and certificate verification.
            server_name: ServerName<'static>,
        },
    }

    /// Outcome of one ciphertext intake round.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct RecvStatus {
        /// The handshake finished during this round.
        pub handshake_complete: bool,
        /// The peer sent a close alert.
        pub close_alert: bool,
    }

    /// A TLS session driven as a byte-in/byte-out filter.
    pub struct TlsShim {
        session: rustls::Connection,
        /// Ciphertext the socket has not accepted yet.
        out: BytesMut,
        /// Decrypted application bytes awaiting the message callback.
        plain: BytesMut,
        /// Application bytes accepted before the handshake finished.
        pending_plain: BytesMut,
        handshaking: bool,
        close_sent: bool,
    }

    impl TlsShim {
        /// Build a shim for one side of a session.
        pub fn new(ctx: TlsContext) -> Result<Self, rustls::Error> {
            let mut session = match ctx {
                TlsContext::Server(config) => {
                    rustls::Connection::Server(ServerConnection::new(config)?)
                }
                TlsContext::Client {
                    config,
                    server_name,
                } => rustls::Connection::Client(ClientConnection::new(config, server_name)?),
            };
            // The engine does its own flow control through the egress queue
            // and the high-water callback.
            session.set_buffer_limit(None);
            Ok(Self {
                session,
                out: BytesMut::new(),
                plain: BytesMut::new(),
                pending_plain: BytesMut::new(),
                handshaking: true,
                close_sent: false,
            })
        }

        /// Consume ciphertext from `input`, decrypting into the internal
        /// plaintext buffer and pushing protocol output through `write`.
        ///
        /// On a protocol error the pending alert is still flushed before the
        /// error is returned.
        pub fn recv_data<W>(
            &mut self,
            input: &mut BytesMut,
            write: &mut W,
        ) -> Result<RecvStatus, rustls::Error>
        where
            W: FnMut(&[u8]) -> io::Result<usize>,
        {
            let mut status = RecvStatus::default();
            while !input.is_empty() {
                let mut cursor: &[u8] = &input[..];
                let n = match self.session.read_tls(&mut cursor) {
                    Ok(n) => n,
                    Err(e) => {
                        trace!("read_tls stalled: {}", e);
                        break;
                    }
                };
                if n == 0 {
                    break;
                }
                input.advance(n);

                let state = match self.session.process_new_packets() {
                    Ok(state) => state,
                    Err(e) => {
                        self.stage_records();
                        self.flush(write);
                        return Err(e);
                    }
                };

                let avail = state.plaintext_bytes_to_read();
                if avail > 0 {
                    let start = self.plain.len();
                    self.plain.resize(start + avail, 0);
                    self.session
                        .reader()
                        .read_exact(&mut self.plain[start..])
                        .map_err(|e| rustls::Error::General(format!("plaintext read: {e}")))?;
                }
                if state.peer_has_closed() {
                    status.close_alert = true;
                }
                if self.handshaking && !self.session.is_handshaking() {
                    self.handshaking = false;
                    status.handshake_complete = true;
                    debug!("tls handshake complete");
                    if !self.pending_plain.is_empty() {
                        let queued = self.pending_plain.split();
                        if let Err(e) = self.session.writer().write_all(&queued) {
                            return Err(rustls::Error::General(format!(
                                "queued plaintext write: {e}"
                            )));
                        }
                    }
                }
            }
            self.stage_records();
            self.flush(write);
            Ok(status)
        }

        /// Encrypt `plaintext` and push ciphertext through `write`; returns
        /// the plaintext bytes accepted.
        ///
        /// Before the handshake finishes the bytes are retained inside the
        /// shim and nothing reaches the wire.
        pub fn send_data<W>(&mut self, plaintext: &[u8], write: &mut W) -> usize
        where
            W: FnMut(&[u8]) -> io::Result<usize>,
        {
            if self.handshaking {
                self.pending_plain.extend_from_slice(plaintext);
                return plaintext.len();
            }
            let mut accepted = 0;
            while accepted < plaintext.len() {
                match self.session.writer().write(&plaintext[accepted..]) {
                    Ok(0) => break,
                    Ok(n) => accepted += n,
                    Err(e) => {
                        trace!("plaintext write stalled: {}", e);
                        break;
                    }
                }
            }
            self.stage_records();
            self.flush(write);
            accepted
        }

        /// Try to flush the ciphertext backlog; true when fully flushed.
        pub fn send_buffered_data<W>(&mut self, write: &mut W) -> bool
        where
            W: FnMut(&[u8]) -> io::Result<usize>,
        {
            self.stage_records();
            self.flush(write)
        }

        /// Length of the ciphertext backlog the socket has not accepted.
        pub fn buffered_len(&self) -> usize {
            self.out.len()
        }

        /// Whether decrypted application bytes are waiting.
        pub fn has_plaintext(&self) -> bool {
            !self.plain.is_empty()
        }

        /// Hand the decrypted bytes to the caller.
        pub fn take_plaintext(&mut self) -> BytesMut {
            std::mem::take(&mut self.plain)
        }

        /// Return unconsumed plaintext after the message callback.
        pub fn restore_plaintext(&mut self, buf: BytesMut) {
            debug_assert!(self.plain.is_empty());
            self.plain = buf;
        }

        /// Queue a close alert and try to flush it.
        pub fn queue_close_notify<W>(&mut self, write: &mut W) -> bool
        where
            W: FnMut(&[u8]) -> io::Result<usize>,
        {
            if !self.close_sent {
                self.close_sent = true;
                self.session.send_close_notify();
            }
            self.stage_records();
            self.flush(write)
        }

        /// Whether the handshake is still in progress.
        pub fn is_handshaking(&self) -> bool {
            self.handshaking
        }

        /// Move any pending TLS records into the ciphertext backlog.
        fn stage_records(&mut self) {
            while self.session.wants_write() {
                let mut sink = (&mut self.out).writer();
                if self.session.write_tls(&mut sink).is_err() {
                    break;
                }
            }
        }

        /// Drain the backlog through `write`; true when empty afterwards.
        fn flush<W>(&mut self, write: &mut W) -> bool
        where
            W: FnMut(&[u8]) -> io::Result<usize>,
        {
            while !self.out.is_empty() {
                match write(&self.out[..]) {
                    Ok(0) => break,
                    Ok(n) => self.out.advance(n),
                    Err(e) => {
                        trace!("ciphertext flush stopped: {}", e);
                        break;
                    }
                }
            }
            self.out.is_empty()
        }
    }

}

#[cfg(feature = "tls")]
pub use imp::{RecvStatus, TlsContext, TlsShim};

/// Uninhabited placeholder so the connection can carry a shim slot in
/// builds without transport security.
#[cfg(not(feature = "tls"))]
pub enum TlsShim {}

#[cfg(not(feature = "tls"))]
impl TlsShim {
    pub(crate) fn buffered_len(&self) -> usize {
        match *self {}
    }

    pub(crate) fn send_data<W>(&mut self, _plaintext: &[u8], _write: &mut W) -> usize {
        match *self {}
    }

    pub(crate) fn send_buffered_data<W>(&mut self, _write: &mut W) -> bool {
        match *self {}
    }

    pub(crate) fn queue_close_notify<W>(&mut self, _write: &mut W) -> bool {
        match *self {}
    }
}
