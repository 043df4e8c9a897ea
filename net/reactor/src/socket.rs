//! Nonblocking socket facade.
//!
//! Wraps a shared `tokio::net::TcpStream` with the raw operations the
//! connection state machine needs: single-shot nonblocking reads and writes,
//! half-close, `SO_ERROR` draining, socket options, and the Linux
//! `sendfile(2)` zero-copy path.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tracing::trace;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// How much spare capacity a read reserves in the target buffer.
const READ_RESERVE: usize = 64 * 1024;

/// A cheaply cloneable nonblocking socket handle.
#[derive(Clone)]
pub struct Socket {
    stream: Arc<TcpStream>,
}

impl Socket {
    /// Wrap a stream already registered with the owning loop's runtime.
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }

    /// The underlying shared stream.
    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }

    /// One nonblocking read into `buf`'s spare capacity.
    ///
    /// Returns `Ok(0)` on peer EOF and `WouldBlock` when nothing is pending.
    pub fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        buf.reserve(READ_RESERVE);
        self.stream.try_read_buf(buf)
    }

    /// One nonblocking write.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.stream.try_write(data)
    }

    /// Close the write half of the socket, leaving reads usable.
    #[cfg(unix)]
    pub fn close_write(&self) {
        let rc = unsafe { libc::shutdown(self.stream.as_raw_fd(), libc::SHUT_WR) };
        if rc != 0 {
            trace!("shutdown(SHUT_WR) failed: {}", io::Error::last_os_error());
        }
    }

    /// Close the write half of the socket, leaving reads usable.
    #[cfg(not(unix))]
    pub fn close_write(&self) {
        trace!("close_write is not supported on this platform");
    }

    /// Drain and return any pending socket-level error.
    pub fn take_error(&self) -> Option<io::Error> {
        self.stream.take_error().ok().flatten()
    }

    /// Toggle `TCP_NODELAY`.
    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.stream.set_nodelay(on)
    }

    /// Toggle `SO_KEEPALIVE`.
    #[cfg(unix)]
    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        let value: libc::c_int = if on { 1 } else { 0 };
        let rc = unsafe {
            libc::setsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Toggle `SO_KEEPALIVE`.
    #[cfg(not(unix))]
    pub fn set_keepalive(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Peer endpoint.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Zero-copy file-to-socket transfer via `sendfile(2)`.
    ///
    /// Advances the file descriptor's own offset. Returns `WouldBlock` when
    /// the socket buffer is full.
    #[cfg(target_os = "linux")]
    pub fn sendfile(&self, file_fd: std::os::unix::io::RawFd, max: usize) -> io::Result<usize> {
        // Largest count sendfile accepts in one call.
        const MAX_SENDFILE_BYTES: usize = 0x7fff_f000;
        let count = max.min(MAX_SENDFILE_BYTES);
        self.stream
            .try_io(tokio::io::Interest::WRITABLE, || {
                let sent = unsafe {
                    libc::sendfile(
                        self.stream.as_raw_fd(),
                        file_fd,
                        std::ptr::null_mut(),
                        count,
                    )
                };
                if sent < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(sent as usize)
                }
            })
    }
}
