//! Per-connection state machine.
//!
//! A [`TcpConnection`] is pinned to one event loop: every piece of mutable
//! state (the egress queue, the ingress buffer, the channel interest mask,
//! the TLS shim) is touched only from that loop's thread. Public entry
//! points callable from elsewhere post a work item that captures a strong
//! reference to the connection and owned copies of any input bytes, so the
//! order of posted sends is the order of bytes on the wire.
//!
//! The egress queue holds [`BufferNode`]s in submission order; partial
//! progress is recorded in the head node only. A send on an idle connection
//! goes straight to the socket and nothing is queued unless the kernel
//! pushes back.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, error, trace, warn};

use strand_reactor::{Channel, EventHandlers, LoopHandle, Socket, TimingWheel};

use crate::async_stream::AsyncStream;
use crate::error::EngineError;
use crate::node::BufferNode;
use crate::tls::TlsShim;
#[cfg(feature = "tls")]
use crate::tls::TlsContext;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    /// Created but not yet activated on its loop.
    Connecting = 0,
    /// Live; reads and sends flow.
    Connected = 1,
    /// Half-closed or closing; no new sends.
    Disconnecting = 2,
    /// Terminal.
    Disconnected = 3,
}

impl ConnStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnStatus::Connecting,
            1 => ConnStatus::Connected,
            2 => ConnStatus::Disconnecting,
            _ => ConnStatus::Disconnected,
        }
    }
}

/// Invoked on Connected (after any TLS handshake) and on Disconnected.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Invoked with the ingress buffer; unconsumed bytes stay for the next event.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut BytesMut) + Send + Sync>;
/// Invoked when the egress queue fully drains after having been non-empty.
pub type WriteCompleteCallback = ConnectionCallback;
/// Invoked with the backlog size when buffered egress crosses the threshold.
pub type HighWaterCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
/// Invoked exactly once when the connection reaches Disconnected.
pub type CloseCallback = ConnectionCallback;
/// Invoked with the protocol error before the connection is force-closed.
#[cfg(feature = "tls")]
pub type TlsErrorCallback = Arc<dyn Fn(&Arc<TcpConnection>, &rustls::Error) + Send + Sync>;

const DEFAULT_HIGH_WATER: usize = 64 * 1024 * 1024;

#[cfg(feature = "tls")]
type InitialTls = Option<TlsContext>;
#[cfg(not(feature = "tls"))]
type InitialTls = Option<std::convert::Infallible>;

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water: Option<HighWaterCallback>,
    close: Option<CloseCallback>,
    #[cfg(feature = "tls")]
    tls_error: Option<TlsErrorCallback>,
    #[cfg(feature = "tls")]
    tls_upgrade: Option<ConnectionCallback>,
}

struct Inner {
    /// The raw socket until the connection is activated on its loop.
    pending: Option<std::net::TcpStream>,
    socket: Option<Socket>,
    channel: Option<Channel>,
    ingress: BytesMut,
    egress: VecDeque<BufferNode>,
    close_on_empty: bool,
    high_water: usize,
    idle_timeout_secs: usize,
    last_kick: Option<Instant>,
    kickoff: Weak<KickoffEntry>,
    wheel: Weak<TimingWheel>,
    tls: Option<TlsShim>,
    #[cfg(feature = "tls")]
    pending_tls: Option<TlsContext>,
    cbs: Callbacks,
}

/// Timing-wheel entry whose eviction force-closes the idle connection.
struct KickoffEntry {
    conn: Weak<TcpConnection>,
}

impl Drop for KickoffEntry {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            debug!("idle timeout, closing {}", conn.name());
            conn.force_close();
        }
    }
}

/// A nonblocking TCP connection driven by one event loop.
pub struct TcpConnection {
    event_loop: LoopHandle,
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    status: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    next_async_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl TcpConnection {
    /// Wrap an already-connected socket. The connection stays in
    /// `Connecting` until [`connect_established`](Self::connect_established)
    /// runs on the loop.
    pub fn new(
        event_loop: LoopHandle,
        stream: std::net::TcpStream,
    ) -> io::Result<Arc<Self>> {
        Self::build(event_loop, stream, None)
    }

    /// Like [`new`](Self::new), with a transport-security shim interposed
    /// from the start. The handshake completes before the connection
    /// callback fires.
    #[cfg(feature = "tls")]
    pub fn new_with_tls(
        event_loop: LoopHandle,
        stream: std::net::TcpStream,
        context: TlsContext,
    ) -> io::Result<Arc<Self>> {
        Self::build(event_loop, stream, Some(context))
    }

    fn build(
        event_loop: LoopHandle,
        stream: std::net::TcpStream,
        tls_context: InitialTls,
    ) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let name = format!("{local_addr}--{peer_addr}");
        trace!("new connection {}", name);
        #[cfg(not(feature = "tls"))]
        let _ = &tls_context;
        Ok(Arc::new(Self {
            event_loop,
            name,
            local_addr,
            peer_addr,
            status: AtomicU8::new(ConnStatus::Connecting as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            next_async_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                pending: Some(stream),
                socket: None,
                channel: None,
                ingress: BytesMut::new(),
                egress: VecDeque::new(),
                close_on_empty: false,
                high_water: DEFAULT_HIGH_WATER,
                idle_timeout_secs: 0,
                last_kick: None,
                kickoff: Weak::new(),
                wheel: Weak::new(),
                tls: None,
                #[cfg(feature = "tls")]
                pending_tls: tls_context,
                cbs: Callbacks::default(),
            }),
        }))
    }

    // ---- identity and counters ----

    /// Printable name derived from both endpoints.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the connection is in `Connected`.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    /// Whether the connection reached `Disconnected`.
    pub fn is_disconnected(&self) -> bool {
        self.status() == ConnStatus::Disconnected
    }

    /// Total bytes handed to the kernel, monotonic.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes read from the kernel, monotonic.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// The loop this connection is pinned to.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.event_loop
    }

    /// Toggle `TCP_NODELAY` on the socket.
    pub fn set_tcp_no_delay(self: &Arc<Self>, on: bool) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || {
            let inner = this.inner.lock();
            if let Some(socket) = inner.socket.as_ref() {
                if let Err(e) = socket.set_nodelay(on) {
                    trace!("set_nodelay failed on {}: {}", this.name, e);
                }
            }
        });
    }

    // ---- callback wiring ----

    /// Connection state change callback (Connected and Disconnected).
    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.inner.lock().cbs.connection = Some(Arc::new(cb));
    }

    /// Message callback; receives a mutable handle to the ingress buffer.
    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut BytesMut) + Send + Sync + 'static,
    ) {
        self.inner.lock().cbs.message = Some(Arc::new(cb));
    }

    /// Fired when a previously non-empty egress queue fully drains.
    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.inner.lock().cbs.write_complete = Some(Arc::new(cb));
    }

    /// Fired exactly once when the connection reaches Disconnected.
    pub fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.inner.lock().cbs.close = Some(Arc::new(cb));
    }

    /// Fired when buffered egress crosses `threshold` bytes.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
        threshold: usize,
    ) {
        let mut inner = self.inner.lock();
        inner.cbs.high_water = Some(Arc::new(cb));
        inner.high_water = threshold;
    }

    /// Fired with the protocol error before a TLS failure closes the
    /// connection.
    #[cfg(feature = "tls")]
    pub fn set_tls_error_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &rustls::Error) + Send + Sync + 'static,
    ) {
        self.inner.lock().cbs.tls_error = Some(Arc::new(cb));
    }

    // ---- lifecycle ----

    /// Activate the connection on its loop: register the socket, enable
    /// read interest and move to `Connected`. For TLS connections the
    /// handshake starts here and the connection callback is deferred until
    /// it completes.
    pub fn connect_established(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || this.establish_in_loop());
    }

    fn establish_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        trace!("connect established for {}", self.name);
        debug_assert_eq!(self.status(), ConnStatus::Connecting);
        #[cfg_attr(not(feature = "tls"), allow(unused_mut))]
        let mut fire_connected = true;
        #[cfg_attr(not(feature = "tls"), allow(unused_mut))]
        let mut failed = false;
        {
            let mut inner = self.inner.lock();
            let Some(std_stream) = inner.pending.take() else {
                return;
            };
            let stream = match TcpStream::from_std(std_stream) {
                Ok(stream) => Arc::new(stream),
                Err(e) => {
                    error!("failed to register the socket for {}: {}", self.name, e);
                    drop(inner);
                    self.handle_close();
                    return;
                }
            };
            let socket = Socket::new(stream.clone());
            if let Err(e) = socket.set_keepalive(true) {
                trace!("set_keepalive failed on {}: {}", self.name, e);
            }
            let mut channel = Channel::new(stream);
            let weak = Arc::downgrade(self);
            channel.set_event_handlers(EventHandlers {
                readable: Box::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.handle_read();
                        }
                    }
                }),
                writable: Box::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.handle_write();
                        }
                    }
                }),
                close: Box::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.handle_close();
                        }
                    }
                }),
                error: Box::new({
                    let weak = weak.clone();
                    move || {
                        if let Some(conn) = weak.upgrade() {
                            conn.handle_error();
                        }
                    }
                }),
            });
            let tied: Weak<dyn std::any::Any + Send + Sync> = weak;
            channel.tie(tied);
            channel.begin_polling(&self.event_loop);
            channel.enable_reading();
            inner.socket = Some(socket);
            inner.channel = Some(channel);
            self.set_status(ConnStatus::Connected);
            if !inner.egress.is_empty() {
                // nodes were queued before activation; let the loop drain them
                self.enable_writing_if_idle(&inner);
            }

            #[cfg(feature = "tls")]
            if let Some(context) = inner.pending_tls.take() {
                fire_connected = false;
                match TlsShim::new(context) {
                    Ok(shim) => {
                        inner.tls = Some(shim);
                        // a client session opens with its own flight
                        self.flush_tls(&mut inner);
                    }
                    Err(e) => {
                        error!("failed to start tls on {}: {}", self.name, e);
                        failed = true;
                    }
                }
            }
        }
        if failed {
            self.handle_close();
            return;
        }
        if fire_connected {
            self.fire_connection_callback();
        }
    }

    /// Owner-side teardown: demote a still-connected connection, fire the
    /// connection callback and deregister the channel.
    pub fn connect_destroyed(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || {
            this.event_loop.assert_in_loop_thread();
            trace!("connect destroyed for {}", this.name);
            let mut fire = false;
            {
                let inner = this.inner.lock();
                if this.status() == ConnStatus::Connected {
                    this.set_status(ConnStatus::Disconnected);
                    if let Some(channel) = inner.channel.as_ref() {
                        channel.disable_all();
                    }
                    fire = true;
                }
                if let Some(channel) = inner.channel.as_ref() {
                    channel.remove();
                }
            }
            if fire {
                this.fire_connection_callback();
            }
        });
    }

    /// Close the write half once all buffered egress has drained. TLS
    /// connections send a close alert first.
    pub fn shutdown(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || this.shutdown_in_loop());
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.status() != ConnStatus::Connected {
            return;
        }
        let mut inner = self.inner.lock();
        let backlog = inner.tls.as_ref().map_or(0, |shim| shim.buffered_len());
        if backlog > 0 || !inner.egress.is_empty() {
            // there is still data to send; close once it has drained
            inner.close_on_empty = true;
            return;
        }
        {
            let Inner { socket, tls, .. } = &mut *inner;
            if let (Some(socket), Some(shim)) = (socket.as_ref(), tls.as_mut()) {
                let mut write = raw_write(socket, &self.bytes_sent);
                shim.queue_close_notify(&mut write);
            }
        }
        self.set_status(ConnStatus::Disconnecting);
        let writing = inner.channel.as_ref().is_some_and(|c| c.is_writing());
        if !writing {
            if let Some(socket) = inner.socket.as_ref() {
                socket.close_write();
            }
        }
    }

    /// Close now, discarding buffered egress. Idempotent.
    pub fn force_close(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || {
            if matches!(
                this.status(),
                ConnStatus::Connected | ConnStatus::Disconnecting
            ) {
                this.set_status(ConnStatus::Disconnecting);
                this.handle_close();
                let mut inner = this.inner.lock();
                let Inner { socket, tls, .. } = &mut *inner;
                if let (Some(socket), Some(shim)) = (socket.as_ref(), tls.as_mut()) {
                    let mut write = raw_write(socket, &this.bytes_sent);
                    shim.queue_close_notify(&mut write);
                }
            }
        });
    }

    /// Arm idle eviction: the wheel entry is re-inserted on read or write
    /// activity, at most once per second, and its expiry force-closes the
    /// connection.
    pub fn enable_kicking_off(self: &Arc<Self>, timeout_secs: usize, wheel: &Arc<TimingWheel>) {
        if timeout_secs == 0 {
            return;
        }
        let this = self.clone();
        let wheel = wheel.clone();
        self.event_loop.run_in_loop(move || {
            let entry = Arc::new(KickoffEntry {
                conn: Arc::downgrade(&this),
            });
            {
                let mut inner = this.inner.lock();
                inner.idle_timeout_secs = timeout_secs;
                inner.last_kick = Some(Instant::now());
                inner.kickoff = Arc::downgrade(&entry);
                inner.wheel = Arc::downgrade(&wheel);
            }
            wheel.insert_entry(timeout_secs, entry);
        });
    }

    /// Upgrade a plaintext connection to TLS (the STARTTLS pattern).
    ///
    /// `upgrade` replaces the connection callback for the
    /// handshake-completion notification. Fails when a shim already exists.
    #[cfg(feature = "tls")]
    pub fn start_encryption(
        self: &Arc<Self>,
        context: TlsContext,
        upgrade: Option<ConnectionCallback>,
    ) -> Result<(), EngineError> {
        {
            let inner = self.inner.lock();
            if inner.tls.is_some() || inner.pending_tls.is_some() {
                error!("tls is already started on {}", self.name);
                return Err(EngineError::TlsAlreadyActive);
            }
        }
        let shim = TlsShim::new(context)?;
        let this = self.clone();
        self.event_loop.run_in_loop(move || {
            let mut inner = this.inner.lock();
            if inner.tls.is_some() {
                error!("tls is already started on {}", this.name);
                return;
            }
            inner.cbs.tls_upgrade = upgrade;
            inner.tls = Some(shim);
            this.flush_tls(&mut inner);
        });
        Ok(())
    }

    /// Always fails: this build has no transport-security support.
    #[cfg(not(feature = "tls"))]
    pub fn start_encryption(&self) -> Result<(), EngineError> {
        Err(EngineError::TlsUnavailable)
    }

    // ---- send family ----

    /// Queue bytes for sending; callable from any thread. The order of
    /// calls is the order of bytes on the wire.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = Bytes::copy_from_slice(data);
            let this = self.clone();
            self.event_loop
                .queue_in_loop(move || this.send_in_loop(&owned));
        }
    }

    /// Like [`send`](Self::send) for shared or owned buffers, avoiding the
    /// copy on the posting side.
    pub fn send_bytes(self: &Arc<Self>, data: impl Into<Bytes>) {
        let data = data.into();
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let this = self.clone();
            self.event_loop
                .queue_in_loop(move || this.send_in_loop(&data));
        }
    }

    /// Send `length` bytes of a file starting at `offset` (`length == 0`
    /// means the rest of the file). Invalid regions are logged and dropped.
    pub fn send_file(self: &Arc<Self>, path: impl AsRef<Path>, offset: u64, length: u64) {
        let path = path.as_ref();
        let node = BufferNode::new_file(path, offset, length);
        if !node.available() {
            error!("{} is not sendable, dropping the send", path.display());
            return;
        }
        self.enqueue_node(node);
    }

    /// Send a caller-driven pull stream. The producer fills the window it
    /// is given and returns the byte count, 0 meaning end of stream; it is
    /// a pure data source and must not call back into the connection.
    pub fn send_stream(
        self: &Arc<Self>,
        producer: impl FnMut(&mut [u8]) -> usize + Send + 'static,
    ) {
        self.enqueue_node(BufferNode::new_pull_stream(Box::new(producer)));
    }

    /// Queue an async push stream and return its producer handle. The
    /// stream ends when the handle is closed or dropped.
    pub fn send_async_stream(self: &Arc<Self>) -> AsyncStream {
        let id = self.next_async_id.fetch_add(1, Ordering::Relaxed);
        self.enqueue_node(BufferNode::new_async(id));
        AsyncStream::new(Arc::downgrade(self), id)
    }

    fn enqueue_node(self: &Arc<Self>, node: BufferNode) {
        let this = self.clone();
        self.event_loop.run_in_loop(move || {
            let mut inner = this.inner.lock();
            inner.egress.push_back(node);
            let drive = inner.egress.len() == 1
                && inner.egress.front().is_some_and(|n| n.remaining() > 0);
            if drive {
                // the node went straight to the head: push bytes out now
                this.send_node_in_loop(&mut inner);
            }
        });
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.status() != ConnStatus::Connected {
            warn!("connection {} is not connected, giving up sending", self.name);
            return;
        }
        let mut high_water_fires: Vec<(HighWaterCallback, usize)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.extend_life(&mut inner);
            let writing = inner.channel.as_ref().is_some_and(|c| c.is_writing());
            let mut sent = 0usize;
            if !writing && inner.egress.is_empty() {
                let result = {
                    let Inner { socket, tls, .. } = &mut *inner;
                    match socket.as_ref() {
                        Some(socket) => self.write_node_bytes(socket, tls, data),
                        None => Ok(0),
                    }
                };
                match result {
                    Ok(n) => sent = n,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) =>
                    {
                        trace!("broken pipe or reset while sending on {}: {}", self.name, e);
                        return;
                    }
                    Err(e) => {
                        error!("unexpected send error on {}: {}", self.name, e);
                        return;
                    }
                }
            }
            if sent < data.len() {
                let rest = &data[sent..];
                match inner.egress.back_mut() {
                    Some(tail) if !tail.is_file() && !tail.is_stream() => tail.append(rest),
                    _ => {
                        let mut node = BufferNode::new_memory();
                        node.append(rest);
                        inner.egress.push_back(node);
                    }
                }
                self.enable_writing_if_idle(&inner);
                if let Some(cb) = inner.cbs.high_water.clone() {
                    let threshold = inner.high_water;
                    let tail_len = inner.egress.back().map_or(0, |n| n.remaining());
                    if tail_len > threshold {
                        high_water_fires.push((cb.clone(), tail_len));
                    }
                    let backlog = inner.tls.as_ref().map_or(0, |shim| shim.buffered_len());
                    if backlog > threshold {
                        high_water_fires.push((cb.clone(), backlog));
                    }
                }
            }
            self.ensure_tls_write_interest(&inner);
        }
        for (cb, len) in high_water_fires {
            cb(self, len);
        }
    }

    /// Push bytes from the async node addressed by `node_id`, or mark it
    /// done when `data` is `None`.
    pub(crate) fn send_async_data_in_loop(self: &Arc<Self>, node_id: u64, data: Option<&[u8]>) {
        self.event_loop.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        match data {
            Some(data) => {
                if data.is_empty() {
                    return;
                }
                let head_drained = inner
                    .egress
                    .front()
                    .is_some_and(|n| n.async_id() == Some(node_id) && n.remaining() == 0);
                if head_drained {
                    // nothing is queued ahead: write now, buffer only the tail
                    let result = {
                        let Inner { socket, tls, .. } = &mut *inner;
                        match socket.as_ref() {
                            Some(socket) => self.write_node_bytes(socket, tls, data),
                            None => Ok(0),
                        }
                    };
                    let written = match result {
                        Ok(n) => n,
                        Err(e) => {
                            error!("async write error on {}: {}", self.name, e);
                            0
                        }
                    };
                    if written < data.len() {
                        if let Some(node) = inner.egress.front_mut() {
                            node.append(&data[written..]);
                        }
                        self.enable_writing_if_idle(&inner);
                    }
                } else if let Some(node) = inner
                    .egress
                    .iter_mut()
                    .find(|n| n.async_id() == Some(node_id))
                {
                    node.append(data);
                } else {
                    trace!("async stream node is gone, dropping {} bytes", data.len());
                }
            }
            None => {
                if let Some(node) = inner
                    .egress
                    .iter_mut()
                    .find(|n| n.async_id() == Some(node_id))
                {
                    node.mark_done();
                }
                // let the drain loop pop the finished node
                self.enable_writing_if_idle(&inner);
            }
        }
    }

    // ---- event handlers ----

    fn handle_read(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        let Some(socket) = inner.socket.clone() else {
            return;
        };
        let result = socket.read_buf(&mut inner.ingress);
        match result {
            Ok(0) => {
                // peer closed its write half
                drop(inner);
                self.handle_close();
            }
            Ok(n) => {
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                self.extend_life(&mut inner);
                #[cfg(feature = "tls")]
                if inner.tls.is_some() {
                    self.read_tls_in_loop(inner);
                    return;
                }
                let Some(cb) = inner.cbs.message.clone() else {
                    return;
                };
                let mut buf = std::mem::take(&mut inner.ingress);
                drop(inner);
                cb(self, &mut buf);
                // unconsumed bytes stay for the next event
                self.inner.lock().ingress = buf;
            }
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock => {}
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                    trace!("reset or broken pipe on {}: {}", self.name, e);
                }
                io::ErrorKind::ConnectionAborted => {
                    trace!("connection aborted on {}: {}", self.name, e);
                    drop(inner);
                    self.handle_close();
                }
                _ => {
                    error!("read error on {}: {}", self.name, e);
                    drop(inner);
                    self.handle_close();
                }
            },
        }
    }

    #[cfg(feature = "tls")]
    fn read_tls_in_loop<'a>(
        self: &'a Arc<Self>,
        mut inner: parking_lot::MutexGuard<'a, Inner>,
    ) {
        let result = {
            let Inner {
                socket,
                tls,
                ingress,
                ..
            } = &mut *inner;
            let (Some(socket), Some(shim)) = (socket.as_ref(), tls.as_mut()) else {
                return;
            };
            let mut write = raw_write(socket, &self.bytes_sent);
            shim.recv_data(ingress, &mut write)
        };
        match result {
            Ok(status) => {
                self.ensure_tls_write_interest(&inner);
                if status.handshake_complete {
                    let upgrade = inner.cbs.tls_upgrade.take();
                    let connection = inner.cbs.connection.clone();
                    drop(inner);
                    if let Some(cb) = upgrade {
                        cb(self);
                    } else if let Some(cb) = connection {
                        cb(self);
                    }
                    inner = self.inner.lock();
                }
                if let Some(cb) = inner.cbs.message.clone() {
                    let plain = inner.tls.as_mut().and_then(|shim| {
                        shim.has_plaintext().then(|| shim.take_plaintext())
                    });
                    if let Some(mut plain) = plain {
                        drop(inner);
                        cb(self, &mut plain);
                        inner = self.inner.lock();
                        if let Some(shim) = inner.tls.as_mut() {
                            shim.restore_plaintext(plain);
                        }
                    }
                }
                if status.close_alert {
                    drop(inner);
                    debug!("peer sent a tls close alert on {}", self.name);
                    self.shutdown();
                }
            }
            Err(e) => {
                let cb = inner.cbs.tls_error.clone();
                drop(inner);
                error!("tls error on {}: {}", self.name, e);
                if let Some(cb) = cb {
                    cb(self, &e);
                }
                self.force_close();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let mut write_complete: Option<WriteCompleteCallback> = None;
        let mut shutdown_after = false;
        {
            let mut inner = self.inner.lock();
            let writing = inner.channel.as_ref().is_some_and(|c| c.is_writing());
            if !writing {
                error!(
                    "writable event on {} with write interest disabled",
                    self.name
                );
                return;
            }
            self.extend_life(&mut inner);

            // the shim's ciphertext backlog goes first; nothing may pass it
            {
                let Inner { socket, tls, .. } = &mut *inner;
                if let (Some(socket), Some(shim)) = (socket.as_ref(), tls.as_mut()) {
                    let mut write = raw_write(socket, &self.bytes_sent);
                    if !shim.send_buffered_data(&mut write) {
                        return;
                    }
                }
            }

            let had_pending = !inner.egress.is_empty();
            loop {
                let head = match inner.egress.front() {
                    None => break,
                    Some(node) => (node.remaining(), node.is_async() && node.available()),
                };
                if head.0 == 0 {
                    if head.1 {
                        // drained but live: wait for the async producer
                        if let Some(channel) = inner.channel.as_ref() {
                            channel.disable_writing();
                        }
                        return;
                    }
                    inner.egress.pop_front();
                    continue;
                }
                self.send_node_in_loop(&mut inner);
                if inner.egress.front().map_or(0, |n| n.remaining()) > 0 {
                    // partial progress; the loop will call back
                    return;
                }
            }

            if let Some(channel) = inner.channel.as_ref() {
                channel.disable_writing();
            }
            if had_pending {
                write_complete = inner.cbs.write_complete.clone();
            }
            let backlog = inner.tls.as_ref().map_or(0, |shim| shim.buffered_len());
            if inner.close_on_empty && backlog == 0 {
                shutdown_after = true;
            }
        }
        if let Some(cb) = write_complete {
            cb(self);
        }
        if shutdown_after {
            self.shutdown();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.status() == ConnStatus::Disconnected {
            return;
        }
        trace!("connection closed, {}", self.name);
        self.set_status(ConnStatus::Disconnected);
        let (connection, close) = {
            let inner = self.inner.lock();
            if let Some(channel) = inner.channel.as_ref() {
                channel.disable_all();
            }
            (inner.cbs.connection.clone(), inner.cbs.close.clone())
        };
        // hold a strong reference across the callbacks
        let guard = self.clone();
        if let Some(cb) = connection {
            cb(&guard);
        }
        if let Some(cb) = close {
            trace!("invoking the close callback for {}", self.name);
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = {
            let inner = self.inner.lock();
            inner.socket.as_ref().and_then(|socket| socket.take_error())
        };
        let Some(err) = err else {
            return;
        };
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                trace!("[{}] - SO_ERROR = {}", self.name, err);
            }
            _ => {
                error!("[{}] - SO_ERROR = {}", self.name, err);
            }
        }
    }

    // ---- internals ----

    fn set_status(&self, status: ConnStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn fire_connection_callback(self: &Arc<Self>) {
        let cb = self.inner.lock().cbs.connection.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Re-arm the idle wheel on activity, at most once per second.
    fn extend_life(&self, inner: &mut Inner) {
        if inner.idle_timeout_secs == 0 {
            return;
        }
        let now = Instant::now();
        if let Some(last) = inner.last_kick {
            if now.duration_since(last) < Duration::from_secs(1) {
                return;
            }
        }
        inner.last_kick = Some(now);
        if let (Some(entry), Some(wheel)) = (inner.kickoff.upgrade(), inner.wheel.upgrade()) {
            wheel.insert_entry(inner.idle_timeout_secs, entry);
        }
    }

    fn enable_writing_if_idle(&self, inner: &Inner) {
        if let Some(channel) = inner.channel.as_ref() {
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    fn ensure_tls_write_interest(&self, inner: &Inner) {
        let backlog = inner.tls.as_ref().map_or(0, |shim| shim.buffered_len());
        if backlog > 0 {
            self.enable_writing_if_idle(inner);
        }
    }

    #[cfg(feature = "tls")]
    fn flush_tls(&self, inner: &mut Inner) {
        let Inner {
            socket,
            tls,
            channel,
            ..
        } = &mut *inner;
        let (Some(socket), Some(shim)) = (socket.as_ref(), tls.as_mut()) else {
            return;
        };
        let mut write = raw_write(socket, &self.bytes_sent);
        if !shim.send_buffered_data(&mut write) {
            if let Some(channel) = channel.as_ref() {
                if !channel.is_writing() {
                    channel.enable_writing();
                }
            }
        }
    }

    /// Route bytes to the wire: through the shim when one is present,
    /// straight to the socket otherwise. Would-block reads as 0 accepted.
    fn write_node_bytes(
        &self,
        socket: &Socket,
        tls: &mut Option<TlsShim>,
        data: &[u8],
    ) -> io::Result<usize> {
        if let Some(shim) = tls.as_mut() {
            let mut write = raw_write(socket, &self.bytes_sent);
            return Ok(shim.send_data(data, &mut write));
        }
        match socket.write(data) {
            Ok(n) => {
                self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drive one round of output for the queue head.
    fn send_node_in_loop(&self, inner: &mut Inner) {
        self.event_loop.assert_in_loop_thread();

        #[cfg(target_os = "linux")]
        if inner.egress.front().is_some_and(|n| n.is_file()) && inner.tls.is_none() {
            self.sendfile_in_loop(inner);
            return;
        }

        enum Step {
            Continue,
            Finished,
            Partial,
        }
        loop {
            let step = {
                let Inner {
                    egress,
                    socket,
                    tls,
                    ..
                } = &mut *inner;
                let Some(node) = egress.front_mut() else { break };
                if node.remaining() == 0 {
                    break;
                }
                let Some(socket) = socket.as_ref() else { break };
                let window = node.window();
                if window.is_empty() {
                    // the source ran out before its nominal length
                    node.mark_done();
                    Step::Finished
                } else {
                    let len = window.len();
                    match self.write_node_bytes(socket, tls, window) {
                        Ok(n) => {
                            node.advance(n);
                            if n < len {
                                Step::Partial
                            } else if node.remaining() == 0 {
                                Step::Finished
                            } else {
                                Step::Continue
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                            ) =>
                        {
                            trace!("peer went away while sending a node on {}: {}", self.name, e);
                            return;
                        }
                        Err(e) => {
                            error!("unexpected error sending a node on {}: {}", self.name, e);
                            return;
                        }
                    }
                }
            };
            match step {
                Step::Continue => continue,
                Step::Finished => break,
                Step::Partial => {
                    self.enable_writing_if_idle(inner);
                    trace!("partial node write on {}, waiting for the loop", self.name);
                    return;
                }
            }
        }
        // keep the writable path armed so the drain loop pops the node
        self.enable_writing_if_idle(inner);
    }

    /// Zero-copy path for plain file nodes.
    #[cfg(target_os = "linux")]
    fn sendfile_in_loop(&self, inner: &mut Inner) {
        let Inner {
            egress,
            socket,
            channel,
            ..
        } = &mut *inner;
        let (Some(node), Some(socket)) = (egress.front_mut(), socket.as_ref()) else {
            return;
        };
        let Some(fd) = node.file_fd() else { return };
        let to_send = node.remaining();
        if to_send == 0 {
            error!("no bytes left to send from the file node");
            return;
        }
        trace!("sending a file node with sendfile()");
        match socket.sendfile(fd, to_send) {
            Ok(0) => {
                error!("sendfile made no progress on {}", self.name);
            }
            Ok(n) => {
                self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                node.advance(n);
                if let Some(channel) = channel.as_ref() {
                    if !channel.is_writing() {
                        channel.enable_writing();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(channel) = channel.as_ref() {
                    if !channel.is_writing() {
                        channel.enable_writing();
                    }
                }
            }
            Err(e) => {
                error!("sendfile failed on {}: {}", self.name, e);
                if let Some(channel) = channel.as_ref() {
                    if channel.is_writing() {
                        channel.disable_writing();
                    }
                }
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // still nominally connected: give the peer a close alert
        if self.status() == ConnStatus::Connected {
            let bytes_sent = &self.bytes_sent;
            let inner = self.inner.get_mut();
            let Inner { socket, tls, .. } = inner;
            if let (Some(socket), Some(shim)) = (socket.as_ref(), tls.as_mut()) {
                let mut write = raw_write(socket, bytes_sent);
                shim.queue_close_notify(&mut write);
            }
        }
    }
}

/// The raw-write primitive handed to the TLS shim; this is where the
/// bytes-sent counter is maintained.
fn raw_write<'a>(
    socket: &'a Socket,
    counter: &'a AtomicU64,
) -> impl FnMut(&[u8]) -> io::Result<usize> + 'a {
    move |data| match socket.write(data) {
        Ok(n) => {
            counter.fetch_add(n as u64, Ordering::Relaxed);
            Ok(n)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    use strand_reactor::EventLoopThread;

    fn pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// Shrink both socket buffers so large sends block early and
    /// deterministically exercise the partial-write paths.
    fn shrink_buffers(stream: &std::net::TcpStream) {
        for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
            let value: libc::c_int = 16 * 1024;
            let rc = unsafe {
                libc::setsockopt(
                    stream.as_raw_fd(),
                    libc::SOL_SOCKET,
                    opt,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            assert_eq!(rc, 0);
        }
    }

    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        (0..len)
            .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(seed) % 251) as u8)
            .collect()
    }

    fn temp_file(tag: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "strand-conn-{}-{}",
            std::process::id(),
            tag
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Run a probe on the loop with the connection state borrowed.
    fn probe<T: Send + 'static>(
        conn: &Arc<TcpConnection>,
        f: impl FnOnce(&mut Inner) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = mpsc::channel();
        let target = conn.clone();
        conn.loop_handle().queue_in_loop(move || {
            let mut inner = target.inner.lock();
            let _ = tx.send(f(&mut inner));
        });
        rx.recv_timeout(Duration::from_secs(10)).expect("probe timed out")
    }

    fn is_writing(inner: &Inner) -> bool {
        inner.channel.as_ref().is_some_and(|c| c.is_writing())
    }

    fn read_exactly(peer: &mut std::net::TcpStream, len: usize) -> Vec<u8> {
        peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut got = vec![0u8; len];
        peer.read_exact(&mut got).unwrap();
        got
    }

    fn established(lt: &EventLoopThread) -> (Arc<TcpConnection>, std::net::TcpStream) {
        let (local, peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));
        (conn, peer)
    }

    #[test]
    fn test_send_reaches_peer_and_peer_close_is_seen() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        conn.set_close_callback(move |_| {
            closes2.fetch_add(1, Ordering::AcqRel);
        });
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        conn.send(b"hello");
        assert_eq!(read_exactly(&mut peer, 5), b"hello");
        assert_eq!(conn.bytes_sent(), 5);

        drop(peer);
        assert!(wait_until(|| conn.is_disconnected()));
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_fast_path_leaves_nothing_queued() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);
        // give the loop a beat to observe initial socket readiness
        thread::sleep(Duration::from_millis(50));

        conn.send(b"small payload");
        let (queued, writing) = probe(&conn, |inner| (inner.egress.len(), is_writing(inner)));
        assert_eq!(queued, 0);
        assert!(!writing);
        assert_eq!(read_exactly(&mut peer, 13), b"small payload");
    }

    #[test]
    fn test_partial_write_buffers_remainder_in_one_memory_node() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        shrink_buffers(&local);
        shrink_buffers(&peer);
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        let completions = Arc::new(AtomicUsize::new(0));
        let completions2 = completions.clone();
        conn.set_write_complete_callback(move |_| {
            completions2.fetch_add(1, Ordering::AcqRel);
        });
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        let payload = pattern(1024 * 1024, 1);
        conn.send(&payload);

        let (queued, memory_tail, writing) = probe(&conn, |inner| {
            (
                inner.egress.len(),
                matches!(inner.egress.front(), Some(BufferNode::Memory(_))),
                is_writing(inner),
            )
        });
        assert_eq!(queued, 1);
        assert!(memory_tail);
        assert!(writing);

        assert_eq!(read_exactly(&mut peer, payload.len()), payload);
        assert!(wait_until(|| completions.load(Ordering::Acquire) == 1));
        let (queued, writing) = probe(&conn, |inner| (inner.egress.len(), is_writing(inner)));
        assert_eq!(queued, 0);
        assert!(!writing);
        assert_eq!(conn.bytes_sent(), payload.len() as u64);
    }

    #[test]
    fn test_node_coalescing_rules() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        shrink_buffers(&local);
        shrink_buffers(&peer);
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        let first = pattern(256 * 1024, 2);
        conn.send(&first);
        assert_eq!(probe(&conn, |inner| inner.egress.len()), 1);

        // consecutive sends append to the memory tail
        conn.send(b"x");
        conn.send(b"y");
        assert_eq!(probe(&conn, |inner| inner.egress.len()), 1);

        // a file tail forces the next send into a fresh memory node
        let file_bytes = pattern(1024, 3);
        let path = temp_file("coalesce", &file_bytes);
        conn.send_file(&path, 0, 0);
        assert_eq!(probe(&conn, |inner| inner.egress.len()), 2);
        conn.send(b"z");
        assert_eq!(probe(&conn, |inner| inner.egress.len()), 3);

        let mut expected = first.clone();
        expected.extend_from_slice(b"xy");
        expected.extend_from_slice(&file_bytes);
        expected.extend_from_slice(b"z");
        assert_eq!(read_exactly(&mut peer, expected.len()), expected);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mixed_queue_preserves_fifo_order() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        shrink_buffers(&local);
        shrink_buffers(&peer);
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        let head = pattern(512 * 1024, 4);
        let file_bytes = pattern(256 * 1024 + 1024, 5);
        let tail = pattern(128 * 1024, 6);
        let path = temp_file("fifo", &file_bytes);

        conn.send(&head);
        conn.send_file(&path, 1024, 0);
        conn.send(&tail);

        let mut expected = head.clone();
        expected.extend_from_slice(&file_bytes[1024..]);
        expected.extend_from_slice(&tail);
        assert_eq!(read_exactly(&mut peer, expected.len()), expected);
        assert_eq!(conn.bytes_sent(), expected.len() as u64);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_send_file_whole_file() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);

        let contents = pattern(100, 7);
        let path = temp_file("whole", &contents);
        conn.send_file(&path, 0, 0);

        assert_eq!(read_exactly(&mut peer, 100), contents);
        assert!(conn.is_connected());
        assert_eq!(conn.bytes_sent(), 100);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_send_file_with_bad_offset_sends_nothing() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);

        let path = temp_file("bad-offset", &pattern(100, 8));
        conn.send_file(&path, 200, 0);

        assert_eq!(probe(&conn, |inner| inner.egress.len()), 0);
        assert!(conn.is_connected());
        assert_eq!(conn.bytes_sent(), 0);

        peer.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let mut sink = [0u8; 16];
        let err = peer.read(&mut sink).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_pull_stream_runs_until_producer_ends() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);

        let chunks: Vec<Vec<u8>> = (0..5).map(|i| pattern(1000, 100 + i)).collect();
        let mut feed = chunks.clone();
        feed.reverse();
        conn.send_stream(move |dst| match feed.pop() {
            Some(chunk) => {
                dst[..chunk.len()].copy_from_slice(&chunk);
                chunk.len()
            }
            None => 0,
        });

        let expected: Vec<u8> = chunks.concat();
        assert_eq!(read_exactly(&mut peer, expected.len()), expected);
        assert!(wait_until(|| probe(&conn, |inner| inner.egress.is_empty())));
    }

    #[test]
    fn test_async_stream_cross_thread_push_then_close() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);

        let handle = conn.send_async_stream();
        let payload = pattern(10 * 1024, 9);
        let pushed = payload.clone();
        let pusher = thread::spawn(move || {
            handle.send(&pushed);
            handle
        });
        let handle = pusher.join().unwrap();
        let closer = thread::spawn(move || handle.close());
        closer.join().unwrap();
        conn.shutdown();

        peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_async_stream_drop_acts_as_close() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);

        let handle = conn.send_async_stream();
        handle.send(b"tail");
        drop(handle);
        conn.send(b"post");

        assert_eq!(read_exactly(&mut peer, 8), b"tailpost");
        assert!(wait_until(|| probe(&conn, |inner| inner.egress.is_empty())));
        assert!(conn.is_connected());
    }

    #[test]
    fn test_force_close_is_idempotent() {
        let lt = EventLoopThread::start("conn-test");
        let (local, _peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        conn.set_close_callback(move |_| {
            closes2.fetch_add(1, Ordering::AcqRel);
        });
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        conn.force_close();
        conn.force_close();
        assert!(wait_until(|| conn.is_disconnected()));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(closes.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_shutdown_is_deferred_until_egress_drains() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        shrink_buffers(&local);
        shrink_buffers(&peer);
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        let payload = pattern(512 * 1024, 10);
        conn.send(&payload);
        conn.shutdown();

        let deferred = probe(&conn, |inner| inner.close_on_empty);
        assert!(deferred);
        assert!(conn.is_connected());

        // the peer drains everything, then sees the deferred half-close
        assert_eq!(read_exactly(&mut peer, payload.len()), payload);
        peer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut sink = [0u8; 16];
        assert_eq!(peer.read(&mut sink).unwrap(), 0);

        drop(peer);
        assert!(wait_until(|| conn.is_disconnected()));
    }

    #[test]
    fn test_send_while_not_connected_is_dropped() {
        let lt = EventLoopThread::start("conn-test");
        let (local, _peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();

        // not yet established
        conn.send(b"too early");
        assert_eq!(probe(&conn, |inner| inner.egress.len()), 0);
        assert_eq!(conn.bytes_sent(), 0);

        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));
        conn.force_close();
        assert!(wait_until(|| conn.is_disconnected()));

        conn.send(b"too late");
        assert_eq!(probe(&conn, |inner| inner.egress.len()), 0);
        assert_eq!(conn.bytes_sent(), 0);
    }

    #[test]
    fn test_off_thread_sends_keep_call_order() {
        let lt = EventLoopThread::start("conn-test");
        let (conn, mut peer) = established(&lt);

        let sender = conn.clone();
        let writer = thread::spawn(move || {
            for i in 0..50u64 {
                sender.send_bytes(pattern(100, 200 + i));
            }
        });
        writer.join().unwrap();

        let mut expected = Vec::new();
        for i in 0..50u64 {
            expected.extend_from_slice(&pattern(100, 200 + i));
        }
        assert_eq!(read_exactly(&mut peer, expected.len()), expected);
    }

    #[test]
    fn test_high_water_mark_fires_on_backlog() {
        let lt = EventLoopThread::start("conn-test");
        let (local, _peer_alive) = {
            let (local, peer) = pair();
            shrink_buffers(&local);
            shrink_buffers(&peer);
            (local, peer)
        };
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        conn.set_high_water_mark_callback(
            move |_, len| {
                seen2.store(len, Ordering::Release);
            },
            10 * 1024,
        );
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        conn.send(&pattern(256 * 1024, 11));
        assert!(wait_until(|| seen.load(Ordering::Acquire) > 10 * 1024));
    }

    #[test]
    fn test_message_callback_sees_unconsumed_bytes_again() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        let frames = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let frames2 = frames.clone();
        conn.set_message_callback(move |_, buf| {
            // wait for a whole 5-byte frame before consuming anything
            if buf.len() >= 5 {
                let frame = buf.split_to(5);
                frames2.lock().push(frame.to_vec());
            }
        });
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        peer.write_all(b"he").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(frames.lock().is_empty());
        peer.write_all(b"llo").unwrap();

        assert!(wait_until(|| frames.lock().len() == 1));
        assert_eq!(frames.lock()[0], b"hello");
        assert_eq!(conn.bytes_received(), 5);
    }

    #[test]
    fn test_echo_from_message_callback() {
        let lt = EventLoopThread::start("conn-test");
        let (local, mut peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        conn.set_message_callback(move |conn, buf| {
            let data = buf.split();
            conn.send(&data);
        });
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));

        peer.write_all(b"echo me").unwrap();
        assert_eq!(read_exactly(&mut peer, 7), b"echo me");
    }

    #[test]
    fn test_idle_timeout_bounces_with_activity() {
        let lt = EventLoopThread::start("conn-test");
        let wheel = TimingWheel::new(lt.handle(), 8);
        let (local, peer) = pair();
        let conn = TcpConnection::new(lt.handle().clone(), local).unwrap();
        conn.connect_established();
        assert!(wait_until(|| conn.is_connected()));
        conn.enable_kicking_off(2, &wheel);

        // drain whatever the connection sends
        let reader = thread::spawn(move || {
            let mut peer = peer;
            peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
            let mut sink = [0u8; 1024];
            loop {
                match peer.read(&mut sink) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                    Err(_) => break,
                }
            }
        });

        // steady activity keeps the connection alive past its timeout
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(600));
            conn.send(b".");
            assert!(conn.is_connected());
        }

        // activity stops: the wheel evicts the connection
        assert!(wait_until(|| conn.is_disconnected()));
        reader.join().unwrap();
    }

    #[cfg(feature = "tls")]
    mod tls {
        use super::*;
        use crate::test_certs::{client_config, server_config};
        use crate::tls::TlsContext;

        fn tls_pair(
            lt: &EventLoopThread,
        ) -> (Arc<TcpConnection>, Arc<TcpConnection>) {
            let (client_sock, server_sock) = pair();
            let server = TcpConnection::new_with_tls(
                lt.handle().clone(),
                server_sock,
                TlsContext::Server(server_config()),
            )
            .unwrap();
            let client = TcpConnection::new_with_tls(
                lt.handle().clone(),
                client_sock,
                TlsContext::Client {
                    config: client_config(),
                    server_name: "localhost".try_into().unwrap(),
                },
            )
            .unwrap();
            (client, server)
        }

        #[test]
        fn test_tls_round_trip_with_handshake_gating() {
            let lt = EventLoopThread::start("tls-test");
            let (client, server) = tls_pair(&lt);

            let events = Arc::new(Mutex::new(Vec::<String>::new()));
            let ev = events.clone();
            server.set_connection_callback(move |conn| {
                if conn.is_connected() {
                    ev.lock().push("server-up".into());
                }
            });
            let ev = events.clone();
            server.set_message_callback(move |conn, buf| {
                let text = String::from_utf8_lossy(&buf.split()).into_owned();
                ev.lock().push(format!("server-msg:{text}"));
                conn.send(b"pong");
            });
            let ev = events.clone();
            client.set_connection_callback(move |conn| {
                if conn.is_connected() {
                    ev.lock().push("client-up".into());
                }
            });
            let ev = events.clone();
            client.set_message_callback(move |_, buf| {
                let text = String::from_utf8_lossy(&buf.split()).into_owned();
                ev.lock().push(format!("client-msg:{text}"));
            });

            server.connect_established();
            client.connect_established();
            // sent before the handshake finishes: must be queued, then
            // delivered exactly once
            client.send(b"ping");

            assert!(wait_until(|| {
                events.lock().iter().any(|e| e == "client-msg:pong")
            }));
            let log = events.lock().clone();
            let up = log.iter().position(|e| e == "server-up").unwrap();
            let msg = log.iter().position(|e| e == "server-msg:ping").unwrap();
            assert!(up < msg, "connection callback must precede data: {log:?}");
            assert_eq!(
                log.iter().filter(|e| *e == "server-msg:ping").count(),
                1
            );
        }

        #[test]
        fn test_tls_shutdown_closes_both_sides() {
            let lt = EventLoopThread::start("tls-test");
            let (client, server) = tls_pair(&lt);
            server.set_message_callback(|conn, buf| {
                let data = buf.split();
                conn.send(&data);
            });
            server.connect_established();
            client.connect_established();

            let echoed = Arc::new(AtomicUsize::new(0));
            let echoed2 = echoed.clone();
            client.set_message_callback(move |_, buf| {
                echoed2.fetch_add(buf.len(), Ordering::AcqRel);
                buf.clear();
            });
            client.send(b"bye");
            assert!(wait_until(|| echoed.load(Ordering::Acquire) == 3));

            client.shutdown();
            assert!(wait_until(|| {
                client.is_disconnected() && server.is_disconnected()
            }));
        }

        #[test]
        fn test_start_encryption_rejects_a_second_shim() {
            let lt = EventLoopThread::start("tls-test");
            let (client, _server) = tls_pair(&lt);
            let err = client
                .start_encryption(
                    TlsContext::Client {
                        config: client_config(),
                        server_name: "localhost".try_into().unwrap(),
                    },
                    None,
                )
                .unwrap_err();
            assert!(matches!(err, EngineError::TlsAlreadyActive));
        }

        #[test]
        fn test_starttls_upgrade_on_a_plain_connection() {
            let lt = EventLoopThread::start("tls-test");
            let (client_sock, server_sock) = pair();
            let server = TcpConnection::new(lt.handle().clone(), server_sock).unwrap();
            let client = TcpConnection::new(lt.handle().clone(), client_sock).unwrap();

            let received = Arc::new(Mutex::new(Vec::<u8>::new()));
            let received2 = received.clone();
            server.set_message_callback(move |_, buf| {
                received2.lock().extend_from_slice(&buf.split());
            });
            server.connect_established();
            client.connect_established();
            assert!(wait_until(|| client.is_connected() && server.is_connected()));

            // the accepting side must be ready before the first flight lands
            server
                .start_encryption(TlsContext::Server(server_config()), None)
                .unwrap();
            probe(&server, |_| ());

            let upgraded = Arc::new(AtomicUsize::new(0));
            let upgraded2 = upgraded.clone();
            client
                .start_encryption(
                    TlsContext::Client {
                        config: client_config(),
                        server_name: "localhost".try_into().unwrap(),
                    },
                    Some(Arc::new(move |_: &Arc<TcpConnection>| {
                        upgraded2.fetch_add(1, Ordering::AcqRel);
                    })),
                )
                .unwrap();

            client.send(b"secret");
            assert!(wait_until(|| received.lock().as_slice() == b"secret".as_slice()));
            assert_eq!(upgraded.load(Ordering::Acquire), 1);
        }
    }
}
