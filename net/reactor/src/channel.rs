//! Per-socket readiness channel.
//!
//! A `Channel` couples one socket to the callbacks of its owner and holds
//! the interest mask the readiness driver waits on. Interest is mutated only
//! from the owning loop thread; the driver re-checks the live mask before
//! every callback because an earlier callback in the same round may have
//! cleared it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::event_loop::LoopHandle;

const READ: u8 = 0b01;
const WRITE: u8 = 0b10;

/// Callbacks a channel dispatches readiness events to.
pub struct EventHandlers {
    /// The socket is readable (or the peer closed its write half).
    pub readable: Box<dyn FnMut() + Send>,
    /// The socket is writable.
    pub writable: Box<dyn FnMut() + Send>,
    /// Both directions are gone without pending readable data.
    pub close: Box<dyn FnMut() + Send>,
    /// Error-class readiness; drain `SO_ERROR` to see what happened.
    pub error: Box<dyn FnMut() + Send>,
}

/// One socket's registration with its event loop.
pub struct Channel {
    stream: Arc<TcpStream>,
    interest: Arc<AtomicU8>,
    removed: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handlers: Option<EventHandlers>,
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

impl Channel {
    /// Wrap a registered socket. No events are delivered until
    /// [`begin_polling`](Self::begin_polling).
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self {
            stream,
            interest: Arc::new(AtomicU8::new(0)),
            removed: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            handlers: None,
            tie: None,
        }
    }

    /// The shared socket this channel polls.
    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }

    /// Install the event callbacks. Must happen before `begin_polling`.
    pub fn set_event_handlers(&mut self, handlers: EventHandlers) {
        self.handlers = Some(handlers);
    }

    /// Couple event dispatch to `owner`'s lifetime: events are delivered only
    /// while the owner is alive, and the owner is kept alive for the duration
    /// of one dispatch round.
    pub fn tie(&mut self, owner: Weak<dyn Any + Send + Sync>) {
        self.tie = Some(owner);
    }

    /// Enable read interest.
    pub fn enable_reading(&self) {
        self.add_interest(READ);
    }

    /// Disable read interest.
    pub fn disable_reading(&self) {
        self.clear_interest(READ);
    }

    /// Enable write interest.
    pub fn enable_writing(&self) {
        self.add_interest(WRITE);
    }

    /// Disable write interest.
    pub fn disable_writing(&self) {
        self.clear_interest(WRITE);
    }

    /// Whether write interest is currently enabled.
    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Acquire) & WRITE != 0
    }

    /// Whether read interest is currently enabled.
    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::Acquire) & READ != 0
    }

    /// Clear the whole interest mask.
    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Release);
        self.notify.notify_one();
    }

    /// Permanently stop event delivery and release the driver.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn add_interest(&self, bit: u8) {
        self.interest.fetch_or(bit, Ordering::AcqRel);
        self.notify.notify_one();
    }

    fn clear_interest(&self, bit: u8) {
        self.interest.fetch_and(!bit, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Spawn the readiness driver on the owning loop.
    pub fn begin_polling(&mut self, event_loop: &LoopHandle) {
        let Some(mut handlers) = self.handlers.take() else {
            warn!("begin_polling without event handlers");
            return;
        };
        let stream = self.stream.clone();
        let interest = self.interest.clone();
        let removed = self.removed.clone();
        let notify = self.notify.clone();
        let tie = self.tie.clone();

        event_loop.spawn(async move {
            loop {
                if removed.load(Ordering::Acquire) {
                    break;
                }
                let mask = interest.load(Ordering::Acquire);
                if mask == 0 {
                    notify.notified().await;
                    continue;
                }
                let want = match (mask & READ != 0, mask & WRITE != 0) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (true, false) => Interest::READABLE,
                    (false, true) => Interest::WRITABLE,
                    (false, false) => unreachable!(),
                };
                tokio::select! {
                    biased;
                    _ = notify.notified() => continue,
                    ready = stream.ready(want) => {
                        // Hold the tied owner alive across this round; stop
                        // delivering once it is gone.
                        let _guard = match &tie {
                            Some(weak) => match weak.upgrade() {
                                Some(owner) => Some(owner),
                                None => break,
                            },
                            None => None,
                        };
                        match ready {
                            Ok(ready) => {
                                if ready.is_error() {
                                    (handlers.error)();
                                }
                                if removed.load(Ordering::Acquire) {
                                    break;
                                }
                                if ready.is_read_closed()
                                    && ready.is_write_closed()
                                    && !ready.is_readable()
                                {
                                    (handlers.close)();
                                    continue;
                                }
                                let live = interest.load(Ordering::Acquire);
                                if live & READ != 0 && (ready.is_readable() || ready.is_read_closed()) {
                                    (handlers.readable)();
                                }
                                if removed.load(Ordering::Acquire) {
                                    break;
                                }
                                let live = interest.load(Ordering::Acquire);
                                if live & WRITE != 0 && ready.is_writable() {
                                    (handlers.writable)();
                                }
                            }
                            Err(e) => {
                                trace!("readiness wait failed: {}", e);
                                (handlers.error)();
                            }
                        }
                    }
                }
            }
            trace!("channel driver exited");
        });
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Release a driver parked with an empty interest mask.
        self.remove();
    }
}
