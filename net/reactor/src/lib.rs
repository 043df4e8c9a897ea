//! Reactor primitives for the strand connection engine.
//!
//! This crate provides the collaborators the per-connection state machine in
//! `strand-engine` is built on: a single-threaded event loop with FIFO work
//! posting, a per-socket channel that routes readiness events to callbacks,
//! a thin nonblocking socket facade, and a coarse timing wheel for idle
//! eviction.
//!
//! ## Features
//!
//! - **Event loop**: one dedicated thread per loop, FIFO task queue,
//!   thread-affinity checks for `run_in_loop`/`queue_in_loop`
//! - **Channel**: interest masks (read/write) with readable/writable/close/
//!   error callback dispatch, tied to an owner's lifetime
//! - **Socket**: nonblocking read/write, half-close, `SO_ERROR` draining,
//!   keepalive/nodelay options, Linux `sendfile(2)`
//! - **Timing wheel**: 1-second buckets; dropping the last reference to an
//!   entry runs its eviction action

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod event_loop;
pub mod socket;
pub mod wheel;

// Re-export main types
pub use channel::{Channel, EventHandlers};
pub use event_loop::{EventLoop, EventLoopThread, LoopHandle, Task};
pub use socket::Socket;
pub use wheel::{TimingWheel, WheelEntry};
