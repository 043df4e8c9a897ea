//! Single-threaded event loop with FIFO work-item posting.
//!
//! Each loop owns one OS thread. All state pinned to a loop is mutated only
//! from that thread; other threads hand work over with `queue_in_loop`, which
//! preserves posting order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// A unit of work posted to an event loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct LoopShared {
    tx: mpsc::UnboundedSender<Task>,
    thread_id: OnceCell<ThreadId>,
    stopped: AtomicBool,
}

/// A single-threaded reactor loop.
///
/// Work items are processed strictly in posting order. The loop also drives
/// futures handed to [`LoopHandle::spawn`] (channel readiness drivers, the
/// timing-wheel ticker) on the same thread, so everything pinned to the loop
/// runs without synchronization.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl EventLoop {
    /// Create a loop and its task queue. Nothing runs until [`run`](Self::run).
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LoopShared {
            tx,
            thread_id: OnceCell::new(),
            stopped: AtomicBool::new(false),
        });
        Self { shared, rx }
    }

    /// A cloneable handle for posting work to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the loop on the current thread until [`LoopHandle::quit`] is called.
    ///
    /// Work items posted before `run` are buffered and processed once the
    /// loop is live.
    pub fn run(mut self) {
        self.shared
            .thread_id
            .set(thread::current().id())
            .expect("event loop started twice");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build loop runtime");
        rt.block_on(async move {
            trace!("event loop started");
            while let Some(task) = self.rx.recv().await {
                task();
                if self.shared.stopped.load(Ordering::Acquire) {
                    break;
                }
            }
            trace!("event loop stopped");
        });
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Send + Clone` handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Whether the calling thread is the loop thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.thread_id.get().copied() == Some(thread::current().id())
    }

    /// Run `f` immediately when already on the loop thread, otherwise post it.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Post `f` to the loop's task queue. Items are processed in FIFO order.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.shared.tx.send(Box::new(f)).is_err() {
            trace!("work item posted to a stopped loop, dropping it");
        }
    }

    /// Drive a future on the loop thread.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.run_in_loop(move || {
            tokio::spawn(fut);
        });
    }

    /// Debug-assert that the caller is on the loop thread.
    pub fn assert_in_loop_thread(&self) {
        debug_assert!(
            self.is_in_loop_thread(),
            "called off the owning loop thread"
        );
    }

    /// Stop the loop after the work item currently being processed.
    pub fn quit(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        // Wake the queue in case the loop is idle.
        let _ = self.shared.tx.send(Box::new(|| {}));
    }
}

/// An event loop running on its own named OS thread.
///
/// Quits the loop and joins the thread on drop.
pub struct EventLoopThread {
    handle: LoopHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn a named thread running a fresh event loop.
    pub fn start(name: &str) -> Self {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop.run())
            .expect("failed to spawn loop thread");
        Self {
            handle,
            join: Some(join),
        }
    }

    /// Handle for posting work to the loop.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("loop thread panicked");
            }
        }
    }
}
