//! Producer handle for async push streams.
//!
//! Returned by `TcpConnection::send_async_stream`; lets application code
//! push bytes into a queued async node from any thread. Dropping the handle
//! without calling [`close`](AsyncStream::close) closes the stream
//! implicitly. The handle holds only a weak reference so an outstanding
//! producer never keeps a dead connection alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use bytes::Bytes;
use tracing::debug;

use crate::connection::{ConnStatus, TcpConnection};

/// Handle for pushing bytes into an async egress node.
pub struct AsyncStream {
    conn: Weak<TcpConnection>,
    node_id: u64,
    closed: AtomicBool,
}

impl AsyncStream {
    pub(crate) fn new(conn: Weak<TcpConnection>, node_id: u64) -> Self {
        Self {
            conn,
            node_id,
            closed: AtomicBool::new(false),
        }
    }

    /// Push bytes into the stream, preserving the order of calls.
    ///
    /// Off-loop callers hand over an owned copy through the loop's task
    /// queue. Bytes pushed after `close` or after the connection died are
    /// dropped.
    pub fn send(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            debug!("async stream already closed, dropping {} bytes", data.len());
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            debug!("connection is gone, giving up sending");
            return;
        };
        if conn.status() != ConnStatus::Connected {
            debug!("connection is not connected, giving up sending");
            return;
        }
        let node_id = self.node_id;
        if conn.loop_handle().is_in_loop_thread() {
            conn.send_async_data_in_loop(node_id, Some(data));
        } else {
            let owned = Bytes::copy_from_slice(data);
            let target = conn.clone();
            conn.loop_handle().queue_in_loop(move || {
                target.send_async_data_in_loop(node_id, Some(&owned));
            });
        }
    }

    /// Mark the stream finished. Idempotent; implied by drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        if conn.status() != ConnStatus::Connected {
            return;
        }
        let node_id = self.node_id;
        let target = conn.clone();
        conn.loop_handle().run_in_loop(move || {
            target.send_async_data_in_loop(node_id, None);
        });
    }
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        self.close();
    }
}
