//! Coarse bucketed timing wheel for idle-connection eviction.
//!
//! Entries are reference-counted; the wheel keeps one strong reference in
//! the bucket they expire in and the owner keeps a weak one. When the last
//! strong reference is dropped the entry's `Drop` runs the eviction action.
//! Re-inserting a live entry into a later bucket extends its life.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::event_loop::LoopHandle;

/// An opaque, reference-counted wheel entry.
pub type WheelEntry = Arc<dyn Any + Send + Sync>;

/// A ring of 1-second buckets driven by a ticker on the owning loop.
pub struct TimingWheel {
    buckets: Mutex<VecDeque<Vec<WheelEntry>>>,
    slots: usize,
}

impl TimingWheel {
    /// Create a wheel able to hold timeouts up to `max_timeout_secs` and
    /// start its 1 Hz ticker on `event_loop`.
    pub fn new(event_loop: &LoopHandle, max_timeout_secs: usize) -> Arc<Self> {
        let slots = max_timeout_secs.max(1) + 1;
        let wheel = Arc::new(Self {
            buckets: Mutex::new((0..slots).map(|_| Vec::new()).collect()),
            slots,
        });

        let weak = Arc::downgrade(&wheel);
        event_loop.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(wheel) = weak.upgrade() else { break };
                wheel.advance();
            }
            trace!("timing wheel ticker exited");
        });

        wheel
    }

    /// Schedule `entry` to be released in roughly `delay_secs` seconds.
    pub fn insert_entry(&self, delay_secs: usize, entry: WheelEntry) {
        let slot = delay_secs.clamp(1, self.slots - 1);
        self.buckets.lock()[slot].push(entry);
    }

    fn advance(&self) {
        let expired = {
            let mut buckets = self.buckets.lock();
            let expired = buckets.pop_front();
            buckets.push_back(Vec::new());
            expired
        };
        // Dropped outside the lock: an entry's Drop may call back into the
        // wheel through the connection it evicts.
        drop(expired);
    }
}
