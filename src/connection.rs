//! Connection Tracker: in-memory per-channel active-request counter,
//! guarded the same way as the other small rolling-state trackers in this
//! crate (`parking_lot::RwLock<HashMap<_, _>>`).

use crate::model::ChannelId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ConnectionTracker {
    active: RwLock<HashMap<ChannelId, usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, channel_id: ChannelId) {
        let mut active = self.active.write();
        *active.entry(channel_id).or_insert(0) += 1;
    }

    /// Never lets a channel's counter go below zero; removes the entry
    /// entirely once it reaches zero so the map doesn't grow unbounded over
    /// the lifetime of the process.
    pub fn decrement(&self, channel_id: ChannelId) {
        let mut active = self.active.write();
        if let Some(count) = active.get_mut(&channel_id) {
            if *count <= 1 {
                active.remove(&channel_id);
            } else {
                *count -= 1;
            }
        }
    }

    pub fn active(&self, channel_id: ChannelId) -> usize {
        *self.active.read().get(&channel_id).unwrap_or(&0)
    }

    pub fn snapshot(&self) -> HashMap<ChannelId, usize> {
        self.active.read().clone()
    }
}

/// RAII guard that decrements on drop so every increment is matched by
/// exactly one decrement regardless of exit path (success, error, or the
/// calling task being cancelled out from under an in-flight `.await`).
/// Holds an `Arc` rather than a borrow so it can be moved into a `'static`
/// stream (the persistent stream wrappers in `persist`), not just held
/// across a single `.await`.
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    channel_id: ChannelId,
    released: bool,
}

impl ConnectionGuard {
    pub fn acquire(tracker: &Arc<ConnectionTracker>, channel_id: ChannelId) -> Self {
        tracker.increment(channel_id);
        Self {
            tracker: tracker.clone(),
            channel_id,
            released: false,
        }
    }

    /// Explicit release point for callers that want the decrement to occur
    /// at a specific moment (e.g. stream close) rather than implicitly via
    /// scope exit.
    pub fn release(mut self) {
        self.tracker.decrement(self.channel_id);
        self.released = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.decrement(self.channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_then_decrement_returns_to_zero() {
        let t = ConnectionTracker::new();
        t.increment(1);
        t.increment(1);
        assert_eq!(t.active(1), 2);
        t.decrement(1);
        assert_eq!(t.active(1), 1);
        t.decrement(1);
        assert_eq!(t.active(1), 0);
        assert!(!t.snapshot().contains_key(&1));
    }

    #[test]
    fn decrement_never_goes_below_zero() {
        let t = ConnectionTracker::new();
        t.decrement(42);
        assert_eq!(t.active(42), 0);
    }

    #[test]
    fn guard_releases_on_drop() {
        let t = Arc::new(ConnectionTracker::new());
        {
            let _g = ConnectionGuard::acquire(&t, 7);
            assert_eq!(t.active(7), 1);
        }
        assert_eq!(t.active(7), 0);
    }

    #[test]
    fn guard_explicit_release_does_not_double_decrement() {
        let t = Arc::new(ConnectionTracker::new());
        let g = ConnectionGuard::acquire(&t, 9);
        g.release();
        assert_eq!(t.active(9), 0);
    }

    #[test]
    fn empty_channel_has_zero_active_and_no_entry() {
        let t = ConnectionTracker::new();
        assert_eq!(t.active(999), 0);
        assert!(t.snapshot().is_empty());
    }
}
