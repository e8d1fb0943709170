use std::sync::Arc;
use std::time::Duration;

use roi_capture_common::frame::TimestampedFrame;
use tokio::sync::watch;

/// Single-slot holder for the most recent camera frame.
///
/// Publishing swaps an `Arc` and never waits on readers; an unread frame is
/// simply replaced. Readers get the `Arc` of some fully published frame, which
/// is immutable, so there is nothing to tear.
#[derive(Clone)]
pub struct LatestFrameSlot {
    tx: Arc<watch::Sender<Option<Arc<TimestampedFrame>>>>,
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, frame: TimestampedFrame) {
        // send_replace stores the value even with no receivers alive.
        let _previous = self.tx.send_replace(Some(Arc::new(frame)));
    }

    /// Snapshot of the current frame, `None` until the first publish.
    pub fn read(&self) -> Option<Arc<TimestampedFrame>> {
        self.tx.borrow().clone()
    }

    /// Wait until at least one frame has been published, up to `timeout`.
    pub async fn wait_for_frame(&self, timeout: Duration) -> Option<Arc<TimestampedFrame>> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|f| f.is_some())).await;
        match waited {
            Ok(Ok(frame)) => frame.clone(),
            _ => None,
        }
    }
}
