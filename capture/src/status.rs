use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the capture scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

/// Human-readable status shown by whatever UI is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    Capturing,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ready => f.write_str("Ready"),
            Status::Capturing => f.write_str("Capturing..."),
            Status::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

/// Fans status changes out to subscribers and remembers the latest one.
///
/// Subscribers that fall behind lose the oldest messages, never the publisher's
/// time: `report` does not wait.
#[derive(Clone)]
pub struct StatusReporter {
    events: broadcast::Sender<Status>,
    current: Arc<watch::Sender<Status>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (current, _) = watch::channel(Status::Ready);
        Self {
            events,
            current: Arc::new(current),
        }
    }

    pub fn report(&self, status: Status) {
        self.current.send_replace(status.clone());
        // No subscribers is fine.
        let _ = self.events.send(status);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.events.subscribe()
    }

    pub fn current(&self) -> Status {
        self.current.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_panel_wording() {
        assert_eq!(Status::Ready.to_string(), "Ready");
        assert_eq!(Status::Capturing.to_string(), "Capturing...");
        assert_eq!(
            Status::Error("disk full".into()).to_string(),
            "Error: disk full"
        );
    }

    #[tokio::test]
    async fn subscribers_see_transitions_in_order() {
        let reporter = StatusReporter::new();
        let mut rx = reporter.subscribe();
        reporter.report(Status::Capturing);
        reporter.report(Status::Error("boom".into()));
        reporter.report(Status::Ready);

        assert_eq!(rx.recv().await.unwrap(), Status::Capturing);
        assert_eq!(rx.recv().await.unwrap(), Status::Error("boom".into()));
        assert_eq!(rx.recv().await.unwrap(), Status::Ready);
        assert_eq!(reporter.current(), Status::Ready);
    }

    #[test]
    fn report_without_subscribers_keeps_current() {
        let reporter = StatusReporter::new();
        assert_eq!(reporter.current(), Status::Ready);
        reporter.report(Status::Capturing);
        assert_eq!(reporter.current(), Status::Capturing);
    }
}
