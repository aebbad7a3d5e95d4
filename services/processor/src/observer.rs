//! Change notifications for running statistics.
//!
//! Observers are signalled fire-and-forget. A failing observer is logged and
//! skipped at the dispatch site, never surfaced to the aggregator.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors an observer may report while being signalled.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No connected observers")]
    NoReceivers,

    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Which statistics field changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsChange {
    EventCount,
    EventRate,
    MaleFaceRate,
    FemaleFaceRate,
    ResultAdded,
}

/// A "statistics changed" signal for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsNotification {
    pub criterion: String,
    pub change: StatsChange,
}

/// Receiver of statistics change signals.
pub trait StatsObserver: Send + Sync {
    fn statistics_changed(&self, notification: &StatsNotification) -> Result<(), NotifyError>;
}

/// Closure-based observer
pub struct FnObserver<F>
where
    F: Fn(&StatsNotification) -> Result<(), NotifyError> + Send + Sync,
{
    observer: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&StatsNotification) -> Result<(), NotifyError> + Send + Sync,
{
    pub fn new(observer: F) -> Self {
        Self { observer }
    }
}

impl<F> StatsObserver for FnObserver<F>
where
    F: Fn(&StatsNotification) -> Result<(), NotifyError> + Send + Sync,
{
    fn statistics_changed(&self, notification: &StatsNotification) -> Result<(), NotifyError> {
        (self.observer)(notification)
    }
}

/// Fans notifications out to any number of async listeners (e.g. push
/// connections to browsers).
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<StatsNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatsNotification> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatsObserver for BroadcastNotifier {
    fn statistics_changed(&self, notification: &StatsNotification) -> Result<(), NotifyError> {
        self.sender
            .send(notification.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::NoReceivers)
    }
}
