//! Stream processing sessions.
//!
//! A [`StreamProcessor`] owns at most one session: a filtered subscription,
//! the run-timer and the [`RunningStatistics`] it feeds. Two consumer tasks
//! drain the subscription, one counting every post and one dispatching face
//! detection for each photo. Detection calls run as independent tasks that
//! hold on to the statistics of the session that issued them, so a late
//! completion can never land in a newer session.

use crate::config::ProcessorConfig;
use crate::enrichment::FaceDetector;
use crate::model::{classify_faces, Post};
use crate::observer::StatsObserver;
use crate::result_store::DEFAULT_RESULT_CAPACITY;
use crate::source::{EventSource, SourceError, Subscription};
use crate::statistics::RunningStatistics;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur while managing processing sessions.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Failed to subscribe to event source: {0}")]
    Subscribe(#[from] SourceError),
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
}

/// Runtime settings for a processor.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub result_capacity: usize,
    /// Detection calls running at once
    pub max_in_flight: usize,
    /// Detections admitted but not yet finished, running or waiting
    pub max_pending: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            result_capacity: DEFAULT_RESULT_CAPACITY,
            max_in_flight: 16,
            max_pending: 256,
        }
    }
}

impl From<&ProcessorConfig> for ProcessorSettings {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            result_capacity: config.results.capacity,
            max_in_flight: config.enrichment.max_in_flight,
            max_pending: config.enrichment.max_pending,
        }
    }
}

/// Counters across all sessions of a processor.
#[derive(Debug, Default, Clone)]
pub struct ProcessorStats {
    pub sessions_started: u64,
    pub enrichments_dispatched: u64,
    pub enrichments_shed: u64,
    pub enrichments_succeeded: u64,
    pub enrichments_failed: u64,
    pub results_rejected: u64,
}

struct Session {
    subscription: Subscription,
    statistics: Arc<RunningStatistics>,
    consumers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Stop delivery right away; buffered posts are discarded.
    fn shutdown(self) {
        self.subscription.dispose();
        for consumer in self.consumers {
            consumer.abort();
        }
        info!(
            criterion = %self.statistics.criterion(),
            events = self.statistics.event_count(),
            results = self.statistics.results().len(),
            "Processing session stopped"
        );
    }

    /// Let the consumers run until their streams end.
    async fn drain(self) {
        for consumer in self.consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "Session consumer ended abnormally");
            }
        }
        info!(
            criterion = %self.statistics.criterion(),
            events = self.statistics.event_count(),
            "Processing session drained"
        );
    }
}

/// Dispatches face detection for one session.
#[derive(Clone)]
struct Enricher {
    detector: Arc<dyn FaceDetector>,
    statistics: Arc<RunningStatistics>,
    in_flight: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    stats: Arc<RwLock<ProcessorStats>>,
}

impl Enricher {
    /// Spawn one detection task per photo; never waits on them.
    ///
    /// Photos arriving while the backlog is full are shed.
    fn dispatch(&self, post: &Post) {
        for photo in post.photos() {
            let slot = match self.backlog.clone().try_acquire_owned() {
                Ok(slot) => slot,
                Err(_) => {
                    self.stats.write().enrichments_shed += 1;
                    debug!(
                        post_id = %post.id,
                        locator = %photo.url,
                        "Detection backlog full, picture shed"
                    );
                    continue;
                }
            };

            let enricher = self.clone();
            let locator = photo.url.clone();
            self.stats.write().enrichments_dispatched += 1;
            trace!(post_id = %post.id, locator = %locator, "Dispatching face detection");
            tokio::spawn(enricher.enrich(locator, slot));
        }
    }

    async fn enrich(self, locator: String, _slot: OwnedSemaphorePermit) {
        let _permit = match self.in_flight.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let faces = match self.detector.detect_faces(&locator).await {
            Ok(faces) => faces,
            Err(e) => {
                self.stats.write().enrichments_failed += 1;
                debug!(locator = %locator, error = %e, "Face detection failed, picture dropped");
                return;
            }
        };

        match classify_faces(&locator, &faces) {
            Ok((result, tally)) => {
                self.statistics.record_faces(&tally);
                self.statistics.record_result(result);
                self.stats.write().enrichments_succeeded += 1;
                debug!(
                    criterion = %self.statistics.criterion(),
                    locator = %locator,
                    faces = tally.total,
                    female = tally.female,
                    male = tally.male,
                    "Picture analysed"
                );
            }
            Err(e) => {
                self.stats.write().results_rejected += 1;
                error!(locator = %locator, error = %e, "Discarding result with invalid locator");
            }
        }
    }
}

/// Orchestrates processing sessions over an event source.
pub struct StreamProcessor {
    source: Arc<dyn EventSource>,
    detector: Arc<dyn FaceDetector>,
    settings: ProcessorSettings,
    observers: Vec<Arc<dyn StatsObserver>>,
    session: Mutex<Option<Session>>,
    in_flight: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    backlog_size: u32,
    stats: Arc<RwLock<ProcessorStats>>,
}

impl StreamProcessor {
    /// Create an idle processor.
    pub fn new(
        source: Arc<dyn EventSource>,
        detector: Arc<dyn FaceDetector>,
        settings: ProcessorSettings,
    ) -> Self {
        let max_in_flight = settings.max_in_flight.max(1);
        let backlog_size =
            u32::try_from(settings.max_pending.max(max_in_flight)).unwrap_or(u32::MAX);
        Self {
            source,
            detector,
            settings,
            observers: Vec::new(),
            session: Mutex::new(None),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            backlog: Arc::new(Semaphore::new(backlog_size as usize)),
            backlog_size,
            stats: Arc::new(RwLock::new(ProcessorStats::default())),
        }
    }

    /// Register an observer for the statistics of sessions started afterwards.
    pub fn with_observer(mut self, observer: Arc<dyn StatsObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.read().clone()
    }

    pub async fn state(&self) -> ProcessorState {
        if self.session.lock().await.is_some() {
            ProcessorState::Running
        } else {
            ProcessorState::Idle
        }
    }

    /// Statistics of the active session, if any.
    pub async fn statistics(&self) -> Option<Arc<RunningStatistics>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.statistics.clone())
    }

    /// Start a session filtered by `criterion`.
    ///
    /// An active session is torn down first, so there is never more than one
    /// subscription. The new session always starts with fresh statistics.
    pub async fn start(&self, criterion: &str) -> Result<Arc<RunningStatistics>, ProcessorError> {
        let mut active = self.session.lock().await;
        if let Some(previous) = active.take() {
            previous.shutdown();
        }

        let mut subscription = self.source.subscribe(criterion).await?;
        let (events, pictures) = match (subscription.take_events(), subscription.take_pictures()) {
            (Some(events), Some(pictures)) => (events, pictures),
            _ => {
                return Err(SourceError::SubscriptionFailed(
                    "subscription streams already taken".to_string(),
                )
                .into())
            }
        };

        let statistics = Arc::new(RunningStatistics::new(
            criterion,
            self.settings.result_capacity,
            self.observers.clone(),
        ));

        let token = subscription.cancellation_token();
        let enricher = Enricher {
            detector: self.detector.clone(),
            statistics: statistics.clone(),
            in_flight: self.in_flight.clone(),
            backlog: self.backlog.clone(),
            stats: self.stats.clone(),
        };

        let consumers = vec![
            tokio::spawn(count_events(events, statistics.clone(), token.clone())),
            tokio::spawn(analyse_pictures(pictures, enricher, token)),
        ];

        *active = Some(Session {
            subscription,
            statistics: statistics.clone(),
            consumers,
        });
        self.stats.write().sessions_started += 1;

        info!(criterion = %criterion, "Processing session started");
        Ok(statistics)
    }

    /// Stop the active session. Detection calls already in flight still
    /// complete into that session's statistics.
    pub async fn stop(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown();
        }
    }

    /// Finish the active session after its source has ended.
    ///
    /// Every post already buffered is counted and dispatched, then this
    /// waits for all pending detections. The source must be closed first,
    /// or this waits for as long as the source keeps delivering.
    pub async fn drain(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.drain().await;
        }
        self.wait_for_detections().await;
    }

    /// Wait until no detection is running or waiting to run.
    pub async fn wait_for_detections(&self) {
        // Holding every backlog slot means nothing is pending
        if let Ok(all) = self.backlog.acquire_many(self.backlog_size).await {
            drop(all);
        }
    }

    /// Replace the active session with one filtered by `criterion`.
    pub async fn update_filter(
        &self,
        criterion: &str,
    ) -> Result<Arc<RunningStatistics>, ProcessorError> {
        self.stop().await;
        self.start(criterion).await
    }
}

/// Count every delivered post.
async fn count_events(
    mut events: mpsc::Receiver<Arc<Post>>,
    statistics: Arc<RunningStatistics>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = events.recv() => match received {
                Some(_) => statistics.record_event(),
                None => break,
            },
        }
    }
    debug!(criterion = %statistics.criterion(), "Event counter stopped");
}

/// Dispatch face detection for every delivered post with a photo.
async fn analyse_pictures(
    mut pictures: mpsc::Receiver<Arc<Post>>,
    enricher: Enricher,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = pictures.recv() => match received {
                Some(post) => enricher.dispatch(&post),
                None => break,
            },
        }
    }
    debug!(criterion = %enricher.statistics.criterion(), "Picture analysis stopped");
}
