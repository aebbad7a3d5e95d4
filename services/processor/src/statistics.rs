//! Running statistics for one processing session.
//!
//! Counters are plain atomics. The hourly rates derived from them are
//! recomputed and published under a single lock so a rate is never computed
//! from a counter value another completion is halfway through publishing.

use crate::model::{EnrichmentResult, FaceTally};
use crate::observer::{StatsChange, StatsNotification, StatsObserver};
use crate::result_store::ResultStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const SECS_PER_HOUR: f64 = 3600.0;

/// Displayed "per hour" rate for `count` observations after `elapsed`.
///
/// During the first hour the raw count is shown; afterwards the count is
/// normalized by the elapsed hours.
pub fn hourly_rate(count: u64, elapsed: Duration) -> f64 {
    let hours = elapsed.as_secs_f64() / SECS_PER_HOUR;
    if hours > 1.0 {
        count as f64 / hours
    } else {
        count as f64
    }
}

/// Monotonic timer started when a session starts.
#[derive(Debug, Clone, Copy)]
pub struct RunTimer {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl RunTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock time the timer was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Rates {
    events_per_hour: f64,
    male_faces_per_hour: f64,
    female_faces_per_hour: f64,
}

/// Point-in-time view of a session's statistics for display or export.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub criterion: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: u64,
    pub event_count: u64,
    pub events_per_hour: f64,
    pub male_face_count: u64,
    pub male_faces_per_hour: f64,
    pub female_face_count: u64,
    pub female_faces_per_hour: f64,
    pub results: Vec<EnrichmentResult>,
}

/// Aggregates for one session: counters, hourly rates and recent results.
///
/// A new instance is created for every session; instances are never reset.
pub struct RunningStatistics {
    criterion: String,
    timer: RunTimer,
    event_count: AtomicU64,
    male_face_count: AtomicU64,
    female_face_count: AtomicU64,
    rates: Mutex<Rates>,
    results: ResultStore,
    observers: Vec<Arc<dyn StatsObserver>>,
}

impl RunningStatistics {
    /// Create statistics for a session filtered by `criterion` and start its
    /// run-timer.
    pub fn new(
        criterion: impl Into<String>,
        result_capacity: usize,
        observers: Vec<Arc<dyn StatsObserver>>,
    ) -> Self {
        Self {
            criterion: criterion.into(),
            timer: RunTimer::start(),
            event_count: AtomicU64::new(0),
            male_face_count: AtomicU64::new(0),
            female_face_count: AtomicU64::new(0),
            rates: Mutex::new(Rates::default()),
            results: ResultStore::new(result_capacity),
            observers,
        }
    }

    pub fn criterion(&self) -> &str {
        &self.criterion
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::SeqCst)
    }

    pub fn male_face_count(&self) -> u64 {
        self.male_face_count.load(Ordering::SeqCst)
    }

    pub fn female_face_count(&self) -> u64 {
        self.female_face_count.load(Ordering::SeqCst)
    }

    pub fn events_per_hour(&self) -> f64 {
        self.rates.lock().events_per_hour
    }

    pub fn male_faces_per_hour(&self) -> f64 {
        self.rates.lock().male_faces_per_hour
    }

    pub fn female_faces_per_hour(&self) -> f64 {
        self.rates.lock().female_faces_per_hour
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Count one incoming post and republish the event rate.
    pub fn record_event(&self) {
        self.event_count.fetch_add(1, Ordering::SeqCst);
        self.notify(StatsChange::EventCount);

        {
            let mut rates = self.rates.lock();
            rates.events_per_hour = hourly_rate(self.event_count(), self.timer.elapsed());
        }
        self.notify(StatsChange::EventRate);
    }

    /// Add classified faces to the male/female counters.
    ///
    /// A category whose increment is zero is left untouched and takes no lock.
    pub fn record_faces(&self, tally: &FaceTally) {
        if tally.male > 0 {
            self.male_face_count
                .fetch_add(tally.male as u64, Ordering::SeqCst);
            {
                let mut rates = self.rates.lock();
                rates.male_faces_per_hour =
                    hourly_rate(self.male_face_count(), self.timer.elapsed());
            }
            self.notify(StatsChange::MaleFaceRate);
        }

        if tally.female > 0 {
            self.female_face_count
                .fetch_add(tally.female as u64, Ordering::SeqCst);
            {
                let mut rates = self.rates.lock();
                rates.female_faces_per_hour =
                    hourly_rate(self.female_face_count(), self.timer.elapsed());
            }
            self.notify(StatsChange::FemaleFaceRate);
        }
    }

    /// Store a per-picture result in the rolling buffer.
    pub fn record_result(&self, result: EnrichmentResult) {
        let evicted = self.results.push(result);
        if evicted > 0 {
            debug!(criterion = %self.criterion, evicted, "Evicted oldest results");
        }
        self.notify(StatsChange::ResultAdded);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let rates = *self.rates.lock();
        StatisticsSnapshot {
            criterion: self.criterion.clone(),
            started_at: self.timer.started_at(),
            elapsed_secs: self.timer.elapsed().as_secs(),
            event_count: self.event_count(),
            events_per_hour: rates.events_per_hour,
            male_face_count: self.male_face_count(),
            male_faces_per_hour: rates.male_faces_per_hour,
            female_face_count: self.female_face_count(),
            female_faces_per_hour: rates.female_faces_per_hour,
            results: self.results.snapshot(),
        }
    }

    fn notify(&self, change: StatsChange) {
        if self.observers.is_empty() {
            return;
        }

        let notification = StatsNotification {
            criterion: self.criterion.clone(),
            change,
        };
        for observer in &self.observers {
            if let Err(e) = observer.statistics_changed(&notification) {
                debug!(
                    criterion = %self.criterion,
                    change = ?change,
                    error = %e,
                    "Statistics notification dropped"
                );
            }
        }
    }
}

impl std::fmt::Debug for RunningStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningStatistics")
            .field("criterion", &self.criterion)
            .field("event_count", &self.event_count())
            .field("male_face_count", &self.male_face_count())
            .field("female_face_count", &self.female_face_count())
            .field("results", &self.results.len())
            .finish()
    }
}
