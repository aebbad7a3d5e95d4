//! FaceStream Processor - live post stream face statistics
//!
//! This library consumes a filtered stream of social media posts, sends every
//! attached photo to a face detection service and keeps running statistics:
//!
//! - Post rate per hour
//! - Male and female faces per hour
//! - The most recent per-picture results for live display
//!
//! # Architecture
//!
//! ```text
//!                       ┌────────────────┐   all posts    ┌──────────────────┐
//! Transport ──publish──▶│ EventSource    │───────────────▶│ count_events     │──┐
//!                       │ (subscription) │                └──────────────────┘  │
//!                       └────────────────┘  with photos   ┌──────────────────┐  ▼
//!                               └────────────────────────▶│ analyse_pictures │ RunningStatistics
//!                                                         └──────────────────┘  ▲   │
//!                                                                  │ spawn       │   ▼
//!                                                         ┌──────────────────┐  │  StatsObserver
//!                                                         │ FaceDetector     │──┘
//!                                                         └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use facestream_processor::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProcessorConfig::from_env()?;
//!     let source = Arc::new(BroadcastEventSource::new(config.source.channel_capacity));
//!     let detector = Arc::new(HttpFaceDetector::new(&config.enrichment)?);
//!
//!     let processor = StreamProcessor::new(source, detector, ProcessorSettings::from(&config));
//!     let statistics = processor.start(&config.source.filter).await?;
//!     println!("{:?}", statistics.snapshot());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod enrichment;
pub mod model;
pub mod observer;
pub mod processor;
pub mod result_store;
pub mod source;
pub mod statistics;

// Re-export main types
pub use crate::config::{ConfigValidationError, ProcessorConfig};
pub use crate::enrichment::{EnrichmentError, FaceDetector, HttpFaceDetector};
pub use crate::model::{
    classify_faces, Attachment, EnrichmentResult, FaceObservation, FaceTally, Gender, ModelError,
    Post,
};
pub use crate::observer::{
    BroadcastNotifier, FnObserver, NotifyError, StatsChange, StatsNotification, StatsObserver,
};
pub use crate::processor::{
    ProcessorError, ProcessorSettings, ProcessorState, ProcessorStats, StreamProcessor,
};
pub use crate::result_store::ResultStore;
pub use crate::source::{
    subscription_channel, BroadcastEventSource, EventSource, SourceError, Subscription,
    SubscriptionFeed,
};
pub use crate::statistics::{hourly_rate, RunningStatistics, StatisticsSnapshot};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ProcessorConfig;
    pub use crate::enrichment::{FaceDetector, HttpFaceDetector};
    pub use crate::model::Post;
    pub use crate::observer::{BroadcastNotifier, StatsObserver};
    pub use crate::processor::{ProcessorSettings, StreamProcessor};
    pub use crate::source::{BroadcastEventSource, EventSource};
    pub use crate::statistics::RunningStatistics;
}
