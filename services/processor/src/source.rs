//! Event source abstraction and an in-process implementation.
//!
//! A transport (streaming API client, stdin reader, test) publishes posts
//! into a [`BroadcastEventSource`]. Every open subscription whose criterion
//! matches gets the post on its bounded "all events" stream, and on its
//! "events with pictures" stream when the post carries a photo. Publishing
//! waits for buffer space, so a slow consumer slows the transport down
//! instead of losing posts.

use crate::model::Post;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors that can occur while subscribing to an event source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Event source closed")]
    Closed,
}

/// A live source of posts that can be subscribed to with a filter criterion.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, criterion: &str) -> Result<Subscription, SourceError>;
}

/// Create a connected subscription handle and its producer side.
///
/// Both streams exist before the handle is returned, so nothing fed into
/// the [`SubscriptionFeed`] is lost waiting for a consumer to attach.
pub fn subscription_channel(
    criterion: impl Into<String>,
    capacity: usize,
) -> (SubscriptionFeed, Subscription) {
    let criterion = criterion.into();
    let capacity = capacity.max(1);
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let (pictures_tx, pictures_rx) = mpsc::channel(capacity);
    let cancel = CancellationToken::new();

    let feed = SubscriptionFeed {
        criterion: criterion.clone(),
        events: events_tx,
        pictures: pictures_tx,
        cancel: cancel.clone(),
    };
    let subscription = Subscription {
        criterion,
        events: Some(events_rx),
        pictures: Some(pictures_rx),
        cancel,
    };
    (feed, subscription)
}

/// Handle to one filtered subscription.
///
/// Dropping or disposing the handle stops delivery. Each stream can be taken
/// once; it ends when the producer side goes away.
pub struct Subscription {
    criterion: String,
    events: Option<mpsc::Receiver<Arc<Post>>>,
    pictures: Option<mpsc::Receiver<Arc<Post>>>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Stream of every post delivered to this subscription.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Arc<Post>>> {
        self.events.take()
    }

    /// Stream of delivered posts carrying at least one photo.
    pub fn take_pictures(&mut self) -> Option<mpsc::Receiver<Arc<Post>>> {
        self.pictures.take()
    }

    /// Token cancelled once the subscription is disposed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop delivery. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        info!(criterion = %self.criterion, "Subscription disposed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer side of a [`Subscription`], held by the source.
#[derive(Clone)]
pub struct SubscriptionFeed {
    criterion: String,
    events: mpsc::Sender<Arc<Post>>,
    pictures: mpsc::Sender<Arc<Post>>,
    cancel: CancellationToken,
}

impl SubscriptionFeed {
    pub fn criterion(&self) -> &str {
        &self.criterion
    }

    /// Deliver a post, waiting while the subscription's buffers are full.
    ///
    /// Returns false once the subscription is disposed or its consumers are
    /// gone.
    pub async fn publish(&self, post: Arc<Post>) -> bool {
        let with_photo = post.has_photo();
        if !self.send(&self.events, post.clone()).await {
            return false;
        }
        if with_photo {
            return self.send(&self.pictures, post).await;
        }
        true
    }

    async fn send(&self, sender: &mpsc::Sender<Arc<Post>>, post: Arc<Post>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = sender.send(post) => sent.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }
}

/// Statistics for the in-process source.
#[derive(Debug, Default, Clone)]
pub struct SourceStats {
    pub posts_published: u64,
    pub posts_delivered: u64,
    pub subscriptions_opened: u64,
}

/// In-process event source fed by a transport through [`publish`].
///
/// [`publish`]: BroadcastEventSource::publish
pub struct BroadcastEventSource {
    subscribers: Mutex<Vec<SubscriptionFeed>>,
    capacity: usize,
    shutdown: CancellationToken,
    stats: Arc<RwLock<SourceStats>>,
}

impl BroadcastEventSource {
    /// Create a source whose subscription streams buffer up to `capacity` posts.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            shutdown: CancellationToken::new(),
            stats: Arc::new(RwLock::new(SourceStats::default())),
        }
    }

    /// Publish a post to every open subscription whose criterion it matches.
    ///
    /// Waits while a matching subscription's buffer is full. Returns the
    /// number of subscriptions the post was delivered to.
    pub async fn publish(&self, post: Post) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        self.stats.write().posts_published += 1;

        let feeds: Vec<SubscriptionFeed> = self
            .subscribers
            .lock()
            .iter()
            .filter(|feed| post.matches(feed.criterion()))
            .cloned()
            .collect();
        if feeds.is_empty() {
            return 0;
        }

        let post = Arc::new(post);
        let mut delivered = 0;
        let mut stale = false;
        for feed in &feeds {
            if feed.publish(post.clone()).await {
                delivered += 1;
            } else {
                stale = true;
            }
        }

        if stale {
            self.subscribers.lock().retain(|feed| !feed.is_closed());
            debug!("Pruned closed subscriptions");
        }
        self.stats.write().posts_delivered += delivered as u64;
        delivered
    }

    /// Stop the source. Open subscriptions see their streams end once the
    /// posts already buffered are consumed; new subscriptions are refused.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing event source");
            self.shutdown.cancel();
            self.subscribers.lock().clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.read().clone()
    }
}

impl Default for BroadcastEventSource {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSource for BroadcastEventSource {
    async fn subscribe(&self, criterion: &str) -> Result<Subscription, SourceError> {
        let (feed, subscription) = subscription_channel(criterion, self.capacity);
        {
            let mut subscribers = self.subscribers.lock();
            // Checked under the lock so close() cannot miss this feed
            if self.shutdown.is_cancelled() {
                return Err(SourceError::Closed);
            }
            subscribers.retain(|feed| !feed.is_closed());
            subscribers.push(feed);
        }

        self.stats.write().subscriptions_opened += 1;
        info!(criterion = %criterion, "Subscribed to event source");

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Attachment;
    use std::time::Duration;

    fn post(id: &str, text: &str, media_type: Option<&str>) -> Post {
        Post {
            id: id.to_string(),
            text: text.to_string(),
            media: media_type
                .map(|t| {
                    vec![Attachment {
                        media_type: t.to_string(),
                        url: format!("https://pbs.example.com/{id}.jpg"),
                    }]
                })
                .unwrap_or_default(),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<Post>>) -> Option<Arc<Post>> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("stream should yield within timeout")
    }

    #[tokio::test]
    async fn test_subscription_filters_by_criterion() {
        let source = BroadcastEventSource::default();
        let mut subscription = source.subscribe("#FashionFace").await.unwrap();
        let mut events = subscription.take_events().unwrap();

        assert_eq!(source.publish(post("1", "nothing to see", None)).await, 0);
        assert_eq!(source.publish(post("2", "new look #fashionface", None)).await, 1);

        assert_eq!(recv(&mut events).await.unwrap().id, "2");
        let stats = source.stats();
        assert_eq!(stats.posts_published, 2);
        assert_eq!(stats.posts_delivered, 1);
    }

    #[tokio::test]
    async fn test_picture_stream_only_carries_photos() {
        let source = BroadcastEventSource::default();
        let mut subscription = source.subscribe("").await.unwrap();
        let mut events = subscription.take_events().unwrap();
        let mut pictures = subscription.take_pictures().unwrap();

        source.publish(post("1", "", None)).await;
        source.publish(post("2", "", Some("video"))).await;
        source.publish(post("3", "", Some("photo"))).await;
        source.close();

        assert_eq!(recv(&mut pictures).await.unwrap().id, "3");
        assert!(recv(&mut pictures).await.is_none());

        for expected in ["1", "2", "3"] {
            assert_eq!(recv(&mut events).await.unwrap().id, expected);
        }
        assert!(recv(&mut events).await.is_none());
    }

    #[tokio::test]
    async fn test_streams_can_be_taken_once() {
        let source = BroadcastEventSource::default();
        let mut subscription = source.subscribe("").await.unwrap();

        assert!(subscription.take_events().is_some());
        assert!(subscription.take_events().is_none());
        assert!(subscription.take_pictures().is_some());
        assert!(subscription.take_pictures().is_none());
    }

    #[tokio::test]
    async fn test_posts_published_before_consumers_attach_are_kept() {
        let source = BroadcastEventSource::default();
        let mut subscription = source.subscribe("").await.unwrap();

        source.publish(post("1", "", Some("photo"))).await;

        let mut events = subscription.take_events().unwrap();
        let mut pictures = subscription.take_pictures().unwrap();
        assert_eq!(recv(&mut events).await.unwrap().id, "1");
        assert_eq!(recv(&mut pictures).await.unwrap().id, "1");
    }

    #[tokio::test]
    async fn test_publish_waits_for_buffer_space() {
        let source = Arc::new(BroadcastEventSource::new(2));
        let mut subscription = source.subscribe("").await.unwrap();
        let mut events = subscription.take_events().unwrap();

        let publisher = tokio::spawn({
            let source = source.clone();
            async move {
                for n in 0..50 {
                    source.publish(post(&n.to_string(), "", None)).await;
                }
                source.close();
            }
        });

        let mut received = Vec::new();
        while let Some(post) = recv(&mut events).await {
            received.push(post.id.clone());
        }
        publisher.await.unwrap();

        let expected: Vec<String> = (0..50).map(|n| n.to_string()).collect();
        assert_eq!(received, expected);
        assert_eq!(source.stats().posts_delivered, 50);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_stops_delivery() {
        let source = BroadcastEventSource::new(1);
        let subscription = source.subscribe("").await.unwrap();
        let token = subscription.cancellation_token();

        source.publish(post("1", "", None)).await;
        subscription.dispose();
        subscription.dispose();

        assert!(token.is_cancelled());
        // Buffer is full, but a disposed subscription never blocks the source
        let delivered = tokio::time::timeout(
            Duration::from_secs(2),
            source.publish(post("2", "", None)),
        )
        .await
        .expect("publish should not block on a disposed subscription");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_closed_source_refuses_subscriptions() {
        let source = BroadcastEventSource::default();
        let mut subscription = source.subscribe("").await.unwrap();
        let mut events = subscription.take_events().unwrap();

        source.close();

        assert!(matches!(
            source.subscribe("").await,
            Err(SourceError::Closed)
        ));
        assert!(recv(&mut events).await.is_none());
        assert_eq!(source.publish(post("1", "", None)).await, 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let source = BroadcastEventSource::new(1);
        let subscription = source.subscribe("").await.unwrap();

        drop(subscription);

        assert_eq!(source.publish(post("1", "", None)).await, 0);
        assert!(source.subscribers.lock().is_empty());
    }
}
