//! Latest-value fan-out for live snapshots.
//!
//! Every subscriber sees the current value immediately on subscribe and then
//! each later value. Slow subscribers that fall more than `capacity` values
//! behind skip straight to the newest one: snapshots supersede each other,
//! so nothing but latency is lost.
//!
//! Uses a tokio broadcast channel underneath; publishing never blocks on
//! subscribers.

use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};

/// Counters for monitoring feed health.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub published: u64,
    pub skipped: u64,
    pub subscribers: usize,
}

struct AtomicFeedStats {
    published: AtomicU64,
    skipped: AtomicU64,
}

struct FeedState<T> {
    /// `None` once the feed is closed.
    sender: Option<broadcast::Sender<Arc<T>>>,
    latest: Option<Arc<T>>,
}

struct FeedInner<T> {
    state: Mutex<FeedState<T>>,
    stats: AtomicFeedStats,
}

impl<T> FeedInner<T> {
    fn state(&self) -> MutexGuard<'_, FeedState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Publisher side. Cheap to clone; all clones share one channel.
pub struct Feed<T> {
    inner: Arc<FeedInner<T>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + Sync + 'static> Feed<T> {
    /// Empty feed: subscribers wait for the first `publish`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(FeedInner {
                state: Mutex::new(FeedState { sender: Some(sender), latest: None }),
                stats: AtomicFeedStats {
                    published: AtomicU64::new(0),
                    skipped: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Feed that already holds `value`.
    pub fn with_value(capacity: usize, value: T) -> Self {
        let feed = Self::new(capacity);
        feed.inner.state().latest = Some(Arc::new(value));
        feed
    }

    /// Replace the current value and push it to every subscriber.
    /// Returns the number of subscribers reached. No-op after `close`.
    pub fn publish(&self, value: T) -> usize {
        let value = Arc::new(value);
        let mut state = self.inner.state();
        let Some(sender) = state.sender.as_ref() else {
            return 0;
        };
        let reached = sender.send(value.clone()).unwrap_or(0);
        state.latest = Some(value);
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);
        reached
    }

    /// Register a subscriber. The current value (if any) is delivered first;
    /// registration and the read of the current value happen under one lock
    /// so no publish can fall between them.
    pub fn subscribe(&self) -> Subscription<T> {
        let state = self.inner.state();
        Subscription {
            pending: state.latest.clone(),
            receiver: state.sender.as_ref().map(|s| s.subscribe()),
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn latest(&self) -> Option<Arc<T>> {
        self.inner.state().latest.clone()
    }

    /// Close the feed. Subscribers drain what is buffered and then end.
    pub fn close(&self) {
        self.inner.state().sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().sender.is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .state()
            .sender
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            published: self.inner.stats.published.load(Ordering::Relaxed),
            skipped: self.inner.stats.skipped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Subscriber side. Dropping it unsubscribes.
pub struct Subscription<T> {
    pending: Option<Arc<T>>,
    receiver: Option<broadcast::Receiver<Arc<T>>>,
    inner: Weak<FeedInner<T>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    /// Next value, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<Arc<T>> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Feed subscriber lagged, skipping {} values", skipped);
                    let Some(inner) = self.inner.upgrade() else {
                        self.receiver = None;
                        return None;
                    };
                    inner.stats.skipped.fetch_add(skipped, Ordering::Relaxed);
                    let state = inner.state();
                    match state.sender.as_ref() {
                        Some(sender) => {
                            self.receiver = Some(sender.subscribe());
                            if let Some(latest) = state.latest.clone() {
                                return Some(latest);
                            }
                        }
                        // Closed while lagging: keep draining the old receiver.
                        None => continue,
                    }
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Explicit unsubscribe; equivalent to dropping.
    pub fn unsubscribe(self) {}

    /// Whether the subscription can still yield values.
    pub fn is_active(&self) -> bool {
        self.pending.is_some() || self.receiver.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_delivers_current_value_first() {
        let feed = Feed::with_value(8, 1u32);
        let mut sub = feed.subscribe();
        assert_eq!(*sub.next().await.unwrap(), 1);

        feed.publish(2);
        assert_eq!(*sub.next().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_feed_waits_for_first_publish() {
        let feed: Feed<u32> = Feed::new(8);
        let mut sub = feed.subscribe();

        let waited = tokio::time::timeout(Duration::from_millis(20), sub.next()).await;
        assert!(waited.is_err());

        feed.publish(7);
        assert_eq!(*sub.next().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let feed = Feed::new(8);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        let mut c = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 3);

        assert_eq!(feed.publish("x"), 3);
        assert_eq!(*a.next().await.unwrap(), "x");
        assert_eq!(*b.next().await.unwrap(), "x");
        assert_eq!(*c.next().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_to_latest() {
        let feed = Feed::new(2);
        let mut sub = feed.subscribe();
        for i in 0..10u32 {
            feed.publish(i);
        }
        assert_eq!(*sub.next().await.unwrap(), 9);
        assert!(feed.stats().skipped > 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let feed = Feed::with_value(8, 0u8);
        let mut sub = feed.subscribe();
        assert_eq!(*sub.next().await.unwrap(), 0);

        feed.publish(1);
        feed.close();
        assert_eq!(*sub.next().await.unwrap(), 1);
        assert!(sub.next().await.is_none());
        assert!(!sub.is_active());

        assert_eq!(feed.publish(2), 0);
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_receiver() {
        let feed: Feed<u8> = Feed::new(8);
        let sub = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_feed_stats() {
        let feed = Feed::new(8);
        let _sub = feed.subscribe();
        feed.publish(1u8);
        feed.publish(2u8);

        let stats = feed.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(feed.latest().as_deref(), Some(&2));
    }
}
