//! Bounded latest-wins output feed.
//!
//! A newer item for a key replaces its unconsumed predecessor in place, so a
//! slow consumer always sees the freshest state per entity and per-key order
//! is preserved. When the feed is full the oldest pending entry is dropped.

use crate::{EnvError, SnapshotSink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Counters describing feed behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    /// Items handed to `publish`
    pub published: u64,
    /// Items that replaced an unconsumed predecessor for the same key
    pub coalesced: u64,
    /// Items evicted because the feed was full
    pub dropped: u64,
}

struct FeedState<T> {
    pending: VecDeque<(String, T)>,
    stats: FeedStats,
    closed: bool,
}

struct FeedInner<T> {
    capacity: usize,
    state: Mutex<FeedState<T>>,
    notify: Notify,
}

/// Bounded, coalescing, multi-producer feed.
///
/// Cloning yields another handle to the same feed.
pub struct LatestWinsFeed<T> {
    inner: Arc<FeedInner<T>>,
}

impl<T> Clone for LatestWinsFeed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> LatestWinsFeed<T> {
    /// Creates a feed holding at most `capacity` pending entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                capacity: capacity.max(1),
                state: Mutex::new(FeedState {
                    pending: VecDeque::new(),
                    stats: FeedStats::default(),
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of entries waiting for a consumer.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FeedStats {
        self.inner.state.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Pushes an item, coalescing with a pending item of the same key.
    pub fn push(&self, key: &str, item: T) -> Result<(), EnvError> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(EnvError::FeedClosed);
            }
            state.stats.published += 1;

            if let Some(slot) = state.pending.iter_mut().find(|(k, _)| k == key) {
                slot.1 = item;
                state.stats.coalesced += 1;
            } else {
                if state.pending.len() >= self.inner.capacity {
                    state.pending.pop_front();
                    state.stats.dropped += 1;
                }
                state.pending.push_back((key.to_string(), item));
            }
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Takes the oldest pending entry without waiting.
    pub fn try_recv(&self) -> Option<(String, T)> {
        self.inner.state.lock().pending.pop_front()
    }

    /// Takes every pending entry in order.
    pub fn drain(&self) -> Vec<(String, T)> {
        self.inner.state.lock().pending.drain(..).collect()
    }

    /// Waits for the next entry.
    ///
    /// Returns `None` once the feed is closed and empty.
    pub async fn recv(&self) -> Option<(String, T)> {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if let Some(entry) = state.pending.pop_front() {
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the feed; pending entries remain readable.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.notify.notify_waiters();
    }
}

impl<T: Send> SnapshotSink<T> for LatestWinsFeed<T> {
    fn publish(&self, key: &str, item: T) -> Result<(), EnvError> {
        self.push(key, item)
    }

    fn close(&self) {
        LatestWinsFeed::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_coalesces_same_key_in_place() {
        let feed = LatestWinsFeed::new(4);
        feed.push("a", 1).unwrap();
        feed.push("b", 2).unwrap();
        feed.push("a", 3).unwrap();

        assert_eq!(feed.len(), 2);
        assert_eq!(feed.try_recv(), Some(("a".to_string(), 3)));
        assert_eq!(feed.try_recv(), Some(("b".to_string(), 2)));
        assert_eq!(feed.stats().coalesced, 1);
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let feed = LatestWinsFeed::new(2);
        feed.push("a", 1).unwrap();
        feed.push("b", 2).unwrap();
        feed.push("c", 3).unwrap();

        let keys: Vec<String> = feed.drain().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(
            feed.stats(),
            FeedStats {
                published: 3,
                coalesced: 0,
                dropped: 1
            }
        );
    }

    #[test]
    fn test_push_after_close_fails() {
        let feed = LatestWinsFeed::new(2);
        feed.push("a", 1).unwrap();
        feed.close();
        assert!(matches!(feed.push("b", 2), Err(EnvError::FeedClosed)));
        assert_eq!(feed.try_recv(), Some(("a".to_string(), 1)));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let feed = LatestWinsFeed::new(8);
        let producer = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push("x", 42).unwrap();
        });

        let got = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(("x".to_string(), 42)));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let feed: LatestWinsFeed<u32> = LatestWinsFeed::new(8);
        let closer = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        let got = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap();
        assert_eq!(got, None);
    }
}
