use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::chain::feed::{ChainFeed, FeedConnector};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::FeedMode;

/// Outcome of one liveness read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedHealth {
    Streaming,
    /// The polling fallback answers; streaming should be retried.
    Degraded,
    Down,
}

/// Owns the chain feed connection. Every consumer asks for [`ConnectionManager::current`]
/// at use time, so a reconnect is picked up without re-wiring anything.
pub struct ConnectionManager {
    connector: Arc<dyn FeedConnector>,
    retry: RetryPolicy,
    feed: RwLock<Arc<dyn ChainFeed>>,
    /// Unix seconds of the last successful liveness read (0 = never).
    last_healthy_at: AtomicU64,
}

impl ConnectionManager {
    /// Establish the first connection. Fails only if neither a streaming nor a
    /// polling feed can be verified.
    pub async fn connect(connector: Arc<dyn FeedConnector>, retry: RetryPolicy) -> Result<Self> {
        let feed = establish(connector.as_ref(), &retry).await?;
        Ok(Self {
            connector,
            retry,
            feed: RwLock::new(feed),
            last_healthy_at: AtomicU64::new(now_secs()),
        })
    }

    pub fn current(&self) -> Arc<dyn ChainFeed> {
        self.feed.read().clone()
    }

    pub fn mode(&self) -> FeedMode {
        self.feed.read().mode()
    }

    pub fn last_healthy_at(&self) -> u64 {
        self.last_healthy_at.load(Ordering::Relaxed)
    }

    /// Cheap liveness read on the current feed.
    pub async fn check_health(&self) -> FeedHealth {
        let feed = self.current();
        match feed.block_number().await {
            Ok(block) => {
                self.last_healthy_at.store(now_secs(), Ordering::Relaxed);
                match feed.mode() {
                    FeedMode::Streaming => {
                        debug!(block, "feed healthy");
                        FeedHealth::Streaming
                    }
                    FeedMode::Polling => {
                        warn!(block, "feed reachable but degraded to polling");
                        FeedHealth::Degraded
                    }
                }
            }
            Err(e) => {
                warn!("feed health check failed: {e}");
                FeedHealth::Down
            }
        }
    }

    /// One streaming attempt, verified but not installed. The current feed
    /// keeps serving until the caller swaps it in with [`ConnectionManager::install`].
    pub async fn try_streaming(&self) -> Option<Arc<dyn ChainFeed>> {
        match verify_streaming(self.connector.as_ref()).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                debug!("streaming still unavailable: {e}");
                None
            }
        }
    }

    /// Replace the current feed with a freshly established one.
    pub async fn reconnect(&self) -> Result<Arc<dyn ChainFeed>> {
        let feed = establish(self.connector.as_ref(), &self.retry).await?;
        self.install(feed.clone());
        Ok(feed)
    }

    pub fn install(&self, feed: Arc<dyn ChainFeed>) {
        *self.feed.write() = feed;
        self.last_healthy_at.store(now_secs(), Ordering::Relaxed);
    }
}

async fn verify_streaming(connector: &dyn FeedConnector) -> Result<Arc<dyn ChainFeed>> {
    let feed = connector.connect_streaming().await?;
    let block = feed.block_number().await?;
    info!(block, "streaming feed connected");
    Ok(feed)
}

/// Streaming with bounded retries, then a degraded polling feed.
async fn establish(connector: &dyn FeedConnector, retry: &RetryPolicy) -> Result<Arc<dyn ChainFeed>> {
    let streaming = retry
        .run("feed connect", || verify_streaming(connector))
        .await;

    match streaming {
        Ok(feed) => Ok(feed),
        Err(e) => {
            error!(
                attempts = retry.max_attempts(),
                "streaming feed unavailable: {e}; falling back to polling"
            );
            let feed = connector.connect_polling().await?;
            let block = feed.block_number().await?;
            warn!(block, "DEGRADED: log subscriptions are being polled over HTTP");
            Ok(feed)
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::fake::{addr, FakeChain, FakeConnector};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::ZERO)
    }

    #[tokio::test]
    async fn connects_streaming_on_first_try() {
        let chain = FakeChain::new(addr(0xfa));
        let connector = FakeConnector::new(chain);
        let manager = ConnectionManager::connect(connector.clone(), policy()).await.unwrap();
        assert_eq!(manager.mode(), FeedMode::Streaming);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.check_health().await, FeedHealth::Streaming);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let chain = FakeChain::new(addr(0xfa));
        let connector = FakeConnector::new(chain);
        connector.fail_streaming.store(2, Ordering::SeqCst);
        let manager = ConnectionManager::connect(connector.clone(), policy()).await.unwrap();
        assert_eq!(manager.mode(), FeedMode::Streaming);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn falls_back_to_polling_after_exhausting_attempts() {
        let chain = FakeChain::new(addr(0xfa));
        let connector = FakeConnector::new(chain);
        connector.fail_streaming.store(10, Ordering::SeqCst);
        let manager = ConnectionManager::connect(connector.clone(), policy()).await.unwrap();
        assert_eq!(manager.mode(), FeedMode::Polling);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(manager.check_health().await, FeedHealth::Degraded);
    }

    #[tokio::test]
    async fn streaming_attempt_does_not_replace_polling_feed() {
        let chain = FakeChain::new(addr(0xfa));
        let connector = FakeConnector::new(chain);
        connector.fail_streaming.store(10, Ordering::SeqCst);
        let manager = ConnectionManager::connect(connector.clone(), policy()).await.unwrap();

        assert!(manager.try_streaming().await.is_none());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
        assert_eq!(manager.mode(), FeedMode::Polling);

        connector.fail_streaming.store(0, Ordering::SeqCst);
        let feed = manager.try_streaming().await.unwrap();
        assert_eq!(manager.mode(), FeedMode::Polling);
        manager.install(feed);
        assert_eq!(manager.check_health().await, FeedHealth::Streaming);
    }

    #[tokio::test]
    async fn reconnect_swaps_feed() {
        let chain = FakeChain::new(addr(0xfa));
        let connector = FakeConnector::new(chain.clone());
        connector.fail_streaming.store(10, Ordering::SeqCst);
        let manager = ConnectionManager::connect(connector.clone(), policy()).await.unwrap();

        connector.fail_streaming.store(0, Ordering::SeqCst);
        chain.set_healthy(false);
        assert_eq!(manager.check_health().await, FeedHealth::Down);

        manager.reconnect().await.unwrap();
        assert_eq!(manager.mode(), FeedMode::Streaming);
        assert_eq!(manager.check_health().await, FeedHealth::Streaming);
    }
}
