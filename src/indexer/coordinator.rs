//! Owns the indexing lifecycle: backfill, the factory listener, the health
//! probe that drives connection resets, and the stale-listener sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use futures_util::StreamExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::latency::LatencyStats;
use crate::chain::abi::decode_market_created;
use crate::chain::connection::{ConnectionManager, FeedHealth};
use crate::chain::contracts::Contracts;
use crate::chain::feed::{ChainFeed, LogStream};
use crate::config::STALE_MARKET_AGE_SECS;
use crate::db::store::Store;
use crate::error::Result;
use crate::indexer::metadata::MetadataIndexer;
use crate::indexer::pipeline::EventPipeline;
use crate::state::subscriptions::SubscriptionRegistry;
use crate::types::MarketCreatedEvent;

pub struct Indexer {
    connection: Arc<ConnectionManager>,
    contracts: watch::Sender<Contracts>,
    metadata: MetadataIndexer,
    registry: Arc<SubscriptionRegistry>,
    factory: Address,
    health_tx: mpsc::Sender<()>,
    health_rx: Mutex<mpsc::Receiver<()>>,
    /// Held for the duration of a reset; a request that finds it taken is absorbed.
    reset_lock: Mutex<()>,
    /// Set while some listener could not be rebuilt; forces the next probe
    /// to reset even if the feed answers.
    reset_incomplete: AtomicBool,
    factory_listener: SyncMutex<Option<AbortHandle>>,
}

impl Indexer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        store: Store,
        factory: Address,
        latency: Arc<LatencyStats>,
    ) -> Arc<Self> {
        let (contracts, contracts_rx) = watch::channel(Contracts::bind(connection.current(), factory));
        let (health_tx, health_rx) = mpsc::channel(1);
        let metadata = MetadataIndexer::new(store);
        let pipeline = EventPipeline::new(metadata.clone(), contracts_rx, health_tx.clone(), latency);

        Arc::new(Self {
            connection,
            contracts,
            metadata,
            registry: SubscriptionRegistry::new(pipeline),
            factory,
            health_tx,
            health_rx: Mutex::new(health_rx),
            reset_lock: Mutex::new(()),
            reset_incomplete: AtomicBool::new(false),
            factory_listener: SyncMutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    fn contracts(&self) -> Contracts {
        self.contracts.borrow().clone()
    }

    /// Startup: listen for new markets, then backfill everything the factory knows.
    pub async fn start(&self) -> Result<usize> {
        self.start_factory_listener(&self.contracts()).await?;
        self.backfill().await
    }

    // -----------------------------------------------------------------------
    // Backfill
    // -----------------------------------------------------------------------

    /// Rebuild `markets` and the subscription set from the factory's market
    /// list. Safe to repeat. A market whose listeners cannot be opened is
    /// skipped and left for the next health probe to retry.
    pub async fn backfill(&self) -> Result<usize> {
        let (markets, failed) = self.backfill_with(&self.contracts()).await?;
        if failed > 0 {
            self.reset_incomplete.store(true, Ordering::SeqCst);
        }
        Ok(markets)
    }

    /// Returns the market count and how many subscriptions failed.
    async fn backfill_with(&self, contracts: &Contracts) -> Result<(usize, usize)> {
        let markets = self.metadata.market_addresses(contracts).await?;
        self.metadata.refresh_batch(contracts, &markets).await?;
        let (created, failed) = self.subscribe_all(contracts, &markets).await;

        info!(
            markets = markets.len(),
            new_subscriptions = created,
            failed,
            active = self.registry.len(),
            "backfill complete"
        );
        Ok((markets.len(), failed))
    }

    /// Try every market, even after a failure. Returns (created, failed).
    async fn subscribe_all(&self, contracts: &Contracts, markets: &[Address]) -> (usize, usize) {
        let mut created = 0usize;
        let mut failed = 0usize;
        for &market in markets {
            match self.registry.ensure_subscribed(contracts, market).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(market = %market, "listeners not attached: {e}");
                    failed += 1;
                }
            }
        }
        (created, failed)
    }

    // -----------------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------------

    /// Full reset: tear down, reconnect, rebind, resubscribe, backfill.
    /// Returns `false` if another reset was already running.
    pub async fn reset(&self) -> Result<bool> {
        self.reset_onto(None).await
    }

    /// Reset, installing `ready` as the new feed instead of reconnecting.
    async fn reset_onto(&self, ready: Option<Arc<dyn ChainFeed>>) -> Result<bool> {
        let Ok(_guard) = self.reset_lock.try_lock() else {
            debug!("reset already in flight");
            return Ok(false);
        };

        // Cleared only once every step below has succeeded.
        self.reset_incomplete.store(true, Ordering::SeqCst);
        warn!(active = self.registry.len(), "resetting chain connection");
        let previous = self.registry.reset_all();
        self.stop_factory_listener();

        let feed = match ready {
            Some(feed) => {
                self.connection.install(feed.clone());
                feed
            }
            None => self.connection.reconnect().await?,
        };
        self.contracts.send_replace(Contracts::bind(feed, self.factory));
        let contracts = self.contracts();

        // Failures here are retried by the backfill below, which counts them.
        self.subscribe_all(&contracts, &previous).await;
        let mut failed = 0usize;
        if let Err(e) = self.start_factory_listener(&contracts).await {
            warn!("factory listener not restarted: {e}");
            failed += 1;
        }

        let (markets, backfill_failed) = self.backfill_with(&contracts).await?;
        failed += backfill_failed;
        if failed > 0 {
            warn!(failed, "reset incomplete; retrying on next health check");
        } else {
            self.reset_incomplete.store(false, Ordering::SeqCst);
        }

        info!(
            resubscribed = previous.len(),
            markets,
            failed,
            mode = %self.connection.mode(),
            "reset complete"
        );
        Ok(true)
    }

    /// Probe the feed and recover it if needed. A polling feed that still
    /// answers keeps serving until a streaming feed has been verified.
    pub async fn check_and_recover(&self) {
        let pending = self.reset_incomplete.load(Ordering::SeqCst);
        let ready = match self.connection.check_health().await {
            FeedHealth::Streaming if !pending => return,
            FeedHealth::Degraded if !pending => match self.connection.try_streaming().await {
                Some(feed) => {
                    info!("streaming available again; leaving polling mode");
                    Some(feed)
                }
                None => return,
            },
            _ => None,
        };
        if let Err(e) = self.reset_onto(ready).await {
            error!("reset failed: {e}; retrying on next health check");
        }
    }

    /// Periodic probe, plus on-demand probes requested by event handlers.
    pub async fn run_health_probe(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        ticker.tick().await; // first tick is immediate; startup just connected
        let mut requests = self.health_rx.lock().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = requests.recv() => debug!("health check requested"),
            }
            self.check_and_recover().await;
        }
    }

    // -----------------------------------------------------------------------
    // Factory listener
    // -----------------------------------------------------------------------

    async fn start_factory_listener(&self, contracts: &Contracts) -> Result<()> {
        let logs = contracts.feed().watch_logs(contracts.market_created_query()).await?;
        let task = tokio::spawn(watch_factory(
            logs,
            contracts.clone(),
            self.metadata.clone(),
            self.registry.clone(),
            self.health_tx.clone(),
        ));
        if let Some(old) = self.factory_listener.lock().replace(task.abort_handle()) {
            old.abort();
        }
        Ok(())
    }

    fn stop_factory_listener(&self) {
        if let Some(task) = self.factory_listener.lock().take() {
            task.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(now_secs()).await
    }

    /// Unsubscribe markets that are resolved or whose resolution date is
    /// more than [`STALE_MARKET_AGE_SECS`] before `now`.
    pub async fn sweep_at(&self, now: u64) -> Result<usize> {
        let cutoff = i64::try_from(now.saturating_sub(STALE_MARKET_AGE_SECS)).unwrap_or(i64::MAX);
        let stale = self.metadata.store().stale_market_addresses(cutoff).await?;

        let mut removed = 0usize;
        for address in &stale {
            match address.parse::<Address>() {
                Ok(market) if self.registry.unsubscribe(&market) => removed += 1,
                Ok(_) => {}
                Err(e) => warn!(address = %address, "stored market address does not parse: {e}"),
            }
        }

        info!(candidates = stale.len(), removed, active = self.registry.len(), "stale listener sweep complete");
        Ok(removed)
    }

    pub async fn run_sweep(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!("listener sweep failed: {e}");
            }
        }
    }
}

async fn watch_factory(
    mut logs: LogStream,
    contracts: Contracts,
    metadata: MetadataIndexer,
    registry: Arc<SubscriptionRegistry>,
    health_tx: mpsc::Sender<()>,
) {
    while let Some(log) = logs.next().await {
        let event = match decode_market_created(&log) {
            Ok(event) => event,
            Err(e) => {
                warn!("undecodable factory log skipped: {e}");
                continue;
            }
        };
        if let Err(e) = on_market_created(&contracts, &metadata, &registry, &event).await {
            error!(market = %event.market, kind = "market_created", "event handling failed: {e}");
            let _ = health_tx.try_send(());
        }
    }
    warn!("factory log stream ended");
    let _ = health_tx.try_send(());
}

async fn on_market_created(
    contracts: &Contracts,
    metadata: &MetadataIndexer,
    registry: &Arc<SubscriptionRegistry>,
    event: &MarketCreatedEvent,
) -> Result<()> {
    info!(
        market = %event.market,
        prediction_id = %event.prediction_id,
        creator = %event.creator,
        "market created"
    );
    metadata.refresh_market(contracts, event.market).await?;
    registry.ensure_subscribed(contracts, event.market).await?;
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
