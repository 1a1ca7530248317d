//! On-chain pool poller.
//!
//! One poller owns one pair contract on one chain. Every tick it reads the
//! pool reserves over JSON-RPC and derives a price in a USD-pegged stable:
//! directly when one side of the pool is USDT/USDC, via the cached
//! wrapped-native price when the pool quotes in the chain's native token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::exchanges::session::{wait_shutdown, StatusCallback};
use crate::exchanges::VenueAdapter;
use crate::models::{ConnectionState, MarketKind, PriceSample, SessionStatus};
use crate::store::PriceStore;

use super::chains::ChainConfig;
use super::rpc::EvmRpcClient;

/// Default reserve-read cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Floor for configurable cadence.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(300);
/// Polls slower than this get logged.
const SLOW_POLL: Duration = Duration::from_secs(1);
/// Wrapped-native price lives this long before a re-read.
pub const NATIVE_PRICE_TTL: Duration = Duration::from_secs(3);

const STOP_GRACE: Duration = Duration::from_secs(2);

/// Process-wide wrapped-native price cache, one slot per chain.
/// Concurrent pollers within the TTL share the cached read.
fn native_cache() -> &'static Mutex<HashMap<&'static str, (f64, Instant)>> {
    static CACHE: OnceLock<Mutex<HashMap<&'static str, (f64, Instant)>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn cached_native_price(slug: &'static str) -> Option<f64> {
    let cache = native_cache().lock();
    cache
        .get(slug)
        .filter(|(_, at)| at.elapsed() < NATIVE_PRICE_TTL)
        .map(|(price, _)| *price)
}

fn store_native_price(slug: &'static str, price: f64) {
    native_cache().lock().insert(slug, (price, Instant::now()));
}

/// Immutable pool facts, resolved once per poller.
#[derive(Debug, Clone)]
struct PoolMeta {
    token0: String,
    token1: String,
    decimals0: u8,
    decimals1: u8,
}

/// Which side of the pool provides the quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuotePath {
    Stable0,
    Stable1,
    Native0,
    Native1,
}

fn classify(chain: &ChainConfig, token0: &str, token1: &str) -> Option<QuotePath> {
    if chain.is_stable(token1) {
        Some(QuotePath::Stable1)
    } else if chain.is_stable(token0) {
        Some(QuotePath::Stable0)
    } else if chain.is_wrapped_native(token1) {
        Some(QuotePath::Native1)
    } else if chain.is_wrapped_native(token0) {
        Some(QuotePath::Native0)
    } else {
        None
    }
}

fn adjust(reserve: u128, decimals: u8) -> f64 {
    (reserve as f64) * 10f64.powi(-i32::from(decimals))
}

fn price_from_reserves(
    path: QuotePath,
    adj0: f64,
    adj1: f64,
    native_price: Option<f64>,
) -> Option<f64> {
    if adj0 <= 0.0 || adj1 <= 0.0 {
        return None;
    }
    match path {
        QuotePath::Stable1 => Some(adj1 / adj0),
        QuotePath::Stable0 => Some(adj0 / adj1),
        QuotePath::Native1 => native_price.map(|np| (adj1 / adj0) * np),
        QuotePath::Native0 => native_price.map(|np| (adj0 / adj1) * np),
    }
}

struct PollerInner {
    ticker: String,
    chain: &'static ChainConfig,
    pair_address: String,
    rpc: EvmRpcClient,
    store: Arc<PriceStore>,
    status_cb: StatusCallback,
    state: Arc<RwLock<SessionStatus>>,
    poll_interval: Duration,
    rpc_failures: AtomicU64,
}

impl PollerInner {
    fn transition(&self, next: ConnectionState, error: Option<String>) {
        let snapshot = {
            let mut status = self.state.write();
            status.state = next;
            status.error = error;
            status.clone()
        };
        (self.status_cb)(snapshot);
    }

    async fn resolve_meta(&self) -> Result<PoolMeta> {
        let token0 = self.rpc.token0(&self.pair_address).await?;
        let token1 = self.rpc.token1(&self.pair_address).await?;
        let decimals0 = self.rpc.decimals(&token0).await?;
        let decimals1 = self.rpc.decimals(&token1).await?;
        Ok(PoolMeta {
            token0,
            token1,
            decimals0,
            decimals1,
        })
    }

    async fn native_price(&self) -> Result<f64> {
        if let Some(price) = cached_native_price(self.chain.slug) {
            return Ok(price);
        }

        let pool = self.chain.native_stable_pool;
        let token0 = self.rpc.token0(pool).await?;
        let token1 = self.rpc.token1(pool).await?;
        let decimals0 = self.rpc.decimals(&token0).await?;
        let decimals1 = self.rpc.decimals(&token1).await?;
        let (reserve0, reserve1, _) = self.rpc.get_reserves(pool).await?;

        let adj0 = adjust(reserve0, decimals0);
        let adj1 = adjust(reserve1, decimals1);
        let price = if self.chain.is_stable(&token1) {
            price_from_reserves(QuotePath::Stable1, adj0, adj1, None)
        } else if self.chain.is_stable(&token0) {
            price_from_reserves(QuotePath::Stable0, adj0, adj1, None)
        } else {
            None
        }
        .ok_or_else(|| {
            anyhow!(
                "native pool {} on {} has no stable side",
                pool,
                self.chain.slug
            )
        })?;

        store_native_price(self.chain.slug, price);
        Ok(price)
    }

    async fn poll_once(&self, meta_slot: &mut Option<PoolMeta>) -> Result<PriceSample> {
        if meta_slot.is_none() {
            *meta_slot = Some(self.resolve_meta().await?);
        }
        let meta = meta_slot.as_ref().expect("meta resolved above");

        let path = classify(self.chain, &meta.token0, &meta.token1).ok_or_else(|| {
            anyhow!(
                "no quote path for pool {} on {}",
                self.pair_address,
                self.chain.slug
            )
        })?;

        let (reserve0, reserve1, _) = self.rpc.get_reserves(&self.pair_address).await?;
        let adj0 = adjust(reserve0, meta.decimals0);
        let adj1 = adjust(reserve1, meta.decimals1);

        let native = match path {
            QuotePath::Native0 | QuotePath::Native1 => Some(self.native_price().await?),
            _ => None,
        };

        let price = price_from_reserves(path, adj0, adj1, native)
            .ok_or_else(|| anyhow!("empty reserves in pool {}", self.pair_address))?;

        Ok(PriceSample::new(
            self.chain.venue_id(),
            self.pair_address.clone(),
            price,
            MarketKind::Dex,
        ))
    }
}

async fn run(inner: Arc<PollerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    inner.transition(ConnectionState::Connecting, None);

    let mut meta: Option<PoolMeta> = None;
    let mut connected = false;
    let mut tick = tokio::time::interval(inner.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = wait_shutdown(&mut shutdown_rx) => {
                inner.transition(
                    ConnectionState::Disconnected,
                    Some("manual disconnect".to_string()),
                );
                return;
            }
        }

        let started = Instant::now();
        let result = inner.poll_once(&mut meta).await;
        let elapsed = started.elapsed();
        if elapsed > SLOW_POLL {
            warn!(
                pool = %inner.pair_address,
                chain = inner.chain.slug,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow pool poll"
            );
        }

        match result {
            Ok(sample) => {
                if !connected {
                    connected = true;
                    inner.transition(ConnectionState::Connected, None);
                }
                inner.state.write().last_update_ms = chrono::Utc::now().timestamp_millis();
                inner.store.update_price(&inner.ticker, sample);
            }
            Err(e) => {
                // Skip the sample, count it, keep polling.
                inner.rpc_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    pool = %inner.pair_address,
                    chain = inner.chain.slug,
                    error = %e,
                    "pool poll failed"
                );
            }
        }
    }
}

/// Polling adapter for one (ticker, chain, pool).
pub struct PoolAdapter {
    inner: Arc<PollerInner>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl PoolAdapter {
    pub fn new(
        ticker: String,
        chain: &'static ChainConfig,
        pair_address: String,
        client: reqwest::Client,
        store: Arc<PriceStore>,
        status_cb: StatusCallback,
    ) -> Self {
        let rpc = EvmRpcClient::new(client, chain.rpc_url());
        let state = Arc::new(RwLock::new(SessionStatus {
            ticker: ticker.clone(),
            venue: chain.venue_id(),
            market: MarketKind::Dex,
            state: ConnectionState::Connecting,
            last_update_ms: 0,
            error: None,
            reconnect_attempts: 0,
        }));

        Self {
            inner: Arc::new(PollerInner {
                ticker,
                chain,
                pair_address: super::chains::normalize_address(&pair_address),
                rpc,
                store,
                status_cb,
                state,
                poll_interval: DEFAULT_POLL_INTERVAL,
                rpc_failures: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }

    /// Override the cadence; values below the floor are clamped.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("no task spawned yet");
        inner.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn rpc_failures(&self) -> u64 {
        self.inner.rpc_failures.load(Ordering::Relaxed)
    }

    fn spawn(&self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run(inner, rx).await;
        });
        (tx, handle)
    }

    async fn stop_task(&self) {
        let taken = self.task.lock().take();
        if let Some((tx, handle)) = taken {
            let _ = tx.send(true);
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!(
                    pool = %self.inner.pair_address,
                    "pool poller did not stop within grace period"
                );
            }
        }
    }
}

#[async_trait]
impl VenueAdapter for PoolAdapter {
    fn venue_id(&self, _market: MarketKind) -> String {
        self.inner.chain.venue_id()
    }

    async fn connect(&self, markets: &[MarketKind]) {
        if !markets.contains(&MarketKind::Dex) {
            return;
        }
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(self.spawn());
        }
    }

    async fn disconnect(&self, markets: &[MarketKind]) {
        if markets.contains(&MarketKind::Dex) {
            self.stop_task().await;
        }
    }

    async fn reconnect(&self, markets: &[MarketKind]) {
        if !markets.contains(&MarketKind::Dex) {
            return;
        }
        self.stop_task().await;
        *self.task.lock() = Some(self.spawn());
    }

    fn is_connected(&self, market: MarketKind) -> bool {
        market == MarketKind::Dex
            && self.inner.state.read().state == ConnectionState::Connected
    }

    fn active_markets(&self) -> Vec<MarketKind> {
        if self.task.lock().is_some() {
            vec![MarketKind::Dex]
        } else {
            Vec::new()
        }
    }

    fn session_status(&self, market: MarketKind) -> Option<SessionStatus> {
        (market == MarketKind::Dex).then(|| self.inner.state.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::chains::chain_by_slug;

    #[test]
    fn test_stable_pool_pricing() {
        // 1e24 raw at 18 decimals = 1e6 target tokens against
        // 3e15 raw at 6 decimals = 3e9 USDT: 3000 per token.
        let adj0 = adjust(1_000_000_000_000_000_000_000_000u128, 18);
        let adj1 = adjust(3_000_000_000_000_000u128, 6);
        let price = price_from_reserves(QuotePath::Stable1, adj0, adj1, None).unwrap();
        assert!((price - 3_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_stable_side_flipped() {
        let adj0 = adjust(3_000_000_000_000_000u128, 6);
        let adj1 = adjust(1_000_000_000_000_000_000_000_000u128, 18);
        let price = price_from_reserves(QuotePath::Stable0, adj0, adj1, None).unwrap();
        assert!((price - 3_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_native_quoted_pricing() {
        // Pool holds 1000 target per 10 native; native trades at 3000.
        let price =
            price_from_reserves(QuotePath::Native1, 1_000.0, 10.0, Some(3_000.0)).unwrap();
        assert!((price - 30.0).abs() < 1e-9);
        // Native path without a native price cannot produce a quote.
        assert!(price_from_reserves(QuotePath::Native1, 1_000.0, 10.0, None).is_none());
    }

    #[test]
    fn test_empty_reserves_rejected() {
        assert!(price_from_reserves(QuotePath::Stable1, 0.0, 10.0, None).is_none());
        assert!(price_from_reserves(QuotePath::Stable1, 10.0, 0.0, None).is_none());
    }

    #[test]
    fn test_classify_quote_paths() {
        let eth = chain_by_slug("ethereum").unwrap();
        let target = "0x1111111111111111111111111111111111111111";

        assert_eq!(classify(eth, target, eth.usdt), Some(QuotePath::Stable1));
        assert_eq!(classify(eth, eth.usdc, target), Some(QuotePath::Stable0));
        assert_eq!(
            classify(eth, target, eth.wrapped_native),
            Some(QuotePath::Native1)
        );
        assert_eq!(
            classify(eth, eth.wrapped_native, target),
            Some(QuotePath::Native0)
        );
        // Stable beats native when both are present.
        assert_eq!(
            classify(eth, eth.wrapped_native, eth.usdt),
            Some(QuotePath::Stable1)
        );
        assert_eq!(
            classify(eth, target, "0x2222222222222222222222222222222222222222"),
            None
        );
    }

    #[test]
    fn test_native_cache_ttl() {
        store_native_price("polygon", 0.72);
        assert_eq!(cached_native_price("polygon"), Some(0.72));
        // Another chain's slot is independent.
        assert_eq!(cached_native_price("avalanche"), None);
    }
}
