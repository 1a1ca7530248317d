//! Connection manager: owns every running adapter.
//!
//! Adapters are keyed per (ticker, venue); each adapter runs one session
//! per market. The manager wires adapter status callbacks into a single
//! fan-out, exposes start/stop/reconnect, and aggregates health for the
//! HTTP layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::discovery::{Discovery, DiscoveryResult};
use crate::exchanges::session::StatusCallback;
use crate::exchanges::{venue_for, ExchangeAdapter, VenueAdapter};
use crate::models::{MarketKind, MonitoringSpec, SessionStatus};
use crate::onchain::{chain_by_slug, PoolAdapter};
use crate::store::PriceStore;

/// REST/RPC client timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

type AdapterKey = (String, String);

/// Outcome of a start call, surfaced in HTTP responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub ticker: String,
    pub sessions: usize,
    /// Per-adapter failures that did not abort the start.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerInfo {
    pub ticker: String,
    pub threshold_percent: f64,
    pub connections: Vec<SessionStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringInfo {
    pub active_tickers: Vec<TickerInfo>,
    pub total_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub active_tickers: usize,
    pub sessions_total: usize,
    pub sessions_connected: usize,
    pub sessions_error: usize,
    pub validation_errors: u64,
}

pub struct ConnectionManager {
    store: Arc<PriceStore>,
    client: reqwest::Client,
    discovery: Discovery,
    adapters: RwLock<HashMap<AdapterKey, Arc<dyn VenueAdapter>>>,
    listeners: Arc<RwLock<Vec<(u64, StatusCallback)>>>,
    next_listener_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(store: Arc<PriceStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            store,
            discovery: Discovery::new(client.clone()),
            client,
            adapters: RwLock::new(HashMap::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<PriceStore> {
        &self.store
    }

    pub async fn discover(&self, ticker: &str, threshold_percent: f64) -> DiscoveryResult {
        self.discovery.discover(ticker, threshold_percent).await
    }

    /// Discovery followed by a start. Fails when nothing lists the ticker.
    pub async fn start_monitoring_auto(
        &self,
        ticker: &str,
        threshold_percent: f64,
    ) -> Result<StartReport> {
        let result = self.discover(ticker, threshold_percent).await;
        let spec = result
            .spec
            .ok_or_else(|| anyhow!("{} is not listed on any supported venue", result.ticker))?;
        self.start_monitoring(spec).await
    }

    /// Resolve a spec into running adapters. Individual pool failures are
    /// recorded in the report; session startup itself cannot fail here.
    pub async fn start_monitoring(&self, spec: MonitoringSpec) -> Result<StartReport> {
        let ticker = spec.ticker.trim().to_uppercase();
        if ticker.is_empty() {
            bail!("ticker must not be empty");
        }
        if spec.venues.is_empty() && spec.pools.is_empty() {
            bail!("spec contains no venues and no pools");
        }

        self.store.set_threshold(&ticker, spec.threshold_percent);

        let mut errors = Vec::new();
        let mut starts: Vec<(Arc<dyn VenueAdapter>, Vec<MarketKind>)> = Vec::new();

        {
            let mut adapters = self.adapters.write();

            for selection in &spec.venues {
                if selection.markets.is_empty() {
                    continue;
                }
                let key = (ticker.clone(), selection.exchange.as_str().to_string());
                let adapter = adapters
                    .entry(key)
                    .or_insert_with(|| {
                        Arc::new(ExchangeAdapter::new(
                            ticker.clone(),
                            venue_for(selection.exchange),
                            self.store.clone(),
                            self.status_fanout(),
                        )) as Arc<dyn VenueAdapter>
                    })
                    .clone();
                starts.push((adapter, selection.markets.clone()));
            }

            for pool in &spec.pools {
                let Some(chain) = chain_by_slug(&pool.chain) else {
                    errors.push(format!("unknown chain: {}", pool.chain));
                    continue;
                };
                let key = (ticker.clone(), chain.venue_id());
                let adapter = adapters
                    .entry(key)
                    .or_insert_with(|| {
                        Arc::new(PoolAdapter::new(
                            ticker.clone(),
                            chain,
                            pool.pair_address.clone(),
                            self.client.clone(),
                            self.store.clone(),
                            self.status_fanout(),
                        )) as Arc<dyn VenueAdapter>
                    })
                    .clone();
                starts.push((adapter, vec![MarketKind::Dex]));
            }
        }

        if starts.is_empty() {
            bail!(
                "no adapters could be started: {}",
                errors.join("; ")
            );
        }

        // All adapters connect in parallel.
        join_all(
            starts
                .iter()
                .map(|(adapter, markets)| adapter.connect(markets)),
        )
        .await;

        let sessions = starts.iter().map(|(_, markets)| markets.len()).sum();
        info!(ticker = %ticker, sessions, "monitoring started");

        Ok(StartReport {
            ticker,
            sessions,
            errors,
        })
    }

    /// Disconnect every adapter of the ticker and clear its store state.
    pub async fn stop_monitoring(&self, ticker: &str) -> usize {
        let ticker = ticker.trim().to_uppercase();

        let removed: Vec<Arc<dyn VenueAdapter>> = {
            let mut adapters = self.adapters.write();
            let keys: Vec<AdapterKey> = adapters
                .keys()
                .filter(|(t, _)| *t == ticker)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| adapters.remove(&key))
                .collect()
        };

        let count = removed.len();
        join_all(removed.iter().map(|adapter| async move {
            let markets = adapter.active_markets();
            adapter.disconnect(&markets).await;
        }))
        .await;

        self.store.clear_ticker(&ticker);
        info!(ticker = %ticker, adapters = count, "monitoring stopped");
        count
    }

    /// Force a fresh session (fresh reconnect budget) for one market.
    pub async fn reconnect_exchange(
        &self,
        ticker: &str,
        venue: &str,
        market: MarketKind,
    ) -> Result<()> {
        let ticker = ticker.trim().to_uppercase();
        let adapter = self
            .find_adapter(&ticker, venue)
            .ok_or_else(|| anyhow!("no adapter for {ticker}/{venue}"))?;
        adapter.reconnect(&[market]).await;
        info!(ticker = %ticker, venue, market = %market, "manual reconnect");
        Ok(())
    }

    fn find_adapter(&self, ticker: &str, venue: &str) -> Option<Arc<dyn VenueAdapter>> {
        let adapters = self.adapters.read();
        let key = (ticker.to_string(), venue.to_string());
        if let Some(adapter) = adapters.get(&key) {
            return Some(adapter.clone());
        }
        // Accept market-qualified venue ids like "binance-futures".
        let base = venue.trim_end_matches("-futures");
        adapters.get(&(ticker.to_string(), base.to_string())).cloned()
    }

    pub fn get_connection_status(&self, ticker: Option<&str>) -> Vec<SessionStatus> {
        let filter = ticker.map(|t| t.trim().to_uppercase());
        let adapters = self.adapters.read();
        let mut out = Vec::new();
        for ((t, _), adapter) in adapters.iter() {
            if let Some(filter) = &filter {
                if t != filter {
                    continue;
                }
            }
            for market in adapter.active_markets() {
                if let Some(status) = adapter.session_status(market) {
                    out.push(status);
                }
            }
        }
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Opaque `ticker|venue|market` keys of all live sessions.
    pub fn adapter_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .get_connection_status(None)
            .iter()
            .map(|s| s.key())
            .collect();
        keys.sort();
        keys
    }

    pub fn get_monitoring_info(&self) -> MonitoringInfo {
        let statuses = self.get_connection_status(None);
        let mut by_ticker: HashMap<String, Vec<SessionStatus>> = HashMap::new();
        for status in statuses {
            by_ticker.entry(status.ticker.clone()).or_default().push(status);
        }

        let total_sessions = by_ticker.values().map(Vec::len).sum();
        let mut active_tickers: Vec<TickerInfo> = by_ticker
            .into_iter()
            .map(|(ticker, connections)| TickerInfo {
                threshold_percent: self.store.threshold(&ticker),
                ticker,
                connections,
            })
            .collect();
        active_tickers.sort_by(|a, b| a.ticker.cmp(&b.ticker));

        MonitoringInfo {
            active_tickers,
            total_sessions,
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let statuses = self.get_connection_status(None);
        let sessions_total = statuses.len();
        let sessions_connected = statuses
            .iter()
            .filter(|s| s.state == crate::models::ConnectionState::Connected)
            .count();
        let sessions_error = statuses
            .iter()
            .filter(|s| s.state == crate::models::ConnectionState::Error)
            .count();

        let mut tickers: Vec<&str> = statuses.iter().map(|s| s.ticker.as_str()).collect();
        tickers.sort();
        tickers.dedup();

        let status = if sessions_total == 0 {
            "idle"
        } else if sessions_error > 0 {
            "degraded"
        } else {
            "ok"
        };

        HealthReport {
            status: status.to_string(),
            active_tickers: tickers.len(),
            sessions_total,
            sessions_connected,
            sessions_error,
            validation_errors: self.store.validation_errors(),
        }
    }

    /// Register for every adapter status change. Returns a listener id for
    /// [`ConnectionManager::remove_status_listener`].
    pub fn on_status_update(&self, callback: StatusCallback) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, callback));
        id
    }

    pub fn remove_status_listener(&self, id: u64) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    /// Stop everything. Safe to call repeatedly.
    pub async fn emergency_disconnect_all(&self) {
        let tickers: Vec<String> = {
            let adapters = self.adapters.read();
            let mut tickers: Vec<String> =
                adapters.keys().map(|(t, _)| t.clone()).collect();
            tickers.sort();
            tickers.dedup();
            tickers
        };

        if tickers.is_empty() {
            return;
        }
        warn!(tickers = tickers.len(), "emergency disconnect");
        for ticker in tickers {
            self.stop_monitoring(&ticker).await;
        }
    }

    fn status_fanout(&self) -> StatusCallback {
        let listeners = Arc::clone(&self.listeners);
        Arc::new(move |status: SessionStatus| {
            let callbacks: Vec<StatusCallback> = listeners
                .read()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for callback in callbacks {
                callback(status.clone());
            }
        })
    }

    #[cfg(test)]
    fn insert_adapter(&self, ticker: &str, base: &str, adapter: Arc<dyn VenueAdapter>) {
        self.adapters
            .write()
            .insert((ticker.to_string(), base.to_string()), adapter);
    }
}
