//! Central in-memory price store.
//!
//! Every adapter funnels its normalized samples here. The store keeps the
//! latest sample per (ticker, venue), recomputes the arbitrage set for the
//! ticker on each ingestion, and fans significant changes out to
//! subscribers. Callbacks always run outside the store lock.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::models::{ArbitrageOpportunity, PriceSample};

/// Spread threshold applied when a ticker has no explicit one.
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 1.0;

/// Minimum top-spread movement (in centi-percentage-points) that counts as
/// a significant change. 10 = 0.1 pp.
const NOTIFY_DELTA_CENTI_PP: i64 = 10;

pub type OpportunityCallback = Arc<dyn Fn(&[ArbitrageOpportunity]) + Send + Sync>;

/// Handle returned by [`PriceStore::subscribe`]; pass back to
/// [`PriceStore::unsubscribe`] to deregister.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    ticker: String,
    id: u64,
}

#[derive(Default)]
struct TickerState {
    samples: HashMap<String, PriceSample>,
    opportunities: Vec<ArbitrageOpportunity>,
    threshold_percent: Option<f64>,
    subscribers: Vec<(u64, OpportunityCallback)>,
}

pub struct PriceStore {
    tickers: RwLock<HashMap<String, TickerState>>,
    next_sub_id: AtomicU64,
    validation_errors: AtomicU64,
}

thread_local! {
    /// Set while this thread runs subscriber callbacks. A callback that
    /// writes back into the store would recompute the set it is being
    /// notified about; such writes are rejected instead.
    static NOTIFYING: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

impl Default for PriceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceStore {
    pub fn new() -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            validation_errors: AtomicU64::new(0),
        }
    }

    /// Ingest one sample, overwriting the previous one for its venue.
    ///
    /// Recomputes the ticker's opportunity set and notifies subscribers if
    /// the set changed significantly. Non-finite or negative prices are
    /// dropped and counted, never propagated.
    pub fn update_price(&self, ticker: &str, sample: PriceSample) {
        if !sample.price.is_finite() || sample.price < 0.0 {
            self.validation_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                ticker,
                venue = %sample.venue,
                price = sample.price,
                "rejected invalid price sample"
            );
            return;
        }

        if NOTIFYING.with(|n| n.get()) {
            self.validation_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                ticker,
                venue = %sample.venue,
                "rejected reentrant update from subscriber callback"
            );
            return;
        }

        let (notify, snapshot) = {
            let mut tickers = self.tickers.write();
            let state = tickers.entry(ticker.to_string()).or_default();
            state.samples.insert(sample.venue.clone(), sample);

            let threshold = state
                .threshold_percent
                .unwrap_or(DEFAULT_THRESHOLD_PERCENT);
            let new_set = compute_opportunities(&state.samples, threshold);
            let significant = significant_change(&state.opportunities, &new_set);
            state.opportunities = new_set;

            if significant && !state.subscribers.is_empty() {
                let callbacks: Vec<OpportunityCallback> = state
                    .subscribers
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect();
                (callbacks, state.opportunities.clone())
            } else {
                (Vec::new(), Vec::new())
            }
        };

        if notify.is_empty() {
            return;
        }

        NOTIFYING.with(|n| n.set(true));
        for callback in &notify {
            if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                warn!(ticker, "subscriber callback panicked");
            }
        }
        NOTIFYING.with(|n| n.set(false));
    }

    /// Replace the ticker's minimum spread. Never triggers notifications
    /// by itself.
    pub fn set_threshold(&self, ticker: &str, percent: f64) {
        let mut tickers = self.tickers.write();
        let state = tickers.entry(ticker.to_string()).or_default();
        state.threshold_percent = Some(percent);
    }

    pub fn threshold(&self, ticker: &str) -> f64 {
        self.tickers
            .read()
            .get(ticker)
            .and_then(|s| s.threshold_percent)
            .unwrap_or(DEFAULT_THRESHOLD_PERCENT)
    }

    /// Register a callback for significant opportunity-set changes.
    pub fn subscribe(&self, ticker: &str, callback: OpportunityCallback) -> SubscriptionHandle {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let mut tickers = self.tickers.write();
        let state = tickers.entry(ticker.to_string()).or_default();
        state.subscribers.push((id, callback));
        SubscriptionHandle {
            ticker: ticker.to_string(),
            id,
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut tickers = self.tickers.write();
        if let Some(state) = tickers.get_mut(&handle.ticker) {
            state.subscribers.retain(|(id, _)| *id != handle.id);
        }
    }

    /// Snapshot of the latest sample per venue.
    pub fn get_prices(&self, ticker: &str) -> HashMap<String, PriceSample> {
        self.tickers
            .read()
            .get(ticker)
            .map(|s| s.samples.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the current opportunity set.
    pub fn get_opportunities(&self, ticker: &str) -> Vec<ArbitrageOpportunity> {
        self.tickers
            .read()
            .get(ticker)
            .map(|s| s.opportunities.clone())
            .unwrap_or_default()
    }

    /// Drop samples, threshold, opportunities and subscribers for a ticker.
    pub fn clear_ticker(&self, ticker: &str) {
        let removed = self.tickers.write().remove(ticker);
        if removed.is_some() {
            debug!(ticker, "cleared ticker state");
        }
    }

    pub fn active_tickers(&self) -> Vec<String> {
        self.tickers.read().keys().cloned().collect()
    }

    /// Count of samples rejected at the boundary.
    pub fn validation_errors(&self) -> u64 {
        self.validation_errors.load(Ordering::Relaxed)
    }
}

/// Round to 0.01 pp, half away from zero (`f64::round` semantics).
fn round_spread(spread: f64) -> f64 {
    (spread * 100.0).round() / 100.0
}

fn centi_pp(spread: f64) -> i64 {
    (spread * 100.0).round() as i64
}

/// All unordered venue pairs whose rounded spread clears the threshold,
/// sorted by absolute profit descending (spread descending on ties).
fn compute_opportunities(
    samples: &HashMap<String, PriceSample>,
    threshold_percent: f64,
) -> Vec<ArbitrageOpportunity> {
    if samples.len() < 2 {
        return Vec::new();
    }

    let now_ms = Utc::now().timestamp_millis();
    let list: Vec<&PriceSample> = samples.values().collect();
    let mut out = Vec::new();

    for i in 0..list.len() {
        for j in (i + 1)..list.len() {
            let (buy, sell) = if list[i].price <= list[j].price {
                (list[i], list[j])
            } else {
                (list[j], list[i])
            };

            if buy.price <= 0.0 {
                continue;
            }

            let spread = round_spread(100.0 * (sell.price - buy.price) / buy.price);
            if spread < threshold_percent {
                continue;
            }

            out.push(ArbitrageOpportunity {
                buy: buy.clone(),
                sell: sell.clone(),
                spread_percent: spread,
                profit_abs: sell.price - buy.price,
                detected_at_ms: now_ms,
            });
        }
    }

    out.sort_by(|a, b| {
        b.profit_abs
            .partial_cmp(&a.profit_abs)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.spread_percent
                    .partial_cmp(&a.spread_percent)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    out
}

/// Change suppression: notify only when the cardinality moved or the
/// top-ranked spread shifted by at least 0.1 pp.
fn significant_change(old: &[ArbitrageOpportunity], new: &[ArbitrageOpportunity]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    match (old.first(), new.first()) {
        (Some(prev), Some(next)) => {
            (centi_pp(next.spread_percent) - centi_pp(prev.spread_percent)).abs()
                >= NOTIFY_DELTA_CENTI_PP
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarketKind;
    use std::sync::atomic::AtomicUsize;

    fn sample(venue: &str, price: f64) -> PriceSample {
        PriceSample::new(venue, "BTCUSDT", price, MarketKind::Spot)
    }

    fn counting_subscriber(store: &PriceStore, ticker: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        store.subscribe(
            ticker,
            Arc::new(move |_| {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn test_latest_sample_wins() {
        let store = PriceStore::new();
        store.update_price("BTC", sample("binance", 100.0));
        store.update_price("BTC", sample("binance", 101.0));

        let prices = store.get_prices("BTC");
        assert_eq!(prices.len(), 1);
        assert_eq!(prices["binance"].price, 101.0);
    }

    #[test]
    fn test_single_sample_no_opportunities() {
        let store = PriceStore::new();
        store.update_price("BTC", sample("binance", 100.0));
        assert!(store.get_opportunities("BTC").is_empty());
    }

    #[test]
    fn test_threshold_gating() {
        // Spread 0.50% below a 1.0 threshold, then a third venue at 2.00%.
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);
        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 100.5));
        assert!(store.get_opportunities("BTC").is_empty());

        store.update_price("BTC", sample("z", 102.0));
        let opps = store.get_opportunities("BTC");
        assert_eq!(opps.len(), 2);
        let top = &opps[0];
        assert_eq!(top.buy.venue, "x");
        assert_eq!(top.sell.venue, "z");
        assert_eq!(top.spread_percent, 2.0);
    }

    #[test]
    fn test_spread_exactly_at_threshold_emits() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 2.0);
        store.update_price("BTC", sample("a", 100.0));
        store.update_price("BTC", sample("b", 102.0));

        let opps = store.get_opportunities("BTC");
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].spread_percent, 2.0);
    }

    #[test]
    fn test_ranking_by_absolute_profit() {
        let store = PriceStore::new();
        store.set_threshold("TKN", 1.0);
        store.update_price("TKN", sample("a", 10.0));
        store.update_price("TKN", sample("b", 10.3));
        store.update_price("TKN", sample("c", 10.6));

        let opps = store.get_opportunities("TKN");
        assert_eq!(opps.len(), 3);

        assert_eq!((opps[0].buy.venue.as_str(), opps[0].sell.venue.as_str()), ("a", "c"));
        assert_eq!(opps[0].spread_percent, 6.0);

        assert_eq!((opps[1].buy.venue.as_str(), opps[1].sell.venue.as_str()), ("a", "b"));
        assert_eq!(opps[1].spread_percent, 3.0);

        assert_eq!((opps[2].buy.venue.as_str(), opps[2].sell.venue.as_str()), ("b", "c"));
        assert_eq!(opps[2].spread_percent, 2.91);

        // Invariants: gated by threshold, buy below sell.
        for opp in &opps {
            assert!(opp.spread_percent >= 1.0);
            assert!(opp.buy.price <= opp.sell.price);
        }
    }

    #[test]
    fn test_no_duplicate_venue_pairs() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 0.0);
        store.update_price("BTC", sample("a", 100.0));
        store.update_price("BTC", sample("b", 101.0));
        store.update_price("BTC", sample("c", 102.0));

        let opps = store.get_opportunities("BTC");
        let mut pairs: Vec<(String, String)> = opps
            .iter()
            .map(|o| (o.buy.venue.clone(), o.sell.venue.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), opps.len());
    }

    #[test]
    fn test_invalid_prices_rejected_and_counted() {
        let store = PriceStore::new();
        store.update_price("BTC", sample("a", f64::NAN));
        store.update_price("BTC", sample("a", f64::INFINITY));
        store.update_price("BTC", sample("a", -1.0));

        assert!(store.get_prices("BTC").is_empty());
        assert_eq!(store.validation_errors(), 3);
    }

    #[test]
    fn test_change_suppression_small_top_delta() {
        // 5.00 -> 5.05 stays quiet, 5.05 -> 5.15 fires.
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);
        let notifications = counting_subscriber(&store, "BTC");

        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 105.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        store.update_price("BTC", sample("y", 105.05));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        store.update_price("BTC", sample("y", 105.15));
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_notify_boundary_at_tenth_of_point() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);
        let notifications = counting_subscriber(&store, "BTC");

        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 105.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // Delta 0.09 pp: suppressed.
        store.update_price("BTC", sample("y", 105.09));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // Delta 0.10 pp from the retained set: fires.
        store.update_price("BTC", sample("y", 105.19));
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cardinality_change_notifies() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);
        let notifications = counting_subscriber(&store, "BTC");

        store.update_price("BTC", sample("x", 100.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 0);

        store.update_price("BTC", sample("y", 102.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // Spread collapses below threshold: set shrinks, fires again.
        store.update_price("BTC", sample("y", 100.1));
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_set_threshold_idempotent_and_silent() {
        let store = PriceStore::new();
        let notifications = counting_subscriber(&store, "BTC");

        store.set_threshold("BTC", 2.5);
        store.set_threshold("BTC", 2.5);
        assert_eq!(store.threshold("BTC"), 2.5);
        assert_eq!(notifications.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let handle = store.subscribe(
            "BTC",
            Arc::new(move |_| {
                count_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 102.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        store.unsubscribe(&handle);
        store.update_price("BTC", sample("y", 110.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);

        store.subscribe("BTC", Arc::new(|_| panic!("boom")));
        let notifications = counting_subscriber(&store, "BTC");

        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 102.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_update_rejected() {
        let store = Arc::new(PriceStore::new());
        store.set_threshold("BTC", 1.0);

        let reentrant_store = store.clone();
        store.subscribe(
            "BTC",
            Arc::new(move |_| {
                reentrant_store.update_price("BTC", sample("z", 500.0));
            }),
        );

        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 102.0));

        assert!(!store.get_prices("BTC").contains_key("z"));
        assert_eq!(store.validation_errors(), 1);
    }

    #[test]
    fn test_clear_ticker_drops_everything() {
        let store = PriceStore::new();
        store.set_threshold("BTC", 1.0);
        let notifications = counting_subscriber(&store, "BTC");
        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 102.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        store.clear_ticker("BTC");
        assert!(store.get_prices("BTC").is_empty());
        assert!(store.get_opportunities("BTC").is_empty());
        assert_eq!(store.threshold("BTC"), DEFAULT_THRESHOLD_PERCENT);

        // Old subscribers are gone with the ticker.
        store.update_price("BTC", sample("x", 100.0));
        store.update_price("BTC", sample("y", 110.0));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }
}
