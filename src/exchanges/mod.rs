//! Venue adapters.
//!
//! Each centralized exchange plugs venue-specific behavior (URLs, symbol
//! shape, subscribe frames, parsers, listing probes) into the shared
//! session loop in [`session`]. The connection manager talks to adapters
//! only through [`VenueAdapter`], which the on-chain pollers implement as
//! well.

pub mod binance;
pub mod bitget;
pub mod gate;
pub mod mexc;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{Exchange, ListingStatus, MarketKind, PriceSample};
use crate::store::PriceStore;

use session::{SessionContext, SessionHandle, StatusCallback};

/// Outcome of parsing one inbound text frame.
pub enum Inbound {
    /// Normalized sample, ready for the store.
    Sample(PriceSample),
    /// Heartbeat reply that must go back on the socket.
    Reply(String),
    /// Acks, control channels, unknown shapes: dropped silently.
    Ignore,
}

/// Venue-specific behavior consumed by the shared session loop.
#[async_trait]
pub trait Venue: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// Venue identifier used as the price-store key; derivatives get their
    /// own identity so spot and perp prices can arbitrage each other.
    fn venue_id(&self, market: MarketKind) -> String {
        match market {
            MarketKind::Spot => self.exchange().as_str().to_string(),
            MarketKind::Futures => format!("{}-futures", self.exchange().as_str()),
            MarketKind::Dex => format!("{}-dex", self.exchange().as_str()),
        }
    }

    /// Venue-native symbol for a canonical ticker.
    fn symbol(&self, ticker: &str, market: MarketKind) -> String;

    fn ws_url(&self, ticker: &str, market: MarketKind) -> String;

    /// Frames to send right after the socket opens; empty when the URL
    /// already carries the subscription.
    fn subscribe_frames(&self, ticker: &str, market: MarketKind) -> Vec<String>;

    fn parse_text(&self, raw: &str, ticker: &str, market: MarketKind) -> Inbound;

    /// Binary frames; only venues with a binary channel override this.
    fn parse_binary(
        &self,
        _payload: &[u8],
        _ticker: &str,
        _market: MarketKind,
    ) -> Option<PriceSample> {
        None
    }

    /// Application-level keepalive frame, sent on a fixed cadence.
    fn heartbeat_frame(&self, _market: MarketKind) -> Option<String> {
        None
    }

    /// Two REST probes (spot + derivative). Failures mean "unlisted",
    /// never an error.
    async fn check_listing(&self, client: &reqwest::Client, ticker: &str) -> ListingStatus;
}

/// Lifecycle surface the connection manager drives. Implemented by the
/// websocket adapter below and by the on-chain pool poller.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Store identifier for a given market on this adapter.
    fn venue_id(&self, market: MarketKind) -> String;

    async fn connect(&self, markets: &[MarketKind]);

    async fn disconnect(&self, markets: &[MarketKind]);

    /// Tear down and rebuild sessions for the markets, resetting any
    /// reconnect budget.
    async fn reconnect(&self, markets: &[MarketKind]);

    fn is_connected(&self, market: MarketKind) -> bool;

    fn active_markets(&self) -> Vec<MarketKind>;

    fn session_status(&self, market: MarketKind) -> Option<crate::models::SessionStatus>;
}

/// Websocket adapter: one session task per market of one venue.
pub struct ExchangeAdapter {
    ticker: String,
    venue: Arc<dyn Venue>,
    store: Arc<PriceStore>,
    status_cb: StatusCallback,
    sessions: Mutex<HashMap<MarketKind, SessionHandle>>,
}

impl ExchangeAdapter {
    pub fn new(
        ticker: String,
        venue: Arc<dyn Venue>,
        store: Arc<PriceStore>,
        status_cb: StatusCallback,
    ) -> Self {
        Self {
            ticker,
            venue,
            store,
            status_cb,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.venue.exchange()
    }

    fn spawn_session(&self, market: MarketKind) -> SessionHandle {
        SessionHandle::spawn(SessionContext {
            ticker: self.ticker.clone(),
            market,
            venue: self.venue.clone(),
            store: self.store.clone(),
            status_cb: self.status_cb.clone(),
        })
    }
}

#[async_trait]
impl VenueAdapter for ExchangeAdapter {
    fn venue_id(&self, market: MarketKind) -> String {
        self.venue.venue_id(market)
    }

    async fn connect(&self, markets: &[MarketKind]) {
        let mut sessions = self.sessions.lock();
        for &market in markets {
            sessions
                .entry(market)
                .or_insert_with(|| self.spawn_session(market));
        }
    }

    async fn disconnect(&self, markets: &[MarketKind]) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock();
            markets
                .iter()
                .filter_map(|market| sessions.remove(market))
                .collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }

    async fn reconnect(&self, markets: &[MarketKind]) {
        self.disconnect(markets).await;
        let mut sessions = self.sessions.lock();
        for &market in markets {
            sessions.insert(market, self.spawn_session(market));
        }
    }

    fn is_connected(&self, market: MarketKind) -> bool {
        self.sessions
            .lock()
            .get(&market)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    fn active_markets(&self) -> Vec<MarketKind> {
        self.sessions.lock().keys().copied().collect()
    }

    fn session_status(&self, market: MarketKind) -> Option<crate::models::SessionStatus> {
        self.sessions.lock().get(&market).map(|s| s.status())
    }
}

/// Static registry of supported exchanges.
pub fn venue_for(exchange: Exchange) -> Arc<dyn Venue> {
    match exchange {
        Exchange::Binance => Arc::new(binance::Binance),
        Exchange::Mexc => Arc::new(mexc::Mexc),
        Exchange::Gate => Arc::new(gate::Gate),
        Exchange::Bitget => Arc::new(bitget::Bitget),
    }
}

pub fn all_venues() -> Vec<Arc<dyn Venue>> {
    Exchange::ALL.iter().map(|&ex| venue_for(ex)).collect()
}

/// Parse a decimal string price, refusing non-finite values early so the
/// store's rejection counter only sees genuinely bad venue data.
pub(crate) fn parse_price(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0)
}
