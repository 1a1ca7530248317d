use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Market kind a venue can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    Spot,
    Futures,
    Dex,
}

impl MarketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::Futures => "futures",
            MarketKind::Dex => "dex",
        }
    }
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Centralized exchanges with live adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Mexc,
    Gate,
    Bitget,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [
        Exchange::Binance,
        Exchange::Mexc,
        Exchange::Gate,
        Exchange::Bitget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Mexc => "mexc",
            Exchange::Gate => "gate",
            Exchange::Bitget => "bitget",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "mexc" => Some(Exchange::Mexc),
            "gate" | "gateio" | "gate.io" => Some(Exchange::Gate),
            "bitget" => Some(Exchange::Bitget),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized price observation from a venue.
///
/// Latest-only semantics: the store keeps at most one sample per
/// (ticker, venue) and discards anything older at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    /// Venue identifier, e.g. "binance", "mexc-futures", "bsc-amm".
    pub venue: String,
    /// Venue-native symbol, informational only (shape differs per venue).
    pub symbol: String,
    pub price: f64,
    pub timestamp_ms: i64,
    pub market: MarketKind,
    /// 24h quote volume where the venue reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
}

impl PriceSample {
    pub fn new(
        venue: impl Into<String>,
        symbol: impl Into<String>,
        price: f64,
        market: MarketKind,
    ) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
            price,
            timestamp_ms: Utc::now().timestamp_millis(),
            market,
            volume_24h: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_volume(mut self, volume_24h: f64) -> Self {
        self.volume_24h = Some(volume_24h);
        self
    }
}

/// Listing probe result for one venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingStatus {
    pub spot: bool,
    pub futures: bool,
    pub symbol: String,
}

impl ListingStatus {
    pub fn unlisted() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.spot || self.futures
    }

    pub fn markets(&self) -> Vec<MarketKind> {
        let mut out = Vec::with_capacity(2);
        if self.spot {
            out.push(MarketKind::Spot);
        }
        if self.futures {
            out.push(MarketKind::Futures);
        }
        out
    }
}

/// One venue entry inside a monitoring spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueSelection {
    pub exchange: Exchange,
    pub markets: Vec<MarketKind>,
}

/// On-chain pool to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSelection {
    /// Chain slug: "ethereum", "bsc", "polygon", "avalanche".
    pub chain: String,
    /// Pair contract address (hex, any casing).
    pub pair_address: String,
}

/// Everything needed to start monitoring one ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    pub ticker: String,
    pub venues: Vec<VenueSelection>,
    #[serde(default)]
    pub pools: Vec<PoolSelection>,
    pub threshold_percent: f64,
}

/// Connection lifecycle of one (ticker, venue, market) session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot mirrored out of an adapter session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub ticker: String,
    pub venue: String,
    pub market: MarketKind,
    pub state: ConnectionState,
    pub last_update_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reconnect_attempts: u32,
}

impl SessionStatus {
    /// Opaque adapter key: `ticker|venue|market`.
    pub fn key(&self) -> String {
        session_key(&self.ticker, &self.venue, self.market)
    }
}

pub fn session_key(ticker: &str, venue: &str, market: MarketKind) -> String {
    format!("{}|{}|{}", ticker, venue, market.as_str())
}

/// A single cross-venue opportunity: buy low, sell high.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrageOpportunity {
    pub buy: PriceSample,
    pub sell: PriceSample,
    /// Percent spread, rounded to 0.01 pp.
    pub spread_percent: f64,
    /// sell.price - buy.price, unrounded.
    pub profit_abs: f64,
    pub detected_at_ms: i64,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        Self { port }
    }
}
