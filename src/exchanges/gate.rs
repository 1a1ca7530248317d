//! Gate.io adapter.
//!
//! Both markets speak the time/channel/event envelope; subscribe acks come
//! back with `event: "subscribe"` and are dropped. Spot ticker results are
//! a single object, futures results an array.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::models::{Exchange, ListingStatus, MarketKind, PriceSample};

use super::{parse_price, Inbound, Venue};

const SPOT_WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const FUTURES_WS_URL: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";
const SPOT_REST_BASE: &str = "https://api.gateio.ws/api/v4/spot/currency_pairs";
const FUTURES_REST_BASE: &str = "https://api.gateio.ws/api/v4/futures/usdt/contracts";

const SPOT_CHANNEL: &str = "spot.tickers";
const FUTURES_CHANNEL: &str = "futures.tickers";

pub struct Gate;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    time_ms: Option<i64>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    /// Some venues heartbeat with a bare `{"ping": ts}`.
    #[serde(default)]
    ping: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SpotTicker {
    currency_pair: String,
    last: String,
    #[serde(default)]
    quote_volume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FuturesTicker {
    contract: String,
    last: String,
    #[serde(default)]
    volume_24h_settle: Option<String>,
}

impl Gate {
    fn channel(market: MarketKind) -> &'static str {
        match market {
            MarketKind::Futures => FUTURES_CHANNEL,
            _ => SPOT_CHANNEL,
        }
    }
}

#[async_trait]
impl Venue for Gate {
    fn exchange(&self) -> Exchange {
        Exchange::Gate
    }

    fn symbol(&self, ticker: &str, _market: MarketKind) -> String {
        format!("{}_USDT", ticker.to_uppercase())
    }

    fn ws_url(&self, _ticker: &str, market: MarketKind) -> String {
        match market {
            MarketKind::Futures => FUTURES_WS_URL.to_string(),
            _ => SPOT_WS_URL.to_string(),
        }
    }

    fn subscribe_frames(&self, ticker: &str, market: MarketKind) -> Vec<String> {
        vec![json!({
            "time": Utc::now().timestamp(),
            "channel": Self::channel(market),
            "event": "subscribe",
            "payload": [self.symbol(ticker, market)],
        })
        .to_string()]
    }

    fn heartbeat_frame(&self, market: MarketKind) -> Option<String> {
        let channel = match market {
            MarketKind::Futures => "futures.ping",
            _ => "spot.ping",
        };
        Some(
            json!({
                "time": Utc::now().timestamp(),
                "channel": channel,
            })
            .to_string(),
        )
    }

    fn parse_text(&self, raw: &str, _ticker: &str, market: MarketKind) -> Inbound {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(_) => return Inbound::Ignore,
        };

        if let Some(ts) = envelope.ping {
            return Inbound::Reply(json!({"pong": ts}).to_string());
        }

        // Subscribe acks and pongs carry event != "update".
        if envelope.event.as_deref() != Some("update") {
            return Inbound::Ignore;
        }
        if envelope.channel.as_deref() != Some(Self::channel(market)) {
            return Inbound::Ignore;
        }
        let Some(result) = envelope.result else {
            return Inbound::Ignore;
        };

        let timestamp = envelope
            .time_ms
            .or_else(|| envelope.time.map(|t| t * 1000))
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let (symbol, last, volume) = if market == MarketKind::Futures {
            // Futures pushes an array of ticker objects.
            let tickers: Vec<FuturesTicker> = match serde_json::from_value(result) {
                Ok(tickers) => tickers,
                Err(_) => {
                    warn!("gate futures ticker with unexpected result shape");
                    return Inbound::Ignore;
                }
            };
            let Some(ticker) = tickers.into_iter().next() else {
                return Inbound::Ignore;
            };
            (ticker.contract, ticker.last, ticker.volume_24h_settle)
        } else {
            let ticker: SpotTicker = match serde_json::from_value(result) {
                Ok(ticker) => ticker,
                Err(_) => {
                    warn!("gate spot ticker with unexpected result shape");
                    return Inbound::Ignore;
                }
            };
            (ticker.currency_pair, ticker.last, ticker.quote_volume)
        };

        let Some(price) = parse_price(&last) else {
            warn!(raw = %last, "gate ticker with unparseable price");
            return Inbound::Ignore;
        };

        let mut sample = PriceSample::new(self.venue_id(market), symbol, price, market)
            .with_timestamp(timestamp);
        if let Some(volume) = volume.as_deref().and_then(parse_price) {
            sample = sample.with_volume(volume);
        }
        Inbound::Sample(sample)
    }

    async fn check_listing(&self, client: &reqwest::Client, ticker: &str) -> ListingStatus {
        let symbol = self.symbol(ticker, MarketKind::Spot);
        let spot = probe(client, &format!("{SPOT_REST_BASE}/{symbol}")).await;
        let futures = probe(client, &format!("{FUTURES_REST_BASE}/{symbol}")).await;
        ListingStatus {
            spot,
            futures,
            symbol,
        }
    }
}

async fn probe(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            warn!(url, error = %e, "gate listing probe failed");
            false
        }
    }
}
