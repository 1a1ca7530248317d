//! MEXC adapter.
//!
//! Spot rides the protobuf-compressed aggregated-deals channel (decoded by
//! [`crate::codec`]); the contract stream is plain JSON. Note the symbol
//! split: spot is `BTCUSDT`, contracts are `BTC_USDT`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::codec;
use crate::models::{Exchange, ListingStatus, MarketKind, PriceSample};

use super::{parse_price, Inbound, Venue};

const SPOT_WS_URL: &str = "wss://wbs-api.mexc.com/ws";
const FUTURES_WS_URL: &str = "wss://contract.mexc.com/edge";
const SPOT_REST: &str = "https://api.mexc.com/api/v3/exchangeInfo";
const FUTURES_REST: &str = "https://contract.mexc.com/api/v1/contract/detail";

/// Deals cadence requested in the channel topic.
const DEALS_INTERVAL: &str = "100ms";

pub struct Mexc;

/// Contract-stream push envelope.
#[derive(Debug, Deserialize)]
struct ContractPush {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ContractTicker {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: f64,
    #[serde(rename = "amount24", default)]
    amount_24h: Option<f64>,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SpotExchangeInfo {
    #[serde(default)]
    symbols: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ContractDetail {
    #[serde(default)]
    success: bool,
}

impl Mexc {
    fn deals_topic(&self, ticker: &str) -> String {
        format!(
            "spot@public.aggre.deals.v3.api.pb@{}@{}",
            DEALS_INTERVAL,
            self.symbol(ticker, MarketKind::Spot)
        )
    }
}

#[async_trait]
impl Venue for Mexc {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
    }

    fn symbol(&self, ticker: &str, market: MarketKind) -> String {
        match market {
            MarketKind::Futures => format!("{}_USDT", ticker.to_uppercase()),
            _ => format!("{}USDT", ticker.to_uppercase()),
        }
    }

    fn ws_url(&self, _ticker: &str, market: MarketKind) -> String {
        match market {
            MarketKind::Futures => FUTURES_WS_URL.to_string(),
            _ => SPOT_WS_URL.to_string(),
        }
    }

    fn subscribe_frames(&self, ticker: &str, market: MarketKind) -> Vec<String> {
        match market {
            MarketKind::Futures => vec![json!({
                "method": "sub.ticker",
                "param": { "symbol": self.symbol(ticker, market) },
            })
            .to_string()],
            _ => vec![json!({
                "method": "SUBSCRIPTION",
                "params": [self.deals_topic(ticker)],
            })
            .to_string()],
        }
    }

    fn heartbeat_frame(&self, market: MarketKind) -> Option<String> {
        match market {
            MarketKind::Futures => Some(json!({"method": "ping"}).to_string()),
            _ => Some(json!({"method": "PING"}).to_string()),
        }
    }

    fn parse_text(&self, raw: &str, _ticker: &str, market: MarketKind) -> Inbound {
        if market != MarketKind::Futures {
            // Spot text frames are subscription acks and PONGs only.
            return Inbound::Ignore;
        }

        let push: ContractPush = match serde_json::from_str(raw) {
            Ok(push) => push,
            Err(_) => return Inbound::Ignore,
        };

        if push.method.as_deref() == Some("ping") {
            return Inbound::Reply(json!({"method": "pong"}).to_string());
        }

        if push.channel.as_deref() != Some("push.ticker") {
            // rs.sub.* acks, pong channel, anything else.
            return Inbound::Ignore;
        }

        let ticker_data: ContractTicker = match push
            .data
            .and_then(|d| serde_json::from_value(d).ok())
        {
            Some(data) => data,
            None => {
                warn!("mexc contract push.ticker with unexpected data shape");
                return Inbound::Ignore;
            }
        };

        if !ticker_data.last_price.is_finite() || ticker_data.last_price < 0.0 {
            return Inbound::Ignore;
        }

        let timestamp = ticker_data
            .timestamp
            .or(push.ts)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let mut sample = PriceSample::new(
            self.venue_id(market),
            ticker_data.symbol,
            ticker_data.last_price,
            market,
        )
        .with_timestamp(timestamp);
        if let Some(volume) = ticker_data.amount_24h.filter(|v| v.is_finite()) {
            sample = sample.with_volume(volume);
        }
        Inbound::Sample(sample)
    }

    fn parse_binary(
        &self,
        payload: &[u8],
        ticker: &str,
        market: MarketKind,
    ) -> Option<PriceSample> {
        let wrapper = codec::decode_wrapper(payload)?;
        let deal = wrapper.deals.into_iter().next()?;
        let price = parse_price(&deal.price)?;
        let symbol = wrapper
            .symbol
            .unwrap_or_else(|| self.symbol(ticker, market));

        Some(
            PriceSample::new(self.venue_id(market), symbol, price, market)
                .with_timestamp(deal.time),
        )
    }

    async fn check_listing(&self, client: &reqwest::Client, ticker: &str) -> ListingStatus {
        let spot_symbol = self.symbol(ticker, MarketKind::Spot);
        let futures_symbol = self.symbol(ticker, MarketKind::Futures);

        let spot = match client
            .get(SPOT_REST)
            .query(&[("symbol", spot_symbol.as_str())])
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp
                .json::<SpotExchangeInfo>()
                .await
                .map(|info| !info.symbols.is_empty())
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                warn!(symbol = %spot_symbol, error = %e, "mexc spot listing probe failed");
                false
            }
        };

        let futures = match client
            .get(FUTURES_REST)
            .query(&[("symbol", futures_symbol.as_str())])
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp
                .json::<ContractDetail>()
                .await
                .map(|detail| detail.success)
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                warn!(symbol = %futures_symbol, error = %e, "mexc futures listing probe failed");
                false
            }
        };

        ListingStatus {
            spot,
            futures,
            symbol: spot_symbol,
        }
    }
}
