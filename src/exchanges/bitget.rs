//! Bitget adapter.
//!
//! Spot and USDT-futures share one public endpoint; the instType inside
//! the op/args subscribe frame routes the channel. Keepalive is a bare
//! "ping" text frame answered by "pong".

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::models::{Exchange, ListingStatus, MarketKind, PriceSample};

use super::{parse_price, Inbound, Venue};

const WS_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const SPOT_REST: &str = "https://api.bitget.com/api/v2/spot/public/symbols";
const FUTURES_REST: &str = "https://api.bitget.com/api/v2/mix/market/contracts";

pub struct Bitget;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    arg: Option<Arg>,
    #[serde(default)]
    data: Option<Vec<TickerData>>,
}

#[derive(Debug, Deserialize)]
struct Arg {
    #[serde(rename = "instType", default)]
    inst_type: Option<String>,
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "lastPr")]
    last_price: String,
    #[serde(rename = "quoteVolume", default)]
    quote_volume: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    data: Option<Vec<serde_json::Value>>,
}

impl Bitget {
    fn inst_type(market: MarketKind) -> &'static str {
        match market {
            MarketKind::Futures => "USDT-FUTURES",
            _ => "SPOT",
        }
    }
}

#[async_trait]
impl Venue for Bitget {
    fn exchange(&self) -> Exchange {
        Exchange::Bitget
    }

    fn symbol(&self, ticker: &str, _market: MarketKind) -> String {
        format!("{}USDT", ticker.to_uppercase())
    }

    fn ws_url(&self, _ticker: &str, _market: MarketKind) -> String {
        WS_URL.to_string()
    }

    fn subscribe_frames(&self, ticker: &str, market: MarketKind) -> Vec<String> {
        vec![json!({
            "op": "subscribe",
            "args": [{
                "instType": Self::inst_type(market),
                "channel": "ticker",
                "instId": self.symbol(ticker, market),
            }],
        })
        .to_string()]
    }

    fn heartbeat_frame(&self, _market: MarketKind) -> Option<String> {
        Some("ping".to_string())
    }

    fn parse_text(&self, raw: &str, _ticker: &str, market: MarketKind) -> Inbound {
        if raw == "pong" {
            return Inbound::Ignore;
        }

        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(_) => return Inbound::Ignore,
        };

        if envelope.op.as_deref() == Some("ping") {
            return Inbound::Reply(json!({"op": "pong"}).to_string());
        }

        // subscribe/error acks.
        if envelope.event.is_some() {
            return Inbound::Ignore;
        }

        let Some(arg) = envelope.arg else {
            return Inbound::Ignore;
        };
        if arg.channel.as_deref() != Some("ticker")
            || arg.inst_type.as_deref() != Some(Self::inst_type(market))
        {
            return Inbound::Ignore;
        }

        let Some(ticker_data) = envelope.data.and_then(|d| d.into_iter().next()) else {
            return Inbound::Ignore;
        };

        let Some(price) = parse_price(&ticker_data.last_price) else {
            warn!(raw = %ticker_data.last_price, "bitget ticker with unparseable price");
            return Inbound::Ignore;
        };

        let timestamp = ticker_data
            .ts
            .as_deref()
            .and_then(|ts| ts.parse::<i64>().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        let mut sample = PriceSample::new(self.venue_id(market), ticker_data.inst_id, price, market)
            .with_timestamp(timestamp);
        if let Some(volume) = ticker_data.quote_volume.as_deref().and_then(parse_price) {
            sample = sample.with_volume(volume);
        }
        Inbound::Sample(sample)
    }

    async fn check_listing(&self, client: &reqwest::Client, ticker: &str) -> ListingStatus {
        let symbol = self.symbol(ticker, MarketKind::Spot);

        let spot = probe(
            client,
            SPOT_REST,
            &[("symbol", symbol.as_str())],
        )
        .await;
        let futures = probe(
            client,
            FUTURES_REST,
            &[
                ("productType", "USDT-FUTURES"),
                ("symbol", symbol.as_str()),
            ],
        )
        .await;

        ListingStatus {
            spot,
            futures,
            symbol,
        }
    }
}

async fn probe(client: &reqwest::Client, base: &str, query: &[(&str, &str)]) -> bool {
    match client.get(base).query(query).send().await {
        Ok(resp) if resp.status().is_success() => resp
            .json::<RestEnvelope>()
            .await
            .map(|body| {
                body.code.as_deref() == Some("00000")
                    && body.data.map(|d| !d.is_empty()).unwrap_or(false)
            })
            .unwrap_or(false),
        Ok(_) => false,
        Err(e) => {
            warn!(base, error = %e, "bitget listing probe failed");
            false
        }
    }
}
