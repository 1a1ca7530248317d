//! Binance adapter (spot + USDT-margined perpetual).
//!
//! Subscription rides entirely in the stream URL; both markets push the
//! same 24h rolling ticker shape. Protocol-level pings are answered by the
//! shared session loop.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::models::{Exchange, ListingStatus, MarketKind, PriceSample};

use super::{parse_price, Inbound, Venue};

const SPOT_WS_BASE: &str = "wss://stream.binance.com:9443/ws";
const FUTURES_WS_BASE: &str = "wss://fstream.binance.com/ws";
const SPOT_REST: &str = "https://api.binance.com/api/v3/ticker/price";
const FUTURES_REST: &str = "https://fapi.binance.com/fapi/v1/ticker/price";

pub struct Binance;

/// Rolling-window ticker event, same shape on spot and futures streams.
#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "q", default)]
    quote_volume: Option<String>,
}

/// Deserialized only to confirm the endpoint knows the symbol.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RestTicker {
    symbol: String,
    price: String,
}

#[async_trait]
impl Venue for Binance {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn symbol(&self, ticker: &str, _market: MarketKind) -> String {
        format!("{}USDT", ticker.to_uppercase())
    }

    fn ws_url(&self, ticker: &str, market: MarketKind) -> String {
        let stream = format!("{}usdt@ticker", ticker.to_lowercase());
        match market {
            MarketKind::Futures => format!("{FUTURES_WS_BASE}/{stream}"),
            _ => format!("{SPOT_WS_BASE}/{stream}"),
        }
    }

    fn subscribe_frames(&self, _ticker: &str, _market: MarketKind) -> Vec<String> {
        Vec::new()
    }

    fn parse_text(&self, raw: &str, _ticker: &str, market: MarketKind) -> Inbound {
        let event: TickerEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(_) => return Inbound::Ignore,
        };

        if event.event != "24hrTicker" {
            return Inbound::Ignore;
        }

        let Some(price) = parse_price(&event.last_price) else {
            warn!(raw = %event.last_price, "binance ticker with unparseable price");
            return Inbound::Ignore;
        };

        let mut sample = PriceSample::new(self.venue_id(market), event.symbol, price, market)
            .with_timestamp(event.event_time);
        if let Some(volume) = event.quote_volume.as_deref().and_then(parse_price) {
            sample = sample.with_volume(volume);
        }
        Inbound::Sample(sample)
    }

    async fn check_listing(&self, client: &reqwest::Client, ticker: &str) -> ListingStatus {
        let symbol = self.symbol(ticker, MarketKind::Spot);
        let spot = probe(client, SPOT_REST, &symbol).await;
        let futures = probe(client, FUTURES_REST, &symbol).await;
        ListingStatus {
            spot,
            futures,
            symbol,
        }
    }
}

async fn probe(client: &reqwest::Client, base: &str, symbol: &str) -> bool {
    let result = client
        .get(base)
        .query(&[("symbol", symbol)])
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => resp.json::<RestTicker>().await.is_ok(),
        Ok(_) => false,
        Err(e) => {
            warn!(symbol, error = %e, "binance listing probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_and_symbols() {
        let venue = Binance;
        assert_eq!(
            venue.ws_url("BTC", MarketKind::Spot),
            "wss://stream.binance.com:9443/ws/btcusdt@ticker"
        );
        assert_eq!(
            venue.ws_url("BTC", MarketKind::Futures),
            "wss://fstream.binance.com/ws/btcusdt@ticker"
        );
        assert_eq!(venue.symbol("btc", MarketKind::Spot), "BTCUSDT");
        assert!(venue.subscribe_frames("BTC", MarketKind::Spot).is_empty());
    }

    #[test]
    fn test_parse_ticker_event() {
        let venue = Binance;
        let raw = r#"{"e":"24hrTicker","E":1700000000123,"s":"BTCUSDT","c":"64250.10","q":"123456.7"}"#;
        match venue.parse_text(raw, "BTC", MarketKind::Spot) {
            Inbound::Sample(sample) => {
                assert_eq!(sample.venue, "binance");
                assert_eq!(sample.price, 64250.10);
                assert_eq!(sample.timestamp_ms, 1_700_000_000_123);
                assert_eq!(sample.volume_24h, Some(123456.7));
                assert_eq!(sample.market, MarketKind::Spot);
            }
            _ => panic!("expected sample"),
        }
    }

    #[test]
    fn test_non_ticker_events_ignored() {
        let venue = Binance;
        let raw = r#"{"e":"aggTrade","E":1,"s":"BTCUSDT","c":"1.0"}"#;
        assert!(matches!(
            venue.parse_text(raw, "BTC", MarketKind::Spot),
            Inbound::Ignore
        ));
        assert!(matches!(
            venue.parse_text("not json", "BTC", MarketKind::Spot),
            Inbound::Ignore
        ));
    }

    #[test]
    fn test_futures_venue_id_distinct() {
        let venue = Binance;
        let raw = r#"{"e":"24hrTicker","E":1,"s":"BTCUSDT","c":"64250.10"}"#;
        match venue.parse_text(raw, "BTC", MarketKind::Futures) {
            Inbound::Sample(sample) => assert_eq!(sample.venue, "binance-futures"),
            _ => panic!("expected sample"),
        }
    }
}
