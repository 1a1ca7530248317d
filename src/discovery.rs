//! Venue discovery: which exchanges actually list a ticker.
//!
//! Probes every supported exchange in parallel and turns the answers into
//! a ready-to-start [`MonitoringSpec`]. Chain probes are wired but
//! currently report nothing; on-chain pools arrive via custom config.

use futures_util::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::exchanges::all_venues;
use crate::models::{Exchange, ListingStatus, MonitoringSpec, VenueSelection};
use crate::onchain::{ChainConfig, CHAINS};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueListing {
    pub exchange: Exchange,
    #[serde(flatten)]
    pub listing: ListingStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainListing {
    pub chain: String,
    pub listed: bool,
}

/// Full discovery answer, also served verbatim over HTTP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub ticker: String,
    pub venues: Vec<VenueListing>,
    pub chains: Vec<ChainListing>,
    pub recommendations: Vec<String>,
    /// Absent when nothing lists the ticker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<MonitoringSpec>,
}

pub struct Discovery {
    client: reqwest::Client,
}

impl Discovery {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Probe all venues in parallel and assemble a spec from the hits.
    pub async fn discover(&self, ticker: &str, threshold_percent: f64) -> DiscoveryResult {
        let ticker = ticker.to_uppercase();

        let venues = all_venues();
        let probes = venues
            .iter()
            .map(|venue| venue.check_listing(&self.client, &ticker));
        let listings: Vec<ListingStatus> = join_all(probes).await;

        let venue_listings: Vec<VenueListing> = venues
            .iter()
            .zip(listings)
            .map(|(venue, listing)| VenueListing {
                exchange: venue.exchange(),
                listing,
            })
            .collect();

        let chain_listings: Vec<ChainListing> = CHAINS
            .iter()
            .map(|chain| ChainListing {
                chain: chain.slug.to_string(),
                listed: probe_chain_listing(chain, &ticker),
            })
            .collect();

        let selections: Vec<VenueSelection> = venue_listings
            .iter()
            .filter(|v| v.listing.any())
            .map(|v| VenueSelection {
                exchange: v.exchange,
                markets: v.listing.markets(),
            })
            .collect();

        let mut recommendations = Vec::new();
        for venue in &venue_listings {
            if venue.listing.any() {
                let mut markets = Vec::new();
                if venue.listing.spot {
                    markets.push("spot");
                }
                if venue.listing.futures {
                    markets.push("futures");
                }
                recommendations.push(format!(
                    "{} lists {} ({})",
                    venue.exchange,
                    venue.listing.symbol,
                    markets.join("+")
                ));
            }
        }
        if selections.is_empty() {
            recommendations.push(format!("{ticker} is not listed on any supported exchange"));
        }
        if chain_listings.iter().all(|c| !c.listed) {
            recommendations.push(
                "no on-chain pools discovered; supply pool addresses via custom config"
                    .to_string(),
            );
        }

        let spec = (!selections.is_empty()).then(|| MonitoringSpec {
            ticker: ticker.clone(),
            venues: selections,
            pools: Vec::new(),
            threshold_percent,
        });

        info!(
            ticker = %ticker,
            venues = spec.as_ref().map(|s| s.venues.len()).unwrap_or(0),
            "discovery finished"
        );

        DiscoveryResult {
            ticker,
            venues: venue_listings,
            chains: chain_listings,
            recommendations,
            spec,
        }
    }
}

/// Pool discovery per chain is not implemented; monitoring on-chain pools
/// requires explicit pair addresses.
fn probe_chain_listing(_chain: &ChainConfig, _ticker: &str) -> bool {
    false
}
