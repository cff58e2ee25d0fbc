use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::types::{OptionContract, OptionType};
use super::OptionsSource;

#[derive(Debug, Deserialize)]
struct OptionsIndexResponse {
    #[serde(default)]
    result: Vec<OptionsIndexEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct OptionsIndexEntry {
    symbol: String,
    contract_type: String,
    strike_price: Option<String>,
    mark_price: Option<String>,
    last_price: Option<String>,
    expiry_date: Option<String>,
    volume_24h: Option<u64>,
    open_interest: Option<u64>,
}

/// REST client for the Delta options index, normalized into
/// [`OptionContract`] entries usable by the implied-volatility solve.
pub struct DeltaOptionsClient {
    client: Client,
    base_url: String,
}

impl DeltaOptionsClient {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn options_chain(&self, underlying: &str) -> Result<Vec<OptionContract>> {
        let url = format!("{}/v2/options/index", self.base_url);
        let response: OptionsIndexResponse = self
            .client
            .get(&url)
            .query(&[("underlying_asset", underlying), ("contract_type", "call_put")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("failed to parse delta options index for {underlying}"))?;

        let now = Utc::now();
        Ok(response
            .result
            .into_iter()
            .filter_map(|entry| normalize_entry(entry, now))
            .collect())
    }
}

#[async_trait]
impl OptionsSource for DeltaOptionsClient {
    async fn options_chain(&self, underlying: &str) -> Result<Vec<OptionContract>> {
        DeltaOptionsClient::options_chain(self, underlying).await
    }
}

/// Entries with no usable price or an expiry in the past are dropped; one bad
/// entry never poisons the rest of the chain.
fn normalize_entry(entry: OptionsIndexEntry, now: DateTime<Utc>) -> Option<OptionContract> {
    let option_type = match entry.contract_type.to_ascii_lowercase().as_str() {
        "call" | "call_options" => OptionType::Call,
        "put" | "put_options" => OptionType::Put,
        other => {
            debug!(contract_type = other, symbol = %entry.symbol, "skipping unknown contract type");
            return None;
        }
    };

    let strike = entry.strike_price.as_deref()?.parse::<f64>().ok()?;
    let price = entry
        .mark_price
        .or(entry.last_price)?
        .parse::<f64>()
        .ok()?;
    let expiration_days = entry
        .expiry_date
        .as_deref()
        .and_then(|raw| days_to_expiry(raw, now))
        .unwrap_or(0.0);

    if price <= 0.0 || expiration_days <= 0.0 {
        return None;
    }

    Some(OptionContract {
        symbol: entry.symbol,
        strike,
        option_type,
        price,
        expiration_days,
        volume: entry.volume_24h.unwrap_or(0),
        open_interest: entry.open_interest.unwrap_or(0),
    })
}

fn days_to_expiry(raw: &str, now: DateTime<Utc>) -> Option<f64> {
    let expiry = raw.parse::<DateTime<Utc>>().ok().or_else(|| {
        // Bare expiry dates settle at noon UTC.
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(12, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })?;
    Some((expiry - now).num_seconds() as f64 / 86_400.0)
}
