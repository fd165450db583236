// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! BTC ↔ token price conversion and fee-tolerance validation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::SwapError;

#[cfg(test)]
#[path = "unit_tests/oracle_tests.rs"]
mod oracle_tests;

/// How long a fetched price stays fresh.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(10);

/// Denominator of parts-per-million fee rates.
const PPM: u64 = 1_000_000;

/// Pseudo-pair short-circuiting amount validation.
const PAIR_IGNORE: &str = "$ignore";

/// Pseudo-pair prefix pegging one token base unit to a fixed satoshi value.
const PAIR_FIXED_PREFIX: &str = "$fixed-";

/// An external BTC-denominated price index.
#[async_trait]
pub trait PriceApi: Send + Sync {
    /// The price of one whole token, in milli-satoshis.
    async fn fetch_price(&self, pair: &str) -> Result<U256, SwapError>;
}

/// Price index backed by an OKX-style `index-tickers` endpoint.
pub struct OkxPriceApi {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct IndexTickersResponse {
    data: Vec<IndexTicker>,
}

#[derive(Deserialize)]
struct IndexTicker {
    #[serde(rename = "idxPx")]
    idx_px: String,
}

impl OkxPriceApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        OkxPriceApi {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PriceApi for OkxPriceApi {
    async fn fetch_price(&self, pair: &str) -> Result<U256, SwapError> {
        let url = format!(
            "{}/api/v5/market/index-tickers?instId={}",
            self.base_url, pair
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SwapError::HttpResponse {
                status: response.status().as_u16(),
            });
        }
        let body: IndexTickersResponse = response.json().await?;
        let ticker = body.data.first().ok_or_else(|| {
            SwapError::InvalidArgument(format!("no index price returned for {pair}"))
        })?;
        // The index price is BTC per whole token; scale to milli-satoshis
        // (1e8 sats, 1e3 milli-sats).
        parse_decimal_scaled(&ticker.idx_px, 11)
    }
}

/// Pricing configuration of a single token.
#[derive(Clone, Debug)]
pub struct TokenPricing {
    /// The index pair to quote, or one of the `$fixed-<n>` / `$ignore`
    /// pseudo-pairs.
    pub pair: String,
    /// Decimals of the token contract.
    pub decimals: u8,
}

/// Converts between satoshis and token amounts with a short-lived price
/// cache, and validates quoted amounts against a tolerance.
pub struct PriceOracle {
    api: Arc<dyn PriceApi>,
    tokens: HashMap<Address, TokenPricing>,
    cache: Mutex<HashMap<String, (U256, Instant)>>,
    max_allowed_fee_diff_ppm: u64,
}

impl PriceOracle {
    pub fn new(
        api: Arc<dyn PriceApi>,
        tokens: HashMap<Address, TokenPricing>,
        max_allowed_fee_diff_ppm: u64,
    ) -> Self {
        PriceOracle {
            api,
            tokens,
            cache: Mutex::new(HashMap::new()),
            max_allowed_fee_diff_ppm,
        }
    }

    fn pricing_for(&self, token: Address) -> Result<&TokenPricing, SwapError> {
        self.tokens
            .get(&token)
            .ok_or_else(|| SwapError::InvalidArgument(format!("no pricing for token {token}")))
    }

    /// The milli-satoshi price of one whole token, from the cache when fresh.
    async fn price_for(&self, pricing: &TokenPricing) -> Result<U256, SwapError> {
        if let Some(fixed) = pricing.pair.strip_prefix(PAIR_FIXED_PREFIX) {
            let sats_per_unit: u64 = fixed.parse().map_err(|_| {
                SwapError::InvalidArgument(format!("bad fixed pair {:?}", pricing.pair))
            })?;
            return Ok(U256::from(sats_per_unit)
                * U256::from(1000)
                * U256::from(10).pow(U256::from(pricing.decimals)));
        }
        {
            let cache = self.cache.lock().await;
            if let Some((price, fetched_at)) = cache.get(&pricing.pair) {
                if fetched_at.elapsed() < PRICE_CACHE_TTL {
                    return Ok(*price);
                }
            }
        }
        let price = self.api.fetch_price(&pricing.pair).await?;
        self.cache
            .lock()
            .await
            .insert(pricing.pair.clone(), (price, Instant::now()));
        Ok(price)
    }

    /// Converts satoshis into token base units, at milli-satoshi precision.
    pub async fn get_from_btc(&self, sats: U256, token: Address) -> Result<U256, SwapError> {
        let pricing = self.pricing_for(token)?;
        let price = self.price_for(pricing).await?;
        if price.is_zero() {
            return Err(SwapError::InvalidArgument(format!(
                "zero price for pair {:?}",
                pricing.pair
            )));
        }
        Ok(sats * U256::from(10).pow(U256::from(pricing.decimals)) * U256::from(1000) / price)
    }

    /// Converts token base units into satoshis.
    pub async fn get_to_btc(&self, amount: U256, token: Address) -> Result<U256, SwapError> {
        let pricing = self.pricing_for(token)?;
        let price = self.price_for(pricing).await?;
        Ok(amount * price / (U256::from(10).pow(U256::from(pricing.decimals)) * U256::from(1000)))
    }

    /// Validates the token amount charged for sending `amount_sats`:
    /// the quoted fee is applied on top, the result converted through the
    /// oracle, and the deviation of `paid_token` above the expectation must
    /// stay within tolerance.
    pub async fn is_valid_amount_send(
        &self,
        amount_sats: u64,
        base_fee_sats: u64,
        fee_ppm: u64,
        paid_token: U256,
        token: Address,
    ) -> Result<bool, SwapError> {
        if self.pricing_for(token)?.pair == PAIR_IGNORE {
            return Ok(true);
        }
        let total_sats = U256::from(amount_sats) * U256::from(PPM + fee_ppm) / U256::from(PPM)
            + U256::from(base_fee_sats);
        let expected = self.get_from_btc(total_sats, token).await?;
        if expected.is_zero() {
            return Ok(paid_token.is_zero());
        }
        if paid_token <= expected {
            return Ok(true);
        }
        let diff_ppm = (paid_token - expected) * U256::from(PPM) / expected;
        Ok(diff_ppm <= U256::from(self.max_allowed_fee_diff_ppm))
    }

    /// Validates the token amount received for `amount_sats` paid in: the
    /// quoted fee is subtracted, and the shortfall of `paid_token` below the
    /// expectation must stay within tolerance.
    pub async fn is_valid_amount_receive(
        &self,
        amount_sats: u64,
        base_fee_sats: u64,
        fee_ppm: u64,
        paid_token: U256,
        token: Address,
    ) -> Result<bool, SwapError> {
        if self.pricing_for(token)?.pair == PAIR_IGNORE {
            return Ok(true);
        }
        let after_ppm =
            U256::from(amount_sats) * U256::from(PPM.saturating_sub(fee_ppm)) / U256::from(PPM);
        let total_sats = after_ppm.saturating_sub(U256::from(base_fee_sats));
        let expected = self.get_from_btc(total_sats, token).await?;
        if expected.is_zero() || paid_token >= expected {
            return Ok(true);
        }
        let diff_ppm = (expected - paid_token) * U256::from(PPM) / expected;
        Ok(diff_ppm <= U256::from(self.max_allowed_fee_diff_ppm))
    }
}

/// Parses a decimal string into an integer scaled by `10^scale`, truncating
/// excess fractional digits.
fn parse_decimal_scaled(value: &str, scale: usize) -> Result<U256, SwapError> {
    let mut parts = value.splitn(2, '.');
    let integer = parts.next().unwrap_or("");
    let fraction = parts.next().unwrap_or("");
    if integer.is_empty() && fraction.is_empty() {
        return Err(SwapError::InvalidArgument(format!(
            "bad decimal number {value:?}"
        )));
    }
    let mut digits = String::with_capacity(integer.len() + scale);
    digits.push_str(integer);
    for i in 0..scale {
        digits.push(fraction.as_bytes().get(i).copied().unwrap_or(b'0') as char);
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10)
        .map_err(|_| SwapError::InvalidArgument(format!("bad decimal number {value:?}")))
}
