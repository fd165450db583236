// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

use alloy_primitives::{Address, U256};
use assert_matches::assert_matches;

use super::*;

const NATIVE: Address = Address::ZERO;
const MAX_DIFF_PPM: u64 = 10_000; // 1%

/// A counting price api with a fixed answer.
struct FixedPriceApi {
    price: U256,
    fetches: AtomicUsize,
}

#[async_trait]
impl PriceApi for FixedPriceApi {
    async fn fetch_price(&self, _pair: &str) -> Result<U256, SwapError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.price)
    }
}

fn oracle_with(pair: &str, decimals: u8, api: Arc<dyn PriceApi>) -> PriceOracle {
    let tokens = [(
        NATIVE,
        TokenPricing {
            pair: pair.to_string(),
            decimals,
        },
    )]
    .into_iter()
    .collect();
    PriceOracle::new(api, tokens, MAX_DIFF_PPM)
}

fn fixed_unit_oracle() -> PriceOracle {
    // $fixed-1 with zero decimals: one token base unit == one satoshi.
    oracle_with(
        "$fixed-1",
        0,
        Arc::new(FixedPriceApi {
            price: U256::ZERO,
            fetches: AtomicUsize::new(0),
        }),
    )
}

#[test]
fn test_parse_decimal_scaled() {
    assert_eq!(
        parse_decimal_scaled("0.05", 11).unwrap(),
        U256::from(5_000_000_000u64)
    );
    assert_eq!(
        parse_decimal_scaled("1", 11).unwrap(),
        U256::from(100_000_000_000u64)
    );
    assert_eq!(parse_decimal_scaled("0", 11).unwrap(), U256::ZERO);
    // Excess fractional digits are truncated.
    assert_eq!(parse_decimal_scaled("0.123456789012345", 11).unwrap(), U256::from(12_345_678_901u64));
    assert_matches!(
        parse_decimal_scaled("", 11),
        Err(SwapError::InvalidArgument(_))
    );
    assert_matches!(
        parse_decimal_scaled("12a.5", 11),
        Err(SwapError::InvalidArgument(_))
    );
}

#[tokio::test]
async fn test_fixed_pair_pegs_unit_to_sats() {
    let oracle = fixed_unit_oracle();
    assert_eq!(
        oracle.get_from_btc(U256::from(1_000u64), NATIVE).await.unwrap(),
        U256::from(1_000u64)
    );
    assert_eq!(
        oracle.get_to_btc(U256::from(1_000u64), NATIVE).await.unwrap(),
        U256::from(1_000u64)
    );

    // $fixed-5: one unit is worth five sats.
    let oracle = oracle_with(
        "$fixed-5",
        0,
        Arc::new(FixedPriceApi {
            price: U256::ZERO,
            fetches: AtomicUsize::new(0),
        }),
    );
    assert_eq!(
        oracle.get_from_btc(U256::from(1_000u64), NATIVE).await.unwrap(),
        U256::from(200u64)
    );
}

#[tokio::test]
async fn test_price_cache_suppresses_refetches() {
    let api = Arc::new(FixedPriceApi {
        price: U256::from(5_000_000_000u64),
        fetches: AtomicUsize::new(0),
    });
    let oracle = oracle_with("ETH-BTC", 18, api.clone());
    oracle.get_from_btc(U256::from(1_000u64), NATIVE).await.unwrap();
    oracle.get_from_btc(U256::from(2_000u64), NATIVE).await.unwrap();
    oracle.get_to_btc(U256::from(42u64), NATIVE).await.unwrap();
    assert_eq!(api.fetches.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_ignore_pair_short_circuits_validation() {
    let api = Arc::new(FixedPriceApi {
        price: U256::from(1u64),
        fetches: AtomicUsize::new(0),
    });
    let oracle = oracle_with(PAIR_IGNORE, 6, api.clone());
    assert!(oracle
        .is_valid_amount_send(100_000, 10, 1_000, U256::MAX, NATIVE)
        .await
        .unwrap());
    assert!(oracle
        .is_valid_amount_receive(100_000, 10, 1_000, U256::ZERO, NATIVE)
        .await
        .unwrap());
    assert_eq!(api.fetches.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_send_amount_validation() {
    let oracle = fixed_unit_oracle();
    // total = 100_000 * 1_001_000 / 1_000_000 + 10 = 100_110 sats.
    let expected = U256::from(100_110u64);
    assert!(oracle
        .is_valid_amount_send(100_000, 10, 1_000, expected, NATIVE)
        .await
        .unwrap());
    // Underpaying the fee is always fine.
    assert!(oracle
        .is_valid_amount_send(100_000, 10, 1_000, expected - U256::from(500u64), NATIVE)
        .await
        .unwrap());
    // 0.5% over: inside the 1% tolerance.
    let over = expected + expected / U256::from(200u64);
    assert!(oracle
        .is_valid_amount_send(100_000, 10, 1_000, over, NATIVE)
        .await
        .unwrap());
    // 2% over: outside.
    let over = expected + expected / U256::from(50u64);
    assert!(!oracle
        .is_valid_amount_send(100_000, 10, 1_000, over, NATIVE)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_receive_amount_validation() {
    let oracle = fixed_unit_oracle();
    // total = 100_000 * 999_000 / 1_000_000 - 10 = 99_890 sats.
    let expected = U256::from(99_890u64);
    assert!(oracle
        .is_valid_amount_receive(100_000, 10, 1_000, expected, NATIVE)
        .await
        .unwrap());
    // Receiving more than expected is fine.
    assert!(oracle
        .is_valid_amount_receive(100_000, 10, 1_000, expected + U256::ONE, NATIVE)
        .await
        .unwrap());
    // 0.5% short: inside tolerance.
    let short = expected - expected / U256::from(200u64);
    assert!(oracle
        .is_valid_amount_receive(100_000, 10, 1_000, short, NATIVE)
        .await
        .unwrap());
    // 2% short: outside.
    let short = expected - expected / U256::from(50u64);
    assert!(!oracle
        .is_valid_amount_receive(100_000, 10, 1_000, short, NATIVE)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let oracle = fixed_unit_oracle();
    assert_matches!(
        oracle
            .get_from_btc(U256::from(1u64), Address::repeat_byte(0x70))
            .await,
        Err(SwapError::InvalidArgument(_))
    );
}
