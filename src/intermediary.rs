// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The market-maker (intermediary) HTTP API, as consumed by the swap engine.
//!
//! The transport lives outside this crate; the engine only depends on the
//! trait and the typed responses below.

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::SwapError, swap_data::EvmSwapData};

/// Fee quote attached to a lightning receive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingInfo {
    /// Flat fee in satoshis.
    pub base_fee_sats: u64,
    /// Proportional fee in parts per million.
    pub fee_ppm: u64,
}

/// Response to a payment-authorization poll.
///
/// Once the intermediary has observed the Bitcoin-side payment it returns
/// the signed authorization the user needs to commit the swap on chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    /// Whether the Bitcoin-side payment has been observed.
    pub is_paid: bool,
    /// The swap data the authorization covers; present once paid.
    pub data: Option<EvmSwapData>,
    /// Authorization prefix (one of the four transition prefixes).
    pub prefix: String,
    /// Authorization deadline, unix seconds.
    pub timeout: u64,
    /// Hex-encoded 65-byte signature.
    pub signature: String,
    /// Swap expiry, unix seconds.
    pub expiry: u64,
}

/// Response to a lightning receive request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightningReceive {
    /// The BOLT-11 payment request to pay.
    pub pr: String,
    /// Claim secret, when the intermediary discloses it up front.
    pub secret: Option<B256>,
    /// The intermediary's on-chain address.
    pub intermediary_key: Address,
    /// Total amount of tokens to be received.
    pub total: U256,
    /// Security deposit attached to the swap.
    pub security_deposit: U256,
    /// The intermediary's fee for this swap.
    pub swap_fee: U256,
    /// Fee quote used for client-side validation.
    pub pricing_info: PricingInfo,
    /// Opaque fee-rate tag echoed back on later requests.
    pub fee_rate: String,
}

/// The intermediary operations the swap engine consumes.
#[async_trait]
pub trait IntermediaryApi: Send + Sync {
    /// Polls whether the Bitcoin payment behind `pr` arrived and, if so,
    /// returns the signed initialization authorization.
    async fn get_payment_authorization(
        &self,
        url: &str,
        pr: &str,
        token: Address,
        offerer: Address,
        base_fee_sats: u64,
        fee_ppm: u64,
    ) -> Result<PaymentAuthorization, SwapError>;

    /// Requests a lightning invoice paying to `payment_hash`, to receive
    /// `amount_sats` worth of `token` on the EVM side.
    async fn receive_lightning(
        &self,
        url: &str,
        amount_sats: u64,
        claimer: Address,
        token: Address,
        payment_hash: B256,
    ) -> Result<LightningReceive, SwapError>;
}
