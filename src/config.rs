// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client-wide tunables.

use serde::{Deserialize, Serialize};

/// Options for the swap client.
///
/// All durations are in seconds. The defaults match the windows enforced by
/// the on-chain contracts; lowering them makes the client accept
/// authorizations and claims that are about to expire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwapOptions {
    /// Minimum remaining validity of a signed authorization.
    #[serde(default = "default_auth_grace_period")]
    pub auth_grace_period: u64,

    /// Additional slack required between an initialization and the swap expiry.
    #[serde(default = "default_claim_grace_period")]
    pub claim_grace_period: u64,

    /// Slack before the swap expiry after which the offerer treats the swap
    /// as refundable.
    #[serde(default = "default_refund_grace_period")]
    pub refund_grace_period: u64,

    /// Width of an L1 block window when paging over relay logs.
    #[serde(default = "default_log_blocks_limit")]
    pub log_blocks_limit: u64,

    /// Fan-out limit for intermediary polls during startup reconciliation.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Maximum tolerated deviation, in parts per million, between a quoted
    /// token amount and the oracle-derived expectation.
    #[serde(default = "default_max_allowed_fee_diff_ppm")]
    pub max_allowed_fee_diff_ppm: u64,
}

fn default_auth_grace_period() -> u64 {
    300
}

fn default_claim_grace_period() -> u64 {
    600
}

fn default_refund_grace_period() -> u64 {
    600
}

fn default_log_blocks_limit() -> u64 {
    2500
}

fn default_max_concurrent_requests() -> usize {
    16
}

fn default_max_allowed_fee_diff_ppm() -> u64 {
    10_000
}

impl Default for SwapOptions {
    fn default() -> Self {
        SwapOptions {
            auth_grace_period: default_auth_grace_period(),
            claim_grace_period: default_claim_grace_period(),
            refund_grace_period: default_refund_grace_period(),
            log_blocks_limit: default_log_blocks_limit(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_allowed_fee_diff_ppm: default_max_allowed_fee_diff_ppm(),
        }
    }
}
