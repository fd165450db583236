// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the swap client.

use alloy_primitives::TxHash;
use thiserror::Error;

/// Error type for swap client operations.
#[derive(Debug, Error)]
pub enum SwapError {
    /// A signed authorization failed one of its preconditions.
    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    /// A local preflight check on swap data failed.
    #[error("Swap data verification failed: {0}")]
    SwapDataVerification(String),

    /// The allowance/prepare step of an initialization cannot be constructed.
    #[error("Cannot prepare token account/allowance: {0}")]
    CannotInitializeAta(String),

    /// An on-chain revert was observed for the given transaction.
    #[error("Transaction reverted: {0}")]
    TxReverted(TxHash),

    /// The intermediary rejected the request or declared a timeout.
    #[error("Payment authorization error: {0}")]
    PaymentAuth(String),

    /// The relay has not reached the height required for an SPV claim.
    #[error("Relay not synchronized: at height {current}, required {required}")]
    NotSynchronized { current: u32, required: u32 },

    /// Non-2xx response from the intermediary or the price oracle.
    #[error("HTTP error response: status {status}")]
    HttpResponse { status: u16 },

    /// The operation was cancelled cooperatively.
    #[error("Operation cancelled")]
    Cancelled,

    /// A local contract (argument precondition) was violated.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A raw or stored block header failed to parse.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// RPC transport error from the EVM node.
    #[error(transparent)]
    Rpc(#[from] alloy::transports::TransportError),

    /// Signer error.
    #[error(transparent)]
    Signer(#[from] alloy_signer::Error),

    /// ABI decoding error.
    #[error(transparent)]
    AbiDecode(#[from] alloy_sol_types::Error),

    /// HTTP transport error.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Url parse error.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// Json (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Bitcoin RPC error.
    #[error("Bitcoin RPC error: {0}")]
    BitcoinRpc(String),
}

impl SwapError {
    /// Whether a retry with the same inputs can possibly succeed.
    ///
    /// Signature failures, local precondition violations and cancellations are
    /// final; transport-level failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::Rpc(_)
                | SwapError::Http(_)
                | SwapError::HttpResponse { .. }
                | SwapError::BitcoinRpc(_)
        )
    }
}
