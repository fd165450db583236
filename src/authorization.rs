// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Timed, signed authorizations for swap transitions.
//!
//! An authorization is a signature over `keccak256(prefix ‖ commit_hash ‖
//! timeout)` carried off-chain and checked on-chain before the transition is
//! accepted. Verification here is pure: the caller supplies the wall clock
//! and the current on-chain commitment, so every rule is unit-testable.

use alloy_primitives::{keccak256, Address, Signature, B256, U256};

use crate::{error::SwapError, provider::EvmSignerExt, swap_data::EvmSwapData};

#[cfg(test)]
#[path = "unit_tests/authorization_tests.rs"]
mod authorization_tests;

/// Prefix for offerer-signed swap initializations.
pub const AUTH_PREFIX_INITIALIZE: &str = "initialize";

/// Prefix for claimer-signed initializations.
pub const AUTH_PREFIX_CLAIM_INITIALIZE: &str = "claim_initialize";

/// Prefix for cooperative refunds.
pub const AUTH_PREFIX_REFUND: &str = "refund";

/// Prefix for raw data signatures.
pub const AUTH_PREFIX_DATA: &str = "data";

/// The digest signed for an authorization: `keccak256` of the packed
/// concatenation of the prefix bytes, the swap commit hash and the timeout
/// as a big-endian `uint64`.
pub fn auth_message(prefix: &str, commit_hash: B256, timeout: u64) -> B256 {
    let mut buf = Vec::with_capacity(prefix.len() + 40);
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(commit_hash.as_slice());
    buf.extend_from_slice(&timeout.to_be_bytes());
    keccak256(&buf)
}

/// Signs an authorization for `swap` valid until `timeout`.
///
/// The digest goes through the standard personal-message envelope, so the
/// signature verifies with `ecrecover` of the EIP-191-prefixed digest.
pub fn sign_authorization(
    signer: &dyn EvmSignerExt,
    prefix: &str,
    swap: &EvmSwapData,
    timeout: u64,
) -> Result<Signature, SwapError> {
    let message = auth_message(prefix, swap.commit_hash(), timeout);
    signer.sign_message(message.as_slice())
}

/// Recovers the address that signed an authorization.
pub fn recover_authorization(
    prefix: &str,
    commit_hash: B256,
    timeout: u64,
    signature: &Signature,
) -> Result<Address, SwapError> {
    let message = auth_message(prefix, commit_hash, timeout);
    signature
        .recover_address_from_msg(message.as_slice())
        .map_err(|_| SwapError::SignatureVerification("Invalid signature".to_string()))
}

/// Packs the signature recovery byte and the timeout into the on-chain
/// submission word: `timeout << 8 | v`.
pub fn timeout_and_v(signature: &Signature, timeout: u64) -> U256 {
    let v = 27u8 + signature.v() as u8;
    U256::from(timeout) << 8 | U256::from(v)
}

/// Whether an authorization is past its hard deadline.
pub fn is_expired(timeout: u64, now: u64, auth_grace_period: u64) -> bool {
    now > timeout + auth_grace_period
}

/// Whether an authorization is close enough to its deadline that user
/// interfaces should treat it as expiring.
pub fn is_soft_expired(timeout: u64, now: u64, auth_grace_period: u64) -> bool {
    now > timeout.saturating_sub(auth_grace_period)
}

/// Verifies an `initialize` authorization signed by the swap's offerer.
///
/// `on_chain_commitment` is the contract's current commitment value at the
/// swap's payment hash; it must equal the record's `index` field, which ties
/// the authorization to one commitment slot generation (replay protection).
pub fn verify_initialize(
    prefix: &str,
    swap: &EvmSwapData,
    timeout: u64,
    signature: &Signature,
    now: u64,
    on_chain_commitment: U256,
    auth_grace_period: u64,
    claim_grace_period: u64,
) -> Result<(), SwapError> {
    check_prefix(prefix, AUTH_PREFIX_INITIALIZE)?;
    check_timeout(timeout, now, auth_grace_period)?;
    if swap.expiry().saturating_sub(now) < auth_grace_period + claim_grace_period {
        return Err(SwapError::SignatureVerification(
            "Swap expires too soon".to_string(),
        ));
    }
    check_nonce(swap, on_chain_commitment)?;
    check_signer(prefix, swap, timeout, signature, swap.offerer)
}

/// Verifies a `claim_initialize` authorization signed by the swap's claimer.
pub fn verify_claim_initialize(
    prefix: &str,
    swap: &EvmSwapData,
    timeout: u64,
    signature: &Signature,
    now: u64,
    on_chain_commitment: U256,
    auth_grace_period: u64,
) -> Result<(), SwapError> {
    check_prefix(prefix, AUTH_PREFIX_CLAIM_INITIALIZE)?;
    check_timeout(timeout, now, auth_grace_period)?;
    check_nonce(swap, on_chain_commitment)?;
    check_signer(prefix, swap, timeout, signature, swap.claimer)
}

/// Verifies a `refund` authorization signed by the swap's offerer.
pub fn verify_refund(
    prefix: &str,
    swap: &EvmSwapData,
    timeout: u64,
    signature: &Signature,
    now: u64,
    auth_grace_period: u64,
) -> Result<(), SwapError> {
    check_prefix(prefix, AUTH_PREFIX_REFUND)?;
    check_timeout(timeout, now, auth_grace_period)?;
    check_signer(prefix, swap, timeout, signature, swap.offerer)
}

fn check_prefix(prefix: &str, expected: &str) -> Result<(), SwapError> {
    if prefix != expected {
        return Err(SwapError::SignatureVerification(format!(
            "Invalid prefix: expected {expected:?}, got {prefix:?}"
        )));
    }
    Ok(())
}

fn check_timeout(timeout: u64, now: u64, auth_grace_period: u64) -> Result<(), SwapError> {
    if timeout.saturating_sub(now) < auth_grace_period {
        return Err(SwapError::SignatureVerification(
            "Authorization expired".to_string(),
        ));
    }
    Ok(())
}

fn check_nonce(swap: &EvmSwapData, on_chain_commitment: U256) -> Result<(), SwapError> {
    if on_chain_commitment != U256::from(swap.index()) {
        return Err(SwapError::SignatureVerification("Invalid nonce".to_string()));
    }
    Ok(())
}

fn check_signer(
    prefix: &str,
    swap: &EvmSwapData,
    timeout: u64,
    signature: &Signature,
    expected: Address,
) -> Result<(), SwapError> {
    let recovered = recover_authorization(prefix, swap.commit_hash(), timeout, signature)?;
    if recovered != expected {
        return Err(SwapError::SignatureVerification(
            "Invalid signature".to_string(),
        ));
    }
    Ok(())
}

/// Parses a persisted signature from its 65-byte hex form.
pub fn signature_from_hex(hex_str: &str) -> Result<Signature, SwapError> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|error| SwapError::InvalidArgument(format!("bad signature hex: {error}")))?;
    Signature::try_from(bytes.as_slice())
        .map_err(|error| SwapError::InvalidArgument(format!("bad signature: {error}")))
}

/// Hex-encodes a signature into its persisted 65-byte form.
pub fn signature_to_hex(signature: &Signature) -> String {
    format!("0x{}", hex::encode(signature.as_bytes()))
}
