// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use alloy_primitives::{keccak256, B256, U256};
use alloy_signer_local::PrivateKeySigner;
use assert_matches::assert_matches;

use super::*;
use crate::{test_utils::swap_data_fixture, util::unix_now};

const AUTH_GRACE: u64 = 300;
const CLAIM_GRACE: u64 = 600;

/// A swap whose offerer is the given signer, expiring comfortably late.
fn offerer_swap(signer: &PrivateKeySigner, index: u8) -> EvmSwapData {
    let mut swap = swap_data_fixture(B256::repeat_byte(0x55), unix_now() + 86_400, index);
    swap.offerer = signer.address();
    swap
}

#[test]
fn test_auth_message_layout() {
    let commit_hash = B256::repeat_byte(0x33);
    let timeout = 1_234_567u64;
    let mut packed = Vec::new();
    packed.extend_from_slice(b"initialize");
    packed.extend_from_slice(commit_hash.as_slice());
    packed.extend_from_slice(&timeout.to_be_bytes());
    assert_eq!(
        auth_message(AUTH_PREFIX_INITIALIZE, commit_hash, timeout),
        keccak256(&packed)
    );
}

#[test]
fn test_sign_and_verify_initialize() {
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let now = unix_now();
    let timeout = now + 3_600;
    let signature = sign_authorization(&signer, AUTH_PREFIX_INITIALIZE, &swap, timeout).unwrap();
    verify_initialize(
        AUTH_PREFIX_INITIALIZE,
        &swap,
        timeout,
        &signature,
        now,
        U256::ZERO,
        AUTH_GRACE,
        CLAIM_GRACE,
    )
    .unwrap();
}

#[test]
fn test_expired_authorization_is_rejected() {
    // timeout - now == 200 < 300 == auth grace period.
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let now = unix_now();
    let timeout = now + 200;
    let signature = sign_authorization(&signer, AUTH_PREFIX_INITIALIZE, &swap, timeout).unwrap();
    let result = verify_initialize(
        AUTH_PREFIX_INITIALIZE,
        &swap,
        timeout,
        &signature,
        now,
        U256::ZERO,
        AUTH_GRACE,
        CLAIM_GRACE,
    );
    assert_matches!(
        result,
        Err(SwapError::SignatureVerification(message))
            if message == "Authorization expired"
    );
}

#[test]
fn test_replay_protection_rejects_stale_index() {
    // The contract's commitment counter moved to 7 but the record was
    // created against 6.
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 6);
    let now = unix_now();
    let timeout = now + 3_600;
    let signature = sign_authorization(&signer, AUTH_PREFIX_INITIALIZE, &swap, timeout).unwrap();
    let result = verify_initialize(
        AUTH_PREFIX_INITIALIZE,
        &swap,
        timeout,
        &signature,
        now,
        U256::from(7u64),
        AUTH_GRACE,
        CLAIM_GRACE,
    );
    assert_matches!(
        result,
        Err(SwapError::SignatureVerification(message)) if message == "Invalid nonce"
    );
}

#[test]
fn test_swap_expiring_too_soon_is_rejected() {
    let signer = PrivateKeySigner::random();
    let mut swap = offerer_swap(&signer, 0);
    let now = unix_now();
    // Expiry inside auth + claim grace.
    let fields = crate::swap_data::SwapDataFields {
        expiry: now + AUTH_GRACE + CLAIM_GRACE - 10,
        ..swap.fields().unwrap()
    };
    swap.data = fields.pack();
    let timeout = now + 3_600;
    let signature = sign_authorization(&signer, AUTH_PREFIX_INITIALIZE, &swap, timeout).unwrap();
    let result = verify_initialize(
        AUTH_PREFIX_INITIALIZE,
        &swap,
        timeout,
        &signature,
        now,
        U256::ZERO,
        AUTH_GRACE,
        CLAIM_GRACE,
    );
    assert_matches!(
        result,
        Err(SwapError::SignatureVerification(message)) if message == "Swap expires too soon"
    );
}

#[test]
fn test_wrong_signer_is_rejected() {
    let signer = PrivateKeySigner::random();
    let impostor = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let now = unix_now();
    let timeout = now + 3_600;
    let signature = sign_authorization(&impostor, AUTH_PREFIX_INITIALIZE, &swap, timeout).unwrap();
    let result = verify_initialize(
        AUTH_PREFIX_INITIALIZE,
        &swap,
        timeout,
        &signature,
        now,
        U256::ZERO,
        AUTH_GRACE,
        CLAIM_GRACE,
    );
    assert_matches!(
        result,
        Err(SwapError::SignatureVerification(message)) if message == "Invalid signature"
    );
}

#[test]
fn test_wrong_prefix_is_rejected() {
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let now = unix_now();
    let timeout = now + 3_600;
    let signature = sign_authorization(&signer, AUTH_PREFIX_REFUND, &swap, timeout).unwrap();
    let result = verify_initialize(
        AUTH_PREFIX_REFUND,
        &swap,
        timeout,
        &signature,
        now,
        U256::ZERO,
        AUTH_GRACE,
        CLAIM_GRACE,
    );
    assert_matches!(result, Err(SwapError::SignatureVerification(_)));
}

#[test]
fn test_claim_initialize_recovers_claimer() {
    let signer = PrivateKeySigner::random();
    let mut swap = swap_data_fixture(B256::repeat_byte(0x55), unix_now() + 86_400, 0);
    swap.claimer = signer.address();
    let now = unix_now();
    let timeout = now + 3_600;
    let signature =
        sign_authorization(&signer, AUTH_PREFIX_CLAIM_INITIALIZE, &swap, timeout).unwrap();
    verify_claim_initialize(
        AUTH_PREFIX_CLAIM_INITIALIZE,
        &swap,
        timeout,
        &signature,
        now,
        U256::ZERO,
        AUTH_GRACE,
    )
    .unwrap();
}

#[test]
fn test_refund_authorization() {
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let now = unix_now();
    let timeout = now + 3_600;
    let signature = sign_authorization(&signer, AUTH_PREFIX_REFUND, &swap, timeout).unwrap();
    verify_refund(AUTH_PREFIX_REFUND, &swap, timeout, &signature, now, AUTH_GRACE).unwrap();
}

#[test]
fn test_timeout_and_v_packing() {
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let timeout = 1_900_000_000u64;
    let signature =
        sign_authorization(&signer, AUTH_PREFIX_INITIALIZE, &swap, timeout).unwrap();
    let packed = timeout_and_v(&signature, timeout);
    assert_eq!((packed >> 8).to::<u64>(), timeout);
    let v = (packed & U256::from(0xffu64)).to::<u8>();
    assert!(v == 27 || v == 28);
}

#[test]
fn test_expiry_windows() {
    assert!(!is_expired(1_000, 1_200, 300));
    assert!(!is_expired(1_000, 1_300, 300));
    assert!(is_expired(1_000, 1_301, 300));
    assert!(!is_soft_expired(1_000, 700, 300));
    assert!(is_soft_expired(1_000, 701, 300));
}

#[test]
fn test_signature_hex_roundtrip() {
    let signer = PrivateKeySigner::random();
    let swap = offerer_swap(&signer, 0);
    let signature =
        sign_authorization(&signer, AUTH_PREFIX_INITIALIZE, &swap, 1_900_000_000).unwrap();
    let hex_form = signature_to_hex(&signature);
    assert_eq!(signature_from_hex(&hex_form).unwrap(), signature);
}
