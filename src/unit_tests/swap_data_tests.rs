// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use alloy_primitives::{keccak256, Address, B256, U256};
use assert_matches::assert_matches;
use proptest::prelude::*;

use super::*;
use crate::test_utils::swap_data_fixture;

fn fields_fixture() -> SwapDataFields {
    SwapDataFields {
        expiry: 1_800_000_000,
        nonce: 0xdead_beef,
        confirmations: 6,
        kind: SwapKind::ChainNonced,
        pay_in: true,
        pay_out: false,
        index: 9,
    }
}

#[test]
fn test_pack_unpack_roundtrip() {
    let fields = fields_fixture();
    assert_eq!(SwapDataFields::unpack(fields.pack()).unwrap(), fields);
}

#[test]
fn test_packed_layout_positions() {
    let fields = fields_fixture();
    let data = fields.pack();
    assert_eq!((data & U256::from(u64::MAX)).to::<u64>(), fields.expiry);
    assert_eq!(((data >> 64) & U256::from(u64::MAX)).to::<u64>(), fields.nonce);
    assert_eq!(((data >> 128) & U256::from(u16::MAX)).to::<u16>(), 6);
    assert_eq!(((data >> 144) & U256::from(u8::MAX)).to::<u8>(), 2);
    assert_eq!(((data >> 152) & U256::from(u8::MAX)).to::<u8>(), 1);
    assert_eq!(((data >> 160) & U256::from(u8::MAX)).to::<u8>(), 0);
    assert_eq!(((data >> 168) & U256::from(u8::MAX)).to::<u8>(), 9);
    // Nothing above bit 176.
    assert_eq!(data >> 176, U256::ZERO);
}

#[test]
fn test_unpack_rejects_unknown_kind() {
    let data = U256::from(250u8) << 144;
    assert_matches!(
        SwapDataFields::unpack(data),
        Err(SwapError::InvalidArgument(_))
    );
}

#[test]
fn test_record_accessors() {
    let swap = swap_data_fixture(B256::repeat_byte(0x77), 1_800_000_000, 4);
    assert_eq!(swap.expiry(), 1_800_000_000);
    assert_eq!(swap.nonce(), 7);
    assert_eq!(swap.confirmations(), 3);
    assert_eq!(swap.kind().unwrap(), SwapKind::Htlc);
    assert!(!swap.pay_in());
    assert!(swap.pay_out());
    assert_eq!(swap.index(), 4);
    assert!(swap.is_native());
}

#[test]
fn test_commit_hash_matches_manual_abi_encoding() {
    let swap = swap_data_fixture(B256::repeat_byte(0x77), 1_800_000_000, 4);
    // The ABI tuple of eight static fields is the plain concatenation of
    // their 32-byte words.
    let mut encoded = Vec::with_capacity(256);
    for address in [swap.offerer, swap.claimer, swap.token] {
        encoded.extend_from_slice(&[0u8; 12]);
        encoded.extend_from_slice(address.as_slice());
    }
    encoded.extend_from_slice(&swap.amount.to_be_bytes::<32>());
    encoded.extend_from_slice(swap.payment_hash.as_slice());
    encoded.extend_from_slice(&swap.data.to_be_bytes::<32>());
    encoded.extend_from_slice(&swap.security_deposit.to_be_bytes::<32>());
    encoded.extend_from_slice(&swap.claimer_bounty.to_be_bytes::<32>());
    assert_eq!(encoded.len(), 256);
    assert_eq!(swap.commit_hash(), keccak256(&encoded));
}

#[test]
fn test_commit_hash_is_field_sensitive() {
    let swap = swap_data_fixture(B256::repeat_byte(0x77), 1_800_000_000, 4);
    let mut other = swap.clone();
    other.amount += U256::ONE;
    assert_ne!(swap.commit_hash(), other.commit_hash());
    let mut other = swap.clone();
    other.data = SwapDataFields {
        index: 5,
        ..other.fields().unwrap()
    }
    .pack();
    assert_ne!(swap.commit_hash(), other.commit_hash());
}

#[test]
fn test_txo_hash_widths() {
    let script = [0x00u8, 0x14, 0xaa, 0xbb];
    let amount = 0x0102_0304_0506_0708u64;
    let mut expected = Vec::new();
    expected.extend_from_slice(&amount.to_le_bytes());
    expected.extend_from_slice(&script);
    assert_eq!(txo_hash(&script, amount), keccak256(&expected));
}

#[test]
fn test_hash_for_onchain_nonce_endianness() {
    let script = [0x51u8];
    let amount = 5000;
    let nonce = 0x1122_3344_5566_7788u64;
    let inner = txo_hash(&script, amount);
    let mut outer = Vec::new();
    outer.extend_from_slice(&nonce.to_be_bytes());
    outer.extend_from_slice(inner.as_slice());
    assert_eq!(hash_for_onchain(&script, amount, nonce), keccak256(&outer));
}

#[test]
fn test_serde_record_roundtrip() {
    let mut swap = swap_data_fixture(B256::repeat_byte(0x77), 1_800_000_000, 4);
    swap.txo_hash = Some(B256::repeat_byte(0x42));
    let value = serde_json::to_value(&swap).unwrap();
    assert_eq!(value["type"], "evm");
    assert!(value["paymentHash"].is_string());
    assert_eq!(EvmSwapData::from_serialized(&value).unwrap(), swap);
}

#[test]
fn test_from_serialized_rejects_foreign_records() {
    let swap = swap_data_fixture(B256::repeat_byte(0x77), 1_800_000_000, 4);
    let mut value = serde_json::to_value(&swap).unwrap();
    value["type"] = serde_json::Value::String("solana".to_string());
    assert_matches!(
        EvmSwapData::from_serialized(&value),
        Err(SwapError::InvalidArgument(_))
    );
}

#[test]
fn test_paid_commitment_constant() {
    assert_eq!(COMMITMENT_PAID, U256::from(0x100u64));
}

#[test]
fn test_structural_equality_detects_divergence() {
    let swap = swap_data_fixture(B256::repeat_byte(0x77), 1_800_000_000, 4);
    let mut other = swap.clone();
    assert_eq!(swap, other);
    other.security_deposit += U256::ONE;
    assert_ne!(swap, other);
}

proptest! {
    #[test]
    fn test_pack_unpack_roundtrip_proptest(
        expiry in any::<u64>(),
        nonce in any::<u64>(),
        confirmations in any::<u16>(),
        kind in 0u8..=3,
        pay_in in any::<bool>(),
        pay_out in any::<bool>(),
        index in any::<u8>(),
    ) {
        let fields = SwapDataFields {
            expiry,
            nonce,
            confirmations,
            kind: SwapKind::try_from(kind).unwrap(),
            pay_in,
            pay_out,
            index,
        };
        prop_assert_eq!(SwapDataFields::unpack(fields.pack()).unwrap(), fields);
    }
}
