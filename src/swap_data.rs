// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The swap record, its packed 256-bit `data` field and the canonical
//! commitment hashing that binds a record to an on-chain slot.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};

use crate::{contract::SwapCommitment, error::SwapError};

#[cfg(test)]
#[path = "unit_tests/swap_data_tests.rs"]
mod swap_data_tests;

/// The commitment value marking a swap as paid out.
pub const COMMITMENT_PAID: U256 = U256::from_limbs([0x100, 0, 0, 0]);

/// The claim condition of a swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapKind {
    /// Hash-time locked: claimed with a secret whose hash is the payment hash.
    Htlc = 0,
    /// Claimed with an SPV proof of a transaction paying a known output.
    Chain = 1,
    /// Like `Chain`, with a nonce committed into the transaction.
    ChainNonced = 2,
    /// Claimed with an SPV proof of a specific transaction id.
    ChainTxId = 3,
}

impl TryFrom<u8> for SwapKind {
    type Error = SwapError;

    fn try_from(value: u8) -> Result<Self, SwapError> {
        match value {
            0 => Ok(SwapKind::Htlc),
            1 => Ok(SwapKind::Chain),
            2 => Ok(SwapKind::ChainNonced),
            3 => Ok(SwapKind::ChainTxId),
            other => Err(SwapError::InvalidArgument(format!(
                "unknown swap kind {other}"
            ))),
        }
    }
}

/// The unpacked view of the `data` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapDataFields {
    /// Unix expiry of the swap, in seconds.
    pub expiry: u64,
    /// Escrow nonce.
    pub nonce: u64,
    /// Bitcoin confirmations required for an SPV claim.
    pub confirmations: u16,
    /// The claim condition.
    pub kind: SwapKind,
    /// Whether the offerer funds the swap directly (instead of from balance).
    pub pay_in: bool,
    /// Whether the claimer is paid out directly (instead of to balance).
    pub pay_out: bool,
    /// The on-chain commitment number at creation time; replay protection.
    pub index: u8,
}

impl SwapDataFields {
    /// Packs the fields into the 256-bit on-chain layout, lowest bit first:
    /// expiry (64), nonce (64), confirmations (16), kind (8), pay-in (8),
    /// pay-out (8), index (8).
    pub fn pack(&self) -> U256 {
        U256::from(self.expiry)
            | U256::from(self.nonce) << 64
            | U256::from(self.confirmations) << 128
            | U256::from(self.kind as u8) << 144
            | U256::from(self.pay_in as u8) << 152
            | U256::from(self.pay_out as u8) << 160
            | U256::from(self.index) << 168
    }

    /// Unpacks the 256-bit layout. Fails on an unknown kind byte.
    pub fn unpack(data: U256) -> Result<Self, SwapError> {
        Ok(SwapDataFields {
            expiry: (data & U256::from(u64::MAX)).to::<u64>(),
            nonce: ((data >> 64) & U256::from(u64::MAX)).to::<u64>(),
            confirmations: ((data >> 128) & U256::from(u16::MAX)).to::<u16>(),
            kind: SwapKind::try_from(((data >> 144) & U256::from(u8::MAX)).to::<u8>())?,
            pay_in: ((data >> 152) & U256::from(u8::MAX)) != U256::ZERO,
            pay_out: ((data >> 160) & U256::from(u8::MAX)) != U256::ZERO,
            index: ((data >> 168) & U256::from(u8::MAX)).to::<u8>(),
        })
    }
}

/// A swap record on the EVM side of the protocol.
///
/// Equality is structural over all persisted fields; event reconciliation
/// relies on it to detect divergence between a persisted record and data
/// recovered from chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmSwapData {
    /// Record discriminator for the persisted form.
    #[serde(rename = "type", default = "record_type")]
    pub record_type: String,
    pub offerer: Address,
    pub claimer: Address,
    /// Token contract; the zero address denotes the native currency.
    pub token: Address,
    pub amount: U256,
    pub payment_hash: B256,
    /// The packed field layout described by [`SwapDataFields`].
    pub data: U256,
    pub security_deposit: U256,
    pub claimer_bounty: U256,
    pub txo_hash: Option<B256>,
}

fn record_type() -> String {
    "evm".to_string()
}

impl EvmSwapData {
    /// Builds a record from explicit fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_fields(
        offerer: Address,
        claimer: Address,
        token: Address,
        amount: U256,
        payment_hash: B256,
        fields: SwapDataFields,
        security_deposit: U256,
        claimer_bounty: U256,
        txo_hash: Option<B256>,
    ) -> Self {
        EvmSwapData {
            record_type: record_type(),
            offerer,
            claimer,
            token,
            amount,
            payment_hash,
            data: fields.pack(),
            security_deposit,
            claimer_bounty,
            txo_hash,
        }
    }

    /// Rebuilds a record from its persisted JSON form.
    pub fn from_serialized(record: &serde_json::Value) -> Result<Self, SwapError> {
        let data: EvmSwapData = serde_json::from_value(record.clone())?;
        if data.record_type != "evm" {
            return Err(SwapError::InvalidArgument(format!(
                "unexpected swap record type {:?}",
                data.record_type
            )));
        }
        Ok(data)
    }

    /// The unpacked view of the `data` field.
    pub fn fields(&self) -> Result<SwapDataFields, SwapError> {
        SwapDataFields::unpack(self.data)
    }

    /// Unix expiry of the swap, in seconds.
    pub fn expiry(&self) -> u64 {
        (self.data & U256::from(u64::MAX)).to::<u64>()
    }

    /// Escrow nonce.
    pub fn nonce(&self) -> u64 {
        ((self.data >> 64) & U256::from(u64::MAX)).to::<u64>()
    }

    /// Required Bitcoin confirmations for an SPV claim.
    pub fn confirmations(&self) -> u16 {
        ((self.data >> 128) & U256::from(u16::MAX)).to::<u16>()
    }

    /// The claim condition.
    pub fn kind(&self) -> Result<SwapKind, SwapError> {
        SwapKind::try_from(((self.data >> 144) & U256::from(u8::MAX)).to::<u8>())
    }

    pub fn pay_in(&self) -> bool {
        ((self.data >> 152) & U256::from(u8::MAX)) != U256::ZERO
    }

    pub fn pay_out(&self) -> bool {
        ((self.data >> 160) & U256::from(u8::MAX)) != U256::ZERO
    }

    /// The on-chain commitment number the record was created against.
    pub fn index(&self) -> u8 {
        ((self.data >> 168) & U256::from(u8::MAX)).to::<u8>()
    }

    /// Whether the swap pays in the native currency.
    pub fn is_native(&self) -> bool {
        self.token == Address::ZERO
    }

    /// The canonical commitment hash: keccak256 of the ABI tuple encoding.
    ///
    /// The contract stores this value at `payment_hash` while the swap is
    /// live; the encoding must match the contract's `abi.encode` bit for bit.
    pub fn commit_hash(&self) -> B256 {
        keccak256(self.as_commitment().abi_encode())
    }

    /// The ABI tuple view used for hashing and calldata.
    pub fn as_commitment(&self) -> SwapCommitment {
        SwapCommitment {
            offerer: self.offerer,
            claimer: self.claimer,
            token: self.token,
            amount: self.amount,
            paymentHash: self.payment_hash,
            data: self.data,
            securityDeposit: self.security_deposit,
            claimerBounty: self.claimer_bounty,
        }
    }
}

/// The keccak digest of a transaction output, as committed on chain:
/// `keccak256(amount_sats (8B LE) ‖ output_script)`.
pub fn txo_hash(output_script: &[u8], amount_sats: u64) -> B256 {
    let mut buf = Vec::with_capacity(8 + output_script.len());
    buf.extend_from_slice(&amount_sats.to_le_bytes());
    buf.extend_from_slice(output_script);
    keccak256(&buf)
}

/// The nonced payment hash for `ChainNonced` swaps:
/// `keccak256(nonce (8B BE) ‖ txo_hash)`.
pub fn hash_for_onchain(output_script: &[u8], amount_sats: u64, nonce: u64) -> B256 {
    let inner = txo_hash(output_script, amount_sats);
    let mut buf = [0u8; 40];
    buf[0..8].copy_from_slice(&nonce.to_be_bytes());
    buf[8..40].copy_from_slice(inner.as_slice());
    keccak256(buf)
}
