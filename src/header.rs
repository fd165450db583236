// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bit-exact codec for Bitcoin block headers and the compact "stored header"
//! records the relay contract commits to.

use alloy_primitives::{keccak256, B256, U256};
use sha2::{Digest, Sha256};

use crate::error::SwapError;

/// Length of a raw Bitcoin block header.
pub const RAW_HEADER_LEN: usize = 80;

/// Length of a serialized stored header.
pub const STORED_HEADER_LEN: usize = 160;

/// Number of recent block timestamps kept in a stored header.
pub const TIMESTAMP_RING: usize = 10;

/// Number of blocks between difficulty adjustments.
pub const DIFF_ADJUSTMENT_PERIOD: u32 = 2016;

#[cfg(test)]
#[path = "unit_tests/header_tests.rs"]
mod header_tests;

/// A raw 80-byte Bitcoin block header.
///
/// Hash fields are kept in their on-the-wire little-endian order; display
/// order is the byte-reversed form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBlockHeader {
    pub version: u32,
    pub previous_blockhash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub nbits: u32,
    pub nonce: u32,
}

impl RawBlockHeader {
    /// Serializes the header into its canonical 80-byte encoding.
    pub fn serialize(&self) -> [u8; RAW_HEADER_LEN] {
        let mut out = [0u8; RAW_HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.previous_blockhash);
        out[36..68].copy_from_slice(&self.merkle_root);
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.nbits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parses an 80-byte canonical encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SwapError> {
        if bytes.len() != RAW_HEADER_LEN {
            return Err(SwapError::InvalidHeader(format!(
                "raw header length {} != {}",
                bytes.len(),
                RAW_HEADER_LEN
            )));
        }
        let mut previous_blockhash = [0u8; 32];
        previous_blockhash.copy_from_slice(&bytes[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&bytes[36..68]);
        Ok(RawBlockHeader {
            version: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            previous_blockhash,
            merkle_root,
            timestamp: u32::from_le_bytes(bytes[68..72].try_into().unwrap()),
            nbits: u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(bytes[76..80].try_into().unwrap()),
        })
    }

    /// The block hash: double-SHA256 of the 80-byte encoding, in internal
    /// little-endian order.
    pub fn block_hash(&self) -> [u8; 32] {
        let first = Sha256::digest(self.serialize());
        let second = Sha256::digest(first);
        second.into()
    }

    /// The proof-of-work target encoded by `nbits`.
    pub fn target(&self) -> U256 {
        target_from_nbits(self.nbits)
    }
}

/// The record the relay contract keeps per Bitcoin block: the raw header
/// extended with accumulated work, the difficulty-epoch start, a ring of the
/// ten most recent timestamps and the block height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredBlockHeader {
    pub header: RawBlockHeader,
    pub last_diff_adjustment: u32,
    pub prev_block_timestamps: [u32; TIMESTAMP_RING],
    pub block_height: u32,
    pub chain_work: U256,
}

impl StoredBlockHeader {
    /// Serializes into the 160-byte on-chain struct layout: the raw header,
    /// then the epoch start, the timestamp ring and the height as big-endian
    /// words, then the 32-byte big-endian chain work.
    pub fn serialize(&self) -> [u8; STORED_HEADER_LEN] {
        let mut out = [0u8; STORED_HEADER_LEN];
        out[0..80].copy_from_slice(&self.header.serialize());
        out[80..84].copy_from_slice(&self.last_diff_adjustment.to_be_bytes());
        for (i, timestamp) in self.prev_block_timestamps.iter().enumerate() {
            out[84 + i * 4..88 + i * 4].copy_from_slice(&timestamp.to_be_bytes());
        }
        out[124..128].copy_from_slice(&self.block_height.to_be_bytes());
        out[128..160].copy_from_slice(&self.chain_work.to_be_bytes::<32>());
        out
    }

    /// Parses the 160-byte on-chain struct layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SwapError> {
        if bytes.len() != STORED_HEADER_LEN {
            return Err(SwapError::InvalidHeader(format!(
                "stored header length {} != {}",
                bytes.len(),
                STORED_HEADER_LEN
            )));
        }
        let header = RawBlockHeader::from_bytes(&bytes[0..80])?;
        let mut prev_block_timestamps = [0u32; TIMESTAMP_RING];
        for (i, timestamp) in prev_block_timestamps.iter_mut().enumerate() {
            *timestamp = u32::from_be_bytes(bytes[84 + i * 4..88 + i * 4].try_into().unwrap());
        }
        Ok(StoredBlockHeader {
            header,
            last_diff_adjustment: u32::from_be_bytes(bytes[80..84].try_into().unwrap()),
            prev_block_timestamps,
            block_height: u32::from_be_bytes(bytes[124..128].try_into().unwrap()),
            chain_work: U256::from_be_slice(&bytes[128..160]),
        })
    }

    /// The keccak256 digest of the serialized form. This is the commitment
    /// the relay contract stores at the header's height; it must match the
    /// contract's own hashing bit for bit.
    pub fn commit_hash(&self) -> B256 {
        keccak256(self.serialize())
    }

    /// The block hash of the underlying raw header.
    pub fn block_hash(&self) -> [u8; 32] {
        self.header.block_hash()
    }

    /// Computes the stored header that extends `self` with `header`.
    ///
    /// Pure arithmetic; linkage of `header.previous_blockhash` to this block
    /// is the caller's concern.
    pub fn compute_next(&self, header: RawBlockHeader) -> StoredBlockHeader {
        let block_height = self.block_height + 1;
        let chain_work = self.chain_work + work_from_target(header.target());
        let mut prev_block_timestamps = self.prev_block_timestamps;
        prev_block_timestamps[block_height as usize % TIMESTAMP_RING] = header.timestamp;
        let last_diff_adjustment = if block_height % DIFF_ADJUSTMENT_PERIOD == 0 {
            header.timestamp
        } else {
            self.last_diff_adjustment
        };
        StoredBlockHeader {
            header,
            last_diff_adjustment,
            prev_block_timestamps,
            block_height,
            chain_work,
        }
    }
}

/// Decodes the compact difficulty representation into the full 256-bit target.
pub fn target_from_nbits(nbits: u32) -> U256 {
    let exponent = nbits >> 24;
    let mantissa = U256::from(nbits & 0x00ff_ffff);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// The work contributed by a block with the given target:
/// `2^256 / (target + 1)`, computed in 256-bit space as
/// `(!target) / (target + 1) + 1`.
pub fn work_from_target(target: U256) -> U256 {
    (!target) / (target + U256::ONE) + U256::ONE
}

/// Reverses a 32-byte hash between internal little-endian order and display
/// (big-endian) order. The relay contract logs block hashes little-endian;
/// callers comparing against canonical hashes reverse first.
pub fn reverse_hash(hash: [u8; 32]) -> [u8; 32] {
    let mut out = hash;
    out.reverse();
    out
}
