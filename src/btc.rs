// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The Bitcoin node queries consumed by the swap client.

use async_trait::async_trait;

use crate::{error::SwapError, header::RawBlockHeader};

/// A Merkle inclusion proof for a transaction within a Bitcoin block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMerkleProof {
    /// Height of the containing block.
    pub block_height: u32,
    /// Position of the transaction within the block.
    pub pos: u32,
    /// Sibling hashes from the transaction up to the Merkle root, in
    /// internal little-endian order.
    pub merkle: Vec<[u8; 32]>,
}

impl BlockMerkleProof {
    /// Flattens the proof into the byte form submitted on chain.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.merkle.len() * 32);
        for node in &self.merkle {
            out.extend_from_slice(node);
        }
        out
    }
}

/// Confirmation status of a Bitcoin transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtcTransactionInfo {
    /// Number of confirmations; zero while in the mempool.
    pub confirmations: u32,
    /// Hash of the containing block, once mined.
    pub block_hash: Option<[u8; 32]>,
}

/// The Bitcoin RPC surface the client consumes. Hashes are in internal
/// little-endian order throughout.
#[async_trait]
pub trait BitcoinQueries: Send + Sync {
    /// The raw header of the given block.
    async fn get_block_header(&self, hash: [u8; 32]) -> Result<RawBlockHeader, SwapError>;

    /// Whether the given block is part of the current main chain.
    async fn is_in_main_chain(&self, hash: [u8; 32]) -> Result<bool, SwapError>;

    /// A Merkle inclusion proof for `txid` within `block_hash`.
    async fn get_merkle_proof(
        &self,
        txid: [u8; 32],
        block_hash: [u8; 32],
    ) -> Result<BlockMerkleProof, SwapError>;

    /// Confirmation status of a transaction, if the node knows it.
    async fn get_transaction(
        &self,
        txid: [u8; 32],
    ) -> Result<Option<BtcTransactionInfo>, SwapError>;
}
