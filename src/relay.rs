// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client for the BTC relay contract: tip reads, header-submission
//! preparation with off-chain precomputation of the stored-header chain,
//! and reconstruction of stored headers from the contract's log history.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::rpc::types::{Filter, Log, TransactionInput, TransactionRequest};
use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    btc::BitcoinQueries,
    error::SwapError,
    header::{reverse_hash, RawBlockHeader, StoredBlockHeader, TIMESTAMP_RING},
    provider::EvmQueries,
};

#[cfg(test)]
#[path = "unit_tests/relay_tests.rs"]
mod relay_tests;

sol! {
    event StoreHeader(bytes32 indexed commitHash, bytes32 blockHash, bytes storedHeader);
    event StoreForkHeader(
        bytes32 indexed commitHash,
        bytes32 blockHash,
        uint256 forkId,
        bytes storedHeader
    );

    function getChainTip() external view returns (uint256);
    function getTipCommitHash() external view returns (bytes32);
    function getCommitHash(uint256 height) external view returns (bytes32);
    function getForkCounter() external view returns (uint256);

    function setInitialBlockheader(bytes storedHeader) external;
    function submitMainBlockheaders(bytes storedHeader, bytes headers) external;
    function submitNewForkBlockheaders(bytes storedHeader, bytes headers) external;
    function submitForkBlockheaders(uint256 forkId, bytes storedHeader, bytes headers) external;
}

/// Gas budget for storing the initial header.
pub const GAS_INITIAL_STORE_HEADER: u64 = 150_000;
/// Base and per-header gas budget for main-chain submissions.
pub const GAS_MAIN_BASE: u64 = 40_000;
pub const GAS_MAIN_PER_HEADER: u64 = 40_000;
/// Base and per-header gas budget for fork submissions (new or existing).
pub const GAS_FORK_BASE: u64 = 200_000;
pub const GAS_FORK_PER_HEADER: u64 = 100_000;
/// Per-header gas assumed when estimating synchronization fees.
pub const GAS_PER_BLOCKHEADER: u64 = 35_000;

/// Sleep between empty log windows while paging backwards.
const LOG_SCAN_SLEEP: Duration = Duration::from_millis(500);

/// The relay's current best-chain tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayTip {
    /// Commitment hash of the stored tip header.
    pub commit_hash: B256,
    /// Cumulative chain work at the tip.
    pub chain_work: U256,
    /// Bitcoin block height of the tip.
    pub block_height: u32,
}

/// A prepared header submission: the unsigned transaction plus the
/// stored-header chain precomputed off-chain, so callers can use the
/// resulting headers without another round trip.
#[derive(Clone, Debug)]
pub struct HeaderSubmission {
    /// Fork the submission targets; zero is the main chain.
    pub fork_id: u64,
    /// The stored header at the end of the submitted chain.
    pub last_stored: StoredBlockHeader,
    /// The unsigned submission transaction.
    pub tx: TransactionRequest,
    /// All stored headers computed for this submission, in order.
    pub computed: Vec<StoredBlockHeader>,
}

/// A stored header recovered from the relay's log history.
#[derive(Clone, Debug)]
pub struct RelayedHeader {
    pub stored: StoredBlockHeader,
    pub commit_hash: B256,
    /// The relay's tip height at the time of the lookup.
    pub tip_height: u32,
}

/// Result of a relay synchronization preparation.
pub struct RelaySync {
    /// Header-submission transactions to publish, in order.
    pub txs: Vec<TransactionRequest>,
    /// The stored headers that will exist once the transactions confirm,
    /// keyed by block height.
    pub computed_header_map: HashMap<u32, StoredBlockHeader>,
}

/// Prepares the transactions bringing the relay up to the Bitcoin tip.
#[async_trait]
pub trait RelaySynchronizer: Send + Sync {
    async fn sync_to_latest(&self) -> Result<RelaySync, SwapError>;
}

/// A decoded `StoreHeader`/`StoreForkHeader` log entry.
struct StoreLogEntry {
    commit_hash: B256,
    /// As logged: internal little-endian order.
    block_hash: [u8; 32],
    stored: StoredBlockHeader,
}

/// Client for a deployed BTC relay contract.
pub struct BtcRelayClient<P> {
    provider: Arc<P>,
    contract_address: Address,
    /// Width of an L1 block window when paging over logs.
    log_blocks_limit: u64,
}

impl<P: EvmQueries> BtcRelayClient<P> {
    pub fn new(provider: Arc<P>, contract_address: Address, log_blocks_limit: u64) -> Self {
        BtcRelayClient {
            provider,
            contract_address,
            log_blocks_limit,
        }
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    async fn view(&self, calldata: Vec<u8>) -> Result<alloy_primitives::Bytes, SwapError> {
        let tx = TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(calldata.into()));
        self.provider.call(tx).await
    }

    /// Reads the packed tip slot. `None` if the relay holds no headers yet.
    pub async fn get_tip(&self) -> Result<Option<RelayTip>, SwapError> {
        let out = self.view(getChainTipCall {}.abi_encode()).await?;
        let packed: U256 = getChainTipCall::abi_decode_returns(&out)?;
        let block_height = (packed >> 224).to::<u32>();
        if block_height == 0 {
            return Ok(None);
        }
        let chain_work = packed & ((U256::ONE << 224) - U256::ONE);
        let out = self.view(getTipCommitHashCall {}.abi_encode()).await?;
        let commit_hash = getTipCommitHashCall::abi_decode_returns(&out)?;
        Ok(Some(RelayTip {
            commit_hash,
            chain_work,
            block_height,
        }))
    }

    /// The main-chain commitment hash stored at `height`.
    pub async fn get_commitment_at(&self, height: u32) -> Result<B256, SwapError> {
        let out = self
            .view(
                getCommitHashCall {
                    height: U256::from(height),
                }
                .abi_encode(),
            )
            .await?;
        Ok(getCommitHashCall::abi_decode_returns(&out)?)
    }

    /// The contract's fork counter: the id the next new fork will receive.
    pub async fn get_fork_counter(&self) -> Result<u64, SwapError> {
        let out = self.view(getForkCounterCall {}.abi_encode()).await?;
        Ok(getForkCounterCall::abi_decode_returns(&out)?.to::<u64>())
    }

    /// Prepares the bootstrap submission storing the relay's first header.
    pub fn save_initial_header(
        &self,
        header: RawBlockHeader,
        block_height: u32,
        chain_work: U256,
        epoch_start: u32,
        prev_block_timestamps: &[u32],
    ) -> Result<(StoredBlockHeader, TransactionRequest), SwapError> {
        let prev_block_timestamps: [u32; TIMESTAMP_RING] =
            prev_block_timestamps.try_into().map_err(|_| {
                SwapError::InvalidArgument(format!(
                    "expected {} previous block timestamps, got {}",
                    TIMESTAMP_RING,
                    prev_block_timestamps.len()
                ))
            })?;
        let stored = StoredBlockHeader {
            header,
            last_diff_adjustment: epoch_start,
            prev_block_timestamps,
            block_height,
            chain_work,
        };
        let calldata = setInitialBlockheaderCall {
            storedHeader: stored.serialize().into(),
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(calldata.into()))
            .gas_limit(GAS_INITIAL_STORE_HEADER);
        Ok((stored, tx))
    }

    /// Extends the main chain. The stored-header chain is computed off-chain
    /// and returned alongside the unsigned transaction.
    pub fn save_main_headers(
        &self,
        headers: &[RawBlockHeader],
        prev_stored: &StoredBlockHeader,
    ) -> Result<HeaderSubmission, SwapError> {
        let computed = compute_chain(prev_stored, headers)?;
        let last_stored = *computed.last().expect("compute_chain rejects empty input");
        let calldata = submitMainBlockheadersCall {
            storedHeader: prev_stored.serialize().into(),
            headers: concat_headers(headers).into(),
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(calldata.into()))
            .gas_limit(GAS_MAIN_BASE + GAS_MAIN_PER_HEADER * headers.len() as u64);
        Ok(HeaderSubmission {
            fork_id: 0,
            last_stored,
            tx,
            computed,
        })
    }

    /// Opens a new fork off `prev_stored`. If the precomputed tail
    /// accumulates more work than `tip_work`, the returned `fork_id` is zero:
    /// the contract promotes the fork to the main chain on submission.
    pub async fn save_new_fork_headers(
        &self,
        headers: &[RawBlockHeader],
        prev_stored: &StoredBlockHeader,
        tip_work: U256,
    ) -> Result<HeaderSubmission, SwapError> {
        let fork_id = self.get_fork_counter().await?;
        let computed = compute_chain(prev_stored, headers)?;
        let last_stored = *computed.last().expect("compute_chain rejects empty input");
        let fork_id = if last_stored.chain_work > tip_work {
            0
        } else {
            fork_id
        };
        let calldata = submitNewForkBlockheadersCall {
            storedHeader: prev_stored.serialize().into(),
            headers: concat_headers(headers).into(),
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(calldata.into()))
            .gas_limit(GAS_FORK_BASE + GAS_FORK_PER_HEADER * headers.len() as u64);
        Ok(HeaderSubmission {
            fork_id,
            last_stored,
            tx,
            computed,
        })
    }

    /// Extends an existing fork. The same promotion rule as
    /// [`save_new_fork_headers`] applies.
    pub fn save_fork_headers(
        &self,
        headers: &[RawBlockHeader],
        prev_stored: &StoredBlockHeader,
        fork_id: u64,
        tip_work: U256,
    ) -> Result<HeaderSubmission, SwapError> {
        let computed = compute_chain(prev_stored, headers)?;
        let last_stored = *computed.last().expect("compute_chain rejects empty input");
        let fork_id = if last_stored.chain_work > tip_work {
            0
        } else {
            fork_id
        };
        let calldata = submitForkBlockheadersCall {
            forkId: U256::from(fork_id),
            storedHeader: prev_stored.serialize().into(),
            headers: concat_headers(headers).into(),
        }
        .abi_encode();
        let tx = TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(calldata.into()))
            .gas_limit(GAS_FORK_BASE + GAS_FORK_PER_HEADER * headers.len() as u64);
        Ok(HeaderSubmission {
            fork_id,
            last_stored,
            tx,
            computed,
        })
    }

    /// Recovers the stored header for `block_hash` (big-endian display
    /// order) from the log history, verifying it is on the relay's main
    /// chain. Returns `None` if the relay hasn't reached `height` (or
    /// `required_height` if supplied), or if no matching main-chain log
    /// exists.
    pub async fn retrieve_log_and_blockheight(
        &self,
        block_hash: [u8; 32],
        height: u32,
        required_height: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Option<RelayedHeader>, SwapError> {
        let Some(tip) = self.get_tip().await? else {
            return Ok(None);
        };
        if tip.block_height < required_height.unwrap_or(height) {
            return Ok(None);
        }
        let target_le = reverse_hash(block_hash);
        let head = self.provider.get_block_number().await?;
        let mut to_block = head;
        loop {
            if cancel.is_cancelled() {
                return Err(SwapError::Cancelled);
            }
            let from_block = to_block.saturating_sub(self.log_blocks_limit - 1);
            let logs = self
                .provider
                .get_logs(&self.store_header_filter(from_block, to_block))
                .await?;
            for log in logs.iter().rev() {
                let Some(entry) = decode_store_log(log) else {
                    continue;
                };
                if entry.block_hash != target_le {
                    continue;
                }
                let committed = self.get_commitment_at(entry.stored.block_height).await?;
                if committed != entry.commit_hash {
                    debug!(
                        height = entry.stored.block_height,
                        "store log no longer on main chain; continuing scan"
                    );
                    continue;
                }
                return Ok(Some(RelayedHeader {
                    stored: entry.stored,
                    commit_hash: entry.commit_hash,
                    tip_height: tip.block_height,
                }));
            }
            if from_block == 0 {
                return Ok(None);
            }
            to_block = from_block - 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(SwapError::Cancelled),
                _ = tokio::time::sleep(LOG_SCAN_SLEEP) => {}
            }
        }
    }

    /// Symmetric lookup by commitment hash. Checks the contract's commitment
    /// at `height` first: if it differs from `commit_hash` the header cannot
    /// be on the main chain and no scan is performed.
    pub async fn retrieve_log_by_commit_hash(
        &self,
        commit_hash: B256,
        block_hash: [u8; 32],
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<RelayedHeader>, SwapError> {
        let Some(tip) = self.get_tip().await? else {
            return Ok(None);
        };
        if tip.block_height < height {
            return Ok(None);
        }
        if self.get_commitment_at(height).await? != commit_hash {
            return Ok(None);
        }
        let target_le = reverse_hash(block_hash);
        let head = self.provider.get_block_number().await?;
        let mut to_block = head;
        loop {
            if cancel.is_cancelled() {
                return Err(SwapError::Cancelled);
            }
            let from_block = to_block.saturating_sub(self.log_blocks_limit - 1);
            let filter = self
                .store_header_filter(from_block, to_block)
                .topic1(commit_hash);
            let logs = self.provider.get_logs(&filter).await?;
            for log in logs.iter().rev() {
                let Some(entry) = decode_store_log(log) else {
                    continue;
                };
                if entry.commit_hash == commit_hash && entry.block_hash == target_le {
                    return Ok(Some(RelayedHeader {
                        stored: entry.stored,
                        commit_hash,
                        tip_height: tip.block_height,
                    }));
                }
            }
            if from_block == 0 {
                return Ok(None);
            }
            to_block = from_block - 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(SwapError::Cancelled),
                _ = tokio::time::sleep(LOG_SCAN_SLEEP) => {}
            }
        }
    }

    /// Scans backwards for the most recent stored header whose block is on
    /// the Bitcoin main chain (per the Bitcoin node) and whose commitment is
    /// still current on the relay.
    pub async fn retrieve_latest_known_block_log(
        &self,
        bitcoin: &dyn BitcoinQueries,
        cancel: &CancellationToken,
    ) -> Result<Option<RelayedHeader>, SwapError> {
        let Some(tip) = self.get_tip().await? else {
            return Ok(None);
        };
        let head = self.provider.get_block_number().await?;
        let mut to_block = head;
        loop {
            if cancel.is_cancelled() {
                return Err(SwapError::Cancelled);
            }
            let from_block = to_block.saturating_sub(self.log_blocks_limit - 1);
            let logs = self
                .provider
                .get_logs(&self.store_header_filter(from_block, to_block))
                .await?;
            for log in logs.iter().rev() {
                let Some(entry) = decode_store_log(log) else {
                    continue;
                };
                if !bitcoin.is_in_main_chain(entry.block_hash).await? {
                    continue;
                }
                let committed = self.get_commitment_at(entry.stored.block_height).await?;
                if committed != entry.commit_hash {
                    continue;
                }
                return Ok(Some(RelayedHeader {
                    stored: entry.stored,
                    commit_hash: entry.commit_hash,
                    tip_height: tip.block_height,
                }));
            }
            if from_block == 0 {
                return Ok(None);
            }
            to_block = from_block - 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(SwapError::Cancelled),
                _ = tokio::time::sleep(LOG_SCAN_SLEEP) => {}
            }
        }
    }

    /// Estimated fee for synchronizing the relay up to `target_height`:
    /// per-header gas times the current gas price, preferring the EIP-1559
    /// base fee. Zero if the relay is already caught up.
    pub async fn estimate_synchronize_fee(&self, target_height: u32) -> Result<U256, SwapError> {
        let current_height = self
            .get_tip()
            .await?
            .map(|tip| tip.block_height)
            .unwrap_or(0);
        if target_height <= current_height {
            return Ok(U256::ZERO);
        }
        let missing = u64::from(target_height - current_height);
        let fee_data = self.provider.get_fee_data().await?;
        Ok(U256::from(missing)
            * U256::from(GAS_PER_BLOCKHEADER)
            * U256::from(fee_data.estimate_price()))
    }

    fn store_header_filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.contract_address)
            .event_signature(vec![
                StoreHeader::SIGNATURE_HASH,
                StoreForkHeader::SIGNATURE_HASH,
            ])
            .from_block(from_block)
            .to_block(to_block)
    }
}

/// Computes the stored-header chain extending `prev` with `headers`,
/// validating hash linkage along the way.
fn compute_chain(
    prev: &StoredBlockHeader,
    headers: &[RawBlockHeader],
) -> Result<Vec<StoredBlockHeader>, SwapError> {
    if headers.is_empty() {
        return Err(SwapError::InvalidArgument(
            "no headers to submit".to_string(),
        ));
    }
    let mut computed = Vec::with_capacity(headers.len());
    let mut current = *prev;
    for header in headers {
        if header.previous_blockhash != current.block_hash() {
            return Err(SwapError::InvalidArgument(format!(
                "header chain broken at height {}",
                current.block_height + 1
            )));
        }
        current = current.compute_next(*header);
        computed.push(current);
    }
    Ok(computed)
}

fn concat_headers(headers: &[RawBlockHeader]) -> Vec<u8> {
    let mut out = Vec::with_capacity(headers.len() * 80);
    for header in headers {
        out.extend_from_slice(&header.serialize());
    }
    out
}

fn decode_store_log(log: &Log) -> Option<StoreLogEntry> {
    let topic0 = log.topic0()?;
    let (commit_hash, block_hash, stored_bytes) = if *topic0 == StoreHeader::SIGNATURE_HASH {
        let decoded = StoreHeader::decode_log(&log.inner).ok()?;
        (
            decoded.data.commitHash,
            decoded.data.blockHash,
            decoded.data.storedHeader.clone(),
        )
    } else if *topic0 == StoreForkHeader::SIGNATURE_HASH {
        let decoded = StoreForkHeader::decode_log(&log.inner).ok()?;
        (
            decoded.data.commitHash,
            decoded.data.blockHash,
            decoded.data.storedHeader.clone(),
        )
    } else {
        return None;
    };
    match StoredBlockHeader::from_bytes(&stored_bytes) {
        Ok(stored) => Some(StoreLogEntry {
            commit_hash,
            block_hash: block_hash.0,
            stored,
        }),
        Err(error) => {
            warn!(%error, "undecodable stored header in relay log; skipping");
            None
        }
    }
}
