// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client for the swap escrow contract: commitment-status reads and
//! unsigned-transaction builders for every swap operation.

use std::{collections::HashMap, sync::Arc};

use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy_primitives::{Address, Signature, TxHash, B256, U256};
use alloy_sol_types::{sol, SolCall};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    authorization::{timeout_and_v, verify_refund},
    btc::BitcoinQueries,
    config::SwapOptions,
    error::SwapError,
    header::reverse_hash,
    provider::EvmQueries,
    relay::{BtcRelayClient, RelaySynchronizer},
    swap_data::{EvmSwapData, COMMITMENT_PAID},
    util::unix_now,
};

#[cfg(test)]
#[path = "unit_tests/contract_tests.rs"]
mod contract_tests;

sol! {
    /// The ABI tuple the contract hashes to commit to a live swap.
    struct SwapCommitment {
        address offerer;
        address claimer;
        address token;
        uint256 amount;
        bytes32 paymentHash;
        uint256 data;
        uint256 securityDeposit;
        uint256 claimerBounty;
    }

    function initialize(
        SwapCommitment swapData,
        bytes32 r,
        bytes32 s,
        uint256 timeoutAndV,
        bytes32 txoHash
    ) external;
    function initializePayIn(
        SwapCommitment swapData,
        bytes32 r,
        bytes32 s,
        uint256 timeoutAndV,
        bytes32 txoHash
    ) external payable;
    function claimWithSecret(SwapCommitment swapData, bytes32 secret) external;
    function claimWithTxData(
        SwapCommitment swapData,
        uint256 blockheight,
        uint256 txPos,
        bytes merkleProof,
        bytes committedHeader,
        bytes rawTx,
        uint256 vout
    ) external;
    function refund(SwapCommitment swapData) external;
    function refundWithAuth(
        SwapCommitment swapData,
        bytes32 r,
        bytes32 s,
        uint256 timeoutAndV
    ) external;
    function deposit(address token, uint256 amount) external payable;
    function withdraw(address token, uint256 amount) external;
    function getCommitment(bytes32 paymentHash) external view returns (uint256);

    function allowance(address owner, address spender) external view returns (uint256);
    function approve(address spender, uint256 amount) external returns (bool);
    function transfer(address to, uint256 amount) external returns (bool);
}

/// Gas budgets, bit-compatible with what intermediaries quote against.
pub const GAS_INIT: u64 = 100_000;
pub const GAS_INIT_PAY_IN: u64 = 150_000;
pub const GAS_APPROVE: u64 = 80_000;
pub const GAS_CLAIM_WITH_SECRET: u64 = 150_000;
pub const GAS_CLAIM_WITH_TX_DATA_BASE: u64 = 200_000;
pub const GAS_CLAIM_WITH_TX_DATA_PER_BYTE: u64 = 100;
pub const GAS_REFUND: u64 = 100_000;
pub const GAS_REFUND_WITH_AUTH: u64 = 120_000;
pub const GAS_DEPOSIT: u64 = 80_000;
pub const GAS_WITHDRAW: u64 = 100_000;
pub const GAS_NATIVE_TRANSFER: u64 = 21_000;

/// Status of a swap's on-chain commitment slot, as seen by a given caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapCommitStatus {
    /// The swap has been claimed and paid out.
    Paid,
    /// The swap is live: the slot holds this record's commitment.
    Committed,
    /// The swap is live but past its refund window, and the caller is the
    /// offerer: a refund can be submitted.
    Refundable,
    /// The slot no longer (or never) holds this swap, and the caller-side
    /// deadline has passed.
    Expired,
    /// The slot does not hold this swap.
    NotCommitted,
}

/// Client for a deployed swap escrow contract.
pub struct SwapContractClient<P> {
    provider: Arc<P>,
    contract_address: Address,
    relay: Arc<BtcRelayClient<P>>,
    bitcoin: Arc<dyn BitcoinQueries>,
    options: SwapOptions,
    /// Allowances known to be at maximum, per (token, owner). Avoids
    /// re-querying after a max approval was prepared.
    max_allowances: Mutex<HashMap<(Address, Address), ()>>,
}

impl<P: EvmQueries> SwapContractClient<P> {
    pub fn new(
        provider: Arc<P>,
        contract_address: Address,
        relay: Arc<BtcRelayClient<P>>,
        bitcoin: Arc<dyn BitcoinQueries>,
        options: SwapOptions,
    ) -> Self {
        SwapContractClient {
            provider,
            contract_address,
            relay,
            bitcoin,
            options,
            max_allowances: Mutex::new(HashMap::new()),
        }
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    pub fn relay(&self) -> &Arc<BtcRelayClient<P>> {
        &self.relay
    }

    pub fn options(&self) -> &SwapOptions {
        &self.options
    }

    async fn view(&self, to: Address, calldata: Vec<u8>) -> Result<alloy_primitives::Bytes, SwapError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(calldata.into()));
        self.provider.call(tx).await
    }

    fn build_tx(&self, calldata: Vec<u8>, gas: u64) -> TransactionRequest {
        TransactionRequest::default()
            .to(self.contract_address)
            .input(TransactionInput::new(calldata.into()))
            .gas_limit(gas)
    }

    /// The raw commitment value stored at `payment_hash`.
    pub async fn get_commitment(&self, payment_hash: B256) -> Result<U256, SwapError> {
        let out = self
            .view(
                self.contract_address,
                getCommitmentCall {
                    paymentHash: payment_hash,
                }
                .abi_encode(),
            )
            .await?;
        Ok(getCommitmentCall::abi_decode_returns(&out)?)
    }

    /// Classifies the commitment slot for `swap` from `caller`'s viewpoint.
    pub async fn get_commit_status(
        &self,
        caller: Address,
        swap: &EvmSwapData,
    ) -> Result<SwapCommitStatus, SwapError> {
        let on_chain = self.get_commitment(swap.payment_hash).await?;
        let expired = caller == swap.offerer
            && unix_now() > swap.expiry().saturating_sub(self.options.refund_grace_period);
        Ok(if on_chain == COMMITMENT_PAID {
            SwapCommitStatus::Paid
        } else if on_chain < COMMITMENT_PAID {
            if expired {
                SwapCommitStatus::Expired
            } else {
                SwapCommitStatus::NotCommitted
            }
        } else if on_chain == U256::from_be_bytes(swap.commit_hash().0) {
            if expired {
                SwapCommitStatus::Refundable
            } else {
                SwapCommitStatus::Committed
            }
        } else if expired {
            SwapCommitStatus::Expired
        } else {
            SwapCommitStatus::NotCommitted
        })
    }

    /// Builds the initialization transaction for a swap funded from the
    /// offerer's contract balance.
    pub fn init(
        &self,
        swap: &EvmSwapData,
        signature: &Signature,
        timeout: u64,
    ) -> TransactionRequest {
        let calldata = initializeCall {
            swapData: swap.as_commitment(),
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
            timeoutAndV: timeout_and_v(signature, timeout),
            txoHash: swap.txo_hash.unwrap_or_default(),
        }
        .abi_encode();
        self.build_tx(calldata, GAS_INIT)
    }

    /// Builds the transactions for a pay-in initialization: the offerer
    /// funds the swap directly. For a token swap this prepends a
    /// max-allowance approval when the current allowance is short; for a
    /// native swap the amount rides along as transaction value.
    pub async fn init_pay_in(
        &self,
        swap: &EvmSwapData,
        signature: &Signature,
        timeout: u64,
    ) -> Result<Vec<TransactionRequest>, SwapError> {
        let mut txs = Vec::with_capacity(2);
        if !swap.is_native() {
            let allowance = self
                .get_allowance(swap.token, swap.offerer)
                .await
                .map_err(|error| {
                    SwapError::CannotInitializeAta(format!(
                        "allowance query for token {} failed: {error}",
                        swap.token
                    ))
                })?;
            if allowance < swap.amount {
                txs.push(self.approve(swap.token, swap.offerer, U256::MAX).await);
            }
        }
        let calldata = initializePayInCall {
            swapData: swap.as_commitment(),
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
            timeoutAndV: timeout_and_v(signature, timeout),
            txoHash: swap.txo_hash.unwrap_or_default(),
        }
        .abi_encode();
        let mut tx = self.build_tx(calldata, GAS_INIT_PAY_IN);
        if swap.is_native() {
            tx = tx.value(swap.amount);
        }
        txs.push(tx);
        Ok(txs)
    }

    /// Builds the claim transaction disclosing the HTLC secret.
    ///
    /// With `check_expiry`, rejects claims whose remaining time is inside
    /// the claim grace window.
    pub fn claim_with_secret(
        &self,
        swap: &EvmSwapData,
        secret: B256,
        check_expiry: bool,
    ) -> Result<TransactionRequest, SwapError> {
        if check_expiry && swap.expiry().saturating_sub(unix_now()) < self.options.claim_grace_period
        {
            return Err(SwapError::SwapDataVerification(
                "Not enough time to reliably claim the swap".to_string(),
            ));
        }
        let calldata = claimWithSecretCall {
            swapData: swap.as_commitment(),
            secret,
        }
        .abi_encode();
        Ok(self.build_tx(calldata, GAS_CLAIM_WITH_SECRET))
    }

    /// Builds the SPV claim for an on-chain Bitcoin payment: fetches the
    /// Merkle proof, resolves the committed header through the relay log
    /// history (or `synchronizer` when the relay lags), and assembles the
    /// claim transaction. Returns any synchronization transactions followed
    /// by the claim itself.
    pub async fn claim_with_tx_data(
        &self,
        swap: &EvmSwapData,
        raw_tx: &[u8],
        vout: u32,
        committed_header: Option<crate::header::StoredBlockHeader>,
        synchronizer: Option<&dyn RelaySynchronizer>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TransactionRequest>, SwapError> {
        let txid = double_sha256(raw_tx);
        let info = self
            .bitcoin
            .get_transaction(txid)
            .await?
            .ok_or_else(|| {
                SwapError::SwapDataVerification("payment transaction not found".to_string())
            })?;
        let block_hash = info.block_hash.ok_or_else(|| {
            SwapError::SwapDataVerification("payment transaction not yet mined".to_string())
        })?;
        let proof = self.bitcoin.get_merkle_proof(txid, block_hash).await?;
        let required_height = proof.block_height + u32::from(swap.confirmations()) - 1;

        let mut txs = Vec::new();
        let committed_header = match committed_header {
            Some(header) => header,
            None => {
                let found = self
                    .relay
                    .retrieve_log_and_blockheight(
                        reverse_hash(block_hash),
                        proof.block_height,
                        Some(required_height),
                        cancel,
                    )
                    .await?;
                match found {
                    Some(relayed) => relayed.stored,
                    None => {
                        let current = self
                            .relay
                            .get_tip()
                            .await?
                            .map(|tip| tip.block_height)
                            .unwrap_or(0);
                        let Some(synchronizer) = synchronizer else {
                            return Err(SwapError::NotSynchronized {
                                current,
                                required: required_height,
                            });
                        };
                        let sync = synchronizer.sync_to_latest().await?;
                        let header = sync
                            .computed_header_map
                            .get(&proof.block_height)
                            .copied()
                            .ok_or(SwapError::NotSynchronized {
                                current,
                                required: required_height,
                            })?;
                        txs.extend(sync.txs);
                        header
                    }
                }
            }
        };

        let calldata = claimWithTxDataCall {
            swapData: swap.as_commitment(),
            blockheight: U256::from(proof.block_height),
            txPos: U256::from(proof.pos),
            merkleProof: proof.to_bytes().into(),
            committedHeader: committed_header.serialize().to_vec().into(),
            rawTx: raw_tx.to_vec().into(),
            vout: U256::from(vout),
        }
        .abi_encode();
        let gas =
            GAS_CLAIM_WITH_TX_DATA_BASE + GAS_CLAIM_WITH_TX_DATA_PER_BYTE * raw_tx.len() as u64;
        txs.push(self.build_tx(calldata, gas));
        Ok(txs)
    }

    /// Builds a unilateral refund. Preflights that the swap is refundable
    /// from `caller`'s viewpoint.
    pub async fn refund(
        &self,
        caller: Address,
        swap: &EvmSwapData,
    ) -> Result<TransactionRequest, SwapError> {
        let status = self.get_commit_status(caller, swap).await?;
        if status != SwapCommitStatus::Refundable {
            return Err(SwapError::SwapDataVerification(format!(
                "swap is not refundable (status {status:?})"
            )));
        }
        let calldata = refundCall {
            swapData: swap.as_commitment(),
        }
        .abi_encode();
        Ok(self.build_tx(calldata, GAS_REFUND))
    }

    /// Builds a cooperative refund carrying a signed authorization.
    pub fn refund_with_auth(
        &self,
        prefix: &str,
        swap: &EvmSwapData,
        signature: &Signature,
        timeout: u64,
    ) -> Result<TransactionRequest, SwapError> {
        verify_refund(
            prefix,
            swap,
            timeout,
            signature,
            unix_now(),
            self.options.auth_grace_period,
        )?;
        let calldata = refundWithAuthCall {
            swapData: swap.as_commitment(),
            r: B256::from(signature.r()),
            s: B256::from(signature.s()),
            timeoutAndV: timeout_and_v(signature, timeout),
        }
        .abi_encode();
        Ok(self.build_tx(calldata, GAS_REFUND_WITH_AUTH))
    }

    /// Builds a deposit into the caller's contract balance.
    pub fn deposit(&self, token: Address, amount: U256) -> TransactionRequest {
        let calldata = depositCall { token, amount }.abi_encode();
        let mut tx = self.build_tx(calldata, GAS_DEPOSIT);
        if token == Address::ZERO {
            tx = tx.value(amount);
        }
        tx
    }

    /// Builds a withdrawal from the caller's contract balance.
    pub fn withdraw(&self, token: Address, amount: U256) -> TransactionRequest {
        let calldata = withdrawCall { token, amount }.abi_encode();
        self.build_tx(calldata, GAS_WITHDRAW)
    }

    /// Builds a plain transfer of `token` (or the native currency) to `to`.
    pub fn transfer(&self, token: Address, to: Address, amount: U256) -> TransactionRequest {
        if token == Address::ZERO {
            TransactionRequest::default()
                .to(to)
                .value(amount)
                .gas_limit(GAS_NATIVE_TRANSFER)
        } else {
            let calldata = transferCall { to, amount }.abi_encode();
            TransactionRequest::default()
                .to(token)
                .input(TransactionInput::new(calldata.into()))
                .gas_limit(GAS_APPROVE)
        }
    }

    /// Builds an approval of the swap contract for `token`, sent by `owner`,
    /// and remembers when that owner's allowance will be at maximum.
    pub async fn approve(&self, token: Address, owner: Address, amount: U256) -> TransactionRequest {
        let calldata = approveCall {
            spender: self.contract_address,
            amount,
        }
        .abi_encode();
        if amount == U256::MAX {
            self.max_allowances.lock().await.insert((token, owner), ());
        }
        TransactionRequest::default()
            .to(token)
            .input(TransactionInput::new(calldata.into()))
            .gas_limit(GAS_APPROVE)
    }

    /// The owner's allowance for the swap contract, short-circuiting when a
    /// max approval was already prepared for that owner.
    pub async fn get_allowance(&self, token: Address, owner: Address) -> Result<U256, SwapError> {
        if self
            .max_allowances
            .lock()
            .await
            .contains_key(&(token, owner))
        {
            return Ok(U256::MAX);
        }
        let out = self
            .view(
                token,
                allowanceCall {
                    owner,
                    spender: self.contract_address,
                }
                .abi_encode(),
            )
            .await?;
        Ok(allowanceCall::abi_decode_returns(&out)?)
    }

    /// Publishes a transaction batch. With `parallel` the transactions are
    /// all submitted before any receipt is awaited; otherwise each must
    /// confirm before the next is sent, and a revert aborts the remainder.
    pub async fn send_and_confirm(
        &self,
        txs: Vec<TransactionRequest>,
        wait_for_confirmation: bool,
        cancel: &CancellationToken,
        parallel: bool,
    ) -> Result<Vec<TxHash>, SwapError> {
        let mut hashes = Vec::with_capacity(txs.len());
        if parallel {
            for tx in txs {
                if cancel.is_cancelled() {
                    return Err(SwapError::Cancelled);
                }
                hashes.push(self.provider.send_transaction(tx).await?);
            }
            if wait_for_confirmation {
                for hash in &hashes {
                    self.confirm(*hash, cancel).await?;
                }
            }
        } else {
            for tx in txs {
                if cancel.is_cancelled() {
                    return Err(SwapError::Cancelled);
                }
                let hash = self.provider.send_transaction(tx).await?;
                hashes.push(hash);
                if wait_for_confirmation {
                    self.confirm(hash, cancel).await?;
                }
            }
        }
        Ok(hashes)
    }

    async fn confirm(&self, hash: TxHash, cancel: &CancellationToken) -> Result<(), SwapError> {
        let receipt = tokio::select! {
            _ = cancel.cancelled() => return Err(SwapError::Cancelled),
            receipt = self.provider.wait_for_transaction(hash) => receipt?,
        };
        if !receipt.status() {
            return Err(SwapError::TxReverted(hash));
        }
        Ok(())
    }
}

/// Bitcoin txid of a serialized transaction: double SHA-256, internal order.
fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    Sha256::digest(first).into()
}
