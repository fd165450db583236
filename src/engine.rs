// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-swap state machine: creation, persistence, reconciliation of
//! local state against the chain, and the user-facing swap operations.
//!
//! The engine serializes transitions per payment hash, persists every state
//! write before emitting it, and bridges the gap between its startup view of
//! the chain and the live event stream with an initial event queue: events
//! arriving during startup reconciliation are buffered and drained, in
//! arrival order, after the startup polls complete and before live dispatch
//! begins.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, B256, TxHash, U256};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    authorization::{signature_from_hex, verify_initialize},
    btc::BitcoinQueries,
    config::SwapOptions,
    contract::{SwapCommitStatus, SwapContractClient},
    error::SwapError,
    events::{ContractEvent, ContractEventListener},
    header::reverse_hash,
    intermediary::{IntermediaryApi, PricingInfo},
    oracle::PriceOracle,
    provider::EvmQueries,
    storage::SwapStorage,
    swap_data::EvmSwapData,
    util::{try_with_retries, unix_now},
};

#[cfg(test)]
#[path = "unit_tests/engine_tests.rs"]
mod engine_tests;

/// Retry budget for intermediary polls.
const INTERMEDIARY_RETRIES: usize = 3;

/// State of a Bitcoin/Lightning → EVM swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapState {
    /// The swap was refunded or its claim was invalidated after commitment.
    Failed,
    /// The swap expired before being committed on chain.
    Expired,
    /// The payment request was created and awaits the Bitcoin-side payment.
    PrCreated,
    /// The Bitcoin side is paid; an initialization authorization is held.
    PrPaid,
    /// The swap is committed on chain and can be claimed.
    ClaimCommitted,
    /// The swap was claimed.
    ClaimClaimed,
}

impl SwapState {
    /// Whether no further transition can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Failed | SwapState::Expired | SwapState::ClaimClaimed
        )
    }
}

/// A persisted swap and its engine-side bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swap {
    pub payment_hash: B256,
    pub state: SwapState,
    /// The Bitcoin-side payment request (BOLT-11 invoice).
    pub pr: String,
    /// The intermediary's endpoint.
    pub url: String,
    /// The counterparty offering the tokens.
    pub offerer: Address,
    /// The token being received; zero for the native currency.
    pub token: Address,
    pub swap_fee: U256,
    /// Deadline of the current phase: the payment window while awaiting the
    /// Bitcoin payment, the authorization timeout once paid.
    pub timeout: u64,
    /// Fee quote used when polling for the payment authorization.
    pub pricing_info: Option<PricingInfo>,
    /// Authorization prefix, once received.
    pub prefix: Option<String>,
    /// Hex-encoded authorization signature, once received.
    pub signature: Option<String>,
    /// Opaque fee-rate tag echoed to the intermediary.
    pub fee_rate: Option<String>,
    /// The full swap record, once known.
    pub data: Option<EvmSwapData>,
    /// Swap expiry, once known.
    pub expiry: Option<u64>,
    /// The HTLC secret, when the client holds it.
    pub secret: Option<B256>,
    /// The Bitcoin payment transaction, display order, once known.
    pub btc_tx_id: Option<B256>,
    pub commit_tx_id: Option<TxHash>,
    pub claim_tx_id: Option<TxHash>,
}

/// A state transition of one swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapStateChange {
    pub payment_hash: B256,
    pub old_state: SwapState,
    pub new_state: SwapState,
}

/// Progress report while waiting for a Bitcoin payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaymentProgress {
    /// The payment transaction, display order.
    pub tx_id: B256,
    pub confirmations: u32,
    pub target_confirmations: u32,
}

type SwapCell = Arc<Mutex<Swap>>;

/// The swap engine.
pub struct SwapEngine<P, St, I> {
    contract: Arc<SwapContractClient<P>>,
    bitcoin: Arc<dyn BitcoinQueries>,
    storage: St,
    intermediary: I,
    oracle: Option<Arc<PriceOracle>>,
    /// Address the engine acts as (the swap claimer).
    signer_address: Address,
    options: SwapOptions,
    swaps: DashMap<B256, SwapCell>,
    subscribers: std::sync::Mutex<Vec<UnboundedSender<SwapStateChange>>>,
    /// `Some` while startup reconciliation runs; holds events to replay.
    startup_queue: Mutex<Option<Vec<ContractEvent>>>,
}

impl<P, St, I> SwapEngine<P, St, I>
where
    P: EvmQueries + 'static,
    St: SwapStorage,
    I: IntermediaryApi,
{
    pub fn new(
        contract: Arc<SwapContractClient<P>>,
        bitcoin: Arc<dyn BitcoinQueries>,
        storage: St,
        intermediary: I,
        oracle: Option<Arc<PriceOracle>>,
        signer_address: Address,
        options: SwapOptions,
    ) -> Self {
        SwapEngine {
            contract,
            bitcoin,
            storage,
            intermediary,
            oracle,
            signer_address,
            options,
            swaps: DashMap::new(),
            subscribers: std::sync::Mutex::new(Vec::new()),
            startup_queue: Mutex::new(None),
        }
    }

    /// Subscribes to state changes. Dead receivers are evicted lazily.
    pub fn subscribe(&self) -> UnboundedReceiver<SwapStateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    fn notify(&self, change: SwapStateChange) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .retain(|sender| sender.send(change).is_ok());
    }

    /// Loads persisted swaps and reconciles each against the chain, with a
    /// bounded fan-out for intermediary polls. Contract events arriving
    /// while this runs are queued and applied, in arrival order, after the
    /// polls and before live dispatch resumes.
    pub async fn init(&self) -> Result<(), SwapError> {
        *self.startup_queue.lock().await = Some(Vec::new());
        for (payment_hash, swap) in self.storage.load_all_swaps().await? {
            self.swaps
                .insert(payment_hash, Arc::new(Mutex::new(swap)));
        }
        let cells: Vec<SwapCell> = self
            .swaps
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::stream::iter(cells)
            .map(|cell| async move {
                if let Err(error) = self.reconcile(&cell).await {
                    let payment_hash = cell.lock().await.payment_hash;
                    warn!(%payment_hash, %error, "startup reconciliation failed");
                }
            })
            .buffer_unordered(self.options.max_concurrent_requests)
            .collect::<Vec<()>>()
            .await;
        let mut queue_guard = self.startup_queue.lock().await;
        let queued = queue_guard.take().unwrap_or_default();
        for event in queued {
            self.apply_event(event).await;
        }
        drop(queue_guard);
        Ok(())
    }

    /// Requests a lightning-receive swap from the intermediary, validates
    /// the quote against the price oracle and persists the new record.
    pub async fn create_lightning_swap(
        &self,
        url: &str,
        amount_sats: u64,
        token: Address,
        payment_hash: B256,
        timeout: u64,
    ) -> Result<Swap, SwapError> {
        let receive = self
            .intermediary
            .receive_lightning(url, amount_sats, self.signer_address, token, payment_hash)
            .await?;
        if let Some(oracle) = &self.oracle {
            let valid = oracle
                .is_valid_amount_receive(
                    amount_sats,
                    receive.pricing_info.base_fee_sats,
                    receive.pricing_info.fee_ppm,
                    receive.total,
                    token,
                )
                .await?;
            if !valid {
                return Err(SwapError::InvalidArgument(
                    "intermediary fee outside the allowed tolerance".to_string(),
                ));
            }
        }
        let swap = Swap {
            payment_hash,
            state: SwapState::PrCreated,
            pr: receive.pr,
            url: url.to_string(),
            offerer: receive.intermediary_key,
            token,
            swap_fee: receive.swap_fee,
            timeout,
            pricing_info: Some(receive.pricing_info),
            prefix: None,
            signature: None,
            fee_rate: Some(receive.fee_rate),
            data: None,
            expiry: None,
            secret: receive.secret,
            btc_tx_id: None,
            commit_tx_id: None,
            claim_tx_id: None,
        };
        self.storage.save(&swap).await?;
        self.swaps
            .insert(payment_hash, Arc::new(Mutex::new(swap.clone())));
        Ok(swap)
    }

    /// A snapshot of a swap's current record.
    pub async fn get_swap(&self, payment_hash: B256) -> Option<Swap> {
        let cell = self.cell(payment_hash)?;
        let swap = cell.lock().await.clone();
        Some(swap)
    }

    /// Re-runs reconciliation for one swap (a manual poll).
    pub async fn poll_swap(&self, payment_hash: B256) -> Result<(), SwapError> {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        self.reconcile(&cell).await
    }

    /// Records the Bitcoin transaction paying the swap (display order).
    pub async fn set_bitcoin_payment(
        &self,
        payment_hash: B256,
        tx_id: B256,
    ) -> Result<(), SwapError> {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        let mut swap = cell.lock().await;
        swap.btc_tx_id = Some(tx_id);
        self.storage.save(&swap).await
    }

    /// Submits the initialization transaction using the authorization
    /// received from the intermediary, and waits for its confirmation.
    pub async fn commit(
        &self,
        payment_hash: B256,
        cancel: &CancellationToken,
    ) -> Result<TxHash, SwapError> {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        let mut swap = cell.lock().await;
        if swap.state != SwapState::PrPaid {
            return Err(SwapError::SwapDataVerification(format!(
                "swap is not committable in state {:?}",
                swap.state
            )));
        }
        let (data, prefix, signature, timeout) = authorization_of(&swap)?;
        let on_chain = self.contract.get_commitment(payment_hash).await?;
        verify_initialize(
            &prefix,
            &data,
            timeout,
            &signature,
            unix_now(),
            on_chain,
            self.options.auth_grace_period,
            self.options.claim_grace_period,
        )?;
        let txs = if data.pay_in() {
            self.contract.init_pay_in(&data, &signature, timeout).await?
        } else {
            vec![self.contract.init(&data, &signature, timeout)]
        };
        let hashes = self.contract.send_and_confirm(txs, true, cancel, false).await?;
        let commit_tx = *hashes.last().expect("at least the init transaction was sent");
        swap.commit_tx_id = Some(commit_tx);
        self.transition(&mut swap, SwapState::ClaimCommitted).await?;
        Ok(commit_tx)
    }

    /// Claims a committed swap by disclosing the HTLC secret.
    pub async fn claim(
        &self,
        payment_hash: B256,
        secret: Option<B256>,
        cancel: &CancellationToken,
    ) -> Result<TxHash, SwapError> {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        let mut swap = cell.lock().await;
        if swap.state != SwapState::ClaimCommitted {
            return Err(SwapError::SwapDataVerification(format!(
                "swap is not claimable in state {:?}",
                swap.state
            )));
        }
        let data = swap
            .data
            .clone()
            .ok_or_else(|| SwapError::SwapDataVerification("swap data missing".to_string()))?;
        let secret = secret.or(swap.secret).ok_or_else(|| {
            SwapError::SwapDataVerification("no claim secret available".to_string())
        })?;
        let tx = self.contract.claim_with_secret(&data, secret, true)?;
        let hashes = self
            .contract
            .send_and_confirm(vec![tx], true, cancel, false)
            .await?;
        let claim_tx = hashes[0];
        swap.claim_tx_id = Some(claim_tx);
        self.transition(&mut swap, SwapState::ClaimClaimed).await?;
        Ok(claim_tx)
    }

    /// Refunds an expired committed swap (offerer-side operation).
    pub async fn refund(
        &self,
        payment_hash: B256,
        cancel: &CancellationToken,
    ) -> Result<TxHash, SwapError> {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        let mut swap = cell.lock().await;
        let data = swap
            .data
            .clone()
            .ok_or_else(|| SwapError::SwapDataVerification("swap data missing".to_string()))?;
        let tx = self.contract.refund(self.signer_address, &data).await?;
        let hashes = self
            .contract
            .send_and_confirm(vec![tx], true, cancel, false)
            .await?;
        self.transition(&mut swap, SwapState::Failed).await?;
        Ok(hashes[0])
    }

    /// Polls the Bitcoin payment until it reaches the swap's required
    /// confirmations, reporting progress on every poll. Rejects on
    /// cancellation or when the swap reaches a terminal state.
    pub async fn wait_for_payment<F>(
        &self,
        payment_hash: B256,
        check_interval: Duration,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<(), SwapError>
    where
        F: FnMut(PaymentProgress),
    {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        loop {
            if cancel.is_cancelled() {
                return Err(SwapError::Cancelled);
            }
            let (state, tx_id, target) = {
                let swap = cell.lock().await;
                let target = swap
                    .data
                    .as_ref()
                    .map(|data| u32::from(data.confirmations()))
                    .unwrap_or(1);
                (swap.state, swap.btc_tx_id, target)
            };
            if state.is_terminal() {
                return Err(SwapError::SwapDataVerification(format!(
                    "swap reached terminal state {state:?} while waiting for payment"
                )));
            }
            if let Some(tx_id) = tx_id {
                if let Some(info) = self.bitcoin.get_transaction(reverse_hash(tx_id.0)).await? {
                    on_progress(PaymentProgress {
                        tx_id,
                        confirmations: info.confirmations,
                        target_confirmations: target,
                    });
                    if info.confirmations >= target {
                        return Ok(());
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SwapError::Cancelled),
                _ = tokio::time::sleep(check_interval) => {}
            }
        }
    }

    /// Drops a terminal swap from the store and the in-memory map.
    pub async fn purge(&self, payment_hash: B256) -> Result<(), SwapError> {
        let cell = self
            .cell(payment_hash)
            .ok_or_else(|| unknown_swap(payment_hash))?;
        let swap = cell.lock().await;
        if !swap.state.is_terminal() {
            return Err(SwapError::InvalidArgument(format!(
                "cannot purge swap in non-terminal state {:?}",
                swap.state
            )));
        }
        self.storage.remove(&swap).await?;
        drop(swap);
        self.swaps.remove(&payment_hash);
        Ok(())
    }

    fn cell(&self, payment_hash: B256) -> Option<SwapCell> {
        self.swaps
            .get(&payment_hash)
            .map(|entry| entry.value().clone())
    }

    /// Runs the state-dependent reconciliation for one swap, holding its
    /// per-key lock for the duration.
    async fn reconcile(&self, cell: &SwapCell) -> Result<(), SwapError> {
        let mut swap = cell.lock().await;
        match swap.state {
            SwapState::PrCreated => self.reconcile_created(&mut swap).await,
            SwapState::PrPaid => self.reconcile_paid(&mut swap).await,
            SwapState::ClaimCommitted => self.reconcile_committed(&mut swap).await,
            SwapState::ClaimClaimed | SwapState::Failed | SwapState::Expired => Ok(()),
        }
    }

    async fn reconcile_created(&self, swap: &mut Swap) -> Result<(), SwapError> {
        if unix_now() > swap.timeout {
            self.transition(swap, SwapState::Expired).await?;
            self.storage.remove(swap).await?;
            self.swaps.remove(&swap.payment_hash);
            return Ok(());
        }
        let pricing = swap.pricing_info.clone().unwrap_or(PricingInfo {
            base_fee_sats: 0,
            fee_ppm: 0,
        });
        let auth = try_with_retries(INTERMEDIARY_RETRIES, SwapError::is_retryable, || {
            self.intermediary.get_payment_authorization(
                &swap.url,
                &swap.pr,
                swap.token,
                swap.offerer,
                pricing.base_fee_sats,
                pricing.fee_ppm,
            )
        })
        .await;
        match auth {
            Ok(auth) if auth.is_paid => {
                swap.prefix = Some(auth.prefix);
                swap.timeout = auth.timeout;
                swap.signature = Some(auth.signature);
                swap.data = auth.data;
                swap.expiry = Some(auth.expiry);
                self.transition(swap, SwapState::PrPaid).await
            }
            Ok(_) => Ok(()),
            Err(SwapError::PaymentAuth(reason)) => {
                debug!(payment_hash = %swap.payment_hash, %reason, "payment authorization refused");
                self.transition(swap, SwapState::Expired).await?;
                self.storage.remove(swap).await?;
                self.swaps.remove(&swap.payment_hash);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn reconcile_paid(&self, swap: &mut Swap) -> Result<(), SwapError> {
        let data = swap
            .data
            .clone()
            .ok_or_else(|| SwapError::SwapDataVerification("swap data missing".to_string()))?;
        let status = self
            .contract
            .get_commit_status(self.signer_address, &data)
            .await?;
        match status {
            SwapCommitStatus::Paid => self.transition(swap, SwapState::ClaimClaimed).await,
            SwapCommitStatus::Expired => self.transition(swap, SwapState::Expired).await,
            SwapCommitStatus::Committed => self.transition(swap, SwapState::ClaimCommitted).await,
            SwapCommitStatus::NotCommitted | SwapCommitStatus::Refundable => {
                let (data, prefix, signature, timeout) = authorization_of(swap)?;
                let on_chain = self.contract.get_commitment(swap.payment_hash).await?;
                let verified = verify_initialize(
                    &prefix,
                    &data,
                    timeout,
                    &signature,
                    unix_now(),
                    on_chain,
                    self.options.auth_grace_period,
                    self.options.claim_grace_period,
                );
                match verified {
                    Ok(()) => Ok(()),
                    Err(SwapError::SignatureVerification(reason)) => {
                        debug!(payment_hash = %swap.payment_hash, %reason,
                            "initialization authorization no longer valid");
                        self.transition(swap, SwapState::Expired).await
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    async fn reconcile_committed(&self, swap: &mut Swap) -> Result<(), SwapError> {
        let data = swap
            .data
            .clone()
            .ok_or_else(|| SwapError::SwapDataVerification("swap data missing".to_string()))?;
        let status = self
            .contract
            .get_commit_status(self.signer_address, &data)
            .await?;
        match status {
            SwapCommitStatus::Paid => self.transition(swap, SwapState::ClaimClaimed).await,
            SwapCommitStatus::NotCommitted | SwapCommitStatus::Expired => {
                self.transition(swap, SwapState::Failed).await
            }
            SwapCommitStatus::Committed | SwapCommitStatus::Refundable => Ok(()),
        }
    }

    /// Applies a contract event to the swap it concerns.
    async fn apply_event(&self, event: ContractEvent) {
        let Some(cell) = self.cell(event.payment_hash()) else {
            trace!(payment_hash = %event.payment_hash(), "event for unknown swap ignored");
            return;
        };
        let mut swap = cell.lock().await;
        let result = match event {
            ContractEvent::Initialize(event) if swap.state == SwapState::PrPaid => {
                match event.fetcher.fetch().await {
                    Ok(Some(data)) => {
                        if let Some(existing) = &swap.data {
                            if *existing != data {
                                warn!(payment_hash = %swap.payment_hash,
                                    "initialize event swap data differs from persisted record; \
                                     dropping event (possible reorg)");
                                return;
                            }
                        } else {
                            swap.data = Some(data);
                        }
                        self.transition(&mut swap, SwapState::ClaimCommitted).await
                    }
                    Ok(None) => {
                        warn!(payment_hash = %swap.payment_hash,
                            "initialize transaction not found; dropping event");
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            ContractEvent::Claim(event)
                if matches!(swap.state, SwapState::PrPaid | SwapState::ClaimCommitted) =>
            {
                swap.secret.get_or_insert(event.secret);
                self.transition(&mut swap, SwapState::ClaimClaimed).await
            }
            ContractEvent::Refund(_)
                if matches!(swap.state, SwapState::PrPaid | SwapState::ClaimCommitted) =>
            {
                self.transition(&mut swap, SwapState::Failed).await
            }
            other => {
                trace!(payment_hash = %other.payment_hash(), state = ?swap.state,
                    "event not applicable in current state");
                Ok(())
            }
        };
        if let Err(error) = result {
            warn!(payment_hash = %swap.payment_hash, %error, "event reconciliation failed");
        }
    }

    /// Moves a swap to `new_state`, persisting before the change is emitted
    /// to subscribers.
    async fn transition(&self, swap: &mut Swap, new_state: SwapState) -> Result<(), SwapError> {
        let old_state = swap.state;
        if old_state == new_state {
            return Ok(());
        }
        swap.state = new_state;
        self.storage.save(swap).await?;
        self.notify(SwapStateChange {
            payment_hash: swap.payment_hash,
            old_state,
            new_state,
        });
        Ok(())
    }
}

#[async_trait]
impl<P, St, I> ContractEventListener for SwapEngine<P, St, I>
where
    P: EvmQueries + 'static,
    St: SwapStorage,
    I: IntermediaryApi,
{
    async fn on_event(&self, event: ContractEvent) {
        let mut queue = self.startup_queue.lock().await;
        if let Some(queue) = queue.as_mut() {
            queue.push(event);
            return;
        }
        drop(queue);
        self.apply_event(event).await;
    }
}

/// The initialization authorization stored on a paid swap.
fn authorization_of(
    swap: &Swap,
) -> Result<(EvmSwapData, String, alloy_primitives::Signature, u64), SwapError> {
    let data = swap
        .data
        .clone()
        .ok_or_else(|| SwapError::SwapDataVerification("swap data missing".to_string()))?;
    let prefix = swap
        .prefix
        .clone()
        .ok_or_else(|| SwapError::SwapDataVerification("authorization prefix missing".to_string()))?;
    let signature = signature_from_hex(
        swap.signature
            .as_deref()
            .ok_or_else(|| SwapError::SwapDataVerification("signature missing".to_string()))?,
    )?;
    Ok((data, prefix, signature, swap.timeout))
}

fn unknown_swap(payment_hash: B256) -> SwapError {
    SwapError::InvalidArgument(format!("unknown swap {payment_hash}"))
}
