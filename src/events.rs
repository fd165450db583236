// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The swap contract's log stream, decoded into typed events and dispatched
//! to registered listeners.

use std::sync::{Arc, Mutex};

use alloy::rpc::types::{Filter, Log};
use alloy_primitives::{Address, TxHash, B256, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{
    contract::{initializeCall, initializePayInCall},
    error::SwapError,
    provider::EvmQueries,
    swap_data::EvmSwapData,
};

sol! {
    event Initialize(
        address indexed offerer,
        address indexed claimer,
        bytes32 indexed paymentHash,
        uint256 sequence,
        bytes32 txoHash,
        uint8 index
    );
    event Claim(
        address indexed offerer,
        address indexed claimer,
        bytes32 indexed paymentHash,
        uint256 sequence,
        bytes32 secret
    );
    event Refund(
        address indexed offerer,
        address indexed claimer,
        bytes32 indexed paymentHash,
        uint256 sequence
    );
}

/// Loads the full swap data behind an `Initialize` event.
///
/// The contract only logs the payment hash; the full record is recovered
/// from the initialize transaction's calldata on demand.
#[async_trait]
pub trait SwapDataFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Option<EvmSwapData>, SwapError>;
}

/// A swap was initialized on chain.
#[derive(Clone)]
pub struct InitializeEvent {
    pub payment_hash: B256,
    pub sequence: u64,
    pub txo_hash: B256,
    /// The commitment number the swap was created against.
    pub index: u8,
    pub fetcher: Arc<dyn SwapDataFetcher>,
}

impl std::fmt::Debug for InitializeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializeEvent")
            .field("payment_hash", &self.payment_hash)
            .field("sequence", &self.sequence)
            .field("txo_hash", &self.txo_hash)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// A swap was claimed; the secret is disclosed on chain.
#[derive(Clone, Debug)]
pub struct ClaimEvent {
    pub payment_hash: B256,
    pub sequence: u64,
    pub secret: B256,
}

/// A swap was refunded to the offerer.
#[derive(Clone, Debug)]
pub struct RefundEvent {
    pub payment_hash: B256,
    pub sequence: u64,
}

/// A decoded swap contract event.
#[derive(Clone, Debug)]
pub enum ContractEvent {
    Initialize(InitializeEvent),
    Claim(ClaimEvent),
    Refund(RefundEvent),
}

impl ContractEvent {
    /// The payment hash the event is keyed by.
    pub fn payment_hash(&self) -> B256 {
        match self {
            ContractEvent::Initialize(event) => event.payment_hash,
            ContractEvent::Claim(event) => event.payment_hash,
            ContractEvent::Refund(event) => event.payment_hash,
        }
    }
}

/// A consumer of decoded contract events.
#[async_trait]
pub trait ContractEventListener: Send + Sync {
    async fn on_event(&self, event: ContractEvent);
}

/// Recovers swap data from the calldata of an initialize transaction.
pub struct TxCalldataFetcher<P> {
    provider: Arc<P>,
    tx_hash: TxHash,
}

impl<P> TxCalldataFetcher<P> {
    pub fn new(provider: Arc<P>, tx_hash: TxHash) -> Self {
        TxCalldataFetcher { provider, tx_hash }
    }
}

#[async_trait]
impl<P: EvmQueries> SwapDataFetcher for TxCalldataFetcher<P> {
    async fn fetch(&self) -> Result<Option<EvmSwapData>, SwapError> {
        let Some(tx) = self.provider.get_transaction_by_hash(self.tx_hash).await? else {
            return Ok(None);
        };
        use alloy::consensus::Transaction as _;
        let input = tx.input();
        let (commitment, txo_hash) = if let Ok(call) = initializeCall::abi_decode(input) {
            (call.swapData, call.txoHash)
        } else if let Ok(call) = initializePayInCall::abi_decode(input) {
            (call.swapData, call.txoHash)
        } else {
            return Ok(None);
        };
        Ok(Some(EvmSwapData {
            record_type: "evm".to_string(),
            offerer: commitment.offerer,
            claimer: commitment.claimer,
            token: commitment.token,
            amount: commitment.amount,
            payment_hash: commitment.paymentHash,
            data: commitment.data,
            security_deposit: commitment.securityDeposit,
            claimer_bounty: commitment.claimerBounty,
            txo_hash: (txo_hash != B256::ZERO).then_some(txo_hash),
        }))
    }
}

/// Polls the swap contract's logs and dispatches decoded events.
///
/// Registration and unregistration are synchronous; delivery awaits each
/// listener in turn for every event of a batch, preserving log order.
pub struct SwapEventSource<P> {
    provider: Arc<P>,
    contract_address: Address,
    listeners: Mutex<Vec<(usize, Arc<dyn ContractEventListener>)>>,
    next_listener_id: Mutex<usize>,
    last_processed_block: Mutex<Option<u64>>,
}

impl<P: EvmQueries + 'static> SwapEventSource<P> {
    pub fn new(provider: Arc<P>, contract_address: Address) -> Self {
        SwapEventSource {
            provider,
            contract_address,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
            last_processed_block: Mutex::new(None),
        }
    }

    /// Registers a listener; the returned id unregisters it.
    pub fn register(&self, listener: Arc<dyn ContractEventListener>) -> usize {
        let mut next_id = self.next_listener_id.lock().expect("listener lock poisoned");
        let id = *next_id;
        *next_id += 1;
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push((id, listener));
        id
    }

    pub fn unregister(&self, id: usize) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Fetches and dispatches all events since the previous poll. Returns
    /// the number of events dispatched.
    pub async fn poll_events(&self) -> Result<usize, SwapError> {
        let head = self.provider.get_block_number().await?;
        let from_block = {
            let last = self.last_processed_block.lock().expect("block lock poisoned");
            match *last {
                Some(block) if block >= head => return Ok(0),
                Some(block) => block + 1,
                None => head,
            }
        };
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(vec![
                Initialize::SIGNATURE_HASH,
                Claim::SIGNATURE_HASH,
                Refund::SIGNATURE_HASH,
            ])
            .from_block(from_block)
            .to_block(head);
        let logs = self.provider.get_logs(&filter).await?;
        let events: Vec<ContractEvent> = logs
            .iter()
            .filter_map(|log| self.decode_event(log))
            .collect();
        let count = events.len();
        self.dispatch(events).await;
        *self.last_processed_block.lock().expect("block lock poisoned") = Some(head);
        Ok(count)
    }

    /// Polls in a loop until cancelled.
    pub async fn run(&self, poll_interval: std::time::Duration, cancel: CancellationToken) {
        loop {
            if let Err(error) = self.poll_events().await {
                warn!(%error, "event poll failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Delivers a batch to every registered listener, sequentially.
    pub async fn dispatch(&self, events: Vec<ContractEvent>) {
        for event in events {
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .expect("listener lock poisoned")
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            trace!(payment_hash = %event.payment_hash(), "dispatching contract event");
            for listener in listeners {
                listener.on_event(event.clone()).await;
            }
        }
    }

    fn decode_event(&self, log: &Log) -> Option<ContractEvent> {
        let topic0 = log.topic0()?;
        if *topic0 == Initialize::SIGNATURE_HASH {
            let decoded = Initialize::decode_log(&log.inner).ok()?;
            let tx_hash = log.transaction_hash?;
            Some(ContractEvent::Initialize(InitializeEvent {
                payment_hash: decoded.data.paymentHash,
                sequence: sequence_of(decoded.data.sequence),
                txo_hash: decoded.data.txoHash,
                index: decoded.data.index,
                fetcher: Arc::new(TxCalldataFetcher::new(self.provider.clone(), tx_hash)),
            }))
        } else if *topic0 == Claim::SIGNATURE_HASH {
            let decoded = Claim::decode_log(&log.inner).ok()?;
            Some(ContractEvent::Claim(ClaimEvent {
                payment_hash: decoded.data.paymentHash,
                sequence: sequence_of(decoded.data.sequence),
                secret: decoded.data.secret,
            }))
        } else if *topic0 == Refund::SIGNATURE_HASH {
            let decoded = Refund::decode_log(&log.inner).ok()?;
            Some(ContractEvent::Refund(RefundEvent {
                payment_hash: decoded.data.paymentHash,
                sequence: sequence_of(decoded.data.sequence),
            }))
        } else {
            None
        }
    }
}

fn sequence_of(value: U256) -> u64 {
    (value & U256::from(u64::MAX)).to::<u64>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_utils::MockEvm;

    fn claim_log(contract: Address, payment_hash: B256, secret: B256) -> Log {
        let event = Claim {
            offerer: Address::repeat_byte(0x0f),
            claimer: Address::repeat_byte(0xc1),
            paymentHash: payment_hash,
            sequence: U256::from(7u64),
            secret,
        };
        Log {
            inner: alloy_primitives::Log {
                address: contract,
                data: event.encode_log_data(),
            },
            transaction_hash: Some(TxHash::repeat_byte(0x99)),
            ..Default::default()
        }
    }

    struct CountingListener {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ContractEventListener for CountingListener {
        async fn on_event(&self, _event: ContractEvent) {
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_decode_claim_log() {
        let contract = Address::repeat_byte(0xcc);
        let provider = Arc::new(MockEvm::new());
        let source = SwapEventSource::new(provider, contract);
        let payment_hash = B256::repeat_byte(0x31);
        let secret = B256::repeat_byte(0x5e);
        let event = source
            .decode_event(&claim_log(contract, payment_hash, secret))
            .unwrap();
        match event {
            ContractEvent::Claim(claim) => {
                assert_eq!(claim.payment_hash, payment_hash);
                assert_eq!(claim.sequence, 7);
                assert_eq!(claim.secret, secret);
            }
            other => panic!("expected a claim event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unrelated_log_is_skipped() {
        let contract = Address::repeat_byte(0xcc);
        let provider = Arc::new(MockEvm::new());
        let source = SwapEventSource::new(provider, contract);
        assert!(source.decode_event(&Log::default()).is_none());
    }

    #[tokio::test]
    async fn test_listener_registration_and_dispatch() {
        let contract = Address::repeat_byte(0xcc);
        let provider = Arc::new(MockEvm::new());
        let source = SwapEventSource::new(provider, contract);
        let listener = Arc::new(CountingListener {
            seen: AtomicUsize::new(0),
        });
        let id = source.register(listener.clone());
        let event = source
            .decode_event(&claim_log(contract, B256::repeat_byte(0x31), B256::ZERO))
            .unwrap();
        source.dispatch(vec![event.clone(), event.clone()]).await;
        assert_eq!(listener.seen.load(Ordering::Relaxed), 2);

        source.unregister(id);
        source.dispatch(vec![event]).await;
        assert_eq!(listener.seen.load(Ordering::Relaxed), 2);
    }
}
