// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared mocks and fixtures for unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use alloy::rpc::types::{Filter, Log, Transaction, TransactionReceipt, TransactionRequest};
use alloy_primitives::{Address, Bytes, TxHash, B256, U256};
use alloy_sol_types::SolEvent;
use async_trait::async_trait;

use crate::{
    btc::{BlockMerkleProof, BtcTransactionInfo, BitcoinQueries},
    error::SwapError,
    events::SwapDataFetcher,
    header::{RawBlockHeader, StoredBlockHeader, TIMESTAMP_RING},
    intermediary::{IntermediaryApi, LightningReceive, PaymentAuthorization},
    provider::{EvmQueries, FeeData},
    relay::{StoreForkHeader, StoreHeader},
    swap_data::{EvmSwapData, SwapDataFields, SwapKind},
};

type CallHandler = Box<dyn FnMut(Address, &[u8]) -> Result<Bytes, SwapError> + Send>;
type LogsHandler = Box<dyn FnMut(&Filter) -> Vec<Log> + Send>;

/// A scriptable EVM node double.
pub struct MockEvm {
    pub block_number: AtomicU64,
    call_handler: Mutex<CallHandler>,
    logs_handler: Mutex<LogsHandler>,
    pub get_logs_calls: AtomicUsize,
    pub sent: Mutex<Vec<TransactionRequest>>,
    pub gas_price: AtomicU64,
    pub base_fee: AtomicU64,
}

impl Default for MockEvm {
    fn default() -> Self {
        MockEvm {
            block_number: AtomicU64::new(10_000),
            call_handler: Mutex::new(Box::new(|_, _| {
                Err(SwapError::InvalidArgument("unexpected call".to_string()))
            })),
            logs_handler: Mutex::new(Box::new(|_| Vec::new())),
            get_logs_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            gas_price: AtomicU64::new(20),
            base_fee: AtomicU64::new(0),
        }
    }
}

impl MockEvm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call_handler(
        &self,
        handler: impl FnMut(Address, &[u8]) -> Result<Bytes, SwapError> + Send + 'static,
    ) {
        *self.call_handler.lock().unwrap() = Box::new(handler);
    }

    pub fn set_logs_handler(&self, handler: impl FnMut(&Filter) -> Vec<Log> + Send + 'static) {
        *self.logs_handler.lock().unwrap() = Box::new(handler);
    }
}

#[async_trait]
impl EvmQueries for MockEvm {
    async fn get_block_number(&self) -> Result<u64, SwapError> {
        Ok(self.block_number.load(Ordering::Relaxed))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, SwapError> {
        self.get_logs_calls.fetch_add(1, Ordering::Relaxed);
        Ok((self.logs_handler.lock().unwrap())(filter))
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, SwapError> {
        let to = tx.to.and_then(|kind| kind.to().copied()).unwrap_or_default();
        let data = tx
            .input
            .input()
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();
        (self.call_handler.lock().unwrap())(to, &data)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, SwapError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(tx);
        let mut hash = [0u8; 32];
        hash[0] = sent.len() as u8;
        Ok(TxHash::from(hash))
    }

    async fn get_transaction_receipt(
        &self,
        _hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, SwapError> {
        Ok(None)
    }

    async fn get_transaction_by_hash(
        &self,
        _hash: TxHash,
    ) -> Result<Option<Transaction>, SwapError> {
        Ok(None)
    }

    async fn get_fee_data(&self) -> Result<FeeData, SwapError> {
        let base_fee = self.base_fee.load(Ordering::Relaxed);
        Ok(FeeData {
            gas_price: self.gas_price.load(Ordering::Relaxed).into(),
            last_base_fee_per_gas: (base_fee != 0).then_some(base_fee.into()),
            max_priority_fee_per_gas: None,
        })
    }

    async fn get_gas_price(&self) -> Result<u128, SwapError> {
        Ok(self.gas_price.load(Ordering::Relaxed).into())
    }
}

/// A Bitcoin node double with a configurable main-chain set.
#[derive(Default)]
pub struct MockBitcoin {
    pub main_chain: Mutex<Vec<[u8; 32]>>,
    pub transactions: Mutex<HashMap<[u8; 32], BtcTransactionInfo>>,
    pub proofs: Mutex<HashMap<[u8; 32], BlockMerkleProof>>,
}

#[async_trait]
impl BitcoinQueries for MockBitcoin {
    async fn get_block_header(&self, _hash: [u8; 32]) -> Result<RawBlockHeader, SwapError> {
        Err(SwapError::BitcoinRpc("no header fixture".to_string()))
    }

    async fn is_in_main_chain(&self, hash: [u8; 32]) -> Result<bool, SwapError> {
        Ok(self.main_chain.lock().unwrap().contains(&hash))
    }

    async fn get_merkle_proof(
        &self,
        txid: [u8; 32],
        _block_hash: [u8; 32],
    ) -> Result<BlockMerkleProof, SwapError> {
        self.proofs
            .lock()
            .unwrap()
            .get(&txid)
            .cloned()
            .ok_or_else(|| SwapError::BitcoinRpc("no proof fixture".to_string()))
    }

    async fn get_transaction(
        &self,
        txid: [u8; 32],
    ) -> Result<Option<BtcTransactionInfo>, SwapError> {
        Ok(self.transactions.lock().unwrap().get(&txid).cloned())
    }
}

/// Scripted intermediary responses.
pub enum AuthResponse {
    Authorization(PaymentAuthorization),
    Refused(String),
}

#[derive(Default)]
pub struct MockIntermediary {
    /// Responses keyed by payment request.
    pub responses: Mutex<HashMap<String, AuthResponse>>,
    pub polls: AtomicUsize,
}

#[async_trait]
impl IntermediaryApi for MockIntermediary {
    async fn get_payment_authorization(
        &self,
        _url: &str,
        pr: &str,
        _token: Address,
        _offerer: Address,
        _base_fee_sats: u64,
        _fee_ppm: u64,
    ) -> Result<PaymentAuthorization, SwapError> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        match self.responses.lock().unwrap().get(pr) {
            Some(AuthResponse::Authorization(auth)) => Ok(auth.clone()),
            Some(AuthResponse::Refused(reason)) => Err(SwapError::PaymentAuth(reason.clone())),
            None => Ok(PaymentAuthorization {
                is_paid: false,
                data: None,
                prefix: String::new(),
                timeout: 0,
                signature: String::new(),
                expiry: 0,
            }),
        }
    }

    async fn receive_lightning(
        &self,
        _url: &str,
        _amount_sats: u64,
        _claimer: Address,
        _token: Address,
        _payment_hash: B256,
    ) -> Result<LightningReceive, SwapError> {
        Err(SwapError::PaymentAuth("no receive fixture".to_string()))
    }
}

/// A fetcher returning a fixed swap record.
pub struct StaticFetcher(pub Option<EvmSwapData>);

#[async_trait]
impl SwapDataFetcher for StaticFetcher {
    async fn fetch(&self) -> Result<Option<EvmSwapData>, SwapError> {
        Ok(self.0.clone())
    }
}

/// A raw header linking to `previous_blockhash`.
pub fn raw_header(previous_blockhash: [u8; 32], timestamp: u32) -> RawBlockHeader {
    RawBlockHeader {
        version: 0x2000_0000,
        previous_blockhash,
        merkle_root: [0x4d; 32],
        timestamp,
        nbits: 0x1705_3894,
        nonce: 42,
    }
}

/// A stored genesis anchoring test chains at `block_height`.
pub fn stored_genesis(block_height: u32, timestamp: u32) -> StoredBlockHeader {
    StoredBlockHeader {
        header: raw_header([0u8; 32], timestamp),
        last_diff_adjustment: timestamp,
        prev_block_timestamps: [timestamp; TIMESTAMP_RING],
        block_height,
        chain_work: U256::from(1_000_000u64),
    }
}

/// Extends `prev` with `count` linked headers, returning the raw headers and
/// the expected stored chain.
pub fn linked_chain(
    prev: &StoredBlockHeader,
    count: usize,
) -> (Vec<RawBlockHeader>, Vec<StoredBlockHeader>) {
    let mut raws = Vec::with_capacity(count);
    let mut stored = Vec::with_capacity(count);
    let mut current = *prev;
    for i in 0..count {
        let raw = raw_header(current.block_hash(), current.header.timestamp + 600 * (i as u32 + 1));
        current = current.compute_next(raw);
        raws.push(raw);
        stored.push(current);
    }
    (raws, stored)
}

/// A swap record fixture.
pub fn swap_data_fixture(payment_hash: B256, expiry: u64, index: u8) -> EvmSwapData {
    EvmSwapData::from_fields(
        Address::repeat_byte(0x0f),
        Address::repeat_byte(0xc1),
        Address::ZERO,
        U256::from(1_000_000_000u64),
        payment_hash,
        SwapDataFields {
            expiry,
            nonce: 7,
            confirmations: 3,
            kind: SwapKind::Htlc,
            pay_in: false,
            pay_out: true,
            index,
        },
        U256::from(10_000u64),
        U256::ZERO,
        None,
    )
}

/// Wraps a `StoreHeader` event into an RPC log.
pub fn store_header_log(contract: Address, stored: &StoredBlockHeader) -> Log {
    let event = StoreHeader {
        commitHash: stored.commit_hash(),
        blockHash: B256::from(stored.block_hash()),
        storedHeader: stored.serialize().to_vec().into(),
    };
    sol_event_log(contract, event.encode_log_data())
}

/// Wraps a `StoreForkHeader` event into an RPC log.
pub fn store_fork_header_log(contract: Address, stored: &StoredBlockHeader, fork_id: u64) -> Log {
    let event = StoreForkHeader {
        commitHash: stored.commit_hash(),
        blockHash: B256::from(stored.block_hash()),
        forkId: U256::from(fork_id),
        storedHeader: stored.serialize().to_vec().into(),
    };
    sol_event_log(contract, event.encode_log_data())
}

fn sol_event_log(contract: Address, data: alloy_primitives::LogData) -> Log {
    Log {
        inner: alloy_primitives::Log {
            address: contract,
            data,
        },
        ..Default::default()
    }
}
