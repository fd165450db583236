// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::SolValue;
use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::{
    error::SwapError,
    test_utils::{
        linked_chain, raw_header, store_fork_header_log, store_header_log, stored_genesis,
        MockBitcoin, MockEvm,
    },
};

const RELAY: Address = Address::repeat_byte(0xbb);
const LIMIT: u64 = 2500;

fn packed_tip(height: u32, work: U256) -> U256 {
    (U256::from(height) << 224) | work
}

/// Wires the mock node to answer the relay's view calls.
fn script_relay_views(
    evm: &MockEvm,
    tip_height: u32,
    tip_work: U256,
    tip_commit: B256,
    commitments: HashMap<u32, B256>,
    fork_counter: u64,
) {
    evm.set_call_handler(move |_to, data| {
        if data.len() < 4 {
            return Err(SwapError::InvalidArgument("short calldata".to_string()));
        }
        if data[..4] == getChainTipCall::SELECTOR {
            Ok(packed_tip(tip_height, tip_work).abi_encode().into())
        } else if data[..4] == getTipCommitHashCall::SELECTOR {
            Ok(tip_commit.abi_encode().into())
        } else if data[..4] == getCommitHashCall::SELECTOR {
            let call = getCommitHashCall::abi_decode(data)?;
            let height = call.height.to::<u32>();
            Ok(commitments
                .get(&height)
                .copied()
                .unwrap_or_default()
                .abi_encode()
                .into())
        } else if data[..4] == getForkCounterCall::SELECTOR {
            Ok(U256::from(fork_counter).abi_encode().into())
        } else {
            Err(SwapError::InvalidArgument("unexpected call".to_string()))
        }
    });
}

fn relay_client(evm: Arc<MockEvm>) -> BtcRelayClient<MockEvm> {
    BtcRelayClient::new(evm, RELAY, LIMIT)
}

#[tokio::test]
async fn test_get_tip_unpacks_height_and_work() {
    let evm = Arc::new(MockEvm::new());
    let work = U256::from(123_456_789u64);
    let commit = B256::repeat_byte(0x17);
    script_relay_views(&evm, 800_000, work, commit, HashMap::new(), 0);
    let relay = relay_client(evm);
    let tip = relay.get_tip().await.unwrap().unwrap();
    assert_eq!(tip.block_height, 800_000);
    assert_eq!(tip.chain_work, work);
    assert_eq!(tip.commit_hash, commit);
}

#[tokio::test]
async fn test_get_tip_is_none_before_bootstrap() {
    let evm = Arc::new(MockEvm::new());
    script_relay_views(&evm, 0, U256::ZERO, B256::ZERO, HashMap::new(), 0);
    let relay = relay_client(evm);
    assert!(relay.get_tip().await.unwrap().is_none());
}

#[tokio::test]
async fn test_save_initial_header_validates_timestamps() {
    let evm = Arc::new(MockEvm::new());
    let relay = relay_client(evm);
    let header = raw_header([0u8; 32], 1_700_000_000);
    let result =
        relay.save_initial_header(header, 800_000, U256::from(1u64), 1_700_000_000, &[0u32; 9]);
    assert_matches!(result, Err(SwapError::InvalidArgument(_)));

    let (stored, tx) = relay
        .save_initial_header(
            header,
            800_000,
            U256::from(1u64),
            1_700_000_000,
            &[1_700_000_000; 10],
        )
        .unwrap();
    assert_eq!(stored.block_height, 800_000);
    assert_eq!(tx.gas, Some(GAS_INITIAL_STORE_HEADER));
    let input = tx.input.input().unwrap();
    assert_eq!(&input[..4], setInitialBlockheaderCall::SELECTOR.as_slice());
}

#[tokio::test]
async fn test_save_main_headers_precomputes_chain() {
    let evm = Arc::new(MockEvm::new());
    let relay = relay_client(evm);
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (raws, expected) = linked_chain(&genesis, 3);
    let submission = relay.save_main_headers(&raws, &genesis).unwrap();
    assert_eq!(submission.fork_id, 0);
    assert_eq!(submission.computed, expected);
    assert_eq!(submission.last_stored, expected[2]);
    assert_eq!(
        submission.tx.gas,
        Some(GAS_MAIN_BASE + 3 * GAS_MAIN_PER_HEADER)
    );
    let input = submission.tx.input.input().unwrap();
    assert_eq!(&input[..4], submitMainBlockheadersCall::SELECTOR.as_slice());
}

#[tokio::test]
async fn test_save_main_headers_rejects_broken_linkage() {
    let evm = Arc::new(MockEvm::new());
    let relay = relay_client(evm);
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let unlinked = raw_header([0x99; 32], 1_700_000_600);
    assert_matches!(
        relay.save_main_headers(&[unlinked], &genesis),
        Err(SwapError::InvalidArgument(_))
    );
    assert_matches!(
        relay.save_main_headers(&[], &genesis),
        Err(SwapError::InvalidArgument(_))
    );
}

#[tokio::test]
async fn test_new_fork_promotion_to_main_chain() {
    let evm = Arc::new(MockEvm::new());
    script_relay_views(
        &evm,
        800_010,
        U256::from(10u64),
        B256::ZERO,
        HashMap::new(),
        5,
    );
    let relay = relay_client(evm);
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (raws, _) = linked_chain(&genesis, 2);

    // Tail work exceeds the tip's: promoted, fork id 0.
    let submission = relay
        .save_new_fork_headers(&raws, &genesis, U256::from(10u64))
        .await
        .unwrap();
    assert_eq!(submission.fork_id, 0);

    // Tip still heavier: keeps the contract's fork counter.
    let heavy_tip = U256::MAX >> 32;
    let submission = relay
        .save_new_fork_headers(&raws, &genesis, heavy_tip)
        .await
        .unwrap();
    assert_eq!(submission.fork_id, 5);
    assert_eq!(
        submission.tx.gas,
        Some(GAS_FORK_BASE + 2 * GAS_FORK_PER_HEADER)
    );
}

#[tokio::test]
async fn test_save_fork_headers_keeps_fork_id_under_heavier_tip() {
    let evm = Arc::new(MockEvm::new());
    let relay = relay_client(evm);
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (raws, _) = linked_chain(&genesis, 1);
    let submission = relay
        .save_fork_headers(&raws, &genesis, 3, U256::MAX >> 32)
        .unwrap();
    assert_eq!(submission.fork_id, 3);
    let input = submission.tx.input.input().unwrap();
    assert_eq!(&input[..4], submitForkBlockheadersCall::SELECTOR.as_slice());

    let submission = relay
        .save_fork_headers(&raws, &genesis, 3, U256::from(1u64))
        .unwrap();
    assert_eq!(submission.fork_id, 0);
}

#[tokio::test]
async fn test_log_search_hit_in_first_window() {
    // Three store logs in the window; the last one matches the query.
    let evm = Arc::new(MockEvm::new());
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (_, stored) = linked_chain(&genesis, 3);
    let target = stored[2];
    let commitments: HashMap<u32, B256> = stored
        .iter()
        .map(|header| (header.block_height, header.commit_hash()))
        .collect();
    script_relay_views(
        &evm,
        target.block_height,
        target.chain_work,
        target.commit_hash(),
        commitments,
        0,
    );
    let logs: Vec<_> = stored
        .iter()
        .map(|header| store_header_log(RELAY, header))
        .collect();
    evm.set_logs_handler(move |_| logs.clone());
    let relay = relay_client(evm.clone());

    let cancel = CancellationToken::new();
    let found = relay
        .retrieve_log_and_blockheight(
            crate::header::reverse_hash(target.block_hash()),
            target.block_height,
            None,
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.stored, target);
    assert_eq!(found.commit_hash, target.commit_hash());
    assert_eq!(found.tip_height, target.block_height);
    assert_eq!(
        evm.get_logs_calls.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn test_log_search_returns_none_below_required_height() {
    let evm = Arc::new(MockEvm::new());
    let genesis = stored_genesis(800_000, 1_700_000_000);
    script_relay_views(
        &evm,
        genesis.block_height,
        genesis.chain_work,
        genesis.commit_hash(),
        HashMap::new(),
        0,
    );
    let relay = relay_client(evm.clone());
    let cancel = CancellationToken::new();
    // The relay tip is below the height the caller requires.
    let found = relay
        .retrieve_log_and_blockheight([0u8; 32], 800_000, Some(800_006), &cancel)
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(
        evm.get_logs_calls.load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_log_search_pages_backwards_until_hit() {
    // Empty windows until the fourth; the scanner pages backwards with a
    // sleep between windows.
    let evm = Arc::new(MockEvm::new());
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (_, stored) = linked_chain(&genesis, 1);
    let target = stored[0];
    let commitments: HashMap<u32, B256> =
        [(target.block_height, target.commit_hash())].into_iter().collect();
    script_relay_views(
        &evm,
        target.block_height,
        target.chain_work,
        target.commit_hash(),
        commitments,
        0,
    );
    // Head is 10_000: windows start at 7501, 5001, 2501 and 1. Only the
    // last window carries the log.
    let log = store_header_log(RELAY, &target);
    evm.set_logs_handler(move |filter| {
        if filter.get_from_block() == Some(1) {
            vec![log.clone()]
        } else {
            Vec::new()
        }
    });
    let relay = relay_client(evm.clone());
    let cancel = CancellationToken::new();
    let found = relay
        .retrieve_log_and_blockheight(
            crate::header::reverse_hash(target.block_hash()),
            target.block_height,
            None,
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.stored, target);
    assert_eq!(
        evm.get_logs_calls.load(std::sync::atomic::Ordering::Relaxed),
        4
    );
}

#[tokio::test(start_paused = true)]
async fn test_log_search_respects_cancellation() {
    let evm = Arc::new(MockEvm::new());
    script_relay_views(
        &evm,
        800_000,
        U256::from(1u64),
        B256::ZERO,
        HashMap::new(),
        0,
    );
    // Enough L1 blocks that the scan cannot finish before cancellation.
    evm.block_number
        .store(u64::MAX / 2, std::sync::atomic::Ordering::Relaxed);
    let relay = Arc::new(relay_client(evm));
    let cancel = CancellationToken::new();
    let handle = {
        let relay = relay.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            relay
                .retrieve_log_and_blockheight([0x42; 32], 800_000, None, &cancel)
                .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    cancel.cancel();
    assert_matches!(handle.await.unwrap(), Err(SwapError::Cancelled));
}

#[tokio::test]
async fn test_commit_hash_lookup_short_circuits_off_main_chain() {
    let evm = Arc::new(MockEvm::new());
    let genesis = stored_genesis(800_000, 1_700_000_000);
    // The commitment at the queried height differs from the argument.
    let commitments: HashMap<u32, B256> =
        [(genesis.block_height, B256::repeat_byte(0x01))].into_iter().collect();
    script_relay_views(
        &evm,
        genesis.block_height,
        genesis.chain_work,
        B256::repeat_byte(0x01),
        commitments,
        0,
    );
    let relay = relay_client(evm.clone());
    let cancel = CancellationToken::new();
    let found = relay
        .retrieve_log_by_commit_hash(
            genesis.commit_hash(),
            crate::header::reverse_hash(genesis.block_hash()),
            genesis.block_height,
            &cancel,
        )
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(
        evm.get_logs_calls.load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[tokio::test]
async fn test_commit_hash_lookup_finds_log() {
    let evm = Arc::new(MockEvm::new());
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (_, stored) = linked_chain(&genesis, 1);
    let target = stored[0];
    let commitments: HashMap<u32, B256> =
        [(target.block_height, target.commit_hash())].into_iter().collect();
    script_relay_views(
        &evm,
        target.block_height,
        target.chain_work,
        target.commit_hash(),
        commitments,
        0,
    );
    let log = store_header_log(RELAY, &target);
    evm.set_logs_handler(move |_| vec![log.clone()]);
    let relay = relay_client(evm);
    let cancel = CancellationToken::new();
    let found = relay
        .retrieve_log_by_commit_hash(
            target.commit_hash(),
            crate::header::reverse_hash(target.block_hash()),
            target.block_height,
            &cancel,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.stored, target);
}

#[tokio::test]
async fn test_latest_known_block_skips_unknown_forks() {
    // The newest log is a fork block the Bitcoin node does not know; the
    // scanner falls back to the older main-chain log.
    let evm = Arc::new(MockEvm::new());
    let genesis = stored_genesis(800_000, 1_700_000_000);
    let (_, stored) = linked_chain(&genesis, 2);
    let known = stored[0];
    let unknown = stored[1];
    let commitments: HashMap<u32, B256> = [
        (known.block_height, known.commit_hash()),
        (unknown.block_height, unknown.commit_hash()),
    ]
    .into_iter()
    .collect();
    script_relay_views(
        &evm,
        unknown.block_height,
        unknown.chain_work,
        unknown.commit_hash(),
        commitments,
        0,
    );
    let logs = vec![
        store_header_log(RELAY, &known),
        store_fork_header_log(RELAY, &unknown, 2),
    ];
    evm.set_logs_handler(move |_| logs.clone());
    let relay = relay_client(evm);
    let bitcoin = MockBitcoin::default();
    bitcoin.main_chain.lock().unwrap().push(known.block_hash());
    let cancel = CancellationToken::new();
    let found = relay
        .retrieve_latest_known_block_log(&bitcoin, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.stored, known);
}

#[tokio::test]
async fn test_estimate_synchronize_fee() {
    let evm = Arc::new(MockEvm::new());
    script_relay_views(
        &evm,
        800_100,
        U256::from(1u64),
        B256::ZERO,
        HashMap::new(),
        0,
    );
    // EIP-1559 base fee preferred over the legacy gas price.
    evm.base_fee.store(7, std::sync::atomic::Ordering::Relaxed);
    evm.gas_price
        .store(1_000, std::sync::atomic::Ordering::Relaxed);
    let relay = relay_client(evm);

    // Already caught up.
    assert_eq!(
        relay.estimate_synchronize_fee(800_050).await.unwrap(),
        U256::ZERO
    );
    // Ten headers behind.
    assert_eq!(
        relay.estimate_synchronize_fee(800_110).await.unwrap(),
        U256::from(10u64 * GAS_PER_BLOCKHEADER as u64 * 7)
    );
}
