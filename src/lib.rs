// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client library for trust-minimized atomic swaps between Bitcoin (on-chain
//! and Lightning) and an EVM chain.
//!
//! Settlement on the EVM side is conditional on Bitcoin events verified
//! against a BTC relay (light-client) contract. This crate provides the
//! per-swap state machine ([`engine`]), the relay client with its bit-exact
//! header codec ([`relay`], [`header`]), the swap commitment codec and
//! authorization signatures ([`swap_data`], [`authorization`]), the swap
//! contract client ([`contract`]), the contract event stream ([`events`])
//! and a price-oracle adapter ([`oracle`]).

pub mod authorization;
pub mod btc;
pub mod config;
pub mod contract;
pub mod engine;
pub mod error;
pub mod events;
pub mod header;
pub mod intermediary;
pub mod oracle;
pub mod provider;
pub mod relay;
pub mod storage;
pub mod swap_data;
pub mod util;

#[cfg(test)]
#[path = "unit_tests/test_utils.rs"]
mod test_utils;
