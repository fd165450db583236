// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The swap-record store consumed by the engine.

use std::collections::HashMap;

use alloy_primitives::B256;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{engine::Swap, error::SwapError};

/// A key/value store of swap records, keyed by payment hash.
///
/// Implementations persist the serialized record; the engine loads the full
/// map once at startup and writes through on every transition.
#[async_trait]
pub trait SwapStorage: Send + Sync {
    async fn load_all_swaps(&self) -> Result<HashMap<B256, Swap>, SwapError>;

    async fn save(&self, swap: &Swap) -> Result<(), SwapError>;

    async fn save_many(&self, swaps: &[Swap]) -> Result<(), SwapError> {
        for swap in swaps {
            self.save(swap).await?;
        }
        Ok(())
    }

    async fn remove(&self, swap: &Swap) -> Result<(), SwapError>;
}

/// An in-memory store, for tests and ephemeral clients.
#[derive(Default)]
pub struct MemorySwapStorage {
    swaps: Mutex<HashMap<B256, Swap>>,
}

impl MemorySwapStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with existing records.
    pub async fn with_swaps(swaps: impl IntoIterator<Item = Swap>) -> Self {
        let storage = Self::default();
        {
            let mut guard = storage.swaps.lock().await;
            for swap in swaps {
                guard.insert(swap.payment_hash, swap);
            }
        }
        storage
    }
}

#[async_trait]
impl SwapStorage for MemorySwapStorage {
    async fn load_all_swaps(&self) -> Result<HashMap<B256, Swap>, SwapError> {
        Ok(self.swaps.lock().await.clone())
    }

    async fn save(&self, swap: &Swap) -> Result<(), SwapError> {
        self.swaps
            .lock()
            .await
            .insert(swap.payment_hash, swap.clone());
        Ok(())
    }

    async fn remove(&self, swap: &Swap) -> Result<(), SwapError> {
        self.swaps.lock().await.remove(&swap.payment_hash);
        Ok(())
    }
}
