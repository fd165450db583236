// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Small helpers: wall-clock access and bounded retries.

use std::{
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use crate::error::SwapError;

/// Delay between retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Runs `operation` up to `max_attempts` times, retrying on errors for which
/// `should_retry` returns `true`.
///
/// The classifier lets callers short-circuit on errors that can never succeed
/// on retry, e.g. failed signature verification.
pub async fn try_with_retries<T, F, Fut, C>(
    max_attempts: usize,
    should_retry: C,
    mut operation: F,
) -> Result<T, SwapError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SwapError>>,
    C: Fn(&SwapError) -> bool,
{
    assert!(max_attempts > 0);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts && should_retry(&error) => {
                warn!(%error, attempt, "operation failed; retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(error) => return Err(error),
        }
    }
}
