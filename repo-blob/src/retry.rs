//! Exponential backoff for transport-tier errors.
//!
//! Retriable errors never reach the component above the blob-store adapter;
//! this is the one place that tier is handled.

use std::thread::sleep;
use std::time::Duration;

use rand::Rng;
use repo_types::{RepoError, Result};

const BASE_DELAY_MS: u64 = 100;
const FACTOR: u32 = 2;
const MAX_RETRIES: u32 = 8;

/// Retries `op` while it returns `RepoError::Retriable`, with exponential
/// backoff (base 100ms, factor 2, jitter, cap 8 retries). Any other error,
/// or exhausting the retry budget, is returned to the caller.
pub fn with_backoff<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(RepoError::Retriable(msg)) if attempt < MAX_RETRIES => {
                let exp = BASE_DELAY_MS.saturating_mul(FACTOR.pow(attempt) as u64);
                let jitter = rand::thread_rng().gen_range(0..=exp / 2 + 1);
                log::debug!(
                    "retriable blob store error ({msg}), attempt {attempt}, backing off {}ms",
                    exp + jitter
                );
                sleep(Duration::from_millis(exp + jitter));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
