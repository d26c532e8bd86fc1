//! Rate limiting for transfer jobs
//!
//! This crate provides process-wide throttles that the transfer engine consults before starting a
//! transfer and before moving each chunk of bytes. They exist so that a job with millions of objects
//! can be kept from saturating a shared link or a remote service's request quota.
//!
//! # Overview
//!
//! Two independent token buckets are provided:
//!
//! 1. **Transfer throttle** - limits how many transfers may *start* per interval
//! 2. **Chunk throttle** - limits how many chunk-sized I/O operations may run per interval
//!
//! Both buckets are disabled until initialised with a non-zero value; while disabled every
//! acquisition returns immediately.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! // at most 50 transfer starts and 200 chunk operations every 100ms
//! throttle::init_transfer_tokens(50);
//! throttle::init_chunk_tokens(200);
//! tokio::spawn(throttle::run_transfer_replenish_thread(50, Duration::from_millis(100)));
//! tokio::spawn(throttle::run_chunk_replenish_thread(200, Duration::from_millis(100)));
//!
//! throttle::get_transfer_token().await;
//! // a 20 MiB chunk with 8 MiB accounting units needs 3 tokens
//! throttle::get_chunk_tokens(8 << 20, 20 << 20).await;
//! # }
//! ```
//!
//! # Token Calculation
//!
//! For the chunk throttle the number of tokens taken for `len` bytes is:
//!
//! ```text
//! tokens = ⌈max(len, 1) / chunk_size⌉
//! ```
//!
//! so throughput stays proportional to bytes moved regardless of how the engine sized its chunks.

mod semaphore;

static TRANSFER_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();
static CHUNK_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();

pub fn init_transfer_tokens(tokens: usize) {
    TRANSFER_THROTTLE.setup(tokens);
}

pub fn init_chunk_tokens(tokens: usize) {
    CHUNK_THROTTLE.setup(tokens);
}

pub async fn get_transfer_token() {
    TRANSFER_THROTTLE.consume().await;
}

/// Number of chunk tokens `len` bytes cost when accounted in `chunk_size` units.
#[must_use]
pub fn chunk_tokens(chunk_size: u64, len: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    let tokens = 1 + (std::cmp::max(1, len) - 1) / chunk_size;
    u32::try_from(tokens).ok()
}

pub async fn get_chunk_tokens(chunk_size: u64, len: u64) {
    if chunk_size == 0 {
        return;
    }
    match chunk_tokens(chunk_size, len) {
        Some(tokens) => CHUNK_THROTTLE.consume_many(tokens).await,
        None => tracing::error!(
            "chunk size: {} is too small to limit throughput for chunks this big, size: {}",
            chunk_size,
            len,
        ),
    }
}

pub async fn run_transfer_replenish_thread(replenish: usize, interval: std::time::Duration) {
    TRANSFER_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

pub async fn run_chunk_replenish_thread(replenish: usize, interval: std::time::Duration) {
    CHUNK_THROTTLE.run_replenish_thread(replenish, interval).await;
}
