//! Rate limiting for chunk transfers
//!
//! Two independent token buckets are provided:
//!
//! 1. **Chunk operations throttle** - limits how many chunks per second are put on the wire
//! 2. **Bandwidth limit** - limits how many payload bytes per second are put on the wire
//!
//! Both are token-bucket semaphores that are replenished by a background task at a fixed
//! interval. When a bucket was never configured (or configured with `0`) acquiring tokens is a
//! no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 100 MiB/s, replenished every 100ms
//! let interval = Duration::from_millis(100);
//! let tokens = throttle::bandwidth_tokens_per_interval(100 * 1024 * 1024, interval);
//! throttle::init_bandwidth_tokens(tokens);
//! tokio::spawn(throttle::run_bandwidth_replenish_thread(tokens, interval));
//!
//! // before sending a 4 MiB chunk
//! throttle::get_bandwidth_tokens(4 * 1024 * 1024).await;
//! # }
//! ```
//!
//! # Token Calculation
//!
//! One bandwidth token stands for [`BANDWIDTH_TOKEN_BYTES`] bytes. A chunk of `len` bytes
//! requires:
//!
//! ```text
//! tokens = ⌈len / BANDWIDTH_TOKEN_BYTES⌉
//! ```
//!
//! Requests larger than one interval's worth of tokens are served in several pieces, so a chunk
//! bigger than the per-interval budget is simply spread over multiple intervals.

mod semaphore;

/// Number of payload bytes represented by a single bandwidth token.
pub const BANDWIDTH_TOKEN_BYTES: u64 = 1024;

static CHUNK_OPS_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static BANDWIDTH_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);

pub fn init_chunk_ops_tokens(ops_tokens: usize) {
    CHUNK_OPS_THROTTLE.setup(ops_tokens);
}

pub fn init_bandwidth_tokens(tokens: usize) {
    BANDWIDTH_THROTTLE.setup(tokens);
}

pub async fn get_chunk_ops_token() {
    CHUNK_OPS_THROTTLE.consume().await;
}

/// Number of bandwidth tokens needed to send `bytes` payload bytes.
pub fn bandwidth_tokens_for(bytes: u64) -> u64 {
    if bytes == 0 {
        return 0;
    }
    1 + (bytes - 1) / BANDWIDTH_TOKEN_BYTES
}

/// Converts a bytes-per-second limit into tokens added per replenish interval (at least 1).
pub fn bandwidth_tokens_per_interval(bytes_per_sec: u64, interval: std::time::Duration) -> usize {
    let bytes_per_interval = (bytes_per_sec as f64 * interval.as_secs_f64()) as u64;
    let tokens = bandwidth_tokens_for(bytes_per_interval).max(1);
    usize::try_from(tokens).unwrap_or(usize::MAX)
}

pub async fn get_bandwidth_tokens(bytes: u64) {
    let tokens = bandwidth_tokens_for(bytes);
    if tokens > 0 {
        BANDWIDTH_THROTTLE.consume_many(tokens).await;
    }
}

pub async fn run_chunk_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    CHUNK_OPS_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

pub async fn run_bandwidth_replenish_thread(replenish: usize, interval: std::time::Duration) {
    BANDWIDTH_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}
