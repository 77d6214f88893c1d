//! Request-pacing primitives shared by the version API client and the
//! registry sync layer: a fixed-window rate limiter, an exponential-backoff
//! retry policy for throttled remote-store calls, and a minimum-interval
//! gate that serializes sync operations.

use std::{future::Future, sync::Mutex as StdMutex};

use shared::error::{StoreError, StoreErrorCode};
use tokio::{
    sync::Mutex,
    time::{sleep, Duration, Instant},
};
use tracing::debug;

pub const DEFAULT_MAX_REQUESTS: usize = 20;
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
/// Minimum spacing between consecutive sync operations.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(2_000);

/// Fixed-window request counter. `can_make_request` is a gate, not a queue:
/// callers must treat `false` as a rejection.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: StdMutex<Vec<Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: StdMutex::new(Vec::new()),
        }
    }

    /// Prunes timestamps older than the window, then either records the
    /// current instant and admits the request, or rejects without recording.
    pub fn can_make_request(&self) -> bool {
        let now = Instant::now();
        let mut requests = self.lock_requests();
        requests.retain(|at| now.duration_since(*at) < self.window);
        if requests.len() < self.max_requests {
            requests.push(now);
            true
        } else {
            false
        }
    }

    /// Remaining budget in the current window. Prunes but never records.
    pub fn remaining_requests(&self) -> usize {
        let now = Instant::now();
        let mut requests = self.lock_requests();
        requests.retain(|at| now.duration_since(*at) < self.window);
        self.max_requests - requests.len()
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<Instant>> {
        match self.requests.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Exponential-backoff retry for resource-exhausted store errors. Any other
/// error class is re-raised immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_resource_exhausted() => {
                    // Pure exponential backoff, no jitter.
                    let delay = self.base_delay * 2u32.pow(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store throttled, backing off before retry"
                    );
                    last_error = Some(err);
                    if attempt + 1 < self.max_retries {
                        sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            StoreError::new(StoreErrorCode::Internal, "retry budget was zero")
        }))
    }
}

/// Single choke point for registry push/pull operations. Enforces a minimum
/// interval between consecutive runs and wraps each run in the retry policy.
///
/// Callers queue on the internal mutex, which is held across the wait and
/// the wrapped operation: a second call arriving early is delayed, never
/// dropped, and two operations' side effects cannot interleave at the store.
pub struct SyncThrottle {
    min_interval: Duration,
    retry: RetryPolicy,
    last_sync: Mutex<Option<Instant>>,
}

impl Default for SyncThrottle {
    fn default() -> Self {
        Self::new(MIN_SYNC_INTERVAL, RetryPolicy::default())
    }
}

impl SyncThrottle {
    pub fn new(min_interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            min_interval,
            retry,
            last_sync: Mutex::new(None),
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last_sync = self.last_sync.lock().await;
        if let Some(previous) = *last_sync {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last_sync = Some(Instant::now());
        self.retry.run(operation).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
