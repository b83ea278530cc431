use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket shared by every connection of one user key.
///
/// Cloning yields another handle to the same bucket. A take may drive the balance below zero;
/// the caller then waits until the debt is repaid, so a transfer larger than the capacity is
/// still admitted at the configured rate.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<TokenBucketInner>>,
}

struct TokenBucketInner {
    bytes_per_second: u64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Bucket refilled at `bytes_per_second`, holding at most one second worth of tokens.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TokenBucketInner {
                bytes_per_second,
                tokens: bytes_per_second as f64,
                last_update: Instant::now(),
            })),
        }
    }

    pub fn rate(&self) -> u64 {
        self.inner.lock().bytes_per_second
    }

    /// Change the refill rate in place. Connections holding this handle pick it up on their
    /// next read or write.
    pub fn set_rate(&self, bytes_per_second: u64) {
        let mut inner = self.inner.lock();
        inner.refill_tokens();
        inner.bytes_per_second = bytes_per_second;
        inner.tokens = inner.tokens.min(bytes_per_second as f64);
    }

    /// Try to consume tokens, returns true if allowed
    pub fn try_consume(&self, bytes: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.bytes_per_second == 0 {
            return true;
        }
        inner.refill_tokens();

        if inner.tokens >= bytes as f64 {
            inner.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Take `bytes` tokens unconditionally and return how long the caller has to wait before
    /// the bucket is out of debt again.
    pub fn take(&self, bytes: u64) -> Duration {
        let mut inner = self.inner.lock();
        if inner.bytes_per_second == 0 || bytes == 0 {
            return Duration::ZERO;
        }
        inner.refill_tokens();
        inner.tokens -= bytes as f64;
        if inner.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-inner.tokens / inner.bytes_per_second as f64)
        }
    }

    /// Give back tokens taken for bytes that were never transferred. The balance never rises
    /// above one second worth of tokens.
    pub fn refund(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        if inner.bytes_per_second == 0 || bytes == 0 {
            return;
        }
        inner.refill_tokens();
        inner.tokens = (inner.tokens + bytes as f64).min(inner.bytes_per_second as f64);
    }

    /// Wait until `bytes` tokens are paid for
    pub async fn consume(&self, bytes: u64) {
        let wait = self.take(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available, zero while in debt
    pub fn available(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.refill_tokens();
        inner.tokens.max(0.0) as u64
    }

    /// True when both handles point at the same bucket
    pub fn ptr_eq(&self, other: &TokenBucket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("bytes_per_second", &self.rate())
            .finish()
    }
}

impl TokenBucketInner {
    fn refill_tokens(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        let new_tokens = elapsed.as_secs_f64() * self.bytes_per_second as f64;

        self.tokens = (self.tokens + new_tokens).min(self.bytes_per_second as f64);
        self.last_update = now;
    }
}
