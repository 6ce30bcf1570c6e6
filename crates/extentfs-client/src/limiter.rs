//! Byte-valued token buckets for tenant read/write throttling.
//!
//! One bucket per direction, sized in bytes per second with a small fixed
//! burst. Waits use reservation semantics: a request for more bytes than
//! the burst drives the bucket negative and sleeps for the deficit, so a
//! 2 MiB write against a 1 MiB/s limit takes about two seconds rather
//! than failing. An unlimited sentinel (rate ≤ 0) turns a bucket off.
//!
//! Limits are dynamic: the config refresher pushes master-published rates
//! through [`FlowLimiter::set_limit`] once a minute, and operators can do
//! the same at runtime through the engine's `set_read_rate` /
//! `set_write_rate` surface.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::error::{ClientError, Result};

/// Default burst, in bytes-equivalent tokens.
pub const DEFAULT_LIMIT_BURST: u64 = 128;

/// Direction of a throttled transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    Read,
    Write,
}

struct Bucket {
    /// Bytes per second; `None` means unlimited.
    rate: Option<f64>,
    /// Current tokens. Negative while reserved ahead of refill.
    tokens: f64,
    burst: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: i64, burst: u64) -> Self {
        Self {
            rate: if rate > 0 { Some(rate as f64) } else { None },
            tokens: burst as f64,
            burst: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + rate * elapsed).min(self.burst);
        }
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate: i64) {
        self.rate = if rate > 0 { Some(rate as f64) } else { None };
        self.tokens = self.burst;
        self.last_refill = Instant::now();
    }
}

/// Read/write token buckets shared by every streamer of an engine.
pub struct FlowLimiter {
    read: Mutex<Bucket>,
    write: Mutex<Bucket>,
}

impl FlowLimiter {
    /// Build with the default burst. Rates ≤ 0 mean unlimited.
    pub fn new(read_rate: i64, write_rate: i64) -> Self {
        Self::with_burst(read_rate, write_rate, DEFAULT_LIMIT_BURST)
    }

    pub fn with_burst(read_rate: i64, write_rate: i64, burst: u64) -> Self {
        Self {
            read: Mutex::new(Bucket::new(read_rate, burst)),
            write: Mutex::new(Bucket::new(write_rate, burst)),
        }
    }

    fn bucket(&self, kind: FlowKind) -> &Mutex<Bucket> {
        match kind {
            FlowKind::Read => &self.read,
            FlowKind::Write => &self.write,
        }
    }

    /// Reserve `bytes` tokens, sleeping until the reservation is covered.
    ///
    /// If `deadline` would pass before the reservation is covered, the
    /// tokens are returned and `RateLimited` is surfaced without sleeping.
    pub async fn wait(
        &self,
        kind: FlowKind,
        bytes: u64,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        let delay = {
            let mut bucket = self.bucket(kind).lock().await;
            bucket.refill();
            let rate = match bucket.rate {
                None => return Ok(()),
                Some(rate) => rate,
            };
            bucket.tokens -= bytes as f64;
            if bucket.tokens >= 0.0 {
                return Ok(());
            }
            let delay = Duration::from_secs_f64(-bucket.tokens / rate);
            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    // Undo the reservation; the caller gets nothing.
                    bucket.tokens += bytes as f64;
                    return Err(ClientError::RateLimited);
                }
            }
            delay
        };

        sleep(delay).await;
        Ok(())
    }

    /// Apply a new rate. ≤ 0 means unlimited. Returns the applied value
    /// as the runtime control surface reports it.
    pub async fn set_limit(&self, kind: FlowKind, rate: i64) -> String {
        let mut bucket = self.bucket(kind).lock().await;
        bucket.set_rate(rate);
        match bucket.rate {
            Some(rate) => format!("{}", rate as u64),
            None => "unlimited".to_string(),
        }
    }

    /// Current rate in bytes/s, `None` when unlimited.
    pub async fn rate(&self, kind: FlowKind) -> Option<u64> {
        self.bucket(kind).lock().await.rate.map(|r| r as u64)
    }

    /// Two-line textual summary for the runtime control surface.
    pub async fn describe(&self) -> String {
        format!(
            "read: {}\nwrite: {}\n",
            describe_rate(self.rate(FlowKind::Read).await),
            describe_rate(self.rate(FlowKind::Write).await),
        )
    }
}

fn describe_rate(rate: Option<u64>) -> RateDisplay {
    RateDisplay(rate)
}

struct RateDisplay(Option<u64>);

impl fmt::Display for RateDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(rate) => write!(f, "{}", rate),
            None => write!(f, "unlimited"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = FlowLimiter::new(0, -1);
        limiter
            .wait(FlowKind::Read, 100 * 1024 * 1024, None)
            .await
            .unwrap();
        limiter
            .wait(FlowKind::Write, 100 * 1024 * 1024, None)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_wait_matches_rate() {
        let limiter = FlowLimiter::new(0, 1024);

        // Burst (128) is free; the remaining 1920 tokens refill at
        // 1024/s, so this should take ~1.875 s.
        let start = Instant::now();
        limiter.wait(FlowKind::Write, 2048, None).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1800), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2000), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_rate_limited() {
        let limiter = FlowLimiter::new(0, 1024);
        let deadline = Instant::now() + Duration::from_millis(100);

        let err = limiter
            .wait(FlowKind::Write, 1024 * 1024, Some(deadline))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RateLimited));

        // The failed reservation must not have consumed tokens: a wait
        // within the burst goes through immediately.
        let start = Instant::now();
        limiter.wait(FlowKind::Write, 64, None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_set_limit_zero_is_unlimited() {
        let limiter = FlowLimiter::new(4096, 4096);
        assert_eq!(limiter.set_limit(FlowKind::Read, 0).await, "unlimited");
        assert_eq!(limiter.rate(FlowKind::Read).await, None);
        assert_eq!(limiter.set_limit(FlowKind::Write, 2048).await, "2048");
        assert_eq!(limiter.rate(FlowKind::Write).await, Some(2048));
    }

    #[tokio::test]
    async fn test_describe_format() {
        let limiter = FlowLimiter::new(1024, 0);
        assert_eq!(limiter.describe().await, "read: 1024\nwrite: unlimited\n");
    }

    #[tokio::test]
    async fn test_zero_bytes_is_free() {
        let limiter = FlowLimiter::new(1, 1);
        // Would wait forever if it reserved anything.
        limiter.wait(FlowKind::Read, 0, None).await.unwrap();
    }
}
