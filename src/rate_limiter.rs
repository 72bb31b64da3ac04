use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKind {
    Read,
    Write,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    backoff_n: u32,
    backoff_until: Option<Instant>,
}

impl Bucket {
    fn new(rate: f64) -> Self {
        Self {
            capacity: rate,
            tokens: rate,
            refill_per_sec: rate,
            last_refill: Instant::now(),
            backoff_n: 0,
            backoff_until: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn fill_level(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Dual token-bucket limiter: a read bucket (20/s, burst 20) and a write
/// bucket (10/s, burst 10). `acquire` blocks until a token is available,
/// honoring any 429-triggered backoff window on top of the steady rate.
pub struct RateLimiter {
    read: Mutex<Bucket>,
    write: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(read_rate: u32, write_rate: u32) -> Self {
        Self {
            read: Mutex::new(Bucket::new(read_rate as f64)),
            write: Mutex::new(Bucket::new(write_rate as f64)),
        }
    }

    fn bucket(&self, kind: RateKind) -> &Mutex<Bucket> {
        match kind {
            RateKind::Read => &self.read,
            RateKind::Write => &self.write,
        }
    }

    pub async fn acquire(&self, kind: RateKind) {
        loop {
            let wait = {
                let mut bucket = self.bucket(kind).lock().await;
                if let Some(until) = bucket.backoff_until {
                    if Instant::now() < until {
                        Some(until - Instant::now())
                    } else {
                        bucket.backoff_until = None;
                        None
                    }
                } else {
                    None
                }
            };
            if let Some(d) = wait {
                sleep(d).await;
                continue;
            }

            let mut bucket = self.bucket(kind).lock().await;
            bucket.refill();
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - bucket.tokens;
            let wait_secs = deficit / bucket.refill_per_sec;
            drop(bucket);
            sleep(Duration::from_secs_f64(wait_secs.max(0.001))).await;
        }
    }

    /// Called when a REST call returns 429 for `kind`. Imposes
    /// `2^n * 100ms` jitter capped at 30s; `n` resets on the next success.
    pub async fn note_rate_limited(&self, kind: RateKind) {
        let mut bucket = self.bucket(kind).lock().await;
        bucket.backoff_n = bucket.backoff_n.saturating_add(1);
        let base_ms = 100u64.saturating_mul(1u64 << bucket.backoff_n.min(20));
        let capped_ms = base_ms.min(30_000);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped_ms / 4).min(capped_ms);
        let total = Duration::from_millis(capped_ms.saturating_add(jitter_ms).min(30_000));
        bucket.backoff_until = Some(Instant::now() + total);
    }

    pub async fn note_success(&self, kind: RateKind) {
        let mut bucket = self.bucket(kind).lock().await;
        bucket.backoff_n = 0;
    }

    pub async fn fill_level(&self, kind: RateKind) -> f64 {
        self.bucket(kind).lock().await.fill_level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_drains_burst_then_blocks() {
        let limiter = RateLimiter::new(20, 10);
        for _ in 0..20 {
            limiter.acquire(RateKind::Read).await;
        }
        assert!(limiter.fill_level(RateKind::Read).await < 1.0);
    }

    #[tokio::test]
    async fn note_rate_limited_imposes_backoff() {
        let limiter = RateLimiter::new(20, 10);
        limiter.note_rate_limited(RateKind::Write).await;
        let start = Instant::now();
        limiter.acquire(RateKind::Write).await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn success_resets_backoff_exponent() {
        let limiter = RateLimiter::new(20, 10);
        limiter.note_rate_limited(RateKind::Write).await;
        limiter.note_success(RateKind::Write).await;
        let bucket = limiter.write.lock().await;
        assert_eq!(bucket.backoff_n, 0);
    }
}
