use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay for the current attempt, before jitter
    pub fn base_delay_ms(&self) -> u64 {
        let factor = 2_u64.saturating_pow(self.current_attempt);
        std::cmp::min(self.initial_delay_ms.saturating_mul(factor), self.max_delay_ms)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let base = self.base_delay_ms();
        // Up to 25% jitter so parallel resolvers don't retry in lockstep
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        let delay = base + jitter;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay
        );

        sleep(Duration::from_millis(delay)).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Minimum gap between consecutive requests, shared by every caller
#[derive(Debug)]
pub struct RequestSpacer {
    spacing: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(spacing_ms: u64) -> Self {
        Self {
            spacing: Duration::from_millis(spacing_ms),
            last_request: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait until `spacing` has passed since the previous request
    pub async fn wait(&self) {
        if self.spacing.is_zero() {
            return;
        }
        // Held across the sleep so waiters are released one at a time
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.spacing {
                sleep(self.spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(100, 500, 10);
        assert_eq!(backoff.base_delay_ms(), 100);
        backoff.current_attempt = 1;
        assert_eq!(backoff.base_delay_ms(), 200);
        backoff.current_attempt = 2;
        assert_eq!(backoff.base_delay_ms(), 400);
        backoff.current_attempt = 3;
        assert_eq!(backoff.base_delay_ms(), 500);
        backoff.current_attempt = 70;
        assert_eq!(backoff.base_delay_ms(), 500);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_retries() {
        let mut backoff = ExponentialBackoff::new(1, 2, 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[tokio::test]
    async fn test_spacer_keeps_requests_apart() {
        let spacer = RequestSpacer::new(20);
        let start = Instant::now();
        for _ in 0..4 {
            spacer.wait().await;
        }
        // First request goes straight through, three gaps after it
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_zero_spacing_never_waits() {
        let spacer = RequestSpacer::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            spacer.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
