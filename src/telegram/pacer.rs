//! Pacing between connection-level operations.
//!
//! Worker sessions are started and stopped one at a time with a
//! minimum interval in between, so a fleet boot or shutdown does not
//! hammer the connection layer.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Enforces a minimum interval between consecutive operations.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_operation: Mutex<Option<Instant>>,
}

impl Pacer {
    /// Creates a pacer with the given minimum interval.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_operation: Mutex::new(None),
        }
    }

    /// Waits until the next operation is due, then marks it performed.
    ///
    /// The first call never waits. Returns the duration waited.
    pub async fn pace(&self) -> Duration {
        let mut last = self.last_operation.lock().await;

        let wait_duration = match *last {
            Some(last_time) => {
                let elapsed = last_time.elapsed();
                if elapsed < self.min_interval {
                    self.min_interval - elapsed
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };

        if !wait_duration.is_zero() {
            debug!("Pacing: waiting {:?} before next operation", wait_duration);
            tokio::time::sleep(wait_duration).await;
        }

        *last = Some(Instant::now());
        wait_duration
    }

    /// Time remaining until the next operation would proceed immediately.
    pub async fn time_until_ready(&self) -> Duration {
        let last = self.last_operation.lock().await;
        match *last {
            Some(last_time) => self.min_interval.saturating_sub(last_time.elapsed()),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_operation_is_immediate() {
        let pacer = Pacer::new(Duration::from_secs(60));
        assert_eq!(pacer.time_until_ready().await, Duration::ZERO);

        let waited = pacer.pace().await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_second_operation_waits() {
        let pacer = Pacer::new(Duration::from_millis(100));
        pacer.pace().await;

        let remaining = pacer.time_until_ready().await;
        assert!(remaining > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_interval_is_respected() {
        let pacer = Pacer::new(Duration::from_secs(2));
        pacer.pace().await;

        let waited = pacer.pace().await;
        assert!(waited >= Duration::from_millis(1900));
    }
}
