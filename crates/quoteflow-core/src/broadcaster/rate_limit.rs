use std::time::Duration;

use tokio::time::Instant;

/// Fixed-window counter for inbound control messages of one connection.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Count one message at `now`.
    ///
    /// Returns the time until the window resets if `limit` messages were
    /// already accepted in the current window.
    pub fn check(&mut self, now: Instant, limit: u32, window: Duration) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count >= limit {
            let retry_after = window.saturating_sub(now.saturating_duration_since(self.window_start));
            return Err(retry_after);
        }
        self.count += 1;
        Ok(())
    }

    #[cfg(test)]
    fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_limit_and_reset() {
        let window = Duration::from_secs(60);
        let mut rate = RateWindow::new(Instant::now());

        for _ in 0..3 {
            assert!(rate.check(Instant::now(), 3, window).is_ok());
        }
        tokio::time::advance(Duration::from_secs(20)).await;
        let retry_after = rate.check(Instant::now(), 3, window).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(40));
        assert_eq!(rate.count(), 3);

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(rate.check(Instant::now(), 3, window).is_ok());
        assert_eq!(rate.count(), 1);
    }
}
