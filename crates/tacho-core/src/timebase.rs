use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Monotonic microsecond clock shared by the edge handler and the control tasks.
///
/// Backed by the tokio clock so a paused test runtime drives edge timestamps too.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Wall-clock microseconds since Unix epoch (for journal entries only).
    pub fn unix_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_clock() {
        let timebase = TimeBase::new();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let now = timebase.now_us();
        assert!((20_000..21_000).contains(&now), "now_us = {now}");
    }
}
