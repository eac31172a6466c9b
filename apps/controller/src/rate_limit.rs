use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max: u32,
    pub skip_paths: Vec<String>,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl WindowState {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn maybe_reset(&mut self, window: Duration) {
        if self.window_start.elapsed() >= window {
            self.window_start = Instant::now();
            self.count = 0;
        }
    }

    fn time_until_reset(&self, window: Duration) -> Duration {
        window.saturating_sub(self.window_start.elapsed())
    }
}

/// Fixed-window admission limiter keyed by caller (owner id).
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, WindowState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Allow or reject one request; on rejection returns the retry-after.
    pub fn check_and_record(&self, caller: &str, path: &str) -> Result<(), Duration> {
        if self
            .config
            .skip_paths
            .iter()
            .any(|skip| path.starts_with(skip.as_str()))
        {
            return Ok(());
        }

        let mut bucket = self
            .buckets
            .entry(caller.to_string())
            .or_insert_with(WindowState::new);
        bucket.maybe_reset(self.config.window);

        if bucket.count >= self.config.max {
            return Err(bucket.time_until_reset(self.config.window));
        }
        bucket.count += 1;
        Ok(())
    }
}
