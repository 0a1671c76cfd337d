//! Throughput sampling and low-speed detection for downloads.
//!
//! Both types take explicit `Instant`s so tests can drive them with a
//! synthetic clock.

use std::time::{Duration, Instant};

/// Abort threshold for a stalled transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowSpeedPolicy {
    /// Throughput below this counts as slow.
    pub min_bytes_per_sec: f64,
    /// How long throughput may stay slow before the transfer is abandoned.
    pub grace: Duration,
}

/// Measures throughput over fixed wall-clock windows.
#[derive(Debug)]
pub struct ThroughputSampler {
    interval: Duration,
    window_start: Instant,
    window_bytes: u64,
    started: Instant,
    total_bytes: u64,
}

/// One throughput sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Bytes per second over the window that just closed.
    pub bytes_per_sec: f64,
    /// Bytes per second since the sampler started.
    pub average_bytes_per_sec: f64,
}

impl ThroughputSampler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            window_bytes: 0,
            started: now,
            total_bytes: 0,
        }
    }

    /// Count bytes received.
    pub fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        self.total_bytes += bytes;
    }

    /// Time left until the current window closes.
    pub fn until_next_sample(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }

    /// Close the window if the interval has elapsed.
    pub fn sample(&mut self, now: Instant) -> Option<Sample> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let bytes_per_sec = if secs > 0.0 {
            self.window_bytes as f64 / secs
        } else {
            0.0
        };

        self.window_start = now;
        self.window_bytes = 0;

        Some(Sample {
            bytes_per_sec,
            average_bytes_per_sec: self.average(now),
        })
    }

    /// Average throughput since the sampler started.
    pub fn average(&self, now: Instant) -> f64 {
        let secs = now.saturating_duration_since(self.started).as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Tracks how long throughput has stayed below the policy threshold.
#[derive(Debug)]
pub struct LowSpeedDetector {
    policy: LowSpeedPolicy,
    slow_since: Option<Instant>,
}

impl LowSpeedDetector {
    pub fn new(policy: LowSpeedPolicy) -> Self {
        Self {
            policy,
            slow_since: None,
        }
    }

    pub fn policy(&self) -> LowSpeedPolicy {
        self.policy
    }

    /// Feed a sample. Returns how long the transfer has been slow once that
    /// exceeds the grace period.
    pub fn observe(&mut self, bytes_per_sec: f64, now: Instant) -> Option<Duration> {
        if bytes_per_sec >= self.policy.min_bytes_per_sec {
            self.slow_since = None;
            return None;
        }

        let since = *self.slow_since.get_or_insert(now);
        let slow_for = now.saturating_duration_since(since);
        (slow_for > self.policy.grace).then_some(slow_for)
    }
}
