/// Throughput tracking for a streaming session.
///
/// Samples are taken on a fixed cadence measured against a [`Clock`]; a
/// sample never happens before the interval has elapsed since the previous
/// one. Rates are only defined once two samples exist.

use std::time::{Duration, Instant};

use crate::protocol::PROGRESS_INTERVAL;

/// Source of wall-clock time for the engine.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Point-in-time throughput figures, handed to the consumer on every sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub first_time: Instant,
    pub previous_time: Instant,
    pub current_time: Instant,
    pub total_bytes: u64,
    pub previous_total_bytes: u64,
    /// Seconds since the session started streaming.
    pub total_elapsed: f64,
    /// Bytes per second over the last sample window.
    pub current_rate: Option<f64>,
    /// Bytes per second over the whole session.
    pub total_rate: Option<f64>,
}

impl ProgressSnapshot {
    fn new(now: Instant) -> Self {
        Self {
            first_time: now,
            previous_time: now,
            current_time: now,
            total_bytes: 0,
            previous_total_bytes: 0,
            total_elapsed: 0.0,
            current_rate: None,
            total_rate: None,
        }
    }

    /// MiB transferred so far.
    pub fn total_mib(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Maintains the cumulative byte counter and the sampled snapshot.
pub struct ProgressTracker {
    snapshot: ProgressSnapshot,
    interval: Duration,
    has_previous: bool,
}

impl ProgressTracker {
    pub fn start(now: Instant) -> Self {
        Self::with_interval(now, PROGRESS_INTERVAL)
    }

    pub fn with_interval(now: Instant, interval: Duration) -> Self {
        Self {
            snapshot: ProgressSnapshot::new(now),
            interval,
            has_previous: false,
        }
    }

    /// Credit payload bytes. Visible in the next sample.
    #[inline]
    pub fn record_bytes(&mut self, bytes: usize) {
        self.snapshot.total_bytes += bytes as u64;
    }

    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.snapshot.total_bytes
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Take a sample if the interval has elapsed since the last one.
    ///
    /// Returns the updated snapshot; the caller delivers it and then calls
    /// [`roll_forward`](Self::roll_forward).
    pub fn poll(&mut self, now: Instant) -> Option<&ProgressSnapshot> {
        let since_last = now.saturating_duration_since(self.snapshot.current_time);
        if since_last < self.interval {
            return None;
        }

        let s = &mut self.snapshot;
        s.current_time = now;
        s.total_elapsed = now.saturating_duration_since(s.first_time).as_secs_f64();

        if self.has_previous {
            let window = now.saturating_duration_since(s.previous_time).as_secs_f64();
            if window > 0.0 {
                s.current_rate = Some((s.total_bytes - s.previous_total_bytes) as f64 / window);
            }
            if s.total_elapsed > 0.0 {
                s.total_rate = Some(s.total_bytes as f64 / s.total_elapsed);
            }
        }

        Some(&self.snapshot)
    }

    /// Make the current sample the previous one.
    pub fn roll_forward(&mut self) {
        self.snapshot.previous_time = self.snapshot.current_time;
        self.snapshot.previous_total_bytes = self.snapshot.total_bytes;
        self.has_previous = true;
    }
}
