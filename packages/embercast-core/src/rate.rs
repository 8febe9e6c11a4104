//! Sliding-window byte-rate meters.
//!
//! Sources keep two of these: a short incoming window that answers "what is
//! the stream's current bitrate" and a long outgoing window used for the
//! global bandwidth governor. Samples are bucketed per second so the meter
//! stays O(window) regardless of tick frequency.

use std::collections::VecDeque;

/// Byte-rate meter over a sliding window of whole seconds.
pub struct Rate {
    window_secs: u64,
    samples: VecDeque<(u64, u64)>,
    total: u64,
}

impl Rate {
    /// Creates a meter covering the past `window_secs` seconds.
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs: window_secs.max(1),
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Records `bytes` observed at `now` (Unix seconds).
    pub fn add(&mut self, now: u64, bytes: u64) {
        match self.samples.back_mut() {
            Some((ts, sum)) if *ts == now => *sum += bytes,
            _ => self.samples.push_back((now, bytes)),
        }
        self.total += bytes;
        self.expire(now);
    }

    /// Average bytes/sec over the samples currently in the window.
    pub fn average(&mut self, now: u64) -> u64 {
        self.expire(now);
        let (oldest, newest) = match (self.samples.front(), self.samples.back()) {
            (Some(&(o, _)), Some(&(n, _))) => (o, n),
            _ => return 0,
        };
        let span = (newest - oldest).max(1);
        self.total / span
    }

    /// Total bytes currently inside the window.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Discards a fraction of the window, expressed in percent.
    ///
    /// Called when a mount's listener set drains so a later average is not
    /// dominated by traffic from the departed listeners.
    pub fn reduce(&mut self, percent: u64) {
        let keep = self.samples.len().saturating_sub(self.samples.len() * percent as usize / 100);
        while self.samples.len() > keep {
            if let Some((_, bytes)) = self.samples.pop_front() {
                self.total -= bytes;
            }
        }
    }

    fn expire(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.window_secs);
        while let Some(&(ts, bytes)) = self.samples.front() {
            if ts >= cutoff {
                break;
            }
            self.samples.pop_front();
            self.total -= bytes;
        }
    }
}
