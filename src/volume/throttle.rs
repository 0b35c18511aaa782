// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Response-time-based worker backpressure (§4.4 `Throttle`). The formula
//! is fixed (§9): every implementation must match it within floating-point
//! tolerance, so this is a pure function of the observed average, kept
//! free of any I/O so it can be driven with synthetic inputs.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::stats::RollingAverage;

const AVG_THRESHOLD_MS: f64 = 500.0;
const RATIO_DIVISOR_MS: f64 = 2000.0;

/// Whether the calling thread should sleep, and for how long, given the
/// handler's current average response time and the volume's worker count.
/// `threads_throttled` is a live counter of threads currently sleeping in
/// `Throttle`, compared against `threads_to_hold` to decide whether this
/// caller joins them.
pub struct Throttle {
    threads_throttled: AtomicUsize,
    throttle_time: RollingAverage,
}

impl Throttle {
    pub fn new() -> Self {
        Throttle {
            threads_throttled: AtomicUsize::new(0),
            throttle_time: RollingAverage::new(crate::scsi::constants::RESPONSE_TIME_WINDOW),
        }
    }

    /// `avg` is `average_response_time_ms`; `thread_count` is the volume's
    /// `command_thread_count` (`N` in the formula below). Returns the
    /// sleep duration, or `None` if this call should not throttle.
    pub fn decide(&self, avg_response_time_ms: f64, thread_count: u32) -> Option<Duration> {
        if avg_response_time_ms <= AVG_THRESHOLD_MS {
            return None;
        }
        if thread_count <= 2 {
            // ln(N-2) is undefined/non-positive for N <= 2; no thread pool
            // this small can afford to throttle any of its workers.
            return None;
        }
        let ratio = (avg_response_time_ms / RATIO_DIVISOR_MS).min(1.0);
        let threads_to_hold = (ratio * ((thread_count - 2) as f64).ln()).exp() + 1.0;

        let currently_throttled = self.threads_throttled.load(Ordering::Acquire) as f64;
        if currently_throttled < threads_to_hold {
            Some(Duration::from_secs_f64(avg_response_time_ms / 100.0))
        } else {
            None
        }
    }

    /// Runs one throttle cycle: increments the live counter for the
    /// duration of the sleep (the caller actually sleeps; this only
    /// tracks bookkeeping and the rolling throttle-time average), then
    /// decrements it.
    pub fn enter(&self) {
        self.threads_throttled.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit(&self, slept: Duration) {
        self.threads_throttled.fetch_sub(1, Ordering::AcqRel);
        self.throttle_time.add(slept.as_secs_f64() * 1000.0);
    }

    pub fn average_throttle_time_ms(&self) -> f64 {
        self.throttle_time.average()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_never_throttles() {
        let t = Throttle::new();
        assert!(t.decide(499.0, 16).is_none());
    }

    #[test]
    fn matches_formula_at_known_point() {
        let t = Throttle::new();
        let avg = 1000.0;
        let n = 16u32;
        let ratio: f64 = (avg / 2000.0_f64).min(1.0);
        let expected_threads_to_hold = (ratio * ((n - 2) as f64).ln()).exp() + 1.0;
        let sleep = t.decide(avg, n).expect("should throttle when no one else is");
        assert_eq!(sleep, Duration::from_secs_f64(avg / 100.0));
        assert!(expected_threads_to_hold > 1.0);
    }

    #[test]
    fn saturating_ratio_caps_at_one() {
        let t = Throttle::new();
        // avg far beyond 2000ms still produces a valid (finite) decision.
        let sleep = t.decide(50_000.0, 16);
        assert!(sleep.is_some());
    }

    #[test]
    fn small_thread_counts_never_throttle() {
        let t = Throttle::new();
        assert!(t.decide(10_000.0, 2).is_none());
    }

    #[test]
    fn full_occupancy_blocks_further_throttling() {
        let t = Throttle::new();
        // Simulate every slot being full by throttling repeatedly without
        // ever calling exit().
        for _ in 0..20 {
            t.enter();
        }
        assert!(t.decide(1000.0, 16).is_none());
    }
}
