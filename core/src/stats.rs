// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-range sample histograms for latency and request-rate, with
//! coordinated-omission correction.

/// Maximum per-thread requests-per-second value the request-rate histogram
/// can record, matching the original implementation's bucket sizing.
pub const MAX_THREAD_RATE_S: u64 = 10_000_000;

/// A fixed-range histogram: bucket `v` counts samples whose integer value is
/// exactly `v`, for `v` in `[0, limit)`. Samples outside that range are
/// dropped and reported to the caller so it can bump an out-of-range error
/// counter (e.g. `errors.timeout` for the latency histogram).
#[derive(Debug, Clone)]
pub struct Statistics {
    limit: u64,
    buckets: Vec<u64>,
    min: u64,
    max: u64,
    total: u64,
}

impl Statistics {
    /// Creates a histogram covering samples in `[0, limit)`.
    pub fn new(limit: u64) -> Self {
        Statistics {
            limit,
            buckets: vec![0; limit as usize],
            min: u64::MAX,
            max: 0,
            total: 0,
        }
    }

    /// Builds the latency histogram: one bucket per microsecond up to
    /// `timeout_ms` milliseconds.
    pub fn latency(timeout_ms: u64) -> Self {
        Statistics::new(timeout_ms.saturating_mul(1000))
    }

    /// Builds the per-thread request-rate histogram.
    pub fn request_rate() -> Self {
        Statistics::new(MAX_THREAD_RATE_S)
    }

    /// Total number of in-range samples recorded so far.
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Largest recorded sample, or `0` if none were recorded.
    pub fn max(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.max
        }
    }

    /// Smallest recorded sample, or `0` if none were recorded.
    pub fn min(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.min
        }
    }

    /// Records `value`. Returns `false` if `value` was out of `[0, limit)`
    /// and therefore dropped.
    pub fn record(&mut self, value: u64) -> bool {
        if value >= self.limit {
            return false;
        }
        self.buckets[value as usize] += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.total += 1;
        true
    }

    /// Merges another histogram's buckets into this one (used to combine
    /// per-thread shards at `Aggregator::join`).
    pub fn merge(&mut self, other: &Statistics) {
        assert_eq!(self.limit, other.limit, "cannot merge histograms of differing range");
        for (v, &count) in other.buckets.iter().enumerate() {
            if count == 0 {
                continue;
            }
            self.buckets[v] += count;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.total += other.total;
    }

    /// Arithmetic mean of recorded samples, or `0.0` if none were recorded.
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let sum: u128 = self
            .buckets
            .iter()
            .enumerate()
            .map(|(v, &c)| v as u128 * c as u128)
            .sum();
        sum as f64 / self.total as f64
    }

    /// Sample standard deviation about `mean`.
    pub fn stdev(&self, mean: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let variance: f64 = self
            .buckets
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .map(|(v, &c)| {
                let d = v as f64 - mean;
                d * d * c as f64
            })
            .sum::<f64>()
            / self.total as f64;
        variance.sqrt()
    }

    /// Smallest value `v` such that the cumulative count up to and
    /// including `v` is at least `p` percent of the total. `p` is clamped
    /// to `[0, 100]`.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let p = p.clamp(0.0, 100.0);
        let target = ((p / 100.0) * self.total as f64).ceil().max(1.0) as u64;

        let mut cumulative = 0u64;
        for (v, &c) in self.buckets.iter().enumerate() {
            if c == 0 {
                continue;
            }
            cumulative += c;
            if cumulative >= target {
                return v as u64;
            }
        }
        self.max
    }

    /// Percentage of samples within `k` standard deviations of `mean`.
    pub fn within_stdev(&self, mean: f64, stdev: f64, k: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let lower = (mean - k * stdev).max(0.0);
        let upper = mean + k * stdev;
        let within: u64 = self
            .buckets
            .iter()
            .enumerate()
            .filter(|&(v, &c)| c > 0 && (v as f64) >= lower && (v as f64) <= upper)
            .map(|(_, &c)| c)
            .sum();
        100.0 * within as f64 / self.total as f64
    }

    /// Coordinated-omission correction: for each recorded sample `s` more
    /// than one `interval` past zero, synthesizes additional samples at
    /// `s - interval`, `s - 2*interval`, … for as long as the result stays
    /// strictly positive, modeling the requests that would have completed
    /// during a stall of that length. A no-op when `interval` is at or
    /// beyond the largest recorded sample.
    pub fn correct(&mut self, interval: u64) {
        if interval == 0 {
            return;
        }
        let snapshot = self.buckets.clone();
        for (v, &count) in snapshot.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let v = v as u64;
            let mut k = 1u64;
            loop {
                let synth = match v.checked_sub(k.saturating_mul(interval)) {
                    Some(s) if s > 0 => s,
                    _ => break,
                };
                self.buckets[synth as usize] += count;
                self.total += count;
                k += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_rejects_out_of_range() {
        let mut s = Statistics::new(10);
        assert!(s.record(5));
        assert!(!s.record(10));
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn percentile_100_returns_max_and_0_returns_min() {
        let mut s = Statistics::new(100);
        for v in [1, 5, 5, 9] {
            s.record(v);
        }
        assert_eq!(s.percentile(100.0), 9);
        assert_eq!(s.percentile(0.0), 1);
    }

    #[test]
    fn mean_and_stdev_match_hand_computation() {
        let mut s = Statistics::new(100);
        for v in [2, 4, 4, 4, 5, 5, 7, 9] {
            s.record(v);
        }
        let mean = s.mean();
        assert!((mean - 5.0).abs() < 1e-9);
        let stdev = s.stdev(mean);
        assert!((stdev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn correct_with_interval_past_max_is_noop() {
        let mut s = Statistics::new(100);
        s.record(5);
        s.record(10);
        let before = s.count();
        s.correct(1000);
        assert_eq!(s.count(), before);
    }

    #[test]
    fn correct_synthesizes_samples_below_stalled_value() {
        let mut s = Statistics::new(1000);
        s.record(300);
        s.correct(100);
        // 300 -> synthesize 200, 100; stop at 0 (excluded).
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn merge_combines_two_shards() {
        let mut a = Statistics::new(10);
        let mut b = Statistics::new(10);
        a.record(1);
        b.record(1);
        b.record(2);
        a.merge(&b);
        assert_eq!(a.count(), 3);
    }
}
