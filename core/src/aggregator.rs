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

//! Joins per-thread results into one report: merged counters, the
//! coordinated-omission-corrected latency histogram, and the fairness
//! histogram over per-connection completion counts (spec §4.8).

use std::time::{Duration, Instant};

use crate::script::ErrorCounts;
use crate::stats::Statistics;

/// Number of buckets in the fairness histogram, matching the original's
/// `HIST_SZ`.
const FAIRNESS_BUCKETS: usize = 6;

/// Fractional width of each fairness bucket, as a fraction of
/// `max_completed`, matching the original's `hist_step`.
const FAIRNESS_STEPS: [f64; FAIRNESS_BUCKETS] = [0.05, 0.15, 0.30, 0.30, 0.15, 0.05];

/// Everything one thread engine reports back to the main thread once its
/// reactor stops (spec §3 "Thread state", harvested post-join).
#[derive(Debug)]
pub struct ThreadReport {
    /// Total responses completed on this thread.
    pub complete: u64,
    /// Total batches started on this thread.
    pub requests: u64,
    /// Total response bytes read on this thread.
    pub bytes: u64,
    /// Aggregate socket-error counters for this thread.
    pub errors: ErrorCounts,
    /// Reconnects performed by this thread's connections.
    pub reconnects: u64,
    /// Successful handshake completions on this thread, including ones
    /// later reconnected (spec SPEC_FULL §6 item 6).
    pub established: u64,
    /// When this thread entered NORMAL phase, if warmup was enabled and it
    /// got there (`None` otherwise).
    pub phase_normal_start: Option<Instant>,
    /// This thread's start-of-run instant (warmup or NORMAL, whichever
    /// came first).
    pub start: Instant,
    /// Per-connection `(r_started, r_completed, r_read)` counters,
    /// backing the fairness histogram.
    pub connections: Vec<(u64, u64, u64)>,
    /// This thread's latency histogram shard.
    pub latency: Statistics,
    /// This thread's request-rate histogram shard.
    pub request_rate: Statistics,
}

/// One bucket of the fairness histogram.
#[derive(Debug, Clone, Copy)]
pub struct FairnessBucket {
    /// This bucket's fractional width (e.g. `0.05` for 5%).
    pub step: f64,
    /// Inclusive lower bound of `r_completed` for this bucket.
    pub range_start: u64,
    /// Exclusive upper bound of `r_completed` for this bucket (the next
    /// bucket's `range_start`, or `max_completed` for the last bucket).
    pub range_end: u64,
    /// Connections whose `r_completed` fell in `[range_start, range_end)`.
    pub count: u64,
}

/// The final, user-facing result of a run (spec §4.8).
#[derive(Debug)]
pub struct Report {
    /// Wall-clock runtime the statistics are normalized over: from the
    /// earliest `phase_normal_start` across threads if warmup was used,
    /// else from the earliest thread start.
    pub runtime: Duration,
    /// Total completed responses across all threads.
    pub complete: u64,
    /// Total bytes read across all threads.
    pub bytes: u64,
    /// Merged latency histogram, coordinated-omission corrected.
    pub latency: Statistics,
    /// Merged per-thread request-rate histogram.
    pub request_rate: Statistics,
    /// Merged socket-error counters.
    pub errors: ErrorCounts,
    /// Total established connections (spec SPEC_FULL §6 item 6: every
    /// successful handshake, including ones later reconnected).
    pub established: u64,
    /// Total reconnects across all connections.
    pub reconnects: u64,
    /// Fairness histogram buckets, in ascending order.
    pub fairness: Vec<FairnessBucket>,
    /// Connections with zero completions and zero bytes read.
    pub inactive: u64,
}

impl Report {
    /// Merges every thread's report into one aggregate, applying
    /// coordinated-omission correction to the latency histogram using the
    /// interval `runtime_us / (complete / connections)` (spec §4.8, §9;
    /// computed once over the whole aggregate, matching `wrk.c:main`).
    ///
    /// `established` is summed from each thread's own count (spec SPEC_FULL
    /// §6 item 6), rather than taken as a caller-supplied total, since only
    /// the per-thread connection state machines observe handshake
    /// completions.
    pub fn join(threads: Vec<ThreadReport>, connections: u64, timeout_ms: u64) -> Self {
        let now = Instant::now();

        let earliest_start = threads.iter().map(|t| t.start).min().unwrap_or(now);
        let earliest_normal_start = threads.iter().filter_map(|t| t.phase_normal_start).min();
        let runtime_start = earliest_normal_start.unwrap_or(earliest_start);
        let runtime = now.saturating_duration_since(runtime_start);

        let mut complete = 0u64;
        let mut bytes = 0u64;
        let mut errors = ErrorCounts::default();
        let mut reconnects = 0u64;
        let mut established = 0u64;
        let mut latency = Statistics::latency(timeout_ms);
        let mut request_rate = Statistics::request_rate();
        let mut all_connections: Vec<(u64, u64, u64)> = Vec::new();

        for t in &threads {
            complete += t.complete;
            bytes += t.bytes;
            errors.connect += t.errors.connect;
            errors.read += t.errors.read;
            errors.write += t.errors.write;
            errors.timeout += t.errors.timeout;
            errors.status += t.errors.status;
            reconnects += t.reconnects;
            established += t.established;
            latency.merge(&t.latency);
            request_rate.merge(&t.request_rate);
            all_connections.extend_from_slice(&t.connections);
        }

        if connections > 0 && complete / connections > 0 {
            let interval = runtime.as_micros() as u64 / (complete / connections);
            latency.correct(interval);
        }

        let max_completed = all_connections.iter().map(|&(_, completed, _)| completed).max().unwrap_or(0);

        let mut range = [0u64; FAIRNESS_BUCKETS + 1];
        let mut step_acc = 0.0f64;
        for (idx, step) in FAIRNESS_STEPS.iter().enumerate() {
            range[idx] = (max_completed as f64 * step_acc) as u64;
            step_acc += step;
        }
        range[FAIRNESS_BUCKETS] = max_completed;

        let mut fairness = vec![0u64; FAIRNESS_BUCKETS];
        let mut inactive = 0u64;
        for &(_, r_completed, r_read) in &all_connections {
            if r_completed == 0 && r_read == 0 {
                inactive += 1;
                continue;
            }
            let mut idx = 0usize;
            while idx < FAIRNESS_BUCKETS && r_completed >= range[idx] {
                idx += 1;
            }
            let idx = idx.saturating_sub(1);
            fairness[idx] += 1;
        }

        let buckets = (0..FAIRNESS_BUCKETS)
            .map(|idx| FairnessBucket {
                step: FAIRNESS_STEPS[idx],
                range_start: range[idx],
                range_end: range[idx + 1],
                count: fairness[idx],
            })
            .collect();

        Report {
            runtime,
            complete,
            bytes,
            latency,
            request_rate,
            errors,
            established,
            reconnects,
            fairness: buckets,
            inactive,
        }
    }

    /// `50th/75th/90th/99th` latency percentiles, in microseconds, for
    /// `--latency` reports.
    pub fn latency_percentiles(&self) -> [(f64, u64); 4] {
        [50.0, 75.0, 90.0, 99.0].map(|p| (p, self.latency.percentile(p)))
    }

    /// Renders the plain-text report written to stdout, matching the
    /// original's `print_stats`/`print_stats_latency` layout (spec §6).
    pub fn render(&self, show_latency: bool) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();

        let _ = writeln!(out, "  Thread Stats{:>6}{:>11}{:>8}{:>12}", "Avg", "Stdev", "Max", "+/- Stdev");
        render_stat_row(&mut out, "Latency", &self.latency, format_time_us);
        render_stat_row(&mut out, "Req/Sec", &self.request_rate, format_metric);

        if show_latency {
            let _ = writeln!(out, "  Latency Distribution");
            for (p, v) in self.latency_percentiles() {
                let _ = writeln!(out, "{p:>7.0}%{:>10}", format_time_us(v as f64));
            }
        }

        let req_per_s = self.complete as f64 / self.runtime.as_secs_f64().max(1e-9);
        let bytes_per_s = self.bytes as f64 / self.runtime.as_secs_f64().max(1e-9);

        let _ = writeln!(out);
        let _ = writeln!(out, "Fairness histogram (connections per completed requests ranges):");
        let _ = writeln!(out, "Inactive: {}", self.inactive);
        for (idx, bucket) in self.fairness.iter().enumerate() {
            let _ = writeln!(
                out,
                "Range#{idx} {:>3.0}% ({} - {}): {}",
                bucket.step * 100.0,
                bucket.range_start,
                bucket.range_end,
                bucket.count
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{} requests in {}, {} read", self.complete, format_time_us(self.runtime.as_micros() as f64), format_bytes(self.bytes as f64));
        if self.errors.connect > 0 || self.errors.read > 0 || self.errors.write > 0 || self.errors.timeout > 0 || self.reconnects > 0 {
            let _ = writeln!(
                out,
                "Socket errors: connect {}, read {}, write {}, timeout {}, reconnect {}",
                self.errors.connect, self.errors.read, self.errors.write, self.errors.timeout, self.reconnects
            );
        }
        if self.errors.status > 0 {
            let _ = writeln!(out, "  Non-2xx or 3xx responses: {}", self.errors.status);
        }
        let _ = writeln!(out, "Established connections: {}", self.established);
        let _ = writeln!(out, "Requests/sec: {req_per_s:.2}");
        let _ = writeln!(out, "Transfer/sec: {}", format_bytes(bytes_per_s));

        out
    }
}

fn render_stat_row(out: &mut String, name: &str, stats: &Statistics, fmt: impl Fn(f64) -> String) {
    use std::fmt::Write as _;
    let mean = stats.mean();
    let stdev = stats.stdev(mean);
    let within = stats.within_stdev(mean, stdev, 1.0);
    let _ = writeln!(
        out,
        "    {name:<10}{:>8}{:>10}{:>9}{within:>8.2}%",
        fmt(mean),
        fmt(stdev),
        fmt(stats.max() as f64),
    );
}

fn format_time_us(v: f64) -> String {
    if v >= 1_000_000.0 {
        format!("{:.2}s", v / 1_000_000.0)
    } else if v >= 1_000.0 {
        format!("{:.2}ms", v / 1_000.0)
    } else {
        format!("{v:.2}us")
    }
}

fn format_metric(v: f64) -> String {
    if v >= 1_000_000.0 {
        format!("{:.2}M", v / 1_000_000.0)
    } else if v >= 1_000.0 {
        format!("{:.2}k", v / 1_000.0)
    } else {
        format!("{v:.2}")
    }
}

fn format_bytes(v: f64) -> String {
    if v >= 1_073_741_824.0 {
        format!("{:.2}GB", v / 1_073_741_824.0)
    } else if v >= 1_048_576.0 {
        format!("{:.2}MB", v / 1_048_576.0)
    } else if v >= 1024.0 {
        format!("{:.2}KB", v / 1024.0)
    } else {
        format!("{v:.2}B")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_thread(completions: &[(u64, u64, u64)]) -> ThreadReport {
        let mut latency = Statistics::latency(2000);
        latency.record(100);
        ThreadReport {
            complete: completions.iter().map(|&(_, c, _)| c).sum(),
            requests: completions.len() as u64,
            bytes: 1024,
            errors: ErrorCounts::default(),
            reconnects: 0,
            established: completions.len() as u64,
            phase_normal_start: None,
            start: Instant::now(),
            connections: completions.to_vec(),
            latency,
            request_rate: Statistics::request_rate(),
        }
    }

    #[test]
    fn fairness_sums_to_total_connections() {
        let t = sample_thread(&[(5, 5, 50), (0, 0, 0), (3, 3, 30), (10, 10, 100)]);
        let report = Report::join(vec![t], 4, 2000);
        let bucket_sum: u64 = report.fairness.iter().map(|b| b.count).sum();
        assert_eq!(bucket_sum + report.inactive, 4);
        assert_eq!(report.inactive, 1);
    }

    #[test]
    fn join_merges_bytes_and_complete_across_threads() {
        let t1 = sample_thread(&[(2, 2, 20)]);
        let t2 = sample_thread(&[(3, 3, 30)]);
        let report = Report::join(vec![t1, t2], 2, 2000);
        assert_eq!(report.complete, 5);
        assert_eq!(report.bytes, 2048);
    }
}
