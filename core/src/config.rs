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

//! Immutable run configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default per-request timeout, matching the original's `SOCKET_TIMEOUT_MS`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default test duration when `-d`/`--duration` is not given.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

/// Default worker thread count when `-t`/`--threads` is not given.
pub const DEFAULT_THREADS: u64 = 2;

/// This process's role in inter-process synchronization (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Runs alone; no barrier is performed.
    Standalone,
    /// Accepts `secondaries` TCP connections at startup and performs the
    /// fan-in/fan-out barrier once every thread has warmed up.
    Primary {
        /// Number of secondary processes expected to connect.
        secondaries: u16,
    },
    /// Connects to a primary's `--sync` address and participates in its
    /// barrier.
    Secondary,
}

/// Which socket strategy connections use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Unencrypted TCP.
    Plain,
    /// TLS over TCP.
    Tls,
}

/// A single extra request header supplied via `-H`/`--header`.
pub type Header = (String, String);

/// Immutable configuration for one run, built once at startup and shared
/// (by `Arc`, typically) with every worker thread.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total connections across all threads (`N`). Invariant: `>= threads`.
    pub connections: u64,
    /// Worker thread count (`T`).
    pub threads: u64,
    /// How long the NORMAL phase runs before `stop` is set.
    pub duration: Duration,
    /// Per-request timeout; samples beyond this are counted, not recorded.
    pub timeout: Duration,
    /// Pipeline depth; overridden by the script's `verify_request` hook
    /// when scripting is active, defaults to 1.
    pub pipeline: u64,
    /// Whether the script regenerates the request body per batch.
    pub dynamic: bool,
    /// Whether the script injects a per-request delay before sending.
    pub delay: bool,
    /// Whether the script's response hook is invoked per completed
    /// response (requires buffering headers/body).
    pub want_response: bool,
    /// Whether to print 50/75/90/99th latency percentiles in the report.
    pub latency_report: bool,
    /// Whether a WARMUP phase precedes NORMAL.
    pub warmup: bool,
    /// WARMUP timeout; `None` selects the default formula
    /// `max(1000ms, connections * 5ms)`.
    pub warmup_timeout: Option<Duration>,
    /// Local bind addresses, round-robined across threads by index.
    pub local_ips: Vec<String>,
    /// Inter-process rendezvous address, if configured.
    pub sync_addr: Option<SocketAddr>,
    /// This process's role in the rendezvous.
    pub role: Role,
    /// Whether an inter-process barrier violation (short read / mismatched
    /// code) aborts the run. Off by default (spec §9 Open Question).
    pub strict_sync: bool,
    /// Plain TCP or TLS.
    pub transport: Transport,
    /// Target host (for TLS SNI and the `Host` header).
    pub host: String,
    /// Extra request headers from `-H`/`--header`.
    pub headers: Vec<Header>,
}

impl Config {
    /// Validates cross-field invariants that cannot be expressed in the
    /// type alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections < self.threads {
            return Err(ConfigError::TooFewConnections {
                connections: self.connections,
                threads: self.threads,
            });
        }
        Ok(())
    }

    /// Connections owned by thread `index` (0-based), implementing the
    /// `⌊N/T⌋` split with the remainder distributed to the earliest
    /// threads.
    pub fn connections_for_thread(&self, index: u64) -> u64 {
        let base = self.connections / self.threads;
        let remainder = self.connections % self.threads;
        if index < remainder {
            base + 1
        } else {
            base
        }
    }

    /// The effective WARMUP timeout: the configured value, or the default
    /// `max(1000ms, connections * 5ms)` formula from `wrk.c:thread_main`.
    pub fn effective_warmup_timeout(&self) -> Duration {
        self.warmup_timeout.unwrap_or_else(|| {
            Duration::from_millis(1000.max(self.connections * 5))
        })
    }

    /// The local bind address for thread `index`, round-robin over
    /// `local_ips`, or `None` if none were configured.
    pub fn local_ip_for_thread(&self, index: u64) -> Option<&str> {
        if self.local_ips.is_empty() {
            return None;
        }
        let i = (index as usize) % self.local_ips.len();
        Some(self.local_ips[i].as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_config() -> Config {
        Config {
            connections: 10,
            threads: 3,
            duration: DEFAULT_DURATION,
            timeout: DEFAULT_TIMEOUT,
            pipeline: 1,
            dynamic: false,
            delay: false,
            want_response: false,
            latency_report: false,
            warmup: false,
            warmup_timeout: None,
            local_ips: vec![],
            sync_addr: None,
            role: Role::Standalone,
            strict_sync: false,
            transport: Transport::Plain,
            host: "example.com".into(),
            headers: vec![],
        }
    }

    #[test]
    fn rejects_fewer_connections_than_threads() {
        let mut cfg = base_config();
        cfg.connections = 2;
        cfg.threads = 4;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::TooFewConnections { .. })
        ));
    }

    #[test]
    fn connections_split_distributes_remainder_to_first_threads() {
        let cfg = base_config();
        assert_eq!(cfg.connections_for_thread(0), 4);
        assert_eq!(cfg.connections_for_thread(1), 3);
        assert_eq!(cfg.connections_for_thread(2), 3);
    }

    #[test]
    fn default_warmup_timeout_uses_floor_of_1000ms() {
        let mut cfg = base_config();
        cfg.connections = 10;
        assert_eq!(cfg.effective_warmup_timeout(), Duration::from_millis(1000));
        cfg.connections = 1000;
        assert_eq!(cfg.effective_warmup_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn local_ip_round_robins_by_thread_index() {
        let mut cfg = base_config();
        cfg.local_ips = vec!["127.0.0.1".into(), "127.0.0.2".into()];
        assert_eq!(cfg.local_ip_for_thread(0), Some("127.0.0.1"));
        assert_eq!(cfg.local_ip_for_thread(1), Some("127.0.0.2"));
        assert_eq!(cfg.local_ip_for_thread(2), Some("127.0.0.1"));
    }
}
