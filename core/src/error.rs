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

//! Structured error types for configuration, startup, and reactor failures.

use std::io;

/// Errors building a [`crate::config::Config`] from raw inputs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `connections` was smaller than `threads`; every thread must own at
    /// least one connection.
    #[error("connections ({connections}) must be >= threads ({threads})")]
    TooFewConnections {
        /// Requested connection count.
        connections: u64,
        /// Requested thread count.
        threads: u64,
    },
    /// The target URL could not be parsed, or used a scheme other than
    /// `http`/`https`.
    #[error("invalid target url: {0}")]
    InvalidUrl(String),
    /// A `-H`/`--header` value was not a valid `name: value` pair.
    #[error("invalid header {0:?}: expected \"Name: value\"")]
    InvalidHeader(String),
    /// A numeric argument (connections, threads, SI-suffixed byte/rate
    /// count) failed to parse.
    #[error("invalid numeric value {value:?}: {reason}")]
    InvalidNumber {
        /// The offending raw argument text.
        value: String,
        /// Why it failed to parse.
        reason: String,
    },
    /// A time-suffixed duration argument failed to parse.
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration {
        /// The offending raw argument text.
        value: String,
        /// Why it failed to parse.
        reason: String,
    },
    /// `--sync` address failed to parse as `ip:port`.
    #[error("invalid sync address {0:?}")]
    InvalidSyncAddress(String),
}

/// Errors from the inter-process rendezvous (spec §4.6).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Binding or listening on the primary's rendezvous address failed.
    #[error("failed to bind sync listener on {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: std::net::SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A secondary failed to connect to the primary's rendezvous address.
    #[error("failed to connect to primary at {addr}: {source}")]
    Connect {
        /// The address that refused the connection.
        addr: std::net::SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The primary did not receive all expected secondary connections.
    #[error("expected {expected} secondary connections, accepted {accepted}")]
    IncompleteRendezvous {
        /// Number of secondaries configured with `-p`.
        expected: u16,
        /// Number actually accepted before the error.
        accepted: u16,
    },
    /// `--strict-sync` was set and the barrier observed a short read or a
    /// mismatched code.
    #[error("strict barrier violation: {0}")]
    BarrierViolation(String),
}

/// Errors starting the per-thread engines.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The reactor could not be constructed (OS resource exhaustion).
    #[error("failed to construct reactor for thread {thread}: {source}")]
    Reactor {
        /// Index of the thread that failed to start.
        thread: u64,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// `std::thread::Builder::spawn` itself failed.
    #[error("failed to spawn worker thread: {0}")]
    Os(#[source] io::Error),
}

/// Errors from TLS configuration construction.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// `rustls` rejected the constructed client configuration.
    #[error("tls configuration error: {0}")]
    Config(#[source] rustls::Error),
    /// The server name in the target URL was not a valid DNS name or IP
    /// address for SNI purposes.
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
}
