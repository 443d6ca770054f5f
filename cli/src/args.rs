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

//! Command-line surface, mirroring the original's flag table exactly (spec
//! §6).

use clap::Parser;

use gale_core::ConfigError;

use crate::units::{parse_duration, parse_metric};

/// A multi-threaded HTTP/1.1 load generator.
#[derive(Debug, Parser)]
#[command(name = "gale", disable_version_flag = true)]
pub struct Args {
    /// Target URL (http or https).
    pub url: String,

    /// Total connections to keep open; must be >= threads.
    #[arg(short = 'c', long, value_parser = parse_metric, default_value = "10")]
    pub connections: u64,

    /// Number of worker threads.
    #[arg(short = 't', long, value_parser = parse_metric, default_value = "2")]
    pub threads: u64,

    /// Test duration, e.g. `30s`, `5m`; a bare number is seconds.
    #[arg(short = 'd', long, value_parser = parse_duration, default_value = "10s")]
    pub duration: std::time::Duration,

    /// Comma-separated local bind addresses, round-robined across threads.
    #[arg(short = 'i', long = "local_ip")]
    pub local_ip: Option<String>,

    /// Path to a script providing request/response/summary hooks.
    #[arg(short = 's', long)]
    pub script: Option<std::path::PathBuf>,

    /// Extra request header `Name: value`; repeatable.
    #[arg(short = 'H', long = "header")]
    pub header: Vec<String>,

    /// Print latency percentiles in the final report.
    #[arg(long)]
    pub latency: bool,

    /// Per-request timeout, e.g. `2s`; a bare number is seconds.
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub timeout: std::time::Duration,

    /// Run a WARMUP phase before measuring NORMAL-phase statistics.
    #[arg(short = 'W', long)]
    pub warmup: bool,

    /// Override the default WARMUP timeout (`max(1s, connections * 5ms)`).
    #[arg(long, value_parser = parse_duration)]
    pub warmup_timeout: Option<std::time::Duration>,

    /// Run as the primary of a multi-process run, waiting for this many
    /// secondaries before the post-warmup barrier.
    #[arg(short = 'p', long)]
    pub primary: Option<u16>,

    /// Inter-process rendezvous address (`ip:port`); a secondary connects
    /// to it, a primary binds it.
    #[arg(short = 'S', long)]
    pub sync: Option<String>,

    /// Abort the run if the inter-process barrier observes a short read or
    /// mismatched code, instead of logging and proceeding.
    #[arg(long)]
    pub strict_sync: bool,

    /// Print version information and exit.
    #[arg(short = 'v', long)]
    pub version: bool,
}

impl Args {
    /// Splits `--header` values into `(name, value)` pairs.
    pub fn parsed_headers(&self) -> Result<Vec<(String, String)>, ConfigError> {
        self.header
            .iter()
            .map(|raw| {
                raw.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .ok_or_else(|| ConfigError::InvalidHeader(raw.clone()))
            })
            .collect()
    }

    /// Splits `--local_ip` into individual addresses.
    pub fn local_ips(&self) -> Vec<String> {
        match &self.local_ip {
            Some(raw) => raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_headers_into_name_value_pairs() {
        let args = Args {
            header: vec!["X-Test: 1".to_string(), "Accept:*/*".to_string()],
            ..default_args()
        };
        let headers = args.parsed_headers().unwrap();
        assert_eq!(headers, vec![
            ("X-Test".to_string(), "1".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ]);
    }

    #[test]
    fn rejects_header_missing_colon() {
        let args = Args {
            header: vec!["garbage".to_string()],
            ..default_args()
        };
        assert!(args.parsed_headers().is_err());
    }

    #[test]
    fn splits_comma_separated_local_ips() {
        let args = Args {
            local_ip: Some("127.0.0.1, 127.0.0.2".to_string()),
            ..default_args()
        };
        assert_eq!(args.local_ips(), vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()]);
    }

    fn default_args() -> Args {
        Args {
            url: "http://example.com".to_string(),
            connections: 10,
            threads: 2,
            duration: std::time::Duration::from_secs(10),
            local_ip: None,
            script: None,
            header: Vec::new(),
            latency: false,
            timeout: std::time::Duration::from_secs(2),
            warmup: false,
            warmup_timeout: None,
            primary: None,
            sync: None,
            strict_sync: false,
            version: false,
        }
    }
}
