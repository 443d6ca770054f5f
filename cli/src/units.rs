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

//! SI-suffixed metric and time-suffixed duration scanning for CLI numeric
//! arguments, mirroring the original's `scan_metric`/`scan_time`.

use std::time::Duration;

use gale_core::ConfigError;

/// Parses a count with an optional trailing `k`/`M`/`G` SI suffix
/// (case-insensitive, base 1000), as used for `-c/--connections` and
/// `-t/--threads`.
pub fn parse_metric(value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidNumber {
        value: value.to_string(),
        reason: "expected an integer with an optional k/M/G suffix".to_string(),
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&trimmed[..trimmed.len() - 1], 1_000u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&trimmed[..trimmed.len() - 1], 1_000_000u64),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&trimmed[..trimmed.len() - 1], 1_000_000_000u64),
        _ => (trimmed, 1u64),
    };

    let base: f64 = digits.parse().map_err(|_| invalid())?;
    if base < 0.0 {
        return Err(invalid());
    }
    Ok((base * multiplier as f64) as u64)
}

/// Parses a duration with an optional trailing `s`/`m`/`h` suffix; a bare
/// number is interpreted as whole seconds, matching the original's
/// `scan_time`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: "expected a number with an optional s/m/h suffix".to_string(),
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let (digits, seconds_per_unit) = match trimmed.chars().last() {
        Some('s') | Some('S') => (&trimmed[..trimmed.len() - 1], 1.0f64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60.0f64),
        Some('M') => (&trimmed[..trimmed.len() - 1], 60.0f64),
        Some('h') | Some('H') => (&trimmed[..trimmed.len() - 1], 3_600.0f64),
        _ => (trimmed, 1.0f64),
    };

    let quantity: f64 = digits.parse().map_err(|_| invalid())?;
    if quantity < 0.0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(quantity * seconds_per_unit))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_metric_accepts_bare_integers() {
        assert_eq!(parse_metric("64").unwrap(), 64);
    }

    #[test]
    fn parse_metric_applies_si_suffixes() {
        assert_eq!(parse_metric("2k").unwrap(), 2_000);
        assert_eq!(parse_metric("1M").unwrap(), 1_000_000);
        assert_eq!(parse_metric("1g").unwrap(), 1_000_000_000);
    }

    #[test]
    fn parse_metric_rejects_garbage() {
        assert!(parse_metric("abc").is_err());
        assert!(parse_metric("").is_err());
    }

    #[test]
    fn parse_duration_bare_number_is_seconds() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn parse_duration_applies_time_suffixes() {
        assert_eq!(parse_duration("500s").unwrap(), Duration::from_secs(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("abc").is_err());
    }
}
