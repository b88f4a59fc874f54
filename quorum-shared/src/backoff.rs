// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of quorum.
//
// quorum is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// quorum is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with quorum.  If not,
// see <http://www.gnu.org/licenses/>.

//! Exponential backoff parameters.
//!
//! Three different parts of quorum back off: the record writer retrying transport failures, the
//! actor resolver retrying directory lookups, and the firehose consumer reconnecting to its relay.
//! They all describe their policy with [ExponentialBackoffParameters], which in configuration
//! looks like:
//!
//! ```toml
//! [pds-client.exponential-backoff]
//! lower = { secs = 1, nanos = 0 }
//! upper = { secs = 60, nanos = 0 }
//! jitter = 10.0
//! num-attempts = 3
//! ```

use serde::Deserialize;
use snafu::{ensure, Backtrace, Snafu};

use std::time::Duration;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A backoff may not wait {lower:?} at first and {upper:?} at most"))]
    Bounds {
        lower: Duration,
        upper: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("Jitter must be a percentage in [0, 100); got {percent}"))]
    Jitter { percent: f64, backtrace: Backtrace },
    #[snafu(display("An exponential backoff policy needs at least one attempt"))]
    NumAttempts { backtrace: Backtrace },
}

/// How long to wait between attempts, how much to perturb each wait, and how many attempts to
/// make in all: the n-th wait (counting from zero) is `min(upper, lower * 2^n)`, give or take
/// `jitter` percent.
///
/// Every instance has `0 < lower <= upper`, a finite jitter in `[0, 100)` & at least one attempt.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "Unchecked")]
pub struct ExponentialBackoffParameters {
    lower: Duration,
    upper: Duration,
    jitter: f64,
    num_attempts: usize,
}

// What comes off the wire, before we've looked at it
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Unchecked {
    lower: Duration,
    upper: Duration,
    #[serde(default)]
    jitter: f64,
    num_attempts: usize,
}

impl TryFrom<Unchecked> for ExponentialBackoffParameters {
    type Error = Error;

    fn try_from(raw: Unchecked) -> Result<Self, Self::Error> {
        ExponentialBackoffParameters::new(raw.lower, raw.upper, raw.jitter, raw.num_attempts)
    }
}

impl ExponentialBackoffParameters {
    pub fn new(
        lower: Duration,
        upper: Duration,
        jitter: f64,
        num_attempts: usize,
    ) -> Result<ExponentialBackoffParameters, Error> {
        ensure!(
            !lower.is_zero() && lower <= upper,
            BoundsSnafu { lower, upper }
        );
        ensure!(
            jitter.is_finite() && (0.0..100.0).contains(&jitter),
            JitterSnafu { percent: jitter }
        );
        ensure!(num_attempts > 0, NumAttemptsSnafu);
        Ok(ExponentialBackoffParameters {
            lower,
            upper,
            jitter,
            num_attempts,
        })
    }
    /// Percent
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
    pub fn lower(&self) -> &Duration {
        &self.lower
    }
    pub fn num_attempts(&self) -> usize {
        self.num_attempts
    }
    pub fn upper(&self) -> &Duration {
        &self.upper
    }
    /// The un-jittered wait before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.lower.checked_mul(factor))
            .map_or(self.upper, |d| d.min(self.upper))
    }
}

impl Default for ExponentialBackoffParameters {
    fn default() -> Self {
        ExponentialBackoffParameters {
            lower: Duration::from_secs(1),
            upper: Duration::from_secs(60),
            jitter: 10.0,
            num_attempts: 3,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let params = ExponentialBackoffParameters::default();
        assert_eq!(params.delay(0), Duration::from_secs(1));
        assert_eq!(params.delay(1), Duration::from_secs(2));
        assert_eq!(params.delay(5), Duration::from_secs(32));
        assert_eq!(params.delay(6), Duration::from_secs(60));
        assert_eq!(params.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn rejects_nonsense() {
        let one = Duration::from_secs(1);
        let two = Duration::from_secs(2);
        assert!(ExponentialBackoffParameters::new(two, one, 0.0, 1).is_err());
        assert!(ExponentialBackoffParameters::new(Duration::ZERO, one, 0.0, 1).is_err());
        assert!(ExponentialBackoffParameters::new(one, two, f64::NAN, 1).is_err());
        assert!(ExponentialBackoffParameters::new(one, two, 100.0, 1).is_err());
        assert!(ExponentialBackoffParameters::new(one, two, 0.0, 0).is_err());
        assert!(ExponentialBackoffParameters::new(one, one, 0.0, 1).is_ok());
    }

    #[test]
    fn from_config() {
        let params: ExponentialBackoffParameters = serde_json::from_value(serde_json::json!({
            "lower": {"secs": 0, "nanos": 250000000},
            "upper": {"secs": 4, "nanos": 0},
            "num-attempts": 5
        }))
        .unwrap();
        assert_eq!(params.delay(1), Duration::from_millis(500));
        assert_eq!(params.jitter(), 0.0);
        assert!(serde_json::from_value::<ExponentialBackoffParameters>(serde_json::json!({
            "lower": {"secs": 4, "nanos": 0},
            "upper": {"secs": 1, "nanos": 0},
            "num-attempts": 5
        }))
        .is_err());
    }
}
