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

//! # quorum as an HTTP client
//!
//! quorum talks to three kinds of remote: users' PDSes, their OAuth issuers, and the directory
//! services that resolve handles & DIDs. All three share the outbound client built here (with a
//! compliant `User-Agent`, and a per-request deadline) and the same retry discipline: transient
//! failures are retried under an [ExponentialBackoffParameters] policy, everything else is
//! surfaced at once.

use http::{header::USER_AGENT, HeaderMap, HeaderValue};
use snafu::{prelude::*, Backtrace};
use tower::retry::backoff::{Backoff, ExponentialBackoffMaker, MakeBackoff};
use tracing::debug;

use quorum_shared::backoff::ExponentialBackoffParameters;

use std::{future::Future, time::Duration};

/// Default per-request deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid backoff parameters: {source}"))]
    Backoff {
        source: tower::retry::backoff::InvalidBackoff,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build an HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{user_agent} is not a legal User-Agent: {source}"))]
    UserAgent {
        user_agent: String,
        source: http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Build the outbound [reqwest::Client]
pub fn make_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent).context(UserAgentSnafu { user_agent })?,
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .context(ClientSnafu)
}

/// A retry policy: how long to wait between attempts & how many to make
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    backoff: ExponentialBackoffMaker,
    num_attempts: usize,
}

impl RetryPolicy {
    pub fn new(params: &ExponentialBackoffParameters) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            backoff: ExponentialBackoffMaker::new(
                *params.lower(),
                *params.upper(),
                params.jitter(),
                tower::util::rng::HasherRng::new(),
            )
            .context(BackoffSnafu)?,
            num_attempts: params.num_attempts(),
        })
    }
    pub fn num_attempts(&self) -> usize {
        self.num_attempts
    }
    /// Run `op` until it succeeds, fails with an error for which `is_transient` is false, or
    /// we've made [num_attempts](RetryPolicy::num_attempts) attempts. `on_retry` is invoked
    /// before each wait.
    pub async fn run<T, E, F, Fut>(
        &self,
        is_transient: impl Fn(&E) -> bool,
        on_retry: impl Fn(&E),
        mut op: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut backoff = self.backoff.clone().make_backoff();
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if attempt < self.num_attempts && is_transient(&err) => {
                    on_retry(&err);
                    debug!("Attempt {} failed; backing-off", attempt);
                    backoff.next_backoff().await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_only_transient_failures() {
        let policy = RetryPolicy::new(&fixtures::fast_retries()).unwrap();

        let calls = AtomicUsize::new(0);
        let retries = AtomicUsize::new(0);
        let result: std::result::Result<(), &str> = policy
            .run(
                |e| *e == "transient",
                |_| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("transient") }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);

        let calls = AtomicUsize::new(0);
        let result: std::result::Result<(), &str> = policy
            .run(
                |e| *e == "transient",
                |_| (),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("permanent") }
                },
            )
            .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_carries_user_agent() {
        assert!(make_client("quorum/0.1.0; +https://quorum.example", DEFAULT_TIMEOUT).is_ok());
        assert!(make_client("bad\nagent", DEFAULT_TIMEOUT).is_err());
    }
}
