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

//! Per-actor & per-IP rate limits on the expensive edge operations.
//!
//! Each guarded operation has its own keyed GCRA limiter. Keys are the signed-in actor where
//! there is one, else the client IP. Limiters are process-local.

use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use opentelemetry::KeyValue;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info};

use quorum_shared::ActorId;

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
};

use std::{net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};

inventory::submit! { metrics::Registration::new("rate_limited", Sort::IntegralCounter) }

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{bucket} is limited; try again in {retry_after:?}"))]
    Limited {
        bucket: Bucket,
        retry_after: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("The {bucket} quota must have a non-zero period"))]
    Quota { bucket: Bucket, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The guarded operations
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bucket {
    SurveyCreate,
    Vote,
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Bucket::SurveyCreate => "survey-create",
                Bucket::Vote => "vote",
            }
        )
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Key {
    Actor(ActorId),
    Ip(IpAddr),
}

/// `requests` per `period`, all of which may be spent at once
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct QuotaConfig {
    pub requests: NonZeroU32,
    pub period: Duration,
}

impl QuotaConfig {
    fn quota(&self, bucket: Bucket) -> Result<Quota> {
        Ok(Quota::with_period(self.period / self.requests.get())
            .context(QuotaSnafu { bucket })?
            .allow_burst(self.requests))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub survey_create: QuotaConfig,
    pub vote: QuotaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            survey_create: QuotaConfig {
                requests: NonZeroU32::new(10).unwrap(/* known good */),
                period: Duration::from_secs(3600),
            },
            vote: QuotaConfig {
                requests: NonZeroU32::new(30).unwrap(/* known good */),
                period: Duration::from_secs(60),
            },
        }
    }
}

type Keyed = RateLimiter<Key, DefaultKeyedStateStore<Key>, DefaultClock>;

pub struct RateLimits {
    survey_create: Keyed,
    vote: Keyed,
    window: Duration,
    clock: DefaultClock,
    instruments: Arc<Instruments>,
}

impl RateLimits {
    pub fn new(config: &Config, instruments: Arc<Instruments>) -> Result<RateLimits> {
        Ok(RateLimits {
            survey_create: RateLimiter::keyed(config.survey_create.quota(Bucket::SurveyCreate)?),
            vote: RateLimiter::keyed(config.vote.quota(Bucket::Vote)?),
            window: config.survey_create.period.max(config.vote.period),
            clock: DefaultClock::default(),
            instruments,
        })
    }
    /// Spend one unit of `key`'s allowance for `bucket`
    pub fn check(&self, bucket: Bucket, key: &Key) -> Result<()> {
        let limiter = match bucket {
            Bucket::SurveyCreate => &self.survey_create,
            Bucket::Vote => &self.vote,
        };
        limiter.check_key(key).map_err(|not_until| {
            debug!("{:?} is rate-limited for {}", key, bucket);
            counter_add!(
                self.instruments,
                "rate_limited",
                1,
                &[KeyValue::new("bucket", bucket.to_string())]
            );
            LimitedSnafu {
                bucket,
                retry_after: not_until.wait_time_from(self.clock.now()),
            }
            .build()
        })
    }
    /// Forget keys whose buckets have refilled
    pub fn sweep(&self) {
        self.survey_create.retain_recent();
        self.vote.retain_recent();
        self.survey_create.shrink_to_fit();
        self.vote.shrink_to_fit();
    }
    /// The longest quota period; the natural sweep interval
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Run [RateLimits::sweep] every window until notified
pub fn spawn_sweeper(limits: Arc<RateLimits>, shutdown: Arc<Notify>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limits.window());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => limits.sweep(),
                _ = shutdown.notified() => {
                    info!("Rate-limit sweeper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn limits(requests: u32) -> RateLimits {
        let quota = QuotaConfig {
            requests: NonZeroU32::new(requests).unwrap(),
            period: Duration::from_secs(3600),
        };
        RateLimits::new(
            &Config {
                survey_create: quota,
                vote: quota,
            },
            Arc::new(Instruments::new("quorum-test")),
        )
        .unwrap()
    }

    #[test]
    fn buckets_are_per_key_and_per_operation() {
        let limits = limits(2);
        let alice = Key::Actor(ActorId::new("did:plc:alice").unwrap());
        let guest = Key::Ip("203.0.113.7".parse().unwrap());

        assert!(limits.check(Bucket::Vote, &alice).is_ok());
        assert!(limits.check(Bucket::Vote, &alice).is_ok());
        match limits.check(Bucket::Vote, &alice) {
            Err(Error::Limited { retry_after, .. }) => assert!(retry_after > Duration::ZERO),
            other => panic!("expected a limit, got {:?}", other),
        }
        assert!(limits.check(Bucket::Vote, &guest).is_ok());
        assert!(limits.check(Bucket::SurveyCreate, &alice).is_ok());

        limits.sweep();
        // Sweeping only forgets refilled buckets
        assert!(limits.check(Bucket::Vote, &alice).is_err());
    }

    #[test]
    fn zero_periods_are_rejected() {
        let quota = QuotaConfig {
            requests: NonZeroU32::new(1).unwrap(),
            period: Duration::ZERO,
        };
        assert!(RateLimits::new(
            &Config {
                survey_create: quota,
                vote: quota,
            },
            Arc::new(Instruments::new("quorum-test")),
        )
        .is_err());
    }
}
