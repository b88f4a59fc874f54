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

//! # storage
//!
//! Abstractions for the quorum local index.
//!
//! The index is transactional: a [Backend] vends [Transaction]s, and every read & write goes
//! through one. The commit processor applies each firehose event, together with the cursor
//! advance, inside a single transaction; the coordinator uses them to make its "check then
//! insert" sequences atomic. Uniqueness rules (slug, record URIs, one vote per voter per survey)
//! are enforced by the back-end and surface as [Error::UniqueViolation].

use async_trait::async_trait;
use snafu::{Backtrace, IntoError, Snafu};

use quorum_shared::{RecordUri, ResponseId, Slug, SurveyId};

use crate::{
    entities::{Response, Survey, Voter},
    error::ErrorKind,
};

/// The uniqueness rules the index enforces
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Constraint {
    Slug,
    SurveyUri,
    ResultsUri,
    ResponseUri,
    /// (survey, voter actor)
    ResponseActor,
    /// (survey, voter session hash)
    ResponseSession,
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Constraint::Slug => "slug",
            Constraint::SurveyUri => "survey URI",
            Constraint::ResultsUri => "results URI",
            Constraint::ResponseUri => "response URI",
            Constraint::ResponseActor => "one vote per actor",
            Constraint::ResponseSession => "one vote per guest session",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The {constraint} uniqueness constraint would be violated"))]
    UniqueViolation {
        constraint: Constraint,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        BackendSnafu.into_error(Box::new(err))
    }
    pub fn unique(constraint: Constraint) -> Error {
        UniqueViolationSnafu { constraint }.build()
    }
    /// The constraint violated, if that's what this is
    pub fn violated(&self) -> Option<Constraint> {
        match self {
            Error::UniqueViolation { constraint, .. } => Some(*constraint),
            _ => None,
        }
    }
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UniqueViolation { .. } => ErrorKind::Conflict,
            Error::Backend { .. } => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One unit of work against the index.
///
/// Dropping a transaction without calling [commit](Transaction::commit) discards its writes.
#[async_trait]
pub trait Transaction: Send {
    async fn survey_by_id(&mut self, id: &SurveyId) -> Result<Option<Survey>>;
    async fn survey_by_slug(&mut self, slug: &Slug) -> Result<Option<Survey>>;
    async fn survey_by_uri(&mut self, uri: &RecordUri) -> Result<Option<Survey>>;
    async fn survey_by_results_uri(&mut self, uri: &RecordUri) -> Result<Option<Survey>>;
    async fn slug_exists(&mut self, slug: &Slug) -> Result<bool>;
    async fn insert_survey(&mut self, survey: &Survey) -> Result<()>;
    /// Rewrite every column of the survey with the given id save its slug, which is immutable
    async fn update_survey(&mut self, survey: &Survey) -> Result<()>;
    /// Remove a survey & (by cascade) all its responses; false if there was no such survey
    async fn delete_survey(&mut self, id: &SurveyId) -> Result<bool>;

    async fn response_by_uri(&mut self, uri: &RecordUri) -> Result<Option<Response>>;
    async fn response_by_voter(
        &mut self,
        survey: &SurveyId,
        voter: &Voter,
    ) -> Result<Option<Response>>;
    async fn responses_for_survey(&mut self, survey: &SurveyId) -> Result<Vec<Response>>;
    async fn insert_response(&mut self, response: &Response) -> Result<()>;
    /// Rewrite the answers, URI & CID of the response with the given id
    async fn update_response(&mut self, response: &Response) -> Result<()>;
    async fn delete_response(&mut self, id: &ResponseId) -> Result<bool>;

    /// The firehose cursor; zero if nothing has ever been applied
    async fn cursor(&mut self) -> Result<i64>;
    /// Advance the firehose cursor to `time_us`; the cursor never moves backwards
    async fn set_cursor(&mut self, time_us: i64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Backend {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
    /// Convenience for reading the cursor outside any other work
    async fn cursor(&self) -> Result<i64> {
        let mut txn = self.begin().await?;
        let cursor = txn.cursor().await?;
        txn.rollback().await?;
        Ok(cursor)
    }
}

/// Maximum numeric suffix tried when disambiguating a slug
pub const MAX_SLUG_SUFFIX: u32 = 100;

/// Find an unused slug for `title`: the slug derived from the title if free, else the first free
/// one of `-2`, `-3`, ... `-100`. None means they're all taken.
pub async fn allocate_slug(txn: &mut dyn Transaction, title: &str) -> Result<Option<Slug>> {
    let base = Slug::from_title(title);
    if !txn.slug_exists(&base).await? {
        return Ok(Some(base));
    }
    for n in 2..=MAX_SLUG_SUFFIX {
        let candidate = base.with_suffix(n);
        if !txn.slug_exists(&candidate).await? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}
