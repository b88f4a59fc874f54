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

//! # Commit processor
//!
//! Applies firehose commits to the local index. Each commit is handled in one transaction, and
//! the cursor is advanced inside that same transaction, so the index & the cursor never disagree
//! about what has been applied.
//!
//! There are nine handlers, one per (collection, operation) pair. Each is idempotent: creates
//! short-circuit when a row with the record's URI already exists (which is also how the firehose
//! echo of a locally-originated write is reconciled), updates are last-write-wins on CID, and
//! deletes of absent targets are no-ops. Every update & delete, and every results create, is
//! authorized against the actor stored as owning the target.
//!
//! A failure that re-delivery can never fix (malformed record, failed validation, unauthorized
//! actor, orphaned response, exhausted slug) drops the commit: its transaction is rolled back and
//! the cursor is advanced past it in a fresh one. Anything else (that is, a storage failure)
//! leaves the cursor where it was and is returned to the caller, so the commit will be replayed.

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info, warn};

use quorum_shared::{
    records::{RESPONSE_NSID, RESULTS_NSID, SURVEY_NSID},
    ActorId, Cid, Collection, RecordUri, ResponseId, Rkey, SurveyId,
};

use crate::{
    codec, counter_add,
    entities::{self, validate_answers, Response, Survey, Voter},
    error::ErrorKind,
    gauge_set,
    metrics::{self, Instruments, Sort},
    storage::{self, allocate_slug, Backend, Transaction},
};

use std::sync::Arc;

inventory::submit! { metrics::Registration::new("commits.applied", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("commits.dropped", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("commits.duplicates", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("orphan_responses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("unauthorized_commits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("firehose.cursor", Sort::IntegralGauge) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Codec { source: codec::Error },
    #[snafu(display("Bad {field} in commit: {source}"))]
    Identifier {
        field: &'static str,
        source: quorum_shared::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Invalid { source: entities::Error },
    #[snafu(display("The commit for {uri} carries no record"))]
    MissingRecord { uri: RecordUri, backtrace: Backtrace },
    #[snafu(display("{uri} refers to {subject}, which isn't in the index"))]
    Orphan {
        uri: RecordUri,
        subject: RecordUri,
        backtrace: Backtrace,
    },
    #[snafu(display("Every slug derived from {title:?} is taken"))]
    SlugExhausted { title: String, backtrace: Backtrace },
    #[snafu(display("Index failure: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("{uri} may not change its subject from {expected:?} to {found}"))]
    SubjectChanged {
        uri: RecordUri,
        expected: Option<RecordUri>,
        found: RecordUri,
        backtrace: Backtrace,
    },
    #[snafu(display("{repo} may not modify {uri} (owned by {owner:?})"))]
    Unauthorized {
        repo: ActorId,
        owner: Option<ActorId>,
        uri: RecordUri,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Codec { source } => source.kind(),
            Error::Identifier { .. } | Error::MissingRecord { .. } => ErrorKind::Malformed,
            Error::Invalid { .. } | Error::SubjectChanged { .. } => ErrorKind::Validation,
            Error::Orphan { .. } => ErrorKind::Orphan,
            Error::SlugExhausted { .. } => ErrorKind::Conflict,
            Error::Storage { source } => source.kind(),
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
        }
    }
    /// True if re-delivering the commit could never succeed; storage failures never are
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Error::Storage { .. }) && self.kind().is_permanent()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Commits                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Operation::Create => "create",
                Operation::Update => "update",
                Operation::Delete => "delete",
            }
        )
    }
}

/// One record mutation, as delivered by the firehose. Identifiers are as-received; they're
/// checked when the commit is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    pub repo: String,
    pub cid: Option<String>,
    pub record: Option<Value>,
    pub time_us: i64,
}

/// What became of a commit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The index was changed
    Applied,
    /// A create for a URI already in the index; at most the CID was updated
    Deduplicated,
    /// A second vote by the same actor on the same survey; skipped
    Duplicate,
    /// An update or delete whose target isn't in the index
    NoOp,
    /// Not a collection we care about
    Ignored,
    /// Re-delivery could never succeed; dropped
    Dropped(ErrorKind),
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Deduplicated => "deduplicated",
            Outcome::Duplicate => "duplicate",
            Outcome::NoOp => "no-op",
            Outcome::Ignored => "ignored",
            Outcome::Dropped(_) => "dropped",
        }
    }
}

/// Parsed identifiers of the commit under consideration
struct Target<'a> {
    repo: ActorId,
    uri: RecordUri,
    cid: Option<Cid>,
    record: Option<&'a Value>,
}

impl Target<'_> {
    fn record(&self) -> Result<&Value> {
        self.record.context(MissingRecordSnafu {
            uri: self.uri.clone(),
        })
    }
    fn authorize(&self, owner: Option<&ActorId>) -> Result<()> {
        ensure!(
            owner == Some(&self.repo),
            UnauthorizedSnafu {
                repo: self.repo.clone(),
                owner: owner.cloned(),
                uri: self.uri.clone(),
            }
        );
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Processor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Processor {
    storage: Arc<dyn Backend + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Processor {
    pub fn new(
        storage: Arc<dyn Backend + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Processor {
        Processor {
            storage,
            instruments,
        }
    }
    /// Apply `commit`. An `Err` return means nothing was applied & the cursor did not move.
    #[tracing::instrument(skip(self, commit), fields(did = %commit.repo, collection = %commit.collection, rkey = %commit.rkey, time_us = commit.time_us))]
    pub async fn process(&self, commit: &Commit) -> Result<Outcome> {
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        match self.apply(txn.as_mut(), commit).await {
            Ok(outcome) => {
                txn.set_cursor(commit.time_us)
                    .await
                    .context(StorageSnafu)?;
                txn.commit().await.context(StorageSnafu)?;
                debug!("{} {}: {}", commit.operation, commit.collection, outcome.as_str());
                self.record(&outcome, commit);
                Ok(outcome)
            }
            Err(err) if err.is_permanent() => {
                txn.rollback().await.context(StorageSnafu)?;
                warn!(
                    "Dropping {} {} from {} ({}): {}",
                    commit.operation,
                    commit.collection,
                    commit.repo,
                    err.kind(),
                    err
                );
                match &err {
                    Error::Orphan { .. } => {
                        counter_add!(self.instruments, "orphan_responses", 1, &[]);
                    }
                    Error::Unauthorized { .. } => {
                        counter_add!(self.instruments, "unauthorized_commits", 1, &[]);
                    }
                    _ => (),
                }
                self.skip(commit.time_us).await?;
                let outcome = Outcome::Dropped(err.kind());
                self.record(&outcome, commit);
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!("Rollback failed, too: {}", rollback);
                }
                Err(err)
            }
        }
    }
    /// The last applied event time, zero if none
    pub async fn cursor(&self) -> Result<i64> {
        self.storage.cursor().await.context(StorageSnafu)
    }
    /// Advance the cursor past an event that won't be applied
    pub async fn skip(&self, time_us: i64) -> Result<()> {
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        txn.set_cursor(time_us).await.context(StorageSnafu)?;
        txn.commit().await.context(StorageSnafu)?;
        gauge_set!(
            self.instruments,
            "firehose.cursor",
            u64::try_from(time_us).unwrap_or_default(),
            &[]
        );
        Ok(())
    }
    fn record(&self, outcome: &Outcome, commit: &Commit) {
        let labels = [
            KeyValue::new("collection", commit.collection.clone()),
            KeyValue::new("operation", commit.operation.to_string()),
        ];
        match outcome {
            Outcome::Dropped(kind) => {
                counter_add!(
                    self.instruments,
                    "commits.dropped",
                    1,
                    &[KeyValue::new("kind", kind.as_str())]
                );
            }
            Outcome::Deduplicated | Outcome::Duplicate => {
                counter_add!(self.instruments, "commits.duplicates", 1, &labels);
            }
            _ => {
                counter_add!(self.instruments, "commits.applied", 1, &labels);
            }
        }
        gauge_set!(
            self.instruments,
            "firehose.cursor",
            u64::try_from(commit.time_us).unwrap_or_default(),
            &[]
        );
    }
    async fn apply(&self, txn: &mut dyn Transaction, commit: &Commit) -> Result<Outcome> {
        let collection = match commit.collection.as_str() {
            SURVEY_NSID | RESPONSE_NSID | RESULTS_NSID => {
                Collection::new(&commit.collection).context(IdentifierSnafu {
                    field: "collection",
                })?
            }
            _ => return Ok(Outcome::Ignored),
        };
        let repo = ActorId::new(&commit.repo).context(IdentifierSnafu { field: "repo" })?;
        let target = Target {
            repo: repo.clone(),
            uri: RecordUri::new(
                repo,
                collection,
                Rkey::new(&commit.rkey).context(IdentifierSnafu { field: "rkey" })?,
            ),
            cid: commit
                .cid
                .as_deref()
                .map(Cid::new)
                .transpose()
                .context(IdentifierSnafu { field: "cid" })?,
            record: commit.record.as_ref(),
        };
        match (commit.collection.as_str(), commit.operation) {
            (SURVEY_NSID, Operation::Create) => survey_create(txn, &target).await,
            (SURVEY_NSID, Operation::Update) => survey_update(txn, &target).await,
            (SURVEY_NSID, Operation::Delete) => survey_delete(txn, &target).await,
            (RESPONSE_NSID, Operation::Create) => response_create(txn, &target).await,
            (RESPONSE_NSID, Operation::Update) => response_update(txn, &target).await,
            (RESPONSE_NSID, Operation::Delete) => response_delete(txn, &target).await,
            (RESULTS_NSID, Operation::Create) => results_create(txn, &target).await,
            (RESULTS_NSID, Operation::Update) => results_update(txn, &target).await,
            (RESULTS_NSID, Operation::Delete) => results_delete(txn, &target).await,
            _ => Ok(Outcome::Ignored),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn survey_create(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    if let Some(mut existing) = txn.survey_by_uri(&target.uri).await.context(StorageSnafu)? {
        if existing.cid != target.cid {
            existing.cid = target.cid.clone();
            existing.updated_at = Utc::now();
            txn.update_survey(&existing).await.context(StorageSnafu)?;
        }
        return Ok(Outcome::Deduplicated);
    }

    let decoded = codec::decode_survey(target.record()?).context(CodecSnafu)?;
    let slug = allocate_slug(txn, &decoded.title)
        .await
        .context(StorageSnafu)?
        .context(SlugExhaustedSnafu {
            title: decoded.title.clone(),
        })?;
    let survey = Survey {
        id: SurveyId::default(),
        uri: Some(target.uri.clone()),
        cid: target.cid.clone(),
        author: Some(target.repo.clone()),
        slug,
        title: decoded.title,
        definition: decoded.definition,
        created_at: decoded.created_at,
        updated_at: Utc::now(),
        results_uri: None,
        results_cid: None,
    };
    txn.insert_survey(&survey).await.context(StorageSnafu)?;
    info!("Indexed survey {} as {}", target.uri, survey.slug);
    Ok(Outcome::Applied)
}

async fn survey_update(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let Some(mut survey) = txn.survey_by_uri(&target.uri).await.context(StorageSnafu)? else {
        debug!("{} has no indexed survey {}; ignoring the update", target.repo, target.uri);
        return Ok(Outcome::NoOp);
    };
    target.authorize(survey.author.as_ref())?;
    let decoded = codec::decode_survey(target.record()?).context(CodecSnafu)?;
    survey.title = decoded.title;
    survey.definition = decoded.definition;
    survey.cid = target.cid.clone();
    survey.updated_at = Utc::now();
    txn.update_survey(&survey).await.context(StorageSnafu)?;
    Ok(Outcome::Applied)
}

async fn survey_delete(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let Some(survey) = txn.survey_by_uri(&target.uri).await.context(StorageSnafu)? else {
        debug!("{} has no indexed survey {}; ignoring the delete", target.repo, target.uri);
        return Ok(Outcome::NoOp);
    };
    target.authorize(survey.author.as_ref())?;
    txn.delete_survey(&survey.id).await.context(StorageSnafu)?;
    info!("Removed survey {} ({})", target.uri, survey.slug);
    Ok(Outcome::Applied)
}

async fn response_create(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    if let Some(mut existing) = txn.response_by_uri(&target.uri).await.context(StorageSnafu)? {
        if existing.cid != target.cid {
            existing.cid = target.cid.clone();
            txn.update_response(&existing).await.context(StorageSnafu)?;
        }
        return Ok(Outcome::Deduplicated);
    }

    let decoded = codec::decode_response(target.record()?).context(CodecSnafu)?;
    let survey = txn
        .survey_by_uri(&decoded.subject)
        .await
        .context(StorageSnafu)?
        .context(OrphanSnafu {
            uri: target.uri.clone(),
            subject: decoded.subject.clone(),
        })?;
    validate_answers(&survey.definition, &decoded.answers).context(InvalidSnafu)?;
    let voter = Voter::Actor(target.repo.clone());
    if txn
        .response_by_voter(&survey.id, &voter)
        .await
        .context(StorageSnafu)?
        .is_some()
    {
        debug!("{} has already voted on {}", target.repo, decoded.subject);
        return Ok(Outcome::Duplicate);
    }
    txn.insert_response(&Response {
        id: ResponseId::default(),
        survey_id: survey.id,
        voter,
        uri: Some(target.uri.clone()),
        cid: target.cid.clone(),
        answers: decoded.answers,
        created_at: decoded.created_at,
    })
    .await
    .context(StorageSnafu)?;
    Ok(Outcome::Applied)
}

async fn response_update(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let Some(mut response) = txn.response_by_uri(&target.uri).await.context(StorageSnafu)? else {
        return Ok(Outcome::NoOp);
    };
    target.authorize(response.voter.actor())?;
    let decoded = codec::decode_response(target.record()?).context(CodecSnafu)?;
    // The cascade guarantees the survey's presence
    let Some(survey) = txn
        .survey_by_id(&response.survey_id)
        .await
        .context(StorageSnafu)?
    else {
        return Ok(Outcome::NoOp);
    };
    ensure!(
        survey.uri.as_ref() == Some(&decoded.subject),
        SubjectChangedSnafu {
            uri: target.uri.clone(),
            expected: survey.uri.clone(),
            found: decoded.subject,
        }
    );
    validate_answers(&survey.definition, &decoded.answers).context(InvalidSnafu)?;
    response.answers = decoded.answers;
    response.cid = target.cid.clone();
    txn.update_response(&response).await.context(StorageSnafu)?;
    Ok(Outcome::Applied)
}

async fn response_delete(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let Some(response) = txn.response_by_uri(&target.uri).await.context(StorageSnafu)? else {
        return Ok(Outcome::NoOp);
    };
    target.authorize(response.voter.actor())?;
    txn.delete_response(&response.id)
        .await
        .context(StorageSnafu)?;
    Ok(Outcome::Applied)
}

async fn results_create(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let decoded = codec::decode_results(target.record()?).context(CodecSnafu)?;
    let mut survey = txn
        .survey_by_uri(&decoded.subject)
        .await
        .context(StorageSnafu)?
        .context(OrphanSnafu {
            uri: target.uri.clone(),
            subject: decoded.subject.clone(),
        })?;
    target.authorize(survey.author.as_ref())?;
    if survey.results_uri.as_ref() == Some(&target.uri) {
        if survey.results_cid != target.cid {
            survey.results_cid = target.cid.clone();
            txn.update_survey(&survey).await.context(StorageSnafu)?;
        }
        return Ok(Outcome::Deduplicated);
    }
    survey.results_uri = Some(target.uri.clone());
    survey.results_cid = target.cid.clone();
    survey.updated_at = Utc::now();
    txn.update_survey(&survey).await.context(StorageSnafu)?;
    info!("Results for {} published at {}", decoded.subject, target.uri);
    Ok(Outcome::Applied)
}

async fn results_update(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let Some(mut survey) = txn
        .survey_by_results_uri(&target.uri)
        .await
        .context(StorageSnafu)?
    else {
        return Ok(Outcome::NoOp);
    };
    target.authorize(survey.author.as_ref())?;
    let decoded = codec::decode_results(target.record()?).context(CodecSnafu)?;
    ensure!(
        survey.uri.as_ref() == Some(&decoded.subject),
        SubjectChangedSnafu {
            uri: target.uri.clone(),
            expected: survey.uri.clone(),
            found: decoded.subject,
        }
    );
    survey.results_cid = target.cid.clone();
    survey.updated_at = Utc::now();
    txn.update_survey(&survey).await.context(StorageSnafu)?;
    Ok(Outcome::Applied)
}

async fn results_delete(txn: &mut dyn Transaction, target: &Target<'_>) -> Result<Outcome> {
    let Some(mut survey) = txn
        .survey_by_results_uri(&target.uri)
        .await
        .context(StorageSnafu)?
    else {
        return Ok(Outcome::NoOp);
    };
    target.authorize(survey.author.as_ref())?;
    survey.results_uri = None;
    survey.results_cid = None;
    survey.updated_at = Utc::now();
    txn.update_survey(&survey).await.context(StorageSnafu)?;
    Ok(Outcome::Applied)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    use crate::{
        aggregate::tally,
        entities::{fixtures::color_survey, Answer, Answers},
    };

    pub fn survey_record(title: &str) -> Value {
        codec::encode_survey(&color_survey(), title).unwrap()
    }

    pub fn vote_record(survey: &str, survey_cid: &str, color: &str) -> Value {
        let mut answers = Answers::new();
        answers.insert("color".to_owned(), Answer::Selected(vec![color.to_owned()]));
        codec::encode_response(
            &RecordUri::parse(survey).unwrap(),
            Some(&Cid::new(survey_cid).unwrap()),
            &answers,
        )
        .unwrap()
    }

    pub fn results_record(survey: &str, survey_cid: &str) -> Value {
        codec::encode_results(
            &RecordUri::parse(survey).unwrap(),
            Some(&Cid::new(survey_cid).unwrap()),
            &tally(&color_survey(), std::iter::empty()),
        )
        .unwrap()
    }

    pub fn commit(
        operation: Operation,
        repo: &str,
        collection: &str,
        rkey: &str,
        cid: Option<&str>,
        record: Option<Value>,
        time_us: i64,
    ) -> Commit {
        Commit {
            operation,
            collection: collection.to_owned(),
            rkey: rkey.to_owned(),
            repo: repo.to_owned(),
            cid: cid.map(|s| s.to_owned()),
            record,
            time_us,
        }
    }
}
