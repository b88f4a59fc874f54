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

//! # Write-through coordinator
//!
//! Locally-originated mutations: survey creation & deletion, votes, and results publication.
//!
//! Every create goes to the author's PDS first, and only then to the local index. If the index
//! write fails after the PDS write succeeded, the firehose echo of the new record will still
//! bring the index into line; the reverse order could leave the index holding a row that no
//! repository will ever confirm. The echo itself lands on the commit processor's dedup path.
//!
//! When the PDS write of a survey or vote fails for any reason other than an expired token (for
//! which we refresh & retry, once), the write degrades to local-only: the row is persisted with no
//! record URI, CID or author. Results are different; they exist only as a record, so failure to
//! publish them is surfaced.
//!
//! No index transaction is ever held across a PDS call.

use chrono::Utc;
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info, warn};

use quorum_shared::{
    next_tid, ActorId, Cid, Collection, RecordUri, ResponseId, Rkey, SessionId, Slug, SurveyId,
};

use crate::{
    aggregate::{tally, Tally},
    codec, counter_add,
    entities::{
        self, validate_answers, Answers, Response, Survey, SurveyDefinition, Voter,
        VoterSessionHash,
    },
    error::ErrorKind,
    identity::{self, KeyStore, OAuthSession},
    metrics::{self, Instruments, Sort},
    oauth::{self, Refresher},
    pds::{self, RecordRef, Writer},
    resolver::Resolver,
    storage::{self, allocate_slug, Backend, Constraint},
};

use opentelemetry::KeyValue;

use std::{net::IpAddr, sync::Arc};

inventory::submit! { metrics::Registration::new("writes.local_only", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("votes.rejected", Sort::IntegralCounter) }

/// How many times we'll go back for a fresh slug after losing a race for one
const SLUG_RACES: usize = 3;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("This voter has already voted on {slug}"))]
    AlreadyVoted { slug: Slug, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Codec { source: codec::Error },
    #[snafu(display("{source}"))]
    Invalid { source: entities::Error },
    #[snafu(display("Survey {slug} was never published, so its results can't be"))]
    LocalOnly { slug: Slug, backtrace: Backtrace },
    #[snafu(display("No survey {slug}"))]
    NoSuchSurvey { slug: Slug, backtrace: Backtrace },
    #[snafu(display("{actor} is not the author of {slug}"))]
    NotAuthor {
        actor: ActorId,
        slug: Slug,
        backtrace: Backtrace,
    },
    #[snafu(display("PDS write failed: {source}"))]
    Pds {
        #[snafu(source(from(pds::Error, Box::new)))]
        source: Box<pds::Error>,
    },
    #[snafu(display("Token refresh failed: {source}"))]
    Refresh {
        #[snafu(source(from(oauth::Error, Box::new)))]
        source: Box<oauth::Error>,
    },
    #[snafu(display("Session store failure: {source}"))]
    Session { source: identity::Error },
    #[snafu(display("That requires a signed-in session"))]
    SessionRequired { backtrace: Backtrace },
    #[snafu(display("Every slug derived from {title:?} is taken"))]
    SlugExhausted { title: String, backtrace: Backtrace },
    #[snafu(display("Index failure: {source}"))]
    Storage { source: storage::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyVoted { .. } | Error::SlugExhausted { .. } => ErrorKind::Conflict,
            Error::Codec { source } => source.kind(),
            Error::Invalid { .. } | Error::LocalOnly { .. } | Error::NoSuchSurvey { .. } => {
                ErrorKind::Validation
            }
            Error::NotAuthor { .. } | Error::SessionRequired { .. } => ErrorKind::Unauthorized,
            Error::Pds { source } => source.kind(),
            Error::Refresh { source } => source.kind(),
            Error::Session { source } => source.kind(),
            Error::Storage { source } => source.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Coordinator                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What identifies a guest voter's browser
#[derive(Clone, Debug, PartialEq)]
pub struct Fingerprint {
    pub ip: IpAddr,
    pub user_agent: String,
}

/// A PDS mutation, described so that it can be re-issued after a token refresh
enum Write<'a> {
    Create {
        collection: Collection,
        rkey: Rkey,
        record: &'a Value,
    },
    Put {
        uri: &'a RecordUri,
        record: &'a Value,
        current: Option<&'a Cid>,
    },
    Delete {
        uri: &'a RecordUri,
    },
}

pub struct Coordinator {
    storage: Arc<dyn Backend + Send + Sync>,
    keys: Arc<KeyStore>,
    writer: Writer,
    refresher: Refresher,
    resolver: Arc<Resolver>,
    instruments: Arc<Instruments>,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn Backend + Send + Sync>,
        keys: Arc<KeyStore>,
        writer: Writer,
        refresher: Refresher,
        resolver: Arc<Resolver>,
        instruments: Arc<Instruments>,
    ) -> Coordinator {
        Coordinator {
            storage,
            keys,
            writer,
            refresher,
            resolver,
            instruments,
        }
    }

    /// Create a survey on behalf of `session` (or anonymously, in which case it's local-only)
    pub async fn create_survey(
        &self,
        session: Option<&SessionId>,
        title: &str,
        definition: &SurveyDefinition,
    ) -> Result<Survey> {
        let (title, definition) = codec::sanitize_survey(title, definition).context(CodecSnafu)?;
        let session = self.session(session).await?;

        let mut published: Option<(RecordRef, ActorId)> = None;
        if let Some(mut session) = session.filter(|s| s.is_usable()) {
            let record = codec::encode_survey(&definition, &title).context(CodecSnafu)?;
            let write = Write::Create {
                collection: Collection::survey(),
                rkey: next_tid(),
                record: &record,
            };
            match self.write(&mut session, &write).await {
                Ok(Some(created)) => published = Some((created, session.actor.clone())),
                Ok(None) => (),
                Err(err) => self.degrade(&err, "survey"),
            }
        }

        let (uri, cid, author) = match published {
            Some((created, author)) => (Some(created.uri), Some(created.cid), Some(author)),
            None => (None, None, None),
        };
        let now = Utc::now();
        let survey = Survey {
            id: SurveyId::default(),
            uri,
            cid,
            author,
            // Placeholder; replaced at insertion
            slug: Slug::from_title(&title),
            title,
            definition,
            created_at: now,
            updated_at: now,
            results_uri: None,
            results_cid: None,
        };
        for _ in 0..SLUG_RACES {
            match self.insert_survey(survey.clone()).await {
                Err(Error::Storage { source }) if source.violated() == Some(Constraint::Slug) => {
                    debug!("Lost a race for a slug derived from {:?}; retrying", survey.title);
                }
                Err(Error::Storage { source })
                    if source.violated() == Some(Constraint::SurveyUri) =>
                {
                    // The firehose echo beat us here
                    return self.existing_survey(survey.uri.as_ref(), source).await;
                }
                result => return result,
            }
        }
        SlugExhaustedSnafu {
            title: survey.title,
        }
        .fail()
    }

    /// Record a vote on the survey named by `slug`
    pub async fn submit_response(
        &self,
        slug: &Slug,
        session: Option<&SessionId>,
        fingerprint: &Fingerprint,
        answers: Answers,
    ) -> Result<Response> {
        let answers = codec::sanitize_answers(answers);
        let survey = self.survey(slug).await?;
        validate_answers(&survey.definition, &answers).context(InvalidSnafu)?;

        let session = self.session(session).await?;
        let voter = match &session {
            Some(session) => Voter::Actor(session.actor.clone()),
            None => Voter::Guest(VoterSessionHash::new(
                &survey.id,
                &fingerprint.ip,
                &fingerprint.user_agent,
            )),
        };
        // Checked up-front so that a second vote is never published
        {
            let mut txn = self.storage.begin().await.context(StorageSnafu)?;
            let prior = txn
                .response_by_voter(&survey.id, &voter)
                .await
                .context(StorageSnafu)?;
            txn.rollback().await.context(StorageSnafu)?;
            if prior.is_some() {
                return self.already_voted(slug, &voter);
            }
        }

        let mut published: Option<RecordRef> = None;
        if let (Some(mut session), Some(survey_uri)) =
            (session.filter(|s| s.is_usable()), survey.uri.as_ref())
        {
            let record = codec::encode_response(survey_uri, survey.cid.as_ref(), &answers)
                .context(CodecSnafu)?;
            let write = Write::Create {
                collection: Collection::response(),
                rkey: next_tid(),
                record: &record,
            };
            match self.write(&mut session, &write).await {
                Ok(created) => published = created,
                Err(err) => self.degrade(&err, "response"),
            }
        }

        let (uri, cid) = match published {
            Some(created) => (Some(created.uri), Some(created.cid)),
            None => (None, None),
        };
        let response = Response {
            id: ResponseId::default(),
            survey_id: survey.id,
            voter,
            uri,
            cid,
            answers,
            created_at: Utc::now(),
        };
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        match txn.insert_response(&response).await {
            Ok(()) => {
                txn.commit().await.context(StorageSnafu)?;
                Ok(response)
            }
            Err(err) => {
                txn.rollback().await.context(StorageSnafu)?;
                match err.violated() {
                    Some(Constraint::ResponseActor) | Some(Constraint::ResponseSession) => {
                        self.already_voted(slug, &response.voter)
                    }
                    Some(Constraint::ResponseUri) => {
                        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
                        let existing = match response.uri.as_ref() {
                            Some(uri) => txn.response_by_uri(uri).await.context(StorageSnafu)?,
                            None => None,
                        };
                        txn.rollback().await.context(StorageSnafu)?;
                        existing.ok_or(Error::Storage { source: err })
                    }
                    _ => Err(Error::Storage { source: err }),
                }
            }
        }
    }

    /// Tally the votes on `slug` & publish them as a results record in its author's repository;
    /// only the author may do this, and only for a survey that was itself published. Publishing
    /// again overwrites the earlier tally.
    pub async fn publish_results(&self, slug: &Slug, session: &SessionId) -> Result<Survey> {
        let mut session = self
            .session(Some(session))
            .await?
            .filter(|s| s.is_usable())
            .context(SessionRequiredSnafu)?;
        let (survey, tally) = self.results(slug).await?;
        ensure!(
            survey.is_authored_by(&session.actor),
            NotAuthorSnafu {
                actor: session.actor.clone(),
                slug: slug.clone(),
            }
        );
        let survey_uri = survey.uri.as_ref().context(LocalOnlySnafu { slug: slug.clone() })?;
        let record =
            codec::encode_results(survey_uri, survey.cid.as_ref(), &tally).context(CodecSnafu)?;
        let write = match survey.results_uri.as_ref() {
            Some(uri) => Write::Put {
                uri,
                record: &record,
                current: survey.results_cid.as_ref(),
            },
            None => Write::Create {
                collection: Collection::results(),
                rkey: next_tid(),
                record: &record,
            },
        };
        let published = self
            .write(&mut session, &write)
            .await?
            .context(LocalOnlySnafu { slug: slug.clone() })?;
        info!("Published results for {} at {}", slug, published.uri);

        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        let Some(mut current) = txn.survey_by_id(&survey.id).await.context(StorageSnafu)? else {
            txn.rollback().await.context(StorageSnafu)?;
            return NoSuchSurveySnafu { slug: slug.clone() }.fail();
        };
        current.results_uri = Some(published.uri);
        current.results_cid = Some(published.cid);
        current.updated_at = Utc::now();
        txn.update_survey(&current).await.context(StorageSnafu)?;
        txn.commit().await.context(StorageSnafu)?;
        Ok(current)
    }

    /// Delete a survey: the record first (if it was published), then the row & its votes
    pub async fn delete_survey(&self, slug: &Slug, session: &SessionId) -> Result<()> {
        let mut session = self
            .session(Some(session))
            .await?
            .context(SessionRequiredSnafu)?;
        let survey = self.survey(slug).await?;
        ensure!(
            survey.is_authored_by(&session.actor),
            NotAuthorSnafu {
                actor: session.actor.clone(),
                slug: slug.clone(),
            }
        );
        if let Some(uri) = survey.uri.as_ref() {
            ensure!(session.is_usable(), SessionRequiredSnafu);
            self.write(&mut session, &Write::Delete { uri }).await?;
        }
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        txn.delete_survey(&survey.id).await.context(StorageSnafu)?;
        txn.commit().await.context(StorageSnafu)?;
        info!("Deleted survey {}", slug);
        Ok(())
    }

    /// The survey named by `slug` together with a live tally of its votes
    pub async fn results(&self, slug: &Slug) -> Result<(Survey, Tally)> {
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        let survey = txn.survey_by_slug(slug).await.context(StorageSnafu)?;
        let responses = match &survey {
            Some(survey) => txn
                .responses_for_survey(&survey.id)
                .await
                .context(StorageSnafu)?,
            None => Vec::new(),
        };
        txn.rollback().await.context(StorageSnafu)?;
        let survey = survey.context(NoSuchSurveySnafu { slug: slug.clone() })?;
        let tally = tally(&survey.definition, responses.iter().map(|r| &r.answers));
        Ok((survey, tally))
    }

    pub async fn survey(&self, slug: &Slug) -> Result<Survey> {
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        let survey = txn.survey_by_slug(slug).await.context(StorageSnafu)?;
        txn.rollback().await.context(StorageSnafu)?;
        survey.context(NoSuchSurveySnafu { slug: slug.clone() })
    }

    /// Look-up `id`, filling-in the PDS endpoint if the session lacks one
    async fn session(&self, id: Option<&SessionId>) -> Result<Option<OAuthSession>> {
        let Some(id) = id else {
            return Ok(None);
        };
        let Some(mut session) = self.keys.get_session(id).await.context(SessionSnafu)? else {
            return Ok(None);
        };
        if session.pds.is_none() {
            match self.resolver.resolve(session.actor.as_ref()).await {
                Ok(resolved) => {
                    session.pds = Some(resolved.pds);
                    self.keys
                        .save_session(&session)
                        .await
                        .context(SessionSnafu)?;
                }
                Err(err) => warn!("Couldn't find a PDS for {}: {}", session.actor, err),
            }
        }
        Ok(Some(session))
    }

    /// Run `write` against the session's PDS, refreshing tokens & retrying once if they've
    /// expired
    async fn write(
        &self,
        session: &mut OAuthSession,
        write: &Write<'_>,
    ) -> Result<Option<RecordRef>> {
        match self.write_once(session, write).await {
            Err(err) if err.kind() == ErrorKind::AuthExpired => {
                info!("Access token for {} has expired; refreshing", session.actor);
                *session = self.refresher.refresh(session).await.context(RefreshSnafu)?;
                self.keys
                    .save_session(session)
                    .await
                    .context(SessionSnafu)?;
                self.write_once(session, write).await.context(PdsSnafu)
            }
            result => result.context(PdsSnafu),
        }
    }

    async fn write_once(
        &self,
        session: &OAuthSession,
        write: &Write<'_>,
    ) -> pds::Result<Option<RecordRef>> {
        match write {
            Write::Create {
                collection,
                rkey,
                record,
            } => self
                .writer
                .create_record(session, collection, Some(rkey), record, None)
                .await
                .map(Some),
            Write::Put {
                uri,
                record,
                current,
            } => self
                .writer
                .update_record(session, uri, record, *current)
                .await
                .map(Some),
            Write::Delete { uri } => self
                .writer
                .delete_record(session, uri, None)
                .await
                .map(|_| None),
        }
    }

    fn degrade(&self, err: &Error, what: &'static str) {
        warn!("PDS write failed ({}); keeping the {} local-only: {}", err.kind(), what, err);
        counter_add!(
            self.instruments,
            "writes.local_only",
            1,
            &[KeyValue::new("record", what)]
        );
    }

    fn already_voted<T>(&self, slug: &Slug, voter: &Voter) -> Result<T> {
        let axis = match voter {
            Voter::Actor(_) => "actor",
            Voter::Guest(_) => "session",
        };
        counter_add!(
            self.instruments,
            "votes.rejected",
            1,
            &[KeyValue::new("axis", axis)]
        );
        AlreadyVotedSnafu { slug: slug.clone() }.fail()
    }

    /// Allocate a slug & insert `survey`, unless a row with its URI is already present
    async fn insert_survey(&self, mut survey: Survey) -> Result<Survey> {
        survey.check_author().context(InvalidSnafu)?;
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        if let Some(uri) = survey.uri.as_ref() {
            if let Some(existing) = txn.survey_by_uri(uri).await.context(StorageSnafu)? {
                txn.rollback().await.context(StorageSnafu)?;
                return Ok(existing);
            }
        }
        let Some(slug) = allocate_slug(txn.as_mut(), &survey.title)
            .await
            .context(StorageSnafu)?
        else {
            txn.rollback().await.context(StorageSnafu)?;
            return SlugExhaustedSnafu {
                title: survey.title,
            }
            .fail();
        };
        survey.slug = slug;
        if let Err(err) = txn.insert_survey(&survey).await {
            txn.rollback().await.context(StorageSnafu)?;
            return Err(Error::Storage { source: err });
        }
        txn.commit().await.context(StorageSnafu)?;
        info!("Created survey {} ({:?})", survey.slug, survey.uri);
        Ok(survey)
    }

    async fn existing_survey(
        &self,
        uri: Option<&RecordUri>,
        err: storage::Error,
    ) -> Result<Survey> {
        let mut txn = self.storage.begin().await.context(StorageSnafu)?;
        let existing = match uri {
            Some(uri) => txn.survey_by_uri(uri).await.context(StorageSnafu)?,
            None => None,
        };
        txn.rollback().await.context(StorageSnafu)?;
        existing.ok_or(Error::Storage { source: err })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        client::{fixtures::fast_retries, make_client, DEFAULT_TIMEOUT},
        entities::{fixtures::color_survey, Answer},
        memory::Memory,
        oauth::fixtures::session,
    };

    use crate::storage::Transaction;

    use async_trait::async_trait;
    use futures::future::join_all;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use url::Url;
    use wiremock::{
        matchers::{body_partial_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use std::sync::atomic::{AtomicUsize, Ordering};

    const SURVEY_URI: &str = "at://did:plc:alice/com.quorum.survey/3jzfcijpj2z2a";

    struct Fixture {
        memory: Memory,
        keys: Arc<KeyStore>,
        coordinator: Coordinator,
    }

    fn fixture() -> Fixture {
        let memory = Memory::default();
        fixture_over(Arc::new(memory.clone()), memory)
    }

    fn fixture_over(storage: Arc<dyn Backend + Send + Sync>, memory: Memory) -> Fixture {
        let instruments = Arc::new(Instruments::new("quorum-test"));
        let client = make_client("quorum-test/0.1.0", DEFAULT_TIMEOUT).unwrap();
        let keys = Arc::new(KeyStore::new(
            Arc::new(memory.clone()),
            identity::DEFAULT_REQUEST_TTL,
        ));
        let coordinator = Coordinator::new(
            storage,
            keys.clone(),
            Writer::new(client.clone(), &fast_retries(), instruments.clone()).unwrap(),
            Refresher::new(client.clone(), "https://quorum.example/client-metadata.json"),
            Arc::new(
                Resolver::new(
                    client,
                    &fast_retries(),
                    Url::parse("https://plc.invalid").unwrap(),
                    0,
                    std::time::Duration::from_secs(60),
                )
                .unwrap(),
            ),
            instruments,
        );
        Fixture {
            memory,
            keys,
            coordinator,
        }
    }

    fn vote(color: &str) -> Answers {
        let mut answers = Answers::new();
        answers.insert("color".to_owned(), Answer::Selected(vec![color.to_owned()]));
        answers
    }

    fn browser() -> Fingerprint {
        Fingerprint {
            ip: "203.0.113.7".parse().unwrap(),
            user_agent: "Mozilla/5.0".to_owned(),
        }
    }

    async fn mount_survey_create(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(json!({"collection": "com.quorum.survey"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": SURVEY_URI,
                "cid": "bafysurvey1"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn degrades_to_local_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture();
        let alice = session("did:plc:alice", &server.uri(), "https://issuer.invalid");
        f.keys.save_session(&alice).await.unwrap();

        let survey = f
            .coordinator
            .create_survey(Some(&alice.id), "Favorite color?", &color_survey())
            .await
            .unwrap();
        assert!(survey.is_local_only());
        assert!(survey.author.is_none());
        assert_eq!(survey.slug.as_ref(), "favorite-color");
        assert_eq!(f.memory.surveys().await.len(), 1);
    }

    #[tokio::test]
    async fn foreign_record_refs_stay_local_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:mallory/com.quorum.survey/3jzfcijpj2z2a",
                "cid": "bafysurvey1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture();
        let alice = session("did:plc:alice", &server.uri(), "https://issuer.invalid");
        f.keys.save_session(&alice).await.unwrap();

        let survey = f
            .coordinator
            .create_survey(Some(&alice.id), "Favorite color?", &color_survey())
            .await
            .unwrap();
        assert!(survey.is_local_only());
        assert!(survey.author.is_none());
        let stored = f.memory.surveys().await;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].uri.is_none());
        assert!(stored[0].check_author().is_ok());
    }

    #[tokio::test]
    async fn refreshes_expired_tokens_once() {
        let issuer = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer.uri(),
                "token_endpoint": format!("{}/oauth/token", issuer.uri()),
            })))
            .mount(&issuer)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "token_type": "DPoP",
                "refresh_token": "refresh-2",
                "expires_in": 300,
                "sub": "did:plc:alice"
            })))
            .expect(1)
            .mount(&issuer)
            .await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "DPoP access-1"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"error": "invalid_token", "message": "expired"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(header("authorization", "DPoP access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": SURVEY_URI,
                "cid": "bafysurvey1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture();
        let alice = session("did:plc:alice", &server.uri(), &issuer.uri());
        f.keys.save_session(&alice).await.unwrap();
        let survey = f
            .coordinator
            .create_survey(Some(&alice.id), "Favorite color?", &color_survey())
            .await
            .unwrap();
        assert_eq!(survey.uri.unwrap().to_string(), SURVEY_URI);
        assert_eq!(survey.author.unwrap().as_ref(), "did:plc:alice");
        let saved = f.keys.get_session(&alice.id).await.unwrap().unwrap();
        assert_eq!(saved.access_token.expose_secret(), "access-2");
    }

    /// A backend whose first `stale` slug lookups report the slug free, as a reader racing
    /// another writer would see it
    struct Stale {
        inner: Memory,
        stale: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for Stale {
        async fn begin(&self) -> storage::Result<Box<dyn Transaction>> {
            Ok(Box::new(StaleTransaction {
                inner: self.inner.begin().await?,
                stale: self.stale.clone(),
            }))
        }
    }

    struct StaleTransaction {
        inner: Box<dyn Transaction>,
        stale: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transaction for StaleTransaction {
        async fn survey_by_id(&mut self, id: &SurveyId) -> storage::Result<Option<Survey>> {
            self.inner.survey_by_id(id).await
        }
        async fn survey_by_slug(&mut self, slug: &Slug) -> storage::Result<Option<Survey>> {
            self.inner.survey_by_slug(slug).await
        }
        async fn survey_by_uri(&mut self, uri: &RecordUri) -> storage::Result<Option<Survey>> {
            self.inner.survey_by_uri(uri).await
        }
        async fn survey_by_results_uri(
            &mut self,
            uri: &RecordUri,
        ) -> storage::Result<Option<Survey>> {
            self.inner.survey_by_results_uri(uri).await
        }
        async fn slug_exists(&mut self, slug: &Slug) -> storage::Result<bool> {
            let stale = self
                .stale
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(!stale && self.inner.slug_exists(slug).await?)
        }
        async fn insert_survey(&mut self, survey: &Survey) -> storage::Result<()> {
            self.inner.insert_survey(survey).await
        }
        async fn update_survey(&mut self, survey: &Survey) -> storage::Result<()> {
            self.inner.update_survey(survey).await
        }
        async fn delete_survey(&mut self, id: &SurveyId) -> storage::Result<bool> {
            self.inner.delete_survey(id).await
        }
        async fn response_by_uri(&mut self, uri: &RecordUri) -> storage::Result<Option<Response>> {
            self.inner.response_by_uri(uri).await
        }
        async fn response_by_voter(
            &mut self,
            survey: &SurveyId,
            voter: &Voter,
        ) -> storage::Result<Option<Response>> {
            self.inner.response_by_voter(survey, voter).await
        }
        async fn responses_for_survey(
            &mut self,
            survey: &SurveyId,
        ) -> storage::Result<Vec<Response>> {
            self.inner.responses_for_survey(survey).await
        }
        async fn insert_response(&mut self, response: &Response) -> storage::Result<()> {
            self.inner.insert_response(response).await
        }
        async fn update_response(&mut self, response: &Response) -> storage::Result<()> {
            self.inner.update_response(response).await
        }
        async fn delete_response(&mut self, id: &ResponseId) -> storage::Result<bool> {
            self.inner.delete_response(id).await
        }
        async fn cursor(&mut self) -> storage::Result<i64> {
            self.inner.cursor().await
        }
        async fn set_cursor(&mut self, time_us: i64) -> storage::Result<()> {
            self.inner.set_cursor(time_us).await
        }
        async fn commit(self: Box<Self>) -> storage::Result<()> {
            self.inner.commit().await
        }
        async fn rollback(self: Box<Self>) -> storage::Result<()> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn concurrent_creates_get_distinct_slugs() {
        let f = fixture();
        let definition = color_survey();
        let created = join_all(
            (0..8).map(|_| f.coordinator.create_survey(None, "Favorite color?", &definition)),
        )
        .await;
        let mut slugs: Vec<String> = created
            .into_iter()
            .map(|survey| survey.unwrap().slug.to_string())
            .collect();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), 8);
        assert!(slugs.iter().any(|slug| slug == "favorite-color"));
        assert!(slugs.iter().any(|slug| slug == "favorite-color-8"));
        assert_eq!(f.memory.surveys().await.len(), 8);
    }

    #[tokio::test]
    async fn lost_slug_races_are_retried() {
        let memory = Memory::default();
        let stale = Arc::new(AtomicUsize::new(0));
        let f = fixture_over(
            Arc::new(Stale {
                inner: memory.clone(),
                stale: stale.clone(),
            }),
            memory,
        );
        let first = f
            .coordinator
            .create_survey(None, "Favorite color?", &color_survey())
            .await
            .unwrap();
        assert_eq!(first.slug.as_ref(), "favorite-color");

        // Two lost races, then an accurate read
        stale.store(SLUG_RACES - 1, Ordering::SeqCst);
        let second = f
            .coordinator
            .create_survey(None, "Favorite color?", &color_survey())
            .await
            .unwrap();
        assert_eq!(second.slug.as_ref(), "favorite-color-2");

        // Every attempt loses
        stale.store(SLUG_RACES, Ordering::SeqCst);
        let third = f
            .coordinator
            .create_survey(None, "Favorite color?", &color_survey())
            .await;
        assert!(matches!(third, Err(Error::SlugExhausted { .. })));
        assert_eq!(f.memory.surveys().await.len(), 2);
    }

    #[tokio::test]
    async fn one_vote_per_axis() {
        let f = fixture();
        let survey = f
            .coordinator
            .create_survey(None, "Favorite color?", &color_survey())
            .await
            .unwrap();

        f.coordinator
            .submit_response(&survey.slug, None, &browser(), vote("red"))
            .await
            .unwrap();
        let again = f
            .coordinator
            .submit_response(&survey.slug, None, &browser(), vote("blue"))
            .await;
        assert!(matches!(again, Err(Error::AlreadyVoted { .. })));

        // A signed-in voter from the same browser is a different voter
        let bob = session("did:plc:bob", "https://pds.invalid", "https://issuer.invalid");
        f.keys.save_session(&bob).await.unwrap();
        let response = f
            .coordinator
            .submit_response(&survey.slug, Some(&bob.id), &browser(), vote("green"))
            .await
            .unwrap();
        // Local-only survey, so the vote can't be published
        assert!(response.uri.is_none());
        let again = f
            .coordinator
            .submit_response(&survey.slug, Some(&bob.id), &browser(), vote("green"))
            .await;
        assert!(matches!(again, Err(Error::AlreadyVoted { .. })));

        let (_, tally) = f.coordinator.results(&survey.slug).await.unwrap();
        assert_eq!(tally.total_votes, 2);

        let bad = f
            .coordinator
            .submit_response(
                &survey.slug,
                None,
                &Fingerprint {
                    ip: "198.51.100.1".parse().unwrap(),
                    user_agent: "curl/8".to_owned(),
                },
                vote("mauve"),
            )
            .await;
        assert_eq!(bad.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn results_and_deletion_belong_to_the_author() {
        let server = MockServer::start().await;
        mount_survey_create(&server).await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .and(body_partial_json(
                json!({"collection": "com.quorum.survey.results"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uri": "at://did:plc:alice/com.quorum.survey.results/3jzfcijpj2z4a",
                "cid": "bafyresults1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.deleteRecord"))
            .and(body_partial_json(json!({"repo": "did:plc:alice", "rkey": "3jzfcijpj2z2a"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let f = fixture();
        let alice = session("did:plc:alice", &server.uri(), "https://issuer.invalid");
        let dave = session("did:plc:dave", &server.uri(), "https://issuer.invalid");
        f.keys.save_session(&alice).await.unwrap();
        f.keys.save_session(&dave).await.unwrap();
        let survey = f
            .coordinator
            .create_survey(Some(&alice.id), "Favorite color?", &color_survey())
            .await
            .unwrap();

        let denied = f.coordinator.publish_results(&survey.slug, &dave.id).await;
        assert!(matches!(denied, Err(Error::NotAuthor { .. })));
        let published = f
            .coordinator
            .publish_results(&survey.slug, &alice.id)
            .await
            .unwrap();
        assert_eq!(
            published.results_cid.unwrap().as_ref(),
            "bafyresults1"
        );

        let denied = f.coordinator.delete_survey(&survey.slug, &dave.id).await;
        assert!(matches!(denied, Err(Error::NotAuthor { .. })));
        f.coordinator
            .delete_survey(&survey.slug, &alice.id)
            .await
            .unwrap();
        assert!(f.memory.surveys().await.is_empty());
    }
}
