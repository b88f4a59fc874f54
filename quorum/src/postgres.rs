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

//! # postgres
//!
//! A [Backend] over PostgreSQL, via [sqlx]. The schema lives in `migrations/` and is applied on
//! connect. Uniqueness rules are unique constraints; violations (SQLSTATE 23505) are mapped back
//! to a [Constraint] by constraint name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use snafu::{prelude::*, Backtrace, IntoError};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::info;
use url::Url;
use uuid::Uuid;

use quorum_shared::{ActorId, Cid, RecordUri, ResponseId, SessionId, Slug, SurveyId};

use crate::{
    dpop::DpopKey,
    entities::{Answers, Response, Survey, SurveyDefinition, Voter, VoterSessionHash},
    identity::{self, OAuthRequest, OAuthSession},
    storage::{self, Backend, Constraint, Transaction},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to PostgreSQL: {source}"))]
    Connect {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad {column} in row: {source}"))]
    Column {
        column: &'static str,
        source: quorum_shared::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad voter session hash in row: {source}"))]
    SessionHash {
        source: crate::entities::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad signing key in row: {source}"))]
    SigningKey {
        source: crate::dpop::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad URL in {column}: {source}"))]
    Url {
        column: &'static str,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Response {id} has {count} voter identities"))]
    Voter {
        id: Uuid,
        count: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to apply migrations: {source}"))]
    Migrate {
        source: sqlx::migrate::MigrateError,
        backtrace: Backtrace,
    },
    #[snafu(display("PostgreSQL error: {source}"))]
    Sqlx {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Map a database error to a storage error, recognizing unique-constraint violations
fn map_sqlx(err: sqlx::Error) -> storage::Error {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            if let Some(constraint) = db.constraint().and_then(constraint_named) {
                return storage::Error::unique(constraint);
            }
        }
    }
    storage::Error::new(SqlxSnafu.into_error(err))
}

fn constraint_named(name: &str) -> Option<Constraint> {
    match name {
        "surveys_slug_key" => Some(Constraint::Slug),
        "surveys_uri_key" => Some(Constraint::SurveyUri),
        "surveys_results_uri_key" => Some(Constraint::ResultsUri),
        "responses_uri_key" => Some(Constraint::ResponseUri),
        "responses_survey_voter_did_key" => Some(Constraint::ResponseActor),
        "responses_survey_session_key" => Some(Constraint::ResponseSession),
        _ => None,
    }
}

fn parse_uri(column: &'static str, text: Option<String>) -> Result<Option<RecordUri>> {
    text.map(|s| RecordUri::parse(&s).context(ColumnSnafu { column }))
        .transpose()
}

fn parse_cid(column: &'static str, text: Option<String>) -> Result<Option<Cid>> {
    text.map(|s| Cid::new(&s).context(ColumnSnafu { column }))
        .transpose()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              rows                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! select_surveys {
    ($tail:literal) => {
        concat!(
            "SELECT id, uri, cid, author_did, slug, title, definition, created_at, updated_at, ",
            "results_uri, results_cid FROM surveys ",
            $tail
        )
    };
}

macro_rules! select_responses {
    ($tail:literal) => {
        concat!(
            "SELECT id, survey_id, voter_did, voter_session_hash, uri, cid, answers, created_at ",
            "FROM responses ",
            $tail
        )
    };
}

#[derive(sqlx::FromRow)]
struct SurveyRow {
    id: Uuid,
    uri: Option<String>,
    cid: Option<String>,
    author_did: Option<String>,
    slug: String,
    title: String,
    definition: Json<SurveyDefinition>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    results_uri: Option<String>,
    results_cid: Option<String>,
}

impl TryFrom<SurveyRow> for Survey {
    type Error = Error;

    fn try_from(row: SurveyRow) -> Result<Survey> {
        Ok(Survey {
            id: row.id.into(),
            uri: parse_uri("uri", row.uri)?,
            cid: parse_cid("cid", row.cid)?,
            author: row
                .author_did
                .map(|s| ActorId::new(&s).context(ColumnSnafu { column: "author_did" }))
                .transpose()?,
            slug: Slug::new(&row.slug).context(ColumnSnafu { column: "slug" })?,
            title: row.title,
            definition: row.definition.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            results_uri: parse_uri("results_uri", row.results_uri)?,
            results_cid: parse_cid("results_cid", row.results_cid)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResponseRow {
    id: Uuid,
    survey_id: Uuid,
    voter_did: Option<String>,
    voter_session_hash: Option<String>,
    uri: Option<String>,
    cid: Option<String>,
    answers: Json<Answers>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ResponseRow> for Response {
    type Error = Error;

    fn try_from(row: ResponseRow) -> Result<Response> {
        let voter = match (row.voter_did, row.voter_session_hash) {
            (Some(did), None) => {
                Voter::Actor(ActorId::new(&did).context(ColumnSnafu { column: "voter_did" })?)
            }
            (None, Some(hash)) => {
                Voter::Guest(VoterSessionHash::from_hex(&hash).context(SessionHashSnafu)?)
            }
            (did, hash) => {
                return VoterSnafu {
                    id: row.id,
                    count: usize::from(did.is_some()) + usize::from(hash.is_some()),
                }
                .fail()
            }
        };
        Ok(Response {
            id: row.id.into(),
            survey_id: row.survey_id.into(),
            voter,
            uri: parse_uri("uri", row.uri)?,
            cid: parse_cid("cid", row.cid)?,
            answers: row.answers.0,
            created_at: row.created_at,
        })
    }
}

fn to_survey(row: SurveyRow) -> storage::Result<Survey> {
    Survey::try_from(row).map_err(storage::Error::new)
}

fn to_response(row: ResponseRow) -> storage::Result<Response> {
    Response::try_from(row).map_err(storage::Error::new)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Postgres                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    pub async fn new(url: &SecretString, max_connections: u32) -> Result<Postgres> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url.expose_secret())
            .await
            .context(ConnectSnafu)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu)?;
        info!("Connected to PostgreSQL; migrations applied.");
        Ok(Postgres { pool })
    }
}

#[async_trait]
impl Backend for Postgres {
    async fn begin(&self) -> storage::Result<Box<dyn Transaction>> {
        Ok(Box::new(PgTransaction {
            txn: self.pool.begin().await.map_err(map_sqlx)?,
        }))
    }
}

struct PgTransaction {
    txn: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn survey_by_id(&mut self, id: &SurveyId) -> storage::Result<Option<Survey>> {
        sqlx::query_as::<_, SurveyRow>(select_surveys!("WHERE id = $1"))
            .bind(Uuid::from(*id))
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?
            .map(to_survey)
            .transpose()
    }
    async fn survey_by_slug(&mut self, slug: &Slug) -> storage::Result<Option<Survey>> {
        sqlx::query_as::<_, SurveyRow>(select_surveys!("WHERE slug = $1"))
            .bind(slug.as_ref())
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?
            .map(to_survey)
            .transpose()
    }
    async fn survey_by_uri(&mut self, uri: &RecordUri) -> storage::Result<Option<Survey>> {
        sqlx::query_as::<_, SurveyRow>(select_surveys!("WHERE uri = $1 FOR UPDATE"))
            .bind(uri.to_string())
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?
            .map(to_survey)
            .transpose()
    }
    async fn survey_by_results_uri(&mut self, uri: &RecordUri) -> storage::Result<Option<Survey>> {
        sqlx::query_as::<_, SurveyRow>(select_surveys!("WHERE results_uri = $1 FOR UPDATE"))
            .bind(uri.to_string())
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?
            .map(to_survey)
            .transpose()
    }
    async fn slug_exists(&mut self, slug: &Slug) -> storage::Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM surveys WHERE slug = $1)")
                .bind(slug.as_ref())
                .fetch_one(&mut *self.txn)
                .await
                .map_err(map_sqlx)?;
        Ok(exists)
    }
    async fn insert_survey(&mut self, survey: &Survey) -> storage::Result<()> {
        sqlx::query(
            "INSERT INTO surveys (id, uri, cid, author_did, slug, title, definition, created_at, \
             updated_at, results_uri, results_cid) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(Uuid::from(survey.id))
        .bind(survey.uri.as_ref().map(|u| u.to_string()))
        .bind(survey.cid.as_ref().map(|c| c.to_string()))
        .bind(survey.author.as_ref().map(|a| a.to_string()))
        .bind(survey.slug.as_ref())
        .bind(&survey.title)
        .bind(Json(&survey.definition))
        .bind(survey.created_at)
        .bind(survey.updated_at)
        .bind(survey.results_uri.as_ref().map(|u| u.to_string()))
        .bind(survey.results_cid.as_ref().map(|c| c.to_string()))
        .execute(&mut *self.txn)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
    async fn update_survey(&mut self, survey: &Survey) -> storage::Result<()> {
        sqlx::query(
            "UPDATE surveys SET uri = $2, cid = $3, author_did = $4, title = $5, definition = $6, \
             updated_at = $7, results_uri = $8, results_cid = $9 WHERE id = $1",
        )
        .bind(Uuid::from(survey.id))
        .bind(survey.uri.as_ref().map(|u| u.to_string()))
        .bind(survey.cid.as_ref().map(|c| c.to_string()))
        .bind(survey.author.as_ref().map(|a| a.to_string()))
        .bind(&survey.title)
        .bind(Json(&survey.definition))
        .bind(survey.updated_at)
        .bind(survey.results_uri.as_ref().map(|u| u.to_string()))
        .bind(survey.results_cid.as_ref().map(|c| c.to_string()))
        .execute(&mut *self.txn)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
    async fn delete_survey(&mut self, id: &SurveyId) -> storage::Result<bool> {
        let result = sqlx::query("DELETE FROM surveys WHERE id = $1")
            .bind(Uuid::from(*id))
            .execute(&mut *self.txn)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn response_by_uri(&mut self, uri: &RecordUri) -> storage::Result<Option<Response>> {
        sqlx::query_as::<_, ResponseRow>(select_responses!("WHERE uri = $1 FOR UPDATE"))
            .bind(uri.to_string())
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?
            .map(to_response)
            .transpose()
    }
    async fn response_by_voter(
        &mut self,
        survey: &SurveyId,
        voter: &Voter,
    ) -> storage::Result<Option<Response>> {
        let query = match voter {
            Voter::Actor(actor) => sqlx::query_as::<_, ResponseRow>(select_responses!(
                "WHERE survey_id = $1 AND voter_did = $2"
            ))
            .bind(Uuid::from(*survey))
            .bind(actor.to_string()),
            Voter::Guest(hash) => sqlx::query_as::<_, ResponseRow>(select_responses!(
                "WHERE survey_id = $1 AND voter_session_hash = $2"
            ))
            .bind(Uuid::from(*survey))
            .bind(hash.to_string()),
        };
        query
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?
            .map(to_response)
            .transpose()
    }
    async fn responses_for_survey(&mut self, survey: &SurveyId) -> storage::Result<Vec<Response>> {
        sqlx::query_as::<_, ResponseRow>(select_responses!(
            "WHERE survey_id = $1 ORDER BY created_at"
        ))
        .bind(Uuid::from(*survey))
        .fetch_all(&mut *self.txn)
        .await
        .map_err(map_sqlx)?
        .into_iter()
        .map(to_response)
        .collect()
    }
    async fn insert_response(&mut self, response: &Response) -> storage::Result<()> {
        sqlx::query(
            "INSERT INTO responses (id, survey_id, voter_did, voter_session_hash, uri, cid, \
             answers, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(Uuid::from(response.id))
        .bind(Uuid::from(response.survey_id))
        .bind(response.voter.actor().map(|a| a.to_string()))
        .bind(response.voter.session_hash().map(|h| h.to_string()))
        .bind(response.uri.as_ref().map(|u| u.to_string()))
        .bind(response.cid.as_ref().map(|c| c.to_string()))
        .bind(Json(&response.answers))
        .bind(response.created_at)
        .execute(&mut *self.txn)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
    async fn update_response(&mut self, response: &Response) -> storage::Result<()> {
        sqlx::query("UPDATE responses SET answers = $2, uri = $3, cid = $4 WHERE id = $1")
            .bind(Uuid::from(response.id))
            .bind(Json(&response.answers))
            .bind(response.uri.as_ref().map(|u| u.to_string()))
            .bind(response.cid.as_ref().map(|c| c.to_string()))
            .execute(&mut *self.txn)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
    async fn delete_response(&mut self, id: &ResponseId) -> storage::Result<bool> {
        let result = sqlx::query("DELETE FROM responses WHERE id = $1")
            .bind(Uuid::from(*id))
            .execute(&mut *self.txn)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cursor(&mut self) -> storage::Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT time_us FROM firehose_cursor WHERE id = 1")
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|(t,)| t).unwrap_or(0))
    }
    async fn set_cursor(&mut self, time_us: i64) -> storage::Result<()> {
        sqlx::query(
            "INSERT INTO firehose_cursor (id, time_us) VALUES (1, $1) ON CONFLICT (id) \
             DO UPDATE SET time_us = GREATEST(firehose_cursor.time_us, EXCLUDED.time_us)",
        )
        .bind(time_us)
        .execute(&mut *self.txn)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> storage::Result<()> {
        self.txn.commit().await.map_err(map_sqlx)
    }
    async fn rollback(self: Box<Self>) -> storage::Result<()> {
        self.txn.rollback().await.map_err(map_sqlx)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      identity::Store                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(sqlx::FromRow)]
struct RequestRow {
    state: String,
    issuer: String,
    pkce_verifier: String,
    signing_key: String,
    destination: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for OAuthRequest {
    type Error = Error;

    fn try_from(row: RequestRow) -> Result<OAuthRequest> {
        Ok(OAuthRequest {
            state: row.state,
            issuer: Url::parse(&row.issuer).context(UrlSnafu { column: "issuer" })?,
            pkce_verifier: SecretString::from(row.pkce_verifier),
            signing_key: DpopKey::from_jwk(&row.signing_key).context(SigningKeySnafu)?,
            destination: row.destination,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    did: String,
    access_token: String,
    refresh_token: String,
    signing_key: String,
    pds: Option<String>,
    issuer: String,
    token_expires_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for OAuthSession {
    type Error = Error;

    fn try_from(row: SessionRow) -> Result<OAuthSession> {
        Ok(OAuthSession {
            id: SessionId::from(row.id),
            actor: ActorId::new(&row.did).context(ColumnSnafu { column: "did" })?,
            access_token: SecretString::from(row.access_token),
            refresh_token: SecretString::from(row.refresh_token),
            signing_key: DpopKey::from_jwk(&row.signing_key).context(SigningKeySnafu)?,
            pds: row
                .pds
                .map(|s| Url::parse(&s).context(UrlSnafu { column: "pds" }))
                .transpose()?,
            issuer: Url::parse(&row.issuer).context(UrlSnafu { column: "issuer" })?,
            token_expires_at: row.token_expires_at,
            expires_at: row.expires_at,
        })
    }
}

fn export_key(key: &DpopKey) -> storage::Result<SecretString> {
    key.to_jwk()
        .map_err(|err| storage::Error::new(SigningKeySnafu.into_error(err)))
}

#[async_trait]
impl identity::Store for Postgres {
    async fn put_request(&self, request: &OAuthRequest) -> storage::Result<()> {
        let key = export_key(&request.signing_key)?;
        sqlx::query(
            "INSERT INTO oauth_requests (state, issuer, pkce_verifier, signing_key, destination, \
             created_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&request.state)
        .bind(request.issuer.as_str())
        .bind(request.pkce_verifier.expose_secret())
        .bind(key.expose_secret())
        .bind(&request.destination)
        .bind(request.created_at)
        .bind(request.expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
    async fn take_request(&self, state: &str) -> storage::Result<Option<OAuthRequest>> {
        sqlx::query_as::<_, RequestRow>(
            "DELETE FROM oauth_requests WHERE state = $1 RETURNING state, issuer, pkce_verifier, \
             signing_key, destination, created_at, expires_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(|row| OAuthRequest::try_from(row).map_err(storage::Error::new))
        .transpose()
    }
    async fn save_session(&self, session: &OAuthSession) -> storage::Result<()> {
        let key = export_key(&session.signing_key)?;
        sqlx::query(
            "INSERT INTO oauth_sessions (id, did, access_token, refresh_token, signing_key, pds, \
             issuer, token_expires_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET did = EXCLUDED.did, \
             access_token = EXCLUDED.access_token, refresh_token = EXCLUDED.refresh_token, \
             signing_key = EXCLUDED.signing_key, pds = EXCLUDED.pds, issuer = EXCLUDED.issuer, \
             token_expires_at = EXCLUDED.token_expires_at, expires_at = EXCLUDED.expires_at",
        )
        .bind(Uuid::from(session.id))
        .bind(session.actor.to_string())
        .bind(session.access_token.expose_secret())
        .bind(session.refresh_token.expose_secret())
        .bind(key.expose_secret())
        .bind(session.pds.as_ref().map(|u| u.to_string()))
        .bind(session.issuer.as_str())
        .bind(session.token_expires_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
    async fn get_session(&self, id: &SessionId) -> storage::Result<Option<OAuthSession>> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, did, access_token, refresh_token, signing_key, pds, issuer, \
             token_expires_at, expires_at FROM oauth_sessions WHERE id = $1",
        )
        .bind(Uuid::from(*id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .map(|row| OAuthSession::try_from(row).map_err(storage::Error::new))
        .transpose()
    }
    async fn delete_session(&self, id: &SessionId) -> storage::Result<bool> {
        let result = sqlx::query("DELETE FROM oauth_sessions WHERE id = $1")
            .bind(Uuid::from(*id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
    async fn expire(&self, now: &DateTime<Utc>) -> storage::Result<(usize, usize)> {
        let requests = sqlx::query("DELETE FROM oauth_requests WHERE expires_at <= $1")
            .bind(*now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let sessions = sqlx::query("DELETE FROM oauth_sessions WHERE expires_at <= $1")
            .bind(*now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok((
            requests.rows_affected() as usize,
            sessions.rows_affected() as usize,
        ))
    }
}
