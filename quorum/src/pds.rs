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

//! # PDS Writer
//!
//! Record writes into a user's repository, over the `com.atproto.repo.*` XRPC procedures.
//!
//! Every request carries the session's access token (`Authorization: DPoP <token>`) and a fresh
//! proof minted with the session's key over the method, the URL, a hash of the token, and the
//! latest nonce the PDS has handed us. PDSes rotate their nonces; we remember the most recent one
//! per origin, and when a PDS answers `use_dpop_nonce` we retry once with the nonce it sent.
//!
//! Failures are classified into [ErrorKind]s. Only [ErrorKind::Transport] is retried (under the
//! configured backoff policy); everything else is surfaced to the caller immediately.

use http::{
    header::{AUTHORIZATION, WWW_AUTHENTICATE},
    Method, StatusCode,
};
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};
use url::Url;

use quorum_shared::{backoff::ExponentialBackoffParameters, Cid, Collection, RecordUri, Rkey};

use crate::{
    client::{self, RetryPolicy},
    counter_add, dpop,
    error::ErrorKind,
    latency_observe,
    identity::OAuthSession,
    metrics::{self, Instruments, Sort},
};

use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Instant};

inventory::submit! { metrics::Registration::new("pds.requests", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("pds.retries", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("pds.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("pds.latency", Sort::Latency) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to decode the PDS response to {nsid}: {source}"))]
    Body {
        nsid: &'static str,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The PDS handed back a bad record reference: {source}"))]
    BadRef {
        source: quorum_shared::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The PDS answered {nsid} with non-JSON: {source}"))]
    De {
        nsid: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The session for {actor} may not write {uri}"))]
    ForeignRecord {
        actor: String,
        uri: RecordUri,
        backtrace: Backtrace,
    },
    #[snafu(display("The session for {actor} has no PDS endpoint"))]
    NoPds { actor: String, backtrace: Backtrace },
    #[snafu(display("Failed to mint a request proof: {source}"))]
    Proof {
        #[snafu(source(from(dpop::Error, Box::new)))]
        source: Box<dpop::Error>,
    },
    #[snafu(display("The PDS rejected {nsid} ({status}): {error}: {message}"))]
    Rejected {
        nsid: &'static str,
        status: StatusCode,
        error: String,
        message: String,
        kind: ErrorKind,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to send {nsid} to the PDS: {source}"))]
    Request {
        nsid: &'static str,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to form the XRPC URL: {source}"))]
    Url {
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Rejected { kind, .. } => *kind,
            Error::Request { .. } => ErrorKind::Transport,
            Error::NoPds { .. } | Error::ForeignRecord { .. } => ErrorKind::Unauthorized,
            Error::Body { .. } | Error::De { .. } | Error::BadRef { .. } => ErrorKind::Transport,
            Error::Proof { .. } | Error::Url { .. } => ErrorKind::Internal,
        }
    }
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Request { .. })
            || matches!(self, Error::Rejected { kind, .. } if *kind == ErrorKind::Transport)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map an XRPC failure to an [ErrorKind]
fn classify(status: StatusCode, error: &str, www_authenticate: &str) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED
            if error == "invalid_token"
                || error == "ExpiredToken"
                || www_authenticate.contains("invalid_token") =>
        {
            ErrorKind::AuthExpired
        }
        StatusCode::UNAUTHORIZED => ErrorKind::AuthProof,
        StatusCode::BAD_REQUEST if error == "ExpiredToken" => ErrorKind::AuthExpired,
        StatusCode::BAD_REQUEST if error == "InvalidSwap" => ErrorKind::Conflict,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Unavailable,
        s if s.is_server_error() => ErrorKind::Transport,
        StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        _ => ErrorKind::Validation,
    }
}

fn is_nonce_challenge(status: StatusCode, error: &str, www_authenticate: &str) -> bool {
    (status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST)
        && (error == "use_dpop_nonce" || www_authenticate.contains("use_dpop_nonce"))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          wire types                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The `(uri, cid)` a successful write hands back
#[derive(Clone, Debug, PartialEq)]
pub struct RecordRef {
    pub uri: RecordUri,
    pub cid: Cid,
}

#[derive(Deserialize)]
struct RefOutput {
    uri: String,
    cid: String,
}

impl TryFrom<RefOutput> for RecordRef {
    type Error = Error;

    fn try_from(value: RefOutput) -> Result<RecordRef> {
        Ok(RecordRef {
            uri: RecordUri::parse(&value.uri).context(BadRefSnafu)?,
            cid: Cid::new(&value.cid).context(BadRefSnafu)?,
        })
    }
}

#[derive(Deserialize)]
struct EmptyOutput {}

#[derive(Clone, Debug)]
pub struct ListedRecord {
    pub uri: RecordUri,
    pub cid: Cid,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub struct RecordPage {
    pub records: Vec<ListedRecord>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListOutput {
    records: Vec<ListedOutput>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListedOutput {
    uri: String,
    cid: String,
    value: Value,
}

#[derive(Serialize)]
struct CreateInput<'a> {
    repo: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rkey: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validate: Option<bool>,
    record: &'a Value,
}

#[derive(Serialize)]
struct PutInput<'a> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    validate: Option<bool>,
    record: &'a Value,
    #[serde(rename = "swapRecord", skip_serializing_if = "Option::is_none")]
    swap_record: Option<&'a str>,
}

#[derive(Serialize)]
struct DeleteInput<'a> {
    repo: &'a str,
    collection: &'a str,
    rkey: &'a str,
    #[serde(rename = "swapRecord", skip_serializing_if = "Option::is_none")]
    swap_record: Option<&'a str>,
}

#[derive(Default, Deserialize)]
struct XrpcError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Writer                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Writer {
    client: reqwest::Client,
    retry: RetryPolicy,
    /// PDS origin -> most recent nonce
    nonces: Mutex<HashMap<String, String>>,
    instruments: Arc<Instruments>,
}

impl Writer {
    pub fn new(
        client: reqwest::Client,
        backoff: &ExponentialBackoffParameters,
        instruments: Arc<Instruments>,
    ) -> std::result::Result<Writer, client::Error> {
        Ok(Writer {
            client,
            retry: RetryPolicy::new(backoff)?,
            nonces: Mutex::new(HashMap::new()),
            instruments,
        })
    }
    /// Create a record; with no `rkey`, the PDS assigns one
    pub async fn create_record(
        &self,
        session: &OAuthSession,
        collection: &Collection,
        rkey: Option<&Rkey>,
        record: &Value,
        validate: Option<bool>,
    ) -> Result<RecordRef> {
        let input = CreateInput {
            repo: session.actor.as_ref(),
            collection: collection.as_ref(),
            rkey: rkey.map(|r| r.as_ref()),
            validate,
            record,
        };
        let body = serde_json::to_value(&input).context(DeSnafu {
            nsid: "com.atproto.repo.createRecord",
        })?;
        let written: RecordRef = self
            .call::<RefOutput>(
                session,
                Method::POST,
                "com.atproto.repo.createRecord",
                &[],
                Some(&body),
            )
            .await?
            .try_into()?;
        // The PDS names the record; it had better be in the session's own repository
        self.check_owner(session, &written.uri)?;
        Ok(written)
    }
    /// Create or overwrite the record at `rkey`; with `swap`, only if its current CID is `swap`
    pub async fn put_record(
        &self,
        session: &OAuthSession,
        collection: &Collection,
        rkey: &Rkey,
        record: &Value,
        swap: Option<&Cid>,
        validate: Option<bool>,
    ) -> Result<RecordRef> {
        let input = PutInput {
            repo: session.actor.as_ref(),
            collection: collection.as_ref(),
            rkey: rkey.as_ref(),
            validate,
            record,
            swap_record: swap.map(|c| c.as_ref()),
        };
        let body = serde_json::to_value(&input).context(DeSnafu {
            nsid: "com.atproto.repo.putRecord",
        })?;
        let written: RecordRef = self
            .call::<RefOutput>(
                session,
                Method::POST,
                "com.atproto.repo.putRecord",
                &[],
                Some(&body),
            )
            .await?
            .try_into()?;
        // The PDS names the record; it had better be in the session's own repository
        self.check_owner(session, &written.uri)?;
        Ok(written)
    }
    /// Overwrite an existing record of the session's own, guarded by its current CID
    pub async fn update_record(
        &self,
        session: &OAuthSession,
        uri: &RecordUri,
        record: &Value,
        current: Option<&Cid>,
    ) -> Result<RecordRef> {
        self.check_owner(session, uri)?;
        self.put_record(session, uri.collection(), uri.rkey(), record, current, None)
            .await
    }
    pub async fn delete_record(
        &self,
        session: &OAuthSession,
        uri: &RecordUri,
        swap: Option<&Cid>,
    ) -> Result<()> {
        self.check_owner(session, uri)?;
        let input = DeleteInput {
            repo: session.actor.as_ref(),
            collection: uri.collection().as_ref(),
            rkey: uri.rkey().as_ref(),
            swap_record: swap.map(|c| c.as_ref()),
        };
        let body = serde_json::to_value(&input).context(DeSnafu {
            nsid: "com.atproto.repo.deleteRecord",
        })?;
        self.call::<EmptyOutput>(
            session,
            Method::POST,
            "com.atproto.repo.deleteRecord",
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }
    /// One page of the session's records in `collection`
    pub async fn list_records(
        &self,
        session: &OAuthSession,
        collection: &Collection,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<RecordPage> {
        let mut query = vec![
            ("repo", session.actor.to_string()),
            ("collection", collection.to_string()),
        ];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_owned()));
        }
        let output = self
            .call::<ListOutput>(
                session,
                Method::GET,
                "com.atproto.repo.listRecords",
                &query,
                None,
            )
            .await?;
        Ok(RecordPage {
            records: output
                .records
                .into_iter()
                .map(|r| {
                    Ok(ListedRecord {
                        uri: RecordUri::parse(&r.uri).context(BadRefSnafu)?,
                        cid: Cid::new(&r.cid).context(BadRefSnafu)?,
                        value: r.value,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            cursor: output.cursor,
        })
    }

    fn check_owner(&self, session: &OAuthSession, uri: &RecordUri) -> Result<()> {
        ensure!(
            uri.actor() == &session.actor,
            ForeignRecordSnafu {
                actor: session.actor.to_string(),
                uri: uri.clone()
            }
        );
        Ok(())
    }
    fn nonce_for(&self, url: &Url) -> Option<String> {
        self.nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&url.origin().ascii_serialization())
            .cloned()
    }
    fn remember_nonce(&self, url: &Url, nonce: &str) {
        self.nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.origin().ascii_serialization(), nonce.to_owned());
    }
    async fn call<T: DeserializeOwned>(
        &self,
        session: &OAuthSession,
        method: Method,
        nsid: &'static str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let pds = session.pds.as_ref().context(NoPdsSnafu {
            actor: session.actor.to_string(),
        })?;
        let mut url = pds.join(&format!("xrpc/{}", nsid)).context(UrlSnafu)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        let labels = [KeyValue::new("nsid", nsid)];
        let start = Instant::now();
        let result = self
            .retry
            .run(
                Error::is_transient,
                |err| {
                    warn!("{} failed transiently ({}); will retry", nsid, err);
                    counter_add!(self.instruments, "pds.retries", 1, &labels);
                },
                || self.attempt(session, &method, nsid, &url, body),
            )
            .await;
        // Retries included
        latency_observe!(self.instruments, "pds.latency", start.elapsed(), &labels);
        result.inspect_err(|err| {
            debug!("{} failed: {}", nsid, err);
            counter_add!(
                self.instruments,
                "pds.failures",
                1,
                &[
                    KeyValue::new("nsid", nsid),
                    KeyValue::new("kind", err.kind().as_str())
                ]
            );
        })
    }
    /// One logical attempt: at most two requests, the second only if the first drew a nonce
    /// challenge
    async fn attempt<T: DeserializeOwned>(
        &self,
        session: &OAuthSession,
        method: &Method,
        nsid: &'static str,
        url: &Url,
        body: Option<&Value>,
    ) -> Result<T> {
        let token = session.access_token.expose_secret();
        let mut nonce_retried = false;
        loop {
            counter_add!(
                self.instruments,
                "pds.requests",
                1,
                &[KeyValue::new("nsid", nsid)]
            );
            let proof = session
                .signing_key
                .proof(method.as_str(), url, Some(token), self.nonce_for(url).as_deref())
                .context(ProofSnafu)?;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(AUTHORIZATION, format!("DPoP {}", token))
                .header("DPoP", proof);
            if let Some(body) = body {
                request = request.json(body);
            }
            let rsp = request.send().await.context(RequestSnafu { nsid })?;

            let fresh_nonce = rsp
                .headers()
                .get("dpop-nonce")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_owned());
            if let Some(nonce) = &fresh_nonce {
                self.remember_nonce(url, nonce);
            }

            let status = rsp.status();
            if status.is_success() {
                let bytes = rsp.bytes().await.context(BodySnafu { nsid })?;
                let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
                return serde_json::from_slice(bytes).context(DeSnafu { nsid });
            }

            let www = rsp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            let err: XrpcError = rsp.json().await.unwrap_or_default();
            if !nonce_retried
                && fresh_nonce.is_some()
                && is_nonce_challenge(status, &err.error, &www)
            {
                debug!(
                    "{} demanded a fresh DPoP nonce; retrying",
                    url.origin().ascii_serialization()
                );
                nonce_retried = true;
                continue;
            }
            return RejectedSnafu {
                nsid,
                status,
                kind: classify(status, &err.error, &www),
                error: err.error,
                message: err.message,
            }
            .fail();
        }
    }
}
