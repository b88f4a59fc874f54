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

//! Shared fixtures for the quorum integration tests.
//!
//! Records are built from wire-format JSON literals rather than through the codec, so that these
//! tests pin the schema as it appears on the network.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use secrecy::SecretString;
use serde_json::{json, Value};
use url::Url;

use quorum_shared::{backoff::ExponentialBackoffParameters, ActorId, SessionId};

use quorum::{
    client::{make_client, DEFAULT_TIMEOUT},
    coordinator::Coordinator,
    dpop::DpopKey,
    entities::{Response, Survey},
    identity::{KeyStore, OAuthSession, DEFAULT_REQUEST_TTL},
    memory::Memory,
    metrics::Instruments,
    oauth::Refresher,
    pds::Writer,
    processor::{Commit, Operation, Processor},
    resolver::Resolver,
};

use std::sync::Arc;

pub const ALICE: &str = "did:plc:alice";
pub const BOB: &str = "did:plc:bob";
pub const CAROL: &str = "did:plc:carol";

pub const SURVEY_NSID: &str = "com.quorum.survey";
pub const RESPONSE_NSID: &str = "com.quorum.survey.response";
pub const RESULTS_NSID: &str = "com.quorum.survey.results";

pub fn instruments() -> Arc<Instruments> {
    Arc::new(Instruments::new("quorum-test"))
}

pub fn survey_record(title: &str) -> Value {
    json!({
        "$type": SURVEY_NSID,
        "name": title,
        "questions": [{
            "id": "color",
            "text": "Pick one",
            "type": "single",
            "required": true,
            "options": [
                {"id": "red", "text": "Red"},
                {"id": "blue", "text": "Blue"},
                {"id": "green", "text": "Green"}
            ]
        }],
        "createdAt": "2025-03-01T12:00:00Z"
    })
}

pub fn vote_record(survey_uri: &str, survey_cid: &str, color: &str) -> Value {
    json!({
        "$type": RESPONSE_NSID,
        "subject": {"uri": survey_uri, "cid": survey_cid},
        "answers": [{"questionId": "color", "selectedOptions": [color]}],
        "createdAt": "2025-03-01T12:05:00Z"
    })
}

pub fn results_record(survey_uri: &str, survey_cid: &str, red: u64) -> Value {
    json!({
        "$type": RESULTS_NSID,
        "subject": {"uri": survey_uri, "cid": survey_cid},
        "totalVotes": red,
        "questionResults": [{
            "questionId": "color",
            "optionCounts": [
                {"optionId": "red", "count": red},
                {"optionId": "blue", "count": 0},
                {"optionId": "green", "count": 0}
            ],
            "textResponseCount": 0
        }],
        "finalizedAt": "2025-03-02T00:00:00Z"
    })
}

pub fn uri(repo: &str, collection: &str, rkey: &str) -> String {
    format!("at://{}/{}/{}", repo, collection, rkey)
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
        cid: cid.map(str::to_owned),
        record,
        time_us,
    }
}

pub fn processor(memory: &Memory) -> Processor {
    Processor::new(Arc::new(memory.clone()), instruments())
}

/// A usable session for `actor` whose PDS is `pds`
pub fn session(actor: &str, pds: &str) -> OAuthSession {
    let now = Utc::now();
    OAuthSession {
        id: SessionId::default(),
        actor: ActorId::new(actor).unwrap(),
        access_token: SecretString::from("access-1".to_owned()),
        refresh_token: SecretString::from("refresh-1".to_owned()),
        signing_key: DpopKey::generate(),
        pds: Some(Url::parse(pds).unwrap()),
        issuer: Url::parse("https://issuer.invalid").unwrap(),
        token_expires_at: now + Duration::minutes(5),
        expires_at: now + Duration::days(7),
    }
}

pub fn fast_retries() -> ExponentialBackoffParameters {
    ExponentialBackoffParameters::new(
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(2),
        0.0,
        2,
    )
    .unwrap()
}

pub fn coordinator(memory: &Memory) -> (Coordinator, Arc<KeyStore>) {
    let instruments = instruments();
    let client = make_client("quorum-test/0.1.0", DEFAULT_TIMEOUT).unwrap();
    let keys = Arc::new(KeyStore::new(Arc::new(memory.clone()), DEFAULT_REQUEST_TTL));
    let coordinator = Coordinator::new(
        Arc::new(memory.clone()),
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
    (coordinator, keys)
}

/// The parts of a survey row that firehose replay must leave alone
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SurveyState {
    pub uri: Option<String>,
    pub cid: Option<String>,
    pub author: Option<String>,
    pub slug: String,
    pub title: String,
    pub results_uri: Option<String>,
    pub results_cid: Option<String>,
}

impl From<&Survey> for SurveyState {
    fn from(survey: &Survey) -> Self {
        SurveyState {
            uri: survey.uri.as_ref().map(|u| u.to_string()),
            cid: survey.cid.as_ref().map(|c| c.to_string()),
            author: survey.author.as_ref().map(|a| a.to_string()),
            slug: survey.slug.to_string(),
            title: survey.title.clone(),
            results_uri: survey.results_uri.as_ref().map(|u| u.to_string()),
            results_cid: survey.results_cid.as_ref().map(|c| c.to_string()),
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResponseState {
    pub uri: Option<String>,
    pub cid: Option<String>,
    pub voter: String,
    pub answers: String,
}

impl From<&Response> for ResponseState {
    fn from(response: &Response) -> Self {
        ResponseState {
            uri: response.uri.as_ref().map(|u| u.to_string()),
            cid: response.cid.as_ref().map(|c| c.to_string()),
            voter: format!("{:?}", response.voter),
            answers: serde_json::to_string(&response.answers).unwrap(),
        }
    }
}

/// Everything in the index, in a canonical order
pub async fn snapshot(memory: &Memory) -> (Vec<SurveyState>, Vec<ResponseState>) {
    let mut surveys: Vec<SurveyState> = memory.surveys().await.iter().map(Into::into).collect();
    let mut responses: Vec<ResponseState> =
        memory.responses().await.iter().map(Into::into).collect();
    surveys.sort();
    responses.sort();
    (surveys, responses)
}
