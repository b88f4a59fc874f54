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

//! # The edge API
//!
//! A thin JSON API over the [Coordinator]: enough to create & delete surveys, vote, and publish or
//! read results. Sign-in, listings & page rendering live elsewhere.
//!
//! [Coordinator]: crate::coordinator::Coordinator
//!
//! Bodies are read by the handlers themselves, each against its own limit; everything else is
//! capped at [DEFAULT_BODY_LIMIT] by a layer on the router.

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Path, Request, State},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use http::{header, HeaderValue, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use quorum_shared::{ResponseId, SessionId, Slug};

use crate::{
    aggregate::Tally,
    coordinator::{self, Fingerprint},
    entities::{Answers, Question, Response as Vote, Survey, SurveyDefinition},
    http::{session_id, user_agent, ErrorResponseBody},
    identity,
    quorum::Quorum,
    rate_limit::{self, Bucket, Key},
};

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

pub const SURVEY_BODY_LIMIT: usize = 100 * 1024;
pub const RESPONSE_BODY_LIMIT: usize = 10 * 1024;
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The request body exceeds {limit} bytes"))]
    Body { limit: usize, source: axum::Error },
    #[snafu(display("{source}"))]
    Coordinator { source: coordinator::Error },
    #[snafu(display("Malformed request body: {source}"))]
    De { source: serde_json::Error },
    #[snafu(display("{source}"))]
    RateLimited { source: rate_limit::Error },
    #[snafu(display("Session lookup failed: {source}"))]
    Session { source: identity::Error },
    #[snafu(display("That requires a signed-in session"))]
    SessionRequired { backtrace: Backtrace },
    #[snafu(display("No survey {text:?}"))]
    Slug {
        text: String,
        source: quorum_shared::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::Body { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            Error::Coordinator {
                source: coordinator::Error::NoSuchSurvey { .. },
            } => (StatusCode::NOT_FOUND, self.to_string()),
            Error::Coordinator { source } => (source.kind().status(), source.to_string()),
            Error::De { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Error::Session { source } => (source.kind().status(), self.to_string()),
            Error::SessionRequired { .. } => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::Slug { .. } => (StatusCode::NOT_FOUND, self.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, msg) = self.as_status_and_msg();
        if status.is_server_error() {
            // Nothing about the failure goes back to the caller but a reference into our logs
            let reference = Uuid::new_v4();
            error!("Reference {}: {:?}", reference, self);
            return (
                status,
                ErrorResponseBody {
                    error: status
                        .canonical_reason()
                        .unwrap_or("Internal Server Error")
                        .to_owned(),
                    details: Some(format!("Reference: {}", reference)),
                },
            )
                .into_response();
        }
        let mut response = (status, ErrorResponseBody::new(msg)).into_response();
        if let Error::RateLimited {
            source: rate_limit::Error::Limited { retry_after, .. },
        } = &self
        {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     requests & responses                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSurveyReq {
    pub title: String,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub anonymous: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitResponseReq {
    pub answers: Answers,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurveyRsp {
    pub slug: Slug,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_uri: Option<String>,
    pub local_only: bool,
    pub definition: SurveyDefinition,
}

impl From<&Survey> for SurveyRsp {
    fn from(survey: &Survey) -> Self {
        SurveyRsp {
            slug: survey.slug.clone(),
            title: survey.title.clone(),
            uri: survey.uri.as_ref().map(|u| u.to_string()),
            cid: survey.cid.as_ref().map(|c| c.to_string()),
            author: survey.author.as_ref().map(|a| a.to_string()),
            results_uri: survey.results_uri.as_ref().map(|u| u.to_string()),
            local_only: survey.is_local_only(),
            definition: survey.definition.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRsp {
    pub id: ResponseId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub local_only: bool,
}

impl From<&Vote> for VoteRsp {
    fn from(vote: &Vote) -> Self {
        VoteRsp {
            id: vote.id,
            uri: vote.uri.as_ref().map(|u| u.to_string()),
            local_only: vote.uri.is_none(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResultsRsp {
    #[serde(flatten)]
    pub survey: SurveyRsp,
    #[serde(flatten)]
    pub tally: Tally,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        utility functions                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Read & deserialize the request body, refusing to buffer more than `limit` bytes
async fn body<T: DeserializeOwned>(request: Request, limit: usize) -> Result<T> {
    let bytes = to_bytes(request.into_body(), limit)
        .await
        .context(BodySnafu { limit })?;
    serde_json::from_slice(&bytes).context(DeSnafu)
}

fn client_ip(state: &Quorum, request: &Request) -> IpAddr {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    state.trusted_proxies.client_ip(peer, request.headers())
}

/// Rate-limit by actor if the caller is signed-in, by address otherwise
async fn rate_key(state: &Quorum, session: Option<&SessionId>, ip: IpAddr) -> Result<Key> {
    if let Some(id) = session {
        if let Some(session) = state.keys.get_session(id).await.context(SessionSnafu)? {
            return Ok(Key::Actor(session.actor));
        }
    }
    Ok(Key::Ip(ip))
}

fn parse_slug(text: String) -> Result<Slug> {
    Slug::new(&text).context(SlugSnafu { text })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `POST /api/v1/surveys`
async fn create_survey(State(state): State<Arc<Quorum>>, request: Request) -> Response {
    async fn create_survey1(state: &Quorum, request: Request) -> Result<SurveyRsp> {
        let session = session_id(request.headers());
        let ip = client_ip(state, &request);
        let key = rate_key(state, session.as_ref(), ip).await?;
        state
            .limits
            .check(Bucket::SurveyCreate, &key)
            .context(RateLimitedSnafu)?;
        let req: CreateSurveyReq = body(request, SURVEY_BODY_LIMIT).await?;
        let definition = SurveyDefinition {
            questions: req.questions,
            anonymous: req.anonymous,
        };
        let survey = state
            .coordinator
            .create_survey(session.as_ref(), &req.title, &definition)
            .await
            .context(CoordinatorSnafu)?;
        Ok(SurveyRsp::from(&survey))
    }

    match create_survey1(&state, request).await {
        Ok(rsp) => {
            info!("Created survey {}", rsp.slug);
            (StatusCode::CREATED, Json(rsp)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// `POST /api/v1/surveys/{slug}/responses`
async fn submit_response(
    State(state): State<Arc<Quorum>>,
    Path(slug): Path<String>,
    request: Request,
) -> Response {
    async fn submit_response1(state: &Quorum, slug: String, request: Request) -> Result<VoteRsp> {
        let slug = parse_slug(slug)?;
        let session = session_id(request.headers());
        let fingerprint = Fingerprint {
            ip: client_ip(state, &request),
            user_agent: user_agent(request.headers()),
        };
        let key = rate_key(state, session.as_ref(), fingerprint.ip).await?;
        state
            .limits
            .check(Bucket::Vote, &key)
            .context(RateLimitedSnafu)?;
        let req: SubmitResponseReq = body(request, RESPONSE_BODY_LIMIT).await?;
        let vote = state
            .coordinator
            .submit_response(&slug, session.as_ref(), &fingerprint, req.answers)
            .await
            .context(CoordinatorSnafu)?;
        Ok(VoteRsp::from(&vote))
    }

    match submit_response1(&state, slug, request).await {
        Ok(rsp) => (StatusCode::CREATED, Json(rsp)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `POST /api/v1/surveys/{slug}/results`
async fn publish_results(
    State(state): State<Arc<Quorum>>,
    Path(slug): Path<String>,
    request: Request,
) -> Response {
    async fn publish_results1(state: &Quorum, slug: String, request: Request) -> Result<SurveyRsp> {
        let slug = parse_slug(slug)?;
        let session = session_id(request.headers()).context(SessionRequiredSnafu)?;
        let survey = state
            .coordinator
            .publish_results(&slug, &session)
            .await
            .context(CoordinatorSnafu)?;
        Ok(SurveyRsp::from(&survey))
    }

    match publish_results1(&state, slug, request).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => err.into_response(),
    }
}

/// `DELETE /api/v1/surveys/{slug}`
async fn delete_survey(
    State(state): State<Arc<Quorum>>,
    Path(slug): Path<String>,
    request: Request,
) -> Response {
    async fn delete_survey1(state: &Quorum, slug: String, request: Request) -> Result<()> {
        let slug = parse_slug(slug)?;
        let session = session_id(request.headers()).context(SessionRequiredSnafu)?;
        state
            .coordinator
            .delete_survey(&slug, &session)
            .await
            .context(CoordinatorSnafu)
    }

    match delete_survey1(&state, slug, request).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

/// `GET /api/v1/surveys/{slug}/results`
async fn get_results(State(state): State<Arc<Quorum>>, Path(slug): Path<String>) -> Response {
    async fn get_results1(state: &Quorum, slug: String) -> Result<ResultsRsp> {
        let slug = parse_slug(slug)?;
        let (survey, tally) = state
            .coordinator
            .results(&slug)
            .await
            .context(CoordinatorSnafu)?;
        Ok(ResultsRsp {
            survey: SurveyRsp::from(&survey),
            tally,
        })
    }

    match get_results1(&state, slug).await {
        Ok(rsp) => Json(rsp).into_response(),
        Err(err) => {
            debug!("GET results failed: {}", err);
            err.into_response()
        }
    }
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

pub fn make_router(state: Arc<Quorum>) -> Router {
    Router::new()
        .route("/api/v1/surveys", post(create_survey))
        .route("/api/v1/surveys/{slug}", delete(delete_survey))
        .route("/api/v1/surveys/{slug}/responses", post(submit_response))
        .route(
            "/api/v1/surveys/{slug}/results",
            get(get_results).post(publish_results),
        )
        .route("/healthcheck", get(healthcheck))
        .layer(RequestBodyLimitLayer::new(DEFAULT_BODY_LIMIT))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        client::{fixtures::fast_retries, make_client, DEFAULT_TIMEOUT},
        coordinator::Coordinator,
        entities::fixtures::color_survey,
        http::TrustedProxies,
        identity::KeyStore,
        memory::Memory,
        metrics::Instruments,
        oauth::Refresher,
        pds::Writer,
        rate_limit::{Config as RateLimitConfig, QuotaConfig, RateLimits},
        resolver::Resolver,
    };

    use axum::body::Body;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use url::Url;

    use std::{num::NonZeroU32, time::Duration};

    fn router(limits: RateLimitConfig) -> Router {
        let memory = Memory::default();
        let instruments = Arc::new(Instruments::new("quorum-test"));
        let client = make_client("quorum-test/0.1.0", DEFAULT_TIMEOUT).unwrap();
        let keys = Arc::new(KeyStore::new(
            Arc::new(memory.clone()),
            identity::DEFAULT_REQUEST_TTL,
        ));
        let coordinator = Coordinator::new(
            Arc::new(memory),
            keys.clone(),
            Writer::new(client.clone(), &fast_retries(), instruments.clone()).unwrap(),
            Refresher::new(client.clone(), "https://quorum.example/client-metadata.json"),
            Arc::new(
                Resolver::new(
                    client,
                    &fast_retries(),
                    Url::parse("https://plc.invalid").unwrap(),
                    0,
                    Duration::from_secs(60),
                )
                .unwrap(),
            ),
            instruments.clone(),
        );
        make_router(Arc::new(Quorum {
            coordinator,
            keys,
            limits: Arc::new(RateLimits::new(&limits, instruments.clone()).unwrap()),
            trusted_proxies: TrustedProxies::default(),
            instruments,
        }))
    }

    fn request(method: &str, uri: &str, body: Body, ip: [u8; 4], user_agent: &str) -> Request {
        let mut request = http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, user_agent)
            .body(body)
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 4242))));
        request
    }

    fn post_json(uri: &str, body: &Value) -> Request {
        request("POST", uri, Body::from(body.to_string()), [203, 0, 113, 7], "Mozilla/5.0")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn new_survey() -> Value {
        let mut body = serde_json::to_value(color_survey()).unwrap();
        body["title"] = json!("Favorite color");
        body
    }

    async fn create(router: &Router) -> String {
        let response = router
            .clone()
            .oneshot(post_json("/api/v1/surveys", &new_survey()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["localOnly"], json!(true));
        body["slug"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn guests_vote_once() {
        let router = router(RateLimitConfig::default());
        let slug = create(&router).await;
        let uri = format!("/api/v1/surveys/{}/responses", slug);
        let vote = json!({"answers": {"color": {"selected": ["red"]}}});

        let response = router.clone().oneshot(post_json(&uri, &vote)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["localOnly"], json!(true));

        let response = router.clone().oneshot(post_json(&uri, &vote)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // A different browser is a different guest
        let other = request(
            "POST",
            &uri,
            Body::from(json!({"answers": {"color": {"selected": ["blue"]}}}).to_string()),
            [198, 51, 100, 20],
            "curl/8.0",
        );
        let response = router.clone().oneshot(other).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                &format!("/api/v1/surveys/{}/results", slug),
                Body::empty(),
                [203, 0, 113, 7],
                "Mozilla/5.0",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["totalVotes"], json!(2));
        assert_eq!(body["title"], json!("Favorite color"));
        assert_eq!(
            body["questionResults"][0]["optionCounts"],
            json!([
                {"optionId": "red", "count": 1},
                {"optionId": "blue", "count": 1},
                {"optionId": "green", "count": 0}
            ])
        );
    }

    #[tokio::test]
    async fn bad_requests() {
        let router = router(RateLimitConfig::default());
        let slug = create(&router).await;

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                "/api/v1/surveys/no-such-survey/results",
                Body::empty(),
                [203, 0, 113, 7],
                "Mozilla/5.0",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(json_body(response).await["error"].is_string());

        let response = router
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/surveys/{}/responses", slug),
                &json!({"answers": {"color": {"selected": ["mauve"]}}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/api/v1/surveys",
                Body::from("{\"title\": "),
                [203, 0, 113, 7],
                "Mozilla/5.0",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Deletion & publication need a session
        let response = router
            .clone()
            .oneshot(request(
                "DELETE",
                &format!("/api/v1/surveys/{}", slug),
                Body::empty(),
                [203, 0, 113, 7],
                "Mozilla/5.0",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = router
            .clone()
            .oneshot(post_json(&format!("/api/v1/surveys/{}/results", slug), &json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                "/healthcheck",
                Body::empty(),
                [127, 0, 0, 1],
                "probe",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_bodies() {
        let router = router(RateLimitConfig::default());
        let slug = create(&router).await;

        let mut big = new_survey();
        big["title"] = json!("x".repeat(SURVEY_BODY_LIMIT + 1));
        let response = router
            .clone()
            .oneshot(post_json("/api/v1/surveys", &big))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let vote = json!({"answers": {"why": {"text": "y".repeat(RESPONSE_BODY_LIMIT)}}});
        let response = router
            .clone()
            .oneshot(post_json(&format!("/api/v1/surveys/{}/responses", slug), &vote))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Everything else stops at a megabyte
        let huge = vec![b' '; DEFAULT_BODY_LIMIT + 1];
        let mut req = request(
            "POST",
            &format!("/api/v1/surveys/{}/results", slug),
            Body::from(huge),
            [203, 0, 113, 7],
            "Mozilla/5.0",
        );
        req.headers_mut().insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(DEFAULT_BODY_LIMIT + 1),
        );
        let response = router.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn votes_are_rate_limited() {
        let router = router(RateLimitConfig {
            vote: QuotaConfig {
                requests: NonZeroU32::new(1).unwrap(),
                period: Duration::from_secs(60),
            },
            ..RateLimitConfig::default()
        });
        let slug = create(&router).await;
        let uri = format!("/api/v1/surveys/{}/responses", slug);

        let response = router
            .clone()
            .oneshot(post_json(&uri, &json!({"answers": {"color": {"selected": ["red"]}}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // Same address, different browser: the vote would be allowed, but the bucket is empty
        let response = router
            .clone()
            .oneshot(request(
                "POST",
                &uri,
                Body::from(json!({"answers": {"color": {"selected": ["blue"]}}}).to_string()),
                [203, 0, 113, 7],
                "curl/8.0",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after = response.headers().get(header::RETRY_AFTER).unwrap();
        let secs: u64 = retry_after.to_str().unwrap().parse().unwrap();
        assert!((1..=60).contains(&secs));
    }
}
