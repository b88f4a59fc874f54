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

//! # OAuth token refresh
//!
//! Access tokens are short-lived; when the PDS rejects one as expired, the coordinator asks the
//! session's issuer for a new one with the refresh grant. The token endpoint is discovered from
//! the issuer's authorization-server metadata. Like every request bound to the session's key,
//! the grant carries a DPoP proof (with no `ath`, since no access token accompanies it); if the
//! server demands a nonce we retry once with the nonce it supplied.

use chrono::{Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, info};
use url::Url;

use crate::{dpop, error::ErrorKind, identity::OAuthSession};

use std::{collections::HashMap, sync::Mutex};

/// Lifetime assumed for an access token when the issuer doesn't say
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::hours(1);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to decode the response from {url}: {source}"))]
    Body {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The issuer refused to refresh: {error}"))]
    Denied {
        error: String,
        status: reqwest::StatusCode,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mint a proof for the token request: {source}"))]
    Proof {
        #[snafu(source(from(dpop::Error, Box::new)))]
        source: Box<dpop::Error>,
    },
    #[snafu(display("Failed to request {url}: {source}"))]
    Request {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Tokens were issued for {sub}, not {actor}"))]
    Subject {
        sub: String,
        actor: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Can't form a URL from the issuer {issuer}: {source}"))]
    Url {
        issuer: Url,
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Denied { status, .. } if status.is_server_error() => ErrorKind::Transport,
            Error::Denied { .. } | Error::Subject { .. } => ErrorKind::Unauthorized,
            Error::Request { .. } => ErrorKind::Transport,
            Error::Body { .. } | Error::Proof { .. } | Error::Url { .. } => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              wire                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Deserialize)]
struct ServerMetadata {
    token_endpoint: Url,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    sub: Option<String>,
}

#[derive(Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Refresher                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Refresher {
    client: reqwest::Client,
    client_id: String,
    /// issuer -> token endpoint
    endpoints: Mutex<HashMap<Url, Url>>,
    /// issuer -> most recent DPoP nonce
    nonces: Mutex<HashMap<Url, String>>,
}

impl Refresher {
    pub fn new(client: reqwest::Client, client_id: &str) -> Refresher {
        Refresher {
            client,
            client_id: client_id.to_owned(),
            endpoints: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
        }
    }
    /// Exchange the session's refresh token for a new token set; returns the updated session
    /// (which the caller is responsible for saving)
    pub async fn refresh(&self, session: &OAuthSession) -> Result<OAuthSession> {
        let endpoint = self.token_endpoint(&session.issuer).await?;
        let mut nonce_retried = false;
        let rsp = loop {
            let nonce = self
                .nonces
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&session.issuer)
                .cloned();
            let proof = session
                .signing_key
                .proof("POST", &endpoint, None, nonce.as_deref())
                .context(ProofSnafu)?;
            let rsp = self
                .client
                .post(endpoint.clone())
                .header("DPoP", proof)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", session.refresh_token.expose_secret()),
                    ("client_id", self.client_id.as_str()),
                ])
                .send()
                .await
                .context(RequestSnafu {
                    url: endpoint.clone(),
                })?;
            let fresh_nonce = rsp
                .headers()
                .get("dpop-nonce")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_owned());
            if let Some(n) = &fresh_nonce {
                self.nonces
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(session.issuer.clone(), n.clone());
            }
            if rsp.status().is_success() {
                break rsp;
            }
            let status = rsp.status();
            let body: ErrorResponse = rsp.json().await.unwrap_or_default();
            if body.error == "use_dpop_nonce" && fresh_nonce.is_some() && !nonce_retried {
                debug!("{} demands a DPoP nonce; retrying", endpoint);
                nonce_retried = true;
                continue;
            }
            return DeniedSnafu {
                error: body.error,
                status,
            }
            .fail();
        };

        let tokens: TokenResponse = rsp.json().await.context(BodySnafu {
            url: endpoint.clone(),
        })?;
        if let Some(sub) = &tokens.sub {
            ensure!(
                sub == session.actor.as_ref(),
                SubjectSnafu {
                    sub: sub.clone(),
                    actor: session.actor.to_string()
                }
            );
        }
        info!("Refreshed the access token for {}", session.actor);
        let mut refreshed = session.clone();
        refreshed.access_token = SecretString::from(tokens.access_token);
        if let Some(rt) = tokens.refresh_token {
            refreshed.refresh_token = SecretString::from(rt);
        }
        refreshed.token_expires_at = Utc::now()
            + tokens
                .expires_in
                .map(Duration::seconds)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        Ok(refreshed)
    }
    async fn token_endpoint(&self, issuer: &Url) -> Result<Url> {
        if let Some(endpoint) = self
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(issuer)
        {
            return Ok(endpoint.clone());
        }
        let url = issuer
            .join("/.well-known/oauth-authorization-server")
            .context(UrlSnafu {
                issuer: issuer.clone(),
            })?;
        let rsp = self
            .client
            .get(url.clone())
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        ensure!(
            rsp.status().is_success(),
            DeniedSnafu {
                error: format!("metadata request answered {}", rsp.status()),
                status: rsp.status(),
            }
        );
        let metadata: ServerMetadata = rsp.json().await.context(BodySnafu { url })?;
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(issuer.clone(), metadata.token_endpoint.clone());
        Ok(metadata.token_endpoint)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::client::{make_client, DEFAULT_TIMEOUT};

    async fn issuer() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": server.uri(),
                "token_endpoint": format!("{}/oauth/token", server.uri()),
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn refresh_with_nonce_challenge() {
        let server = issuer().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header_exists("dpop"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("DPoP-Nonce", "n-1")
                    .set_body_json(json!({"error": "use_dpop_nonce"})),
            )
            .up_to_n_times(1)
            .mount(&server)
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
            .mount(&server)
            .await;

        let refresher = Refresher::new(
            make_client("quorum-test/0.1.0", DEFAULT_TIMEOUT).unwrap(),
            "https://quorum.example/client-metadata.json",
        );
        let session = fixtures::session("did:plc:alice", "https://pds.example.com", &server.uri());
        let refreshed = refresher.refresh(&session).await.unwrap();
        assert_eq!(refreshed.access_token.expose_secret(), "access-2");
        assert_eq!(refreshed.refresh_token.expose_secret(), "refresh-2");
        assert_eq!(refreshed.id, session.id);
        assert!(refreshed.token_expires_at <= Utc::now() + Duration::seconds(300));
    }

    #[tokio::test]
    async fn refusal_is_unauthorized() {
        let server = issuer().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;
        let refresher = Refresher::new(
            make_client("quorum-test/0.1.0", DEFAULT_TIMEOUT).unwrap(),
            "https://quorum.example/client-metadata.json",
        );
        let session = fixtures::session("did:plc:alice", "https://pds.example.com", &server.uri());
        let err = refresher.refresh(&session).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
