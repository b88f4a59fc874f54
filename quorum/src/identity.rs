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

//! # identity
//!
//! The Identity & Key Store: persistence for in-flight OAuth authorization requests and for the
//! sessions they produce.
//!
//! A login begins with [KeyStore::new_request], which mints a CSRF state token, a PKCE verifier
//! and a fresh [DpopKey] for the session-to-be; the caller redirects the user to the issuer with
//! the state in both the URL & a cookie. On callback, [KeyStore::complete_request] compares the
//! two in constant time and, on a match, consumes the request. Whatever exchanges the code for
//! tokens then hands us an [OAuthSession] to [save](KeyStore::save_session).
//!
//! The backing [Store] is implemented by both storage back-ends.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use snafu::{prelude::*, Backtrace};
use subtle::ConstantTimeEq;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info};
use url::Url;

use quorum_shared::{ActorId, SessionId};

use crate::{dpop::DpopKey, error::ErrorKind, storage};

use std::sync::Arc;

/// Lifetime of an [OAuthRequest]
pub const DEFAULT_REQUEST_TTL: Duration = Duration::minutes(10);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The OAuth state parameter doesn't match the state cookie"))]
    CsrfMismatch { backtrace: Backtrace },
    #[snafu(display("The OAuth request expired at {expired_at}"))]
    RequestExpired {
        expired_at: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mint a signing key: {source}"))]
    SigningKey {
        #[snafu(source(from(crate::dpop::Error, Box::new)))]
        source: Box<crate::dpop::Error>,
    },
    #[snafu(display("Identity store failure: {source}"))]
    Store { source: storage::Error },
    #[snafu(display("No OAuth request is pending for that state"))]
    UnknownRequest { backtrace: Backtrace },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CsrfMismatch { .. }
            | Error::RequestExpired { .. }
            | Error::UnknownRequest { .. } => ErrorKind::Unauthorized,
            Error::SigningKey { .. } | Error::Store { .. } => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           entities                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A pending authorization request
#[derive(Clone, Debug)]
pub struct OAuthRequest {
    pub state: String,
    pub issuer: Url,
    pub pkce_verifier: SecretString,
    pub signing_key: DpopKey,
    /// Where to send the user once they're logged-in
    pub destination: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthRequest {
    /// The S256 PKCE code challenge to send with the authorization request
    pub fn code_challenge(&self) -> String {
        pkce_challenge(self.pkce_verifier.expose_secret())
    }
}

/// An authenticated session, bound to one actor & one signing key
#[derive(Clone, Debug)]
pub struct OAuthSession {
    pub id: SessionId,
    pub actor: ActorId,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub signing_key: DpopKey,
    /// The only host to which we'll ever send `access_token` or a proof made with `signing_key`
    pub pds: Option<Url>,
    pub issuer: Url,
    pub token_expires_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthSession {
    /// A usable session can write to its PDS: it has an access token & an endpoint
    pub fn is_usable(&self) -> bool {
        !self.access_token.expose_secret().is_empty() && self.pds.is_some()
    }
    pub fn is_expired(&self, now: &DateTime<Utc>) -> bool {
        self.expires_at <= *now
    }
}

/// `base64url(SHA-256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// 32 random bytes, base64url-encoded
fn random_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Store                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Store {
    async fn put_request(&self, request: &OAuthRequest) -> storage::Result<()>;
    /// Atomically look-up & delete the request with the given state
    async fn take_request(&self, state: &str) -> storage::Result<Option<OAuthRequest>>;
    async fn save_session(&self, session: &OAuthSession) -> storage::Result<()>;
    async fn get_session(&self, id: &SessionId) -> storage::Result<Option<OAuthSession>>;
    async fn delete_session(&self, id: &SessionId) -> storage::Result<bool>;
    /// Remove requests & sessions expired as of `now`; returns the number of each removed
    async fn expire(&self, now: &DateTime<Utc>) -> storage::Result<(usize, usize)>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           KeyStore                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct KeyStore {
    store: Arc<dyn Store + Send + Sync>,
    request_ttl: Duration,
}

impl KeyStore {
    pub fn new(store: Arc<dyn Store + Send + Sync>, request_ttl: Duration) -> KeyStore {
        KeyStore { store, request_ttl }
    }
    /// Begin an authorization: returns the state token & the persisted request
    pub async fn new_request(
        &self,
        issuer: &Url,
        destination: &str,
    ) -> Result<(String, OAuthRequest)> {
        let now = Utc::now();
        let request = OAuthRequest {
            state: random_token(),
            issuer: issuer.clone(),
            pkce_verifier: SecretString::from(random_token()),
            signing_key: DpopKey::generate(),
            destination: destination.to_owned(),
            created_at: now,
            expires_at: now + self.request_ttl,
        };
        self.store.put_request(&request).await.context(StoreSnafu)?;
        debug!("New OAuth request for {}", issuer);
        Ok((request.state.clone(), request))
    }
    /// Consume the request named by `state`, provided it matches `cookie_state`
    pub async fn complete_request(&self, state: &str, cookie_state: &str) -> Result<OAuthRequest> {
        ensure!(
            bool::from(state.as_bytes().ct_eq(cookie_state.as_bytes())),
            CsrfMismatchSnafu
        );
        let request = self
            .store
            .take_request(state)
            .await
            .context(StoreSnafu)?
            .context(UnknownRequestSnafu)?;
        ensure!(
            request.expires_at > Utc::now(),
            RequestExpiredSnafu {
                expired_at: request.expires_at
            }
        );
        Ok(request)
    }
    pub async fn save_session(&self, session: &OAuthSession) -> Result<()> {
        self.store.save_session(session).await.context(StoreSnafu)
    }
    /// Sessions past their absolute expiry are treated as absent (and removed)
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<OAuthSession>> {
        match self.store.get_session(id).await.context(StoreSnafu)? {
            Some(session) if session.is_expired(&Utc::now()) => {
                self.store.delete_session(id).await.context(StoreSnafu)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }
    pub async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        self.store.delete_session(id).await.context(StoreSnafu)
    }
    pub async fn expire(&self) -> Result<(usize, usize)> {
        self.store.expire(&Utc::now()).await.context(StoreSnafu)
    }
}

/// Run [KeyStore::expire] every `interval` until notified
pub fn spawn_sweeper(
    keys: Arc<KeyStore>,
    interval: std::time::Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => match keys.expire().await {
                    Ok((0, 0)) => (),
                    Ok((requests, sessions)) => {
                        info!("Expired {} OAuth requests & {} sessions", requests, sessions)
                    }
                    Err(err) => tracing::error!("Session sweep failed: {}", err),
                },
                _ = shutdown.notified() => {
                    info!("Session sweeper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::memory::Memory;

    fn keys() -> KeyStore {
        KeyStore::new(Arc::new(Memory::default()), DEFAULT_REQUEST_TTL)
    }

    #[tokio::test]
    async fn request_lifecycle() {
        let keys = keys();
        let issuer = Url::parse("https://bsky.social").unwrap();
        let (state, request) = keys.new_request(&issuer, "/surveys").await.unwrap();
        assert_eq!(state.len(), 43);
        assert_eq!(
            request.code_challenge(),
            pkce_challenge(request.pkce_verifier.expose_secret())
        );

        assert!(matches!(
            keys.complete_request(&state, "not-the-cookie").await,
            Err(Error::CsrfMismatch { .. })
        ));
        let done = keys.complete_request(&state, &state).await.unwrap();
        assert_eq!(done.destination, "/surveys");
        assert_eq!(done.signing_key.thumbprint(), request.signing_key.thumbprint());
        // Consumed
        assert!(matches!(
            keys.complete_request(&state, &state).await,
            Err(Error::UnknownRequest { .. })
        ));
    }

    #[tokio::test]
    async fn expired_requests_are_refused() {
        let keys = KeyStore::new(Arc::new(Memory::default()), Duration::seconds(-1));
        let issuer = Url::parse("https://bsky.social").unwrap();
        let (state, _) = keys.new_request(&issuer, "/").await.unwrap();
        assert!(matches!(
            keys.complete_request(&state, &state).await,
            Err(Error::RequestExpired { .. })
        ));
    }

    #[test]
    fn rfc7636_challenge() {
        // Appendix B
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[tokio::test]
    async fn sessions() {
        let keys = keys();
        let now = Utc::now();
        let mut session = OAuthSession {
            id: SessionId::default(),
            actor: ActorId::new("did:plc:abc123").unwrap(),
            access_token: SecretString::from("at".to_owned()),
            refresh_token: SecretString::from("rt".to_owned()),
            signing_key: DpopKey::generate(),
            pds: Some(Url::parse("https://pds.example.com").unwrap()),
            issuer: Url::parse("https://bsky.social").unwrap(),
            token_expires_at: now + Duration::minutes(5),
            expires_at: now + Duration::days(1),
        };
        assert!(session.is_usable());
        assert!(!format!("{:?}", session).contains("\"at\""));
        keys.save_session(&session).await.unwrap();
        assert_eq!(
            keys.get_session(&session.id).await.unwrap().unwrap().actor,
            session.actor
        );

        session.expires_at = now - Duration::seconds(1);
        keys.save_session(&session).await.unwrap();
        assert!(keys.get_session(&session.id).await.unwrap().is_none());
        assert!(!keys.delete_session(&session.id).await.unwrap());

        session.pds = None;
        assert!(!session.is_usable());
    }
}
