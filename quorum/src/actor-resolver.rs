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

//! # Actor resolution
//!
//! Map a handle (`alice.example.com`) or DID to the DID and the PDS endpoint that hosts that
//! actor's repository.
//!
//! - handle -> DID: `GET https://<handle>/.well-known/atproto-did`, which returns the DID as text
//! - `did:plc:...` -> DID document: `GET <plc-directory>/<did>`
//! - `did:web:<host>` -> DID document: `GET https://<host>/.well-known/did.json`
//!
//! The PDS is the `serviceEndpoint` of the document's `#atproto_pds` service. Results may be
//! cached; cache entries are only ever invalidated by age.

use lru::LruCache;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace};
use tracing::debug;
use url::Url;

use quorum_shared::{backoff::ExponentialBackoffParameters, ActorId, Handle};

use crate::{
    client::{self, RetryPolicy},
    error::ErrorKind,
};

use std::{
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is neither a handle nor a DID"))]
    BadInput { text: String, backtrace: Backtrace },
    #[snafu(display("Failed to decode the response from {url}: {source}"))]
    Body {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} answered with a bad DID: {source}"))]
    Did {
        url: Url,
        source: quorum_shared::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The DID document for {actor} names no PDS"))]
    NoPds { actor: ActorId, backtrace: Backtrace },
    #[snafu(display("Failed to request {url}: {source}"))]
    Request {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad service endpoint {endpoint}: {source}"))]
    ServiceEndpoint {
        endpoint: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} answered {status}"))]
    Status {
        url: Url,
        status: reqwest::StatusCode,
        backtrace: Backtrace,
    },
    #[snafu(display("Can't resolve {actor}: unsupported DID method or form"))]
    Unsupported { actor: ActorId, backtrace: Backtrace },
    #[snafu(display("Failed to form a resolution URL: {source}"))]
    Url {
        source: url::ParseError,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Network failures & 5xx's are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Request { .. } => true,
            Error::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
    pub fn kind(&self) -> ErrorKind {
        match self {
            err if err.is_transient() => ErrorKind::Transport,
            Error::BadInput { .. } => ErrorKind::Malformed,
            Error::Url { .. } => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         DID documents                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct Service {
    id: String,
    #[serde(rename = "serviceEndpoint")]
    service_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(rename = "alsoKnownAs", default)]
    also_known_as: Vec<String>,
    #[serde(default)]
    service: Vec<Service>,
}

impl DidDocument {
    fn pds(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.ends_with("#atproto_pds"))
            .map(|s| s.service_endpoint.as_str())
    }
    fn handle(&self) -> Option<Handle> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .and_then(|h| Handle::new(h).ok())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Resolver                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedActor {
    pub actor: ActorId,
    pub handle: Option<Handle>,
    pub pds: Url,
}

pub struct Resolver {
    client: reqwest::Client,
    retry: RetryPolicy,
    plc_directory: Url,
    cache: Option<Mutex<LruCache<String, (Instant, ResolvedActor)>>>,
    ttl: Duration,
}

impl Resolver {
    /// `cache_size` of zero disables caching
    pub fn new(
        client: reqwest::Client,
        backoff: &ExponentialBackoffParameters,
        plc_directory: Url,
        cache_size: usize,
        ttl: Duration,
    ) -> std::result::Result<Resolver, client::Error> {
        Ok(Resolver {
            client,
            retry: RetryPolicy::new(backoff)?,
            plc_directory,
            cache: NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n))),
            ttl,
        })
    }
    /// Resolve a handle or DID to the actor's DID & PDS
    pub async fn resolve(&self, handle_or_did: &str) -> Result<ResolvedActor> {
        let key = handle_or_did.trim().to_ascii_lowercase();
        if let Some(hit) = self.cached(&key) {
            debug!("Actor cache hit for {}", key);
            return Ok(hit);
        }

        let resolved = match ActorId::new(handle_or_did.trim()) {
            Ok(actor) => self.resolve_did(actor, None).await?,
            Err(_) => {
                let handle = Handle::new(handle_or_did).ok().context(BadInputSnafu {
                    text: handle_or_did.to_owned(),
                })?;
                let actor = self.resolve_handle(&handle).await?;
                self.resolve_did(actor, Some(handle)).await?
            }
        };

        if let Some(cache) = &self.cache {
            cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(key, (Instant::now(), resolved.clone()));
        }
        Ok(resolved)
    }
    fn cached(&self, key: &str) -> Option<ResolvedActor> {
        let mut cache = self.cache.as_ref()?.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = cache
            .get(key)
            .and_then(|(at, resolved)| (at.elapsed() < self.ttl).then(|| resolved.clone()));
        if fresh.is_none() {
            cache.pop(key);
        }
        fresh
    }
    async fn resolve_handle(&self, handle: &Handle) -> Result<ActorId> {
        let url = handle_url(handle)?;
        let text = self
            .retry
            .run(Error::is_transient, |_| (), || self.get_text(&url))
            .await?;
        ActorId::new(text.trim()).context(DidSnafu { url })
    }
    async fn resolve_did(&self, actor: ActorId, handle: Option<Handle>) -> Result<ResolvedActor> {
        let url = self.document_url(&actor)?;
        let doc: DidDocument = self
            .retry
            .run(Error::is_transient, |_| (), || self.get_json(&url))
            .await?;
        let endpoint = doc.pds().context(NoPdsSnafu {
            actor: actor.clone(),
        })?;
        let pds = Url::parse(endpoint).context(ServiceEndpointSnafu { endpoint })?;
        debug!("Resolved {} to PDS {}", actor, pds);
        Ok(ResolvedActor {
            handle: handle.or_else(|| doc.handle()),
            actor,
            pds,
        })
    }
    fn document_url(&self, actor: &ActorId) -> Result<Url> {
        match actor.method() {
            "plc" => Url::parse(&format!(
                "{}/{}",
                self.plc_directory.as_str().trim_end_matches('/'),
                actor
            ))
            .context(UrlSnafu),
            "web" if !actor.method_specific_id().contains(':') => Url::parse(&format!(
                "https://{}/.well-known/did.json",
                actor.method_specific_id().replace("%3A", ":")
            ))
            .context(UrlSnafu),
            _ => UnsupportedSnafu {
                actor: actor.clone(),
            }
            .fail(),
        }
    }
    async fn get(&self, url: &Url) -> Result<reqwest::Response> {
        let rsp = self
            .client
            .get(url.clone())
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;
        ensure!(
            rsp.status().is_success(),
            StatusSnafu {
                url: url.clone(),
                status: rsp.status()
            }
        );
        Ok(rsp)
    }
    async fn get_text(&self, url: &Url) -> Result<String> {
        self.get(url)
            .await?
            .text()
            .await
            .context(BodySnafu { url: url.clone() })
    }
    async fn get_json(&self, url: &Url) -> Result<DidDocument> {
        self.get(url)
            .await?
            .json()
            .await
            .context(BodySnafu { url: url.clone() })
    }
}

fn handle_url(handle: &Handle) -> Result<Url> {
    Url::parse(&format!("https://{}/.well-known/atproto-did", handle)).context(UrlSnafu)
}
