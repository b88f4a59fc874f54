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

//! # Proof-of-possession
//!
//! The PDS (and the authorization server that issues its tokens) want every request to carry two
//! correlated pieces of evidence: an access token bound to the thumbprint of a per-session
//! signing key, and a fresh, single-use JWT signed by that same key over the request method,
//! URL, a hash of the token, any server-supplied nonce, and the time. This module holds that
//! key ([DpopKey]) & mints the proofs.
//!
//! The key is an ES256 (P-256) key. It's persisted alongside the session as a private JSON web
//! key; [DpopKey]'s [Debug] implementation shows only the thumbprint, so it may be logged freely.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand::rngs::OsRng;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{prelude::*, Backtrace};
use url::Url;
use uuid::Uuid;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad base64 in the signing key's {field}: {source}"))]
    Base64 {
        field: &'static str,
        source: base64::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse the signing key: {source}"))]
    JwkDe {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Expected an EC P-256 key; got kty={kty}, crv={crv}"))]
    JwkKind {
        kty: String,
        crv: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The signing key isn't a valid P-256 scalar"))]
    Scalar {
        source: p256::ecdsa::signature::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a proof component: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           JSON Web Keys                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The public half of a [DpopKey], as a JSON web key
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

#[derive(Deserialize, Serialize)]
struct PrivateJwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
    d: String,
}

#[derive(Serialize)]
struct Header<'a> {
    typ: &'static str,
    alg: &'static str,
    jwk: &'a Jwk,
}

/// The claims carried by a proof
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Claims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// `base64url(SHA-256(access token))`: the `ath` claim
pub fn access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            DpopKey                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A per-session ES256 signing key
#[derive(Clone)]
pub struct DpopKey {
    key: SigningKey,
}

impl std::fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopKey")
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

impl DpopKey {
    pub fn generate() -> DpopKey {
        DpopKey {
            key: SigningKey::random(&mut OsRng),
        }
    }
    pub fn public_jwk(&self) -> Jwk {
        let point = self.key.verifying_key().to_encoded_point(false);
        // An uncompressed point always carries both coordinates
        Jwk {
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            x: URL_SAFE_NO_PAD.encode(point.x().map(|x| x.as_slice()).unwrap_or_default()),
            y: URL_SAFE_NO_PAD.encode(point.y().map(|y| y.as_slice()).unwrap_or_default()),
        }
    }
    /// The RFC 7638 JWK thumbprint: SHA-256 over the required members, in lexicographic order,
    /// with no whitespace
    pub fn thumbprint(&self) -> String {
        let jwk = self.public_jwk();
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            jwk.crv, jwk.kty, jwk.x, jwk.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
    /// Export the private key as a JSON web key, for persistence
    pub fn to_jwk(&self) -> Result<SecretString> {
        let public = self.public_jwk();
        let private = PrivateJwk {
            kty: public.kty,
            crv: public.crv,
            x: public.x,
            y: public.y,
            d: URL_SAFE_NO_PAD.encode(self.key.to_bytes()),
        };
        Ok(SecretString::from(
            serde_json::to_string(&private).context(SerSnafu)?,
        ))
    }
    pub fn from_jwk(text: &str) -> Result<DpopKey> {
        let jwk: PrivateJwk = serde_json::from_str(text).context(JwkDeSnafu)?;
        ensure!(
            jwk.kty == "EC" && jwk.crv == "P-256",
            JwkKindSnafu {
                kty: jwk.kty,
                crv: jwk.crv
            }
        );
        let d = URL_SAFE_NO_PAD
            .decode(jwk.d.as_bytes())
            .context(Base64Snafu { field: "d" })?;
        Ok(DpopKey {
            key: SigningKey::from_slice(&d).context(ScalarSnafu)?,
        })
    }
    /// Mint a proof for a single request.
    ///
    /// `url` is reduced to scheme, authority & path for the `htu` claim. Supply the access token
    /// when the request carries one (everything save the token endpoint), and the most recent
    /// nonce the server has handed us, if any.
    pub fn proof(
        &self,
        method: &str,
        url: &Url,
        access_token: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<String> {
        let mut htu = url.clone();
        htu.set_query(None);
        htu.set_fragment(None);
        let claims = Claims {
            jti: Uuid::new_v4().to_string(),
            htm: method.to_ascii_uppercase(),
            htu: htu.to_string(),
            iat: Utc::now().timestamp(),
            ath: access_token.map(access_token_hash),
            nonce: nonce.map(|n| n.to_owned()),
        };
        let jwk = self.public_jwk();
        let header = Header {
            typ: "dpop+jwt",
            alg: "ES256",
            jwk: &jwk,
        };
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).context(SerSnafu)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).context(SerSnafu)?)
        );
        let signature: Signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}
