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

//! The error taxonomy shared across modules.
//!
//! Each module has its own error type, but callers frequently need to answer the same few
//! questions regardless of where a failure originated: should this be retried? will re-delivering
//! the same input ever succeed? what do we tell an HTTP client? Every module error can classify
//! itself as one of these [ErrorKind]s.

use http::StatusCode;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The input couldn't be decoded at all
    Malformed,
    /// The input decoded, but violates a bound or a cross-field rule
    Validation,
    /// The actor isn't allowed to do this
    Unauthorized,
    /// A uniqueness rule would be violated, or a precondition (swap CID) failed
    Conflict,
    /// The record refers to something we don't know about
    Orphan,
    /// The network failed, or the remote returned a 5xx; worth retrying
    Transport,
    /// The access token has expired and must be refreshed
    AuthExpired,
    /// The proof-of-possession was rejected
    AuthProof,
    /// The remote is down
    Unavailable,
    /// Anything else; a bug, or a failure of local infrastructure
    Internal,
}

impl ErrorKind {
    /// True if re-delivering the same input can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorKind::Malformed
                | ErrorKind::Validation
                | ErrorKind::Unauthorized
                | ErrorKind::Conflict
                | ErrorKind::Orphan
        )
    }
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Malformed | ErrorKind::Validation | ErrorKind::Orphan => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::Unauthorized | ErrorKind::AuthExpired | ErrorKind::AuthProof => {
                StatusCode::UNAUTHORIZED
            }
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
    /// A label suitable for use as a metric attribute
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Malformed => "malformed",
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Orphan => "orphan",
            ErrorKind::Transport => "transport",
            ErrorKind::AuthExpired => "auth-expired",
            ErrorKind::AuthProof => "auth-proof",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
