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

//! Identifiers shared by every quorum crate.
//!
//! Everything here is a refinement of some native type: an [ActorId] is a [String] that is known
//! to be a decentralized identifier, a [RecordUri] is a parsed `at://` URI, and so forth. The
//! constructors are the only way in, so if you're holding one of these, it's legit.

pub mod backoff;
pub mod records;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{prelude::*, Backtrace};
use uuid::Uuid;

use std::{fmt::Display, ops::Deref, str::FromStr, sync::Mutex};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid actor identifier"))]
    ActorId { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid content identifier"))]
    Cid { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid collection name"))]
    Collection { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid handle"))]
    Handle { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid record URI: {reason}"))]
    RecordUri {
        text: String,
        reason: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a valid record key"))]
    Rkey { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid slug"))]
    Slug { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[macro_export]
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new(s: &str) -> StdResult<$type_name, uuid::Error> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                $type_name(Uuid::new_v4())
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl FromStr for $type_name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $type_name::new(s)
            }
        }
        impl Deref for $type_name {
            type Target = Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl From<$type_name> for Uuid {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
    };
}

define_id!(SurveyId);
define_id!(ResponseId);
define_id!(SessionId);

// Each of the refined string types below needs the same handful of trait implementations; this
// macro stamps them out. `$type_name::new(&str) -> Result<$type_name>` must be defined by hand.
macro_rules! refined_string {
    ($type_name:ident) => {
        impl AsRef<str> for $type_name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
        impl Deref for $type_name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl From<$type_name> for String {
            fn from(value: $type_name) -> Self {
                value.0
            }
        }
        impl FromStr for $type_name {
            type Err = Error;

            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                $type_name::new(s)
            }
        }
        impl<'de> Deserialize<'de> for $type_name {
            fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                $type_name::new(&s).map_err(mk_serde_de_err::<'de, D>)
            }
        }
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            ActorId                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref DID: Regex =
        Regex::new("^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap(/* known good */);
}

/// A decentralized identifier (`did:plc:...`, `did:web:...`) naming an account on the network
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(text: &str) -> Result<ActorId> {
        (text.len() <= 2048 && DID.is_match(text))
            .then(|| ActorId(text.to_owned()))
            .context(ActorIdSnafu { text })
    }
    /// The DID method; "plc" for `did:plc:abc`
    pub fn method(&self) -> &str {
        // Safe: the regex guarantees two colons
        self.0.split(':').nth(1).unwrap_or_default()
    }
    /// Everything following the method
    pub fn method_specific_id(&self) -> &str {
        self.0
            .splitn(3, ':')
            .nth(2)
            .unwrap_or_default()
    }
}

refined_string!(ActorId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Handle                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref HANDLE: Regex = Regex::new(
        "^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$"
    )
    .unwrap(/* known good */);
}

/// A DNS-style account handle, like "alice.example.com"
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(text: &str) -> Result<Handle> {
        let text = text.strip_prefix('@').unwrap_or(text);
        (text.len() <= 253 && HANDLE.is_match(text))
            .then(|| Handle(text.to_ascii_lowercase()))
            .context(HandleSnafu { text })
    }
}

refined_string!(Handle);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Collection                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref NSID: Regex =
        Regex::new("^[a-zA-Z]([a-zA-Z0-9-]{0,62})?(\\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,62})?)+$")
            .unwrap(/* known good */);
}

/// A namespaced collection name (e.g. "com.quorum.survey")
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Collection(String);

impl Collection {
    pub fn new(text: &str) -> Result<Collection> {
        (text.len() <= 317 && text.matches('.').count() >= 2 && NSID.is_match(text))
            .then(|| Collection(text.to_owned()))
            .context(CollectionSnafu { text })
    }
    pub fn survey() -> Collection {
        Collection(records::SURVEY_NSID.to_owned())
    }
    pub fn response() -> Collection {
        Collection(records::RESPONSE_NSID.to_owned())
    }
    pub fn results() -> Collection {
        Collection(records::RESULTS_NSID.to_owned())
    }
}

refined_string!(Collection);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Rkey                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref RKEY: Regex = Regex::new("^[a-zA-Z0-9._:~-]{1,512}$").unwrap(/* known good */);
}

/// A record key: the last component of a [RecordUri]
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Rkey(String);

impl Rkey {
    pub fn new(text: &str) -> Result<Rkey> {
        (text != "." && text != ".." && RKEY.is_match(text))
            .then(|| Rkey(text.to_owned()))
            .context(RkeySnafu { text })
    }
}

refined_string!(Rkey);

const TID_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

lazy_static! {
    static ref LAST_TID: Mutex<u64> = Mutex::new(0);
    // Ten bits of "clock identifier", chosen once per process
    static ref CLOCK_ID: u64 = {
        let bytes = Uuid::new_v4().into_bytes();
        u64::from(u16::from_be_bytes([bytes[0], bytes[1]]) & 0x3ff)
    };
}

/// Mint a fresh timestamp identifier.
///
/// A TID is a 64-bit integer (microseconds since the epoch in the high 53 bits, a clock identifier
/// in the low ten) rendered as thirteen characters of sortable base32. Successive calls within a
/// process are strictly increasing, even if the system clock steps backwards.
pub fn next_tid() -> Rkey {
    let micros = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default();
    let mut value = ((micros << 10) | *CLOCK_ID) & 0x7fff_ffff_ffff_ffff;
    {
        let mut last = LAST_TID.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if value <= *last {
            value = *last + 1;
        }
        *last = value;
    }
    let mut chars = [0u8; 13];
    for c in chars.iter_mut().rev() {
        *c = TID_ALPHABET[(value & 0x1f) as usize];
        value >>= 5;
    }
    // The alphabet is ASCII
    Rkey(chars.iter().map(|b| *b as char).collect())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Cid                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref CID: Regex = Regex::new("^[a-zA-Z0-9]{1,256}$").unwrap(/* known good */);
}

/// A content identifier naming one specific version of a record. We never compute these; we
/// only carry them around, so the only check is that the text is plausibly multibase.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(text: &str) -> Result<Cid> {
        CID.is_match(text)
            .then(|| Cid(text.to_owned()))
            .context(CidSnafu { text })
    }
}

refined_string!(Cid);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           RecordUri                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fully-qualified `at://<actor>/<collection>/<rkey>` record URI
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RecordUri {
    actor: ActorId,
    collection: Collection,
    rkey: Rkey,
}

impl RecordUri {
    pub fn new(actor: ActorId, collection: Collection, rkey: Rkey) -> RecordUri {
        RecordUri {
            actor,
            collection,
            rkey,
        }
    }
    pub fn parse(text: &str) -> Result<RecordUri> {
        let rest = text.strip_prefix("at://").context(RecordUriSnafu {
            text,
            reason: "missing the at:// scheme",
        })?;
        let mut parts = rest.split('/');
        let (Some(actor), Some(collection), Some(rkey), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return RecordUriSnafu {
                text,
                reason: "expected exactly three path components",
            }
            .fail();
        };
        let actor = ActorId::new(actor).map_err(|err| {
            RecordUriSnafu {
                text,
                reason: err.to_string(),
            }
            .build()
        })?;
        let collection = Collection::new(collection).map_err(|err| {
            RecordUriSnafu {
                text,
                reason: err.to_string(),
            }
            .build()
        })?;
        let rkey = Rkey::new(rkey).map_err(|err| {
            RecordUriSnafu {
                text,
                reason: err.to_string(),
            }
            .build()
        })?;
        Ok(RecordUri::new(actor, collection, rkey))
    }
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }
    pub fn collection(&self) -> &Collection {
        &self.collection
    }
    pub fn rkey(&self) -> &Rkey {
        &self.rkey
    }
}

impl Display for RecordUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "at://{}/{}/{}", self.actor, self.collection, self.rkey)
    }
}

impl FromStr for RecordUri {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        RecordUri::parse(s)
    }
}

impl Serialize for RecordUri {
    fn serialize<S>(&self, serializer: S) -> StdResult<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordUri {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        RecordUri::parse(&s).map_err(mk_serde_de_err::<'de, D>)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Slug                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub const MAX_SLUG_LENGTH: usize = 50;
pub const MIN_SLUG_LENGTH: usize = 3;

lazy_static! {
    static ref SLUG: Regex = Regex::new("^[a-z0-9]+(-[a-z0-9]+)*$").unwrap(/* known good */);
    static ref NOT_SLUG: Regex = Regex::new("[^a-z0-9]+").unwrap(/* known good */);
}

/// The short, URL-safe, locally-unique name of a survey
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    pub fn new(text: &str) -> Result<Slug> {
        ((MIN_SLUG_LENGTH..=MAX_SLUG_LENGTH).contains(&text.len()) && SLUG.is_match(text))
            .then(|| Slug(text.to_owned()))
            .context(SlugSnafu { text })
    }
    /// Derive a candidate slug from a survey title: lowercase, collapse every run of anything
    /// that isn't an ASCII letter or digit to a single hyphen, trim, and truncate. Titles that
    /// leave too little behind get a synthetic slug instead.
    pub fn from_title(title: &str) -> Slug {
        let lowered = title.to_lowercase();
        let hyphenated = NOT_SLUG.replace_all(&lowered, "-");
        let mut slug = hyphenated.trim_matches('-').to_owned();
        if slug.len() > MAX_SLUG_LENGTH {
            slug.truncate(MAX_SLUG_LENGTH); // ASCII, so any index is a char boundary
            slug = slug.trim_end_matches('-').to_owned();
        }
        if slug.len() < MIN_SLUG_LENGTH {
            slug = format!("survey-{}", &Uuid::new_v4().simple().to_string()[..8]);
        }
        Slug(slug)
    }
    /// The `n`th disambiguated form of this slug ("favorite-color-2"), truncating the base so the
    /// result still fits.
    pub fn with_suffix(&self, n: u32) -> Slug {
        let suffix = format!("-{}", n);
        let mut base = self.0.clone();
        if base.len() + suffix.len() > MAX_SLUG_LENGTH {
            base.truncate(MAX_SLUG_LENGTH - suffix.len());
            base = base.trim_end_matches('-').to_owned();
        }
        Slug(base + &suffix)
    }
}

refined_string!(Slug);
