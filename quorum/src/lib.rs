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

//! # quorum
//!
//! A survey & polling service that federates over a decentralized personal-data-server network.
//! Survey definitions, votes & finalized results are published as records into their authors'
//! own repositories; every instance of the service watches the network firehose and folds those
//! records into a local, queryable index.
//!
//! The major pieces:
//!
//! - [codec] translates between wire records and validated domain values
//! - [identity], [dpop] & [oauth] hold per-user sessions & mint the proofs the PDS demands
//! - [pds] writes records into a user's repository
//! - [firehose] & [processor] consume the network event stream into the local index
//! - [storage] (with its [memory] & [postgres] implementations) is that local index
//! - [coordinator] handles locally-originated writes: PDS first, then the index

pub mod aggregate;
pub mod api;
pub mod client;
pub mod codec;
pub mod coordinator;
pub mod dpop;
pub mod entities;
pub mod error;
pub mod firehose;
pub mod http;
pub mod identity;
pub mod memory;
pub mod metrics;
pub mod oauth;
pub mod pds;
pub mod postgres;
#[path = "commit-processor.rs"]
pub mod processor;
pub mod quorum;
#[path = "rate-limit.rs"]
pub mod rate_limit;
#[path = "actor-resolver.rs"]
pub mod resolver;
pub mod sanitize;
pub mod storage;
pub use error::ErrorKind;
