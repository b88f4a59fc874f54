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

//! Application state available to all handlers

use crate::{
    coordinator::Coordinator, http::TrustedProxies, identity::KeyStore, metrics::Instruments,
    rate_limit::RateLimits,
};

use std::sync::Arc;

pub struct Quorum {
    pub coordinator: Coordinator,
    pub keys: Arc<KeyStore>,
    pub limits: Arc<RateLimits>,
    pub trusted_proxies: TrustedProxies,
    pub instruments: Arc<Instruments>,
}
