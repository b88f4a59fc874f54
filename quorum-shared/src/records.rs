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

//! Wire schemas for the three record collections.
//!
//! These are the shapes that live in users' repositories & that arrive over the firehose. They
//! are deliberately "dumb": strings stay strings, and no bounds are enforced here. Turning one of
//! these into something the rest of the system can trust is the codec's job. The one thing we
//! *do* insist on at this level is that the top-level object carry no fields we don't know about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SURVEY_NSID: &str = "com.quorum.survey";
pub const RESPONSE_NSID: &str = "com.quorum.survey.response";
pub const RESULTS_NSID: &str = "com.quorum.survey.results";

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Single,
    Multi,
    Text,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OptionRecord {
    pub id: String,
    pub text: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QuestionRecord {
    pub id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: QuestionType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<OptionRecord>>,
}

/// A survey definition, as published to `com.quorum.survey`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SurveyRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    pub name: String,
    pub questions: Vec<QuestionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// A `(uri, cid)` pair naming one specific version of some other record
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AnswerRecord {
    #[serde(rename = "questionId")]
    pub question_id: String,
    #[serde(
        rename = "selectedOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub selected_options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One actor's vote, as published to `com.quorum.survey.response`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    pub subject: StrongRef,
    pub answers: Vec<AnswerRecord>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OptionCountRecord {
    #[serde(rename = "optionId")]
    pub option_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QuestionResultRecord {
    #[serde(rename = "questionId")]
    pub question_id: String,
    #[serde(rename = "optionCounts", default)]
    pub option_counts: Vec<OptionCountRecord>,
    #[serde(rename = "textResponseCount", default)]
    pub text_response_count: u64,
}

/// A finalized tally, as published to `com.quorum.survey.results`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResultsRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    pub subject: StrongRef,
    #[serde(rename = "totalVotes")]
    pub total_votes: u64,
    #[serde(rename = "questionResults")]
    pub question_results: Vec<QuestionResultRecord>,
    #[serde(rename = "finalizedAt")]
    pub finalized_at: DateTime<Utc>,
}
