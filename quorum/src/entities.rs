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

//! # quorum entities
//!
//! The domain model: surveys, their definitions, and the responses cast against them. Values of
//! these types have passed validation; the codec is the only route from a wire record to here.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{prelude::*, Backtrace};

use quorum_shared::{ActorId, Cid, RecordUri, ResponseId, Slug, SurveyId};

use std::{collections::BTreeMap, net::IpAddr};

pub const MAX_QUESTIONS: usize = 50;
pub const MAX_QUESTION_TEXT: usize = 1000;
pub const MAX_OPTION_TEXT: usize = 500;
pub const MAX_OPTIONS: usize = 20;
pub const MIN_CHOICE_OPTIONS: usize = 2;
pub const MAX_TITLE_LENGTH: usize = 300;
pub const MAX_ANSWER_TEXT: usize = 5000;
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Survey {uri} names {author} as its author"))]
    AuthorMismatch {
        author: ActorId,
        uri: RecordUri,
        backtrace: Backtrace,
    },
    #[snafu(display("Question {question} answers with option {option} more than once"))]
    DuplicateSelection {
        question: String,
        option: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Option identifier {option} appears more than once in question {question}"))]
    DuplicateOption {
        question: String,
        option: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Question identifier {id} appears more than once"))]
    DuplicateQuestion { id: String, backtrace: Backtrace },
    #[snafu(display("The answer to question {id} is empty"))]
    EmptyAnswer { id: String, backtrace: Backtrace },
    #[snafu(display("Question {id} needs at least one option selected"))]
    EmptySelection { id: String, backtrace: Backtrace },
    #[snafu(display("The survey title may not be empty"))]
    EmptyTitle { backtrace: Backtrace },
    #[snafu(display("{text:?} is not a valid question or option identifier"))]
    Identifier { text: String, backtrace: Backtrace },
    #[snafu(display("Question {id} takes a {expected} answer"))]
    KindMismatch {
        id: String,
        expected: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Required question {id} was not answered"))]
    MissingAnswer { id: String, backtrace: Backtrace },
    #[snafu(display("A survey needs at least one question"))]
    NoQuestions { backtrace: Backtrace },
    #[snafu(display("Single-choice question {id} has {count} selections"))]
    NotSingle {
        id: String,
        count: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Option {option} of question {question} is {length} characters long; the limit is {}", MAX_OPTION_TEXT))]
    OptionText {
        question: String,
        option: String,
        length: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Question {id} is {length} characters long; the limit is {}", MAX_QUESTION_TEXT))]
    QuestionText {
        id: String,
        length: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a voter session hash"))]
    SessionHash { text: String, backtrace: Backtrace },
    #[snafu(display("The answer to question {id} is {length} characters long; the limit is {}", MAX_ANSWER_TEXT))]
    TextLength {
        id: String,
        length: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("The survey title is {length} characters long; the limit is {}", MAX_TITLE_LENGTH))]
    TitleLength { length: usize, backtrace: Backtrace },
    #[snafu(display("Choice question {id} has {count} options; at least {} are needed", MIN_CHOICE_OPTIONS))]
    TooFewOptions {
        id: String,
        count: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Question {id} has {count} options; at most {} are allowed", MAX_OPTIONS))]
    TooManyOptions {
        id: String,
        count: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("The survey has {count} questions; at most {} are allowed", MAX_QUESTIONS))]
    TooManyQuestions { count: usize, backtrace: Backtrace },
    #[snafu(display("Text question {id} may not carry options"))]
    UnexpectedOptions { id: String, backtrace: Backtrace },
    #[snafu(display("Question {question} has no option {option}"))]
    UnknownOption {
        question: String,
        option: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The survey has no question {id}"))]
    UnknownQuestion { id: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

fn check_identifier(text: &str) -> Result<()> {
    (!text.is_empty()
        && text.len() <= MAX_IDENTIFIER_LENGTH
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
    .then_some(())
    .context(IdentifierSnafu { text })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       SurveyDefinition                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Single,
    Multi,
    Text,
}

impl QuestionKind {
    pub fn is_choice(&self) -> bool {
        matches!(self, QuestionKind::Single | QuestionKind::Multi)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChoiceOption {
    pub id: String,
    pub text: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub kind: QuestionKind,
    pub required: bool,
    /// Empty for text questions
    #[serde(default)]
    pub options: Vec<ChoiceOption>,
}

impl Question {
    pub fn option(&self, id: &str) -> Option<&ChoiceOption> {
        self.options.iter().find(|o| o.id == id)
    }
    fn validate(&self) -> Result<()> {
        check_identifier(&self.id)?;
        let length = self.text.chars().count();
        ensure!(
            length <= MAX_QUESTION_TEXT,
            QuestionTextSnafu {
                id: &self.id,
                length
            }
        );
        if !self.kind.is_choice() {
            ensure!(
                self.options.is_empty(),
                UnexpectedOptionsSnafu { id: &self.id }
            );
            return Ok(());
        }
        let count = self.options.len();
        ensure!(
            count >= MIN_CHOICE_OPTIONS,
            TooFewOptionsSnafu { id: &self.id, count }
        );
        ensure!(
            count <= MAX_OPTIONS,
            TooManyOptionsSnafu { id: &self.id, count }
        );
        for option in &self.options {
            check_identifier(&option.id)?;
            let length = option.text.chars().count();
            ensure!(
                length <= MAX_OPTION_TEXT,
                OptionTextSnafu {
                    question: &self.id,
                    option: &option.id,
                    length
                }
            );
        }
        if let Some(dup) = self.options.iter().map(|o| &o.id).duplicates().next() {
            return DuplicateOptionSnafu {
                question: &self.id,
                option: dup,
            }
            .fail();
        }
        Ok(())
    }
}

/// An ordered list of [Question]s
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SurveyDefinition {
    pub questions: Vec<Question>,
    #[serde(default)]
    pub anonymous: bool,
}

impl SurveyDefinition {
    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }
    /// Check the bounds on question & option counts, text lengths & identifier uniqueness
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.questions.is_empty(), NoQuestionsSnafu);
        ensure!(
            self.questions.len() <= MAX_QUESTIONS,
            TooManyQuestionsSnafu {
                count: self.questions.len()
            }
        );
        self.questions.iter().try_for_each(Question::validate)?;
        if let Some(dup) = self.questions.iter().map(|q| &q.id).duplicates().next() {
            return DuplicateQuestionSnafu { id: dup }.fail();
        }
        Ok(())
    }
}

pub fn validate_title(title: &str) -> Result<()> {
    ensure!(!title.is_empty(), EmptyTitleSnafu);
    let length = title.chars().count();
    ensure!(length <= MAX_TITLE_LENGTH, TitleLengthSnafu { length });
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Answers                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Answer {
    /// Option identifiers, for single- & multi-choice questions
    Selected(Vec<String>),
    Text(String),
}

/// Question identifier to [Answer]
pub type Answers = BTreeMap<String, Answer>;

/// Check a set of answers against the survey they answer
pub fn validate_answers(definition: &SurveyDefinition, answers: &Answers) -> Result<()> {
    for (id, answer) in answers {
        let question = definition
            .question(id)
            .context(UnknownQuestionSnafu { id })?;
        match (question.kind, answer) {
            (QuestionKind::Text, Answer::Text(text)) => {
                ensure!(!text.is_empty(), EmptyAnswerSnafu { id });
                let length = text.chars().count();
                ensure!(length <= MAX_ANSWER_TEXT, TextLengthSnafu { id, length });
            }
            (QuestionKind::Text, Answer::Selected(_)) => {
                return KindMismatchSnafu {
                    id,
                    expected: "text",
                }
                .fail();
            }
            (_, Answer::Text(_)) => {
                return KindMismatchSnafu {
                    id,
                    expected: "choice",
                }
                .fail();
            }
            (kind, Answer::Selected(selected)) => {
                ensure!(!selected.is_empty(), EmptySelectionSnafu { id });
                if kind == QuestionKind::Single {
                    ensure!(
                        selected.len() == 1,
                        NotSingleSnafu {
                            id,
                            count: selected.len()
                        }
                    );
                }
                if let Some(option) = selected.iter().find(|o| question.option(o).is_none()) {
                    return UnknownOptionSnafu {
                        question: id,
                        option,
                    }
                    .fail();
                }
                if let Some(option) = selected.iter().duplicates().next() {
                    return DuplicateSelectionSnafu {
                        question: id,
                        option,
                    }
                    .fail();
                }
            }
        }
    }
    if let Some(q) = definition
        .questions
        .iter()
        .find(|q| q.required && !answers.contains_key(&q.id))
    {
        return MissingAnswerSnafu { id: &q.id }.fail();
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Survey                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
pub struct Survey {
    pub id: SurveyId,
    /// None means the survey is local-only
    pub uri: Option<RecordUri>,
    pub cid: Option<Cid>,
    pub author: Option<ActorId>,
    pub slug: Slug,
    pub title: String,
    pub definition: SurveyDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub results_uri: Option<RecordUri>,
    pub results_cid: Option<Cid>,
}

impl Survey {
    /// A local-only survey has never been published to a PDS, and so can't publish results
    pub fn is_local_only(&self) -> bool {
        self.uri.is_none()
    }
    /// True if `actor` wrote this survey
    pub fn is_authored_by(&self, actor: &ActorId) -> bool {
        self.author.as_ref() == Some(actor)
    }
    /// The author, when present, must be the repository holding the survey record
    pub fn check_author(&self) -> Result<()> {
        match (&self.author, &self.uri) {
            (Some(author), Some(uri)) if author != uri.actor() => AuthorMismatchSnafu {
                author: author.clone(),
                uri: uri.clone(),
            }
            .fail(),
            _ => Ok(()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Responses                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// `SHA-256(survey-id ':' client-ip ':' user-agent)` in lowercase hex; the identity of a guest voter
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct VoterSessionHash(String);

impl VoterSessionHash {
    pub fn new(survey: &SurveyId, client_ip: &IpAddr, user_agent: &str) -> VoterSessionHash {
        let digest = Sha256::digest(format!("{}:{}:{}", survey, client_ip, user_agent).as_bytes());
        VoterSessionHash(hex::encode(digest))
    }
    pub fn from_hex(text: &str) -> Result<VoterSessionHash> {
        (text.len() == 64
            && text
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)))
        .then(|| VoterSessionHash(text.to_owned()))
        .context(SessionHashSnafu { text })
    }
}

impl AsRef<str> for VoterSessionHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VoterSessionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who cast a [Response]; exactly one of the two
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Voter {
    Actor(ActorId),
    Guest(VoterSessionHash),
}

impl Voter {
    pub fn actor(&self) -> Option<&ActorId> {
        match self {
            Voter::Actor(actor) => Some(actor),
            Voter::Guest(_) => None,
        }
    }
    pub fn session_hash(&self) -> Option<&VoterSessionHash> {
        match self {
            Voter::Actor(_) => None,
            Voter::Guest(hash) => Some(hash),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: ResponseId,
    pub survey_id: SurveyId,
    pub voter: Voter,
    pub uri: Option<RecordUri>,
    pub cid: Option<Cid>,
    pub answers: Answers,
    pub created_at: DateTime<Utc>,
}
