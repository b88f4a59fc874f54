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

//! # Record codec
//!
//! Translation between the domain types in [entities](crate::entities) and the three record
//! schemas in [records](quorum_shared::records). Encoding is infallible save for the
//! strong-reference rule (a response or results record must pin a specific survey CID). Decoding
//! is where the outside world gets checked: the record must be under [MAX_RECORD_SIZE], carry the
//! right `$type`, have no unknown top-level fields, and satisfy the bounds of the domain model
//! once its free text has been [sanitized](crate::sanitize).

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use snafu::{prelude::*, Backtrace};

use quorum_shared::{
    records::{
        AnswerRecord, OptionCountRecord, OptionRecord, QuestionRecord, QuestionResultRecord,
        QuestionType, ResponseRecord, ResultsRecord, StrongRef, SurveyRecord, RESPONSE_NSID,
        RESULTS_NSID, SURVEY_NSID,
    },
    Cid, RecordUri,
};

use crate::{
    aggregate::{OptionTally, QuestionTally, Tally},
    entities::{
        self, validate_title, Answer, Answers, ChoiceOption, Question, QuestionKind,
        SurveyDefinition,
    },
    error::ErrorKind,
    sanitize::sanitize,
};

/// Records larger than this (serialized) are rejected outright
pub const MAX_RECORD_SIZE: usize = 100 * 1024;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Answer to question {question} must carry exactly one of selectedOptions or text"))]
    AnswerShape {
        question: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize a {nsid} record: {source}"))]
    De {
        nsid: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The {field} field is empty once sanitized"))]
    Empty { field: String, backtrace: Backtrace },
    #[snafu(display("{source}"))]
    Invalid { source: entities::Error },
    #[snafu(display("Survey {uri} has no known CID, so it can't be strongly referenced"))]
    NoSubjectCid { uri: RecordUri, backtrace: Backtrace },
    #[snafu(display("Expected a record of type {expected}, got {found:?}"))]
    RecordType {
        expected: &'static str,
        found: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Question {question} is answered more than once"))]
    RepeatedAnswer {
        question: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Results for question {question} appear more than once"))]
    RepeatedResult {
        question: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a {nsid} record: {source}"))]
    Ser {
        nsid: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad strong reference: {source}"))]
    Subject { source: quorum_shared::Error },
    #[snafu(display("The record is {size} bytes long; the limit is {}", MAX_RECORD_SIZE))]
    TooLarge { size: usize, backtrace: Backtrace },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AnswerShape { .. }
            | Error::De { .. }
            | Error::RecordType { .. }
            | Error::RepeatedAnswer { .. }
            | Error::RepeatedResult { .. }
            | Error::Subject { .. }
            | Error::TooLarge { .. } => ErrorKind::Malformed,
            Error::Empty { .. } | Error::Invalid { .. } | Error::NoSubjectCid { .. } => {
                ErrorKind::Validation
            }
            Error::Ser { .. } => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn check_size(record: &Value, nsid: &'static str) -> Result<()> {
    let size = serde_json::to_vec(record).context(SerSnafu { nsid })?.len();
    ensure!(size <= MAX_RECORD_SIZE, TooLargeSnafu { size });
    Ok(())
}

fn check_type(found: &str, expected: &'static str) -> Result<()> {
    ensure!(found == expected, RecordTypeSnafu { expected, found });
    Ok(())
}

/// Sanitize a required free-text field; fail if nothing's left
fn required_text(text: &str, field: impl FnOnce() -> String) -> Result<String> {
    let text = sanitize(text);
    ensure!(!text.is_empty(), EmptySnafu { field: field() });
    Ok(text)
}

fn strong_ref(uri: &RecordUri, cid: Option<&Cid>) -> Result<StrongRef> {
    let cid = cid.context(NoSubjectCidSnafu { uri: uri.clone() })?;
    Ok(StrongRef {
        uri: uri.to_string(),
        cid: cid.to_string(),
    })
}

fn parse_strong_ref(subject: &StrongRef) -> Result<(RecordUri, Cid)> {
    Ok((
        RecordUri::parse(&subject.uri).context(SubjectSnafu)?,
        Cid::new(&subject.cid).context(SubjectSnafu)?,
    ))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Surveys                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedSurvey {
    pub title: String,
    pub definition: SurveyDefinition,
    pub created_at: DateTime<Utc>,
}

/// Sanitize & validate a survey that arrived from somewhere other than a record (the edge API)
pub fn sanitize_survey(
    title: &str,
    definition: &SurveyDefinition,
) -> Result<(String, SurveyDefinition)> {
    let title = required_text(title, || "title".to_owned())?;
    validate_title(&title).context(InvalidSnafu)?;
    let questions = definition
        .questions
        .iter()
        .map(|q| {
            Ok(Question {
                id: q.id.clone(),
                text: required_text(&q.text, || format!("questions.{}.text", q.id))?,
                kind: q.kind,
                required: q.required,
                options: q
                    .options
                    .iter()
                    .map(|o| {
                        Ok(ChoiceOption {
                            id: o.id.clone(),
                            text: required_text(&o.text, || {
                                format!("questions.{}.options.{}.text", q.id, o.id)
                            })?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let definition = SurveyDefinition {
        questions,
        anonymous: definition.anonymous,
    };
    definition.validate().context(InvalidSnafu)?;
    Ok((title, definition))
}

pub fn encode_survey(definition: &SurveyDefinition, title: &str) -> Result<Value> {
    encode_survey_at(definition, title, Utc::now())
}

pub fn encode_survey_at(
    definition: &SurveyDefinition,
    title: &str,
    created_at: DateTime<Utc>,
) -> Result<Value> {
    let record = SurveyRecord {
        record_type: SURVEY_NSID.to_owned(),
        name: title.to_owned(),
        questions: definition
            .questions
            .iter()
            .map(|q| QuestionRecord {
                id: q.id.clone(),
                text: q.text.clone(),
                kind: match q.kind {
                    QuestionKind::Single => QuestionType::Single,
                    QuestionKind::Multi => QuestionType::Multi,
                    QuestionKind::Text => QuestionType::Text,
                },
                required: q.required,
                options: q.kind.is_choice().then(|| {
                    q.options
                        .iter()
                        .map(|o| OptionRecord {
                            id: o.id.clone(),
                            text: o.text.clone(),
                        })
                        .collect()
                }),
            })
            .collect(),
        anonymous: definition.anonymous.then_some(true),
        created_at,
    };
    serde_json::to_value(record).context(SerSnafu { nsid: SURVEY_NSID })
}

pub fn decode_survey(record: &Value) -> Result<DecodedSurvey> {
    check_size(record, SURVEY_NSID)?;
    let record = SurveyRecord::deserialize(record).context(DeSnafu { nsid: SURVEY_NSID })?;
    check_type(&record.record_type, SURVEY_NSID)?;
    let definition = SurveyDefinition {
        questions: record
            .questions
            .into_iter()
            .map(|q| Question {
                id: q.id,
                text: q.text,
                kind: match q.kind {
                    QuestionType::Single => QuestionKind::Single,
                    QuestionType::Multi => QuestionKind::Multi,
                    QuestionType::Text => QuestionKind::Text,
                },
                required: q.required,
                options: q
                    .options
                    .unwrap_or_default()
                    .into_iter()
                    .map(|o| ChoiceOption {
                        id: o.id,
                        text: o.text,
                    })
                    .collect(),
            })
            .collect(),
        anonymous: record.anonymous.unwrap_or(false),
    };
    let (title, definition) = sanitize_survey(&record.name, &definition)?;
    Ok(DecodedSurvey {
        title,
        definition,
        created_at: record.created_at,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Responses                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedResponse {
    pub subject: RecordUri,
    pub subject_cid: Cid,
    pub answers: Answers,
    pub created_at: DateTime<Utc>,
}

/// Sanitize text answers; a text answer with nothing left is treated as no answer at all (so that
/// a required question will fail validation)
pub fn sanitize_answers(answers: Answers) -> Answers {
    answers
        .into_iter()
        .filter_map(|(id, answer)| match answer {
            Answer::Text(text) => {
                let text = sanitize(&text);
                (!text.is_empty()).then_some((id, Answer::Text(text)))
            }
            selected => Some((id, selected)),
        })
        .collect()
}

pub fn encode_response(
    survey_uri: &RecordUri,
    survey_cid: Option<&Cid>,
    answers: &Answers,
) -> Result<Value> {
    encode_response_at(survey_uri, survey_cid, answers, Utc::now())
}

pub fn encode_response_at(
    survey_uri: &RecordUri,
    survey_cid: Option<&Cid>,
    answers: &Answers,
    created_at: DateTime<Utc>,
) -> Result<Value> {
    let record = ResponseRecord {
        record_type: RESPONSE_NSID.to_owned(),
        subject: strong_ref(survey_uri, survey_cid)?,
        answers: answers
            .iter()
            .map(|(id, answer)| match answer {
                Answer::Selected(options) => AnswerRecord {
                    question_id: id.clone(),
                    selected_options: Some(options.clone()),
                    text: None,
                },
                Answer::Text(text) => AnswerRecord {
                    question_id: id.clone(),
                    selected_options: None,
                    text: Some(text.clone()),
                },
            })
            .collect(),
        created_at,
    };
    serde_json::to_value(record).context(SerSnafu {
        nsid: RESPONSE_NSID,
    })
}

pub fn decode_response(record: &Value) -> Result<DecodedResponse> {
    check_size(record, RESPONSE_NSID)?;
    let record = ResponseRecord::deserialize(record).context(DeSnafu {
        nsid: RESPONSE_NSID,
    })?;
    check_type(&record.record_type, RESPONSE_NSID)?;
    let (subject, subject_cid) = parse_strong_ref(&record.subject)?;
    let mut answers = Answers::new();
    for answer in record.answers {
        let value = match (answer.selected_options, answer.text) {
            (Some(selected), None) => Answer::Selected(selected),
            (None, Some(text)) => Answer::Text(text),
            _ => {
                return AnswerShapeSnafu {
                    question: answer.question_id,
                }
                .fail()
            }
        };
        ensure!(
            !answers.contains_key(&answer.question_id),
            RepeatedAnswerSnafu {
                question: answer.question_id
            }
        );
        answers.insert(answer.question_id, value);
    }
    Ok(DecodedResponse {
        subject,
        subject_cid,
        answers: sanitize_answers(answers),
        created_at: record.created_at,
    })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Results                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedResults {
    pub subject: RecordUri,
    pub subject_cid: Cid,
    pub tally: Tally,
    pub finalized_at: DateTime<Utc>,
}

pub fn encode_results(
    survey_uri: &RecordUri,
    survey_cid: Option<&Cid>,
    tally: &Tally,
) -> Result<Value> {
    encode_results_at(survey_uri, survey_cid, tally, Utc::now())
}

pub fn encode_results_at(
    survey_uri: &RecordUri,
    survey_cid: Option<&Cid>,
    tally: &Tally,
    finalized_at: DateTime<Utc>,
) -> Result<Value> {
    let record = ResultsRecord {
        record_type: RESULTS_NSID.to_owned(),
        subject: strong_ref(survey_uri, survey_cid)?,
        total_votes: tally.total_votes,
        question_results: tally
            .question_results
            .iter()
            .map(|q| QuestionResultRecord {
                question_id: q.question_id.clone(),
                option_counts: q
                    .option_counts
                    .iter()
                    .map(|c| OptionCountRecord {
                        option_id: c.option_id.clone(),
                        count: c.count,
                    })
                    .collect(),
                text_response_count: q.text_response_count,
            })
            .collect(),
        finalized_at,
    };
    serde_json::to_value(record).context(SerSnafu { nsid: RESULTS_NSID })
}

pub fn decode_results(record: &Value) -> Result<DecodedResults> {
    check_size(record, RESULTS_NSID)?;
    let record = ResultsRecord::deserialize(record).context(DeSnafu { nsid: RESULTS_NSID })?;
    check_type(&record.record_type, RESULTS_NSID)?;
    let (subject, subject_cid) = parse_strong_ref(&record.subject)?;
    let mut question_results: Vec<QuestionTally> = Vec::with_capacity(record.question_results.len());
    for q in record.question_results {
        ensure!(
            !question_results
                .iter()
                .any(|r| r.question_id == q.question_id),
            RepeatedResultSnafu {
                question: q.question_id
            }
        );
        question_results.push(QuestionTally {
            question_id: q.question_id,
            option_counts: q
                .option_counts
                .into_iter()
                .map(|c| OptionTally {
                    option_id: c.option_id,
                    count: c.count,
                })
                .collect(),
            text_response_count: q.text_response_count,
        });
    }
    Ok(DecodedResults {
        subject,
        subject_cid,
        tally: Tally {
            total_votes: record.total_votes,
            question_results,
        },
        finalized_at: record.finalized_at,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;
    use serde_json::json;

    use crate::{aggregate::tally, entities::fixtures::color_survey};

    fn survey_uri() -> RecordUri {
        RecordUri::parse("at://did:plc:alice/com.quorum.survey/3kabcdefghijk").unwrap()
    }

    #[test]
    fn survey_round_trip() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let record = encode_survey_at(&color_survey(), "Favorite color?", at).unwrap();
        assert_eq!(record["$type"], SURVEY_NSID);
        assert_eq!(record["name"], "Favorite color?");
        assert_eq!(record["questions"][0]["type"], "single");
        assert!(record["questions"][1].get("options").is_none());
        // Only emitted when true
        assert!(record.get("anonymous").is_none());

        let decoded = decode_survey(&record).unwrap();
        assert_eq!(decoded.title, "Favorite color?");
        assert_eq!(decoded.definition, color_survey());
        assert_eq!(decoded.created_at, at);

        let mut def = color_survey();
        def.anonymous = true;
        let record = encode_survey(&def, "Anon").unwrap();
        assert_eq!(record["anonymous"], true);
        assert!(decode_survey(&record).unwrap().definition.anonymous);
    }

    #[test]
    fn survey_decode_rejections() {
        let good = encode_survey(&color_survey(), "Favorite color?").unwrap();

        let mut extra = good.clone();
        extra["colour"] = json!("mauve");
        assert_eq!(decode_survey(&extra).unwrap_err().kind(), ErrorKind::Malformed);

        let mut wrong_type = good.clone();
        wrong_type["$type"] = json!(RESPONSE_NSID);
        assert!(matches!(
            decode_survey(&wrong_type),
            Err(Error::RecordType { .. })
        ));

        let mut scripty = good.clone();
        scripty["name"] = json!("<script>alert('x')</script>");
        let err = decode_survey(&scripty).unwrap_err();
        assert!(matches!(err, Error::Empty { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut cleaned = good.clone();
        cleaned["questions"][0]["text"] = json!("  Pick <iframe></iframe>one\u{0} ");
        assert_eq!(
            decode_survey(&cleaned).unwrap().definition.questions[0].text,
            "Pick one"
        );

        let mut huge = good.clone();
        huge["questions"][1]["text"] = json!("x".repeat(MAX_RECORD_SIZE));
        let err = decode_survey(&huge).unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let mut one_option = good.clone();
        one_option["questions"][0]["options"] = json!([{"id": "red", "text": "red"}]);
        assert!(matches!(
            decode_survey(&one_option),
            Err(Error::Invalid {
                source: entities::Error::TooFewOptions { .. }
            })
        ));
    }

    #[test]
    fn response_round_trip() {
        let mut answers = Answers::new();
        answers.insert("color".to_owned(), Answer::Selected(vec!["blue".to_owned()]));
        answers.insert("why".to_owned(), Answer::Text("calm".to_owned()));
        let cid = Cid::new("bafyreicolor").unwrap();
        let record = encode_response(&survey_uri(), Some(&cid), &answers).unwrap();
        assert_eq!(record["subject"]["cid"], "bafyreicolor");
        assert_eq!(record["answers"][0]["questionId"], "color");
        assert!(record["answers"][0].get("text").is_none());

        let decoded = decode_response(&record).unwrap();
        assert_eq!(decoded.subject, survey_uri());
        assert_eq!(decoded.subject_cid, cid);
        assert_eq!(decoded.answers, answers);

        // The strong reference is mandatory
        assert!(matches!(
            encode_response(&survey_uri(), None, &answers),
            Err(Error::NoSubjectCid { .. })
        ));
    }

    #[test]
    fn response_decode_rejections() {
        let base = json!({
            "$type": RESPONSE_NSID,
            "subject": {"uri": survey_uri().to_string(), "cid": "bafyreicolor"},
            "answers": [{"questionId": "color", "selectedOptions": ["red"], "text": "both"}],
            "createdAt": "2025-03-01T12:00:00Z"
        });
        assert!(matches!(
            decode_response(&base),
            Err(Error::AnswerShape { .. })
        ));

        let mut repeated = base.clone();
        repeated["answers"] = json!([
            {"questionId": "color", "selectedOptions": ["red"]},
            {"questionId": "color", "selectedOptions": ["blue"]}
        ]);
        assert!(matches!(
            decode_response(&repeated),
            Err(Error::RepeatedAnswer { .. })
        ));

        let mut bad_subject = base.clone();
        bad_subject["answers"] = json!([]);
        bad_subject["subject"]["uri"] = json!("https://example.com/survey");
        assert_eq!(
            decode_response(&bad_subject).unwrap_err().kind(),
            ErrorKind::Malformed
        );

        // Text that sanitizes to nothing reads as unanswered
        let mut blank = base.clone();
        blank["answers"] = json!([
            {"questionId": "color", "selectedOptions": ["red"]},
            {"questionId": "why", "text": "<script>x</script>"}
        ]);
        let decoded = decode_response(&blank).unwrap();
        assert_eq!(decoded.answers.len(), 1);
        assert!(!decoded.answers.contains_key("why"));
    }

    #[test]
    fn results_round_trip() {
        let mut answers = Answers::new();
        answers.insert("color".to_owned(), Answer::Selected(vec!["red".to_owned()]));
        let t = tally(&color_survey(), [answers].iter());
        let cid = Cid::new("bafyreicolor").unwrap();
        let record = encode_results(&survey_uri(), Some(&cid), &t).unwrap();
        assert_eq!(record["totalVotes"], 1);
        assert_eq!(record["questionResults"][0]["optionCounts"][0]["optionId"], "red");
        assert_eq!(record["questionResults"][0]["optionCounts"][0]["count"], 1);
        let decoded = decode_results(&record).unwrap();
        assert_eq!(decoded.tally, t);
        assert_eq!(decoded.subject, survey_uri());
    }
}
