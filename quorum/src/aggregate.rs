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

//! Results aggregation.

use serde::{Deserialize, Serialize};

use crate::entities::{Answer, Answers, QuestionKind, SurveyDefinition};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionTally {
    pub option_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTally {
    pub question_id: String,
    /// One entry per option, in definition order; empty for text questions
    pub option_counts: Vec<OptionTally>,
    pub text_response_count: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub total_votes: u64,
    pub question_results: Vec<QuestionTally>,
}

/// Count the votes in `responses` against `definition`.
///
/// Options are reported in definition order, zeros included. Selections naming options the
/// definition no longer has (the author may have edited the survey since) are ignored, as are
/// answers to questions that no longer exist.
pub fn tally<'a, I>(definition: &SurveyDefinition, responses: I) -> Tally
where
    I: IntoIterator<Item = &'a Answers>,
{
    let mut results: Vec<QuestionTally> = definition
        .questions
        .iter()
        .map(|q| QuestionTally {
            question_id: q.id.clone(),
            option_counts: q
                .options
                .iter()
                .map(|o| OptionTally {
                    option_id: o.id.clone(),
                    count: 0,
                })
                .collect(),
            text_response_count: 0,
        })
        .collect();

    let mut total_votes = 0;
    for answers in responses {
        total_votes += 1;
        for (question, result) in definition.questions.iter().zip(results.iter_mut()) {
            match (question.kind, answers.get(&question.id)) {
                (QuestionKind::Text, Some(Answer::Text(text))) if !text.is_empty() => {
                    result.text_response_count += 1;
                }
                (QuestionKind::Single | QuestionKind::Multi, Some(Answer::Selected(selected))) => {
                    for option in selected {
                        if let Some(count) = result
                            .option_counts
                            .iter_mut()
                            .find(|c| &c.option_id == option)
                        {
                            count.count += 1;
                        }
                    }
                }
                _ => (),
            }
        }
    }

    Tally {
        total_votes,
        question_results: results,
    }
}
