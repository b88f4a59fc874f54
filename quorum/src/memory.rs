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

//! # memory
//!
//! An in-memory [Backend]. Transactions are serialized: [begin](Backend::begin) takes the one
//! lock & a copy of the tables, writes go to the copy, and [commit](Transaction::commit) swaps it
//! in. Uniqueness rules are checked by scanning, which is fine at the sizes for which this
//! back-end is intended (tests & single-node experiments).
//!
//! Never hold a transaction across an `await` on anything that may itself need to begin one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, Snafu};
use tokio::sync::{Mutex, OwnedMutexGuard};

use quorum_shared::{RecordUri, ResponseId, SessionId, Slug, SurveyId};

use crate::{
    entities::{Response, Survey, Voter},
    identity::{self, OAuthRequest, OAuthSession},
    storage::{self, Backend, Constraint, Result, Transaction},
};

use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("No survey with id {id}"))]
    NoSuchSurvey { id: SurveyId, backtrace: Backtrace },
    #[snafu(display("No response with id {id}"))]
    NoSuchResponse { id: ResponseId, backtrace: Backtrace },
    #[snafu(display("Duplicate primary key {id}"))]
    DuplicateKey { id: String, backtrace: Backtrace },
}

#[derive(Clone, Debug, Default)]
struct Tables {
    surveys: HashMap<SurveyId, Survey>,
    responses: HashMap<ResponseId, Response>,
    cursor: i64,
}

#[derive(Default)]
struct Sessions {
    requests: HashMap<String, OAuthRequest>,
    sessions: HashMap<SessionId, OAuthSession>,
}

#[derive(Clone, Default)]
pub struct Memory {
    tables: Arc<Mutex<Tables>>,
    sessions: Arc<std::sync::Mutex<Sessions>>,
}

impl Memory {
    /// Snapshot of every survey (in no particular order)
    pub async fn surveys(&self) -> Vec<Survey> {
        self.tables.lock().await.surveys.values().cloned().collect()
    }
    /// Snapshot of every response (in no particular order)
    pub async fn responses(&self) -> Vec<Response> {
        self.tables.lock().await.responses.values().cloned().collect()
    }
}

#[async_trait]
impl Backend for Memory {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

impl MemoryTransaction {
    fn check_survey_unique(&self, survey: &Survey) -> Result<()> {
        for other in self.working.surveys.values().filter(|s| s.id != survey.id) {
            if other.slug == survey.slug {
                return Err(storage::Error::unique(Constraint::Slug));
            }
            if survey.uri.is_some() && other.uri == survey.uri {
                return Err(storage::Error::unique(Constraint::SurveyUri));
            }
            if survey.results_uri.is_some() && other.results_uri == survey.results_uri {
                return Err(storage::Error::unique(Constraint::ResultsUri));
            }
        }
        Ok(())
    }
    fn check_response_unique(&self, response: &Response) -> Result<()> {
        for other in self
            .working
            .responses
            .values()
            .filter(|r| r.id != response.id)
        {
            if response.uri.is_some() && other.uri == response.uri {
                return Err(storage::Error::unique(Constraint::ResponseUri));
            }
            if other.survey_id == response.survey_id && other.voter == response.voter {
                return Err(storage::Error::unique(match response.voter {
                    Voter::Actor(_) => Constraint::ResponseActor,
                    Voter::Guest(_) => Constraint::ResponseSession,
                }));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn survey_by_id(&mut self, id: &SurveyId) -> Result<Option<Survey>> {
        Ok(self.working.surveys.get(id).cloned())
    }
    async fn survey_by_slug(&mut self, slug: &Slug) -> Result<Option<Survey>> {
        Ok(self
            .working
            .surveys
            .values()
            .find(|s| &s.slug == slug)
            .cloned())
    }
    async fn survey_by_uri(&mut self, uri: &RecordUri) -> Result<Option<Survey>> {
        Ok(self
            .working
            .surveys
            .values()
            .find(|s| s.uri.as_ref() == Some(uri))
            .cloned())
    }
    async fn survey_by_results_uri(&mut self, uri: &RecordUri) -> Result<Option<Survey>> {
        Ok(self
            .working
            .surveys
            .values()
            .find(|s| s.results_uri.as_ref() == Some(uri))
            .cloned())
    }
    async fn slug_exists(&mut self, slug: &Slug) -> Result<bool> {
        Ok(self.working.surveys.values().any(|s| &s.slug == slug))
    }
    async fn insert_survey(&mut self, survey: &Survey) -> Result<()> {
        if self.working.surveys.contains_key(&survey.id) {
            return Err(storage::Error::new(
                DuplicateKeySnafu {
                    id: survey.id.to_string(),
                }
                .build(),
            ));
        }
        self.check_survey_unique(survey)?;
        self.working.surveys.insert(survey.id, survey.clone());
        Ok(())
    }
    async fn update_survey(&mut self, survey: &Survey) -> Result<()> {
        let slug = match self.working.surveys.get(&survey.id) {
            Some(existing) => existing.slug.clone(),
            None => return Err(storage::Error::new(NoSuchSurveySnafu { id: survey.id }.build())),
        };
        let mut updated = survey.clone();
        updated.slug = slug;
        self.check_survey_unique(&updated)?;
        self.working.surveys.insert(updated.id, updated);
        Ok(())
    }
    async fn delete_survey(&mut self, id: &SurveyId) -> Result<bool> {
        let found = self.working.surveys.remove(id).is_some();
        if found {
            self.working.responses.retain(|_, r| &r.survey_id != id);
        }
        Ok(found)
    }

    async fn response_by_uri(&mut self, uri: &RecordUri) -> Result<Option<Response>> {
        Ok(self
            .working
            .responses
            .values()
            .find(|r| r.uri.as_ref() == Some(uri))
            .cloned())
    }
    async fn response_by_voter(
        &mut self,
        survey: &SurveyId,
        voter: &Voter,
    ) -> Result<Option<Response>> {
        Ok(self
            .working
            .responses
            .values()
            .find(|r| &r.survey_id == survey && &r.voter == voter)
            .cloned())
    }
    async fn responses_for_survey(&mut self, survey: &SurveyId) -> Result<Vec<Response>> {
        let mut responses: Vec<Response> = self
            .working
            .responses
            .values()
            .filter(|r| &r.survey_id == survey)
            .cloned()
            .collect();
        responses.sort_by_key(|r| r.created_at);
        Ok(responses)
    }
    async fn insert_response(&mut self, response: &Response) -> Result<()> {
        if !self.working.surveys.contains_key(&response.survey_id) {
            return Err(storage::Error::new(
                NoSuchSurveySnafu {
                    id: response.survey_id,
                }
                .build(),
            ));
        }
        if self.working.responses.contains_key(&response.id) {
            return Err(storage::Error::new(
                DuplicateKeySnafu {
                    id: response.id.to_string(),
                }
                .build(),
            ));
        }
        self.check_response_unique(response)?;
        self.working.responses.insert(response.id, response.clone());
        Ok(())
    }
    async fn update_response(&mut self, response: &Response) -> Result<()> {
        let existing = match self.working.responses.get(&response.id) {
            Some(existing) => existing.clone(),
            None => {
                return Err(storage::Error::new(
                    NoSuchResponseSnafu { id: response.id }.build(),
                ))
            }
        };
        let updated = Response {
            answers: response.answers.clone(),
            uri: response.uri.clone(),
            cid: response.cid.clone(),
            ..existing
        };
        self.check_response_unique(&updated)?;
        self.working.responses.insert(updated.id, updated);
        Ok(())
    }
    async fn delete_response(&mut self, id: &ResponseId) -> Result<bool> {
        Ok(self.working.responses.remove(id).is_some())
    }

    async fn cursor(&mut self) -> Result<i64> {
        Ok(self.working.cursor)
    }
    async fn set_cursor(&mut self, time_us: i64) -> Result<()> {
        self.working.cursor = self.working.cursor.max(time_us);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl identity::Store for Memory {
    async fn put_request(&self, request: &OAuthRequest) -> Result<()> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        guard.requests.insert(request.state.clone(), request.clone());
        Ok(())
    }
    async fn take_request(&self, state: &str) -> Result<Option<OAuthRequest>> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.requests.remove(state))
    }
    async fn save_session(&self, session: &OAuthSession) -> Result<()> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        guard.sessions.insert(session.id, session.clone());
        Ok(())
    }
    async fn get_session(&self, id: &SessionId) -> Result<Option<OAuthSession>> {
        let guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.sessions.get(id).cloned())
    }
    async fn delete_session(&self, id: &SessionId) -> Result<bool> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.sessions.remove(id).is_some())
    }
    async fn expire(&self, now: &DateTime<Utc>) -> Result<(usize, usize)> {
        let mut guard = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let (requests, sessions) = (guard.requests.len(), guard.sessions.len());
        guard.requests.retain(|_, r| r.expires_at > *now);
        guard.sessions.retain(|_, s| !s.is_expired(now));
        Ok((
            requests - guard.requests.len(),
            sessions - guard.sessions.len(),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::entities::{fixtures::color_survey, Answer, Answers, VoterSessionHash};
    use quorum_shared::{ActorId, Collection, Rkey};

    fn survey(slug: &str, uri: Option<RecordUri>) -> Survey {
        let now = Utc::now();
        Survey {
            id: SurveyId::default(),
            author: uri.as_ref().map(|u| u.actor().clone()),
            uri,
            cid: None,
            slug: Slug::new(slug).unwrap(),
            title: "Favorite color?".to_owned(),
            definition: color_survey(),
            created_at: now,
            updated_at: now,
            results_uri: None,
            results_cid: None,
        }
    }

    fn uri(actor: &str, rkey: &str) -> RecordUri {
        RecordUri::new(
            ActorId::new(actor).unwrap(),
            Collection::survey(),
            Rkey::new(rkey).unwrap(),
        )
    }

    fn vote(survey: &Survey, voter: Voter) -> Response {
        let mut answers = Answers::new();
        answers.insert("color".to_owned(), Answer::Selected(vec!["red".to_owned()]));
        Response {
            id: ResponseId::default(),
            survey_id: survey.id,
            voter,
            uri: None,
            cid: None,
            answers,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn rollback_discards() {
        let memory = Memory::default();
        let mut txn = memory.begin().await.unwrap();
        txn.insert_survey(&survey("favorite-color", None)).await.unwrap();
        txn.set_cursor(10).await.unwrap();
        txn.rollback().await.unwrap();
        assert!(memory.surveys().await.is_empty());
        assert_eq!(memory.cursor().await.unwrap(), 0);

        let mut txn = memory.begin().await.unwrap();
        txn.insert_survey(&survey("favorite-color", None)).await.unwrap();
        txn.set_cursor(10).await.unwrap();
        txn.set_cursor(5).await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(memory.surveys().await.len(), 1);
        assert_eq!(memory.cursor().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn uniqueness() {
        let memory = Memory::default();
        let mut txn = memory.begin().await.unwrap();
        let first = survey("favorite-color", Some(uri("did:plc:a", "3k2")));
        txn.insert_survey(&first).await.unwrap();
        assert_eq!(
            txn.insert_survey(&survey("favorite-color", None))
                .await
                .unwrap_err()
                .violated(),
            Some(Constraint::Slug)
        );
        assert_eq!(
            txn.insert_survey(&survey("other", Some(uri("did:plc:a", "3k2"))))
                .await
                .unwrap_err()
                .violated(),
            Some(Constraint::SurveyUri)
        );
        // Local-only surveys don't collide with one another
        txn.insert_survey(&survey("second", None)).await.unwrap();
        txn.insert_survey(&survey("third", None)).await.unwrap();

        let actor = Voter::Actor(ActorId::new("did:plc:b").unwrap());
        let guest = Voter::Guest(VoterSessionHash::new(
            &first.id,
            &"10.0.0.1".parse().unwrap(),
            "Mozilla",
        ));
        txn.insert_response(&vote(&first, actor.clone())).await.unwrap();
        txn.insert_response(&vote(&first, guest.clone())).await.unwrap();
        assert_eq!(
            txn.insert_response(&vote(&first, actor))
                .await
                .unwrap_err()
                .violated(),
            Some(Constraint::ResponseActor)
        );
        assert_eq!(
            txn.insert_response(&vote(&first, guest))
                .await
                .unwrap_err()
                .violated(),
            Some(Constraint::ResponseSession)
        );

        // Cascade
        assert!(txn.delete_survey(&first.id).await.unwrap());
        assert!(txn.responses_for_survey(&first.id).await.unwrap().is_empty());
        assert!(!txn.delete_survey(&first.id).await.unwrap());
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn slugs_are_immutable() {
        let memory = Memory::default();
        let mut txn = memory.begin().await.unwrap();
        let mut s = survey("favorite-color", None);
        txn.insert_survey(&s).await.unwrap();
        s.slug = Slug::new("something-else").unwrap();
        s.title = "Something else".to_owned();
        txn.update_survey(&s).await.unwrap();
        let stored = txn.survey_by_id(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.slug.as_ref(), "favorite-color");
        assert_eq!(stored.title, "Something else");
        txn.commit().await.unwrap();
    }
}
