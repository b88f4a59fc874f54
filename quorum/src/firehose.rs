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

//! # Firehose consumer
//!
//! A long-lived subscription to the network's relay, feeding every commit frame to the
//! [Processor]. The consumer moves through four states:
//!
//! ```text
//! Connecting --ok--> Streaming --error/close--> Backoff --> Connecting
//!      \                 |                         /
//!       +----------------+-------> Shutdown <-----+
//! ```
//!
//! On connect, it asks the relay to resume from the stored cursor (or to start at live-tail when
//! there is none). Since the cursor only moves inside the transaction that applied an event,
//! resumption replays at least once; the processor's idempotence makes that exactly-once on the
//! index. The backoff before reconnect attempt `n` is `min(cap, base * 2^n)`, and `n` is reset
//! by every frame received.
//!
//! The relay itself is abstracted behind [Relay]; [WebSocketRelay] is the production
//! implementation.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use opentelemetry::KeyValue;
use pin_project::pin_project;
use serde::Deserialize;
use serde_json::Value;
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, error, info, warn};
use url::Url;

use quorum_shared::{
    backoff::ExponentialBackoffParameters,
    records::{RESPONSE_NSID, RESULTS_NSID, SURVEY_NSID},
};

use crate::{
    counter_add,
    metrics::{self, Instruments, Sort},
    processor::{self, Commit, Operation, Processor},
};

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

inventory::submit! { metrics::Registration::new("firehose.frames", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("firehose.reconnects", Sort::IntegralCounter) }

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to connect to the relay: {source}"))]
    Connect {
        source: tungstenite::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The firehose consumer failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Processor { source: processor::Error },
    #[snafu(display("Failed to form a subscription request: {source}"))]
    Request {
        source: tungstenite::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Relay {name} exhausted its script"))]
    Script { name: String, backtrace: Backtrace },
    #[snafu(display("Timeout shutting-down the firehose consumer: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Error reading from the relay: {source}"))]
    Stream {
        source: tungstenite::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid user agent: {source}"))]
    UserAgent {
        source: tungstenite::http::header::InvalidHeaderValue,
        backtrace: Backtrace,
    },
    #[snafu(display("A binary frame was not UTF-8: {source}"))]
    Utf8 {
        source: std::string::FromUtf8Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Relay                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The text frames of one relay connection
pub type Frames = BoxStream<'static, Result<String>>;

/// Something from which we can stream firehose frames
#[async_trait]
pub trait Relay: Send + Sync {
    /// Open a new subscription, resuming just after `cursor` if given
    async fn connect(&self, cursor: Option<i64>) -> Result<Frames>;
}

/// A relay reached over a websocket, speaking the JSON event stream
pub struct WebSocketRelay {
    url: Url,
    collections: Vec<String>,
    user_agent: String,
}

impl WebSocketRelay {
    pub fn new(url: Url, collections: Vec<String>, user_agent: &str) -> WebSocketRelay {
        WebSocketRelay {
            url,
            collections,
            user_agent: user_agent.to_owned(),
        }
    }
    fn subscription_url(&self, cursor: Option<i64>) -> Url {
        let mut url = self.url.clone();
        if !self.collections.is_empty() || cursor.is_some() {
            let mut pairs = url.query_pairs_mut();
            self.collections.iter().for_each(|collection| {
                pairs.append_pair("wantedCollections", collection);
            });
            if let Some(cursor) = cursor {
                pairs.append_pair("cursor", &cursor.to_string());
            }
        }
        url
    }
}

#[async_trait]
impl Relay for WebSocketRelay {
    async fn connect(&self, cursor: Option<i64>) -> Result<Frames> {
        let url = self.subscription_url(cursor);
        let mut request = url.as_str().into_client_request().context(RequestSnafu)?;
        request.headers_mut().insert(
            tungstenite::http::header::USER_AGENT,
            HeaderValue::from_str(&self.user_agent).context(UserAgentSnafu)?,
        );
        let (stream, response) = connect_async(request).await.context(ConnectSnafu)?;
        info!("Subscribed to {} ({})", url, response.status());
        Ok(stream
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes).context(Utf8Snafu)),
                    // Control frames are handled by tungstenite
                    Ok(_) => None,
                    Err(err) => Some(Err(StreamSnafu.into_error(err))),
                }
            })
            .boxed())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             frames                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct Frame {
    did: String,
    time_us: i64,
    kind: String,
    commit: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    operation: Operation,
    collection: String,
    rkey: String,
    cid: Option<String>,
    record: Option<Value>,
}

/// The collections the processor understands; the default subscription filter
pub fn default_collections() -> Vec<String> {
    [SURVEY_NSID, RESPONSE_NSID, RESULTS_NSID]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Consumer                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Firehose configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub url: Url,
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: Url::parse("wss://jetstream2.us-east.bsky.network/subscribe").unwrap(/* known good */),
            collections: default_collections(),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            enabled: true,
        }
    }
}

pub struct Consumer<R: Relay> {
    relay: R,
    processor: Processor,
    backoff: ExponentialBackoffParameters,
    instruments: Arc<Instruments>,
}

impl<R: Relay + 'static> Consumer<R> {
    /// `base` & `cap` bound the reconnect delay
    pub fn new(
        relay: R,
        processor: Processor,
        base: Duration,
        cap: Duration,
        instruments: Arc<Instruments>,
    ) -> std::result::Result<Consumer<R>, quorum_shared::backoff::Error> {
        Ok(Consumer {
            relay,
            processor,
            backoff: ExponentialBackoffParameters::new(base, cap, 0.0, 1)?,
            instruments,
        })
    }
    /// Start consuming in a new task
    pub fn spawn(self) -> Handle {
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(shutdown.clone()));
        Handle { task, shutdown }
    }
    async fn run(self, shutdown: Arc<Notify>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            // Connecting
            let connection = tokio::select! {
                connection = self.connect() => connection,
                _ = shutdown.notified() => break,
            };
            match connection {
                Ok(mut frames) => {
                    // Streaming
                    loop {
                        let frame = tokio::select! {
                            biased;
                            _ = shutdown.notified() => {
                                info!("Firehose consumer shutting down");
                                return Ok(());
                            }
                            frame = frames.next() => frame,
                        };
                        match frame {
                            Some(Ok(text)) => {
                                attempt = 0;
                                // Not raced against `shutdown`; the frame's transaction runs to
                                // completion (or rolls back) before we look again.
                                if let Err(err) = self.handle(&text).await {
                                    error!(
                                        "Failed to apply a frame; reconnecting to replay it: {}",
                                        err
                                    );
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                warn!("{}", err);
                                break;
                            }
                            None => {
                                info!("The relay closed the connection");
                                break;
                            }
                        }
                    }
                }
                Err(err) => warn!("{}", err),
            }
            // Backoff
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            counter_add!(self.instruments, "firehose.reconnects", 1, &[]);
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = shutdown.notified() => break,
            }
        }
        info!("Firehose consumer shutting down");
        Ok(())
    }
    async fn connect(&self) -> Result<Frames> {
        let cursor = self.processor.cursor().await.context(ProcessorSnafu)?;
        info!("Connecting to the relay (cursor {})", cursor);
        self.relay.connect((cursor > 0).then_some(cursor)).await
    }
    /// Apply one frame. Only an error that replay could fix is returned.
    async fn handle(&self, text: &str) -> Result<()> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Discarding an undecodable frame: {}", err);
                counter_add!(
                    self.instruments,
                    "firehose.frames",
                    1,
                    &[KeyValue::new("kind", "undecodable")]
                );
                return Ok(());
            }
        };
        counter_add!(
            self.instruments,
            "firehose.frames",
            1,
            &[KeyValue::new("kind", frame.kind.clone())]
        );
        if frame.kind != "commit" {
            return Ok(());
        }
        let payload = frame
            .commit
            .map(serde_json::from_value::<CommitPayload>)
            .transpose();
        let commit = match payload {
            Ok(Some(payload)) => Commit {
                operation: payload.operation,
                collection: payload.collection,
                rkey: payload.rkey,
                repo: frame.did,
                cid: payload.cid,
                record: payload.record,
                time_us: frame.time_us,
            },
            Ok(None) | Err(_) => {
                warn!(
                    "Discarding a malformed commit frame from {} at {}",
                    frame.did, frame.time_us
                );
                return self.processor.skip(frame.time_us).await.context(ProcessorSnafu);
            }
        };
        self.processor
            .process(&commit)
            .await
            .map(|_| ())
            .context(ProcessorSnafu)
    }
}

/// A running [Consumer]; resolves when it exits
#[pin_project]
pub struct Handle {
    #[pin]
    task: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Handle {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.project().task.poll(cx)
    }
}

impl Handle {
    /// Signal the consumer to stop & wait up to `timeout` for it to do so
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.task)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.task, self.shutdown)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    use std::{collections::VecDeque, sync::Mutex};

    /// A relay that plays out a fixed series of connections, recording the cursor each was
    /// requested with. Once the script is exhausted, connects fail.
    pub struct ScriptedRelay {
        connections: Mutex<VecDeque<Vec<Result<String>>>>,
        pub cursors: Arc<Mutex<Vec<Option<i64>>>>,
    }

    impl ScriptedRelay {
        pub fn new(connections: Vec<Vec<Result<String>>>) -> ScriptedRelay {
            ScriptedRelay {
                connections: Mutex::new(connections.into()),
                cursors: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Relay for ScriptedRelay {
        async fn connect(&self, cursor: Option<i64>) -> Result<Frames> {
            self.cursors.lock().unwrap().push(cursor);
            let frames = self
                .connections
                .lock()
                .unwrap()
                .pop_front()
                .context(ScriptSnafu { name: "scripted" })?;
            Ok(futures::stream::iter(frames).boxed())
        }
    }

    pub fn frame(did: &str, time_us: i64, commit: Value) -> Result<String> {
        Ok(serde_json::json!({
            "did": did,
            "time_us": time_us,
            "kind": "commit",
            "commit": commit,
        })
        .to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use super::fixtures::*;
    use crate::{memory::Memory, processor::fixtures::survey_record, storage::Backend};

    use serde_json::json;

    use std::sync::Mutex;

    fn survey_commit(rkey: &str) -> Value {
        json!({
            "rev": "3l3qo2vuowo2b",
            "operation": "create",
            "collection": SURVEY_NSID,
            "rkey": rkey,
            "cid": "bafysurvey1",
            "record": survey_record("Favorite color?"),
        })
    }

    async fn wait_for_connects(relay: &Arc<Mutex<Vec<Option<i64>>>>, n: usize) {
        for _ in 0..500 {
            if relay.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("The consumer never connected {} times", n);
    }

    #[test]
    fn subscription_urls() {
        let relay = WebSocketRelay::new(
            Url::parse("wss://relay.example.com/subscribe").unwrap(),
            vec![SURVEY_NSID.to_owned(), RESPONSE_NSID.to_owned()],
            "quorum/0.1",
        );
        assert_eq!(
            relay.subscription_url(None).as_str(),
            "wss://relay.example.com/subscribe?wantedCollections=com.quorum.survey&wantedCollections=com.quorum.survey.response"
        );
        let relay = WebSocketRelay::new(
            Url::parse("wss://relay.example.com/subscribe").unwrap(),
            vec![],
            "quorum/0.1",
        );
        assert_eq!(
            relay.subscription_url(Some(1725911162329308)).as_str(),
            "wss://relay.example.com/subscribe?cursor=1725911162329308"
        );
        assert_eq!(
            relay.subscription_url(None).as_str(),
            "wss://relay.example.com/subscribe"
        );
    }

    #[tokio::test]
    async fn resumes_from_the_cursor() {
        let memory = Memory::default();
        let instruments = Arc::new(Instruments::new("quorum-test"));
        let relay = ScriptedRelay::new(vec![
            vec![
                frame("did:plc:alice", 10, survey_commit("3jzfcijpj2z2a")),
                Ok(json!({"did": "did:plc:alice", "time_us": 11, "kind": "identity"}).to_string()),
                Ok("not json".to_owned()),
            ],
            vec![frame("did:plc:bob", 20, survey_commit("3jzfcijpj2z2b"))],
        ]);
        let cursors = relay.cursors.clone();
        let consumer = Consumer::new(
            relay,
            Processor::new(Arc::new(memory.clone()), instruments.clone()),
            Duration::from_millis(1),
            Duration::from_millis(4),
            instruments,
        )
        .unwrap();
        let handle = consumer.spawn();
        wait_for_connects(&cursors, 3).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();

        let cursors = cursors.lock().unwrap().clone();
        // Live-tail, then resume after the only applied event (identity frames don't move the
        // cursor), then after the second connection's event.
        assert_eq!(&cursors[..3], &[None, Some(10), Some(20)]);
        assert_eq!(memory.surveys().await.len(), 2);
    }

    #[tokio::test]
    async fn malformed_commits_are_skipped() {
        let memory = Memory::default();
        let instruments = Arc::new(Instruments::new("quorum-test"));
        let relay = ScriptedRelay::new(vec![vec![
            frame(
                "did:plc:alice",
                30,
                json!({"operation": "transmogrify", "collection": SURVEY_NSID, "rkey": "x"}),
            ),
            Err(ScriptSnafu { name: "broken" }.build()),
        ]]);
        let cursors = relay.cursors.clone();
        let handle = Consumer::new(
            relay,
            Processor::new(Arc::new(memory.clone()), instruments.clone()),
            Duration::from_millis(1),
            Duration::from_millis(4),
            instruments,
        )
        .unwrap()
        .spawn();
        wait_for_connects(&cursors, 2).await;
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(memory.cursor().await.unwrap(), 30);
        assert_eq!(cursors.lock().unwrap()[1], Some(30));
    }
}
