//! Scripted collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_types::{Message, RawEvent};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{BridgeClient, BridgeConnector, EventStream, PromptOptions};
use crate::error::{Result, SyncError};

#[derive(Default)]
struct MockState {
    messages: HashMap<String, Vec<Message>>,
    slow_fetches: HashMap<String, (Duration, Vec<Message>)>,
    expired: HashSet<String>,
    fetch_failure: Option<String>,
    create_failure: Option<String>,
    subscribe_failure: Option<String>,
    send_failure: Option<String>,
    send_accepted: Option<bool>,
    response_failure: Option<String>,
    created: usize,
    fetches: Vec<(String, Instant)>,
    prompts: Vec<(String, String)>,
    question_responses: Vec<(String, String)>,
    plan_responses: Vec<(String, String, bool)>,
    subscribe_calls: usize,
    event_tx: Option<mpsc::UnboundedSender<Result<RawEvent>>>,
}

#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_messages(&self, session_id: &str, messages: Vec<Message>) {
        self.with_state(|s| {
            s.messages.insert(session_id.to_string(), messages);
        });
    }

    /// The next fetch of `session_id` waits `delay` and then returns
    /// `messages` instead of the current list.
    pub fn delay_next_fetch(&self, session_id: &str, delay: Duration, messages: Vec<Message>) {
        self.with_state(|s| {
            s.slow_fetches
                .insert(session_id.to_string(), (delay, messages));
        });
    }

    pub fn expire_session(&self, session_id: &str) {
        self.with_state(|s| {
            s.expired.insert(session_id.to_string());
        });
    }

    pub fn fail_fetches(&self, reason: &str) {
        self.with_state(|s| s.fetch_failure = Some(reason.to_string()));
    }

    pub fn fail_create(&self, reason: &str) {
        self.with_state(|s| s.create_failure = Some(reason.to_string()));
    }

    pub fn fail_subscribe(&self, reason: Option<&str>) {
        self.with_state(|s| s.subscribe_failure = reason.map(str::to_string));
    }

    pub fn fail_send(&self, reason: &str) {
        self.with_state(|s| s.send_failure = Some(reason.to_string()));
    }

    pub fn reject_send(&self) {
        self.with_state(|s| s.send_accepted = Some(false));
    }

    pub fn fail_responses(&self, reason: &str) {
        self.with_state(|s| s.response_failure = Some(reason.to_string()));
    }

    pub fn push_event(&self, event: RawEvent) {
        self.with_state(|s| {
            if let Some(tx) = &s.event_tx {
                let _ = tx.send(Ok(event));
            }
        });
    }

    pub fn push_stream_error(&self, reason: &str) {
        self.with_state(|s| {
            if let Some(tx) = &s.event_tx {
                let _ = tx.send(Err(SyncError::Transport(reason.to_string())));
            }
        });
    }

    pub fn end_stream(&self) {
        self.with_state(|s| s.event_tx = None);
    }

    pub fn fetch_count(&self, session_id: &str) -> usize {
        self.with_state(|s| s.fetches.iter().filter(|(id, _)| id == session_id).count())
    }

    pub fn fetch_times(&self, session_id: &str) -> Vec<Instant> {
        self.with_state(|s| {
            s.fetches
                .iter()
                .filter(|(id, _)| id == session_id)
                .map(|(_, at)| *at)
                .collect()
        })
    }

    pub fn created_count(&self) -> usize {
        self.with_state(|s| s.created)
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.prompts.clone())
    }

    pub fn question_responses(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.question_responses.clone())
    }

    pub fn plan_responses(&self) -> Vec<(String, String, bool)> {
        self.with_state(|s| s.plan_responses.clone())
    }

    pub fn subscribe_calls(&self) -> usize {
        self.with_state(|s| s.subscribe_calls)
    }
}

#[async_trait]
impl BridgeClient for MockClient {
    async fn create_session(&self) -> Result<String> {
        self.with_state(|s| {
            if let Some(reason) = &s.create_failure {
                return Err(SyncError::Transport(reason.clone()));
            }
            s.created += 1;
            let id = format!("ses-new-{}", s.created);
            s.messages.insert(id.clone(), Vec::new());
            Ok(id)
        })
    }

    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let slow = self.with_state(|s| {
            let slow = s.slow_fetches.remove(session_id);
            if slow.is_some() {
                s.fetches.push((session_id.to_string(), Instant::now()));
            }
            slow
        });
        if let Some((delay, messages)) = slow {
            tokio::time::sleep(delay).await;
            return Ok(messages);
        }
        self.with_state(|s| {
            s.fetches.push((session_id.to_string(), Instant::now()));
            if s.expired.contains(session_id) {
                return Err(SyncError::SessionNotFound(session_id.to_string()));
            }
            if let Some(reason) = &s.fetch_failure {
                return Err(SyncError::Transport(reason.clone()));
            }
            Ok(s.messages.get(session_id).cloned().unwrap_or_default())
        })
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        text: &str,
        _options: &PromptOptions,
    ) -> Result<bool> {
        self.with_state(|s| {
            s.prompts.push((session_id.to_string(), text.to_string()));
            if let Some(reason) = &s.send_failure {
                return Err(SyncError::PromptRejected(reason.clone()));
            }
            Ok(s.send_accepted.unwrap_or(true))
        })
    }

    async fn subscribe_events(&self, cancel: CancellationToken) -> Result<EventStream> {
        let mut rx = self.with_state(|s| {
            s.subscribe_calls += 1;
            if let Some(reason) = &s.subscribe_failure {
                return Err(SyncError::Unreachable(reason.clone()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            s.event_tx = Some(tx);
            Ok(rx)
        })?;
        Ok(async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item,
                };
                match next {
                    Some(item) => yield item,
                    None => break,
                }
            }
        }
        .boxed())
    }

    async fn respond_to_question(
        &self,
        session_id: &str,
        request_id: &str,
        _answers: Value,
    ) -> Result<bool> {
        self.with_state(|s| {
            if let Some(reason) = &s.response_failure {
                return Err(SyncError::Transport(reason.clone()));
            }
            s.question_responses
                .push((session_id.to_string(), request_id.to_string()));
            Ok(true)
        })
    }

    async fn respond_to_plan_approval(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
        _feedback: Option<String>,
    ) -> Result<bool> {
        self.with_state(|s| {
            if let Some(reason) = &s.response_failure {
                return Err(SyncError::Transport(reason.clone()));
            }
            s.plan_responses
                .push((session_id.to_string(), request_id.to_string(), approved));
            Ok(true)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Unreachable,
    Timeout,
}

#[derive(Clone)]
pub struct MockConnector {
    client: MockClient,
    failure: Arc<Mutex<Option<ConnectFailure>>>,
    connects: Arc<Mutex<usize>>,
    logs: Vec<String>,
}

impl MockConnector {
    pub fn new(client: MockClient) -> Self {
        Self {
            client,
            failure: Arc::new(Mutex::new(None)),
            connects: Arc::new(Mutex::new(0)),
            logs: vec!["bridge: listening".to_string(), "bridge: stalled".to_string()],
        }
    }

    pub fn fail_with(&self, failure: Option<ConnectFailure>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn connect_count(&self) -> usize {
        *self.connects.lock().unwrap()
    }
}

#[async_trait]
impl BridgeConnector for MockConnector {
    async fn connect(&self, environment_id: &str) -> Result<Arc<dyn BridgeClient>> {
        *self.connects.lock().unwrap() += 1;
        match *self.failure.lock().unwrap() {
            Some(ConnectFailure::Unreachable) => Err(SyncError::Unreachable(format!(
                "connection refused for {}",
                environment_id
            ))),
            Some(ConnectFailure::Timeout) => {
                Err(SyncError::Timeout("bridge handshake".to_string()))
            }
            None => Ok(Arc::new(self.client.clone())),
        }
    }

    async fn diagnostic_logs(&self, _environment_id: &str, limit: usize) -> Vec<String> {
        self.logs.iter().rev().take(limit).rev().cloned().collect()
    }
}
