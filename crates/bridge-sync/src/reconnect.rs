use std::collections::HashSet;
use std::sync::Arc;

use bridge_observability::{emit_event, redact_text, SyncComponent, SyncEvent};
use bridge_types::{Message, SessionKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::Level;

use crate::client::{BridgeClient, BridgeConnector, PromptOptions};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::reconciler::spawn_reconciler;
use crate::store::SessionStore;
use crate::subscription::EventSubscriptionManager;

/// Server messages replace the local list; local-origin messages the server
/// has never seen are kept after them.
pub fn merge_messages(fetched: Vec<Message>, local: &[Message]) -> Vec<Message> {
    let server_ids: HashSet<&str> = fetched.iter().map(|m| m.id.as_str()).collect();
    let keep_local: Vec<Message> = local
        .iter()
        .filter(|m| m.is_local() && !server_ids.contains(m.id.as_str()))
        .cloned()
        .collect();
    let mut merged = fetched;
    merged.extend(keep_local);
    merged
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error {
        message: String,
        #[serde(default)]
        diagnostics: Vec<String>,
    },
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

#[derive(Debug, Clone)]
struct QueuedPrompt {
    text: String,
    options: PromptOptions,
}

/// Brings one tab from nothing to a live, subscribed session and keeps it
/// there across restarts of the bridge server.
pub struct ReconnectionCoordinator {
    tab_id: String,
    environment_id: Option<String>,
    store: SessionStore,
    manager: Arc<EventSubscriptionManager>,
    connector: Arc<dyn BridgeConnector>,
    config: Arc<SyncConfig>,
    state: ConnectionState,
    client: Option<Arc<dyn BridgeClient>>,
    session_ref: Option<String>,
    subscription_generation: Option<u64>,
    last_init: Option<Instant>,
    queued_prompt: Option<QueuedPrompt>,
}

impl ReconnectionCoordinator {
    pub fn new(
        tab_id: impl Into<String>,
        store: SessionStore,
        manager: Arc<EventSubscriptionManager>,
        connector: Arc<dyn BridgeConnector>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            tab_id: tab_id.into(),
            environment_id: None,
            store,
            manager,
            connector,
            config,
            state: ConnectionState::Idle,
            client: None,
            session_ref: None,
            subscription_generation: None,
            last_init: None,
            queued_prompt: None,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn environment_id(&self) -> Option<&str> {
        self.environment_id.as_deref()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.environment_id
            .as_deref()
            .map(|env| SessionKey::new(env, self.tab_id.as_str()))
    }

    pub fn has_queued_prompt(&self) -> bool {
        self.queued_prompt.is_some()
    }

    /// Connects the tab to `environment_id`. A repeat call for the same
    /// environment while connecting or connected, inside the init debounce
    /// window, does nothing.
    pub async fn initialize(&mut self, environment_id: &str) -> ConnectionState {
        let same_environment = self.environment_id.as_deref() == Some(environment_id);
        let recent = self
            .last_init
            .is_some_and(|at| at.elapsed() < self.config.init_debounce());
        if same_environment && recent && self.state.is_active() {
            tracing::debug!(
                "Ignoring repeated initialize for tab {} in {}",
                self.tab_id,
                environment_id
            );
            return self.state.clone();
        }
        self.connect(environment_id).await
    }

    /// Re-runs initialization for the current environment, ignoring the
    /// debounce window.
    pub async fn retry(&mut self) -> Result<ConnectionState> {
        let environment_id = self.environment_id.clone().ok_or_else(|| {
            SyncError::InvalidOperation(format!("tab {} was never initialized", self.tab_id))
        })?;
        Ok(self.connect(&environment_id).await)
    }

    /// Points the tab at a known backend session and reconnects to it.
    pub async fn resume(&mut self, key: &SessionKey, session_id: &str) -> ConnectionState {
        if self.environment_id.as_deref() != Some(key.environment_id.as_str()) {
            self.release_subscription();
            self.environment_id = Some(key.environment_id.clone());
        }
        self.store.track_session(key.clone(), session_id).await;
        self.session_ref = Some(session_id.to_string());
        self.connect(&key.environment_id).await
    }

    /// Holds a prompt until the next initialization creates a session.
    pub fn queue_prompt(&mut self, text: impl Into<String>, options: PromptOptions) {
        self.queued_prompt = Some(QueuedPrompt {
            text: text.into(),
            options,
        });
    }

    async fn connect(&mut self, environment_id: &str) -> ConnectionState {
        if self.environment_id.as_deref() != Some(environment_id) {
            self.release_subscription();
            self.session_ref = None;
            self.environment_id = Some(environment_id.to_string());
        }
        self.last_init = Some(Instant::now());
        self.state = ConnectionState::Connecting;
        emit_event(
            Level::INFO,
            SyncEvent::new(SyncComponent::Reconnect, "connect.start")
                .environment(environment_id)
                .tab(&self.tab_id),
        );

        let client = match self.connector.connect(environment_id).await {
            Ok(client) => client,
            Err(err) => return self.fail(environment_id, err).await,
        };
        self.client = Some(client.clone());
        let key = SessionKey::new(environment_id, self.tab_id.as_str());

        let existing = match self.session_ref.clone() {
            Some(session_id) => Some(session_id),
            None => self.store.session_id(&key).await,
        };

        match existing {
            Some(session_id) => {
                self.store.track_session(key.clone(), &session_id).await;
                self.session_ref = Some(session_id.clone());
                self.state = ConnectionState::Connected;
                self.ensure_subscription(environment_id, &client);
                if let Err(err) = self.refresh(&client, &key, &session_id).await {
                    return self.fail(environment_id, err).await;
                }
            }
            None => {
                let session_id = match client.create_session().await {
                    Ok(session_id) => session_id,
                    Err(err) => return self.fail(environment_id, err).await,
                };
                self.store.reset_session(key.clone(), &session_id).await;
                self.session_ref = Some(session_id.clone());
                self.state = ConnectionState::Connected;

                match self.queued_prompt.take() {
                    Some(prompt) => {
                        self.store
                            .begin_prompt(&key, Message::optimistic_user(prompt.text.as_str()))
                            .await;
                        self.ensure_subscription(environment_id, &client);
                        self.dispatch_prompt(
                            &client,
                            &key,
                            &session_id,
                            &prompt.text,
                            &prompt.options,
                        )
                        .await;
                    }
                    None => self.ensure_subscription(environment_id, &client),
                }
            }
        }

        emit_event(
            Level::INFO,
            SyncEvent::new(SyncComponent::Reconnect, "connect.ready")
                .environment(environment_id)
                .tab(&self.tab_id)
                .session(self.session_ref.as_deref().unwrap_or_default()),
        );
        self.state.clone()
    }

    /// Pulls authoritative messages for an existing session. An expired
    /// session is replaced by a fresh one without surfacing an error.
    async fn refresh(
        &mut self,
        client: &Arc<dyn BridgeClient>,
        key: &SessionKey,
        session_id: &str,
    ) -> Result<()> {
        match client.get_session_messages(session_id).await {
            Ok(fetched) => {
                self.store.apply_server_messages(key, fetched).await;
                Ok(())
            }
            Err(err) if err.is_session_not_found() => {
                emit_event(
                    Level::WARN,
                    SyncEvent::new(SyncComponent::Reconnect, "session.expired")
                        .environment(&key.environment_id)
                        .tab(&key.tab_id)
                        .session(session_id),
                );
                let fresh = client.create_session().await?;
                self.store.clear_requests_for_session(session_id).await;
                self.store.reset_session(key.clone(), &fresh).await;
                self.session_ref = Some(fresh);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    "Keeping cached messages for {}; refresh failed: {}",
                    session_id,
                    err
                );
                Ok(())
            }
        }
    }

    fn ensure_subscription(&mut self, environment_id: &str, client: &Arc<dyn BridgeClient>) {
        if let Some(held) = self.subscription_generation {
            if self.manager.generation(environment_id) == Some(held) {
                return;
            }
        }
        let (generation, handle) = self.manager.acquire_with_generation(environment_id);
        self.subscription_generation = Some(generation);
        if let Some(handle) = handle {
            spawn_reconciler(
                handle,
                client.clone(),
                self.store.clone(),
                self.manager.clone(),
                self.config.clone(),
            );
        }
    }

    fn release_subscription(&mut self) {
        let Some(generation) = self.subscription_generation.take() else {
            return;
        };
        if let Some(environment_id) = self.environment_id.as_deref() {
            self.manager.release_generation(environment_id, generation);
        }
    }

    /// Sends a prompt whose optimistic message is already in the store. A
    /// failed or declined send clears loading and appends an error message.
    async fn dispatch_prompt(
        &self,
        client: &Arc<dyn BridgeClient>,
        key: &SessionKey,
        session_id: &str,
        text: &str,
        options: &PromptOptions,
    ) -> bool {
        let failure = match client.send_prompt(session_id, text, options).await {
            Ok(true) => None,
            Ok(false) => Some(
                SyncError::PromptRejected("the agent server declined the prompt".to_string())
                    .user_message(),
            ),
            Err(err) => Some(err.user_message()),
        };
        let redacted = redact_text(text);
        match failure {
            None => {
                emit_event(
                    Level::INFO,
                    SyncEvent::new(SyncComponent::Reconnect, "prompt.sent")
                        .environment(&key.environment_id)
                        .tab(&key.tab_id)
                        .session(session_id)
                        .detail(&redacted),
                );
                true
            }
            Some(message) => {
                emit_event(
                    Level::WARN,
                    SyncEvent::new(SyncComponent::Reconnect, "prompt.failed")
                        .environment(&key.environment_id)
                        .tab(&key.tab_id)
                        .session(session_id)
                        .detail(&message),
                );
                self.store
                    .fail_session(key, Message::local_error(&self.config.local_id_prefix, message))
                    .await;
                false
            }
        }
    }

    fn connected_session(&self) -> Result<(Arc<dyn BridgeClient>, SessionKey, String)> {
        match (&self.state, &self.client, self.session_key(), &self.session_ref) {
            (ConnectionState::Connected, Some(client), Some(key), Some(session_id)) => {
                Ok((client.clone(), key, session_id.clone()))
            }
            _ => Err(SyncError::InvalidOperation(format!(
                "tab {} is not connected",
                self.tab_id
            ))),
        }
    }

    /// Sends a prompt on the connected session. Returns whether the bridge
    /// accepted it; a rejection is already reflected in the conversation.
    pub async fn send_prompt(&self, text: &str, options: &PromptOptions) -> Result<bool> {
        let (client, key, session_id) = self.connected_session()?;
        self.store
            .begin_prompt(&key, Message::optimistic_user(text))
            .await;
        Ok(self
            .dispatch_prompt(&client, &key, &session_id, text, options)
            .await)
    }

    pub async fn answer_question(&self, request_id: &str, answers: Value) -> Result<()> {
        let (client, _key, _session_id) = self.connected_session()?;
        let question = self.store.get_question(request_id).await.ok_or_else(|| {
            SyncError::InvalidOperation(format!("no pending question {}", request_id))
        })?;
        if !client
            .respond_to_question(&question.session_id, request_id, answers)
            .await?
        {
            return Err(SyncError::PromptRejected(format!(
                "answer to {} was not accepted",
                request_id
            )));
        }
        self.store.remove_question(request_id).await;
        Ok(())
    }

    pub async fn respond_to_plan_approval(
        &self,
        request_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<()> {
        let (client, _key, _session_id) = self.connected_session()?;
        let approval = self
            .store
            .get_plan_approval(request_id)
            .await
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!("no pending plan approval {}", request_id))
            })?;
        if !client
            .respond_to_plan_approval(&approval.session_id, request_id, approved, feedback)
            .await?
        {
            return Err(SyncError::PromptRejected(format!(
                "plan response {} was not accepted",
                request_id
            )));
        }
        self.store.remove_plan_approval(request_id).await;
        Ok(())
    }

    /// Detaches the tab from its subscription. Store contents are kept for a
    /// later `resume` or `initialize`.
    pub fn unmount(&mut self) {
        self.release_subscription();
        self.session_ref = None;
        self.client = None;
        self.queued_prompt = None;
        self.last_init = None;
        self.state = ConnectionState::Idle;
    }

    /// Unmounts and forgets the tab's session and its pending requests.
    pub async fn close(&mut self) {
        let key = self.session_key();
        self.unmount();
        let Some(key) = key else {
            return;
        };
        if let Some(session) = self.store.remove_session(&key).await {
            let still_tracked = !self
                .store
                .keys_for_session(&key.environment_id, &session.session_id)
                .await
                .is_empty();
            if !still_tracked {
                self.store
                    .clear_requests_for_session(&session.session_id)
                    .await;
            }
        }
        self.environment_id = None;
    }

    async fn fail(&mut self, environment_id: &str, err: SyncError) -> ConnectionState {
        let diagnostics = if err.is_timeout() {
            self.connector
                .diagnostic_logs(environment_id, self.config.diagnostic_log_lines)
                .await
        } else {
            Vec::new()
        };
        let message = err.user_message();
        emit_event(
            Level::ERROR,
            SyncEvent::new(SyncComponent::Reconnect, "connect.failed")
                .environment(environment_id)
                .tab(&self.tab_id)
                .detail(&err.to_string()),
        );
        self.state = ConnectionState::Error {
            message,
            diagnostics,
        };
        self.state.clone()
    }
}
