use std::collections::HashMap;
use std::sync::Arc;

use bridge_observability::{
    emit_event, init_logging, LoggingInitInfo, SyncComponent, SyncEvent,
};
use bridge_types::{
    DisplayNode, EnvironmentMetadata, MessagePart, PendingPlanApproval, PendingQuestion, Session,
    SessionKey,
};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::Level;

use crate::client::{BridgeConnector, PromptOptions};
use crate::config::{ConfigLoader, SyncConfig};
use crate::error::{Result, SyncError};
use crate::part_tree;
use crate::reconnect::{ConnectionState, ReconnectionCoordinator};
use crate::store::SessionStore;
use crate::subscription::EventSubscriptionManager;

type SharedCoordinator = Arc<Mutex<ReconnectionCoordinator>>;

/// Entry point for a UI: owns the store, the per-environment subscriptions
/// and one reconnection coordinator per tab.
pub struct SyncEngine {
    store: SessionStore,
    manager: Arc<EventSubscriptionManager>,
    connector: Arc<dyn BridgeConnector>,
    config: Arc<SyncConfig>,
    tabs: RwLock<HashMap<String, SharedCoordinator>>,
}

impl SyncEngine {
    pub fn new(connector: Arc<dyn BridgeConnector>, config: SyncConfig) -> Self {
        Self::with_store(connector, config, SessionStore::new())
    }

    pub fn with_store(
        connector: Arc<dyn BridgeConnector>,
        config: SyncConfig,
        store: SessionStore,
    ) -> Self {
        Self {
            store,
            manager: Arc::new(EventSubscriptionManager::new()),
            connector,
            config: Arc::new(config),
            tabs: RwLock::new(HashMap::new()),
        }
    }

    /// Loads layered configuration and builds an engine from it.
    pub async fn from_loader(
        connector: Arc<dyn BridgeConnector>,
        loader: &ConfigLoader,
    ) -> Result<Self> {
        let config = loader.load().await?;
        Ok(Self::new(connector, config))
    }

    /// Installs the tracing subscriber described by the logging section.
    /// Keep the returned guard alive for the file layer to flush.
    pub fn init_logging(&self) -> anyhow::Result<LoggingInitInfo> {
        init_logging(&self.config.logging)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn subscriptions(&self) -> &EventSubscriptionManager {
        &self.manager
    }

    async fn coordinator(&self, tab_id: &str) -> SharedCoordinator {
        if let Some(existing) = self.tabs.read().await.get(tab_id) {
            return existing.clone();
        }
        self.tabs
            .write()
            .await
            .entry(tab_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ReconnectionCoordinator::new(
                    tab_id,
                    self.store.clone(),
                    self.manager.clone(),
                    self.connector.clone(),
                    self.config.clone(),
                )))
            })
            .clone()
    }

    async fn existing_coordinator(&self, tab_id: &str) -> Result<SharedCoordinator> {
        self.tabs
            .read()
            .await
            .get(tab_id)
            .cloned()
            .ok_or_else(|| SyncError::InvalidOperation(format!("unknown tab {}", tab_id)))
    }

    pub async fn initialize(&self, tab_id: &str, environment_id: &str) -> ConnectionState {
        let coordinator = self.coordinator(tab_id).await;
        let mut coordinator = coordinator.lock().await;
        coordinator.initialize(environment_id).await
    }

    pub async fn retry(&self, tab_id: &str) -> Result<ConnectionState> {
        let coordinator = self.existing_coordinator(tab_id).await?;
        let mut coordinator = coordinator.lock().await;
        coordinator.retry().await
    }

    pub async fn resume(&self, key: &SessionKey, session_id: &str) -> ConnectionState {
        let coordinator = self.coordinator(&key.tab_id).await;
        let mut coordinator = coordinator.lock().await;
        coordinator.resume(key, session_id).await
    }

    pub async fn unmount(&self, tab_id: &str) {
        let Ok(coordinator) = self.existing_coordinator(tab_id).await else {
            return;
        };
        coordinator.lock().await.unmount();
    }

    pub async fn close_tab(&self, tab_id: &str) {
        let removed = self.tabs.write().await.remove(tab_id);
        if let Some(coordinator) = removed {
            coordinator.lock().await.close().await;
            emit_event(
                Level::INFO,
                SyncEvent::new(SyncComponent::Engine, "tab.closed").tab(tab_id),
            );
        }
    }

    pub async fn queue_prompt(&self, tab_id: &str, text: &str, options: PromptOptions) {
        let coordinator = self.coordinator(tab_id).await;
        coordinator.lock().await.queue_prompt(text, options);
    }

    pub async fn send_prompt(
        &self,
        tab_id: &str,
        text: &str,
        options: &PromptOptions,
    ) -> Result<bool> {
        let coordinator = self.existing_coordinator(tab_id).await?;
        let coordinator = coordinator.lock().await;
        coordinator.send_prompt(text, options).await
    }

    pub async fn answer_question(
        &self,
        tab_id: &str,
        request_id: &str,
        answers: Value,
    ) -> Result<()> {
        let coordinator = self.existing_coordinator(tab_id).await?;
        let coordinator = coordinator.lock().await;
        coordinator.answer_question(request_id, answers).await
    }

    pub async fn respond_to_plan_approval(
        &self,
        tab_id: &str,
        request_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<()> {
        let coordinator = self.existing_coordinator(tab_id).await?;
        let coordinator = coordinator.lock().await;
        coordinator
            .respond_to_plan_approval(request_id, approved, feedback)
            .await
    }

    /// Hides a question locally without answering it.
    pub async fn dismiss_question(&self, request_id: &str) -> bool {
        self.store.remove_question(request_id).await.is_some()
    }

    pub async fn dismiss_plan_approval(&self, request_id: &str) -> bool {
        self.store.remove_plan_approval(request_id).await.is_some()
    }

    pub async fn get_session(&self, key: &SessionKey) -> Option<Session> {
        self.store.get_session(key).await
    }

    pub async fn pending_questions(&self, session_id: &str) -> Vec<PendingQuestion> {
        self.store.pending_questions(session_id).await
    }

    pub async fn pending_plan_approvals(&self, session_id: &str) -> Vec<PendingPlanApproval> {
        self.store.pending_plan_approvals(session_id).await
    }

    pub async fn environment_metadata(&self, environment_id: &str) -> Option<EnvironmentMetadata> {
        self.store.environment_metadata(environment_id).await
    }

    pub async fn connection_state(&self, tab_id: &str) -> ConnectionState {
        match self.existing_coordinator(tab_id).await {
            Ok(coordinator) => coordinator.lock().await.state().clone(),
            Err(_) => ConnectionState::Idle,
        }
    }

    pub fn display_tree(&self, parts: &[MessagePart]) -> Vec<DisplayNode> {
        part_tree::build_for(parts, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockClient, MockConnector};
    use bridge_types::{Message, MessageRole, RawEvent};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::sleep;

    fn engine() -> (MockClient, SyncEngine) {
        let client = MockClient::new();
        let connector = Arc::new(MockConnector::new(client.clone()));
        (client, SyncEngine::new(connector, SyncConfig::default()))
    }

    fn key(tab: &str) -> SessionKey {
        SessionKey::new("env-1", tab)
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_round_trip_through_event_stream() {
        let (client, engine) = engine();
        assert_eq!(
            engine.initialize("t1", "env-1").await,
            ConnectionState::Connected
        );
        sleep(Duration::from_millis(10)).await;

        assert!(engine
            .send_prompt("t1", "list files", &PromptOptions::default())
            .await
            .expect("connected"));
        assert!(engine.get_session(&key("t1")).await.expect("s").is_loading);

        client.set_messages(
            "ses-new-1",
            vec![
                Message::server("u1", MessageRole::User, "list files"),
                Message::server("a1", MessageRole::Assistant, "Cargo.toml"),
            ],
        );
        client.push_event(RawEvent::new(
            "message.part.updated",
            json!({"part": {"sessionID": "ses-new-1"}}),
        ));
        client.push_event(RawEvent::new("session.idle", json!({"sessionID": "ses-new-1"})));
        sleep(Duration::from_millis(500)).await;

        let session = engine.get_session(&key("t1")).await.expect("session");
        assert!(!session.is_loading);
        let ids: Vec<&str> = session.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "a1"]);
        // The debounced fetch was superseded by the immediate one.
        assert_eq!(client.fetch_count("ses-new-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_requests_and_metadata_flow_from_events() {
        let (client, engine) = engine();
        engine.initialize("t1", "env-1").await;
        sleep(Duration::from_millis(10)).await;

        client.push_event(RawEvent::new(
            "system.init",
            json!({"slashCommands": ["compact"], "plugins": ["fmt"]}),
        ));
        client.push_event(RawEvent::new(
            "question.asked",
            json!({"id": "q1", "sessionID": "ses-new-1"}),
        ));
        client.push_event(RawEvent::new(
            "plan.approval.requested",
            json!({"id": "p1", "sessionID": "ses-new-1"}),
        ));
        sleep(Duration::from_millis(10)).await;

        let metadata = engine.environment_metadata("env-1").await.expect("metadata");
        assert_eq!(metadata.plugins[0].name, "fmt");
        assert_eq!(engine.pending_questions("ses-new-1").await.len(), 1);

        engine
            .answer_question("t1", "q1", json!({"answers": [["yes"]]}))
            .await
            .expect("answer");
        assert!(engine.pending_questions("ses-new-1").await.is_empty());

        assert!(engine.dismiss_plan_approval("p1").await);
        assert!(!engine.dismiss_plan_approval("p1").await);
        assert!(client.plan_responses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_prompt_before_initialize() {
        let (client, engine) = engine();
        engine
            .queue_prompt("t1", "start", PromptOptions::default())
            .await;
        engine.initialize("t1", "env-1").await;
        assert_eq!(client.prompts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tab_operations() {
        let (_client, engine) = engine();
        assert_eq!(engine.connection_state("nope").await, ConnectionState::Idle);
        assert!(matches!(
            engine.retry("nope").await,
            Err(SyncError::InvalidOperation(_))
        ));
        assert!(engine
            .send_prompt("nope", "x", &PromptOptions::default())
            .await
            .is_err());
        engine.unmount("nope").await;
        engine.close_tab("nope").await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_tab_releases_and_forgets() {
        let (_client, engine) = engine();
        engine.initialize("t1", "env-1").await;
        engine.initialize("t2", "env-1").await;
        assert_eq!(engine.subscriptions().ref_count("env-1"), 2);

        engine.close_tab("t1").await;
        assert_eq!(engine.subscriptions().ref_count("env-1"), 1);
        assert!(engine.get_session(&key("t1")).await.is_none());
        assert_eq!(engine.connection_state("t1").await, ConnectionState::Idle);

        engine.unmount("t2").await;
        assert!(!engine.subscriptions().has_active("env-1"));
        assert!(engine.get_session(&key("t2")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_reattaches_known_session() {
        let (client, engine) = engine();
        client.set_messages(
            "s-old",
            vec![Message::server("m1", MessageRole::Assistant, "welcome back")],
        );
        let state = engine.resume(&key("t9"), "s-old").await;
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(client.created_count(), 0);
        let session = engine.get_session(&key("t9")).await.expect("session");
        assert_eq!(session.session_id, "s-old");
        assert_eq!(session.messages.len(), 1);
    }
}
