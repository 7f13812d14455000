use std::sync::Arc;

use async_trait::async_trait;
use bridge_types::{Message, RawEvent};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub type EventStream = BoxStream<'static, Result<RawEvent>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Session operations exposed by a bridge server. Transport details (HTTP,
/// auth, connection timeouts) live behind this trait.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    async fn create_session(&self) -> Result<String>;

    /// Returns [`SyncError::SessionNotFound`](crate::SyncError::SessionNotFound)
    /// when the backend no longer knows the session.
    async fn get_session_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    async fn send_prompt(&self, session_id: &str, text: &str, options: &PromptOptions)
        -> Result<bool>;

    /// Opens the environment-wide event feed. The stream must end once
    /// `cancel` fires.
    async fn subscribe_events(&self, cancel: CancellationToken) -> Result<EventStream>;

    async fn respond_to_question(
        &self,
        session_id: &str,
        request_id: &str,
        answers: Value,
    ) -> Result<bool>;

    async fn respond_to_plan_approval(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<bool>;
}

/// Resolves an environment to a live client. Port discovery and process
/// startup happen behind this trait.
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    async fn connect(&self, environment_id: &str) -> Result<Arc<dyn BridgeClient>>;

    /// Recent server log lines, consulted when a handshake times out.
    async fn diagnostic_logs(&self, _environment_id: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}
