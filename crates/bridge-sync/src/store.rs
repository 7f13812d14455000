use std::collections::HashMap;
use std::sync::Arc;

use bridge_types::{
    EnvironmentMetadata, Message, PendingPlanApproval, PendingQuestion, Session, SessionKey,
};
use tokio::sync::RwLock;

use crate::reconnect::merge_messages;

#[derive(Default)]
struct StoreState {
    sessions: HashMap<SessionKey, Session>,
    // Vec keeps arrival order; ids are unique within each.
    questions: Vec<PendingQuestion>,
    plan_approvals: Vec<PendingPlanApproval>,
    environments: HashMap<String, EnvironmentMetadata>,
}

/// In-memory session state shared by the reconciler, the refetcher and the
/// reconnection coordinator. Every mutating method applies its whole change
/// under one write guard.
#[derive(Clone, Default)]
pub struct SessionStore {
    state: Arc<RwLock<StoreState>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_session(&self, key: &SessionKey) -> Option<Session> {
        self.state.read().await.sessions.get(key).cloned()
    }

    pub async fn session_id(&self, key: &SessionKey) -> Option<String> {
        self.state
            .read()
            .await
            .sessions
            .get(key)
            .map(|s| s.session_id.clone())
    }

    pub async fn upsert_session(&self, key: SessionKey, session: Session) {
        self.state.write().await.sessions.insert(key, session);
    }

    /// Points `key` at `session_id`, keeping its messages when the id is unchanged.
    pub async fn track_session(&self, key: SessionKey, session_id: &str) {
        let mut state = self.state.write().await;
        let unchanged = state
            .sessions
            .get(&key)
            .is_some_and(|existing| existing.session_id == session_id);
        if !unchanged {
            state.sessions.insert(key, Session::new(session_id));
        }
    }

    pub async fn remove_session(&self, key: &SessionKey) -> Option<Session> {
        self.state.write().await.sessions.remove(key)
    }

    /// Keys in `environment_id` whose session is `session_id`, in stable order.
    pub async fn keys_for_session(&self, environment_id: &str, session_id: &str) -> Vec<SessionKey> {
        let state = self.state.read().await;
        let mut keys: Vec<SessionKey> = state
            .sessions
            .iter()
            .filter(|(key, session)| {
                key.environment_id == environment_id && session.session_id == session_id
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn set_loading(&self, key: &SessionKey, loading: bool) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(key) {
            Some(session) => {
                session.is_loading = loading;
                true
            }
            None => false,
        }
    }

    pub async fn append_message(&self, key: &SessionKey, message: Message) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(key) {
            Some(session) => {
                session.messages.push(message);
                true
            }
            None => false,
        }
    }

    /// Appends the optimistic user message and marks the session loading.
    pub async fn begin_prompt(&self, key: &SessionKey, message: Message) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(key) {
            Some(session) => {
                session.messages.push(message);
                session.is_loading = true;
                true
            }
            None => false,
        }
    }

    /// Clears loading and appends a synthesized error. Existing messages are untouched.
    pub async fn fail_session(&self, key: &SessionKey, error: Message) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(key) {
            Some(session) => {
                session.is_loading = false;
                session.messages.push(error);
                true
            }
            None => false,
        }
    }

    /// Replaces the message list with authoritative server messages, keeping
    /// local-only messages the server does not know about.
    pub async fn apply_server_messages(&self, key: &SessionKey, fetched: Vec<Message>) -> bool {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(key) {
            Some(session) => {
                session.messages = merge_messages(fetched, &session.messages);
                true
            }
            None => false,
        }
    }

    /// Starts `key` over on a fresh backend session.
    pub async fn reset_session(&self, key: SessionKey, session_id: &str) {
        self.state
            .write()
            .await
            .sessions
            .insert(key, Session::new(session_id));
    }

    pub async fn insert_question(&self, question: PendingQuestion) {
        let mut state = self.state.write().await;
        match state.questions.iter().position(|q| q.id == question.id) {
            Some(index) => state.questions[index] = question,
            None => state.questions.push(question),
        }
    }

    pub async fn remove_question(&self, request_id: &str) -> Option<PendingQuestion> {
        let mut state = self.state.write().await;
        let index = state.questions.iter().position(|q| q.id == request_id)?;
        Some(state.questions.remove(index))
    }

    pub async fn get_question(&self, request_id: &str) -> Option<PendingQuestion> {
        self.state
            .read()
            .await
            .questions
            .iter()
            .find(|q| q.id == request_id)
            .cloned()
    }

    pub async fn pending_questions(&self, session_id: &str) -> Vec<PendingQuestion> {
        self.state
            .read()
            .await
            .questions
            .iter()
            .filter(|q| q.session_id == session_id)
            .cloned()
            .collect()
    }

    pub async fn insert_plan_approval(&self, approval: PendingPlanApproval) {
        let mut state = self.state.write().await;
        match state.plan_approvals.iter().position(|p| p.id == approval.id) {
            Some(index) => state.plan_approvals[index] = approval,
            None => state.plan_approvals.push(approval),
        }
    }

    pub async fn remove_plan_approval(&self, request_id: &str) -> Option<PendingPlanApproval> {
        let mut state = self.state.write().await;
        let index = state
            .plan_approvals
            .iter()
            .position(|p| p.id == request_id)?;
        Some(state.plan_approvals.remove(index))
    }

    pub async fn get_plan_approval(&self, request_id: &str) -> Option<PendingPlanApproval> {
        self.state
            .read()
            .await
            .plan_approvals
            .iter()
            .find(|p| p.id == request_id)
            .cloned()
    }

    pub async fn pending_plan_approvals(&self, session_id: &str) -> Vec<PendingPlanApproval> {
        self.state
            .read()
            .await
            .plan_approvals
            .iter()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect()
    }

    pub async fn clear_requests_for_session(&self, session_id: &str) {
        let mut state = self.state.write().await;
        state.questions.retain(|q| q.session_id != session_id);
        state.plan_approvals.retain(|p| p.session_id != session_id);
    }

    pub async fn set_environment_metadata(&self, environment_id: &str, metadata: EnvironmentMetadata) {
        self.state
            .write()
            .await
            .environments
            .insert(environment_id.to_string(), metadata);
    }

    pub async fn environment_metadata(&self, environment_id: &str) -> Option<EnvironmentMetadata> {
        self.state
            .read()
            .await
            .environments
            .get(environment_id)
            .cloned()
    }
}
