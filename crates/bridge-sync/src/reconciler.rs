use std::sync::Arc;

use bridge_observability::{emit_event, SyncComponent, SyncEvent};
use bridge_types::{Message, RawEvent};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::client::BridgeClient;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::event::{BridgeEvent, EventKind, RequestOutcome};
use crate::refetch::DebouncedRefetcher;
use crate::store::SessionStore;
use crate::subscription::{EventSubscriptionManager, SubscriptionHandle};

/// What the reconciler did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// On the ignore list, or with nothing to apply.
    Ignored,
    /// Carried no session id.
    Dropped,
    /// Named a session no tab of this environment tracks.
    Unmatched,
}

/// Why a consumer loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClose {
    Cancelled,
    Ended,
    Failed,
    OpenFailed,
}

impl StreamClose {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamClose::Cancelled => "cancelled",
            StreamClose::Ended => "ended",
            StreamClose::Failed => "failed",
            StreamClose::OpenFailed => "open_failed",
        }
    }
}

/// Applies one environment's event stream to the store, in arrival order.
pub struct EventReconciler {
    environment_id: String,
    store: SessionStore,
    refetcher: DebouncedRefetcher,
    local_id_prefix: String,
}

impl EventReconciler {
    pub fn new(
        environment_id: impl Into<String>,
        store: SessionStore,
        refetcher: DebouncedRefetcher,
        config: &SyncConfig,
    ) -> Self {
        Self {
            environment_id: environment_id.into(),
            store,
            refetcher,
            local_id_prefix: config.local_id_prefix.clone(),
        }
    }

    pub fn refetcher(&self) -> &DebouncedRefetcher {
        &self.refetcher
    }

    pub async fn handle_raw(&self, raw: &RawEvent) -> Disposition {
        self.handle_event(BridgeEvent::parse(raw)).await
    }

    pub async fn handle_event(&self, event: BridgeEvent) -> Disposition {
        if event.is_session_independent() {
            return self.apply_request_or_init(event).await;
        }

        let Some(session_id) = event.session_id() else {
            tracing::trace!("Dropping {} without a session id", event.event_type());
            return Disposition::Dropped;
        };
        if event.kind() == EventKind::Ignored {
            return Disposition::Ignored;
        }

        let keys = self
            .store
            .keys_for_session(&self.environment_id, session_id)
            .await;
        let Some(first_key) = keys.first() else {
            emit_event(
                Level::WARN,
                SyncEvent::new(SyncComponent::Reconciler, "event.unmatched")
                    .environment(&self.environment_id)
                    .session(session_id)
                    .event_type(event.event_type()),
            );
            return Disposition::Unmatched;
        };

        match &event {
            BridgeEvent::ContentChanged { .. } => {
                self.refetcher.schedule(session_id, first_key, false).await;
            }
            BridgeEvent::SessionIdle { .. } => {
                for key in &keys {
                    self.store.set_loading(key, false).await;
                }
                self.refetcher.schedule(session_id, first_key, true).await;
                emit_event(
                    Level::DEBUG,
                    SyncEvent::new(SyncComponent::Reconciler, "session.idle")
                        .environment(&self.environment_id)
                        .session(session_id),
                );
            }
            BridgeEvent::SessionError { error, .. } => {
                for key in &keys {
                    let message =
                        Message::local_error(&self.local_id_prefix, format!("Error: {}", error));
                    self.store.fail_session(key, message).await;
                }
                emit_event(
                    Level::WARN,
                    SyncEvent::new(SyncComponent::Reconciler, "session.error")
                        .environment(&self.environment_id)
                        .session(session_id)
                        .detail(error),
                );
            }
            other => {
                tracing::debug!(
                    "No handler for {} on session {}",
                    other.event_type(),
                    session_id
                );
                return Disposition::Ignored;
            }
        }
        Disposition::Applied
    }

    async fn apply_request_or_init(&self, event: BridgeEvent) -> Disposition {
        match event {
            BridgeEvent::SessionInitialized { metadata, .. } => {
                let detail = format!(
                    "commands={} plugins={}",
                    metadata.slash_commands.len(),
                    metadata.plugins.len()
                );
                self.store
                    .set_environment_metadata(&self.environment_id, metadata)
                    .await;
                emit_event(
                    Level::INFO,
                    SyncEvent::new(SyncComponent::Reconciler, "environment.initialized")
                        .environment(&self.environment_id)
                        .detail(&detail),
                );
            }
            BridgeEvent::QuestionAsked(question) => {
                emit_event(
                    Level::INFO,
                    SyncEvent::new(SyncComponent::Reconciler, "question.asked")
                        .environment(&self.environment_id)
                        .session(&question.session_id)
                        .request(&question.id),
                );
                self.store.insert_question(question).await;
            }
            BridgeEvent::QuestionResolved {
                request_id,
                outcome,
                ..
            } => {
                let removed = self.store.remove_question(&request_id).await;
                return self.resolved("question.resolved", removed, &request_id, outcome);
            }
            BridgeEvent::PlanApprovalRequested(approval) => {
                emit_event(
                    Level::INFO,
                    SyncEvent::new(SyncComponent::Reconciler, "plan_approval.requested")
                        .environment(&self.environment_id)
                        .session(&approval.session_id)
                        .request(&approval.id),
                );
                self.store.insert_plan_approval(approval).await;
            }
            BridgeEvent::PlanApprovalResolved {
                request_id,
                outcome,
                ..
            } => {
                let removed = self.store.remove_plan_approval(&request_id).await;
                return self.resolved("plan_approval.resolved", removed, &request_id, outcome);
            }
            _ => return Disposition::Ignored,
        }
        Disposition::Applied
    }

    fn resolved<T>(
        &self,
        event: &str,
        removed: Option<T>,
        request_id: &str,
        outcome: RequestOutcome,
    ) -> Disposition {
        if removed.is_none() {
            tracing::debug!("No pending request {} to resolve", request_id);
            return Disposition::Ignored;
        }
        emit_event(
            Level::INFO,
            SyncEvent::new(SyncComponent::Reconciler, event)
                .environment(&self.environment_id)
                .request(request_id)
                .status(outcome.as_str()),
        );
        Disposition::Applied
    }

    /// Opens the subscription's stream and reconciles until it ends or the
    /// handle is cancelled. Always finishes by discarding pending refetches
    /// and tearing the subscription down so a later `acquire` starts fresh.
    pub async fn run(
        &self,
        handle: SubscriptionHandle,
        client: Arc<dyn BridgeClient>,
        manager: Arc<EventSubscriptionManager>,
    ) -> StreamClose {
        let cancel = handle.cancel_token();
        let close = match handle.open(client.as_ref()).await {
            Ok(mut stream) => {
                emit_event(
                    Level::INFO,
                    SyncEvent::new(SyncComponent::Reconciler, "stream.opened")
                        .environment(&self.environment_id),
                );
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break StreamClose::Cancelled,
                        maybe = stream.next() => {
                            let Some(next_item) = maybe else {
                                if cancel.is_cancelled() {
                                    break StreamClose::Cancelled;
                                }
                                tracing::info!("Event stream for {} ended", self.environment_id);
                                break StreamClose::Ended;
                            };
                            match next_item {
                                Ok(raw) => {
                                    self.handle_raw(&raw).await;
                                }
                                Err(_) if cancel.is_cancelled() => break StreamClose::Cancelled,
                                Err(err) => {
                                    tracing::warn!(
                                        "Event stream for {} failed: {}",
                                        self.environment_id,
                                        err
                                    );
                                    break StreamClose::Failed;
                                }
                            }
                        }
                    }
                }
            }
            Err(SyncError::Cancelled) => StreamClose::Cancelled,
            Err(_) if cancel.is_cancelled() => StreamClose::Cancelled,
            Err(err) => {
                tracing::error!(
                    "Failed to open event stream for {}: {}",
                    self.environment_id,
                    err
                );
                StreamClose::OpenFailed
            }
        };

        self.refetcher.cancel_all();
        manager.teardown(&handle);
        emit_event(
            Level::INFO,
            SyncEvent::new(SyncComponent::Reconciler, "stream.closed")
                .environment(&self.environment_id)
                .status(close.as_str()),
        );
        close
    }
}

/// Starts the consumer task for a freshly acquired subscription.
pub fn spawn_reconciler(
    handle: SubscriptionHandle,
    client: Arc<dyn BridgeClient>,
    store: SessionStore,
    manager: Arc<EventSubscriptionManager>,
    config: Arc<SyncConfig>,
) -> JoinHandle<StreamClose> {
    let environment_id = handle.environment_id().to_string();
    let refetcher = DebouncedRefetcher::new(
        environment_id.clone(),
        client.clone(),
        store.clone(),
        config.debounce(),
        handle.cancel_token(),
    );
    let reconciler = EventReconciler::new(environment_id, store, refetcher, &config);
    tokio::spawn(async move { reconciler.run(handle, client, manager).await })
}
