use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bridge_observability::{emit_event, SyncComponent, SyncEvent};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::client::{BridgeClient, EventStream};
use crate::error::{Result, SyncError};

struct SubscriptionState {
    cancel: CancellationToken,
    ref_count: usize,
    generation: u64,
}

/// Ownership of the one live event stream of an environment, handed to the
/// caller whose `acquire` opened it.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    environment_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Opens the event feed. Nothing is requested until this is awaited, and
    /// delivery stops as soon as the handle is cancelled even if the transport
    /// keeps the connection open.
    pub async fn open(&self, client: &dyn BridgeClient) -> Result<EventStream> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let stream = client.subscribe_events(self.cancel.clone()).await?;
        let cancel = self.cancel.clone();
        Ok(stream
            .take_until(async move { cancel.cancelled().await })
            .boxed())
    }
}

/// Keeps at most one event subscription per environment and counts the tabs
/// sharing it. `acquire` and `release` serialize on one mutex that is never
/// held across an await.
#[derive(Default)]
pub struct EventSubscriptionManager {
    table: Mutex<HashMap<String, SubscriptionState>>,
    next_generation: AtomicU64,
}

impl EventSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, SubscriptionState>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers one more user of the environment's subscription. Returns a
    /// handle only when this call created the subscription; the caller must
    /// then open and drive the stream. Otherwise the existing stream is shared.
    pub fn acquire(&self, environment_id: &str) -> Option<SubscriptionHandle> {
        self.acquire_with_generation(environment_id).1
    }

    /// Like [`acquire`](Self::acquire), also reporting the generation the
    /// caller now holds a reference on.
    pub fn acquire_with_generation(
        &self,
        environment_id: &str,
    ) -> (u64, Option<SubscriptionHandle>) {
        let mut table = self.table();
        if let Some(state) = table.get_mut(environment_id) {
            if !state.cancel.is_cancelled() {
                state.ref_count += 1;
                tracing::debug!(
                    "Sharing event subscription for {} (refs={})",
                    environment_id,
                    state.ref_count
                );
                return (state.generation, None);
            }
            table.remove(environment_id);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        table.insert(
            environment_id.to_string(),
            SubscriptionState {
                cancel: cancel.clone(),
                ref_count: 1,
                generation,
            },
        );
        drop(table);

        emit_event(
            Level::INFO,
            SyncEvent::new(SyncComponent::Subscription, "subscription.acquired")
                .environment(environment_id),
        );
        let handle = SubscriptionHandle {
            environment_id: environment_id.to_string(),
            generation,
            cancel,
        };
        (generation, Some(handle))
    }

    /// Drops one user. The subscription is cancelled when the last one leaves.
    /// Returns true when this call tore it down.
    pub fn release(&self, environment_id: &str) -> bool {
        self.release_matching(environment_id, None)
    }

    /// Drops one user only if the live subscription is still `generation`.
    /// A reference on a subscription that already ended is simply forgotten.
    pub fn release_generation(&self, environment_id: &str, generation: u64) -> bool {
        self.release_matching(environment_id, Some(generation))
    }

    fn release_matching(&self, environment_id: &str, generation: Option<u64>) -> bool {
        let mut table = self.table();
        let Some(state) = table.get_mut(environment_id) else {
            return false;
        };
        if generation.is_some_and(|g| g != state.generation) {
            return false;
        }
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            return false;
        }
        if let Some(state) = table.remove(environment_id) {
            state.cancel.cancel();
        }
        drop(table);

        emit_event(
            Level::INFO,
            SyncEvent::new(SyncComponent::Subscription, "subscription.released")
                .environment(environment_id),
        );
        true
    }

    /// Final step of a subscription's consumer loop. Idempotent, and a no-op
    /// against a newer subscription that replaced this handle's one.
    pub fn teardown(&self, handle: &SubscriptionHandle) {
        handle.cancel.cancel();
        let mut table = self.table();
        let current = table
            .get(handle.environment_id())
            .is_some_and(|state| state.generation == handle.generation);
        if current {
            table.remove(handle.environment_id());
        }
    }

    pub fn has_active(&self, environment_id: &str) -> bool {
        self.table()
            .get(environment_id)
            .is_some_and(|state| !state.cancel.is_cancelled())
    }

    /// Generation of the live subscription, if any.
    pub fn generation(&self, environment_id: &str) -> Option<u64> {
        self.table()
            .get(environment_id)
            .filter(|state| !state.cancel.is_cancelled())
            .map(|state| state.generation)
    }

    pub fn ref_count(&self, environment_id: &str) -> usize {
        self.table()
            .get(environment_id)
            .map(|state| state.ref_count)
            .unwrap_or(0)
    }
}
