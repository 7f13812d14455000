use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bridge_observability::{emit_event, SyncComponent, SyncEvent};
use bridge_types::SessionKey;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::client::BridgeClient;
use crate::store::SessionStore;

struct PendingFetch {
    generation: u64,
    deadline: Instant,
    session_key: SessionKey,
    cancel: CancellationToken,
}

struct InFlightFetch {
    sequence: u64,
    cancel: CancellationToken,
}

struct RefetchInner {
    environment_id: String,
    client: Arc<dyn BridgeClient>,
    store: SessionStore,
    debounce: Duration,
    parent: CancellationToken,
    pending: Mutex<HashMap<String, PendingFetch>>,
    next_generation: AtomicU64,
    in_flight: Mutex<HashMap<String, InFlightFetch>>,
    /// Sequence of the newest fetch written per session. Held across the
    /// store writes so an older fetch can never land after a newer one.
    applied: tokio::sync::Mutex<HashMap<String, u64>>,
    next_sequence: AtomicU64,
}

/// Coalesces bursts of content-change signals into one message fetch per
/// session. One instance lives for one subscription; every timer it spawns is
/// a child of that subscription's cancellation token.
#[derive(Clone)]
pub struct DebouncedRefetcher {
    inner: Arc<RefetchInner>,
}

impl DebouncedRefetcher {
    pub fn new(
        environment_id: impl Into<String>,
        client: Arc<dyn BridgeClient>,
        store: SessionStore,
        debounce: Duration,
        parent: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RefetchInner {
                environment_id: environment_id.into(),
                client,
                store,
                debounce,
                parent,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                applied: tokio::sync::Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingFetch>> {
        self.inner.pending()
    }

    /// Requests a refresh of `session_id`.
    ///
    /// Non-immediate calls share one trailing timer whose deadline is fixed by
    /// the first call of the burst; later calls only replace the session key
    /// the fetch falls back to. Immediate calls drop any pending timer, cancel
    /// a timer fetch that is still waiting on the server, and fetch before
    /// returning.
    pub async fn schedule(&self, session_id: &str, session_key: &SessionKey, immediate: bool) {
        if self.inner.parent.is_cancelled() {
            return;
        }
        if immediate {
            let previous = self.pending().remove(session_id);
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            let running = self.inner.in_flight().remove(session_id);
            if let Some(running) = running {
                running.cancel.cancel();
            }
            let cancel = self.inner.parent.child_token();
            self.inner.fetch(session_id, session_key, &cancel).await;
            return;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.inner.parent.child_token();
        let deadline = {
            let mut pending = self.pending();
            let deadline = match pending.remove(session_id) {
                Some(previous) => {
                    previous.cancel.cancel();
                    previous.deadline
                }
                None => Instant::now() + self.inner.debounce,
            };
            pending.insert(
                session_id.to_string(),
                PendingFetch {
                    generation,
                    deadline,
                    session_key: session_key.clone(),
                    cancel: cancel.clone(),
                },
            );
            deadline
        };

        let refetcher = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            let session_key = {
                let mut pending = refetcher.pending();
                let current = pending
                    .get(&session_id)
                    .is_some_and(|slot| slot.generation == generation);
                if current {
                    pending.remove(&session_id).map(|slot| slot.session_key)
                } else {
                    None
                }
            };
            if let Some(session_key) = session_key {
                refetcher.inner.fetch(&session_id, &session_key, &cancel).await;
            }
        });
    }

    /// Discards every pending timer without flushing it.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingFetch> = self.pending().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.cancel.cancel();
        }
    }

    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending().contains_key(session_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

impl RefetchInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingFetch>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlightFetch>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fetch(
        &self,
        session_id: &str,
        fallback_key: &SessionKey,
        cancel: &CancellationToken,
    ) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.in_flight().insert(
            session_id.to_string(),
            InFlightFetch {
                sequence,
                cancel: cancel.clone(),
            },
        );
        let result = self.client.get_session_messages(session_id).await;
        {
            let mut in_flight = self.in_flight();
            if in_flight
                .get(session_id)
                .is_some_and(|running| running.sequence == sequence)
            {
                in_flight.remove(session_id);
            }
        }

        let fetched = match result {
            Ok(messages) => messages,
            Err(err) if err.is_session_not_found() => {
                tracing::warn!(
                    "Session {} no longer exists on the bridge; keeping local state",
                    session_id
                );
                return;
            }
            Err(err) => {
                tracing::warn!("Failed to refetch messages for {}: {}", session_id, err);
                return;
            }
        };
        // Covers teardown as well as being superseded by an immediate fetch.
        if cancel.is_cancelled() {
            tracing::debug!("Discarding cancelled refetch of {}", session_id);
            return;
        }

        let mut applied = self.applied.lock().await;
        if applied.get(session_id).is_some_and(|newest| *newest > sequence) {
            tracing::debug!("Discarding stale refetch of {}", session_id);
            return;
        }
        applied.insert(session_id.to_string(), sequence);

        let mut keys = self
            .store
            .keys_for_session(&self.environment_id, session_id)
            .await;
        if keys.is_empty() {
            keys.push(fallback_key.clone());
        }
        let count = fetched.len().to_string();
        for key in &keys {
            self.store.apply_server_messages(key, fetched.clone()).await;
        }
        drop(applied);
        emit_event(
            Level::DEBUG,
            SyncEvent::new(SyncComponent::Refetcher, "refetch.applied")
                .environment(&self.environment_id)
                .session(session_id)
                .detail(&count),
        );
    }
}
