//! Page-side table of in-flight requests.
//!
//! Every issued request gets a pending entry holding its continuation and timeout
//! timer. The first terminal outcome for an id (reply, or timeout) removes the entry
//! and settles the caller's future; anything arriving later for that id finds no
//! entry and is ignored. Broadcast duplicates and stray replies are harmless this way.

use std::{
    collections::HashMap,
    future::IntoFuture,
    sync::{Arc, Weak},
};

use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;
use shared::{
    domain::RequestId,
    error::{ErrorCode, WalletError},
    protocol::{
        ApprovalOutcome, ConnectResult, RequestEnvelope, RequestKind, RequestPayload,
        ResponseEnvelope,
    },
    timeouts::TimeoutPolicy,
    transport::PageBus,
};
use tokio::{
    sync::{broadcast, oneshot, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::ProviderEvent;

const EVENT_CHANNEL_CAPACITY: usize = 256;

type Settle = oneshot::Sender<Result<Value, WalletError>>;

struct PendingEntry {
    kind: RequestKind,
    settle: Settle,
    timer: JoinHandle<()>,
}

/// The page's view of its wallet connection, kept in step with emitted events.
#[derive(Debug, Default, Clone)]
struct ConnectionState {
    selected_address: Option<String>,
    permissions: Vec<String>,
}

struct StoreInner {
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    connection: RwLock<ConnectionState>,
    events: broadcast::Sender<ProviderEvent>,
    bus: PageBus,
    timeouts: TimeoutPolicy,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for entry in self.pending.get_mut().values() {
            entry.timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct CorrelationStore {
    inner: Arc<StoreInner>,
}

impl CorrelationStore {
    pub fn new(bus: PageBus, timeouts: TimeoutPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                pending: Mutex::new(HashMap::new()),
                connection: RwLock::new(ConnectionState::default()),
                events,
                bus,
                timeouts,
            }),
        }
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.inner.timeouts
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a pending entry with its kind-specific timeout, posts the request on
    /// the page channel, and returns the outcome that will settle exactly once.
    pub async fn issue(&self, payload: RequestPayload) -> (RequestId, PendingOutcome) {
        let id = RequestId::new();
        let kind = payload.kind();
        let window = self.inner.timeouts.window(&payload);
        let (settle, rx) = oneshot::channel();

        // Registered before posting so a fast reply always finds its entry. The timer
        // is spawned under the lock so it cannot settle ahead of the insert.
        {
            let mut guard = self.inner.pending.lock().await;
            let weak = Arc::downgrade(&self.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                fire_timeout(weak, id, kind).await;
            });
            guard.insert(id, PendingEntry { kind, settle, timer });
        }

        let envelope = RequestEnvelope::new(id, &payload);
        match serde_json::to_value(&envelope) {
            Ok(message) => self.inner.bus.post(message),
            Err(err) => {
                let error = WalletError::invalid_request(format!("failed to encode request: {err}"));
                self.resolve(id, ApprovalOutcome::rejected(id, &error)).await;
            }
        }
        debug!(request_id = %id, kind = ?kind, window_secs = window.as_secs(), "provider: request issued");

        (id, PendingOutcome { id, rx })
    }

    /// Settles the pending entry for `id`. Unknown or already-settled ids are a silent
    /// no-op; returns whether this call had an effect.
    pub async fn resolve(&self, id: RequestId, outcome: ApprovalOutcome) -> bool {
        self.inner.settle(id, None, outcome).await
    }

    /// Settles from a relayed reply. A reply whose kind does not match the pending
    /// request's kind is treated as stray and leaves the entry in place.
    pub async fn resolve_response(&self, response: ResponseEnvelope) -> bool {
        let expected = response.kind.request_kind();
        self.inner
            .settle(response.request_id, Some(expected), response.outcome())
            .await
    }

    pub async fn selected_address(&self) -> Option<String> {
        self.inner.connection.read().await.selected_address.clone()
    }

    pub async fn permissions(&self) -> Vec<String> {
        self.inner.connection.read().await.permissions.clone()
    }

    pub async fn is_pending(&self, id: RequestId) -> bool {
        self.inner.pending.lock().await.contains_key(&id)
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

async fn fire_timeout(store: Weak<StoreInner>, id: RequestId, kind: RequestKind) {
    let Some(store) = store.upgrade() else {
        return;
    };
    let error = WalletError::timeout(kind);
    if store
        .settle(id, None, ApprovalOutcome::rejected(id, &error))
        .await
    {
        info!(request_id = %id, kind = ?kind, "provider: request timed out");
    }
}

impl StoreInner {
    async fn settle(
        &self,
        id: RequestId,
        expected_kind: Option<RequestKind>,
        outcome: ApprovalOutcome,
    ) -> bool {
        let entry = {
            let mut guard = self.pending.lock().await;
            match guard.get(&id) {
                None => {
                    debug!(request_id = %id, "provider: ignoring outcome for unknown or settled request");
                    return false;
                }
                Some(entry) if expected_kind.is_some_and(|kind| kind != entry.kind) => {
                    warn!(
                        request_id = %id,
                        pending_kind = ?entry.kind,
                        reply_kind = ?expected_kind,
                        "provider: ignoring reply of mismatched kind"
                    );
                    return false;
                }
                Some(_) => {}
            }
            guard.remove(&id)
        };
        let Some(entry) = entry else {
            return false;
        };

        let result = outcome.into_result();
        let event = event_for(id, entry.kind, &result);
        if let Some(event) = &event {
            self.track(event).await;
        }

        // No await past this point: when the timer itself is settling, aborting it
        // only takes effect at its next suspension.
        entry.timer.abort();
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        if entry.settle.send(result).is_err() {
            debug!(request_id = %id, "provider: outcome settled with no awaiting caller");
        }
        true
    }

    async fn track(&self, event: &ProviderEvent) {
        match event {
            ProviderEvent::Connect {
                address,
                permissions,
            } => {
                let mut connection = self.connection.write().await;
                connection.selected_address = Some(address.clone());
                connection.permissions = permissions.clone();
            }
            ProviderEvent::Disconnect => {
                *self.connection.write().await = ConnectionState::default();
            }
            _ => {}
        }
    }
}

fn event_for(
    id: RequestId,
    kind: RequestKind,
    result: &Result<Value, WalletError>,
) -> Option<ProviderEvent> {
    match result {
        Ok(value) => match kind {
            RequestKind::Connect => {
                match serde_json::from_value::<ConnectResult>(value.clone()) {
                    Ok(connected) => Some(ProviderEvent::Connect {
                        address: connected.address,
                        permissions: connected.permissions,
                    }),
                    Err(err) => {
                        warn!(request_id = %id, %err, "provider: connect result has unexpected shape");
                        None
                    }
                }
            }
            RequestKind::Transaction => Some(ProviderEvent::Transaction {
                request_id: id,
                result: value.clone(),
            }),
            RequestKind::ContractCall => Some(ProviderEvent::ContractCall {
                request_id: id,
                result: value.clone(),
            }),
            RequestKind::Disconnect => Some(ProviderEvent::Disconnect),
            RequestKind::Balance | RequestKind::SignMessage => None,
        },
        Err(err) if err.code == ErrorCode::UserRejected => {
            Some(ProviderEvent::UserRejectedRequest {
                request_id: id,
                kind,
                error: err.message.clone(),
            })
        }
        Err(_) => None,
    }
}

/// Outcome of an issued request; await it to get the result.
pub struct PendingOutcome {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, WalletError>>,
}

impl PendingOutcome {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl IntoFuture for PendingOutcome {
    type Output = Result<Value, WalletError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move {
            self.rx.await.unwrap_or_else(|_| {
                Err(WalletError::unknown("request was dropped before it settled"))
            })
        }
        .boxed()
    }
}
