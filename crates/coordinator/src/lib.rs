//! The privileged side of the wallet: owns the connection registry, surfaces each
//! request for a human decision and turns that decision into exactly one reply.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::{Connection, RequestId},
    error::{ErrorCode, WalletError},
    protocol::{
        ApprovalOutcome, ConnectRequest, ConnectResult, Request, RequestPayload, ResponseEnvelope,
        DEFAULT_CONNECT_PERMISSION,
    },
    surface::SurfaceState,
    timeouts::TimeoutPolicy,
    transport::RelayedRequest,
};
use storage::{load_json, store_json, KeyValueStore};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod registry;
pub mod surface;

use config::Settings;
use registry::ConnectionRegistry;
use surface::{SignalBus, SurfaceLauncher, SurfaceSignal};

pub const STAGED_REQUEST_PREFIX: &str = "pendingRequest:";

/// Deadline used when a configured window does not fit in the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Surfaced,
    Approved,
    Rejected,
    TimedOut,
    AbandonedSurface,
    Failed,
}

impl RequestState {
    fn terminal(result: &Result<Value, WalletError>) -> Self {
        match result {
            Ok(_) => RequestState::Approved,
            Err(err) => match err.code {
                ErrorCode::UserRejected => RequestState::Rejected,
                ErrorCode::Timeout => RequestState::TimedOut,
                ErrorCode::SurfaceAbandoned => RequestState::AbandonedSurface,
                _ => RequestState::Failed,
            },
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Surfaced => "surfaced",
            RequestState::Approved => "approved",
            RequestState::Rejected => "rejected",
            RequestState::TimedOut => "timed_out",
            RequestState::AbandonedSurface => "abandoned_surface",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What an approving surface returns for a connect.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectApproval {
    address: String,
    #[serde(default)]
    permissions: Option<Vec<String>>,
}

pub struct Coordinator {
    store: Arc<dyn KeyValueStore>,
    registry: ConnectionRegistry,
    launcher: Arc<dyn SurfaceLauncher>,
    signals: SignalBus,
    timeouts: TimeoutPolicy,
    surface_url: String,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        launcher: Arc<dyn SurfaceLauncher>,
        signals: SignalBus,
        timeouts: TimeoutPolicy,
        surface_url: impl Into<String>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(store.clone()),
            store,
            launcher,
            signals,
            timeouts,
            surface_url: surface_url.into(),
        }
    }

    pub fn from_settings(
        store: Arc<dyn KeyValueStore>,
        launcher: Arc<dyn SurfaceLauncher>,
        signals: SignalBus,
        settings: &Settings,
    ) -> Self {
        Self::new(
            store,
            launcher,
            signals,
            settings.timeout_policy(),
            settings.surface_url.clone(),
        )
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Where approval surfaces deliver their decisions.
    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// The request an open surface is deciding on, while it is still undecided.
    pub async fn staged_request(&self, request_id: RequestId) -> anyhow::Result<Option<Request>> {
        load_json(self.store.as_ref(), &staged_key(request_id)).await
    }

    /// Serves relayed requests until the port closes, one task per request.
    pub fn run(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<RelayedRequest>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(RelayedRequest { request, reply_to }) = requests.recv().await {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    let request_id = request.id;
                    let response = coordinator.handle(request).await;
                    if !reply_to.send(response) {
                        debug!(request_id = %request_id, "coordinator: relay gone; reply dropped");
                    }
                });
            }
            debug!("coordinator: request port closed");
        })
    }

    /// Drives one request to its terminal state. Never fails: every error becomes a
    /// failed response.
    pub async fn handle(&self, request: Request) -> ResponseEnvelope {
        self.transition(&request, RequestState::Received);
        let result = self.process(&request).await;

        let state = RequestState::terminal(&result);
        match &result {
            Ok(_) => self.transition(&request, state),
            Err(err) => info!(
                request_id = %request.id,
                origin = %request.origin,
                kind = ?request.kind(),
                state = %state,
                code = ?err.code,
                error = %err,
                "coordinator: request finished"
            ),
        }

        ResponseEnvelope::from_outcome(
            request.kind(),
            ApprovalOutcome::from_result(request.id, result),
        )
    }

    async fn process(&self, request: &Request) -> Result<Value, WalletError> {
        request.payload.validate()?;

        match &request.payload {
            RequestPayload::Balance(_) | RequestPayload::SignMessage(_) => {
                Err(WalletError::not_implemented(request.kind()))
            }
            RequestPayload::Disconnect(_) => {
                let removed = self
                    .registry
                    .disconnect(&request.origin)
                    .await
                    .map_err(internal)?;
                debug!(request_id = %request.id, origin = %request.origin, removed, "coordinator: disconnect handled");
                Ok(json!({ "disconnected": true }))
            }
            RequestPayload::Connect(_)
            | RequestPayload::Transaction(_)
            | RequestPayload::ContractCall(_) => {
                let connection = self
                    .registry
                    .find(&request.origin)
                    .await
                    .map_err(internal)?;
                if request.kind().requires_connection() && connection.is_none() {
                    return Err(WalletError::not_connected());
                }

                let signal = self.surface(request, connection.as_ref()).await?;
                self.apply(request, signal).await
            }
        }
    }

    /// Stages the request, shows it and waits for the first terminal event. The staged
    /// record is cleared whatever the outcome.
    async fn surface(
        &self,
        request: &Request,
        connection: Option<&Connection>,
    ) -> Result<SurfaceSignal, WalletError> {
        // Subscribed before anything is shown so a fast decision cannot be missed.
        let mut signals = self.signals.subscribe();
        let deadline = deadline_after(self.timeouts.window(&request.payload));

        self.stage(request).await?;
        let decision = self
            .await_decision(request, connection, &mut signals, deadline)
            .await;
        self.unstage(request.id).await;
        decision
    }

    async fn await_decision(
        &self,
        request: &Request,
        connection: Option<&Connection>,
        signals: &mut broadcast::Receiver<SurfaceSignal>,
        deadline: Instant,
    ) -> Result<SurfaceSignal, WalletError> {
        let surface = match self.launcher.open_inline(request).await {
            Ok(()) => None,
            Err(err) => {
                debug!(request_id = %request.id, %err, "coordinator: inline prompt unavailable; opening approval surface");
                let state = SurfaceState::from_request(
                    request,
                    connection.and_then(|connection| connection.app_name.as_deref()),
                    connection.and_then(|connection| connection.app_icon.as_deref()),
                );
                let url = state.to_url(&self.surface_url)?;
                let handle = self
                    .launcher
                    .open_surface(&url, &state)
                    .await
                    .map_err(|err| internal(err.context("failed to open approval surface")))?;
                Some(handle)
            }
        };
        self.transition(request, RequestState::Surfaced);

        let closed = async {
            match surface {
                Some(handle) => self.launcher.closed(handle).await,
                None => std::future::pending::<()>().await,
            }
        };
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(closed, timeout);

        loop {
            // A decision that lands together with the surface closing still counts.
            tokio::select! {
                biased;
                signal = signals.recv() => match signal {
                    Ok(signal) if signal.request_id != request.id => {}
                    Ok(signal) if signal.origin != request.origin => {
                        warn!(
                            request_id = %request.id,
                            origin = %request.origin,
                            signal_origin = %signal.origin,
                            "coordinator: ignoring decision from another origin"
                        );
                    }
                    Ok(signal) => return Ok(signal),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(request_id = %request.id, skipped, "coordinator: signal bus lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(WalletError::unknown("approval signal bus closed"));
                    }
                },
                _ = &mut closed => return Err(WalletError::surface_abandoned()),
                _ = &mut timeout => return Err(WalletError::timeout(request.kind())),
            }
        }
    }

    async fn apply(&self, request: &Request, signal: SurfaceSignal) -> Result<Value, WalletError> {
        if !signal.approved {
            return Err(WalletError::user_rejected(signal.error));
        }
        match &request.payload {
            RequestPayload::Connect(connect) => {
                self.approve_connect(request, connect, signal.result).await
            }
            _ => {
                // The origin may have disconnected while the request was on screen.
                let still_connected = self
                    .registry
                    .find(&request.origin)
                    .await
                    .map_err(internal)?
                    .is_some();
                if request.kind().requires_connection() && !still_connected {
                    return Err(WalletError::not_connected());
                }
                Ok(signal.result.unwrap_or(Value::Null))
            }
        }
    }

    async fn approve_connect(
        &self,
        request: &Request,
        connect: &ConnectRequest,
        result: Option<Value>,
    ) -> Result<Value, WalletError> {
        let approval: ConnectApproval = serde_json::from_value(result.unwrap_or(Value::Null))
            .map_err(|err| WalletError::unknown(format!("malformed connect approval: {err}")))?;
        if approval.address.trim().is_empty() {
            return Err(WalletError::unknown("connect approval carried no address"));
        }

        // The surface may only narrow what the page asked for.
        let mut requested: BTreeSet<String> = connect
            .permissions
            .iter()
            .map(|permission| permission.trim().to_string())
            .filter(|permission| !permission.is_empty())
            .collect();
        if requested.is_empty() {
            requested.insert(DEFAULT_CONNECT_PERMISSION.to_string());
        }
        let granted: BTreeSet<String> = match approval.permissions {
            None => requested,
            Some(returned) => returned
                .into_iter()
                .map(|permission| permission.trim().to_string())
                .filter(|permission| requested.contains(permission))
                .collect(),
        };
        if granted.is_empty() {
            return Err(WalletError::unknown(
                "connect approval granted none of the requested permissions",
            ));
        }

        let candidate = Connection {
            origin: request.origin.clone(),
            selected_address: approval.address,
            permissions: granted,
            app_name: connect.app_name.clone(),
            app_icon: connect.app_icon.clone(),
            connected_at: Utc::now(),
        };
        let connection = self
            .registry
            .connect(candidate)
            .await
            .map_err(internal)?
            .into_connection();

        serde_json::to_value(ConnectResult {
            address: connection.selected_address,
            permissions: connection.permissions.into_iter().collect(),
        })
        .map_err(|err| WalletError::unknown(format!("failed to encode connect result: {err}")))
    }

    async fn stage(&self, request: &Request) -> Result<(), WalletError> {
        store_json(self.store.as_ref(), &staged_key(request.id), request)
            .await
            .map_err(internal)
    }

    async fn unstage(&self, request_id: RequestId) {
        if let Err(err) = self.store.remove(&staged_key(request_id)).await {
            warn!(request_id = %request_id, err = %format!("{err:#}"), "coordinator: failed to clear staged request");
        }
    }

    fn transition(&self, request: &Request, state: RequestState) {
        info!(
            request_id = %request.id,
            origin = %request.origin,
            kind = ?request.kind(),
            state = %state,
            "coordinator: request state changed"
        );
    }
}

fn deadline_after(window: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(window).unwrap_or_else(|| now + FAR_FUTURE)
}

fn staged_key(request_id: RequestId) -> String {
    format!("{STAGED_REQUEST_PREFIX}{request_id}")
}

fn internal(err: anyhow::Error) -> WalletError {
    error!(err = %format!("{err:#}"), "coordinator: collaborator failure");
    WalletError::unknown(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
