use serde_json::Value;
use shared::{
    domain::RequestId,
    error::WalletError,
    protocol::{
        source_tag, BalanceRequest, ConnectRequest, ConnectResult, ContractCallRequest,
        DisconnectRequest, RelayMessage, RequestKind, RequestPayload, SignMessageRequest,
        SourceTag, TransactionRequest,
    },
    timeouts::TimeoutPolicy,
    transport::PageBus,
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError},
    task::JoinHandle,
};
use tracing::{info, warn};

mod correlation;

pub use correlation::{CorrelationStore, PendingOutcome};

/// Public events a page can listen to without awaiting the originating call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Connect {
        address: String,
        permissions: Vec<String>,
    },
    Transaction {
        request_id: RequestId,
        result: Value,
    },
    ContractCall {
        request_id: RequestId,
        result: Value,
    },
    Disconnect,
    UserRejectedRequest {
        request_id: RequestId,
        kind: RequestKind,
        error: String,
    },
}

impl ProviderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderEvent::Connect { .. } => "connect",
            ProviderEvent::Transaction { .. } => "transaction",
            ProviderEvent::ContractCall { .. } => "contractCall",
            ProviderEvent::Disconnect => "disconnect",
            ProviderEvent::UserRejectedRequest { .. } => "userRejectedRequest",
        }
    }
}

/// The wallet API exposed to a page. Connection state follows the connect and
/// disconnect events, whoever issued the request.
pub struct WalletProvider {
    store: CorrelationStore,
    listener: JoinHandle<()>,
}

impl WalletProvider {
    pub fn new(bus: PageBus) -> Self {
        Self::with_timeouts(bus, TimeoutPolicy::default())
    }

    pub fn with_timeouts(bus: PageBus, timeouts: TimeoutPolicy) -> Self {
        let store = CorrelationStore::new(bus.clone(), timeouts);
        let listener = tokio::spawn(run_response_listener(bus.subscribe(), store.clone()));
        Self { store, listener }
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.store.subscribe_events()
    }

    pub async fn is_connected(&self) -> bool {
        self.store.selected_address().await.is_some()
    }

    pub async fn selected_address(&self) -> Option<String> {
        self.store.selected_address().await
    }

    pub async fn permissions(&self) -> Vec<String> {
        self.store.permissions().await
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectResult, WalletError> {
        let value = self.request(RequestPayload::Connect(request)).await?;
        let connected: ConnectResult = serde_json::from_value(value).map_err(|err| {
            WalletError::unknown(format!("wallet returned a malformed connect result: {err}"))
        })?;
        info!(address = %connected.address, "provider: connected");
        Ok(connected)
    }

    pub async fn disconnect(&self) -> Result<(), WalletError> {
        self.request(RequestPayload::Disconnect(DisconnectRequest {}))
            .await?;
        info!("provider: disconnected");
        Ok(())
    }

    pub async fn send_transaction(&self, request: TransactionRequest) -> Result<Value, WalletError> {
        self.request(RequestPayload::Transaction(request)).await
    }

    pub async fn call_contract(&self, request: ContractCallRequest) -> Result<Value, WalletError> {
        self.request(RequestPayload::ContractCall(request)).await
    }

    pub async fn get_balance(&self, address: Option<String>) -> Result<Value, WalletError> {
        self.request(RequestPayload::Balance(BalanceRequest { address }))
            .await
    }

    pub async fn sign_message(&self, message: impl Into<String>) -> Result<Value, WalletError> {
        self.request(RequestPayload::SignMessage(SignMessageRequest {
            message: message.into(),
        }))
        .await
    }

    async fn request(&self, payload: RequestPayload) -> Result<Value, WalletError> {
        let (_, outcome) = self.store.issue(payload).await;
        outcome.await
    }
}

impl Drop for WalletProvider {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Feeds relay replies seen on the page channel into the correlation store. Anything
/// not tagged by the relay (including this page's own requests) is skipped.
async fn run_response_listener(mut rx: broadcast::Receiver<Value>, store: CorrelationStore) {
    loop {
        match rx.recv().await {
            Ok(message) => {
                if source_tag(&message) != Some(SourceTag::WalletRelay) {
                    continue;
                }
                match serde_json::from_value::<RelayMessage>(message) {
                    Ok(relayed) => {
                        store.resolve_response(relayed.response).await;
                    }
                    Err(err) => warn!(%err, "provider: ignoring malformed relay message"),
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "provider: page channel lagged; replies may have been lost")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/correlation_tests.rs"]
mod correlation_tests;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
