use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use coordinator::{
    config::{load_settings, Settings},
    surface::{SignalBus, SurfaceHandle, SurfaceLauncher, SurfaceSignal},
    Coordinator,
};
use provider::WalletProvider;
use relay::Relay;
use serde_json::json;
use shared::{
    domain::{Origin, RequestId},
    protocol::{
        ConnectRequest, ContractCallRequest, MethodType, Request, RequestKind, TransactionRequest,
    },
    surface::SurfaceState,
    transport::{CoordinatorPort, PageBus},
};
use storage::{KeyValueStore, MemoryStore, SqliteStore};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

const PAGE_URL: &str = "https://dapp.example/swap";
const SANDBOX_ADDRESS: &str = "oct1sandbox";
const DECISION_DELAY: Duration = Duration::from_millis(250);

/// Stands in for a human: approves everything shortly after it is shown. Only
/// connects fit the inline prompt; everything else goes to the full surface.
struct AutoApprover {
    signals: SignalBus,
    next_handle: AtomicU64,
}

impl AutoApprover {
    fn decide_later(&self, request_id: RequestId, origin: Origin, kind: RequestKind) {
        let result = match kind {
            RequestKind::Connect => json!({ "address": SANDBOX_ADDRESS }),
            _ => json!({ "txHash": format!("0x{}", Uuid::new_v4().simple()) }),
        };
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DECISION_DELAY).await;
            signals.send(SurfaceSignal {
                request_id,
                origin,
                approved: true,
                result: Some(result),
                error: None,
            });
        });
    }
}

#[async_trait]
impl SurfaceLauncher for AutoApprover {
    async fn open_inline(&self, request: &Request) -> Result<()> {
        if request.kind() != RequestKind::Connect {
            bail!("inline prompt needs a user gesture");
        }
        info!(request_id = %request.id, "sandbox: inline prompt shown");
        self.decide_later(request.id, request.origin.clone(), request.kind());
        Ok(())
    }

    async fn open_surface(&self, url: &Url, state: &SurfaceState) -> Result<SurfaceHandle> {
        info!(%url, "sandbox: approval surface opened");
        let request_id: RequestId = state
            .get("requestId")
            .context("surface state has no request id")?
            .parse()
            .context("surface state has a malformed request id")?;
        let origin = Origin::from_page_url(state.get("origin").context("surface state has no origin")?)?;
        let kind = match state.get("action") {
            Some("connect") => RequestKind::Connect,
            Some("contractCall") => RequestKind::ContractCall,
            _ => RequestKind::Transaction,
        };
        self.decide_later(request_id, origin, kind);
        Ok(SurfaceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    async fn closed(&self, _handle: SurfaceHandle) {
        std::future::pending::<()>().await
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn KeyValueStore>> {
    if settings.database_url.starts_with("sqlite::memory:") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::new(&settings.database_url).await?;
    store.health_check().await?;
    Ok(Arc::new(store))
}

async fn run_scenario(provider: &WalletProvider) -> Result<()> {
    let connected = provider
        .connect(ConnectRequest {
            permissions: vec!["view_address".into()],
            app_name: Some("Sandbox Swap".into()),
            app_icon: None,
        })
        .await?;
    info!(address = %connected.address, permissions = ?connected.permissions, "sandbox: connected");

    let receipt = provider
        .send_transaction(TransactionRequest {
            to: "oct1xyz".into(),
            amount: "10".into(),
            message: Some("sandbox transfer".into()),
        })
        .await?;
    info!(%receipt, "sandbox: transaction approved");

    let call = provider
        .call_contract(ContractCallRequest {
            contract_address: "oct1contract".into(),
            method_name: "stake".into(),
            method_type: MethodType::Call,
            params: vec![json!(SANDBOX_ADDRESS), json!(5)],
            gas_limit: Some(21000),
            gas_price: None,
            value: None,
            description: Some("Stake 5 OCT".into()),
        })
        .await?;
    info!(%call, "sandbox: contract call approved");

    if let Err(err) = provider.get_balance(None).await {
        info!(code = ?err.code, %err, "sandbox: balance request failed as expected");
    }

    provider.disconnect().await?;
    match provider
        .send_transaction(TransactionRequest {
            to: "oct1xyz".into(),
            amount: "1".into(),
            message: None,
        })
        .await
    {
        Ok(receipt) => warn!(%receipt, "sandbox: transaction went through after disconnect"),
        Err(err) => info!(code = ?err.code, %err, "sandbox: transaction refused after disconnect"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    info!(database_url = %settings.database_url, surface_url = %settings.surface_url, "sandbox: settings loaded");

    let store = open_store(&settings).await?;
    let signals = SignalBus::new();
    let launcher = AutoApprover {
        signals: signals.clone(),
        next_handle: AtomicU64::new(1),
    };
    let coordinator = Arc::new(Coordinator::from_settings(
        store,
        Arc::new(launcher),
        signals,
        &settings,
    ));

    let mut snapshots = Box::pin(coordinator.registry().watch());
    tokio::spawn(async move {
        while let Some(connections) = snapshots.next().await {
            let origins: Vec<_> = connections
                .iter()
                .map(|connection| connection.origin.to_string())
                .collect();
            info!(?origins, "sandbox: connection registry changed");
        }
    });

    let bus = PageBus::new();
    let (port, port_rx) = CoordinatorPort::channel();
    let _runner = coordinator.clone().run(port_rx);
    let _relay = Relay::new(PAGE_URL, bus.clone(), port)?.spawn();
    let provider = WalletProvider::with_timeouts(bus, settings.timeout_policy());

    run_scenario(&provider).await?;

    info!("sandbox: scenario finished; coordinator stays up until ctrl-c");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}
