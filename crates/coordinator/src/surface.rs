//! Seam between the coordinator and whatever renders approval prompts.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{Origin, RequestId},
    protocol::Request,
    surface::SurfaceState,
};
use tokio::sync::broadcast;
use url::Url;

const SIGNAL_BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

#[async_trait]
pub trait SurfaceLauncher: Send + Sync {
    /// Shows the request in the inline prompt. Fails when the prompt cannot be opened
    /// right now, e.g. without a direct user gesture.
    async fn open_inline(&self, request: &Request) -> Result<()>;

    /// Opens a dedicated approval surface at `url`, whose query carries `state`.
    async fn open_surface(&self, url: &Url, state: &SurfaceState) -> Result<SurfaceHandle>;

    /// Resolves once the surface is closed or destroyed. Must be cancel safe.
    async fn closed(&self, handle: SurfaceHandle);
}

/// Used when no approval UI is attached; every request surfaces as an error.
pub struct MissingSurfaceLauncher;

#[async_trait]
impl SurfaceLauncher for MissingSurfaceLauncher {
    async fn open_inline(&self, _request: &Request) -> Result<()> {
        Err(anyhow!("inline prompt unavailable"))
    }

    async fn open_surface(&self, _url: &Url, _state: &SurfaceState) -> Result<SurfaceHandle> {
        Err(anyhow!("approval surface unavailable"))
    }

    async fn closed(&self, _handle: SurfaceHandle) {}
}

/// The single terminal decision a surface sends for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSignal {
    pub request_id: RequestId,
    pub origin: Origin,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SurfaceSignal {
    pub fn approve(request: &Request, result: Value) -> Self {
        Self {
            request_id: request.id,
            origin: request.origin.clone(),
            approved: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn reject(request: &Request, error: Option<String>) -> Self {
        Self {
            request_id: request.id,
            origin: request.origin.clone(),
            approved: false,
            result: None,
            error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<SurfaceSignal>,
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_BUS_CAPACITY);
        Self { tx }
    }

    /// Signals nobody is waiting for are dropped.
    pub fn send(&self, signal: SurfaceSignal) {
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SurfaceSignal> {
        self.tx.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
