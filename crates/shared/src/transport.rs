//! Channels between the three contexts.
//!
//! The page channel is a broadcast of untyped JSON: every listener on the page,
//! including the sender itself and any third-party script, sees every message. The
//! runtime channel between relay and coordinator is a one-way, fire-and-forget port.

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{Request, ResponseEnvelope};

const PAGE_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct PageBus {
    tx: broadcast::Sender<Value>,
}

impl PageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PAGE_BUS_CAPACITY);
        Self { tx }
    }

    /// Posts a message to every current listener. Posting with no listener is not an
    /// error: the message is simply lost.
    pub fn post(&self, message: Value) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }
}

impl Default for PageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, origin-stamped request on its way to the coordinator, together with
/// the port its reply goes back through.
#[derive(Debug)]
pub struct RelayedRequest {
    pub request: Request,
    pub reply_to: ReplyPort,
}

#[derive(Debug, Clone)]
pub struct ReplyPort {
    tx: mpsc::UnboundedSender<ResponseEnvelope>,
}

impl ReplyPort {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResponseEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false when the relay on the other side is gone.
    pub fn send(&self, response: ResponseEnvelope) -> bool {
        self.tx.send(response).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorPort {
    tx: mpsc::UnboundedSender<RelayedRequest>,
}

impl CoordinatorPort {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayedRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false when the coordinator is gone and the request was dropped.
    pub fn send(&self, relayed: RelayedRequest) -> bool {
        self.tx.send(relayed).is_ok()
    }
}
