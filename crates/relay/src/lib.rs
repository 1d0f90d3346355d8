//! Forwarding between a page and the coordinator.
//!
//! The relay runs in the page's isolated context. It carries no business logic: it
//! accepts only messages tagged by the page provider, checks their shape against the
//! closed set of request kinds, stamps them with the page's real origin and hands them
//! to the coordinator. Replies come back through a reply port and are re-posted on the
//! page channel under the relay's own tag.

use serde_json::Value;
use shared::{
    domain::Origin,
    error::WalletError,
    protocol::{
        source_tag, RelayMessage, Request, RequestEnvelope, ResponseEnvelope, SourceTag,
    },
    transport::{CoordinatorPort, PageBus, RelayedRequest, ReplyPort},
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, trace, warn};

pub struct Relay {
    origin: Origin,
    page_bus: PageBus,
    coordinator: CoordinatorPort,
}

impl Relay {
    /// `page_url` is the location of the page this relay is attached to, as seen by
    /// the relay's own context.
    pub fn new(
        page_url: &str,
        page_bus: PageBus,
        coordinator: CoordinatorPort,
    ) -> Result<Self, WalletError> {
        Ok(Self {
            origin: Origin::from_page_url(page_url)?,
            page_bus,
            coordinator,
        })
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Starts forwarding in both directions; runs until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut page_rx = self.page_bus.subscribe();
        let (reply_to, mut replies) = ReplyPort::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = page_rx.recv() => match message {
                        Ok(message) => self.on_page_message(message, &reply_to),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(origin = %self.origin, skipped, "relay: page channel lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    Some(response) = replies.recv() => self.deliver(response),
                }
            }
            debug!(origin = %self.origin, "relay: page channel closed");
        })
    }

    fn on_page_message(&self, message: Value, reply_to: &ReplyPort) {
        match self.accept(message) {
            Accepted::Ignored => {}
            Accepted::Rejected(response) => self.deliver(response),
            Accepted::Request(request) => self.forward(request, reply_to),
        }
    }

    fn accept(&self, message: Value) -> Accepted {
        if source_tag(&message) != Some(SourceTag::DappRequest) {
            trace!(origin = %self.origin, "relay: skipping message not sent by the page provider");
            return Accepted::Ignored;
        }
        let envelope = match serde_json::from_value::<RequestEnvelope>(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(origin = %self.origin, %err, "relay: dropping malformed request");
                return Accepted::Ignored;
            }
        };
        let request_id = envelope.request_id;
        let kind = envelope.kind;
        match envelope.decode(self.origin.clone()) {
            Ok(request) => Accepted::Request(request),
            Err(err) => {
                warn!(origin = %self.origin, request_id = %request_id, %err, "relay: rejecting invalid request");
                Accepted::Rejected(ResponseEnvelope::failure(request_id, kind, &err))
            }
        }
    }

    /// Fire-and-forget: if the coordinator is gone the request is dropped and the
    /// page's own timeout is the only recovery.
    pub fn forward(&self, request: Request, reply_to: &ReplyPort) {
        let request_id = request.id;
        let kind = request.kind();
        let delivered = self.coordinator.send(RelayedRequest {
            request,
            reply_to: reply_to.clone(),
        });
        if delivered {
            debug!(origin = %self.origin, request_id = %request_id, kind = ?kind, "relay: forwarded request");
        } else {
            debug!(origin = %self.origin, request_id = %request_id, "relay: coordinator unavailable; request dropped");
        }
    }

    fn deliver(&self, response: ResponseEnvelope) {
        match serde_json::to_value(RelayMessage::new(response)) {
            Ok(message) => self.page_bus.post(message),
            Err(err) => warn!(origin = %self.origin, %err, "relay: failed to encode reply"),
        }
    }
}

enum Accepted {
    Ignored,
    Rejected(ResponseEnvelope),
    Request(Request),
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
