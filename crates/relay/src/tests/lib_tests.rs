use super::*;
use serde_json::json;
use shared::{
    domain::RequestId,
    error::ErrorCode,
    protocol::{ApprovalOutcome, RequestKind, RequestPayload},
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const PAGE_URL: &str = "https://dapp.example/swap?pair=oct";

fn start() -> (PageBus, mpsc::UnboundedReceiver<RelayedRequest>, JoinHandle<()>) {
    let bus = PageBus::new();
    let (port, coordinator_rx) = CoordinatorPort::channel();
    let relay = Relay::new(PAGE_URL, bus.clone(), port).expect("relay");
    assert_eq!(relay.origin().as_str(), "https://dapp.example");
    (bus, coordinator_rx, relay.spawn())
}

async fn next_relay_message(rx: &mut broadcast::Receiver<Value>) -> RelayMessage {
    loop {
        let message = rx.recv().await.expect("page message");
        if source_tag(&message) == Some(SourceTag::WalletRelay) {
            return serde_json::from_value(message).expect("relay message");
        }
    }
}

#[tokio::test]
async fn forwards_requests_stamped_with_relay_origin() {
    let (bus, mut coordinator_rx, _relay) = start();
    let id = RequestId::new();

    bus.post(json!({
        "source": "dapp-request",
        "type": "transaction",
        "requestId": id.to_string(),
        "origin": "https://bank.example",
        "data": { "to": "oct1xyz", "amount": "10", "origin": "https://bank.example" }
    }));

    let relayed = coordinator_rx.recv().await.expect("forwarded");
    assert_eq!(relayed.request.id, id);
    assert_eq!(relayed.request.origin.as_str(), "https://dapp.example");
    assert_eq!(relayed.request.kind(), RequestKind::Transaction);
}

#[tokio::test(start_paused = true)]
async fn ignores_messages_without_page_tag() {
    let (bus, mut coordinator_rx, _relay) = start();
    let data = json!({ "to": "oct1xyz", "amount": "10" });

    bus.post(json!({ "type": "transaction", "requestId": RequestId::new().to_string(), "data": data }));
    bus.post(json!({
        "source": "wallet-relay",
        "type": "transaction",
        "requestId": RequestId::new().to_string(),
        "data": data
    }));
    bus.post(json!({ "source": "someone-else", "hello": "world" }));
    bus.post(json!("not even an object"));

    let next = tokio::time::timeout(Duration::from_secs(1), coordinator_rx.recv()).await;
    assert!(next.is_err(), "nothing should reach the coordinator");
}

#[tokio::test]
async fn invalid_data_fails_fast_without_reaching_coordinator() {
    let (bus, mut coordinator_rx, _relay) = start();
    let mut page = bus.subscribe();
    let id = RequestId::new();

    bus.post(json!({
        "source": "dapp-request",
        "type": "contractCall",
        "requestId": id.to_string(),
        "data": { "methodName": "stake" }
    }));

    let reply = next_relay_message(&mut page).await;
    assert_eq!(reply.response.request_id, id);
    assert!(!reply.response.success);
    assert_eq!(reply.response.code, Some(ErrorCode::InvalidRequest));
    assert!(coordinator_rx.try_recv().is_err());
}

#[tokio::test]
async fn coordinator_replies_are_posted_under_relay_tag() {
    let (bus, mut coordinator_rx, _relay) = start();
    let mut page = bus.subscribe();
    let id = RequestId::new();
    let payload = RequestPayload::from_data(RequestKind::Connect, json!({})).expect("payload");
    bus.post(serde_json::to_value(RequestEnvelope::new(id, &payload)).expect("json"));

    let relayed = coordinator_rx.recv().await.expect("forwarded");
    let outcome = ApprovalOutcome::approved(
        id,
        json!({ "address": "oct1abc", "permissions": ["view_address"] }),
    );
    assert!(relayed
        .reply_to
        .send(ResponseEnvelope::from_outcome(RequestKind::Connect, outcome)));

    let reply = next_relay_message(&mut page).await;
    assert_eq!(reply.source, SourceTag::WalletRelay);
    assert_eq!(reply.response.request_id, id);
    assert!(reply.response.success);
}

#[tokio::test(start_paused = true)]
async fn missing_coordinator_drops_request_silently() {
    let bus = PageBus::new();
    let (port, coordinator_rx) = CoordinatorPort::channel();
    drop(coordinator_rx);
    let _relay = Relay::new(PAGE_URL, bus.clone(), port).expect("relay").spawn();
    let mut page = bus.subscribe();

    let payload = RequestPayload::from_data(RequestKind::Disconnect, Value::Null).expect("payload");
    bus.post(serde_json::to_value(RequestEnvelope::new(RequestId::new(), &payload)).expect("json"));

    let own_post = page.recv().await.expect("own post");
    assert_eq!(source_tag(&own_post), Some(SourceTag::DappRequest));
    let next = tokio::time::timeout(Duration::from_secs(5), page.recv()).await;
    assert!(next.is_err(), "no reply is synthesized by the relay");
}

#[test]
fn relay_requires_a_tuple_origin() {
    let (port, _rx) = CoordinatorPort::channel();
    assert!(Relay::new("about:blank", PageBus::new(), port).is_err());
}
