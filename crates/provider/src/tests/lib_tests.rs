use super::*;
use serde_json::json;
use shared::{
    error::ErrorCode,
    protocol::{ApprovalOutcome, RequestEnvelope, ResponseEnvelope},
};

/// Answers every page request with `reply`, posting it `copies` times.
fn spawn_fake_relay<F>(bus: PageBus, copies: usize, reply: F) -> JoinHandle<()>
where
    F: Fn(&RequestEnvelope) -> ApprovalOutcome + Send + 'static,
{
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(message) = rx.recv().await {
            if source_tag(&message) != Some(SourceTag::DappRequest) {
                continue;
            }
            let Ok(envelope) = serde_json::from_value::<RequestEnvelope>(message) else {
                continue;
            };
            let response = ResponseEnvelope::from_outcome(envelope.kind, reply(&envelope));
            for _ in 0..copies {
                bus.post(serde_json::to_value(RelayMessage::new(response.clone())).expect("json"));
            }
        }
    })
}

fn approve_everything(envelope: &RequestEnvelope) -> ApprovalOutcome {
    let result = match envelope.kind {
        RequestKind::Connect => json!({ "address": "oct1abc", "permissions": ["view_address"] }),
        RequestKind::Disconnect => json!({ "disconnected": true }),
        _ => json!({ "txHash": "0xfeed" }),
    };
    ApprovalOutcome::approved(envelope.request_id, result)
}

#[tokio::test]
async fn connect_updates_provider_state_and_emits_event() {
    let bus = PageBus::new();
    let _relay = spawn_fake_relay(bus.clone(), 1, approve_everything);
    let provider = WalletProvider::new(bus);
    let mut events = provider.subscribe_events();

    let connected = provider
        .connect(ConnectRequest {
            permissions: vec!["view_address".into()],
            ..Default::default()
        })
        .await
        .expect("connect");

    assert_eq!(connected.address, "oct1abc");
    assert_eq!(connected.permissions, vec!["view_address".to_string()]);
    assert!(provider.is_connected().await);
    assert_eq!(provider.selected_address().await.as_deref(), Some("oct1abc"));
    assert_eq!(provider.permissions().await, vec!["view_address".to_string()]);
    assert_eq!(events.recv().await.expect("event").name(), "connect");
}

#[tokio::test]
async fn duplicated_relay_replies_settle_once() {
    let bus = PageBus::new();
    let _relay = spawn_fake_relay(bus.clone(), 3, approve_everything);
    let provider = WalletProvider::new(bus);
    let mut events = provider.subscribe_events();

    let result = provider
        .send_transaction(TransactionRequest {
            to: "oct1xyz".into(),
            amount: "10".into(),
            message: None,
        })
        .await
        .expect("transaction");
    assert_eq!(result, json!({ "txHash": "0xfeed" }));

    tokio::task::yield_now().await;
    assert_eq!(events.recv().await.expect("event").name(), "transaction");
    assert!(events.try_recv().is_err());
    assert_eq!(provider.store().pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn replies_without_relay_tag_are_ignored() {
    let bus = PageBus::new();
    let provider = WalletProvider::new(bus.clone());
    let (id, outcome) = provider
        .store()
        .issue(RequestPayload::SignMessage(SignMessageRequest {
            message: "hello".into(),
        }))
        .await;

    let mut spoofed = serde_json::to_value(ResponseEnvelope::from_outcome(
        RequestKind::SignMessage,
        ApprovalOutcome::approved(id, json!("0xsig")),
    ))
    .expect("json");
    spoofed["source"] = json!("dapp-request");
    bus.post(spoofed.clone());
    spoofed
        .as_object_mut()
        .expect("object")
        .remove("source");
    bus.post(spoofed);
    bus.post(json!({ "source": "wallet-relay", "garbage": true }));

    let err = outcome.await.expect_err("only the timeout can settle it");
    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(err.message, "Sign message request timeout");
}

#[tokio::test]
async fn disconnect_clears_state_and_emits_event() {
    let bus = PageBus::new();
    let _relay = spawn_fake_relay(bus.clone(), 1, approve_everything);
    let provider = WalletProvider::new(bus);
    provider
        .connect(ConnectRequest::default())
        .await
        .expect("connect");
    let mut events = provider.subscribe_events();

    provider.disconnect().await.expect("disconnect");

    assert!(!provider.is_connected().await);
    assert_eq!(events.recv().await.expect("event"), ProviderEvent::Disconnect);
}

#[tokio::test]
async fn rejected_connect_leaves_provider_disconnected() {
    let bus = PageBus::new();
    let _relay = spawn_fake_relay(bus.clone(), 1, |envelope| {
        ApprovalOutcome::rejected(envelope.request_id, &WalletError::user_rejected(None))
    });
    let provider = WalletProvider::new(bus);
    let mut events = provider.subscribe_events();

    let err = provider
        .connect(ConnectRequest::default())
        .await
        .expect_err("rejected");

    assert_eq!(err.code, ErrorCode::UserRejected);
    assert!(!provider.is_connected().await);
    assert_eq!(events.recv().await.expect("event").name(), "userRejectedRequest");
}

#[tokio::test]
async fn malformed_connect_result_is_reported() {
    let bus = PageBus::new();
    let _relay = spawn_fake_relay(bus.clone(), 1, |envelope| {
        ApprovalOutcome::approved(envelope.request_id, json!({ "unexpected": 1 }))
    });
    let provider = WalletProvider::new(bus);

    let err = provider
        .connect(ConnectRequest::default())
        .await
        .expect_err("malformed");
    assert_eq!(err.code, ErrorCode::Unknown);
    assert!(!provider.is_connected().await);
}

#[tokio::test]
async fn connect_issued_outside_the_api_still_updates_state() {
    let bus = PageBus::new();
    let _relay = spawn_fake_relay(bus.clone(), 1, approve_everything);
    let provider = WalletProvider::new(bus);
    let mut events = provider.subscribe_events();

    let (_, outcome) = provider
        .store()
        .issue(RequestPayload::Connect(ConnectRequest::default()))
        .await;
    drop(outcome);

    assert_eq!(events.recv().await.expect("event").name(), "connect");
    assert!(provider.is_connected().await);
    assert_eq!(provider.selected_address().await.as_deref(), Some("oct1abc"));
}
