//! Integration test: chat over a real cable connection (gateway + CableClient + Subscription).

use futures_util::{SinkExt, StreamExt};
use lib::channels::Broadcaster;
use lib::client::{CableClient, CableHandle};
use lib::config::{Config, Environment};
use lib::dispatch::{Controller, DiagnosticsSink, Dispatcher, RouteTable, SinkError};
use lib::envelope::Envelope;
use lib::gateway::{router, GatewayState};
use lib::subscription::{PerformStatus, Subscription, SubscriptionState, TopicDescriptor, TransportEvent};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct Recorder {
    seen: Vec<Envelope>,
    rejected: bool,
}

impl Recorder {
    fn record(&mut self, env: &Envelope) {
        self.seen.push(env.clone());
    }
}

impl Controller for Recorder {
    fn name(&self) -> &str {
        "Recorder"
    }

    fn routes() -> RouteTable<Self> {
        RouteTable::new()
            .on("new-message", Recorder::record)
            .on("status-update", Recorder::record)
            .on("alert", Recorder::record)
    }

    fn rejected(&mut self) {
        self.rejected = true;
    }
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<Value>>>);

impl RecordingSink {
    fn records(&self) -> Vec<Value> {
        self.0.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn report(&self, record: &Value) -> Result<(), SinkError> {
        self.0
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .push(record.clone());
        Ok(())
    }
}

type ChatSub = Subscription<Recorder, CableHandle>;

async fn start_gateway() -> (String, Arc<Broadcaster>) {
    let mut state = GatewayState::new(Config::default()).await;
    state.environment = Environment::Test;
    let broadcaster = state.broadcaster.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    (format!("ws://{}/cable", addr), broadcaster)
}

/// Poll until `done` holds for the broadcaster, failing after a few seconds.
async fn wait_for_topics(
    broadcaster: &Broadcaster,
    done: impl Fn(&[String], usize) -> bool,
    topic: &str,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let topics = broadcaster.topics().await;
        let receivers = broadcaster.receiver_count(topic).await;
        if done(&topics, receivers) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out: topics {:?}, {} receivers on {}",
            topics,
            receivers,
            topic
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn join(
    url: &str,
    user: &str,
    chat_id: &str,
    sink: RecordingSink,
) -> (CableClient, UnboundedReceiver<TransportEvent>, ChatSub) {
    let (client, mut events) = CableClient::connect(&format!("{}?user={}", url, user))
        .await
        .expect("connect");
    let mut sub = Subscription::new(Recorder::default(), Dispatcher::new().with_sink(Arc::new(sink)));
    let topic = TopicDescriptor::new("ChatChannel").param("chat_id", chat_id);
    assert!(sub.subscribe(&client, &topic).expect("subscribe"));
    pump_until(&mut sub, &mut events, |s| s.is_connected()).await;
    (client, events, sub)
}

async fn pump_until(
    sub: &mut ChatSub,
    events: &mut UnboundedReceiver<TransportEvent>,
    done: impl Fn(&ChatSub) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(sub) {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for a cable event")
            .expect("cable closed");
        sub.handle_event(&event);
    }
}

fn data(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn speak_reaches_every_chat_member() {
    let (url, _) = start_gateway().await;
    let (_ada_client, mut ada_events, mut ada) = join(&url, "ada", "42", RecordingSink::default()).await;
    let (_bob_client, mut bob_events, mut bob) = join(&url, "bob", "42", RecordingSink::default()).await;

    assert_eq!(ada.perform("speak", data(json!({"body": "hello"}))), PerformStatus::Sent);

    for (sub, events) in [(&mut ada, &mut ada_events), (&mut bob, &mut bob_events)] {
        pump_until(sub, events, |s| !s.controller().seen.is_empty()).await;
        let env = &sub.controller().seen[0];
        assert_eq!(env.typ(), "new-message");
        assert_eq!(env.get_str("user"), Some("ada"));
        assert_eq!(env.get_str("body"), Some("hello"));
    }
}

#[tokio::test]
async fn failing_action_reports_only_to_its_connection() {
    let (url, _) = start_gateway().await;
    let ada_sink = RecordingSink::default();
    let bob_sink = RecordingSink::default();
    let (_ada_client, mut ada_events, mut ada) = join(&url, "ada", "7", ada_sink.clone()).await;
    let (_bob_client, mut bob_events, mut bob) = join(&url, "bob", "7", bob_sink.clone()).await;

    ada.perform("send_alert", data(json!({"level": "bogus", "text": "disk full"})));
    pump_until(&mut ada, &mut ada_events, |_| !ada_sink.records().is_empty()).await;

    let records = ada_sink.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["type"], "actioncable");
    assert_eq!(record["controllerName"], "Recorder");
    assert_eq!(record["channel"], "ChatChannel");
    assert_eq!(record["action"], "send_alert");
    assert!(record["message"]
        .as_str()
        .is_some_and(|m| m.contains("invalid parameter level")));
    assert!(ada.controller().seen.is_empty());

    // A later broadcast reaches bob; the error before it never did.
    ada.perform("speak", data(json!({"body": "after"})));
    pump_until(&mut bob, &mut bob_events, |s| !s.controller().seen.is_empty()).await;
    assert_eq!(bob.controller().seen[0].get_str("body"), Some("after"));
    assert!(bob_sink.records().is_empty());
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    let (url, _) = start_gateway().await;
    let (client, mut events) = CableClient::connect(&format!("{}?user=ada", url))
        .await
        .expect("connect");
    let mut sub: ChatSub = Subscription::new(Recorder::default(), Dispatcher::new());
    sub.subscribe(&client, &TopicDescriptor::new("NopeChannel"))
        .expect("subscribe");
    assert_eq!(sub.state(), SubscriptionState::Connecting);
    pump_until(&mut sub, &mut events, |s| s.controller().rejected).await;
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    assert!(!sub.is_subscribed());
}

#[tokio::test]
async fn unsubscribe_releases_server_topic() {
    let (url, broadcaster) = start_gateway().await;
    let (ada_client, _ada_events, ada) = join(&url, "ada", "9", RecordingSink::default()).await;
    let (_bob_client, _bob_events, mut bob) = join(&url, "bob", "9", RecordingSink::default()).await;
    wait_for_topics(&broadcaster, |_, n| n == 2, "chat:9").await;

    bob.unsubscribe();
    bob.unsubscribe();
    assert_eq!(bob.perform("typing", Map::new()), PerformStatus::Dropped);
    wait_for_topics(&broadcaster, |_, n| n == 1, "chat:9").await;

    // Closing the last connection on the chat releases the topic itself.
    drop(ada);
    drop(ada_client);
    wait_for_topics(&broadcaster, |topics, _| !topics.iter().any(|t| t == "chat:9"), "chat:9").await;
}

#[tokio::test]
async fn duplicate_subscribe_ignores_identifier_key_order() {
    let (url, broadcaster) = start_gateway().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?user=ada", url))
        .await
        .expect("connect");

    let first = r#"{"channel":"ChatChannel","chat_id":"5"}"#;
    let second = r#"{"chat_id":"5","channel":"ChatChannel"}"#;
    for identifier in [first, second] {
        let cmd = json!({"command": "subscribe", "identifier": identifier});
        ws.send(Message::Text(cmd.to_string())).await.expect("send");
    }
    let speak = json!({
        "command": "message",
        "identifier": second,
        "data": json!({"action": "speak", "body": "once"}).to_string(),
    });
    ws.send(Message::Text(speak.to_string())).await.expect("send");

    let mut confirms = 0;
    let mut messages = 0;
    let window = tokio::time::Instant::now() + Duration::from_millis(500);
    while let Ok(Some(Ok(frame))) = tokio::time::timeout_at(window, ws.next()).await {
        let Message::Text(text) = frame else { continue };
        let frame: Value = serde_json::from_str(&text).expect("frame json");
        if frame["type"] == "confirm_subscription" {
            confirms += 1;
        }
        if frame["message"]["type"] == "new-message" {
            assert_eq!(frame["identifier"], first);
            messages += 1;
        }
    }
    assert_eq!(confirms, 1);
    assert_eq!(messages, 1);
    assert_eq!(broadcaster.receiver_count("chat:5").await, 1);
}
