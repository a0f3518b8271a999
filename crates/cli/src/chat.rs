//! Interactive chat: a `ChatController` subscribed to one chat over the cable.

use lib::client::CableClient;
use lib::dispatch::{Controller, DiagnosticsSink, Dispatcher, JsonlSink, LogSink, RouteTable};
use lib::envelope::Envelope;
use lib::subscription::{PerformStatus, Subscription, TopicDescriptor, TransportEvent};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const CHAT_CHANNEL: &str = "ChatChannel";

/// Input gate: closed while a message is in flight, reopened by the dispatcher's
/// recovery hook on the next inbound envelope.
#[derive(Debug)]
pub struct ControlLatch {
    enabled: AtomicBool,
}

impl Default for ControlLatch {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }
}

impl ControlLatch {
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Prints chat traffic to stdout.
pub struct ChatController {
    user: String,
    latch: Option<Arc<ControlLatch>>,
}

impl ChatController {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            latch: None,
        }
    }

    /// Reopen `latch` when the server refuses the subscription; no reply will come.
    pub fn with_latch(mut self, latch: Arc<ControlLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    fn speaker<'a>(&self, env: &'a Envelope) -> &'a str {
        env.get_str("user").unwrap_or("someone")
    }

    fn handle_new_message(&mut self, env: &Envelope) {
        let who = self.speaker(env);
        let who = if who == self.user { "you" } else { who };
        println!("< {}: {}", who, env.get_str("body").unwrap_or_default());
    }

    fn handle_status_update(&mut self, env: &Envelope) {
        let who = self.speaker(env);
        if who != self.user {
            println!("* {} is {}", who, env.get_str("status").unwrap_or("typing"));
        }
    }

    fn handle_alert(&mut self, env: &Envelope) {
        println!(
            "! [{}] {} ({})",
            env.get_str("level").unwrap_or("info"),
            env.get_str("text").unwrap_or_default(),
            self.speaker(env)
        );
    }
}

impl Controller for ChatController {
    fn name(&self) -> &str {
        "ChatController"
    }

    fn routes() -> RouteTable<Self> {
        RouteTable::new()
            .on("new-message", Self::handle_new_message)
            .on("status-update", Self::handle_status_update)
            .on("alert", Self::handle_alert)
    }

    fn connected(&mut self) {
        println!("* connected as {}", self.user);
    }

    fn disconnected(&mut self) {
        println!("* disconnected");
    }

    fn rejected(&mut self) {
        println!("* the server refused the subscription");
        if let Some(latch) = &self.latch {
            latch.enable();
        }
    }
}

/// Append `user` and (when set) `token` to the cable URL query.
pub fn cable_url_with_query(base: &str, user: &str, token: Option<&str>) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut url = format!("{}{}user={}", base, sep, utf8_percent_encode(user, NON_ALPHANUMERIC));
    if let Some(t) = token {
        url.push_str("&token=");
        url.extend(utf8_percent_encode(t, NON_ALPHANUMERIC));
    }
    url
}

/// One line of user input.
#[derive(Debug, PartialEq)]
pub enum Input {
    Quit,
    Typing,
    Alert { level: String, text: String },
    Speak(String),
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line.eq_ignore_ascii_case("/quit") || line.eq_ignore_ascii_case("/exit") {
        return Input::Quit;
    }
    if line.eq_ignore_ascii_case("/typing") {
        return Input::Typing;
    }
    if let Some(rest) = line.strip_prefix("/alert") {
        let rest = rest.trim();
        let (level, text) = rest.split_once(' ').unwrap_or((rest, ""));
        return Input::Alert {
            level: level.to_string(),
            text: text.trim().to_string(),
        };
    }
    Input::Speak(line.to_string())
}

fn payload(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

pub async fn run_chat(
    url: String,
    user: String,
    token: Option<String>,
    chat_id: String,
    diagnostics_path: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let url = cable_url_with_query(&url, &user, token.as_deref());
    let (client, mut events) = CableClient::connect(&url).await?;

    let sink: Arc<dyn DiagnosticsSink> = match diagnostics_path {
        Some(path) => Arc::new(JsonlSink::open(&path)?),
        None => Arc::new(LogSink),
    };
    let latch = Arc::new(ControlLatch::default());
    let hook_latch = latch.clone();
    let dispatcher = Dispatcher::new()
        .with_recovery(Arc::new(move || hook_latch.enable()))
        .with_sink(sink);
    let mut subscription = Subscription::new(ChatController::new(user).with_latch(latch.clone()), dispatcher);
    let topic = TopicDescriptor::new(CHAT_CHANNEL).param("chat_id", chat_id);
    subscription.subscribe(&client, &topic)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                subscription.handle_event(&event);
                if let TransportEvent::Disconnected { .. } = event {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Typing => {
                        subscription.perform("typing", Map::new());
                    }
                    Input::Alert { level, text } => {
                        subscription.perform("send_alert", payload(&[("level", level.as_str()), ("text", text.as_str())]));
                    }
                    Input::Speak(body) => {
                        if !latch.is_enabled() {
                            println!("* still sending the previous message");
                            continue;
                        }
                        latch.disable();
                        if subscription.perform("speak", payload(&[("body", body.as_str())])) == PerformStatus::Dropped {
                            latch.enable();
                        }
                    }
                }
            }
        }
    }

    subscription.unsubscribe();
    Ok(())
}
