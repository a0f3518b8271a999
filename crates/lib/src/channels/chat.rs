//! Chat channel: one topic per chat (`chat:<chat_id>`), actions `speak`, `typing`
//! and `send_alert`, each broadcasting an envelope to everyone in the chat.

use crate::channels::broadcast::Broadcaster;
use crate::channels::context::{CallFrame, CallTrace};
use crate::channels::error::ChannelError;
use crate::channels::registry::{ChannelHandler, ConnectionCtx};
use crate::envelope::Envelope;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub const CHAT_CHANNEL: &str = "ChatChannel";

const MAX_BODY_CHARS: usize = 4000;
const ALERT_LEVELS: &[&str] = &["info", "warning", "critical"];
const DEFAULT_STATUS: &str = "typing";

pub struct ChatChannel {
    broadcaster: Arc<Broadcaster>,
}

/// Topic for a chat id.
pub fn chat_topic(chat_id: &str) -> String {
    format!("chat:{}", chat_id)
}

fn chat_id(params: &Map<String, Value>) -> Result<String, ChannelError> {
    let id = match params.get("chat_id") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(ChannelError::InvalidParam {
                name: "chat_id",
                reason: "expected a string or number".to_string(),
            })
        }
        None => return Err(ChannelError::MissingParam("chat_id")),
    };
    if id.is_empty() {
        return Err(ChannelError::MissingParam("chat_id"));
    }
    Ok(id)
}

fn required_text<'a>(data: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, ChannelError> {
    data.get(name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ChannelError::MissingParam(name))
}

impl ChatChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }

    async fn speak(
        &self,
        conn: &ConnectionCtx,
        topic: &str,
        data: &Map<String, Value>,
    ) -> Result<(), ChannelError> {
        let body = required_text(data, "body")?;
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(ChannelError::InvalidParam {
                name: "body",
                reason: format!("longer than {} characters", MAX_BODY_CHARS),
            });
        }
        let envelope = Envelope::new("new-message")?
            .with("user", conn.user.as_str())
            .with("body", body)
            .with("sentAt", chrono::Utc::now().to_rfc3339());
        let n = self.broadcaster.broadcast(topic, envelope).await;
        log::debug!("chat: {} spoke in {} ({} receivers)", conn.user, topic, n);
        Ok(())
    }

    async fn typing(
        &self,
        conn: &ConnectionCtx,
        topic: &str,
        data: &Map<String, Value>,
    ) -> Result<(), ChannelError> {
        let status = data
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_STATUS);
        let envelope = Envelope::new("status-update")?
            .with("user", conn.user.as_str())
            .with("status", status);
        self.broadcaster.broadcast(topic, envelope).await;
        Ok(())
    }

    async fn send_alert(
        &self,
        conn: &ConnectionCtx,
        topic: &str,
        data: &Map<String, Value>,
    ) -> Result<(), ChannelError> {
        let level = data.get("level").and_then(|v| v.as_str()).unwrap_or("");
        if !ALERT_LEVELS.contains(&level) {
            return Err(ChannelError::InvalidParam {
                name: "level",
                reason: format!("expected one of {}, got {:?}", ALERT_LEVELS.join(", "), level),
            });
        }
        let text = required_text(data, "text")?;
        let envelope = Envelope::new("alert")?
            .with("level", level)
            .with("text", text)
            .with("user", conn.user.as_str());
        let n = self.broadcaster.broadcast(topic, envelope).await;
        log::info!("chat: {} alert from {} in {} ({} receivers)", level, conn.user, topic, n);
        Ok(())
    }
}

#[async_trait]
impl ChannelHandler for ChatChannel {
    fn name(&self) -> &str {
        CHAT_CHANNEL
    }

    async fn subscribed(
        &self,
        conn: &ConnectionCtx,
        params: &Map<String, Value>,
    ) -> Result<Vec<String>, ChannelError> {
        let id = chat_id(params)?;
        log::debug!("chat: {} joined chat {}", conn.user, id);
        Ok(vec![chat_topic(&id)])
    }

    async fn perform(
        &self,
        conn: &ConnectionCtx,
        params: &Map<String, Value>,
        action: &str,
        data: &Map<String, Value>,
        trace: &mut CallTrace,
    ) -> Result<(), ChannelError> {
        let topic = chat_topic(&chat_id(params)?);
        trace.push(CallFrame::channel(action));
        let result = match action {
            "speak" => self.speak(conn, &topic, data).await,
            "typing" => self.typing(conn, &topic, data).await,
            "send_alert" => self.send_alert(conn, &topic, data).await,
            other => {
                trace.pop();
                return Err(ChannelError::UnknownAction(other.to_string()));
            }
        };
        if result.is_ok() {
            trace.pop();
        }
        result
    }

    async fn unsubscribed(&self, conn: &ConnectionCtx, params: &Map<String, Value>) {
        if let Ok(id) = chat_id(params) {
            log::debug!("chat: {} left chat {}", conn.user, id);
        }
    }
}
