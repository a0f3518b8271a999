//! Cable wire protocol (client commands and server frames).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: u32 = 1;

pub const COMMAND_SUBSCRIBE: &str = "subscribe";
pub const COMMAND_UNSUBSCRIBE: &str = "unsubscribe";
pub const COMMAND_MESSAGE: &str = "message";

/// Client command: `{ "command", "identifier", "data"? }`. `identifier` and `data`
/// are JSON documents encoded as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommand {
    pub command: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ClientCommand {
    pub fn subscribe(identifier: impl Into<String>) -> Self {
        Self {
            command: COMMAND_SUBSCRIBE.to_string(),
            identifier: identifier.into(),
            data: None,
        }
    }

    pub fn unsubscribe(identifier: impl Into<String>) -> Self {
        Self {
            command: COMMAND_UNSUBSCRIBE.to_string(),
            identifier: identifier.into(),
            data: None,
        }
    }

    /// `message` command; `data` is `{ "action": action, ...payload }`.
    pub fn message(identifier: impl Into<String>, action: &str, payload: Map<String, Value>) -> Self {
        let mut data = Map::with_capacity(payload.len() + 1);
        data.insert("action".to_string(), Value::String(action.to_string()));
        for (k, v) in payload {
            if k != "action" {
                data.insert(k, v);
            }
        }
        Self {
            command: COMMAND_MESSAGE.to_string(),
            identifier: identifier.into(),
            data: Some(Value::Object(data).to_string()),
        }
    }

    /// Decoded `data` as `(action, payload)`; None when absent, not an object, or without a string action.
    pub fn action(&self) -> Option<(String, Map<String, Value>)> {
        let data = self.data.as_deref()?;
        let Value::Object(mut obj) = serde_json::from_str::<Value>(data).ok()? else {
            return None;
        };
        let action = match obj.remove("action") {
            Some(Value::String(a)) if !a.is_empty() => a,
            _ => return None,
        };
        Some((action, obj))
    }
}

/// Split an identifier into its channel name and the remaining params.
pub fn parse_identifier(identifier: &str) -> Option<(String, Map<String, Value>)> {
    let Value::Object(mut obj) = serde_json::from_str::<Value>(identifier).ok()? else {
        return None;
    };
    let channel = match obj.remove("channel") {
        Some(Value::String(c)) if !c.is_empty() => c,
        _ => return None,
    };
    Some((channel, obj))
}

/// Order-independent form of an identifier: `channel` first, then params sorted by key.
/// Two identifiers naming the same channel and params canonicalise to the same string.
pub fn canonical_identifier(identifier: &str) -> Option<String> {
    let (channel, params) = parse_identifier(identifier)?;
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let mut obj = Map::with_capacity(params.len() + 1);
    obj.insert("channel".to_string(), Value::String(channel.clone()));
    for k in keys {
        obj.insert(k.clone(), params[k.as_str()].clone());
    }
    Some(Value::Object(obj).to_string())
}

/// Server frame. Control frames carry `type`; message frames carry `identifier` + `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
}

impl ServerFrame {
    fn control(typ: &str) -> Self {
        Self {
            typ: Some(typ.to_string()),
            identifier: None,
            message: None,
            reason: None,
            reconnect: None,
        }
    }

    pub fn welcome() -> Self {
        Self::control("welcome")
    }

    /// Keepalive; `message` is the server's unix time in seconds.
    pub fn ping(unix_secs: i64) -> Self {
        Self {
            message: Some(Value::from(unix_secs)),
            ..Self::control("ping")
        }
    }

    pub fn confirm(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::control("confirm_subscription")
        }
    }

    pub fn reject(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::control("reject_subscription")
        }
    }

    pub fn disconnect(reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            reason: Some(reason.into()),
            reconnect: Some(reconnect),
            ..Self::control("disconnect")
        }
    }

    pub fn message(identifier: impl Into<String>, message: Value) -> Self {
        Self {
            typ: None,
            identifier: Some(identifier.into()),
            message: Some(message),
            reason: None,
            reconnect: None,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
