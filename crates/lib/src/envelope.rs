//! Message envelope: every frame payload exchanged over the cable is a JSON object
//! carrying a non-empty string `type` discriminator plus free-form payload fields.
//!
//! The `"error"` type is reserved for error envelopes produced at the server's
//! channel boundary; application messages cannot use it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved discriminator for server-side error reports.
pub const ERROR_TYPE: &str = "error";

/// Message sent in place of the real error text outside development-like environments.
pub const GENERIC_ERROR_MESSAGE: &str = "An error occurred";

/// Action name used when a failure cannot be attributed to a channel method.
pub const UNKNOWN_ACTION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("envelope is missing the type field")]
    MissingType,
    #[error("envelope type must be a string, got {0}")]
    TypeNotString(&'static str),
    #[error("envelope type must not be empty")]
    EmptyType,
    #[error("envelope type \"error\" is reserved for error reports")]
    ReservedType,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validated envelope: `type` plus the remaining fields of the JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Envelope {
    typ: String,
    payload: Map<String, Value>,
}

impl Envelope {
    /// Build an application envelope. Rejects an empty type and the reserved error type.
    pub fn new(typ: impl Into<String>) -> Result<Self, EnvelopeError> {
        let typ = typ.into();
        if typ.is_empty() {
            return Err(EnvelopeError::EmptyType);
        }
        if typ == ERROR_TYPE {
            return Err(EnvelopeError::ReservedType);
        }
        Ok(Self {
            typ,
            payload: Map::new(),
        })
    }

    /// Add one payload field. A `type` key is ignored; the discriminator is fixed at construction.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "type" {
            self.payload.insert(key, value.into());
        }
        self
    }

    /// Validate an inbound JSON value. The reserved error type is accepted here so
    /// receivers can recognise error reports.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| EnvelopeError::NotAnObject(json_kind(value)))?;
        let typ = match obj.get("type") {
            None => return Err(EnvelopeError::MissingType),
            Some(Value::String(s)) => s,
            Some(other) => return Err(EnvelopeError::TypeNotString(json_kind(other))),
        };
        if typ.is_empty() {
            return Err(EnvelopeError::EmptyType);
        }
        let payload = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "type")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            typ: typ.clone(),
            payload,
        })
    }

    pub fn typ(&self) -> &str {
        &self.typ
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Convenience accessor for string payload fields.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.typ == ERROR_TYPE
    }

    /// JSON object with `type` first, then the payload in insertion order.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::with_capacity(self.payload.len() + 1);
        obj.insert("type".to_string(), Value::String(self.typ.clone()));
        for (k, v) in &self.payload {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }
}

impl TryFrom<Value> for Envelope {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Envelope::from_value(&value)
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        envelope.to_value()
    }
}

/// Error report sent from a channel boundary to the connection that raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub message: String,
    /// Name of the channel handler the failure came from (e.g. "ChatChannel").
    pub channel: String,
    pub action: String,
}

impl ErrorEnvelope {
    /// The only way to produce an envelope with the reserved error type.
    pub fn into_envelope(self) -> Envelope {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(self.message));
        payload.insert("channel".to_string(), Value::String(self.channel));
        payload.insert("action".to_string(), Value::String(self.action));
        Envelope {
            typ: ERROR_TYPE.to_string(),
            payload,
        }
    }

    /// Read an error report back out of a received envelope. Missing fields become empty,
    /// a missing action becomes "unknown".
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if !envelope.is_error() {
            return None;
        }
        Some(Self {
            message: envelope.get_str("message").unwrap_or_default().to_string(),
            channel: envelope.get_str("channel").unwrap_or_default().to_string(),
            action: envelope
                .get_str("action")
                .unwrap_or(UNKNOWN_ACTION)
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_rejects_non_objects() {
        for value in [json!(null), json!(3), json!("status-update"), json!([{"type": "x"}]), json!(true)] {
            let err = Envelope::from_value(&value).unwrap_err();
            assert!(matches!(err, EnvelopeError::NotAnObject(_)), "{value} gave {err:?}");
        }
    }

    #[test]
    fn from_value_requires_non_empty_string_type() {
        assert_eq!(
            Envelope::from_value(&json!({"status": "done"})),
            Err(EnvelopeError::MissingType)
        );
        assert_eq!(
            Envelope::from_value(&json!({"type": 7})),
            Err(EnvelopeError::TypeNotString("number"))
        );
        assert_eq!(
            Envelope::from_value(&json!({"type": null})),
            Err(EnvelopeError::TypeNotString("null"))
        );
        assert_eq!(
            Envelope::from_value(&json!({"type": ""})),
            Err(EnvelopeError::EmptyType)
        );
    }

    #[test]
    fn from_value_keeps_payload_and_type_first_on_output() {
        let raw = json!({"status": "done", "type": "status-update", "step": 3});
        let env = Envelope::from_value(&raw).unwrap();
        assert_eq!(env.typ(), "status-update");
        assert_eq!(env.get_str("status"), Some("done"));
        assert_eq!(env.payload().len(), 2);
        assert_eq!(
            serde_json::to_string(&env).unwrap(),
            r#"{"type":"status-update","status":"done","step":3}"#
        );
    }

    #[test]
    fn new_refuses_empty_and_reserved_types() {
        assert_eq!(Envelope::new(""), Err(EnvelopeError::EmptyType));
        assert_eq!(Envelope::new(ERROR_TYPE), Err(EnvelopeError::ReservedType));
    }

    #[test]
    fn with_does_not_overwrite_discriminator() {
        let env = Envelope::new("new-message")
            .unwrap()
            .with("type", "error")
            .with("body", "hi");
        assert_eq!(env.typ(), "new-message");
        assert!(env.get("type").is_none());
        assert_eq!(env.get_str("body"), Some("hi"));
    }

    #[test]
    fn deserialize_goes_through_validation() {
        let parsed: Result<Envelope, _> = serde_json::from_str(r#"{"kind":"x"}"#);
        assert!(parsed.is_err());
        let parsed: Envelope = serde_json::from_str(r#"{"type":"x","n":1}"#).unwrap();
        assert_eq!(parsed.get("n"), Some(&json!(1)));
    }

    #[test]
    fn error_envelope_uses_reserved_type() {
        let env = ErrorEnvelope {
            message: "boom".into(),
            channel: "ChatChannel".into(),
            action: "send_alert".into(),
        }
        .into_envelope();
        assert!(env.is_error());
        assert_eq!(
            env.to_value(),
            json!({"type": "error", "message": "boom", "channel": "ChatChannel", "action": "send_alert"})
        );
        let back = ErrorEnvelope::from_envelope(&env).unwrap();
        assert_eq!(back.action, "send_alert");
    }

    #[test]
    fn error_envelope_from_sparse_report_defaults_action() {
        let env = Envelope::from_value(&json!({"type": "error", "message": "x"})).unwrap();
        let report = ErrorEnvelope::from_envelope(&env).unwrap();
        assert_eq!(report.action, UNKNOWN_ACTION);
        assert_eq!(report.channel, "");
        assert!(ErrorEnvelope::from_envelope(&Envelope::new("alert").unwrap()).is_none());
    }
}
