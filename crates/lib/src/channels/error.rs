//! Channel failures and their conversion into error envelopes.

use crate::channels::context::{extract_action, CallTrace};
use crate::config::Environment;
use crate::envelope::{Envelope, EnvelopeError, ErrorEnvelope, GENERIC_ERROR_MESSAGE};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: &'static str, reason: String },
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Build the error envelope sent back to the connection that raised. The message is the
/// error text only in development-like environments.
pub fn build_error_envelope(
    error: &dyn std::error::Error,
    channel: &str,
    trace: &CallTrace,
    environment: Environment,
) -> Envelope {
    let message = if environment.is_development_like() {
        error.to_string()
    } else {
        GENERIC_ERROR_MESSAGE.to_string()
    };
    ErrorEnvelope {
        message,
        channel: channel.to_string(),
        action: extract_action(trace),
    }
    .into_envelope()
}
