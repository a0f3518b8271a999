//! Server-side cable channels.
//!
//! Channel handlers are registered by name; the gateway routes subscribe and
//! message commands to them, fans broadcasts out per topic, and turns handler
//! failures into error envelopes for the connection that raised them.

mod broadcast;
mod chat;
mod context;
mod error;
mod registry;

pub use broadcast::Broadcaster;
pub use chat::{chat_topic, ChatChannel, CHAT_CHANNEL};
pub use context::{extract_action, CallFrame, CallTrace, FrameOrigin, INTERNAL_METHODS};
pub use error::{build_error_envelope, ChannelError};
pub use registry::{ChannelHandler, ChannelRegistry, ConnectionCtx};
