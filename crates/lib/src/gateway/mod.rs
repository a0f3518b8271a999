//! Gateway: HTTP + WebSocket cable server.
//!
//! Single port serves a health endpoint and the cable. Clients subscribe to
//! channels by identifier, send actions with `message` commands, and receive
//! broadcasts as message frames under the subscription's identifier.

mod protocol;
mod server;

pub use protocol::{
    canonical_identifier, parse_identifier, ClientCommand, ServerFrame, COMMAND_MESSAGE, COMMAND_SUBSCRIBE,
    COMMAND_UNSUBSCRIBE, PROTOCOL_VERSION,
};
pub use server::{router, run_gateway, GatewayState};
