//! Parlor core library: message envelopes, the client dispatcher and
//! subscription lifecycle, the cable client, and the gateway with its channels.
//! Used by the CLI.

pub mod channels;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod gateway;
pub mod subscription;
