//! Operator control channel.
//!
//! This module connects the proxy to whoever drives it:
//! - [`protocol`]: JSON message types (events, commands, replies)
//! - [`channel`]: the non-blocking event sink the proxy emits into
//! - [`bridge`]: newline-delimited JSON over a pair of byte streams
//!   (stdin/stdout for the binary)

pub mod bridge;
pub mod channel;
pub mod protocol;

pub use bridge::{BridgeError, OperatorBridge};
pub use channel::{EventSink, create_event_channel, create_event_channel_with_size};
pub use protocol::{CommandReply, OperatorCommand, ProxyEvent};
