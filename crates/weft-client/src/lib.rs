//! Weft Client - connection engine for the weft multiplexed messaging
//! protocol.
//!
//! This crate provides:
//! - The connection state machine (setup handshake, keepalive,
//!   peer-liveness timeout, reconnect with linear backoff)
//! - The authorization state machine (token submission, retry on
//!   reconnect, the informational first `AUTH_STATE` rule)
//! - The channel multiplexer (odd-id allocation, lifecycle, message
//!   routing, listener fan-out)
//! - A WebSocket transport over tokio-tungstenite, plus an in-memory
//!   loopback transport for tests and examples
//!
//! # Example
//!
//! ```no_run
//! use weft_client::{ClientConfig, WeftClient};
//!
//! # async fn example() -> Result<(), weft_client::ClientError> {
//! let client = WeftClient::new(ClientConfig::default());
//! client.set_auth_token("token");
//! client.connect("wss://demo.weft.example/messaging").await?;
//!
//! let mut parameters = serde_json::Map::new();
//! parameters.insert("contract".into(), "AUTO".into());
//! let channel = client.open_channel("FEED", parameters);
//! channel.add_message_listener(|message| {
//!     println!("{}: {:?}", message.kind, message.body);
//! });
//! # Ok(())
//! # }
//! ```
//!
//! The engine never installs a `tracing` subscriber; hosts configure
//! one and may honour [`ClientConfig::log_level`] when doing so.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod channel;
mod client;
mod config;
mod error;
mod listeners;
mod timers;
mod transport;

pub use channel::{Channel, ChannelStatus};
pub use client::{ConnectionDetails, ConnectionState, WeftClient};
pub use config::{ClientConfig, LogLevel};
pub use error::ClientError;
pub use listeners::ListenerId;
pub use transport::{
    LoopbackFactory, LoopbackHandle, LoopbackTransport, Transport, TransportEvent,
    TransportFactory, WebSocketFactory, WebSocketTransport,
};

// The wire-visible auth state is part of this crate's public surface.
pub use weft_protocol::AuthState;
