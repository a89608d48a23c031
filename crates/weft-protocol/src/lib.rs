//! Weft Protocol - wire message model for the weft multiplexed
//! messaging protocol.
//!
//! This crate provides:
//! - The logical wire message shape (`type` tag + `channel` number +
//!   opaque per-type fields)
//! - Builders for every message the client constructs
//! - Typed views over the messages the client pattern-matches
//! - Pure classification of messages into connection scope, channel
//!   lifecycle, and channel payload
//!
//! The crate is transport-agnostic and performs no I/O. Encoding is
//! plain JSON objects via serde; the engine and transports live in
//! `weft-client`.
//!
//! # Example
//!
//! ```rust
//! use weft_protocol::{MessageClass, build_channel_request, classify};
//!
//! let mut parameters = serde_json::Map::new();
//! parameters.insert("contract".into(), "AUTO".into());
//!
//! let request = build_channel_request(1, "FEED", &parameters);
//! assert_eq!(request.channel, 1);
//! assert_eq!(classify(&request), MessageClass::ChannelLifecycle);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod message;
mod taxonomy;

pub use message::{
    AuthState, AuthStatePayload, ChannelOpenedPayload, ErrorPayload, SetupPayload, WireMessage,
    build_auth, build_channel_cancel, build_channel_request, build_error, build_keepalive,
    build_setup, msg,
};
pub use message::{CONNECTION_CHANNEL, PROTOCOL_VERSION, TIMEOUT_ERROR};
pub use taxonomy::{MessageClass, classify, is_connection_kind, is_lifecycle_kind};
