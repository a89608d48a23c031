//! Wire message types and builders for the weft protocol.
//!
//! Every message is a logical JSON object carrying a `type` tag and a
//! `channel` number; all other fields are type-dependent. Only the
//! messages the client constructs or pattern-matches are modelled with
//! typed views; channel payload messages are forwarded as opaque field
//! maps.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version advertised in the `SETUP` handshake.
pub const PROTOCOL_VERSION: &str = "0.1";

/// The reserved channel carrying connection-level messages.
pub const CONNECTION_CHANNEL: u64 = 0;

/// Error kind tag for liveness and handshake timeouts.
pub const TIMEOUT_ERROR: &str = "TIMEOUT";

// ── Message types ────────────────────────────────────────────

/// Message type tags.
pub mod msg {
    /// Setup handshake (bidirectional).
    pub const SETUP: &str = "SETUP";
    /// Authorization state notification (receive only).
    pub const AUTH_STATE: &str = "AUTH_STATE";
    /// Token submission (send only).
    pub const AUTH: &str = "AUTH";
    /// Liveness signal (bidirectional).
    pub const KEEPALIVE: &str = "KEEPALIVE";
    /// Error report (bidirectional, connection- or channel-scoped).
    pub const ERROR: &str = "ERROR";
    /// Channel open request (send only).
    pub const CHANNEL_REQUEST: &str = "CHANNEL_REQUEST";
    /// Channel open confirmation (receive only).
    pub const CHANNEL_OPENED: &str = "CHANNEL_OPENED";
    /// Channel close request (send only).
    pub const CHANNEL_CANCEL: &str = "CHANNEL_CANCEL";
    /// Channel close notification (receive only).
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";
}

// ── Wire Types ───────────────────────────────────────────────

/// Raw protocol message as received or sent over the transport.
///
/// The `type` and `channel` fields are always present; everything else
/// is carried in [`WireMessage::body`] and interpreted per type. Payload
/// messages on non-zero channels pass through the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Logical channel number; `0` is the connection channel.
    #[serde(default)]
    pub channel: u64,
    /// Per-type fields, kept opaque.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl WireMessage {
    /// Create a message with an empty body.
    #[must_use]
    pub fn new(kind: impl Into<String>, channel: u64) -> Self {
        Self {
            kind: kind.into(),
            channel,
            body: Map::new(),
        }
    }

    /// Create a message from a JSON object body.
    ///
    /// Non-object values produce an empty body; the builders in this
    /// module only ever pass objects.
    #[must_use]
    pub fn with_body(kind: impl Into<String>, channel: u64, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.into(),
            channel,
            body,
        }
    }

    /// Deserialize the body into a typed payload view.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if required fields are missing
    /// or have the wrong shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }

    /// Look up a single body field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

/// Authorization state as signalled by the server in `AUTH_STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthState {
    /// No valid authorization for this session.
    Unauthorized,
    /// Token submitted, decision pending.
    Authorizing,
    /// Session authorized.
    Authorized,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Authorizing => "AUTHORIZING",
            Self::Authorized => "AUTHORIZED",
        };
        f.write_str(tag)
    }
}

/// Body of a server `SETUP` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    /// Server protocol/software version.
    pub version: String,
    /// Server keepalive budget in seconds.
    #[serde(default)]
    pub keepalive_timeout: Option<u64>,
    /// Keepalive timeout the server will accept from us, in seconds.
    #[serde(default)]
    pub accept_keepalive_timeout: Option<u64>,
}

/// Body of an `AUTH_STATE` notification.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AuthStatePayload {
    /// The signalled authorization state.
    pub state: AuthState,
}

/// Body of an `ERROR` message.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    /// Error kind tag (`TIMEOUT` or a server-defined tag).
    pub error: String,
    /// Human-readable description.
    pub message: String,
}

/// Body of a `CHANNEL_OPENED` confirmation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelOpenedPayload {
    /// Service the channel was opened for.
    pub service: String,
    /// Parameters echoed by the server.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

// ── Builders ─────────────────────────────────────────────────

/// Build the client `SETUP` handshake message.
///
/// The `version` field is the concatenation
/// `"<protocolVersion>-<clientVersion>"`; timeouts are in seconds.
#[must_use]
pub fn build_setup(
    client_version: &str,
    keepalive_timeout: u64,
    accept_keepalive_timeout: u64,
) -> WireMessage {
    WireMessage::with_body(
        msg::SETUP,
        CONNECTION_CHANNEL,
        serde_json::json!({
            "version": format!("{PROTOCOL_VERSION}-{client_version}"),
            "keepaliveTimeout": keepalive_timeout,
            "acceptKeepaliveTimeout": accept_keepalive_timeout,
        }),
    )
}

/// Build an `AUTH` token submission.
#[must_use]
pub fn build_auth(token: &str) -> WireMessage {
    WireMessage::with_body(
        msg::AUTH,
        CONNECTION_CHANNEL,
        serde_json::json!({ "token": token }),
    )
}

/// Build a `KEEPALIVE` message.
#[must_use]
pub fn build_keepalive() -> WireMessage {
    WireMessage::new(msg::KEEPALIVE, CONNECTION_CHANNEL)
}

/// Build an `ERROR` message for the given channel scope.
#[must_use]
pub fn build_error(channel: u64, kind: &str, message: &str) -> WireMessage {
    WireMessage::with_body(
        msg::ERROR,
        channel,
        serde_json::json!({ "error": kind, "message": message }),
    )
}

/// Build a `CHANNEL_REQUEST` for a service with its parameter map.
#[must_use]
pub fn build_channel_request(
    channel: u64,
    service: &str,
    parameters: &Map<String, Value>,
) -> WireMessage {
    WireMessage::with_body(
        msg::CHANNEL_REQUEST,
        channel,
        serde_json::json!({ "service": service, "parameters": parameters }),
    )
}

/// Build a `CHANNEL_CANCEL` for a channel.
#[must_use]
pub fn build_channel_cancel(channel: u64) -> WireMessage {
    WireMessage::new(msg::CHANNEL_CANCEL, channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_roundtrip() {
        let message = WireMessage::with_body(
            "FEED_DATA",
            3,
            serde_json::json!({ "data": ["a", "b"], "seq": 7 }),
        );
        let json = serde_json::to_string(&message).unwrap();
        let restored: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, message);
        assert_eq!(restored.field("seq"), Some(&Value::from(7)));
    }

    #[test]
    fn wire_message_serializes_type_and_channel() {
        let message = build_keepalive();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "KEEPALIVE");
        assert_eq!(json["channel"], 0);
    }

    #[test]
    fn wire_message_channel_defaults_to_zero() {
        let message: WireMessage = serde_json::from_str(r#"{"type":"KEEPALIVE"}"#).unwrap();
        assert_eq!(message.channel, CONNECTION_CHANNEL);
    }

    #[test]
    fn setup_concatenates_versions() {
        let setup = build_setup("0.0.0", 60, 60);
        assert_eq!(setup.kind, msg::SETUP);
        assert_eq!(setup.channel, CONNECTION_CHANNEL);
        assert_eq!(setup.field("version"), Some(&Value::from("0.1-0.0.0")));
        assert_eq!(setup.field("keepaliveTimeout"), Some(&Value::from(60)));
        assert_eq!(
            setup.field("acceptKeepaliveTimeout"),
            Some(&Value::from(60))
        );
    }

    #[test]
    fn setup_payload_deserializes() {
        let message: WireMessage = serde_json::from_str(
            r#"{"type":"SETUP","channel":0,"version":"1.0","keepaliveTimeout":45}"#,
        )
        .unwrap();
        let setup: SetupPayload = message.payload().unwrap();
        assert_eq!(setup.version, "1.0");
        assert_eq!(setup.keepalive_timeout, Some(45));
        assert!(setup.accept_keepalive_timeout.is_none());
    }

    #[test]
    fn auth_carries_token() {
        let auth = build_auth("T");
        assert_eq!(auth.kind, msg::AUTH);
        assert_eq!(auth.field("token"), Some(&Value::from("T")));
    }

    #[test]
    fn auth_state_parses_all_values() {
        for (text, expected) in [
            ("UNAUTHORIZED", AuthState::Unauthorized),
            ("AUTHORIZING", AuthState::Authorizing),
            ("AUTHORIZED", AuthState::Authorized),
        ] {
            let json = format!(r#"{{"type":"AUTH_STATE","channel":0,"state":"{text}"}}"#);
            let message: WireMessage = serde_json::from_str(&json).unwrap();
            let payload: AuthStatePayload = message.payload().unwrap();
            assert_eq!(payload.state, expected);
            assert_eq!(payload.state.to_string(), text);
        }
    }

    #[test]
    fn auth_state_rejects_unknown_value() {
        let message: WireMessage =
            serde_json::from_str(r#"{"type":"AUTH_STATE","channel":0,"state":"BANNED"}"#).unwrap();
        assert!(message.payload::<AuthStatePayload>().is_err());
    }

    #[test]
    fn error_builder_and_payload() {
        let error = build_error(0, TIMEOUT_ERROR, "No keepalive received for 31000ms");
        let payload: ErrorPayload = error.payload().unwrap();
        assert_eq!(payload.error, "TIMEOUT");
        assert_eq!(payload.message, "No keepalive received for 31000ms");
    }

    #[test]
    fn channel_request_carries_service_and_parameters() {
        let mut parameters = Map::new();
        parameters.insert("contract".into(), "AUTO".into());

        let request = build_channel_request(1, "FEED", &parameters);
        assert_eq!(request.channel, 1);
        assert_eq!(request.field("service"), Some(&Value::from("FEED")));
        assert_eq!(
            request.field("parameters"),
            Some(&Value::Object(parameters))
        );
    }

    #[test]
    fn channel_opened_parameters_default_empty() {
        let message: WireMessage =
            serde_json::from_str(r#"{"type":"CHANNEL_OPENED","channel":1,"service":"FEED"}"#)
                .unwrap();
        let opened: ChannelOpenedPayload = message.payload().unwrap();
        assert_eq!(opened.service, "FEED");
        assert!(opened.parameters.is_empty());
    }

    #[test]
    fn channel_cancel_is_bare() {
        let cancel = build_channel_cancel(5);
        assert_eq!(cancel.kind, msg::CHANNEL_CANCEL);
        assert_eq!(cancel.channel, 5);
        assert!(cancel.body.is_empty());
    }

    #[test]
    fn payload_missing_field_is_error() {
        let message = WireMessage::new(msg::ERROR, 0);
        assert!(message.payload::<ErrorPayload>().is_err());
    }
}
