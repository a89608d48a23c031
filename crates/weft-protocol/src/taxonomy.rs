//! Pure classification of wire messages.
//!
//! Messages on channel `0` are connection-level; everything else is
//! channel-level, subdivided into lifecycle messages (which drive a
//! channel's status) and payload messages (opaque to the core).

use crate::message::{CONNECTION_CHANNEL, WireMessage, msg};

/// Routing class of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Connection-level message (channel `0`).
    Connection,
    /// Channel lifecycle message (request/opened/cancel/closed/error).
    ChannelLifecycle,
    /// Channel payload message, passed through untouched.
    ChannelPayload,
}

/// Classify a message for routing.
#[must_use]
pub fn classify(message: &WireMessage) -> MessageClass {
    if message.channel == CONNECTION_CHANNEL {
        MessageClass::Connection
    } else if is_lifecycle_kind(&message.kind) {
        MessageClass::ChannelLifecycle
    } else {
        MessageClass::ChannelPayload
    }
}

/// Returns `true` for channel lifecycle message types.
#[must_use]
pub fn is_lifecycle_kind(kind: &str) -> bool {
    matches!(
        kind,
        msg::CHANNEL_REQUEST
            | msg::CHANNEL_OPENED
            | msg::CHANNEL_CANCEL
            | msg::CHANNEL_CLOSED
            | msg::ERROR
    )
}

/// Returns `true` for the connection-level message types the client
/// recognizes on channel `0`.
#[must_use]
pub fn is_connection_kind(kind: &str) -> bool {
    matches!(
        kind,
        msg::SETUP | msg::AUTH_STATE | msg::AUTH | msg::KEEPALIVE | msg::ERROR
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_channel_cancel, build_channel_request, build_error, build_setup};

    #[test]
    fn channel_zero_is_connection_scope() {
        let setup = build_setup("0.0.0", 60, 60);
        assert_eq!(classify(&setup), MessageClass::Connection);

        // Unknown types on channel 0 still classify as connection scope.
        let unknown = WireMessage::new("SOMETHING_NEW", 0);
        assert_eq!(classify(&unknown), MessageClass::Connection);
    }

    #[test]
    fn lifecycle_messages_classify_as_lifecycle() {
        let request = build_channel_request(1, "FEED", &serde_json::Map::new());
        assert_eq!(classify(&request), MessageClass::ChannelLifecycle);

        let cancel = build_channel_cancel(3);
        assert_eq!(classify(&cancel), MessageClass::ChannelLifecycle);

        let opened = WireMessage::new(msg::CHANNEL_OPENED, 1);
        assert_eq!(classify(&opened), MessageClass::ChannelLifecycle);

        let closed = WireMessage::new(msg::CHANNEL_CLOSED, 1);
        assert_eq!(classify(&closed), MessageClass::ChannelLifecycle);
    }

    #[test]
    fn channel_scoped_error_is_lifecycle() {
        let error = build_error(7, "UNKNOWN_SERVICE", "no such service");
        assert_eq!(classify(&error), MessageClass::ChannelLifecycle);
    }

    #[test]
    fn connection_scoped_error_is_connection() {
        let error = build_error(0, "TIMEOUT", "too slow");
        assert_eq!(classify(&error), MessageClass::Connection);
    }

    #[test]
    fn other_types_on_channels_are_payload() {
        let data = WireMessage::new("FEED_DATA", 1);
        assert_eq!(classify(&data), MessageClass::ChannelPayload);

        let subscription = WireMessage::new("FEED_SUBSCRIPTION", 5);
        assert_eq!(classify(&subscription), MessageClass::ChannelPayload);
    }

    #[test]
    fn connection_kinds() {
        for kind in ["SETUP", "AUTH_STATE", "AUTH", "KEEPALIVE", "ERROR"] {
            assert!(is_connection_kind(kind), "{kind} should be recognized");
        }
        assert!(!is_connection_kind("FEED_DATA"));
        assert!(!is_connection_kind("CHANNEL_REQUEST"));
    }
}
