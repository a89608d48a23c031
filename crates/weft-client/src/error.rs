//! Error types for the weft client engine.

/// Errors produced by the client engine, surfaced to callers and to
/// registered error listeners.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON encode/decode error on a protocol message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No `SETUP` response within the action timeout.
    #[error("SETUP response not received within {0}s")]
    SetupTimeout(u64),

    /// No `AUTH_STATE` within the action timeout.
    #[error("AUTH_STATE not received within {0}s")]
    AuthTimeout(u64),

    /// The server has been silent longer than its keepalive budget.
    #[error("No keepalive received for {elapsed_ms}ms")]
    KeepaliveTimeout {
        /// Milliseconds since the last message from the server.
        elapsed_ms: u64,
    },

    /// Send attempted on a channel that is not open.
    #[error("channel {id} is not open")]
    ChannelNotReady {
        /// Id of the channel the send was attempted on.
        id: u64,
    },

    /// The operation requires a live transport.
    #[error("not connected")]
    NotConnected,

    /// The engine disconnected before the operation completed.
    #[error("disconnected")]
    Disconnected,

    /// Error reported by the server; the kind tag is surfaced as-is.
    #[error("server error [{kind}]: {message}")]
    Server {
        /// Error kind tag from the wire.
        kind: String,
        /// Human-readable description from the wire.
        message: String,
    },

    /// Protocol violation by the server.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ClientError::SetupTimeout(10);
        assert!(err.to_string().contains("10s"));

        let err = ClientError::AuthTimeout(10);
        assert!(err.to_string().contains("AUTH_STATE"));

        let err = ClientError::KeepaliveTimeout { elapsed_ms: 31000 };
        assert_eq!(err.to_string(), "No keepalive received for 31000ms");

        let err = ClientError::ChannelNotReady { id: 5 };
        assert!(err.to_string().contains('5'));

        let err = ClientError::Server {
            kind: "UNKNOWN_SERVICE".into(),
            message: "no such service".into(),
        };
        assert!(err.to_string().contains("UNKNOWN_SERVICE"));
        assert!(err.to_string().contains("no such service"));

        let err = ClientError::Protocol("bad message".into());
        assert!(err.to_string().contains("bad message"));
    }

    #[test]
    fn json_errors_convert() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ClientError::from(json_err);
        assert!(matches!(err, ClientError::Json(_)));
    }

    #[test]
    fn websocket_errors_convert_boxed() {
        let err = ClientError::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(matches!(err, ClientError::WebSocket(_)));
        assert!(err.to_string().contains("WebSocket"));
    }
}
