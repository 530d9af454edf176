use std::time::Duration;

use seedlink_mux_protocol::{GapNotice, SeedlinkError};

/// Errors that can occur during SeedLink client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// TCP or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SeedLink protocol error (bad framing, rejected command, etc.).
    #[error("protocol error: {0}")]
    Protocol(#[from] SeedlinkError),

    /// Cursor file could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation exceeded the configured timeout duration.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Address is neither `host[:port]` nor a `slink://` URL.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Server closed the connection.
    #[error("disconnected")]
    Disconnected,

    /// Server answered a command with `ERROR`.
    #[error("server error: {0}")]
    ServerError(String),

    /// Method called in the wrong session state (e.g. `next_record` before `end_stream`).
    #[error("invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// The state(s) required for the operation.
        expected: &'static str,
        /// The current session state.
        actual: &'static str,
    },

    /// Connecting, HELLO or capability negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[source] Box<ClientError>),

    /// The server could not resume where the client asked; records were lost.
    #[error("gap detected for {}: requested {}, earliest {}", .0.station, .0.requested, .0.earliest)]
    GapDetected(GapNotice),

    /// Reconnect attempts exhausted.
    #[error("stream unavailable after {attempts} reconnect attempts")]
    StreamUnavailable { attempts: u32 },

    /// Server sent something that does not fit the exchange.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Whether a reconnect may cure this error.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::Disconnected => true,
            Self::Protocol(e) => e.is_fatal(),
            Self::HandshakeFailed(inner) => inner.is_transport(),
            _ => false,
        }
    }
}

/// Convenience alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(ClientError::Disconnected.is_transport());
        assert!(ClientError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(
            ClientError::HandshakeFailed(Box::new(ClientError::Disconnected)).is_transport()
        );
        assert!(!ClientError::ServerError("ARGUMENTS".into()).is_transport());
        assert!(
            !ClientError::Protocol(SeedlinkError::UnsupportedVersion("4.0".into())).is_transport()
        );
        assert!(
            ClientError::Protocol(SeedlinkError::InvalidSignature {
                expected: "SL",
                actual: *b"XX",
            })
            .is_transport()
        );
    }
}
