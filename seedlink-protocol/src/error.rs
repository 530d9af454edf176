use crate::version::ProtocolVersion;

#[derive(Debug, thiserror::Error)]
pub enum SeedlinkError {
    #[error("frame too short: expected {expected}, actual {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("invalid signature: expected {expected:?}, actual {actual:?}")]
    InvalidSignature {
        expected: &'static str,
        actual: [u8; 2],
    },

    #[error("{actual:?} framing received in a {session} session")]
    FramingMismatch {
        session: ProtocolVersion,
        actual: [u8; 2],
    },

    #[error("invalid sequence: {0}")]
    InvalidSequence(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("line is not valid UTF-8")]
    InvalidEncoding,

    #[error("command line too long: {actual} bytes exceeds limit of {limit}")]
    CommandTooLong { limit: usize, actual: usize },

    #[error("version mismatch: {command} not valid for {version:?}")]
    VersionMismatch {
        command: &'static str,
        version: ProtocolVersion,
    },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("{command} not allowed in state {state}")]
    UnexpectedCommand {
        command: &'static str,
        state: &'static str,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("server error: [{code}] {description}")]
    ServerError { code: String, description: String },

    #[error("invalid info level: {0}")]
    InvalidInfoLevel(String),

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("invalid payload format: {0}")]
    InvalidPayloadFormat(u8),

    #[error("invalid payload subformat: {0}")]
    InvalidPayloadSubformat(u8),

    #[error("payload length mismatch: expected {expected}, actual {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },

    #[error("payload too large: {actual} bytes exceeds limit of {limit}")]
    PayloadTooLarge { limit: usize, actual: usize },

    #[error("station id too long: {0:?}")]
    StationIdTooLong(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("miniseed error: {0}")]
    Miniseed(#[from] miniseed_rs::MseedError),
}

impl SeedlinkError {
    /// Whether this error ends the session rather than producing an `ERROR` reply.
    ///
    /// Framing and line-length violations leave the byte stream in an unknown
    /// state; selection and argument errors can be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::InvalidSignature { .. }
                | Self::FramingMismatch { .. }
                | Self::CommandTooLong { .. }
                | Self::InvalidEncoding
                | Self::VersionMismatch { .. }
                | Self::PayloadTooLarge { .. }
        )
    }

    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SeedlinkError>;
