use seedlink_mux_protocol::{SequenceNumber, StationId};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] seedlink_mux_protocol::SeedlinkError),
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("invalid payload length: expected {expected}, got {actual}")]
    InvalidPayloadLength { expected: usize, actual: usize },
    #[error("sequence regression on {station}: last {last}, got {got}")]
    SequenceRegression {
        station: StationId,
        last: SequenceNumber,
        got: SequenceNumber,
    },
    #[error("sequence {got} is not a valid record sequence for {station}")]
    InvalidSequence {
        station: StationId,
        got: SequenceNumber,
    },
    #[error("log for {0} is halted after a sequence regression")]
    LogHalted(StationId),
    #[error("unknown station: {0}")]
    UnknownStation(String),
    #[error("subscriber fell {lag} records behind and was disconnected")]
    SlowConsumerDisconnected { lag: usize },
    #[error("peer did not accept data for {0:?}")]
    WriteTimeout(std::time::Duration),
    #[error("server shutting down")]
    ShuttingDown,
    #[error("subscription closed")]
    SubscriptionClosed,
}

pub type Result<T> = std::result::Result<T, ServerError>;
