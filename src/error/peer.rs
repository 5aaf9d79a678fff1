//! Errors for a single peer connection (C4), classified per the conn-fatal /
//! transient taxonomy in spec §7.

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("handshake info hash mismatch")]
    /// The peer's info hash did not match ours. Conn-fatal: long blacklist.
    InfoHashMismatch,

    #[error("handshake protocol mismatch")]
    /// The peer's protocol magic/version did not match. Conn-fatal: long
    /// blacklist.
    ProtocolMismatch,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("piece request while not eligible")]
    /// The peer requested a piece we have no record of wanting to serve, or
    /// requested beyond the pipeline depth.
    InvalidRequest,

    #[error("invalid piece index")]
    InvalidPieceIndex,

    #[error("received piece failed verification")]
    /// Conn-fatal: long blacklist, the peer is suspect.
    PieceCorrupt,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("connection idle for too long")]
    Idle,

    #[error("channel error")]
    Channel,

    #[error("{0}")]
    Io(std::io::Error),
}

impl From<IoError> for ConnError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for ConnError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}

/// Whether a connection error should result in a short or long blacklist
/// duration (spec §4.4 failure taxonomy), or no blacklist at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistSeverity {
    None,
    Short,
    Long,
}

impl ConnError {
    pub fn blacklist_severity(&self) -> BlacklistSeverity {
        match self {
            ConnError::InfoHashMismatch
            | ConnError::ProtocolMismatch
            | ConnError::PieceCorrupt => BlacklistSeverity::Long,
            ConnError::Io(_)
            | ConnError::HandshakeTimeout
            | ConnError::Framing(_)
            | ConnError::Idle
            | ConnError::InvalidRequest
            | ConnError::InvalidPieceIndex => BlacklistSeverity::Short,
            ConnError::Channel => BlacklistSeverity::None,
        }
    }
}
