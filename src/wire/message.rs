use bytes::Bytes;

use crate::PieceIndex;

/// Wire message IDs (spec §6's `type` byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    AnnouncePiece = 0x00,
    PieceRequest = 0x01,
    PiecePayload = 0x02,
    CancelPiece = 0x03,
    Error = 0x04,
    KeepAlive = 0x05,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(MessageId::AnnouncePiece),
            0x01 => Ok(MessageId::PieceRequest),
            0x02 => Ok(MessageId::PiecePayload),
            0x03 => Ok(MessageId::CancelPiece),
            0x04 => Ok(MessageId::Error),
            0x05 => Ok(MessageId::KeepAlive),
            other => Err(other),
        }
    }
}

/// A single post-handshake message (spec §4.4, §6).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// "I have" — sent after a local piece write completes, or on request
    /// after handshake for pieces already held.
    AnnouncePiece { index: PieceIndex },
    /// Request the whole of a piece's bytes.
    PieceRequest { index: PieceIndex },
    /// A piece's full verified bytes. Pieces are the wire's only transfer
    /// unit in this protocol — there is no sub-piece block message.
    PiecePayload { index: PieceIndex, bytes: Bytes },
    /// Cancels a previously sent `PieceRequest`, used by the dispatcher's
    /// endgame mode once another peer has supplied the piece.
    CancelPiece { index: PieceIndex },
    /// An application-level error, e.g. an invalid piece index requested.
    Error { code: u16, message: String },
    /// Keeps the connection alive past `conn_tti` without exchanging piece
    /// traffic.
    KeepAlive,
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::AnnouncePiece { .. } => MessageId::AnnouncePiece,
            Message::PieceRequest { .. } => MessageId::PieceRequest,
            Message::PiecePayload { .. } => MessageId::PiecePayload,
            Message::CancelPiece { .. } => MessageId::CancelPiece,
            Message::Error { .. } => MessageId::Error,
            Message::KeepAlive => MessageId::KeepAlive,
        }
    }
}
