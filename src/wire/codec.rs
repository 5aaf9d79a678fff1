use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageId};

/// Frames: `length(4, big-endian, not counting itself) | type(1) | payload`
/// (spec §6), over this protocol's six message types.
#[derive(Debug, Default)]
pub struct MessageCodec;

/// An arbitrarily chosen ceiling well above any real piece size, to reject a
/// corrupt or hostile length prefix outright instead of trying to allocate
/// it.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::AnnouncePiece { index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::AnnouncePiece as u8);
                buf.put_u32(index as u32);
            }
            Message::PieceRequest { index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::PieceRequest as u8);
                buf.put_u32(index as u32);
            }
            Message::CancelPiece { index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::CancelPiece as u8);
                buf.put_u32(index as u32);
            }
            Message::PiecePayload { index, bytes } => {
                let len = 1 + 4 + bytes.len();
                buf.put_u32(len as u32);
                buf.put_u8(MessageId::PiecePayload as u8);
                buf.put_u32(index as u32);
                buf.extend_from_slice(&bytes);
            }
            Message::Error { code, message } => {
                let msg_bytes = message.as_bytes();
                if msg_bytes.len() > u16::MAX as usize {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "error message too long"));
                }
                let len = 1 + 2 + 2 + msg_bytes.len();
                buf.put_u32(len as u32);
                buf.put_u8(MessageId::Error as u8);
                buf.put_u16(code);
                buf.put_u16(msg_bytes.len() as u16);
                buf.extend_from_slice(msg_bytes);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_peek = io::Cursor::new(&buf[..4]);
        let len = len_peek.get_u32();
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length exceeds limit"));
        }
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        let frame_len = 4 + len as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(len as usize);
        let id_byte = frame.get_u8();
        let id = MessageId::try_from(id_byte)
            .map_err(|b| io::Error::new(io::ErrorKind::InvalidData, format!("unknown message id {b}")))?;

        let msg = match id {
            MessageId::AnnouncePiece => Message::AnnouncePiece { index: frame.get_u32() as usize },
            MessageId::PieceRequest => Message::PieceRequest { index: frame.get_u32() as usize },
            MessageId::PiecePayload => {
                let index = frame.get_u32() as usize;
                let bytes: Bytes = frame.freeze();
                Message::PiecePayload { index, bytes }
            }
            MessageId::CancelPiece => Message::CancelPiece { index: frame.get_u32() as usize },
            MessageId::Error => {
                let code = frame.get_u16();
                let msg_len = frame.get_u16() as usize;
                if frame.remaining() < msg_len {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated error message"));
                }
                let msg_bytes = frame.split_to(msg_len);
                let message = String::from_utf8(msg_bytes.to_vec())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "error message is not utf8"))?;
                Message::Error { code, message }
            }
            MessageId::KeepAlive => Message::KeepAlive,
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = MessageCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_every_message_type() {
        round_trip(Message::KeepAlive);
        round_trip(Message::AnnouncePiece { index: 3 });
        round_trip(Message::PieceRequest { index: 9 });
        round_trip(Message::PiecePayload { index: 2, bytes: Bytes::from_static(b"hello") });
        round_trip(Message::CancelPiece { index: 9 });
        round_trip(Message::Error { code: 404, message: "not found".into() });
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut buf = BytesMut::new();
        MessageCodec
            .encode(Message::PiecePayload { index: 1, bytes: Bytes::from_static(b"0123456789") }, &mut buf)
            .unwrap();
        let mut partial = buf[..buf.len() - 1].into();
        assert_eq!(MessageCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn decodes_a_stream_of_messages() {
        let msgs = vec![
            Message::AnnouncePiece { index: 0 },
            Message::KeepAlive,
            Message::PieceRequest { index: 5 },
            Message::PiecePayload { index: 5, bytes: Bytes::from_static(b"payload") },
        ];
        let mut buf = BytesMut::new();
        for msg in &msgs {
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
        }
        for expected in msgs {
            assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(expected));
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_message_id_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xaa);
        assert!(MessageCodec.decode(&mut buf).is_err());
    }
}
