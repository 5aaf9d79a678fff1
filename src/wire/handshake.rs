use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Bitfield, InfoHash, PeerId};

/// Identifies this wire protocol; any peer sending a different value fails
/// the handshake with a protocol mismatch (conn-fatal, long blacklist).
pub const MAGIC: [u8; 8] = *b"SWARMD01";
pub const PROTOCOL_VERSION: u8 = 1;

/// The fixed-size portion of the handshake, before the variable-length
/// name and bitfield. Spec §6 calls the whole record "fixed 48-byte", which
/// undercounts once `version`/`reserved`/`name`/`bitfield` are included; we
/// take that as shorthand for "the header has a fixed-width prefix" and
/// implement the prefix literally as `magic | version | reserved |
/// info_hash | peer_id`, 56 bytes, followed by the two explicitly
/// length-prefixed variable sections the spec names.
const FIXED_HEADER_LEN: usize = 8 + 1 + 7 + 20 + 20;

/// The message exchanged by both sides at the start of a connection (spec
/// §4.4's handshaking state): `{peer_id, info_hash, bitfield, name_version}`.
/// `name` here plays the role of "name_version" — it's the torrent's name,
/// carried so a peer can sanity-check it's talking about the blob it thinks
/// it is even though `info_hash` alone is authoritative.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub name: String,
    pub bitfield: Bitfield,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, name: String, bitfield: Bitfield) -> Self {
        Self { info_hash, peer_id, name, bitfield }
    }
}

#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> io::Result<()> {
        let Handshake { info_hash, peer_id, name, bitfield } = handshake;
        let name_bytes = name.as_bytes();
        let bitfield_bytes = bitfield.as_raw_slice();

        if name_bytes.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "torrent name too long"));
        }

        buf.reserve(FIXED_HEADER_LEN + 2 + name_bytes.len() + 4 + bitfield_bytes.len());
        buf.extend_from_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(info_hash.as_bytes());
        buf.extend_from_slice(&peer_id);
        buf.put_u16(name_bytes.len() as u16);
        buf.extend_from_slice(name_bytes);
        buf.put_u32(bitfield_bytes.len() as u32);
        buf.extend_from_slice(bitfield_bytes);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.len() < FIXED_HEADER_LEN + 2 {
            return Ok(None);
        }

        let mut cursor = io::Cursor::new(&buf[..]);
        let mut magic = [0u8; 8];
        cursor.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad handshake magic"));
        }
        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported protocol version"));
        }
        let mut reserved = [0u8; 7];
        cursor.copy_to_slice(&mut reserved);
        let mut info_hash_bytes = [0u8; 20];
        cursor.copy_to_slice(&mut info_hash_bytes);
        let mut peer_id = [0u8; 20];
        cursor.copy_to_slice(&mut peer_id);
        let name_len = cursor.get_u16() as usize;

        if buf.len() < FIXED_HEADER_LEN + 2 + name_len + 4 {
            return Ok(None);
        }
        let mut cursor = io::Cursor::new(&buf[FIXED_HEADER_LEN + 2..]);
        let mut name_buf = vec![0u8; name_len];
        cursor.copy_to_slice(&mut name_buf);
        let bitfield_len = cursor.get_u32() as usize;

        let total_len = FIXED_HEADER_LEN + 2 + name_len + 4 + bitfield_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        let name = String::from_utf8(name_buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "handshake name is not utf8"))?;

        buf.advance(total_len - bitfield_len);
        let bitfield_bytes: Bytes = buf.split_to(bitfield_len).freeze();
        let bitfield = Bitfield::from_vec(bitfield_bytes.to_vec());

        Ok(Some(Handshake {
            info_hash: InfoHash::from(info_hash_bytes),
            peer_id,
            name,
            bitfield,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Handshake {
        Handshake::new(
            InfoHash::from([7u8; 20]),
            [9u8; 20],
            "a-blob".into(),
            Bitfield::from_vec(vec![0b1010_0000]),
        )
    }

    #[test]
    fn round_trips() {
        let handshake = sample();
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        let decoded = HandshakeCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(handshake));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_buffer_yields_none() {
        let handshake = sample();
        let mut full = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut full).unwrap();

        let mut partial = full[..full.len() - 1].into();
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xffu8; 8]);
        buf.extend_from_slice(&[0u8; FIXED_HEADER_LEN - 8]);
        buf.put_u16(0);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }
}
