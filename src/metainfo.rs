//! Metainfo for a content-addressed, single-file blob.
//!
//! Unlike classic BitTorrent `.torrent` files, metainfo here is generated by
//! the origin cluster from the blob's bytes, not authored by a publisher, and
//! is transmitted as JSON (spec §6's origin HTTP API). `name` is the hex
//! digest of the blob's sha256 for content-addressed blobs.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::metainfo::MetainfoError;
use crate::{InfoHash, PieceIndex, Sha1Hash};

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

/// The wire/JSON representation of a blob's metainfo, as returned by the
/// origin's `GET /namespace/<ns>/blobs/<digest>/metainfo` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMetainfo {
    name: String,
    piece_length: u32,
    total_length: u64,
    /// Hex-encoded, 40 characters per piece, concatenated.
    pieces: String,
}

/// Immutable once constructed; the same `Metainfo` is shared by every
/// [`crate::disk::torrent::Torrent`] and dispatcher instance for a given
/// name within this process's lifetime.
#[derive(Clone)]
pub struct Metainfo {
    /// The torrent's name. For a content-addressed blob this is the hex
    /// digest of the file's sha256.
    pub name: String,
    /// Canonical 20-byte hash of this metainfo's (name, piece_length,
    /// total_length, pieces) tuple, used as the torrent's wire/tracker
    /// identity.
    pub info_hash: InfoHash,
    /// Concatenation of each piece's expected SHA-1 hash, `20 * piece_count`
    /// bytes long.
    pub pieces: Vec<u8>,
    /// The nominal length of a piece, in bytes. The last piece may be
    /// shorter.
    pub piece_length: u32,
    /// The total length of the blob, in bytes. May be zero.
    pub total_length: u64,
}

impl std::fmt::Debug for Metainfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metainfo")
            .field("name", &self.name)
            .field("info_hash", &self.info_hash)
            .field("piece_length", &self.piece_length)
            .field("total_length", &self.total_length)
            .field("piece_count", &self.piece_count())
            .finish()
    }
}

impl Metainfo {
    /// Constructs a metainfo directly from already-validated parts (used by
    /// the origin client once it has parsed and validated the wire format,
    /// and by tests).
    ///
    /// # Panics
    ///
    /// Panics if `pieces.len()` is not a multiple of 20, or if the piece
    /// count implied by `total_length`/`piece_length` doesn't match. Use
    /// [`Metainfo::from_bytes`] to validate untrusted input instead.
    pub fn new(name: String, piece_length: u32, total_length: u64, pieces: Vec<u8>) -> Self {
        assert_eq!(pieces.len() % 20, 0, "pieces must be a multiple of 20 bytes");
        let expected_piece_count = expected_piece_count(total_length, piece_length);
        assert_eq!(pieces.len() / 20, expected_piece_count, "piece count mismatch");

        let info_hash = compute_info_hash(&name, piece_length, total_length, &pieces);
        Self {
            name,
            info_hash,
            pieces,
            piece_length,
            total_length,
        }
    }

    /// Parses and validates a metainfo received over the wire (origin HTTP
    /// response body).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_json::from_slice(bytes)?;

        if raw.name.is_empty() {
            return Err(MetainfoError::Invalid("empty name".into()));
        }
        if raw.pieces.len() % 40 != 0 {
            return Err(MetainfoError::Invalid(
                "pieces must be a hex string with length a multiple of 40".into(),
            ));
        }
        let pieces = hex::decode(&raw.pieces)
            .map_err(|_| MetainfoError::Invalid("pieces is not valid hex".into()))?;

        let expected_piece_count = expected_piece_count(raw.total_length, raw.piece_length);
        if pieces.len() / 20 != expected_piece_count {
            return Err(MetainfoError::Invalid(format!(
                "expected {} piece hashes, got {}",
                expected_piece_count,
                pieces.len() / 20
            )));
        }
        if raw.total_length > 0 && raw.piece_length == 0 {
            return Err(MetainfoError::Invalid("piece_length must be non-zero".into()));
        }

        let info_hash = compute_info_hash(&raw.name, raw.piece_length, raw.total_length, &pieces);
        Ok(Self {
            name: raw.name,
            info_hash,
            pieces,
            piece_length: raw.piece_length,
            total_length: raw.total_length,
        })
    }

    /// Serializes to the same wire format [`Metainfo::from_bytes`] parses;
    /// used by the origin test double and by tests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let raw = RawMetainfo {
            name: self.name.clone(),
            piece_length: self.piece_length,
            total_length: self.total_length,
            pieces: hex::encode(&self.pieces),
        };
        serde_json::to_vec(&raw).expect("metainfo serializes")
    }

    /// The number of pieces in this blob. Zero for a zero-length blob.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected SHA-1 hash of the piece at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn piece_hash(&self, index: PieceIndex) -> Sha1Hash {
        let start = index * 20;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.pieces[start..start + 20]);
        hash
    }

    /// The length, in bytes, of the piece at `index`. The last piece may be
    /// shorter than `piece_length`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        assert!(index < self.piece_count(), "piece index out of bounds");
        if index == self.piece_count() - 1 {
            let full_pieces_len = (self.piece_count() - 1) as u64 * self.piece_length as u64;
            (self.total_length - full_pieces_len) as u32
        } else {
            self.piece_length
        }
    }
}

fn expected_piece_count(total_length: u64, piece_length: u32) -> usize {
    if total_length == 0 {
        0
    } else {
        ((total_length + piece_length as u64 - 1) / piece_length as u64) as usize
    }
}

fn compute_info_hash(name: &str, piece_length: u32, total_length: u64, pieces: &[u8]) -> InfoHash {
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(piece_length.to_be_bytes());
    hasher.update(total_length.to_be_bytes());
    hasher.update(pieces);
    let digest = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&digest);
    InfoHash::new(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pieces(n: usize) -> Vec<u8> {
        (0..n).flat_map(|i| [i as u8; 20]).collect()
    }

    #[test]
    fn round_trips_through_wire_format() {
        let mi = Metainfo::new("abc123".into(), 4, 10, sample_pieces(3));
        let bytes = mi.to_bytes();
        let parsed = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.name, mi.name);
        assert_eq!(parsed.info_hash, mi.info_hash);
        assert_eq!(parsed.pieces, mi.pieces);
        assert_eq!(parsed.piece_length, mi.piece_length);
        assert_eq!(parsed.total_length, mi.total_length);
    }

    #[test]
    fn zero_length_blob_has_no_pieces() {
        let mi = Metainfo::new("empty".into(), 4, 0, Vec::new());
        assert_eq!(mi.piece_count(), 0);
    }

    #[test]
    fn blob_smaller_than_one_piece_has_single_piece() {
        let mi = Metainfo::new("small".into(), 16, 5, sample_pieces(1));
        assert_eq!(mi.piece_count(), 1);
        assert_eq!(mi.piece_len(0), 5);
    }

    #[test]
    fn last_piece_len_is_remainder() {
        let mi = Metainfo::new("x".into(), 4, 10, sample_pieces(3));
        assert_eq!(mi.piece_len(0), 4);
        assert_eq!(mi.piece_len(1), 4);
        assert_eq!(mi.piece_len(2), 2);
    }

    #[test]
    fn rejects_mismatched_piece_count() {
        let raw = RawMetainfo {
            name: "x".into(),
            piece_length: 4,
            total_length: 10,
            pieces: hex::encode(sample_pieces(1)),
        };
        let bytes = serde_json::to_vec(&raw).unwrap();
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn same_fields_produce_same_info_hash() {
        let a = Metainfo::new("x".into(), 4, 10, sample_pieces(3));
        let b = Metainfo::new("x".into(), 4, 10, sample_pieces(3));
        assert_eq!(a.info_hash, b.info_hash);
    }
}
