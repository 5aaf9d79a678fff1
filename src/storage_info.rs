//! Storage layout derived from a blob's [`crate::metainfo::Metainfo`].
//!
//! Blobs in this system are always single-file and content-addressed, so
//! this is considerably simpler than a general BitTorrent client's
//! multi-file archive handling: there is exactly one file, and its path is
//! derived from the torrent name via the CAS layout (see
//! [`crate::disk::cas`]).

use crate::{metainfo::Metainfo, PieceIndex};

/// Storage details for a torrent: piece geometry and total length. Derived
/// once from metainfo and then immutable for the torrent's lifetime.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent. Zero for a zero-length blob.
    pub piece_count: usize,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`.
    /// Zero (and unused) if `piece_count == 0`.
    pub last_piece_len: u32,
    /// The total length of the blob, in bytes.
    pub total_length: u64,
}

impl StorageInfo {
    /// Extracts storage information from a blob's metainfo.
    pub fn new(metainfo: &Metainfo) -> Self {
        let piece_count = metainfo.piece_count();
        let last_piece_len = if piece_count == 0 {
            0
        } else {
            metainfo.piece_len(piece_count - 1)
        };
        Self {
            piece_count,
            piece_len: metainfo.piece_length,
            last_piece_len,
            total_length: metainfo.total_length,
        }
    }

    /// The length, in bytes, of the piece at `index`.
    pub fn piece_len(&self, index: PieceIndex) -> crate::error::disk::Result<u32> {
        if index >= self.piece_count {
            return Err(crate::error::disk::WriteError::InvalidPieceIndex.into());
        }
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else {
            Ok(self.piece_len)
        }
    }

    /// The byte offset of the piece at `index` within the blob.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_blob_has_zero_pieces() {
        let mi = Metainfo::new("x".into(), 4, 0, Vec::new());
        let info = StorageInfo::new(&mi);
        assert_eq!(info.piece_count, 0);
    }

    #[test]
    fn last_piece_len_is_remainder() {
        let pieces: Vec<u8> = (0..3).flat_map(|i| [i as u8; 20]).collect();
        let mi = Metainfo::new("x".into(), 4, 10, pieces);
        let info = StorageInfo::new(&mi);
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.last_piece_len, 2);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 2);
        assert!(info.piece_len(3).is_err());
    }
}
