//! Per-torrent on-disk state: sparse download file, piece verification, and
//! the move into the content-addressable cache once all pieces are done.
//!
//! All IO in this module is synchronous (`std::fs`); this is intentional,
//! it's meant to be run off the async executor, via
//! `tokio::task::spawn_blocking`, by [`crate::disk::Disk`].

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use sha1::{Digest, Sha1};

use crate::{
    disk::cas,
    error::disk::{NewTorrentError, ReadError, WriteError},
    metainfo::Metainfo,
    piece::{PieceCell, PieceState},
    storage_info::StorageInfo,
    PieceIndex,
};

/// A single torrent's on-disk state: its piece bitmap and the file(s) that
/// back it, rooted under the process's CAS `store_root`.
pub struct Torrent {
    pub metainfo: Metainfo,
    pub storage: StorageInfo,
    store_root: PathBuf,
    pieces: Vec<PieceCell>,
    /// Set once the file has been moved into `cache/`; afterwards piece
    /// reads come from the cache path instead of the download path.
    in_cache: AtomicBool,
}

impl Torrent {
    /// Opens (creating if necessary) a torrent's on-disk state, recovering
    /// piece status from a prior run if present.
    ///
    /// If the blob is already present in `cache/` (the seeding case, or a
    /// previous run that completed but whose metadata wasn't cleaned up),
    /// every piece is considered `done` regardless of any stale persisted
    /// piece-status file.
    pub fn open(store_root: &Path, metainfo: Metainfo) -> Result<Self, NewTorrentError> {
        let storage = StorageInfo::new(&metainfo);
        let name = &metainfo.name;

        for dir in cas::top_level_dirs(store_root) {
            fs::create_dir_all(&dir)?;
        }
        fs::create_dir_all(cas::metadata_dir(store_root, name))?;

        let in_cache = cas::cache_path(store_root, name).exists();

        let pieces = if in_cache {
            (0..storage.piece_count)
                .map(|_| PieceCell::new(PieceState::Done))
                .collect()
        } else {
            Self::open_download_file(store_root, name, storage.total_length)?;
            Self::load_or_init_piece_status(store_root, name, storage.piece_count)?
        };

        if !in_cache {
            let started_at = cas::started_at_path(store_root, name);
            if !started_at.exists() {
                fs::write(&started_at, Self::now_secs().to_le_bytes())?;
            }
        }

        let torrent = Self {
            metainfo,
            storage,
            store_root: store_root.to_path_buf(),
            pieces,
            in_cache: AtomicBool::new(in_cache),
        };

        // a zero-length blob has no pieces to ever trigger `write_piece`'s
        // move-to-cache step, so it must be moved on creation instead, or
        // it would sit in `download/` "complete" forever (spec §8: "Zero-
        // length blob ... complete immediately on AddTorrent").
        if !in_cache && torrent.storage.piece_count == 0 {
            torrent.move_to_cache().map_err(|e| match e {
                WriteError::Io(io) => NewTorrentError::Io(io),
                other => NewTorrentError::Io(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
            })?;
        }

        Ok(torrent)
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn open_download_file(store_root: &Path, name: &str, total_length: u64) -> Result<(), NewTorrentError> {
        let path = cas::download_path(store_root, name);
        let file = OpenOptions::new().create(true).write(true).read(true).open(&path)?;
        file.set_len(total_length)?;
        Ok(())
    }

    /// Loads the persisted per-piece status bytes, resetting any piece that
    /// was `dirty` when the process last stopped back to `empty` (a
    /// half-written piece can't be trusted and must be re-downloaded).
    fn load_or_init_piece_status(
        store_root: &Path,
        name: &str,
        piece_count: usize,
    ) -> Result<Vec<PieceCell>, NewTorrentError> {
        let path = cas::pieces_status_path(store_root, name);
        let bytes = fs::read(&path).unwrap_or_default();

        let pieces = (0..piece_count)
            .map(|i| {
                let byte = bytes.get(i).copied().unwrap_or(0);
                let state = PieceState::from(byte.min(3));
                let recovered = match state {
                    PieceState::Dirty | PieceState::Clean => PieceState::Empty,
                    other => other,
                };
                PieceCell::new(recovered)
            })
            .collect::<Vec<_>>();

        Self::write_piece_status_file(store_root, name, &pieces)?;
        Ok(pieces)
    }

    fn write_piece_status_file(store_root: &Path, name: &str, pieces: &[PieceCell]) -> std::io::Result<()> {
        let bytes: Vec<u8> = pieces.iter().map(|p| p.load().into()).collect();
        fs::write(cas::pieces_status_path(store_root, name), bytes)
    }

    /// Reserves, verifies and writes a whole piece in one go.
    ///
    /// `data` must be exactly [`StorageInfo::piece_len`] bytes for `index`.
    /// This streams the hash computation and the file write in fixed-size
    /// chunks rather than materializing a second copy of `data`, bounding
    /// peak memory to the chunk size regardless of piece length; `data`
    /// itself is already fully buffered because the wire protocol delivers
    /// a piece as a single framed payload (spec §6), not as sub-piece
    /// blocks.
    pub fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), WriteError> {
        let expected_len = self.storage.piece_len(index).map_err(|_| WriteError::InvalidPieceIndex)?;
        if data.len() as u32 != expected_len {
            return Err(WriteError::PieceCorrupt);
        }

        let cell = self.pieces.get(index).ok_or(WriteError::InvalidPieceIndex)?;
        cell.try_reserve()?;

        match self.write_and_verify(index, data) {
            Ok(()) => {
                cell.complete();
                self.persist_piece_status(&self.pieces)?;
                if self.all_pieces_done() {
                    self.move_to_cache()?;
                }
                Ok(())
            }
            Err(e) => {
                cell.fail();
                let _ = self.persist_piece_status(&self.pieces);
                Err(e)
            }
        }
    }

    const CHUNK_LEN: usize = 64 * 1024;

    fn write_and_verify(&self, index: PieceIndex, data: &[u8]) -> Result<(), WriteError> {
        let mut hasher = Sha1::new();
        for chunk in data.chunks(Self::CHUNK_LEN) {
            hasher.update(chunk);
        }
        let digest = hasher.finalize();
        if digest.as_slice() != self.metainfo.piece_hash(index).as_slice() {
            return Err(WriteError::PieceCorrupt);
        }

        let path = cas::download_path(&self.store_root, &self.metainfo.name);
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(self.storage.piece_offset(index)))?;
        for chunk in data.chunks(Self::CHUNK_LEN) {
            file.write_all(chunk)?;
        }
        Ok(())
    }

    fn persist_piece_status(&self, pieces: &[PieceCell]) -> Result<(), WriteError> {
        Self::write_piece_status_file(&self.store_root, &self.metainfo.name, pieces).map_err(WriteError::from)
    }

    /// Reads a complete, verified piece back out.
    pub fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, ReadError> {
        let cell = self.pieces.get(index).ok_or(ReadError::InvalidPieceIndex)?;
        if !cell.is_done() {
            return Err(ReadError::NotDone);
        }
        let len = self.storage.piece_len(index).map_err(|_| ReadError::InvalidPieceIndex)?;
        let path = if self.in_cache.load(Ordering::Acquire) {
            cas::cache_path(&self.store_root, &self.metainfo.name)
        } else {
            cas::download_path(&self.store_root, &self.metainfo.name)
        };
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(self.storage.piece_offset(index)))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn bitfield(&self) -> crate::Bitfield {
        let mut bf = crate::Bitfield::repeat(false, self.pieces.len());
        for (i, cell) in self.pieces.iter().enumerate() {
            bf.set(i, cell.is_done());
        }
        bf
    }

    pub fn is_complete(&self) -> bool {
        self.in_cache.load(Ordering::Acquire) || self.all_pieces_done()
    }

    fn all_pieces_done(&self) -> bool {
        self.pieces.iter().all(|p| p.is_done())
    }

    /// Atomically moves the completed download file into `cache/` and drops
    /// its now-unneeded per-piece metadata. Idempotent.
    fn move_to_cache(&self) -> Result<(), WriteError> {
        let from = cas::download_path(&self.store_root, &self.metainfo.name);
        let to = cas::cache_path(&self.store_root, &self.metainfo.name);
        if !to.exists() {
            fs::rename(&from, &to)?;
        }
        self.in_cache.store(true, Ordering::Release);
        let _ = fs::remove_file(cas::pieces_status_path(&self.store_root, &self.metainfo.name));
        let _ = fs::remove_file(cas::started_at_path(&self.store_root, &self.metainfo.name));
        Ok(())
    }

    /// How long ago this torrent started downloading, used by the scheduler
    /// to enforce `leecher_tti`. Returns `None` for an already-seeding
    /// torrent (no `startedAt` file).
    pub fn started_at_secs(&self) -> Option<u64> {
        let bytes = fs::read(cas::started_at_path(&self.store_root, &self.metainfo.name)).ok()?;
        let arr: [u8; 8] = bytes.get(0..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest as _, Sha1 as Sha1Hasher};

    fn piece_hash(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1Hasher::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn make_metainfo(name: &str, piece_len: u32, pieces_data: &[&[u8]]) -> Metainfo {
        let total_length = pieces_data.iter().map(|p| p.len() as u64).sum();
        let pieces: Vec<u8> = pieces_data.iter().flat_map(|p| piece_hash(p)).collect();
        Metainfo::new(name.into(), piece_len, total_length, pieces)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let a = b"aaaabbbb".to_vec();
        let b = b"ccccd".to_vec();
        let metainfo = make_metainfo("blob1", 8, &[&a, &b]);
        let torrent = Torrent::open(dir.path(), metainfo).unwrap();

        torrent.write_piece(0, &a).unwrap();
        assert_eq!(torrent.read_piece(0).unwrap(), a);
        assert!(!torrent.is_complete());

        torrent.write_piece(1, &b).unwrap();
        assert_eq!(torrent.read_piece(1).unwrap(), b);
        assert!(torrent.is_complete());

        assert!(cas::cache_path(dir.path(), "blob1").exists());
        assert!(!cas::download_path(dir.path(), "blob1").exists());
    }

    #[test]
    fn corrupt_piece_is_rejected_and_reusable() {
        let dir = tempfile::tempdir().unwrap();
        let a = b"aaaabbbb".to_vec();
        let metainfo = make_metainfo("blob2", 8, &[&a]);
        let torrent = Torrent::open(dir.path(), metainfo).unwrap();

        let wrong = b"zzzzzzzz".to_vec();
        assert!(matches!(torrent.write_piece(0, &wrong), Err(WriteError::PieceCorrupt)));
        // the slot must be released back to empty so it can be retried
        assert!(torrent.write_piece(0, &a).is_ok());
    }

    #[test]
    fn read_before_done_fails() {
        let dir = tempfile::tempdir().unwrap();
        let a = b"aaaabbbb".to_vec();
        let metainfo = make_metainfo("blob3", 8, &[&a]);
        let torrent = Torrent::open(dir.path(), metainfo).unwrap();
        assert!(matches!(torrent.read_piece(0), Err(ReadError::NotDone)));
    }

    #[test]
    fn reopening_recovers_done_pieces_and_resets_dirty_ones() {
        let dir = tempfile::tempdir().unwrap();
        let a = b"aaaabbbb".to_vec();
        let b = b"ccccdddd".to_vec();
        let metainfo = make_metainfo("blob4", 8, &[&a, &b]);
        {
            let torrent = Torrent::open(dir.path(), metainfo.clone()).unwrap();
            torrent.write_piece(0, &a).unwrap();
            // simulate a crash mid-write on piece 1 by reserving but not completing
            torrent.pieces[1].try_reserve().unwrap();
            torrent.persist_piece_status(&torrent.pieces).unwrap();
        }

        let reopened = Torrent::open(dir.path(), metainfo).unwrap();
        assert!(reopened.pieces[0].is_done());
        assert_eq!(reopened.pieces[1].load(), PieceState::Empty);
    }
}
