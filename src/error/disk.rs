//! Error types for the piece storage & torrent archive layer (C1, C2).

pub type Result<T, E = DiskError> = std::result::Result<T, E>;

/// Errors returned while allocating or recovering a torrent's on-disk state.
#[derive(Debug, thiserror::Error)]
pub enum NewTorrentError {
    #[error("torrent entry already exists")]
    /// The torrent entry already exists in the disk layer's map of torrents.
    AlreadyExists,
    #[error("{0}")]
    /// IO error while allocating torrent.
    Io(std::io::Error),
}

impl From<std::io::Error> for NewTorrentError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error type returned on failed piece writes.
///
/// Non-fatal: the dispatcher reports it back to the scheduler as a
/// torrent-level (not process-level) failure and may retry from another peer.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("piece already reserved by another writer")]
    /// Returned by the `empty -> dirty` compare-and-swap when the piece is
    /// already being written by someone else.
    PieceTaken,
    #[error("piece failed hash verification")]
    /// The streamed bytes did not hash to the piece's expected SHA-1.
    PieceCorrupt,
    #[error("invalid piece index")]
    InvalidPieceIndex,
    #[error("{0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Error type returned on failed piece reads.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("piece is not done yet")]
    /// The piece has not finished downloading/verifying.
    NotDone,
    #[error("invalid piece index")]
    InvalidPieceIndex,
    #[error("{0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Aggregate disk-layer error, used where a caller doesn't care which of the
/// above kinds occurred (e.g. surfacing to the scheduler's generic error
/// channel).
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("{0}")]
    NewTorrent(#[from] NewTorrentError),
    #[error("{0}")]
    Write(#[from] WriteError),
    #[error("{0}")]
    Read(#[from] ReadError),
    #[error("{0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
