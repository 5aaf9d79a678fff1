//! The crate's error taxonomy, split by module, and aggregated here for the
//! handful of call sites that cross component boundaries.

pub mod archive;
pub mod disk;
pub mod metainfo;
pub mod peer;
pub mod torrent;
pub mod tracker;

use std::net::SocketAddr;

pub use archive::{ArchiveError, Result as ArchiveResult};
pub use disk::{DiskError, NewTorrentError, ReadError, Result as DiskResult, WriteError};
pub use peer::{BlacklistSeverity, ConnError};
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};
pub use torrent::{Result as TorrentResult, TorrentError};
pub use tracker::{OriginError, Result as TrackerResult, TrackerError};

use crate::InfoHash;

pub type EngineResult<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("channel error")]
    /// The channel on which some component in the engine was listening or
    /// sending died.
    Channel,

    #[error("invalid store root")]
    /// The CAS store root is not usable (not a directory, not writable, ...).
    InvalidStoreRoot,

    #[error("torrent {info_hash} error: {error}")]
    Torrent {
        info_hash: InfoHash,
        error: TorrentError,
    },

    #[error("torrent {info_hash} tracker error: {error}")]
    Tracker {
        info_hash: InfoHash,
        error: TrackerError,
    },

    #[error("torrent {info_hash} peer {addr} error: {error}")]
    Peer {
        info_hash: InfoHash,
        addr: SocketAddr,
        error: ConnError,
    },

    #[error("{0}")]
    Io(IoError),
}

impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
