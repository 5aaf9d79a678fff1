//! Errors for the torrent archive (C2): resolving a name to metainfo and
//! on-disk storage, shared by every concurrent caller racing on that name.

use crate::error::disk::{NewTorrentError, WriteError};
use crate::error::tracker::OriginError;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArchiveError {
    #[error("origin has no metainfo for this name")]
    NotFound,

    #[error("metainfo is still being generated, retry later")]
    MetaInfoPending,

    #[error("backend unavailable")]
    BackendUnavailable,

    #[error("disk allocation failed: {0}")]
    Disk(String),
}

impl From<OriginError> for ArchiveError {
    fn from(value: OriginError) -> Self {
        match value {
            OriginError::MetaInfoPending => ArchiveError::MetaInfoPending,
            OriginError::NotFound => ArchiveError::NotFound,
            OriginError::Invalid(msg) => ArchiveError::Disk(msg),
            OriginError::Json(_) | OriginError::Http(_) => ArchiveError::BackendUnavailable,
        }
    }
}

impl From<NewTorrentError> for ArchiveError {
    fn from(value: NewTorrentError) -> Self {
        ArchiveError::Disk(value.to_string())
    }
}

impl From<WriteError> for ArchiveError {
    fn from(value: WriteError) -> Self {
        ArchiveError::Disk(value.to_string())
    }
}

impl From<ArchiveError> for crate::error::torrent::TorrentError {
    fn from(value: ArchiveError) -> Self {
        use crate::error::torrent::TorrentError;
        match value {
            ArchiveError::NotFound => TorrentError::NotFound,
            ArchiveError::MetaInfoPending => TorrentError::MetaInfoPending,
            ArchiveError::BackendUnavailable => TorrentError::BackendUnavailable,
            ArchiveError::Disk(msg) => {
                TorrentError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
            }
        }
    }
}
