//! Errors surfaced to a caller of [`crate::client::BlobClient::download`] and
//! to the scheduler for a single torrent's lifecycle (C7, C9).

use tokio::io::Error as IoError;
use tokio::sync::mpsc::error::SendError;

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("channel error")]
    /// The channel on which some component in the engine was listening or
    /// sending died.
    Channel,

    #[error("torrent not found at origin")]
    /// The origin has no metainfo for this name (origin 404).
    NotFound,

    #[error("metainfo is still being generated, retry later")]
    /// The origin is still computing metainfo for this blob.
    MetaInfoPending,

    #[error("download timed out waiting for peers")]
    /// The torrent was a leecher with no progress for `leecher_tti`.
    Timeout,

    #[error("torrent was cancelled")]
    /// `CancelTorrent` was issued, by the API caller or by TTI expiry.
    Cancelled,

    #[error("backend unavailable")]
    /// The origin cluster could not be reached at all.
    BackendUnavailable,

    #[error("{0}")]
    Io(std::io::Error),
}

impl From<IoError> for TorrentError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl<T> From<SendError<T>> for TorrentError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
