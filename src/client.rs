//! C9: the public-facing download client.
//!
//! `BlobClient` is deliberately thin: a `SchedulerHandle` clone plus the
//! timeout it applies around `add_torrent`. Resolving a name and waiting for
//! the swarm to complete it is entirely the scheduler's (C7) job; this is
//! just the ergonomic entry point a caller reaches for.

use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncRead;

use crate::error::torrent::TorrentError;
use crate::scheduler::SchedulerHandle;

/// A handle for pulling blobs out of the swarm by `(namespace, name)`.
///
/// Cheaply cloneable — it's just a [`SchedulerHandle`] and a timeout.
#[derive(Clone)]
pub struct BlobClient {
    scheduler: SchedulerHandle,
    download_timeout: Duration,
}

impl BlobClient {
    pub fn new(scheduler: SchedulerHandle, download_timeout: Duration) -> Self {
        Self { scheduler, download_timeout }
    }

    /// Resolves `name` within `namespace` to a torrent (starting the swarm if
    /// it isn't already running), waits for it to complete, and returns a
    /// reader over the finished blob in `cache/`.
    ///
    /// Fails with [`TorrentError::Timeout`] if no progress completes the
    /// download within `download_timeout`, even if the underlying torrent
    /// keeps running in the background for other waiters.
    pub async fn download(&self, namespace: impl Into<String>, name: impl Into<String>) -> Result<impl AsyncRead, TorrentError> {
        let name = name.into();
        let cache_path = match tokio::time::timeout(self.download_timeout, self.scheduler.add_torrent(namespace.into(), name)).await {
            Ok(result) => result?,
            Err(_) => return Err(TorrentError::Timeout),
        };
        File::open(cache_path).await.map_err(TorrentError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_cheaply_cloneable() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<BlobClient>();
    }
}
