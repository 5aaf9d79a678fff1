//! C2: the torrent archive, the sole entry point that turns a `(namespace,
//! name)` pair into a live torrent.
//!
//! Resolution is keyed singleflight (spec §9): concurrent callers racing to
//! create the same name's torrent all await one in-flight resolution rather
//! than each independently hitting the origin and the disk task. Guarding
//! the whole read-or-create sequence this way is expressed here with a
//! per-name promise cell instead of a single coarse lock, since the
//! resolution itself awaits network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::OnceCell;

use crate::error::archive::{ArchiveError, Result};
use crate::metainfo::Metainfo;
use crate::origin::{OriginClient, Rendezvous};
use crate::{disk, Bitfield, InfoHash};

/// What makes this process an origin peer rather than a plain cluster host:
/// the rendezvous membership table and this host's own address within it, so
/// [`Archive`] can tell whether it is the authoritative owner of a digest
/// (spec §4.9: "the scheduler running on an origin peer uses this to direct
/// fetches to the authoritative owner").
pub struct OriginOwnership {
    pub rendezvous: Rendezvous,
    pub self_addr: SocketAddr,
}

impl OriginOwnership {
    /// Whether `self_addr` is the authoritative owner of `digest`. Only the
    /// owner pulls a blob's very first copy out of the backend; every other
    /// cluster host (origin peer or plain leecher) only ever gets bytes
    /// through the swarm.
    fn owns(&self, digest: &str) -> bool {
        self.rendezvous.owner(digest) == Some(self.self_addr)
    }
}

/// What [`Archive::create_torrent`] hands back: everything the scheduler
/// needs to register a torrent (build its [`crate::dispatch::Dispatcher`],
/// enqueue it for announcing) without reaching back into the archive.
#[derive(Clone)]
pub struct TorrentHandle {
    pub name: String,
    pub info_hash: InfoHash,
    pub metainfo: Metainfo,
    /// The bitfield recovered (or freshly allocated) by the disk task,
    /// already reflecting any pieces left `done` from a prior process
    /// lifetime.
    pub bitfield: Bitfield,
}

impl TorrentHandle {
    /// True when every piece is already `done` — a zero-length blob
    /// completes immediately on creation, and a reopened seeder has nothing
    /// left to fetch (spec §8's zero-length-blob boundary case).
    pub fn is_complete(&self) -> bool {
        self.bitfield.all()
    }
}

type InflightCell = Arc<OnceCell<Arc<TorrentHandle>>>;

/// C2: name → metainfo resolution and at-most-one-torrent-per-name.
pub struct Archive {
    origin: Arc<dyn OriginClient>,
    disk_tx: disk::Sender,
    metainfo_cache: Mutex<LruCache<String, Metainfo>>,
    /// Live torrents, keyed by name. A torrent is removed from here by
    /// [`Archive::delete_torrent`] (seeder TTI expiry) or
    /// [`Archive::cancel`] (leecher cancellation/timeout).
    torrents: Mutex<HashMap<String, Arc<TorrentHandle>>>,
    /// Singleflight cells for in-progress resolutions, so concurrent
    /// `create_torrent` calls for the same name share one origin fetch and
    /// one disk allocation.
    inflight: Mutex<HashMap<String, InflightCell>>,
    /// `Some` only on an origin peer process; `None` for a plain cluster
    /// host, which always gets bytes through the swarm.
    ownership: Option<OriginOwnership>,
}

impl Archive {
    pub fn new(origin: Arc<dyn OriginClient>, disk_tx: disk::Sender, metainfo_cache_size: usize) -> Self {
        Self::with_ownership(origin, disk_tx, metainfo_cache_size, None)
    }

    /// Builds an archive running on an origin peer: in addition to the
    /// regular swarm-client behavior, a name this host is the rendezvous
    /// owner of gets its bytes pulled directly from `origin.download` on
    /// first resolution, seeding the torrent as already complete before any
    /// leecher ever asks the tracker for it.
    pub fn with_ownership(
        origin: Arc<dyn OriginClient>,
        disk_tx: disk::Sender,
        metainfo_cache_size: usize,
        ownership: Option<OriginOwnership>,
    ) -> Self {
        let cache_size = std::num::NonZeroUsize::new(metainfo_cache_size.max(1)).expect("nonzero");
        Self {
            origin,
            disk_tx,
            metainfo_cache: Mutex::new(LruCache::new(cache_size)),
            torrents: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            ownership,
        }
    }

    /// Resolves `name` to a live torrent, fetching metainfo from the origin
    /// on a cache miss and allocating (or recovering) on-disk storage sized
    /// to it. The same [`TorrentHandle`] is returned to every caller racing
    /// on the same name.
    pub async fn create_torrent(&self, namespace: &str, name: &str) -> Result<Arc<TorrentHandle>> {
        if let Some(existing) = self.torrents.lock().unwrap().get(name).cloned() {
            return Ok(existing);
        }

        let cell = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.entry(name.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let namespace = namespace.to_string();
        let name_owned = name.to_string();
        let result: Result<Arc<TorrentHandle>> = cell
            .get_or_try_init(|| self.resolve_and_register(namespace, name_owned))
            .await
            .map(Clone::clone);

        // Whether this resolution succeeded or failed, don't keep serving
        // stale in-flight cells to future callers: success is now served
        // from `torrents` directly; failure must be retryable (e.g. a
        // transient `ErrMetaInfoPending`) rather than permanently wedged.
        self.inflight.lock().unwrap().remove(name);

        result
    }

    async fn resolve_and_register(&self, namespace: String, name: String) -> Result<Arc<TorrentHandle>> {
        let metainfo = self.resolve_metainfo(&namespace, &name).await?;
        let info_hash = metainfo.info_hash;

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.disk_tx
            .send(disk::Command::NewTorrent { info_hash, metainfo: metainfo.clone(), result_tx })
            .map_err(|_| ArchiveError::BackendUnavailable)?;
        let mut bitfield = match result_rx.await.map_err(|_| ArchiveError::BackendUnavailable)? {
            Ok(bf) => bf,
            // another racer's disk allocation won; re-derive the bitfield
            // isn't possible from here, but this only happens if the
            // singleflight cell was bypassed by a direct map write, which
            // `create_torrent` never does — treat as a disk-layer bug.
            Err(e) => return Err(e.into()),
        };

        if !bitfield.all() {
            if let Some(ownership) = &self.ownership {
                if ownership.owns(&name) {
                    bitfield = self.seed_from_origin(&namespace, &name, info_hash, &metainfo).await?;
                }
            }
        }

        let handle = Arc::new(TorrentHandle { name: name.clone(), info_hash, metainfo, bitfield });
        self.torrents.lock().unwrap().insert(name, handle.clone());
        Ok(handle)
    }

    /// Pulls a blob's very first copy out of the backend and writes it piece
    /// by piece into this host's own CAS store, so it can seed the swarm
    /// without waiting for any other peer.
    async fn seed_from_origin(
        &self,
        namespace: &str,
        name: &str,
        info_hash: InfoHash,
        metainfo: &Metainfo,
    ) -> Result<Bitfield> {
        let bytes = self.origin.download(namespace, name).await?;
        if bytes.len() as u64 != metainfo.total_length {
            return Err(ArchiveError::Disk(format!(
                "origin returned {} bytes, metainfo expects {}",
                bytes.len(),
                metainfo.total_length
            )));
        }

        let mut offset = 0usize;
        for index in 0..metainfo.piece_count() {
            let len = metainfo.piece_len(index) as usize;
            let data = bytes[offset..offset + len].to_vec();
            offset += len;

            let (result_tx, result_rx) = tokio::sync::oneshot::channel();
            self.disk_tx
                .send(disk::Command::WritePiece { info_hash, index, data, result_tx })
                .map_err(|_| ArchiveError::BackendUnavailable)?;
            result_rx.await.map_err(|_| ArchiveError::BackendUnavailable)??;
        }

        let mut bitfield = Bitfield::repeat(false, metainfo.piece_count());
        bitfield.fill(true);
        Ok(bitfield)
    }

    async fn resolve_metainfo(&self, namespace: &str, name: &str) -> Result<Metainfo> {
        if let Some(mi) = self.metainfo_cache.lock().unwrap().get(name).cloned() {
            return Ok(mi);
        }
        let mi = self.origin.get_metainfo(namespace, name).await?;
        self.metainfo_cache.lock().unwrap().put(name.to_string(), mi.clone());
        Ok(mi)
    }

    /// Returns the live torrent for `name`, if any. Distinct from
    /// [`Archive::create_torrent`]: this never fetches or allocates.
    pub fn get_torrent(&self, name: &str) -> Option<Arc<TorrentHandle>> {
        self.torrents.lock().unwrap().get(name).cloned()
    }

    /// Evicts a torrent from the live set (scheduler calls this on seeder
    /// TTI expiry or explicit cancellation); the on-disk bytes in `cache/`
    /// are untouched, so a later `create_torrent` for the same name will
    /// find them again via [`disk::Torrent::open`]'s cache-hit path.
    pub fn delete_torrent(&self, name: &str) {
        if let Some(handle) = self.torrents.lock().unwrap().remove(name) {
            let _ = self.disk_tx.send(disk::Command::DropTorrent { info_hash: handle.info_hash });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures::future::BoxFuture;

    use super::*;
    use crate::error::tracker::{OriginError, OriginResult};

    struct FakeOrigin {
        calls: AtomicUsize,
        pieces: Vec<u8>,
    }

    impl FakeOrigin {
        fn new() -> Self {
            let pieces: Vec<u8> = (0..1).flat_map(|i| [i as u8; 20]).collect();
            Self { calls: AtomicUsize::new(0), pieces }
        }
    }

    impl OriginClient for FakeOrigin {
        fn get_metainfo<'a>(&'a self, _namespace: &'a str, name: &'a str) -> BoxFuture<'a, OriginResult<Metainfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mi = Metainfo::new(name.to_string(), 4, 4, self.pieces.clone());
            Box::pin(async move { Ok(mi) })
        }

        fn download<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> BoxFuture<'a, OriginResult<Bytes>> {
            Box::pin(async move { Err(OriginError::NotFound) })
        }
    }

    fn spawn_disk() -> (disk::Sender, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _join) = disk::spawn(dir.path().to_path_buf());
        (tx, dir)
    }

    /// An origin whose `download` returns real bytes hashing to the pieces
    /// its `get_metainfo` advertises, for tests exercising the first-copy
    /// seeding path (which writes those bytes through the disk task's own
    /// SHA-1 verification).
    struct FakeOriginWithData {
        body: Vec<u8>,
        piece_length: u32,
    }

    impl OriginClient for FakeOriginWithData {
        fn get_metainfo<'a>(&'a self, _namespace: &'a str, name: &'a str) -> BoxFuture<'a, OriginResult<Metainfo>> {
            use sha1::{Digest, Sha1};
            let piece_length = self.piece_length;
            let pieces: Vec<u8> = self
                .body
                .chunks(piece_length as usize)
                .flat_map(|chunk| {
                    let mut hasher = Sha1::new();
                    hasher.update(chunk);
                    hasher.finalize().to_vec()
                })
                .collect();
            let mi = Metainfo::new(name.to_string(), piece_length, self.body.len() as u64, pieces);
            Box::pin(async move { Ok(mi) })
        }

        fn download<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> BoxFuture<'a, OriginResult<Bytes>> {
            let body = self.body.clone();
            Box::pin(async move { Ok(Bytes::from(body)) })
        }
    }

    #[tokio::test]
    async fn origin_owner_seeds_blob_bytes_on_first_resolution() {
        let (disk_tx, _dir) = spawn_disk();
        let origin = Arc::new(FakeOriginWithData { body: b"hello world, this is a test blob".to_vec(), piece_length: 8 });
        let self_addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let ownership = OriginOwnership {
            rendezvous: Rendezvous::new(vec![crate::origin::OriginMember { addr: self_addr, weight: 1 }]),
            self_addr,
        };
        let archive = Archive::with_ownership(origin, disk_tx, 128, Some(ownership));

        let handle = archive.create_torrent("ns", "blob").await.unwrap();
        assert!(handle.is_complete(), "sole rendezvous owner should seed every piece from the origin immediately");
    }

    #[tokio::test]
    async fn non_owner_does_not_seed_from_origin() {
        let (disk_tx, _dir) = spawn_disk();
        let origin = Arc::new(FakeOriginWithData { body: b"hello world, this is a test blob".to_vec(), piece_length: 8 });
        let self_addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let other_addr: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        // `self_addr` is deliberately absent from the membership table, so
        // `owns()` is always false regardless of how any digest happens to
        // hash — unlike weighting two real members against each other, this
        // doesn't depend on HRW's score distribution for one fixed digest.
        let ownership = OriginOwnership {
            rendezvous: Rendezvous::new(vec![crate::origin::OriginMember { addr: other_addr, weight: 1 }]),
            self_addr,
        };
        let archive = Archive::with_ownership(origin, disk_tx, 128, Some(ownership));

        let handle = archive.create_torrent("ns", "blob").await.unwrap();
        assert!(!handle.is_complete(), "a non-owner must leave the blob's bytes to be fetched through the swarm");
    }

    #[tokio::test]
    async fn concurrent_create_torrent_calls_share_one_origin_fetch() {
        let (disk_tx, _dir) = spawn_disk();
        let origin = Arc::new(FakeOrigin::new());
        let archive = Arc::new(Archive::new(origin.clone(), disk_tx, 128));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let archive = archive.clone();
            handles.push(tokio::spawn(async move { archive.create_torrent("ns", "blob").await.unwrap() }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
        let first_hash = results[0].info_hash;
        assert!(results.iter().all(|h| h.info_hash == first_hash));
    }

    #[tokio::test]
    async fn get_torrent_before_create_is_none() {
        let (disk_tx, _dir) = spawn_disk();
        let archive = Archive::new(Arc::new(FakeOrigin::new()), disk_tx, 128);
        assert!(archive.get_torrent("blob").is_none());
    }

    #[tokio::test]
    async fn delete_then_create_refetches() {
        let (disk_tx, _dir) = spawn_disk();
        let origin = Arc::new(FakeOrigin::new());
        let archive = Archive::new(origin.clone(), disk_tx, 128);

        archive.create_torrent("ns", "blob").await.unwrap();
        assert!(archive.get_torrent("blob").is_some());
        archive.delete_torrent("blob");
        assert!(archive.get_torrent("blob").is_none());

        archive.create_torrent("ns", "blob").await.unwrap();
        assert!(archive.get_torrent("blob").is_some());
    }
}
