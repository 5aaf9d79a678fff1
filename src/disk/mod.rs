//! C1: Piece Storage & Torrent Archive's on-disk half.
//!
//! `Disk` is a dedicated actor task: a command channel driving a
//! single-threaded event loop, same shape as [`crate::scheduler::Scheduler`].
//! Unlike that loop, whose own work is all channel/timer driven, actual
//! file IO here is pushed onto `tokio::task::spawn_blocking` since pieces
//! can be several MiB and this loop also has to stay responsive to new
//! commands.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    error::disk::{DiskError, NewTorrentError, ReadError, WriteError},
    metainfo::Metainfo,
    InfoHash, PieceIndex,
};

pub mod cas;
pub mod torrent;

pub use torrent::Torrent;

pub type JoinHandle = task::JoinHandle<()>;
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands the scheduler and dispatcher send to the disk task.
pub enum Command {
    /// Allocates (or recovers) a torrent's on-disk state.
    NewTorrent {
        info_hash: InfoHash,
        metainfo: Metainfo,
        result_tx: tokio::sync::oneshot::Sender<Result<crate::Bitfield, NewTorrentError>>,
    },
    /// Requests a piece be verified and written to disk.
    WritePiece {
        info_hash: InfoHash,
        index: PieceIndex,
        data: Vec<u8>,
        result_tx: tokio::sync::oneshot::Sender<Result<(), WriteError>>,
    },
    /// Requests a previously-written, verified piece back.
    ReadPiece {
        info_hash: InfoHash,
        index: PieceIndex,
        result_tx: tokio::sync::oneshot::Sender<Result<Vec<u8>, ReadError>>,
    },
    /// Drops a torrent's in-memory handle. The on-disk state (including a
    /// completed blob in `cache/`) is left untouched.
    DropTorrent { info_hash: InfoHash },
    Shutdown,
}

/// Spawns the disk task, returning a handle to send it commands.
pub fn spawn(store_root: PathBuf) -> (Sender, JoinHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut disk = Disk {
        store_root,
        torrents: HashMap::new(),
        rx,
    };
    let join_handle = task::spawn(async move { disk.run().await });
    (tx, join_handle)
}

struct Disk {
    store_root: PathBuf,
    torrents: HashMap<InfoHash, Arc<Torrent>>,
    rx: Receiver,
}

impl Disk {
    async fn run(&mut self) {
        log::info!("Disk task starting, store root {:?}", self.store_root);
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::NewTorrent { info_hash, metainfo, result_tx } => {
                    let result = self.new_torrent(info_hash, metainfo).await;
                    let _ = result_tx.send(result);
                }
                Command::WritePiece { info_hash, index, data, result_tx } => {
                    let result = self.write_piece(info_hash, index, data).await;
                    let _ = result_tx.send(result);
                }
                Command::ReadPiece { info_hash, index, result_tx } => {
                    let result = self.read_piece(info_hash, index).await;
                    let _ = result_tx.send(result);
                }
                Command::DropTorrent { info_hash } => {
                    self.torrents.remove(&info_hash);
                }
                Command::Shutdown => {
                    log::info!("Disk task shutting down");
                    break;
                }
            }
        }
    }

    async fn new_torrent(
        &mut self,
        info_hash: InfoHash,
        metainfo: Metainfo,
    ) -> Result<crate::Bitfield, NewTorrentError> {
        if self.torrents.contains_key(&info_hash) {
            return Err(NewTorrentError::AlreadyExists);
        }
        let store_root = self.store_root.clone();
        let torrent = task::spawn_blocking(move || Torrent::open(&store_root, metainfo))
            .await
            .expect("disk blocking task panicked")?;
        let bitfield = torrent.bitfield();
        self.torrents.insert(info_hash, Arc::new(torrent));
        Ok(bitfield)
    }

    async fn write_piece(
        &mut self,
        info_hash: InfoHash,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<(), WriteError> {
        let torrent = self.torrent::<WriteError>(info_hash)?;
        task::spawn_blocking(move || torrent.write_piece(index, &data))
            .await
            .expect("disk blocking task panicked")
    }

    async fn read_piece(&mut self, info_hash: InfoHash, index: PieceIndex) -> Result<Vec<u8>, ReadError> {
        let torrent = self.torrent::<ReadError>(info_hash)?;
        task::spawn_blocking(move || torrent.read_piece(index))
            .await
            .expect("disk blocking task panicked")
    }

    fn torrent<E: From<DiskTorrentMissing>>(&self, info_hash: InfoHash) -> Result<Arc<Torrent>, E> {
        self.torrents.get(&info_hash).cloned().ok_or(DiskTorrentMissing).map_err(E::from)
    }
}

/// Internal marker converted into each command's own error type; the disk
/// task itself never returns "torrent not found" to the scheduler as a
/// distinct case, since `NewTorrent` always precedes any `WritePiece`/
/// `ReadPiece` for a given info hash.
struct DiskTorrentMissing;

impl From<DiskTorrentMissing> for WriteError {
    fn from(_: DiskTorrentMissing) -> Self {
        WriteError::InvalidPieceIndex
    }
}

impl From<DiskTorrentMissing> for ReadError {
    fn from(_: DiskTorrentMissing) -> Self {
        ReadError::InvalidPieceIndex
    }
}

impl From<DiskError> for crate::error::Error {
    fn from(_: DiskError) -> Self {
        crate::error::Error::InvalidStoreRoot
    }
}
