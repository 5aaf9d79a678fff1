//! `swarmd` is the peer-to-peer core of a cluster-local blob distribution
//! system: once a content-addressed blob (a container image layer) has been
//! fetched from a backend store, this crate disseminates it between cluster
//! hosts with a torrent-like swarming protocol so the backend isn't hit again
//! for the same bytes.
//!
//! The scheduler (see [`scheduler`]) is the coordinator: it owns the
//! connection pool accounting, the per-torrent dispatchers, the announce
//! loop, and the torrent archive, all driven from a single event loop task.
//! Callers interact with it through [`client::BlobClient`].

pub mod alert;
pub mod announce_queue;
pub mod archive;
pub mod backoff;
pub mod bandwidth;
pub mod client;
pub mod conf;
pub mod connstate;
pub mod disk;
pub mod dispatch;
pub mod error;
pub mod metainfo;
pub mod origin;
pub mod piece;
pub mod scheduler;
pub mod storage_info;
pub mod tracker;
pub mod wire;

mod conn;
mod define;
pub use define::*;

/// A SHA-1 hash digest, 20 bytes long.
///
/// Used both for a torrent's info-hash and for each piece's expected
/// checksum.
pub type Sha1Hash = [u8; 20];

/// The peer ID is an arbitrary 20 byte string.
///
/// Stable for a process's lifetime; see [`conf::EngineConf::peer_id_factory`].
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer or of the local
/// torrent.
///
/// A set bit at index `i` means the piece at index `i` is present (`done`).
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::prelude::Msb0>;

/// The type of a piece's index.
pub type PieceIndex = usize;

/// The type of a file's index within a torrent. Blobs in this system are
/// always single-file, but the type is kept distinct from [`PieceIndex`] for
/// clarity at call sites that deal with on-disk storage layout.
pub type FileIndex = usize;
