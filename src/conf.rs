//! This module defines types used to configure the engine and its parts.
//!
//! [`Conf`] is `serde::Deserialize` so a host process can load it from a
//! TOML or JSON file with [`Conf::from_toml_str`]; the core itself does not
//! implement a CLI (that's left to a thin binary wrapping this crate).

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use rand::RngCore;
use serde::Deserialize;
use url::Url;

use crate::{error::metainfo::MetainfoError, PeerId};

/// How a process picks its own [`PeerId`] on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerIdFactory {
    /// 20 random bytes, generated once per process.
    Random,
    /// Derived deterministically from the process's listen address, useful
    /// for debugging a cluster (peer id -> host is recoverable by eye).
    IpHash,
}

impl PeerIdFactory {
    /// Produces a [`PeerId`] according to this factory's strategy.
    pub fn generate(&self, listen_addr: SocketAddr) -> PeerId {
        let mut id = [0u8; 20];
        match self {
            PeerIdFactory::Random => {
                rand::thread_rng().fill_bytes(&mut id);
            }
            PeerIdFactory::IpHash => {
                use sha1::{Digest, Sha1};
                let mut hasher = Sha1::new();
                hasher.update(listen_addr.to_string().as_bytes());
                let digest = hasher.finalize();
                id.copy_from_slice(&digest);
            }
        }
        id
    }
}

/// The global configuration for the swarm engine and all its parts.
#[derive(Debug, Clone, Deserialize)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults for everything but
    /// the CAS store root, which the caller must always provide explicitly.
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                peer_id_factory: PeerIdFactory::Random,
                store_root: store_root.into(),
                listen_addr: "0.0.0.0:0".parse().expect("valid default listen addr"),
                tracker_url: "http://127.0.0.1:8080/announce".parse().expect("valid default tracker url"),
                origin_base_url: "http://127.0.0.1:8081/".parse().expect("valid default origin url"),
                metainfo_cache_size: 1024,
                announce_disabled: false,
            },
            torrent: TorrentConf::default(),
        }
    }

    /// Parses a configuration from a TOML document, as a host CLI would load
    /// it from `--config <file>`.
    pub fn from_toml_str(s: &str) -> Result<Self, MetainfoError> {
        toml::from_str(s).map_err(|e| MetainfoError::Invalid(e.to_string()))
    }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConf {
    /// How this process generates its own peer id.
    pub peer_id_factory: PeerIdFactory,
    /// The CAS root directory, containing `upload/`, `download/`, `cache/`
    /// and `metadata/` subdirectories (see spec §6 persisted state layout).
    pub store_root: PathBuf,
    /// The address on which the scheduler accepts incoming peer connections.
    pub listen_addr: SocketAddr,
    /// Tracker announce endpoint (spec §6's `GET /announce`).
    pub tracker_url: Url,
    /// Origin cluster base URL the archive resolves names against (spec
    /// §6's `/namespace/<ns>/blobs/<digest>` API).
    pub origin_base_url: Url,
    /// Bound on the archive's in-memory name -> metainfo cache.
    pub metainfo_cache_size: usize,
    /// Origin-cluster peers never need to discover swarm members through
    /// the tracker (spec §4.9's rendezvous lookup serves that role for
    /// them instead), so they run with announcing disabled entirely.
    pub announce_disabled: bool,
}

/// Configuration for a torrent.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents (via `TorrentParams`) may override it.
#[derive(Debug, Clone, Deserialize)]
pub struct TorrentConf {
    /// Default piece length assumed when none is supplied by metainfo. In
    /// practice metainfo always carries its own `piece_length`; this is only
    /// used by tests and by fallback metainfo construction.
    pub piece_length: u32,

    /// How often the announce queue sends each ready torrent back to the
    /// tracker.
    #[serde(with = "duration_secs")]
    pub announce_interval: Duration,
    /// Timeout for a single tracker announce HTTP call.
    #[serde(with = "duration_secs")]
    pub announce_timeout: Duration,

    /// Idle connections with no activity for this long are closed.
    #[serde(with = "duration_secs")]
    pub conn_tti: Duration,
    /// A leecher torrent making no progress for this long is cancelled with
    /// `ErrTorrentTimeout`.
    #[serde(with = "duration_secs")]
    pub leecher_tti: Duration,
    /// A completed torrent with no active leechers for this long is evicted
    /// from the archive.
    #[serde(with = "duration_secs")]
    pub seeder_tti: Duration,
    /// How often the scheduler runs its preemption sweep.
    #[serde(with = "duration_secs")]
    pub preemption_interval: Duration,

    /// Base blacklist duration for a `ConnKey`'s first failure.
    #[serde(with = "duration_secs")]
    pub blacklist_duration_base: Duration,
    /// Upper bound on blacklist duration regardless of failure count.
    #[serde(with = "duration_secs")]
    pub blacklist_duration_max: Duration,

    /// Maximum concurrent connections for a single torrent.
    pub max_conns_per_torrent: usize,
    /// Maximum concurrent connections across all torrents in the process.
    pub max_global_conns: usize,
    /// Maximum outstanding (unanswered) piece requests per connection.
    pub max_pipeline_depth: usize,
    /// Below this many missing pieces, the dispatcher enters endgame mode
    /// and duplicates requests across peers.
    pub endgame_threshold: usize,

    /// Egress token bucket rate, in bits/sec. Ignored if `bandwidth_disable`.
    pub egress_bits_per_sec: u64,
    /// Ingress token bucket rate, in bits/sec. Ignored if `bandwidth_disable`.
    pub ingress_bits_per_sec: u64,
    /// Token bucket granularity, in bits.
    pub token_size: u64,
    /// When true, both bandwidth limiters become no-ops.
    pub bandwidth_disable: bool,

    /// How long `BlobClient::download` waits before giving up.
    #[serde(with = "duration_secs")]
    pub download_timeout: Duration,
    /// How long a connection handshake is allowed to take.
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// How long a single piece request may remain unanswered before the
    /// connection is considered unresponsive for that piece.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// After this many consecutive announce failures, a torrent stops
    /// announcing to that tracker (transient error budget, spec §7).
    pub tracker_error_threshold: usize,
}

impl Default for TorrentConf {
    fn default() -> Self {
        TorrentConf {
            piece_length: 4 * 1024 * 1024,
            announce_interval: Duration::from_secs(5 * 60),
            announce_timeout: Duration::from_secs(10),
            conn_tti: Duration::from_secs(2 * 60),
            leecher_tti: Duration::from_secs(10 * 60),
            seeder_tti: Duration::from_secs(30 * 60),
            preemption_interval: Duration::from_secs(30),
            blacklist_duration_base: Duration::from_secs(30),
            blacklist_duration_max: Duration::from_secs(30 * 60),
            max_conns_per_torrent: 50,
            max_global_conns: 500,
            max_pipeline_depth: 5,
            endgame_threshold: 4,
            egress_bits_per_sec: 200 * 1024 * 1024 * 8,
            ingress_bits_per_sec: 200 * 1024 * 1024 * 8,
            token_size: 16 * 1024 * 8,
            bandwidth_disable: false,
            download_timeout: Duration::from_secs(2 * 60),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            tracker_error_threshold: 15,
        }
    }
}

/// (De)serializes a [`Duration`] as a whole number of seconds, for
/// `Conf::from_toml_str` convenience loading.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
