use std::fmt;

use crate::{PeerId, Sha1Hash};

/// 20-byte identifier of a torrent, the canonical SHA-1 hash of its metainfo
/// bytes. Used as the torrent's identity on the wire and at the tracker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash(Sha1Hash);

impl InfoHash {
    pub fn new(bytes: Sha1Hash) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &Sha1Hash {
        &self.0
    }
}

impl From<Sha1Hash> for InfoHash {
    fn from(bytes: Sha1Hash) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

/// Identifies a single `(peer, torrent)` connection across the process: at
/// most one [`crate::conn::Connection`] may exist for a given `ConnKey` at a
/// time, whether dialed or accepted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
}

impl ConnKey {
    pub fn new(peer_id: PeerId, info_hash: InfoHash) -> Self {
        Self { peer_id, info_hash }
    }
}

impl fmt::Debug for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnKey(peer={}, info_hash={})",
            hex::encode(self.peer_id),
            self.info_hash
        )
    }
}
