use std::net::IpAddr;

use crate::{InfoHash, PeerId};

/// Parameters for a single announce call (spec §6's tracker HTTP API).
///
/// Unlike the BitTorrent BEP-0003 announce this protocol's tracker has no
/// notion of bytes uploaded/downloaded/left or announce events — a torrent
/// is either still incomplete or `complete`, nothing more.
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// The address peers should dial to reach this process.
    pub ip: IpAddr,
    pub port: u16,
    /// Set once every piece is `done` and the blob has moved to `cache/`
    /// (see the Open Question this resolves in `DESIGN.md`).
    pub complete: bool,
}
