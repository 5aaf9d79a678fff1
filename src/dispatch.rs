//! C5: per-torrent piece-request dispatch.
//!
//! Rarest-first selection with random tie-break, endgame duplication below
//! `endgame_threshold`, and bitfield/request-table mutation serialized
//! behind a single `std::sync::Mutex` — per spec §4.5, this state is "never
//! shared...across goroutines" without it, and unlike [`crate::connstate`]
//! many connection tasks (not just the event loop) touch it concurrently.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::seq::SliceRandom;

use crate::{Bitfield, PeerId, PieceIndex};

/// Per-torrent dispatch state, shared (via `Arc`) by every connection task
/// for that torrent.
pub struct Dispatcher {
    piece_count: usize,
    endgame_threshold: usize,
    state: Mutex<State>,
}

struct State {
    /// Our own completion bitfield, mirrored from disk so piece selection
    /// doesn't need to round-trip through the disk task.
    own: Bitfield,
    /// Each connected peer's advertised bitfield.
    remote: HashMap<PeerId, Bitfield>,
    /// For each not-yet-done piece, the peers we've sent a `piece_request`
    /// to and are awaiting a reply from. Endgame duplicates a piece across
    /// multiple peers once remaining work drops below `endgame_threshold`.
    outstanding: HashMap<PieceIndex, Vec<PeerId>>,
}

impl Dispatcher {
    pub fn new(piece_count: usize, endgame_threshold: usize, own: Bitfield) -> Self {
        Self {
            piece_count,
            endgame_threshold,
            state: Mutex::new(State { own, remote: HashMap::new(), outstanding: HashMap::new() }),
        }
    }

    pub fn peer_connected(&self, peer: PeerId, bitfield: Bitfield) {
        self.state.lock().unwrap().remote.insert(peer, bitfield);
    }

    pub fn peer_disconnected(&self, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        state.remote.remove(&peer);
        for peers in state.outstanding.values_mut() {
            peers.retain(|p| p != &peer);
        }
    }

    pub fn peer_announced(&self, peer: PeerId, index: PieceIndex) {
        let mut state = self.state.lock().unwrap();
        if let Some(bf) = state.remote.get_mut(&peer) {
            if index < bf.len() {
                bf.set(index, true);
            }
        }
    }

    /// Marks a piece as locally done (called once [`crate::disk`] confirms
    /// the write), clearing its outstanding-request bookkeeping.
    ///
    /// Returns the peers (other than `from`) this piece had outstanding
    /// requests against — the caller sends them `cancel_piece`, per the
    /// Open Question resolution that endgame frees slots on cancel-send, not
    /// on peer ack.
    pub fn piece_done(&self, index: PieceIndex, from: PeerId) -> Vec<PeerId> {
        let mut state = self.state.lock().unwrap();
        if index < state.own.len() {
            state.own.set(index, true);
        }
        state.outstanding.remove(&index).map(|peers| peers.into_iter().filter(|p| p != &from).collect()).unwrap_or_default()
    }

    /// Releases one outstanding request for `(index, peer)` without marking
    /// the piece done — used when a request times out (spec §5's
    /// `request_timeout`) so the piece becomes requestable again, by this
    /// connection's own retry or by any other connection's next pipeline
    /// fill, rather than staying wedged until the whole connection's
    /// `conn_tti` expires.
    pub fn release_request(&self, index: PieceIndex, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(peers) = state.outstanding.get_mut(&index) {
            peers.retain(|p| p != &peer);
            if peers.is_empty() {
                state.outstanding.remove(&index);
            }
        }
    }

    /// Picks the next piece to request from `peer`, by rarest-first among
    /// pieces `peer` has and we don't, with a random tie-break among
    /// equally-rare candidates. Once fewer than `endgame_threshold` pieces
    /// remain, pieces already requested from someone else are eligible
    /// again (duplicated), so a slow peer can't stall the tail of a
    /// download.
    pub fn pick_next_piece(&self, peer: PeerId) -> Option<PieceIndex> {
        let mut state = self.state.lock().unwrap();
        let remote_bf = state.remote.get(&peer)?.clone();

        let missing: Vec<PieceIndex> =
            (0..self.piece_count).filter(|&i| !state.own.get(i).map(|b| *b).unwrap_or(false)).collect();
        if missing.is_empty() {
            return None;
        }
        let endgame = missing.len() < self.endgame_threshold;

        let candidates: Vec<PieceIndex> = missing
            .into_iter()
            .filter(|&i| remote_bf.get(i).map(|b| *b).unwrap_or(false))
            .filter(|i| endgame || state.outstanding.get(i).map(|v| v.is_empty()).unwrap_or(true))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let rarity = |index: &PieceIndex| {
            state.remote.values().filter(|bf| bf.get(*index).map(|b| *b).unwrap_or(false)).count()
        };
        let min_rarity = candidates.iter().map(rarity).min().unwrap();
        let rarest: Vec<PieceIndex> = candidates.into_iter().filter(|i| rarity(i) == min_rarity).collect();
        let chosen = *rarest.choose(&mut rand::thread_rng()).expect("non-empty");

        state.outstanding.entry(chosen).or_default().push(peer);
        Some(chosen)
    }

    /// The set of pieces we have that `peer` doesn't, used to answer a
    /// handshake with which `announce_piece`s to send immediately.
    pub fn pieces_to_announce(&self, peer: PeerId) -> Vec<PieceIndex> {
        let state = self.state.lock().unwrap();
        let Some(remote_bf) = state.remote.get(&peer) else {
            return (0..self.piece_count).filter(|&i| state.own.get(i).map(|b| *b).unwrap_or(false)).collect();
        };
        (0..self.piece_count)
            .filter(|&i| state.own.get(i).map(|b| *b).unwrap_or(false))
            .filter(|&i| !remote_bf.get(i).map(|b| *b).unwrap_or(false))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        (0..self.piece_count).all(|i| state.own.get(i).map(|b| *b).unwrap_or(false))
    }

    /// A snapshot of our own completion bitfield, for building the handshake
    /// sent to a newly dialed or accepted peer.
    pub fn own_bitfield(&self) -> Bitfield {
        self.state.lock().unwrap().own.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(bits: &[bool]) -> Bitfield {
        Bitfield::from_iter(bits.iter().copied())
    }

    #[test]
    fn rarest_first_prefers_less_available_piece() {
        let d = Dispatcher::new(3, 1, bf(&[false, false, false]));
        d.peer_connected([1u8; 20], bf(&[true, true, false]));
        d.peer_connected([2u8; 20], bf(&[true, false, false]));

        // piece 0 is held by both peers, piece 1 only by peer 1: rarer.
        let picked = d.pick_next_piece([1u8; 20]);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn piece_done_clears_outstanding_and_reports_other_requesters() {
        let d = Dispatcher::new(2, 1, bf(&[false, false]));
        d.peer_connected([1u8; 20], bf(&[true, true]));
        d.peer_connected([2u8; 20], bf(&[true, true]));
        assert_eq!(d.pick_next_piece([1u8; 20]), Some(0));

        // force endgame duplication
        d.peer_announced([1u8; 20], 1);
        let _ = d.pick_next_piece([2u8; 20]);

        let others = d.piece_done(0, [1u8; 20]);
        assert!(!others.contains(&[1u8; 20]));
    }

    #[test]
    fn complete_when_every_piece_owned() {
        let d = Dispatcher::new(2, 1, bf(&[false, false]));
        assert!(!d.is_complete());
        d.piece_done(0, [0u8; 20]);
        d.piece_done(1, [0u8; 20]);
        assert!(d.is_complete());
    }

    #[test]
    fn pieces_to_announce_is_local_minus_remote() {
        let d = Dispatcher::new(2, 1, bf(&[true, false]));
        d.peer_connected([1u8; 20], bf(&[false, false]));
        assert_eq!(d.pieces_to_announce([1u8; 20]), vec![0]);
    }

    #[test]
    fn release_request_frees_a_timed_out_piece_for_retry() {
        // endgame_threshold 0 means a single missing piece never enters
        // endgame, so a second request for it is only possible once the
        // first is released.
        let d = Dispatcher::new(1, 0, bf(&[false]));
        d.peer_connected([1u8; 20], bf(&[true]));

        assert_eq!(d.pick_next_piece([1u8; 20]), Some(0));
        assert_eq!(d.pick_next_piece([1u8; 20]), None);

        d.release_request(0, [1u8; 20]);
        assert_eq!(d.pick_next_piece([1u8; 20]), Some(0));
    }
}
