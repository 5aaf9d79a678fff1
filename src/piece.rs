//! The per-piece state machine (spec §3, §4.1): `empty -> dirty -> (clean |
//! empty) -> done`, implemented as an atomic byte per piece so that
//! `empty -> dirty` can be taken as a compare-and-swap reservation without a
//! lock, matching spec's "reserves the piece (empty->dirty atomically via a
//! compare-and-swap on the status byte)".

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::disk::WriteError;

const EMPTY: u8 = 0;
const DIRTY: u8 = 1;
const CLEAN: u8 = 2;
const DONE: u8 = 3;

/// A single piece's on-disk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No writer holds this piece and it has no verified bytes.
    Empty,
    /// A writer is currently streaming bytes into this piece; no other
    /// writer may take it.
    Dirty,
    /// Bytes are written and hash-verified but not yet durably reported as
    /// `done` (this state is transient and collapses into `Done`
    /// immediately on a successful write; kept distinct to mirror the state
    /// machine spec names explicitly).
    Clean,
    /// Bytes were written and SHA-1 verified. Never regresses.
    Done,
}

impl From<u8> for PieceState {
    fn from(byte: u8) -> Self {
        match byte {
            EMPTY => PieceState::Empty,
            DIRTY => PieceState::Dirty,
            CLEAN => PieceState::Clean,
            DONE => PieceState::Done,
            other => panic!("invalid piece state byte {other}"),
        }
    }
}

impl From<PieceState> for u8 {
    fn from(state: PieceState) -> Self {
        match state {
            PieceState::Empty => EMPTY,
            PieceState::Dirty => DIRTY,
            PieceState::Clean => CLEAN,
            PieceState::Done => DONE,
        }
    }
}

/// A lock-free per-piece status cell.
///
/// This is the in-memory mirror of the on-disk status byte described in
/// spec §6 (`metadata/<hex>/pieces`); [`crate::disk::torrent::Torrent`] is
/// responsible for keeping the two in sync.
#[derive(Debug)]
pub struct PieceCell(AtomicU8);

impl PieceCell {
    pub fn new(state: PieceState) -> Self {
        Self(AtomicU8::new(state.into()))
    }

    pub fn load(&self) -> PieceState {
        self.0.load(Ordering::Acquire).into()
    }

    /// Attempts to reserve this piece for writing: `empty -> dirty`.
    ///
    /// Returns `Err(ErrPieceTaken)` if the piece is not currently `empty`
    /// (including if it's already `done`).
    pub fn try_reserve(&self) -> Result<(), WriteError> {
        self.0
            .compare_exchange(EMPTY, DIRTY, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| WriteError::PieceTaken)
    }

    /// Marks a reserved (`dirty`) piece as verified and complete:
    /// `dirty -> done`. The `clean` state is collapsed into this single
    /// transition since nothing observes a piece between "hash verified"
    /// and "durably done" in this design.
    pub fn complete(&self) {
        let prev = self.0.swap(DONE, Ordering::AcqRel);
        debug_assert_eq!(prev, DIRTY, "completed a piece that wasn't dirty");
    }

    /// Releases a failed reservation back to `empty`: `dirty -> empty`.
    /// Called on hash mismatch or I/O error during a write.
    pub fn fail(&self) {
        let prev = self.0.swap(EMPTY, Ordering::AcqRel);
        debug_assert_eq!(prev, DIRTY, "failed a piece that wasn't dirty");
    }

    pub fn is_done(&self) -> bool {
        matches!(self.load(), PieceState::Done)
    }
}

impl Clone for PieceCell {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_complete() {
        let cell = PieceCell::new(PieceState::Empty);
        cell.try_reserve().unwrap();
        assert_eq!(cell.load(), PieceState::Dirty);
        cell.complete();
        assert_eq!(cell.load(), PieceState::Done);
        assert!(cell.is_done());
    }

    #[test]
    fn double_reserve_fails() {
        let cell = PieceCell::new(PieceState::Empty);
        cell.try_reserve().unwrap();
        assert!(matches!(cell.try_reserve(), Err(WriteError::PieceTaken)));
    }

    #[test]
    fn failed_write_returns_to_empty() {
        let cell = PieceCell::new(PieceState::Empty);
        cell.try_reserve().unwrap();
        cell.fail();
        assert_eq!(cell.load(), PieceState::Empty);
        // can be reserved again
        cell.try_reserve().unwrap();
    }

    #[test]
    fn done_piece_cannot_be_reserved() {
        let cell = PieceCell::new(PieceState::Done);
        assert!(matches!(cell.try_reserve(), Err(WriteError::PieceTaken)));
    }

    #[test]
    fn restart_recovery_resets_dirty_to_empty() {
        // simulates what Torrent::open does on process restart: a piece
        // that was dirty when the process died is not resumable, so it
        // resets to empty; a done piece stays done.
        let dirty = PieceCell::new(PieceState::Dirty);
        let recovered = if matches!(dirty.load(), PieceState::Dirty) {
            PieceCell::new(PieceState::Empty)
        } else {
            dirty
        };
        assert_eq!(recovered.load(), PieceState::Empty);

        let done = PieceCell::new(PieceState::Done);
        assert_eq!(done.load(), PieceState::Done);
    }
}
