//! This module defines the alerts the API user may receive from the
//! scheduler (C7).
//!
//! Communication of such alerts is performed via an unbounded
//! [`tokio::sync::mpsc`] channel. The application embedding this crate can
//! be driven partly or entirely off this channel rather than polling.
//!
//! # Optional information
//!
//! By default, only the most basic alerts are broadcast from the scheduler.
//! Stats emission (`EmitStats`) is on an interval of its own rather than
//! firing on every connection/piece event, keeping the common case cheap.

use crate::connstate::ConnStateSnapshot;
use crate::error::Error;
use crate::InfoHash;

pub enum Alert {
    /// Every piece is `done` and the blob has moved to `cache/`.
    TorrentComplete(InfoHash),
    /// Periodic snapshot emitted on `EmitStats` (spec §4.7): open
    /// connection counts, blacklist size, and a throughput sample.
    Stats {
        conns: ConnStateSnapshot,
        throughput: Throughput,
    },
    Error(Error),
}

/// Bytes moved since the previous `EmitStats` tick, not a cumulative total —
/// consumers wanting a rate divide by the configured stats interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct Throughput {
    pub egress_bytes: u64,
    pub ingress_bytes: u64,
}
