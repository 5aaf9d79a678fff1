//! C6: process-wide connection accounting.
//!
//! Spec §4.6 is explicit that this state "mutated only on the event loop",
//! so this is a plain struct with `&mut self` methods, not wrapped in a
//! `Mutex` or an actor of its own — [`crate::scheduler`] owns one instance
//! and calls into it directly.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::{backoff::Backoff, error::peer::BlacklistSeverity, ConnKey, InfoHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    #[error("connection key is blacklisted")]
    Blacklisted,
    #[error("connection capacity full")]
    CapacityFull,
}

struct BlacklistEntry {
    until: Instant,
    /// Consecutive failures observed for this key, used to compute the next
    /// backoff if it reoffends before the entry expires.
    failures: u32,
    /// The severity that most recently put this key on the blacklist, kept
    /// as the `reason` half of spec §3's `BlacklistEntry = (ConnKey,
    /// expires_at, reason)`.
    reason: BlacklistSeverity,
}

/// One entry of [`ConnState::snapshot`]'s blacklist view (spec §4.6's
/// `Snapshot()`: "returns a list of current blacklist entries").
#[derive(Debug, Clone, Copy)]
pub struct BlacklistSnapshotEntry {
    pub key: ConnKey,
    pub expires_at: Instant,
    pub reason: BlacklistSeverity,
}

/// Process-wide connection pool accounting: reservation, promotion,
/// capacity caps, and the blacklist.
pub struct ConnState {
    max_conns_per_torrent: usize,
    max_global_conns: usize,
    short_backoff: Backoff,
    long_backoff: Backoff,

    pending: HashSet<ConnKey>,
    active: HashSet<ConnKey>,
    per_torrent_count: HashMap<InfoHash, usize>,
    blacklist: HashMap<ConnKey, BlacklistEntry>,
}

/// A point-in-time view for [`crate::alert`]'s stats surface and for
/// observability callers wanting to inspect the blacklist directly (spec
/// §8 scenario 4: "A appears in B's blacklist snapshot").
#[derive(Debug, Clone)]
pub struct ConnStateSnapshot {
    pub pending: usize,
    pub active: usize,
    pub blacklist: Vec<BlacklistSnapshotEntry>,
}

impl ConnStateSnapshot {
    pub fn blacklisted_len(&self) -> usize {
        self.blacklist.len()
    }

    pub fn find(&self, key: &ConnKey) -> Option<&BlacklistSnapshotEntry> {
        self.blacklist.iter().find(|e| &e.key == key)
    }
}

impl ConnState {
    pub fn new(
        max_conns_per_torrent: usize,
        max_global_conns: usize,
        blacklist_duration_base: Duration,
        blacklist_duration_max: Duration,
    ) -> Self {
        Self {
            max_conns_per_torrent,
            max_global_conns,
            short_backoff: Backoff::new(blacklist_duration_base, blacklist_duration_max),
            // "handshake mismatch"/"piece corruption" peers are more
            // strongly suspect than a transient IO hiccup, so long-severity
            // failures start the exponential ladder four rungs up rather
            // than getting their own separate config knobs.
            long_backoff: Backoff::new(blacklist_duration_base * 16, blacklist_duration_max),
            pending: HashSet::new(),
            active: HashSet::new(),
            per_torrent_count: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    /// Reserves a connection slot for `key`, moving it into `pending`.
    pub fn try_reserve(&mut self, key: ConnKey) -> Result<(), ReserveError> {
        if self.is_blacklisted(&key) {
            return Err(ReserveError::Blacklisted);
        }
        if self.active.len() + self.pending.len() >= self.max_global_conns {
            return Err(ReserveError::CapacityFull);
        }
        let per_torrent = self.per_torrent_count.get(&key.info_hash).copied().unwrap_or(0);
        if per_torrent >= self.max_conns_per_torrent {
            return Err(ReserveError::CapacityFull);
        }

        self.pending.insert(key);
        *self.per_torrent_count.entry(key.info_hash).or_insert(0) += 1;
        Ok(())
    }

    /// Moves a reserved connection from `pending` to `active`.
    pub fn promote(&mut self, key: ConnKey) {
        if self.pending.remove(&key) {
            self.active.insert(key);
        }
    }

    /// Releases `key`'s slot and, unless `severity` is
    /// [`BlacklistSeverity::None`], blacklists it for an exponentially
    /// increasing duration based on its consecutive failure count.
    pub fn drop_conn(&mut self, key: ConnKey, severity: BlacklistSeverity) {
        self.pending.remove(&key);
        self.active.remove(&key);
        if let Some(count) = self.per_torrent_count.get_mut(&key.info_hash) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_torrent_count.remove(&key.info_hash);
            }
        }

        match severity {
            BlacklistSeverity::None => {
                self.blacklist.remove(&key);
            }
            BlacklistSeverity::Short | BlacklistSeverity::Long => {
                let failures = self.blacklist.get(&key).map(|e| e.failures + 1).unwrap_or(1);
                let backoff = match severity {
                    BlacklistSeverity::Long => &self.long_backoff,
                    _ => &self.short_backoff,
                };
                let duration = backoff.delay(failures.saturating_sub(1));
                self.blacklist.insert(key, BlacklistEntry { until: Instant::now() + duration, failures, reason: severity });
            }
        }
    }

    /// Whether `key` is *currently* banned. Expired entries are left in the
    /// blacklist map (not purged) so their `failures` counter survives past
    /// expiry — otherwise a reoffending peer, which can only be re-dropped
    /// after successfully reserving again, would always recompute
    /// `failures = 1` and the ban would never escalate past `base * 2^0`
    /// (spec §4.6: "duration determined by consecutive-failure count").
    pub fn is_blacklisted(&self, key: &ConnKey) -> bool {
        self.blacklist.get(key).is_some_and(|entry| entry.until > Instant::now())
    }

    pub fn snapshot(&self) -> ConnStateSnapshot {
        let now = Instant::now();
        ConnStateSnapshot {
            pending: self.pending.len(),
            active: self.active.len(),
            // expired entries are kept around internally for their failure
            // history (see `is_blacklisted`) but aren't "current" bans, so
            // they're filtered out of the observability view here.
            blacklist: self
                .blacklist
                .iter()
                .filter(|(_, e)| e.until > now)
                .map(|(key, e)| BlacklistSnapshotEntry { key: *key, expires_at: e.until, reason: e.reason })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InfoHash;

    fn key(b: u8) -> ConnKey {
        ConnKey::new([b; 20], InfoHash::from([1u8; 20]))
    }

    fn conn_state() -> ConnState {
        ConnState::new(2, 3, Duration::from_millis(10), Duration::from_secs(1))
    }

    #[test]
    fn reserve_promote_and_drop_cycle() {
        let mut state = conn_state();
        state.try_reserve(key(1)).unwrap();
        assert_eq!(state.snapshot().pending, 1);
        state.promote(key(1));
        assert_eq!(state.snapshot().active, 1);
        state.drop_conn(key(1), BlacklistSeverity::None);
        let snap = state.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.blacklisted_len(), 0);
    }

    #[test]
    fn snapshot_exposes_blacklist_reason_and_expiry() {
        let mut state = conn_state();
        state.try_reserve(key(1)).unwrap();
        state.drop_conn(key(1), BlacklistSeverity::Long);

        let snap = state.snapshot();
        let entry = snap.find(&key(1)).expect("key(1) should be in the blacklist snapshot");
        assert_eq!(entry.reason, BlacklistSeverity::Long);
        assert!(entry.expires_at > Instant::now());
    }

    #[test]
    fn per_torrent_cap_is_enforced() {
        let mut state = conn_state();
        state.try_reserve(key(1)).unwrap();
        state.try_reserve(key(2)).unwrap();
        assert!(matches!(state.try_reserve(key(3)), Err(ReserveError::CapacityFull)));
    }

    #[test]
    fn global_cap_is_enforced_across_torrents() {
        let mut state = ConnState::new(10, 2, Duration::from_millis(10), Duration::from_secs(1));
        let other_torrent_key =
            |b: u8| ConnKey::new([b; 20], InfoHash::from([2u8; 20]));
        state.try_reserve(key(1)).unwrap();
        state.try_reserve(other_torrent_key(2)).unwrap();
        assert!(matches!(state.try_reserve(key(3)), Err(ReserveError::CapacityFull)));
    }

    #[test]
    fn blacklisted_key_is_rejected_until_expiry() {
        let mut state = conn_state();
        state.try_reserve(key(1)).unwrap();
        state.drop_conn(key(1), BlacklistSeverity::Short);
        assert!(matches!(state.try_reserve(key(1)), Err(ReserveError::Blacklisted)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(state.try_reserve(key(1)).is_ok());
    }

    #[test]
    fn repeated_failures_escalate_duration() {
        let mut state = conn_state();
        state.try_reserve(key(1)).unwrap();
        let before_first_drop = Instant::now();
        state.drop_conn(key(1), BlacklistSeverity::Short);
        let first_duration = state.blacklist.get(&key(1)).unwrap().until - before_first_drop;
        assert_eq!(state.blacklist.get(&key(1)).unwrap().failures, 1);

        // force it expired; the failure count must survive the expiry so a
        // reoffending peer's next drop escalates rather than restarting at
        // `base * 2^0`.
        state.blacklist.get_mut(&key(1)).unwrap().until = Instant::now() - Duration::from_millis(1);
        assert!(state.try_reserve(key(1)).is_ok());
        let before_second_drop = Instant::now();
        state.drop_conn(key(1), BlacklistSeverity::Short);
        let second_duration = state.blacklist.get(&key(1)).unwrap().until - before_second_drop;

        assert_eq!(state.blacklist.get(&key(1)).unwrap().failures, 2);
        assert!(second_duration > first_duration, "second ban ({second_duration:?}) must exceed the first ({first_duration:?})");
    }
}
