//! C7: the scheduler event loop.
//!
//! A single task owns all the
//! state that must be mutated in a defined order (the connection pool
//! accounting, the announce queue, the per-torrent dispatchers, the
//! archive), driven entirely from one `tokio::select!` over a command
//! channel and a handful of interval timers. Anything that touches the
//! network or disk — handshakes, tracker announces, dials — runs on its own
//! spawned task and reports back into the loop as an event, so the loop
//! itself never awaits I/O directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::alert::{Alert, Throughput};
use crate::announce_queue::{AnnounceQueue, DisabledQueue, Queue};
use crate::archive::Archive;
use crate::bandwidth::BandwidthLimiter;
use crate::conf::Conf;
use crate::conn::{self, ConnCommand, ConnConf, ConnEvent, ConnHandle};
use crate::connstate::{ConnState, ConnStateSnapshot};
use crate::disk;
use crate::dispatch::Dispatcher;
use crate::error::peer::BlacklistSeverity;
use crate::error::torrent::TorrentError;
use crate::tracker::prelude::{AnnounceParams, Tracker, TrackerResponse};
use crate::wire::Handshake;
use crate::{ConnKey, InfoHash, PeerId};

/// The public handle for interacting with a running scheduler: cheaply
/// cloneable, safe to share across every task that needs to add/cancel
/// torrents or hand it an accepted socket.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Resolves `name` to a torrent, starting the swarm if not already
    /// running, and waits for it to become complete. Returns the path of
    /// the finished blob in `cache/`.
    pub async fn add_torrent(&self, namespace: String, name: String) -> Result<PathBuf, TorrentError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddTorrent { namespace, name, result_tx })
            .map_err(|_| TorrentError::Channel)?;
        result_rx.await.map_err(|_| TorrentError::Channel)?
    }

    pub fn cancel_torrent(&self, name: String) {
        let _ = self.cmd_tx.send(Command::CancelTorrent { name });
    }

    pub fn reload(&self, torrent_conf: Arc<crate::conf::TorrentConf>) {
        let _ = self.cmd_tx.send(Command::Reload { torrent_conf });
    }

    /// Returns a point-in-time view of the process-wide connection pool
    /// (C6), including the blacklist (spec §4.6's `Snapshot()`). Used by
    /// observability tooling and by tests asserting on blacklist state.
    pub async fn conn_snapshot(&self) -> Option<ConnStateSnapshot> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx.send(Command::ConnSnapshot { result_tx }).ok()?;
        result_rx.await.ok()
    }

    /// This process's own peer id and the address it actually accepts
    /// connections on (the listener's resolved `local_addr`, not the
    /// possibly-ephemeral configured one). What a host process announces to
    /// the tracker as its own dial-back address; also used by tests that
    /// need to hand another peer's announce response this address directly.
    pub async fn local_info(&self) -> Option<(PeerId, SocketAddr)> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx.send(Command::LocalInfo { result_tx }).ok()?;
        result_rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    fn incoming(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = self.cmd_tx.send(Command::IncomingConn { stream, peer_addr });
    }
}

/// Commands accepted on the scheduler's public channel.
enum Command {
    AddTorrent { namespace: String, name: String, result_tx: oneshot::Sender<Result<PathBuf, TorrentError>> },
    CancelTorrent { name: String },
    IncomingConn { stream: TcpStream, peer_addr: SocketAddr },
    Reload { torrent_conf: Arc<crate::conf::TorrentConf> },
    ConnSnapshot { result_tx: oneshot::Sender<ConnStateSnapshot> },
    LocalInfo { result_tx: oneshot::Sender<(PeerId, SocketAddr)> },
    Shutdown,
}

/// Events produced by tasks the loop spawned, multiplexed alongside
/// [`Command`] in the main `select!` — see module docs.
enum Internal {
    Cmd(Command),
    Conn(ConnEvent),
    Resolved {
        handle: Arc<crate::archive::TorrentHandle>,
        endgame_threshold: usize,
        result_tx: oneshot::Sender<Result<PathBuf, TorrentError>>,
    },
    HandshakeRead { peer_addr: SocketAddr, result: Result<(TcpStream, Handshake), ()> },
    AcceptFinished { info_hash: InfoHash, result: Result<ConnHandle, ()> },
    DialFinished { info_hash: InfoHash, addr: SocketAddr, reserved_key: Option<ConnKey>, result: Result<ConnHandle, ()> },
    Announced { info_hash: InfoHash, result: crate::error::tracker::Result<TrackerResponse> },
    AnnounceTick,
    PreemptionTick,
    EmitStats,
}

/// Why a torrent was cancelled, distinct from [`TorrentError`] so it can be
/// `Copy` and handed to every waiter without cloning an error type.
#[derive(Debug, Clone, Copy)]
enum CancelReason {
    Requested,
    LeecherTimeout,
}

impl From<CancelReason> for TorrentError {
    fn from(value: CancelReason) -> Self {
        match value {
            CancelReason::Requested => TorrentError::Cancelled,
            CancelReason::LeecherTimeout => TorrentError::Timeout,
        }
    }
}

struct TorrentEntry {
    dispatcher: Arc<Dispatcher>,
    store_name: String,
    conns: HashMap<PeerId, ConnHandle>,
    waiters: Vec<oneshot::Sender<Result<PathBuf, TorrentError>>>,
    created_at: Instant,
    completed_at: Option<Instant>,
    /// True once this torrent's completion has been reported to waiters and
    /// announced; avoids re-triggering the completion effects on every
    /// subsequent `PieceDone` for a torrent that was already done (e.g. a
    /// duplicate announce in endgame).
    reported_complete: bool,
    /// Consecutive transient announce failures (network errors, tracker
    /// 5xx) against this torrent; reset to 0 on any successful announce.
    /// Once it reaches `tracker_error_threshold`, the torrent stops
    /// announcing (spec §4.3: "errors are counted but not fatal") but
    /// keeps running off whatever peers it already has.
    announce_failures: usize,
}

/// The running event loop's state. Constructed by [`spawn`], which returns a
/// [`SchedulerHandle`] and the loop's `JoinHandle`.
pub struct Scheduler {
    conf: Arc<Conf>,
    torrent_conf: Arc<crate::conf::TorrentConf>,
    peer_id: PeerId,
    archive: Arc<Archive>,
    disk_tx: disk::Sender,
    bandwidth: Arc<BandwidthLimiter>,
    tracker: Arc<Tracker>,
    conn_state: ConnState,
    queue: Box<dyn AnnounceQueue>,
    torrents: HashMap<InfoHash, TorrentEntry>,
    name_to_hash: HashMap<String, InfoHash>,
    alert_tx: Option<mpsc::UnboundedSender<Alert>>,
    conn_events_tx: mpsc::UnboundedSender<ConnEvent>,
    conn_events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    /// What we announce as our dial-back address. Taken from the listener's
    /// actual bound `local_addr()` rather than `conf.engine.listen_addr`
    /// directly, since a configured port of `0` (ephemeral) only resolves to
    /// a real port once the listener is bound.
    local_addr: SocketAddr,
    /// Running totals for the current `EmitStats` window; reset on each
    /// tick after being folded into an [`Alert::Stats`].
    egress_since_last_stats: u64,
    ingress_since_last_stats: u64,
}

/// Starts the scheduler's event loop and, if `engine.listen_addr` binds
/// successfully, its accept loop. `alert_tx` is optional: a caller not
/// interested in `EmitStats`/`TorrentComplete` notifications may omit it.
/// `ownership` is `Some` only on an origin peer process (spec §4.9): its
/// presence makes the archive pull a blob's very first copy directly from
/// `origin.download` for every digest this host is the rendezvous owner of,
/// rather than waiting on another peer to seed it first.
pub async fn spawn(
    conf: Conf,
    origin: Arc<dyn crate::origin::OriginClient>,
    ownership: Option<crate::archive::OriginOwnership>,
    alert_tx: Option<mpsc::UnboundedSender<Alert>>,
) -> std::io::Result<(SchedulerHandle, tokio::task::JoinHandle<()>)> {
    let conf = Arc::new(conf);
    let torrent_conf = Arc::new(conf.torrent.clone());
    let peer_id = conf.engine.peer_id_factory.generate(conf.engine.listen_addr);

    let (disk_tx, _disk_join) = disk::spawn(conf.engine.store_root.clone());
    let archive = Arc::new(Archive::with_ownership(origin, disk_tx.clone(), conf.engine.metainfo_cache_size, ownership));
    let bandwidth = Arc::new(BandwidthLimiter::new(
        torrent_conf.egress_bits_per_sec,
        torrent_conf.ingress_bits_per_sec,
        torrent_conf.token_size,
        torrent_conf.bandwidth_disable,
    ));
    let tracker = Arc::new(Tracker::new(conf.engine.tracker_url.clone()));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (conn_events_tx, conn_events_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let queue: Box<dyn AnnounceQueue> =
        if conf.engine.announce_disabled { Box::new(DisabledQueue) } else { Box::new(Queue::new()) };

    let listen_addr = conf.engine.listen_addr;
    let bound_listener = TcpListener::bind(listen_addr).await.ok();
    let local_addr = bound_listener
        .as_ref()
        .and_then(|l| l.local_addr().ok())
        .unwrap_or(listen_addr);

    let scheduler = Scheduler {
        conf: conf.clone(),
        torrent_conf,
        peer_id,
        archive,
        disk_tx,
        bandwidth,
        tracker,
        conn_state: ConnState::new(
            conf.torrent.max_conns_per_torrent,
            conf.torrent.max_global_conns,
            conf.torrent.blacklist_duration_base,
            conf.torrent.blacklist_duration_max,
        ),
        queue,
        torrents: HashMap::new(),
        name_to_hash: HashMap::new(),
        alert_tx,
        conn_events_tx,
        conn_events_rx,
        cmd_rx,
        internal_tx,
        internal_rx,
        local_addr,
        egress_since_last_stats: 0,
        ingress_since_last_stats: 0,
    };

    let handle = SchedulerHandle { cmd_tx };
    if let Some(listener) = bound_listener {
        let accept_handle = handle.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => accept_handle.incoming(stream, peer_addr),
                    Err(e) => {
                        log::warn!("accept loop error: {e}");
                        break;
                    }
                }
            }
        });
    } else {
        log::warn!("scheduler could not bind {listen_addr}, running dial-only");
    }

    let join = tokio::task::spawn(async move { scheduler.run().await });
    Ok((handle, join))
}

impl Scheduler {
    async fn run(mut self) {
        log::info!("scheduler starting, peer_id {}", hex::encode(self.peer_id));

        let mut announce_interval = tokio::time::interval(self.torrent_conf.announce_interval);
        let mut preemption_interval = tokio::time::interval(self.torrent_conf.preemption_interval);
        let mut stats_interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            let event = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => Internal::Cmd(cmd),
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => internal,
                Some(ev) = self.conn_events_rx.recv() => Internal::Conn(ev),
                _ = announce_interval.tick() => Internal::AnnounceTick,
                _ = preemption_interval.tick() => Internal::PreemptionTick,
                _ = stats_interval.tick() => Internal::EmitStats,
            };

            if self.handle_event(event).await {
                break;
            }
        }

        log::info!("scheduler shutting down");
    }

    /// Returns `true` if the loop should stop.
    async fn handle_event(&mut self, event: Internal) -> bool {
        match event {
            Internal::Cmd(Command::Shutdown) => return true,
            Internal::Cmd(Command::AddTorrent { namespace, name, result_tx }) => {
                self.add_torrent(namespace, name, result_tx).await
            }
            Internal::Cmd(Command::CancelTorrent { name }) => self.cancel_torrent(&name, CancelReason::Requested),
            Internal::Cmd(Command::IncomingConn { stream, peer_addr }) => self.incoming_conn(stream, peer_addr),
            Internal::Cmd(Command::Reload { torrent_conf }) => {
                log::info!("reloading torrent configuration");
                self.torrent_conf = torrent_conf;
            }
            Internal::Cmd(Command::ConnSnapshot { result_tx }) => {
                let _ = result_tx.send(self.conn_state.snapshot());
            }
            Internal::Cmd(Command::LocalInfo { result_tx }) => {
                let _ = result_tx.send((self.peer_id, self.local_addr));
            }
            Internal::Conn(ev) => self.conn_event(ev),
            Internal::Resolved { handle, endgame_threshold, result_tx } => {
                self.register_torrent(handle, endgame_threshold, result_tx)
            }
            Internal::HandshakeRead { peer_addr, result } => self.handshake_read(peer_addr, result),
            Internal::AcceptFinished { info_hash, result } => self.accept_finished(info_hash, result),
            Internal::DialFinished { info_hash, addr, reserved_key, result } => self.dial_finished(info_hash, addr, reserved_key, result),
            Internal::Announced { info_hash, result } => self.announced(info_hash, result),
            Internal::AnnounceTick => self.announce_tick(),
            Internal::PreemptionTick => self.preemption_tick(),
            Internal::EmitStats => self.emit_stats(),
        }
        false
    }

    /// `AddTorrent(name)`: resolve via the archive; if already complete
    /// reply immediately, else queue it for announcing and register a
    /// waiter to be woken by `PieceDone`'s completion check.
    ///
    /// `ErrMetaInfoPending` (origin still generating metainfo, spec §4.2) is
    /// transient (spec §7) and retried here with backoff rather than handed
    /// to the caller; `BlobClient::download`'s `download_timeout` is what
    /// eventually bounds how long that retry loop runs.
    async fn add_torrent(&mut self, namespace: String, name: String, result_tx: oneshot::Sender<Result<PathBuf, TorrentError>>) {
        let archive = self.archive.clone();
        let endgame_threshold = self.torrent_conf.endgame_threshold;
        let internal_tx = self.internal_tx.clone();
        let backoff = crate::backoff::Backoff::new(self.torrent_conf.blacklist_duration_base, self.torrent_conf.blacklist_duration_max);

        // resolution touches the network (origin) and disk; never run it on
        // the loop itself.
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                match archive.create_torrent(&namespace, &name).await {
                    Ok(handle) => {
                        let _ = internal_tx.send(Internal::Resolved { handle, endgame_threshold, result_tx });
                        return;
                    }
                    Err(crate::error::archive::ArchiveError::MetaInfoPending) => {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        let _ = result_tx.send(Err(e.into()));
                        return;
                    }
                }
            }
        });
    }

    fn register_torrent(&mut self, handle: Arc<crate::archive::TorrentHandle>, endgame_threshold: usize, result_tx: oneshot::Sender<Result<PathBuf, TorrentError>>) {
        let info_hash = handle.info_hash;
        self.name_to_hash.insert(handle.name.clone(), info_hash);

        let already_complete = handle.is_complete();
        let entry = self.torrents.entry(info_hash).or_insert_with(|| TorrentEntry {
            dispatcher: Arc::new(Dispatcher::new(handle.metainfo.piece_count(), endgame_threshold, handle.bitfield.clone())),
            store_name: handle.name.clone(),
            conns: HashMap::new(),
            waiters: Vec::new(),
            created_at: Instant::now(),
            completed_at: None,
            reported_complete: false,
            announce_failures: 0,
        });

        if already_complete {
            entry.reported_complete = true;
            entry.completed_at.get_or_insert_with(Instant::now);
            let _ = result_tx.send(Ok(self.cache_path(&handle.name)));
        } else {
            entry.waiters.push(result_tx);
        }
        // queued regardless of completeness: a seeder keeps announcing
        // `complete=true` at `announce_interval` so future leechers can
        // still discover it through the tracker, until `PreemptionTick`
        // evicts it after `seeder_tti` with no active connections.
        self.queue.add(info_hash);
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        crate::disk::cas::cache_path(&self.conf.engine.store_root, name)
    }

    /// `CancelTorrent(name)`: drop all conns for it, eject from the
    /// announce queue, and notify any outstanding waiters with `reason`.
    fn cancel_torrent(&mut self, name: &str, reason: CancelReason) {
        let Some(&info_hash) = self.name_to_hash.get(name) else { return };
        if let Some(mut entry) = self.torrents.remove(&info_hash) {
            for (_, conn) in entry.conns.drain() {
                let _ = conn.cmd_tx.send(ConnCommand::Shutdown);
            }
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Err(reason.into()));
            }
        }
        self.queue.eject(info_hash);
        self.name_to_hash.remove(name);
        self.archive.delete_torrent(name);
    }

    /// `IncomingConn(socket)`: read the handshake off-loop before touching
    /// any shared state, since it can take up to `handshake_timeout`.
    fn incoming_conn(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let handshake_timeout = self.torrent_conf.handshake_timeout;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let result = conn::read_remote_handshake(&mut stream, handshake_timeout).await;
            let event = match result {
                Ok(hs) => Internal::HandshakeRead { peer_addr, result: Ok((stream, hs)) },
                Err(e) => {
                    log::debug!("handshake from {peer_addr} failed: {e}");
                    Internal::HandshakeRead { peer_addr, result: Err(()) }
                }
            };
            let _ = internal_tx.send(event);
        });
    }

    fn handshake_read(&mut self, peer_addr: SocketAddr, result: Result<(TcpStream, Handshake), ()>) {
        let Ok((stream, remote)) = result else { return };
        let Some(entry) = self.torrents.get(&remote.info_hash) else {
            log::debug!("incoming handshake from {peer_addr} for unknown torrent");
            return;
        };

        let key = ConnKey::new(remote.peer_id, remote.info_hash);
        if let Err(e) = self.conn_state.try_reserve(key) {
            log::debug!("rejecting incoming conn from {peer_addr}: {e}");
            return;
        }
        self.conn_state.promote(key);

        let dispatcher = entry.dispatcher.clone();
        let local = conn::local_handshake(remote.info_hash, self.peer_id, entry.store_name.clone(), dispatcher.own_bitfield());
        let disk_tx = self.disk_tx.clone();
        let bandwidth = self.bandwidth.clone();
        let conn_events_tx = self.conn_events_tx.clone();
        let conn_conf = self.conn_conf();
        let internal_tx = self.internal_tx.clone();
        let info_hash = remote.info_hash;

        tokio::spawn(async move {
            let result = conn::finish_accept(stream, peer_addr, remote, local, disk_tx, dispatcher, bandwidth, conn_events_tx, conn_conf)
                .await
                .map_err(|_| ());
            let _ = internal_tx.send(Internal::AcceptFinished { info_hash, result });
        });
    }

    fn accept_finished(&mut self, info_hash: InfoHash, result: Result<ConnHandle, ()>) {
        let Ok(handle) = result else {
            return;
        };
        let key = handle.key;
        if let Some(entry) = self.torrents.get_mut(&info_hash) {
            entry.conns.insert(key.peer_id, handle);
        } else {
            // torrent was cancelled while the handshake was in flight.
            self.conn_state.drop_conn(key, BlacklistSeverity::None);
            let _ = handle.cmd_tx.send(ConnCommand::Shutdown);
        }
    }

    /// `OutgoingDial(peer, h)`: reserve a slot, then dial and handshake off
    /// the loop; the result comes back as [`Internal::DialFinished`].
    fn outgoing_dial(&mut self, info_hash: InfoHash, addr: SocketAddr, peer_id_hint: Option<PeerId>) {
        let Some(entry) = self.torrents.get(&info_hash) else { return };
        // a placeholder key using the address as a stand-in peer id would
        // defeat per-peer blacklist tracking, so dials without a known peer
        // id (first contact from a tracker-supplied address) skip the
        // reservation here entirely; the handshake path has no way to
        // release such a reservation if the dial never completes, so today
        // every call site supplies a hint (tracker announces always do).
        let reserved_key = match peer_id_hint {
            Some(peer_id) => {
                let key = ConnKey::new(peer_id, info_hash);
                if self.conn_state.try_reserve(key).is_err() {
                    return;
                }
                Some(key)
            }
            None => None,
        };

        let dispatcher = entry.dispatcher.clone();
        let local = conn::local_handshake(info_hash, self.peer_id, entry.store_name.clone(), dispatcher.own_bitfield());
        let disk_tx = self.disk_tx.clone();
        let bandwidth = self.bandwidth.clone();
        let conn_events_tx = self.conn_events_tx.clone();
        let conn_conf = self.conn_conf();
        let internal_tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = async {
                let stream = TcpStream::connect(addr).await.map_err(crate::error::peer::ConnError::from)?;
                conn::dial(stream, addr, local, info_hash, disk_tx, dispatcher, bandwidth, conn_events_tx, conn_conf).await
            }
            .await
            .map_err(|_| ());
            let _ = internal_tx.send(Internal::DialFinished { info_hash, addr, reserved_key, result });
        });
    }

    fn dial_finished(&mut self, info_hash: InfoHash, addr: SocketAddr, reserved_key: Option<ConnKey>, result: Result<ConnHandle, ()>) {
        let Ok(handle) = result else {
            log::debug!("dial to {addr} for torrent failed");
            // the reservation made before dialing has no connection to
            // release it now; drop it here instead of leaking the slot.
            if let Some(key) = reserved_key {
                self.conn_state.drop_conn(key, BlacklistSeverity::None);
            }
            return;
        };
        let key = handle.key;
        // `outgoing_dial` already reserved this key's slot before dialing;
        // just promote it to active now that the handshake succeeded.
        self.conn_state.promote(key);
        if let Some(entry) = self.torrents.get_mut(&info_hash) {
            entry.conns.insert(key.peer_id, handle);
        } else {
            let _ = handle.cmd_tx.send(ConnCommand::Shutdown);
        }
    }

    /// `ConnClosed(ConnKey, reason)`.
    fn conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Closed { key, severity } => {
                self.conn_state.drop_conn(key, severity);
                if let Some(entry) = self.torrents.get_mut(&key.info_hash) {
                    entry.conns.remove(&key.peer_id);
                    if entry.conns.is_empty() && entry.completed_at.is_none() {
                        // a leecher with zero connections re-announces
                        // sooner rather than waiting out the full interval.
                        self.queue.ready(key.info_hash);
                    }
                }
            }
            ConnEvent::PieceDone { key, index } => self.piece_done(key, index),
            ConnEvent::Throughput { egress_bytes, ingress_bytes } => {
                self.egress_since_last_stats += egress_bytes;
                self.ingress_since_last_stats += ingress_bytes;
            }
        }
    }

    /// `PieceDone(h, i)`: broadcast `announce_piece` to every other
    /// connection for this torrent, cancel the piece with anyone else it
    /// was outstanding against, and if the torrent is now complete notify
    /// waiters and start the seeder idle clock.
    fn piece_done(&mut self, key: ConnKey, index: crate::PieceIndex) {
        let store_root = self.conf.engine.store_root.clone();
        let Some(entry) = self.torrents.get_mut(&key.info_hash) else { return };
        let to_cancel = entry.dispatcher.piece_done(index, key.peer_id);

        for (peer_id, conn) in entry.conns.iter() {
            if *peer_id != key.peer_id {
                let _ = conn.cmd_tx.send(ConnCommand::AnnouncePiece(index));
            }
            if to_cancel.contains(peer_id) {
                let _ = conn.cmd_tx.send(ConnCommand::CancelPiece(index));
            }
        }

        if !entry.reported_complete && entry.dispatcher.is_complete() {
            entry.reported_complete = true;
            entry.completed_at = Some(Instant::now());
            let cache_path = crate::disk::cas::cache_path(&store_root, &entry.store_name);
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Ok(cache_path.clone()));
            }
            // deliberately not ejected from the announce queue: a freshly
            // completed torrent keeps announcing as a seeder (spec §4.3)
            // until `PreemptionTick` evicts it on `seeder_tti`.
            if let Some(tx) = &self.alert_tx {
                let _ = tx.send(Alert::TorrentComplete(key.info_hash));
            }
        }
    }

    /// `AnnounceTick`: for each ready torrent, announce and, once the
    /// tracker replies, hand back peer addresses to dial.
    fn announce_tick(&mut self) {
        while let Some(info_hash) = self.queue.next() {
            let Some(entry) = self.torrents.get(&info_hash) else { continue };
            let tracker = self.tracker.clone();
            let internal_tx = self.internal_tx.clone();
            let peer_id = self.peer_id;
            let listen_port = self.local_addr.port();
            let listen_ip = self.local_addr.ip();
            let complete = entry.completed_at.is_some();
            let announce_timeout = self.torrent_conf.announce_timeout;

            tokio::spawn(async move {
                let params = AnnounceParams { info_hash, peer_id, ip: listen_ip, port: listen_port, complete };
                let result = tokio::time::timeout(announce_timeout, tracker.announce(params))
                    .await
                    .unwrap_or(Err(crate::error::tracker::TrackerError::Timeout));
                let _ = internal_tx.send(Internal::Announced { info_hash, result });
            });
        }
    }

    fn announced(&mut self, info_hash: InfoHash, result: crate::error::tracker::Result<TrackerResponse>) {
        match result {
            Ok(resp) => {
                if let Some(entry) = self.torrents.get_mut(&info_hash) {
                    entry.announce_failures = 0;
                }
                self.queue.ready(info_hash);
                if let Some(entry) = self.torrents.get(&info_hash) {
                    let known: std::collections::HashSet<PeerId> = entry.conns.keys().copied().collect();
                    for peer in resp.peers {
                        if known.contains(&peer.peer_id) {
                            continue;
                        }
                        let addr = SocketAddr::new(peer.ip, peer.port);
                        self.outgoing_dial(info_hash, addr, Some(peer.peer_id));
                    }
                }
            }
            Err(crate::error::tracker::TrackerError::NotFound) => {
                // the tracker doesn't know this torrent; don't keep
                // hammering it, but leave the torrent itself running off
                // whatever peers it already has.
                log::debug!("tracker has no record of torrent, ejecting from announce queue");
                self.queue.eject(info_hash);
            }
            Err(e) => {
                log::warn!("announce failed: {e}");
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    return;
                };
                entry.announce_failures += 1;
                if entry.announce_failures >= self.torrent_conf.tracker_error_threshold {
                    log::warn!(
                        "torrent {} hit {} consecutive announce failures, giving up on this tracker",
                        entry.store_name,
                        entry.announce_failures
                    );
                    self.queue.eject(info_hash);
                    return;
                }
                self.queue.ready(info_hash);
            }
        }
    }

    /// `PreemptionTick`: age out stalled leechers, idle seeders, and idle
    /// connections.
    fn preemption_tick(&mut self) {
        let leecher_tti = self.torrent_conf.leecher_tti;
        let seeder_tti = self.torrent_conf.seeder_tti;
        let now = Instant::now();

        let timed_out: Vec<String> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.completed_at.is_none() && now.duration_since(e.created_at) > leecher_tti)
            .map(|(_, e)| e.store_name.clone())
            .collect();
        for name in timed_out {
            log::info!("torrent {name} timed out waiting for peers");
            self.cancel_torrent(&name, CancelReason::LeecherTimeout);
        }

        let to_evict: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.completed_at.is_some_and(|at| e.conns.is_empty() && now.duration_since(at) > seeder_tti))
            .map(|(h, _)| *h)
            .collect();
        for info_hash in to_evict {
            if let Some(entry) = self.torrents.remove(&info_hash) {
                log::info!("evicting idle seeded torrent {}", entry.store_name);
                self.name_to_hash.remove(&entry.store_name);
                self.archive.delete_torrent(&entry.store_name);
                self.queue.eject(info_hash);
            }
        }

        // idle connections close themselves via their own `conn_tti`
        // timeout inside `Connection::run`; nothing for the loop to do.
    }

    /// `EmitStats`.
    fn emit_stats(&mut self) {
        if let Some(tx) = &self.alert_tx {
            let throughput = Throughput {
                egress_bytes: std::mem::take(&mut self.egress_since_last_stats),
                ingress_bytes: std::mem::take(&mut self.ingress_since_last_stats),
            };
            let _ = tx.send(Alert::Stats { conns: self.conn_state.snapshot(), throughput });
        }
    }

    fn conn_conf(&self) -> ConnConf {
        ConnConf {
            handshake_timeout: self.torrent_conf.handshake_timeout,
            conn_tti: self.torrent_conf.conn_tti,
            request_timeout: self.torrent_conf.request_timeout,
            max_pipeline_depth: self.torrent_conf.max_pipeline_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reason_maps_to_distinct_torrent_errors() {
        assert!(matches!(TorrentError::from(CancelReason::Requested), TorrentError::Cancelled));
        assert!(matches!(TorrentError::from(CancelReason::LeecherTimeout), TorrentError::Timeout));
    }
}
