//! C4: a single peer connection's handshake + message loop.
//!
//! One task per connection: a `tokio_util::codec::Framed` stream, a command
//! channel for the rest of the process to push outbound messages onto, and
//! an event channel back to
//! [`crate::scheduler`] reporting closure (with the blacklist severity the
//! scheduler should apply) and completed pieces.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::bandwidth::BandwidthLimiter;
use crate::dispatch::Dispatcher;
use crate::disk;
use crate::error::peer::{BlacklistSeverity, ConnError};
use crate::wire::{Handshake, HandshakeCodec, Message, MessageCodec};
use crate::{Bitfield, ConnKey, InfoHash, PeerId, PieceIndex};

/// Commands the scheduler/dispatcher push onto a running connection.
pub enum ConnCommand {
    RequestPiece(PieceIndex),
    CancelPiece(PieceIndex),
    AnnouncePiece(PieceIndex),
    Shutdown,
}

/// Events a connection reports back to the scheduler.
pub enum ConnEvent {
    Closed { key: ConnKey, severity: BlacklistSeverity },
    PieceDone { key: ConnKey, index: PieceIndex },
    /// Bytes moved through the bandwidth limiter on one side of this
    /// connection, for the scheduler's `EmitStats` throughput sample.
    Throughput { egress_bytes: u64, ingress_bytes: u64 },
}

pub struct ConnHandle {
    pub key: ConnKey,
    pub peer_addr: SocketAddr,
    pub cmd_tx: UnboundedSender<ConnCommand>,
    pub join: tokio::task::JoinHandle<()>,
}

/// Tuning shared by every connection of a torrent; a view onto the relevant
/// subset of [`crate::conf::TorrentConf`].
#[derive(Clone, Copy)]
pub struct ConnConf {
    pub handshake_timeout: Duration,
    pub conn_tti: Duration,
    pub request_timeout: Duration,
    pub max_pipeline_depth: usize,
}

/// Performs the handshake as the dialing side, then spawns the connection's
/// message loop.
pub async fn dial(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    local: Handshake,
    expected_info_hash: InfoHash,
    disk_tx: disk::Sender,
    dispatcher: Arc<Dispatcher>,
    bandwidth: Arc<BandwidthLimiter>,
    events_tx: UnboundedSender<ConnEvent>,
    conf: ConnConf,
) -> Result<ConnHandle, ConnError> {
    let mut hs_codec = HandshakeCodec;
    let mut buf = bytes::BytesMut::new();
    hs_codec.encode_into(&local, &mut buf)?;
    use tokio::io::AsyncWriteExt;
    stream.write_all(&buf).await?;

    let remote = read_handshake(&mut stream, conf.handshake_timeout).await?;
    if remote.info_hash != expected_info_hash {
        return Err(ConnError::InfoHashMismatch);
    }

    Ok(spawn_loop(stream, peer_addr, remote, disk_tx, dispatcher, bandwidth, events_tx, conf))
}

/// Reads the remote side's handshake without replying, so a caller (the
/// scheduler's accept loop) can decide which torrent/dispatcher this
/// connection is for before committing to one.
pub async fn read_remote_handshake(stream: &mut TcpStream, handshake_timeout: Duration) -> Result<Handshake, ConnError> {
    read_handshake(stream, handshake_timeout).await
}

/// Completes an accept once the scheduler has decided to admit the
/// connection: writes our handshake, then spawns the message loop. Split
/// from [`read_remote_handshake`] so the scheduler's event loop can make the
/// capacity/blacklist/torrent-lookup decision between the read and the
/// write without blocking on either.
pub async fn finish_accept(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    remote: Handshake,
    local: Handshake,
    disk_tx: disk::Sender,
    dispatcher: Arc<Dispatcher>,
    bandwidth: Arc<BandwidthLimiter>,
    events_tx: UnboundedSender<ConnEvent>,
    conf: ConnConf,
) -> Result<ConnHandle, ConnError> {
    let mut hs_codec = HandshakeCodec;
    let mut buf = bytes::BytesMut::new();
    hs_codec.encode_into(&local, &mut buf)?;
    use tokio::io::AsyncWriteExt;
    stream.write_all(&buf).await?;

    Ok(spawn_loop(stream, peer_addr, remote, disk_tx, dispatcher, bandwidth, events_tx, conf))
}

async fn read_handshake(stream: &mut TcpStream, handshake_timeout: Duration) -> Result<Handshake, ConnError> {
    use tokio::io::AsyncReadExt;
    let mut codec = HandshakeCodec;
    let mut buf = bytes::BytesMut::with_capacity(256);
    loop {
        match timeout(handshake_timeout, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Err(ConnError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed during handshake"))),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ConnError::HandshakeTimeout),
        }
        use tokio_util::codec::Decoder;
        if let Some(handshake) = codec.decode(&mut buf).map_err(|e| ConnError::Framing(e.to_string()))? {
            return Ok(handshake);
        }
    }
}

fn spawn_loop(
    stream: TcpStream,
    peer_addr: SocketAddr,
    remote: Handshake,
    disk_tx: disk::Sender,
    dispatcher: Arc<Dispatcher>,
    bandwidth: Arc<BandwidthLimiter>,
    events_tx: UnboundedSender<ConnEvent>,
    conf: ConnConf,
) -> ConnHandle {
    let key = ConnKey::new(remote.peer_id, remote.info_hash);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    dispatcher.peer_connected(remote.peer_id, remote.bitfield.clone());
    for index in dispatcher.pieces_to_announce(remote.peer_id) {
        let _ = cmd_tx.send(ConnCommand::AnnouncePiece(index));
    }

    let conn = Connection {
        key,
        info_hash: remote.info_hash,
        peer_id: remote.peer_id,
        framed: Framed::new(stream, MessageCodec),
        disk_tx,
        dispatcher,
        bandwidth,
        cmd_rx,
        events_tx,
        conf,
        pending: HashMap::new(),
    };

    let join = tokio::task::spawn(async move {
        let outcome = conn.run().await;
        outcome.dispatcher_cleanup(&outcome.key);
    });

    ConnHandle { key, peer_addr, cmd_tx, join }
}

struct Connection {
    key: ConnKey,
    info_hash: InfoHash,
    peer_id: PeerId,
    framed: Framed<TcpStream, MessageCodec>,
    disk_tx: disk::Sender,
    dispatcher: Arc<Dispatcher>,
    bandwidth: Arc<BandwidthLimiter>,
    cmd_rx: UnboundedReceiver<ConnCommand>,
    events_tx: UnboundedSender<ConnEvent>,
    conf: ConnConf,
    /// Outstanding outgoing piece requests we've sent and are awaiting a
    /// reply for, keyed by piece index with the instant the request was
    /// sent — lets [`Connection::reap_timed_out_requests`] enforce
    /// `request_timeout` per-request rather than only the whole
    /// connection's `conn_tti`.
    pending: HashMap<PieceIndex, Instant>,
}

/// The outcome of a connection's run loop, carrying what the caller needs to
/// report upstream and clean up the dispatcher's per-peer bookkeeping.
struct RunOutcome {
    key: ConnKey,
    peer_id: PeerId,
    dispatcher: Arc<Dispatcher>,
    severity: BlacklistSeverity,
}

impl RunOutcome {
    fn dispatcher_cleanup(&self, _key: &ConnKey) {
        self.dispatcher.peer_disconnected(self.peer_id);
    }
}

impl Connection {
    async fn run(mut self) -> RunOutcome {
        // the remote's handshake bitfield may already hold pieces we want;
        // don't wait for its first `announce_piece` to start requesting.
        if let Err(e) = self.fill_request_pipeline().await {
            let severity = e.blacklist_severity();
            let _ = self.events_tx.send(ConnEvent::Closed { key: self.key, severity });
            return RunOutcome { key: self.key, peer_id: self.peer_id, dispatcher: self.dispatcher, severity };
        }

        // checked on a fraction of `request_timeout` so a stalled request is
        // noticed well before the deadline rather than only on the next
        // unrelated wakeup.
        let mut request_timeout_tick = tokio::time::interval((self.conf.request_timeout / 4).max(Duration::from_millis(50)));

        let severity = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ConnCommand::Shutdown) | None => break BlacklistSeverity::None,
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                break e.blacklist_severity();
                            }
                        }
                    }
                }
                incoming = timeout(self.conf.conn_tti, self.framed.next()) => {
                    match incoming {
                        Err(_) => break BlacklistSeverity::Short, // idle-TTI
                        Ok(None) => break BlacklistSeverity::None, // peer closed
                        Ok(Some(Err(e))) => break ConnError::from(e).blacklist_severity(),
                        Ok(Some(Ok(msg))) => {
                            if let Err(e) = self.handle_message(msg).await {
                                break e.blacklist_severity();
                            }
                        }
                    }
                }
                _ = request_timeout_tick.tick() => {
                    if let Err(e) = self.reap_timed_out_requests().await {
                        break e.blacklist_severity();
                    }
                }
            }
        };

        let _ = self.events_tx.send(ConnEvent::Closed { key: self.key, severity });
        RunOutcome { key: self.key, peer_id: self.peer_id, dispatcher: self.dispatcher, severity }
    }

    /// Frees any outgoing request that has sat unanswered for longer than
    /// `request_timeout` (spec §5): released back to the dispatcher so the
    /// same or another peer can be asked, and the freed pipeline slot is
    /// immediately topped back up. This peer isn't blacklisted for one slow
    /// piece — only a run of idle activity trips `conn_tti`.
    async fn reap_timed_out_requests(&mut self) -> Result<(), ConnError> {
        let now = Instant::now();
        let expired: Vec<PieceIndex> = self
            .pending
            .iter()
            .filter(|(_, sent_at)| now.duration_since(**sent_at) > self.conf.request_timeout)
            .map(|(index, _)| *index)
            .collect();

        if expired.is_empty() {
            return Ok(());
        }
        for index in expired {
            self.pending.remove(&index);
            self.dispatcher.release_request(index, self.peer_id);
        }
        self.fill_request_pipeline().await
    }

    async fn handle_command(&mut self, cmd: ConnCommand) -> Result<(), ConnError> {
        match cmd {
            ConnCommand::RequestPiece(index) => {
                self.pending.insert(index, Instant::now());
                self.send(Message::PieceRequest { index }).await
            }
            ConnCommand::CancelPiece(index) => {
                self.pending.remove(&index);
                self.send(Message::CancelPiece { index }).await
            }
            ConnCommand::AnnouncePiece(index) => self.send(Message::AnnouncePiece { index }).await,
            ConnCommand::Shutdown => unreachable!("handled by caller"),
        }
    }

    async fn handle_message(&mut self, msg: Message) -> Result<(), ConnError> {
        match msg {
            Message::KeepAlive => Ok(()),
            Message::AnnouncePiece { index } => {
                self.dispatcher.peer_announced(self.peer_id, index);
                self.fill_request_pipeline().await
            }
            Message::PieceRequest { index } => self.serve_piece_request(index).await,
            Message::CancelPiece { .. } => Ok(()),
            Message::Error { code, message } => {
                log::warn!("peer {:?} sent error {}: {}", self.peer_id, code, message);
                Ok(())
            }
            Message::PiecePayload { index, bytes } => self.receive_piece(index, bytes).await,
        }
    }

    /// Serves an incoming request by reading the piece from disk (C1) and
    /// sending its bytes back. Incoming requests are processed one at a
    /// time by this same message loop, so there's no separate pipeline
    /// counter to check here — `max_pipeline_depth` gates our own *outgoing*
    /// requests in [`Connection::fill_request_pipeline`].
    async fn serve_piece_request(&mut self, index: PieceIndex) -> Result<(), ConnError> {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.disk_tx
            .send(disk::Command::ReadPiece { info_hash: self.info_hash, index, result_tx })
            .map_err(|_| ConnError::Channel)?;
        let data = result_rx.await.map_err(|_| ConnError::Channel)?.map_err(|_| ConnError::InvalidPieceIndex)?;

        self.bandwidth.reserve_egress(data.len()).await;
        let _ = self.events_tx.send(ConnEvent::Throughput { egress_bytes: data.len() as u64, ingress_bytes: 0 });
        self.send(Message::PiecePayload { index, bytes: Bytes::from(data) }).await
    }

    /// Tops up outstanding outgoing piece requests to `max_pipeline_depth`
    /// by asking the dispatcher (C5) for the next rarest piece this peer
    /// has that we don't. Called on connect and after every event that
    /// could free a slot or make a new piece requestable.
    async fn fill_request_pipeline(&mut self) -> Result<(), ConnError> {
        while self.pending.len() < self.conf.max_pipeline_depth {
            let Some(index) = self.dispatcher.pick_next_piece(self.peer_id) else {
                break;
            };
            self.pending.insert(index, Instant::now());
            self.send(Message::PieceRequest { index }).await?;
        }
        Ok(())
    }

    async fn receive_piece(&mut self, index: PieceIndex, bytes: Bytes) -> Result<(), ConnError> {
        self.pending.remove(&index);
        self.bandwidth.reserve_ingress(bytes.len()).await;
        let _ = self.events_tx.send(ConnEvent::Throughput { egress_bytes: 0, ingress_bytes: bytes.len() as u64 });

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.disk_tx
            .send(disk::Command::WritePiece { info_hash: self.info_hash, index, data: bytes.to_vec(), result_tx })
            .map_err(|_| ConnError::Channel)?;
        match result_rx.await.map_err(|_| ConnError::Channel)? {
            Ok(()) => {
                let _ = self.events_tx.send(ConnEvent::PieceDone { key: self.key, index });
                self.fill_request_pipeline().await
            }
            Err(crate::error::disk::WriteError::PieceCorrupt) => Err(ConnError::PieceCorrupt),
            // already reserved/claimed by another writer; not this peer's fault, keep going
            Err(_) => self.fill_request_pipeline().await,
        }
    }

    async fn send(&mut self, msg: Message) -> Result<(), ConnError> {
        self.framed.send(msg).await.map_err(ConnError::from)
    }
}

/// Not exported: a small adapter so the handshake's encode step can reuse
/// the `Encoder` impl without a `Framed` wrapper (the handshake precedes the
/// `MessageCodec` entirely and is only ever written once per direction).
trait EncodeInto {
    fn encode_into(&mut self, handshake: &Handshake, buf: &mut bytes::BytesMut) -> Result<(), ConnError>;
}

impl EncodeInto for HandshakeCodec {
    fn encode_into(&mut self, handshake: &Handshake, buf: &mut bytes::BytesMut) -> Result<(), ConnError> {
        use tokio_util::codec::Encoder;
        Encoder::encode(self, handshake.clone(), buf).map_err(ConnError::from)
    }
}

/// Builds the local half of a handshake for `info_hash`, carrying our
/// current bitfield and name.
pub fn local_handshake(info_hash: InfoHash, peer_id: PeerId, name: String, bitfield: Bitfield) -> Handshake {
    Handshake::new(info_hash, peer_id, name, bitfield)
}
