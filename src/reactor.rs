use std::{
    future::poll_fn,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap as HashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::mpsc::{UnboundedSender, unbounded_channel},
};
use tracing::{debug, trace, warn};

use crate::{
    Payload,
    conn::{Children, ConnKind, ConnState, Connection, Io},
    constants::{
        DATAGRAM_READ_BUF, DEFAULT_CONNECTING_TIMEOUT, DEFAULT_INACTIVITY_TIMEOUT,
        DEFAULT_KEEPALIVE_INTERVAL, REPLY_PORT_PROBE_RANGE, STREAM_READ_CHUNK,
    },
    engine::{DeliveryMode, Udp2wEngine},
    error::{Error, Result},
    frame::{self, Frame},
    process_set::ProcessSet,
};

/// Stable handle to a connection in the reactor's registry. Parent/child and
/// process-set links are ids, never references, so ownership stays acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    #[cfg(test)]
    pub(crate) fn new_test(raw: u64) -> Self {
        Self(raw)
    }
}

/// Wakes a blocked `run_cycle` from another thread or task. Cheap to clone.
#[derive(Clone)]
pub struct WakeHandle {
    tx: UnboundedSender<()>,
}

impl WakeHandle {
    pub fn wake(&self) {
        let _ = self.tx.send(());
    }
}

#[derive(Debug, Default, Clone)]
pub struct SocketOpts {
    /// How long a connected peer may stay silent before it is marked dead.
    pub inactivity_timeout: Option<Duration>,

    /// Same, but while the handshake (or TCP connect) is still in flight.
    pub connecting_timeout: Option<Duration>,

    /// How long sends may lapse before a PING goes out.
    pub keepalive_interval: Option<Duration>,

    /// How many ports above the requested one to probe for the UDP2W
    /// reply socket.
    pub reply_port_probe_range: Option<u16>,
}

impl SocketOpts {
    fn validate(&self) -> Result<ValidatedSocketOpts> {
        let opts = ValidatedSocketOpts {
            inactivity_timeout: self
                .inactivity_timeout
                .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT),
            connecting_timeout: self
                .connecting_timeout
                .unwrap_or(DEFAULT_CONNECTING_TIMEOUT),
            keepalive_interval: self
                .keepalive_interval
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
            reply_port_probe_range: self
                .reply_port_probe_range
                .unwrap_or(REPLY_PORT_PROBE_RANGE),
        };
        if opts.inactivity_timeout.is_zero()
            || opts.connecting_timeout.is_zero()
            || opts.keepalive_interval.is_zero()
        {
            return Err(Error::Text("timeouts must be non-zero"));
        }
        if opts.reply_port_probe_range == 0 {
            return Err(Error::Text("reply_port_probe_range must be non-zero"));
        }
        Ok(opts)
    }
}

#[derive(Debug, Clone, Copy)]
struct ValidatedSocketOpts {
    inactivity_timeout: Duration,
    connecting_timeout: Duration,
    keepalive_interval: Duration,
    reply_port_probe_range: u16,
}

impl Default for ValidatedSocketOpts {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            connecting_timeout: DEFAULT_CONNECTING_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reply_port_probe_range: REPLY_PORT_PROBE_RANGE,
        }
    }
}

/// The readiness-based multiplexer. Owns every connection it was asked to
/// create and drives all of them with one OS readiness wait per cycle.
/// Single-threaded cooperative: nothing here blocks longer than the timeout
/// handed to [`Reactor::run_cycle`], and runtime failures only ever surface
/// as [`Reactor::is_dead`] on the affected connection.
pub struct Reactor {
    conns: HashMap<ConnId, Connection>,
    next_id: u64,
    opts: ValidatedSocketOpts,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            conns: Default::default(),
            next_id: 0,
            opts: Default::default(),
        }
    }

    pub fn new_with_opts(opts: SocketOpts) -> Result<Self> {
        Ok(Self {
            conns: Default::default(),
            next_id: 0,
            opts: opts.validate()?,
        })
    }

    fn insert(&mut self, conn: Connection) -> ConnId {
        self.next_id += 1;
        let id = ConnId(self.next_id);
        self.conns.insert(id, conn);
        id
    }

    /// Starts a non-blocking TCP connect. The connection stays `Connecting`
    /// until a later cycle observes the connect completing (or failing, in
    /// which case it is marked dead).
    pub fn open_stream(&mut self, host: &str, port: u16) -> Result<ConnId> {
        let addr = resolve(host, port)?;
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::Connect)?;
        sock.set_nonblocking(true).map_err(Error::Connect)?;
        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(Error::Connect(e)),
        }
        let stream = TcpStream::from_std(sock.into()).map_err(Error::Connect)?;
        let id = self.insert(Connection::new(
            Io::Stream(stream),
            ConnState::Connecting,
            Instant::now(),
        ));
        debug!(?id, %addr, "opened stream, connecting");
        Ok(id)
    }

    /// Binds a local ephemeral UDP socket and records the destination.
    /// No handshake, no delivery guarantees.
    pub fn open_datagram(&mut self, host: &str, port: u16) -> Result<ConnId> {
        let peer = resolve(host, port)?;
        let sock = bind_udp(local_any(peer, 0)).map_err(Error::BindFailed)?;
        let id = self.insert(Connection::new(
            Io::Datagram {
                sock: Arc::new(sock),
                peer,
            },
            ConnState::Connected,
            Instant::now(),
        ));
        debug!(?id, %peer, "opened datagram");
        Ok(id)
    }

    /// Opens a two-way reliable UDP connection: binds the send socket plus a
    /// dedicated reply socket on the closest free port above the requested
    /// one, and queues the CONNECTION handshake frame.
    pub fn open_reliable_datagram(
        &mut self,
        host: &str,
        port: u16,
        mode: DeliveryMode,
    ) -> Result<ConnId> {
        let peer = resolve(host, port)?;
        let sock = bind_udp(local_any(peer, 0)).map_err(Error::BindFailed)?;
        let reply = self.bind_reply_socket(peer)?;
        let reply_addr = reply.local_addr().map_err(Error::BindFailed)?;

        let now = Instant::now();
        let engine = Udp2wEngine::new(
            mode,
            handshake_ident(Some(reply_addr)),
            reply_addr.port(),
            self.opts.keepalive_interval,
            now,
        );
        let mut conn = Connection::new(
            Io::Udp2w {
                sock: Arc::new(sock),
                reply: Arc::new(reply),
                peer,
            },
            ConnState::Connecting,
            now,
        );
        conn.outbox.push_back(engine.connection_frame());
        conn.engine = Some(engine);
        let id = self.insert(conn);
        debug!(?id, %peer, reply = %reply_addr, "opened reliable datagram, connecting");
        Ok(id)
    }

    fn bind_reply_socket(&self, peer: SocketAddr) -> Result<UdpSocket> {
        let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no ports probed");
        for offset in 1..=self.opts.reply_port_probe_range {
            let port = peer.port().wrapping_add(offset);
            if port == 0 {
                continue;
            }
            match bind_udp(local_any(peer, port)) {
                Ok(sock) => return Ok(sock),
                Err(e) => last_err = e,
            }
        }
        Err(Error::BindFailed(last_err))
    }

    pub fn listen_stream(&mut self, host: &str, port: u16) -> Result<ConnId> {
        let addr = resolve(host, port)?;
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::BindFailed)?;
        sock.set_reuse_address(true).map_err(Error::BindFailed)?;
        sock.set_nonblocking(true).map_err(Error::BindFailed)?;
        sock.bind(&addr.into()).map_err(Error::BindFailed)?;
        sock.listen(64).map_err(Error::ListenFailed)?;
        let listener = TcpListener::from_std(sock.into()).map_err(Error::ListenFailed)?;

        let mut conn = Connection::new(Io::StreamListener(listener), ConnState::Listening, Instant::now());
        conn.children = Some(Children::default());
        let id = self.insert(conn);
        debug!(?id, %addr, "listening for streams");
        Ok(id)
    }

    /// Binds a UDP2W listener. Inbound datagrams are demultiplexed by their
    /// source address; CONNECTION frames from unknown peers spawn child
    /// connections which the owner picks up via
    /// [`Reactor::claim_new_connection`].
    pub fn listen_reliable_datagram(
        &mut self,
        host: &str,
        port: u16,
        mode: DeliveryMode,
    ) -> Result<ConnId> {
        let addr = resolve(host, port)?;
        let sock = bind_udp(addr).map_err(Error::BindFailed)?;
        let local = sock.local_addr().map_err(Error::BindFailed)?;

        let mut conn = Connection::new(
            Io::Udp2wListener {
                sock: Arc::new(sock),
            },
            ConnState::Listening,
            Instant::now(),
        );
        conn.children = Some(Children {
            mode,
            ..Default::default()
        });
        let id = self.insert(conn);
        debug!(?id, %local, ?mode, "listening for reliable datagrams");
        Ok(id)
    }

    /// Creates two connections joined by in-process channels; whatever one
    /// side enqueues, the other drains as whole messages.
    pub fn open_local_pair(&mut self) -> (ConnId, ConnId) {
        let now = Instant::now();
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();
        let a = self.insert(Connection::new(
            Io::Local { tx: a_tx, rx: b_rx },
            ConnState::Connected,
            now,
        ));
        let b = self.insert(Connection::new(
            Io::Local { tx: b_tx, rx: a_rx },
            ConnState::Connected,
            now,
        ));
        debug!(?a, ?b, "opened local pair");
        (a, b)
    }

    /// Creates a wake-interrupt connection. `WakeHandle::wake` makes the
    /// current (or next) `run_cycle` readiness wait return immediately.
    pub fn open_wake(&mut self) -> (ConnId, WakeHandle) {
        let (tx, rx) = unbounded_channel();
        let id = self.insert(Connection::new(
            Io::Wake { rx },
            ConnState::Connected,
            Instant::now(),
        ));
        (id, WakeHandle { tx })
    }

    /// Appends a payload to a connection's output buffer; never blocks.
    /// On a reliable UDP2W connection `reliable = true` registers the
    /// payload for acknowledgment tracking and resend.
    pub fn enqueue(&mut self, id: ConnId, bytes: &[u8], reliable: bool) -> Result<()> {
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or(Error::UnknownConnection(id))?;
        conn.enqueue(bytes.to_vec(), reliable, Instant::now());
        Ok(())
    }

    /// Pops one complete inbound message (or, for streams, the whole
    /// buffered byte run). Never blocks.
    pub fn drain_input(&mut self, id: ConnId) -> Option<Payload> {
        self.conns.get_mut(&id)?.drain_input()
    }

    /// A connection that no longer exists counts as dead.
    pub fn is_dead(&self, id: ConnId) -> bool {
        self.conns.get(&id).map_or(true, |c| c.is_dead())
    }

    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        self.conns.get(&id).map(|c| c.state)
    }

    pub fn kind(&self, id: ConnId) -> Option<ConnKind> {
        self.conns.get(&id).map(|c| c.kind())
    }

    pub fn peer_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.conns.get(&id)?.peer_addr()
    }

    pub fn local_addr(&self, id: ConnId) -> Option<SocketAddr> {
        self.conns.get(&id)?.local_addr()
    }

    pub fn bytes_in(&self, id: ConnId) -> u64 {
        self.conns.get(&id).map_or(0, |c| c.bytes_in)
    }

    pub fn bytes_out(&self, id: ConnId) -> u64 {
        self.conns.get(&id).map_or(0, |c| c.bytes_out)
    }

    pub fn created_at(&self, id: ConnId) -> Option<Instant> {
        self.conns.get(&id).map(|c| c.created_at)
    }

    /// Bytes still waiting to be flushed; lets the owner run a bounded
    /// best-effort flush loop before teardown.
    pub fn output_pending(&self, id: ConnId) -> usize {
        self.conns.get(&id).map_or(0, |c| c.output_pending())
    }

    /// Reliable payloads sent but not yet acknowledged by the peer.
    pub fn pending_acks(&self, id: ConnId) -> usize {
        self.conns
            .get(&id)
            .and_then(|c| c.engine.as_ref())
            .map_or(0, |e| e.pending_acks())
    }

    /// Closes immediately and synchronously; in-flight acknowledgments are
    /// not waited for. Unclaimed children go down with their listener
    /// (nothing else owns them); claimed children are only unlinked.
    pub fn close(&mut self, id: ConnId) {
        let conn = match self.conns.remove(&id) {
            Some(conn) => conn,
            None => return,
        };
        trace!(?id, kind = ?conn.kind(), "closing connection");

        if let Some(parent_id) = conn.parent {
            if let Some(parent) = self.conns.get_mut(&parent_id) {
                if let Some(children) = parent.children.as_mut() {
                    children.unclaimed.retain(|&c| c != id);
                    children.claimed.retain(|&c| c != id);
                    children.by_peer.retain(|_, &mut c| c != id);
                }
            }
        }

        if let Some(children) = conn.children {
            for child in children.unclaimed {
                if let Some(c) = self.conns.get_mut(&child) {
                    c.parent = None;
                }
                self.close(child);
            }
            for child in children.claimed {
                if let Some(c) = self.conns.get_mut(&child) {
                    c.parent = None;
                }
            }
        }
    }

    /// Purges dead unclaimed children, then hands over the oldest live one.
    pub fn claim_new_connection(&mut self, listener: ConnId) -> Option<ConnId> {
        loop {
            let id = self
                .conns
                .get_mut(&listener)?
                .children
                .as_mut()?
                .unclaimed
                .pop_front()?;
            if self.conns.get(&id).map_or(true, |c| c.is_dead()) {
                trace!(?listener, ?id, "purging dead unclaimed child");
                self.close(id);
                continue;
            }
            self.conns
                .get_mut(&listener)?
                .children
                .as_mut()?
                .claimed
                .push(id);
            debug!(?listener, ?id, "claimed new connection");
            return Some(id);
        }
    }

    /// One reactor cycle over `set`: resend/keepalive/liveness scan, output
    /// flush, a single OS readiness wait bounded by `timeout`, then reads
    /// (routing UDP2W datagrams through the protocol engine). Returns the
    /// number of connections with any activity so the caller can poll fast
    /// when busy and slow when idle.
    pub async fn run_cycle(&mut self, set: &ProcessSet, timeout: Duration) -> usize {
        let now = Instant::now();
        for id in set.iter() {
            self.pre_cycle(id, now);
        }
        for id in set.iter() {
            self.flush(id, now);
        }

        let _ = tokio::time::timeout(timeout, poll_fn(|cx| self.poll_ready(cx, set))).await;

        let now = Instant::now();
        for id in set.iter() {
            self.read_ready(id, now);
        }

        set.iter()
            .filter(|&id| self.conns.get(&id).is_some_and(|c| c.active))
            .count()
    }

    /// Step 1: liveness, handshake re-emit, resend scan and keepalive for
    /// the protocol-driven connections. Buffer mutation only.
    fn pre_cycle(&mut self, id: ConnId, now: Instant) {
        // Unclaimed children are not in any process set yet; their liveness
        // rides along with the listener's scan.
        let kids: Option<Vec<ConnId>> = self
            .conns
            .get(&id)
            .and_then(|c| c.children.as_ref())
            .map(|ch| ch.unclaimed.iter().copied().collect());
        if let Some(kids) = kids {
            for kid in kids {
                self.unclaimed_liveness(kid, now);
            }
        }

        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        conn.ready = false;
        conn.active = false;
        if conn.is_dead() {
            return;
        }

        if matches!(conn.io, Io::Stream(_)) {
            if conn.state == ConnState::Connecting
                && now.duration_since(conn.created_at) > self.opts.connecting_timeout
            {
                debug!(?id, "connect timed out");
                conn.state = ConnState::Dead;
            }
            return;
        }

        let is_initiator = matches!(conn.io, Io::Udp2w { .. });
        let engine = match conn.engine.as_mut() {
            Some(engine) => engine,
            None => return,
        };

        let limit = if conn.state == ConnState::Connecting {
            self.opts.connecting_timeout
        } else {
            self.opts.inactivity_timeout
        };
        if now.duration_since(engine.last_seen) > limit {
            debug!(?id, state = ?conn.state, "remote inactive for too long, marking dead");
            conn.state = ConnState::Dead;
            return;
        }

        if is_initiator && conn.state == ConnState::Connecting {
            // Resent every cycle until connected; goes to the front so the
            // handshake beats payloads enqueued before it completed. If the
            // previous one never left the socket it is still at the front,
            // and stacking another would grow the outbox unboundedly.
            let front_is_handshake = conn
                .outbox
                .front()
                .and_then(|bytes| Frame::decode(bytes))
                .is_some_and(|f| matches!(f, Frame::Connection { .. }));
            if !front_is_handshake {
                conn.outbox.push_front(engine.connection_frame());
            }
        }
        for f in engine.scan_resends(now) {
            conn.outbox.push_back(f);
        }
        if let Some(ping) = engine.ping_due(now) {
            conn.outbox.push_back(ping);
        }
    }

    fn unclaimed_liveness(&mut self, id: ConnId, now: Instant) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        if conn.is_dead() {
            return;
        }
        if let Some(engine) = conn.engine.as_ref() {
            if now.duration_since(engine.last_seen) > self.opts.inactivity_timeout {
                debug!(?id, "unclaimed child inactive for too long, marking dead");
                conn.state = ConnState::Dead;
            }
        }
    }

    /// Step 2: flush output buffers. Streams drop only the bytes actually
    /// written; datagram kinds send one whole framed datagram per call.
    fn flush(&mut self, id: ConnId, now: Instant) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        if conn.is_dead() {
            return;
        }
        match &conn.io {
            Io::Stream(stream) => {
                if conn.state != ConnState::Connected {
                    return;
                }
                while !conn.out_stream.is_empty() {
                    match stream.try_write(&conn.out_stream) {
                        Ok(0) => {
                            conn.state = ConnState::Dead;
                            break;
                        }
                        Ok(n) => {
                            conn.out_stream.drain(..n);
                            conn.bytes_out += n as u64;
                            conn.active = true;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!(?id, "stream write error, marking dead: {e}");
                            conn.state = ConnState::Dead;
                            break;
                        }
                    }
                }
            }
            Io::Datagram { sock, peer }
            | Io::Udp2w { sock, peer, .. }
            | Io::Udp2wChild { sock, peer, .. } => {
                while let Some(front) = conn.outbox.front() {
                    match sock.try_send_to(front, *peer) {
                        Ok(n) => {
                            conn.bytes_out += n as u64;
                            conn.outbox.pop_front();
                            conn.active = true;
                            if let Some(engine) = conn.engine.as_mut() {
                                engine.on_sent(now);
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if is_oversize(&e) => {
                            // Dropped permanently: this layer cannot fragment.
                            // A reliable frame also loses its pending-ack
                            // record, or the resend scan would re-queue it
                            // forever.
                            debug!(?id, len = front.len(), "oversize datagram dropped");
                            if let Some(Frame::Rdata { seq, .. }) = Frame::decode(front) {
                                if let Some(engine) = conn.engine.as_mut() {
                                    engine.drop_pending(seq);
                                }
                            }
                            conn.outbox.pop_front();
                        }
                        Err(e) => {
                            debug!(?id, "datagram send error, marking dead: {e}");
                            conn.state = ConnState::Dead;
                            break;
                        }
                    }
                }
            }
            Io::Local { tx, .. } => {
                while let Some(msg) = conn.outbox.pop_front() {
                    let len = msg.len();
                    if tx.send(msg).is_err() {
                        // Other half was closed.
                        conn.state = ConnState::Dead;
                        break;
                    }
                    conn.bytes_out += len as u64;
                    conn.active = true;
                }
            }
            Io::StreamListener(_) | Io::Udp2wListener { .. } | Io::Wake { .. } => {}
        }
    }

    /// Steps 3-4: register every watched descriptor with the OS and report
    /// readiness. This is the reactor's only suspension point. Channel-backed
    /// kinds consume their messages right here; socket kinds just get their
    /// `ready` flag set for the read pass.
    fn poll_ready(&mut self, cx: &mut Context<'_>, set: &ProcessSet) -> Poll<()> {
        let mut any = false;
        let mut accepted: Vec<(ConnId, TcpStream, SocketAddr)> = Vec::new();

        for id in set.iter() {
            let conn = match self.conns.get_mut(&id) {
                Some(conn) => conn,
                None => continue,
            };
            if conn.is_dead() {
                continue;
            }
            match &mut conn.io {
                Io::Stream(stream) => match conn.state {
                    // Write readiness signals connect completion.
                    ConnState::Connecting => {
                        if let Poll::Ready(res) = stream.poll_write_ready(cx) {
                            match res.and_then(|()| stream.peer_addr()) {
                                Ok(peer) => {
                                    debug!(?id, %peer, "connect completed");
                                    conn.state = ConnState::Connected;
                                }
                                Err(e) => {
                                    debug!(?id, "connect failed, marking dead: {e}");
                                    conn.state = ConnState::Dead;
                                }
                            }
                            conn.active = true;
                            any = true;
                        }
                    }
                    ConnState::Connected => {
                        if stream.poll_read_ready(cx).is_ready() {
                            conn.ready = true;
                            any = true;
                        }
                    }
                    _ => {}
                },
                Io::StreamListener(listener) => loop {
                    match listener.poll_accept(cx) {
                        Poll::Ready(Ok((stream, addr))) => {
                            accepted.push((id, stream, addr));
                            conn.active = true;
                            any = true;
                        }
                        Poll::Ready(Err(e)) => {
                            warn!(?id, "accept error, marking listener dead: {e}");
                            conn.state = ConnState::Dead;
                            any = true;
                            break;
                        }
                        Poll::Pending => break,
                    }
                },
                Io::Datagram { sock, .. } | Io::Udp2wListener { sock } => {
                    if sock.poll_recv_ready(cx).is_ready() {
                        conn.ready = true;
                        any = true;
                    }
                }
                // A connected two-way-UDP initiator is watched on its
                // dedicated reply descriptor.
                Io::Udp2w { reply, .. } => {
                    if reply.poll_recv_ready(cx).is_ready() {
                        conn.ready = true;
                        any = true;
                    }
                }
                // Routed through the listener's descriptor.
                Io::Udp2wChild { .. } => {}
                Io::Local { rx, .. } => loop {
                    match rx.poll_recv(cx) {
                        Poll::Ready(Some(msg)) => {
                            conn.bytes_in += msg.len() as u64;
                            conn.inbox.push_back(msg);
                            conn.active = true;
                            any = true;
                        }
                        Poll::Ready(None) => {
                            conn.state = ConnState::Dead;
                            any = true;
                            break;
                        }
                        Poll::Pending => break,
                    }
                },
                Io::Wake { rx } => loop {
                    match rx.poll_recv(cx) {
                        Poll::Ready(Some(())) => {
                            conn.active = true;
                            any = true;
                        }
                        Poll::Ready(None) => {
                            // Every handle dropped; nothing will ever wake
                            // through this again.
                            conn.state = ConnState::Dead;
                            break;
                        }
                        Poll::Pending => break,
                    }
                },
            }
        }

        for (listener_id, stream, addr) in accepted {
            self.accept_child(listener_id, stream, addr);
        }

        if any { Poll::Ready(()) } else { Poll::Pending }
    }

    fn accept_child(&mut self, listener_id: ConnId, stream: TcpStream, addr: SocketAddr) {
        let mut conn = Connection::new(Io::Stream(stream), ConnState::Connected, Instant::now());
        conn.parent = Some(listener_id);
        let id = self.insert(conn);
        if let Some(listener) = self.conns.get_mut(&listener_id) {
            if let Some(children) = listener.children.as_mut() {
                children.unclaimed.push_back(id);
            }
        }
        debug!(?listener_id, ?id, %addr, "accepted stream connection");
    }

    /// Step 5: read everything currently available on ready descriptors.
    fn read_ready(&mut self, id: ConnId, now: Instant) {
        let kind = {
            let conn = match self.conns.get_mut(&id) {
                Some(conn) => conn,
                None => return,
            };
            if !conn.ready || conn.is_dead() {
                return;
            }
            conn.ready = false;
            conn.active = true;
            conn.kind()
        };
        match kind {
            ConnKind::Stream => self.read_stream(id),
            ConnKind::Datagram => self.read_datagram(id),
            ConnKind::Udp2w => self.read_udp2w_initiator(id, now),
            ConnKind::Udp2wListener => self.read_udp2w_listener(id, now),
            _ => {}
        }
    }

    fn read_stream(&mut self, id: ConnId) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        let stream = match &conn.io {
            Io::Stream(stream) => stream,
            _ => return,
        };
        let mut buf = [0u8; STREAM_READ_CHUNK];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!(?id, "stream EOF, marking dead");
                    conn.state = ConnState::Dead;
                    break;
                }
                Ok(n) => {
                    conn.in_stream.extend_from_slice(&buf[..n]);
                    conn.bytes_in += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(?id, "stream read error, marking dead: {e}");
                    conn.state = ConnState::Dead;
                    break;
                }
            }
        }
    }

    fn read_datagram(&mut self, id: ConnId) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        let sock = match &conn.io {
            Io::Datagram { sock, .. } => sock.clone(),
            _ => return,
        };
        let mut buf = [0u8; DATAGRAM_READ_BUF];
        loop {
            match sock.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    conn.bytes_in += n as u64;
                    match frame::decode_plain(&buf[..n]) {
                        Some(payload) => {
                            trace!(?id, %from, len = payload.len(), "datagram received");
                            conn.inbox.push_back(payload);
                        }
                        None => trace!(?id, %from, len = n, "malformed plain datagram dropped"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(?id, "datagram recv error, marking dead: {e}");
                    conn.state = ConnState::Dead;
                    break;
                }
            }
        }
    }

    fn read_udp2w_initiator(&mut self, id: ConnId, now: Instant) {
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        let (sock, reply, peer) = match &conn.io {
            Io::Udp2w { sock, reply, peer } => (sock.clone(), reply.clone(), *peer),
            _ => return,
        };
        let mut buf = [0u8; DATAGRAM_READ_BUF];
        loop {
            match reply.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    conn.bytes_in += n as u64;
                    let frame = match Frame::decode(&buf[..n]) {
                        Some(frame) => frame,
                        None => {
                            trace!(?id, %from, len = n, "undecodable frame dropped");
                            continue;
                        }
                    };
                    let outcome = conn.engine.as_mut().unwrap().on_frame(frame, now);
                    if outcome.connection_seen.is_some() && conn.state == ConnState::Connecting {
                        debug!(?id, %peer, "handshake complete");
                        conn.state = ConnState::Connected;
                    }
                    for payload in outcome.delivered {
                        conn.inbox.push_back(payload);
                    }
                    for reply_frame in outcome.replies {
                        send_now(&sock, peer, reply_frame, conn, now);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(?id, "reply socket recv error, marking dead: {e}");
                    conn.state = ConnState::Dead;
                    break;
                }
            }
        }
    }

    fn read_udp2w_listener(&mut self, id: ConnId, now: Instant) {
        let (sock, datagrams) = {
            let conn = match self.conns.get_mut(&id) {
                Some(conn) => conn,
                None => return,
            };
            let sock = match &conn.io {
                Io::Udp2wListener { sock } => sock.clone(),
                _ => return,
            };
            let mut datagrams = Vec::new();
            let mut buf = [0u8; DATAGRAM_READ_BUF];
            loop {
                match sock.try_recv_from(&mut buf) {
                    Ok((n, from)) => {
                        conn.bytes_in += n as u64;
                        match Frame::decode(&buf[..n]) {
                            Some(frame) => datagrams.push((from, frame)),
                            None => trace!(?id, %from, len = n, "undecodable frame dropped"),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(?id, "listener recv error, marking dead: {e}");
                        conn.state = ConnState::Dead;
                        break;
                    }
                }
            }
            (sock, datagrams)
        };
        for (from, frame) in datagrams {
            self.route_listener_frame(id, &sock, from, frame, now);
        }
    }

    /// Demultiplexes one inbound listener datagram by its source address.
    fn route_listener_frame(
        &mut self,
        listener_id: ConnId,
        sock: &Arc<UdpSocket>,
        from: SocketAddr,
        frame: Frame,
        now: Instant,
    ) {
        let (child, mode, listener_port) = {
            let listener = match self.conns.get(&listener_id) {
                Some(listener) => listener,
                None => return,
            };
            let children = match listener.children.as_ref() {
                Some(children) => children,
                None => return,
            };
            (
                children.by_peer.get(&from).copied(),
                children.mode,
                listener.local_addr().map(|a| a.port()).unwrap_or(0),
            )
        };

        match (child, frame) {
            (Some(child_id), Frame::Connection { reply_port, ident }) => {
                let same_session = self
                    .conns
                    .get(&child_id)
                    .filter(|c| !c.is_dead())
                    .and_then(|c| c.engine.as_ref())
                    .and_then(|e| e.peer_ident.as_deref())
                    .map_or(false, |known| known == ident);
                if same_session {
                    // The initiator keeps resending CONNECTION until it sees
                    // our acknowledgment; answer every one.
                    let conn = match self.conns.get_mut(&child_id) {
                        Some(conn) => conn,
                        None => return,
                    };
                    let peer = match conn.io {
                        Io::Udp2wChild { peer, .. } => peer,
                        _ => return,
                    };
                    let engine = conn.engine.as_mut().unwrap();
                    engine.last_seen = now;
                    let ack = engine.handshake_ack();
                    send_now(sock, peer, ack, conn, now);
                } else {
                    // Same peer address, different identifier: a reconnect.
                    // The stale child dies, a fresh one takes its place.
                    debug!(?listener_id, ?child_id, %from, "reconnect, collapsing stale child");
                    if let Some(stale) = self.conns.get_mut(&child_id) {
                        stale.state = ConnState::Dead;
                    }
                    if let Some(listener) = self.conns.get_mut(&listener_id) {
                        if let Some(children) = listener.children.as_mut() {
                            children.by_peer.remove(&from);
                        }
                    }
                    self.spawn_udp2w_child(
                        listener_id,
                        sock,
                        from,
                        reply_port,
                        ident,
                        mode,
                        listener_port,
                        now,
                    );
                }
            }
            (Some(child_id), frame) => {
                let conn = match self.conns.get_mut(&child_id) {
                    Some(conn) => conn,
                    None => return,
                };
                if conn.is_dead() {
                    return;
                }
                conn.active = true;
                let peer = match conn.io {
                    Io::Udp2wChild { peer, .. } => peer,
                    _ => return,
                };
                let outcome = conn.engine.as_mut().unwrap().on_frame(frame, now);
                for payload in outcome.delivered {
                    conn.inbox.push_back(payload);
                }
                for reply_frame in outcome.replies {
                    send_now(sock, peer, reply_frame, conn, now);
                }
            }
            (None, Frame::Connection { reply_port, ident }) => {
                self.spawn_udp2w_child(
                    listener_id,
                    sock,
                    from,
                    reply_port,
                    ident,
                    mode,
                    listener_port,
                    now,
                );
            }
            (None, _) => {
                trace!(?listener_id, %from, "datagram from unknown peer dropped");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_udp2w_child(
        &mut self,
        listener_id: ConnId,
        sock: &Arc<UdpSocket>,
        from: SocketAddr,
        reply_port: u16,
        ident: String,
        mode: DeliveryMode,
        listener_port: u16,
        now: Instant,
    ) {
        // Replies go to the initiator's dedicated reply socket.
        let peer = SocketAddr::new(from.ip(), reply_port);
        let mut engine = Udp2wEngine::new(
            mode,
            handshake_ident(sock.local_addr().ok()),
            listener_port,
            self.opts.keepalive_interval,
            now,
        );
        engine.peer_ident = Some(ident);
        let ack = engine.handshake_ack();

        let mut conn = Connection::new(
            Io::Udp2wChild {
                sock: sock.clone(),
                peer,
                from,
            },
            ConnState::Connected,
            now,
        );
        conn.parent = Some(listener_id);
        conn.engine = Some(engine);
        send_now(sock, peer, ack, &mut conn, now);

        let id = self.insert(conn);
        if let Some(listener) = self.conns.get_mut(&listener_id) {
            if let Some(children) = listener.children.as_mut() {
                children.by_peer.insert(from, id);
                children.unclaimed.push_back(id);
            }
        }
        debug!(?listener_id, ?id, %from, %peer, "spawned udp2w child");
    }
}

/// Sends one frame right away if the socket accepts it, otherwise queues it
/// for the next flush. Oversize frames are dropped; other errors kill the
/// connection.
fn send_now(
    sock: &UdpSocket,
    peer: SocketAddr,
    bytes: Payload,
    conn: &mut Connection,
    now: Instant,
) {
    match sock.try_send_to(&bytes, peer) {
        Ok(n) => {
            conn.bytes_out += n as u64;
            if let Some(engine) = conn.engine.as_mut() {
                engine.on_sent(now);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => conn.outbox.push_back(bytes),
        Err(e) if is_oversize(&e) => {
            debug!(len = bytes.len(), "oversize datagram dropped");
            if let Some(Frame::Rdata { seq, .. }) = Frame::decode(&bytes) {
                if let Some(engine) = conn.engine.as_mut() {
                    engine.drop_pending(seq);
                }
            }
        }
        Err(e) => {
            debug!(%peer, "send error, marking dead: {e}");
            conn.state = ConnState::Dead;
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::AddressUnresolvable {
            host: host.to_owned(),
            port,
        })
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock = std::net::UdpSocket::bind(addr)?;
    sock.set_nonblocking(true)?;
    UdpSocket::from_std(sock)
}

fn local_any(peer: SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, port).into(),
    }
}

/// Host + timestamp + random suffix; disambiguates duplicate connection
/// attempts arriving from the same peer address.
fn handshake_ident(local: Option<SocketAddr>) -> String {
    let host = local
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned());
    let micros = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    format!("{host}-{micros}-{:08x}", rand::random::<u32>())
}

fn connect_in_progress(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    false
}

fn is_oversize(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EMSGSIZE)
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::setup_test_logging;

    #[test]
    fn test_opts_validation() {
        assert!(SocketOpts::default().validate().is_ok());
        assert!(
            SocketOpts {
                inactivity_timeout: Some(Duration::ZERO),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            SocketOpts {
                reply_port_probe_range: Some(0),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_unresolvable_host() {
        let mut reactor = Reactor::new();
        match reactor.open_datagram("", 1234) {
            Err(Error::AddressUnresolvable { port, .. }) => assert_eq!(port, 1234),
            other => panic!("expected AddressUnresolvable, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_connection() {
        let mut reactor = Reactor::new();
        let bogus = ConnId::new_test(999);
        assert!(reactor.is_dead(bogus));
        assert!(reactor.enqueue(bogus, b"x", false).is_err());
        assert_eq!(reactor.drain_input(bogus), None);
        assert_eq!(reactor.claim_new_connection(bogus), None);
        assert_eq!(reactor.output_pending(bogus), 0);
    }

    #[tokio::test]
    async fn test_connecting_handshake_not_stacked_in_outbox() {
        setup_test_logging();
        let mut reactor = Reactor::new();
        let port = {
            let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };
        let id = reactor
            .open_reliable_datagram("127.0.0.1", port, DeliveryMode::Sequential)
            .unwrap();

        // While the socket never drains, repeated pre-cycles must not pile
        // up duplicate handshake frames.
        let now = Instant::now();
        reactor.pre_cycle(id, now);
        reactor.pre_cycle(id, now);
        reactor.pre_cycle(id, now);

        let conn = reactor.conns.get(&id).unwrap();
        assert_eq!(conn.outbox.len(), 1);
        assert!(matches!(
            Frame::decode(conn.outbox.front().unwrap()),
            Some(Frame::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_pair() {
        setup_test_logging();
        let mut reactor = Reactor::new();
        let (a, b) = reactor.open_local_pair();
        let mut set = ProcessSet::new();
        set.link(a);
        set.link(b);

        reactor.enqueue(a, b"over", false).unwrap();
        reactor.enqueue(a, b"local", false).unwrap();
        let active = reactor.run_cycle(&set, Duration::from_millis(100)).await;
        assert!(active >= 1);

        assert_eq!(reactor.drain_input(b), Some(b"over".to_vec()));
        assert_eq!(reactor.drain_input(b), Some(b"local".to_vec()));
        assert_eq!(reactor.drain_input(b), None);

        // Closing one half kills the other once it tries to flush.
        reactor.close(b);
        reactor.enqueue(a, b"x", false).unwrap();
        reactor.run_cycle(&set, Duration::from_millis(10)).await;
        assert!(reactor.is_dead(a));
    }

    #[tokio::test]
    async fn test_wake_interrupts_idle_cycle() {
        setup_test_logging();
        let mut reactor = Reactor::new();
        let (id, handle) = reactor.open_wake();
        let mut set = ProcessSet::new();
        set.link(id);

        handle.wake();
        let start = Instant::now();
        let active = reactor.run_cycle(&set, Duration::from_secs(30)).await;
        assert_eq!(active, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wake_from_another_thread() {
        setup_test_logging();
        let mut reactor = Reactor::new();
        let (id, handle) = reactor.open_wake();
        let mut set = ProcessSet::new();
        set.link(id);

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.wake();
        });
        let start = Instant::now();
        let active = reactor.run_cycle(&set, Duration::from_secs(30)).await;
        thread.join().unwrap();
        assert_eq!(active, 1);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_idle_cycle_honors_timeout() {
        let mut reactor = Reactor::new();
        let (a, _b) = reactor.open_local_pair();
        let mut set = ProcessSet::new();
        set.link(a);

        let start = Instant::now();
        let active = reactor.run_cycle(&set, Duration::from_millis(50)).await;
        assert_eq!(active, 0);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
