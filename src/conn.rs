use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use rustc_hash::FxHashMap as HashMap;
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
};
use tracing::trace;

use crate::{
    Payload,
    engine::{DeliveryMode, Udp2wEngine},
    frame,
    reactor::ConnId,
};

/// What a connection is a handle over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Ordered byte stream (TCP). Framing is the caller's business.
    Stream,
    /// Accepts stream connections and spawns children.
    StreamListener,
    /// Plain datagrams, length-prefix framed, no delivery guarantees.
    Datagram,
    /// Two-way reliable datagram: the UDP2W protocol.
    Udp2w,
    /// Demultiplexes UDP2W datagrams to spawned children.
    Udp2wListener,
    /// In-process point-to-point channel.
    Local,
    /// Wakes a blocked reactor cycle from outside.
    Wake,
}

/// Exactly one of these holds at a time; `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Listening,
    Connecting,
    Connected,
    Dead,
}

/// The descriptors behind a connection.
pub(crate) enum Io {
    Stream(TcpStream),
    StreamListener(TcpListener),
    Datagram {
        sock: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    /// Initiator side: sends from `sock` to the peer's listening port,
    /// receives on the dedicated `reply` socket.
    Udp2w {
        sock: Arc<UdpSocket>,
        reply: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    /// Listener-spawned side: shares the listener's socket for sending;
    /// inbound datagrams are routed by the listener's demux. `from` is the
    /// demux key (the initiator's source address).
    Udp2wChild {
        sock: Arc<UdpSocket>,
        peer: SocketAddr,
        from: SocketAddr,
    },
    Udp2wListener {
        sock: Arc<UdpSocket>,
    },
    Local {
        tx: UnboundedSender<Payload>,
        rx: UnboundedReceiver<Payload>,
    },
    Wake {
        rx: UnboundedReceiver<()>,
    },
}

/// Listener bookkeeping. Children are plain ids, never references: the
/// registry owns the connections.
#[derive(Default)]
pub(crate) struct Children {
    /// Demux table for UDP2W listeners, keyed by the peer's source address.
    pub by_peer: HashMap<SocketAddr, ConnId>,
    /// Spawned but not yet claimed by the owner. Destroyed with the parent.
    pub unclaimed: VecDeque<ConnId>,
    /// Claimed children; the parent only unlinks these on teardown.
    pub claimed: Vec<ConnId>,
    /// Delivery mode inherited by spawned UDP2W children.
    pub mode: DeliveryMode,
}

pub(crate) struct Connection {
    pub state: ConnState,
    pub io: Io,

    /// Whole framed messages pending to send (datagram kinds).
    pub outbox: VecDeque<Payload>,
    /// Raw bytes pending to send (stream kind).
    pub out_stream: Vec<u8>,
    /// Framed messages received but not yet consumed.
    pub inbox: VecDeque<Payload>,
    /// Raw received bytes (stream kind).
    pub in_stream: Vec<u8>,

    pub engine: Option<Udp2wEngine>,
    pub parent: Option<ConnId>,
    pub children: Option<Children>,

    pub created_at: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,

    /// Readiness flag for the current reactor cycle.
    pub ready: bool,
    /// Whether anything happened to this connection this cycle.
    pub active: bool,
}

impl Connection {
    pub fn new(io: Io, state: ConnState, now: Instant) -> Self {
        Self {
            state,
            io,
            outbox: Default::default(),
            out_stream: Default::default(),
            inbox: Default::default(),
            in_stream: Default::default(),
            engine: None,
            parent: None,
            children: None,
            created_at: now,
            bytes_in: 0,
            bytes_out: 0,
            ready: false,
            active: false,
        }
    }

    pub fn kind(&self) -> ConnKind {
        match self.io {
            Io::Stream(_) => ConnKind::Stream,
            Io::StreamListener(_) => ConnKind::StreamListener,
            Io::Datagram { .. } => ConnKind::Datagram,
            Io::Udp2w { .. } | Io::Udp2wChild { .. } => ConnKind::Udp2w,
            Io::Udp2wListener { .. } => ConnKind::Udp2wListener,
            Io::Local { .. } => ConnKind::Local,
            Io::Wake { .. } => ConnKind::Wake,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.state == ConnState::Dead
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.io {
            Io::Stream(s) => s.peer_addr().ok(),
            Io::Datagram { peer, .. }
            | Io::Udp2w { peer, .. }
            | Io::Udp2wChild { peer, .. } => Some(*peer),
            _ => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.io {
            Io::Stream(s) => s.local_addr().ok(),
            Io::StreamListener(l) => l.local_addr().ok(),
            Io::Datagram { sock, .. } | Io::Udp2wListener { sock } => sock.local_addr().ok(),
            Io::Udp2w { reply, .. } => reply.local_addr().ok(),
            Io::Udp2wChild { sock, .. } => sock.local_addr().ok(),
            Io::Local { .. } | Io::Wake { .. } => None,
        }
    }

    /// Appends to the output buffer. Pure buffer mutation, never blocks;
    /// the actual I/O happens inside the reactor. Data enqueued on a dead
    /// connection is silently lost, per the error contract.
    pub fn enqueue(&mut self, bytes: Payload, reliable: bool, now: Instant) {
        if self.is_dead() {
            trace!("enqueue on dead connection dropped");
            return;
        }
        match &self.io {
            Io::Stream(_) => self.out_stream.extend_from_slice(&bytes),
            Io::Datagram { .. } => self.outbox.push_back(frame::encode_plain(&bytes)),
            Io::Udp2w { .. } | Io::Udp2wChild { .. } => {
                // Unwrap is fine: every UDP2W connection is built with an engine.
                let engine = self.engine.as_mut().unwrap();
                let encoded = if reliable {
                    engine.enqueue_reliable(bytes, now)
                } else {
                    engine.enqueue_unreliable(bytes)
                };
                self.outbox.push_back(encoded);
            }
            Io::Local { .. } => self.outbox.push_back(bytes),
            Io::StreamListener(_) | Io::Udp2wListener { .. } | Io::Wake { .. } => {
                trace!(kind = ?self.kind(), "enqueue on non-transport connection dropped");
            }
        }
    }

    /// Pops one complete message from the input buffer, or for streams the
    /// whole buffered byte run. Never blocks, never partially consumes.
    pub fn drain_input(&mut self) -> Option<Payload> {
        match self.io {
            Io::Stream(_) => {
                if self.in_stream.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut self.in_stream))
                }
            }
            _ => self.inbox.pop_front(),
        }
    }

    /// Bytes still waiting in the output buffer.
    pub fn output_pending(&self) -> usize {
        self.out_stream.len() + self.outbox.iter().map(|m| m.len()).sum::<usize>()
    }
}
