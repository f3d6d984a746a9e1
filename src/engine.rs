use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{Payload, frame::Frame, rtte::RttEstimator};

/// Delivery policy for reliable payloads on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Strict in-order consumption; out-of-order arrivals are buffered.
    #[default]
    Sequential,
    /// Deliver as soon as a payload arrives, whatever its sequence number.
    Unordered,
}

/// One outstanding reliable payload. The same record type backs both the
/// outbound resend list (bytes = the encoded frame, resent verbatim) and the
/// inbound gap list (bytes = the raw payload, `delivered` marks payloads the
/// unordered mode already handed to the caller).
struct AckRecord {
    seq: u32,
    bytes: Payload,
    at: Instant,
    delivered: bool,
}

/// What one inbound frame produced: payloads for the caller's input buffer,
/// frames to send back right away, and the identifier of a CONNECTION frame
/// if one was seen (handshake handling is the reactor's call).
#[derive(Default)]
pub(crate) struct FrameOutcome {
    pub delivered: Vec<Payload>,
    pub replies: Vec<Payload>,
    pub connection_seen: Option<String>,
}

/// Per-connection state of the two-way reliable UDP protocol: sequencing,
/// acknowledgment, adaptive resend and liveness. Pure buffer manipulation;
/// all I/O happens in the reactor.
pub(crate) struct Udp2wEngine {
    mode: DeliveryMode,
    ident: String,
    /// Identifier the peer sent in its CONNECTION frame. A later CONNECTION
    /// from the same address with a different identifier is a reconnect.
    pub peer_ident: Option<String>,
    /// Stamped into every outbound frame so the peer knows where to reply.
    reply_port: u16,
    keepalive: Duration,

    next_seq: u32,
    expected_seq: u32,
    out_pending: Vec<AckRecord>,
    in_gap: Vec<AckRecord>,

    rtte: RttEstimator,
    pub last_seen: Instant,
    next_ping: Instant,
}

impl Udp2wEngine {
    pub fn new(
        mode: DeliveryMode,
        ident: String,
        reply_port: u16,
        keepalive: Duration,
        now: Instant,
    ) -> Self {
        Self {
            mode,
            ident,
            peer_ident: None,
            reply_port,
            keepalive,
            next_seq: 0,
            expected_seq: 0,
            out_pending: Vec::new(),
            in_gap: Vec::new(),
            rtte: Default::default(),
            last_seen: now,
            next_ping: now + keepalive,
        }
    }

    pub fn pending_acks(&self) -> usize {
        self.out_pending.len()
    }

    /// The initiator's handshake frame, resent every cycle until connected.
    pub fn connection_frame(&self) -> Payload {
        Frame::Connection {
            reply_port: self.reply_port,
            ident: self.ident.clone(),
        }
        .encode()
    }

    /// The responder's bare acknowledgment.
    pub fn handshake_ack(&self) -> Payload {
        Frame::Connection {
            reply_port: self.reply_port,
            ident: String::new(),
        }
        .encode()
    }

    /// Registers a reliable payload under the next sequence number and
    /// returns the encoded RDATA frame for the output buffer.
    pub fn enqueue_reliable(&mut self, payload: Payload, now: Instant) -> Payload {
        let seq = self.next_seq;
        self.next_seq += 1;
        let encoded = Frame::Rdata {
            reply_port: self.reply_port,
            seq,
            payload,
        }
        .encode();
        self.out_pending.push(AckRecord {
            seq,
            bytes: encoded.clone(),
            at: now,
            delivered: false,
        });
        trace!(seq, pending = self.out_pending.len(), "registered reliable payload");
        encoded
    }

    pub fn enqueue_unreliable(&self, payload: Payload) -> Payload {
        Frame::Data {
            reply_port: self.reply_port,
            payload,
        }
        .encode()
    }

    /// Frames overdue for retransmission. Each is resent verbatim with its
    /// original sequence number; only the send timestamp is refreshed.
    pub fn scan_resends(&mut self, now: Instant) -> Vec<Payload> {
        let timeout = self.rtte.resend_timeout();
        let mut resend = Vec::new();
        for rec in self.out_pending.iter_mut() {
            if now.duration_since(rec.at) >= timeout {
                trace!(seq = rec.seq, ?timeout, "resending");
                rec.at = now;
                resend.push(rec.bytes.clone());
            }
        }
        resend
    }

    /// Called by the reactor whenever a datagram actually left the socket.
    pub fn on_sent(&mut self, now: Instant) {
        self.next_ping = now + self.keepalive;
    }

    /// Emits a PING once sends have lapsed for the keepalive interval.
    pub fn ping_due(&mut self, now: Instant) -> Option<Payload> {
        if now < self.next_ping {
            return None;
        }
        self.next_ping = now + self.keepalive;
        Some(
            Frame::Ping {
                reply_port: self.reply_port,
            }
            .encode(),
        )
    }

    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> FrameOutcome {
        self.last_seen = now;
        let mut out = FrameOutcome::default();
        match frame {
            Frame::Connection { ident, .. } => {
                out.connection_seen = Some(ident);
            }
            Frame::Data { payload, .. } => {
                out.delivered.push(payload);
            }
            Frame::Rdata { seq, payload, .. } => {
                self.on_rdata(seq, payload, &mut out);
            }
            Frame::Rconfirm { seq, .. } => {
                self.on_rconfirm(seq, now);
            }
            Frame::Ping { .. } => {}
        }
        out
    }

    fn rconfirm_for(&self, seq: u32) -> Payload {
        Frame::Rconfirm {
            reply_port: self.reply_port,
            seq,
        }
        .encode()
    }

    fn on_rdata(&mut self, seq: u32, payload: Payload, out: &mut FrameOutcome) {
        // Every accepted RDATA, duplicate or not, is confirmed: the sender
        // may not have seen the first acknowledgment.
        out.replies.push(self.rconfirm_for(seq));

        if seq < self.expected_seq {
            trace!(seq, expected = self.expected_seq, "duplicate RDATA");
            return;
        }

        if seq == self.expected_seq {
            out.delivered.push(payload);
            self.expected_seq += 1;
            self.drain_gap(out);
            return;
        }

        // seq > expected: a gap.
        if self.in_gap.iter().any(|r| r.seq == seq) {
            trace!(seq, "RDATA already buffered in gap list");
            return;
        }
        match self.mode {
            DeliveryMode::Sequential => {
                trace!(seq, expected = self.expected_seq, "buffering out-of-order RDATA");
                self.in_gap.push(AckRecord {
                    seq,
                    bytes: payload,
                    at: self.last_seen,
                    delivered: false,
                });
            }
            DeliveryMode::Unordered => {
                // Delivered now; the marked record keeps the later gap-fill
                // pass from handing it over a second time.
                out.delivered.push(payload);
                self.in_gap.push(AckRecord {
                    seq,
                    bytes: Vec::new(),
                    at: self.last_seen,
                    delivered: true,
                });
            }
        }
    }

    fn drain_gap(&mut self, out: &mut FrameOutcome) {
        loop {
            let pos = match self.in_gap.iter().position(|r| r.seq == self.expected_seq) {
                Some(pos) => pos,
                None => return,
            };
            let rec = self.in_gap.swap_remove(pos);
            if !rec.delivered {
                out.delivered.push(rec.bytes);
            }
            self.expected_seq += 1;
        }
    }

    /// Forgets a reliable payload that can never leave the socket (the
    /// datagram was dropped as oversize). Without this the resend scan
    /// would re-queue the doomed frame forever and `pending_acks` would
    /// never drain.
    pub fn drop_pending(&mut self, seq: u32) {
        if let Some(pos) = self.out_pending.iter().position(|r| r.seq == seq) {
            self.out_pending.swap_remove(pos);
            debug!(seq, "dropped undeliverable reliable payload");
        }
    }

    fn on_rconfirm(&mut self, seq: u32, now: Instant) {
        match self.out_pending.iter().position(|r| r.seq == seq) {
            Some(pos) => {
                let rec = self.out_pending.swap_remove(pos);
                self.rtte.sample(now.duration_since(rec.at));
                trace!(seq, pending = self.out_pending.len(), "RDATA confirmed");
            }
            None => {
                // Record already gone: a duplicate acknowledgment.
                debug!(seq, "unmatched RCONFIRM, ignoring");
            }
        }
    }

    #[cfg(test)]
    pub fn force_resend_timeout(&mut self, timeout: Duration) {
        self.rtte.force_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(mode: DeliveryMode, now: Instant) -> Udp2wEngine {
        Udp2wEngine::new(
            mode,
            "127.0.0.1-1724831000-0".to_owned(),
            5001,
            Duration::from_secs(10),
            now,
        )
    }

    fn rdata(seq: u32, payload: &[u8]) -> Frame {
        Frame::Rdata {
            reply_port: 6001,
            seq,
            payload: payload.to_vec(),
        }
    }

    fn rconfirm(seq: u32) -> Frame {
        Frame::Rconfirm {
            reply_port: 6001,
            seq,
        }
    }

    fn permutations(n: usize) -> Vec<Vec<u32>> {
        fn rec(prefix: &mut Vec<u32>, rest: &mut Vec<u32>, out: &mut Vec<Vec<u32>>) {
            if rest.is_empty() {
                out.push(prefix.clone());
                return;
            }
            for i in 0..rest.len() {
                let v = rest.remove(i);
                prefix.push(v);
                rec(prefix, rest, out);
                prefix.pop();
                rest.insert(i, v);
            }
        }
        let mut out = Vec::new();
        rec(&mut Vec::new(), &mut (0..n as u32).collect(), &mut out);
        out
    }

    #[test]
    fn test_sequential_delivery_all_arrival_orders() {
        let now = Instant::now();
        for perm in permutations(4) {
            let mut eng = engine(DeliveryMode::Sequential, now);
            let mut delivered = Vec::new();
            for &seq in &perm {
                let out = eng.on_frame(rdata(seq, format!("m{seq}").as_bytes()), now);
                delivered.extend(out.delivered);
                // Every RDATA gets confirmed immediately.
                assert_eq!(out.replies.len(), 1, "perm {perm:?} seq {seq}");
            }
            let expected: Vec<Vec<u8>> =
                (0..4).map(|s| format!("m{s}").into_bytes()).collect();
            assert_eq!(delivered, expected, "perm {perm:?}");
        }
    }

    #[test]
    fn test_unordered_eventual_completeness() {
        let now = Instant::now();
        for perm in permutations(4) {
            let mut eng = engine(DeliveryMode::Unordered, now);
            let mut delivered = Vec::new();
            for &seq in &perm {
                delivered.extend(eng.on_frame(rdata(seq, format!("m{seq}").as_bytes()), now).delivered);
            }
            // Everything arrives exactly once, immediately on receipt.
            let mut got: Vec<Vec<u8>> = delivered;
            got.sort();
            let mut want: Vec<Vec<u8>> =
                (0..4).map(|s| format!("m{s}").into_bytes()).collect();
            want.sort();
            assert_eq!(got, want, "perm {perm:?}");
        }
    }

    #[test]
    fn test_unordered_gap_fill_does_not_redeliver() {
        let now = Instant::now();
        let mut eng = engine(DeliveryMode::Unordered, now);

        let out = eng.on_frame(rdata(1, b"b"), now);
        assert_eq!(out.delivered, vec![b"b".to_vec()]);

        // Filling the gap must deliver only seq 0; seq 1 already went out.
        let out = eng.on_frame(rdata(0, b"a"), now);
        assert_eq!(out.delivered, vec![b"a".to_vec()]);

        let out = eng.on_frame(rdata(2, b"c"), now);
        assert_eq!(out.delivered, vec![b"c".to_vec()]);
    }

    #[test]
    fn test_duplicate_rdata_discarded_but_confirmed() {
        let now = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, now);

        let out = eng.on_frame(rdata(0, b"x"), now);
        assert_eq!(out.delivered.len(), 1);
        assert_eq!(out.replies.len(), 1);

        let out = eng.on_frame(rdata(0, b"x"), now);
        assert!(out.delivered.is_empty());
        assert_eq!(out.replies.len(), 1);

        // Duplicate of a still-gapped frame: confirmed, buffered once.
        let out = eng.on_frame(rdata(5, b"y"), now);
        assert!(out.delivered.is_empty());
        let out = eng.on_frame(rdata(5, b"y"), now);
        assert!(out.delivered.is_empty());
        assert_eq!(out.replies.len(), 1);
        assert_eq!(eng.in_gap.len(), 1);
    }

    #[test]
    fn test_idempotent_rconfirm() {
        let t0 = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, t0);
        eng.enqueue_reliable(b"ping".to_vec(), t0);
        assert_eq!(eng.pending_acks(), 1);

        let t1 = t0 + Duration::from_millis(40);
        eng.on_frame(rconfirm(0), t1);
        assert_eq!(eng.pending_acks(), 0);

        // A second RCONFIRM for the same seq is a no-op.
        eng.on_frame(rconfirm(0), t1);
        assert_eq!(eng.pending_acks(), 0);

        // As is one for a seq never sent.
        eng.on_frame(rconfirm(17), t1);
        assert_eq!(eng.pending_acks(), 0);
    }

    #[test]
    fn test_drop_pending_stops_resends() {
        let t0 = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, t0);
        eng.force_resend_timeout(Duration::from_millis(100));
        eng.enqueue_reliable(b"too big for the wire".to_vec(), t0);
        eng.enqueue_reliable(b"fine".to_vec(), t0);
        assert_eq!(eng.pending_acks(), 2);

        eng.drop_pending(0);
        assert_eq!(eng.pending_acks(), 1);

        // Only the surviving record is ever rescanned.
        let due = eng.scan_resends(t0 + Duration::from_secs(60));
        assert_eq!(due.len(), 1);
        match Frame::decode(&due[0]) {
            Some(Frame::Rdata { seq, .. }) => assert_eq!(seq, 1),
            other => panic!("expected RDATA, got {other:?}"),
        }

        // Unknown seq is a no-op.
        eng.drop_pending(17);
        assert_eq!(eng.pending_acks(), 1);
    }

    #[test]
    fn test_resend_convergence() {
        let t0 = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, t0);
        eng.force_resend_timeout(Duration::from_millis(100));
        let frame = eng.enqueue_reliable(b"payload".to_vec(), t0);

        // Suppose only the 5th resend attempt gets through.
        let mut resends = 0;
        let mut now = t0;
        while resends < 5 {
            now += Duration::from_millis(100);
            let due = eng.scan_resends(now);
            if !due.is_empty() {
                assert_eq!(due, vec![frame.clone()], "resent verbatim");
                resends += 1;
            }
        }
        assert_eq!(eng.pending_acks(), 1);

        eng.on_frame(rconfirm(0), now + Duration::from_millis(10));
        assert_eq!(eng.pending_acks(), 0);
        assert!(eng.scan_resends(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_resend_not_due_before_timeout() {
        let t0 = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, t0);
        eng.force_resend_timeout(Duration::from_millis(100));
        eng.enqueue_reliable(b"p".to_vec(), t0);
        assert!(eng.scan_resends(t0 + Duration::from_millis(99)).is_empty());
        assert_eq!(eng.scan_resends(t0 + Duration::from_millis(100)).len(), 1);
        // Timestamp was refreshed; not due again immediately.
        assert!(eng.scan_resends(t0 + Duration::from_millis(150)).is_empty());
    }

    #[test]
    fn test_any_frame_refreshes_last_seen() {
        let t0 = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, t0);
        let t1 = t0 + Duration::from_secs(5);
        eng.on_frame(Frame::Ping { reply_port: 6001 }, t1);
        assert_eq!(eng.last_seen, t1);
    }

    #[test]
    fn test_ping_schedule() {
        let t0 = Instant::now();
        let mut eng = Udp2wEngine::new(
            DeliveryMode::Sequential,
            String::new(),
            5001,
            Duration::from_secs(10),
            t0,
        );
        assert!(eng.ping_due(t0 + Duration::from_secs(9)).is_none());
        assert!(eng.ping_due(t0 + Duration::from_secs(10)).is_some());
        // Sending anything pushes the next ping out.
        eng.on_sent(t0 + Duration::from_secs(15));
        assert!(eng.ping_due(t0 + Duration::from_secs(24)).is_none());
        assert!(eng.ping_due(t0 + Duration::from_secs(25)).is_some());
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let t0 = Instant::now();
        let mut eng = engine(DeliveryMode::Sequential, t0);
        for expected in 0u32..5 {
            let encoded = eng.enqueue_reliable(vec![0], t0);
            match Frame::decode(&encoded) {
                Some(Frame::Rdata { seq, .. }) => assert_eq!(seq, expected),
                other => panic!("expected RDATA, got {other:?}"),
            }
        }
    }
}
