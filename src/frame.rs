use tracing::trace;

use crate::{Payload, constants::{FRAME_HEADER_SIZE, PLAIN_FRAME_PREFIX}};

const KIND_CONNECTION: u32 = 0;
const KIND_DATA: u32 = 1;
const KIND_RDATA: u32 = 3;
const KIND_RCONFIRM: u32 = 5;
const KIND_PING: u32 = 7;

/// One UDP2W wire frame. All multi-byte integers are big-endian. Every frame
/// carries the sender's reply port so the receiver knows where to address
/// its answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Session establishment. The identifier disambiguates duplicate
    /// connection attempts from the same peer address; an acknowledgment
    /// carries an empty identifier.
    Connection { reply_port: u16, ident: String },
    /// Unreliable payload.
    Data { reply_port: u16, payload: Payload },
    /// Reliable payload, resent until the matching Rconfirm arrives.
    Rdata {
        reply_port: u16,
        seq: u32,
        payload: Payload,
    },
    /// Acknowledges one Rdata.
    Rconfirm { reply_port: u16, seq: u32 },
    /// Liveness probe.
    Ping { reply_port: u16 },
}

impl Frame {
    pub fn reply_port(&self) -> u16 {
        match self {
            Frame::Connection { reply_port, .. }
            | Frame::Data { reply_port, .. }
            | Frame::Rdata { reply_port, .. }
            | Frame::Rconfirm { reply_port, .. }
            | Frame::Ping { reply_port } => *reply_port,
        }
    }

    fn kind_tag(&self) -> u32 {
        match self {
            Frame::Connection { .. } => KIND_CONNECTION,
            Frame::Data { .. } => KIND_DATA,
            Frame::Rdata { .. } => KIND_RDATA,
            Frame::Rconfirm { .. } => KIND_RCONFIRM,
            Frame::Ping { .. } => KIND_PING,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.encoded_body_len());
        buf.extend_from_slice(&self.kind_tag().to_be_bytes());
        buf.extend_from_slice(&(self.reply_port() as u32).to_be_bytes());
        match self {
            Frame::Connection { ident, .. } => {
                buf.extend_from_slice(&(ident.len() as u32).to_be_bytes());
                buf.extend_from_slice(ident.as_bytes());
            }
            Frame::Data { payload, .. } => buf.extend_from_slice(payload),
            Frame::Rdata { seq, payload, .. } => {
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Frame::Rconfirm { seq, .. } => buf.extend_from_slice(&seq.to_be_bytes()),
            Frame::Ping { .. } => {}
        }
        buf
    }

    fn encoded_body_len(&self) -> usize {
        match self {
            Frame::Connection { ident, .. } => 4 + ident.len(),
            Frame::Data { payload, .. } => payload.len(),
            Frame::Rdata { payload, .. } => 4 + payload.len(),
            Frame::Rconfirm { .. } => 4,
            Frame::Ping { .. } => 0,
        }
    }

    /// Decodes one whole datagram. A truncated or unrecognized frame is not
    /// an error: the datagram is simply dropped by the caller.
    pub fn decode(buf: &[u8]) -> Option<Frame> {
        if buf.len() < FRAME_HEADER_SIZE {
            trace!(len = buf.len(), "datagram shorter than frame header");
            return None;
        }
        let kind = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let reply_port_raw = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let reply_port = u16::try_from(reply_port_raw).ok()?;
        let body = &buf[FRAME_HEADER_SIZE..];

        match kind {
            KIND_CONNECTION => {
                if body.len() < 4 {
                    return None;
                }
                let id_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
                let id = body.get(4..4 + id_len)?;
                let ident = String::from_utf8(id.to_vec()).ok()?;
                Some(Frame::Connection { reply_port, ident })
            }
            KIND_DATA => Some(Frame::Data {
                reply_port,
                payload: body.to_vec(),
            }),
            KIND_RDATA => {
                if body.len() < 4 {
                    return None;
                }
                let seq = u32::from_be_bytes(body[0..4].try_into().unwrap());
                Some(Frame::Rdata {
                    reply_port,
                    seq,
                    payload: body[4..].to_vec(),
                })
            }
            KIND_RCONFIRM => {
                if body.len() < 4 {
                    return None;
                }
                let seq = u32::from_be_bytes(body[0..4].try_into().unwrap());
                Some(Frame::Rconfirm { reply_port, seq })
            }
            KIND_PING => Some(Frame::Ping { reply_port }),
            other => {
                trace!(kind = other, "unknown frame kind");
                None
            }
        }
    }
}

/// Framing for plain (non-UDP2W) datagrams: u32 total length + payload.
/// The payload is opaque to this layer.
pub fn encode_plain(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PLAIN_FRAME_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Returns the payload if the datagram carries exactly the declared length.
pub fn decode_plain(buf: &[u8]) -> Option<Payload> {
    if buf.len() < PLAIN_FRAME_PREFIX {
        return None;
    }
    let len = u32::from_be_bytes(buf[0..PLAIN_FRAME_PREFIX].try_into().unwrap()) as usize;
    let payload = buf.get(PLAIN_FRAME_PREFIX..PLAIN_FRAME_PREFIX + len)?;
    if buf.len() != PLAIN_FRAME_PREFIX + len {
        trace!(
            declared = len,
            actual = buf.len() - PLAIN_FRAME_PREFIX,
            "plain datagram length mismatch"
        );
        return None;
    }
    Some(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode();
        assert_eq!(Frame::decode(&encoded), Some(frame));
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        roundtrip(Frame::Connection {
            reply_port: 9001,
            ident: "10.0.0.1-1724831000-deadbeef".to_owned(),
        });
        roundtrip(Frame::Connection {
            reply_port: 9001,
            ident: String::new(),
        });
        roundtrip(Frame::Data {
            reply_port: 1,
            payload: b"hello".to_vec(),
        });
        roundtrip(Frame::Rdata {
            reply_port: 65535,
            seq: u32::MAX,
            payload: vec![],
        });
        roundtrip(Frame::Rconfirm {
            reply_port: 12345,
            seq: 42,
        });
        roundtrip(Frame::Ping { reply_port: 777 });
    }

    #[test]
    fn test_roundtrip_random() {
        use rand::Rng;
        let mut rng = rand::rng();
        for _ in 0..200 {
            let reply_port: u16 = rng.random();
            let payload: Vec<u8> = (0..rng.random_range(0..512)).map(|_| rng.random()).collect();
            let frame = match rng.random_range(0..4) {
                0 => Frame::Data {
                    reply_port,
                    payload,
                },
                1 => Frame::Rdata {
                    reply_port,
                    seq: rng.random(),
                    payload,
                },
                2 => Frame::Rconfirm {
                    reply_port,
                    seq: rng.random(),
                },
                _ => Frame::Ping { reply_port },
            };
            roundtrip(frame);
        }
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let full = Frame::Rdata {
            reply_port: 10,
            seq: 7,
            payload: b"abc".to_vec(),
        }
        .encode();
        for cut in 0..FRAME_HEADER_SIZE + 4 {
            assert_eq!(Frame::decode(&full[..cut]), None, "cut={cut}");
        }

        let conn = Frame::Connection {
            reply_port: 10,
            ident: "abcdef".to_owned(),
        }
        .encode();
        // Identifier declared longer than the datagram.
        for cut in FRAME_HEADER_SIZE + 4..conn.len() {
            assert_eq!(Frame::decode(&conn[..cut]), None, "cut={cut}");
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = Frame::Ping { reply_port: 1 }.encode();
        buf[3] = 99;
        assert_eq!(Frame::decode(&buf), None);
    }

    #[test]
    fn test_plain_framing() {
        let encoded = encode_plain(b"payload");
        assert_eq!(decode_plain(&encoded), Some(b"payload".to_vec()));

        // Declared length beyond the datagram.
        assert_eq!(decode_plain(&encoded[..encoded.len() - 1]), None);

        // Trailing garbage.
        let mut long = encoded.clone();
        long.push(0);
        assert_eq!(decode_plain(&long), None);

        assert_eq!(decode_plain(&[]), None);
        assert_eq!(decode_plain(&encode_plain(b"")), Some(vec![]));
    }
}
