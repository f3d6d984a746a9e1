use std::time::Duration;

// Every UDP2W frame starts with a 4-byte kind tag and a 4-byte reply port.
pub const FRAME_HEADER_SIZE: usize = 8;

// Plain datagrams are framed as u32 length + payload.
pub const PLAIN_FRAME_PREFIX: usize = 4;

// How hard to probe for a free reply port, starting at the requested port + 1.
pub const REPLY_PORT_PROBE_RANGE: u16 = 128;

// Stream reads happen in chunks of this size until the socket would block.
pub const STREAM_READ_CHUNK: usize = 16384;

// Big enough for the largest possible UDP datagram.
pub const DATAGRAM_READ_BUF: usize = 65536;

// A connection that received nothing for this long is marked dead.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

// Handshakes get much less patience than established connections.
pub const DEFAULT_CONNECTING_TIMEOUT: Duration = Duration::from_secs(8);

// After sends lapse for this long, a PING goes out so the peer's liveness
// tracking keeps seeing us.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
