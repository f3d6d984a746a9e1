//! A socket transport layer that drives many heterogeneous connections from
//! one cooperative loop.
//!
//! Streams (TCP), fire-and-forget datagrams (UDP), reliable two-way UDP with
//! its own handshake/acknowledgment/resend protocol, in-process local pairs
//! and wake interrupts all live behind the same handle-based API: open or
//! listen, [`Reactor::enqueue`] output, await [`Reactor::run_cycle`] on a
//! [`ProcessSet`], then [`Reactor::drain_input`]. Nothing in the API blocks;
//! the one suspension point is the readiness wait inside `run_cycle`, and
//! runtime failures surface as [`Reactor::is_dead`] rather than errors.

mod conn;
mod constants;
mod engine;
mod error;
mod frame;
mod process_set;
mod reactor;
mod rtte;

#[cfg(test)]
mod test_util;

pub use conn::{ConnKind, ConnState};
pub use engine::DeliveryMode;
pub use error::{Error, Result};
pub use process_set::ProcessSet;
pub use reactor::{ConnId, Reactor, SocketOpts, WakeHandle};

/// One application-level message as carried by the datagram-like kinds.
pub type Payload = Vec<u8>;
