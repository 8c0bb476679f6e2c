//! Readiness-driven runtime shared by the client and server roles.
//!
//! - `FrameBuffer`: fixed-length framing with resumable partial transfers
//! - `Connection`: socket, buffers and explicit connection state
//! - `Reactor`: mio poll loop dispatching to a role's `Session` hooks

mod buffer;
mod connection;
mod reactor;

pub(crate) use buffer::{Progress, TransferError};
pub(crate) use connection::{ConnState, Connection};
pub(crate) use reactor::{Reactor, Session};

#[cfg(test)]
pub(crate) use connection::tests::loopback_pair;
