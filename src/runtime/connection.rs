//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its socket, its two frame buffers and an explicit
//! state. The readiness interest registered with the poll handle is always
//! derived from the state, never stored as the state itself.

use crate::runtime::buffer::{FrameBuffer, Progress, TransferError};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect in flight.
    Connecting,
    /// Connected, no transfer requested.
    Idle,
    /// Waiting for the next inbound frame.
    Receiving,
    /// A frame is loaded in the send buffer; inbound frames still accepted.
    Sending,
    /// A frame is loaded in the send buffer; reads paused for backpressure.
    SendingThrottled,
    /// Torn down.
    Closed,
}

impl ConnState {
    /// Readiness interest implied by this state. `None` means the socket
    /// should not be registered at all.
    pub fn interest(self) -> Option<Interest> {
        match self {
            // Connect completion is reported as writability.
            ConnState::Connecting => Some(Interest::WRITABLE),
            ConnState::Receiving => Some(Interest::READABLE),
            ConnState::Sending => Some(Interest::READABLE | Interest::WRITABLE),
            ConnState::SendingThrottled => Some(Interest::WRITABLE),
            ConnState::Idle | ConnState::Closed => None,
        }
    }

    pub fn is_connecting(self) -> bool {
        matches!(self, ConnState::Connecting)
    }

    pub fn is_sending(self) -> bool {
        matches!(self, ConnState::Sending | ConnState::SendingThrottled)
    }

    pub fn wants_read(self) -> bool {
        matches!(self, ConnState::Receiving | ConnState::Sending)
    }
}

/// A single TCP connection driven by the reactor.
#[derive(Debug)]
pub struct Connection {
    token: Token,
    stream: TcpStream,
    pub recv_buf: FrameBuffer,
    pub send_buf: FrameBuffer,
    state: ConnState,
    /// Interest currently registered with the poll handle.
    registered: Option<Interest>,
}

impl Connection {
    /// Wrap a socket. Nothing is registered until the first `sync_interest`.
    pub fn new(
        token: Token,
        stream: TcpStream,
        state: ConnState,
        recv_size: usize,
        send_size: usize,
    ) -> Self {
        Self {
            token,
            stream,
            recv_buf: FrameBuffer::new(recv_size),
            send_buf: FrameBuffer::new(send_size),
            state,
            registered: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    #[cfg(test)]
    pub fn registered(&self) -> Option<Interest> {
        self.registered
    }

    /// Read into the receive buffer from the socket.
    pub fn fill_recv(&mut self) -> Result<Progress, TransferError> {
        self.recv_buf.read_from(&mut self.stream)
    }

    /// Write the send buffer to the socket.
    pub fn drain_send(&mut self) -> Result<Progress, TransferError> {
        self.send_buf.write_to(&mut self.stream)
    }

    /// Check whether a non-blocking connect has finished.
    ///
    /// Returns `Ok(false)` on a spurious wakeup while the connect is still
    /// in progress.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Bring the poll registration in line with the current state.
    ///
    /// Re-registration also re-arms edge-triggered readiness, so a socket
    /// that already has data pending is reported again on the next poll.
    pub fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = self.state.interest();
        match (self.registered, desired) {
            (None, Some(interest)) => registry.register(&mut self.stream, self.token, interest)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (Some(current), Some(interest)) if current != interest => {
                registry.reregister(&mut self.stream, self.token, interest)?
            }
            _ => {}
        }
        self.registered = desired;
        Ok(())
    }

    /// Deregister and shut the socket down. The socket itself is closed
    /// when the connection is dropped.
    pub fn close(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state = ConnState::Closed;
    }
}
