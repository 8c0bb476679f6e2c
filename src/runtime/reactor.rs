//! mio reactor shared by the client and server roles.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls until they would block. Uses
//! epoll on Linux, kqueue on macOS.
//!
//! The reactor owns the poll handle; connections are owned by a `Session`,
//! which also supplies the completion hooks. After every step the reactor
//! re-derives the connection's interest from its state and updates the
//! registration.

use crate::error::{ConnectionError, ReactorError};
use crate::runtime::{ConnState, Connection, Progress};
use mio::{Events, Poll, Registry, Token};
use std::io;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Default number of readiness events handled per poll.
pub const EVENTS_CAPACITY: usize = 1024;

/// Role-specific side of the reactor.
///
/// Hooks run on the reactor thread and may change the connection's state;
/// they never touch the poll registration directly.
pub trait Session {
    /// Look up a live connection.
    fn connection_mut(&mut self, token: Token) -> Option<&mut Connection>;

    /// Tokens of every live connection.
    fn tokens(&self) -> Vec<Token>;

    /// A non-blocking connect completed. The connection is already `Idle`.
    fn on_finished_connect(&mut self, _token: Token) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// The send buffer drained.
    fn on_finished_send(&mut self, token: Token) -> Result<(), ConnectionError>;

    /// The receive buffer filled. The hook must rewind it.
    fn on_finished_receive(&mut self, token: Token) -> Result<(), ConnectionError>;

    /// Remove a connection from the session, returning it for teardown.
    /// Returns `None` if it was already removed.
    fn release(&mut self, token: Token) -> Option<Connection>;
}

/// Readiness reported for one token by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        // Errors and hang-ups surface through the next read or write.
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        Self::with_capacity(EVENTS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, ReactorError> {
        Ok(Self {
            poll: Poll::new().map_err(ReactorError::setup("poll handle"))?,
            events: Events::with_capacity(capacity),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Wait up to `timeout` for readiness.
    ///
    /// An interrupted wait yields no events; any other failure is fatal.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>, ReactorError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(ReactorError::Poll(e)),
        }
        Ok(self.events.iter().map(Readiness::from_event).collect())
    }

    /// Handle one readiness report: connect first, then write, then read.
    /// Each step re-checks that the connection is still alive.
    pub fn dispatch<S: Session>(&self, session: &mut S, ready: Readiness) {
        let token = ready.token;

        if ready.writable && state_of(session, token).is_some_and(ConnState::is_connecting) {
            self.connect(session, token);
        }

        if ready.writable && state_of(session, token).is_some_and(ConnState::is_sending) {
            self.send(session, token);
        }

        if ready.readable && state_of(session, token).is_some_and(ConnState::wants_read) {
            self.receive(session, token);
        }
    }

    /// Complete a pending non-blocking connect.
    pub fn connect<S: Session>(&self, session: &mut S, token: Token) {
        let Some(conn) = session.connection_mut(token) else {
            return;
        };
        if !conn.state().is_connecting() {
            return;
        }

        match conn.finish_connect() {
            Ok(true) => {
                conn.set_state(ConnState::Idle);
                debug!(conn = token.0, "Connected");
                if let Err(e) = session.on_finished_connect(token) {
                    return self.fail(session, token, e);
                }
            }
            // Spurious wakeup, connect still in progress.
            Ok(false) => return,
            Err(e) => return self.fail(session, token, e.into()),
        }

        self.sync(session, token);
    }

    /// Write the send buffer until it drains or the socket would block.
    ///
    /// Each drained frame triggers exactly one `on_finished_send`. If the
    /// hook loads another frame, writing continues in the same call.
    pub fn send<S: Session>(&self, session: &mut S, token: Token) {
        loop {
            let Some(conn) = session.connection_mut(token) else {
                return;
            };
            if !conn.state().is_sending() {
                break;
            }

            match conn.drain_send() {
                Ok(Progress::Complete) => {
                    trace!(conn = token.0, bytes = conn.send_buf.capacity(), "Frame sent");
                    if let Err(e) = session.on_finished_send(token) {
                        return self.fail(session, token, e);
                    }
                }
                Ok(Progress::Blocked) => break,
                Err(e) => return self.fail(session, token, e.into()),
            }
        }

        self.sync(session, token);
    }

    /// Read into the receive buffer while the connection accepts reads.
    ///
    /// Each full frame triggers exactly one `on_finished_receive`. A hook
    /// that pauses reads ends the loop even if more data is pending.
    pub fn receive<S: Session>(&self, session: &mut S, token: Token) {
        loop {
            let Some(conn) = session.connection_mut(token) else {
                return;
            };
            if !conn.state().wants_read() {
                break;
            }

            match conn.fill_recv() {
                Ok(Progress::Complete) => {
                    trace!(conn = token.0, bytes = conn.recv_buf.capacity(), "Frame received");
                    if let Err(e) = session.on_finished_receive(token) {
                        return self.fail(session, token, e);
                    }
                }
                Ok(Progress::Blocked) => break,
                Err(e) => return self.fail(session, token, e.into()),
            }
        }

        self.sync(session, token);
    }

    /// Apply the interest implied by the connection's current state.
    pub fn sync<S: Session>(&self, session: &mut S, token: Token) {
        let result = match session.connection_mut(token) {
            Some(conn) => conn.sync_interest(self.registry()),
            None => return,
        };
        if let Err(e) = result {
            self.fail(session, token, e.into());
        }
    }

    /// Deregister, close and release a connection. Calling it again for the
    /// same token does nothing.
    pub fn terminate<S: Session>(&self, session: &mut S, token: Token) {
        if let Some(mut conn) = session.release(token) {
            conn.close(self.registry());
            debug!(conn = token.0, "Connection closed");
        }
    }

    /// Terminate every connection and close the poll handle.
    pub fn shutdown<S: Session>(self, session: &mut S) {
        let tokens = session.tokens();
        info!(connections = tokens.len(), "Shutting down reactor");
        for token in tokens {
            self.terminate(session, token);
        }
    }

    fn fail<S: Session>(&self, session: &mut S, token: Token, error: ConnectionError) {
        debug!(conn = token.0, error = %error, "Connection error");
        self.terminate(session, token);
    }
}

fn state_of<S: Session>(session: &mut S, token: Token) -> Option<ConnState> {
    session.connection_mut(token).map(|conn| conn.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::loopback_pair;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Instant;

    /// Session with one connection that records hook calls and echoes
    /// every received frame back, pausing reads while an echo is pending.
    struct Echo {
        conn: Option<Connection>,
        sends: usize,
        receives: usize,
        releases: usize,
        fail_receive: bool,
    }

    impl Echo {
        fn new(frame: usize) -> (Self, StdTcpStream) {
            let (stream, peer) = loopback_pair();
            let conn = Connection::new(Token(1), stream, ConnState::Receiving, frame, frame);
            let session = Self {
                conn: Some(conn),
                sends: 0,
                receives: 0,
                releases: 0,
                fail_receive: false,
            };
            (session, peer)
        }
    }

    impl Session for Echo {
        fn connection_mut(&mut self, token: Token) -> Option<&mut Connection> {
            self.conn.as_mut().filter(|c| c.token() == token)
        }

        fn tokens(&self) -> Vec<Token> {
            self.conn.iter().map(|c| c.token()).collect()
        }

        fn on_finished_send(&mut self, token: Token) -> Result<(), ConnectionError> {
            self.sends += 1;
            let conn = self.connection_mut(token).unwrap();
            conn.set_state(ConnState::Receiving);
            Ok(())
        }

        fn on_finished_receive(&mut self, token: Token) -> Result<(), ConnectionError> {
            self.receives += 1;
            if self.fail_receive {
                return Err(ConnectionError::BacklogFull(0));
            }
            let conn = self.connection_mut(token).unwrap();
            let frame = conn.recv_buf.as_slice().to_vec();
            conn.recv_buf.reset();
            conn.send_buf.load(&frame);
            conn.set_state(ConnState::SendingThrottled);
            Ok(())
        }

        fn release(&mut self, token: Token) -> Option<Connection> {
            let conn = self.conn.take().filter(|c| c.token() == token);
            if conn.is_some() {
                self.releases += 1;
            }
            conn
        }
    }

    fn pump<S: Session>(reactor: &mut Reactor, session: &mut S, until: impl Fn(&S) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !until(session) && Instant::now() < deadline {
            for ready in reactor.poll(Some(Duration::from_millis(10))).unwrap() {
                reactor.dispatch(session, ready);
            }
        }
    }

    #[test]
    fn test_fragmented_frame_completes_once() {
        let mut reactor = Reactor::new().unwrap();
        let (mut session, mut peer) = Echo::new(16);
        reactor.sync(&mut session, Token(1));

        // Deliver one frame in three fragments.
        for chunk in [&b"0123"[..], &b"456789a"[..], &b"bcdef"[..]] {
            peer.write_all(chunk).unwrap();
            peer.flush().unwrap();
            std::thread::sleep(Duration::from_millis(5));
            for ready in reactor.poll(Some(Duration::from_millis(50))).unwrap() {
                reactor.dispatch(&mut session, ready);
            }
        }

        pump(&mut reactor, &mut session, |s| s.sends == 1);
        assert_eq!(session.receives, 1);
        assert_eq!(session.sends, 1);

        let mut echoed = [0u8; 16];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"0123456789abcdef");
    }

    #[test]
    fn test_back_to_back_frames_each_complete() {
        let mut reactor = Reactor::new().unwrap();
        let (mut session, mut peer) = Echo::new(4);
        reactor.sync(&mut session, Token(1));

        peer.write_all(b"aaaabbbbcccc").unwrap();
        pump(&mut reactor, &mut session, |s| s.sends == 3);
        assert_eq!(session.receives, 3);

        let mut echoed = [0u8; 12];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"aaaabbbbcccc");
    }

    #[test]
    fn test_peer_close_terminates() {
        let mut reactor = Reactor::new().unwrap();
        let (mut session, peer) = Echo::new(8);
        reactor.sync(&mut session, Token(1));

        drop(peer);
        pump(&mut reactor, &mut session, |s| s.conn.is_none());
        assert_eq!(session.releases, 1);
        assert_eq!(session.receives, 0);
    }

    #[test]
    fn test_hook_error_terminates() {
        let mut reactor = Reactor::new().unwrap();
        let (mut session, mut peer) = Echo::new(4);
        session.fail_receive = true;
        reactor.sync(&mut session, Token(1));

        peer.write_all(b"oops").unwrap();
        pump(&mut reactor, &mut session, |s| s.conn.is_none());
        assert_eq!(session.receives, 1);
        assert_eq!(session.sends, 0);
        assert_eq!(session.releases, 1);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let (mut session, _peer) = Echo::new(4);
        reactor.sync(&mut session, Token(1));

        reactor.terminate(&mut session, Token(1));
        reactor.terminate(&mut session, Token(1));
        assert_eq!(session.releases, 1);
        assert!(session.tokens().is_empty());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let reactor = Reactor::new().unwrap();
        let (mut session, _peer) = Echo::new(4);
        reactor.sync(&mut session, Token(1));

        reactor.shutdown(&mut session);
        assert_eq!(session.releases, 1);
        assert!(session.conn.is_none());
    }
}
