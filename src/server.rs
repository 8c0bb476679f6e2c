//! Benchmark server.
//!
//! Accepts clients, digests every payload they send and writes the digests
//! back in order. Each connection has a bounded queue of outstanding
//! responses; while it is full the connection stops reading, so a client
//! that does not consume its responses cannot grow server memory.

use crate::config::ServerConfig;
use crate::digest::Digester;
use crate::error::{ConnectionError, ReactorError};
use crate::runtime::{ConnState, Connection, Reactor, Session};
use crate::stats::Stats;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Listen backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Upper bound on a single wait for readiness.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// FIFO of digests waiting for the send buffer, capped at a fixed capacity.
///
/// A digest leaves the queue when it is loaded for sending, so the response
/// being written does not count against the capacity.
#[derive(Debug)]
pub struct ResponseQueue {
    items: VecDeque<String>,
    capacity: usize,
}

impl ResponseQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a response. Never drops: a full queue is an error.
    pub fn push(&mut self, digest: String) -> Result<(), ConnectionError> {
        if self.is_full() {
            return Err(ConnectionError::BacklogFull(self.items.len()));
        }
        self.items.push_back(digest);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<String> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }
}

/// A client connection and its outstanding responses.
struct Peer {
    conn: Connection,
    responses: ResponseQueue,
}

impl Peer {
    /// Dequeue the next response into the send buffer unless a write is
    /// already in flight.
    fn initiate_sending(&mut self) {
        let state = self.conn.state();
        if state.is_sending() || state.is_connecting() {
            return;
        }
        if let Some(digest) = self.responses.pop() {
            self.conn.send_buf.load(digest.as_bytes());
            self.conn.set_state(ConnState::Sending);
        }
    }

    /// Stop reading while the queue is full. Only a connection that is
    /// already writing can have a full queue.
    fn throttle_if_full(&mut self) -> bool {
        if self.responses.is_full() && self.conn.state() == ConnState::Sending {
            self.conn.set_state(ConnState::SendingThrottled);
            return true;
        }
        false
    }
}

/// Connection table and response queues for the server role.
pub struct ServerSession {
    peers: Slab<Peer>,
    digester: Digester,
    payload_size: usize,
    digest_len: usize,
    queue_capacity: usize,
    max_connections: usize,
    stats: Arc<Stats>,
}

impl ServerSession {
    pub fn new(
        config: &ServerConfig,
        digester: Digester,
        stats: Arc<Stats>,
    ) -> Result<Self, ReactorError> {
        let digest_len = digester.output_len()?;
        Ok(Self {
            peers: Slab::with_capacity(config.max_connections.min(1024)),
            digester,
            payload_size: config.payload_size,
            digest_len,
            queue_capacity: config.queue_capacity,
            max_connections: config.max_connections,
            stats,
        })
    }

    /// Take ownership of an accepted socket and start reading from it.
    ///
    /// Returns `Ok(None)` if the connection limit is reached; the socket is
    /// closed in that case.
    pub fn add(&mut self, stream: TcpStream, registry: &Registry) -> io::Result<Option<Token>> {
        if self.peers.len() >= self.max_connections {
            return Ok(None);
        }

        let entry = self.peers.vacant_entry();
        let token = Token(entry.key());
        let mut conn = Connection::new(
            token,
            stream,
            ConnState::Receiving,
            self.payload_size,
            self.digest_len,
        );
        conn.sync_interest(registry)?;
        entry.insert(Peer {
            conn,
            responses: ResponseQueue::new(self.queue_capacity),
        });
        self.stats.record_connection_opened();
        Ok(Some(token))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Responses waiting on a connection.
    #[cfg(test)]
    pub fn outstanding(&self, token: Token) -> Option<usize> {
        self.peers.get(token.0).map(|p| p.responses.len())
    }

    #[cfg(test)]
    pub fn state(&self, token: Token) -> Option<ConnState> {
        self.peers.get(token.0).map(|p| p.conn.state())
    }
}

impl Session for ServerSession {
    fn connection_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.peers.get_mut(token.0).map(|p| &mut p.conn)
    }

    fn tokens(&self) -> Vec<Token> {
        self.peers.iter().map(|(key, _)| Token(key)).collect()
    }

    fn on_finished_receive(&mut self, token: Token) -> Result<(), ConnectionError> {
        let Some(peer) = self.peers.get_mut(token.0) else {
            return Ok(());
        };

        let digest = self.digester.digest(peer.conn.recv_buf.as_slice())?;
        peer.conn.recv_buf.reset();
        peer.responses.push(digest)?;
        self.stats.record_message();

        peer.initiate_sending();

        if peer.throttle_if_full() {
            debug!(
                conn = token.0,
                outstanding = peer.responses.len(),
                "Response backlog full, pausing reads"
            );
        }
        Ok(())
    }

    fn on_finished_send(&mut self, token: Token) -> Result<(), ConnectionError> {
        let Some(peer) = self.peers.get_mut(token.0) else {
            return Ok(());
        };

        let throttled = peer.conn.state() == ConnState::SendingThrottled;
        peer.conn.set_state(ConnState::Receiving);
        peer.initiate_sending();

        if !peer.throttle_if_full() && throttled {
            debug!(
                conn = token.0,
                outstanding = peer.responses.len(),
                "Response backlog drained, resuming reads"
            );
        }
        Ok(())
    }

    fn release(&mut self, token: Token) -> Option<Connection> {
        let peer = self.peers.try_remove(token.0)?;
        self.stats.record_connection_closed();
        Some(peer.conn)
    }
}

/// Server reactor loop: one listener plus every accepted connection.
pub struct Server {
    reactor: Reactor,
    listener: TcpListener,
    session: ServerSession,
}

impl Server {
    /// Bind the listener and prepare the reactor.
    pub fn bind(
        config: &ServerConfig,
        digester: Digester,
        stats: Arc<Stats>,
    ) -> Result<Self, ReactorError> {
        let addr = (config.bind.as_str(), config.port)
            .to_socket_addrs()
            .map_err(ReactorError::setup("listen address"))?
            .next()
            .ok_or_else(|| {
                ReactorError::setup("listen address")(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for {}", config.listen_addr()),
                ))
            })?;

        let reactor = Reactor::new()?;
        let listener = create_listener(addr).map_err(ReactorError::setup("listener"))?;
        let mut listener = TcpListener::from_std(listener);
        reactor
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ReactorError::setup("listener registration"))?;

        let session = ServerSession::new(config, digester, stats)?;

        info!(
            addr = %addr,
            payload_size = config.payload_size,
            queue_capacity = config.queue_capacity,
            max_connections = config.max_connections,
            "Starting the server"
        );

        Ok(Self {
            reactor,
            listener,
            session,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    /// One loop iteration: poll, accept, dispatch.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), ReactorError> {
        for ready in self.reactor.poll(timeout)? {
            if ready.token == LISTENER_TOKEN {
                self.accept();
            } else {
                self.reactor.dispatch(&mut self.session, ready);
            }
        }
        Ok(())
    }

    /// Run until polling fails, then close every connection.
    pub fn run(mut self) -> Result<(), ReactorError> {
        loop {
            if let Err(e) = self.turn(Some(POLL_TIMEOUT)) {
                error!(
                    error = %e,
                    connections = self.session.len(),
                    "Reactor failed, closing all connections"
                );
                let Server {
                    reactor,
                    mut session,
                    ..
                } = self;
                reactor.shutdown(&mut session);
                return Err(e);
            }
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    match self.session.add(stream, self.reactor.registry()) {
                        Ok(Some(token)) => {
                            debug!(conn = token.0, peer = %peer_addr, "Accepted a connection")
                        }
                        Ok(None) => warn!(peer = %peer_addr, "Connection limit reached"),
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "Failed to register connection")
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
