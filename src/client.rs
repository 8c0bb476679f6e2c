//! Benchmark client.
//!
//! Drives a single connection: generates a random payload every send
//! interval, remembers its digest once fully written, and checks every
//! digest echoed by the server against the outstanding set.

use crate::config::ClientConfig;
use crate::digest::Digester;
use crate::error::{ConnectionError, ReactorError};
use crate::runtime::{ConnState, Connection, Reactor, Session};
use crate::stats::Stats;
use mio::net::TcpStream;
use mio::Token;
use rand::RngCore;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SERVER: Token = Token(0);

/// Connection and digest bookkeeping for the client role.
pub struct ClientSession {
    connection: Option<Connection>,
    digester: Digester,
    /// Multiset of digests awaiting an echo.
    pending: HashMap<String, usize>,
    pending_len: usize,
    stats: Arc<Stats>,
}

impl ClientSession {
    /// Wrap a socket whose non-blocking connect is in progress.
    pub fn new(
        stream: TcpStream,
        payload_size: usize,
        digester: Digester,
        stats: Arc<Stats>,
    ) -> Result<Self, ReactorError> {
        let digest_len = digester.output_len()?;
        let connection = Connection::new(
            SERVER,
            stream,
            ConnState::Connecting,
            digest_len,
            payload_size,
        );
        Ok(Self {
            connection: Some(connection),
            digester,
            pending: HashMap::new(),
            pending_len: 0,
            stats,
        })
    }

    /// Whether the connection to the server is still alive.
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Digests sent but not yet echoed.
    pub fn pending(&self) -> usize {
        self.pending_len
    }

    #[cfg(test)]
    pub fn state(&self) -> Option<ConnState> {
        self.connection.as_ref().map(|c| c.state())
    }

    /// Load a fresh random payload and request a write.
    ///
    /// Does nothing while connecting or while the previous payload is still
    /// being written. Returns whether a payload was generated.
    pub fn initiate_sending(&mut self) -> bool {
        let Some(conn) = self.connection.as_mut() else {
            return false;
        };
        match conn.state() {
            ConnState::Idle | ConnState::Receiving => {
                rand::thread_rng().fill_bytes(conn.send_buf.as_mut_slice());
                conn.send_buf.reset();
                conn.set_state(ConnState::Sending);
                true
            }
            _ => false,
        }
    }

    fn insert_pending(&mut self, digest: String) {
        *self.pending.entry(digest).or_insert(0) += 1;
        self.pending_len += 1;
    }

    /// Remove one occurrence of `digest`. Returns false if none was pending.
    fn remove_pending(&mut self, digest: &str) -> bool {
        match self.pending.get_mut(digest) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pending.remove(digest);
            }
            None => return false,
        }
        self.pending_len -= 1;
        true
    }
}

impl Session for ClientSession {
    fn connection_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connection.as_mut().filter(|c| c.token() == token)
    }

    fn tokens(&self) -> Vec<Token> {
        self.connection.iter().map(|c| c.token()).collect()
    }

    fn on_finished_connect(&mut self, _token: Token) -> Result<(), ConnectionError> {
        // Nothing to do until the rate timer fires.
        self.stats.record_connection_opened();
        info!("Connected to the server");
        Ok(())
    }

    fn on_finished_send(&mut self, token: Token) -> Result<(), ConnectionError> {
        let Some(conn) = self.connection.as_mut().filter(|c| c.token() == token) else {
            return Ok(());
        };
        let digest = self.digester.digest(conn.send_buf.as_slice())?;
        conn.set_state(ConnState::Receiving);
        self.insert_pending(digest);
        self.stats.record_sent();
        Ok(())
    }

    fn on_finished_receive(&mut self, token: Token) -> Result<(), ConnectionError> {
        let Some(conn) = self.connection_mut(token) else {
            return Ok(());
        };
        let digest = String::from_utf8_lossy(conn.recv_buf.as_slice()).into_owned();
        conn.recv_buf.reset();

        self.stats.record_received();
        if !self.remove_pending(&digest) {
            warn!(digest = %digest, "Received a digest with no matching payload");
            self.stats.record_unmatched();
        }
        Ok(())
    }

    fn release(&mut self, token: Token) -> Option<Connection> {
        if self.connection.as_ref().map(|c| c.token()) != Some(token) {
            return None;
        }
        let conn = self.connection.take()?;
        if !conn.state().is_connecting() {
            self.stats.record_connection_closed();
        }
        Some(conn)
    }
}

/// Client reactor loop paced by the configured sending rate.
pub struct Client {
    reactor: Reactor,
    session: ClientSession,
    send_interval: Duration,
    last_send: Option<Instant>,
}

impl Client {
    /// Resolve the server address and start a non-blocking connect.
    pub fn connect(
        config: &ClientConfig,
        digester: Digester,
        stats: Arc<Stats>,
    ) -> Result<Self, ReactorError> {
        let addr = resolve(&config.host, config.port)?;
        Self::connect_addr(addr, config, digester, stats)
    }

    pub fn connect_addr(
        addr: SocketAddr,
        config: &ClientConfig,
        digester: Digester,
        stats: Arc<Stats>,
    ) -> Result<Self, ReactorError> {
        let reactor = Reactor::new()?;
        let stream = TcpStream::connect(addr).map_err(ReactorError::setup("connection"))?;
        let mut session = ClientSession::new(stream, config.payload_size, digester, stats)?;

        if let Some(conn) = session.connection_mut(SERVER) {
            conn.sync_interest(reactor.registry())
                .map_err(ReactorError::setup("connection registration"))?;
        }

        info!(
            server = %addr,
            rate = config.rate,
            payload_size = config.payload_size,
            "Starting a client"
        );

        Ok(Self {
            reactor,
            session,
            send_interval: config.send_interval(),
            last_send: None,
        })
    }

    #[cfg(test)]
    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// One loop iteration: maybe start a send, then poll and dispatch.
    ///
    /// The poll waits at most until the next send is due, and not at all
    /// right after a send was started.
    pub fn turn(&mut self) -> Result<(), ReactorError> {
        let now = Instant::now();
        let elapsed = self.last_send.map(|t| now.duration_since(t));

        let timeout = match elapsed {
            Some(elapsed) if elapsed < self.send_interval => self.send_interval - elapsed,
            _ => {
                if self.session.initiate_sending() {
                    self.reactor.sync(&mut self.session, SERVER);
                }
                self.last_send = Some(now);
                Duration::ZERO
            }
        };

        for ready in self.reactor.poll(Some(timeout))? {
            self.reactor.dispatch(&mut self.session, ready);
        }
        Ok(())
    }

    /// Run until the connection is lost or polling fails.
    pub fn run(mut self) -> Result<(), ReactorError> {
        while self.session.is_open() {
            if let Err(e) = self.turn() {
                error!(error = %e, pending = self.session.pending(), "Reactor failed");
                let Client {
                    reactor,
                    mut session,
                    ..
                } = self;
                reactor.shutdown(&mut session);
                return Err(e);
            }
        }
        info!(
            pending = self.session.pending(),
            "The connection to the server is lost"
        );
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ReactorError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(ReactorError::setup("server address"))?;
    let addr = addrs.next().ok_or_else(|| {
        ReactorError::setup("server address")(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {host}"),
        ))
    })?;
    debug!(host, resolved = %addr, "Resolved server address");
    Ok(addr)
}
