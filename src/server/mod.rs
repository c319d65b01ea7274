//! Connection multiplexer.
//!
//! One `mio::Poll` watches every listening socket, every client socket and
//! the pipes of every running CGI. Listener tokens are `0..n`; everything
//! else draws from [`TokenTable`], which also remembers which connection a
//! pipe token belongs to.

pub mod connection;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::models::Config;
use crate::error::{ServerError, is_resource_exhaustion};
use crate::server::connection::{Connection, Io};

/// Upper bound on a single wait, so timeouts are checked even when the
/// nearest deadline is far away.
const MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct TokenTable {
    next: usize,
    pipes: HashMap<Token, Token>,
}

impl TokenTable {
    pub fn new(first: usize) -> Self {
        Self {
            next: first,
            pipes: HashMap::new(),
        }
    }

    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }

    /// Allocates a token for a CGI pipe owned by connection `owner`.
    pub fn bind_pipe(&mut self, owner: Token) -> Token {
        let token = self.next_token();
        self.pipes.insert(token, owner);
        token
    }

    pub fn pipe_owner(&self, pipe: Token) -> Option<Token> {
        self.pipes.get(&pipe).copied()
    }

    pub fn release(&mut self, pipe: Token) {
        self.pipes.remove(&pipe);
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }
}

struct ListenerEntry {
    listener: TcpListener,
    addr: SocketAddr,
    /// Server blocks sharing this address, default host first.
    servers: Vec<usize>,
}

pub struct Server {
    poll: Poll,
    listeners: HashMap<Token, ListenerEntry>,
    connections: HashMap<Token, Connection>,
    tokens: TokenTable,
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;
        let first = config.servers.len();
        Ok(Self {
            poll,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            tokens: TokenTable::new(first),
            config,
        })
    }

    /// Binds one listening socket per distinct `host:port`. Any failure is
    /// fatal.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        for (idx, (addr, servers)) in self.config.listeners().into_iter().enumerate() {
            let parsed: SocketAddr = addr.parse().map_err(|source| ServerError::Address {
                addr: addr.clone(),
                source,
            })?;
            let mut listener = TcpListener::bind(parsed).map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
            let token = Token(idx);
            self.poll
                .registry()
                .register(&mut listener, token, Interest::READABLE)
                .map_err(ServerError::Register)?;

            let local = listener.local_addr().unwrap_or(parsed);
            let names: Vec<&str> = servers
                .iter()
                .map(|&s| self.config.servers[s].name.as_str())
                .collect();
            tracing::info!("listening on http://{} ({})", local, names.join(", "));
            self.listeners.insert(
                token,
                ListenerEntry {
                    listener,
                    addr: local,
                    servers,
                },
            );
        }
        Ok(())
    }

    /// Bound addresses in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let mut entries: Vec<(&Token, &ListenerEntry)> = self.listeners.iter().collect();
        entries.sort_by_key(|(token, _)| token.0);
        entries.into_iter().map(|(_, entry)| entry.addr).collect()
    }

    /// Runs the event loop until a fatal error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        tracing::info!("event loop started");
        loop {
            self.run_once(&mut events)?;
        }
    }

    /// One wait plus the dispatch of everything it returned.
    pub fn run_once(&mut self, events: &mut Events) -> Result<(), ServerError> {
        let timeout = self.next_timeout();
        if let Err(e) = self.poll.poll(events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            if is_resource_exhaustion(&e) {
                tracing::error!(error = %e, "poll failed: out of resources");
                return Err(ServerError::Exhausted(e));
            }
            tracing::warn!(error = %e, "poll failed, retrying");
            return Ok(());
        }

        for event in events.iter() {
            let token = event.token();
            if self.listeners.contains_key(&token) {
                self.accept_connections(token);
            } else if self.connections.contains_key(&token) {
                self.drive(token);
            } else if let Some(owner) = self.tokens.pipe_owner(token) {
                self.drive(owner);
            }
        }

        self.check_timeouts();
        Ok(())
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        self.connections
            .values()
            .map(|conn| conn.next_deadline(&self.config).saturating_duration_since(now))
            .min()
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT)
    }

    fn accept_connections(&mut self, token: Token) {
        loop {
            let Some(entry) = self.listeners.get_mut(&token) else {
                return;
            };
            match entry.listener.accept() {
                Ok((mut stream, peer)) => {
                    let conn_token = self.tokens.next_token();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, conn_token, Interest::READABLE)
                    {
                        tracing::error!(peer = %peer, error = %e, "cannot register client");
                        continue;
                    }
                    let servers = entry.servers.clone();
                    tracing::debug!(token = conn_token.0, peer = %peer, "accepted");
                    self.connections
                        .insert(conn_token, Connection::new(stream, peer, servers));
                    // Bytes may already be waiting.
                    self.drive(conn_token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue;
                }
                Err(e) => {
                    if is_resource_exhaustion(&e) {
                        tracing::error!(error = %e, "accept failed: out of resources");
                    } else {
                        tracing::warn!(error = %e, "accept failed");
                    }
                    return;
                }
            }
        }
    }

    fn drive(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let mut io = Io {
            registry: self.poll.registry(),
            config: &self.config,
            tokens: &mut self.tokens,
            token,
        };
        conn.on_event(&mut io);
        if conn.is_closing() {
            self.close_connection(token);
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let mut closing = Vec::new();
        for (&token, conn) in self.connections.iter_mut() {
            let mut io = Io {
                registry: self.poll.registry(),
                config: &self.config,
                tokens: &mut self.tokens,
                token,
            };
            conn.check_timeouts(&mut io, now);
            if conn.is_closing() {
                closing.push(token);
            }
        }
        for token in closing {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.shutdown(self.poll.registry(), &mut self.tokens);
            tracing::debug!(token = token.0, peer = %conn.peer, "closed");
        }
    }
}
