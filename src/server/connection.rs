//! Client session state machine.
//!
//! A `Connection` owns one client socket, the bytes read from it that have
//! not been parsed yet, the request being parsed, and two FIFO queues: the
//! requests accepted so far and their responses. Responses are written
//! strictly in queue order, so a slow CGI at the front holds back everything
//! behind it.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::config::models::Config;
use crate::error::CgiError;
use crate::handlers::{self, Context};
use crate::http::parser::{Progress, RequestParser};
use crate::http::request::{Method, Request};
use crate::http::response::{Persistence, Response};
use crate::http::status::StatusCode;
use crate::network::reader::{ByteReader, ReadOutcome};
use crate::server::TokenTable;

/// Requests parsed ahead of their responses before parsing pauses.
pub const MAX_IN_FLIGHT: usize = 16;

/// Unparsed bytes buffered before reading pauses.
const READ_CAP: usize = 64 * 1024;

/// How often a reaped-but-not-exited CGI child is polled.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRequest,
    ReadingHeaders,
    ReadingBody,
    Routed,
    Responding,
    Closing,
}

/// What a connection needs from the server while handling an event.
pub struct Io<'a> {
    pub registry: &'a Registry,
    pub config: &'a Config,
    pub tokens: &'a mut TokenTable,
    pub token: Token,
}

#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Server blocks bound to the listener this client arrived on.
    candidates: Vec<usize>,
    state: ConnectionState,
    interest: Interest,
    reader: ByteReader,
    parser: RequestParser,
    current: Request,
    requests: VecDeque<Request>,
    responses: VecDeque<Response>,
    out: Vec<u8>,
    out_pos: usize,
    nb_requests: usize,
    created: Instant,
    last_activity: Instant,
    should_close: bool,
    peer_closed: bool,
    failed: bool,
    timed_out: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, candidates: Vec<usize>) -> Self {
        let now = Instant::now();
        Self {
            stream,
            peer,
            candidates,
            state: ConnectionState::AwaitingRequest,
            interest: Interest::READABLE,
            reader: ByteReader::new(),
            parser: RequestParser::new(),
            current: Request::new(),
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            out: Vec::new(),
            out_pos: 0,
            nb_requests: 0,
            created: now,
            last_activity: now,
            should_close: false,
            peer_closed: false,
            failed: false,
            timed_out: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::Closing
    }

    pub fn add_request(&mut self, req: Request) {
        self.requests.push_back(req);
    }

    pub fn remove_request(&mut self) -> Option<Request> {
        self.requests.pop_front()
    }

    pub fn add_response(&mut self, res: Response) {
        self.responses.push_back(res);
    }

    pub fn remove_response(&mut self) -> Option<Response> {
        self.responses.pop_front()
    }

    /// Handles readiness on the socket or on one of this session's CGI
    /// pipes. Loops until no step makes progress, since registrations are
    /// edge-triggered.
    pub fn on_event(&mut self, io: &mut Io<'_>) {
        loop {
            let read = self.read();
            let parsed = self.pump(io);
            let serviced = self.service_cgi(io, Instant::now(), false);
            let written = self.write();
            if self.is_closing() || !(read || parsed || serviced || written) {
                break;
            }
        }
        self.check_if_failed();
        self.update_interest(io.registry, io.token);
    }

    fn read(&mut self) -> bool {
        if self.peer_closed || self.should_close || self.failed {
            return false;
        }
        match self.reader.fill_from(&mut self.stream, READ_CAP) {
            Ok(ReadOutcome::Drained(n)) | Ok(ReadOutcome::Full(n)) => {
                if n > 0 {
                    self.last_activity = Instant::now();
                }
                n > 0
            }
            Ok(ReadOutcome::Closed(n)) => {
                tracing::debug!(peer = %self.peer, "peer closed its side");
                self.peer_closed = true;
                n > 0
            }
            Err(e) => {
                tracing::debug!(peer = %self.peer, error = %e, "read failed");
                self.failed = true;
                false
            }
        }
    }

    /// Parses buffered bytes into requests and queues a response for each.
    fn pump(&mut self, io: &mut Io<'_>) -> bool {
        let mut dispatched = false;
        while !self.should_close && self.responses.len() < MAX_IN_FLIGHT {
            match self.parser.advance(&mut self.reader, &mut self.current) {
                Progress::NeedMore => break,
                Progress::HeadComplete => self.route_current(io.config),
                Progress::Complete | Progress::Failed => {
                    self.dispatch(io);
                    dispatched = true;
                }
            }
        }
        dispatched
    }

    /// Matches the finished header block against the routing table and
    /// applies the location's body limit before any body byte is stored.
    fn route_current(&mut self, config: &Config) {
        let route = config.route(&self.candidates, self.current.host(), &self.current.path);
        self.current.route = Some(route);
        let location = config.location(route);
        match location.resolve(&self.current.path) {
            Ok(path) => self.current.resolved_path = path,
            Err(status) => self.current.set_status(status),
        }
        self.parser.limit_body(&mut self.current, location.max_body_size);
        self.state = ConnectionState::ReadingBody;
    }

    fn dispatch(&mut self, io: &mut Io<'_>) {
        let req = std::mem::take(&mut self.current);
        self.parser.reset();
        self.nb_requests += 1;
        self.state = ConnectionState::Routed;

        let config = io.config;
        let route = req
            .route
            .unwrap_or_else(|| config.route(&self.candidates, req.host(), "/"));
        let ctx = Context {
            config,
            server: config.server(route),
            location: config.location(route),
            peer: self.peer,
        };
        let mut res = handlers::handle(&req, &ctx);

        if req.is_failed() || !req.wants_keep_alive() || self.nb_requests >= config.max_requests {
            res.force_close();
        }
        if res.closes_connection() {
            self.should_close = true;
        }
        res.set_head_only(req.method == Method::Head);

        tracing::info!(
            peer = %self.peer,
            method = %req.method,
            path = %req.path,
            status = res.status().as_u16(),
            "request"
        );

        if let Some(process) = res.cgi_mut() {
            let owner = io.token;
            let tokens = &mut *io.tokens;
            if let Err(e) = process.register(io.registry, || tokens.bind_pipe(owner)) {
                tracing::error!(peer = %self.peer, error = %e, "cannot watch cgi pipes");
                release_cgi(&mut res, io);
                let close = res.closes_connection();
                res = handlers::error_response(StatusCode::BadGateway, ctx.location);
                if close {
                    res.force_close();
                }
                res.set_head_only(req.method == Method::Head);
            }
        }

        let close = res.closes_connection();
        res.finalize(Persistence {
            close,
            version: req.version,
            timeout_secs: config.timeouts.client.as_secs(),
            remaining: config.max_requests.saturating_sub(self.nb_requests),
        });
        self.add_request(req);
        self.add_response(res);
        self.state = ConnectionState::Responding;
    }

    /// Advances every outstanding CGI; finished or failed ones become
    /// formed responses. Expired ones are killed, and so is every one when
    /// `abandon` is set.
    fn service_cgi(&mut self, io: &mut Io<'_>, now: Instant, abandon: bool) -> bool {
        let mut progressed = false;
        for (req, res) in self.requests.iter().zip(self.responses.iter_mut()) {
            let Some(process) = res.cgi_mut() else {
                continue;
            };
            let outcome = if abandon || now >= process.deadline() {
                tracing::warn!(pid = process.pid(), "cgi timed out, killing");
                process.kill(io.registry);
                Some(Err(CgiError::Timeout))
            } else {
                match process.pump(io.registry) {
                    Err(e) => {
                        process.kill(io.registry);
                        Some(Err(e))
                    }
                    Ok(()) if process.is_finished() => Some(Ok(())),
                    Ok(()) => None,
                }
            };
            let Some(outcome) = outcome else {
                continue;
            };

            for token in process.tokens() {
                io.tokens.release(*token);
            }
            let pid = process.pid();
            let result = match (outcome, res.take_cgi()) {
                (Ok(()), Some(process)) => process.into_response(),
                (Err(e), _) => Err(e),
                (Ok(()), None) => continue,
            };
            let produced = result.unwrap_or_else(|e| {
                tracing::warn!(pid, error = %e, "cgi failed");
                let route = req.route.unwrap_or_else(|| io.config.route(&self.candidates, req.host(), "/"));
                handlers::error_response(StatusCode::BadGateway, io.config.location(route))
            });
            res.complete_cgi(produced);
            progressed = true;
        }
        progressed
    }

    /// Flushes formed responses in queue order until the socket would block.
    fn write(&mut self) -> bool {
        let mut progressed = false;
        loop {
            if self.failed || self.is_closing() {
                return progressed;
            }
            if self.out_pos == self.out.len() {
                self.out.clear();
                self.out_pos = 0;
                let Some(front) = self.responses.front_mut() else {
                    return progressed;
                };
                if !front.is_formed() {
                    return progressed;
                }
                match front.fill(&mut self.out) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.finish_response();
                        progressed = true;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %self.peer, error = %e, "response body failed mid-stream");
                        self.failed = true;
                    }
                }
                continue;
            }
            match self.stream.write(&self.out[self.out_pos..]) {
                Ok(0) => self.failed = true,
                Ok(n) => {
                    self.out_pos += n;
                    self.last_activity = Instant::now();
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return progressed,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!(peer = %self.peer, error = %e, "write failed");
                    self.failed = true;
                }
            }
        }
    }

    fn finish_response(&mut self) {
        let res = self.remove_response();
        self.remove_request();
        if res.is_some_and(|r| r.closes_connection()) {
            tracing::debug!(peer = %self.peer, served = self.nb_requests, "closing after response");
            self.state = ConnectionState::Closing;
        }
    }

    /// Moves the session to `Closing` after an I/O failure, or once the peer
    /// has hung up and everything owed to it has been sent.
    pub fn check_if_failed(&mut self) {
        if self.is_closing() {
            return;
        }
        let drained = self.responses.is_empty() && self.out_pos == self.out.len();
        if self.failed || (self.peer_closed && drained) {
            self.state = ConnectionState::Closing;
            return;
        }
        self.state = if !self.responses.is_empty() {
            ConnectionState::Responding
        } else if self.current.flags().headers {
            ConnectionState::ReadingBody
        } else if self.current.is_started() {
            ConnectionState::ReadingHeaders
        } else {
            ConnectionState::AwaitingRequest
        };
    }

    /// Applies the idle and lifetime limits and services CGI deadlines.
    pub fn check_timeouts(&mut self, io: &mut Io<'_>, now: Instant) {
        if self.is_closing() {
            return;
        }
        if self.responses.iter().any(Response::is_cgi_pending) {
            self.on_event(io);
        }

        let timeouts = io.config.timeouts;
        let cgi_running = self.responses.iter().any(Response::is_cgi_pending);
        let idle = !cgi_running && now >= self.last_activity + timeouts.client;
        let expired = now >= self.created + timeouts.max;
        if !(idle || expired) {
            return;
        }

        if expired && cgi_running {
            tracing::info!(peer = %self.peer, "connection lifetime reached with cgi pending");
            self.should_close = true;
            for res in self.responses.iter_mut().filter(|r| r.is_cgi_pending()) {
                res.force_close();
            }
            self.service_cgi(io, now, true);
            self.on_event(io);
            self.state = ConnectionState::Closing;
            return;
        }

        let awaiting_bytes = self.responses.is_empty();
        let partial = self.current.is_started() || !self.reader.is_empty();
        if awaiting_bytes && partial && !self.timed_out {
            tracing::info!(peer = %self.peer, "request timed out");
            self.timed_out = true;
            self.current.set_status(StatusCode::RequestTimeout);
            self.dispatch(io);
            self.last_activity = now;
            self.on_event(io);
        } else {
            tracing::debug!(peer = %self.peer, "closing idle connection");
            self.state = ConnectionState::Closing;
        }
    }

    /// Earliest instant at which this session needs attention without I/O.
    pub fn next_deadline(&self, config: &Config) -> Instant {
        let timeouts = config.timeouts;
        let mut deadline = self.created + timeouts.max;
        if !self.responses.iter().any(Response::is_cgi_pending) {
            deadline = deadline.min(self.last_activity + timeouts.client);
        }
        for res in &self.responses {
            if let Some(process) = res.cgi() {
                deadline = deadline.min(process.deadline());
                if process.awaiting_exit() {
                    deadline = deadline.min(Instant::now() + REAP_INTERVAL);
                }
            }
        }
        deadline
    }

    fn update_interest(&mut self, registry: &Registry, token: Token) {
        if self.is_closing() {
            return;
        }
        let pending = self.out_pos < self.out.len()
            || self.responses.front().is_some_and(Response::is_formed);
        let wanted = if pending {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if wanted == self.interest {
            return;
        }
        match registry.reregister(&mut self.stream, token, wanted) {
            Ok(()) => self.interest = wanted,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "reregister failed");
                self.state = ConnectionState::Closing;
            }
        }
    }

    /// Releases the socket registration and every outstanding CGI. The
    /// socket itself closes when the connection is dropped.
    pub fn shutdown(&mut self, registry: &Registry, tokens: &mut TokenTable) {
        let _ = registry.deregister(&mut self.stream);
        for res in self.responses.iter_mut() {
            if let Some(process) = res.cgi_mut() {
                process.kill(registry);
                for token in process.tokens() {
                    tokens.release(*token);
                }
            }
        }
        self.responses.clear();
        self.requests.clear();
        self.state = ConnectionState::Closing;
    }
}

fn release_cgi(res: &mut Response, io: &mut Io<'_>) {
    if let Some(mut process) = res.take_cgi() {
        process.kill(io.registry);
        for token in process.tokens() {
            io.tokens.release(*token);
        }
    }
}
