//! Incremental request parser.
//!
//! The parser is driven every time new bytes land in the connection's
//! [`ByteReader`]. It only ever removes complete lines (start line, headers,
//! chunk sizes) or body bytes from the front of the reservoir, so a call
//! always resumes exactly where the previous one stopped.

use crate::http::headers::{HeaderError, HeaderName};
use crate::http::request::{Method, Request, Version};
use crate::http::status::StatusCode;
use crate::network::reader::ByteReader;

/// Longest start line or header line accepted.
pub const MAX_LINE: usize = 8192;
/// Longest request target accepted.
pub const MAX_TARGET: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Waiting for more bytes.
    NeedMore,
    /// Start line and headers are in; the caller should route the request
    /// and call [`RequestParser::limit_body`] before advancing again.
    HeadComplete,
    /// The whole message is in.
    Complete,
    /// Parsing stopped; the request carries the error status.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Unknown,
    Empty,
    Length(usize),
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Debug)]
pub struct RequestParser {
    framing: Framing,
    limit: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            framing: Framing::Unknown,
            limit: usize::MAX,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consumes as much of `reader` as the current state allows.
    pub fn advance(&mut self, reader: &mut ByteReader, req: &mut Request) -> Progress {
        if req.is_failed() {
            return Progress::Failed;
        }

        if !req.flags().start_line {
            loop {
                let Some(line) = reader.take_line() else {
                    return self.line_pending(reader, req, StatusCode::UriTooLong);
                };
                // Stray CRLFs between pipelined messages are tolerated.
                if line.is_empty() {
                    continue;
                }
                if let Err(status) = parse_start_line(&line, req) {
                    tracing::debug!(status = status.as_u16(), "rejected request line");
                    req.set_status(status);
                    return Progress::Failed;
                }
                req.flags_mut().start_line = true;
                break;
            }
        }

        if !req.flags().headers {
            loop {
                let Some(line) = reader.take_line() else {
                    return self.line_pending(reader, req, StatusCode::BadRequest);
                };
                if line.is_empty() {
                    req.flags_mut().headers = true;
                    if let Err(status) = self.select_framing(req) {
                        req.set_status(status);
                        return Progress::Failed;
                    }
                    return Progress::HeadComplete;
                }
                let Ok(text) = std::str::from_utf8(&line) else {
                    req.set_status(StatusCode::BadRequest);
                    return Progress::Failed;
                };
                if let Err(err) = req.headers.parse_line(text) {
                    match err {
                        HeaderError::Unknown => tracing::debug!(header = text, "unregistered header"),
                        HeaderError::Malformed => tracing::debug!(header = text, "malformed header"),
                        HeaderError::Conflict => tracing::debug!(header = text, "conflicting header"),
                    }
                    req.set_status(StatusCode::BadRequest);
                    return Progress::Failed;
                }
            }
        }

        if req.flags().body {
            return Progress::Complete;
        }
        self.read_body(reader, req)
    }

    /// Applies the matched location's body limit. Declared lengths above the
    /// limit fail before a single body byte is stored.
    pub fn limit_body(&mut self, req: &mut Request, max: usize) -> bool {
        self.limit = max;
        if let Framing::Length(n) = self.framing {
            if n > max {
                req.set_status(StatusCode::PayloadTooLarge);
                return false;
            }
        }
        true
    }

    fn line_pending(&self, reader: &ByteReader, req: &mut Request, status: StatusCode) -> Progress {
        if reader.len() > MAX_LINE {
            req.set_status(status);
            return Progress::Failed;
        }
        Progress::NeedMore
    }

    fn select_framing(&mut self, req: &Request) -> Result<(), StatusCode> {
        let length = req.header(HeaderName::ContentLength);
        let encoding = req.header(HeaderName::TransferEncoding);

        self.framing = match (length, encoding) {
            (Some(_), Some(_)) => return Err(StatusCode::BadRequest),
            (None, Some(te)) => {
                if !te.trim().eq_ignore_ascii_case("chunked") {
                    return Err(StatusCode::NotImplemented);
                }
                Framing::Chunked(ChunkState::Size)
            }
            (Some(cl), None) => {
                if cl.is_empty() || !cl.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(StatusCode::BadRequest);
                }
                match cl.parse::<usize>() {
                    Ok(0) => Framing::Empty,
                    Ok(n) => Framing::Length(n),
                    Err(_) => return Err(StatusCode::PayloadTooLarge),
                }
            }
            (None, None) => {
                if matches!(req.method, Method::Post | Method::Put) {
                    return Err(StatusCode::LengthRequired);
                }
                Framing::Empty
            }
        };
        Ok(())
    }

    fn read_body(&mut self, reader: &mut ByteReader, req: &mut Request) -> Progress {
        loop {
            match self.framing {
                Framing::Unknown | Framing::Empty => {
                    req.flags_mut().body = true;
                    return Progress::Complete;
                }
                Framing::Length(remaining) => {
                    let bytes = reader.take_bytes(remaining);
                    req.body.extend_from_slice(&bytes);
                    let left = remaining - bytes.len();
                    if left == 0 {
                        req.flags_mut().body = true;
                        return Progress::Complete;
                    }
                    self.framing = Framing::Length(left);
                    return Progress::NeedMore;
                }
                Framing::Chunked(state) => match self.step_chunked(state, reader, req) {
                    Some(progress) => return progress,
                    None => continue,
                },
            }
        }
    }

    /// One transition of the chunked decoder. `None` means the state moved
    /// and decoding should continue.
    fn step_chunked(
        &mut self,
        state: ChunkState,
        reader: &mut ByteReader,
        req: &mut Request,
    ) -> Option<Progress> {
        match state {
            ChunkState::Size => {
                let Some(line) = reader.take_line() else {
                    return Some(self.line_pending(reader, req, StatusCode::BadRequest));
                };
                let size = match parse_chunk_size(&line) {
                    Some(size) => size,
                    None => {
                        req.set_status(StatusCode::BadRequest);
                        return Some(Progress::Failed);
                    }
                };
                if req.body.len().saturating_add(size) > self.limit {
                    req.set_status(StatusCode::PayloadTooLarge);
                    return Some(Progress::Failed);
                }
                self.framing = Framing::Chunked(if size == 0 {
                    ChunkState::Trailer
                } else {
                    ChunkState::Data(size)
                });
                None
            }
            ChunkState::Data(remaining) => {
                let bytes = reader.take_bytes(remaining);
                if bytes.is_empty() {
                    return Some(Progress::NeedMore);
                }
                req.body.extend_from_slice(&bytes);
                let left = remaining - bytes.len();
                self.framing = Framing::Chunked(if left == 0 {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data(left)
                });
                None
            }
            ChunkState::DataEnd => {
                let Some(line) = reader.take_line() else {
                    return Some(self.line_pending(reader, req, StatusCode::BadRequest));
                };
                if !line.is_empty() {
                    req.set_status(StatusCode::BadRequest);
                    return Some(Progress::Failed);
                }
                self.framing = Framing::Chunked(ChunkState::Size);
                None
            }
            ChunkState::Trailer => {
                let Some(line) = reader.take_line() else {
                    return Some(self.line_pending(reader, req, StatusCode::BadRequest));
                };
                if line.is_empty() {
                    req.flags_mut().body = true;
                    return Some(Progress::Complete);
                }
                // Trailer fields are read and dropped.
                None
            }
        }
    }
}

fn parse_start_line(line: &[u8], req: &mut Request) -> Result<(), StatusCode> {
    let line = std::str::from_utf8(line).map_err(|_| StatusCode::BadRequest)?;
    let mut parts = line.split(' ').filter(|p| !p.is_empty());

    let method = parts.next().ok_or(StatusCode::BadRequest)?;
    req.method = Method::from_token(method).ok_or(StatusCode::NotImplemented)?;

    let target = parts.next().ok_or(StatusCode::BadRequest)?;
    if !target.starts_with('/') {
        return Err(StatusCode::BadRequest);
    }
    if target.len() > MAX_TARGET {
        return Err(StatusCode::UriTooLong);
    }

    let protocol = parts.next().ok_or(StatusCode::BadRequest)?;
    if parts.next().is_some() {
        return Err(StatusCode::BadRequest);
    }
    req.version = parse_version(protocol)?;

    req.target = target.to_string();
    match target.split_once('?') {
        Some((path, query)) => {
            req.path = path.to_string();
            req.query = query.to_string();
        }
        None => {
            req.path = target.to_string();
            req.query.clear();
        }
    }
    Ok(())
}

fn parse_version(token: &str) -> Result<Version, StatusCode> {
    match token {
        "HTTP/1.1" => Ok(Version::Http11),
        "HTTP/1.0" => Ok(Version::Http10),
        _ => {
            let shaped = token
                .strip_prefix("HTTP/")
                .map(|v| {
                    let b = v.as_bytes();
                    b.len() == 3 && b[0].is_ascii_digit() && b[1] == b'.' && b[2].is_ascii_digit()
                })
                .unwrap_or(false);
            if shaped {
                Err(StatusCode::HttpVersionNotSupported)
            } else {
                Err(StatusCode::BadRequest)
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let size = text.split(';').next()?.trim();
    if size.is_empty() || size.len() > 16 {
        return None;
    }
    usize::from_str_radix(size, 16).ok()
}
