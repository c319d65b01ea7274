use std::fs::File;
use std::io::{self, Read};
use std::time::SystemTime;

use crate::handlers::cgi::CgiProcess;
use crate::http::headers::HeaderName;
use crate::http::request::Version;
use crate::http::status::StatusCode;

pub const SERVER_SOFTWARE: &str = "webserv/0.1";

/// Bytes read from a file per chunk when streaming.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Where the response body comes from.
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// Regular file streamed in [`CHUNK_SIZE`] pieces.
    File { file: File, len: u64 },
    /// CGI still running; the response is not formed yet.
    Cgi(Box<CgiProcess>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Head,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length,
    Chunked,
}

/// Connection policy applied when a response is finalized.
#[derive(Debug, Clone, Copy)]
pub struct Persistence {
    pub close: bool,
    pub version: Version,
    pub timeout_secs: u64,
    /// Requests this connection may still serve after the current one.
    pub remaining: usize,
}

#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(HeaderName, String)>,
    body: Body,
    head_only: bool,
    framing: Framing,
    formed: bool,
    close: bool,
    stage: Stage,
    file_left: u64,
    persistence: Option<Persistence>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Empty,
            head_only: false,
            framing: Framing::Length,
            formed: false,
            close: false,
            stage: Stage::Head,
            file_left: 0,
            persistence: None,
        }
    }

    /// Response carrying an in-memory body.
    pub fn with_bytes(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        let mut res = Self::new(status);
        res.set_bytes(content_type, body);
        res
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Replaces every value of `name` with `value`.
    pub fn set_header(&mut self, name: HeaderName, value: impl Into<String>) {
        self.headers.retain(|(n, _)| *n != name);
        self.headers.push((name, value.into()));
    }

    /// Appends another value of `name`, keeping existing ones.
    pub fn add_header(&mut self, name: HeaderName, value: impl Into<String>) {
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: HeaderName) {
        self.headers.retain(|(n, _)| *n != name);
    }

    pub fn set_bytes(&mut self, content_type: &str, body: Vec<u8>) {
        if !content_type.is_empty() {
            self.set_header(HeaderName::ContentType, content_type);
        }
        self.body = Body::Bytes(body);
    }

    pub fn set_file(&mut self, content_type: &str, file: File, len: u64) {
        self.set_header(HeaderName::ContentType, content_type);
        self.body = Body::File { file, len };
    }

    pub fn set_cgi(&mut self, process: CgiProcess) {
        self.body = Body::Cgi(Box::new(process));
    }

    /// Body bytes for in-memory bodies; empty for everything else.
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Bytes(b) => b,
            _ => &[],
        }
    }

    pub fn cgi(&self) -> Option<&CgiProcess> {
        match &self.body {
            Body::Cgi(process) => Some(process.as_ref()),
            _ => None,
        }
    }

    pub fn cgi_mut(&mut self) -> Option<&mut CgiProcess> {
        match &mut self.body {
            Body::Cgi(process) => Some(process.as_mut()),
            _ => None,
        }
    }

    /// Takes the CGI process out of the body slot, leaving it empty.
    pub fn take_cgi(&mut self) -> Option<CgiProcess> {
        match std::mem::replace(&mut self.body, Body::Empty) {
            Body::Cgi(process) => Some(*process),
            other => {
                self.body = other;
                None
            }
        }
    }

    pub fn is_cgi_pending(&self) -> bool {
        matches!(self.body, Body::Cgi(_))
    }

    /// Suppresses the body on the wire while keeping the length headers a
    /// GET would have produced.
    pub fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    pub fn is_formed(&self) -> bool {
        self.formed
    }

    pub fn closes_connection(&self) -> bool {
        self.close
    }

    /// Makes this the last response sent on its connection.
    pub fn force_close(&mut self) {
        self.close = true;
    }

    /// Takes over the status, headers and body a finished CGI produced, then
    /// finalizes with the policy recorded when the request was dispatched.
    pub fn complete_cgi(&mut self, outcome: Response) {
        self.status = outcome.status;
        self.headers = outcome.headers;
        self.body = outcome.body;
        if let Some(persistence) = self.persistence {
            self.finalize(persistence);
        }
    }

    /// Completes the header block and marks the response ready to send.
    /// While a CGI is still running the policy is only recorded.
    pub fn finalize(&mut self, persistence: Persistence) {
        self.persistence = Some(persistence);
        if self.is_cgi_pending() || self.formed {
            return;
        }
        self.close = self.close || persistence.close;

        self.set_header(HeaderName::Server, SERVER_SOFTWARE);
        self.set_header(HeaderName::Date, http_date(SystemTime::now()));
        if self.close {
            self.set_header(HeaderName::Connection, "close");
            self.remove_header(HeaderName::KeepAlive);
        } else {
            self.set_header(HeaderName::Connection, "keep-alive");
            self.set_header(
                HeaderName::KeepAlive,
                format!("timeout={}, max={}", persistence.timeout_secs, persistence.remaining),
            );
        }

        self.remove_header(HeaderName::TransferEncoding);
        if self.status.forbids_body() {
            self.remove_header(HeaderName::ContentLength);
            self.body = Body::Empty;
            self.formed = true;
            return;
        }
        let (len, streamed) = match &self.body {
            Body::Empty => (0, false),
            Body::Bytes(b) => (b.len() as u64, false),
            Body::File { len, .. } => (*len, true),
            Body::Cgi(_) => unreachable!("pending CGI responses are never finalized"),
        };
        if streamed && !self.head_only && persistence.version == Version::Http11 {
            self.framing = Framing::Chunked;
            self.remove_header(HeaderName::ContentLength);
            self.set_header(HeaderName::TransferEncoding, "chunked");
        } else {
            self.framing = Framing::Length;
            self.set_header(HeaderName::ContentLength, len.to_string());
        }
        self.file_left = if streamed { len } else { 0 };
        self.formed = true;
    }

    /// Serialized status line and header block.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut buf = format!("HTTP/1.1 {}\r\n", self.status).into_bytes();
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Appends the next piece of wire data to `out`. Returns `false` once the
    /// response has been fully produced.
    pub fn fill(&mut self, out: &mut Vec<u8>) -> io::Result<bool> {
        match self.stage {
            Stage::Head => {
                out.extend_from_slice(&self.head_bytes());
                self.stage = if self.head_only || matches!(self.body, Body::Empty) {
                    Stage::Done
                } else {
                    Stage::Body
                };
                Ok(true)
            }
            Stage::Body => {
                match &mut self.body {
                    Body::Bytes(bytes) => {
                        out.append(bytes);
                        self.stage = Stage::Done;
                    }
                    Body::File { file, .. } => {
                        let want = CHUNK_SIZE.min(self.file_left as usize);
                        let mut chunk = vec![0u8; want];
                        let n = if want == 0 { 0 } else { read_some(file, &mut chunk)? };
                        if n == 0 {
                            if self.file_left != 0 {
                                return Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "file shrank while streaming",
                                ));
                            }
                            if self.framing == Framing::Chunked {
                                out.extend_from_slice(b"0\r\n\r\n");
                            }
                            self.stage = Stage::Done;
                        } else {
                            self.file_left -= n as u64;
                            if self.framing == Framing::Chunked {
                                out.extend_from_slice(format!("{:x}\r\n", n).as_bytes());
                                out.extend_from_slice(&chunk[..n]);
                                out.extend_from_slice(b"\r\n");
                            } else {
                                out.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                    Body::Empty | Body::Cgi(_) => self.stage = Stage::Done,
                }
                Ok(true)
            }
            Stage::Done => Ok(false),
        }
    }
}

fn read_some(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match file.read(buf) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(time: SystemTime) -> String {
    let utc: chrono::DateTime<chrono::Utc> = time.into();
    utc.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
