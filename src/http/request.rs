use std::path::PathBuf;

use crate::config::models::Route;
use crate::http::headers::{HeaderMap, HeaderName};
use crate::http::status::StatusCode;

/// Request methods the parser recognizes. Anything outside this set is
/// answered with 501 before the headers are even looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Connect,
    Trace,
    Patch,
}

impl Method {
    /// Parses a method token. Matching is case-sensitive.
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            "CONNECT" => Some(Method::Connect),
            "TRACE" => Some(Method::Trace),
            "PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Which parts of the message have been consumed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseFlags {
    pub start_line: bool,
    pub headers: bool,
    pub body: bool,
}

/// One HTTP request, built up incrementally by the parser and then
/// annotated by routing.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as received (path plus optional query).
    pub target: String,
    pub path: String,
    pub query: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Filesystem path the target maps to under the matched location.
    pub resolved_path: PathBuf,
    pub route: Option<Route>,
    status: StatusCode,
    flags: ParseFlags,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Get,
            target: String::new(),
            path: String::new(),
            query: String::new(),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Vec::new(),
            resolved_path: PathBuf::new(),
            route: None,
            status: StatusCode::Ok,
            flags: ParseFlags::default(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Records an outcome. Once the request carries an error status a
    /// non-error status can no longer replace it.
    pub fn set_status(&mut self, status: StatusCode) {
        if self.status.is_error() && !status.is_error() {
            return;
        }
        self.status = status;
    }

    pub fn is_failed(&self) -> bool {
        self.status.is_error()
    }

    pub fn flags(&self) -> ParseFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut ParseFlags {
        &mut self.flags
    }

    /// True once any byte of this request has been consumed.
    pub fn is_started(&self) -> bool {
        self.flags.start_line
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name)
    }

    /// Host header without any port suffix.
    pub fn host(&self) -> Option<&str> {
        let host = self.header(HeaderName::Host)?;
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        };
        Some(host)
    }

    /// Connection persistence the client asked for. HTTP/1.1 defaults to
    /// keep-alive, HTTP/1.0 to close.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.header(HeaderName::Connection).map(|v| v.to_ascii_lowercase());
        match (self.version, connection.as_deref()) {
            (_, Some(v)) if v.split(',').any(|t| t.trim() == "close") => false,
            (Version::Http10, Some(v)) => v.split(',').any(|t| t.trim() == "keep-alive"),
            (Version::Http10, None) => false,
            (Version::Http11, _) => true,
        }
    }

    pub fn content_type(&self) -> &str {
        self.header(HeaderName::ContentType).unwrap_or("")
    }
}
