use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;

use crate::http::request::Method;
use crate::http::status::StatusCode;

/// Methods that have a handler. Locations may only allow these.
pub const HANDLED_METHODS: [Method; 6] = [
    Method::Get,
    Method::Head,
    Method::Post,
    Method::Put,
    Method::Delete,
    Method::Options,
];

#[derive(Debug, Clone)]
pub struct Redirect {
    pub status: StatusCode,
    pub url: String,
}

/// Basic authentication rule. Credentials are loaded from the user file
/// (`user:password` per line) when the configuration is read.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub realm: String,
    pub user_file: PathBuf,
    pub credentials: HashSet<String>,
}

impl BasicAuth {
    /// Checks an `Authorization` header value against the loaded credentials.
    pub fn accepts(&self, authorization: Option<&str>) -> bool {
        authorization
            .and_then(decode_basic)
            .is_some_and(|pair| self.credentials.contains(&pair))
    }

    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\", charset=\"UTF-8\"", self.realm)
    }
}

/// Decodes `Basic <base64>` into its `user:password` pair.
fn decode_basic(value: &str) -> Option<String> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    String::from_utf8(decoded).ok()
}

/// User name carried by a Basic `Authorization` value.
pub fn basic_user(authorization: &str) -> Option<String> {
    let pair = decode_basic(authorization)?;
    pair.split_once(':').map(|(user, _)| user.to_string())
}

#[derive(Debug, Clone)]
pub struct Location {
    /// Path prefix this location applies to; `/` for a server's base.
    pub path: String,
    pub root: PathBuf,
    pub alias: Option<PathBuf>,
    pub autoindex: bool,
    pub index: Vec<String>,
    pub methods: Vec<Method>,
    pub max_body_size: usize,
    pub redirect: Option<Redirect>,
    pub auth: Option<BasicAuth>,
    /// Extension (with leading dot) to interpreter. `None` runs the script
    /// itself.
    pub cgi: BTreeMap<String, Option<PathBuf>>,
    pub error_pages: HashMap<u16, PathBuf>,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            root: PathBuf::from("./"),
            alias: None,
            autoindex: false,
            index: vec!["index.html".to_string()],
            methods: HANDLED_METHODS.to_vec(),
            max_body_size: 1024 * 1024,
            redirect: None,
            auth: None,
            cgi: BTreeMap::new(),
            error_pages: HashMap::new(),
        }
    }
}

impl Location {
    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Value for an `Allow` header.
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// CGI mapping whose extension ends the given path. The longest matching
    /// extension wins.
    pub fn cgi_for(&self, path: &str) -> Option<(&str, Option<&PathBuf>)> {
        self.cgi
            .iter()
            .filter(|(ext, _)| path.ends_with(ext.as_str()))
            .max_by_key(|(ext, _)| ext.len())
            .map(|(ext, interpreter)| (ext.as_str(), interpreter.as_ref()))
    }
}

/// One virtual host.
#[derive(Debug, Clone)]
pub struct ServerBlock {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub server_names: Vec<String>,
    pub base: Location,
    pub locations: Vec<Location>,
}

impl ServerBlock {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Idle time allowed while waiting for client bytes.
    pub client: Duration,
    /// Time a CGI program may run.
    pub cgi: Duration,
    /// Absolute lifetime of a connection.
    pub max: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            client: Duration::from_secs(30),
            cgi: Duration::from_secs(10),
            max: Duration::from_secs(300),
        }
    }
}

/// The routing table. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerBlock>,
    pub max_requests: usize,
    pub timeouts: Timeouts,
}

/// Result of routing a request: the server block index and, when a
/// sub-location matched, its index. `None` means the base location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub server: usize,
    pub location: Option<usize>,
}
