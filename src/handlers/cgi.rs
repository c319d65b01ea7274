//! CGI/1.1 executor.
//!
//! A script runs as a child process whose stdin and stdout are non-blocking
//! pipes registered with the server's poller, so a slow script never stalls
//! other connections. The request body is fed to stdin as the pipe accepts
//! it, stdout is collected until EOF, and the child is reaped before its
//! output is turned into a [`Response`].

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Instant;

use mio::unix::pipe::{Receiver, Sender};
use mio::{Interest, Registry, Token};

use crate::error::CgiError;
use crate::handlers::Context;
use crate::http::headers::HeaderName;
use crate::http::request::Request;
use crate::http::response::{Response, SERVER_SOFTWARE};
use crate::http::status::StatusCode;
use crate::network::reader::{ByteReader, ReadOutcome};

/// Largest output a script may produce.
pub const MAX_OUTPUT: usize = 16 * 1024 * 1024;

/// Everything needed to start one script.
#[derive(Debug)]
pub struct CgiJob {
    pub script: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub env: Vec<(&'static str, String)>,
    pub input: Vec<u8>,
}

impl CgiJob {
    /// Prepares a run of `script` for `req`. The script must exist, and must
    /// be executable when no interpreter is configured for it.
    pub fn new(
        req: &Request,
        ctx: &Context<'_>,
        script: &Path,
        interpreter: Option<&PathBuf>,
    ) -> Result<Self, StatusCode> {
        let script = script.canonicalize().map_err(|_| StatusCode::NotFound)?;
        let meta = script.metadata().map_err(|_| StatusCode::NotFound)?;
        if !meta.is_file() {
            return Err(StatusCode::NotFound);
        }
        if interpreter.is_none() && meta.permissions().mode() & 0o111 == 0 {
            return Err(StatusCode::Forbidden);
        }
        Ok(Self {
            env: environment(req, ctx, &script),
            script,
            interpreter: interpreter.cloned(),
            input: req.body.clone(),
        })
    }
}

fn environment(req: &Request, ctx: &Context<'_>, script: &Path) -> Vec<(&'static str, String)> {
    let script = script.to_string_lossy().into_owned();
    let server_name = ctx
        .server
        .server_names
        .first()
        .cloned()
        .unwrap_or_else(|| ctx.server.host.clone());
    let authorization = req.header(HeaderName::Authorization);
    let remote_user = authorization.and_then(crate::config::models::basic_user).unwrap_or_default();
    let auth_type = if ctx.location.auth.is_some() { "Basic" } else { "" };

    vec![
        ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string()),
        ("SERVER_PROTOCOL", "HTTP/1.1".to_string()),
        ("SERVER_NAME", server_name),
        ("SERVER_PORT", ctx.server.port.to_string()),
        ("REQUEST_METHOD", req.method.as_str().to_string()),
        ("QUERY_STRING", req.query.clone()),
        ("CONTENT_LENGTH", req.body.len().to_string()),
        ("CONTENT_TYPE", req.content_type().to_string()),
        ("SCRIPT_NAME", req.path.clone()),
        ("SCRIPT_FILENAME", script.clone()),
        ("PATH_INFO", req.path.clone()),
        ("PATH_TRANSLATED", script),
        ("REMOTE_ADDR", ctx.peer.ip().to_string()),
        ("REMOTE_HOST", ctx.peer.ip().to_string()),
        ("REMOTE_USER", remote_user),
        ("REMOTE_IDENT", String::new()),
        ("AUTH_TYPE", auth_type.to_string()),
        ("REDIRECT_STATUS", "200".to_string()),
        ("PATH", std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string())),
    ]
}

/// A running script and its pipe endpoints.
#[derive(Debug)]
pub struct CgiProcess {
    child: Child,
    stdin: Option<Sender>,
    stdout: Option<Receiver>,
    input: Vec<u8>,
    written: usize,
    output: ByteReader,
    deadline: Instant,
    tokens: Vec<Token>,
    exit: Option<ExitStatus>,
}

impl CgiProcess {
    pub fn spawn(job: CgiJob, deadline: Instant) -> Result<Self, CgiError> {
        let mut command = match &job.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&job.script);
                cmd
            }
            None => Command::new(&job.script),
        };
        if let Some(dir) = job.script.parent() {
            command.current_dir(dir);
        }

        let child = command
            .env_clear()
            .envs(job.env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| CgiError::Spawn {
                path: job.script.clone(),
                source,
            })?;
        tracing::debug!(pid = child.id(), script = %job.script.display(), "cgi started");

        // From here on, dropping `process` kills and reaps the child.
        let mut process = Self {
            child,
            stdin: None,
            stdout: None,
            input: job.input,
            written: 0,
            output: ByteReader::new(),
            deadline,
            tokens: Vec::new(),
            exit: None,
        };

        let stdout = process
            .child
            .stdout
            .take()
            .map(Receiver::from)
            .ok_or_else(|| CgiError::Pipe(io::Error::other("stdout not captured")))?;
        stdout.set_nonblocking(true).map_err(CgiError::Pipe)?;
        process.stdout = Some(stdout);

        let stdin = process.child.stdin.take().map(Sender::from);
        if let Some(stdin) = stdin {
            if !process.input.is_empty() {
                stdin.set_nonblocking(true).map_err(CgiError::Pipe)?;
                process.stdin = Some(stdin);
            }
            // An empty body closes stdin right away.
        }
        Ok(process)
    }

    /// Registers the pipe ends with the poller, taking a fresh token for
    /// each from `next_token`.
    pub fn register(
        &mut self,
        registry: &Registry,
        mut next_token: impl FnMut() -> Token,
    ) -> io::Result<()> {
        if let Some(stdout) = self.stdout.as_mut() {
            let token = next_token();
            self.tokens.push(token);
            registry.register(stdout, token, Interest::READABLE)?;
        }
        if let Some(stdin) = self.stdin.as_mut() {
            let token = next_token();
            self.tokens.push(token);
            registry.register(stdin, token, Interest::WRITABLE)?;
        }
        Ok(())
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Moves as many bytes as the pipes allow in both directions, then reaps
    /// the child once its stdout has closed.
    pub fn pump(&mut self, registry: &Registry) -> Result<(), CgiError> {
        self.feed(registry)?;
        self.collect(registry)?;
        if self.stdout.is_none() && self.exit.is_none() {
            self.exit = self.child.try_wait().map_err(CgiError::Wait)?;
        }
        Ok(())
    }

    fn feed(&mut self, registry: &Registry) -> Result<(), CgiError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        while self.written < self.input.len() {
            match stdin.write(&self.input[self.written..]) {
                Ok(0) => break,
                Ok(n) => self.written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(pid = self.child.id(), "script closed stdin before reading the body");
                    break;
                }
                Err(e) => return Err(CgiError::Pipe(e)),
            }
        }
        if let Some(mut stdin) = self.stdin.take() {
            let _ = registry.deregister(&mut stdin);
        }
        Ok(())
    }

    fn collect(&mut self, registry: &Registry) -> Result<(), CgiError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(());
        };
        match self.output.fill_from(stdout, MAX_OUTPUT + 1).map_err(CgiError::Pipe)? {
            ReadOutcome::Drained(_) => Ok(()),
            ReadOutcome::Full(_) => Err(CgiError::TooLarge(MAX_OUTPUT)),
            ReadOutcome::Closed(_) => {
                if let Some(mut stdout) = self.stdout.take() {
                    let _ = registry.deregister(&mut stdout);
                }
                Ok(())
            }
        }
    }

    /// Output has reached EOF and the child has been reaped.
    pub fn is_finished(&self) -> bool {
        self.exit.is_some()
    }

    /// Stdout is closed but the child has not exited yet.
    pub fn awaiting_exit(&self) -> bool {
        self.stdout.is_none() && self.exit.is_none()
    }

    pub fn close_pipes(&mut self, registry: &Registry) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = registry.deregister(&mut stdin);
        }
        if let Some(mut stdout) = self.stdout.take() {
            let _ = registry.deregister(&mut stdout);
        }
    }

    /// Kills the child and reaps it.
    pub fn kill(&mut self, registry: &Registry) {
        self.close_pipes(registry);
        if self.exit.is_none() {
            let _ = self.child.kill();
            self.exit = self.child.wait().ok();
        }
    }

    /// Turns the collected output of a finished script into a response.
    pub fn into_response(mut self) -> Result<Response, CgiError> {
        let status = self
            .exit
            .ok_or_else(|| CgiError::Malformed("script has not exited".to_string()))?;
        check_exit(status)?;
        let output = self.output.take_bytes(usize::MAX);
        parse_output(&output)
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn check_exit(status: ExitStatus) -> Result<(), CgiError> {
    if status.success() {
        return Ok(());
    }
    if let Some(signal) = status.signal().or_else(|| status.stopped_signal()) {
        return Err(CgiError::Signal(signal));
    }
    Err(CgiError::Exit(status))
}

/// Splits script output at the first blank line and maps the header block
/// onto a response. CRLF and bare LF line endings are both accepted.
pub fn parse_output(output: &[u8]) -> Result<Response, CgiError> {
    let (head, body) = split_head(output)
        .ok_or_else(|| CgiError::Malformed("no blank line after headers".to_string()))?;
    let head = std::str::from_utf8(head)
        .map_err(|_| CgiError::Malformed("header block is not UTF-8".to_string()))?;

    let mut status = None;
    let mut declared = None;
    let mut headers = Vec::new();
    for line in head.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CgiError::Malformed(format!("header line without colon: {}", line)))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            let code = value
                .split_whitespace()
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .and_then(StatusCode::from_u16)
                .ok_or_else(|| CgiError::Malformed(format!("unsupported status {}", value)))?;
            status = Some(code);
            continue;
        }
        match HeaderName::lookup(name) {
            Some(HeaderName::ContentLength) => {
                let n = value
                    .parse::<usize>()
                    .map_err(|_| CgiError::Malformed(format!("bad Content-Length {}", value)))?;
                declared = Some(n);
            }
            Some(header) => headers.push((header, value.to_string())),
            None => tracing::warn!(header = name, "dropping unregistered CGI header"),
        }
    }

    let has = |h: HeaderName| headers.iter().any(|(n, _)| *n == h);
    let status = match status {
        Some(s) => s,
        None if has(HeaderName::Location) => StatusCode::Found,
        None if has(HeaderName::ContentType) => StatusCode::Ok,
        None => {
            return Err(CgiError::Malformed(
                "none of Content-Type, Location or Status present".to_string(),
            ));
        }
    };
    if let Some(declared) = declared {
        if declared != body.len() {
            return Err(CgiError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
    }

    let mut res = Response::new(status);
    for (name, value) in headers {
        res.add_header(name, value);
    }
    res.set_bytes("", body.to_vec());
    Ok(res)
}

fn split_head(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = output.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = output.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let (pos, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&output[..pos], &output[pos + len..]))
}
