//! Error types for configuration loading and the server runtime.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("server block {block}: {message}")]
    Server { block: String, message: String },

    #[error("server block {block}, location {location}: {message}")]
    Location {
        block: String,
        location: String,
        message: String,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot register with the poller: {0}")]
    Register(#[source] io::Error),

    #[error("poller failure: {0}")]
    Poll(#[source] io::Error),

    #[error("out of system resources: {0}")]
    Exhausted(#[source] io::Error),
}

/// Errors that mean the process has run out of descriptors or memory, as
/// opposed to a transient per-connection failure.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) | Some(libc::ENOBUFS)
    )
}

/// Failures of one CGI invocation. Every variant is answered with 502.
#[derive(Debug, thiserror::Error)]
pub enum CgiError {
    #[error("cannot start {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pipe failure: {0}")]
    Pipe(#[source] io::Error),

    #[error("cannot reap child: {0}")]
    Wait(#[source] io::Error),

    #[error("script {0}")]
    Exit(std::process::ExitStatus),

    #[error("script terminated by signal {0}")]
    Signal(i32),

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("Content-Length {declared} does not match body of {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("output larger than {0} bytes")]
    TooLarge(usize),

    #[error("script exceeded its time limit")]
    Timeout,
}
