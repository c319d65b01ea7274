//! webserv: a single-threaded, non-blocking HTTP/1.1 origin server with
//! virtual hosts, static files, directory listings and CGI.

pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod network;
pub mod server;

pub use config::{load_config, parse_config};
pub use server::Server;
