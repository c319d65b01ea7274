//! Routing table: virtual hosts, locations and their settings.
//!
//! The table is loaded once from YAML before the server starts and is only
//! ever read afterwards.

pub mod models;
pub mod parser;
pub mod routing;

pub use parser::{load_config, parse_config};
