//! HTTP/1.x message handling: the registered header vocabulary, the
//! incremental request parser and response serialization.

pub mod headers;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod status;

pub use request::{Method, Request, Version};
pub use response::Response;
pub use status::StatusCode;
