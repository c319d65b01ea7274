//! Response generation.
//!
//! [`handle`] runs the per-location gates (authentication, allowed methods,
//! redirect) and then the method handler picked from a fixed table. Handlers
//! return `Err(status)` on failure and [`error_response`] turns that into a
//! page; nothing past this module ever sees a per-request error.

pub mod cgi;
pub mod listing;
pub mod methods;

use std::fs;
use std::io;
use std::net::SocketAddr;

use crate::config::models::{Config, Location, ServerBlock};
use crate::http::headers::HeaderName;
use crate::http::mime::content_type_for;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, SERVER_SOFTWARE};
use crate::http::status::StatusCode;

/// Read-only view of the routing table for one request.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a Config,
    pub server: &'a ServerBlock,
    pub location: &'a Location,
    pub peer: SocketAddr,
}

pub type Handler = fn(&Request, &Context<'_>) -> Result<Response, StatusCode>;

/// Method handlers. Known methods missing here are answered with 501.
const HANDLERS: [(Method, Handler); 6] = [
    (Method::Get, methods::get),
    (Method::Head, methods::get),
    (Method::Post, methods::post),
    (Method::Put, methods::put),
    (Method::Delete, methods::delete),
    (Method::Options, methods::options),
];

fn handler_for(method: Method) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(m, _)| *m == method)
        .map(|(_, handler)| *handler)
}

/// Produces the response for a parsed and routed request. Never fails.
pub fn handle(req: &Request, ctx: &Context<'_>) -> Response {
    if req.is_failed() {
        return error_response(req.status(), ctx.location);
    }

    if let Some(auth) = &ctx.location.auth {
        if !auth.accepts(req.header(HeaderName::Authorization)) {
            tracing::debug!(peer = %ctx.peer, realm = %auth.realm, "authentication required");
            let mut res = error_response(StatusCode::Unauthorized, ctx.location);
            res.set_header(HeaderName::WwwAuthenticate, auth.challenge());
            res.force_close();
            return res;
        }
    }

    let Some(handler) = handler_for(req.method) else {
        return error_response(StatusCode::NotImplemented, ctx.location);
    };

    if !ctx.location.allows(req.method) {
        let mut res = error_response(StatusCode::MethodNotAllowed, ctx.location);
        res.set_header(HeaderName::Allow, ctx.location.allow_header());
        return res;
    }

    if let Some(redirect) = &ctx.location.redirect {
        let mut res = Response::new(redirect.status);
        res.set_header(HeaderName::Location, redirect.url.as_str());
        return res;
    }

    match handler(req, ctx) {
        Ok(res) => res,
        Err(status) => error_response(status, ctx.location),
    }
}

/// Error page for `status`: the location's custom page when configured and
/// readable, else a built-in one.
pub fn error_response(status: StatusCode, location: &Location) -> Response {
    if let Some(page) = location.error_pages.get(&status.as_u16()) {
        match fs::read(page) {
            Ok(body) => {
                let content_type = content_type_for(&page.to_string_lossy());
                return Response::with_bytes(status, &content_type, body);
            }
            Err(e) => {
                tracing::warn!(page = %page.display(), error = %e, "custom error page unreadable");
            }
        }
    }
    Response::with_bytes(status, "text/html; charset=utf-8", default_page(status).into_bytes())
}

fn default_page(status: StatusCode) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{status}</title></head>\
         <body><h1>{status}</h1><hr><p>{SERVER_SOFTWARE}</p></body></html>\n"
    )
}

/// Maps a filesystem error onto the status a client should see.
pub fn status_for(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        io::ErrorKind::NotADirectory => StatusCode::NotFound,
        io::ErrorKind::IsADirectory | io::ErrorKind::DirectoryNotEmpty => StatusCode::Forbidden,
        _ => StatusCode::InternalServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{BasicAuth, Redirect, Timeouts};
    use std::path::PathBuf;

    fn config(location: Location) -> Config {
        Config {
            servers: vec![ServerBlock {
                name: "test".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8080,
                server_names: Vec::new(),
                base: location,
                locations: Vec::new(),
            }],
            max_requests: 10,
            timeouts: Timeouts::default(),
        }
    }

    fn run(cfg: &Config, req: &Request) -> Response {
        let ctx = Context {
            config: cfg,
            server: &cfg.servers[0],
            location: &cfg.servers[0].base,
            peer: "127.0.0.1:5555".parse().unwrap(),
        };
        handle(req, &ctx)
    }

    fn request(method: Method, path: &str) -> Request {
        let mut req = Request::new();
        req.method = method;
        req.path = path.to_string();
        req.target = path.to_string();
        req
    }

    #[test]
    fn failed_parse_becomes_error_page() {
        let cfg = config(Location::default());
        let mut req = request(Method::Get, "/");
        req.set_status(StatusCode::BadRequest);
        let res = run(&cfg, &req);
        assert_eq!(res.status(), StatusCode::BadRequest);
        assert!(String::from_utf8_lossy(res.body_bytes()).contains("400 Bad Request"));
    }

    #[test]
    fn unhandled_method_is_not_implemented() {
        let cfg = config(Location::default());
        let res = run(&cfg, &request(Method::Trace, "/"));
        assert_eq!(res.status(), StatusCode::NotImplemented);
    }

    #[test]
    fn disallowed_method_lists_allowed() {
        let location = Location {
            methods: vec![Method::Get, Method::Head],
            ..Location::default()
        };
        let cfg = config(location);
        let res = run(&cfg, &request(Method::Delete, "/x"));
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.header(HeaderName::Allow), Some("GET, HEAD"));
    }

    #[test]
    fn auth_challenge_closes() {
        let location = Location {
            auth: Some(BasicAuth {
                realm: "staff".to_string(),
                user_file: PathBuf::from("users"),
                credentials: ["admin:secret".to_string()].into_iter().collect(),
            }),
            ..Location::default()
        };
        let cfg = config(location);
        let res = run(&cfg, &request(Method::Get, "/"));
        assert_eq!(res.status(), StatusCode::Unauthorized);
        assert!(res.header(HeaderName::WwwAuthenticate).unwrap().contains("realm=\"staff\""));
        assert!(res.closes_connection());
    }

    #[test]
    fn redirect_runs_after_method_check() {
        let location = Location {
            redirect: Some(Redirect {
                status: StatusCode::MovedPermanently,
                url: "https://example.test/".to_string(),
            }),
            ..Location::default()
        };
        let cfg = config(location);
        let res = run(&cfg, &request(Method::Get, "/old"));
        assert_eq!(res.status(), StatusCode::MovedPermanently);
        assert_eq!(res.header(HeaderName::Location), Some("https://example.test/"));
    }

    #[test]
    fn custom_error_page_with_fallback() {
        let dir = std::env::temp_dir().join(format!("webserv-errpage-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let page = dir.join("404.html");
        fs::write(&page, "custom missing").unwrap();

        let mut location = Location::default();
        location.error_pages.insert(404, page);
        location.error_pages.insert(500, dir.join("absent.html"));

        let res = error_response(StatusCode::NotFound, &location);
        assert_eq!(res.body_bytes(), b"custom missing");
        let res = error_response(StatusCode::InternalServerError, &location);
        assert_eq!(res.status(), StatusCode::InternalServerError);
        assert!(String::from_utf8_lossy(res.body_bytes()).contains("500 Internal Server Error"));
    }
}
