//! Virtual host and location matching, and request path resolution.

use std::path::PathBuf;

use crate::config::models::{Config, Location, Route, ServerBlock};
use crate::http::status::StatusCode;

impl Config {
    /// Listen addresses in configuration order, each with the server blocks
    /// bound to it. The first block of each group is its default host.
    pub fn listeners(&self) -> Vec<(String, Vec<usize>)> {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, server) in self.servers.iter().enumerate() {
            let addr = server.listen_addr();
            match groups.iter_mut().find(|(a, _)| *a == addr) {
                Some((_, members)) => members.push(idx),
                None => groups.push((addr, vec![idx])),
            }
        }
        groups
    }

    /// Picks the virtual host among `candidates` by `Host` name, then the
    /// location by longest path prefix.
    pub fn route(&self, candidates: &[usize], host: Option<&str>, path: &str) -> Route {
        let by_name = host.and_then(|h| {
            candidates.iter().copied().find(|&idx| {
                self.servers[idx]
                    .server_names
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(h))
            })
        });
        let server = by_name.or_else(|| candidates.first().copied()).unwrap_or(0);

        let normalized = normalize_path(path).unwrap_or_else(|_| path.to_string());
        Route {
            server,
            location: self.servers[server].match_location(&normalized),
        }
    }

    pub fn server(&self, route: Route) -> &ServerBlock {
        &self.servers[route.server]
    }

    pub fn location(&self, route: Route) -> &Location {
        let server = self.server(route);
        match route.location {
            Some(idx) => &server.locations[idx],
            None => &server.base,
        }
    }
}

impl ServerBlock {
    /// Index of the location with the longest prefix matching `path` on a
    /// segment boundary.
    pub fn match_location(&self, path: &str) -> Option<usize> {
        self.locations
            .iter()
            .enumerate()
            .filter(|(_, loc)| prefix_matches(&loc.path, path))
            .max_by_key(|(_, loc)| loc.path.len())
            .map(|(idx, _)| idx)
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

impl Location {
    /// Maps a request path onto the filesystem under this location's root or
    /// alias. Paths that would climb out of it are refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, StatusCode> {
        let normalized = normalize_path(path)?;
        let (base, relative) = match &self.alias {
            Some(alias) => {
                let rest = normalized.strip_prefix(self.path.as_str()).unwrap_or(&normalized);
                (alias, rest)
            }
            None => (&self.root, normalized.as_str()),
        };
        let mut full = base.clone();
        let relative = relative.trim_start_matches('/');
        if !relative.is_empty() {
            full.push(relative);
        }
        Ok(full)
    }
}

/// Percent-decodes a request path and folds `.`, `..` and repeated slashes.
/// A trailing slash is kept. Climbing above `/` is forbidden.
pub fn normalize_path(path: &str) -> Result<String, StatusCode> {
    let decoded = percent_decode(path)?;
    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(StatusCode::Forbidden);
                }
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(decoded.len());
    out.push('/');
    out.push_str(&segments.join("/"));
    let dir_like = decoded.ends_with('/') || decoded.ends_with("/.") || decoded.ends_with("/..");
    if dir_like && !segments.is_empty() {
        out.push('/');
    }
    Ok(out)
}

fn percent_decode(path: &str) -> Result<String, StatusCode> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or(StatusCode::BadRequest)?;
            let hex = std::str::from_utf8(hex).map_err(|_| StatusCode::BadRequest)?;
            let value = u8::from_str_radix(hex, 16).map_err(|_| StatusCode::BadRequest)?;
            if value == 0 {
                return Err(StatusCode::BadRequest);
            }
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| StatusCode::BadRequest)
}
