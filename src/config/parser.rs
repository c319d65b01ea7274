use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::models::{
    BasicAuth, Config, HANDLED_METHODS, Location, Redirect, ServerBlock, Timeouts,
};
use crate::error::ConfigError;
use crate::http::request::Method;
use crate::http::status::StatusCode;

const DEFAULT_MAX_REQUESTS: usize = 100;

#[derive(Debug, Deserialize)]
struct RawConfig {
    servers: Vec<RawServer>,
    #[serde(default)]
    max_requests: Option<usize>,
    #[serde(default)]
    timeouts: RawTimeouts,
}

#[derive(Debug, Default, Deserialize)]
struct RawTimeouts {
    client: Option<u64>,
    cgi: Option<u64>,
    max: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    host: Option<String>,
    port: u16,
    #[serde(default)]
    server_names: Vec<String>,
    #[serde(default)]
    locations: BTreeMap<String, RawLocation>,
    #[serde(flatten)]
    base: RawLocation,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct RawLocation {
    root: Option<String>,
    alias: Option<String>,
    autoindex: Option<bool>,
    index: Option<Vec<String>>,
    methods: Option<Vec<String>>,
    max_body_size: Option<usize>,
    redirect: Option<RawRedirect>,
    auth_basic: Option<RawAuth>,
    cgi: Option<BTreeMap<String, String>>,
    error_pages: Option<BTreeMap<u16, String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRedirect {
    code: u16,
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawAuth {
    realm: String,
    user_file: String,
}

/// Reads and validates a YAML configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Builds the routing table from YAML text. Sub-locations start as a copy of
/// their server's base location and override what they set.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(content)?;
    if raw.servers.is_empty() {
        return Err(ConfigError::Invalid("no server blocks defined".to_string()));
    }

    let defaults = Timeouts::default();
    let timeouts = Timeouts {
        client: raw.timeouts.client.map(Duration::from_secs).unwrap_or(defaults.client),
        cgi: raw.timeouts.cgi.map(Duration::from_secs).unwrap_or(defaults.cgi),
        max: raw.timeouts.max.map(Duration::from_secs).unwrap_or(defaults.max),
    };
    let max_requests = raw.max_requests.unwrap_or(DEFAULT_MAX_REQUESTS);
    if max_requests == 0 {
        return Err(ConfigError::Invalid("max_requests must be at least 1".to_string()));
    }

    let mut servers = Vec::with_capacity(raw.servers.len());
    for (idx, raw_server) in raw.servers.into_iter().enumerate() {
        servers.push(build_server(idx, raw_server)?);
    }

    Ok(Config {
        servers,
        max_requests,
        timeouts,
    })
}

fn build_server(idx: usize, raw: RawServer) -> Result<ServerBlock, ConfigError> {
    let name = raw.name.unwrap_or_else(|| format!("server{}", idx));
    let host = raw.host.unwrap_or_else(|| "0.0.0.0".to_string());
    if host.parse::<IpAddr>().is_err() {
        return Err(ConfigError::Server {
            block: name,
            message: format!("host {} is not an IP address", host),
        });
    }

    let base = build_location(&Location::default(), "/", &raw.base, true).map_err(|message| {
        ConfigError::Server {
            block: name.clone(),
            message,
        }
    })?;

    let mut locations = Vec::with_capacity(raw.locations.len());
    for (path, raw_location) in &raw.locations {
        if !path.starts_with('/') {
            return Err(ConfigError::Location {
                block: name.clone(),
                location: path.clone(),
                message: "path must start with /".to_string(),
            });
        }
        let location = build_location(&base, path, raw_location, false).map_err(|message| {
            ConfigError::Location {
                block: name.clone(),
                location: path.clone(),
                message,
            }
        })?;
        locations.push(location);
    }

    Ok(ServerBlock {
        name,
        host,
        port: raw.port,
        server_names: raw.server_names,
        base,
        locations,
    })
}

fn build_location(
    inherited: &Location,
    path: &str,
    raw: &RawLocation,
    is_base: bool,
) -> Result<Location, String> {
    let mut loc = inherited.clone();
    loc.path = path.to_string();

    if raw.alias.is_some() && raw.root.is_some() {
        return Err("root and alias are mutually exclusive".to_string());
    }
    if let Some(alias) = &raw.alias {
        if is_base {
            return Err("alias is only valid inside a location".to_string());
        }
        loc.alias = Some(existing_dir(alias, "alias")?);
    }
    if let Some(root) = &raw.root {
        loc.root = existing_dir(root, "root")?;
        loc.alias = None;
    } else if is_base {
        loc.root = existing_dir(&loc.root.to_string_lossy(), "root")?;
    }

    if let Some(autoindex) = raw.autoindex {
        loc.autoindex = autoindex;
    }
    if let Some(index) = &raw.index {
        loc.index = index.clone();
    }
    if let Some(max) = raw.max_body_size {
        loc.max_body_size = max;
    }
    if let Some(methods) = &raw.methods {
        loc.methods = parse_methods(methods)?;
    }
    if let Some(redirect) = &raw.redirect {
        loc.redirect = Some(parse_redirect(redirect)?);
    }
    if let Some(auth) = &raw.auth_basic {
        loc.auth = Some(load_auth(auth)?);
    }
    if let Some(cgi) = &raw.cgi {
        loc.cgi = parse_cgi(cgi)?;
    }
    if let Some(pages) = &raw.error_pages {
        loc.error_pages = parse_error_pages(pages)?;
    }
    Ok(loc)
}

fn existing_dir(path: &str, what: &str) -> Result<PathBuf, String> {
    let p = PathBuf::from(path);
    if !p.exists() {
        return Err(format!("{} {} does not exist", what, path));
    }
    if !p.is_dir() {
        return Err(format!("{} {} must be a directory", what, path));
    }
    Ok(p)
}

fn parse_methods(raw: &[String]) -> Result<Vec<Method>, String> {
    let mut methods = Vec::with_capacity(raw.len());
    for token in raw {
        let method = Method::from_token(token)
            .filter(|m| HANDLED_METHODS.contains(m))
            .ok_or_else(|| format!("methods has unrecognized value {}", token))?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    Ok(methods)
}

fn parse_redirect(raw: &RawRedirect) -> Result<Redirect, String> {
    let status = StatusCode::from_u16(raw.code)
        .filter(|s| (300..=308).contains(&s.as_u16()))
        .ok_or_else(|| format!("redirect code {} is invalid", raw.code))?;
    if raw.url.is_empty() {
        return Err("redirect url is empty".to_string());
    }
    Ok(Redirect {
        status,
        url: raw.url.clone(),
    })
}

fn load_auth(raw: &RawAuth) -> Result<BasicAuth, String> {
    if raw.realm.is_empty() {
        return Err("auth_basic realm is empty".to_string());
    }
    let content = fs::read_to_string(&raw.user_file)
        .map_err(|e| format!("auth_basic user_file {}: {}", raw.user_file, e))?;
    let credentials: HashSet<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if credentials.iter().any(|line| !line.contains(':')) {
        return Err(format!("auth_basic user_file {} has a line without user:password", raw.user_file));
    }
    Ok(BasicAuth {
        realm: raw.realm.clone(),
        user_file: PathBuf::from(&raw.user_file),
        credentials,
    })
}

fn parse_cgi(raw: &BTreeMap<String, String>) -> Result<BTreeMap<String, Option<PathBuf>>, String> {
    let mut cgi = BTreeMap::new();
    for (ext, interpreter) in raw {
        if !ext.starts_with('.') || ext.len() < 2 {
            return Err(format!("cgi extension {} must look like .ext", ext));
        }
        let interpreter = if interpreter.is_empty() {
            None
        } else {
            let p = PathBuf::from(interpreter);
            if !p.is_file() {
                return Err(format!("cgi interpreter {} is not a file", interpreter));
            }
            Some(p)
        };
        cgi.insert(ext.clone(), interpreter);
    }
    Ok(cgi)
}

fn parse_error_pages(raw: &BTreeMap<u16, String>) -> Result<HashMap<u16, PathBuf>, String> {
    let mut pages = HashMap::new();
    for (code, file) in raw {
        if StatusCode::from_u16(*code).is_none_or(|s| !s.is_error()) {
            return Err(format!("error_pages code {} is not an error status", code));
        }
        let p = PathBuf::from(file);
        if !p.is_file() {
            return Err(format!("error page {} is not a readable file", file));
        }
        pages.insert(*code, p);
    }
    Ok(pages)
}
