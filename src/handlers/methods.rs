use std::fs::{self, File};
use std::path::Path;
use std::time::Instant;

use crate::handlers::cgi::{CgiJob, CgiProcess};
use crate::handlers::{Context, listing, status_for};
use crate::http::headers::HeaderName;
use crate::http::mime::content_type_for;
use crate::http::request::Request;
use crate::http::response::{Response, http_date};
use crate::http::status::StatusCode;

/// GET and HEAD. HEAD takes the same path; the connection suppresses the
/// body when it writes the response.
pub fn get(req: &Request, ctx: &Context<'_>) -> Result<Response, StatusCode> {
    let path = req.resolved_path.as_path();
    let meta = fs::metadata(path).map_err(|e| status_for(&e))?;

    if meta.is_dir() {
        if !req.path.ends_with('/') {
            let mut target = format!("{}/", req.path);
            if !req.query.is_empty() {
                target.push('?');
                target.push_str(&req.query);
            }
            let mut res = Response::new(StatusCode::MovedPermanently);
            res.set_header(HeaderName::Location, target);
            return Ok(res);
        }
        for name in &ctx.location.index {
            let candidate = path.join(name);
            if candidate.is_file() {
                return serve_file(req, ctx, &candidate);
            }
        }
        if ctx.location.autoindex {
            return listing::render(&req.path, path);
        }
        return Err(StatusCode::Forbidden);
    }

    serve_file(req, ctx, path)
}

fn serve_file(req: &Request, ctx: &Context<'_>, path: &Path) -> Result<Response, StatusCode> {
    if let Some(res) = run_cgi(req, ctx, path) {
        return res;
    }

    let file = File::open(path).map_err(|e| status_for(&e))?;
    let meta = file.metadata().map_err(|e| status_for(&e))?;
    if !meta.is_file() {
        return Err(StatusCode::Forbidden);
    }

    let mut res = Response::new(StatusCode::Ok);
    if let Ok(modified) = meta.modified() {
        res.set_header(HeaderName::LastModified, http_date(modified));
    }
    res.set_file(&content_type_for(&path.to_string_lossy()), file, meta.len());
    Ok(res)
}

/// Starts the script when `path` matches a CGI extension of the location.
/// `None` means the path is not a script.
fn run_cgi(req: &Request, ctx: &Context<'_>, path: &Path) -> Option<Result<Response, StatusCode>> {
    let file_name = path.file_name()?.to_string_lossy();
    let (_, interpreter) = ctx.location.cgi_for(&file_name)?;

    let started = CgiJob::new(req, ctx, path, interpreter).and_then(|job| {
        let deadline = Instant::now() + ctx.config.timeouts.cgi;
        CgiProcess::spawn(job, deadline).map_err(|e| {
            tracing::error!(script = %path.display(), error = %e, "cgi spawn failed");
            StatusCode::BadGateway
        })
    });
    Some(started.map(|process| {
        let mut res = Response::new(StatusCode::Ok);
        res.set_cgi(process);
        res
    }))
}

/// Runs the script if the target maps to one, else accepts the body and
/// answers 204.
pub fn post(req: &Request, ctx: &Context<'_>) -> Result<Response, StatusCode> {
    let path = req.resolved_path.as_path();
    if let Some(res) = run_cgi(req, ctx, path) {
        return res;
    }
    Ok(Response::new(StatusCode::NoContent))
}

/// Stores the body at the target path. Both creation and replacement answer
/// 201; only the message differs.
pub fn put(req: &Request, _ctx: &Context<'_>) -> Result<Response, StatusCode> {
    let path = req.resolved_path.as_path();
    if req.path.ends_with('/') || path.is_dir() {
        return Err(StatusCode::Forbidden);
    }
    match path.parent() {
        Some(parent) if parent.is_dir() => {}
        _ => return Err(StatusCode::NotFound),
    }

    let existed = path.exists();
    fs::write(path, &req.body).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "PUT failed");
        status_for(&e)
    })?;
    tracing::info!(path = %path.display(), bytes = req.body.len(), "stored upload");

    let message: &[u8] = if existed {
        b"File overwritten.\n"
    } else {
        b"File created.\n"
    };
    let mut res = Response::with_bytes(StatusCode::Created, "text/plain; charset=utf-8", message.to_vec());
    res.set_header(HeaderName::Location, req.path.as_str());
    Ok(res)
}

/// Removes a file or an empty directory.
pub fn delete(req: &Request, _ctx: &Context<'_>) -> Result<Response, StatusCode> {
    let path = req.resolved_path.as_path();
    let meta = fs::symlink_metadata(path).map_err(|e| status_for(&e))?;

    if meta.is_dir() {
        let mut entries = fs::read_dir(path).map_err(|e| status_for(&e))?;
        if entries.next().is_some() {
            return Err(StatusCode::Forbidden);
        }
        fs::remove_dir(path).map_err(|e| status_for(&e))?;
    } else {
        fs::remove_file(path).map_err(|e| status_for(&e))?;
    }
    tracing::info!(path = %path.display(), "deleted");
    Ok(Response::with_bytes(
        StatusCode::Ok,
        "text/plain; charset=utf-8",
        b"File deleted.\n".to_vec(),
    ))
}

pub fn options(_req: &Request, ctx: &Context<'_>) -> Result<Response, StatusCode> {
    let mut res = Response::new(StatusCode::NoContent);
    res.set_header(HeaderName::Allow, ctx.location.allow_header());
    Ok(res)
}
