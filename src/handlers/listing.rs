//! Autoindex pages.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::handlers::status_for;
use crate::http::response::Response;
use crate::http::status::StatusCode;

/// Renders one anchor per directory entry, in the order the filesystem
/// enumerates them. `url_path` must end with `/`.
pub fn render(url_path: &str, dir: &Path) -> Result<Response, StatusCode> {
    let entries = fs::read_dir(dir).map_err(|e| status_for(&e))?;

    let title = escape(url_path);
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {title}</title></head>\n<body><h1>Index of {title}</h1><hr><pre>\n"
    );
    for entry in entries {
        let entry = entry.map_err(|e| status_for(&e))?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        html.push_str(&format!(
            "<a href=\"{}{}\">{}</a>\n",
            UrlEncoded(url_path),
            UrlEncoded(&name),
            escape(&name)
        ));
    }
    html.push_str("</pre><hr></body></html>\n");

    Ok(Response::with_bytes(
        StatusCode::Ok,
        "text/html; charset=utf-8",
        html.into_bytes(),
    ))
}

/// Percent-encodes everything but unreserved characters and `/`.
struct UrlEncoded<'a>(&'a str);

impl fmt::Display for UrlEncoded<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_anchor_per_entry_in_readdir_order() {
        let dir = std::env::temp_dir().join(format!("webserv-listing-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        fs::write(dir.join("b<c>.txt"), "b").unwrap();

        let expected: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();

        let res = render("/files/", &dir).unwrap();
        let body = String::from_utf8(res.body_bytes().to_vec()).unwrap();
        assert_eq!(body.matches("<a href=").count(), expected.len());

        let mut last = 0;
        for name in &expected {
            let pos = body[last..].find(&escape(name)).map(|p| p + last).unwrap();
            assert!(pos >= last);
            last = pos;
        }
        assert!(body.contains("<a href=\"/files/sub/\">sub/</a>"));
        assert!(body.contains("<a href=\"/files/b%3Cc%3E.txt\">b&lt;c&gt;.txt</a>"));
    }

    #[test]
    fn hrefs_are_percent_encoded() {
        let dir = std::env::temp_dir().join(format!("webserv-listing-enc-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("50% off #1?.txt"), "x").unwrap();

        let res = render("/my files/", &dir).unwrap();
        let body = String::from_utf8(res.body_bytes().to_vec()).unwrap();
        assert!(body.contains("<a href=\"/my%20files/50%25%20off%20%231%3F.txt\">50% off #1?.txt</a>"));
        assert_eq!(UrlEncoded("caf\u{e9}/a&b").to_string(), "caf%C3%A9/a%26b");
    }
}
