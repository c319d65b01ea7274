//! Extension to MIME type table.

const DEFAULT_MIME: &str = "application/octet-stream";

static MIME_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("xml", "text/xml"),
    ("md", "text/markdown"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("wasm", "application/wasm"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
];

/// Content type for a path, looked up by the case-sensitive suffix after the
/// last dot. Text types get an explicit utf-8 charset.
pub fn content_type_for(path: &str) -> String {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let mime = file_name
        .rsplit_once('.')
        .and_then(|(_, ext)| MIME_TYPES.iter().find(|(e, _)| *e == ext))
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME);

    if mime.starts_with("text/") {
        format!("{}; charset=utf-8", mime)
    } else {
        mime.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        assert_eq!(content_type_for("/var/www/index.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("logo.png"), "image/png");
        assert_eq!(content_type_for("archive.tar.gz"), "application/gzip");
    }

    #[test]
    fn suffix_is_case_sensitive() {
        assert_eq!(content_type_for("LOGO.PNG"), DEFAULT_MIME);
    }

    #[test]
    fn dots_in_directories_are_ignored() {
        assert_eq!(content_type_for("/srv/site.d/README"), DEFAULT_MIME);
    }
}
