//! Registered header vocabulary.
//!
//! Requests may only carry header names from this table; anything else is
//! rejected by the parser. Responses build their header block from the same
//! table, so nothing reaches the wire without being registered here first.

use std::collections::HashMap;

macro_rules! registered_headers {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HeaderName {
            $($variant),*
        }

        impl HeaderName {
            /// Canonical wire spelling.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(HeaderName::$variant => $name),*
                }
            }

            fn match_name(name: &str) -> Option<Self> {
                $(
                    if name.eq_ignore_ascii_case($name) {
                        return Some(HeaderName::$variant);
                    }
                )*
                None
            }
        }
    };
}

registered_headers! {
    Accept => "Accept",
    AcceptCharset => "Accept-Charset",
    AcceptEncoding => "Accept-Encoding",
    AcceptLanguage => "Accept-Language",
    AcceptRanges => "Accept-Ranges",
    Allow => "Allow",
    Authorization => "Authorization",
    CacheControl => "Cache-Control",
    Connection => "Connection",
    ContentDisposition => "Content-Disposition",
    ContentEncoding => "Content-Encoding",
    ContentLanguage => "Content-Language",
    ContentLength => "Content-Length",
    ContentLocation => "Content-Location",
    ContentType => "Content-Type",
    Cookie => "Cookie",
    Date => "Date",
    Dnt => "DNT",
    ETag => "ETag",
    Expect => "Expect",
    Expires => "Expires",
    From => "From",
    Host => "Host",
    IfMatch => "If-Match",
    IfModifiedSince => "If-Modified-Since",
    IfNoneMatch => "If-None-Match",
    IfUnmodifiedSince => "If-Unmodified-Since",
    KeepAlive => "Keep-Alive",
    LastModified => "Last-Modified",
    Location => "Location",
    Origin => "Origin",
    Pragma => "Pragma",
    Priority => "Priority",
    Range => "Range",
    Referer => "Referer",
    RetryAfter => "Retry-After",
    SecChUa => "Sec-CH-UA",
    SecChUaMobile => "Sec-CH-UA-Mobile",
    SecChUaPlatform => "Sec-CH-UA-Platform",
    SecFetchDest => "Sec-Fetch-Dest",
    SecFetchMode => "Sec-Fetch-Mode",
    SecFetchSite => "Sec-Fetch-Site",
    SecFetchUser => "Sec-Fetch-User",
    Server => "Server",
    SetCookie => "Set-Cookie",
    Te => "TE",
    TransferEncoding => "Transfer-Encoding",
    Upgrade => "Upgrade",
    UpgradeInsecureRequests => "Upgrade-Insecure-Requests",
    UserAgent => "User-Agent",
    Vary => "Vary",
    Via => "Via",
    WwwAuthenticate => "WWW-Authenticate",
    XPoweredBy => "X-Powered-By",
}

impl HeaderName {
    /// Resolves a header name received on the wire, case-insensitively.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::match_name(name)
    }

    /// Headers that must not appear twice with different values.
    pub fn is_singleton(&self) -> bool {
        matches!(self, HeaderName::ContentLength | HeaderName::Host)
    }
}

/// Keyed request header storage. The first occurrence of a name is kept;
/// conflicting singleton headers are refused.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: HashMap<HeaderName, String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeaderError {
    /// Name is not part of the registered vocabulary.
    Unknown,
    /// Line has no colon or an empty/whitespace-bearing name.
    Malformed,
    /// A singleton header was repeated with a different value.
    Conflict,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one `name: value` line and stores it.
    pub fn parse_line(&mut self, line: &str) -> Result<HeaderName, HeaderError> {
        let (raw_name, raw_value) = line.split_once(':').ok_or(HeaderError::Malformed)?;
        if raw_name.is_empty() || raw_name.ends_with([' ', '\t']) {
            return Err(HeaderError::Malformed);
        }
        let name = HeaderName::lookup(raw_name).ok_or(HeaderError::Unknown)?;
        let value = raw_value.trim_matches([' ', '\t']);
        self.insert(name, value)?;
        Ok(name)
    }

    pub fn insert(&mut self, name: HeaderName, value: &str) -> Result<(), HeaderError> {
        match self.entries.get(&name) {
            Some(previous) if name.is_singleton() && previous != value => Err(HeaderError::Conflict),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(name, value.to_string());
                Ok(())
            }
        }
    }

    pub fn get(&self, name: HeaderName) -> Option<&str> {
        self.entries.get(&name).map(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
