//! HTTP/1 framing and parsing shared by the client and server engines.

pub mod chunked;
pub mod headers;

pub use chunked::ChunkDecoder;
pub use headers::HeaderMap;

use crate::error::{WebError, WebResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
}

impl Method {
    /// Parse a request-line method token. Lowercase or unknown tokens are
    /// rejected rather than mapped to a catch-all.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            _ => None,
        }
    }

    pub fn from_str_token(s: &str) -> Option<Self> {
        Self::from_bytes(s.as_bytes())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    /// Methods that change server state and therefore require an XSRF
    /// token on protected routes.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Delete | Method::Patch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }

    /// HTTP/1.1 defaults to keep-alive; 1.0 to close.
    pub fn default_keep_alive(&self) -> bool {
        matches!(self, Protocol::Http11)
    }
}

/// Parse `METHOD target HTTP/1.x` from a server-received request line.
pub fn parse_request_line(line: &str) -> WebResult<(Method, &str, Protocol)> {
    let mut parts = line.split(' ');
    let method_text = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let proto_text = parts.next().unwrap_or("");
    if parts.next().is_some() || target.is_empty() {
        return Err(WebError::BadArgs(format!("bad request line: {}", line)));
    }
    let method = Method::from_bytes(method_text.as_bytes())
        .ok_or_else(|| WebError::BadArgs(format!("bad method: {}", method_text)))?;
    let protocol = match proto_text {
        "HTTP/1.0" => Protocol::Http10,
        "HTTP/1.1" => Protocol::Http11,
        other => return Err(WebError::BadArgs(format!("bad protocol: {}", other))),
    };
    Ok((method, target, protocol))
}

/// Parse `HTTP/1.x status reason` from a client-received response line.
/// A status outside 100..=599 is a fatal framing error.
pub fn parse_response_line(line: &str) -> WebResult<(Protocol, u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let proto_text = parts.next().unwrap_or("");
    let status_text = parts.next().unwrap_or("");
    let reason = parts.next().unwrap_or("").to_string();
    let protocol = match proto_text {
        "HTTP/1.0" => Protocol::Http10,
        "HTTP/1.1" => Protocol::Http11,
        other => return Err(WebError::CantRead(format!("bad response protocol: {}", other))),
    };
    let status: u16 = status_text
        .parse()
        .map_err(|_| WebError::CantRead(format!("bad status: {}", status_text)))?;
    if !(100..=599).contains(&status) {
        return Err(WebError::CantRead(format!("status out of range: {}", status)));
    }
    Ok((protocol, status, reason))
}

/// Canonical reason phrase for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Responses that carry neither a body nor body-framing headers.
pub fn bodyless_status(status: u16) -> bool {
    status == 204 || status == 304 || (100..200).contains(&status)
}

/// Does a comma-separated header value contain `token` (case-insensitive)?
/// Used for `Connection`, `Upgrade` and `Accept-Encoding` checks.
pub fn value_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// One `Range` header element, before resolution against the entity size.
/// `bytes=a-b` keeps both, `bytes=a-` keeps only `first`, `bytes=-n` keeps
/// only `suffix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub first: Option<u64>,
    pub last: Option<u64>,
}

/// A resolved byte range: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl RangeSpec {
    /// Resolve against the entity size per RFC 7233. `None` means the
    /// element is unsatisfiable (out-of-range start).
    pub fn resolve(&self, size: u64) -> Option<ByteRange> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => {
                if first >= size || last < first {
                    None
                } else {
                    Some(ByteRange {
                        start: first,
                        end: (last + 1).min(size),
                    })
                }
            }
            (Some(first), None) => {
                if first >= size {
                    None
                } else {
                    Some(ByteRange {
                        start: first,
                        end: size,
                    })
                }
            }
            (None, Some(suffix)) => {
                if suffix == 0 {
                    None
                } else {
                    Some(ByteRange {
                        start: size.saturating_sub(suffix),
                        end: size,
                    })
                }
            }
            (None, None) => None,
        }
    }
}

/// Parse a `Range: bytes=...` header into its ordered element list.
/// Returns `None` for units other than `bytes` or a malformed list; the
/// server then ignores the header.
pub fn parse_range_header(value: &str) -> Option<Vec<RangeSpec>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let mut out = Vec::new();
    for element in spec.split(',') {
        let element = element.trim();
        let dash = element.find('-')?;
        let (first_text, last_text) = (&element[..dash], &element[dash + 1..]);
        let first = if first_text.is_empty() {
            None
        } else {
            Some(first_text.parse().ok()?)
        };
        let last = if last_text.is_empty() {
            None
        } else {
            Some(last_text.parse().ok()?)
        };
        if first.is_none() && last.is_none() {
            return None;
        }
        out.push(RangeSpec { first, last });
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Parse an `If-Match`/`If-None-Match` value into its ordered tag list.
/// `*` stays as a literal `*` entry.
pub fn parse_etag_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// RFC 7232 comparison. Strong comparison (used for `If-Match` and
/// `If-Range`) fails when either tag is weak; weak comparison strips the
/// `W/` prefix from both sides first.
pub fn etag_match(candidate: &str, current: &str, strong: bool) -> bool {
    if candidate == "*" {
        return true;
    }
    let weak_a = candidate.starts_with("W/");
    let weak_b = current.starts_with("W/");
    if strong && (weak_a || weak_b) {
        return false;
    }
    let a = candidate.strip_prefix("W/").unwrap_or(candidate);
    let b = current.strip_prefix("W/").unwrap_or(current);
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, target, proto) = parse_request_line("GET /a/b?x=1 HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(target, "/a/b?x=1");
        assert_eq!(proto, Protocol::Http11);

        assert!(parse_request_line("get / HTTP/1.1").is_err());
        assert!(parse_request_line("GET / HTTP/2.0").is_err());
        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("GET / HTTP/1.1 junk").is_err());
    }

    #[test]
    fn test_parse_response_line() {
        let (proto, status, reason) = parse_response_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(proto, Protocol::Http11);
        assert_eq!(status, 404);
        assert_eq!(reason, "Not Found");

        assert!(parse_response_line("HTTP/1.1 999 Nope").is_err());
        assert!(parse_response_line("HTTP/1.1 42 Nope").is_err());
        assert!(parse_response_line("SPDY/3 200 OK").is_err());
    }

    #[test]
    fn test_range_header() {
        let ranges = parse_range_header("bytes=0-0,9999-").unwrap();
        assert_eq!(
            ranges[0],
            RangeSpec {
                first: Some(0),
                last: Some(0)
            }
        );
        assert_eq!(
            ranges[1],
            RangeSpec {
                first: Some(9999),
                last: None
            }
        );
        assert!(parse_range_header("lines=1-2").is_none());
        assert!(parse_range_header("bytes=-").is_none());
    }

    #[test]
    fn test_range_resolution() {
        let size = 10_000;
        let r = RangeSpec {
            first: Some(0),
            last: Some(0),
        };
        assert_eq!(r.resolve(size), Some(ByteRange { start: 0, end: 1 }));

        let r = RangeSpec {
            first: Some(9999),
            last: None,
        };
        assert_eq!(
            r.resolve(size),
            Some(ByteRange {
                start: 9999,
                end: 10_000
            })
        );

        let r = RangeSpec {
            first: None,
            last: Some(500),
        };
        assert_eq!(
            r.resolve(size),
            Some(ByteRange {
                start: 9500,
                end: 10_000
            })
        );

        let r = RangeSpec {
            first: Some(10_000),
            last: None,
        };
        assert_eq!(r.resolve(size), None);
    }

    #[test]
    fn test_etag_comparison() {
        assert!(etag_match("*", "\"x\"", true));
        assert!(etag_match("\"a\"", "\"a\"", true));
        assert!(!etag_match("W/\"a\"", "\"a\"", true));
        assert!(etag_match("W/\"a\"", "\"a\"", false));
        assert!(etag_match("W/\"a\"", "W/\"a\"", false));
        assert!(!etag_match("\"a\"", "\"b\"", false));
    }

    #[test]
    fn test_value_tokens() {
        assert!(value_has_token("keep-alive, Upgrade", "upgrade"));
        assert!(value_has_token("gzip, br", "br"));
        assert!(!value_has_token("gzip;q=0", "br"));
    }

    #[test]
    fn test_bodyless() {
        assert!(bodyless_status(204));
        assert!(bodyless_status(304));
        assert!(bodyless_status(100));
        assert!(!bodyless_status(200));
        assert!(!bodyless_status(404));
    }
}
