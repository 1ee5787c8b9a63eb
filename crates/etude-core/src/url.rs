//! URL decomposition.
//!
//! Parses `[scheme://][host][:port][/path][?query][#hash]` with the
//! defaulting rules the client engine depends on:
//!
//! - `:port/path` and `port/path` leave the host empty; the client fills in
//!   `localhost`.
//! - `[::1]:port/path` style IPv6 literals are accepted.
//! - A missing scheme falls back to the caller's default (`http` for HTTP
//!   callers, `ws` for WebSocket callers).
//! - Ports must be in 1..=65535.
//!
//! Only `http`, `https`, `ws` and `wss` are accepted; the WebSocket client
//! additionally rejects the non-`ws` schemes at connect time.

use crate::error::{WebError, WebResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: String,
    pub hash: String,
}

impl Url {
    /// Parse with `http` as the fallback scheme.
    pub fn parse(text: &str) -> WebResult<Url> {
        Self::parse_with_default(text, "http")
    }

    /// Parse with an explicit fallback scheme (`ws` for WebSocket callers).
    pub fn parse_with_default(text: &str, default_scheme: &str) -> WebResult<Url> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WebError::BadArgs("empty url".into()));
        }

        let (scheme, rest) = match text.find("://") {
            Some(idx) => {
                let s = &text[..idx];
                if !matches!(s, "http" | "https" | "ws" | "wss") {
                    return Err(WebError::BadArgs(format!("unsupported scheme: {}", s)));
                }
                (s.to_string(), &text[idx + 3..])
            }
            None => (default_scheme.to_string(), text),
        };

        let secure = scheme == "https" || scheme == "wss";
        let default_port: u16 = if secure { 443 } else { 80 };

        let mut host = String::new();
        let mut port_text = String::new();
        let mut cursor = 0;
        let bytes = rest.as_bytes();

        if bytes.first() == Some(&b'[') {
            // IPv6 literal: [addr]:port
            let close = rest
                .find(']')
                .ok_or_else(|| WebError::BadArgs("unterminated ipv6 literal".into()))?;
            host = rest[1..close].to_string();
            cursor = close + 1;
            if bytes.get(cursor) == Some(&b':') {
                cursor += 1;
                while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
                    port_text.push(bytes[cursor] as char);
                    cursor += 1;
                }
            }
        } else {
            while cursor < bytes.len() && !matches!(bytes[cursor], b':' | b'/' | b'?' | b'#') {
                cursor += 1;
            }
            let head = &rest[..cursor];
            if bytes.get(cursor) == Some(&b':') {
                host = head.to_string();
                cursor += 1;
                while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
                    port_text.push(bytes[cursor] as char);
                    cursor += 1;
                }
            } else if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
                // "port/path" shorthand: all-digit authority is a port
                port_text = head.to_string();
            } else {
                host = head.to_string();
            }
        }

        let port = if port_text.is_empty() {
            default_port
        } else {
            let p: u32 = port_text
                .parse()
                .map_err(|_| WebError::BadArgs(format!("bad port: {}", port_text)))?;
            if p == 0 || p > 65_535 {
                return Err(WebError::BadArgs(format!("port out of range: {}", p)));
            }
            p as u16
        };

        let tail = &rest[cursor..];
        let (path_part, query, hash) = split_tail(tail)?;

        Ok(Url {
            scheme,
            host,
            port,
            path: path_part.to_string(),
            query: query.to_string(),
            hash: hash.to_string(),
        })
    }

    pub fn secure(&self) -> bool {
        self.scheme == "https" || self.scheme == "wss"
    }

    /// The host with the client-side `localhost` default applied.
    pub fn host_or_localhost(&self) -> &str {
        if self.host.is_empty() {
            "localhost"
        } else {
            &self.host
        }
    }

    /// Path plus query, as written on a request line. An empty path is
    /// emitted as `/`.
    pub fn request_target(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        if self.query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, self.query)
        }
    }
}

fn split_tail(tail: &str) -> WebResult<(&str, &str, &str)> {
    let (before_hash, hash) = match tail.find('#') {
        Some(idx) => (&tail[..idx], &tail[idx + 1..]),
        None => (tail, ""),
    };
    let (path, query) = match before_hash.find('?') {
        Some(idx) => (&before_hash[..idx], &before_hash[idx + 1..]),
        None => (before_hash, ""),
    };
    if !path.is_empty() && !path.starts_with('/') {
        return Err(WebError::BadArgs(format!("bad path: {}", path)));
    }
    Ok((path, query, hash))
}

/// Reject request paths carrying raw control bytes or `%`-escapes that
/// decode to one.
pub fn validate_path(path: &str) -> WebResult<()> {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < 0x20 || b == 0x7f {
            return Err(WebError::BadArgs("control character in path".into()));
        }
        if b == b'%' {
            let decoded = hex_pair(bytes.get(i + 1).copied(), bytes.get(i + 2).copied())
                .ok_or_else(|| WebError::BadArgs("bad escape in path".into()))?;
            if decoded < 0x20 || decoded == 0x7f {
                return Err(WebError::BadArgs("escaped control character in path".into()));
            }
            i += 3;
            continue;
        }
        i += 1;
    }
    Ok(())
}

/// Collapse `./`, `../` and redundant `/` segments. The result always
/// starts with `/`. Attempts to climb above the root are rejected.
pub fn normalize_path(path: &str) -> WebResult<String> {
    if !path.starts_with('/') {
        return Err(WebError::BadArgs(format!("path must be absolute: {}", path)));
    }
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(WebError::BadArgs("path traversal".into()));
                }
            }
            s => segments.push(s),
        }
    }
    let mut out = String::with_capacity(path.len());
    out.push('/');
    out.push_str(&segments.join("/"));
    if trailing_slash && out.len() > 1 {
        out.push('/');
    }
    Ok(out)
}

/// Percent-decode, with `+` left alone (query callers convert it first).
pub fn decode_percent(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(b) = hex_pair(bytes.get(i + 1).copied(), bytes.get(i + 2).copied()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `a=b&c=d` pairs, percent-decoding names and values. Used for both
/// query strings and form bodies (`+` means space there).
pub fn parse_query_vars(query: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.find('=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, ""),
        };
        vars.push((
            decode_percent(&name.replace('+', " ")),
            decode_percent(&value.replace('+', " ")),
        ));
    }
    vars
}

fn hex_pair(hi: Option<u8>, lo: Option<u8>) -> Option<u8> {
    let hv = (hi? as char).to_digit(16)?;
    let lv = (lo? as char).to_digit(16)?;
    Some((hv * 16 + lv) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = Url::parse("https://device.local:8443/api/state?x=1#top").unwrap();
        assert_eq!(url.scheme, "https");
        assert_eq!(url.host, "device.local");
        assert_eq!(url.port, 8443);
        assert_eq!(url.path, "/api/state");
        assert_eq!(url.query, "x=1");
        assert_eq!(url.hash, "top");
        assert!(url.secure());
    }

    #[test]
    fn test_default_scheme_and_port() {
        let url = Url::parse("example.com/index.html").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.port, 80);
        assert_eq!(Url::parse("https://example.com").unwrap().port, 443);
        assert_eq!(
            Url::parse_with_default("example.com", "ws").unwrap().scheme,
            "ws"
        );
    }

    #[test]
    fn test_port_shorthand_defaults_host() {
        let url = Url::parse(":8080/status").unwrap();
        assert_eq!(url.host, "");
        assert_eq!(url.host_or_localhost(), "localhost");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/status");

        let url = Url::parse("8080/status").unwrap();
        assert_eq!(url.host_or_localhost(), "localhost");
        assert_eq!(url.port, 8080);
    }

    #[test]
    fn test_ipv6_literal() {
        let url = Url::parse("[::1]:9000/x").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 9000);
        assert_eq!(url.path, "/x");
    }

    #[test]
    fn test_port_range_enforced() {
        assert!(Url::parse(":0/x").is_err());
        assert!(Url::parse(":70000/x").is_err());
        assert!(Url::parse(":65535/x").is_ok());
    }

    #[test]
    fn test_empty_path_and_target() {
        let url = Url::parse("example.com").unwrap();
        assert_eq!(url.path, "");
        assert_eq!(url.request_target(), "/");
        let url = Url::parse("example.com/a?b=c").unwrap();
        assert_eq!(url.request_target(), "/a?b=c");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(Url::parse("ftp://example.com").is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/./b//c").unwrap(), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/docs/").unwrap(), "/docs/");
        assert!(normalize_path("/../etc/passwd").is_err());
        assert!(normalize_path("relative").is_err());
    }

    #[test]
    fn test_validate_path_rejects_controls() {
        assert!(validate_path("/ok/path").is_ok());
        assert!(validate_path("/bad\u{1}path").is_err());
        assert!(validate_path("/bad%00path").is_err());
        assert!(validate_path("/fine%20path").is_ok());
    }

    #[test]
    fn test_query_vars() {
        let vars = parse_query_vars("a=1&b=hello+world&c=%2Fetc");
        assert_eq!(vars[0], ("a".into(), "1".into()));
        assert_eq!(vars[1], ("b".into(), "hello world".into()));
        assert_eq!(vars[2], ("c".into(), "/etc".into()));
    }
}
