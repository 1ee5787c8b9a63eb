//! Host configuration.
//!
//! Deserialized from a JSON file whose top level is either the `web`
//! object itself or a document containing a `web` key. Every knob has a
//! default so a minimal config can be `{}`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{WebError, WebResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebConfig {
    /// Document root for the file handler.
    pub documents: String,

    /// Endpoint URIs to bind (`http://:80`, `https://:443`, `:4100`...).
    pub listen: Vec<String>,

    /// Ordered route table; first match wins.
    pub routes: Vec<RouteConfig>,

    /// Fixed redirects applied before routing.
    pub redirects: Vec<RedirectConfig>,

    /// Directory index file.
    pub index: String,

    /// Cookie defaults.
    pub same_site: String,
    pub http_only: bool,
    pub session_cookie: String,

    /// Upload spool directory and the keep-after-request flag.
    pub upload_dir: String,
    pub keep_uploads: bool,

    pub auth: AuthConfig,

    /// `{username, password, role}` with `password = H(user:realm:pw)`.
    pub users: Vec<UserConfig>,

    /// Role name to inherited roles/abilities; closure computed at load.
    pub roles: HashMap<String, Vec<String>>,

    pub limits: LimitsConfig,

    /// Deadlines in seconds.
    pub timeouts: TimeoutsConfig,

    /// Trace flags: `H`/`B` received headers/body, `h`/`b` transmitted.
    pub show: String,

    /// Reject (rather than drop) request fields absent from a signature.
    pub strict_signatures: bool,

    /// Per-route request/response schemas, keyed by dot-path.
    pub signatures: serde_json::Value,
}

impl Default for WebConfig {
    fn default() -> Self {
        WebConfig {
            documents: ".".to_string(),
            listen: vec!["http://127.0.0.1:4100".to_string()],
            routes: Vec::new(),
            redirects: Vec::new(),
            index: "index.html".to_string(),
            same_site: "Lax".to_string(),
            http_only: true,
            session_cookie: "-etude-session-".to_string(),
            upload_dir: "/tmp".to_string(),
            keep_uploads: false,
            auth: AuthConfig::default(),
            users: Vec::new(),
            roles: HashMap::new(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            show: String::new(),
            strict_signatures: false,
            signatures: serde_json::Value::Null,
        }
    }
}

impl WebConfig {
    /// Load from a JSON file. A top-level `web` key, when present, selects
    /// the sub-tree; otherwise the whole document is the config.
    pub fn from_file(path: impl AsRef<Path>) -> WebResult<WebConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WebError::NotFound(format!("{}: {}", path.display(), e)))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| WebError::BadArgs(format!("{}: {}", path.display(), e)))?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: serde_json::Value) -> WebResult<WebConfig> {
        if let Some(web) = value.get_mut("web") {
            value = web.take();
        }
        serde_json::from_value(value).map_err(|e| WebError::BadArgs(format!("config: {}", e)))
    }

    /// Parsed listen endpoints as `(secure, bind-host, port)`. An empty
    /// host binds every interface; port `0` asks the kernel for an
    /// ephemeral port (client URLs reject it, listeners accept it).
    pub fn endpoints(&self) -> WebResult<Vec<(bool, String, u16)>> {
        let mut out = Vec::new();
        for endpoint in &self.listen {
            out.push(parse_endpoint(endpoint)?);
        }
        Ok(out)
    }

    pub fn show_rx_headers(&self) -> bool {
        self.show.contains('H')
    }

    pub fn show_rx_body(&self) -> bool {
        self.show.contains('B')
    }

    pub fn show_tx_headers(&self) -> bool {
        self.show.contains('h')
    }

    pub fn show_tx_body(&self) -> bool {
        self.show.contains('b')
    }
}

/// Parse one listen endpoint: `[scheme://][host][:port]`.
fn parse_endpoint(text: &str) -> WebResult<(bool, String, u16)> {
    let (scheme, rest) = match text.find("://") {
        Some(idx) => (&text[..idx], &text[idx + 3..]),
        None => ("http", text),
    };
    let secure = match scheme {
        "http" | "ws" => false,
        "https" | "wss" => true,
        other => return Err(WebError::BadArgs(format!("listen scheme: {}", other))),
    };
    let (host, port_text) = match rest.rfind(':') {
        Some(idx) if !rest[idx + 1..].contains(']') => (&rest[..idx], &rest[idx + 1..]),
        _ => (rest, ""),
    };
    let port: u16 = if port_text.is_empty() {
        if secure { 443 } else { 80 }
    } else {
        port_text
            .parse()
            .map_err(|_| WebError::BadArgs(format!("listen port: {}", port_text)))?
    };
    let host = host.trim_matches(|c| c == '[' || c == ']');
    let host = if host.is_empty() || host == "*" {
        "0.0.0.0".to_string()
    } else {
        host.to_string()
    };
    Ok((secure, host, port))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    /// URL prefix, or exact path when the pattern ends in `/`.
    #[serde(rename = "match")]
    pub pattern: String,

    /// Permitted methods; empty accepts all.
    pub methods: Vec<String>,

    /// `file`, `action`, `upload`, `ws`, or a custom registered name.
    pub handler: String,

    /// Role required to use the route; implies authentication.
    pub role: Option<String>,

    /// Fixed redirect target instead of a handler.
    pub redirect: Option<String>,

    /// Prefix stripped from the path before handling.
    pub trim: Option<String>,

    pub xsrf: bool,
    pub validate: bool,

    /// Stream the body to the handler instead of buffering it.
    pub stream: bool,

    /// Serve pre-compressed `.br`/`.gz` variants when acceptable.
    pub compressed: bool,

    pub cache_max_age: Option<u64>,
    pub cache_directives: Option<String>,

    /// Extensions the cache directives are restricted to.
    pub extensions: Vec<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        RouteConfig {
            pattern: "/".to_string(),
            methods: Vec::new(),
            handler: "file".to_string(),
            role: None,
            redirect: None,
            trim: None,
            xsrf: false,
            validate: false,
            stream: false,
            compressed: false,
            cache_max_age: None,
            cache_directives: None,
            extensions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectConfig {
    pub from: String,
    pub to: String,
    pub status: u16,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        RedirectConfig {
            from: String::new(),
            to: String::new(),
            status: 301,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub realm: String,

    /// Digest hash: `MD5` or `SHA-256`.
    pub algorithm: String,

    /// `basic`, `digest`, or `none`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Nonce lifetime in seconds.
    pub digest_timeout: u64,

    /// Refuse Basic credentials on cleartext connections.
    pub require_tls_for_basic: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            realm: "etude".to_string(),
            algorithm: "SHA-256".to_string(),
            kind: "digest".to_string(),
            digest_timeout: 300,
            require_tls_for_basic: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserConfig {
    pub username: String,
    /// Hex of `H(username:realm:password)`.
    pub password: String,
    pub role: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            username: String::new(),
            password: String::new(),
            role: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    /// Largest buffered response body on the client side.
    pub max_buffer: usize,
    /// Largest request header block.
    pub max_header: usize,
    pub max_connections: usize,
    /// Largest buffered request body.
    pub max_body: usize,
    /// Requests served per keep-alive connection.
    pub max_requests: usize,
    pub max_sessions: usize,
    /// Largest single upload file.
    pub max_upload: u64,
    /// Upload parts accepted per request.
    pub max_uploads: usize,
    pub web_sockets_max_message: usize,
    pub web_sockets_max_frame: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_buffer: 1024 * 1024,
            max_header: 10 * 1024,
            max_connections: 100,
            max_body: 1024 * 1024,
            max_requests: 100,
            max_sessions: 100,
            max_upload: 20 * 1024 * 1024,
            max_uploads: 16,
            web_sockets_max_message: 256 * 1024,
            web_sockets_max_frame: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutsConfig {
    /// Seconds to receive the full header block.
    pub parse: u64,
    /// Seconds a connection may sit idle inside a request.
    pub inactivity: u64,
    /// Seconds for a whole request.
    pub request: u64,
    /// Session inactivity lifespan in seconds.
    pub session: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            parse: 5,
            inactivity: 30,
            request: 120,
            session: 1800,
        }
    }
}
