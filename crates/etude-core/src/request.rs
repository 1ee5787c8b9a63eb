//! Server-side request object.
//!
//! A `WebRequest` is exclusively owned by its handler fiber from accept to
//! finalize. It carries the parsed request, the receive-side framing state
//! (content-length accounting or the chunked decoder), and the response
//! write path with its hot flags (`chunked_tx`, `wrote_headers`,
//! `finalized`, `close_after`).

use std::rc::Rc;
use std::time::SystemTime;

use crate::auth;
use crate::buf::NetBuf;
use crate::error::{WebError, WebResult};
use crate::fiber::Deadline;
use crate::http::{
    self, ChunkDecoder, HeaderMap, Method, Protocol, RangeSpec, bodyless_status, chunked,
    status_text,
};
use crate::net::{self, Stream};
use crate::server::WebHost;
use crate::session::{cookie_value, make_cookie};
use crate::upload::Upload;
use crate::url;

const SERVER_NAME: &str = concat!("etude/", env!("CARGO_PKG_VERSION"));
const WRITE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct RequestFlags {
    pub chunked_rx: bool,
    pub chunked_tx: bool,
    pub wrote_headers: bool,
    pub finalized: bool,
    pub upgraded: bool,
    pub close_after: bool,
    pub secure: bool,
    pub http10: bool,
    pub form_body: bool,
    pub json_body: bool,
}

pub struct WebRequest {
    pub(crate) host: Rc<WebHost>,
    pub(crate) stream: Option<Stream>,
    pub(crate) rx: NetBuf,

    pub method: Method,
    pub protocol: Protocol,
    /// Raw request target as received.
    pub url: String,
    /// Normalized path.
    pub path: String,
    pub query: String,
    pub hash: String,
    pub headers: HeaderMap,

    /// Query plus form variables, in arrival order.
    pub vars: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub origin: Option<String>,
    pub host_header: Option<String>,

    /// Conditional-request fields.
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
    pub if_match: Vec<String>,
    pub if_none_match: Vec<String>,
    pub if_range: Option<String>,
    pub ranges: Vec<RangeSpec>,

    pub flags: RequestFlags,

    /// Buffered request body (non-stream routes).
    pub body: Vec<u8>,
    pub uploads: Vec<Upload>,

    /// Index of the selected route in the host table.
    pub route: Option<usize>,
    pub signature: Option<String>,
    pub username: Option<String>,
    pub session_id: Option<String>,

    pub status: u16,
    pub(crate) resp_headers: HeaderMap,
    tx_content_length: Option<u64>,
    tx_written: u64,

    rx_remaining: u64,
    chunk_decoder: Option<ChunkDecoder>,
    rx_eof: bool,

    pub(crate) request_deadline: Deadline,
    inactivity_secs: u64,
}

impl WebRequest {
    /// Build a request from a parsed first line and header block. `rx`
    /// holds any bytes read past the blank line. Construction cannot
    /// fail; `prepare` finishes the fallible parsing so errors can still
    /// be answered with a response.
    pub(crate) fn new(
        host: Rc<WebHost>,
        stream: Stream,
        rx: NetBuf,
        method: Method,
        target: &str,
        protocol: Protocol,
        headers: HeaderMap,
    ) -> WebRequest {
        let secure = stream.is_tls();
        WebRequest {
            host: host.clone(),
            stream: Some(stream),
            rx,
            method,
            protocol,
            url: target.to_string(),
            path: String::new(),
            query: String::new(),
            hash: String::new(),
            headers,
            vars: Vec::new(),
            content_type: None,
            origin: None,
            host_header: None,
            if_modified_since: None,
            if_unmodified_since: None,
            if_match: Vec::new(),
            if_none_match: Vec::new(),
            if_range: None,
            ranges: Vec::new(),
            flags: RequestFlags {
                secure,
                http10: protocol == Protocol::Http10,
                ..Default::default()
            },
            body: Vec::new(),
            uploads: Vec::new(),
            route: None,
            signature: None,
            username: None,
            session_id: None,
            status: 200,
            resp_headers: HeaderMap::new(),
            tx_content_length: None,
            tx_written: 0,
            rx_remaining: 0,
            chunk_decoder: None,
            rx_eof: false,
            request_deadline: Deadline::in_secs(host.config.timeouts.request),
            inactivity_secs: host.config.timeouts.inactivity,
        }
    }

    /// Normalize the target and digest the headers into typed fields.
    pub(crate) fn prepare(&mut self) -> WebResult<()> {
        let (raw_path, query, hash) = split_target(&self.url);
        url::validate_path(raw_path)?;
        self.query = query.to_string();
        self.hash = hash.to_string();
        self.path = url::normalize_path(&url::decode_percent(raw_path))?;

        self.vars = url::parse_query_vars(&self.query);

        self.content_type = self.headers.get("Content-Type").map(str::to_string);
        self.origin = self.headers.get("Origin").map(str::to_string);
        self.host_header = self.headers.get("Host").map(str::to_string);

        if let Some(ct) = &self.content_type {
            let essence = ct.split(';').next().unwrap_or("").trim();
            self.flags.form_body = essence.eq_ignore_ascii_case("application/x-www-form-urlencoded");
            self.flags.json_body = essence.eq_ignore_ascii_case("application/json");
        }

        // Body framing: chunked wins over a content length.
        if let Some(te) = self.headers.get("Transfer-Encoding") {
            if http::value_has_token(te, "chunked") {
                self.flags.chunked_rx = true;
                self.chunk_decoder = Some(ChunkDecoder::new());
            } else {
                return Err(WebError::BadArgs(format!("unsupported transfer-encoding: {}", te)));
            }
        } else if let Some(cl) = self.headers.get("Content-Length") {
            self.rx_remaining = cl
                .trim()
                .parse()
                .map_err(|_| WebError::BadArgs(format!("bad content-length: {}", cl)))?;
        }
        if !self.flags.chunked_rx && self.rx_remaining == 0 {
            self.rx_eof = true;
        }

        // Keep-alive policy.
        let mut keep_alive = self.protocol.default_keep_alive();
        if let Some(connection) = self.headers.get("Connection") {
            if http::value_has_token(connection, "close") {
                keep_alive = false;
            } else if http::value_has_token(connection, "keep-alive") {
                keep_alive = true;
            }
        }
        self.flags.close_after = !keep_alive;

        // Conditional-request fields.
        if let Some(value) = self.headers.get("If-Modified-Since") {
            self.if_modified_since = httpdate::parse_http_date(value).ok();
        }
        if let Some(value) = self.headers.get("If-Unmodified-Since") {
            self.if_unmodified_since = httpdate::parse_http_date(value).ok();
        }
        if let Some(value) = self.headers.get("If-Match") {
            self.if_match = http::parse_etag_list(value);
        }
        if let Some(value) = self.headers.get("If-None-Match") {
            self.if_none_match = http::parse_etag_list(value);
        }
        self.if_range = self.headers.get("If-Range").map(str::to_string);
        if let Some(value) = self.headers.get("Range") {
            self.ranges = http::parse_range_header(value).unwrap_or_default();
        }

        if let Some(cookie) = self.headers.get("Cookie") {
            if let Some(sid) = cookie_value(cookie, &self.host.config.session_cookie) {
                // Validated against the store on first use.
                self.session_id = Some(sid.to_string());
            }
        }
        Ok(())
    }

    /// True when the client asked to switch protocols to WebSocket.
    pub fn is_upgrade_request(&self) -> bool {
        self.headers
            .get("Connection")
            .is_some_and(|v| http::value_has_token(v, "upgrade"))
            && self
                .headers
                .get("Upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Effective deadline for the next I/O: the request deadline capped by
    /// the inactivity window, which restarts on each successful transfer.
    pub(crate) fn io_deadline(&self) -> Deadline {
        self.request_deadline
            .min(Deadline::in_secs(self.inactivity_secs))
    }

    fn stream_mut(&mut self) -> WebResult<&mut Stream> {
        self.stream
            .as_mut()
            .ok_or_else(|| WebError::BadState("connection was taken over".into()))
    }

    // ── Request body read path ──

    /// Bytes still expected in the current framing unit: the remaining
    /// content length, or the remaining bytes of the current chunk.
    pub fn rx_remaining(&self) -> u64 {
        match &self.chunk_decoder {
            Some(decoder) => decoder.remaining(),
            None => self.rx_remaining,
        }
    }

    pub fn body_complete(&self) -> bool {
        self.rx_eof
    }

    /// Read the next piece of decoded body data. `Ok(None)` at end of
    /// body. A peer close mid-body is a network error, not an HTTP error.
    pub async fn read_body_chunk(&mut self) -> WebResult<Option<Vec<u8>>> {
        if self.rx_eof {
            return Ok(None);
        }
        loop {
            if self.chunk_decoder.is_some() {
                let mut out = Vec::new();
                {
                    let decoder = self.chunk_decoder.as_mut().unwrap();
                    decoder.decode(&mut self.rx, &mut out)?;
                    if decoder.is_eof() {
                        self.rx_eof = true;
                    }
                }
                if !out.is_empty() {
                    return Ok(Some(out));
                }
                if self.rx_eof {
                    return Ok(None);
                }
            } else {
                if self.rx_remaining == 0 {
                    self.rx_eof = true;
                    return Ok(None);
                }
                if !self.rx.is_empty() {
                    let take = (self.rx_remaining.min(self.rx.len() as u64)) as usize;
                    let data = self.rx.consume(take);
                    self.rx_remaining -= take as u64;
                    if self.rx_remaining == 0 {
                        self.rx_eof = true;
                    }
                    return Ok(Some(data.to_vec()));
                }
            }
            let deadline = self.io_deadline();
            let stream = self.stream
                .as_mut()
                .ok_or_else(|| WebError::BadState("connection was taken over".into()))?;
            let n = net::read_into(stream, &mut self.rx, deadline).await?;
            if n == 0 {
                return Err(WebError::CantRead("connection closed mid-body".into()));
            }
        }
    }

    /// Buffer the whole request body, enforcing `limits.maxBody`, and
    /// parse form variables / uploads according to the content type.
    pub async fn read_body(&mut self) -> WebResult<()> {
        if let Some(boundary) = self
            .content_type
            .as_deref()
            .and_then(crate::upload::multipart_boundary)
        {
            // Multipart bodies spool to temp files instead of buffering.
            return crate::upload::parse(self, &boundary).await;
        }
        let max_body = self.host.config.limits.max_body;
        while let Some(piece) = self.read_body_chunk().await? {
            if self.body.len() + piece.len() > max_body {
                return Err(WebError::Memory("request body exceeds maxBody".into()));
            }
            self.body.extend_from_slice(&piece);
        }
        if self.host.config.show_rx_body() {
            tracing::debug!(bytes = self.body.len(), "request body");
        }
        if self.flags.form_body {
            let text = String::from_utf8_lossy(&self.body).into_owned();
            self.vars.extend(url::parse_query_vars(&text));
        }
        Ok(())
    }

    /// Discard whatever is left of the request body so the connection can
    /// be reused. Gives up (and forces close) past the body limit.
    pub(crate) async fn drain_body(&mut self) -> WebResult<()> {
        let mut drained: usize = 0;
        let max = self.host.config.limits.max_buffer;
        while !self.rx_eof {
            match self.read_body_chunk().await? {
                None => break,
                Some(piece) => {
                    drained += piece.len();
                    if drained > max {
                        self.flags.close_after = true;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Request variable (query or form), first occurrence.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the buffered body as JSON.
    pub fn json_body(&self) -> WebResult<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| WebError::BadArgs(format!("bad json body: {}", e)))
    }

    // ── Response write path ──

    pub fn set_status(&mut self, status: u16) {
        if !self.flags.wrote_headers {
            self.status = status;
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.resp_headers.set(name, value);
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.resp_headers.add(name, value);
    }

    pub fn set_content_length(&mut self, length: u64) {
        if !self.flags.wrote_headers {
            self.tx_content_length = Some(length);
        }
    }

    pub fn set_content_type(&mut self, mime: &str) {
        self.resp_headers.set("Content-Type", mime);
    }

    /// Emit the response head. Called implicitly by the first `write`.
    pub async fn write_headers(&mut self) -> WebResult<()> {
        if self.flags.wrote_headers {
            return Ok(());
        }
        self.flags.wrote_headers = true;

        let bodyless = bodyless_status(self.status);
        if !bodyless {
            if !self.resp_headers.contains("Content-Type") {
                self.resp_headers.set("Content-Type", "text/html");
            }
            match self.tx_content_length {
                Some(length) => {
                    self.resp_headers.set("Content-Length", length.to_string());
                }
                None => {
                    if self.flags.http10 {
                        // No chunking on 1.0: delimit the body by close.
                        self.flags.close_after = true;
                    } else {
                        self.flags.chunked_tx = true;
                        self.resp_headers.set("Transfer-Encoding", "chunked");
                    }
                }
            }
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.protocol.as_str(),
                self.status,
                status_text(self.status)
            )
            .as_bytes(),
        );
        let mut fixed = HeaderMap::new();
        fixed.set("Date", httpdate::fmt_http_date(SystemTime::now()));
        fixed.set("Server", SERVER_NAME);
        if self.flags.close_after {
            fixed.set("Connection", "close");
        } else if self.flags.http10 {
            // 1.0 keep-alive is opt-in and must be confirmed.
            fixed.set("Connection", "keep-alive");
        }
        fixed.serialize(&mut head);
        self.resp_headers.serialize(&mut head);
        head.extend_from_slice(b"\r\n");

        if self.host.config.show_tx_headers() {
            tracing::debug!(head = %String::from_utf8_lossy(&head), "response headers");
        }
        let deadline = self.io_deadline();
        net::write_all(self.stream_mut()?, &head, deadline).await
    }

    /// Write body data, emitting headers first if needed. HEAD requests
    /// and bodyless statuses account the bytes but put nothing on the
    /// wire.
    pub async fn write(&mut self, data: &[u8]) -> WebResult<()> {
        if self.flags.finalized {
            return Err(WebError::BadState("write after finalize".into()));
        }
        self.write_headers().await?;
        self.tx_written += data.len() as u64;
        if self.method == Method::Head || bodyless_status(self.status) || data.is_empty() {
            return Ok(());
        }
        if self.host.config.show_tx_body() {
            tracing::debug!(bytes = data.len(), "response body");
        }
        let deadline = self.io_deadline();
        if self.flags.chunked_tx {
            for piece in data.chunks(WRITE_CHUNK) {
                let mut framed = Vec::with_capacity(piece.len() + 16);
                chunked::encode_chunk(piece, &mut framed);
                net::write_all(self.stream_mut()?, &framed, deadline).await?;
            }
            Ok(())
        } else {
            net::write_all(self.stream_mut()?, data, deadline).await
        }
    }

    /// Set the content length and write the whole body in one call.
    pub async fn write_body(&mut self, data: &[u8]) -> WebResult<()> {
        self.set_content_length(data.len() as u64);
        self.write(data).await
    }

    /// Serialize a value as the JSON response body.
    pub async fn write_json(&mut self, value: &serde_json::Value) -> WebResult<()> {
        let body = serde_json::to_vec(value)
            .map_err(|e| WebError::CantComplete(format!("json: {}", e)))?;
        self.set_content_type("application/json");
        self.write_body(&body).await
    }

    /// Complete the response. Idempotent: a second call is a no-op that
    /// returns `Ok(0)`.
    pub async fn finalize(&mut self) -> WebResult<u64> {
        if self.flags.finalized {
            return Ok(0);
        }
        if !self.flags.wrote_headers {
            if self.tx_content_length.is_none() && !bodyless_status(self.status) {
                self.tx_content_length = Some(0);
            }
            self.write_headers().await?;
        }
        self.flags.finalized = true;
        let deadline = self.io_deadline();
        if self.flags.chunked_tx {
            let mut terminator = Vec::with_capacity(8);
            chunked::encode_final(&mut terminator);
            net::write_all(self.stream_mut()?, &terminator, deadline).await?;
        }
        net::flush(self.stream_mut()?, deadline).await?;
        Ok(self.tx_written)
    }

    /// Emit a redirect and finish the response.
    pub async fn redirect(&mut self, status: u16, location: &str) -> WebResult<()> {
        self.set_status(status);
        self.set_header("Location", location);
        self.set_content_length(0);
        self.finalize().await.map(|_| ())
    }

    /// Emit an error response: plain-text status phrase body unless the
    /// handler already wrote its own. After headers are out, the
    /// connection is closed instead.
    pub async fn error_response(&mut self, status: u16, message: &str) -> WebResult<()> {
        if self.flags.wrote_headers {
            self.flags.close_after = true;
            return self.finalize().await.map(|_| ());
        }
        self.status = status;
        let body = if message.is_empty() {
            format!("{}\r\n", status_text(status))
        } else {
            format!("{}\r\n", message)
        };
        self.set_content_type("text/plain");
        if status == 429 || status == 503 {
            self.set_header("Retry-After", "5");
        }
        self.write_body(body.as_bytes()).await?;
        self.finalize().await.map(|_| ())
    }

    // ── Sessions, cookies, XSRF ──

    /// The request's session id, validating it against the store.
    /// With `create` set, a missing or expired session is replaced and
    /// its cookie issued.
    pub fn session(&mut self, create: bool) -> Option<String> {
        let mut sessions = self.host.sessions.borrow_mut();
        if let Some(sid) = &self.session_id {
            if sessions.get(sid).is_some() {
                return Some(sid.clone());
            }
        }
        if !create {
            return None;
        }
        let sid = sessions.create(self.host.config.timeouts.session);
        drop(sessions);
        self.issue_session_cookie(&sid);
        self.session_id = Some(sid.clone());
        Some(sid)
    }

    fn issue_session_cookie(&mut self, sid: &str) {
        let config = &self.host.config;
        let cookie = make_cookie(
            &config.session_cookie,
            sid,
            config.timeouts.session,
            config.http_only,
            self.flags.secure,
            Some(config.same_site.as_str()),
        );
        self.resp_headers.add("Set-Cookie", cookie);
    }

    pub fn session_var(&mut self, name: &str) -> Option<String> {
        let sid = self.session(false)?;
        let mut sessions = self.host.sessions.borrow_mut();
        sessions.get(&sid)?.get(name).map(str::to_string)
    }

    pub fn set_session_var(&mut self, name: &str, value: &str) -> WebResult<()> {
        let sid = self
            .session(true)
            .ok_or_else(|| WebError::BadState("no session".into()))?;
        let mut sessions = self.host.sessions.borrow_mut();
        if let Some(session) = sessions.get(&sid) {
            session.set(name, value);
        }
        Ok(())
    }

    /// Verify credentials against the user table and establish a session.
    pub fn login(&mut self, username: &str, password: &str) -> bool {
        let Some(user) = self.host.users.get(username) else {
            return false;
        };
        let presented = auth::password_digest(
            self.host.auth_algorithm,
            username,
            &self.host.config.auth.realm,
            password,
        );
        if !crate::session::constant_time_eq(&presented, &user.password) {
            return false;
        }
        // A fresh session on every login: never reuse a pre-login id.
        self.logout();
        if self.set_session_var("username", username).is_err() {
            return false;
        }
        self.username = Some(username.to_string());
        self.add_security_token();
        true
    }

    /// Destroy the session and clear its cookie.
    pub fn logout(&mut self) {
        if let Some(sid) = self.session_id.take() {
            self.host.sessions.borrow_mut().remove(&sid);
        }
        self.username = None;
    }

    /// Issue (or re-emit) the per-session XSRF token so the client can
    /// echo it on state-changing requests.
    pub fn add_security_token(&mut self) -> Option<String> {
        let sid = self.session(true)?;
        let mut sessions = self.host.sessions.borrow_mut();
        let token = sessions.get(&sid)?.security_token().to_string();
        drop(sessions);
        self.set_header("X-XSRF-TOKEN", token.clone());
        Some(token)
    }

    /// Check the echoed XSRF token from the header or the `-xsrf-` form
    /// field against the session-held token.
    pub fn check_security_token(&mut self) -> bool {
        let Some(sid) = self.session(false) else {
            return false;
        };
        let mut sessions = self.host.sessions.borrow_mut();
        let Some(held) = sessions
            .get(&sid)
            .and_then(|s| s.peek_security_token())
            .map(str::to_string)
        else {
            return false;
        };
        drop(sessions);
        let presented = self
            .headers
            .get("X-XSRF-TOKEN")
            .map(str::to_string)
            .or_else(|| self.var("-xsrf-").map(str::to_string));
        match presented {
            Some(token) => crate::session::constant_time_eq(&held, &token),
            None => false,
        }
    }

    // ── Upgrade support ──

    /// Hand the transport to a protocol that takes over the connection
    /// (WebSocket). The request can no longer write HTTP after this.
    pub(crate) fn take_stream(&mut self) -> WebResult<(Stream, NetBuf)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| WebError::BadState("stream already taken".into()))?;
        self.flags.upgraded = true;
        self.flags.close_after = true;
        Ok((stream, std::mem::take(&mut self.rx)))
    }

    /// Write raw bytes on the transport, bypassing HTTP framing. Used for
    /// the `101 Switching Protocols` head.
    pub(crate) async fn write_raw(&mut self, data: &[u8]) -> WebResult<()> {
        let deadline = self.io_deadline();
        net::write_all(self.stream_mut()?, data, deadline).await?;
        net::flush(self.stream_mut()?, deadline).await
    }

    /// Tear down for the connection loop: returns the transport for reuse
    /// when the request ended cleanly and keep-alive applies.
    pub(crate) fn into_parts(self) -> (Option<Stream>, NetBuf, bool) {
        let keep = !self.flags.close_after && !self.flags.upgraded;
        (self.stream, self.rx, keep)
    }
}

/// Split a request target into path, query and fragment.
fn split_target(target: &str) -> (&str, &str, &str) {
    let (before_hash, hash) = match target.find('#') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    };
    match before_hash.find('?') {
        Some(idx) => (&before_hash[..idx], &before_hash[idx + 1..], hash),
        None => (before_hash, "", hash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("/a/b?x=1#frag"), ("/a/b", "x=1", "frag"));
        assert_eq!(split_target("/a"), ("/a", "", ""));
        assert_eq!(split_target("/a?x"), ("/a", "x", ""));
    }
}
