//! HTTP client engine.
//!
//! Contract, in order of use: `start -> set_header* -> write_headers ->
//! write* -> finalize -> status/header/response|read_chunk`. `start`
//! keeps the previous socket iff the `(scheme, host, port)` triple
//! matches, the socket has not seen EOF, and the prior response body was
//! fully drained. Redirects are the caller's business; the client only
//! exposes `Location`. A `401` with credentials configured is retried
//! once by the `fetch` wrapper.

use std::rc::Rc;
use std::pin::Pin;
use std::future::Future;

use crate::auth::{self, Challenge, DigestAlgorithm};
use crate::buf::NetBuf;
use crate::error::{WebError, WebResult};
use crate::fiber::Deadline;
use crate::http::{
    self, ChunkDecoder, HeaderMap, Method, Protocol, bodyless_status, chunked,
};
use crate::net::{self, AsyncStream, Stream};
use crate::url::Url;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BUF_LIMIT: usize = 1024 * 1024;

/// Hook that upgrades a dialed TCP stream to TLS (external transport).
pub type TlsConnector = Rc<
    dyn Fn(
        tokio::net::TcpStream,
        String,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn AsyncStream>>>>>,
>;

#[derive(Debug, Clone)]
struct StoredChallenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
}

/// TLS knobs held for the external transport; opaque to the engine.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub verify_peer: bool,
    pub verify_issuer: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
    pub ciphers: Option<String>,
}

pub struct WebClient {
    stream: Option<Stream>,
    scheme: String,
    host: String,
    port: u16,
    rx: NetBuf,

    method: Method,
    target: String,
    req_headers: HeaderMap,
    tx_content_length: Option<u64>,
    chunked_tx: bool,
    wrote_headers: bool,
    finalized: bool,

    status: u16,
    resp_headers: HeaderMap,
    chunk_decoder: Option<ChunkDecoder>,
    rx_remaining: u64,
    read_to_eof: bool,
    rx_eof: bool,
    keep_alive: bool,
    body: Vec<u8>,
    body_buffered: bool,

    timeout_ms: u64,
    buf_limit: usize,
    credentials: Option<(String, String)>,
    digest: Option<StoredChallenge>,
    use_basic: bool,
    nc: u32,

    tls: TlsSettings,
    tls_connector: Option<TlsConnector>,
}

impl Default for WebClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WebClient {
    pub fn new() -> WebClient {
        WebClient {
            stream: None,
            scheme: String::new(),
            host: String::new(),
            port: 0,
            rx: NetBuf::new(),
            method: Method::Get,
            target: String::new(),
            req_headers: HeaderMap::new(),
            tx_content_length: None,
            chunked_tx: false,
            wrote_headers: false,
            finalized: false,
            status: 0,
            resp_headers: HeaderMap::new(),
            chunk_decoder: None,
            rx_remaining: 0,
            read_to_eof: false,
            rx_eof: true,
            keep_alive: false,
            body: Vec::new(),
            body_buffered: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            buf_limit: DEFAULT_BUF_LIMIT,
            credentials: None,
            digest: None,
            use_basic: false,
            nc: 0,
            tls: TlsSettings {
                verify_peer: true,
                verify_issuer: true,
                ..Default::default()
            },
            tls_connector: None,
        }
    }

    pub fn set_timeout_ms(&mut self, ms: u64) {
        self.timeout_ms = ms;
    }

    /// Bound for the buffered response body; streamed reads are
    /// unbounded.
    pub fn set_buf_limit(&mut self, limit: usize) {
        self.buf_limit = limit;
    }

    pub fn set_credentials(&mut self, username: &str, password: &str) {
        self.credentials = Some((username.to_string(), password.to_string()));
    }

    pub fn set_verify(&mut self, peer: bool, issuer: bool) {
        self.tls.verify_peer = peer;
        self.tls.verify_issuer = issuer;
    }

    pub fn set_certs(&mut self, cert: Option<&str>, key: Option<&str>, ca: Option<&str>) {
        self.tls.cert = cert.map(str::to_string);
        self.tls.key = key.map(str::to_string);
        self.tls.ca = ca.map(str::to_string);
    }

    pub fn set_ciphers(&mut self, ciphers: &str) {
        self.tls.ciphers = Some(ciphers.to_string());
    }

    pub fn set_tls_connector(&mut self, connector: TlsConnector) {
        self.tls_connector = Some(connector);
    }

    fn deadline(&self) -> Deadline {
        Deadline::in_ms(self.timeout_ms)
    }

    /// Begin a request, reusing the pooled connection when possible.
    pub async fn start(&mut self, method: Method, url_text: &str) -> WebResult<()> {
        let url = Url::parse(url_text)?;
        let host = url.host_or_localhost().to_string();
        let reusable = self.stream.is_some()
            && self.scheme == url.scheme
            && self.host == host
            && self.port == url.port
            && self.rx_eof
            && self.keep_alive;
        if !reusable {
            if let Some(mut old) = self.stream.take() {
                old.close().await;
            }
            self.rx.clear();
        }

        self.scheme = url.scheme.clone();
        self.host = host;
        self.port = url.port;
        self.method = method;
        self.target = url.request_target();

        // Reset per-request state.
        self.req_headers.clear();
        self.tx_content_length = None;
        self.chunked_tx = false;
        self.wrote_headers = false;
        self.finalized = false;
        self.status = 0;
        self.resp_headers.clear();
        self.chunk_decoder = None;
        self.rx_remaining = 0;
        self.read_to_eof = false;
        self.rx_eof = false;
        self.keep_alive = false;
        self.body.clear();
        self.body_buffered = false;

        if self.stream.is_none() {
            let deadline = self.deadline();
            let sock = net::connect(&self.host, self.port, deadline).await?;
            let stream = if url.secure() {
                let Some(connector) = self.tls_connector.clone() else {
                    return Err(WebError::CantConnect(
                        "https url without a TLS transport".into(),
                    ));
                };
                let Stream::Tcp(tcp) = sock else {
                    return Err(WebError::BadState("expected tcp stream".into()));
                };
                let tls = connector(tcp, self.host.clone())
                    .await
                    .map_err(|e| WebError::CantConnect(format!("tls: {}", e)))?;
                Stream::Tls(tls)
            } else {
                sock
            };
            self.stream = Some(stream);
        }

        // Credentials learned from earlier challenges apply up front.
        if let Some((username, password)) = self.credentials.clone() {
            if self.use_basic {
                self.req_headers
                    .set("Authorization", auth::basic_authorization(&username, &password));
            } else if let Some(challenge) = self.digest.clone() {
                self.nc += 1;
                let value = auth::digest_authorization(
                    &challenge.realm,
                    &challenge.nonce,
                    challenge.qop.as_deref(),
                    challenge.opaque.as_deref(),
                    challenge.algorithm,
                    &username,
                    &password,
                    self.method.as_str(),
                    &self.target,
                    self.nc,
                    &auth::make_cnonce(),
                );
                self.req_headers.set("Authorization", value);
            }
        }
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.req_headers.set(name, value);
    }

    pub fn set_content_length(&mut self, length: u64) {
        if !self.wrote_headers {
            self.tx_content_length = Some(length);
        }
    }

    fn stream_mut(&mut self) -> WebResult<&mut Stream> {
        self.stream
            .as_mut()
            .ok_or_else(|| WebError::BadState("client not started".into()))
    }

    /// Emit the request line and headers.
    pub async fn write_headers(&mut self) -> WebResult<()> {
        if self.wrote_headers {
            return Ok(());
        }
        self.wrote_headers = true;

        if !self.req_headers.contains("Host") {
            let default_port = if self.scheme == "https" || self.scheme == "wss" {
                443
            } else {
                80
            };
            let value = if self.port == default_port {
                self.host.clone()
            } else {
                format!("{}:{}", self.host, self.port)
            };
            self.req_headers.set("Host", value);
        }

        match self.tx_content_length {
            Some(length) => {
                self.req_headers.set("Content-Length", length.to_string());
            }
            None => match self.method {
                // No body expected: a zero content length closes the
                // question for the server.
                Method::Get | Method::Head | Method::Options | Method::Trace | Method::Delete => {
                    self.req_headers.set("Content-Length", "0");
                }
                _ => {
                    self.chunked_tx = true;
                    self.req_headers.set("Transfer-Encoding", "chunked");
                }
            },
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.method.as_str(),
                self.target,
                Protocol::Http11.as_str()
            )
            .as_bytes(),
        );
        self.req_headers.serialize(&mut head);
        head.extend_from_slice(b"\r\n");
        let deadline = self.deadline();
        net::write_all(self.stream_mut()?, &head, deadline).await
    }

    /// Write request body data, chunk-framed when no content length was
    /// declared.
    pub async fn write(&mut self, data: &[u8]) -> WebResult<()> {
        if self.finalized {
            return Err(WebError::BadState("write after finalize".into()));
        }
        self.write_headers().await?;
        if data.is_empty() {
            return Ok(());
        }
        let deadline = self.deadline();
        if self.chunked_tx {
            let mut framed = Vec::with_capacity(data.len() + 16);
            chunked::encode_chunk(data, &mut framed);
            net::write_all(self.stream_mut()?, &framed, deadline).await
        } else {
            net::write_all(self.stream_mut()?, data, deadline).await
        }
    }

    /// Terminate the request and read the response head. Returns the
    /// status. Idempotent: a second call just returns the stored status.
    pub async fn finalize(&mut self) -> WebResult<u16> {
        if self.finalized {
            return Ok(self.status);
        }
        self.write_headers().await?;
        let deadline = self.deadline();
        if self.chunked_tx {
            let mut terminator = Vec::with_capacity(8);
            chunked::encode_final(&mut terminator);
            net::write_all(self.stream_mut()?, &terminator, deadline).await?;
        }
        net::flush(self.stream_mut()?, deadline).await?;
        self.finalized = true;
        self.read_response_head().await?;
        Ok(self.status)
    }

    async fn read_response_head(&mut self) -> WebResult<()> {
        loop {
            let head = self.read_head_block().await?;
            let slice = head.as_slice();
            let line_end = crate::buf::find(slice, b"\r\n").unwrap_or(slice.len());
            let first_line = String::from_utf8_lossy(&slice[..line_end]).into_owned();
            let (protocol, status, _reason) = http::parse_response_line(&first_line)?;
            let headers =
                HeaderMap::parse_block(&slice[(line_end + 2).min(slice.len())..])?;

            // Interim responses are skipped (101 is handled by the
            // WebSocket client, not here).
            if (100..200).contains(&status) {
                continue;
            }

            self.status = status;
            self.resp_headers = headers;

            let bodyless = bodyless_status(status) || self.method == Method::Head;
            if bodyless {
                self.rx_eof = true;
            } else if self
                .resp_headers
                .get("Transfer-Encoding")
                .is_some_and(|te| http::value_has_token(te, "chunked"))
            {
                self.chunk_decoder = Some(ChunkDecoder::new());
            } else if let Some(cl) = self.resp_headers.get("Content-Length") {
                self.rx_remaining = cl
                    .trim()
                    .parse()
                    .map_err(|_| WebError::CantRead(format!("bad content-length: {}", cl)))?;
                if self.rx_remaining == 0 {
                    self.rx_eof = true;
                }
            } else {
                // Close-delimited body.
                self.read_to_eof = true;
            }

            self.keep_alive = match self.resp_headers.get("Connection") {
                Some(v) if http::value_has_token(v, "close") => false,
                Some(v) if http::value_has_token(v, "keep-alive") => true,
                _ => protocol.default_keep_alive(),
            } && !self.read_to_eof;
            return Ok(());
        }
    }

    async fn read_head_block(&mut self) -> WebResult<NetBuf> {
        let deadline = self.deadline();
        loop {
            if let Some(idx) = self.rx.find(b"\r\n\r\n") {
                let block = self.rx.consume(idx + 4);
                let mut head = NetBuf::with_capacity(block.len());
                head.append(&block);
                return Ok(head);
            }
            let stream = self.stream
                .as_mut()
                .ok_or_else(|| WebError::BadState("client not started".into()))?;
            let n = net::read_into(stream, &mut self.rx, deadline).await?;
            if n == 0 {
                return Err(WebError::CantRead("closed before response head".into()));
            }
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.resp_headers.get(name)
    }

    /// Next piece of decoded response body; `Ok(None)` at the end.
    pub async fn read_chunk(&mut self) -> WebResult<Option<Vec<u8>>> {
        if !self.finalized {
            return Err(WebError::BadState("response not started".into()));
        }
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
            } else if self.read_to_eof {
                if !self.rx.is_empty() {
                    let data = self.rx.consume(self.rx.len());
                    return Ok(Some(data.to_vec()));
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
            let deadline = self.deadline();
            let stream = self.stream
                .as_mut()
                .ok_or_else(|| WebError::BadState("client not started".into()))?;
            let n = net::read_into(stream, &mut self.rx, deadline).await?;
            if n == 0 {
                if self.read_to_eof {
                    self.rx_eof = true;
                    return Ok(None);
                }
                return Err(WebError::CantRead("closed mid-body".into()));
            }
        }
    }

    /// The whole response body, buffered up to `buf_limit`.
    pub async fn response(&mut self) -> WebResult<&[u8]> {
        if !self.body_buffered {
            while let Some(piece) = self.read_chunk().await? {
                if self.body.len() + piece.len() > self.buf_limit {
                    return Err(WebError::Memory("response exceeds buffer limit".into()));
                }
                self.body.extend_from_slice(&piece);
            }
            self.body_buffered = true;
        }
        Ok(&self.body)
    }

    /// Discard the rest of the response body so the connection can pool.
    pub async fn drain(&mut self) -> WebResult<()> {
        while self.read_chunk().await?.is_some() {}
        Ok(())
    }

    /// One whole exchange, with a single retry on `401` when credentials
    /// are configured.
    pub async fn fetch(
        &mut self,
        method: Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> WebResult<u16> {
        let mut retried = false;
        loop {
            self.start(method, url).await?;
            for (name, value) in headers {
                self.set_header(name, *value);
            }
            if let Some(data) = body {
                self.set_content_length(data.len() as u64);
                self.write(data).await?;
            }
            let status = self.finalize().await?;
            if status == 401 && !retried && self.credentials.is_some() {
                let challenge = self
                    .header("WWW-Authenticate")
                    .map(str::to_string)
                    .ok_or_else(|| WebError::CantComplete("401 without a challenge".into()))?;
                self.accept_challenge(&challenge)?;
                self.drain().await?;
                retried = true;
                continue;
            }
            return Ok(status);
        }
    }

    /// Parse a `WWW-Authenticate` header and arm the matching credential
    /// mode for the next request.
    fn accept_challenge(&mut self, value: &str) -> WebResult<()> {
        match Challenge::parse(value)? {
            Challenge::Basic { .. } => {
                self.use_basic = true;
                self.digest = None;
            }
            Challenge::Digest {
                realm,
                nonce,
                qop,
                opaque,
                algorithm,
                stale,
            } => {
                if stale {
                    self.digest = None;
                }
                // A new nonce restarts the count.
                if self.digest.as_ref().map(|d| d.nonce.as_str()) != Some(nonce.as_str()) {
                    self.nc = 0;
                }
                self.use_basic = false;
                self.digest = Some(StoredChallenge {
                    realm,
                    nonce,
                    qop,
                    opaque,
                    algorithm,
                });
            }
        }
        Ok(())
    }

    pub async fn get(&mut self, url: &str) -> WebResult<u16> {
        self.fetch(Method::Get, url, &[], None).await
    }

    pub async fn post(&mut self, url: &str, body: &[u8]) -> WebResult<u16> {
        self.fetch(Method::Post, url, &[], Some(body)).await
    }

    /// POST a JSON value and parse the JSON response.
    pub async fn json(
        &mut self,
        method: Method,
        url: &str,
        value: &serde_json::Value,
    ) -> WebResult<serde_json::Value> {
        let body = serde_json::to_vec(value)
            .map_err(|e| WebError::BadArgs(format!("json: {}", e)))?;
        let status = self
            .fetch(
                method,
                url,
                &[("Content-Type", "application/json")],
                Some(&body),
            )
            .await?;
        if !(200..300).contains(&status) {
            return Err(WebError::CantComplete(format!("status {}", status)));
        }
        let body = self.response().await?;
        serde_json::from_slice(body).map_err(|e| WebError::CantRead(format!("json: {}", e)))
    }

    /// Drop the pooled connection.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close().await;
        }
        self.rx.clear();
        self.rx_eof = true;
    }
}
