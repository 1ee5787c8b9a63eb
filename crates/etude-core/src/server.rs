//! Server engine: listeners, the per-connection request loop, routing and
//! handler dispatch.
//!
//! Each bound endpoint gets an accept-loop fiber; each accepted connection
//! gets its own fiber running `handle_connection`. Within a connection,
//! request N completes before request N+1 is parsed. The host's mutable
//! state (sessions, nonces, counters) is only ever touched from handler
//! fibers on the one scheduler thread, so `RefCell`/`Cell` suffice.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::auth::{self, DigestAlgorithm, NonceTable, User, Verified};
use crate::buf::NetBuf;
use crate::config::WebConfig;
use crate::error::{WebError, WebResult};
use crate::fiber::{self, Deadline};
use crate::http::{self, HeaderMap, Method};
use crate::net::{self, AsyncStream, Stream};
use crate::request::WebRequest;
use crate::route::{self, Route, RouteMatch, SignatureSet};
use crate::session::{SessionStore, random_token};

/// A registered action: a handler fiber entry point bound to a URL prefix.
pub type Action =
    Rc<dyn for<'a> Fn(&'a mut WebRequest) -> Pin<Box<dyn Future<Output = WebResult<()>> + 'a>>>;

/// Hook that wraps an accepted TCP stream in an externally-terminated TLS
/// session.
pub type TlsAcceptor =
    Rc<dyn Fn(TcpStream) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn AsyncStream>>>>>>;

pub struct WebHost {
    pub config: WebConfig,
    pub routes: Vec<Route>,
    pub users: HashMap<String, User>,
    pub signatures: SignatureSet,
    pub(crate) auth_algorithm: DigestAlgorithm,
    pub(crate) sessions: RefCell<SessionStore>,
    pub(crate) nonces: RefCell<NonceTable>,
    opaque: String,
    actions: RefCell<Vec<(String, Action)>>,
    tls_acceptor: RefCell<Option<TlsAcceptor>>,
    conn_count: Cell<usize>,
    bound: RefCell<Vec<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    weak: RefCell<std::rc::Weak<WebHost>>,
}

impl WebHost {
    pub fn new(config: WebConfig) -> WebResult<Rc<WebHost>> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for rc in &config.routes {
            routes.push(Route::from_config(rc)?);
        }
        if routes.is_empty() {
            routes.push(Route::catch_all());
        }
        let auth_algorithm = DigestAlgorithm::from_name(&config.auth.algorithm)
            .ok_or_else(|| WebError::BadArgs(format!("auth algorithm: {}", config.auth.algorithm)))?;
        let users = auth::build_users(&config.users, &config.roles);
        let signatures = SignatureSet::new(config.signatures.clone(), config.strict_signatures);
        let sessions = RefCell::new(SessionStore::new(config.limits.max_sessions));
        let nonces = RefCell::new(NonceTable::new(config.auth.digest_timeout));
        let (shutdown_tx, _) = watch::channel(false);

        let host = Rc::new(WebHost {
            config,
            routes,
            users,
            signatures,
            auth_algorithm,
            sessions,
            nonces,
            opaque: random_token(),
            actions: RefCell::new(Vec::new()),
            tls_acceptor: RefCell::new(None),
            conn_count: Cell::new(0),
            bound: RefCell::new(Vec::new()),
            shutdown_tx,
            weak: RefCell::new(std::rc::Weak::new()),
        });
        *host.weak.borrow_mut() = Rc::downgrade(&host);
        Ok(host)
    }

    /// Strong handle to this host; valid while any `Rc` is alive, which
    /// the `&self` borrow guarantees.
    fn rc(&self) -> Rc<WebHost> {
        self.weak.borrow().upgrade().expect("host alive")
    }

    /// Register an action against a URL prefix. Dispatch picks the
    /// longest matching prefix. Plain `async fn(&mut WebRequest) ->
    /// WebResult<()>` items register directly.
    pub fn add_action<F>(&self, prefix: &str, action: F)
    where
        F: for<'a> std::ops::AsyncFn(&'a mut WebRequest) -> WebResult<()> + 'static,
    {
        let action = Rc::new(action);
        let boxed: Action = Rc::new(move |req: &mut WebRequest| {
            let action = action.clone();
            Box::pin(async move { (*action)(req).await })
        });
        self.actions.borrow_mut().push((prefix.to_string(), boxed));
    }

    pub fn set_tls_acceptor(&self, acceptor: TlsAcceptor) {
        *self.tls_acceptor.borrow_mut() = Some(acceptor);
    }

    fn find_action(&self, path: &str) -> Option<Action> {
        let actions = self.actions.borrow();
        actions
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, action)| action.clone())
    }

    /// First bound address; useful with a `:0` test listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.borrow().first().copied()
    }

    pub fn connection_count(&self) -> usize {
        self.conn_count.get()
    }

    /// Stop the listeners and wake `run`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Bind every configured endpoint and spawn their accept loops plus
    /// the session/nonce sweepers. Returns once all listeners are bound.
    pub async fn listen(&self) -> WebResult<()> {
        let endpoints = self.config.endpoints()?;
        if endpoints.is_empty() {
            return Err(WebError::BadArgs("no listen endpoints".into()));
        }
        for (secure, bind_host, port) in endpoints {
            if secure && self.tls_acceptor.borrow().is_none() {
                return Err(WebError::BadState(format!(
                    "https endpoint {}:{} without a TLS acceptor",
                    bind_host, port
                )));
            }
            let listener = TcpListener::bind((bind_host.as_str(), port))
                .await
                .map_err(|e| WebError::CantConnect(format!("bind {}:{}: {}", bind_host, port, e)))?;
            let addr = listener
                .local_addr()
                .map_err(|e| WebError::CantConnect(e.to_string()))?;
            tracing::info!(%addr, secure, "listening");
            self.bound.borrow_mut().push(addr);
            fiber::spawn(accept_loop(self.rc(), listener, secure));
        }

        let weak = self.weak.borrow().clone();
        fiber::start_ticker(crate::session::SWEEP_PERIOD_MS, move || {
            let Some(host) = weak.upgrade() else {
                return false;
            };
            let stale_sessions = host.sessions.borrow_mut().sweep();
            let stale_nonces = host.nonces.borrow_mut().sweep();
            if stale_sessions + stale_nonces > 0 {
                tracing::debug!(stale_sessions, stale_nonces, "sweeper");
            }
            true
        });
        Ok(())
    }

    /// Block the calling fiber until `shutdown` is raised.
    pub async fn run(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn accept_loop(host: Rc<WebHost>, listener: TcpListener, secure: bool) {
    let mut shutdown = host.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((sock, peer)) => {
                        let _ = sock.set_nodelay(true);
                        accept_one(&host, sock, peer, secure);
                    }
                    Err(e) => {
                        tracing::error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

fn accept_one(host: &Rc<WebHost>, sock: TcpStream, peer: SocketAddr, secure: bool) {
    if host.conn_count.get() >= host.config.limits.max_connections {
        tracing::warn!(%peer, "connection limit reached");
        fiber::spawn(async move {
            let mut stream = Stream::Tcp(sock);
            let _ = net::write_all(
                &mut stream,
                b"HTTP/1.1 503 Service Unavailable\r\nRetry-After: 5\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                Deadline::in_secs(2),
            )
            .await;
            stream.close().await;
        });
        return;
    }
    host.conn_count.set(host.conn_count.get() + 1);
    let host = host.clone();
    fiber::spawn(async move {
        let stream = if secure {
            let acceptor = host.tls_acceptor.borrow().clone();
            match acceptor {
                Some(accept) => match accept(sock).await {
                    Ok(tls) => Stream::Tls(tls),
                    Err(e) => {
                        tracing::debug!(%peer, "tls accept failed: {}", e);
                        host.conn_count.set(host.conn_count.get() - 1);
                        return;
                    }
                },
                None => {
                    host.conn_count.set(host.conn_count.get() - 1);
                    return;
                }
            }
        } else {
            Stream::Tcp(sock)
        };
        tracing::debug!(%peer, "connection open");
        handle_connection(host.clone(), stream).await;
        tracing::debug!(%peer, "connection closed");
        host.conn_count.set(host.conn_count.get() - 1);
    });
}

/// Read a header block terminated by a blank line. Returns `Ok(None)` on
/// a clean EOF between requests.
async fn read_head(
    host: &WebHost,
    stream: &mut Stream,
    rx: &mut NetBuf,
) -> WebResult<Option<NetBuf>> {
    let deadline = Deadline::in_secs(host.config.timeouts.parse);
    loop {
        if let Some(idx) = rx.find(b"\r\n\r\n") {
            let block = rx.consume(idx + 4);
            let mut head = NetBuf::with_capacity(block.len());
            head.append(&block);
            return Ok(Some(head));
        }
        if rx.len() > host.config.limits.max_header {
            return Err(WebError::Memory("header block exceeds maxHeader".into()));
        }
        let n = net::read_into(stream, rx, deadline).await?;
        if n == 0 {
            if rx.is_empty() {
                return Ok(None);
            }
            return Err(WebError::CantRead("connection closed mid-header".into()));
        }
    }
}

/// Emit a minimal response on a connection that has no request object.
async fn write_simple(stream: &mut Stream, status: u16) {
    let body = format!("{}\r\n", http::status_text(status));
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        http::status_text(status),
        body.len(),
        body
    );
    let _ = net::write_all(stream, head.as_bytes(), Deadline::in_secs(2)).await;
}

async fn handle_connection(host: Rc<WebHost>, mut stream: Stream) {
    let mut rx = NetBuf::new();
    let mut served: usize = 0;

    loop {
        // 1. Header phase, under the parse deadline.
        let head = match read_head(&host, &mut stream, &mut rx).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(WebError::Timeout) => {
                write_simple(&mut stream, 408).await;
                break;
            }
            Err(WebError::Memory(_)) => {
                write_simple(&mut stream, 431).await;
                break;
            }
            Err(_) => break,
        };
        served += 1;

        // 2. First line and header block.
        let head_slice = head.as_slice();
        let line_end = crate::buf::find(head_slice, b"\r\n").unwrap_or(head_slice.len());
        let first_line = String::from_utf8_lossy(&head_slice[..line_end]).into_owned();
        let block = &head_slice[(line_end + 2).min(head_slice.len())..];

        let parsed = http::parse_request_line(&first_line)
            .and_then(|(method, target, protocol)| {
                HeaderMap::parse_block(block).map(|headers| (method, target.to_string(), protocol, headers))
            });
        let (method, target, protocol, headers) = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!("request parse failed: {}", e);
                write_simple(&mut stream, 400).await;
                break;
            }
        };
        if host.config.show_rx_headers() {
            tracing::debug!(%first_line, headers = headers.len(), "request");
        }

        // 3. The request object owns the transport for the exchange.
        let mut req = WebRequest::new(
            host.clone(),
            stream,
            std::mem::take(&mut rx),
            method,
            &target,
            protocol,
            headers,
        );

        let outcome = match req.prepare() {
            Ok(()) => {
                if served >= host.config.limits.max_requests {
                    // Last request on this connection; say so up front.
                    req.flags.close_after = true;
                }
                process_request(&host, &mut req).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            if e.is_net_error() {
                // No response possible; tear the connection down.
                req.flags.close_after = true;
            } else {
                tracing::debug!(path = %req.path, "request failed: {}", e);
                // 4xx bodies name the cause (e.g. the offending field).
                let message = match &e {
                    WebError::BadArgs(m) => m.clone(),
                    _ => String::new(),
                };
                let _ = req.error_response(e.status_code(), &message).await;
            }
        }

        // 4. Ensure the response is complete and the body drained so the
        //    next request can be parsed.
        if !req.flags.upgraded {
            if req.finalize().await.is_err() {
                req.flags.close_after = true;
            }
            if !req.flags.close_after && req.drain_body().await.is_err() {
                req.flags.close_after = true;
            }
        }
        let (returned, leftover, keep) = req.into_parts();
        match returned {
            Some(s) if keep => {
                stream = s;
                rx = leftover;
            }
            Some(mut s) => {
                s.close().await;
                break;
            }
            None => break,
        }
    }
}

async fn process_request(host: &Rc<WebHost>, req: &mut WebRequest) -> WebResult<()> {
    // Fixed redirect table runs before routing.
    let redirect = host
        .config
        .redirects
        .iter()
        .find(|r| r.from == req.path)
        .map(|r| (r.status, r.to.clone()));
    if let Some((status, to)) = redirect {
        return req.redirect(status, &to).await;
    }

    // Route selection: first match wins.
    let route_index = match route::select(&host.routes, &req.path, req.method) {
        RouteMatch::Found(index, _) => index,
        RouteMatch::MethodMismatch(allowed) => {
            let mut names: Vec<&str> = allowed.iter().map(Method::as_str).collect();
            names.sort_unstable();
            let allow = names.join(", ");
            if req.method == Method::Options {
                // OPTIONS is answered from the route's method set.
                req.set_header("Allow", allow);
                req.set_content_length(0);
                return req.finalize().await.map(|_| ());
            }
            req.set_header("Allow", allow);
            return req.error_response(405, "").await;
        }
        RouteMatch::NotFound => {
            return req.error_response(404, "").await;
        }
    };
    req.route = Some(route_index);
    let route = host.routes[route_index].clone();

    if let Some(target) = &route.redirect {
        return req.redirect(302, target).await;
    }

    // Authentication and role gate.
    if let Some(role) = &route.role {
        let Some(username) = authenticate(host, req).await? else {
            return Ok(()); // challenge already emitted
        };
        let Some(user) = host.users.get(&username) else {
            return req.error_response(401, "").await;
        };
        if !user.can(role) {
            return req.error_response(403, "").await;
        }
        req.username = Some(username);
    }

    // Buffer the body up front unless the route streams it; this also
    // parses form variables and multipart uploads.
    if !route.stream && !req.body_complete() {
        req.read_body().await?;
    }

    // XSRF on state-changing methods.
    if route.xsrf && req.method.is_state_changing() && !req.check_security_token() {
        return req.error_response(400, "Invalid security token").await;
    }

    // Signature validation: query now, body after parse.
    if route.validate && !host.signatures.is_empty() {
        if let Some((sig_id, signature)) = host.signatures.lookup(&req.path, req.method) {
            let signature = signature.clone();
            req.signature = Some(sig_id);
            host.signatures.validate_query(&signature, &req.vars)?;
            if req.flags.json_body && !req.body.is_empty() {
                let mut value = req.json_body()?;
                host.signatures.validate_body(&signature, &mut value)?;
                req.body = serde_json::to_vec(&value)
                    .map_err(|e| WebError::CantComplete(format!("json: {}", e)))?;
            }
        }
    }

    // Handler dispatch.
    match route.handler.as_str() {
        "file" => crate::file::handle(req, &route).await,
        "upload" => {
            // Parsing happened in read_body; hand off to an action when
            // one is registered, otherwise acknowledge the upload.
            match host.find_action(route.trimmed(&req.path)) {
                Some(action) => action(req).await,
                None => {
                    req.set_content_length(0);
                    req.finalize().await.map(|_| ())
                }
            }
        }
        _ => match host.find_action(route.trimmed(&req.path)) {
            Some(action) => action(req).await,
            None => req.error_response(404, "").await,
        },
    }
}

/// Resolve the requesting user: an authenticated session wins, otherwise
/// the `Authorization` header is verified. Emits the 401 challenge and
/// returns `Ok(None)` when credentials are missing or rejected.
async fn authenticate(host: &Rc<WebHost>, req: &mut WebRequest) -> WebResult<Option<String>> {
    if let Some(username) = req.session_var("username") {
        return Ok(Some(username));
    }

    let header = req.headers.get("Authorization").map(str::to_string);
    let Some(header) = header else {
        challenge(host, req, false).await?;
        return Ok(None);
    };
    let (scheme, params) = auth::parse_auth_header(&header)?;
    let verified = match scheme.as_str() {
        "Basic" => {
            if host.config.auth.require_tls_for_basic && !req.flags.secure {
                tracing::warn!("basic credentials rejected on cleartext connection");
                challenge(host, req, false).await?;
                return Ok(None);
            }
            auth::verify_basic(
                &params,
                &host.users,
                &host.config.auth.realm,
                host.auth_algorithm,
            )?
        }
        "Digest" => {
            // The uri parameter must name the resource being requested.
            if params.get("uri").map(String::as_str) != Some(req.url.as_str()) {
                challenge(host, req, false).await?;
                return Ok(None);
            }
            auth::verify_digest(
                &params,
                &host.users,
                &host.config.auth.realm,
                host.auth_algorithm,
                req.method.as_str(),
                &mut host.nonces.borrow_mut(),
            )?
        }
        _ => {
            challenge(host, req, false).await?;
            return Ok(None);
        }
    };
    match verified {
        Verified::User(username) => Ok(Some(username)),
        Verified::Denied { stale } => {
            challenge(host, req, stale).await?;
            Ok(None)
        }
    }
}

/// Emit the 401 challenge matching the host's auth type.
async fn challenge(host: &Rc<WebHost>, req: &mut WebRequest, stale: bool) -> WebResult<()> {
    let value = match host.config.auth.kind.as_str() {
        "basic" => auth::basic_challenge(&host.config.auth.realm),
        _ => {
            let nonce = host.nonces.borrow_mut().issue();
            auth::digest_challenge(
                &host.config.auth.realm,
                host.auth_algorithm,
                &nonce,
                &host.opaque,
                stale,
            )
        }
    };
    req.set_header("WWW-Authenticate", value);
    req.error_response(401, "").await
}
