//! Etude — an embedded HTTP/1 engine: server, client, WebSocket and SSE
//! on a single-threaded cooperative runtime.
//!
//! The server and client share one connection model, one header map, and
//! one chunked-transfer codec. Every I/O call carries an absolute
//! deadline; a lapse surfaces as [`error::WebError::Timeout`] to the
//! suspended fiber, never as a panic. All host state lives on one thread,
//! so there are no locks anywhere in the engine.

pub mod auth;
pub mod buf;
pub mod client;
pub mod config;
pub mod error;
pub mod fiber;
pub mod file;
pub mod http;
pub mod logging;
pub mod net;
pub mod prelude;
pub mod request;
pub mod route;
pub mod server;
pub mod session;
pub mod sse;
pub mod upload;
pub mod url;
pub mod ws;

// ── Core type re-exports ───────────────────────────────────────
pub use client::WebClient;
pub use config::WebConfig;
pub use error::{WebError, WebResult};
pub use http::{HeaderMap, Method, Protocol};
pub use logging::{init_logging, init_logging_with_level};
pub use request::WebRequest;
pub use server::WebHost;
pub use sse::{SseEvent, SseReader};
pub use upload::Upload;
pub use url::Url;
pub use ws::WebSocket;
