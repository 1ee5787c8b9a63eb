//! Etude prelude — import everything a host or handler needs with one
//! line.
//!
//! ```rust,ignore
//! use etude_core::prelude::*;
//! ```

pub use crate::client::WebClient;
pub use crate::config::WebConfig;
pub use crate::error::{WebError, WebResult};
pub use crate::fiber;
pub use crate::http::{HeaderMap, Method, Protocol};
pub use crate::logging::{init_logging, init_logging_with_level};
pub use crate::request::WebRequest;
pub use crate::server::WebHost;
pub use crate::sse::{SseEvent, SseReader};
pub use crate::upload::Upload;
pub use crate::url::Url;
pub use crate::ws::{self, Message, WebSocket};

pub use serde::{Deserialize, Serialize};
