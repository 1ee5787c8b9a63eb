//! Session store and cookie issuance.
//!
//! Sessions are keyed by 128 bits of CSPRNG output, base64-url encoded,
//! carried in a cookie. Expiry is inactivity-based: every touch pushes
//! `expires` out by the lifespan. A periodic sweeper evicts expired
//! entries; `get` also checks lazily. When the store is full the
//! soonest-expiring session is evicted to make room.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use tokio::time::Instant;

/// Default sweep period for the session reaper.
pub const SWEEP_PERIOD_MS: u64 = 60_000;

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub lifespan_secs: u64,
    pub expires: Instant,
    cache: HashMap<String, String>,
    xsrf: Option<String>,
}

impl Session {
    fn new(id: String, lifespan_secs: u64) -> Self {
        Session {
            id,
            lifespan_secs,
            expires: Instant::now() + Duration::from_secs(lifespan_secs),
            cache: HashMap::new(),
            xsrf: None,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Push expiry out by the lifespan.
    pub fn touch(&mut self) {
        self.expires = Instant::now() + Duration::from_secs(self.lifespan_secs);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cache.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.cache.insert(key.into(), value.into());
    }

    /// The per-session XSRF token, created on first use.
    pub fn security_token(&mut self) -> &str {
        self.xsrf.get_or_insert_with(random_token)
    }

    /// The token, without creating one.
    pub fn peek_security_token(&self) -> Option<&str> {
        self.xsrf.as_deref()
    }
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    max: usize,
}

impl SessionStore {
    pub fn new(max: usize) -> Self {
        SessionStore {
            sessions: HashMap::new(),
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Create a session, evicting the soonest-expiring one on pressure.
    pub fn create(&mut self, lifespan_secs: u64) -> String {
        if self.sessions.len() >= self.max {
            let victim = self
                .sessions
                .values()
                .min_by_key(|s| s.expires)
                .map(|s| s.id.clone());
            if let Some(id) = victim {
                self.sessions.remove(&id);
            }
        }
        let id = random_token();
        self.sessions
            .insert(id.clone(), Session::new(id.clone(), lifespan_secs));
        id
    }

    /// Look up and touch. Expired entries are deleted on access.
    pub fn get(&mut self, id: &str) -> Option<&mut Session> {
        if self.sessions.get(id).is_some_and(Session::expired) {
            self.sessions.remove(id);
            return None;
        }
        let session = self.sessions.get_mut(id)?;
        session.touch();
        Some(session)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Evict expired sessions; returns the count removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.expired());
        before - self.sessions.len()
    }
}

/// 128 bits of CSPRNG output, base64-url encoded. Used for session ids,
/// XSRF tokens and digest nonces.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time string comparison for token checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build a `Set-Cookie` value. `max_age` of zero omits the attribute
/// (session cookie); `same_site` of `None` omits `SameSite`.
pub fn make_cookie(
    name: &str,
    value: &str,
    max_age: u64,
    http_only: bool,
    secure: bool,
    same_site: Option<&str>,
) -> String {
    let mut cookie = format!("{}={}; Path=/", name, value);
    if max_age > 0 {
        cookie.push_str(&format!("; Max-Age={}", max_age));
    }
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if secure {
        cookie.push_str("; Secure");
    }
    if let Some(policy) = same_site {
        cookie.push_str(&format!("; SameSite={}", policy));
    }
    cookie
}

/// Extract the session id from a `Cookie` header value.
pub fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    for pair in cookie_header.split(';') {
        let pair = pair.trim();
        if let Some(idx) = pair.find('=') {
            if pair[..idx].trim() == name {
                return Some(pair[idx + 1..].trim());
            }
        }
    }
    None
}
