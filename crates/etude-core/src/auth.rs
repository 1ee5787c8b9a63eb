//! HTTP authentication: Basic and Digest (MD5 / SHA-256).
//!
//! The stored password is the hex of `H(username:realm:password)` — which
//! is exactly Digest's HA1, so config files carry no cleartext and the
//! server never needs one. Basic verification recomputes the same hash
//! from the presented cleartext. Nonces live in a swept table with strict
//! `nc` monotonicity; a replayed or expired nonce re-challenges with
//! `stale=true`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::config::UserConfig;
use crate::error::{WebError, WebResult};
use crate::session::{constant_time_eq, random_token};

/// Hard ceiling on a single auth parameter value.
const MAX_PARAM: usize = 8 * 1024;

/// Default sweep period for the nonce reaper.
pub const NONCE_SWEEP_PERIOD_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    /// Lowercase hex digest of `data`.
    pub fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(data.as_bytes());
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

/// `H(username:realm:password)` — the stored password form and Digest HA1.
pub fn password_digest(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    password: &str,
) -> String {
    algorithm.hash(&format!("{}:{}:{}", username, realm, password))
}

/// `H(method:uri)` — Digest HA2 for `qop=auth`.
pub fn ha2(algorithm: DigestAlgorithm, method: &str, uri: &str) -> String {
    algorithm.hash(&format!("{}:{}", method, uri))
}

/// The Digest response hash. With `qop=auth`:
/// `H(HA1:nonce:nc:cnonce:qop:HA2)`; without qop: `H(HA1:nonce:HA2)`.
pub fn digest_response(
    algorithm: DigestAlgorithm,
    ha1: &str,
    nonce: &str,
    nc: Option<&str>,
    cnonce: Option<&str>,
    qop: Option<&str>,
    ha2: &str,
) -> String {
    match (nc, cnonce, qop) {
        (Some(nc), Some(cnonce), Some(qop)) => {
            algorithm.hash(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        _ => algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

// ── Users and roles ──

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    /// Hex of `H(username:realm:password)`.
    pub password: String,
    pub role: String,
    /// Closure of the role graph, computed once at insert.
    pub abilities: HashSet<String>,
}

impl User {
    pub fn can(&self, ability: &str) -> bool {
        self.role == ability || self.abilities.contains(ability)
    }
}

/// Compute the reachable set of roles/abilities for `role`.
pub fn role_closure(roles: &HashMap<String, Vec<String>>, role: &str) -> HashSet<String> {
    let mut closure = HashSet::new();
    let mut stack = vec![role.to_string()];
    while let Some(current) = stack.pop() {
        if !closure.insert(current.clone()) {
            continue;
        }
        if let Some(inherited) = roles.get(&current) {
            for item in inherited {
                stack.push(item.clone());
            }
        }
    }
    closure
}

/// Build the username-keyed user table from config.
pub fn build_users(
    users: &[UserConfig],
    roles: &HashMap<String, Vec<String>>,
) -> HashMap<String, User> {
    users
        .iter()
        .map(|u| {
            (
                u.username.clone(),
                User {
                    username: u.username.clone(),
                    password: u.password.clone(),
                    role: u.role.clone(),
                    abilities: role_closure(roles, &u.role),
                },
            )
        })
        .collect()
}

// ── Nonce table ──

#[derive(Debug)]
pub struct NonceEntry {
    pub created: Instant,
    pub nc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCheck {
    Ok,
    /// Unknown, expired, or replayed: re-challenge with `stale=true`.
    Stale,
}

#[derive(Debug)]
pub struct NonceTable {
    entries: HashMap<String, NonceEntry>,
    lifetime: Duration,
}

impl NonceTable {
    pub fn new(lifetime_secs: u64) -> Self {
        NonceTable {
            entries: HashMap::new(),
            lifetime: Duration::from_secs(lifetime_secs),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mint a fresh nonce for a challenge.
    pub fn issue(&mut self) -> String {
        let nonce = random_token();
        self.entries.insert(
            nonce.clone(),
            NonceEntry {
                created: Instant::now(),
                nc: 0,
            },
        );
        nonce
    }

    /// Validate a presented nonce and its `nc`. The count must strictly
    /// increase; equal or decreasing counts are replays.
    pub fn check(&mut self, nonce: &str, nc: u32) -> NonceCheck {
        let Some(entry) = self.entries.get_mut(nonce) else {
            return NonceCheck::Stale;
        };
        if entry.created.elapsed() > self.lifetime {
            self.entries.remove(nonce);
            return NonceCheck::Stale;
        }
        if nc <= entry.nc {
            return NonceCheck::Stale;
        }
        entry.nc = nc;
        NonceCheck::Ok
    }

    /// Drop expired nonces; returns the count removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        let lifetime = self.lifetime;
        self.entries.retain(|_, e| e.created.elapsed() <= lifetime);
        before - self.entries.len()
    }
}

// ── Header parsing and emission ──

/// Escape a parameter value for a quoted string per RFC 7616 §3.4.
pub fn escape_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Split an `Authorization`/`WWW-Authenticate` value into its scheme and
/// parameter map, unescaping quoted strings. Any parameter longer than
/// 8 KiB is a hard failure.
pub fn parse_auth_header(value: &str) -> WebResult<(String, HashMap<String, String>)> {
    let value = value.trim();
    let (scheme, rest) = match value.find(' ') {
        Some(idx) => (&value[..idx], value[idx + 1..].trim()),
        None => (value, ""),
    };
    if scheme.is_empty() {
        return Err(WebError::BadArgs("empty auth scheme".into()));
    }

    let mut params = HashMap::new();

    // `Authorization: Basic` carries a single base64 token, where `=` can
    // only be trailing padding. A `WWW-Authenticate: Basic` challenge has
    // an interior `=` (`realm=...`) and takes the parameter path below.
    if scheme.eq_ignore_ascii_case("Basic") {
        let interior_eq = rest
            .find('=')
            .is_some_and(|idx| idx + 2 < rest.len());
        if !rest.is_empty() && !interior_eq {
            if rest.len() > MAX_PARAM {
                return Err(WebError::BadArgs("auth token too long".into()));
            }
            params.insert("token".to_string(), rest.to_string());
            return Ok((scheme.to_string(), params));
        }
    }
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        let name = rest[name_start..i].trim().to_ascii_lowercase();
        if i >= bytes.len() || bytes[i] == b',' {
            // Basic credentials token (no '='): keep under a fixed key.
            if !name.is_empty() {
                params.insert("token".to_string(), rest[name_start..i].trim().to_string());
            }
            continue;
        }
        i += 1;
        let mut value = String::new();
        if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            loop {
                if i >= bytes.len() {
                    return Err(WebError::BadArgs("unterminated quoted value".into()));
                }
                match bytes[i] {
                    b'\\' if i + 1 < bytes.len() => {
                        value.push(bytes[i + 1] as char);
                        i += 2;
                    }
                    b'"' => {
                        i += 1;
                        break;
                    }
                    b => {
                        value.push(b as char);
                        i += 1;
                    }
                }
                if value.len() > MAX_PARAM {
                    return Err(WebError::BadArgs(format!("auth parameter too long: {}", name)));
                }
            }
        } else {
            let start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            value = rest[start..i].trim().to_string();
            if value.len() > MAX_PARAM {
                return Err(WebError::BadArgs(format!("auth parameter too long: {}", name)));
            }
        }
        params.insert(name, value);
    }
    Ok((scheme.to_string(), params))
}

/// Server-side `WWW-Authenticate: Basic`.
pub fn basic_challenge(realm: &str) -> String {
    format!("Basic realm=\"{}\"", escape_param(realm))
}

/// Server-side `WWW-Authenticate: Digest` with a freshly-issued nonce.
pub fn digest_challenge(
    realm: &str,
    algorithm: DigestAlgorithm,
    nonce: &str,
    opaque: &str,
    stale: bool,
) -> String {
    let mut value = format!(
        "Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\", algorithm={}, opaque=\"{}\"",
        escape_param(realm),
        escape_param(nonce),
        algorithm.name(),
        escape_param(opaque),
    );
    if stale {
        value.push_str(", stale=true");
    }
    value
}

/// Outcome of verifying an `Authorization` header on the server.
pub enum Verified {
    /// The authenticated username.
    User(String),
    /// Credentials failed; challenge again (`stale` set for nonce replay).
    Denied { stale: bool },
}

/// Verify Basic credentials against the user table.
pub fn verify_basic(
    params: &HashMap<String, String>,
    users: &HashMap<String, User>,
    realm: &str,
    algorithm: DigestAlgorithm,
) -> WebResult<Verified> {
    let token = params
        .get("token")
        .ok_or_else(|| WebError::BadArgs("missing basic credentials".into()))?;
    let decoded = BASE64
        .decode(token)
        .map_err(|_| WebError::BadArgs("bad basic credentials".into()))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| WebError::BadArgs("bad basic credentials".into()))?;
    let Some((username, password)) = text.split_once(':') else {
        return Err(WebError::BadArgs("bad basic credentials".into()));
    };
    let Some(user) = users.get(username) else {
        return Ok(Verified::Denied { stale: false });
    };
    let presented = password_digest(algorithm, username, realm, password);
    if constant_time_eq(&presented, &user.password) {
        Ok(Verified::User(username.to_string()))
    } else {
        Ok(Verified::Denied { stale: false })
    }
}

/// Verify a Digest response against the user table and nonce table.
pub fn verify_digest(
    params: &HashMap<String, String>,
    users: &HashMap<String, User>,
    realm: &str,
    algorithm: DigestAlgorithm,
    method: &str,
    nonces: &mut NonceTable,
) -> WebResult<Verified> {
    let username = params
        .get("username")
        .ok_or_else(|| WebError::BadArgs("digest missing username".into()))?;
    let nonce = params
        .get("nonce")
        .ok_or_else(|| WebError::BadArgs("digest missing nonce".into()))?;
    let uri = params
        .get("uri")
        .ok_or_else(|| WebError::BadArgs("digest missing uri".into()))?;
    let response = params
        .get("response")
        .ok_or_else(|| WebError::BadArgs("digest missing response".into()))?;

    if params.get("realm").map(String::as_str) != Some(realm) {
        return Ok(Verified::Denied { stale: false });
    }
    if let Some(name) = params.get("algorithm") {
        if DigestAlgorithm::from_name(name) != Some(algorithm) {
            return Ok(Verified::Denied { stale: false });
        }
    }
    let qop = params.get("qop").map(String::as_str);
    if matches!(qop, Some(q) if q != "auth") {
        // auth-int is not supported.
        return Err(WebError::BadArgs("unsupported qop".into()));
    }

    let nc_text = params.get("nc").map(String::as_str);
    if qop.is_some() {
        let nc = nc_text
            .and_then(|t| u32::from_str_radix(t, 16).ok())
            .ok_or_else(|| WebError::BadArgs("digest missing nc".into()))?;
        if nonces.check(nonce, nc) == NonceCheck::Stale {
            return Ok(Verified::Denied { stale: true });
        }
    }

    let Some(user) = users.get(username.as_str()) else {
        return Ok(Verified::Denied { stale: false });
    };
    let ha2_hash = ha2(algorithm, method, uri);
    let expected = digest_response(
        algorithm,
        &user.password,
        nonce,
        nc_text,
        params.get("cnonce").map(String::as_str),
        qop,
        &ha2_hash,
    );
    if constant_time_eq(&expected, response) {
        Ok(Verified::User(username.to_string()))
    } else {
        Ok(Verified::Denied { stale: false })
    }
}

// ── Client side ──

/// A parsed `WWW-Authenticate` challenge the client can answer.
#[derive(Debug, Clone)]
pub enum Challenge {
    Basic {
        realm: String,
    },
    Digest {
        realm: String,
        nonce: String,
        qop: Option<String>,
        opaque: Option<String>,
        algorithm: DigestAlgorithm,
        stale: bool,
    },
}

impl Challenge {
    pub fn parse(value: &str) -> WebResult<Challenge> {
        let (scheme, params) = parse_auth_header(value)?;
        match scheme.as_str() {
            "Basic" => Ok(Challenge::Basic {
                realm: params.get("realm").cloned().unwrap_or_default(),
            }),
            "Digest" => {
                let qop = params.get("qop").map(|q| {
                    // A list like "auth,auth-int" narrows to auth.
                    if q.split(',').any(|item| item.trim() == "auth") {
                        "auth".to_string()
                    } else {
                        q.clone()
                    }
                });
                if matches!(qop.as_deref(), Some(q) if q != "auth") {
                    return Err(WebError::BadArgs(format!("unsupported qop: {:?}", qop)));
                }
                let algorithm = match params.get("algorithm") {
                    None => DigestAlgorithm::Md5,
                    Some(name) => DigestAlgorithm::from_name(name)
                        .ok_or_else(|| WebError::BadArgs(format!("unsupported algorithm: {}", name)))?,
                };
                Ok(Challenge::Digest {
                    realm: params.get("realm").cloned().unwrap_or_default(),
                    nonce: params
                        .get("nonce")
                        .cloned()
                        .ok_or_else(|| WebError::BadArgs("challenge missing nonce".into()))?,
                    qop,
                    opaque: params.get("opaque").cloned(),
                    algorithm,
                    stale: params
                        .get("stale")
                        .is_some_and(|s| s.eq_ignore_ascii_case("true")),
                })
            }
            other => Err(WebError::BadArgs(format!("unsupported auth scheme: {}", other))),
        }
    }
}

/// 16 random hex characters for the client nonce.
pub fn make_cnonce() -> String {
    let mut bytes = [0u8; 8];
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build a client `Authorization: Basic` value.
pub fn basic_authorization(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
}

/// Build a client `Authorization: Digest` value answering `challenge`.
/// `uri` is `/path[?query]`; `nc` is this client's monotonic count.
#[allow(clippy::too_many_arguments)]
pub fn digest_authorization(
    realm: &str,
    nonce: &str,
    qop: Option<&str>,
    opaque: Option<&str>,
    algorithm: DigestAlgorithm,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> String {
    let ha1 = password_digest(algorithm, username, realm, password);
    let ha2_hash = ha2(algorithm, method, uri);
    let nc_text = format!("{:08x}", nc);
    let response = digest_response(
        algorithm,
        &ha1,
        nonce,
        qop.map(|_| nc_text.as_str()),
        qop.map(|_| cnonce),
        qop,
        &ha2_hash,
    );
    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        escape_param(username),
        escape_param(realm),
        escape_param(nonce),
        escape_param(uri),
    );
    if let Some(qop) = qop {
        value.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc_text, cnonce));
    }
    value.push_str(&format!(", response=\"{}\"", response));
    if let Some(opaque) = opaque {
        value.push_str(&format!(", opaque=\"{}\"", escape_param(opaque)));
    }
    value.push_str(&format!(", algorithm={}", algorithm.name()));
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_users() -> HashMap<String, User> {
        let mut roles = HashMap::new();
        roles.insert("admin".to_string(), vec!["user".to_string()]);
        build_users(
            &[UserConfig {
                username: "u".to_string(),
                password: password_digest(DigestAlgorithm::Sha256, "u", "app", "secret"),
                role: "admin".to_string(),
            }],
            &roles,
        )
    }

    #[test]
    fn test_role_closure_inherits() {
        let mut roles = HashMap::new();
        roles.insert("admin".to_string(), vec!["operator".to_string()]);
        roles.insert("operator".to_string(), vec!["viewer".to_string()]);
        let closure = role_closure(&roles, "admin");
        assert!(closure.contains("admin"));
        assert!(closure.contains("operator"));
        assert!(closure.contains("viewer"));

        let users = test_users();
        let user = users.get("u").unwrap();
        assert!(user.can("admin"));
        assert!(user.can("user"));
        assert!(!user.can("root"));
    }

    #[test]
    fn test_digest_rfc7616_vector() {
        // RFC 7616 §3.9.1 MD5 example.
        let alg = DigestAlgorithm::Md5;
        let ha1 = password_digest(alg, "Mufasa", "http-auth@example.org", "Circle of Life");
        let ha2_hash = ha2(alg, "GET", "/dir/index.html");
        let response = digest_response(
            alg,
            &ha1,
            "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
            Some("00000001"),
            Some("f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ"),
            Some("auth"),
            &ha2_hash,
        );
        assert_eq!(response, "8ca523f5e9506fed4657c9700eebdbec");
    }

    #[test]
    fn test_digest_rfc7616_sha256_vector() {
        // RFC 7616 §3.9.1 SHA-256 example.
        let alg = DigestAlgorithm::Sha256;
        let ha1 = password_digest(alg, "Mufasa", "http-auth@example.org", "Circle of Life");
        let ha2_hash = ha2(alg, "GET", "/dir/index.html");
        let response = digest_response(
            alg,
            &ha1,
            "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
            Some("00000001"),
            Some("f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ"),
            Some("auth"),
            &ha2_hash,
        );
        assert_eq!(
            response,
            "753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1"
        );
    }

    #[test]
    fn test_verify_digest_roundtrip() {
        let users = test_users();
        let mut nonces = NonceTable::new(300);
        let nonce = nonces.issue();
        let header = digest_authorization(
            "app",
            &nonce,
            Some("auth"),
            Some("O0"),
            DigestAlgorithm::Sha256,
            "u",
            "secret",
            "GET",
            "/x",
            1,
            &make_cnonce(),
        );
        let (scheme, params) = parse_auth_header(&header).unwrap();
        assert_eq!(scheme, "Digest");
        let verified = verify_digest(
            &params,
            &users,
            "app",
            DigestAlgorithm::Sha256,
            "GET",
            &mut nonces,
        )
        .unwrap();
        assert!(matches!(verified, Verified::User(name) if name == "u"));
    }

    #[test]
    fn test_nonce_replay_is_stale() {
        let users = test_users();
        let mut nonces = NonceTable::new(300);
        let nonce = nonces.issue();
        assert_eq!(nonces.check(&nonce, 1), NonceCheck::Ok);

        // Same nc again: replay.
        let header = digest_authorization(
            "app",
            &nonce,
            Some("auth"),
            None,
            DigestAlgorithm::Sha256,
            "u",
            "secret",
            "GET",
            "/x",
            1,
            "0123456789abcdef",
        );
        let (_, params) = parse_auth_header(&header).unwrap();
        let verified = verify_digest(
            &params,
            &users,
            "app",
            DigestAlgorithm::Sha256,
            "GET",
            &mut nonces,
        )
        .unwrap();
        assert!(matches!(verified, Verified::Denied { stale: true }));
    }

    #[test]
    fn test_verify_basic_roundtrip() {
        let users = test_users();
        let header = basic_authorization("u", "secret");
        let (scheme, params) = parse_auth_header(&header).unwrap();
        assert_eq!(scheme, "Basic");
        let verified =
            verify_basic(&params, &users, "app", DigestAlgorithm::Sha256).unwrap();
        assert!(matches!(verified, Verified::User(name) if name == "u"));

        let bad = basic_authorization("u", "wrong");
        let (_, params) = parse_auth_header(&bad).unwrap();
        let verified =
            verify_basic(&params, &users, "app", DigestAlgorithm::Sha256).unwrap();
        assert!(matches!(verified, Verified::Denied { stale: false }));
    }

    #[test]
    fn test_challenge_parse_and_escaping() {
        let value = digest_challenge("app \"quoted\"", DigestAlgorithm::Sha256, "N0", "O0", true);
        let challenge = Challenge::parse(&value).unwrap();
        match challenge {
            Challenge::Digest {
                realm,
                nonce,
                qop,
                opaque,
                algorithm,
                stale,
            } => {
                assert_eq!(realm, "app \"quoted\"");
                assert_eq!(nonce, "N0");
                assert_eq!(qop.as_deref(), Some("auth"));
                assert_eq!(opaque.as_deref(), Some("O0"));
                assert_eq!(algorithm, DigestAlgorithm::Sha256);
                assert!(stale);
            }
            _ => panic!("expected digest challenge"),
        }
    }

    #[test]
    fn test_auth_int_rejected() {
        let value = "Digest realm=\"r\", nonce=\"n\", qop=\"auth-int\"";
        assert!(Challenge::parse(value).is_err());
    }

    #[test]
    fn test_oversized_param_rejected() {
        let big = "x".repeat(9 * 1024);
        let value = format!("Digest realm=\"{}\", nonce=\"n\"", big);
        assert!(parse_auth_header(&value).is_err());
    }

    #[test]
    fn test_cnonce_is_16_hex() {
        let cnonce = make_cnonce();
        assert_eq!(cnonce.len(), 16);
        assert!(cnonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
