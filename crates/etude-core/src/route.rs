//! Route selection and signature validation.
//!
//! Routes are scanned in config order; the first route whose pattern,
//! method set and trim prefix all accept the request wins. A pattern is a
//! prefix unless it ends in `/`, which demands an exact path match. An
//! empty method set accepts every method.

use std::collections::HashSet;

use serde_json::Value;

use crate::config::RouteConfig;
use crate::error::{WebError, WebResult};
use crate::http::Method;

#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    pub methods: HashSet<Method>,
    pub handler: String,
    pub role: Option<String>,
    pub redirect: Option<String>,
    pub trim: Option<String>,
    pub xsrf: bool,
    pub validate: bool,
    pub stream: bool,
    pub compressed: bool,
    pub cache_max_age: Option<u64>,
    pub cache_directives: Option<String>,
    pub extensions: Vec<String>,
}

impl Route {
    pub fn from_config(config: &RouteConfig) -> WebResult<Route> {
        let mut methods = HashSet::new();
        for name in &config.methods {
            let method = Method::from_str_token(name)
                .ok_or_else(|| WebError::BadArgs(format!("route method: {}", name)))?;
            methods.insert(method);
        }
        Ok(Route {
            pattern: config.pattern.clone(),
            methods,
            handler: config.handler.clone(),
            role: config.role.clone(),
            redirect: config.redirect.clone(),
            trim: config.trim.clone(),
            xsrf: config.xsrf,
            validate: config.validate,
            stream: config.stream,
            compressed: config.compressed,
            cache_max_age: config.cache_max_age,
            cache_directives: config.cache_directives.clone(),
            extensions: config.extensions.clone(),
        })
    }

    /// The implicit catch-all file route used when no routes are
    /// configured.
    pub fn catch_all() -> Route {
        Route {
            pattern: String::new(),
            methods: [Method::Get, Method::Head, Method::Options].into_iter().collect(),
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

    fn matches_path(&self, path: &str) -> bool {
        if self.pattern.len() > 1 && self.pattern.ends_with('/') {
            path == self.pattern
        } else {
            path.starts_with(&self.pattern)
        }
    }

    fn accepts_method(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }

    /// The request path with the route's trim prefix removed.
    pub fn trimmed<'a>(&self, path: &'a str) -> &'a str {
        match &self.trim {
            Some(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path),
            None => path,
        }
    }

    /// `Allow` header value for this route's method set.
    pub fn allow_header(&self) -> String {
        if self.methods.is_empty() {
            return "GET, HEAD, POST, PUT, DELETE, PATCH, OPTIONS, TRACE".to_string();
        }
        let mut names: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }
}

/// Result of scanning the route table.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    Found(usize, &'a Route),
    /// Some route matched the path but none accepted the method.
    MethodMismatch(HashSet<Method>),
    NotFound,
}

pub fn select<'a>(routes: &'a [Route], path: &str, method: Method) -> RouteMatch<'a> {
    let mut allowed: HashSet<Method> = HashSet::new();
    let mut path_matched = false;
    for (index, route) in routes.iter().enumerate() {
        if !route.matches_path(path) {
            continue;
        }
        if let Some(trim) = &route.trim {
            if !path.starts_with(trim.as_str()) {
                continue;
            }
        }
        if route.accepts_method(method) {
            return RouteMatch::Found(index, route);
        }
        path_matched = true;
        allowed.extend(route.methods.iter().copied());
    }
    if path_matched {
        RouteMatch::MethodMismatch(allowed)
    } else {
        RouteMatch::NotFound
    }
}

// ── Signatures ──

/// Schema-driven request/response validation, keyed by a dot-path derived
/// from the URL path (`/api/device/update` -> `api.device.update`) with an
/// optional per-verb level below it.
#[derive(Debug, Clone, Default)]
pub struct SignatureSet {
    schemas: Value,
    strict: bool,
}

impl SignatureSet {
    pub fn new(schemas: Value, strict: bool) -> Self {
        SignatureSet { schemas, strict }
    }

    pub fn is_empty(&self) -> bool {
        !self.schemas.is_object()
    }

    /// Resolve the signature for a request. Returns the signature id used
    /// in diagnostics plus the schema node.
    pub fn lookup(&self, path: &str, method: Method) -> Option<(String, &Value)> {
        let key = path.trim_start_matches('/').replace('/', ".");
        let node = self.schemas.get(&key)?;
        let verb = method.as_str().to_ascii_lowercase();
        match node.get(&verb) {
            Some(sub) => Some((format!("{}.{}", key, verb), sub)),
            None => Some((key, node)),
        }
    }

    /// Validate query variables against the signature's `query` block.
    pub fn validate_query(&self, signature: &Value, vars: &[(String, String)]) -> WebResult<()> {
        let Some(schema) = signature.get("query").and_then(Value::as_object) else {
            return Ok(());
        };
        for (name, spec) in schema {
            let value = vars.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str());
            match value {
                None => {
                    if spec.get("required").and_then(Value::as_bool).unwrap_or(false) {
                        return Err(WebError::BadArgs(format!("missing query parameter: {}", name)));
                    }
                }
                Some(text) => check_text_field(name, text, spec)?,
            }
        }
        if self.strict {
            for (name, _) in vars {
                if !schema.contains_key(name) {
                    return Err(WebError::BadArgs(format!("unexpected query parameter: {}", name)));
                }
            }
        }
        Ok(())
    }

    /// Validate a JSON request body against the signature's `fields`
    /// block. Unknown fields are rejected when strict, silently dropped
    /// otherwise.
    pub fn validate_body(&self, signature: &Value, body: &mut Value) -> WebResult<()> {
        let Some(schema) = signature.get("fields").and_then(Value::as_object) else {
            return Ok(());
        };
        let Some(object) = body.as_object_mut() else {
            return Err(WebError::BadArgs("body must be a JSON object".into()));
        };
        for (name, spec) in schema {
            match object.get(name) {
                None => {
                    if spec.get("required").and_then(Value::as_bool).unwrap_or(false) {
                        return Err(WebError::BadArgs(format!("missing field: {}", name)));
                    }
                }
                Some(value) => check_json_field(name, value, spec)?,
            }
        }
        let unknown: Vec<String> = object
            .keys()
            .filter(|k| !schema.contains_key(*k))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            if self.strict {
                return Err(WebError::BadArgs(format!("unexpected field: {}", unknown[0])));
            }
            for key in unknown {
                object.remove(&key);
            }
        }
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_json_field(name: &str, value: &Value, spec: &Value) -> WebResult<()> {
    if let Some(expected) = spec.get("type").and_then(Value::as_str) {
        let actual = type_name(value);
        if expected != actual {
            return Err(WebError::BadArgs(format!(
                "field {}: expected {}, got {}",
                name, expected, actual
            )));
        }
    }
    if let Some(number) = value.as_f64() {
        check_number_range(name, number, spec)?;
    }
    if let Some(text) = value.as_str() {
        check_string_constraints(name, text, spec)?;
    }
    if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(WebError::BadArgs(format!("field {}: not in enum", name)));
        }
    }
    Ok(())
}

/// Query values arrive as text; coerce per the declared type first.
fn check_text_field(name: &str, text: &str, spec: &Value) -> WebResult<()> {
    match spec.get("type").and_then(Value::as_str) {
        Some("number") => {
            let number: f64 = text
                .parse()
                .map_err(|_| WebError::BadArgs(format!("query {}: not a number", name)))?;
            check_number_range(name, number, spec)?;
        }
        Some("boolean") => {
            if text != "true" && text != "false" {
                return Err(WebError::BadArgs(format!("query {}: not a boolean", name)));
            }
        }
        _ => check_string_constraints(name, text, spec)?,
    }
    if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
        let matches = allowed.iter().any(|v| match v {
            Value::String(s) => s == text,
            other => other.to_string() == text,
        });
        if !matches {
            return Err(WebError::BadArgs(format!("query {}: not in enum", name)));
        }
    }
    Ok(())
}

fn check_number_range(name: &str, number: f64, spec: &Value) -> WebResult<()> {
    if let Some(min) = spec.get("min").and_then(Value::as_f64) {
        if number < min {
            return Err(WebError::BadArgs(format!("field {}: below minimum", name)));
        }
    }
    if let Some(max) = spec.get("max").and_then(Value::as_f64) {
        if number > max {
            return Err(WebError::BadArgs(format!("field {}: above maximum", name)));
        }
    }
    Ok(())
}

fn check_string_constraints(name: &str, text: &str, spec: &Value) -> WebResult<()> {
    if let Some(pattern) = spec.get("pattern").and_then(Value::as_str) {
        let re = regex::Regex::new(pattern)
            .map_err(|e| WebError::BadArgs(format!("field {}: bad pattern: {}", name, e)))?;
        if !re.is_match(text) {
            return Err(WebError::BadArgs(format!("field {}: pattern mismatch", name)));
        }
    }
    Ok(())
}
