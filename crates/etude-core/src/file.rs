//! File handler: conditional GET/HEAD, byte ranges, pre-compressed
//! variants.
//!
//! The entity tag is `"<mtime>-<size>"` of the file actually served (the
//! compressed variant when one is selected). Conditionals are evaluated in
//! RFC 7232 §6 order, then ranges per RFC 7233.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{WebError, WebResult};
use crate::http::{self, ByteRange, Method};
use crate::request::WebRequest;
use crate::route::Route;

const FILE_CHUNK: usize = 64 * 1024;

enum Conditional {
    Proceed,
    NotModified,
    PreconditionFailed,
}

pub async fn handle(req: &mut WebRequest, route: &Route) -> WebResult<()> {
    match req.method {
        Method::Get | Method::Head => {}
        Method::Options => {
            req.set_header("Allow", "GET, HEAD, OPTIONS");
            req.set_content_length(0);
            return req.finalize().await.map(|_| ());
        }
        _ => {
            req.set_header("Allow", "GET, HEAD, OPTIONS");
            return req.error_response(405, "").await;
        }
    }

    // Resolve under the document root. The path is already normalized, so
    // it cannot climb out.
    let rel = route.trimmed(&req.path);
    let mut file_path = PathBuf::from(&req.host.config.documents);
    file_path.push(rel.trim_start_matches('/'));

    let mut meta = match tokio::fs::metadata(&file_path).await {
        Ok(meta) => meta,
        Err(_) => return req.error_response(404, "").await,
    };
    if meta.is_dir() {
        file_path.push(&req.host.config.index);
        meta = match tokio::fs::metadata(&file_path).await {
            Ok(meta) => meta,
            Err(_) => return req.error_response(404, "").await,
        };
    }

    // The MIME type always reflects the logical resource, even when a
    // compressed variant goes on the wire.
    let mime = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let mut serve_path = file_path.clone();
    let mut encoding: Option<&str> = None;
    if route.compressed {
        if let Some(accept) = req.headers.get("Accept-Encoding").map(str::to_string) {
            for (token, suffix) in [("br", "br"), ("gzip", "gz")] {
                if http::value_has_token(&accept, token) {
                    let candidate = variant_path(&file_path, suffix);
                    if let Ok(candidate_meta) = tokio::fs::metadata(&candidate).await {
                        serve_path = candidate;
                        meta = candidate_meta;
                        encoding = Some(token);
                        break;
                    }
                }
            }
        }
    }

    let size = meta.len();
    let mtime_secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let etag = format!("\"{}-{}\"", mtime_secs, size);

    match evaluate_conditionals(req, &etag, mtime_secs) {
        Conditional::PreconditionFailed => return req.error_response(412, "").await,
        Conditional::NotModified => {
            req.set_status(304);
            req.set_header("ETag", etag);
            return req.finalize().await.map(|_| ());
        }
        Conditional::Proceed => {}
    }

    req.set_content_type(&mime);
    req.set_header("Last-Modified", httpdate::fmt_http_date(mtime(mtime_secs)));
    req.set_header("ETag", etag.clone());
    req.set_header("Accept-Ranges", "bytes");
    if let Some(token) = encoding {
        req.set_header("Content-Encoding", token);
    }
    apply_cache_directives(req, route, &file_path);

    // Ranges apply only when If-Range (if present) still names the
    // current entity.
    let ranges = if !req.ranges.is_empty() && if_range_matches(req, &etag, mtime_secs) {
        let specs = req.ranges.clone();
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in &specs {
            match spec.resolve(size) {
                Some(range) => resolved.push(range),
                None => {
                    req.set_header("Content-Range", format!("bytes */{}", size));
                    return req.error_response(416, "").await;
                }
            }
        }
        resolved
    } else {
        Vec::new()
    };

    match ranges.len() {
        0 => {
            req.set_content_length(size);
            req.write_headers().await?;
            if req.method == Method::Get {
                send_file_range(req, &serve_path, 0, size).await?;
            }
        }
        1 => {
            let range = ranges[0];
            req.set_status(206);
            req.set_header(
                "Content-Range",
                format!("bytes {}-{}/{}", range.start, range.end - 1, size),
            );
            req.set_content_length(range.len());
            req.write_headers().await?;
            if req.method == Method::Get {
                send_file_range(req, &serve_path, range.start, range.len()).await?;
            }
        }
        _ => {
            send_multirange(req, &serve_path, &mime, &ranges, size).await?;
        }
    }
    req.finalize().await.map(|_| ())
}

/// RFC 7232 §6 evaluation order.
fn evaluate_conditionals(req: &WebRequest, etag: &str, mtime_secs: u64) -> Conditional {
    if !req.if_match.is_empty() {
        if !req.if_match.iter().any(|t| http::etag_match(t, etag, true)) {
            return Conditional::PreconditionFailed;
        }
    } else if let Some(since) = req.if_unmodified_since {
        if mtime_secs > unix_secs(since) {
            return Conditional::PreconditionFailed;
        }
    }

    if !req.if_none_match.is_empty() {
        if req
            .if_none_match
            .iter()
            .any(|t| http::etag_match(t, etag, false))
        {
            // GET/HEAD only here; other methods never reach the file
            // handler.
            return Conditional::NotModified;
        }
        // A present If-None-Match suppresses If-Modified-Since.
        return Conditional::Proceed;
    }

    if let Some(since) = req.if_modified_since {
        if mtime_secs <= unix_secs(since) {
            return Conditional::NotModified;
        }
    }
    Conditional::Proceed
}

/// `If-Range` holds either an entity tag (strong comparison) or an
/// HTTP date (match when the entity is not newer).
fn if_range_matches(req: &WebRequest, etag: &str, mtime_secs: u64) -> bool {
    match &req.if_range {
        None => true,
        Some(value) if value.starts_with('"') || value.starts_with("W/") => {
            http::etag_match(value, etag, true)
        }
        Some(value) => match httpdate::parse_http_date(value) {
            Ok(date) => mtime_secs <= unix_secs(date),
            Err(_) => false,
        },
    }
}

async fn send_multirange(
    req: &mut WebRequest,
    path: &Path,
    mime: &str,
    ranges: &[ByteRange],
    size: u64,
) -> WebResult<()> {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let boundary = hex::encode(bytes);

    let mut part_heads = Vec::with_capacity(ranges.len());
    let mut total: u64 = 0;
    for (index, range) in ranges.iter().enumerate() {
        let lead = if index == 0 { "" } else { "\r\n" };
        let head = format!(
            "{}--{}\r\nContent-Type: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
            lead,
            boundary,
            mime,
            range.start,
            range.end - 1,
            size
        );
        total += head.len() as u64 + range.len();
        part_heads.push(head);
    }
    let trailer = format!("\r\n--{}--\r\n", boundary);
    total += trailer.len() as u64;

    req.set_status(206);
    req.set_content_type(&format!("multipart/byteranges; boundary={}", boundary));
    req.set_content_length(total);
    req.write_headers().await?;
    if req.method == Method::Head {
        return Ok(());
    }
    for (head, range) in part_heads.iter().zip(ranges) {
        req.write(head.as_bytes()).await?;
        send_file_range(req, path, range.start, range.len()).await?;
    }
    req.write(trailer.as_bytes()).await
}

async fn send_file_range(
    req: &mut WebRequest,
    path: &Path,
    start: u64,
    len: u64,
) -> WebResult<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| WebError::NotFound(format!("{}: {}", path.display(), e)))?;
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| WebError::CantRead(e.to_string()))?;
    }
    let mut remaining = len;
    let mut chunk = vec![0u8; FILE_CHUNK];
    while remaining > 0 {
        let want = (remaining.min(FILE_CHUNK as u64)) as usize;
        let n = file
            .read(&mut chunk[..want])
            .await
            .map_err(|e| WebError::CantRead(e.to_string()))?;
        if n == 0 {
            return Err(WebError::CantRead("file truncated while serving".into()));
        }
        req.write(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

fn apply_cache_directives(req: &mut WebRequest, route: &Route, path: &Path) {
    let extension_allowed = route.extensions.is_empty()
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| route.extensions.iter().any(|allowed| allowed == e));
    if !extension_allowed {
        return;
    }
    match (&route.cache_directives, route.cache_max_age) {
        (Some(directives), _) => req.set_header("Cache-Control", directives.clone()),
        (None, Some(max_age)) => {
            req.set_header("Cache-Control", format!("max-age={}", max_age));
        }
        (None, None) => {}
    }
}

fn variant_path(path: &Path, suffix: &str) -> PathBuf {
    let mut text = path.as_os_str().to_os_string();
    text.push(".");
    text.push(suffix);
    PathBuf::from(text)
}

fn mtime(secs: u64) -> SystemTime {
    UNIX_EPOCH + std::time::Duration::from_secs(secs)
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_path() {
        assert_eq!(
            variant_path(Path::new("/www/app.js"), "gz"),
            PathBuf::from("/www/app.js.gz")
        );
        assert_eq!(
            variant_path(Path::new("/www/app.js"), "br"),
            PathBuf::from("/www/app.js.br")
        );
    }
}
