//! `multipart/form-data` upload parser.
//!
//! The body is scanned incrementally for boundary markers: file parts
//! spool to temp files in the configured upload directory, plain fields
//! become request variables. Temp files are unlinked when the request is
//! dropped unless `keepUploads` is set.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::buf::NetBuf;
use crate::error::{WebError, WebResult};
use crate::request::WebRequest;

/// An uploaded file owned by its request.
#[derive(Debug)]
pub struct Upload {
    /// Form field name.
    pub name: String,
    /// Filename as sent by the client.
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    path: PathBuf,
    /// Held so the temp file is unlinked when the request goes away.
    file: Option<NamedTempFile>,
}

impl Upload {
    /// Server-side temp path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detach the temp file so it survives the request.
    pub fn keep(&mut self) -> WebResult<PathBuf> {
        if let Some(file) = self.file.take() {
            let (_, path) = file
                .keep()
                .map_err(|e| WebError::CantComplete(format!("keep upload: {}", e)))?;
            self.path = path;
        }
        Ok(self.path.clone())
    }
}

/// Extract the boundary parameter from a `multipart/form-data` content
/// type.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let essence = parts.next()?.trim();
    if !essence.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    for param in parts {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[derive(PartialEq)]
enum State {
    Preamble,
    Boundary,
    Headers,
    Body,
    Done,
}

enum Sink {
    File(NamedTempFile),
    Memory(Vec<u8>),
}

struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    sink: Sink,
    size: u64,
}

/// Parse the request body as multipart, filling `req.uploads` and
/// `req.vars`.
pub async fn parse(req: &mut WebRequest, boundary: &str) -> WebResult<()> {
    let marker = format!("--{}", boundary).into_bytes();
    let delimiter = format!("\r\n--{}", boundary).into_bytes();
    let max_upload = req.host.config.limits.max_upload;
    let max_uploads = req.host.config.limits.max_uploads;
    let max_field = req.host.config.limits.max_body;
    let upload_dir = req.host.config.upload_dir.clone();
    let keep_uploads = req.host.config.keep_uploads;

    let mut acc = NetBuf::new();
    let mut state = State::Preamble;
    let mut part: Option<Part> = None;

    loop {
        let mut progressed = true;
        while progressed && state != State::Done {
            progressed = false;
            match state {
                State::Preamble => {
                    if let Some(pos) = acc.find(&marker) {
                        acc.skip(pos + marker.len());
                        state = State::Boundary;
                        progressed = true;
                    } else if acc.len() > marker.len() {
                        // Keep only a possible partial-marker tail.
                        acc.skip(acc.len() - marker.len() + 1);
                    }
                }
                State::Boundary => {
                    if acc.len() < 2 {
                        continue;
                    }
                    let head = acc.as_slice();
                    if &head[..2] == b"--" {
                        state = State::Done;
                    } else if &head[..2] == b"\r\n" {
                        acc.skip(2);
                        state = State::Headers;
                        progressed = true;
                    } else {
                        return Err(WebError::BadArgs("malformed multipart boundary".into()));
                    }
                }
                State::Headers => {
                    let Some(pos) = acc.find(b"\r\n\r\n") else {
                        if acc.len() > max_field {
                            return Err(WebError::Memory("multipart part headers too large".into()));
                        }
                        continue;
                    };
                    let block = acc.consume(pos + 4);
                    let new_part = open_part(
                        &block[..pos],
                        &upload_dir,
                        req.uploads.len(),
                        max_uploads,
                    )?;
                    part = Some(new_part);
                    state = State::Body;
                    progressed = true;
                }
                State::Body => {
                    let current = part.as_mut().ok_or_else(|| {
                        WebError::BadState("multipart body without part".into())
                    })?;
                    match acc.find(&delimiter) {
                        Some(pos) => {
                            let data = acc.consume(pos);
                            write_part(current, &data, max_upload, max_field)?;
                            acc.skip(delimiter.len());
                            if let Some(done) = part.take() {
                                finish_part(req, done, keep_uploads)?;
                            }
                            state = State::Boundary;
                            progressed = true;
                        }
                        None => {
                            // Everything except a possible partial
                            // delimiter tail is part data.
                            if acc.len() >= delimiter.len() {
                                let safe = acc.len() - delimiter.len() + 1;
                                let data = acc.consume(safe);
                                write_part(current, &data, max_upload, max_field)?;
                            }
                        }
                    }
                }
                State::Done => {}
            }
        }

        match req.read_body_chunk().await? {
            Some(piece) => acc.append(&piece),
            None => {
                if state != State::Done {
                    return Err(WebError::BadArgs("truncated multipart body".into()));
                }
                break;
            }
        }
        if state == State::Done {
            // Consume the epilogue so the connection can be reused.
            acc.clear();
        }
    }
    Ok(())
}

fn open_part(
    block: &[u8],
    upload_dir: &str,
    current_uploads: usize,
    max_uploads: usize,
) -> WebResult<Part> {
    let text = std::str::from_utf8(block)
        .map_err(|_| WebError::BadArgs("multipart headers not utf-8".into()))?;
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in text.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("content-disposition:") {
            name = disposition_param(line, "name");
            filename = disposition_param(line, "filename");
        } else if lower.starts_with("content-type:") {
            content_type = Some(line[13..].trim().to_string());
        }
    }
    let name = name.ok_or_else(|| WebError::BadArgs("multipart part without a name".into()))?;
    let sink = match &filename {
        Some(_) => {
            if current_uploads >= max_uploads {
                return Err(WebError::Memory("too many uploads".into()));
            }
            let file = tempfile::Builder::new()
                .prefix("etude-upload-")
                .tempfile_in(upload_dir)
                .map_err(|e| WebError::CantWrite(format!("upload temp file: {}", e)))?;
            Sink::File(file)
        }
        None => Sink::Memory(Vec::new()),
    };
    Ok(Part {
        name,
        filename,
        content_type,
        sink,
        size: 0,
    })
}

fn write_part(part: &mut Part, data: &[u8], max_upload: u64, max_field: usize) -> WebResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    part.size += data.len() as u64;
    match &mut part.sink {
        Sink::File(file) => {
            if part.size > max_upload {
                return Err(WebError::Memory("upload exceeds maxUpload".into()));
            }
            file.write_all(data)
                .map_err(|e| WebError::CantWrite(format!("upload write: {}", e)))?;
        }
        Sink::Memory(buffer) => {
            if part.size > max_field as u64 {
                return Err(WebError::Memory("form field exceeds maxBody".into()));
            }
            buffer.extend_from_slice(data);
        }
    }
    Ok(())
}

fn finish_part(req: &mut WebRequest, part: Part, keep_uploads: bool) -> WebResult<()> {
    match part.sink {
        Sink::File(mut file) => {
            file.flush()
                .map_err(|e| WebError::CantWrite(format!("upload flush: {}", e)))?;
            let mut upload = Upload {
                name: part.name,
                filename: part.filename.unwrap_or_default(),
                content_type: part.content_type,
                size: part.size,
                path: file.path().to_path_buf(),
                file: Some(file),
            };
            if keep_uploads {
                upload.keep()?;
            }
            req.uploads.push(upload);
        }
        Sink::Memory(buffer) => {
            let value = String::from_utf8_lossy(&buffer).into_owned();
            req.vars.push((part.name, value));
        }
    }
    Ok(())
}

/// Pull `key="value"` out of a `Content-Disposition` line.
fn disposition_param(line: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let start = line.find(&needle)? + needle.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_extraction() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=XyZ"),
            Some("XyZ".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary("application/json"), None);
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }

    #[test]
    fn test_disposition_param() {
        let line = "Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"";
        assert_eq!(disposition_param(line, "name"), Some("file".to_string()));
        assert_eq!(disposition_param(line, "filename"), Some("a.txt".to_string()));
        assert_eq!(disposition_param(line, "missing"), None);
    }
}
