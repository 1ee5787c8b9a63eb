//! Server-Sent Events.
//!
//! The reader consumes a response as a lazy sequence of events. Fields
//! `id:`, `event:` and `data:` accumulate until the blank-line
//! terminator; multiple `data:` lines join with `\n`. On EOF or error the
//! reader reopens the request — resending the original headers plus
//! `Last-Event-Id` — while retries remain.

use crate::client::WebClient;
use crate::error::{WebError, WebResult};
use crate::http::Method;
use crate::request::WebRequest;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> SseEvent {
        SseEvent {
            id: None,
            event: None,
            data: data.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> SseEvent {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> SseEvent {
        self.event = Some(event.into());
        self
    }
}

/// Wire form of one event: field lines plus the blank terminator.
pub fn format_event(event: &SseEvent) -> String {
    let mut out = String::new();
    if let Some(id) = &event.id {
        out.push_str(&format!("id: {}\n", id));
    }
    if let Some(name) = &event.event {
        out.push_str(&format!("event: {}\n", name));
    }
    for line in event.data.split('\n') {
        out.push_str(&format!("data: {}\n", line));
    }
    out.push('\n');
    out
}

/// Server-side helper: set up the stream headers and emit events from a
/// handler fiber.
pub async fn start_stream(req: &mut WebRequest) -> WebResult<()> {
    req.set_content_type("text/event-stream");
    req.set_header("Cache-Control", "no-cache");
    req.write_headers().await
}

pub async fn write_event(req: &mut WebRequest, event: &SseEvent) -> WebResult<()> {
    req.write(format_event(event).as_bytes()).await
}

pub struct SseReader {
    client: WebClient,
    url: String,
    headers: Vec<(String, String)>,
    max_retries: u32,
    retries_left: u32,
    buffer: String,
    last_id: Option<String>,
    open: bool,
    done: bool,
}

impl SseReader {
    pub fn new(url: &str) -> SseReader {
        SseReader {
            client: WebClient::new(),
            url: url.to_string(),
            headers: Vec::new(),
            max_retries: 0,
            retries_left: 0,
            buffer: String::new(),
            last_id: None,
            open: false,
            done: false,
        }
    }

    /// Reconnect budget. Zero means a single shot.
    pub fn retries(mut self, count: u32) -> SseReader {
        self.max_retries = count;
        self.retries_left = count;
        self
    }

    /// Extra header to send on every open and reopen.
    pub fn header(mut self, name: &str, value: &str) -> SseReader {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    pub fn client_mut(&mut self) -> &mut WebClient {
        &mut self.client
    }

    async fn open(&mut self) -> WebResult<()> {
        self.client.start(Method::Get, &self.url).await?;
        self.client.set_header("Accept", "text/event-stream");
        for (name, value) in &self.headers {
            self.client.set_header(name, value.clone());
        }
        if let Some(id) = &self.last_id {
            self.client.set_header("Last-Event-Id", id.clone());
        }
        let status = self.client.finalize().await?;
        if status != 200 {
            return Err(WebError::CantConnect(format!("sse open: status {}", status)));
        }
        self.buffer.clear();
        self.open = true;
        Ok(())
    }

    /// The next event, reconnecting as needed. `Ok(None)` once the stream
    /// ends with no retries left.
    pub async fn next(&mut self) -> WebResult<Option<SseEvent>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if !self.open {
                match self.open().await {
                    Ok(()) => {}
                    Err(e) => {
                        if self.retries_left == 0 {
                            self.done = true;
                            return Err(e);
                        }
                        self.retries_left -= 1;
                        continue;
                    }
                }
            }

            if let Some(event) = self.next_buffered() {
                return Ok(Some(event));
            }

            match self.client.read_chunk().await {
                Ok(Some(piece)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&piece));
                }
                Ok(None) | Err(_) => {
                    self.open = false;
                    if self.retries_left == 0 {
                        self.done = true;
                        return Ok(None);
                    }
                    self.retries_left -= 1;
                }
            }
        }
    }

    /// Pop the first complete event block out of the buffer.
    fn next_buffered(&mut self) -> Option<SseEvent> {
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(event) = self.parse_block(&block) {
                return Some(event);
            }
        }
        None
    }

    fn parse_block(&mut self, block: &str) -> Option<SseEvent> {
        let mut event = SseEvent::default();
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = field(line, "id") {
                self.last_id = Some(value.to_string());
                event.id = Some(value.to_string());
            } else if let Some(value) = field(line, "event") {
                event.event = Some(value.to_string());
            } else if let Some(value) = field(line, "data") {
                data_lines.push(value);
            }
            // retry: is parsed but reconnect pacing is the caller's call.
        }
        if data_lines.is_empty() {
            return None;
        }
        event.data = data_lines.join("\n");
        Some(event)
    }
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_event() {
        let event = SseEvent::new("a\nb").with_id("7").with_event("tick");
        assert_eq!(format_event(&event), "id: 7\nevent: tick\ndata: a\ndata: b\n\n");
    }

    #[test]
    fn test_parse_block_joins_data() {
        let mut reader = SseReader::new("http://localhost/events");
        let event = reader.parse_block("id: 3\ndata: one\ndata: two").unwrap();
        assert_eq!(event.id.as_deref(), Some("3"));
        assert_eq!(event.data, "one\ntwo");
        assert_eq!(reader.last_event_id(), Some("3"));
    }

    #[test]
    fn test_parse_block_skips_comments_and_empty() {
        let mut reader = SseReader::new("http://localhost/events");
        assert!(reader.parse_block(": keepalive").is_none());
        assert!(reader.parse_block("id: 9").is_none());
        assert_eq!(reader.last_event_id(), Some("9"));
    }

    #[test]
    fn test_buffered_extraction() {
        let mut reader = SseReader::new("http://localhost/events");
        reader.buffer = "data: x\n\ndata: y\n\ndata: part".to_string();
        assert_eq!(reader.next_buffered().unwrap().data, "x");
        assert_eq!(reader.next_buffered().unwrap().data, "y");
        assert!(reader.next_buffered().is_none());
        assert_eq!(reader.buffer, "data: part");
    }
}
