//! WebSocket (RFC 6455): upgrade handshake and frame exchange.
//!
//! The canonical flow is synchronous: a handler calls [`accept`], gets a
//! [`WebSocket`], and drives the frame loop in place. After the `101` no
//! HTTP framing applies to the connection. The client side dials with
//! [`connect`] and verifies the server's accept key; any mismatch is
//! fatal.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::buf::NetBuf;
use crate::error::{WebError, WebResult};
use crate::fiber::Deadline;
use crate::http::{self, HeaderMap};
use crate::net::{self, Stream};
use crate::request::WebRequest;
use crate::url::Url;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xa;

/// `base64(sha1(key + GUID))` per RFC 6455 §4.2.2.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

pub struct WebSocket {
    stream: Stream,
    rx: NetBuf,
    /// Client endpoints mask what they send; servers must not.
    masking: bool,
    max_frame: usize,
    max_message: usize,
    close_sent: bool,
    closed: bool,
}

/// Server-side upgrade: validate the handshake, emit `101`, and hand the
/// connection to the frame loop. The request can no longer produce HTTP
/// output afterwards.
pub async fn accept(req: &mut WebRequest) -> WebResult<WebSocket> {
    if !req.is_upgrade_request() {
        req.error_response(400, "Not a WebSocket upgrade").await?;
        return Err(WebError::BadArgs("not a websocket upgrade".into()));
    }
    if req.headers.get("Sec-WebSocket-Version") != Some("13") {
        req.set_header("Sec-WebSocket-Version", "13");
        req.error_response(426, "").await?;
        return Err(WebError::BadArgs("unsupported websocket version".into()));
    }
    let Some(key) = req.headers.get("Sec-WebSocket-Key").map(str::to_string) else {
        req.error_response(400, "Missing Sec-WebSocket-Key").await?;
        return Err(WebError::BadArgs("missing websocket key".into()));
    };

    let head = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    req.write_raw(head.as_bytes()).await?;
    let limits = &req.host.config.limits;
    let (max_frame, max_message) = (limits.web_sockets_max_frame, limits.web_sockets_max_message);
    let (stream, rx) = req.take_stream()?;
    Ok(WebSocket {
        stream,
        rx,
        masking: false,
        max_frame,
        max_message,
        close_sent: false,
        closed: false,
    })
}

/// Client-side connect and upgrade. Only `ws://` URLs are accepted here;
/// a TLS-wrapped stream must come from the transport layer.
pub async fn connect(url_text: &str, extra: &[(&str, &str)], deadline: Deadline) -> WebResult<WebSocket> {
    let url = Url::parse_with_default(url_text, "ws")?;
    if url.scheme != "ws" {
        return Err(WebError::BadArgs(format!(
            "websocket connect needs a ws:// url, got {}",
            url.scheme
        )));
    }
    let host = url.host_or_localhost().to_string();
    let mut stream = net::connect(&host, url.port, deadline).await?;

    let mut key_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);
    let key = BASE64.encode(key_bytes);
    let expected = accept_key(&key);

    let mut head = format!(
        "GET {} HTTP/1.1\r\nHost: {}:{}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        url.request_target(),
        host,
        url.port,
        key
    );
    for (name, value) in extra {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    net::write_all(&mut stream, head.as_bytes(), deadline).await?;

    // Response head.
    let mut rx = NetBuf::new();
    let head_end = loop {
        if let Some(idx) = rx.find(b"\r\n\r\n") {
            break idx;
        }
        let n = net::read_into(&mut stream, &mut rx, deadline).await?;
        if n == 0 {
            return Err(WebError::CantConnect("closed during websocket handshake".into()));
        }
    };
    let block = rx.consume(head_end + 4);
    let line_end = crate::buf::find(&block, b"\r\n").unwrap_or(block.len());
    let first_line = String::from_utf8_lossy(&block[..line_end]).into_owned();
    let (_, status, _) = http::parse_response_line(&first_line)?;
    let headers = HeaderMap::parse_block(&block[(line_end + 2).min(block.len())..head_end + 2])?;

    if status != 101 {
        return Err(WebError::CantConnect(format!("upgrade refused: {}", status)));
    }
    let upgrade_ok = headers
        .get("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection_ok = headers
        .get("Connection")
        .is_some_and(|v| http::value_has_token(v, "upgrade"));
    let accept_ok = headers.get("Sec-WebSocket-Accept") == Some(expected.as_str());
    if !upgrade_ok || !connection_ok || !accept_ok {
        return Err(WebError::CantConnect("bad websocket upgrade response".into()));
    }

    Ok(WebSocket {
        stream,
        rx,
        masking: true,
        max_frame: 64 * 1024,
        max_message: 256 * 1024,
        close_sent: false,
        closed: false,
    })
}

impl WebSocket {
    pub fn set_limits(&mut self, max_frame: usize, max_message: usize) {
        self.max_frame = max_frame;
        self.max_message = max_message;
    }

    pub async fn send_text(&mut self, text: &str) -> WebResult<()> {
        self.send_frame(OP_TEXT, text.as_bytes(), Deadline::none()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> WebResult<()> {
        self.send_frame(OP_BINARY, data, Deadline::none()).await
    }

    pub async fn send_ping(&mut self, payload: &[u8]) -> WebResult<()> {
        self.send_frame(OP_PING, payload, Deadline::none()).await
    }

    /// Start (or answer) the close handshake.
    pub async fn close(&mut self, code: u16, reason: &str) -> WebResult<()> {
        if self.close_sent {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.close_sent = true;
        self.send_frame(OP_CLOSE, &payload, Deadline::in_secs(5)).await
    }

    async fn send_frame(&mut self, opcode: u8, payload: &[u8], deadline: Deadline) -> WebResult<()> {
        if self.closed {
            return Err(WebError::BadState("websocket is closed".into()));
        }
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(0x80 | opcode);
        let mask_bit = if self.masking { 0x80 } else { 0x00 };
        match payload.len() {
            len if len < 126 => frame.push(mask_bit | len as u8),
            len if len <= u16::MAX as usize => {
                frame.push(mask_bit | 126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                frame.push(mask_bit | 127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        if self.masking {
            let mut mask = [0u8; 4];
            rand::rngs::OsRng.fill_bytes(&mut mask);
            frame.extend_from_slice(&mask);
            frame.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ mask[i % 4]),
            );
        } else {
            frame.extend_from_slice(payload);
        }
        net::write_all(&mut self.stream, &frame, deadline).await?;
        net::flush(&mut self.stream, deadline).await
    }

    /// Receive the next data message, transparently answering pings and
    /// reassembling fragments. `Ok(None)` after the close handshake or an
    /// orderly EOF.
    pub async fn recv(&mut self, deadline: Deadline) -> WebResult<Option<Message>> {
        let mut assembling: Option<(u8, Vec<u8>)> = None;
        loop {
            let Some((fin, opcode, payload)) = self.next_frame(deadline).await? else {
                return Ok(None);
            };
            match opcode {
                OP_PING => {
                    self.send_frame(OP_PONG, &payload, deadline).await?;
                }
                OP_PONG => {}
                OP_CLOSE => {
                    if !self.close_sent {
                        let code = payload
                            .get(..2)
                            .map(|b| u16::from_be_bytes([b[0], b[1]]))
                            .unwrap_or(1000);
                        let _ = self.close(code, "").await;
                    }
                    self.closed = true;
                    return Ok(None);
                }
                OP_TEXT | OP_BINARY => {
                    if assembling.is_some() {
                        return Err(WebError::BadArgs("interleaved websocket message".into()));
                    }
                    if fin {
                        return Ok(Some(self.into_message(opcode, payload)?));
                    }
                    assembling = Some((opcode, payload));
                }
                OP_CONTINUATION => {
                    let Some((opcode, mut data)) = assembling.take() else {
                        return Err(WebError::BadArgs("unexpected continuation frame".into()));
                    };
                    if data.len() + payload.len() > self.max_message {
                        return Err(WebError::Memory("websocket message too large".into()));
                    }
                    data.extend_from_slice(&payload);
                    if fin {
                        return Ok(Some(self.into_message(opcode, data)?));
                    }
                    assembling = Some((opcode, data));
                }
                other => {
                    return Err(WebError::BadArgs(format!("bad websocket opcode: {}", other)));
                }
            }
        }
    }

    fn into_message(&self, opcode: u8, payload: Vec<u8>) -> WebResult<Message> {
        if payload.len() > self.max_message {
            return Err(WebError::Memory("websocket message too large".into()));
        }
        match opcode {
            OP_TEXT => Ok(Message::Text(String::from_utf8(payload).map_err(|_| {
                WebError::BadArgs("websocket text frame is not utf-8".into())
            })?)),
            _ => Ok(Message::Binary(payload)),
        }
    }

    /// Read one frame off the wire. `Ok(None)` on orderly EOF.
    async fn next_frame(&mut self, deadline: Deadline) -> WebResult<Option<(bool, u8, Vec<u8>)>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }
            let n = net::read_into(&mut self.stream, &mut self.rx, deadline).await?;
            if n == 0 {
                if self.rx.is_empty() {
                    self.closed = true;
                    return Ok(None);
                }
                return Err(WebError::CantRead("closed mid-frame".into()));
            }
        }
    }

    fn parse_frame(&mut self) -> WebResult<Option<(bool, u8, Vec<u8>)>> {
        let data = self.rx.as_slice();
        if data.len() < 2 {
            return Ok(None);
        }
        let b0 = data[0];
        let b1 = data[1];
        if b0 & 0x70 != 0 {
            return Err(WebError::BadArgs("websocket rsv bits set".into()));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = b0 & 0x0f;
        let masked = b1 & 0x80 != 0;
        // The peer must mask iff we do not.
        if masked == self.masking {
            return Err(WebError::BadArgs("bad websocket mask flag".into()));
        }
        let mut offset = 2;
        let len = match b1 & 0x7f {
            126 => {
                if data.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
                offset += 2;
                len
            }
            127 => {
                if data.len() < offset + 8 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[offset..offset + 8]);
                offset += 8;
                let len = u64::from_be_bytes(bytes);
                if len > usize::MAX as u64 {
                    return Err(WebError::Memory("websocket frame too large".into()));
                }
                len as usize
            }
            len => len as usize,
        };
        if len > self.max_frame {
            return Err(WebError::Memory("websocket frame exceeds maxFrame".into()));
        }
        if opcode >= OP_CLOSE && (len > 125 || !fin) {
            return Err(WebError::BadArgs("bad websocket control frame".into()));
        }
        let mask = if masked {
            if data.len() < offset + 4 {
                return Ok(None);
            }
            let mask = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };
        if data.len() < offset + len {
            return Ok(None);
        }
        self.rx.skip(offset);
        let mut payload = self.rx.consume(len).to_vec();
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }
        Ok(Some((fin, opcode, payload)))
    }
}
