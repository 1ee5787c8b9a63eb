//! Chunked transfer-encoding codec.
//!
//! Read side is a state machine `Start -> Data -> Start -> ... -> Eof`.
//! In `Start` the decoder consumes `<hex-size>\r\n`; a zero size moves to
//! `Eof` after the terminating blank line. In `Data` it consumes exactly
//! the chunk's bytes followed by its `\r\n`. The count of bytes remaining
//! in the current chunk is tracked apart from the boundary state, so
//! callers only ever see user data.

use crate::buf::NetBuf;
use crate::error::{WebError, WebResult};

/// Longest accepted `<hex-size>[;ext]` line before the decoder declares
/// the peer broken.
const MAX_CHUNK_LINE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Start,
    Data,
    DataEnd,
    Trailer,
    Eof,
}

#[derive(Debug)]
pub struct ChunkDecoder {
    state: ChunkState,
    remaining: u64,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Start,
            remaining: 0,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.state == ChunkState::Eof
    }

    /// Bytes of user data still expected in the current chunk; unknown
    /// (zero) while sitting on a chunk boundary.
    pub fn remaining(&self) -> u64 {
        if self.state == ChunkState::Data {
            self.remaining
        } else {
            0
        }
    }

    /// Consume as much of `buf` as possible, appending user data to `out`.
    /// Returns when the buffer is exhausted, more input is needed to make
    /// progress, or EOF is reached.
    pub fn decode(&mut self, buf: &mut NetBuf, out: &mut Vec<u8>) -> WebResult<()> {
        loop {
            match self.state {
                ChunkState::Start => {
                    let Some(line_end) = buf.find(b"\r\n") else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(WebError::BadArgs("chunk size line too long".into()));
                        }
                        return Ok(());
                    };
                    let line = buf.consume(line_end + 2);
                    let text = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| WebError::BadArgs("bad chunk size".into()))?;
                    // Chunk extensions after ';' are ignored.
                    let size_text = text.split(';').next().unwrap_or("").trim();
                    if size_text.is_empty() {
                        // Tolerate a bare CRLF between chunks.
                        continue;
                    }
                    let size = u64::from_str_radix(size_text, 16)
                        .map_err(|_| WebError::BadArgs(format!("bad chunk size: {}", size_text)))?;
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.remaining = size;
                        self.state = ChunkState::Data;
                    }
                }
                ChunkState::Data => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let take = (self.remaining.min(buf.len() as u64)) as usize;
                    let data = buf.consume(take);
                    out.extend_from_slice(&data);
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    }
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    let crlf = buf.consume(2);
                    if &crlf[..] != b"\r\n" {
                        return Err(WebError::BadArgs("missing chunk terminator".into()));
                    }
                    self.state = ChunkState::Start;
                }
                ChunkState::Trailer => {
                    // Only the chunk-end blank line is required; any
                    // trailer fields before it are consumed and dropped.
                    let Some(line_end) = buf.find(b"\r\n") else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(WebError::BadArgs("trailer line too long".into()));
                        }
                        return Ok(());
                    };
                    let line = buf.consume(line_end + 2);
                    if line_end == 0 {
                        self.state = ChunkState::Eof;
                        return Ok(());
                    }
                    let _ = line;
                }
                ChunkState::Eof => return Ok(()),
            }
        }
    }
}

/// Frame one body write as a chunk. Empty input emits nothing (a zero
/// size would terminate the stream).
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Terminate a chunked body.
pub fn encode_final(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dechunk(wire: &[u8]) -> WebResult<(Vec<u8>, bool)> {
        let mut buf = NetBuf::new();
        buf.append(wire);
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        decoder.decode(&mut buf, &mut out)?;
        Ok((out, decoder.is_eof()))
    }

    #[test]
    fn test_decode_single_chunk() {
        let (out, eof) = dechunk(b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
        assert!(eof);
    }

    #[test]
    fn test_decode_multiple_chunks() {
        let (out, eof) = dechunk(b"3\r\nfoo\r\n4\r\nbars\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"foobars");
        assert!(eof);
    }

    #[test]
    fn test_decode_incremental_feed() {
        let wire = b"6\r\nabcdef\r\n0\r\n\r\n";
        let mut buf = NetBuf::new();
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        for byte in wire {
            buf.append(&[*byte]);
            decoder.decode(&mut buf, &mut out).unwrap();
        }
        assert_eq!(out, b"abcdef");
        assert!(decoder.is_eof());
    }

    #[test]
    fn test_decode_ignores_extensions_and_trailers() {
        let (out, eof) = dechunk(b"3;name=v\r\nxyz\r\n0\r\nX-Sum: 9\r\n\r\n").unwrap();
        assert_eq!(out, b"xyz");
        assert!(eof);
    }

    #[test]
    fn test_decode_rejects_bad_size() {
        assert!(dechunk(b"zz\r\nhello\r\n").is_err());
    }

    #[test]
    fn test_remaining_tracks_current_chunk() {
        let mut buf = NetBuf::new();
        buf.append(b"a\r\n12345");
        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        decoder.decode(&mut buf, &mut out).unwrap();
        assert_eq!(out, b"12345");
        assert_eq!(decoder.remaining(), 5);
        assert!(!decoder.is_eof());
    }

    #[test]
    fn test_roundtrip_chunk_then_dechunk() {
        let payload = b"The quick brown fox jumps over the lazy dog".repeat(50);
        let mut wire = Vec::new();
        for piece in payload.chunks(97) {
            encode_chunk(piece, &mut wire);
        }
        encode_final(&mut wire);
        let (out, eof) = dechunk(&wire).unwrap();
        assert_eq!(out, payload);
        assert!(eof);
    }

    #[test]
    fn test_empty_write_emits_nothing() {
        let mut out = Vec::new();
        encode_chunk(b"", &mut out);
        assert!(out.is_empty());
    }
}
