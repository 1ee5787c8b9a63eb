//! Byte-stream transport.
//!
//! The engine sees a connection as a bidirectional byte stream with
//! deadline-aware `connect`/`read`/`write`/`close`. TLS lives outside the
//! engine: a caller that terminates TLS installs its stream through the
//! `Stream::Tls` variant, and the engine treats it exactly like TCP.
//! Transport errors are opaque here and always close the connection.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::buf::NetBuf;
use crate::error::{WebError, WebResult};
use crate::fiber::{Deadline, timed};

/// Object-safe alias for anything usable as a connection byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> AsyncStream for T {}

/// A connection byte stream: plain TCP, or an externally-established TLS
/// session wrapped behind a trait object.
pub enum Stream {
    Tcp(TcpStream),
    Tls(Box<dyn AsyncStream>),
}

impl Stream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Stream::Tls(_))
    }

    /// Forcibly drop the transport. Pending reads and writes on other
    /// fibers observe this as an I/O error.
    pub async fn close(&mut self) {
        if let Stream::Tcp(sock) = self {
            let _ = sock.shutdown().await;
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial `host:port` before the deadline lapses.
pub async fn connect(host: &str, port: u16, deadline: Deadline) -> WebResult<Stream> {
    let addr = format!("{}:{}", host, port);
    let sock = timed(deadline, async {
        TcpStream::connect(&addr)
            .await
            .map_err(|e| WebError::CantConnect(format!("{}: {}", addr, e)))
    })
    .await?;
    let _ = sock.set_nodelay(true);
    Ok(Stream::Tcp(sock))
}

/// Read some bytes into `buf`, suspending until readiness or deadline.
/// Returns the byte count; zero means orderly EOF.
pub async fn read_into(stream: &mut Stream, buf: &mut NetBuf, deadline: Deadline) -> WebResult<usize> {
    const READ_CHUNK: usize = 8 * 1024;
    let spare = buf.spare_mut(READ_CHUNK);
    let res = timed(deadline, async {
        stream.read(spare).await.map_err(WebError::read_io)
    })
    .await;
    match res {
        Ok(n) => {
            buf.commit(READ_CHUNK, n);
            Ok(n)
        }
        Err(e) => {
            buf.commit(READ_CHUNK, 0);
            Err(e)
        }
    }
}

/// Write all of `bytes`, suspending until completion or deadline.
pub async fn write_all(stream: &mut Stream, bytes: &[u8], deadline: Deadline) -> WebResult<()> {
    timed(deadline, async {
        stream.write_all(bytes).await.map_err(WebError::write_io)
    })
    .await
}

pub async fn flush(stream: &mut Stream, deadline: Deadline) -> WebResult<()> {
    timed(deadline, async {
        stream.flush().await.map_err(WebError::write_io)
    })
    .await
}
