//! Buffered, non-blocking byte streams
//!
//! [`BufferedStream`] wraps a plain or TLS [`Transport`] with an inbound and
//! an outbound buffer. The `poll_*` functions are the readiness-level API:
//! `Poll::Pending` is the would-block signal and the task is woken when the
//! transport becomes ready again. The async wrappers are thin `poll_fn`
//! adapters over them.

use bytes::{Buf, Bytes, BytesMut};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

/// Bytes requested from the transport per read
const READ_CHUNK: usize = 16 * 1024;

/// The raw duplex stream under a request
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(tcp) => f.debug_tuple("Plain").field(&tcp.peer_addr().ok()).finish(),
            Transport::Tls(_) => f.write_str("Tls"),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// What the stream needs from the reactor to make progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
}

/// A transport with inbound and outbound buffers
pub struct BufferedStream<T = Transport> {
    io: T,
    read_buf: BytesMut,
    write_buf: BytesMut,
    eof: bool,
    bytes_read: u64,
    bytes_written: u64,
}

impl<T: AsyncRead + AsyncWrite + Unpin> BufferedStream<T> {
    pub fn new(io: T) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            eof: false,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// Read whatever the transport has into the inbound buffer
    ///
    /// Yields the number of new bytes, 0 once the peer has shut down. On
    /// error the already buffered bytes are left untouched.
    pub fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.eof {
            return Poll::Ready(Ok(0));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let mut buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.io).poll_read(cx, &mut buf))?;

        let n = buf.filled().len();
        if n == 0 {
            self.eof = true;
        } else {
            self.read_buf.extend_from_slice(buf.filled());
            self.bytes_read += n as u64;
        }
        Poll::Ready(Ok(n))
    }

    pub async fn fill(&mut self) -> io::Result<usize> {
        poll_fn(|cx| self.poll_fill(cx)).await
    }

    /// Queue bytes for the peer
    pub fn queue(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Write queued bytes until the outbound buffer is empty
    ///
    /// Partial writes keep the remainder queued, so a `Pending` result can
    /// simply be polled again later.
    pub fn poll_flush_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
            self.bytes_written += n as u64;
        }
        Pin::new(&mut self.io).poll_flush(cx)
    }

    pub async fn flush_out(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_flush_out(cx)).await
    }

    /// Take up to `max` bytes from the front of the inbound buffer
    pub fn drain(&mut self, max: usize) -> Bytes {
        let n = max.min(self.read_buf.len());
        self.read_buf.split_to(n).freeze()
    }

    /// Drop `n` bytes from the front of the inbound buffer
    pub fn consume(&mut self, n: usize) {
        self.read_buf.advance(n.min(self.read_buf.len()));
    }

    /// Bytes received but not yet drained
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    /// Discard everything received but not yet drained
    pub fn discard(&mut self) -> usize {
        let n = self.read_buf.len();
        self.read_buf.clear();
        n
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            read: !self.eof && self.write_buf.is_empty(),
            write: !self.write_buf.is_empty(),
        }
    }

    /// Flush pending output, then shut the transport down
    ///
    /// For TLS this sends close_notify. Each step may return `Pending`; the
    /// sequence resumes where it stopped on the next poll.
    pub fn poll_close(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_flush_out(cx))?;
        Pin::new(&mut self.io).poll_shutdown(cx)
    }

    pub async fn close(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_close(cx)).await
    }

    /// Total bytes read and written
    pub fn traffic(&self) -> (u64, u64) {
        (self.bytes_read, self.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_fill_and_drain_in_order() {
        let (client, mut server) = duplex(64);
        let mut stream = BufferedStream::new(client);

        server.write_all(b"hello ").await.unwrap();
        assert_eq!(stream.fill().await.unwrap(), 6);
        server.write_all(b"world").await.unwrap();
        assert_eq!(stream.fill().await.unwrap(), 5);

        assert_eq!(&stream.drain(4)[..], b"hell");
        assert_eq!(&stream.drain(100)[..], b"o world");
        assert!(stream.buffered().is_empty());
        assert_eq!(stream.traffic().0, 11);
    }

    #[tokio::test]
    async fn test_eof_is_sticky() {
        let (client, server) = duplex(64);
        let mut stream = BufferedStream::new(client);
        drop(server);

        assert_eq!(stream.fill().await.unwrap(), 0);
        assert!(stream.is_eof());
        assert_eq!(stream.fill().await.unwrap(), 0);
        assert!(!stream.readiness().read);
    }

    #[tokio::test]
    async fn test_partial_writes_keep_remainder() {
        // The duplex buffer is smaller than the payload, forcing partial writes
        let (client, mut server) = duplex(8);
        let mut stream = BufferedStream::new(client);
        stream.queue(b"0123456789abcdef\r\n");
        assert!(stream.readiness().write);

        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; 18];
            server.read_exact(&mut got).await.unwrap();
            got
        });

        stream.flush_out().await.unwrap();
        assert!(!stream.readiness().write);
        assert_eq!(reader.await.unwrap(), b"0123456789abcdef\r\n");
        assert_eq!(stream.traffic().1, 18);
    }

    #[tokio::test]
    async fn test_would_block_when_no_data() {
        let (client, _server) = duplex(8);
        let mut stream = BufferedStream::new(client);
        {
            let mut fill = tokio_test::task::spawn(stream.fill());
            assert!(fill.poll().is_pending());
        }
        assert!(stream.buffered().is_empty());
        assert!(!stream.is_eof());
    }

    #[tokio::test]
    async fn test_close_flushes_then_shuts_down() {
        let (client, mut server) = duplex(64);
        let mut stream = BufferedStream::new(client);
        stream.queue(b"bye");
        stream.close().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
    }

    #[tokio::test]
    async fn test_consume_and_discard() {
        let (client, mut server) = duplex(64);
        let mut stream = BufferedStream::new(client);
        server.write_all(b"20 ok\r\nbody").await.unwrap();
        stream.fill().await.unwrap();

        stream.consume(7);
        assert_eq!(stream.buffered(), b"body");
        assert_eq!(stream.discard(), 4);
        assert!(stream.buffered().is_empty());
    }
}
