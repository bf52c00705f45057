//! The byte-pipe abstraction (spec.md §4.1): a full-duplex socket, with or
//! without a TLS layer attached, presented as a single `AsyncRead +
//! AsyncWrite` type so the relay loops in `relay` don't need to match on
//! which transport an endpoint actually uses.
//!
//! The original models this as callbacks plus explicit input/output queues
//! with a high-water mark; tokio's own per-task backpressure (a bounded
//! read into a fixed buffer, not written onward until the peer accepts it)
//! gives the same effect without hand-rolled queues, so this module keeps
//! only what the teacher's pipe type owns that tokio doesn't: the TLS
//! sum-type and the graceful-shutdown-before-close release procedure.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// Reads past this many buffered-but-unconsumed bytes pause the producing
/// side (spec.md §4.1, §6).
pub const HIGH_WATER_MARK: usize = 128 * 1024;

/// A socket endpoint, optionally TLS-terminated. `TlsServer` is the
/// accepting role (src side terminating a client's handshake); `TlsClient`
/// is the connecting role (dst side performing a handshake to the real
/// upstream). Plain carries either a never-upgraded pipe or the underlying
/// socket of one that will be filter-upgraded in place (§4.1
/// `upgrade_in_place`).
pub enum Pipe {
    Plain(TcpStream),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Pipe {
    pub fn plain(stream: TcpStream) -> Self {
        Pipe::Plain(stream)
    }

    pub fn tls_server(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        Pipe::TlsServer(Box::new(stream))
    }

    pub fn tls_client(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        Pipe::TlsClient(Box::new(stream))
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Pipe::Plain(_))
    }

    /// Negotiated protocol version/cipher suite, for the connect-log line
    /// (spec.md §6 `sproto`/`dproto`), if a TLS handshake has completed.
    pub fn tls_info(&self) -> Option<(String, String)> {
        match self {
            Pipe::Plain(_) => None,
            Pipe::TlsServer(s) => {
                let conn = s.get_ref().1;
                let version = conn.protocol_version()?;
                let suite = conn.negotiated_cipher_suite()?;
                Some((format!("{version:?}"), format!("{suite:?}")))
            }
            Pipe::TlsClient(s) => {
                let conn = s.get_ref().1;
                let version = conn.protocol_version()?;
                let suite = conn.negotiated_cipher_suite()?;
                Some((format!("{version:?}"), format!("{suite:?}")))
            }
        }
    }

    /// Release the pipe: for a TLS-attached endpoint, attempt a graceful
    /// shutdown (close_notify) before the underlying socket goes away; an
    /// unclean TLS close is tolerated and never surfaced as an error
    /// (spec.md §4.1 "dirty-shutdown is tolerated").
    pub async fn release(mut self) {
        let result = match &mut self {
            Pipe::Plain(s) => s.shutdown().await,
            Pipe::TlsServer(s) => s.shutdown().await,
            Pipe::TlsClient(s) => s.shutdown().await,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "pipe shutdown did not complete cleanly");
        }
    }
}

impl AsyncRead for Pipe {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pipe::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Pipe::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Pipe::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Pipe {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Pipe::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Pipe::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Pipe::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pipe::Plain(s) => Pin::new(s).poll_flush(cx),
            Pipe::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Pipe::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pipe::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Pipe::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Pipe::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_pipe_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut pipe = Pipe::plain(stream);
            let mut buf = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut pipe, &mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            pipe.release().await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        server.await.unwrap();
    }
}
