//! Network stream abstraction for backend sessions
//!
//! Backend sessions are TLS in production and plain TCP in tests; the pool
//! and pipe work with either through this enum.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A backend stream: plain TCP or client-side TLS.
///
/// The TLS variant is boxed; `TlsStream` is much larger than `TcpStream`.
#[derive(Debug)]
pub enum NetworkStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetworkStream {
    pub fn tcp(stream: TcpStream) -> Self {
        NetworkStream::Tcp(stream)
    }

    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        NetworkStream::Tls(Box::new(stream))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, NetworkStream::Tls(_))
    }

    /// Negotiated TLS protocol version, if encrypted.
    pub fn tls_version(&self) -> Option<&'static str> {
        match self {
            NetworkStream::Tcp(_) => None,
            NetworkStream::Tls(tls) => tls.get_ref().1.protocol_version().map(|v| match v {
                rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
                rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
                _ => "TLS (unknown version)",
            }),
        }
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
