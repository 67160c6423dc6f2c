//! Socket wrapper that lets the bridge treat plain TCP and both TLS roles
//! uniformly.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum Stream {
	Tcp(TcpStream),
	/// Our client-side connection to the origin.
	TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
	/// Our server-side connection to the downstream client, speaking a
	/// spoofed certificate.
	TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Stream {
	pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
		self.tcp().set_nodelay(nodelay)
	}

	fn tcp(&self) -> &TcpStream {
		match self {
			Stream::Tcp(s) => s,
			Stream::TlsClient(s) => s.get_ref().0,
			Stream::TlsServer(s) => s.get_ref().0,
		}
	}
}

impl From<TcpStream> for Stream {
	fn from(s: TcpStream) -> Self {
		Stream::Tcp(s)
	}
}

impl From<tokio_rustls::client::TlsStream<TcpStream>> for Stream {
	fn from(s: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
		Stream::TlsClient(Box::new(s))
	}
}

impl From<tokio_rustls::server::TlsStream<TcpStream>> for Stream {
	fn from(s: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
		Stream::TlsServer(Box::new(s))
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
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
			Stream::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
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
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
			Stream::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
			Stream::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match self.get_mut() {
			Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			Stream::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
			Stream::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}
