use std::io::{Error, IoSlice};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::http;
use crate::route::Endpoint;

#[derive(thiserror::Error, Debug)]
pub enum DialError {
	#[error("dial {0}: {1}")]
	Io(Endpoint, #[source] std::io::Error),

	#[error("dial {0}: timed out after {1:?}")]
	Timeout(Endpoint, Duration),

	#[error("dial {0}: IPC endpoints are not supported on this platform")]
	Unsupported(Endpoint),
}

/// A proxied stream: the accepted client connection or a dialed backend,
/// over TCP or a local IPC socket.
#[derive(Debug)]
pub enum Socket {
	Tcp(TcpStream),
	#[cfg(unix)]
	Unix(UnixStream),
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
		stream.set_nodelay(true)?;
		Ok(Socket::Tcp(stream))
	}

	/// Dial a backend endpoint with a finite timeout. The endpoint already
	/// carries any platform IPC prefix, so there is no OS-specific logic here.
	pub async fn dial(endpoint: &Endpoint, timeout: Duration) -> Result<Socket, DialError> {
		let connect = async {
			match endpoint {
				Endpoint::Tcp { host, port } => {
					let stream = TcpStream::connect((host.as_str(), *port))
						.await
						.map_err(|e| DialError::Io(endpoint.clone(), e))?;
					Socket::from_tcp(stream).map_err(|e| DialError::Io(endpoint.clone(), e))
				},
				#[cfg(unix)]
				Endpoint::Ipc { path } => UnixStream::connect(path)
					.await
					.map(Socket::Unix)
					.map_err(|e| DialError::Io(endpoint.clone(), e)),
				#[cfg(not(unix))]
				Endpoint::Ipc { .. } => Err(DialError::Unsupported(endpoint.clone())),
			}
		};
		tokio::time::timeout(timeout, connect)
			.await
			.unwrap_or_else(|_| Err(DialError::Timeout(endpoint.clone(), timeout)))
	}

	/// Write a minimal error head (`HTTP/1.1 <code> <reason>`) and shut the
	/// write side down. Failures are ignored; the peer may already be gone.
	pub async fn respond_and_close(&mut self, code: u16) {
		let _ = self.write_all(&http::error_head(code)).await;
		let _ = self.shutdown().await;
	}
}

impl AsyncRead for Socket {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Socket::Tcp(inner) => Pin::new(inner).poll_read(cx, buf),
			#[cfg(unix)]
			Socket::Unix(inner) => Pin::new(inner).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, Error>> {
		match self.get_mut() {
			Socket::Tcp(inner) => Pin::new(inner).poll_write(cx, buf),
			#[cfg(unix)]
			Socket::Unix(inner) => Pin::new(inner).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		match self.get_mut() {
			Socket::Tcp(inner) => Pin::new(inner).poll_flush(cx),
			#[cfg(unix)]
			Socket::Unix(inner) => Pin::new(inner).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
		match self.get_mut() {
			Socket::Tcp(inner) => Pin::new(inner).poll_shutdown(cx),
			#[cfg(unix)]
			Socket::Unix(inner) => Pin::new(inner).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<Result<usize, Error>> {
		match self.get_mut() {
			Socket::Tcp(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
			#[cfg(unix)]
			Socket::Unix(inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			Socket::Tcp(inner) => inner.is_write_vectored(),
			#[cfg(unix)]
			Socket::Unix(inner) => inner.is_write_vectored(),
		}
	}
}
