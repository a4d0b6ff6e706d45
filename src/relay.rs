use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::http::parse::{Event, MessageParser, MethodQueue, ParseError, Side};
use crate::intercept::Pipeline;
use crate::stream::Socket;
use crate::strng;
use crate::strng::Strng;

// Initially a 1k read buffer per direction; upgraded for high traffic
// connections. TLS record size max is 16k, leave room for framing overhead.
const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
// After 128k of data on one direction, trigger the resize.
const RESIZE_THRESHOLD: u64 = 128 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),

	#[error("parse: {0}")]
	Parse(#[from] ParseError),

	#[error("destination disconnected before all data was written")]
	BackendDisconnected,

	#[error("client disconnected before all data was written")]
	ClientDisconnected,

	#[error("send: {0}")]
	SendError(Box<RelayError>),

	#[error("receive: {0}")]
	ReceiveError(Box<RelayError>),
}

/// The application protocol currently flowing over a proxied connection.
/// Starts as HTTP; a `101 Switching Protocols` response latches it to the
/// upgraded token for the remainder of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
	Http,
	Other(Strng),
}

/// Shared per-connection protocol state, read by both directional transducers.
/// The latch is one-way: nothing ever sets it back to HTTP.
#[derive(Debug, Clone)]
pub struct ProtocolCell(Arc<Mutex<Protocol>>);

impl Default for ProtocolCell {
	fn default() -> Self {
		Self::new()
	}
}

impl ProtocolCell {
	pub fn new() -> Self {
		ProtocolCell(Arc::new(Mutex::new(Protocol::Http)))
	}

	pub fn get(&self) -> Protocol {
		self.0.lock().expect("mutex acquired").clone()
	}

	pub fn is_http(&self) -> bool {
		*self.0.lock().expect("mutex acquired") == Protocol::Http
	}

	fn set(&self, protocol: Protocol) {
		*self.0.lock().expect("mutex acquired") = protocol;
	}
}

/// One direction of a proxied connection: a byte stream that parses the HTTP
/// traffic it carries.
///
/// While a head is being framed the input is buffered and nothing is emitted;
/// when the head completes, the interceptor-transformed serialization goes out
/// in its place, atomically before any body byte. Body bytes stream through
/// raw. Once the shared protocol cell leaves HTTP, the transducer passes every
/// chunk through untouched and never consults the parser again.
pub struct Transducer {
	side: Side,
	parser: MessageParser,
	protocol: ProtocolCell,
	interceptors: Arc<Pipeline>,
	opaque: bool,
}

impl Transducer {
	/// `protocol` and `methods` are shared with the transducer for the other
	/// direction of the same connection: the first carries the upgrade latch,
	/// the second the outstanding request methods that response framing
	/// depends on.
	pub fn new(
		side: Side,
		protocol: ProtocolCell,
		interceptors: Arc<Pipeline>,
		methods: MethodQueue,
	) -> Self {
		Transducer {
			side,
			parser: MessageParser::with_methods(side, methods),
			protocol,
			interceptors,
			opaque: false,
		}
	}

	/// Push one input chunk through, appending output chunks to `out`.
	pub fn advance(&mut self, chunk: Bytes, out: &mut Vec<Bytes>) -> Result<(), ParseError> {
		if !self.opaque && !self.protocol.is_http() {
			// The other direction latched the tunnel while we were framing;
			// whatever we held belongs to the upgraded protocol.
			self.opaque = true;
			let held = self.parser.take_buffered();
			if !held.is_empty() {
				out.push(held);
			}
		}
		if self.opaque {
			out.push(chunk);
			return Ok(());
		}
		self.parser.feed(&chunk);
		while let Some(event) = self.parser.next_event()? {
			match event {
				Event::Headers(mut msg) => {
					let switches = self.side == Side::Response && msg.status_code() == Some(101);
					self.interceptors.apply(self.side, &mut msg);
					out.push(msg.serialize());
					if switches {
						let token = msg
							.headers
							.get_str("upgrade")
							.map(strng::new)
							.unwrap_or_else(|| strng::literal!("unknown"));
						debug!(%token, "101 seen, latching connection opaque");
						self.protocol.set(Protocol::Other(token));
						self.opaque = true;
						let rest = self.parser.take_buffered();
						if !rest.is_empty() {
							out.push(rest);
						}
						return Ok(());
					}
				},
				Event::Body(data) => out.push(data),
				Event::End => trace!(side = ?self.side, "message complete"),
			}
		}
		Ok(())
	}

	/// End of input: emit anything still buffered mid-head as a single tail
	/// chunk so a half-closed, never-parseable stream loses no bytes.
	pub fn flush(&mut self, out: &mut Vec<Bytes>) {
		let held = self.parser.take_buffered();
		if !held.is_empty() {
			out.push(held);
		}
	}
}

// A TCP connection can close at any time, gracefully or not. Peer resets on
// either end are an expected end-of-stream, not an error to surface.
fn is_benign_io(e: &io::Error) -> bool {
	use io::ErrorKind::*;
	matches!(
		e.kind(),
		NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe
	)
}

/// Write out every pending chunk. Returns Ok(false) when the peer went away
/// mid-write (stop copying, nothing lost that could be delivered).
async fn write_all_out<W>(
	writer: &mut W,
	out: &mut Vec<Bytes>,
	amt: &mut u64,
) -> Result<bool, RelayError>
where
	W: AsyncWrite + Unpin,
{
	for chunk in out.drain(..) {
		match writer.write_all(&chunk).await {
			Ok(()) => *amt += chunk.len() as u64,
			Err(e) if is_benign_io(&e) => {
				trace!(err = %e, "io terminated ungracefully");
				return Ok(false);
			},
			Err(e) => return Err(e.into()),
		}
	}
	Ok(true)
}

/// Copy one direction through its transducer until EOF or error. The byte
/// order of the logical message stream is preserved end-to-end; returns the
/// number of bytes written downstream.
async fn copy_transduced<R, W>(
	reader: &mut R,
	writer: &mut W,
	transducer: &mut Transducer,
) -> Result<u64, RelayError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
	let mut buffer_size = INITIAL_BUFFER_SIZE;
	let mut out: Vec<Bytes> = Vec::with_capacity(4);
	let mut amt: u64 = 0;
	loop {
		buf.reserve(buffer_size);
		let n = match reader.read_buf(&mut buf).await {
			Ok(n) => n,
			Err(e) if is_benign_io(&e) => 0,
			Err(e) => return Err(e.into()),
		};
		if n == 0 {
			transducer.flush(&mut out);
			write_all_out(writer, &mut out, &mut amt).await?;
			match writer.flush().await {
				Ok(()) => {},
				Err(e) if is_benign_io(&e) => {},
				Err(e) => return Err(e.into()),
			}
			return Ok(amt);
		}
		let chunk = buf.split().freeze();
		if let Err(e) = transducer.advance(chunk, &mut out) {
			// Best-effort: hand over whatever the parser still held without
			// re-framing, then let the error close the connection.
			transducer.flush(&mut out);
			let _ = write_all_out(writer, &mut out, &mut amt).await;
			let _ = writer.flush().await;
			return Err(e.into());
		}
		if !write_all_out(writer, &mut out, &mut amt).await? {
			return Ok(amt);
		}
		if buffer_size == INITIAL_BUFFER_SIZE && amt >= RESIZE_THRESHOLD {
			buffer_size = LARGE_BUFFER_SIZE;
		}
	}
}

fn translate_send(e: RelayError) -> RelayError {
	RelayError::SendError(Box::new(match e {
		RelayError::Io(ref io) if io.kind() == io::ErrorKind::WriteZero => {
			RelayError::BackendDisconnected
		},
		e => e,
	}))
}

fn translate_receive(e: RelayError) -> RelayError {
	RelayError::ReceiveError(Box::new(match e {
		RelayError::Io(ref io) if io.kind() == io::ErrorKind::WriteZero => {
			RelayError::ClientDisconnected
		},
		e => e,
	}))
}

/// Drive a proxied connection to completion: replay the buffered first client
/// bytes through the request transducer, then relay both directions until
/// both are done, either peer errors, or `close` fires (forced disconnect).
///
/// Both sockets are shut down on every exit path.
pub async fn run_connection(
	client: Socket,
	backend: Socket,
	mut request: Transducer,
	mut response: Transducer,
	initial: Bytes,
	close: CancellationToken,
) -> Result<(), RelayError> {
	let (mut client_read, mut client_write) = tokio::io::split(client);
	let (mut backend_read, mut backend_write) = tokio::io::split(backend);

	// The first chunk(s) were consumed while routing; the backend sees the
	// transducer's own output for them, so the replayed head is already
	// post-interception and pipelined body bytes survive.
	{
		let mut out = Vec::with_capacity(2);
		let mut amt = 0u64;
		request
			.advance(initial, &mut out)
			.map_err(|e| translate_send(e.into()))?;
		write_all_out(&mut backend_write, &mut out, &mut amt)
			.await
			.map_err(translate_send)?;
	}

	let client_to_backend = async {
		let res = copy_transduced(&mut client_read, &mut backend_write, &mut request)
			.await
			.map_err(translate_send);
		trace!(?res, "send complete");
		match backend_write.shutdown().await {
			Ok(()) => {},
			Err(e) if is_benign_io(&e) => {},
			Err(e) => return Err(translate_send(e.into())),
		}
		res
	};
	let backend_to_client = async {
		let res = copy_transduced(&mut backend_read, &mut client_write, &mut response)
			.await
			.map_err(translate_receive);
		trace!(?res, "receive complete");
		match client_write.shutdown().await {
			Ok(()) => {},
			Err(e) if is_benign_io(&e) => {},
			Err(e) => return Err(translate_receive(e.into())),
		}
		res
	};

	// join (not try_join) so one side completing or failing still lets the
	// other drain before teardown.
	let mut forced = false;
	let res = tokio::select! {
		_ = close.cancelled() => {
			forced = true;
			Ok(())
		},
		(sent, received) = async { tokio::join!(client_to_backend, backend_to_client) } => {
			match (sent, received) {
				(Ok(sent), Ok(received)) => {
					trace!(sent, received, "relay complete");
					Ok(())
				},
				(Err(e), _) | (_, Err(e)) => Err(e),
			}
		},
	};
	if forced {
		debug!("connection forcefully terminated");
		let _ = client_write.shutdown().await;
		let _ = backend_write.shutdown().await;
	}
	res
}
