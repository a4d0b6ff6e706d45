use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};

use super::{Headers, Kind, Message};
use crate::strng;
use crate::strng::Strng;

const MAX_HEADERS: usize = 100;
/// Bound on bytes buffered while framing a head. Body bytes are never
/// buffered, so this is the parser's whole memory footprint.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Request,
	Response,
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
	#[error("malformed head: {0}")]
	Head(#[from] httparse::Error),

	#[error("head exceeds {MAX_HEAD_SIZE} bytes")]
	HeadTooLarge,

	#[error("invalid content-length")]
	InvalidContentLength,

	#[error("invalid chunk framing")]
	InvalidChunk,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
	/// The start line and all headers of a message completed.
	Headers(Message),
	/// Raw wire bytes of the message body. Chunk-size lines and trailers are
	/// included for chunked messages; the framer only counts, so passthrough
	/// is bit-exact.
	Body(Bytes),
	/// The current message is complete; the parser is framing the next head.
	End,
}

/// Parse a complete head out of `buf`, if one is present. Returns the message
/// and the number of bytes the head consumed.
pub fn parse_head(side: Side, buf: &[u8]) -> Result<Option<(Message, usize)>, ParseError> {
	if buf.is_empty() {
		return Ok(None);
	}
	let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	match side {
		Side::Request => {
			let mut req = httparse::Request::new(&mut headers);
			match req.parse(buf)? {
				httparse::Status::Complete(len) => {
					let kind = Kind::Request {
						method: strng::new(req.method.unwrap_or("")),
						url: strng::new(req.path.unwrap_or("")),
					};
					let minor = req.version.unwrap_or(1) as u8;
					Ok(Some((build_message(kind, minor, req.headers), len)))
				},
				httparse::Status::Partial => Ok(None),
			}
		},
		Side::Response => {
			let mut resp = httparse::Response::new(&mut headers);
			match resp.parse(buf)? {
				httparse::Status::Complete(len) => {
					let kind = Kind::Response {
						status: resp.code.unwrap_or(0),
						reason: strng::new(resp.reason.unwrap_or("")),
					};
					let minor = resp.version.unwrap_or(1) as u8;
					Ok(Some((build_message(kind, minor, resp.headers), len)))
				},
				httparse::Status::Partial => Ok(None),
			}
		},
	}
}

fn build_message(kind: Kind, version_minor: u8, raw: &[httparse::Header]) -> Message {
	let mut headers = Headers::new();
	for h in raw {
		headers.append(h.name, h.value);
	}
	let upgrade = headers.contains("upgrade")
		|| headers.contains_token("connection", "upgrade")
		|| matches!(kind, Kind::Response { status: 101, .. });
	// RFC 7230 §6.3: 1.1 defaults to keep-alive, 1.0 to close
	let keep_alive_hint = if version_minor >= 1 {
		!headers.contains_token("connection", "close")
	} else {
		headers.contains_token("connection", "keep-alive")
	};
	Message {
		version_major: 1,
		version_minor,
		kind,
		headers,
		upgrade,
		keep_alive_hint,
	}
}

/// Decides where the current message's body ends, surfacing the body bytes
/// untouched along the way.
#[derive(Debug)]
enum BodyFramer {
	/// Sized by `Content-Length`.
	Length(u64),
	/// `Transfer-Encoding: chunked`; the scanner walks the chunk framing to
	/// find the message boundary but emits the framing verbatim.
	Chunked {
		state: ChunkedState,
		remaining: u64,
	},
	/// Close-delimited response body.
	Eof,
}

impl BodyFramer {
	/// RFC 7230 §3.3.3 message body length rules, reduced to what a relay
	/// needs. `None` means the message has no body. `request_method` is the
	/// method of the request this response answers, when known.
	fn from_head(
		side: Side,
		msg: &Message,
		request_method: Option<&str>,
	) -> Result<Option<BodyFramer>, ParseError> {
		if let Kind::Response { status, .. } = &msg.kind {
			if *status / 100 == 1 || *status == 204 || *status == 304 {
				return Ok(None);
			}
			// Responses to HEAD declare a length but carry no body bytes.
			if request_method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD")) {
				return Ok(None);
			}
		}
		if msg.headers.contains_token("transfer-encoding", "chunked") {
			return Ok(Some(BodyFramer::Chunked {
				state: ChunkedState::Size,
				remaining: 0,
			}));
		}
		let mut lengths = msg.headers.get_all("content-length");
		if let Some(first) = lengths.next() {
			// Conflicting Content-Length values are a request-smuggling
			// vector; refuse to guess.
			if lengths.any(|other| other != first) {
				return Err(ParseError::InvalidContentLength);
			}
			let len = std::str::from_utf8(first)
				.ok()
				.and_then(|v| v.trim().parse::<u64>().ok())
				.ok_or(ParseError::InvalidContentLength)?;
			return Ok(if len == 0 {
				None
			} else {
				Some(BodyFramer::Length(len))
			});
		}
		Ok(match side {
			Side::Request => None,
			Side::Response => Some(BodyFramer::Eof),
		})
	}

	/// Consume the prefix of `buf` that belongs to the current message and
	/// return it raw, plus whether the message is now complete.
	fn advance(&mut self, buf: &mut BytesMut) -> Result<(Bytes, bool), ParseError> {
		match self {
			BodyFramer::Length(remaining) => {
				let n = (*remaining).min(buf.len() as u64) as usize;
				*remaining -= n as u64;
				Ok((buf.split_to(n).freeze(), *remaining == 0))
			},
			BodyFramer::Eof => Ok((buf.split().freeze(), false)),
			BodyFramer::Chunked { state, remaining } => {
				let (consumed, done) = scan_chunked(state, remaining, buf)?;
				Ok((buf.split_to(consumed).freeze(), done))
			},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
	Size,
	SizeExt,
	SizeLf,
	Body,
	BodyCr,
	BodyLf,
	Trailer,
	TrailerLine,
	TrailerLf,
	EndLf,
}

/// Walk the chunked framing without altering it. Returns how many bytes of
/// `buf` belong to the current message and whether its terminal CRLF was
/// reached.
fn scan_chunked(
	state: &mut ChunkedState,
	remaining: &mut u64,
	buf: &[u8],
) -> Result<(usize, bool), ParseError> {
	let mut i = 0;
	while i < buf.len() {
		let b = buf[i];
		match *state {
			ChunkedState::Size => match b {
				b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
					let digit = (b as char).to_digit(16).expect("hex digit") as u64;
					*remaining = remaining
						.checked_mul(16)
						.and_then(|r| r.checked_add(digit))
						.ok_or(ParseError::InvalidChunk)?;
					i += 1;
				},
				b';' => {
					*state = ChunkedState::SizeExt;
					i += 1;
				},
				b'\r' => {
					*state = ChunkedState::SizeLf;
					i += 1;
				},
				_ => return Err(ParseError::InvalidChunk),
			},
			ChunkedState::SizeExt => {
				if b == b'\r' {
					*state = ChunkedState::SizeLf;
				}
				i += 1;
			},
			ChunkedState::SizeLf => {
				if b != b'\n' {
					return Err(ParseError::InvalidChunk);
				}
				*state = if *remaining == 0 {
					ChunkedState::Trailer
				} else {
					ChunkedState::Body
				};
				i += 1;
			},
			ChunkedState::Body => {
				let take = (*remaining).min((buf.len() - i) as u64) as usize;
				*remaining -= take as u64;
				i += take;
				if *remaining == 0 {
					*state = ChunkedState::BodyCr;
				}
			},
			ChunkedState::BodyCr => {
				if b != b'\r' {
					return Err(ParseError::InvalidChunk);
				}
				*state = ChunkedState::BodyLf;
				i += 1;
			},
			ChunkedState::BodyLf => {
				if b != b'\n' {
					return Err(ParseError::InvalidChunk);
				}
				*state = ChunkedState::Size;
				*remaining = 0;
				i += 1;
			},
			ChunkedState::Trailer => {
				*state = if b == b'\r' {
					ChunkedState::EndLf
				} else {
					ChunkedState::TrailerLine
				};
				i += 1;
			},
			ChunkedState::TrailerLine => {
				if b == b'\r' {
					*state = ChunkedState::TrailerLf;
				}
				i += 1;
			},
			ChunkedState::TrailerLf => {
				if b != b'\n' {
					return Err(ParseError::InvalidChunk);
				}
				*state = ChunkedState::Trailer;
				i += 1;
			},
			ChunkedState::EndLf => {
				if b != b'\n' {
					return Err(ParseError::InvalidChunk);
				}
				i += 1;
				return Ok((i, true));
			},
		}
	}
	Ok((i, false))
}

/// Outstanding request methods on one connection. The request parser pushes a
/// method as each request head completes; the response parser consumes one per
/// final response so responses to HEAD frame as bodiless. Pipelining means
/// several can be queued at once.
#[derive(Debug, Clone, Default)]
pub struct MethodQueue(Arc<Mutex<VecDeque<Strng>>>);

impl MethodQueue {
	pub fn new() -> Self {
		Self::default()
	}

	fn push(&self, method: Strng) {
		self.0.lock().expect("mutex acquired").push_back(method);
	}

	fn pop(&self) -> Option<Strng> {
		self.0.lock().expect("mutex acquired").pop_front()
	}
}

#[derive(Debug)]
enum State {
	Head,
	Body(BodyFramer),
}

/// Incremental HTTP/1.x message parser. Feed arbitrary byte chunks, pull
/// events. Retains partial input across calls and returns to head framing
/// after each message, so pipelined messages on one connection parse in
/// sequence.
#[derive(Debug)]
pub struct MessageParser {
	side: Side,
	state: State,
	buf: BytesMut,
	pending_end: bool,
	methods: MethodQueue,
}

impl MessageParser {
	pub fn new(side: Side) -> Self {
		Self::with_methods(side, MethodQueue::new())
	}

	/// Build a parser sharing `methods` with the parser for the opposite
	/// direction of the same connection.
	pub fn with_methods(side: Side, methods: MethodQueue) -> Self {
		MessageParser {
			side,
			state: State::Head,
			buf: BytesMut::new(),
			pending_end: false,
			methods,
		}
	}

	pub fn feed(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	pub fn next_event(&mut self) -> Result<Option<Event>, ParseError> {
		if self.pending_end {
			self.pending_end = false;
			return Ok(Some(Event::End));
		}
		match &mut self.state {
			State::Head => {
				let Some((msg, len)) = parse_head(self.side, &self.buf)? else {
					if self.buf.len() > MAX_HEAD_SIZE {
						return Err(ParseError::HeadTooLarge);
					}
					return Ok(None);
				};
				self.buf.advance(len);
				let request_method = match self.side {
					Side::Request => {
						if let Kind::Request { method, .. } = &msg.kind {
							self.methods.push(method.clone());
						}
						None
					},
					// Informational responses do not answer the request; its
					// method stays queued for the final response.
					Side::Response => {
						if msg.status_code().is_some_and(|s| s / 100 != 1) {
							self.methods.pop()
						} else {
							None
						}
					},
				};
				match BodyFramer::from_head(self.side, &msg, request_method.as_deref())? {
					Some(framer) => self.state = State::Body(framer),
					None => self.pending_end = true,
				}
				Ok(Some(Event::Headers(msg)))
			},
			State::Body(framer) => {
				if self.buf.is_empty() {
					return Ok(None);
				}
				let (data, done) = framer.advance(&mut self.buf)?;
				if done {
					self.state = State::Head;
					self.pending_end = true;
				}
				debug_assert!(!data.is_empty() || done);
				Ok(Some(Event::Body(data)))
			},
		}
	}

	/// Bytes fed but not yet claimed by any emitted event. Draining them is
	/// how unparsed input survives a protocol switch or a half-close.
	pub fn take_buffered(&mut self) -> Bytes {
		self.buf.split().freeze()
	}

	pub fn has_buffered(&self) -> bool {
		!self.buf.is_empty()
	}
}
