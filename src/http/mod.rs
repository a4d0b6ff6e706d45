pub mod parse;

use bytes::{BufMut, Bytes, BytesMut};

use crate::strng;
use crate::strng::Strng;

// totally scientific
const AVERAGE_HEADER_SIZE: usize = 30;

/// An ordered multimap of HTTP headers. Names are normalized to lowercase on
/// insertion; values are kept verbatim. Duplicate names retain every
/// occurrence in input order, and iteration replays registration order, so a
/// serialized head reproduces the wire order it was parsed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
	entries: Vec<(Strng, Bytes)>,
}

impl Headers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn append(&mut self, name: impl AsRef<str>, value: impl AsRef<[u8]>) {
		let name = name.as_ref();
		let name = if name.bytes().any(|b| b.is_ascii_uppercase()) {
			strng::new(name.to_ascii_lowercase())
		} else {
			strng::new(name)
		};
		self
			.entries
			.push((name, Bytes::copy_from_slice(value.as_ref())));
	}

	/// First value registered under `name`, if any.
	pub fn get(&self, name: &str) -> Option<&[u8]> {
		self
			.entries
			.iter()
			.find(|(n, _)| n.as_str() == name)
			.map(|(_, v)| v.as_ref())
	}

	pub fn get_str(&self, name: &str) -> Option<&str> {
		self.get(name).and_then(|v| std::str::from_utf8(v).ok())
	}

	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
		self
			.entries
			.iter()
			.filter(move |(n, _)| n.as_str() == name)
			.map(|(_, v)| v.as_ref())
	}

	/// Replace the first occurrence of `name` (dropping any duplicates), or
	/// append if absent.
	pub fn set(&mut self, name: impl AsRef<str>, value: impl AsRef<[u8]>) {
		self.remove(name.as_ref());
		self.append(name, value);
	}

	pub fn remove(&mut self, name: &str) -> bool {
		let before = self.entries.len();
		self.entries.retain(|(n, _)| n.as_str() != name);
		before != self.entries.len()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.iter().any(|(n, _)| n.as_str() == name)
	}

	/// True when the value of `name` contains `token` in its comma-separated
	/// list, compared ASCII case-insensitively. Used for `connection`,
	/// `upgrade` and `transfer-encoding` checks.
	pub fn contains_token(&self, name: &str, token: &str) -> bool {
		self.get_all(name).any(|v| {
			std::str::from_utf8(v)
				.map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
				.unwrap_or(false)
		})
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> + '_ {
		self.entries.iter().map(|(n, v)| (n.as_str(), v.as_ref()))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

/// Side-specific fields of a message head. Exactly one of the two variants
/// exists for any message, so a request can never carry a status code and a
/// response can never carry a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
	Request { method: Strng, url: Strng },
	Response { status: u16, reason: Strng },
}

/// A parsed HTTP/1.x message head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub version_major: u8,
	pub version_minor: u8,
	pub kind: Kind,
	pub headers: Headers,
	/// Set when the head carries `Upgrade:` signaling (or is a 101 response).
	pub upgrade: bool,
	/// Advisory: whether the peer intends to keep the connection open after
	/// this message. The proxy never acts on it; it relays until close.
	pub keep_alive_hint: bool,
}

impl Message {
	pub fn request(method: impl Into<Strng>, url: impl Into<Strng>) -> Self {
		Message {
			version_major: 1,
			version_minor: 1,
			kind: Kind::Request {
				method: method.into(),
				url: url.into(),
			},
			headers: Headers::new(),
			upgrade: false,
			keep_alive_hint: true,
		}
	}

	pub fn response(status: u16, reason: impl Into<Strng>) -> Self {
		Message {
			version_major: 1,
			version_minor: 1,
			kind: Kind::Response {
				status,
				reason: reason.into(),
			},
			headers: Headers::new(),
			upgrade: false,
			keep_alive_hint: true,
		}
	}

	pub fn is_request(&self) -> bool {
		matches!(self.kind, Kind::Request { .. })
	}

	pub fn method(&self) -> Option<&str> {
		match &self.kind {
			Kind::Request { method, .. } => Some(method.as_str()),
			Kind::Response { .. } => None,
		}
	}

	pub fn url(&self) -> Option<&str> {
		match &self.kind {
			Kind::Request { url, .. } => Some(url.as_str()),
			Kind::Response { .. } => None,
		}
	}

	pub fn status_code(&self) -> Option<u16> {
		match &self.kind {
			Kind::Request { .. } => None,
			Kind::Response { status, .. } => Some(*status),
		}
	}

	/// Serialize the head: start-line, header lines in registration order,
	/// terminating CRLF. The body is streamed separately, and framing headers
	/// are emitted exactly as presented; nothing is recomputed.
	pub fn serialize(&self) -> Bytes {
		let mut buf = BytesMut::with_capacity(48 + self.headers.len() * AVERAGE_HEADER_SIZE);
		let mut itoa_buf = itoa::Buffer::new();
		match &self.kind {
			Kind::Request { method, url } => {
				buf.put_slice(method.as_bytes());
				buf.put_u8(b' ');
				buf.put_slice(url.as_bytes());
				buf.put_slice(b" HTTP/");
				buf.put_slice(itoa_buf.format(self.version_major).as_bytes());
				buf.put_u8(b'.');
				buf.put_slice(itoa_buf.format(self.version_minor).as_bytes());
			},
			Kind::Response { status, reason } => {
				buf.put_slice(b"HTTP/");
				buf.put_slice(itoa_buf.format(self.version_major).as_bytes());
				buf.put_u8(b'.');
				buf.put_slice(itoa_buf.format(self.version_minor).as_bytes());
				buf.put_u8(b' ');
				buf.put_slice(itoa_buf.format(*status).as_bytes());
				buf.put_u8(b' ');
				buf.put_slice(reason.as_bytes());
			},
		}
		buf.put_slice(b"\r\n");
		for (name, value) in self.headers.iter() {
			buf.put_slice(name.as_bytes());
			buf.put_slice(b": ");
			buf.put_slice(value);
			buf.put_slice(b"\r\n");
		}
		buf.put_slice(b"\r\n");
		buf.freeze()
	}
}

/// A minimal error head the proxy emits on its own behalf:
/// `HTTP/1.1 <code> <reason>\r\n\r\n`, no body. Codes outside the set the
/// proxy uses collapse to 500.
pub fn error_head(code: u16) -> Bytes {
	let (code, reason) = match code {
		400 => (400, "Bad Request"),
		404 => (404, "Not Found"),
		502 => (502, "Bad Gateway"),
		503 => (503, "Service Unavailable"),
		_ => (500, "Internal Server Error"),
	};
	Bytes::from(format!("HTTP/1.1 {code} {reason}\r\n\r\n"))
}
