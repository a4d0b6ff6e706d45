use std::collections::HashMap;
use std::path::PathBuf;

use tracing::warn;

use crate::http::Message;
use crate::strng;
use crate::strng::Strng;

/// Hostname key that matches any host not matched exactly.
pub const WILDCARD: &str = "*";

/// A backend address the proxy can dial. IPC paths are stored in their final,
/// platform-prefixed form (see [`Endpoint::ipc`]) so the dial path needs no
/// OS-specific logic. The serde-facing form is `EndpointConfig` in the config
/// module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
	Tcp { host: Strng, port: u16 },
	Ipc { path: PathBuf },
}

impl Endpoint {
	pub fn tcp(host: impl Into<Strng>, port: u16) -> Self {
		Endpoint::Tcp {
			host: host.into(),
			port,
		}
	}

	/// Build an IPC endpoint, applying the platform's named-pipe prefix when
	/// one is required.
	pub fn ipc(path: impl Into<PathBuf>) -> Self {
		Endpoint::Ipc {
			path: pipe_path(path.into()),
		}
	}
}

#[cfg(windows)]
fn pipe_path(path: PathBuf) -> PathBuf {
	const PREFIX: &str = r"\\.\pipe\";
	if path.to_string_lossy().starts_with(PREFIX) {
		path
	} else {
		let name = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();
		PathBuf::from(format!("{PREFIX}{name}"))
	}
}

#[cfg(not(windows))]
fn pipe_path(path: PathBuf) -> PathBuf {
	path
}

impl std::fmt::Display for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
			Endpoint::Ipc { path } => write!(f, "ipc://{}", path.display()),
		}
	}
}

/// Immutable snapshot of the hostname → endpoint mapping. Rebuilt wholesale on
/// reconfiguration and swapped in atomically; connection tasks only ever see a
/// consistent table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
	routes: HashMap<Strng, Endpoint>,
}

impl RouteTable {
	/// Build a table from (hostnames, endpoint) entries. Each hostname points
	/// independently at its entry's endpoint; a hostname repeated across
	/// entries keeps the last one.
	pub fn from_entries<I, H>(entries: I) -> Self
	where
		I: IntoIterator<Item = (H, Endpoint)>,
		H: IntoIterator<Item = Strng>,
	{
		let mut routes = HashMap::new();
		for (hostnames, endpoint) in entries {
			for hostname in hostnames {
				let hostname = normalize_host(&hostname);
				if let Some(shadowed) = routes.insert(hostname.clone(), endpoint.clone()) {
					warn!(%hostname, %shadowed, "duplicate route hostname, last entry wins");
				}
			}
		}
		RouteTable { routes }
	}

	/// Exact hostname lookup with wildcard fallback.
	pub fn lookup(&self, host: &str) -> Option<&Endpoint> {
		let host = normalize_host(host);
		self
			.routes
			.get(&host)
			.or_else(|| self.routes.get(WILDCARD))
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Strng, &Endpoint)> {
		self.routes.iter()
	}

	pub fn len(&self) -> usize {
		self.routes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.routes.is_empty()
	}
}

fn normalize_host(host: &str) -> Strng {
	if host.bytes().any(|b| b.is_ascii_uppercase()) {
		strng::new(host.to_ascii_lowercase())
	} else {
		strng::new(host)
	}
}

/// The virtual host a request is charged to: the `host` header with any
/// `:port` suffix stripped.
pub fn virtual_host(req: &Message) -> Strng {
	let host = req.headers.get_str("host").unwrap_or_default();
	normalize_host(host.split(':').next().unwrap_or_default())
}

/// Maps a parsed request to a backend endpoint. Implementations must be pure
/// and non-blocking; they run synchronously on the forwarding path. The
/// active route table snapshot is supplied so the default stays a pure
/// function of its inputs.
pub trait RouteResolver: Send + Sync {
	fn resolve(&self, req: &Message, table: &RouteTable) -> Option<Endpoint>;
}

/// Default resolver: `host` header lookup with wildcard fallback.
#[derive(Debug, Default)]
pub struct HostResolver;

impl RouteResolver for HostResolver {
	fn resolve(&self, req: &Message, table: &RouteTable) -> Option<Endpoint> {
		table.lookup(&virtual_host(req)).cloned()
	}
}

impl<F> RouteResolver for F
where
	F: Fn(&Message, &RouteTable) -> Option<Endpoint> + Send + Sync,
{
	fn resolve(&self, req: &Message, table: &RouteTable) -> Option<Endpoint> {
		self(req, table)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Message;

	fn request_for(host: &str) -> Message {
		let mut req = Message::request("GET", "/");
		req.headers.append("Host", host);
		req
	}

	fn table() -> RouteTable {
		RouteTable::from_entries(vec![
			(
				vec![strng::new("a.example")],
				Endpoint::tcp("127.0.0.1", 9001),
			),
			(
				vec![strng::new("b.example"), strng::new("c.example")],
				Endpoint::tcp("127.0.0.1", 9002),
			),
		])
	}

	#[test]
	fn exact_lookup() {
		let t = table();
		assert_eq!(
			t.lookup("a.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9001))
		);
		assert_eq!(
			t.lookup("c.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9002))
		);
		assert_eq!(t.lookup("unknown.example"), None);
	}

	#[test]
	fn wildcard_fallback() {
		let t = RouteTable::from_entries(vec![
			(
				vec![strng::new("a.example")],
				Endpoint::tcp("127.0.0.1", 9001),
			),
			(vec![strng::new("*")], Endpoint::tcp("127.0.0.1", 9000)),
		]);
		assert_eq!(
			t.lookup("unknown.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9000))
		);
		assert_eq!(
			t.lookup("a.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9001))
		);
	}

	#[test]
	fn duplicate_hostname_last_wins() {
		let t = RouteTable::from_entries(vec![
			(
				vec![strng::new("a.example")],
				Endpoint::tcp("127.0.0.1", 9001),
			),
			(
				vec![strng::new("a.example")],
				Endpoint::tcp("127.0.0.1", 9002),
			),
		]);
		assert_eq!(t.len(), 1);
		assert_eq!(
			t.lookup("a.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9002))
		);
	}

	#[test]
	fn hostnames_are_case_insensitive() {
		let t = table();
		assert_eq!(
			t.lookup("A.Example"),
			Some(&Endpoint::tcp("127.0.0.1", 9001))
		);
	}

	#[test]
	fn virtual_host_strips_port() {
		assert_eq!(virtual_host(&request_for("a.example:8080")), "a.example");
		assert_eq!(virtual_host(&request_for("a.example")), "a.example");
		assert_eq!(virtual_host(&Message::request("GET", "/")), "");
	}

	#[test]
	fn default_resolver_resolves_by_host_header() {
		let t = table();
		let resolver = HostResolver;
		assert_eq!(
			resolver.resolve(&request_for("b.example:443"), &t),
			Some(Endpoint::tcp("127.0.0.1", 9002))
		);
		assert_eq!(resolver.resolve(&request_for("nope.example"), &t), None);
	}

	#[test]
	fn closures_are_resolvers() {
		let t = table();
		let pinned = Endpoint::tcp("10.0.0.1", 1);
		let resolver = {
			let pinned = pinned.clone();
			move |_req: &Message, _table: &RouteTable| Some(pinned.clone())
		};
		assert_eq!(resolver.resolve(&request_for("whatever"), &t), Some(pinned));
	}
}
