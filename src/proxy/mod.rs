use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::config::{Config, EndpointConfig};
use crate::http::parse;
use crate::http::parse::{MethodQueue, Side};
use crate::intercept::{Interceptor, Pipeline};
use crate::relay::{ProtocolCell, Transducer, run_connection};
use crate::route::{HostResolver, RouteResolver, RouteTable, virtual_host};
use crate::stream::Socket;
use crate::strng::Strng;
use crate::tracker::ConnectionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Active,
	Passive,
}

impl std::fmt::Display for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Status::Active => write!(f, "active"),
			Status::Passive => write!(f, "passive"),
		}
	}
}

/// User error callback: invoked with the client socket and virtual host when
/// the proxy would otherwise answer with that status code. The callback fully
/// owns the fate of the client socket.
pub type ErrorCallback = Arc<dyn Fn(Socket, Strng) + Send + Sync>;

/// Callbacks keyed by status code. Currently consulted on 503 (backend dial
/// failure).
pub type Callbacks = HashMap<u16, ErrorCallback>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("route entry {0} has no hostnames")]
	NoHostnames(usize),

	#[error("route entry {0} has an empty endpoint host")]
	EmptyEndpointHost(usize),
}

fn validate(config: &Config) -> Result<(), ConfigError> {
	for (i, entry) in config.routes.iter().enumerate() {
		if entry.hostnames.is_empty() {
			return Err(ConfigError::NoHostnames(i));
		}
		if let EndpointConfig::Tcp { host, .. } = &entry.endpoint {
			if host.is_empty() {
				return Err(ConfigError::EmptyEndpointHost(i));
			}
		}
	}
	Ok(())
}

struct State {
	/// Gates new accepts only; never touches existing flows.
	active: AtomicBool,
	config: RwLock<Arc<Config>>,
	routes: RwLock<Arc<RouteTable>>,
	resolver: RwLock<Arc<dyn RouteResolver>>,
	interceptors: Arc<Pipeline>,
	callbacks: RwLock<Arc<Callbacks>>,
	tracker: ConnectionTracker,
}

/// The proxy server: accept loop plus the programmatic control surface.
/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Proxy {
	state: Arc<State>,
}

impl Proxy {
	/// Build a proxy from a config. Starts passive; call [`Proxy::start`]
	/// before (or after) running the accept loop.
	pub fn new(config: Config) -> Result<Self, ConfigError> {
		validate(&config)?;
		let routes = Arc::new(config.build_routes());
		Ok(Proxy {
			state: Arc::new(State {
				active: AtomicBool::new(false),
				config: RwLock::new(Arc::new(config)),
				routes: RwLock::new(routes),
				resolver: RwLock::new(Arc::new(HostResolver)),
				interceptors: Arc::new(Pipeline::new()),
				callbacks: RwLock::new(Arc::new(Callbacks::new())),
				tracker: ConnectionTracker::new(),
			}),
		})
	}

	pub fn start(&self) {
		if !self.state.active.swap(true, Ordering::SeqCst) {
			info!("proxy activated");
		}
	}

	/// Stop servicing new connections. Existing flows continue; use
	/// [`Proxy::disconnect_all_clients`] to drop them.
	pub fn stop(&self) {
		if self.state.active.swap(false, Ordering::SeqCst) {
			info!("proxy deactivated, existing connections continue");
		}
	}

	pub fn status(&self) -> Status {
		if self.state.active.load(Ordering::SeqCst) {
			Status::Active
		} else {
			Status::Passive
		}
	}

	pub fn config(&self) -> Arc<Config> {
		self.state.config.read().expect("mutex acquired").clone()
	}

	/// Swap in a new config. The route table is rebuilt and replaced
	/// wholesale; in-flight connections keep the endpoints they resolved.
	pub fn set_config(&self, config: Config) -> Result<(), ConfigError> {
		validate(&config)?;
		let routes = Arc::new(config.build_routes());
		let mut config_guard = self.state.config.write().expect("mutex acquired");
		*self.state.routes.write().expect("mutex acquired") = routes;
		*config_guard = Arc::new(config);
		info!("configuration replaced");
		Ok(())
	}

	pub fn routes(&self) -> Arc<RouteTable> {
		self.state.routes.read().expect("mutex acquired").clone()
	}

	pub fn callbacks(&self) -> Arc<Callbacks> {
		self.state.callbacks.read().expect("mutex acquired").clone()
	}

	pub fn set_callbacks(&self, callbacks: Callbacks) {
		*self.state.callbacks.write().expect("mutex acquired") = Arc::new(callbacks);
	}

	pub fn add_request_interceptor(&self, interceptor: Interceptor) {
		self.state.interceptors.add_request(interceptor);
	}

	pub fn add_response_interceptor(&self, interceptor: Interceptor) {
		self.state.interceptors.add_response(interceptor);
	}

	pub fn set_route_resolver(&self, resolver: Arc<dyn RouteResolver>) {
		*self.state.resolver.write().expect("mutex acquired") = resolver;
	}

	/// Force-close every client charged to `host`; returns how many were
	/// signaled. Backends close through the normal teardown wiring.
	pub fn disconnect_clients(&self, host: &str) -> usize {
		self.state.tracker.close_host(host)
	}

	pub fn disconnect_all_clients(&self) -> usize {
		self.state.tracker.close_all()
	}

	/// Number of live proxied connections.
	pub fn connection_count(&self) -> usize {
		self.state.tracker.len()
	}

	/// Live connection counts grouped by virtual host.
	pub fn connections(&self) -> Vec<(Strng, usize)> {
		self.state.tracker.hosts()
	}

	/// Drive the accept loop on a caller-provided listener. Each connection is
	/// serviced by its own task; the loop ends when the listener errors.
	pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
		if let Ok(addr) = listener.local_addr() {
			info!(%addr, "listener started");
		}
		while let Ok((stream, peer)) = listener.accept().await {
			let state = self.state.clone();
			tokio::spawn(
				async move {
					if let Err(e) = handle_connection(state, stream).await {
						debug!(err = %e, "connection closed with error");
					}
				}
				.instrument(debug_span!("conn", %peer)),
			);
		}
		Ok(())
	}
}

async fn handle_connection(state: Arc<State>, stream: TcpStream) -> anyhow::Result<()> {
	let mut client = Socket::from_tcp(stream)?;
	if !state.active.load(Ordering::SeqCst) {
		debug!("proxy passive, refusing connection");
		client.respond_and_close(503).await;
		return Ok(());
	}

	// Buffer until the first request head frames. The buffered bytes are
	// replayed through the request transducer after connect, so nothing read
	// here is lost.
	let mut initial = BytesMut::with_capacity(1024);
	let head = loop {
		let n = client.read_buf(&mut initial).await?;
		if n == 0 {
			debug!("client closed before a complete request head");
			return Ok(());
		}
		match parse::parse_head(Side::Request, &initial) {
			Ok(Some((head, _))) => break head,
			Ok(None) => {
				if initial.len() > parse::MAX_HEAD_SIZE {
					debug!("request head too large");
					client.respond_and_close(400).await;
					return Ok(());
				}
			},
			Err(e) => {
				debug!(err = %e, "malformed first request");
				client.respond_and_close(400).await;
				return Ok(());
			},
		}
	};

	let host = virtual_host(&head);
	let endpoint = {
		let routes = state.routes.read().expect("mutex acquired").clone();
		let resolver = state.resolver.read().expect("mutex acquired").clone();
		resolver.resolve(&head, &routes)
	};
	let Some(endpoint) = endpoint else {
		debug!(%host, "no route for host");
		client.respond_and_close(404).await;
		return Ok(());
	};

	let timeout = state
		.config
		.read()
		.expect("mutex acquired")
		.dial_timeout();
	let backend = match Socket::dial(&endpoint, timeout).await {
		Ok(backend) => backend,
		Err(e) => {
			warn!(%host, %endpoint, err = %e, "backend dial failed");
			let callback = state
				.callbacks
				.read()
				.expect("mutex acquired")
				.get(&503)
				.cloned();
			match callback {
				Some(callback) => callback(client, host),
				None => client.respond_and_close(503).await,
			}
			return Ok(());
		},
	};

	let close = CancellationToken::new();
	let id = state.tracker.add(host.clone(), close.clone());
	debug!(id, %host, %endpoint, "connection established");

	let protocol = ProtocolCell::new();
	let methods = MethodQueue::new();
	let request = Transducer::new(
		Side::Request,
		protocol.clone(),
		state.interceptors.clone(),
		methods.clone(),
	);
	let response = Transducer::new(Side::Response, protocol, state.interceptors.clone(), methods);

	let res = run_connection(client, backend, request, response, initial.freeze(), close).await;
	state.tracker.remove(id);
	res?;
	Ok(())
}
