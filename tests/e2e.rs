use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hostgateway::config::{EndpointConfig, RouteEntry};
use hostgateway::{Callbacks, Config, Message, Proxy, Strng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn route_config(routes: &[(&str, SocketAddr)]) -> Config {
	Config {
		routes: routes
			.iter()
			.map(|(host, addr)| RouteEntry {
				hostnames: vec![(*host).into()],
				endpoint: EndpointConfig::Tcp {
					host: addr.ip().to_string().into(),
					port: addr.port(),
				},
			})
			.collect(),
		listener: None,
		dial_timeout_secs: Some(2),
	}
}

async fn start_proxy(config: Config) -> (Proxy, SocketAddr) {
	let proxy = Proxy::new(config).expect("proxy");
	proxy.start();
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
	let addr = listener.local_addr().expect("proxy addr");
	let runner = proxy.clone();
	tokio::spawn(async move {
		let _ = runner.run(listener).await;
	});
	(proxy, addr)
}

async fn bind_backend() -> (TcpListener, SocketAddr) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
	let addr = listener.local_addr().expect("backend addr");
	(listener, addr)
}

/// Backend that accepts one connection and answers every request head with
/// `response`, capturing each head it sees.
fn serve_once(listener: TcpListener, response: &'static [u8], heads: mpsc::Sender<Vec<u8>>) {
	tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.expect("backend accept");
		loop {
			let head = match read_head(&mut stream).await {
				Some(head) => head,
				None => return,
			};
			heads.send(head).await.expect("capture head");
			stream.write_all(response).await.expect("backend write");
		}
	});
}

/// Read until a blank line terminates the head; returns all bytes read, or
/// None on EOF before any byte.
async fn read_head(stream: &mut TcpStream) -> Option<Vec<u8>> {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		match stream.read(&mut byte).await {
			Ok(0) => return if head.is_empty() { None } else { Some(head) },
			Ok(_) => head.push(byte[0]),
			Err(_) => return None,
		}
		if head.ends_with(b"\r\n\r\n") {
			return Some(head);
		}
	}
}

async fn read_head_timeout(stream: &mut TcpStream) -> String {
	let head = tokio::time::timeout(Duration::from_secs(5), read_head(stream))
		.await
		.expect("head timed out")
		.expect("head");
	String::from_utf8(head).expect("utf8")
}

async fn read_exact_timeout(stream: &mut TcpStream, n: usize) -> Vec<u8> {
	let mut buf = vec![0u8; n];
	tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
		.await
		.expect("read timed out")
		.expect("read");
	buf
}

async fn read_to_end_timeout(stream: &mut TcpStream) -> Vec<u8> {
	let mut buf = Vec::new();
	tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
		.await
		.expect("read timed out")
		.expect("read");
	buf
}

async fn wait_for_connections(proxy: &Proxy, expected: usize) {
	for _ in 0..500 {
		if proxy.connection_count() == expected {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!(
		"expected {expected} connections, have {}",
		proxy.connection_count()
	);
}

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
// What the client sees: the head re-serialized by the proxy, names lowercased,
// body passed through untouched.
const OK_RELAYED: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";

#[tokio::test]
async fn plain_route_relays_both_directions() {
	let (listener, backend_addr) = bind_backend().await;
	let (heads_tx, mut heads_rx) = mpsc::channel(4);
	serve_once(listener, OK_RESPONSE, heads_tx);
	let (_proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET /x HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");

	let head = heads_rx.recv().await.expect("backend saw request");
	let head = String::from_utf8(head).expect("utf8");
	assert!(head.starts_with("GET /x HTTP/1.1\r\n"), "{head}");
	assert!(head.contains("host: a.example\r\n"), "{head}");

	let response = read_exact_timeout(&mut client, OK_RELAYED.len()).await;
	assert_eq!(response, OK_RELAYED);

	// Subsequent messages in both directions keep flowing through the same
	// connection.
	client
		.write_all(b"GET /y HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write second");
	let head = heads_rx.recv().await.expect("backend saw second request");
	assert!(head.starts_with(b"GET /y HTTP/1.1\r\n"));
	let response = read_exact_timeout(&mut client, OK_RELAYED.len()).await;
	assert_eq!(response, OK_RELAYED);
}

#[tokio::test]
async fn wildcard_route_catches_unknown_hosts() {
	let (listener, backend_addr) = bind_backend().await;
	let (heads_tx, mut heads_rx) = mpsc::channel(4);
	serve_once(listener, OK_RESPONSE, heads_tx);
	let (_proxy, addr) = start_proxy(route_config(&[("*", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: unknown.example\r\n\r\n")
		.await
		.expect("write");

	let head = heads_rx.recv().await.expect("backend saw request");
	let head = String::from_utf8(head).expect("utf8");
	assert!(head.contains("host: unknown.example\r\n"), "{head}");
	let response = read_exact_timeout(&mut client, OK_RELAYED.len()).await;
	assert_eq!(response, OK_RELAYED);
}

#[tokio::test]
async fn unknown_host_without_wildcard_is_404() {
	let (_listener, backend_addr) = bind_backend().await;
	let (_proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: b.example\r\n\r\n")
		.await
		.expect("write");
	let response = read_to_end_timeout(&mut client).await;
	assert_eq!(response, b"HTTP/1.1 404 Not Found\r\n\r\n");
}

#[tokio::test]
async fn inactive_proxy_refuses_with_503_and_never_dials() {
	let (listener, backend_addr) = bind_backend().await;
	let (accepted_tx, mut accepted_rx) = mpsc::channel::<()>(1);
	tokio::spawn(async move {
		if listener.accept().await.is_ok() {
			let _ = accepted_tx.send(()).await;
		}
	});
	let (proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;
	proxy.stop();

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	let response = read_to_end_timeout(&mut client).await;
	assert_eq!(response, b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
	assert!(
		accepted_rx.try_recv().is_err(),
		"backend was dialed while passive"
	);
}

#[tokio::test]
async fn request_interceptor_injects_header_after_originals() {
	let (listener, backend_addr) = bind_backend().await;
	let (heads_tx, mut heads_rx) = mpsc::channel(4);
	serve_once(listener, OK_RESPONSE, heads_tx);
	let (proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;
	proxy.add_request_interceptor(Arc::new(|msg: &mut Message| {
		msg.headers.append("X-Proxy", "1");
	}));

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\nAccept: */*\r\n\r\n")
		.await
		.expect("write");

	let head = heads_rx.recv().await.expect("backend saw request");
	let head = String::from_utf8(head).expect("utf8");
	// Original headers first, injected one appended.
	assert_eq!(
		head,
		"GET / HTTP/1.1\r\nhost: a.example\r\naccept: */*\r\nx-proxy: 1\r\n\r\n"
	);
	let response = read_exact_timeout(&mut client, OK_RELAYED.len()).await;
	assert_eq!(response, OK_RELAYED);
}

#[tokio::test]
async fn protocol_upgrade_tunnels_bytes_unmodified() {
	let (listener, backend_addr) = bind_backend().await;
	let initial_frames: &[u8] = b"\xde\xad\xbe\xef";
	tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.expect("backend accept");
		read_head(&mut stream).await.expect("handshake head");
		stream
			.write_all(
				b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
			)
			.await
			.expect("write 101");
		stream
			.write_all(initial_frames)
			.await
			.expect("write frames");
		// Echo whatever the client tunnels up, verbatim.
		let mut buf = [0u8; 64];
		loop {
			match stream.read(&mut buf).await {
				Ok(0) | Err(_) => return,
				Ok(n) => stream.write_all(&buf[..n]).await.expect("echo"),
			}
		}
	});

	let (proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;
	let response_heads = Arc::new(AtomicUsize::new(0));
	let counted = response_heads.clone();
	proxy.add_response_interceptor(Arc::new(move |_: &mut Message| {
		counted.fetch_add(1, Ordering::SeqCst);
	}));

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(
			b"GET /chat HTTP/1.1\r\nHost: a.example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
		)
		.await
		.expect("write handshake");

	let head = read_head_timeout(&mut client).await;
	assert!(
		head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
		"{head}"
	);
	assert!(head.contains("upgrade: websocket\r\n"), "{head}");

	let frames = read_exact_timeout(&mut client, initial_frames.len()).await;
	assert_eq!(frames, initial_frames);

	// Arbitrary bytes tunnel through both ways, even HTTP-shaped ones, and
	// the framing interceptors never fire again.
	let payload: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n\x00\x01\x02";
	client.write_all(payload).await.expect("write payload");
	let echoed = read_exact_timeout(&mut client, payload.len()).await;
	assert_eq!(echoed, payload);
	assert_eq!(response_heads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bulk_disconnect_by_host() {
	// Backends that accept and hold connections open.
	let (listener_a, backend_a) = bind_backend().await;
	let (listener_b, backend_b) = bind_backend().await;
	for listener in [listener_a, listener_b] {
		tokio::spawn(async move {
			loop {
				let Ok((mut stream, _)) = listener.accept().await else {
					return;
				};
				tokio::spawn(async move {
					let mut buf = Vec::new();
					let _ = stream.read_to_end(&mut buf).await;
				});
			}
		});
	}

	let (proxy, addr) = start_proxy(route_config(&[
		("a.example", backend_a),
		("b.example", backend_b),
	]))
	.await;

	let mut a1 = TcpStream::connect(addr).await.expect("connect");
	let mut a2 = TcpStream::connect(addr).await.expect("connect");
	let mut b1 = TcpStream::connect(addr).await.expect("connect");
	a1.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	a2.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	b1.write_all(b"GET / HTTP/1.1\r\nHost: b.example\r\n\r\n")
		.await
		.expect("write");
	wait_for_connections(&proxy, 3).await;

	assert_eq!(proxy.disconnect_clients("a.example"), 2);
	wait_for_connections(&proxy, 1).await;
	assert_eq!(proxy.connections(), vec![(Strng::from("b.example"), 1)]);

	// The a.example clients were closed; b.example still flows.
	assert_eq!(read_to_end_timeout(&mut a1).await, b"");
	assert_eq!(read_to_end_timeout(&mut a2).await, b"");

	assert_eq!(proxy.disconnect_all_clients(), 1);
	wait_for_connections(&proxy, 0).await;
	assert_eq!(read_to_end_timeout(&mut b1).await, b"");
}

#[tokio::test]
async fn dial_failure_invokes_503_callback() {
	// A port with nothing listening: bind, take the address, drop.
	let (listener, backend_addr) = bind_backend().await;
	drop(listener);

	let (proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;
	let mut callbacks = Callbacks::new();
	callbacks.insert(
		503,
		Arc::new(|mut socket: hostgateway::stream::Socket, host| {
			tokio::spawn(async move {
				let head =
					format!("HTTP/1.1 521 Backend Down\r\ncontent-length: 0\r\nx-host: {host}\r\n\r\n");
				let _ = socket.write_all(head.as_bytes()).await;
				let _ = socket.shutdown().await;
			});
		}),
	);
	proxy.set_callbacks(callbacks);

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	let response = read_to_end_timeout(&mut client).await;
	let response = String::from_utf8(response).expect("utf8");
	assert!(
		response.starts_with("HTTP/1.1 521 Backend Down\r\n"),
		"{response}"
	);
	assert!(response.contains("x-host: a.example"), "{response}");
}

#[tokio::test]
async fn dial_failure_without_callback_is_503() {
	let (listener, backend_addr) = bind_backend().await;
	drop(listener);
	let (_proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	let response = read_to_end_timeout(&mut client).await;
	assert_eq!(response, b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
}

#[tokio::test]
async fn malformed_first_request_is_400() {
	let (_listener, backend_addr) = bind_backend().await;
	let (_proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"\x00\x01 definitely not http\r\n\r\n")
		.await
		.expect("write");
	let response = read_to_end_timeout(&mut client).await;
	assert_eq!(response, b"HTTP/1.1 400 Bad Request\r\n\r\n");
}

#[tokio::test]
async fn pipelined_body_bytes_in_first_packet_survive() {
	let (listener, backend_addr) = bind_backend().await;
	let (seen_tx, mut seen_rx) = mpsc::channel(1);
	tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.expect("backend accept");
		let mut seen = read_head(&mut stream).await.expect("head");
		// The head promises 11 body bytes; they must arrive too.
		let mut body = vec![0u8; 11];
		stream.read_exact(&mut body).await.expect("body");
		seen.extend_from_slice(&body);
		seen_tx.send(seen).await.expect("send");
		stream
			.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
			.await
			.expect("respond");
	});
	let (_proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	// Head and body pipelined into a single packet.
	client
		.write_all(b"POST /u HTTP/1.1\r\nHost: a.example\r\nContent-Length: 11\r\n\r\nhello world")
		.await
		.expect("write");

	let seen = seen_rx.recv().await.expect("backend saw request");
	let seen = String::from_utf8(seen).expect("utf8");
	assert!(seen.ends_with("\r\n\r\nhello world"), "{seen}");
	let response = read_exact_timeout(&mut client, 27).await;
	assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");
}

#[tokio::test]
async fn stop_does_not_drop_existing_connections() {
	let (listener, backend_addr) = bind_backend().await;
	let (heads_tx, mut heads_rx) = mpsc::channel(4);
	serve_once(listener, OK_RESPONSE, heads_tx);
	let (proxy, addr) = start_proxy(route_config(&[("a.example", backend_addr)])).await;

	let mut client = TcpStream::connect(addr).await.expect("connect");
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	heads_rx.recv().await.expect("backend saw request");
	let response = read_exact_timeout(&mut client, OK_RELAYED.len()).await;
	assert_eq!(response, OK_RELAYED);

	proxy.stop();

	// Existing flow keeps working.
	client
		.write_all(b"GET /again HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	heads_rx.recv().await.expect("backend saw request");
	let response = read_exact_timeout(&mut client, OK_RELAYED.len()).await;
	assert_eq!(response, OK_RELAYED);

	// New connections are refused.
	let mut refused = TcpStream::connect(addr).await.expect("connect");
	refused
		.write_all(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n")
		.await
		.expect("write");
	let response = read_to_end_timeout(&mut refused).await;
	assert_eq!(response, b"HTTP/1.1 503 Service Unavailable\r\n\r\n");
}
