use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::route::{Endpoint, RouteTable};
use crate::strng::Strng;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy configuration as loaded from a file or handed to the control
/// surface. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
	#[serde(default)]
	pub routes: Vec<RouteEntry>,

	/// Listener address for the binary; ignored by the library surface, which
	/// takes a bound listener.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub listener: Option<SocketAddr>,

	/// Backend dial timeout in seconds. Dial failures and timeouts both
	/// surface as the 503 path.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dial_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
	pub hostnames: Vec<Strng>,
	pub endpoint: EndpointConfig,
}

/// Raw endpoint form: `{tcp: {host, port}}` or `{ipc: path}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointConfig {
	Tcp { host: Strng, port: u16 },
	Ipc(PathBuf),
}

impl EndpointConfig {
	fn build(&self) -> Endpoint {
		match self {
			EndpointConfig::Tcp { host, port } => Endpoint::tcp(host.clone(), *port),
			EndpointConfig::Ipc(path) => Endpoint::ipc(path.clone()),
		}
	}
}

impl Config {
	/// Load from a YAML or JSON file, chosen by extension.
	pub fn from_file(path: &Path) -> anyhow::Result<Config> {
		let contents = std::fs::read_to_string(path)?;
		let cfg = if path.extension().is_some_and(|e| e == "json") {
			serde_json::from_str(&contents)?
		} else {
			serde_yaml::from_str(&contents)?
		};
		Ok(cfg)
	}

	/// Build the immutable route table this config describes. IPC paths get
	/// their platform prefix here so the dial path stays OS-agnostic.
	pub fn build_routes(&self) -> RouteTable {
		RouteTable::from_entries(
			self
				.routes
				.iter()
				.map(|e| (e.hostnames.iter().cloned(), e.endpoint.build())),
		)
	}

	pub fn dial_timeout(&self) -> Duration {
		self
			.dial_timeout_secs
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_DIAL_TIMEOUT)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::route::Endpoint;

	#[test]
	fn parse_yaml_config() {
		let cfg: Config = serde_yaml::from_str(
			r#"
listener: 127.0.0.1:8080
dial_timeout_secs: 3
routes:
  - hostnames: ["a.example", "*"]
    endpoint:
      tcp: { host: 127.0.0.1, port: 9001 }
  - hostnames: [b.example]
    endpoint:
      ipc: /run/backend.sock
some_future_field: ignored
"#,
		)
		.expect("parse");
		assert_eq!(cfg.listener, Some("127.0.0.1:8080".parse().unwrap()));
		assert_eq!(cfg.dial_timeout(), Duration::from_secs(3));
		assert_eq!(cfg.routes.len(), 2);

		let table = cfg.build_routes();
		assert_eq!(
			table.lookup("a.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9001))
		);
		assert_eq!(
			table.lookup("elsewhere.example"),
			Some(&Endpoint::tcp("127.0.0.1", 9001))
		);
		#[cfg(not(windows))]
		assert_eq!(
			table.lookup("b.example"),
			Some(&Endpoint::Ipc {
				path: "/run/backend.sock".into()
			})
		);
	}

	#[test]
	fn parse_json_config() {
		let cfg: Config = serde_json::from_str(
			r#"{"routes": [{"hostnames": ["x"], "endpoint": {"tcp": {"host": "h", "port": 1}}}]}"#,
		)
		.expect("parse");
		assert_eq!(cfg.routes.len(), 1);
		assert_eq!(cfg.dial_timeout(), DEFAULT_DIAL_TIMEOUT);
	}

	#[test]
	fn empty_config_builds_empty_table() {
		let cfg = Config::default();
		assert!(cfg.build_routes().is_empty());
	}
}
