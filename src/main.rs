use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use hostgateway::{Config, Proxy};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Host-based HTTP/1.x reverse proxy", long_about = None)]
struct Args {
	/// Route configuration file (YAML or JSON)
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,

	/// Listener address, overriding the config file
	#[arg(short, long)]
	bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let cfg = match &args.config {
		Some(path) => Config::from_file(path)?,
		None => Config::default(),
	};
	let bind = args
		.bind
		.or(cfg.listener)
		.unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

	let proxy = Proxy::new(cfg)?;
	proxy.start();

	let listener = TcpListener::bind(bind).await?;
	info!(%bind, routes = proxy.routes().len(), "hostgateway starting");
	proxy.run(listener).await
}
