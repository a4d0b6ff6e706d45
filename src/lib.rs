pub mod config;
pub mod http;
pub mod intercept;
pub mod proxy;
pub mod relay;
pub mod route;
pub mod stream;
pub mod strng;
pub mod tracker;

pub use config::Config;
pub use http::{Headers, Kind, Message};
pub use intercept::Interceptor;
pub use proxy::{Callbacks, ConfigError, ErrorCallback, Proxy, Status};
pub use route::{Endpoint, HostResolver, RouteResolver, RouteTable};
pub use strng::Strng;
