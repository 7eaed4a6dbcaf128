//! A connection factory that tunnels an HTTPS client through an upstream
//! HTTP CONNECT proxy, presenting each origin connection as a plain duplex
//! byte stream from the moment it is requested rather than once it is
//! actually established.
//!
//! [`TunnelAgent`] is the entry point: construct one per proxy, call
//! [`TunnelAgent::create_connection`] (or use it as a
//! `tower_service::Service`) per origin request.

mod admission_queue;
mod agent;
mod config;
mod error;
mod proxy_connector;
mod session_cache;
mod surrogate_stream;
mod tunnel_factory;

pub use agent::TunnelAgent;
pub use config::{
    build_client_config, load_demo_config, AgentOptions, Cli, DemoConfig, ProxyConfig,
    ProxyScheme, TlsFileConfig, TlsParams, TunnelRequest,
};
pub use error::TunnelError;
pub use session_cache::SessionTicket;
pub use surrogate_stream::{SurrogateEvent, SurrogateStream, TimeoutCallback};
pub use tunnel_factory::TunnelFactory;
