//! Minimal runnable example: wires [`tunnel_agent::TunnelAgent`] into a bare
//! `hyper` client and fetches one response through an upstream CONNECT
//! proxy. Not part of the library's public contract.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tunnel_agent::{build_client_config, load_demo_config, Cli, TlsParams, TunnelAgent, TunnelRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.parse().unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    let cfg = load_demo_config(&cli.config)?;
    info!("Configuration loaded from {:?}", cli.config);
    info!("Proxy  : {}:{}", cfg.proxy.host, cfg.proxy.port);
    info!("Target : {}:{}", cfg.target_host, cfg.target_port);

    let _ = rustls::crypto::ring::default_provider().install_default();

    let client_config = Arc::new(build_client_config(&cfg.tls)?);

    let agent = TunnelAgent::new(cfg.agent, cfg.proxy, client_config.clone());

    let server_name = ServerName::try_from(cfg.target_host.clone())?;
    let req = TunnelRequest {
        host: cfg.target_host.clone(),
        hostname: None,
        port: cfg.target_port,
        origin_key: None,
        timeout: Some(Duration::from_secs(10)),
        session: None,
        tls: TlsParams {
            server_name,
            client_config,
        },
        extra_headers: http::HeaderMap::new(),
    };

    let stream = agent.create_connection(req);
    let mut events = stream.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "tunnel event");
        }
    });

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            warn!("connection failed: {err:?}");
        }
    });

    let request = Request::builder()
        .uri("/")
        .header("Host", cfg.target_host.as_str())
        .body(Empty::<bytes::Bytes>::new())?;

    let response = sender.send_request(request).await?;
    info!("response status: {}", response.status());
    let body = response.into_body().collect().await?.to_bytes();
    println!("{}", String::from_utf8_lossy(&body));

    Ok(())
}
