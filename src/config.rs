use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::Deserialize;

use crate::session_cache::SessionTicket;

/// Scheme used to reach the proxy itself — the proxy's own transport is
/// independent of whether the tunnelled traffic inside it is TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Plain,
    Tls,
}

/// Immutable, constructed once per [`crate::TunnelAgent`]. Mirrors the
/// `proxy` option bundle an HTTPS client passes in alongside its own
/// ambient agent options.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    #[serde(default, with = "humantime_millis_opt")]
    pub connect_timeout: Option<Duration>,
    pub max_tunnels: Option<usize>,
    /// TLS client config used to reach the proxy itself when `scheme` is
    /// [`ProxyScheme::Tls`]. Opaque, like the origin's `TlsParams` — never
    /// inspected beyond being handed to rustls.
    #[serde(skip)]
    pub proxy_tls: Option<Arc<rustls::ClientConfig>>,
}

impl ProxyConfig {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        ProxyConfig {
            scheme: ProxyScheme::Plain,
            host: host.into(),
            port,
            connect_timeout: None,
            max_tunnels: None,
            proxy_tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_max_tunnels(mut self, max: usize) -> Self {
        self.max_tunnels = Some(max);
        self
    }

    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The bundle "forwarded unchanged to the ambient HTTPS agent" —
/// this crate stores and exposes it but never interprets it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentOptions {
    #[serde(default)]
    pub keep_alive: bool,
    pub max_sockets: Option<usize>,
}

/// TLS client parameters forwarded opaquely to the TLS layer.
#[derive(Clone)]
pub struct TlsParams {
    pub server_name: ServerName<'static>,
    pub client_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsParams")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// A transient per-connection request, as recognized by `createConnection`.
#[derive(Clone)]
pub struct TunnelRequest {
    /// The resolved address to actually dial the proxy's CONNECT target
    /// from, e.g. an IP a caller already looked up.
    pub host: String,
    /// The origin's logical name, when it differs from `host` (e.g. `host`
    /// is a resolved IP and this is the name that was resolved). Preferred
    /// over `host` for both CONNECT-target construction and pool-key
    /// derivation when present, so `host:port` doesn't collapse onto an
    /// IP:port that collides across origins sharing one address.
    pub hostname: Option<String>,
    pub port: u16,
    /// Opaque identity shared by the HTTPS client's own connection pool and
    /// this crate's session cache.
    pub origin_key: Option<String>,
    pub timeout: Option<Duration>,
    /// Overrides the cached session ticket `origin_key` would otherwise
    /// resolve to. When set, `TunnelFactory` skips the `SessionCache`
    /// lookup and resumes against this ticket instead.
    pub session: Option<SessionTicket>,
    pub tls: TlsParams,
    /// Opaque per-request header bag forwarded into the CONNECT request but
    /// never parsed or generated here.
    pub extra_headers: http::HeaderMap,
}

impl TunnelRequest {
    /// The name to use when building the CONNECT request-target and when
    /// deriving the pool key: `hostname` if present, else `host`.
    fn connect_name(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.host)
    }

    /// `host:port` as it appears on the wire in the CONNECT request-target,
    /// preferring `hostname` over `host` when both are set.
    pub(crate) fn target(&self) -> String {
        format!("{}:{}", self.connect_name(), self.port)
    }
}

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tunnel-client-demo", about = "Demo client using TunnelAgent")]
pub struct Cli {
    #[arg(long, default_value = "demos/proxy.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    pub proxy: ProxyConfig,
    pub agent: AgentOptions,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub tls: TlsFileConfig,
}

pub fn load_demo_config(path: &PathBuf) -> anyhow::Result<DemoConfig> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let cfg: DemoConfig = serde_yaml::from_str(&yaml)?;
    Ok(cfg)
}

/// File paths for the origin-facing TLS material the demo loads at
/// startup. `ca_file` unset falls back to the public web PKI root store;
/// `client_cert`/`client_key` unset means no client certificate is
/// presented (plain TLS rather than mutual TLS).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsFileConfig {
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

fn cert_reader(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .map(|res| res.map_err(anyhow::Error::from))
        .collect()
}

fn privkey_reader(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .map(PrivateKeyDer::Pkcs8)
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 private key found in {}", path.display()))
}

/// Builds the origin-facing `rustls::ClientConfig` the demo hands to every
/// `TunnelRequest`. Mirrors `load_demo_config`'s role for TLS material:
/// read once at startup, reused across connections.
pub fn build_client_config(tls: &TlsFileConfig) -> anyhow::Result<rustls::ClientConfig> {
    let roots = match &tls.ca_file {
        Some(path) => {
            let mut store = rustls::RootCertStore::empty();
            store.add_parsable_certificates(cert_reader(path)?);
            store
        },
        None => {
            let mut store = rustls::RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        },
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert = cert_reader(cert_path)?;
            let key = privkey_reader(key_path)?;
            builder.with_client_auth_cert(cert, key)?
        },
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

mod humantime_millis_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms: Option<u64> = Option::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
