use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pki_types::ServerName;

use crate::config::{AgentOptions, ProxyConfig, TlsParams, TunnelRequest};
use crate::error::TunnelError;
use crate::surrogate_stream::SurrogateStream;
use crate::tunnel_factory::TunnelFactory;

/// Public facade: the thing an HTTPS client's connection pool actually
/// holds onto. Delegates the real work to [`TunnelFactory`] and adds the
/// two surfaces callers are expected to use directly — the synchronous
/// `create_connection` and a `tower_service::Service<http::Uri>` adaptor
/// for clients built around that trait.
#[derive(Clone)]
pub struct TunnelAgent {
    factory: TunnelFactory,
    options: AgentOptions,
    client_config: Arc<rustls::ClientConfig>,
}

impl TunnelAgent {
    pub fn new(
        options: AgentOptions,
        proxy: ProxyConfig,
        client_config: Arc<rustls::ClientConfig>,
    ) -> Self {
        TunnelAgent {
            factory: TunnelFactory::new(proxy),
            options,
            client_config,
        }
    }

    /// The ambient bundle forwarded to the HTTPS client unchanged; this
    /// crate only stores and exposes it.
    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// `createConnection`: see [`TunnelFactory::create_connection`].
    pub fn create_connection(&self, req: TunnelRequest) -> SurrogateStream {
        self.factory.create_connection(req)
    }

    /// The pooling identity an HTTPS client's own keep-alive pool would use
    /// to decide whether two requests may share a tunnel. Falls back to
    /// `target()` (which already prefers `hostname` over `host`, see
    /// DESIGN.md OQ-2) when the caller supplied no explicit `origin_key`.
    pub fn pool_key(&self, req: &TunnelRequest) -> String {
        req.origin_key.clone().unwrap_or_else(|| req.target())
    }

    fn request_from_uri(&self, uri: &http::Uri) -> Result<TunnelRequest, TunnelError> {
        let host = uri
            .host()
            .ok_or_else(|| TunnelError::Config("URI has no host".to_string()))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("http") { 80 } else { 443 });
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| TunnelError::Config(format!("invalid host in URI: {host}")))?;

        Ok(TunnelRequest {
            origin_key: Some(format!("{host}:{port}")),
            host,
            hostname: None,
            port,
            timeout: None,
            session: None,
            tls: TlsParams {
                server_name,
                client_config: self.client_config.clone(),
            },
            extra_headers: http::HeaderMap::new(),
        })
    }
}

impl tower_service::Service<http::Uri> for TunnelAgent {
    type Response = SurrogateStream;
    type Error = TunnelError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: http::Uri) -> Self::Future {
        let agent = self.clone();
        Box::pin(async move {
            let req = agent.request_from_uri(&uri)?;
            Ok(agent.create_connection(req))
        })
    }
}
