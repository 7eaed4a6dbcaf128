use std::sync::Arc;

/// Unified error taxonomy for the tunnel agent, one variant per row of the
/// error-handling design: every failure reaches the caller via exactly one
/// terminal event, never retried internally.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TunnelError {
    #[error("proxy transport error: {0}")]
    ProxyTransport(#[source] Arc<std::io::Error>),

    #[error("{message}")]
    ProxyRefused { code: u16, message: String },

    #[error("tunnel timed out waiting on the proxy response")]
    ProxyTimeout,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] Arc<std::io::Error>),

    #[error("out-of-protocol proxy response: unexpected data followed the CONNECT reply")]
    UnexpectedProxyPayload,

    #[error("socket hang up")]
    CallerAbort,

    #[error("tunnel is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn proxy_transport(err: std::io::Error) -> Self {
        TunnelError::ProxyTransport(Arc::new(err))
    }

    pub fn tls_handshake(err: std::io::Error) -> Self {
        TunnelError::TlsHandshake(Arc::new(err))
    }

    /// The numeric code the proxy returned, when this is a `ProxyRefused`.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TunnelError::ProxyRefused { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<TunnelError> for std::io::Error {
    fn from(err: TunnelError) -> Self {
        let message = err.to_string();
        match err {
            TunnelError::ProxyTransport(e) | TunnelError::TlsHandshake(e) => {
                std::io::Error::new(e.kind(), message)
            }
            TunnelError::CallerAbort => {
                std::io::Error::new(std::io::ErrorKind::ConnectionAborted, message)
            }
            TunnelError::ProxyTimeout => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, message)
            }
            _ => std::io::Error::other(message),
        }
    }
}
