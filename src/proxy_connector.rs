use std::time::Duration;

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector as ProxyTlsConnector;

use crate::config::{ProxyConfig, ProxyScheme};
use crate::error::TunnelError;

/// The raw, hijacked byte stream returned after a CONNECT response of 200.
pub type TunnelStream = Box<dyn RawDuplex>;

/// Marker for "anything we can splice a TLS handshake onto" — the
/// transport this crate hands to the origin's TLS layer.
pub trait RawDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawDuplex for T {}

/// Out-of-band notification a CONNECT exchange may raise while its result
/// is still pending — currently only the timeout case.
#[derive(Debug, Clone, Copy)]
pub enum ConnectEvent {
    Timeout,
}

/// Handle returned synchronously alongside the in-flight CONNECT exchange.
/// Lets a caller (here, [`crate::surrogate_stream::SurrogateStream`]) abort
/// the underlying task and observe timeout notifications without blocking
/// on the exchange's outcome.
pub struct ConnectHandle {
    abort: AbortHandle,
    pub events: mpsc::UnboundedReceiver<ConnectEvent>,
}

impl ConnectHandle {
    /// Aborts the outstanding CONNECT. This is the mechanism `destroy()`
    /// on a `Pending` surrogate uses.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// A cloneable capability to abort this exchange, for callers that need
    /// to hold onto it past the point where they'd otherwise have dropped
    /// `ConnectHandle` (e.g. after taking ownership of `events`).
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

/// Performs one CONNECT exchange against the upstream proxy.
///
/// Returns the [`ConnectHandle`] synchronously; the actual network I/O runs
/// on a spawned task and its outcome arrives via the returned
/// [`oneshot::Receiver`]. This mirrors the two-phase shape the rest of the
/// crate depends on: the caller gets something to act on (abort, observe
/// timeout) before the network result exists.
pub fn connect(
    proxy: ProxyConfig,
    target: String,
    timeout: Option<Duration>,
    extra_headers: http::HeaderMap,
) -> (
    ConnectHandle,
    oneshot::Receiver<Result<TunnelStream, TunnelError>>,
) {
    let (result_tx, result_rx) = oneshot::channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let outcome = run_connect(&proxy, &target, timeout, &extra_headers, event_tx.clone()).await;
        // The receiver may already be gone if the caller destroyed the
        // surrogate before we finished; that is not our error to report.
        let _ = result_tx.send(outcome);
    });

    (
        ConnectHandle {
            abort: task.abort_handle(),
            events: event_rx,
        },
        result_rx,
    )
}

async fn run_connect(
    proxy: &ProxyConfig,
    target: &str,
    timeout: Option<Duration>,
    extra_headers: &http::HeaderMap,
    events: mpsc::UnboundedSender<ConnectEvent>,
) -> Result<TunnelStream, TunnelError> {
    let mut conn = dial_proxy(proxy).await?;

    let request = build_connect_request(target, extra_headers);
    conn.write_all(request.as_bytes())
        .await
        .map_err(TunnelError::proxy_transport)?;

    let read = read_connect_response(&mut *conn);

    let head = match timeout {
        Some(dur) => {
            // The timeout governs only the wait for the status line. On
            // elapse we notify the caller but keep reading in the
            // background — the connector never aborts a CONNECT exchange
            // on its own just because the caller's timeout elapsed.
            tokio::select! {
                biased;
                head = read => head,
                _ = tokio::time::sleep(dur) => {
                    let _ = events.send(ConnectEvent::Timeout);
                    read_connect_response(&mut *conn).await
                }
            }
        },
        None => read.await,
    }?;

    match head.status {
        200 => {
            if !head.trailing.is_empty() {
                return Err(TunnelError::UnexpectedProxyPayload);
            }
            Ok(Box::new(conn) as TunnelStream)
        },
        status => {
            // "destroys the underlying byte stream (no reuse)" — dropping
            // `conn` here does that.
            Err(TunnelError::ProxyRefused {
                code: status,
                message: head.reason,
            })
        },
    }
}

/// Builds the CONNECT request line plus headers. `extra_headers` is an
/// opaque per-request bag forwarded verbatim — never parsed or used to
/// generate proxy-auth credentials.
fn build_connect_request(target: &str, extra_headers: &http::HeaderMap) -> String {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    for (name, value) in extra_headers {
        if let Ok(value) = value.to_str() {
            request.push_str(name.as_str());
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
    }
    request.push_str("\r\n");
    request
}

async fn dial_proxy(proxy: &ProxyConfig) -> Result<Box<dyn RawDuplex>, TunnelError> {
    let tcp = TcpStream::connect(proxy.authority())
        .await
        .map_err(TunnelError::proxy_transport)?;
    tcp.set_nodelay(true).ok();

    match proxy.scheme {
        ProxyScheme::Plain => Ok(Box::new(tcp)),
        ProxyScheme::Tls => {
            let config = proxy
                .proxy_tls
                .clone()
                .ok_or_else(|| TunnelError::Config("proxy scheme is tls but proxy_tls is unset".into()))?;
            let server_name = ServerName::try_from(proxy.host.clone())
                .map_err(|_| TunnelError::Config(format!("invalid proxy host {}", proxy.host)))?;
            let connector = ProxyTlsConnector::from(config);
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(TunnelError::tls_handshake)?;
            Ok(Box::new(stream))
        },
    }
}

struct ResponseHead {
    status: u16,
    reason: String,
    /// Any bytes read past the blank line terminating the response head —
    /// a non-empty body following a CONNECT response is out-of-protocol
    /// and must be surfaced, not silently dropped.
    trailing: Vec<u8>,
}

async fn read_connect_response(
    conn: &mut (dyn RawDuplex),
) -> Result<ResponseHead, TunnelError> {
    let mut buf = [0u8; 8192];
    let mut pos = 0usize;
    loop {
        let n = conn
            .read(&mut buf[pos..])
            .await
            .map_err(TunnelError::proxy_transport)?;
        if n == 0 {
            return Err(TunnelError::proxy_transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected eof while tunneling",
            )));
        }
        pos += n;

        if let Some(head_end) = find_header_end(&buf[..pos]) {
            let head_bytes = &buf[..head_end];
            let (status, reason) = parse_status_line(head_bytes)?;
            let trailing = buf[head_end..pos].to_vec();
            return Ok(ResponseHead {
                status,
                reason,
                trailing,
            });
        }

        if pos == buf.len() {
            return Err(TunnelError::UnexpectedProxyPayload);
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

fn parse_status_line(head: &[u8]) -> Result<(u16, String), TunnelError> {
    let line_end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| TunnelError::UnexpectedProxyPayload)?
        .trim_end_matches('\r');

    let mut parts = line.splitn(3, ' ');
    let _version = parts.next().ok_or(TunnelError::UnexpectedProxyPayload)?;
    let status: u16 = parts
        .next()
        .ok_or(TunnelError::UnexpectedProxyPayload)?
        .parse()
        .map_err(|_| TunnelError::UnexpectedProxyPayload)?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn mock_proxy_once(
        response: &'static [u8],
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if request.ends_with(b"\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(response).await.unwrap();
            request
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn happy_path_yields_tunnel_stream() {
        let (addr, server) = mock_proxy_once(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let proxy = ProxyConfig::plain(addr.ip().to_string(), addr.port());

        let (_handle, rx) = connect(
            proxy,
            "www.example.com:1234".to_string(),
            None,
            http::HeaderMap::new(),
        );
        let tunnel = rx.await.unwrap().unwrap();
        drop(tunnel);

        let req = server.await.unwrap();
        assert_eq!(
            &req[..],
            b"CONNECT www.example.com:1234 HTTP/1.1\r\nHost: www.example.com:1234\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn extra_headers_are_forwarded_into_the_connect_request() {
        let (addr, server) = mock_proxy_once(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let proxy = ProxyConfig::plain(addr.ip().to_string(), addr.port());

        let mut headers = http::HeaderMap::new();
        headers.insert("X-Forwarded-For", "10.0.0.1".parse().unwrap());
        headers.insert("Proxy-Authorization", "Bearer opaque-token".parse().unwrap());

        let (_handle, rx) = connect(proxy, "origin.example:443".to_string(), None, headers);
        let tunnel = rx.await.unwrap().unwrap();
        drop(tunnel);

        let req = server.await.unwrap();
        let req = String::from_utf8(req).unwrap();
        assert!(req.starts_with("CONNECT origin.example:443 HTTP/1.1\r\n"));
        assert!(req.contains("Host: origin.example:443\r\n"));
        assert!(req.contains("x-forwarded-for: 10.0.0.1\r\n"));
        assert!(req.contains("proxy-authorization: Bearer opaque-token\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn non_200_yields_proxy_refused_with_reason_and_code() {
        let (addr, _server) =
            mock_proxy_once(b"HTTP/1.1 500 Connection Error\r\n\r\n").await;
        let proxy = ProxyConfig::plain(addr.ip().to_string(), addr.port());

        let (_handle, rx) = connect(
            proxy,
            "origin.example:443".to_string(),
            None,
            http::HeaderMap::new(),
        );
        let err = rx.await.unwrap().unwrap_err();
        match err {
            TunnelError::ProxyRefused { code, message } => {
                assert_eq!(code, 500);
                assert!(message.contains("Connection Error"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_proxy_emits_timeout_event_without_aborting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });
        let proxy = ProxyConfig::plain(addr.ip().to_string(), addr.port());

        let (mut handle, rx) = connect(
            proxy,
            "slow.example:443".to_string(),
            Some(Duration::from_millis(20)),
            http::HeaderMap::new(),
        );
        let timeout_event = handle.events.recv().await;
        assert!(matches!(timeout_event, Some(ConnectEvent::Timeout)));

        // Even though we were notified of the timeout, the exchange itself
        // eventually succeeds because the connector never aborts on its own.
        let tunnel = rx.await.unwrap();
        assert!(tunnel.is_ok());
    }
}
