use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::ClientSessionStore;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;

use crate::admission_queue::AdmissionQueue;
use crate::config::{ProxyConfig, TlsParams, TunnelRequest};
use crate::error::TunnelError;
use crate::proxy_connector::{self, ConnectEvent, RawDuplex, TunnelStream};
use crate::session_cache::{SessionCache, SessionTicket};
use crate::surrogate_stream::{SurrogateEvent, SurrogateStream};

/// Lets `destroy()` on a still-`Pending` surrogate reach whichever CONNECT
/// task is (or will be) in flight, even though the two are wired up in
/// either order: the abort request can arrive before `proxy_connector`
/// hands back its handle (admission queued the request) or after.
#[derive(Default)]
struct AbortSlot {
    requested: AtomicBool,
    handle: Mutex<Option<AbortHandle>>,
}

impl AbortSlot {
    fn request_abort(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().as_ref() {
            handle.abort();
        }
    }

    fn was_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn install(&self, handle: AbortHandle) {
        if self.requested.load(Ordering::SeqCst) {
            handle.abort();
        } else {
            *self.handle.lock() = Some(handle);
        }
    }
}

/// Orchestrates one origin connection end to end: admission, the CONNECT
/// exchange, the TLS handshake over the resulting tunnel, and session-cache
/// bookkeeping, all behind a [`SurrogateStream`] handed back to the caller
/// before any of it has happened.
#[derive(Clone)]
pub struct TunnelFactory {
    proxy: ProxyConfig,
    sessions: Arc<SessionCache>,
    admission: Arc<AdmissionQueue>,
}

impl TunnelFactory {
    pub fn new(proxy: ProxyConfig) -> Self {
        let max_tunnels = proxy.max_tunnels;
        TunnelFactory {
            proxy,
            sessions: Arc::new(SessionCache::new()),
            admission: Arc::new(AdmissionQueue::new(max_tunnels)),
        }
    }

    /// `createConnection`: returns a live-looking stream synchronously; the
    /// CONNECT exchange and TLS handshake happen on spawned tasks and drive
    /// the stream's state transitions.
    pub fn create_connection(&self, req: TunnelRequest) -> SurrogateStream {
        let origin_key = req.origin_key.clone().unwrap_or_else(|| req.target());

        let abort_slot = Arc::new(AbortSlot::default());
        let slot_for_destroy = abort_slot.clone();
        let surrogate = SurrogateStream::new(move || slot_for_destroy.request_abort());

        // Tracks whether this request has actually been credited an
        // AdmissionQueue slot. A request destroyed while still queued must
        // not make the watcher below release a slot it was never given.
        let credited = Arc::new(AtomicBool::new(false));
        self.spawn_release_watcher(&surrogate, &origin_key, credited.clone());

        let factory = self.clone();
        let queued_req = req.clone();
        let queued_surrogate = surrogate.clone();
        let queued_abort_slot = abort_slot.clone();
        let queued_origin_key = origin_key.clone();
        let queued_admission = self.admission.clone();
        let queued_credited = credited.clone();
        let queued_start = move || {
            if queued_abort_slot.was_requested() {
                // Destroyed while still queued: AdmissionQueue just
                // credited this waiter with a slot it will never use
                // (`begin` would only abort immediately). Hand it straight
                // back instead of leaking it or starting a doomed CONNECT.
                queued_admission.release();
                return;
            }
            queued_credited.store(true, Ordering::SeqCst);
            factory.begin(queued_req, queued_surrogate, queued_abort_slot, queued_origin_key);
        };

        if self.admission.admit(queued_start) {
            credited.store(true, Ordering::SeqCst);
            self.begin(req, surrogate.clone(), abort_slot, origin_key);
        }

        surrogate
    }

    /// Releases the admission slot and, on an error-tainted close, evicts
    /// the origin's cached TLS session — exactly once per connection,
    /// triggered by the stream's own terminal event rather than polled.
    /// Gated on `credited` so a surrogate that was destroyed while still
    /// queued (never admitted) cannot release a slot it never claimed.
    fn spawn_release_watcher(&self, surrogate: &SurrogateStream, origin_key: &str, credited: Arc<AtomicBool>) {
        let mut events = surrogate.subscribe();
        let admission = self.admission.clone();
        let sessions = self.sessions.clone();
        let origin_key = origin_key.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SurrogateEvent::Error(_)) => {
                        sessions.evict(&origin_key);
                        if credited.load(Ordering::SeqCst) {
                            admission.release();
                        }
                        break;
                    },
                    Ok(SurrogateEvent::Close { had_error }) => {
                        if had_error {
                            sessions.evict(&origin_key);
                        }
                        if credited.load(Ordering::SeqCst) {
                            admission.release();
                        }
                        break;
                    },
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Runs the CONNECT exchange and TLS handshake for one admitted
    /// request. Called either synchronously from `create_connection` (slot
    /// available immediately) or later, as an [`AdmissionQueue`] waiter.
    fn begin(
        &self,
        req: TunnelRequest,
        surrogate: SurrogateStream,
        abort_slot: Arc<AbortSlot>,
        origin_key: String,
    ) {
        let proxy = self.proxy.clone();
        let sessions = self.sessions.clone();
        let target = req.target();
        let timeout = req.timeout;
        let tls = req.tls;
        let extra_headers = req.extra_headers;
        // An explicit `session` override suppresses the cache lookup —
        // the caller is pinning this handshake to a specific ticket rather
        // than whatever `origin_key` would otherwise resolve to.
        let session_override = req.session;

        tokio::spawn(async move {
            let (handle, mut timeout_events) = {
                let (handle, rx) = proxy_connector::connect(proxy, target, timeout, extra_headers);
                abort_slot.install(handle.abort_handle());
                (rx, handle.events)
            };

            let surrogate_for_timeouts = surrogate.clone();
            tokio::spawn(async move {
                while let Some(ConnectEvent::Timeout) = timeout_events.recv().await {
                    surrogate_for_timeouts.mark_timeout();
                }
            });

            let tunnel = match handle.await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    surrogate.mark_failed(err);
                    return;
                },
                Err(_) => {
                    surrogate.mark_failed(TunnelError::CallerAbort);
                    return;
                },
            };

            let store = match session_override {
                Some(ticket) => ticket.store(),
                None => sessions
                    .get(&origin_key)
                    .map(|ticket| ticket.store())
                    .unwrap_or_else(|| sessions.store_for(&origin_key)),
            };
            match handshake(tunnel, &tls, store.clone()).await {
                Ok(tls_stream) => {
                    sessions.put(&origin_key, SessionTicket::from_store(store));
                    surrogate.mark_connected(Box::new(tls_stream));
                },
                Err(err) => {
                    sessions.evict(&origin_key);
                    surrogate.mark_failed(err);
                },
            }
        });
    }
}

async fn handshake(
    tunnel: TunnelStream,
    tls: &TlsParams,
    session_store: Arc<dyn ClientSessionStore>,
) -> Result<tokio_rustls::client::TlsStream<TunnelStream>, TunnelError> {
    let mut config = (*tls.client_config).clone();
    config.resumption = rustls::client::Resumption::store(session_store);
    let connector = TlsConnector::from(Arc::new(config));
    connector
        .connect(tls.server_name.clone(), tunnel)
        .await
        .map_err(TunnelError::tls_handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls_pki_types::ServerName;
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ensure_crypto_provider() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn insecure_client_config() -> StdArc<rustls::ClientConfig> {
        ensure_crypto_provider();
        #[derive(Debug)]
        struct NoVerify;
        impl rustls::client::danger::ServerCertVerifier for NoVerify {
            fn verify_server_cert(
                &self,
                _end_entity: &rustls_pki_types::CertificateDer<'_>,
                _intermediates: &[rustls_pki_types::CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: rustls_pki_types::UnixTime,
            ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &rustls_pki_types::CertificateDer<'_>,
                _dss: &rustls::DigitallySignedStruct,
            ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
                Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &rustls_pki_types::CertificateDer<'_>,
                _dss: &rustls::DigitallySignedStruct,
            ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
                Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
                rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes()
            }
        }

        StdArc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(StdArc::new(NoVerify))
                .with_no_client_auth(),
        )
    }

    async fn mock_proxy_then_tls(cert: rustls_pki_types::CertificateDer<'static>, key: rustls_pki_types::PrivateKeyDer<'static>) -> std::net::SocketAddr {
        ensure_crypto_provider();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_config = StdArc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert], key)
                .unwrap(),
        );
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if buf[..n].ends_with(b"\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
            let mut tls_sock = acceptor.accept(sock).await.unwrap();
            let mut buf = [0u8; 64];
            let n = tls_sock.read(&mut buf).await.unwrap();
            tls_sock.write_all(&buf[..n]).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn end_to_end_connect_then_tls_then_echo() {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["origin.example".to_string()]).unwrap();
        let cert_der = cert.der().clone();
        let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(signing_key.serialize_der().into());

        let addr = mock_proxy_then_tls(cert_der, key_der).await;

        let factory = TunnelFactory::new(ProxyConfig::plain(addr.ip().to_string(), addr.port()));
        let req = TunnelRequest {
            host: "origin.example".to_string(),
            hostname: None,
            port: 443,
            origin_key: None,
            timeout: Some(Duration::from_secs(5)),
            session: None,
            tls: TlsParams {
                server_name: ServerName::try_from("origin.example").unwrap(),
                client_config: insecure_client_config(),
            },
            extra_headers: http::HeaderMap::new(),
        };

        let mut stream = factory.create_connection(req);
        let mut events = stream.subscribe();

        let connect_event = events.recv().await.unwrap();
        assert!(matches!(connect_event, SurrogateEvent::Connect));

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(factory.sessions.get("origin.example:443").is_some());
    }

    #[tokio::test]
    async fn destroying_a_queued_request_never_leaks_or_double_spends_its_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                // Accept and never respond, so any CONNECT exchange against
                // this listener stays Pending indefinitely until aborted.
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let _ = sock.read(&mut buf).await;
                });
            }
        });

        let factory =
            TunnelFactory::new(ProxyConfig::plain(addr.ip().to_string(), addr.port()).with_max_tunnels(1));
        let make_req = || TunnelRequest {
            host: "origin.example".to_string(),
            hostname: None,
            port: 443,
            origin_key: Some("shared".to_string()),
            timeout: None,
            session: None,
            tls: TlsParams {
                server_name: ServerName::try_from("origin.example").unwrap(),
                client_config: insecure_client_config(),
            },
            extra_headers: http::HeaderMap::new(),
        };

        let first = factory.create_connection(make_req());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(factory.admission.active(), 1);

        let second = factory.create_connection(make_req());
        let _third = factory.create_connection(make_req());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(factory.admission.active(), 1);
        assert_eq!(factory.admission.queued(), 2);

        // `second` is destroyed while still queued — never admitted, so its
        // terminal event must not release a slot it was never credited.
        second.destroy();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(factory.admission.active(), 1);
        assert_eq!(factory.admission.queued(), 2);

        // Closing `first` frees its slot. The release must skip past the
        // destroyed `second` waiter — which must self-release rather than
        // start a CONNECT — and hand the slot to `_third`, not leak it.
        first.destroy();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.admission.active(), 1);
        assert_eq!(factory.admission.queued(), 0);
    }

    #[tokio::test]
    async fn session_override_is_honored_instead_of_the_cache_lookup() {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["origin.example".to_string()]).unwrap();
        let cert_der = cert.der().clone();
        let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(signing_key.serialize_der().into());
        let addr = mock_proxy_then_tls(cert_der, key_der).await;

        let factory = TunnelFactory::new(ProxyConfig::plain(addr.ip().to_string(), addr.port()));
        // A ticket pre-supplied from an unrelated origin's store; the
        // handshake below must be keyed off *this*, not a fresh lookup of
        // its own (empty) `origin_key` cache entry.
        let donor_store = factory.sessions.store_for("donor.example:443");
        let donor_ticket = SessionTicket::from_store(donor_store);

        let req = TunnelRequest {
            host: "origin.example".to_string(),
            hostname: None,
            port: 443,
            origin_key: Some("fresh.example:443".to_string()),
            timeout: Some(Duration::from_secs(5)),
            session: Some(donor_ticket),
            tls: TlsParams {
                server_name: ServerName::try_from("origin.example").unwrap(),
                client_config: insecure_client_config(),
            },
            extra_headers: http::HeaderMap::new(),
        };

        let stream = factory.create_connection(req);
        let mut events = stream.subscribe();
        let connect_event = events.recv().await.unwrap();
        assert!(matches!(connect_event, SurrogateEvent::Connect));

        // The override, not a fresh store, was negotiated against — and it
        // is now also recorded under `origin_key` for later reuse.
        assert!(factory.sessions.get("fresh.example:443").is_some());
    }

    #[tokio::test]
    async fn admission_cap_queues_second_request_until_first_closes() {
        let factory = TunnelFactory::new(ProxyConfig::plain("127.0.0.1".to_string(), 1).with_max_tunnels(1));
        // No real proxy is reachable on this port; what we are asserting is
        // queuing behavior, not a successful handshake.
        let make_req = || TunnelRequest {
            host: "origin.example".to_string(),
            hostname: None,
            port: 443,
            origin_key: Some("shared".to_string()),
            timeout: Some(Duration::from_millis(50)),
            session: None,
            tls: TlsParams {
                server_name: ServerName::try_from("origin.example").unwrap(),
                client_config: insecure_client_config(),
            },
            extra_headers: http::HeaderMap::new(),
        };

        let first = factory.create_connection(make_req());
        let mut first_events = first.subscribe();
        // First attempt fails fast (nothing listening on port 1); once its
        // terminal event fires the slot is released and the second attempt
        // may proceed without the queue leaking either slot accounting or
        // the session-cache entry for its origin.
        let ev = first_events.recv().await.unwrap();
        assert!(matches!(ev, SurrogateEvent::Error(_)));
        drop(first);

        let second = factory.create_connection(make_req());
        let mut second_events = second.subscribe();
        let ev = second_events.recv().await.unwrap();
        assert!(matches!(ev, SurrogateEvent::Error(_)));
    }
}
