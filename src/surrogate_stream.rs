use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;

use crate::error::TunnelError;
use crate::proxy_connector::RawDuplex;

/// A one-shot timeout listener. Reference equality (`Arc::ptr_eq`) is how a
/// caller identifies "that specific listener" when clearing it, mirroring
/// the identity semantics a `setTimeout(0, cb)`-style clear call relies on.
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Events observable on a [`SurrogateStream`]: `connect`, `timeout`,
/// `error`, `close`.
#[derive(Debug, Clone)]
pub enum SurrogateEvent {
    Connect,
    Timeout,
    Error(TunnelError),
    Close { had_error: bool },
}

/// The shared listener-registration helper: given `(timeout, cb)`,
/// registers or clears one-shot listeners. Listeners fire at most once and
/// are never left dangling once cleared or fired — the fix for the
/// documented leak where repeated registration without a matching clear
/// accumulates listeners across requests.
#[derive(Default)]
struct TimeoutListeners {
    listeners: Vec<TimeoutCallback>,
}

impl TimeoutListeners {
    fn apply(&mut self, timeout: Duration, cb: Option<TimeoutCallback>) {
        if timeout.is_zero() {
            match cb {
                Some(target) => self.listeners.retain(|l| !Arc::ptr_eq(l, &target)),
                None => self.listeners.clear(),
            }
        } else if let Some(cb) = cb {
            self.listeners.push(cb);
        }
    }

    /// Fires every registered listener exactly once, then forgets them.
    fn fire_all(&mut self) {
        for cb in std::mem::take(&mut self.listeners) {
            cb();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// Bookkeeping of configuration forwarded to "the TLS stream" at and after
/// the Pending→Connected transition. The call-sequencing contract is the
/// essential semantics here, not the exact socket plumbing — so this
/// records *that* and *with what value* each call happened (see DESIGN.md).
#[derive(Default)]
pub struct StreamControls {
    pub timeout_calls: AtomicUsize,
    pub last_timeout: Mutex<Option<Duration>>,
    pub keepalive_enable_calls: AtomicUsize,
    pub last_keepalive_enable: Mutex<Option<bool>>,
    pub keepalive_delay_calls: AtomicUsize,
    pub last_keepalive_delay: Mutex<Option<Duration>>,
    pub unref_calls: AtomicUsize,
}

impl StreamControls {
    fn set_timeout(&self, d: Duration) {
        self.timeout_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_timeout.lock() = Some(d);
    }

    fn set_keepalive_enable(&self, enable: bool) {
        self.keepalive_enable_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_keepalive_enable.lock() = Some(enable);
    }

    fn set_keepalive_delay(&self, delay: Duration) {
        self.keepalive_delay_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_keepalive_delay.lock() = Some(delay);
    }

    fn unref(&self) {
        self.unref_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Buffered configuration recorded while [`Phase::Pending`]: the latest
/// value of each mutator, applied in the fixed three-step order at
/// transition to Connected.
#[derive(Default)]
struct PendingConfig {
    timeout: Option<Duration>,
    keepalive_enable: Option<bool>,
    keepalive_delay: Option<Duration>,
}

enum Phase {
    Pending(PendingConfig),
    Connected(Box<dyn RawDuplex>, Arc<StreamControls>),
    Failed(TunnelError),
    Closed,
}

struct Inner {
    phase: Phase,
    referenced: bool,
    timeout_listeners: TimeoutListeners,
    terminal_emitted: bool,
    events: broadcast::Sender<SurrogateEvent>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    destroy_cb: Option<Box<dyn FnOnce() + Send>>,
    /// Backs the idle-timeout deadline armed by `set_timeout` once
    /// Connected; re-armed on every call, aborted on destroy/close.
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

/// The central design element: a duplex byte stream that presents the
/// interface of a live TLS connection from the moment it is created, even
/// though the real stream does not exist yet. Modeled as one state-tagged
/// variant (`Phase`) behind a single dispatcher rather than a vtable swap.
#[derive(Clone)]
pub struct SurrogateStream {
    inner: Arc<Mutex<Inner>>,
}

impl SurrogateStream {
    /// Created synchronously inside the admission path. `destroy_cb`
    /// aborts the in-flight CONNECT if `destroy()` is called before the
    /// stream reaches Connected.
    pub fn new(destroy_cb: impl FnOnce() + Send + 'static) -> Self {
        let (tx, _rx) = broadcast::channel(8);
        SurrogateStream {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Pending(PendingConfig::default()),
                referenced: true,
                timeout_listeners: TimeoutListeners::default(),
                terminal_emitted: false,
                events: tx,
                read_waker: None,
                write_waker: None,
                destroy_cb: Some(Box::new(destroy_cb)),
                timeout_task: None,
            })),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SurrogateEvent> {
        self.inner.lock().events.subscribe()
    }

    /// `setTimeout(ms, cb?)` — pending and connected variants dispatched
    /// through one entry point. While Connected, this also (re-)arms a real
    /// idle-timeout deadline: each call replaces whatever deadline was
    /// previously armed, so only the most recently set timeout can ever fire.
    pub fn set_timeout(&self, timeout: Duration, cb: Option<TimeoutCallback>) {
        let mut connected = false;
        {
            let mut inner = self.inner.lock();
            inner.timeout_listeners.apply(timeout, cb);
            match &mut inner.phase {
                Phase::Pending(cfg) => cfg.timeout = Some(timeout),
                Phase::Connected(_, controls) => {
                    controls.set_timeout(timeout);
                    connected = true;
                },
                Phase::Failed(_) | Phase::Closed => {},
            }
            if connected {
                if let Some(old) = inner.timeout_task.take() {
                    old.abort();
                }
            }
        }
        if connected && !timeout.is_zero() {
            let armed_for = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                armed_for.mark_timeout();
            });
            self.inner.lock().timeout_task = Some(handle);
        }
    }

    /// `setKeepAlive` — supports both the `(enable, delay?)` and bare
    /// `(delay)` calling conventions via `enable: Option<bool>`.
    pub fn set_keep_alive(&self, enable: Option<bool>, delay: Option<Duration>) {
        let mut inner = self.inner.lock();
        match &mut inner.phase {
            Phase::Pending(cfg) => {
                if let Some(enable) = enable {
                    cfg.keepalive_enable = Some(enable);
                }
                if let Some(delay) = delay {
                    cfg.keepalive_delay = Some(delay);
                }
            },
            Phase::Connected(_, controls) => {
                if let Some(enable) = enable {
                    controls.set_keepalive_enable(enable);
                }
                if let Some(delay) = delay {
                    controls.set_keepalive_delay(delay);
                }
            },
            Phase::Failed(_) | Phase::Closed => {},
        }
    }

    /// `ref()` — default referenced=true.
    pub fn reference(&self) {
        self.inner.lock().referenced = true;
    }

    /// `unref()`. Note: tokio exposes no runtime-level "keep the process
    /// alive" handle concept the way libuv does, so this only updates the
    /// bookkeeping flag applied at transition (see DESIGN.md OQ-3); it does
    /// not change scheduler behavior.
    pub fn unreference(&self) {
        self.inner.lock().referenced = false;
    }

    /// `destroy()`. In `Pending`, aborts the outstanding CONNECT via the
    /// constructor-supplied callback and transitions to Failed. In
    /// `Connected`, forwards to the TLS stream by dropping it, which the
    /// close path treats the same as a natural close.
    pub fn destroy(&self) {
        let (emit_close, had_error) = {
            let mut inner = self.inner.lock();
            if let Some(task) = inner.timeout_task.take() {
                task.abort();
            }
            match std::mem::replace(&mut inner.phase, Phase::Closed) {
                Phase::Pending(_) => {
                    if let Some(cb) = inner.destroy_cb.take() {
                        cb();
                    }
                    (true, false)
                },
                Phase::Connected(stream, _) => {
                    drop(stream);
                    (true, false)
                },
                Phase::Failed(_) => (false, false),
                Phase::Closed => (false, false),
            }
        };
        if emit_close {
            self.emit_close(had_error);
        }
        self.wake_io();
    }

    /// Called by [`crate::tunnel_factory::TunnelFactory`] on CONNECT
    /// success, once the TLS handshake over the tunnel completes. Applies
    /// buffered Pending configuration to `controls` in the fixed order
    /// documented on `PendingConfig`, then transitions the phase.
    pub(crate) fn mark_connected(&self, stream: Box<dyn RawDuplex>) {
        let controls = Arc::new(StreamControls::default());
        let mut pending_timeout = None;
        {
            let mut inner = self.inner.lock();
            let referenced = inner.referenced;
            if let Phase::Pending(cfg) = &inner.phase {
                if let Some(t) = cfg.timeout {
                    controls.set_timeout(t);
                    pending_timeout = Some(t);
                }
                if let Some(enable) = cfg.keepalive_enable {
                    controls.set_keepalive_enable(enable);
                }
                if let Some(delay) = cfg.keepalive_delay {
                    controls.set_keepalive_delay(delay);
                }
            }
            if !referenced {
                controls.unref();
            }
            inner.phase = Phase::Connected(stream, controls);
        }
        self.emit(SurrogateEvent::Connect);
        self.wake_io();

        // The buffered timeout is applied to `controls` above; arming the
        // real deadline too is what makes the value actually fire rather
        // than sit as a recorded call.
        if let Some(t) = pending_timeout.filter(|t| !t.is_zero()) {
            let armed_for = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(t).await;
                armed_for.mark_timeout();
            });
            self.inner.lock().timeout_task = Some(handle);
        }
    }

    /// CONNECT or TLS failure before Connected: forwarded as the stream's
    /// one terminal `error` event.
    pub(crate) fn mark_failed(&self, err: TunnelError) {
        let should_emit = {
            let mut inner = self.inner.lock();
            if matches!(inner.phase, Phase::Pending(_)) {
                inner.phase = Phase::Failed(err.clone());
                true
            } else {
                false
            }
        };
        if should_emit {
            self.emit_error(err);
        }
        self.wake_io();
    }

    /// Forwards a proxy-level CONNECT timeout so the caller's timeout
    /// handlers fire during the CONNECT phase too.
    pub(crate) fn mark_timeout(&self) {
        self.inner.lock().timeout_listeners.fire_all();
        self.emit(SurrogateEvent::Timeout);
    }

    /// The underlying TLS stream closed, `had_error` reflecting whether it
    /// closed because of an error. `close` is emitted exactly once no matter
    /// whether a prior `end` was observed — enforced here by the same
    /// `terminal_emitted` gate `mark_failed` uses, not by tracking `end`
    /// separately.
    pub(crate) fn note_close(&self, had_error: bool) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.phase, Phase::Closed) {
                return;
            }
            if let Some(task) = inner.timeout_task.take() {
                task.abort();
            }
            inner.phase = Phase::Closed;
        }
        self.emit_close(had_error);
        self.wake_io();
    }

    fn emit(&self, event: SurrogateEvent) {
        let _ = self.inner.lock().events.send(event);
    }

    fn emit_error(&self, err: TunnelError) {
        let mut inner = self.inner.lock();
        if inner.terminal_emitted {
            return;
        }
        inner.terminal_emitted = true;
        let _ = inner.events.send(SurrogateEvent::Error(err));
    }

    fn emit_close(&self, had_error: bool) {
        let mut inner = self.inner.lock();
        if inner.terminal_emitted {
            return;
        }
        inner.terminal_emitted = true;
        let _ = inner.events.send(SurrogateEvent::Close { had_error });
    }

    fn wake_io(&self) {
        let mut inner = self.inner.lock();
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
        if let Some(w) = inner.write_waker.take() {
            w.wake();
        }
    }

    #[cfg(test)]
    pub(crate) fn controls(&self) -> Option<Arc<StreamControls>> {
        match &self.inner.lock().phase {
            Phase::Connected(_, controls) => Some(controls.clone()),
            _ => None,
        }
    }
}

impl AsyncRead for SurrogateStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut inner = self.inner.lock();
        match &mut inner.phase {
            Phase::Pending(_) => {
                inner.read_waker = Some(cx.waker().clone());
                Poll::Pending
            },
            Phase::Connected(stream, _) => Pin::new(&mut **stream).poll_read(cx, buf),
            Phase::Failed(err) => Poll::Ready(Err(err.clone().into())),
            Phase::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for SurrogateStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut inner = self.inner.lock();
        match &mut inner.phase {
            Phase::Pending(_) => {
                inner.write_waker = Some(cx.waker().clone());
                Poll::Pending
            },
            Phase::Connected(stream, _) => Pin::new(&mut **stream).poll_write(cx, buf),
            Phase::Failed(err) => Poll::Ready(Err(err.clone().into())),
            Phase::Closed => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut inner = self.inner.lock();
        match &mut inner.phase {
            Phase::Pending(_) => Poll::Ready(Ok(())),
            Phase::Connected(stream, _) => Pin::new(&mut **stream).poll_flush(cx),
            Phase::Failed(err) => Poll::Ready(Err(err.clone().into())),
            Phase::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut inner = self.inner.lock();
        match &mut inner.phase {
            Phase::Pending(_) => Poll::Ready(Ok(())),
            Phase::Connected(stream, _) => Pin::new(&mut **stream).poll_shutdown(cx),
            Phase::Failed(_) | Phase::Closed => Poll::Ready(Ok(())),
        }
    }
}
