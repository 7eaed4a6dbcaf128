use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore};

/// An opaque handle onto the TLS session-resumption state negotiated for one
/// origin. This is the store rustls itself writes and reads tickets from,
/// not a copy of the ticket bytes — rustls's `ClientSessionStore` trait
/// gives no safe way to peek at or reconstruct those, so "equal to the
/// ticket just negotiated" is modeled as "the same store object", which a
/// caller can hand back in on a later request to resume against it.
#[derive(Clone)]
pub struct SessionTicket(Arc<dyn ClientSessionStore>);

impl SessionTicket {
    pub(crate) fn store(&self) -> Arc<dyn ClientSessionStore> {
        self.0.clone()
    }

    pub(crate) fn from_store(store: Arc<dyn ClientSessionStore>) -> Self {
        SessionTicket(store)
    }
}

struct Entry {
    store: Arc<dyn ClientSessionStore>,
    /// Set once a handshake actually negotiates a session against `store`;
    /// `store_for` hands out fresh, unnegotiated entries that must not be
    /// mistaken for a cached ticket.
    negotiated: bool,
}

/// Stores and retrieves TLS session resumption state keyed by origin
/// identity. Last-writer-wins per key, no expiry beyond eviction and
/// process lifetime.
#[derive(Default)]
pub struct SessionCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionCache {
    pub fn new() -> Self {
        SessionCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the resumption store to hand to rustls for this origin,
    /// creating an empty one on first use. The store is reused across
    /// handshakes so rustls's own ticket bookkeeping persists between
    /// requests sharing `origin_key`.
    pub fn store_for(&self, origin_key: &str) -> Arc<dyn ClientSessionStore> {
        let mut entries = self.entries.lock();
        entries
            .entry(origin_key.to_string())
            .or_insert_with(|| Entry {
                store: Arc::new(ClientSessionMemoryCache::new(32)),
                negotiated: false,
            })
            .store
            .clone()
    }

    /// The cached ticket for this origin, if a handshake has negotiated one.
    /// Unknown keys, and keys whose entry was only ever created via
    /// `store_for` and never `put`, return `None`.
    pub fn get(&self, origin_key: &str) -> Option<SessionTicket> {
        self.entries
            .lock()
            .get(origin_key)
            .filter(|e| e.negotiated)
            .map(|e| SessionTicket(e.store.clone()))
    }

    /// Records `ticket` as the negotiated session for this origin,
    /// overwriting any prior record (last-writer-wins).
    pub fn put(&self, origin_key: &str, ticket: SessionTicket) {
        self.entries.lock().insert(
            origin_key.to_string(),
            Entry {
                store: ticket.0,
                negotiated: true,
            },
        );
    }

    /// Evicts the cached session for an origin whose most recent tunnel
    /// closed with `hadError = true`. The next `store_for` call installs a
    /// fresh, empty store so a later handshake does not resume the failed
    /// session.
    pub fn evict(&self, origin_key: &str) {
        self.entries.lock().remove(origin_key);
    }
}
