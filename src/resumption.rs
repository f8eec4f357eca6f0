//! C5: async session-resumption lookup.
//!
//! A C-style OpenSSL integration typically recovers the socket a resumption
//! lookup belongs to via `SSL_get_app_data(ssl)` inside the `SSL_CTX`
//! session-get callback. rustls's equivalent trait,
//! [`rustls::server::StoresServerSessions`], has no such parameter --
//! `get`/`put`/`take` see only the session key, never the connection.
//! [`SharedResumptionStore`] closes that gap with out-of-band state (much
//! like the renegotiation flag in the write path): a thread-local slot, set
//! for the duration of the one `process_new_packets()` call that might
//! consult the store, naming which socket's async lookup is in flight. The
//! store's `get()` reads the slot to correlate the lookup with a
//! caller-supplied [`AsyncResumptionBackend`]; nothing outside that call
//! ever observes the slot, so there's no leakage across connections
//! sharing a runtime thread.
//!
//! The state machine per socket is `Record -> RequestSent -> Complete`:
//! `Record` is the default (no lookup started yet, or a replay that hasn't
//! reconsulted the store); the first `get()` during a handshake promotes to
//! `RequestSent` and reports a cache miss so the handshake can pause instead
//! of blocking; `Complete` is entered once the caller hands back the
//! answer via [`SharedResumptionStore::complete_with_data`], and the next
//! `get()` (from the replayed ClientHello) returns that stashed answer.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rustls::server::StoresServerSessions;

/// Where a single handshake's async resumption lookup currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumptionState {
    /// No lookup in flight; the next `get()` call may start one.
    Record,
    /// A lookup was dispatched to the backend and we're waiting on it.
    RequestSent,
    /// The backend has answered; `process_new_packets()` may be retried.
    Complete,
}

/// Caller-provided, possibly-async session store (e.g. backed by a cache
/// server reached over the network). `lookup`/`store` are synchronous here;
/// a backend that needs real suspension drives that itself and hands the
/// result back through [`SharedResumptionStore::complete_with_data`] plus
/// the socket core's `resume_server_handshake`, rather than blocking this
/// call.
pub trait AsyncResumptionBackend: Send + Sync {
    /// Looks up a previous session by its opaque key. `None` means no
    /// session is cached for this key (distinct from "still pending").
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stores a new session under `key`.
    fn store(&self, key: &[u8], value: &[u8]);

    fn can_cache(&self) -> bool {
        true
    }
}

thread_local! {
    /// The socket id whose handshake call is presently on the stack, if
    /// any. Scoped to a single `process_new_packets()` invocation by
    /// [`ResumptionGuard`].
    static ACTIVE_RESUMPTION: Cell<Option<u64>> = const { Cell::new(None) };
}

/// RAII guard installing the active resumption slot for the duration of one
/// handshake-driving call. The socket core wraps every
/// `process_new_packets()` invocation in one of these so a concurrently
/// reentrant lookup (there isn't one on a single-threaded reactor, but the
/// guard costs nothing and removes the assumption) can never see a stale
/// slot.
pub struct ResumptionGuard {
    previous: Option<u64>,
}

impl ResumptionGuard {
    pub fn enter(socket_id: u64) -> Self {
        let previous = ACTIVE_RESUMPTION.with(|slot| slot.replace(Some(socket_id)));
        Self { previous }
    }

    /// The socket id of the handshake currently being driven on this
    /// thread, if any guard is active.
    pub fn active_socket_id() -> Option<u64> {
        ACTIVE_RESUMPTION.with(|slot| slot.get())
    }
}

impl Drop for ResumptionGuard {
    fn drop(&mut self) {
        ACTIVE_RESUMPTION.with(|slot| slot.set(self.previous));
    }
}

#[derive(Default)]
struct PerSocket {
    state: ResumptionState,
    key: Option<Vec<u8>>,
    answer: Option<Option<Vec<u8>>>,
    reused: bool,
}

impl Default for ResumptionState {
    fn default() -> Self {
        ResumptionState::Record
    }
}

/// Bridges a caller's [`AsyncResumptionBackend`] into rustls's
/// [`StoresServerSessions`]. Per-socket bookkeeping lives in `sockets`,
/// keyed by the socket id read from the active [`ResumptionGuard`]; `get()`
/// records a `RequestSent` transition there instead of blocking, so the
/// handshake can pause and be resumed later rather than blocking the
/// reactor.
pub struct SharedResumptionStore {
    backend: Arc<dyn AsyncResumptionBackend>,
    sockets: Mutex<HashMap<u64, PerSocket>>,
}

/// Hand-written rather than derived: rustls's `StoresServerSessions`
/// requires `Debug`, but the caller-supplied `AsyncResumptionBackend` isn't
/// required to implement it.
impl fmt::Debug for SharedResumptionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResumptionStore").finish_non_exhaustive()
    }
}

impl SharedResumptionStore {
    pub fn new(backend: Arc<dyn AsyncResumptionBackend>) -> Self {
        Self { backend, sockets: Mutex::new(HashMap::new()) }
    }

    /// State of a socket's in-flight lookup. Sockets with no entry yet are
    /// implicitly `Record`.
    pub fn state_for(&self, socket_id: u64) -> ResumptionState {
        self.sockets.lock().unwrap().get(&socket_id).map(|s| s.state).unwrap_or(ResumptionState::Record)
    }

    /// The key a pending lookup was dispatched for, if `state_for` reports
    /// `RequestSent`.
    pub fn pending_key(&self, socket_id: u64) -> Option<Vec<u8>> {
        self.sockets.lock().unwrap().get(&socket_id).and_then(|s| s.key.clone())
    }

    /// Forces a socket straight to `Complete` with no resumption answer --
    /// the "give up recording" path taken once the pre-handshake buffer
    /// grows past the snapshot threshold and a replay is no longer
    /// possible. The handshake then runs to completion as a full handshake.
    pub fn force_complete(&self, socket_id: u64) {
        let mut sockets = self.sockets.lock().unwrap();
        let entry = sockets.entry(socket_id).or_default();
        entry.state = ResumptionState::Complete;
        entry.answer = Some(None);
    }

    /// Called once the external resolver answers a dispatched lookup
    /// (`ssl_resume_server_handshake`): stashes the answer and advances to
    /// `Complete` so the replayed ClientHello's `get()` call returns it
    /// instead of dispatching again.
    pub fn complete_with_data(&self, socket_id: u64, session_data: Option<Vec<u8>>) {
        let mut sockets = self.sockets.lock().unwrap();
        let entry = sockets.entry(socket_id).or_default();
        entry.state = ResumptionState::Complete;
        entry.answer = Some(session_data);
    }

    /// Whether the handshake that just completed for `socket_id` resumed an
    /// existing session (as opposed to performing a full handshake).
    pub fn session_reused(&self, socket_id: u64) -> bool {
        self.sockets.lock().unwrap().get(&socket_id).map(|s| s.reused).unwrap_or(false)
    }

    /// Drops all bookkeeping for a socket. Called once its handshake has
    /// completed (successfully or not) or the socket is being torn down.
    pub fn clear(&self, socket_id: u64) {
        self.sockets.lock().unwrap().remove(&socket_id);
    }
}

impl StoresServerSessions for SharedResumptionStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let Some(socket_id) = ResumptionGuard::active_socket_id() else {
            return self.backend.lookup(key);
        };

        let mut sockets = self.sockets.lock().unwrap();
        let entry = sockets.entry(socket_id).or_default();
        match entry.state {
            ResumptionState::Record => {
                entry.state = ResumptionState::RequestSent;
                entry.key = Some(key.to_vec());
                None
            }
            ResumptionState::RequestSent => None,
            ResumptionState::Complete => {
                let answer = entry.answer.take().unwrap_or(None);
                entry.reused = answer.is_some();
                answer
            }
        }
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.backend.store(&key, &value);
        true
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.backend.lookup(key)
    }

    fn can_cache(&self) -> bool {
        self.backend.can_cache()
    }
}

/// An in-process, synchronous backend (no actual async suspension) useful
/// for tests and for deployments that don't need an external session cache.
/// Kept here as the default `AsyncResumptionBackend` impl so callers who
/// don't need true async lookups don't have to implement the trait
/// themselves.
pub struct InMemoryResumptionBackend {
    sessions: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryResumptionBackend {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryResumptionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncResumptionBackend for InMemoryResumptionBackend {
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.sessions.lock().unwrap().get(key).cloned()
    }

    fn store(&self, key: &[u8], value: &[u8]) {
        self.sessions.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }
}
