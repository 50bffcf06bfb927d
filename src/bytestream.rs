//! # Shared Bytestream Contract
//!
//! Everything common to the four transport variants lives here:
//!
//! - [`StreamState`]: the lifecycle every bytestream walks through
//! - [`StreamEvent`]: the event stream a consumer subscribes to
//! - [`StreamInfo`]: the identifying attributes shared by all variants
//! - [`Bytestream`]: the closed dispatch enum over the concrete variants
//! - [`generate_stream_id`]: unique token generation for new streams
//!
//! The set of wire methods is fixed by protocol, so dispatch is a closed
//! enum rather than trait objects; adding a method is a source change, not
//! a registration.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::ibb::IbbBytestream;
use crate::identity::{Handle, Jid};
use crate::muc::MucBytestream;
use crate::multiple::MultipleBytestream;
use crate::socks5::Socks5Bytestream;
use crate::stanza::StanzaError;

/// Lifecycle states, ordered by maturity. Transitions only move forward,
/// except that every state may jump directly to `Closed`; `Closed` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    /// Created from an inbound SI request, awaiting local accept/decline.
    LocalPending,
    /// Accepted locally; awaiting the peer's transport negotiation.
    Accepted,
    /// Actively negotiating the transport (handshake in flight).
    Initiating,
    /// Both sides agree the stream is live; data may flow.
    Open,
    /// Terminal. The registry entry is eligible for removal.
    Closed,
}

/// Events delivered to the consumer of a bytestream, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Fires exactly once per actual transition, never on no-ops.
    StateChanged(StreamState),
    /// One application-data chunk, in arrival order, only while `Open`.
    DataReceived { sender: Handle, data: Vec<u8> },
    /// The transport failed with no candidates left to try.
    ConnectionError,
    /// Advisory backpressure: `true` while outbound data is buffered,
    /// `false` once the buffer drains. SOCKS5 only.
    WriteBlocked(bool),
}

/// Which side of the stream initiation we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamRole {
    Initiator,
    Target,
}

/// Registry key: exact-match on both fields. Identical stream ids from
/// different peers never collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BytestreamKey {
    pub peer: Jid,
    pub stream_id: String,
}

impl BytestreamKey {
    pub fn new(peer: Jid, stream_id: impl Into<String>) -> Self {
        Self {
            peer,
            stream_id: stream_id.into(),
        }
    }
}

/// Identifying attributes shared by every variant.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub peer_handle: Handle,
    /// Resolved full JID of the peer (a room JID for groupchat streams).
    pub peer_jid: Jid,
    pub stream_id: String,
    /// The SI request's stanza id; `None` for locally-initiated streams
    /// negotiated directly.
    pub stream_init_id: Option<String>,
}

impl StreamInfo {
    pub fn key(&self) -> BytestreamKey {
        BytestreamKey::new(self.peer_jid.clone(), self.stream_id.clone())
    }
}

// ============================================================================
// State cell and event channel (crate-internal plumbing)
// ============================================================================

/// Holds the current state and enforces the monotonic-with-Closed-escape
/// transition rule. Callers emit the `StateChanged` event iff `advance`
/// returns true, which is what makes the event fire exactly once per
/// transition.
#[derive(Debug)]
pub(crate) struct StateCell {
    current: StreamState,
}

impl StateCell {
    pub(crate) fn new(initial: StreamState) -> Self {
        Self { current: initial }
    }

    pub(crate) fn get(&self) -> StreamState {
        self.current
    }

    /// Apply a transition. Returns false (state untouched) when the stream
    /// is already closed, the target equals the current state, or the
    /// target would move backwards.
    pub(crate) fn advance(&mut self, to: StreamState) -> bool {
        if self.current == StreamState::Closed || to == self.current {
            return false;
        }
        if to != StreamState::Closed && to < self.current {
            return false;
        }
        self.current = to;
        true
    }
}

/// Per-stream event channel with a take-once receiver.
pub(crate) struct EventChannel {
    tx: mpsc::UnboundedSender<StreamEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl EventChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Deliver an event. A consumer that dropped its receiver stops
    /// receiving silently; that is the intended lifecycle semantics.
    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.rx.lock().expect("event channel poisoned").take()
    }
}

// ============================================================================
// Dispatch enum
// ============================================================================

/// A negotiated (or negotiating) bytestream. Cheap to clone; all variants
/// are reference-counted handles onto shared state.
#[derive(Clone)]
pub enum Bytestream {
    Socks5(std::sync::Arc<Socks5Bytestream>),
    Ibb(std::sync::Arc<IbbBytestream>),
    Muc(std::sync::Arc<MucBytestream>),
    Multiple(std::sync::Arc<MultipleBytestream>),
}

impl Bytestream {
    /// The constant namespace identifying this variant's wire method.
    pub fn protocol(&self) -> &'static str {
        match self {
            Bytestream::Socks5(s) => s.protocol(),
            Bytestream::Ibb(s) => s.protocol(),
            Bytestream::Muc(s) => s.protocol(),
            Bytestream::Multiple(s) => s.protocol(),
        }
    }

    pub fn info(&self) -> StreamInfo {
        match self {
            Bytestream::Socks5(s) => s.info().clone(),
            Bytestream::Ibb(s) => s.info().clone(),
            Bytestream::Muc(s) => s.info().clone(),
            Bytestream::Multiple(s) => s.info().clone(),
        }
    }

    pub fn key(&self) -> BytestreamKey {
        self.info().key()
    }

    pub async fn state(&self) -> StreamState {
        match self {
            Bytestream::Socks5(s) => s.state().await,
            Bytestream::Ibb(s) => s.state().await,
            Bytestream::Muc(s) => s.state().await,
            Bytestream::Multiple(s) => s.state().await,
        }
    }

    /// Start the method-specific handshake. Valid only in `Initiating`;
    /// returns false (without any transition) otherwise or when no
    /// candidates are available.
    pub async fn initiate(&self) -> bool {
        match self {
            Bytestream::Socks5(s) => s.initiate().await,
            Bytestream::Ibb(s) => s.initiate().await,
            Bytestream::Muc(s) => s.initiate().await,
            Bytestream::Multiple(s) => s.initiate().await,
        }
    }

    /// Send application data. Valid only in `Open`; returns false when the
    /// transport is not ready, after triggering an internal close on hard
    /// transport errors.
    pub async fn send(&self, data: &[u8]) -> bool {
        match self {
            Bytestream::Socks5(s) => s.send(data).await,
            Bytestream::Ibb(s) => s.send(data).await,
            Bytestream::Muc(s) => s.send(data).await,
            Bytestream::Multiple(s) => s.send(data).await,
        }
    }

    /// Accept a `LocalPending` offer; idempotent no-op in any later state.
    pub async fn accept(&self) {
        match self {
            Bytestream::Socks5(s) => s.accept().await,
            Bytestream::Ibb(s) => s.accept().await,
            Bytestream::Muc(s) => s.accept().await,
            Bytestream::Multiple(s) => s.accept().await,
        }
    }

    /// Close the stream. Idempotent. In `LocalPending` this declines the
    /// offer (with `error`, or the default decline); later states perform
    /// transport teardown.
    pub async fn close(&self, error: Option<StanzaError>) {
        match self {
            Bytestream::Socks5(s) => s.close(error).await,
            Bytestream::Ibb(s) => s.close(error).await,
            Bytestream::Muc(s) => s.close(error).await,
            Bytestream::Multiple(s) => s.close(error).await,
        }
    }

    /// Take the event receiver. Yields `Some` exactly once per stream.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        match self {
            Bytestream::Socks5(s) => s.take_events(),
            Bytestream::Ibb(s) => s.take_events(),
            Bytestream::Muc(s) => s.take_events(),
            Bytestream::Multiple(s) => s.take_events(),
        }
    }

    /// Whether a transport-level connection failure should also emit a
    /// protocol-level close/decline. The fallback wrapper clears this on a
    /// failing candidate before promoting the next one.
    pub(crate) async fn set_close_on_connection_error(&self, on: bool) {
        match self {
            Bytestream::Socks5(s) => s.set_close_on_connection_error(on).await,
            Bytestream::Ibb(s) => s.set_close_on_connection_error(on).await,
            // The remaining variants never emit protocol closes on
            // connection errors.
            Bytestream::Muc(_) | Bytestream::Multiple(_) => {}
        }
    }

    /// Transition to `Accepted` without emitting an SI accept stanza; the
    /// fallback wrapper sends one multi-method accept for all of its
    /// candidates instead.
    pub(crate) async fn mark_accepted(&self) {
        match self {
            Bytestream::Socks5(s) => s.mark_accepted().await,
            Bytestream::Ibb(s) => s.mark_accepted().await,
            // No handshake: accepting a groupchat stream just opens it.
            Bytestream::Muc(s) => s.accept().await,
            Bytestream::Multiple(_) => {}
        }
    }

    /// Close without any protocol-level farewell (no decline, no close
    /// IQ). Used when the wrapper releases a failed candidate or tears
    /// down after sending its own single farewell.
    pub(crate) async fn close_quiet(&self) {
        match self {
            Bytestream::Socks5(s) => s.close_quiet().await,
            Bytestream::Ibb(s) => s.close_quiet().await,
            // These never send farewells in the first place.
            Bytestream::Muc(s) => s.close(None).await,
            Bytestream::Multiple(s) => s.close(None).await,
        }
    }
}

impl std::fmt::Debug for Bytestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("Bytestream")
            .field("protocol", &self.protocol())
            .field("peer", &info.peer_jid)
            .field("sid", &info.stream_id)
            .finish()
    }
}

// ============================================================================
// Stream id generation
// ============================================================================

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a stream id: current time concatenated with a random integer.
/// Unique enough per (peer, connection) that collisions in the registry
/// indicate a misbehaving peer rather than bad luck.
pub fn generate_stream_id() -> String {
    format!("{}{}", now_ms(), rand::random::<u32>())
}
