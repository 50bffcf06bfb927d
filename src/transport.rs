//! Transport trait definition for the stanza layer.
//!
//! The bytestream core never talks to the network directly for stanzas; it
//! goes through [`StanzaTransport`], implemented by the XMPP session layer.
//! The trait is defined here, separately from any implementation, so that
//! every protocol module depends only on the seam and tests can substitute
//! channel-backed fakes.
//!
//! ## Contract
//!
//! - `send_stanza` is fire-and-forget: the call returns once the stanza is
//!   queued for delivery; delivery failures surface as `Err` only when the
//!   connection itself is unusable.
//! - `send_iq` registers a one-shot correlated-reply callback and resolves
//!   with exactly one of: the reply stanza (which may be `type="error"`),
//!   or `Err` on timeout/teardown. Callers must treat `Err` exactly like an
//!   explicit error reply.
//! - Dropping the future returned by `send_iq` cancels interest in the
//!   reply; a late reply is then discarded by the implementation.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::stanza::{Iq, Stanza};

/// Default ceiling for a correlated IQ round trip.
pub const IQ_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Message-send / message-dispatch service provided by the XMPP session.
#[async_trait]
pub trait StanzaTransport: Send + Sync + 'static {
    /// Queue a stanza for delivery, without expecting a reply.
    async fn send_stanza(&self, stanza: Stanza) -> Result<()>;

    /// Send an IQ and wait for its single correlated reply.
    ///
    /// Resolves with the reply (result or error) or errors out after the
    /// implementation's timeout; a timeout is indistinguishable from an
    /// error reply to every caller in this crate.
    async fn send_iq(&self, iq: Iq) -> Result<Iq>;
}
