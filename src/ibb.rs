//! # In-Band Bytestream (XEP-0047)
//!
//! The no-extra-socket transport: data rides inside ordinary stanzas as
//! base64 chunks. An IQ `<open>` negotiates the stream after SI, chunks
//! travel in IQs (acknowledged per chunk) or messages (fire-and-forget),
//! and an IQ `<close>` ends it. Everything is demultiplexed by
//! `(peer, sid)` in the factory registry.
//!
//! Unknown stream ids are the factory's problem (`item-not-found` for IQs,
//! silent drop for messages); this module only ever sees stanzas for a
//! stream that exists.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::bytestream::{EventChannel, StateCell, StreamEvent, StreamInfo, StreamState};
use crate::identity::Jid;
use crate::stanza::{ns, DataChunk, IbbOpen, Iq, IqPayload, IqType, Stanza, StanzaError};
use crate::transport::StanzaTransport;

/// Default chunk payload size (bytes before base64 expansion).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Hard ceiling; a peer proposing more is refused.
pub const MAX_BLOCK_SIZE: usize = 65_535;

struct IbbInner {
    state: StateCell,
    block_size: usize,
    close_on_connection_error: bool,
    /// Set when the peer sent `<close/>`, so our teardown does not echo
    /// another close IQ back.
    remote_closed: bool,
}

pub struct IbbBytestream {
    info: StreamInfo,
    self_jid: Jid,
    transport: Arc<dyn StanzaTransport>,
    events: EventChannel,
    inner: Mutex<IbbInner>,
}

impl IbbBytestream {
    pub(crate) fn new(
        info: StreamInfo,
        self_jid: Jid,
        initial: StreamState,
        transport: Arc<dyn StanzaTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            self_jid,
            transport,
            events: EventChannel::new(),
            inner: Mutex::new(IbbInner {
                state: StateCell::new(initial),
                block_size: DEFAULT_BLOCK_SIZE,
                close_on_connection_error: true,
                remote_closed: false,
            }),
        })
    }

    pub fn protocol(&self) -> &'static str {
        ns::IBB
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub async fn state(&self) -> StreamState {
        self.inner.lock().await.state.get()
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.events.take()
    }

    pub(crate) async fn set_close_on_connection_error(&self, on: bool) {
        self.inner.lock().await.close_on_connection_error = on;
    }

    pub async fn accept(&self) {
        let iq = {
            let mut inner = self.inner.lock().await;
            if inner.state.get() != StreamState::LocalPending {
                return;
            }
            if !inner.state.advance(StreamState::Accepted) {
                return;
            }
            crate::si::build_si_accept(&self.info, &self.self_jid, ns::IBB)
        };
        self.events.emit(StreamEvent::StateChanged(StreamState::Accepted));
        if let Some(iq) = iq {
            if let Err(e) = self.transport.send_stanza(Stanza::Iq(iq)).await {
                warn!(sid = %self.info.stream_id, error = %e, "failed to send SI accept");
            }
        }
    }

    pub(crate) async fn mark_accepted(&self) {
        let advanced = self.inner.lock().await.state.advance(StreamState::Accepted);
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Accepted));
        }
    }

    /// Send the `<open>` IQ and wait out the peer's verdict in the
    /// background. An error reply or timeout is a connection failure, not
    /// a protocol close: the fallback wrapper relies on that distinction.
    pub async fn initiate(self: &Arc<Self>) -> bool {
        let block_size = {
            let inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Initiating {
                return false;
            }
            inner.block_size
        };
        let open = Iq {
            id: format!("ibbo{}", crate::bytestream::generate_stream_id()),
            from: Some(self.self_jid.clone()),
            to: self.info.peer_jid.clone(),
            iq_type: IqType::Set,
            payload: IqPayload::IbbOpen(IbbOpen {
                sid: self.info.stream_id.clone(),
                block_size: Some(block_size as u32),
            }),
        };
        let this = self.clone();
        tokio::spawn(async move {
            match this.transport.send_iq(open).await {
                Ok(reply) if !reply.is_error() => {
                    debug!(sid = %this.info.stream_id, "in-band stream opened");
                    this.set_open().await;
                }
                Ok(reply) => {
                    debug!(
                        sid = %this.info.stream_id,
                        error = ?reply.error(),
                        "peer refused in-band open"
                    );
                    this.connection_failed().await;
                }
                Err(e) => {
                    debug!(sid = %this.info.stream_id, error = %e, "in-band open timed out");
                    this.connection_failed().await;
                }
            }
        });
        true
    }

    async fn set_open(&self) {
        let advanced = self.inner.lock().await.state.advance(StreamState::Open);
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Open));
        }
    }

    async fn connection_failed(self: &Arc<Self>) {
        self.events.emit(StreamEvent::ConnectionError);
        let send_protocol = self.inner.lock().await.close_on_connection_error;
        self.close_internal(None, send_protocol).await;
    }

    /// Chunk, encode, and ship application data as acknowledged IQs.
    /// Returns false without a transition when the stream is not open; a
    /// refused or timed-out chunk is a hard error and closes the stream.
    pub async fn send(self: &Arc<Self>, data: &[u8]) -> bool {
        let block_size = {
            let inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Open {
                return false;
            }
            inner.block_size
        };
        for chunk in data.chunks(block_size) {
            let iq = Iq {
                id: format!("ibbd{}", crate::bytestream::generate_stream_id()),
                from: Some(self.self_jid.clone()),
                to: self.info.peer_jid.clone(),
                iq_type: IqType::Set,
                payload: IqPayload::IbbData(DataChunk {
                    sid: self.info.stream_id.clone(),
                    data: BASE64.encode(chunk),
                }),
            };
            match self.transport.send_iq(iq).await {
                Ok(reply) if !reply.is_error() => {
                    trace!(sid = %self.info.stream_id, bytes = chunk.len(), "chunk acknowledged");
                }
                Ok(reply) => {
                    debug!(
                        sid = %self.info.stream_id,
                        error = ?reply.error(),
                        "peer refused data chunk"
                    );
                    self.close(None).await;
                    return false;
                }
                Err(e) => {
                    debug!(sid = %self.info.stream_id, error = %e, "data chunk timed out");
                    self.close(None).await;
                    return false;
                }
            }
        }
        true
    }

    pub async fn close(&self, error: Option<StanzaError>) {
        self.close_internal(error, true).await;
    }

    /// Close without the protocol-level decline or close IQ.
    pub(crate) async fn close_quiet(&self) {
        self.close_internal(None, false).await;
    }

    async fn close_internal(&self, error: Option<StanzaError>, send_protocol: bool) {
        enum Farewell {
            Decline(Option<Iq>),
            CloseIq,
            Nothing,
        }
        let farewell = {
            let mut inner = self.inner.lock().await;
            let was = inner.state.get();
            if !inner.state.advance(StreamState::Closed) {
                return;
            }
            if !send_protocol || inner.remote_closed {
                Farewell::Nothing
            } else if was == StreamState::LocalPending {
                Farewell::Decline(crate::si::build_si_decline(&self.info, &self.self_jid, error))
            } else {
                Farewell::CloseIq
            }
        };
        self.events.emit(StreamEvent::StateChanged(StreamState::Closed));
        match farewell {
            Farewell::Decline(Some(iq)) => {
                if let Err(e) = self.transport.send_stanza(Stanza::Iq(iq)).await {
                    warn!(sid = %self.info.stream_id, error = %e, "failed to send decline");
                }
            }
            Farewell::Decline(None) | Farewell::Nothing => {}
            Farewell::CloseIq => {
                let close = Iq {
                    id: format!("ibbc{}", crate::bytestream::generate_stream_id()),
                    from: Some(self.self_jid.clone()),
                    to: self.info.peer_jid.clone(),
                    iq_type: IqType::Set,
                    payload: IqPayload::IbbClose {
                        sid: self.info.stream_id.clone(),
                    },
                };
                let transport = self.transport.clone();
                let sid = self.info.stream_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.send_iq(close).await {
                        debug!(sid = %sid, error = %e, "close acknowledgement not received");
                    }
                });
            }
        }
        debug!(sid = %self.info.stream_id, peer = %self.info.peer_jid, "in-band bytestream closed");
    }

    // ------------------------------------------------------------------
    // Inbound stanzas (factory-routed)
    // ------------------------------------------------------------------

    /// The peer's `<open>` arrived. Valid only while `Accepted` (the
    /// stream id was announced via SI and we said yes). A nonzero proposed
    /// block size replaces the default; zero or absent is ignored.
    pub(crate) async fn handle_open(&self, open: &IbbOpen) -> Result<(), StanzaError> {
        let advanced = {
            let mut inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Accepted {
                return Err(StanzaError::not_acceptable("stream is not awaiting open"));
            }
            match open.block_size {
                Some(0) | None => {}
                Some(size) if size as usize > MAX_BLOCK_SIZE => {
                    return Err(StanzaError::not_acceptable("block size too large"));
                }
                Some(size) => inner.block_size = size as usize,
            }
            inner.state.advance(StreamState::Open)
        };
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Open));
        }
        Ok(())
    }

    /// A data chunk arrived (IQ or message; the factory maps the verdict
    /// to an error reply or a silent drop accordingly).
    pub(crate) async fn handle_data(&self, chunk: &DataChunk) -> Result<(), StanzaError> {
        let block_size = {
            let inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Open {
                return Err(StanzaError::not_acceptable("stream is not open"));
            }
            inner.block_size
        };
        let data = BASE64
            .decode(chunk.data.as_bytes())
            .map_err(|_| StanzaError::bad_request("chunk is not valid base64"))?;
        if data.len() > block_size {
            return Err(StanzaError::not_acceptable("chunk exceeds negotiated block size"));
        }
        trace!(sid = %self.info.stream_id, bytes = data.len(), "chunk received");
        self.events.emit(StreamEvent::DataReceived {
            sender: self.info.peer_handle,
            data,
        });
        Ok(())
    }

    /// The peer's `<close>` arrived; tear down without echoing one back.
    pub(crate) async fn handle_close(&self) {
        self.inner.lock().await.remote_closed = true;
        self.close_internal(None, false).await;
    }
}

impl std::fmt::Debug for IbbBytestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbbBytestream")
            .field("peer", &self.info.peer_jid)
            .field("sid", &self.info.stream_id)
            .finish_non_exhaustive()
    }
}
