//! # Groupchat Pseudo-Bytestream
//!
//! Data transport over a multi-user chat room: base64 chunks inside
//! `type="groupchat"` messages sent to the room JID, or inside direct
//! messages to one member's real JID for private per-member sends. There
//! is no IQ-based open or close handshake, so `accept` and `initiate`
//! collapse straight into the open state.
//!
//! Every outbound chunk carries an AMP rule set requesting synchronous
//! delivery (error-on-offline, error-on-wrong-resource) instead of
//! store-and-forward.
//!
//! Inbound policy is strict silence: a chunk from a sender that does not
//! resolve to a room-member handle, or for a stream that is not open, is
//! dropped without any reply. Error stanzas are never sent back over a
//! groupchat channel.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::bytestream::{EventChannel, StateCell, StreamEvent, StreamInfo, StreamState};
use crate::identity::{HandleMap, Jid};
use crate::stanza::{ns, DataChunk, MessagePayload, MessageStanza, MessageType, Stanza, StanzaError};
use crate::transport::StanzaTransport;

/// Chunk payload size before base64 expansion. Groupchat messages relay
/// through the MUC service, so chunks stay modest.
const MUC_CHUNK_SIZE: usize = 4096;

struct MucInner {
    state: StateCell,
}

pub struct MucBytestream {
    /// `peer_jid` here is the room JID; `peer_handle` the room's handle.
    info: StreamInfo,
    self_jid: Jid,
    /// Room-member resolver: full `room@service/nick` JIDs to handles.
    /// Lookups never insert; an unknown nickname means the sender was
    /// never admitted and its data is dropped.
    members: Arc<HandleMap>,
    transport: Arc<dyn StanzaTransport>,
    events: EventChannel,
    inner: Mutex<MucInner>,
}

impl MucBytestream {
    pub(crate) fn new(
        info: StreamInfo,
        self_jid: Jid,
        initial: StreamState,
        members: Arc<HandleMap>,
        transport: Arc<dyn StanzaTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            self_jid,
            members,
            transport,
            events: EventChannel::new(),
            inner: Mutex::new(MucInner {
                state: StateCell::new(initial),
            }),
        })
    }

    pub fn protocol(&self) -> &'static str {
        ns::MUC_BYTESTREAM
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

    /// The member resolver, for the room layer to populate as presence
    /// comes and goes.
    pub fn members(&self) -> &Arc<HandleMap> {
        &self.members
    }

    /// No handshake: an accepted stream is immediately open.
    pub async fn accept(&self) {
        self.open_now().await;
    }

    /// No handshake: reports true once the stream is open, false only
    /// after close.
    pub async fn initiate(&self) -> bool {
        if self.inner.lock().await.state.get() == StreamState::Closed {
            return false;
        }
        self.open_now().await;
        true
    }

    async fn open_now(&self) {
        let advanced = self.inner.lock().await.state.advance(StreamState::Open);
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Open));
        }
    }

    /// Broadcast data to the room.
    pub async fn send(&self, data: &[u8]) -> bool {
        self.send_inner(&self.info.peer_jid, MessageType::Groupchat, data)
            .await
    }

    /// Private per-member send: chunks go to the member's real JID rather
    /// than through the room broadcast.
    pub async fn send_to(&self, member: &Jid, data: &[u8]) -> bool {
        self.send_inner(member, MessageType::Normal, data).await
    }

    async fn send_inner(&self, to: &Jid, msg_type: MessageType, data: &[u8]) -> bool {
        if self.inner.lock().await.state.get() != StreamState::Open {
            return false;
        }
        for chunk in data.chunks(MUC_CHUNK_SIZE) {
            let message = MessageStanza {
                from: Some(self.self_jid.clone()),
                to: to.clone(),
                msg_type,
                payload: MessagePayload::MucData {
                    chunk: DataChunk {
                        sid: self.info.stream_id.clone(),
                        data: BASE64.encode(chunk),
                    },
                    amp: true,
                },
            };
            if let Err(e) = self.transport.send_stanza(Stanza::Message(message)).await {
                warn!(sid = %self.info.stream_id, error = %e, "groupchat send failed");
                self.close(None).await;
                return false;
            }
        }
        true
    }

    pub async fn close(&self, _error: Option<StanzaError>) {
        // No close stanza exists for this method; closing is local.
        let advanced = self.inner.lock().await.state.advance(StreamState::Closed);
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Closed));
            debug!(
                sid = %self.info.stream_id,
                room = %self.info.peer_jid,
                "groupchat bytestream closed"
            );
        }
    }

    /// A data chunk arrived from `from` (the full in-room JID, resource =
    /// nickname). Unknown senders, closed streams, and undecodable chunks
    /// are all dropped silently.
    pub(crate) async fn handle_data(&self, from: &Jid, chunk: &DataChunk) {
        let Some(sender) = self.members.handle_of(from) else {
            debug!(
                sid = %self.info.stream_id,
                from = %from,
                "dropping chunk from unknown room member"
            );
            return;
        };
        if self.inner.lock().await.state.get() != StreamState::Open {
            debug!(sid = %self.info.stream_id, "dropping chunk for non-open stream");
            return;
        }
        let Ok(data) = BASE64.decode(chunk.data.as_bytes()) else {
            debug!(sid = %self.info.stream_id, from = %from, "dropping undecodable chunk");
            return;
        };
        trace!(sid = %self.info.stream_id, from = %from, bytes = data.len(), "chunk received");
        self.events.emit(StreamEvent::DataReceived { sender, data });
    }
}

impl std::fmt::Debug for MucBytestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MucBytestream")
            .field("room", &self.info.peer_jid)
            .field("sid", &self.info.stream_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Iq, IqPayload};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeTransport {
        sent: StdMutex<Vec<Stanza>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StanzaTransport for FakeTransport {
        async fn send_stanza(&self, stanza: Stanza) -> Result<()> {
            self.sent.lock().unwrap().push(stanza);
            Ok(())
        }

        async fn send_iq(&self, iq: Iq) -> Result<Iq> {
            let reply = Iq::result_of(&iq, &iq.to.clone(), IqPayload::Empty);
            Ok(reply)
        }
    }

    fn make_stream(transport: Arc<FakeTransport>) -> (Arc<MucBytestream>, Arc<HandleMap>) {
        let room = Jid::new("room@muc.example.com");
        let rooms = HandleMap::new();
        let members = Arc::new(HandleMap::new());
        let info = StreamInfo {
            peer_handle: rooms.ensure(&room),
            peer_jid: room,
            stream_id: "muc-sid".to_owned(),
            stream_init_id: None,
        };
        let stream = MucBytestream::new(
            info,
            Jid::new("room@muc.example.com/me"),
            StreamState::Open,
            members.clone(),
            transport,
        );
        (stream, members)
    }

    #[tokio::test]
    async fn known_member_data_is_delivered() {
        let (stream, members) = make_stream(FakeTransport::new());
        let sender_jid = Jid::new("room@muc.example.com/alice");
        let alice = members.ensure(&sender_jid);

        let mut events = stream.take_events().expect("events");
        let chunk = DataChunk {
            sid: "muc-sid".to_owned(),
            data: BASE64.encode(b"tube data"),
        };
        stream.handle_data(&sender_jid, &chunk).await;

        match events.try_recv() {
            Ok(StreamEvent::DataReceived { sender, data }) => {
                assert_eq!(sender, alice);
                assert_eq!(data, b"tube data");
            }
            other => panic!("expected data event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_sender_is_dropped_silently() {
        let (stream, _members) = make_stream(FakeTransport::new());
        let mut events = stream.take_events().expect("events");
        let chunk = DataChunk {
            sid: "muc-sid".to_owned(),
            data: BASE64.encode(b"who dis"),
        };
        stream
            .handle_data(&Jid::new("room@muc.example.com/stranger"), &chunk)
            .await;
        assert!(events.try_recv().is_err(), "no event for unknown sender");
    }

    #[tokio::test]
    async fn undecodable_chunk_is_dropped_silently() {
        let (stream, members) = make_stream(FakeTransport::new());
        let sender = Jid::new("room@muc.example.com/alice");
        members.ensure(&sender);
        let mut events = stream.take_events().expect("events");
        let chunk = DataChunk {
            sid: "muc-sid".to_owned(),
            data: "!!not base64!!".to_owned(),
        };
        stream.handle_data(&sender, &chunk).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_broadcasts_groupchat_with_amp() {
        let transport = FakeTransport::new();
        let (stream, _members) = make_stream(transport.clone());
        assert!(stream.send(b"payload").await);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let Stanza::Message(msg) = &sent[0] else {
            panic!("expected a message stanza");
        };
        assert_eq!(msg.msg_type, MessageType::Groupchat);
        assert_eq!(msg.to, Jid::new("room@muc.example.com"));
        let MessagePayload::MucData { amp, .. } = &msg.payload else {
            panic!("expected groupchat data payload");
        };
        assert!(*amp, "synchronous delivery rules requested");
    }

    #[tokio::test]
    async fn send_to_targets_member_directly() {
        let transport = FakeTransport::new();
        let (stream, _members) = make_stream(transport.clone());
        let member = Jid::new("alice@example.com/desktop");
        assert!(stream.send_to(&member, b"private").await);

        let sent = transport.sent.lock().unwrap();
        let Stanza::Message(msg) = &sent[0] else {
            panic!("expected a message stanza");
        };
        assert_eq!(msg.msg_type, MessageType::Normal);
        assert_eq!(msg.to, member);
    }

    #[tokio::test]
    async fn accept_and_initiate_are_handshake_free() {
        let transport = FakeTransport::new();
        let (stream, _members) = make_stream(transport.clone());
        stream.accept().await;
        assert!(stream.initiate().await);
        assert_eq!(stream.state().await, StreamState::Open);
        assert!(
            transport.sent.lock().unwrap().is_empty(),
            "no handshake stanzas for groupchat streams"
        );
    }

    #[tokio::test]
    async fn closed_stream_drops_data_and_refuses_initiate() {
        let (stream, members) = make_stream(FakeTransport::new());
        let sender = Jid::new("room@muc.example.com/alice");
        members.ensure(&sender);
        stream.close(None).await;
        stream.close(None).await;
        assert!(!stream.initiate().await);

        let mut events = stream.take_events().expect("events");
        // The single close transition is the only event.
        assert_eq!(
            events.try_recv().ok(),
            Some(StreamEvent::StateChanged(StreamState::Closed))
        );
        assert!(events.try_recv().is_err());
    }
}
