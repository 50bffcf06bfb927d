//! # Multi-Method Fallback Wrapper
//!
//! Wraps an ordered list of concrete bytestreams that are alternative
//! transports for the same logical stream, built either from a local offer
//! (we proposed several methods) or from the peer's multi-method accept
//! (ranked by its preference).
//!
//! Only the front stream is ever active. On its connection error the
//! wrapper removes it, quiets its protocol close, and promotes the next
//! candidate; events from the active stream are forwarded, except that a
//! candidate's `Closed` transition is swallowed while other candidates
//! remain — only the last survivor's closure becomes the wrapper's own.
//!
//! Data that already flowed over a failed candidate is not retransmitted
//! over the promoted one; failover is only clean during negotiation.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bytestream::{
    Bytestream, EventChannel, StateCell, StreamEvent, StreamInfo, StreamState,
};
use crate::identity::Jid;
use crate::stanza::{ns, Stanza, StanzaError};
use crate::transport::StanzaTransport;

struct MultiInner {
    state: StateCell,
    streams: VecDeque<Bytestream>,
    pump: Option<JoinHandle<()>>,
}

pub struct MultipleBytestream {
    info: StreamInfo,
    self_jid: Jid,
    transport: Arc<dyn StanzaTransport>,
    events: EventChannel,
    inner: Mutex<MultiInner>,
}

impl MultipleBytestream {
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
            inner: Mutex::new(MultiInner {
                state: StateCell::new(initial),
                streams: VecDeque::new(),
                pump: None,
            }),
        })
    }

    pub fn protocol(&self) -> &'static str {
        ns::SI_MULTIPLE
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

    /// Append a candidate, in offer/preference order.
    pub(crate) async fn push(&self, stream: Bytestream) {
        self.inner.lock().await.streams.push_back(stream);
    }

    /// The protocols of the remaining candidates, in order.
    pub async fn methods(&self) -> Vec<&'static str> {
        self.inner
            .lock()
            .await
            .streams
            .iter()
            .map(|s| s.protocol())
            .collect()
    }

    pub async fn candidate_count(&self) -> usize {
        self.inner.lock().await.streams.len()
    }

    /// Accept the whole offer with a single multi-method accept naming
    /// every usable candidate; the sub-streams transition quietly.
    pub async fn accept(self: &Arc<Self>) {
        let (iq, streams) = {
            let mut inner = self.inner.lock().await;
            if inner.state.get() != StreamState::LocalPending {
                return;
            }
            if !inner.state.advance(StreamState::Accepted) {
                return;
            }
            let methods: Vec<&'static str> =
                inner.streams.iter().map(|s| s.protocol()).collect();
            let streams: Vec<Bytestream> = inner.streams.iter().cloned().collect();
            (
                crate::si::build_si_multi_accept(&self.info, &self.self_jid, &methods),
                streams,
            )
        };
        for stream in &streams {
            stream.mark_accepted().await;
        }
        self.events.emit(StreamEvent::StateChanged(StreamState::Accepted));
        if let Some(iq) = iq {
            if let Err(e) = self.transport.send_stanza(Stanza::Iq(iq)).await {
                warn!(sid = %self.info.stream_id, error = %e, "failed to send multi-method accept");
            }
        }
        // The peer drives its preferred method first; start forwarding.
        self.spawn_pump().await;
    }

    /// Start the first (highest-priority) candidate.
    pub async fn initiate(self: &Arc<Self>) -> bool {
        {
            let inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Initiating {
                return false;
            }
            if inner.streams.is_empty() {
                return false;
            }
        }
        self.spawn_pump().await;
        true
    }

    fn spawn_pump(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if inner.pump.is_none() {
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                    Box::pin(Self::pump(self.clone()));
                inner.pump = Some(tokio::spawn(fut));
            }
        })
    }

    /// Drive the active candidate: initiate it if it is ours to start,
    /// forward its events, and fall over to the next on failure.
    async fn pump(this: Arc<Self>) {
        loop {
            let front = {
                let inner = this.inner.lock().await;
                if inner.state.get() == StreamState::Closed {
                    return;
                }
                inner.streams.front().cloned()
            };
            let Some(front) = front else {
                this.all_candidates_failed().await;
                return;
            };

            let Some(mut rx) = front.take_events() else {
                warn!(sid = %this.info.stream_id, "candidate events already consumed");
                return;
            };

            // A failing-over candidate must not emit a protocol-level
            // close; quiet it before it can fail.
            front.set_close_on_connection_error(false).await;

            // Outbound wrappers start the candidate themselves; inbound
            // ones sit in Accepted until the peer drives them.
            let front_initiate: std::pin::Pin<
                Box<dyn std::future::Future<Output = bool> + Send>,
            > = Box::pin(front.initiate());
            if front.state().await == StreamState::Initiating && !front_initiate.await {
                debug!(
                    sid = %this.info.stream_id,
                    method = front.protocol(),
                    "candidate refused to initiate"
                );
                if this.discard_front(&front).await == 0 {
                    this.all_candidates_failed().await;
                    return;
                }
                continue;
            }

            let mut failed = false;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::ConnectionError => {
                        failed = true;
                        break;
                    }
                    StreamEvent::StateChanged(StreamState::Closed) => {
                        let survivors = this.inner.lock().await.streams.len();
                        if survivors <= 1 {
                            // The last survivor's closure is the
                            // wrapper's closure.
                            this.close(None).await;
                            return;
                        }
                        // Swallowed: more candidates remain.
                        failed = true;
                        break;
                    }
                    StreamEvent::StateChanged(state) => {
                        let advanced = this.inner.lock().await.state.advance(state);
                        if advanced {
                            this.events.emit(StreamEvent::StateChanged(state));
                        }
                    }
                    passthrough @ (StreamEvent::DataReceived { .. }
                    | StreamEvent::WriteBlocked(_)) => {
                        this.events.emit(passthrough);
                    }
                }
            }
            if !failed {
                // The candidate's event channel ended without a failure
                // signal; nothing more to forward.
                return;
            }

            let remaining = this.discard_front(&front).await;
            if remaining == 0 {
                this.all_candidates_failed().await;
                return;
            }
            debug!(
                sid = %this.info.stream_id,
                method = front.protocol(),
                remaining,
                "candidate failed, promoting next method"
            );
        }
    }

    /// Remove and quietly release the failed front candidate. Returns the
    /// number of candidates left.
    async fn discard_front(&self, front: &Bytestream) -> usize {
        let remaining = {
            let mut inner = self.inner.lock().await;
            inner.streams.pop_front();
            inner.streams.len()
        };
        front.set_close_on_connection_error(false).await;
        front.close_quiet().await;
        remaining
    }

    async fn all_candidates_failed(self: &Arc<Self>) {
        debug!(sid = %self.info.stream_id, "every stream method failed");
        self.events.emit(StreamEvent::ConnectionError);
        self.close(None).await;
    }

    /// Delegate to the active candidate.
    pub async fn send(&self, data: &[u8]) -> bool {
        let front = {
            let inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Open {
                return false;
            }
            inner.streams.front().cloned()
        };
        match front {
            Some(stream) => Box::pin(stream.send(data)).await,
            None => false,
        }
    }

    pub async fn close(&self, error: Option<StanzaError>) {
        let (was, streams) = {
            let mut inner = self.inner.lock().await;
            let was = inner.state.get();
            if !inner.state.advance(StreamState::Closed) {
                return;
            }
            // The pump is not aborted: close may be running on it. It
            // observes the active candidate's forwarded close (or the
            // wrapper's Closed state) and exits on its own.
            inner.pump.take();
            (was, std::mem::take(&mut inner.streams))
        };
        // Exactly one protocol-level farewell comes from the wrapper; the
        // sub-streams close quietly.
        for stream in &streams {
            Box::pin(stream.close_quiet()).await;
        }
        self.events.emit(StreamEvent::StateChanged(StreamState::Closed));
        if was == StreamState::LocalPending {
            if let Some(iq) = crate::si::build_si_decline(&self.info, &self.self_jid, error) {
                if let Err(e) = self.transport.send_stanza(Stanza::Iq(iq)).await {
                    warn!(sid = %self.info.stream_id, error = %e, "failed to send decline");
                }
            }
        }
        debug!(sid = %self.info.stream_id, peer = %self.info.peer_jid, "fallback wrapper closed");
    }
}

impl std::fmt::Debug for MultipleBytestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipleBytestream")
            .field("peer", &self.info.peer_jid)
            .field("sid", &self.info.stream_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ibb::IbbBytestream;
    use crate::identity::HandleMap;
    use crate::stanza::{Iq, IqPayload};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque as StdVecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Replies to `send_iq` from a script: `true` is a success result,
    /// `false` an error reply.
    struct ScriptedTransport {
        sent: StdMutex<Vec<Stanza>>,
        replies: StdMutex<StdVecDeque<bool>>,
    }

    impl ScriptedTransport {
        fn new(replies: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                replies: StdMutex::new(replies.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl StanzaTransport for ScriptedTransport {
        async fn send_stanza(&self, stanza: Stanza) -> Result<()> {
            self.sent.lock().unwrap().push(stanza);
            Ok(())
        }

        async fn send_iq(&self, iq: Iq) -> Result<Iq> {
            let ok = self.replies.lock().unwrap().pop_front().unwrap_or(false);
            let me = Jid::new("peer@example.com/r");
            let reply = if ok {
                Iq::result_of(&iq, &me, IqPayload::Empty)
            } else {
                Iq::error_of(&iq, &me, StanzaError::item_not_found("refused"))
            };
            self.sent.lock().unwrap().push(Stanza::Iq(iq));
            Ok(reply)
        }
    }

    fn stream_info(handles: &HandleMap) -> StreamInfo {
        let peer = Jid::new("peer@example.com/r");
        StreamInfo {
            peer_handle: handles.ensure(&peer),
            peer_jid: peer,
            stream_id: "multi-sid".to_owned(),
            stream_init_id: None,
        }
    }

    async fn make_wrapper(
        transport: Arc<ScriptedTransport>,
        candidates: usize,
    ) -> Arc<MultipleBytestream> {
        let handles = HandleMap::new();
        let info = stream_info(&handles);
        let me = Jid::new("me@example.com/here");
        let wrapper =
            MultipleBytestream::new(info.clone(), me.clone(), StreamState::Initiating, transport.clone());
        for _ in 0..candidates {
            let sub = IbbBytestream::new(
                info.clone(),
                me.clone(),
                StreamState::Initiating,
                transport.clone(),
            );
            wrapper.push(Bytestream::Ibb(sub)).await;
        }
        wrapper
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Option<StreamEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn first_failure_promotes_second_candidate() {
        // First in-band open refused, second accepted.
        let transport = ScriptedTransport::new(&[false, true]);
        let wrapper = make_wrapper(transport.clone(), 2).await;
        let mut events = wrapper.take_events().expect("events");

        assert!(wrapper.initiate().await);

        // The wrapper must come up Open on the promoted candidate, with
        // no Closed in between.
        loop {
            match next_event(&mut events).await {
                Some(StreamEvent::StateChanged(StreamState::Open)) => break,
                Some(StreamEvent::StateChanged(StreamState::Closed)) => {
                    panic!("failed candidate's closure leaked through the wrapper")
                }
                Some(_) => continue,
                None => panic!("wrapper never opened"),
            }
        }
        assert_eq!(wrapper.candidate_count().await, 1);
        assert_eq!(wrapper.state().await, StreamState::Open);
    }

    #[tokio::test]
    async fn exhausting_all_candidates_closes_wrapper_once() {
        let transport = ScriptedTransport::new(&[false, false, false]);
        let wrapper = make_wrapper(transport.clone(), 3).await;
        let mut events = wrapper.take_events().expect("events");

        assert!(wrapper.initiate().await);

        let mut connection_errors = 0;
        let mut closes = 0;
        while let Some(event) = next_event(&mut events).await {
            match event {
                StreamEvent::ConnectionError => connection_errors += 1,
                StreamEvent::StateChanged(StreamState::Closed) => closes += 1,
                _ => {}
            }
        }
        assert_eq!(closes, 1, "exactly one Closed after the last candidate");
        assert_eq!(connection_errors, 1, "one terminal connection error");
        assert_eq!(wrapper.state().await, StreamState::Closed);
        assert_eq!(wrapper.candidate_count().await, 0);
    }

    #[tokio::test]
    async fn initiate_without_candidates_returns_false() {
        let transport = ScriptedTransport::new(&[]);
        let handles = HandleMap::new();
        let wrapper = MultipleBytestream::new(
            stream_info(&handles),
            Jid::new("me@example.com/here"),
            StreamState::Initiating,
            transport,
        );
        assert!(!wrapper.initiate().await);
        assert_eq!(wrapper.state().await, StreamState::Initiating);
    }

    #[tokio::test]
    async fn initiate_in_wrong_state_returns_false() {
        let transport = ScriptedTransport::new(&[true]);
        let wrapper = make_wrapper(transport, 1).await;
        wrapper.close(None).await;
        assert!(!wrapper.initiate().await);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_quiet_for_candidates() {
        let transport = ScriptedTransport::new(&[]);
        let wrapper = make_wrapper(transport.clone(), 2).await;
        let mut events = wrapper.take_events().expect("events");

        wrapper.close(None).await;
        wrapper.close(None).await;

        assert_eq!(
            next_event(&mut events).await,
            Some(StreamEvent::StateChanged(StreamState::Closed))
        );
        assert!(events.try_recv().is_err(), "single Closed event");
        // Candidates were in Initiating, so a quiet close sends nothing.
        tokio::task::yield_now().await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
