//! # Bytestream Factory
//!
//! The factory owns the four `(peer, stream-id)` → bytestream registries
//! (one per transport kind), routes inbound IQ and message traffic to the
//! matching live stream, creates streams from inbound SI requests and
//! outbound negotiations, and maintains the SOCKS5 proxy cache used to
//! enrich outbound streamhost offers.
//!
//! ## Ownership
//!
//! The registries are exclusively owned here; nothing else inserts or
//! removes entries. Closure is handled two ways: paths that run through
//! the factory remove the key directly, and closures raised inside
//! transport tasks leave a `Closed` tombstone that `purge_closed` sweeps
//! on the next inbound dispatch.
//!
//! ## Error policy
//!
//! Malformed or unsolicited IQs are answered with `bad-request` or
//! `item-not-found` and otherwise ignored; messages never get error
//! replies, they are dropped with a debug log. Nothing on this path can
//! take the connection down.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bytestream::{
    generate_stream_id, Bytestream, BytestreamKey, StreamInfo, StreamRole, StreamState,
};
use crate::ibb::IbbBytestream;
use crate::identity::{HandleMap, Jid};
use crate::muc::MucBytestream;
use crate::multiple::MultipleBytestream;
use crate::proxy::{ProxyCache, ProxyCacheStats, Socks5Proxy, PROXY_FLOOR};
use crate::si::{self, IncomingStream};
use crate::socks5::Socks5Bytestream;
use crate::stanza::{
    ns, Iq, IqPayload, IqType, MessagePayload, MessageStanza, ProfileBody, Socks5Payload, Stanza,
    StanzaError, Streamhost,
};
use crate::transport::StanzaTransport;

/// Buffered incoming-stream notifications awaiting the consumer.
const INCOMING_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct FactoryConfig {
    /// Host advertised for our own listening streamhost candidates.
    pub listen_host: String,
    /// Well-known service to ask for potential proxies via disco#items.
    pub proxy_discovery_service: Option<Jid>,
    /// Keep querying proxies until this many are known.
    pub proxy_floor: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_owned(),
            proxy_discovery_service: None,
            proxy_floor: PROXY_FLOOR,
        }
    }
}

#[derive(Default)]
struct Registries {
    socks5: HashMap<BytestreamKey, Arc<Socks5Bytestream>>,
    ibb: HashMap<BytestreamKey, Arc<IbbBytestream>>,
    muc: HashMap<BytestreamKey, Arc<MucBytestream>>,
    multiple: HashMap<BytestreamKey, Arc<MultipleBytestream>>,
}

impl Registries {
    fn contains(&self, key: &BytestreamKey) -> bool {
        self.socks5.contains_key(key)
            || self.ibb.contains_key(key)
            || self.muc.contains_key(key)
            || self.multiple.contains_key(key)
    }

    fn remove(&mut self, key: &BytestreamKey) {
        self.socks5.remove(key);
        self.ibb.remove(key);
        self.muc.remove(key);
        self.multiple.remove(key);
    }

    fn drain_all(&mut self) -> Vec<Bytestream> {
        let mut all: Vec<Bytestream> = Vec::new();
        all.extend(self.multiple.drain().map(|(_, s)| Bytestream::Multiple(s)));
        all.extend(self.socks5.drain().map(|(_, s)| Bytestream::Socks5(s)));
        all.extend(self.ibb.drain().map(|(_, s)| Bytestream::Ibb(s)));
        all.extend(self.muc.drain().map(|(_, s)| Bytestream::Muc(s)));
        all
    }
}

#[derive(Clone, Debug)]
pub struct FactoryStats {
    pub socks5_streams: usize,
    pub ibb_streams: usize,
    pub muc_streams: usize,
    pub multiple_streams: usize,
    pub proxies: ProxyCacheStats,
}

pub struct BytestreamFactory {
    self_jid: Jid,
    config: FactoryConfig,
    transport: Arc<dyn StanzaTransport>,
    handles: Arc<HandleMap>,
    registries: Mutex<Registries>,
    proxies: Mutex<ProxyCache>,
    incoming_tx: mpsc::Sender<IncomingStream>,
    incoming_rx: std::sync::Mutex<Option<mpsc::Receiver<IncomingStream>>>,
}

impl BytestreamFactory {
    pub fn new(
        transport: Arc<dyn StanzaTransport>,
        self_jid: Jid,
        config: FactoryConfig,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let proxy_floor = config.proxy_floor;
        Arc::new(Self {
            self_jid,
            config,
            transport,
            handles: Arc::new(HandleMap::new()),
            registries: Mutex::new(Registries::default()),
            proxies: Mutex::new(ProxyCache::new(proxy_floor)),
            incoming_tx,
            incoming_rx: std::sync::Mutex::new(Some(incoming_rx)),
        })
    }

    pub fn handles(&self) -> &Arc<HandleMap> {
        &self.handles
    }

    /// Take the incoming-stream receiver; yields `Some` exactly once.
    pub fn incoming_streams(&self) -> Option<mpsc::Receiver<IncomingStream>> {
        self.incoming_rx.lock().expect("receiver slot poisoned").take()
    }

    pub fn generate_stream_id(&self) -> String {
        generate_stream_id()
    }

    pub async fn stats(&self) -> FactoryStats {
        let registries = self.registries.lock().await;
        FactoryStats {
            socks5_streams: registries.socks5.len(),
            ibb_streams: registries.ibb.len(),
            muc_streams: registries.muc.len(),
            multiple_streams: registries.multiple.len(),
            proxies: self.proxies.lock().await.stats(),
        }
    }

    // ------------------------------------------------------------------
    // Stream creation
    // ------------------------------------------------------------------

    fn stream_info(&self, peer: &Jid, stream_id: &str, stream_init_id: Option<String>) -> StreamInfo {
        StreamInfo {
            peer_handle: self.handles.ensure(peer),
            peer_jid: peer.clone(),
            stream_id: stream_id.to_owned(),
            stream_init_id,
        }
    }

    async fn make_stream(
        &self,
        method: &str,
        info: StreamInfo,
        initial: StreamState,
        role: StreamRole,
    ) -> Option<Bytestream> {
        match method {
            ns::BYTESTREAMS => {
                let proxies: Vec<Streamhost> = self
                    .proxies
                    .lock()
                    .await
                    .proxies_for_offer()
                    .iter()
                    .map(Streamhost::from)
                    .collect();
                Some(Bytestream::Socks5(Socks5Bytestream::new(
                    info,
                    self.self_jid.clone(),
                    role,
                    initial,
                    self.config.listen_host.clone(),
                    proxies,
                    self.transport.clone(),
                )))
            }
            ns::IBB => Some(Bytestream::Ibb(IbbBytestream::new(
                info,
                self.self_jid.clone(),
                initial,
                self.transport.clone(),
            ))),
            ns::MUC_BYTESTREAM => Some(Bytestream::Muc(MucBytestream::new(
                info,
                self.self_jid.clone(),
                initial,
                Arc::new(HandleMap::new()),
                self.transport.clone(),
            ))),
            _ => None,
        }
    }

    async fn register(&self, stream: &Bytestream) {
        let key = stream.key();
        let mut registries = self.registries.lock().await;
        match stream {
            Bytestream::Socks5(s) => {
                registries.socks5.insert(key, s.clone());
            }
            Bytestream::Ibb(s) => {
                registries.ibb.insert(key, s.clone());
            }
            Bytestream::Muc(s) => {
                registries.muc.insert(key, s.clone());
            }
            Bytestream::Multiple(s) => {
                registries.multiple.insert(key, s.clone());
            }
        }
    }

    /// Create and register a bytestream directly, outside SI negotiation.
    /// `Initiator` role starts in `Initiating`, `Target` in
    /// `LocalPending`. Fails on a registry key collision rather than
    /// disturbing the existing stream.
    pub async fn create_bytestream(
        &self,
        peer: &Jid,
        stream_id: &str,
        method: &str,
        role: StreamRole,
    ) -> Result<Bytestream> {
        let key = BytestreamKey::new(peer.clone(), stream_id);
        if self.registries.lock().await.contains(&key) {
            bail!("stream id {} already in use for {}", stream_id, peer);
        }
        let initial = match role {
            StreamRole::Initiator => StreamState::Initiating,
            StreamRole::Target => StreamState::LocalPending,
        };
        let info = self.stream_info(peer, stream_id, None);
        let stream = self
            .make_stream(method, info, initial, role)
            .await
            .with_context(|| format!("unsupported stream method {}", method))?;
        self.register(&stream).await;
        debug!(peer = %peer, sid = %stream_id, method, "bytestream created");
        Ok(stream)
    }

    /// Create a groupchat pseudo-bytestream bound to a room, with the
    /// room layer's member resolver attached.
    pub async fn create_muc_bytestream(
        &self,
        room: &Jid,
        stream_id: &str,
        members: Arc<HandleMap>,
    ) -> Result<Bytestream> {
        let key = BytestreamKey::new(room.clone(), stream_id);
        if self.registries.lock().await.contains(&key) {
            bail!("stream id {} already in use for {}", stream_id, room);
        }
        let info = self.stream_info(room, stream_id, None);
        let stream = Bytestream::Muc(MucBytestream::new(
            info,
            self.self_jid.clone(),
            StreamState::Open,
            members,
            self.transport.clone(),
        ));
        self.register(&stream).await;
        debug!(room = %room, sid = %stream_id, "groupchat bytestream created");
        Ok(stream)
    }

    // ------------------------------------------------------------------
    // Outbound negotiation
    // ------------------------------------------------------------------

    /// Offer a stream to `peer` and drive the negotiation to a terminal
    /// outcome: a live initiating bytestream, or an error (declined, no
    /// mutually supported method, initiation failure). Dropping the
    /// returned future abandons the negotiation; a late reply is
    /// discarded.
    pub async fn negotiate_stream(
        self: &Arc<Self>,
        peer: &Jid,
        profile: &str,
        body: Option<ProfileBody>,
        mime_type: Option<String>,
    ) -> Result<Bytestream> {
        let stream_id = generate_stream_id();
        let offer = si::build_si_offer(&self.self_jid, peer, &stream_id, profile, mime_type, body);
        debug!(peer = %peer, sid = %stream_id, profile, "offering stream");

        let reply = self
            .transport
            .send_iq(offer)
            .await
            .context("stream initiation request failed")?;
        if reply.is_error() {
            let detail = reply
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error detail".to_owned());
            bail!("stream initiation declined: {}", detail);
        }

        let accepted = si::parse_si_reply(&reply);
        let usable = si::supported_subset(&accepted);
        if usable.is_empty() {
            bail!("peer accepted no usable stream method");
        }

        let info = self.stream_info(peer, &stream_id, None);
        let multiple_reply = matches!(
            &reply.payload,
            IqPayload::Si(si) if si.multiple.as_ref().is_some_and(|m| !m.is_empty())
        );

        let stream = if multiple_reply {
            let wrapper = MultipleBytestream::new(
                info.clone(),
                self.self_jid.clone(),
                StreamState::Initiating,
                self.transport.clone(),
            );
            for method in &usable {
                if let Some(sub) = self
                    .make_stream(method, info.clone(), StreamState::Initiating, StreamRole::Initiator)
                    .await
                {
                    self.register(&sub).await;
                    wrapper.push(sub).await;
                }
            }
            let stream = Bytestream::Multiple(wrapper);
            self.register(&stream).await;
            stream
        } else {
            let stream = self
                .make_stream(&usable[0], info, StreamState::Initiating, StreamRole::Initiator)
                .await
                .context("unsupported stream method in reply")?;
            self.register(&stream).await;
            stream
        };

        if !stream.initiate().await {
            warn!(peer = %peer, sid = %stream_id, "negotiated stream failed to initiate");
            stream.close_quiet().await;
            self.registries.lock().await.remove(&stream.key());
            bail!("negotiated stream failed to initiate");
        }
        info!(peer = %peer, sid = %stream_id, method = stream.protocol(), "stream accepted");
        Ok(stream)
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Route an inbound IQ. Returns true when the stanza belonged to this
    /// layer (even if the outcome was an error reply), false when another
    /// handler should see it.
    pub async fn handle_iq(self: &Arc<Self>, iq: Iq) -> bool {
        self.purge_closed().await;
        match (&iq.iq_type, &iq.payload) {
            (IqType::Set, IqPayload::Si(_)) => {
                self.handle_si_request(iq).await;
                true
            }
            (IqType::Set, IqPayload::Socks5(Socks5Payload::Query { .. })) => {
                self.handle_socks5_query(iq).await;
                true
            }
            (IqType::Set, IqPayload::IbbOpen(_)) => {
                self.handle_ibb_open(iq).await;
                true
            }
            (IqType::Set, IqPayload::IbbData(_)) => {
                self.handle_ibb_data(iq).await;
                true
            }
            (IqType::Set, IqPayload::IbbClose { .. }) => {
                self.handle_ibb_close(iq).await;
                true
            }
            _ => false,
        }
    }

    /// Route an inbound message. Messages never receive error replies:
    /// anything unroutable is dropped with a log line.
    pub async fn handle_message(self: &Arc<Self>, message: MessageStanza) -> bool {
        self.purge_closed().await;
        match &message.payload {
            MessagePayload::IbbData(chunk) => {
                let Some(from) = message.from.clone() else {
                    debug!("dropping in-band data message without sender");
                    return true;
                };
                let key = BytestreamKey::new(from, chunk.sid.clone());
                let stream = self.registries.lock().await.ibb.get(&key).cloned();
                match stream {
                    Some(stream) => {
                        if let Err(e) = stream.handle_data(chunk).await {
                            debug!(sid = %chunk.sid, error = %e, "dropping bad in-band message chunk");
                        }
                    }
                    None => {
                        debug!(sid = %chunk.sid, "dropping in-band message for unknown stream");
                    }
                }
                true
            }
            MessagePayload::MucData { chunk, .. } => {
                let Some(from) = message.from.clone() else {
                    debug!("dropping groupchat data message without sender");
                    return true;
                };
                // The room identifier is the sender address minus the
                // nickname resource.
                let room = from.to_bare();
                let key = BytestreamKey::new(room, chunk.sid.clone());
                let stream = self.registries.lock().await.muc.get(&key).cloned();
                match stream {
                    Some(stream) => stream.handle_data(&from, chunk).await,
                    None => {
                        debug!(sid = %chunk.sid, "dropping groupchat data for unknown stream");
                    }
                }
                true
            }
        }
    }

    async fn handle_si_request(self: &Arc<Self>, iq: Iq) {
        let request = match si::parse_si_request(&iq) {
            Ok(request) => request,
            Err(error) => {
                debug!(error = %error, "rejecting malformed stream initiation");
                self.reply_error(&iq, error).await;
                return;
            }
        };

        let key = BytestreamKey::new(request.peer.clone(), request.stream_id.clone());
        if self.registries.lock().await.contains(&key) {
            warn!(peer = %request.peer, sid = %request.stream_id, "stream id collision");
            self.reply_error(&iq, StanzaError::bad_request("stream id already in use"))
                .await;
            return;
        }

        let info = self.stream_info(
            &request.peer,
            &request.stream_id,
            Some(request.iq_id.clone()),
        );

        let stream = if request.multiple {
            let usable = si::supported_subset(&request.methods);
            if usable.is_empty() {
                self.reply_error(&iq, StanzaError::no_valid_streams()).await;
                return;
            }
            let wrapper = MultipleBytestream::new(
                info.clone(),
                self.self_jid.clone(),
                StreamState::LocalPending,
                self.transport.clone(),
            );
            for method in &usable {
                if let Some(sub) = self
                    .make_stream(method, info.clone(), StreamState::LocalPending, StreamRole::Target)
                    .await
                {
                    self.register(&sub).await;
                    wrapper.push(sub).await;
                }
            }
            let stream = Bytestream::Multiple(wrapper);
            self.register(&stream).await;
            stream
        } else {
            let Some(method) = si::select_method(&request.methods) else {
                self.reply_error(&iq, StanzaError::no_valid_streams()).await;
                return;
            };
            let stream = match self
                .make_stream(method, info, StreamState::LocalPending, StreamRole::Target)
                .await
            {
                Some(stream) => stream,
                None => {
                    self.reply_error(&iq, StanzaError::no_valid_streams()).await;
                    return;
                }
            };
            self.register(&stream).await;
            stream
        };

        info!(
            peer = %request.peer,
            sid = %request.stream_id,
            method = stream.protocol(),
            profile = %request.profile,
            "inbound stream offer"
        );

        match si::dispatch_profile(&request, stream.clone()) {
            Ok(incoming) => {
                if self.incoming_tx.send(incoming).await.is_err() {
                    warn!(sid = %request.stream_id, "no consumer for incoming stream, declining");
                    stream.close(None).await;
                    self.registries.lock().await.remove(&key);
                }
            }
            Err(error) => {
                debug!(sid = %request.stream_id, error = %error, "profile dispatch failed");
                stream.close(Some(error)).await;
                self.registries.lock().await.remove(&key);
            }
        }
    }

    async fn handle_socks5_query(self: &Arc<Self>, iq: Iq) {
        let (sid, hosts) = match &iq.payload {
            IqPayload::Socks5(Socks5Payload::Query { sid, streamhosts, .. }) => {
                (sid.clone(), streamhosts.clone())
            }
            _ => return,
        };
        let Some(from) = iq.from.clone() else {
            self.reply_error(&iq, StanzaError::bad_request("streamhost offer without sender"))
                .await;
            return;
        };
        let key = BytestreamKey::new(from, sid.clone());
        let stream = self.registries.lock().await.socks5.get(&key).cloned();
        match stream {
            Some(stream) => stream.handle_offer(iq, hosts).await,
            None => {
                debug!(sid = %sid, "streamhost offer for unknown stream");
                self.reply_error(&iq, StanzaError::item_not_found("no such stream"))
                    .await;
            }
        }
    }

    async fn handle_ibb_open(self: &Arc<Self>, iq: Iq) {
        let IqPayload::IbbOpen(open) = &iq.payload else {
            return;
        };
        let Some(from) = iq.from.clone() else {
            self.reply_error(&iq, StanzaError::bad_request("open without sender"))
                .await;
            return;
        };
        let key = BytestreamKey::new(from, open.sid.clone());
        let stream = self.registries.lock().await.ibb.get(&key).cloned();
        match stream {
            Some(stream) => match stream.handle_open(open).await {
                Ok(()) => self.reply_result(&iq).await,
                Err(error) => self.reply_error(&iq, error).await,
            },
            None => {
                debug!(sid = %open.sid, "in-band open for unknown stream");
                self.reply_error(&iq, StanzaError::item_not_found("no such stream"))
                    .await;
            }
        }
    }

    async fn handle_ibb_data(self: &Arc<Self>, iq: Iq) {
        let IqPayload::IbbData(chunk) = &iq.payload else {
            return;
        };
        let Some(from) = iq.from.clone() else {
            self.reply_error(&iq, StanzaError::bad_request("data without sender"))
                .await;
            return;
        };
        let key = BytestreamKey::new(from, chunk.sid.clone());
        let stream = self.registries.lock().await.ibb.get(&key).cloned();
        match stream {
            Some(stream) => match stream.handle_data(chunk).await {
                Ok(()) => self.reply_result(&iq).await,
                Err(error) => self.reply_error(&iq, error).await,
            },
            None => {
                debug!(sid = %chunk.sid, "in-band data for unknown stream");
                self.reply_error(&iq, StanzaError::item_not_found("no such stream"))
                    .await;
            }
        }
    }

    async fn handle_ibb_close(self: &Arc<Self>, iq: Iq) {
        let IqPayload::IbbClose { sid } = &iq.payload else {
            return;
        };
        let Some(from) = iq.from.clone() else {
            self.reply_error(&iq, StanzaError::bad_request("close without sender"))
                .await;
            return;
        };
        let key = BytestreamKey::new(from, sid.clone());
        let stream = self.registries.lock().await.ibb.get(&key).cloned();
        match stream {
            Some(stream) => {
                stream.handle_close().await;
                self.reply_result(&iq).await;
                self.registries.lock().await.ibb.remove(&key);
            }
            None => {
                debug!(sid = %sid, "in-band close for unknown stream");
                self.reply_error(&iq, StanzaError::item_not_found("no such stream"))
                    .await;
            }
        }
    }

    async fn reply_result(&self, request: &Iq) {
        let reply = Iq::result_of(request, &self.self_jid, IqPayload::Empty);
        if let Err(e) = self.transport.send_stanza(Stanza::Iq(reply)).await {
            warn!(error = %e, "failed to send result reply");
        }
    }

    async fn reply_error(&self, request: &Iq, error: StanzaError) {
        let reply = Iq::error_of(request, &self.self_jid, error);
        if let Err(e) = self.transport.send_stanza(Stanza::Iq(reply)).await {
            warn!(error = %e, "failed to send error reply");
        }
    }

    /// Sweep `Closed` tombstones left by transport-task closures.
    ///
    /// Removal is per-kind: a fallback wrapper and its sub-streams share
    /// one key across several maps, and purging a dead candidate must not
    /// take its live siblings with it.
    async fn purge_closed(&self) {
        let (socks5, ibb, muc, multiple) = {
            let registries = self.registries.lock().await;
            (
                registries
                    .socks5
                    .iter()
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect::<Vec<_>>(),
                registries
                    .ibb
                    .iter()
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect::<Vec<_>>(),
                registries
                    .muc
                    .iter()
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect::<Vec<_>>(),
                registries
                    .multiple
                    .iter()
                    .map(|(k, s)| (k.clone(), s.clone()))
                    .collect::<Vec<_>>(),
            )
        };
        let mut dead_socks5 = Vec::new();
        let mut dead_ibb = Vec::new();
        let mut dead_muc = Vec::new();
        let mut dead_multiple = Vec::new();
        for (key, stream) in &socks5 {
            if stream.state().await == StreamState::Closed {
                dead_socks5.push(key.clone());
            }
        }
        for (key, stream) in &ibb {
            if stream.state().await == StreamState::Closed {
                dead_ibb.push(key.clone());
            }
        }
        for (key, stream) in &muc {
            if stream.state().await == StreamState::Closed {
                dead_muc.push(key.clone());
            }
        }
        for (key, stream) in &multiple {
            if stream.state().await == StreamState::Closed {
                dead_multiple.push(key.clone());
            }
        }
        if dead_socks5.is_empty()
            && dead_ibb.is_empty()
            && dead_muc.is_empty()
            && dead_multiple.is_empty()
        {
            return;
        }
        let mut registries = self.registries.lock().await;
        for key in dead_socks5 {
            debug!(peer = %key.peer, sid = %key.stream_id, "purging closed SOCKS5 stream");
            registries.socks5.remove(&key);
        }
        for key in dead_ibb {
            debug!(peer = %key.peer, sid = %key.stream_id, "purging closed in-band stream");
            registries.ibb.remove(&key);
        }
        for key in dead_muc {
            debug!(peer = %key.peer, sid = %key.stream_id, "purging closed groupchat stream");
            registries.muc.remove(&key);
        }
        for key in dead_multiple {
            debug!(peer = %key.peer, sid = %key.stream_id, "purging closed fallback wrapper");
            registries.multiple.remove(&key);
        }
    }

    // ------------------------------------------------------------------
    // Proxy discovery
    // ------------------------------------------------------------------

    pub async fn add_fallback_proxy(&self, proxy: Socks5Proxy) {
        self.proxies.lock().await.add_fallback(proxy);
    }

    /// Proxies worth advertising in an outbound streamhost offer.
    pub async fn get_socks5_proxies(&self) -> Vec<Socks5Proxy> {
        self.proxies.lock().await.proxies_for_offer()
    }

    /// Top up the proxy cache: refresh the potential list when empty or
    /// expired, then query enough candidates to reach the floor (or one
    /// keep-warm query once it is met).
    pub async fn query_socks5_proxies(self: &Arc<Self>) {
        if self.proxies.lock().await.needs_refresh() {
            self.refresh_potential_proxies().await;
        }
        let wanted = self.proxies.lock().await.wanted_queries();
        for _ in 0..wanted {
            let this = self.clone();
            tokio::spawn(async move {
                this.proxy_query_round().await;
            });
        }
    }

    async fn refresh_potential_proxies(&self) {
        let Some(service) = self.config.proxy_discovery_service.clone() else {
            return;
        };
        let query = Iq {
            id: format!("disco{}", generate_stream_id()),
            from: Some(self.self_jid.clone()),
            to: service.clone(),
            iq_type: IqType::Get,
            payload: IqPayload::DiscoItemsQuery,
        };
        match self.transport.send_iq(query).await {
            Ok(reply) if !reply.is_error() => {
                if let IqPayload::DiscoItems { items } = reply.payload {
                    info!(service = %service, candidates = items.len(), "potential proxy list refreshed");
                    self.proxies.lock().await.replace_potential(items);
                }
            }
            Ok(reply) => {
                debug!(service = %service, error = ?reply.error(), "proxy discovery refused");
            }
            Err(e) => {
                debug!(service = %service, error = %e, "proxy discovery failed");
            }
        }
    }

    /// Query one candidate; on failure, strike it and immediately try a
    /// replacement, until a query succeeds or the list runs dry.
    async fn proxy_query_round(self: &Arc<Self>) {
        loop {
            let candidate = self.proxies.lock().await.next_potential();
            let Some(jid) = candidate else {
                return;
            };
            let query = Iq {
                id: format!("s5p{}", generate_stream_id()),
                from: Some(self.self_jid.clone()),
                to: jid.clone(),
                iq_type: IqType::Get,
                payload: IqPayload::Socks5(Socks5Payload::Query {
                    sid: String::new(),
                    mode: None,
                    streamhosts: Vec::new(),
                }),
            };
            match self.transport.send_iq(query).await {
                Ok(reply) if !reply.is_error() => {
                    if let IqPayload::Socks5(Socks5Payload::Query { streamhosts, .. }) =
                        &reply.payload
                    {
                        if let Some(host) = streamhosts.first() {
                            self.proxies.lock().await.note_discovered(Socks5Proxy {
                                jid: host.jid.clone(),
                                host: host.host.clone(),
                                port: host.port,
                            });
                            return;
                        }
                    }
                    debug!(proxy = %jid, "proxy reply without streamhost, striking");
                    self.proxies.lock().await.strike(&jid);
                }
                _ => {
                    debug!(proxy = %jid, "proxy query failed, striking and retrying next");
                    self.proxies.lock().await.strike(&jid);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Orderly teardown: every live stream closes with a "disconnected"
    /// error, resolving anything still pending.
    pub async fn shutdown(&self) {
        info!("shutting down bytestream factory");
        let streams = self.registries.lock().await.drain_all();
        for stream in streams {
            stream.close(Some(StanzaError::disconnected())).await;
        }
    }
}

impl std::fmt::Debug for BytestreamFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytestreamFactory")
            .field("self_jid", &self.self_jid)
            .finish_non_exhaustive()
    }
}
