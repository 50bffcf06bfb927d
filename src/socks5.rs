//! # SOCKS5 Bytestream (XEP-0065)
//!
//! The out-of-band TCP transport. Negotiation happens over IQs (candidate
//! streamhosts, then a `streamhost-used` acknowledgement); the data path is
//! a raw TCP socket opened through a SOCKS5-style handshake whose
//! "destination domain" is the SHA-1 of `stream_id + initiator_jid +
//! target_jid`, rendered as 40 lowercase hex characters.
//!
//! ## Roles
//!
//! - **Initiator** (we offered the stream): opens a listening socket,
//!   advertises it (plus any known proxies) in a streamhost query, serves
//!   the SOCKS5 handshake, and holds inbound reads until the peer's
//!   `streamhost-used` result confirms which candidate won.
//! - **Target** (the peer offered): walks the advertised candidate list
//!   front-to-back, performing the client handshake against each; a failed
//!   candidate is discarded permanently. Only when every candidate has
//!   failed does a single `item-not-found` error go back on the offer IQ.
//!
//! ## Receive path
//!
//! Handshake bytes accumulate in a growable buffer consumed by
//! [`try_parse_frame`], looped until it reports "need more data". Once
//! connected, byte ranges are forwarded verbatim as `DataReceived` events,
//! with no re-framing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::bytestream::{EventChannel, StateCell, StreamEvent, StreamInfo, StreamRole, StreamState};
use crate::identity::Jid;
use crate::stanza::{ns, Iq, IqPayload, IqType, Socks5Payload, Stanza, StanzaError, Streamhost};
use crate::transport::StanzaTransport;

pub(crate) const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const STATUS_SUCCESS: u8 = 0x00;
const ATYP_DOMAIN: u8 = 0x03;
/// SHA-1 rendered as hex is always 40 bytes on the wire.
const DOMAIN_HEX_LEN: usize = 40;
/// VER CMD RSV ATYP LEN + domain + 2 zero port bytes.
const CONNECT_FRAME_LEN: usize = 5 + DOMAIN_HEX_LEN + 2;

const STREAMHOST_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_QUEUE_CAPACITY: usize = 32;
const READ_CHUNK_SIZE: usize = 4096;

// ============================================================================
// Handshake state machine and frame parsing
// ============================================================================

/// Handshake sub-states. The connecting role walks `TryingConnect →
/// AuthRequestSent → ConnectRequested → Connected`; the listening role
/// walks `AwaitingAuthRequest → AwaitingCommand → Connected`. Any violation
/// lands in `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Socks5State {
    TryingConnect,
    AuthRequestSent,
    ConnectRequested,
    AwaitingAuthRequest,
    AwaitingCommand,
    Connected,
    Error,
}

/// One complete protocol frame consumed from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Server agreed to the no-auth method.
    AuthReply,
    /// Client offered an acceptable method set.
    AuthRequest,
    /// CONNECT succeeded; the echoed domain.
    ConnectReply { domain: String },
    /// CONNECT request naming a domain.
    ConnectRequest { domain: String },
    /// Post-handshake application bytes, delivered verbatim.
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Violation(pub &'static str);

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for Violation {}

/// Try to consume one complete frame from the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; `Ok(Some((consumed, frame)))`
/// consumed exactly `consumed` bytes. Errors are protocol violations and
/// terminal for the handshake. Callers loop until `None` or an empty
/// buffer.
pub(crate) fn try_parse_frame(
    buf: &[u8],
    state: Socks5State,
) -> Result<Option<(usize, Frame)>, Violation> {
    match state {
        Socks5State::AuthRequestSent => {
            if buf.len() < 2 {
                return Ok(None);
            }
            if buf[0] != SOCKS5_VERSION {
                return Err(Violation("bad SOCKS version in auth reply"));
            }
            if buf[1] != METHOD_NONE {
                return Err(Violation("server refused no-auth method"));
            }
            Ok(Some((2, Frame::AuthReply)))
        }
        Socks5State::AwaitingAuthRequest => {
            if buf.len() < 2 {
                return Ok(None);
            }
            if buf[0] != SOCKS5_VERSION {
                return Err(Violation("bad SOCKS version in auth request"));
            }
            let nmethods = buf[1] as usize;
            if buf.len() < 2 + nmethods {
                return Ok(None);
            }
            if !buf[2..2 + nmethods].contains(&METHOD_NONE) {
                return Err(Violation("no acceptable auth method offered"));
            }
            Ok(Some((2 + nmethods, Frame::AuthRequest)))
        }
        Socks5State::ConnectRequested | Socks5State::AwaitingCommand => {
            if buf.len() < CONNECT_FRAME_LEN {
                return Ok(None);
            }
            if buf[0] != SOCKS5_VERSION {
                return Err(Violation("bad SOCKS version in connect frame"));
            }
            let expected = if state == Socks5State::AwaitingCommand {
                CMD_CONNECT
            } else {
                STATUS_SUCCESS
            };
            if buf[1] != expected {
                return Err(Violation("unexpected command/status byte"));
            }
            if buf[3] != ATYP_DOMAIN {
                return Err(Violation("address type is not domain"));
            }
            if buf[4] as usize != DOMAIN_HEX_LEN {
                return Err(Violation("domain length is not 40"));
            }
            let domain = match std::str::from_utf8(&buf[5..5 + DOMAIN_HEX_LEN]) {
                Ok(d) => d.to_owned(),
                Err(_) => return Err(Violation("domain is not valid text")),
            };
            if buf[5 + DOMAIN_HEX_LEN] != 0 || buf[6 + DOMAIN_HEX_LEN] != 0 {
                return Err(Violation("port bytes must be zero"));
            }
            let frame = if state == Socks5State::AwaitingCommand {
                Frame::ConnectRequest { domain }
            } else {
                Frame::ConnectReply { domain }
            };
            Ok(Some((CONNECT_FRAME_LEN, frame)))
        }
        Socks5State::Connected => {
            if buf.is_empty() {
                Ok(None)
            } else {
                Ok(Some((buf.len(), Frame::Data(buf.to_vec()))))
            }
        }
        Socks5State::TryingConnect | Socks5State::Error => {
            Err(Violation("no data expected in this state"))
        }
    }
}

const AUTH_REQUEST: [u8; 3] = [SOCKS5_VERSION, 1, METHOD_NONE];
const AUTH_REPLY: [u8; 2] = [SOCKS5_VERSION, METHOD_NONE];

fn connect_frame(second_byte: u8, domain: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CONNECT_FRAME_LEN);
    frame.extend_from_slice(&[
        SOCKS5_VERSION,
        second_byte,
        0,
        ATYP_DOMAIN,
        DOMAIN_HEX_LEN as u8,
    ]);
    frame.extend_from_slice(domain.as_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame
}

/// The XEP-0065 destination domain: order-sensitive concatenation hashed
/// with SHA-1 and rendered as lowercase hex. Both roles must compute the
/// identical value for the same `(sid, initiator, target)` triple.
pub(crate) fn domain_for(stream_id: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(initiator.as_str().as_bytes());
    hasher.update(target.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Read until one complete frame for `state` is parseable, consuming it
/// from `buf` and leaving any surplus bytes in place.
async fn read_frame<S>(stream: &mut S, buf: &mut Vec<u8>, state: Socks5State) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    loop {
        match try_parse_frame(buf, state).map_err(anyhow::Error::new)? {
            Some((consumed, frame)) => {
                buf.drain(..consumed);
                return Ok(frame);
            }
            None => {
                let mut chunk = [0u8; 256];
                let n = stream.read(&mut chunk).await.context("handshake read")?;
                if n == 0 {
                    bail!("connection closed during handshake");
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Connecting-role handshake. Returns any surplus bytes read past the
/// final frame (delivered later as application data).
async fn client_handshake<S>(stream: &mut S, domain: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&AUTH_REQUEST).await?;
    let mut buf = Vec::new();
    read_frame(stream, &mut buf, Socks5State::AuthRequestSent).await?;
    trace!(domain = %domain, "auth accepted, sending connect request");
    stream.write_all(&connect_frame(CMD_CONNECT, domain)).await?;
    read_frame(stream, &mut buf, Socks5State::ConnectRequested).await?;
    Ok(buf)
}

/// Listening-role handshake. Returns the domain the peer asked for plus
/// any surplus bytes.
async fn server_handshake<S>(stream: &mut S) -> Result<(String, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    read_frame(stream, &mut buf, Socks5State::AwaitingAuthRequest).await?;
    stream.write_all(&AUTH_REPLY).await?;
    let frame = read_frame(stream, &mut buf, Socks5State::AwaitingCommand).await?;
    let Frame::ConnectRequest { domain } = frame else {
        bail!("parser returned unexpected frame for AwaitingCommand");
    };
    trace!(domain = %domain, "connect request accepted");
    stream.write_all(&connect_frame(STATUS_SUCCESS, &domain)).await?;
    Ok((domain, buf))
}

// ============================================================================
// The bytestream
// ============================================================================

struct Socks5Inner {
    state: StateCell,
    /// Remaining connection candidates, consumed front-to-back.
    streamhosts: VecDeque<Streamhost>,
    /// Candidates we advertised (listener role), used to resolve a
    /// `streamhost-used` naming a proxy back to a connectable address.
    advertised: Vec<Streamhost>,
    /// The peer's streamhost offer IQ, answered with `streamhost-used` on
    /// success or a single `item-not-found` on exhaustion.
    pending_offer: Option<Iq>,
    write_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Opens the inbound read path once both sides agree the stream is
    /// live (listener role holds reads until `streamhost-used` arrives).
    read_gate: Option<watch::Sender<bool>>,
    close_on_connection_error: bool,
    write_blocked: bool,
    connecting: bool,
    /// Tasks safe to abort on close (accept loop, negotiation wait, read
    /// loop). The write task is never aborted: dropping `write_tx` lets it
    /// drain buffered data before the socket goes away.
    abortable_tasks: Vec<JoinHandle<()>>,
}

pub struct Socks5Bytestream {
    info: StreamInfo,
    self_jid: Jid,
    role: StreamRole,
    /// Host advertised for our own listening streamhost.
    listen_host: String,
    proxies: Vec<Streamhost>,
    transport: Arc<dyn StanzaTransport>,
    events: EventChannel,
    inner: Mutex<Socks5Inner>,
}

impl Socks5Bytestream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        info: StreamInfo,
        self_jid: Jid,
        role: StreamRole,
        initial: StreamState,
        listen_host: String,
        proxies: Vec<Streamhost>,
        transport: Arc<dyn StanzaTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            self_jid,
            role,
            listen_host,
            proxies,
            transport,
            events: EventChannel::new(),
            inner: Mutex::new(Socks5Inner {
                state: StateCell::new(initial),
                streamhosts: VecDeque::new(),
                advertised: Vec::new(),
                pending_offer: None,
                write_tx: None,
                read_gate: None,
                close_on_connection_error: true,
                write_blocked: false,
                connecting: false,
                abortable_tasks: Vec::new(),
            }),
        })
    }

    pub fn protocol(&self) -> &'static str {
        ns::BYTESTREAMS
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

    /// The handshake domain for this stream, identical on both roles.
    fn domain(&self) -> String {
        match self.role {
            StreamRole::Initiator => domain_for(&self.info.stream_id, &self.self_jid, &self.info.peer_jid),
            StreamRole::Target => domain_for(&self.info.stream_id, &self.info.peer_jid, &self.self_jid),
        }
    }

    pub(crate) async fn set_close_on_connection_error(&self, on: bool) {
        self.inner.lock().await.close_on_connection_error = on;
    }

    // ------------------------------------------------------------------
    // Shared contract operations
    // ------------------------------------------------------------------

    pub async fn accept(&self) {
        let iq = {
            let mut inner = self.inner.lock().await;
            if inner.state.get() != StreamState::LocalPending {
                return;
            }
            if !inner.state.advance(StreamState::Accepted) {
                return;
            }
            crate::si::build_si_accept(&self.info, &self.self_jid, ns::BYTESTREAMS)
        };
        self.events.emit(StreamEvent::StateChanged(StreamState::Accepted));
        if let Some(iq) = iq {
            if let Err(e) = self.transport.send_stanza(Stanza::Iq(iq)).await {
                warn!(sid = %self.info.stream_id, error = %e, "failed to send SI accept");
            }
        }
    }

    /// Transition to `Accepted` without emitting an SI accept; used by the
    /// fallback wrapper, which sends a single multi-method accept itself.
    pub(crate) async fn mark_accepted(&self) {
        let advanced = self.inner.lock().await.state.advance(StreamState::Accepted);
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Accepted));
        }
    }

    pub async fn initiate(self: &Arc<Self>) -> bool {
        match self.role {
            StreamRole::Initiator => self.initiate_listener().await,
            StreamRole::Target => self.initiate_connect().await,
        }
    }

    /// Listener role: bind, advertise candidates, serve the handshake, and
    /// hold reads until the peer names the winning candidate.
    async fn initiate_listener(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.get() != StreamState::Initiating {
            return false;
        }
        let listener = match TcpListener::bind((self.listen_host.as_str(), 0)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(sid = %self.info.stream_id, error = %e, "failed to bind streamhost listener");
                return false;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(sid = %self.info.stream_id, error = %e, "listener has no local address");
                return false;
            }
        };

        let mut hosts = vec![Streamhost {
            jid: self.self_jid.clone(),
            host: self.listen_host.clone(),
            port,
        }];
        hosts.extend(self.proxies.iter().cloned());
        inner.advertised = hosts.clone();

        let (gate_tx, gate_rx) = watch::channel(false);
        inner.read_gate = Some(gate_tx);

        let query = Iq {
            id: format!("s5q{}", crate::bytestream::generate_stream_id()),
            from: Some(self.self_jid.clone()),
            to: self.info.peer_jid.clone(),
            iq_type: IqType::Set,
            payload: IqPayload::Socks5(Socks5Payload::Query {
                sid: self.info.stream_id.clone(),
                mode: Some("tcp".to_owned()),
                streamhosts: hosts,
            }),
        };

        inner
            .abortable_tasks
            .push(tokio::spawn(Self::accept_task(self.clone(), listener, gate_rx)));
        inner
            .abortable_tasks
            .push(tokio::spawn(Self::negotiation_task(self.clone(), query)));
        debug!(sid = %self.info.stream_id, port, "streamhost listener started");
        true
    }

    async fn accept_task(this: Arc<Self>, listener: TcpListener, gate_rx: watch::Receiver<bool>) {
        let accepted = listener.accept().await;
        let (mut stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                debug!(sid = %this.info.stream_id, error = %e, "streamhost accept failed");
                this.connection_failed().await;
                return;
            }
        };
        trace!(sid = %this.info.stream_id, peer_addr = %addr, "streamhost connection accepted");
        match timeout(HANDSHAKE_TIMEOUT, server_handshake(&mut stream)).await {
            Ok(Ok((domain, leftovers))) => {
                trace!(sid = %this.info.stream_id, domain = %domain, "listener handshake complete");
                this.start_io(stream, leftovers, Some(gate_rx)).await;
            }
            Ok(Err(e)) => {
                debug!(sid = %this.info.stream_id, error = %e, "listener handshake failed");
                this.connection_failed().await;
            }
            Err(_) => {
                debug!(sid = %this.info.stream_id, "listener handshake timed out");
                this.connection_failed().await;
            }
        }
    }

    /// Await the reply to our streamhost query. A result naming our own
    /// JID opens the stream; one naming a proxy means the peer connected
    /// there, so we connect out to the same proxy; errors and timeouts are
    /// connection failures.
    async fn negotiation_task(this: Arc<Self>, query: Iq) {
        let reply = this.transport.send_iq(query).await;
        match reply {
            Ok(iq) if !iq.is_error() => match iq.payload {
                IqPayload::Socks5(Socks5Payload::StreamhostUsed { jid }) => {
                    if jid == this.self_jid {
                        debug!(sid = %this.info.stream_id, "peer connected to our streamhost");
                        this.open_and_unblock().await;
                    } else {
                        this.connect_to_used_proxy(jid).await;
                    }
                }
                _ => {
                    warn!(sid = %this.info.stream_id, "streamhost reply without streamhost-used");
                    this.connection_failed().await;
                }
            },
            Ok(iq) => {
                debug!(
                    sid = %this.info.stream_id,
                    error = ?iq.error(),
                    "peer reported streamhost failure"
                );
                this.connection_failed().await;
            }
            Err(e) => {
                debug!(sid = %this.info.stream_id, error = %e, "streamhost query timed out");
                this.connection_failed().await;
            }
        }
    }

    async fn connect_to_used_proxy(self: &Arc<Self>, proxy_jid: Jid) {
        let candidate = {
            let inner = self.inner.lock().await;
            inner.advertised.iter().find(|h| h.jid == proxy_jid).cloned()
        };
        let Some(host) = candidate else {
            warn!(sid = %self.info.stream_id, proxy = %proxy_jid, "streamhost-used names unknown candidate");
            self.connection_failed().await;
            return;
        };
        debug!(sid = %self.info.stream_id, proxy = %proxy_jid, "peer used a proxy, connecting to it");
        match Self::attempt(&host, &self.domain()).await {
            Ok((stream, leftovers)) => {
                self.start_io(stream, leftovers, None).await;
                self.open_and_unblock().await;
            }
            Err(e) => {
                debug!(sid = %self.info.stream_id, error = %e, "proxy connection failed");
                self.connection_failed().await;
            }
        }
    }

    /// Target role: walk the candidate list front-to-back.
    async fn initiate_connect(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.get() != StreamState::Initiating {
            return false;
        }
        if inner.streamhosts.is_empty() {
            return false;
        }
        if inner.connecting {
            return true;
        }
        inner.connecting = true;
        inner
            .abortable_tasks
            .push(tokio::spawn(Self::connect_task(self.clone())));
        true
    }

    async fn connect_task(this: Arc<Self>) {
        let domain = this.domain();
        loop {
            let candidate = {
                let inner = this.inner.lock().await;
                if inner.state.get() == StreamState::Closed {
                    return;
                }
                inner.streamhosts.front().cloned()
            };
            let Some(host) = candidate else {
                this.candidates_exhausted().await;
                return;
            };
            debug!(
                sid = %this.info.stream_id,
                streamhost = %host.jid,
                addr = %format!("{}:{}", host.host, host.port),
                "trying streamhost"
            );
            match Self::attempt(&host, &domain).await {
                Ok((stream, leftovers)) => {
                    let reply = {
                        let mut inner = this.inner.lock().await;
                        inner.pending_offer.take().map(|offer| {
                            Iq::result_of(
                                &offer,
                                &this.self_jid,
                                IqPayload::Socks5(Socks5Payload::StreamhostUsed {
                                    jid: host.jid.clone(),
                                }),
                            )
                        })
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = this.transport.send_stanza(Stanza::Iq(reply)).await {
                            warn!(sid = %this.info.stream_id, error = %e, "failed to send streamhost-used");
                        }
                    }
                    this.start_io(stream, leftovers, None).await;
                    this.open_and_unblock().await;
                    return;
                }
                Err(e) => {
                    // A failed candidate is discarded permanently; the
                    // retry moves on to the new front, silently.
                    debug!(
                        sid = %this.info.stream_id,
                        streamhost = %host.jid,
                        error = %e,
                        "streamhost failed, trying next"
                    );
                    this.inner.lock().await.streamhosts.pop_front();
                }
            }
        }
    }

    async fn attempt(host: &Streamhost, domain: &str) -> Result<(TcpStream, Vec<u8>)> {
        let mut stream = timeout(
            STREAMHOST_CONNECT_TIMEOUT,
            TcpStream::connect((host.host.as_str(), host.port)),
        )
        .await
        .context("connect timed out")?
        .context("connect failed")?;
        let leftovers = timeout(HANDSHAKE_TIMEOUT, client_handshake(&mut stream, domain))
            .await
            .context("handshake timed out")??;
        Ok((stream, leftovers))
    }

    /// Exactly one `item-not-found` error on the pending offer, one
    /// `ConnectionError`, one close.
    async fn candidates_exhausted(self: &Arc<Self>) {
        let offer = self.inner.lock().await.pending_offer.take();
        if let Some(offer) = offer {
            let error = StanzaError::item_not_found("impossible to connect to any streamhost");
            let reply = Iq::error_of(&offer, &self.self_jid, error);
            if let Err(e) = self.transport.send_stanza(Stanza::Iq(reply)).await {
                warn!(sid = %self.info.stream_id, error = %e, "failed to send streamhost error");
            }
        }
        self.connection_failed().await;
    }

    async fn connection_failed(self: &Arc<Self>) {
        self.events.emit(StreamEvent::ConnectionError);
        let send_protocol = self.inner.lock().await.close_on_connection_error;
        self.close_internal(None, send_protocol).await;
    }

    pub async fn send(&self, data: &[u8]) -> bool {
        let tx = {
            let inner = self.inner.lock().await;
            if inner.state.get() != StreamState::Open {
                return false;
            }
            inner.write_tx.clone()
        };
        let Some(tx) = tx else { return false };
        match tx.try_send(data.to_vec()) {
            Ok(()) => {
                if tx.capacity() < WRITE_QUEUE_CAPACITY {
                    self.mark_write_blocked(true).await;
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                // Advisory backpressure only: the caller ignored the
                // blocked signal, so this send queues behind the drain.
                debug!(sid = %self.info.stream_id, "send while write-blocked");
                self.mark_write_blocked(true).await;
                match tx.send(chunk).await {
                    Ok(()) => true,
                    Err(_) => {
                        self.close(None).await;
                        false
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(None).await;
                false
            }
        }
    }

    pub async fn close(&self, error: Option<StanzaError>) {
        self.close_internal(error, true).await;
    }

    /// Close without the protocol-level decline.
    pub(crate) async fn close_quiet(&self) {
        self.close_internal(None, false).await;
    }

    async fn close_internal(&self, error: Option<StanzaError>, send_protocol: bool) {
        let (decline, tasks) = {
            let mut inner = self.inner.lock().await;
            let was = inner.state.get();
            if !inner.state.advance(StreamState::Closed) {
                return;
            }
            let decline = if was == StreamState::LocalPending && send_protocol {
                crate::si::build_si_decline(&self.info, &self.self_jid, error)
            } else {
                None
            };
            // Dropping the sender lets the write task drain buffered data
            // before the socket is released.
            inner.write_tx = None;
            inner.read_gate = None;
            (decline, std::mem::take(&mut inner.abortable_tasks))
        };
        for task in tasks {
            task.abort();
        }
        self.events.emit(StreamEvent::StateChanged(StreamState::Closed));
        if let Some(iq) = decline {
            if let Err(e) = self.transport.send_stanza(Stanza::Iq(iq)).await {
                warn!(sid = %self.info.stream_id, error = %e, "failed to send decline");
            }
        }
        debug!(sid = %self.info.stream_id, peer = %self.info.peer_jid, "SOCKS5 bytestream closed");
    }

    // ------------------------------------------------------------------
    // Inbound negotiation (factory-routed)
    // ------------------------------------------------------------------

    /// The peer's streamhost offer arrived for this stream. Valid once the
    /// stream has been accepted; earlier or later arrivals are answered
    /// with `bad-request`.
    pub(crate) async fn handle_offer(self: &Arc<Self>, iq: Iq, hosts: Vec<Streamhost>) {
        let accepted = {
            let mut inner = self.inner.lock().await;
            match inner.state.get() {
                StreamState::Accepted | StreamState::Initiating => {
                    inner.streamhosts = hosts.into();
                    inner.pending_offer = Some(iq);
                    inner.state.advance(StreamState::Initiating)
                }
                _ => {
                    let state = inner.state.get();
                    drop(inner);
                    warn!(
                        sid = %self.info.stream_id,
                        state = ?state,
                        "streamhost offer in wrong state"
                    );
                    let reply = Iq::error_of(
                        &iq,
                        &self.self_jid,
                        StanzaError::bad_request("stream is not awaiting streamhosts"),
                    );
                    let _ = self.transport.send_stanza(Stanza::Iq(reply)).await;
                    return;
                }
            }
        };
        if accepted {
            self.events
                .emit(StreamEvent::StateChanged(StreamState::Initiating));
        }
        let no_candidates = self.inner.lock().await.streamhosts.is_empty();
        if no_candidates {
            // An offer with nothing to connect to is instant exhaustion.
            self.candidates_exhausted().await;
        } else {
            self.initiate_connect().await;
        }
    }

    // ------------------------------------------------------------------
    // Socket plumbing
    // ------------------------------------------------------------------

    async fn open_and_unblock(self: &Arc<Self>) {
        let advanced = {
            let mut inner = self.inner.lock().await;
            let advanced = inner.state.advance(StreamState::Open);
            if let Some(gate) = &inner.read_gate {
                let _ = gate.send(true);
            }
            advanced
        };
        if advanced {
            self.events.emit(StreamEvent::StateChanged(StreamState::Open));
        }
    }

    /// Install the connected socket: a write task that drains the queue
    /// and a read task that forwards byte ranges verbatim, gated until
    /// both sides agree the stream is live.
    async fn start_io(
        self: &Arc<Self>,
        stream: TcpStream,
        leftovers: Vec<u8>,
        gate: Option<watch::Receiver<bool>>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        {
            let mut inner = self.inner.lock().await;
            if inner.state.get() == StreamState::Closed {
                return;
            }
            inner.write_tx = Some(write_tx);
            let read_task =
                tokio::spawn(Self::read_task(self.clone(), read_half, leftovers, gate));
            inner.abortable_tasks.push(read_task);
        }
        // Deliberately not abortable: must drain on close.
        tokio::spawn(Self::write_task(self.clone(), write_half, write_rx));
    }

    async fn read_task(
        this: Arc<Self>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        leftovers: Vec<u8>,
        gate: Option<watch::Receiver<bool>>,
    ) {
        if let Some(mut gate) = gate {
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    return;
                }
            }
        }
        if !leftovers.is_empty() {
            this.events.emit(StreamEvent::DataReceived {
                sender: this.info.peer_handle,
                data: leftovers,
            });
        }
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => {
                    debug!(sid = %this.info.stream_id, "peer closed the transport");
                    this.close(None).await;
                    return;
                }
                Ok(n) => {
                    this.events.emit(StreamEvent::DataReceived {
                        sender: this.info.peer_handle,
                        data: chunk[..n].to_vec(),
                    });
                }
                Err(e) => {
                    debug!(sid = %this.info.stream_id, error = %e, "transport read error");
                    this.close(None).await;
                    return;
                }
            }
        }
    }

    async fn write_task(
        this: Arc<Self>,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        mut write_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(data) = write_rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                debug!(sid = %this.info.stream_id, error = %e, "transport write error");
                this.close(None).await;
                return;
            }
            // Opportunistically drain queued chunks, then report the
            // buffer empty.
            while let Ok(more) = write_rx.try_recv() {
                if let Err(e) = write_half.write_all(&more).await {
                    debug!(sid = %this.info.stream_id, error = %e, "transport write error");
                    this.close(None).await;
                    return;
                }
            }
            this.mark_write_blocked(false).await;
        }
        // Sender dropped on close: buffered data has drained, release the
        // socket.
        let _ = write_half.shutdown().await;
    }

    async fn mark_write_blocked(&self, blocked: bool) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.write_blocked == blocked {
                false
            } else {
                inner.write_blocked = blocked;
                true
            }
        };
        if changed {
            self.events.emit(StreamEvent::WriteBlocked(blocked));
        }
    }
}

impl std::fmt::Debug for Socks5Bytestream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5Bytestream")
            .field("peer", &self.info.peer_jid)
            .field("sid", &self.info.stream_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_deterministic_and_order_sensitive() {
        let initiator = Jid::new("alice@example.com/a");
        let target = Jid::new("bob@example.com/b");

        let a = domain_for("sid1", &initiator, &target);
        let b = domain_for("sid1", &initiator, &target);
        assert_eq!(a, b, "both roles must derive the same domain");
        assert_eq!(a.len(), DOMAIN_HEX_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let swapped = domain_for("sid1", &target, &initiator);
        assert_ne!(a, swapped, "concatenation order matters");
    }

    #[test]
    fn parse_auth_reply() {
        let state = Socks5State::AuthRequestSent;
        assert_eq!(try_parse_frame(&[5], state), Ok(None), "partial");
        assert_eq!(
            try_parse_frame(&[5, 0], state),
            Ok(Some((2, Frame::AuthReply)))
        );
        assert!(try_parse_frame(&[4, 0], state).is_err(), "bad version");
        assert!(try_parse_frame(&[5, 2], state).is_err(), "auth refused");
    }

    #[test]
    fn parse_auth_request() {
        let state = Socks5State::AwaitingAuthRequest;
        assert_eq!(try_parse_frame(&[5, 2, 1], state), Ok(None), "methods incomplete");
        assert_eq!(
            try_parse_frame(&[5, 2, 1, 0], state),
            Ok(Some((4, Frame::AuthRequest))),
            "no-auth among offered methods"
        );
        assert!(
            try_parse_frame(&[5, 1, 2], state).is_err(),
            "no-auth not offered"
        );
    }

    fn connect_bytes(second: u8, domain: &str) -> Vec<u8> {
        connect_frame(second, domain)
    }

    #[test]
    fn parse_connect_request() {
        let domain = domain_for("s", &Jid::new("a@x"), &Jid::new("b@x"));
        let frame = connect_bytes(CMD_CONNECT, &domain);
        assert_eq!(frame.len(), CONNECT_FRAME_LEN);

        let parsed = try_parse_frame(&frame, Socks5State::AwaitingCommand).unwrap();
        assert_eq!(
            parsed,
            Some((CONNECT_FRAME_LEN, Frame::ConnectRequest { domain: domain.clone() }))
        );

        // Partial frame needs more data.
        assert_eq!(
            try_parse_frame(&frame[..20], Socks5State::AwaitingCommand),
            Ok(None)
        );
    }

    #[test]
    fn parse_connect_rejects_malformed_frames() {
        let domain = domain_for("s", &Jid::new("a@x"), &Jid::new("b@x"));

        let mut bad_len = connect_bytes(CMD_CONNECT, &domain);
        bad_len[4] = 39;
        assert!(try_parse_frame(&bad_len, Socks5State::AwaitingCommand).is_err());

        let mut bad_port = connect_bytes(CMD_CONNECT, &domain);
        bad_port[CONNECT_FRAME_LEN - 1] = 1;
        assert!(try_parse_frame(&bad_port, Socks5State::AwaitingCommand).is_err());

        let mut bad_atyp = connect_bytes(CMD_CONNECT, &domain);
        bad_atyp[3] = 1;
        assert!(try_parse_frame(&bad_atyp, Socks5State::AwaitingCommand).is_err());
    }

    #[test]
    fn parse_connect_reply_wants_success_status() {
        let domain = domain_for("s", &Jid::new("a@x"), &Jid::new("b@x"));
        let ok = connect_bytes(STATUS_SUCCESS, &domain);
        assert!(matches!(
            try_parse_frame(&ok, Socks5State::ConnectRequested),
            Ok(Some((_, Frame::ConnectReply { .. })))
        ));

        let failed = connect_bytes(1, &domain);
        assert!(try_parse_frame(&failed, Socks5State::ConnectRequested).is_err());
    }

    #[test]
    fn no_frames_expected_before_or_after_failure() {
        assert!(try_parse_frame(&[5], Socks5State::TryingConnect).is_err());
        assert!(try_parse_frame(&[5], Socks5State::Error).is_err());
    }

    #[test]
    fn connected_state_passes_bytes_verbatim() {
        let data = [1u8, 2, 3, 4];
        let parsed = try_parse_frame(&data, Socks5State::Connected).unwrap();
        assert_eq!(parsed, Some((4, Frame::Data(data.to_vec()))));
        assert_eq!(try_parse_frame(&[], Socks5State::Connected), Ok(None));
    }

    #[tokio::test]
    async fn handshake_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let domain = domain_for("sid9", &Jid::new("a@x/r"), &Jid::new("b@x/r"));

        let client_domain = domain.clone();
        let client_side =
            tokio::spawn(async move { client_handshake(&mut client, &client_domain).await });
        let server_side = tokio::spawn(async move { server_handshake(&mut server).await });

        let client_leftover = client_side.await.unwrap().expect("client handshake");
        let (seen_domain, server_leftover) = server_side.await.unwrap().expect("server handshake");

        assert_eq!(seen_domain, domain);
        assert!(client_leftover.is_empty());
        assert!(server_leftover.is_empty());
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_version_peer() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let server_side = tokio::spawn(async move { server_handshake(&mut server).await });

        client.write_all(&[4, 1, 0]).await.unwrap();
        assert!(server_side.await.unwrap().is_err());
    }
}
