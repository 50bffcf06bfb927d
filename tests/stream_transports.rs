//! Integration tests for the SOCKS5 transport over real loopback sockets:
//! both negotiation roles, the handshake wire format, candidate
//! exhaustion, and data flow after the stream opens.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test stream_transports -- --nocapture

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use siphon::{
    ns, BytestreamFactory, DataForm, FactoryConfig, FileOffer, IncomingStream, Iq, IqPayload,
    IqType, Jid, ProfileBody, SiPayload, Socks5Payload, Stanza, StanzaTransport, StreamEvent,
    StreamRole, StreamState, Streamhost,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const ME: &str = "me@example.com/siphon";
const PEER: &str = "peer@example.com/client";

/// The XEP-0065 destination domain both sides must derive.
fn socks5_domain(sid: &str, initiator: &str, target: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(target.as_bytes());
    hex::encode(hasher.finalize())
}

/// Speak the listening (streamhost) side of the handshake, checking the
/// domain the connector asks for.
async fn speak_streamhost_server(stream: &mut TcpStream, expected_domain: &str) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.expect("auth header");
    assert_eq!(header[0], 5, "SOCKS version");
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await.expect("auth methods");
    assert!(methods.contains(&0), "no-auth offered");
    stream.write_all(&[5, 0]).await.expect("auth reply");

    let mut frame = [0u8; 47];
    stream.read_exact(&mut frame).await.expect("connect frame");
    assert_eq!(frame[0], 5);
    assert_eq!(frame[1], 1, "CONNECT command");
    assert_eq!(frame[3], 3, "domain address type");
    assert_eq!(frame[4], 40, "domain length");
    let domain = std::str::from_utf8(&frame[5..45]).expect("domain text");
    assert_eq!(domain, expected_domain, "hash domain must match");
    assert_eq!(&frame[45..47], &[0, 0], "port bytes are zero");

    let mut reply = frame;
    reply[1] = 0;
    stream.write_all(&reply).await.expect("connect reply");
}

/// Speak the connecting side of the handshake.
async fn speak_streamhost_client(stream: &mut TcpStream, domain: &str) {
    stream.write_all(&[5, 1, 0]).await.expect("auth request");
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.expect("auth reply");
    assert_eq!(reply, [5, 0]);

    let mut frame = vec![5u8, 1, 0, 3, 40];
    frame.extend_from_slice(domain.as_bytes());
    frame.extend_from_slice(&[0, 0]);
    stream.write_all(&frame).await.expect("connect request");

    let mut connect_reply = [0u8; 47];
    stream
        .read_exact(&mut connect_reply)
        .await
        .expect("connect reply");
    assert_eq!(connect_reply[1], 0, "success status");
}

/// Retry `send` until the write path is installed; the socket plumbing
/// races the Open transition by design.
async fn send_with_retry(stream: &siphon::Bytestream, data: &[u8]) {
    timeout(Duration::from_secs(2), async {
        while !stream.send(data).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("send should eventually succeed");
}

async fn wait_for_state(stream: &siphon::Bytestream, wanted: StreamState) {
    timeout(Duration::from_secs(5), async {
        while stream.state().await != wanted {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stream never reached {:?}", wanted));
}

// ============================================================================
// Recording transport
// ============================================================================

struct RecordingTransport {
    sent: Mutex<Vec<Stanza>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StanzaTransport for RecordingTransport {
    async fn send_stanza(&self, stanza: Stanza) -> Result<()> {
        self.sent.lock().unwrap().push(stanza);
        Ok(())
    }

    async fn send_iq(&self, iq: Iq) -> Result<Iq> {
        let reply = Iq::result_of(&iq, &Jid::new(PEER), IqPayload::Empty);
        self.sent.lock().unwrap().push(Stanza::Iq(iq));
        Ok(reply)
    }
}

/// Transport for the listener-role test: answers the streamhost query by
/// actually connecting to the advertised candidate and completing the
/// handshake, then names it in `streamhost-used`.
struct ConnectingTransport {
    sent: Mutex<Vec<Stanza>>,
    socket: Mutex<Option<TcpStream>>,
    domain: String,
}

impl ConnectingTransport {
    fn new(domain: String) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            socket: Mutex::new(None),
            domain,
        })
    }

    fn take_socket(&self) -> Option<TcpStream> {
        self.socket.lock().unwrap().take()
    }
}

#[async_trait]
impl StanzaTransport for ConnectingTransport {
    async fn send_stanza(&self, stanza: Stanza) -> Result<()> {
        self.sent.lock().unwrap().push(stanza);
        Ok(())
    }

    async fn send_iq(&self, iq: Iq) -> Result<Iq> {
        let reply = match &iq.payload {
            IqPayload::Socks5(Socks5Payload::Query { streamhosts, .. }) => {
                let host = streamhosts.first().expect("at least our own candidate");
                let mut socket = TcpStream::connect((host.host.as_str(), host.port))
                    .await
                    .expect("connect to advertised streamhost");
                speak_streamhost_client(&mut socket, &self.domain).await;
                *self.socket.lock().unwrap() = Some(socket);
                Iq::result_of(
                    &iq,
                    &Jid::new(PEER),
                    IqPayload::Socks5(Socks5Payload::StreamhostUsed {
                        jid: host.jid.clone(),
                    }),
                )
            }
            _ => Iq::result_of(&iq, &Jid::new(PEER), IqPayload::Empty),
        };
        self.sent.lock().unwrap().push(Stanza::Iq(iq));
        Ok(reply)
    }
}

fn si_socks5_offer(sid: &str) -> Iq {
    Iq {
        id: format!("si-{}", sid),
        from: Some(Jid::new(PEER)),
        to: Jid::new(ME),
        iq_type: IqType::Set,
        payload: IqPayload::Si(SiPayload {
            id: Some(sid.to_owned()),
            profile: Some(ns::PROFILE_FILE_TRANSFER.to_owned()),
            mime_type: None,
            feature: Some(DataForm::method_offer(&[ns::BYTESTREAMS])),
            multiple: None,
            body: Some(ProfileBody::File(FileOffer {
                name: "blob.bin".to_owned(),
                size: 64,
                description: None,
            })),
        }),
    }
}

fn streamhost_query(sid: &str, hosts: Vec<Streamhost>) -> Iq {
    Iq {
        id: format!("q-{}", sid),
        from: Some(Jid::new(PEER)),
        to: Jid::new(ME),
        iq_type: IqType::Set,
        payload: IqPayload::Socks5(Socks5Payload::Query {
            sid: sid.to_owned(),
            mode: Some("tcp".to_owned()),
            streamhosts: hosts,
        }),
    }
}

async fn accept_inbound_socks5(
    factory: &Arc<BytestreamFactory>,
    incoming: &mut tokio::sync::mpsc::Receiver<IncomingStream>,
    sid: &str,
) -> siphon::Bytestream {
    factory.handle_iq(si_socks5_offer(sid)).await;
    let IncomingStream::FileTransfer { stream, .. } = timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("incoming stream")
        .expect("channel open")
    else {
        panic!("expected a file-transfer stream");
    };
    stream.accept().await;
    stream
}

// ============================================================================
// Target role: we connect to the peer's candidates
// ============================================================================

#[tokio::test]
async fn target_connects_and_streams_data() {
    init_tracing();
    let transport = RecordingTransport::new();
    let factory = BytestreamFactory::new(transport.clone(), Jid::new(ME), FactoryConfig::default());
    let mut incoming = factory.incoming_streams().expect("receiver");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().unwrap().port();
    // The peer initiated the stream, so the domain hashes peer-then-us.
    let domain = socks5_domain("tgt-1", PEER, ME);
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        speak_streamhost_server(&mut socket, &domain).await;
        socket
    });

    let stream = accept_inbound_socks5(&factory, &mut incoming, "tgt-1").await;
    let mut events = stream.take_events().expect("events");

    factory
        .handle_iq(streamhost_query(
            "tgt-1",
            vec![Streamhost {
                jid: Jid::new("streamhost.example.com"),
                host: "127.0.0.1".to_owned(),
                port,
            }],
        ))
        .await;

    wait_for_state(&stream, StreamState::Open).await;
    let mut socket = server.await.expect("server task");

    // The winning candidate is acknowledged on the offer IQ.
    let used: Vec<Jid> = transport
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Stanza::Iq(iq) => match iq.payload {
                IqPayload::Socks5(Socks5Payload::StreamhostUsed { jid }) => Some(jid),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(used, vec![Jid::new("streamhost.example.com")]);

    // Raw bytes from the peer surface verbatim as data events.
    socket.write_all(b"from the peer").await.expect("write");
    let data = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(StreamEvent::DataReceived { data, .. }) => return data,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("data event");
    assert_eq!(data, b"from the peer");

    // And our sends arrive on the socket.
    send_with_retry(&stream, b"from us").await;
    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(2), socket.read_exact(&mut buf))
        .await
        .expect("socket read")
        .expect("bytes arrive");
    assert_eq!(&buf, b"from us");
}

#[tokio::test]
async fn candidate_exhaustion_sends_one_error_and_closes_once() {
    init_tracing();
    let transport = RecordingTransport::new();
    let factory = BytestreamFactory::new(transport.clone(), Jid::new(ME), FactoryConfig::default());
    let mut incoming = factory.incoming_streams().expect("receiver");

    let stream = accept_inbound_socks5(&factory, &mut incoming, "exh-1").await;
    let mut events = stream.take_events().expect("events");

    // Three dead candidates: low loopback ports nothing listens on.
    let dead_hosts: Vec<Streamhost> = [1u16, 2, 3]
        .iter()
        .map(|port| Streamhost {
            jid: Jid::new(format!("host{}.example.com", port)),
            host: "127.0.0.1".to_owned(),
            port: *port,
        })
        .collect();
    factory
        .handle_iq(streamhost_query("exh-1", dead_hosts))
        .await;

    wait_for_state(&stream, StreamState::Closed).await;

    let mut connection_errors = 0;
    let mut closes = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            StreamEvent::ConnectionError => connection_errors += 1,
            StreamEvent::StateChanged(StreamState::Closed) => closes += 1,
            _ => {}
        }
    }
    assert_eq!(connection_errors, 1, "one terminal connection error");
    assert_eq!(closes, 1, "one Closed transition");

    let not_found_errors = transport
        .sent()
        .into_iter()
        .filter(|s| {
            matches!(
                s,
                Stanza::Iq(iq) if iq
                    .error()
                    .is_some_and(|e| e.condition == siphon::ErrorCondition::ItemNotFound)
            )
        })
        .count();
    assert_eq!(not_found_errors, 1, "exactly one item-not-found, not three");
}

#[tokio::test]
async fn streamhost_offer_for_unknown_stream_is_item_not_found() {
    init_tracing();
    let transport = RecordingTransport::new();
    let factory = BytestreamFactory::new(transport.clone(), Jid::new(ME), FactoryConfig::default());

    factory
        .handle_iq(streamhost_query(
            "never-announced",
            vec![Streamhost {
                jid: Jid::new("host.example.com"),
                host: "127.0.0.1".to_owned(),
                port: 1,
            }],
        ))
        .await;

    let errors: Vec<_> = transport
        .sent()
        .into_iter()
        .filter_map(|s| match s {
            Stanza::Iq(iq) => iq.error().cloned(),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].condition, siphon::ErrorCondition::ItemNotFound);
}

// ============================================================================
// Initiator role: we listen and the peer connects
// ============================================================================

#[tokio::test]
async fn initiator_listens_serves_handshake_and_streams_data() {
    init_tracing();
    // We initiate, so the domain hashes us-then-peer.
    let domain = socks5_domain("init-1", ME, PEER);
    let transport = ConnectingTransport::new(domain);
    let factory = BytestreamFactory::new(transport.clone(), Jid::new(ME), FactoryConfig::default());

    let stream = factory
        .create_bytestream(&Jid::new(PEER), "init-1", ns::BYTESTREAMS, StreamRole::Initiator)
        .await
        .expect("stream created");
    let mut events = stream.take_events().expect("events");

    assert!(stream.initiate().await, "listener starts");
    wait_for_state(&stream, StreamState::Open).await;

    let mut socket = transport.take_socket().expect("peer-side socket");

    // Peer-to-us data.
    socket.write_all(b"hello from peer").await.expect("write");
    let data = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(StreamEvent::DataReceived { data, .. }) => return data,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("data event");
    assert_eq!(data, b"hello from peer");

    // Us-to-peer data.
    send_with_retry(&stream, b"hello back").await;
    let mut buf = [0u8; 10];
    timeout(Duration::from_secs(2), socket.read_exact(&mut buf))
        .await
        .expect("socket read")
        .expect("bytes arrive");
    assert_eq!(&buf, b"hello back");

    // Closing tears the socket down; the peer sees EOF.
    stream.close(None).await;
    let mut probe = [0u8; 1];
    let eof = timeout(Duration::from_secs(2), socket.read(&mut probe))
        .await
        .expect("read completes")
        .expect("clean read");
    assert_eq!(eof, 0, "peer observes the close");
}

#[tokio::test]
async fn initiate_is_rejected_outside_initiating_state() {
    init_tracing();
    let transport = RecordingTransport::new();
    let factory = BytestreamFactory::new(transport, Jid::new(ME), FactoryConfig::default());
    let mut incoming = factory.incoming_streams().expect("receiver");

    // A freshly offered inbound stream is LocalPending; initiate must
    // refuse without changing state.
    factory.handle_iq(si_socks5_offer("state-1")).await;
    let IncomingStream::FileTransfer { stream, .. } =
        timeout(Duration::from_secs(2), incoming.recv())
            .await
            .expect("incoming")
            .expect("channel open")
    else {
        panic!("expected a file-transfer stream");
    };

    assert!(!stream.initiate().await);
    assert_eq!(stream.state().await, StreamState::LocalPending);
}
