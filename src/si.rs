//! # Stream Initiation Negotiator (XEP-0095)
//!
//! Parses and validates inbound SI requests, builds offer/accept/decline
//! stanzas, and handles the multi-method extension where an offer or
//! accept names several transports at once.
//!
//! Validation of an inbound request is strictly ordered: sender, then the
//! `<si>` envelope (id and profile), then the feature-negotiation form
//! with at least one non-empty stream-method value. The first missing
//! piece aborts with a `bad-request` before any bytestream object exists.
//!
//! Method selection is first-match in offer order, never best-match: the
//! peer's ranking wins. Under the multi-method extension every supported
//! candidate is kept, in order, for the fallback wrapper.

use tracing::debug;

use crate::bytestream::{Bytestream, StreamInfo};
use crate::identity::Jid;
use crate::stanza::{
    ns, DataForm, FileOffer, Iq, IqPayload, IqType, ProfileBody, SiPayload, StanzaError, TubeBody,
};

/// Transport namespaces this implementation can realize, in the order we
/// offer them.
pub const SUPPORTED_METHODS: [&str; 2] = [ns::BYTESTREAMS, ns::IBB];

pub fn is_supported_method(method: &str) -> bool {
    SUPPORTED_METHODS.contains(&method)
}

/// A validated inbound SI request.
#[derive(Clone, Debug)]
pub struct SiRequest {
    /// The request stanza's id; replies correlate on it.
    pub iq_id: String,
    pub peer: Jid,
    pub stream_id: String,
    pub profile: String,
    pub mime_type: Option<String>,
    /// Candidate methods exactly as offered, order preserved.
    pub methods: Vec<String>,
    /// Peer flagged multi-method support.
    pub multiple: bool,
    pub body: Option<ProfileBody>,
}

/// Validate an inbound SI request, in order: sender, `<si>` envelope,
/// feature form with at least one non-empty stream-method candidate.
pub fn parse_si_request(iq: &Iq) -> Result<SiRequest, StanzaError> {
    let Some(peer) = iq.from.clone() else {
        return Err(StanzaError::bad_request("stream initiation without sender"));
    };
    let IqPayload::Si(si) = &iq.payload else {
        return Err(StanzaError::bad_request("missing si element"));
    };
    let Some(stream_id) = si.id.clone().filter(|id| !id.is_empty()) else {
        return Err(StanzaError::bad_request("si element without stream id"));
    };
    let Some(profile) = si.profile.clone().filter(|p| !p.is_empty()) else {
        return Err(StanzaError::bad_request("si element without profile"));
    };
    let Some(feature) = &si.feature else {
        return Err(StanzaError::bad_request("missing feature negotiation"));
    };
    let methods = feature.stream_methods();
    if methods.is_empty() {
        return Err(StanzaError::bad_request("no stream methods proposed"));
    }
    Ok(SiRequest {
        iq_id: iq.id.clone(),
        peer,
        stream_id,
        profile,
        mime_type: si.mime_type.clone(),
        methods,
        multiple: si.multiple.is_some(),
        body: si.body.clone(),
    })
}

/// First-match selection for a single-method offer: the earliest candidate
/// we support wins. Unsupported candidates are skipped without error.
pub fn select_method(methods: &[String]) -> Option<&str> {
    methods
        .iter()
        .map(String::as_str)
        .find(|m| is_supported_method(m))
}

/// Every supported candidate, offer order preserved, for the fallback
/// wrapper.
pub fn supported_subset(methods: &[String]) -> Vec<String> {
    methods
        .iter()
        .filter(|m| is_supported_method(m))
        .cloned()
        .collect()
}

// ============================================================================
// Stanza builders
// ============================================================================

/// The outbound SI offer: both supported transports plus the multi-method
/// flag, so a capable peer can rank alternatives in its accept.
pub fn build_si_offer(
    self_jid: &Jid,
    peer: &Jid,
    stream_id: &str,
    profile: &str,
    mime_type: Option<String>,
    body: Option<ProfileBody>,
) -> Iq {
    Iq {
        id: format!("si{}", crate::bytestream::generate_stream_id()),
        from: Some(self_jid.clone()),
        to: peer.clone(),
        iq_type: IqType::Set,
        payload: IqPayload::Si(SiPayload {
            id: Some(stream_id.to_owned()),
            profile: Some(profile.to_owned()),
            mime_type,
            feature: Some(DataForm::method_offer(&SUPPORTED_METHODS)),
            multiple: Some(Vec::new()),
            body,
        }),
    }
}

/// Accept an SI request naming a single method. `None` when the stream was
/// negotiated directly and there is no SI request to answer.
pub fn build_si_accept(info: &StreamInfo, self_jid: &Jid, method: &str) -> Option<Iq> {
    let request_id = info.stream_init_id.clone()?;
    Some(Iq {
        id: request_id,
        from: Some(self_jid.clone()),
        to: info.peer_jid.clone(),
        iq_type: IqType::Result,
        payload: IqPayload::Si(SiPayload {
            id: Some(info.stream_id.clone()),
            profile: None,
            mime_type: None,
            feature: Some(DataForm::method_submit(method)),
            multiple: None,
            body: None,
        }),
    })
}

/// Accept an SI request naming several methods in preference order.
pub fn build_si_multi_accept(info: &StreamInfo, self_jid: &Jid, methods: &[&str]) -> Option<Iq> {
    let request_id = info.stream_init_id.clone()?;
    Some(Iq {
        id: request_id,
        from: Some(self_jid.clone()),
        to: info.peer_jid.clone(),
        iq_type: IqType::Result,
        payload: IqPayload::Si(SiPayload {
            id: Some(info.stream_id.clone()),
            profile: None,
            mime_type: None,
            feature: None,
            multiple: Some(methods.iter().map(|m| (*m).to_owned()).collect()),
            body: None,
        }),
    })
}

/// Decline an SI request with `error`, defaulting to the generic decline.
/// `None` when there is no SI request to answer.
pub fn build_si_decline(
    info: &StreamInfo,
    self_jid: &Jid,
    error: Option<StanzaError>,
) -> Option<Iq> {
    let request_id = info.stream_init_id.clone()?;
    Some(Iq {
        id: request_id,
        from: Some(self_jid.clone()),
        to: info.peer_jid.clone(),
        iq_type: IqType::Error,
        payload: IqPayload::Error(error.unwrap_or_else(StanzaError::declined)),
    })
}

/// Extract the accepted methods from an SI reply: the multi-method ranking
/// when present, the single submitted method otherwise, empty when neither
/// parses.
pub fn parse_si_reply(reply: &Iq) -> Vec<String> {
    let IqPayload::Si(si) = &reply.payload else {
        return Vec::new();
    };
    if let Some(multiple) = &si.multiple {
        let ranked: Vec<String> = multiple.iter().filter(|m| !m.is_empty()).cloned().collect();
        if !ranked.is_empty() {
            return ranked;
        }
    }
    match &si.feature {
        Some(form) => form.stream_methods(),
        None => Vec::new(),
    }
}

// ============================================================================
// Profile dispatch
// ============================================================================

/// A negotiated inbound stream, routed to its consumer by SI profile.
#[derive(Debug)]
pub enum IncomingStream {
    /// File-transfer profile.
    FileTransfer {
        stream: Bytestream,
        offer: FileOffer,
        mime_type: Option<String>,
    },
    /// A brand-new tube offer.
    TubeOffer {
        stream: Bytestream,
        tube_id: u64,
        service: String,
    },
    /// An extra bytestream for an existing one-to-one tube.
    TubeStream { stream: Bytestream, tube_id: u64 },
    /// An extra bytestream for an existing groupchat tube.
    MucTubeStream { stream: Bytestream, tube_id: u64 },
}

/// Route a freshly created bytestream to its consumer. A profile we do not
/// recognize, or a tube request with a malformed body, closes the stream
/// with the returned error.
pub(crate) fn dispatch_profile(
    request: &SiRequest,
    stream: Bytestream,
) -> Result<IncomingStream, StanzaError> {
    match request.profile.as_str() {
        ns::PROFILE_FILE_TRANSFER => match &request.body {
            Some(ProfileBody::File(offer)) => Ok(IncomingStream::FileTransfer {
                stream,
                offer: offer.clone(),
                mime_type: request.mime_type.clone(),
            }),
            _ => Err(StanzaError::bad_request("file-transfer request without file")),
        },
        ns::PROFILE_TUBES => match &request.body {
            Some(ProfileBody::Tube(TubeBody::Offer { tube_id, service })) => {
                Ok(IncomingStream::TubeOffer {
                    stream,
                    tube_id: *tube_id,
                    service: service.clone(),
                })
            }
            Some(ProfileBody::Tube(TubeBody::Stream { tube_id })) => {
                Ok(IncomingStream::TubeStream {
                    stream,
                    tube_id: *tube_id,
                })
            }
            Some(ProfileBody::Tube(TubeBody::MucStream { tube_id })) => {
                Ok(IncomingStream::MucTubeStream {
                    stream,
                    tube_id: *tube_id,
                })
            }
            _ => Err(StanzaError::bad_request("malformed tube request")),
        },
        other => {
            debug!(profile = %other, "unrecognized stream initiation profile");
            Err(StanzaError::bad_profile())
        }
    }
}
