//! # Wire Protocol Stanzas
//!
//! Typed model of every stanza shape the bytestream layer sends or receives.
//! The XMPP session layer owns XML serialization; this crate exchanges the
//! typed forms below through the [`crate::transport::StanzaTransport`] seam.
//!
//! ## Stanza Types
//!
//! | Protocol | Payload | Carried in |
//! |----------|---------|-----------|
//! | Stream initiation | [`SiPayload`] | `<iq type="set"/result>` |
//! | SOCKS5 negotiation | [`Socks5Payload`] | `<iq type="set"/result>` |
//! | In-band open/close/data | `IbbOpen` / `IbbClose` / [`DataChunk`] | `<iq>` or `<message>` |
//! | Groupchat data | [`DataChunk`] + AMP flag | `<message type="groupchat">` |
//! | Proxy discovery | `DiscoItems*` | `<iq type="get"/result>` |
//!
//! Fields that the wire may omit are `Option`s even when a valid stanza
//! requires them; validation happens in the negotiator so that malformed
//! input resolves to a protocol error reply, never a panic.

use serde::{Deserialize, Serialize};

use crate::identity::Jid;

/// Namespace constants for every protocol this crate speaks.
pub mod ns {
    /// XEP-0095 Stream Initiation.
    pub const SI: &str = "http://jabber.org/protocol/si";
    /// Multi-method SI offers/accepts with fallback ordering.
    pub const SI_MULTIPLE: &str = "urn:xmpp:si-multiple";
    /// SI profile: file transfer.
    pub const PROFILE_FILE_TRANSFER: &str = "http://jabber.org/protocol/si/profile/file-transfer";
    /// SI profile: peer-to-peer tubes.
    pub const PROFILE_TUBES: &str = "urn:xmpp:tubes";
    /// XEP-0020 feature negotiation.
    pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
    /// Data forms carried inside feature negotiation.
    pub const X_DATA: &str = "jabber:x:data";
    /// XEP-0065 SOCKS5 bytestreams.
    pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
    /// XEP-0047 in-band bytestreams.
    pub const IBB: &str = "http://jabber.org/protocol/ibb";
    /// Groupchat pseudo-bytestream data chunks.
    pub const MUC_BYTESTREAM: &str = "urn:xmpp:muc-bytestream";
    /// XEP-0079 advanced message processing (synchronous-delivery rules).
    pub const AMP: &str = "http://jabber.org/protocol/amp";
    /// Service discovery items, used for proxy discovery.
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
}

/// The `var="stream-method"` field inside SI feature negotiation.
pub const STREAM_METHOD_FIELD: &str = "stream-method";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Iq {
    pub id: String,
    /// Absent `from` is possible on the wire; the negotiator rejects it.
    pub from: Option<Jid>,
    pub to: Jid,
    pub iq_type: IqType,
    pub payload: IqPayload,
}

impl Iq {
    /// Build a `type="result"` reply correlated to `request`.
    pub fn result_of(request: &Iq, self_jid: &Jid, payload: IqPayload) -> Iq {
        Iq {
            id: request.id.clone(),
            from: Some(self_jid.clone()),
            to: request.from.clone().unwrap_or_else(|| request.to.clone()),
            iq_type: IqType::Result,
            payload,
        }
    }

    /// Build a `type="error"` reply correlated to `request`.
    pub fn error_of(request: &Iq, self_jid: &Jid, error: StanzaError) -> Iq {
        Iq {
            id: request.id.clone(),
            from: Some(self_jid.clone()),
            to: request.from.clone().unwrap_or_else(|| request.to.clone()),
            iq_type: IqType::Error,
            payload: IqPayload::Error(error),
        }
    }

    /// The error payload, if this is an error reply.
    pub fn error(&self) -> Option<&StanzaError> {
        match &self.payload {
            IqPayload::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.iq_type == IqType::Error
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IqPayload {
    Si(SiPayload),
    Socks5(Socks5Payload),
    IbbOpen(IbbOpen),
    IbbClose { sid: String },
    IbbData(DataChunk),
    DiscoItemsQuery,
    DiscoItems { items: Vec<Jid> },
    Error(StanzaError),
    /// Bare `<iq type="result"/>` acknowledgement.
    Empty,
}

/// `<si xmlns=".../si">` contents, raw as received.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SiPayload {
    pub id: Option<String>,
    pub profile: Option<String>,
    pub mime_type: Option<String>,
    /// Feature-negotiation form: `type="form"` with options in an offer,
    /// `type="submit"` with values in an accept.
    pub feature: Option<DataForm>,
    /// `<si-multiple/>`: `Some(vec![])` is the bare offer flag, a non-empty
    /// vec is the accept-side method ranking.
    pub multiple: Option<Vec<String>>,
    /// Profile-specific child element.
    pub body: Option<ProfileBody>,
}

/// Profile-specific content of an SI request, distinguished by child
/// element name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProfileBody {
    File(FileOffer),
    Tube(TubeBody),
}

/// XEP-0096-shaped file description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub name: String,
    pub size: u64,
    pub description: Option<String>,
}

/// The three tube sub-cases an SI request can carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TubeBody {
    /// A brand-new tube offer.
    Offer { tube_id: u64, service: String },
    /// An extra bytestream for an existing one-to-one tube.
    Stream { tube_id: u64 },
    /// An extra bytestream for an existing groupchat tube.
    MucStream { tube_id: u64 },
}

/// `<query xmlns=".../bytestreams">` contents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Socks5Payload {
    /// Candidate streamhosts offered by the initiator.
    Query {
        sid: String,
        mode: Option<String>,
        streamhosts: Vec<Streamhost>,
    },
    /// Acknowledgement naming the candidate the target connected to.
    StreamhostUsed { jid: Jid },
}

/// A `(jid, host, port)` SOCKS5 connection candidate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streamhost {
    pub jid: Jid,
    pub host: String,
    pub port: u16,
}

/// `<open xmlns=".../ibb">`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IbbOpen {
    pub sid: String,
    /// Zero or absent means "sender states no preference".
    pub block_size: Option<u32>,
}

/// A base64 data chunk, carried in IQs (acknowledged) or messages
/// (fire-and-forget) for IBB, and in groupchat messages for MUC streams.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    pub sid: String,
    /// Base64 text exactly as it appeared on the wire.
    pub data: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Normal,
    Groupchat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageStanza {
    pub from: Option<Jid>,
    pub to: Jid,
    pub msg_type: MessageType,
    pub payload: MessagePayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessagePayload {
    IbbData(DataChunk),
    MucData {
        chunk: DataChunk,
        /// Whether an `<amp/>` rule set requesting synchronous delivery
        /// (error-on-offline, error-on-wrong-resource) is attached.
        amp: bool,
    },
}

/// Anything the transport can put on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Stanza {
    Iq(Iq),
    Message(MessageStanza),
}

// ============================================================================
// Data forms (feature negotiation)
// ============================================================================

/// `<x xmlns="jabber:x:data">` as used by SI feature negotiation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataForm {
    /// `"form"` in an offer, `"submit"` in an accept.
    pub form_type: String,
    pub fields: Vec<FormField>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub var: String,
    pub field_type: Option<String>,
    /// `<option><value>..</value></option>` entries (offer side).
    pub options: Vec<String>,
    /// Direct `<value>` entries (submit side).
    pub values: Vec<String>,
}

impl DataForm {
    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// The ordered stream-method candidates: options on the offer side,
    /// values on the submit side. Empty strings are dropped.
    pub fn stream_methods(&self) -> Vec<String> {
        let Some(field) = self.field(STREAM_METHOD_FIELD) else {
            return Vec::new();
        };
        let raw = if field.options.is_empty() {
            &field.values
        } else {
            &field.options
        };
        raw.iter().filter(|v| !v.is_empty()).cloned().collect()
    }

    /// The offer form proposing the given stream methods.
    pub fn method_offer(methods: &[&str]) -> DataForm {
        DataForm {
            form_type: "form".to_owned(),
            fields: vec![FormField {
                var: STREAM_METHOD_FIELD.to_owned(),
                field_type: Some("list-single".to_owned()),
                options: methods.iter().map(|m| (*m).to_owned()).collect(),
                values: Vec::new(),
            }],
        }
    }

    /// The submit form accepting a single stream method.
    pub fn method_submit(method: &str) -> DataForm {
        DataForm {
            form_type: "submit".to_owned(),
            fields: vec![FormField {
                var: STREAM_METHOD_FIELD.to_owned(),
                field_type: None,
                options: Vec::new(),
                values: vec![method.to_owned()],
            }],
        }
    }
}

// ============================================================================
// Stanza errors
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    Cancel,
    Modify,
    Auth,
    Wait,
}

/// RFC 6120 defined conditions this layer emits or inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCondition {
    BadRequest,
    Forbidden,
    ItemNotFound,
    NotAcceptable,
    NotAllowed,
    FeatureNotImplemented,
    ServiceUnavailable,
    RemoteServerTimeout,
    RecipientUnavailable,
    InternalServerError,
}

/// Application-defined conditions layered on top of the generic one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppCondition {
    /// No offered stream method is mutually supported (XEP-0095).
    NoValidStreams,
    /// The SI profile was not understood (XEP-0095).
    BadProfile,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    pub error_type: ErrorType,
    pub condition: ErrorCondition,
    pub app_condition: Option<AppCondition>,
    pub text: Option<String>,
}

impl StanzaError {
    pub fn new(error_type: ErrorType, condition: ErrorCondition) -> Self {
        Self {
            error_type,
            condition,
            app_condition: None,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn bad_request(text: impl Into<String>) -> Self {
        Self::new(ErrorType::Modify, ErrorCondition::BadRequest).with_text(text)
    }

    pub fn item_not_found(text: impl Into<String>) -> Self {
        Self::new(ErrorType::Cancel, ErrorCondition::ItemNotFound).with_text(text)
    }

    pub fn not_acceptable(text: impl Into<String>) -> Self {
        Self::new(ErrorType::Modify, ErrorCondition::NotAcceptable).with_text(text)
    }

    /// The default decline for an unwanted offer.
    pub fn declined() -> Self {
        Self::new(ErrorType::Cancel, ErrorCondition::Forbidden).with_text("offer declined")
    }

    pub fn no_valid_streams() -> Self {
        let mut err = Self::new(ErrorType::Cancel, ErrorCondition::BadRequest)
            .with_text("none of the offered stream methods is supported");
        err.app_condition = Some(AppCondition::NoValidStreams);
        err
    }

    pub fn bad_profile() -> Self {
        let mut err = Self::new(ErrorType::Modify, ErrorCondition::BadRequest)
            .with_text("invalid stream initiation profile");
        err.app_condition = Some(AppCondition::BadProfile);
        err
    }

    /// Used when orderly teardown resolves still-pending requests.
    pub fn disconnected() -> Self {
        Self::new(ErrorType::Cancel, ErrorCondition::RecipientUnavailable)
            .with_text("disconnected")
    }
}

impl std::fmt::Display for StanzaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{:?}: {}", self.condition, text),
            None => write!(f, "{:?}", self.condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Iq {
        Iq {
            id: "iq-42".to_owned(),
            from: Some(Jid::new("peer@example.com/res")),
            to: Jid::new("me@example.com/here"),
            iq_type: IqType::Set,
            payload: IqPayload::Empty,
        }
    }

    #[test]
    fn result_reply_swaps_addresses_and_keeps_id() {
        let req = request();
        let me = Jid::new("me@example.com/here");
        let reply = Iq::result_of(&req, &me, IqPayload::Empty);

        assert_eq!(reply.id, "iq-42");
        assert_eq!(reply.to, Jid::new("peer@example.com/res"));
        assert_eq!(reply.from, Some(me));
        assert_eq!(reply.iq_type, IqType::Result);
    }

    #[test]
    fn error_reply_carries_condition() {
        let req = request();
        let me = Jid::new("me@example.com/here");
        let reply = Iq::error_of(&req, &me, StanzaError::item_not_found("no such stream"));

        assert!(reply.is_error());
        let err = reply.error().expect("error payload");
        assert_eq!(err.condition, ErrorCondition::ItemNotFound);
        assert_eq!(err.text.as_deref(), Some("no such stream"));
    }

    #[test]
    fn stream_methods_prefers_options_over_values() {
        let form = DataForm::method_offer(&[ns::IBB, ns::BYTESTREAMS]);
        assert_eq!(form.stream_methods(), vec![ns::IBB, ns::BYTESTREAMS]);

        let submit = DataForm::method_submit(ns::BYTESTREAMS);
        assert_eq!(submit.stream_methods(), vec![ns::BYTESTREAMS]);
    }

    #[test]
    fn stream_methods_drops_empty_values() {
        let mut form = DataForm::method_offer(&[ns::IBB]);
        form.fields[0].options.push(String::new());
        assert_eq!(form.stream_methods(), vec![ns::IBB]);
    }

    #[test]
    fn stream_methods_without_field_is_empty() {
        let form = DataForm {
            form_type: "form".to_owned(),
            fields: vec![],
        };
        assert!(form.stream_methods().is_empty());
    }

    #[test]
    fn decline_default_is_forbidden() {
        let err = StanzaError::declined();
        assert_eq!(err.condition, ErrorCondition::Forbidden);
        assert_eq!(err.error_type, ErrorType::Cancel);
    }

    #[test]
    fn no_valid_streams_carries_app_condition() {
        let err = StanzaError::no_valid_streams();
        assert_eq!(err.app_condition, Some(AppCondition::NoValidStreams));
        assert_eq!(err.condition, ErrorCondition::BadRequest);
    }
}
