mod bytestream;
mod factory;
mod ibb;
mod identity;
mod muc;
mod multiple;
mod proxy;
mod si;
mod socks5;
mod stanza;
mod transport;

pub use bytestream::{generate_stream_id, Bytestream, BytestreamKey, StreamEvent, StreamInfo, StreamRole, StreamState};
pub use factory::{BytestreamFactory, FactoryConfig, FactoryStats};
pub use ibb::IbbBytestream;
pub use identity::{Handle, HandleMap, Jid};
pub use muc::MucBytestream;
pub use multiple::MultipleBytestream;
pub use proxy::{ProxyCache, ProxyCacheStats, Socks5Proxy, FALLBACK_CAPACITY, PROXY_FLOOR, PROXY_LIST_TTL};
pub use si::{IncomingStream, SiRequest, SUPPORTED_METHODS};
pub use socks5::Socks5Bytestream;
pub use stanza::{
    ns, AppCondition, DataChunk, DataForm, ErrorCondition, ErrorType, FileOffer, FormField,
    IbbOpen, Iq, IqPayload, IqType, MessagePayload, MessageStanza, MessageType, ProfileBody,
    SiPayload, Socks5Payload, Stanza, StanzaError, Streamhost, TubeBody,
};
pub use transport::{StanzaTransport, IQ_REPLY_TIMEOUT};
