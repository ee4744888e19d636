#![forbid(unsafe_code)]

// Session error taxonomy and signaling info structs

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-visible error category. Clients branch on this field rather than
/// parsing the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Named room/peer/transport/producer/consumer does not exist
    NotFound,
    /// Operation is not legal in the target's current state
    InvalidState,
    /// Room is mid-teardown; retry the join shortly
    RoomClosing,
    /// Engine rejected transport negotiation; recreate the transport
    NegotiationFailed,
    /// No media capacity right now; retry after backoff
    ServerBusy,
    /// Unrecoverable engine failure
    Fatal,
}

/// Error type for all session coordinator operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("{0} not found: {1}")]
    ResourceNotFound(&'static str, String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("room {0} is closing")]
    RoomClosing(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("server busy: no media capacity available")]
    ServerBusy,

    #[error("fatal media engine failure: {0}")]
    Fatal(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_) | Self::PeerNotFound(_) | Self::ResourceNotFound(..) => {
                ErrorKind::NotFound
            }
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::RoomClosing(_) => ErrorKind::RoomClosing,
            Self::NegotiationFailed(_) => ErrorKind::NegotiationFailed,
            Self::ServerBusy => ErrorKind::ServerBusy,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Direction of a WebRTC transport relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Transport negotiation state machine: created -> connecting -> connected,
/// with closed terminal from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TransportState {
    Created = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl TransportState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// Transport information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl TransportInfo {
    pub fn new(transport: &WebRtcTransport, direction: TransportDirection) -> Self {
        Self {
            id: transport.id().to_string(),
            direction,
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Consumer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

impl ConsumerInfo {
    pub fn from_consumer(consumer: &Consumer) -> Self {
        Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            paused: consumer.paused(),
        }
    }
}
