#![forbid(unsafe_code)]

// Wire protocol - JSON messages exchanged over the WebSocket

use crate::media::types::{ErrorKind, TransportDirection};
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// What a peer is in the room for. Cameras send media, viewers receive it;
/// the transport direction checks enforce the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Camera,
    Viewer,
}

/// Producer metadata handed to joining peers for discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub display_name: String,
    pub role: PeerRole,
    pub producers: Vec<ProducerSummary>,
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room, creating it if needed
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
        role: PeerRole,
    },
    /// Leave the current room
    LeaveRoom,
    /// Get RTP capabilities of a room's router; callable before joining so
    /// clients can load their device first
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities { room_id: String },
    /// Create a WebRTC transport in the given direction
    #[serde(rename_all = "camelCase")]
    CreateWebrtcTransport { direction: TransportDirection },
    /// Connect a transport with client DTLS parameters
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    /// Produce media (audio/video)
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Consume another peer's producer
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    /// Resume a paused consumer
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    /// Ask for a keyframe on consumers fed by this producer
    #[serde(rename_all = "camelCase")]
    RequestKeyframe { producer_id: String },
    /// Close a producer without leaving
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Room joined successfully, with the peers already present
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        peer_id: String,
        peers: Vec<PeerSummary>,
    },
    /// Router RTP capabilities
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities {
        rtp_capabilities: RtpCapabilitiesFinalized,
    },
    /// Transport created
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    /// Transport connected
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    /// Producer created
    #[serde(rename_all = "camelCase")]
    ProducerCreated { producer_id: String },
    /// Consumer created, paused until resumed
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
    },
    /// Consumer resumed
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },
    /// Another peer joined the room
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer_id: String,
        display_name: String,
        role: PeerRole,
    },
    /// A peer left the room
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    /// New producer available from another peer
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    /// A producer went away
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    /// Error response
    Error { kind: ErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_kebab_case_tags() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"join-room","roomId":"nursery","peerId":"cam-1","displayName":"Nursery Cam","role":"camera"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::JoinRoom {
                room_id,
                peer_id,
                role,
                ..
            } => {
                assert_eq!(room_id, "nursery");
                assert_eq!(peer_id, "cam-1");
                assert_eq!(role, PeerRole::Camera);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"create-webrtc-transport","direction":"recv"}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::CreateWebrtcTransport {
                direction: TransportDirection::Recv
            }
        ));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"get-router-rtp-capabilities","roomId":"nursery"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::GetRouterRtpCapabilities { room_id } if room_id == "nursery"
        ));
    }

    #[test]
    fn unknown_message_type_fails_to_parse() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"start-recording"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn error_message_carries_kind_and_text() {
        let json = serde_json::to_string(&ServerMessage::Error {
            kind: ErrorKind::RoomClosing,
            message: "room nursery is closing".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""kind":"room-closing""#));
    }

    #[test]
    fn new_producer_announcement_uses_camel_case_fields() {
        let json = serde_json::to_string(&ServerMessage::NewProducer {
            peer_id: "cam-1".into(),
            producer_id: "abc".into(),
            kind: MediaKind::Video,
        })
        .unwrap();
        assert!(json.contains(r#""type":"new-producer""#));
        assert!(json.contains(r#""peerId":"cam-1""#));
        assert!(json.contains(r#""kind":"video""#));
    }
}
