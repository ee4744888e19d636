// Shared fixtures for engine-backed tests. Crafted DTLS and RTP parameters
// let the engine accept connect/produce/consume without a live client.

use super::config::MediaConfig;
use mediasoup::data_structures::{DtlsFingerprint, DtlsRole};
use mediasoup::prelude::*;
use std::num::{NonZeroU32, NonZeroU8};
use std::time::Duration;

/// Single-worker config with a test-unique WebRtcServer port base so parallel
/// tests never collide on UDP binds.
pub fn media_config(port_base: u16) -> MediaConfig {
    let mut config = MediaConfig::default();
    config.worker.num_workers = 1;
    config.transport.server_port_base = port_base;
    config
}

pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint::Sha256 {
            value: [
                0x82, 0x5A, 0x68, 0x3D, 0x36, 0xC3, 0x0A, 0xDE, 0xAF, 0xE7, 0x32, 0x43, 0xD2,
                0x88, 0x83, 0x57, 0xAC, 0x2D, 0x65, 0xE5, 0x80, 0xC4, 0xB6, 0xFB, 0xAF, 0x1A,
                0xA0, 0x21, 0x9F, 0x6D, 0x0C, 0xAD,
            ],
        }],
    }
}

pub fn audio_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters::Audio {
            mime_type: MimeTypeAudio::Opus,
            payload_type: 111,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        }],
        header_extensions: vec![],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(11110001),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("cribcast-test-audio".to_string()),
            ..RtcpParameters::default()
        },
    }
}

pub fn video_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters::Video {
            mime_type: MimeTypeVideo::Vp8,
            payload_type: 96,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::TransportCc,
            ],
        }],
        header_extensions: vec![],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(22220001),
            ..RtpEncodingParameters::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("cribcast-test-video".to_string()),
            ..RtcpParameters::default()
        },
    }
}

/// Device capabilities a consuming peer would advertise.
pub fn viewer_rtp_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(100),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(101),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![RtcpFeedback::Nack, RtcpFeedback::NackPli],
            },
        ],
        header_extensions: vec![],
    }
}

/// Polls a condition for up to one second. Engine-side close cascades arrive
/// over the worker channel, so observers need a short grace window.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
