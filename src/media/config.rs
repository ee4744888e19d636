#![forbid(unsafe_code)]

// Configuration for media workers, routers, and WebRTC transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Main media engine configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: TransportConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        settings
    }
}

/// Router configuration with the codec set every room router is created with
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus for audio; VP8 and H264 for video (the codecs mobile camera and
    /// viewer devices actually negotiate).
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport listen configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    /// IP written into ICE candidates; must be reachable by clients
    pub announced_ip: Option<IpAddr>,
    /// UDP port of the first worker's WebRtcServer; worker i listens on base + i
    pub server_port_base: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: None,
            server_port_base: 44000,
        }
    }
}

impl TransportConfig {
    /// Sets the announced IP address for ICE candidates
    pub fn with_announced_ip(mut self, ip: IpAddr) -> Self {
        self.announced_ip = Some(ip);
        self
    }

    /// Builds the ListenInfo for one worker's WebRtcServer
    pub fn listen_info(&self, port: u16) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.map(|ip| ip.to_string()),
            port: Some(port),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}
