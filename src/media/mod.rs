#![forbid(unsafe_code)]

// Media module - worker pool, per-peer media trees, and engine configuration

pub mod config;
pub mod peer_media;
pub mod types;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use config::{MediaConfig, RouterConfig, TransportConfig, WorkerConfig};
pub use peer_media::PeerMedia;
pub use types::{
    ConsumerInfo, ErrorKind, SessionError, SessionResult, TransportDirection, TransportInfo,
    TransportState,
};
pub use worker_pool::{WorkerLease, WorkerPool};
