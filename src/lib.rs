#![forbid(unsafe_code)]

// cribcast - media session coordinator for camera/viewer rooms

pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
