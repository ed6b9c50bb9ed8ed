//! Connection quality sampling

pub(crate) mod monitor;
pub mod stats;

pub(crate) use monitor::QualityMonitor;
pub use stats::{AudioQuality, CallQuality, ConnectionInfo, QualitySampler, Resolution, VideoQuality};
