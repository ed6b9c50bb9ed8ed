//! Local media: constraints, capture backends, shared streams

pub mod constraints;
pub mod devices;
pub mod pipeline;
pub mod stream;

pub use constraints::{DetailedConstraint, MediaConstraints, ScreenShareOptions, TrackConstraint};
pub use devices::{MediaDevices, SampleTrackDevices};
pub use pipeline::MediaPipeline;
pub use stream::{LocalTrack, MediaStream, RemoteStream, RemoteTrack, TrackKind};
