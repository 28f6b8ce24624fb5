//! Local media pipeline: device acquisition, the fixed processing chain and
//! the shared output track every peer sends from.

mod devices;
mod dsp;
mod graph;
mod pipeline;
mod types;

pub use devices::{acquire, AcquiredTracks, DeviceTrack, MediaDevices};
pub use dsp::{Biquad, Compressor, NoiseGate};
pub use graph::{PipelineControls, ProcessedBlock, ProcessingGraph};
pub use pipeline::LocalMediaPipeline;
pub use types::{AudioFrame, MediaConstraints, MediaKind, MediaOutput, MediaTrack};
