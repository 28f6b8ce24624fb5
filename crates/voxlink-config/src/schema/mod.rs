//! Configuration schema types for Voxlink.
//!
//! All structs use `serde(default)` so partial configs work correctly.
//! Missing fields are filled with the defaults the voice stack was tuned with.

mod api;
mod audio;
mod peer;
mod signaling;
mod vad;

pub use api::*;
pub use audio::*;
pub use peer::*;
pub use signaling::*;
pub use vad::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration for a Voxlink client.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VoxlinkConfig {
    pub signaling: SignalingConfig,
    pub api: ApiConfig,
    pub ice: IceConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub peer: PeerConfig,
}
