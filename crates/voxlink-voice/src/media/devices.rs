//! Capture device seam.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;
use voxlink_common::MediaError;
use voxlink_config::schema::{AudioConfig, VideoCaptureConfig};

use super::types::{MediaConstraints, MediaKind};

/// A hardware capture track.
pub trait DeviceTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Raw capture blocks. Only microphones produce them, and only once.
    fn take_samples(&self) -> Option<mpsc::Receiver<Vec<f32>>>;
    /// Release the device. Idempotent.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Opens capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self, config: &AudioConfig) -> Result<Arc<dyn DeviceTrack>, MediaError>;
    async fn open_camera(&self, config: &VideoCaptureConfig) -> Result<Arc<dyn DeviceTrack>, MediaError>;
    async fn open_screen(&self, config: &VideoCaptureConfig) -> Result<Arc<dyn DeviceTrack>, MediaError>;
}

/// Tracks opened by one [`acquire`] call.
#[derive(Default)]
pub struct AcquiredTracks {
    pub microphone: Option<Arc<dyn DeviceTrack>>,
    pub camera: Option<Arc<dyn DeviceTrack>>,
    pub screen: Option<Arc<dyn DeviceTrack>>,
}

impl AcquiredTracks {
    pub fn stop_all(&self) {
        for track in [&self.microphone, &self.camera, &self.screen]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }
}

/// Open everything `constraints` asks for.
///
/// If any device fails, tracks opened so far are stopped before the error
/// is returned.
pub async fn acquire(
    devices: &dyn MediaDevices,
    constraints: MediaConstraints,
    config: &AudioConfig,
) -> Result<AcquiredTracks, MediaError> {
    let mut acquired = AcquiredTracks::default();

    if constraints.audio {
        match devices.open_microphone(config).await {
            Ok(track) => acquired.microphone = Some(track),
            Err(e) => return Err(abort(acquired, e)),
        }
    }
    if constraints.video {
        match devices.open_camera(&config.camera).await {
            Ok(track) => acquired.camera = Some(track),
            Err(e) => return Err(abort(acquired, e)),
        }
    }
    if constraints.screen {
        match devices.open_screen(&config.screen).await {
            Ok(track) => acquired.screen = Some(track),
            Err(e) => return Err(abort(acquired, e)),
        }
    }
    Ok(acquired)
}

fn abort(acquired: AcquiredTracks, err: MediaError) -> MediaError {
    warn!(error = %err, "media acquisition failed, releasing opened tracks");
    acquired.stop_all();
    err
}
