use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use voxlink_common::MediaError;
use voxlink_config::schema::AudioConfig;

use super::devices::{acquire, AcquiredTracks, DeviceTrack, MediaDevices};
use super::graph::{PipelineControls, ProcessingGraph};
use super::types::{AudioFrame, MediaConstraints, MediaKind, MediaOutput, MediaTrack};

/// Frames buffered per output subscriber before it starts lagging.
const FRAME_BUFFER: usize = 64;

/// Owns the capture devices, the processing task and the shared output track.
///
/// Every peer sends the same [`MediaTrack`] returned by
/// [`current_output`](Self::current_output); the pipeline must outlive the
/// peers that reference it.
pub struct LocalMediaPipeline {
    devices: Arc<dyn MediaDevices>,
    config: AudioConfig,
    tracks: AcquiredTracks,
    controls: Arc<PipelineControls>,
    tap_tx: broadcast::Sender<AudioFrame>,
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
    screen: Option<MediaTrack>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl LocalMediaPipeline {
    /// Acquire devices and start processing.
    ///
    /// On any device failure nothing is left running.
    pub async fn start(
        devices: Arc<dyn MediaDevices>,
        config: &AudioConfig,
        constraints: MediaConstraints,
        controls: Arc<PipelineControls>,
    ) -> Result<Self, MediaError> {
        let tracks = acquire(devices.as_ref(), constraints, config).await?;
        let (tap_tx, _) = broadcast::channel(FRAME_BUFFER);
        let cancel = CancellationToken::new();

        let mut pipeline = Self {
            devices,
            config: config.clone(),
            tracks,
            controls,
            tap_tx,
            audio: None,
            video: None,
            screen: None,
            cancel,
            task: None,
            closed: false,
        };

        if let Some(mic) = pipeline.tracks.microphone.clone() {
            pipeline.start_audio(mic.as_ref())?;
        }
        if let Some(camera) = &pipeline.tracks.camera {
            pipeline.video = Some(MediaTrack::video(camera.id(), MediaKind::Video));
        }
        if let Some(screen) = &pipeline.tracks.screen {
            pipeline.screen = Some(MediaTrack::video(screen.id(), MediaKind::Screen));
        }

        info!(
            audio = pipeline.audio.is_some(),
            video = pipeline.video.is_some(),
            screen = pipeline.screen.is_some(),
            "local media pipeline started"
        );
        Ok(pipeline)
    }

    fn start_audio(&mut self, mic: &dyn DeviceTrack) -> Result<(), MediaError> {
        let Some(raw) = mic.take_samples() else {
            self.tracks.stop_all();
            return Err(MediaError::DeviceUnavailable(format!(
                "microphone {} produced no sample stream",
                mic.id()
            )));
        };
        let (output_tx, _) = broadcast::channel(FRAME_BUFFER);
        let graph = ProcessingGraph::new(&self.config, Arc::clone(&self.controls));
        self.task = Some(tokio::spawn(process_loop(
            raw,
            graph,
            self.config.sample_rate,
            output_tx.clone(),
            self.tap_tx.clone(),
            self.cancel.clone(),
        )));
        self.audio = Some(MediaTrack::audio(format!("{}-processed", mic.id()), output_tx));
        Ok(())
    }

    /// Snapshot of what peers should currently send.
    pub fn current_output(&self) -> MediaOutput {
        MediaOutput {
            audio: self.audio.clone(),
            video: self.video.clone(),
            screen: self.screen.clone(),
        }
    }

    /// Post-compressor, pre-gate signal for local voice-activity detection.
    pub fn analysis_tap(&self) -> broadcast::Receiver<AudioFrame> {
        self.tap_tx.subscribe()
    }

    pub fn controls(&self) -> Arc<PipelineControls> {
        Arc::clone(&self.controls)
    }

    pub fn set_muted(&self, muted: bool) {
        self.controls.set_muted(muted);
        if muted {
            self.controls.set_gate_open(false);
        }
    }

    pub fn has_camera(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_screen(&self) -> bool {
        self.screen.is_some()
    }

    /// Open the camera. Returns the existing track when already enabled.
    pub async fn enable_camera(&mut self) -> Result<MediaTrack, MediaError> {
        if let Some(track) = &self.video {
            return Ok(track.clone());
        }
        let device = self.devices.open_camera(&self.config.camera).await?;
        let track = MediaTrack::video(device.id(), MediaKind::Video);
        self.tracks.camera = Some(device);
        self.video = Some(track.clone());
        debug!(track = %track.id, "camera enabled");
        Ok(track)
    }

    /// Returns whether a camera was running.
    pub fn disable_camera(&mut self) -> bool {
        self.video = None;
        match self.tracks.camera.take() {
            Some(device) => {
                device.stop();
                debug!("camera disabled");
                true
            }
            None => false,
        }
    }

    pub async fn enable_screen(&mut self) -> Result<MediaTrack, MediaError> {
        if let Some(track) = &self.screen {
            return Ok(track.clone());
        }
        let device = self.devices.open_screen(&self.config.screen).await?;
        let track = MediaTrack::video(device.id(), MediaKind::Screen);
        self.tracks.screen = Some(device);
        self.screen = Some(track.clone());
        debug!(track = %track.id, "screen share enabled");
        Ok(track)
    }

    pub fn disable_screen(&mut self) -> bool {
        self.screen = None;
        match self.tracks.screen.take() {
            Some(device) => {
                device.stop();
                debug!("screen share disabled");
                true
            }
            None => false,
        }
    }

    /// Stop processing and release every device. Idempotent.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.tracks.stop_all();
        self.tracks = AcquiredTracks::default();
        self.audio = None;
        self.video = None;
        self.screen = None;
        info!("local media pipeline torn down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for LocalMediaPipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn process_loop(
    mut raw: mpsc::Receiver<Vec<f32>>,
    mut graph: ProcessingGraph,
    sample_rate: u32,
    output_tx: broadcast::Sender<AudioFrame>,
    tap_tx: broadcast::Sender<AudioFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            block = raw.recv() => match block {
                Some(samples) => {
                    let processed = graph.process(&samples);
                    // No subscribers is not an error here.
                    let _ = tap_tx.send(AudioFrame::new(processed.analysis, sample_rate));
                    let _ = output_tx.send(AudioFrame::new(processed.output, sample_rate));
                }
                None => {
                    debug!("microphone stream ended");
                    break;
                }
            },
        }
    }
}
