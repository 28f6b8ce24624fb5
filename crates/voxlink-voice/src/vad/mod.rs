//! Voice-activity detection for the local microphone and every remote
//! audio stream.

mod analyzer;
mod detector;
mod task;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use voxlink_common::UserId;
use voxlink_config::schema::VadConfig;

pub use analyzer::{AnalyzerSettings, SpectrumAnalyzer};
pub use detector::{hold_ticks, SpeakingDetector};

use crate::media::{AudioFrame, PipelineControls};
use task::{AnalysisTask, LoopSettings};

/// Which stream an edge belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamId {
    Local,
    Remote(UserId),
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Local => write!(f, "local"),
            StreamId::Remote(user) => write!(f, "remote:{user}"),
        }
    }
}

/// A speaking state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakingEdge {
    pub stream: StreamId,
    pub speaking: bool,
}

/// Owns one analysis loop per monitored stream.
pub struct VoiceActivityMonitor {
    config: VadConfig,
    edges: mpsc::UnboundedSender<SpeakingEdge>,
    local: Option<AnalysisTask>,
    remote: HashMap<UserId, AnalysisTask>,
}

impl VoiceActivityMonitor {
    pub fn new(config: VadConfig, edges: mpsc::UnboundedSender<SpeakingEdge>) -> Self {
        Self {
            config,
            edges,
            local: None,
            remote: HashMap::new(),
        }
    }

    fn analyzer_settings(&self) -> AnalyzerSettings {
        AnalyzerSettings {
            fft_size: self.config.fft_size,
            band_low_hz: self.config.band_low_hz,
            band_high_hz: self.config.band_high_hz,
            min_db: self.config.min_db,
            max_db: self.config.max_db,
        }
    }

    fn loop_settings(&self, threshold: f64, hold_ms: u64) -> LoopSettings {
        LoopSettings {
            tick: Duration::from_millis(self.config.tick_ms.max(1)),
            analyzer: self.analyzer_settings(),
            detector: SpeakingDetector::new(
                self.config.smoothing as f32,
                threshold as f32,
                hold_ticks(hold_ms, self.config.tick_ms),
            ),
        }
    }

    /// Monitor the local analysis tap. Replaces any previous local loop.
    pub fn start_local(
        &mut self,
        frames: broadcast::Receiver<AudioFrame>,
        controls: Arc<PipelineControls>,
    ) {
        if let Some(old) = self.local.take() {
            old.stop();
        }
        let settings = self.loop_settings(
            f64::from(controls.gate_threshold()),
            self.config.local_hold_ms,
        );
        self.local = Some(task::spawn(
            StreamId::Local,
            frames,
            settings,
            Some(controls),
            self.edges.clone(),
        ));
        debug!("local voice activity monitor started");
    }

    /// Monitor a remote peer's audio. Replaces any previous loop for that peer.
    pub fn start_remote(&mut self, peer: &UserId, frames: broadcast::Receiver<AudioFrame>) {
        self.stop_remote(peer);
        let settings = self.loop_settings(self.config.remote_threshold, self.config.remote_hold_ms);
        let task = task::spawn(
            StreamId::Remote(peer.clone()),
            frames,
            settings,
            None,
            self.edges.clone(),
        );
        self.remote.insert(peer.clone(), task);
        debug!(%peer, "remote voice activity monitor started");
    }

    pub fn stop_remote(&mut self, peer: &UserId) -> bool {
        match self.remote.remove(peer) {
            Some(task) => {
                task.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_local(&mut self) {
        if let Some(task) = self.local.take() {
            task.stop();
        }
    }

    pub fn stop_all(&mut self) {
        self.stop_local();
        for (_, task) in self.remote.drain() {
            task.stop();
        }
    }

    pub fn is_monitoring(&self, stream: &StreamId) -> bool {
        match stream {
            StreamId::Local => self.local.is_some(),
            StreamId::Remote(peer) => self.remote.contains_key(peer),
        }
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}

impl Drop for VoiceActivityMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
