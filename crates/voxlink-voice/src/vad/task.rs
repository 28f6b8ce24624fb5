use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::analyzer::{AnalyzerSettings, SpectrumAnalyzer};
use super::detector::SpeakingDetector;
use super::{SpeakingEdge, StreamId};
use crate::media::{AudioFrame, PipelineControls};

/// Ticks without any frame after which the stream is treated as silent.
const IDLE_TICKS: u32 = 5;

pub(crate) struct LoopSettings {
    pub tick: Duration,
    pub analyzer: AnalyzerSettings,
    pub detector: SpeakingDetector,
}

/// A running analysis loop.
pub(crate) struct AnalysisTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AnalysisTask {
    pub fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Spawn a loop sampling `frames` every tick.
///
/// With `controls` set the loop drives the local noise gate and follows the
/// user-adjustable threshold.
pub(crate) fn spawn(
    stream: StreamId,
    frames: broadcast::Receiver<AudioFrame>,
    settings: LoopSettings,
    controls: Option<Arc<PipelineControls>>,
    edges: mpsc::UnboundedSender<SpeakingEdge>,
) -> AnalysisTask {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run(stream, frames, settings, controls, edges, cancel.clone()));
    AnalysisTask { cancel, handle }
}

async fn run(
    stream: StreamId,
    mut frames: broadcast::Receiver<AudioFrame>,
    settings: LoopSettings,
    controls: Option<Arc<PipelineControls>>,
    edges: mpsc::UnboundedSender<SpeakingEdge>,
    cancel: CancellationToken,
) {
    let LoopSettings {
        tick,
        analyzer: analyzer_settings,
        mut detector,
    } = settings;
    let mut analyzer: Option<SpectrumAnalyzer> = None;
    let mut idle_ticks = 0u32;
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    idle_ticks = 0;
                    analyzer
                        .get_or_insert_with(|| SpectrumAnalyzer::new(&analyzer_settings, frame.sample_rate))
                        .push(&frame.samples);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(%stream, skipped, "analysis lagged behind audio");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(%stream, "audio stream closed, stopping analysis");
                    break;
                }
            },
            _ = ticker.tick() => {
                idle_ticks = idle_ticks.saturating_add(1);
                let level = match analyzer.as_mut() {
                    Some(a) if idle_ticks <= IDLE_TICKS => a.level(),
                    _ => 0.0,
                };
                if let Some(c) = &controls {
                    detector.set_threshold(c.gate_threshold());
                }
                if let Some(speaking) = detector.update(level) {
                    if let Some(c) = &controls {
                        c.set_gate_open(speaking);
                    }
                    trace!(%stream, speaking, level, "speaking edge");
                    if edges.send(SpeakingEdge { stream: stream.clone(), speaking }).is_err() {
                        break;
                    }
                }
            }
        }
    }
}
