//! Microphone capture and remote audio playback through cpal.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread and is
//! dropped when that thread is told to stop. Capture converts whatever the
//! device hands us into mono `f32` blocks of `frame_ms`; playback mixes every
//! attached peer into the default output device.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxlink_common::{MediaError, UserId};
use voxlink_config::schema::{AudioConfig, VideoCaptureConfig};

use crate::media::{DeviceTrack, MediaDevices, MediaKind, MediaTrack};
use crate::peer::RemoteMediaSink;

const CAPTURE_QUEUE: usize = 64;
/// Per-peer playback backlog, in seconds of audio.
const MAX_BACKLOG_SECS: usize = 1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Map a cpal error message onto the device error callers can act on.
fn classify(context: &str, err: impl std::fmt::Display) -> MediaError {
    let message = format!("{context}: {err}");
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        MediaError::PermissionDenied(message)
    } else {
        MediaError::DeviceUnavailable(message)
    }
}

/// Average interleaved frames down to one channel.
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Cuts a continuous sample stream into fixed-length blocks.
#[derive(Debug)]
struct BlockChunker {
    block: usize,
    pending: Vec<f32>,
}

impl BlockChunker {
    fn new(block: usize) -> Self {
        let block = block.max(1);
        Self {
            block,
            pending: Vec::with_capacity(block * 2),
        }
    }

    fn push(&mut self, samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.block {
            let rest = self.pending.split_off(self.block);
            emit(std::mem::replace(&mut self.pending, rest));
        }
    }
}

/// Default-device capture through the platform's cpal host.
#[derive(Debug, Default)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn open_microphone(&self, config: &AudioConfig) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        let sample_rate = config.sample_rate;
        let block = (sample_rate as usize * config.frame_ms as usize) / 1000;
        let (samples_tx, samples_rx) = mpsc::channel(CAPTURE_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("voxlink-mic".into())
            .spawn(move || {
                let stream = match open_input(sample_rate, block, samples_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until stop() or the track is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("microphone stream closed");
            })
            .map_err(|e| classify("failed to spawn capture thread", e))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(MediaError::DeviceUnavailable("capture thread exited".into())),
        }
        info!(sample_rate, block, "microphone opened");
        Ok(Arc::new(CpalTrack {
            id: "cpal-microphone".into(),
            samples: Mutex::new(Some(samples_rx)),
            stop: Mutex::new(Some(stop_tx)),
            stopped: AtomicBool::new(false),
        }))
    }

    async fn open_camera(&self, _config: &VideoCaptureConfig) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        Err(MediaError::DeviceUnavailable("camera capture is not supported by the cpal backend".into()))
    }

    async fn open_screen(&self, _config: &VideoCaptureConfig) -> Result<Arc<dyn DeviceTrack>, MediaError> {
        Err(MediaError::DeviceUnavailable("screen capture is not supported by the cpal backend".into()))
    }
}

fn open_input(sample_rate: u32, block: usize, samples: mpsc::Sender<Vec<f32>>) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no input audio device available".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| classify("failed to read input config", e))?;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, block, samples),
        cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, block, samples),
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, block, samples),
        other => {
            return Err(MediaError::DeviceUnavailable(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    }?;
    stream.play().map_err(|e| classify("failed to start input stream", e))?;
    Ok(stream)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    block: usize,
    samples: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut chunker = BlockChunker::new(block);
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                chunker.push(&downmix(data, channels), |block| {
                    // A full queue means the pipeline is behind; drop rather than block the device.
                    let _ = samples.try_send(block);
                });
            },
            |err| warn!(error = %err, "input stream error"),
            None,
        )
        .map_err(|e| classify("failed to build input stream", e))
}

/// A live microphone stream.
pub struct CpalTrack {
    id: String,
    samples: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
    stopped: AtomicBool,
}

impl DeviceTrack for CpalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn take_samples(&self) -> Option<mpsc::Receiver<Vec<f32>>> {
        lock(&self.samples).take()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for CpalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
struct PeerVoice {
    queue: VecDeque<f32>,
    volume: f32,
    muted: bool,
}

impl Default for PeerVoice {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            volume: 1.0,
            muted: false,
        }
    }
}

/// Per-peer jitter queues summed into one mono output.
#[derive(Debug)]
struct Mixer {
    capacity: usize,
    voices: HashMap<UserId, PeerVoice>,
}

impl Mixer {
    fn new(sample_rate: u32) -> Self {
        Self {
            capacity: sample_rate as usize * MAX_BACKLOG_SECS,
            voices: HashMap::new(),
        }
    }

    fn push(&mut self, peer: &UserId, samples: &[f32]) {
        let voice = self.voices.entry(peer.clone()).or_default();
        voice.queue.extend(samples.iter().copied());
        // Keep latency bounded by dropping the oldest audio.
        let excess = voice.queue.len().saturating_sub(self.capacity);
        voice.queue.drain(..excess);
    }

    fn remove(&mut self, peer: &UserId) {
        self.voices.remove(peer);
    }

    fn set_volume(&mut self, peer: &UserId, volume: f32) {
        self.voices.entry(peer.clone()).or_default().volume = volume.max(0.0);
    }

    fn set_muted(&mut self, peer: &UserId, muted: bool) {
        self.voices.entry(peer.clone()).or_default().muted = muted;
    }

    /// Fill an interleaved output buffer, duplicating the mono mix per channel.
    fn fill(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in out.chunks_mut(channels) {
            let mut mixed = 0.0;
            for voice in self.voices.values_mut() {
                let Some(sample) = voice.queue.pop_front() else {
                    continue;
                };
                if !voice.muted {
                    mixed += sample * voice.volume;
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
        }
    }
}

/// Plays attached remote audio on the default output device.
///
/// Video tracks are accepted and ignored; rendering them belongs to the UI.
pub struct CpalPlayback {
    mixer: Arc<Mutex<Mixer>>,
    readers: Mutex<HashMap<UserId, CancellationToken>>,
    runtime: tokio::runtime::Handle,
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CpalPlayback {
    /// Open the default output device. Must be called inside a tokio runtime.
    pub fn open(sample_rate: u32) -> Result<Self, MediaError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MediaError::DeviceUnavailable(format!("playback needs a tokio runtime: {e}")))?;
        let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate)));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let output_mixer = Arc::clone(&mixer);
        thread::Builder::new()
            .name("voxlink-playback".into())
            .spawn(move || {
                let stream = match open_output(sample_rate, output_mixer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
                debug!("playback stream closed");
            })
            .map_err(|e| classify("failed to spawn playback thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| MediaError::DeviceUnavailable("playback thread exited".into()))??;
        info!(sample_rate, "playback opened");
        Ok(Self {
            mixer,
            readers: Mutex::new(HashMap::new()),
            runtime,
            stop: Mutex::new(Some(stop_tx)),
        })
    }

    fn stop_reader(&self, peer: &UserId) {
        if let Some(token) = lock(&self.readers).remove(peer) {
            token.cancel();
        }
    }
}

fn open_output(sample_rate: u32, mixer: Arc<Mutex<Mixer>>) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no output audio device available".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| classify("failed to read output config", e))?;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, mixer),
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, mixer),
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, mixer),
        other => {
            return Err(MediaError::DeviceUnavailable(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    }?;
    stream.play().map_err(|e| classify("failed to start output stream", e))?;
    Ok(stream)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                scratch.resize(data.len(), 0.0f32);
                lock(&mixer).fill(&mut scratch, channels);
                for (out, sample) in data.iter_mut().zip(&scratch) {
                    *out = T::from_sample(*sample);
                }
            },
            |err| warn!(error = %err, "output stream error"),
            None,
        )
        .map_err(|e| classify("failed to build output stream", e))
}

impl RemoteMediaSink for CpalPlayback {
    fn attach(&self, peer: &UserId, track: &MediaTrack) {
        let Some(mut frames) = track.subscribe_audio() else {
            debug!(%peer, kind = %track.kind, "video track not rendered by audio playback");
            return;
        };
        self.stop_reader(peer);
        let token = CancellationToken::new();
        lock(&self.readers).insert(peer.clone(), token.clone());

        let mixer = Arc::clone(&self.mixer);
        let peer = peer.clone();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Ok(frame) => lock(&mixer).push(&peer, &frame.samples),
                        Err(RecvError::Lagged(n)) => debug!(%peer, skipped = n, "playback lagging"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn detach_track(&self, peer: &UserId, kind: MediaKind) {
        if kind == MediaKind::Audio {
            self.stop_reader(peer);
            lock(&self.mixer).remove(peer);
        }
    }

    fn detach(&self, peer: &UserId) {
        self.stop_reader(peer);
        lock(&self.mixer).remove(peer);
    }

    fn set_volume(&self, peer: &UserId, volume: f32) {
        lock(&self.mixer).set_volume(peer, volume);
    }

    fn set_muted(&self, peer: &UserId, muted: bool) {
        lock(&self.mixer).set_muted(peer, muted);
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        for (_, token) in lock(&self.readers).drain() {
            token.cancel();
        }
        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::from(s)
    }

    #[test]
    fn downmix_averages_each_frame() {
        let stereo = [0.5f32, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);
        let ints = [i16::MAX, i16::MAX];
        let mono = downmix(&ints, 2);
        assert!((mono[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn chunker_carries_remainder_into_the_next_block() {
        let mut chunker = BlockChunker::new(3);
        let mut blocks = Vec::new();
        chunker.push(&[1.0, 2.0], |b| blocks.push(b));
        assert!(blocks.is_empty());
        chunker.push(&[3.0, 4.0, 5.0, 6.0, 7.0], |b| blocks.push(b));
        assert_eq!(blocks, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        chunker.push(&[8.0, 9.0], |b| blocks.push(b));
        assert_eq!(blocks.last(), Some(&vec![7.0, 8.0, 9.0]));
    }

    #[test]
    fn permission_errors_are_told_apart() {
        assert!(matches!(
            classify("open", "Access denied by user"),
            MediaError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("open", "device busy"),
            MediaError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn mixer_sums_peers_and_honours_volume_and_mute() {
        let mut mixer = Mixer::new(48_000);
        let (a, b) = (uid("a"), uid("b"));
        mixer.push(&a, &[0.2, 0.2]);
        mixer.push(&b, &[0.3, 0.3]);
        mixer.set_volume(&b, 2.0);

        let mut out = [0.0f32; 4];
        mixer.fill(&mut out, 2);
        assert!((out[0] - 0.8).abs() < 1e-6);
        assert_eq!(out[0], out[1]);

        mixer.push(&a, &[0.2]);
        mixer.push(&b, &[0.3]);
        mixer.set_muted(&a, true);
        let mut out = [0.0f32; 1];
        mixer.fill(&mut out, 1);
        assert!((out[0] - 0.6).abs() < 1e-6);
        // Muted audio is still consumed so it doesn't replay on unmute.
        assert!(mixer.voices[&a].queue.is_empty());
    }

    #[test]
    fn mixer_clamps_and_bounds_backlog() {
        let mut mixer = Mixer::new(10);
        let a = uid("a");
        mixer.push(&a, &[0.9; 25]);
        assert_eq!(mixer.voices[&a].queue.len(), 10);

        mixer.push(&uid("b"), &[0.9; 10]);
        let mut out = [0.0f32; 1];
        mixer.fill(&mut out, 1);
        assert_eq!(out, [1.0]);
    }

    #[test]
    fn detached_peer_stops_contributing() {
        let mut mixer = Mixer::new(48_000);
        let a = uid("a");
        mixer.push(&a, &[0.5; 4]);
        mixer.remove(&a);
        let mut out = [0.0f32; 4];
        mixer.fill(&mut out, 1);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn stopping_a_track_is_idempotent_and_signals_the_thread() {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let (_tx, rx) = mpsc::channel(1);
        let track = CpalTrack {
            id: "mic".into(),
            samples: Mutex::new(Some(rx)),
            stop: Mutex::new(Some(stop_tx)),
            stopped: AtomicBool::new(false),
        };
        assert!(track.take_samples().is_some());
        assert!(track.take_samples().is_none());
        track.stop();
        track.stop();
        assert!(track.is_stopped());
        assert_eq!(stop_rx.try_iter().count(), 1);
    }
}
