use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Screen => write!(f, "screen"),
        }
    }
}

/// A block of mono PCM samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }
}

/// A media track as seen by peers and sinks.
///
/// Audio tracks carry a broadcast sender; cloning the track and subscribing
/// is how peers and analysers share one stream without owning it.
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    audio: Option<broadcast::Sender<AudioFrame>>,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>, frames: broadcast::Sender<AudioFrame>) -> Self {
        Self {
            id: id.into(),
            kind: MediaKind::Audio,
            audio: Some(frames),
        }
    }

    /// A video or screen track. Frames are carried by the device backend.
    pub fn video(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            audio: None,
        }
    }

    pub fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.audio.as_ref().map(broadcast::Sender::subscribe)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// What to open on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub screen: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            screen: false,
        }
    }
}

/// Immutable snapshot of the pipeline's current outputs.
#[derive(Debug, Clone, Default)]
pub struct MediaOutput {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
    pub screen: Option<MediaTrack>,
}

impl MediaOutput {
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Screen => self.screen.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        [&self.audio, &self.video, &self.screen]
            .into_iter()
            .filter_map(Option::as_ref)
    }
}
