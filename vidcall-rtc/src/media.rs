//! Local media input capability
//!
//! The host owns device selection; the orchestrator only observes the
//! current sources and enabled flags through a `watch` channel and rebuilds
//! publisher tracks when they change.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSource {
    pub device_id: String,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Snapshot of what the publisher should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInputState {
    pub audio: Option<AudioSource>,
    pub video: Option<VideoSource>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Default for MediaInputState {
    fn default() -> Self {
        Self {
            audio: None,
            video: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl MediaInputState {
    /// A track is sent only when a source exists and it is enabled
    #[must_use]
    pub const fn is_audio_active(&self) -> bool {
        self.audio.is_some() && self.audio_enabled
    }

    #[must_use]
    pub const fn is_video_active(&self) -> bool {
        self.video.is_some() && self.video_enabled
    }
}

/// Shared handle to the current media input
#[derive(Debug, Clone)]
pub struct MediaInputProvider {
    tx: Arc<watch::Sender<MediaInputState>>,
}

impl Default for MediaInputProvider {
    fn default() -> Self {
        Self::new(MediaInputState::default())
    }
}

impl MediaInputProvider {
    #[must_use]
    pub fn new(initial: MediaInputState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn current(&self) -> MediaInputState {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MediaInputState> {
        self.tx.subscribe()
    }

    pub fn set_audio_input(&self, audio: Option<AudioSource>) {
        self.update(|state| {
            if state.audio == audio {
                return false;
            }
            state.audio = audio;
            true
        });
    }

    pub fn set_video_input(&self, video: Option<VideoSource>) {
        self.update(|state| {
            if state.video == video {
                return false;
            }
            state.video = video;
            true
        });
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.update(|state| std::mem::replace(&mut state.audio_enabled, enabled) != enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.update(|state| std::mem::replace(&mut state.video_enabled, enabled) != enabled);
    }

    fn update(&self, modify: impl FnOnce(&mut MediaInputState) -> bool) {
        self.tx.send_if_modified(modify);
    }
}
