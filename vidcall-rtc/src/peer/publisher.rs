//! Publisher-side track management
//!
//! Owns the audio and video send transceivers, derives simulcast encodings
//! from the target resolution and describes the published tracks for the
//! SFU `SetPublisher` call.

use super::{
    LocalTrackSpec, MediaKind, PeerConnectionSession, SendEncoding, TransceiverId,
};
use crate::config::MediaSessionConfig;
use crate::error::Result;
use crate::media::MediaInputState;
use crate::sdp;
use crate::types::VideoResolution;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vidcall_proto::models::{TrackInfo, VideoLayer};
use vidcall_proto::{TrackId, TrackType, VideoQuality};

const AUDIO_RID: &str = "a";
const FULL_RID: &str = "f";
const HALF_RID: &str = "h";
const QUARTER_RID: &str = "q";
const DEFAULT_LAYER_FPS: u32 = 30;

/// Publishing parameters taken from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub enable_red: bool,
    pub audio_max_bitrate: u32,
    pub max_resolution: VideoResolution,
    pub frame_rate: u32,
    pub video_max_bitrate: u32,
    pub preferred_video_codec: String,
}

impl From<&MediaSessionConfig> for PublisherSettings {
    fn from(config: &MediaSessionConfig) -> Self {
        Self {
            enable_red: config.audio.enable_red,
            audio_max_bitrate: config.audio.max_bitrate,
            max_resolution: config.video.publisher_max_resolution,
            frame_rate: config.video.publisher_frame_rate,
            video_max_bitrate: config.video.max_bitrate,
            preferred_video_codec: config.video.preferred_codec.clone(),
        }
    }
}

impl PublisherSettings {
    /// Resolution the full simulcast layer is encoded at
    ///
    /// Inputs smaller than [`VideoResolution::MINIMUM_SAFE_TARGET`] in either
    /// dimension are raised to it; otherwise the configured maximum applies.
    #[must_use]
    pub fn target_resolution(&self, input: &MediaInputState) -> VideoResolution {
        if let Some(video) = &input.video {
            let floor = VideoResolution::MINIMUM_SAFE_TARGET;
            if video.width < floor.width || video.height < floor.height {
                return floor;
            }
        }
        self.max_resolution
    }

    #[must_use]
    pub fn target_frame_rate(&self, input: &MediaInputState) -> u32 {
        input
            .video
            .as_ref()
            .map_or(self.frame_rate, |video| video.frame_rate)
    }

    #[must_use]
    pub fn audio_encodings(&self) -> Vec<SendEncoding> {
        vec![SendEncoding {
            rid: AUDIO_RID.to_string(),
            max_bitrate: self.audio_max_bitrate,
            max_framerate: None,
            scale_resolution_down_by: 1.0,
        }]
    }

    /// Quarter, half and full layers, in that order
    #[must_use]
    pub fn video_encodings(&self, frame_rate: u32) -> Vec<SendEncoding> {
        [(QUARTER_RID, 4.0, 4), (HALF_RID, 2.0, 2), (FULL_RID, 1.0, 1)]
            .into_iter()
            .map(|(rid, scale, divisor)| SendEncoding {
                rid: rid.to_string(),
                max_bitrate: self.video_max_bitrate / divisor,
                max_framerate: Some(frame_rate),
                scale_resolution_down_by: scale,
            })
            .collect()
    }

    fn quality_for(&self, encoding: &SendEncoding) -> VideoQuality {
        if encoding.rid.is_empty() {
            return if encoding.max_bitrate == self.video_max_bitrate {
                VideoQuality::High
            } else if encoding.max_bitrate == self.video_max_bitrate / 2 {
                VideoQuality::Mid
            } else {
                VideoQuality::LowUnspecified
            };
        }

        match encoding.rid.as_str() {
            FULL_RID => VideoQuality::High,
            HALF_RID => VideoQuality::Mid,
            _ => VideoQuality::LowUnspecified,
        }
    }

    /// Layer descriptors announced to the SFU for `encodings`
    #[must_use]
    pub fn video_layers(
        &self,
        encodings: &[SendEncoding],
        target: VideoResolution,
    ) -> Vec<VideoLayer> {
        encodings
            .iter()
            .map(|encoding| {
                let dimension = target.scaled_down(encoding.scale_resolution_down_by);
                VideoLayer {
                    rid: if encoding.rid.is_empty() {
                        FULL_RID.to_string()
                    } else {
                        encoding.rid.clone()
                    },
                    video_dimension: dimension.into(),
                    bitrate: encoding.max_bitrate,
                    fps: encoding.max_framerate.unwrap_or(DEFAULT_LAYER_FPS),
                    quality: self.quality_for(encoding),
                }
            })
            .collect()
    }
}

#[derive(Debug)]
struct SendSlot {
    transceiver: TransceiverId,
    track: Option<LocalTrackSpec>,
    encodings: Vec<SendEncoding>,
}

#[derive(Debug, Default)]
struct PublisherTracks {
    audio: Option<SendSlot>,
    video: Option<SendSlot>,
    video_target: Option<VideoResolution>,
}

/// Send-only connection and its local tracks
pub struct Publisher {
    session: Arc<PeerConnectionSession>,
    settings: PublisherSettings,
    audio_stream_id: String,
    video_stream_id: String,
    tracks: Mutex<PublisherTracks>,
}

impl Publisher {
    #[must_use]
    pub fn new(session: Arc<PeerConnectionSession>, settings: PublisherSettings) -> Self {
        Self {
            session,
            settings,
            audio_stream_id: Uuid::new_v4().to_string(),
            video_stream_id: Uuid::new_v4().to_string(),
            tracks: Mutex::new(PublisherTracks::default()),
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<PeerConnectionSession> {
        &self.session
    }

    #[must_use]
    pub const fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Stream id the video track is announced under in local offers
    #[must_use]
    pub fn video_stream_id(&self) -> &str {
        &self.video_stream_id
    }

    pub async fn init_tracks(&self, input: &MediaInputState) -> Result<()> {
        self.replace_audio_track(input).await?;
        self.replace_video_track(input).await
    }

    pub async fn replace_audio_track(&self, input: &MediaInputState) -> Result<()> {
        let encodings = self.settings.audio_encodings();
        let mut tracks = self.tracks.lock().await;
        let created = self
            .replace_track(
                &mut tracks.audio,
                MediaKind::Audio,
                &self.audio_stream_id,
                input.is_audio_active(),
                encodings,
            )
            .await?;

        if created && self.settings.enable_red {
            if let Some(slot) = &tracks.audio {
                self.force_codec(slot.transceiver, MediaKind::Audio, "red").await?;
            }
        }
        Ok(())
    }

    pub async fn replace_video_track(&self, input: &MediaInputState) -> Result<()> {
        let target = self.settings.target_resolution(input);
        let encodings = self
            .settings
            .video_encodings(self.settings.target_frame_rate(input));
        let mut tracks = self.tracks.lock().await;
        let created = self
            .replace_track(
                &mut tracks.video,
                MediaKind::Video,
                &self.video_stream_id,
                input.is_video_active(),
                encodings,
            )
            .await?;
        tracks.video_target = Some(target);

        if created {
            if let Some(slot) = &tracks.video {
                let codec = self.settings.preferred_video_codec.clone();
                self.force_codec(slot.transceiver, MediaKind::Video, &codec).await?;
            }
        }
        Ok(())
    }

    /// Returns `true` when a transceiver was created
    async fn replace_track(
        &self,
        slot: &mut Option<SendSlot>,
        kind: MediaKind,
        stream_id: &str,
        is_active: bool,
        encodings: Vec<SendEncoding>,
    ) -> Result<bool> {
        self.session.ensure_live()?;
        let pc = self.session.connection();

        if !is_active {
            if let Some(existing) = slot.as_mut() {
                if existing.track.take().is_some() {
                    pc.remove_sender_track(existing.transceiver).await?;
                    self.session.ensure_live()?;
                    debug!(?kind, "Cleared publisher track");
                }
            }
            return Ok(false);
        }

        let track = LocalTrackSpec {
            kind,
            track_id: Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
        };

        match slot.as_mut() {
            None => {
                let transceiver = pc.add_send_transceiver(track.clone(), &encodings).await?;
                self.session.ensure_live()?;
                info!(?kind, track_id = %track.track_id, "Created publisher transceiver");
                *slot = Some(SendSlot {
                    transceiver,
                    track: Some(track),
                    encodings,
                });
                Ok(true)
            }
            Some(existing) => {
                if existing.track.take().is_some() {
                    pc.remove_sender_track(existing.transceiver).await?;
                    self.session.ensure_live()?;
                }
                pc.replace_sender_track(existing.transceiver, Some(track.clone()))
                    .await?;
                self.session.ensure_live()?;
                debug!(?kind, track_id = %track.track_id, "Replaced publisher track");
                existing.track = Some(track);
                existing.encodings = encodings;
                Ok(false)
            }
        }
    }

    /// Put `codec` first in the transceiver preferences. A codec the engine
    /// does not offer is not an error.
    async fn force_codec(
        &self,
        transceiver: TransceiverId,
        kind: MediaKind,
        codec: &str,
    ) -> Result<()> {
        let pc = self.session.connection();
        let capabilities = pc.codec_capabilities(kind);
        let (mut preferred, others): (Vec<_>, Vec<_>) =
            capabilities.into_iter().partition(|c| c.matches(codec));

        if preferred.is_empty() {
            warn!(?kind, codec, "Codec not supported, keeping default preferences");
            return Ok(());
        }

        preferred.extend(others);
        pc.set_codec_preferences(transceiver, preferred).await?;
        self.session.ensure_live()
    }

    pub async fn has_audio_track(&self) -> bool {
        self.tracks
            .lock()
            .await
            .audio
            .as_ref()
            .is_some_and(|s| s.track.is_some())
    }

    pub async fn has_video_track(&self) -> bool {
        self.tracks
            .lock()
            .await
            .video
            .as_ref()
            .is_some_and(|s| s.track.is_some())
    }

    /// Describe the sending transceivers for `SetPublisher`
    ///
    /// Transceivers without a negotiated mid are skipped. The video track id
    /// is the one the offer announces for the video stream.
    pub async fn track_infos(&self, offer_sdp: &str) -> Result<Vec<TrackInfo>> {
        let transceivers = self.session.connection().transceivers().await;
        self.session.ensure_live()?;
        let tracks = self.tracks.lock().await;

        let mut infos = Vec::with_capacity(transceivers.len());
        for transceiver in transceivers {
            let Some(track_id) = transceiver.track_id else {
                continue;
            };
            let Some(mid) = transceiver.mid else {
                warn!(
                    transceiver = transceiver.id,
                    kind = ?transceiver.kind,
                    "Transceiver has no mid after negotiation, skipping"
                );
                continue;
            };

            let info = match transceiver.kind {
                MediaKind::Audio => TrackInfo {
                    track_id: TrackId::new(track_id),
                    track_type: TrackType::Audio,
                    mid,
                    layers: Vec::new(),
                },
                MediaKind::Video => {
                    let track_id = sdp::extract_track_id(offer_sdp, &self.video_stream_id)
                        .map_or(track_id, str::to_string);
                    let layers = match &tracks.video {
                        Some(slot) => self.settings.video_layers(
                            &slot.encodings,
                            tracks.video_target.unwrap_or(self.settings.max_resolution),
                        ),
                        None => Vec::new(),
                    };
                    TrackInfo {
                        track_id: TrackId::new(track_id),
                        track_type: TrackType::Video,
                        mid,
                        layers,
                    }
                }
            };
            infos.push(info);
        }

        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoSource;
    use crate::test_helpers::{FakePeerConnection, PcCall};
    use vidcall_proto::{PeerType, VideoDimension};

    fn settings() -> PublisherSettings {
        PublisherSettings::from(&MediaSessionConfig::default())
    }

    fn camera(width: u32, height: u32) -> MediaInputState {
        MediaInputState {
            video: Some(VideoSource {
                device_id: "cam".to_string(),
                width,
                height,
                frame_rate: 24,
            }),
            ..MediaInputState::default()
        }
    }

    fn publisher() -> (Arc<FakePeerConnection>, Publisher) {
        let pc = Arc::new(FakePeerConnection::new(PeerType::Publisher));
        let session = Arc::new(PeerConnectionSession::new(PeerType::Publisher, pc.clone()));
        (pc, Publisher::new(session, settings()))
    }

    #[test]
    fn test_small_input_is_clamped_to_safe_floor() {
        let settings = settings();
        assert_eq!(
            settings.target_resolution(&camera(320, 240)),
            VideoResolution::MINIMUM_SAFE_TARGET
        );
        // One small dimension is enough
        assert_eq!(
            settings.target_resolution(&camera(1920, 480)),
            VideoResolution::MINIMUM_SAFE_TARGET
        );
        assert_eq!(
            settings.target_resolution(&camera(1920, 1080)),
            VideoResolution::new(1280, 720)
        );
        assert_eq!(
            settings.target_resolution(&MediaInputState::default()),
            VideoResolution::new(1280, 720)
        );
    }

    #[test]
    fn test_video_encodings_and_layers() {
        let settings = settings();
        let encodings = settings.video_encodings(24);
        let rids: Vec<_> = encodings.iter().map(|e| e.rid.as_str()).collect();
        assert_eq!(rids, vec!["q", "h", "f"]);
        assert_eq!(encodings[0].max_bitrate, 300_000);
        assert_eq!(encodings[1].max_bitrate, 600_000);
        assert_eq!(encodings[2].max_bitrate, 1_200_000);
        assert!(encodings.iter().all(|e| e.max_framerate == Some(24)));

        let layers = settings.video_layers(&encodings, VideoResolution::new(1280, 720));
        assert_eq!(layers[0].video_dimension, VideoDimension::new(320, 180));
        assert_eq!(layers[0].quality, VideoQuality::LowUnspecified);
        assert_eq!(layers[1].video_dimension, VideoDimension::new(640, 360));
        assert_eq!(layers[1].quality, VideoQuality::Mid);
        assert_eq!(layers[2].video_dimension, VideoDimension::new(1280, 720));
        assert_eq!(layers[2].quality, VideoQuality::High);
    }

    #[test]
    fn test_layer_without_rid_uses_bitrate_for_quality() {
        let settings = settings();
        let encoding = SendEncoding {
            rid: String::new(),
            max_bitrate: 600_000,
            max_framerate: None,
            scale_resolution_down_by: 1.0,
        };
        let layers = settings.video_layers(&[encoding], VideoResolution::new(640, 480));
        assert_eq!(layers[0].rid, "f");
        assert_eq!(layers[0].quality, VideoQuality::Mid);
        assert_eq!(layers[0].fps, 30);
    }

    #[tokio::test]
    async fn test_track_replacement_paths() {
        let (pc, publisher) = publisher();
        let mut input = camera(1280, 720);

        // First path creates the transceiver
        publisher.replace_video_track(&input).await.unwrap();
        assert!(publisher.has_video_track().await);
        assert_eq!(pc.transceiver_count(), 1);

        // Device change keeps the transceiver, swaps the sender track
        publisher.replace_video_track(&input).await.unwrap();
        assert_eq!(pc.transceiver_count(), 1);
        let calls = pc.calls();
        let remove_at = calls
            .iter()
            .position(|c| matches!(c, PcCall::RemoveTrack(0)))
            .unwrap();
        let replace_at = calls
            .iter()
            .position(|c| matches!(c, PcCall::ReplaceTrack { transceiver: 0, track_id: Some(_) }))
            .unwrap();
        assert!(remove_at < replace_at);

        // Disabled input clears the track
        input.video_enabled = false;
        publisher.replace_video_track(&input).await.unwrap();
        assert!(!publisher.has_video_track().await);
    }

    #[tokio::test]
    async fn test_codecs_forced_when_available() {
        let (pc, publisher) = publisher();
        let input = MediaInputState {
            audio: Some(crate::media::AudioSource {
                device_id: "mic".to_string(),
                sample_rate: 48_000,
                channels: 1,
            }),
            ..camera(1280, 720)
        };

        publisher.init_tracks(&input).await.unwrap();

        let forced: Vec<_> = pc
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                PcCall::SetCodecPreferences { mime_types, .. } => Some(mime_types[0].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(forced, vec!["audio/red", "video/H264"]);
    }

    #[tokio::test]
    async fn test_missing_codec_keeps_defaults() {
        let (pc, publisher) = publisher();
        pc.set_video_codecs(&["video/VP8"]);

        publisher.replace_video_track(&camera(1280, 720)).await.unwrap();

        assert!(!pc
            .calls()
            .iter()
            .any(|c| matches!(c, PcCall::SetCodecPreferences { .. })));
    }

    #[tokio::test]
    async fn test_track_infos_use_offer_msid_and_skip_missing_mid() {
        let (pc, publisher) = publisher();
        let input = MediaInputState {
            audio: Some(crate::media::AudioSource {
                device_id: "mic".to_string(),
                sample_rate: 48_000,
                channels: 1,
            }),
            ..camera(1280, 720)
        };
        publisher.init_tracks(&input).await.unwrap();
        pc.assign_mids();
        pc.clear_mid(0);

        let offer = format!(
            "v=0\r\na=msid:{} video-track-from-sdp\r\n",
            publisher.video_stream_id()
        );
        let infos = publisher.track_infos(&offer).await.unwrap();

        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].track_type, TrackType::Video);
        assert_eq!(infos[0].track_id.as_str(), "video-track-from-sdp");
        assert_eq!(infos[0].mid, "1");
        assert_eq!(infos[0].layers.len(), 3);
    }
}
