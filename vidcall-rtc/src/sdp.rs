//! SDP rewriting applied to local offers before they are sent
//!
//! - Moves the RED redundancy codec ahead of opus in the audio media line
//! - Turns on opus DTX next to in-band FEC
//!
//! Everything here is a pure function over SDP text.

use std::borrow::Cow;

const AUDIO_MEDIA_LINE: &str = "m=audio";
const OPUS_RTPMAP: &str = " opus/48000/2";
const RED_RTPMAP: &str = " red/48000";
const INBAND_FEC: &str = "useinbandfec=1";
const DTX_FLAG: &str = ";usedtx=1";

/// Leading fields of an m-line before the payload type list
const MEDIA_LINE_FIXED_FIELDS: usize = 3;

/// Rewrite `sdp` according to the enabled features
///
/// Returns the input untouched when both features are off or when there is
/// no audio media line. Line terminators and the presence of a trailing
/// newline are preserved.
#[must_use]
pub fn modify_sdp(sdp: &str, enable_red: bool, enable_dtx: bool) -> Cow<'_, str> {
    if !enable_red && !enable_dtx {
        return Cow::Borrowed(sdp);
    }

    let layout = AudioLayout::parse(sdp);
    let Some(audio_line_index) = layout.audio_line_index else {
        return Cow::Borrowed(sdp);
    };

    let swap = if enable_red {
        layout.opus_before_red()
    } else {
        None
    };

    let mut out = String::with_capacity(sdp.len() + DTX_FLAG.len() * 2);
    for (index, raw) in sdp.split_inclusive('\n').enumerate() {
        let (line, terminator) = split_terminator(raw);

        match swap {
            Some((opus, red)) if index == audio_line_index => {
                out.push_str(&swap_payload_types(line, opus, red));
            }
            _ => out.push_str(line),
        }

        if enable_dtx && line.ends_with(INBAND_FEC) {
            out.push_str(DTX_FLAG);
        }

        out.push_str(terminator);
    }

    Cow::Owned(out)
}

/// Exchange the positions of payload types `a` and `b` in an m-line
///
/// Applying the same swap twice restores the input.
#[must_use]
pub fn swap_payload_types(media_line: &str, a: &str, b: &str) -> String {
    media_line
        .split(' ')
        .enumerate()
        .map(|(i, token)| {
            if i < MEDIA_LINE_FIXED_FIELDS {
                token
            } else if token == a {
                b
            } else if token == b {
                a
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Track id announced for `stream_id` in an `a=msid:<stream> <track>` line
#[must_use]
pub fn extract_track_id<'a>(sdp: &'a str, stream_id: &str) -> Option<&'a str> {
    sdp.lines().find_map(|line| {
        let rest = line.trim_end().strip_prefix("a=msid:")?;
        let (stream, track) = rest.split_once(' ')?;
        (stream == stream_id).then(|| track.trim())
    })
}

/// Payload types listed in an m-line, in preference order
#[must_use]
pub fn media_line_payload_types(media_line: &str) -> Vec<&str> {
    media_line
        .split_whitespace()
        .skip(MEDIA_LINE_FIXED_FIELDS)
        .collect()
}

fn split_terminator(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}

/// Where the audio codecs of interest sit in an SDP document
#[derive(Debug, Default)]
struct AudioLayout<'a> {
    audio_line_index: Option<usize>,
    audio_line: &'a str,
    opus_payload_type: Option<&'a str>,
    red_payload_type: Option<&'a str>,
}

impl<'a> AudioLayout<'a> {
    fn parse(sdp: &'a str) -> Self {
        let mut layout = Self::default();

        for (index, line) in sdp.lines().enumerate() {
            if line.starts_with(AUDIO_MEDIA_LINE) {
                if layout.audio_line_index.is_none() {
                    layout.audio_line_index = Some(index);
                    layout.audio_line = line;
                }
            } else if line.contains(OPUS_RTPMAP) {
                layout.opus_payload_type = layout.opus_payload_type.or(rtpmap_payload_type(line));
            } else if line.contains(RED_RTPMAP) {
                layout.red_payload_type = layout.red_payload_type.or(rtpmap_payload_type(line));
            }
        }

        layout
    }

    /// `(opus, red)` payload types when both exist and opus is listed first
    fn opus_before_red(&self) -> Option<(&'a str, &'a str)> {
        let opus = self.opus_payload_type?;
        let red = self.red_payload_type?;
        let payload_types = media_line_payload_types(self.audio_line);
        let opus_pos = payload_types.iter().position(|pt| *pt == opus)?;
        let red_pos = payload_types.iter().position(|pt| *pt == red)?;
        (opus_pos < red_pos).then_some((opus, red))
    }
}

/// `a=rtpmap:96 opus/48000/2` -> `96`
fn rtpmap_payload_type(line: &str) -> Option<&str> {
    let first = line.trim().split(' ').next()?;
    let (_, payload_type) = first.split_once(':')?;
    (!payload_type.is_empty()).then_some(payload_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=0\r\n\
o=- 5881996535939993027 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 96 97 98 0 8\r\n\
a=mid:0\r\n\
a=msid:stream-a 3c4431fe-audio\r\n\
a=rtpmap:96 opus/48000/2\r\n\
a=fmtp:96 minptime=10;useinbandfec=1\r\n\
a=rtpmap:97 red/48000/2\r\n\
a=fmtp:97 96/96\r\n\
a=rtpmap:98 multiopus/48000/6\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 123 104\r\n\
a=msid:stream-v 6e199c0e-video\r\n\
a=rtpmap:123 H264/90000\r\n";

    fn audio_line(sdp: &str) -> &str {
        sdp.lines()
            .find(|l| l.starts_with("m=audio"))
            .unwrap()
    }

    #[test]
    fn test_red_moves_ahead_of_opus() {
        let modified = modify_sdp(SAMPLE, true, false);
        assert_eq!(
            media_line_payload_types(audio_line(&modified)),
            vec!["97", "96", "98", "0", "8"]
        );
        // Only the m-line changes
        assert_eq!(modified.len(), SAMPLE.len());
        assert!(modified.contains("a=rtpmap:96 opus/48000/2\r\n"));
    }

    #[test]
    fn test_red_already_first_is_left_alone() {
        let once = modify_sdp(SAMPLE, true, false).into_owned();
        let twice = modify_sdp(&once, true, false);
        assert_eq!(twice, once);
    }

    #[test]
    fn test_dtx_appended_after_inband_fec() {
        let modified = modify_sdp(SAMPLE, false, true);
        assert!(modified.contains("a=fmtp:96 minptime=10;useinbandfec=1;usedtx=1\r\n"));
        assert_eq!(
            media_line_payload_types(audio_line(&modified))[0],
            "96",
            "DTX alone must not reorder codecs"
        );
    }

    #[test]
    fn test_disabled_features_borrow_input() {
        assert!(matches!(modify_sdp(SAMPLE, false, false), Cow::Borrowed(_)));
    }

    #[test]
    fn test_no_audio_line_is_identity() {
        let sdp = "v=0\nm=video 9 UDP/TLS/RTP/SAVPF 96\na=fmtp:96 useinbandfec=1\n";
        assert!(matches!(modify_sdp(sdp, true, true), Cow::Borrowed(_)));
    }

    #[test]
    fn test_trailing_newline_shape_preserved() {
        let sdp = "m=audio 9 RTP/SAVPF 111 63\na=rtpmap:111 opus/48000/2\na=rtpmap:63 red/48000/2";
        let modified = modify_sdp(sdp, true, false);
        assert!(!modified.ends_with('\n'));
        assert!(modified.starts_with("m=audio 9 RTP/SAVPF 63 111\n"));
    }

    #[test]
    fn test_swap_is_an_involution() {
        let line = "m=audio 9 UDP/TLS/RTP/SAVPF 96 97 98";
        let swapped = swap_payload_types(line, "96", "97");
        assert_eq!(swapped, "m=audio 9 UDP/TLS/RTP/SAVPF 97 96 98");
        assert_eq!(swap_payload_types(&swapped, "96", "97"), line);
    }

    #[test]
    fn test_swap_ignores_port_field() {
        // Port 9 must not be confused with payload type 9
        let line = "m=audio 9 UDP/TLS/RTP/SAVPF 111 9";
        assert_eq!(
            swap_payload_types(line, "111", "9"),
            "m=audio 9 UDP/TLS/RTP/SAVPF 9 111"
        );
    }

    #[test]
    fn test_extract_track_id() {
        assert_eq!(extract_track_id(SAMPLE, "stream-v"), Some("6e199c0e-video"));
        assert_eq!(extract_track_id(SAMPLE, "stream-a"), Some("3c4431fe-audio"));
        assert_eq!(extract_track_id(SAMPLE, "missing"), None);
    }
}
