use crate::protocol::SessionDescription;

pub const INBAND_FEC: &str = "useinbandfec=1";

pub const HIGH_QUALITY_AUDIO: &str = "useinbandfec=1; stereo=1; maxaveragebitrate=510000";

/// Asks the far end for stereo Opus at a high target bitrate by extending the
/// codec's `fmtp` line. Leaves the description untouched when the line is
/// missing and returns whether it was changed.
pub fn request_high_quality_audio(description: &mut SessionDescription) -> bool {
    if !description.sdp.contains(INBAND_FEC) {
        return false;
    }
    description.sdp = description.sdp.replacen(INBAND_FEC, HIGH_QUALITY_AUDIO, 1);
    true
}
