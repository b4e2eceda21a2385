//! Tooling view of a decoded song.
//!
//! `song_info` decodes an EGS blob without rendering it and returns a
//! serializable summary — the decoded channel recipes plus a static walk
//! of the event stream. Editors and asset pipelines consume this as JSON.

use serde::Serialize;

use crate::dsp::channel::{ChannelConfig, VoiceKind};
use crate::dsp::envelope::EnvelopeConfig;
use crate::dsp::oscillator::OscParams;
use crate::dsp::wave::shared_sine;
use crate::error::DecodeError;
use crate::format::{ByteReader, MAGIC};

/// Summary of one decoded channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub chid: u8,
    pub kind: VoiceKind,
    pub trim: f32,
    pub pan: i8,
    pub wheel_range_cents: f32,
    pub level_env: Option<EnvelopeConfig>,
    pub pitch_lfo: Option<OscParams>,
    pub drum_notes: usize,
    pub pipe_ops: usize,
}

impl ChannelInfo {
    fn from_config(cfg: &ChannelConfig) -> Self {
        ChannelInfo {
            chid: cfg.chid,
            kind: cfg.kind,
            trim: cfg.trim,
            pan: cfg.pan,
            wheel_range_cents: cfg.wheel_range_cents,
            level_env: cfg.level_env.as_deref().cloned(),
            pitch_lfo: cfg.pitch_lfo,
            drum_notes: cfg.drums.len(),
            pipe_ops: cfg.pipe_ops.len(),
        }
    }
}

/// Summary of a whole song/sound-effect blob.
#[derive(Debug, Clone, Serialize)]
pub struct SongInfo {
    pub channels: Vec<ChannelInfo>,
    pub notes: usize,
    pub wheel_events: usize,
    /// Sum of all scheduled delays, in milliseconds.
    pub total_delay_ms: u64,
    /// The event stream ended at malformed data rather than a terminator.
    pub truncated: bool,
}

/// Decode a blob into its tooling summary. Envelope times are reported in
/// frames at `sample_rate`, matching what playback would use.
pub fn song_info(data: &[u8], sample_rate: u32) -> Result<SongInfo, DecodeError> {
    let sine = shared_sine();
    let mut r = ByteReader::new(data);
    if r.read_bytes(MAGIC.len())? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let count = r.read_u8()?;
    if count == 0 || count as usize > crate::dsp::channel::CHANNEL_COUNT {
        return Err(DecodeError::BadChannelCount { count });
    }

    let mut channels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let cfg = ChannelConfig::decode(&mut r, sample_rate, &sine)?;
        channels.push(ChannelInfo::from_config(&cfg));
    }

    let stream = r.read_bytes(r.remaining())?;
    let mut info = SongInfo {
        channels,
        notes: 0,
        wheel_events: 0,
        total_delay_ms: 0,
        truncated: false,
    };

    let mut cursor = 0usize;
    while cursor < stream.len() {
        let b = stream[cursor];
        match b >> 6 {
            0b00 if b == 0 => break,
            0b00 => {
                info.total_delay_ms += (b & 0x3f) as u64;
                cursor += 1;
            }
            0b01 => {
                info.total_delay_ms += (b & 0x3f) as u64 * 64;
                cursor += 1;
            }
            0b10 => {
                if cursor + 3 > stream.len() || stream[cursor + 1] & 0x80 != 0 {
                    info.truncated = true;
                    break;
                }
                info.notes += 1;
                cursor += 3;
            }
            _ => {
                if b & 0x30 != 0 || cursor + 2 > stream.len() {
                    info.truncated = true;
                    break;
                }
                info.wheel_events += 1;
                cursor += 2;
            }
        }
    }

    Ok(info)
}
