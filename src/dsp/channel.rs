//! Channel — one configured voice-generation recipe.
//!
//! A channel decodes its "EGS" channel block once, owns the shared
//! parameters every note on that channel uses (envelopes, wave, FM
//! ratio/range, trim/pan, wheel range), spawns and retires voices on
//! events, and forwards its mixed output through an optional effects pipe.

use std::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, warn};
use serde::Serialize;

use crate::dsp::envelope::EnvelopeConfig;
use crate::dsp::envelope::EnvelopeRunner;
use crate::dsp::oscillator::{Osc, OscParams};
use crate::dsp::pipe::{Pipe, PipeOpBytes};
use crate::dsp::sample::SampleBank;
use crate::dsp::voice::{BlockMods, FmVoice, PcmVoice, SubVoice, Voice, WaveVoice};
use crate::dsp::wave::Wave;
use crate::error::DecodeError;
use crate::format::{ByteReader, tag};

/// Channels per bus (MIDI-style numbering).
pub const CHANNEL_COUNT: usize = 16;

/// Hard cap on concurrently sounding voices per channel. Note requests
/// beyond it are dropped, never evicted — sustain wins over polyphony.
pub const VOICE_LIMIT: usize = 16;

/// Default pitch-wheel range when the header does not specify one.
const DEFAULT_WHEEL_RANGE_CENTS: f32 = 200.0;

/// Pitch-LFO depth full scale, in cents.
const PITCH_LFO_UNIT_CENTS: f32 = 1200.0;

/// The four note-generation algorithms a channel can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VoiceKind {
    Pcm,
    Wave,
    Fm,
    Sub,
}

/// One drum-table entry: note number to sample id, with the trim pair
/// interpolated by note-on velocity.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DrumEntry {
    pub note: u8,
    pub sample_id: u16,
    pub trim_lo: f32,
    pub trim_hi: f32,
}

/// Decoded channel configuration. Immutable once decoded; the runtime
/// [`Channel`] layers its mutable state (wheel, live voices) on top.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub chid: u8,
    pub trim: f32,
    /// Reserved mode/flags byte from the header, carried undecoded.
    pub mode: u8,
    pub pan: i8,
    pub kind: VoiceKind,
    pub wheel_range_cents: f32,
    pub sub_width: f32,
    pub fm_ratio: f32,
    pub fm_range: f32,
    pub level_env: Option<Arc<EnvelopeConfig>>,
    pub pitch_env: Option<Arc<EnvelopeConfig>>,
    pub mod_env: Option<Arc<EnvelopeConfig>>,
    pub pitch_lfo: Option<OscParams>,
    pub fm_lfo: Option<OscParams>,
    pub wave: Option<Arc<Wave>>,
    pub drums: Vec<DrumEntry>,
    pub pipe_ops: Vec<PipeOpBytes>,
}

impl ChannelConfig {
    /// Decode one channel block: fixed header, then tagged fields.
    ///
    /// Unknown tags below 0x60 are skipped; 0x60..=0x7f are rejected as
    /// unknown-critical; 0x80 and above are collected verbatim as pipe ops.
    pub fn decode(r: &mut ByteReader<'_>, sample_rate: u32, sine: &Arc<Wave>) -> Result<Self, DecodeError> {
        let chid = r.read_u8()?;
        if chid as usize >= CHANNEL_COUNT {
            return Err(DecodeError::BadChannelId { chid });
        }
        let trim = r.read_u8()? as f32 / 255.0;
        let mode = r.read_u8()?;
        let body_len = r.read_u24()? as usize;
        let body = r.read_bytes(body_len)?;
        let mut b = ByteReader::new(body);

        let mut trim = trim;
        let mut pan: Option<i8> = None;
        let mut wheel_range: Option<f32> = None;
        let mut sub_width: Option<f32> = None;
        let mut fm: Option<(f32, f32)> = None;
        let mut level_env = None;
        let mut pitch_env = None;
        let mut mod_env = None;
        let mut pitch_lfo = None;
        let mut fm_lfo = None;
        let mut wave: Option<Arc<Wave>> = None;
        let mut drums: Vec<DrumEntry> = Vec::new();
        let mut pipe_ops = Vec::new();

        while !b.is_empty() {
            let t = b.read_u8()?;
            let len = b.read_u8()?;
            let payload = b.read_bytes(len as usize)?;
            let mut p = ByteReader::new(payload);

            if t >= tag::PIPE_BASE {
                pipe_ops.push(PipeOpBytes {
                    opcode: t,
                    payload: payload.to_vec(),
                });
                continue;
            }
            if t >= tag::CRITICAL_BASE {
                return Err(DecodeError::UnknownCriticalTag { tag: t });
            }

            match t {
                tag::TRIM => trim = p.read_u8()? as f32 / 255.0,
                tag::PAN => pan = Some(p.read_i8()?),
                tag::DRUM_TABLE => {
                    if !drums.is_empty() {
                        return Err(DecodeError::DuplicateTag { tag: t });
                    }
                    let count = p.read_u8()?;
                    for _ in 0..count {
                        drums.push(DrumEntry {
                            note: p.read_u8()?,
                            sample_id: p.read_u16()?,
                            trim_lo: p.read_u8()? as f32 / 255.0,
                            trim_hi: p.read_u8()? as f32 / 255.0,
                        });
                    }
                }
                tag::WHEEL_RANGE => wheel_range = Some(p.read_u16()? as f32),
                tag::SUB_WIDTH => sub_width = Some(p.read_u8()? as f32 / 255.0),
                tag::WAVE_SHAPE | tag::HARMONICS => {
                    if wave.is_some() {
                        return Err(DecodeError::DuplicateTag { tag: t });
                    }
                    wave = Some(Arc::new(if t == tag::WAVE_SHAPE {
                        Wave::decode(&mut p, sine)?
                    } else {
                        let count = p.read_u8()?;
                        let mut coeffs = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            coeffs.push(p.read_u16()? as f32 / 65535.0);
                        }
                        Wave::from_harmonics(sine, &coeffs)
                    }));
                }
                tag::FM_RATE_RANGE => {
                    if fm.is_some() {
                        return Err(DecodeError::DuplicateTag { tag: t });
                    }
                    let ratio = p.read_u16()? as f32 / 256.0;
                    let range = p.read_u16()? as f32 / 256.0;
                    fm = Some((ratio, range));
                }
                tag::MOD_ENVELOPE => {
                    decode_env_once(&mut p, sample_rate, &mut mod_env, t)?;
                }
                tag::PITCH_ENVELOPE => {
                    decode_env_once(&mut p, sample_rate, &mut pitch_env, t)?;
                }
                tag::LEVEL_ENVELOPE => {
                    decode_env_once(&mut p, sample_rate, &mut level_env, t)?;
                }
                tag::PITCH_LFO => {
                    if pitch_lfo.is_some() {
                        return Err(DecodeError::DuplicateTag { tag: t });
                    }
                    pitch_lfo = Some(OscParams::decode(&mut p)?);
                }
                tag::FM_LFO => {
                    if fm_lfo.is_some() {
                        return Err(DecodeError::DuplicateTag { tag: t });
                    }
                    fm_lfo = Some(OscParams::decode(&mut p)?);
                }
                _ => {
                    // Unknown non-critical tag: length-prefixed, so skippable.
                    debug!("skipping unknown channel field tag {t:#04x} ({len} bytes)");
                }
            }
        }

        // Voice kind inference: drum wins, then FM, then sub, else wave.
        let kind = if !drums.is_empty() {
            VoiceKind::Pcm
        } else if fm.is_some() {
            VoiceKind::Fm
        } else if sub_width.is_some() {
            VoiceKind::Sub
        } else {
            VoiceKind::Wave
        };

        if kind != VoiceKind::Pcm && level_env.is_none() {
            return Err(DecodeError::MissingLevelEnvelope { chid });
        }

        let wheel_range_cents = if kind == VoiceKind::Pcm {
            0.0
        } else {
            wheel_range.unwrap_or(DEFAULT_WHEEL_RANGE_CENTS)
        };
        let (fm_ratio, fm_range) = fm.unwrap_or((1.0, 0.0));

        Ok(ChannelConfig {
            chid,
            trim,
            mode,
            pan: pan.unwrap_or(0),
            kind,
            wheel_range_cents,
            sub_width: sub_width.unwrap_or(0.0),
            fm_ratio,
            fm_range,
            level_env,
            pitch_env,
            mod_env,
            pitch_lfo,
            fm_lfo,
            wave,
            drums,
            pipe_ops,
        })
    }
}

fn decode_env_once(
    p: &mut ByteReader<'_>,
    sample_rate: u32,
    slot: &mut Option<Arc<EnvelopeConfig>>,
    t: u8,
) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateTag { tag: t });
    }
    *slot = Some(Arc::new(EnvelopeConfig::decode(p, sample_rate)?));
    Ok(())
}

/// A live channel: the decoded configuration plus wheel state, the live
/// voice list, the channel-owned LFOs, and the effects pipe.
pub struct Channel {
    cfg: ChannelConfig,
    sample_rate: u32,
    wave: Arc<Wave>,
    wheel_raw: u16,
    wheel_mult: f32,
    voices: ArrayVec<Voice, VOICE_LIMIT>,
    pipe: Option<Pipe>,
    pitch_lfo: Option<Osc>,
    fm_lfo: Option<Osc>,
    scratch: Vec<f32>,
    pitch_track: Vec<f32>,
    fm_track: Vec<f32>,
    gain_l: f32,
    gain_r: f32,
    noise_seq: u64,
}

impl Channel {
    /// Build the runtime channel; all buffers are sized here so the
    /// render path never allocates.
    pub fn new(
        cfg: ChannelConfig,
        sample_rate: u32,
        sine: &Arc<Wave>,
        limit_frames: usize,
    ) -> Result<Self, DecodeError> {
        let pipe = if cfg.pipe_ops.is_empty() {
            None
        } else {
            Some(Pipe::configure(&cfg.pipe_ops, sample_rate, sine)?)
        };
        let pitch_lfo = cfg
            .pitch_lfo
            .as_ref()
            .map(|p| Osc::new(p, sine.clone(), sample_rate, PITCH_LFO_UNIT_CENTS, 0.0));
        let fm_lfo = cfg
            .fm_lfo
            .as_ref()
            .map(|p| Osc::new(p, sine.clone(), sample_rate, 1.0, 0.0));
        let wave = cfg.wave.clone().unwrap_or_else(|| sine.clone());

        // Equal-power pan; a pan byte of 0 is dead center (forced mono).
        let p = (cfg.pan as f32 / 127.0).clamp(-1.0, 1.0);
        let theta = (p + 1.0) * std::f32::consts::FRAC_PI_4;
        let gain_l = cfg.trim * theta.cos();
        let gain_r = cfg.trim * theta.sin();

        Ok(Channel {
            sample_rate,
            wave,
            wheel_raw: 8192,
            wheel_mult: 1.0,
            voices: ArrayVec::new(),
            pipe,
            pitch_lfo,
            fm_lfo,
            scratch: vec![0.0; limit_frames],
            pitch_track: vec![0.0; limit_frames],
            fm_track: vec![0.0; limit_frames],
            gain_l,
            gain_r,
            noise_seq: 0,
            cfg,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.cfg
    }

    pub fn live_voices(&self) -> usize {
        self.voices.len()
    }

    /// Spawn one voice of the configured kind.
    ///
    /// Out-of-range notes, undefined drum samples, and the voice ceiling
    /// all drop the request (logged); they never fail the render.
    pub fn begin_note(
        &mut self,
        note: u8,
        velocity: f32,
        duration_frames: u32,
        bank: &SampleBank,
        note_freqs: &[f32; 128],
    ) {
        if note >= 128 {
            warn!("channel {}: note {note} out of range, dropped", self.cfg.chid);
            return;
        }
        self.voices.retain(|v| !v.finished());
        if self.voices.is_full() {
            warn!(
                "channel {}: voice limit {VOICE_LIMIT} reached, note {note} dropped",
                self.cfg.chid
            );
            return;
        }

        let velocity = velocity.clamp(0.0, 1.0);
        let voice = match self.cfg.kind {
            VoiceKind::Pcm => {
                let Some(entry) = self.cfg.drums.iter().find(|d| d.note == note) else {
                    debug!("channel {}: no drum mapped to note {note}", self.cfg.chid);
                    return;
                };
                let Some(sample) = bank.get(entry.sample_id) else {
                    warn!(
                        "channel {}: drum sample {} not loaded, note {note} dropped",
                        self.cfg.chid, entry.sample_id
                    );
                    return;
                };
                Voice::Pcm(PcmVoice::new(
                    sample.clone(),
                    self.sample_rate,
                    velocity,
                    entry.trim_lo,
                    entry.trim_hi,
                ))
            }
            VoiceKind::Wave => {
                let Some(level_cfg) = &self.cfg.level_env else {
                    return;
                };
                Voice::Wave(WaveVoice::new(
                    self.wave.clone(),
                    note_freqs[note as usize],
                    self.sample_rate,
                    EnvelopeRunner::new(level_cfg, velocity, duration_frames),
                    self.cfg
                        .pitch_env
                        .as_ref()
                        .map(|e| EnvelopeRunner::new(e, velocity, duration_frames)),
                ))
            }
            VoiceKind::Fm => {
                let Some(level_cfg) = &self.cfg.level_env else {
                    return;
                };
                Voice::Fm(FmVoice::new(
                    note_freqs[note as usize],
                    self.sample_rate,
                    self.cfg.fm_ratio,
                    self.cfg.fm_range,
                    EnvelopeRunner::new(level_cfg, velocity, duration_frames),
                    self.cfg
                        .mod_env
                        .as_ref()
                        .map(|e| EnvelopeRunner::new(e, velocity, duration_frames)),
                    self.cfg
                        .pitch_env
                        .as_ref()
                        .map(|e| EnvelopeRunner::new(e, velocity, duration_frames)),
                ))
            }
            VoiceKind::Sub => {
                let Some(level_cfg) = &self.cfg.level_env else {
                    return;
                };
                self.noise_seq += 1;
                let seed = (self.cfg.chid as u64) << 56 | self.noise_seq;
                Voice::Sub(SubVoice::new(
                    seed,
                    self.cfg.sub_width,
                    EnvelopeRunner::new(level_cfg, velocity, duration_frames),
                ))
            }
        };
        self.voices.push(voice);
    }

    /// Update the cached pitch multiplier from a 14-bit wheel value.
    /// Live voices pick it up on their next block; recomputed only on
    /// actual change.
    pub fn set_wheel(&mut self, value: u16) {
        let value = value.min(0x3fff);
        if value == self.wheel_raw {
            return;
        }
        self.wheel_raw = value;
        let bend = (value as f32 - 8192.0) / 8192.0;
        self.wheel_mult = (self.cfg.wheel_range_cents * bend / 1200.0).exp2();
    }

    pub fn wheel_mult(&self) -> f32 {
        self.wheel_mult
    }

    /// Release every live voice (raw-event note-off path).
    pub fn release_all(&mut self) {
        for v in &mut self.voices {
            v.release();
        }
    }

    /// Render `frames` of this channel and mix into the interleaved
    /// stereo accumulation buffer `out` (length `2 * frames`).
    pub fn update(&mut self, out: &mut [f32], frames: usize) {
        debug_assert!(frames <= self.scratch.len());
        debug_assert!(out.len() >= frames * 2);

        // LFO phases always advance so rendering stays independent of
        // chunking and voice lifetimes.
        if let Some(lfo) = &mut self.pitch_lfo {
            lfo.update(&mut self.pitch_track, frames);
        }
        if let Some(lfo) = &mut self.fm_lfo {
            lfo.update(&mut self.fm_track, frames);
        }

        self.scratch[..frames].fill(0.0);
        let mods = BlockMods {
            pitch_lfo: self.pitch_lfo.is_some().then(|| &self.pitch_track[..frames]),
            fm_lfo: self.fm_lfo.is_some().then(|| &self.fm_track[..frames]),
            wheel: self.wheel_mult,
        };
        for v in &mut self.voices {
            v.update(&mut self.scratch[..frames], &mods);
        }
        self.voices.retain(|v| !v.finished());

        if let Some(pipe) = &mut self.pipe {
            pipe.update(&mut self.scratch, frames);
        }

        for i in 0..frames {
            out[2 * i] += self.scratch[i] * self.gain_l;
            out[2 * i + 1] += self.scratch[i] * self.gain_r;
        }
    }
}
