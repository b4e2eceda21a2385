//! Voices — one sounding note instance per voice.
//!
//! Four generation algorithms share one additive-update contract:
//! `update` *adds* into the buffer (never overwrites), produces nothing
//! once finished, and `release()` forwards to the contained envelope
//! runners. The set of algorithms is closed, so dispatch is a plain enum.

use std::f64::consts::TAU;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::dsp::envelope::EnvelopeRunner;
use crate::dsp::sample::PcmSample;
use crate::dsp::wave::{TABLE_LEN, Wave};

/// Phase bits below the table index (32-bit accumulator, 1024 table).
const PHASE_SHIFT: u32 = 32 - TABLE_LEN.trailing_zeros();

/// Per-block modulation inputs shared by every voice of a channel:
/// precomputed LFO tracks (one value per frame) and the cached
/// pitch-wheel multiplier.
#[derive(Debug, Clone, Copy)]
pub struct BlockMods<'a> {
    /// Pitch LFO track in cents.
    pub pitch_lfo: Option<&'a [f32]>,
    /// FM LFO track in modulation-index units.
    pub fm_lfo: Option<&'a [f32]>,
    /// Pitch-wheel frequency multiplier.
    pub wheel: f32,
}

impl BlockMods<'_> {
    pub fn none() -> Self {
        BlockMods {
            pitch_lfo: None,
            fm_lfo: None,
            wheel: 1.0,
        }
    }
}

#[inline]
fn cents_to_ratio(cents: f32) -> f32 {
    (cents * (1.0 / 1200.0)).exp2()
}

/// One sounding note.
#[derive(Debug)]
pub enum Voice {
    Pcm(PcmVoice),
    Wave(WaveVoice),
    Fm(FmVoice),
    Sub(SubVoice),
}

impl Voice {
    /// Add this voice's signal into `out[..frames]`.
    pub fn update(&mut self, out: &mut [f32], mods: &BlockMods<'_>) {
        match self {
            Voice::Pcm(v) => v.update(out),
            Voice::Wave(v) => v.update(out, mods),
            Voice::Fm(v) => v.update(out, mods),
            Voice::Sub(v) => v.update(out),
        }
    }

    pub fn release(&mut self) {
        match self {
            Voice::Pcm(v) => v.release(),
            Voice::Wave(v) => v.release(),
            Voice::Fm(v) => v.release(),
            Voice::Sub(v) => v.release(),
        }
    }

    pub fn finished(&self) -> bool {
        match self {
            Voice::Pcm(v) => v.finished,
            Voice::Wave(v) => v.finished,
            Voice::Fm(v) => v.finished,
            Voice::Sub(v) => v.finished,
        }
    }
}

/// Replays a decoded PCM sample once (or looping from its repeat point),
/// scaled by a fixed velocity-interpolated trim.
#[derive(Debug)]
pub struct PcmVoice {
    sample: Arc<PcmSample>,
    position: f64,
    rate_ratio: f64,
    trim: f32,
    looping: bool,
    finished: bool,
}

impl PcmVoice {
    pub fn new(sample: Arc<PcmSample>, out_rate: u32, velocity: f32, trim_lo: f32, trim_hi: f32) -> Self {
        let rate_ratio = sample.sample_rate() as f64 / out_rate as f64;
        let looping = sample.loop_start().is_some();
        PcmVoice {
            finished: sample.is_empty(),
            sample,
            position: 0.0,
            rate_ratio,
            trim: trim_lo + (trim_hi - trim_lo) * velocity.clamp(0.0, 1.0),
            looping,
        }
    }

    fn update(&mut self, out: &mut [f32]) {
        if self.finished {
            return;
        }
        let len = self.sample.len() as f64;
        for s in out.iter_mut() {
            if self.position >= len {
                match self.sample.loop_start() {
                    Some(start) if self.looping => {
                        self.position = start as f64 + (self.position - len);
                    }
                    _ => {
                        self.finished = true;
                        return;
                    }
                }
            }
            *s += self.sample.read_interpolated(self.position) * self.trim;
            self.position += self.rate_ratio;
        }
    }

    /// Percussion has no envelope to release; a looping sample stops
    /// looping and runs out to its end instead.
    fn release(&mut self) {
        self.looping = false;
    }
}

/// Reads the channel wave through a phase accumulator, frequency-modulated
/// by the wheel, the optional pitch envelope, and the optional pitch LFO.
#[derive(Debug)]
pub struct WaveVoice {
    wave: Arc<Wave>,
    phase: u32,
    base_freq: f64,
    inv_rate: f64,
    level: EnvelopeRunner,
    pitch_env: Option<EnvelopeRunner>,
    finished: bool,
}

impl WaveVoice {
    pub fn new(
        wave: Arc<Wave>,
        base_freq: f32,
        sample_rate: u32,
        level: EnvelopeRunner,
        pitch_env: Option<EnvelopeRunner>,
    ) -> Self {
        WaveVoice {
            wave,
            phase: 0,
            base_freq: base_freq as f64,
            inv_rate: 1.0 / sample_rate as f64,
            level,
            pitch_env,
            finished: false,
        }
    }

    fn update(&mut self, out: &mut [f32], mods: &BlockMods<'_>) {
        if self.finished {
            return;
        }
        for (i, s) in out.iter_mut().enumerate() {
            let mut cents = 0.0f32;
            if let Some(env) = &mut self.pitch_env {
                cents += (env.next() - 0.5) * 2400.0;
            }
            if let Some(track) = mods.pitch_lfo {
                cents += track[i];
            }
            let freq = self.base_freq * mods.wheel as f64 * cents_to_ratio(cents) as f64;
            let step = (freq * self.inv_rate * 4_294_967_296.0) as u32;

            let lvl = self.level.next();
            *s += self.wave.at((self.phase >> PHASE_SHIFT) as usize) * lvl;
            self.phase = self.phase.wrapping_add(step);

            if self.level.finished() {
                self.finished = true;
                return;
            }
        }
    }

    fn release(&mut self) {
        self.level.release();
        if let Some(env) = &mut self.pitch_env {
            env.release();
        }
    }
}

/// Two-operator FM: the carrier's rate is deviated by a sine modulator
/// whose own rate is `carrier * ratio`, with the deviation depth driven
/// by the modulation-index envelope and FM LFO.
#[derive(Debug)]
pub struct FmVoice {
    car_phase: f64,
    mod_phase: f64,
    base_freq: f64,
    inv_rate: f64,
    ratio: f64,
    range: f32,
    level: EnvelopeRunner,
    mod_env: Option<EnvelopeRunner>,
    pitch_env: Option<EnvelopeRunner>,
    finished: bool,
}

impl FmVoice {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_freq: f32,
        sample_rate: u32,
        ratio: f32,
        range: f32,
        level: EnvelopeRunner,
        mod_env: Option<EnvelopeRunner>,
        pitch_env: Option<EnvelopeRunner>,
    ) -> Self {
        FmVoice {
            car_phase: 0.0,
            mod_phase: 0.0,
            base_freq: base_freq as f64,
            inv_rate: 1.0 / sample_rate as f64,
            ratio: ratio as f64,
            range,
            level,
            mod_env,
            pitch_env,
            finished: false,
        }
    }

    fn update(&mut self, out: &mut [f32], mods: &BlockMods<'_>) {
        if self.finished {
            return;
        }
        for (i, s) in out.iter_mut().enumerate() {
            let mut cents = 0.0f32;
            if let Some(env) = &mut self.pitch_env {
                cents += (env.next() - 0.5) * 2400.0;
            }
            if let Some(track) = mods.pitch_lfo {
                cents += track[i];
            }
            let car_rate = self.base_freq * mods.wheel as f64 * cents_to_ratio(cents) as f64 * self.inv_rate;

            let mut index = match &mut self.mod_env {
                Some(env) => env.next() * self.range,
                None => self.range,
            };
            if let Some(track) = mods.fm_lfo {
                index += track[i];
            }

            let lvl = self.level.next();
            *s += (self.car_phase * TAU).sin() as f32 * lvl;

            let deviation = (self.mod_phase * TAU).sin() * index as f64;
            self.car_phase = (self.car_phase + car_rate * (1.0 + deviation)).rem_euclid(1.0);
            self.mod_phase = (self.mod_phase + car_rate * self.ratio).fract();

            if self.level.finished() {
                self.finished = true;
                return;
            }
        }
    }

    fn release(&mut self) {
        self.level.release();
        if let Some(env) = &mut self.mod_env {
            env.release();
        }
        if let Some(env) = &mut self.pitch_env {
            env.release();
        }
    }
}

/// White noise shaped by the level envelope. The decoded band width is
/// carried for the band-limiting filter extension; until then the noise
/// is unfiltered.
#[derive(Debug)]
pub struct SubVoice {
    rng: SmallRng,
    level: EnvelopeRunner,
    pub width: f32,
    finished: bool,
}

impl SubVoice {
    pub fn new(seed: u64, width: f32, level: EnvelopeRunner) -> Self {
        SubVoice {
            rng: SmallRng::seed_from_u64(seed),
            level,
            width,
            finished: false,
        }
    }

    fn update(&mut self, out: &mut [f32]) {
        if self.finished {
            return;
        }
        for s in out.iter_mut() {
            let noise = self.rng.next_u32() as f32 / u32::MAX as f32 * 2.0 - 1.0;
            *s += noise * self.level.next();
            if self.level.finished() {
                self.finished = true;
                return;
            }
        }
    }

    fn release(&mut self) {
        self.level.release();
    }
}
