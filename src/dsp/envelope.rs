//! Multi-point envelope generator.
//!
//! An [`EnvelopeConfig`] is the immutable, decoded shape: up to 16 linear
//! ramp targets with lo/hi variants blended by note velocity, an optional
//! initial value, and an optional sustain point. An [`EnvelopeRunner`] is
//! the per-voice cursor instantiated at note-on for a concrete velocity
//! and scheduled duration.

use std::sync::Arc;

use arrayvec::ArrayVec;
use serde::Serialize;

use crate::error::DecodeError;
use crate::format::ByteReader;

/// Maximum number of points in one envelope.
pub const MAX_POINTS: usize = 16;

/// One leg + the synthetic sustain hold.
const MAX_LEGS: usize = MAX_POINTS + 1;

const FLAG_INIT: u8 = 0x01;
const FLAG_VELOCITY_SPLIT: u8 = 0x02;
const FLAG_SUSTAIN: u8 = 0x04;

/// One ramp target, with times already converted to frames at decode.
///
/// For envelopes without a velocity split, lo == hi.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnvelopePoint {
    pub frames_lo: u32,
    pub frames_hi: u32,
    pub value_lo: f32,
    pub value_hi: f32,
}

/// Decoded envelope shape, shared by reference across all voices spawned
/// from one channel configuration.
#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeConfig {
    pub init_lo: f32,
    pub init_hi: f32,
    /// Index of the point after which the runner holds for the scheduled
    /// note duration.
    pub sustain: Option<usize>,
    pub points: Vec<EnvelopePoint>,
}

impl EnvelopeConfig {
    /// Decode an envelope from the reader.
    ///
    /// Layout: flags byte (bit0 initial value, bit1 velocity split,
    /// bit2 sustain point), optional init value(s), optional sustain index,
    /// point count, then the points. Times are ms varints converted to
    /// frames at `sample_rate`, one frame minimum per leg.
    pub fn decode(r: &mut ByteReader<'_>, sample_rate: u32) -> Result<Self, DecodeError> {
        let flags = r.read_u8()?;
        if flags & !(FLAG_INIT | FLAG_VELOCITY_SPLIT | FLAG_SUSTAIN) != 0 {
            return Err(DecodeError::BadEnvelopeFlags { flags });
        }
        let split = flags & FLAG_VELOCITY_SPLIT != 0;

        let (init_lo, init_hi) = if flags & FLAG_INIT != 0 {
            let lo = r.read_u8()? as f32 / 255.0;
            let hi = if split { r.read_u8()? as f32 / 255.0 } else { lo };
            (lo, hi)
        } else {
            (0.0, 0.0)
        };

        let sustain_idx = if flags & FLAG_SUSTAIN != 0 {
            Some(r.read_u8()?)
        } else {
            None
        };

        let count = r.read_u8()?;
        if count == 0 || count as usize > MAX_POINTS {
            return Err(DecodeError::BadPointCount { count });
        }
        if let Some(s) = sustain_idx {
            if s >= count {
                return Err(DecodeError::BadSustainIndex { index: s, count });
            }
        }

        let mut points = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let frames_lo = crate::format::ms_to_frames(r.read_varint_ms()?, sample_rate);
            let value_lo = r.read_u8()? as f32 / 255.0;
            let (frames_hi, value_hi) = if split {
                let t = crate::format::ms_to_frames(r.read_varint_ms()?, sample_rate);
                let v = r.read_u8()? as f32 / 255.0;
                (t, v)
            } else {
                (frames_lo, value_lo)
            };
            points.push(EnvelopePoint {
                frames_lo,
                frames_hi,
                value_lo,
                value_hi,
            });
        }

        Ok(EnvelopeConfig {
            init_lo,
            init_hi,
            sustain: sustain_idx.map(|s| s as usize),
            points,
        })
    }

    /// Velocity-blended initial value.
    pub fn init_value(&self, velocity: f32) -> f32 {
        lerp(self.init_lo, self.init_hi, velocity)
    }
}

fn lerp(lo: f32, hi: f32, t: f32) -> f32 {
    lo + (hi - lo) * t
}

#[derive(Debug, Clone, Copy)]
struct Leg {
    frames: u32,
    delta: f32,
    target: f32,
}

/// Per-voice envelope cursor.
///
/// The cursor only moves forward: each `next()` consumes exactly one frame,
/// legs are crossed as their frame budget runs out, and `release()` can
/// only skip the sustain hold, never rewind.
#[derive(Debug, Clone)]
pub struct EnvelopeRunner {
    legs: ArrayVec<Leg, MAX_LEGS>,
    hold_leg: Option<usize>,
    leg: usize,
    frames_left: u32,
    value: f32,
    delta: f32,
    released: bool,
    finished: bool,
}

impl EnvelopeRunner {
    /// Instantiate the config for a note.
    ///
    /// `velocity` blends the lo/hi point variants; `duration_frames` sizes
    /// the synthetic hold inserted at the sustain point (only when the
    /// duration exceeds the legs preceding it).
    pub fn new(config: &Arc<EnvelopeConfig>, velocity: f32, duration_frames: u32) -> Self {
        let velocity = velocity.clamp(0.0, 1.0);
        let mut legs: ArrayVec<Leg, MAX_LEGS> = ArrayVec::new();
        let mut hold_leg = None;

        let mut value = config.init_value(velocity);
        let mut elapsed: u64 = 0;
        for (i, p) in config.points.iter().enumerate() {
            let frames = blend_frames(p.frames_lo, p.frames_hi, velocity);
            let target = lerp(p.value_lo, p.value_hi, velocity);
            legs.push(Leg {
                frames,
                delta: (target - value) / frames as f32,
                target,
            });
            value = target;
            elapsed += frames as u64;
            if config.sustain == Some(i) {
                let hold = (duration_frames as u64).saturating_sub(elapsed);
                if hold > 0 {
                    hold_leg = Some(legs.len());
                    legs.push(Leg {
                        frames: hold as u32,
                        delta: 0.0,
                        target,
                    });
                }
            }
        }

        let mut runner = EnvelopeRunner {
            legs,
            hold_leg,
            leg: 0,
            frames_left: 0,
            value: config.init_value(velocity),
            delta: 0.0,
            released: false,
            finished: false,
        };
        runner.load_leg();
        runner
    }

    fn load_leg(&mut self) {
        while let Some(l) = self.legs.get(self.leg) {
            if Some(self.leg) == self.hold_leg && self.released {
                self.leg += 1;
                continue;
            }
            self.frames_left = l.frames;
            self.delta = l.delta;
            return;
        }
        self.finished = true;
        self.delta = 0.0;
    }

    /// Return the current value, then advance one frame.
    ///
    /// Once every leg is consumed the runner holds its last value.
    pub fn next(&mut self) -> f32 {
        let out = self.value;
        if !self.finished {
            self.value += self.delta;
            self.frames_left -= 1;
            if self.frames_left == 0 {
                // Snap to the target to keep repeated float adds from drifting.
                self.value = self.legs[self.leg].target;
                self.leg += 1;
                self.load_leg();
            }
        }
        out
    }

    /// End the sustain hold and proceed to the legs after the sustain
    /// point. No-op if already released or finished.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.finished && Some(self.leg) == self.hold_leg {
            self.leg += 1;
            self.load_leg();
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

fn blend_frames(lo: u32, hi: u32, velocity: f32) -> u32 {
    (lerp(lo as f32, hi as f32, velocity).round() as u32).max(1)
}
