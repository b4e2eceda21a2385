//! Single-cycle waveform tables.
//!
//! A [`Wave`] is one period of a waveform, precomputed once and shared
//! read-only (via `Arc`) by every oscillator and voice that reads it.

use std::f32::consts::PI;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::format::ByteReader;

/// Table length, one full period. Power of two so a 32-bit phase
/// accumulator can index it with a plain shift.
pub const TABLE_LEN: usize = 1 << 10;

const SHAPE_CUSTOM: u8 = 0;
const SHAPE_SINE: u8 = 1;
const SHAPE_SQUARE: u8 = 2;
const SHAPE_SAW: u8 = 3;
const SHAPE_TRIANGLE: u8 = 4;

/// One period of a waveform.
#[derive(Debug, Clone)]
pub struct Wave {
    samples: Box<[f32; TABLE_LEN]>,
}

impl Wave {
    pub fn sine() -> Self {
        let mut samples = Box::new([0.0f32; TABLE_LEN]);
        for (i, s) in samples.iter_mut().enumerate() {
            *s = (2.0 * PI * i as f32 / TABLE_LEN as f32).sin();
        }
        Wave { samples }
    }

    pub fn square() -> Self {
        let mut samples = Box::new([0.0f32; TABLE_LEN]);
        for (i, s) in samples.iter_mut().enumerate() {
            *s = if i < TABLE_LEN / 2 { 1.0 } else { -1.0 };
        }
        Wave { samples }
    }

    pub fn saw() -> Self {
        let mut samples = Box::new([0.0f32; TABLE_LEN]);
        for (i, s) in samples.iter_mut().enumerate() {
            *s = 2.0 * i as f32 / TABLE_LEN as f32 - 1.0;
        }
        Wave { samples }
    }

    pub fn triangle() -> Self {
        let mut samples = Box::new([0.0f32; TABLE_LEN]);
        for (i, s) in samples.iter_mut().enumerate() {
            let phase = i as f32 / TABLE_LEN as f32;
            *s = if phase < 0.5 {
                4.0 * phase - 1.0
            } else {
                3.0 - 4.0 * phase
            };
        }
        Wave { samples }
    }

    /// Additive synthesis over the shared sine table by integer-stride
    /// resampling. Harmonic `k+1` of coefficient `coeffs[k]`; harmonics
    /// past `TABLE_LEN / 2` are ignored (aliasing is an accepted
    /// limitation of the format, not an error).
    pub fn from_harmonics(sine: &Wave, coeffs: &[f32]) -> Self {
        let mut samples = Box::new([0.0f32; TABLE_LEN]);
        for (k, &amp) in coeffs.iter().enumerate() {
            let harmonic = k + 1;
            if harmonic > TABLE_LEN / 2 {
                continue;
            }
            for (i, s) in samples.iter_mut().enumerate() {
                *s += sine.at(i * harmonic % TABLE_LEN) * amp;
            }
        }
        Wave { samples }
    }

    /// Decode a wave: shape byte, then for shape 0 a coefficient count and
    /// that many 16-bit normalized harmonic amplitudes.
    pub fn decode(r: &mut ByteReader<'_>, sine: &Wave) -> Result<Self, DecodeError> {
        let shape = r.read_u8()?;
        match shape {
            SHAPE_CUSTOM => {
                let count = r.read_u8()?;
                let mut coeffs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    coeffs.push(r.read_u16()? as f32 / 65535.0);
                }
                Ok(Wave::from_harmonics(sine, &coeffs))
            }
            SHAPE_SINE => Ok(Wave::sine()),
            SHAPE_SQUARE => Ok(Wave::square()),
            SHAPE_SAW => Ok(Wave::saw()),
            SHAPE_TRIANGLE => Ok(Wave::triangle()),
            _ => Err(DecodeError::BadWaveShape { shape }),
        }
    }

    #[inline]
    pub fn at(&self, index: usize) -> f32 {
        self.samples[index & (TABLE_LEN - 1)]
    }
}

/// Convenience for the canonical shared sine table.
pub fn shared_sine() -> Arc<Wave> {
    Arc::new(Wave::sine())
}
