//! Low-frequency oscillator over a shared wave table.
//!
//! `Osc` is a 32-bit fixed-point phase accumulator whose top bits index
//! the 1024-sample table. It always reads the shared sine wave — LFOs
//! never use custom waves. A block `update` overwrites its output buffer
//! with `wave[phase >> SHIFT] * scale + bias`, producing the
//! per-block-precomputed modulation tracks that voices consume.

use std::sync::Arc;

use serde::Serialize;

use crate::error::DecodeError;
use crate::format::ByteReader;
use crate::dsp::wave::{TABLE_LEN, Wave};

/// Phase bits below the table index.
const PHASE_SHIFT: u32 = 32 - TABLE_LEN.trailing_zeros();

/// Decoded LFO parameters: `(period_ms, depth, phase)`, depth and initial
/// phase normalized. The meaning of `depth` is up to the consumer (cents
/// for a pitch LFO, modulation-index units for FM, gain depth for
/// tremolo), applied through the `scale` passed to [`Osc::new`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OscParams {
    pub period_ms: u16,
    pub depth: f32,
    pub phase: f32,
}

impl OscParams {
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let period_ms = r.read_u16()?.max(1);
        let depth = r.read_u16()? as f32 / 65535.0;
        let phase = r.read_u8()? as f32 / 255.0;
        Ok(OscParams {
            period_ms,
            depth,
            phase,
        })
    }
}

/// Fixed-point phase accumulator reading a shared wave.
#[derive(Debug, Clone)]
pub struct Osc {
    wave: Arc<Wave>,
    phase: u32,
    step: u32,
    scale: f32,
    bias: f32,
}

impl Osc {
    /// Build an oscillator from decoded params.
    ///
    /// `scale_unit` converts the normalized depth into consumer units;
    /// `bias` offsets the output (tremolo uses it to center its gain).
    pub fn new(params: &OscParams, wave: Arc<Wave>, sample_rate: u32, scale_unit: f32, bias: f32) -> Self {
        let cycles_per_frame = 1000.0 / (params.period_ms as f64 * sample_rate as f64);
        let step = (cycles_per_frame * 4_294_967_296.0) as u32;
        let phase = ((params.phase as f64 * 4_294_967_296.0) as u64 & 0xffff_ffff) as u32;
        Osc {
            wave,
            phase,
            step,
            scale: params.depth * scale_unit,
            bias,
        }
    }

    /// Produce one value and advance one frame.
    #[inline]
    pub fn next(&mut self) -> f32 {
        let v = self.wave.at((self.phase >> PHASE_SHIFT) as usize);
        self.phase = self.phase.wrapping_add(self.step);
        v * self.scale + self.bias
    }

    /// Overwrite `buf[..frames]` with the modulation track.
    pub fn update(&mut self, buf: &mut [f32], frames: usize) {
        for s in buf.iter_mut().take(frames) {
            *s = self.next();
        }
    }
}
