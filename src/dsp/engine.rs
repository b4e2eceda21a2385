//! Synth context — owns the live buses and the shared tables.
//!
//! The platform's output driver pulls interleaved PCM through `update`
//! (or `update_i16`) once per output period. Everything reachable from
//! that call is allocation-free: buses, channels, and scratch buffers are
//! sized when a song is configured, and the chunking loop bounds
//! per-call scratch usage regardless of how large a buffer the driver
//! requests. The context is single-threaded: starting, stopping, and
//! killing buses must happen between `update` calls, never during one.

use std::sync::Arc;

use crate::dsp::bus::{Bus, BusOptions};
use crate::dsp::sample::{PcmSample, SampleBank};
use crate::dsp::wave::{Wave, shared_sine};
use crate::error::EgsError;

/// Hard per-call frame limit; larger requests are chunked through
/// fixed-size scratch.
pub const SYNTH_UPDATE_LIMIT_FRAMES: usize = 512;

/// Maximum simultaneously live buses (overlapping songs and one-shot
/// sound effects).
pub const BUS_LIMIT: usize = 8;

/// Equal-tempered base frequency for every MIDI-style note id, A4 = 440 Hz.
pub fn note_table() -> [f32; 128] {
    let mut table = [0.0f32; 128];
    for (n, f) in table.iter_mut().enumerate() {
        *f = 440.0 * ((n as f32 - 69.0) / 12.0).exp2();
    }
    table
}

/// The top-level synthesizer.
pub struct Synth {
    sample_rate: u32,
    sine: Arc<Wave>,
    note_freqs: [f32; 128],
    bank: SampleBank,
    buses: Vec<(u64, Bus)>,
    next_bus_id: u64,
    i16_scratch: Vec<f32>,
}

impl Synth {
    pub fn new(sample_rate: u32) -> Self {
        Synth {
            sample_rate,
            sine: shared_sine(),
            note_freqs: note_table(),
            bank: SampleBank::new(),
            buses: Vec::with_capacity(BUS_LIMIT),
            next_bus_id: 1,
            i16_scratch: vec![0.0; SYNTH_UPDATE_LIMIT_FRAMES * 2],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn sine(&self) -> &Arc<Wave> {
        &self.sine
    }

    pub(crate) fn note_freqs(&self) -> &[f32; 128] {
        &self.note_freqs
    }

    pub fn bank(&self) -> &SampleBank {
        &self.bank
    }

    /// Register a percussion sample under the id drum tables reference.
    pub fn register_sample(&mut self, id: u16, sample: PcmSample) {
        self.bank.insert(id, sample);
    }

    /// Start playing an EGS blob. Returns the bus id used to control it.
    pub fn begin(&mut self, data: &[u8], opts: BusOptions) -> Result<u64, EgsError> {
        if self.buses.len() >= BUS_LIMIT {
            return Err(EgsError::BusLimit { limit: BUS_LIMIT });
        }
        let bus = Bus::configure(
            data,
            self.sample_rate,
            &self.sine,
            opts,
            SYNTH_UPDATE_LIMIT_FRAMES,
        )?;
        let id = self.next_bus_id;
        self.next_bus_id += 1;
        self.buses.push((id, bus));
        Ok(id)
    }

    /// Fade a bus out over `fade_frames` (0 = stop immediately). The bus
    /// is retired once the fade completes.
    pub fn stop(&mut self, id: u64, fade_frames: u32, force: bool) -> Result<(), EgsError> {
        self.bus_mut(id)?.fade_out(fade_frames, force);
        Ok(())
    }

    /// Reverse a fade-out in progress back into a fade-in.
    pub fn cancel_fade(&mut self, id: u64) -> Result<(), EgsError> {
        self.bus_mut(id)?.cancel_fade();
        Ok(())
    }

    /// Remove a bus outright. Safe only between `update` calls.
    pub fn kill(&mut self, id: u64) -> Result<(), EgsError> {
        let before = self.buses.len();
        self.buses.retain(|(bid, _)| *bid != id);
        if self.buses.len() == before {
            return Err(EgsError::UnknownBus { id });
        }
        Ok(())
    }

    /// Push a 14-bit pitch-wheel value to one channel of a bus.
    pub fn set_wheel(&mut self, id: u64, chid: u8, value: u16) -> Result<(), EgsError> {
        if let Some(ch) = self.bus_mut(id)?.channel_mut(chid) {
            ch.set_wheel(value);
        }
        Ok(())
    }

    /// Release every sounding voice on one channel of a bus (raw
    /// note-off, ahead of the scheduled durations).
    pub fn release_channel(&mut self, id: u64, chid: u8) -> Result<(), EgsError> {
        if let Some(ch) = self.bus_mut(id)?.channel_mut(chid) {
            ch.release_all();
        }
        Ok(())
    }

    pub fn bus(&self, id: u64) -> Option<&Bus> {
        self.buses.iter().find(|(bid, _)| *bid == id).map(|(_, b)| b)
    }

    fn bus_mut(&mut self, id: u64) -> Result<&mut Bus, EgsError> {
        self.buses
            .iter_mut()
            .find(|(bid, _)| *bid == id)
            .map(|(_, b)| b)
            .ok_or(EgsError::UnknownBus { id })
    }

    pub fn live_buses(&self) -> usize {
        self.buses.len()
    }

    /// Mix every live bus into `out` (interleaved stereo, `frames * 2`
    /// samples). The requested count is chunked through the per-call
    /// frame limit; buses that finished fading are retired between
    /// chunks.
    pub fn update(&mut self, out: &mut [f32], frames: usize) {
        let frames = frames.min(out.len() / 2);
        out[..frames * 2].fill(0.0);

        let mut done = 0usize;
        while done < frames {
            let k = SYNTH_UPDATE_LIMIT_FRAMES.min(frames - done);
            let seg = &mut out[2 * done..2 * (done + k)];
            for (_, bus) in &mut self.buses {
                bus.update(seg, k, &self.bank, &self.note_freqs);
            }
            self.buses.retain(|(_, b)| !b.finished());
            done += k;
        }
    }

    /// Integer output path: renders through the float pipeline, then
    /// quantizes with symmetric clamping.
    pub fn update_i16(&mut self, out: &mut [i16], frames: usize) {
        let frames = frames.min(out.len() / 2);
        let mut done = 0usize;
        while done < frames {
            let k = SYNTH_UPDATE_LIMIT_FRAMES.min(frames - done);
            self.i16_scratch[..k * 2].fill(0.0);
            for (_, bus) in &mut self.buses {
                bus.update(&mut self.i16_scratch[..k * 2], k, &self.bank, &self.note_freqs);
            }
            self.buses.retain(|(_, b)| !b.finished());
            for (dst, &s) in out[2 * done..2 * (done + k)]
                .iter_mut()
                .zip(self.i16_scratch[..k * 2].iter())
            {
                *dst = (s as f64 * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
            }
            done += k;
        }
    }
}
