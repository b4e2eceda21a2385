//! Printer — headless render of a song or sound effect to a PCM buffer.
//!
//! Drives the same Bus/Channel/Voice code path as live playback, but
//! synchronously to completion outside the real-time path (so it may
//! allocate freely). Used to pre-render sound effects for caching and to
//! export WAV files.

use log::warn;

use crate::dsp::bus::{Bus, BusOptions};
use crate::dsp::engine::{SYNTH_UPDATE_LIMIT_FRAMES, Synth};
use crate::error::EgsError;
use crate::format::ms_to_frames;

/// Bounds for a print run.
#[derive(Debug, Clone, Copy)]
pub struct PrintOptions {
    /// Extra frames rendered after the last voice ends, letting delay and
    /// filter tails ring out.
    pub tail_ms: u32,
    /// Hard cap on the printed length; longer songs are truncated with a
    /// warning.
    pub max_seconds: u32,
}

impl Default for PrintOptions {
    fn default() -> Self {
        PrintOptions {
            tail_ms: 250,
            max_seconds: 600,
        }
    }
}

/// Headless bus driver borrowing the synth's shared tables.
pub struct Printer<'a> {
    synth: &'a Synth,
}

impl<'a> Printer<'a> {
    pub fn new(synth: &'a Synth) -> Self {
        Printer { synth }
    }

    /// Render an EGS blob to completion as interleaved stereo f32.
    ///
    /// The repeat flag makes no sense here — a repeating song never
    /// completes — so printing always runs the timeline once.
    pub fn render(&self, data: &[u8], opts: PrintOptions) -> Result<Vec<f32>, EgsError> {
        let rate = self.synth.sample_rate();
        let mut bus = Bus::configure(
            data,
            rate,
            self.synth.sine(),
            BusOptions::default(),
            SYNTH_UPDATE_LIMIT_FRAMES,
        )?;

        let cap_frames = opts.max_seconds as u64 * rate as u64;
        let mut out: Vec<f32> = Vec::new();
        let mut chunk = [0.0f32; SYNTH_UPDATE_LIMIT_FRAMES * 2];

        while !bus.idle() {
            if out.len() as u64 >= cap_frames * 2 {
                warn!("print exceeded {}s cap, truncating", opts.max_seconds);
                return Ok(out);
            }
            chunk.fill(0.0);
            bus.update(
                &mut chunk,
                SYNTH_UPDATE_LIMIT_FRAMES,
                self.synth.bank(),
                self.synth.note_freqs(),
            );
            out.extend_from_slice(&chunk);
        }

        let mut tail = ms_to_frames(opts.tail_ms, rate) as usize;
        while tail > 0 {
            let k = tail.min(SYNTH_UPDATE_LIMIT_FRAMES);
            chunk.fill(0.0);
            bus.update(&mut chunk, k, self.synth.bank(), self.synth.note_freqs());
            out.extend_from_slice(&chunk[..k * 2]);
            tail -= k;
        }

        Ok(out)
    }

    /// Render to interleaved stereo i16 PCM.
    pub fn render_i16(&self, data: &[u8], opts: PrintOptions) -> Result<Vec<i16>, EgsError> {
        let samples = self.render(data, opts)?;
        Ok(samples
            .iter()
            .map(|&s| (s as f64 * 32767.0).round().clamp(-32768.0, 32767.0) as i16)
            .collect())
    }

    /// Render to a WAV byte buffer (16-bit stereo PCM).
    pub fn render_wav(&self, data: &[u8], opts: PrintOptions) -> Result<Vec<u8>, EgsError> {
        let pcm = self.render_i16(data, opts)?;
        Ok(encode_wav(&pcm, self.synth.sample_rate(), 2))
    }
}

/// Encode interleaved i16 PCM samples to a WAV byte buffer.
fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (samples.len() * 2) as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}
