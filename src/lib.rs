pub mod dsp;
pub mod error;
pub mod format;
pub mod inspect;

pub use dsp::bus::BusOptions;
pub use dsp::engine::{SYNTH_UPDATE_LIMIT_FRAMES, Synth};
pub use dsp::printer::{PrintOptions, Printer};
pub use dsp::sample::PcmSample;
pub use error::{DecodeError, EgsError};

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pre-render an EGS sound-effect blob to a WAV byte buffer.
///
/// Convenience wrapper over [`Printer`] with a fresh context and default
/// print bounds; sounds that reference percussion samples need a
/// [`Synth`] with the samples registered instead.
pub fn render_sound_wav(data: &[u8], sample_rate: u32) -> Result<Vec<u8>, EgsError> {
    let synth = Synth::new(sample_rate);
    Printer::new(&synth).render_wav(data, PrintOptions::default())
}
