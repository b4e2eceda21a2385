//! Synthesis engine — pure Rust, deterministic, allocation-free on the
//! render path.
//!
//! The node graph runs bus -> channel -> voice: a `Bus` interprets one
//! song's event timeline, its `Channel`s own the voice recipes and effect
//! pipes, and `Voice`s write into the shared accumulation buffers. The
//! same code path serves live playback (`engine::Synth`) and offline
//! pre-rendering (`printer::Printer`).

pub mod bus;
pub mod channel;
pub mod engine;
pub mod envelope;
pub mod oscillator;
pub mod pipe;
pub mod printer;
pub mod sample;
pub mod voice;
pub mod wave;
