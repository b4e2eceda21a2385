//! Percussion sample storage.
//!
//! `PcmSample` is a decoded mono sample shared read-only by every voice
//! replaying it. The `SampleBank` registry maps the sample ids referenced
//! by drum tables to loaded samples; loading itself (ROM, files) is the
//! caller's concern.

use std::collections::HashMap;
use std::sync::Arc;

/// A decoded mono PCM sample.
#[derive(Debug, Clone)]
pub struct PcmSample {
    data: Vec<f32>,
    sample_rate: u32,
    /// Frame to restart from when playback reaches the end; `None` plays once.
    loop_start: Option<usize>,
}

impl PcmSample {
    pub fn new(data: Vec<f32>, sample_rate: u32, loop_start: Option<usize>) -> Self {
        let loop_start = loop_start.filter(|&s| s < data.len());
        PcmSample {
            data,
            sample_rate,
            loop_start,
        }
    }

    /// Create from 16-bit signed PCM data.
    pub fn from_i16(pcm: &[i16], sample_rate: u32, loop_start: Option<usize>) -> Self {
        let data = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
        Self::new(data, sample_rate, loop_start)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn loop_start(&self) -> Option<usize> {
        self.loop_start
    }

    /// Read with linear interpolation at a fractional frame position.
    pub fn read_interpolated(&self, position: f64) -> f32 {
        if self.data.is_empty() || position < 0.0 {
            return 0.0;
        }
        let idx = position as usize;
        if idx + 1 >= self.data.len() {
            return if idx < self.data.len() { self.data[idx] } else { 0.0 };
        }
        let frac = (position - idx as f64) as f32;
        self.data[idx] * (1.0 - frac) + self.data[idx + 1] * frac
    }
}

/// Registry of loaded samples, keyed by the ids drum tables reference.
#[derive(Debug, Default)]
pub struct SampleBank {
    samples: HashMap<u16, Arc<PcmSample>>,
}

impl SampleBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u16, sample: PcmSample) {
        self.samples.insert(id, Arc::new(sample));
    }

    pub fn get(&self, id: u16) -> Option<&Arc<PcmSample>> {
        self.samples.get(&id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
