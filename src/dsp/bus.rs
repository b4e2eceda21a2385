//! Bus — one independently playable song or sound-effect instance.
//!
//! A bus owns up to 16 channels and the discrete event timeline decoded
//! from the EGS blob. Rendering interleaves "advance the timeline" with
//! "render N frames through the channels": audio never gets ahead of the
//! events, and every payout of scheduled delay moves playback forward by
//! at least one frame, so even a pathological zero-delay looping song
//! cannot stall the render.

use std::sync::Arc;

use log::{debug, warn};

use crate::dsp::channel::{CHANNEL_COUNT, Channel, ChannelConfig};
use crate::dsp::sample::SampleBank;
use crate::dsp::wave::Wave;
use crate::error::DecodeError;
use crate::format::{ByteReader, DURATION_CLASS_MS, MAGIC, ms_to_frames};

/// Start-up options for a bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusOptions {
    /// Restart the event timeline from the top when it ends.
    pub repeat: bool,
    /// Frames of silence before the timeline starts (sample-accurate
    /// song-start scheduling).
    pub start_delay_frames: u32,
    /// Fade in from silence over this many frames (0 = start at full level).
    pub fade_in_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fade {
    None,
    Out,
    In,
}

/// One playing song/sound instance.
pub struct Bus {
    channels: [Option<Channel>; CHANNEL_COUNT],
    stream: Vec<u8>,
    cursor: usize,
    /// Frames of already-scheduled delay not yet rendered.
    pending_delay: u64,
    hard_delay: u64,
    repeat: bool,
    /// Timeline hit malformed data; renders silence permanently.
    halted: bool,
    /// Timeline ended without repeat; renders silence until killed.
    ended: bool,
    fade: Fade,
    fade_level: f64,
    fade_step: f64,
    finished: bool,
    sample_rate: u32,
    scratch: Vec<f32>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("cursor", &self.cursor)
            .field("pending_delay", &self.pending_delay)
            .field("hard_delay", &self.hard_delay)
            .field("repeat", &self.repeat)
            .field("halted", &self.halted)
            .field("ended", &self.ended)
            .field("fade", &self.fade)
            .field("finished", &self.finished)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Decode an EGS blob: magic, channel count, channel blocks, then the
    /// event stream occupying the rest of the buffer.
    pub fn configure(
        data: &[u8],
        sample_rate: u32,
        sine: &Arc<Wave>,
        opts: BusOptions,
        limit_frames: usize,
    ) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(data);
        if r.read_bytes(MAGIC.len())? != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let count = r.read_u8()?;
        if count == 0 || count as usize > CHANNEL_COUNT {
            return Err(DecodeError::BadChannelCount { count });
        }

        let mut channels: [Option<Channel>; CHANNEL_COUNT] = std::array::from_fn(|_| None);
        for _ in 0..count {
            let cfg = ChannelConfig::decode(&mut r, sample_rate, sine)?;
            let chid = cfg.chid;
            let slot = &mut channels[chid as usize];
            if slot.is_some() {
                return Err(DecodeError::DuplicateChannel { chid });
            }
            *slot = Some(Channel::new(cfg, sample_rate, sine, limit_frames)?);
        }
        let stream = r.read_bytes(r.remaining())?.to_vec();

        let (fade, fade_level, fade_step) = if opts.fade_in_frames > 0 {
            (Fade::In, 0.0, 1.0 / opts.fade_in_frames as f64)
        } else {
            (Fade::None, 1.0, 0.0)
        };

        Ok(Bus {
            channels,
            stream,
            cursor: 0,
            pending_delay: 0,
            hard_delay: opts.start_delay_frames as u64,
            repeat: opts.repeat,
            halted: false,
            ended: false,
            fade,
            fade_level,
            fade_step,
            finished: false,
            sample_rate,
            scratch: vec![0.0; limit_frames * 2],
        })
    }

    /// Render `frames` (at most the configured limit) and add the result
    /// into the interleaved stereo buffer `out`.
    pub fn update(
        &mut self,
        out: &mut [f32],
        frames: usize,
        bank: &SampleBank,
        note_freqs: &[f32; 128],
    ) {
        debug_assert!(frames * 2 <= self.scratch.len());
        debug_assert!(out.len() >= frames * 2);
        self.scratch[..frames * 2].fill(0.0);

        let mut done = 0usize;
        if self.hard_delay > 0 {
            let k = self.hard_delay.min(frames as u64) as usize;
            self.hard_delay -= k as u64;
            done += k;
        }
        while done < frames {
            let k = self.advance_timeline(frames - done, bank, note_freqs);
            let seg = &mut self.scratch[2 * done..2 * (done + k)];
            for ch in self.channels.iter_mut().flatten() {
                ch.update(seg, k);
            }
            done += k;
        }

        for i in 0..frames {
            let g = self.fade_level as f32;
            self.step_fade();
            out[2 * i] += self.scratch[2 * i] * g;
            out[2 * i + 1] += self.scratch[2 * i + 1] * g;
        }
    }

    /// Frames until the next event boundary, capped at `cap` and always
    /// at least 1. Pays out pending delay first; otherwise decodes and
    /// applies zero-duration events until a delay or end-of-stream.
    fn advance_timeline(&mut self, cap: usize, bank: &SampleBank, note_freqs: &[f32; 128]) -> usize {
        loop {
            if self.pending_delay > 0 {
                let k = self.pending_delay.min(cap as u64) as usize;
                self.pending_delay -= k as u64;
                return k;
            }
            self.pump_events(bank, note_freqs);
        }
    }

    /// Decode events at the cursor until a delay is scheduled or the
    /// stream ends. Guarantees `pending_delay > 0` on return.
    fn pump_events(&mut self, bank: &SampleBank, note_freqs: &[f32; 128]) {
        if self.halted || self.ended {
            self.pending_delay = u64::MAX;
            return;
        }

        let mut delay_ms: u64 = 0;
        let mut wrapped = false;
        loop {
            // End-of-buffer at an event boundary is equivalent to the
            // 0x00 terminator.
            let b = if self.cursor < self.stream.len() {
                self.stream[self.cursor]
            } else {
                0x00
            };
            let is_delay = b >> 6 <= 0b01 && b != 0x00;
            if delay_ms > 0 && !is_delay {
                // Delay run ended; events past it belong to a later render.
                break;
            }

            match b >> 6 {
                0b00 | 0b01 if is_delay => {
                    let ms = (b & 0x3f) as u64;
                    delay_ms += if b >> 6 == 0b01 { ms * 64 } else { ms };
                    self.cursor += 1;
                }
                0b00 => {
                    // Terminator.
                    if self.repeat {
                        if wrapped {
                            debug!("zero-progress song loop, forcing 1-frame delay");
                            self.pending_delay = 1;
                            return;
                        }
                        self.cursor = 0;
                        wrapped = true;
                    } else {
                        self.ended = true;
                        self.pending_delay = u64::MAX;
                        return;
                    }
                }
                0b10 => {
                    if self.cursor + 3 > self.stream.len() {
                        return self.halt("truncated note-on event");
                    }
                    let note = self.stream[self.cursor + 1];
                    if note & 0x80 != 0 {
                        return self.halt("bad note byte");
                    }
                    let velocity = self.stream[self.cursor + 2] as f32 / 255.0;
                    let chid = (b & 0x0f) as usize;
                    let class = (b >> 4 & 0x03) as usize;
                    let duration = ms_to_frames(DURATION_CLASS_MS[class], self.sample_rate);
                    match &mut self.channels[chid] {
                        Some(ch) => ch.begin_note(note, velocity, duration, bank, note_freqs),
                        None => debug!("note-on for unconfigured channel {chid}, dropped"),
                    }
                    self.cursor += 3;
                }
                _ => {
                    if b & 0x30 != 0 {
                        return self.halt("reserved opcode");
                    }
                    if self.cursor + 2 > self.stream.len() {
                        return self.halt("truncated pitch-wheel event");
                    }
                    let value = (self.stream[self.cursor + 1] as u16) << 6;
                    let chid = (b & 0x0f) as usize;
                    if let Some(ch) = &mut self.channels[chid] {
                        ch.set_wheel(value);
                    }
                    self.cursor += 2;
                }
            }
        }

        let frames = (delay_ms * self.sample_rate as u64 / 1000).max(1);
        self.pending_delay = frames;
    }

    fn halt(&mut self, reason: &str) {
        warn!("event timeline halted at byte {}: {reason}", self.cursor);
        self.halted = true;
        self.pending_delay = u64::MAX;
    }

    /// Begin fading out. The per-frame step has a floor so any fade
    /// completes within about two seconds. `frames == 0` finishes
    /// immediately. A fade already in progress is only replaced when
    /// `force` is set.
    pub fn fade_out(&mut self, frames: u32, force: bool) {
        if self.fade == Fade::Out && !force {
            return;
        }
        if frames == 0 {
            self.fade_level = 0.0;
            self.fade_step = 0.0;
            self.fade = Fade::None;
            self.finished = true;
            return;
        }
        let step = (1.0 / frames as f64).max(1.0 / (2.0 * self.sample_rate as f64));
        self.fade_step = -step;
        self.fade = Fade::Out;
    }

    /// Reverse a fade-out in progress into a fade-in from the current
    /// level, without resetting it.
    pub fn cancel_fade(&mut self) {
        if self.fade == Fade::Out {
            self.fade_step = -self.fade_step;
            self.fade = Fade::In;
        }
    }

    #[inline]
    fn step_fade(&mut self) {
        match self.fade {
            Fade::None => {}
            Fade::Out => {
                self.fade_level += self.fade_step;
                if self.fade_level <= 0.0 {
                    self.fade_level = 0.0;
                    self.fade_step = 0.0;
                    self.fade = Fade::None;
                    self.finished = true;
                }
            }
            Fade::In => {
                self.fade_level += self.fade_step;
                if self.fade_level >= 1.0 {
                    self.fade_level = 1.0;
                    self.fade_step = 0.0;
                    self.fade = Fade::None;
                }
            }
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn fade_level(&self) -> f32 {
        self.fade_level as f32
    }

    /// True once the timeline cannot produce anything further and no
    /// voice is still sounding (effect tails may still ring).
    pub fn idle(&self) -> bool {
        (self.ended || self.halted)
            && self
                .channels
                .iter()
                .flatten()
                .all(|ch| ch.live_voices() == 0)
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn channel_mut(&mut self, chid: u8) -> Option<&mut Channel> {
        self.channels.get_mut(chid as usize)?.as_mut()
    }

    pub fn channel(&self, chid: u8) -> Option<&Channel> {
        self.channels.get(chid as usize)?.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::wave::shared_sine;
    use crate::format::tag;

    const RATE: u32 = 44100;

    fn level_env_field() -> Vec<u8> {
        let payload = [0x01u8, 0, 0x02, 10, 255, 100, 0];
        let mut f = vec![tag::LEVEL_ENVELOPE, payload.len() as u8];
        f.extend_from_slice(&payload);
        f
    }

    fn channel_block(chid: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![chid, 255, 0x00];
        let len = body.len() as u32;
        out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        out.extend_from_slice(body);
        out
    }

    fn song(blocks: &[Vec<u8>], events: &[u8]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.push(blocks.len() as u8);
        for b in blocks {
            out.extend_from_slice(b);
        }
        out.extend_from_slice(events);
        out
    }

    fn wave_song(events: &[u8]) -> Vec<u8> {
        song(&[channel_block(0, &level_env_field())], events)
    }

    fn make_bus(data: &[u8], opts: BusOptions) -> Bus {
        Bus::configure(data, RATE, &shared_sine(), opts, 512).unwrap()
    }

    fn render(bus: &mut Bus, frames: usize, chunk: usize) -> Vec<f32> {
        let bank = SampleBank::new();
        let freqs = crate::dsp::engine::note_table();
        let mut out = vec![0.0f32; frames * 2];
        let mut done = 0;
        while done < frames {
            let k = chunk.min(frames - done).min(512);
            bus.update(&mut out[2 * done..2 * (done + k)], k, &bank, &freqs);
            done += k;
        }
        out
    }

    #[test]
    fn renders_note_on() {
        // note-on ch0, note 69, velocity 255; then 100ms delay; terminator.
        let data = wave_song(&[0x80, 69, 255, 0x3f, 0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        let out = render(&mut bus, 1024, 1024);
        let energy: f32 = out.iter().map(|s| s * s).sum();
        assert!(energy > 0.0, "note should sound");
    }

    #[test]
    fn chunk_size_independent_rendering() {
        // Two channels — one with a pitch LFO and a delay pipe, one noise —
        // plus notes, delays, and a wheel event. LFO phase, pipe state, and
        // noise streams are the parts most at risk of chunk dependence.
        let blocks = [
            channel_block(0, &{
                let mut b = level_env_field();
                b.extend_from_slice(&[tag::PITCH_LFO, 5, 0x00, 100, 0x20, 0x00, 0x00]);
                b.extend_from_slice(&[0x81, 6, 0x00, 50, 200, 100, 255, 100]);
                b
            }),
            channel_block(1, &{
                let mut b = level_env_field();
                b.extend_from_slice(&[tag::SUB_WIDTH, 1, 200]);
                b
            }),
        ];
        let events = [
            0x80, 60, 200, // note ch0
            0x20, // 32ms delay
            0x81, 64, 180, // note ch1 (sub noise)
            0xc0, 0xff, // wheel ch0 full up
            0x15, // 21ms delay
            0x90, 72, 255, // longer-duration note ch0
            0x00,
        ];
        let data = song(&blocks, &events);

        let total = 4096;
        let whole = render(&mut make_bus(&data, BusOptions::default()), total, total);
        let by_one = render(&mut make_bus(&data, BusOptions::default()), total, 1);
        let by_17 = render(&mut make_bus(&data, BusOptions::default()), total, 17);
        assert_eq!(whole, by_one, "1-frame chunks must match one-shot render");
        assert_eq!(whole, by_17, "odd chunk sizes must match too");
    }

    #[test]
    fn delay_defers_second_note() {
        // 100ms (0x3f = 63ms fine + 37ms fine) before the note.
        let data = wave_song(&[0x3f, 0x25, 0x80, 69, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        let delay_frames = ms_to_frames(100, RATE) as usize;
        let out = render(&mut bus, delay_frames + 512, 512);
        let pre: f32 = out[..delay_frames * 2].iter().map(|s| s.abs()).sum();
        assert_eq!(pre, 0.0, "silence until the coalesced delay elapses");
        let post: f32 = out[delay_frames * 2..].iter().map(|s| s.abs()).sum();
        assert!(post > 0.0, "note sounds after the delay");
    }

    #[test]
    fn coarse_delay_scales_by_64() {
        // 0x41 = coarse 1 => 64ms.
        let data = wave_song(&[0x41, 0x80, 69, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        let delay_frames = ms_to_frames(64, RATE) as usize;
        let out = render(&mut bus, delay_frames + 64, 512);
        let pre: f32 = out[..delay_frames * 2].iter().map(|s| s.abs()).sum();
        assert_eq!(pre, 0.0);
    }

    #[test]
    fn zero_delay_repeat_still_advances() {
        // A repeating song with no delay at all must not hang.
        let data = wave_song(&[0x80, 69, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions { repeat: true, ..Default::default() });
        let out = render(&mut bus, 256, 256);
        assert_eq!(out.len(), 512, "render returned despite zero-progress song");
    }

    #[test]
    fn non_repeat_song_renders_silence_after_end() {
        let data = wave_song(&[0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        let out = render(&mut bus, 2048, 512);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(!bus.finished(), "silent is not finished; only kill/fade finishes");
        assert!(bus.idle());
    }

    #[test]
    fn malformed_opcode_halts_timeline() {
        // 0xf0: prefix 0b11 with reserved bits set.
        let data = wave_song(&[0x80, 69, 255, 0x3f, 0xf0, 0x80, 70, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        let _ = render(&mut bus, ms_to_frames(63, RATE) as usize + 256, 512);
        assert!(bus.halted(), "reserved opcode is a hard decode failure");
        assert_eq!(bus.channel(0).unwrap().live_voices(), 1, "note after the bad opcode never played");
    }

    #[test]
    fn truncated_event_halts_timeline() {
        let data = wave_song(&[0x3f, 0x80, 69]); // note-on missing its velocity byte
        let mut bus = make_bus(&data, BusOptions::default());
        let _ = render(&mut bus, 8192, 512);
        assert!(bus.halted());
    }

    #[test]
    fn hard_delay_prepends_silence() {
        let data = wave_song(&[0x80, 69, 255, 0x00]);
        let mut bus = make_bus(
            &data,
            BusOptions { start_delay_frames: 1000, ..Default::default() },
        );
        let out = render(&mut bus, 2048, 512);
        let pre: f32 = out[..2000].iter().map(|s| s.abs()).sum();
        assert_eq!(pre, 0.0, "hard delay renders silence");
        let post: f32 = out[2000..].iter().map(|s| s.abs()).sum();
        assert!(post > 0.0);
    }

    #[test]
    fn fade_out_midpoint_and_finish() {
        let data = wave_song(&[0x80, 69, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        bus.fade_out(RATE, false);

        // Render half a second: fade level should sit near 0.5.
        let _ = render(&mut bus, RATE as usize / 2, 512);
        let step = 1.0 / RATE as f32;
        assert!(
            (bus.fade_level() - 0.5).abs() <= step * 2.0,
            "midpoint level ~0.5, got {}",
            bus.fade_level()
        );
        assert!(!bus.finished(), "not finished before the fade completes");

        let _ = render(&mut bus, RATE as usize / 2 + 4, 512);
        assert!(bus.finished(), "finished at/after the final fade frame");
        assert_eq!(bus.fade_level(), 0.0);
    }

    #[test]
    fn fade_step_floor_bounds_duration() {
        let data = wave_song(&[0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        // Absurdly long request: floor clamps to a ~2s fade.
        bus.fade_out(RATE * 1000, false);
        let _ = render(&mut bus, RATE as usize * 2 + 8, 512);
        assert!(bus.finished(), "fade floor guarantees completion within ~2s");
    }

    #[test]
    fn cancel_fade_reverses_smoothly() {
        let data = wave_song(&[0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        bus.fade_out(RATE, false);
        let _ = render(&mut bus, RATE as usize / 4, 512);
        let level_at_cancel = bus.fade_level();
        assert!(level_at_cancel < 1.0 && level_at_cancel > 0.0);

        bus.cancel_fade();
        let _ = render(&mut bus, 64, 64);
        assert!(bus.fade_level() > level_at_cancel, "level climbs after cancel");
        let _ = render(&mut bus, RATE as usize / 4 + 8, 512);
        assert_eq!(bus.fade_level(), 1.0, "fade-in completes back at unity");
        assert!(!bus.finished());
    }

    #[test]
    fn immediate_fade_out_finishes_now() {
        let data = wave_song(&[0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        bus.fade_out(0, true);
        assert!(bus.finished());
        assert_eq!(bus.fade_level(), 0.0);
    }

    #[test]
    fn fade_in_option_starts_silent() {
        let data = wave_song(&[0x80, 69, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions { fade_in_frames: 1000, ..Default::default() });
        assert_eq!(bus.fade_level(), 0.0);
        let _ = render(&mut bus, 1200, 512);
        assert_eq!(bus.fade_level(), 1.0, "fade-in completes at unity");
    }

    #[test]
    fn wheel_event_reaches_channel() {
        let data = wave_song(&[0xc0, 0xff, 0x80, 69, 255, 0x00]);
        let mut bus = make_bus(&data, BusOptions::default());
        let _ = render(&mut bus, 64, 64);
        assert!(bus.channel(0).unwrap().wheel_mult() > 1.0, "wheel applied before the note");
    }

    #[test]
    fn rejects_bad_container() {
        let err = Bus::configure(b"EGX\x01", RATE, &shared_sine(), BusOptions::default(), 512)
            .unwrap_err();
        assert_eq!(err, DecodeError::BadMagic);

        let err = Bus::configure(b"EGS\x00", RATE, &shared_sine(), BusOptions::default(), 512)
            .unwrap_err();
        assert_eq!(err, DecodeError::BadChannelCount { count: 0 });
    }

    #[test]
    fn rejects_duplicate_channel() {
        let blocks = [
            channel_block(0, &level_env_field()),
            channel_block(0, &level_env_field()),
        ];
        let data = song(&blocks, &[0x00]);
        let err = Bus::configure(&data, RATE, &shared_sine(), BusOptions::default(), 512)
            .unwrap_err();
        assert_eq!(err, DecodeError::DuplicateChannel { chid: 0 });
    }
}
