//! Short audio cues played when an alert is emitted.
//!
//! Cues are rendered once into PCM clips and handed to a [`ToneSink`]. Playback
//! failures never leave this module: they are logged and the cue is dropped.

use crate::error::AppError;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const SAMPLE_RATE_HZ: u32 = 44_100;
pub const MAX_CUE_DURATION_MS: u32 = 400;

const ENVELOPE_FLOOR: f32 = 0.01;

/// The three cues the alert engine can request.
pub trait AudioCue: Send + Sync {
    fn play_bullish(&self);
    fn play_bearish(&self);
    fn play_urgent(&self);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    pub frequency_hz: f32,
    pub start_ms: u32,
    pub duration_ms: u32,
    pub gain: f32,
}

pub const BULLISH_TONES: [ToneSpec; 1] = [ToneSpec {
    frequency_hz: 880.0,
    start_ms: 0,
    duration_ms: 300,
    gain: 0.3,
}];

pub const BEARISH_TONES: [ToneSpec; 1] = [ToneSpec {
    frequency_hz: 330.0,
    start_ms: 0,
    duration_ms: 300,
    gain: 0.3,
}];

pub const URGENT_TONES: [ToneSpec; 2] = [
    ToneSpec {
        frequency_hz: 1_046.5,
        start_ms: 0,
        duration_ms: 150,
        gain: 0.4,
    },
    ToneSpec {
        frequency_hz: 1_046.5,
        start_ms: 200,
        duration_ms: 150,
        gain: 0.4,
    },
];

#[derive(Debug, Clone, PartialEq)]
pub struct ToneClip {
    pub label: &'static str,
    pub tone_count: usize,
    pub sample_rate_hz: u32,
    pub samples: Vec<f32>,
}

impl ToneClip {
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1_000 / u64::from(self.sample_rate_hz)
    }
}

/// Renders sine tones with an exponential decay towards `ENVELOPE_FLOOR`.
pub fn render_clip(label: &'static str, tones: &[ToneSpec], sample_rate_hz: u32) -> ToneClip {
    let end_ms = tones
        .iter()
        .map(|tone| tone.start_ms + tone.duration_ms)
        .max()
        .unwrap_or(0)
        .min(MAX_CUE_DURATION_MS);
    let total_samples = (u64::from(end_ms) * u64::from(sample_rate_hz) / 1_000) as usize;
    let mut samples = vec![0.0_f32; total_samples];
    let rate = sample_rate_hz as f32;

    for tone in tones {
        let start = (u64::from(tone.start_ms) * u64::from(sample_rate_hz) / 1_000) as usize;
        let length = (u64::from(tone.duration_ms) * u64::from(sample_rate_hz) / 1_000) as usize;
        let decay_ratio = ENVELOPE_FLOOR / tone.gain.max(ENVELOPE_FLOOR);

        for offset in 0..length {
            let Some(slot) = samples.get_mut(start + offset) else {
                break;
            };
            let t = offset as f32 / rate;
            let progress = offset as f32 / length as f32;
            let envelope = tone.gain * decay_ratio.powf(progress);
            *slot += envelope * (std::f32::consts::TAU * tone.frequency_hz * t).sin();
        }
    }

    ToneClip {
        label,
        tone_count: tones.len(),
        sample_rate_hz,
        samples,
    }
}

pub trait ToneSink: Send + Sync {
    fn play(&self, clip: &ToneClip) -> Result<(), AppError>;
}

/// Collects every clip it is asked to play.
#[derive(Debug, Default)]
pub struct BufferSink {
    clips: Mutex<Vec<ToneClip>>,
}

impl BufferSink {
    pub fn played(&self) -> Vec<&'static str> {
        self.clips.lock().iter().map(|clip| clip.label).collect()
    }

    pub fn take(&self) -> Vec<ToneClip> {
        std::mem::take(&mut *self.clips.lock())
    }
}

impl ToneSink for BufferSink {
    fn play(&self, clip: &ToneClip) -> Result<(), AppError> {
        self.clips.lock().push(clip.clone());
        Ok(())
    }
}

/// Rings the terminal bell once per tone in the clip.
#[derive(Debug, Default)]
pub struct TerminalBellSink;

impl ToneSink for TerminalBellSink {
    fn play(&self, clip: &ToneClip) -> Result<(), AppError> {
        let bells = "\x07".repeat(clip.tone_count.max(1));
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(bells.as_bytes())
            .and_then(|_| stdout.flush())
            .map_err(|error| AppError::AudioUnavailable(error.to_string()))
    }
}

/// Wraps a sink with a suspended flag, mirroring an output device that can be
/// paused by the platform.
#[derive(Debug, Default)]
pub struct SuspendableSink<S> {
    inner: S,
    suspended: AtomicBool,
}

impl<S> SuspendableSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            suspended: AtomicBool::new(false),
        }
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ToneSink> ToneSink for SuspendableSink<S> {
    fn play(&self, clip: &ToneClip) -> Result<(), AppError> {
        if self.suspended.load(Ordering::Relaxed) {
            return Err(AppError::AudioUnavailable(
                "audio output is suspended".to_string(),
            ));
        }
        self.inner.play(clip)
    }
}

pub struct ToneSynthesizer<S> {
    sink: S,
    bullish: ToneClip,
    bearish: ToneClip,
    urgent: ToneClip,
}

impl<S: ToneSink> ToneSynthesizer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            bullish: render_clip("bullish", &BULLISH_TONES, SAMPLE_RATE_HZ),
            bearish: render_clip("bearish", &BEARISH_TONES, SAMPLE_RATE_HZ),
            urgent: render_clip("urgent", &URGENT_TONES, SAMPLE_RATE_HZ),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn play_clip(&self, clip: &ToneClip) {
        match self.sink.play(clip) {
            Ok(()) => debug!(cue = clip.label, "audio cue played"),
            Err(error) => warn!(cue = clip.label, "audio cue dropped: {error}"),
        }
    }
}

impl<S: ToneSink> AudioCue for ToneSynthesizer<S> {
    fn play_bullish(&self) {
        self.play_clip(&self.bullish);
    }

    fn play_bearish(&self) {
        self.play_clip(&self.bearish);
    }

    fn play_urgent(&self) {
        self.play_clip(&self.urgent);
    }
}
