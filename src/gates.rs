//! Signal gates (spec module B)
//!
//! RMS/peak/active-ratio analysis over raw PCM16 buffers, and the silence /
//! near-silence-abort / assertiveness decisions built on top of it. Mirrors
//! the energy-analysis shape of the teacher's `voice::vad` module (frame
//! energy + threshold comparison) but operates over a whole finalized or
//! in-progress capture buffer rather than frame-by-frame streaming.

use serde::{Deserialize, Serialize};

/// Samples with `|sample| >= active_sample_min_abs` count as "active" for
/// `active_ratio` purposes.
pub const ACTIVE_SAMPLE_MIN_ABS: i16 = 650;

/// Tunable thresholds for the silence gate and near-silence abort decisions.
/// Normalized fields are in `[0, 1]` relative to `i16::MAX`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateThresholds {
    pub silence_gate_min_clip_ms: u64,
    pub silence_gate_rms_max: f32,
    pub silence_gate_peak_max: f32,
    pub silence_gate_active_ratio_max: f32,
    pub near_silence_abort_min_age_ms: u64,
    pub near_silence_abort_active_ratio_max: f32,
    pub near_silence_abort_peak_max: f32,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            silence_gate_min_clip_ms: 600,
            silence_gate_rms_max: 0.015,
            silence_gate_peak_max: 0.05,
            silence_gate_active_ratio_max: 0.02,
            near_silence_abort_min_age_ms: 4_000,
            near_silence_abort_active_ratio_max: 0.015,
            near_silence_abort_peak_max: 0.04,
        }
    }
}

/// Running signal statistics for a mono PCM16 buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalStats {
    pub sample_count: usize,
    pub rms_normalized: f32,
    pub peak_normalized: f32,
    pub active_ratio: f32,
}

/// Analyze a mono 16-bit PCM buffer and return aggregate signal stats.
pub fn analyze_mono(pcm: &[u8]) -> SignalStats {
    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    if samples.is_empty() {
        return SignalStats { sample_count: 0, rms_normalized: 0.0, peak_normalized: 0.0, active_ratio: 0.0 };
    }

    let mut sum_sq: f64 = 0.0;
    let mut peak: i32 = 0;
    let mut active: usize = 0;

    for &s in &samples {
        sum_sq += (s as f64) * (s as f64);
        peak = peak.max(s.unsigned_abs() as i32);
        if s.unsigned_abs() as i32 >= ACTIVE_SAMPLE_MIN_ABS as i32 {
            active += 1;
        }
    }

    let rms = (sum_sq / samples.len() as f64).sqrt();

    SignalStats {
        sample_count: samples.len(),
        rms_normalized: (rms / i16::MAX as f64) as f32,
        peak_normalized: peak as f32 / i16::MAX as f32,
        active_ratio: active as f32 / samples.len() as f32,
    }
}

/// Estimated clip duration in milliseconds for mono 16-bit PCM at `rate_hz`.
pub fn estimate_duration_ms(byte_len: usize, rate_hz: u32) -> u64 {
    if rate_hz == 0 {
        return 0;
    }
    ((byte_len as f64) / (2.0 * rate_hz as f64) * 1000.0) as u64
}

/// Decide whether a finalized clip should be dropped as silence.
pub fn silence_gate(pcm: &[u8], rate_hz: u32, thresholds: &GateThresholds) -> bool {
    let duration_ms = estimate_duration_ms(pcm.len(), rate_hz);
    if duration_ms < thresholds.silence_gate_min_clip_ms {
        return false;
    }

    let stats = analyze_mono(pcm);
    stats.rms_normalized <= thresholds.silence_gate_rms_max
        && stats.peak_normalized <= thresholds.silence_gate_peak_max
        && stats.active_ratio <= thresholds.silence_gate_active_ratio_max
}

/// Decide whether an in-progress capture should be aborted as near-silent
/// noise. `age_ms` is the capture's current age; `stats` its running stats.
pub fn near_silence_abort(age_ms: u64, stats: &SignalStats, thresholds: &GateThresholds) -> bool {
    age_ms >= thresholds.near_silence_abort_min_age_ms
        && stats.active_ratio <= thresholds.near_silence_abort_active_ratio_max
        && stats.peak_normalized <= thresholds.near_silence_abort_peak_max
}

/// Whether a capture's current stats qualify as "assertive" speech, strong
/// enough to justify a barge-in or an activity touch.
pub fn assertive(stats: &SignalStats, thresholds: &GateThresholds) -> bool {
    stats.active_ratio > thresholds.silence_gate_active_ratio_max
        || stats.peak_normalized > thresholds.silence_gate_peak_max
}
