//! Frozen per-session configuration snapshot.
//!
//! `VoiceSettings` is passed into a [`crate::session::Session`] as an
//! `Arc<VoiceSettings>` at creation time and replaced wholesale (never
//! mutated in place) by `reconcile_settings`. Field grouping and the
//! per-field `default_x()` + `#[serde(default = "...")]` pattern mirrors
//! `config::ModelsConfig` / `config::OpenRouterConfig`.

use serde::{Deserialize, Serialize};

use crate::gates::GateThresholds;

/// Top-level immutable settings snapshot for one voice session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    #[serde(default)]
    pub gates: GateThresholds,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub barge_in: BargeInSettings,
    #[serde(default)]
    pub turn_queues: TurnQueueSettings,
    #[serde(default)]
    pub addressing: AddressingSettings,
    #[serde(default)]
    pub decision: DecisionSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub realtime_driver: RealtimeDriverSettings,
    #[serde(default)]
    pub stt_driver: SttDriverSettings,
    #[serde(default)]
    pub thought_loop: ThoughtLoopSettings,
    #[serde(default)]
    pub models: ModelSettings,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            gates: GateThresholds::default(),
            capture: CaptureSettings::default(),
            playback: PlaybackSettings::default(),
            barge_in: BargeInSettings::default(),
            turn_queues: TurnQueueSettings::default(),
            addressing: AddressingSettings::default(),
            decision: DecisionSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            realtime_driver: RealtimeDriverSettings::default(),
            stt_driver: SttDriverSettings::default(),
            thought_loop: ThoughtLoopSettings::default(),
            models: ModelSettings::default(),
        }
    }
}

impl VoiceSettings {
    /// Apply every documented clamp in place. Called once when a settings
    /// snapshot is constructed or reconciled.
    pub fn clamp(mut self) -> Self {
        self.orchestrator.max_session_minutes = self.orchestrator.max_session_minutes.clamp(1, 120);
        self.orchestrator.inactivity_leave_seconds = self.orchestrator.inactivity_leave_seconds.clamp(20, 3600);
        self.addressing.direct_address_confidence_threshold =
            self.addressing.direct_address_confidence_threshold.clamp(0.0, 1.0);
        self.orchestrator.eagerness = self.orchestrator.eagerness.min(100);
        self
    }
}

// ─── Capture tracker (module C) ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_activity_touch_throttle_ms")]
    pub activity_touch_throttle_ms: u64,
    #[serde(default = "default_capture_idle_flush_ms")]
    pub capture_idle_flush_ms: u64,
    #[serde(default = "default_capture_max_duration_ms")]
    pub capture_max_duration_ms: u64,
    /// Base settle delay for a capture with only a trickle of recent audio.
    #[serde(default = "default_settle_delay_micro_ms")]
    pub settle_delay_micro_ms: u64,
    /// Base settle delay for a short, unremarkable utterance.
    #[serde(default = "default_settle_delay_short_ms")]
    pub settle_delay_short_ms: u64,
    /// Base settle delay for a longer, assertive utterance.
    #[serde(default = "default_settle_delay_quick_ms")]
    pub settle_delay_quick_ms: u64,
    /// Concurrent-capture count at/above which the "busy" scale applies.
    #[serde(default = "default_busy_capture_threshold")]
    pub busy_capture_threshold: usize,
    /// Concurrent-capture count at/above which the "heavy" scale applies.
    #[serde(default = "default_heavy_capture_threshold")]
    pub heavy_capture_threshold: usize,
    #[serde(default = "default_settle_scale_busy")]
    pub settle_scale_busy: f32,
    #[serde(default = "default_settle_scale_heavy")]
    pub settle_scale_heavy: f32,
}

fn default_activity_touch_throttle_ms() -> u64 { 2_000 }
fn default_capture_idle_flush_ms() -> u64 { 1_200 }
fn default_capture_max_duration_ms() -> u64 { 60_000 }
fn default_settle_delay_micro_ms() -> u64 { 120 }
fn default_settle_delay_short_ms() -> u64 { 300 }
fn default_settle_delay_quick_ms() -> u64 { 550 }
fn default_busy_capture_threshold() -> usize { 2 }
fn default_heavy_capture_threshold() -> usize { 4 }
fn default_settle_scale_busy() -> f32 { 1.4 }
fn default_settle_scale_heavy() -> f32 { 2.0 }

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            activity_touch_throttle_ms: default_activity_touch_throttle_ms(),
            capture_idle_flush_ms: default_capture_idle_flush_ms(),
            capture_max_duration_ms: default_capture_max_duration_ms(),
            settle_delay_micro_ms: default_settle_delay_micro_ms(),
            settle_delay_short_ms: default_settle_delay_short_ms(),
            settle_delay_quick_ms: default_settle_delay_quick_ms(),
            busy_capture_threshold: default_busy_capture_threshold(),
            heavy_capture_threshold: default_heavy_capture_threshold(),
            settle_scale_busy: default_settle_scale_busy(),
            settle_scale_heavy: default_settle_scale_heavy(),
        }
    }
}

impl CaptureSettings {
    /// Compute the speaking-end settle delay given a speech-duration tier
    /// hint (`base_tier_ms`, one of the three configured tiers) scaled by
    /// how busy the session currently is (concurrent captures + queue
    /// backlog).
    pub fn settle_delay_ms(&self, base_tier_ms: u64, concurrent_captures: usize, queue_backlog: usize) -> u64 {
        let load = concurrent_captures + queue_backlog;
        let scale = if load >= self.heavy_capture_threshold {
            self.settle_scale_heavy
        } else if load >= self.busy_capture_threshold {
            self.settle_scale_busy
        } else {
            1.0
        };
        ((base_tier_ms as f64) * (scale as f64)) as u64
    }
}

// ─── Playback queue (module D) ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlaybackSettings {
    #[serde(default = "default_playback_warn_bytes")]
    pub playback_queue_warn_bytes: usize,
    #[serde(default = "default_playback_hard_max_bytes")]
    pub playback_queue_hard_max_bytes: usize,
    #[serde(default = "default_pump_chunk_bytes")]
    pub pump_chunk_bytes: usize,
    #[serde(default = "default_warn_cooldown_ms")]
    pub warn_cooldown_ms: u64,
}

fn default_playback_warn_bytes() -> usize { 96_000 }
fn default_playback_hard_max_bytes() -> usize { 960_000 }
fn default_pump_chunk_bytes() -> usize { 3_840 } // 20ms of 48kHz stereo16
fn default_warn_cooldown_ms() -> u64 { 5_000 }

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            playback_queue_warn_bytes: default_playback_warn_bytes(),
            playback_queue_hard_max_bytes: default_playback_hard_max_bytes(),
            pump_chunk_bytes: default_pump_chunk_bytes(),
            warn_cooldown_ms: default_warn_cooldown_ms(),
        }
    }
}

// ─── Reply lock & barge-in (module E) ───────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BargeInSettings {
    #[serde(default = "default_bot_turn_silence_reset_ms")]
    pub bot_turn_silence_reset_ms: u64,
    #[serde(default = "default_barge_in_assertion_ms")]
    pub barge_in_assertion_ms: u64,
    #[serde(default = "default_barge_in_min_speech_ms")]
    pub barge_in_min_speech_ms: u64,
    #[serde(default = "default_barge_in_suppression_max_ms")]
    pub barge_in_suppression_max_ms: u64,
    #[serde(default = "default_barge_in_full_override_min_ms")]
    pub barge_in_full_override_min_ms: u64,
    #[serde(default = "default_barge_in_retry_max_age_ms")]
    pub barge_in_retry_max_age_ms: u64,
}

fn default_bot_turn_silence_reset_ms() -> u64 { 2_500 }
fn default_barge_in_assertion_ms() -> u64 { 250 }
fn default_barge_in_min_speech_ms() -> u64 { 300 }
fn default_barge_in_suppression_max_ms() -> u64 { 1_500 }
fn default_barge_in_full_override_min_ms() -> u64 { 600 }
fn default_barge_in_retry_max_age_ms() -> u64 { 8_000 }

impl Default for BargeInSettings {
    fn default() -> Self {
        Self {
            bot_turn_silence_reset_ms: default_bot_turn_silence_reset_ms(),
            barge_in_assertion_ms: default_barge_in_assertion_ms(),
            barge_in_min_speech_ms: default_barge_in_min_speech_ms(),
            barge_in_suppression_max_ms: default_barge_in_suppression_max_ms(),
            barge_in_full_override_min_ms: default_barge_in_full_override_min_ms(),
            barge_in_retry_max_age_ms: default_barge_in_retry_max_age_ms(),
        }
    }
}

// ─── Turn queues (module F) ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TurnQueueSettings {
    #[serde(default = "default_realtime_turn_queue_max")]
    pub realtime_turn_queue_max: usize,
    #[serde(default = "default_stt_turn_queue_max")]
    pub stt_turn_queue_max: usize,
    #[serde(default = "default_bot_turn_deferred_queue_max")]
    pub bot_turn_deferred_queue_max: usize,
    #[serde(default = "default_realtime_turn_pending_merge_max_bytes")]
    pub realtime_turn_pending_merge_max_bytes: usize,
    #[serde(default = "default_stt_turn_coalesce_window_ms")]
    pub stt_turn_coalesce_window_ms: u64,
    #[serde(default = "default_stt_turn_coalesce_max_bytes")]
    pub stt_turn_coalesce_max_bytes: usize,
    #[serde(default = "default_realtime_turn_stale_skip_ms")]
    pub realtime_turn_stale_skip_ms: u64,
    #[serde(default = "default_stt_turn_stale_skip_ms")]
    pub stt_turn_stale_skip_ms: u64,
    #[serde(default = "default_bot_turn_deferred_flush_delay_ms")]
    pub bot_turn_deferred_flush_delay_ms: u64,
    #[serde(default = "default_bot_turn_deferred_coalesce_max")]
    pub bot_turn_deferred_coalesce_max: usize,
}

fn default_realtime_turn_queue_max() -> usize { 8 }
fn default_stt_turn_queue_max() -> usize { 8 }
fn default_bot_turn_deferred_queue_max() -> usize { 4 }
fn default_realtime_turn_pending_merge_max_bytes() -> usize { 960_000 }
fn default_stt_turn_coalesce_window_ms() -> u64 { 1_200 }
fn default_stt_turn_coalesce_max_bytes() -> usize { 960_000 }
fn default_realtime_turn_stale_skip_ms() -> u64 { 6_000 }
fn default_stt_turn_stale_skip_ms() -> u64 { 8_000 }
fn default_bot_turn_deferred_flush_delay_ms() -> u64 { 1_500 }
fn default_bot_turn_deferred_coalesce_max() -> usize { 3 }

impl Default for TurnQueueSettings {
    fn default() -> Self {
        Self {
            realtime_turn_queue_max: default_realtime_turn_queue_max(),
            stt_turn_queue_max: default_stt_turn_queue_max(),
            bot_turn_deferred_queue_max: default_bot_turn_deferred_queue_max(),
            realtime_turn_pending_merge_max_bytes: default_realtime_turn_pending_merge_max_bytes(),
            stt_turn_coalesce_window_ms: default_stt_turn_coalesce_window_ms(),
            stt_turn_coalesce_max_bytes: default_stt_turn_coalesce_max_bytes(),
            realtime_turn_stale_skip_ms: default_realtime_turn_stale_skip_ms(),
            stt_turn_stale_skip_ms: default_stt_turn_stale_skip_ms(),
            bot_turn_deferred_flush_delay_ms: default_bot_turn_deferred_flush_delay_ms(),
            bot_turn_deferred_coalesce_max: default_bot_turn_deferred_coalesce_max(),
        }
    }
}

// ─── Addressing classifier (module G) ───────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AddressingSettings {
    #[serde(default = "default_direct_address_confidence_threshold")]
    pub direct_address_confidence_threshold: f32,
    #[serde(default = "default_focused_speaker_continuation_ms")]
    pub focused_speaker_continuation_ms: u64,
    #[serde(default = "default_direct_address_cross_speaker_wake_ms")]
    pub direct_address_cross_speaker_wake_ms: u64,
}

fn default_direct_address_confidence_threshold() -> f32 { 0.62 }
fn default_focused_speaker_continuation_ms() -> u64 { 20_000 }
fn default_direct_address_cross_speaker_wake_ms() -> u64 { 6_000 }

impl Default for AddressingSettings {
    fn default() -> Self {
        Self {
            direct_address_confidence_threshold: default_direct_address_confidence_threshold(),
            focused_speaker_continuation_ms: default_focused_speaker_continuation_ms(),
            direct_address_cross_speaker_wake_ms: default_direct_address_cross_speaker_wake_ms(),
        }
    }
}

// ─── Reply decision engine (module H) ───────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecisionSettings {
    #[serde(default = "default_voice_thought_loop_busy_retry_ms")]
    pub voice_thought_loop_busy_retry_ms: u64,
    #[serde(default = "default_low_signal_post_reply_max_clip_ms")]
    pub low_signal_post_reply_max_clip_ms: u64,
    #[serde(default = "default_non_direct_reply_min_silence_ms")]
    pub non_direct_reply_min_silence_ms: u64,
    #[serde(default = "default_decision_llm_max_attempts")]
    pub decision_llm_max_attempts: u32,
    /// Low-signal fragment length cutoff in characters.
    #[serde(default = "default_low_signal_fragment_max_chars")]
    pub low_signal_fragment_max_chars: usize,
}

fn default_voice_thought_loop_busy_retry_ms() -> u64 { 4_000 }
fn default_low_signal_post_reply_max_clip_ms() -> u64 { 900 }
fn default_non_direct_reply_min_silence_ms() -> u64 { 1_200 }
fn default_decision_llm_max_attempts() -> u32 { 3 }
fn default_low_signal_fragment_max_chars() -> usize { 12 }

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            voice_thought_loop_busy_retry_ms: default_voice_thought_loop_busy_retry_ms(),
            low_signal_post_reply_max_clip_ms: default_low_signal_post_reply_max_clip_ms(),
            non_direct_reply_min_silence_ms: default_non_direct_reply_min_silence_ms(),
            decision_llm_max_attempts: default_decision_llm_max_attempts(),
            low_signal_fragment_max_chars: default_low_signal_fragment_max_chars(),
        }
    }
}

// ─── Session orchestrator (module I) ────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    #[serde(default = "default_max_session_minutes")]
    pub max_session_minutes: u32,
    #[serde(default = "default_inactivity_leave_seconds")]
    pub inactivity_leave_seconds: u32,
    #[serde(default = "default_activity_touch_min_speech_ms")]
    pub activity_touch_min_speech_ms: u64,
    #[serde(default = "default_bot_disconnect_grace_ms")]
    pub bot_disconnect_grace_ms: u64,
    /// Personality-level eagerness in `[0, 100]`: gates decision rule 7
    /// ("eagerness zero and not direct-addressed → deny") and the thought
    /// loop's per-cycle probability roll.
    #[serde(default = "default_eagerness")]
    pub eagerness: u32,
}

fn default_max_session_minutes() -> u32 { 60 }
fn default_inactivity_leave_seconds() -> u32 { 300 }
fn default_activity_touch_min_speech_ms() -> u64 { 400 }
fn default_bot_disconnect_grace_ms() -> u64 { 10_000 }
fn default_eagerness() -> u32 { 50 }

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_session_minutes: default_max_session_minutes(),
            inactivity_leave_seconds: default_inactivity_leave_seconds(),
            activity_touch_min_speech_ms: default_activity_touch_min_speech_ms(),
            bot_disconnect_grace_ms: default_bot_disconnect_grace_ms(),
            eagerness: default_eagerness(),
        }
    }
}

// ─── Realtime reply driver (module J) ───────────────────────────────────

/// Which generation path the realtime driver uses to produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeStrategy {
    /// Feed audio straight into the realtime model's own turn-taking.
    #[default]
    Native,
    /// Run the orchestrating "brain" call and plan an explicit step sequence.
    Brain,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RealtimeDriverSettings {
    #[serde(default)]
    pub strategy: RealtimeStrategy,
    #[serde(default = "default_voice_turn_min_asr_clip_ms")]
    pub voice_turn_min_asr_clip_ms: u64,
    #[serde(default = "default_response_flush_debounce_ms")]
    pub response_flush_debounce_ms: u64,
    #[serde(default = "default_realtime_commit_minimum_ms")]
    pub realtime_commit_minimum_ms: u64,
    #[serde(default = "default_response_silence_retry_delay_ms")]
    pub response_silence_retry_delay_ms: u64,
    #[serde(default = "default_max_response_silence_retries")]
    pub max_response_silence_retries: u32,
    #[serde(default = "default_response_done_silence_grace_ms")]
    pub response_done_silence_grace_ms: u64,
    #[serde(default = "default_instructions_max_chars")]
    pub instructions_max_chars: usize,
}

fn default_voice_turn_min_asr_clip_ms() -> u64 { 250 }
fn default_response_flush_debounce_ms() -> u64 { 400 }
fn default_realtime_commit_minimum_ms() -> u64 { 100 }
fn default_response_silence_retry_delay_ms() -> u64 { 3_500 }
fn default_max_response_silence_retries() -> u32 { 2 }
fn default_response_done_silence_grace_ms() -> u64 { 1_500 }
fn default_instructions_max_chars() -> usize { 5_200 }

impl Default for RealtimeDriverSettings {
    fn default() -> Self {
        Self {
            strategy: RealtimeStrategy::default(),
            voice_turn_min_asr_clip_ms: default_voice_turn_min_asr_clip_ms(),
            response_flush_debounce_ms: default_response_flush_debounce_ms(),
            realtime_commit_minimum_ms: default_realtime_commit_minimum_ms(),
            response_silence_retry_delay_ms: default_response_silence_retry_delay_ms(),
            max_response_silence_retries: default_max_response_silence_retries(),
            response_done_silence_grace_ms: default_response_done_silence_grace_ms(),
            instructions_max_chars: default_instructions_max_chars(),
        }
    }
}

impl RealtimeDriverSettings {
    /// Minimum buffered bytes (mono16 PCM at `rate_hz`) required before a
    /// commit is allowed, derived from `realtime_commit_minimum_ms`.
    pub fn commit_minimum_bytes(&self, rate_hz: u32) -> usize {
        ((rate_hz as u64) * 2 * self.realtime_commit_minimum_ms / 1000) as usize
    }
}

// ─── STT-pipeline reply driver (module K) ───────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SttDriverSettings {
    #[serde(default = "default_stt_tts_conversion_chunk_ms")]
    pub stt_tts_conversion_chunk_ms: u64,
    #[serde(default = "default_stt_tts_conversion_yield_every_chunks")]
    pub stt_tts_conversion_yield_every_chunks: u32,
}

fn default_stt_tts_conversion_chunk_ms() -> u64 { 400 }
fn default_stt_tts_conversion_yield_every_chunks() -> u32 { 4 }

impl Default for SttDriverSettings {
    fn default() -> Self {
        Self {
            stt_tts_conversion_chunk_ms: default_stt_tts_conversion_chunk_ms(),
            stt_tts_conversion_yield_every_chunks: default_stt_tts_conversion_yield_every_chunks(),
        }
    }
}

// ─── Thought loop (module L) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThoughtLoopSettings {
    #[serde(default = "default_min_silence_seconds")]
    pub min_silence_seconds: u64,
    #[serde(default = "default_min_seconds_between_thoughts")]
    pub min_seconds_between_thoughts: u64,
    /// Silence duration (seconds) at which topic drift is considered to begin.
    #[serde(default = "default_topical_start_seconds")]
    pub topical_start_seconds: u64,
    /// Silence duration (seconds) at which drift is considered complete.
    #[serde(default = "default_full_drift_seconds")]
    pub full_drift_seconds: u64,
}

fn default_min_silence_seconds() -> u64 { 45 }
fn default_min_seconds_between_thoughts() -> u64 { 90 }
fn default_topical_start_seconds() -> u64 { 45 }
fn default_full_drift_seconds() -> u64 { 600 }

impl Default for ThoughtLoopSettings {
    fn default() -> Self {
        Self {
            min_silence_seconds: default_min_silence_seconds(),
            min_seconds_between_thoughts: default_min_seconds_between_thoughts(),
            topical_start_seconds: default_topical_start_seconds(),
            full_drift_seconds: default_full_drift_seconds(),
        }
    }
}

// ─── Model identity (shared by both reply drivers) ──────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_primary_asr_model")]
    pub primary_asr_model: String,
    #[serde(default)]
    pub fallback_asr_model: Option<String>,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_tts_sample_rate_hz")]
    pub tts_sample_rate_hz: u32,
    /// Low-signal fallback-transcript character cutoff: a fallback-model
    /// transcript at or under this length is treated as noise rather than
    /// speech.
    #[serde(default = "default_fallback_low_signal_max_chars")]
    pub fallback_low_signal_max_chars: usize,
}

fn default_primary_asr_model() -> String { "asr-primary".to_string() }
fn default_tts_voice() -> String { "default".to_string() }
fn default_tts_sample_rate_hz() -> u32 { 24_000 }
fn default_fallback_low_signal_max_chars() -> usize { 3 }

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            primary_asr_model: default_primary_asr_model(),
            fallback_asr_model: Some("asr-fallback".to_string()),
            tts_voice: default_tts_voice(),
            tts_sample_rate_hz: default_tts_sample_rate_hz(),
            fallback_low_signal_max_chars: default_fallback_low_signal_max_chars(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let settings = VoiceSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: VoiceSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.orchestrator.max_session_minutes, settings.orchestrator.max_session_minutes);
    }

    #[test]
    fn clamp_bounds_session_minutes() {
        let mut settings = VoiceSettings::default();
        settings.orchestrator.max_session_minutes = 999;
        settings.orchestrator.inactivity_leave_seconds = 1;
        let clamped = settings.clamp();
        assert_eq!(clamped.orchestrator.max_session_minutes, 120);
        assert_eq!(clamped.orchestrator.inactivity_leave_seconds, 20);
    }

    #[test]
    fn clamp_bounds_eagerness() {
        let mut settings = VoiceSettings::default();
        settings.orchestrator.eagerness = 250;
        assert_eq!(settings.clamp().orchestrator.eagerness, 100);
    }

    #[test]
    fn partial_json_uses_field_defaults() {
        let parsed: VoiceSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.orchestrator.max_session_minutes, default_max_session_minutes());
    }

    #[test]
    fn settle_delay_scales_with_load() {
        let capture = CaptureSettings::default();
        let base = capture.settle_delay_short_ms;
        assert_eq!(capture.settle_delay_ms(base, 0, 0), base);
        let busy = capture.settle_delay_ms(base, capture.busy_capture_threshold, 0);
        assert!(busy > base);
        let heavy = capture.settle_delay_ms(base, capture.heavy_capture_threshold, 0);
        assert!(heavy > busy);
    }

    #[test]
    fn commit_minimum_bytes_scales_with_rate() {
        let settings = RealtimeDriverSettings::default();
        assert_eq!(settings.commit_minimum_bytes(24_000), 24_000 * 2 * 100 / 1000);
    }
}
