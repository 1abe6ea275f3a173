//! Action log events (spec §6)
//!
//! Every major transition is logged twice: through `tracing` for ordinary
//! log output, and as a typed [`ActionLogEvent`] a caller can serialize and
//! forward to a durable action log (out of scope for this crate, per
//! spec §1). This mirrors how the teacher's `metrics` module keeps a typed
//! record that is both logged and exposed for programmatic consumption.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActionLogEvent {
    VoiceSessionStart { guild_id: String, session_id: String, mode: String },
    VoiceSessionEnd { guild_id: String, session_id: String, reason: String, duration_ms: u64 },
    VoiceTurnIn { speaker_id: String, bytes: usize, capture_reason: String },
    VoiceTurnOut { text_len: usize },
    VoiceTurnFinalized { speaker_id: String, bytes: usize, capture_reason: String },
    VoiceTurnDroppedSilenceGate { speaker_id: String, bytes: usize },
    VoiceTurnDroppedLowSignalFallback { speaker_id: String },
    VoiceTurnAddressing { speaker_id: String, talking_to: String, confidence: f32 },
    VoiceTurnDeferredBotTurnOpen { speaker_id: String, reason: String },
    RealtimeTurnCoalesced { speaker_id: String, merged_turn_count: u32, dropped_head_bytes: usize },
    RealtimeTurnSkippedStale { speaker_id: String, age_ms: u64 },
    RealtimeReplySupersededNewerInput { request_id: String },
    RealtimeReplyRequested { request_id: String, speaker_id: String },
    OpenAiRealtimeEvent { kind: String, detail: String },
    ResponseSilentRetry { request_id: String, attempt: u32 },
    ResponseHardRecovery { request_id: String },
    ResponseSilentFallback { request_id: String },
    VoiceBargeInInterrupt { speaker_id: String },
    VoiceBargeInSuppressionCleared {},
    VoiceBargeInRetryRequested { speaker_id: String },
    VoiceBargeInRetrySkippedFullOverride { speaker_id: String },
    VoiceThoughtDecision { decision: String, topic_tether_strength: u32 },
    VoiceThoughtSpoken {},
    VoiceThoughtSkippedProbability { eagerness: u32 },
    BotAudioStreamLifecycle { phase: String },
    BotAudioQueueBacklog { queued_bytes: usize },
    VoiceRuntime { detail: String },
    VoiceError { detail: String },
}

impl ActionLogEvent {
    /// Emit through `tracing` at a level appropriate to the event kind, and
    /// return `self` so callers can also forward it to a durable sink.
    pub fn log(self) -> Self {
        let json = serde_json::to_string(&self).unwrap_or_else(|_| "<unserializable>".to_string());
        match &self {
            ActionLogEvent::VoiceError { .. }
            | ActionLogEvent::ResponseSilentFallback { .. } => error!(event = %json, "voice action log"),
            ActionLogEvent::VoiceTurnDroppedSilenceGate { .. }
            | ActionLogEvent::VoiceTurnDroppedLowSignalFallback { .. }
            | ActionLogEvent::ResponseSilentRetry { .. }
            | ActionLogEvent::ResponseHardRecovery { .. }
            | ActionLogEvent::RealtimeTurnSkippedStale { .. }
            | ActionLogEvent::BotAudioQueueBacklog { .. } => warn!(event = %json, "voice action log"),
            ActionLogEvent::VoiceSessionStart { .. }
            | ActionLogEvent::VoiceSessionEnd { .. }
            | ActionLogEvent::VoiceBargeInInterrupt { .. }
            | ActionLogEvent::VoiceThoughtSpoken { .. } => info!(event = %json, "voice action log"),
            _ => debug!(event = %json, "voice action log"),
        }
        self
    }
}
