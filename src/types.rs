//! Shared data model types used across modules (spec §3)
//!
//! Grouped here, in the teacher's original `types.rs` style, to avoid
//! circular dependencies between `session`, `turns`, `addressing`, and the
//! reply drivers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A Discord snowflake id, opaque to this crate.
pub type SpeakerId = String;

/// The session's reply mode, fixed for the session's lifetime (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    VoiceAgent,
    OpenAiRealtime,
    SttPipeline,
}

/// Why a capture was finalized (spec §4.C). Threaded through to the
/// `QueuedTurn` and used by STT coalescing (same-speaker + same-reason).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureReason {
    SpeakingEnd,
    IdleFlush,
    MaxDuration,
    NearSilenceAbort,
    StreamError,
    BotTurnOpenDeferredFlush,
}

impl std::fmt::Display for CaptureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CaptureReason::SpeakingEnd => "speaking_end",
            CaptureReason::IdleFlush => "idle_flush",
            CaptureReason::MaxDuration => "max_duration",
            CaptureReason::NearSilenceAbort => "near_silence_abort",
            CaptureReason::StreamError => "stream_error",
            CaptureReason::BotTurnOpenDeferredFlush => "bot_turn_open_deferred_flush",
        };
        write!(f, "{}", s)
    }
}

/// Role of a voice-turn context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceRole {
    User,
    Assistant,
}

/// One entry in the bounded conversational context used by the decision
/// engine and the reply drivers (spec §3, "VoiceTurn").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTurn {
    pub role: VoiceRole,
    pub speaker_id: Option<SpeakerId>,
    pub speaker_name: Option<String>,
    pub text: String,
    pub at_ms: u64,
    pub addressing: Option<AddressingAnnotation>,
}

/// Who a user turn was directed at, and how confidently (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressingAnnotation {
    pub talking_to: TalkingTo,
    pub directed_confidence: f32,
    pub source: AddressingSource,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TalkingTo {
    Me,
    All,
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressingSource {
    DeterministicWake,
    DeterministicVocative,
    Classifier,
    Default,
}

/// A join/leave event for the session roster (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub speaker_id: SpeakerId,
    pub display_name: String,
    pub kind: MembershipKind,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipKind {
    Join,
    Leave,
}

/// A fixed-capacity ring buffer, used for the context/transcript timelines
/// and the membership-event log (spec §3: "bounded ring buffers").
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), items: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.iter().cloned().collect()
    }
}

// ─── Runtime introspection snapshot (spec §6) ───────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub guild_id: String,
    pub mode: SessionMode,
    pub started_at_ms: u64,
    pub last_activity_at_ms: u64,
    pub max_ends_at_ms: u64,
    pub inactivity_ends_at_ms: u64,
    pub participants: Vec<String>,
    pub active_captures: Vec<String>,
    pub pending_deferred_turns: usize,
    pub recent_turns: Vec<VoiceTurn>,
    pub realtime: Option<RealtimeSnapshot>,
    pub stt: Option<SttSnapshot>,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSnapshot {
    pub pending_turns: usize,
    pub drain_active: bool,
    pub superseded_count: u64,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSnapshot {
    pub pending_turns: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub recent_turns_ms: Vec<u64>,
    pub average_ms: f64,
    pub turn_count: u64,
}

impl LatencySnapshot {
    pub fn record(&mut self, elapsed_ms: u64, window: usize) {
        self.recent_turns_ms.push(elapsed_ms);
        if self.recent_turns_ms.len() > window {
            self.recent_turns_ms.remove(0);
        }
        self.turn_count += 1;
        let sum: u64 = self.recent_turns_ms.iter().sum();
        self.average_ms = sum as f64 / self.recent_turns_ms.len() as f64;
    }
}
