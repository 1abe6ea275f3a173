//! Turn queues (module F)
//!
//! Finalized captures land here before a reply driver consumes them.
//! Adjacent same-speaker turns coalesce into one instead of producing a
//! flurry of tiny replies; a turn that sat unconsumed too long is skipped
//! rather than answered late. The realtime and STT-pipeline drivers each
//! get their own [`TurnQueue`] with their own coalescing/stale-skip knobs;
//! a third [`DeferredQueue`] holds turns captured while the bot's own turn
//! was open, flushed back in once the floor is clear.

use std::collections::VecDeque;

use crate::capture::FinalizedCapture;
use crate::types::{CaptureReason, SpeakerId};

/// One turn waiting to be consumed by a reply driver.
#[derive(Debug, Clone)]
pub struct QueuedTurn {
    pub speaker_id: SpeakerId,
    pub pcm: Vec<u8>,
    pub capture_reason: CaptureReason,
    pub finalized_at_ms: u64,
    pub merged_count: u32,
}

impl QueuedTurn {
    fn from_capture(capture: FinalizedCapture, now_ms: u64) -> Self {
        Self {
            speaker_id: capture.speaker_id,
            pcm: capture.pcm,
            capture_reason: capture.reason,
            finalized_at_ms: now_ms,
            merged_count: 1,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.finalized_at_ms)
    }
}

/// Outcome of pushing a finalized capture onto a [`TurnQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued as a brand-new entry.
    Queued,
    /// Merged into the existing tail entry for the same speaker.
    Coalesced { merged_turn_count: u32, dropped_head_bytes: usize },
    /// The queue was at capacity; the oldest entry was evicted to make room.
    QueuedEvictingOldest,
}

/// A same-speaker, byte- and count-bounded turn queue shared by the
/// realtime and STT-pipeline drivers (each with its own instance and
/// tuning).
#[derive(Debug, Default)]
pub struct TurnQueue {
    entries: VecDeque<QueuedTurn>,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a newly finalized capture for the realtime queue: coalesces
    /// into the tail entry whenever it's from the same speaker (drain is
    /// always "active" in the sense that matters here — the tail is
    /// whatever hasn't been consumed yet), sliding the merge window by
    /// trimming from the head if it would exceed `merge_max_bytes` (spec
    /// §4.F "Realtime coalescing").
    pub fn push(
        &mut self,
        capture: FinalizedCapture,
        now_ms: u64,
        queue_max: usize,
        merge_max_bytes: usize,
    ) -> PushOutcome {
        if let Some(tail) = self.entries.back_mut() {
            if tail.speaker_id == capture.speaker_id {
                tail.pcm.extend_from_slice(&capture.pcm);
                tail.finalized_at_ms = now_ms;
                tail.merged_count += 1;

                let dropped_head_bytes = if tail.pcm.len() > merge_max_bytes {
                    let excess = tail.pcm.len() - merge_max_bytes;
                    tail.pcm.drain(..excess);
                    excess
                } else {
                    0
                };

                return PushOutcome::Coalesced { merged_turn_count: tail.merged_count, dropped_head_bytes };
            }
        }

        self.push_new_entry(capture, now_ms, queue_max)
    }

    /// Push a newly finalized capture for the STT queue: coalesces into the
    /// tail only when it is the same speaker, the same `captureReason`, the
    /// gap since the tail's last finalize is within `coalesce_window_ms`,
    /// and the combined size stays within `coalesce_max_bytes` — otherwise
    /// it is queued as a separate turn rather than sliding the merge window
    /// (spec §4.F "STT coalescing").
    pub fn push_stt(
        &mut self,
        capture: FinalizedCapture,
        now_ms: u64,
        queue_max: usize,
        coalesce_window_ms: u64,
        coalesce_max_bytes: usize,
    ) -> PushOutcome {
        if let Some(tail) = self.entries.back_mut() {
            let within_window = now_ms.saturating_sub(tail.finalized_at_ms) <= coalesce_window_ms;
            let combined_len = tail.pcm.len() + capture.pcm.len();
            if tail.speaker_id == capture.speaker_id
                && tail.capture_reason == capture.reason
                && within_window
                && combined_len <= coalesce_max_bytes
            {
                tail.pcm.extend_from_slice(&capture.pcm);
                tail.finalized_at_ms = now_ms;
                tail.merged_count += 1;
                return PushOutcome::Coalesced { merged_turn_count: tail.merged_count, dropped_head_bytes: 0 };
            }
        }

        self.push_new_entry(capture, now_ms, queue_max)
    }

    fn push_new_entry(&mut self, capture: FinalizedCapture, now_ms: u64, queue_max: usize) -> PushOutcome {
        let evicted = if self.entries.len() >= queue_max {
            self.entries.pop_front();
            true
        } else {
            false
        };
        self.entries.push_back(QueuedTurn::from_capture(capture, now_ms));
        if evicted {
            PushOutcome::QueuedEvictingOldest
        } else {
            PushOutcome::Queued
        }
    }

    /// Pop the next turn to process, skipping (and reporting) any turns
    /// that have gone stale while waiting. A turn is only eligible to be
    /// dropped as stale if another turn is queued behind it (spec §4.F,
    /// §8 property 3) — a lone stale turn with nothing backed up behind it
    /// is still processed. Returns the consumable turn, if any survived,
    /// plus the ages of the turns that were skipped.
    pub fn pop_ready(&mut self, now_ms: u64, stale_skip_ms: u64) -> (Option<QueuedTurn>, Vec<u64>) {
        let mut skipped_ages = Vec::new();
        while let Some(turn) = self.entries.pop_front() {
            let age_ms = turn.age_ms(now_ms);
            if age_ms >= stale_skip_ms && !self.entries.is_empty() {
                skipped_ages.push(age_ms);
                continue;
            }
            return (Some(turn), skipped_ages);
        }
        (None, skipped_ages)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A turn that was already transcribed when the decision engine returned
/// `bot_turn_open` or `awaiting_non_direct_silence_window` (spec §4.F).
/// Unlike [`QueuedTurn`] this carries the transcript alongside the PCM,
/// since the deferred flush re-evaluates the decision over concatenated
/// text *and* audio rather than re-running ASR.
#[derive(Debug, Clone)]
pub struct DeferredTurn {
    pub speaker_id: SpeakerId,
    pub pcm: Vec<u8>,
    pub transcript: String,
    pub queued_at_ms: u64,
}

impl DeferredTurn {
    pub fn new(speaker_id: SpeakerId, pcm: Vec<u8>, transcript: String, queued_at_ms: u64) -> Self {
        Self { speaker_id, pcm, transcript, queued_at_ms }
    }
}

/// Turns captured while the bot's own turn was open (spec §4.F,
/// `BotTurnOpenDeferredFlush`). Flushed back into the owning [`TurnQueue`]
/// once a flush-delay timer fires, coalescing up to a configured count
/// into a single re-evaluated turn so the flush doesn't reply to every
/// deferred fragment individually.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: VecDeque<DeferredTurn>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, turn: DeferredTurn, queue_max: usize) {
        if self.entries.len() >= queue_max {
            self.entries.pop_front();
        }
        self.entries.push_back(turn);
    }

    /// Drain up to `coalesce_max` entries and merge same-speaker-adjacent
    /// ones, concatenating both transcript and PCM, into a single
    /// flush-ready turn per speaker run.
    pub fn drain_coalesced(&mut self, coalesce_max: usize) -> Vec<DeferredTurn> {
        let mut out: Vec<DeferredTurn> = Vec::new();
        let mut taken = 0;
        while taken < coalesce_max {
            let Some(next) = self.entries.pop_front() else { break };
            taken += 1;
            match out.last_mut() {
                Some(last) if last.speaker_id == next.speaker_id => {
                    last.pcm.extend_from_slice(&next.pcm);
                    last.transcript.push(' ');
                    last.transcript.push_str(&next.transcript);
                    last.queued_at_ms = next.queued_at_ms;
                }
                _ => out.push(next),
            }
        }
        out
    }
}
