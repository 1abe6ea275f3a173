//! Thought loop (module L)
//!
//! During a long silence the session may speak up on its own: one short,
//! topic-drift-biased line, gated by an eagerness roll and a second
//! JSON-contract decider before it is ever delivered. Mirrors the
//! teacher's `soul::heartbeat` idle-tick shape (a recurring timer that
//! checks whether conditions allow an autonomous action, then rolls a
//! probability before taking it) adapted to a single self-initiated
//! utterance instead of a background job queue.

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::action_log::ActionLogEvent;

/// Minimum repoll interval so an ineligible session doesn't arm a timer
/// for 0ms and spin.
const MIN_POLL_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriftBucket {
    Anchored,
    Blended,
    Ambient,
}

impl DriftBucket {
    fn from_tether_strength(tether_strength: u32) -> Self {
        if tether_strength >= 70 {
            DriftBucket::Anchored
        } else if tether_strength >= 30 {
            DriftBucket::Blended
        } else {
            DriftBucket::Ambient
        }
    }

    fn prompt_hint(self) -> &'static str {
        match self {
            DriftBucket::Anchored => {
                "Stay closely tied to the last topic discussed; offer a brief, relevant follow-up thought."
            }
            DriftBucket::Blended => {
                "The conversation has drifted a little; you may loosely connect back to the last topic or gently introduce something adjacent."
            }
            DriftBucket::Ambient => {
                "The room has been quiet for a while; the last topic is stale. Offer a short, low-stakes ambient remark unrelated to needing a reply."
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ThoughtVerdict {
    accept: bool,
    #[serde(default)]
    rewrite: Option<String>,
}

impl crate::session::Session {
    /// Arm (or re-arm) the recurring thought-loop check. Called once at
    /// session construction and again every time the loop runs, regardless
    /// of whether it actually spoke.
    pub fn arm_thought_loop_timer(&mut self) {
        let delay_ms = self.next_thought_check_delay_ms();
        self.timers.thought_loop.schedule(delay_ms, self.tx.clone(), crate::session::SessionEvent::ThoughtLoopDue);
    }

    fn next_thought_check_delay_ms(&self) -> u64 {
        let now_ms = self.clock.now_ms();
        let settings = &self.settings.thought_loop;
        let min_silence_ms = settings.min_silence_seconds * 1_000;
        let min_between_ms = settings.min_seconds_between_thoughts * 1_000;

        let silence_ms = now_ms.saturating_sub(self.last_activity_at_ms);
        let mut delay_ms = min_silence_ms.saturating_sub(silence_ms);

        if let Some(last_thought_at) = self.last_thought_at_ms {
            let since_last_thought_ms = now_ms.saturating_sub(last_thought_at);
            delay_ms = delay_ms.max(min_between_ms.saturating_sub(since_last_thought_ms));
        }

        delay_ms.max(MIN_POLL_MS)
    }

    /// Handle a fired `ThoughtLoopDue` timer: check every idle gate, roll
    /// eagerness, draft and verify a line, then deliver it. Always
    /// re-arms the timer for the next cycle on the way out.
    pub async fn drive_thought_loop(&mut self) {
        if !self.thought_loop_is_idle() {
            self.arm_thought_loop_timer();
            return;
        }

        let now_ms = self.clock.now_ms();
        let settings = self.settings.thought_loop;
        let silence_ms = now_ms.saturating_sub(self.last_activity_at_ms);
        if silence_ms < settings.min_silence_seconds * 1_000 {
            self.arm_thought_loop_timer();
            return;
        }
        if let Some(last_thought_at) = self.last_thought_at_ms {
            if now_ms.saturating_sub(last_thought_at) < settings.min_seconds_between_thoughts * 1_000 {
                self.arm_thought_loop_timer();
                return;
            }
        }

        let eagerness = self.settings.orchestrator.eagerness;
        if !roll_eagerness(eagerness) {
            ActionLogEvent::VoiceThoughtSkippedProbability { eagerness }.log();
            self.arm_thought_loop_timer();
            return;
        }

        let silence_s = silence_ms / 1_000;
        let drift_progress = if settings.full_drift_seconds > settings.topical_start_seconds {
            ((silence_s.saturating_sub(settings.topical_start_seconds)) as f64
                / (settings.full_drift_seconds - settings.topical_start_seconds) as f64)
                .clamp(0.0, 1.0)
        } else {
            1.0
        };
        let topic_tether_strength = ((1.0 - drift_progress) * 100.0).round() as u32;
        let bucket = DriftBucket::from_tether_strength(topic_tether_strength);

        let draft = self.draft_thought(bucket).await;
        let Some(draft) = draft else {
            self.arm_thought_loop_timer();
            return;
        };

        let verdict = self.judge_thought(&draft).await;
        match verdict {
            Some(verdict) if verdict.accept => {
                ActionLogEvent::VoiceThoughtDecision { decision: "accept".to_string(), topic_tether_strength }.log();
                let line = verdict.rewrite.unwrap_or(draft);
                self.deliver_thought(line).await;
                self.last_thought_at_ms = Some(now_ms);
                ActionLogEvent::VoiceThoughtSpoken {}.log();
            }
            _ => {
                ActionLogEvent::VoiceThoughtDecision { decision: "reject".to_string(), topic_tether_strength }.log();
            }
        }

        self.arm_thought_loop_timer();
    }

    /// "No captures, no queue, no lock, no lookup-busy" (spec §4.L). This
    /// core has no lookup/tool-call concept of its own (out of scope, see
    /// DESIGN.md), so that gate is the others' conjunction.
    fn thought_loop_is_idle(&self) -> bool {
        self.captures.is_empty()
            && self.realtime_queue.is_empty()
            && self.stt_queue.is_empty()
            && self.deferred_queue.is_empty()
            && !self.reply_lock_held()
            && !self.participants.is_empty()
    }

    async fn draft_thought(&self, bucket: DriftBucket) -> Option<String> {
        let context = self.decision_context.to_vec();
        let prompt = format!(
            "Draft one short, natural spoken line to say into the voice channel during a lull. {} \
             Respond with the line only, no quotes or preamble.",
            bucket.prompt_hint()
        );
        match self.llm.generate(&prompt, &context).await {
            Ok(line) if !line.trim().is_empty() => Some(line.trim().to_string()),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "thought loop draft generation failed");
                None
            }
        }
    }

    async fn judge_thought(&self, draft: &str) -> Option<ThoughtVerdict> {
        let prompt = format!(
            "Should this self-initiated voice line actually be spoken right now? Consider whether it \
             still fits the conversation and isn't redundant. Respond with strict JSON \
             {{\"accept\": bool, \"rewrite\": string | null}}, where `rewrite` may tighten the line \
             using memory of the conversation. Line: {draft:?}"
        );
        let raw = self.llm.generate_json(&prompt).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(verdict) => Some(verdict),
            Err(err) => {
                debug!(error = %err, "thought loop verdict was not valid json, treating as reject");
                None
            }
        }
    }

    /// Deliver via the realtime channel's own utterance request when one
    /// is connected and idle, else fall back to the shared TTS pipeline
    /// (spec §4.L: "use realtime utterance if available, else TTS
    /// fallback").
    async fn deliver_thought(&mut self, text: String) {
        if let Some(client) = self.realtime_client.clone() {
            if !client.is_response_in_progress().await && client.request_text_utterance(&text).await.is_ok() {
                self.open_bot_turn();
                return;
            }
        }
        self.deliver_synthesized_reply(text).await;
    }
}

fn roll_eagerness(eagerness: u32) -> bool {
    let threshold = eagerness.min(100) as f64 / 100.0;
    rand::rng().random_bool(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_bucket_thresholds() {
        assert_eq!(DriftBucket::from_tether_strength(100), DriftBucket::Anchored);
        assert_eq!(DriftBucket::from_tether_strength(50), DriftBucket::Blended);
        assert_eq!(DriftBucket::from_tether_strength(0), DriftBucket::Ambient);
    }

    #[test]
    fn roll_eagerness_zero_never_fires() {
        assert!(!roll_eagerness(0));
    }

    #[test]
    fn roll_eagerness_hundred_always_fires() {
        assert!(roll_eagerness(100));
    }

    #[test]
    fn thought_verdict_parses_minimal_json() {
        let verdict: ThoughtVerdict = serde_json::from_str(r#"{"accept":true}"#).unwrap();
        assert!(verdict.accept);
        assert!(verdict.rewrite.is_none());
    }
}
