//! STT-pipeline reply driver
//!
//! Runs the same addressing + decision pipeline as the realtime driver,
//! then a conventional generate → synthesize → chunk → enqueue pipeline,
//! the stages mirroring `voice::coordinator`'s VAD → STT → LLM → TTS
//! chain, but driven turn-by-turn off the shared `TurnQueue` rather than
//! a continuous microphone stream.

use tracing::{debug, warn};

use crate::action_log::ActionLogEvent;
use crate::decision::{decide, ReplyDecision};
use crate::turns::QueuedTurn;
use crate::types::{SessionMode, VoiceRole, VoiceTurn};

/// Trailing marker a generated reply may carry to direct the bot to leave
/// the channel once it finishes speaking (spec §4.K, "if the reply directs
/// a leave, wait for playback to drain before calling
/// `endSession('assistant_leave_directive')`"). Stripped from the spoken
/// text before synthesis.
const LEAVE_DIRECTIVE_MARKER: &str = "[[leave]]";

/// How many drain-poll ticks to wait before giving up and ending the
/// session anyway, so a stuck transport can't wedge the leave directive
/// forever.
const LEAVE_DRAIN_MAX_POLLS: u32 = 200;
const LEAVE_DRAIN_POLL_INTERVAL_MS: u64 = 50;

impl crate::session::Session {
    /// Pop and fully process the next ready STT-pipeline turn, if any.
    pub async fn drive_stt_turn(&mut self) {
        let stale_skip_ms = self.settings.turn_queues.stt_turn_stale_skip_ms;
        let now_ms = self.clock.now_ms();
        let (turn, skipped_ages) = self.stt_queue.pop_ready(now_ms, stale_skip_ms);
        for age_ms in skipped_ages {
            ActionLogEvent::RealtimeTurnSkippedStale { speaker_id: String::new(), age_ms }.log();
        }
        let Some(turn) = turn else { return };
        self.process_stt_turn(turn).await;
    }

    async fn process_stt_turn(&mut self, turn: QueuedTurn) {
        let wav = crate::codec::encode_pcm16_mono_as_wav(&turn.pcm, 24_000);
        let primary_model = self.settings.models.primary_asr_model.clone();
        let transcript = self.llm.transcribe_audio(&wav, &primary_model).await.unwrap_or_default();
        if transcript.trim().is_empty() {
            return;
        }

        let speaker_id = turn.speaker_id.clone();
        let now_ms = self.clock.now_ms();

        let other_names = self.other_participant_names(&speaker_id);
        let addressing = self
            .addressing
            .classify(&speaker_id, &transcript, &mut self.engagement, now_ms, &self.settings.addressing, self.llm.as_ref(), &other_names)
            .await;

        ActionLogEvent::VoiceTurnAddressing {
            speaker_id: speaker_id.clone(),
            talking_to: format!("{:?}", addressing.talking_to),
            confidence: addressing.directed_confidence,
        }
        .log();

        self.record_turn(VoiceTurn {
            role: VoiceRole::User,
            speaker_id: Some(speaker_id.clone()),
            speaker_name: None,
            text: transcript.clone(),
            at_ms: now_ms,
            addressing: Some(addressing.clone()),
        });

        let ms_since_assistant_reply = self
            .transcript_timeline
            .iter()
            .rev()
            .find(|t| matches!(t.role, VoiceRole::Assistant))
            .map(|t| now_ms.saturating_sub(t.at_ms));
        let same_focused_speaker = self.addressing_engagement_matches(&speaker_id);

        let decision_input = crate::decision::DecisionInput {
            transcript: transcript.clone(),
            reply_lock_held: self.reply_lock_held(),
            clip_duration_ms: crate::gates::estimate_duration_ms(turn.pcm.len(), 24_000),
            addressing: addressing.clone(),
            ms_since_assistant_reply,
            same_focused_speaker,
            ms_since_direct_address: self.addressing_engagement_last_at(now_ms),
            eagerness: self.settings.orchestrator.eagerness,
            mode_merged_with_generation: matches!(self.mode, SessionMode::VoiceAgent),
            classifier_enabled: true,
            participant_count: self.participants.len(),
            ms_since_inbound_audio: self.last_inbound_audio_at_ms.map(|at| now_ms.saturating_sub(at)).unwrap_or(u64::MAX),
        };

        let decision = decide(&decision_input, &self.settings.decision, &self.settings.addressing, self.llm.as_ref()).await;

        match decision {
            ReplyDecision::Deny { reason } => {
                debug!(speaker_id = %speaker_id, reason, "stt turn denied a reply");
            }
            ReplyDecision::Defer { reason, retry_after_ms } => {
                debug!(speaker_id = %speaker_id, reason, retry_after_ms, "stt turn deferred");
                if reason == "bot_turn_open" {
                    self.push_deferred(speaker_id, turn.pcm, transcript);
                }
            }
            ReplyDecision::Allow { reason } => {
                if reason.updates_focused_speaker() {
                    self.engagement_record_direct(&speaker_id, now_ms);
                }
                self.generate_and_speak(speaker_id).await;
            }
        }
    }

    /// Re-evaluate a flushed deferred turn over its existing transcript, no
    /// re-ASR, mirroring [`Self::process_stt_turn`] from the addressing
    /// step on.
    pub(crate) async fn deliver_deferred_stt(&mut self, deferred: crate::turns::DeferredTurn) {
        let crate::turns::DeferredTurn { speaker_id, pcm, transcript, .. } = deferred;
        let now_ms = self.clock.now_ms();

        let other_names = self.other_participant_names(&speaker_id);
        let addressing = self
            .addressing
            .classify(&speaker_id, &transcript, &mut self.engagement, now_ms, &self.settings.addressing, self.llm.as_ref(), &other_names)
            .await;

        ActionLogEvent::VoiceTurnAddressing {
            speaker_id: speaker_id.clone(),
            talking_to: format!("{:?}", addressing.talking_to),
            confidence: addressing.directed_confidence,
        }
        .log();

        self.record_turn(VoiceTurn {
            role: VoiceRole::User,
            speaker_id: Some(speaker_id.clone()),
            speaker_name: None,
            text: transcript.clone(),
            at_ms: now_ms,
            addressing: Some(addressing.clone()),
        });

        let ms_since_assistant_reply = self
            .transcript_timeline
            .iter()
            .rev()
            .find(|t| matches!(t.role, VoiceRole::Assistant))
            .map(|t| now_ms.saturating_sub(t.at_ms));
        let same_focused_speaker = self.addressing_engagement_matches(&speaker_id);

        let decision_input = crate::decision::DecisionInput {
            transcript: transcript.clone(),
            reply_lock_held: self.reply_lock_held(),
            clip_duration_ms: crate::gates::estimate_duration_ms(pcm.len(), 24_000),
            addressing: addressing.clone(),
            ms_since_assistant_reply,
            same_focused_speaker,
            ms_since_direct_address: self.addressing_engagement_last_at(now_ms),
            eagerness: self.settings.orchestrator.eagerness,
            mode_merged_with_generation: matches!(self.mode, SessionMode::VoiceAgent),
            classifier_enabled: true,
            participant_count: self.participants.len(),
            ms_since_inbound_audio: self.last_inbound_audio_at_ms.map(|at| now_ms.saturating_sub(at)).unwrap_or(u64::MAX),
        };

        let decision = decide(&decision_input, &self.settings.decision, &self.settings.addressing, self.llm.as_ref()).await;

        match decision {
            ReplyDecision::Allow { reason } => {
                if reason.updates_focused_speaker() {
                    self.engagement_record_direct(&speaker_id, now_ms);
                }
                self.generate_and_speak(speaker_id).await;
            }
            ReplyDecision::Deny { reason } => {
                debug!(speaker_id = %speaker_id, reason, "deferred stt turn denied a reply");
            }
            ReplyDecision::Defer { reason, .. } => {
                debug!(speaker_id = %speaker_id, reason, "deferred stt turn deferred again, dropping rather than looping forever");
            }
        }
    }

    fn addressing_engagement_matches(&self, speaker_id: &str) -> bool {
        self.engagement.last_direct_speaker_id().is_some_and(|last| last == speaker_id)
    }

    fn addressing_engagement_last_at(&self, now_ms: u64) -> Option<u64> {
        self.engagement.last_direct_at_ms().map(|at| now_ms.saturating_sub(at))
    }

    fn engagement_record_direct(&mut self, speaker_id: &str, now_ms: u64) {
        self.engagement.record_direct(speaker_id, now_ms, false);
    }

    /// Generate the reply text, synthesize it, chunk into
    /// `stt_tts_conversion_chunk_ms` slices, and enqueue each one via the
    /// playback queue, yielding cooperatively every
    /// `stt_tts_conversion_yield_every_chunks` chunks.
    async fn generate_and_speak(&mut self, speaker_id: String) {
        let context = self.decision_context.to_vec();
        let prompt = format!("Continue the voice conversation, replying to {speaker_id}.");
        let (reply_text, directs_leave) = match self.llm.generate(&prompt, &context).await {
            Ok(text) if !text.trim().is_empty() => {
                let trimmed = text.trim();
                match trimmed.strip_suffix(LEAVE_DIRECTIVE_MARKER) {
                    Some(stripped) => (stripped.trim().to_string(), true),
                    None => (trimmed.to_string(), false),
                }
            }
            _ => {
                warn!("stt-pipeline generation produced no reply");
                return;
            }
        };

        let voice = self.settings.models.tts_voice.clone();
        let rate_hz = self.settings.models.tts_sample_rate_hz;
        let pcm = match self.llm.synthesize_speech(&reply_text, &voice, rate_hz).await {
            Ok(pcm) => pcm,
            Err(err) => {
                warn!(error = %err, "tts synthesis failed");
                return;
            }
        };

        let chunk_bytes = chunk_bytes_for_duration(self.settings.stt_driver.stt_tts_conversion_chunk_ms, rate_hz);
        let yield_every = self.settings.stt_driver.stt_tts_conversion_yield_every_chunks.max(1);
        let now_ms = self.clock.now_ms();

        self.open_bot_turn();
        for (index, chunk) in pcm.chunks(chunk_bytes.max(1)).enumerate() {
            let outcome = self.playback.enqueue(chunk, now_ms, &self.settings.playback);
            if outcome.warn {
                ActionLogEvent::BotAudioQueueBacklog { queued_bytes: self.playback.len_bytes() }.log();
            }
            if !outcome.accepted {
                break;
            }
            if (index as u32 + 1) % yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.record_turn(VoiceTurn {
            role: VoiceRole::Assistant,
            speaker_id: None,
            speaker_name: None,
            text: reply_text,
            at_ms: now_ms,
            addressing: None,
        });
        self.touch_activity(self.settings.orchestrator.activity_touch_min_speech_ms);

        if directs_leave {
            self.wait_for_playback_drain_then_leave().await;
        }
    }

    /// Poll until the playback queue empties (or a bounded number of polls
    /// elapses) and then end the session. Used by the STT-pipeline driver's
    /// leave-directive handling. This runs on the same session task as
    /// `run_loop`'s own pump tick, so it has to drive the pump itself here
    /// rather than just sleeping — otherwise nothing writes the queued
    /// bytes to the sink while this loop holds the task.
    async fn wait_for_playback_drain_then_leave(&mut self) {
        for _ in 0..LEAVE_DRAIN_MAX_POLLS {
            if self.playback.is_empty() {
                break;
            }
            self.pump_playback_once().await;
            if self.playback.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(LEAVE_DRAIN_POLL_INTERVAL_MS)).await;
        }
        self.end_session("assistant_leave_directive").await;
    }
}

/// Bytes of mono16 PCM at `rate_hz` spanning `duration_ms`.
fn chunk_bytes_for_duration(duration_ms: u64, rate_hz: u32) -> usize {
    ((rate_hz as u64) * 2 * duration_ms / 1000) as usize
}
