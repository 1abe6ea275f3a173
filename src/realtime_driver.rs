//! Realtime reply driver (module J)
//!
//! Handles one queued turn end to end for `SessionMode::OpenAiRealtime`:
//! ASR (with a fallback model and a low-signal drop), addressing +
//! decision, then one of two generation strategies. `strategy == native`
//! feeds PCM straight into the realtime model's own turn-taking with a
//! debounced commit; `strategy == brain` calls an orchestrating generation
//! step and plans an explicit speech/soundboard sequence. Silence recovery
//! and supersede-on-newer-input close out a `PendingResponse` that never
//! got audio back. Grounded on the teacher's `voice::coordinator` pipeline
//! shape (VAD → STT → LLM → TTS stages chained through one event loop).

use tracing::{debug, warn};

use crate::action_log::ActionLogEvent;
use crate::addressing::AddressingAnnotation;
use crate::collaborators::{RealtimeEvent, ResponseUsage, TranscriptEventType};
use crate::decision::{decide, DecisionInput, ReplyDecision};
use crate::reply_lock::PendingResponse;
use crate::session::Session;
use crate::settings::RealtimeStrategy;
use crate::turns::QueuedTurn;
use crate::types::{SessionMode, VoiceRole, VoiceTurn};

/// Outcome of transcribing a turn's PCM, before addressing/decision runs.
enum Transcription {
    Text(String),
    Skipped,
    Dropped,
}

impl Session {
    /// Pop and fully process the next ready realtime turn, if any.
    pub async fn drive_realtime_turn(&mut self) {
        let stale_skip_ms = self.settings.turn_queues.realtime_turn_stale_skip_ms;
        let now_ms = self.clock.now_ms();
        let (turn, skipped_ages) = self.realtime_queue.pop_ready(now_ms, stale_skip_ms);
        for age_ms in skipped_ages {
            ActionLogEvent::RealtimeTurnSkippedStale { speaker_id: String::new(), age_ms }.log();
        }
        let Some(turn) = turn else { return };
        self.process_realtime_turn(turn).await;
    }

    async fn process_realtime_turn(&mut self, turn: QueuedTurn) {
        let transcription = self.transcribe_turn(&turn).await;
        let transcript = match transcription {
            Transcription::Text(text) => text,
            Transcription::Skipped | Transcription::Dropped => return,
        };

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

        let decision_input = self.build_decision_input(&turn, &transcript, &addressing, now_ms);
        let decision = decide(&decision_input, &self.settings.decision, &self.settings.addressing, self.llm.as_ref()).await;

        match decision {
            ReplyDecision::Deny { reason } => {
                debug!(speaker_id = %speaker_id, reason, "realtime turn denied a reply");
            }
            ReplyDecision::Defer { reason, retry_after_ms } => {
                debug!(speaker_id = %speaker_id, reason, retry_after_ms, "realtime turn deferred");
                if reason == "bot_turn_open" {
                    self.push_deferred(speaker_id, turn.pcm, transcript);
                }
            }
            ReplyDecision::Allow { reason } => {
                if reason.updates_focused_speaker() {
                    self.engagement.record_direct(&speaker_id, now_ms, false);
                }
                self.generate_realtime_reply(speaker_id, turn.pcm).await;
            }
        }
    }

    /// Re-evaluate a flushed deferred turn: same addressing + decision
    /// pipeline as [`Self::process_realtime_turn`], but over the transcript
    /// it already carries rather than re-running ASR (spec §4.F).
    pub(crate) async fn deliver_deferred_realtime(&mut self, deferred: crate::turns::DeferredTurn) {
        let crate::turns::DeferredTurn { speaker_id, pcm, transcript, queued_at_ms } = deferred;
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

        let turn = QueuedTurn {
            speaker_id: speaker_id.clone(),
            pcm: pcm.clone(),
            capture_reason: crate::types::CaptureReason::BotTurnOpenDeferredFlush,
            finalized_at_ms: queued_at_ms,
            merged_count: 1,
        };
        let decision_input = self.build_decision_input(&turn, &transcript, &addressing, now_ms);
        let decision = decide(&decision_input, &self.settings.decision, &self.settings.addressing, self.llm.as_ref()).await;

        match decision {
            ReplyDecision::Allow { reason } => {
                if reason.updates_focused_speaker() {
                    self.engagement.record_direct(&speaker_id, now_ms, false);
                }
                self.generate_realtime_reply(speaker_id, pcm).await;
            }
            ReplyDecision::Deny { reason } => {
                debug!(speaker_id = %speaker_id, reason, "deferred realtime turn denied a reply");
            }
            ReplyDecision::Defer { reason, .. } => {
                debug!(speaker_id = %speaker_id, reason, "deferred realtime turn deferred again, dropping rather than looping forever");
            }
        }
    }

    fn build_decision_input(
        &self,
        turn: &QueuedTurn,
        transcript: &str,
        addressing: &AddressingAnnotation,
        now_ms: u64,
    ) -> DecisionInput {
        let ms_since_assistant_reply = self
            .transcript_timeline
            .iter()
            .rev()
            .find(|t| matches!(t.role, VoiceRole::Assistant))
            .map(|t| now_ms.saturating_sub(t.at_ms));
        let same_focused_speaker = self
            .engagement_last_direct_speaker()
            .is_some_and(|last| last == turn.speaker_id);

        DecisionInput {
            transcript: transcript.to_string(),
            reply_lock_held: self.reply_lock_held(),
            clip_duration_ms: crate::gates::estimate_duration_ms(turn.pcm.len(), 24_000),
            addressing: addressing.clone(),
            ms_since_assistant_reply,
            same_focused_speaker,
            ms_since_direct_address: self.engagement_last_direct_at_ms().map(|at| now_ms.saturating_sub(at)),
            eagerness: self.settings.orchestrator.eagerness,
            mode_merged_with_generation: matches!(self.mode, SessionMode::OpenAiRealtime),
            classifier_enabled: true,
            participant_count: self.participants.len(),
            ms_since_inbound_audio: self.last_inbound_audio_at_ms.map(|at| now_ms.saturating_sub(at)).unwrap_or(u64::MAX),
        }
    }

    async fn transcribe_turn(&mut self, turn: &QueuedTurn) -> Transcription {
        let min_clip_ms = self.settings.realtime_driver.voice_turn_min_asr_clip_ms;
        let clip_duration_ms = crate::gates::estimate_duration_ms(turn.pcm.len(), 24_000);
        if matches!(turn.capture_reason, crate::types::CaptureReason::SpeakingEnd) && clip_duration_ms < min_clip_ms {
            return Transcription::Skipped;
        }

        let wav = crate::codec::encode_pcm16_mono_as_wav(&turn.pcm, 24_000);

        let primary_model = self.settings.models.primary_asr_model.clone();
        let primary = self.llm.transcribe_audio(&wav, &primary_model).await.unwrap_or_default();
        if !primary.trim().is_empty() {
            return Transcription::Text(primary);
        }

        let Some(fallback_model) = self.settings.models.fallback_asr_model.clone() else {
            return Transcription::Skipped;
        };
        let fallback = self.llm.transcribe_audio(&wav, &fallback_model).await.unwrap_or_default();
        if fallback.trim().is_empty() {
            return Transcription::Skipped;
        }
        if fallback.trim().chars().count() <= self.settings.models.fallback_low_signal_max_chars {
            ActionLogEvent::VoiceTurnDroppedLowSignalFallback { speaker_id: turn.speaker_id.clone() }.log();
            return Transcription::Dropped;
        }
        Transcription::Text(fallback)
    }

    /// Dispatch to the configured generation strategy, then either start a
    /// debounced native commit or run the brain planning step.
    async fn generate_realtime_reply(&mut self, speaker_id: String, pcm: Vec<u8>) {
        if self.supersede_check() {
            self.superseded_count += 1;
            ActionLogEvent::RealtimeReplySupersededNewerInput { request_id: String::new() }.log();
            return;
        }

        match self.settings.realtime_driver.strategy {
            RealtimeStrategy::Native => self.generate_native_reply(speaker_id, pcm).await,
            RealtimeStrategy::Brain => self.generate_brain_reply(speaker_id).await,
        }
    }

    /// True if a newer capture or queued turn makes the in-flight reply
    /// stale enough to skip (spec §4.J, "Supersede on newer input").
    fn supersede_check(&self) -> bool {
        !self.captures.is_empty() || !self.realtime_queue.is_empty()
    }

    /// Buffer the turn's PCM, refresh instructions, and schedule a
    /// debounced commit attempt rather than committing inline (spec §4.J:
    /// "schedule a debounced commit (RESPONSE_FLUSH_DEBOUNCE_MS)").
    async fn generate_native_reply(&mut self, speaker_id: String, pcm: Vec<u8>) {
        self.realtime_input_buffer.extend_from_slice(&pcm);
        self.refresh_realtime_instructions();
        if let Some(client) = self.realtime_client.clone() {
            let _ = client.update_instructions(&self.realtime_instructions).await;
        }
        self.pending_native_speaker = Some(speaker_id);
        self.schedule_debounced_commit();
    }

    fn schedule_debounced_commit(&mut self) {
        let delay_ms = self.settings.realtime_driver.response_flush_debounce_ms;
        self.timers.instruction_refresh.schedule(delay_ms, self.tx.clone(), crate::session::SessionEvent::InstructionRefreshDue);
    }

    /// Debounced commit flush (spec §4.J). Verifies the same preconditions
    /// on every fire; reschedules itself until they hold, then commits,
    /// requests a response, and arms the silence watchdog.
    pub async fn on_instruction_refresh_due(&mut self) {
        if self.realtime_input_buffer.is_empty() {
            return;
        }
        if !self.commit_preconditions_met() {
            debug!("realtime commit preconditions not met, rescheduling debounced commit");
            self.schedule_debounced_commit();
            return;
        }

        let Some(client) = self.realtime_client.clone() else { return };
        if let Err(err) = client.commit_input_audio_buffer().await {
            warn!(error = %err, "failed to commit realtime audio buffer");
            return;
        }
        self.realtime_input_buffer.clear();

        if let Err(err) = client.create_audio_response().await {
            warn!(error = %err, "failed to request realtime audio response");
            return;
        }

        let request_id = self.next_request_id();
        let speaker_id = self.pending_native_speaker.take();
        ActionLogEvent::RealtimeReplyRequested { request_id: request_id.clone(), speaker_id: speaker_id.clone().unwrap_or_default() }.log();
        let now_ms = self.clock.now_ms();
        self.pending_response = Some(PendingResponse { request_id: request_id.clone(), speaker_id, requested_at_ms: now_ms });
        self.response_received_audio = false;
        self.open_bot_turn();
        self.arm_response_silence_watchdog(request_id, 0);
    }

    fn commit_preconditions_met(&self) -> bool {
        let now_ms = self.clock.now_ms();
        let rate_hz = self.settings.models.tts_sample_rate_hz;
        self.captures.is_empty()
            && !self.reply_lock.is_suppressed(now_ms)
            && !self.reply_lock_held()
            && self.realtime_input_buffer.len() >= self.settings.realtime_driver.commit_minimum_bytes(rate_hz)
            && self.pending_response.is_none()
    }

    fn refresh_realtime_instructions(&mut self) {
        let max_chars = self.settings.realtime_driver.instructions_max_chars;
        let mut instructions = String::new();
        for turn in self.decision_context.iter() {
            let line = match &turn.speaker_name {
                Some(name) => format!("{name}: {}\n", turn.text),
                None => format!("{:?}: {}\n", turn.role, turn.text),
            };
            instructions.push_str(&line);
        }
        if instructions.len() > max_chars {
            let start = instructions.len() - max_chars;
            instructions = instructions[start..].to_string();
        }
        self.realtime_instructions = instructions;
    }

    /// `strategy == brain`: generate one planned turn, then enqueue it for
    /// playback exactly like the STT-pipeline driver does, since the brain
    /// path always produces ordinary synthesizable text rather than driving
    /// the realtime model's own turn-taking.
    async fn generate_brain_reply(&mut self, speaker_id: String) {
        let context = self.decision_context.to_vec();
        let prompt = format!("Continue the voice conversation, replying to {speaker_id}.");
        let Ok(reply_text) = self.llm.generate(&prompt, &context).await else {
            warn!("brain generation failed, dropping reply");
            return;
        };
        if reply_text.trim().is_empty() {
            return;
        }
        self.deliver_synthesized_reply(reply_text).await;
    }

    /// Re-request the response that was interrupted by a barge-in whose
    /// follow-up turned out short (spec §4.E "Retry"): skip ASR entirely and
    /// just ask the realtime model for a fresh audio response, since the
    /// model's own context already holds what it was about to say.
    pub(crate) async fn resume_bargein_retry(&mut self, speaker_id: String) {
        ActionLogEvent::VoiceBargeInRetryRequested { speaker_id: speaker_id.clone() }.log();

        if let Some(client) = self.realtime_client.clone() {
            if let Err(err) = client.create_audio_response().await {
                warn!(error = %err, "failed to re-request realtime audio response for barge-in retry");
                return;
            }
        }

        let request_id = self.next_request_id();
        self.pending_response = Some(PendingResponse { request_id: request_id.clone(), speaker_id: Some(speaker_id), requested_at_ms: self.clock.now_ms() });
        self.response_received_audio = false;
        self.open_bot_turn();
        self.arm_response_silence_watchdog(request_id, 0);
    }

    fn arm_response_silence_watchdog(&mut self, request_id: String, attempt: u32) {
        let delay_ms = self.settings.realtime_driver.response_silence_retry_delay_ms;
        self.timers.response_silence_watchdog.schedule(
            delay_ms,
            self.tx.clone(),
            crate::session::SessionEvent::ResponseSilenceWatchdog { request_id, attempt },
        );
    }

    /// Silence recovery ladder (spec §4.J): retry up to the configured
    /// count, then one hard recovery, then give up and clear the pending
    /// response so the next user turn can recover cleanly.
    pub async fn on_response_silence_watchdog(&mut self, request_id: String, attempt: u32) {
        let Some(pending) = &self.pending_response else { return };
        if pending.request_id != request_id {
            return;
        }
        if self.last_bot_audio_delta_at_ms.is_some_and(|at| at >= pending.requested_at_ms) {
            return;
        }

        let max_retries = self.settings.realtime_driver.max_response_silence_retries;
        if attempt < max_retries {
            ActionLogEvent::ResponseSilentRetry { request_id: request_id.clone(), attempt }.log();
            if let Some(client) = self.realtime_client.clone() {
                let _ = client.create_audio_response().await;
            }
            self.arm_response_silence_watchdog(request_id, attempt + 1);
            return;
        }

        if attempt == max_retries {
            ActionLogEvent::ResponseHardRecovery { request_id: request_id.clone() }.log();
            let rate_hz = self.settings.models.tts_sample_rate_hz;
            if self.realtime_input_buffer.len() >= self.settings.realtime_driver.commit_minimum_bytes(rate_hz) {
                if let Some(client) = self.realtime_client.clone() {
                    let _ = client.commit_input_audio_buffer().await;
                    let _ = client.create_audio_response().await;
                }
            }
            self.arm_response_silence_watchdog(request_id, attempt + 1);
            return;
        }

        ActionLogEvent::ResponseSilentFallback { request_id }.log();
        self.pending_response = None;
        self.close_bot_turn();
    }

    /// `response_done` arrived with no preceding audio delta: give it a
    /// grace window before running the same recovery ladder.
    pub fn on_response_done_without_audio(&mut self, request_id: String) {
        let delay_ms = self.settings.realtime_driver.response_done_silence_grace_ms;
        self.timers.response_done_grace.schedule(delay_ms, self.tx.clone(), crate::session::SessionEvent::ResponseDoneGrace { request_id });
    }

    /// Synthesize and enqueue text outside the native realtime channel
    /// (used by the brain strategy and by the thought loop's TTS fallback).
    pub async fn deliver_synthesized_reply(&mut self, text: String) {
        let voice = self.settings.models.tts_voice.clone();
        let rate_hz = self.settings.models.tts_sample_rate_hz;
        let Ok(pcm) = self.llm.synthesize_speech(&text, &voice, rate_hz).await else {
            warn!("speech synthesis failed");
            return;
        };
        let now_ms = self.clock.now_ms();
        let outcome = self.playback.enqueue(&pcm, now_ms, &self.settings.playback);
        if outcome.warn {
            ActionLogEvent::BotAudioQueueBacklog { queued_bytes: self.playback.len_bytes() }.log();
        }
        if outcome.accepted {
            self.open_bot_turn();
            self.record_turn(VoiceTurn {
                role: VoiceRole::Assistant,
                speaker_id: None,
                speaker_name: None,
                text,
                at_ms: now_ms,
                addressing: None,
            });
        }
    }

    fn engagement_last_direct_speaker(&self) -> Option<String> {
        self.engagement.last_direct_speaker_id().cloned()
    }

    fn engagement_last_direct_at_ms(&self) -> Option<u64> {
        self.engagement.last_direct_at_ms()
    }

    /// Handle one inbound event from the realtime client (spec §6). Audio
    /// deltas feed the playback queue directly; everything else updates
    /// `PendingResponse`/transcript state or reacts to an error/teardown.
    pub async fn handle_realtime_event(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::AudioDelta { base64 } => self.on_realtime_audio_delta(base64).await,
            RealtimeEvent::Transcript { text, event_type } => self.on_realtime_transcript(text, event_type),
            RealtimeEvent::ResponseDone { id, status, model, usage } => self.on_realtime_response_done(id, status, model, usage).await,
            RealtimeEvent::ErrorEvent { code, message, param, last_outbound } => {
                self.on_realtime_error_event(code, message, param, last_outbound)
            }
            RealtimeEvent::SocketClosed { code, reason } => {
                ActionLogEvent::VoiceError { detail: format!("realtime socket closed: code={code} reason={reason}") }.log();
                self.pending_response = None;
                self.close_bot_turn();
            }
            RealtimeEvent::SocketError { message } => {
                ActionLogEvent::VoiceError { detail: format!("realtime socket error: {message}") }.log();
            }
        }
    }

    async fn on_realtime_audio_delta(&mut self, base64: String) {
        let pcm = match crate::collaborators::decode_audio_delta(&base64) {
            Ok(pcm) => pcm,
            Err(err) => {
                ActionLogEvent::VoiceError { detail: format!("malformed audio_delta: {err}") }.log();
                return;
            }
        };

        let now_ms = self.clock.now_ms();
        self.response_received_audio = true;
        self.last_bot_audio_delta_at_ms = Some(now_ms);

        let outcome = self.playback.enqueue(&pcm, now_ms, &self.settings.playback);
        if outcome.warn {
            ActionLogEvent::BotAudioQueueBacklog { queued_bytes: self.playback.len_bytes() }.log();
        }
        if outcome.accepted {
            self.open_bot_turn();
        }
    }

    fn on_realtime_transcript(&mut self, text: String, event_type: TranscriptEventType) {
        ActionLogEvent::OpenAiRealtimeEvent { kind: "transcript".to_string(), detail: format!("{event_type:?}") }.log();
        if matches!(event_type, TranscriptEventType::Final) && !text.trim().is_empty() {
            let now_ms = self.clock.now_ms();
            self.record_turn(VoiceTurn { role: VoiceRole::Assistant, speaker_id: None, speaker_name: None, text, at_ms: now_ms, addressing: None });
        }
    }

    async fn on_realtime_response_done(&mut self, id: String, status: String, model: Option<String>, usage: Option<ResponseUsage>) {
        ActionLogEvent::OpenAiRealtimeEvent {
            kind: "response_done".to_string(),
            detail: format!("status={status} model={model:?} input_tokens={:?}", usage.map(|u| u.input_tokens)),
        }
        .log();

        let matches_pending = self.pending_response.as_ref().is_some_and(|p| p.request_id == id);
        if !matches_pending {
            return;
        }

        if self.response_received_audio {
            self.pending_response = None;
            self.response_received_audio = false;
            self.timers.response_silence_watchdog.cancel();
        } else {
            self.on_response_done_without_audio(id);
        }
    }

    fn on_realtime_error_event(&mut self, code: String, message: String, param: Option<String>, last_outbound: Option<String>) {
        ActionLogEvent::VoiceError { detail: format!("realtime error {code}: {message} (param={param:?}, last_outbound={last_outbound:?})") }
            .log();
        if crate::collaborators::is_recoverable_realtime_error_code(&code) {
            return;
        }
        self.pending_response = None;
        self.close_bot_turn();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::collaborators::{LanguageModel, RealtimeClient, TransportSink};
    use crate::reply_lock::PendingResponse;
    use crate::session::SessionHandles;
    use crate::settings::VoiceSettings;
    use async_trait::async_trait;

    struct NoopSink;
    #[async_trait]
    impl TransportSink for NoopSink {
        async fn write_pcm(&self, _frame: &[u8]) -> bool {
            true
        }
        async fn destroy(&self) {}
    }

    struct NoopRealtime;
    #[async_trait]
    impl RealtimeClient for NoopRealtime {
        async fn append_input_audio_pcm(&self, _bytes: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn commit_input_audio_buffer(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn create_audio_response(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn request_text_utterance(&self, _prompt: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn update_instructions(&self, _instructions: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_active_response(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn is_response_in_progress(&self) -> bool {
            false
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Empty on the primary model, `fallback_transcript` on any other model
    /// name — mirrors a primary ASR miss that only the fallback recovers.
    struct StubLlm {
        fallback_transcript: String,
    }

    #[async_trait]
    impl LanguageModel for StubLlm {
        async fn generate(&self, _prompt: &str, _context: &[crate::types::VoiceTurn]) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn transcribe_audio(&self, _wav: &[u8], model: &str) -> anyhow::Result<String> {
            if model == "asr-primary" {
                Ok(String::new())
            } else {
                Ok(self.fallback_transcript.clone())
            }
        }
        async fn synthesize_speech(&self, _text: &str, _voice: &str, _rate: u32) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn generate_json(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn test_session() -> Session {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let handles = SessionHandles {
            transport: Arc::new(NoopSink),
            realtime_client: Some(Arc::new(NoopRealtime)),
            llm: Arc::new(StubLlm { fallback_transcript: String::new() }),
        };
        let (session, _rx) = Session::new(
            "guild1".to_string(),
            "text1".to_string(),
            "voice1".to_string(),
            SessionMode::OpenAiRealtime,
            VoiceSettings::default(),
            clock,
            "Nova",
            &[],
            handles,
        )
        .unwrap();
        session
    }

    /// Regression test for a bug where the retry/hard-recovery rungs of the
    /// silence ladder re-armed the watchdog at the same `attempt` forever
    /// instead of advancing it, so the ladder never reached the fallback.
    #[tokio::test]
    async fn silence_ladder_advances_attempt_to_fallback() {
        let mut session = test_session();
        let max_retries = session.settings.realtime_driver.max_response_silence_retries;
        session.pending_response = Some(PendingResponse {
            request_id: "req1".to_string(),
            speaker_id: Some("u1".to_string()),
            requested_at_ms: 0,
        });

        for attempt in 0..=max_retries {
            session.on_response_silence_watchdog("req1".to_string(), attempt).await;
            assert!(session.pending_response.is_some(), "ladder should not give up before exhausting retries");
        }

        session.on_response_silence_watchdog("req1".to_string(), max_retries + 1).await;
        assert!(session.pending_response.is_none(), "ladder should fall back once attempts exceed max_retries");
    }

    #[tokio::test]
    async fn silence_watchdog_ignores_stale_request_id() {
        let mut session = test_session();
        session.pending_response =
            Some(PendingResponse { request_id: "current".to_string(), speaker_id: None, requested_at_ms: 0 });

        session.on_response_silence_watchdog("stale".to_string(), 0).await;
        assert!(session.pending_response.is_some());
    }

    #[tokio::test]
    async fn silence_watchdog_is_noop_once_audio_arrived() {
        let mut session = test_session();
        session.pending_response =
            Some(PendingResponse { request_id: "req1".to_string(), speaker_id: None, requested_at_ms: 1_000 });
        session.last_bot_audio_delta_at_ms = Some(1_500);

        session.on_response_silence_watchdog("req1".to_string(), 0).await;
        assert!(session.pending_response.is_some(), "watchdog should not touch a response that already has audio");
    }

    #[tokio::test]
    async fn fallback_transcript_at_or_below_low_signal_floor_is_dropped() {
        let mut session = test_session();
        session.llm = Arc::new(StubLlm { fallback_transcript: "ok".to_string() });
        let turn = QueuedTurn {
            speaker_id: "u1".to_string(),
            pcm: vec![0u8; 24_000 * 2],
            capture_reason: crate::types::CaptureReason::SpeakingEnd,
            finalized_at_ms: 0,
            merged_count: 1,
        };

        let transcription = session.transcribe_turn(&turn).await;
        assert!(matches!(transcription, Transcription::Dropped));
    }

    #[tokio::test]
    async fn fallback_transcript_above_low_signal_floor_is_kept() {
        let mut session = test_session();
        session.llm = Arc::new(StubLlm { fallback_transcript: "actually a real sentence".to_string() });
        let turn = QueuedTurn {
            speaker_id: "u1".to_string(),
            pcm: vec![0u8; 24_000 * 2],
            capture_reason: crate::types::CaptureReason::SpeakingEnd,
            finalized_at_ms: 0,
            merged_count: 1,
        };

        let transcription = session.transcribe_turn(&turn).await;
        assert!(matches!(transcription, Transcription::Text(text) if text == "actually a real sentence"));
    }
}
