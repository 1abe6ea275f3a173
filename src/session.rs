//! Session orchestrator
//!
//! Owns every piece of per-guild state: the capture table, both turn
//! queues and the deferred queue, the playback queue, the reply lock, the
//! pending response, engagement/addressing state, the conversational
//! context ring buffers, and every timer. Only this module's task ever
//! mutates a `Session`; everything else (capture events, realtime events,
//! controller calls) arrives as a [`SessionEvent`] and is handled by one
//! selector loop — the single-owner shape this runtime calls for
//! throughout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::info;
use uuid::Uuid;

use crate::action_log::ActionLogEvent;
use crate::addressing::{AddressingClassifier, EngagementContext};
use crate::capture::{CaptureTable, CaptureTimerEvent, FinalizedCapture};
use crate::clock::Clock;
use crate::collaborators::{LanguageModel, RealtimeClient, RealtimeEvent, TransportSink};
use crate::error::VoiceCoreError;
use crate::playback::PlaybackQueue;
use crate::reply_lock::{InterruptionAction, PendingResponse, ReplyLockState};
use crate::settings::VoiceSettings;
use crate::turns::{DeferredQueue, DeferredTurn, TurnQueue};
use crate::types::{
    LatencySnapshot, MembershipEvent, MembershipKind, RealtimeSnapshot, RuntimeState, SessionMode, SessionSnapshot,
    SpeakerId, SttSnapshot, VoiceTurn,
};

/// Fan-in event type for the session's single selector loop. Capture
/// timers, inbound transport/realtime events, and controller calls all
/// resolve to one of these.
#[derive(Debug)]
pub enum SessionEvent {
    SpeakingStart { speaker_id: SpeakerId },
    SpeakingEnd { speaker_id: SpeakerId },
    AudioChunk { speaker_id: SpeakerId, pcm: Vec<u8> },
    CaptureTimer(CaptureTimerEvent),
    Realtime(RealtimeEvent),
    MembershipChanged { speaker_id: SpeakerId, display_name: String, kind: MembershipKind },
    BotRemovedFromChannel,
    BotMembershipRecovered,
    MaxDurationElapsed,
    InactivityElapsed,
    BotDisconnectGraceElapsed,
    ThoughtLoopDue,
    DeferredFlushDue,
    ResponseSilenceWatchdog { request_id: String, attempt: u32 },
    ResponseDoneGrace { request_id: String },
    InstructionRefreshDue,
    ReconcileSettings(Arc<VoiceSettings>),
    EndSession { reason: String },
}

/// A barge-in interrupt's utterance stashed for possible retry (spec §4.E
/// "Retry", §4.J "stash a retry utterance keyed to the interrupting
/// speaker"). Consulted the next time the same speaker's capture finalizes:
/// a short follow-up resumes the interrupted reply, a long one means the
/// speaker actually had something to say and the stash is dropped.
#[derive(Debug, Clone)]
pub(crate) struct BargeInRetryStash {
    pub speaker_id: SpeakerId,
    pub stashed_at_ms: u64,
}

/// Named timer handles for every session deadline, guaranteed cancelled on
/// drop (see [`crate::timer::TimerHandle`]).
#[derive(Debug, Default)]
pub(crate) struct SessionTimers {
    pub max_duration: crate::timer::TimerHandle,
    pub inactivity: crate::timer::TimerHandle,
    pub bot_disconnect_grace: crate::timer::TimerHandle,
    pub thought_loop: crate::timer::TimerHandle,
    pub deferred_flush: crate::timer::TimerHandle,
    pub response_silence_watchdog: crate::timer::TimerHandle,
    pub response_done_grace: crate::timer::TimerHandle,
    pub instruction_refresh: crate::timer::TimerHandle,
}

impl SessionTimers {
    fn cancel_all(&mut self) {
        self.max_duration.cancel();
        self.inactivity.cancel();
        self.bot_disconnect_grace.cancel();
        self.thought_loop.cancel();
        self.deferred_flush.cancel();
        self.response_silence_watchdog.cancel();
        self.response_done_grace.cancel();
        self.instruction_refresh.cancel();
    }
}

/// The per-guild voice session. One instance per guild, per invariant §3.1.
pub struct Session {
    pub guild_id: String,
    pub text_channel_id: String,
    pub voice_channel_id: String,
    pub session_id: String,
    pub mode: SessionMode,

    pub(crate) settings: Arc<VoiceSettings>,
    pub(crate) clock: Arc<dyn Clock>,

    pub(crate) captures: CaptureTable,
    pub(crate) playback: PlaybackQueue,
    pub(crate) reply_lock: ReplyLockState,
    pub(crate) realtime_queue: TurnQueue,
    pub(crate) stt_queue: TurnQueue,
    pub(crate) deferred_queue: DeferredQueue,
    pub(crate) pending_response: Option<PendingResponse>,
    pub(crate) response_received_audio: bool,
    pub(crate) next_request_id: u64,

    pub(crate) addressing: AddressingClassifier,
    pub(crate) engagement: EngagementContext,
    pub(crate) decision_context: crate::types::RingBuffer<VoiceTurn>,
    pub(crate) transcript_timeline: crate::types::RingBuffer<VoiceTurn>,
    pub(crate) membership_log: crate::types::RingBuffer<MembershipEvent>,
    pub(crate) participants: HashSet<SpeakerId>,
    /// Display names for everyone currently in the channel, keyed by
    /// speaker id — the roster the addressing classifier checks for a
    /// vocative to another participant (spec §4.G).
    pub(crate) participant_names: HashMap<SpeakerId, String>,

    pub(crate) realtime_instructions: String,
    pub(crate) realtime_input_buffer: Vec<u8>,
    pub(crate) pending_native_speaker: Option<SpeakerId>,
    pub(crate) superseded_count: u64,
    /// Last time the realtime/TTS output produced audio — drives the
    /// silence watchdog and `bot_turn_open()` recency.
    pub(crate) last_bot_audio_delta_at_ms: Option<u64>,
    /// Last time an inbound user chunk arrived — drives the decision
    /// engine's `ms_since_inbound_audio` (rule 8).
    pub(crate) last_inbound_audio_at_ms: Option<u64>,
    pub(crate) bargein_retry_stash: Option<BargeInRetryStash>,

    pub(crate) latency: LatencySnapshot,
    pub(crate) last_thought_at_ms: Option<u64>,
    pub(crate) bot_turn_opened_at_ms: Option<u64>,

    pub ending: bool,
    pub started_at_ms: u64,
    pub last_activity_at_ms: u64,

    pub(crate) timers: SessionTimers,
    pub(crate) tx: UnboundedSender<SessionEvent>,
    pub(crate) capture_timer_tx: UnboundedSender<CaptureTimerEvent>,

    pub(crate) transport: Arc<dyn TransportSink>,
    pub(crate) realtime_client: Option<Arc<dyn RealtimeClient>>,
    pub(crate) llm: Arc<dyn LanguageModel>,
}

pub struct SessionHandles {
    pub transport: Arc<dyn TransportSink>,
    pub realtime_client: Option<Arc<dyn RealtimeClient>>,
    pub llm: Arc<dyn LanguageModel>,
}

impl Session {
    /// Construct a new session and arm its lifetime timers. Returns the
    /// event receiver the caller's run loop selects on, alongside the
    /// sender external transports/collaborators post events through.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: String,
        text_channel_id: String,
        voice_channel_id: String,
        mode: SessionMode,
        settings: VoiceSettings,
        clock: Arc<dyn Clock>,
        bot_display_name: &str,
        bot_aliases: &[String],
        handles: SessionHandles,
    ) -> Result<(Self, UnboundedReceiver<SessionEvent>), VoiceCoreError> {
        let settings = Arc::new(settings.clamp());
        let (tx, rx) = mpsc::unbounded_channel();
        let (capture_timer_tx, mut capture_timer_rx) = mpsc::unbounded_channel::<CaptureTimerEvent>();
        let now_ms = clock.now_ms();
        let addressing = AddressingClassifier::new(bot_display_name, bot_aliases)?;

        // Capture timers fire on their own channel (`CaptureTable::start`
        // etc. take the sender directly); forward each one into the
        // session's single event stream so the run loop only ever selects
        // on one receiver.
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = capture_timer_rx.recv().await {
                if forward_tx.send(SessionEvent::CaptureTimer(event)).is_err() {
                    break;
                }
            }
        });

        let mut session = Self {
            guild_id,
            text_channel_id,
            voice_channel_id,
            session_id: Uuid::new_v4().to_string(),
            mode,
            settings,
            clock,
            captures: CaptureTable::new(),
            playback: PlaybackQueue::new(),
            reply_lock: ReplyLockState::new(),
            realtime_queue: TurnQueue::new(),
            stt_queue: TurnQueue::new(),
            deferred_queue: DeferredQueue::new(),
            pending_response: None,
            response_received_audio: false,
            next_request_id: 1,
            addressing,
            engagement: EngagementContext::new(),
            decision_context: crate::types::RingBuffer::new(24),
            transcript_timeline: crate::types::RingBuffer::new(200),
            membership_log: crate::types::RingBuffer::new(100),
            participants: HashSet::new(),
            participant_names: HashMap::new(),
            realtime_instructions: String::new(),
            realtime_input_buffer: Vec::new(),
            pending_native_speaker: None,
            superseded_count: 0,
            last_bot_audio_delta_at_ms: None,
            last_inbound_audio_at_ms: None,
            bargein_retry_stash: None,
            latency: LatencySnapshot::default(),
            last_thought_at_ms: None,
            bot_turn_opened_at_ms: None,
            ending: false,
            started_at_ms: now_ms,
            last_activity_at_ms: now_ms,
            timers: SessionTimers::default(),
            tx: tx.clone(),
            capture_timer_tx,
            transport: handles.transport,
            realtime_client: handles.realtime_client,
            llm: handles.llm,
        };

        session.arm_lifetime_timers();
        ActionLogEvent::VoiceSessionStart {
            guild_id: session.guild_id.clone(),
            session_id: session.session_id.clone(),
            mode: format!("{:?}", session.mode),
        }
        .log();

        Ok((session, rx))
    }

    fn arm_lifetime_timers(&mut self) {
        let max_duration_ms = (self.settings.orchestrator.max_session_minutes as u64) * 60_000;
        self.timers.max_duration.schedule(max_duration_ms, self.tx.clone(), SessionEvent::MaxDurationElapsed);
        self.arm_inactivity_timer();
        self.arm_thought_loop_timer();
    }

    fn arm_inactivity_timer(&mut self) {
        let inactivity_ms = (self.settings.orchestrator.inactivity_leave_seconds as u64) * 1_000;
        self.timers.inactivity.schedule(inactivity_ms, self.tx.clone(), SessionEvent::InactivityElapsed);
    }

    /// Refresh `last_activity_at_ms` and reset the inactivity timer, but
    /// only for assertive captures past the minimum speech length, and no
    /// more often than `activity_touch_throttle_ms`.
    pub fn touch_activity(&mut self, speech_ms: u64) {
        if speech_ms < self.settings.orchestrator.activity_touch_min_speech_ms {
            return;
        }
        let now_ms = self.clock.now_ms();
        if now_ms.saturating_sub(self.last_activity_at_ms) < self.settings.capture.activity_touch_throttle_ms {
            return;
        }
        self.last_activity_at_ms = now_ms;
        self.arm_inactivity_timer();
    }

    pub fn next_request_id(&mut self) -> String {
        let id = self.next_request_id;
        self.next_request_id += 1;
        format!("{}-{}", self.session_id, id)
    }

    /// Whether the reply lock's composite predicate holds.
    pub fn reply_lock_held(&self) -> bool {
        self.reply_lock.bot_speaking()
            || self.pending_response.is_some()
            || !self.playback.is_empty()
            || self.bot_turn_open()
    }

    /// `botTurnOpen` auto-clears `BOT_TURN_SILENCE_RESET_MS` after the last
    /// audio delta.
    pub fn bot_turn_open(&self) -> bool {
        let Some(opened_at) = self.bot_turn_opened_at_ms else { return false };
        let now_ms = self.clock.now_ms();
        match self.last_bot_audio_delta_at_ms {
            Some(last_delta) => now_ms.saturating_sub(last_delta) < self.settings.barge_in.bot_turn_silence_reset_ms,
            None => now_ms.saturating_sub(opened_at) < self.settings.barge_in.bot_turn_silence_reset_ms,
        }
    }

    pub fn open_bot_turn(&mut self) {
        self.bot_turn_opened_at_ms = Some(self.clock.now_ms());
        self.reply_lock.set_bot_speaking(true);
    }

    pub fn close_bot_turn(&mut self) {
        self.bot_turn_opened_at_ms = None;
        self.reply_lock.set_bot_speaking(false);
    }

    /// Display names of everyone in the channel other than `speaker_id`,
    /// for the addressing classifier's other-participant vocative check.
    pub(crate) fn other_participant_names(&self, speaker_id: &str) -> Vec<String> {
        self.participant_names
            .iter()
            .filter(|(id, _)| id.as_str() != speaker_id)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn record_membership(&mut self, speaker_id: SpeakerId, display_name: String, kind: MembershipKind) {
        let now_ms = self.clock.now_ms();
        match kind {
            MembershipKind::Join => {
                self.participants.insert(speaker_id.clone());
                self.participant_names.insert(speaker_id.clone(), display_name.clone());
            }
            MembershipKind::Leave => {
                self.participants.remove(&speaker_id);
                self.participant_names.remove(&speaker_id);
            }
        }
        self.membership_log.push(MembershipEvent { speaker_id, display_name, kind, at_ms: now_ms });
    }

    pub fn on_bot_removed_from_channel(&mut self) {
        let grace_ms = self.settings.orchestrator.bot_disconnect_grace_ms;
        self.timers.bot_disconnect_grace.schedule(grace_ms, self.tx.clone(), SessionEvent::BotDisconnectGraceElapsed);
    }

    pub fn on_bot_membership_recovered(&mut self) {
        self.timers.bot_disconnect_grace.cancel();
    }

    /// Apply an [`InterruptionAction`] produced by [`ReplyLockState`]: clear
    /// playback, cancel the active response, and log.
    pub async fn apply_interruption(&mut self, action: InterruptionAction) {
        match action {
            InterruptionAction::Interrupt { speaker_id, full_override } => {
                self.playback.clear();
                self.transport.destroy().await;
                if let (Some(client), Some(pending)) = (&self.realtime_client, &self.pending_response) {
                    let _ = client.cancel_active_response().await;
                    let _ = pending;
                }
                self.pending_response = None;
                self.close_bot_turn();
                ActionLogEvent::VoiceBargeInInterrupt { speaker_id: speaker_id.clone() }.log();
                if matches!(self.mode, SessionMode::OpenAiRealtime) {
                    let now_ms = self.clock.now_ms();
                    self.bargein_retry_stash = Some(BargeInRetryStash { speaker_id: speaker_id.clone(), stashed_at_ms: now_ms });
                }
                if full_override {
                    ActionLogEvent::VoiceBargeInRetrySkippedFullOverride { speaker_id }.log();
                }
            }
            InterruptionAction::SuppressionCleared => {
                ActionLogEvent::VoiceBargeInSuppressionCleared {}.log();
            }
            InterruptionAction::RetrySkippedFullOverride { speaker_id } => {
                ActionLogEvent::VoiceBargeInRetrySkippedFullOverride { speaker_id }.log();
            }
        }
    }

    /// Push a finalized capture into the appropriate queue based on mode,
    /// applying silence-gate drop and coalescing policy first.
    pub fn enqueue_finalized_capture(&mut self, capture: FinalizedCapture) {
        use crate::gates;

        if gates::silence_gate(&capture.pcm, 24_000, &self.settings.gates) {
            ActionLogEvent::VoiceTurnDroppedSilenceGate { speaker_id: capture.speaker_id, bytes: capture.pcm.len() }.log();
            return;
        }

        ActionLogEvent::VoiceTurnFinalized {
            speaker_id: capture.speaker_id.clone(),
            bytes: capture.pcm.len(),
            capture_reason: capture.reason.to_string(),
        }
        .log();

        let now_ms = self.clock.now_ms();
        match self.mode {
            SessionMode::OpenAiRealtime => {
                let outcome = self.realtime_queue.push(
                    capture,
                    now_ms,
                    self.settings.turn_queues.realtime_turn_queue_max,
                    self.settings.turn_queues.realtime_turn_pending_merge_max_bytes,
                );
                if let crate::turns::PushOutcome::Coalesced { merged_turn_count, dropped_head_bytes } = outcome {
                    ActionLogEvent::RealtimeTurnCoalesced {
                        speaker_id: String::new(),
                        merged_turn_count,
                        dropped_head_bytes,
                    }
                    .log();
                }
            }
            SessionMode::SttPipeline | SessionMode::VoiceAgent => {
                let outcome = self.stt_queue.push_stt(
                    capture,
                    now_ms,
                    self.settings.turn_queues.stt_turn_queue_max,
                    self.settings.turn_queues.stt_turn_coalesce_window_ms,
                    self.settings.turn_queues.stt_turn_coalesce_max_bytes,
                );
                if let crate::turns::PushOutcome::Coalesced { merged_turn_count, dropped_head_bytes } = outcome {
                    ActionLogEvent::RealtimeTurnCoalesced {
                        speaker_id: String::new(),
                        merged_turn_count,
                        dropped_head_bytes,
                    }
                    .log();
                }
            }
        }
    }

    /// Queue an already-transcribed turn that arrived while the bot's own
    /// turn was open. The driver that owns ASR is responsible for
    /// transcribing before calling this.
    pub fn push_deferred(&mut self, speaker_id: SpeakerId, pcm: Vec<u8>, transcript: String) {
        let now_ms = self.clock.now_ms();
        let turn = DeferredTurn::new(speaker_id.clone(), pcm, transcript, now_ms);
        self.deferred_queue.push(turn, self.settings.turn_queues.bot_turn_deferred_queue_max);
        let delay_ms = self.settings.turn_queues.bot_turn_deferred_flush_delay_ms;
        self.timers.deferred_flush.schedule(delay_ms, self.tx.clone(), SessionEvent::DeferredFlushDue);
        ActionLogEvent::VoiceTurnDeferredBotTurnOpen { speaker_id, reason: "bot_turn_open".to_string() }.log();
    }

    pub fn flush_deferred(&mut self) -> Vec<DeferredTurn> {
        self.deferred_queue.drain_coalesced(self.settings.turn_queues.bot_turn_deferred_coalesce_max)
    }

    /// Re-run addressing + decision over a flushed deferred turn's existing
    /// transcript and audio rather than re-running ASR.
    pub async fn handle_flushed_deferred_turn(&mut self, deferred: DeferredTurn) {
        match self.mode {
            SessionMode::OpenAiRealtime => self.deliver_deferred_realtime(deferred).await,
            SessionMode::SttPipeline | SessionMode::VoiceAgent => self.deliver_deferred_stt(deferred).await,
        }
    }

    pub fn clock_now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Drive the reply lock's own clock-only transition (barge-in
    /// suppression expiry and a queued retry) on the run loop's pump tick.
    pub fn reply_lock_tick(&mut self, now_ms: u64) -> Option<InterruptionAction> {
        self.reply_lock.tick(now_ms, &self.settings.barge_in)
    }

    /// One playback pump tick on the run loop's fixed cadence; see
    /// [`crate::playback::PlaybackQueue::pump_tick`].
    pub async fn pump_playback_once(&mut self) -> crate::playback::PumpOutcome {
        self.playback.pump_tick(self.transport.as_ref(), &self.settings.playback).await
    }

    pub fn record_turn(&mut self, turn: VoiceTurn) {
        self.decision_context.push(turn.clone());
        self.transcript_timeline.push(turn);
    }

    /// Apply a new settings snapshot. May require ending the session (e.g.
    /// mode change is not supported mid-session) or simply resetting
    /// timers whose durations changed.
    pub fn reconcile_settings(&mut self, new_settings: Arc<VoiceSettings>) {
        self.settings = Arc::new((*new_settings).clone().clamp());
        self.arm_lifetime_timers();
    }

    /// Idempotent session teardown. Returns `true` only for the caller
    /// that actually performed teardown; subsequent calls return `false`,
    /// guarded so concurrent callers see it too.
    pub async fn end_session(&mut self, reason: &str) -> bool {
        if self.ending {
            return false;
        }
        self.ending = true;

        self.timers.cancel_all();
        self.realtime_queue.clear();
        self.stt_queue.clear();
        self.playback.clear();
        self.pending_response = None;

        if let Some(client) = self.realtime_client.take() {
            let _ = client.close().await;
        }
        self.transport.destroy().await;

        let duration_ms = self.clock.now_ms().saturating_sub(self.started_at_ms);
        ActionLogEvent::VoiceSessionEnd {
            guild_id: self.guild_id.clone(),
            session_id: self.session_id.clone(),
            reason: reason.to_string(),
            duration_ms,
        }
        .log();
        info!(guild_id = %self.guild_id, reason, duration_ms, "voice session ended");

        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            guild_id: self.guild_id.clone(),
            mode: self.mode,
            started_at_ms: self.started_at_ms,
            last_activity_at_ms: self.last_activity_at_ms,
            max_ends_at_ms: self.started_at_ms + (self.settings.orchestrator.max_session_minutes as u64) * 60_000,
            inactivity_ends_at_ms: self.last_activity_at_ms + (self.settings.orchestrator.inactivity_leave_seconds as u64) * 1_000,
            participants: self.participants.iter().cloned().collect(),
            active_captures: self.captures.active_speaker_ids(),
            pending_deferred_turns: self.deferred_queue.len(),
            recent_turns: self.decision_context.to_vec(),
            realtime: if matches!(self.mode, SessionMode::OpenAiRealtime) {
                Some(RealtimeSnapshot {
                    pending_turns: self.realtime_queue.len(),
                    drain_active: self.pending_response.is_some(),
                    superseded_count: self.superseded_count,
                    state: if self.ending { "ending".to_string() } else { "active".to_string() },
                })
            } else {
                None
            },
            stt: if matches!(self.mode, SessionMode::SttPipeline) {
                Some(SttSnapshot { pending_turns: self.stt_queue.len() })
            } else {
                None
            },
            latency: self.latency.clone(),
        }
    }
}

/// Build a [`RuntimeState`] from a set of session snapshots.
pub fn runtime_state(sessions: Vec<SessionSnapshot>) -> RuntimeState {
    RuntimeState { sessions }
}
