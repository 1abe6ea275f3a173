//! End-to-end scenario tests driving `Session` purely through its public
//! surface: the constructor, event-handling methods, and `snapshot()`.
//! Each fake collaborator counts the calls it receives so a scenario can
//! assert on side effects without reaching into session-internal state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use voice_session_core::capture::FinalizedCapture;
use voice_session_core::clock::{Clock, ManualClock};
use voice_session_core::collaborators::{LanguageModel, RealtimeClient, TransportSink};
use voice_session_core::reply_lock::InterruptionAction;
use voice_session_core::session::{Session, SessionHandles};
use voice_session_core::settings::VoiceSettings;
use voice_session_core::types::{CaptureReason, SessionMode, VoiceTurn};

struct FakeSink;

#[async_trait]
impl TransportSink for FakeSink {
    async fn write_pcm(&self, _frame: &[u8]) -> bool {
        true
    }
    async fn destroy(&self) {}
}

/// Realtime client stub that counts how many times each call lands, so a
/// scenario can assert on the shape of the silence-recovery ladder without
/// a real websocket on the other end.
#[derive(Default)]
struct FakeRealtime {
    create_audio_response_calls: AtomicU32,
    commit_calls: AtomicU32,
}

#[async_trait]
impl RealtimeClient for FakeRealtime {
    async fn append_input_audio_pcm(&self, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn commit_input_audio_buffer(&self) -> anyhow::Result<()> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn create_audio_response(&self) -> anyhow::Result<()> {
        self.create_audio_response_calls.fetch_add(1, Ordering::SeqCst);
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

/// LLM stub. `transcribe_audio` always returns a fixed non-empty transcript
/// and counts its calls, which is what lets the stale-skip scenario confirm
/// ASR ran for exactly one surviving turn. `generate_json` always answers
/// the reply-decision contract with "NO" — which also happens to fail to
/// parse as the addressing contract, so the addressing classifier falls
/// back to `TalkingTo::All` on the same response without any extra wiring.
#[derive(Default)]
struct FakeLlm {
    transcribe_calls: AtomicU32,
    transcript: String,
}

impl FakeLlm {
    fn with_transcript(transcript: &str) -> Self {
        Self { transcribe_calls: AtomicU32::new(0), transcript: transcript.to_string() }
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    async fn generate(&self, _prompt: &str, _context: &[VoiceTurn]) -> anyhow::Result<String> {
        Ok(String::new())
    }
    async fn transcribe_audio(&self, _wav: &[u8], _model: &str) -> anyhow::Result<String> {
        self.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcript.clone())
    }
    async fn synthesize_speech(&self, _text: &str, _voice: &str, _rate: u32) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn generate_json(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok(r#"{"decision":"NO"}"#.to_string())
    }
}

fn quiet_pcm(sample_count: usize) -> Vec<u8> {
    vec![0i16; sample_count].iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn loud_pcm(sample_count: usize) -> Vec<u8> {
    vec![20_000i16; sample_count].iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn capture(speaker_id: &str, pcm: Vec<u8>, reason: CaptureReason, duration_ms: u64) -> FinalizedCapture {
    FinalizedCapture { speaker_id: speaker_id.to_string(), reason, pcm, started_at_ms: 0, duration_ms }
}

struct Harness {
    session: Session,
    clock: Arc<ManualClock>,
    realtime: Arc<FakeRealtime>,
    llm: Arc<FakeLlm>,
}

fn build_session(mode: SessionMode, llm: Arc<FakeLlm>) -> Harness {
    let manual = Arc::new(ManualClock::new());
    let clock: Arc<dyn Clock> = manual.clone();
    let realtime = Arc::new(FakeRealtime::default());
    let handles = SessionHandles {
        transport: Arc::new(FakeSink),
        realtime_client: Some(realtime.clone()),
        llm: llm.clone(),
    };
    let (session, _rx) = Session::new(
        "guild1".to_string(),
        "text1".to_string(),
        "voice1".to_string(),
        mode,
        VoiceSettings::default(),
        clock,
        "Nova",
        &[],
        handles,
    )
    .unwrap();
    Harness { session, clock: manual, realtime, llm }
}

/// S1: a clip that stays quiet for its whole (above-minimum) duration is
/// dropped by the silence gate rather than queued for either driver.
#[tokio::test]
async fn quiet_clip_is_dropped_not_queued() {
    let mut harness = build_session(SessionMode::SttPipeline, Arc::new(FakeLlm::default()));

    let silent = capture("u1", quiet_pcm(24_000), CaptureReason::SpeakingEnd, 1_000);
    harness.session.enqueue_finalized_capture(silent);

    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.stt.unwrap().pending_turns, 0);
}

/// S2: two consecutive same-speaker captures in realtime mode coalesce into
/// a single queued turn instead of piling up as separate entries.
#[tokio::test]
async fn consecutive_same_speaker_captures_coalesce() {
    let mut harness = build_session(SessionMode::OpenAiRealtime, Arc::new(FakeLlm::default()));

    harness.session.enqueue_finalized_capture(capture("u1", loud_pcm(100), CaptureReason::SpeakingEnd, 200));
    harness.clock.advance(50);
    harness.session.enqueue_finalized_capture(capture("u1", loud_pcm(100), CaptureReason::SpeakingEnd, 200));

    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.realtime.unwrap().pending_turns, 1);
}

/// S3: a stale turn with a newer turn from a different speaker already
/// queued behind it is skipped rather than answered late, and ASR only
/// ever runs on the turn that survives.
#[tokio::test]
async fn stale_turn_is_skipped_when_backlog_exists() {
    let llm = Arc::new(FakeLlm::with_transcript("just some unrelated chatter in the background"));
    let mut harness = build_session(SessionMode::OpenAiRealtime, llm.clone());

    harness.session.enqueue_finalized_capture(capture("a", loud_pcm(50), CaptureReason::IdleFlush, 100));
    harness.clock.advance(6_001); // past realtime_turn_stale_skip_ms default (6000ms)
    harness.session.enqueue_finalized_capture(capture("b", loud_pcm(50), CaptureReason::IdleFlush, 100));

    assert_eq!(harness.session.snapshot().realtime.unwrap().pending_turns, 2);

    harness.session.drive_realtime_turn().await;

    assert_eq!(harness.session.snapshot().realtime.unwrap().pending_turns, 0);
    assert_eq!(llm.transcribe_calls.load(Ordering::SeqCst), 1, "only the surviving turn should have been transcribed");
}

/// S4: a barge-in's interrupted utterance resumes (skipping ASR and the
/// decision pipeline entirely) when the interrupting speaker's own
/// follow-up capture turns out short; a long follow-up is treated as an
/// ordinary new turn instead.
#[tokio::test]
async fn short_followup_resumes_interrupted_reply() {
    let mut harness = build_session(SessionMode::OpenAiRealtime, Arc::new(FakeLlm::default()));

    harness.session.apply_interruption(InterruptionAction::Interrupt { speaker_id: "u1".to_string(), full_override: false }).await;
    harness.clock.advance(100);

    let short_followup = capture("u1", loud_pcm(10), CaptureReason::SpeakingEnd, 200);
    harness.session.handle_finalized_capture(short_followup).await;

    // Resumed via the retry path: no ordinary turn was queued, and the
    // resumed reply reopened the bot's turn and re-requested audio.
    assert_eq!(harness.session.snapshot().realtime.unwrap().pending_turns, 0);
    assert!(harness.session.bot_turn_open());
    assert_eq!(harness.realtime.create_audio_response_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn long_followup_is_queued_instead_of_resumed() {
    let mut harness = build_session(SessionMode::OpenAiRealtime, Arc::new(FakeLlm::default()));

    harness.session.apply_interruption(InterruptionAction::Interrupt { speaker_id: "u1".to_string(), full_override: false }).await;
    harness.clock.advance(100);

    // Long enough that `short_follow_up` is false, so the stash is dropped
    // and the capture is routed through the ordinary enqueue + drive path
    // instead of the retry's direct `create_audio_response` call.
    let long_followup = capture("u1", loud_pcm(50), CaptureReason::SpeakingEnd, 5_000);
    harness.session.handle_finalized_capture(long_followup).await;

    assert_eq!(harness.realtime.create_audio_response_calls.load(Ordering::SeqCst), 0);
    // The ordinary path drove the turn immediately; with no real ASR
    // behind the fake LLM it was dropped as a too-short/empty transcript,
    // so nothing is left pending either way.
    assert_eq!(harness.session.snapshot().realtime.unwrap().pending_turns, 0);
}

/// S5: the silent-response recovery ladder retries up to the configured
/// count, performs one hard recovery attempt, then gives up and clears the
/// pending response so the floor is free again.
#[tokio::test]
async fn silent_response_recovery_ladder_runs_to_fallback() {
    let mut harness = build_session(SessionMode::OpenAiRealtime, Arc::new(FakeLlm::default()));

    harness.session.apply_interruption(InterruptionAction::Interrupt { speaker_id: "u1".to_string(), full_override: false }).await;
    harness.clock.advance(100);
    harness.session.handle_finalized_capture(capture("u1", loud_pcm(10), CaptureReason::SpeakingEnd, 200)).await;
    assert_eq!(harness.realtime.create_audio_response_calls.load(Ordering::SeqCst), 1);

    let request_id = format!("{}-1", harness.session.session_id);
    let max_retries = VoiceSettings::default().realtime_driver.max_response_silence_retries;

    for attempt in 0..max_retries {
        harness.session.on_response_silence_watchdog(request_id.clone(), attempt).await;
    }
    // One create_audio_response per retry attempt, plus the initial resume call.
    assert_eq!(harness.realtime.create_audio_response_calls.load(Ordering::SeqCst), 1 + max_retries);

    // Hard recovery attempt: buffer is empty, so no extra commit/create call.
    harness.session.on_response_silence_watchdog(request_id.clone(), max_retries).await;
    assert_eq!(harness.realtime.commit_calls.load(Ordering::SeqCst), 0);

    // Fallback: gives up, clears the pending response and the bot's turn.
    harness.session.on_response_silence_watchdog(request_id.clone(), max_retries + 1).await;
    assert!(!harness.session.bot_turn_open());
    assert!(!harness.session.reply_lock_held());
}

/// S6: turns deferred while the bot's own turn was open coalesce
/// same-speaker-adjacent entries into one flush-ready turn, concatenating
/// both transcript and audio, rather than replaying each fragment on its
/// own.
#[tokio::test]
async fn deferred_turns_coalesce_on_flush() {
    let mut harness = build_session(SessionMode::SttPipeline, Arc::new(FakeLlm::default()));

    harness.session.push_deferred("u1".to_string(), loud_pcm(10), "hello".to_string());
    harness.clock.advance(10);
    harness.session.push_deferred("u1".to_string(), loud_pcm(10), "there".to_string());

    assert_eq!(harness.session.snapshot().pending_deferred_turns, 2);

    let mut flushed = harness.session.flush_deferred();
    assert_eq!(harness.session.snapshot().pending_deferred_turns, 0);
    assert_eq!(flushed.len(), 1);

    let turn = flushed.remove(0);
    assert_eq!(turn.transcript, "hello there");
    assert_eq!(turn.pcm.len(), 40); // 10 + 10 i16 samples, 2 bytes each

    // Re-delivering the flushed turn should run without panicking, even
    // though the decision pipeline denies it (stubbed LLM answers "NO").
    harness.session.handle_flushed_deferred_turn(turn).await;
    assert!(!harness.session.bot_turn_open());
}
