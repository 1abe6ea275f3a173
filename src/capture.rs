//! Capture tracker (module C)
//!
//! One [`Capture`] exists per speaker currently talking. It accumulates
//! mono16 PCM at the session's working rate, keeps running signal stats so
//! the near-silence-abort check never has to rescan the whole buffer, and
//! owns the idle-flush and max-duration timers that bound how long a
//! capture can stay open. [`CaptureTable`] is the per-session collection,
//! keyed by speaker, mirroring the SSRC-keyed buffer map in the pack's
//! `PacketHandler` (`on_start_talking` / `on_audio` / `on_stop_talking`)
//! adapted to the teacher's `voice::vad` state-machine style.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::clock::Clock;
use crate::gates::{self, GateThresholds, SignalStats};
use crate::settings::CaptureSettings;
use crate::timer::TimerHandle;
use crate::types::{CaptureReason, SpeakerId};

/// Fired when one of a capture's timers elapses. The owning session selects
/// on the receiving end and dispatches back into [`CaptureTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTimerEvent {
    IdleFlush(u64),
    MaxDuration(u64),
    SettleElapsed(u64),
}

/// A capture that has left the table, ready to be handed to the turn
/// queues.
#[derive(Debug, Clone)]
pub struct FinalizedCapture {
    pub speaker_id: SpeakerId,
    pub reason: CaptureReason,
    pub pcm: Vec<u8>,
    pub started_at_ms: u64,
    pub duration_ms: u64,
}

/// Accumulated running stats, updated incrementally on every `append` so
/// the abort check in the hot audio path never rescans the buffer.
#[derive(Debug, Clone, Copy, Default)]
struct RunningStats {
    sample_count: u64,
    sum_sq: f64,
    peak: i32,
    active: u64,
}

impl RunningStats {
    fn absorb(&mut self, stats: &SignalStats, samples_in_chunk: usize) {
        // `stats` here is the chunk's own analysis; fold it into the running
        // totals using its reported ratios scaled back to sample counts.
        let active_in_chunk = (stats.active_ratio as f64 * samples_in_chunk as f64).round() as u64;
        let chunk_sum_sq = (stats.rms_normalized as f64 * i16::MAX as f64).powi(2) * samples_in_chunk as f64;
        self.sample_count += samples_in_chunk as u64;
        self.sum_sq += chunk_sum_sq;
        self.active += active_in_chunk;
        let chunk_peak = (stats.peak_normalized * i16::MAX as f32) as i32;
        self.peak = self.peak.max(chunk_peak);
    }

    fn as_signal_stats(&self) -> SignalStats {
        if self.sample_count == 0 {
            return SignalStats { sample_count: 0, rms_normalized: 0.0, peak_normalized: 0.0, active_ratio: 0.0 };
        }
        let rms = (self.sum_sq / self.sample_count as f64).sqrt();
        SignalStats {
            sample_count: self.sample_count as usize,
            rms_normalized: (rms / i16::MAX as f64) as f32,
            peak_normalized: self.peak as f32 / i16::MAX as f32,
            active_ratio: self.active as f32 / self.sample_count as f32,
        }
    }
}

/// An in-progress capture for a single speaker.
#[derive(Debug)]
pub struct Capture {
    pub speaker_id: SpeakerId,
    pub started_at_ms: u64,
    pcm: Vec<u8>,
    stats: RunningStats,
    last_activity_touch_ms: u64,
    idle_timer: TimerHandle,
    max_timer: TimerHandle,
    settle_timer: TimerHandle,
    pending_settle_reason: Option<CaptureReason>,
}

impl Capture {
    fn new(speaker_id: SpeakerId, now_ms: u64) -> Self {
        Self {
            speaker_id,
            started_at_ms: now_ms,
            pcm: Vec::new(),
            stats: RunningStats::default(),
            last_activity_touch_ms: now_ms,
            idle_timer: TimerHandle::new(),
            max_timer: TimerHandle::new(),
            settle_timer: TimerHandle::new(),
            pending_settle_reason: None,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }

    pub fn byte_len(&self) -> usize {
        self.pcm.len()
    }

    pub fn signal_stats(&self) -> SignalStats {
        self.stats.as_signal_stats()
    }

    /// Whether the last activity touch is old enough that a new one should
    /// be emitted (spec §5, `activity_touch_throttle_ms`).
    fn should_touch_activity(&self, now_ms: u64, throttle_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_touch_ms) >= throttle_ms
    }

    fn into_finalized(self, reason: CaptureReason) -> FinalizedCapture {
        FinalizedCapture {
            speaker_id: self.speaker_id,
            duration_ms: gates::estimate_duration_ms(self.pcm.len(), 24_000),
            reason,
            pcm: self.pcm,
            started_at_ms: self.started_at_ms,
        }
    }
}

/// Outcome of appending a chunk of audio to an open capture.
pub struct AppendOutcome {
    /// Set when `activity_touch_throttle_ms` has elapsed since the last
    /// touch; the caller should refresh the session's inactivity timer.
    pub activity_touch: bool,
    /// Set when the running stats crossed the near-silence-abort threshold;
    /// the capture has already been removed from the table.
    pub aborted: Option<FinalizedCapture>,
}

/// Per-session collection of in-progress captures, keyed by speaker.
#[derive(Debug, Default)]
pub struct CaptureTable {
    captures: HashMap<SpeakerId, Capture>,
}

impl CaptureTable {
    pub fn new() -> Self {
        Self { captures: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.captures.len()
    }

    pub fn active_speaker_ids(&self) -> Vec<SpeakerId> {
        self.captures.keys().cloned().collect()
    }

    pub fn contains(&self, speaker_id: &str) -> bool {
        self.captures.contains_key(speaker_id)
    }

    /// Begin tracking a new capture for `speaker_id`. A pre-existing
    /// capture for the same speaker (should not happen under normal
    /// transport behavior) is replaced, its timers dropped and cancelled.
    pub fn start(
        &mut self,
        speaker_id: SpeakerId,
        now_ms: u64,
        settings: &CaptureSettings,
        tx: &UnboundedSender<CaptureTimerEvent>,
    ) {
        let mut capture = Capture::new(speaker_id.clone(), now_ms);
        Self::arm_idle_timer(&mut capture, settings.capture_idle_flush_ms, tx);
        Self::arm_max_timer(&mut capture, settings.capture_max_duration_ms, tx);
        self.captures.insert(speaker_id, capture);
    }

    fn arm_idle_timer(capture: &mut Capture, delay_ms: u64, tx: &UnboundedSender<CaptureTimerEvent>) {
        let key = capture_key(&capture.speaker_id);
        capture.idle_timer.schedule(delay_ms, tx.clone(), CaptureTimerEvent::IdleFlush(key));
    }

    fn arm_max_timer(capture: &mut Capture, delay_ms: u64, tx: &UnboundedSender<CaptureTimerEvent>) {
        let key = capture_key(&capture.speaker_id);
        capture.max_timer.schedule(delay_ms, tx.clone(), CaptureTimerEvent::MaxDuration(key));
    }

    /// Append one chunk of mono16 PCM to `speaker_id`'s open capture. Resets
    /// the idle-flush timer. Returns `None` if there is no open capture for
    /// that speaker (late audio after the capture already closed).
    pub fn append(
        &mut self,
        speaker_id: &str,
        chunk: &[u8],
        now_ms: u64,
        settings: &CaptureSettings,
        gate_thresholds: &GateThresholds,
        tx: &UnboundedSender<CaptureTimerEvent>,
    ) -> Option<AppendOutcome> {
        let chunk_stats = gates::analyze_mono(chunk);
        let samples_in_chunk = chunk.len() / 2;

        let capture = self.captures.get_mut(speaker_id)?;
        capture.pcm.extend_from_slice(chunk);
        capture.stats.absorb(&chunk_stats, samples_in_chunk);
        Self::arm_idle_timer(capture, settings.capture_idle_flush_ms, tx);

        let activity_touch = capture.should_touch_activity(now_ms, settings.activity_touch_throttle_ms);
        if activity_touch {
            capture.last_activity_touch_ms = now_ms;
        }

        let age_ms = capture.age_ms(now_ms);
        let running_stats = capture.signal_stats();
        if gates::near_silence_abort(age_ms, &running_stats, gate_thresholds) {
            let capture = self.captures.remove(speaker_id).expect("just borrowed mutably above");
            return Some(AppendOutcome { activity_touch, aborted: Some(capture.into_finalized(CaptureReason::NearSilenceAbort)) });
        }

        Some(AppendOutcome { activity_touch, aborted: None })
    }

    /// Handle speaking-end: rather than finalize immediately, arm a short
    /// settle timer scaled by utterance length and current session load so
    /// trailing syllables captured by a lagging transport still land in the
    /// same turn (spec §4.C, "settle delay").
    pub fn on_speaking_end(
        &mut self,
        speaker_id: &str,
        now_ms: u64,
        settings: &CaptureSettings,
        concurrent_captures: usize,
        queue_backlog: usize,
        tx: &UnboundedSender<CaptureTimerEvent>,
    ) {
        let Some(capture) = self.captures.get_mut(speaker_id) else { return };
        let duration_ms = capture.age_ms(now_ms);
        let base_tier_ms = if duration_ms < 400 {
            settings.settle_delay_micro_ms
        } else if duration_ms < 2_000 {
            settings.settle_delay_short_ms
        } else {
            settings.settle_delay_quick_ms
        };
        let delay_ms = settings.settle_delay_ms(base_tier_ms, concurrent_captures, queue_backlog);
        capture.pending_settle_reason = Some(CaptureReason::SpeakingEnd);
        let key = capture_key(speaker_id);
        capture.settle_timer.schedule(delay_ms, tx.clone(), CaptureTimerEvent::SettleElapsed(key));
    }

    /// The settle timer fired: finalize the capture with its pending reason.
    pub fn settle_elapsed(&mut self, speaker_id: &str) -> Option<FinalizedCapture> {
        let mut capture = self.captures.remove(speaker_id)?;
        let reason = capture.pending_settle_reason.take().unwrap_or(CaptureReason::SpeakingEnd);
        Some(capture.into_finalized(reason))
    }

    /// The idle-flush timer fired. No-op if the capture already closed via
    /// another path (abort, max-duration) before this timer was cancelled.
    pub fn idle_elapsed(&mut self, speaker_id: &str) -> Option<FinalizedCapture> {
        let capture = self.captures.remove(speaker_id)?;
        Some(capture.into_finalized(CaptureReason::IdleFlush))
    }

    /// The max-duration timer fired: hard cutoff regardless of ongoing speech.
    pub fn max_duration_elapsed(&mut self, speaker_id: &str) -> Option<FinalizedCapture> {
        let capture = self.captures.remove(speaker_id)?;
        Some(capture.into_finalized(CaptureReason::MaxDuration))
    }

    /// Forcefully close a capture for a reason other than the normal timers
    /// (stream error, or a bot-turn-open deferred flush).
    pub fn abort(&mut self, speaker_id: &str, reason: CaptureReason) -> Option<FinalizedCapture> {
        let capture = self.captures.remove(speaker_id)?;
        Some(capture.into_finalized(reason))
    }
}

/// Timer events key captures by a stable hash of the speaker id rather than
/// the `String` itself, since `TimerHandle::schedule`'s payload must be
/// `Send + 'static` and cheap to move into the spawned task.
fn capture_key(speaker_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    speaker_id.hash(&mut hasher);
    hasher.finish()
}

/// Session-facing glue between inbound transport events and the capture
/// table: owns no new state of its own, just threads `capture_timer_tx`
/// and the relevant settings through on the session's behalf (spec §4.I,
/// §5 "transport callbacks post work into it via async invocations").
impl crate::session::Session {
    pub fn handle_speaking_start(&mut self, speaker_id: SpeakerId) {
        let now_ms = self.clock.now_ms();
        self.captures.start(speaker_id, now_ms, &self.settings.capture, &self.capture_timer_tx);
    }

    pub fn handle_speaking_end(&mut self, speaker_id: SpeakerId) {
        let now_ms = self.clock.now_ms();
        let concurrent_captures = self.captures.len();
        let queue_backlog = self.realtime_queue.len() + self.stt_queue.len();
        self.captures.on_speaking_end(&speaker_id, now_ms, &self.settings.capture, concurrent_captures, queue_backlog, &self.capture_timer_tx);
    }

    /// Append one inbound chunk: feeds the barge-in evaluator first (since a
    /// chunk can interrupt the bot regardless of whether it ends up in an
    /// open capture), then the capture table itself.
    pub async fn handle_audio_chunk(&mut self, speaker_id: SpeakerId, pcm: Vec<u8>) -> Option<FinalizedCapture> {
        let now_ms = self.clock.now_ms();
        let chunk_duration_ms = gates::estimate_duration_ms(pcm.len(), 24_000);
        let chunk_stats = gates::analyze_mono(&pcm);
        self.last_inbound_audio_at_ms = Some(now_ms);

        if let Some(action) = self.reply_lock.evaluate_chunk(
            &speaker_id,
            &chunk_stats,
            chunk_duration_ms,
            now_ms,
            &self.settings.gates,
            &self.settings.barge_in,
        ) {
            self.apply_interruption(action).await;
        }

        let outcome =
            self.captures.append(&speaker_id, &pcm, now_ms, &self.settings.capture, &self.settings.gates, &self.capture_timer_tx)?;
        if outcome.activity_touch {
            self.touch_activity(chunk_duration_ms);
        }
        outcome.aborted
    }

    /// Route a fired capture timer back to the table operation that owns
    /// it, keyed by the stable hash `TimerHandle::schedule`'s payload used.
    pub fn handle_capture_timer(&mut self, event: CaptureTimerEvent) -> Option<FinalizedCapture> {
        match event {
            CaptureTimerEvent::IdleFlush(key) => self.finalize_by_key(key, CaptureTable::idle_elapsed),
            CaptureTimerEvent::MaxDuration(key) => self.finalize_by_key(key, CaptureTable::max_duration_elapsed),
            CaptureTimerEvent::SettleElapsed(key) => self.finalize_by_key(key, CaptureTable::settle_elapsed),
        }
    }

    fn finalize_by_key(&mut self, key: u64, f: fn(&mut CaptureTable, &str) -> Option<FinalizedCapture>) -> Option<FinalizedCapture> {
        let speaker_id = self.captures.active_speaker_ids().into_iter().find(|id| capture_key(id) == key)?;
        f(&mut self.captures, &speaker_id)
    }

    /// Queue a finalized capture and immediately drive the reply driver for
    /// the session's current mode (spec §4.F → §4.J/§4.K handoff). First
    /// consults a stashed barge-in retry (spec §4.E "Retry"): a short
    /// same-speaker follow-up resumes the interrupted reply instead of
    /// being queued as an ordinary turn.
    pub async fn handle_finalized_capture(&mut self, capture: FinalizedCapture) {
        if matches!(self.mode, crate::types::SessionMode::OpenAiRealtime) {
            if let Some(true) = self.consult_bargein_retry_stash(&capture) {
                let speaker_id = capture.speaker_id.clone();
                self.resume_bargein_retry(speaker_id).await;
                return;
            }
        }

        self.enqueue_finalized_capture(capture);
        match self.mode {
            crate::types::SessionMode::OpenAiRealtime => self.drive_realtime_turn().await,
            crate::types::SessionMode::SttPipeline | crate::types::SessionMode::VoiceAgent => self.drive_stt_turn().await,
        }
    }

    /// Returns `Some(true)` if the capture resumed a stashed barge-in retry
    /// (caller should not also enqueue/drive it as a normal turn), `Some(false)`
    /// if a stash existed but was dropped (too long, too old, or a different
    /// speaker finalized first), `None` if there was no stash to consult.
    fn consult_bargein_retry_stash(&mut self, capture: &FinalizedCapture) -> Option<bool> {
        let stash = self.bargein_retry_stash.take()?;
        let now_ms = self.clock.now_ms();
        let age_ms = now_ms.saturating_sub(stash.stashed_at_ms);

        if stash.speaker_id != capture.speaker_id {
            // A different speaker's capture finalized first; keep waiting
            // for the interrupting speaker unless the stash has gone stale.
            if age_ms <= self.settings.barge_in.barge_in_retry_max_age_ms {
                self.bargein_retry_stash = Some(stash);
            }
            return None;
        }

        let short_follow_up = capture.duration_ms < self.settings.barge_in.barge_in_full_override_min_ms;
        let still_fresh = age_ms <= self.settings.barge_in.barge_in_retry_max_age_ms;

        if short_follow_up && still_fresh {
            Some(true)
        } else {
            Some(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn silence_chunk(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    fn loud_chunk(samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples * 2);
        for _ in 0..samples {
            out.extend_from_slice(&20_000i16.to_le_bytes());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_append_accumulates_bytes() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let settings = CaptureSettings::default();
        let gate = GateThresholds::default();

        table.start("u1".to_string(), 0, &settings, &tx);
        assert!(table.contains("u1"));

        let outcome = table.append("u1", &loud_chunk(480), 0, &settings, &gate, &tx).unwrap();
        assert!(outcome.activity_touch);
        assert!(outcome.aborted.is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn append_to_unknown_speaker_returns_none() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let settings = CaptureSettings::default();
        let gate = GateThresholds::default();
        assert!(table.append("ghost", &loud_chunk(10), 0, &settings, &gate, &tx).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn near_silence_abort_removes_capture() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let settings = CaptureSettings::default();
        let gate = GateThresholds::default();

        table.start("u1".to_string(), 0, &settings, &tx);
        // enough silent samples to push age past near_silence_abort_min_age_ms
        let silent = silence_chunk(24_000 * 5); // ~5s at 24kHz
        let outcome = table.append("u1", &silent, 5_000, &settings, &gate, &tx).unwrap();
        assert!(outcome.aborted.is_some());
        let finalized = outcome.aborted.unwrap();
        assert_eq!(finalized.reason, CaptureReason::NearSilenceAbort);
        assert!(!table.contains("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_and_finalizes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let settings = CaptureSettings::default();

        table.start("u1".to_string(), 0, &settings, &tx);
        tokio::time::advance(tokio::time::Duration::from_millis(settings.capture_idle_flush_ms + 50)).await;

        match rx.recv().await.unwrap() {
            CaptureTimerEvent::IdleFlush(key) => {
                assert_eq!(key, capture_key("u1"));
                let finalized = table.idle_elapsed("u1").unwrap();
                assert_eq!(finalized.reason, CaptureReason::IdleFlush);
            }
            other => panic!("expected IdleFlush, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_timer_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let mut settings = CaptureSettings::default();
        settings.capture_max_duration_ms = 200;
        settings.capture_idle_flush_ms = 100_000; // keep idle timer from racing

        table.start("u1".to_string(), 0, &settings, &tx);
        tokio::time::advance(tokio::time::Duration::from_millis(250)).await;

        match rx.recv().await.unwrap() {
            CaptureTimerEvent::MaxDuration(key) => {
                assert_eq!(key, capture_key("u1"));
                let finalized = table.max_duration_elapsed("u1").unwrap();
                assert_eq!(finalized.reason, CaptureReason::MaxDuration);
            }
            other => panic!("expected MaxDuration, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speaking_end_arms_settle_timer_then_finalizes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let settings = CaptureSettings::default();

        table.start("u1".to_string(), 0, &settings, &tx);
        table.on_speaking_end("u1", 300, &settings, 0, 0, &tx);
        assert!(table.contains("u1"), "capture stays open during settle delay");

        tokio::time::advance(tokio::time::Duration::from_secs(2)).await;
        let mut saw_settle = false;
        while let Ok(event) = rx.try_recv() {
            if let CaptureTimerEvent::SettleElapsed(key) = event {
                assert_eq!(key, capture_key("u1"));
                let finalized = table.settle_elapsed("u1").unwrap();
                assert_eq!(finalized.reason, CaptureReason::SpeakingEnd);
                saw_settle = true;
            }
        }
        assert!(saw_settle);
        assert!(!table.contains("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_closes_capture_with_given_reason() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut table = CaptureTable::new();
        let settings = CaptureSettings::default();

        table.start("u1".to_string(), 0, &settings, &tx);
        let finalized = table.abort("u1", CaptureReason::StreamError).unwrap();
        assert_eq!(finalized.reason, CaptureReason::StreamError);
        assert!(table.abort("u1", CaptureReason::StreamError).is_none());
    }
}
