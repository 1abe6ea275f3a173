//! Per-session run loop: a single logical task per session.
//!
//! Owns the one `tokio::select!` that drives a [`Session`] end to end:
//! inbound [`SessionEvent`]s on one side, a fixed-cadence playback
//! pump/barge-in tick on the other. Nothing outside this loop (and the
//! methods it calls through) ever mutates session state directly, the
//! same single-task-per-connection shape `gateway::mod`'s run loop uses
//! for one Discord voice connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::action_log::ActionLogEvent;
use crate::session::{Session, SessionEvent};
use crate::types::MembershipKind;

/// Cadence for the playback pump and barge-in suppression tick: one
/// Discord frame (20ms of 48kHz stereo16).
const PUMP_INTERVAL_MS: u64 = 20;

/// Spawn the session's run loop as its own task. Returns the shared handle
/// callers (the registry) use for read-only snapshot queries and posting
/// events, plus the task's `JoinHandle` so a caller can await teardown.
pub fn spawn(session: Session, rx: UnboundedReceiver<SessionEvent>) -> (Arc<Mutex<Session>>, JoinHandle<()>) {
    let session = Arc::new(Mutex::new(session));
    let task_session = session.clone();
    let handle = tokio::spawn(async move { run(task_session, rx).await });
    (session, handle)
}

async fn run(session: Arc<Mutex<Session>>, mut rx: UnboundedReceiver<SessionEvent>) {
    let mut pump_tick = tokio::time::interval(Duration::from_millis(PUMP_INTERVAL_MS));
    pump_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let mut session = session.lock().await;
                let is_end = matches!(event, SessionEvent::EndSession { .. });
                if session.ending && !is_end {
                    continue;
                }
                dispatch(&mut session, event).await;
                if session.ending {
                    break;
                }
            }
            _ = pump_tick.tick() => {
                let mut session = session.lock().await;
                if session.ending {
                    continue;
                }
                pump_playback_and_barge_in(&mut session).await;
            }
        }
    }
    debug!("session run loop exited");
}

async fn dispatch(session: &mut Session, event: SessionEvent) {
    match event {
        SessionEvent::SpeakingStart { speaker_id } => session.handle_speaking_start(speaker_id),
        SessionEvent::SpeakingEnd { speaker_id } => session.handle_speaking_end(speaker_id),
        SessionEvent::AudioChunk { speaker_id, pcm } => {
            if let Some(capture) = session.handle_audio_chunk(speaker_id, pcm).await {
                session.handle_finalized_capture(capture).await;
            }
        }
        SessionEvent::CaptureTimer(timer_event) => {
            if let Some(capture) = session.handle_capture_timer(timer_event) {
                session.handle_finalized_capture(capture).await;
            }
        }
        SessionEvent::Realtime(realtime_event) => session.handle_realtime_event(realtime_event).await,
        SessionEvent::MembershipChanged { speaker_id, display_name, kind } => {
            session.record_membership(speaker_id, display_name, kind);
        }
        SessionEvent::BotRemovedFromChannel => session.on_bot_removed_from_channel(),
        SessionEvent::BotMembershipRecovered => session.on_bot_membership_recovered(),
        SessionEvent::MaxDurationElapsed => {
            session.end_session("max_duration_elapsed").await;
        }
        SessionEvent::InactivityElapsed => {
            session.end_session("inactivity_timeout").await;
        }
        SessionEvent::BotDisconnectGraceElapsed => {
            session.end_session("bot_disconnect_grace_elapsed").await;
        }
        SessionEvent::ThoughtLoopDue => session.drive_thought_loop().await,
        SessionEvent::DeferredFlushDue => {
            for deferred in session.flush_deferred() {
                session.handle_flushed_deferred_turn(deferred).await;
            }
        }
        SessionEvent::ResponseSilenceWatchdog { request_id, attempt } => {
            session.on_response_silence_watchdog(request_id, attempt).await;
        }
        SessionEvent::ResponseDoneGrace { request_id } => {
            // The grace window elapsed with no audio since `response_done`;
            // re-enter the same recovery ladder at its first rung.
            session.on_response_silence_watchdog(request_id, 0).await;
        }
        SessionEvent::InstructionRefreshDue => {
            session.on_instruction_refresh_due().await;
        }
        SessionEvent::ReconcileSettings(new_settings) => session.reconcile_settings(new_settings),
        SessionEvent::EndSession { reason } => {
            session.end_session(&reason).await;
        }
    }
}

async fn pump_playback_and_barge_in(session: &mut Session) {
    let now_ms = session.clock_now_ms();
    if let Some(action) = session.reply_lock_tick(now_ms) {
        session.apply_interruption(action).await;
    }

    let outcome = session.pump_playback_once().await;
    if let crate::playback::PumpOutcome::Idle = outcome {
        if !session.reply_lock_held() {
            session.close_bot_turn();
        }
    }
}

/// Build a human-readable summary of a membership transition, useful for a
/// caller wiring Discord voice-state updates into [`SessionEvent`].
pub fn membership_summary(kind: MembershipKind, speaker_id: &str) -> String {
    match kind {
        MembershipKind::Join => format!("{speaker_id} joined the voice channel"),
        MembershipKind::Leave => format!("{speaker_id} left the voice channel"),
    }
}

/// Log that a session was registered, for callers that want a single
/// tracing call site rather than reaching into `ActionLogEvent` directly.
pub fn log_registered(guild_id: &str) {
    info!(guild_id, "voice session registered with run loop");
    ActionLogEvent::VoiceRuntime { detail: format!("session registered: {guild_id}") }.log();
}
