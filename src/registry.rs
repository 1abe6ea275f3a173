//! Session registry / Controller API
//!
//! The only entry point external code (the Discord bot layer) calls:
//! `request_join`, `request_leave`, `request_status`, `request_watch_stream`,
//! `request_stop_watching_stream`, `request_stream_watch_status`,
//! `ingest_stream_frame`, `reconcile_settings`, `stop_all`, `dispose`,
//! `get_session`, `get_runtime_state`. One guild, one session; the map is
//! the only place that enforces that invariant. Grounded on
//! `server::auth::AuthManager`'s session-map shape (`RwLock<HashMap<String,
//! SessionInfo>>`), swapped to a [`tokio::sync::RwLock`] since registry
//! calls need to `.await` while holding it (posting events, awaiting
//! teardown) rather than synchronous auth bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::action_log::ActionLogEvent;
use crate::clock::Clock;
use crate::error::VoiceCoreError;
use crate::session::{Session, SessionEvent, SessionHandles};
use crate::settings::VoiceSettings;
use crate::types::{RuntimeState, SessionMode, SessionSnapshot, SpeakerId};

/// Everything the registry needs to reach a running session: the event
/// sender the run loop selects on, the shared state for read-only snapshot
/// queries, and the task handle for awaiting teardown. Minimal
/// stream-watch bookkeeping (see DESIGN.md for the call's scope): a
/// per-guild toggle and a frame counter.
struct RegisteredSession {
    session: Arc<Mutex<Session>>,
    tx: UnboundedSender<SessionEvent>,
    handle: tokio::task::JoinHandle<()>,
    watching_stream: bool,
    stream_frames_seen: u64,
}

/// The per-guild session map: one guild, one session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, RegisteredSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `requestJoin`: construct and register a new session for a guild.
    /// Rejects a guild that already has one active.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_join(
        &self,
        guild_id: String,
        text_channel_id: String,
        voice_channel_id: String,
        mode: SessionMode,
        settings: VoiceSettings,
        clock: Arc<dyn Clock>,
        bot_display_name: &str,
        bot_aliases: &[String],
        handles: SessionHandles,
    ) -> Result<(), VoiceCoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&guild_id) {
            return Err(VoiceCoreError::SessionAlreadyExists(guild_id));
        }

        let (session, rx) =
            Session::new(guild_id.clone(), text_channel_id, voice_channel_id, mode, settings, clock, bot_display_name, bot_aliases, handles)?;
        let tx = session.tx.clone();
        let (session, handle) = crate::run_loop::spawn(session, rx);

        crate::run_loop::log_registered(&guild_id);
        sessions.insert(guild_id, RegisteredSession { session, tx, handle, watching_stream: false, stream_frames_seen: 0 });
        Ok(())
    }

    /// `requestLeave`: post a graceful `EndSession` and remove the entry
    /// once the run loop task exits, so a second `requestJoin` for the same
    /// guild can succeed immediately after.
    pub async fn request_leave(&self, guild_id: &str, reason: &str) -> Result<(), VoiceCoreError> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(guild_id)
        };
        let Some(entry) = entry else { return Err(VoiceCoreError::NoActiveSession(guild_id.to_string())) };
        let _ = entry.tx.send(SessionEvent::EndSession { reason: reason.to_string() });
        let _ = entry.handle.await;
        Ok(())
    }

    /// `requestStatus`: a read-only snapshot, or an error if the guild has
    /// no active session.
    pub async fn request_status(&self, guild_id: &str) -> Result<SessionSnapshot, VoiceCoreError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(guild_id).ok_or_else(|| VoiceCoreError::NoActiveSession(guild_id.to_string()))?;
        let session = entry.session.lock().await;
        Ok(session.snapshot())
    }

    /// `getSession`: same snapshot lookup, named to match the Controller
    /// API surface for callers that want it by that name.
    pub async fn get_session(&self, guild_id: &str) -> Option<SessionSnapshot> {
        self.request_status(guild_id).await.ok()
    }

    /// `getRuntimeState`: a snapshot of every active session, for an
    /// operator dashboard or a health check.
    pub async fn get_runtime_state(&self) -> RuntimeState {
        let sessions = self.sessions.read().await;
        let mut snapshots = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            let session = entry.session.lock().await;
            snapshots.push(session.snapshot());
        }
        crate::session::runtime_state(snapshots)
    }

    /// `requestWatchStream`: opt a guild's session into whatever
    /// frame-by-frame observation the caller wants (left intentionally
    /// thin; see DESIGN.md for the call's scope).
    pub async fn request_watch_stream(&self, guild_id: &str) -> Result<(), VoiceCoreError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(guild_id).ok_or_else(|| VoiceCoreError::NoActiveSession(guild_id.to_string()))?;
        entry.watching_stream = true;
        entry.stream_frames_seen = 0;
        ActionLogEvent::VoiceRuntime { detail: format!("guild {guild_id} started watching its own stream") }.log();
        Ok(())
    }

    pub async fn request_stop_watching_stream(&self, guild_id: &str) -> Result<(), VoiceCoreError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(guild_id).ok_or_else(|| VoiceCoreError::NoActiveSession(guild_id.to_string()))?;
        entry.watching_stream = false;
        Ok(())
    }

    /// `requestStreamWatchStatus`: whether watching is on, and how many
    /// frames have been observed since it was turned on.
    pub async fn request_stream_watch_status(&self, guild_id: &str) -> Result<(bool, u64), VoiceCoreError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(guild_id).ok_or_else(|| VoiceCoreError::NoActiveSession(guild_id.to_string()))?;
        Ok((entry.watching_stream, entry.stream_frames_seen))
    }

    /// `ingestStreamFrame`: count a frame toward the watch status if
    /// watching is on; a no-op otherwise (never errors — a frame arriving
    /// for a guild that stopped watching, or that never started, is
    /// expected under normal churn, not a caller bug).
    pub async fn ingest_stream_frame(&self, guild_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(guild_id) {
            if entry.watching_stream {
                entry.stream_frames_seen += 1;
            }
        }
    }

    /// `reconcileSettings`: push a new settings snapshot into a running
    /// session via its event channel, same path as any other inbound event
    /// — only the run loop ever mutates session state.
    pub async fn reconcile_settings(&self, guild_id: &str, settings: Arc<VoiceSettings>) -> Result<(), VoiceCoreError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(guild_id).ok_or_else(|| VoiceCoreError::NoActiveSession(guild_id.to_string()))?;
        let _ = entry.tx.send(SessionEvent::ReconcileSettings(settings));
        Ok(())
    }

    /// `stopAll`: end every active session with the same reason, waiting
    /// for each run loop to actually exit before returning.
    pub async fn stop_all(&self, reason: &str) {
        let entries: Vec<RegisteredSession> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        info!(count = entries.len(), reason, "stopping all voice sessions");
        for entry in entries {
            let _ = entry.tx.send(SessionEvent::EndSession { reason: reason.to_string() });
            let _ = entry.handle.await;
        }
    }

    /// `dispose`: alias for `stopAll` named to match the Controller API
    /// surface for callers tearing the whole registry down (e.g. on
    /// process shutdown) rather than ending sessions one at a time.
    pub async fn dispose(&self, reason: &str) {
        self.stop_all(reason).await;
    }

    /// Post an inbound transport event (speaking start/end, audio chunk,
    /// membership change, realtime event) into a guild's session, the path
    /// every bot-layer adapter feeds into the registry.
    pub async fn post_event(&self, guild_id: &str, event: SessionEvent) -> Result<(), VoiceCoreError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(guild_id).ok_or_else(|| VoiceCoreError::NoActiveSession(guild_id.to_string()))?;
        let _ = entry.tx.send(event);
        Ok(())
    }

    pub async fn active_guild_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
