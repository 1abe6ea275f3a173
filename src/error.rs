//! Crate error types
//!
//! Session-fatal and contract-violation errors use [`VoiceCoreError`].
//! Turn-level and reply-level failures (transcription, generation, synth)
//! are *not* represented here — per the error handling design they are
//! caught at the call site, logged, and turned into a dropped turn or a
//! recovery step, never propagated as a `Result` to the controller API.

use thiserror::Error;

/// Structured errors surfaced by the voice session core.
#[derive(Debug, Error)]
pub enum VoiceCoreError {
    /// A guild already has an active session; `requestJoin` is not
    /// re-entrant for a guild that already has one.
    #[error("guild {0} already has an active voice session")]
    SessionAlreadyExists(String),

    /// The operation targets a guild with no active session.
    #[error("guild {0} has no active voice session")]
    NoActiveSession(String),

    /// An operation was attempted on a session that has begun tearing down.
    #[error("session {0} is ending and no longer accepts new work")]
    SessionEnding(String),

    /// A configuration snapshot failed validation before it could be
    /// applied to a session.
    #[error("invalid voice settings: {0}")]
    InvalidSettings(String),

    /// An LLM-JSON contract (addressing classifier, reply decider, thought
    /// gate) returned output that could not be strictly parsed after all
    /// attempts. The raw response is retained for the action log.
    #[error("llm contract violation in {context}: {raw}")]
    LlmContractViolation { context: String, raw: String },

    /// The realtime client or transport reported a condition that the
    /// orchestrator treats as session-fatal (socket closed, connection lost).
    #[error("session-fatal transport error: {0}")]
    TransportFatal(String),
}
