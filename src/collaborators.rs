//! External collaborator contracts
//!
//! The Discord voice transport, the realtime WebSocket client, and the LLM
//! provider clients are implemented elsewhere; this crate only depends on
//! their contracts. Every inbound event that those collaborators would
//! otherwise hand over as a loosely-typed map is parsed once into a tagged
//! variant here instead of touching a duck-typed payload at every call
//! site, matching the pattern of typed `async_trait` ports in
//! `messaging::mod` and the `VoicePipelinePort` trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VoiceCoreError;

/// Sink for outbound PCM destined for the Discord connection.
/// Implementations own the connection handle; this crate only ever calls
/// through the trait.
#[async_trait]
pub trait TransportSink: Send + Sync {
    /// Write one chunk of interleaved stereo16 PCM at 48kHz. Returns `false`
    /// on backpressure.
    async fn write_pcm(&self, frame: &[u8]) -> bool;

    /// Tear down the sink (e.g. on barge-in or session end).
    async fn destroy(&self);
}

/// Realtime streaming model client contract.
#[async_trait]
pub trait RealtimeClient: Send + Sync {
    async fn append_input_audio_pcm(&self, bytes: &[u8]) -> anyhow::Result<()>;
    async fn commit_input_audio_buffer(&self) -> anyhow::Result<()>;
    async fn create_audio_response(&self) -> anyhow::Result<()>;
    async fn request_text_utterance(&self, prompt: &str) -> anyhow::Result<()>;
    async fn update_instructions(&self, instructions: &str) -> anyhow::Result<()>;
    async fn cancel_active_response(&self) -> anyhow::Result<()>;
    async fn is_response_in_progress(&self) -> bool;
    async fn close(&self) -> anyhow::Result<()>;
}

/// Inbound events emitted by a [`RealtimeClient`]. Parsed once at the
/// transport boundary into this tagged enum; internal code never touches
/// a duck-typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "audio_delta")]
    AudioDelta { base64: String },
    #[serde(rename = "transcript")]
    Transcript { text: String, event_type: TranscriptEventType },
    #[serde(rename = "response_done")]
    ResponseDone { id: String, status: String, model: Option<String>, usage: Option<ResponseUsage> },
    #[serde(rename = "error_event")]
    ErrorEvent { code: String, message: String, param: Option<String>, last_outbound: Option<String> },
    #[serde(rename = "socket_closed")]
    SocketClosed { code: u16, reason: String },
    #[serde(rename = "socket_error")]
    SocketError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptEventType {
    Partial,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Decode a base64 `audio_delta` payload into raw PCM bytes.
pub fn decode_audio_delta(base64_payload: &str) -> Result<Vec<u8>, VoiceCoreError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(base64_payload)
        .map_err(|e| VoiceCoreError::TransportFatal(format!("malformed audio_delta: {e}")))
}

/// Codes the realtime client may report that the orchestrator treats as
/// recoverable (retry the current reply) rather than session-fatal.
pub fn is_recoverable_realtime_error_code(code: &str) -> bool {
    matches!(code, "rate_limit_exceeded" | "server_error" | "response_cancel_not_active" | "input_audio_buffer_commit_empty")
}

/// Contract for the LLM provider clients this core depends on: `generate`,
/// `transcribeAudio`, `synthesizeSpeech`.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-form text generation for the STT-pipeline brain and the
    /// thought loop.
    async fn generate(&self, prompt: &str, context: &[crate::types::VoiceTurn]) -> anyhow::Result<String>;

    /// Transcribe a WAV-framed PCM clip with the named model. Empty string
    /// on no detected speech, per the "ASR empty transcript" transient
    /// error category.
    async fn transcribe_audio(&self, wav_bytes: &[u8], model: &str) -> anyhow::Result<String>;

    /// Synthesize speech for `text`, returning mono16 PCM at `sample_rate_hz`.
    async fn synthesize_speech(&self, text: &str, voice: &str, sample_rate_hz: u32) -> anyhow::Result<Vec<u8>>;

    /// Strict JSON-contract call used by the addressing classifier, the
    /// reply decision engine, and the thought-loop gate. Implementations
    /// must return the raw text; callers parse strictly and never
    /// heuristically repair it.
    async fn generate_json(&self, prompt: &str) -> anyhow::Result<String>;
}
