//! Per-guild voice session runtime: capture gating, turn queues,
//! addressing, reply decisions, and realtime/STT reply drivers for live
//! multi-party Discord voice chat with an LLM.
//!
//! A guild's voice session is one [`session::Session`], driven end to end
//! by a single [`run_loop`] task (spec §5's "one logical task per
//! session"). External callers — a Discord gateway adapter, a bot command
//! handler — only ever go through [`registry::SessionRegistry`], the
//! Controller API spec §6 describes.
//!
//! # Example
//!
//! ```ignore
//! use voice_session_core::registry::SessionRegistry;
//! use voice_session_core::settings::VoiceSettings;
//! use voice_session_core::types::SessionMode;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = SessionRegistry::new();
//!     // registry.request_join(guild_id, text_channel_id, voice_channel_id,
//!     //     SessionMode::OpenAiRealtime, VoiceSettings::default(), clock,
//!     //     "Nova", &[], handles).await?;
//!     Ok(())
//! }
//! ```

pub mod action_log;
pub mod addressing;
pub mod capture;
pub mod clock;
pub mod codec;
pub mod collaborators;
pub mod decision;
pub mod error;
pub mod gates;
pub mod playback;
pub mod realtime_driver;
pub mod registry;
pub mod reply_lock;
pub mod run_loop;
pub mod session;
pub mod settings;
pub mod stt_driver;
pub mod thought_loop;
pub mod timer;
pub mod turns;
pub mod types;

pub use error::VoiceCoreError;
pub use registry::SessionRegistry;
pub use session::{Session, SessionEvent, SessionHandles};
pub use settings::VoiceSettings;
pub use types::{RuntimeState, SessionMode, SessionSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
