//! Reply decision engine (module H)
//!
//! Ten ordered rules, first match wins. `decide` takes a single
//! [`DecisionInput`] snapshot assembled by the caller (a realtime or
//! STT-pipeline driver) so the rules themselves stay pure except for the
//! final LLM-JSON fallback.

use crate::collaborators::LanguageModel;
use crate::settings::{AddressingSettings, DecisionSettings};
use crate::types::{AddressingAnnotation, AddressingSource, TalkingTo};

/// Why an `Allow` was returned. Five of these move the focused-speaker
/// window forward (spec §4.H, final paragraph); the others do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    DirectAddressFastPath,
    FocusedSpeakerFollowup,
    BotRecentReplyFollowup,
    WakePingLowSignal,
    MergedModeDefault,
    LlmYes,
    LlmYesRetry,
}

impl AllowReason {
    pub fn updates_focused_speaker(self) -> bool {
        matches!(
            self,
            AllowReason::DirectAddressFastPath
                | AllowReason::FocusedSpeakerFollowup
                | AllowReason::BotRecentReplyFollowup
                | AllowReason::LlmYes
                | AllowReason::LlmYesRetry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AllowReason::DirectAddressFastPath => "direct_address_fast_path",
            AllowReason::FocusedSpeakerFollowup => "focused_speaker_followup",
            AllowReason::BotRecentReplyFollowup => "bot_recent_reply_followup",
            AllowReason::WakePingLowSignal => "wake_ping_low_signal",
            AllowReason::MergedModeDefault => "merged_mode_default",
            AllowReason::LlmYes => "llm_yes",
            AllowReason::LlmYesRetry => "llm_yes_retry",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyDecision {
    Allow { reason: AllowReason },
    Deny { reason: String },
    Defer { reason: String, retry_after_ms: u64 },
}

/// Everything the decision engine needs to evaluate one turn. Assembled by
/// the caller from session state; the engine itself holds nothing.
#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub transcript: String,
    pub reply_lock_held: bool,
    pub clip_duration_ms: u64,
    pub addressing: AddressingAnnotation,
    /// `None` if the bot has never replied this session.
    pub ms_since_assistant_reply: Option<u64>,
    pub same_focused_speaker: bool,
    pub ms_since_direct_address: Option<u64>,
    pub eagerness: u32,
    pub mode_merged_with_generation: bool,
    pub classifier_enabled: bool,
    pub participant_count: usize,
    pub ms_since_inbound_audio: u64,
}

fn is_direct_fast_path(addressing: &AddressingAnnotation) -> bool {
    matches!(addressing.talking_to, TalkingTo::Me)
        && matches!(addressing.source, AddressingSource::DeterministicWake | AddressingSource::DeterministicVocative)
}

fn is_wake_ping(addressing: &AddressingAnnotation) -> bool {
    matches!(addressing.source, AddressingSource::DeterministicWake)
}

/// Evaluate the ten ordered rules in spec §4.H. Only rule 10 suspends.
pub async fn decide(
    input: &DecisionInput,
    decision_settings: &DecisionSettings,
    addressing_settings: &AddressingSettings,
    llm: &dyn LanguageModel,
) -> ReplyDecision {
    // Rule 1: empty transcript.
    if input.transcript.trim().is_empty() {
        return ReplyDecision::Deny { reason: "missing_transcript".to_string() };
    }

    // Rule 2: reply lock held.
    if input.reply_lock_held {
        return ReplyDecision::Defer {
            reason: "bot_turn_open".to_string(),
            retry_after_ms: decision_settings.voice_thought_loop_busy_retry_ms,
        };
    }

    // Rule 3: low-signal fragment.
    let is_low_signal = input.transcript.trim().chars().count() <= decision_settings.low_signal_fragment_max_chars;
    if is_low_signal {
        if is_wake_ping(&input.addressing) {
            return ReplyDecision::Allow { reason: AllowReason::WakePingLowSignal };
        }
        let bot_just_replied = input
            .ms_since_assistant_reply
            .is_some_and(|ms| ms <= decision_settings.low_signal_post_reply_max_clip_ms);
        if input.clip_duration_ms <= decision_settings.low_signal_post_reply_max_clip_ms && bot_just_replied {
            return ReplyDecision::Deny { reason: "low_signal_recent_reply_clip".to_string() };
        }
        // Otherwise fall through: LLM eligibility may still permit it.
    }

    // Rule 4: focused-speaker followup.
    let addressed_elsewhere = matches!(input.addressing.talking_to, TalkingTo::Named(_));
    if input.same_focused_speaker && !addressed_elsewhere {
        if let Some(ms_since) = input.ms_since_direct_address {
            if ms_since < addressing_settings.focused_speaker_continuation_ms {
                return ReplyDecision::Allow { reason: AllowReason::FocusedSpeakerFollowup };
            }
        }
    }

    // Rule 5: bot just replied to the same focused speaker.
    if input.same_focused_speaker {
        if let Some(ms) = input.ms_since_assistant_reply {
            if ms <= decision_settings.low_signal_post_reply_max_clip_ms {
                return ReplyDecision::Allow { reason: AllowReason::BotRecentReplyFollowup };
            }
        }
    }

    // Rule 6: direct-addressed fast path.
    if is_direct_fast_path(&input.addressing) {
        return ReplyDecision::Allow { reason: AllowReason::DirectAddressFastPath };
    }

    // Rule 7: eagerness zero and not direct-addressed.
    if input.eagerness == 0 && !matches!(input.addressing.talking_to, TalkingTo::Me) {
        return ReplyDecision::Deny { reason: "eagerness_zero".to_string() };
    }

    // Rule 8: multi-party non-direct realtime merged mode silence window.
    if input.mode_merged_with_generation
        && input.participant_count > 1
        && !matches!(input.addressing.talking_to, TalkingTo::Me)
        && input.ms_since_inbound_audio < decision_settings.non_direct_reply_min_silence_ms
    {
        let retry_after_ms = decision_settings.non_direct_reply_min_silence_ms - input.ms_since_inbound_audio;
        return ReplyDecision::Defer { reason: "awaiting_non_direct_silence_window".to_string(), retry_after_ms };
    }

    // Rule 9: classifier disabled.
    if !input.classifier_enabled {
        return if input.mode_merged_with_generation {
            ReplyDecision::Allow { reason: AllowReason::MergedModeDefault }
        } else {
            ReplyDecision::Deny { reason: "classifier_disabled_non_merged_mode".to_string() }
        };
    }

    // Rule 10: LLM-JSON decider, up to `decision_llm_max_attempts` prompts
    // of decreasing size. First strictly-parseable `{decision: YES|NO}` wins.
    decide_via_llm(input, decision_settings, llm).await
}

#[derive(serde::Deserialize)]
struct LlmDecision {
    decision: String,
}

async fn decide_via_llm(input: &DecisionInput, settings: &DecisionSettings, llm: &dyn LanguageModel) -> ReplyDecision {
    for attempt in 0..settings.decision_llm_max_attempts {
        let prompt = decision_prompt(input, attempt);
        let raw = match llm.generate_json(&prompt).await {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        let Ok(parsed) = serde_json::from_str::<LlmDecision>(&raw) else { continue };
        match parsed.decision.as_str() {
            "YES" => {
                let reason = if attempt == 0 { AllowReason::LlmYes } else { AllowReason::LlmYesRetry };
                return ReplyDecision::Allow { reason };
            }
            "NO" => return ReplyDecision::Deny { reason: "llm_no".to_string() },
            _ => continue,
        }
    }
    ReplyDecision::Deny { reason: "llm_contract_violation".to_string() }
}

fn decision_prompt(input: &DecisionInput, attempt: u32) -> String {
    match attempt {
        0 => format!(
            "Full context decision: should the assistant reply to this voice utterance? \
             Participants: {}. Talking to: {:?}. Utterance: {:?}. \
             Respond with strict JSON {{\"decision\": \"YES\" | \"NO\"}}.",
            input.participant_count, input.addressing.talking_to, input.transcript
        ),
        1 => format!(
            "Should the assistant reply? Utterance: {:?}. JSON only: {{\"decision\": \"YES\" | \"NO\"}}.",
            input.transcript
        ),
        _ => "Reply? JSON: {\"decision\": \"YES\" | \"NO\"}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubLlm {
        response: String,
    }

    #[async_trait]
    impl LanguageModel for StubLlm {
        async fn generate(&self, _prompt: &str, _context: &[crate::types::VoiceTurn]) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn transcribe_audio(&self, _wav: &[u8], _model: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn synthesize_speech(&self, _text: &str, _voice: &str, _rate: u32) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn generate_json(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.response.clone())
        }
    }

    fn addressing(talking_to: TalkingTo, source: AddressingSource) -> AddressingAnnotation {
        AddressingAnnotation { talking_to, directed_confidence: 1.0, source, reason: "test".to_string() }
    }

    fn base_input() -> DecisionInput {
        DecisionInput {
            transcript: "what's the weather like".to_string(),
            reply_lock_held: false,
            clip_duration_ms: 1_500,
            addressing: addressing(TalkingTo::All, AddressingSource::Default),
            ms_since_assistant_reply: None,
            same_focused_speaker: false,
            ms_since_direct_address: None,
            eagerness: 50,
            mode_merged_with_generation: false,
            classifier_enabled: true,
            participant_count: 2,
            ms_since_inbound_audio: 10_000,
        }
    }

    #[tokio::test]
    async fn empty_transcript_is_denied() {
        let mut input = base_input();
        input.transcript = "   ".to_string();
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Deny { reason: "missing_transcript".to_string() });
    }

    #[tokio::test]
    async fn reply_lock_held_defers() {
        let mut input = base_input();
        input.reply_lock_held = true;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(
            decision,
            ReplyDecision::Defer { reason: "bot_turn_open".to_string(), retry_after_ms: decision_settings.voice_thought_loop_busy_retry_ms }
        );
    }

    #[tokio::test]
    async fn wake_ping_low_signal_allows() {
        let mut input = base_input();
        input.transcript = "hey".to_string();
        input.addressing = addressing(TalkingTo::Me, AddressingSource::DeterministicWake);
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Allow { reason: AllowReason::WakePingLowSignal });
    }

    #[tokio::test]
    async fn low_signal_clip_denied_right_after_bot_reply() {
        let mut input = base_input();
        input.transcript = "yeah".to_string();
        input.clip_duration_ms = 300;
        input.ms_since_assistant_reply = Some(200);
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Deny { reason: "low_signal_recent_reply_clip".to_string() });
    }

    #[tokio::test]
    async fn direct_address_fast_path_allows() {
        let mut input = base_input();
        input.addressing = addressing(TalkingTo::Me, AddressingSource::DeterministicVocative);
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Allow { reason: AllowReason::DirectAddressFastPath });
    }

    #[tokio::test]
    async fn zero_eagerness_denies_non_direct() {
        let mut input = base_input();
        input.eagerness = 0;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Deny { reason: "eagerness_zero".to_string() });
    }

    #[tokio::test]
    async fn non_direct_merged_mode_defers_during_silence_window() {
        let mut input = base_input();
        input.mode_merged_with_generation = true;
        input.ms_since_inbound_audio = 100;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(
            decision,
            ReplyDecision::Defer {
                reason: "awaiting_non_direct_silence_window".to_string(),
                retry_after_ms: decision_settings.non_direct_reply_min_silence_ms - 100
            }
        );
    }

    #[tokio::test]
    async fn classifier_disabled_merged_mode_allows_by_default() {
        let mut input = base_input();
        input.classifier_enabled = false;
        input.mode_merged_with_generation = true;
        input.ms_since_inbound_audio = 999_999;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Allow { reason: AllowReason::MergedModeDefault });
    }

    #[tokio::test]
    async fn classifier_disabled_non_merged_mode_denies() {
        let mut input = base_input();
        input.classifier_enabled = false;
        input.ms_since_inbound_audio = 999_999;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: String::new() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Deny { reason: "classifier_disabled_non_merged_mode".to_string() });
    }

    #[tokio::test]
    async fn llm_yes_allows_on_first_attempt() {
        let mut input = base_input();
        input.ms_since_inbound_audio = 999_999;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: r#"{"decision":"YES"}"#.to_string() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Allow { reason: AllowReason::LlmYes });
    }

    #[tokio::test]
    async fn llm_contract_violation_on_unparseable_response() {
        let mut input = base_input();
        input.ms_since_inbound_audio = 999_999;
        let decision_settings = DecisionSettings::default();
        let addressing_settings = AddressingSettings::default();
        let llm = StubLlm { response: "not json at all".to_string() };
        let decision = decide(&input, &decision_settings, &addressing_settings, &llm).await;
        assert_eq!(decision, ReplyDecision::Deny { reason: "llm_contract_violation".to_string() });
    }

    #[test]
    fn allow_reason_focused_speaker_set_updates_window() {
        assert!(AllowReason::DirectAddressFastPath.updates_focused_speaker());
        assert!(AllowReason::LlmYesRetry.updates_focused_speaker());
        assert!(!AllowReason::WakePingLowSignal.updates_focused_speaker());
        assert!(!AllowReason::MergedModeDefault.updates_focused_speaker());
    }
}
