//! Addressing classifier (module G)
//!
//! Decides who a transcribed user turn was talking to: the bot, the room
//! at large, or another named participant. Two deterministic fast paths
//! (a configured wake phrase, or the bot's name used as a vocative) are
//! tried before falling back to an LLM classifier call, the same
//! cheap-check-before-model-call shape the teacher's `security::prompt`
//! module uses for its regex pre-filters ahead of a model-based check.

use regex::Regex;

use crate::collaborators::LanguageModel;
use crate::error::VoiceCoreError;
use crate::settings::AddressingSettings;
use crate::types::{AddressingAnnotation, AddressingSource, SpeakerId, TalkingTo};

/// Tracks the most recent turn(s) confidently directed at the bot, so a
/// short run of unaddressed follow-up turns from the same speaker (or, for
/// a shorter window, any speaker) still resolves to the bot without
/// re-invoking the wake phrase every time.
#[derive(Debug, Clone, Default)]
pub struct EngagementContext {
    last_direct_speaker: Option<SpeakerId>,
    last_direct_at_ms: Option<u64>,
    last_wake_at_ms: Option<u64>,
}

impl EngagementContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_direct(&mut self, speaker_id: &str, now_ms: u64, was_wake: bool) {
        self.last_direct_speaker = Some(speaker_id.to_string());
        self.last_direct_at_ms = Some(now_ms);
        if was_wake {
            self.last_wake_at_ms = Some(now_ms);
        }
    }

    pub fn last_direct_speaker_id(&self) -> Option<&SpeakerId> {
        self.last_direct_speaker.as_ref()
    }

    pub fn last_direct_at_ms(&self) -> Option<u64> {
        self.last_direct_at_ms
    }
}

/// Compiled deterministic fast paths for one bot identity.
pub struct AddressingClassifier {
    wake_phrase_re: Regex,
    vocative_re: Regex,
    name_cue_re: Regex,
}

impl AddressingClassifier {
    /// `bot_display_name` and any `aliases` are matched case-insensitively
    /// as whole words, both as a wake prefix ("hey <name>, ...") and as a
    /// trailing vocative ("... right, <name>?").
    pub fn new(bot_display_name: &str, aliases: &[String]) -> Result<Self, VoiceCoreError> {
        let mut names = vec![regex::escape(bot_display_name)];
        names.extend(aliases.iter().map(|a| regex::escape(a)));
        let alternation = names.join("|");

        let wake_pattern = format!(r"(?i)^\s*(hey|hi|ok|okay)?\s*\b({alternation})\b[,!.]?\s+");
        let vocative_pattern = format!(r"(?i)[,]\s*\b({alternation})\b\s*[?!.]?\s*$");
        let name_cue_pattern = format!(r"(?i)\b({alternation})\b");

        let wake_phrase_re = Regex::new(&wake_pattern)
            .map_err(|e| VoiceCoreError::InvalidSettings(format!("bad wake phrase pattern: {e}")))?;
        let vocative_re = Regex::new(&vocative_pattern)
            .map_err(|e| VoiceCoreError::InvalidSettings(format!("bad vocative pattern: {e}")))?;
        let name_cue_re = Regex::new(&name_cue_pattern)
            .map_err(|e| VoiceCoreError::InvalidSettings(format!("bad name cue pattern: {e}")))?;

        Ok(Self { wake_phrase_re, vocative_re, name_cue_re })
    }

    fn classify_deterministic(&self, text: &str) -> Option<AddressingAnnotation> {
        if self.wake_phrase_re.is_match(text) {
            return Some(AddressingAnnotation {
                talking_to: TalkingTo::Me,
                directed_confidence: 1.0,
                source: AddressingSource::DeterministicWake,
                reason: "wake phrase".to_string(),
            });
        }
        if self.vocative_re.is_match(text) {
            return Some(AddressingAnnotation {
                talking_to: TalkingTo::Me,
                directed_confidence: 0.9,
                source: AddressingSource::DeterministicVocative,
                reason: "trailing vocative".to_string(),
            });
        }
        None
    }

    /// Deterministic fast path for "`<other-name>, do X`": a leading
    /// vocative naming one of the other participants in the channel. Tried
    /// ahead of the name-cue/LLM path so a turn clearly aimed at a fellow
    /// human never needs a model call to be ruled out as directed at the
    /// bot (spec §4.G).
    fn classify_other_participant_vocative(&self, text: &str, other_names: &[String]) -> Option<AddressingAnnotation> {
        let trimmed = text.trim_start();
        for name in other_names {
            if name.is_empty() {
                continue;
            }
            let pattern = format!(r"(?i)^\s*\b{}\b\s*[,]\s*\S", regex::escape(name));
            let Ok(re) = Regex::new(&pattern) else { continue };
            if re.is_match(trimmed) {
                return Some(AddressingAnnotation {
                    talking_to: TalkingTo::Named(name.clone()),
                    directed_confidence: 1.0,
                    source: AddressingSource::DeterministicVocative,
                    reason: format!("leading vocative to {name}"),
                });
            }
        }
        None
    }

    /// Full classification: deterministic fast paths, then engagement
    /// continuation, then an LLM fallback. Updates `engagement` in place
    /// whenever the turn resolves to the bot.
    pub async fn classify(
        &self,
        speaker_id: &str,
        text: &str,
        engagement: &mut EngagementContext,
        now_ms: u64,
        settings: &AddressingSettings,
        llm: &dyn LanguageModel,
        other_participant_names: &[String],
    ) -> AddressingAnnotation {
        if let Some(annotation) = self.classify_deterministic(text) {
            let was_wake = annotation.source == AddressingSource::DeterministicWake;
            engagement.record_direct(speaker_id, now_ms, was_wake);
            return annotation;
        }

        // A turn aimed at another participant by name is never directed at
        // the bot; resolve it deterministically without touching engagement
        // state or calling the classifier.
        if let Some(annotation) = self.classify_other_participant_vocative(text, other_participant_names) {
            return annotation;
        }

        if let Some(last_speaker) = &engagement.last_direct_speaker {
            if last_speaker == speaker_id {
                if let Some(last_at) = engagement.last_direct_at_ms {
                    if now_ms.saturating_sub(last_at) < settings.focused_speaker_continuation_ms {
                        engagement.record_direct(speaker_id, now_ms, false);
                        return AddressingAnnotation {
                            talking_to: TalkingTo::Me,
                            directed_confidence: settings.direct_address_confidence_threshold,
                            source: AddressingSource::Default,
                            reason: "focused speaker continuation".to_string(),
                        };
                    }
                }
            }
        }

        if let Some(last_wake_at) = engagement.last_wake_at_ms {
            if now_ms.saturating_sub(last_wake_at) < settings.direct_address_cross_speaker_wake_ms {
                engagement.record_direct(speaker_id, now_ms, false);
                return AddressingAnnotation {
                    talking_to: TalkingTo::Me,
                    directed_confidence: settings.direct_address_confidence_threshold,
                    source: AddressingSource::Default,
                    reason: "cross-speaker wake window".to_string(),
                };
            }
        }

        // Spec §4.G: "The classifier is skipped when deterministic or when
        // no name cue is present." A name cue that slipped past both
        // deterministic patterns (e.g. the bot's name used mid-sentence,
        // neither a leading wake phrase nor a trailing vocative) still
        // warrants a model call; bare text with no mention of the bot at
        // all does not.
        if !self.name_cue_re.is_match(text) {
            return Self::default_to_all();
        }

        self.classify_with_model(text, llm).await
    }

    async fn classify_with_model(&self, text: &str, llm: &dyn LanguageModel) -> AddressingAnnotation {
        let prompt = format!(
            "Classify who this voice chat utterance is directed at. Respond with strict JSON \
             {{\"talking_to\": \"me\" | \"all\" | \"<participant name>\", \"confidence\": 0.0-1.0}}. \
             Utterance: {text:?}"
        );

        let raw = match llm.generate_json(&prompt).await {
            Ok(raw) => raw,
            Err(_) => return Self::default_to_all(),
        };

        #[derive(serde::Deserialize)]
        struct Parsed {
            talking_to: String,
            confidence: f32,
        }

        let parsed: Parsed = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(_) => return Self::default_to_all(),
        };

        let talking_to = match parsed.talking_to.as_str() {
            "me" => TalkingTo::Me,
            "all" => TalkingTo::All,
            other => TalkingTo::Named(other.to_string()),
        };

        let directed_confidence = parsed.confidence.clamp(0.0, 1.0);

        AddressingAnnotation {
            talking_to,
            directed_confidence,
            source: AddressingSource::Classifier,
            reason: "model classification".to_string(),
        }
    }

    fn default_to_all() -> AddressingAnnotation {
        AddressingAnnotation {
            talking_to: TalkingTo::All,
            directed_confidence: 0.0,
            source: AddressingSource::Default,
            reason: "classifier unavailable or malformed response".to_string(),
        }
    }
}
