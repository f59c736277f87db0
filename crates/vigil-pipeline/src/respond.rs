//! Response planning: escalation ladder and reply post-processing.
//!
//! The external generator only phrases text; strategy selection is core
//! logic. Persistence escalates the posture: polite declines first, a
//! firm rejection once the caller pushes past the configured count, and
//! termination once the call has gone on too long, the caller keeps
//! pushing, or turns aggressive.

use crate::clients::{PersonalityProfile, PersonalityStyle};
use vigil_core::config::PipelineConfig;
use vigil_core::types::{EmotionalTone, Response, ResponseStrategy};

/// Maximum reply length in characters after post-processing.
pub const MAX_RESPONSE_CHARS: usize = 50;

/// Role prefixes stripped from generated text.
const ROLE_PREFIXES: &[&str] = &[
    "ai:",
    "assistant:",
    "bot:",
    "response:",
    "reply:",
    "助手：",
    "助手:",
    "助理：",
    "回复：",
];

/// Phrases that mark a reply as call-ending regardless of strategy.
const TERMINATION_KEYWORDS: &[&str] = &[
    "再见",
    "挂断",
    "不要再打",
    "goodbye",
    "hang up",
    "do not call",
];

/// Confidence for generator-produced replies.
const GENERATED_CONFIDENCE: f64 = 0.8;
/// Confidence for canned fallback replies.
const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Strategy selection and reply assembly.
#[derive(Debug, Clone)]
pub struct ResponsePlanner {
    firm_after: u32,
    terminate_after: u32,
    terminate_after_ms: u64,
}

impl ResponsePlanner {
    /// Build a planner from the pipeline configuration.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            firm_after: config.firm_rejection_after,
            terminate_after: config.termination_after,
            terminate_after_ms: config.termination_after_ms,
        }
    }

    /// Select the posture for the current message.
    ///
    /// `message_count` counts this message too (1-based). The ladder:
    /// polite declines through `firm_after` messages, firm rejection
    /// beyond that, termination at `terminate_after` messages, excessive
    /// duration, or an aggressive caller.
    #[must_use]
    pub fn select_strategy(
        &self,
        message_count: u32,
        call_duration_ms: u64,
        tone: EmotionalTone,
    ) -> ResponseStrategy {
        if message_count >= self.terminate_after
            || call_duration_ms >= self.terminate_after_ms
            || tone == EmotionalTone::Aggressive
        {
            ResponseStrategy::CallTermination
        } else if message_count > self.firm_after {
            ResponseStrategy::FirmRejection
        } else {
            ResponseStrategy::PoliteDecline
        }
    }

    /// Canned reply for a strategy when the generator is unavailable.
    #[must_use]
    pub fn fallback_text(
        &self,
        strategy: ResponseStrategy,
        personality: &PersonalityProfile,
    ) -> &'static str {
        match (strategy, personality.style) {
            (ResponseStrategy::CallTermination, _) => "请不要再打这个电话，再见。",
            (ResponseStrategy::FirmRejection, _) => "我说过了，不需要，请不要再打来。",
            (ResponseStrategy::HumorDeflection, _) | (_, PersonalityStyle::Humorous) => {
                "我考虑一下，大概下辈子吧。"
            }
            (_, PersonalityStyle::Direct) => "不需要，谢谢。",
            _ => "不好意思，我们不需要这项服务，谢谢。",
        }
    }

    /// Assemble the final response from generator output (or the canned
    /// fallback), applying post-processing and the termination rule.
    #[must_use]
    pub fn build_response(
        &self,
        strategy: ResponseStrategy,
        generated: Option<String>,
        personality: &PersonalityProfile,
    ) -> Response {
        let (raw, confidence) = match generated {
            Some(text) => (text, GENERATED_CONFIDENCE),
            None => (
                self.fallback_text(strategy, personality).to_string(),
                FALLBACK_CONFIDENCE,
            ),
        };
        let text = post_process(&raw);
        let should_terminate =
            strategy == ResponseStrategy::CallTermination || contains_termination_keyword(&text);
        Response {
            text,
            should_terminate,
            confidence,
            strategy,
            response_audio: None,
        }
    }
}

/// Strip role prefixes, collapse whitespace, truncate to
/// [`MAX_RESPONSE_CHARS`] characters.
#[must_use]
pub fn post_process(text: &str) -> String {
    let mut trimmed = text.trim();
    let lowered = trimmed.to_lowercase();
    for prefix in ROLE_PREFIXES {
        if lowered.starts_with(prefix) {
            trimmed = trimmed[prefix.len()..].trim_start();
            break;
        }
    }
    let collapsed: String = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_RESPONSE_CHARS).collect()
}

/// Whether the text contains a call-ending phrase.
#[must_use]
pub fn contains_termination_keyword(text: &str) -> bool {
    let lowered = text.to_lowercase();
    TERMINATION_KEYWORDS.iter().any(|k| lowered.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> ResponsePlanner {
        ResponsePlanner::from_config(&PipelineConfig::default())
    }

    #[test]
    fn test_escalation_progression() {
        // Five persistent messages: three polite, one firm, then hang up.
        let planner = planner();
        let strategies: Vec<ResponseStrategy> = (1..=5)
            .map(|count| planner.select_strategy(count, 10_000, EmotionalTone::Neutral))
            .collect();
        assert_eq!(
            strategies,
            vec![
                ResponseStrategy::PoliteDecline,
                ResponseStrategy::PoliteDecline,
                ResponseStrategy::PoliteDecline,
                ResponseStrategy::FirmRejection,
                ResponseStrategy::CallTermination,
            ]
        );
    }

    #[test]
    fn test_duration_triggers_termination() {
        let planner = planner();
        assert_eq!(
            planner.select_strategy(1, 120_000, EmotionalTone::Neutral),
            ResponseStrategy::CallTermination
        );
    }

    #[test]
    fn test_aggressive_tone_triggers_termination() {
        let planner = planner();
        assert_eq!(
            planner.select_strategy(1, 1_000, EmotionalTone::Aggressive),
            ResponseStrategy::CallTermination
        );
    }

    #[test]
    fn test_post_process_strips_role_prefix() {
        assert_eq!(post_process("Assistant: 不需要，谢谢"), "不需要，谢谢");
        assert_eq!(post_process("AI:   no thanks"), "no thanks");
        assert_eq!(post_process("助手：不用了"), "不用了");
    }

    #[test]
    fn test_post_process_collapses_whitespace() {
        assert_eq!(post_process("  no \n thanks,   bye  "), "no thanks, bye");
    }

    #[test]
    fn test_post_process_truncates_by_chars() {
        let long = "很".repeat(80);
        let processed = post_process(&long);
        assert_eq!(processed.chars().count(), MAX_RESPONSE_CHARS);
    }

    #[test]
    fn test_termination_keywords() {
        assert!(contains_termination_keyword("好了再见"));
        assert!(contains_termination_keyword("I will hang up now"));
        assert!(!contains_termination_keyword("请继续说"));
    }

    #[test]
    fn test_build_response_from_generator() {
        let planner = planner();
        let response = planner.build_response(
            ResponseStrategy::PoliteDecline,
            Some("Assistant: 不好意思，不需要".to_string()),
            &PersonalityProfile::default(),
        );
        assert_eq!(response.text, "不好意思，不需要");
        assert!(!response.should_terminate);
        assert!(response.confidence > 0.5);
        assert_eq!(response.strategy, ResponseStrategy::PoliteDecline);
    }

    #[test]
    fn test_build_response_fallback() {
        let planner = planner();
        let response = planner.build_response(
            ResponseStrategy::FirmRejection,
            None,
            &PersonalityProfile::default(),
        );
        assert!(!response.text.is_empty());
        assert!(response.confidence < 0.5);
    }

    #[test]
    fn test_termination_strategy_sets_flag() {
        let planner = planner();
        let response = planner.build_response(
            ResponseStrategy::CallTermination,
            None,
            &PersonalityProfile::default(),
        );
        assert!(response.should_terminate);
        assert!(response.text.chars().count() <= MAX_RESPONSE_CHARS);
    }

    #[test]
    fn test_keyword_sets_flag_even_when_polite() {
        let planner = planner();
        let response = planner.build_response(
            ResponseStrategy::PoliteDecline,
            Some("好的，再见".to_string()),
            &PersonalityProfile::default(),
        );
        assert!(response.should_terminate);
    }
}
