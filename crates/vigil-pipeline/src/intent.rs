//! Keyword fallback intent classifier.
//!
//! When the external intent service fails, stage 4 falls back to a
//! keyword table with low confidence rather than propagating the error.
//! The table covers the spam categories the assistant handles, in both
//! Chinese and English, plus a coarse tone detector.

use crate::clients::{IntentClassifier, IntentContext};
use async_trait::async_trait;
use std::collections::BTreeMap;
use vigil_core::types::{EmotionalTone, Intent, IntentCategory};

/// Confidence assigned to keyword matches.
const KEYWORD_CONFIDENCE: f64 = 0.35;
/// Confidence assigned when nothing matches.
const UNKNOWN_CONFIDENCE: f64 = 0.1;

/// Category keyword table.
const CATEGORY_KEYWORDS: &[(IntentCategory, &[&str])] = &[
    (
        IntentCategory::LoanOffer,
        &["贷款", "借款", "利息", "额度", "loan", "credit", "borrow"],
    ),
    (
        IntentCategory::InvestmentPitch,
        &["投资", "理财", "股票", "基金", "收益", "invest", "stock", "returns"],
    ),
    (
        IntentCategory::InsuranceSales,
        &["保险", "保单", "理赔", "insurance", "policy", "coverage"],
    ),
    (
        IntentCategory::Survey,
        &["调查", "问卷", "调研", "survey", "questionnaire", "feedback"],
    ),
    (
        IntentCategory::Telemarketing,
        &["促销", "优惠", "活动", "免费", "promotion", "discount", "offer"],
    ),
    (
        IntentCategory::SalesCall,
        &["推销", "销售", "产品", "了解一下", "sales", "product", "purchase"],
    ),
];

/// Tone keyword table.
const TONE_KEYWORDS: &[(EmotionalTone, &[&str])] = &[
    (
        EmotionalTone::Aggressive,
        &["必须", "马上", "警告", "最后", "shut up", "listen to me", "warning"],
    ),
    (
        EmotionalTone::Urgent,
        &["紧急", "立刻", "今天", "过期", "urgent", "immediately", "expires"],
    ),
    (
        EmotionalTone::Persuasive,
        &["机会", "错过", "限时", "难得", "opportunity", "limited", "exclusive"],
    ),
    (
        EmotionalTone::Friendly,
        &["您好", "打扰", "朋友", "hello", "friend", "how are you"],
    ),
    (
        EmotionalTone::Confused,
        &["什么", "听不懂", "谁", "what", "confused", "who is this"],
    ),
];

/// Classify a transcript by keyword table.
#[must_use]
pub fn classify_by_keywords(text: &str) -> Intent {
    let lowered = text.to_lowercase();

    let mut category = IntentCategory::Unknown;
    let mut matched: Option<&str> = None;
    'outer: for (candidate, keywords) in CATEGORY_KEYWORDS {
        for keyword in *keywords {
            if lowered.contains(keyword) {
                category = *candidate;
                matched = Some(keyword);
                break 'outer;
            }
        }
    }

    let mut emotional_tone = EmotionalTone::Neutral;
    for (tone, keywords) in TONE_KEYWORDS {
        if keywords.iter().any(|k| lowered.contains(k)) {
            emotional_tone = *tone;
            break;
        }
    }

    let mut entities = BTreeMap::new();
    if let Some(keyword) = matched {
        entities.insert("keyword".to_string(), keyword.to_string());
    }

    let confidence = if category == IntentCategory::Unknown {
        UNKNOWN_CONFIDENCE
    } else {
        KEYWORD_CONFIDENCE
    };
    Intent {
        label: format!("keyword:{}", matched.unwrap_or("none")),
        confidence,
        category,
        emotional_tone,
        entities,
    }
}

/// The fallback classifier as a pluggable engine.
///
/// Usable directly as the primary classifier in deployments with no
/// external intent service.
pub struct KeywordIntentClassifier;

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(
        &self,
        text: &str,
        _context: &IntentContext,
    ) -> crate::clients::ClientResult<Intent> {
        Ok(classify_by_keywords(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sales_call_keywords() {
        let intent = classify_by_keywords("推销电话");
        assert_eq!(intent.category, IntentCategory::SalesCall);
        assert!(intent.confidence < 0.5);
        assert_eq!(intent.entities.get("keyword").unwrap(), "推销");
    }

    #[test]
    fn test_loan_keywords_in_english() {
        let intent = classify_by_keywords("We can offer you a personal LOAN today");
        assert_eq!(intent.category, IntentCategory::LoanOffer);
    }

    #[test]
    fn test_category_priority_is_table_order() {
        // Contains both loan and sales words; the loan row wins.
        let intent = classify_by_keywords("我们的贷款产品");
        assert_eq!(intent.category, IntentCategory::LoanOffer);
    }

    #[test]
    fn test_unknown_text() {
        let intent = classify_by_keywords("the weather is nice");
        assert_eq!(intent.category, IntentCategory::Unknown);
        assert!((intent.confidence - UNKNOWN_CONFIDENCE).abs() < f64::EPSILON);
        assert!(intent.entities.is_empty());
    }

    #[test]
    fn test_aggressive_tone() {
        let intent = classify_by_keywords("你必须马上买我们的保险");
        assert_eq!(intent.category, IntentCategory::InsuranceSales);
        assert_eq!(intent.emotional_tone, EmotionalTone::Aggressive);
    }

    #[test]
    fn test_urgent_tone_english() {
        let intent = classify_by_keywords("This offer expires today, act immediately!");
        assert_eq!(intent.emotional_tone, EmotionalTone::Urgent);
    }

    #[tokio::test]
    async fn test_classifier_trait_impl() {
        use crate::clients::IntentClassifier as _;
        let classifier = KeywordIntentClassifier;
        let intent = classifier
            .classify("投资理财产品", &IntentContext::default())
            .await
            .unwrap();
        assert_eq!(intent.category, IntentCategory::InvestmentPitch);
    }
}
