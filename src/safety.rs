//! Risk-phrase detection on inbound user messages.
//!
//! The classifier is a single case-insensitive substring pass with no external
//! calls. What happens on a hit is decided by the [`HighRiskHook`] injected
//! into the pipeline, not by the classifier.

use async_trait::async_trait;

/// Italian phrases the product shipped with, plus English equivalents.
pub const DEFAULT_RISK_KEYWORDS: &[&str] = &[
    "suicidio",
    "suicidarmi",
    "voglio morire",
    "uccidermi",
    "togliermi la vita",
    "farla finita",
    "ammazzarmi",
    "non voglio più vivere",
    "autolesionismo",
    "tagliarmi",
    "farmi del male",
    "uccidere",
    "ammazzare",
    "fare del male a",
    "violenza",
    "picchiare",
    "aggredire",
    "vorrei sparire",
    "vorrei scomparire",
    "non ce la faccio più",
    "mi faccio schifo",
    "non merito di vivere",
    "meglio se non ci fossi",
    "sarebbe meglio senza di me",
    "non ha più senso",
    "non vedo via d'uscita",
    "voglio che finisca tutto",
    "non riesco più ad andare avanti",
    "suicide",
    "kill myself",
    "want to die",
    "end my life",
    "self-harm",
    "hurt myself",
    "cut myself",
    "better off without me",
    "no way out",
];

#[derive(Debug, Clone)]
pub struct SafetyClassifier {
    keywords: Vec<String>,
}

impl Default for SafetyClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RISK_KEYWORDS.iter().copied())
    }
}

impl SafetyClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    /// First configured phrase found in `text`, if any.
    pub fn first_match(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(String::as_str)
    }

    pub fn is_high_risk(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }
}

/// Extension point for alerting a human operator about a risk disclosure.
#[async_trait]
pub trait HighRiskHook: Send + Sync {
    async fn on_high_risk(&self, user_id: &str, text: &str);
}

/// Records the event without the message content.
pub struct LogOnlyHook;

#[async_trait]
impl HighRiskHook for LogOnlyHook {
    async fn on_high_risk(&self, user_id: &str, text: &str) {
        tracing::warn!(
            "High-risk message from user {} ({} chars); operator alerting is disabled",
            user_id,
            text.chars().count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_phrases_case_insensitively() {
        let classifier = SafetyClassifier::default();
        assert!(classifier.is_high_risk("A volte penso: VOGLIO MORIRE."));
        assert!(classifier.is_high_risk("Non Ce La Faccio Più, davvero"));
        assert!(classifier.is_high_risk("Sometimes I want to die"));
        assert!(!classifier.is_high_risk("Ciao, oggi mi sento in pace"));
    }

    #[test]
    fn custom_list_replaces_default() {
        let classifier = SafetyClassifier::new(["  Crisis ", ""]);
        assert_eq!(classifier.keyword_count(), 1);
        assert_eq!(classifier.first_match("a CRISIS moment"), Some("crisis"));
        assert!(!classifier.is_high_risk("voglio morire"));
    }

    #[test]
    fn empty_text_is_not_risky() {
        assert!(!SafetyClassifier::default().is_high_risk(""));
    }
}
