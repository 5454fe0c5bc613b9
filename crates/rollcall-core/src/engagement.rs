//! Affective-state labels and the engagement index derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Baseline used when an attendance event is committed.
pub const COMMIT_ENGAGEMENT_BASE: i32 = 50;

/// Coarse affective state returned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    #[serde(rename = "Afeto Positivo")]
    PositiveAffect,
    #[serde(rename = "Baixa Valência")]
    LowValence,
    #[serde(rename = "Alta Excitação")]
    HighArousal,
    #[serde(rename = "Baixa Excitação")]
    LowArousal,
    #[serde(rename = "Neutro")]
    Neutral,
    /// No classification has resolved yet for this session.
    #[serde(rename = "Analisando...")]
    Analyzing,
}

impl EmotionLabel {
    /// Labels a classifier may answer with.
    pub const CLASSIFIABLE: [EmotionLabel; 5] = [
        EmotionLabel::PositiveAffect,
        EmotionLabel::LowValence,
        EmotionLabel::HighArousal,
        EmotionLabel::LowArousal,
        EmotionLabel::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::PositiveAffect => "Afeto Positivo",
            EmotionLabel::LowValence => "Baixa Valência",
            EmotionLabel::HighArousal => "Alta Excitação",
            EmotionLabel::LowArousal => "Baixa Excitação",
            EmotionLabel::Neutral => "Neutro",
            EmotionLabel::Analyzing => "Analisando...",
        }
    }

    /// Parse a stored or classifier-supplied label.
    ///
    /// Surrounding whitespace and quotes are ignored, matching is
    /// case-insensitive. Returns `None` for anything outside the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned = raw
            .trim()
            .trim_matches(|c| c == '\'' || c == '"' || c == '.' || c == '*')
            .trim()
            .to_lowercase();
        EmotionLabel::CLASSIFIABLE
            .into_iter()
            .chain([EmotionLabel::Analyzing])
            .find(|label| label.as_str().trim_end_matches('.').to_lowercase() == cleaned)
    }

    /// Signed engagement modifier for this label.
    pub fn modifier(&self) -> i32 {
        match self {
            EmotionLabel::PositiveAffect => 20,
            EmotionLabel::LowValence => -20,
            EmotionLabel::HighArousal => -15,
            EmotionLabel::LowArousal => -25,
            EmotionLabel::Neutral | EmotionLabel::Analyzing => 0,
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modifier for a free-form label; anything unrecognised counts as 0.
pub fn modifier_for_label(raw: &str) -> i32 {
    EmotionLabel::parse(raw).map(|l| l.modifier()).unwrap_or(0)
}

/// `clamp(base + modifier(label), 0, 100)`.
pub fn engagement_index(base: i32, label: EmotionLabel) -> u8 {
    base.saturating_add(label.modifier()).clamp(0, 100) as u8
}
