//! Emotion labels and classified samples

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Closed set of emotion labels
///
/// Variants are declared in alphabetical order so the derived `Ord` matches the
/// alphabetical tie-break used by the voting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Anger,
    Disgust,
    Fear,
    Joy,
    Neutral,
    Sadness,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Anger,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Joy,
        Emotion::Neutral,
        Emotion::Sadness,
        Emotion::Surprise,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Anger => "anger",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Joy => "joy",
            Emotion::Neutral => "neutral",
            Emotion::Sadness => "sadness",
            Emotion::Surprise => "surprise",
        }
    }

    /// Fixed intensity weight used by the intensity-based votes
    pub fn intensity_weight(self) -> f64 {
        match self {
            Emotion::Anger => 0.95,
            Emotion::Fear => 0.90,
            Emotion::Disgust => 0.85,
            Emotion::Joy => 0.80,
            Emotion::Sadness => 0.70,
            Emotion::Surprise => 0.60,
            Emotion::Neutral => 0.30,
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anger" => Ok(Emotion::Anger),
            "disgust" => Ok(Emotion::Disgust),
            "fear" => Ok(Emotion::Fear),
            "joy" => Ok(Emotion::Joy),
            "neutral" => Ok(Emotion::Neutral),
            "sadness" => Ok(Emotion::Sadness),
            "surprise" => Ok(Emotion::Surprise),
            other => Err(PipelineError::Permanent(format!("Unknown emotion label '{}'", other))),
        }
    }
}

/// One classified sample; immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionSample {
    pub entity_id: String,
    /// Source item the sample was classified from (dedup key per entity)
    pub item_id: String,
    pub emotion: Emotion,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl EmotionSample {
    /// Build a sample, clamping confidence into [0, 1]
    pub fn new(
        entity_id: impl Into<String>,
        item_id: impl Into<String>,
        emotion: Emotion,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            entity_id: entity_id.into(),
            item_id: item_id.into(),
            emotion,
            confidence,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Anger".parse::<Emotion>().unwrap(), Emotion::Anger);
        assert_eq!(" joy ".parse::<Emotion>().unwrap(), Emotion::Joy);
    }

    #[test]
    fn test_unknown_label_is_permanent_error() {
        let err = "bliss".parse::<Emotion>().unwrap_err();
        assert!(matches!(err, PipelineError::Permanent(_)));
    }

    #[test]
    fn test_ordering_is_alphabetical() {
        let mut names: Vec<&str> = Emotion::ALL.iter().map(|e| e.as_str()).collect();
        let sorted = {
            let mut s = names.clone();
            s.sort();
            s
        };
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn test_sample_confidence_clamped() {
        assert_eq!(EmotionSample::new("Chile", "a", Emotion::Joy, 1.7).confidence, 1.0);
        assert_eq!(EmotionSample::new("Chile", "b", Emotion::Joy, -0.2).confidence, 0.0);
        assert_eq!(EmotionSample::new("Chile", "c", Emotion::Joy, f64::NAN).confidence, 0.0);
    }

    #[test]
    fn test_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Emotion::Surprise).unwrap(), "\"surprise\"");
    }
}
