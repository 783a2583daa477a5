//! Keyword lexicon emotion classifier
//!
//! Each item is scored by counting lexicon keywords per emotion. The emotion with
//! the most hits wins (alphabetical on ties); items without a hit are neutral.
//! Confidence is the winner's share of all hits, damped when only one or two
//! keywords matched.
//!
//! Lexicon file format:
//!
//! ```toml
//! [emotions]
//! joy = ["happy", "celebrate"]
//! anger = ["outrage", "furious"]
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::{ClassifierLoader, EmotionClassifier, EnrichedItem};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Emotion, EmotionSample};

/// Confidence of a neutral verdict when no keyword matched
pub const NO_MATCH_CONFIDENCE: f64 = 0.5;
/// Hits at which the damping no longer applies
const FULL_CONFIDENCE_HITS: usize = 3;

const BUILTIN_LEXICON: &str = r#"
[emotions]
joy = ["happy", "celebrate", "celebration", "wonderful", "great", "love", "win", "victory", "delighted", "hope"]
sadness = ["sad", "mourn", "mourning", "grief", "loss", "tragic", "tears", "funeral", "lonely", "miss"]
anger = ["angry", "outrage", "furious", "protest", "corrupt", "corruption", "hate", "rage", "unfair", "scandal"]
fear = ["fear", "afraid", "scared", "threat", "panic", "danger", "warning", "terror", "crisis", "risk"]
surprise = ["surprise", "surprising", "unexpected", "shock", "shocking", "sudden", "stunned", "unbelievable"]
disgust = ["disgust", "disgusting", "gross", "vile", "revolting", "sickening", "nasty"]
"#;

#[derive(Debug, Deserialize)]
struct LexiconFile {
    emotions: BTreeMap<String, Vec<String>>,
}

/// Parse a lexicon document into keyword → emotion
pub fn parse_lexicon(content: &str) -> PipelineResult<HashMap<String, Emotion>> {
    let file: LexiconFile = toml::from_str(content)
        .map_err(|e| PipelineError::Permanent(format!("invalid lexicon: {}", e)))?;

    let mut keywords = HashMap::new();
    for (label, words) in file.emotions {
        let emotion: Emotion = label.parse()?;
        for word in words {
            keywords.insert(word.trim().to_lowercase(), emotion);
        }
    }
    if keywords.is_empty() {
        return Err(PipelineError::Permanent("lexicon contains no keywords".to_string()));
    }
    Ok(keywords)
}

pub struct LexiconClassifier {
    keywords: HashMap<String, Emotion>,
}

impl LexiconClassifier {
    pub fn new(keywords: HashMap<String, Emotion>) -> Self {
        Self { keywords }
    }

    pub fn builtin() -> PipelineResult<Self> {
        Ok(Self::new(parse_lexicon(BUILTIN_LEXICON)?))
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    /// Emotion and confidence for one text
    pub fn score(&self, text: &str) -> (Emotion, f64) {
        let mut hits: BTreeMap<Emotion, usize> = BTreeMap::new();
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            if let Some(emotion) = self.keywords.get(&word.to_lowercase()) {
                *hits.entry(*emotion).or_default() += 1;
            }
        }

        let total: usize = hits.values().sum();
        let mut best: Option<(Emotion, usize)> = None;
        for (emotion, count) in &hits {
            if best.map_or(true, |(_, c)| *count > c) {
                best = Some((*emotion, *count));
            }
        }

        match best {
            None => (Emotion::Neutral, NO_MATCH_CONFIDENCE),
            Some((emotion, count)) => {
                let share = count as f64 / total as f64;
                let damping = 0.5 + 0.5 * (count.min(FULL_CONFIDENCE_HITS) as f64 / FULL_CONFIDENCE_HITS as f64);
                (emotion, share * damping)
            }
        }
    }
}

#[async_trait]
impl EmotionClassifier for LexiconClassifier {
    fn name(&self) -> &str {
        "lexicon"
    }

    async fn classify(&self, entity_id: &str, items: &[EnrichedItem]) -> PipelineResult<Vec<EmotionSample>> {
        Ok(items
            .iter()
            .map(|item| {
                let (emotion, confidence) = self.score(&item.text);
                EmotionSample::new(entity_id, item.item_id.clone(), emotion, confidence)
            })
            .collect())
    }
}

/// Loads the lexicon from a file, or the built-in one
pub struct LexiconLoader {
    path: Option<PathBuf>,
}

impl LexiconLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ClassifierLoader for LexiconLoader {
    async fn load(&self) -> PipelineResult<Arc<dyn EmotionClassifier>> {
        let classifier = match &self.path {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    PipelineError::CapabilityUnavailable(format!(
                        "cannot read lexicon {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                LexiconClassifier::new(parse_lexicon(&content)?)
            }
            None => LexiconClassifier::builtin()?,
        };
        info!(keywords = classifier.keyword_count(), "Lexicon loaded");
        Ok(Arc::new(classifier))
    }
}
