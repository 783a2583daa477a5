//! Text cleanup enricher
//!
//! Strips markup, decodes the common HTML entities, drops URLs and collapses
//! whitespace. An item whose cleaned text is empty keeps its original text and is
//! marked as a fallback.

use async_trait::async_trait;

use super::{EnrichedItem, Enricher, RawItem};
use crate::error::PipelineResult;

const ENTITIES: [(&str, &str); 6] = [
    ("&amp;", "&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&nbsp;", " "),
];

#[derive(Debug, Clone, Default)]
pub struct TextNormalizer;

impl TextNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Cleaned text, or None when nothing readable remains
    pub fn normalize(&self, text: &str) -> Option<String> {
        let mut stripped = String::with_capacity(text.len());
        let mut in_tag = false;
        for ch in text.chars() {
            match ch {
                '<' => in_tag = true,
                '>' if in_tag => {
                    in_tag = false;
                    stripped.push(' ');
                }
                _ if !in_tag => stripped.push(ch),
                _ => {}
            }
        }

        let mut decoded = stripped;
        for (entity, replacement) in ENTITIES {
            decoded = decoded.replace(entity, replacement);
        }

        let words: Vec<&str> = decoded
            .split_whitespace()
            .filter(|w| !w.starts_with("http://") && !w.starts_with("https://"))
            .collect();

        if words.iter().any(|w| w.chars().any(char::is_alphanumeric)) {
            Some(words.join(" "))
        } else {
            None
        }
    }
}

#[async_trait]
impl Enricher for TextNormalizer {
    async fn enrich(&self, items: &[RawItem]) -> PipelineResult<Vec<EnrichedItem>> {
        Ok(items
            .iter()
            .map(|raw| match self.normalize(&raw.text) {
                Some(text) => EnrichedItem {
                    entity_id: raw.entity_id.clone(),
                    item_id: raw.item_id.clone(),
                    text,
                    enriched: true,
                },
                None => EnrichedItem::fallback(raw),
            })
            .collect())
    }
}
