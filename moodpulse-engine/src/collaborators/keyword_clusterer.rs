//! Keyword clusterer
//!
//! Groups an entity's items by their leading keyword: the first word of at least
//! four letters that is not a stop word. Items without one land in `misc`.
//! Clusters are ordered by size (largest first), then label.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{Clusterer, EnrichedItem, ItemCluster};
use crate::error::PipelineResult;

pub const MISC_LABEL: &str = "misc";

const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: [&str; 24] = [
    "about", "after", "again", "also", "been", "before", "being", "from", "have", "into",
    "just", "more", "most", "over", "said", "some", "than", "that", "their", "there",
    "these", "they", "this", "with",
];

#[derive(Debug, Clone, Default)]
pub struct KeywordClusterer;

impl KeywordClusterer {
    pub fn new() -> Self {
        Self
    }

    pub fn keyword(text: &str) -> Option<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .find(|word| {
                word.chars().count() >= MIN_KEYWORD_LEN
                    && word.chars().all(char::is_alphabetic)
                    && !STOP_WORDS.contains(&word.as_str())
            })
    }
}

#[async_trait]
impl Clusterer for KeywordClusterer {
    async fn cluster(&self, entity_id: &str, items: &[EnrichedItem]) -> PipelineResult<Vec<ItemCluster>> {
        let mut groups: BTreeMap<String, Vec<EnrichedItem>> = BTreeMap::new();
        for item in items {
            let label = Self::keyword(&item.text).unwrap_or_else(|| MISC_LABEL.to_string());
            groups.entry(label).or_default().push(item.clone());
        }

        let mut clusters: Vec<ItemCluster> = groups
            .into_iter()
            .map(|(label, items)| ItemCluster {
                entity_id: entity_id.to_string(),
                label,
                items,
            })
            .collect();
        clusters.sort_by(|a, b| b.items.len().cmp(&a.items.len()).then(a.label.cmp(&b.label)));
        Ok(clusters)
    }
}
