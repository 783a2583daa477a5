//! Stage: ANALYZING
//!
//! Every entity's items are classified through the lifecycle-gated capability and
//! its samples are written before the next entity starts, so aggregation always
//! sees complete per-entity output.
//!
//! Two `CapabilityUnavailable` errors in a row demote the rest of the cycle:
//! remaining items are stored as neutral samples with zero confidence, which
//! keeps the raw item on file without letting it sway any average.

use tracing::{debug, info, warn};

use super::phase_clustering::EntityItems;
use super::PipelineOrchestrator;
use crate::collaborators::EnrichedItem;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CycleReport, CycleStage, Emotion, EmotionSample};
use crate::resilience::collaborators::CLASSIFY;

/// Consecutive unavailable errors that demote the stage
pub const DEMOTE_AFTER_UNAVAILABLE: u32 = 2;

/// Confidence of the neutral samples written for demoted items
pub const FALLBACK_CONFIDENCE: f64 = 0.0;

/// Neutral placeholder samples for items that could not be classified
pub fn fallback_samples(entity_id: &str, items: &[EnrichedItem]) -> Vec<EmotionSample> {
    items
        .iter()
        .map(|item| EmotionSample::new(entity_id, item.item_id.clone(), Emotion::Neutral, FALLBACK_CONFIDENCE))
        .collect()
}

impl PipelineOrchestrator {
    pub(super) async fn phase_analyzing(
        &self,
        report: &mut CycleReport,
        grouped: &[EntityItems],
    ) -> PipelineResult<()> {
        info!(cycle_id = %report.cycle_id, entities = grouped.len(), "ANALYZING");

        let mut consecutive_unavailable = 0u32;

        for (entity_id, items) in grouped {
            let samples = loop {
                if report.analysis_demoted {
                    break fallback_samples(entity_id, items);
                }

                match self.classify_entity(entity_id, items).await {
                    Ok(samples) => {
                        consecutive_unavailable = 0;
                        break samples;
                    }
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(PipelineError::CapabilityUnavailable(reason)) => {
                        consecutive_unavailable += 1;
                        warn!(
                            entity = %entity_id,
                            reason = %reason,
                            consecutive = consecutive_unavailable,
                            "Analysis capability unavailable"
                        );
                        if consecutive_unavailable >= DEMOTE_AFTER_UNAVAILABLE {
                            warn!(
                                cycle_id = %report.cycle_id,
                                "Analysis demoted, storing remaining items as neutral samples"
                            );
                            report.analysis_demoted = true;
                            report.mark_degraded(CycleStage::Analyzing);
                        }
                    }
                    Err(e) => {
                        warn!(entity = %entity_id, error = %e, "Classification failed");
                        report.mark_degraded(CycleStage::Analyzing);
                        break Vec::new();
                    }
                }
            };

            if samples.is_empty() {
                continue;
            }
            let written = db::samples::insert_samples(&self.db, &samples).await?;
            debug!(entity = %entity_id, samples = written, "Samples stored");
            report.samples_written += written;
        }

        Ok(())
    }

    async fn classify_entity(
        &self,
        entity_id: &str,
        items: &[EnrichedItem],
    ) -> PipelineResult<Vec<EmotionSample>> {
        let classifier = self.lifecycle.ensure_loaded().await?;
        let capability = &classifier;

        let result = self
            .invoker
            .invoke(CLASSIFY, move || capability.classify(entity_id, items))
            .await;
        self.lifecycle.mark_used();

        Ok(result?
            .into_iter()
            .filter(|sample| sample.entity_id == entity_id)
            .collect())
    }
}
