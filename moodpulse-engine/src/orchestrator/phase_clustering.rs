//! Stage: CLUSTERING

use tracing::{debug, info, warn};

use super::PipelineOrchestrator;
use crate::collaborators::EnrichedItem;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CycleReport, CycleStage};
use crate::resilience::collaborators::CLUSTER;

/// One entity's items, in cluster order, ready for classification
pub(super) type EntityItems = (String, Vec<EnrichedItem>);

impl PipelineOrchestrator {
    /// Group each fetched entity's items; a failed call leaves them as one group
    pub(super) async fn phase_clustering(
        &self,
        report: &mut CycleReport,
        entities: &[String],
        items: Vec<EnrichedItem>,
    ) -> PipelineResult<Vec<EntityItems>> {
        info!(cycle_id = %report.cycle_id, entities = entities.len(), "CLUSTERING");

        let mut grouped: Vec<EntityItems> = entities.iter().map(|id| (id.clone(), Vec::new())).collect();
        for item in items {
            if let Some((_, bucket)) = grouped.iter_mut().find(|(id, _)| *id == item.entity_id) {
                bucket.push(item);
            }
        }
        grouped.retain(|(_, bucket)| !bucket.is_empty());

        let clusterer = &self.clusterer;
        for (entity_id, bucket) in grouped.iter_mut() {
            let id = entity_id.as_str();
            let input = bucket.as_slice();
            let result = self.invoker.invoke(CLUSTER, move || clusterer.cluster(id, input)).await;
            match result {
                Ok(clusters) => {
                    debug!(entity = %entity_id, clusters = clusters.len(), "Items clustered");
                    report.clusters += clusters.len();
                    let ordered: Vec<EnrichedItem> =
                        clusters.into_iter().flat_map(|cluster| cluster.items).collect();
                    if !ordered.is_empty() {
                        *bucket = ordered;
                    }
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    warn!(entity = %entity_id, error = %e, "Clustering failed, using one group");
                    report.mark_degraded(CycleStage::Clustering);
                    report.clusters += 1;
                }
            }
        }

        Ok(grouped)
    }
}
