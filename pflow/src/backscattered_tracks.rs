//! Backscattered-track merging: a particle scattering backwards out of a shower
//! leaves a track-like daughter whose projected fit points back into the parent
//! shower; the daughter is absorbed by the parent closest to that projection.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit;
use super::topological::sort_clusters_for_merging;

/// The backscattered-track merging pass.
pub struct BackscatteredTracksAlgorithm {
    can_merge_min_mip_fraction: f64,
    can_merge_max_rms: f64,
    min_calo_hits_per_cluster: usize,
    fit_to_all_hits_rms_cut: f64,
    n_outer_fit_exclusion_layers: u32,
    n_fit_projection_layers: u32,
    max_intra_layer_distance: f64,
}

impl Default for BackscatteredTracksAlgorithm {
    fn default() -> Self {
        Self {
            can_merge_min_mip_fraction: 0.7,
            can_merge_max_rms: 5.0,
            min_calo_hits_per_cluster: 5,
            fit_to_all_hits_rms_cut: 10.0,
            n_outer_fit_exclusion_layers: 2,
            n_fit_projection_layers: 2,
            max_intra_layer_distance: 100.0,
        }
    }
}

impl Algorithm for BackscatteredTracksAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.can_merge_min_mip_fraction =
            config.read_or("CanMergeMinMipFraction", self.can_merge_min_mip_fraction)?;
        self.can_merge_max_rms = config.read_or("CanMergeMaxRms", self.can_merge_max_rms)?;
        self.min_calo_hits_per_cluster =
            config.read_or("MinCaloHitsPerCluster", self.min_calo_hits_per_cluster)?;
        self.fit_to_all_hits_rms_cut =
            config.read_or("FitToAllHitsRmsCut", self.fit_to_all_hits_rms_cut)?;
        self.n_outer_fit_exclusion_layers =
            config.read_or("NOuterFitExclusionLayers", self.n_outer_fit_exclusion_layers)?;
        self.n_fit_projection_layers =
            config.read_or("NFitProjectionLayers", self.n_fit_projection_layers)?;
        self.max_intra_layer_distance =
            config.read_or("MaxIntraLayerDistance", self.max_intra_layer_distance)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let candidates =
            sort_clusters_for_merging(context.store, context.store.current_cluster_ids()?);

        for daughter_id in &candidates {
            if !context.store.cluster_exists(*daughter_id) {
                continue;
            }

            if context.store.cluster(*daughter_id)?.n_calo_hits() < self.min_calo_hits_per_cluster
            {
                continue;
            }

            if !context.store.can_merge_cluster(
                *daughter_id,
                self.can_merge_min_mip_fraction,
                self.can_merge_max_rms,
            )? {
                continue;
            }

            let all_hits_fit = context.store.fit_to_all_hits(*daughter_id)?;

            if !all_hits_fit.is_successful() || (all_hits_fit.rms()? > self.fit_to_all_hits_rms_cut)
            {
                continue;
            }

            // fit all but the outermost layers of the daughter candidate
            let daughter = context.store.cluster(*daughter_id)?;
            let (Some(daughter_inner), Some(daughter_outer)) =
                (daughter.inner_layer(), daughter.outer_layer())
            else {
                continue;
            };
            let daughter_outer_fit_layer =
                daughter_outer.saturating_sub(self.n_outer_fit_exclusion_layers);

            let daughter_fit = fit::fit_layers(
                context.store.hits_arena(),
                daughter,
                daughter_inner,
                daughter_outer_fit_layer,
            )?;

            if !daughter_fit.is_successful() {
                continue;
            }

            let mut best: Option<(f64, ClusterId)> = None;

            for parent_id in &candidates {
                if (parent_id == daughter_id) || !context.store.cluster_exists(*parent_id) {
                    continue;
                }

                if !context.store.can_merge_cluster(
                    *parent_id,
                    self.can_merge_min_mip_fraction,
                    self.can_merge_max_rms,
                )? {
                    continue;
                }

                {
                    let parent = context.store.cluster(*parent_id)?;
                    let (Some(parent_inner), Some(parent_outer)) =
                        (parent.inner_layer(), parent.outer_layer())
                    else {
                        continue;
                    };

                    // the daughter must end inside the parent's layer extent
                    if (parent_outer <= daughter_outer) || (parent_inner >= daughter_outer) {
                        continue;
                    }
                }

                let intra_layer_distance = fit::closest_intra_layer_distance(
                    context.store.hits_arena(),
                    context.store.cluster(*parent_id)?,
                    context.store.cluster(*daughter_id)?,
                )?;

                if intra_layer_distance.is_none_or(|distance| distance > self.max_intra_layer_distance)
                {
                    continue;
                }

                // project the daughter fit over the layers around its outer end
                let projection_inner =
                    daughter_outer.saturating_sub(self.n_fit_projection_layers);
                let projection_outer = daughter_outer + self.n_fit_projection_layers;

                let Some(fit_distance) = fit::distance_to_closest_hit(
                    &daughter_fit,
                    context.store.hits_arena(),
                    context.store.cluster(*parent_id)?,
                    projection_inner,
                    projection_outer,
                )?
                else {
                    continue;
                };

                if best.is_none_or(|(current, _)| fit_distance < current) {
                    best = Some((fit_distance, *parent_id));
                }
            }

            if let Some((_, parent_id)) = best {
                context.store.merge_and_delete_clusters(parent_id, *daughter_id)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmPool;
    use crate::store::{ClusterSeed, EventStore};
    use crate::testing;
    use crate::vector::CartesianVector;

    #[test]
    fn backscatter_stub_joins_enclosing_shower() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        // broad parent shower spanning layers 1-20
        let mut parent_hits = Vec::new();
        for layer in 0..20_u32 {
            for offset in [-10.0, 0.0, 10.0] {
                parent_hits.push(
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                0.2,
                            ),
                            &detector,
                            None,
                        )
                        .unwrap(),
                );
            }
        }
        let parent = store.create_cluster(ClusterSeed::Hits(parent_hits)).unwrap();

        // short mip stub ending inside the parent extent, slightly displaced
        let stub_hits: Vec<_> = (2..8_u32)
            .map(|layer| {
                let mut parameters = testing::ecal_hit(
                    CartesianVector::new(
                        5.0_f64.mul_add(f64::from(layer), 1500.0),
                        40.0 - f64::from(layer),
                        0.0,
                    ),
                    0.02,
                );
                parameters.is_possible_mip = true;
                store.create_calo_hit(parameters, &detector, None).unwrap()
            })
            .collect();
        let stub = store.create_cluster(ClusterSeed::Hits(stub_hits)).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        BackscatteredTracksAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(parent));
        assert!(!store.cluster_exists(stub));
        assert_eq!(store.cluster(parent).unwrap().n_calo_hits(), 66);
    }
}
