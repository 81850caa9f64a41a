//! Broken-track merging: re-joins the two halves of a track-like cluster that was
//! split by a dead region or a reconstruction failure, by comparing the end fit of
//! one half with the start fit of the other.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit::{self, ClusterFitResult, FitRelation};
use super::store::EventStore;
use super::topological::sort_clusters_for_merging;

struct ClusterFits {
    cluster: ClusterId,
    start_fit: ClusterFitResult,
    end_fit: ClusterFitResult,
}

/// The broken-track merging pass.
pub struct BrokenTracksAlgorithm {
    n_start_layers_to_fit: usize,
    n_end_layers_to_fit: usize,
    max_fit_rms: f64,
    can_merge_min_mip_fraction: f64,
    can_merge_max_rms: f64,
    min_hits_in_cluster: usize,
    min_occupied_layers_in_cluster: usize,
    max_layer_difference: u32,
    max_centroid_difference: f64,
    fit_direction_dot_product_cut: f64,
    track_merge_cut_fine: f64,
    track_merge_cut_coarse: f64,
    track_merge_perp_cut_fine: f64,
    track_merge_perp_cut_coarse: f64,
}

impl Default for BrokenTracksAlgorithm {
    fn default() -> Self {
        Self {
            n_start_layers_to_fit: 5,
            n_end_layers_to_fit: 8,
            max_fit_rms: 15.0,
            can_merge_min_mip_fraction: 0.7,
            can_merge_max_rms: 5.0,
            min_hits_in_cluster: 4,
            min_occupied_layers_in_cluster: 4,
            max_layer_difference: 10,
            max_centroid_difference: 2000.0,
            fit_direction_dot_product_cut: 0.5,
            track_merge_cut_fine: 25.0,
            track_merge_cut_coarse: 50.0,
            track_merge_perp_cut_fine: 50.0,
            track_merge_perp_cut_coarse: 75.0,
        }
    }
}

impl BrokenTracksAlgorithm {
    fn build_fit_relations(
        &self,
        store: &mut EventStore,
    ) -> Result<Vec<FitRelation<ClusterFits>>> {
        let candidates = sort_clusters_for_merging(store, store.current_cluster_ids()?);
        let mut relations = Vec::new();

        for cluster_id in candidates {
            {
                let cluster = store.cluster(cluster_id)?;

                if (cluster.n_calo_hits() < self.min_hits_in_cluster)
                    || (cluster.n_occupied_layers() < self.min_occupied_layers_in_cluster)
                {
                    continue;
                }
            }

            if !store.can_merge_cluster(
                cluster_id,
                self.can_merge_min_mip_fraction,
                self.can_merge_max_rms,
            )? {
                continue;
            }

            let start_fit =
                fit::fit_start(store.hits_arena(), store.cluster(cluster_id)?, self.n_start_layers_to_fit)?;
            let end_fit =
                fit::fit_end(store.hits_arena(), store.cluster(cluster_id)?, self.n_end_layers_to_fit)?;

            if !start_fit.is_successful() || !end_fit.is_successful() {
                continue;
            }

            if (start_fit.rms()? > self.max_fit_rms) || (end_fit.rms()? > self.max_fit_rms) {
                continue;
            }

            relations.push(FitRelation::Valid(ClusterFits {
                cluster: cluster_id,
                start_fit,
                end_fit,
            }));
        }

        Ok(relations)
    }

    fn is_coarse_inner_hit(store: &EventStore, cluster_id: ClusterId) -> Result<bool> {
        let cluster = store.cluster(cluster_id)?;

        let Some(inner) = cluster.inner_layer() else {
            return Ok(false);
        };

        let Some(hit_id) = cluster.ordered_hits().layer_hits(inner).next() else {
            return Ok(false);
        };

        Ok(super::geometry::granularity(store.hit(hit_id)?.hit_type())
            != super::geometry::Granularity::Fine)
    }
}

impl Algorithm for BrokenTracksAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.n_start_layers_to_fit =
            config.read_or("NStartLayersToFit", self.n_start_layers_to_fit)?;
        self.n_end_layers_to_fit = config.read_or("NEndLayersToFit", self.n_end_layers_to_fit)?;
        self.max_fit_rms = config.read_or("MaxFitRms", self.max_fit_rms)?;
        self.can_merge_min_mip_fraction =
            config.read_or("CanMergeMinMipFraction", self.can_merge_min_mip_fraction)?;
        self.can_merge_max_rms = config.read_or("CanMergeMaxRms", self.can_merge_max_rms)?;
        self.min_hits_in_cluster = config.read_or("MinHitsInCluster", self.min_hits_in_cluster)?;
        self.min_occupied_layers_in_cluster = config
            .read_or("MinOccupiedLayersInCluster", self.min_occupied_layers_in_cluster)?;
        self.max_layer_difference =
            config.read_or("MaxLayerDifference", self.max_layer_difference)?;
        self.max_centroid_difference =
            config.read_or("MaxCentroidDifference", self.max_centroid_difference)?;
        self.fit_direction_dot_product_cut =
            config.read_or("FitDirectionDotProductCut", self.fit_direction_dot_product_cut)?;
        self.track_merge_cut_fine = config.read_or("TrackMergeCutEcal", self.track_merge_cut_fine)?;
        self.track_merge_cut_coarse =
            config.read_or("TrackMergeCutHcal", self.track_merge_cut_coarse)?;
        self.track_merge_perp_cut_fine =
            config.read_or("TrackMergePerpCutEcal", self.track_merge_perp_cut_fine)?;
        self.track_merge_perp_cut_coarse =
            config.read_or("TrackMergePerpCutHcal", self.track_merge_perp_cut_coarse)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let mut relations = self.build_fit_relations(context.store)?;

        for parent_index in 0..relations.len() {
            if relations[parent_index].is_defunct() {
                continue;
            }

            let mut best: Option<(f64, usize)> = None;

            for daughter_index in 0..relations.len() {
                if (daughter_index == parent_index) || relations[daughter_index].is_defunct() {
                    continue;
                }

                let parent = relations[parent_index].get()?;
                let daughter = relations[daughter_index].get()?;

                let parent_cluster = context.store.cluster(parent.cluster)?;
                let daughter_cluster = context.store.cluster(daughter.cluster)?;

                let (Some(parent_outer), Some(daughter_inner)) =
                    (parent_cluster.outer_layer(), daughter_cluster.inner_layer())
                else {
                    continue;
                };

                if (daughter_inner <= parent_outer)
                    || (daughter_inner - parent_outer > self.max_layer_difference)
                {
                    continue;
                }

                let centroid_difference = daughter_cluster.centroid(daughter_inner)?
                    - parent_cluster.centroid(parent_outer)?;

                if centroid_difference.magnitude() > self.max_centroid_difference {
                    continue;
                }

                if parent.end_fit.direction()?.dot(&daughter.start_fit.direction()?)
                    < self.fit_direction_dot_product_cut
                {
                    continue;
                }

                let approach =
                    fit::closest_distance_of_approach(&parent.end_fit, &daughter.start_fit)?;
                let coarse = Self::is_coarse_inner_hit(context.store, daughter.cluster)?;
                let approach_cut = if coarse {
                    self.track_merge_cut_coarse
                } else {
                    self.track_merge_cut_fine
                };

                if approach > approach_cut {
                    continue;
                }

                let perpendicular = parent
                    .end_fit
                    .direction()?
                    .cross(&centroid_difference)
                    .magnitude();
                let perpendicular_cut = if coarse {
                    self.track_merge_perp_cut_coarse
                } else {
                    self.track_merge_perp_cut_fine
                };

                if perpendicular > perpendicular_cut {
                    continue;
                }

                if best.is_none_or(|(current, _)| approach < current) {
                    best = Some((approach, daughter_index));
                }
            }

            if let Some((_, daughter_index)) = best {
                let parent_cluster = relations[parent_index].get()?.cluster;
                let daughter_cluster = relations[daughter_index].get()?.cluster;

                context
                    .store
                    .merge_and_delete_clusters(parent_cluster, daughter_cluster)?;

                // both halves changed; neither fit may be read again
                relations[parent_index].set_defunct();
                relations[daughter_index].set_defunct();
            }
        }

        Ok(())
    }
}
