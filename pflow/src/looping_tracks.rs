//! Looping-track merging: a charged particle curling in the field leaves two
//! track-like clusters whose outer ends meet; the pass merges pairs whose end fits
//! converge and which share enough "good features".

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit::{self, ClusterFitResult, FitRelation};
use super::store::EventStore;
use super::topological::sort_clusters_for_merging;

struct ClusterFit {
    cluster: ClusterId,
    fit: ClusterFitResult,
}

/// The looping-track merging pass.
pub struct LoopingTracksAlgorithm {
    n_layers_to_fit: usize,
    fit_chi2_cut: f64,
    can_merge_min_mip_fraction: f64,
    can_merge_max_rms: f64,
    min_hits_in_cluster: usize,
    min_occupied_layers_in_cluster: usize,
    max_outer_layer_difference: u32,
    max_centroid_difference: f64,
    fit_direction_dot_product_cut: f64,
    closest_hit_distance_cut_fine: f64,
    closest_hit_distance_cut_coarse: f64,
    fit_results_closest_approach_cut: f64,
    n_good_features_for_merge: u32,
    good_features_max_fit_dot_product: f64,
    good_features_max_fit_approach: f64,
    good_features_max_layer_difference: u32,
    good_features_min_mip_fraction: f64,
}

impl Default for LoopingTracksAlgorithm {
    fn default() -> Self {
        Self {
            n_layers_to_fit: 10,
            fit_chi2_cut: 10.0,
            can_merge_min_mip_fraction: 0.7,
            can_merge_max_rms: 5.0,
            min_hits_in_cluster: 4,
            min_occupied_layers_in_cluster: 4,
            max_outer_layer_difference: 5,
            max_centroid_difference: 2000.0,
            fit_direction_dot_product_cut: 0.0,
            closest_hit_distance_cut_fine: 250.0,
            closest_hit_distance_cut_coarse: 500.0,
            fit_results_closest_approach_cut: 50.0,
            n_good_features_for_merge: 2,
            good_features_max_fit_dot_product: -0.5,
            good_features_max_fit_approach: 15.0,
            good_features_max_layer_difference: 3,
            good_features_min_mip_fraction: 0.9,
        }
    }
}

impl LoopingTracksAlgorithm {
    fn build_fit_relations(&self, store: &mut EventStore) -> Result<Vec<FitRelation<ClusterFit>>> {
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

            let fit =
                fit::fit_end(store.hits_arena(), store.cluster(cluster_id)?, self.n_layers_to_fit)?;

            if !fit.is_successful() || (fit.chi2()? > self.fit_chi2_cut) {
                continue;
            }

            relations.push(FitRelation::Valid(ClusterFit { cluster: cluster_id, fit }));
        }

        Ok(relations)
    }

    fn closest_distance_between_outer_layer_hits(
        store: &EventStore,
        lhs: ClusterId,
        rhs: ClusterId,
    ) -> Result<Option<f64>> {
        let lhs_cluster = store.cluster(lhs)?;
        let rhs_cluster = store.cluster(rhs)?;

        let (Some(lhs_outer), Some(rhs_outer)) =
            (lhs_cluster.outer_layer(), rhs_cluster.outer_layer())
        else {
            return Ok(None);
        };

        let mut best: Option<f64> = None;

        for lhs_hit in lhs_cluster.ordered_hits().layer_hits(lhs_outer) {
            let lhs_position = *store.hit(lhs_hit)?.position();

            for rhs_hit in rhs_cluster.ordered_hits().layer_hits(rhs_outer) {
                let distance = (lhs_position - *store.hit(rhs_hit)?.position()).magnitude();

                if best.is_none_or(|current| distance < current) {
                    best = Some(distance);
                }
            }
        }

        Ok(best)
    }

    fn is_fine_outer_hit(store: &EventStore, cluster_id: ClusterId) -> Result<bool> {
        let cluster = store.cluster(cluster_id)?;

        let Some(outer) = cluster.outer_layer() else {
            return Ok(true);
        };

        let Some(hit_id) = cluster.ordered_hits().layer_hits(outer).next() else {
            return Ok(true);
        };

        Ok(super::geometry::granularity(store.hit(hit_id)?.hit_type())
            == super::geometry::Granularity::Fine)
    }
}

impl Algorithm for LoopingTracksAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.n_layers_to_fit = config.read_or("NLayersToFit", self.n_layers_to_fit)?;
        self.fit_chi2_cut = config.read_or("FitChi2Cut", self.fit_chi2_cut)?;
        self.can_merge_min_mip_fraction =
            config.read_or("CanMergeMinMipFraction", self.can_merge_min_mip_fraction)?;
        self.can_merge_max_rms = config.read_or("CanMergeMaxRms", self.can_merge_max_rms)?;
        self.min_hits_in_cluster = config.read_or("MinHitsInCluster", self.min_hits_in_cluster)?;
        self.min_occupied_layers_in_cluster = config
            .read_or("MinOccupiedLayersInCluster", self.min_occupied_layers_in_cluster)?;
        self.max_outer_layer_difference =
            config.read_or("MaxOuterLayerDifference", self.max_outer_layer_difference)?;
        self.max_centroid_difference =
            config.read_or("MaxCentroidDifference", self.max_centroid_difference)?;
        self.fit_direction_dot_product_cut =
            config.read_or("FitDirectionDotProductCut", self.fit_direction_dot_product_cut)?;
        self.closest_hit_distance_cut_fine =
            config.read_or("ClosestHitDistanceCutECal", self.closest_hit_distance_cut_fine)?;
        self.closest_hit_distance_cut_coarse =
            config.read_or("ClosestHitDistanceCutHCal", self.closest_hit_distance_cut_coarse)?;
        self.fit_results_closest_approach_cut = config
            .read_or("FitResultsClosestApproachCut", self.fit_results_closest_approach_cut)?;
        self.n_good_features_for_merge =
            config.read_or("NGoodFeaturesForClusterMerge", self.n_good_features_for_merge)?;
        self.good_features_max_fit_dot_product = config
            .read_or("GoodFeaturesMaxFitDotProduct", self.good_features_max_fit_dot_product)?;
        self.good_features_max_fit_approach =
            config.read_or("GoodFeaturesMaxFitApproach", self.good_features_max_fit_approach)?;
        self.good_features_max_layer_difference = config.read_or(
            "GoodFeaturesMaxLayerDifference",
            self.good_features_max_layer_difference,
        )?;
        self.good_features_min_mip_fraction =
            config.read_or("GoodFeaturesMinMipFraction", self.good_features_min_mip_fraction)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let mut relations = self.build_fit_relations(context.store)?;

        for lhs_index in 0..relations.len() {
            if relations[lhs_index].is_defunct() {
                continue;
            }

            let mut best: Option<(f64, usize)> = None;

            for rhs_index in (lhs_index + 1)..relations.len() {
                if relations[rhs_index].is_defunct() {
                    continue;
                }

                let lhs = relations[lhs_index].get()?;
                let rhs = relations[rhs_index].get()?;

                let lhs_cluster = context.store.cluster(lhs.cluster)?;
                let rhs_cluster = context.store.cluster(rhs.cluster)?;

                let (Some(lhs_outer), Some(rhs_outer)) =
                    (lhs_cluster.outer_layer(), rhs_cluster.outer_layer())
                else {
                    continue;
                };

                let layer_difference = lhs_outer.abs_diff(rhs_outer);

                if layer_difference > self.max_outer_layer_difference {
                    continue;
                }

                let centroid_difference = (lhs_cluster.centroid(lhs_outer)?
                    - rhs_cluster.centroid(rhs_outer)?)
                .magnitude();

                if centroid_difference > self.max_centroid_difference {
                    continue;
                }

                // the two ends must point towards each other, not along each other
                let fit_dot_product = lhs.fit.direction()?.dot(&rhs.fit.direction()?);

                if fit_dot_product > self.fit_direction_dot_product_cut {
                    continue;
                }

                let Some(hit_distance) = Self::closest_distance_between_outer_layer_hits(
                    context.store,
                    lhs.cluster,
                    rhs.cluster,
                )?
                else {
                    continue;
                };

                let fine = Self::is_fine_outer_hit(context.store, lhs.cluster)?
                    && Self::is_fine_outer_hit(context.store, rhs.cluster)?;
                let hit_distance_cut = if fine {
                    self.closest_hit_distance_cut_fine
                } else {
                    self.closest_hit_distance_cut_coarse
                };

                if hit_distance > hit_distance_cut {
                    continue;
                }

                let approach = fit::closest_distance_of_approach(&lhs.fit, &rhs.fit)?;

                if approach > self.fit_results_closest_approach_cut {
                    continue;
                }

                let mut n_good_features = 0u32;

                if fit_dot_product < self.good_features_max_fit_dot_product {
                    n_good_features += 1;
                }

                if approach < self.good_features_max_fit_approach {
                    n_good_features += 1;
                }

                if layer_difference <= self.good_features_max_layer_difference {
                    n_good_features += 1;
                }

                if (lhs_cluster.mip_fraction() > self.good_features_min_mip_fraction)
                    && (rhs_cluster.mip_fraction() > self.good_features_min_mip_fraction)
                {
                    n_good_features += 1;
                }

                if n_good_features < self.n_good_features_for_merge {
                    continue;
                }

                if best.is_none_or(|(current, _)| approach < current) {
                    best = Some((approach, rhs_index));
                }
            }

            if let Some((_, rhs_index)) = best {
                let recipient = relations[lhs_index].get()?.cluster;
                let donor = relations[rhs_index].get()?.cluster;

                context.store.merge_and_delete_clusters(recipient, donor)?;
                relations[lhs_index].set_defunct();
                relations[rhs_index].set_defunct();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmPool;
    use crate::store::ClusterSeed;
    use crate::testing;
    use crate::vector::CartesianVector;

    fn arc_cluster(
        store: &mut EventStore,
        detector: &crate::geometry::Detector,
        phi_sign: f64,
    ) -> ClusterId {
        // a curling trajectory: advances radially while drifting in phi, ending at
        // the same place as its mirror image
        let hits: Vec<_> = (0..8_u32)
            .map(|step| {
                let radius = 5.0_f64.mul_add(f64::from(step), 1500.0);
                let phi = phi_sign * 0.02 * f64::from(8 - step);
                let mut parameters = testing::ecal_hit(
                    CartesianVector::new(radius * phi.cos(), radius * phi.sin(), 0.0),
                    0.02,
                );
                parameters.is_possible_mip = true;
                store.create_calo_hit(parameters, &detector, None).unwrap()
            })
            .collect();

        store.create_cluster(ClusterSeed::Hits(hits)).unwrap()
    }

    #[test]
    fn converging_arcs_merge() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let lhs = arc_cluster(&mut store, &detector, 1.0);
        let rhs = arc_cluster(&mut store, &detector, -1.0);

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        LoopingTracksAlgorithm::default().run(&mut context).unwrap();

        let survivors: Vec<_> = [lhs, rhs]
            .into_iter()
            .filter(|id| store.cluster_exists(*id))
            .collect();
        assert_eq!(survivors.len(), 1);
        assert_eq!(store.cluster(survivors[0]).unwrap().n_calo_hits(), 16);
    }

    #[test]
    fn parallel_tracks_do_not_merge() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let make_line = |store: &mut EventStore, offset: f64| {
            let hits: Vec<_> = (0..8_u32)
                .map(|layer| {
                    let mut parameters = testing::ecal_hit(
                        CartesianVector::new(
                            5.0_f64.mul_add(f64::from(layer), 1500.0),
                            offset,
                            0.0,
                        ),
                        0.02,
                    );
                    parameters.is_possible_mip = true;
                    store.create_calo_hit(parameters, &detector, None).unwrap()
                })
                .collect();
            store.create_cluster(ClusterSeed::Hits(hits)).unwrap()
        };

        let lhs = make_line(&mut store, 0.0);
        let rhs = make_line(&mut store, 60.0);

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        LoopingTracksAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(lhs));
        assert!(store.cluster_exists(rhs));
    }
}
