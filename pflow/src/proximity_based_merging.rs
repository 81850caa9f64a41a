//! Proximity-based merging: clusters overlapping in depth whose hits approach each
//! other closely, with compatible directions, are combined.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit;
use super::geometry::{granularity, Granularity};
use super::store::EventStore;
use super::topological::sort_clusters_for_merging;

/// The proximity-based merging pass.
pub struct ProximityBasedMergingAlgorithm {
    track_cluster_association_name: Option<String>,
    can_merge_min_mip_fraction: f64,
    can_merge_max_rms: f64,
    min_hits_in_cluster: usize,
    max_layer_gap: u32,
    max_hit_distance_fine: f64,
    max_hit_distance_coarse: f64,
    min_cos_opening_angle: f64,
}

impl Default for ProximityBasedMergingAlgorithm {
    fn default() -> Self {
        Self {
            track_cluster_association_name: None,
            can_merge_min_mip_fraction: 0.7,
            can_merge_max_rms: 5.0,
            min_hits_in_cluster: 4,
            max_layer_gap: 2,
            max_hit_distance_fine: 50.0,
            max_hit_distance_coarse: 100.0,
            min_cos_opening_angle: 0.7,
        }
    }
}

impl ProximityBasedMergingAlgorithm {
    fn layer_gap(store: &EventStore, lhs: ClusterId, rhs: ClusterId) -> Result<Option<u32>> {
        let lhs_cluster = store.cluster(lhs)?;
        let rhs_cluster = store.cluster(rhs)?;

        let (Some(lhs_inner), Some(lhs_outer)) =
            (lhs_cluster.inner_layer(), lhs_cluster.outer_layer())
        else {
            return Ok(None);
        };
        let (Some(rhs_inner), Some(rhs_outer)) =
            (rhs_cluster.inner_layer(), rhs_cluster.outer_layer())
        else {
            return Ok(None);
        };

        // zero when the layer extents overlap, the gap size otherwise
        if (lhs_inner <= rhs_outer) && (rhs_inner <= lhs_outer) {
            Ok(Some(0))
        } else if rhs_inner > lhs_outer {
            Ok(Some(rhs_inner - lhs_outer))
        } else {
            Ok(Some(lhs_inner - rhs_outer))
        }
    }

    fn hit_distance_cut(&self, store: &EventStore, cluster_id: ClusterId) -> Result<f64> {
        let cluster = store.cluster(cluster_id)?;

        let Some(inner) = cluster.inner_layer() else {
            return Ok(self.max_hit_distance_fine);
        };

        let Some(hit_id) = cluster.ordered_hits().layer_hits(inner).next() else {
            return Ok(self.max_hit_distance_fine);
        };

        Ok(match granularity(store.hit(hit_id)?.hit_type()) {
            Granularity::Fine => self.max_hit_distance_fine,
            Granularity::Coarse | Granularity::VeryCoarse => self.max_hit_distance_coarse,
        })
    }
}

impl Algorithm for ProximityBasedMergingAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.track_cluster_association_name =
            builder.create_optional_stage(config, "TrackClusterAssociation")?;
        self.can_merge_min_mip_fraction =
            config.read_or("CanMergeMinMipFraction", self.can_merge_min_mip_fraction)?;
        self.can_merge_max_rms = config.read_or("CanMergeMaxRms", self.can_merge_max_rms)?;
        self.min_hits_in_cluster = config.read_or("MinHitsInCluster", self.min_hits_in_cluster)?;
        self.max_layer_gap = config.read_or("MaxLayerGap", self.max_layer_gap)?;
        self.max_hit_distance_fine =
            config.read_or("MaxHitDistanceFine", self.max_hit_distance_fine)?;
        self.max_hit_distance_coarse =
            config.read_or("MaxHitDistanceCoarse", self.max_hit_distance_coarse)?;
        self.min_cos_opening_angle =
            config.read_or("MinCosOpeningAngle", self.min_cos_opening_angle)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        if let Some(name) = self.track_cluster_association_name.clone() {
            context.run_stage(&name)?;
        }

        let candidates =
            sort_clusters_for_merging(context.store, context.store.current_cluster_ids()?);

        for daughter_id in &candidates {
            if !context.store.cluster_exists(*daughter_id) {
                continue;
            }

            {
                let daughter = context.store.cluster(*daughter_id)?;

                // daughters with tracks are left for the reclustering machinery
                if !daughter.associated_tracks().is_empty()
                    || (daughter.n_calo_hits() < self.min_hits_in_cluster)
                {
                    continue;
                }
            }

            if !context.store.can_merge_cluster(
                *daughter_id,
                self.can_merge_min_mip_fraction,
                self.can_merge_max_rms,
            )? {
                continue;
            }

            let daughter_direction =
                context.store.cluster(*daughter_id)?.initial_direction()?;

            let mut best: Option<(f64, ClusterId)> = None;

            for parent_id in &candidates {
                if (parent_id == daughter_id) || !context.store.cluster_exists(*parent_id) {
                    continue;
                }

                if context.store.cluster(*parent_id)?.n_calo_hits() < self.min_hits_in_cluster {
                    continue;
                }

                if !context.store.can_merge_cluster(
                    *parent_id,
                    self.can_merge_min_mip_fraction,
                    self.can_merge_max_rms,
                )? {
                    continue;
                }

                let Some(gap) = Self::layer_gap(context.store, *parent_id, *daughter_id)? else {
                    continue;
                };

                if gap > self.max_layer_gap {
                    continue;
                }

                let parent_direction =
                    context.store.cluster(*parent_id)?.initial_direction()?;

                if daughter_direction.cos_opening_angle(&parent_direction)?
                    < self.min_cos_opening_angle
                {
                    continue;
                }

                let Some(distance) = fit::closest_hit_distance(
                    context.store.hits_arena(),
                    context.store.cluster(*daughter_id)?,
                    context.store.cluster(*parent_id)?,
                )?
                else {
                    continue;
                };

                if distance > self.hit_distance_cut(context.store, *daughter_id)? {
                    continue;
                }

                if best.is_none_or(|(current, _)| distance < current) {
                    best = Some((distance, *parent_id));
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
    use crate::store::ClusterSeed;
    use crate::testing;
    use crate::vector::CartesianVector;

    fn column(
        store: &mut EventStore,
        detector: &crate::geometry::Detector,
        offset: f64,
        layers: std::ops::Range<u32>,
    ) -> ClusterId {
        let hits: Vec<_> = layers
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                offset,
                                0.0,
                            ),
                            0.1,
                        ),
                        detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();

        store.create_cluster(ClusterSeed::Hits(hits)).unwrap()
    }

    #[test]
    fn adjacent_columns_merge() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let lhs = column(&mut store, &detector, 0.0, 0..10);
        let rhs = column(&mut store, &detector, 30.0, 2..8);

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        ProximityBasedMergingAlgorithm::default().run(&mut context).unwrap();

        let survivors: Vec<_> = [lhs, rhs]
            .into_iter()
            .filter(|id| store.cluster_exists(*id))
            .collect();
        assert_eq!(survivors.len(), 1);
        assert_eq!(store.cluster(survivors[0]).unwrap().n_calo_hits(), 16);
    }

    #[test]
    fn separated_columns_survive() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let lhs = column(&mut store, &detector, 0.0, 0..10);
        let rhs = column(&mut store, &detector, 400.0, 2..8);

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        ProximityBasedMergingAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(lhs));
        assert!(store.cluster_exists(rhs));
    }
}
