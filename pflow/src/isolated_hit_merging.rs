//! Isolated-hit merging: dissolves very small clusters, then attaches free isolated
//! hits to the nearest surviving cluster.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::hit::HitId;
use super::store::EventStore;

/// The isolated-hit merging pass.
pub struct IsolatedHitMergingAlgorithm {
    should_dissolve_small_clusters: bool,
    min_hits_in_cluster: usize,
    max_recombination_distance: f64,
}

impl Default for IsolatedHitMergingAlgorithm {
    fn default() -> Self {
        Self {
            should_dissolve_small_clusters: true,
            min_hits_in_cluster: 4,
            max_recombination_distance: 250.0,
        }
    }
}

impl IsolatedHitMergingAlgorithm {
    /// Distance from a free hit to the closest hit of a cluster.
    fn distance_to_cluster(
        store: &EventStore,
        hit_id: HitId,
        cluster_id: ClusterId,
    ) -> Result<Option<f64>> {
        let position = *store.hit(hit_id)?.position();
        let mut best: Option<f64> = None;

        for (_, other_id) in store.cluster(cluster_id)?.ordered_hits().hits() {
            let distance = (position - *store.hit(other_id)?.position()).magnitude();

            if best.is_none_or(|current| distance < current) {
                best = Some(distance);
            }
        }

        Ok(best)
    }
}

impl Algorithm for IsolatedHitMergingAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.should_dissolve_small_clusters =
            config.read_or("ShouldDissolveSmallClusters", self.should_dissolve_small_clusters)?;
        self.min_hits_in_cluster = config.read_or("MinHitsInCluster", self.min_hits_in_cluster)?;
        self.max_recombination_distance =
            config.read_or("MaxRecombinationDistance", self.max_recombination_distance)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let mut freed_hits: Vec<HitId> = Vec::new();

        if self.should_dissolve_small_clusters {
            for cluster_id in context.store.current_cluster_ids()? {
                let cluster = context.store.cluster(cluster_id)?;

                if (cluster.n_calo_hits() < self.min_hits_in_cluster)
                    && cluster.associated_tracks().is_empty()
                {
                    freed_hits.extend(cluster.ordered_hits().hits().map(|(_, id)| id));
                    freed_hits.extend_from_slice(cluster.isolated_hits());
                    context.store.delete_cluster(cluster_id)?;
                }
            }
        }

        // free isolated hits of the current hit list join the freed pool
        for (_, hit_id) in context.store.current_ordered_hits()?.clone().hits() {
            if context.store.hit(hit_id)?.is_isolated()
                && context.store.is_hit_available(hit_id)
                && !freed_hits.contains(&hit_id)
            {
                freed_hits.push(hit_id);
            }
        }

        let cluster_ids = context.store.current_cluster_ids()?;

        for hit_id in freed_hits {
            let mut best: Option<(f64, ClusterId)> = None;

            for cluster_id in &cluster_ids {
                if !context.store.cluster_exists(*cluster_id) {
                    continue;
                }

                let Some(distance) =
                    Self::distance_to_cluster(context.store, hit_id, *cluster_id)?
                else {
                    continue;
                };

                if (distance < self.max_recombination_distance)
                    && best.is_none_or(|(current, _)| distance < current)
                {
                    best = Some((distance, *cluster_id));
                }
            }

            if let Some((_, cluster_id)) = best {
                context.store.add_isolated_hit_to_cluster(cluster_id, hit_id)?;
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

    #[test]
    fn small_cluster_dissolves_into_isolated_hits_of_neighbour() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let big_hits: Vec<_> = (0..10_u32)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(5.0_f64.mul_add(f64::from(layer), 1500.0), 0.0, 0.0),
                            0.3,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        let big = store.create_cluster(ClusterSeed::Hits(big_hits)).unwrap();

        let small_hits: Vec<_> = (2..4_u32)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                60.0,
                                0.0,
                            ),
                            0.05,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        let small = store.create_cluster(ClusterSeed::Hits(small_hits.clone())).unwrap();

        store.create_hit_list("CaloHits", Vec::new()).unwrap();
        store.replace_current_hit_list("CaloHits").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        IsolatedHitMergingAlgorithm::default().run(&mut context).unwrap();

        assert!(!store.cluster_exists(small));
        let big_cluster = store.cluster(big).unwrap();
        assert_eq!(big_cluster.n_isolated_hits(), 2);
        assert!(small_hits.iter().all(|id| big_cluster.isolated_hits().contains(id)));
    }
}
