//! Soft-cluster merging: small, thin or low-energy trackless clusters are attached
//! to the closest acceptable neighbour.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit;
use super::geometry::{granularity, Granularity};
use super::store::EventStore;
use super::topological::sort_clusters_for_merging;

/// The soft-cluster merging pass.
pub struct SoftClusterMergingAlgorithm {
    track_cluster_association_name: Option<String>,
    max_hits_in_soft_cluster: usize,
    max_layers_spanned_by_soft_cluster: u32,
    max_had_energy_for_soft_cluster_no_track: f64,
    min_hits_in_acceptable_cluster: usize,
    min_cluster_hadronic_energy: f64,
    min_cluster_em_energy: f64,
    min_cos_opening_angle: f64,
    closest_distance_cut0: f64,
    closest_distance_cut1: f64,
    inner_layer_cut1: u32,
    closest_distance_cut2: f64,
    inner_layer_cut2: u32,
    max_cluster_distance_fine: f64,
    max_cluster_distance_coarse: f64,
}

impl Default for SoftClusterMergingAlgorithm {
    fn default() -> Self {
        Self {
            track_cluster_association_name: None,
            max_hits_in_soft_cluster: 5,
            max_layers_spanned_by_soft_cluster: 3,
            max_had_energy_for_soft_cluster_no_track: 2.0,
            min_hits_in_acceptable_cluster: 5,
            min_cluster_hadronic_energy: 0.25,
            min_cluster_em_energy: 0.025,
            min_cos_opening_angle: 0.0,
            closest_distance_cut0: 50.0,
            closest_distance_cut1: 100.0,
            inner_layer_cut1: 20,
            closest_distance_cut2: 250.0,
            inner_layer_cut2: 40,
            max_cluster_distance_fine: 100.0,
            max_cluster_distance_coarse: 250.0,
        }
    }
}

impl SoftClusterMergingAlgorithm {
    fn is_soft_cluster(&self, store: &EventStore, cluster_id: ClusterId) -> Result<bool> {
        let cluster = store.cluster(cluster_id)?;

        if !cluster.associated_tracks().is_empty() {
            return Ok(false);
        }

        Ok((cluster.n_calo_hits() < self.max_hits_in_soft_cluster)
            || (cluster.layer_span() < self.max_layers_spanned_by_soft_cluster)
            || (cluster.hadronic_energy() < self.max_had_energy_for_soft_cluster_no_track))
    }

    fn is_acceptable_parent(&self, store: &EventStore, cluster_id: ClusterId) -> Result<bool> {
        let cluster = store.cluster(cluster_id)?;

        Ok((cluster.n_calo_hits() >= self.min_hits_in_acceptable_cluster)
            && ((cluster.hadronic_energy() >= self.min_cluster_hadronic_energy)
                || (cluster.electromagnetic_energy() >= self.min_cluster_em_energy)))
    }

    fn can_merge_soft_cluster(
        &self,
        store: &EventStore,
        daughter_id: ClusterId,
        closest_distance: f64,
    ) -> Result<bool> {
        if closest_distance < self.closest_distance_cut0 {
            return Ok(true);
        }

        let daughter_inner = store.cluster(daughter_id)?.inner_layer().unwrap_or(u32::MAX);

        if (closest_distance < self.closest_distance_cut1)
            && (daughter_inner > self.inner_layer_cut1)
        {
            return Ok(true);
        }

        Ok((closest_distance < self.closest_distance_cut2)
            && (daughter_inner > self.inner_layer_cut2))
    }

    fn granularity_distance_cut(store: &EventStore, cluster_id: ClusterId, fine_cut: f64, coarse_cut: f64) -> Result<f64> {
        let cluster = store.cluster(cluster_id)?;

        let Some(inner) = cluster.inner_layer() else {
            return Ok(fine_cut);
        };

        let Some(hit_id) = cluster.ordered_hits().layer_hits(inner).next() else {
            return Ok(fine_cut);
        };

        Ok(match granularity(store.hit(hit_id)?.hit_type()) {
            Granularity::Fine => fine_cut,
            Granularity::Coarse | Granularity::VeryCoarse => coarse_cut,
        })
    }
}

impl Algorithm for SoftClusterMergingAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.track_cluster_association_name =
            builder.create_optional_stage(config, "TrackClusterAssociation")?;
        self.max_hits_in_soft_cluster =
            config.read_or("MaxHitsInSoftCluster", self.max_hits_in_soft_cluster)?;
        self.max_layers_spanned_by_soft_cluster = config.read_or(
            "MaxLayersSpannedBySoftCluster",
            self.max_layers_spanned_by_soft_cluster,
        )?;
        self.max_had_energy_for_soft_cluster_no_track = config.read_or(
            "MaxHadEnergyForSoftClusterNoTrack",
            self.max_had_energy_for_soft_cluster_no_track,
        )?;
        self.min_hits_in_acceptable_cluster =
            config.read_or("MinHitsInCluster", self.min_hits_in_acceptable_cluster)?;
        self.min_cluster_hadronic_energy =
            config.read_or("MinClusterHadEnergy", self.min_cluster_hadronic_energy)?;
        self.min_cluster_em_energy =
            config.read_or("MinClusterEMEnergy", self.min_cluster_em_energy)?;
        self.min_cos_opening_angle =
            config.read_or("MinCosOpeningAngle", self.min_cos_opening_angle)?;
        self.closest_distance_cut0 =
            config.read_or("ClosestDistanceCut0", self.closest_distance_cut0)?;
        self.closest_distance_cut1 =
            config.read_or("ClosestDistanceCut1", self.closest_distance_cut1)?;
        self.inner_layer_cut1 = config.read_or("InnerLayerCut1", self.inner_layer_cut1)?;
        self.closest_distance_cut2 =
            config.read_or("ClosestDistanceCut2", self.closest_distance_cut2)?;
        self.inner_layer_cut2 = config.read_or("InnerLayerCut2", self.inner_layer_cut2)?;
        self.max_cluster_distance_fine =
            config.read_or("MaxClusterDistanceFine", self.max_cluster_distance_fine)?;
        self.max_cluster_distance_coarse =
            config.read_or("MaxClusterDistanceCoarse", self.max_cluster_distance_coarse)?;
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

            if !self.is_soft_cluster(context.store, *daughter_id)? {
                continue;
            }

            let daughter_direction =
                context.store.cluster(*daughter_id)?.initial_direction().ok();

            let mut best: Option<(f64, ClusterId)> = None;

            for parent_id in &candidates {
                if (parent_id == daughter_id) || !context.store.cluster_exists(*parent_id) {
                    continue;
                }

                if !self.is_acceptable_parent(context.store, *parent_id)? {
                    continue;
                }

                if let (Some(daughter_direction), Ok(parent_direction)) = (
                    daughter_direction,
                    context.store.cluster(*parent_id)?.initial_direction(),
                ) {
                    if daughter_direction.cos_opening_angle(&parent_direction).unwrap_or(1.0)
                        < self.min_cos_opening_angle
                    {
                        continue;
                    }
                }

                let Some(distance) = fit::closest_hit_distance(
                    context.store.hits_arena(),
                    context.store.cluster(*daughter_id)?,
                    context.store.cluster(*parent_id)?,
                )?
                else {
                    continue;
                };

                let granularity_cut = Self::granularity_distance_cut(
                    context.store,
                    *daughter_id,
                    self.max_cluster_distance_fine,
                    self.max_cluster_distance_coarse,
                )?;

                if distance > granularity_cut {
                    continue;
                }

                if !self.can_merge_soft_cluster(context.store, *daughter_id, distance)? {
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

    #[test]
    fn nearby_soft_cluster_is_absorbed() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let parent_hits: Vec<_> = (0..10_u32)
            .flat_map(|layer| {
                [-5.0, 5.0].map(|offset| {
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                0.3,
                            ),
                            &detector,
                            None,
                        )
                        .unwrap()
                })
            })
            .collect();
        let parent = store.create_cluster(ClusterSeed::Hits(parent_hits)).unwrap();

        // three hits, two layers, 30 mm away: soft by every measure
        let soft_hits: Vec<_> = [(3_u32, 35.0), (4, 35.0), (4, 45.0)]
            .map(|(layer, offset)| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                offset,
                                0.0,
                            ),
                            0.02,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .to_vec();
        let soft = store.create_cluster(ClusterSeed::Hits(soft_hits)).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        SoftClusterMergingAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(parent));
        assert!(!store.cluster_exists(soft));
        assert_eq!(store.cluster(parent).unwrap().n_calo_hits(), 23);
    }

    #[test]
    fn distant_soft_cluster_survives() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let parent_hits: Vec<_> = (0..10_u32)
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
        let parent = store.create_cluster(ClusterSeed::Hits(parent_hits)).unwrap();

        let soft_hits: Vec<_> = [(3_u32, 600.0), (4, 600.0)]
            .map(|(layer, offset)| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                offset,
                                0.0,
                            ),
                            0.02,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .to_vec();
        let soft = store.create_cluster(ClusterSeed::Hits(soft_hits)).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        SoftClusterMergingAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(parent));
        assert!(store.cluster_exists(soft));
    }
}
