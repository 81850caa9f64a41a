//! Muon-cluster association: yoke clusters left over after the dedicated muon
//! reconstruction are attached, as isolated hits, to the calorimeter cluster they
//! point back to.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit;

/// The muon-cluster association pass.
pub struct MuonClusterAssociationAlgorithm {
    muon_cluster_list_name: String,
    max_hits_in_muon_cluster: usize,
    min_cos_opening_angle: f64,
    max_fit_distance_to_cluster: f64,
}

impl Default for MuonClusterAssociationAlgorithm {
    fn default() -> Self {
        Self {
            muon_cluster_list_name: "MuonClusters".to_owned(),
            max_hits_in_muon_cluster: 30,
            min_cos_opening_angle: 0.95,
            max_fit_distance_to_cluster: 500.0,
        }
    }
}

impl Algorithm for MuonClusterAssociationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.muon_cluster_list_name =
            config.read_or("MuonClusterListName", self.muon_cluster_list_name.clone())?;
        self.max_hits_in_muon_cluster =
            config.read_or("MaxHitsInMuonCluster", self.max_hits_in_muon_cluster)?;
        self.min_cos_opening_angle =
            config.read_or("MinCosOpeningAngle", self.min_cos_opening_angle)?;
        self.max_fit_distance_to_cluster =
            config.read_or("MaxFitDistanceToCluster", self.max_fit_distance_to_cluster)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        // nothing to do when no muon clusters were formed
        let Ok(muon_ids) = context
            .store
            .cluster_list(&self.muon_cluster_list_name)
            .map(<[ClusterId]>::to_vec)
        else {
            return Ok(());
        };

        let calo_ids = context.store.current_cluster_ids()?;

        for muon_id in muon_ids {
            if !context.store.cluster_exists(muon_id) {
                continue;
            }

            {
                let muon_cluster = context.store.cluster(muon_id)?;

                if !muon_cluster.associated_tracks().is_empty()
                    || (muon_cluster.n_calo_hits() > self.max_hits_in_muon_cluster)
                {
                    continue;
                }
            }

            let muon_direction = context.store.cluster(muon_id)?.initial_direction()?;

            let mut best: Option<(f64, ClusterId)> = None;

            for calo_id in &calo_ids {
                if !context.store.cluster_exists(*calo_id) {
                    continue;
                }

                let calo_direction = context.store.cluster(*calo_id)?.initial_direction()?;

                if muon_direction.cos_opening_angle(&calo_direction)? < self.min_cos_opening_angle
                {
                    continue;
                }

                // distance of the calo cluster's outer centroid from the line the
                // yoke cluster points back along
                let calo_cluster = context.store.cluster(*calo_id)?;
                let Some(calo_outer) = calo_cluster.outer_layer() else {
                    continue;
                };
                let calo_outer_centroid = calo_cluster.centroid(calo_outer)?;

                let muon_cluster = context.store.cluster(muon_id)?;
                let Some(muon_inner) = muon_cluster.inner_layer() else {
                    continue;
                };
                let muon_inner_centroid = muon_cluster.centroid(muon_inner)?;

                let distance = fit::perpendicular_distance(
                    &calo_outer_centroid,
                    &muon_inner_centroid,
                    &muon_direction,
                );

                if (distance < self.max_fit_distance_to_cluster)
                    && best.is_none_or(|(current, _)| distance < current)
                {
                    best = Some((distance, *calo_id));
                }
            }

            if let Some((_, calo_id)) = best {
                // the yoke hits join the calorimeter cluster as isolated hits
                let muon_hits: Vec<_> = context
                    .store
                    .cluster(muon_id)?
                    .ordered_hits()
                    .hits()
                    .map(|(_, id)| id)
                    .collect();

                context.store.delete_cluster(muon_id)?;

                for hit_id in muon_hits {
                    context.store.add_isolated_hit_to_cluster(calo_id, hit_id)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmPool;
    use crate::hit::HitType;
    use crate::store::{ClusterSeed, EventStore};
    use crate::testing;
    use crate::vector::CartesianVector;

    #[test]
    fn leftover_yoke_cluster_joins_aligned_calo_cluster() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let calo_hits: Vec<_> = (0..10_u32)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(5.0_f64.mul_add(f64::from(layer), 1500.0), 0.0, 0.0),
                            0.2,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        let calo = store.create_cluster(ClusterSeed::Hits(calo_hits)).unwrap();

        store.create_cluster_list("MuonClusters").unwrap();
        store.replace_current_cluster_list("MuonClusters").unwrap();
        let muon_hits: Vec<_> = (0..5_u32)
            .map(|layer| {
                let mut parameters = testing::ecal_hit(
                    CartesianVector::new(50.0_f64.mul_add(f64::from(layer), 3100.0), 0.0, 0.0),
                    0.02,
                );
                parameters.hit_type = HitType::Muon;
                store.create_calo_hit(parameters, &detector, None).unwrap()
            })
            .collect();
        let muon = store.create_cluster(ClusterSeed::Hits(muon_hits)).unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        MuonClusterAssociationAlgorithm::default().run(&mut context).unwrap();

        assert!(!store.cluster_exists(muon));
        assert_eq!(store.cluster(calo).unwrap().n_isolated_hits(), 5);
    }
}
