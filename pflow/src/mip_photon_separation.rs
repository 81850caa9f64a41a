//! Mip-photon separation: a track-associated cluster with a clean mip stem followed
//! by a photon-like shower is split in two inside a fragmentation context; the
//! fragments replace the original only when both halves look better than the whole.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::hit::{HitId, HitType};
use super::store::{ClusterSeed, EventStore};

/// The mip-photon separation pass. The registered muon variant applies the same
/// split to muon-flavoured stems.
pub struct MipPhotonSeparationAlgorithm {
    require_muon_stem: bool,
    min_hits_in_cluster: usize,
    min_mip_section_layers: u32,
    min_shower_hits: usize,
    min_stem_mip_fraction: f64,
    min_shower_em_energy: f64,
}

impl MipPhotonSeparationAlgorithm {
    /// The standard configuration splitting mip stems from photon showers.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            require_muon_stem: false,
            min_hits_in_cluster: 12,
            min_mip_section_layers: 5,
            min_shower_hits: 6,
            min_stem_mip_fraction: 0.8,
            min_shower_em_energy: 0.2,
        }
    }

    /// The muon-flavoured configuration.
    #[must_use]
    pub fn muon() -> Self {
        Self {
            require_muon_stem: true,
            ..Self::standard()
        }
    }

    /// Split the cluster's hits at the shower start layer. `None` when either side
    /// would be empty or the stem is too short.
    fn split_at_shower_start(
        &self,
        store: &EventStore,
        cluster_id: ClusterId,
    ) -> Result<Option<(Vec<HitId>, Vec<HitId>)>> {
        let cluster = store.cluster(cluster_id)?;

        let (Some(inner_layer), Some(shower_start)) =
            (cluster.inner_layer(), cluster.shower_start_layer())
        else {
            return Ok(None);
        };

        if shower_start <= inner_layer
            || (shower_start - inner_layer < self.min_mip_section_layers)
        {
            return Ok(None);
        }

        let mut stem_hits = Vec::new();
        let mut shower_hits = Vec::new();

        for (layer, hit_id) in cluster.ordered_hits().hits() {
            if layer < shower_start {
                stem_hits.push(hit_id);
            } else {
                shower_hits.push(hit_id);
            }
        }

        if stem_hits.is_empty() || (shower_hits.len() < self.min_shower_hits) {
            return Ok(None);
        }

        if self.require_muon_stem {
            let muon_flavoured = stem_hits
                .iter()
                .any(|id| store.hit(*id).is_ok_and(|hit| hit.hit_type() == HitType::Muon));

            if !muon_flavoured {
                return Ok(None);
            }
        }

        Ok(Some((stem_hits, shower_hits)))
    }
}

impl Algorithm for MipPhotonSeparationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.min_hits_in_cluster = config.read_or("MinHitsInCluster", self.min_hits_in_cluster)?;
        self.min_mip_section_layers =
            config.read_or("MinMipSectionLayers", self.min_mip_section_layers)?;
        self.min_shower_hits = config.read_or("MinShowerHits", self.min_shower_hits)?;
        self.min_stem_mip_fraction =
            config.read_or("MinStemMipFraction", self.min_stem_mip_fraction)?;
        self.min_shower_em_energy =
            config.read_or("MinShowerEmEnergy", self.min_shower_em_energy)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for cluster_id in context.store.current_cluster_ids()? {
            if !context.store.cluster_exists(cluster_id) {
                continue;
            }

            {
                let cluster = context.store.cluster(cluster_id)?;

                if cluster.associated_tracks().is_empty()
                    || (cluster.n_calo_hits() < self.min_hits_in_cluster)
                {
                    continue;
                }
            }

            let Some((stem_hits, shower_hits)) =
                self.split_at_shower_start(context.store, cluster_id)?
            else {
                continue;
            };

            let associated_tracks =
                context.store.cluster(cluster_id)?.associated_tracks().to_vec();

            let (original_list, fragment_list) =
                context.store.begin_fragmentation(vec![cluster_id])?;

            let stem = context.store.create_cluster(ClusterSeed::Hits(stem_hits))?;
            let shower = context.store.create_cluster(ClusterSeed::Hits(shower_hits))?;

            let stem_is_mip =
                context.store.cluster(stem)?.mip_fraction() >= self.min_stem_mip_fraction;
            let shower_is_photon_like = context.store.cluster(shower)?.electromagnetic_energy()
                >= self.min_shower_em_energy;

            if stem_is_mip && shower_is_photon_like {
                context.store.end_fragmentation(&fragment_list)?;
                context.store.cluster_mut(shower)?.set_fixed_photon(true);

                // the track follows the mip stem
                for track_id in associated_tracks {
                    if context.store.track(track_id)?.associated_cluster().is_none() {
                        context.store.add_track_cluster_association(track_id, stem)?;
                    }
                }
            } else {
                context.store.end_fragmentation(&original_list)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmPool;
    use crate::testing;
    use crate::vector::CartesianVector;

    #[test]
    fn stem_and_shower_are_separated() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let mut hits = Vec::new();

        // clean mip stem over layers 1-8
        for layer in 0..8_u32 {
            let mut parameters = testing::ecal_hit(
                CartesianVector::new(5.0_f64.mul_add(f64::from(layer), 1500.0), 0.0, 0.0),
                0.02,
            );
            parameters.is_possible_mip = true;
            hits.push(store.create_calo_hit(parameters, &detector, None).unwrap());
        }

        // photon-like blob over layers 9-14
        for layer in 8..14_u32 {
            for offset in [-8.0, 0.0, 8.0] {
                hits.push(
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
                        .unwrap(),
                );
            }
        }

        let cluster = store.create_cluster(ClusterSeed::Hits(hits)).unwrap();
        let track = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(6.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.add_track_cluster_association(track, cluster).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        MipPhotonSeparationAlgorithm::standard().run(&mut context).unwrap();

        // the original was split: the track now points at an eight-hit mip stem
        assert!(!store.cluster_exists(cluster));
        let stem = store.track(track).unwrap().associated_cluster().unwrap();
        assert_eq!(store.cluster(stem).unwrap().n_calo_hits(), 8);

        let current = store.current_cluster_ids().unwrap();
        assert_eq!(current.len(), 2);
        assert!(current
            .iter()
            .any(|id| store.cluster(*id).unwrap().is_fixed_photon()));
    }

    #[test]
    fn short_stem_is_left_intact() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let mut hits = Vec::new();
        for layer in 0..14_u32 {
            for offset in [-8.0, 0.0, 8.0] {
                hits.push(
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
                        .unwrap(),
                );
            }
        }

        let cluster = store.create_cluster(ClusterSeed::Hits(hits)).unwrap();
        let track = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(6.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.add_track_cluster_association(track, cluster).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        MipPhotonSeparationAlgorithm::standard().run(&mut context).unwrap();

        assert!(store.cluster_exists(cluster));
        assert_eq!(store.track(track).unwrap().associated_cluster(), Some(cluster));
    }
}
