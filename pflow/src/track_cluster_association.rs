//! Track-cluster association: matches each quality track to the cluster closest to
//! its projected trajectory at the calorimeter.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit::perpendicular_distance;
use super::store::EventStore;
use super::track::TrackId;

/// The association stage. Runs over the current track and cluster lists, replacing
/// any previous associations.
pub struct TrackClusterAssociationAlgorithm {
    low_energy_cut: f64,
    max_track_cluster_distance: f64,
    max_search_layer: u32,
    parallel_distance_cut: f64,
}

impl Default for TrackClusterAssociationAlgorithm {
    fn default() -> Self {
        Self {
            low_energy_cut: 0.25,
            max_track_cluster_distance: 10.0,
            max_search_layer: 9,
            parallel_distance_cut: 100.0,
        }
    }
}

/// Distance of closest approach between the projected track direction at the
/// calorimeter and the hits of a cluster, examining pseudo layers up to
/// `max_search_layer` only. `None` when no hit qualifies.
///
/// # Errors
///
/// Propagates unknown ids and degenerate track states.
pub fn track_cluster_distance(
    store: &EventStore,
    track_id: TrackId,
    cluster_id: ClusterId,
    max_search_layer: u32,
    parallel_distance_cut: f64,
) -> Result<Option<f64>> {
    let track = store.track(track_id)?;
    let state = track.calorimeter_state();
    let direction = state.momentum.unit_vector()?;

    let cluster = store.cluster(cluster_id)?;
    let mut best: Option<f64> = None;

    for (layer, hit_id) in cluster.ordered_hits().hits() {
        if layer > max_search_layer {
            break;
        }

        let hit = store.hit(hit_id)?;
        let difference = *hit.position() - state.position;

        if direction.dot(&difference).abs() > parallel_distance_cut {
            continue;
        }

        let distance = perpendicular_distance(hit.position(), &state.position, &direction);

        if best.is_none_or(|current| distance < current) {
            best = Some(distance);
        }
    }

    Ok(best)
}

impl Algorithm for TrackClusterAssociationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.low_energy_cut = config.read_or("LowEnergyCut", self.low_energy_cut)?;
        self.max_track_cluster_distance =
            config.read_or("MaxTrackClusterDistance", self.max_track_cluster_distance)?;
        self.max_search_layer = config.read_or("MaxSearchLayer", self.max_search_layer)?;
        self.parallel_distance_cut =
            config.read_or("ParallelDistanceCut", self.parallel_distance_cut)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        context.store.remove_current_track_cluster_associations()?;

        let cluster_ids = context.store.current_cluster_ids()?;

        for track_id in context.store.current_track_ids()? {
            let track = context.store.track(track_id)?;

            if !track.reaches_calorimeter() || !track.can_form_pfo() {
                continue;
            }

            let mut best_high: Option<(f64, ClusterId)> = None;
            let mut best_low: Option<(f64, ClusterId)> = None;

            for cluster_id in &cluster_ids {
                if context.store.cluster(*cluster_id)?.n_calo_hits() == 0 {
                    continue;
                }

                let Some(distance) = track_cluster_distance(
                    context.store,
                    track_id,
                    *cluster_id,
                    self.max_search_layer,
                    self.parallel_distance_cut,
                )?
                else {
                    continue;
                };

                if distance >= self.max_track_cluster_distance {
                    continue;
                }

                let energetic = context.store.cluster(*cluster_id)?.hadronic_energy()
                    > self.low_energy_cut;
                let slot = if energetic { &mut best_high } else { &mut best_low };

                if slot.as_ref().is_none_or(|(current, _)| distance < *current) {
                    *slot = Some((distance, *cluster_id));
                }
            }

            // prefer clusters carrying real energy over soft fragments
            if let Some((_, cluster_id)) = best_high.or(best_low) {
                context.store.add_track_cluster_association(track_id, cluster_id)?;
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

    fn line_of_hits(
        store: &mut EventStore,
        detector: &crate::geometry::Detector,
        offset_y: f64,
        energy: f64,
    ) -> Vec<crate::hit::HitId> {
        (0..8_u32)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                offset_y,
                                0.0,
                            ),
                            energy,
                        ),
                        detector,
                        None,
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn track_associates_with_aligned_cluster() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();

        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let near_hits = line_of_hits(&mut store, &detector, 3.0, 0.5);
        let near = store.create_cluster(ClusterSeed::Hits(near_hits)).unwrap();
        let far_hits = line_of_hits(&mut store, &detector, 400.0, 0.5);
        let far = store.create_cluster(ClusterSeed::Hits(far_hits)).unwrap();

        let track = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(10.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.save_track_list("Tracks", &[track]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        TrackClusterAssociationAlgorithm::default().run(&mut context).unwrap();

        assert_eq!(store.track(track).unwrap().associated_cluster(), Some(near));
        assert!(store.cluster(near).unwrap().associated_tracks().contains(&track));
        assert!(store.cluster(far).unwrap().associated_tracks().is_empty());
    }

    #[test]
    fn energetic_cluster_wins_over_closer_soft_fragment() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();

        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let soft_hits = line_of_hits(&mut store, &detector, 1.0, 0.01);
        let soft = store.create_cluster(ClusterSeed::Hits(soft_hits)).unwrap();
        let energetic_hits = line_of_hits(&mut store, &detector, 5.0, 1.0);
        let energetic = store.create_cluster(ClusterSeed::Hits(energetic_hits)).unwrap();

        let track = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(10.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.save_track_list("Tracks", &[track]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        TrackClusterAssociationAlgorithm::default().run(&mut context).unwrap();

        assert_eq!(store.track(track).unwrap().associated_cluster(), Some(energetic));
        assert!(store.cluster(soft).unwrap().associated_tracks().is_empty());
    }
}
