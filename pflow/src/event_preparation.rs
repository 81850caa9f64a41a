//! Event preparation: splits the input hits into calorimeter and muon-yoke lists and
//! selects the daughterless tracks used to seed clustering.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::config::Config;
use super::error::Result;
use super::hit::HitType;

/// First stage of the pipeline. Reads the input hit and track lists, writes the
/// working lists every later stage consumes, and designates them current.
pub struct EventPreparationAlgorithm {
    calo_hit_list_name: String,
    muon_hit_list_name: String,
    selected_track_list_name: String,
}

impl Default for EventPreparationAlgorithm {
    fn default() -> Self {
        Self {
            calo_hit_list_name: "CaloHits".to_owned(),
            muon_hit_list_name: "MuonYokeHits".to_owned(),
            selected_track_list_name: "ClusteringTracks".to_owned(),
        }
    }
}

impl Algorithm for EventPreparationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.calo_hit_list_name =
            config.read_or("CaloHitListName", self.calo_hit_list_name.clone())?;
        self.muon_hit_list_name =
            config.read_or("MuonHitListName", self.muon_hit_list_name.clone())?;
        self.selected_track_list_name =
            config.read_or("SelectedTrackListName", self.selected_track_list_name.clone())?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let mut calo_hits = Vec::new();
        let mut muon_hits = Vec::new();

        for (_, hit_id) in context.store.current_ordered_hits()?.hits() {
            if context.store.hit(hit_id)?.hit_type() == HitType::Muon {
                muon_hits.push(hit_id);
            } else {
                calo_hits.push(hit_id);
            }
        }

        log::debug!(
            "event preparation: {} calorimeter hits, {} muon hits",
            calo_hits.len(),
            muon_hits.len()
        );

        context.store.create_hit_list(&self.calo_hit_list_name, calo_hits)?;
        context.store.create_hit_list(&self.muon_hit_list_name, muon_hits)?;
        context.store.replace_current_hit_list(&self.calo_hit_list_name)?;

        // tracks with daughters re-enter later through their decay products
        let selected: Vec<_> = context
            .store
            .current_track_ids()?
            .into_iter()
            .filter(|id| {
                context
                    .store
                    .track(*id)
                    .is_ok_and(|track| track.daughters().is_empty())
            })
            .collect();

        context.store.save_track_list(&self.selected_track_list_name, &selected)?;
        context.store.replace_current_track_list(&self.selected_track_list_name)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmPool;
    use crate::hit::HitType;
    use crate::store::EventStore;
    use crate::testing;
    use crate::vector::CartesianVector;

    #[test]
    fn hits_are_split_and_daughter_tracks_selected() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();

        let calo_hit = store
            .create_calo_hit(
                testing::ecal_hit(CartesianVector::new(1500.0, 0.0, 0.0), 1.0),
                &detector,
                None,
            )
            .unwrap();
        let mut muon_parameters =
            testing::ecal_hit(CartesianVector::new(3200.0, 0.0, 0.0), 0.1);
        muon_parameters.hit_type = HitType::Muon;
        let muon_hit = store.create_calo_hit(muon_parameters, &detector, None).unwrap();

        store.create_hit_list("Input", vec![calo_hit, muon_hit]).unwrap();
        store.replace_current_hit_list("Input").unwrap();

        let parent = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(2.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        let daughter = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(1.7, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.set_track_parent_daughter(parent, daughter).unwrap();
        store.save_track_list("InputTracks", &[parent, daughter]).unwrap();
        store.replace_current_track_list("InputTracks").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        EventPreparationAlgorithm::default().run(&mut context).unwrap();

        assert_eq!(store.current_hit_list_name().unwrap(), "CaloHits");
        assert_eq!(store.hit_list("CaloHits").unwrap().n_hits(), 1);
        assert_eq!(store.hit_list("MuonYokeHits").unwrap().n_hits(), 1);
        assert_eq!(store.track_list("ClusteringTracks").unwrap(), &[daughter]);
        assert_eq!(store.current_track_list_name().unwrap(), "ClusteringTracks");
    }
}
