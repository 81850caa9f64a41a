//! Muon reconstruction: clusters the dedicated muon-yoke hits, associates each yoke
//! cluster to one quality track by propagating its helix across the coil, attaches
//! compatible calorimeter hits, emits the muon PFOs and removes everything consumed
//! from the downstream track and hit lists.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit;
use super::helix::Helix;
use super::hit::HitId;
use super::pfo::PfoParameters;
use super::pids;
use super::track::TrackId;
use super::vector::CartesianVector;

/// The muon reconstruction stage.
pub struct MuonReconstructionAlgorithm {
    muon_clustering_name: Option<String>,
    muon_hit_list_name: String,
    output_muon_cluster_list_name: String,
    output_track_list_name: String,
    output_hit_list_name: String,
    max_cluster_calo_hits: usize,
    min_cluster_occupied_layers: usize,
    min_cluster_layer_span: u32,
    n_cluster_layers_to_fit: usize,
    min_track_candidate_energy: f64,
    max_distance_to_track: f64,
    min_helix_cluster_cos_angle: f64,
    max_calo_hit_helix_distance: f64,
}

impl Default for MuonReconstructionAlgorithm {
    fn default() -> Self {
        Self {
            muon_clustering_name: None,
            muon_hit_list_name: "MuonYokeHits".to_owned(),
            output_muon_cluster_list_name: "MuonClusters".to_owned(),
            output_track_list_name: "MuonRemovedTracks".to_owned(),
            output_hit_list_name: "MuonRemovedCaloHits".to_owned(),
            max_cluster_calo_hits: 30,
            min_cluster_occupied_layers: 5,
            min_cluster_layer_span: 5,
            n_cluster_layers_to_fit: 100,
            min_track_candidate_energy: 7.0,
            max_distance_to_track: 200.0,
            min_helix_cluster_cos_angle: 0.98,
            max_calo_hit_helix_distance: 100.0,
        }
    }
}

impl MuonReconstructionAlgorithm {
    /// Entry point of the trajectory into the muon system, re-propagated with the
    /// return field beyond the coil.
    fn muon_entry_helix(
        &self,
        context: &EventContext<'_>,
        helix: &Helix,
        is_positive_z: bool,
    ) -> Result<(Helix, CartesianVector)> {
        let muon_barrel_inner_r = context.detector.muon_barrel().inner_r;
        let muon_endcap_inner_z = context.detector.muon_endcap().inner_z;
        let coil_mid_r = context.detector.coil_mid_r();

        let entry_point = helix.point_on_circle(muon_barrel_inner_r).or_else(|_| {
            helix.point_in_z(if is_positive_z { muon_endcap_inner_z } else { -muon_endcap_inner_z })
        })?;

        if entry_point.perp() <= coil_mid_r {
            return Ok((helix.clone(), entry_point));
        }

        // re-fit at the coil midpoint with the external field
        let coil_point = helix.point_on_circle(coil_mid_r)?;
        let coil_momentum = helix.extrapolated_momentum(&coil_point);
        let external_bfield = context.detector.bfield(&CartesianVector::new(
            context.detector.muon_barrel().inner_r,
            0.0,
            0.0,
        ))?;

        let charge = if external_bfield < 0.0 { -helix.charge() } else { helix.charge() };
        let external_helix =
            Helix::new(coil_point, coil_momentum, charge, external_bfield.abs())?;

        let corrected_entry = external_helix
            .point_on_circle(muon_barrel_inner_r)
            .or_else(|_| {
                external_helix.point_in_z(if is_positive_z {
                    muon_endcap_inner_z
                } else {
                    -muon_endcap_inner_z
                })
            })?;

        Ok((external_helix, corrected_entry))
    }

    fn associate_muon_tracks(
        &self,
        context: &mut EventContext<'_>,
        muon_cluster_ids: &[ClusterId],
    ) -> Result<()> {
        let track_ids = context.store.current_track_ids()?;

        for cluster_id in muon_cluster_ids {
            {
                let cluster = context.store.cluster(*cluster_id)?;

                if (cluster.n_calo_hits() > self.max_cluster_calo_hits)
                    || (cluster.n_occupied_layers() < self.min_cluster_occupied_layers)
                    || (cluster.layer_span() < self.min_cluster_layer_span)
                {
                    continue;
                }
            }

            let cluster_fit = fit::fit_start(
                context.store.hits_arena(),
                context.store.cluster(*cluster_id)?,
                self.n_cluster_layers_to_fit,
            )?;

            if !cluster_fit.is_successful() {
                continue;
            }

            let cluster = context.store.cluster(*cluster_id)?;
            let Some(inner_layer) = cluster.inner_layer() else {
                continue;
            };
            let inner_centroid = cluster.centroid(inner_layer)?;
            let is_positive_z = inner_centroid.z > 0.0;

            let mut best: Option<(f64, f64, TrackId)> = None;

            for track_id in &track_ids {
                let track = context.store.track(*track_id)?;

                if track.has_associated_cluster()
                    || !track.can_form_pfo()
                    || !track.daughters().is_empty()
                    || (track.energy_at_dca() < self.min_track_candidate_energy)
                {
                    continue;
                }

                if track.is_projected_to_endcap()
                    && (track.calorimeter_state().position.z * inner_centroid.z < 0.0)
                {
                    continue;
                }

                let Some(helix) = track.helix_at_calorimeter() else {
                    continue;
                };

                let Ok((external_helix, entry_point)) =
                    self.muon_entry_helix(context, helix, is_positive_z)
                else {
                    continue;
                };

                let helix_direction = external_helix.extrapolated_momentum(&entry_point);
                let cos_angle = helix_direction
                    .cos_opening_angle(&cluster_fit.direction()?)
                    .unwrap_or(-1.0);

                if cos_angle < self.min_helix_cluster_cos_angle {
                    continue;
                }

                let distance = external_helix.distance_to_point(&inner_centroid).z;
                let energy = context.store.track(*track_id)?.energy_at_dca();

                let better = best.as_ref().is_none_or(|(best_distance, best_energy, _)| {
                    (distance < *best_distance)
                        || ((distance == *best_distance) && (energy > *best_energy))
                });

                if (distance < self.max_distance_to_track) && better {
                    best = Some((distance, energy, *track_id));
                }
            }

            if let Some((_, _, track_id)) = best {
                context.store.add_track_cluster_association(track_id, *cluster_id)?;
            }
        }

        Ok(())
    }

    /// Attach calorimeter hits lying along the muon trajectory to the muon cluster.
    fn add_calo_hits(
        &self,
        context: &mut EventContext<'_>,
        muon_cluster_ids: &[ClusterId],
        calo_hit_list_name: &str,
    ) -> Result<()> {
        for cluster_id in muon_cluster_ids {
            let tracks = context.store.cluster(*cluster_id)?.associated_tracks().to_vec();

            let Some(track_id) = tracks.first() else {
                continue;
            };

            let Some(helix) = context.store.track(*track_id)?.helix_at_calorimeter().cloned()
            else {
                continue;
            };

            for (_, hit_id) in context.store.hit_list(calo_hit_list_name)?.clone().hits() {
                if !context.store.is_hit_available(hit_id) {
                    continue;
                }

                let hit = context.store.hit(hit_id)?;

                if hit.is_isolated() {
                    continue;
                }

                let distance = helix.distance_to_point(hit.position()).z;

                if distance < self.max_calo_hit_helix_distance {
                    context.store.add_hit_to_cluster(*cluster_id, hit_id)?;
                }
            }
        }

        Ok(())
    }

    fn create_muon_pfos(
        context: &mut EventContext<'_>,
        muon_cluster_ids: &[ClusterId],
    ) -> Result<()> {
        for cluster_id in muon_cluster_ids {
            let tracks = context.store.cluster(*cluster_id)?.associated_tracks().to_vec();

            let [track_id] = tracks.as_slice() else {
                continue;
            };

            let track = context.store.track(*track_id)?;
            let particle_id = if track.charge() > 0 { pids::MU_PLUS } else { pids::MU_MINUS };

            let parameters = PfoParameters {
                particle_id,
                charge: track.charge(),
                mass: pids::particle_mass(pids::MU_MINUS).unwrap_or(0.0),
                energy: track.energy_at_dca(),
                momentum: *track.momentum_at_dca(),
                clusters: vec![*cluster_id],
                tracks: vec![*track_id],
            };

            context.store.create_pfo(parameters)?;
        }

        Ok(())
    }

    /// Rebuild the downstream track and hit lists without the consumed objects.
    fn tidy_lists(
        &self,
        context: &mut EventContext<'_>,
        muon_cluster_ids: &[ClusterId],
        input_track_list: &str,
        input_hit_list: &str,
    ) -> Result<()> {
        let mut used_tracks: Vec<TrackId> = Vec::new();
        let mut used_hits: Vec<HitId> = Vec::new();

        for cluster_id in muon_cluster_ids {
            let cluster = context.store.cluster(*cluster_id)?;
            used_tracks.extend_from_slice(cluster.associated_tracks());
            used_hits.extend(cluster.ordered_hits().hits().map(|(_, id)| id));
            used_hits.extend_from_slice(cluster.isolated_hits());
        }

        let remaining_tracks: Vec<TrackId> = context
            .store
            .track_list(input_track_list)?
            .iter()
            .copied()
            .filter(|id| !used_tracks.contains(id))
            .collect();
        context.store.save_track_list(&self.output_track_list_name, &remaining_tracks)?;
        context.store.replace_current_track_list(&self.output_track_list_name)?;

        let remaining_hits: Vec<HitId> = context
            .store
            .hit_list(input_hit_list)?
            .hits()
            .map(|(_, id)| id)
            .filter(|id| !used_hits.contains(id))
            .collect();
        context.store.create_hit_list(&self.output_hit_list_name, remaining_hits)?;
        context.store.replace_current_hit_list(&self.output_hit_list_name)?;

        Ok(())
    }
}

impl Algorithm for MuonReconstructionAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.muon_clustering_name = match builder.create_optional_stage(config, "MuonClustering")? {
            Some(name) => Some(name),
            None => Some(builder.create_stage(&Config::from_yaml_str(
                "type: ConeClustering\nClusterSeedStrategy: 0\nShouldUseTrackSeed: false\n",
            )?)?),
        };

        self.muon_hit_list_name =
            config.read_or("MuonCaloHitListName", self.muon_hit_list_name.clone())?;
        self.output_muon_cluster_list_name = config.read_or(
            "OutputMuonClusterListName",
            self.output_muon_cluster_list_name.clone(),
        )?;
        self.output_track_list_name =
            config.read_or("OutputTrackListName", self.output_track_list_name.clone())?;
        self.output_hit_list_name =
            config.read_or("OutputCaloHitListName", self.output_hit_list_name.clone())?;
        self.max_cluster_calo_hits =
            config.read_or("MaxClusterCaloHits", self.max_cluster_calo_hits)?;
        self.min_cluster_occupied_layers =
            config.read_or("MinClusterOccupiedLayers", self.min_cluster_occupied_layers)?;
        self.min_cluster_layer_span =
            config.read_or("MinClusterLayerSpan", self.min_cluster_layer_span)?;
        self.n_cluster_layers_to_fit =
            config.read_or("NClusterLayersToFit", self.n_cluster_layers_to_fit)?;
        self.min_track_candidate_energy =
            config.read_or("MinTrackCandidateEnergy", self.min_track_candidate_energy)?;
        self.max_distance_to_track =
            config.read_or("MaxDistanceToTrack", self.max_distance_to_track)?;
        self.min_helix_cluster_cos_angle =
            config.read_or("MinHelixClusterCosAngle", self.min_helix_cluster_cos_angle)?;
        self.max_calo_hit_helix_distance =
            config.read_or("MaxCaloHitHelixDistance", self.max_calo_hit_helix_distance)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let input_track_list = context.store.current_track_list_name()?.to_owned();
        let input_hit_list = context.store.current_hit_list_name()?.to_owned();

        // nothing to do without yoke hits
        if context
            .store
            .hit_list(&self.muon_hit_list_name)
            .map_or(true, super::hit::OrderedCaloHitList::is_empty)
        {
            return Ok(());
        }

        // cluster the muon hits
        context.store.replace_current_hit_list(&self.muon_hit_list_name)?;
        let clustering_name = self
            .muon_clustering_name
            .clone()
            .ok_or(super::error::Error::NotInitialized("muon clustering stage"))?;
        let temporary_list = context.run_clustering_stage(&clustering_name)?;

        context
            .store
            .save_cluster_list_from(&temporary_list, &self.output_muon_cluster_list_name)?;
        context.store.remove_cluster_list(&temporary_list)?;
        context.store.replace_current_hit_list(&input_hit_list)?;

        let muon_cluster_ids = context
            .store
            .cluster_list(&self.output_muon_cluster_list_name)?
            .to_vec();

        if !muon_cluster_ids.is_empty() {
            self.associate_muon_tracks(context, &muon_cluster_ids)?;
            self.add_calo_hits(context, &muon_cluster_ids, &input_hit_list)?;
            Self::create_muon_pfos(context, &muon_cluster_ids)?;
        }

        self.tidy_lists(context, &muon_cluster_ids, &input_track_list, &input_hit_list)?;

        Ok(())
    }
}
