//! Reclustering: clusters whose energy is incompatible with their associated tracks
//! are re-partitioned inside a transactional context; the chi-squared-best candidate
//! partition is committed, or the originals restored.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fragment_removal::{cluster_contact_details, fraction_of_hits_in_cone};
use super::store::EventStore;
use super::track::TrackId;

/// Compatibility chi between a cluster energy and the energy of its associated
/// tracks: negative when the cluster energy falls short of the track expectation.
/// The spread is parameterised as `resolution * sqrt(track energy)`.
#[must_use]
pub fn track_cluster_compatibility(
    cluster_energy: f64,
    track_energy_sum: f64,
    energy_resolution: f64,
) -> f64 {
    let sigma = energy_resolution * track_energy_sum.max(0.0).sqrt();

    if sigma <= 0.0 {
        return f64::MAX;
    }

    (cluster_energy - track_energy_sum) / sigma
}

/// Figures of merit for one recluster candidate partition.
#[derive(Clone, Copy, Debug)]
pub struct ReclusterResult {
    /// Combined chi of all track-associated clusters.
    pub chi: f64,
    /// Chi squared per track-associated cluster.
    pub chi2_per_dof: f64,
    /// Smallest energy among track-associated clusters, in GeV.
    pub min_track_association_energy: f64,
    /// Number of track associations beyond one per cluster.
    pub n_excess_track_associations: usize,
    /// Context tracks left without any association.
    pub n_unassociated_tracks: usize,
}

/// Evaluate the candidate partition currently held in `cluster_ids`. `None` when no
/// cluster carries a track association.
///
/// # Errors
///
/// Propagates unknown ids.
pub fn extract_recluster_results(
    store: &EventStore,
    cluster_ids: &[ClusterId],
    context_tracks: &[TrackId],
    energy_resolution: f64,
) -> Result<Option<ReclusterResult>> {
    let mut chi_sum = 0.0;
    let mut chi2_sum = 0.0;
    let mut dof = 0usize;
    let mut min_energy = f64::MAX;
    let mut n_excess = 0usize;

    for cluster_id in cluster_ids {
        if !store.cluster_exists(*cluster_id) {
            continue;
        }

        let cluster = store.cluster(*cluster_id)?;
        let tracks = cluster.associated_tracks();

        if tracks.is_empty() {
            continue;
        }

        let track_energy_sum: f64 = tracks
            .iter()
            .map(|id| store.track(*id).map(super::track::Track::energy_at_dca))
            .sum::<Result<f64>>()?;

        let chi = track_cluster_compatibility(
            cluster.hadronic_energy(),
            track_energy_sum,
            energy_resolution,
        );

        chi_sum += chi;
        chi2_sum += chi * chi;
        dof += 1;
        min_energy = min_energy.min(cluster.hadronic_energy());
        n_excess += tracks.len() - 1;
    }

    if dof == 0 {
        return Ok(None);
    }

    let n_unassociated = context_tracks
        .iter()
        .filter(|id| store.track(**id).is_ok_and(|track| !track.has_associated_cluster()))
        .count();

    Ok(Some(ReclusterResult {
        chi: chi_sum,
        chi2_per_dof: chi2_sum / dof as f64,
        min_track_association_energy: min_energy,
        n_excess_track_associations: n_excess,
        n_unassociated_tracks: n_unassociated,
    }))
}

/// The reclustering driver resolving clusters with multiple track associations.
pub struct ResolveTrackAssociationsAlgorithm {
    clustering_names: Vec<String>,
    association_name: Option<String>,
    track_association_name: String,
    min_track_associations: usize,
    max_track_associations: usize,
    chi_to_attempt_reclustering: f64,
    cone_cosine_half_angle: f64,
    min_cone_fraction: f64,
    contact_distance_threshold: f64,
    min_contact_layers: u32,
    min_cluster_energy_for_track_association: f64,
    chi2_for_automatic_cluster_selection: f64,
    should_use_best_guess_candidates: bool,
    hadronic_energy_resolution: f64,
}

impl Default for ResolveTrackAssociationsAlgorithm {
    fn default() -> Self {
        Self {
            clustering_names: Vec::new(),
            association_name: None,
            track_association_name: String::new(),
            min_track_associations: 2,
            max_track_associations: usize::MAX,
            chi_to_attempt_reclustering: -3.0,
            cone_cosine_half_angle: 0.9,
            min_cone_fraction: 0.2,
            contact_distance_threshold: 2.0,
            min_contact_layers: 2,
            min_cluster_energy_for_track_association: 0.1,
            chi2_for_automatic_cluster_selection: 1.0,
            should_use_best_guess_candidates: false,
            hadronic_energy_resolution: 0.6,
        }
    }
}

impl ResolveTrackAssociationsAlgorithm {
    /// Greedily add trackless companion clusters contained in the parent's forward
    /// cone or in tight layer contact with it.
    fn select_companions(
        &self,
        store: &mut EventStore,
        parent_id: ClusterId,
        cluster_ids: &[ClusterId],
        selection: &mut Vec<ClusterId>,
    ) -> Result<()> {
        for candidate_id in cluster_ids {
            if (*candidate_id == parent_id) || !store.cluster_exists(*candidate_id) {
                continue;
            }

            if !store.cluster(*candidate_id)?.associated_tracks().is_empty() {
                continue;
            }

            let in_cone = fraction_of_hits_in_cone(
                store,
                *candidate_id,
                parent_id,
                self.cone_cosine_half_angle,
            )? > self.min_cone_fraction;

            let in_contact = {
                let (n_contact_layers, _) = cluster_contact_details(
                    store,
                    *candidate_id,
                    parent_id,
                    self.contact_distance_threshold,
                )?;
                n_contact_layers > self.min_contact_layers
            };

            if in_cone || in_contact {
                selection.push(*candidate_id);
            }
        }

        Ok(())
    }
}

impl Algorithm for ResolveTrackAssociationsAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.clustering_names = builder.create_stage_list(config, "clusteringAlgorithms")?;

        if self.clustering_names.is_empty() {
            self.clustering_names
                .push(builder.create_stage(&Config::from_yaml_str("type: ConeClustering")?)?);
        }

        self.association_name = builder.create_optional_stage(config, "ClusterAssociation")?;

        self.track_association_name = match builder
            .create_optional_stage(config, "TrackClusterAssociation")?
        {
            Some(name) => name,
            None => builder.create_stage(&Config::from_yaml_str("type: TrackClusterAssociation")?)?,
        };

        self.min_track_associations =
            config.read_or("MinTrackAssociations", self.min_track_associations)?;
        self.max_track_associations =
            config.read_or("MaxTrackAssociations", self.max_track_associations)?;
        self.chi_to_attempt_reclustering =
            config.read_or("ChiToAttemptReclustering", self.chi_to_attempt_reclustering)?;
        self.cone_cosine_half_angle =
            config.read_or("ConeCosineHalfAngle", self.cone_cosine_half_angle)?;
        self.min_cone_fraction = config.read_or("MinConeFraction", self.min_cone_fraction)?;
        self.contact_distance_threshold =
            config.read_or("ContactDistanceThreshold", self.contact_distance_threshold)?;
        self.min_contact_layers = config.read_or("MinContactLayers", self.min_contact_layers)?;
        self.min_cluster_energy_for_track_association = config.read_or(
            "MinClusterEnergyForTrackAssociation",
            self.min_cluster_energy_for_track_association,
        )?;
        self.chi2_for_automatic_cluster_selection = config.read_or(
            "Chi2ForAutomaticClusterSelection",
            self.chi2_for_automatic_cluster_selection,
        )?;
        self.should_use_best_guess_candidates = config.read_or(
            "ShouldUseBestGuessCandidates",
            self.should_use_best_guess_candidates,
        )?;
        self.hadronic_energy_resolution =
            config.read_or("HadronicEnergyResolution", self.hadronic_energy_resolution)?;

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        // begin by recalculating the track-cluster associations
        context.run_stage(&self.track_association_name)?;

        let cluster_ids = context.store.current_cluster_ids()?;

        for parent_id in &cluster_ids {
            if !context.store.cluster_exists(*parent_id) {
                continue;
            }

            let tracks = context.store.cluster(*parent_id)?.associated_tracks().to_vec();

            if (tracks.len() < self.min_track_associations)
                || (tracks.len() > self.max_track_associations)
            {
                continue;
            }

            let track_energy_sum: f64 = tracks
                .iter()
                .map(|id| context.store.track(*id).map(super::track::Track::energy_at_dca))
                .sum::<Result<f64>>()?;
            let chi = track_cluster_compatibility(
                context.store.cluster(*parent_id)?.hadronic_energy(),
                track_energy_sum,
                self.hadronic_energy_resolution,
            );

            if chi > self.chi_to_attempt_reclustering {
                continue;
            }

            // select the parent and its trackless companions for reclustering
            let mut selection = vec![*parent_id];
            self.select_companions(context.store, *parent_id, &cluster_ids, &mut selection)?;

            let original_name =
                context.store.begin_reclustering(tracks.clone(), selection)?;

            let mut best_chi2 = chi * chi;
            let mut best_name: Option<String> = None;
            let mut best_guess_chi = f64::MAX;
            let mut best_guess_name: Option<String> = None;

            for clustering_name in &self.clustering_names.clone() {
                let candidate_name = context.run_clustering_stage(clustering_name)?;

                if !context.store.cluster_list(&candidate_name)?.is_empty() {
                    if let Some(association_name) = self.association_name.clone() {
                        context.run_stage(&association_name)?;
                    }
                }

                // remove any empty track-projection clusters remaining at this stage
                for candidate_id in context.store.cluster_list(&candidate_name)?.to_vec() {
                    if context.store.cluster_exists(candidate_id)
                        && context.store.cluster(candidate_id)?.is_empty()
                    {
                        context.store.delete_cluster(candidate_id)?;
                    }
                }

                // final associations for these candidates, then the figure of merit
                context.run_stage(&self.track_association_name)?;

                let candidate_ids = context.store.cluster_list(&candidate_name)?.to_vec();
                let Some(result) = extract_recluster_results(
                    context.store,
                    &candidate_ids,
                    &tracks,
                    self.hadronic_energy_resolution,
                )?
                else {
                    continue;
                };

                if result.min_track_association_energy
                    < self.min_cluster_energy_for_track_association
                {
                    continue;
                }

                let attempt_limit =
                    self.chi_to_attempt_reclustering * self.chi_to_attempt_reclustering;

                if (result.chi2_per_dof < best_chi2) && (result.chi2_per_dof < attempt_limit) {
                    best_chi2 = result.chi2_per_dof;
                    best_name = Some(candidate_name.clone());

                    // good enough to stop trying further variants
                    if best_chi2 < self.chi2_for_automatic_cluster_selection {
                        break;
                    }
                } else if self.should_use_best_guess_candidates
                    && (result.n_excess_track_associations > 0)
                    && (result.chi > 0.0)
                    && (result.chi < best_guess_chi)
                {
                    best_guess_chi = result.chi;
                    best_guess_name = Some(candidate_name.clone());
                }
            }

            let selected = best_name
                .or(if self.should_use_best_guess_candidates { best_guess_name } else { None })
                .unwrap_or_else(|| original_name.clone());

            log::debug!(
                "reclustering around {parent_id:?}: selected {selected} (best chi2 {best_chi2})"
            );

            context.store.end_reclustering(&selected)?;

            // the committed partition gets its final associations
            context.run_stage(&self.track_association_name)?;
        }

        Ok(())
    }
}

/// Parent stage running the configured reclustering drivers in order.
#[derive(Default)]
pub struct ReclusteringAlgorithm {
    driver_names: Vec<String>,
}

impl Algorithm for ReclusteringAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.driver_names = builder.create_stage_list(config, "reclusteringAlgorithms")?;

        if self.driver_names.is_empty() {
            self.driver_names.push(
                builder.create_stage(&Config::from_yaml_str("type: ResolveTrackAssociations")?)?,
            );
        }

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for name in &self.driver_names {
            context.run_stage(name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn compatibility_chi_is_signed() {
        // cluster energy below the track expectation gives a negative chi
        let low = track_cluster_compatibility(10.0, 20.0, 0.6);
        assert!(low < 0.0);
        assert_approx_eq!(f64, low, -10.0 / (0.6 * 20.0_f64.sqrt()), epsilon = 1e-12);

        let balanced = track_cluster_compatibility(20.0, 20.0, 0.6);
        assert_approx_eq!(f64, balanced, 0.0);
    }

    #[test]
    fn zero_track_energy_is_incompatible() {
        assert!(track_cluster_compatibility(5.0, 0.0, 0.6) > 1e30);
    }
}
