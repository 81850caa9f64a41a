//! Fragment removal: absorbs fragment-like daughter clusters into nearby parents
//! using contact, cone and distance evidence. Three flows share one engine and
//! differ in their gates and cuts: the main flow feeds charged parents, the neutral
//! flow neutral parents, the photon flow photon parents.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::{Error, Result};
use super::store::EventStore;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};

/// Geometry options of the contact evaluation.
#[derive(Clone, Debug)]
pub struct ContactSettings {
    /// Cell-width multiple identifying contact between hits in the same layer.
    pub distance_threshold: f64,
    /// Cosine half angle of the first (widest) comparison cone.
    pub cone_cosine_half_angle1: f64,
    /// Cosine half angle of the second comparison cone.
    pub cone_cosine_half_angle2: f64,
    /// Cosine half angle of the third (narrowest) comparison cone.
    pub cone_cosine_half_angle3: f64,
    /// First distance identifying close hit pairs, in mm.
    pub close_hit_distance1: f64,
    /// Second, tighter, distance identifying close hit pairs, in mm.
    pub close_hit_distance2: f64,
}

impl Default for ContactSettings {
    fn default() -> Self {
        Self {
            distance_threshold: 2.0,
            cone_cosine_half_angle1: 0.9,
            cone_cosine_half_angle2: 0.95,
            cone_cosine_half_angle3: 0.985,
            close_hit_distance1: 100.0,
            close_hit_distance2: 50.0,
        }
    }
}

/// Fraction of the daughter's hits lying inside a cone drawn from the parent: the
/// cone follows the parent's associated track where one exists, otherwise the
/// parent's fit through all hits, with the apex at the parent's inner centroid.
///
/// # Errors
///
/// Propagates unknown ids and inconsistent cluster state.
pub fn fraction_of_hits_in_cone(
    store: &mut EventStore,
    daughter_id: ClusterId,
    parent_id: ClusterId,
    cos_half_angle: f64,
) -> Result<f64> {
    let (apex, direction) = {
        let parent = store.cluster(parent_id)?;

        if let Some(track_id) = parent.associated_tracks().first() {
            let state = store.track(*track_id)?.calorimeter_state();
            (state.position, state.momentum.unit_vector()?)
        } else {
            let fit = store.fit_to_all_hits(parent_id)?;
            let parent = store.cluster(parent_id)?;
            let inner = parent
                .inner_layer()
                .ok_or(Error::NotInitialized("cone apex of empty parent"))?;
            let apex = parent.centroid(inner)?;

            if fit.is_successful() {
                (apex, fit.direction()?)
            } else {
                (apex, parent.initial_direction()?)
            }
        }
    };

    fraction_in_cone_about_axis(store, daughter_id, &apex, &direction, cos_half_angle)
}

/// Fraction of the daughter's hits whose displacement from `apex` lies within the
/// cone of the given opening around `direction`.
///
/// # Errors
///
/// Propagates unknown ids.
pub fn fraction_in_cone_about_axis(
    store: &EventStore,
    daughter_id: ClusterId,
    apex: &super::vector::CartesianVector,
    direction: &super::vector::CartesianVector,
    cos_half_angle: f64,
) -> Result<f64> {
    let daughter = store.cluster(daughter_id)?;
    let n_hits = daughter.n_calo_hits();

    if n_hits == 0 {
        return Ok(0.0);
    }

    let mut n_in_cone = 0usize;

    for (_, hit_id) in daughter.ordered_hits().hits() {
        let displacement = *store.hit(hit_id)?.position() - *apex;
        let magnitude = displacement.magnitude();

        if (magnitude > 0.0) && (direction.dot(&displacement) > cos_half_angle * magnitude) {
            n_in_cone += 1;
        }
    }

    Ok(n_in_cone as f64 / n_hits as f64)
}

/// Layer-by-layer contact between two clusters: a layer is in contact when some
/// daughter hit lies within `distance_threshold` cell widths of some parent hit in
/// that layer; the fraction normalises to the number of overlapping layers.
///
/// # Errors
///
/// Propagates unknown ids.
pub fn cluster_contact_details(
    store: &EventStore,
    daughter_id: ClusterId,
    parent_id: ClusterId,
    distance_threshold: f64,
) -> Result<(u32, f64)> {
    let daughter = store.cluster(daughter_id)?;
    let parent = store.cluster(parent_id)?;

    let (Some(daughter_inner), Some(daughter_outer)) =
        (daughter.inner_layer(), daughter.outer_layer())
    else {
        return Ok((0, 0.0));
    };
    let (Some(parent_inner), Some(parent_outer)) = (parent.inner_layer(), parent.outer_layer())
    else {
        return Ok((0, 0.0));
    };

    let overlap_start = daughter_inner.max(parent_inner);
    let overlap_end = daughter_outer.min(parent_outer);

    if overlap_end < overlap_start {
        return Ok((0, 0.0));
    }

    let n_overlap_layers = overlap_end - overlap_start + 1;
    let mut n_contact_layers = 0u32;

    for layer in overlap_start..=overlap_end {
        let mut in_contact = false;

        'daughter: for daughter_hit_id in daughter.ordered_hits().layer_hits(layer) {
            let daughter_hit = store.hit(daughter_hit_id)?;
            let contact_distance = distance_threshold * daughter_hit.cell_length_scale();

            for parent_hit_id in parent.ordered_hits().layer_hits(layer) {
                let separation =
                    (*daughter_hit.position() - *store.hit(parent_hit_id)?.position()).magnitude();

                if separation < contact_distance {
                    in_contact = true;
                    break 'daughter;
                }
            }
        }

        if in_contact {
            n_contact_layers += 1;
        }
    }

    Ok((n_contact_layers, f64::from(n_contact_layers) / f64::from(n_overlap_layers)))
}

/// Proximity and interaction summary of one (daughter, parent) candidate pairing.
#[derive(Clone, Debug)]
pub struct ClusterContact {
    /// The daughter candidate.
    pub daughter: ClusterId,
    /// The parent candidate.
    pub parent: ClusterId,
    /// Number of layers in contact.
    pub n_contact_layers: u32,
    /// Ratio of contact layers to overlapping layers.
    pub contact_fraction: f64,
    /// Daughter cone fraction for the widest cone.
    pub cone_fraction1: f64,
    /// Daughter cone fraction for the second cone.
    pub cone_fraction2: f64,
    /// Daughter cone fraction for the narrowest cone.
    pub cone_fraction3: f64,
    /// Fraction of daughter hits within the first close-hit distance of the parent.
    pub close_hit_fraction1: f64,
    /// Fraction of daughter hits within the second close-hit distance of the parent.
    pub close_hit_fraction2: f64,
    /// Distance between the closest hits of the pair, in mm.
    pub distance_to_closest_hit: f64,
}

impl ClusterContact {
    /// Evaluate the contact between a daughter and a parent candidate.
    ///
    /// # Errors
    ///
    /// Propagates unknown ids and inconsistent cluster state.
    pub fn evaluate(
        store: &mut EventStore,
        daughter_id: ClusterId,
        parent_id: ClusterId,
        settings: &ContactSettings,
    ) -> Result<Self> {
        let cone_fraction1 = fraction_of_hits_in_cone(
            store,
            daughter_id,
            parent_id,
            settings.cone_cosine_half_angle1,
        )?;
        let cone_fraction2 = fraction_of_hits_in_cone(
            store,
            daughter_id,
            parent_id,
            settings.cone_cosine_half_angle2,
        )?;
        let cone_fraction3 = fraction_of_hits_in_cone(
            store,
            daughter_id,
            parent_id,
            settings.cone_cosine_half_angle3,
        )?;

        let (n_contact_layers, contact_fraction) =
            cluster_contact_details(store, daughter_id, parent_id, settings.distance_threshold)?;

        // minimum separation and both close-hit fractions in a single hit loop
        let daughter = store.cluster(daughter_id)?;
        let parent = store.cluster(parent_id)?;
        let close1_squared = settings.close_hit_distance1 * settings.close_hit_distance1;
        let close2_squared = settings.close_hit_distance2 * settings.close_hit_distance2;

        let mut n_close1 = 0usize;
        let mut n_close2 = 0usize;
        let mut min_distance_squared = f64::MAX;
        let mut n_daughter_hits = 0usize;

        for (_, daughter_hit_id) in daughter.ordered_hits().hits() {
            let daughter_position = *store.hit(daughter_hit_id)?.position();
            let mut is_close1 = false;
            let mut is_close2 = false;
            n_daughter_hits += 1;

            for (_, parent_hit_id) in parent.ordered_hits().hits() {
                let separation_squared = (daughter_position
                    - *store.hit(parent_hit_id)?.position())
                .magnitude_squared();

                is_close1 |= separation_squared < close1_squared;
                is_close2 |= separation_squared < close2_squared;

                if separation_squared < min_distance_squared {
                    min_distance_squared = separation_squared;
                }
            }

            n_close1 += usize::from(is_close1);
            n_close2 += usize::from(is_close2);
        }

        let n_daughter_hits = n_daughter_hits.max(1) as f64;

        Ok(Self {
            daughter: daughter_id,
            parent: parent_id,
            n_contact_layers,
            contact_fraction,
            cone_fraction1,
            cone_fraction2,
            cone_fraction3,
            close_hit_fraction1: n_close1 as f64 / n_daughter_hits,
            close_hit_fraction2: n_close2 as f64 / n_daughter_hits,
            distance_to_closest_hit: min_distance_squared.sqrt(),
        })
    }
}

/// Which parents and daughters a flow feeds on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlowKind {
    /// Charged parents absorbing neutral fragments.
    Main,
    /// Neutral parents absorbing neutral, non-photon-like fragments.
    Neutral,
    /// Photon parents absorbing photon-like fragments.
    Photon,
}

/// One fragment-removal flow: the shared pass loop with flow-specific gates.
pub struct FragmentRemovalAlgorithm {
    kind: FlowKind,
    n_max_passes: u32,
    min_daughter_calo_hits: usize,
    min_daughter_hadronic_energy: f64,
    min_evidence: f64,
    contact: ContactSettings,

    contact_cut_max_distance: f64,
    contact_cut_n_layers: u32,
    contact_cut_cone_fraction: f64,
    contact_cut_close_hit_fraction1: f64,
    contact_cut_close_hit_fraction2: f64,
    contact_cut_nearby_distance: f64,
    contact_cut_nearby_close_hit_fraction2: f64,

    contact_evidence_n_layers1: u32,
    contact_evidence_n_layers2: u32,
    contact_evidence_n_layers3: u32,
    contact_evidence1: f64,
    contact_evidence2: f64,
    contact_evidence3: f64,
    cone_evidence_fraction: f64,
    cone_evidence_ecal_multiplier: f64,
    distance_evidence1: f64,
    distance_evidence1d: f64,
    distance_evidence_close_fraction1_multiplier: f64,
    distance_evidence_close_fraction2_multiplier: f64,
    contact_weight: f64,
    cone_weight: f64,
    distance_weight: f64,

    // photon-like daughter selection, used by the neutral and photon flows
    photon_like_max_inner_layer: u32,
    photon_like_min_dcos_r: f64,
    photon_like_max_shower_start: f64,
    photon_like_max_profile_discrepancy: f64,

    // photon-flow parent pairing
    inner_layer_tolerance: u32,
    min_cos_opening_angle: f64,
}

impl FragmentRemovalAlgorithm {
    /// The main flow: neutral fragments absorbed into charged parents.
    #[must_use]
    pub fn main() -> Self {
        Self {
            kind: FlowKind::Main,
            n_max_passes: 200,
            min_daughter_calo_hits: 5,
            min_daughter_hadronic_energy: 0.025,
            min_evidence: 2.0,
            contact: ContactSettings::default(),
            contact_cut_max_distance: 500.0,
            contact_cut_n_layers: 2,
            contact_cut_cone_fraction: 0.5,
            contact_cut_close_hit_fraction1: 0.5,
            contact_cut_close_hit_fraction2: 0.5,
            contact_cut_nearby_distance: 100.0,
            contact_cut_nearby_close_hit_fraction2: 0.25,
            contact_evidence_n_layers1: 10,
            contact_evidence_n_layers2: 4,
            contact_evidence_n_layers3: 1,
            contact_evidence1: 2.0,
            contact_evidence2: 1.0,
            contact_evidence3: 0.5,
            cone_evidence_fraction: 0.5,
            cone_evidence_ecal_multiplier: 0.5,
            distance_evidence1: 100.0,
            distance_evidence1d: 100.0,
            distance_evidence_close_fraction1_multiplier: 1.0,
            distance_evidence_close_fraction2_multiplier: 2.0,
            contact_weight: 1.0,
            cone_weight: 1.0,
            distance_weight: 1.0,
            photon_like_max_inner_layer: 10,
            photon_like_min_dcos_r: 0.5,
            photon_like_max_shower_start: 5.0,
            photon_like_max_profile_discrepancy: 0.75,
            inner_layer_tolerance: 5,
            min_cos_opening_angle: 0.95,
        }
    }

    /// The neutral flow: neutral fragments absorbed into neutral hadron parents.
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            kind: FlowKind::Neutral,
            n_max_passes: 5,
            min_daughter_hadronic_energy: 0.1,
            ..Self::main()
        }
    }

    /// The photon flow: photon-like fragments absorbed into photon parents.
    #[must_use]
    pub fn photon() -> Self {
        Self {
            kind: FlowKind::Photon,
            contact: ContactSettings {
                cone_cosine_half_angle1: 0.95,
                close_hit_distance1: 40.0,
                close_hit_distance2: 20.0,
                ..ContactSettings::default()
            },
            contact_cut_max_distance: 20.0,
            contact_cut_close_hit_fraction2: 0.2,
            contact_evidence_n_layers1: 2,
            ..Self::main()
        }
    }

    fn is_photon_like(&self, store: &mut EventStore, cluster_id: ClusterId) -> Result<bool> {
        if store.cluster(cluster_id)?.is_photon() {
            return Ok(true);
        }

        let cluster = store.cluster(cluster_id)?;
        let Some(inner_layer) = cluster.inner_layer() else {
            return Ok(false);
        };

        if inner_layer >= self.photon_like_max_inner_layer {
            return Ok(false);
        }

        let fit = store.fit_to_all_hits(cluster_id)?;

        if !fit.is_successful() || (fit.radial_direction_cosine()? < self.photon_like_min_dcos_r) {
            return Ok(false);
        }

        let profile = store.shower_profile(cluster_id)?;

        Ok((profile.start < self.photon_like_max_shower_start)
            && (profile.discrepancy < self.photon_like_max_profile_discrepancy))
    }

    fn daughter_passes_selection(
        &self,
        store: &mut EventStore,
        cluster_id: ClusterId,
    ) -> Result<bool> {
        let cluster = store.cluster(cluster_id)?;

        if !cluster.associated_tracks().is_empty() {
            return Ok(false);
        }

        if (cluster.n_calo_hits() < self.min_daughter_calo_hits)
            || (cluster.hadronic_energy() < self.min_daughter_hadronic_energy)
        {
            return Ok(false);
        }

        match self.kind {
            FlowKind::Main => Ok(!store.cluster(cluster_id)?.is_photon()),
            FlowKind::Neutral => Ok(!self.is_photon_like(store, cluster_id)?),
            FlowKind::Photon => self.is_photon_like(store, cluster_id),
        }
    }

    fn parent_passes_selection(
        &self,
        store: &mut EventStore,
        daughter_id: ClusterId,
        parent_id: ClusterId,
    ) -> Result<bool> {
        let parent = store.cluster(parent_id)?;

        match self.kind {
            FlowKind::Main => Ok(!parent.associated_tracks().is_empty()),
            FlowKind::Neutral => {
                Ok(parent.associated_tracks().is_empty() && !parent.is_photon())
            }
            FlowKind::Photon => {
                if !parent.associated_tracks().is_empty() {
                    return Ok(false);
                }

                let daughter = store.cluster(daughter_id)?;
                let (Some(parent_inner), Some(daughter_inner)) =
                    (store.cluster(parent_id)?.inner_layer(), daughter.inner_layer())
                else {
                    return Ok(false);
                };

                if parent_inner > daughter_inner + self.inner_layer_tolerance {
                    return Ok(false);
                }

                let parent_direction = store.cluster(parent_id)?.initial_direction()?;
                let daughter_direction = store.cluster(daughter_id)?.initial_direction()?;

                if daughter_direction.cos_opening_angle(&parent_direction)?
                    < self.min_cos_opening_angle
                {
                    return Ok(false);
                }

                self.is_photon_like(store, parent_id)
            }
        }
    }

    fn passes_contact_cuts(&self, contact: &ClusterContact) -> bool {
        if contact.distance_to_closest_hit > self.contact_cut_max_distance {
            return false;
        }

        if (contact.n_contact_layers > self.contact_cut_n_layers)
            || (contact.cone_fraction1 > self.contact_cut_cone_fraction)
            || (contact.close_hit_fraction1 > self.contact_cut_close_hit_fraction1)
            || (contact.close_hit_fraction2 > self.contact_cut_close_hit_fraction2)
        {
            return true;
        }

        (contact.distance_to_closest_hit < self.contact_cut_nearby_distance)
            && (contact.close_hit_fraction2 < self.contact_cut_nearby_close_hit_fraction2)
    }

    fn evidence_for_merge(
        &self,
        store: &EventStore,
        detector: &super::geometry::Detector,
        contact: &ClusterContact,
    ) -> Result<f64> {
        // 1. layers in contact
        let mut contact_evidence = if contact.n_contact_layers > self.contact_evidence_n_layers1 {
            self.contact_evidence1
        } else if contact.n_contact_layers > self.contact_evidence_n_layers2 {
            self.contact_evidence2
        } else if contact.n_contact_layers > self.contact_evidence_n_layers3 {
            self.contact_evidence3
        } else {
            0.0
        };
        contact_evidence *= 1.0 + contact.contact_fraction;

        // 2. cone extrapolation
        let mut cone_evidence = 0.0;
        if contact.cone_fraction1 > self.cone_evidence_fraction {
            cone_evidence =
                contact.cone_fraction1 + contact.cone_fraction2 + contact.cone_fraction3;

            let n_ecal_layers = detector.ecal_barrel().n_layers();
            let daughter_inner = store.cluster(contact.daughter)?.inner_layer().unwrap_or(0);

            if daughter_inner < n_ecal_layers {
                cone_evidence *= self.cone_evidence_ecal_multiplier;
            }
        }

        // 3. distance of closest approach
        let mut distance_evidence = 0.0;
        if contact.distance_to_closest_hit < self.distance_evidence1 {
            distance_evidence =
                (self.distance_evidence1 - contact.distance_to_closest_hit) / self.distance_evidence1d;
            distance_evidence +=
                self.distance_evidence_close_fraction1_multiplier * contact.close_hit_fraction1;
            distance_evidence +=
                self.distance_evidence_close_fraction2_multiplier * contact.close_hit_fraction2;
        }

        Ok(self.contact_weight.mul_add(
            contact_evidence,
            self.cone_weight
                .mul_add(cone_evidence, self.distance_weight * distance_evidence),
        ))
    }

    /// Build or refresh the contact map. Daughters iterate in (inner layer, id)
    /// order so that evidence ties resolve identically on every run.
    fn cluster_contact_map(
        &self,
        store: &mut EventStore,
        is_first_pass: bool,
        affected_clusters: &BTreeSet<ClusterId>,
        contact_map: &mut BTreeMap<ClusterId, Vec<ClusterContact>>,
    ) -> Result<()> {
        let daughter_ids: Vec<ClusterId> = store
            .current_cluster_ids()?
            .into_iter()
            .sorted_by_key(|id| {
                (store.cluster(*id).ok().and_then(super::cluster::Cluster::inner_layer), *id)
            })
            .collect();

        let parent_ids = store.current_cluster_ids()?;

        for daughter_id in daughter_ids {
            if !is_first_pass {
                if !affected_clusters.contains(&daughter_id) {
                    continue;
                }

                contact_map.remove(&daughter_id);
            }

            if !self.daughter_passes_selection(store, daughter_id)? {
                continue;
            }

            for parent_id in &parent_ids {
                if (*parent_id == daughter_id) || !store.cluster_exists(*parent_id) {
                    continue;
                }

                if !self.parent_passes_selection(store, daughter_id, *parent_id)? {
                    continue;
                }

                // a single failing pair never aborts the pass
                match ClusterContact::evaluate(store, daughter_id, *parent_id, &self.contact) {
                    Ok(contact) => {
                        if self.passes_contact_cuts(&contact) {
                            contact_map.entry(daughter_id).or_default().push(contact);
                        }
                    }
                    Err(error) => {
                        log::warn!(
                            "fragment removal: skipping pair {daughter_id:?}/{parent_id:?}: {error}"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// The globally best (daughter, parent) pairing above the evidence threshold;
    /// evidence ties resolve to the higher parent hadronic energy.
    fn best_merge_candidate(
        &self,
        store: &mut EventStore,
        detector: &super::geometry::Detector,
        contact_map: &BTreeMap<ClusterId, Vec<ClusterContact>>,
    ) -> Result<Option<(ClusterId, ClusterId)>> {
        let mut highest_evidence = self.min_evidence;
        let mut highest_parent_energy = 0.0;
        let mut best: Option<(ClusterId, ClusterId)> = None;

        for contacts in contact_map.values() {
            for contact in contacts {
                if !store.cluster_exists(contact.parent) || !store.cluster_exists(contact.daughter)
                {
                    continue;
                }

                let evidence = self.evidence_for_merge(store, detector, contact)?;
                let parent_energy = store.cluster(contact.parent)?.hadronic_energy();

                if (evidence > highest_evidence)
                    || ((evidence == highest_evidence) && (parent_energy > highest_parent_energy))
                {
                    highest_evidence = evidence;
                    highest_parent_energy = parent_energy;
                    best = Some((contact.daughter, contact.parent));
                }
            }
        }

        Ok(best)
    }

    fn affected_clusters(
        contact_map: &BTreeMap<ClusterId, Vec<ClusterContact>>,
        merged_daughter: ClusterId,
        merged_parent: ClusterId,
    ) -> BTreeSet<ClusterId> {
        let mut affected = BTreeSet::new();

        for (daughter_id, contacts) in contact_map {
            if *daughter_id == merged_daughter {
                // every previous parent candidate of the deleted daughter changed
                affected.extend(contacts.iter().map(|contact| contact.parent));
                continue;
            }

            if contacts
                .iter()
                .any(|contact| (contact.parent == merged_parent) || (contact.parent == merged_daughter))
            {
                affected.insert(*daughter_id);
            }
        }

        affected
    }
}

impl Algorithm for FragmentRemovalAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.n_max_passes = config.read_or("NMaxPasses", self.n_max_passes)?;
        self.min_daughter_calo_hits =
            config.read_or("MinDaughterCaloHits", self.min_daughter_calo_hits)?;
        self.min_daughter_hadronic_energy =
            config.read_or("MinDaughterHadronicEnergy", self.min_daughter_hadronic_energy)?;
        self.min_evidence = config.read_or("MinEvidence", self.min_evidence)?;

        self.contact.distance_threshold =
            config.read_or("ContactDistanceThreshold", self.contact.distance_threshold)?;
        self.contact.cone_cosine_half_angle1 =
            config.read_or("ConeCosineHalfAngle1", self.contact.cone_cosine_half_angle1)?;
        self.contact.cone_cosine_half_angle2 =
            config.read_or("ConeCosineHalfAngle2", self.contact.cone_cosine_half_angle2)?;
        self.contact.cone_cosine_half_angle3 =
            config.read_or("ConeCosineHalfAngle3", self.contact.cone_cosine_half_angle3)?;
        self.contact.close_hit_distance1 =
            config.read_or("CloseHitDistance1", self.contact.close_hit_distance1)?;
        self.contact.close_hit_distance2 =
            config.read_or("CloseHitDistance2", self.contact.close_hit_distance2)?;

        self.contact_cut_max_distance =
            config.read_or("ContactCutMaxDistance", self.contact_cut_max_distance)?;
        self.contact_cut_n_layers = config.read_or("ContactCutNLayers", self.contact_cut_n_layers)?;
        self.contact_cut_cone_fraction =
            config.read_or("ContactCutConeFraction", self.contact_cut_cone_fraction)?;
        self.contact_cut_close_hit_fraction1 =
            config.read_or("ContactCutCloseHitFraction1", self.contact_cut_close_hit_fraction1)?;
        self.contact_cut_close_hit_fraction2 =
            config.read_or("ContactCutCloseHitFraction2", self.contact_cut_close_hit_fraction2)?;
        self.contact_cut_nearby_distance =
            config.read_or("ContactCutNearbyDistance", self.contact_cut_nearby_distance)?;
        self.contact_cut_nearby_close_hit_fraction2 = config.read_or(
            "ContactCutNearbyCloseHitFraction2",
            self.contact_cut_nearby_close_hit_fraction2,
        )?;

        self.contact_evidence_n_layers1 =
            config.read_or("ContactEvidenceNLayers1", self.contact_evidence_n_layers1)?;
        self.contact_evidence_n_layers2 =
            config.read_or("ContactEvidenceNLayers2", self.contact_evidence_n_layers2)?;
        self.contact_evidence_n_layers3 =
            config.read_or("ContactEvidenceNLayers3", self.contact_evidence_n_layers3)?;
        self.contact_evidence1 = config.read_or("ContactEvidence1", self.contact_evidence1)?;
        self.contact_evidence2 = config.read_or("ContactEvidence2", self.contact_evidence2)?;
        self.contact_evidence3 = config.read_or("ContactEvidence3", self.contact_evidence3)?;
        self.cone_evidence_fraction =
            config.read_or("ConeEvidenceFraction", self.cone_evidence_fraction)?;
        self.cone_evidence_ecal_multiplier =
            config.read_or("ConeEvidenceECalMultiplier", self.cone_evidence_ecal_multiplier)?;
        self.distance_evidence1 = config.read_or("DistanceEvidence1", self.distance_evidence1)?;
        self.distance_evidence1d = config.read_or("DistanceEvidence1d", self.distance_evidence1d)?;

        if self.distance_evidence1d == 0.0 {
            return Err(Error::InvalidParameter(
                "DistanceEvidence1d must be non-zero".to_owned(),
            ));
        }

        self.distance_evidence_close_fraction1_multiplier = config.read_or(
            "DistanceEvidenceCloseFraction1Multiplier",
            self.distance_evidence_close_fraction1_multiplier,
        )?;
        self.distance_evidence_close_fraction2_multiplier = config.read_or(
            "DistanceEvidenceCloseFraction2Multiplier",
            self.distance_evidence_close_fraction2_multiplier,
        )?;
        self.contact_weight = config.read_or("ContactWeight", self.contact_weight)?;
        self.cone_weight = config.read_or("ConeWeight", self.cone_weight)?;
        self.distance_weight = config.read_or("DistanceWeight", self.distance_weight)?;

        self.photon_like_max_inner_layer =
            config.read_or("PhotonLikeMaxInnerLayer", self.photon_like_max_inner_layer)?;
        self.photon_like_min_dcos_r =
            config.read_or("PhotonLikeMinDCosR", self.photon_like_min_dcos_r)?;
        self.photon_like_max_shower_start =
            config.read_or("PhotonLikeMaxShowerStart", self.photon_like_max_shower_start)?;
        self.photon_like_max_profile_discrepancy = config.read_or(
            "PhotonLikeMaxProfileDiscrepancy",
            self.photon_like_max_profile_discrepancy,
        )?;
        self.inner_layer_tolerance =
            config.read_or("InnerLayerTolerance", self.inner_layer_tolerance)?;
        self.min_cos_opening_angle =
            config.read_or("MinCosOpeningAngle", self.min_cos_opening_angle)?;

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let mut n_passes = 0u32;
        let mut is_first_pass = true;
        let mut should_recalculate = true;
        let mut affected_clusters = BTreeSet::new();
        let mut contact_map: BTreeMap<ClusterId, Vec<ClusterContact>> = BTreeMap::new();

        while (n_passes < self.n_max_passes) && should_recalculate {
            n_passes += 1;
            should_recalculate = false;

            self.cluster_contact_map(
                context.store,
                is_first_pass,
                &affected_clusters,
                &mut contact_map,
            )?;
            is_first_pass = false;

            let Some((daughter_id, parent_id)) =
                self.best_merge_candidate(context.store, context.detector, &contact_map)?
            else {
                continue;
            };

            log::debug!(
                "fragment removal ({:?}): merging {daughter_id:?} into {parent_id:?}",
                self.kind
            );

            affected_clusters = Self::affected_clusters(&contact_map, daughter_id, parent_id);
            contact_map.remove(&daughter_id);
            should_recalculate = true;

            context.store.merge_and_delete_clusters(parent_id, daughter_id)?;

            if self.kind == FlowKind::Photon {
                context.store.cluster_mut(parent_id)?.set_fixed_photon(true);
            }
        }

        Ok(())
    }
}

/// Parent stage running the configured fragment-removal flows in order.
#[derive(Default)]
pub struct FragmentRemovalParentAlgorithm {
    flow_names: Vec<String>,
}

impl Algorithm for FragmentRemovalParentAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.flow_names = builder.create_stage_list(config, "fragmentRemovalAlgorithms")?;

        if self.flow_names.is_empty() {
            for node in ["MainFragmentRemoval", "NeutralFragmentRemoval", "PhotonFragmentRemoval"]
            {
                self.flow_names.push(
                    builder.create_stage(&Config::from_yaml_str(&format!("type: {node}"))?)?,
                );
            }
        }

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for name in &self.flow_names {
            context.run_stage(name)?;
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
    use float_cmp::assert_approx_eq;

    fn line_cluster(
        store: &mut EventStore,
        detector: &crate::geometry::Detector,
        offset_y: f64,
        first_layer: u32,
        n_layers: u32,
        energy: f64,
    ) -> ClusterId {
        let hits: Vec<_> = (first_layer..first_layer + n_layers)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1495.0),
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
            .collect();

        store.create_cluster(ClusterSeed::Hits(hits)).unwrap()
    }

    #[test]
    fn contact_details_count_touching_layers() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let parent = line_cluster(&mut store, &detector, 0.0, 1, 8, 0.5);
        let daughter = line_cluster(&mut store, &detector, 15.0, 3, 4, 0.1);

        let (n_contact, fraction) =
            cluster_contact_details(&store, daughter, parent, 2.0).unwrap();

        // 15 mm apart with 10 mm cells and a threshold of two cell widths
        assert_eq!(n_contact, 4);
        assert_approx_eq!(f64, fraction, 1.0);

        let far = line_cluster(&mut store, &detector, 300.0, 3, 4, 0.1);
        let (n_contact_far, _) = cluster_contact_details(&store, far, parent, 2.0).unwrap();
        assert_eq!(n_contact_far, 0);
    }

    #[test]
    fn cone_fraction_follows_the_axis() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let parent = line_cluster(&mut store, &detector, 0.0, 1, 8, 0.5);
        let aligned = line_cluster(&mut store, &detector, 0.0, 10, 4, 0.1);
        let sideways = line_cluster(&mut store, &detector, 500.0, 1, 4, 0.1);

        let aligned_fraction =
            fraction_of_hits_in_cone(&mut store, aligned, parent, 0.9).unwrap();
        let sideways_fraction =
            fraction_of_hits_in_cone(&mut store, sideways, parent, 0.9).unwrap();

        assert_approx_eq!(f64, aligned_fraction, 1.0);
        assert_approx_eq!(f64, sideways_fraction, 0.0);
    }

    #[test]
    fn main_flow_absorbs_soft_fragment_into_charged_parent() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let parent = line_cluster(&mut store, &detector, 0.0, 1, 15, 0.4);
        let fragment = line_cluster(&mut store, &detector, 25.0, 3, 6, 0.05);

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
        store.add_track_cluster_association(track, parent).unwrap();

        let parent_hits = store.cluster(parent).unwrap().n_calo_hits();
        let fragment_hits = store.cluster(fragment).unwrap().n_calo_hits();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        FragmentRemovalAlgorithm::main().run(&mut context).unwrap();

        assert!(!store.cluster_exists(fragment));
        assert_eq!(store.cluster(parent).unwrap().n_calo_hits(), parent_hits + fragment_hits);
    }

    #[test]
    fn distant_neutral_clusters_survive() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let lhs = line_cluster(&mut store, &detector, 0.0, 1, 8, 0.3);
        let rhs = line_cluster(&mut store, &detector, 800.0, 1, 8, 0.3);

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        FragmentRemovalAlgorithm::neutral().run(&mut context).unwrap();

        assert!(store.cluster_exists(lhs));
        assert!(store.cluster_exists(rhs));
    }
}
