//! Cluster aggregate: a mutable set of calo hits with incrementally maintained
//! energies and per-layer centroids, plus the track associations and particle-id flags
//! attached during reconstruction.

use super::arena::Id;
use super::error::{Error, Result};
use super::fit::ClusterFitResult;
use super::hit::{CaloHit, HitId, OrderedCaloHitList};
use super::track::TrackId;
use super::vector::CartesianVector;
use std::collections::BTreeMap;

/// Typed id of a cluster.
pub type ClusterId = Id<Cluster>;

/// Layers with at least this many hits mark the start of shower-like activity.
const SHOWER_START_MIN_HITS_PER_LAYER: usize = 3;

/// Longitudinal shower profile comparison against the electromagnetic expectation.
#[derive(Clone, Copy, Debug)]
pub struct ShowerProfile {
    /// Depth, in radiation lengths, at which the observed profile starts.
    pub start: f64,
    /// Normalised absolute difference between observed and expected profiles.
    pub discrepancy: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct LayerSums {
    n_hits: usize,
    n_possible_mip_hits: usize,
    em_energy: f64,
    hadronic_energy: f64,
    weighted_position: CartesianVector,
    weight: f64,
}

/// A mutable aggregate of calo hits. All mutation goes through the object store, which
/// keeps hit ownership unique; the cluster itself maintains its derived sums.
#[derive(Debug, Default)]
pub struct Cluster {
    hits: OrderedCaloHitList,
    isolated_hits: Vec<HitId>,
    associated_tracks: Vec<TrackId>,
    seed_track: Option<TrackId>,
    seed_direction: Option<CartesianVector>,
    current_fit: Option<ClusterFitResult>,
    is_mip_track: bool,
    is_fixed_photon: bool,
    photon_tag: Option<bool>,
    layer_sums: BTreeMap<u32, LayerSums>,
    em_energy: f64,
    hadronic_energy: f64,
    isolated_em_energy: f64,
    isolated_hadronic_energy: f64,
    pub(crate) fit_to_all_hits_cache: Option<ClusterFitResult>,
    pub(crate) shower_profile_cache: Option<ShowerProfile>,
}

impl Cluster {
    /// Create an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cluster bound to a seed track. Track-seeded clusters start
    /// flagged as mip tracks until a direction fit contradicts that.
    #[must_use]
    pub fn with_seed_track(track: TrackId, direction: CartesianVector) -> Self {
        Self {
            seed_track: Some(track),
            seed_direction: Some(direction),
            is_mip_track: true,
            ..Self::default()
        }
    }

    pub(crate) fn add_hit(&mut self, id: HitId, hit: &CaloHit) -> Result<()> {
        let layer = hit.pseudo_layer();
        self.hits.add_hit(id, layer, hit.input_energy())?;

        let sums = self.layer_sums.entry(layer).or_default();
        sums.n_hits += 1;
        sums.n_possible_mip_hits += usize::from(hit.is_possible_mip());
        sums.em_energy += hit.electromagnetic_energy();
        sums.hadronic_energy += hit.hadronic_energy();
        sums.weighted_position += *hit.position() * hit.electromagnetic_energy();
        sums.weight += hit.electromagnetic_energy();

        self.em_energy += hit.electromagnetic_energy();
        self.hadronic_energy += hit.hadronic_energy();
        self.invalidate_caches();

        Ok(())
    }

    pub(crate) fn remove_hit(&mut self, id: HitId, hit: &CaloHit) -> Result<()> {
        let layer = hit.pseudo_layer();
        self.hits.remove_hit(id, layer)?;

        let remove_entry = {
            let sums = self
                .layer_sums
                .get_mut(&layer)
                .ok_or_else(|| Error::Failure(format!("no layer sums for layer {layer}")))?;
            sums.n_hits -= 1;
            sums.n_possible_mip_hits -= usize::from(hit.is_possible_mip());
            sums.em_energy -= hit.electromagnetic_energy();
            sums.hadronic_energy -= hit.hadronic_energy();
            sums.weighted_position -= *hit.position() * hit.electromagnetic_energy();
            sums.weight -= hit.electromagnetic_energy();
            sums.n_hits == 0
        };

        if remove_entry {
            self.layer_sums.remove(&layer);
        }

        self.em_energy -= hit.electromagnetic_energy();
        self.hadronic_energy -= hit.hadronic_energy();
        self.invalidate_caches();

        Ok(())
    }

    pub(crate) fn add_isolated_hit(&mut self, id: HitId, hit: &CaloHit) -> Result<()> {
        if self.isolated_hits.contains(&id) {
            return Err(Error::Failure(format!("isolated hit {id:?} already present")));
        }

        let position = self.isolated_hits.partition_point(|other| *other < id);
        self.isolated_hits.insert(position, id);
        self.isolated_em_energy += hit.electromagnetic_energy();
        self.isolated_hadronic_energy += hit.hadronic_energy();

        Ok(())
    }

    pub(crate) fn remove_isolated_hit(&mut self, id: HitId, hit: &CaloHit) -> Result<()> {
        let position = self
            .isolated_hits
            .iter()
            .position(|other| *other == id)
            .ok_or_else(|| Error::OutOfRange(format!("isolated hit {id:?}")))?;

        self.isolated_hits.remove(position);
        self.isolated_em_energy -= hit.electromagnetic_energy();
        self.isolated_hadronic_energy -= hit.hadronic_energy();

        Ok(())
    }

    pub(crate) fn add_associated_track(&mut self, track: TrackId) {
        if !self.associated_tracks.contains(&track) {
            let position = self.associated_tracks.partition_point(|other| *other < track);
            self.associated_tracks.insert(position, track);
        }
    }

    pub(crate) fn remove_associated_track(&mut self, track: TrackId) -> Result<()> {
        let position = self
            .associated_tracks
            .iter()
            .position(|other| *other == track)
            .ok_or_else(|| Error::OutOfRange(format!("associated track {track:?}")))?;

        self.associated_tracks.remove(position);
        Ok(())
    }

    pub(crate) fn invalidate_caches(&mut self) {
        self.fit_to_all_hits_cache = None;
        self.shower_profile_cache = None;
    }

    /// The pseudo-layer-ordered hit list.
    #[must_use]
    pub const fn ordered_hits(&self) -> &OrderedCaloHitList {
        &self.hits
    }

    /// The isolated hits attached to the cluster, in id order.
    #[must_use]
    pub fn isolated_hits(&self) -> &[HitId] {
        &self.isolated_hits
    }

    /// Tracks currently associated with the cluster, in id order.
    #[must_use]
    pub fn associated_tracks(&self) -> &[TrackId] {
        &self.associated_tracks
    }

    /// The seed track, for track-seeded clusters.
    #[must_use]
    pub const fn seed_track(&self) -> Option<TrackId> {
        self.seed_track
    }

    /// Number of non-isolated calo hits.
    #[must_use]
    pub fn n_calo_hits(&self) -> usize {
        self.hits.n_hits()
    }

    /// Number of isolated calo hits.
    #[must_use]
    pub fn n_isolated_hits(&self) -> usize {
        self.isolated_hits.len()
    }

    /// Number of occupied pseudo layers.
    #[must_use]
    pub fn n_occupied_layers(&self) -> usize {
        self.hits.n_occupied_layers()
    }

    /// Innermost occupied pseudo layer.
    #[must_use]
    pub fn inner_layer(&self) -> Option<u32> {
        self.hits.inner_layer()
    }

    /// Outermost occupied pseudo layer.
    #[must_use]
    pub fn outer_layer(&self) -> Option<u32> {
        self.hits.outer_layer()
    }

    /// Number of pseudo layers spanned, inclusive.
    #[must_use]
    pub fn layer_span(&self) -> u32 {
        match (self.inner_layer(), self.outer_layer()) {
            (Some(inner), Some(outer)) => outer - inner + 1,
            _ => 0,
        }
    }

    /// Number of hits in one pseudo layer.
    #[must_use]
    pub fn n_hits_in_layer(&self, layer: u32) -> usize {
        self.layer_sums.get(&layer).map_or(0, |sums| sums.n_hits)
    }

    /// Electromagnetic energy of one pseudo layer, in GeV.
    #[must_use]
    pub fn em_energy_in_layer(&self, layer: u32) -> f64 {
        self.layer_sums.get(&layer).map_or(0.0, |sums| sums.em_energy)
    }

    /// Energy-weighted centroid of one pseudo layer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unoccupied layer and
    /// [`Error::Failure`] when the layer carries no electromagnetic energy to weight
    /// by.
    pub fn centroid(&self, layer: u32) -> Result<CartesianVector> {
        let sums = self
            .layer_sums
            .get(&layer)
            .ok_or_else(|| Error::OutOfRange(format!("layer {layer}")))?;

        if sums.weight <= 0.0 {
            return Err(Error::Failure(format!(
                "layer {layer} has no energy to weight its centroid"
            )));
        }

        Ok(sums.weighted_position * (1.0 / sums.weight))
    }

    /// Total electromagnetic energy including isolated hits, in GeV.
    #[must_use]
    pub fn electromagnetic_energy(&self) -> f64 {
        self.em_energy + self.isolated_em_energy
    }

    /// Total hadronic energy including isolated hits, in GeV.
    #[must_use]
    pub fn hadronic_energy(&self) -> f64 {
        self.hadronic_energy + self.isolated_hadronic_energy
    }

    /// Fraction of non-isolated hits flagged as possible mips.
    #[must_use]
    pub fn mip_fraction(&self) -> f64 {
        let n_hits = self.n_calo_hits();

        if n_hits == 0 {
            return 0.0;
        }

        let n_mip: usize = self.layer_sums.values().map(|sums| sums.n_possible_mip_hits).sum();
        n_mip as f64 / n_hits as f64
    }

    /// The layer holding the largest electromagnetic energy; ties resolve to the inner
    /// of the tied layers.
    #[must_use]
    pub fn shower_max_layer(&self) -> Option<u32> {
        self.layer_sums
            .iter()
            .max_by(|(layer_a, sums_a), (layer_b, sums_b)| {
                sums_a
                    .em_energy
                    .partial_cmp(&sums_b.em_energy)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(layer_b.cmp(layer_a))
            })
            .map(|(layer, _)| *layer)
    }

    /// The first layer, scanning outwards, with shower-like occupancy; the outer layer
    /// when no layer qualifies.
    #[must_use]
    pub fn shower_start_layer(&self) -> Option<u32> {
        self.layer_sums
            .iter()
            .find(|(_, sums)| sums.n_hits >= SHOWER_START_MIN_HITS_PER_LAYER)
            .map(|(layer, _)| *layer)
            .or_else(|| self.outer_layer())
    }

    /// Direction the cluster started out in: the seed-track direction for seeded
    /// clusters, the interaction-point-to-inner-centroid direction otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] for an empty, unseeded cluster.
    pub fn initial_direction(&self) -> Result<CartesianVector> {
        if let Some(direction) = self.seed_direction {
            return Ok(direction);
        }

        let inner = self
            .inner_layer()
            .ok_or(Error::NotInitialized("initial direction of empty cluster"))?;

        self.centroid(inner)?.unit_vector()
    }

    /// The direction fit maintained by the clustering pass, when available.
    #[must_use]
    pub const fn current_fit(&self) -> Option<&ClusterFitResult> {
        self.current_fit.as_ref()
    }

    pub(crate) fn set_current_fit(&mut self, fit: Option<ClusterFitResult>) {
        self.current_fit = fit;
    }

    /// Whether the cluster still looks like a section of a mip track.
    #[must_use]
    pub const fn is_mip_track(&self) -> bool {
        self.is_mip_track
    }

    pub(crate) fn set_mip_track(&mut self, is_mip_track: bool) {
        self.is_mip_track = is_mip_track;
    }

    /// Whether the cluster was fixed as a photon by a dedicated finding stage.
    #[must_use]
    pub const fn is_fixed_photon(&self) -> bool {
        self.is_fixed_photon
    }

    /// Fix or unfix the photon flag.
    pub fn set_fixed_photon(&mut self, is_fixed_photon: bool) {
        self.is_fixed_photon = is_fixed_photon;
    }

    /// Whether the cluster is tagged as a photon, either fixed or by particle id.
    #[must_use]
    pub fn is_photon(&self) -> bool {
        self.is_fixed_photon || self.photon_tag == Some(true)
    }

    pub(crate) fn set_photon_tag(&mut self, tag: bool) {
        self.photon_tag = Some(tag);
    }

    /// Whether the cluster holds neither hits nor isolated hits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty() && self.isolated_hits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::hit::{CaloHitParameters, DetectorRegion, HitType};
    use float_cmp::assert_approx_eq;

    fn parameters(position: CartesianVector, em: f64, is_mip: bool) -> CaloHitParameters {
        CaloHitParameters {
            position,
            expected_direction: CartesianVector::new(1.0, 0.0, 0.0),
            cell_normal: CartesianVector::new(1.0, 0.0, 0.0),
            cell_size_transverse: 10.0,
            cell_size_longitudinal: 25.0,
            n_radiation_lengths: 1.0,
            n_interaction_lengths: 0.1,
            input_energy: em,
            electromagnetic_energy: em,
            hadronic_energy: em * 0.8,
            density_weight: 1.0,
            is_possible_mip: is_mip,
            is_isolated: false,
            hit_type: HitType::Ecal,
            region: DetectorRegion::Barrel,
            parent_address: 0,
        }
    }

    fn make_hit(
        arena: &mut Arena<CaloHit>,
        layer: u32,
        position: CartesianVector,
        em: f64,
        is_mip: bool,
    ) -> (HitId, CaloHit) {
        let hit = CaloHit::new(parameters(position, em, is_mip), layer, None);
        let id = arena.insert(hit.clone());
        (id, hit)
    }

    #[test]
    fn incremental_sums_follow_hit_mutations() {
        let mut arena = Arena::new();
        let mut cluster = Cluster::new();

        let (id_a, hit_a) =
            make_hit(&mut arena, 1, CartesianVector::new(1500.0, 0.0, 0.0), 1.0, true);
        let (id_b, hit_b) =
            make_hit(&mut arena, 1, CartesianVector::new(1500.0, 20.0, 0.0), 3.0, false);

        cluster.add_hit(id_a, &hit_a).unwrap();
        cluster.add_hit(id_b, &hit_b).unwrap();

        assert_eq!(cluster.n_calo_hits(), 2);
        assert_approx_eq!(f64, cluster.electromagnetic_energy(), 4.0);
        assert_approx_eq!(f64, cluster.mip_fraction(), 0.5);

        let centroid = cluster.centroid(1).unwrap();
        assert_approx_eq!(f64, centroid.y, 15.0, epsilon = 1e-9);

        cluster.remove_hit(id_b, &hit_b).unwrap();
        assert_eq!(cluster.n_calo_hits(), 1);
        assert_approx_eq!(f64, cluster.electromagnetic_energy(), 1.0);
        assert_approx_eq!(f64, cluster.centroid(1).unwrap().y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn layer_span_and_shower_max() {
        let mut arena = Arena::new();
        let mut cluster = Cluster::new();

        for (layer, em) in [(2_u32, 0.5), (3, 2.0), (4, 1.0)] {
            let (id, hit) = make_hit(
                &mut arena,
                layer,
                CartesianVector::new(1500.0 + f64::from(layer), 0.0, 0.0),
                em,
                false,
            );
            cluster.add_hit(id, &hit).unwrap();
        }

        assert_eq!(cluster.inner_layer(), Some(2));
        assert_eq!(cluster.outer_layer(), Some(4));
        assert_eq!(cluster.layer_span(), 3);
        assert_eq!(cluster.shower_max_layer(), Some(3));
    }

    #[test]
    fn initial_direction_for_unseeded_cluster_points_at_inner_centroid() {
        let mut arena = Arena::new();
        let mut cluster = Cluster::new();
        let (id, hit) = make_hit(&mut arena, 1, CartesianVector::new(0.0, 1500.0, 0.0), 1.0, false);
        cluster.add_hit(id, &hit).unwrap();

        let direction = cluster.initial_direction().unwrap();
        assert_approx_eq!(f64, direction.y, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn empty_unseeded_cluster_has_no_initial_direction() {
        assert!(Cluster::new().initial_direction().is_err());
    }

    #[test]
    fn isolated_hits_contribute_energy_but_not_centroids() {
        let mut arena = Arena::new();
        let mut cluster = Cluster::new();

        let (id_a, hit_a) =
            make_hit(&mut arena, 1, CartesianVector::new(1500.0, 0.0, 0.0), 1.0, false);
        let (id_b, hit_b) =
            make_hit(&mut arena, 5, CartesianVector::new(1600.0, 0.0, 0.0), 2.0, false);

        cluster.add_hit(id_a, &hit_a).unwrap();
        cluster.add_isolated_hit(id_b, &hit_b).unwrap();

        assert_approx_eq!(f64, cluster.electromagnetic_energy(), 3.0);
        assert_eq!(cluster.n_calo_hits(), 1);
        assert_eq!(cluster.outer_layer(), Some(1));

        cluster.remove_isolated_hit(id_b, &hit_b).unwrap();
        assert_approx_eq!(f64, cluster.electromagnetic_energy(), 1.0);
    }
}
