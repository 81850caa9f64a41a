//! Calorimeter cell deposits and the pseudo-layer-ordered hit collection.

use super::arena::Id;
use super::error::{Error, Result};
use super::mc::McParticle;
use super::vector::CartesianVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Typed id of a calo hit.
pub type HitId = Id<CaloHit>;

/// Typed id of an MC particle.
pub type McId = Id<McParticle>;

/// Calorimeter in which a hit was recorded.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum HitType {
    /// Hit in the innermost tracking detector sampling layers.
    InnerDetector,
    /// Hit in the electromagnetic calorimeter.
    Ecal,
    /// Hit in the hadronic calorimeter.
    Hcal,
    /// Hit in the muon yoke.
    Muon,
}

/// Detector region containing a hit.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DetectorRegion {
    /// Barrel region.
    Barrel,
    /// End-cap region.
    EndCap,
}

/// Input payload describing one calo hit, handed to the engine by the calling harness.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CaloHitParameters {
    /// Cell centre position.
    pub position: CartesianVector,
    /// Unit vector of the expected shower direction at the cell.
    pub expected_direction: CartesianVector,
    /// Unit normal to the sampling cell.
    pub cell_normal: CartesianVector,
    /// Cell dimension transverse to the expected shower direction, in mm.
    pub cell_size_transverse: f64,
    /// Cell dimension along the expected shower direction, in mm.
    pub cell_size_longitudinal: f64,
    /// Number of radiation lengths between the interaction point and the cell.
    pub n_radiation_lengths: f64,
    /// Number of interaction lengths between the interaction point and the cell.
    pub n_interaction_lengths: f64,
    /// Raw energy deposited in the cell, in GeV.
    pub input_energy: f64,
    /// Calibrated electromagnetic energy, in GeV.
    pub electromagnetic_energy: f64,
    /// Calibrated hadronic energy, in GeV.
    pub hadronic_energy: f64,
    /// Local energy-density weight used by the density-weight hit ordering.
    pub density_weight: f64,
    /// Whether the cell deposit is consistent with a minimum-ionising particle.
    pub is_possible_mip: bool,
    /// Whether the hit is isolated from the surrounding shower activity.
    pub is_isolated: bool,
    /// Calorimeter that recorded the hit.
    pub hit_type: HitType,
    /// Region of the detector containing the hit.
    pub region: DetectorRegion,
    /// Opaque id of the originating hit in the caller's event model.
    pub parent_address: u64,
}

/// One calorimeter cell deposit. Hits are created once per event by the input adapter
/// and owned by the object store; clusters refer to them by id.
#[derive(Clone, Debug)]
pub struct CaloHit {
    parameters: CaloHitParameters,
    pseudo_layer: u32,
    mc_particle: Option<McId>,
}

impl CaloHit {
    pub(crate) fn new(
        parameters: CaloHitParameters,
        pseudo_layer: u32,
        mc_particle: Option<McId>,
    ) -> Self {
        Self {
            parameters,
            pseudo_layer,
            mc_particle,
        }
    }

    /// Cell centre position.
    #[must_use]
    pub const fn position(&self) -> &CartesianVector {
        &self.parameters.position
    }

    /// Unit vector of the expected shower direction at the cell.
    #[must_use]
    pub const fn expected_direction(&self) -> &CartesianVector {
        &self.parameters.expected_direction
    }

    /// Unit normal to the sampling cell.
    #[must_use]
    pub const fn cell_normal(&self) -> &CartesianVector {
        &self.parameters.cell_normal
    }

    /// Cell dimension transverse to the expected shower direction, in mm.
    #[must_use]
    pub const fn cell_size_transverse(&self) -> f64 {
        self.parameters.cell_size_transverse
    }

    /// Cell dimension along the expected shower direction, in mm.
    #[must_use]
    pub const fn cell_size_longitudinal(&self) -> f64 {
        self.parameters.cell_size_longitudinal
    }

    /// Characteristic cell size used to normalise cell-relative distance cuts.
    #[must_use]
    pub const fn cell_length_scale(&self) -> f64 {
        self.parameters.cell_size_transverse
    }

    /// Number of radiation lengths between the interaction point and the cell.
    #[must_use]
    pub const fn n_radiation_lengths(&self) -> f64 {
        self.parameters.n_radiation_lengths
    }

    /// Number of interaction lengths between the interaction point and the cell.
    #[must_use]
    pub const fn n_interaction_lengths(&self) -> f64 {
        self.parameters.n_interaction_lengths
    }

    /// Raw energy deposited in the cell, in GeV.
    #[must_use]
    pub const fn input_energy(&self) -> f64 {
        self.parameters.input_energy
    }

    /// Calibrated electromagnetic energy, in GeV.
    #[must_use]
    pub const fn electromagnetic_energy(&self) -> f64 {
        self.parameters.electromagnetic_energy
    }

    /// Calibrated hadronic energy, in GeV.
    #[must_use]
    pub const fn hadronic_energy(&self) -> f64 {
        self.parameters.hadronic_energy
    }

    /// Local energy-density weight.
    #[must_use]
    pub const fn density_weight(&self) -> f64 {
        self.parameters.density_weight
    }

    /// Whether the cell deposit is consistent with a minimum-ionising particle.
    #[must_use]
    pub const fn is_possible_mip(&self) -> bool {
        self.parameters.is_possible_mip
    }

    /// Whether the hit is isolated from the surrounding shower activity.
    #[must_use]
    pub const fn is_isolated(&self) -> bool {
        self.parameters.is_isolated
    }

    /// Calorimeter that recorded the hit.
    #[must_use]
    pub const fn hit_type(&self) -> HitType {
        self.parameters.hit_type
    }

    /// Region of the detector containing the hit.
    #[must_use]
    pub const fn region(&self) -> DetectorRegion {
        self.parameters.region
    }

    /// Pseudo layer assigned at creation via the pseudo-layer calculator.
    #[must_use]
    pub const fn pseudo_layer(&self) -> u32 {
        self.pseudo_layer
    }

    /// Truth link, absent when the event carries no MC information.
    #[must_use]
    pub const fn mc_particle(&self) -> Option<McId> {
        self.mc_particle
    }

    /// Opaque id of the originating hit in the caller's event model.
    #[must_use]
    pub const fn parent_address(&self) -> u64 {
        self.parameters.parent_address
    }
}

/// A hit entry inside one pseudo layer, carrying the sort key used for the per-layer
/// ordering.
#[derive(Clone, Copy, Debug, PartialEq)]
struct LayerEntry {
    sort_key: f64,
    id: HitId,
}

/// Mapping from pseudo layer to the hits recorded in that layer.
///
/// Iteration yields layers in ascending order; within a layer, hits are ordered by
/// descending sort key (input energy) with the creation id as tie-break, so that two
/// runs over the same event visit hits in an identical sequence.
#[derive(Clone, Debug, Default)]
pub struct OrderedCaloHitList {
    layers: BTreeMap<u32, Vec<LayerEntry>>,
}

impl OrderedCaloHitList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hit to `layer` with the given sort key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failure`] if the hit is already present in that layer.
    pub fn add_hit(&mut self, id: HitId, layer: u32, sort_key: f64) -> Result<()> {
        let entries = self.layers.entry(layer).or_default();

        if entries.iter().any(|entry| entry.id == id) {
            return Err(Error::Failure(format!(
                "calo hit {id:?} already present in layer {layer}"
            )));
        }

        let entry = LayerEntry { sort_key, id };
        let position = entries
            .iter()
            .position(|other| {
                (other.sort_key, std::cmp::Reverse(other.id)) < (entry.sort_key, std::cmp::Reverse(entry.id))
            })
            .unwrap_or(entries.len());
        entries.insert(position, entry);

        Ok(())
    }

    /// Remove a hit from `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if the hit is not present in that layer.
    pub fn remove_hit(&mut self, id: HitId, layer: u32) -> Result<()> {
        let entries = self
            .layers
            .get_mut(&layer)
            .ok_or_else(|| Error::OutOfRange(format!("layer {layer}")))?;
        let position = entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or_else(|| Error::OutOfRange(format!("{id:?} in layer {layer}")))?;

        entries.remove(position);

        if entries.is_empty() {
            self.layers.remove(&layer);
        }

        Ok(())
    }

    /// Union with another list at layer granularity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failure`] if any hit of `other` is already present; the list is
    /// unchanged in that case.
    pub fn add_list(&mut self, other: &Self) -> Result<()> {
        for (layer, id) in other.hits() {
            if self.contains(id, layer) {
                return Err(Error::Failure(format!(
                    "calo hit {id:?} already present in layer {layer}"
                )));
            }
        }

        for (layer, entries) in &other.layers {
            for entry in entries {
                self.add_hit(entry.id, *layer, entry.sort_key)?;
            }
        }

        Ok(())
    }

    /// Difference with another list at layer granularity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if any hit of `other` is absent; the list is
    /// unchanged in that case.
    pub fn remove_list(&mut self, other: &Self) -> Result<()> {
        for (layer, id) in other.hits() {
            if !self.contains(id, layer) {
                return Err(Error::OutOfRange(format!("{id:?} in layer {layer}")));
            }
        }

        for (layer, id) in other.hits() {
            self.remove_hit(id, layer)?;
        }

        Ok(())
    }

    /// Whether the hit is present in `layer`.
    #[must_use]
    pub fn contains(&self, id: HitId, layer: u32) -> bool {
        self.layers
            .get(&layer)
            .is_some_and(|entries| entries.iter().any(|entry| entry.id == id))
    }

    /// Iterate over the occupied pseudo layers, in ascending order.
    pub fn layers(&self) -> impl Iterator<Item = u32> + '_ {
        self.layers.keys().copied()
    }

    /// Iterate over the hits in one layer, in sort-key order.
    pub fn layer_hits(&self, layer: u32) -> impl Iterator<Item = HitId> + '_ {
        self.layers
            .get(&layer)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|entry| entry.id))
    }

    /// Number of hits in one layer.
    #[must_use]
    pub fn n_hits_in_layer(&self, layer: u32) -> usize {
        self.layers.get(&layer).map_or(0, Vec::len)
    }

    /// Iterate over all `(layer, hit)` pairs, layers ascending, hits in sort-key order.
    pub fn hits(&self) -> impl Iterator<Item = (u32, HitId)> + '_ {
        self.layers
            .iter()
            .flat_map(|(layer, entries)| entries.iter().map(|entry| (*layer, entry.id)))
    }

    /// Innermost occupied pseudo layer.
    #[must_use]
    pub fn inner_layer(&self) -> Option<u32> {
        self.layers.keys().next().copied()
    }

    /// Outermost occupied pseudo layer.
    #[must_use]
    pub fn outer_layer(&self) -> Option<u32> {
        self.layers.keys().next_back().copied()
    }

    /// Total number of hits.
    #[must_use]
    pub fn n_hits(&self) -> usize {
        self.layers.values().map(Vec::len).sum()
    }

    /// Number of occupied pseudo layers.
    #[must_use]
    pub fn n_occupied_layers(&self) -> usize {
        self.layers.len()
    }

    /// Whether the list holds no hits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Remove all hits.
    pub fn clear(&mut self) {
        self.layers.clear();
    }
}
