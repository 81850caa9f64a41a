//! Cone clustering: grows calorimeter clusters pseudo-layer by pseudo-layer using a
//! composite "generic distance" between a candidate hit and each cluster, optionally
//! seeding clusters from tracks.
//!
//! The inward variant runs the identical machinery with the layer schedule reversed;
//! it is registered as its own stage type with track seeding disabled and
//! density-weight hit ordering, which is the configuration used for ECAL photon
//! finding.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::{Error, Result};
use super::fit::{self, ClusterFitResult};
use super::geometry::Granularity;
use super::hit::{CaloHit, HitId, HitType};
use super::store::{ClusterSeed, EventStore};
use super::vector::CartesianVector;

/// How clusters are seeded from tracks before any hit is examined.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SeedStrategy {
    /// No track seeding.
    None,
    /// Seed from every track that reaches the calorimeter and can form a PFO.
    AllTracks,
    /// As `AllTracks`, restricted to central tracks below a |cos theta| cut.
    CentralTracks,
}

impl SeedStrategy {
    fn from_config(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::AllTracks),
            2 => Ok(Self::CentralTracks),
            _ => Err(Error::InvalidParameter(format!("ClusterSeedStrategy {value}"))),
        }
    }
}

/// Sort order of the hits within one pseudo layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum HitOrder {
    /// Decreasing input energy.
    InputEnergy,
    /// Decreasing density weight.
    DensityWeight,
}

impl HitOrder {
    fn from_config(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::InputEnergy),
            1 => Ok(Self::DensityWeight),
            _ => Err(Error::InvalidParameter(format!("HitSortingStrategy {value}"))),
        }
    }

    fn key(self, hit: &CaloHit) -> f64 {
        match self {
            Self::InputEnergy => hit.input_energy(),
            Self::DensityWeight => hit.density_weight(),
        }
    }
}

/// When a same-layer assignment is committed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FormationStrategy {
    /// Each hit is assigned as soon as its best cluster is known.
    Immediate,
    /// All assignments of the pass are deferred until the pass ends.
    Batched,
}

impl FormationStrategy {
    fn from_config(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Immediate),
            1 => Ok(Self::Batched),
            _ => Err(Error::InvalidParameter(format!("ClusterFormationStrategy {value}"))),
        }
    }
}

/// The cone clustering stage.
pub struct ConeClusteringAlgorithm {
    inward: bool,
    seed_strategy: SeedStrategy,
    seed_max_abs_cos_theta: f64,
    hit_order: HitOrder,
    formation_strategy: FormationStrategy,

    should_use_only_ecal_hits: bool,
    should_use_isolated_hits: bool,

    layers_to_step_back_fine: u32,
    layers_to_step_back_coarse: u32,

    generic_distance_cut: f64,
    min_hit_track_cos_angle: f64,
    min_hit_cluster_cos_angle: f64,

    should_use_track_seed: bool,
    track_seed_cut_off_layer: u32,
    should_follow_initial_direction: bool,

    same_layer_pad_widths_fine: f64,
    same_layer_pad_widths_coarse: f64,

    cone_approach_max_separation2: f64,
    tan_cone_angle_fine: f64,
    tan_cone_angle_coarse: f64,
    additional_pad_widths_fine: f64,
    additional_pad_widths_coarse: f64,
    max_cluster_dir_projection: f64,
    min_cluster_dir_projection: f64,

    track_path_width: f64,
    max_track_seed_separation2: f64,
    max_layers_to_track_seed: u32,
    max_layers_to_track_like_hit: u32,

    n_layers_spanned_for_fit: u32,
    n_layers_spanned_for_approx_fit: u32,
    n_layers_to_fit: usize,
    n_layers_to_fit_low_mip_cut: f64,
    n_layers_to_fit_low_mip_multiplier: usize,

    fit_success_dot_product_cut1: f64,
    fit_success_chi2_cut1: f64,
    fit_success_dot_product_cut2: f64,
    fit_success_chi2_cut2: f64,
    mip_track_chi2_cut: f64,
}

impl ConeClusteringAlgorithm {
    /// The outward-growing configuration used for primary clustering.
    #[must_use]
    pub fn outward() -> Self {
        Self {
            inward: false,
            seed_strategy: SeedStrategy::AllTracks,
            seed_max_abs_cos_theta: 0.95,
            hit_order: HitOrder::InputEnergy,
            formation_strategy: FormationStrategy::Immediate,
            should_use_only_ecal_hits: false,
            should_use_isolated_hits: false,
            layers_to_step_back_fine: 3,
            layers_to_step_back_coarse: 3,
            generic_distance_cut: 1.0,
            min_hit_track_cos_angle: 0.8,
            min_hit_cluster_cos_angle: 0.0,
            should_use_track_seed: true,
            track_seed_cut_off_layer: 0,
            should_follow_initial_direction: false,
            same_layer_pad_widths_fine: 2.8,
            same_layer_pad_widths_coarse: 1.8,
            cone_approach_max_separation2: 1000.0 * 1000.0,
            tan_cone_angle_fine: 0.3,
            tan_cone_angle_coarse: 0.5,
            additional_pad_widths_fine: 2.5,
            additional_pad_widths_coarse: 2.5,
            max_cluster_dir_projection: 200.0,
            min_cluster_dir_projection: -10.0,
            track_path_width: 2.0,
            max_track_seed_separation2: 250.0 * 250.0,
            max_layers_to_track_seed: 3,
            max_layers_to_track_like_hit: 3,
            n_layers_spanned_for_fit: 6,
            n_layers_spanned_for_approx_fit: 10,
            n_layers_to_fit: 8,
            n_layers_to_fit_low_mip_cut: 0.5,
            n_layers_to_fit_low_mip_multiplier: 2,
            fit_success_dot_product_cut1: 0.75,
            fit_success_chi2_cut1: 5.0,
            fit_success_dot_product_cut2: 0.50,
            fit_success_chi2_cut2: 2.5,
            mip_track_chi2_cut: 2.5,
        }
    }

    /// The inward-growing configuration used for ECAL photon finding.
    #[must_use]
    pub fn inward() -> Self {
        Self {
            inward: true,
            seed_strategy: SeedStrategy::None,
            should_use_track_seed: false,
            should_use_only_ecal_hits: true,
            hit_order: HitOrder::DensityWeight,
            ..Self::outward()
        }
    }

    fn granularity_is_fine(hit: &CaloHit) -> bool {
        super::geometry::granularity(hit.hit_type()) == Granularity::Fine
    }

    fn step_back_layers(&self, hit: &CaloHit) -> u32 {
        if Self::granularity_is_fine(hit) {
            self.layers_to_step_back_fine
        } else {
            self.layers_to_step_back_coarse
        }
    }

    fn seed_clusters_with_tracks(&self, context: &mut EventContext<'_>) -> Result<Vec<ClusterId>> {
        let mut clusters = Vec::new();

        if self.inward
            || !self.should_use_track_seed
            || (self.seed_strategy == SeedStrategy::None)
        {
            return Ok(clusters);
        }

        for track_id in context.store.current_track_ids()? {
            let track = context.store.track(track_id)?;

            if !track.reaches_calorimeter() || !track.can_form_pfo() {
                continue;
            }

            if self.seed_strategy == SeedStrategy::CentralTracks {
                let momentum = track.momentum_at_dca();
                let magnitude = momentum.magnitude();

                if (magnitude <= 0.0)
                    || ((momentum.z / magnitude).abs() > self.seed_max_abs_cos_theta)
                {
                    continue;
                }
            }

            clusters.push(context.store.create_cluster(ClusterSeed::Track(track_id))?);
        }

        Ok(clusters)
    }

    /// Smallest cone-approach distance between the hit and the cluster hits in the
    /// examined layers, measured around `direction`.
    fn cone_approach_distance(
        &self,
        hit: &CaloHit,
        cluster_hit_position: &CartesianVector,
        direction: &CartesianVector,
    ) -> Option<f64> {
        let difference = *hit.position() - *cluster_hit_position;

        if difference.magnitude_squared() > self.cone_approach_max_separation2 {
            return None;
        }

        let d_along = direction.dot(&difference);

        if (d_along < self.min_cluster_dir_projection) || (d_along > self.max_cluster_dir_projection)
        {
            return None;
        }

        let (tan_cone_angle, additional_pad_widths) = if Self::granularity_is_fine(hit) {
            (self.tan_cone_angle_fine, self.additional_pad_widths_fine)
        } else {
            (self.tan_cone_angle_coarse, self.additional_pad_widths_coarse)
        };

        let d_perp = direction.cross(&difference).magnitude();
        let cut = d_along
            .abs()
            .mul_add(tan_cone_angle, additional_pad_widths * hit.cell_length_scale());

        (cut > 0.0).then(|| d_perp / cut)
    }

    /// Distance between the hit and another hit in the same layer, in units of pad
    /// widths.
    fn same_layer_distance(&self, hit: &CaloHit, other_position: &CartesianVector) -> Option<f64> {
        let pad_widths = if Self::granularity_is_fine(hit) {
            self.same_layer_pad_widths_fine
        } else {
            self.same_layer_pad_widths_coarse
        };

        let cut = pad_widths * hit.cell_length_scale();
        (cut > 0.0).then(|| (*hit.position() - *other_position).magnitude() / cut)
    }

    /// Distance between the hit and the projected track seed, in units of the track
    /// path width. Only computed close to the calorimeter front face or while the
    /// cluster still looks track-like.
    fn track_seed_distance(
        &self,
        store: &EventStore,
        cluster_id: ClusterId,
        hit: &CaloHit,
        search_layer: u32,
    ) -> Result<Option<f64>> {
        let cluster = store.cluster(cluster_id)?;

        let Some(track_id) = cluster.seed_track() else {
            return Ok(None);
        };

        if !self.should_use_track_seed || self.inward {
            return Ok(None);
        }

        if (self.track_seed_cut_off_layer > 0) && (search_layer > self.track_seed_cut_off_layer) {
            return Ok(None);
        }

        let within_seed_layers = search_layer <= self.max_layers_to_track_seed;
        let near_track_like_hit = cluster.is_mip_track()
            && cluster.outer_layer().is_some_and(|outer| {
                search_layer.saturating_sub(outer) <= self.max_layers_to_track_like_hit
            });

        if !within_seed_layers && !near_track_like_hit {
            return Ok(None);
        }

        let track = store.track(track_id)?;
        let seed_position = track.calorimeter_state().position;
        let seed_direction = track.calorimeter_state().momentum.unit_vector()?;

        let difference = *hit.position() - seed_position;

        if difference.magnitude_squared() > self.max_track_seed_separation2 {
            return Ok(None);
        }

        if within_seed_layers
            && (hit.position().cos_opening_angle(&seed_position)? < self.min_hit_track_cos_angle)
        {
            return Ok(None);
        }

        let d_perp = seed_direction.cross(&difference).magnitude();
        Ok((self.track_path_width > 0.0).then(|| d_perp / self.track_path_width))
    }

    /// The direction used to grow the cluster at this point of the pass.
    fn growth_direction(
        &self,
        cluster_fit: Option<&ClusterFitResult>,
        initial_direction: &CartesianVector,
    ) -> CartesianVector {
        let direction = if self.should_follow_initial_direction {
            *initial_direction
        } else {
            cluster_fit
                .and_then(|f| f.direction().ok())
                .unwrap_or(*initial_direction)
        };

        // the inward variant approaches the interaction point, so the cone opens
        // against the nominal direction
        if self.inward {
            -direction
        } else {
            direction
        }
    }

    /// The composite generic distance between a hit and a cluster; the smaller the
    /// distance, the stronger the association.
    fn generic_distance(
        &self,
        store: &EventStore,
        cluster_id: ClusterId,
        hit: &CaloHit,
        search_layer: u32,
    ) -> Result<Option<f64>> {
        let cluster = store.cluster(cluster_id)?;
        let mut smallest: Option<f64> = None;

        let mut consider = |candidate: Option<f64>| {
            if let Some(distance) = candidate {
                if smallest.is_none_or(|current| distance < current) {
                    smallest = Some(distance);
                }
            }
        };

        consider(self.track_seed_distance(store, cluster_id, hit, search_layer)?);

        if cluster.n_calo_hits() > 0 {
            let initial_direction = cluster.initial_direction()?;
            let direction = self.growth_direction(cluster.current_fit(), &initial_direction);

            if hit
                .position()
                .cos_opening_angle(&initial_direction)
                .unwrap_or(1.0)
                < self.min_hit_cluster_cos_angle
            {
                return Ok(smallest);
            }

            let step_back = self.step_back_layers(hit);

            for layer in cluster.ordered_hits().layers() {
                let in_step_back_window = if self.inward {
                    (layer > search_layer) && (layer - search_layer <= step_back)
                } else {
                    (layer < search_layer) && (search_layer - layer <= step_back)
                };

                if layer == search_layer {
                    for other_id in cluster.ordered_hits().layer_hits(layer) {
                        let other = store.hit(other_id)?;
                        consider(self.same_layer_distance(hit, other.position()));
                    }
                } else if in_step_back_window {
                    for other_id in cluster.ordered_hits().layer_hits(layer) {
                        let other = store.hit(other_id)?;
                        consider(self.cone_approach_distance(hit, other.position(), &direction));
                    }
                }
            }
        }

        Ok(smallest)
    }

    /// Sorted, filtered hits of one layer: available hits only, ordered by the
    /// configured sort key with the creation id as tie-break.
    fn sorted_layer_hits(
        &self,
        store: &EventStore,
        layer: u32,
    ) -> Result<Vec<(HitId, CaloHit)>> {
        let mut hits: Vec<(HitId, CaloHit)> = Vec::new();

        for id in store.current_ordered_hits()?.layer_hits(layer) {
            if !store.is_hit_available(id) {
                continue;
            }

            let hit = store.hit(id)?.clone();

            if self.should_use_only_ecal_hits && (hit.hit_type() != HitType::Ecal) {
                continue;
            }

            if !self.should_use_isolated_hits && hit.is_isolated() {
                continue;
            }

            hits.push((id, hit));
        }

        hits.sort_by(|(lhs_id, lhs), (rhs_id, rhs)| {
            self.hit_order
                .key(rhs)
                .partial_cmp(&self.hit_order.key(lhs))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(lhs_id.cmp(rhs_id))
        });

        Ok(hits)
    }

    /// Match the layer's hits against the clusters built so far; returns the hits
    /// left unassigned.
    fn find_hits_in_previous_layers(
        &self,
        store: &mut EventStore,
        layer: u32,
        layer_hits: Vec<(HitId, CaloHit)>,
        clusters: &[ClusterId],
    ) -> Result<Vec<(HitId, CaloHit)>> {
        let mut remaining = Vec::new();

        for (hit_id, hit) in layer_hits {
            let mut best: Option<(f64, ClusterId)> = None;

            for cluster_id in clusters {
                if !store.cluster_exists(*cluster_id) {
                    continue;
                }

                if let Some(distance) = self.generic_distance(store, *cluster_id, &hit, layer)? {
                    if (distance < self.generic_distance_cut)
                        && best.is_none_or(|(current, _)| distance < current)
                    {
                        best = Some((distance, *cluster_id));
                    }
                }
            }

            if let Some((_, cluster_id)) = best {
                store.add_hit_to_cluster(cluster_id, hit_id)?;
            } else {
                remaining.push((hit_id, hit));
            }
        }

        Ok(remaining)
    }

    /// Match the remaining hits against clusters already occupying this layer; hits
    /// with no match seed new clusters.
    fn find_hits_in_same_layer(
        &self,
        store: &mut EventStore,
        layer: u32,
        layer_hits: Vec<(HitId, CaloHit)>,
        clusters: &mut Vec<ClusterId>,
    ) -> Result<()> {
        match self.formation_strategy {
            FormationStrategy::Immediate => {
                for (hit_id, hit) in layer_hits {
                    let mut best: Option<(f64, ClusterId)> = None;

                    for cluster_id in clusters.iter() {
                        if !store.cluster_exists(*cluster_id) {
                            continue;
                        }

                        if let Some(distance) =
                            self.generic_distance(store, *cluster_id, &hit, layer)?
                        {
                            if (distance < self.generic_distance_cut)
                                && best.is_none_or(|(current, _)| distance < current)
                            {
                                best = Some((distance, *cluster_id));
                            }
                        }
                    }

                    if let Some((_, cluster_id)) = best {
                        store.add_hit_to_cluster(cluster_id, hit_id)?;
                    } else {
                        clusters.push(store.create_cluster(ClusterSeed::Hit(hit_id))?);
                    }
                }
            }
            FormationStrategy::Batched => {
                let mut assignments = Vec::new();
                let mut unmatched = Vec::new();

                for (hit_id, hit) in layer_hits {
                    let mut best: Option<(f64, ClusterId)> = None;

                    for cluster_id in clusters.iter() {
                        if !store.cluster_exists(*cluster_id) {
                            continue;
                        }

                        if let Some(distance) =
                            self.generic_distance(store, *cluster_id, &hit, layer)?
                        {
                            if (distance < self.generic_distance_cut)
                                && best.is_none_or(|(current, _)| distance < current)
                            {
                                best = Some((distance, *cluster_id));
                            }
                        }
                    }

                    if let Some((_, cluster_id)) = best {
                        assignments.push((hit_id, cluster_id));
                    } else {
                        unmatched.push(hit_id);
                    }
                }

                for (hit_id, cluster_id) in assignments {
                    store.add_hit_to_cluster(cluster_id, hit_id)?;
                }

                for hit_id in unmatched {
                    clusters.push(store.create_cluster(ClusterSeed::Hit(hit_id))?);
                }
            }
        }

        Ok(())
    }

    /// Refit every cluster's outer section and update its current direction and
    /// mip-track flag.
    fn update_cluster_properties(
        &self,
        store: &mut EventStore,
        clusters: &[ClusterId],
    ) -> Result<()> {
        for cluster_id in clusters {
            if !store.cluster_exists(*cluster_id) {
                continue;
            }

            let cluster = store.cluster(*cluster_id)?;

            if cluster.n_calo_hits() == 0 {
                continue;
            }

            let span = cluster.layer_span();

            if span < self.n_layers_spanned_for_fit {
                continue;
            }

            let mut n_layers_to_fit = self.n_layers_to_fit;
            if cluster.mip_fraction() < self.n_layers_to_fit_low_mip_cut {
                n_layers_to_fit *= self.n_layers_to_fit_low_mip_multiplier;
            }

            let initial_direction = cluster.initial_direction()?;
            let fit_result = fit::fit_end(store.hits_arena(), cluster, n_layers_to_fit)?;

            let accepted = if fit_result.is_successful() {
                let dot = fit_result.direction()?.dot(&initial_direction);
                let chi2 = fit_result.chi2()?;

                ((dot > self.fit_success_dot_product_cut1) && (chi2 < self.fit_success_chi2_cut1))
                    || ((dot > self.fit_success_dot_product_cut2)
                        && (chi2 < self.fit_success_chi2_cut2))
            } else {
                false
            };

            let current_fit = if accepted {
                Some(fit_result)
            } else if span >= self.n_layers_spanned_for_approx_fit {
                // approximate fit: straight line between the end-layer centroids
                Self::approximate_fit(store, *cluster_id)?
            } else {
                None
            };

            let drop_mip_flag = {
                let cluster = store.cluster(*cluster_id)?;
                cluster.seed_track().is_some()
                    && cluster.is_mip_track()
                    && !(fit_result.is_successful() && fit_result.chi2()? < self.mip_track_chi2_cut)
            };

            let cluster = store.cluster_mut(*cluster_id)?;
            cluster.set_current_fit(current_fit);

            if drop_mip_flag {
                cluster.set_mip_track(false);
            }
        }

        Ok(())
    }

    fn approximate_fit(
        store: &EventStore,
        cluster_id: ClusterId,
    ) -> Result<Option<ClusterFitResult>> {
        let cluster = store.cluster(cluster_id)?;

        let (Some(inner), Some(outer)) = (cluster.inner_layer(), cluster.outer_layer()) else {
            return Ok(None);
        };

        let inner_centroid = cluster.centroid(inner)?;
        let outer_centroid = cluster.centroid(outer)?;
        let Ok(direction) = (outer_centroid - inner_centroid).unit_vector() else {
            return Ok(None);
        };

        let radial = inner_centroid.unit_vector().map_or(0.0, |r| direction.dot(&r));

        Ok(Some(ClusterFitResult::new(direction, inner_centroid, 0.0, 0.0, radial)))
    }

    fn remove_empty_clusters(store: &mut EventStore, clusters: &[ClusterId]) -> Result<()> {
        for cluster_id in clusters {
            if store.cluster_exists(*cluster_id)
                && store.cluster(*cluster_id)?.is_empty()
            {
                store.delete_cluster(*cluster_id)?;
            }
        }

        Ok(())
    }
}

impl Algorithm for ConeClusteringAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        if let Some(value) = config.get::<u32>("ClusterSeedStrategy")? {
            self.seed_strategy = SeedStrategy::from_config(value)?;
        }
        if let Some(value) = config.get::<u32>("HitSortingStrategy")? {
            self.hit_order = HitOrder::from_config(value)?;
        }
        if let Some(value) = config.get::<u32>("ClusterFormationStrategy")? {
            self.formation_strategy = FormationStrategy::from_config(value)?;
        }

        self.seed_max_abs_cos_theta =
            config.read_or("SeedMaxAbsCosTheta", self.seed_max_abs_cos_theta)?;
        self.should_use_only_ecal_hits =
            config.read_or("ShouldUseOnlyECalHits", self.should_use_only_ecal_hits)?;
        self.should_use_isolated_hits =
            config.read_or("ShouldUseIsolatedHits", self.should_use_isolated_hits)?;
        self.layers_to_step_back_fine =
            config.read_or("LayersToStepBackFine", self.layers_to_step_back_fine)?;
        self.layers_to_step_back_coarse =
            config.read_or("LayersToStepBackCoarse", self.layers_to_step_back_coarse)?;
        self.generic_distance_cut =
            config.read_or("GenericDistanceCut", self.generic_distance_cut)?;

        if self.generic_distance_cut <= 0.0 {
            return Err(Error::InvalidParameter(
                "GenericDistanceCut must be positive".to_owned(),
            ));
        }

        self.min_hit_track_cos_angle =
            config.read_or("MinHitTrackCosAngle", self.min_hit_track_cos_angle)?;
        self.min_hit_cluster_cos_angle =
            config.read_or("MinHitClusterCosAngle", self.min_hit_cluster_cos_angle)?;
        self.should_use_track_seed =
            config.read_or("ShouldUseTrackSeed", self.should_use_track_seed)?;
        self.track_seed_cut_off_layer =
            config.read_or("TrackSeedCutOffLayer", self.track_seed_cut_off_layer)?;
        self.should_follow_initial_direction = config
            .read_or("ShouldFollowInitialDirection", self.should_follow_initial_direction)?;
        self.same_layer_pad_widths_fine =
            config.read_or("SameLayerPadWidthsFine", self.same_layer_pad_widths_fine)?;
        self.same_layer_pad_widths_coarse =
            config.read_or("SameLayerPadWidthsCoarse", self.same_layer_pad_widths_coarse)?;

        let cone_approach_max_separation = config.read_or(
            "ConeApproachMaxSeparation",
            self.cone_approach_max_separation2.sqrt(),
        )?;
        self.cone_approach_max_separation2 =
            cone_approach_max_separation * cone_approach_max_separation;

        self.tan_cone_angle_fine = config.read_or("TanConeAngleFine", self.tan_cone_angle_fine)?;
        self.tan_cone_angle_coarse =
            config.read_or("TanConeAngleCoarse", self.tan_cone_angle_coarse)?;
        self.additional_pad_widths_fine =
            config.read_or("AdditionalPadWidthsFine", self.additional_pad_widths_fine)?;
        self.additional_pad_widths_coarse =
            config.read_or("AdditionalPadWidthsCoarse", self.additional_pad_widths_coarse)?;
        self.max_cluster_dir_projection =
            config.read_or("MaxClusterDirProjection", self.max_cluster_dir_projection)?;
        self.min_cluster_dir_projection =
            config.read_or("MinClusterDirProjection", self.min_cluster_dir_projection)?;
        self.track_path_width = config.read_or("TrackPathWidth", self.track_path_width)?;

        let max_track_seed_separation = config.read_or(
            "MaxTrackSeedSeparation",
            self.max_track_seed_separation2.sqrt(),
        )?;
        self.max_track_seed_separation2 = max_track_seed_separation * max_track_seed_separation;

        self.max_layers_to_track_seed =
            config.read_or("MaxLayersToTrackSeed", self.max_layers_to_track_seed)?;
        self.max_layers_to_track_like_hit =
            config.read_or("MaxLayersToTrackLikeHit", self.max_layers_to_track_like_hit)?;
        self.n_layers_spanned_for_fit =
            config.read_or("NLayersSpannedForFit", self.n_layers_spanned_for_fit)?;
        self.n_layers_spanned_for_approx_fit =
            config.read_or("NLayersSpannedForApproxFit", self.n_layers_spanned_for_approx_fit)?;
        self.n_layers_to_fit = config.read_or("NLayersToFit", self.n_layers_to_fit)?;
        self.n_layers_to_fit_low_mip_cut =
            config.read_or("NLayersToFitLowMipCut", self.n_layers_to_fit_low_mip_cut)?;
        self.n_layers_to_fit_low_mip_multiplier = config
            .read_or("NLayersToFitLowMipMultiplier", self.n_layers_to_fit_low_mip_multiplier)?;
        self.fit_success_dot_product_cut1 =
            config.read_or("FitSuccessDotProductCut1", self.fit_success_dot_product_cut1)?;
        self.fit_success_chi2_cut1 =
            config.read_or("FitSuccessChi2Cut1", self.fit_success_chi2_cut1)?;
        self.fit_success_dot_product_cut2 =
            config.read_or("FitSuccessDotProductCut2", self.fit_success_dot_product_cut2)?;
        self.fit_success_chi2_cut2 =
            config.read_or("FitSuccessChi2Cut2", self.fit_success_chi2_cut2)?;
        self.mip_track_chi2_cut = config.read_or("MipTrackChi2Cut", self.mip_track_chi2_cut)?;

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let mut clusters = self.seed_clusters_with_tracks(context)?;

        let mut layers: Vec<u32> = context.store.current_ordered_hits()?.layers().collect();
        if self.inward {
            layers.reverse();
        }

        for layer in layers {
            let layer_hits = self.sorted_layer_hits(context.store, layer)?;

            let remaining =
                self.find_hits_in_previous_layers(context.store, layer, layer_hits, &clusters)?;
            self.update_cluster_properties(context.store, &clusters)?;
            self.find_hits_in_same_layer(context.store, layer, remaining, &mut clusters)?;
        }

        Self::remove_empty_clusters(context.store, &clusters)?;

        log::debug!(
            "cone clustering ({}): {} clusters in list {}",
            if self.inward { "inward" } else { "outward" },
            context.store.current_cluster_ids()?.len(),
            context.store.current_cluster_list_name()?,
        );

        Ok(())
    }
}
