//! Shower-mip merging: joins the end of a mip-like parent cluster to the start of a
//! shower-like daughter when the two fit directions line up. Four registered
//! variants share the implementation and tighten the cuts in different ways.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::{Error, Result};
use super::fit::{self, ClusterFitResult};
use super::geometry::{granularity, Granularity};
use super::store::EventStore;
use super::topological::sort_clusters_for_merging;

/// One shower-mip merging pass.
pub struct ShowerMipMergingAlgorithm {
    variant: u8,
    can_merge_min_mip_fraction: f64,
    can_merge_max_rms: f64,
    min_hits_in_cluster: usize,
    min_occupied_layers: usize,
    min_parent_mip_fraction: f64,
    n_parent_fit_layers: usize,
    n_daughter_fit_layers: usize,
    max_layer_difference: u32,
    fit_direction_dot_product_cut: f64,
    merge_cut_fine: f64,
    merge_cut_coarse: f64,
    perpendicular_cut_fine: f64,
    perpendicular_cut_coarse: f64,
    max_centroid_distance: f64,
}

impl ShowerMipMergingAlgorithm {
    /// Build the pass for one of the four registered variants.
    ///
    /// # Panics
    ///
    /// Panics for variants outside `1..=4`; the registered factories only use valid
    /// ones.
    #[must_use]
    pub fn variant(variant: u8) -> Self {
        assert!((1..=4).contains(&variant), "unknown shower-mip variant");

        let base = Self {
            variant,
            can_merge_min_mip_fraction: 0.7,
            can_merge_max_rms: 5.0,
            min_hits_in_cluster: 4,
            min_occupied_layers: 4,
            min_parent_mip_fraction: 0.7,
            n_parent_fit_layers: 8,
            n_daughter_fit_layers: 5,
            max_layer_difference: 10,
            fit_direction_dot_product_cut: 0.7,
            merge_cut_fine: 50.0,
            merge_cut_coarse: 75.0,
            perpendicular_cut_fine: 50.0,
            perpendicular_cut_coarse: 75.0,
            max_centroid_distance: 1000.0,
        };

        match variant {
            2 => Self {
                max_layer_difference: 4,
                fit_direction_dot_product_cut: 0.8,
                ..base
            },
            3 => Self {
                fit_direction_dot_product_cut: 0.9,
                merge_cut_fine: 25.0,
                merge_cut_coarse: 50.0,
                ..base
            },
            4 => Self {
                fit_direction_dot_product_cut: 0.9,
                perpendicular_cut_fine: 25.0,
                perpendicular_cut_coarse: 50.0,
                max_centroid_distance: 500.0,
                ..base
            },
            _ => base,
        }
    }

    fn parent_fit(&self, store: &mut EventStore, parent_id: ClusterId) -> Result<ClusterFitResult> {
        // the third variant fits the whole parent instead of its end section
        if self.variant == 3 {
            store.fit_to_all_hits(parent_id)
        } else {
            fit::fit_end(store.hits_arena(), store.cluster(parent_id)?, self.n_parent_fit_layers)
        }
    }

    fn merge_cut(&self, store: &EventStore, daughter_id: ClusterId) -> Result<f64> {
        let daughter = store.cluster(daughter_id)?;
        let inner_layer = daughter
            .inner_layer()
            .ok_or(Error::NotInitialized("inner layer of empty daughter"))?;
        let first_hit = daughter
            .ordered_hits()
            .layer_hits(inner_layer)
            .next()
            .ok_or(Error::Failure("occupied layer without hits".to_owned()))?;

        Ok(match granularity(store.hit(first_hit)?.hit_type()) {
            Granularity::Fine => self.merge_cut_fine,
            Granularity::Coarse | Granularity::VeryCoarse => self.merge_cut_coarse,
        })
    }

    fn perpendicular_cut(&self, store: &EventStore, daughter_id: ClusterId) -> Result<f64> {
        let daughter = store.cluster(daughter_id)?;
        let inner_layer = daughter
            .inner_layer()
            .ok_or(Error::NotInitialized("inner layer of empty daughter"))?;
        let first_hit = daughter
            .ordered_hits()
            .layer_hits(inner_layer)
            .next()
            .ok_or(Error::Failure("occupied layer without hits".to_owned()))?;

        Ok(match granularity(store.hit(first_hit)?.hit_type()) {
            Granularity::Fine => self.perpendicular_cut_fine,
            Granularity::Coarse | Granularity::VeryCoarse => self.perpendicular_cut_coarse,
        })
    }
}

impl Algorithm for ShowerMipMergingAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.can_merge_min_mip_fraction =
            config.read_or("CanMergeMinMipFraction", self.can_merge_min_mip_fraction)?;
        self.can_merge_max_rms = config.read_or("CanMergeMaxRms", self.can_merge_max_rms)?;
        self.min_hits_in_cluster = config.read_or("MinHitsInCluster", self.min_hits_in_cluster)?;
        self.min_occupied_layers =
            config.read_or("MinOccupiedLayersInCluster", self.min_occupied_layers)?;
        self.min_parent_mip_fraction =
            config.read_or("MinParentMipFraction", self.min_parent_mip_fraction)?;
        self.n_parent_fit_layers = config.read_or("NParentFitLayers", self.n_parent_fit_layers)?;
        self.n_daughter_fit_layers =
            config.read_or("NDaughterFitLayers", self.n_daughter_fit_layers)?;
        self.max_layer_difference =
            config.read_or("MaxLayerDifference", self.max_layer_difference)?;
        self.fit_direction_dot_product_cut =
            config.read_or("FitDirectionDotProductCut", self.fit_direction_dot_product_cut)?;
        self.merge_cut_fine = config.read_or("MipTrackMergeCutFine", self.merge_cut_fine)?;
        self.merge_cut_coarse = config.read_or("MipTrackMergeCutCoarse", self.merge_cut_coarse)?;
        self.perpendicular_cut_fine =
            config.read_or("PerpendicularCutFine", self.perpendicular_cut_fine)?;
        self.perpendicular_cut_coarse =
            config.read_or("PerpendicularCutCoarse", self.perpendicular_cut_coarse)?;
        self.max_centroid_distance =
            config.read_or("MaxCentroidDistance", self.max_centroid_distance)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let candidates =
            sort_clusters_for_merging(context.store, context.store.current_cluster_ids()?);

        for parent_id in &candidates {
            if !context.store.cluster_exists(*parent_id) {
                continue;
            }

            {
                let parent = context.store.cluster(*parent_id)?;

                if (parent.n_calo_hits() < self.min_hits_in_cluster)
                    || (parent.n_occupied_layers() < self.min_occupied_layers)
                    || (parent.mip_fraction() < self.min_parent_mip_fraction)
                {
                    continue;
                }
            }

            if !context.store.can_merge_cluster(
                *parent_id,
                self.can_merge_min_mip_fraction,
                self.can_merge_max_rms,
            )? {
                continue;
            }

            let parent_fit = self.parent_fit(context.store, *parent_id)?;

            if !parent_fit.is_successful() {
                continue;
            }

            let parent_outer_layer = context
                .store
                .cluster(*parent_id)?
                .outer_layer()
                .ok_or(Error::NotInitialized("outer layer of empty parent"))?;
            let parent_outer_centroid =
                context.store.cluster(*parent_id)?.centroid(parent_outer_layer)?;

            let mut best: Option<(f64, ClusterId)> = None;

            for daughter_id in &candidates {
                if (daughter_id == parent_id) || !context.store.cluster_exists(*daughter_id) {
                    continue;
                }

                {
                    let daughter = context.store.cluster(*daughter_id)?;

                    if daughter.n_calo_hits() < self.min_hits_in_cluster {
                        continue;
                    }

                    let Some(daughter_inner) = daughter.inner_layer() else {
                        continue;
                    };

                    // the daughter shower must begin at or just beyond the parent end
                    if (daughter_inner < parent_outer_layer)
                        || (daughter_inner - parent_outer_layer > self.max_layer_difference)
                    {
                        continue;
                    }
                }

                if !context.store.can_merge_cluster(
                    *daughter_id,
                    self.can_merge_min_mip_fraction,
                    self.can_merge_max_rms,
                )? {
                    continue;
                }

                let daughter_fit = fit::fit_start(
                    context.store.hits_arena(),
                    context.store.cluster(*daughter_id)?,
                    self.n_daughter_fit_layers,
                )?;

                if !daughter_fit.is_successful() {
                    continue;
                }

                if parent_fit.direction()?.dot(&daughter_fit.direction()?)
                    < self.fit_direction_dot_product_cut
                {
                    continue;
                }

                let approach = fit::closest_distance_of_approach(&parent_fit, &daughter_fit)?;

                if approach > self.merge_cut(context.store, *daughter_id)? {
                    continue;
                }

                let daughter_inner = context
                    .store
                    .cluster(*daughter_id)?
                    .inner_layer()
                    .ok_or(Error::NotInitialized("inner layer of empty daughter"))?;
                let centroid_difference =
                    context.store.cluster(*daughter_id)?.centroid(daughter_inner)?
                        - parent_outer_centroid;

                if centroid_difference.magnitude() > self.max_centroid_distance {
                    continue;
                }

                let perpendicular =
                    parent_fit.direction()?.cross(&centroid_difference).magnitude();

                if perpendicular > self.perpendicular_cut(context.store, *daughter_id)? {
                    continue;
                }

                if self.variant == 4 {
                    // fourth variant projects the parent fit onto the daughter start
                    let projected = fit::perpendicular_distance(
                        &context.store.cluster(*daughter_id)?.centroid(daughter_inner)?,
                        &parent_fit.intercept()?,
                        &parent_fit.direction()?,
                    );

                    if projected > self.merge_cut(context.store, *daughter_id)? {
                        continue;
                    }
                }

                if best.is_none_or(|(current, _)| approach < current) {
                    best = Some((approach, *daughter_id));
                }
            }

            if let Some((_, daughter_id)) = best {
                context.store.merge_and_delete_clusters(*parent_id, daughter_id)?;
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

    #[test]
    fn mip_stem_absorbs_downstream_shower() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        // narrow mip stem over layers 1-8
        let stem_hits: Vec<_> = (0..8_u32)
            .map(|layer| {
                let mut parameters = testing::ecal_hit(
                    CartesianVector::new(5.0_f64.mul_add(f64::from(layer), 1500.0), 0.0, 0.0),
                    0.02,
                );
                parameters.is_possible_mip = true;
                store.create_calo_hit(parameters, &detector, None).unwrap()
            })
            .collect();
        let stem = store.create_cluster(ClusterSeed::Hits(stem_hits)).unwrap();

        // shower blob starting right beyond the stem end
        let mut shower_hits = Vec::new();
        for layer in 8..16_u32 {
            for offset in [-8.0, 0.0, 8.0] {
                shower_hits.push(
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                0.2,
                            ),
                            &detector,
                            None,
                        )
                        .unwrap(),
                );
            }
        }
        let shower = store.create_cluster(ClusterSeed::Hits(shower_hits)).unwrap();

        let stem_hits_before = store.cluster(stem).unwrap().n_calo_hits();
        let shower_hits_before = store.cluster(shower).unwrap().n_calo_hits();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        ShowerMipMergingAlgorithm::variant(1).run(&mut context).unwrap();

        // the stem (smaller outer layer) is examined first and absorbs the shower
        assert!(store.cluster_exists(stem));
        assert!(!store.cluster_exists(shower));
        assert_eq!(
            store.cluster(stem).unwrap().n_calo_hits(),
            stem_hits_before + shower_hits_before
        );
    }

    #[test]
    fn transverse_shower_is_left_alone() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let stem_hits: Vec<_> = (0..8_u32)
            .map(|layer| {
                let mut parameters = testing::ecal_hit(
                    CartesianVector::new(5.0_f64.mul_add(f64::from(layer), 1500.0), 0.0, 0.0),
                    0.02,
                );
                parameters.is_possible_mip = true;
                store.create_calo_hit(parameters, &detector, None).unwrap()
            })
            .collect();
        let stem = store.create_cluster(ClusterSeed::Hits(stem_hits)).unwrap();

        // a shower displaced far sideways fails the perpendicular cut
        let mut shower_hits = Vec::new();
        for layer in 9..16_u32 {
            for offset in [492.0, 500.0, 508.0] {
                shower_hits.push(
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                0.2,
                            ),
                            &detector,
                            None,
                        )
                        .unwrap(),
                );
            }
        }
        let shower = store.create_cluster(ClusterSeed::Hits(shower_hits)).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        ShowerMipMergingAlgorithm::variant(1).run(&mut context).unwrap();

        assert!(store.cluster_exists(stem));
        assert!(store.cluster_exists(shower));
    }
}
