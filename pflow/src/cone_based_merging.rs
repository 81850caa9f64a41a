//! Cone-based merging: each parent candidate is mip-fitted from its inner layer to
//! just below its shower maximum; daughters falling inside the resulting cone are
//! absorbed.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::fit::{self, ClusterFitResult};
use super::fragment_removal::fraction_in_cone_about_axis;
use super::store::EventStore;

/// The cone-based merging pass.
pub struct ConeBasedMergingAlgorithm {
    track_cluster_association_name: Option<String>,
    can_merge_min_mip_fraction: f64,
    can_merge_max_rms: f64,
    min_calo_hits_per_cluster: usize,
    min_layers_to_shower_max: u32,
    min_cone_fraction: f64,
    max_inner_layer_separation: f64,
    max_inner_layer_separation_no_track: f64,
    cone_cosine_half_angle: f64,
}

impl Default for ConeBasedMergingAlgorithm {
    fn default() -> Self {
        Self {
            track_cluster_association_name: None,
            can_merge_min_mip_fraction: 0.7,
            can_merge_max_rms: 5.0,
            min_calo_hits_per_cluster: 6,
            min_layers_to_shower_max: 4,
            min_cone_fraction: 0.5,
            max_inner_layer_separation: 1000.0,
            max_inner_layer_separation_no_track: 250.0,
            cone_cosine_half_angle: 0.9,
        }
    }
}

impl ConeBasedMergingAlgorithm {
    /// Mip fit of a parent candidate, from its inner layer to the layer below its
    /// shower maximum. `None` when the cluster has too little pre-shower extent.
    fn parent_mip_fit(
        &self,
        store: &mut EventStore,
        cluster_id: ClusterId,
    ) -> Result<Option<ClusterFitResult>> {
        let cluster = store.cluster(cluster_id)?;

        if cluster.n_calo_hits() < self.min_calo_hits_per_cluster {
            return Ok(None);
        }

        let (Some(inner_layer), Some(shower_max_layer)) =
            (cluster.inner_layer(), cluster.shower_max_layer())
        else {
            return Ok(None);
        };

        if (shower_max_layer <= inner_layer)
            || (shower_max_layer - inner_layer < self.min_layers_to_shower_max)
        {
            return Ok(None);
        }

        let fit_end_layer = shower_max_layer - 1;
        let fit = fit::fit_layers(store.hits_arena(), cluster, inner_layer, fit_end_layer)?;

        Ok(fit.is_successful().then_some(fit))
    }
}

impl Algorithm for ConeBasedMergingAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.track_cluster_association_name =
            builder.create_optional_stage(config, "TrackClusterAssociation")?;
        self.can_merge_min_mip_fraction =
            config.read_or("CanMergeMinMipFraction", self.can_merge_min_mip_fraction)?;
        self.can_merge_max_rms = config.read_or("CanMergeMaxRms", self.can_merge_max_rms)?;
        self.min_calo_hits_per_cluster =
            config.read_or("MinCaloHitsPerCluster", self.min_calo_hits_per_cluster)?;
        self.min_layers_to_shower_max =
            config.read_or("MinLayersToShowerMax", self.min_layers_to_shower_max)?;
        self.min_cone_fraction = config.read_or("MinConeFraction", self.min_cone_fraction)?;
        self.max_inner_layer_separation =
            config.read_or("MaxInnerLayerSeparation", self.max_inner_layer_separation)?;
        self.max_inner_layer_separation_no_track = config.read_or(
            "MaxInnerLayerSeparationNoTrack",
            self.max_inner_layer_separation_no_track,
        )?;
        self.cone_cosine_half_angle =
            config.read_or("ConeCosineHalfAngle", self.cone_cosine_half_angle)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        // begin by refreshing the track-cluster associations
        if let Some(name) = self.track_cluster_association_name.clone() {
            context.run_stage(&name)?;
        }

        // daughters examined deepest-first, parents carry a pre-shower mip fit
        let mut daughters = Vec::new();
        let mut parent_fits = Vec::new();

        for cluster_id in context.store.current_cluster_ids()? {
            if context.store.cluster(cluster_id)?.n_calo_hits() < self.min_calo_hits_per_cluster {
                continue;
            }

            if !context.store.can_merge_cluster(
                cluster_id,
                self.can_merge_min_mip_fraction,
                self.can_merge_max_rms,
            )? {
                continue;
            }

            daughters.push(cluster_id);

            if let Some(fit) = self.parent_mip_fit(context.store, cluster_id)? {
                parent_fits.push((cluster_id, fit));
            }
        }

        daughters.sort_by_key(|id| {
            context
                .store
                .cluster(*id)
                .map(|cluster| {
                    (
                        std::cmp::Reverse(cluster.inner_layer()),
                        cluster.n_calo_hits(),
                        *id,
                    )
                })
                .unwrap_or((std::cmp::Reverse(None), 0, *id))
        });

        for daughter_id in daughters {
            if !context.store.cluster_exists(daughter_id) {
                continue;
            }

            let Some(daughter_inner) = context.store.cluster(daughter_id)?.inner_layer() else {
                continue;
            };
            let daughter_inner_centroid =
                context.store.cluster(daughter_id)?.centroid(daughter_inner)?;

            let mut best: Option<(f64, ClusterId)> = None;

            for (parent_id, parent_fit) in &parent_fits {
                if (*parent_id == daughter_id) || !context.store.cluster_exists(*parent_id) {
                    continue;
                }

                let parent = context.store.cluster(*parent_id)?;
                let Some(parent_inner) = parent.inner_layer() else {
                    continue;
                };

                let inner_layer_separation =
                    (parent.centroid(parent_inner)? - daughter_inner_centroid).magnitude();

                if inner_layer_separation > self.max_inner_layer_separation {
                    continue;
                }

                if parent.associated_tracks().is_empty()
                    && (inner_layer_separation > self.max_inner_layer_separation_no_track)
                {
                    continue;
                }

                let fraction = fraction_in_cone_about_axis(
                    context.store,
                    daughter_id,
                    &parent_fit.intercept()?,
                    &parent_fit.direction()?,
                    self.cone_cosine_half_angle,
                )?;

                if (fraction > self.min_cone_fraction)
                    && best
                        .as_ref()
                        .is_none_or(|(current, _)| fraction > *current)
                {
                    best = Some((fraction, *parent_id));
                }
            }

            if let Some((_, parent_id)) = best {
                context.store.merge_and_delete_clusters(parent_id, daughter_id)?;
                parent_fits.retain(|(id, _)| *id != daughter_id);
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
    fn downstream_fragment_falls_into_parent_cone() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        // parent: narrow entry over layers 1-8, broad maximum at layers 9-12
        let mut parent_hits = Vec::new();
        for layer in 0..8_u32 {
            parent_hits.push(
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(5.0_f64.mul_add(f64::from(layer), 1500.0), 0.0, 0.0),
                            0.1,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap(),
            );
        }
        for layer in 8..12_u32 {
            for offset in [-10.0, 0.0, 10.0] {
                parent_hits.push(
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                0.5,
                            ),
                            &detector,
                            None,
                        )
                        .unwrap(),
                );
            }
        }
        let parent = store.create_cluster(ClusterSeed::Hits(parent_hits)).unwrap();

        let track = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(8.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.add_track_cluster_association(track, parent).unwrap();

        // fragment beyond the parent, centred on the parent axis
        let fragment_hits: Vec<_> = (13..19_u32)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                2.0,
                                0.0,
                            ),
                            0.1,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        let fragment = store.create_cluster(ClusterSeed::Hits(fragment_hits)).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        ConeBasedMergingAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(parent));
        assert!(!store.cluster_exists(fragment));
    }

    #[test]
    fn transverse_neighbour_stays_separate() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();

        let mut parent_hits = Vec::new();
        for layer in 0..12_u32 {
            for offset in [-5.0, 0.0, 5.0] {
                let energy = if layer >= 8 { 0.5 } else { 0.05 };
                parent_hits.push(
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                energy,
                            ),
                            &detector,
                            None,
                        )
                        .unwrap(),
                );
            }
        }
        let parent = store.create_cluster(ClusterSeed::Hits(parent_hits)).unwrap();

        // a neighbour well outside the parent cone
        let neighbour_hits: Vec<_> = (0..8_u32)
            .map(|layer| {
                store
                    .create_calo_hit(
                        testing::ecal_hit(
                            CartesianVector::new(
                                5.0_f64.mul_add(f64::from(layer), 1500.0),
                                400.0,
                                0.0,
                            ),
                            0.1,
                        ),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();
        let neighbour = store.create_cluster(ClusterSeed::Hits(neighbour_hits)).unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        ConeBasedMergingAlgorithm::default().run(&mut context).unwrap();

        assert!(store.cluster_exists(parent));
        assert!(store.cluster_exists(neighbour));
    }
}
