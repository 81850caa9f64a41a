//! Primary clustering wrapper: runs the configured clustering child against the
//! current hit list and saves the resulting clusters under the primary list name.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::config::Config;
use super::error::Result;

/// The primary clustering stage.
pub struct PrimaryClusteringAlgorithm {
    clustering_name: Option<String>,
    cluster_list_name: String,
}

impl Default for PrimaryClusteringAlgorithm {
    fn default() -> Self {
        Self {
            clustering_name: None,
            cluster_list_name: "PrimaryClusters".to_owned(),
        }
    }
}

impl Algorithm for PrimaryClusteringAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.clustering_name = match builder.create_optional_stage(config, "Clustering")? {
            Some(name) => Some(name),
            None => Some(builder.create_stage(&Config::from_yaml_str("type: ConeClustering")?)?),
        };
        self.cluster_list_name =
            config.read_or("ClusterListName", self.cluster_list_name.clone())?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        let clustering_name = self
            .clustering_name
            .clone()
            .ok_or(super::error::Error::NotInitialized("primary clustering child"))?;

        let temporary_list = context.run_clustering_stage(&clustering_name)?;

        context.store.save_cluster_list_from(&temporary_list, &self.cluster_list_name)?;
        context.store.remove_cluster_list(&temporary_list)?;
        context.store.replace_current_cluster_list(&self.cluster_list_name)?;

        Ok(())
    }
}
