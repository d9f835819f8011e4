//! Cluster bring-up and device topology.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub num_hosts: usize,
    pub devices_per_host: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_hosts: 1,
            devices_per_host: 1,
        }
    }
}

/// Handle to the initialized device cluster.
///
/// The reference engine runs everything on the local host; the topology
/// still drives how many pipeline stages an executable is compiled for.
pub struct Cluster {
    config: ClusterConfig,
}

impl Cluster {
    pub fn init(config: ClusterConfig) -> Result<Self> {
        ensure!(config.num_hosts > 0, "cluster needs at least one host");
        ensure!(
            config.devices_per_host > 0,
            "cluster needs at least one device per host"
        );
        info!(
            num_hosts = config.num_hosts,
            devices_per_host = config.devices_per_host,
            "cluster initialized"
        );
        Ok(Self { config })
    }

    pub fn num_hosts(&self) -> usize {
        self.config.num_hosts
    }

    pub fn num_devices(&self) -> usize {
        self.config.num_hosts * self.config.devices_per_host
    }

    /// Pipeline-parallel stage count: at least two stages, one per host.
    pub fn num_pp_stages(&self) -> usize {
        self.config.num_hosts.max(2)
    }

    pub fn shutdown(self) -> Result<()> {
        info!("cluster shut down");
        Ok(())
    }
}
