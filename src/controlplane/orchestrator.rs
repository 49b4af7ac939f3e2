//! Orchestrator - Client facade
//!
//! Owns one client's allow-list, job policy and snapshot ledger and wires
//! the per-resource managers onto a shared transport. Each orchestrator is
//! independent; nothing here is process-wide.

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::hosts::HostManager;
use crate::controlplane::jobs::{JobPollConfig, JobTracker};
use crate::controlplane::masking::MaskingViewManager;
use crate::controlplane::port_groups::PortGroupManager;
use crate::controlplane::snapshots::SnapshotManager;
use crate::controlplane::storage_groups::StorageGroupManager;
use crate::controlplane::volumes::VolumeManager;
use crate::domain::model::ArrayInfo;
use crate::domain::ports::ArrayTransportRef;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for one orchestrator instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Arrays this client may touch; empty allows all
    pub allowed_arrays: Vec<String>,
    /// Job polling policy
    pub jobs: JobPollConfig,
}

impl OrchestratorConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading orchestrator config");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.jobs.validate()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Entry point: one per client
pub struct Orchestrator {
    config: OrchestratorConfig,
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    jobs: Arc<JobTracker>,
    volumes: VolumeManager,
    storage_groups: StorageGroupManager,
    masking_views: MaskingViewManager,
    port_groups: PortGroupManager,
    hosts: HostManager,
    snapshots: SnapshotManager,
}

impl Orchestrator {
    /// Validate the config and wire the managers onto `transport`
    pub fn new(config: OrchestratorConfig, transport: ArrayTransportRef) -> Result<Arc<Self>> {
        config.validate()?;

        let allow_list = Arc::new(AllowList::with_arrays(config.allowed_arrays.iter().cloned()));
        let jobs = Arc::new(JobTracker::new(
            transport.clone(),
            allow_list.clone(),
            config.jobs.clone(),
        ));

        info!(
            allowed_arrays = allow_list.get_allowed().len(),
            max_retries = config.jobs.max_retries,
            poll_interval_ms = config.jobs.poll_interval_ms,
            "Creating orchestrator"
        );

        Ok(Arc::new(Self {
            volumes: VolumeManager::new(transport.clone(), allow_list.clone(), jobs.clone()),
            storage_groups: StorageGroupManager::new(
                transport.clone(),
                allow_list.clone(),
                jobs.clone(),
            ),
            masking_views: MaskingViewManager::new(
                transport.clone(),
                allow_list.clone(),
                jobs.clone(),
            ),
            port_groups: PortGroupManager::new(transport.clone(), allow_list.clone(), jobs.clone()),
            hosts: HostManager::new(transport.clone(), allow_list.clone()),
            snapshots: SnapshotManager::new(transport.clone(), allow_list.clone(), jobs.clone()),
            config,
            transport,
            allow_list,
            jobs,
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    pub fn storage_groups(&self) -> &StorageGroupManager {
        &self.storage_groups
    }

    pub fn masking_views(&self) -> &MaskingViewManager {
        &self.masking_views
    }

    pub fn port_groups(&self) -> &PortGroupManager {
        &self.port_groups
    }

    pub fn hosts(&self) -> &HostManager {
        &self.hosts
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    // =========================================================================
    // Allow-list
    // =========================================================================

    /// Replace the allow-list
    pub fn set_allowed_arrays<I, S>(&self, arrays: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list.set_allowed(arrays);
    }

    pub fn allowed_arrays(&self) -> Vec<String> {
        self.allow_list.get_allowed()
    }

    pub fn is_allowed_array(&self, array_id: &str) -> bool {
        self.allow_list.is_allowed(array_id)
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    /// Arrays known to the management server that this client may use
    pub async fn list_arrays(&self) -> Result<Vec<String>> {
        let arrays = self.transport.list_arrays().await?;
        Ok(self.allow_list.filter(arrays))
    }

    pub async fn get_array(&self, array_id: &str) -> Result<ArrayInfo> {
        self.allow_list.check(array_id)?;
        self.transport.get_array(array_id).await
    }

    /// Restore configured settings and forget cached snapshot state
    pub fn reset(&self) {
        info!("Resetting orchestrator to configured settings");
        self.allow_list
            .set_allowed(self.config.allowed_arrays.iter().cloned());
        self.jobs.reset();
        self.snapshots.reset();
    }
}
