//! Domain Ports - The transport boundary of the orchestration layer
//!
//! `ArrayTransport` is the one seam between the control plane and the
//! management server. Implementations own HTTP, authentication and
//! (de)serialization; the control plane only sees typed resources, job
//! handles and the four remote error categories (not-found, already-exists,
//! invalid-request, server failure).

use crate::domain::model::{
    ArrayInfo, Host, Initiator, InitiatorGroupRef, Job, JobStatus, LinkMode, MaskingView, Port,
    PortGroup, PortKey, PrivateVolume, ReplicationCapabilities, SnapshotAction,
    SnapshotGeneration, StorageGroup, StoragePool, Volume, VolumeSnapshot,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Submissions
// =============================================================================

/// Outcome of a mutating call: either answered synchronously or accepted as
/// a job that must be polled to completion
#[derive(Debug, Clone, PartialEq)]
pub enum Submission<T> {
    Complete(T),
    Job(Job),
}

impl<T> Submission<T> {
    pub fn job(&self) -> Option<&Job> {
        match self {
            Submission::Job(job) => Some(job),
            Submission::Complete(_) => None,
        }
    }
}

// =============================================================================
// Request Types
// =============================================================================

/// Modification of a single volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeUpdate {
    Rename(String),
    Expand { size_gb: u64 },
    Deallocate,
}

/// Change to a storage group's membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipChange {
    Add(Vec<String>),
    Remove(Vec<String>),
}

/// Request to create a masking view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskingViewSpec {
    pub masking_view_id: String,
    pub storage_group_id: String,
    pub initiator_group: InitiatorGroupRef,
    pub port_group_id: String,
}

/// Filter for initiator listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorFilter {
    /// Match initiators whose identifier contains this string
    pub name: Option<String>,
    /// Only iSCSI (GigE) initiators
    pub iscsi_only: bool,
    /// Only initiators that belong to a host
    pub in_host_only: bool,
}

/// Filter for front-end port listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFilter {
    /// Only iSCSI (GigE) ports
    pub iscsi_only: bool,
}

/// Filter for the list of volumes that have snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapVolumeFilter {
    /// Only sources carrying a snapshot with exactly this name
    pub snapshot_name: Option<String>,
    /// Only sources with at least one linked generation
    pub linked_only: bool,
    /// Only sources with at least one expired generation
    pub expired_only: bool,
}

/// Request to create a snapshot across a set of source volumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSnapshot {
    pub snapshot_name: String,
    pub source_volumes: Vec<String>,
    /// 0 means no expiry
    pub time_to_live_hours: u32,
}

/// Request to modify an existing snapshot generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifySnapshot {
    pub source_volumes: Vec<String>,
    /// Paired with `source_volumes` by position for link / relink
    pub target_volumes: Vec<String>,
    pub snapshot_name: String,
    pub action: SnapshotAction,
    /// Required for rename, ignored otherwise
    pub new_snapshot_name: Option<String>,
    pub generation: u64,
    /// Required for set-mode, ignored otherwise
    pub mode: Option<LinkMode>,
}

impl ModifySnapshot {
    /// Convenience constructor for actions without targets
    pub fn new(
        source_volumes: Vec<String>,
        snapshot_name: impl Into<String>,
        action: SnapshotAction,
        generation: u64,
    ) -> Self {
        Self {
            source_volumes,
            target_volumes: Vec::new(),
            snapshot_name: snapshot_name.into(),
            action,
            new_snapshot_name: None,
            generation,
            mode: None,
        }
    }

    pub fn with_targets(mut self, target_volumes: Vec<String>) -> Self {
        self.target_volumes = target_volumes;
        self
    }

    pub fn with_new_name(mut self, new_snapshot_name: impl Into<String>) -> Self {
        self.new_snapshot_name = Some(new_snapshot_name.into());
        self
    }

    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Request to terminate one generation of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSnapshot {
    pub snapshot_name: String,
    pub source_volumes: Vec<String>,
    pub generation: u64,
}

// =============================================================================
// Array Transport Port
// =============================================================================

/// Port for all remote calls against the management server.
///
/// Every method is scoped to an array id. Implementations must not consult
/// the allow-list; the control plane gates calls before they get here.
#[async_trait]
pub trait ArrayTransport: Send + Sync {
    // --- arrays ---------------------------------------------------------------

    /// List the serial numbers of all arrays known to the management server
    async fn list_arrays(&self) -> Result<Vec<String>>;

    async fn get_array(&self, array_id: &str) -> Result<ArrayInfo>;

    /// Replication capabilities of every array known to the management server
    async fn get_replication_capabilities(&self) -> Result<Vec<ReplicationCapabilities>>;

    // --- jobs -----------------------------------------------------------------

    async fn list_jobs(&self, array_id: &str, status: Option<JobStatus>) -> Result<Vec<String>>;

    async fn get_job(&self, array_id: &str, job_id: &str) -> Result<Job>;

    // --- volumes --------------------------------------------------------------

    async fn create_volume(
        &self,
        array_id: &str,
        storage_group_id: &str,
        name: &str,
        size_cylinders: u64,
    ) -> Result<Submission<Volume>>;

    async fn get_volume(&self, array_id: &str, volume_id: &str) -> Result<Volume>;

    /// Array-internal details of a volume (WWN, snapshot sessions)
    async fn get_private_volume(&self, array_id: &str, volume_id: &str) -> Result<PrivateVolume>;

    /// List volume ids whose identifier equals (or contains, if `like`) the
    /// given string; an empty identifier matches all
    async fn list_volume_ids(
        &self,
        array_id: &str,
        identifier: &str,
        like: bool,
    ) -> Result<Vec<String>>;

    async fn update_volume(
        &self,
        array_id: &str,
        volume_id: &str,
        update: VolumeUpdate,
    ) -> Result<Submission<Volume>>;

    async fn delete_volume(&self, array_id: &str, volume_id: &str) -> Result<()>;

    // --- storage groups and pools ---------------------------------------------

    async fn list_storage_groups(&self, array_id: &str) -> Result<Vec<String>>;

    async fn get_storage_group(&self, array_id: &str, storage_group_id: &str)
        -> Result<StorageGroup>;

    async fn create_storage_group(
        &self,
        array_id: &str,
        storage_group_id: &str,
        srp_id: &str,
        service_level: &str,
    ) -> Result<Submission<StorageGroup>>;

    /// Apply a membership change; adding a member or removing a non-member is
    /// a no-op on the array
    async fn update_storage_group(
        &self,
        array_id: &str,
        storage_group_id: &str,
        change: MembershipChange,
    ) -> Result<Submission<StorageGroup>>;

    async fn delete_storage_group(&self, array_id: &str, storage_group_id: &str) -> Result<()>;

    async fn list_storage_pools(&self, array_id: &str) -> Result<Vec<String>>;

    async fn get_storage_pool(&self, array_id: &str, pool_id: &str) -> Result<StoragePool>;

    // --- masking views --------------------------------------------------------

    async fn list_masking_views(&self, array_id: &str) -> Result<Vec<String>>;

    async fn get_masking_view(&self, array_id: &str, masking_view_id: &str) -> Result<MaskingView>;

    async fn create_masking_view(
        &self,
        array_id: &str,
        spec: MaskingViewSpec,
    ) -> Result<Submission<MaskingView>>;

    async fn delete_masking_view(&self, array_id: &str, masking_view_id: &str) -> Result<()>;

    // --- port groups ----------------------------------------------------------

    async fn list_port_groups(&self, array_id: &str) -> Result<Vec<String>>;

    async fn get_port_group(&self, array_id: &str, port_group_id: &str) -> Result<PortGroup>;

    async fn create_port_group(
        &self,
        array_id: &str,
        port_group_id: &str,
        ports: Vec<PortKey>,
    ) -> Result<PortGroup>;

    /// Replace the port group's membership wholesale
    async fn update_port_group(
        &self,
        array_id: &str,
        port_group_id: &str,
        ports: Vec<PortKey>,
    ) -> Result<Submission<PortGroup>>;

    async fn delete_port_group(&self, array_id: &str, port_group_id: &str) -> Result<()>;

    // --- directors and ports --------------------------------------------------

    async fn list_directors(&self, array_id: &str) -> Result<Vec<String>>;

    async fn list_ports(
        &self,
        array_id: &str,
        director_id: &str,
        filter: PortFilter,
    ) -> Result<Vec<PortKey>>;

    async fn get_port(&self, array_id: &str, port: &PortKey) -> Result<Port>;

    // --- hosts and initiators -------------------------------------------------

    async fn list_hosts(&self, array_id: &str) -> Result<Vec<String>>;

    async fn get_host(&self, array_id: &str, host_id: &str) -> Result<Host>;

    async fn create_host(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: Vec<String>,
    ) -> Result<Host>;

    /// Replace the host's initiators wholesale
    async fn update_host_initiators(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: Vec<String>,
    ) -> Result<Host>;

    async fn delete_host(&self, array_id: &str, host_id: &str) -> Result<()>;

    async fn list_initiators(&self, array_id: &str, filter: InitiatorFilter)
        -> Result<Vec<String>>;

    async fn get_initiator(&self, array_id: &str, initiator_id: &str) -> Result<Initiator>;

    // --- snapshots ------------------------------------------------------------

    /// Source volumes that have at least one snapshot and match the filter
    async fn list_snapshot_volumes(
        &self,
        array_id: &str,
        filter: SnapVolumeFilter,
    ) -> Result<Vec<String>>;

    async fn get_volume_snapshots(
        &self,
        array_id: &str,
        volume_id: &str,
    ) -> Result<Vec<VolumeSnapshot>>;

    async fn create_snapshot(&self, array_id: &str, request: CreateSnapshot)
        -> Result<Submission<()>>;

    async fn get_snapshot(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<VolumeSnapshot>;

    /// All generations of a snapshot on one source volume, newest first
    async fn list_generations(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<Vec<SnapshotGeneration>>;

    async fn get_generation(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
        generation: u64,
    ) -> Result<SnapshotGeneration>;

    async fn modify_snapshot(&self, array_id: &str, request: ModifySnapshot)
        -> Result<Submission<()>>;

    async fn delete_snapshot(&self, array_id: &str, request: DeleteSnapshot)
        -> Result<Submission<()>>;
}

pub type ArrayTransportRef = Arc<dyn ArrayTransport>;
