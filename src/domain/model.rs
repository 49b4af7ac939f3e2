//! Domain Model - Resources managed on a storage array
//!
//! Every resource is scoped to an array (Symmetrix) identified by its serial
//! number. These types are what the transport hands back and what the
//! control plane returns to callers.

use crate::error::{Error, ResourceKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

// =============================================================================
// Arrays
// =============================================================================

/// Summary of a managed array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayInfo {
    /// Serial number
    pub symmetrix_id: String,
    /// Model name (e.g. PowerMax_8000)
    pub model: String,
    /// Microcode version
    pub ucode: String,
    /// Number of devices configured
    pub device_count: u32,
    /// Whether the array is locally attached to the management server
    pub local: bool,
}

/// Replication features licensed on an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationCapabilities {
    pub symmetrix_id: String,
    /// SnapVX snapshots
    pub snap_vx_capable: bool,
    /// Remote replication
    pub rdf_capable: bool,
}

// =============================================================================
// Jobs
// =============================================================================

/// State of a long-running operation on the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Scheduled,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// SUCCEEDED and FAILED are terminal; no transition leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "CREATED"),
            JobStatus::Scheduled => write!(f, "SCHEDULED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(JobStatus::Created),
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidArgument(format!("unknown job status: {}", other))),
        }
    }
}

/// A handle to a long-running remote operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    /// Owning array
    pub array_id: String,
    /// Human readable description of the operation
    pub name: String,
    pub status: JobStatus,
    /// Server-supplied result or error message
    pub result: Option<String>,
    /// Link to the resource the job produced, if any
    pub resource_link: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// =============================================================================
// Volumes, Storage Groups, Pools
// =============================================================================

/// A device (volume) on the array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Device id (e.g. 0002F)
    pub volume_id: String,
    /// User-visible name
    pub identifier: String,
    pub capacity_gb: f64,
    pub capacity_cylinders: u64,
    /// Storage groups this volume belongs to
    pub storage_group_ids: Vec<String>,
    /// Whether the volume is the source of a snapshot
    pub snapvx_source: bool,
    /// Whether the volume is linked as a snapshot target
    pub snapvx_target: bool,
}

impl Volume {
    pub fn in_any_storage_group(&self) -> bool {
        !self.storage_group_ids.is_empty()
    }
}

/// A snapshot relationship a volume takes part in, as source or as target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapSession {
    pub snapshot_name: String,
    pub source_volume: String,
    pub generation: u64,
    /// Linked target, if the generation is linked
    pub target_volume: Option<String>,
}

/// Array-internal view of a volume: its WWN and snapshot sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateVolume {
    pub volume_id: String,
    pub wwn: String,
    pub snapvx_source: bool,
    pub snapvx_target: bool,
    /// Generations sourced from this volume
    pub source_sessions: Vec<SnapSession>,
    /// Generations linked to this volume
    pub target_sessions: Vec<SnapSession>,
}

/// A named set of volumes, the unit of masking and provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageGroup {
    pub storage_group_id: String,
    /// Storage resource pool (e.g. SRP_1)
    pub srp_id: Option<String>,
    /// Service level (e.g. Diamond)
    pub service_level: Option<String>,
    /// Member volumes; set semantics
    pub volume_ids: BTreeSet<String>,
    /// Masking views referencing this group
    pub masking_view_ids: Vec<String>,
}

impl StorageGroup {
    pub fn contains(&self, volume_id: &str) -> bool {
        self.volume_ids.contains(volume_id)
    }

    pub fn num_volumes(&self) -> usize {
        self.volume_ids.len()
    }
}

/// Storage resource pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub storage_pool_id: String,
    pub usable_capacity_gb: f64,
    pub used_capacity_gb: f64,
    pub service_levels: Vec<String>,
}

// =============================================================================
// Hosts and Initiators
// =============================================================================

/// Reference to the initiator side of a masking view: a host or a host group,
/// never both
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InitiatorGroupRef {
    Host(String),
    HostGroup(String),
}

impl InitiatorGroupRef {
    /// Build from two optional ids, rejecting both or neither
    pub fn from_parts(host_id: Option<&str>, host_group_id: Option<&str>) -> Result<Self> {
        let host_id = host_id.filter(|id| !id.is_empty());
        let host_group_id = host_group_id.filter(|id| !id.is_empty());

        match (host_id, host_group_id) {
            (Some(host), None) => Ok(InitiatorGroupRef::Host(host.to_string())),
            (None, Some(group)) => Ok(InitiatorGroupRef::HostGroup(group.to_string())),
            (Some(host), Some(group)) => Err(Error::InitiatorGroupConflict(format!(
                "both host {} and host group {} supplied",
                host, group
            ))),
            (None, None) => Err(Error::InitiatorGroupConflict(
                "neither host nor host group supplied".into(),
            )),
        }
    }

    /// Build from a single id and a discriminant flag
    pub fn from_flag(id: &str, is_host: bool) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::InitiatorGroupConflict(
                "neither host nor host group supplied".into(),
            ));
        }
        Ok(if is_host {
            InitiatorGroupRef::Host(id.to_string())
        } else {
            InitiatorGroupRef::HostGroup(id.to_string())
        })
    }

    pub fn id(&self) -> &str {
        match self {
            InitiatorGroupRef::Host(id) | InitiatorGroupRef::HostGroup(id) => id,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, InitiatorGroupRef::Host(_))
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            InitiatorGroupRef::Host(_) => ResourceKind::Host,
            InitiatorGroupRef::HostGroup(_) => ResourceKind::HostGroup,
        }
    }
}

impl std::fmt::Display for InitiatorGroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitiatorGroupRef::Host(id) => write!(f, "host {}", id),
            InitiatorGroupRef::HostGroup(id) => write!(f, "host group {}", id),
        }
    }
}

/// Whether a host record is a single host or a group of hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostKind {
    Host,
    HostGroup,
}

/// A host (set of initiators) or host group (set of hosts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub host_id: String,
    pub kind: HostKind,
    /// Protocol of the member initiators (iSCSI, Fibre)
    pub host_type: String,
    /// Initiator identifiers (IQN or WWN); empty for host groups
    pub initiators: Vec<String>,
    /// Member hosts; empty for plain hosts
    pub hosts: Vec<String>,
    pub masking_view_ids: Vec<String>,
}

/// An initiator port known to the array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    /// Fully qualified id (e.g. SE-1E:000:iqn.1993-08.org.debian:01:5ae293b352a2)
    pub initiator_id: String,
    /// IQN or WWN
    pub identifier: String,
    /// GigE or Fibre
    pub initiator_type: String,
    /// Director:port pairs the initiator is logged into
    pub director_ports: Vec<String>,
    /// Host this initiator belongs to, if any
    pub host_id: Option<String>,
}

impl Initiator {
    pub fn is_iscsi(&self) -> bool {
        self.initiator_type.eq_ignore_ascii_case("GigE")
    }
}

// =============================================================================
// Port Groups
// =============================================================================

/// A front-end port, identified by director and port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortKey {
    pub director_id: String,
    pub port_id: String,
}

impl PortKey {
    pub fn new(director_id: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            director_id: director_id.into(),
            port_id: port_id.into(),
        }
    }
}

impl std::fmt::Display for PortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.director_id, self.port_id)
    }
}

impl FromStr for PortKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once(':') {
            Some((director, port)) if !director.is_empty() && !port.is_empty() => {
                Ok(PortKey::new(director, port))
            }
            _ => Err(Error::InvalidArgument(format!(
                "port key must be DIRECTOR:PORT, got {:?}",
                s
            ))),
        }
    }
}

/// A front-end port and its addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub key: PortKey,
    /// GigE or FibreChannel
    pub port_type: String,
    /// Target IQN or WWN
    pub identifier: String,
    /// Empty for Fibre Channel ports
    pub ip_addresses: Vec<String>,
}

impl Port {
    pub fn is_iscsi(&self) -> bool {
        self.port_type.eq_ignore_ascii_case("GigE")
    }
}

/// A named set of front-end ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortGroup {
    pub port_group_id: String,
    /// SCSI_FC, ISCSI, ...
    pub protocol: Option<String>,
    pub ports: Vec<PortKey>,
    pub masking_view_ids: Vec<String>,
}

impl PortGroup {
    /// Ports as a set; duplicates collapse and order is ignored
    pub fn port_set(&self) -> BTreeSet<PortKey> {
        self.ports.iter().cloned().collect()
    }

    /// Set-based comparison against an expected port list
    pub fn same_ports(&self, expected: &[PortKey]) -> bool {
        self.port_set() == expected.iter().cloned().collect::<BTreeSet<_>>()
    }
}

// =============================================================================
// Masking Views
// =============================================================================

/// Binding of an initiator group, a storage group and a port group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskingView {
    pub masking_view_id: String,
    pub initiator_group: InitiatorGroupRef,
    pub storage_group_id: String,
    pub port_group_id: String,
}

impl MaskingView {
    /// Id of the bound host or host group
    pub fn host_id(&self) -> &str {
        self.initiator_group.id()
    }

    pub fn is_host_group(&self) -> bool {
        !self.initiator_group.is_host()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Longest time-to-live the array accepts for a generation (400 days)
pub const MAX_TIME_TO_LIVE_HOURS: u32 = 400 * 24;

/// Whether a generation is linked to target volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Linked,
    #[default]
    Unlinked,
}

/// Copy mode of linked targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    #[default]
    NoCopy,
    Copy,
}

/// Action applied by a snapshot modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotAction {
    Link,
    Unlink,
    Relink,
    Restore,
    Rename,
    SetMode,
}

impl SnapshotAction {
    /// Actions that pair source volumes with target volumes by position
    pub fn requires_targets(&self) -> bool {
        matches!(self, SnapshotAction::Link | SnapshotAction::Relink)
    }
}

impl std::fmt::Display for SnapshotAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotAction::Link => write!(f, "Link"),
            SnapshotAction::Unlink => write!(f, "Unlink"),
            SnapshotAction::Relink => write!(f, "Relink"),
            SnapshotAction::Restore => write!(f, "Restore"),
            SnapshotAction::Rename => write!(f, "Rename"),
            SnapshotAction::SetMode => write!(f, "SetMode"),
        }
    }
}

impl FromStr for SnapshotAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "link" => Ok(SnapshotAction::Link),
            "unlink" => Ok(SnapshotAction::Unlink),
            "relink" => Ok(SnapshotAction::Relink),
            "restore" => Ok(SnapshotAction::Restore),
            "rename" => Ok(SnapshotAction::Rename),
            "setmode" | "set_mode" => Ok(SnapshotAction::SetMode),
            other => Err(Error::InvalidArgument(format!(
                "unknown snapshot action: {}",
                other
            ))),
        }
    }
}

/// One point-in-time generation of a named snapshot on a source volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotGeneration {
    pub snapshot_name: String,
    pub source_volume: String,
    /// 0 is the newest; ids are not dense after deletions
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    /// 0 means no expiry
    pub time_to_live_hours: u32,
    pub link_state: LinkState,
    pub linked_targets: Vec<String>,
    pub mode: LinkMode,
    pub expired: bool,
}

impl SnapshotGeneration {
    /// Whether the time-to-live has elapsed at `now`. An expiry past the
    /// representable range never elapses.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.time_to_live_hours == 0 {
            return false;
        }
        self.timestamp
            .checked_add_signed(chrono::Duration::hours(i64::from(self.time_to_live_hours)))
            .map_or(false, |expiry| now >= expiry)
    }
}

/// Summary of a named snapshot on a source volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    pub snapshot_name: String,
    pub source_volume: String,
    pub generation_count: u32,
    /// Timestamp of generation 0
    pub newest: Option<DateTime<Utc>>,
    pub linked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Succeeded).unwrap(),
            "\"SUCCEEDED\""
        );
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_initiator_group_from_parts() {
        assert_eq!(
            InitiatorGroupRef::from_parts(Some("h1"), None).unwrap(),
            InitiatorGroupRef::Host("h1".into())
        );
        assert_eq!(
            InitiatorGroupRef::from_parts(None, Some("hg1")).unwrap(),
            InitiatorGroupRef::HostGroup("hg1".into())
        );
        assert_matches!(
            InitiatorGroupRef::from_parts(Some("h1"), Some("hg1")),
            Err(Error::InitiatorGroupConflict(_))
        );
        assert_matches!(
            InitiatorGroupRef::from_parts(None, None),
            Err(Error::InitiatorGroupConflict(_))
        );
        // empty strings count as absent
        assert_matches!(
            InitiatorGroupRef::from_parts(Some(""), Some("")),
            Err(Error::InitiatorGroupConflict(_))
        );
    }

    #[test]
    fn test_initiator_group_from_flag() {
        let host = InitiatorGroupRef::from_flag("l2se0042_iscsi_ig", true).unwrap();
        assert!(host.is_host());
        assert_eq!(host.kind(), ResourceKind::Host);

        let group = InitiatorGroupRef::from_flag("l2se0042_43_iscsi_ig", false).unwrap();
        assert!(!group.is_host());
        assert_eq!(group.id(), "l2se0042_43_iscsi_ig");

        assert!(InitiatorGroupRef::from_flag("", true).is_err());
    }

    #[test]
    fn test_port_key_parse() {
        let key: PortKey = "SE-1E:000".parse().unwrap();
        assert_eq!(key, PortKey::new("SE-1E", "000"));
        assert_eq!(key.to_string(), "SE-1E:000");
        assert!("SE-1E".parse::<PortKey>().is_err());
        assert!(":000".parse::<PortKey>().is_err());
    }

    #[test]
    fn test_port_group_set_comparison() {
        let pg = PortGroup {
            port_group_id: "pg".into(),
            protocol: Some("ISCSI".into()),
            ports: vec![
                PortKey::new("SE-1E", "000"),
                PortKey::new("SE-2E", "001"),
                PortKey::new("SE-1E", "000"),
            ],
            masking_view_ids: vec![],
        };
        assert_eq!(pg.port_set().len(), 2);
        assert!(pg.same_ports(&[PortKey::new("SE-2E", "001"), PortKey::new("SE-1E", "000")]));
        assert!(!pg.same_ports(&[PortKey::new("SE-1E", "000")]));
    }

    #[test]
    fn test_snapshot_action_parse() {
        assert_eq!("Relink".parse::<SnapshotAction>().unwrap(), SnapshotAction::Relink);
        assert_eq!("SetMode".parse::<SnapshotAction>().unwrap(), SnapshotAction::SetMode);
        assert!(SnapshotAction::Link.requires_targets());
        assert!(!SnapshotAction::Restore.requires_targets());
        assert!("Terminate".parse::<SnapshotAction>().is_err());
    }

    #[test]
    fn test_generation_expiry() {
        let created = Utc::now() - chrono::Duration::hours(3);
        let mut generation = SnapshotGeneration {
            snapshot_name: "snap".into(),
            source_volume: "00001".into(),
            generation: 0,
            timestamp: created,
            time_to_live_hours: 0,
            link_state: LinkState::Unlinked,
            linked_targets: vec![],
            mode: LinkMode::NoCopy,
            expired: false,
        };
        assert!(!generation.is_expired_at(Utc::now()));

        generation.time_to_live_hours = 2;
        assert!(generation.is_expired_at(Utc::now()));

        generation.time_to_live_hours = 4;
        assert!(!generation.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_generation_expiry_out_of_range() {
        let generation = SnapshotGeneration {
            snapshot_name: "snap".into(),
            source_volume: "00001".into(),
            generation: 0,
            timestamp: DateTime::<Utc>::MAX_UTC - chrono::Duration::hours(1),
            time_to_live_hours: u32::MAX,
            link_state: LinkState::Unlinked,
            linked_targets: vec![],
            mode: LinkMode::NoCopy,
            expired: false,
        };
        assert!(!generation.is_expired_at(Utc::now()));
        assert!(!generation.is_expired_at(DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn test_port_is_iscsi() {
        let port = Port {
            key: PortKey::new("SE-1E", "000"),
            port_type: "GigE".into(),
            identifier: "iqn.1992-04.com.emc:600009700bcbb70e3287017400000000".into(),
            ip_addresses: vec!["10.0.0.1".into()],
        };
        assert!(port.is_iscsi());
    }
}
