//! Control Plane
//!
//! Orchestration over a storage array management server: the allow-list
//! gate, job tracking, and the per-resource managers built on them.

pub mod allow_list;
pub mod backends;
mod dedupe;
pub mod hosts;
pub mod jobs;
pub mod masking;
pub mod orchestrator;
pub mod port_groups;
pub mod snapshots;
pub mod storage_groups;
pub mod volumes;

pub use allow_list::AllowList;
pub use backends::{Fault, InMemoryArray, RecordedCall, SimulatorConfig, TransportOp};
pub use hosts::HostManager;
pub use jobs::{JobPollConfig, JobTracker, DEFAULT_JOB_POLL_INTERVAL_MS, DEFAULT_MAX_JOB_RETRIES};
pub use masking::MaskingViewManager;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use port_groups::PortGroupManager;
pub use snapshots::SnapshotManager;
pub use storage_groups::StorageGroupManager;
pub use volumes::VolumeManager;
