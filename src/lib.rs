//! PowerMax Orchestrator - Storage array client orchestration
//!
//! Client-side orchestration for a storage array management server:
//! provisioning volumes into storage groups, exposing them to hosts through
//! masking views, and managing snapshot generations. All array access goes
//! through one transport port and is gated by a per-client allow-list.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Orchestrator                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐ ┌──────────────┐ ┌─────────────┐ ┌──────────────────┐  │
//! │  │  Volumes  │ │Storage Groups│ │Masking Views│ │    Snapshots     │  │
//! │  │           │ │  Port Groups │ │    Hosts    │ │ (generation log) │  │
//! │  └─────┬─────┘ └──────┬───────┘ └──────┬──────┘ └────────┬─────────┘  │
//! │        └──────────────┴───────┬────────┴─────────────────┘            │
//! │                   ┌───────────┴───────────┐                           │
//! │                   │ Allow-List · Job Tracker │                        │
//! │                   └───────────┬───────────┘                           │
//! ├───────────────────────────────┼──────────────────────────────────────┤
//! │                     ArrayTransport (port)                             │
//! │        ┌──────────────────────┴──────────────────────┐               │
//! │        │ InMemoryArray (simulator) │ REST transport   │               │
//! │        └─────────────────────────────────────────────┘               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator, resource managers and transport backends
//! - [`domain`]: Resource model and the transport trait
//! - [`error`]: Error types and handling

pub mod controlplane;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use controlplane::{
    AllowList, HostManager, InMemoryArray, JobPollConfig, JobTracker, MaskingViewManager,
    Orchestrator, OrchestratorConfig, PortGroupManager, SimulatorConfig, SnapshotManager,
    StorageGroupManager, VolumeManager,
};

pub use domain::model::{
    ArrayInfo, Host, HostKind, Initiator, InitiatorGroupRef, Job, JobStatus, LinkMode, LinkState,
    MaskingView, Port, PortGroup, PortKey, PrivateVolume, ReplicationCapabilities, SnapSession,
    SnapshotAction, SnapshotGeneration, StorageGroup, StoragePool, Volume, VolumeSnapshot,
};

pub use domain::ports::{
    ArrayTransport, ArrayTransportRef, InitiatorFilter, ModifySnapshot, PortFilter,
    SnapVolumeFilter, Submission,
};

pub use error::{Error, ErrorCategory, ResourceKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
