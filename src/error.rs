//! Error types for the PowerMax orchestration layer
//!
//! Errors are grouped by where they originate: local validation (no network
//! call was made), remote rejection, asynchronous job failure, and transport.

use crate::domain::model::JobStatus;
use thiserror::Error;

/// Kind of remote resource named in not-found / already-exists errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Array,
    Job,
    Volume,
    StorageGroup,
    StoragePool,
    MaskingView,
    PortGroup,
    Host,
    HostGroup,
    Initiator,
    Director,
    Port,
    Snapshot,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Array => write!(f, "Symmetrix"),
            ResourceKind::Job => write!(f, "Job"),
            ResourceKind::Volume => write!(f, "Volume"),
            ResourceKind::StorageGroup => write!(f, "StorageGroup"),
            ResourceKind::StoragePool => write!(f, "StoragePool"),
            ResourceKind::MaskingView => write!(f, "MaskingView"),
            ResourceKind::PortGroup => write!(f, "PortGroup"),
            ResourceKind::Host => write!(f, "Host"),
            ResourceKind::HostGroup => write!(f, "HostGroup"),
            ResourceKind::Initiator => write!(f, "Initiator"),
            ResourceKind::Director => write!(f, "Director"),
            ResourceKind::Port => write!(f, "Port"),
            ResourceKind::Snapshot => write!(f, "Snapshot"),
        }
    }
}

/// Unified error type for the orchestration layer
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Local Validation Errors
    // =========================================================================
    #[error("Array {array_id} is not in the list of allowed arrays")]
    UnauthorizedArray { array_id: String },

    #[error("Masking view requires exactly one of host or host group: {0}")]
    InitiatorGroupConflict(String),

    #[error("Invalid size for volume {volume_id}: requested {requested_gb} GB, current {current_gb} GB")]
    InvalidSize {
        volume_id: String,
        requested_gb: u64,
        current_gb: f64,
    },

    #[error("Generation {generation} not found for snapshot {snapshot} on volume {volume_id}")]
    GenerationNotFound {
        snapshot: String,
        volume_id: String,
        generation: u64,
    },

    #[error("Device {volume_id} is still a member of storage groups: {}", .storage_groups.join(","))]
    DeviceInUse {
        volume_id: String,
        storage_groups: Vec<String>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Remote Rejection Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: ResourceKind, id: String },

    #[error("Resource already exists: {kind}/{id}")]
    ResourceExists { kind: ResourceKind, id: String },

    #[error("Masking view {id} already exists")]
    MaskingViewAlreadyExists { id: String },

    #[error("Masking view {id} not found")]
    MaskingViewNotFound { id: String },

    #[error("Request rejected by array: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Asynchronous Job Errors
    // =========================================================================
    #[error("Job {job_id} failed with status {status}: {}", .result.as_deref().unwrap_or("no result"))]
    JobFailed {
        job_id: String,
        status: JobStatus,
        result: Option<String>,
    },

    #[error("Job {job_id} did not complete after {attempts} polls (last status: {})", .last_status.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()))]
    JobTimeout {
        job_id: String,
        attempts: u32,
        last_status: Option<JobStatus>,
    },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from array: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where an error originated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected locally, no network call attempted
    LocalValidation,
    /// The array refused the request
    RemoteRejection,
    /// A job reached FAILED or exhausted its retry budget
    AsyncFailure,
    /// Transport or server failure
    Transport,
    /// Bad client configuration
    Configuration,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnauthorizedArray { .. }
            | Error::InitiatorGroupConflict(_)
            | Error::InvalidSize { .. }
            | Error::GenerationNotFound { .. }
            | Error::DeviceInUse { .. }
            | Error::InvalidArgument(_) => ErrorCategory::LocalValidation,

            Error::ResourceNotFound { .. }
            | Error::ResourceExists { .. }
            | Error::MaskingViewAlreadyExists { .. }
            | Error::MaskingViewNotFound { .. }
            | Error::InvalidRequest(_) => ErrorCategory::RemoteRejection,

            Error::JobFailed { .. } | Error::JobTimeout { .. } => ErrorCategory::AsyncFailure,

            Error::Transport(_) | Error::Server { .. } | Error::InvalidResponse(_) => {
                ErrorCategory::Transport
            }

            Error::Configuration(_) | Error::Yaml(_) | Error::Io(_) => {
                ErrorCategory::Configuration
            }
        }
    }

    /// Check if this error is transient. Only these are folded into the
    /// job-poll retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Server { .. })
    }

    /// Check if this error was raised by the client rather than the array
    pub fn is_local(&self) -> bool {
        self.category() == ErrorCategory::LocalValidation
    }

    /// Check if this is a not-found rejection for the given kind
    pub fn is_not_found(&self, kind: ResourceKind) -> bool {
        match self {
            Error::ResourceNotFound { kind: k, .. } => *k == kind,
            Error::MaskingViewNotFound { .. } => kind == ResourceKind::MaskingView,
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn exists(kind: ResourceKind, id: impl Into<String>) -> Self {
        Error::ResourceExists {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for the orchestration layer
pub type Result<T> = std::result::Result<T, Error>;
