//! In-Memory Array Simulator
//!
//! An `ArrayTransport` that keeps each array's resources in memory. It backs
//! the control plane in tests and local runs: recent calls are recorded, the
//! next call of a given kind can be made to fail, and mutations are answered
//! with jobs that need a configurable number of polls to finish. The call log
//! and the job table are bounded by `SimulatorConfig`.

use crate::domain::model::{
    ArrayInfo, Host, HostKind, Initiator, InitiatorGroupRef, Job, JobStatus, LinkState,
    MaskingView, Port, PortGroup, PortKey, PrivateVolume, ReplicationCapabilities, SnapSession,
    SnapshotAction, SnapshotGeneration, StorageGroup, StoragePool, Volume, VolumeSnapshot,
};
use crate::domain::ports::{
    ArrayTransport, CreateSnapshot, DeleteSnapshot, InitiatorFilter, MaskingViewSpec,
    MembershipChange, ModifySnapshot, PortFilter, SnapVolumeFilter, Submission, VolumeUpdate,
};
use crate::error::{Error, ResourceKind, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Size of one cylinder on the array
const MB_PER_CYLINDER: f64 = 1.875;

/// Pool every simulated array starts with
pub const DEFAULT_SRP: &str = "SRP_1";

const SERVICE_LEVELS: [&str; 6] = ["Diamond", "Platinum", "Gold", "Silver", "Bronze", "Optimized"];

fn cylinders_to_gb(cylinders: u64) -> f64 {
    cylinders as f64 * MB_PER_CYLINDER / 1024.0
}

fn gb_to_cylinders(size_gb: u64) -> u64 {
    (size_gb as f64 * 1024.0 / MB_PER_CYLINDER).ceil() as u64
}

/// NAA WWN: vendor prefix, array serial, then the device id as hex ASCII
fn volume_wwn(array_id: &str, volume_id: &str) -> String {
    let device: String = volume_id.bytes().map(|b| format!("{:02X}", b)).collect();
    format!("60000970{}53{}", array_id, device)
}

fn port_type(key: &PortKey) -> &'static str {
    if key.director_id.starts_with("SE") {
        "GigE"
    } else {
        "FibreChannel"
    }
}

// =============================================================================
// Call Recording and Fault Injection
// =============================================================================

/// One variant per transport method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    ListArrays,
    GetArray,
    GetReplicationCapabilities,
    ListJobs,
    GetJob,
    CreateVolume,
    GetVolume,
    GetPrivateVolume,
    ListVolumeIds,
    UpdateVolume,
    DeleteVolume,
    ListStorageGroups,
    GetStorageGroup,
    CreateStorageGroup,
    UpdateStorageGroup,
    DeleteStorageGroup,
    ListStoragePools,
    GetStoragePool,
    ListMaskingViews,
    GetMaskingView,
    CreateMaskingView,
    DeleteMaskingView,
    ListPortGroups,
    GetPortGroup,
    CreatePortGroup,
    UpdatePortGroup,
    DeletePortGroup,
    ListDirectors,
    ListPorts,
    GetPort,
    ListHosts,
    GetHost,
    CreateHost,
    UpdateHostInitiators,
    DeleteHost,
    ListInitiators,
    GetInitiator,
    ListSnapshotVolumes,
    GetVolumeSnapshots,
    CreateSnapshot,
    GetSnapshot,
    ListGenerations,
    GetGeneration,
    ModifySnapshot,
    DeleteSnapshot,
}

impl TransportOp {
    /// Resource the operation acts on, used for injected not-found/exists
    pub fn kind(&self) -> ResourceKind {
        use TransportOp::*;
        match self {
            ListArrays | GetArray | GetReplicationCapabilities => ResourceKind::Array,
            ListJobs | GetJob => ResourceKind::Job,
            CreateVolume | GetVolume | GetPrivateVolume | ListVolumeIds | UpdateVolume
            | DeleteVolume => ResourceKind::Volume,
            ListStorageGroups | GetStorageGroup | CreateStorageGroup | UpdateStorageGroup
            | DeleteStorageGroup => ResourceKind::StorageGroup,
            ListStoragePools | GetStoragePool => ResourceKind::StoragePool,
            ListMaskingViews | GetMaskingView | CreateMaskingView | DeleteMaskingView => {
                ResourceKind::MaskingView
            }
            ListPortGroups | GetPortGroup | CreatePortGroup | UpdatePortGroup | DeletePortGroup => {
                ResourceKind::PortGroup
            }
            ListDirectors => ResourceKind::Director,
            ListPorts | GetPort => ResourceKind::Port,
            ListHosts | GetHost | CreateHost | UpdateHostInitiators | DeleteHost => {
                ResourceKind::Host
            }
            ListInitiators | GetInitiator => ResourceKind::Initiator,
            ListSnapshotVolumes | GetVolumeSnapshots | CreateSnapshot | GetSnapshot
            | ListGenerations | GetGeneration | ModifySnapshot | DeleteSnapshot => {
                ResourceKind::Snapshot
            }
        }
    }
}

/// Failure injected into the next call of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    NotFound,
    Exists,
    InvalidRequest(String),
    Server(u16),
    Transport,
    /// Accept a mutation as a job that ends FAILED, leaving state untouched
    JobFails(String),
    /// Apply only the first port of a port group update
    PartialApply,
}

/// A call seen by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub op: TransportOp,
    /// Empty for calls not scoped to an array
    pub array_id: String,
}

// =============================================================================
// Configuration
// =============================================================================

/// Behaviour of simulated mutations
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Answer mutations with jobs rather than synchronously
    pub async_mutations: bool,
    /// Polls answered RUNNING before a job reaches its final status
    pub job_polls_to_complete: u32,
    /// Calls kept in the log; the oldest are dropped first. 0 disables it.
    pub max_recorded_calls: usize,
    /// Jobs kept per array; finished jobs are evicted oldest first
    pub max_retained_jobs: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            async_mutations: true,
            job_polls_to_complete: 1,
            max_recorded_calls: 10_000,
            max_retained_jobs: 1_000,
        }
    }
}

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Clone)]
struct SimJob {
    job: Job,
    /// Statuses reported by the coming polls, in order; the last one sticks
    script: VecDeque<JobStatus>,
    /// Result attached once a terminal status is reported
    final_result: Option<String>,
}

impl SimJob {
    fn poll(&mut self) -> Job {
        if let Some(next) = self.script.pop_front() {
            if next != self.job.status {
                self.job.status = next;
                self.job.last_modified = Utc::now();
            }
            if next.is_terminal() {
                self.job.result = self.final_result.clone();
            }
        }
        self.job.clone()
    }
}

#[derive(Debug)]
struct ArrayState {
    info: ArrayInfo,
    snap_vx_capable: bool,
    rdf_capable: bool,
    jobs: BTreeMap<String, SimJob>,
    volumes: BTreeMap<String, Volume>,
    storage_groups: BTreeMap<String, StorageGroup>,
    pools: BTreeMap<String, StoragePool>,
    masking_views: BTreeMap<String, MaskingView>,
    port_groups: BTreeMap<String, PortGroup>,
    ports: BTreeMap<PortKey, Port>,
    /// Hosts and host groups share a namespace
    hosts: BTreeMap<String, Host>,
    initiators: BTreeMap<String, Initiator>,
    /// (source volume, snapshot name) to generations, newest first
    snapshots: BTreeMap<(String, String), Vec<SnapshotGeneration>>,
    next_device: u64,
}

impl ArrayState {
    fn new(array_id: &str) -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(
            DEFAULT_SRP.to_string(),
            StoragePool {
                storage_pool_id: DEFAULT_SRP.to_string(),
                usable_capacity_gb: 102_400.0,
                used_capacity_gb: 0.0,
                service_levels: SERVICE_LEVELS.iter().map(|s| s.to_string()).collect(),
            },
        );

        Self {
            info: ArrayInfo {
                symmetrix_id: array_id.to_string(),
                model: "PowerMax_8000".to_string(),
                ucode: "5978.479.479".to_string(),
                device_count: 0,
                local: true,
            },
            snap_vx_capable: true,
            rdf_capable: false,
            jobs: BTreeMap::new(),
            volumes: BTreeMap::new(),
            storage_groups: BTreeMap::new(),
            pools,
            masking_views: BTreeMap::new(),
            port_groups: BTreeMap::new(),
            ports: BTreeMap::new(),
            hosts: BTreeMap::new(),
            initiators: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            next_device: 0x100,
        }
    }

    /// Store a job, evicting the oldest finished jobs past `limit`
    fn insert_job(&mut self, sim: SimJob, limit: usize) {
        while self.jobs.len() >= limit.max(1) {
            let finished = self
                .jobs
                .iter()
                .find(|(_, j)| j.job.is_terminal())
                .map(|(id, _)| id.clone());
            match finished {
                Some(id) => {
                    self.jobs.remove(&id);
                }
                None => break,
            }
        }
        self.jobs.insert(sim.job.job_id.clone(), sim);
    }

    fn capabilities(&self) -> ReplicationCapabilities {
        ReplicationCapabilities {
            symmetrix_id: self.info.symmetrix_id.clone(),
            snap_vx_capable: self.snap_vx_capable,
            rdf_capable: self.rdf_capable,
        }
    }

    fn next_volume_id(&mut self) -> String {
        loop {
            let id = format!("{:05X}", self.next_device);
            self.next_device += 1;
            if !self.volumes.contains_key(&id) {
                return id;
            }
        }
    }

    fn generation_mut(
        &mut self,
        volume_id: &str,
        snapshot_name: &str,
        generation: u64,
    ) -> Option<&mut SnapshotGeneration> {
        self.snapshots
            .get_mut(&(volume_id.to_string(), snapshot_name.to_string()))
            .and_then(|gens| gens.iter_mut().find(|g| g.generation == generation))
    }

    fn require_generation(
        &self,
        volume_id: &str,
        snapshot_name: &str,
        generation: u64,
    ) -> Result<&SnapshotGeneration> {
        self.snapshots
            .get(&(volume_id.to_string(), snapshot_name.to_string()))
            .and_then(|gens| gens.iter().find(|g| g.generation == generation))
            .ok_or_else(|| {
                Error::not_found(
                    ResourceKind::Snapshot,
                    format!("{}/{}/{}", volume_id, snapshot_name, generation),
                )
            })
    }

    fn set_target_flag(&mut self, volume_id: &str, linked: bool) {
        if let Some(volume) = self.volumes.get_mut(volume_id) {
            volume.snapvx_target = linked;
        }
    }

    /// Initiator records matching each identifier; every identifier must
    /// match and none may belong to another host
    fn claim_initiators(&self, host_id: &str, identifiers: &[String]) -> Result<Vec<String>> {
        let mut claimed = Vec::new();
        for identifier in identifiers {
            let matches: Vec<&Initiator> = self
                .initiators
                .values()
                .filter(|i| &i.identifier == identifier)
                .collect();
            if matches.is_empty() {
                return Err(Error::not_found(ResourceKind::Initiator, identifier.as_str()));
            }
            for initiator in matches {
                if let Some(owner) = initiator.host_id.as_deref().filter(|o| *o != host_id) {
                    return Err(Error::InvalidRequest(format!(
                        "initiator {} already belongs to host {}",
                        identifier, owner
                    )));
                }
                claimed.push(initiator.initiator_id.clone());
            }
        }
        Ok(claimed)
    }

    fn host_type(&self, initiator_ids: &[String]) -> String {
        let iscsi = initiator_ids
            .iter()
            .filter_map(|id| self.initiators.get(id))
            .all(Initiator::is_iscsi);
        if iscsi && !initiator_ids.is_empty() {
            "iSCSI".to_string()
        } else {
            "Fibre".to_string()
        }
    }

    fn set_initiator_owner(&mut self, initiator_ids: &[String], host_id: Option<&str>) {
        for id in initiator_ids {
            if let Some(initiator) = self.initiators.get_mut(id) {
                initiator.host_id = host_id.map(str::to_string);
            }
        }
    }

    fn release_initiators(&mut self, host_id: &str) {
        for initiator in self.initiators.values_mut() {
            if initiator.host_id.as_deref() == Some(host_id) {
                initiator.host_id = None;
            }
        }
    }
}

fn summarize(snapshot_name: &str, volume_id: &str, gens: &[SnapshotGeneration]) -> VolumeSnapshot {
    VolumeSnapshot {
        snapshot_name: snapshot_name.to_string(),
        source_volume: volume_id.to_string(),
        generation_count: gens.len() as u32,
        newest: gens.first().map(|g| g.timestamp),
        linked: gens.iter().any(|g| g.link_state == LinkState::Linked),
    }
}

fn session(source: &str, generation: &SnapshotGeneration, target: Option<&str>) -> SnapSession {
    SnapSession {
        snapshot_name: generation.snapshot_name.clone(),
        source_volume: source.to_string(),
        generation: generation.generation,
        target_volume: target.map(str::to_string),
    }
}

fn port_protocol(ports: &[PortKey]) -> Option<String> {
    if ports.is_empty() {
        None
    } else if ports.iter().all(|p| p.director_id.starts_with("SE")) {
        Some("ISCSI".to_string())
    } else {
        Some("SCSI_FC".to_string())
    }
}

fn job_failure(fault: &Option<Fault>) -> Option<String> {
    match fault {
        Some(Fault::JobFails(reason)) => Some(reason.clone()),
        _ => None,
    }
}

// =============================================================================
// In-Memory Array
// =============================================================================

/// Simulated management server holding any number of arrays
pub struct InMemoryArray {
    config: SimulatorConfig,
    arrays: DashMap<String, ArrayState>,
    calls: Mutex<VecDeque<RecordedCall>>,
    faults: Mutex<HashMap<TransportOp, VecDeque<Fault>>>,
    next_job: AtomicU64,
}

impl Default for InMemoryArray {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl InMemoryArray {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            arrays: DashMap::new(),
            calls: Mutex::new(VecDeque::new()),
            faults: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(1),
        }
    }

    /// A shared simulator with one empty array
    pub fn with_array(array_id: &str) -> Arc<Self> {
        let array = Self::default();
        array.add_array(array_id);
        Arc::new(array)
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    // --- recording and faults ---------------------------------------------------

    /// Recorded calls, oldest first
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().iter().cloned().collect()
    }

    pub fn call_count(&self, op: TransportOp) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Queue a fault for the next call of `op`. Faults queue up per operation.
    pub fn fail_next(&self, op: TransportOp, fault: Fault) {
        self.faults.lock().entry(op).or_default().push_back(fault);
    }

    fn enter(&self, op: TransportOp, array_id: &str) -> Result<Option<Fault>> {
        debug!(op = ?op, array_id = %array_id, "Simulated call");
        self.record(op, array_id);

        let fault = self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match fault {
            None => Ok(None),
            Some(Fault::NotFound) => Err(Error::not_found(op.kind(), "injected")),
            Some(Fault::Exists) => Err(Error::exists(op.kind(), "injected")),
            Some(Fault::InvalidRequest(message)) => Err(Error::InvalidRequest(message)),
            Some(Fault::Server(status)) => Err(Error::Server {
                status,
                message: "injected server fault".to_string(),
            }),
            Some(Fault::Transport) => Err(Error::Transport("injected connection reset".to_string())),
            Some(fault) => Ok(Some(fault)),
        }
    }

    fn record(&self, op: TransportOp, array_id: &str) {
        let limit = self.config.max_recorded_calls;
        if limit == 0 {
            return;
        }
        let mut calls = self.calls.lock();
        while calls.len() >= limit {
            calls.pop_front();
        }
        calls.push_back(RecordedCall {
            op,
            array_id: array_id.to_string(),
        });
    }

    fn read(&self, array_id: &str) -> Result<Ref<'_, String, ArrayState>> {
        self.arrays
            .get(array_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Array, array_id))
    }

    fn write(&self, array_id: &str) -> Result<RefMut<'_, String, ArrayState>> {
        self.arrays
            .get_mut(array_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Array, array_id))
    }

    fn seed(&self, array_id: &str) -> RefMut<'_, String, ArrayState> {
        self.arrays
            .entry(array_id.to_string())
            .or_insert_with(|| ArrayState::new(array_id))
    }

    // --- jobs -------------------------------------------------------------------

    fn spawn_job(
        &self,
        state: &mut ArrayState,
        name: &str,
        final_status: JobStatus,
        final_result: Option<String>,
    ) -> Job {
        let polls = self.config.job_polls_to_complete as usize;
        let job_id = format!("sim-{:06}", self.next_job.fetch_add(1, Ordering::Relaxed));
        let settled = polls == 0;
        let mut script: VecDeque<JobStatus> =
            std::iter::repeat(JobStatus::Running).take(polls).collect();
        script.push_back(final_status);

        let job = Job {
            job_id: job_id.clone(),
            array_id: state.info.symmetrix_id.clone(),
            name: name.to_string(),
            status: if settled { final_status } else { JobStatus::Running },
            result: if settled { final_result.clone() } else { None },
            resource_link: None,
            last_modified: Utc::now(),
        };
        state.insert_job(
            SimJob {
                job: job.clone(),
                script,
                final_result,
            },
            self.config.max_retained_jobs,
        );
        job
    }

    /// Answer a mutation that has been applied
    fn submit<T>(&self, state: &mut ArrayState, name: &str, value: T) -> Submission<T> {
        if self.config.async_mutations {
            Submission::Job(self.spawn_job(state, name, JobStatus::Succeeded, None))
        } else {
            Submission::Complete(value)
        }
    }

    /// Answer a mutation that will fail without being applied
    fn reject<T>(&self, state: &mut ArrayState, name: &str, reason: String) -> Submission<T> {
        Submission::Job(self.spawn_job(state, name, JobStatus::Failed, Some(reason)))
    }

    // --- seeding ----------------------------------------------------------------

    /// Register an empty array with the default pool
    pub fn add_array(&self, array_id: &str) {
        drop(self.seed(array_id));
    }

    /// Register a job whose n-th poll reports `statuses[n]`; once the list
    /// runs out the last status sticks. An empty list leaves it CREATED.
    pub fn add_job(&self, array_id: &str, job_id: &str, statuses: &[JobStatus]) {
        let limit = self.config.max_retained_jobs;
        let mut state = self.seed(array_id);
        let job = Job {
            job_id: job_id.to_string(),
            array_id: array_id.to_string(),
            name: format!("Job {}", job_id),
            status: statuses.first().copied().unwrap_or(JobStatus::Created),
            result: None,
            resource_link: None,
            last_modified: Utc::now(),
        };
        state.insert_job(
            SimJob {
                job,
                script: statuses.iter().copied().collect(),
                final_result: None,
            },
            limit,
        );
    }

    /// Set the replication features the array reports
    pub fn set_replication_capabilities(&self, array_id: &str, snap_vx: bool, rdf: bool) {
        let mut state = self.seed(array_id);
        state.snap_vx_capable = snap_vx;
        state.rdf_capable = rdf;
    }

    /// Add a front-end port; SE directors are iSCSI, others Fibre Channel
    pub fn add_port(
        &self,
        array_id: &str,
        key: PortKey,
        identifier: &str,
        ip_addresses: &[&str],
    ) {
        let mut state = self.seed(array_id);
        let port = Port {
            port_type: port_type(&key).to_string(),
            key: key.clone(),
            identifier: identifier.to_string(),
            ip_addresses: ip_addresses.iter().map(|ip| ip.to_string()).collect(),
        };
        state.ports.insert(key, port);
    }

    pub fn add_storage_group(&self, array_id: &str, storage_group_id: &str, srp_id: &str, service_level: &str) {
        let mut state = self.seed(array_id);
        state.storage_groups.insert(
            storage_group_id.to_string(),
            StorageGroup {
                storage_group_id: storage_group_id.to_string(),
                srp_id: Some(srp_id.to_string()),
                service_level: Some(service_level.to_string()),
                volume_ids: BTreeSet::new(),
                masking_view_ids: Vec::new(),
            },
        );
    }

    /// Add a volume, joining any of the listed storage groups that exist
    pub fn add_volume(
        &self,
        array_id: &str,
        volume_id: &str,
        identifier: &str,
        capacity_gb: f64,
        storage_group_ids: &[&str],
    ) {
        let mut guard = self.seed(array_id);
        let state = &mut *guard;

        let mut joined = Vec::new();
        for sg_id in storage_group_ids {
            if let Some(group) = state.storage_groups.get_mut(*sg_id) {
                group.volume_ids.insert(volume_id.to_string());
                joined.push(sg_id.to_string());
            }
        }
        state.volumes.insert(
            volume_id.to_string(),
            Volume {
                volume_id: volume_id.to_string(),
                identifier: identifier.to_string(),
                capacity_gb,
                capacity_cylinders: (capacity_gb * 1024.0 / MB_PER_CYLINDER).ceil() as u64,
                storage_group_ids: joined,
                snapvx_source: false,
                snapvx_target: false,
            },
        );
    }

    pub fn add_port_group(&self, array_id: &str, port_group_id: &str, ports: Vec<PortKey>) {
        let mut state = self.seed(array_id);
        state.port_groups.insert(
            port_group_id.to_string(),
            PortGroup {
                port_group_id: port_group_id.to_string(),
                protocol: port_protocol(&ports),
                ports,
                masking_view_ids: Vec::new(),
            },
        );
    }

    /// Add an initiator logged into `port` (DIRECTOR:PORT)
    pub fn add_initiator(&self, array_id: &str, identifier: &str, initiator_type: &str, port: &str) {
        let mut state = self.seed(array_id);
        let initiator_id = format!("{}:{}", port, identifier);
        state.initiators.insert(
            initiator_id.clone(),
            Initiator {
                initiator_id,
                identifier: identifier.to_string(),
                initiator_type: initiator_type.to_string(),
                director_ports: vec![port.to_string()],
                host_id: None,
            },
        );
    }

    /// Add a host over already-registered initiator identifiers
    pub fn add_host(&self, array_id: &str, host_id: &str, initiators: &[&str]) {
        let mut guard = self.seed(array_id);
        let state = &mut *guard;

        let identifiers: Vec<String> = initiators.iter().map(|i| i.to_string()).collect();
        let records: Vec<String> = state
            .initiators
            .values()
            .filter(|i| identifiers.contains(&i.identifier))
            .map(|i| i.initiator_id.clone())
            .collect();
        state.set_initiator_owner(&records, Some(host_id));

        let host_type = state.host_type(&records);
        state.hosts.insert(
            host_id.to_string(),
            Host {
                host_id: host_id.to_string(),
                kind: HostKind::Host,
                host_type,
                initiators: identifiers,
                hosts: Vec::new(),
                masking_view_ids: Vec::new(),
            },
        );
    }

    pub fn add_host_group(&self, array_id: &str, host_group_id: &str, hosts: &[&str]) {
        let mut state = self.seed(array_id);
        state.hosts.insert(
            host_group_id.to_string(),
            Host {
                host_id: host_group_id.to_string(),
                kind: HostKind::HostGroup,
                host_type: "Fibre".to_string(),
                initiators: Vec::new(),
                hosts: hosts.iter().map(|h| h.to_string()).collect(),
                masking_view_ids: Vec::new(),
            },
        );
    }

    /// Add a masking view and its back-references, without validation
    pub fn add_masking_view(&self, array_id: &str, view: MaskingView) {
        let mut guard = self.seed(array_id);
        let state = &mut *guard;
        link_masking_view(state, &view);
        state.masking_views.insert(view.masking_view_id.clone(), view);
    }
}

fn link_masking_view(state: &mut ArrayState, view: &MaskingView) {
    let id = view.masking_view_id.clone();
    if let Some(group) = state.storage_groups.get_mut(&view.storage_group_id) {
        group.masking_view_ids.push(id.clone());
    }
    if let Some(group) = state.port_groups.get_mut(&view.port_group_id) {
        group.masking_view_ids.push(id.clone());
    }
    if let Some(host) = state.hosts.get_mut(view.host_id()) {
        host.masking_view_ids.push(id);
    }
}

fn unlink_masking_view(state: &mut ArrayState, view: &MaskingView) {
    let id = view.masking_view_id.as_str();
    if let Some(group) = state.storage_groups.get_mut(&view.storage_group_id) {
        group.masking_view_ids.retain(|m| m != id);
    }
    if let Some(group) = state.port_groups.get_mut(&view.port_group_id) {
        group.masking_view_ids.retain(|m| m != id);
    }
    if let Some(host) = state.hosts.get_mut(view.host_id()) {
        host.masking_view_ids.retain(|m| m != id);
    }
}

// =============================================================================
// Transport Implementation
// =============================================================================

#[async_trait]
impl ArrayTransport for InMemoryArray {
    async fn list_arrays(&self) -> Result<Vec<String>> {
        self.enter(TransportOp::ListArrays, "")?;
        let mut ids: Vec<String> = self.arrays.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_array(&self, array_id: &str) -> Result<ArrayInfo> {
        self.enter(TransportOp::GetArray, array_id)?;
        let state = self.read(array_id)?;
        let mut info = state.info.clone();
        info.device_count = state.volumes.len() as u32;
        Ok(info)
    }

    async fn get_replication_capabilities(&self) -> Result<Vec<ReplicationCapabilities>> {
        self.enter(TransportOp::GetReplicationCapabilities, "")?;
        let mut capabilities: Vec<ReplicationCapabilities> =
            self.arrays.iter().map(|e| e.value().capabilities()).collect();
        capabilities.sort_by(|a, b| a.symmetrix_id.cmp(&b.symmetrix_id));
        Ok(capabilities)
    }

    async fn list_jobs(&self, array_id: &str, status: Option<JobStatus>) -> Result<Vec<String>> {
        self.enter(TransportOp::ListJobs, array_id)?;
        let state = self.read(array_id)?;
        Ok(state
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.job.status == s))
            .map(|j| j.job.job_id.clone())
            .collect())
    }

    async fn get_job(&self, array_id: &str, job_id: &str) -> Result<Job> {
        self.enter(TransportOp::GetJob, array_id)?;
        let mut state = self.write(array_id)?;
        state
            .jobs
            .get_mut(job_id)
            .map(SimJob::poll)
            .ok_or_else(|| Error::not_found(ResourceKind::Job, job_id))
    }

    async fn create_volume(
        &self,
        array_id: &str,
        storage_group_id: &str,
        name: &str,
        size_cylinders: u64,
    ) -> Result<Submission<Volume>> {
        let fault = self.enter(TransportOp::CreateVolume, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if !state.storage_groups.contains_key(storage_group_id) {
            return Err(Error::not_found(ResourceKind::StorageGroup, storage_group_id));
        }
        let job_name = format!("Create volume {}", name);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        let volume_id = state.next_volume_id();
        let volume = Volume {
            volume_id: volume_id.clone(),
            identifier: name.to_string(),
            capacity_gb: cylinders_to_gb(size_cylinders),
            capacity_cylinders: size_cylinders,
            storage_group_ids: vec![storage_group_id.to_string()],
            snapvx_source: false,
            snapvx_target: false,
        };
        state.volumes.insert(volume_id.clone(), volume.clone());
        if let Some(group) = state.storage_groups.get_mut(storage_group_id) {
            group.volume_ids.insert(volume_id);
        }
        Ok(self.submit(state, &job_name, volume))
    }

    async fn get_volume(&self, array_id: &str, volume_id: &str) -> Result<Volume> {
        self.enter(TransportOp::GetVolume, array_id)?;
        let state = self.read(array_id)?;
        state
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Volume, volume_id))
    }

    async fn get_private_volume(&self, array_id: &str, volume_id: &str) -> Result<PrivateVolume> {
        self.enter(TransportOp::GetPrivateVolume, array_id)?;
        let state = self.read(array_id)?;
        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Volume, volume_id))?;

        let mut source_sessions = Vec::new();
        let mut target_sessions = Vec::new();
        for ((source, _), gens) in &state.snapshots {
            for generation in gens {
                if source == volume_id {
                    if generation.linked_targets.is_empty() {
                        source_sessions.push(session(source, generation, None));
                    }
                    for target in &generation.linked_targets {
                        source_sessions.push(session(source, generation, Some(target.as_str())));
                    }
                }
                if generation.linked_targets.iter().any(|t| t == volume_id) {
                    target_sessions.push(session(source, generation, Some(volume_id)));
                }
            }
        }

        Ok(PrivateVolume {
            volume_id: volume_id.to_string(),
            wwn: volume_wwn(array_id, volume_id),
            snapvx_source: volume.snapvx_source,
            snapvx_target: volume.snapvx_target,
            source_sessions,
            target_sessions,
        })
    }

    async fn list_volume_ids(
        &self,
        array_id: &str,
        identifier: &str,
        like: bool,
    ) -> Result<Vec<String>> {
        self.enter(TransportOp::ListVolumeIds, array_id)?;
        let state = self.read(array_id)?;
        Ok(state
            .volumes
            .values()
            .filter(|v| {
                identifier.is_empty()
                    || (like && v.identifier.contains(identifier))
                    || v.identifier == identifier
            })
            .map(|v| v.volume_id.clone())
            .collect())
    }

    async fn update_volume(
        &self,
        array_id: &str,
        volume_id: &str,
        update: VolumeUpdate,
    ) -> Result<Submission<Volume>> {
        let fault = self.enter(TransportOp::UpdateVolume, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        let current = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Volume, volume_id))?;
        if let VolumeUpdate::Expand { size_gb } = &update {
            if (*size_gb as f64) < current.capacity_gb {
                return Err(Error::InvalidRequest(format!(
                    "volume {} cannot shrink from {} GB to {} GB",
                    volume_id, current.capacity_gb, size_gb
                )));
            }
        }

        let job_name = format!("Modify volume {}", volume_id);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        let volume = match update {
            VolumeUpdate::Deallocate => {
                let job = self.spawn_job(
                    state,
                    &format!("Deallocate volume {}", volume_id),
                    JobStatus::Succeeded,
                    None,
                );
                return Ok(Submission::Job(job));
            }
            VolumeUpdate::Rename(name) => {
                let volume = state
                    .volumes
                    .get_mut(volume_id)
                    .ok_or_else(|| Error::not_found(ResourceKind::Volume, volume_id))?;
                volume.identifier = name;
                volume.clone()
            }
            VolumeUpdate::Expand { size_gb } => {
                let volume = state
                    .volumes
                    .get_mut(volume_id)
                    .ok_or_else(|| Error::not_found(ResourceKind::Volume, volume_id))?;
                volume.capacity_gb = size_gb as f64;
                volume.capacity_cylinders = gb_to_cylinders(size_gb);
                volume.clone()
            }
        };
        Ok(self.submit(state, &job_name, volume))
    }

    async fn delete_volume(&self, array_id: &str, volume_id: &str) -> Result<()> {
        self.enter(TransportOp::DeleteVolume, array_id)?;
        let mut state = self.write(array_id)?;

        let volume = state
            .volumes
            .get(volume_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Volume, volume_id))?;
        if volume.in_any_storage_group() {
            return Err(Error::InvalidRequest(format!(
                "volume {} is a member of storage groups",
                volume_id
            )));
        }
        state.volumes.remove(volume_id);
        state.snapshots.retain(|(source, _), _| source != volume_id);
        Ok(())
    }

    async fn list_storage_groups(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(TransportOp::ListStorageGroups, array_id)?;
        let state = self.read(array_id)?;
        Ok(state.storage_groups.keys().cloned().collect())
    }

    async fn get_storage_group(
        &self,
        array_id: &str,
        storage_group_id: &str,
    ) -> Result<StorageGroup> {
        self.enter(TransportOp::GetStorageGroup, array_id)?;
        let state = self.read(array_id)?;
        state
            .storage_groups
            .get(storage_group_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::StorageGroup, storage_group_id))
    }

    async fn create_storage_group(
        &self,
        array_id: &str,
        storage_group_id: &str,
        srp_id: &str,
        service_level: &str,
    ) -> Result<Submission<StorageGroup>> {
        let fault = self.enter(TransportOp::CreateStorageGroup, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if state.storage_groups.contains_key(storage_group_id) {
            return Err(Error::exists(ResourceKind::StorageGroup, storage_group_id));
        }
        let pool = state
            .pools
            .get(srp_id)
            .ok_or_else(|| Error::not_found(ResourceKind::StoragePool, srp_id))?;
        if !service_level.is_empty()
            && !pool
                .service_levels
                .iter()
                .any(|level| level.eq_ignore_ascii_case(service_level))
        {
            return Err(Error::InvalidRequest(format!(
                "service level {} not offered by {}",
                service_level, srp_id
            )));
        }

        let job_name = format!("Create storage group {}", storage_group_id);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        let group = StorageGroup {
            storage_group_id: storage_group_id.to_string(),
            srp_id: Some(srp_id.to_string()),
            service_level: Some(service_level.to_string()).filter(|s| !s.is_empty()),
            volume_ids: BTreeSet::new(),
            masking_view_ids: Vec::new(),
        };
        state
            .storage_groups
            .insert(storage_group_id.to_string(), group.clone());
        Ok(self.submit(state, &job_name, group))
    }

    async fn update_storage_group(
        &self,
        array_id: &str,
        storage_group_id: &str,
        change: MembershipChange,
    ) -> Result<Submission<StorageGroup>> {
        let fault = self.enter(TransportOp::UpdateStorageGroup, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if !state.storage_groups.contains_key(storage_group_id) {
            return Err(Error::not_found(ResourceKind::StorageGroup, storage_group_id));
        }
        if let MembershipChange::Add(ids) = &change {
            if let Some(missing) = ids.iter().find(|id| !state.volumes.contains_key(*id)) {
                return Err(Error::not_found(ResourceKind::Volume, missing.as_str()));
            }
        }

        let job_name = format!("Modify storage group {}", storage_group_id);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        let group = state
            .storage_groups
            .get_mut(storage_group_id)
            .ok_or_else(|| Error::not_found(ResourceKind::StorageGroup, storage_group_id))?;
        match change {
            MembershipChange::Add(ids) => {
                for id in ids {
                    if let Some(volume) = state.volumes.get_mut(&id) {
                        if !volume.storage_group_ids.iter().any(|g| g == storage_group_id) {
                            volume.storage_group_ids.push(storage_group_id.to_string());
                        }
                    }
                    group.volume_ids.insert(id);
                }
            }
            MembershipChange::Remove(ids) => {
                for id in ids {
                    group.volume_ids.remove(&id);
                    if let Some(volume) = state.volumes.get_mut(&id) {
                        volume.storage_group_ids.retain(|g| g != storage_group_id);
                    }
                }
            }
        }
        let group = group.clone();
        Ok(self.submit(state, &job_name, group))
    }

    async fn delete_storage_group(&self, array_id: &str, storage_group_id: &str) -> Result<()> {
        self.enter(TransportOp::DeleteStorageGroup, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        let group = state
            .storage_groups
            .get(storage_group_id)
            .ok_or_else(|| Error::not_found(ResourceKind::StorageGroup, storage_group_id))?;
        if !group.masking_view_ids.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "storage group {} is used by masking views {}",
                storage_group_id,
                group.masking_view_ids.join(",")
            )));
        }
        state.storage_groups.remove(storage_group_id);
        for volume in state.volumes.values_mut() {
            volume.storage_group_ids.retain(|g| g != storage_group_id);
        }
        Ok(())
    }

    async fn list_storage_pools(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(TransportOp::ListStoragePools, array_id)?;
        let state = self.read(array_id)?;
        Ok(state.pools.keys().cloned().collect())
    }

    async fn get_storage_pool(&self, array_id: &str, pool_id: &str) -> Result<StoragePool> {
        self.enter(TransportOp::GetStoragePool, array_id)?;
        let state = self.read(array_id)?;
        let mut pool = state
            .pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::StoragePool, pool_id))?;
        pool.used_capacity_gb = state.volumes.values().map(|v| v.capacity_gb).sum();
        Ok(pool)
    }

    async fn list_masking_views(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(TransportOp::ListMaskingViews, array_id)?;
        let state = self.read(array_id)?;
        Ok(state.masking_views.keys().cloned().collect())
    }

    async fn get_masking_view(&self, array_id: &str, masking_view_id: &str) -> Result<MaskingView> {
        self.enter(TransportOp::GetMaskingView, array_id)?;
        let state = self.read(array_id)?;
        state
            .masking_views
            .get(masking_view_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::MaskingView, masking_view_id))
    }

    async fn create_masking_view(
        &self,
        array_id: &str,
        spec: MaskingViewSpec,
    ) -> Result<Submission<MaskingView>> {
        let fault = self.enter(TransportOp::CreateMaskingView, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if state.masking_views.contains_key(&spec.masking_view_id) {
            return Err(Error::exists(ResourceKind::MaskingView, spec.masking_view_id));
        }
        if !state.storage_groups.contains_key(&spec.storage_group_id) {
            return Err(Error::not_found(ResourceKind::StorageGroup, spec.storage_group_id));
        }
        if !state.port_groups.contains_key(&spec.port_group_id) {
            return Err(Error::not_found(ResourceKind::PortGroup, spec.port_group_id));
        }
        let expected = match &spec.initiator_group {
            InitiatorGroupRef::Host(_) => HostKind::Host,
            InitiatorGroupRef::HostGroup(_) => HostKind::HostGroup,
        };
        let host_ok = state
            .hosts
            .get(spec.initiator_group.id())
            .map_or(false, |h| h.kind == expected);
        if !host_ok {
            return Err(Error::not_found(
                spec.initiator_group.kind(),
                spec.initiator_group.id(),
            ));
        }

        let job_name = format!("Create masking view {}", spec.masking_view_id);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        let view = MaskingView {
            masking_view_id: spec.masking_view_id,
            initiator_group: spec.initiator_group,
            storage_group_id: spec.storage_group_id,
            port_group_id: spec.port_group_id,
        };
        link_masking_view(state, &view);
        state
            .masking_views
            .insert(view.masking_view_id.clone(), view.clone());
        Ok(self.submit(state, &job_name, view))
    }

    async fn delete_masking_view(&self, array_id: &str, masking_view_id: &str) -> Result<()> {
        self.enter(TransportOp::DeleteMaskingView, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        let view = state
            .masking_views
            .remove(masking_view_id)
            .ok_or_else(|| Error::not_found(ResourceKind::MaskingView, masking_view_id))?;
        unlink_masking_view(state, &view);
        Ok(())
    }

    async fn list_port_groups(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(TransportOp::ListPortGroups, array_id)?;
        let state = self.read(array_id)?;
        Ok(state.port_groups.keys().cloned().collect())
    }

    async fn get_port_group(&self, array_id: &str, port_group_id: &str) -> Result<PortGroup> {
        self.enter(TransportOp::GetPortGroup, array_id)?;
        let state = self.read(array_id)?;
        state
            .port_groups
            .get(port_group_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::PortGroup, port_group_id))
    }

    async fn create_port_group(
        &self,
        array_id: &str,
        port_group_id: &str,
        ports: Vec<PortKey>,
    ) -> Result<PortGroup> {
        self.enter(TransportOp::CreatePortGroup, array_id)?;
        let mut state = self.write(array_id)?;

        if state.port_groups.contains_key(port_group_id) {
            return Err(Error::exists(ResourceKind::PortGroup, port_group_id));
        }
        let group = PortGroup {
            port_group_id: port_group_id.to_string(),
            protocol: port_protocol(&ports),
            ports,
            masking_view_ids: Vec::new(),
        };
        state
            .port_groups
            .insert(port_group_id.to_string(), group.clone());
        Ok(group)
    }

    async fn update_port_group(
        &self,
        array_id: &str,
        port_group_id: &str,
        mut ports: Vec<PortKey>,
    ) -> Result<Submission<PortGroup>> {
        let fault = self.enter(TransportOp::UpdatePortGroup, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if !state.port_groups.contains_key(port_group_id) {
            return Err(Error::not_found(ResourceKind::PortGroup, port_group_id));
        }
        let job_name = format!("Modify port group {}", port_group_id);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }
        if fault == Some(Fault::PartialApply) {
            ports.truncate(1);
        }

        let group = state
            .port_groups
            .get_mut(port_group_id)
            .ok_or_else(|| Error::not_found(ResourceKind::PortGroup, port_group_id))?;
        group.protocol = port_protocol(&ports).or_else(|| group.protocol.clone());
        group.ports = ports;
        let group = group.clone();
        Ok(self.submit(state, &job_name, group))
    }

    async fn delete_port_group(&self, array_id: &str, port_group_id: &str) -> Result<()> {
        self.enter(TransportOp::DeletePortGroup, array_id)?;
        let mut state = self.write(array_id)?;

        let group = state
            .port_groups
            .get(port_group_id)
            .ok_or_else(|| Error::not_found(ResourceKind::PortGroup, port_group_id))?;
        if !group.masking_view_ids.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "port group {} is used by masking views {}",
                port_group_id,
                group.masking_view_ids.join(",")
            )));
        }
        state.port_groups.remove(port_group_id);
        Ok(())
    }

    async fn list_directors(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(TransportOp::ListDirectors, array_id)?;
        let state = self.read(array_id)?;
        let directors: BTreeSet<&String> = state.ports.keys().map(|k| &k.director_id).collect();
        Ok(directors.into_iter().cloned().collect())
    }

    async fn list_ports(
        &self,
        array_id: &str,
        director_id: &str,
        filter: PortFilter,
    ) -> Result<Vec<PortKey>> {
        self.enter(TransportOp::ListPorts, array_id)?;
        let state = self.read(array_id)?;
        let on_director: Vec<&Port> = state
            .ports
            .values()
            .filter(|p| p.key.director_id == director_id)
            .collect();
        if on_director.is_empty() {
            return Err(Error::not_found(ResourceKind::Director, director_id));
        }
        Ok(on_director
            .into_iter()
            .filter(|p| !filter.iscsi_only || p.is_iscsi())
            .map(|p| p.key.clone())
            .collect())
    }

    async fn get_port(&self, array_id: &str, port: &PortKey) -> Result<Port> {
        self.enter(TransportOp::GetPort, array_id)?;
        let state = self.read(array_id)?;
        state
            .ports
            .get(port)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Port, port.to_string()))
    }

    async fn list_hosts(&self, array_id: &str) -> Result<Vec<String>> {
        self.enter(TransportOp::ListHosts, array_id)?;
        let state = self.read(array_id)?;
        Ok(state.hosts.keys().cloned().collect())
    }

    async fn get_host(&self, array_id: &str, host_id: &str) -> Result<Host> {
        self.enter(TransportOp::GetHost, array_id)?;
        let state = self.read(array_id)?;
        state
            .hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Host, host_id))
    }

    async fn create_host(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: Vec<String>,
    ) -> Result<Host> {
        self.enter(TransportOp::CreateHost, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if state.hosts.contains_key(host_id) {
            return Err(Error::exists(ResourceKind::Host, host_id));
        }
        let records = state.claim_initiators(host_id, &initiators)?;
        state.set_initiator_owner(&records, Some(host_id));

        let host = Host {
            host_id: host_id.to_string(),
            kind: HostKind::Host,
            host_type: state.host_type(&records),
            initiators,
            hosts: Vec::new(),
            masking_view_ids: Vec::new(),
        };
        state.hosts.insert(host_id.to_string(), host.clone());
        Ok(host)
    }

    async fn update_host_initiators(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: Vec<String>,
    ) -> Result<Host> {
        self.enter(TransportOp::UpdateHostInitiators, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        match state.hosts.get(host_id) {
            Some(host) if host.kind == HostKind::Host => {}
            Some(_) => {
                return Err(Error::InvalidRequest(format!(
                    "{} is a host group",
                    host_id
                )))
            }
            None => return Err(Error::not_found(ResourceKind::Host, host_id)),
        }
        let records = state.claim_initiators(host_id, &initiators)?;
        state.release_initiators(host_id);
        state.set_initiator_owner(&records, Some(host_id));

        let host_type = state.host_type(&records);
        let host = state
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Host, host_id))?;
        host.initiators = initiators;
        host.host_type = host_type;
        Ok(host.clone())
    }

    async fn delete_host(&self, array_id: &str, host_id: &str) -> Result<()> {
        self.enter(TransportOp::DeleteHost, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        let host = state
            .hosts
            .get(host_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Host, host_id))?;
        if !host.masking_view_ids.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "host {} is used by masking views {}",
                host_id,
                host.masking_view_ids.join(",")
            )));
        }
        state.hosts.remove(host_id);
        state.release_initiators(host_id);
        for group in state.hosts.values_mut() {
            group.hosts.retain(|h| h != host_id);
        }
        Ok(())
    }

    async fn list_initiators(
        &self,
        array_id: &str,
        filter: InitiatorFilter,
    ) -> Result<Vec<String>> {
        self.enter(TransportOp::ListInitiators, array_id)?;
        let state = self.read(array_id)?;
        Ok(state
            .initiators
            .values()
            .filter(|i| {
                filter
                    .name
                    .as_deref()
                    .map_or(true, |name| i.identifier.contains(name))
            })
            .filter(|i| !filter.iscsi_only || i.is_iscsi())
            .filter(|i| !filter.in_host_only || i.host_id.is_some())
            .map(|i| i.initiator_id.clone())
            .collect())
    }

    async fn get_initiator(&self, array_id: &str, initiator_id: &str) -> Result<Initiator> {
        self.enter(TransportOp::GetInitiator, array_id)?;
        let state = self.read(array_id)?;
        state
            .initiators
            .get(initiator_id)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Initiator, initiator_id))
    }

    async fn list_snapshot_volumes(
        &self,
        array_id: &str,
        filter: SnapVolumeFilter,
    ) -> Result<Vec<String>> {
        self.enter(TransportOp::ListSnapshotVolumes, array_id)?;
        let state = self.read(array_id)?;
        let now = Utc::now();
        let sources: BTreeSet<&String> = state
            .snapshots
            .iter()
            .filter(|((_, name), _)| {
                filter.snapshot_name.as_deref().map_or(true, |n| n == name.as_str())
            })
            .filter(|(_, gens)| {
                !filter.linked_only || gens.iter().any(|g| g.link_state == LinkState::Linked)
            })
            .filter(|(_, gens)| !filter.expired_only || gens.iter().any(|g| g.is_expired_at(now)))
            .map(|((volume, _), _)| volume)
            .collect();
        Ok(sources.into_iter().cloned().collect())
    }

    async fn get_volume_snapshots(
        &self,
        array_id: &str,
        volume_id: &str,
    ) -> Result<Vec<VolumeSnapshot>> {
        self.enter(TransportOp::GetVolumeSnapshots, array_id)?;
        let state = self.read(array_id)?;
        if !state.volumes.contains_key(volume_id) {
            return Err(Error::not_found(ResourceKind::Volume, volume_id));
        }
        Ok(state
            .snapshots
            .iter()
            .filter(|((source, _), _)| source == volume_id)
            .map(|((source, name), gens)| summarize(name, source, gens))
            .collect())
    }

    async fn create_snapshot(
        &self,
        array_id: &str,
        request: CreateSnapshot,
    ) -> Result<Submission<()>> {
        let fault = self.enter(TransportOp::CreateSnapshot, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;

        if !state.snap_vx_capable {
            return Err(Error::InvalidRequest(format!(
                "array {} is not SnapVX capable",
                array_id
            )));
        }
        if let Some(missing) = request
            .source_volumes
            .iter()
            .find(|v| !state.volumes.contains_key(*v))
        {
            return Err(Error::not_found(ResourceKind::Volume, missing.as_str()));
        }

        let job_name = format!("Create snapshot {}", request.snapshot_name);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        let now = Utc::now();
        for source in &request.source_volumes {
            let gens = state
                .snapshots
                .entry((source.clone(), request.snapshot_name.clone()))
                .or_default();
            for generation in gens.iter_mut() {
                generation.generation += 1;
            }
            gens.insert(
                0,
                SnapshotGeneration {
                    snapshot_name: request.snapshot_name.clone(),
                    source_volume: source.clone(),
                    generation: 0,
                    timestamp: now,
                    time_to_live_hours: request.time_to_live_hours,
                    link_state: LinkState::Unlinked,
                    linked_targets: Vec::new(),
                    mode: Default::default(),
                    expired: false,
                },
            );
            if let Some(volume) = state.volumes.get_mut(source) {
                volume.snapvx_source = true;
            }
        }
        Ok(self.submit(state, &job_name, ()))
    }

    async fn get_snapshot(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<VolumeSnapshot> {
        self.enter(TransportOp::GetSnapshot, array_id)?;
        let state = self.read(array_id)?;
        state
            .snapshots
            .get(&(volume_id.to_string(), snapshot_name.to_string()))
            .map(|gens| summarize(snapshot_name, volume_id, gens))
            .ok_or_else(|| Error::not_found(ResourceKind::Snapshot, snapshot_name))
    }

    async fn list_generations(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<Vec<SnapshotGeneration>> {
        self.enter(TransportOp::ListGenerations, array_id)?;
        let state = self.read(array_id)?;
        let now = Utc::now();
        state
            .snapshots
            .get(&(volume_id.to_string(), snapshot_name.to_string()))
            .map(|gens| {
                gens.iter()
                    .cloned()
                    .map(|mut g| {
                        g.expired = g.is_expired_at(now);
                        g
                    })
                    .collect()
            })
            .ok_or_else(|| Error::not_found(ResourceKind::Snapshot, snapshot_name))
    }

    async fn get_generation(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
        generation: u64,
    ) -> Result<SnapshotGeneration> {
        self.enter(TransportOp::GetGeneration, array_id)?;
        let state = self.read(array_id)?;
        let mut found = state
            .require_generation(volume_id, snapshot_name, generation)?
            .clone();
        found.expired = found.is_expired_at(Utc::now());
        Ok(found)
    }

    async fn modify_snapshot(
        &self,
        array_id: &str,
        request: ModifySnapshot,
    ) -> Result<Submission<()>> {
        let fault = self.enter(TransportOp::ModifySnapshot, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;
        let name = request.snapshot_name.as_str();

        for source in &request.source_volumes {
            state.require_generation(source, name, request.generation)?;
        }
        let targets = &request.target_volumes;
        let pairs_needed = request.action.requires_targets()
            || (request.action == SnapshotAction::Unlink && !targets.is_empty());
        if pairs_needed && targets.len() != request.source_volumes.len() {
            return Err(Error::InvalidRequest(format!(
                "{} source volumes but {} target volumes",
                request.source_volumes.len(),
                targets.len()
            )));
        }
        if request.action.requires_targets() {
            if let Some(missing) = targets.iter().find(|t| !state.volumes.contains_key(*t)) {
                return Err(Error::not_found(ResourceKind::Volume, missing.as_str()));
            }
        }
        let new_name = match request.action {
            SnapshotAction::Rename => {
                let new_name = request
                    .new_snapshot_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| Error::InvalidRequest("rename requires a new name".into()))?;
                for source in &request.source_volumes {
                    if state.snapshots.contains_key(&(source.clone(), new_name.clone())) {
                        return Err(Error::exists(ResourceKind::Snapshot, new_name));
                    }
                }
                Some(new_name)
            }
            _ => None,
        };
        if request.action == SnapshotAction::SetMode && request.mode.is_none() {
            return Err(Error::InvalidRequest("set mode requires a mode".into()));
        }

        let job_name = format!("{} snapshot {}", request.action, name);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        for (index, source) in request.source_volumes.iter().enumerate() {
            match request.action {
                SnapshotAction::Link | SnapshotAction::Relink => {
                    let target = targets[index].clone();
                    let mut released = Vec::new();
                    if let Some(generation) = state.generation_mut(source, name, request.generation) {
                        released = std::mem::take(&mut generation.linked_targets);
                        generation.link_state = LinkState::Linked;
                        generation.linked_targets = vec![target.clone()];
                        if let Some(mode) = request.mode {
                            generation.mode = mode;
                        }
                    }
                    for old in released {
                        state.set_target_flag(&old, false);
                    }
                    state.set_target_flag(&target, true);
                }
                SnapshotAction::Unlink => {
                    let mut released = Vec::new();
                    if let Some(generation) = state.generation_mut(source, name, request.generation) {
                        released = std::mem::take(&mut generation.linked_targets);
                        generation.link_state = LinkState::Unlinked;
                    }
                    for old in released {
                        state.set_target_flag(&old, false);
                    }
                }
                SnapshotAction::Restore => {}
                SnapshotAction::Rename => {
                    if let Some(new_name) = &new_name {
                        let key = (source.clone(), name.to_string());
                        if let Some(mut gens) = state.snapshots.remove(&key) {
                            for generation in gens.iter_mut() {
                                generation.snapshot_name = new_name.clone();
                            }
                            state.snapshots.insert((source.clone(), new_name.clone()), gens);
                        }
                    }
                }
                SnapshotAction::SetMode => {
                    if let (Some(generation), Some(mode)) = (
                        state.generation_mut(source, name, request.generation),
                        request.mode,
                    ) {
                        generation.mode = mode;
                    }
                }
            }
        }
        Ok(self.submit(state, &job_name, ()))
    }

    async fn delete_snapshot(
        &self,
        array_id: &str,
        request: DeleteSnapshot,
    ) -> Result<Submission<()>> {
        let fault = self.enter(TransportOp::DeleteSnapshot, array_id)?;
        let mut guard = self.write(array_id)?;
        let state = &mut *guard;
        let name = request.snapshot_name.as_str();

        for source in &request.source_volumes {
            let generation = state.require_generation(source, name, request.generation)?;
            if generation.link_state == LinkState::Linked {
                return Err(Error::InvalidRequest(format!(
                    "generation {} of {} on {} is linked",
                    request.generation, name, source
                )));
            }
        }

        let job_name = format!("Terminate snapshot {}", name);
        if let Some(reason) = job_failure(&fault) {
            return Ok(self.reject(state, &job_name, reason));
        }

        for source in &request.source_volumes {
            let key = (source.clone(), name.to_string());
            let emptied = match state.snapshots.get_mut(&key) {
                Some(gens) => {
                    gens.retain(|g| g.generation != request.generation);
                    gens.is_empty()
                }
                None => false,
            };
            if emptied {
                state.snapshots.remove(&key);
            }
            let still_source = state.snapshots.keys().any(|(v, _)| v == source);
            if let Some(volume) = state.volumes.get_mut(source) {
                volume.snapvx_source = still_source;
            }
        }
        Ok(self.submit(state, &job_name, ()))
    }
}
