//! Snapshot Generation Manager
//!
//! Snapshots are named, and each name carries a history of generations per
//! source volume. Generation 0 is the newest; creating a snapshot ages every
//! existing generation by one. Deleting generation `k` removes only `k`, so
//! generation ids are not dense.
//!
//! The manager keeps a ledger of the generation ids it knows per
//! (array, snapshot, source volume). Arguments are validated against it
//! before any mutating call is sent. An entry the ledger holds is
//! authoritative: an unknown generation is rejected without a call. An
//! entry it lacks is hydrated from the array once. `get_generations`
//! replaces an entry with what the array reports.

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::dedupe::{has_repeats, unique_ids};
use crate::controlplane::jobs::JobTracker;
use crate::domain::model::{
    ReplicationCapabilities, SnapshotAction, SnapshotGeneration, VolumeSnapshot,
    MAX_TIME_TO_LIVE_HOURS,
};
use crate::domain::ports::{
    ArrayTransportRef, CreateSnapshot, DeleteSnapshot, ModifySnapshot, SnapVolumeFilter,
};
use crate::error::{Error, ResourceKind, Result};
use futures::future;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// (array, snapshot name, source volume)
type LedgerKey = (String, String, String);

fn key(array_id: &str, snapshot_name: &str, volume_id: &str) -> LedgerKey {
    (
        array_id.to_string(),
        snapshot_name.to_string(),
        volume_id.to_string(),
    )
}

/// Snapshot operations, gated by the allow-list
pub struct SnapshotManager {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    jobs: Arc<JobTracker>,
    /// Known generation ids, newest first
    ledger: RwLock<HashMap<LedgerKey, Vec<u64>>>,
}

impl SnapshotManager {
    pub fn new(
        transport: ArrayTransportRef,
        allow_list: Arc<AllowList>,
        jobs: Arc<JobTracker>,
    ) -> Self {
        Self {
            transport,
            allow_list,
            jobs,
            ledger: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Replication features of every array the allow-list admits
    pub async fn get_replication_capabilities(&self) -> Result<Vec<ReplicationCapabilities>> {
        let capabilities = self.transport.get_replication_capabilities().await?;
        Ok(capabilities
            .into_iter()
            .filter(|c| self.allow_list.is_allowed(&c.symmetrix_id))
            .collect())
    }

    /// Whether the array can take SnapVX snapshots
    pub async fn is_snapshot_capable(&self, array_id: &str) -> Result<bool> {
        self.allow_list.check(array_id)?;
        self.transport
            .get_replication_capabilities()
            .await?
            .into_iter()
            .find(|c| c.symmetrix_id == array_id)
            .map(|c| c.snap_vx_capable)
            .ok_or_else(|| Error::not_found(ResourceKind::Array, array_id))
    }

    /// Source volumes that have at least one snapshot matching the filter
    pub async fn list_snapshot_volumes(
        &self,
        array_id: &str,
        filter: SnapVolumeFilter,
    ) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_snapshot_volumes(array_id, filter).await
    }

    pub async fn get_volume_snapshots(
        &self,
        array_id: &str,
        volume_id: &str,
    ) -> Result<Vec<VolumeSnapshot>> {
        self.allow_list.check(array_id)?;
        self.transport.get_volume_snapshots(array_id, volume_id).await
    }

    pub async fn get_snapshot(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<VolumeSnapshot> {
        self.allow_list.check(array_id)?;
        self.transport
            .get_snapshot(array_id, volume_id, snapshot_name)
            .await
    }

    /// Generation ids of a snapshot on one source volume, newest first.
    /// Replaces the ledger entry, or drops it if the snapshot is gone.
    pub async fn get_generations(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<Vec<u64>> {
        self.allow_list.check(array_id)?;
        let ids = self.refresh(array_id, volume_id, snapshot_name).await?;
        ids.ok_or_else(|| Error::not_found(ResourceKind::Snapshot, snapshot_name))
    }

    pub async fn get_generation_info(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
        generation: u64,
    ) -> Result<SnapshotGeneration> {
        self.allow_list.check(array_id)?;
        self.ensure_generation(array_id, volume_id, snapshot_name, generation)
            .await?;

        match self
            .transport
            .get_generation(array_id, volume_id, snapshot_name, generation)
            .await
        {
            Err(e) if e.is_not_found(ResourceKind::Snapshot) => {
                self.forget_generation(array_id, snapshot_name, volume_id, generation);
                Err(generation_not_found(snapshot_name, volume_id, generation))
            }
            other => other,
        }
    }

    /// Generation ids the ledger currently holds, without asking the array
    pub fn known_generations(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Option<Vec<u64>> {
        self.ledger
            .read()
            .get(&key(array_id, snapshot_name, volume_id))
            .cloned()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Snapshot all source volumes as one unit. The ledger records the new
    /// generation on every source, or on none if the array rejects it.
    pub async fn create_snapshot(
        &self,
        array_id: &str,
        snapshot_name: &str,
        source_volumes: &[&str],
        time_to_live_hours: u32,
    ) -> Result<()> {
        self.allow_list.check(array_id)?;
        if snapshot_name.is_empty() {
            return Err(Error::InvalidArgument("snapshot name must not be empty".into()));
        }
        if time_to_live_hours > MAX_TIME_TO_LIVE_HOURS {
            return Err(Error::InvalidArgument(format!(
                "time to live of {} hours exceeds the {} hour limit",
                time_to_live_hours, MAX_TIME_TO_LIVE_HOURS
            )));
        }
        let sources = unique_ids(source_volumes);
        if sources.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "snapshot {} needs at least one source volume",
                snapshot_name
            )));
        }

        info!(
            array_id = %array_id,
            snapshot = %snapshot_name,
            sources = ?sources,
            ttl_hours = time_to_live_hours,
            "Creating snapshot"
        );

        let request = CreateSnapshot {
            snapshot_name: snapshot_name.to_string(),
            source_volumes: sources.clone(),
            time_to_live_hours,
        };
        let submission = self.transport.create_snapshot(array_id, request).await?;
        self.jobs.settle(array_id, submission).await?;

        let mut ledger = self.ledger.write();
        for source in &sources {
            let ids = ledger
                .entry(key(array_id, snapshot_name, source))
                .or_default();
            for id in ids.iter_mut() {
                *id += 1;
            }
            ids.insert(0, 0);
        }
        Ok(())
    }

    /// Apply an action to one generation on every source volume. Without
    /// targets, repeated sources collapse; paired sources and targets must
    /// each be distinct.
    pub async fn modify_snapshot(
        &self,
        array_id: &str,
        mut request: ModifySnapshot,
    ) -> Result<()> {
        self.allow_list.check(array_id)?;
        if request.target_volumes.is_empty() {
            request.source_volumes = unique_ids(&request.source_volumes);
        }
        validate_modify(&request)?;
        future::try_join_all(request.source_volumes.iter().map(|source| {
            self.ensure_generation(array_id, source, &request.snapshot_name, request.generation)
        }))
        .await?;

        info!(
            array_id = %array_id,
            snapshot = %request.snapshot_name,
            action = %request.action,
            generation = request.generation,
            sources = ?request.source_volumes,
            targets = ?request.target_volumes,
            "Modifying snapshot"
        );

        let action = request.action;
        let snapshot_name = request.snapshot_name.clone();
        let new_name = request.new_snapshot_name.clone();
        let sources = request.source_volumes.clone();

        let submission = self.transport.modify_snapshot(array_id, request).await?;
        self.jobs.settle(array_id, submission).await?;

        if let (SnapshotAction::Rename, Some(new_name)) = (action, new_name) {
            let mut ledger = self.ledger.write();
            for source in &sources {
                if let Some(ids) = ledger.remove(&key(array_id, &snapshot_name, source)) {
                    ledger.insert(key(array_id, &new_name, source), ids);
                }
            }
        }
        Ok(())
    }

    /// Terminate one generation on every source volume. Other generations
    /// keep their ids.
    pub async fn delete_snapshot(
        &self,
        array_id: &str,
        snapshot_name: &str,
        source_volumes: &[&str],
        generation: u64,
    ) -> Result<()> {
        self.allow_list.check(array_id)?;
        let sources = unique_ids(source_volumes);
        if sources.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "deleting {} needs at least one source volume",
                snapshot_name
            )));
        }
        future::try_join_all(
            sources
                .iter()
                .map(|source| self.ensure_generation(array_id, source, snapshot_name, generation)),
        )
        .await?;

        info!(
            array_id = %array_id,
            snapshot = %snapshot_name,
            generation = generation,
            sources = ?sources,
            "Deleting snapshot generation"
        );

        let request = DeleteSnapshot {
            snapshot_name: snapshot_name.to_string(),
            source_volumes: sources.clone(),
            generation,
        };
        let submission = self.transport.delete_snapshot(array_id, request).await?;
        self.jobs.settle(array_id, submission).await?;

        for source in &sources {
            self.forget_generation(array_id, snapshot_name, source, generation);
        }
        Ok(())
    }

    /// Drop everything the ledger knows
    pub fn reset(&self) {
        self.ledger.write().clear();
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// `None` when the ledger has no entry for the snapshot on this volume
    fn lookup(
        &self,
        array_id: &str,
        snapshot_name: &str,
        volume_id: &str,
        generation: u64,
    ) -> Option<bool> {
        self.ledger
            .read()
            .get(&key(array_id, snapshot_name, volume_id))
            .map(|ids| ids.contains(&generation))
    }

    /// Replace the entry with the array's view; `None` if the snapshot is gone
    async fn refresh(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<Option<Vec<u64>>> {
        let ledger_key = key(array_id, snapshot_name, volume_id);
        match self
            .transport
            .list_generations(array_id, volume_id, snapshot_name)
            .await
        {
            Ok(generations) => {
                let ids: Vec<u64> = generations.iter().map(|g| g.generation).collect();
                self.ledger.write().insert(ledger_key, ids.clone());
                Ok(Some(ids))
            }
            Err(e) if e.is_not_found(ResourceKind::Snapshot) => {
                self.ledger.write().remove(&ledger_key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn forget_generation(&self, array_id: &str, snapshot_name: &str, volume_id: &str, generation: u64) {
        let mut ledger = self.ledger.write();
        let ledger_key = key(array_id, snapshot_name, volume_id);
        let emptied = match ledger.get_mut(&ledger_key) {
            Some(ids) => {
                ids.retain(|id| *id != generation);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            ledger.remove(&ledger_key);
        }
    }

    /// Succeed if the generation is known. A held entry is trusted as is;
    /// an absent one is hydrated from the array first.
    async fn ensure_generation(
        &self,
        array_id: &str,
        volume_id: &str,
        snapshot_name: &str,
        generation: u64,
    ) -> Result<()> {
        let known = match self.lookup(array_id, snapshot_name, volume_id, generation) {
            Some(known) => known,
            None => {
                debug!(
                    array_id = %array_id,
                    snapshot = %snapshot_name,
                    volume_id = %volume_id,
                    "Snapshot not in ledger, hydrating"
                );
                self.refresh(array_id, volume_id, snapshot_name)
                    .await?
                    .map_or(false, |ids| ids.contains(&generation))
            }
        };

        if known {
            Ok(())
        } else {
            Err(generation_not_found(snapshot_name, volume_id, generation))
        }
    }
}

fn generation_not_found(snapshot_name: &str, volume_id: &str, generation: u64) -> Error {
    Error::GenerationNotFound {
        snapshot: snapshot_name.to_string(),
        volume_id: volume_id.to_string(),
        generation,
    }
}

/// Shape checks that need no remote state
fn validate_modify(request: &ModifySnapshot) -> Result<()> {
    if request.snapshot_name.is_empty() {
        return Err(Error::InvalidArgument("snapshot name must not be empty".into()));
    }
    if request.source_volumes.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{} of {} needs at least one source volume",
            request.action, request.snapshot_name
        )));
    }

    if !request.target_volumes.is_empty()
        && (has_repeats(&request.source_volumes) || has_repeats(&request.target_volumes))
    {
        return Err(Error::InvalidArgument(format!(
            "{} of {} names a volume twice",
            request.action, request.snapshot_name
        )));
    }

    let sources = request.source_volumes.len();
    let targets = request.target_volumes.len();
    match request.action {
        SnapshotAction::Link | SnapshotAction::Relink if targets == 0 || targets != sources => {
            Err(Error::InvalidArgument(format!(
                "{} needs one target per source: {} sources, {} targets",
                request.action, sources, targets
            )))
        }
        SnapshotAction::Unlink if targets != 0 && targets != sources => {
            Err(Error::InvalidArgument(format!(
                "unlink targets must pair with sources: {} sources, {} targets",
                sources, targets
            )))
        }
        SnapshotAction::Rename
            if request
                .new_snapshot_name
                .as_deref()
                .map_or(true, str::is_empty) =>
        {
            Err(Error::InvalidArgument(format!(
                "renaming {} needs a new name",
                request.snapshot_name
            )))
        }
        SnapshotAction::SetMode if request.mode.is_none() => Err(Error::InvalidArgument(format!(
            "setting the mode of {} needs a mode",
            request.snapshot_name
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{Fault, InMemoryArray, TransportOp};
    use crate::controlplane::jobs::JobPollConfig;
    use crate::domain::model::{LinkMode, LinkState};
    use assert_matches::assert_matches;

    const SYM: &str = "000197900046";
    const SNAP: &str = "snap-1";

    fn seeded() -> (Arc<InMemoryArray>, SnapshotManager) {
        let array = InMemoryArray::with_array(SYM);
        for id in ["v1", "v2", "v3", "v4"] {
            array.add_volume(SYM, id, &format!("Vol-{}", id), 7.0, &[]);
        }
        let allow_list = Arc::new(AllowList::new());
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            allow_list.clone(),
            JobPollConfig {
                max_retries: 5,
                poll_interval_ms: 0,
            },
        ));
        let snapshots = SnapshotManager::new(array.clone(), allow_list, jobs);
        (array, snapshots)
    }

    fn relink(generation: u64, targets: &[&str]) -> ModifySnapshot {
        ModifySnapshot::new(
            vec!["v1".into(), "v2".into()],
            SNAP,
            SnapshotAction::Relink,
            generation,
        )
        .with_targets(targets.iter().map(|t| t.to_string()).collect())
    }

    #[tokio::test]
    async fn test_create_then_relink() {
        let (_, snapshots) = seeded();

        snapshots.create_snapshot(SYM, SNAP, &["v1", "v2"], 24).await.unwrap();
        assert_eq!(snapshots.get_generations(SYM, "v1", SNAP).await.unwrap(), vec![0]);
        assert_eq!(snapshots.get_generations(SYM, "v2", SNAP).await.unwrap(), vec![0]);

        snapshots
            .modify_snapshot(SYM, relink(0, &["v3", "v4"]))
            .await
            .unwrap();

        let info = snapshots.get_generation_info(SYM, "v1", SNAP, 0).await.unwrap();
        assert_eq!(info.link_state, LinkState::Linked);
        assert_eq!(info.linked_targets, vec!["v3".to_string()]);
        assert_eq!(info.time_to_live_hours, 24);
        assert!(!info.expired);

        let info = snapshots.get_generation_info(SYM, "v2", SNAP, 0).await.unwrap();
        assert_eq!(info.linked_targets, vec!["v4".to_string()]);
    }

    #[tokio::test]
    async fn test_new_generation_ages_existing() {
        let (_, snapshots) = seeded();

        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        assert_eq!(snapshots.known_generations(SYM, "v1", SNAP), Some(vec![0, 1]));
        assert_eq!(snapshots.get_generations(SYM, "v1", SNAP).await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_delete_keeps_other_ids() {
        let (array, snapshots) = seeded();
        for _ in 0..3 {
            snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        }

        snapshots.delete_snapshot(SYM, SNAP, &["v1"], 1).await.unwrap();
        assert_eq!(snapshots.get_generations(SYM, "v1", SNAP).await.unwrap(), vec![0, 2]);

        let before = array.call_count(TransportOp::DeleteSnapshot);
        assert_matches!(
            snapshots.delete_snapshot(SYM, SNAP, &["v1"], 1).await,
            Err(Error::GenerationNotFound { generation: 1, .. })
        );
        assert_eq!(array.call_count(TransportOp::DeleteSnapshot), before);

        assert_matches!(
            snapshots.get_generation_info(SYM, "v1", SNAP, 1).await,
            Err(Error::GenerationNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_unknown_generation_rejected_before_modify() {
        let (array, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1", "v2"], 0).await.unwrap();
        array.clear_calls();

        assert_matches!(
            snapshots.modify_snapshot(SYM, relink(5, &["v3", "v4"])).await,
            Err(Error::GenerationNotFound { generation: 5, .. })
        );
        assert_matches!(
            snapshots.delete_snapshot(SYM, SNAP, &["v1", "v2"], 7).await,
            Err(Error::GenerationNotFound { generation: 7, .. })
        );
        assert_matches!(
            snapshots.get_generation_info(SYM, "v1", SNAP, 7).await,
            Err(Error::GenerationNotFound { generation: 7, .. })
        );
        assert_eq!(array.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_refreshed_by_get_generations() {
        let (array, first) = seeded();
        first.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();

        // another client adds a generation behind this ledger's back
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            Arc::new(AllowList::new()),
            JobPollConfig {
                max_retries: 5,
                poll_interval_ms: 0,
            },
        ));
        let second = SnapshotManager::new(array.clone(), Arc::new(AllowList::new()), jobs);
        second.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();

        let restore = || ModifySnapshot::new(vec!["v1".into()], SNAP, SnapshotAction::Restore, 1);
        array.clear_calls();
        assert_matches!(
            first.modify_snapshot(SYM, restore()).await,
            Err(Error::GenerationNotFound { generation: 1, .. })
        );
        assert_eq!(array.total_calls(), 0);

        assert_eq!(first.get_generations(SYM, "v1", SNAP).await.unwrap(), vec![0, 1]);
        first.modify_snapshot(SYM, restore()).await.unwrap();
    }

    #[tokio::test]
    async fn test_vanished_snapshot_clears_entry() {
        let (array, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        array.fail_next(TransportOp::ListGenerations, Fault::NotFound);

        let err = snapshots.get_generations(SYM, "v1", SNAP).await.unwrap_err();
        assert!(err.is_not_found(ResourceKind::Snapshot));
        assert!(snapshots.known_generations(SYM, "v1", SNAP).is_none());
    }

    #[tokio::test]
    async fn test_time_to_live_bounded() {
        let (array, snapshots) = seeded();

        assert_matches!(
            snapshots.create_snapshot(SYM, SNAP, &["v1"], u32::MAX).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(array.total_calls(), 0);

        snapshots
            .create_snapshot(SYM, SNAP, &["v1"], MAX_TIME_TO_LIVE_HOURS)
            .await
            .unwrap();
        let info = snapshots.get_generation_info(SYM, "v1", SNAP, 0).await.unwrap();
        assert!(!info.expired);
    }

    #[tokio::test]
    async fn test_repeated_volumes() {
        let (array, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1", "v2"], 0).await.unwrap();
        array.clear_calls();

        let link = |sources: &[&str], targets: &[&str]| {
            ModifySnapshot::new(
                sources.iter().map(|s| s.to_string()).collect(),
                SNAP,
                SnapshotAction::Link,
                0,
            )
            .with_targets(targets.iter().map(|t| t.to_string()).collect())
        };
        assert_matches!(
            snapshots.modify_snapshot(SYM, link(&["v1", "v1"], &["v3", "v4"])).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            snapshots.modify_snapshot(SYM, link(&["v1", "v2"], &["v3", "v3"])).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(array.total_calls(), 0);

        // without targets the repeat collapses
        snapshots
            .modify_snapshot(
                SYM,
                ModifySnapshot::new(
                    vec!["v1".into(), "v1".into()],
                    SNAP,
                    SnapshotAction::Restore,
                    0,
                ),
            )
            .await
            .unwrap();
        assert_eq!(array.call_count(TransportOp::ModifySnapshot), 1);
    }

    #[tokio::test]
    async fn test_replication_capabilities() {
        let (array, snapshots) = seeded();
        array.add_array("000197900047");
        array.set_replication_capabilities("000197900047", false, true);

        assert!(snapshots.is_snapshot_capable(SYM).await.unwrap());
        assert!(!snapshots.is_snapshot_capable("000197900047").await.unwrap());
        assert!(snapshots
            .is_snapshot_capable("000000000000")
            .await
            .unwrap_err()
            .is_not_found(ResourceKind::Array));

        snapshots.allow_list.set_allowed([SYM]);
        let capabilities = snapshots.get_replication_capabilities().await.unwrap();
        assert_eq!(capabilities.len(), 1);
        assert_eq!(capabilities[0].symmetrix_id, SYM);
        assert_matches!(
            snapshots.is_snapshot_capable("000197900047").await,
            Err(Error::UnauthorizedArray { .. })
        );
    }

    #[tokio::test]
    async fn test_ledger_hydrates_from_array() {
        let (array, first) = seeded();
        first.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();

        // a second client sharing the array has an empty ledger
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            Arc::new(AllowList::new()),
            JobPollConfig {
                max_retries: 5,
                poll_interval_ms: 0,
            },
        ));
        let second = SnapshotManager::new(array.clone(), Arc::new(AllowList::new()), jobs);
        assert!(second.known_generations(SYM, "v1", SNAP).is_none());

        second
            .modify_snapshot(
                SYM,
                ModifySnapshot::new(vec!["v1".into()], SNAP, SnapshotAction::Restore, 0),
            )
            .await
            .unwrap();
        assert_eq!(second.known_generations(SYM, "v1", SNAP), Some(vec![0]));
    }

    #[tokio::test]
    async fn test_cardinality_checked_locally() {
        let (array, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1", "v2"], 0).await.unwrap();
        array.clear_calls();

        assert_matches!(
            snapshots.modify_snapshot(SYM, relink(0, &["v3"])).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            snapshots.modify_snapshot(SYM, relink(0, &[])).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            snapshots
                .modify_snapshot(
                    SYM,
                    ModifySnapshot::new(vec!["v1".into()], SNAP, SnapshotAction::Rename, 0)
                )
                .await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            snapshots
                .modify_snapshot(
                    SYM,
                    ModifySnapshot::new(vec!["v1".into()], SNAP, SnapshotAction::SetMode, 0)
                )
                .await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(array.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_create_records_nothing() {
        let (array, snapshots) = seeded();
        array.fail_next(TransportOp::CreateSnapshot, Fault::JobFails("source busy".into()));

        assert_matches!(
            snapshots.create_snapshot(SYM, SNAP, &["v1", "v2"], 0).await,
            Err(Error::JobFailed { .. })
        );
        assert!(snapshots.known_generations(SYM, "v1", SNAP).is_none());
        assert!(snapshots.known_generations(SYM, "v2", SNAP).is_none());
        assert!(snapshots
            .list_snapshot_volumes(SYM, SnapVolumeFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_generations() {
        let (_, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();

        snapshots
            .modify_snapshot(
                SYM,
                ModifySnapshot::new(vec!["v1".into()], SNAP, SnapshotAction::Rename, 0)
                    .with_new_name("snap-2"),
            )
            .await
            .unwrap();

        assert_eq!(snapshots.known_generations(SYM, "v1", "snap-2"), Some(vec![0, 1]));
        assert!(snapshots.known_generations(SYM, "v1", SNAP).is_none());
        assert_eq!(snapshots.get_generations(SYM, "v1", "snap-2").await.unwrap(), vec![0, 1]);
        assert!(snapshots.get_generations(SYM, "v1", SNAP).await.is_err());
    }

    #[tokio::test]
    async fn test_set_mode_and_unlink() {
        let (_, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1", "v2"], 0).await.unwrap();
        snapshots
            .modify_snapshot(SYM, relink(0, &["v3", "v4"]))
            .await
            .unwrap();

        snapshots
            .modify_snapshot(
                SYM,
                ModifySnapshot::new(vec!["v1".into()], SNAP, SnapshotAction::SetMode, 0)
                    .with_mode(LinkMode::Copy),
            )
            .await
            .unwrap();
        let info = snapshots.get_generation_info(SYM, "v1", SNAP, 0).await.unwrap();
        assert_eq!(info.mode, LinkMode::Copy);

        snapshots
            .modify_snapshot(
                SYM,
                ModifySnapshot::new(
                    vec!["v1".into(), "v2".into()],
                    SNAP,
                    SnapshotAction::Unlink,
                    0,
                ),
            )
            .await
            .unwrap();
        let info = snapshots.get_generation_info(SYM, "v2", SNAP, 0).await.unwrap();
        assert_eq!(info.link_state, LinkState::Unlinked);
        assert!(info.linked_targets.is_empty());
    }

    #[tokio::test]
    async fn test_volume_summaries() {
        let (_, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        snapshots.create_snapshot(SYM, "snap-other", &["v1"], 0).await.unwrap();

        let all = snapshots
            .list_snapshot_volumes(SYM, SnapVolumeFilter::default())
            .await
            .unwrap();
        assert_eq!(all, vec!["v1".to_string()]);
        let other = SnapVolumeFilter {
            snapshot_name: Some("snap-missing".into()),
            ..Default::default()
        };
        assert!(snapshots.list_snapshot_volumes(SYM, other).await.unwrap().is_empty());
        let summaries = snapshots.get_volume_snapshots(SYM, "v1").await.unwrap();
        assert_eq!(summaries.len(), 2);

        let summary = snapshots.get_snapshot(SYM, "v1", SNAP).await.unwrap();
        assert_eq!(summary.generation_count, 1);
        assert!(!summary.linked);
    }

    #[tokio::test]
    async fn test_reset_clears_ledger() {
        let (_, snapshots) = seeded();
        snapshots.create_snapshot(SYM, SNAP, &["v1"], 0).await.unwrap();
        snapshots.reset();
        assert!(snapshots.known_generations(SYM, "v1", SNAP).is_none());
    }
}
