//! Storage-Group Membership Lifecycle
//!
//! Storage group CRUD and set-semantics membership changes. Adding a member
//! twice or removing a non-member is a no-op, never an error.

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::dedupe::unique_ids;
use crate::controlplane::jobs::JobTracker;
use crate::domain::model::{StorageGroup, StoragePool};
use crate::domain::ports::{ArrayTransportRef, MembershipChange};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Storage group and pool operations, gated by the allow-list
pub struct StorageGroupManager {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    jobs: Arc<JobTracker>,
}

impl StorageGroupManager {
    pub fn new(
        transport: ArrayTransportRef,
        allow_list: Arc<AllowList>,
        jobs: Arc<JobTracker>,
    ) -> Self {
        Self {
            transport,
            allow_list,
            jobs,
        }
    }

    pub async fn list(&self, array_id: &str) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_storage_groups(array_id).await
    }

    pub async fn get(&self, array_id: &str, storage_group_id: &str) -> Result<StorageGroup> {
        self.allow_list.check(array_id)?;
        debug!(array_id = %array_id, storage_group = %storage_group_id, "Getting storage group");
        self.transport.get_storage_group(array_id, storage_group_id).await
    }

    /// Create an empty storage group in a pool at a service level
    pub async fn create(
        &self,
        array_id: &str,
        storage_group_id: &str,
        srp_id: &str,
        service_level: &str,
    ) -> Result<StorageGroup> {
        self.allow_list.check(array_id)?;
        if storage_group_id.is_empty() {
            return Err(Error::InvalidArgument(
                "storage group id must not be empty".into(),
            ));
        }

        info!(
            array_id = %array_id,
            storage_group = %storage_group_id,
            srp = %srp_id,
            service_level = %service_level,
            "Creating storage group"
        );

        let submission = self
            .transport
            .create_storage_group(array_id, storage_group_id, srp_id, service_level)
            .await?;
        match self.jobs.settle(array_id, submission).await? {
            Some(group) => Ok(group),
            None => self.transport.get_storage_group(array_id, storage_group_id).await,
        }
    }

    pub async fn delete(&self, array_id: &str, storage_group_id: &str) -> Result<()> {
        self.allow_list.check(array_id)?;
        info!(array_id = %array_id, storage_group = %storage_group_id, "Deleting storage group");
        self.transport.delete_storage_group(array_id, storage_group_id).await
    }

    /// Add volumes to the group (set union)
    pub async fn add_volumes(
        &self,
        array_id: &str,
        storage_group_id: &str,
        volume_ids: &[&str],
    ) -> Result<StorageGroup> {
        self.allow_list.check(array_id)?;
        let ids = unique_ids(volume_ids);
        if ids.is_empty() {
            return self.transport.get_storage_group(array_id, storage_group_id).await;
        }

        info!(
            array_id = %array_id,
            storage_group = %storage_group_id,
            volumes = ?ids,
            "Adding volumes to storage group"
        );
        self.apply(array_id, storage_group_id, MembershipChange::Add(ids))
            .await
    }

    /// Remove volumes from the group (set difference); non-members are ignored
    pub async fn remove_volumes(
        &self,
        array_id: &str,
        storage_group_id: &str,
        volume_ids: &[&str],
    ) -> Result<StorageGroup> {
        self.allow_list.check(array_id)?;
        let ids = unique_ids(volume_ids);
        if ids.is_empty() {
            return self.transport.get_storage_group(array_id, storage_group_id).await;
        }

        info!(
            array_id = %array_id,
            storage_group = %storage_group_id,
            volumes = ?ids,
            "Removing volumes from storage group"
        );
        self.apply(array_id, storage_group_id, MembershipChange::Remove(ids))
            .await
    }

    pub async fn list_pools(&self, array_id: &str) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_storage_pools(array_id).await
    }

    pub async fn get_pool(&self, array_id: &str, pool_id: &str) -> Result<StoragePool> {
        self.allow_list.check(array_id)?;
        self.transport.get_storage_pool(array_id, pool_id).await
    }

    async fn apply(
        &self,
        array_id: &str,
        storage_group_id: &str,
        change: MembershipChange,
    ) -> Result<StorageGroup> {
        let submission = self
            .transport
            .update_storage_group(array_id, storage_group_id, change)
            .await?;
        match self.jobs.settle(array_id, submission).await? {
            Some(group) => Ok(group),
            None => self.transport.get_storage_group(array_id, storage_group_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{Fault, InMemoryArray, TransportOp};
    use crate::controlplane::jobs::JobPollConfig;
    use crate::error::ResourceKind;
    use assert_matches::assert_matches;

    const SYM: &str = "000197900046";

    fn manager(array: Arc<InMemoryArray>) -> StorageGroupManager {
        let allow_list = Arc::new(AllowList::new());
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            allow_list.clone(),
            JobPollConfig {
                max_retries: 5,
                poll_interval_ms: 0,
            },
        ));
        StorageGroupManager::new(array, allow_list, jobs)
    }

    fn members(group: &StorageGroup) -> Vec<&str> {
        group.volume_ids.iter().map(String::as_str).collect()
    }

    fn seeded() -> Arc<InMemoryArray> {
        let array = InMemoryArray::with_array(SYM);
        array.add_storage_group(SYM, "G", "SRP_1", "Diamond");
        for id in ["v1", "v2", "v3"] {
            array.add_volume(SYM, id, &format!("Vol-{}", id), 7.0, &[]);
        }
        array
    }

    #[tokio::test]
    async fn test_add_then_remove_one() {
        let groups = manager(seeded());

        let group = groups.add_volumes(SYM, "G", &["v1", "v2", "v3"]).await.unwrap();
        assert_eq!(members(&group), vec!["v1", "v2", "v3"]);

        let group = groups.remove_volumes(SYM, "G", &["v2"]).await.unwrap();
        assert_eq!(members(&group), vec!["v1", "v3"]);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let groups = manager(seeded());

        let once = groups.add_volumes(SYM, "G", &["v1"]).await.unwrap();
        let twice = groups.add_volumes(SYM, "G", &["v1", "v1"]).await.unwrap();
        assert_eq!(once.volume_ids, twice.volume_ids);
        assert_eq!(twice.num_volumes(), 1);
    }

    #[tokio::test]
    async fn test_remove_then_add_restores() {
        let groups = manager(seeded());
        let before = groups.add_volumes(SYM, "G", &["v1", "v2"]).await.unwrap();

        groups.remove_volumes(SYM, "G", &["v1"]).await.unwrap();
        let after = groups.add_volumes(SYM, "G", &["v1"]).await.unwrap();
        assert_eq!(before.volume_ids, after.volume_ids);
    }

    #[tokio::test]
    async fn test_remove_non_member_tolerated() {
        let groups = manager(seeded());
        groups.add_volumes(SYM, "G", &["v1"]).await.unwrap();

        let group = groups.remove_volumes(SYM, "G", &["v3"]).await.unwrap();
        assert_eq!(members(&group), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_empty_change_skips_update() {
        let array = seeded();
        let groups = manager(array.clone());

        groups.add_volumes(SYM, "G", &[]).await.unwrap();
        groups.remove_volumes(SYM, "G", &[""]).await.unwrap();
        assert_eq!(array.call_count(TransportOp::UpdateStorageGroup), 0);
    }

    #[tokio::test]
    async fn test_membership_reflected_on_volume() {
        let array = seeded();
        let groups = manager(array.clone());
        groups.add_volumes(SYM, "G", &["v1"]).await.unwrap();

        use crate::domain::ports::ArrayTransport;
        let volume = array.get_volume(SYM, "v1").await.unwrap();
        assert_eq!(volume.storage_group_ids, vec!["G".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_membership() {
        let array = seeded();
        let groups = manager(array.clone());
        groups.add_volumes(SYM, "G", &["v1"]).await.unwrap();

        array.fail_next(TransportOp::UpdateStorageGroup, Fault::JobFails("locked".into()));
        assert_matches!(
            groups.add_volumes(SYM, "G", &["v2"]).await,
            Err(Error::JobFailed { .. })
        );
        assert_eq!(members(&groups.get(SYM, "G").await.unwrap()), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let array = InMemoryArray::with_array(SYM);
        let groups = manager(array);

        let group = groups.create(SYM, "new-sg", "SRP_1", "Diamond").await.unwrap();
        assert_eq!(group.storage_group_id, "new-sg");
        assert_eq!(group.service_level.as_deref(), Some("Diamond"));
        assert!(group.volume_ids.is_empty());

        assert_matches!(
            groups.create(SYM, "new-sg", "SRP_1", "Diamond").await,
            Err(Error::ResourceExists { kind: ResourceKind::StorageGroup, .. })
        );

        groups.delete(SYM, "new-sg").await.unwrap();
        assert!(groups.list(SYM).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pools() {
        let array = InMemoryArray::with_array(SYM);
        let groups = manager(array);

        let pools = groups.list_pools(SYM).await.unwrap();
        assert_eq!(pools[0], "SRP_1");
        let pool = groups.get_pool(SYM, "SRP_1").await.unwrap();
        assert_eq!(pool.storage_pool_id, "SRP_1");
    }
}
