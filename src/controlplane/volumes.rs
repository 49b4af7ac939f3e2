//! Volume Lifecycle
//!
//! Create, rename, expand, deallocate and delete individual volumes.
//! Shrinking is never sent to the array, and a volume can only be deleted
//! once it has left every storage group.

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::jobs::JobTracker;
use crate::domain::model::{Job, PrivateVolume, Volume};
use crate::domain::ports::{ArrayTransportRef, Submission, VolumeUpdate};
use crate::error::{Error, ResourceKind, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Volume operations, gated by the allow-list
pub struct VolumeManager {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    jobs: Arc<JobTracker>,
}

impl VolumeManager {
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

    /// Create a volume directly inside a storage group and return it once
    /// the array has finished creating it
    pub async fn create_in_storage_group(
        &self,
        array_id: &str,
        storage_group_id: &str,
        name: &str,
        size_cylinders: u64,
    ) -> Result<Volume> {
        self.allow_list.check(array_id)?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("volume name must not be empty".into()));
        }
        if size_cylinders == 0 {
            return Err(Error::InvalidArgument(format!(
                "volume {} must have a positive size",
                name
            )));
        }

        info!(
            array_id = %array_id,
            storage_group = %storage_group_id,
            name = %name,
            cylinders = size_cylinders,
            "Creating volume"
        );

        let submission = self
            .transport
            .create_volume(array_id, storage_group_id, name, size_cylinders)
            .await?;

        match self.jobs.settle(array_id, submission).await? {
            Some(volume) => Ok(volume),
            None => self.find_by_name(array_id, name).await,
        }
    }

    /// Resolve a volume by exact identifier
    async fn find_by_name(&self, array_id: &str, name: &str) -> Result<Volume> {
        let ids = self.transport.list_volume_ids(array_id, name, false).await?;
        match ids.as_slice() {
            [id] => self.transport.get_volume(array_id, id).await,
            [] => Err(Error::not_found(ResourceKind::Volume, name)),
            many => Err(Error::InvalidResponse(format!(
                "{} volumes named {}",
                many.len(),
                name
            ))),
        }
    }

    pub async fn get(&self, array_id: &str, volume_id: &str) -> Result<Volume> {
        self.allow_list.check(array_id)?;
        debug!(array_id = %array_id, volume_id = %volume_id, "Getting volume");
        self.transport.get_volume(array_id, volume_id).await
    }

    /// Volume with its WWN and the snapshot sessions it takes part in
    pub async fn get_private(&self, array_id: &str, volume_id: &str) -> Result<PrivateVolume> {
        self.allow_list.check(array_id)?;
        self.transport.get_private_volume(array_id, volume_id).await
    }

    /// List volume ids by identifier; `like` matches substrings
    pub async fn list_ids(&self, array_id: &str, identifier: &str, like: bool) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_volume_ids(array_id, identifier, like).await
    }

    pub async fn rename(&self, array_id: &str, volume_id: &str, new_name: &str) -> Result<Volume> {
        self.allow_list.check(array_id)?;
        if new_name.is_empty() {
            return Err(Error::InvalidArgument("new volume name must not be empty".into()));
        }

        info!(array_id = %array_id, volume_id = %volume_id, new_name = %new_name, "Renaming volume");
        self.update(array_id, volume_id, VolumeUpdate::Rename(new_name.to_string()))
            .await
    }

    /// Grow a volume. Zero or a size below the current capacity is rejected
    /// without sending the update.
    pub async fn expand(&self, array_id: &str, volume_id: &str, new_size_gb: u64) -> Result<Volume> {
        self.allow_list.check(array_id)?;

        if new_size_gb == 0 {
            return Err(Error::InvalidSize {
                volume_id: volume_id.to_string(),
                requested_gb: new_size_gb,
                current_gb: 0.0,
            });
        }

        let current = self.transport.get_volume(array_id, volume_id).await?;
        if (new_size_gb as f64) < current.capacity_gb {
            warn!(
                array_id = %array_id,
                volume_id = %volume_id,
                requested_gb = new_size_gb,
                current_gb = current.capacity_gb,
                "Refusing to shrink volume"
            );
            return Err(Error::InvalidSize {
                volume_id: volume_id.to_string(),
                requested_gb: new_size_gb,
                current_gb: current.capacity_gb,
            });
        }

        info!(array_id = %array_id, volume_id = %volume_id, size_gb = new_size_gb, "Expanding volume");
        self.update(array_id, volume_id, VolumeUpdate::Expand { size_gb: new_size_gb })
            .await
    }

    /// Start freeing the volume's allocated tracks. Returns the job without
    /// waiting on it.
    pub async fn initiate_deallocation(&self, array_id: &str, volume_id: &str) -> Result<Job> {
        self.allow_list.check(array_id)?;
        info!(array_id = %array_id, volume_id = %volume_id, "Deallocating volume tracks");

        match self
            .transport
            .update_volume(array_id, volume_id, VolumeUpdate::Deallocate)
            .await?
        {
            Submission::Job(job) => Ok(job),
            Submission::Complete(_) => Err(Error::InvalidResponse(format!(
                "deallocation of {} returned no job",
                volume_id
            ))),
        }
    }

    /// Delete a volume that belongs to no storage group
    pub async fn delete(&self, array_id: &str, volume_id: &str) -> Result<()> {
        self.allow_list.check(array_id)?;

        let volume = self.transport.get_volume(array_id, volume_id).await?;
        if volume.in_any_storage_group() {
            warn!(
                array_id = %array_id,
                volume_id = %volume_id,
                groups = ?volume.storage_group_ids,
                "Volume still in storage groups"
            );
            return Err(Error::DeviceInUse {
                volume_id: volume_id.to_string(),
                storage_groups: volume.storage_group_ids,
            });
        }

        info!(array_id = %array_id, volume_id = %volume_id, "Deleting volume");
        self.transport.delete_volume(array_id, volume_id).await
    }

    async fn update(&self, array_id: &str, volume_id: &str, update: VolumeUpdate) -> Result<Volume> {
        let submission = self.transport.update_volume(array_id, volume_id, update).await?;
        match self.jobs.settle(array_id, submission).await? {
            Some(volume) => Ok(volume),
            None => self.transport.get_volume(array_id, volume_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{Fault, InMemoryArray, TransportOp};
    use crate::controlplane::jobs::JobPollConfig;
    use crate::domain::model::JobStatus;
    use assert_matches::assert_matches;

    const SYM: &str = "000197900046";

    fn manager(array: Arc<InMemoryArray>) -> VolumeManager {
        let allow_list = Arc::new(AllowList::new());
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            allow_list.clone(),
            JobPollConfig {
                max_retries: 5,
                poll_interval_ms: 0,
            },
        ));
        VolumeManager::new(array, allow_list, jobs)
    }

    #[tokio::test]
    async fn test_create_in_storage_group() {
        let array = InMemoryArray::with_array(SYM);
        array.add_storage_group(SYM, "sg-1", "SRP_1", "Diamond");
        let volumes = manager(array.clone());

        let volume = volumes
            .create_in_storage_group(SYM, "sg-1", "Vol00099", 547)
            .await
            .unwrap();
        assert_eq!(volume.identifier, "Vol00099");
        assert_eq!(volume.storage_group_ids, vec!["sg-1".to_string()]);
        // job submission was polled
        assert!(array.call_count(TransportOp::GetJob) >= 1);
    }

    #[tokio::test]
    async fn test_create_job_failure_records_nothing() {
        let array = InMemoryArray::with_array(SYM);
        array.add_storage_group(SYM, "sg-1", "SRP_1", "Diamond");
        array.fail_next(TransportOp::CreateVolume, Fault::JobFails("no capacity".into()));
        let volumes = manager(array.clone());

        let err = volumes
            .create_in_storage_group(SYM, "sg-1", "Vol00099", 547)
            .await
            .unwrap_err();
        assert_matches!(err, Error::JobFailed { result: Some(msg), .. } if msg == "no capacity");
        assert!(volumes.list_ids(SYM, "Vol00099", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_args_locally() {
        let array = InMemoryArray::with_array(SYM);
        let volumes = manager(array.clone());

        assert_matches!(
            volumes.create_in_storage_group(SYM, "sg-1", "", 10).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            volumes.create_in_storage_group(SYM, "sg-1", "v", 0).await,
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(array.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_list_ids_like() {
        let array = InMemoryArray::with_array(SYM);
        array.add_volume(SYM, "00001", "Vol00001", 7.0, &[]);
        array.add_volume(SYM, "00002", "Vol00002", 7.0, &[]);
        array.add_volume(SYM, "00003", "Other", 7.0, &[]);
        let volumes = manager(array);

        assert_eq!(volumes.list_ids(SYM, "Vol", true).await.unwrap().len(), 2);
        assert_eq!(volumes.list_ids(SYM, "Vol00001", false).await.unwrap(), vec!["00001".to_string()]);
        assert_eq!(volumes.list_ids(SYM, "", false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_expand() {
        let array = InMemoryArray::with_array(SYM);
        array.add_volume(SYM, "00001", "Vol00001", 7.0, &[]);
        let volumes = manager(array.clone());

        let volume = volumes.expand(SYM, "00001", 10).await.unwrap();
        assert_eq!(volume.capacity_gb, 10.0);
        assert_eq!(volumes.get(SYM, "00001").await.unwrap().capacity_gb, 10.0);
    }

    #[tokio::test]
    async fn test_expand_rejects_zero_and_shrink() {
        let array = InMemoryArray::with_array(SYM);
        array.add_volume(SYM, "00001", "Vol00001", 7.0, &[]);
        let volumes = manager(array.clone());

        assert_matches!(volumes.expand(SYM, "00001", 0).await, Err(Error::InvalidSize { .. }));
        assert_matches!(
            volumes.expand(SYM, "00001", 5).await,
            Err(Error::InvalidSize { requested_gb: 5, .. })
        );
        assert_eq!(array.call_count(TransportOp::UpdateVolume), 0);
    }

    #[tokio::test]
    async fn test_rename() {
        let array = InMemoryArray::with_array(SYM);
        array.add_volume(SYM, "00001", "Vol00001", 7.0, &[]);
        let volumes = manager(array);

        let volume = volumes.rename(SYM, "00001", "renamed").await.unwrap();
        assert_eq!(volume.identifier, "renamed");
        assert!(volumes.rename(SYM, "00001", "").await.is_err());
    }

    #[tokio::test]
    async fn test_deallocation_returns_job() {
        let array = InMemoryArray::with_array(SYM);
        array.add_volume(SYM, "00001", "Vol00001", 7.0, &[]);
        let volumes = manager(array);

        let job = volumes.initiate_deallocation(SYM, "00001").await.unwrap();
        assert!(!job.job_id.is_empty());
        assert_ne!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_delete_requires_no_memberships() {
        let array = InMemoryArray::with_array(SYM);
        array.add_storage_group(SYM, "sg-1", "SRP_1", "Diamond");
        array.add_volume(SYM, "00001", "Vol00001", 7.0, &["sg-1"]);
        array.add_volume(SYM, "00002", "Vol00002", 7.0, &[]);
        let volumes = manager(array.clone());

        assert_matches!(
            volumes.delete(SYM, "00001").await,
            Err(Error::DeviceInUse { storage_groups, .. }) if storage_groups == vec!["sg-1".to_string()]
        );
        assert_eq!(array.call_count(TransportOp::DeleteVolume), 0);

        volumes.delete(SYM, "00002").await.unwrap();
        assert!(volumes.get(SYM, "00002").await.unwrap_err().is_not_found(ResourceKind::Volume));
    }

    #[tokio::test]
    async fn test_get_private() {
        let array = InMemoryArray::with_array(SYM);
        array.add_volume(SYM, "00001", "Vol00001", 1.0, &[]);
        let volumes = manager(array.clone());

        let private = volumes.get_private(SYM, "00001").await.unwrap();
        assert_eq!(private.volume_id, "00001");
        assert!(private.wwn.starts_with("60000970"));
        assert!(private.source_sessions.is_empty() && private.target_sessions.is_empty());

        assert!(volumes
            .get_private(SYM, "00009")
            .await
            .unwrap_err()
            .is_not_found(ResourceKind::Volume));
    }
}
