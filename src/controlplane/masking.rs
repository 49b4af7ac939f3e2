//! Masking View Orchestrator
//!
//! A masking view binds exactly one initiator group (a host or a host group)
//! to a storage group through a port group. Exclusivity of host and host
//! group is checked here; existence of the referenced resources is left to
//! the array.

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::jobs::JobTracker;
use crate::domain::model::{InitiatorGroupRef, MaskingView};
use crate::domain::ports::{ArrayTransportRef, MaskingViewSpec};
use crate::error::{Error, ResourceKind, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Masking view operations, gated by the allow-list
pub struct MaskingViewManager {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    jobs: Arc<JobTracker>,
}

impl MaskingViewManager {
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
        self.transport.list_masking_views(array_id).await
    }

    pub async fn get(&self, array_id: &str, masking_view_id: &str) -> Result<MaskingView> {
        self.allow_list.check(array_id)?;
        debug!(array_id = %array_id, masking_view = %masking_view_id, "Getting masking view");
        self.transport
            .get_masking_view(array_id, masking_view_id)
            .await
            .map_err(refine)
    }

    /// Create a masking view and return it with its bindings resolved
    pub async fn create(
        &self,
        array_id: &str,
        masking_view_id: &str,
        storage_group_id: &str,
        initiator_group: InitiatorGroupRef,
        port_group_id: &str,
    ) -> Result<MaskingView> {
        self.allow_list.check(array_id)?;
        if masking_view_id.is_empty() {
            return Err(Error::InvalidArgument(
                "masking view id must not be empty".into(),
            ));
        }

        info!(
            array_id = %array_id,
            masking_view = %masking_view_id,
            storage_group = %storage_group_id,
            initiator_group = %initiator_group,
            port_group = %port_group_id,
            "Creating masking view"
        );

        let spec = MaskingViewSpec {
            masking_view_id: masking_view_id.to_string(),
            storage_group_id: storage_group_id.to_string(),
            initiator_group,
            port_group_id: port_group_id.to_string(),
        };
        let submission = self
            .transport
            .create_masking_view(array_id, spec)
            .await
            .map_err(refine)?;

        match self.jobs.settle(array_id, submission).await? {
            Some(view) => Ok(view),
            None => self
                .transport
                .get_masking_view(array_id, masking_view_id)
                .await
                .map_err(refine),
        }
    }

    /// Create from a single id and a host / host-group flag
    pub async fn create_with_flag(
        &self,
        array_id: &str,
        masking_view_id: &str,
        storage_group_id: &str,
        host_or_host_group_id: &str,
        is_host: bool,
        port_group_id: &str,
    ) -> Result<MaskingView> {
        self.allow_list.check(array_id)?;
        let initiator_group = InitiatorGroupRef::from_flag(host_or_host_group_id, is_host)?;
        self.create(
            array_id,
            masking_view_id,
            storage_group_id,
            initiator_group,
            port_group_id,
        )
        .await
    }

    /// Delete a masking view. A missing view is an error, not a no-op.
    pub async fn delete(&self, array_id: &str, masking_view_id: &str) -> Result<()> {
        self.allow_list.check(array_id)?;
        info!(array_id = %array_id, masking_view = %masking_view_id, "Deleting masking view");
        self.transport
            .delete_masking_view(array_id, masking_view_id)
            .await
            .map_err(refine)
    }
}

/// Narrow generic not-found / exists errors about the view itself
fn refine(err: Error) -> Error {
    match err {
        Error::ResourceNotFound {
            kind: ResourceKind::MaskingView,
            id,
        } => Error::MaskingViewNotFound { id },
        Error::ResourceExists {
            kind: ResourceKind::MaskingView,
            id,
        } => Error::MaskingViewAlreadyExists { id },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{Fault, InMemoryArray, TransportOp};
    use crate::controlplane::jobs::JobPollConfig;
    use crate::domain::model::PortKey;
    use assert_matches::assert_matches;

    const SYM: &str = "000197900046";

    fn manager(array: Arc<InMemoryArray>) -> MaskingViewManager {
        let allow_list = Arc::new(AllowList::new());
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            allow_list.clone(),
            JobPollConfig {
                max_retries: 5,
                poll_interval_ms: 0,
            },
        ));
        MaskingViewManager::new(array, allow_list, jobs)
    }

    fn seeded() -> Arc<InMemoryArray> {
        let array = InMemoryArray::with_array(SYM);
        array.add_storage_group(SYM, "sg-1", "SRP_1", "Diamond");
        array.add_port_group(SYM, "pg-1", vec![PortKey::new("SE-1E", "000")]);
        array.add_initiator(SYM, "iqn.1993-08.org.debian:01:5ae293b352a2", "GigE", "SE-1E:000");
        array.add_host(SYM, "host-1", &["iqn.1993-08.org.debian:01:5ae293b352a2"]);
        array.add_host_group(SYM, "hg-1", &["host-1"]);
        array
    }

    #[tokio::test]
    async fn test_create_with_host() {
        let array = seeded();
        let views = manager(array.clone());

        let view = views
            .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::Host("host-1".into()), "pg-1")
            .await
            .unwrap();
        assert_eq!(view.host_id(), "host-1");
        assert!(!view.is_host_group());
        assert_eq!(view.storage_group_id, "sg-1");
        assert_eq!(view.port_group_id, "pg-1");
        assert_eq!(views.list(SYM).await.unwrap(), vec!["mv-1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_with_host_group_flag() {
        let views = manager(seeded());

        let view = views
            .create_with_flag(SYM, "mv-2", "sg-1", "hg-1", false, "pg-1")
            .await
            .unwrap();
        assert!(view.is_host_group());
        assert_eq!(view.host_id(), "hg-1");
    }

    #[tokio::test]
    async fn test_exclusivity_checked_before_any_call() {
        let array = seeded();
        let views = manager(array.clone());

        let both = InitiatorGroupRef::from_parts(Some("host-1"), Some("hg-1"));
        assert_matches!(both, Err(Error::InitiatorGroupConflict(_)));
        let neither = InitiatorGroupRef::from_parts(None, None);
        assert_matches!(neither, Err(Error::InitiatorGroupConflict(_)));

        assert_matches!(
            views.create_with_flag(SYM, "mv-3", "sg-1", "", true, "pg-1").await,
            Err(Error::InitiatorGroupConflict(_))
        );
        assert_eq!(array.call_count(TransportOp::CreateMaskingView), 0);
    }

    #[tokio::test]
    async fn test_duplicate_is_refined() {
        let views = manager(seeded());
        views
            .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::Host("host-1".into()), "pg-1")
            .await
            .unwrap();

        assert_matches!(
            views
                .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::Host("host-1".into()), "pg-1")
                .await,
            Err(Error::MaskingViewAlreadyExists { id }) if id == "mv-1"
        );
    }

    #[tokio::test]
    async fn test_missing_dependencies_propagate() {
        let views = manager(seeded());

        assert_matches!(
            views
                .create(SYM, "mv-1", "nope", InitiatorGroupRef::Host("host-1".into()), "pg-1")
                .await,
            Err(Error::ResourceNotFound { kind: ResourceKind::StorageGroup, .. })
        );
        assert_matches!(
            views
                .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::HostGroup("host-1".into()), "pg-1")
                .await,
            Err(Error::ResourceNotFound { kind: ResourceKind::HostGroup, .. })
        );
        assert_matches!(
            views
                .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::Host("host-1".into()), "pg-9")
                .await,
            Err(Error::ResourceNotFound { kind: ResourceKind::PortGroup, .. })
        );
    }

    #[tokio::test]
    async fn test_delete_missing_is_error() {
        let views = manager(seeded());
        views
            .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::Host("host-1".into()), "pg-1")
            .await
            .unwrap();

        views.delete(SYM, "mv-1").await.unwrap();
        assert_matches!(
            views.delete(SYM, "mv-1").await,
            Err(Error::MaskingViewNotFound { id }) if id == "mv-1"
        );
        assert_matches!(
            views.get(SYM, "mv-1").await,
            Err(Error::MaskingViewNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_job_creates_nothing() {
        let array = seeded();
        array.fail_next(TransportOp::CreateMaskingView, Fault::JobFails("busy".into()));
        let views = manager(array);

        assert_matches!(
            views
                .create(SYM, "mv-1", "sg-1", InitiatorGroupRef::Host("host-1".into()), "pg-1")
                .await,
            Err(Error::JobFailed { .. })
        );
        assert!(views.list(SYM).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_array() {
        let array = seeded();
        let allow_list = Arc::new(AllowList::with_arrays([SYM]));
        let jobs = Arc::new(JobTracker::new(
            array.clone(),
            allow_list.clone(),
            JobPollConfig::default(),
        ));
        let views = MaskingViewManager::new(array.clone(), allow_list, jobs);

        assert_matches!(
            views
                .create(
                    "000000000000",
                    "mv-1",
                    "sg-1",
                    InitiatorGroupRef::Host("host-1".into()),
                    "pg-1"
                )
                .await,
            Err(Error::UnauthorizedArray { .. })
        );
        assert_eq!(array.total_calls(), 0);
    }
}
