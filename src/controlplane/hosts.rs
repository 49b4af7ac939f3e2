//! Hosts and Initiators

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::dedupe::unique_ids;
use crate::domain::model::{Host, Initiator};
use crate::domain::ports::{ArrayTransportRef, InitiatorFilter};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Host, host group and initiator operations, gated by the allow-list
pub struct HostManager {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
}

impl HostManager {
    pub fn new(transport: ArrayTransportRef, allow_list: Arc<AllowList>) -> Self {
        Self {
            transport,
            allow_list,
        }
    }

    /// Ids of hosts and host groups
    pub async fn list(&self, array_id: &str) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_hosts(array_id).await
    }

    pub async fn get(&self, array_id: &str, host_id: &str) -> Result<Host> {
        self.allow_list.check(array_id)?;
        debug!(array_id = %array_id, host_id = %host_id, "Getting host");
        self.transport.get_host(array_id, host_id).await
    }

    /// Create a host from initiator identifiers (IQN or WWN)
    pub async fn create(&self, array_id: &str, host_id: &str, initiators: &[&str]) -> Result<Host> {
        self.allow_list.check(array_id)?;
        let initiators = unique_ids(initiators);
        if host_id.is_empty() {
            return Err(Error::InvalidArgument("host id must not be empty".into()));
        }
        if initiators.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "host {} needs at least one initiator",
                host_id
            )));
        }

        info!(array_id = %array_id, host_id = %host_id, initiators = ?initiators, "Creating host");
        self.transport.create_host(array_id, host_id, initiators).await
    }

    /// Replace the host's initiators
    pub async fn update_initiators(
        &self,
        array_id: &str,
        host_id: &str,
        initiators: &[&str],
    ) -> Result<Host> {
        self.allow_list.check(array_id)?;
        let initiators = unique_ids(initiators);

        info!(array_id = %array_id, host_id = %host_id, initiators = ?initiators, "Updating host initiators");
        self.transport
            .update_host_initiators(array_id, host_id, initiators)
            .await
    }

    pub async fn delete(&self, array_id: &str, host_id: &str) -> Result<()> {
        self.allow_list.check(array_id)?;
        info!(array_id = %array_id, host_id = %host_id, "Deleting host");
        self.transport.delete_host(array_id, host_id).await
    }

    pub async fn list_initiators(&self, array_id: &str, filter: InitiatorFilter) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_initiators(array_id, filter).await
    }

    pub async fn get_initiator(&self, array_id: &str, initiator_id: &str) -> Result<Initiator> {
        self.allow_list.check(array_id)?;
        self.transport.get_initiator(array_id, initiator_id).await
    }
}
