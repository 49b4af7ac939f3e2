//! Port Groups
//!
//! Port group CRUD. Updates replace the membership wholesale and the result
//! is compared with the request as a set. Also discovers the front-end
//! directors and ports that groups are built from.

use crate::controlplane::allow_list::AllowList;
use crate::controlplane::dedupe::unique;
use crate::controlplane::jobs::JobTracker;
use crate::domain::model::{Port, PortGroup, PortKey};
use crate::domain::ports::{ArrayTransportRef, PortFilter};
use crate::error::{Error, Result};
use futures::future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Port group operations, gated by the allow-list
pub struct PortGroupManager {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    jobs: Arc<JobTracker>,
}

impl PortGroupManager {
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
        self.transport.list_port_groups(array_id).await
    }

    pub async fn get(&self, array_id: &str, port_group_id: &str) -> Result<PortGroup> {
        self.allow_list.check(array_id)?;
        debug!(array_id = %array_id, port_group = %port_group_id, "Getting port group");
        self.transport.get_port_group(array_id, port_group_id).await
    }

    pub async fn create(
        &self,
        array_id: &str,
        port_group_id: &str,
        ports: &[PortKey],
    ) -> Result<PortGroup> {
        self.allow_list.check(array_id)?;
        if port_group_id.is_empty() {
            return Err(Error::InvalidArgument("port group id must not be empty".into()));
        }
        let ports = unique(ports.iter().cloned());

        info!(
            array_id = %array_id,
            port_group = %port_group_id,
            ports = ports.len(),
            "Creating port group"
        );
        self.transport
            .create_port_group(array_id, port_group_id, ports)
            .await
    }

    /// Replace the group's ports and verify the array applied exactly that set
    pub async fn update(
        &self,
        array_id: &str,
        port_group_id: &str,
        ports: &[PortKey],
    ) -> Result<PortGroup> {
        self.allow_list.check(array_id)?;
        let ports = unique(ports.iter().cloned());

        info!(
            array_id = %array_id,
            port_group = %port_group_id,
            ports = ?ports.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "Updating port group"
        );

        let submission = self
            .transport
            .update_port_group(array_id, port_group_id, ports.clone())
            .await?;
        let group = match self.jobs.settle(array_id, submission).await? {
            Some(group) => group,
            None => self.transport.get_port_group(array_id, port_group_id).await?,
        };

        if !group.same_ports(&ports) {
            warn!(
                array_id = %array_id,
                port_group = %port_group_id,
                "Port group does not match requested ports"
            );
            return Err(Error::InvalidResponse(format!(
                "port group {} has {} ports after update, expected {}",
                port_group_id,
                group.port_set().len(),
                ports.len()
            )));
        }
        Ok(group)
    }

    pub async fn delete(&self, array_id: &str, port_group_id: &str) -> Result<()> {
        self.allow_list.check(array_id)?;
        info!(array_id = %array_id, port_group = %port_group_id, "Deleting port group");
        self.transport.delete_port_group(array_id, port_group_id).await
    }

    // =========================================================================
    // Front-end ports
    // =========================================================================

    pub async fn list_directors(&self, array_id: &str) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_directors(array_id).await
    }

    pub async fn list_ports(
        &self,
        array_id: &str,
        director_id: &str,
        filter: PortFilter,
    ) -> Result<Vec<PortKey>> {
        self.allow_list.check(array_id)?;
        self.transport.list_ports(array_id, director_id, filter).await
    }

    pub async fn get_port(&self, array_id: &str, port: &PortKey) -> Result<Port> {
        self.allow_list.check(array_id)?;
        self.transport.get_port(array_id, port).await
    }

    /// IP addresses of every iSCSI target port, first-seen order
    pub async fn list_target_addresses(&self, array_id: &str) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        let directors = self.transport.list_directors(array_id).await?;
        let iscsi = PortFilter { iscsi_only: true };

        let per_director = future::try_join_all(
            directors
                .iter()
                .map(|director| self.transport.list_ports(array_id, director, iscsi)),
        )
        .await?;
        let keys: Vec<PortKey> = per_director.into_iter().flatten().collect();

        let ports = future::try_join_all(
            keys.iter().map(|key| self.transport.get_port(array_id, key)),
        )
        .await?;

        let addresses = unique(ports.into_iter().flat_map(|p| p.ip_addresses));
        debug!(
            array_id = %array_id,
            directors = directors.len(),
            ports = keys.len(),
            addresses = addresses.len(),
            "Collected iSCSI target addresses"
        );
        Ok(addresses)
    }
}
