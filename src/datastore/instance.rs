// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instance lifecycle.
//!
//! Instance records live in the `instances` table only; tenants and nodes
//! reference them by id.  Deleting an instance cascades: the persistent row
//! goes first, then the caches unlink, the private IP is released (CNCIs
//! hold none) and storage attachments are torn down.  Failures after the
//! persistent delete are logged, cleanup continues, and the first error is
//! surfaced so a retry can converge.

use crate::datastore::{Datastore, NodeState};
use crate::error::Error;
use crate::types::{
    EventType, Instance, InstanceState, InstanceStatReport, InstanceStats,
    StartFailureReason, TenantCnci,
};
use chrono::Utc;
use slog::warn;
use uuid::Uuid;

impl Datastore {
    /// Stores a new instance and links it into its tenant and node.
    pub fn add_instance(&self, instance: &Instance) -> Result<(), Error> {
        {
            let tenants = self.tenants.read().unwrap();
            if !tenants.contains_key(&instance.tenant_id) {
                return Err(Error::TenantNotFound);
            }
        }

        self.db.add_instance(instance)?;

        self.instances.write().unwrap().insert(instance.id, instance.clone());

        let seed = InstanceStats {
            id: instance.id,
            tenant_id: instance.tenant_id,
            node_id: instance.node_id,
            timestamp: Utc::now(),
            state: instance.state,
            usage: None,
        };
        self.instance_last_stat.write().unwrap().insert(instance.id, seed);

        {
            let mut tenants = self.tenants.write().unwrap();
            if let Some(state) = tenants.get_mut(&instance.tenant_id) {
                state.instances.insert(instance.id);
            }
        }

        if let Some(node_id) = instance.node_id {
            let mut nodes = self.nodes.write().unwrap();
            nodes
                .entry(node_id)
                .or_insert_with(|| NodeState::new(node_id))
                .instances
                .insert(instance.id);
        }

        Ok(())
    }

    pub fn get_instance(&self, instance_id: Uuid) -> Result<Instance, Error> {
        let instances = self.instances.read().unwrap();
        instances.get(&instance_id).cloned().ok_or(Error::InstanceNotFound)
    }

    /// Looks up an instance within a tenant.  CNCI instances and instances
    /// of other tenants are reported as not found.
    pub fn get_tenant_instance(
        &self,
        tenant_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Instance, Error> {
        let instances = self.instances.read().unwrap();
        match instances.get(&instance_id) {
            Some(instance)
                if instance.tenant_id == tenant_id && !instance.cnci =>
            {
                Ok(instance.clone())
            }
            _ => Err(Error::InstanceNotFound),
        }
    }

    fn list_instances(&self, cncis: bool) -> Vec<Instance> {
        let instances = self.instances.read().unwrap();
        instances.values().filter(|i| i.cnci == cncis).cloned().collect()
    }

    /// All user instances; CNCIs are excluded.
    pub fn get_all_instances(&self) -> Vec<Instance> {
        self.list_instances(false)
    }

    pub fn get_all_cnci_instances(&self) -> Vec<Instance> {
        self.list_instances(true)
    }

    fn list_tenant_instances(
        &self,
        tenant_id: Uuid,
        cncis: bool,
    ) -> Vec<Instance> {
        let tenants = self.tenants.read().unwrap();
        let instances = self.instances.read().unwrap();
        let Some(state) = tenants.get(&tenant_id) else {
            return Vec::new();
        };
        state
            .instances
            .iter()
            .filter_map(|id| instances.get(id))
            .filter(|i| i.cnci == cncis)
            .cloned()
            .collect()
    }

    /// All of a tenant's instances, CNCIs excluded.  An unknown tenant
    /// yields an empty list.
    pub fn get_tenant_instances(&self, tenant_id: Uuid) -> Vec<Instance> {
        self.list_tenant_instances(tenant_id, false)
    }

    pub fn get_tenant_cncis(&self, tenant_id: Uuid) -> Vec<Instance> {
        self.list_tenant_instances(tenant_id, true)
    }

    /// All non-CNCI instances running on a node.
    pub fn get_instances_by_node(&self, node_id: Uuid) -> Vec<Instance> {
        let instances = self.instances.read().unwrap();
        let nodes = self.nodes.read().unwrap();
        let Some(node) = nodes.get(&node_id) else {
            return Vec::new();
        };
        node.instances
            .iter()
            .filter_map(|id| instances.get(id))
            .filter(|i| !i.cnci)
            .cloned()
            .collect()
    }

    /// Persists changed instance fields and refreshes the cached record.
    pub fn update_instance(&self, instance: &Instance) -> Result<(), Error> {
        let mut instances = self.instances.write().unwrap();
        if !instances.contains_key(&instance.id) {
            return Err(Error::InstanceNotFound);
        }
        self.db.update_instance(instance)?;
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    /// Maps an instance name (or id string) to its id within a tenant.
    pub fn resolve_instance(
        &self,
        tenant_id: Uuid,
        name: &str,
    ) -> Result<Option<Uuid>, Error> {
        let tenants = self.tenants.read().unwrap();
        let instances = self.instances.read().unwrap();
        let state = tenants.get(&tenant_id).ok_or(Error::TenantNotFound)?;
        for id in &state.instances {
            if let Some(instance) = instances.get(id) {
                if instance.name == name || id.to_string() == name {
                    return Ok(Some(*id));
                }
            }
        }
        Ok(None)
    }

    /// Removes an instance and logs the deletion.
    pub fn delete_instance(&self, instance_id: Uuid) -> Result<(), Error> {
        let instance = self.delete_instance_inner(instance_id)?;
        let message = format!("Deleted instance {}", instance_id);
        self.log_event_entry(
            Some(instance.tenant_id),
            instance.node_id,
            EventType::Info,
            message,
        )
    }

    /// The deletion cascade.  The persistent row delete happens exactly
    /// once, up front; everything after is cleanup that must not stop
    /// halfway.
    pub(crate) fn delete_instance_inner(
        &self,
        instance_id: Uuid,
    ) -> Result<Instance, Error> {
        let instance = self.get_instance(instance_id)?;

        self.db.delete_instance(instance_id)?;

        self.instance_last_stat.write().unwrap().remove(&instance_id);
        self.instances.write().unwrap().remove(&instance_id);

        {
            let mut tenants = self.tenants.write().unwrap();
            if let Some(state) = tenants.get_mut(&instance.tenant_id) {
                state.instances.remove(&instance_id);
            }
        }

        // The instance may never have reported in from a node.
        if let Some(node_id) = instance.node_id {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(&node_id) {
                node.instances.remove(&instance_id);
            }
        }

        let mut result = Ok(());
        if !instance.cnci {
            if let Err(error) = self
                .release_tenant_ip(instance.tenant_id, instance.ip_address)
            {
                warn!(self.log, "error releasing instance IP";
                    "instance_id" => %instance_id, "error" => %error);
                result = Err(error);
            }
        }

        self.release_instance_attachments(instance_id);

        result.map(|()| instance)
    }

    /// Cleans up after a failed instance start.  Fatal, non-migration
    /// failures delete the instance; in every case the node's failure
    /// counters are bumped and an error event is logged.
    pub fn start_failure(
        &self,
        instance_id: Uuid,
        reason: StartFailureReason,
        migration: bool,
        node_id: Option<Uuid>,
    ) -> Result<(), Error> {
        let instance = self.get_instance(instance_id)?;
        if instance.cnci {
            warn!(self.log, "CNCI instance failed to start";
                "instance_id" => %instance_id, "tenant_id" => %instance.tenant_id);
        }

        if reason.is_fatal() && !migration {
            self.delete_instance_inner(instance_id)?;
        }

        if let Some(node_id) = node_id {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(state) = nodes.get_mut(&node_id) {
                state.node.total_failures += 1;
                state.node.start_failures += 1;
            }
        }

        let message =
            format!("Start failure for instance {}: {}", instance_id, reason);
        self.log_event_entry(
            Some(instance.tenant_id),
            node_id,
            EventType::Error,
            message,
        )
    }

    fn update_instance_status(
        &self,
        instance_id: Uuid,
        state: InstanceState,
    ) -> Result<(), Error> {
        let report = InstanceStatReport {
            instance_id,
            state,
            ssh_ip: None,
            ssh_port: 0,
            cpu_usage: 0,
            memory_usage_mb: 0,
            disk_usage_mb: 0,
        };
        self.db.add_instance_stats(&[report], None)?;

        let mut stats = self.instance_last_stat.write().unwrap();
        if let Some(entry) = stats.get_mut(&instance_id) {
            entry.state = state;
            entry.node_id = None;
            entry.timestamp = Utc::now();
            // A restart or stop resets the usage baseline; the next agent
            // report establishes a fresh one.
            entry.usage = None;
        }
        Ok(())
    }

    /// Marks a restarting instance pending again.  The node association is
    /// unchanged.
    pub fn instance_restarting(
        &self,
        instance_id: Uuid,
    ) -> Result<(), Error> {
        self.update_instance_status(instance_id, InstanceState::Pending)?;

        let mut instances = self.instances.write().unwrap();
        let instance =
            instances.get_mut(&instance_id).ok_or(Error::InstanceNotFound)?;
        instance.state = InstanceState::Pending;
        Ok(())
    }

    /// Marks an instance exited and severs the link to its node.
    pub fn instance_stopped(&self, instance_id: Uuid) -> Result<(), Error> {
        self.update_instance_status(instance_id, InstanceState::Exited)?;

        let old_node_id = {
            let mut instances = self.instances.write().unwrap();
            let instance = instances
                .get_mut(&instance_id)
                .ok_or(Error::InstanceNotFound)?;
            instance.state = InstanceState::Exited;
            instance.node_id.take()
        };

        if let Some(node_id) = old_node_id {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.get_mut(&node_id) {
                node.instances.remove(&instance_id);
            }
        }

        Ok(())
    }

    /// Summarizes CNCI instances, optionally restricted to one instance id.
    pub fn get_tenant_cnci_summary(
        &self,
        cnci_id: Option<Uuid>,
    ) -> Vec<TenantCnci> {
        let mut summaries = Vec::new();
        for instance in self.get_all_cnci_instances() {
            if let Some(id) = cnci_id {
                if id != instance.id {
                    continue;
                }
            }
            summaries.push(TenantCnci {
                tenant_id: instance.tenant_id,
                instance_id: instance.id,
                ip_address: instance.ip_address,
                mac_address: instance.mac_address,
                subnets: instance.subnet.into_iter().collect(),
            });
            if cnci_id.is_some() {
                break;
            }
        }
        summaries
    }
}
