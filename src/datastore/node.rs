// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes, stat ingestion and tenant usage accounting.
//!
//! Node entries are not persisted as rows of their own: they are rebuilt
//! from instance placement and from incoming stat reports.  The cumulative
//! failure counters live on the node entry and are folded into every
//! node-status snapshot.
//!
//! Usage accounting integrates per-instance deltas into a per-tenant
//! history.  A new history entry opens at most once per
//! [`TENANT_USAGE_PERIOD_MINUTES`]; within the period the last entry is
//! updated in place and keeps its timestamp.

use crate::datastore::{Datastore, NodeState};
use crate::error::Error;
use crate::types::{
    InstanceState, InstanceStatReport, InstanceStats, Node, NodeRole,
    NodeStatReport, NodeStatus, NodeSummary, ResourceCounts, TenantUsage,
};
use chrono::{DateTime, Duration, Utc};
use slog::warn;
use uuid::Uuid;

/// Minimum spacing between two entries of a tenant's usage history.
pub const TENANT_USAGE_PERIOD_MINUTES: i64 = 5;

impl Datastore {
    /// Registers a node, merging the announced role into any roles the node
    /// already holds.
    pub fn add_node(&self, node_id: Uuid, role: NodeRole) {
        let mut nodes = self.nodes.write().unwrap();
        let state =
            nodes.entry(node_id).or_insert_with(|| NodeState::new(node_id));
        state.node.role |= role;
    }

    pub fn get_node(&self, node_id: Uuid) -> Result<Node, Error> {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(&node_id)
            .map(|state| state.node.clone())
            .ok_or(Error::NodeNotFound)
    }

    /// Removes a node.  Every instance placed on it transitions to missing
    /// and loses its node association.
    pub fn delete_node(&self, node_id: Uuid) -> Result<(), Error> {
        {
            let mut instances = self.instances.write().unwrap();
            let mut nodes = self.nodes.write().unwrap();
            if let Some(node) = nodes.remove(&node_id) {
                for id in node.instances {
                    if let Some(instance) = instances.get_mut(&id) {
                        instance.state = InstanceState::Missing;
                        instance.node_id = None;
                    }
                }
            }
        }

        self.node_last_stat.write().unwrap().remove(&node_id);
        Ok(())
    }

    /// Per-node instance counts by state, CNCIs excluded.
    pub fn get_node_summary(&self) -> Vec<NodeSummary> {
        let instances = self.instances.read().unwrap();
        let nodes = self.nodes.read().unwrap();

        let mut summaries = Vec::with_capacity(nodes.len());
        for state in nodes.values() {
            let mut summary = NodeSummary {
                node_id: state.node.id,
                total_failures: state.node.total_failures,
                ..NodeSummary::default()
            };
            for instance in
                state.instances.iter().filter_map(|id| instances.get(id))
            {
                if instance.cnci {
                    continue;
                }
                summary.total_instances += 1;
                match instance.state {
                    InstanceState::Pending => {
                        summary.total_pending_instances += 1
                    }
                    InstanceState::Running => {
                        summary.total_running_instances += 1
                    }
                    InstanceState::Exited => {
                        summary.total_exited_instances += 1
                    }
                    InstanceState::Missing => (),
                }
            }
            summaries.push(summary);
        }
        summaries
    }

    /// Ingests a full stat report from a node agent.  A load of -1 marks a
    /// report with no node-level portion.
    pub fn handle_stats(&self, report: &NodeStatReport) -> Result<(), Error> {
        if report.load != -1 {
            self.add_node_stat(report)?;
        }
        self.add_instance_stats(&report.instances, Some(report.node_id))
    }

    fn add_node_stat(&self, report: &NodeStatReport) -> Result<(), Error> {
        let status = {
            let mut nodes = self.nodes.write().unwrap();
            let state = nodes
                .entry(report.node_id)
                .or_insert_with(|| NodeState::new(report.node_id));
            state.node.hostname = report.hostname.clone();

            NodeStatus {
                id: report.node_id,
                hostname: report.hostname.clone(),
                load: report.load,
                mem_total_mb: report.mem_total_mb,
                mem_available_mb: report.mem_available_mb,
                disk_total_mb: report.disk_total_mb,
                disk_available_mb: report.disk_available_mb,
                online_cpus: report.cpus_online,
                total_failures: state.node.total_failures,
                start_failures: state.node.start_failures,
                attach_volume_failures: state.node.attach_volume_failures,
                delete_failures: state.node.delete_failures,
            }
        };

        self.node_last_stat.write().unwrap().insert(report.node_id, status);

        Ok(self.db.add_node_stat(report)?)
    }

    /// Folds per-instance samples into the caches: the live instance record,
    /// the reporting node's placement map, the last-stat table and the
    /// owning tenant's usage history.
    pub(crate) fn add_instance_stats(
        &self,
        stats: &[InstanceStatReport],
        node_id: Option<Uuid>,
    ) -> Result<(), Error> {
        for report in stats {
            let instance_tenant = {
                let mut instances = self.instances.write().unwrap();
                match instances.get_mut(&report.instance_id) {
                    Some(instance) => {
                        instance.state = report.state;
                        instance.node_id = node_id;
                        instance.ssh_ip = report.ssh_ip;
                        instance.ssh_port = report.ssh_port;

                        if let Some(node_id) = node_id {
                            let mut nodes = self.nodes.write().unwrap();
                            nodes
                                .entry(node_id)
                                .or_insert_with(|| NodeState::new(node_id))
                                .instances
                                .insert(report.instance_id);
                        }
                        Some(instance.tenant_id)
                    }
                    None => None,
                }
            };
            let Some(instance_tenant) = instance_tenant else {
                warn!(self.log, "dropping stat for unknown instance";
                    "instance_id" => %report.instance_id);
                continue;
            };

            // Agents report -1 for dimensions they cannot measure.
            let sample = ResourceCounts {
                vcpu: report.cpu_usage.max(0),
                memory_mb: report.memory_usage_mb.max(0),
                disk_mb: report.disk_usage_mb.max(0),
            };

            let (delta, tenant_id) = {
                let mut last = self.instance_last_stat.write().unwrap();
                let prior = last.get(&report.instance_id);
                let tenant_id =
                    prior.map(|p| p.tenant_id).unwrap_or(instance_tenant);
                let delta = prior.and_then(|p| p.usage).map(|prior_usage| {
                    ResourceCounts {
                        vcpu: sample.vcpu - prior_usage.vcpu,
                        memory_mb: sample.memory_mb - prior_usage.memory_mb,
                        disk_mb: sample.disk_mb - prior_usage.disk_mb,
                    }
                });

                last.insert(
                    report.instance_id,
                    InstanceStats {
                        id: report.instance_id,
                        tenant_id,
                        node_id,
                        timestamp: Utc::now(),
                        state: report.state,
                        usage: Some(sample),
                    },
                );
                (delta, tenant_id)
            };

            // The first sample only establishes the baseline.
            if let Some(delta) = delta {
                self.update_tenant_usage(delta, tenant_id);
            }
        }

        Ok(self.db.add_instance_stats(stats, node_id)?)
    }

    /// The last stats received for instances on a node, CNCIs excluded.
    pub fn get_instance_last_stats(&self, node_id: Uuid) -> Vec<InstanceStats> {
        let instances = self.instances.read().unwrap();
        let stats = self.instance_last_stat.read().unwrap();

        stats
            .values()
            .filter(|entry| entry.node_id == Some(node_id))
            .filter(|entry| {
                instances.get(&entry.id).map(|i| !i.cnci).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// The last stat received from every node.
    pub fn get_node_last_stats(&self) -> Vec<NodeStatus> {
        let stats = self.node_last_stat.read().unwrap();
        stats.values().cloned().collect()
    }

    pub(crate) fn update_tenant_usage(
        &self,
        delta: ResourceCounts,
        tenant_id: Uuid,
    ) {
        if delta.vcpu == 0 && delta.memory_mb == 0 && delta.disk_mb == 0 {
            return;
        }

        let now = Utc::now();
        let mut usage = self.tenant_usage.write().unwrap();
        let history = usage.entry(tenant_id).or_default();

        let (base, open_new) = match history.last().copied() {
            Some(entry) => {
                let elapsed = now.signed_duration_since(entry.timestamp);
                (
                    entry,
                    elapsed >= Duration::minutes(TENANT_USAGE_PERIOD_MINUTES),
                )
            }
            None => (
                TenantUsage {
                    timestamp: now,
                    vcpu: 0,
                    memory_mb: 0,
                    disk_mb: 0,
                },
                true,
            ),
        };

        let entry = TenantUsage {
            timestamp: if open_new { now } else { base.timestamp },
            vcpu: base.vcpu + delta.vcpu,
            memory_mb: base.memory_mb + delta.memory_mb,
            disk_mb: base.disk_mb + delta.disk_mb,
        };

        if open_new {
            history.push(entry);
        } else {
            *history.last_mut().unwrap() = entry;
        }
    }

    /// Returns the slice of a tenant's usage history whose timestamps fall
    /// within `[start, end)`.
    pub fn get_tenant_usage(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<TenantUsage> {
        let usage = self.tenant_usage.read().unwrap();
        let Some(history) = usage.get(&tenant_id) else {
            return Vec::new();
        };
        if history.is_empty() {
            return Vec::new();
        }

        if history[0].timestamp > end
            || start > history[history.len() - 1].timestamp
        {
            return Vec::new();
        }

        let mut first = 0;
        let mut last = 0;
        for entry in history {
            if start > entry.timestamp {
                first += 1;
            }
            if end > entry.timestamp {
                last += 1;
            }
        }

        history[first..last].to_vec()
    }
}
