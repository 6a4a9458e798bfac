// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent store port.
//!
//! [`PersistentStore`] is the only interface through which the datastore
//! touches durable storage.  Every mutation made by the facade is written
//! here before the corresponding cache commit.  Implementations are expected
//! to be internally synchronized and idempotent at the row level: adding an
//! existing row or deleting a missing one must not corrupt state, since the
//! facade retries partial failures.

use crate::config::Config;
use crate::types::{
    Attachment, BatchFrameStat, BatchFrameSummary, FrameTrace, Image,
    Instance, InstanceStatReport, LogEntry, MappedIp, NodeStatReport, Pool,
    QuotaDetails, StorageResource, Tenant, TenantConfig, TenantIp, Volume,
    Workload,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// An error surfaced by the persistent store.
///
/// Both kinds are surfaced uniformly to the facade; `Unavailable` is the
/// only one worth retrying.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// A transient I/O failure; the row state is unchanged.
    #[error("persistent store unavailable: {0}")]
    Unavailable(String),
    /// The write contradicts a persistent integrity constraint.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// A tenant row together with its claimed private addresses, as loaded at
/// startup.
#[derive(Clone, Debug)]
pub struct TenantRecord {
    pub tenant: Tenant,
    pub claimed_ips: Vec<TenantIp>,
}

pub trait PersistentStore: Send + Sync {
    fn init(&self, config: &Config) -> Result<(), StoreError>;
    fn disconnect(&self);

    // Event log.
    fn log_event(&self, entry: LogEntry) -> Result<(), StoreError>;
    fn clear_log(&self) -> Result<(), StoreError>;
    fn get_event_log(&self) -> Result<Vec<LogEntry>, StoreError>;

    // Workloads.
    fn add_workload(&self, workload: &Workload) -> Result<(), StoreError>;
    fn delete_workload(&self, id: Uuid) -> Result<(), StoreError>;
    fn get_workloads(&self) -> Result<Vec<Workload>, StoreError>;

    // Tenants and their private addresses.
    fn add_tenant(
        &self,
        id: Uuid,
        config: &TenantConfig,
    ) -> Result<(), StoreError>;
    fn get_tenant(&self, id: Uuid) -> Result<Option<TenantRecord>, StoreError>;
    fn get_tenants(&self) -> Result<Vec<TenantRecord>, StoreError>;
    fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;
    fn delete_tenant(&self, id: Uuid) -> Result<(), StoreError>;
    fn claim_tenant_ip(
        &self,
        tenant_id: Uuid,
        ip: TenantIp,
    ) -> Result<(), StoreError>;
    fn claim_tenant_ips(
        &self,
        tenant_id: Uuid,
        ips: &[TenantIp],
    ) -> Result<(), StoreError>;
    fn release_tenant_ip(
        &self,
        tenant_id: Uuid,
        ip: TenantIp,
    ) -> Result<(), StoreError>;

    // Instances.
    fn get_instances(&self) -> Result<Vec<Instance>, StoreError>;
    fn add_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    fn update_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    fn delete_instance(&self, id: Uuid) -> Result<(), StoreError>;

    // Statistics.
    fn add_node_stat(&self, report: &NodeStatReport) -> Result<(), StoreError>;
    fn add_instance_stats(
        &self,
        stats: &[InstanceStatReport],
        node_id: Option<Uuid>,
    ) -> Result<(), StoreError>;
    fn add_frame_stat(&self, frame: &FrameTrace) -> Result<(), StoreError>;
    fn get_batch_frame_summary(
        &self,
    ) -> Result<Vec<BatchFrameSummary>, StoreError>;
    fn get_batch_frame_statistics(
        &self,
        label: &str,
    ) -> Result<Vec<BatchFrameStat>, StoreError>;

    // Block storage.
    fn get_workload_storage(
        &self,
        id: Uuid,
    ) -> Result<Vec<StorageResource>, StoreError>;
    fn get_all_block_data(&self) -> Result<HashMap<Uuid, Volume>, StoreError>;
    fn add_block_data(&self, volume: &Volume) -> Result<(), StoreError>;
    fn update_block_data(&self, volume: &Volume) -> Result<(), StoreError>;
    fn delete_block_data(&self, id: Uuid) -> Result<(), StoreError>;
    fn get_tenant_devices(
        &self,
        tenant_id: Uuid,
    ) -> Result<HashMap<Uuid, Volume>, StoreError>;
    fn add_storage_attachment(
        &self,
        attachment: &Attachment,
    ) -> Result<(), StoreError>;
    fn get_all_storage_attachments(
        &self,
    ) -> Result<HashMap<Uuid, Attachment>, StoreError>;
    fn delete_storage_attachment(&self, id: Uuid) -> Result<(), StoreError>;

    // External IP pools.
    fn add_pool(&self, pool: &Pool) -> Result<(), StoreError>;
    fn update_pool(&self, pool: &Pool) -> Result<(), StoreError>;
    fn get_all_pools(&self) -> Result<HashMap<Uuid, Pool>, StoreError>;
    fn delete_pool(&self, id: Uuid) -> Result<(), StoreError>;
    fn add_mapped_ip(&self, mapping: &MappedIp) -> Result<(), StoreError>;
    fn delete_mapped_ip(&self, id: Uuid) -> Result<(), StoreError>;
    fn get_mapped_ips(
        &self,
    ) -> Result<HashMap<Ipv4Addr, MappedIp>, StoreError>;

    // Quotas.
    fn update_quotas(
        &self,
        tenant_id: Uuid,
        quotas: &[QuotaDetails],
    ) -> Result<(), StoreError>;
    fn get_quotas(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<QuotaDetails>, StoreError>;

    // Images.
    fn update_image(&self, image: &Image) -> Result<(), StoreError>;
    fn delete_image(&self, id: Uuid) -> Result<(), StoreError>;
    fn get_images(&self) -> Result<Vec<Image>, StoreError>;
}
