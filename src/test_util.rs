// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support: an in-memory persistent store with fault injection.
//!
//! [`MemStore`] implements the full [`PersistentStore`] port over plain
//! maps, which is enough to exercise every datastore path, including
//! startup cache population and write-through failure handling.  A test
//! arms a single-shot failure with [`MemStore::fail_next`] and the next
//! matching operation reports the store unavailable.

use crate::config::Config;
use crate::datastore::Datastore;
use crate::store::{PersistentStore, StoreError, TenantRecord};
use crate::address;
use crate::types::{
    Attachment, BatchFrameStat, BatchFrameSummary, FirmwareType, FrameTrace,
    Image, Instance, InstanceState, InstanceStatReport, LogEntry, MappedIp,
    NodeStatReport, Pool, QuotaDetails, StorageResource, Tenant,
    TenantConfig, TenantIp, Visibility, VmType, Volume, VolumeState,
    Workload, WorkloadRequirements,
};
use chrono::Utc;
use slog::{o, Logger};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Operations that can be armed to fail once.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailPoint {
    LogEvent,
    AddWorkload,
    DeleteWorkload,
    AddTenant,
    UpdateTenant,
    DeleteTenant,
    ClaimTenantIps,
    ReleaseTenantIp,
    AddInstance,
    UpdateInstance,
    DeleteInstance,
    AddNodeStat,
    AddInstanceStats,
    AddBlockData,
    UpdateBlockData,
    DeleteBlockData,
    AddStorageAttachment,
    DeleteStorageAttachment,
    AddPool,
    UpdatePool,
    DeletePool,
    AddMappedIp,
    DeleteMappedIp,
    UpdateImage,
    DeleteImage,
}

#[derive(Default)]
struct Inner {
    events: Vec<LogEntry>,
    workloads: HashMap<Uuid, Workload>,
    tenants: HashMap<Uuid, (Tenant, Vec<TenantIp>)>,
    instances: HashMap<Uuid, Instance>,
    node_stats: usize,
    instance_stats: usize,
    frames: Vec<FrameTrace>,
    volumes: HashMap<Uuid, Volume>,
    attachments: HashMap<Uuid, Attachment>,
    pools: HashMap<Uuid, Pool>,
    mapped_ips: HashMap<Ipv4Addr, MappedIp>,
    quotas: HashMap<Uuid, Vec<QuotaDetails>>,
    images: HashMap<Uuid, Image>,
}

/// An in-memory [`PersistentStore`].
pub struct MemStore {
    inner: Mutex<Inner>,
    fail: Mutex<HashSet<FailPoint>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            inner: Mutex::new(Inner::default()),
            fail: Mutex::new(HashSet::new()),
        }
    }

    /// Arms a one-shot failure for the given operation.
    pub fn fail_next(&self, op: FailPoint) {
        self.fail.lock().unwrap().insert(op);
    }

    fn check(&self, op: FailPoint) -> Result<(), StoreError> {
        if self.fail.lock().unwrap().remove(&op) {
            return Err(StoreError::Unavailable(format!(
                "injected failure: {:?}",
                op
            )));
        }
        Ok(())
    }

    /*
     * Row inspection for tests.
     */

    pub fn attachment_count(&self) -> usize {
        self.inner.lock().unwrap().attachments.len()
    }

    pub fn mapped_ip_count(&self) -> usize {
        self.inner.lock().unwrap().mapped_ips.len()
    }

    pub fn claimed_ip_count(&self, tenant_id: Uuid) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .tenants
            .get(&tenant_id)
            .map(|(_, claims)| claims.len())
            .unwrap_or(0)
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }

    pub fn node_stat_count(&self) -> usize {
        self.inner.lock().unwrap().node_stats
    }

    pub fn instance_stat_count(&self) -> usize {
        self.inner.lock().unwrap().instance_stats
    }
}

impl Default for MemStore {
    fn default() -> MemStore {
        MemStore::new()
    }
}

impl PersistentStore for MemStore {
    fn init(&self, _config: &Config) -> Result<(), StoreError> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn log_event(&self, entry: LogEntry) -> Result<(), StoreError> {
        self.check(FailPoint::LogEvent)?;
        self.inner.lock().unwrap().events.push(entry);
        Ok(())
    }

    fn clear_log(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap().events.clear();
        Ok(())
    }

    fn get_event_log(&self) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.inner.lock().unwrap().events.clone())
    }

    fn add_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        self.check(FailPoint::AddWorkload)?;
        let mut inner = self.inner.lock().unwrap();
        inner.workloads.insert(workload.id, workload.clone());
        Ok(())
    }

    fn delete_workload(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteWorkload)?;
        self.inner.lock().unwrap().workloads.remove(&id);
        Ok(())
    }

    fn get_workloads(&self) -> Result<Vec<Workload>, StoreError> {
        Ok(self.inner.lock().unwrap().workloads.values().cloned().collect())
    }

    fn add_tenant(
        &self,
        id: Uuid,
        config: &TenantConfig,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::AddTenant)?;
        let tenant = Tenant {
            id,
            name: config.name.clone(),
            subnet_bits: config.subnet_bits,
            created: Utc::now(),
        };
        self.inner.lock().unwrap().tenants.insert(id, (tenant, Vec::new()));
        Ok(())
    }

    fn get_tenant(
        &self,
        id: Uuid,
    ) -> Result<Option<TenantRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tenants.get(&id).map(|(tenant, claims)| TenantRecord {
            tenant: tenant.clone(),
            claimed_ips: claims.clone(),
        }))
    }

    fn get_tenants(&self) -> Result<Vec<TenantRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tenants
            .values()
            .map(|(tenant, claims)| TenantRecord {
                tenant: tenant.clone(),
                claimed_ips: claims.clone(),
            })
            .collect())
    }

    fn update_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateTenant)?;
        let mut inner = self.inner.lock().unwrap();
        match inner.tenants.get_mut(&tenant.id) {
            Some((stored, _)) => {
                *stored = tenant.clone();
                Ok(())
            }
            None => Err(StoreError::Integrity(format!(
                "no tenant row {}",
                tenant.id
            ))),
        }
    }

    fn delete_tenant(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteTenant)?;
        self.inner.lock().unwrap().tenants.remove(&id);
        Ok(())
    }

    fn claim_tenant_ip(
        &self,
        tenant_id: Uuid,
        ip: TenantIp,
    ) -> Result<(), StoreError> {
        self.claim_tenant_ips(tenant_id, &[ip])
    }

    fn claim_tenant_ips(
        &self,
        tenant_id: Uuid,
        ips: &[TenantIp],
    ) -> Result<(), StoreError> {
        self.check(FailPoint::ClaimTenantIps)?;
        let mut inner = self.inner.lock().unwrap();
        match inner.tenants.get_mut(&tenant_id) {
            Some((_, claims)) => {
                claims.extend_from_slice(ips);
                Ok(())
            }
            None => Err(StoreError::Integrity(format!(
                "no tenant row {}",
                tenant_id
            ))),
        }
    }

    fn release_tenant_ip(
        &self,
        tenant_id: Uuid,
        ip: TenantIp,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::ReleaseTenantIp)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, claims)) = inner.tenants.get_mut(&tenant_id) {
            claims.retain(|claim| *claim != ip);
        }
        Ok(())
    }

    fn get_instances(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.inner.lock().unwrap().instances.values().cloned().collect())
    }

    fn add_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.check(FailPoint::AddInstance)?;
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn update_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateInstance)?;
        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn delete_instance(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteInstance)?;
        self.inner.lock().unwrap().instances.remove(&id);
        Ok(())
    }

    fn add_node_stat(
        &self,
        _report: &NodeStatReport,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::AddNodeStat)?;
        self.inner.lock().unwrap().node_stats += 1;
        Ok(())
    }

    fn add_instance_stats(
        &self,
        stats: &[InstanceStatReport],
        _node_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::AddInstanceStats)?;
        self.inner.lock().unwrap().instance_stats += stats.len();
        Ok(())
    }

    fn add_frame_stat(&self, frame: &FrameTrace) -> Result<(), StoreError> {
        self.inner.lock().unwrap().frames.push(frame.clone());
        Ok(())
    }

    fn get_batch_frame_summary(
        &self,
    ) -> Result<Vec<BatchFrameSummary>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for frame in &inner.frames {
            *counts.entry(frame.label.clone()).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(batch_id, count)| BatchFrameSummary { batch_id, count })
            .collect())
    }

    fn get_batch_frame_statistics(
        &self,
        label: &str,
    ) -> Result<Vec<BatchFrameStat>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let elapsed: Vec<f64> = inner
            .frames
            .iter()
            .filter(|frame| frame.label == label)
            .map(|frame| {
                (frame.end - frame.start).num_milliseconds() as f64
            })
            .collect();
        if elapsed.is_empty() {
            return Ok(Vec::new());
        }
        let total: f64 = elapsed.iter().sum();
        let average = total / elapsed.len() as f64;
        let variance = elapsed
            .iter()
            .map(|value| (value - average) * (value - average))
            .sum::<f64>()
            / elapsed.len() as f64;
        Ok(vec![BatchFrameStat {
            num_instances: elapsed.len() as u64,
            total_elapsed_ms: total,
            average_elapsed_ms: average,
            variance_ms: variance,
        }])
    }

    fn get_workload_storage(
        &self,
        id: Uuid,
    ) -> Result<Vec<StorageResource>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .workloads
            .get(&id)
            .map(|workload| workload.storage.clone())
            .unwrap_or_default())
    }

    fn get_all_block_data(
        &self,
    ) -> Result<HashMap<Uuid, Volume>, StoreError> {
        Ok(self.inner.lock().unwrap().volumes.clone())
    }

    fn add_block_data(&self, volume: &Volume) -> Result<(), StoreError> {
        self.check(FailPoint::AddBlockData)?;
        let mut inner = self.inner.lock().unwrap();
        inner.volumes.insert(volume.id, volume.clone());
        Ok(())
    }

    fn update_block_data(&self, volume: &Volume) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateBlockData)?;
        let mut inner = self.inner.lock().unwrap();
        inner.volumes.insert(volume.id, volume.clone());
        Ok(())
    }

    fn delete_block_data(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteBlockData)?;
        self.inner.lock().unwrap().volumes.remove(&id);
        Ok(())
    }

    fn get_tenant_devices(
        &self,
        tenant_id: Uuid,
    ) -> Result<HashMap<Uuid, Volume>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .volumes
            .iter()
            .filter(|(_, volume)| volume.tenant_id == tenant_id)
            .map(|(id, volume)| (*id, volume.clone()))
            .collect())
    }

    fn add_storage_attachment(
        &self,
        attachment: &Attachment,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::AddStorageAttachment)?;
        let mut inner = self.inner.lock().unwrap();
        inner.attachments.insert(attachment.id, attachment.clone());
        Ok(())
    }

    fn get_all_storage_attachments(
        &self,
    ) -> Result<HashMap<Uuid, Attachment>, StoreError> {
        Ok(self.inner.lock().unwrap().attachments.clone())
    }

    fn delete_storage_attachment(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteStorageAttachment)?;
        self.inner.lock().unwrap().attachments.remove(&id);
        Ok(())
    }

    fn add_pool(&self, pool: &Pool) -> Result<(), StoreError> {
        self.check(FailPoint::AddPool)?;
        self.inner.lock().unwrap().pools.insert(pool.id, pool.clone());
        Ok(())
    }

    fn update_pool(&self, pool: &Pool) -> Result<(), StoreError> {
        self.check(FailPoint::UpdatePool)?;
        self.inner.lock().unwrap().pools.insert(pool.id, pool.clone());
        Ok(())
    }

    fn get_all_pools(&self) -> Result<HashMap<Uuid, Pool>, StoreError> {
        Ok(self.inner.lock().unwrap().pools.clone())
    }

    fn delete_pool(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeletePool)?;
        self.inner.lock().unwrap().pools.remove(&id);
        Ok(())
    }

    fn add_mapped_ip(&self, mapping: &MappedIp) -> Result<(), StoreError> {
        self.check(FailPoint::AddMappedIp)?;
        let mut inner = self.inner.lock().unwrap();
        inner.mapped_ips.insert(mapping.external_ip, mapping.clone());
        Ok(())
    }

    fn delete_mapped_ip(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteMappedIp)?;
        let mut inner = self.inner.lock().unwrap();
        inner.mapped_ips.retain(|_, mapping| mapping.id != id);
        Ok(())
    }

    fn get_mapped_ips(
        &self,
    ) -> Result<HashMap<Ipv4Addr, MappedIp>, StoreError> {
        Ok(self.inner.lock().unwrap().mapped_ips.clone())
    }

    fn update_quotas(
        &self,
        tenant_id: Uuid,
        quotas: &[QuotaDetails],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.quotas.insert(tenant_id, quotas.to_vec());
        Ok(())
    }

    fn get_quotas(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<QuotaDetails>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.quotas.get(&tenant_id).cloned().unwrap_or_default())
    }

    fn update_image(&self, image: &Image) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateImage)?;
        self.inner.lock().unwrap().images.insert(image.id, image.clone());
        Ok(())
    }

    fn delete_image(&self, id: Uuid) -> Result<(), StoreError> {
        self.check(FailPoint::DeleteImage)?;
        self.inner.lock().unwrap().images.remove(&id);
        Ok(())
    }

    fn get_images(&self) -> Result<Vec<Image>, StoreError> {
        Ok(self.inner.lock().unwrap().images.values().cloned().collect())
    }
}

/*
 * Fixtures.
 */

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A datastore over a fresh [`MemStore`]; the store handle is returned for
/// fault injection and row inspection.
pub fn test_datastore() -> (Arc<MemStore>, Datastore) {
    let store = Arc::new(MemStore::new());
    let config = Config::new("mem://");
    let datastore =
        Datastore::init(&config, store.clone(), test_logger()).unwrap();
    (store, datastore)
}

/// Reopens a datastore over an existing store, as a controller restart
/// would.
pub fn reopen_datastore(store: &Arc<MemStore>) -> Datastore {
    let config = Config::new("mem://");
    Datastore::init(&config, store.clone(), test_logger()).unwrap()
}

/// Adds a tenant with a /24 private space and returns its id.
pub fn test_tenant(datastore: &Datastore) -> Uuid {
    let id = Uuid::new_v4();
    let config =
        TenantConfig { name: format!("tenant-{}", id), subnet_bits: 24 };
    datastore.add_tenant(id, config).unwrap();
    id
}

pub fn test_instance(tenant_id: Uuid, ip: Ipv4Addr) -> Instance {
    let id = Uuid::new_v4();
    Instance {
        id,
        tenant_id,
        workload_id: Uuid::new_v4(),
        node_id: None,
        name: format!("instance-{}", id),
        state: InstanceState::Pending,
        ip_address: ip,
        mac_address: address::tenant_hardware_addr(ip),
        ssh_ip: None,
        ssh_port: 0,
        cnci: false,
        subnet: None,
        created: Utc::now(),
    }
}

pub fn test_volume(tenant_id: Uuid) -> Volume {
    Volume {
        id: Uuid::new_v4(),
        tenant_id,
        name: String::from("data"),
        description: String::new(),
        size_gb: 20,
        state: VolumeState::Available,
        bootable: false,
        internal: false,
        created: Utc::now(),
    }
}

pub fn test_image(
    tenant_id: Option<Uuid>,
    name: &str,
    visibility: Visibility,
) -> Image {
    Image {
        id: Uuid::new_v4(),
        tenant_id,
        name: name.to_owned(),
        visibility,
        size_bytes: 1 << 30,
        created: Utc::now(),
    }
}

pub fn test_workload(
    tenant_id: Option<Uuid>,
    visibility: Visibility,
) -> Workload {
    Workload {
        id: Uuid::new_v4(),
        tenant_id,
        description: String::from("small VM"),
        fw_type: FirmwareType::Legacy,
        vm_type: VmType::Qemu,
        config: String::from("#cloud-config\n"),
        requirements: WorkloadRequirements {
            vcpus: 2,
            mem_mb: 512,
            network_node: false,
        },
        storage: Vec::new(),
        visibility,
    }
}
