// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The datastore facade.
//!
//! [`Datastore`] caches the controller's entire working set in memory and
//! mirrors every mutation to the persistent store, with the persistent write
//! always preceding the cache commit.  Each entity table is guarded by its
//! own reader/writer lock; per-tenant and per-node relations hold entity ids
//! only and are dereferenced through the owning table.
//!
//! Every write path follows the same discipline: take the primary table's
//! writer lock, validate invariants against the caches, issue the persistent
//! write, and commit the cache only on success.  Cascading cleanup steps
//! that run after a successful persistent delete are best-effort: their
//! failures are logged and the first one is surfaced, so that a retry
//! converges toward consistency.

mod external_ip;
mod image;
mod instance;
mod node;
mod storage;
mod tenant;
mod workload;

pub use tenant::TenantIpAllocation;

use crate::config::Config;
use crate::error::Error;
use crate::network::TenantNetworkController;
use crate::store::PersistentStore;
use crate::types::{
    Attachment, BatchFrameStat, BatchFrameSummary, EventType, FrameTrace,
    Image, Instance, InstanceStats, LogEntry, MappedIp, Node, NodeStatus,
    Pool, QuotaDetails, StorageResource, Tenant, TenantUsage, Visibility,
    Volume, Workload,
};
use chrono::Utc;
use ipnetwork::Ipv4Network;
use slog::{info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// A tenant and its owned relations.  Relations reference entities by id;
/// the records live in the corresponding top-level tables.
pub(crate) struct TenantState {
    pub tenant: Tenant,
    /// Handle to this tenant's network controller, if one is attached.
    pub controller: Option<Arc<dyn TenantNetworkController>>,
    /// Subnet base -> in-use host addresses, both big-endian u32.
    pub network: BTreeMap<u32, BTreeSet<u32>>,
    pub instances: BTreeSet<Uuid>,
    pub devices: BTreeSet<Uuid>,
    pub workloads: Vec<Uuid>,
    pub images: Vec<Uuid>,
}

impl TenantState {
    fn new(tenant: Tenant) -> TenantState {
        TenantState {
            tenant,
            controller: None,
            network: BTreeMap::new(),
            instances: BTreeSet::new(),
            devices: BTreeSet::new(),
            workloads: Vec::new(),
            images: Vec::new(),
        }
    }
}

pub(crate) struct NodeState {
    pub node: Node,
    pub instances: BTreeSet<Uuid>,
}

impl NodeState {
    fn new(id: Uuid) -> NodeState {
        NodeState {
            node: Node { id, ..Node::default() },
            instances: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct WorkloadTable {
    pub workloads: HashMap<Uuid, Workload>,
    pub public: Vec<Uuid>,
}

#[derive(Default)]
pub(crate) struct ImageTable {
    pub images: HashMap<Uuid, Image>,
    pub public: Vec<Uuid>,
    pub internal: Vec<Uuid>,
}

#[derive(Default)]
pub(crate) struct AttachmentTable {
    pub attachments: HashMap<Uuid, Attachment>,
    /// Secondary index enforcing at most one attachment per pair.
    pub instance_volumes: HashMap<(Uuid, Uuid), Uuid>,
}

#[derive(Default)]
pub(crate) struct PoolTable {
    pub pools: HashMap<Uuid, Pool>,
    /// Every subnet owned by any pool.
    pub subnets: HashSet<Ipv4Network>,
    /// Every individual address owned by any pool.
    pub addresses: HashSet<Ipv4Addr>,
    /// Current mappings, keyed by external address.
    pub mapped: HashMap<Ipv4Addr, MappedIp>,
}

/// The in-memory, write-through state store for the controller.
///
/// Lock ordering: when more than one table lock is held at once, locks are
/// acquired in declaration order below -- workloads, tenants, instances,
/// nodes, block_devices, attachments, pools, images, instance_last_stat,
/// node_last_stat, tenant_usage.  A lock earlier in that order is never
/// acquired while a later one is held.
pub struct Datastore {
    log: Logger,
    db: Arc<dyn PersistentStore>,

    /// The CNCI workload template; generated in memory, never persisted.
    cnci_workload: RwLock<Option<Workload>>,

    workloads: RwLock<WorkloadTable>,
    tenants: RwLock<HashMap<Uuid, TenantState>>,
    instances: RwLock<HashMap<Uuid, Instance>>,
    nodes: RwLock<HashMap<Uuid, NodeState>>,
    block_devices: RwLock<HashMap<Uuid, Volume>>,
    attachments: RwLock<AttachmentTable>,
    pools: RwLock<PoolTable>,
    images: RwLock<ImageTable>,
    instance_last_stat: RwLock<HashMap<Uuid, InstanceStats>>,
    node_last_stat: RwLock<HashMap<Uuid, NodeStatus>>,
    tenant_usage: RwLock<HashMap<Uuid, Vec<TenantUsage>>>,
}

impl Datastore {
    /// Connects the persistent store and fills every cache table from it.
    ///
    /// Cross-table consistency is verified while loading: an image or
    /// workload naming an unknown tenant fails initialization with
    /// [`Error::Inconsistent`].
    pub fn init(
        config: &Config,
        db: Arc<dyn PersistentStore>,
        log: Logger,
    ) -> Result<Datastore, Error> {
        db.init(config)?;
        let log = log.new(o!("component" => "datastore"));

        let mut instances = HashMap::new();
        for instance in db.get_instances()? {
            instances.insert(instance.id, instance);
        }

        let mut tenants = HashMap::new();
        for record in db.get_tenants()? {
            let mut state = TenantState::new(record.tenant);
            for ip in record.claimed_ips {
                state
                    .network
                    .entry(ip.subnet)
                    .or_insert_with(BTreeSet::new)
                    .insert(ip.host);
            }
            tenants.insert(state.tenant.id, state);
        }

        // Nodes are not persisted directly; rebuild them from the instances
        // that reference them, and link each instance into its owners.
        let mut nodes: HashMap<Uuid, NodeState> = HashMap::new();
        for instance in instances.values() {
            if let Some(node_id) = instance.node_id {
                nodes
                    .entry(node_id)
                    .or_insert_with(|| NodeState::new(node_id))
                    .instances
                    .insert(instance.id);
            }

            match tenants.get_mut(&instance.tenant_id) {
                Some(state) => {
                    state.instances.insert(instance.id);
                }
                None => {
                    warn!(log, "instance references unknown tenant";
                        "instance_id" => %instance.id,
                        "tenant_id" => %instance.tenant_id);
                }
            }
        }

        let mut images = ImageTable::default();
        for image in db.get_images()? {
            if let Some(tenant_id) = image.tenant_id {
                let state = tenants.get_mut(&tenant_id).ok_or_else(|| {
                    Error::inconsistent(format!(
                        "image {} references unknown tenant {}",
                        image.id, tenant_id
                    ))
                })?;
                state.images.push(image.id);
            }
            match image.visibility {
                Visibility::Public => images.public.push(image.id),
                Visibility::Internal => images.internal.push(image.id),
                Visibility::Private => (),
            }
            images.images.insert(image.id, image);
        }

        let mut workloads = WorkloadTable::default();
        for wl in db.get_workloads()? {
            if let Some(tenant_id) = wl.tenant_id {
                let state = tenants.get_mut(&tenant_id).ok_or_else(|| {
                    Error::inconsistent(format!(
                        "workload {} references unknown tenant {}",
                        wl.id, tenant_id
                    ))
                })?;
                state.workloads.push(wl.id);
            }
            if wl.visibility == Visibility::Public {
                workloads.public.push(wl.id);
            }
            workloads.workloads.insert(wl.id, wl);
        }

        let block_devices = db.get_all_block_data()?;
        for volume in block_devices.values() {
            match tenants.get_mut(&volume.tenant_id) {
                Some(state) => {
                    state.devices.insert(volume.id);
                }
                None => {
                    warn!(log, "volume references unknown tenant";
                        "volume_id" => %volume.id,
                        "tenant_id" => %volume.tenant_id);
                }
            }
        }

        let mut attachments = AttachmentTable {
            attachments: db.get_all_storage_attachments()?,
            instance_volumes: HashMap::new(),
        };
        for attachment in attachments.attachments.values() {
            attachments.instance_volumes.insert(
                (attachment.instance_id, attachment.volume_id),
                attachment.id,
            );
        }

        let mut pools = PoolTable {
            pools: db.get_all_pools()?,
            subnets: HashSet::new(),
            addresses: HashSet::new(),
            mapped: db.get_mapped_ips()?,
        };
        for pool in pools.pools.values() {
            for subnet in &pool.subnets {
                pools.subnets.insert(subnet.cidr);
            }
            for ip in &pool.ips {
                pools.addresses.insert(ip.address);
            }
        }

        info!(log, "datastore initialized";
            "tenants" => tenants.len(),
            "instances" => instances.len(),
            "pools" => pools.pools.len());

        Ok(Datastore {
            log,
            db,
            cnci_workload: RwLock::new(None),
            workloads: RwLock::new(workloads),
            tenants: RwLock::new(tenants),
            instances: RwLock::new(instances),
            nodes: RwLock::new(nodes),
            block_devices: RwLock::new(block_devices),
            attachments: RwLock::new(attachments),
            pools: RwLock::new(pools),
            images: RwLock::new(images),
            instance_last_stat: RwLock::new(HashMap::new()),
            node_last_stat: RwLock::new(HashMap::new()),
            tenant_usage: RwLock::new(HashMap::new()),
        })
    }

    /// Disconnects the backing store.
    pub fn exit(&self) {
        self.db.disconnect();
    }

    /*
     * Event log.  Entries are not cached; they pass straight through.
     */

    pub fn log_event(
        &self,
        tenant_id: Option<Uuid>,
        message: &str,
    ) -> Result<(), Error> {
        self.log_event_entry(tenant_id, None, EventType::Info, message.to_owned())
    }

    pub fn log_error(
        &self,
        tenant_id: Option<Uuid>,
        message: &str,
    ) -> Result<(), Error> {
        self.log_event_entry(
            tenant_id,
            None,
            EventType::Error,
            message.to_owned(),
        )
    }

    pub(crate) fn log_event_entry(
        &self,
        tenant_id: Option<Uuid>,
        node_id: Option<Uuid>,
        event_type: EventType,
        message: String,
    ) -> Result<(), Error> {
        let entry = LogEntry {
            tenant_id,
            node_id,
            event_type,
            message,
            timestamp: Utc::now(),
        };
        Ok(self.db.log_event(entry)?)
    }

    pub fn get_event_log(&self) -> Result<Vec<LogEntry>, Error> {
        Ok(self.db.get_event_log()?)
    }

    pub fn clear_log(&self) -> Result<(), Error> {
        Ok(self.db.clear_log()?)
    }

    /*
     * Quotas are stored without caching.
     */

    pub fn get_quotas(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<QuotaDetails>, Error> {
        Ok(self.db.get_quotas(tenant_id)?)
    }

    pub fn update_quotas(
        &self,
        tenant_id: Uuid,
        quotas: &[QuotaDetails],
    ) -> Result<(), Error> {
        Ok(self.db.update_quotas(tenant_id, quotas)?)
    }

    /*
     * Frame statistics pass straight through to the persistent store.
     */

    /// Stores trace frames; every frame is attempted and the first error is
    /// surfaced.
    pub fn handle_trace_report(
        &self,
        frames: &[FrameTrace],
    ) -> Result<(), Error> {
        let mut result = Ok(());
        for frame in frames {
            if let Err(error) = self.db.add_frame_stat(frame) {
                warn!(self.log, "error adding frame stat";
                    "label" => &frame.label, "error" => %error);
                if result.is_ok() {
                    result = Err(Error::from(error));
                }
            }
        }
        result
    }

    pub fn get_batch_frame_summary(
        &self,
    ) -> Result<Vec<BatchFrameSummary>, Error> {
        Ok(self.db.get_batch_frame_summary()?)
    }

    pub fn get_batch_frame_statistics(
        &self,
        label: &str,
    ) -> Result<Vec<BatchFrameStat>, Error> {
        Ok(self.db.get_batch_frame_statistics(label)?)
    }

    /// Returns the storage resources a workload requires.
    pub fn get_workload_storage(
        &self,
        id: Uuid,
    ) -> Result<Vec<StorageResource>, Error> {
        Ok(self.db.get_workload_storage(id)?)
    }
}
