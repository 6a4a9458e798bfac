// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Model types for the controller state store.
//!
//! These are the objects the datastore caches and writes through to the
//! persistent store.  They are plain data: relationships between entities are
//! expressed with ids and resolved through the datastore's tables, never with
//! shared pointers.

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/*
 * TENANTS
 */

/// Default CIDR size for a tenant's private networks.
pub const DEFAULT_SUBNET_BITS: u8 = 24;

/// User-supplied configuration for a tenant.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TenantConfig {
    pub name: String,
    /// Mask width for the tenant's private subnets.  Must be within
    /// 4..=30; immutable while the tenant has instances.
    #[serde(default = "default_subnet_bits")]
    pub subnet_bits: u8,
}

fn default_subnet_bits() -> u8 {
    DEFAULT_SUBNET_BITS
}

impl Default for TenantConfig {
    fn default() -> TenantConfig {
        TenantConfig { name: String::new(), subnet_bits: DEFAULT_SUBNET_BITS }
    }
}

/// Fields of a tenant that can be changed after creation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TenantConfigUpdate {
    pub name: Option<String>,
    pub subnet_bits: Option<u8>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub subnet_bits: u8,
    pub created: DateTime<Utc>,
}

/// A claimed private address, recorded as the subnet base plus the absolute
/// host address, both as big-endian u32 values.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TenantIp {
    pub subnet: u32,
    pub host: u32,
}

/*
 * INSTANCES
 */

/// Runtime state of an instance as last reported or assigned.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Exited,
    Missing,
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Exited => "exited",
            InstanceState::Missing => "missing",
        };
        write!(f, "{}", s)
    }
}

/// A compute instance.
///
/// An instance with `cnci` set is the tenant's network controller; it is
/// excluded from user-visible listings and holds no allocation in the
/// tenant's private address space.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workload_id: Uuid,
    /// Node the instance currently runs on; cleared when the instance exits
    /// or its node is removed.
    pub node_id: Option<Uuid>,
    pub name: String,
    pub state: InstanceState,
    pub ip_address: Ipv4Addr,
    pub mac_address: MacAddr,
    pub ssh_ip: Option<IpAddr>,
    pub ssh_port: u16,
    pub cnci: bool,
    /// For CNCI instances, the tenant subnet this controller serves.
    pub subnet: Option<Ipv4Network>,
    pub created: DateTime<Utc>,
}

/*
 * NODES
 */

bitflags::bitflags! {
    /// Roles a node has announced.  A node keeps the union of every role it
    /// has ever reported.
    #[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
    pub struct NodeRole: u8 {
        const COMPUTE = 1 << 0;
        const NETWORK_AGENT = 1 << 1;
    }
}

impl Default for NodeRole {
    fn default() -> NodeRole {
        NodeRole::empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Node {
    pub id: Uuid,
    pub hostname: String,
    pub role: NodeRole,
    /// Cumulative failure counters, preserved across stat reports.
    pub total_failures: u32,
    pub start_failures: u32,
    pub attach_volume_failures: u32,
    pub delete_failures: u32,
}

/// Per-node instance counts, CNCIs excluded.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeSummary {
    pub node_id: Uuid,
    pub total_instances: usize,
    pub total_pending_instances: usize,
    pub total_running_instances: usize,
    pub total_exited_instances: usize,
    pub total_failures: u32,
}

/*
 * VOLUMES AND ATTACHMENTS
 */

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Detaching,
}

/// A block volume.  Volumes carry no reference to an instance; the binding
/// lives in [`Attachment`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Volume {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: String,
    pub size_gb: u64,
    pub state: VolumeState,
    pub bootable: bool,
    pub internal: bool,
    pub created: DateTime<Utc>,
}

/// The binding of a volume to an instance.  At most one attachment may exist
/// per (instance, volume) pair.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Attachment {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub volume_id: Uuid,
    pub ephemeral: bool,
    pub boot: bool,
}

/*
 * EXTERNAL IP POOLS
 */

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PoolSubnet {
    pub id: Uuid,
    pub cidr: Ipv4Network,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PoolAddress {
    pub id: Uuid,
    pub address: Ipv4Addr,
}

/// An operator-provisioned pool of external addresses.
///
/// `free` counts addresses not currently mapped to an instance; a pool may
/// only be deleted when `free == total_ips`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pool {
    pub id: Uuid,
    pub name: String,
    pub total_ips: u32,
    pub free: u32,
    pub subnets: Vec<PoolSubnet>,
    pub ips: Vec<PoolAddress>,
}

/// The association of an external address with an instance, keyed by the
/// external address.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MappedIp {
    pub id: Uuid,
    pub external_ip: Ipv4Addr,
    pub internal_ip: Ipv4Addr,
    pub instance_id: Uuid,
    pub tenant_id: Uuid,
    pub pool_id: Uuid,
    pub pool_name: String,
}

/*
 * IMAGES AND WORKLOADS
 */

/// Visibility namespace for images and workloads.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to a single tenant.
    Private,
    /// Visible to all tenants.
    Public,
    /// Visible to the system only; includes the CNCI template.
    Internal,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Image {
    pub id: Uuid,
    /// Owning tenant for private images; unset for public and internal ones.
    pub tenant_id: Option<Uuid>,
    pub name: String,
    pub visibility: Visibility,
    pub size_bytes: u64,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareType {
    Efi,
    Legacy,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Qemu,
    Docker,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct WorkloadRequirements {
    pub vcpus: u32,
    pub mem_mb: u64,
    /// The workload must be scheduled onto a network-agent node.
    pub network_node: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageSource {
    Image,
    Volume,
    Empty,
}

/// Storage required to boot or run a workload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StorageResource {
    pub id: Option<Uuid>,
    pub bootable: bool,
    pub ephemeral: bool,
    pub size_gb: u64,
    pub source_type: StorageSource,
    pub source_id: Option<Uuid>,
    pub internal: bool,
}

/// A template describing how to launch instances.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Workload {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub description: String,
    pub fw_type: FirmwareType,
    pub vm_type: VmType,
    /// Cloud-init payload handed to launched instances.
    pub config: String,
    pub requirements: WorkloadRequirements,
    pub storage: Vec<StorageResource>,
    pub visibility: Visibility,
}

/*
 * EVENTS AND QUOTAS
 */

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Info,
    Error,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogEntry {
    pub tenant_id: Option<Uuid>,
    pub node_id: Option<Uuid>,
    pub event_type: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuotaDetails {
    pub name: String,
    pub value: i64,
    pub usage: i64,
}

/*
 * STATISTICS
 */

/// A stat report from a node agent.  `load == -1` means the node-level
/// portion of the report is absent and only instance samples are carried.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeStatReport {
    pub node_id: Uuid,
    pub hostname: String,
    pub load: i64,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub cpus_online: i64,
    pub instances: Vec<InstanceStatReport>,
}

/// A per-instance sample within a node stat report.  Usage values may be
/// reported negative by agents that cannot measure a dimension; they are
/// clamped to zero on ingestion.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstanceStatReport {
    pub instance_id: Uuid,
    pub state: InstanceState,
    pub ssh_ip: Option<IpAddr>,
    pub ssh_port: u16,
    pub cpu_usage: i64,
    pub memory_usage_mb: i64,
    pub disk_usage_mb: i64,
}

/// The last node-level stat received, with the node's cumulative failure
/// counters folded in.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeStatus {
    pub id: Uuid,
    pub hostname: String,
    pub load: i64,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    pub online_cpus: i64,
    pub total_failures: u32,
    pub start_failures: u32,
    pub attach_volume_failures: u32,
    pub delete_failures: u32,
}

/// Absolute resource counts from a single sample.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceCounts {
    pub vcpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

/// The last stat recorded for an instance.
///
/// `usage` is `None` until the first agent report arrives: the first sample
/// establishes the baseline and folds no delta into tenant usage.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstanceStats {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub node_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub state: InstanceState,
    pub usage: Option<ResourceCounts>,
}

/// One entry in a tenant's usage history.  Values are cumulative sums of the
/// per-instance deltas folded in since the controller started.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct TenantUsage {
    pub timestamp: DateTime<Utc>,
    pub vcpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

/// Summary of a tenant's network controller instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TenantCnci {
    pub tenant_id: Uuid,
    pub instance_id: Uuid,
    pub ip_address: Ipv4Addr,
    pub mac_address: MacAddr,
    pub subnets: Vec<Ipv4Network>,
}

/*
 * FRAME TRACING
 */

/// A single traced frame, forwarded to the persistent store unmodified.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FrameTrace {
    pub label: String,
    pub instance_id: Option<Uuid>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchFrameSummary {
    pub batch_id: String,
    pub count: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchFrameStat {
    pub num_instances: u64,
    pub total_elapsed_ms: f64,
    pub average_elapsed_ms: f64,
    pub variance_ms: f64,
}

/*
 * FAILURE REASONS
 */

/// Why an instance failed to start, as reported by the launching agent.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFailureReason {
    FullCloud,
    FullComputeNode,
    NoComputeNodes,
    NoNetworkNodes,
    InvalidPayload,
    InvalidData,
    AlreadyRunning,
    InstanceExists,
    ImageFailure,
    LaunchFailure,
    NetworkFailure,
}

impl StartFailureReason {
    /// Fatal failures remove the instance; transient ones (capacity, an
    /// instance already running) leave it for a retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            StartFailureReason::FullCloud
            | StartFailureReason::FullComputeNode
            | StartFailureReason::NoComputeNodes
            | StartFailureReason::NoNetworkNodes
            | StartFailureReason::AlreadyRunning
            | StartFailureReason::InstanceExists => false,
            StartFailureReason::InvalidPayload
            | StartFailureReason::InvalidData
            | StartFailureReason::ImageFailure
            | StartFailureReason::LaunchFailure
            | StartFailureReason::NetworkFailure => true,
        }
    }
}

impl Display for StartFailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let s = match self {
            StartFailureReason::FullCloud => "cloud is full",
            StartFailureReason::FullComputeNode => "compute node is full",
            StartFailureReason::NoComputeNodes => "no compute nodes available",
            StartFailureReason::NoNetworkNodes => "no network nodes available",
            StartFailureReason::InvalidPayload => "invalid payload",
            StartFailureReason::InvalidData => "invalid data",
            StartFailureReason::AlreadyRunning => "instance already running",
            StartFailureReason::InstanceExists => "instance already exists",
            StartFailureReason::ImageFailure => "image could not be prepared",
            StartFailureReason::LaunchFailure => "launch failed",
            StartFailureReason::NetworkFailure => "network setup failed",
        };
        write!(f, "{}", s)
    }
}

/// Why attaching a volume failed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachVolumeFailureReason {
    NoInstance,
    InvalidVolume,
    AttachFailure,
    StateFailure,
}

impl Display for AttachVolumeFailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let s = match self {
            AttachVolumeFailureReason::NoInstance => "instance does not exist",
            AttachVolumeFailureReason::InvalidVolume => "volume is not valid",
            AttachVolumeFailureReason::AttachFailure => "attach failed",
            AttachVolumeFailureReason::StateFailure => {
                "volume is in the wrong state"
            }
        };
        write!(f, "{}", s)
    }
}

/*
 * MAC ADDRESSES
 */

/// A Media Access Control address.
// The `macaddr` crate provides the representation; this wrapper pins down
// the string serialization used throughout the API.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub macaddr::MacAddr6);

impl TryFrom<String> for MacAddr {
    type Error = macaddr::ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse().map(MacAddr)
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> String {
        mac.to_string()
    }
}

impl std::ops::Deref for MacAddr {
    type Target = macaddr::MacAddr6;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mac_addr_round_trip() {
        let mac =
            MacAddr::try_from(String::from("02:00:ac:10:00:02")).unwrap();
        assert_eq!(mac, MacAddr(macaddr::MacAddr6::new(2, 0, 172, 16, 0, 2)));
        assert!(MacAddr::try_from(String::from("not-a-mac")).is_err());
    }

    #[test]
    fn test_fatal_start_failure_reasons() {
        assert!(StartFailureReason::LaunchFailure.is_fatal());
        assert!(!StartFailureReason::FullCloud.is_fatal());
    }

    #[test]
    fn test_subnet_bits_default() {
        let config: TenantConfig =
            serde_json::from_str("{\"name\": \"alpha\"}").unwrap();
        assert_eq!(config.subnet_bits, DEFAULT_SUBNET_BITS);
    }
}
