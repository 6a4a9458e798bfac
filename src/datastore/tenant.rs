// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tenant records and the tenant private-IP allocator.
//!
//! A tenant's address space starts at 172.16.0.0 masked by its subnet-bits
//! and spans one 2^20-address region.  Within each subnet, host index 0
//! (network), 1 (gateway) and the highest index (broadcast) are reserved.
//! Allocation is split into a claim phase under the tenants lock and an
//! activation phase after it is dropped, because waiting for a subnet to
//! come up on the fabric can block indefinitely.

use crate::address;
use crate::datastore::{Datastore, TenantState};
use crate::error::Error;
use crate::network::TenantNetworkController;
use crate::types::{
    Tenant, TenantConfig, TenantConfigUpdate, TenantIp, DEFAULT_SUBNET_BITS,
};
use chrono::Utc;
use slog::warn;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use uuid::Uuid;

/// The result of a pool allocation.
///
/// When `activation_error` is set, the addresses were claimed but at least
/// one subnet could not be confirmed active; the claim stands and the caller
/// decides whether to proceed or release.
#[derive(Debug)]
pub struct TenantIpAllocation {
    pub addresses: Vec<Ipv4Addr>,
    pub activation_error: Option<Error>,
}

impl Datastore {
    /// Creates a tenant.  `subnet_bits` of zero selects the default; values
    /// outside 4..=30 are rejected.
    pub fn add_tenant(
        &self,
        id: Uuid,
        mut config: TenantConfig,
    ) -> Result<Tenant, Error> {
        if config.subnet_bits == 0 {
            config.subnet_bits = DEFAULT_SUBNET_BITS;
        }
        if config.subnet_bits < 4 || config.subnet_bits > 30 {
            return Err(Error::invalid_request(
                "subnet bits must be between 4 and 30",
            ));
        }

        let mut tenants = self.tenants.write().unwrap();
        if tenants.contains_key(&id) {
            return Err(Error::DuplicateTenant);
        }

        self.db.add_tenant(id, &config)?;

        let tenant = Tenant {
            id,
            name: config.name,
            subnet_bits: config.subnet_bits,
            created: Utc::now(),
        };
        tenants.insert(id, TenantState::new(tenant.clone()));
        Ok(tenant)
    }

    /// Removes a tenant.  The tenant must no longer own instances, volumes,
    /// images or workloads.
    pub fn delete_tenant(&self, id: Uuid) -> Result<(), Error> {
        let mut tenants = self.tenants.write().unwrap();
        let state = tenants.get(&id).ok_or(Error::TenantNotFound)?;
        if !state.instances.is_empty()
            || !state.devices.is_empty()
            || !state.images.is_empty()
            || !state.workloads.is_empty()
        {
            return Err(Error::invalid_request(
                "tenant still owns instances, volumes, images or workloads",
            ));
        }

        self.db.delete_tenant(id)?;
        tenants.remove(&id);
        Ok(())
    }

    pub fn get_tenant(&self, id: Uuid) -> Result<Tenant, Error> {
        let tenants = self.tenants.read().unwrap();
        tenants
            .get(&id)
            .map(|state| state.tenant.clone())
            .ok_or(Error::TenantNotFound)
    }

    pub fn get_all_tenants(&self) -> Vec<Tenant> {
        let tenants = self.tenants.read().unwrap();
        tenants.values().map(|state| state.tenant.clone()).collect()
    }

    /// Applies an update to a tenant's configuration.  The subnet width is
    /// immutable while the tenant has instances.
    pub fn update_tenant_config(
        &self,
        id: Uuid,
        update: TenantConfigUpdate,
    ) -> Result<Tenant, Error> {
        let mut tenants = self.tenants.write().unwrap();
        let state = tenants.get_mut(&id).ok_or(Error::TenantNotFound)?;

        if let Some(bits) = update.subnet_bits {
            if bits < 4 || bits > 30 {
                return Err(Error::invalid_request(
                    "subnet bits must be between 4 and 30",
                ));
            }
            if bits != state.tenant.subnet_bits
                && !state.instances.is_empty()
            {
                return Err(Error::invalid_request(
                    "subnet bits cannot change while instances exist",
                ));
            }
        }

        let mut tenant = state.tenant.clone();
        if let Some(name) = update.name {
            tenant.name = name;
        }
        if let Some(bits) = update.subnet_bits {
            tenant.subnet_bits = bits;
        }

        self.db.update_tenant(&tenant)?;
        state.tenant = tenant.clone();
        Ok(tenant)
    }

    /// Hands the tenant a handle to its network controller.  Subnet
    /// activation and teardown requests go through this handle.
    pub fn attach_network_controller(
        &self,
        id: Uuid,
        controller: Arc<dyn TenantNetworkController>,
    ) -> Result<(), Error> {
        let mut tenants = self.tenants.write().unwrap();
        let state = tenants.get_mut(&id).ok_or(Error::TenantNotFound)?;
        state.controller = Some(controller);
        Ok(())
    }

    /// Claims `num` private addresses for a tenant and activates any subnet
    /// they touch.
    ///
    /// The claim accumulates entirely under the tenants lock and is written
    /// through with a single bulk claim; on persistent failure every
    /// in-memory mark is rolled back.  Activation happens after the lock is
    /// dropped and its failure is reported in the returned allocation, not
    /// as an error: the addresses stay claimed either way.
    pub fn allocate_tenant_ip_pool(
        &self,
        tenant_id: Uuid,
        num: usize,
    ) -> Result<TenantIpAllocation, Error> {
        if num == 0 {
            return Ok(TenantIpAllocation {
                addresses: Vec::new(),
                activation_error: None,
            });
        }

        let (addresses, touched, controller) = {
            let mut tenants = self.tenants.write().unwrap();
            let state =
                tenants.get_mut(&tenant_id).ok_or(Error::TenantNotFound)?;
            let subnet_bits = state.tenant.subnet_bits;
            let mask = address::subnet_mask(subnet_bits);
            let max_hosts = address::max_hosts(subnet_bits);
            let (space_start, space_end) = address::tenant_space(subnet_bits);

            // Resume from the first subnet that still has room rather than
            // rescanning from the base every time.
            let mut start = space_start;
            for (base, hosts) in state.network.iter() {
                if (hosts.len() as u32) < max_hosts {
                    start = *base;
                    break;
                }
            }

            let mut addresses = Vec::with_capacity(num);
            let mut claims: Vec<TenantIp> = Vec::with_capacity(num);
            'subnets: loop {
                if start >= space_end {
                    unwind_tenant_ips(state, &claims);
                    return Err(Error::OutOfAddresses);
                }

                let subnet = start & mask;
                let hosts = state
                    .network
                    .entry(subnet)
                    .or_insert_with(BTreeSet::new);

                for host in 2..(max_hosts - 1) {
                    let addr = subnet + host;
                    if !hosts.insert(addr) {
                        continue;
                    }
                    addresses.push(Ipv4Addr::from(addr));
                    claims.push(TenantIp { subnet, host: addr });
                    if addresses.len() == num {
                        break 'subnets;
                    }
                }

                start = subnet + max_hosts;
            }

            if let Err(error) = self.db.claim_tenant_ips(tenant_id, &claims) {
                unwind_tenant_ips(state, &claims);
                return Err(error.into());
            }

            let mut touched = Vec::new();
            let mut seen = BTreeSet::new();
            for claim in &claims {
                if seen.insert(claim.subnet) {
                    touched.push(address::tenant_subnet(
                        Ipv4Addr::from(claim.subnet),
                        subnet_bits,
                    ));
                }
            }
            (addresses, touched, state.controller.clone())
        };

        // Activation blocks per subnet; the tenants lock is no longer held.
        let mut activation_error = None;
        if let Some(controller) = controller {
            for subnet in touched {
                if let Err(error) = controller.wait_for_active(subnet) {
                    activation_error = Some(Error::network(error));
                    break;
                }
            }
        }

        Ok(TenantIpAllocation { addresses, activation_error })
    }

    /// Claims a single private address.  An activation failure is returned
    /// as an error; the address remains claimed and can be released.
    pub fn allocate_tenant_ip(
        &self,
        tenant_id: Uuid,
    ) -> Result<Ipv4Addr, Error> {
        let allocation = self.allocate_tenant_ip_pool(tenant_id, 1)?;
        if let Some(error) = allocation.activation_error {
            return Err(error);
        }
        Ok(allocation.addresses[0])
    }

    /// Returns a private address to the tenant's pool.  Releasing the last
    /// address of a subnet removes the subnet and schedules its teardown on
    /// the fabric (failure to schedule is only logged).
    pub fn release_tenant_ip(
        &self,
        tenant_id: Uuid,
        ip: Ipv4Addr,
    ) -> Result<(), Error> {
        let (claim, removed_subnet, controller) = {
            let mut tenants = self.tenants.write().unwrap();
            let state =
                tenants.get_mut(&tenant_id).ok_or(Error::TenantNotFound)?;
            let subnet_bits = state.tenant.subnet_bits;
            let subnet = address::subnet_base(ip, subnet_bits);
            let host = u32::from(ip);

            let mut removed = None;
            if let Some(hosts) = state.network.get_mut(&subnet) {
                hosts.remove(&host);
                if hosts.is_empty() {
                    state.network.remove(&subnet);
                    removed = Some(address::tenant_subnet(ip, subnet_bits));
                }
            }
            (TenantIp { subnet, host }, removed, state.controller.clone())
        };

        if let Some(subnet) = removed_subnet {
            if let Some(controller) = controller {
                if let Err(error) = controller.schedule_remove_subnet(subnet)
                {
                    warn!(self.log, "unable to schedule subnet removal";
                        "subnet" => %subnet, "error" => %error);
                }
            }
        }

        Ok(self.db.release_tenant_ip(tenant_id, claim)?)
    }
}

/// Undoes in-memory claim marks, pruning subnets emptied by the unwind.
/// Caller holds the tenants lock.
fn unwind_tenant_ips(state: &mut TenantState, claims: &[TenantIp]) {
    for claim in claims {
        if let Some(hosts) = state.network.get_mut(&claim.subnet) {
            hosts.remove(&claim.host);
            if hosts.is_empty() {
                state.network.remove(&claim.subnet);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_datastore, FailPoint};
    use anyhow::anyhow;
    use ipnetwork::Ipv4Network;
    use std::sync::Mutex;

    struct RecordingController {
        active: Mutex<Vec<Ipv4Network>>,
        removed: Mutex<Vec<Ipv4Network>>,
        fail_activation: bool,
    }

    impl RecordingController {
        fn new(fail_activation: bool) -> Arc<RecordingController> {
            Arc::new(RecordingController {
                active: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
                fail_activation,
            })
        }
    }

    impl TenantNetworkController for RecordingController {
        fn wait_for_active(&self, subnet: Ipv4Network) -> anyhow::Result<()> {
            if self.fail_activation {
                return Err(anyhow!("fabric unreachable"));
            }
            self.active.lock().unwrap().push(subnet);
            Ok(())
        }

        fn schedule_remove_subnet(
            &self,
            subnet: Ipv4Network,
        ) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(subnet);
            Ok(())
        }
    }

    fn tenant_config(subnet_bits: u8) -> TenantConfig {
        TenantConfig { name: String::from("acme"), subnet_bits }
    }

    #[test]
    fn test_add_tenant_validation() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();

        assert!(matches!(
            ds.add_tenant(id, tenant_config(3)),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            ds.add_tenant(id, tenant_config(31)),
            Err(Error::InvalidRequest(_))
        ));

        // Zero selects the default width.
        let tenant = ds.add_tenant(id, tenant_config(0)).unwrap();
        assert_eq!(tenant.subnet_bits, DEFAULT_SUBNET_BITS);

        assert!(matches!(
            ds.add_tenant(id, tenant_config(24)),
            Err(Error::DuplicateTenant)
        ));
    }

    #[test]
    fn test_single_host_subnet_exhaustion() {
        // A /30 leaves exactly one usable host per subnet, and the span
        // above 172.16.0.0 holds a single /30.
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(30)).unwrap();

        let ip = ds.allocate_tenant_ip(id).unwrap();
        assert_eq!(ip, Ipv4Addr::new(172, 16, 0, 2));

        // Every remaining /30 in the span has its one host free; this only
        // exhausts once the whole 2^20 region is walked.
        let err = ds.allocate_tenant_ip_pool(id, 1 << 18).unwrap_err();
        assert!(matches!(err, Error::OutOfAddresses));
    }

    #[test]
    fn test_bulk_claim_rollback() {
        let (store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(24)).unwrap();

        store.fail_next(FailPoint::ClaimTenantIps);
        let err = ds.allocate_tenant_ip_pool(id, 5).unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        // The tenant's network map must be exactly as before the call.
        let tenants = ds.tenants.read().unwrap();
        assert!(tenants.get(&id).unwrap().network.is_empty());
    }

    #[test]
    fn test_allocate_release_round_trip() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(24)).unwrap();

        let allocation = ds.allocate_tenant_ip_pool(id, 3).unwrap();
        assert!(allocation.activation_error.is_none());
        assert_eq!(
            allocation.addresses,
            vec![
                Ipv4Addr::new(172, 16, 0, 2),
                Ipv4Addr::new(172, 16, 0, 3),
                Ipv4Addr::new(172, 16, 0, 4),
            ]
        );

        for ip in &allocation.addresses {
            ds.release_tenant_ip(id, *ip).unwrap();
        }

        let tenants = ds.tenants.read().unwrap();
        assert!(tenants.get(&id).unwrap().network.is_empty());
    }

    #[test]
    fn test_reserved_hosts_never_allocated() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(28)).unwrap();

        // A /28 has 16 hosts, 13 usable.  Claim them all and verify the
        // reserved indices were skipped.
        let allocation = ds.allocate_tenant_ip_pool(id, 13).unwrap();
        assert_eq!(allocation.addresses.len(), 13);
        assert!(!allocation
            .addresses
            .contains(&Ipv4Addr::new(172, 16, 0, 0)));
        assert!(!allocation
            .addresses
            .contains(&Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!allocation
            .addresses
            .contains(&Ipv4Addr::new(172, 16, 0, 15)));

        // The 14th allocation spills into the next subnet slot.
        let next = ds.allocate_tenant_ip(id).unwrap();
        assert_eq!(next, Ipv4Addr::new(172, 16, 0, 18));
    }

    #[test]
    fn test_subnet_activation_handoff() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(30)).unwrap();
        let controller = RecordingController::new(false);
        ds.attach_network_controller(id, controller.clone()).unwrap();

        // Two addresses from a /30 must span two subnets, both activated.
        let allocation = ds.allocate_tenant_ip_pool(id, 2).unwrap();
        assert!(allocation.activation_error.is_none());
        let active = controller.active.lock().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0], "172.16.0.0/30".parse().unwrap());
        assert_eq!(active[1], "172.16.0.4/30".parse().unwrap());
    }

    #[test]
    fn test_activation_failure_keeps_claim() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(24)).unwrap();
        ds.attach_network_controller(id, RecordingController::new(true))
            .unwrap();

        let allocation = ds.allocate_tenant_ip_pool(id, 1).unwrap();
        assert_eq!(allocation.addresses.len(), 1);
        assert!(matches!(
            allocation.activation_error,
            Some(Error::Network(_))
        ));

        // The claim stands despite the activation failure.
        let tenants = ds.tenants.read().unwrap();
        assert_eq!(
            tenants.get(&id).unwrap().network.values().next().unwrap().len(),
            1
        );
    }

    #[test]
    fn test_release_last_address_schedules_removal() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(24)).unwrap();
        let controller = RecordingController::new(false);
        ds.attach_network_controller(id, controller.clone()).unwrap();

        let ip = ds.allocate_tenant_ip(id).unwrap();
        ds.release_tenant_ip(id, ip).unwrap();

        let removed = controller.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0], "172.16.0.0/24".parse().unwrap());
    }

    #[test]
    fn test_subnet_bits_immutable_with_instances() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(24)).unwrap();

        {
            let mut tenants = ds.tenants.write().unwrap();
            tenants.get_mut(&id).unwrap().instances.insert(Uuid::new_v4());
        }

        let update = TenantConfigUpdate {
            name: None,
            subnet_bits: Some(20),
        };
        assert!(matches!(
            ds.update_tenant_config(id, update),
            Err(Error::InvalidRequest(_))
        ));

        // A name change is still allowed.
        let update = TenantConfigUpdate {
            name: Some(String::from("acme-renamed")),
            subnet_bits: None,
        };
        let tenant = ds.update_tenant_config(id, update).unwrap();
        assert_eq!(tenant.name, "acme-renamed");
    }

    #[test]
    fn test_delete_tenant_requires_empty() {
        let (_store, ds) = test_datastore();
        let id = Uuid::new_v4();
        ds.add_tenant(id, tenant_config(24)).unwrap();

        {
            let mut tenants = ds.tenants.write().unwrap();
            tenants.get_mut(&id).unwrap().devices.insert(Uuid::new_v4());
        }
        assert!(matches!(
            ds.delete_tenant(id),
            Err(Error::InvalidRequest(_))
        ));

        {
            let mut tenants = ds.tenants.write().unwrap();
            tenants.get_mut(&id).unwrap().devices.clear();
        }
        ds.delete_tenant(id).unwrap();
        assert!(matches!(ds.get_tenant(id), Err(Error::TenantNotFound)));
    }
}
