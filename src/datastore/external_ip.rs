// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External IP pools and address mappings.
//!
//! Pools own disjoint address space: no two pool subnets may overlap and no
//! individual pool address may fall inside any pool subnet.  A pool's `free`
//! counter always equals its total minus the number of current mappings
//! drawing from it; both the mapping insert and the decrement commit under
//! the pools lock, so a mapping is never observable before its pool's
//! counter accounts for it.

use crate::address;
use crate::datastore::{Datastore, PoolTable};
use crate::error::Error;
use crate::types::{MappedIp, Pool, PoolAddress, PoolSubnet};
use ipnetwork::Ipv4Network;
use slog::warn;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Caller holds the pools lock.
fn is_duplicate_subnet(table: &PoolTable, subnet: &Ipv4Network) -> bool {
    table
        .subnets
        .iter()
        .any(|existing| address::networks_overlap(existing, subnet))
}

/// Caller holds the pools lock.
fn is_duplicate_ip(table: &PoolTable, ip: Ipv4Addr) -> bool {
    table.subnets.iter().any(|subnet| subnet.contains(ip))
        || table.addresses.contains(&ip)
}

/// First pool address without a current mapping: subnets in order (skipping
/// each network address), then individual addresses.
fn find_free_address(table: &PoolTable, pool: &Pool) -> Option<Ipv4Addr> {
    for subnet in &pool.subnets {
        let mut addr = u32::from(subnet.cidr.network()) + 1;
        while subnet.cidr.contains(Ipv4Addr::from(addr)) {
            let candidate = Ipv4Addr::from(addr);
            if !table.mapped.contains_key(&candidate) {
                return Some(candidate);
            }
            match addr.checked_add(1) {
                Some(next) => addr = next,
                None => break,
            }
        }
    }

    for ip in &pool.ips {
        if !table.mapped.contains_key(&ip.address) {
            return Some(ip.address);
        }
    }

    None
}

impl Datastore {
    /// Creates a pool from either a list of subnets or a list of individual
    /// addresses.  Validation failures leave no trace; a persistent failure
    /// after validation compensates with a pool delete.
    pub fn add_pool(
        &self,
        name: &str,
        subnets: &[Ipv4Network],
        ips: &[Ipv4Addr],
    ) -> Result<Pool, Error> {
        if !subnets.is_empty() && !ips.is_empty() {
            return Err(Error::invalid_request(
                "a pool takes subnets or individual addresses, not both",
            ));
        }

        let mut table = self.pools.write().unwrap();

        let mut pool = Pool {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            total_ips: 0,
            free: 0,
            subnets: Vec::new(),
            ips: Vec::new(),
        };

        for subnet in subnets {
            if is_duplicate_subnet(&table, subnet)
                || pool
                    .subnets
                    .iter()
                    .any(|s| address::networks_overlap(&s.cidr, subnet))
            {
                return Err(Error::DuplicateSubnet);
            }
            let usable = address::usable_addrs(subnet);
            if usable == 0 {
                return Err(Error::SubnetTooSmall);
            }
            pool.total_ips += usable;
            pool.free += usable;
            pool.subnets
                .push(PoolSubnet { id: Uuid::new_v4(), cidr: *subnet });
        }

        for ip in ips {
            if ip.is_unspecified() || ip.is_broadcast() {
                return Err(Error::InvalidIP);
            }
            if is_duplicate_ip(&table, *ip)
                || pool.ips.iter().any(|entry| entry.address == *ip)
            {
                return Err(Error::DuplicateIP);
            }
            pool.total_ips += 1;
            pool.free += 1;
            pool.ips.push(PoolAddress { id: Uuid::new_v4(), address: *ip });
        }

        if let Err(error) = self.db.add_pool(&pool) {
            // The row may have landed partially; take it back out.
            if let Err(cleanup) = self.db.delete_pool(pool.id) {
                warn!(self.log, "error removing partially written pool";
                    "pool_id" => %pool.id, "error" => %cleanup);
            }
            return Err(error.into());
        }

        for subnet in &pool.subnets {
            table.subnets.insert(subnet.cidr);
        }
        for ip in &pool.ips {
            table.addresses.insert(ip.address);
        }
        table.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    /// Deletes a pool.  Every address must be unmapped first.
    pub fn delete_pool(&self, pool_id: Uuid) -> Result<(), Error> {
        let mut table = self.pools.write().unwrap();
        let pool = table.pools.get(&pool_id).ok_or(Error::PoolNotFound)?;
        if pool.free != pool.total_ips {
            return Err(Error::PoolNotEmpty);
        }

        self.db.delete_pool(pool_id)?;

        let pool = table.pools.remove(&pool_id).unwrap();
        for subnet in &pool.subnets {
            table.subnets.remove(&subnet.cidr);
        }
        for ip in &pool.ips {
            table.addresses.remove(&ip.address);
        }
        Ok(())
    }

    pub fn get_pool(&self, pool_id: Uuid) -> Result<Pool, Error> {
        let table = self.pools.read().unwrap();
        table.pools.get(&pool_id).cloned().ok_or(Error::PoolNotFound)
    }

    pub fn get_pools(&self) -> Vec<Pool> {
        let table = self.pools.read().unwrap();
        table.pools.values().cloned().collect()
    }

    /// Adds a subnet to an existing pool.  /31 and /32 contribute no usable
    /// addresses and are rejected; add those as individual addresses.
    pub fn add_external_subnet(
        &self,
        pool_id: Uuid,
        subnet: Ipv4Network,
    ) -> Result<(), Error> {
        let mut table = self.pools.write().unwrap();
        let pool =
            table.pools.get(&pool_id).cloned().ok_or(Error::PoolNotFound)?;

        if is_duplicate_subnet(&table, &subnet) {
            return Err(Error::DuplicateSubnet);
        }
        let usable = address::usable_addrs(&subnet);
        if usable == 0 {
            return Err(Error::SubnetTooSmall);
        }

        let mut updated = pool;
        updated.total_ips += usable;
        updated.free += usable;
        updated.subnets.push(PoolSubnet { id: Uuid::new_v4(), cidr: subnet });

        self.db.update_pool(&updated)?;

        table.subnets.insert(subnet);
        table.pools.insert(pool_id, updated);
        Ok(())
    }

    /// Adds individual addresses to an existing pool.
    pub fn add_external_ips(
        &self,
        pool_id: Uuid,
        ips: &[Ipv4Addr],
    ) -> Result<(), Error> {
        let mut table = self.pools.write().unwrap();
        let pool =
            table.pools.get(&pool_id).cloned().ok_or(Error::PoolNotFound)?;

        let mut updated = pool;
        for ip in ips {
            if ip.is_unspecified() || ip.is_broadcast() {
                return Err(Error::InvalidIP);
            }
            if is_duplicate_ip(&table, *ip)
                || updated.ips.iter().any(|entry| entry.address == *ip)
            {
                return Err(Error::DuplicateIP);
            }
            updated.total_ips += 1;
            updated.free += 1;
            updated
                .ips
                .push(PoolAddress { id: Uuid::new_v4(), address: *ip });
        }

        self.db.update_pool(&updated)?;

        for ip in ips {
            table.addresses.insert(*ip);
        }
        table.pools.insert(pool_id, updated);
        Ok(())
    }

    /// Removes a subnet from a pool.  No address inside the subnet may be
    /// mapped.
    pub fn delete_subnet(
        &self,
        pool_id: Uuid,
        subnet_id: Uuid,
    ) -> Result<(), Error> {
        let mut table = self.pools.write().unwrap();
        let pool =
            table.pools.get(&pool_id).cloned().ok_or(Error::PoolNotFound)?;

        let Some(index) =
            pool.subnets.iter().position(|s| s.id == subnet_id)
        else {
            return Err(Error::InvalidPoolAddress);
        };
        let cidr = pool.subnets[index].cidr;

        if table.mapped.values().any(|m| cidr.contains(m.external_ip)) {
            return Err(Error::PoolNotEmpty);
        }

        let usable = address::usable_addrs(&cidr);
        let mut updated = pool;
        updated.total_ips -= usable;
        updated.free -= usable;
        updated.subnets.remove(index);

        self.db.update_pool(&updated)?;

        table.subnets.remove(&cidr);
        table.pools.insert(pool_id, updated);
        Ok(())
    }

    /// Removes an individual address from a pool.  The address must not be
    /// mapped.
    pub fn delete_external_ip(
        &self,
        pool_id: Uuid,
        address_id: Uuid,
    ) -> Result<(), Error> {
        let mut table = self.pools.write().unwrap();
        let pool =
            table.pools.get(&pool_id).cloned().ok_or(Error::PoolNotFound)?;

        let Some(index) = pool.ips.iter().position(|e| e.id == address_id)
        else {
            return Err(Error::InvalidPoolAddress);
        };
        let address = pool.ips[index].address;

        if table.mapped.contains_key(&address) {
            return Err(Error::PoolNotEmpty);
        }

        let mut updated = pool;
        updated.total_ips -= 1;
        updated.free -= 1;
        updated.ips.remove(index);

        self.db.update_pool(&updated)?;

        table.addresses.remove(&address);
        table.pools.insert(pool_id, updated);
        Ok(())
    }

    /// Maps the first free address of a pool to an instance.
    pub fn map_external_ip(
        &self,
        pool_id: Uuid,
        instance_id: Uuid,
    ) -> Result<MappedIp, Error> {
        let instance = self.get_instance(instance_id)?;

        let mut table = self.pools.write().unwrap();
        let pool =
            table.pools.get(&pool_id).cloned().ok_or(Error::PoolNotFound)?;
        if pool.free == 0 {
            return Err(Error::PoolEmpty);
        }

        let Some(external_ip) = find_free_address(&table, &pool) else {
            warn!(self.log, "pool reports free addresses but none found";
                "pool_id" => %pool_id, "free" => pool.free);
            return Err(Error::PoolEmpty);
        };

        let mapping = MappedIp {
            id: Uuid::new_v4(),
            external_ip,
            internal_ip: instance.ip_address,
            instance_id,
            tenant_id: instance.tenant_id,
            pool_id,
            pool_name: pool.name.clone(),
        };
        let mut updated = pool;
        updated.free -= 1;

        self.db.add_mapped_ip(&mapping)?;
        if let Err(error) = self.db.update_pool(&updated) {
            if let Err(cleanup) = self.db.delete_mapped_ip(mapping.id) {
                warn!(self.log, "error removing orphaned IP mapping";
                    "mapping_id" => %mapping.id, "error" => %cleanup);
            }
            return Err(error.into());
        }

        table.mapped.insert(external_ip, mapping.clone());
        table.pools.insert(pool_id, updated);
        Ok(mapping)
    }

    /// Releases the mapping for an external address and returns the address
    /// to its pool.
    pub fn unmap_external_ip(&self, address: Ipv4Addr) -> Result<(), Error> {
        let mut table = self.pools.write().unwrap();
        let mapping = table
            .mapped
            .get(&address)
            .cloned()
            .ok_or(Error::AddressNotFound)?;
        let pool = table
            .pools
            .get(&mapping.pool_id)
            .cloned()
            .ok_or(Error::PoolNotFound)?;

        let mut updated = pool;
        updated.free += 1;

        self.db.delete_mapped_ip(mapping.id)?;
        if let Err(error) = self.db.update_pool(&updated) {
            if let Err(cleanup) = self.db.add_mapped_ip(&mapping) {
                warn!(self.log, "error restoring IP mapping row";
                    "mapping_id" => %mapping.id, "error" => %cleanup);
            }
            return Err(error.into());
        }

        table.mapped.remove(&address);
        table.pools.insert(updated.id, updated);
        Ok(())
    }

    pub fn get_mapped_ip(&self, address: Ipv4Addr) -> Result<MappedIp, Error> {
        let table = self.pools.read().unwrap();
        table.mapped.get(&address).cloned().ok_or(Error::AddressNotFound)
    }

    /// Current mappings, optionally restricted to one tenant.
    pub fn get_mapped_ips(&self, tenant_id: Option<Uuid>) -> Vec<MappedIp> {
        let table = self.pools.read().unwrap();
        table
            .mapped
            .values()
            .filter(|m| tenant_id.map_or(true, |id| m.tenant_id == id))
            .cloned()
            .collect()
    }
}
