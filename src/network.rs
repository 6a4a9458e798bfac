// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tenant network controller port.
//!
//! Each tenant may have a handle to the component managing its network
//! fabric (the CNCI lifecycle manager).  Both operations may block for an
//! arbitrarily long time, so the datastore never invokes them while holding
//! the tenants lock.

use ipnetwork::Ipv4Network;

pub trait TenantNetworkController: Send + Sync {
    /// Blocks until the tenant subnet is active on the network fabric.
    fn wait_for_active(&self, subnet: Ipv4Network) -> anyhow::Result<()>;

    /// Requests eventual teardown of a tenant subnet that no longer has any
    /// allocated addresses.
    fn schedule_remove_subnet(&self, subnet: Ipv4Network)
        -> anyhow::Result<()>;
}
