// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory, write-through state store for the Cumulus cloud controller.
//!
//! The controller schedules workloads onto a fleet of compute and network
//! nodes; this crate is its source of truth for tenants, instances, nodes,
//! volumes and their attachments, external IP pools, images, workloads and
//! per-tenant usage.  The whole working set is cached in memory under
//! fine-grained locks and every mutation is mirrored to a persistent store,
//! persistent write first, cache commit second.
//!
//! The two ports this crate consumes are [`store::PersistentStore`] (row
//! storage; the only component touching durable state) and
//! [`network::TenantNetworkController`] (the per-tenant fabric manager that
//! activates and tears down private subnets).  Everything else -- REST and
//! CLI layers, node messaging, identity -- lives above and calls through
//! [`datastore::Datastore`].

pub mod address;
pub mod config;
pub mod datastore;
pub mod error;
pub mod network;
pub mod store;
pub mod test_util;
pub mod types;

pub use config::Config;
pub use datastore::{Datastore, TenantIpAllocation};
pub use error::Error;
pub use network::TenantNetworkController;
pub use store::{PersistentStore, StoreError, TenantRecord};
