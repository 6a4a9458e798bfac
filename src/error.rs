// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the controller datastore.
//!
//! All fallible datastore operations return [`Error`].  The set of variants is
//! closed: API layers map each kind onto a transport-level response, so we
//! prefer reusing an existing variant over inventing a new one that no
//! programmatic consumer needs to distinguish.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No tenant with the requested id.
    #[error("tenant not found")]
    TenantNotFound,
    /// A tenant with this id already exists.
    #[error("tenant already exists")]
    DuplicateTenant,
    #[error("workload not found")]
    WorkloadNotFound,
    /// The workload is still referenced by at least one instance.
    #[error("workload in use")]
    WorkloadInUse,
    #[error("block device not found")]
    NoBlockData,
    #[error("no volume attached")]
    NoStorageAttachment,
    #[error("external IP pool not found")]
    PoolNotFound,
    /// The pool (or a subnet or address within it) still has mapped addresses.
    #[error("pool not empty")]
    PoolNotEmpty,
    /// The pool has no free addresses left to map.
    #[error("pool empty")]
    PoolEmpty,
    /// The subnet overlaps address space already owned by a pool.
    #[error("duplicate subnet")]
    DuplicateSubnet,
    /// The address is already owned by a pool, individually or via a subnet.
    #[error("duplicate IP address")]
    DuplicateIP,
    #[error("invalid IPv4 address")]
    InvalidIP,
    /// A subnet must contribute at least one usable address; add /32s as
    /// individual addresses instead.
    #[error("subnet too small")]
    SubnetTooSmall,
    /// The subnet or address id does not belong to the named pool.
    #[error("address not found in pool")]
    InvalidPoolAddress,
    /// No mapping exists for the external address.
    #[error("address not mapped")]
    AddressNotFound,
    #[error("image not found")]
    NoImage,
    /// An entity with the same name or id already exists in a visible
    /// namespace.
    #[error("already exists")]
    AlreadyExists,
    #[error("instance not found")]
    InstanceNotFound,
    #[error("node not found")]
    NodeNotFound,
    /// The tenant's private address space is exhausted.
    #[error("out of addresses")]
    OutOfAddresses,
    /// The request was well-formed but cannot be satisfied in the current
    /// state of the system.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Cross-table verification at startup found the persistent contents
    /// contradicting themselves.
    #[error("datastore inconsistent: {0}")]
    Inconsistent(String),
    /// An error reported by the tenant network controller.
    #[error("network controller: {0}")]
    Network(String),
    /// An error surfaced by the persistent store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest(message.to_owned())
    }

    pub fn inconsistent(message: String) -> Error {
        Error::Inconsistent(message)
    }

    /// Wraps an error from the tenant network controller, flattening its
    /// cause chain into the message.
    pub fn network(error: anyhow::Error) -> Error {
        Error::Network(format!("{:#}", error))
    }

    /// Returns whether the error is likely transient and the operation could
    /// reasonably be retried as-is.
    pub fn retryable(&self) -> bool {
        matches!(self, Error::Store(StoreError::Unavailable(_)))
    }
}
