// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The workload catalog.
//!
//! Workloads are launch templates, public or private to a tenant.  The CNCI
//! workload is special: a single internal template generated in memory at
//! startup and never persisted; lookups check its slot before the catalog.

use crate::datastore::Datastore;
use crate::error::Error;
use crate::types::{
    FirmwareType, StorageResource, StorageSource, Visibility, VmType,
    Workload, WorkloadRequirements,
};
use uuid::Uuid;

impl Datastore {
    /// Adds a workload to the catalog and to its visibility index.
    pub fn add_workload(&self, workload: Workload) -> Result<(), Error> {
        let mut workloads = self.workloads.write().unwrap();
        let mut tenants = self.tenants.write().unwrap();

        if workloads.workloads.contains_key(&workload.id) {
            return Err(Error::AlreadyExists);
        }

        match workload.visibility {
            Visibility::Public => {
                self.db.add_workload(&workload)?;
                workloads.public.push(workload.id);
            }
            Visibility::Private => {
                let tenant_id =
                    workload.tenant_id.ok_or(Error::TenantNotFound)?;
                let state =
                    tenants.get_mut(&tenant_id).ok_or(Error::TenantNotFound)?;
                self.db.add_workload(&workload)?;
                state.workloads.push(workload.id);
            }
            Visibility::Internal => {
                return Err(Error::invalid_request(
                    "internal workloads are generated, not stored",
                ));
            }
        }

        workloads.workloads.insert(workload.id, workload);
        Ok(())
    }

    /// Removes an unused workload.  Deletion is refused while any instance
    /// still references the template.
    pub fn delete_workload(&self, workload_id: Uuid) -> Result<(), Error> {
        let mut workloads = self.workloads.write().unwrap();
        let mut tenants = self.tenants.write().unwrap();
        let instances = self.instances.read().unwrap();

        if instances.values().any(|i| i.workload_id == workload_id) {
            return Err(Error::WorkloadInUse);
        }

        let workload = workloads
            .workloads
            .get(&workload_id)
            .cloned()
            .ok_or(Error::WorkloadNotFound)?;

        self.db.delete_workload(workload_id)?;

        match workload.visibility {
            Visibility::Public => {
                workloads.public.retain(|id| *id != workload_id)
            }
            _ => {
                if let Some(tenant_id) = workload.tenant_id {
                    if let Some(state) = tenants.get_mut(&tenant_id) {
                        state.workloads.retain(|id| *id != workload_id);
                    }
                }
            }
        }
        workloads.workloads.remove(&workload_id);
        Ok(())
    }

    /// Fetches a workload by id; the CNCI template answers before the
    /// catalog.
    pub fn get_workload(&self, workload_id: Uuid) -> Result<Workload, Error> {
        {
            let cnci = self.cnci_workload.read().unwrap();
            if let Some(workload) = cnci.as_ref() {
                if workload.id == workload_id {
                    return Ok(workload.clone());
                }
            }
        }

        let workloads = self.workloads.read().unwrap();
        workloads
            .workloads
            .get(&workload_id)
            .cloned()
            .ok_or(Error::WorkloadNotFound)
    }

    fn list_workloads(
        &self,
        tenant_id: Uuid,
        include_public: bool,
    ) -> Vec<Workload> {
        let workloads = self.workloads.read().unwrap();
        let tenants = self.tenants.read().unwrap();

        let mut result = Vec::new();
        if include_public {
            for id in &workloads.public {
                if let Some(workload) = workloads.workloads.get(id) {
                    result.push(workload.clone());
                }
            }
        }
        // An unknown tenant is not an error here; the public set stands on
        // its own.
        if let Some(state) = tenants.get(&tenant_id) {
            for id in &state.workloads {
                if let Some(workload) = workloads.workloads.get(id) {
                    result.push(workload.clone());
                }
            }
        }
        result
    }

    /// The workloads a tenant can launch, public ones included.
    pub fn get_workloads(&self, tenant_id: Uuid) -> Vec<Workload> {
        self.list_workloads(tenant_id, true)
    }

    /// Only the tenant's private workloads.
    pub fn get_tenant_workloads(&self, tenant_id: Uuid) -> Vec<Workload> {
        self.list_workloads(tenant_id, false)
    }

    /// Builds the CNCI workload template.  Call before any workload launch;
    /// the template lives in memory only.  Returns the template's id.
    pub fn generate_cnci_workload(
        &self,
        vcpus: u32,
        mem_mb: u64,
        image_id: Uuid,
        ssh_key: &str,
    ) -> Uuid {
        let config = format!(
            "---
#cloud-config
users:
  - name: cloud-admin
    gecos: Cumulus Cloud Admin
    lock-passwd: true
    sudo: ALL=(ALL) NOPASSWD:ALL
    ssh-authorized-keys:
    - {}
...
",
            ssh_key
        );

        let workload = Workload {
            id: Uuid::new_v4(),
            tenant_id: None,
            description: String::from("CNCI"),
            fw_type: FirmwareType::Efi,
            vm_type: VmType::Qemu,
            config,
            requirements: WorkloadRequirements {
                vcpus,
                mem_mb,
                network_node: true,
            },
            storage: vec![StorageResource {
                id: None,
                bootable: true,
                ephemeral: true,
                size_gb: 0,
                source_type: StorageSource::Image,
                source_id: Some(image_id),
                internal: true,
            }],
            visibility: Visibility::Internal,
        };

        let id = workload.id;
        *self.cnci_workload.write().unwrap() = Some(workload);
        id
    }

    /// The id of the CNCI workload template, once generated.
    pub fn get_cnci_workload_id(&self) -> Result<Uuid, Error> {
        let cnci = self.cnci_workload.read().unwrap();
        cnci.as_ref().map(|workload| workload.id).ok_or(Error::WorkloadNotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{
        test_datastore, test_instance, test_tenant, test_workload,
    };

    #[test]
    fn test_workload_in_use() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let workload = test_workload(Some(tenant_id), Visibility::Private);
        ds.add_workload(workload.clone()).unwrap();

        let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
        let mut instance = test_instance(tenant_id, ip);
        instance.workload_id = workload.id;
        ds.add_instance(&instance).unwrap();

        assert!(matches!(
            ds.delete_workload(workload.id),
            Err(Error::WorkloadInUse)
        ));

        ds.delete_instance(instance.id).unwrap();
        ds.delete_workload(workload.id).unwrap();
        assert!(matches!(
            ds.get_workload(workload.id),
            Err(Error::WorkloadNotFound)
        ));
    }

    #[test]
    fn test_visibility_routing() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);

        let shared = test_workload(None, Visibility::Public);
        ds.add_workload(shared.clone()).unwrap();
        let private = test_workload(Some(tenant_id), Visibility::Private);
        ds.add_workload(private.clone()).unwrap();

        // Tenant listings include public templates; the private set
        // doesn't.
        assert_eq!(ds.get_workloads(tenant_id).len(), 2);
        let mine = ds.get_tenant_workloads(tenant_id);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, private.id);

        // Another tenant only sees the public one.
        let other = test_tenant(&ds);
        assert_eq!(ds.get_workloads(other).len(), 1);

        // A private workload without a tenant is refused, as are internal
        // ones.
        let orphan = test_workload(None, Visibility::Private);
        assert!(matches!(
            ds.add_workload(orphan),
            Err(Error::TenantNotFound)
        ));
        let internal = test_workload(None, Visibility::Internal);
        assert!(matches!(
            ds.add_workload(internal),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_cnci_workload_slot() {
        let (_store, ds) = test_datastore();
        assert!(matches!(
            ds.get_cnci_workload_id(),
            Err(Error::WorkloadNotFound)
        ));

        let image_id = Uuid::new_v4();
        let id = ds.generate_cnci_workload(4, 2048, image_id, "ssh-rsa AAAA");
        assert_eq!(ds.get_cnci_workload_id().unwrap(), id);

        let workload = ds.get_workload(id).unwrap();
        assert_eq!(workload.visibility, Visibility::Internal);
        assert!(workload.requirements.network_node);
        assert_eq!(workload.storage[0].source_id, Some(image_id));
        assert!(workload.config.contains("ssh-rsa AAAA"));

        // The template is not part of the persisted catalog.
        let workloads = ds.workloads.read().unwrap();
        assert!(workloads.workloads.is_empty());
    }
}
