// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block volumes and instance attachments.
//!
//! An attachment binds a volume to an instance; the `(instance, volume)`
//! secondary index guarantees at most one binding per pair.  Creating an
//! attachment moves the volume to in-use, deleting it moves the volume back
//! to available.  Attachment creation persists the attachment row before
//! the volume update and compensates by deleting the row if the volume
//! update fails.

use crate::datastore::Datastore;
use crate::error::Error;
use crate::types::{
    Attachment, AttachVolumeFailureReason, EventType, Volume, VolumeState,
};
use slog::warn;
use uuid::Uuid;

impl Datastore {
    /// Stores a volume, updating it in place if it already exists, and
    /// links it to its owning tenant.
    pub fn add_block_device(&self, volume: Volume) -> Result<(), Error> {
        {
            let tenants = self.tenants.read().unwrap();
            if !tenants.contains_key(&volume.tenant_id) {
                return Err(Error::TenantNotFound);
            }
        }

        let update = {
            let devices = self.block_devices.read().unwrap();
            devices.contains_key(&volume.id)
        };
        if update {
            self.db.update_block_data(&volume)?;
        } else {
            self.db.add_block_data(&volume)?;
        }

        {
            let mut tenants = self.tenants.write().unwrap();
            if let Some(state) = tenants.get_mut(&volume.tenant_id) {
                state.devices.insert(volume.id);
            }
        }
        self.block_devices.write().unwrap().insert(volume.id, volume);
        Ok(())
    }

    /// Replaces an existing volume record.
    pub fn update_block_device(&self, volume: Volume) -> Result<(), Error> {
        {
            let devices = self.block_devices.read().unwrap();
            if !devices.contains_key(&volume.id) {
                return Err(Error::NoBlockData);
            }
        }
        self.add_block_device(volume)
    }

    /// Removes a volume and its link from the owning tenant.
    pub fn delete_block_device(&self, volume_id: Uuid) -> Result<(), Error> {
        let volume = self.get_block_device(volume_id)?;

        self.db.delete_block_data(volume_id)?;

        {
            let mut tenants = self.tenants.write().unwrap();
            if let Some(state) = tenants.get_mut(&volume.tenant_id) {
                state.devices.remove(&volume_id);
            }
        }
        self.block_devices.write().unwrap().remove(&volume_id);
        Ok(())
    }

    pub fn get_block_device(&self, volume_id: Uuid) -> Result<Volume, Error> {
        let devices = self.block_devices.read().unwrap();
        devices.get(&volume_id).cloned().ok_or(Error::NoBlockData)
    }

    /// All volumes owned by a tenant.
    pub fn get_block_devices(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<Volume>, Error> {
        let tenants = self.tenants.read().unwrap();
        let state = tenants.get(&tenant_id).ok_or(Error::TenantNotFound)?;
        let devices = self.block_devices.read().unwrap();
        Ok(state
            .devices
            .iter()
            .filter_map(|id| devices.get(id))
            .cloned()
            .collect())
    }

    /// Binds a volume to an instance and marks the volume in use.
    pub fn create_storage_attachment(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        ephemeral: bool,
        boot: bool,
    ) -> Result<Attachment, Error> {
        {
            let attachments = self.attachments.read().unwrap();
            if attachments
                .instance_volumes
                .contains_key(&(instance_id, volume_id))
            {
                return Err(Error::AlreadyExists);
            }
        }

        let attachment = Attachment {
            id: Uuid::new_v4(),
            instance_id,
            volume_id,
            ephemeral,
            boot,
        };

        self.db.add_storage_attachment(&attachment)?;

        // The volume must exist and transition to in-use; otherwise the
        // attachment row just written is taken back out.
        {
            let mut devices = self.block_devices.write().unwrap();
            let Some(volume) = devices.get(&volume_id) else {
                self.compensate_attachment(attachment.id);
                return Err(Error::NoBlockData);
            };

            let mut updated = volume.clone();
            updated.state = VolumeState::InUse;
            if let Err(error) = self.db.update_block_data(&updated) {
                self.compensate_attachment(attachment.id);
                return Err(error.into());
            }
            devices.insert(volume_id, updated);
        }

        let mut attachments = self.attachments.write().unwrap();
        attachments.attachments.insert(attachment.id, attachment.clone());
        attachments
            .instance_volumes
            .insert((instance_id, volume_id), attachment.id);
        Ok(attachment)
    }

    fn compensate_attachment(&self, attachment_id: Uuid) {
        if let Err(error) = self.db.delete_storage_attachment(attachment_id) {
            warn!(self.log, "error removing orphaned attachment row";
                "attachment_id" => %attachment_id, "error" => %error);
        }
    }

    /// Unbinds an attachment and returns the volume to available.
    pub fn delete_storage_attachment(
        &self,
        attachment_id: Uuid,
    ) -> Result<(), Error> {
        self.db.delete_storage_attachment(attachment_id)?;

        let attachment = {
            let mut attachments = self.attachments.write().unwrap();
            match attachments.attachments.remove(&attachment_id) {
                Some(attachment) => {
                    attachments.instance_volumes.remove(&(
                        attachment.instance_id,
                        attachment.volume_id,
                    ));
                    attachment
                }
                None => return Err(Error::NoStorageAttachment),
            }
        };

        self.release_volume(attachment.volume_id);
        Ok(())
    }

    /// All attachments belonging to an instance.
    pub fn get_storage_attachments(&self, instance_id: Uuid) -> Vec<Attachment> {
        let attachments = self.attachments.read().unwrap();
        attachments
            .attachments
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// The attachment binding a specific instance and volume.
    pub fn storage_attachment(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
    ) -> Result<Attachment, Error> {
        let attachments = self.attachments.read().unwrap();
        attachments
            .instance_volumes
            .get(&(instance_id, volume_id))
            .and_then(|id| attachments.attachments.get(id))
            .cloned()
            .ok_or(Error::NoStorageAttachment)
    }

    /// All attachments referencing a volume.
    pub fn get_volume_attachments(&self, volume_id: Uuid) -> Vec<Attachment> {
        let attachments = self.attachments.read().unwrap();
        attachments
            .attachments
            .values()
            .filter(|a| a.volume_id == volume_id)
            .cloned()
            .collect()
    }

    /// Tears down every attachment an instance holds: each volume returns
    /// to available and each attachment row is deleted.  Failures are
    /// logged and cleanup continues; a retry of the caller converges.
    pub(crate) fn release_instance_attachments(&self, instance_id: Uuid) {
        let drained: Vec<Attachment> = {
            let mut attachments = self.attachments.write().unwrap();
            let ids: Vec<Uuid> = attachments
                .attachments
                .values()
                .filter(|a| a.instance_id == instance_id)
                .map(|a| a.id)
                .collect();
            ids.iter()
                .filter_map(|id| {
                    let attachment = attachments.attachments.remove(id)?;
                    attachments.instance_volumes.remove(&(
                        attachment.instance_id,
                        attachment.volume_id,
                    ));
                    Some(attachment)
                })
                .collect()
        };

        for attachment in drained {
            self.release_volume(attachment.volume_id);
            if let Err(error) =
                self.db.delete_storage_attachment(attachment.id)
            {
                warn!(self.log, "error deleting storage attachment";
                    "attachment_id" => %attachment.id, "error" => %error);
            }
        }
    }

    /// Cleans up after a failed volume attach: the volume returns to
    /// available, the node's failure counters are bumped and an error
    /// event is logged.
    pub fn attach_volume_failure(
        &self,
        instance_id: Uuid,
        volume_id: Uuid,
        reason: AttachVolumeFailureReason,
    ) -> Result<(), Error> {
        let mut volume = self.get_block_device(volume_id)?;
        volume.state = VolumeState::Available;
        self.update_block_device(volume)?;

        let instance = self.get_instance(instance_id)?;
        if let Some(node_id) = instance.node_id {
            let mut nodes = self.nodes.write().unwrap();
            if let Some(state) = nodes.get_mut(&node_id) {
                state.node.total_failures += 1;
                state.node.attach_volume_failures += 1;
            }
        }

        let message = format!(
            "Failed to attach volume {} to instance {}: {}",
            volume_id, instance_id, reason
        );
        self.log_event_entry(
            Some(instance.tenant_id),
            instance.node_id,
            EventType::Error,
            message,
        )
    }

    /// Moves a volume back to available, best-effort.
    fn release_volume(&self, volume_id: Uuid) {
        let mut devices = self.block_devices.write().unwrap();
        let Some(volume) = devices.get(&volume_id) else {
            warn!(self.log, "attachment references unknown volume";
                "volume_id" => %volume_id);
            return;
        };

        let mut updated = volume.clone();
        updated.state = VolumeState::Available;
        match self.db.update_block_data(&updated) {
            Ok(()) => {
                devices.insert(volume_id, updated);
            }
            Err(error) => {
                warn!(self.log, "error updating block device";
                    "volume_id" => %volume_id, "error" => %error);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{
        test_datastore, test_instance, test_tenant, test_volume, FailPoint,
    };

    #[test]
    fn test_attach_detach_round_trip() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let volume = test_volume(tenant_id);
        ds.add_block_device(volume.clone()).unwrap();
        let instance_id = Uuid::new_v4();

        let attachment = ds
            .create_storage_attachment(instance_id, volume.id, false, true)
            .unwrap();
        assert_eq!(
            ds.get_block_device(volume.id).unwrap().state,
            VolumeState::InUse
        );
        assert_eq!(
            ds.storage_attachment(instance_id, volume.id).unwrap().id,
            attachment.id
        );

        ds.delete_storage_attachment(attachment.id).unwrap();
        assert_eq!(
            ds.get_block_device(volume.id).unwrap().state,
            VolumeState::Available
        );
        assert!(matches!(
            ds.storage_attachment(instance_id, volume.id),
            Err(Error::NoStorageAttachment)
        ));
        assert!(ds.get_volume_attachments(volume.id).is_empty());
    }

    #[test]
    fn test_one_attachment_per_pair() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let volume = test_volume(tenant_id);
        ds.add_block_device(volume.clone()).unwrap();
        let instance_id = Uuid::new_v4();

        ds.create_storage_attachment(instance_id, volume.id, false, false)
            .unwrap();
        assert!(matches!(
            ds.create_storage_attachment(instance_id, volume.id, false, false),
            Err(Error::AlreadyExists)
        ));
    }

    #[test]
    fn test_attach_compensates_on_volume_failure() {
        let (store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let volume = test_volume(tenant_id);
        ds.add_block_device(volume.clone()).unwrap();
        let instance_id = Uuid::new_v4();

        store.fail_next(FailPoint::UpdateBlockData);
        let err = ds
            .create_storage_attachment(instance_id, volume.id, false, false)
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        // The attachment row written before the failure was compensated and
        // nothing reached the caches.
        assert!(store.attachment_count() == 0);
        assert!(ds.get_storage_attachments(instance_id).is_empty());
        assert_eq!(
            ds.get_block_device(volume.id).unwrap().state,
            VolumeState::Available
        );
    }

    #[test]
    fn test_attach_unknown_volume() {
        let (store, ds) = test_datastore();
        let instance_id = Uuid::new_v4();

        let err = ds
            .create_storage_attachment(
                instance_id,
                Uuid::new_v4(),
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoBlockData));
        assert!(store.attachment_count() == 0);
    }

    #[test]
    fn test_block_device_tenant_relation() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let volume = test_volume(tenant_id);

        ds.add_block_device(volume.clone()).unwrap();
        assert_eq!(ds.get_block_devices(tenant_id).unwrap().len(), 1);

        // Upsert keeps a single record.
        let mut renamed = volume.clone();
        renamed.name = String::from("scratch");
        ds.add_block_device(renamed).unwrap();
        let devices = ds.get_block_devices(tenant_id).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "scratch");

        ds.delete_block_device(volume.id).unwrap();
        assert!(ds.get_block_devices(tenant_id).unwrap().is_empty());
        assert!(matches!(
            ds.get_block_device(volume.id),
            Err(Error::NoBlockData)
        ));

        assert!(matches!(
            ds.get_block_devices(Uuid::new_v4()),
            Err(Error::TenantNotFound)
        ));
    }

    #[test]
    fn test_attach_volume_failure_cleanup() {
        let (store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let node_id = Uuid::new_v4();
        let volume = test_volume(tenant_id);
        ds.add_block_device(volume.clone()).unwrap();

        let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
        let mut instance = test_instance(tenant_id, ip);
        instance.node_id = Some(node_id);
        ds.add_instance(&instance).unwrap();

        ds.create_storage_attachment(instance.id, volume.id, false, false)
            .unwrap();
        ds.attach_volume_failure(
            instance.id,
            volume.id,
            AttachVolumeFailureReason::AttachFailure,
        )
        .unwrap();

        assert_eq!(
            ds.get_block_device(volume.id).unwrap().state,
            VolumeState::Available
        );
        let node = ds.get_node(node_id).unwrap();
        assert_eq!(node.total_failures, 1);
        assert_eq!(node.attach_volume_failures, 1);
        assert_eq!(store.event_count(), 1);
    }

    #[test]
    fn test_update_block_device_requires_existing() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let volume = test_volume(tenant_id);
        assert!(matches!(
            ds.update_block_device(volume),
            Err(Error::NoBlockData)
        ));
    }
}
