// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image catalog.
//!
//! An image lives in one of three visibility namespaces: private to a
//! tenant, public, or internal to the system.  Name-or-id resolution
//! searches the caller's private images first, then public, then internal,
//! and insertion is refused whenever it would make resolution ambiguous.

use crate::datastore::{Datastore, ImageTable, TenantState};
use crate::error::Error;
use crate::types::{Image, Visibility};
use std::collections::HashMap;
use uuid::Uuid;

/// Name-or-id lookup across the namespaces visible to `tenant_id`.  Caller
/// holds the tenants and images locks.
fn resolve_image_in(
    tenants: &HashMap<Uuid, TenantState>,
    images: &ImageTable,
    tenant_id: Option<Uuid>,
    name: &str,
) -> Option<Uuid> {
    if let Some(tenant_id) = tenant_id {
        if let Some(state) = tenants.get(&tenant_id) {
            for id in &state.images {
                if let Some(image) = images.images.get(id) {
                    if image.name == name || id.to_string() == name {
                        return Some(*id);
                    }
                }
            }
        }
    }

    for id in images.public.iter().chain(images.internal.iter()) {
        if let Some(image) = images.images.get(id) {
            if image.name == name || id.to_string() == name {
                return Some(*id);
            }
        }
    }

    None
}

impl Datastore {
    /// Adds an image to the catalog and the visibility index it belongs in.
    pub fn add_image(&self, image: Image) -> Result<(), Error> {
        let mut tenants = self.tenants.write().unwrap();
        let mut images = self.images.write().unwrap();

        if images.images.contains_key(&image.id) {
            return Err(Error::AlreadyExists);
        }
        if image.visibility == Visibility::Private && image.tenant_id.is_none()
        {
            return Err(Error::invalid_request(
                "a private image requires a tenant",
            ));
        }
        if let Some(tenant_id) = image.tenant_id {
            if !tenants.contains_key(&tenant_id) {
                return Err(Error::TenantNotFound);
            }
        }
        if resolve_image_in(&tenants, &images, image.tenant_id, &image.name)
            .is_some()
        {
            return Err(Error::AlreadyExists);
        }

        self.db.update_image(&image)?;

        if let Some(tenant_id) = image.tenant_id {
            tenants.get_mut(&tenant_id).unwrap().images.push(image.id);
        }
        match image.visibility {
            Visibility::Public => images.public.push(image.id),
            Visibility::Internal => images.internal.push(image.id),
            Visibility::Private => (),
        }
        images.images.insert(image.id, image);
        Ok(())
    }

    /// Updates image metadata.  Tenant and visibility are immutable; a
    /// rename must not collide within the visible namespaces.
    pub fn update_image(&self, image: Image) -> Result<(), Error> {
        let tenants = self.tenants.read().unwrap();
        let mut images = self.images.write().unwrap();

        let old = images.images.get(&image.id).ok_or(Error::NoImage)?;
        if old.tenant_id != image.tenant_id
            || old.visibility != image.visibility
        {
            return Err(Error::invalid_request(
                "image tenant and visibility cannot be changed",
            ));
        }
        if old.name != image.name
            && resolve_image_in(&tenants, &images, image.tenant_id, &image.name)
                .is_some()
        {
            return Err(Error::AlreadyExists);
        }

        self.db.update_image(&image)?;
        images.images.insert(image.id, image);
        Ok(())
    }

    pub fn get_image(&self, image_id: Uuid) -> Result<Image, Error> {
        let images = self.images.read().unwrap();
        images.images.get(&image_id).cloned().ok_or(Error::NoImage)
    }

    /// Resolves an image by name or id string.  Pass no tenant for callers
    /// with no private namespace (the admin paths).
    pub fn resolve_image(
        &self,
        tenant_id: Option<Uuid>,
        name: &str,
    ) -> Result<Uuid, Error> {
        let tenants = self.tenants.read().unwrap();
        let images = self.images.read().unwrap();

        if let Some(tenant_id) = tenant_id {
            if !tenants.contains_key(&tenant_id) {
                return Err(Error::TenantNotFound);
            }
        }

        resolve_image_in(&tenants, &images, tenant_id, name)
            .ok_or(Error::NoImage)
    }

    /// The images visible to a tenant, plus internal images for admin
    /// callers.  Public images are always included.
    pub fn get_images(
        &self,
        tenant_id: Option<Uuid>,
        admin: bool,
    ) -> Result<Vec<Image>, Error> {
        let tenants = self.tenants.read().unwrap();
        let images = self.images.read().unwrap();

        let mut result = Vec::new();
        if let Some(tenant_id) = tenant_id {
            let state =
                tenants.get(&tenant_id).ok_or(Error::TenantNotFound)?;
            for id in &state.images {
                if let Some(image) = images.images.get(id) {
                    result.push(image.clone());
                }
            }
        }
        if admin {
            for id in &images.internal {
                if let Some(image) = images.images.get(id) {
                    result.push(image.clone());
                }
            }
        }
        for id in &images.public {
            if let Some(image) = images.images.get(id) {
                result.push(image.clone());
            }
        }
        Ok(result)
    }

    /// Removes an image from the catalog and every index referencing it.
    pub fn delete_image(&self, image_id: Uuid) -> Result<(), Error> {
        let mut tenants = self.tenants.write().unwrap();
        let mut images = self.images.write().unwrap();

        let image =
            images.images.get(&image_id).cloned().ok_or(Error::NoImage)?;
        if let Some(tenant_id) = image.tenant_id {
            if !tenants.contains_key(&tenant_id) {
                return Err(Error::TenantNotFound);
            }
        }

        self.db.delete_image(image_id)?;

        if let Some(tenant_id) = image.tenant_id {
            let state = tenants.get_mut(&tenant_id).unwrap();
            state.images.retain(|id| *id != image_id);
        }
        match image.visibility {
            Visibility::Public => images.public.retain(|id| *id != image_id),
            Visibility::Internal => {
                images.internal.retain(|id| *id != image_id)
            }
            Visibility::Private => (),
        }
        images.images.remove(&image_id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{test_datastore, test_image, test_tenant};

    #[test]
    fn test_resolution_order_and_scopes() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);

        let private =
            test_image(Some(tenant_id), "ubuntu", Visibility::Private);
        let public = test_image(None, "fedora", Visibility::Public);
        let internal = test_image(None, "cnci-base", Visibility::Internal);
        ds.add_image(private.clone()).unwrap();
        ds.add_image(public.clone()).unwrap();
        ds.add_image(internal.clone()).unwrap();

        // A tenant sees its own, public and internal images.
        assert_eq!(
            ds.resolve_image(Some(tenant_id), "ubuntu").unwrap(),
            private.id
        );
        assert_eq!(
            ds.resolve_image(Some(tenant_id), "fedora").unwrap(),
            public.id
        );
        assert_eq!(
            ds.resolve_image(Some(tenant_id), "cnci-base").unwrap(),
            internal.id
        );

        // Without a tenant scope only public and internal resolve.
        assert!(matches!(
            ds.resolve_image(None, "ubuntu"),
            Err(Error::NoImage)
        ));
        assert_eq!(ds.resolve_image(None, "fedora").unwrap(), public.id);

        // Resolution also accepts the id string.
        assert_eq!(
            ds.resolve_image(None, &public.id.to_string()).unwrap(),
            public.id
        );

        assert!(matches!(
            ds.resolve_image(Some(Uuid::new_v4()), "fedora"),
            Err(Error::TenantNotFound)
        ));
    }

    #[test]
    fn test_name_collisions_rejected() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);

        ds.add_image(test_image(None, "base", Visibility::Public)).unwrap();

        // A tenant image clashing with a visible public name is refused.
        assert!(matches!(
            ds.add_image(test_image(
                Some(tenant_id),
                "base",
                Visibility::Private
            )),
            Err(Error::AlreadyExists)
        ));

        let other = test_image(Some(tenant_id), "other", Visibility::Private);
        ds.add_image(other.clone()).unwrap();

        // Renaming onto an existing name is refused too.
        let mut renamed = other.clone();
        renamed.name = String::from("base");
        assert!(matches!(
            ds.update_image(renamed),
            Err(Error::AlreadyExists)
        ));

        // Visibility is immutable.
        let mut published = other;
        published.visibility = Visibility::Public;
        published.tenant_id = None;
        assert!(matches!(
            ds.update_image(published),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_get_images_admin_scope() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        ds.add_image(test_image(Some(tenant_id), "mine", Visibility::Private))
            .unwrap();
        ds.add_image(test_image(None, "shared", Visibility::Public)).unwrap();
        ds.add_image(test_image(None, "system", Visibility::Internal))
            .unwrap();

        assert_eq!(ds.get_images(Some(tenant_id), false).unwrap().len(), 2);
        assert_eq!(ds.get_images(Some(tenant_id), true).unwrap().len(), 3);
        assert_eq!(ds.get_images(None, false).unwrap().len(), 1);
        assert!(matches!(
            ds.get_images(Some(Uuid::new_v4()), false),
            Err(Error::TenantNotFound)
        ));
    }

    #[test]
    fn test_delete_image_cleans_indices() {
        let (_store, ds) = test_datastore();
        let tenant_id = test_tenant(&ds);
        let image = test_image(Some(tenant_id), "mine", Visibility::Private);
        ds.add_image(image.clone()).unwrap();

        ds.delete_image(image.id).unwrap();
        assert!(matches!(ds.get_image(image.id), Err(Error::NoImage)));
        assert!(ds.get_images(Some(tenant_id), false).unwrap().is_empty());

        // The name is free for reuse afterward.
        ds.add_image(test_image(Some(tenant_id), "mine", Visibility::Private))
            .unwrap();
    }
}
