// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-entity datastore scenarios, driven through the public facade with
//! a stubbed persistent store.

use cumulus_datastore::store::PersistentStore;
use cumulus_datastore::test_util::{
    reopen_datastore, test_datastore, test_image, test_instance, test_tenant,
    test_volume, test_workload, FailPoint,
};
use cumulus_datastore::types::{
    Image, InstanceState, InstanceStatReport, NodeRole, NodeStatReport,
    Visibility, VolumeState,
};
use cumulus_datastore::{Config, Datastore, Error};
use std::net::Ipv4Addr;
use uuid::Uuid;

fn stat_report(
    node_id: Uuid,
    instances: Vec<InstanceStatReport>,
) -> NodeStatReport {
    NodeStatReport {
        node_id,
        hostname: String::from("compute-7"),
        load: 2,
        mem_total_mb: 32768,
        mem_available_mb: 30000,
        disk_total_mb: 500000,
        disk_available_mb: 400000,
        cpus_online: 16,
        instances,
    }
}

fn instance_sample(instance_id: Uuid, cpu: i64) -> InstanceStatReport {
    InstanceStatReport {
        instance_id,
        state: InstanceState::Running,
        ssh_ip: Some(Ipv4Addr::new(10, 0, 0, 7).into()),
        ssh_port: 33002,
        cpu_usage: cpu,
        memory_usage_mb: 256,
        disk_usage_mb: 1024,
    }
}

/// Deleting an instance cascades: both attached volumes return to
/// available, the attachment rows disappear, and the private IP goes back
/// to the tenant.
#[test]
fn test_instance_delete_cascade() {
    let (store, ds) = test_datastore();
    let tenant_id = test_tenant(&ds);

    let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
    let instance = test_instance(tenant_id, ip);
    ds.add_instance(&instance).unwrap();

    let v1 = test_volume(tenant_id);
    let v2 = test_volume(tenant_id);
    ds.add_block_device(v1.clone()).unwrap();
    ds.add_block_device(v2.clone()).unwrap();
    ds.create_storage_attachment(instance.id, v1.id, false, true).unwrap();
    ds.create_storage_attachment(instance.id, v2.id, true, false).unwrap();
    assert_eq!(ds.get_block_device(v1.id).unwrap().state, VolumeState::InUse);
    assert_eq!(ds.get_block_device(v2.id).unwrap().state, VolumeState::InUse);

    ds.delete_instance(instance.id).unwrap();

    assert!(matches!(
        ds.get_instance(instance.id),
        Err(Error::InstanceNotFound)
    ));
    assert_eq!(
        ds.get_block_device(v1.id).unwrap().state,
        VolumeState::Available
    );
    assert_eq!(
        ds.get_block_device(v2.id).unwrap().state,
        VolumeState::Available
    );
    assert!(ds.get_storage_attachments(instance.id).is_empty());
    assert!(matches!(
        ds.storage_attachment(instance.id, v1.id),
        Err(Error::NoStorageAttachment)
    ));
    assert_eq!(store.attachment_count(), 0);

    // The private IP was released...
    assert_eq!(store.claimed_ip_count(tenant_id), 0);
    // ...so the tenant can be deleted once its volumes go too.
    ds.delete_block_device(v1.id).unwrap();
    ds.delete_block_device(v2.id).unwrap();
    ds.delete_tenant(tenant_id).unwrap();

    // The deletion was logged.
    assert!(store.event_count() > 0);
}

/// A cascade failure after the persistent delete still finishes cleanup
/// and surfaces the first error.
#[test]
fn test_instance_delete_cascade_surfaces_first_error() {
    let (store, ds) = test_datastore();
    let tenant_id = test_tenant(&ds);

    let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
    let instance = test_instance(tenant_id, ip);
    ds.add_instance(&instance).unwrap();
    let volume = test_volume(tenant_id);
    ds.add_block_device(volume.clone()).unwrap();
    ds.create_storage_attachment(instance.id, volume.id, false, false)
        .unwrap();

    store.fail_next(FailPoint::ReleaseTenantIp);
    assert!(ds.delete_instance(instance.id).is_err());

    // The instance is gone and the attachment cascade still ran.
    assert!(matches!(
        ds.get_instance(instance.id),
        Err(Error::InstanceNotFound)
    ));
    assert_eq!(store.instance_count(), 0);
    assert_eq!(store.attachment_count(), 0);
    assert_eq!(
        ds.get_block_device(volume.id).unwrap().state,
        VolumeState::Available
    );
}

/// Restarting the controller rebuilds every cache from the persistent
/// store: ownership links, visibility indexes, pool address marks and
/// claimed tenant addresses all survive.
#[test]
fn test_restart_repopulates_caches() {
    let (store, ds) = test_datastore();
    let tenant_id = test_tenant(&ds);
    let node_id = Uuid::new_v4();

    let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
    let mut instance = test_instance(tenant_id, ip);
    instance.node_id = Some(node_id);
    ds.add_instance(&instance).unwrap();

    let volume = test_volume(tenant_id);
    ds.add_block_device(volume.clone()).unwrap();
    ds.create_storage_attachment(instance.id, volume.id, false, false)
        .unwrap();

    let image = test_image(Some(tenant_id), "ubuntu", Visibility::Private);
    ds.add_image(image.clone()).unwrap();
    let workload = test_workload(None, Visibility::Public);
    ds.add_workload(workload.clone()).unwrap();

    let pool = ds
        .add_pool("public", &["203.0.113.0/29".parse().unwrap()], &[])
        .unwrap();
    let mapping = ds.map_external_ip(pool.id, instance.id).unwrap();

    // A second controller over the same store sees the same world.
    let ds = reopen_datastore(&store);

    assert_eq!(ds.get_tenant(tenant_id).unwrap().id, tenant_id);
    assert_eq!(ds.get_tenant_instances(tenant_id).len(), 1);
    assert_eq!(ds.get_instances_by_node(node_id).len(), 1);
    assert_eq!(ds.get_block_devices(tenant_id).unwrap().len(), 1);
    assert_eq!(
        ds.storage_attachment(instance.id, volume.id).unwrap().instance_id,
        instance.id
    );
    assert_eq!(
        ds.resolve_image(Some(tenant_id), "ubuntu").unwrap(),
        image.id
    );
    assert_eq!(ds.get_workloads(tenant_id).len(), 1);
    assert_eq!(
        ds.get_mapped_ip(mapping.external_ip).unwrap().instance_id,
        instance.id
    );
    assert_eq!(ds.get_pool(pool.id).unwrap().free, 5);

    // Claimed addresses were reloaded: the next allocation continues after
    // the existing one instead of reusing it.
    let next = ds.allocate_tenant_ip(tenant_id).unwrap();
    assert_eq!(next, Ipv4Addr::new(172, 16, 0, 3));

    // And pool space is still reserved: an overlapping pool is rejected.
    assert!(matches!(
        ds.add_pool("other", &["203.0.113.0/28".parse().unwrap()], &[]),
        Err(Error::DuplicateSubnet)
    ));
}

/// Initialization refuses a store whose images reference tenants that do
/// not exist.
#[test]
fn test_init_rejects_inconsistent_store() {
    let (store, ds) = test_datastore();
    drop(ds);

    let orphan = Image {
        tenant_id: Some(Uuid::new_v4()),
        ..test_image(None, "orphan", Visibility::Private)
    };
    store.update_image(&orphan).unwrap();

    let result = Datastore::init(
        &Config::new("mem://"),
        store.clone(),
        cumulus_datastore::test_util::test_logger(),
    );
    assert!(matches!(result, Err(Error::Inconsistent(_))));
}

/// The stats path ties everything together: the node appears, the instance
/// record follows the report, and tenant usage integrates deltas.
#[test]
fn test_stats_ingestion_flow() {
    let (store, ds) = test_datastore();
    let tenant_id = test_tenant(&ds);
    let node_id = Uuid::new_v4();
    ds.add_node(node_id, NodeRole::COMPUTE);

    let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
    let instance = test_instance(tenant_id, ip);
    ds.add_instance(&instance).unwrap();

    ds.handle_stats(&stat_report(
        node_id,
        vec![instance_sample(instance.id, 10)],
    ))
    .unwrap();
    ds.handle_stats(&stat_report(
        node_id,
        vec![instance_sample(instance.id, 25)],
    ))
    .unwrap();

    let running = ds.get_instance(instance.id).unwrap();
    assert_eq!(running.state, InstanceState::Running);
    assert_eq!(running.node_id, Some(node_id));

    let node_stats = ds.get_node_last_stats();
    assert_eq!(node_stats.len(), 1);
    assert_eq!(node_stats[0].hostname, "compute-7");

    let summaries = ds.get_node_summary();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_instances, 1);
    assert_eq!(summaries[0].total_running_instances, 1);

    // One delta (25 - 10) was folded into the tenant's history.
    let usage = ds.get_tenant_usage(
        tenant_id,
        chrono::Utc::now() - chrono::Duration::minutes(1),
        chrono::Utc::now() + chrono::Duration::minutes(1),
    );
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].vcpu, 15);

    // Both raw reports reached the persistent store.
    assert_eq!(store.node_stat_count(), 2);
    assert_eq!(store.instance_stat_count(), 2);

    // Losing the node leaves the instance missing.
    ds.delete_node(node_id).unwrap();
    assert_eq!(
        ds.get_instance(instance.id).unwrap().state,
        InstanceState::Missing
    );
}

/// Mapping an external address and unmapping it returns the pool to its
/// starting state.
#[test]
fn test_external_ip_round_trip() {
    let (_store, ds) = test_datastore();
    let tenant_id = test_tenant(&ds);
    let ip = ds.allocate_tenant_ip(tenant_id).unwrap();
    let instance = test_instance(tenant_id, ip);
    ds.add_instance(&instance).unwrap();

    let pool = ds
        .add_pool("public", &[], &[Ipv4Addr::new(198, 51, 100, 80)])
        .unwrap();
    assert_eq!(pool.free, 1);

    let mapping = ds.map_external_ip(pool.id, instance.id).unwrap();
    assert_eq!(mapping.external_ip, Ipv4Addr::new(198, 51, 100, 80));
    assert_eq!(mapping.internal_ip, ip);
    assert_eq!(ds.get_pool(pool.id).unwrap().free, 0);

    ds.unmap_external_ip(mapping.external_ip).unwrap();
    assert_eq!(ds.get_pool(pool.id).unwrap().free, 1);
    assert!(ds.get_mapped_ips(None).is_empty());
    ds.delete_pool(pool.id).unwrap();
}
