/// Reconciliation tests
///
/// Idempotence, staleness GC, link diffing and the end-to-end lifecycle of
/// a service's entities across discovery passes.
/// Run with: cargo test --test reconciliation_tests

#[path = "support.rs"]
mod support;

use rack_discovery::discovery::PassState;
use rack_discovery::model::EntityLink;
use rack_discovery::prelude::*;
use rack_discovery::registry::Registration;
use serde_json::json;
use support::*;
use uuid::Uuid;

#[tokio::test]
async fn test_second_pass_over_unchanged_graph_writes_nothing() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let id = detect(&engine, &remote, compute_fixture("http://psme-1")).await;

    let before = engine.snapshot().await;
    assert_eq!(before.entities_of_service(id).len(), 3);
    assert_eq!(before.links().len(), 2);

    let runner = engine.scheduler().runner(id).await;
    assert_eq!(runner.run_pass().await.unwrap(), PassState::Done);

    let after = engine.snapshot().await;
    assert_eq!(before.entities_of_service(id), after.entities_of_service(id));
    assert_eq!(before.links(), after.links());
    assert_eq!(before.version(), after.version());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_vanished_resource_is_garbage_collected() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let id = detect(&engine, &remote, compute_fixture("http://psme-1")).await;

    let nic_id = entity_at(&engine.snapshot().await, id, "/Systems/1/EthernetInterfaces/1")
        .unwrap()
        .id;

    remote.remove_resource("http://psme-1", "/Systems/1/EthernetInterfaces/1");
    let runner = engine.scheduler().runner(id).await;
    runner.run_pass().await.unwrap();

    let state = engine.snapshot().await;
    assert!(state.entity(nic_id).is_none());
    assert!(state.links_of(nic_id).is_empty());
    for entity in state.entities_of_service(id) {
        let uri = entity.source_uri.as_deref().unwrap();
        assert!(uri == "/Chassis/1" || uri == "/Systems/1", "unexpected survivor {uri}");
    }
    assert_eq!(runner.last_summary().unwrap().removed, 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_non_discovered_entities_survive_gc() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let id = detect(&engine, &remote, compute_fixture("http://psme-1")).await;

    let manual = DiscoverableEntity::new(EntityKind::Volume, id, None);
    let tx = engine.store().begin().await.unwrap();
    tx.save_entity(manual.clone()).await.unwrap();
    tx.commit().await.unwrap();

    engine.scheduler().runner(id).await.run_pass().await.unwrap();
    assert!(engine.snapshot().await.entity(manual.id).is_some());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_link_diff_removes_only_vanished_edges() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let id = detect(&engine, &remote, compute_fixture("http://psme-1")).await;

    let state = engine.snapshot().await;
    let chassis = entity_at(&state, id, "/Chassis/1").unwrap().id;
    let system = entity_at(&state, id, "/Systems/1").unwrap().id;
    let nic = entity_at(&state, id, "/Systems/1/EthernetInterfaces/1").unwrap().id;

    // Link no graph ever declared, towards an entity of another service.
    let foreign = DiscoverableEntity::new(EntityKind::Manager, Uuid::new_v4(), Some("/Managers/1".into()));
    let manual_link = EntityLink::new(chassis, foreign.id, "managed_by");
    let tx = engine.store().begin().await.unwrap();
    tx.save_entity(foreign.clone()).await.unwrap();
    tx.add_link(manual_link.clone()).await.unwrap();
    tx.commit().await.unwrap();

    remote.remove_link(
        "http://psme-1",
        &ResourceLink::new("/Chassis/1", "/Systems/1", "contains"),
    );
    engine.scheduler().runner(id).await.run_pass().await.unwrap();

    let state = engine.snapshot().await;
    assert!(!state.has_link(&EntityLink::new(chassis, system, "contains")));
    assert!(state.has_link(&EntityLink::new(system, nic, "ethernet_interfaces")));
    assert!(state.has_link(&manual_link));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_service_lifecycle_end_to_end() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let spec = compute_fixture("http://10.0.0.1:8443");
    let endpoint = spec.endpoint();
    let id = detect(&engine, &remote, spec).await;

    let system = entity_at(&engine.snapshot().await, id, "/Systems/1").unwrap().clone();
    assert_eq!(system.property_str("model"), Some("S2600"));

    // Field change: updated in place.
    remote.upsert_resource(
        "http://10.0.0.1:8443",
        Resource::new("/Systems/1", "#ComputerSystem.v1_4_0.ComputerSystem")
            .with_property("name", json!("System 1"))
            .with_property("uuid", json!(SYSTEM_UUID))
            .with_property("model", json!("S2600-R2"))
            .with_property("status", enabled_ok()),
    );
    let runner = engine.scheduler().runner(id).await;
    runner.run_pass().await.unwrap();

    let state = engine.snapshot().await;
    let updated = entity_at(&state, id, "/Systems/1").unwrap();
    assert_eq!(updated.id, system.id);
    assert_eq!(updated.property_str("model"), Some("S2600-R2"));
    assert_eq!(state.entities_of_kind(EntityKind::ComputerSystem).len(), 1);

    // Resource disappears: its entity goes on the next pass.
    remote.remove_resource("http://10.0.0.1:8443", "/Systems/1");
    runner.run_pass().await.unwrap();
    assert!(engine.snapshot().await.entity(system.id).is_none());

    // Same identity at a new address: same service, no duplicate.
    remote.move_service("http://10.0.0.1:8443", "http://10.0.0.2:8443");
    let moved = ServiceEndpoint::new(endpoint.service_type, id, "http://10.0.0.2:8443");
    assert_eq!(engine.on_service_detected(&moved).await.unwrap(), Registration::Updated);
    runner.run_pass().await.unwrap();

    let state = engine.snapshot().await;
    assert_eq!(state.services().len(), 1);
    assert_eq!(state.service(id).unwrap().base_uri, "http://10.0.0.2:8443");
    assert!(entity_at(&state, id, "/Chassis/1").is_some());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_resource_types_are_skipped() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let mut spec = compute_fixture("http://psme-1");
    spec.resources.push(Resource::new("/Chassis/1/Thermal", "#Thermal.v1_1_0.Thermal"));
    let id = detect(&engine, &remote, spec).await;

    let state = engine.snapshot().await;
    assert_eq!(state.entities_of_service(id).len(), 3);
    assert!(entity_at(&state, id, "/Chassis/1/Thermal").is_none());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_protocol_failure_leaves_persisted_graph_untouched() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let id = detect(&engine, &remote, compute_fixture("http://psme-1")).await;
    let before = engine.snapshot().await;

    remote.remove_resource("http://psme-1", "/Systems/1");
    remote.set_failure("http://psme-1", Some(FixtureFailure::Protocol));
    let runner = engine.scheduler().runner(id).await;
    let err = runner.run_pass().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Protocol { .. }));
    assert_eq!(runner.state(), PassState::Failed);

    let after = engine.snapshot().await;
    assert_eq!(before.entities_of_service(id), after.entities_of_service(id));
    assert!(after.service(id).unwrap().reachable);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_storage_service_protects_its_host() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let compute = detect(&engine, &remote, compute_fixture("http://psme-1")).await;

    let mut storage = FixtureServiceSpec::new(Uuid::new_v4(), ServiceType::Storage, "http://rss-1");
    storage.mac_address = Some(HOST_MAC.to_lowercase());
    storage.resources.push(Resource::new("/Services/1", "StorageService").with_property("status", enabled_ok()));
    detect(&engine, &remote, storage).await;

    let state = engine.snapshot().await;
    let system = entity_at(&state, compute, "/Systems/1").unwrap();
    assert!(system.metadata.storage_service_host);
    assert!(system.metadata.allocated);
    assert!(engine.guard().is_protected(system.id).await);

    // Protected systems are never garbage collected.
    remote.remove_resource("http://psme-1", "/Systems/1");
    engine.scheduler().runner(compute).await.run_pass().await.unwrap();
    assert!(engine.snapshot().await.entity(system.id).is_some());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_limited_image_merges_into_known_system_and_completes_deep_discovery() {
    let remote = FixtureRemote::new();
    let engine = engine_with(quiet_config(), &remote).await;
    let compute = detect(&engine, &remote, compute_fixture("http://psme-1")).await;

    let mut system = entity_at(&engine.snapshot().await, compute, "/Systems/1").unwrap().clone();
    system.metadata.deep_discovery_state = DeepDiscoveryState::Running;
    let tx = engine.store().begin().await.unwrap();
    tx.save_entity(system.clone()).await.unwrap();
    tx.commit().await.unwrap();

    let mut image = FixtureServiceSpec::new(Uuid::new_v4(), ServiceType::LimitedImage, "http://lui-1");
    image.resources.push(
        Resource::new("/Systems/lui", "ComputerSystem")
            .with_property("uuid", json!(SYSTEM_UUID.to_uppercase()))
            .with_property("bios_version", json!("2.1"))
            .with_property("status", enabled_ok()),
    );
    detect(&engine, &remote, image).await;

    let state = engine.snapshot().await;
    assert_eq!(state.entities_of_kind(EntityKind::ComputerSystem).len(), 1);
    let merged = state.entity(system.id).unwrap();
    assert_eq!(merged.metadata.deep_discovery_state, DeepDiscoveryState::Done);
    assert!(merged.metadata.deep_discovered);
    assert_eq!(merged.property_str("bios_version"), Some("2.1"));

    engine.stop().await.unwrap();
}
