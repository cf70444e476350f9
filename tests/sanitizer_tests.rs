/// Startup tests
///
/// In-flight state left behind by a previous process is reset before any
/// discovery runs, the storage guard is rebuilt from persisted flags and
/// known reachable services are scheduled again.
/// Run with: cargo test --test sanitizer_tests

#[path = "support.rs"]
mod support;

use rack_discovery::prelude::*;
use rack_discovery::sanitize::SanitizerSet;
use support::*;
use uuid::Uuid;

fn system(service_id: Uuid, uri: &str, state: DeepDiscoveryState) -> DiscoverableEntity {
    let mut system = DiscoverableEntity::new(EntityKind::ComputerSystem, service_id, Some(uri.into()));
    system.discovered = true;
    system.metadata.deep_discovery_state = state;
    system
}

#[tokio::test]
async fn test_in_progress_states_are_reset() {
    let store = EntityStore::shared();
    let owner = Uuid::new_v4();
    let waiting = system(owner, "/Systems/1", DeepDiscoveryState::WaitingToStart);
    let running = system(owner, "/Systems/2", DeepDiscoveryState::Running);
    let done = system(owner, "/Systems/3", DeepDiscoveryState::Done);
    let assembling = ComposedNode::new("assembling", ComposedNodeState::Assembling);
    let assembled = ComposedNode::new("assembled", ComposedNodeState::Assembled);

    let tx = store.begin().await.unwrap();
    for entity in [&waiting, &running, &done] {
        tx.save_entity(entity.clone()).await.unwrap();
    }
    tx.save_composed_node(assembling.clone()).await.unwrap();
    tx.save_composed_node(assembled.clone()).await.unwrap();
    tx.commit().await.unwrap();

    let report = SanitizerSet::with_defaults()
        .run(&store, &TransactionPolicy::default())
        .await
        .unwrap();
    assert_eq!(report.get("deep_discovery"), Some(&2));
    assert_eq!(report.get("composed_nodes"), Some(&1));

    let state = store.snapshot().await;
    for id in [waiting.id, running.id] {
        assert_eq!(state.entity(id).unwrap().metadata.deep_discovery_state, DeepDiscoveryState::Initial);
    }
    assert_eq!(state.entity(done.id).unwrap().metadata.deep_discovery_state, DeepDiscoveryState::Done);

    let failed = state.composed_node(assembling.id).unwrap();
    assert_eq!(failed.state, ComposedNodeState::Failed);
    assert_eq!(failed.status, Some(Status::OFFLINE_CRITICAL));
    assert_eq!(state.composed_node(assembled.id).unwrap().state, ComposedNodeState::Assembled);
}

#[tokio::test]
async fn test_clean_store_is_left_untouched() {
    let store = EntityStore::shared();
    let version = store.version().await;

    let report = SanitizerSet::default()
        .run(&store, &TransactionPolicy::default())
        .await
        .unwrap();
    assert!(report.values().all(|count| *count == 0));
    assert_eq!(store.version().await, version);
}

#[tokio::test]
async fn test_engine_start_restores_previous_state() {
    let remote = FixtureRemote::new();
    let spec = compute_fixture("http://psme-1");
    let service_id = spec.id;
    remote.add_service(spec.clone());

    // State a previous process left behind.
    let store = EntityStore::shared();
    let host = {
        let mut host = system(service_id, "/Systems/1", DeepDiscoveryState::Running);
        host.metadata.storage_service_host = true;
        host.set_property("uuid", serde_json::json!(SYSTEM_UUID));
        host
    };
    let stale_node = ComposedNode::new("half-built", ComposedNodeState::Allocating);
    let gone = ExternalService::new(Uuid::new_v4(), "http://psme-gone", ServiceType::PrimaryCompute);
    let mut unreachable = gone.clone();
    unreachable.mark_unreachable(chrono::Utc::now());

    let tx = store.begin().await.unwrap();
    tx.save_service(ExternalService::new(service_id, spec.base_uri.clone(), spec.service_type))
        .await
        .unwrap();
    tx.save_service(unreachable).await.unwrap();
    tx.save_entity(host.clone()).await.unwrap();
    tx.save_composed_node(stale_node.clone()).await.unwrap();
    tx.commit().await.unwrap();

    let engine = DiscoveryEngine::new(quiet_config(), store, RemoteCollaborators::from_fixture(&remote))
        .await
        .unwrap();
    let report = engine.start().await.unwrap();

    assert_eq!(report.sanitized.get("deep_discovery"), Some(&1));
    assert_eq!(report.sanitized.get("composed_nodes"), Some(&1));
    assert_eq!(report.protected_systems, 1);
    assert_eq!(report.rescheduled_services, 1);

    assert!(engine.guard().is_protected(host.id).await);
    assert!(engine.scheduler().is_scheduled(service_id).await);
    assert!(!engine.scheduler().is_scheduled(gone.id).await);
    assert_eq!(remote.root_fetches("http://psme-1"), 1);

    // The rescheduled pass reconciled the persisted host with the fixture.
    let state = engine.snapshot().await;
    let reconciled = state.entity(host.id).unwrap();
    assert_eq!(reconciled.metadata.deep_discovery_state, DeepDiscoveryState::Initial);
    assert_eq!(reconciled.property_str("model"), Some("S2600"));

    let summary = engine.summary().await;
    assert_eq!(summary.protected_systems, vec![host.id]);
    assert_eq!(summary.composed_nodes, 1);
    assert_eq!(summary.entities_by_kind.get("ComputerSystem"), Some(&1));

    engine.stop().await.unwrap();
}
