//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use rack_discovery::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const SYSTEM_UUID: &str = "8d3c6a1e-2f44-4b55-9a71-0c2d5e6f7a80";
pub const HOST_MAC: &str = "AA:BB:CC:00:11:22";

/// Long intervals so only the test drives passes; fast verification.
pub fn quiet_config() -> DiscoveryConfig {
    DiscoveryConfig::new()
        .discovery_interval(Duration::from_secs(3600))
        .verification(2, Duration::from_millis(1))
        .unreachable_check_interval(Duration::from_millis(20))
        .service_removal(Duration::from_secs(3600), Duration::from_secs(3600))
        .subscription_renewal_interval(Duration::from_secs(3600))
}

pub fn enabled_ok() -> Value {
    json!({ "state": "Enabled", "health": "OK" })
}

/// Drawer with one chassis, one compute system and its NIC.
pub fn compute_fixture(base_uri: &str) -> FixtureServiceSpec {
    let mut spec = FixtureServiceSpec::new(Uuid::new_v4(), ServiceType::PrimaryCompute, base_uri);
    spec.resources = vec![
        Resource::new("/Chassis/1", "#Chassis.v1_5_0.Chassis")
            .with_property("name", json!("Drawer 1"))
            .with_property("chassis_type", json!("Drawer"))
            .with_property("status", enabled_ok()),
        Resource::new("/Systems/1", "#ComputerSystem.v1_4_0.ComputerSystem")
            .with_property("name", json!("System 1"))
            .with_property("uuid", json!(SYSTEM_UUID))
            .with_property("model", json!("S2600"))
            .with_property("status", enabled_ok()),
        Resource::new("/Systems/1/EthernetInterfaces/1", "EthernetInterface")
            .with_property("mac_address", json!(HOST_MAC))
            .with_property("status", enabled_ok()),
    ];
    spec.links = vec![
        ResourceLink::new("/Chassis/1", "/Systems/1", "contains"),
        ResourceLink::new("/Systems/1", "/Systems/1/EthernetInterfaces/1", "ethernet_interfaces"),
    ];
    spec
}

/// Rack manager exposing the rack chassis.
pub fn rack_fixture(base_uri: &str) -> FixtureServiceSpec {
    let mut spec = FixtureServiceSpec::new(Uuid::new_v4(), ServiceType::RackManager, base_uri);
    spec.resources = vec![
        Resource::new("/Chassis/Rack", "Chassis")
            .with_property("chassis_type", json!("Rack"))
            .with_property("manufacturer", json!("Acme"))
            .with_property("serial_number", json!("RACK-0042"))
            .with_property("asset_tag", json!("A-17"))
            .with_property("status", enabled_ok()),
    ];
    spec
}

pub async fn engine_with(config: DiscoveryConfig, remote: &FixtureRemote) -> Arc<DiscoveryEngine> {
    DiscoveryEngine::with_fixture(config, remote).await.unwrap()
}

pub async fn detect(engine: &DiscoveryEngine, remote: &FixtureRemote, spec: FixtureServiceSpec) -> Uuid {
    let id = spec.id;
    let endpoint = spec.endpoint();
    remote.add_service(spec);
    engine.on_service_detected(&endpoint).await.unwrap();
    id
}

pub fn entity_at<'a>(state: &'a StoreState, service_id: Uuid, uri: &str) -> Option<&'a DiscoverableEntity> {
    state.find_entity_by_source(service_id, uri)
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
