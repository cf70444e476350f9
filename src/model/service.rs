use crate::core::ServiceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote management endpoint tracked by its stable identity.
///
/// Owned discoverables are not stored here; they reference the service
/// through `DiscoverableEntity::service_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalService {
    pub id: Uuid,
    pub base_uri: String,
    pub service_type: ServiceType,
    pub reachable: bool,
    /// Set when the service was confirmed unreachable; cleared on recovery.
    pub unreachable_since: Option<DateTime<Utc>>,
    /// A change was announced by the service that no pass has observed yet.
    pub dirty: bool,
    /// Hardware correlation key (storage services only, in practice).
    pub mac_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExternalService {
    pub fn new(id: Uuid, base_uri: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            id,
            base_uri: base_uri.into(),
            service_type,
            reachable: true,
            unreachable_since: None,
            dirty: false,
            mac_address: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_mac_address(mut self, mac_address: impl Into<String>) -> Self {
        self.mac_address = Some(mac_address.into());
        self
    }

    pub fn mark_unreachable(&mut self, at: DateTime<Utc>) {
        if self.reachable || self.unreachable_since.is_none() {
            self.unreachable_since = Some(at);
        }
        self.reachable = false;
    }

    pub fn mark_reachable(&mut self) {
        self.reachable = true;
        self.unreachable_since = None;
    }

    /// Unreachable for longer than `grace` as of `now`.
    pub fn is_evictable(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match (self.reachable, self.unreachable_since) {
            (false, Some(since)) => now - since >= grace,
            _ => false,
        }
    }
}

/// Network presence of a service as seen by detection, before it is
/// (re)registered as an `ExternalService`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_type: ServiceType,
    pub id: Uuid,
    pub base_uri: String,
    #[serde(default)]
    pub mac_address: Option<String>,
}

impl ServiceEndpoint {
    pub fn new(service_type: ServiceType, id: Uuid, base_uri: impl Into<String>) -> Self {
        Self {
            service_type,
            id,
            base_uri: base_uri.into(),
            mac_address: None,
        }
    }

    pub fn with_mac_address(mut self, mac_address: impl Into<String>) -> Self {
        self.mac_address = Some(mac_address.into());
        self
    }
}
