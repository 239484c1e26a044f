use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::monitoring::types::Vendor;
use crate::monitoring::validation::{REQUEST_BODY_KEY, TargetSettings};

/// Monitored chat-completion target. Owned by the admin collaborator; the
/// core only reads it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub name: String,
    pub vendor: Vendor,
    /// May carry a reasoning directive, e.g. `o3@high`
    pub model: String,
    pub endpoint: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub enabled: bool,
    /// Excluded from scheduling but still listed in snapshots
    pub maintenance: bool,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Target {
    /// Create a new enabled target with no overrides
    pub fn new(
        name: impl Into<String>,
        vendor: Vendor,
        model: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            vendor,
            model: model.into(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            enabled: true,
            maintenance: false,
            request_headers: HashMap::new(),
            metadata: Map::new(),
        }
    }

    pub fn settings(&self) -> TargetSettings {
        TargetSettings::from_metadata(&self.metadata)
    }

    /// Extra body parameters merged into every probe request.
    pub fn request_body_overrides(&self) -> Option<&Map<String, Value>> {
        self.metadata.get(REQUEST_BODY_KEY).and_then(Value::as_object)
    }

    /// Whether the scheduler should consider this target at all.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.maintenance
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("maintenance", &self.maintenance)
            .field("request_headers", &self.request_headers.keys().collect::<Vec<_>>())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Singleton execution lease row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.owner_id.is_some() && self.expires_at > now
    }

    pub fn is_held_by(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        self.is_live(now) && self.owner_id.as_deref() == Some(node_id)
    }
}

/// Convert a timestamp to Unix milliseconds for storage
pub fn timestamp_to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert stored Unix milliseconds back to a timestamp
pub fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
