//! Core record model and upsert planning for launch ingestion.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "launch-core";

/// Field carrying the stable upstream identifier.
pub const ID_FIELD: &str = "id";

/// One upstream launch document, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchRecord(Map<String, JsonValue>);

impl LaunchRecord {
    /// Identifier used as the storage key. Only non-empty strings qualify.
    pub fn id(&self) -> Option<&str> {
        match self.0.get(ID_FIELD) {
            Some(JsonValue::String(id)) if !id.is_empty() => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn into_payload(self) -> JsonValue {
        JsonValue::Object(self.0)
    }
}

impl TryFrom<JsonValue> for LaunchRecord {
    type Error = JsonValue;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Object(fields) => Ok(Self(fields)),
            other => Err(other),
        }
    }
}

/// Row as held by a store after a successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLaunch {
    pub id: String,
    pub payload: JsonValue,
    pub ingested_at: DateTime<Utc>,
}

/// Write-ready row: an identifier plus the full document it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRow {
    pub id: String,
    pub payload: JsonValue,
}

/// Rows to write for one run, with per-record identifiers resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertPlan {
    pub rows: Vec<PendingRow>,
    pub skipped_without_id: usize,
    pub superseded: usize,
}

impl UpsertPlan {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Resolve a fetched sequence into one pending row per identifier.
///
/// Records without an identifier are dropped. When an identifier repeats, the
/// payload of its last occurrence wins while the row keeps the position of the
/// first occurrence, so every id appears exactly once and no write statement
/// touches the same key twice.
pub fn plan_upsert(records: impl IntoIterator<Item = LaunchRecord>) -> UpsertPlan {
    let mut plan = UpsertPlan::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in records {
        let Some(id) = record.id().map(str::to_owned) else {
            plan.skipped_without_id += 1;
            continue;
        };

        match positions.get(&id) {
            Some(&index) => {
                plan.rows[index].payload = record.into_payload();
                plan.superseded += 1;
            }
            None => {
                positions.insert(id.clone(), plan.rows.len());
                plan.rows.push(PendingRow {
                    id,
                    payload: record.into_payload(),
                });
            }
        }
    }

    plan
}
