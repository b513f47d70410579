use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod api_contracts;
pub mod patch_protocol;

pub const COLLECTION_TIMELINE: &str = "timeline";
pub const COLLECTION_FINDINGS: &str = "findings";

const CREDENTIAL_SENTINELS: &[&str] = &["null", "undefined"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("entity id must not be empty")]
    EmptyId,
    #[error("snapshot must be a JSON object")]
    NotAnObject,
    #[error("snapshot has no id field")]
    MissingId,
    #[error("invalid snapshot field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ModelError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelError::EmptyId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = ModelError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::new(input)
    }
}

impl Serialize for EntityId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = deserialize_flexible_id(deserializer)?;
        EntityId::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Backend ids arrive as UUID strings for jobs and integers for hunts.
pub(crate) fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    flexible_id(&val).ok_or_else(|| serde::de::Error::custom("expected string or number for id"))
}

pub(crate) fn deserialize_optional_flexible_id<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Option::<Value>::deserialize(deserializer)?;
    match val {
        None | Some(Value::Null) => Ok(None),
        Some(val) => flexible_id(&val)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected string or number for id")),
    }
}

fn flexible_id(val: &Value) -> Option<String> {
    match val {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Job,
    Hunt,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Job => "job",
            EntityKind::Hunt => "hunt",
        }
    }

    /// Path segments of the push channel, relative to the websocket base.
    pub fn channel_route(&self) -> [&'static str; 2] {
        match self {
            EntityKind::Job => ["ws", "jobs"],
            EntityKind::Hunt => ["hunt_ws", "hunts"],
        }
    }

    /// Path segments of the snapshot endpoint, relative to the REST base.
    pub fn snapshot_route<'a>(&self, id: &'a EntityId) -> Vec<&'a str> {
        match self {
            EntityKind::Job => vec!["ai_analysis", "jobs", id.as_str()],
            EntityKind::Hunt => vec!["threat_hunt", id.as_str(), "findings"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Created,
    Queued,
    Pending,
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
    Closed,
    Unknown,
}

impl Default for Status {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Queued => "queued",
            Status::Pending => "pending",
            Status::Idle => "idle",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Stopped => "stopped",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Closed => "closed",
            Status::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn parse_lenient(input: &str) -> Self {
        input.parse().unwrap_or(Status::Unknown)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "created" => Ok(Status::Created),
            "queued" => Ok(Status::Queued),
            "pending" => Ok(Status::Pending),
            "idle" => Ok(Status::Idle),
            "running" | "in_progress" | "in-progress" => Ok(Status::Running),
            "paused" => Ok(Status::Paused),
            "stopped" => Ok(Status::Stopped),
            "completed" | "complete" | "done" => Ok(Status::Completed),
            "failed" | "error" => Ok(Status::Failed),
            "closed" => Ok(Status::Closed),
            "unknown" => Ok(Status::Unknown),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Status::parse_lenient(&raw))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub total: u64,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let ratio = (self.processed as f64 / self.total as f64) * 100.0;
        ratio.round().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// False for empty tokens and the placeholders a lost session leaves behind.
    pub fn is_usable(&self) -> bool {
        let trimmed = self.0.trim();
        !trimmed.is_empty() && !CREDENTIAL_SENTINELS.contains(&trimmed)
    }

    pub fn expose(&self) -> &str {
        self.0.trim()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_usable() {
            f.write_str("<redacted>")
        } else {
            f.write_str("<missing>")
        }
    }
}

/// Durable entity state as returned by the REST source. Replaced wholesale on
/// every fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: EntityId,
    pub status: Status,
    pub summary: Map<String, Value>,
    pub collections: BTreeMap<String, Vec<Value>>,
    pub fields: Map<String, Value>,
}

impl Snapshot {
    pub fn from_value(value: Value, fallback_id: Option<&EntityId>) -> Result<Self, ModelError> {
        let Value::Object(mut object) = value else {
            return Err(ModelError::NotAnObject);
        };

        let id = match object.remove("id").or_else(|| object.remove("hunt_id")) {
            Some(raw) => {
                let raw = flexible_id(&raw).ok_or(ModelError::InvalidField {
                    field: "id",
                    reason: "expected string or number".to_string(),
                })?;
                EntityId::new(raw)?
            }
            None => fallback_id.cloned().ok_or(ModelError::MissingId)?,
        };

        let status = match object.remove("status") {
            Some(Value::String(raw)) => Status::parse_lenient(&raw),
            Some(Value::Null) | None => Status::Unknown,
            Some(other) => {
                return Err(ModelError::InvalidField {
                    field: "status",
                    reason: format!("expected string, got {other}"),
                })
            }
        };

        let summary = match object.remove("summary") {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(ModelError::InvalidField {
                    field: "summary",
                    reason: format!("expected object, got {other}"),
                })
            }
        };

        let mut collections = BTreeMap::new();
        for (key, name) in [
            (COLLECTION_TIMELINE, COLLECTION_TIMELINE),
            (COLLECTION_FINDINGS, COLLECTION_FINDINGS),
            ("items", COLLECTION_FINDINGS),
        ] {
            match object.remove(key) {
                Some(Value::Array(items)) => {
                    collections.insert(name.to_string(), items);
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    object.insert(key.to_string(), other);
                }
            }
        }

        Ok(Self {
            id,
            status,
            summary,
            collections,
            fields: object,
        })
    }

    pub fn collection(&self, name: &str) -> &[Value] {
        self.collections
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Snapshot::from_value(value, None).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub total: u32,
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

pub fn summarize_findings(findings: &[Value]) -> FindingsSummary {
    let mut summary = FindingsSummary::default();
    for finding in findings {
        summary.total += 1;
        let severity = finding
            .get("severity")
            .and_then(Value::as_str)
            .map(|raw| raw.trim().to_ascii_lowercase());
        match severity.as_deref() {
            Some("low") => summary.low += 1,
            Some("medium") => summary.medium += 1,
            Some("high") => summary.high += 1,
            Some("critical") => summary.critical += 1,
            _ => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_id_rejects_blank_and_accepts_numbers() {
        assert_eq!(EntityId::new("   "), Err(ModelError::EmptyId));
        let parsed: EntityId = serde_json::from_value(json!(42)).expect("numeric id");
        assert_eq!(parsed.as_str(), "42");
    }

    #[test]
    fn status_parsing_is_lenient_and_terminal_set_is_closed() {
        assert_eq!(Status::parse_lenient("RUNNING"), Status::Running);
        assert_eq!(Status::parse_lenient("rebooting"), Status::Unknown);
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Stopped.is_terminal());
        assert!(!Status::Closed.is_terminal());
        assert!("rebooting".parse::<Status>().is_err());
    }

    #[test]
    fn job_snapshot_splits_known_keys_from_fields() {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "id": "6f1c",
            "status": "running",
            "job_name": "nightly",
            "total_logs": 0,
            "summary": {"threat_percentage": 4},
            "timeline": [{"ts": "t1"}]
        }))
        .expect("snapshot");

        assert_eq!(snapshot.id.as_str(), "6f1c");
        assert_eq!(snapshot.status, Status::Running);
        assert_eq!(snapshot.summary.get("threat_percentage"), Some(&json!(4)));
        assert_eq!(snapshot.collection(COLLECTION_TIMELINE).len(), 1);
        assert_eq!(snapshot.fields.get("total_logs"), Some(&json!(0)));
        assert!(snapshot.fields.get("summary").is_none());
    }

    #[test]
    fn hunt_findings_response_maps_items_and_missing_status() {
        let snapshot = Snapshot::from_value(
            json!({
                "hunt_id": 7,
                "items": [{"id": 1, "severity": "high"}],
                "summary": {"total": 1}
            }),
            None,
        )
        .expect("snapshot");

        assert_eq!(snapshot.id.as_str(), "7");
        assert_eq!(snapshot.status, Status::Unknown);
        assert_eq!(snapshot.collection(COLLECTION_FINDINGS).len(), 1);
    }

    #[test]
    fn snapshot_without_id_uses_fallback() {
        let fallback = EntityId::new("9").expect("id");
        let snapshot =
            Snapshot::from_value(json!({"status": "completed"}), Some(&fallback)).expect("snapshot");
        assert_eq!(snapshot.id, fallback);
        assert!(matches!(
            Snapshot::from_value(json!({"status": "completed"}), None),
            Err(ModelError::MissingId)
        ));
        assert!(matches!(
            Snapshot::from_value(json!([1, 2]), None),
            Err(ModelError::NotAnObject)
        ));
    }

    #[test]
    fn credential_rejects_placeholders() {
        assert!(!Credential::new("").is_usable());
        assert!(!Credential::new("null").is_usable());
        assert!(!Credential::new(" undefined ").is_usable());
        assert!(Credential::new("eyJhbGciOi").is_usable());
        assert_eq!(Credential::new("secret").to_string(), "<redacted>");
    }

    #[test]
    fn progress_percent_rounds_and_handles_zero_total() {
        assert_eq!(Progress { processed: 5, total: 0 }.percent(), 0);
        assert_eq!(Progress { processed: 1, total: 3 }.percent(), 33);
        assert_eq!(Progress { processed: 2, total: 3 }.percent(), 67);
    }

    #[test]
    fn findings_summary_counts_known_severities() {
        let summary = summarize_findings(&[
            json!({"severity": "high"}),
            json!({"severity": "Critical"}),
            json!({"severity": "low"}),
            json!({"event": "no severity"}),
        ]);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.high, 1);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.low, 1);
        assert_eq!(summary.medium, 0);
    }
}
