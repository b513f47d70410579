//! Request and response bodies of the REST routes the watcher drives.

use crate::{deserialize_flexible_id, deserialize_optional_flexible_id, EntityId, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Dev,
    Lab,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Environment::Prod),
            "dev" | "development" => Ok(Environment::Dev),
            "lab" => Ok(Environment::Lab),
            other => Err(format!("Unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntScope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub dataset_id: i64,
    pub time_range_start: DateTime<Utc>,
    pub time_range_end: DateTime<Utc>,
    pub environment: Environment,
}

impl HuntScope {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("hunt name must not be empty".to_string());
        }
        if self.time_range_end <= self.time_range_start {
            return Err("time range end must be after its start".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntSession {
    pub hunt_id: EntityId,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub hypothesis: String,
    #[serde(default)]
    pub techniques: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rational: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    Manual,
    AiAssisted,
    Automated,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(ExecutionMode::Manual),
            "ai-assisted" | "ai_assisted" | "ai" => Ok(ExecutionMode::AiAssisted),
            "automated" | "auto" => Ok(ExecutionMode::Automated),
            other => Err(format!("Unknown execution mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    Quick,
    Standard,
    Deep,
}

impl FromStr for SearchDepth {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(SearchDepth::Quick),
            "standard" => Ok(SearchDepth::Standard),
            "deep" => Ok(SearchDepth::Deep),
            other => Err(format!("Unknown search depth: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub mode: ExecutionMode,
    pub depth: SearchDepth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::AiAssisted,
            depth: SearchDepth::Standard,
            strategy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAck {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub execution_id: String,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    ConfirmedThreat,
    FalsePositive,
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::ConfirmedThreat => "confirmed_threat",
            Verdict::FalsePositive => "false_positive",
            Verdict::Inconclusive => "inconclusive",
        };
        f.write_str(label)
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "confirmed_threat" | "confirmed" => Ok(Verdict::ConfirmedThreat),
            "false_positive" => Ok(Verdict::FalsePositive),
            "inconclusive" => Ok(Verdict::Inconclusive),
            other => Err(format!("Unknown verdict: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConclusionConfidence {
    Low,
    Medium,
    High,
}

impl FromStr for ConclusionConfidence {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ConclusionConfidence::Low),
            "medium" => Ok(ConclusionConfidence::Medium),
            "high" => Ok(ConclusionConfidence::High),
            other => Err(format!("Unknown confidence: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conclusion {
    pub verdict: Verdict,
    pub confidence: ConclusionConfidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDataset {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub job_name: String,
    pub model_name: String,
    pub time_range_from: DateTime<Utc>,
    pub time_range_to: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisAccepted {
    #[serde(alias = "id", deserialize_with = "deserialize_flexible_id")]
    pub job_id: String,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogLine {
    #[serde(default, deserialize_with = "deserialize_optional_flexible_id")]
    pub id: Option<String>,
    #[serde(default, alias = "line")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn execution_request_serializes_backend_literals() {
        let request = ExecutionRequest {
            mode: ExecutionMode::AiAssisted,
            depth: SearchDepth::Deep,
            strategy: Some("lateral movement first".to_string()),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["mode"], "ai-assisted");
        assert_eq!(value["depth"], "deep");
        assert_eq!("ai".parse::<ExecutionMode>(), Ok(ExecutionMode::AiAssisted));
    }

    #[test]
    fn scope_validation_rejects_inverted_ranges() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let scope = HuntScope {
            name: "beaconing".to_string(),
            description: None,
            dataset_id: 3,
            time_range_start: start,
            time_range_end: start,
            environment: Environment::Prod,
        };
        assert!(scope.validate().is_err());
        let value = serde_json::to_value(&scope).expect("serialize");
        assert_eq!(value["environment"], "prod");
        assert!(value.get("description").is_none());
    }

    #[test]
    fn acks_accept_numeric_ids() {
        let ack: ExecutionAck =
            serde_json::from_value(json!({"execution_id": 12, "status": "running"}))
                .expect("ack");
        assert_eq!(ack.execution_id, "12");
        assert_eq!(ack.status, Status::Running);

        let session: HuntSession =
            serde_json::from_value(json!({"hunt_id": 4, "status": "created"})).expect("session");
        assert_eq!(session.hunt_id.as_str(), "4");

        let dataset: LogDataset =
            serde_json::from_value(json!({"id": 2, "name": "dns", "rows": 100}))
                .expect("dataset");
        assert_eq!(dataset.extra.get("rows"), Some(&json!(100)));
    }

    #[test]
    fn verdict_round_trips_through_display() {
        for verdict in [
            Verdict::ConfirmedThreat,
            Verdict::FalsePositive,
            Verdict::Inconclusive,
        ] {
            assert_eq!(verdict.to_string().parse::<Verdict>(), Ok(verdict));
        }
    }
}
