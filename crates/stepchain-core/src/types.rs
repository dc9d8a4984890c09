use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepchainError;

/// Upper bound on how many runs a single listing may return.
pub const MAX_LIST_LIMIT: usize = 100;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status shared by runs and steps.
///
/// `as_str`/`parse` are the only mapping between the enum and its stored
/// and serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Ongoing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ongoing" => Some(Self::Ongoing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `completed` and `failed` are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which orchestration variant owns a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Chained,
    Sequential,
    Race,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::Chained, Scenario::Sequential, Scenario::Race];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chained => "chained",
            Self::Sequential => "sequential",
            Self::Race => "race",
        }
    }
}

impl FromStr for Scenario {
    type Err = StepchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.as_str() == lowered)
            .ok_or_else(|| StepchainError::UnknownScenario(s.to_string()))
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted view of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub step: u32,
    pub status: RunStatus,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepSnapshot {
    pub fn pending(step: u32) -> Self {
        Self {
            step,
            status: RunStatus::Pending,
            duration_ms: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Persisted view of a run and its ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub id: RunId,
    pub scenario: Scenario,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepSnapshot>,
}

impl RunSnapshot {
    pub fn step(&self, step: u32) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Marker carried by every successful step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    Complete,
}

/// What the step executor hands back when the work finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: u32,
    pub status: Completion,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn complete(step: u32, duration_ms: u64) -> Self {
        Self {
            step,
            status: Completion::Complete,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Ongoing,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert_eq!(RunStatus::parse("running"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Ongoing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_scenario_parse_is_case_insensitive() {
        assert_eq!("CHAINED".parse::<Scenario>().unwrap(), Scenario::Chained);
        assert_eq!(" race ".parse::<Scenario>().unwrap(), Scenario::Race);
        let err = "batch".parse::<Scenario>().unwrap_err();
        assert!(matches!(err, StepchainError::UnknownScenario(s) if s == "batch"));
    }

    #[test]
    fn test_snapshot_uses_camel_case_keys() {
        let run = RunSnapshot {
            id: RunId::from_string("r1"),
            scenario: Scenario::Chained,
            status: RunStatus::Ongoing,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            steps: vec![StepSnapshot::pending(1)],
        };
        let value = serde_json::to_value(&run).unwrap();
        assert_eq!(value["id"], "r1");
        assert_eq!(value["scenario"], "chained");
        assert!(value.get("startedAt").is_some());
        assert!(value["completedAt"].is_null());
        assert_eq!(value["steps"][0]["status"], "pending");
        assert!(value["steps"][0]["durationMs"].is_null());
    }

    #[test]
    fn test_step_result_shape() {
        let value = serde_json::to_value(StepResult::complete(2, 40)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "step": 2, "status": "complete", "durationMs": 40 })
        );
    }
}
