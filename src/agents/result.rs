//! `AgentResult` (`spec.md` §3): the value a workflow step collects once an
//! agent's node graph finishes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_type: String,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub response: String,
    pub data_outputs: HashMap<String, Value>,
    pub tools_used: Vec<String>,
    #[serde(with = "duration_secs_f64")]
    pub execution_time: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Free-form notes that don't change the success/failure outcome —
    /// e.g. the JSON-repair warning of §4.6.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentResult {
    /// A short, human-scannable summary of the response, matching the
    /// teacher's `TaskOutput::generate_summary` convention: the first ten
    /// words followed by an ellipsis when the text runs longer than that.
    pub fn summary(&self) -> String {
        let words: Vec<&str> = self.response.split_whitespace().take(10).collect();
        let joined = words.join(" ");
        if self.response.split_whitespace().count() > 10 {
            format!("{joined}...")
        } else {
            joined
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success)
    }
}

mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
