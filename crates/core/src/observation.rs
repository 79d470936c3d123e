//! Observation: what happened when a ToolCall ran.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Success,
    Failure,
    Timeout,
}

impl ObservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

/// The result of a ToolCall. `error` is set iff `status != Success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub call_id: String,
    pub tool_name: String,
    pub status: ObservationStatus,
    /// Tool-specific result data, opaque to the agent loop.
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub attempts: u32,
}

impl Observation {
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        payload: Value,
        elapsed_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: ObservationStatus::Success,
            payload,
            error: None,
            elapsed_ms,
            attempts,
        }
    }

    pub fn failure(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
        elapsed_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: ObservationStatus::Failure,
            payload: Value::Null,
            error: Some(error.into()),
            elapsed_ms,
            attempts,
        }
    }

    pub fn timeout(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
        elapsed_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            status: ObservationStatus::Timeout,
            ..Self::failure(call_id, tool_name, error, elapsed_ms, attempts)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ObservationStatus::Success
    }

    /// Short human-readable summary used as a warm context fact.
    pub fn summary(&self) -> String {
        match (&self.status, &self.error) {
            (ObservationStatus::Success, _) => format!(
                "Tool {} succeeded after {} attempt(s): {}",
                self.tool_name, self.attempts, self.payload
            ),
            (status, error) => format!(
                "Tool {} ended with {} after {} attempt(s): {}",
                self.tool_name,
                status.as_str(),
                self.attempts,
                error.as_deref().unwrap_or("no detail")
            ),
        }
    }
}
