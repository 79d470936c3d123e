//! Session and Iteration: the domain record of one question-answering run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::context::ContextSnapshot;
use crate::decision::PlannerDecision;
use crate::observation::Observation;
use crate::tool::ToolCall;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One question-answering run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub question: String,
    pub max_iterations: u32,
    status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(question: impl Into<String>, max_iterations: u32) -> Self {
        Self::with_id(SessionId::new(), question, max_iterations)
    }

    pub fn with_id(id: SessionId, question: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            id,
            question: question.into(),
            max_iterations,
            status: SessionStatus::Running,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Set the terminal status. Only the first call has an effect; returns
    /// whether it did.
    pub fn finish(&mut self, status: SessionStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    ToolExecuted,
    Answered,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationErrorKind {
    /// The decision stream was malformed.
    Parse,
    /// Unknown tool or invalid arguments.
    Resolution,
}

impl IterationErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Resolution => "resolution",
        }
    }
}

/// An iteration-scoped error, recorded and fed back into the next context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationError {
    pub kind: IterationErrorKind,
    pub message: String,
}

/// One plan → act → observe cycle. Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub context: Arc<ContextSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<PlannerDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IterationError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: IterationOutcome,
}

impl Iteration {
    pub fn is_errored(&self) -> bool {
        self.outcome == IterationOutcome::Errored
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.decision.as_ref().and_then(PlannerDecision::reasoning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_is_set_once() {
        let mut session = Session::new("What were total sales last month?", 5);
        assert_eq!(session.status(), SessionStatus::Running);
        assert!(session.finish(SessionStatus::Completed));
        assert!(!session.finish(SessionStatus::Failed));
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[test]
    fn running_is_not_a_terminal_transition() {
        let mut session = Session::new("q", 1);
        assert!(!session.finish(SessionStatus::Running));
        assert!(session.finish(SessionStatus::Cancelled));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }
}
