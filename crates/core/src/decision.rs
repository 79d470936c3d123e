//! PlannerDecision: the structured output of one model turn.
//!
//! On the wire the model emits a flat JSON object:
//!
//! ```json
//! {"analysis_complete": false, "reasoning": "...",
//!  "tool_name": "run_query", "tool_arguments": {"sql": "..."},
//!  "final_answer": null}
//! ```
//!
//! In Rust the decision is a tagged union so "neither" and "both" are
//! unrepresentable once parsing succeeds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;

/// Either a tool request or a final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlannerDecision {
    ToolRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        tool_name: String,
        tool_arguments: Map<String, Value>,
    },
    FinalAnswer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        answer: String,
    },
}

impl PlannerDecision {
    /// Build a decision from the closed top-level fields of the wire object.
    ///
    /// `null` counts as absent. Fields outside the known set are ignored.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut complete = None;
        let mut reasoning = None;
        let mut tool_name = None;
        let mut tool_arguments = None;
        let mut final_answer = None;

        for (name, value) in fields {
            if value.is_null() {
                continue;
            }
            match name {
                "analysis_complete" => {
                    complete = Some(value.as_bool().ok_or_else(|| {
                        ParseError::Shape(format!("analysis_complete must be a boolean, got {value}"))
                    })?);
                }
                "reasoning" => reasoning = Some(text_of(value)),
                "tool_name" => {
                    let name = value.as_str().ok_or_else(|| {
                        ParseError::Shape(format!("tool_name must be a string, got {value}"))
                    })?;
                    tool_name = Some(name.to_string());
                }
                "tool_arguments" => {
                    let Value::Object(map) = value else {
                        return Err(ParseError::Shape(format!(
                            "tool_arguments must be an object, got {value}"
                        )));
                    };
                    tool_arguments = Some(map.clone());
                }
                "final_answer" => final_answer = Some(text_of(value)),
                _ => {}
            }
        }

        let complete = complete
            .ok_or_else(|| ParseError::Shape("missing analysis_complete".into()))?;

        if tool_name.is_some() && final_answer.is_some() {
            return Err(ParseError::Shape(
                "both tool_name and final_answer are present".into(),
            ));
        }

        if complete {
            let answer = final_answer.ok_or_else(|| {
                ParseError::Shape("analysis_complete is true but final_answer is missing".into())
            })?;
            Ok(Self::FinalAnswer { reasoning, answer })
        } else {
            let tool_name = tool_name.ok_or_else(|| {
                ParseError::Shape("analysis_complete is false but tool_name is missing".into())
            })?;
            let tool_arguments = tool_arguments.ok_or_else(|| {
                ParseError::Shape(format!("tool_arguments missing for tool '{tool_name}'"))
            })?;
            Ok(Self::ToolRequest {
                reasoning,
                tool_name,
                tool_arguments,
            })
        }
    }

    pub fn reasoning(&self) -> Option<&str> {
        match self {
            Self::ToolRequest { reasoning, .. } | Self::FinalAnswer { reasoning, .. } => {
                reasoning.as_deref()
            }
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::FinalAnswer { .. })
    }

    /// Render back to the wire shape (used for history sent to the model).
    pub fn to_wire(&self) -> Value {
        match self {
            Self::ToolRequest {
                reasoning,
                tool_name,
                tool_arguments,
            } => serde_json::json!({
                "analysis_complete": false,
                "reasoning": reasoning,
                "tool_name": tool_name,
                "tool_arguments": tool_arguments,
                "final_answer": null,
            }),
            Self::FinalAnswer { reasoning, answer } => serde_json::json!({
                "analysis_complete": true,
                "reasoning": reasoning,
                "tool_name": null,
                "tool_arguments": null,
                "final_answer": answer,
            }),
        }
    }
}

/// Free text fields accept any JSON scalar; non-strings keep their JSON form.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One top-level field whose value became syntactically complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedField {
    pub name: String,
    pub value: Value,
}

/// The delta returned by a single `feed()` call: every top-level field that
/// closed within that token, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialUpdate {
    pub fields: Vec<ClosedField>,
}

impl PartialUpdate {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
