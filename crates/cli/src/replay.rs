//! Replay scripts: a TOML file that stands in for the model provider and the
//! tool bodies, so a session can be run deterministically from the CLI.
//!
//! ```toml
//! question = "What were total sales last month?"
//!
//! [[schemas]]
//! name = "sales"
//! summary = "sales(id int, amount numeric, sold_at date)"
//!
//! [[tools]]
//! name = "run_query"
//! description = "Execute a read-only SQL query"
//! arguments = [{ name = "sql", kind = "string", required = true }]
//! responses = [{ kind = "ok", payload = { row_count = 1, rows = [[42000]] } }]
//!
//! [[turns]]
//! faults = ["rate_limited"]
//! decision = { analysis_complete = false, reasoning = "Need totals", tool_name = "run_query", tool_arguments = { sql = "SELECT SUM(amount) FROM sales" } }
//!
//! [[turns]]
//! decision = { analysis_complete = true, final_answer = "Total sales were $42,000." }
//! ```
//!
//! Turn `i` answers iteration `i`. Its `faults` are returned on the first
//! attempts of that iteration, one per attempt, before the document streams.

use async_trait::async_trait;
use metricchat_agent::ContextHub;
use metricchat_config::ContextConfig;
use metricchat_core::{
    ArgumentSchema, DecisionRequest, FieldSpec, ModelProvider, ProviderError, TokenStream,
    ToolContract, ToolError, ToolRegistry, ValidatedArguments,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse script {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid script: {0}")]
    Invalid(String),
}

/// A parsed replay script.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub question: Option<String>,

    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,

    #[serde(default)]
    pub tools: Vec<FixtureSpec>,

    #[serde(default)]
    pub turns: Vec<TurnSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    pub summary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<FieldSpec>,
    /// Consumed one per call; the last one repeats.
    #[serde(default)]
    pub responses: Vec<ResponseSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSpec {
    Ok {
        payload: Value,
        #[serde(default)]
        delay_ms: u64,
    },
    Error {
        message: String,
        #[serde(default)]
        retryable: bool,
    },
    Hang,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnSpec {
    /// A well-formed decision document, serialised and streamed.
    #[serde(default)]
    pub decision: Option<Value>,
    /// Raw model output, streamed verbatim. Useful for malformed output.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub faults: Vec<Fault>,
}

fn default_chunk_size() -> usize {
    8
}

/// A provider failure injected ahead of a turn's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    RateLimited,
    Network,
    Timeout,
    /// Stream half of the document, then break the connection.
    Interrupted,
    Unauthorized,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let content = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ScriptError::Parse { reason, .. } => ScriptError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ScriptError> {
        let script: Self = toml::from_str(content).map_err(|e| ScriptError::Parse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<(), ScriptError> {
        for (i, turn) in self.turns.iter().enumerate() {
            if turn.decision.is_some() == turn.text.is_some() {
                return Err(ScriptError::Invalid(format!(
                    "turn {i} needs exactly one of `decision` or `text`"
                )));
            }
            if turn.chunk_size == 0 {
                return Err(ScriptError::Invalid(format!("turn {i} has chunk_size = 0")));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(ScriptError::Invalid(format!("tool '{}' declared twice", tool.name)));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for spec in &self.tools {
            registry.register(Arc::new(FixtureTool::new(spec.clone())));
        }
        registry
    }

    pub fn provider(&self) -> ReplayProvider {
        ReplayProvider::new(self.turns.clone())
    }

    /// Context hub carrying the configured instructions plus the script's
    /// schema summaries.
    pub fn context_hub(&self, config: &ContextConfig) -> ContextHub {
        self.schemas
            .iter()
            .fold(ContextHub::from_config(config), |hub, schema| {
                hub.with_schema(&schema.name, &schema.summary)
            })
    }
}

// ── Provider ──────────────────────────────────────────────────────────────

/// Serves turn `i` to iteration `i`, injecting the turn's faults first.
pub struct ReplayProvider {
    name: String,
    turns: Vec<TurnSpec>,
    attempts: Mutex<HashMap<u32, usize>>,
}

impl ReplayProvider {
    pub fn new(turns: Vec<TurnSpec>) -> Self {
        Self {
            name: "replay".into(),
            turns,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Name reported to telemetry spans and logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn next_attempt(&self, iteration: u32) -> usize {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let slot = attempts.entry(iteration).or_insert(0);
        let current = *slot;
        *slot += 1;
        current
    }
}

fn document(turn: &TurnSpec) -> String {
    match (&turn.decision, &turn.text) {
        (Some(decision), _) => decision.to_string(),
        (None, Some(text)) => text.clone(),
        (None, None) => String::new(),
    }
}

fn chunks(doc: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = doc.chars().collect();
    chars.chunks(size.max(1)).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl ModelProvider for ReplayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_decision(&self, request: DecisionRequest) -> Result<TokenStream, ProviderError> {
        let turn = self.turns.get(request.iteration as usize).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "replay script has no turn for iteration {}",
                request.iteration
            ))
        })?;
        let attempt = self.next_attempt(request.iteration);

        let doc = document(turn);
        let mut pieces = chunks(&doc, turn.chunk_size);
        let mut trailing_error = None;

        match turn.faults.get(attempt) {
            None => {}
            Some(Fault::RateLimited) => return Err(ProviderError::RateLimited { retry_after_secs: 1 }),
            Some(Fault::Network) => return Err(ProviderError::Network("connection refused".into())),
            Some(Fault::Timeout) => return Err(ProviderError::Timeout("no first token".into())),
            Some(Fault::Unauthorized) => {
                return Err(ProviderError::AuthenticationFailed("invalid api key".into()));
            }
            Some(Fault::Interrupted) => {
                pieces.truncate(pieces.len() / 2);
                trailing_error = Some(ProviderError::StreamInterrupted("connection reset".into()));
            }
        }

        let (tx, rx) = mpsc::channel(pieces.len() + 1);
        tokio::spawn(async move {
            for piece in pieces {
                if tx.send(Ok(piece)).await.is_err() {
                    return;
                }
            }
            if let Some(error) = trailing_error {
                let _ = tx.send(Err(error)).await;
            }
        });
        Ok(rx)
    }
}

// ── Tools ─────────────────────────────────────────────────────────────────

/// A tool whose responses come from the script.
pub struct FixtureTool {
    name: String,
    description: String,
    schema: ArgumentSchema,
    responses: Mutex<VecDeque<ResponseSpec>>,
}

impl FixtureTool {
    pub fn new(spec: FixtureSpec) -> Self {
        let schema = spec
            .arguments
            .into_iter()
            .fold(ArgumentSchema::new(), |schema, field| schema.field(field));
        Self {
            name: spec.name,
            description: spec.description,
            schema,
            responses: Mutex::new(spec.responses.into()),
        }
    }

    fn next_response(&self) -> Option<ResponseSpec> {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        }
    }
}

#[async_trait]
impl ToolContract for FixtureTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn argument_schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    async fn execute(&self, _arguments: ValidatedArguments) -> Result<Value, ToolError> {
        match self.next_response() {
            None => Err(ToolError::Unavailable {
                tool_name: self.name.clone(),
                reason: "no scripted response".into(),
            }),
            Some(ResponseSpec::Ok { payload, delay_ms }) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(payload)
            }
            Some(ResponseSpec::Error { message, retryable: true }) => Err(ToolError::Unavailable {
                tool_name: self.name.clone(),
                reason: message,
            }),
            Some(ResponseSpec::Error { message, retryable: false }) => {
                Err(ToolError::ExecutionFailed {
                    tool_name: self.name.clone(),
                    reason: message,
                })
            }
            Some(ResponseSpec::Hang) => std::future::pending().await,
        }
    }
}
