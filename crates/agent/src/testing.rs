//! Shared mocks for agent tests: a scripted model provider, scripted tools,
//! a collecting event sink and a store that fails on cue.

use async_trait::async_trait;
use metricchat_core::{
    ArgumentSchema, DecisionRequest, EventSink, FailureClass, FieldKind, Iteration,
    ModelProvider, ProgressEvent, ProgressKind, ProviderError, SessionId, SessionRecord,
    SnapshotError, SnapshotStore, TokenStream, ToolContract, ToolError, ValidatedArguments,
};
use metricchat_store::InMemorySnapshotStore;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Provider ──────────────────────────────────────────────────────────────

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum Turn {
    /// Stream these chunks, then end the stream.
    Tokens(Vec<String>),
    /// Fail before streaming anything.
    Fail(ProviderError),
    /// Stream some chunks, then interrupt with an error.
    Interrupt(Vec<String>, ProviderError),
    /// Start a stream that never produces anything.
    Hang,
}

/// Split a document into fixed-size chunks the way a model would stream it.
pub fn chunk(doc: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = doc.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

pub fn tool_turn(tool: &str, arguments: Value, reasoning: &str) -> Turn {
    let doc = json!({
        "analysis_complete": false,
        "reasoning": reasoning,
        "tool_name": tool,
        "tool_arguments": arguments,
        "final_answer": null,
    });
    Turn::Tokens(chunk(&doc.to_string(), 6))
}

pub fn answer_turn(answer: &str, reasoning: &str) -> Turn {
    let doc = json!({
        "analysis_complete": true,
        "reasoning": reasoning,
        "final_answer": answer,
    });
    Turn::Tokens(chunk(&doc.to_string(), 6))
}

/// Replays turns in order. The last turn repeats once the script runs out.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
    calls: AtomicU32,
    requests: Mutex<Vec<DecisionRequest>>,
    hanging: Mutex<Vec<mpsc::Sender<Result<String, ProviderError>>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            hanging: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_turn(&self) -> Turn {
        let mut turns = self.turns.lock().unwrap();
        if turns.len() > 1 {
            turns.pop_front().unwrap()
        } else {
            turns.front().cloned().unwrap_or(Turn::Hang)
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_decision(&self, request: DecisionRequest) -> Result<TokenStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let (chunks, error) = match self.next_turn() {
            Turn::Fail(error) => return Err(error),
            Turn::Tokens(chunks) => (chunks, None),
            Turn::Interrupt(chunks, error) => (chunks, Some(error)),
            Turn::Hang => {
                let (tx, rx) = mpsc::channel(1);
                self.hanging.lock().unwrap().push(tx);
                return Ok(rx);
            }
        };

        let (tx, rx) = mpsc::channel(chunks.len() + 1);
        for c in chunks {
            tx.try_send(Ok(c)).unwrap();
        }
        if let Some(error) = error {
            tx.try_send(Err(error)).unwrap();
        }
        Ok(rx)
    }
}

// ── Tools ─────────────────────────────────────────────────────────────────

/// What a scripted tool does on one call.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Value),
    Fail(ToolError),
    /// Sleep, then succeed.
    Delay(Duration, Value),
    Hang,
    Panic,
}

/// A tool that follows a script of behaviors. The last one repeats.
pub struct ScriptedTool {
    name: String,
    schema: ArgumentSchema,
    behaviors: Mutex<VecDeque<Behavior>>,
    calls: AtomicU32,
    classifier: Option<fn(&ToolError) -> FailureClass>,
}

impl ScriptedTool {
    pub fn new(name: &str, behaviors: Vec<Behavior>) -> Self {
        Self {
            name: name.into(),
            schema: ArgumentSchema::new()
                .optional("sql", FieldKind::String, "SQL statement")
                .allow_unknown_fields(),
            behaviors: Mutex::new(behaviors.into()),
            calls: AtomicU32::new(0),
            classifier: None,
        }
    }

    pub fn with_schema(mut self, schema: ArgumentSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn classify_with(mut self, classifier: fn(&ToolError) -> FailureClass) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        let mut behaviors = self.behaviors.lock().unwrap();
        if behaviors.len() > 1 {
            behaviors.pop_front().unwrap()
        } else {
            behaviors.front().cloned().unwrap_or(Behavior::Hang)
        }
    }
}

#[async_trait]
impl ToolContract for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn argument_schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    async fn execute(&self, _arguments: ValidatedArguments) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            Behavior::Succeed(value) => Ok(value),
            Behavior::Fail(error) => Err(error),
            Behavior::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("scripted tool panic"),
        }
    }

    fn classify(&self, error: &ToolError) -> FailureClass {
        match self.classifier {
            Some(classify) => classify(error),
            None => metricchat_core::Classify::failure_class(error),
        }
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────

/// Records every event; optionally cancels a token after the n-th event of
/// some kind.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
    trigger: Option<(ProgressKind, usize, CancellationToken)>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_after(kind: ProgressKind, count: usize, token: CancellationToken) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            trigger: Some((kind, count, token)),
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<ProgressKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: ProgressKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: ProgressEvent) {
        let mut events = self.events.lock().unwrap();
        events.push(event);
        if let Some((kind, count, token)) = &self.trigger {
            if events.iter().filter(|e| e.kind == *kind).count() == *count {
                token.cancel();
            }
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────

/// In-memory store whose `append` fails from a given iteration index on.
pub struct FailingStore {
    inner: InMemorySnapshotStore,
    fail_from: u32,
}

impl FailingStore {
    pub fn new(fail_from: u32) -> Self {
        Self {
            inner: InMemorySnapshotStore::new(),
            fail_from,
        }
    }
}

#[async_trait]
impl SnapshotStore for FailingStore {
    fn name(&self) -> &str {
        "failing"
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), SnapshotError> {
        self.inner.save_session(record).await
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionRecord, SnapshotError> {
        self.inner.load_session(session_id).await
    }

    async fn append(&self, session_id: &SessionId, iteration: &Iteration) -> Result<(), SnapshotError> {
        if iteration.index >= self.fail_from {
            return Err(SnapshotError::Storage("disk full".into()));
        }
        self.inner.append(session_id, iteration).await
    }

    async fn load(&self, session_id: &SessionId) -> Result<Vec<Iteration>, SnapshotError> {
        self.inner.load(session_id).await
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, SnapshotError> {
        self.inner.sessions().await
    }
}
