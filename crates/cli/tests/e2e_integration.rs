//! End-to-end integration tests for the MetricChat agent core.
//!
//! These tests exercise the full pipeline from question to answer through
//! the public crate APIs: streamed decisions, tool execution with retries,
//! context assembly, persistence to disk, cancellation and resume.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use metricchat_agent::{
    AgentLoop, ContextBudget, ContextHub, LoopSettings, LoopState, RetryPolicy, ToolRunner,
};
use metricchat_core::{
    ArgumentSchema, ChannelSink, DecisionRequest, EventSink, FieldKind, IterationOutcome,
    ModelProvider, ObservationStatus, ProgressEvent, ProgressKind, ProviderError, Session,
    SessionStatus, SnapshotStore, TokenStream, ToolCall, ToolContract, ToolError, ToolRegistry,
    ValidatedArguments,
};
use metricchat_store::{InMemorySnapshotStore, JsonlSnapshotStore};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Mock Provider ────────────────────────────────────────────────────────

/// Streams scripted decision documents in sequence, a few characters at a
/// time. The last document repeats.
struct StreamingProvider {
    documents: Vec<String>,
    call_count: AtomicU32,
}

impl StreamingProvider {
    fn new(documents: Vec<Value>) -> Self {
        Self {
            documents: documents.iter().map(Value::to_string).collect(),
            call_count: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ModelProvider for StreamingProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn stream_decision(&self, _request: DecisionRequest) -> Result<TokenStream, ProviderError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) as usize;
        let doc = self.documents[n.min(self.documents.len() - 1)].clone();
        let chars: Vec<char> = doc.chars().collect();
        let (tx, rx) = mpsc::channel(chars.len() / 7 + 2);
        for piece in chars.chunks(7) {
            tx.send(Ok(piece.iter().collect())).await.unwrap();
        }
        Ok(rx)
    }
}

fn query_decision(sql: &str, reasoning: &str) -> Value {
    json!({
        "analysis_complete": false,
        "reasoning": reasoning,
        "tool_name": "run_query",
        "tool_arguments": { "sql": sql },
        "final_answer": null,
    })
}

fn final_decision(answer: &str, reasoning: &str) -> Value {
    json!({
        "analysis_complete": true,
        "reasoning": reasoning,
        "final_answer": answer,
    })
}

// ── Mock Tools ───────────────────────────────────────────────────────────

/// A SQL tool that answers every query with a fixed result set.
struct RunQueryTool {
    schema: ArgumentSchema,
    result: Value,
    calls: AtomicU32,
}

impl RunQueryTool {
    fn new(result: Value) -> Self {
        Self {
            schema: ArgumentSchema::new()
                .required("sql", FieldKind::String, "SELECT statement to run")
                .optional("limit", FieldKind::Integer, "Row cap"),
            result,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ToolContract for RunQueryTool {
    fn name(&self) -> &str {
        "run_query"
    }

    fn description(&self) -> &str {
        "Execute a read-only SQL query"
    }

    fn argument_schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    async fn execute(&self, arguments: ValidatedArguments) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(arguments.get_str("sql").is_some());
        Ok(self.result.clone())
    }
}

/// Fails `failures` times (timing out or erroring), then succeeds.
struct FlakyTool {
    failures: u32,
    hang: bool,
    calls: AtomicU32,
    schema: ArgumentSchema,
}

impl FlakyTool {
    fn new(failures: u32, hang: bool) -> Self {
        Self {
            failures,
            hang,
            calls: AtomicU32::new(0),
            schema: ArgumentSchema::new().allow_unknown_fields(),
        }
    }
}

#[async_trait::async_trait]
impl ToolContract for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Sometimes works"
    }

    fn argument_schema(&self) -> &ArgumentSchema {
        &self.schema
    }

    async fn execute(&self, _arguments: ValidatedArguments) -> Result<Value, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            if self.hang {
                std::future::pending::<()>().await;
            }
            return Err(ToolError::Network("connection reset by peer".into()));
        }
        Ok(json!({"ok": true}))
    }
}

// ── Mock Sink ────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
    cancel_after_first: Option<(ProgressKind, CancellationToken)>,
}

impl RecordingSink {
    fn kinds(&self) -> Vec<ProgressKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn count(&self, kind: ProgressKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: ProgressEvent) {
        let kind = event.kind;
        self.events.lock().unwrap().push(event);
        if let Some((trigger, token)) = &self.cancel_after_first {
            if *trigger == kind {
                token.cancel();
            }
        }
    }
}

fn settings(max_iterations: u32) -> LoopSettings {
    LoopSettings {
        max_iterations,
        max_consecutive_failures: 3,
        tool_timeout: Duration::from_secs(5),
        tool_retry: RetryPolicy::no_retry(),
        provider_retry: RetryPolicy::no_retry(),
        session_timeout: None,
        context_budget: ContextBudget::default(),
    }
}

fn registry_with(tool: Arc<dyn ToolContract>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    Arc::new(registry)
}

// ── E2E: Answered session, persisted to disk ─────────────────────────────

#[tokio::test]
async fn e2e_total_sales_question_is_answered_in_two_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlSnapshotStore::new(dir.path()));
    let provider = Arc::new(StreamingProvider::new(vec![
        query_decision(
            "SELECT SUM(amount) FROM sales WHERE sold_at >= date_trunc('month', now()) - interval '1 month'",
            "I need last month's total from the sales table",
        ),
        final_decision(
            "Total sales last month were $42,000 (1 row returned).",
            "The query returned 1 row with the total",
        ),
    ]));
    let tool = Arc::new(RunQueryTool::new(json!({"row_count": 1, "rows": [[42000]]})));
    let sink = Arc::new(RecordingSink::default());

    let agent = AgentLoop::new(provider.clone(), registry_with(tool.clone()), store.clone(), sink.clone())
        .with_settings(settings(10))
        .with_context_hub(
            ContextHub::default().with_schema("sales", "sales(id int, amount numeric, sold_at date)"),
        );

    let outcome = agent
        .run("What were total sales last month?", CancellationToken::new())
        .await;

    assert_eq!(outcome.state, LoopState::Answered);
    assert_eq!(outcome.iterations.len(), 2);
    assert_eq!(sink.count(ProgressKind::AnswerFinal), 1);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.calls(), 2);
    assert!(outcome.answer.as_deref().unwrap().contains("1 row"));

    // Everything acknowledged is on disk, in order.
    let record = store.load_session(outcome.session_id()).await.unwrap();
    assert_eq!(record.status, SessionStatus::Completed);
    let persisted = store.load(outcome.session_id()).await.unwrap();
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[0].outcome, IterationOutcome::ToolExecuted);
    assert_eq!(persisted[1].outcome, IterationOutcome::Answered);
    let observation = persisted[0].observation.as_ref().unwrap();
    assert_eq!(observation.status, ObservationStatus::Success);
    assert_eq!(observation.payload["row_count"], json!(1));
}

// ── E2E: Iteration budget ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_never_finishing_planner_hits_the_iteration_budget() {
    let provider = Arc::new(StreamingProvider::new(vec![query_decision(
        "SELECT 1",
        "Let me check one more thing",
    )]));
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(
        provider,
        registry_with(Arc::new(RunQueryTool::new(json!({"row_count": 0})))),
        Arc::new(InMemorySnapshotStore::new()),
        sink.clone(),
    )
    .with_settings(settings(3));

    let outcome = agent.run("Why is revenue flat?", CancellationToken::new()).await;

    assert_eq!(outcome.state, LoopState::IterationLimitExceeded);
    assert_eq!(outcome.iterations.len(), 3);
    assert_eq!(sink.count(ProgressKind::ToolFinished), 3);
    let terminal = sink.count(ProgressKind::AnswerFinal) + sink.count(ProgressKind::Error);
    assert_eq!(terminal, 1);
    assert_eq!(sink.kinds().last(), Some(&ProgressKind::AnswerFinal));
    assert_eq!(outcome.answer.as_deref(), Some("Let me check one more thing"));
}

// ── E2E: Cancellation and resume ─────────────────────────────────────────

#[tokio::test]
async fn e2e_cancelled_session_leaves_no_trace_of_the_next_iteration_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlSnapshotStore::new(dir.path()));
    let cancel = CancellationToken::new();
    let sink = Arc::new(RecordingSink {
        events: Mutex::new(Vec::new()),
        cancel_after_first: Some((ProgressKind::ToolFinished, cancel.clone())),
    });
    let provider = Arc::new(StreamingProvider::new(vec![
        query_decision("SELECT COUNT(*) FROM orders", "Count the orders"),
        final_decision("unreachable", "unreachable"),
    ]));
    let tool = Arc::new(RunQueryTool::new(json!({"row_count": 1})));

    let agent = AgentLoop::new(provider.clone(), registry_with(tool.clone()), store.clone(), sink.clone())
        .with_settings(settings(5));
    let outcome = agent.run("How many orders?", cancel).await;

    assert_eq!(outcome.state, LoopState::Cancelled);
    assert_eq!(outcome.iterations.len(), 1);
    assert_eq!(provider.calls(), 1);
    assert_eq!(sink.kinds().last(), Some(&ProgressKind::ToolFinished));
    let id = outcome.session_id().clone();
    assert_eq!(store.load(&id).await.unwrap().len(), 1);
    assert_eq!(
        store.load_session(&id).await.unwrap().status,
        SessionStatus::Running
    );

    // A fresh loop over the same directory picks the session up at index 1.
    let reopened = Arc::new(JsonlSnapshotStore::new(dir.path()));
    let provider = Arc::new(StreamingProvider::new(vec![final_decision(
        "There is 1 order.",
        "The count came back as 1",
    )]));
    let sink = Arc::new(RecordingSink::default());
    let agent = AgentLoop::new(provider, registry_with(tool), reopened.clone(), sink.clone())
        .with_settings(settings(5));

    let resumed = agent.resume(&id, CancellationToken::new()).await.unwrap();

    assert_eq!(resumed.state, LoopState::Answered);
    assert_eq!(resumed.iterations.len(), 2);
    assert_eq!(resumed.iterations[1].index, 1);
    assert!(sink.kinds().iter().all(|k| *k != ProgressKind::ToolStarted));
    assert_eq!(reopened.load(&id).await.unwrap().len(), 2);
}

// ── E2E: Event stream as JSON lines ──────────────────────────────────────

#[tokio::test]
async fn e2e_channel_sink_delivers_whole_events_in_order() {
    let (sink, mut events) = ChannelSink::new(4);
    let provider = Arc::new(StreamingProvider::new(vec![
        query_decision("SELECT 1", "look"),
        final_decision("done", "seen"),
    ]));
    let agent = AgentLoop::new(
        provider,
        registry_with(Arc::new(RunQueryTool::new(json!({"row_count": 1})))),
        Arc::new(InMemorySnapshotStore::new()),
        Arc::new(sink),
    )
    .with_settings(settings(5));

    let reader = tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(event) = events.recv().await {
            lines.push(serde_json::to_string(&event).unwrap());
        }
        lines
    });

    let outcome = agent.run("q", CancellationToken::new()).await;
    drop(agent);
    let lines = reader.await.unwrap();

    assert_eq!(outcome.state, LoopState::Answered);
    let parsed: Vec<Value> = lines.iter().map(|l| serde_json::from_str(l).unwrap()).collect();
    let kinds: Vec<&str> = parsed.iter().map(|v| v["kind"].as_str().unwrap()).collect();
    assert!(kinds.contains(&"decision.partial"));
    assert!(kinds.contains(&"tool.started"));
    assert!(kinds.contains(&"tool.finished"));
    assert_eq!(kinds.last(), Some(&"answer.final"));
    for v in &parsed {
        assert_eq!(v["session_id"], json!(outcome.session_id().as_str()));
        assert!(v["timestamp"].is_string());
    }
    let indices: Vec<u64> = parsed.iter().map(|v| v["iteration_index"].as_u64().unwrap()).collect();
    assert!(indices.windows(2).all(|w| w[0] <= w[1]));
}

// ── E2E: Concurrent sessions share one loop ──────────────────────────────

#[tokio::test]
async fn e2e_concurrent_sessions_are_isolated() {
    let store = Arc::new(InMemorySnapshotStore::new());
    let agent = Arc::new(
        AgentLoop::new(
            Arc::new(StreamingProvider::new(vec![final_decision("ok", "direct")])),
            registry_with(Arc::new(RunQueryTool::new(json!({})))),
            store.clone(),
            Arc::new(RecordingSink::default()),
        )
        .with_settings(settings(3))
        .with_max_concurrent_tools(1),
    );

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.run(format!("question {i}"), CancellationToken::new()).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state, LoopState::Answered);
        assert_eq!(outcome.iterations.len(), 1);
        ids.push(outcome.session_id().clone());
    }
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(store.sessions().await.unwrap().len(), 4);
}

// ── E2E: ToolRunner retry properties ─────────────────────────────────────

fn retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(10),
        multiplier: 1.0,
        jitter: 0.0,
    }
}

fn flaky_call() -> ToolCall {
    ToolCall {
        id: "call_0".into(),
        name: "flaky".into(),
        arguments: ArgumentSchema::new().allow_unknown_fields().validate(&json!({})).unwrap(),
    }
}

#[tokio::test(start_paused = true)]
async fn e2e_always_timing_out_tool_gets_exactly_three_attempts() {
    let tool = Arc::new(FlakyTool::new(u32::MAX, true));
    let timeout = Duration::from_millis(100);

    let observation = ToolRunner::run(tool.clone(), &flaky_call(), timeout, &retry(3), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(observation.status, ObservationStatus::Timeout);
    assert_eq!(observation.attempts, 3);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    assert!(observation.elapsed_ms >= 300);
}

#[tokio::test(start_paused = true)]
async fn e2e_transient_failures_then_success() {
    let tool = Arc::new(FlakyTool::new(2, false));

    let observation = ToolRunner::run(
        tool,
        &flaky_call(),
        Duration::from_secs(1),
        &retry(3),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(observation.status, ObservationStatus::Success);
    assert_eq!(observation.attempts, 3);
}

// ── E2E: Context determinism ─────────────────────────────────────────────

#[tokio::test]
async fn e2e_context_build_is_deterministic_for_a_recorded_session() {
    let provider = Arc::new(StreamingProvider::new(vec![
        query_decision("SELECT region, SUM(amount) FROM sales GROUP BY 1", "By region"),
        query_decision("SELECT product, SUM(amount) FROM sales GROUP BY 1", "By product"),
        final_decision("West leads.", "Compared both"),
    ]));
    let agent = AgentLoop::new(
        provider,
        registry_with(Arc::new(RunQueryTool::new(json!({"row_count": 4, "rows": [["west", 10]]})))),
        Arc::new(InMemorySnapshotStore::new()),
        Arc::new(RecordingSink::default()),
    )
    .with_settings(settings(5));
    let outcome = agent.run("Which region sells most?", CancellationToken::new()).await;
    assert_eq!(outcome.state, LoopState::Answered);

    let hub = ContextHub::default()
        .with_instructions(["Only run SELECT statements".to_string()])
        .with_schema("sales", "sales(region text, product text, amount numeric)");
    let session = Session::with_id(outcome.session.id.clone(), outcome.session.question.clone(), 5);
    let budget = ContextBudget::new(96);

    let first = hub.build(&session, &outcome.iterations, &budget).unwrap();
    let second = hub.build(&session, &outcome.iterations, &budget).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.render(), second.render());
    assert!(first.total_tokens <= 96);
}
