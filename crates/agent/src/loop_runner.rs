//! The agent loop: plan → act → observe under an iteration budget.
//!
//! One [`AgentLoop`] can serve many sessions concurrently; all per-session
//! state lives in a private `Run` that exists for the duration of one
//! `run`/`resume` call. Iterations of a session are strictly sequential.
//!
//! ```text
//! Initializing ─▶ Iterating ─┬─▶ Answered
//!                            ├─▶ IterationLimitExceeded
//!                            ├─▶ Failed
//!                            └─▶ Cancelled
//! ```

use chrono::{DateTime, Utc};
use metricchat_config::AppConfig;
use metricchat_core::{
    Classify, ContextSnapshot, DecisionRequest, EventSink, Iteration, IterationError,
    IterationErrorKind, IterationOutcome, ModelProvider, Observation, ParseError, PlannerDecision,
    ProgressEvent, ProgressKind, ProviderError, Session, SessionId, SessionRecord, SessionStatus,
    SnapshotError, SnapshotStore, ToolCall, ToolContract, ToolRegistry,
};
use metricchat_telemetry::{SessionRecorder, SpanHandle, SpanKind, TelemetrySummary};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::{ContextBudget, ContextHub};
use crate::decision_stream::DecisionStream;
use crate::runner::{Cancelled, RetryPolicy, ToolRunner};

/// Runtime limits for every session run by one loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub max_consecutive_failures: u32,
    pub tool_timeout: Duration,
    pub tool_retry: RetryPolicy,
    pub provider_retry: RetryPolicy,
    /// Overall wall-clock budget per session.
    pub session_timeout: Option<Duration>,
    pub context_budget: ContextBudget,
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            max_consecutive_failures: config.agent.max_consecutive_failures.max(1),
            tool_timeout: Duration::from_millis(config.tools.timeout_ms),
            tool_retry: RetryPolicy::from(&config.tools.retry),
            provider_retry: RetryPolicy::from(&config.provider.retry),
            session_timeout: (config.agent.session_timeout_secs > 0)
                .then(|| Duration::from_secs(config.agent.session_timeout_secs)),
            context_budget: ContextBudget::from(&config.context),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Initializing,
    Iterating,
    Answered,
    Failed,
    IterationLimitExceeded,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initializing | Self::Iterating)
    }

    /// The persisted session status for a terminal state.
    pub fn session_status(self) -> SessionStatus {
        match self {
            Self::Answered | Self::IterationLimitExceeded => SessionStatus::Completed,
            Self::Failed => SessionStatus::Failed,
            Self::Cancelled => SessionStatus::Cancelled,
            Self::Initializing | Self::Iterating => SessionStatus::Running,
        }
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionFailure {
    #[error("model provider gave up: {message}")]
    ProviderExhausted { message: String },

    #[error("snapshot store failed: {message}")]
    Snapshot { message: String },

    #[error("context could not be built: {message}")]
    Context { message: String },

    #[error("{count} consecutive iteration failures, last: {last_error}")]
    ConsecutiveFailures { count: u32, last_error: String },

    #[error("session deadline exceeded")]
    DeadlineExceeded,
}

impl SessionFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderExhausted { .. } => "provider_exhausted",
            Self::Snapshot { .. } => "snapshot",
            Self::Context { .. } => "context",
            Self::ConsecutiveFailures { .. } => "consecutive_failures",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// What one `run`/`resume` call hands back.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: Session,
    pub state: LoopState,
    /// The final answer, the degraded answer, or the best partial reasoning.
    pub answer: Option<String>,
    pub iterations: Vec<Iteration>,
    pub failure: Option<SessionFailure>,
    pub telemetry: TelemetrySummary,
}

impl SessionOutcome {
    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }
}

/// The orchestrator. Shares its collaborators read-only across sessions.
pub struct AgentLoop {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn SnapshotStore>,
    sink: Arc<dyn EventSink>,
    hub: ContextHub,
    settings: LoopSettings,
    tool_slots: Option<Arc<Semaphore>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn SnapshotStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            sink,
            hub: ContextHub::default(),
            settings: LoopSettings::default(),
            tool_slots: None,
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_context_hub(mut self, hub: ContextHub) -> Self {
        self.hub = hub;
        self
    }

    /// Bound the number of tool executions in flight across all sessions
    /// run by this loop. `0` removes the bound.
    pub fn with_max_concurrent_tools(mut self, permits: usize) -> Self {
        self.tool_slots = (permits > 0).then(|| Arc::new(Semaphore::new(permits)));
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Answer `question` in a new session.
    pub async fn run(&self, question: impl Into<String>, cancel: CancellationToken) -> SessionOutcome {
        let session = Session::new(question, self.settings.max_iterations);
        self.run_session(session, cancel).await
    }

    /// Run a freshly created session to a terminal state.
    pub async fn run_session(&self, session: Session, cancel: CancellationToken) -> SessionOutcome {
        let span = info_span!("session", session_id = %session.id, question = %session.question);
        async move {
            info!(max_iterations = session.max_iterations, "Session starting");
            let saved = self.store.save_session(&SessionRecord::from(&session)).await;
            let run = Run::new(self, session, Vec::new(), cancel);
            match saved {
                Ok(()) => run.drive().await,
                Err(e) => {
                    run.fail(SessionFailure::Snapshot {
                        message: e.to_string(),
                    })
                    .await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Continue a persisted session at its next iteration index.
    ///
    /// A session whose last iteration already answered is returned as
    /// `Answered` without running anything.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, SnapshotError> {
        let record = self.store.load_session(session_id).await?;
        let history = match self.store.load(session_id).await {
            Ok(history) => history,
            Err(SnapshotError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut session =
            Session::with_id(record.session_id.clone(), record.question.clone(), record.max_iterations);
        session.created_at = record.created_at;

        let span = info_span!("session", session_id = %session.id, question = %session.question, resumed = true);
        let outcome = async move {
            let run = Run::new(self, session, history, cancel);
            if let Some(answer) = run.existing_answer() {
                info!("Session already answered, nothing to resume");
                return run.finish(LoopState::Answered, Some(answer), None).await;
            }
            info!(completed = run.history.len(), "Resuming session");
            run.drive().await
        }
        .instrument(span)
        .await;
        Ok(outcome)
    }
}

// ── Per-session run ───────────────────────────────────────────────────────

enum Next {
    Continue,
    Answered(String),
}

enum Stop {
    Cancelled,
    Failed(SessionFailure),
}

enum StreamStop {
    Cancelled,
    Deadline,
    Provider(ProviderError),
}

struct Run<'a> {
    agent: &'a AgentLoop,
    session: Session,
    state: LoopState,
    history: Vec<Iteration>,
    recorder: SessionRecorder,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    current_index: u32,
    consecutive_failures: u32,
    last_reasoning: Option<String>,
}

impl<'a> Run<'a> {
    fn new(agent: &'a AgentLoop, session: Session, history: Vec<Iteration>, cancel: CancellationToken) -> Self {
        let consecutive_failures = history.iter().rev().take_while(|i| i.is_errored()).count() as u32;
        let last_reasoning = history
            .iter()
            .rev()
            .find_map(|i| i.reasoning().map(str::to_string));
        let recorder = SessionRecorder::new(session.id.to_string());
        Self {
            agent,
            current_index: history.len().saturating_sub(1) as u32,
            deadline: agent.settings.session_timeout.map(|t| Instant::now() + t),
            session,
            state: LoopState::Initializing,
            history,
            recorder,
            cancel,
            consecutive_failures,
            last_reasoning,
        }
    }

    fn existing_answer(&self) -> Option<String> {
        let last = self.history.last()?;
        match (&last.outcome, &last.decision) {
            (IterationOutcome::Answered, Some(PlannerDecision::FinalAnswer { answer, .. })) => {
                Some(answer.clone())
            }
            _ => None,
        }
    }

    async fn drive(mut self) -> SessionOutcome {
        self.state = LoopState::Iterating;
        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled().await;
            }
            let index = self.history.len() as u32;
            if index >= self.session.max_iterations {
                return self.limit_exceeded().await;
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return self.fail(SessionFailure::DeadlineExceeded).await;
            }

            self.current_index = index;
            debug!(iteration = index, "Iteration starting");
            match self.iterate(index).await {
                Ok(Next::Continue) => {}
                Ok(Next::Answered(answer)) => {
                    return self.finish(LoopState::Answered, Some(answer), None).await;
                }
                Err(Stop::Cancelled) => return self.cancelled().await,
                Err(Stop::Failed(failure)) => return self.fail(failure).await,
            }
        }
    }

    async fn iterate(&mut self, index: u32) -> Result<Next, Stop> {
        let started_at = Utc::now();
        let context = self.build_context(index)?;

        let decision = match self.decide(index, &context).await? {
            Ok(decision) => decision,
            Err(parse) => {
                self.record_error(
                    index,
                    context,
                    started_at,
                    None,
                    IterationErrorKind::Parse,
                    parse.to_string(),
                )
                .await?;
                return Ok(Next::Continue);
            }
        };
        if let Some(reasoning) = decision.reasoning() {
            self.last_reasoning = Some(reasoning.to_string());
        }

        let requested = match &decision {
            PlannerDecision::ToolRequest {
                tool_name,
                tool_arguments,
                ..
            } => Ok((tool_name.clone(), Value::Object(tool_arguments.clone()))),
            PlannerDecision::FinalAnswer { answer, .. } => Err(answer.clone()),
        };
        let (tool_name, arguments) = match requested {
            Ok(request) => request,
            Err(answer) => return self.answered(index, context, started_at, decision, answer).await,
        };

        let (tool, call) = match self.agent.tools.prepare(format!("call_{index}"), &tool_name, &arguments) {
            Ok(prepared) => prepared,
            Err(resolution) => {
                self.record_error(
                    index,
                    context,
                    started_at,
                    Some(decision),
                    IterationErrorKind::Resolution,
                    resolution.to_string(),
                )
                .await?;
                return Ok(Next::Continue);
            }
        };

        self.emit(
            ProgressKind::ToolStarted,
            index,
            json!({
                "call_id": call.id,
                "tool_name": call.name,
                "arguments": call.arguments,
            }),
        )
        .await;

        let observation = self.execute(index, tool, &call).await?;
        let finished = tool_finished_payload(&observation);
        self.persist(Iteration {
            index,
            context,
            decision: Some(decision),
            tool_call: Some(call),
            observation: Some(observation),
            error: None,
            started_at,
            ended_at: Utc::now(),
            outcome: IterationOutcome::ToolExecuted,
        })
        .await?;
        self.consecutive_failures = 0;
        self.emit(ProgressKind::ToolFinished, index, finished).await;
        Ok(Next::Continue)
    }

    async fn answered(
        &mut self,
        index: u32,
        context: Arc<ContextSnapshot>,
        started_at: DateTime<Utc>,
        decision: PlannerDecision,
        answer: String,
    ) -> Result<Next, Stop> {
        let reasoning = decision.reasoning().map(str::to_string);
        self.persist(Iteration {
            index,
            context,
            decision: Some(decision),
            tool_call: None,
            observation: None,
            error: None,
            started_at,
            ended_at: Utc::now(),
            outcome: IterationOutcome::Answered,
        })
        .await?;
        self.emit(
            ProgressKind::AnswerFinal,
            index,
            json!({
                "status": "answered",
                "answer": answer,
                "reasoning": reasoning,
                "degraded": false,
            }),
        )
        .await;
        Ok(Next::Answered(answer))
    }

    fn build_context(&mut self, index: u32) -> Result<Arc<ContextSnapshot>, Stop> {
        let agent = self.agent;
        let span = self.recorder.start(SpanKind::ContextBuild, "context_hub", index);
        match agent
            .hub
            .build(&self.session, &self.history, &agent.settings.context_budget)
        {
            Ok(snapshot) => {
                self.recorder.annotate(span, "fragments", snapshot.len());
                self.recorder.annotate(span, "dropped", snapshot.dropped.len());
                self.recorder.end(span, true);
                Ok(Arc::new(snapshot))
            }
            Err(e) => {
                self.recorder.end(span, false);
                Err(Stop::Failed(SessionFailure::Context {
                    message: e.to_string(),
                }))
            }
        }
    }

    /// Obtain one decision, retrying the provider per policy. A fresh
    /// DecisionStream is used for every attempt.
    async fn decide(
        &mut self,
        index: u32,
        context: &Arc<ContextSnapshot>,
    ) -> Result<Result<PlannerDecision, ParseError>, Stop> {
        let agent = self.agent;
        let policy = &agent.settings.provider_retry;
        let span = self.recorder.start(SpanKind::DecisionStream, agent.provider.name(), index);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.recorder.attempt(span);
            let error = match self.stream_once(index, context, span).await {
                Ok(result) => {
                    self.recorder.end(span, result.is_ok());
                    return Ok(result);
                }
                Err(StreamStop::Cancelled) => {
                    self.recorder.end(span, false);
                    return Err(Stop::Cancelled);
                }
                Err(StreamStop::Deadline) => {
                    self.recorder.end(span, false);
                    return Err(Stop::Failed(SessionFailure::DeadlineExceeded));
                }
                Err(StreamStop::Provider(error)) => error,
            };

            if error.failure_class().is_retryable() && attempt < policy.max_attempts {
                let delay = retry_delay(policy, attempt, &error);
                warn!(
                    iteration = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Provider failed, retrying"
                );
                let cancel = self.cancel.clone();
                tokio::select! {
                    biased;
                    waited = policy.wait_for(delay, &cancel) => {
                        if waited.is_err() {
                            self.recorder.end(span, false);
                            return Err(Stop::Cancelled);
                        }
                    }
                    _ = until(self.deadline) => {
                        self.recorder.end(span, false);
                        return Err(Stop::Failed(SessionFailure::DeadlineExceeded));
                    }
                }
                continue;
            }

            error!(iteration = index, attempt, error = %error, "Provider exhausted");
            self.recorder.end(span, false);
            return Err(Stop::Failed(SessionFailure::ProviderExhausted {
                message: format!("{error} (after {attempt} attempt(s))"),
            }));
        }
    }

    async fn stream_once(
        &mut self,
        index: u32,
        context: &Arc<ContextSnapshot>,
        span: SpanHandle,
    ) -> Result<Result<PlannerDecision, ParseError>, StreamStop> {
        let agent = self.agent;
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        let request = DecisionRequest {
            session_id: self.session.id.clone(),
            iteration: index,
            question: self.session.question.clone(),
            context: Arc::clone(context),
            history: self.history.clone(),
            tools: agent.tools.definitions(),
        };

        let mut tokens = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamStop::Cancelled),
            _ = until(deadline) => return Err(StreamStop::Deadline),
            started = agent.provider.stream_decision(request) => started.map_err(StreamStop::Provider)?,
        };

        let mut stream = DecisionStream::begin(Arc::clone(context));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamStop::Cancelled),
                _ = until(deadline) => return Err(StreamStop::Deadline),
                next = tokens.recv() => next,
            };
            let token = match next {
                None => break,
                Some(Err(e)) => return Err(StreamStop::Provider(e)),
                Some(Ok(token)) => token,
            };

            self.recorder.add_tokens(span, 1);
            if let Some(update) = stream.feed(&token) {
                for field in update.fields {
                    if field.name == "reasoning" {
                        if let Some(text) = field.value.as_str() {
                            self.last_reasoning = Some(text.to_string());
                        }
                    }
                    self.emit(
                        ProgressKind::DecisionPartial,
                        index,
                        json!({ "field": field.name, "value": field.value }),
                    )
                    .await;
                }
            }
            if stream.is_failed() {
                debug!(iteration = index, "Decision stream malformed, ignoring remaining tokens");
                break;
            }
        }
        Ok(stream.finish())
    }

    async fn execute(
        &mut self,
        index: u32,
        tool: Arc<dyn ToolContract>,
        call: &ToolCall,
    ) -> Result<Observation, Stop> {
        let agent = self.agent;
        let span = self.recorder.start(SpanKind::ToolCall, call.name.as_str(), index);
        let cancel = self.cancel.clone();
        let deadline = self.deadline;

        let run = async {
            // Waiting for a slot counts against the session deadline too.
            let _permit = match &agent.tool_slots {
                Some(slots) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Cancelled),
                    permit = slots.acquire() => permit.ok(),
                },
                None => None,
            };
            ToolRunner::run(
                tool,
                call,
                agent.settings.tool_timeout,
                &agent.settings.tool_retry,
                &cancel,
            )
            .await
        };

        let result = tokio::select! {
            biased;
            _ = until(deadline) => None,
            result = run => Some(result),
        };

        match result {
            Some(Ok(observation)) => {
                self.recorder.set_attempts(span, observation.attempts);
                self.recorder.annotate(span, "status", observation.status.as_str());
                self.recorder.end(span, observation.is_success());
                info!(
                    iteration = index,
                    tool = %call.name,
                    status = observation.status.as_str(),
                    attempts = observation.attempts,
                    elapsed_ms = observation.elapsed_ms,
                    "Tool call finished"
                );
                Ok(observation)
            }
            Some(Err(Cancelled)) => {
                self.recorder.end(span, false);
                Err(Stop::Cancelled)
            }
            None => {
                self.recorder.end(span, false);
                Err(Stop::Failed(SessionFailure::DeadlineExceeded))
            }
        }
    }

    async fn record_error(
        &mut self,
        index: u32,
        context: Arc<ContextSnapshot>,
        started_at: DateTime<Utc>,
        decision: Option<PlannerDecision>,
        kind: IterationErrorKind,
        message: String,
    ) -> Result<(), Stop> {
        warn!(iteration = index, kind = kind.as_str(), error = %message, "Iteration failed");

        self.persist(Iteration {
            index,
            context,
            decision,
            tool_call: None,
            observation: None,
            error: Some(IterationError {
                kind,
                message: message.clone(),
            }),
            started_at,
            ended_at: Utc::now(),
            outcome: IterationOutcome::Errored,
        })
        .await?;
        self.emit(
            ProgressKind::Error,
            index,
            json!({ "scope": "iteration", "kind": kind.as_str(), "message": message }),
        )
        .await;

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.agent.settings.max_consecutive_failures {
            return Err(Stop::Failed(SessionFailure::ConsecutiveFailures {
                count: self.consecutive_failures,
                last_error: message,
            }));
        }
        Ok(())
    }

    async fn persist(&mut self, iteration: Iteration) -> Result<(), Stop> {
        let agent = self.agent;
        let span = self
            .recorder
            .start(SpanKind::SnapshotWrite, agent.store.name(), iteration.index);
        match agent.store.append(&self.session.id, &iteration).await {
            Ok(()) => {
                self.recorder.end(span, true);
                self.history.push(iteration);
                Ok(())
            }
            Err(e) => {
                self.recorder.end(span, false);
                error!(iteration = iteration.index, error = %e, "Snapshot append failed");
                Err(Stop::Failed(SessionFailure::Snapshot {
                    message: e.to_string(),
                }))
            }
        }
    }

    async fn emit(&self, kind: ProgressKind, index: u32, payload: Value) {
        self.agent
            .sink
            .emit(ProgressEvent::new(kind, self.session.id.clone(), index, payload))
            .await;
    }

    // ── Terminal transitions ─────────────────────────────────────────────

    async fn limit_exceeded(self) -> SessionOutcome {
        let max = self.session.max_iterations;
        let answer = self.last_reasoning.clone().unwrap_or_else(|| {
            format!("No answer was reached within the budget of {max} iterations.")
        });
        warn!(max_iterations = max, "Iteration budget exhausted, returning degraded answer");
        self.emit(
            ProgressKind::AnswerFinal,
            self.current_index,
            json!({
                "status": "iteration_limit_exceeded",
                "answer": answer,
                "reasoning": self.last_reasoning,
                "degraded": true,
            }),
        )
        .await;
        self.finish(LoopState::IterationLimitExceeded, Some(answer), None)
            .await
    }

    async fn fail(self, failure: SessionFailure) -> SessionOutcome {
        error!(kind = failure.kind(), error = %failure, "Session failed");
        let mut payload = json!({
            "scope": "session",
            "status": "failed",
            "kind": failure.kind(),
            "message": failure.to_string(),
            "partial_answer": self.last_reasoning,
        });
        if let (Value::Object(map), Ok(Value::Object(detail))) =
            (&mut payload, serde_json::to_value(&failure))
        {
            map.insert("failure".into(), Value::Object(detail));
        }
        self.emit(ProgressKind::Error, self.current_index, payload).await;
        let answer = self.last_reasoning.clone();
        self.finish(LoopState::Failed, answer, Some(failure)).await
    }

    async fn cancelled(self) -> SessionOutcome {
        info!(completed = self.history.len(), "Session cancelled");
        self.finish(LoopState::Cancelled, None, None).await
    }

    async fn finish(
        mut self,
        state: LoopState,
        answer: Option<String>,
        failure: Option<SessionFailure>,
    ) -> SessionOutcome {
        self.state = state;
        self.session.finish(state.session_status());

        // Cancellation ends the session with no further side effects.
        if state != LoopState::Cancelled {
            if let Err(e) = self
                .agent
                .store
                .save_session(&SessionRecord::from(&self.session))
                .await
            {
                warn!(error = %e, "Failed to persist final session status");
            }
        }

        let (_, telemetry) = self.recorder.finish();
        info!(state = ?self.state, iterations = self.history.len(), "Session finished");
        SessionOutcome {
            session: self.session,
            state: self.state,
            answer,
            iterations: self.history,
            failure,
            telemetry,
        }
    }
}

/// Backoff before the next provider attempt. A rate limit's own
/// `retry_after` is a floor.
fn retry_delay(policy: &RetryPolicy, attempt: u32, error: &ProviderError) -> Duration {
    let backoff = policy.delay(attempt);
    match error {
        ProviderError::RateLimited { retry_after_secs } => {
            backoff.max(Duration::from_secs(*retry_after_secs))
        }
        _ => backoff,
    }
}

fn tool_finished_payload(observation: &Observation) -> Value {
    json!({
        "call_id": observation.call_id,
        "tool_name": observation.tool_name,
        "status": observation.status,
        "attempts": observation.attempts,
        "elapsed_ms": observation.elapsed_ms,
        "payload": observation.payload,
        "error": observation.error,
    })
}

/// Resolves at `deadline`, or never.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
