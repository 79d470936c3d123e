//! `metricchat run` / `metricchat resume`: drive a session and stream its
//! events to stdout as JSON lines.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use metricchat_agent::{AgentLoop, LoopSettings, LoopState, SessionOutcome};
use metricchat_config::AppConfig;
use metricchat_core::{ChannelSink, ProgressEvent, SessionId, SnapshotStore};
use metricchat_telemetry::SpanKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::StoreKind;
use crate::replay::Script;

pub async fn run(
    config: &AppConfig,
    script_path: &Path,
    question: Option<String>,
    max_iterations: Option<u32>,
    store: Option<StoreKind>,
) -> Result<(), Box<dyn std::error::Error>> {
    let script = Script::load(script_path)?;
    let question = question
        .or_else(|| script.question.clone())
        .ok_or("No question given: pass --question or set `question` in the script")?;

    let mut settings = LoopSettings::from_config(config);
    if let Some(max) = max_iterations {
        if max == 0 {
            return Err("--max-iterations must be at least 1".into());
        }
        settings.max_iterations = max;
    }

    let store = super::open_store(config, store);
    let (agent, printer) = build(config, &script, settings, store);
    let cancel = cancel_on_ctrl_c();

    let outcome = agent.run(question, cancel).await;
    drop(agent);
    finish(outcome, printer).await
}

pub async fn resume(
    config: &AppConfig,
    script_path: &Path,
    session: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let script = Script::load(script_path)?;
    let store = super::open_store(config, Some(StoreKind::Jsonl));
    let (agent, printer) = build(config, &script, LoopSettings::from_config(config), store);
    let cancel = cancel_on_ctrl_c();

    let outcome = agent
        .resume(&SessionId::from(session), cancel)
        .await
        .map_err(|e| format!("Cannot resume session {session}: {e}"))?;
    drop(agent);
    finish(outcome, printer).await
}

fn build(
    config: &AppConfig,
    script: &Script,
    settings: LoopSettings,
    store: Arc<dyn SnapshotStore>,
) -> (AgentLoop, JoinHandle<()>) {
    let (sink, events) = ChannelSink::new(config.events.buffer);
    let printer = tokio::spawn(print_events(events));

    let agent = AgentLoop::new(
        Arc::new(script.provider().with_name(&config.provider.name)),
        Arc::new(script.registry()),
        store,
        Arc::new(sink),
    )
    .with_settings(settings)
    .with_context_hub(script.context_hub(&config.context))
    .with_max_concurrent_tools(config.tools.max_concurrent);

    (agent, printer)
}

/// One JSON line per event until every sender is gone.
async fn print_events(mut events: mpsc::Receiver<ProgressEvent>) {
    let stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping unserialisable event");
                continue;
            }
        };
        let mut out = stdout.lock();
        // A closed stdout must not stall the producer.
        let _ = writeln!(out, "{line}").and_then(|()| out.flush());
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("  Cancelling session...");
            token.cancel();
        }
    });
    cancel
}

async fn finish(
    outcome: SessionOutcome,
    printer: JoinHandle<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    printer.await?;

    let telemetry = &outcome.telemetry;
    eprintln!();
    eprintln!("  Session:     {}", outcome.session_id());
    eprintln!("  State:       {:?}", outcome.state);
    eprintln!("  Iterations:  {}", outcome.iterations.len());
    eprintln!(
        "  Attempts:    {} provider, {} tool",
        telemetry.provider_attempts, telemetry.tool_attempts
    );
    eprintln!(
        "  Spans:       {} context, {} decision, {} tool, {} snapshot",
        telemetry.count(SpanKind::ContextBuild),
        telemetry.count(SpanKind::DecisionStream),
        telemetry.count(SpanKind::ToolCall),
        telemetry.count(SpanKind::SnapshotWrite),
    );
    if let Some(answer) = &outcome.answer {
        eprintln!("  Answer:      {answer}");
    }

    match (outcome.state, outcome.failure) {
        (LoopState::Failed, Some(failure)) => Err(format!("Session failed: {failure}").into()),
        (LoopState::Failed, None) => Err("Session failed".into()),
        _ => Ok(()),
    }
}
