//! `metricchat trace`: inspect persisted sessions.

use metricchat_config::AppConfig;
use metricchat_core::{Iteration, IterationOutcome, SessionId, SnapshotStore};
use metricchat_store::JsonlSnapshotStore;

pub async fn run(
    config: &AppConfig,
    session: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonlSnapshotStore::new(config.snapshots.resolved_dir());

    let Some(session) = session else {
        let sessions = store.sessions().await?;
        if sessions.is_empty() {
            println!("No sessions in {}", store.dir().display());
        }
        for id in sessions {
            match store.load_session(&id).await {
                Ok(record) => println!(
                    "{id}  {:<9}  {}  {}",
                    format!("{:?}", record.status).to_lowercase(),
                    record.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    record.question
                ),
                Err(e) => println!("{id}  <unreadable: {e}>"),
            }
        }
        return Ok(());
    };

    let id = SessionId::from(session);
    let record = store.load_session(&id).await?;
    let iterations = store.load(&id).await?;

    if json {
        let doc = serde_json::json!({ "session": record, "iterations": iterations });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Session:   {}", record.session_id);
    println!("Question:  {}", record.question);
    println!("Status:    {:?}", record.status);
    println!("Budget:    {} iterations", record.max_iterations);
    println!();
    for iteration in &iterations {
        println!("{}", describe(iteration));
    }
    Ok(())
}

fn describe(iteration: &Iteration) -> String {
    let detail = match (&iteration.outcome, &iteration.observation, &iteration.error) {
        (IterationOutcome::ToolExecuted, Some(observation), _) => format!(
            "{} -> {} ({} attempt(s), {} ms)",
            observation.tool_name,
            observation.status.as_str(),
            observation.attempts,
            observation.elapsed_ms
        ),
        (IterationOutcome::Errored, _, Some(error)) => {
            format!("{} error: {}", error.kind.as_str(), error.message)
        }
        (IterationOutcome::Answered, _, _) => "answered".to_string(),
        _ => "incomplete record".to_string(),
    };
    let reasoning = iteration
        .reasoning()
        .map(|r| format!("\n      {r}"))
        .unwrap_or_default();
    format!(
        "  [{}] {}  {detail}{reasoning}",
        iteration.index,
        iteration.started_at.format("%H:%M:%S")
    )
}
