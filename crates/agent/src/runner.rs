//! Tool execution with per-attempt timeout, retry/backoff and failure
//! classification.
//!
//! Each attempt runs as its own tokio task. A timeout, a cancellation or
//! dropping the runner future aborts that task, so a stuck capability never
//! keeps running behind the loop's back. A panicking tool is contained in
//! its task and reported as a terminal failure.

use metricchat_config::RetryConfig;
use metricchat_core::{Observation, ToolCall, ToolContract, ToolError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The session was cancelled while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Attempt cap and exponential backoff with jitter.
///
/// Shared by tool calls and model provider streams, so the retry rule is
/// defined once.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added as random jitter.
    pub jitter: f64,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `retry`, including random jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let extra = rand::rng().random_range(0.0..=spread);
        base + Duration::from_millis(extra as u64)
    }

    /// Sleep before retry number `retry`, unless the session is cancelled first.
    pub async fn wait(&self, retry: u32, cancel: &CancellationToken) -> Result<(), Cancelled> {
        self.wait_for(self.delay(retry), cancel).await
    }

    /// Sleep for an explicit `delay`, unless the session is cancelled first.
    pub async fn wait_for(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

/// Aborts the attempt task when the runner stops waiting for it.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Executes one ToolCall. Holds no state across calls.
pub struct ToolRunner;

impl ToolRunner {
    /// Run `call` against `tool`, retrying retryable failures per `policy`.
    ///
    /// Always produces an Observation unless the session is cancelled.
    pub async fn run(
        tool: Arc<dyn ToolContract>,
        call: &ToolCall,
        timeout: Duration,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Observation, Cancelled> {
        let started = Instant::now();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(tool = %call.name, call_id = %call.id, attempt, "Tool attempt starting");

            let error = match Self::attempt(&tool, call, timeout, cancel).await? {
                Ok(payload) => {
                    return Ok(Observation::success(
                        &call.id,
                        &call.name,
                        payload,
                        elapsed_ms(started),
                        attempt,
                    ));
                }
                Err(error) => error,
            };

            let class = tool.classify(&error);
            if class.is_retryable() && attempt < max_attempts {
                warn!(
                    tool = %call.name,
                    attempt,
                    max_attempts,
                    error = %error,
                    "Retryable tool failure, backing off"
                );
                policy.wait(attempt, cancel).await?;
                continue;
            }

            warn!(tool = %call.name, attempt, error = %error, retryable = class.is_retryable(), "Tool call failed");
            let elapsed = elapsed_ms(started);
            return Ok(match error {
                ToolError::Timeout { .. } => {
                    Observation::timeout(&call.id, &call.name, error.to_string(), elapsed, attempt)
                }
                _ => Observation::failure(&call.id, &call.name, error.to_string(), elapsed, attempt),
            });
        }
    }

    /// One time-bounded, cancellable attempt.
    async fn attempt(
        tool: &Arc<dyn ToolContract>,
        call: &ToolCall,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<serde_json::Value, ToolError>, Cancelled> {
        let task_tool = Arc::clone(tool);
        let arguments = call.arguments.clone();
        let mut handle = tokio::spawn(async move { task_tool.execute(arguments).await });
        let _guard = AbortOnDrop(handle.abort_handle());

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            joined = tokio::time::timeout(timeout, &mut handle) => joined,
        };

        Ok(match joined {
            Err(_) => Err(ToolError::Timeout {
                tool_name: call.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                let panic = join_error.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                Err(ToolError::Panicked(message))
            }
            Ok(Err(_)) => Err(ToolError::ExecutionFailed {
                tool_name: call.name.clone(),
                reason: "attempt was aborted".into(),
            }),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, ScriptedTool};
    use metricchat_core::{FailureClass, ObservationStatus, ToolRegistry};
    use serde_json::json;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn prepare(tool: Arc<ScriptedTool>) -> (Arc<dyn ToolContract>, ToolCall) {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        registry
            .prepare("call_0", "run_query", &json!({"sql": "SELECT 1"}))
            .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(5);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy(3)
        };
        for _ in 0..50 {
            let d = p.delay(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn policy_from_config() {
        let p = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.initial_backoff, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn always_timing_out_tool_uses_every_attempt() {
        let tool = Arc::new(ScriptedTool::new("run_query", vec![Behavior::Hang]));
        let (resolved, call) = prepare(tool.clone());
        let timeout = Duration::from_millis(500);
        let started = Instant::now();

        let obs = ToolRunner::run(resolved, &call, timeout, &policy(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(obs.status, ObservationStatus::Timeout);
        assert_eq!(obs.attempts, 3);
        assert_eq!(tool.calls(), 3);
        assert!(started.elapsed() >= timeout * 3);
        assert!(obs.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let tool = Arc::new(ScriptedTool::new(
            "run_query",
            vec![
                Behavior::Fail(ToolError::Unavailable {
                    tool_name: "run_query".into(),
                    reason: "database is locked".into(),
                }),
                Behavior::Fail(ToolError::Network("connection reset".into())),
                Behavior::Succeed(json!({"row_count": 12})),
            ],
        ));
        let (resolved, call) = prepare(tool.clone());

        let obs = ToolRunner::run(
            resolved,
            &call,
            Duration::from_secs(5),
            &policy(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(obs.status, ObservationStatus::Success);
        assert_eq!(obs.attempts, 3);
        assert_eq!(obs.payload["row_count"], json!(12));
        assert!(obs.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_not_retried() {
        let tool = Arc::new(ScriptedTool::new(
            "run_query",
            vec![Behavior::Fail(ToolError::PermissionDenied {
                tool_name: "run_query".into(),
                reason: "read-only connection".into(),
            })],
        ));
        let (resolved, call) = prepare(tool.clone());

        let obs = ToolRunner::run(resolved, &call, Duration::from_secs(1), &policy(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(obs.status, ObservationStatus::Failure);
        assert_eq!(obs.attempts, 1);
        assert_eq!(tool.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_classification_overrides_default() {
        let tool = Arc::new(
            ScriptedTool::new(
                "run_query",
                vec![
                    Behavior::Fail(ToolError::ExecutionFailed {
                        tool_name: "run_query".into(),
                        reason: "deadlock detected".into(),
                    }),
                    Behavior::Succeed(json!({"ok": true})),
                ],
            )
            .classify_with(|_| FailureClass::Retryable),
        );
        let (resolved, call) = prepare(tool);

        let obs = ToolRunner::run(resolved, &call, Duration::from_secs(1), &policy(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(obs.status, ObservationStatus::Success);
        assert_eq!(obs.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_stops_at_cap() {
        let tool = Arc::new(ScriptedTool::new(
            "run_query",
            vec![Behavior::Fail(ToolError::Network("down".into()))],
        ));
        let (resolved, call) = prepare(tool.clone());

        let obs = ToolRunner::run(resolved, &call, Duration::from_secs(1), &policy(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(obs.status, ObservationStatus::Failure);
        assert_eq!(obs.attempts, 2);
        assert_eq!(tool.calls(), 2);
    }

    #[tokio::test]
    async fn panicking_tool_is_contained() {
        let tool = Arc::new(ScriptedTool::new("run_query", vec![Behavior::Panic]));
        let (resolved, call) = prepare(tool.clone());

        let obs = ToolRunner::run(resolved, &call, Duration::from_secs(1), &policy(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(obs.status, ObservationStatus::Failure);
        assert_eq!(obs.attempts, 1);
        assert!(obs.error.unwrap().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_hanging_attempt() {
        let tool = Arc::new(ScriptedTool::new("run_query", vec![Behavior::Hang]));
        let (resolved, call) = prepare(tool.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = ToolRunner::run(resolved, &call, Duration::from_secs(60), &policy(3), &cancel).await;
        assert_eq!(result, Err(Cancelled));
        assert_eq!(tool.calls(), 1);
    }
}
