//! The agent loop that turns a question into an answer.
//!
//! Each session follows a **plan → act → observe** cycle:
//!
//! 1. **Build context** from the question, static instructions and the
//!    ranked history of earlier iterations
//! 2. **Stream a decision** from the model provider, surfacing fields as
//!    they close
//! 3. **If a tool is requested**: validate, execute under timeout and retry,
//!    persist the iteration and loop back to step 1
//! 4. **If an answer is given**: persist it and finish
//!
//! The loop also stops at the iteration budget, on cancellation, on the
//! session deadline, or when failures pile up.

pub mod context;
pub mod decision_stream;
pub mod loop_runner;
pub mod runner;

#[cfg(test)]
mod testing;

pub use context::{ContextBudget, ContextError, ContextHub, estimate_tokens};
pub use decision_stream::DecisionStream;
pub use loop_runner::{AgentLoop, LoopSettings, LoopState, SessionFailure, SessionOutcome};
pub use runner::{Cancelled, RetryPolicy, ToolRunner};
