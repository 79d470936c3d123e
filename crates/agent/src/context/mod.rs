//! Working-context assembly.
//!
//! Before every iteration the [`ContextHub`] merges two sections under one
//! token budget:
//!
//! | Section | Facts | Fixed for |
//! |---------|-------|-----------|
//! | Static | question, standing instructions, schema summaries | the session |
//! | Warm | prior decisions, observations, iteration errors | one iteration |
//!
//! Fragments are ranked by relevance decayed by age and dropped whole,
//! lowest-ranked first, when the candidates exceed the budget.

pub mod hub;
pub mod token;

pub use hub::{ContextBudget, ContextError, ContextHub};
pub use token::estimate_tokens;
