//! ContextSnapshot: the bounded, ranked set of facts given to the model for
//! one iteration.
//!
//! A snapshot is built once per iteration and never mutated afterwards. The
//! Iteration that used it holds an `Arc` to it rather than a copy.

use serde::{Deserialize, Serialize};

/// Which part of the working context a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// Fixed for the whole session (question, instructions, schema summaries).
    Static,
    /// Changes per iteration (recent observations, prior decisions).
    Warm,
}

/// Where a fragment came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FragmentSource {
    Question,
    Instruction,
    Schema { name: String },
    Decision { iteration: u32 },
    Observation { iteration: u32, tool_name: String },
    IterationError { iteration: u32 },
}

/// One whole unit of context. Fragments are included or dropped whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFragment {
    pub section: Section,
    pub source: FragmentSource,
    pub content: String,
    /// Intrinsic relevance in `[0, 1]`.
    pub relevance: f64,
    /// Relevance after recency decay; the value used for ranking.
    pub score: f64,
    /// Estimated token size.
    pub tokens: usize,
}

/// Why a candidate fragment is missing from the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub source: FragmentSource,
    pub tokens: usize,
    pub score: f64,
    /// The fragment alone is larger than its budget.
    pub oversized: bool,
}

/// Immutable result of one ContextHub build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub fragments: Vec<ContextFragment>,
    pub total_tokens: usize,
    pub budget_tokens: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<DropInfo>,
}

impl ContextSnapshot {
    pub fn section(&self, section: Section) -> impl Iterator<Item = &ContextFragment> {
        self.fragments.iter().filter(move |f| f.section == section)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Plain-text rendering, one fragment per line. Prompt construction is
    /// the provider's job; this is for logs and the `trace` command.
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
