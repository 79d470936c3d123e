//! Deterministic, budgeted context snapshot builder.

use metricchat_config::ContextConfig;
use metricchat_core::{
    ContextFragment, ContextSnapshot, DropInfo, FragmentSource, Iteration, PlannerDecision,
    Section, Session,
};

use super::token::estimate_tokens;

const QUESTION_RELEVANCE: f64 = 1.0;
const INSTRUCTION_RELEVANCE: f64 = 0.9;
const SCHEMA_RELEVANCE: f64 = 0.8;
const OBSERVATION_RELEVANCE: f64 = 0.9;
const ERROR_RELEVANCE: f64 = 0.85;
const DECISION_RELEVANCE: f64 = 0.6;

/// Token limits for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBudget {
    pub total_tokens: usize,
    pub static_max_tokens: Option<usize>,
    pub warm_max_tokens: Option<usize>,
}

impl ContextBudget {
    pub fn new(total_tokens: usize) -> Self {
        Self {
            total_tokens,
            static_max_tokens: None,
            warm_max_tokens: None,
        }
    }

    fn section_cap(&self, section: Section) -> Option<usize> {
        match section {
            Section::Static => self.static_max_tokens,
            Section::Warm => self.warm_max_tokens,
        }
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl From<&ContextConfig> for ContextBudget {
    fn from(config: &ContextConfig) -> Self {
        Self {
            total_tokens: config.budget_tokens,
            static_max_tokens: config.static_max_tokens,
            warm_max_tokens: config.warm_max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("context budget is zero")]
    ZeroBudget,

    #[error("the question alone needs {tokens} tokens, budget allows {budget}")]
    QuestionDoesNotFit { tokens: usize, budget: usize },
}

struct Candidate {
    fragment: ContextFragment,
    /// Higher is newer. Static facts rank as newest.
    recency: u32,
}

/// Builds the working context for each iteration.
///
/// Holds only session-independent static facts; everything else comes from
/// the arguments to [`ContextHub::build`], so identical inputs always give
/// an identical snapshot.
#[derive(Debug, Clone)]
pub struct ContextHub {
    instructions: Vec<String>,
    schemas: Vec<(String, String)>,
    recency_decay: f64,
}

impl ContextHub {
    pub fn new(recency_decay: f64) -> Self {
        Self {
            instructions: Vec::new(),
            schemas: Vec::new(),
            recency_decay,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.recency_decay).with_instructions(config.instructions.iter().cloned())
    }

    pub fn with_instructions(mut self, instructions: impl IntoIterator<Item = String>) -> Self {
        self.instructions.extend(instructions);
        self
    }

    /// Add a schema summary (table or metric description) as a static fact.
    pub fn with_schema(mut self, name: impl Into<String>, summary: impl Into<String>) -> Self {
        self.schemas.push((name.into(), summary.into()));
        self
    }

    /// Assemble the snapshot for the next iteration of `session`.
    pub fn build(
        &self,
        session: &Session,
        history: &[Iteration],
        budget: &ContextBudget,
    ) -> Result<ContextSnapshot, ContextError> {
        if budget.total_tokens == 0 {
            return Err(ContextError::ZeroBudget);
        }

        let candidates = self.candidates(session, history);

        let mut ranked: Vec<usize> = (0..candidates.len()).collect();
        ranked.sort_by(|&a, &b| {
            let (x, y) = (&candidates[a], &candidates[b]);
            y.fragment
                .score
                .total_cmp(&x.fragment.score)
                .then(y.recency.cmp(&x.recency))
                .then(a.cmp(&b))
        });

        let mut keep = vec![false; candidates.len()];
        let mut dropped = Vec::new();
        let mut used_total = 0;
        let mut used_static = 0;
        let mut used_warm = 0;
        let mut static_closed = false;
        let mut warm_closed = false;
        let mut exhausted = false;

        for idx in ranked {
            let fragment = &candidates[idx].fragment;
            let cap = budget.section_cap(fragment.section);
            let (used_section, section_closed) = match fragment.section {
                Section::Static => (&mut used_static, &mut static_closed),
                Section::Warm => (&mut used_warm, &mut warm_closed),
            };
            let limit = cap.map_or(budget.total_tokens, |c| c.min(budget.total_tokens));

            let oversized = fragment.tokens > limit;
            let fits_total = used_total + fragment.tokens <= budget.total_tokens;
            let fits_section = cap.is_none_or(|c| *used_section + fragment.tokens <= c);

            if oversized || exhausted || *section_closed || !fits_total || !fits_section {
                if !oversized {
                    // Lower-ranked fragments never jump ahead of one that overflowed.
                    if !fits_total {
                        exhausted = true;
                    } else if !fits_section {
                        *section_closed = true;
                    }
                }
                dropped.push(DropInfo {
                    source: fragment.source.clone(),
                    tokens: fragment.tokens,
                    score: fragment.score,
                    oversized,
                });
                continue;
            }

            keep[idx] = true;
            used_total += fragment.tokens;
            *used_section += fragment.tokens;
        }

        // Candidate 0 is always the question.
        if let Some(question) = candidates.first() {
            if !keep[0] {
                return Err(ContextError::QuestionDoesNotFit {
                    tokens: question.fragment.tokens,
                    budget: budget
                        .static_max_tokens
                        .map_or(budget.total_tokens, |c| c.min(budget.total_tokens)),
                });
            }
        }

        let fragments: Vec<ContextFragment> = candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(c, kept)| kept.then_some(c.fragment))
            .collect();

        if !dropped.is_empty() {
            tracing::debug!(
                session_id = %session.id,
                kept = fragments.len(),
                dropped = dropped.len(),
                tokens = used_total,
                "Context candidates exceeded budget"
            );
        }

        Ok(ContextSnapshot {
            fragments,
            total_tokens: used_total,
            budget_tokens: budget.total_tokens,
            dropped,
        })
    }

    /// All candidate fragments in output order: static facts in declaration
    /// order, then warm facts chronologically.
    fn candidates(&self, session: &Session, history: &[Iteration]) -> Vec<Candidate> {
        let mut out = Vec::new();

        let mut push_static = |source: FragmentSource, content: String, relevance: f64| {
            out.push(Candidate {
                fragment: fragment(Section::Static, source, content, relevance, relevance),
                recency: u32::MAX,
            });
        };
        push_static(
            FragmentSource::Question,
            format!("Question: {}", session.question),
            QUESTION_RELEVANCE,
        );
        for instruction in &self.instructions {
            push_static(
                FragmentSource::Instruction,
                format!("Instruction: {instruction}"),
                INSTRUCTION_RELEVANCE,
            );
        }
        for (name, summary) in &self.schemas {
            push_static(
                FragmentSource::Schema { name: name.clone() },
                format!("Schema {name}: {summary}"),
                SCHEMA_RELEVANCE,
            );
        }

        let newest = history.len();
        for (position, iteration) in history.iter().enumerate() {
            let age = (newest - 1 - position) as i32;
            let decay = self.recency_decay.powi(age);
            let index = iteration.index;
            let mut push_warm = |source: FragmentSource, content: String, relevance: f64| {
                out.push(Candidate {
                    fragment: fragment(Section::Warm, source, content, relevance, relevance * decay),
                    recency: index,
                });
            };

            if let Some(decision) = &iteration.decision {
                push_warm(
                    FragmentSource::Decision { iteration: index },
                    format!("Iteration {index} decision: {}", describe_decision(decision)),
                    DECISION_RELEVANCE,
                );
            }
            if let Some(observation) = &iteration.observation {
                push_warm(
                    FragmentSource::Observation {
                        iteration: index,
                        tool_name: observation.tool_name.clone(),
                    },
                    format!("Iteration {index} observation: {}", observation.summary()),
                    OBSERVATION_RELEVANCE,
                );
            }
            if let Some(error) = &iteration.error {
                push_warm(
                    FragmentSource::IterationError { iteration: index },
                    format!(
                        "Iteration {index} error ({}): {}",
                        error.kind.as_str(),
                        error.message
                    ),
                    ERROR_RELEVANCE,
                );
            }
        }
        out
    }
}

impl Default for ContextHub {
    fn default() -> Self {
        Self::new(0.85)
    }
}

fn fragment(
    section: Section,
    source: FragmentSource,
    content: String,
    relevance: f64,
    score: f64,
) -> ContextFragment {
    ContextFragment {
        section,
        source,
        tokens: estimate_tokens(&content),
        content,
        relevance,
        score,
    }
}

fn describe_decision(decision: &PlannerDecision) -> String {
    match decision {
        PlannerDecision::ToolRequest {
            reasoning,
            tool_name,
            tool_arguments,
        } => format!(
            "{}called {tool_name} with {}",
            reasoning.as_deref().map(|r| format!("{r}; ")).unwrap_or_default(),
            serde_json::Value::Object(tool_arguments.clone())
        ),
        PlannerDecision::FinalAnswer { answer, .. } => format!("answered: {answer}"),
    }
}
