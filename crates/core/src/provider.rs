//! ModelProvider trait: the abstraction over the language model.
//!
//! The agent core never talks HTTP. A provider turns the current context and
//! history into a stream of text chunks that together encode one decision
//! object; the DecisionStream parses them as they arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::context::ContextSnapshot;
use crate::error::ProviderError;
use crate::session::{Iteration, SessionId};
use crate::tool::ToolDefinition;

/// Receiver half of a token stream. An `Err` item interrupts the stream.
pub type TokenStream = mpsc::Receiver<Result<String, ProviderError>>;

/// Everything a provider needs to produce the next decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub session_id: SessionId,
    pub iteration: u32,
    pub question: String,
    pub context: Arc<ContextSnapshot>,
    #[serde(default)]
    pub history: Vec<Iteration>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name, used in logs.
    fn name(&self) -> &str;

    /// Start streaming one decision. Returning `Err` means the stream never
    /// started; errors after that arrive inside the stream.
    async fn stream_decision(&self, request: DecisionRequest) -> Result<TokenStream, ProviderError>;
}
