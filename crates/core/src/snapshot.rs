//! SnapshotStore trait: append-only persistence of iterations.
//!
//! An acknowledged `append` is durable. The core never retries a failed
//! write; the session fails instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::session::{Iteration, Session, SessionId, SessionStatus};

/// Header record persisted alongside a session's iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub question: String,
    pub max_iterations: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            question: session.question.clone(),
            max_iterations: session.max_iterations,
            status: session.status(),
            created_at: session.created_at,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store name, used in logs.
    fn name(&self) -> &str;

    /// Create or update the session header.
    async fn save_session(&self, record: &SessionRecord) -> Result<(), SnapshotError>;

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionRecord, SnapshotError>;

    /// Append one iteration. Indices must arrive in order starting at 0.
    async fn append(&self, session_id: &SessionId, iteration: &Iteration) -> Result<(), SnapshotError>;

    /// All iterations of a session, in index order.
    async fn load(&self, session_id: &SessionId) -> Result<Vec<Iteration>, SnapshotError>;

    /// Known session ids.
    async fn sessions(&self) -> Result<Vec<SessionId>, SnapshotError>;
}
