//! In-memory snapshot store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use metricchat_core::{Iteration, SessionId, SessionRecord, SnapshotError, SnapshotStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::check_next_index;

#[derive(Default)]
struct Entry {
    record: Option<SessionRecord>,
    iterations: Vec<Iteration>,
}

/// Keeps every session in a map. Nothing survives the process.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    sessions: Arc<RwLock<HashMap<SessionId, Entry>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of iterations stored for a session.
    pub async fn len(&self, session_id: &SessionId) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map_or(0, |e| e.iterations.len())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), SnapshotError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(record.session_id.clone()).or_default().record = Some(record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionRecord, SnapshotError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|e| e.record.clone())
            .ok_or_else(|| SnapshotError::NotFound(session_id.to_string()))
    }

    async fn append(&self, session_id: &SessionId, iteration: &Iteration) -> Result<(), SnapshotError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id.clone()).or_default();
        check_next_index(session_id, entry.iterations.len() as u32, iteration)?;
        entry.iterations.push(iteration.clone());
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Vec<Iteration>, SnapshotError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.iterations.clone())
            .ok_or_else(|| SnapshotError::NotFound(session_id.to_string()))
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, SnapshotError> {
        let mut ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::iteration;
    use metricchat_core::{Session, SessionStatus};

    #[tokio::test]
    async fn append_and_load_in_order() {
        let store = InMemorySnapshotStore::new();
        let id = SessionId::from("s-1");
        store.append(&id, &iteration(0)).await.unwrap();
        store.append(&id, &iteration(1)).await.unwrap();

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.iter().map(|i| i.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(store.len(&id).await, 2);
    }

    #[tokio::test]
    async fn out_of_order_append_is_rejected() {
        let store = InMemorySnapshotStore::new();
        let id = SessionId::from("s-1");
        let err = store.append(&id, &iteration(1)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::OutOfOrder { expected: 0, got: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let store = InMemorySnapshotStore::new();
        let id = SessionId::from("missing");
        assert!(matches!(store.load(&id).await, Err(SnapshotError::NotFound(_))));
        assert!(matches!(store.load_session(&id).await, Err(SnapshotError::NotFound(_))));
    }

    #[tokio::test]
    async fn session_header_is_updated_in_place() {
        let store = InMemorySnapshotStore::new();
        let mut session = Session::new("What were total sales last month?", 3);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();
        session.finish(SessionStatus::Completed);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();

        let record = store.load_session(&session.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(store.sessions().await.unwrap(), vec![session.id.clone()]);
    }
}
