//! Snapshot store implementations for MetricChat.
//!
//! Both backends enforce the same append contract: iterations of a session
//! arrive in index order starting at 0, and an acknowledged append is never
//! rewritten.

pub mod in_memory;
pub mod jsonl;

pub use in_memory::InMemorySnapshotStore;
pub use jsonl::JsonlSnapshotStore;

use metricchat_core::{Iteration, SessionId, SnapshotError};

/// Reject an append whose index is not the next one for the session.
pub(crate) fn check_next_index(
    session_id: &SessionId,
    expected: u32,
    iteration: &Iteration,
) -> Result<(), SnapshotError> {
    if iteration.index != expected {
        return Err(SnapshotError::OutOfOrder {
            session_id: session_id.to_string(),
            expected,
            got: iteration.index,
        });
    }
    Ok(())
}
