//! JSONL snapshot store: one append-only file per session.
//!
//! Each line of `<dir>/<session_id>.jsonl` is one record: either a session
//! header (`"record": "session"`) or an iteration (`"record": "iteration"`).
//! Header updates are appended too; the last header wins on load. Every
//! append is flushed with `sync_data` before it is acknowledged.
//!
//! A crash mid-append can leave an unterminated last line. Readers skip it;
//! the first writer to touch the file afterwards cuts it off (or terminates
//! it, when it parses) so new records always start on a fresh line.

use async_trait::async_trait;
use metricchat_core::{Iteration, SessionId, SessionRecord, SnapshotError, SnapshotStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::check_next_index;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Line {
    Session(SessionRecord),
    Iteration(Box<Iteration>),
}

/// How the end of a session file must be fixed before the next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    /// Unparsable partial record; keep only the first `len` bytes.
    Torn { len: u64 },
    /// Complete record missing its newline.
    Unterminated,
}

/// Contents of one session file.
struct FileContents {
    record: Option<SessionRecord>,
    iterations: Vec<Iteration>,
    tail: Tail,
}

/// Per-session write state, known once the file has been read.
#[derive(Default)]
struct Writer {
    next_index: Option<u32>,
}

pub struct JsonlSnapshotStore {
    dir: PathBuf,
    /// One write lock per active session. Entries are dropped once a
    /// terminal header is written.
    writers: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<Writer>>>>,
}

impl JsonlSnapshotStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "JSONL snapshot store opened");
        Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &SessionId) -> Result<PathBuf, SnapshotError> {
        let id = session_id.as_str();
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(SnapshotError::Storage(format!(
                "session id '{id}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{id}.jsonl")))
    }

    fn writer(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<Writer>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(writers.entry(session_id.clone()).or_default())
    }

    fn forget(&self, session_id: &SessionId) {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.remove(session_id);
    }

    /// Learn the next index from disk and repair a torn tail. Runs once per
    /// writer; callers hold the session's write lock.
    async fn prepare(&self, session_id: &SessionId, writer: &mut Writer) -> Result<u32, SnapshotError> {
        if let Some(next) = writer.next_index {
            return Ok(next);
        }
        let next = match self.read_file(session_id).await {
            Ok(contents) => {
                self.repair(&self.path_for(session_id)?, contents.tail).await?;
                contents.iterations.len() as u32
            }
            Err(SnapshotError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        writer.next_index = Some(next);
        Ok(next)
    }

    async fn repair(&self, path: &Path, tail: Tail) -> Result<(), SnapshotError> {
        let storage = |e: std::io::Error| {
            SnapshotError::Storage(format!("Failed to repair {}: {e}", path.display()))
        };
        match tail {
            Tail::Clean => return Ok(()),
            Tail::Torn { len } => {
                let file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(path)
                    .await
                    .map_err(storage)?;
                file.set_len(len).await.map_err(storage)?;
                file.sync_data().await.map_err(storage)?;
            }
            Tail::Unterminated => {
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(path)
                    .await
                    .map_err(storage)?;
                file.write_all(b"\n").await.map_err(storage)?;
                file.sync_data().await.map_err(storage)?;
            }
        }
        warn!(path = %path.display(), ?tail, "Repaired session file tail");
        Ok(())
    }

    async fn write_line(&self, path: &Path, line: &Line) -> Result<(), SnapshotError> {
        let mut encoded = serde_json::to_string(line)
            .map_err(|e| SnapshotError::Storage(format!("Failed to serialize record: {e}")))?;
        encoded.push('\n');

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SnapshotError::Storage(format!("Failed to create snapshot directory: {e}"))
        })?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| SnapshotError::Storage(format!("Failed to open {}: {e}", path.display())))?;
        file.write_all(encoded.as_bytes())
            .await
            .map_err(|e| SnapshotError::Storage(format!("Failed to write {}: {e}", path.display())))?;
        file.sync_data()
            .await
            .map_err(|e| SnapshotError::Storage(format!("Failed to sync {}: {e}", path.display())))?;
        Ok(())
    }

    /// Read a session file. A final line without a trailing newline that
    /// fails to parse is a torn write that was never acknowledged and is
    /// skipped; any other bad line is corruption.
    async fn read_file(&self, session_id: &SessionId) -> Result<FileContents, SnapshotError> {
        let path = self.path_for(session_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(session_id.to_string()));
            }
            Err(e) => {
                return Err(SnapshotError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        // A torn write may end inside a multi-byte character.
        let content = String::from_utf8_lossy(&bytes);
        let ends_cleanly = bytes.is_empty() || bytes.ends_with(b"\n");
        let lines: Vec<&str> = content.lines().collect();
        let mut contents = FileContents {
            record: None,
            iterations: Vec::new(),
            tail: if ends_cleanly { Tail::Clean } else { Tail::Unterminated },
        };

        for (number, raw) in lines.iter().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Line>(raw) {
                Ok(Line::Session(record)) => contents.record = Some(record),
                Ok(Line::Iteration(iteration)) => {
                    check_next_index(session_id, contents.iterations.len() as u32, &iteration)
                        .map_err(|e| SnapshotError::Corrupted {
                            location: format!("{}:{}", path.display(), number + 1),
                            reason: e.to_string(),
                        })?;
                    contents.iterations.push(*iteration);
                }
                Err(e) if number + 1 == lines.len() && !ends_cleanly => {
                    warn!(path = %path.display(), error = %e, "Skipping torn trailing record");
                    let len = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
                    contents.tail = Tail::Torn { len: len as u64 };
                }
                Err(e) => {
                    return Err(SnapshotError::Corrupted {
                        location: format!("{}:{}", path.display(), number + 1),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(contents)
    }
}

#[async_trait]
impl SnapshotStore for JsonlSnapshotStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), SnapshotError> {
        let path = self.path_for(&record.session_id)?;
        let writer = self.writer(&record.session_id);
        let mut writer = writer.lock().await;
        self.prepare(&record.session_id, &mut writer).await?;
        self.write_line(&path, &Line::Session(record.clone())).await?;
        if record.status.is_terminal() {
            self.forget(&record.session_id);
        }
        Ok(())
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<SessionRecord, SnapshotError> {
        self.read_file(session_id)
            .await?
            .record
            .ok_or_else(|| SnapshotError::NotFound(session_id.to_string()))
    }

    async fn append(&self, session_id: &SessionId, iteration: &Iteration) -> Result<(), SnapshotError> {
        let path = self.path_for(session_id)?;
        let writer = self.writer(session_id);
        let mut writer = writer.lock().await;

        let expected = self.prepare(session_id, &mut writer).await?;
        check_next_index(session_id, expected, iteration)?;

        self.write_line(&path, &Line::Iteration(Box::new(iteration.clone())))
            .await?;
        writer.next_index = Some(expected + 1);
        debug!(session_id = %session_id, index = iteration.index, "Iteration persisted");
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Vec<Iteration>, SnapshotError> {
        Ok(self.read_file(session_id).await?.iterations)
    }

    async fn sessions(&self) -> Result<Vec<SessionId>, SnapshotError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(SnapshotError::Storage(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(SessionId::from(stem));
                }
            }
        }
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
    async fn append_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::from("s-1");
        {
            let store = JsonlSnapshotStore::new(dir.path());
            store.append(&id, &iteration(0)).await.unwrap();
            store.append(&id, &iteration(1)).await.unwrap();
        }

        let reopened = JsonlSnapshotStore::new(dir.path());
        let loaded = reopened.load(&id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].reasoning(), Some("step 1"));

        // Index tracking is rebuilt from disk.
        reopened.append(&id, &iteration(2)).await.unwrap();
        let err = reopened.append(&id, &iteration(2)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::OutOfOrder { expected: 3, .. }));
    }

    #[tokio::test]
    async fn last_header_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path());
        let mut session = Session::with_id(SessionId::from("s-2"), "Top customers?", 5);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();
        store.append(&session.id, &iteration(0)).await.unwrap();
        session.finish(SessionStatus::Failed);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();

        let record = store.load_session(&session.id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(store.load(&session.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path());
        let id = SessionId::from("s-3");
        store.append(&id, &iteration(0)).await.unwrap();

        let path = dir.path().join("s-3.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"record\":\"iteration\",\"index\":1");
        std::fs::write(&path, content).unwrap();

        let loaded = JsonlSnapshotStore::new(dir.path()).load(&id).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn append_after_torn_tail_starts_a_fresh_line() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::from("s-5");
        JsonlSnapshotStore::new(dir.path())
            .append(&id, &iteration(0))
            .await
            .unwrap();

        let path = dir.path().join("s-5.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"record\":\"iteration\",\"index\":1");
        std::fs::write(&path, content).unwrap();

        let reopened = JsonlSnapshotStore::new(dir.path());
        assert_eq!(reopened.load(&id).await.unwrap().len(), 1);
        reopened.append(&id, &iteration(1)).await.unwrap();

        let loaded = JsonlSnapshotStore::new(dir.path()).load(&id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].reasoning(), Some("step 1"));
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("}\n"));
    }

    #[tokio::test]
    async fn header_after_torn_tail_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s-6.jsonl");
        std::fs::write(&path, "{\"record\":\"sess").unwrap();

        let store = JsonlSnapshotStore::new(dir.path());
        let session = Session::with_id(SessionId::from("s-6"), "Revenue by month?", 4);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();

        let record = store.load_session(&session.id).await.unwrap();
        assert_eq!(record.question, "Revenue by month?");
        assert!(store.load(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_but_unterminated_line_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::from("s-7");
        JsonlSnapshotStore::new(dir.path())
            .append(&id, &iteration(0))
            .await
            .unwrap();

        let path = dir.path().join("s-7.jsonl");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.trim_end()).unwrap();

        let reopened = JsonlSnapshotStore::new(dir.path());
        reopened.append(&id, &iteration(1)).await.unwrap();
        assert_eq!(reopened.load(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn terminal_header_releases_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path());
        let mut session = Session::with_id(SessionId::from("s-8"), "Churn?", 3);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();
        store.append(&session.id, &iteration(0)).await.unwrap();
        assert_eq!(store.writers.lock().unwrap().len(), 1);

        session.finish(SessionStatus::Completed);
        store.save_session(&SessionRecord::from(&session)).await.unwrap();
        assert!(store.writers.lock().unwrap().is_empty());

        // Index tracking is relearned from disk.
        let err = store.append(&session.id, &iteration(0)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::OutOfOrder { expected: 1, .. }));
    }

    #[tokio::test]
    async fn sessions_write_independently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonlSnapshotStore::new(dir.path()));
        let mut handles = Vec::new();
        for n in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = SessionId::from(format!("par-{n}").as_str());
                for i in 0..5 {
                    store.append(&id, &iteration(i)).await.unwrap();
                }
                id
            }));
        }
        for handle in handles {
            let id = handle.await.unwrap();
            assert_eq!(store.load(&id).await.unwrap().len(), 5);
        }
    }

    #[tokio::test]
    async fn corrupted_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s-4.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let store = JsonlSnapshotStore::new(dir.path());
        let err = store.load(&SessionId::from("s-4")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn unsafe_session_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path());
        let err = store
            .append(&SessionId::from("../escape"), &iteration(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Storage(_)));
    }

    #[tokio::test]
    async fn lists_sessions_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlSnapshotStore::new(dir.path().join("sessions"));
        assert!(store.sessions().await.unwrap().is_empty());
        store.append(&SessionId::from("b"), &iteration(0)).await.unwrap();
        store.append(&SessionId::from("a"), &iteration(0)).await.unwrap();
        let ids = store.sessions().await.unwrap();
        assert_eq!(ids, vec![SessionId::from("a"), SessionId::from("b")]);
    }
}
