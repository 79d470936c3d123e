pub mod config_cmd;
pub mod run;
pub mod tools;
pub mod trace;

use crate::StoreKind;
use metricchat_config::AppConfig;
use metricchat_core::SnapshotStore;
use metricchat_store::{InMemorySnapshotStore, JsonlSnapshotStore};
use std::sync::Arc;

/// The snapshot store selected by flag, falling back to config.
pub fn open_store(config: &AppConfig, kind: Option<StoreKind>) -> Arc<dyn SnapshotStore> {
    let kind = kind.unwrap_or(match config.snapshots.backend.as_str() {
        "memory" => StoreKind::Memory,
        _ => StoreKind::Jsonl,
    });
    match kind {
        StoreKind::Memory => Arc::new(InMemorySnapshotStore::new()),
        StoreKind::Jsonl => Arc::new(JsonlSnapshotStore::new(config.snapshots.resolved_dir())),
    }
}
