//! Whole-store snapshots on disk.
//!
//! The CLI persists the store between invocations so that `run`, `resume` and
//! `cancel` operate on the same state. A snapshot is the committed tables plus
//! a timestamp, written as pretty JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use orchestra_types::Result;

use crate::store::{StateStore, Tables};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub tables: Tables,
    /// RFC 3339 timestamp of when the snapshot was taken.
    pub timestamp: String,
}

impl StoreSnapshot {
    pub async fn capture(store: &StateStore) -> Self {
        Self {
            tables: store.snapshot().await,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Write the committed state of `store` to `path`.
///
/// Parent directories are created as needed. The file is written beside the
/// target and renamed into place, so a crash never leaves a torn snapshot.
pub async fn save_snapshot(store: &StateStore, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let snapshot = StoreSnapshot::capture(store).await;
    let json = serde_json::to_string_pretty(&snapshot)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    tracing::debug!(path = %path.display(), tasks = snapshot.tables.tasks.len(), "Snapshot saved");
    Ok(path.to_path_buf())
}

/// Read a snapshot. Returns `Ok(None)` when the file does not exist.
pub async fn load_snapshot(path: &Path) -> Result<Option<StoreSnapshot>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(path).await?;
    let snapshot: StoreSnapshot = serde_json::from_str(&json)?;
    Ok(Some(snapshot))
}

/// Open a store from `path`, or an empty one when no snapshot exists yet.
pub async fn open_store(path: &Path) -> Result<StateStore> {
    match load_snapshot(path).await? {
        Some(snapshot) => {
            tracing::debug!(path = %path.display(), saved_at = %snapshot.timestamp, "Restored store");
            Ok(StateStore::from_tables(snapshot.tables))
        }
        None => Ok(StateStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_types::{NewTask, Project, TaskStatus};

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("orchestra.json");

        let store = StateStore::new();
        store.create_project(Project::new("p", "Demo")).await.unwrap();
        store
            .import_tasks(
                "p",
                vec![
                    NewTask::new("A").with_id("a"),
                    NewTask::new("B").with_id("b").depends_on(["a"]),
                ],
            )
            .await
            .unwrap();

        let written = save_snapshot(&store, &path).await.unwrap();
        assert!(written.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let restored = open_store(&path).await.unwrap();
        let b = restored.get_task("b").await.unwrap();
        assert_eq!(b.depends_on, vec!["a".to_string()]);
        assert_eq!(b.status, TaskStatus::Pending);
        assert_eq!(restored.get_project("p").await.unwrap().task_ids.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(load_snapshot(&path).await.unwrap().is_none());
        assert!(open_store(&path).await.unwrap().snapshot().await.tasks.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(load_snapshot(&path).await.is_err());
    }
}
