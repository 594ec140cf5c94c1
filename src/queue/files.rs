//! Queue files: one JSON record per queue under `<queue_dir>/<test_set>/`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::assign::Queue;
use crate::az::WorkspaceScope;
use crate::config::WorkspaceList;
use crate::error::QueueError;

/// Persisted form of a queue, read back by the per-model test job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueFile {
    pub queue_name: String,
    pub models: Vec<String>,
    pub workspace: String,
    pub subscription: String,
    pub resource_group: String,
    pub registry: String,
}

impl QueueFile {
    pub fn from_queue(queue: &Queue, workspaces: &WorkspaceList, registry: &str) -> Result<Self, QueueError> {
        let ws = workspaces
            .get(&queue.workspace)
            .ok_or_else(|| QueueError::UnknownWorkspace(queue.workspace.clone()))?;
        Ok(Self {
            queue_name: queue.label(),
            models: queue.models.clone(),
            workspace: queue.workspace.clone(),
            subscription: ws.subscription.clone(),
            resource_group: ws.resource_group.clone(),
            registry: ws.registry.clone().unwrap_or_else(|| registry.to_string()),
        })
    }

    pub fn scope(&self) -> WorkspaceScope {
        WorkspaceScope {
            subscription: self.subscription.clone(),
            resource_group: self.resource_group.clone(),
            workspace: self.workspace.clone(),
        }
    }

    /// The model to trigger after `current`. At the end of the queue this
    /// wraps to the first model when looping, otherwise returns `None`.
    /// A model listed twice has no single successor and is rejected.
    pub fn next_model(&self, current: &str, keep_looping: bool) -> Result<Option<&str>, QueueError> {
        let mut hits = self.models.iter().enumerate().filter(|(_, m)| *m == current);
        let (index, _) = hits.next().ok_or_else(|| QueueError::ModelNotInQueue {
            model: current.to_string(),
            queue: self.queue_name.clone(),
        })?;
        if hits.next().is_some() {
            return Err(QueueError::DuplicateModel(current.to_string()));
        }
        debug!(model = current, index, queue = %self.queue_name, "located model in queue");

        if let Some(next) = self.models.get(index + 1) {
            return Ok(Some(next));
        }
        if keep_looping {
            return Ok(self.models.first().map(String::as_str));
        }
        Ok(None)
    }
}

pub fn queue_file_path(queue_dir: &Path, test_set: &str, queue_name: &str) -> PathBuf {
    queue_dir.join(test_set).join(format!("{queue_name}.json"))
}

/// Replace the queue files of `test_set` with `files`. Stale `*.json`
/// records from a previous run are removed first.
pub fn write_queue_files(queue_dir: &Path, test_set: &str, files: &[QueueFile]) -> Result<Vec<PathBuf>> {
    let set_dir = queue_dir.join(test_set);
    fs::create_dir_all(&set_dir)
        .with_context(|| format!("failed to create queue dir {}", set_dir.display()))?;

    let mut removed = 0usize;
    for entry in fs::read_dir(&set_dir).with_context(|| format!("failed to list {}", set_dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "json") {
            fs::remove_file(&path).with_context(|| format!("failed to remove stale queue {}", path.display()))?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(removed, dir = %set_dir.display(), "removed queue files from previous run");
    }

    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let path = queue_file_path(queue_dir, test_set, &file.queue_name);
        let body = serde_json::to_string_pretty(file).context("failed to serialize queue file")?;
        fs::write(&path, body).with_context(|| format!("failed to write queue file {}", path.display()))?;
        written.push(path);
    }
    info!(count = written.len(), dir = %set_dir.display(), "wrote queue files");
    Ok(written)
}

pub fn read_queue_file(queue_dir: &Path, test_set: &str, queue_name: &str) -> Result<QueueFile> {
    let path = queue_file_path(queue_dir, test_set, queue_name);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read queue file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse queue file {}", path.display()))
}

/// Append `key=value` to the step-output file the CI runner provides.
pub fn write_step_output(path: &Path, key: &str, value: &str) -> Result<()> {
    let mut fh = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open step output {}", path.display()))?;
    writeln!(fh, "{key}={value}").with_context(|| format!("failed to write step output {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceDescriptor;
    use tempfile::tempdir;

    fn workspaces() -> WorkspaceList {
        let mut list = WorkspaceList::new();
        list.insert(
            "ws-east".to_string(),
            WorkspaceDescriptor {
                subscription: "sub-1".to_string(),
                resource_group: "rg-east".to_string(),
                region: "eastus".to_string(),
                registry: None,
                secret_name: "AZ_CRED_EAST".to_string(),
                environment: None,
                compute: None,
                instance_type: None,
            },
        );
        list
    }

    fn queue_file(models: &[&str]) -> QueueFile {
        QueueFile {
            queue_name: "ws-east-0".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            workspace: "ws-east".to_string(),
            subscription: "sub-1".to_string(),
            resource_group: "rg-east".to_string(),
            registry: "HuggingFace".to_string(),
        }
    }

    #[test]
    fn from_queue_copies_workspace_metadata() {
        let queue = Queue {
            workspace: "ws-east".to_string(),
            thread: 1,
            models: vec!["gpt2".to_string()],
        };
        let file = QueueFile::from_queue(&queue, &workspaces(), "HuggingFace").unwrap();
        assert_eq!(file.queue_name, "ws-east-1");
        assert_eq!(file.resource_group, "rg-east");
        assert_eq!(file.registry, "HuggingFace");
    }

    #[test]
    fn from_queue_rejects_unknown_workspace() {
        let queue = Queue {
            workspace: "ws-missing".to_string(),
            thread: 0,
            models: vec![],
        };
        assert!(matches!(
            QueueFile::from_queue(&queue, &workspaces(), "HuggingFace"),
            Err(QueueError::UnknownWorkspace(_))
        ));
    }

    #[test]
    fn next_model_walks_and_wraps() {
        let q = queue_file(&["a", "b", "c"]);
        assert_eq!(q.next_model("a", false).unwrap(), Some("b"));
        assert_eq!(q.next_model("c", false).unwrap(), None);
        assert_eq!(q.next_model("c", true).unwrap(), Some("a"));
        assert!(q.next_model("zzz", true).is_err());
    }

    #[test]
    fn next_model_rejects_repeated_entry() {
        let q = queue_file(&["a", "b", "a"]);
        assert!(matches!(q.next_model("a", false), Err(QueueError::DuplicateModel(ref m)) if m == "a"));
        assert_eq!(q.next_model("b", false).unwrap(), Some("a"));
    }

    #[test]
    fn write_replaces_stale_queue_files() {
        let dir = tempdir().unwrap();
        let set_dir = dir.path().join("nightly");
        fs::create_dir_all(&set_dir).unwrap();
        fs::write(set_dir.join("old-0.json"), "{}").unwrap();
        fs::write(set_dir.join("README.md"), "keep").unwrap();

        let written = write_queue_files(dir.path(), "nightly", &[queue_file(&["gpt2"])]).unwrap();
        assert_eq!(written.len(), 1);
        assert!(!set_dir.join("old-0.json").exists());
        assert!(set_dir.join("README.md").exists());

        let back = read_queue_file(dir.path(), "nightly", "ws-east-0").unwrap();
        assert_eq!(back, queue_file(&["gpt2"]));
    }

    #[test]
    fn step_output_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("github_output");
        write_step_output(&path, "NEXT_MODEL", "gpt2").unwrap();
        write_step_output(&path, "NEXT_MODEL", "").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "NEXT_MODEL=gpt2\nNEXT_MODEL=\n");
    }
}
