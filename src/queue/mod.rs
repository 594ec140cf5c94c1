//! Queue creation: batch models over workspace threads and materialize the
//! queue records and per-model workflow files.
//!
//! # Submodules
//! - [`assign`] - round-robin assignment (pure, no I/O)
//! - [`files`] - queue file persistence and next-model lookup

pub mod assign;
pub mod files;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

pub use assign::{Queue, QueueAssignment, assign_models_to_queues, queue_label};
pub use files::{QueueFile, read_queue_file, write_queue_files, write_step_output};

use crate::config::WorkspaceList;
use crate::error::QueueError;
use crate::template::{Substitutions, Template, check_yaml, write_rendered};
use crate::utils::{dump_json_log, sanitize_model_name};

/// Settings for one `create-queue` run, validated before any file is touched.
#[derive(Debug, Clone)]
pub struct QueueRunConfig {
    pub registry: String,
    pub workflow_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub test_set: String,
    pub keep_looping: bool,
    pub trigger_next_model: bool,
    pub sku_type: String,
    pub parallel_tests: usize,
    pub workflow_template: PathBuf,
    pub workflow_prefix: String,
    pub log_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl QueueRunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallel_tests == 0 {
            return Err(anyhow!("--parallel-tests must be at least 1"));
        }
        if self.test_set.trim().is_empty() || self.test_set.contains(['/', '\\']) {
            return Err(anyhow!("--test-set must be a plain directory name, got {:?}", self.test_set));
        }
        if self.sku_type.trim().is_empty() {
            return Err(anyhow!("--test-sku-type must not be empty"));
        }
        if !self.workflow_template.is_file() {
            return Err(anyhow!(
                "workflow template not found: {}",
                self.workflow_template.display()
            ));
        }
        Ok(())
    }
}

/// What a `create-queue` run produced.
#[derive(Debug, Clone)]
pub struct QueueRunReport {
    pub models: usize,
    pub workspaces: usize,
    pub parallel_tests: usize,
    pub queues: usize,
    pub queue_files: Vec<PathBuf>,
    pub workflow_files: Vec<PathBuf>,
}

impl QueueRunReport {
    pub fn total_slots(&self) -> usize {
        self.workspaces * self.parallel_tests
    }

    pub fn average_per_queue(&self) -> usize {
        self.models.checked_div(self.total_slots()).unwrap_or(0)
    }
}

pub fn workflow_substitutions(
    config: &QueueRunConfig,
    model: &str,
    queue_name: &str,
    secret_name: &str,
) -> Substitutions {
    Substitutions::new()
        .with("test_queue", queue_name)
        .with("test_sku_type", config.sku_type.as_str())
        .with("test_trigger_next_model", config.trigger_next_model.to_string())
        .with("test_keep_looping", config.keep_looping.to_string())
        .with("test_model_name", model)
        .with("test_set", config.test_set.as_str())
        .with("test_secret_name", secret_name)
}

pub fn workflow_path(config: &QueueRunConfig, model: &str) -> PathBuf {
    config
        .workflow_dir
        .join(format!("{}{}.yml", config.workflow_prefix, sanitize_model_name(model)))
}

/// Fail when two models would share one workflow file, e.g. `org/m1` and `org-m1`.
pub fn check_workflow_names(config: &QueueRunConfig, models: &[String]) -> Result<(), QueueError> {
    let mut owners: HashMap<PathBuf, &str> = HashMap::with_capacity(models.len());
    for model in models {
        let path = workflow_path(config, model);
        if let Some(first) = owners.get(&path) {
            return Err(QueueError::WorkflowNameCollision {
                path,
                first: first.to_string(),
                second: model.clone(),
            });
        }
        owners.insert(path, model);
    }
    Ok(())
}

/// Assign `models` to queues, then write queue files and one workflow file per model.
///
/// Existing queue files of the test set and same-named workflow files are
/// overwritten. With `dry_run` the plan is logged and nothing is written.
pub fn create_queues(
    config: &QueueRunConfig,
    models: &[String],
    workspaces: &WorkspaceList,
) -> Result<QueueRunReport> {
    config.validate()?;
    info!(models = models.len(), workspaces = workspaces.len(), "creating queues");

    let names: Vec<&str> = workspaces.keys().map(String::as_str).collect();
    let assignment = assign_models_to_queues(models, &names, config.parallel_tests)?;
    check_workflow_names(config, models)?;
    if let Some(log_dir) = &config.log_dir
        && !config.dry_run
    {
        dump_json_log(log_dir, "assign_models_to_queues", "", &assignment)?;
    }

    let queues = assignment.queues();
    let queue_records = queues
        .iter()
        .map(|q| QueueFile::from_queue(q, workspaces, &config.registry))
        .collect::<Result<Vec<_>, _>>()?;

    let template = Template::load(&config.workflow_template)?;
    let mut rendered = Vec::with_capacity(models.len());
    for (queue, record) in queues.iter().zip(&queue_records) {
        let secret_name = &workspaces[&queue.workspace].secret_name;
        if secret_name.is_empty() {
            warn!(workspace = %queue.workspace, "workspace has no secret_name; workflows will reference an empty secret");
        }
        for model in &queue.models {
            let subs = workflow_substitutions(config, model, &record.queue_name, secret_name);
            let content = template
                .render(&subs)
                .with_context(|| format!("failed to render {} for {model}", template.describe()))?;
            rendered.push((workflow_path(config, model), content));
        }
    }

    if config.dry_run {
        for record in &queue_records {
            info!(queue = %record.queue_name, models = record.models.len(), "dry-run: would write queue file");
        }
        info!(count = rendered.len(), dir = %config.workflow_dir.display(), "dry-run: would write workflow files");
        return Ok(QueueRunReport {
            models: models.len(),
            workspaces: workspaces.len(),
            parallel_tests: config.parallel_tests,
            queues: queue_records.len(),
            queue_files: Vec::new(),
            workflow_files: Vec::new(),
        });
    }

    let queue_files = write_queue_files(&config.queue_dir, &config.test_set, &queue_records)?;

    let mut workflow_files = Vec::with_capacity(rendered.len());
    for (path, content) in rendered {
        check_yaml(&path, &content);
        write_rendered(&path, &content)?;
        workflow_files.push(path);
    }
    info!(count = workflow_files.len(), dir = %config.workflow_dir.display(), "wrote workflow files");

    Ok(QueueRunReport {
        models: models.len(),
        workspaces: workspaces.len(),
        parallel_tests: config.parallel_tests,
        queues: queue_records.len(),
        queue_files,
        workflow_files,
    })
}
