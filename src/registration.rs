//! Model import: run the registry's `import_model` pipeline for one model in
//! its queue's workspace, then look up the version it registered.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::az::Az;
use crate::deploy::{append_file, set_next_model};
use crate::models::{RegistryModel, latest_version};
use crate::queue::{read_queue_file, write_step_output};
use crate::utils::{Annotation, annotate, sanitize_model_name, strip_special_characters};

pub const IMPORT_COMPONENT: &str = "import_model";
pub const REGISTRATION_OUTPUT: &str = "model_registration_details";

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub model: String,
    /// Hub task; looked up from the hub when unset.
    pub task: Option<String>,
    pub queue: String,
    pub test_set: String,
    pub queue_dir: PathBuf,
    /// Registry that publishes the import component.
    pub component_registry: String,
    pub compute: Option<String>,
    pub update_existing_model: bool,
    pub skip_existing: bool,
    pub download_dir: PathBuf,
    pub trigger_next_model: bool,
    pub keep_looping: bool,
    pub github_output: Option<PathBuf>,
    pub step_summary: Option<PathBuf>,
}

impl ImportConfig {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("test_model_name", &self.model),
            ("test_queue", &self.queue),
            ("test_set", &self.test_set),
            ("component_registry", &self.component_registry),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!("required settings are not set: {}", missing.join(", ")));
        }
        Ok(())
    }
}

/// Name the import component registers `model` under.
pub fn registered_model_name(model: &str) -> String {
    sanitize_model_name(model)
}

/// Job and experiment names only allow `[A-Za-z0-9_-]`.
pub fn import_job_name(model: &str, unix_ts: i64) -> String {
    format!("import-{}-{unix_ts}", strip_special_characters(&sanitize_model_name(model)))
}

pub fn import_experiment_name(model: &str) -> String {
    format!("import-{}", strip_special_characters(&sanitize_model_name(model)))
}

#[derive(Debug, Serialize)]
pub struct ImportPipelineJob {
    #[serde(rename = "$schema")]
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub experiment_name: String,
    pub identity: JobIdentity,
    pub settings: PipelineSettings,
    pub jobs: IndexMap<String, ImportStep>,
    pub outputs: IndexMap<String, JobOutput>,
}

#[derive(Debug, Serialize)]
pub struct JobIdentity {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PipelineSettings {
    pub force_rerun: bool,
    pub continue_on_step_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_compute: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportStep {
    pub component: String,
    pub inputs: ImportInputs,
    pub outputs: IndexMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ImportInputs {
    pub model_id: String,
    pub task_name: String,
    pub update_existing_model: bool,
}

#[derive(Debug, Serialize)]
pub struct JobOutput {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl ImportPipelineJob {
    pub fn new(config: &ImportConfig, task: &str) -> Self {
        let step = ImportStep {
            component: format!(
                "azureml://registries/{}/components/{IMPORT_COMPONENT}/labels/latest",
                config.component_registry
            ),
            inputs: ImportInputs {
                model_id: config.model.clone(),
                task_name: task.to_string(),
                update_existing_model: config.update_existing_model,
            },
            outputs: IndexMap::from([(
                REGISTRATION_OUTPUT.to_string(),
                format!("${{{{parent.outputs.{REGISTRATION_OUTPUT}}}}}"),
            )]),
        };
        Self {
            schema: "https://azuremlschemas.azureedge.net/latest/pipelineJob.schema.json",
            kind: "pipeline",
            experiment_name: import_experiment_name(&config.model),
            identity: JobIdentity { kind: "user_identity" },
            settings: PipelineSettings {
                force_rerun: true,
                continue_on_step_failure: false,
                default_compute: config.compute.as_ref().map(|c| format!("azureml:{c}")),
            },
            jobs: IndexMap::from([(IMPORT_COMPONENT.to_string(), step)]),
            outputs: IndexMap::from([(REGISTRATION_OUTPUT.to_string(), JobOutput { kind: "uri_file" })]),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(default)]
    status: Option<String>,
}

/// `{name, version}` written by the import component. The version may be a
/// JSON number or string.
#[derive(Debug, Deserialize)]
pub struct RegistrationDetails {
    pub name: String,
    pub version: serde_json::Value,
}

impl RegistrationDetails {
    pub fn version(&self) -> String {
        match &self.version {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Where `az ml job download` leaves the registration output of `job`.
pub fn registration_details_path(download_dir: &Path, job: &str) -> PathBuf {
    download_dir
        .join(job)
        .join("named-outputs")
        .join(REGISTRATION_OUTPUT)
        .join(format!("{REGISTRATION_OUTPUT}.json"))
}

pub fn read_registration_details(path: &Path) -> Result<RegistrationDetails> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read registration details at {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse registration details at {}", path.display()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    AlreadyRegistered { name: String, version: String },
    Registered(RegistryModel),
}

/// Import one model into the workspace of its queue.
pub fn run_import<F>(config: &ImportConfig, az: &Az, lookup_task: F) -> Result<ImportOutcome>
where
    F: FnOnce(&str) -> Result<String>,
{
    config.validate()?;
    let queue = read_queue_file(&config.queue_dir, &config.test_set, &config.queue)?;
    if config.trigger_next_model {
        set_next_model(&queue, &config.model, config.keep_looping, config.github_output.as_deref())?;
    }
    let scope = queue.scope();

    info!(
        subscription = %scope.subscription,
        resource_group = %scope.resource_group,
        workspace = %scope.workspace,
        model = %config.model,
        queue = %config.queue,
        test_set = %config.test_set,
        "starting model import"
    );
    az.ensure_available()?;

    let name = registered_model_name(&config.model);
    let existing: Vec<RegistryModel> = az.list_workspace_model_versions(&scope, &name)?;
    if let Some(current) = latest_version(&existing) {
        let version = current.version.clone().unwrap_or_default();
        if config.skip_existing {
            annotate(
                Annotation::Notice,
                &format!("model {name} version {version} is already registered in {}; skipping import", scope.workspace),
            );
            return Ok(ImportOutcome::AlreadyRegistered { name, version });
        }
        info!(model = %name, %version, "model already registered; importing again");
    }

    let task = match config.task.as_deref().map(str::trim) {
        Some(task) if !task.is_empty() => task.to_string(),
        _ => lookup_task(&config.model)?,
    };
    info!(%task, "resolved import task");

    let job_name = import_job_name(&config.model, chrono::Utc::now().timestamp());
    let job_file = tempfile::Builder::new()
        .prefix("import-")
        .suffix(".yml")
        .tempfile()
        .context("failed to create pipeline job file")?;
    let body = serde_yaml::to_string(&ImportPipelineJob::new(config, &task))
        .context("failed to serialize pipeline job")?;
    fs::write(job_file.path(), body).context("failed to write pipeline job")?;

    let logs = az
        .create_job_streaming(&scope, job_file.path(), &job_name)
        .inspect_err(|_| annotate(Annotation::Error, &format!("import job {job_name} failed")))
        .with_context(|| format!("failed to import {}", config.model))?;
    println!("Import job logs:\n\n{logs}");

    let status: JobStatus = az.show_job(&scope, &job_name)?;
    let status = status.status.unwrap_or_else(|| "Unknown".to_string());
    if status != "Completed" {
        annotate(Annotation::Error, &format!("import job {job_name} finished as {status}"));
        return Err(anyhow!("import job {job_name} for {} finished with status {status}", config.model));
    }

    az.download_job_output(&scope, &job_name, REGISTRATION_OUTPUT, &config.download_dir.join(&job_name))?;
    let details = read_registration_details(&registration_details_path(&config.download_dir, &job_name))?;
    let version = details.version();
    let model: RegistryModel = az
        .show_workspace_model(&scope, &details.name, &version)
        .with_context(|| format!("registered model {}:{version} not found in {}", details.name, scope.workspace))?;
    info!(model = %details.name, %version, workspace = %scope.workspace, "model registered");

    if let Some(path) = &config.github_output {
        write_step_output(path, "REGISTERED_MODEL", &details.name)?;
        write_step_output(path, "REGISTERED_VERSION", &version)?;
    }
    if let Some(path) = &config.step_summary {
        append_file(
            path,
            &format!("#### Registered model\n`{}` version `{version}` in `{}`\n", details.name, scope.workspace),
        )?;
    }
    Ok(ImportOutcome::Registered(model))
}
