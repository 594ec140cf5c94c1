//! Per-model deployment test: resolve the latest model and its instance type,
//! stand up an online endpoint, score a sample request, then tear down.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, warn};

use crate::az::{Az, AzFailure, WorkspaceScope};
use crate::config::{ErrorPattern, SkuOverrides, load_error_patterns, load_sku_overrides};
use crate::models::{RegistryModel, RegistrySource};
use crate::queue::{QueueFile, read_queue_file, write_step_output};
use crate::utils::{Annotation, annotate};

pub const DEPLOYMENT_NAME: &str = "demo";

/// Inputs for one model's test job. CI passes most of these as environment
/// variables; they are all checked before any remote call.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub model: String,
    pub sku_type: String,
    pub queue: String,
    pub test_set: String,
    pub trigger_next_model: bool,
    pub keep_looping: bool,
    pub queue_dir: PathBuf,
    pub sku_override_dir: PathBuf,
    pub sample_dir: PathBuf,
    pub errors_file: PathBuf,
    pub github_output: Option<PathBuf>,
    pub step_summary: Option<PathBuf>,
    pub instance_count: u32,
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("test_model_name", &self.model),
            ("test_sku_type", &self.sku_type),
            ("test_queue", &self.queue),
            ("test_set", &self.test_set),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(anyhow!("required settings are not set: {}", missing.join(", ")));
        }
        if self.instance_count == 0 {
            return Err(anyhow!("instance count must be at least 1"));
        }
        Ok(())
    }
}

/// A log line that matched a known error pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub category: String,
    pub line: String,
}

/// Match every log line against the error table.
pub fn diagnose(logs: &str, patterns: &[ErrorPattern]) -> Vec<Diagnostic> {
    let mut found = Vec::new();
    for line in logs.lines() {
        for pattern in patterns {
            if !pattern.parse_string.is_empty() && line.contains(&pattern.parse_string) {
                found.push(Diagnostic {
                    category: pattern.error_category.clone(),
                    line: line.trim().to_string(),
                });
            }
        }
    }
    found
}

/// Pull `DefaultInstanceType` out of a SKU template's properties. It is either
/// a property of its own or embedded in a JSON-encoded property value.
pub fn default_instance_type(template: &RegistryModel) -> Option<String> {
    if let Some(value) = template.properties.get("DefaultInstanceType") {
        return Some(value.clone());
    }
    const NEEDLE: &str = "\"DefaultInstanceType\": \"";
    template.properties.values().find_map(|value| {
        let rest = &value[value.find(NEEDLE)? + NEEDLE.len()..];
        rest.split('"').next().map(str::to_string)
    })
}

/// SKU template name for `sku_type`: the entry of `skuBasedEngineIds`
/// containing the type, path segment 5 (`azureml://registries/<r>/models/<name>/...`).
pub fn sku_template_name(model: &RegistryModel, sku_type: &str) -> Option<String> {
    let engines = model.properties.get("skuBasedEngineIds")?;
    let entry = engines.split(',').map(str::trim).find(|e| e.contains(sku_type))?;
    entry.split('/').nth(5).map(str::to_string)
}

/// Instance type to deploy on. An override for the model wins; otherwise the
/// SKU template named by the model's properties supplies the default.
pub fn resolve_instance_type<F>(
    model: &RegistryModel,
    sku_type: &str,
    overrides: Option<&SkuOverrides>,
    lookup_template: F,
) -> Result<String>
where
    F: FnOnce(&str) -> Result<RegistryModel>,
{
    if let Some(sku) = overrides.and_then(|o| o.get(&model.name)) {
        info!(model = %model.name, instance_type = %sku.sku, "using sku override");
        return Ok(sku.sku.clone());
    }

    let template_name = sku_template_name(model, sku_type)
        .ok_or_else(|| anyhow!("could not find sku template for {sku_type} on model {}", model.name))?;
    info!(template = %template_name, "resolved sku template");
    let template = lookup_template(&template_name)?;
    let instance_type = default_instance_type(&template)
        .ok_or_else(|| anyhow!("sku template {template_name} has no DefaultInstanceType"))?;
    info!(%instance_type, "resolved instance type");
    Ok(instance_type)
}

/// Endpoint names must be unique per region, hence the timestamp.
pub fn endpoint_name(unix_ts: i64) -> String {
    format!("hf-ep-{unix_ts}")
}

#[derive(Debug, Serialize)]
pub struct DeploymentSpec {
    #[serde(rename = "$schema")]
    pub schema: &'static str,
    pub name: String,
    pub endpoint_name: String,
    pub model: String,
    pub instance_type: String,
    pub instance_count: u32,
}

impl DeploymentSpec {
    pub fn new(endpoint: &str, model_asset: String, instance_type: String, instance_count: u32) -> Self {
        Self {
            schema: "https://azuremlschemas.azureedge.net/latest/managedOnlineDeployment.schema.json",
            name: DEPLOYMENT_NAME.to_string(),
            endpoint_name: endpoint.to_string(),
            model: model_asset,
            instance_type,
            instance_count,
        }
    }
}

/// Markdown block appended to the job summary after a sample request.
pub fn sample_summary(input: &str, output: &str) -> String {
    format!("#### Sample input\n```json\n{}\n```\n#### Sample output\n```json\n{}\n```\n", input.trim(), output.trim())
}

pub(crate) fn append_file(path: &Path, text: &str) -> Result<()> {
    let mut fh = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    fh.write_all(text.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}

fn failure_output(err: &anyhow::Error) -> String {
    err.downcast_ref::<AzFailure>()
        .map(|f| f.output.clone())
        .unwrap_or_else(|| format!("{err:#}"))
}

/// Write the model after `current` as `NEXT_MODEL` step output. An empty
/// value means the queue is finished.
pub fn set_next_model(
    queue: &QueueFile,
    current: &str,
    keep_looping: bool,
    github_output: Option<&Path>,
) -> Result<Option<String>> {
    let next = queue.next_model(current, keep_looping)?.map(str::to_string);
    if next.is_none() {
        annotate(Annotation::Warning, "finishing the queue");
    }
    let value = next.as_deref().unwrap_or("");
    println!("NEXT_MODEL={value}");
    if let Some(path) = github_output {
        write_step_output(path, "NEXT_MODEL", value)?;
    }
    Ok(next)
}

pub struct Deployer<'a> {
    az: &'a Az,
    config: &'a DeployConfig,
    scope: WorkspaceScope,
    patterns: Vec<ErrorPattern>,
}

impl<'a> Deployer<'a> {
    pub fn new(az: &'a Az, config: &'a DeployConfig, queue: &QueueFile) -> Self {
        Self {
            az,
            config,
            scope: queue.scope(),
            patterns: load_error_patterns(&config.errors_file),
        }
    }

    fn report(&self, text: &str) -> Vec<Diagnostic> {
        let found = diagnose(text, &self.patterns);
        for d in &found {
            annotate(Annotation::Error, &format!("{}: {}", d.category, d.line));
        }
        found
    }

    fn dump_logs(&self, endpoint: &str) -> Vec<Diagnostic> {
        match self.az.deployment_logs(&self.scope, endpoint, DEPLOYMENT_NAME) {
            Ok(logs) => {
                println!("Deployment logs:\n\n{logs}");
                self.report(&logs)
            }
            Err(e) => {
                warn!(endpoint, err = %e, "could not fetch deployment logs");
                Vec::new()
            }
        }
    }

    fn teardown(&self, endpoint: &str) {
        if let Err(e) = self.az.delete_online_endpoint(&self.scope, endpoint) {
            annotate(Annotation::Warning, &format!("could not delete endpoint {endpoint}: {e}"));
        }
    }

    /// Create the online endpoint. A failed create may still leave a
    /// half-provisioned endpoint behind, so it is deleted before returning.
    pub fn create_endpoint(&self, endpoint: &str) -> Result<()> {
        if let Err(e) = self.az.create_online_endpoint(&self.scope, endpoint) {
            annotate(Annotation::Error, "could not create endpoint");
            self.report(&failure_output(&e));
            self.teardown(endpoint);
            return Err(e.context(format!("failed to create endpoint {endpoint}")));
        }
        Ok(())
    }

    /// Create the deployment on an existing endpoint with all traffic routed to it.
    pub fn deploy(&self, endpoint: &str, spec: &DeploymentSpec) -> Result<()> {
        let spec_file = tempfile::Builder::new()
            .prefix("deployment-")
            .suffix(".yml")
            .tempfile()
            .context("failed to create deployment spec file")?;
        let body = serde_yaml::to_string(spec).context("failed to serialize deployment spec")?;
        fs::write(spec_file.path(), body).context("failed to write deployment spec")?;

        info!(endpoint, instance_type = %spec.instance_type, "creating deployment");
        self.az
            .create_online_deployment(&self.scope, spec_file.path())
            .inspect_err(|_| annotate(Annotation::Error, "could not create deployment"))
            .with_context(|| format!("failed to create deployment on {endpoint}"))
    }

    /// Score the task's sample request. A missing sample file or a failed
    /// invocation skips scoring with an annotation.
    pub fn sample_inference(&self, endpoint: &str, registry: &str, model: &RegistryModel) -> Result<Option<String>> {
        let Some(task) = model.task() else {
            annotate(Annotation::Warning, &format!("model {} has no task tag; skipping sample scoring", model.name));
            return Ok(None);
        };
        let sample = self.config.sample_dir.join(registry).join(format!("{task}.json"));
        let input = match fs::read_to_string(&sample) {
            Ok(input) => input,
            Err(e) => {
                annotate(
                    Annotation::Warning,
                    &format!("could not find scoring file {}; finishing without sample scoring: {e}", sample.display()),
                );
                return Ok(None);
            }
        };

        let response = match self.az.invoke_endpoint(&self.scope, endpoint, DEPLOYMENT_NAME, &sample) {
            Ok(response) => response,
            Err(e) => {
                annotate(Annotation::Error, &format!("could not invoke endpoint {endpoint}"));
                self.report(&failure_output(&e));
                return Ok(None);
            }
        };

        let output = serde_json::from_str::<serde_json::Value>(&response)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| response.trim().to_string());
        println!("response:\n\n{output}");
        if let Some(path) = &self.config.step_summary {
            append_file(path, &sample_summary(&input, &output))?;
        }
        Ok(Some(output))
    }

    /// Fetch logs, report matches, then delete the endpoint.
    pub fn finish(&self, endpoint: &str) -> Vec<Diagnostic> {
        let found = self.dump_logs(endpoint);
        self.teardown(endpoint);
        found
    }

    /// Endpoint lifecycle for one model. Once the endpoint exists it is torn
    /// down on every path, and a failure carries the matched error categories.
    pub fn run(
        &self,
        endpoint: &str,
        spec: &DeploymentSpec,
        registry: &str,
        model: &RegistryModel,
    ) -> Result<Option<String>> {
        self.create_endpoint(endpoint)?;

        let result = self
            .deploy(endpoint, spec)
            .and_then(|()| self.sample_inference(endpoint, registry, model));
        let mut found = match &result {
            Err(e) => self.report(&failure_output(e)),
            Ok(_) => Vec::new(),
        };
        found.extend(self.finish(endpoint));

        match result {
            Err(e) if !found.is_empty() => {
                let mut categories: Vec<&str> = found.iter().map(|d| d.category.as_str()).collect();
                categories.dedup();
                Err(e.context(format!("matched error categories: {}", categories.join(", "))))
            }
            other => other,
        }
    }
}

/// Full test job for one model.
pub fn run_deploy(config: &DeployConfig, az: &Az) -> Result<Option<String>> {
    config.validate()?;
    let queue = read_queue_file(&config.queue_dir, &config.test_set, &config.queue)?;

    if config.trigger_next_model {
        set_next_model(&queue, &config.model, config.keep_looping, config.github_output.as_deref())?;
    }
    let overrides = load_sku_overrides(&config.sku_override_dir, &config.test_set);

    info!(
        subscription = %queue.subscription,
        resource_group = %queue.resource_group,
        workspace = %queue.workspace,
        model = %config.model,
        sku_type = %config.sku_type,
        registry = %queue.registry,
        queue = %config.queue,
        test_set = %config.test_set,
        "starting deployment test"
    );
    az.ensure_available()?;

    let registry = RegistrySource::new(az, queue.registry.clone());
    let latest = registry.latest(&config.model)?;
    let instance_type = resolve_instance_type(&latest, &config.sku_type, overrides.as_ref(), |name| {
        registry.latest(name)
    })?;

    let endpoint = endpoint_name(chrono::Utc::now().timestamp());
    info!(%endpoint, "online endpoint name");
    let spec = DeploymentSpec::new(
        &endpoint,
        latest.asset_id(registry.registry()),
        instance_type,
        config.instance_count,
    );

    Deployer::new(az, config, &queue).run(&endpoint, &spec, &queue.registry, &latest)
}
