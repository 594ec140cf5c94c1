//! Model source resolution: list files, the model registry and the hub API.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::az::Az;
use crate::utils::dump_json_log;

/// Container names in the registry that are SKU templates, not models.
pub const TEMPLATE_MODELS: [&str; 5] = [
    "transformers-cpu-small",
    "transformers-cpu-medium",
    "transformers-cpu-large",
    "transformers-cpu-extra-large",
    "transformers-gpu-medium",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceMode {
    /// Read model ids from a list file
    File,
    /// Enumerate model containers in a registry
    Registry,
    /// Query the model hub for the top models of a task
    Hub,
}

/// Where the model list for a run comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    File(PathBuf),
    Registry { name: String },
    Hub(HubQuery),
}

/// Read model ids from `path`. `.json` files hold an array of strings; any
/// other file is one id per line.
pub fn load_model_list_file(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model list at {}", path.display()))?;

    let models: Vec<String> = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw)
            .with_context(|| format!("model list {} is not a JSON array of strings", path.display()))?
    } else {
        raw.lines().map(str::to_string).collect()
    };

    let models = dedupe_models(
        models
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty()),
    );
    info!(path = %path.display(), count = models.len(), "loaded model list file");
    Ok(models)
}

/// Drop repeated ids, keeping the first occurrence so queue order is stable.
pub fn dedupe_models(models: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for model in models {
        if seen.insert(model.clone()) {
            unique.push(model);
        } else {
            warn!(model = %model, "model listed more than once; keeping the first entry");
        }
    }
    unique
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreationContext {
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// The subset of a registry model version this tool reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryModel {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub creation_context: CreationContext,
}

impl RegistryModel {
    pub fn task(&self) -> Option<&str> {
        self.tags.get("task").map(String::as_str)
    }

    /// Registry asset id used as the deployment's model reference.
    pub fn asset_id(&self, registry: &str) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "azureml://registries/{registry}/models/{}/versions/{}",
                self.name,
                self.version.as_deref().unwrap_or("1")
            ),
        }
    }
}

/// Newest version by creation time; versions without a timestamp fall back to
/// numeric version order.
pub fn latest_version(versions: &[RegistryModel]) -> Option<&RegistryModel> {
    versions.iter().max_by(|a, b| {
        a.creation_context
            .created_at
            .cmp(&b.creation_context.created_at)
            .then_with(|| numeric_version(a).cmp(&numeric_version(b)))
    })
}

fn numeric_version(model: &RegistryModel) -> u64 {
    model
        .version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Enumerates models in a registry through `az ml model list`.
pub struct RegistrySource<'a> {
    az: &'a Az,
    registry: String,
    exclude: Vec<String>,
}

impl<'a> RegistrySource<'a> {
    pub fn new(az: &'a Az, registry: impl Into<String>) -> Self {
        Self {
            az,
            registry: registry.into(),
            exclude: TEMPLATE_MODELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn versions(&self, name: &str) -> Result<Vec<RegistryModel>> {
        self.az.list_model_versions(&self.registry, name)
    }

    /// Full metadata of one version; listings may omit properties.
    pub fn show(&self, name: &str, version: &str) -> Result<RegistryModel> {
        self.az.show_model(&self.registry, name, version)
    }

    pub fn latest(&self, name: &str) -> Result<RegistryModel> {
        let versions = self.versions(name)?;
        let latest = latest_version(&versions)
            .ok_or_else(|| anyhow!("model {name} has no versions in registry {}", self.registry))?
            .clone();
        info!(
            model = name,
            version = latest.version.as_deref().unwrap_or("?"),
            "resolved latest model version"
        );
        Ok(latest)
    }

    /// List every non-template container that still has at least one
    /// version. Listing can return archived containers, which have none.
    pub fn list_models(&self, log_dir: Option<&Path>) -> Result<Vec<String>> {
        info!(registry = %self.registry, "listing model containers");
        let containers: Vec<RegistryModel> = self.az.list_registry_models(&self.registry)?;

        let mut models = Vec::new();
        let mut details = HashMap::new();
        for container in containers {
            if self.exclude.contains(&container.name) {
                debug!(model = %container.name, "skipping sku template container");
                continue;
            }
            let versions = self.versions(&container.name)?;
            let Some(latest) = latest_version(&versions) else {
                debug!(model = %container.name, "skipping archived container");
                continue;
            };
            details.insert(container.name.clone(), latest.clone());
            models.push(container.name);
        }
        info!(registry = %self.registry, count = models.len(), "found models in registry");

        if let Some(log_dir) = log_dir {
            dump_json_log(log_dir, "get_model_containers", "list_", &models)?;
            dump_json_log(log_dir, "get_model_containers", "details_", &details)?;
        }
        Ok(models)
    }
}

pub const HUB_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Clone)]
pub struct HubQuery {
    pub task: String,
    pub sort: String,
    pub limit: usize,
}

/// The hub reports both `id` and the legacy `modelId`; either may be absent.
#[derive(Debug, Deserialize)]
struct HubModel {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "modelId")]
    model_id: Option<String>,
}

/// Read-only client for the hub's model search API.
pub struct HubClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    token: Option<String>,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("model-ci/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build hub HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    fn base(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    /// Search URL with every query value percent-encoded.
    pub fn search_url(&self, query: &HubQuery) -> Result<reqwest::Url> {
        let limit = query.limit.to_string();
        reqwest::Url::parse_with_params(
            &format!("{}/api/models", self.base()),
            [
                ("pipeline_tag", query.task.as_str()),
                ("sort", query.sort.as_str()),
                ("direction", "-1"),
                ("limit", limit.as_str()),
            ],
        )
        .with_context(|| format!("invalid hub endpoint {}", self.endpoint))
    }

    pub fn model_url(&self, model_id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&format!("{}/api/models", self.base()))
            .with_context(|| format!("invalid hub endpoint {}", self.endpoint))?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("hub endpoint {} cannot take a path", self.endpoint))?
            .extend(model_id.split('/'));
        Ok(url)
    }

    fn get_json<T: DeserializeOwned>(&self, url: reqwest::Url) -> Result<T> {
        let mut req = self.client.get(url.clone());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.send()
            .with_context(|| format!("hub request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("hub returned an error for {url}"))?
            .json()
            .with_context(|| format!("failed to decode hub response from {url}"))
    }

    /// Top model ids for a task, in the order the hub ranks them.
    pub fn top_models(&self, query: &HubQuery) -> Result<Vec<String>> {
        info!(task = %query.task, sort = %query.sort, limit = query.limit, "querying model hub");
        let models: Vec<HubModel> = self.get_json(self.search_url(query)?)?;

        if models.is_empty() {
            warn!(task = %query.task, "hub returned no models");
        }
        Ok(models.into_iter().filter_map(|m| m.id.or(m.model_id)).collect())
    }

    /// The hub's pipeline tag for `model_id`, used as the import task.
    pub fn model_task(&self, model_id: &str) -> Result<String> {
        let info: HubModelInfo = self.get_json(self.model_url(model_id)?)?;
        info.pipeline_tag
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("hub has no pipeline tag for {model_id}; pass --task"))
    }
}

#[derive(Debug, Deserialize)]
struct HubModelInfo {
    #[serde(default)]
    pipeline_tag: Option<String>,
}

/// Resolve the ordered model list for a run.
pub fn resolve_models(source: &ModelSource, az: &Az, log_dir: Option<&Path>) -> Result<Vec<String>> {
    let models = match source {
        ModelSource::File(path) => load_model_list_file(path)?,
        ModelSource::Registry { name } => RegistrySource::new(az, name.clone()).list_models(log_dir)?,
        ModelSource::Hub(query) => {
            let token = std::env::var("HF_TOKEN").ok();
            HubClient::new(HUB_ENDPOINT, token)?.top_models(query)?
        }
    };
    Ok(dedupe_models(models))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn version(name: &str, version: &str, created: Option<&str>) -> RegistryModel {
        RegistryModel {
            name: name.to_string(),
            version: Some(version.to_string()),
            id: None,
            tags: HashMap::new(),
            properties: HashMap::new(),
            creation_context: CreationContext {
                created_at: created.map(|c| c.parse().unwrap()),
            },
        }
    }

    #[test]
    fn text_list_skips_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rerun.txt");
        std::fs::write(&path, "bert-base-cased\n\n  gpt2  \nopenai/whisper-tiny\n").unwrap();
        let models = load_model_list_file(&path).unwrap();
        assert_eq!(models, ["bert-base-cased", "gpt2", "openai/whisper-tiny"]);
    }

    #[test]
    fn json_list_is_parsed_as_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models.json");
        std::fs::write(&path, r#"["distilbert-base-uncased", "t5-small"]"#).unwrap();
        let models = load_model_list_file(&path).unwrap();
        assert_eq!(models, ["distilbert-base-uncased", "t5-small"]);
    }

    #[test]
    fn json_list_with_wrong_shape_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models.json");
        std::fs::write(&path, r#"{"model": "gpt2"}"#).unwrap();
        assert!(load_model_list_file(&path).is_err());
    }

    #[test]
    fn latest_version_prefers_creation_time() {
        let versions = vec![
            version("gpt2", "3", Some("2023-05-01T10:00:00Z")),
            version("gpt2", "2", Some("2023-06-01T10:00:00Z")),
            version("gpt2", "1", Some("2023-04-01T10:00:00Z")),
        ];
        assert_eq!(latest_version(&versions).unwrap().version.as_deref(), Some("2"));
    }

    #[test]
    fn latest_version_falls_back_to_numeric_order() {
        let versions = vec![
            version("gpt2", "9", None),
            version("gpt2", "10", None),
        ];
        assert_eq!(latest_version(&versions).unwrap().version.as_deref(), Some("10"));
        assert!(latest_version(&[]).is_none());
    }

    #[test]
    fn registry_model_reads_cli_json() {
        let raw = r#"{
            "name": "bert-base-cased",
            "version": "4",
            "id": "azureml://registries/HuggingFace/models/bert-base-cased/versions/4",
            "tags": {"task": "fill-mask"},
            "properties": {"skuBasedEngineIds": "a/b"},
            "creation_context": {"created_at": "2023-05-17T23:10:31Z"}
        }"#;
        let model: RegistryModel = serde_json::from_str(raw).unwrap();
        assert_eq!(model.task(), Some("fill-mask"));
        assert!(model.asset_id("HuggingFace").ends_with("/versions/4"));
    }

    #[test]
    fn hub_search_url_encodes_query() {
        let client = HubClient::new("https://hub.example/", None).unwrap();
        let url = client
            .search_url(&HubQuery {
                task: "fill-mask".to_string(),
                sort: "downloads".to_string(),
                limit: 10,
            })
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://hub.example/api/models?pipeline_tag=fill-mask&sort=downloads&direction=-1&limit=10"
        );

        let url = client
            .search_url(&HubQuery {
                task: "text generation&x=1".to_string(),
                sort: "likes#top".to_string(),
                limit: 5,
            })
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("pipeline_tag".to_string(), "text generation&x=1".to_string()));
        assert_eq!(pairs[1], ("sort".to_string(), "likes#top".to_string()));
        assert_eq!(pairs.len(), 4);
        assert!(url.fragment().is_none());
    }

    #[test]
    fn hub_model_url_keeps_org_segment() {
        let client = HubClient::new("https://hub.example", None).unwrap();
        let url = client.model_url("openai/whisper-tiny").unwrap();
        assert_eq!(url.as_str(), "https://hub.example/api/models/openai/whisper-tiny");
    }

    #[test]
    fn repeated_ids_keep_first_occurrence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rerun.txt");
        std::fs::write(&path, "gpt2\nbert\ngpt2\n bert \nt5\n").unwrap();
        assert_eq!(load_model_list_file(&path).unwrap(), ["gpt2", "bert", "t5"]);
    }
}
