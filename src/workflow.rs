//! Catalog workflows: per-task inference, evaluation and finetuning notebook
//! workflows generated from a model catalog.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::RegistrySource;
use crate::template::{Substitutions, Template, check_yaml, write_rendered};
use crate::utils::sanitize_model_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceType {
    RealTime,
    Batch,
}

impl InferenceType {
    pub const ALL: [InferenceType; 2] = [InferenceType::RealTime, InferenceType::Batch];

    pub fn as_str(self) -> &'static str {
        match self {
            InferenceType::RealTime => "real-time",
            InferenceType::Batch => "batch",
        }
    }
}

/// (task, real-time notebook, batch notebook)
const INFERENCE_NOTEBOOKS: &[(&str, &str, &str)] = &[
    ("fill-mask", "fill-mask-online-endpoint.ipynb", "fill-mask-batch-endpoint.ipynb"),
    ("automatic-speech-recognition", "asr-online-endpoint", "asr-batch-endpoint"),
    ("question-answering", "question-answering-online-endpoint", "question-answering-batch-endpoint"),
    ("summarization", "summarization-online-endpoint", "summarization-batch-endpoint"),
    ("text-classification", "text-classification-online-endpoint", "entailment-contradiction-batch"),
    ("text-generation", "text-generation-online-endpoint", "text-generation-batch-endpoint"),
    ("token-classification", "token-classification-online-endpoint", "token-classification-batch-endpoint"),
    ("translation", "translation-online-endpoint", "translation-batch-endpoint"),
];

const EVALUATION_NOTEBOOKS: &[(&str, &str)] = &[
    ("fill-mask", "fill-mask.ipynb"),
    ("question-answering", "question-answering.ipynb"),
    ("summarization", "abstractive-and-extractive-summarization.ipynb"),
    ("text-classification", "entailment-contradiction.ipynb"),
    ("text-generation", "text-generation.ipynb"),
    ("token-classification", "news-articles-entity-recognition.ipynb"),
    ("translation", "translation-romanian-to-english.ipynb"),
];

const FINETUNE_NOTEBOOKS: &[(&str, &str)] = &[
    ("question-answering", "extractive-qa.ipynb"),
    ("summarization", "news-summary.ipynb"),
    ("text-classification", "emotion-detection.ipynb"),
    ("token-classification", "token-classification.ipynb"),
    ("translation", "translation.ipynb"),
];

pub fn inference_notebook(task: &str, kind: InferenceType) -> Option<&'static str> {
    INFERENCE_NOTEBOOKS
        .iter()
        .find(|(t, _, _)| *t == task)
        .map(|(_, realtime, batch)| match kind {
            InferenceType::RealTime => *realtime,
            InferenceType::Batch => *batch,
        })
}

pub fn evaluation_notebook(task: &str) -> Option<&'static str> {
    EVALUATION_NOTEBOOKS.iter().find(|(t, _)| *t == task).map(|(_, nb)| *nb)
}

pub fn finetune_notebook(task: &str) -> Option<&'static str> {
    FINETUNE_NOTEBOOKS.iter().find(|(t, _)| *t == task).map(|(_, nb)| *nb)
}

fn inference_file_name(kind: InferenceType, sanitized_model: &str) -> String {
    format!("{}-inference-{sanitized_model}_nb.yaml", kind.as_str())
}

/// One model's metadata as the generator needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub model_name: String,
    pub model_version: String,
    pub task: String,
    #[serde(default, alias = "finetuning-tasks")]
    pub finetuning_tasks: Vec<String>,
}

pub fn load_catalog(path: &Path) -> Result<Vec<CatalogEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse catalog {}", path.display()))?;
    info!(path = %path.display(), entries = entries.len(), "loaded model catalog");
    Ok(entries)
}

/// Build catalog entries from the registry. Models whose metadata cannot be
/// read are skipped with a warning.
pub fn catalog_from_registry(source: &RegistrySource<'_>, model_ids: &[String]) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for model_id in model_ids {
        match catalog_entry(source, model_id) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(model = %model_id, err = %e, "failed getting model metadata; skipping"),
        }
    }
    entries
}

fn catalog_entry(source: &RegistrySource<'_>, model_id: &str) -> Result<CatalogEntry> {
    let listed = source.latest(model_id)?;
    let version = listed
        .version
        .clone()
        .with_context(|| format!("model {model_id} has no version"))?;
    let latest = source.show(model_id, &version)?;
    let task = latest
        .task()
        .with_context(|| format!("model {model_id} has no task tag"))?
        .to_string();
    let finetuning_tasks = latest
        .properties
        .get("finetuning-tasks")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(CatalogEntry {
        model_name: model_id.to_string(),
        model_version: version,
        task,
        finetuning_tasks,
    })
}

/// Model ids from the entries of an asset directory (one sub-directory per model).
pub fn model_ids_from_dir(dir: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

#[derive(Debug, Clone)]
pub struct CatalogTemplates {
    pub inference: Template,
    pub evaluation: Template,
    pub finetune: Template,
}

impl CatalogTemplates {
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            inference: Template::load(&dir.join("inference_workflow.yaml"))?,
            evaluation: Template::load(&dir.join("evaluation_workflow.yaml"))?,
            finetune: Template::load(&dir.join("finetuning_workflow.yaml"))?,
        })
    }
}

/// Files generated for one catalog, plus the combinations that were skipped.
#[derive(Debug, Clone, Default)]
pub struct CatalogReport {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<String>,
}

pub struct CatalogGenerator<'a> {
    templates: &'a CatalogTemplates,
    output_dir: PathBuf,
    dry_run: bool,
}

impl<'a> CatalogGenerator<'a> {
    pub fn new(templates: &'a CatalogTemplates, output_dir: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            templates,
            output_dir: output_dir.into(),
            dry_run,
        }
    }

    pub fn generate(&self, entries: &[CatalogEntry]) -> Result<CatalogReport> {
        let mut report = CatalogReport::default();
        let mut evaluated_tasks: Vec<&str> = Vec::new();

        for entry in entries {
            self.inference(entry, &mut report)?;
            if !evaluated_tasks.contains(&entry.task.as_str()) {
                self.evaluation(&entry.task, &mut report)?;
                evaluated_tasks.push(&entry.task);
            }
            for fttask in &entry.finetuning_tasks {
                self.finetune(entry, fttask, &mut report)?;
            }
        }
        info!(
            written = report.written.len(),
            skipped = report.skipped.len(),
            dry_run = self.dry_run,
            "generated catalog workflows"
        );
        Ok(report)
    }

    fn inference(&self, entry: &CatalogEntry, report: &mut CatalogReport) -> Result<()> {
        let model = sanitize_model_name(&entry.model_name);
        for kind in InferenceType::ALL {
            let Some(notebook) = inference_notebook(&entry.task, kind) else {
                warn!(model = %entry.model_name, task = %entry.task, kind = kind.as_str(), "no inference notebook for task");
                report.skipped.push(format!("{}-inference-{model}", kind.as_str()));
                continue;
            };
            let subs = Substitutions::new()
                .with("inference-type", kind.as_str())
                .with("model_name", entry.model_name.as_str())
                .with("model_version", entry.model_version.as_str())
                .with("notebook", notebook)
                .with("task", entry.task.as_str());
            let file = inference_file_name(kind, &model);
            self.emit(&self.templates.inference, &subs, &file, report)?;
        }
        Ok(())
    }

    fn evaluation(&self, task: &str, report: &mut CatalogReport) -> Result<()> {
        let Some(notebook) = evaluation_notebook(task) else {
            warn!(task, "no evaluation notebook for task");
            report.skipped.push(format!("evaluation-{task}"));
            return Ok(());
        };
        let subs = Substitutions::new().with("notebook", notebook).with("task", task);
        self.emit(&self.templates.evaluation, &subs, &format!("evaluation-{task}_nb.yaml"), report)
    }

    fn finetune(&self, entry: &CatalogEntry, fttask: &str, report: &mut CatalogReport) -> Result<()> {
        let model = sanitize_model_name(&entry.model_name);
        let Some(notebook) = finetune_notebook(fttask) else {
            warn!(model = %entry.model_name, fttask, "no finetuning notebook for task");
            report.skipped.push(format!("finetuning-{fttask}-{model}"));
            return Ok(());
        };
        let subs = Substitutions::new()
            .with("model_name", entry.model_name.as_str())
            .with("model_version", entry.model_version.as_str())
            .with("notebook", notebook)
            .with("fttask", fttask);
        let file = format!("finetuning-{fttask}-{model}_nb.yaml");
        self.emit(&self.templates.finetune, &subs, &file, report)
    }

    fn emit(&self, template: &Template, subs: &Substitutions, file: &str, report: &mut CatalogReport) -> Result<()> {
        let path = self.output_dir.join(file);
        let content = template
            .render(subs)
            .with_context(|| format!("failed to render {file} from {}", template.describe()))?;
        if self.dry_run {
            info!(path = %path.display(), "dry-run: would write workflow");
        } else {
            check_yaml(&path, &content);
            write_rendered(&path, &content)?;
        }
        report.written.push(path);
        Ok(())
    }
}

/// Delete previously generated workflow files whose names start with `prefix`.
pub fn remove_existing_workflows(dir: &Path, prefix: &str) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix));
        if path.is_file() && matches {
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    info!(removed, prefix, dir = %dir.display(), "removed existing workflows");
    Ok(removed)
}

/// Markdown table of task, model and the badge of the model's generated
/// real-time inference workflow. Tasks without one get no badge.
pub fn render_catalog_readme(entries: &[CatalogEntry], repo: &str) -> String {
    let mut out = String::from("| Task | Model ID | Status |\n| --- | --- | --- |\n");
    for entry in entries {
        let name = sanitize_model_name(&entry.model_name);
        let status = match inference_notebook(&entry.task, InferenceType::RealTime) {
            Some(_) => {
                let file = inference_file_name(InferenceType::RealTime, &name);
                let workflow = format!("https://github.com/{repo}/actions/workflows/{file}");
                format!("[![{name} workflow]({workflow}/badge.svg)]({workflow})")
            }
            None => "no workflow".to_string(),
        };
        out.push_str(&format!("| {} | {} | {status} |\n", entry.task, entry.model_name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn templates() -> CatalogTemplates {
        CatalogTemplates {
            inference: Template::from_text(
                "name: <inference-type> <model_name>\nenv:\n  version: \"<model_version>\"\n  notebook: <notebook>\n  task: <task>\n",
            ),
            evaluation: Template::from_text("name: evaluation <task>\nenv:\n  notebook: <notebook>\n"),
            finetune: Template::from_text(
                "name: finetune <model_name>\nenv:\n  version: \"<model_version>\"\n  notebook: <notebook>\n  task: <fttask>\n",
            ),
        }
    }

    fn entry(model: &str, task: &str, ft: &[&str]) -> CatalogEntry {
        CatalogEntry {
            model_name: model.to_string(),
            model_version: "3".to_string(),
            task: task.to_string(),
            finetuning_tasks: ft.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn notebook_tables_cover_known_tasks() {
        assert_eq!(
            inference_notebook("text-classification", InferenceType::Batch),
            Some("entailment-contradiction-batch")
        );
        assert_eq!(evaluation_notebook("translation"), Some("translation-romanian-to-english.ipynb"));
        assert_eq!(finetune_notebook("fill-mask"), None);
    }

    #[test]
    fn generates_inference_evaluation_and_finetune_files() {
        let dir = tempdir().unwrap();
        let t = templates();
        let generator = CatalogGenerator::new(&t, dir.path(), false);
        let report = generator
            .generate(&[entry("bert-base-uncased", "fill-mask", &["question-answering", "unknown-task"])])
            .unwrap();

        let names: Vec<String> = report
            .written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "real-time-inference-bert-base-uncased_nb.yaml",
                "batch-inference-bert-base-uncased_nb.yaml",
                "evaluation-fill-mask_nb.yaml",
                "finetuning-question-answering-bert-base-uncased_nb.yaml",
            ]
        );
        assert_eq!(report.skipped, ["finetuning-unknown-task-bert-base-uncased"]);

        let realtime = fs::read_to_string(dir.path().join(&names[0])).unwrap();
        assert!(realtime.contains("notebook: fill-mask-online-endpoint.ipynb"));
        assert!(realtime.contains("version: \"3\""));
    }

    #[test]
    fn evaluation_written_once_per_task() {
        let dir = tempdir().unwrap();
        let t = templates();
        let report = CatalogGenerator::new(&t, dir.path(), true)
            .generate(&[entry("gpt2", "text-generation", &[]), entry("distilgpt2", "text-generation", &[])])
            .unwrap();
        let evals = report
            .written
            .iter()
            .filter(|p| p.to_string_lossy().contains("evaluation-"))
            .count();
        assert_eq!(evals, 1);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none(), "dry-run wrote files");
    }

    #[test]
    fn unknown_task_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let t = templates();
        let report = CatalogGenerator::new(&t, dir.path(), false)
            .generate(&[entry("stabilityai/sd", "text-to-image", &[])])
            .unwrap();
        assert!(report.written.is_empty());
        assert_eq!(report.skipped.len(), 3);
    }

    #[test]
    fn catalog_accepts_hyphenated_finetune_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(
            &path,
            r#"[{"model_name": "t5-small", "model_version": "2", "task": "translation", "finetuning-tasks": ["translation"]}]"#,
        )
        .unwrap();
        let entries = load_catalog(&path).unwrap();
        assert_eq!(entries[0].finetuning_tasks, ["translation"]);
    }

    #[test]
    fn remove_existing_only_touches_prefix() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("import-gpt2.yaml"), "").unwrap();
        fs::write(dir.path().join("smoke.yml"), "").unwrap();
        assert_eq!(remove_existing_workflows(dir.path(), "import-").unwrap(), 1);
        assert!(dir.path().join("smoke.yml").exists());
    }

    #[test]
    fn readme_links_sanitized_workflow_names() {
        let md = render_catalog_readme(
            &[
                entry("openai/whisper-tiny", "automatic-speech-recognition", &[]),
                entry("acme/vision", "image-segmentation", &[]),
            ],
            "org/repo",
        );
        assert!(md.starts_with("| Task | Model ID | Status |"));
        assert!(md.contains("actions/workflows/real-time-inference-openai-whisper-tiny_nb.yaml/badge.svg"));
        assert!(md.contains("| image-segmentation | acme/vision | no workflow |"));
        assert!(md.contains("| automatic-speech-recognition | openai/whisper-tiny |"));
    }
}
