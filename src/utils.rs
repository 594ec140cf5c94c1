use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

static SPECIAL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\-_]").expect("static regex"));

/// Model ids such as `org/model` become `org-model` for file and resource names.
pub fn sanitize_model_name(model: &str) -> String {
    model.replace('/', "-")
}

/// Drop every character outside `[A-Za-z0-9_-]`.
pub fn strip_special_characters(value: &str) -> String {
    SPECIAL_CHARS.replace_all(value, "").into_owned()
}

/// `DDMonYYYY-HHMMSS`, the stamp used for run logs.
pub fn log_timestamp() -> String {
    Local::now().format("%d%b%Y-%H%M%S").to_string()
}

/// Write `value` as pretty JSON to `<log_dir>/<category>/<prefix><timestamp>.json`.
pub fn dump_json_log<T: Serialize + ?Sized>(
    log_dir: &Path,
    category: &str,
    prefix: &str,
    value: &T,
) -> Result<PathBuf> {
    let dir = log_dir.join(category);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log dir {}", dir.display()))?;
    let path = dir.join(format!("{prefix}{}.json", log_timestamp()));
    let body = serde_json::to_string_pretty(value).context("failed to serialize log record")?;
    fs::write(&path, body).with_context(|| format!("failed to write log {}", path.display()))?;
    debug!(path = %path.display(), "wrote run log");
    Ok(path)
}

/// GitHub Actions workflow-command severity.
#[derive(Debug, Clone, Copy)]
pub enum Annotation {
    Error,
    Warning,
    Notice,
}

/// Print a workflow command (`::error::msg`) so the runner surfaces it in the job UI.
pub fn annotate(level: Annotation, message: &str) {
    let tag = match level {
        Annotation::Error => "error",
        Annotation::Warning => "warning",
        Annotation::Notice => "notice",
    };
    println!("::{tag}::{message}");
}

/// One line in the end-of-run summary.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub label: String,
    pub value: String,
}

impl SummaryRow {
    pub fn new(label: impl Into<String>, value: impl ToString) -> Self {
        Self {
            label: label.into(),
            value: value.to_string(),
        }
    }
}

pub fn print_summary(title: &str, rows: &[SummaryRow]) {
    let width = rows.iter().map(|r| r.label.len()).max().unwrap_or(0);
    println!();
    println!("{title}");
    println!("{}", "-".repeat(title.len().max(width + 12)));
    for row in rows {
        println!("  {:<width$}  {}", row.label, row.value, width = width);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_model_name("openai/whisper-large"), "openai-whisper-large");
        assert_eq!(sanitize_model_name("bert-base-cased"), "bert-base-cased");
    }

    #[test]
    fn strip_special_characters_keeps_name_chars() {
        assert_eq!(strip_special_characters("facebook/opt-1.3b"), "facebookopt-13b");
        assert_eq!(strip_special_characters("a_b-C9"), "a_b-C9");
    }

    #[test]
    fn dump_json_log_writes_under_category() {
        let dir = tempdir().unwrap();
        let path = dump_json_log(dir.path(), "assign_models_to_queues", "", &["m1", "m2"]).unwrap();
        assert!(path.starts_with(dir.path().join("assign_models_to_queues")));
        let body = fs::read_to_string(path).unwrap();
        let parsed: Vec<String> = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, ["m1", "m2"]);
    }
}
