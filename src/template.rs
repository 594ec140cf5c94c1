//! Workflow template rendering.
//!
//! Templates are plain text with `<token>` placeholders. Rendering replaces
//! every known token literally and then refuses output that still carries a
//! placeholder, so a template/substitution drift fails loudly instead of
//! shipping a half-filled workflow.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::TemplateError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[A-Za-z][A-Za-z0-9_-]*>").expect("static regex"));

/// Token name (without angle brackets) to replacement value, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    values: IndexMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: &str, value: impl Into<String>) -> Self {
        self.insert(token, value);
        self
    }

    fn insert(&mut self, token: &str, value: impl Into<String>) {
        self.values
            .insert(token.trim_matches(|c| c == '<' || c == '>').to_string(), value.into());
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    source: Option<PathBuf>,
    body: String,
}

impl Template {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(TemplateError::NotFound(path.to_path_buf()).into());
        }
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read template {}", path.display()))?;
        let template = Self {
            source: Some(path.to_path_buf()),
            body,
        };
        debug!(path = %path.display(), placeholders = ?template.placeholders(), "loaded template");
        Ok(template)
    }

    pub fn from_text(body: impl Into<String>) -> Self {
        Self {
            source: None,
            body: body.into(),
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Source path for messages, or `<inline>` for text templates.
    pub fn describe(&self) -> String {
        self.source()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string())
    }

    /// Placeholder tokens present in the template, in order of first appearance.
    pub fn placeholders(&self) -> Vec<String> {
        find_placeholders(&self.body)
    }

    /// Replace each `<token>` with its value, then verify none remain.
    pub fn render(&self, subs: &Substitutions) -> Result<String, TemplateError> {
        let mut out = self.body.clone();
        for (token, value) in &subs.values {
            out = out.replace(&format!("<{token}>"), value);
        }
        let leftover = find_placeholders(&out);
        if !leftover.is_empty() {
            return Err(TemplateError::UnresolvedPlaceholders(leftover));
        }
        Ok(out)
    }
}

pub fn find_placeholders(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in PLACEHOLDER.find_iter(text) {
        if !found.iter().any(|f| f == m.as_str()) {
            found.push(m.as_str().to_string());
        }
    }
    found
}

/// Warn when rendered output is not a YAML document; the CI runner would
/// reject it later with a less useful message.
pub fn check_yaml(path: &Path, content: &str) {
    if let Err(e) = serde_yaml::from_str::<serde_yaml::Value>(content) {
        warn!(path = %path.display(), err = %e, "rendered workflow is not valid YAML");
    }
}

/// Overwrite `path` with `content`, going through a temp file in the same
/// directory so readers never see a partial file.
pub fn write_rendered(path: &Path, content: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to move rendered file into {}", path.display()))?;
    Ok(())
}
