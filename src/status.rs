//! Test status aggregation over CI run history and dashboard rendering.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use heck::ToTitleCase;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::sanitize_model_name;

/// One workflow run as reported by the CI runs API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn duration_minutes(&self) -> f64 {
        (self.updated_at - self.created_at).num_seconds() as f64 / 60.0
    }
}

pub fn load_runs_file(path: &Path) -> Result<Vec<RunRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read run history {}", path.display()))?;
    let runs: Vec<RunRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse run history {}", path.display()))?;
    info!(path = %path.display(), runs = runs.len(), "loaded run history");
    Ok(runs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
    NotTested,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [Outcome::Success, Outcome::Failure, Outcome::Unknown, Outcome::NotTested];

    pub fn key(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
            Outcome::NotTested => "not_tested",
        }
    }

    /// Section heading, e.g. "Not Tested".
    pub fn label(self) -> String {
        self.key().to_title_case()
    }

    fn of(run: &RunRecord) -> Outcome {
        if !run.is_completed() {
            return Outcome::NotTested;
        }
        match run.conclusion.as_deref() {
            Some("success") => Outcome::Success,
            Some("failure") => Outcome::Failure,
            _ => Outcome::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub outcome: Outcome,
    pub duration_minutes: f64,
    pub last_tested: Option<DateTime<Utc>>,
}

impl ModelStatus {
    fn not_tested() -> Self {
        Self {
            outcome: Outcome::NotTested,
            duration_minutes: 0.0,
            last_tested: None,
        }
    }

    fn from_run(run: &RunRecord) -> Self {
        let outcome = Outcome::of(run);
        if outcome == Outcome::NotTested {
            return Self::not_tested();
        }
        Self {
            outcome,
            duration_minutes: run.duration_minutes(),
            last_tested: Some(run.updated_at),
        }
    }
}

/// Newest run per workflow name, by `created_at` then `updated_at`.
pub fn latest_runs(runs: &[RunRecord]) -> HashMap<&str, &RunRecord> {
    let mut latest: HashMap<&str, &RunRecord> = HashMap::new();
    for run in runs {
        latest
            .entry(run.name.as_str())
            .and_modify(|current| {
                if (run.created_at, run.updated_at) > (current.created_at, current.updated_at) {
                    *current = run;
                }
            })
            .or_insert(run);
    }
    latest
}

/// Per-model status for `models`, in list order, plus the wall-clock span of
/// the runs that decided them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub models: IndexMap<String, ModelStatus>,
    pub clock_minutes: f64,
}

/// Classify every listed model by its newest run. Runs are matched on the
/// workflow name, which is `workflow_prefix` plus the sanitized model name.
pub fn calculate_test_status(runs: &[RunRecord], models: &[String], workflow_prefix: &str) -> StatusReport {
    let latest = latest_runs(runs);

    let mut per_model = IndexMap::with_capacity(models.len());
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut newest: Option<DateTime<Utc>> = None;
    for model in models {
        let workflow = format!("{workflow_prefix}{}", sanitize_model_name(model));
        let run = latest.get(workflow.as_str()).or_else(|| latest.get(model.as_str()));
        let status = match run {
            Some(run) => {
                if run.is_completed() {
                    earliest = Some(earliest.map_or(run.created_at, |t| t.min(run.created_at)));
                    newest = Some(newest.map_or(run.updated_at, |t| t.max(run.updated_at)));
                }
                ModelStatus::from_run(run)
            }
            None => ModelStatus::not_tested(),
        };
        debug!(model = %model, outcome = status.outcome.key(), "classified model");
        per_model.insert(model.clone(), status);
    }

    let clock_minutes = match (earliest, newest) {
        (Some(start), Some(end)) => (end - start).num_seconds() as f64 / 60.0,
        _ => 0.0,
    };
    StatusReport {
        models: per_model,
        clock_minutes,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub counts: IndexMap<Outcome, usize>,
    pub total_duration_minutes: f64,
    pub clock_minutes: f64,
}

impl StatusSummary {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn percent(&self, outcome: Outcome) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(outcome) as f64 * 100.0 / self.total as f64
    }
}

pub fn summarize_test_status(report: &StatusReport) -> StatusSummary {
    let mut counts: IndexMap<Outcome, usize> = Outcome::ALL.iter().map(|o| (*o, 0)).collect();
    let mut total_duration_minutes = 0.0;
    for status in report.models.values() {
        *counts.entry(status.outcome).or_default() += 1;
        if status.last_tested.is_some() {
            total_duration_minutes += status.duration_minutes;
        }
    }
    StatusSummary {
        total: report.models.len(),
        counts,
        total_duration_minutes,
        clock_minutes: report.clock_minutes,
    }
}

/// `125.5` minutes -> `2h 5m`.
pub fn format_duration(minutes: f64) -> String {
    let whole = minutes.max(0.0) as u64;
    format!("{}h {}m", whole / 60, whole % 60)
}

fn badge(repo: &str, workflow: &str, alt: &str) -> String {
    let url = format!("https://github.com/{repo}/actions/workflows/{workflow}.yml");
    format!("[![{alt}]({url}/badge.svg)]({url})")
}

/// Markdown dashboard: summary table followed by one section per outcome.
pub fn render_dashboard(report: &StatusReport, summary: &StatusSummary, repo: &str, workflow_prefix: &str) -> String {
    let mut out = String::new();
    out.push_str("### Summary\n\n");
    out.push_str("🚀Total|✅Success|❌Failure|❔Unknown|🧪Not Tested|🕰️Total Duration|⏱️Clock duration\n");
    out.push_str("-----|-------|-------|-------|----------|--------------|--------------\n");
    out.push_str(&format!(
        "{}|{}|{}|{}|{}|{}|{}\n",
        summary.total,
        summary.count(Outcome::Success),
        summary.count(Outcome::Failure),
        summary.count(Outcome::Unknown),
        summary.count(Outcome::NotTested),
        format_duration(summary.total_duration_minutes),
        format_duration(summary.clock_minutes),
    ));
    out.push_str(&format!(
        "{:.1}%|{:.1}%|{:.1}%|{:.1}%|{:.1}%||\n",
        100.0,
        summary.percent(Outcome::Success),
        summary.percent(Outcome::Failure),
        summary.percent(Outcome::Unknown),
        summary.percent(Outcome::NotTested),
    ));

    for outcome in Outcome::ALL {
        out.push_str(&format!("\n### {}\n\n", outcome.label()));
        out.push_str("|Model|Last tested at|\n|-----|--------------|\n");
        for (model, status) in report.models.iter().filter(|(_, s)| s.outcome == outcome) {
            let last_tested = status
                .last_tested
                .map(|t| t.format("%d %b %Y %H:%M:%S").to_string())
                .unwrap_or_else(|| "No status".to_string());
            let workflow = format!("{workflow_prefix}{}", sanitize_model_name(model));
            out.push_str(&format!("{model}|{}\n", badge(repo, &workflow, &last_tested)));
        }
    }
    out
}

/// Plain badge page: one row per model linking its workflow badge.
pub fn render_badge_page(models: &[String], repo: &str, workflow_prefix: &str) -> String {
    let mut out = format!("### Total models: {}\n|Model|Status|\n|-----|------|\n", models.len());
    for model in models {
        let workflow = format!("{workflow_prefix}{}", sanitize_model_name(model));
        out.push_str(&format!("{model}|{}\n", badge(repo, &workflow, model)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(name: &str, conclusion: Option<&str>, created: &str, updated: &str) -> RunRecord {
        RunRecord {
            name: name.to_string(),
            status: (if conclusion.is_some() { "completed" } else { "in_progress" }).to_string(),
            conclusion: conclusion.map(str::to_string),
            created_at: created.parse().unwrap(),
            updated_at: updated.parse().unwrap(),
        }
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn newest_run_wins_regardless_of_order() {
        let runs = vec![
            run("gpt2", Some("success"), "2023-05-18T10:00:00Z", "2023-05-18T10:20:00Z"),
            run("gpt2", Some("failure"), "2023-05-19T10:00:00Z", "2023-05-19T10:30:00Z"),
        ];
        let report = calculate_test_status(&runs, &models(&["gpt2"]), "");
        assert_eq!(report.models.len(), 1);
        assert_eq!(report.models["gpt2"].outcome, Outcome::Failure);

        let mut reversed = runs.clone();
        reversed.reverse();
        let report = calculate_test_status(&reversed, &models(&["gpt2"]), "");
        assert_eq!(report.models["gpt2"].outcome, Outcome::Failure);
        assert_eq!(report.models["gpt2"].duration_minutes, 30.0);
    }

    #[test]
    fn absent_and_running_models_are_not_tested() {
        let runs = vec![run("bert", None, "2023-05-18T10:00:00Z", "2023-05-18T10:05:00Z")];
        let report = calculate_test_status(&runs, &models(&["bert", "t5"]), "");
        assert_eq!(report.models["bert"].outcome, Outcome::NotTested);
        assert_eq!(report.models["t5"].outcome, Outcome::NotTested);
        assert_eq!(report.clock_minutes, 0.0);
    }

    #[test]
    fn cancelled_run_is_unknown() {
        let runs = vec![run("t5", Some("cancelled"), "2023-05-18T10:00:00Z", "2023-05-18T10:05:00Z")];
        let report = calculate_test_status(&runs, &models(&["t5"]), "");
        assert_eq!(report.models["t5"].outcome, Outcome::Unknown);
    }

    #[test]
    fn prefixed_sanitized_workflow_names_match() {
        let runs = vec![run(
            "curated-openai-whisper-tiny",
            Some("success"),
            "2023-05-18T10:00:00Z",
            "2023-05-18T10:05:00Z",
        )];
        let report = calculate_test_status(&runs, &models(&["openai/whisper-tiny"]), "curated-");
        assert_eq!(report.models["openai/whisper-tiny"].outcome, Outcome::Success);
    }

    #[test]
    fn ten_model_percentages_sum_to_hundred() {
        let mut runs = Vec::new();
        let mut names = Vec::new();
        for i in 0..10 {
            let name = format!("m{i}");
            let conclusion = match i {
                0..=5 => Some("success"),
                6..=8 => Some("failure"),
                _ => None,
            };
            if conclusion.is_some() {
                runs.push(run(&name, conclusion, "2023-05-18T10:00:00Z", "2023-05-18T11:00:00Z"));
            }
            names.push(name);
        }
        let summary = summarize_test_status(&calculate_test_status(&runs, &names, ""));
        assert_eq!(summary.total, 10);
        assert_eq!(summary.count(Outcome::Success), 6);
        assert_eq!(summary.count(Outcome::Failure), 3);
        assert_eq!(summary.count(Outcome::NotTested), 1);
        let sum: f64 = Outcome::ALL.iter().map(|o| summary.percent(*o)).sum();
        assert!((sum - 100.0).abs() < 1e-9);
        assert_eq!(summary.total_duration_minutes, 540.0);
    }

    #[test]
    fn clock_spans_earliest_start_to_latest_finish() {
        let runs = vec![
            run("a", Some("success"), "2023-05-18T10:00:00Z", "2023-05-18T10:30:00Z"),
            run("b", Some("failure"), "2023-05-18T11:00:00Z", "2023-05-18T12:15:00Z"),
        ];
        let report = calculate_test_status(&runs, &models(&["a", "b"]), "");
        assert_eq!(report.clock_minutes, 135.0);
        assert_eq!(format_duration(report.clock_minutes), "2h 15m");
    }

    #[test]
    fn dashboard_lists_each_model_under_its_outcome() {
        let runs = vec![run("gpt2", Some("success"), "2023-05-18T10:00:00Z", "2023-05-18T10:05:00Z")];
        let report = calculate_test_status(&runs, &models(&["gpt2", "t5"]), "");
        let summary = summarize_test_status(&report);
        let md = render_dashboard(&report, &summary, "org/models", "");

        let success = md.find("### Success").unwrap();
        let not_tested = md.find("### Not Tested").unwrap();
        let gpt2 = md.find("gpt2|").unwrap();
        let t5 = md.find("t5|").unwrap();
        assert!(success < gpt2 && gpt2 < not_tested);
        assert!(not_tested < t5);
        assert!(md.contains("[![18 May 2023 10:05:00]"));
        assert!(md.contains("[![No status]"));
    }

    #[test]
    fn badge_page_counts_models() {
        let md = render_badge_page(&models(&["gpt2", "org/bert"]), "org/models", "");
        assert!(md.starts_with("### Total models: 2\n"));
        assert!(md.contains("org/bert|[![org/bert](https://github.com/org/models/actions/workflows/org-bert.yml/badge.svg)]"));
    }

    #[test]
    fn outcome_labels_are_title_case() {
        assert_eq!(Outcome::NotTested.label(), "Not Tested");
        assert_eq!(Outcome::Success.label(), "Success");
    }

    #[test]
    fn run_records_parse_api_shape() {
        let raw = r#"[{"id": 1, "name": "gpt2", "status": "completed", "conclusion": "success",
                       "created_at": "2023-05-18T21:18:07Z", "updated_at": "2023-05-18T21:40:07Z"}]"#;
        let runs: Vec<RunRecord> = serde_json::from_str(raw).unwrap();
        assert_eq!(runs[0].duration_minutes(), 22.0);
    }
}
