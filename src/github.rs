//! GitHub Actions run history and token lookup.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::status::RunRecord;

pub const API_ROOT: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

/// Token from `GITHUB_TOKEN`/`GH_TOKEN`, falling back to `gh auth token`.
pub fn github_token() -> Result<String> {
    for var in ["GITHUB_TOKEN", "GH_TOKEN"] {
        if let Ok(token) = std::env::var(var)
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_string());
        }
    }

    warn!("no GitHub token in environment; falling back to `gh auth token`");
    let output = Command::new("gh")
        .args(["auth", "token"])
        .output()
        .context("failed to spawn gh; install the GitHub CLI or set GITHUB_TOKEN")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("`gh auth token` failed: {}", stderr.trim()));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(anyhow!("`gh auth token` returned an empty token; run `gh auth login`"));
    }
    Ok(token)
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    total_count: usize,
    workflow_runs: Vec<RunRecord>,
}

pub struct GitHubClient {
    client: reqwest::blocking::Client,
    api_root: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_root: impl Into<String>, token: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("model-ci/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            api_root: api_root.into(),
            token,
        })
    }

    pub fn runs_url(&self, repo: &str) -> String {
        format!("{}/repos/{repo}/actions/runs", self.api_root.trim_end_matches('/'))
    }

    /// Every workflow run of `repo`, newest first, following pagination.
    pub fn list_runs(&self, repo: &str) -> Result<Vec<RunRecord>> {
        let url = self.runs_url(repo);
        info!(%url, "fetching workflow runs");

        let mut runs = Vec::new();
        let mut page = 1usize;
        let mut total_pages: Option<usize> = None;
        while total_pages.is_none_or(|total| page <= total) {
            let body: RunsPage = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28")
                .query(&[("per_page", PER_PAGE), ("page", page)])
                .send()
                .with_context(|| format!("request for runs page {page} failed"))?
                .error_for_status()
                .with_context(|| format!("GitHub returned an error for runs page {page}"))?
                .json()
                .with_context(|| format!("failed to decode runs page {page}"))?;

            if total_pages.is_none() {
                total_pages = Some(body.total_count.div_ceil(PER_PAGE));
            }
            let fetched = body.workflow_runs.len();
            runs.extend(body.workflow_runs);
            info!(page, fetched, total = runs.len(), "fetched runs page");
            if fetched == 0 {
                break;
            }
            page += 1;
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_url_targets_repo() {
        let client = GitHubClient::new("https://api.github.com/", "t".to_string()).unwrap();
        assert_eq!(
            client.runs_url("org/models"),
            "https://api.github.com/repos/org/models/actions/runs"
        );
    }

    #[test]
    fn runs_page_decodes_api_body() {
        let raw = r#"{"total_count": 1, "workflow_runs": [
            {"id": 7, "name": "gpt2", "status": "completed", "conclusion": null,
             "created_at": "2023-05-18T21:18:07Z", "updated_at": "2023-05-18T21:20:07Z"}]}"#;
        let page: RunsPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.workflow_runs[0].conclusion, None);
    }
}
