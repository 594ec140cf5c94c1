//! Thin driver for the `az` CLI (`ml` extension).
//!
//! The registry and the online-endpoint service are only reached through
//! this process boundary; every call captures stdout/stderr and turns a
//! non-zero exit into an error that carries the CLI output.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

/// Failed `az` invocation; `output` holds stderr followed by stdout.
#[derive(Debug, Error)]
#[error("`{command}` failed:\n{output}")]
pub struct AzFailure {
    pub command: String,
    pub output: String,
}

/// Scope arguments appended to workspace-level commands.
#[derive(Debug, Clone)]
pub struct WorkspaceScope {
    pub subscription: String,
    pub resource_group: String,
    pub workspace: String,
}

impl WorkspaceScope {
    /// Arguments for `az ml workspace` commands, where the workspace is `--name`.
    fn workspace_args<'a>(&'a self, command: [&'a str; 3]) -> Vec<&'a str> {
        let mut args = command.to_vec();
        args.extend([
            "--name",
            &self.workspace,
            "--resource-group",
            &self.resource_group,
            "--subscription",
            &self.subscription,
        ]);
        args
    }

    fn args(&self) -> [&str; 6] {
        [
            "--subscription",
            &self.subscription,
            "--resource-group",
            &self.resource_group,
            "--workspace-name",
            &self.workspace,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct Az {
    program: String,
}

impl Default for Az {
    fn default() -> Self {
        Self::new("az")
    }
}

impl Az {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Confirm the CLI is installed before a long run starts.
    pub fn ensure_available(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .map_err(|e| {
                anyhow!(
                    "{} not found: install the Azure CLI with the ml extension and run `az login` (error: {e})",
                    self.program
                )
            })?;
        if !output.status.success() {
            return Err(anyhow!("`{} --version` exited with {}", self.program, output.status));
        }
        Ok(())
    }

    /// Run `az <args>` and return stdout.
    pub fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let rendered = format!(
            "{} {}",
            self.program,
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!(command = %rendered, "running az");

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("failed to spawn {}; ensure the Azure CLI is on PATH", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(AzFailure {
                command: rendered,
                output: format!("{}\n{}", stderr.trim(), stdout.trim()),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run with `-o json` and deserialize stdout.
    pub fn run_json<T, I, S>(&self, args: I) -> Result<T>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args: Vec<std::ffi::OsString> =
            args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        args.push("-o".into());
        args.push("json".into());
        let stdout = self.run(&args)?;
        serde_json::from_str(&stdout).context("failed to parse az JSON output")
    }

    pub fn list_registry_models<T: DeserializeOwned>(&self, registry: &str) -> Result<T> {
        self.run_json(["ml", "model", "list", "--registry-name", registry])
    }

    pub fn list_model_versions<T: DeserializeOwned>(&self, registry: &str, name: &str) -> Result<T> {
        self.run_json(["ml", "model", "list", "--name", name, "--registry-name", registry])
    }

    pub fn show_model<T: DeserializeOwned>(&self, registry: &str, name: &str, version: &str) -> Result<T> {
        self.run_json([
            "ml",
            "model",
            "show",
            "--name",
            name,
            "--version",
            version,
            "--registry-name",
            registry,
        ])
    }

    pub fn list_workspace_model_versions<T: DeserializeOwned>(&self, scope: &WorkspaceScope, name: &str) -> Result<T> {
        let mut args = vec!["ml", "model", "list", "--name", name];
        args.extend(scope.args());
        self.run_json(args)
    }

    pub fn show_workspace_model<T: DeserializeOwned>(
        &self,
        scope: &WorkspaceScope,
        name: &str,
        version: &str,
    ) -> Result<T> {
        let mut args = vec!["ml", "model", "show", "--name", name, "--version", version];
        args.extend(scope.args());
        self.run_json(args)
    }

    /// Submit a job under a fixed name and block while its logs stream.
    pub fn create_job_streaming(&self, scope: &WorkspaceScope, job_file: &Path, name: &str) -> Result<String> {
        info!(job = name, workspace = %scope.workspace, "submitting job");
        let file = job_file.to_string_lossy();
        let mut args = vec!["ml", "job", "create", "--file", file.as_ref(), "--name", name, "--stream"];
        args.extend(scope.args());
        self.run(args)
    }

    pub fn show_job<T: DeserializeOwned>(&self, scope: &WorkspaceScope, name: &str) -> Result<T> {
        let mut args = vec!["ml", "job", "show", "--name", name];
        args.extend(scope.args());
        self.run_json(args)
    }

    pub fn download_job_output(
        &self,
        scope: &WorkspaceScope,
        name: &str,
        output_name: &str,
        download_path: &Path,
    ) -> Result<()> {
        let path = download_path.to_string_lossy();
        let mut args = vec![
            "ml",
            "job",
            "download",
            "--name",
            name,
            "--output-name",
            output_name,
            "--download-path",
            path.as_ref(),
        ];
        args.extend(scope.args());
        self.run(args).map(|_| ())
    }

    /// `az ml workspace show`. A CLI failure means the workspace is absent;
    /// a spawn failure is still an error.
    pub fn workspace_exists(&self, scope: &WorkspaceScope) -> Result<bool> {
        match self.run(scope.workspace_args(["ml", "workspace", "show"])) {
            Ok(_) => Ok(true),
            Err(e) if e.downcast_ref::<AzFailure>().is_some() => {
                debug!(workspace = %scope.workspace, err = %e, "workspace show failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn create_workspace(&self, scope: &WorkspaceScope, location: &str) -> Result<()> {
        info!(workspace = %scope.workspace, location, "creating workspace");
        let mut args = scope.workspace_args(["ml", "workspace", "create"]);
        if !location.is_empty() {
            args.extend(["--location", location]);
        }
        self.run(args).map(|_| ())
    }

    pub fn create_online_endpoint(&self, scope: &WorkspaceScope, name: &str) -> Result<()> {
        info!(endpoint = name, workspace = %scope.workspace, "creating online endpoint");
        let mut args = vec!["ml", "online-endpoint", "create", "--name", name, "--auth-mode", "key"];
        args.extend(scope.args());
        self.run(args).map(|_| ())
    }

    /// Create a deployment from a spec file and route all traffic to it.
    pub fn create_online_deployment(
        &self,
        scope: &WorkspaceScope,
        spec_file: &Path,
    ) -> Result<()> {
        let spec = spec_file.to_string_lossy();
        let mut args = vec!["ml", "online-deployment", "create", "--file", spec.as_ref(), "--all-traffic"];
        args.extend(scope.args());
        self.run(args).map(|_| ())
    }

    pub fn invoke_endpoint(
        &self,
        scope: &WorkspaceScope,
        endpoint: &str,
        deployment: &str,
        request_file: &Path,
    ) -> Result<String> {
        let request = request_file.to_string_lossy();
        let mut args = vec![
            "ml",
            "online-endpoint",
            "invoke",
            "--name",
            endpoint,
            "--deployment-name",
            deployment,
            "--request-file",
            request.as_ref(),
        ];
        args.extend(scope.args());
        self.run(args)
    }

    pub fn deployment_logs(&self, scope: &WorkspaceScope, endpoint: &str, deployment: &str) -> Result<String> {
        let mut args = vec![
            "ml",
            "online-deployment",
            "get-logs",
            "--name",
            deployment,
            "--endpoint-name",
            endpoint,
            "--lines",
            "100000",
        ];
        args.extend(scope.args());
        self.run(args)
    }

    pub fn delete_online_endpoint(&self, scope: &WorkspaceScope, endpoint: &str) -> Result<()> {
        info!(endpoint, workspace = %scope.workspace, "deleting online endpoint");
        let mut args = vec!["ml", "online-endpoint", "delete", "--name", endpoint, "--yes"];
        args.extend(scope.args());
        self.run(args).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_reports_spawn_failure() {
        let az = Az::new("definitely-not-an-installed-az-binary");
        assert!(az.ensure_available().is_err());
        let err = az.run(["ml", "model", "list"]).unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn failure_carries_command_output() {
        let failure = AzFailure {
            command: "az ml online-endpoint create".to_string(),
            output: "ResourceNotReady: quota exceeded".to_string(),
        };
        let rendered = failure.to_string();
        assert!(rendered.contains("az ml online-endpoint create"));
        assert!(rendered.contains("quota exceeded"));
    }
}
