//! Workspace provisioning: create every workspace in the list that does not
//! exist yet, stopping at the first failure.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::az::{Az, WorkspaceScope};
use crate::config::WorkspaceList;
use crate::utils::{Annotation, annotate};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SetupReport {
    pub existing: Vec<String>,
    pub created: Vec<String>,
    /// Workspaces a dry run would have created.
    pub planned: Vec<String>,
}

pub fn ensure_workspaces(az: &Az, workspaces: &WorkspaceList, dry_run: bool) -> Result<SetupReport> {
    az.ensure_available()?;
    let mut report = SetupReport::default();

    for (name, ws) in workspaces {
        let scope = WorkspaceScope {
            subscription: ws.subscription.clone(),
            resource_group: ws.resource_group.clone(),
            workspace: name.clone(),
        };
        if az.workspace_exists(&scope)? {
            info!(workspace = %name, "workspace exists");
            report.existing.push(name.clone());
            continue;
        }
        if dry_run {
            info!(workspace = %name, region = %ws.region, "dry run: would create workspace");
            report.planned.push(name.clone());
            continue;
        }
        if ws.region.is_empty() {
            warn!(workspace = %name, "no region set; the resource group location applies");
        }
        az.create_workspace(&scope, &ws.region)
            .inspect_err(|_| annotate(Annotation::Error, &format!("could not create workspace {name}")))
            .with_context(|| format!("failed to create workspace {name} in {}", ws.resource_group))?;
        report.created.push(name.clone());
    }

    info!(
        existing = report.existing.len(),
        created = report.created.len(),
        planned = report.planned.len(),
        "workspace setup finished"
    );
    Ok(report)
}
