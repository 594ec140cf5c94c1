//! Static configuration documents: workspace list, error-category table and
//! per-test-set SKU overrides.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Cloud metadata for one workspace, keyed by workspace name in the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    pub subscription: String,
    pub resource_group: String,
    #[serde(default)]
    pub region: String,
    /// Registry this workspace pulls models from, when it differs from the run default.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub compute: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
}

/// Workspaces in file order; queue assignment iterates them in this order.
pub type WorkspaceList = IndexMap<String, WorkspaceDescriptor>;

pub fn load_workspace_list(path: &Path) -> Result<WorkspaceList> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read workspace list at {}", path.display()))?;
    let list: WorkspaceList = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse workspace list at {}", path.display()))?;
    if list.is_empty() {
        return Err(anyhow!("workspace list {} is empty", path.display()));
    }
    info!(path = %path.display(), workspaces = list.len(), "loaded workspace list");
    Ok(list)
}

/// A log substring and the operator-facing category it indicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub parse_string: String,
    pub error_category: String,
}

/// Load the error-category table. A missing table only disables diagnostics.
pub fn load_error_patterns(path: &Path) -> Vec<ErrorPattern> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "error table not found; log diagnostics disabled");
            return Vec::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(patterns) => patterns,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "error table is not valid JSON; log diagnostics disabled");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuOverride {
    pub sku: String,
}

pub type SkuOverrides = HashMap<String, SkuOverride>;

/// Load `<dir>/<test_set>.json`. Returns `None` when the file is absent or unreadable.
pub fn load_sku_overrides(dir: &Path, test_set: &str) -> Option<SkuOverrides> {
    let path = dir.join(format!("{test_set}.json"));
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), err = %e, "could not find sku-override file");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(overrides) => Some(overrides),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "sku-override file is not valid JSON; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn workspace_list_keeps_file_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workspaces.json");
        fs::write(
            &path,
            r#"{
                "ws-zulu": {"subscription": "s1", "resource_group": "rg1", "region": "eastus", "secret_name": "AZ_CRED"},
                "ws-alpha": {"subscription": "s2", "resource_group": "rg2", "region": "westus", "secret_name": "AZ_CRED2"}
            }"#,
        )
        .unwrap();

        let list = load_workspace_list(&path).unwrap();
        let names: Vec<&str> = list.keys().map(String::as_str).collect();
        assert_eq!(names, ["ws-zulu", "ws-alpha"]);
        assert_eq!(list["ws-alpha"].resource_group, "rg2");
        assert_eq!(list["ws-alpha"].registry, None);
    }

    #[test]
    fn empty_workspace_list_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workspaces.json");
        fs::write(&path, "{}").unwrap();
        assert!(load_workspace_list(&path).is_err());
    }

    #[test]
    fn missing_error_table_yields_no_patterns() {
        let dir = tempdir().unwrap();
        assert!(load_error_patterns(&dir.path().join("errors.json")).is_empty());
    }

    #[test]
    fn sku_overrides_load_by_test_set() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("nightly.json"),
            r#"{"gpt2": {"sku": "Standard_DS4_v2"}}"#,
        )
        .unwrap();

        let overrides = load_sku_overrides(dir.path(), "nightly").unwrap();
        assert_eq!(overrides["gpt2"].sku, "Standard_DS4_v2");
        assert!(load_sku_overrides(dir.path(), "weekly").is_none());
    }
}
