use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::paths::state_path;
use crate::provider::Provider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraHandle {
    pub environment: String,
    pub provider: Provider,
    pub vm_ip: String,
    pub ssh_user: String,
    pub provisioned_at: String,
}

pub fn load_handle(project: &Path, environment: &str) -> Result<Option<InfraHandle>> {
    let path = state_path(project, environment);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read infrastructure state at {}", path.display()))?;
    let handle = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse infrastructure state at {}", path.display()))?;
    Ok(Some(handle))
}

pub fn save_handle(project: &Path, handle: &InfraHandle) -> Result<()> {
    let path = state_path(project, &handle.environment);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state dir {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(handle)?;
    fs::write(&path, contents)
        .with_context(|| format!("Failed to write infrastructure state at {}", path.display()))?;
    Ok(())
}

pub fn remove_handle(project: &Path, environment: &str) -> Result<()> {
    let path = state_path(project, environment);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}
