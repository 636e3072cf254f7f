use std::path::{Path, PathBuf};

use crate::constants::{ENVIRONMENTS_DIR, STATE_DIR, STATE_FILE, TEMPLATES_DIR, TERRAFORM_DIR};

pub fn environment_file(project: &Path, environment: &str) -> PathBuf {
    project
        .join(ENVIRONMENTS_DIR)
        .join(format!("{environment}.env"))
}

pub fn templates_dir(project: &Path) -> PathBuf {
    project.join(TEMPLATES_DIR)
}

pub fn terraform_dir(project: &Path) -> PathBuf {
    project.join(TERRAFORM_DIR)
}

pub fn state_path(project: &Path, environment: &str) -> PathBuf {
    project.join(STATE_DIR).join(environment).join(STATE_FILE)
}
