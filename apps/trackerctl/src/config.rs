use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_SSH_USER, REMOTE_APP_SUBDIR};
use crate::error::PipelineError;
use crate::paths::environment_file;
use crate::provider::{Provider, TransferMode};

pub const REQUIRED_KEYS: &[&str] = &[
    "ENVIRONMENT",
    "INFRASTRUCTURE_PROVIDER",
    "TRACKER_LOG_LEVEL",
    "TRACKER_ADMIN_TOKEN",
    "MYSQL_ROOT_PASSWORD",
    "MYSQL_PASSWORD",
    "GF_SECURITY_ADMIN_PASSWORD",
];

const PLACEHOLDER_PREFIX: &str = "REPLACE_WITH_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub name: String,
    pub source: PathBuf,
    pub provider: Provider,
    pub transfer_mode: TransferMode,
    pub ssl_enabled: bool,
    pub backups_enabled: bool,
    pub domain_name: Option<String>,
    pub ssh_user: String,
    values: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn admin_token(&self) -> &str {
        self.get("TRACKER_ADMIN_TOKEN").unwrap_or_default()
    }

    pub fn remote_app_dir(&self) -> String {
        let home = if self.ssh_user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.ssh_user)
        };
        format!("{home}/{REMOTE_APP_SUBDIR}")
    }

    pub fn remote_compose_dir(&self) -> String {
        format!("{}/application", self.remote_app_dir())
    }

    pub fn with_ssl_override(mut self, enable_ssl: Option<bool>) -> Result<Self> {
        if let Some(enabled) = enable_ssl {
            self.ssl_enabled = enabled;
            self.values
                .insert("ENABLE_SSL".to_string(), enabled.to_string());
            validate_ssl(&self)?;
        }
        Ok(self)
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim(),
        "1" | "true" | "TRUE" | "True" | "yes" | "YES" | "on"
    )
}

pub fn resolve_project_root(path: Option<PathBuf>) -> Result<PathBuf> {
    let root = match path {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    root.canonicalize()
        .with_context(|| format!("Project root {} does not exist", root.display()))
}

pub fn load_environment(project: &Path, name: &str) -> Result<EnvironmentConfig> {
    let path = environment_file(project, name);
    if !path.is_file() {
        return Err(PipelineError::ConfigNotFound { path }.into());
    }
    let values = parse_descriptor(&path)?;
    build_environment(name, path, values)
}

fn parse_descriptor(path: &Path) -> Result<BTreeMap<String, String>> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read environment file {}", path.display()))?;
    let mut values = BTreeMap::new();
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("Failed to parse environment file {}", path.display()))?;
        values.insert(key, value);
    }
    Ok(values)
}

pub fn build_environment(
    name: &str,
    source: PathBuf,
    values: BTreeMap<String, String>,
) -> Result<EnvironmentConfig> {
    for key in REQUIRED_KEYS {
        let value = values.get(*key).map(|value| value.trim()).unwrap_or("");
        if value.is_empty() {
            return Err(PipelineError::missing_key(key).into());
        }
        if value.starts_with(PLACEHOLDER_PREFIX) {
            return Err(PipelineError::ConfigInvalid {
                key: key.to_string(),
                reason: format!("still holds the placeholder {value}"),
            }
            .into());
        }
    }

    let declared = values["ENVIRONMENT"].trim();
    if declared != name {
        return Err(PipelineError::ConfigInvalid {
            key: "ENVIRONMENT".to_string(),
            reason: format!("is {declared} but the file was loaded for {name}"),
        }
        .into());
    }

    let provider_value = values["INFRASTRUCTURE_PROVIDER"].trim();
    let provider = Provider::parse(provider_value).ok_or_else(|| PipelineError::ConfigInvalid {
        key: "INFRASTRUCTURE_PROVIDER".to_string(),
        reason: format!("has unknown provider {provider_value} (expected libvirt or cloud)"),
    })?;

    let transfer_mode = match values.get("DEPLOY_TRANSFER_MODE").map(|value| value.trim()) {
        None | Some("") => {
            tracing::warn!(
                environment = name,
                "DEPLOY_TRANSFER_MODE not set; deploying committed code only"
            );
            TransferMode::default()
        }
        Some(value) => TransferMode::parse(value).ok_or_else(|| PipelineError::ConfigInvalid {
            key: "DEPLOY_TRANSFER_MODE".to_string(),
            reason: format!("has unknown mode {value} (expected working-tree or archive)"),
        })?,
    };

    let flag = |key: &str| values.get(key).map(|value| is_truthy(value)).unwrap_or(false);
    let domain_name = values
        .get("DOMAIN_NAME")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let ssh_user = values
        .get("SSH_USER")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());

    let config = EnvironmentConfig {
        name: name.to_string(),
        source,
        provider,
        transfer_mode,
        ssl_enabled: flag("ENABLE_SSL"),
        backups_enabled: flag("ENABLE_DB_BACKUPS"),
        domain_name,
        ssh_user,
        values,
    };
    validate_ssl(&config)?;
    Ok(config)
}

fn validate_ssl(config: &EnvironmentConfig) -> Result<()> {
    if config.ssl_enabled && config.domain_name.is_none() {
        return Err(PipelineError::ConfigInvalid {
            key: "DOMAIN_NAME".to_string(),
            reason: "is required when ENABLE_SSL is true".to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn sample_values(environment: &str) -> BTreeMap<String, String> {
        [
            ("ENVIRONMENT", environment),
            ("INFRASTRUCTURE_PROVIDER", "libvirt"),
            ("TRACKER_LOG_LEVEL", "info"),
            ("TRACKER_ADMIN_TOKEN", "MyAccessToken"),
            ("MYSQL_ROOT_PASSWORD", "root_secret"),
            ("MYSQL_PASSWORD", "tracker_secret"),
            ("GF_SECURITY_ADMIN_PASSWORD", "grafana_secret"),
            ("DEPLOY_TRANSFER_MODE", "working-tree"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
    }

    pub(crate) fn sample_config(environment: &str) -> EnvironmentConfig {
        build_environment(
            environment,
            PathBuf::from(format!("{environment}.env")),
            sample_values(environment),
        )
        .unwrap()
    }

    pub(crate) fn write_descriptor(project: &Path, name: &str, values: &BTreeMap<String, String>) {
        let path = environment_file(project, name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let body = values
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect::<String>();
        fs::write(path, body).unwrap();
    }

    fn invalid_key(err: &anyhow::Error) -> Option<String> {
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::ConfigInvalid { key, .. }) => Some(key.clone()),
            _ => None,
        }
    }

    #[test]
    fn missing_descriptor_is_config_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let err = load_environment(temp.path(), "staging").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn every_required_key_is_enforced_by_name() {
        for key in REQUIRED_KEYS {
            let mut values = sample_values("local");
            values.remove(*key);
            let err = build_environment("local", PathBuf::from("local.env"), values).unwrap_err();
            assert_eq!(invalid_key(&err).as_deref(), Some(*key), "{err:#}");

            let mut values = sample_values("local");
            values.insert(key.to_string(), "  ".to_string());
            let err = build_environment("local", PathBuf::from("local.env"), values).unwrap_err();
            assert_eq!(invalid_key(&err).as_deref(), Some(*key), "{err:#}");
        }
    }

    #[test]
    fn placeholder_secrets_are_rejected() {
        let mut values = sample_values("production");
        values.insert(
            "MYSQL_PASSWORD".to_string(),
            "REPLACE_WITH_SECURE_PASSWORD".to_string(),
        );
        let err = build_environment("production", PathBuf::from("p.env"), values).unwrap_err();
        assert_eq!(invalid_key(&err).as_deref(), Some("MYSQL_PASSWORD"));
    }

    #[test]
    fn environment_name_must_match_file() {
        let values = sample_values("local");
        let err = build_environment("production", PathBuf::from("p.env"), values).unwrap_err();
        assert_eq!(invalid_key(&err).as_deref(), Some("ENVIRONMENT"));
    }

    #[test]
    fn ssl_requires_domain_name() {
        let mut values = sample_values("production");
        values.insert("ENABLE_SSL".to_string(), "true".to_string());
        let err = build_environment("production", PathBuf::from("p.env"), values).unwrap_err();
        assert_eq!(invalid_key(&err).as_deref(), Some("DOMAIN_NAME"));

        let config = sample_config("production");
        let err = config.with_ssl_override(Some(true)).unwrap_err();
        assert_eq!(invalid_key(&err).as_deref(), Some("DOMAIN_NAME"));
    }

    #[test]
    fn transfer_mode_defaults_to_archive_when_unset() {
        let mut values = sample_values("local");
        values.remove("DEPLOY_TRANSFER_MODE");
        let config = build_environment("local", PathBuf::from("local.env"), values).unwrap();
        assert_eq!(config.transfer_mode, TransferMode::Archive);

        let mut values = sample_values("local");
        values.insert("DEPLOY_TRANSFER_MODE".to_string(), "rsync".to_string());
        let err = build_environment("local", PathBuf::from("local.env"), values).unwrap_err();
        assert_eq!(invalid_key(&err).as_deref(), Some("DEPLOY_TRANSFER_MODE"));
    }

    #[test]
    fn loads_descriptor_from_disk_with_quotes_and_comments() {
        let temp = tempfile::tempdir().unwrap();
        let path = environment_file(temp.path(), "local");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "# local development\n\
ENVIRONMENT=local\n\
INFRASTRUCTURE_PROVIDER=libvirt\n\
TRACKER_LOG_LEVEL=debug\n\
TRACKER_ADMIN_TOKEN=\"MyAccessToken\"\n\
MYSQL_ROOT_PASSWORD='root pass'\n\
MYSQL_PASSWORD=tracker\n\
GF_SECURITY_ADMIN_PASSWORD=admin\n\
ENABLE_DB_BACKUPS=true\n\
SSH_USER=\n",
        )
        .unwrap();

        let config = load_environment(temp.path(), "local").unwrap();
        assert_eq!(config.provider, Provider::Libvirt);
        assert_eq!(config.admin_token(), "MyAccessToken");
        assert_eq!(config.get("MYSQL_ROOT_PASSWORD"), Some("root pass"));
        assert!(config.backups_enabled);
        assert!(!config.ssl_enabled);
        assert_eq!(config.ssh_user, DEFAULT_SSH_USER);
    }

    #[test]
    fn remote_app_dir_follows_ssh_user() {
        let config = sample_config("local");
        assert_eq!(
            config.remote_app_dir(),
            "/home/torrust/github/torrust/torrust-tracker-demo"
        );

        let mut values = sample_values("local");
        values.insert("SSH_USER".to_string(), "deployer".to_string());
        let config = build_environment("local", PathBuf::from("local.env"), values).unwrap();
        assert_eq!(
            config.remote_compose_dir(),
            "/home/deployer/github/torrust/torrust-tracker-demo/application"
        );

        let mut values = sample_values("local");
        values.insert("SSH_USER".to_string(), "root".to_string());
        let config = build_environment("local", PathBuf::from("local.env"), values).unwrap();
        assert!(config.remote_app_dir().starts_with("/root/"));
    }

    #[test]
    fn written_descriptor_round_trips_through_loader() {
        let temp = tempfile::tempdir().unwrap();
        write_descriptor(temp.path(), "local", &sample_values("local"));
        let config = load_environment(temp.path(), "local").unwrap();
        assert_eq!(config.transfer_mode, TransferMode::WorkingTree);
        assert_eq!(config.values(), &sample_values("local"));
    }
}
