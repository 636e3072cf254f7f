use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::compose::Compose;
use crate::config::{load_environment, EnvironmentConfig};
use crate::constants::{
    BACKUP_SCRIPT, CLOUD_INIT_POLL_ATTEMPTS, CLOUD_INIT_POLL_INTERVAL, HTTP_CHECK_TIMEOUT,
    REMOTE_PERSISTENT_DIR, REMOTE_STAGING_DIR,
    SERVICE_POLL_ATTEMPTS, SERVICE_POLL_INTERVAL,
};
use crate::error::PipelineError;
use crate::health::{
    ensure_healthy, http_client, http_status, run_health_checks, Endpoints, HealthOptions,
};
use crate::output;
use crate::poll::PollPolicy;
use crate::provision::{resolve_vm_ip, wait_for_cloud_init};
use crate::remote::{RemoteShell, SshTarget};
use crate::templates::rendered_outputs;
use crate::transfer::{strategy_for, TransferStrategy};
use crate::utils::shell_escape;

const BACKUP_SCHEDULE: &str = "0 3 * * *";
const BACKUP_LOG: &str = "/var/log/mysql-backup.log";

#[derive(Debug, Clone, Copy)]
pub struct DeployOptions {
    pub skip_health_check: bool,
    pub skip_wait: bool,
    pub enable_ssl: Option<bool>,
    pub verbose: bool,
    pub cloud_init_policy: PollPolicy,
    pub service_policy: PollPolicy,
}

impl DeployOptions {
    pub fn new(skip_health_check: bool, skip_wait: bool, enable_ssl: Option<bool>, verbose: bool) -> Self {
        Self {
            skip_health_check,
            skip_wait,
            enable_ssl,
            verbose,
            cloud_init_policy: PollPolicy::new(CLOUD_INIT_POLL_INTERVAL, CLOUD_INIT_POLL_ATTEMPTS),
            service_policy: PollPolicy::new(SERVICE_POLL_INTERVAL, SERVICE_POLL_ATTEMPTS),
        }
    }
}

pub fn deploy_app(
    project: &Path,
    environment: &str,
    vm_ip: Option<String>,
    options: DeployOptions,
) -> Result<()> {
    let config = load_environment(project, environment)?.with_ssl_override(options.enable_ssl)?;
    let outputs = rendered_outputs(project)?;
    let ip = resolve_vm_ip(project, &config, vm_ip)?;
    let remote = SshTarget::new(&config.ssh_user, &ip);
    let strategy = strategy_for(config.transfer_mode);

    let deployment = Deployment {
        project,
        config: &config,
        remote: &remote,
        strategy: strategy.as_ref(),
        vm_ip: ip.clone(),
    };
    deployment.run(&outputs, options)
}

pub struct Deployment<'a> {
    pub project: &'a Path,
    pub config: &'a EnvironmentConfig,
    pub remote: &'a dyn RemoteShell,
    pub strategy: &'a dyn TransferStrategy,
    pub vm_ip: String,
}

impl Deployment<'_> {
    pub fn run(&self, outputs: &[(PathBuf, &'static str)], options: DeployOptions) -> Result<()> {
        output::header(&format!(
            "Deploying {} to {} ({} transfer)",
            self.config.name,
            self.remote.destination(),
            self.strategy.mode()
        ));
        if options.skip_wait {
            output::info("Skipping infrastructure readiness wait");
        } else {
            wait_for_cloud_init(self.remote, options.cloud_init_policy)?;
        }

        self.release(outputs)?;
        self.run_services(options.service_policy)?;
        self.post_start()?;

        if options.skip_health_check {
            output::info("Skipping health validation");
        } else {
            let endpoints = Endpoints::for_target(&self.vm_ip, self.config.ssl_enabled);
            let report =
                run_health_checks(self.config, self.remote, &endpoints, HealthOptions::default())?;
            report.print(options.verbose);
            ensure_healthy(&report)?;
        }
        output::success(&format!(
            "Deployment of {} complete: http://{}/",
            self.config.name, self.vm_ip
        ));
        Ok(())
    }

    pub fn release(&self, outputs: &[(PathBuf, &'static str)]) -> Result<()> {
        output::header("Release stage");
        let app_dir = self.config.remote_app_dir();
        let escaped = shell_escape(&app_dir);
        self.remote
            .run_ok(
                &format!("rm -rf {escaped} && mkdir -p {escaped}"),
                "cleaning application directory",
            )
            .map_err(|err| PipelineError::TransferFailure(format!("{err:#}")))?;
        self.strategy
            .deliver(self.project, self.remote, &app_dir)?;
        output::success("Application code transferred");

        self.install_configuration(outputs)?;
        if self.config.ssl_enabled {
            self.ensure_certificates()?;
        }
        Ok(())
    }

    fn install_configuration(&self, outputs: &[(PathBuf, &'static str)]) -> Result<()> {
        let staging = shell_escape(REMOTE_STAGING_DIR);
        let mut dirs: Vec<String> = outputs
            .iter()
            .filter_map(|(_, remote)| Path::new(remote).parent())
            .map(|parent| shell_escape(&format!("{REMOTE_STAGING_DIR}/{}", parent.display())))
            .collect();
        dirs.sort();
        dirs.dedup();
        self.remote.run_ok(
            &format!("rm -rf {staging} && mkdir -p {}", dirs.join(" ")),
            "preparing staging directory",
        )?;

        let user = shell_escape(&self.config.ssh_user);
        let mut install = Vec::new();
        for (local, remote_rel) in outputs {
            let staged = format!("{REMOTE_STAGING_DIR}/{remote_rel}");
            let result = self.remote.upload(local, &staged)?;
            if !result.ok {
                return Err(PipelineError::TransferFailure(format!(
                    "uploading {} failed: {}",
                    local.display(),
                    result.detail()
                ))
                .into());
            }
            let target = shell_escape(&format!("{REMOTE_PERSISTENT_DIR}/{remote_rel}"));
            let mode = if remote_rel.ends_with(".env") { "0600" } else { "0644" };
            install.push(format!(
                "sudo install -D -m {mode} {} {target} && sudo chown {user}:{user} {target}",
                shell_escape(&staged)
            ));
        }
        install.push(format!(
            "ln -sfn {} {}",
            shell_escape(&format!("{REMOTE_PERSISTENT_DIR}/compose/.env")),
            shell_escape(&format!("{}/.env", self.config.remote_compose_dir()))
        ));
        install.push(format!("rm -rf {staging}"));
        self.remote
            .run_ok(&install.join(" && "), "installing configuration")?;
        output::success(&format!(
            "Installed {} configuration files into {REMOTE_PERSISTENT_DIR}",
            outputs.len()
        ));
        Ok(())
    }

    fn ensure_certificates(&self) -> Result<()> {
        let Some(domain) = self.config.domain_name.as_deref() else {
            return Err(PipelineError::missing_key("DOMAIN_NAME").into());
        };
        for host in [format!("tracker.{domain}"), format!("grafana.{domain}")] {
            let dir = format!("{REMOTE_PERSISTENT_DIR}/proxy/certbot/etc/live/{host}");
            let cert = shell_escape(&format!("{dir}/fullchain.pem"));
            let key = shell_escape(&format!("{dir}/privkey.pem"));
            let script = format!(
                "if sudo test -f {cert}; then echo present; else sudo mkdir -p {} && \
sudo openssl req -x509 -nodes -newkey rsa:2048 -days 365 -keyout {key} -out {cert} -subj {} \
>/dev/null 2>&1 && echo generated; fi",
                shell_escape(&dir),
                shell_escape(&format!("/CN={host}"))
            );
            let result = self
                .remote
                .run_ok(&script, &format!("certificate generation for {host}"))?;
            if result.stdout.trim() == "generated" {
                output::info(&format!("Generated self-signed certificate for {host}"));
            } else {
                tracing::debug!(host = %host, "certificate already present");
            }
        }
        Ok(())
    }

    pub fn run_services(&self, policy: PollPolicy) -> Result<()> {
        output::header("Run stage");
        let compose = Compose::new(self.remote, self.config.remote_compose_dir());
        compose.down();
        compose.pull()?;
        compose.up()?;
        compose.wait_until_ready(policy)
    }

    pub fn post_start(&self) -> Result<()> {
        if self.config.backups_enabled {
            self.install_backup_cron()?;
        }
        if self.config.ssl_enabled {
            self.check_https();
        }
        Ok(())
    }

    pub fn install_backup_cron(&self) -> Result<()> {
        let existing = self.remote.run("crontab -l 2>/dev/null || true")?;
        if existing.stdout.contains(BACKUP_SCRIPT) {
            output::info("Database backup cron entry already installed");
            return Ok(());
        }
        let entry = format!(
            "{BACKUP_SCHEDULE} cd {} && ./{BACKUP_SCRIPT} >> {BACKUP_LOG} 2>&1",
            self.config.remote_app_dir()
        );
        self.remote
            .run_ok(
                &format!(
                    "(crontab -l 2>/dev/null; echo {}) | crontab -",
                    shell_escape(&entry)
                ),
                "installing backup cron entry",
            )
            .context("Failed to schedule database backups")?;
        output::success("Database backup cron entry installed");
        Ok(())
    }

    fn check_https(&self) {
        let url = format!("https://{}/health_check", self.vm_ip);
        let status = http_client(HTTP_CHECK_TIMEOUT)
            .and_then(|client| http_status(&client, &url, &[], &url));
        match status {
            Ok(status) if (200..300).contains(&status) => output::success(&format!("{url} returned {status}")),
            Ok(status) => output::warning(&format!("{url} returned {status}")),
            Err(err) => output::warning(&format!("{url} unreachable: {err:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{sample_config, sample_values, write_descriptor};
    use crate::provider::TransferMode;
    use crate::remote::fake::FakeRemote;
    use crate::templates::render_templates;
    use crate::templates::tests::write_templates;
    use crate::transfer::Artifact;
    use std::fs;
    use std::time::Duration;

    struct SingleFile;

    impl TransferStrategy for SingleFile {
        fn mode(&self) -> TransferMode {
            TransferMode::WorkingTree
        }

        fn prepare(&self, project: &Path) -> Result<Artifact> {
            Ok(Artifact::WorkingTree {
                root: project.to_path_buf(),
                files: vec![PathBuf::from("README.md")],
            })
        }

        fn ship(&self, artifact: &Artifact, remote: &dyn RemoteShell, remote_dir: &str) -> Result<()> {
            let Artifact::WorkingTree { root, files } = artifact else {
                unreachable!()
            };
            remote.sync_files(root, files, remote_dir)?;
            Ok(())
        }
    }

    fn project() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("README.md"), "tracker demo\n").unwrap();
        write_templates(temp.path());
        render_templates(temp.path(), &sample_config("local")).unwrap();
        temp
    }

    fn deployment<'a>(
        project: &'a Path,
        config: &'a EnvironmentConfig,
        remote: &'a FakeRemote,
    ) -> Deployment<'a> {
        Deployment {
            project,
            config,
            remote,
            strategy: &SingleFile,
            vm_ip: "127.0.0.1".to_string(),
        }
    }

    #[test]
    fn release_cleans_app_dir_before_transfer_and_installs_config() {
        let project = project();
        let config = sample_config("local");
        let remote = FakeRemote::always_ok();
        let outputs = rendered_outputs(project.path()).unwrap();

        deployment(project.path(), &config, &remote)
            .release(&outputs)
            .unwrap();

        let app_dir = config.remote_app_dir();
        let cleaned = remote.position(&format!("rm -rf '{app_dir}'")).unwrap();
        let synced = remote.position(&format!("sync {app_dir}")).unwrap();
        assert!(cleaned < synced);
        assert!(remote.local_path(&format!("{app_dir}/README.md")).is_file());

        let staged = remote.local_path(&format!("{REMOTE_STAGING_DIR}/tracker/etc/tracker.toml"));
        assert!(fs::read_to_string(staged).unwrap().contains("threshold = \"info\""));
        assert!(remote.ran(&format!(
            "sudo install -D -m 0600 '{REMOTE_STAGING_DIR}/compose/.env' '{REMOTE_PERSISTENT_DIR}/compose/.env'"
        )));
        assert!(!remote.ran("rm -rf '/var/lib/torrust'"));
        assert!(!remote.ran("openssl"));
    }

    #[test]
    fn release_targets_the_configured_ssh_users_home() {
        let project = project();
        let mut values = sample_values("local");
        values.insert("SSH_USER".to_string(), "deployer".to_string());
        let config =
            crate::config::build_environment("local", PathBuf::from("local.env"), values).unwrap();
        let remote = FakeRemote::always_ok();
        let outputs = rendered_outputs(project.path()).unwrap();

        deployment(project.path(), &config, &remote)
            .release(&outputs)
            .unwrap();

        let app_dir = "/home/deployer/github/torrust/torrust-tracker-demo";
        assert!(remote.ran(&format!("rm -rf '{app_dir}'")));
        assert!(remote.ran(&format!("sync {app_dir}")));
        assert!(remote.ran(&format!("'{app_dir}/application/.env'")));
        assert!(!remote.ran("/home/torrust"));
    }

    #[test]
    fn ssl_release_generates_missing_certificates() {
        let project = project();
        let mut values = sample_values("production");
        values.insert("ENABLE_SSL".to_string(), "true".to_string());
        values.insert("DOMAIN_NAME".to_string(), "example.com".to_string());
        let config =
            crate::config::build_environment("production", PathBuf::from("p.env"), values).unwrap();
        let remote = FakeRemote::new(|script| {
            if script.contains("openssl") {
                (true, "generated".to_string())
            } else {
                (true, String::new())
            }
        });
        let outputs = rendered_outputs(project.path()).unwrap();
        deployment(project.path(), &config, &remote)
            .release(&outputs)
            .unwrap();
        assert!(remote.ran("/CN=tracker.example.com"));
        assert!(remote.ran("/CN=grafana.example.com"));
    }

    #[test]
    fn backup_cron_is_not_duplicated() {
        let project = project();
        let config = sample_config("local");
        let app_dir = config.remote_app_dir();
        let remote = FakeRemote::new(move |script| {
            if script.starts_with("crontab -l") {
                (true, format!("0 3 * * * cd {app_dir} && ./{BACKUP_SCRIPT}"))
            } else {
                (true, String::new())
            }
        });
        deployment(project.path(), &config, &remote)
            .install_backup_cron()
            .unwrap();
        assert!(!remote.ran("| crontab -"));

        let fresh = FakeRemote::always_ok();
        deployment(project.path(), &config, &fresh)
            .install_backup_cron()
            .unwrap();
        assert!(fresh.ran("| crontab -"));
    }

    #[test]
    fn run_stage_orders_compose_commands() {
        let project = project();
        let config = sample_config("local");
        let remote = FakeRemote::new(|script| {
            if script.contains("config --services") {
                (true, "tracker\n".to_string())
            } else if script.contains("--format json") {
                (
                    true,
                    r#"{"Name":"tracker","Service":"tracker","State":"running","Health":"healthy"}"#
                        .to_string(),
                )
            } else {
                (true, String::new())
            }
        });
        deployment(project.path(), &config, &remote)
            .run_services(PollPolicy::new(Duration::ZERO, 3))
            .unwrap();
        let down = remote.position("docker compose down").unwrap();
        let pull = remote.position("docker compose pull").unwrap();
        let up = remote.position("docker compose up -d").unwrap();
        assert!(down < pull && pull < up);
    }

    #[test]
    fn unset_secret_fails_before_any_network_activity() {
        let project = project();
        let mut values = sample_values("local");
        values.insert("MYSQL_PASSWORD".to_string(), String::new());
        write_descriptor(project.path(), "local", &values);

        let err = deploy_app(
            project.path(),
            "local",
            Some("192.0.2.1".to_string()),
            DeployOptions::new(true, true, None, false),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ConfigInvalid { key, .. }) if key == "MYSQL_PASSWORD"
        ));
    }

    #[test]
    fn missing_rendered_config_points_at_configure_env() {
        let temp = tempfile::tempdir().unwrap();
        write_descriptor(temp.path(), "local", &sample_values("local"));
        let err = deploy_app(
            temp.path(),
            "local",
            Some("192.0.2.1".to_string()),
            DeployOptions::new(true, true, None, false),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("configure-env"));
        assert!(matches!(
            crate::error::pipeline_error(&err),
            Some(PipelineError::ConfigNotFound { .. })
        ));
    }
}
