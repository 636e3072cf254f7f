use anyhow::{Context, Result};
use serde::Deserialize;

use crate::constants::{IMAGE_PULL_TIMEOUT, LOG_TAIL_LINES};
use crate::error::PipelineError;
use crate::output;
use crate::poll::{poll_until, PollPolicy, Attempt};
use crate::remote::RemoteShell;
use crate::utils::{shell_escape, CommandResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
    Unknown,
}

impl ServiceState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "removing" => Self::Removing,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Starting,
    NoHealthcheck,
}

impl ServiceHealth {
    /// An empty health string means the service declares no health check.
    /// Anything unrecognised is treated as unhealthy.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Self::NoHealthcheck,
            "healthy" => Self::Healthy,
            "starting" => Self::Starting,
            "unhealthy" => Self::Unhealthy,
            other => {
                tracing::warn!(health = other, "unrecognised container health");
                Self::Unhealthy
            }
        }
    }

    fn acceptable(self) -> bool {
        matches!(self, Self::Healthy | Self::NoHealthcheck)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service: String,
    pub name: String,
    pub state: ServiceState,
    pub health: ServiceHealth,
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
}

impl From<PsEntry> for ServiceRecord {
    fn from(entry: PsEntry) -> Self {
        Self {
            service: entry.service,
            name: entry.name,
            state: ServiceState::parse(&entry.state),
            health: ServiceHealth::parse(&entry.health),
        }
    }
}

/// Parses `docker compose ps --format json`. Older Compose releases print a
/// JSON array, newer ones one object per line.
pub fn parse_ps(stdout: &str) -> Result<Vec<ServiceRecord>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<PsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Failed to parse compose ps output")?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse compose ps line"))
            .collect::<Result<_>>()?
    };
    Ok(entries.into_iter().map(ServiceRecord::from).collect())
}

pub fn parse_services(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub pending: Vec<String>,
}

impl Readiness {
    pub fn ready(&self) -> bool {
        self.pending.is_empty()
    }
}

pub fn readiness(declared: &[String], records: &[ServiceRecord]) -> Readiness {
    let pending = declared
        .iter()
        .filter(|service| {
            !records.iter().any(|record| {
                &record.service == *service
                    && record.state == ServiceState::Running
                    && record.health.acceptable()
            })
        })
        .cloned()
        .collect();
    Readiness { pending }
}

fn describe(service: &str, records: &[ServiceRecord]) -> String {
    match records.iter().find(|record| record.service == service) {
        Some(record) => format!(
            "{service} [{}] ({:?}/{:?})",
            record.name, record.state, record.health
        ),
        None => format!("{service} (no container)"),
    }
}

pub fn compose_script(dir: &str, args: &str) -> String {
    format!("cd {} && docker compose {args}", shell_escape(dir))
}

pub struct Compose<'a> {
    remote: &'a dyn RemoteShell,
    dir: String,
}

impl<'a> Compose<'a> {
    pub fn new(remote: &'a dyn RemoteShell, dir: impl Into<String>) -> Self {
        Self {
            remote,
            dir: dir.into(),
        }
    }

    fn script(&self, args: &str) -> String {
        compose_script(&self.dir, args)
    }

    pub fn run(&self, args: &str) -> Result<CommandResult> {
        self.remote.run(&self.script(args))
    }

    pub fn down(&self) {
        match self.run("down") {
            Ok(result) if !result.ok => {
                tracing::debug!(detail = %result.detail(), "compose down failed; ignored")
            }
            Err(err) => tracing::debug!(error = %err, "compose down failed; ignored"),
            Ok(_) => {}
        }
    }

    pub fn pull(&self) -> Result<()> {
        output::info("Pulling container images");
        let script = format!(
            "cd {} && timeout {} docker compose pull",
            shell_escape(&self.dir),
            IMAGE_PULL_TIMEOUT.as_secs()
        );
        self.remote.run_ok(&script, "docker compose pull")?;
        Ok(())
    }

    pub fn up(&self) -> Result<()> {
        output::info("Starting services");
        self.remote
            .run_ok(&self.script("up -d"), "docker compose up")?;
        Ok(())
    }

    pub fn declared_services(&self) -> Result<Vec<String>> {
        let result = self
            .remote
            .run_ok(&self.script("config --services"), "docker compose config")?;
        Ok(parse_services(&result.stdout))
    }

    /// `None` when `docker compose ps` itself failed.
    pub fn records(&self) -> Result<Option<Vec<ServiceRecord>>> {
        let result = self.run("ps --all --format json")?;
        if !result.ok {
            tracing::debug!(detail = %result.detail(), "compose ps failed");
            return Ok(None);
        }
        parse_ps(&result.stdout).map(Some)
    }

    pub fn wait_until_ready(&self, policy: PollPolicy) -> Result<()> {
        output::info("Waiting for services to become healthy");
        let declared = self.declared_services()?;
        let outcome = poll_until(policy, "services", |attempt| {
            let Some(records) = self.records()? else {
                output::info(&format!(
                    "[{attempt}/{}] docker compose ps failed",
                    policy.max_attempts
                ));
                return Ok(Attempt::Pending("docker compose ps failed".to_string()));
            };
            let readiness = readiness(&declared, &records);
            if readiness.ready() {
                return Ok(Attempt::Ready(()));
            }
            let summary = readiness
                .pending
                .iter()
                .map(|service| describe(service, &records))
                .collect::<Vec<_>>()
                .join(", ");
            output::info(&format!(
                "[{attempt}/{}] waiting for {summary}",
                policy.max_attempts
            ));
            Ok(Attempt::Pending(readiness.pending.join(", ")))
        })?;
        match outcome {
            Ok(()) => {
                output::success(&format!("All {} services are healthy", declared.len()));
                Ok(())
            }
            Err(timeout) => {
                self.dump_diagnostics();
                Err(PipelineError::ServiceTimeout {
                    attempts: timeout.attempts,
                    pending: timeout.last.unwrap_or_default(),
                }
                .into())
            }
        }
    }

    pub fn dump_diagnostics(&self) {
        for (label, args) in [
            ("docker compose ps", "ps --all".to_string()),
            (
                "service logs",
                format!("logs --no-color --tail={LOG_TAIL_LINES}"),
            ),
        ] {
            match self.run(&args) {
                Ok(result) => output::dump(label, &format!("{}\n{}", result.stdout, result.stderr)),
                Err(err) => output::dump(label, &format!("unavailable: {err:#}")),
            }
        }
    }
}
