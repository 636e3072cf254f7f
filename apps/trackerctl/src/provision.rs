use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::EnvironmentConfig;
use crate::constants::{
    CLOUD_INIT_LOG, CLOUD_INIT_MARKER, CLOUD_INIT_POLL_ATTEMPTS, CLOUD_INIT_POLL_INTERVAL,
    LOG_TAIL_LINES, VM_IP_POLL_ATTEMPTS, VM_IP_POLL_INTERVAL,
};
use crate::error::PipelineError;
use crate::output;
use crate::paths::terraform_dir;
use crate::poll::{poll_until, PollPolicy, Attempt};
use crate::privileged::ensure_sudo_cached;
use crate::provider::{InfraAction, Provider};
use crate::remote::{RemoteShell, SshTarget};
use crate::state::{remove_handle, save_handle, InfraHandle};
use crate::utils::{command_display, run_cmd, run_cmd_capture, which};

#[derive(Debug, Clone, Copy)]
pub struct ProvisionOptions {
    pub non_interactive: bool,
    pub vm_ip_policy: PollPolicy,
    pub cloud_init_policy: PollPolicy,
}

impl ProvisionOptions {
    pub fn new(non_interactive: bool) -> Self {
        Self {
            non_interactive,
            vm_ip_policy: PollPolicy::new(VM_IP_POLL_INTERVAL, VM_IP_POLL_ATTEMPTS),
            cloud_init_policy: PollPolicy::new(CLOUD_INIT_POLL_INTERVAL, CLOUD_INIT_POLL_ATTEMPTS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IacTool {
    pub binary: PathBuf,
    pub workdir: PathBuf,
    pub vars: Vec<(String, String)>,
}

impl IacTool {
    pub fn detect(project: &Path, config: &EnvironmentConfig, provider: Provider) -> Result<Self> {
        let binary = which("tofu")
            .or_else(|| which("terraform"))
            .context("Neither tofu nor terraform was found on PATH")?;
        let workdir = terraform_dir(project);
        if !workdir.is_dir() {
            return Err(PipelineError::ConfigNotFound { path: workdir }.into());
        }
        Ok(Self {
            binary,
            workdir,
            vars: tf_vars(config, provider),
        })
    }

    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("TF_IN_AUTOMATION", "1");
        for (key, value) in &self.vars {
            cmd.env(format!("TF_VAR_{key}"), value);
        }
        cmd
    }

    fn initialized(&self) -> bool {
        self.workdir.join(".terraform").is_dir()
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let cmd = self.command(args);
        let command_display = command_display(&cmd);
        run_cmd(cmd).with_context(|| format!("{command_display} failed"))
    }

    pub fn init_if_needed(&self) -> Result<()> {
        if self.initialized() {
            return Ok(());
        }
        output::info("Initializing infrastructure working directory");
        self.run(&["init", "-input=false"])
    }

    pub fn vm_ip(&self) -> Result<Option<String>> {
        let result = run_cmd_capture(self.command(&["output", "-json"]))?;
        if !result.ok {
            tracing::debug!(stderr = %result.stderr, "output -json failed");
            return Ok(None);
        }
        Ok(parse_vm_ip(&result.stdout))
    }
}

pub fn tf_vars(config: &EnvironmentConfig, provider: Provider) -> Vec<(String, String)> {
    let mut vars = vec![
        ("environment".to_string(), config.name.clone()),
        (
            "infrastructure_provider".to_string(),
            provider.as_str().to_string(),
        ),
    ];
    for (key, var) in [
        ("VM_MEMORY", "vm_memory"),
        ("VM_VCPUS", "vm_vcpus"),
        ("VM_DISK_SIZE", "vm_disk_size"),
        ("SSH_PUBLIC_KEY", "ssh_public_key"),
    ] {
        if let Some(value) = config.get(key).filter(|value| !value.trim().is_empty()) {
            vars.push((var.to_string(), value.trim().to_string()));
        }
    }
    vars
}

/// Extracts `vm_ip` from `output -json`. Placeholder strings such as
/// "No IP assigned yet" are treated as absent.
pub fn parse_vm_ip(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let ip = value.get("vm_ip")?.get("value")?.as_str()?.trim();
    ip.parse::<IpAddr>().ok().map(|addr| addr.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInitState {
    pub status: String,
    pub marker_present: bool,
    pub system_state: String,
}

impl CloudInitState {
    pub fn is_ready(&self) -> bool {
        self.status.trim() == "status: done"
            && self.marker_present
            && self.system_state.trim() == "running"
    }

    pub fn parse(stdout: &str) -> Self {
        let mut state = Self::default();
        for line in stdout.lines() {
            if let Some(value) = line.strip_prefix("status=") {
                state.status = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("marker=") {
                state.marker_present = value.trim() == "yes";
            } else if let Some(value) = line.strip_prefix("system=") {
                state.system_state = value.trim().to_string();
            }
        }
        state
    }

    fn summary(&self) -> String {
        format!(
            "cloud-init '{}', marker {}, system '{}'",
            if self.status.is_empty() { "unknown" } else { &self.status },
            if self.marker_present { "present" } else { "missing" },
            if self.system_state.is_empty() { "unknown" } else { &self.system_state },
        )
    }
}

fn cloud_init_status_script() -> String {
    format!(
        "printf 'status=%s\\n' \"$(cloud-init status 2>/dev/null | head -n1)\"; \
if test -f {CLOUD_INIT_MARKER}; then echo marker=yes; else echo marker=no; fi; \
printf 'system=%s\\n' \"$(systemctl is-system-running 2>/dev/null)\""
    )
}

pub fn cloud_init_state(remote: &dyn RemoteShell) -> Result<Option<CloudInitState>> {
    let result = remote.run(&cloud_init_status_script())?;
    if result.stdout.is_empty() {
        // ssh itself failed; the VM is not reachable yet.
        tracing::debug!(detail = %result.detail(), "cloud-init status produced no output");
        return Ok(None);
    }
    Ok(Some(CloudInitState::parse(&result.stdout)))
}

pub fn wait_for_cloud_init(remote: &dyn RemoteShell, policy: PollPolicy) -> Result<()> {
    output::info(&format!(
        "Waiting for cloud-init to finish on {}",
        remote.destination()
    ));
    let outcome = poll_until(policy, "cloud-init", |attempt| {
        let state = cloud_init_state(remote)?;
        match state {
            Some(state) if state.is_ready() => Ok(Attempt::Ready(())),
            Some(state) => {
                output::info(&format!(
                    "[{attempt}/{}] {}",
                    policy.max_attempts,
                    state.summary()
                ));
                Ok(Attempt::Pending(state.summary()))
            }
            None => {
                output::info(&format!(
                    "[{attempt}/{}] SSH not reachable yet",
                    policy.max_attempts
                ));
                Ok(Attempt::Pending("SSH unreachable".to_string()))
            }
        }
    })?;
    match outcome {
        Ok(()) => {
            output::success("cloud-init completed");
            Ok(())
        }
        Err(timeout) => {
            output::error(&format!(
                "cloud-init did not complete; last state: {}",
                timeout.last.as_deref().unwrap_or("never observed")
            ));
            dump_cloud_init_diagnostics(remote);
            Err(PipelineError::ProvisionTimeout {
                what: "cloud-init completion".to_string(),
                attempts: timeout.attempts,
            }
            .into())
        }
    }
}

fn dump_cloud_init_diagnostics(remote: &dyn RemoteShell) {
    let sources = [
        (
            "cloud-init output log",
            format!("sudo tail -n {LOG_TAIL_LINES} {CLOUD_INIT_LOG}"),
        ),
        ("cloud-init state directory", "ls -la /var/lib/cloud/".to_string()),
        ("failed units", "systemctl --failed --no-pager".to_string()),
    ];
    for (label, script) in sources {
        match remote.run(&script) {
            Ok(result) => output::dump(label, &format!("{}\n{}", result.stdout, result.stderr)),
            Err(err) => output::dump(label, &format!("unavailable: {err:#}")),
        }
    }
}

pub fn wait_for_vm_ip(tool: &IacTool, policy: PollPolicy) -> Result<String> {
    output::info("Waiting for the VM to report an IP address");
    let outcome = poll_until(policy, "vm-ip", |attempt| {
        let refresh = run_cmd_capture(tool.command(&["refresh", "-input=false"]))?;
        if !refresh.ok {
            tracing::debug!(detail = %refresh.detail(), "refresh failed");
        }
        match tool.vm_ip()? {
            Some(ip) => Ok(Attempt::Ready(ip)),
            None => {
                output::info(&format!("[{attempt}/{}] no IP yet", policy.max_attempts));
                Ok(Attempt::Pending(()))
            }
        }
    })?;
    match outcome {
        Ok(ip) => {
            output::success(&format!("VM IP assigned: {ip}"));
            Ok(ip)
        }
        Err(timeout) => Err(PipelineError::ProvisionTimeout {
            what: "VM IP assignment".to_string(),
            attempts: timeout.attempts,
        }
        .into()),
    }
}

pub fn provision(
    project: &Path,
    config: &EnvironmentConfig,
    provider: Provider,
    action: InfraAction,
    options: ProvisionOptions,
) -> Result<()> {
    if provider != config.provider {
        return Err(PipelineError::ConfigInvalid {
            key: "INFRASTRUCTURE_PROVIDER".to_string(),
            reason: format!(
                "is {} in {} but {provider} was requested",
                config.provider,
                config.source.display()
            ),
        }
        .into());
    }
    let tool = IacTool::detect(project, config, provider)?;
    output::header(&format!(
        "{action} infrastructure for {} ({provider})",
        config.name
    ));

    match action {
        InfraAction::Init => tool.run(&["init", "-input=false"])?,
        InfraAction::Plan => {
            tool.init_if_needed()?;
            tool.run(&["plan", "-input=false"])?;
        }
        InfraAction::Apply => {
            apply(project, config, provider, &tool, options)?;
        }
        InfraAction::Destroy => destroy(project, config, &tool)?,
    }
    Ok(())
}

fn apply(
    project: &Path,
    config: &EnvironmentConfig,
    provider: Provider,
    tool: &IacTool,
    options: ProvisionOptions,
) -> Result<InfraHandle> {
    if provider.needs_privileges() {
        ensure_sudo_cached(options.non_interactive)?;
    }
    tool.init_if_needed()?;
    tool.run(&["apply", "-input=false", "-auto-approve"])?;

    let vm_ip = wait_for_vm_ip(tool, options.vm_ip_policy)?;
    let remote = SshTarget::new(&config.ssh_user, &vm_ip);
    wait_for_cloud_init(&remote, options.cloud_init_policy)?;

    let handle = InfraHandle {
        environment: config.name.clone(),
        provider,
        vm_ip,
        ssh_user: config.ssh_user.clone(),
        provisioned_at: Utc::now().to_rfc3339(),
    };
    save_handle(project, &handle)?;
    output::success(&format!(
        "Infrastructure ready: ssh {}@{}",
        handle.ssh_user, handle.vm_ip
    ));
    Ok(handle)
}

fn destroy(project: &Path, config: &EnvironmentConfig, tool: &IacTool) -> Result<()> {
    match run_cmd_capture(tool.command(&["destroy", "-input=false", "-auto-approve"])) {
        Ok(result) if result.ok => output::success("Infrastructure destroyed"),
        Ok(result) => output::warning(&format!(
            "destroy exited with {}: {}",
            result.returncode,
            result.detail()
        )),
        Err(err) => output::warning(&format!("destroy could not run: {err:#}")),
    }
    remove_handle(project, &config.name)?;
    Ok(())
}

/// Resolves the VM address for deploy and health-check: explicit argument,
/// then the persisted handle, then the IaC outputs.
pub fn resolve_vm_ip(
    project: &Path,
    config: &EnvironmentConfig,
    explicit: Option<String>,
) -> Result<String> {
    if let Some(ip) = explicit {
        let trimmed = ip.trim();
        if trimmed.is_empty() {
            bail!("vm_ip argument is empty");
        }
        return Ok(trimmed.to_string());
    }
    if let Some(handle) = crate::state::load_handle(project, &config.name)? {
        return Ok(handle.vm_ip);
    }
    let tool = IacTool::detect(project, config, config.provider)?;
    tool.vm_ip()?.with_context(|| {
        format!(
            "No VM IP known for {}; pass vm_ip or run provision-infrastructure first",
            config.name
        )
    })
}
