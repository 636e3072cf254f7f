use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::Path;
use std::time::Duration;

use crate::compose::{compose_script, parse_ps, ServiceState};
use crate::config::{load_environment, EnvironmentConfig};
use crate::constants::{
    GRAFANA_PORT, HTTP_CHECK_TIMEOUT, PROMETHEUS_LOCAL_URL, REMOTE_PERSISTENT_DIR, STORAGE_DIRS,
    TRACKER_UDP_PORTS, UDP_CHECK_TIMEOUT,
};
use crate::error::PipelineError;
use crate::output;
use crate::provision::resolve_vm_ip;
use crate::remote::{RemoteShell, SshTarget};
use crate::utils::shell_escape;

const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;
const UDP_ACTION_CONNECT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl CheckResult {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Pass,
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Fail,
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn non_critical(mut self) -> Self {
        if self.status == CheckStatus::Fail {
            self.status = CheckStatus::Warn;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub environment: String,
    pub target: String,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn new(environment: &str, target: &str, checks: Vec<CheckResult>) -> Self {
        let count = |status| checks.iter().filter(|check| check.status == status).count();
        Self {
            environment: environment.to_string(),
            target: target.to_string(),
            generated_at: Utc::now(),
            total: checks.len(),
            passed: count(CheckStatus::Pass),
            failed: count(CheckStatus::Fail),
            warnings: count(CheckStatus::Warn),
            checks,
        }
    }

    pub fn healthy(&self) -> bool {
        self.failed == 0
    }

    pub fn result_line(&self) -> String {
        format!("Result: {} passed, {} failed", self.passed, self.failed)
    }

    pub fn print(&self, verbose: bool) {
        output::header(&format!("Health check: {} ({})", self.environment, self.target));
        for check in &self.checks {
            match check.status {
                CheckStatus::Pass if verbose => {
                    output::success(&format!("{}: {}", check.name, check.detail))
                }
                CheckStatus::Pass => output::success(&check.name),
                CheckStatus::Warn => output::warning(&format!("{}: {}", check.name, check.detail)),
                CheckStatus::Fail => output::error(&format!("{}: {}", check.name, check.detail)),
            }
        }

        println!();
        println!("Total checks: {}", self.total);
        println!("Passed:       {}", self.passed);
        println!("Failed:       {}", self.failed);
        println!("Warnings:     {}", self.warnings);

        let hints: Vec<&CheckResult> = self
            .checks
            .iter()
            .filter(|check| check.status != CheckStatus::Pass && check.hint.is_some())
            .collect();
        if !hints.is_empty() {
            println!();
            println!("Troubleshooting:");
            for check in hints {
                println!("  - {}: {}", check.name, check.hint.as_deref().unwrap_or_default());
            }
        }
        println!();
        println!("{}", self.result_line());
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize health report")
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub http_base: String,
    pub https_base: Option<String>,
    pub grafana_base: String,
    pub udp_host: String,
    pub udp_ports: Vec<u16>,
}

impl Endpoints {
    pub fn for_target(ip: &str, ssl_enabled: bool) -> Self {
        let host = if ip.contains(':') {
            format!("[{ip}]")
        } else {
            ip.to_string()
        };
        Self {
            http_base: format!("http://{host}"),
            https_base: ssl_enabled.then(|| format!("https://{host}")),
            grafana_base: format!("http://{host}:{GRAFANA_PORT}"),
            udp_host: ip.to_string(),
            udp_ports: TRACKER_UDP_PORTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthOptions {
    pub http_timeout: Duration,
    pub udp_timeout: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            http_timeout: HTTP_CHECK_TIMEOUT,
            udp_timeout: UDP_CHECK_TIMEOUT,
        }
    }
}

pub fn http_client(timeout: Duration) -> Result<Client> {
    // Demo hosts serve self-signed certificates.
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .context("Failed to build HTTP client")
}

/// `label` replaces the URL in errors, so query values such as the admin
/// token never reach the report.
pub fn http_status(client: &Client, url: &str, query: &[(&str, &str)], label: &str) -> Result<u16> {
    let response = client
        .get(url)
        .query(query)
        .send()
        .map_err(|err| err.without_url())
        .with_context(|| format!("GET {label}"))?;
    Ok(response.status().as_u16())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Success,
    Status(u16),
}

impl Expect {
    fn matches(self, status: u16) -> bool {
        match self {
            Self::Success => (200..300).contains(&status),
            Self::Status(expected) => status == expected,
        }
    }
}

fn check_http(
    client: &Client,
    name: &str,
    url: &str,
    query: &[(&str, &str)],
    display: &str,
    expect: Expect,
) -> CheckResult {
    match http_status(client, url, query, display) {
        Ok(status) if expect.matches(status) => {
            CheckResult::pass(name, format!("{display} returned {status}"))
        }
        Ok(status) => CheckResult::fail(
            name,
            format!("{display} returned {status}"),
            "Check the proxy and tracker containers: docker compose logs proxy tracker",
        ),
        Err(err) => CheckResult::fail(
            name,
            format!("unreachable: {err:#}"),
            "Check that the proxy is listening and the firewall allows ports 80/443",
        ),
    }
}

pub fn udp_connect_check(host: &str, port: u16, timeout: Duration) -> Result<()> {
    let target: SocketAddr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("No address for {host}:{port}"))?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)?;
    socket.set_read_timeout(Some(timeout))?;

    let transaction_id: u32 = rand::random();
    let mut request = [0u8; 16];
    request[..8].copy_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    request[8..12].copy_from_slice(&UDP_ACTION_CONNECT.to_be_bytes());
    request[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    socket.send_to(&request, target)?;

    let mut response = [0u8; 64];
    let (len, _) = socket
        .recv_from(&mut response)
        .context("no response to connect request")?;
    if len < 16 {
        bail!("short connect response ({len} bytes)");
    }
    let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    let echoed = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
    if action != UDP_ACTION_CONNECT {
        bail!("unexpected action {action} in connect response");
    }
    if echoed != transaction_id {
        bail!("transaction id mismatch in connect response");
    }
    Ok(())
}

fn check_ssh(remote: &dyn RemoteShell) -> CheckResult {
    let name = "SSH connectivity";
    match remote.run("echo ok") {
        Ok(result) if result.ok && result.stdout.trim() == "ok" => {
            CheckResult::pass(name, format!("connected to {}", remote.destination()))
        }
        Ok(result) => CheckResult::fail(
            name,
            format!("ssh exited with {}: {}", result.returncode, result.detail()),
            format!(
                "Verify the VM is running and your key is authorised: ssh {}",
                remote.destination()
            ),
        ),
        Err(err) => CheckResult::fail(name, format!("{err:#}"), "Install an OpenSSH client"),
    }
}

fn check_remote(
    remote: &dyn RemoteShell,
    name: &str,
    script: &str,
    hint: &str,
) -> (CheckResult, String) {
    match remote.run(script) {
        Ok(result) if result.ok => (
            CheckResult::pass(name, first_line(&result.stdout)),
            result.stdout,
        ),
        Ok(result) => (
            CheckResult::fail(name, first_line(result.detail()), hint),
            String::new(),
        ),
        Err(err) => (CheckResult::fail(name, format!("{err:#}"), hint), String::new()),
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("ok").trim().to_string()
}

fn check_stats(client: &Client, base: &str, token: &str) -> CheckResult {
    check_http(
        client,
        "Tracker statistics API",
        &format!("{base}/api/v1/stats"),
        &[("token", token)],
        "/api/v1/stats",
        Expect::Success,
    )
}

fn check_services(remote: &dyn RemoteShell, compose_dir: &str) -> CheckResult {
    let name = "Docker Compose services";
    let hint = "Start the stack with docker compose up -d and inspect docker compose ps";
    let (check, stdout) = check_remote(
        remote,
        name,
        &compose_script(compose_dir, "ps --all --format json"),
        hint,
    );
    if check.status != CheckStatus::Pass {
        return check;
    }
    match parse_ps(&stdout) {
        Ok(records) => {
            let running = records
                .iter()
                .filter(|record| record.state == ServiceState::Running)
                .count();
            if running == 0 {
                CheckResult::fail(name, format!("0 of {} containers running", records.len()), hint)
            } else {
                CheckResult::pass(name, format!("{running} of {} containers running", records.len()))
            }
        }
        Err(err) => CheckResult::fail(name, format!("{err:#}"), hint),
    }
}

fn check_storage(remote: &dyn RemoteShell) -> CheckResult {
    let name = "Persistent storage";
    let script = STORAGE_DIRS
        .iter()
        .map(|dir| {
            let path = format!("{REMOTE_PERSISTENT_DIR}/{dir}");
            format!("test -d {} || echo {dir}", shell_escape(&path))
        })
        .collect::<Vec<_>>()
        .join("; ");
    let hint = "Re-run deploy-app or check cloud-init created /var/lib/torrust";
    match remote.run(&script) {
        Ok(result) if result.ok || !result.stdout.is_empty() => {
            let missing: Vec<&str> = result.stdout.split_whitespace().collect();
            if missing.is_empty() {
                CheckResult::pass(name, format!("{} directories present", STORAGE_DIRS.len()))
            } else {
                CheckResult::fail(name, format!("missing: {}", missing.join(", ")), hint)
            }
        }
        Ok(result) => CheckResult::fail(name, result.detail().to_string(), hint),
        Err(err) => CheckResult::fail(name, format!("{err:#}"), hint),
    }
}

pub fn run_health_checks(
    config: &EnvironmentConfig,
    remote: &dyn RemoteShell,
    endpoints: &Endpoints,
    options: HealthOptions,
) -> Result<HealthReport> {
    let mut checks = Vec::new();
    let ssh = check_ssh(remote);
    let reachable = ssh.status == CheckStatus::Pass;
    checks.push(ssh);
    if !reachable {
        return Ok(HealthReport::new(&config.name, &remote.destination(), checks));
    }

    checks.push(
        check_remote(
            remote,
            "Docker daemon",
            "docker info --format '{{.ServerVersion}}'",
            "Start the daemon: sudo systemctl start docker",
        )
        .0,
    );
    let compose_dir = config.remote_compose_dir();
    checks.push(check_services(remote, &compose_dir));

    let client = http_client(options.http_timeout)?;
    let base = &endpoints.http_base;
    checks.push(check_http(
        &client,
        "Health check endpoint",
        &format!("{base}/health_check"),
        &[],
        "/health_check",
        Expect::Success,
    ));
    checks.push(check_stats(&client, base, config.admin_token()));
    checks.push(check_http(
        &client,
        "Tracker root",
        &format!("{base}/"),
        &[],
        "/",
        Expect::Status(404),
    ));
    if let Some(https) = &endpoints.https_base {
        checks.push(
            check_http(
                &client,
                "HTTPS health check",
                &format!("{https}/health_check"),
                &[],
                "https /health_check",
                Expect::Success,
            )
            .non_critical(),
        );
    }

    for port in &endpoints.udp_ports {
        let name = format!("UDP tracker port {port}");
        checks.push(
            match udp_connect_check(&endpoints.udp_host, *port, options.udp_timeout) {
                Ok(()) => CheckResult::pass(name, "connect response received"),
                Err(err) => CheckResult::fail(
                    name,
                    format!("{err:#}"),
                    format!("Check the tracker UDP listener and that the firewall allows {port}/udp"),
                ),
            },
        );
    }

    checks.push(check_storage(remote));
    checks.push(
        check_remote(
            remote,
            "Prometheus",
            &format!("curl -fsS --max-time 5 {PROMETHEUS_LOCAL_URL}"),
            "Inspect docker compose logs prometheus",
        )
        .0,
    );
    checks.push(check_http(
        &client,
        "Grafana",
        &format!("{}/api/health", endpoints.grafana_base),
        &[],
        "/api/health",
        Expect::Success,
    ));
    checks.push(
        check_remote(
            remote,
            "Tracker logs",
            &compose_script(&compose_dir, "logs --no-color --tail=5 tracker"),
            "Inspect the tracker container: docker compose logs tracker",
        )
        .0,
    );

    Ok(HealthReport::new(&config.name, &remote.destination(), checks))
}

pub fn health_check(
    project: &Path,
    environment: &str,
    vm_ip: Option<String>,
    json: bool,
    verbose: bool,
) -> Result<HealthReport> {
    let config = load_environment(project, environment)?;
    let ip = resolve_vm_ip(project, &config, vm_ip)?;
    let remote = SshTarget::new(&config.ssh_user, &ip);
    let endpoints = Endpoints::for_target(&ip, config.ssl_enabled);
    let report = run_health_checks(&config, &remote, &endpoints, HealthOptions::default())?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        report.print(verbose);
    }
    ensure_healthy(&report)?;
    Ok(report)
}

pub fn ensure_healthy(report: &HealthReport) -> Result<()> {
    if !report.healthy() {
        return Err(PipelineError::EndpointFailure(format!(
            "{} of {} health checks failed",
            report.failed, report.total
        ))
        .into());
    }
    Ok(())
}
