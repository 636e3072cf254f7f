use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;

use crate::deploy::{deploy_app, DeployOptions};
use crate::output;
use crate::provider::{InfraAction, Provider};
use crate::provision::{provision, ProvisionOptions};
use crate::templates::configure_env;

pub fn run_pipeline(
    project: &Path,
    environment: &str,
    provider: Provider,
    non_interactive: bool,
    verbose: bool,
) -> Result<()> {
    let started = Instant::now();
    let mut timings = Vec::new();

    let stage = Instant::now();
    let config = configure_env(project, environment, verbose).context("configure-env stage failed")?;
    timings.push(("configure-env", stage.elapsed()));

    let stage = Instant::now();
    provision(
        project,
        &config,
        provider,
        InfraAction::Apply,
        ProvisionOptions::new(non_interactive),
    )
    .context("provision-infrastructure stage failed")?;
    timings.push(("provision-infrastructure", stage.elapsed()));

    // Provisioning already waited for cloud-init.
    let stage = Instant::now();
    deploy_app(
        project,
        environment,
        None,
        DeployOptions::new(false, true, None, verbose),
    )
    .context("deploy-app stage failed")?;
    timings.push(("deploy-app + health-check", stage.elapsed()));

    output::header("Pipeline summary");
    for (name, elapsed) in &timings {
        output::info(&format!("{name:<28} {:>5}s", elapsed.as_secs()));
    }
    output::success(&format!(
        "{environment} is up after {}s",
        started.elapsed().as_secs()
    ));
    Ok(())
}
