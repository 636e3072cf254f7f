mod cli;
mod compose;
mod config;
mod constants;
mod deploy;
mod error;
mod health;
mod output;
mod paths;
mod pipeline;
mod poll;
mod privileged;
mod provider;
mod provision;
mod remote;
mod state;
mod templates;
mod transfer;
mod utils;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{load_environment, resolve_project_root};
use crate::deploy::DeployOptions;
use crate::provision::ProvisionOptions;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let project = resolve_project_root(cli.project_root)?;
    let verbose = cli.verbose;
    match cli.command {
        Commands::ConfigureEnv(args) => {
            templates::configure_env(&project, &args.environment, verbose).map(|_| ())
        }
        Commands::ProvisionInfrastructure(args) => {
            let config = load_environment(&project, &args.environment)?;
            provision::provision(
                &project,
                &config,
                args.provider,
                args.action,
                ProvisionOptions::new(args.non_interactive),
            )
        }
        Commands::DeployApp(args) => deploy::deploy_app(
            &project,
            &args.environment,
            args.vm_ip,
            DeployOptions::new(args.skip_health_check, args.skip_wait, args.enable_ssl, verbose),
        ),
        Commands::HealthCheck(args) => {
            health::health_check(&project, &args.environment, args.vm_ip, args.json, verbose)
                .map(|_| ())
        }
        Commands::Pipeline(args) => pipeline::run_pipeline(
            &project,
            &args.environment,
            args.provider,
            args.non_interactive,
            verbose,
        ),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    output::init(cli.color);
    if let Err(err) = run(cli) {
        output::error(&format!("{err:#}"));
        if let Some(hint) = error::pipeline_error(&err).and_then(|cause| cause.hint()) {
            output::info(hint);
        }
        std::process::exit(1);
    }
}
