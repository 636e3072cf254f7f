use clap::builder::FalseyValueParser;
use clap::{Args, ColorChoice, Parser, Subcommand};
use std::path::PathBuf;

use crate::provider::{InfraAction, Provider};

#[derive(Parser)]
#[command(
    name = "trackerctl",
    version,
    about = "Provision, deploy and validate the Torrust Tracker demo"
)]
pub struct Cli {
    /// Repository checkout holding `infrastructure/` and `application/`.
    #[arg(long, global = true, env = "TRACKERCTL_PROJECT_ROOT")]
    pub project_root: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,
    /// Print details of passing checks and debug logs.
    #[arg(long, global = true, env = "VERBOSE", value_parser = FalseyValueParser::new())]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate an environment descriptor and render its configuration files.
    ConfigureEnv(ConfigureEnvArgs),
    /// Run the IaC tool for an environment.
    ProvisionInfrastructure(ProvisionArgs),
    /// Release and start the application on a provisioned VM.
    DeployApp(DeployArgs),
    /// Validate a running deployment.
    HealthCheck(HealthCheckArgs),
    /// configure-env, provision-infrastructure apply, deploy-app and
    /// health-check in sequence.
    Pipeline(PipelineArgs),
}

#[derive(Args)]
pub struct ConfigureEnvArgs {
    pub environment: String,
}

#[derive(Args)]
pub struct ProvisionArgs {
    pub environment: String,
    #[arg(value_enum)]
    pub provider: Provider,
    #[arg(value_enum)]
    pub action: InfraAction,
    /// Never prompt for a sudo password.
    #[arg(long, env = "TRACKERCTL_NON_INTERACTIVE", value_parser = FalseyValueParser::new())]
    pub non_interactive: bool,
}

#[derive(Args)]
pub struct DeployArgs {
    pub environment: String,
    pub vm_ip: Option<String>,
    #[arg(long, env = "SKIP_HEALTH_CHECK", value_parser = FalseyValueParser::new())]
    pub skip_health_check: bool,
    #[arg(long, env = "SKIP_WAIT", value_parser = FalseyValueParser::new())]
    pub skip_wait: bool,
    /// Overrides ENABLE_SSL from the environment descriptor.
    #[arg(long, env = "ENABLE_SSL", value_parser = FalseyValueParser::new())]
    pub enable_ssl: Option<bool>,
}

#[derive(Args)]
pub struct HealthCheckArgs {
    pub environment: String,
    pub vm_ip: Option<String>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct PipelineArgs {
    pub environment: String,
    #[arg(value_enum)]
    pub provider: Provider,
    #[arg(long, env = "TRACKERCTL_NON_INTERACTIVE", value_parser = FalseyValueParser::new())]
    pub non_interactive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_provision_positionals() {
        let cli = Cli::try_parse_from([
            "trackerctl",
            "provision-infrastructure",
            "local",
            "libvirt",
            "apply",
            "--non-interactive",
        ])
        .unwrap();
        let Commands::ProvisionInfrastructure(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.provider, Provider::Libvirt);
        assert_eq!(args.action, InfraAction::Apply);
        assert!(args.non_interactive);
    }

    #[test]
    fn deploy_accepts_optional_ip_and_ssl_override() {
        let cli = Cli::try_parse_from([
            "trackerctl",
            "deploy-app",
            "production",
            "203.0.113.7",
            "--enable-ssl",
            "false",
        ])
        .unwrap();
        let Commands::DeployApp(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.vm_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(args.enable_ssl, Some(false));
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(Cli::try_parse_from([
            "trackerctl",
            "provision-infrastructure",
            "local",
            "aws",
            "apply"
        ])
        .is_err());
    }
}
