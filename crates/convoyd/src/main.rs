//! convoyd — the Convoy daemon.
//!
//! Plans declared-state transitions and runs them against an in-memory
//! cluster.
//!
//! # Usage
//!
//! ```text
//! convoyd plan --file transition.toml
//! convoyd simulate --file transition.toml --config convoy.toml
//! convoyd config
//! ```

mod simulate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use convoy_core::{ConvoyConfig, LogSettings};
use convoy_plan::{DeploymentPlan, Transition};

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy deployment orchestrator")]
struct Cli {
    /// Path to convoy.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the deployment plan for a transition file as JSON.
    Plan {
        /// Transition file (TOML).
        #[arg(long)]
        file: PathBuf,
    },
    /// Run a transition against an in-memory cluster and stream its events.
    Simulate {
        /// Transition file (TOML).
        #[arg(long)]
        file: PathBuf,

        /// Preempt deployments holding the same applications.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConvoyConfig::from_file(path)?,
        None => ConvoyConfig::default(),
    };
    init_tracing(&config.log)?;

    match cli.command {
        Command::Plan { file } => {
            let transition = read_transition(&file)?;
            let plan = DeploymentPlan::build(&transition)?;
            info!(
                steps = plan.steps.len(),
                actions = plan.action_count(),
                "plan ready"
            );
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Command::Simulate { file, force } => {
            let transition = read_transition(&file)?;
            simulate::run(transition, &config, force).await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(settings: &LogSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .with_context(|| format!("invalid log filter {:?}", settings.filter))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if settings.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn read_transition(path: &Path) -> anyhow::Result<Transition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../demos")
            .join(name)
    }

    #[test]
    fn demo_upgrade_plans() {
        let transition = read_transition(&demo("upgrade.toml")).unwrap();
        let plan = DeploymentPlan::build(&transition).unwrap();
        assert_eq!(plan.affected_apps.len(), 3);
        // Resolve, drain old api and legacy web, start new api, grow it,
        // start web, retire old api.
        assert_eq!(plan.action_count(), 7);
    }

    #[test]
    fn demo_cycle_is_rejected() {
        let transition = read_transition(&demo("cycle.toml")).unwrap();
        assert!(DeploymentPlan::build(&transition).is_err());
    }

    #[test]
    fn demo_config_matches_defaults() {
        let config = ConvoyConfig::from_file(&demo("convoy.toml")).unwrap();
        assert_eq!(config, ConvoyConfig::default());
    }

    #[test]
    fn cli_parses_simulate() {
        let cli = Cli::try_parse_from(["convoyd", "simulate", "--file", "t.toml", "--force"]).unwrap();
        assert!(matches!(cli.command, Command::Simulate { force: true, .. }));
    }
}
