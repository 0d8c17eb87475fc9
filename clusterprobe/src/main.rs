use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clusterprobe::ccm::CcmCluster;
use clusterprobe::cql::ScyllaSessionFactory;
use clusterprobe::report::ScenarioReporter;
use clusterprobe::{
    scenarios, ClusterContext, Collaborators, ConvergencePoller, JolokiaClient, ProbeConfig, ScenarioRunner,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cassandra cluster metrics verification
#[derive(Parser)]
#[command(name = "clusterprobe")]
#[command(about = "Trigger cluster events on a local ccm cluster and verify the metrics they produce")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to CLUSTERPROBE_CONFIG or config/development.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for snapshot dumps and results
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single scenario against a fresh cluster
    Run {
        /// Scenario to run
        #[arg(value_parser = parse_scenario)]
        scenario: String,

        /// Leave the cluster in place afterwards for inspection
        #[arg(long)]
        keep_cluster: bool,
    },

    /// List available scenarios
    List,

    /// Print a sample configuration file
    Config,
}

fn parse_scenario(s: &str) -> Result<String, String> {
    if scenarios::names().contains(&s) {
        Ok(s.to_string())
    } else {
        Err(format!(
            "Unknown scenario: {}. Use 'list' command to see available scenarios.",
            s
        ))
    }
}

fn load_config(cli: &Cli) -> Result<ProbeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_str().context("Config path is not valid UTF-8")?;
            let mut config = ProbeConfig::load_from_file(path)?;
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
        None => ProbeConfig::load()?,
    };

    if let Some(output_dir) = &cli.output_dir {
        config.report.output_dir = output_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::List => {
            let config = ProbeConfig::default();
            println!("📋 Available scenarios:\n");
            for scenario in scenarios::catalog(&config) {
                let topology = scenario.topology();
                println!("  {} ({} nodes)", scenario.name(), topology.node_count);
                println!("    {}", scenario.description());
            }
        }
        Commands::Config => {
            print!("{}", ProbeConfig::sample_yaml()?);
        }
        Commands::Run {
            scenario,
            keep_cluster,
        } => {
            let config = load_config(&cli)?;
            let passed = run_scenario(&config, scenario, *keep_cluster).await?;
            if !passed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run_scenario(config: &ProbeConfig, name: &str, keep_cluster: bool) -> Result<bool> {
    let Some(scenario) = scenarios::by_name(name, config) else {
        bail!("Unknown scenario: {}", name);
    };

    info!("🚀 Running {}: {}", scenario.name(), scenario.description());

    let ccm = Arc::new(CcmCluster::new(config.clone()));
    let collaborators = Collaborators {
        control: ccm.clone(),
        logs: ccm,
        sessions: Arc::new(ScyllaSessionFactory::new(config.cql.clone())),
    };

    let ctx = ClusterContext::start(collaborators, scenario.topology())
        .await
        .context("Failed to start cluster")?
        .with_tolerated_stderr(config.cluster.tolerated_stderr.clone());

    let metrics = Arc::new(JolokiaClient::new(config.jolokia_timeout())?);
    let mut runner = ScenarioRunner::new(
        metrics,
        ConvergencePoller::new(config.poll_timeout(), config.poll_interval()),
    );
    if let Some(deadline) = config.run_deadline() {
        runner = runner.with_deadline(deadline);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let outcome = runner.run_with_cancel(scenario.as_ref(), &ctx, &cancel).await;

    if keep_cluster {
        info!("Leaving cluster {} in place", config.cluster.cluster_name);
    } else if let Err(e) = ctx.teardown().await {
        error!("Failed to tear down cluster: {}", e);
    }

    let result = outcome?;
    let reporter = ScenarioReporter::from_config(&config.report);
    reporter.print_summary(&result);

    if let Some(path) = reporter.write_dump(&result)? {
        info!("📄 Snapshot dump saved to {}", path.display());
    }
    let path = reporter.write_result(&result)?;
    info!("📄 Result saved to {}", path.display());

    Ok(result.passed)
}
