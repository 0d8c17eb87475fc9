//! Common utilities for E2E tests

use anyhow::{Context, Result};
use chrono::Utc;
use clusterprobe::ccm::CcmCluster;
use clusterprobe::cql::ScyllaSessionFactory;
use clusterprobe::report::ScenarioReporter;
use clusterprobe::{
    scenarios, ClusterContext, Collaborators, ConvergencePoller, JolokiaClient, ProbeConfig, ScenarioResult,
    ScenarioRunner,
};
use std::process::Command;
use std::sync::Arc;
use tracing::{info, warn};

/// Test configuration and utilities
pub struct E2EHarness {
    pub config: ProbeConfig,
}

impl E2EHarness {
    /// Loaded configuration with a cluster name unique to this run
    pub fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("info,clusterprobe=debug")
            .try_init();

        let mut config = ProbeConfig::load()?;
        config.cluster.cluster_name = format!("clusterprobe_e2e_{}", Utc::now().timestamp());
        if config.jolokia.agent_jar.is_none() {
            warn!("No Jolokia agent configured, nodes must already expose Jolokia");
        }

        Ok(Self { config })
    }

    /// Whether the configured ccm binary can be run at all
    pub fn ccm_available(&self) -> bool {
        Command::new(&self.config.cluster.ccm_binary)
            .arg("list")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Run one catalog scenario on a fresh cluster and remove the cluster
    /// afterwards, whatever the outcome
    pub async fn run(&self, name: &str) -> Result<ScenarioResult> {
        let scenario = scenarios::by_name(name, &self.config).context("unknown scenario")?;
        info!("🔍 Running {} on {}", name, self.config.cluster.cluster_name);

        let ccm = Arc::new(CcmCluster::new(self.config.clone()));
        let collaborators = Collaborators {
            control: ccm.clone(),
            logs: ccm,
            sessions: Arc::new(ScyllaSessionFactory::new(self.config.cql.clone())),
        };

        let ctx = ClusterContext::start(collaborators, scenario.topology())
            .await
            .context("Failed to start ccm cluster - is ccm installed?")?
            .with_tolerated_stderr(self.config.cluster.tolerated_stderr.clone());

        let mut runner = ScenarioRunner::new(
            Arc::new(JolokiaClient::new(self.config.jolokia_timeout())?),
            ConvergencePoller::new(self.config.poll_timeout(), self.config.poll_interval()),
        );
        if let Some(deadline) = self.config.run_deadline() {
            runner = runner.with_deadline(deadline);
        }

        let outcome = runner.run(scenario.as_ref(), &ctx).await;
        if let Err(e) = ctx.teardown().await {
            warn!("Failed to remove cluster: {}", e);
        }
        let result = outcome?;

        let reporter = ScenarioReporter::from_config(&self.config.report);
        reporter.print_summary(&result);
        reporter.write_dump(&result)?;

        Ok(result)
    }
}
