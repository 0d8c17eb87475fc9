//! A started cluster owned by one scenario run

use clusterprobe_core::{ProbeError, ProbeResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{
    BoxedClusterControl, BoxedLogWatcher, BoxedSessionFactory, CommandOutput, LogMark, QuerySession,
};
use crate::node::{NodeHandle, NodeState};
use crate::topology::Topology;

/// Collaborators a cluster context is built from
#[derive(Clone)]
pub struct Collaborators {
    pub control: BoxedClusterControl,
    pub logs: BoxedLogWatcher,
    pub sessions: BoxedSessionFactory,
}

/// Explicitly created and explicitly torn down cluster.
///
/// Every node handle a scenario uses comes from here, so concurrent runs
/// against separate contexts share nothing.
pub struct ClusterContext {
    collaborators: Collaborators,
    topology: Topology,
    nodes: Vec<NodeHandle>,
    tolerated_stderr: Vec<String>,
}

impl ClusterContext {
    /// Start a cluster with the given shape
    pub async fn start(collaborators: Collaborators, topology: Topology) -> ProbeResult<Self> {
        topology.validate()?;

        info!("Starting {}-node cluster", topology.node_count);
        let nodes = collaborators.control.start_cluster(&topology).await?;

        if nodes.len() != topology.node_count {
            return Err(ProbeError::cluster(format!(
                "requested {} nodes but the cluster reported {}",
                topology.node_count,
                nodes.len()
            )));
        }

        for node in &nodes {
            node.set_state(NodeState::Running);
        }

        Ok(Self {
            collaborators,
            topology,
            nodes,
            tolerated_stderr: Vec::new(),
        })
    }

    /// stderr substrings admin commands may print without failing
    pub fn with_tolerated_stderr(mut self, patterns: Vec<String>) -> Self {
        self.tolerated_stderr = patterns;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// Node by zero-based position
    pub fn node(&self, idx: usize) -> ProbeResult<&NodeHandle> {
        self.nodes.get(idx).ok_or_else(|| {
            ProbeError::configuration(format!(
                "node index {} out of range for a {}-node cluster",
                idx,
                self.nodes.len()
            ))
        })
    }

    pub async fn stop_node(&self, idx: usize, wait_other_notice: bool) -> ProbeResult<()> {
        let node = self.node(idx)?;
        info!("Stopping {}", node);
        self.collaborators.control.stop_node(node, wait_other_notice).await?;
        node.set_state(NodeState::Stopped);
        Ok(())
    }

    pub async fn start_node(&self, idx: usize) -> ProbeResult<()> {
        let node = self.node(idx)?;
        info!("Starting {}", node);
        node.set_state(NodeState::Starting);

        match self.collaborators.control.start_node(node).await {
            Ok(()) => {
                node.set_state(NodeState::Running);
                Ok(())
            }
            Err(e) => {
                node.set_state(NodeState::Stopped);
                Err(e)
            }
        }
    }

    /// Run an admin command; any stderr that is not tolerated fails it
    pub async fn admin(&self, idx: usize, args: &[&str]) -> ProbeResult<CommandOutput> {
        let node = self.node(idx)?;
        debug!("{}: nodetool {}", node.name(), args.join(" "));
        let output = self.collaborators.control.run_admin_command(node, args).await?;

        let unexpected = output.unexpected_stderr(&self.tolerated_stderr);
        if !unexpected.is_empty() {
            return Err(ProbeError::command(
                node.name(),
                args.join(" "),
                unexpected.join(" | "),
            ));
        }

        Ok(output)
    }

    pub async fn connect(&self, idx: usize, keyspace: Option<&str>) -> ProbeResult<Arc<dyn QuerySession>> {
        let node = self.node(idx)?;
        self.collaborators.sessions.connect(node, keyspace).await
    }

    pub async fn mark_log(&self, idx: usize) -> ProbeResult<LogMark> {
        let node = self.node(idx)?;
        self.collaborators.logs.mark_log(node).await
    }

    pub async fn wait_for_log(
        &self,
        idx: usize,
        patterns: &[String],
        mark: LogMark,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult<bool> {
        let node = self.node(idx)?;
        self.collaborators
            .logs
            .wait_for_log(node, patterns, mark, timeout, cancel)
            .await
    }

    /// Stop and remove the cluster
    pub async fn teardown(self) -> ProbeResult<()> {
        info!("Tearing down {}-node cluster", self.nodes.len());
        let result = self.collaborators.control.teardown().await;
        for node in &self.nodes {
            node.set_state(NodeState::Stopped);
        }
        if let Err(e) = &result {
            warn!("Cluster teardown failed: {}", e);
        }
        result
    }
}
