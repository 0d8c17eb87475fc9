//! Interfaces to the external collaborators a scenario drives: cluster
//! lifecycle, log tailing and CQL sessions.
//!
//! Production implementations live in `ccm` and `cql`; in-memory ones for
//! tests live in `mock`.

use async_trait::async_trait;
use clusterprobe_core::ProbeResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::node::NodeHandle;
use crate::topology::Topology;

/// Raw output of an administrative command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new<O: Into<String>, E: Into<String>>(stdout: O, stderr: E) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// stderr lines not matched by any tolerated pattern
    pub fn unexpected_stderr(&self, tolerated: &[String]) -> Vec<String> {
        self.stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| !tolerated.iter().any(|pattern| line.contains(pattern.as_str())))
            .map(str::to_string)
            .collect()
    }
}

/// Opaque position in a node's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMark {
    pub offset: u64,
}

/// Starts, stops and administers cluster nodes
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Create and start a cluster, returning one running handle per node
    async fn start_cluster(&self, topology: &Topology) -> ProbeResult<Vec<NodeHandle>>;

    /// Stop a node; `wait_other_notice` blocks until the rest of the ring sees it down
    async fn stop_node(&self, node: &NodeHandle, wait_other_notice: bool) -> ProbeResult<()>;

    async fn start_node(&self, node: &NodeHandle) -> ProbeResult<()>;

    /// Run an administrative (nodetool) command against a node
    async fn run_admin_command(&self, node: &NodeHandle, args: &[&str]) -> ProbeResult<CommandOutput>;

    /// Stop and remove the cluster
    async fn teardown(&self) -> ProbeResult<()>;
}

/// Watches node logs for completion markers
#[async_trait]
pub trait LogWatcher: Send + Sync {
    /// Remember the current end of a node's log
    async fn mark_log(&self, node: &NodeHandle) -> ProbeResult<LogMark>;

    /// Wait for any of `patterns` to appear after `mark`.
    ///
    /// Returns `Ok(false)` on timeout and a cancellation error if `cancel`
    /// fires first.
    async fn wait_for_log(
        &self,
        node: &NodeHandle,
        patterns: &[String],
        mark: LogMark,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult<bool>;
}

/// Consistency levels the harness writes and reads at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyLevel {
    Any,
    One,
    Two,
    Quorum,
    All,
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::Any => "ANY",
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Two => "TWO",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
        };
        write!(f, "{}", name)
    }
}

/// Text cells of one result row; nulls are `None`
pub type TextRow = Vec<Option<String>>;

/// An open CQL session against one node
#[async_trait]
pub trait QuerySession: Send + Sync {
    async fn execute(&self, statement: &str, consistency: ConsistencyLevel) -> ProbeResult<()>;

    /// Run a query whose selected columns are all text
    async fn select_text(&self, statement: &str, consistency: ConsistencyLevel) -> ProbeResult<Vec<TextRow>>;
}

/// Opens CQL sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Connect exclusively to `node`, optionally using `keyspace`
    async fn connect(&self, node: &NodeHandle, keyspace: Option<&str>) -> ProbeResult<Arc<dyn QuerySession>>;
}

/// Type alias for shared collaborator handles
pub type BoxedClusterControl = Arc<dyn ClusterControl>;
pub type BoxedLogWatcher = Arc<dyn LogWatcher>;
pub type BoxedSessionFactory = Arc<dyn SessionFactory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_stderr_filters_tolerated_lines() {
        let output = CommandOutput::new(
            "",
            "Picked up JAVA_TOOL_OPTIONS: -Xmx1g\n\nerror: connection refused\n",
        );
        let tolerated = vec!["Picked up JAVA_TOOL_OPTIONS".to_string()];
        assert_eq!(
            output.unexpected_stderr(&tolerated),
            vec!["error: connection refused".to_string()]
        );
        assert!(CommandOutput::new("ok", "  \n").unexpected_stderr(&[]).is_empty());
    }

    #[test]
    fn test_consistency_display() {
        assert_eq!(ConsistencyLevel::One.to_string(), "ONE");
        assert_eq!(ConsistencyLevel::All.to_string(), "ALL");
    }
}
