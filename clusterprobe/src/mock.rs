//! In-memory collaborators for tests
//!
//! `MockMetricsClient` serves scripted metric values, `MockCluster` records
//! every lifecycle operation and serves canned admin output and log lines,
//! and `MockSession` keeps written rows per node.

use async_trait::async_trait;
use clusterprobe_core::{MetricKey, MetricValue, ProbeError, ProbeResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::{
    ClusterControl, CommandOutput, ConsistencyLevel, LogMark, LogWatcher, QuerySession, SessionFactory,
    TextRow,
};
use crate::context::Collaborators;
use crate::jolokia::MetricsClient;
use crate::node::{NodeHandle, NodePorts};
use crate::topology::Topology;

/// Handle for `node{n}` at `127.0.0.{n}`, laid out like a ccm node
pub fn test_node(n: u8) -> NodeHandle {
    NodeHandle::new(
        format!("node{}", n),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)),
        NodePorts {
            storage: 7000,
            native: 9042,
            jmx: 7000 + 100 * n as u16,
            jolokia: 8778,
        },
    )
}

/// Errors are replayed by message. Errors a metrics client never produces
/// come back as cluster errors.
#[derive(Debug, Clone)]
enum Step {
    Value(MetricValue),
    NotFound,
    Unreachable(String),
    Protocol(String),
    Malformed(String),
    Configuration(String),
    Other(String),
}

impl Step {
    fn from_result(result: ProbeResult<MetricValue>) -> Self {
        match result {
            Ok(value) => Step::Value(value),
            Err(ProbeError::NotFound { .. }) => Step::NotFound,
            Err(ProbeError::Unreachable { reason, .. }) => Step::Unreachable(reason),
            Err(ProbeError::Protocol(message)) => Step::Protocol(message),
            Err(ProbeError::MalformedLocator(message)) => Step::Malformed(message),
            Err(ProbeError::Configuration(message)) => Step::Configuration(message),
            Err(other) => Step::Other(other.to_string()),
        }
    }

    fn into_result(self, node: &str, key: &MetricKey) -> ProbeResult<MetricValue> {
        match self {
            Step::Value(value) => Ok(value),
            Step::NotFound => Err(ProbeError::not_found(node, key)),
            Step::Unreachable(reason) => Err(ProbeError::unreachable(node, reason)),
            Step::Protocol(message) => Err(ProbeError::protocol(message)),
            Step::Malformed(message) => Err(ProbeError::malformed(message)),
            Step::Configuration(message) => Err(ProbeError::configuration(message)),
            Step::Other(message) => Err(ProbeError::cluster(message)),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    pending: VecDeque<Step>,
    last: Option<Step>,
}

/// Metrics client answering from scripted values.
///
/// Each key replays its script one step per fetch and then keeps returning
/// the final step. Keys without a script are not found.
#[derive(Debug, Clone, Default)]
pub struct MockMetricsClient {
    scripts: Arc<Mutex<HashMap<(String, MetricKey), Script>>>,
    fetches: Arc<AtomicUsize>,
}

impl MockMetricsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always return `value` for `key` on `node`
    pub fn set(&self, node: &str, key: &MetricKey, value: MetricValue) {
        self.script(node, key, vec![Ok(value)]);
    }

    /// Replay `steps` for `key` on `node`, sticking to the last one
    pub fn script(&self, node: &str, key: &MetricKey, steps: Vec<ProbeResult<MetricValue>>) {
        let pending = steps.into_iter().map(Step::from_result).collect();
        self.scripts.lock().insert(
            (node.to_string(), key.clone()),
            Script { pending, last: None },
        );
    }

    /// Make `key` unknown on `node` again
    pub fn remove(&self, node: &str, key: &MetricKey) {
        self.scripts.lock().remove(&(node.to_string(), key.clone()));
    }

    /// Number of fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricsClient for MockMetricsClient {
    async fn fetch(&self, node: &NodeHandle, key: &MetricKey) -> ProbeResult<MetricValue> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let step = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&(node.name().to_string(), key.clone())) {
                None => Step::NotFound,
                Some(script) => match script.pending.pop_front() {
                    Some(step) => {
                        script.last = Some(step.clone());
                        step
                    }
                    None => script.last.clone().unwrap_or(Step::NotFound),
                },
            }
        };

        step.into_result(node.name(), key)
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    operations: Vec<String>,
    admin_outputs: HashMap<String, CommandOutput>,
    logs: BTreeMap<String, Vec<String>>,
    log_on_start: Vec<(String, String, String)>,
    failures: BTreeSet<String>,
    rows: BTreeMap<String, BTreeSet<(String, String)>>,
    statements: Vec<String>,
    replicate_writes: bool,
}

/// Cluster that exists only as a record of what was asked of it
#[derive(Debug, Clone)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Handoff reported running, writes replicated to every node
    pub fn new() -> Self {
        let mut state = ClusterState {
            replicate_writes: true,
            ..Default::default()
        };
        state.admin_outputs.insert(
            "statushandoff".to_string(),
            CommandOutput::new("Hinted handoff is running\n", ""),
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Collaborator set backed by this cluster
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            control: Arc::new(self.clone()),
            logs: Arc::new(self.clone()),
            sessions: Arc::new(self.clone()),
        }
    }

    /// Output for admin commands whose first argument is `command`
    pub fn set_admin_output(&self, command: &str, output: CommandOutput) {
        self.state.lock().admin_outputs.insert(command.to_string(), output);
    }

    /// Append a line to a node's log
    pub fn emit_log(&self, node: &str, line: &str) {
        self.state
            .lock()
            .logs
            .entry(node.to_string())
            .or_default()
            .push(line.to_string());
    }

    /// When `started` is started, append `line` to `log_node`'s log
    pub fn log_on_start(&self, started: &str, log_node: &str, line: &str) {
        self.state.lock().log_on_start.push((
            started.to_string(),
            log_node.to_string(),
            line.to_string(),
        ));
    }

    /// Fail every operation whose record starts with `prefix`
    pub fn fail_on(&self, prefix: &str) {
        self.state.lock().failures.insert(prefix.to_string());
    }

    /// Keep writes on the node that accepted them only
    pub fn keep_writes_local(&self) {
        self.state.lock().replicate_writes = false;
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    pub fn has_operation(&self, operation: &str) -> bool {
        self.state.lock().operations.iter().any(|op| op == operation)
    }

    /// Every statement executed through any session, as `cql @ CONSISTENCY`
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    fn record(&self, operation: String) -> ProbeResult<()> {
        let mut state = self.state.lock();
        debug!("mock cluster: {}", operation);
        let failed = state.failures.iter().any(|prefix| operation.starts_with(prefix.as_str()));
        state.operations.push(operation.clone());
        if failed {
            return Err(ProbeError::cluster(format!("{} failed", operation)));
        }
        Ok(())
    }

    fn session_for(&self, node: &str) -> MockSession {
        MockSession {
            node: node.to_string(),
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl ClusterControl for MockCluster {
    async fn start_cluster(&self, topology: &Topology) -> ProbeResult<Vec<NodeHandle>> {
        self.record(format!("start_cluster {}", topology.node_count))?;
        Ok((1..=topology.node_count).map(|n| test_node(n as u8)).collect())
    }

    async fn stop_node(&self, node: &NodeHandle, _wait_other_notice: bool) -> ProbeResult<()> {
        self.record(format!("stop {}", node.name()))
    }

    async fn start_node(&self, node: &NodeHandle) -> ProbeResult<()> {
        self.record(format!("start {}", node.name()))?;

        let mut state = self.state.lock();
        let lines: Vec<(String, String)> = state
            .log_on_start
            .iter()
            .filter(|(started, _, _)| started == node.name())
            .map(|(_, log_node, line)| (log_node.clone(), line.clone()))
            .collect();
        for (log_node, line) in lines {
            state.logs.entry(log_node).or_default().push(line);
        }
        Ok(())
    }

    async fn run_admin_command(&self, node: &NodeHandle, args: &[&str]) -> ProbeResult<CommandOutput> {
        self.record(format!("nodetool {} {}", node.name(), args.join(" ")))?;
        let command = args.first().copied().unwrap_or_default();
        Ok(self
            .state
            .lock()
            .admin_outputs
            .get(command)
            .cloned()
            .unwrap_or_default())
    }

    async fn teardown(&self) -> ProbeResult<()> {
        self.record("teardown".to_string())
    }
}

impl MockCluster {
    fn log_matches(&self, node: &str, patterns: &[String], mark: LogMark) -> bool {
        let state = self.state.lock();
        state
            .logs
            .get(node)
            .map(|lines| {
                lines
                    .iter()
                    .skip(mark.offset as usize)
                    .any(|line| patterns.iter().any(|p| line.contains(p.as_str())))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl LogWatcher for MockCluster {
    /// Marks count lines rather than bytes
    async fn mark_log(&self, node: &NodeHandle) -> ProbeResult<LogMark> {
        self.record(format!("mark_log {}", node.name()))?;
        let offset = self
            .state
            .lock()
            .logs
            .get(node.name())
            .map(Vec::len)
            .unwrap_or(0) as u64;
        Ok(LogMark { offset })
    }

    async fn wait_for_log(
        &self,
        node: &NodeHandle,
        patterns: &[String],
        mark: LogMark,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult<bool> {
        self.record(format!("wait_for_log {}", node.name()))?;
        if self.log_matches(node.name(), patterns, mark) {
            return Ok(true);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(ProbeError::cancelled(format!("waiting for {:?} on {}", patterns, node.name())))
            }
            _ = tokio::time::sleep(timeout) => {
                Ok(self.log_matches(node.name(), patterns, mark))
            }
        }
    }
}

#[async_trait]
impl SessionFactory for MockCluster {
    async fn connect(&self, node: &NodeHandle, _keyspace: Option<&str>) -> ProbeResult<Arc<dyn QuerySession>> {
        self.record(format!("connect {}", node.name()))?;
        Ok(Arc::new(self.session_for(node.name())))
    }
}

/// Session that understands the key/c1/c2 workload statements
#[derive(Debug, Clone)]
pub struct MockSession {
    node: String,
    state: Arc<Mutex<ClusterState>>,
}

impl MockSession {
    /// Standalone session against `node1`
    pub fn new() -> Self {
        MockCluster::new().session_for("node1")
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

fn quoted_key(cql: &str) -> Option<String> {
    let start = cql.find("key='")? + "key='".len();
    let end = cql[start..].find('\'')? + start;
    Some(cql[start..end].to_string())
}

fn word_after<'a>(cql: &'a str, keyword: &str) -> Option<&'a str> {
    let start = cql.find(keyword)? + keyword.len();
    cql[start..].split_whitespace().next()
}

#[async_trait]
impl QuerySession for MockSession {
    async fn execute(&self, statement: &str, consistency: ConsistencyLevel) -> ProbeResult<()> {
        let mut state = self.state.lock();
        state.statements.push(format!("{} @ {}", statement, consistency));

        if statement.starts_with("UPDATE ") {
            let table = word_after(statement, "UPDATE ")
                .ok_or_else(|| ProbeError::query(format!("no table in {}", statement)))?
                .to_string();
            let key = quoted_key(statement)
                .ok_or_else(|| ProbeError::query(format!("no key in {}", statement)))?;

            let targets: Vec<String> = if state.replicate_writes {
                let mut nodes: BTreeSet<String> = state.rows.keys().cloned().collect();
                nodes.extend((1..=3).map(|n| format!("node{}", n)));
                nodes.insert(self.node.clone());
                nodes.into_iter().collect()
            } else {
                vec![self.node.clone()]
            };

            for node in targets {
                state
                    .rows
                    .entry(node)
                    .or_default()
                    .insert((table.clone(), key.clone()));
            }
        }
        Ok(())
    }

    async fn select_text(&self, statement: &str, consistency: ConsistencyLevel) -> ProbeResult<Vec<TextRow>> {
        let mut state = self.state.lock();
        state.statements.push(format!("{} @ {}", statement, consistency));

        let table = word_after(statement, "FROM ")
            .ok_or_else(|| ProbeError::query(format!("no table in {}", statement)))?
            .to_string();
        let key = quoted_key(statement)
            .ok_or_else(|| ProbeError::query(format!("no key in {}", statement)))?;

        let present = state
            .rows
            .get(&self.node)
            .map(|rows| rows.contains(&(table, key)))
            .unwrap_or(false);

        if present {
            Ok(vec![vec![Some("value1".to_string()), Some("value2".to_string())]])
        } else {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_sticks_to_last_step() {
        let client = MockMetricsClient::new();
        let key = MetricKey::counter("HintsService", "Hints_created").unwrap();
        let node = test_node(1);
        client.script(
            "node1",
            &key,
            vec![Err(ProbeError::not_found("node1", &key)), Ok(MetricValue::Count(5))],
        );

        assert!(client.fetch(&node, &key).await.unwrap_err().is_not_found());
        assert_eq!(client.fetch(&node, &key).await.unwrap().count(), 5);
        assert_eq!(client.fetch(&node, &key).await.unwrap().count(), 5);
        assert_eq!(client.fetch_count(), 3);

        client.remove("node1", &key);
        assert!(client.fetch(&node, &key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_scripted_errors_keep_their_message() {
        let client = MockMetricsClient::new();
        let key = MetricKey::counter("HintsService", "Hints_created").unwrap();
        client.script("node1", &key, vec![Err(ProbeError::protocol("bad body"))]);

        let err = client.fetch(&test_node(1), &key).await.unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: bad body");
    }

    #[tokio::test]
    async fn test_local_writes_are_not_seen_elsewhere() {
        let cluster = MockCluster::new();
        cluster.keep_writes_local();
        let writer = cluster.connect(&test_node(1), None).await.unwrap();
        let reader = cluster.connect(&test_node(2), None).await.unwrap();

        writer
            .execute("UPDATE cf SET c1='value1', c2='value2' WHERE key='k0'", ConsistencyLevel::One)
            .await
            .unwrap();

        let query = "SELECT c1, c2 FROM cf WHERE key='k0'";
        assert_eq!(writer.select_text(query, ConsistencyLevel::One).await.unwrap().len(), 1);
        assert!(reader.select_text(query, ConsistencyLevel::One).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_on_start() {
        let cluster = MockCluster::new();
        cluster.log_on_start("node2", "node1", "Finished hinted handoff to /127.0.0.2");
        let node1 = test_node(1);
        let patterns = vec!["Finished hinted".to_string()];
        let cancel = CancellationToken::new();

        let mark = cluster.mark_log(&node1).await.unwrap();
        assert!(!cluster
            .wait_for_log(&node1, &patterns, mark, Duration::from_secs(1), &cancel)
            .await
            .unwrap());

        cluster.start_node(&test_node(2)).await.unwrap();
        assert!(cluster
            .wait_for_log(&node1, &patterns, mark, Duration::from_secs(1), &cancel)
            .await
            .unwrap());
    }
}
