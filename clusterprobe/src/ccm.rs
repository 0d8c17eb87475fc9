//! Cluster lifecycle backed by the `ccm` command line tool

use async_trait::async_trait;
use clusterprobe_core::{ProbeError, ProbeResult};
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterControl, CommandOutput, LogMark, LogWatcher};
use crate::config::ProbeConfig;
use crate::log_tail::LogTail;
use crate::node::{NodeHandle, NodePorts};
use crate::topology::Topology;

/// Drives a local ccm cluster on 127.0.0.0/24
pub struct CcmCluster {
    config: ProbeConfig,
    ccm_dir: PathBuf,
    nodes: RwLock<Vec<NodeHandle>>,
}

impl CcmCluster {
    pub fn new(config: ProbeConfig) -> Self {
        let ccm_dir = config.cluster.ccm_dir.clone().unwrap_or_else(default_ccm_dir);
        Self {
            config,
            ccm_dir,
            nodes: RwLock::new(Vec::new()),
        }
    }

    fn cluster_dir(&self) -> PathBuf {
        self.ccm_dir.join(&self.config.cluster.cluster_name)
    }

    fn node_dir(&self, node: &str) -> PathBuf {
        self.cluster_dir().join(node)
    }

    /// Path of a node's system.log
    pub fn log_path(&self, node: &NodeHandle) -> PathBuf {
        self.node_dir(node.name()).join("logs").join("system.log")
    }

    fn handle_for(&self, idx: usize) -> NodeHandle {
        let n = idx + 1;
        NodeHandle::new(
            format!("node{}", n),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, n as u8)),
            NodePorts {
                storage: self.config.cluster.storage_port,
                native: self.config.cql.port,
                jmx: 7000 + 100 * n as u16,
                jolokia: self.config.jolokia.port,
            },
        )
        .with_jolokia_path(self.config.jolokia.path.clone())
    }

    async fn ccm(&self, args: &[String], extra_env: &[(String, String)]) -> ProbeResult<CommandOutput> {
        let mut command = Command::new(&self.config.cluster.ccm_binary);
        command
            .args(args)
            .env("CCM_CONFIG_DIR", &self.ccm_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let rendered = args.join(" ");
        debug!("ccm {}", rendered);

        let child = command
            .spawn()
            .map_err(|e| ProbeError::cluster(format!("failed to spawn ccm {}: {}", rendered, e)))?;

        let output = match timeout(self.config.command_timeout(), child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProbeError::cluster(format!(
                    "ccm {} did not finish within {:?}",
                    rendered,
                    self.config.command_timeout()
                )))
            }
        };

        let result = CommandOutput::new(
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );

        if !output.status.success() {
            return Err(ProbeError::command(
                "ccm",
                rendered,
                format!("exit status {}: {}", output.status, result.stderr.trim()),
            ));
        }

        Ok(result)
    }

    fn jolokia_env(&self, node: &NodeHandle) -> Vec<(String, String)> {
        match &self.config.jolokia.agent_jar {
            Some(jar) => vec![(
                "JVM_EXTRA_OPTS".to_string(),
                format!(
                    "-javaagent:{}=port={},host={}",
                    jar.display(),
                    node.ports().jolokia,
                    node.address()
                ),
            )],
            None => Vec::new(),
        }
    }

    async fn update_conf(&self, node: Option<&str>, options: Vec<(String, serde_yaml::Value)>) -> ProbeResult<()> {
        if options.is_empty() {
            return Ok(());
        }

        let mut args: Vec<String> = node.map(|n| vec![n.to_string()]).unwrap_or_default();
        args.push("updateconf".to_string());
        for (key, value) in options {
            args.push(format!("{}: {}", key, yaml_scalar(&value)?));
        }
        self.ccm(&args, &[]).await.map(|_| ())
    }

    async fn write_topology_properties(&self, nodes: &[NodeHandle]) -> ProbeResult<()> {
        let mut properties = String::new();
        for node in nodes {
            properties.push_str(&format!("{}=dc1:r1\n", node.address()));
        }
        properties.push_str("default=dc1:r1\n");

        for node in nodes {
            let path = self.node_dir(node.name()).join("conf").join("cassandra-topology.properties");
            tokio::fs::write(&path, &properties).await?;
        }
        Ok(())
    }

    /// Block until every other running node reports `node` as down
    async fn wait_other_notice(&self, node: &NodeHandle) -> ProbeResult<()> {
        let others: Vec<NodeHandle> = self
            .nodes
            .read()
            .iter()
            .filter(|n| n.name() != node.name() && n.is_running())
            .cloned()
            .collect();

        let deadline = Instant::now() + self.config.command_timeout();
        let address = node.address().to_string();

        for other in others {
            loop {
                let output = self
                    .run_admin_command(&other, &["status"])
                    .await?;
                let down = output
                    .stdout
                    .lines()
                    .any(|line| line.starts_with("DN") && line.split_whitespace().nth(1) == Some(address.as_str()));
                if down {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(ProbeError::cluster(format!(
                        "{} never saw {} go down",
                        other.name(),
                        node.name()
                    )));
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        Ok(())
    }

    /// Stop every node and delete the cluster
    async fn remove_cluster(&self) -> ProbeResult<()> {
        let name = self.config.cluster.cluster_name.clone();
        if let Err(e) = self.ccm(&["stop".to_string(), name.clone()], &[]).await {
            warn!("Stopping cluster '{}' failed: {}", name, e);
        }
        self.ccm(&["remove".to_string(), name], &[]).await?;
        self.nodes.write().clear();
        Ok(())
    }

    /// Everything after `ccm create`: nodes, configuration and startup
    async fn build_cluster(&self, topology: &Topology) -> ProbeResult<Vec<NodeHandle>> {
        let mut populate = vec![
            "populate".to_string(),
            "-n".to_string(),
            topology.node_count.to_string(),
        ];
        if topology.use_vnodes {
            populate.push("--vnodes".to_string());
        }
        self.ccm(&populate, &[]).await?;

        self.update_conf(None, topology.cluster_options.clone().into_iter().collect())
            .await?;

        let nodes: Vec<NodeHandle> = (0..topology.node_count).map(|idx| self.handle_for(idx)).collect();

        for (idx, node) in nodes.iter().enumerate() {
            if let Some(options) = topology.node_options.get(&idx) {
                self.update_conf(Some(node.name()), options.clone().into_iter().collect())
                    .await?;
            }
        }

        if topology.property_file_snitch {
            self.write_topology_properties(&nodes).await?;
        }

        for node in &nodes {
            let args = vec![
                node.name().to_string(),
                "start".to_string(),
                "--wait-for-binary-proto".to_string(),
            ];
            self.ccm(&args, &self.jolokia_env(node)).await?;
        }

        *self.nodes.write() = nodes.clone();
        Ok(nodes)
    }
}

#[async_trait]
impl ClusterControl for CcmCluster {
    /// A cluster that fails to come up after `ccm create` is removed again
    /// before the error is returned.
    async fn start_cluster(&self, topology: &Topology) -> ProbeResult<Vec<NodeHandle>> {
        let cluster = &self.config.cluster;
        info!(
            "Creating ccm cluster '{}' with {} nodes",
            cluster.cluster_name, topology.node_count
        );

        let mut create = vec!["create".to_string(), cluster.cluster_name.clone()];
        if let Some(install_dir) = &cluster.install_dir {
            create.push("--install-dir".to_string());
            create.push(install_dir.display().to_string());
        } else if let Some(version) = &cluster.cassandra_version {
            create.push("-v".to_string());
            create.push(version.clone());
        }
        self.ccm(&create, &[]).await?;

        match self.build_cluster(topology).await {
            Ok(nodes) => Ok(nodes),
            Err(e) => {
                warn!("Cluster '{}' failed to start, removing it: {}", cluster.cluster_name, e);
                if let Err(cleanup) = self.remove_cluster().await {
                    warn!("Removing cluster '{}' failed: {}", cluster.cluster_name, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn stop_node(&self, node: &NodeHandle, wait_other_notice: bool) -> ProbeResult<()> {
        self.ccm(&[node.name().to_string(), "stop".to_string()], &[]).await?;
        if wait_other_notice {
            self.wait_other_notice(node).await?;
        }
        Ok(())
    }

    async fn start_node(&self, node: &NodeHandle) -> ProbeResult<()> {
        let args = vec![
            node.name().to_string(),
            "start".to_string(),
            "--wait-for-binary-proto".to_string(),
        ];
        self.ccm(&args, &self.jolokia_env(node)).await.map(|_| ())
    }

    async fn run_admin_command(&self, node: &NodeHandle, args: &[&str]) -> ProbeResult<CommandOutput> {
        let mut full = vec![node.name().to_string(), "nodetool".to_string()];
        full.push(args.join(" "));
        self.ccm(&full, &[]).await
    }

    async fn teardown(&self) -> ProbeResult<()> {
        self.remove_cluster().await
    }
}

#[async_trait]
impl LogWatcher for CcmCluster {
    async fn mark_log(&self, node: &NodeHandle) -> ProbeResult<LogMark> {
        LogTail::new(self.log_path(node), self.config.log_poll_interval())
            .mark()
            .await
    }

    async fn wait_for_log(
        &self,
        node: &NodeHandle,
        patterns: &[String],
        mark: LogMark,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeResult<bool> {
        LogTail::new(self.log_path(node), self.config.log_poll_interval())
            .wait_for(patterns, mark, timeout, cancel)
            .await
    }
}

fn default_ccm_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ccm")
}

/// Render a scalar option the way `ccm updateconf` expects it
fn yaml_scalar(value: &serde_yaml::Value) -> ProbeResult<String> {
    match value {
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => Err(ProbeError::configuration(format!(
            "only scalar cassandra.yaml options are supported, got {:?}",
            other
        ))),
    }
}
