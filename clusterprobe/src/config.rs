use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a clusterprobe run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Cluster management (ccm) settings
    pub cluster: ClusterConfig,

    /// CQL session settings
    pub cql: CqlConfig,

    /// Jolokia management endpoint settings
    pub jolokia: JolokiaConfig,

    /// Convergence polling
    pub polling: PollingConfig,

    /// Event trigger timing and workload size
    pub trigger: TriggerConfig,

    /// Whole-run limits
    pub run: RunConfig,

    /// Report output
    pub report: ReportConfig,
}

/// ccm cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Path or name of the ccm executable
    pub ccm_binary: String,

    /// ccm configuration directory (defaults to `~/.ccm`)
    pub ccm_dir: Option<PathBuf>,

    /// Name of the ccm cluster created for each scenario
    pub cluster_name: String,

    /// Cassandra version passed to `ccm create -v`
    pub cassandra_version: Option<String>,

    /// Local Cassandra build passed to `ccm create --install-dir`
    pub install_dir: Option<PathBuf>,

    /// Internode (storage) port every node listens on
    pub storage_port: u16,

    /// Timeout for ccm start/stop commands in milliseconds
    pub command_timeout_ms: u64,

    /// stderr lines matching any of these substrings do not fail a command
    pub tolerated_stderr: Vec<String>,
}

/// CQL session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CqlConfig {
    /// Native transport port
    pub port: u16,

    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,
}

/// Jolokia agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JolokiaConfig {
    /// Port the Jolokia JVM agent listens on, on every node address
    pub port: u16,

    /// Agent path
    pub path: String,

    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Jolokia JVM agent jar attached to every node at start
    pub agent_jar: Option<PathBuf>,
}

/// Convergence polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    /// Give up waiting for metrics after this many milliseconds
    pub timeout_ms: u64,

    /// Delay between snapshots in milliseconds
    pub interval_ms: u64,
}

/// Event trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriggerConfig {
    /// Rows written while the peer is down
    pub rows: usize,

    /// Completion marker wait for full cycles, in milliseconds
    pub completion_timeout_ms: u64,

    /// Completion marker wait for partial cycles, in milliseconds
    pub partial_completion_timeout_ms: u64,

    /// Log line announcing that hint delivery finished
    pub completion_pattern: String,

    /// How often the log tail is re-read, in milliseconds
    pub log_poll_interval_ms: u64,
}

/// Whole-run configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunConfig {
    /// Abort trigger and polling once a run exceeds this many milliseconds
    pub deadline_ms: Option<u64>,
}

/// Report configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory for snapshot dumps
    pub output_dir: PathBuf,

    /// Write the final snapshot of every scenario as YAML
    pub write_snapshot_dump: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            cql: CqlConfig::default(),
            jolokia: JolokiaConfig::default(),
            polling: PollingConfig::default(),
            trigger: TriggerConfig::default(),
            run: RunConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ccm_binary: "ccm".to_string(),
            ccm_dir: None,
            cluster_name: "clusterprobe".to_string(),
            cassandra_version: Some("4.1.5".to_string()),
            install_dir: None,
            storage_port: 7000,
            command_timeout_ms: 300_000,
            tolerated_stderr: vec![
                "Picked up JAVA_TOOL_OPTIONS".to_string(),
                "warning: Debian-based".to_string(),
            ],
        }
    }
}

impl Default for CqlConfig {
    fn default() -> Self {
        Self {
            port: 9042,
            connection_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            username: None,
            password: None,
        }
    }
}

impl Default for JolokiaConfig {
    fn default() -> Self {
        Self {
            port: 8778,
            path: "/jolokia/".to_string(),
            request_timeout_ms: 5_000,
            agent_jar: None,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            interval_ms: 1_000,
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            rows: 100,
            completion_timeout_ms: 120_000,
            partial_completion_timeout_ms: 60_000,
            completion_pattern: "Finished hinted".to_string(),
            log_poll_interval_ms: 250,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("target/clusterprobe"),
            write_snapshot_dump: true,
        }
    }
}

impl ProbeConfig {
    /// Load configuration from file, environment variables, and defaults
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(config_path) = env::var("CLUSTERPROBE_CONFIG") {
            config = Self::load_from_file(&config_path)?;
        } else if std::path::Path::new("config/development.yaml").exists() {
            config = Self::load_from_file("config/development.yaml")?;
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// Override fields from `CLUSTERPROBE_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(binary) = env::var("CLUSTERPROBE_CCM_BINARY") {
            self.cluster.ccm_binary = binary;
        }

        if let Ok(dir) = env::var("CLUSTERPROBE_CCM_DIR") {
            self.cluster.ccm_dir = Some(PathBuf::from(dir));
        }

        if let Ok(name) = env::var("CLUSTERPROBE_CLUSTER_NAME") {
            self.cluster.cluster_name = name;
        }

        if let Ok(version) = env::var("CLUSTERPROBE_CASSANDRA_VERSION") {
            self.cluster.cassandra_version = Some(version);
        }

        if let Ok(install_dir) = env::var("CLUSTERPROBE_INSTALL_DIR") {
            self.cluster.install_dir = Some(PathBuf::from(install_dir));
            self.cluster.cassandra_version = None;
        }

        if let Ok(jar) = env::var("CLUSTERPROBE_JOLOKIA_AGENT") {
            self.jolokia.agent_jar = Some(PathBuf::from(jar));
        }

        if let Ok(port) = env::var("CLUSTERPROBE_JOLOKIA_PORT") {
            self.jolokia.port = port
                .parse()
                .with_context(|| format!("Invalid CLUSTERPROBE_JOLOKIA_PORT: {}", port))?;
        }

        if let Ok(timeout) = env::var("CLUSTERPROBE_POLL_TIMEOUT_MS") {
            self.polling.timeout_ms = timeout
                .parse()
                .with_context(|| format!("Invalid CLUSTERPROBE_POLL_TIMEOUT_MS: {}", timeout))?;
        }

        if let Ok(interval) = env::var("CLUSTERPROBE_POLL_INTERVAL_MS") {
            self.polling.interval_ms = interval
                .parse()
                .with_context(|| format!("Invalid CLUSTERPROBE_POLL_INTERVAL_MS: {}", interval))?;
        }

        if let Ok(rows) = env::var("CLUSTERPROBE_ROWS") {
            self.trigger.rows = rows
                .parse()
                .with_context(|| format!("Invalid CLUSTERPROBE_ROWS: {}", rows))?;
        }

        if let Ok(deadline) = env::var("CLUSTERPROBE_DEADLINE_MS") {
            self.run.deadline_ms = Some(
                deadline
                    .parse()
                    .with_context(|| format!("Invalid CLUSTERPROBE_DEADLINE_MS: {}", deadline))?,
            );
        }

        if let Ok(output_dir) = env::var("CLUSTERPROBE_OUTPUT_DIR") {
            self.report.output_dir = PathBuf::from(output_dir);
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cluster.ccm_binary.is_empty() {
            return Err(anyhow::anyhow!("ccm binary cannot be empty"));
        }

        if self.cluster.cluster_name.is_empty() {
            return Err(anyhow::anyhow!("Cluster name cannot be empty"));
        }

        if self.cluster.cassandra_version.is_none() && self.cluster.install_dir.is_none() {
            return Err(anyhow::anyhow!(
                "Either cluster.cassandra_version or cluster.install_dir is required"
            ));
        }

        if self.polling.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Polling timeout must be greater than 0"));
        }

        if self.polling.interval_ms == 0 {
            return Err(anyhow::anyhow!("Polling interval must be greater than 0"));
        }

        if self.polling.interval_ms > self.polling.timeout_ms {
            return Err(anyhow::anyhow!(
                "Polling interval ({}ms) cannot exceed the polling timeout ({}ms)",
                self.polling.interval_ms,
                self.polling.timeout_ms
            ));
        }

        if self.trigger.rows == 0 {
            return Err(anyhow::anyhow!("Trigger rows must be greater than 0"));
        }

        if self.trigger.completion_timeout_ms == 0 || self.trigger.partial_completion_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Completion timeouts must be greater than 0"));
        }

        if self.trigger.completion_pattern.is_empty() {
            return Err(anyhow::anyhow!("Completion pattern cannot be empty"));
        }

        if self.jolokia.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Jolokia request timeout must be greater than 0"));
        }

        if self.run.deadline_ms == Some(0) {
            return Err(anyhow::anyhow!("Run deadline must be greater than 0 when set"));
        }

        Ok(())
    }

    /// Get the polling timeout as a Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.timeout_ms)
    }

    /// Get the polling interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Get the full-cycle completion timeout as a Duration
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger.completion_timeout_ms)
    }

    /// Get the partial-cycle completion timeout as a Duration
    pub fn partial_completion_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger.partial_completion_timeout_ms)
    }

    /// Get the log re-read interval as a Duration
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.trigger.log_poll_interval_ms)
    }

    /// Get the ccm command timeout as a Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.command_timeout_ms)
    }

    /// Get the Jolokia request timeout as a Duration
    pub fn jolokia_timeout(&self) -> Duration {
        Duration::from_millis(self.jolokia.request_timeout_ms)
    }

    /// Get the run deadline, if any
    pub fn run_deadline(&self) -> Option<Duration> {
        self.run.deadline_ms.map(Duration::from_millis)
    }

    /// Sample configuration file contents
    pub fn sample_yaml() -> Result<String> {
        serde_yaml::to_string(&Self::default()).context("Failed to render sample configuration")
    }
}
