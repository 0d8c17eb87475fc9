//! Error types for clusterprobe operations

use thiserror::Error;

use crate::snapshot::MetricsSnapshot;

/// Result type for clusterprobe operations
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Every failure a scenario run can observe, from a single metric read up to
/// the final invariant evaluation.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Management endpoint unreachable on {node}: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("Metric not found on {node}: {key}")]
    NotFound { node: String, key: String },

    #[error("Timed out after {timeout_ms}ms waiting for {waiting_for}")]
    TriggerTimeout { waiting_for: String, timeout_ms: u64 },

    #[error("Metrics did not converge within {timeout_ms}ms ({polls} polls)")]
    ConvergenceTimeout {
        timeout_ms: u64,
        polls: usize,
        regressions: Vec<String>,
        snapshot: Box<MetricsSnapshot>,
    },

    #[error("{} invariant violation(s): {}", .0.len(), .0.join("; "))]
    InvariantViolation(Vec<String>),

    #[error("Cancelled during {stage}")]
    Cancelled {
        stage: String,
        snapshot: Option<Box<MetricsSnapshot>>,
    },

    #[error("Command `{command}` failed on {node}: {detail}")]
    Command {
        node: String,
        command: String,
        detail: String,
    },

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed metric locator: {0}")]
    MalformedLocator(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProbeError {
    /// Create a new unreachable-endpoint error
    pub fn unreachable<N: Into<String>, S: Into<String>>(node: N, reason: S) -> Self {
        Self::Unreachable {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<N: Into<String>, K: ToString>(node: N, key: &K) -> Self {
        Self::NotFound {
            node: node.into(),
            key: key.to_string(),
        }
    }

    /// Create a new trigger timeout error
    pub fn trigger_timeout<S: Into<String>>(waiting_for: S, timeout_ms: u64) -> Self {
        Self::TriggerTimeout {
            waiting_for: waiting_for.into(),
            timeout_ms,
        }
    }

    /// Create a new cancellation error without a partial snapshot
    pub fn cancelled<S: Into<String>>(stage: S) -> Self {
        Self::Cancelled {
            stage: stage.into(),
            snapshot: None,
        }
    }

    /// Create a new command error
    pub fn command<N, C, D>(node: N, command: C, detail: D) -> Self
    where
        N: Into<String>,
        C: Into<String>,
        D: Into<String>,
    {
        Self::Command {
            node: node.into(),
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Create a new cluster error
    pub fn cluster<S: Into<String>>(message: S) -> Self {
        Self::Cluster(message.into())
    }

    /// Create a new query error
    pub fn query<S: Into<String>>(message: S) -> Self {
        Self::Query(message.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a new malformed locator error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedLocator(message.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this error may clear up on a later attempt. A garbled or
    /// out-of-range read is as likely to be transient as a refused connection.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProbeError::Unreachable { .. } | ProbeError::Protocol(_) | ProbeError::Io(_)
        )
    }

    /// Check if this is a metric that simply has not been created yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProbeError::NotFound { .. })
    }

    /// Errors caused by the harness being set up wrong rather than by the
    /// cluster misbehaving. These abort a run instead of being reported.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            ProbeError::MalformedLocator(_) | ProbeError::Configuration(_)
        )
    }

    /// Take the partial snapshot out of errors that carry one
    pub fn into_snapshot(self) -> Option<MetricsSnapshot> {
        match self {
            ProbeError::ConvergenceTimeout { snapshot, .. } => Some(*snapshot),
            ProbeError::Cancelled { snapshot, .. } => snapshot.map(|s| *s),
            _ => None,
        }
    }

    /// Get the error category for logging and reports
    pub fn category(&self) -> &'static str {
        match self {
            ProbeError::Unreachable { .. } => "unreachable",
            ProbeError::NotFound { .. } => "not_found",
            ProbeError::TriggerTimeout { .. } => "trigger_timeout",
            ProbeError::ConvergenceTimeout { .. } => "convergence_timeout",
            ProbeError::InvariantViolation(_) => "invariant_violation",
            ProbeError::Cancelled { .. } => "cancelled",
            ProbeError::Command { .. } => "command",
            ProbeError::Cluster(_) => "cluster",
            ProbeError::Query(_) => "query",
            ProbeError::Protocol(_) => "protocol",
            ProbeError::MalformedLocator(_) => "malformed_locator",
            ProbeError::Configuration(_) => "configuration",
            ProbeError::Io(_) => "io",
            ProbeError::Json(_) => "json",
        }
    }
}
