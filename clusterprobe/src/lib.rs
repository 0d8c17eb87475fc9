//! clusterprobe
//!
//! Drives a local Cassandra cluster through an event (hinted handoff after a
//! node outage, streaming during a repair), reads the metrics each node
//! exposes over its Jolokia endpoint until they settle, and checks them
//! against a flat list of consistency rules.

// Cluster and its collaborators
pub mod ccm;
pub mod cluster;
pub mod context;
pub mod cql;
pub mod log_tail;
pub mod node;
pub mod topology;
pub mod workload;

// Metrics and verification
pub mod invariants;
pub mod jolokia;
pub mod poller;
pub mod runner;
pub mod scenarios;
pub mod trigger;

pub mod config;
pub mod mock;
pub mod report;

// Re-export commonly used types
pub use config::ProbeConfig;
pub use context::{ClusterContext, Collaborators};
pub use invariants::{CheckReport, InvariantChecker};
pub use jolokia::{JolokiaClient, MetricsClient};
pub use poller::{ConvergencePoller, ProbeTarget};
pub use runner::{RunnerPhase, Scenario, ScenarioResult, ScenarioRunner};
pub use trigger::{EventTrigger, TriggerOutcome};
