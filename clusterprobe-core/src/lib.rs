//! # clusterprobe core
//!
//! Shared types for the clusterprobe harness: how a metric is addressed on a
//! node's management endpoint, what a reading looks like, immutable snapshots of
//! many readings across nodes, and the error taxonomy used by every stage of a
//! scenario run.
//!
//! ## Layout
//!
//! - **metric**: `MetricKey` and the peer scope it may carry
//! - **value**: `MetricValue` (plain counters and meters with rates)
//! - **snapshot**: point-in-time readings from one or more nodes
//! - **error**: `ProbeError` / `ProbeResult`

pub mod error;
pub mod metric;
pub mod snapshot;
pub mod value;

pub use error::{ProbeError, ProbeResult};
pub use metric::{MetricKey, MetricKind, MetricScope, PeerScope, ScopeEncoding};
pub use snapshot::{MetricsSnapshot, Reading, SnapshotBuilder, SnapshotDump};
pub use value::{MetricValue, RateValue};

/// Version information for clusterprobe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// JMX domain Cassandra registers its metrics under
pub const CASSANDRA_METRICS_DOMAIN: &str = "org.apache.cassandra.metrics";

/// Rate unit reported by Cassandra meters
pub const EVENTS_PER_SECOND: &str = "events/second";

/// Maximum length accepted for any single locator component
pub const MAX_LOCATOR_COMPONENT_LENGTH: usize = 256;
