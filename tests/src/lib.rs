//! End-to-end clusterprobe scenarios
//!
//! Each test creates a real ccm cluster, runs one catalog scenario against
//! it and removes the cluster again. They need `ccm`, a Cassandra build it
//! can install, and the Jolokia agent jar configured through
//! `CLUSTERPROBE_JOLOKIA_AGENT`, so they are ignored by default:
//!
//! ```text
//! cargo test -p clusterprobe-e2e-tests -- --ignored --test-threads=1
//! ```

pub mod common;
pub mod hinted_handoff;
pub mod streaming;
