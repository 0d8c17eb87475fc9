//! Cluster shape and configuration requested by a scenario

use clusterprobe_core::{ProbeError, ProbeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node count plus the configuration each node starts with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub node_count: usize,

    /// Use vnodes; when false every node gets one balanced initial token
    pub use_vnodes: bool,

    /// cassandra.yaml options applied to every node
    pub cluster_options: BTreeMap<String, serde_yaml::Value>,

    /// Per-node cassandra.yaml options, indexed by node position
    pub node_options: BTreeMap<usize, BTreeMap<String, serde_yaml::Value>>,

    /// Write a cassandra-topology.properties placing every node in dc1/r1
    pub property_file_snitch: bool,
}

impl Topology {
    /// `node_count` nodes with vnodes and no extra options
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            use_vnodes: true,
            cluster_options: BTreeMap::new(),
            node_options: BTreeMap::new(),
            property_file_snitch: false,
        }
    }

    pub fn with_option<K: Into<String>, V: Into<serde_yaml::Value>>(mut self, key: K, value: V) -> Self {
        self.cluster_options.insert(key.into(), value.into());
        self
    }

    pub fn with_node_option<K: Into<String>, V: Into<serde_yaml::Value>>(
        mut self,
        node: usize,
        key: K,
        value: V,
    ) -> Self {
        self.node_options
            .entry(node)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// One token per node, evenly spread over the Murmur3 ring
    pub fn with_balanced_tokens(mut self) -> Self {
        self.use_vnodes = false;
        self.cluster_options
            .insert("num_tokens".to_string(), serde_yaml::Value::from(1));
        for (idx, token) in balanced_tokens(self.node_count).into_iter().enumerate() {
            self.node_options
                .entry(idx)
                .or_default()
                .insert("initial_token".to_string(), serde_yaml::Value::from(token.to_string()));
        }
        self
    }

    pub fn with_property_file_snitch(mut self) -> Self {
        self.property_file_snitch = true;
        self.cluster_options.insert(
            "endpoint_snitch".to_string(),
            serde_yaml::Value::from("PropertyFileSnitch"),
        );
        self
    }

    /// Effective options for one node: cluster options overlaid with the node's own
    pub fn options_for(&self, node: usize) -> BTreeMap<String, serde_yaml::Value> {
        let mut options = self.cluster_options.clone();
        if let Some(overrides) = self.node_options.get(&node) {
            options.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        options
    }

    /// Reject shapes no cluster can be started with
    pub fn validate(&self) -> ProbeResult<()> {
        if self.node_count == 0 {
            return Err(ProbeError::configuration("topology needs at least one node"));
        }

        if self.node_count > 254 {
            return Err(ProbeError::configuration(format!(
                "topology of {} nodes does not fit in 127.0.0.0/24",
                self.node_count
            )));
        }

        if let Some(idx) = self.node_options.keys().find(|idx| **idx >= self.node_count) {
            return Err(ProbeError::configuration(format!(
                "options given for node index {} but the topology has {} nodes",
                idx, self.node_count
            )));
        }

        Ok(())
    }
}

/// Murmur3 tokens splitting the ring into `count` equal ranges
pub fn balanced_tokens(count: usize) -> Vec<i64> {
    if count == 0 {
        return Vec::new();
    }

    let step = (1i128 << 64) / count as i128;
    (0..count as i128)
        .map(|i| (i * step + i64::MIN as i128) as i64)
        .collect()
}
