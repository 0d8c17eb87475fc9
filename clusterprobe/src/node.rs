//! Cluster members and their lifecycle state

use clusterprobe_core::PeerScope;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Starting => write!(f, "starting"),
            NodeState::Running => write!(f, "running"),
        }
    }
}

/// Ports a node listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    /// Internode messaging port; peer-scoped metric names carry this port
    pub storage: u16,
    /// CQL native transport
    pub native: u16,
    /// JMX
    pub jmx: u16,
    /// Jolokia HTTP agent
    pub jolokia: u16,
}

/// Reference to one cluster member.
///
/// Clones share the same lifecycle state, so a handle held by a trigger sees
/// the transitions made through the cluster context.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    name: String,
    address: IpAddr,
    ports: NodePorts,
    jolokia_path: String,
    state: Arc<RwLock<NodeState>>,
}

impl NodeHandle {
    pub fn new<N: Into<String>>(name: N, address: IpAddr, ports: NodePorts) -> Self {
        Self {
            name: name.into(),
            address,
            ports,
            jolokia_path: "/jolokia/".to_string(),
            state: Arc::new(RwLock::new(NodeState::Stopped)),
        }
    }

    /// Override the Jolokia agent path
    pub fn with_jolokia_path<S: Into<String>>(mut self, path: S) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        self.jolokia_path = path;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn ports(&self) -> NodePorts {
        self.ports
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    /// Management endpoint URL, resolved from this node's own address and port
    pub fn management_url(&self) -> String {
        let host = match self.address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        format!("http://{}:{}{}", host, self.ports.jolokia, self.jolokia_path)
    }

    /// How other nodes label metrics that concern this node
    pub fn peer_scope(&self) -> PeerScope {
        PeerScope::new(self.address, self.ports.storage)
    }

    /// CQL contact point
    pub fn native_address(&self) -> String {
        format!("{}:{}", self.address, self.ports.native)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}
