//! Metric locators and the peer scopes they may carry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{ProbeError, ProbeResult};

/// A remote peer as it appears in a metric scope, e.g. `/127.0.0.2.7000`.
///
/// Cassandra labels per-endpoint metrics with the peer's internode
/// (storage) address and port, not its JMX port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerScope {
    address: IpAddr,
    port: u16,
}

impl PeerScope {
    /// Create a new peer scope
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Peer address
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Peer internode port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Label used inside object names
    pub fn label(&self) -> String {
        format!("/{}.{}", self.address, self.port)
    }
}

impl fmt::Display for PeerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}.{}", self.address, self.port)
    }
}

impl FromStr for PeerScope {
    type Err = ProbeError;

    fn from_str(s: &str) -> ProbeResult<Self> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        let (address, port) = trimmed
            .rsplit_once('.')
            .ok_or_else(|| ProbeError::malformed(format!("peer scope without port: {}", s)))?;

        let address = address
            .parse::<IpAddr>()
            .map_err(|e| ProbeError::malformed(format!("invalid peer address '{}': {}", address, e)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ProbeError::malformed(format!("invalid peer port '{}': {}", port, e)))?;

        Ok(Self::new(address, port))
    }
}

/// Where a peer scope lives inside the object name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeEncoding {
    /// Appended to the name: `name=Hints_created-/127.0.0.2.7000`
    NameSuffix,
    /// A separate property: `scope=/127.0.0.2.7000,name=IncomingBytes`
    ScopeProperty,
}

/// Which attributes a metric exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Counter, or any metric read only through its `Count` attribute
    Counter,
    /// Meter: count plus exponentially weighted rates and a unit
    Meter,
}

impl MetricKind {
    /// Attributes read from the management endpoint for this kind
    pub fn attributes(&self) -> &'static [&'static str] {
        match self {
            MetricKind::Counter => &["Count"],
            MetricKind::Meter => &[
                "Count",
                "MeanRate",
                "OneMinuteRate",
                "FiveMinuteRate",
                "FifteenMinuteRate",
                "RateUnit",
            ],
        }
    }
}

/// Peer scope together with its encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricScope {
    pub peer: PeerScope,
    pub encoding: ScopeEncoding,
}

/// Unique address of one metric on a node's management endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    domain: String,
    metric_type: String,
    name: String,
    scope: Option<MetricScope>,
    kind: MetricKind,
}

impl MetricKey {
    /// Create a new unscoped key in the Cassandra metrics domain
    pub fn new<T, N>(metric_type: T, name: N, kind: MetricKind) -> ProbeResult<Self>
    where
        T: Into<String>,
        N: Into<String>,
    {
        let metric_type = metric_type.into();
        let name = name.into();

        validate_component("type", &metric_type)?;
        validate_component("name", &name)?;

        Ok(Self {
            domain: crate::CASSANDRA_METRICS_DOMAIN.to_string(),
            metric_type,
            name,
            scope: None,
            kind,
        })
    }

    /// Create a counter key
    pub fn counter<T: Into<String>, N: Into<String>>(metric_type: T, name: N) -> ProbeResult<Self> {
        Self::new(metric_type, name, MetricKind::Counter)
    }

    /// Create a meter key
    pub fn meter<T: Into<String>, N: Into<String>>(metric_type: T, name: N) -> ProbeResult<Self> {
        Self::new(metric_type, name, MetricKind::Meter)
    }

    /// Replace the JMX domain
    pub fn with_domain<S: Into<String>>(mut self, domain: S) -> ProbeResult<Self> {
        let domain = domain.into();
        validate_component("domain", &domain)?;
        self.domain = domain;
        Ok(self)
    }

    /// Scope this key to a remote peer
    pub fn scoped(mut self, peer: PeerScope, encoding: ScopeEncoding) -> Self {
        self.scope = Some(MetricScope { peer, encoding });
        self
    }

    /// The same metric without its peer scope: the node-global aggregate
    pub fn unscoped(&self) -> Self {
        Self {
            scope: None,
            ..self.clone()
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Peer this key is scoped to, if any
    pub fn peer(&self) -> Option<PeerScope> {
        self.scope.map(|s| s.peer)
    }

    pub fn scope(&self) -> Option<&MetricScope> {
        self.scope.as_ref()
    }

    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Metric family: scoped and unscoped keys of one family share it
    pub fn family(&self) -> (&str, &str, &str) {
        (&self.domain, &self.metric_type, &self.name)
    }

    /// Render the JMX object name used to read this metric
    pub fn object_name(&self) -> String {
        match &self.scope {
            None => format!("{}:type={},name={}", self.domain, self.metric_type, self.name),
            Some(MetricScope {
                peer,
                encoding: ScopeEncoding::NameSuffix,
            }) => format!(
                "{}:type={},name={}-{}",
                self.domain, self.metric_type, self.name, peer
            ),
            Some(MetricScope {
                peer,
                encoding: ScopeEncoding::ScopeProperty,
            }) => format!(
                "{}:type={},scope={},name={}",
                self.domain, self.metric_type, peer, self.name
            ),
        }
    }

    /// Parse a JMX object name back into a key
    pub fn parse(object_name: &str, kind: MetricKind) -> ProbeResult<Self> {
        let (domain, properties) = object_name
            .split_once(':')
            .ok_or_else(|| ProbeError::malformed(format!("missing domain in '{}'", object_name)))?;

        let mut metric_type = None;
        let mut name = None;
        let mut scope = None;

        for property in properties.split(',') {
            let (key, value) = property.split_once('=').ok_or_else(|| {
                ProbeError::malformed(format!("property without value in '{}'", object_name))
            })?;
            match key.trim() {
                "type" => metric_type = Some(value.trim()),
                "name" => name = Some(value.trim()),
                "scope" => scope = Some(value.trim()),
                other => {
                    return Err(ProbeError::malformed(format!(
                        "unsupported property '{}' in '{}'",
                        other, object_name
                    )))
                }
            }
        }

        let metric_type = metric_type
            .ok_or_else(|| ProbeError::malformed(format!("missing type in '{}'", object_name)))?;
        let name = name
            .ok_or_else(|| ProbeError::malformed(format!("missing name in '{}'", object_name)))?;

        let key = match (scope, name.rsplit_once("-/")) {
            (Some(scope), _) => Self::new(metric_type, name, kind)?
                .scoped(scope.parse()?, ScopeEncoding::ScopeProperty),
            (None, Some((base, peer))) => Self::new(metric_type, base, kind)?
                .scoped(format!("/{}", peer).parse()?, ScopeEncoding::NameSuffix),
            (None, None) => Self::new(metric_type, name, kind)?,
        };

        key.with_domain(domain)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_name())
    }
}

fn validate_component(what: &str, value: &str) -> ProbeResult<()> {
    if value.is_empty() {
        return Err(ProbeError::malformed(format!("metric {} cannot be empty", what)));
    }

    if value.len() > crate::MAX_LOCATOR_COMPONENT_LENGTH {
        return Err(ProbeError::malformed(format!(
            "metric {} too long: {} > {}",
            what,
            value.len(),
            crate::MAX_LOCATOR_COMPONENT_LENGTH
        )));
    }

    if value
        .chars()
        .any(|c| matches!(c, ',' | '=' | ':' | '"' | '*' | '?') || c.is_whitespace())
    {
        return Err(ProbeError::malformed(format!(
            "metric {} contains reserved characters: {}",
            what, value
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node2() -> PeerScope {
        PeerScope::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 7000)
    }

    #[test]
    fn test_peer_scope_label() {
        assert_eq!(node2().label(), "/127.0.0.2.7000");
        assert_eq!("/127.0.0.2.7000".parse::<PeerScope>().unwrap(), node2());
        assert!("/127.0.0.2".parse::<PeerScope>().is_err());
        assert!("nonsense".parse::<PeerScope>().is_err());
    }

    #[test]
    fn test_object_name_unscoped() {
        let key = MetricKey::meter("HintsService", "HintsSucceeded").unwrap();
        assert_eq!(
            key.object_name(),
            "org.apache.cassandra.metrics:type=HintsService,name=HintsSucceeded"
        );
        assert!(!key.is_scoped());
    }

    #[test]
    fn test_object_name_name_suffix() {
        let key = MetricKey::counter("HintsService", "Hints_created")
            .unwrap()
            .scoped(node2(), ScopeEncoding::NameSuffix);
        assert_eq!(
            key.object_name(),
            "org.apache.cassandra.metrics:type=HintsService,name=Hints_created-/127.0.0.2.7000"
        );
        assert_eq!(key.peer(), Some(node2()));
    }

    #[test]
    fn test_object_name_scope_property() {
        let key = MetricKey::counter("Streaming", "IncomingBytes")
            .unwrap()
            .scoped(node2(), ScopeEncoding::ScopeProperty);
        assert_eq!(
            key.object_name(),
            "org.apache.cassandra.metrics:type=Streaming,scope=/127.0.0.2.7000,name=IncomingBytes"
        );
    }

    #[test]
    fn test_parse_recovers_scope_encoding() {
        let suffixed = MetricKey::parse(
            "org.apache.cassandra.metrics:type=HintsService,name=Hint_delays-/127.0.0.2.7000",
            MetricKind::Counter,
        )
        .unwrap();
        assert_eq!(suffixed.name(), "Hint_delays");
        assert_eq!(
            suffixed.scope().map(|s| s.encoding),
            Some(ScopeEncoding::NameSuffix)
        );

        let property = MetricKey::parse(
            "org.apache.cassandra.metrics:type=Streaming,scope=/127.0.0.2.7000,name=OutgoingBytes",
            MetricKind::Counter,
        )
        .unwrap();
        assert_eq!(property.peer(), Some(node2()));
        assert_eq!(
            property.scope().map(|s| s.encoding),
            Some(ScopeEncoding::ScopeProperty)
        );
    }

    #[test]
    fn test_parse_rejects_malformed_locators() {
        assert!(MetricKey::parse("no-domain", MetricKind::Counter).is_err());
        assert!(MetricKey::parse("d:name=x", MetricKind::Counter).is_err());
        assert!(MetricKey::parse("d:type=x", MetricKind::Counter).is_err());
        assert!(MetricKey::parse("d:type=x,name=y,keyspace=z", MetricKind::Counter).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(MetricKey::counter("", "x").is_err());
        assert!(MetricKey::counter("Streaming", "with space").is_err());
        assert!(MetricKey::counter("Streaming", "a,b").is_err());
        assert!(MetricKey::counter("Streaming", "x".repeat(300)).is_err());
    }

    #[test]
    fn test_unscoped_shares_family() {
        let scoped = MetricKey::counter("HintsService", "Hint_delays")
            .unwrap()
            .scoped(node2(), ScopeEncoding::NameSuffix);
        let aggregate = scoped.unscoped();
        assert_eq!(scoped.family(), aggregate.family());
        assert_ne!(scoped, aggregate);
        assert!(!aggregate.is_scoped());
    }

    #[test]
    fn test_meter_attributes() {
        assert_eq!(MetricKind::Counter.attributes(), &["Count"]);
        assert!(MetricKind::Meter.attributes().contains(&"RateUnit"));
    }
}
