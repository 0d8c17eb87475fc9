//! Rules evaluated against a settled snapshot
//!
//! Every rule is evaluated on every check; a failing rule never hides the
//! ones after it. Rules that only apply under some condition (the
//! conservation and zero-activity rules) report themselves as skipped when
//! the condition does not hold.

use clusterprobe_core::{
    MetricKey, MetricsSnapshot, PeerScope, ProbeResult, ScopeEncoding, EVENTS_PER_SECOND,
};
use serde::Serialize;
use tracing::{debug, warn};

const HINTS: &str = "HintsService";
const STREAMING: &str = "Streaming";

/// One named consistency rule
pub trait Invariant: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the rule has anything to say about this snapshot
    fn applies(&self, _snapshot: &MetricsSnapshot) -> bool {
        true
    }

    /// `Err` carries one diagnostic describing every broken clause
    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String>;
}

/// Meters in the given families must report the expected rate unit
pub struct RateUnitRule {
    node: String,
    keys: Vec<MetricKey>,
    unit: String,
}

impl RateUnitRule {
    pub fn new<N: Into<String>>(node: N, keys: Vec<MetricKey>) -> Self {
        Self {
            node: node.into(),
            keys,
            unit: EVENTS_PER_SECOND.to_string(),
        }
    }
}

impl Invariant for RateUnitRule {
    fn name(&self) -> &str {
        "rate-unit"
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        let mut problems = Vec::new();

        for key in &self.keys {
            match snapshot.get(&self.node, key) {
                // not created yet, nothing to check
                None => {}
                Some(value) => match value.unit() {
                    Some(unit) if unit == self.unit => {}
                    Some(unit) => problems.push(format!(
                        "{} on {} reports unit '{}', expected '{}'",
                        key.name(),
                        self.node,
                        unit,
                        self.unit
                    )),
                    None => problems.push(format!(
                        "{} on {} is not a rate metric",
                        key.name(),
                        self.node
                    )),
                },
            }
        }

        verdict(problems)
    }
}

/// Every rate must be finite and at least zero
pub struct NonNegativityRule;

impl Invariant for NonNegativityRule {
    fn name(&self) -> &str {
        "non-negativity"
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        let mut problems = Vec::new();

        for (node, key, reading) in snapshot.iter() {
            let Some(rate) = reading.value().and_then(|v| v.as_rate()) else {
                continue;
            };
            for (label, value) in rate.rates() {
                if !value.is_finite() || value < 0.0 {
                    problems.push(format!("{} {} on {} is {}", key.name(), label, node, value));
                }
            }
        }

        verdict(problems)
    }
}

/// A node-wide aggregate is at least the sum of its peer-scoped parts
pub struct AggregateConsistencyRule {
    node: String,
    aggregate: MetricKey,
    members: Option<Vec<MetricKey>>,
}

impl AggregateConsistencyRule {
    /// Compare against explicitly named members
    pub fn new<N: Into<String>>(node: N, aggregate: MetricKey, members: Vec<MetricKey>) -> Self {
        Self {
            node: node.into(),
            aggregate,
            members: Some(members),
        }
    }

    /// Compare against every peer-scoped reading sharing the aggregate's name
    pub fn same_family<N: Into<String>>(node: N, aggregate: MetricKey) -> Self {
        Self {
            node: node.into(),
            aggregate,
            members: None,
        }
    }
}

impl Invariant for AggregateConsistencyRule {
    fn name(&self) -> &str {
        "aggregate-consistency"
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        let total = snapshot.count(&self.node, &self.aggregate);

        let parts: Vec<(String, u64)> = match &self.members {
            Some(members) => members
                .iter()
                .map(|key| (key.to_string(), snapshot.count(&self.node, key)))
                .collect(),
            None => snapshot
                .scoped_members(&self.node, &self.aggregate)
                .into_iter()
                .map(|(key, reading)| (key.to_string(), reading.count()))
                .collect(),
        };

        let sum: u64 = parts.iter().map(|(_, count)| count).sum();
        if total >= sum {
            return Ok(());
        }

        let listing: Vec<String> = parts
            .iter()
            .map(|(key, count)| format!("{}={}", key, count))
            .collect();
        Err(format!(
            "{} on {} is {} but its peer-scoped parts sum to {} ({})",
            self.aggregate,
            self.node,
            total,
            sum,
            listing.join(", ")
        ))
    }
}

/// Hint metric keys as seen from the node holding hints for `peer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintMetrics {
    pub created: MetricKey,
    pub succeeded: MetricKey,
    pub failed: MetricKey,
    pub timed_out: MetricKey,
    pub delays: MetricKey,
    pub peer_delays: MetricKey,
}

impl HintMetrics {
    pub fn for_peer(peer: PeerScope) -> ProbeResult<Self> {
        Ok(Self {
            created: MetricKey::counter(HINTS, "Hints_created")?.scoped(peer, ScopeEncoding::NameSuffix),
            succeeded: MetricKey::meter(HINTS, "HintsSucceeded")?,
            failed: MetricKey::meter(HINTS, "HintsFailed")?,
            timed_out: MetricKey::meter(HINTS, "HintsTimedOut")?,
            delays: MetricKey::counter(HINTS, "Hint_delays")?,
            peer_delays: MetricKey::counter(HINTS, "Hint_delays")?.scoped(peer, ScopeEncoding::NameSuffix),
        })
    }

    pub fn meters(&self) -> Vec<MetricKey> {
        vec![self.succeeded.clone(), self.failed.clone(), self.timed_out.clone()]
    }

    pub fn all_keys(&self) -> Vec<MetricKey> {
        vec![
            self.succeeded.clone(),
            self.failed.clone(),
            self.timed_out.clone(),
            self.created.clone(),
            self.delays.clone(),
            self.peer_delays.clone(),
        ]
    }

    /// Every hint created for the peer has been accounted for
    pub fn settled(&self, node: &str, snapshot: &MetricsSnapshot) -> bool {
        let created = snapshot.count(node, &self.created);
        created > 0
            && snapshot.count(node, &self.succeeded) + snapshot.count(node, &self.failed) >= created
    }

    /// Standard rule set for hints held on `node`
    pub fn checker(&self, node: &str) -> InvariantChecker {
        InvariantChecker::new()
            .with_rule(RateUnitRule::new(node, self.meters()))
            .with_rule(NonNegativityRule)
            .with_rule(AggregateConsistencyRule::same_family(node, self.delays.clone()))
            .with_rule(ConservationRule::new(node, self.clone()))
            .with_rule(ZeroActivityRule::new(node, self.clone()))
    }
}

/// Hints created for a peer are either delivered or failed
pub struct ConservationRule {
    node: String,
    hints: HintMetrics,
}

impl ConservationRule {
    pub fn new<N: Into<String>>(node: N, hints: HintMetrics) -> Self {
        Self {
            node: node.into(),
            hints,
        }
    }
}

impl Invariant for ConservationRule {
    fn name(&self) -> &str {
        "conservation"
    }

    fn applies(&self, snapshot: &MetricsSnapshot) -> bool {
        snapshot.count(&self.node, &self.hints.created) > 0
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        let count = |key: &MetricKey| snapshot.count(&self.node, key);
        let created = count(&self.hints.created);
        let succeeded = count(&self.hints.succeeded);
        let failed = count(&self.hints.failed);
        let timed_out = count(&self.hints.timed_out);

        let mut problems = Vec::new();

        if succeeded + failed != created {
            problems.push(format!(
                "succeeded ({}) + failed ({}) != created ({})",
                succeeded, failed, created
            ));
        }

        if timed_out > failed {
            problems.push(format!(
                "timed out ({}) exceeds failed ({})",
                timed_out, failed
            ));
        }

        verdict(problems)
    }
}

/// Without hints created for the peer, nothing was delivered or failed
pub struct ZeroActivityRule {
    node: String,
    hints: HintMetrics,
}

impl ZeroActivityRule {
    pub fn new<N: Into<String>>(node: N, hints: HintMetrics) -> Self {
        Self {
            node: node.into(),
            hints,
        }
    }
}

impl Invariant for ZeroActivityRule {
    fn name(&self) -> &str {
        "zero-activity"
    }

    fn applies(&self, snapshot: &MetricsSnapshot) -> bool {
        snapshot.count(&self.node, &self.hints.created) == 0
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        let problems: Vec<String> = [
            ("succeeded", &self.hints.succeeded),
            ("failed", &self.hints.failed),
            ("timed out", &self.hints.timed_out),
        ]
        .into_iter()
        .filter_map(|(label, key)| {
            let count = snapshot.count(&self.node, key);
            (count != 0).then(|| format!("{} is {} with no hints created", label, count))
        })
        .collect();

        verdict(problems)
    }
}

/// Every listed key must have counted something
pub struct PositiveCountRule {
    node: String,
    keys: Vec<MetricKey>,
}

impl PositiveCountRule {
    pub fn new<N: Into<String>>(node: N, keys: Vec<MetricKey>) -> Self {
        Self {
            node: node.into(),
            keys,
        }
    }
}

impl Invariant for PositiveCountRule {
    fn name(&self) -> &str {
        "positive-count"
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        let problems: Vec<String> = self
            .keys
            .iter()
            .filter(|key| snapshot.count(&self.node, key) == 0)
            .map(|key| {
                let state = if snapshot.is_absent(&self.node, key) { "absent" } else { "0" };
                format!("{} on {} is {}", key, self.node, state)
            })
            .collect();

        verdict(problems)
    }
}

/// Streaming metric keys on one node for traffic with `peer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingMetrics {
    pub incoming_bytes: MetricKey,
    pub outgoing_bytes: MetricKey,
    pub total_incoming_bytes: MetricKey,
    pub total_outgoing_bytes: MetricKey,
    pub total_outgoing_repair_bytes: MetricKey,
    pub total_outgoing_repair_sstables: MetricKey,
}

impl StreamingMetrics {
    pub fn for_peer(peer: PeerScope) -> ProbeResult<Self> {
        let counter = |name: &str| MetricKey::counter(STREAMING, name);
        Ok(Self {
            incoming_bytes: counter("IncomingBytes")?.scoped(peer, ScopeEncoding::ScopeProperty),
            outgoing_bytes: counter("OutgoingBytes")?.scoped(peer, ScopeEncoding::ScopeProperty),
            total_incoming_bytes: counter("TotalIncomingBytes")?,
            total_outgoing_bytes: counter("TotalOutgoingBytes")?,
            total_outgoing_repair_bytes: counter("TotalOutgoingRepairBytes")?,
            total_outgoing_repair_sstables: counter("TotalOutgoingRepairSSTables")?,
        })
    }

    pub fn all_keys(&self) -> Vec<MetricKey> {
        vec![
            self.incoming_bytes.clone(),
            self.outgoing_bytes.clone(),
            self.total_incoming_bytes.clone(),
            self.total_outgoing_bytes.clone(),
            self.total_outgoing_repair_bytes.clone(),
            self.total_outgoing_repair_sstables.clone(),
        ]
    }

    /// Every streaming counter has moved
    pub fn settled(&self, node: &str, snapshot: &MetricsSnapshot) -> bool {
        self.all_keys().iter().all(|key| snapshot.count(node, key) > 0)
    }

    /// Standard rule set for streaming observed on `node`
    pub fn checker(&self, node: &str) -> InvariantChecker {
        InvariantChecker::new()
            .with_rule(NonNegativityRule)
            .with_rule(PositiveCountRule::new(node, self.all_keys()))
            .with_rule(AggregateConsistencyRule::new(
                node,
                self.total_incoming_bytes.clone(),
                vec![self.incoming_bytes.clone()],
            ))
            .with_rule(AggregateConsistencyRule::new(
                node,
                self.total_outgoing_bytes.clone(),
                vec![self.outgoing_bytes.clone()],
            ))
    }
}

/// A rule that failed and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

/// Outcome of evaluating every rule once
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckReport {
    pub evaluated: Vec<String>,
    pub skipped: Vec<String>,
    pub violations: Vec<Violation>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// One line per violation, in rule order
    pub fn failure_reasons(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Flat, ordered list of rules
#[derive(Default)]
pub struct InvariantChecker {
    rules: Vec<Box<dyn Invariant>>,
}

impl InvariantChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule<R: Invariant + 'static>(mut self, rule: R) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn check(&self, snapshot: &MetricsSnapshot) -> CheckReport {
        let mut report = CheckReport::default();

        for rule in &self.rules {
            if !rule.applies(snapshot) {
                debug!("Rule {} does not apply", rule.name());
                report.skipped.push(rule.name().to_string());
                continue;
            }

            report.evaluated.push(rule.name().to_string());
            if let Err(message) = rule.check(snapshot) {
                warn!("Rule {} failed: {}", rule.name(), message);
                report.violations.push(Violation {
                    rule: rule.name().to_string(),
                    message,
                });
            }
        }

        report
    }
}

fn verdict(problems: Vec<String>) -> Result<(), String> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterprobe_core::{MetricValue, RateValue, SnapshotBuilder};
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> PeerScope {
        PeerScope::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 7000)
    }

    fn meter(count: u64, unit: &str) -> MetricValue {
        MetricValue::Rate(RateValue {
            count,
            mean_rate: 0.4,
            one_minute_rate: 0.3,
            five_minute_rate: 0.2,
            fifteen_minute_rate: 0.1,
            unit: unit.to_string(),
        })
    }

    fn hint_snapshot(created: u64, succeeded: u64, failed: u64, timed_out: u64) -> MetricsSnapshot {
        let hints = HintMetrics::for_peer(peer()).unwrap();
        let mut builder = SnapshotBuilder::new();
        builder
            .record("node1", hints.created.clone(), MetricValue::Count(created))
            .record("node1", hints.succeeded.clone(), meter(succeeded, EVENTS_PER_SECOND))
            .record("node1", hints.failed.clone(), meter(failed, EVENTS_PER_SECOND))
            .record("node1", hints.timed_out.clone(), meter(timed_out, EVENTS_PER_SECOND))
            .record("node1", hints.delays.clone(), MetricValue::Count(created))
            .record("node1", hints.peer_delays.clone(), MetricValue::Count(created));
        builder.build()
    }

    fn checker() -> InvariantChecker {
        HintMetrics::for_peer(peer()).unwrap().checker("node1")
    }

    #[test]
    fn test_completed_handoff_passes() {
        let report = checker().check(&hint_snapshot(100, 100, 0, 0));
        assert!(report.passed(), "{:?}", report.violations);
        assert!(report.evaluated.contains(&"conservation".to_string()));
        assert_eq!(report.skipped, vec!["zero-activity".to_string()]);
    }

    #[test]
    fn test_failures_account_for_missing_deliveries() {
        let report = checker().check(&hint_snapshot(100, 90, 10, 4));
        assert!(report.passed(), "{:?}", report.violations);
    }

    #[test]
    fn test_conservation_reports_every_clause() {
        let report = checker().check(&hint_snapshot(100, 80, 5, 7));
        assert_eq!(report.violations.len(), 1);
        let message = &report.violations[0].message;
        assert!(message.contains("succeeded (80) + failed (5) != created (100)"));
        assert!(message.contains("timed out (7) exceeds failed (5)"));
    }

    #[test]
    fn test_zero_activity() {
        let report = checker().check(&hint_snapshot(0, 0, 0, 0));
        assert!(report.passed());
        assert_eq!(report.skipped, vec!["conservation".to_string()]);

        let report = checker().check(&hint_snapshot(0, 3, 0, 0));
        assert_eq!(report.failure_reasons(), vec!["zero-activity: succeeded is 3 with no hints created".to_string()]);
    }

    #[test]
    fn test_absent_metrics_count_as_zero_activity() {
        let snapshot = SnapshotBuilder::new().build();
        let report = checker().check(&snapshot);
        assert!(report.passed(), "{:?}", report.violations);
    }

    #[test]
    fn test_independent_rules_all_report() {
        let hints = HintMetrics::for_peer(peer()).unwrap();
        let mut builder = SnapshotBuilder::new();
        builder
            .record("node1", hints.created.clone(), MetricValue::Count(10))
            .record("node1", hints.succeeded.clone(), meter(2, "events/minute"))
            .record("node1", hints.failed.clone(), meter(0, EVENTS_PER_SECOND))
            .record("node1", hints.delays.clone(), MetricValue::Count(1))
            .record("node1", hints.peer_delays.clone(), MetricValue::Count(5));
        let report = checker().check(&builder.build());

        let rules: Vec<&str> = report.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(rules, vec!["rate-unit", "aggregate-consistency", "conservation"]);
    }

    #[test]
    fn test_negative_rate_flagged() {
        let hints = HintMetrics::for_peer(peer()).unwrap();
        let mut builder = SnapshotBuilder::new();
        builder.record(
            "node1",
            hints.succeeded.clone(),
            MetricValue::Rate(RateValue {
                count: 1,
                mean_rate: -0.5,
                one_minute_rate: 0.0,
                five_minute_rate: 0.0,
                fifteen_minute_rate: f64::NAN,
                unit: EVENTS_PER_SECOND.to_string(),
            }),
        );
        let result = NonNegativityRule.check(&builder.build());
        let message = result.unwrap_err();
        assert!(message.contains("MeanRate"));
        assert!(message.contains("FifteenMinuteRate"));
    }

    #[test]
    fn test_infinite_rate_flagged() {
        let hints = HintMetrics::for_peer(peer()).unwrap();
        let mut builder = SnapshotBuilder::new();
        builder.record(
            "node1",
            hints.failed.clone(),
            MetricValue::Rate(RateValue {
                count: 1,
                mean_rate: 0.1,
                one_minute_rate: f64::INFINITY,
                five_minute_rate: 0.0,
                fifteen_minute_rate: 0.0,
                unit: EVENTS_PER_SECOND.to_string(),
            }),
        );
        let message = NonNegativityRule.check(&builder.build()).unwrap_err();
        assert_eq!(message, "HintsFailed OneMinuteRate on node1 is inf");
    }

    #[test]
    fn test_same_family_aggregate() {
        let hints = HintMetrics::for_peer(peer()).unwrap();
        let other_peer = PeerScope::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)), 7000);
        let mut builder = SnapshotBuilder::new();
        builder
            .record("node1", hints.delays.clone(), MetricValue::Count(5))
            .record("node1", hints.peer_delays.clone(), MetricValue::Count(3))
            .record(
                "node1",
                hints.delays.clone().scoped(other_peer, ScopeEncoding::NameSuffix),
                MetricValue::Count(4),
            );

        let rule = AggregateConsistencyRule::same_family("node1", hints.delays.clone());
        let message = rule.check(&builder.build()).unwrap_err();
        assert!(message.contains("is 5 but its peer-scoped parts sum to 7"));
    }

    #[test]
    fn test_hint_checker_sums_delays_for_every_peer() {
        let hints = HintMetrics::for_peer(peer()).unwrap();
        let other_peer = PeerScope::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)), 7000);
        let other_delays = hints.delays.clone().scoped(other_peer, ScopeEncoding::NameSuffix);

        let mut builder = SnapshotBuilder::new();
        builder
            .record("node1", hints.delays.clone(), MetricValue::Count(6))
            .record("node1", hints.peer_delays.clone(), MetricValue::Count(3))
            .record("node1", other_delays, MetricValue::Count(4));
        let report = hints.checker("node1").check(&builder.build());

        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, "aggregate-consistency");
        assert!(report.violations[0].message.contains("is 6 but its peer-scoped parts sum to 7"));
    }

    #[test]
    fn test_streaming_rules() {
        let streaming = StreamingMetrics::for_peer(peer()).unwrap();
        assert_eq!(
            streaming.incoming_bytes.object_name(),
            "org.apache.cassandra.metrics:type=Streaming,scope=/127.0.0.2.7000,name=IncomingBytes"
        );

        let mut builder = SnapshotBuilder::new();
        for (key, count) in streaming.all_keys().into_iter().zip([50, 60, 50, 80, 40, 2]) {
            builder.record("node1", key, MetricValue::Count(count));
        }
        let snapshot = builder.build();
        assert!(streaming.settled("node1", &snapshot));
        assert!(streaming.checker("node1").check(&snapshot).passed());

        let mut builder = SnapshotBuilder::new();
        builder
            .record("node1", streaming.incoming_bytes.clone(), MetricValue::Count(50))
            .record("node1", streaming.total_incoming_bytes.clone(), MetricValue::Count(10));
        let report = streaming.checker("node1").check(&builder.build());
        let rules: Vec<&str> = report.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(rules, vec!["positive-count", "aggregate-consistency"]);
    }
}
