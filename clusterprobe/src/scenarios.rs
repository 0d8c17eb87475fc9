//! Named scenarios the CLI and the e2e crate can run

use clusterprobe_core::{MetricsSnapshot, ProbeResult};
use std::time::Duration;

use crate::config::ProbeConfig;
use crate::context::ClusterContext;
use crate::invariants::{HintMetrics, Invariant, PositiveCountRule, StreamingMetrics};
use crate::poller::ProbeTarget;
use crate::runner::{MetricPlan, Scenario};
use crate::topology::Topology;
use crate::trigger::{EventTrigger, HandoffStatus, HandoffTrigger, StreamingRepairTrigger};
use crate::workload::RowPresence;

pub const HINTED_HANDOFF_ENABLED: &str = "hinted_handoff_enabled";
pub const HINTED_HANDOFF_DISABLED: &str = "hinted_handoff_disabled";
pub const HINTED_HANDOFF_METRICS: &str = "hinted_handoff_metrics";
pub const STREAMING_REPAIR_METRICS: &str = "streaming_repair_metrics";

const STREAMING_ROWS: usize = 1000;

pub fn names() -> Vec<&'static str> {
    vec![
        HINTED_HANDOFF_ENABLED,
        HINTED_HANDOFF_DISABLED,
        HINTED_HANDOFF_METRICS,
        STREAMING_REPAIR_METRICS,
    ]
}

/// Look a scenario up by name
pub fn by_name(name: &str, config: &ProbeConfig) -> Option<Box<dyn Scenario>> {
    let settings = HandoffSettings::from_config(config);
    let scenario: Box<dyn Scenario> = match name {
        HINTED_HANDOFF_ENABLED => Box::new(HandoffDelivery {
            enabled: true,
            settings,
        }),
        HINTED_HANDOFF_DISABLED => Box::new(HandoffDelivery {
            enabled: false,
            settings,
        }),
        HINTED_HANDOFF_METRICS => Box::new(HandoffMetrics { settings }),
        STREAMING_REPAIR_METRICS => Box::new(StreamingRepairMetrics {
            rows: STREAMING_ROWS,
        }),
        _ => return None,
    };
    Some(scenario)
}

/// Every scenario, in catalog order
pub fn catalog(config: &ProbeConfig) -> Vec<Box<dyn Scenario>> {
    names()
        .into_iter()
        .filter_map(|name| by_name(name, config))
        .collect()
}

#[derive(Debug, Clone)]
struct HandoffSettings {
    rows: usize,
    completion_pattern: String,
    completion_timeout: Duration,
    partial_completion_timeout: Duration,
}

impl HandoffSettings {
    fn from_config(config: &ProbeConfig) -> Self {
        Self {
            rows: config.trigger.rows,
            completion_pattern: config.trigger.completion_pattern.clone(),
            completion_timeout: config.completion_timeout(),
            partial_completion_timeout: config.partial_completion_timeout(),
        }
    }
}

fn two_nodes(enabled: bool) -> Topology {
    Topology::new(2).with_option("hinted_handoff_enabled", enabled)
}

/// Full cycle: node1 stores hints for node2 while it is down. Its hint
/// metrics are read while it still runs; it is stopped afterwards so rows
/// found on node2 can only have arrived by handoff.
struct HandoffDelivery {
    enabled: bool,
    settings: HandoffSettings,
}

impl Scenario for HandoffDelivery {
    fn name(&self) -> &str {
        if self.enabled {
            HINTED_HANDOFF_ENABLED
        } else {
            HINTED_HANDOFF_DISABLED
        }
    }

    fn description(&self) -> &str {
        if self.enabled {
            "rows written while node2 is down reach it by hinted handoff"
        } else {
            "with handoff disabled no hints are stored and rows never reach node2"
        }
    }

    fn topology(&self) -> Topology {
        two_nodes(self.enabled)
    }

    fn trigger(&self) -> Box<dyn EventTrigger> {
        let trigger = HandoffTrigger::full(self.settings.rows, self.settings.completion_timeout)
            .with_completion_pattern(self.settings.completion_pattern.clone());

        if self.enabled {
            Box::new(
                trigger
                    .expect_status(HandoffStatus::Running)
                    .verify_delivery(RowPresence::Present),
            )
        } else {
            Box::new(
                trigger
                    .without_completion_wait()
                    .expect_status(HandoffStatus::NotRunning)
                    .verify_delivery(RowPresence::Missing),
            )
        }
    }

    fn plan(&self, ctx: &ClusterContext) -> ProbeResult<MetricPlan> {
        let observer = ctx.node(0)?.clone();
        let hints = HintMetrics::for_peer(ctx.node(1)?.peer_scope())?;
        let node = observer.name().to_string();
        let checker = hints.checker(&node);

        if !self.enabled {
            return Ok(MetricPlan {
                targets: vec![ProbeTarget::new(observer, hints.all_keys())],
                readiness: Box::new(|_| true),
                checker: checker.with_rule(NoHintsCreated { node, hints }),
            });
        }

        let checker = checker.with_rule(PositiveCountRule::new(node.clone(), vec![hints.created.clone()]));
        let readiness_hints = hints.clone();
        Ok(MetricPlan {
            targets: vec![ProbeTarget::new(observer, hints.all_keys())],
            readiness: Box::new(move |snapshot| readiness_hints.settled(&node, snapshot)),
            checker,
        })
    }
}

/// With handoff disabled a node stores no hints for a peer that was down
struct NoHintsCreated {
    node: String,
    hints: HintMetrics,
}

impl Invariant for NoHintsCreated {
    fn name(&self) -> &str {
        "no-hints-created"
    }

    fn check(&self, snapshot: &MetricsSnapshot) -> Result<(), String> {
        match snapshot.count(&self.node, &self.hints.created) {
            0 => Ok(()),
            created => Err(format!(
                "{} created {} hints on {}",
                self.hints.created, created, self.node
            )),
        }
    }
}

/// Partial cycle: node1 stays up and its hint metrics are read once every
/// hint it created for node2 is accounted for
struct HandoffMetrics {
    settings: HandoffSettings,
}

impl Scenario for HandoffMetrics {
    fn name(&self) -> &str {
        HINTED_HANDOFF_METRICS
    }

    fn description(&self) -> &str {
        "hint meters, delays and created counts on node1 stay consistent after replaying hints to node2"
    }

    fn topology(&self) -> Topology {
        two_nodes(true)
    }

    fn trigger(&self) -> Box<dyn EventTrigger> {
        Box::new(
            HandoffTrigger::partial(self.settings.rows, self.settings.partial_completion_timeout)
                .with_completion_pattern(self.settings.completion_pattern.clone())
                .expect_status(HandoffStatus::Running),
        )
    }

    fn plan(&self, ctx: &ClusterContext) -> ProbeResult<MetricPlan> {
        let observer = ctx.node(0)?.clone();
        let hints = HintMetrics::for_peer(ctx.node(1)?.peer_scope())?;
        let node = observer.name().to_string();

        let checker = hints
            .checker(&node)
            .with_rule(PositiveCountRule::new(node.clone(), vec![hints.created.clone()]));
        let readiness_hints = hints.clone();

        Ok(MetricPlan {
            targets: vec![ProbeTarget::new(observer, hints.all_keys())],
            readiness: Box::new(move |snapshot| readiness_hints.settled(&node, snapshot)),
            checker,
        })
    }
}

/// Three single-token nodes; raising RF and running a full repair streams
/// ranges from node2 to node1
struct StreamingRepairMetrics {
    rows: usize,
}

impl Scenario for StreamingRepairMetrics {
    fn name(&self) -> &str {
        STREAMING_REPAIR_METRICS
    }

    fn description(&self) -> &str {
        "streaming byte counters on node1 move during a full repair and totals cover the per-peer values"
    }

    fn topology(&self) -> Topology {
        Topology::new(3)
            .with_property_file_snitch()
            .with_balanced_tokens()
    }

    fn trigger(&self) -> Box<dyn EventTrigger> {
        Box::new(StreamingRepairTrigger::new(self.rows))
    }

    fn plan(&self, ctx: &ClusterContext) -> ProbeResult<MetricPlan> {
        let observer = ctx.node(0)?.clone();
        let streaming = StreamingMetrics::for_peer(ctx.node(1)?.peer_scope())?;
        let node = observer.name().to_string();
        let checker = streaming.checker(&node);
        let readiness_streaming = streaming.clone();

        Ok(MetricPlan {
            targets: vec![ProbeTarget::new(observer, streaming.all_keys())],
            readiness: Box::new(move |snapshot| readiness_streaming.settled(&node, snapshot)),
            checker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    #[test]
    fn test_catalog_order_and_lookup() {
        let config = ProbeConfig::default();
        let catalog = catalog(&config);
        let listed: Vec<&str> = catalog.iter().map(|s| s.name()).collect();
        assert_eq!(listed, names());
        assert!(by_name("compaction_metrics", &config).is_none());
    }

    #[test]
    fn test_topologies() {
        let config = ProbeConfig::default();

        let disabled = by_name(HINTED_HANDOFF_DISABLED, &config).unwrap().topology();
        assert_eq!(disabled.node_count, 2);
        assert_eq!(
            disabled.cluster_options.get("hinted_handoff_enabled"),
            Some(&serde_yaml::Value::Bool(false))
        );

        let streaming = by_name(STREAMING_REPAIR_METRICS, &config).unwrap().topology();
        assert_eq!(streaming.node_count, 3);
        assert!(!streaming.use_vnodes);
        assert!(streaming.property_file_snitch);
    }

    #[tokio::test]
    async fn test_plans_read_the_right_node() {
        let config = ProbeConfig::default();
        let cluster = MockCluster::new();

        for (name, node, count) in [
            (HINTED_HANDOFF_ENABLED, "node1", 2),
            (HINTED_HANDOFF_DISABLED, "node1", 2),
            (HINTED_HANDOFF_METRICS, "node1", 2),
            (STREAMING_REPAIR_METRICS, "node1", 3),
        ] {
            let scenario = by_name(name, &config).unwrap();
            let ctx = ClusterContext::start(cluster.collaborators(), scenario.topology())
                .await
                .unwrap();
            assert_eq!(ctx.nodes().len(), count);

            let plan = scenario.plan(&ctx).unwrap();
            assert_eq!(plan.targets.len(), 1, "{}", name);
            assert_eq!(plan.targets[0].node.name(), node, "{}", name);
            assert_eq!(plan.targets[0].keys.len(), 6, "{}", name);
            assert!(!plan.checker.is_empty());
        }
    }

    #[tokio::test]
    async fn test_metrics_scenario_waits_for_settled_hints() {
        let config = ProbeConfig::default();
        let cluster = MockCluster::new();
        let scenario = by_name(HINTED_HANDOFF_METRICS, &config).unwrap();
        let ctx = ClusterContext::start(cluster.collaborators(), scenario.topology())
            .await
            .unwrap();
        let plan = scenario.plan(&ctx).unwrap();

        let empty = MetricsSnapshot::builder().build();
        assert!(!(plan.readiness)(&empty));
    }

    #[tokio::test]
    async fn test_disabled_scenario_rejects_created_hints() {
        let config = ProbeConfig::default();
        let cluster = MockCluster::new();
        let scenario = by_name(HINTED_HANDOFF_DISABLED, &config).unwrap();
        let ctx = ClusterContext::start(cluster.collaborators(), scenario.topology())
            .await
            .unwrap();
        let plan = scenario.plan(&ctx).unwrap();
        let hints = HintMetrics::for_peer(ctx.node(1).unwrap().peer_scope()).unwrap();

        let mut builder = MetricsSnapshot::builder();
        builder.record("node1", hints.created.clone(), clusterprobe_core::MetricValue::Count(4));
        let report = plan.checker.check(&builder.build());

        let rules: Vec<&str> = report.violations.iter().map(|v| v.rule.as_str()).collect();
        assert!(rules.contains(&"no-hints-created"), "{:?}", rules);
    }
}
