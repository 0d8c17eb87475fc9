//! Trigger, poll, check: one scenario run from start to result

use clusterprobe_core::{MetricsSnapshot, ProbeError, ProbeResult};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::ClusterContext;
use crate::invariants::{CheckReport, InvariantChecker};
use crate::jolokia::BoxedMetricsClient;
use crate::poller::{ConvergencePoller, ProbeTarget};
use crate::topology::Topology;
use crate::trigger::{EventTrigger, TriggerOutcome};

/// Where a run is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerPhase {
    Idle,
    Triggering,
    Polling,
    Checking,
    Done,
}

impl fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerPhase::Idle => "idle",
            RunnerPhase::Triggering => "triggering",
            RunnerPhase::Polling => "polling",
            RunnerPhase::Checking => "checking",
            RunnerPhase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Predicate deciding when the metrics have settled
pub type Readiness = Box<dyn Fn(&MetricsSnapshot) -> bool + Send + Sync>;

/// What to read after the trigger, when to stop reading and what to check
pub struct MetricPlan {
    pub targets: Vec<ProbeTarget>,
    pub readiness: Readiness,
    pub checker: InvariantChecker,
}

/// A named, self-contained verification
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Cluster the scenario needs
    fn topology(&self) -> Topology;

    fn trigger(&self) -> Box<dyn EventTrigger>;

    /// Metrics to read, resolved against the live nodes
    fn plan(&self, ctx: &ClusterContext) -> ProbeResult<MetricPlan>;
}

/// Outcome of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario_name: String,
    pub passed: bool,
    /// Every violated rule and every timeout, in the order encountered
    pub failure_reasons: Vec<String>,
    pub final_snapshot: Option<MetricsSnapshot>,
    pub phases: Vec<RunnerPhase>,
    pub trigger: Option<TriggerOutcome>,
    pub check: Option<CheckReport>,
    pub polls: usize,
    pub elapsed_ms: u64,
}

impl ScenarioResult {
    fn new(scenario_name: &str) -> Self {
        Self {
            scenario_name: scenario_name.to_string(),
            passed: false,
            failure_reasons: Vec::new(),
            final_snapshot: None,
            phases: Vec::new(),
            trigger: None,
            check: None,
            polls: 0,
            elapsed_ms: 0,
        }
    }

    fn enter(&mut self, phase: RunnerPhase) {
        info!("[{}] {}", self.scenario_name, phase);
        self.phases.push(phase);
    }

    pub fn phase(&self) -> RunnerPhase {
        self.phases.last().copied().unwrap_or(RunnerPhase::Idle)
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs scenarios against clusters it is handed
pub struct ScenarioRunner {
    metrics: BoxedMetricsClient,
    poller: ConvergencePoller,
    deadline: Option<Duration>,
}

impl ScenarioRunner {
    pub fn new(metrics: BoxedMetricsClient, poller: ConvergencePoller) -> Self {
        Self {
            metrics,
            poller,
            deadline: None,
        }
    }

    /// Abort triggering and polling once a run has taken this long
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn run(&self, scenario: &dyn Scenario, ctx: &ClusterContext) -> ProbeResult<ScenarioResult> {
        self.run_with_cancel(scenario, ctx, &CancellationToken::new())
            .await
    }

    /// Run a scenario to completion.
    ///
    /// Cluster misbehaviour of any kind ends up in the result's failure
    /// reasons. Only harness misconfiguration (a malformed metric locator,
    /// a node index the cluster does not have) is returned as an error.
    pub async fn run_with_cancel(
        &self,
        scenario: &dyn Scenario,
        ctx: &ClusterContext,
        parent: &CancellationToken,
    ) -> ProbeResult<ScenarioResult> {
        let started = Instant::now();
        let cancel = parent.child_token();
        let _deadline = self.deadline.map(|deadline| {
            let token = cancel.clone();
            AbortOnDrop(tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("Run deadline of {:?} reached, cancelling", deadline);
                token.cancel();
            }))
        });

        let mut result = ScenarioResult::new(scenario.name());
        result.enter(RunnerPhase::Idle);

        let plan = scenario.plan(ctx)?;
        let trigger = scenario.trigger();

        result.enter(RunnerPhase::Triggering);
        info!("[{}] {}", scenario.name(), trigger.describe());
        match trigger.fire(ctx, &cancel).await {
            Ok(outcome) => {
                result.failure_reasons.extend(outcome.failures.iter().cloned());
                result.trigger = Some(outcome);
            }
            Err(e) if e.is_programmer_error() => return Err(e),
            Err(e) => {
                error!("[{}] trigger failed: {}", scenario.name(), e);
                result.failure_reasons.push(format!("trigger failed: {}", e));
                return Ok(self.finish(result, started));
            }
        }

        result.enter(RunnerPhase::Polling);
        let mut check_snapshot = true;
        let snapshot = match self
            .poller
            .poll_until(self.metrics.as_ref(), &plan.targets, &plan.readiness, &cancel)
            .await
        {
            Ok(convergence) => {
                result.polls = convergence.polls;
                result
                    .failure_reasons
                    .extend(convergence.counter_regressions.into_iter().map(regression));
                Some(convergence.snapshot)
            }
            Err(ProbeError::ConvergenceTimeout {
                timeout_ms,
                polls,
                regressions,
                snapshot,
            }) => {
                warn!("[{}] checking unconverged metrics", scenario.name());
                result.polls = polls;
                result.failure_reasons.push(format!(
                    "metrics did not converge within {}ms ({} polls)",
                    timeout_ms, polls
                ));
                result.failure_reasons.extend(regressions.into_iter().map(regression));
                Some(*snapshot)
            }
            Err(e) if e.is_programmer_error() => return Err(e),
            Err(ProbeError::Cancelled { stage, snapshot }) => {
                check_snapshot = false;
                result.failure_reasons.push(format!("cancelled during {}", stage));
                snapshot.map(|s| *s)
            }
            Err(e) => {
                result.failure_reasons.push(format!("polling failed: {}", e));
                None
            }
        };

        if check_snapshot {
            result.enter(RunnerPhase::Checking);
            self.finish_trigger(trigger.as_ref(), ctx, &mut result, &cancel)
                .await?;

            if let Some(snapshot) = &snapshot {
                let report = plan.checker.check(snapshot);
                result.failure_reasons.extend(report.failure_reasons());
                result.check = Some(report);
            }
        }

        result.final_snapshot = snapshot;
        Ok(self.finish(result, started))
    }

    /// Trigger steps deferred until the metrics are read. Their findings
    /// join the failure reasons ahead of the rule violations.
    async fn finish_trigger(
        &self,
        trigger: &dyn EventTrigger,
        ctx: &ClusterContext,
        result: &mut ScenarioResult,
        cancel: &CancellationToken,
    ) -> ProbeResult<()> {
        let Some(outcome) = result.trigger.as_mut() else {
            return Ok(());
        };

        let known = outcome.failures.len();
        let finished = trigger.finish(ctx, outcome, cancel).await;
        let found: Vec<String> = outcome.failures[known..].to_vec();
        result.failure_reasons.extend(found);

        match finished {
            Ok(()) => Ok(()),
            Err(e) if e.is_programmer_error() => Err(e),
            Err(ProbeError::Cancelled { stage, .. }) => {
                result.failure_reasons.push(format!("cancelled during {}", stage));
                Ok(())
            }
            Err(e) => {
                error!("[{}] trigger failed after polling: {}", result.scenario_name, e);
                result.failure_reasons.push(format!("trigger failed: {}", e));
                Ok(())
            }
        }
    }

    fn finish(&self, mut result: ScenarioResult, started: Instant) -> ScenarioResult {
        result.enter(RunnerPhase::Done);
        result.passed = result.failure_reasons.is_empty();
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        if result.passed {
            info!("[{}] passed in {}ms", result.scenario_name, result.elapsed_ms);
        } else {
            warn!(
                "[{}] failed with {} reason(s)",
                result.scenario_name,
                result.failure_reasons.len()
            );
        }
        result
    }
}

fn regression(message: String) -> String {
    format!("counter regression: {}", message)
}
