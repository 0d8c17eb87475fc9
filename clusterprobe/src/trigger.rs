//! Scripted fault and operation sequences that make a cluster move work
//! between nodes

use async_trait::async_trait;
use clusterprobe_core::{ProbeError, ProbeResult};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::ConsistencyLevel;
use crate::context::ClusterContext;
use crate::workload::{self, RowPresence};

/// What happened while firing a trigger
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerOutcome {
    pub description: String,
    /// Whether the completion marker (if any was awaited) was seen
    pub completed: bool,
    pub waited_for: Option<String>,
    pub elapsed_ms: u64,
    pub notes: Vec<String>,
    /// Checks made during the trigger that did not hold
    pub failures: Vec<String>,
}

/// Produces the condition a scenario measures
#[async_trait]
pub trait EventTrigger: Send + Sync {
    fn describe(&self) -> String;

    /// Run the sequence. Fails with `ProbeError::TriggerTimeout` when a
    /// required completion marker never shows up and with
    /// `ProbeError::Cancelled` when `cancel` fires first.
    async fn fire(&self, ctx: &ClusterContext, cancel: &CancellationToken) -> ProbeResult<TriggerOutcome>;

    /// Steps that have to wait until the metrics have been read, such as
    /// stopping a node whose metrics are being polled. Findings go into
    /// `outcome`.
    async fn finish(
        &self,
        _ctx: &ClusterContext,
        _outcome: &mut TriggerOutcome,
        _cancel: &CancellationToken,
    ) -> ProbeResult<()> {
        Ok(())
    }
}

/// Race a step against cancellation
async fn step<T, F>(cancel: &CancellationToken, stage: &str, fut: F) -> ProbeResult<T>
where
    F: Future<Output = ProbeResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProbeError::cancelled(format!("triggering: {}", stage))),
        result = fut => result,
    }
}

/// Whether the cycle ends by stopping the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCycle {
    /// Wait for completion, then optionally stop the observer to freeze its state
    Full { freeze_observer: bool },
    /// Leave every node running once the peer is back
    Partial,
}

/// Expected `nodetool statushandoff` answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStatus {
    Running,
    NotRunning,
}

impl HandoffStatus {
    pub fn message(&self) -> &'static str {
        match self {
            HandoffStatus::Running => "Hinted handoff is running",
            HandoffStatus::NotRunning => "Hinted handoff is not running",
        }
    }
}

/// Stop the peer, write through the observer, bring the peer back and wait
/// for the observer to finish replaying hints.
///
/// The observer keeps running through `fire` so its hint metrics can be
/// read; a full cycle stops it in `finish`, before the delivered rows are
/// read back from the peer.
#[derive(Debug, Clone)]
pub struct HandoffTrigger {
    observer: usize,
    peer: usize,
    keyspace: String,
    table: String,
    replication_factor: usize,
    rows: usize,
    consistency: ConsistencyLevel,
    cycle: TriggerCycle,
    completion_patterns: Vec<String>,
    completion_timeout: Duration,
    await_completion: bool,
    require_completion: bool,
    expected_status: Option<HandoffStatus>,
    verify_delivery: Option<RowPresence>,
}

impl HandoffTrigger {
    /// Node 1 observes, node 2 goes down
    pub fn new(cycle: TriggerCycle, rows: usize, completion_timeout: Duration) -> Self {
        Self {
            observer: 0,
            peer: 1,
            keyspace: "ks".to_string(),
            table: "cf".to_string(),
            replication_factor: 2,
            rows,
            consistency: ConsistencyLevel::One,
            cycle,
            completion_patterns: vec!["Finished hinted".to_string()],
            completion_timeout,
            await_completion: true,
            require_completion: true,
            expected_status: None,
            verify_delivery: None,
        }
    }

    pub fn full(rows: usize, completion_timeout: Duration) -> Self {
        Self::new(
            TriggerCycle::Full {
                freeze_observer: true,
            },
            rows,
            completion_timeout,
        )
    }

    pub fn partial(rows: usize, completion_timeout: Duration) -> Self {
        Self::new(TriggerCycle::Partial, rows, completion_timeout)
    }

    pub fn with_nodes(mut self, observer: usize, peer: usize) -> Self {
        self.observer = observer;
        self.peer = peer;
        self
    }

    pub fn with_completion_pattern<S: Into<String>>(mut self, pattern: S) -> Self {
        self.completion_patterns = vec![pattern.into()];
        self
    }

    /// Skip waiting for the completion marker entirely
    pub fn without_completion_wait(mut self) -> Self {
        self.await_completion = false;
        self
    }

    /// Record a missing marker as partial progress instead of failing
    pub fn tolerate_incomplete(mut self) -> Self {
        self.require_completion = false;
        self
    }

    pub fn expect_status(mut self, status: HandoffStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// Read every written row back from the peer at ONE afterwards
    pub fn verify_delivery(mut self, expected: RowPresence) -> Self {
        self.verify_delivery = Some(expected);
        self
    }

    pub fn observer(&self) -> usize {
        self.observer
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.keyspace, self.table)
    }

    async fn check_status(&self, ctx: &ClusterContext, expected: HandoffStatus) -> ProbeResult<Vec<String>> {
        let mut failures = Vec::new();
        for idx in 0..ctx.nodes().len() {
            let output = ctx.admin(idx, &["statushandoff"]).await?;
            let reported = output.stdout.trim_end();
            if reported != expected.message() {
                failures.push(format!(
                    "{} statushandoff reported '{}', expected '{}'",
                    ctx.node(idx)?.name(),
                    reported,
                    expected.message()
                ));
            }
        }
        Ok(failures)
    }

    async fn check_delivery(&self, ctx: &ClusterContext, expected: RowPresence) -> ProbeResult<Option<String>> {
        let session = ctx.connect(self.peer, Some(&self.keyspace)).await?;
        let table = self.qualified_table();

        let mut wrong = 0;
        for k in 0..self.rows {
            let presence = workload::query_c1c2(session.as_ref(), &table, k, ConsistencyLevel::One).await?;
            if presence != expected {
                wrong += 1;
            }
        }

        if wrong == 0 {
            return Ok(None);
        }

        let expectation = match expected {
            RowPresence::Present => "present",
            RowPresence::Missing => "missing",
        };
        Ok(Some(format!(
            "{} of {} rows on {} were not {} after handoff",
            wrong,
            self.rows,
            ctx.node(self.peer)?.name(),
            expectation
        )))
    }
}

#[async_trait]
impl EventTrigger for HandoffTrigger {
    fn describe(&self) -> String {
        let cycle = match self.cycle {
            TriggerCycle::Full { .. } => "full",
            TriggerCycle::Partial => "partial",
        };
        format!(
            "{} handoff cycle: stop node{}, write {} rows at {} via node{}, restart node{}",
            cycle,
            self.peer + 1,
            self.rows,
            self.consistency,
            self.observer + 1,
            self.peer + 1
        )
    }

    async fn fire(&self, ctx: &ClusterContext, cancel: &CancellationToken) -> ProbeResult<TriggerOutcome> {
        let started = Instant::now();
        let observer_name = ctx.node(self.observer)?.name().to_string();
        ctx.node(self.peer)?;

        let mut outcome = TriggerOutcome {
            description: self.describe(),
            ..Default::default()
        };

        if let Some(expected) = self.expected_status {
            let failures = step(cancel, "statushandoff", self.check_status(ctx, expected)).await?;
            outcome.failures.extend(failures);
        }

        let table = self.qualified_table();
        let session = step(cancel, "connect", ctx.connect(self.observer, None)).await?;
        step(
            cancel,
            "schema",
            workload::create_keyspace(session.as_ref(), &self.keyspace, self.replication_factor),
        )
        .await?;
        step(cancel, "schema", workload::create_c1c2_table(session.as_ref(), &table, None)).await?;

        step(cancel, "stop peer", ctx.stop_node(self.peer, true)).await?;

        step(
            cancel,
            "insert",
            workload::insert_c1c2(session.as_ref(), &table, 0..self.rows, self.consistency),
        )
        .await?;

        let mark = step(cancel, "mark log", ctx.mark_log(self.observer)).await?;
        step(cancel, "start peer", ctx.start_node(self.peer)).await?;

        if self.await_completion {
            let timeout = self.completion_timeout;
            let waited_for = format!("{:?} in {} log", self.completion_patterns, observer_name);
            info!("Waiting up to {:?} for {}", timeout, waited_for);

            let found = ctx
                .wait_for_log(self.observer, &self.completion_patterns, mark, timeout, cancel)
                .await?;
            outcome.waited_for = Some(waited_for.clone());

            if found {
                outcome.completed = true;
            } else if self.require_completion {
                return Err(ProbeError::trigger_timeout(waited_for, timeout.as_millis() as u64));
            } else {
                warn!("{} not seen within {:?}, continuing with partial handoff", waited_for, timeout);
                outcome
                    .notes
                    .push(format!("{} not seen within {:?}", waited_for, timeout));
            }
        } else {
            outcome.completed = true;
        }

        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn finish(
        &self,
        ctx: &ClusterContext,
        outcome: &mut TriggerOutcome,
        cancel: &CancellationToken,
    ) -> ProbeResult<()> {
        let started = Instant::now();

        if let TriggerCycle::Full { freeze_observer: true } = self.cycle {
            let observer_name = ctx.node(self.observer)?.name().to_string();
            step(cancel, "freeze observer", ctx.stop_node(self.observer, true)).await?;
            outcome.notes.push(format!("{} stopped to freeze its state", observer_name));
        }

        if let Some(expected) = self.verify_delivery {
            if let Some(failure) = step(cancel, "verify delivery", self.check_delivery(ctx, expected)).await? {
                outcome.failures.push(failure);
            }
        }

        outcome.elapsed_ms += started.elapsed().as_millis() as u64;
        Ok(())
    }
}

/// Write at RF 2, raise to RF 3 and run a full repair so ranges stream
/// between nodes
#[derive(Debug, Clone)]
pub struct StreamingRepairTrigger {
    source: usize,
    target: usize,
    keyspace: String,
    table: String,
    rows: usize,
    initial_replication: usize,
    final_replication: usize,
    compaction: String,
}

impl StreamingRepairTrigger {
    pub fn new(rows: usize) -> Self {
        Self {
            source: 0,
            target: 1,
            keyspace: "ks2".to_string(),
            table: "cf".to_string(),
            rows,
            initial_replication: 2,
            final_replication: 3,
            compaction: "LeveledCompactionStrategy".to_string(),
        }
    }

    pub fn with_nodes(mut self, source: usize, target: usize) -> Self {
        self.source = source;
        self.target = target;
        self
    }

    pub fn source(&self) -> usize {
        self.source
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

#[async_trait]
impl EventTrigger for StreamingRepairTrigger {
    fn describe(&self) -> String {
        format!(
            "streaming repair: {} rows at RF {}, RF raised to {}, full repair of {}.{} on node{}",
            self.rows,
            self.initial_replication,
            self.final_replication,
            self.keyspace,
            self.table,
            self.source + 1
        )
    }

    async fn fire(&self, ctx: &ClusterContext, cancel: &CancellationToken) -> ProbeResult<TriggerOutcome> {
        let started = Instant::now();
        ctx.node(self.source)?;
        ctx.node(self.target)?;
        let table = format!("{}.{}", self.keyspace, self.table);

        let session = step(cancel, "connect", ctx.connect(self.source, None)).await?;
        step(
            cancel,
            "schema",
            workload::create_keyspace(session.as_ref(), &self.keyspace, self.initial_replication),
        )
        .await?;
        step(
            cancel,
            "schema",
            workload::create_c1c2_table(session.as_ref(), &table, Some(&self.compaction)),
        )
        .await?;
        step(
            cancel,
            "insert",
            workload::insert_c1c2(session.as_ref(), &table, 0..self.rows, ConsistencyLevel::All),
        )
        .await?;

        // forget which ranges the target already holds so repair streams them again
        let target_session = step(cancel, "connect", ctx.connect(self.target, None)).await?;
        step(
            cancel,
            "truncate available ranges",
            target_session.execute("TRUNCATE system.available_ranges", ConsistencyLevel::One),
        )
        .await?;

        step(
            cancel,
            "alter replication",
            workload::alter_replication(session.as_ref(), &self.keyspace, self.final_replication),
        )
        .await?;

        step(
            cancel,
            "repair",
            ctx.admin(self.source, &["repair", "-full", self.keyspace.as_str(), self.table.as_str()]),
        )
        .await?;

        Ok(TriggerOutcome {
            description: self.describe(),
            completed: true,
            waited_for: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
            notes: Vec::new(),
            failures: Vec::new(),
        })
    }
}
