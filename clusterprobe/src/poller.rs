//! Repeated snapshots until the metrics settle

use clusterprobe_core::{MetricKey, MetricsSnapshot, ProbeError, ProbeResult};
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jolokia::MetricsClient;
use crate::node::NodeHandle;

/// Keys to read from one node
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub node: NodeHandle,
    pub keys: Vec<MetricKey>,
}

impl ProbeTarget {
    pub fn new(node: NodeHandle, keys: Vec<MetricKey>) -> Self {
        Self { node, keys }
    }
}

/// Read every target key once.
///
/// Keys the node has not created yet are recorded as absent. Any other
/// failure aborts the snapshot.
pub async fn take_snapshot(client: &dyn MetricsClient, targets: &[ProbeTarget]) -> ProbeResult<MetricsSnapshot> {
    let mut builder = MetricsSnapshot::builder();

    for target in targets {
        for key in &target.keys {
            match client.fetch(&target.node, key).await {
                Ok(value) => {
                    builder.record(target.node.name(), key.clone(), value);
                }
                Err(e) if e.is_not_found() => {
                    builder.record_absent(target.node.name(), key.clone());
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(builder.build())
}

/// Snapshot that satisfied the readiness predicate
#[derive(Debug, Clone)]
pub struct Convergence {
    pub snapshot: MetricsSnapshot,
    pub polls: usize,
    pub elapsed: Duration,
    /// Counts that went backwards between consecutive polls
    pub counter_regressions: Vec<String>,
}

/// Polls metrics until a predicate holds or the timeout passes
#[derive(Debug, Clone, Copy)]
pub struct ConvergencePoller {
    timeout: Duration,
    interval: Duration,
}

impl ConvergencePoller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot `targets` every interval until `predicate` accepts one.
    ///
    /// On timeout the last snapshot comes back inside
    /// `ProbeError::ConvergenceTimeout`. An unreachable endpoint or a
    /// malformed read is retried each interval and only returned if it is
    /// still failing at the deadline. Cancellation returns
    /// `ProbeError::Cancelled` carrying the last snapshot taken.
    pub async fn poll_until<F>(
        &self,
        client: &dyn MetricsClient,
        targets: &[ProbeTarget],
        predicate: F,
        cancel: &CancellationToken,
    ) -> ProbeResult<Convergence>
    where
        F: Fn(&MetricsSnapshot) -> bool + Send + Sync,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut polls = 0;
        let mut last: Option<MetricsSnapshot> = None;
        let mut last_error: Option<ProbeError> = None;
        let mut regressions = Vec::new();

        loop {
            polls += 1;

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(cancelled(last));
                }
                attempt = timeout_at(deadline, take_snapshot(client, targets)) => attempt,
            };

            match attempt {
                Ok(Ok(snapshot)) => {
                    if let Some(previous) = &last {
                        let found = snapshot.counter_regressions(previous);
                        for regression in &found {
                            warn!("{}", regression);
                        }
                        regressions.extend(found);
                    }

                    last_error = None;
                    if predicate(&snapshot) {
                        let elapsed = started.elapsed();
                        info!("Metrics converged after {} polls in {:?}", polls, elapsed);
                        return Ok(Convergence {
                            snapshot,
                            polls,
                            elapsed,
                            counter_regressions: regressions,
                        });
                    }
                    debug!("Poll {}: not ready", polls);
                    last = Some(snapshot);
                }
                Ok(Err(e)) if e.is_retriable() => {
                    warn!("Poll {}: {}", polls, e);
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!("Poll {} cut short by the deadline", polls);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(cancelled(last));
                }
                _ = sleep(self.interval.min(deadline - now)) => {}
            }
        }

        if let Some(e) = last_error {
            return Err(e);
        }

        warn!(
            "Metrics did not converge within {:?} ({} polls)",
            self.timeout, polls
        );
        Err(ProbeError::ConvergenceTimeout {
            timeout_ms: self.timeout.as_millis() as u64,
            polls,
            regressions,
            snapshot: Box::new(last.unwrap_or_else(|| MetricsSnapshot::builder().build())),
        })
    }
}

fn cancelled(last: Option<MetricsSnapshot>) -> ProbeError {
    ProbeError::Cancelled {
        stage: "polling".to_string(),
        snapshot: last.map(Box::new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_node, MockMetricsClient};
    use clusterprobe_core::MetricValue;

    fn created() -> MetricKey {
        MetricKey::counter("HintsService", "Hints_created").unwrap()
    }

    fn targets() -> Vec<ProbeTarget> {
        vec![ProbeTarget::new(test_node(1), vec![created()])]
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_false_predicate_is_bounded() {
        let client = MockMetricsClient::new();
        client.set("node1", &created(), MetricValue::Count(1));
        let poller = ConvergencePoller::new(Duration::from_secs(1), Duration::from_millis(100));

        let started = Instant::now();
        let err = poller
            .poll_until(&client, &targets(), |_| false, &CancellationToken::new())
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1200));

        match err {
            ProbeError::ConvergenceTimeout { polls, snapshot, .. } => {
                assert!((10..=12).contains(&polls));
                assert_eq!(snapshot.count("node1", &created()), 1);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_once_predicate_holds() {
        let client = MockMetricsClient::new();
        client.script(
            "node1",
            &created(),
            vec![
                Ok(MetricValue::Count(10)),
                Ok(MetricValue::Count(60)),
                Ok(MetricValue::Count(100)),
            ],
        );
        let poller = ConvergencePoller::new(Duration::from_secs(10), Duration::from_millis(100));

        let convergence = poller
            .poll_until(
                &client,
                &targets(),
                |s| s.count("node1", &created()) >= 100,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(convergence.polls, 3);
        assert!(convergence.counter_regressions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_reads_as_absent() {
        let client = MockMetricsClient::new();
        let poller = ConvergencePoller::new(Duration::from_secs(1), Duration::from_millis(100));

        let convergence = poller
            .poll_until(
                &client,
                &targets(),
                |s| s.is_absent("node1", &created()) && s.count("node1", &created()) == 0,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(convergence.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_retried_then_recovers() {
        let client = MockMetricsClient::new();
        client.script(
            "node1",
            &created(),
            vec![
                Err(ProbeError::unreachable("node1", "connection refused")),
                Ok(MetricValue::Count(5)),
            ],
        );
        let poller = ConvergencePoller::new(Duration::from_secs(1), Duration::from_millis(100));

        let convergence = poller
            .poll_until(&client, &targets(), |_| true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(convergence.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_unreachable_is_fatal() {
        let client = MockMetricsClient::new();
        client.script(
            "node1",
            &created(),
            vec![Err(ProbeError::unreachable("node1", "connection refused"))],
        );
        let poller = ConvergencePoller::new(Duration::from_millis(500), Duration::from_millis(100));

        let err = poller
            .poll_until(&client, &targets(), |_| true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "unreachable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_read_retried_then_recovers() {
        let client = MockMetricsClient::new();
        client.script(
            "node1",
            &created(),
            vec![
                Err(ProbeError::protocol("Hints_created has no integer Count: \"x\"")),
                Ok(MetricValue::Count(5)),
            ],
        );
        let poller = ConvergencePoller::new(Duration::from_secs(1), Duration::from_millis(100));

        let convergence = poller
            .poll_until(&client, &targets(), |_| true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(convergence.polls, 2);
        assert_eq!(convergence.snapshot.count("node1", &created()), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_malformed_read_is_returned() {
        let client = MockMetricsClient::new();
        client.script("node1", &created(), vec![Err(ProbeError::protocol("bad body"))]);
        let poller = ConvergencePoller::new(Duration::from_millis(500), Duration::from_millis(100));

        let err = poller
            .poll_until(&client, &targets(), |_| true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: bad body");
    }

    #[tokio::test(start_paused = true)]
    async fn test_regressions_are_collected() {
        let client = MockMetricsClient::new();
        client.script(
            "node1",
            &created(),
            vec![Ok(MetricValue::Count(10)), Ok(MetricValue::Count(4))],
        );
        let poller = ConvergencePoller::new(Duration::from_secs(5), Duration::from_millis(100));

        let convergence = poller
            .poll_until(
                &client,
                &targets(),
                |s| s.count("node1", &created()) == 4,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(convergence.counter_regressions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_last_snapshot() {
        let client = MockMetricsClient::new();
        client.set("node1", &created(), MetricValue::Count(3));
        let poller = ConvergencePoller::new(Duration::from_secs(60), Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(350)).await;
            trigger.cancel();
        });

        let err = poller
            .poll_until(&client, &targets(), |_| false, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.category(), "cancelled");
        let snapshot = err.into_snapshot().unwrap();
        assert_eq!(snapshot.count("node1", &created()), 3);
    }
}
