//! Point-in-time metric readings across cluster nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::metric::MetricKey;
use crate::value::MetricValue;

/// Outcome of reading one key: metrics are created lazily by the server, so a
/// key that does not exist yet is recorded as absent rather than failing the
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    Present(MetricValue),
    Absent,
}

impl Reading {
    /// Count, with absent metrics resolving to zero
    pub fn count(&self) -> u64 {
        match self {
            Reading::Present(value) => value.count(),
            Reading::Absent => 0,
        }
    }

    pub fn value(&self) -> Option<&MetricValue> {
        match self {
            Reading::Present(value) => Some(value),
            Reading::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Reading::Absent)
    }
}

/// Immutable set of readings captured at one instant.
///
/// Snapshots are never mutated; a later poll produces a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    captured_at: DateTime<Utc>,
    readings: BTreeMap<String, BTreeMap<MetricKey, Reading>>,
}

impl MetricsSnapshot {
    /// Start building a snapshot stamped with the current time
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Raw reading for a key on a node, if it was part of this snapshot
    pub fn reading(&self, node: &str, key: &MetricKey) -> Option<&Reading> {
        self.readings.get(node).and_then(|keys| keys.get(key))
    }

    /// Value for a key on a node, if it was present
    pub fn get(&self, node: &str, key: &MetricKey) -> Option<&MetricValue> {
        self.reading(node, key).and_then(Reading::value)
    }

    /// Count for a key on a node; absent or unread keys count as zero
    pub fn count(&self, node: &str, key: &MetricKey) -> u64 {
        self.reading(node, key).map(Reading::count).unwrap_or(0)
    }

    /// Whether a key has no value on a node
    pub fn is_absent(&self, node: &str, key: &MetricKey) -> bool {
        self.get(node, key).is_none()
    }

    /// Names of the nodes that contributed readings
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.readings.keys().map(String::as_str)
    }

    /// Iterate over every reading as (node, key, reading)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricKey, &Reading)> {
        self.readings.iter().flat_map(|(node, keys)| {
            keys.iter()
                .map(move |(key, reading)| (node.as_str(), key, reading))
        })
    }

    /// Number of readings
    pub fn len(&self) -> usize {
        self.readings.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer-scoped readings on a node that roll up into `aggregate`
    pub fn scoped_members(&self, node: &str, aggregate: &MetricKey) -> Vec<(&MetricKey, &Reading)> {
        self.readings
            .get(node)
            .map(|keys| {
                keys.iter()
                    .filter(|(key, _)| key.is_scoped() && key.family() == aggregate.family())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Counts that went backwards between `earlier` and this snapshot.
    ///
    /// Only keys present in both snapshots are compared.
    pub fn counter_regressions(&self, earlier: &MetricsSnapshot) -> Vec<String> {
        let mut regressions = Vec::new();

        for (node, key, reading) in self.iter() {
            let (Some(now), Some(before)) = (reading.value(), earlier.get(node, key)) else {
                continue;
            };

            if now.count() < before.count() {
                regressions.push(format!(
                    "count for {} on {} went backwards: {} -> {} (between {} and {})",
                    key,
                    node,
                    before.count(),
                    now.count(),
                    earlier.captured_at.to_rfc3339(),
                    self.captured_at.to_rfc3339()
                ));
            }
        }

        regressions
    }

    /// Plain structure for human-readable dumps: node -> object name -> value
    pub fn dump(&self) -> SnapshotDump {
        let nodes = self
            .readings
            .iter()
            .map(|(node, keys)| {
                let values = keys
                    .iter()
                    .map(|(key, reading)| (key.object_name(), reading.value().cloned()))
                    .collect();
                (node.clone(), values)
            })
            .collect();

        SnapshotDump {
            captured_at: self.captured_at,
            nodes,
        }
    }
}

impl Serialize for MetricsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.dump().serialize(serializer)
    }
}

/// Serializable view of a snapshot; absent metrics appear as `null`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDump {
    pub captured_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, BTreeMap<String, Option<MetricValue>>>,
}

/// Accumulates readings for one snapshot
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    captured_at: DateTime<Utc>,
    readings: BTreeMap<String, BTreeMap<MetricKey, Reading>>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self {
            captured_at: Utc::now(),
            readings: BTreeMap::new(),
        }
    }

    /// Override the capture timestamp
    pub fn captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Record a value read from a node
    pub fn record<N: Into<String>>(&mut self, node: N, key: MetricKey, value: MetricValue) -> &mut Self {
        self.insert(node.into(), key, Reading::Present(value))
    }

    /// Record that a key does not exist (yet) on a node
    pub fn record_absent<N: Into<String>>(&mut self, node: N, key: MetricKey) -> &mut Self {
        self.insert(node.into(), key, Reading::Absent)
    }

    fn insert(&mut self, node: String, key: MetricKey, reading: Reading) -> &mut Self {
        self.readings.entry(node).or_default().insert(key, reading);
        self
    }

    pub fn build(self) -> MetricsSnapshot {
        MetricsSnapshot {
            captured_at: self.captured_at,
            readings: self.readings,
        }
    }
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}
