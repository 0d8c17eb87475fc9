//! Metric readings

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rates exposed by a meter, together with the meter's own count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateValue {
    pub count: u64,
    pub mean_rate: f64,
    pub one_minute_rate: f64,
    pub five_minute_rate: f64,
    pub fifteen_minute_rate: f64,
    pub unit: String,
}

impl RateValue {
    /// All four rate readings, labelled
    pub fn rates(&self) -> [(&'static str, f64); 4] {
        [
            ("MeanRate", self.mean_rate),
            ("OneMinuteRate", self.one_minute_rate),
            ("FiveMinuteRate", self.five_minute_rate),
            ("FifteenMinuteRate", self.fifteen_minute_rate),
        ]
    }
}

/// A single metric reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u64),
    Rate(RateValue),
}

impl MetricValue {
    /// Event count, for counters and meters alike
    pub fn count(&self) -> u64 {
        match self {
            MetricValue::Count(count) => *count,
            MetricValue::Rate(rate) => rate.count,
        }
    }

    /// Rate unit, when this is a meter reading
    pub fn unit(&self) -> Option<&str> {
        match self {
            MetricValue::Count(_) => None,
            MetricValue::Rate(rate) => Some(&rate.unit),
        }
    }

    pub fn as_rate(&self) -> Option<&RateValue> {
        match self {
            MetricValue::Count(_) => None,
            MetricValue::Rate(rate) => Some(rate),
        }
    }

    pub fn is_rate(&self) -> bool {
        matches!(self, MetricValue::Rate(_))
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Count(count) => write!(f, "{}", count),
            MetricValue::Rate(rate) => write!(
                f,
                "count={} mean={:.3} 1m={:.3} 5m={:.3} 15m={:.3} {}",
                rate.count,
                rate.mean_rate,
                rate.one_minute_rate,
                rate.five_minute_rate,
                rate.fifteen_minute_rate,
                rate.unit
            ),
        }
    }
}
