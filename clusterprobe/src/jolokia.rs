//! Metric reads over a node's Jolokia HTTP endpoint

use async_trait::async_trait;
use clusterprobe_core::{MetricKey, MetricKind, MetricValue, ProbeError, ProbeResult, RateValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::node::NodeHandle;

/// Reads one metric from one node.
///
/// Implementations must report a metric the node has not created yet as
/// `ProbeError::NotFound` and a node that cannot be contacted as
/// `ProbeError::Unreachable`.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    async fn fetch(&self, node: &NodeHandle, key: &MetricKey) -> ProbeResult<MetricValue>;
}

pub type BoxedMetricsClient = Arc<dyn MetricsClient>;

#[derive(Debug, Serialize)]
struct ReadRequest<'a> {
    #[serde(rename = "type")]
    request_type: &'static str,
    mbean: String,
    attribute: &'a [&'static str],
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

const INSTANCE_NOT_FOUND: &str = "javax.management.InstanceNotFoundException";

/// `MetricsClient` speaking the Jolokia read protocol
pub struct JolokiaClient {
    http: reqwest::Client,
}

impl JolokiaClient {
    pub fn new(request_timeout: Duration) -> ProbeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProbeError::configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MetricsClient for JolokiaClient {
    async fn fetch(&self, node: &NodeHandle, key: &MetricKey) -> ProbeResult<MetricValue> {
        let url = node.management_url();
        let request = ReadRequest {
            request_type: "read",
            mbean: key.object_name(),
            attribute: key.kind().attributes(),
        };
        trace!("POST {} {}", url, request.mbean);

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProbeError::unreachable(node.name(), format!("{}: {}", url, e)))?;

        let http_status = response.status();
        if http_status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProbeError::not_found(node.name(), key));
        }
        if !http_status.is_success() {
            return Err(ProbeError::unreachable(
                node.name(),
                format!("{} returned HTTP {}", url, http_status),
            ));
        }

        let body: ReadResponse = response.json().await.map_err(|e| {
            ProbeError::protocol(format!("unreadable Jolokia response from {}: {}", node.name(), e))
        })?;

        if body.error_type.as_deref() == Some(INSTANCE_NOT_FOUND) || body.status == Some(404) {
            debug!("{} not registered on {} yet", key, node.name());
            return Err(ProbeError::not_found(node.name(), key));
        }

        if let Some(error) = body.error {
            return Err(ProbeError::protocol(format!(
                "Jolokia error reading {} on {}: {} ({})",
                key,
                node.name(),
                error,
                body.error_type.unwrap_or_default()
            )));
        }

        let value = body.value.ok_or_else(|| {
            ProbeError::protocol(format!("Jolokia response for {} on {} has no value", key, node.name()))
        })?;

        parse_value(key, &value)
    }
}

/// Convert a Jolokia attribute map into a metric value
pub fn parse_value(key: &MetricKey, value: &Value) -> ProbeResult<MetricValue> {
    let count = count_attribute(key, value)?;

    match key.kind() {
        MetricKind::Counter => Ok(MetricValue::Count(count)),
        MetricKind::Meter => {
            let unit = value
                .get("RateUnit")
                .and_then(Value::as_str)
                .ok_or_else(|| ProbeError::protocol(format!("{} has no RateUnit", key)))?;

            Ok(MetricValue::Rate(RateValue {
                count,
                mean_rate: rate_attribute(key, value, "MeanRate")?,
                one_minute_rate: rate_attribute(key, value, "OneMinuteRate")?,
                five_minute_rate: rate_attribute(key, value, "FiveMinuteRate")?,
                fifteen_minute_rate: rate_attribute(key, value, "FifteenMinuteRate")?,
                unit: unit.to_string(),
            }))
        }
    }
}

fn count_attribute(key: &MetricKey, value: &Value) -> ProbeResult<u64> {
    // a single-attribute read may come back as a bare number
    let count = value.get("Count").unwrap_or(value);

    if let Some(n) = count.as_u64() {
        return Ok(n);
    }
    match count.as_i64() {
        Some(n) => Err(ProbeError::protocol(format!("{} reported a negative count: {}", key, n))),
        None => Err(ProbeError::protocol(format!("{} has no integer Count: {}", key, count))),
    }
}

/// Rates are kept as reported, sign and all; judging them is up to the
/// invariants. Jolokia writes non-finite doubles as strings.
fn rate_attribute(key: &MetricKey, value: &Value, attribute: &str) -> ProbeResult<f64> {
    let rate = value.get(attribute);
    rate.and_then(Value::as_f64)
        .or_else(|| rate.and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()))
        .ok_or_else(|| ProbeError::protocol(format!("{} has no numeric {}", key, attribute)))
}
