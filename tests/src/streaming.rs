//! Streaming metrics during repair

#[allow(unused_imports)]
use crate::common::E2EHarness;
#[allow(unused_imports)]
use clusterprobe::scenarios::STREAMING_REPAIR_METRICS;

#[tokio::test]
#[ignore] // Run with --ignored flag, requires ccm
async fn test_streaming_repair_metrics() {
    let harness = E2EHarness::new().expect("Failed to load configuration");
    assert!(harness.ccm_available(), "ccm is not installed or not on PATH");

    let result = harness
        .run(STREAMING_REPAIR_METRICS)
        .await
        .expect("Scenario could not be run");

    assert!(result.passed, "Streaming metrics failed: {:?}", result.failure_reasons);

    let check = result.check.as_ref().expect("rules were evaluated");
    assert!(check.evaluated.contains(&"positive-count".to_string()));
    assert!(check.evaluated.contains(&"aggregate-consistency".to_string()));
}
