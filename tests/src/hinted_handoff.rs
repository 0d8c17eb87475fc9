//! Hinted handoff scenarios

#[allow(unused_imports)]
use crate::common::E2EHarness;
#[allow(unused_imports)]
use clusterprobe::scenarios::{HINTED_HANDOFF_DISABLED, HINTED_HANDOFF_ENABLED, HINTED_HANDOFF_METRICS};

#[tokio::test]
#[ignore] // Run with --ignored flag, requires ccm
async fn test_hinted_handoff_enabled() {
    let harness = E2EHarness::new().expect("Failed to load configuration");
    assert!(harness.ccm_available(), "ccm is not installed or not on PATH");

    let result = harness
        .run(HINTED_HANDOFF_ENABLED)
        .await
        .expect("Scenario could not be run");

    assert!(result.passed, "Hinted handoff enabled failed: {:?}", result.failure_reasons);
    let trigger = result.trigger.as_ref().expect("trigger outcome");
    assert!(trigger.completed);
}

#[tokio::test]
#[ignore] // Run with --ignored flag, requires ccm
async fn test_hinted_handoff_disabled() {
    let harness = E2EHarness::new().expect("Failed to load configuration");
    assert!(harness.ccm_available(), "ccm is not installed or not on PATH");

    let result = harness
        .run(HINTED_HANDOFF_DISABLED)
        .await
        .expect("Scenario could not be run");

    assert!(result.passed, "Hinted handoff disabled failed: {:?}", result.failure_reasons);
}

#[tokio::test]
#[ignore] // Run with --ignored flag, requires ccm
async fn test_hinted_handoff_metrics() {
    let harness = E2EHarness::new().expect("Failed to load configuration");
    assert!(harness.ccm_available(), "ccm is not installed or not on PATH");

    let result = harness
        .run(HINTED_HANDOFF_METRICS)
        .await
        .expect("Scenario could not be run");

    assert!(result.passed, "Hint metrics failed: {:?}", result.failure_reasons);

    let snapshot = result.final_snapshot.as_ref().expect("final snapshot");
    assert!(!snapshot.is_empty());
    assert!(snapshot.nodes().any(|node| node == "node1"));
}
