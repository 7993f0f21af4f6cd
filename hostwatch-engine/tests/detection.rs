use hostwatch_devkit::connector_builder::{
    command_line_criterion, serialized_criterion, snmp_get_next_criterion, ConnectorBuilder,
};
use hostwatch_devkit::{CallKind, MockExtension, SnmpConfiguration, SnmpSimulator, TestHarness};
use hostwatch_engine::connector::{CriterionTestResult, CriterionType};
use hostwatch_engine::constants::{protocol_up_metric_name, CONNECTOR_STATUS_METRIC_KEY, STATUS_INFORMATION};
use hostwatch_engine::strategy::detection::process_criterion;
use hostwatch_engine::{DeviceKind, EngineSettings};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn command_line_mock() -> MockExtension {
    MockExtension::new("commandline").supporting_criteria(&[CriterionType::CommandLine])
}

#[tokio::test]
async fn first_failing_criterion_stops_detection() {
    let mock = command_line_mock().with_criterion("check-b", CriterionTestResult::failure("B is missing", None));
    let harness = TestHarness::builder("srv-01", DeviceKind::Linux)
        .configuration(mock.configuration())
        .extension(mock.clone())
        .connector(
            ConnectorBuilder::new("Sample")
                .applies_to(&[DeviceKind::Linux])
                .criterion(command_line_criterion("check-a"))
                .criterion(command_line_criterion("check-b"))
                .criterion(command_line_criterion("check-c"))
                .build(),
        )
        .directives(&["+Sample"])
        .build();

    let detected = harness.detect(1_000).await.unwrap();

    assert!(detected.is_empty());
    assert_eq!(mock.targets(), vec!["check-a", "check-b"]);

    let connector = harness.monitor("connector", "connector_Sample").expect("forced connector is recorded");
    let status = connector.get_state_set_metric(CONNECTOR_STATUS_METRIC_KEY).unwrap();
    assert_eq!(status.value, "failed");
    let information = connector.legacy_text_parameters.get(STATUS_INFORMATION).unwrap();
    assert!(information.ends_with("Conclusion: Test on srv-01 FAILED"), "{information}");
}

#[test]
fn forced_serialization_never_overlaps() {
    let mock = command_line_mock().with_delay(Duration::from_millis(80));
    let harness = TestHarness::builder("srv-01", DeviceKind::Linux)
        .configuration(mock.configuration())
        .extension(mock.clone())
        .build();
    let context = harness.context(1_000);
    let connector = ConnectorBuilder::new("Ssh").build();
    let serialized = serialized_criterion(command_line_criterion("exclusive"));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| process_criterion(&context, &connector, &serialized).unwrap());
        }
    });

    let calls = mock.calls_of(CallKind::Criterion);
    assert_eq!(calls.len(), 4);
    for (i, a) in calls.iter().enumerate() {
        for b in &calls[i + 1..] {
            assert!(!a.overlaps(b), "serialized criteria ran concurrently");
        }
    }
    assert_eq!(mock.max_concurrency(), 1);

    mock.clear();
    let concurrent = command_line_criterion("shared");
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| process_criterion(&context, &connector, &concurrent).unwrap());
        }
    });
    assert!(mock.max_concurrency() > 1);
}

#[tokio::test]
async fn staging_filters_and_supersedes() {
    let mock = command_line_mock();
    let harness = TestHarness::builder("srv-01", DeviceKind::Linux)
        .configuration(mock.configuration())
        .extension(mock.clone())
        .connector(
            ConnectorBuilder::new("LinuxGeneric")
                .applies_to(&[DeviceKind::Linux])
                .tags(&["system"])
                .criterion(command_line_criterion("uname"))
                .build(),
        )
        .connector(
            ConnectorBuilder::new("LinuxRaid")
                .applies_to(&[DeviceKind::Linux])
                .tags(&["system"])
                .supersedes(&["linuxgeneric"])
                .criterion(command_line_criterion("mdadm"))
                .build(),
        )
        .connector(
            ConnectorBuilder::new("WindowsOnly")
                .applies_to(&[DeviceKind::Windows])
                .criterion(command_line_criterion("wmic"))
                .build(),
        )
        .connector(
            ConnectorBuilder::new("Excluded")
                .applies_to(&[DeviceKind::Linux])
                .criterion(command_line_criterion("excluded"))
                .build(),
        )
        .directives(&["!Excluded"])
        .build();

    let detected = harness.detect(1_000).await.unwrap();

    assert_eq!(detected, BTreeSet::from(["LinuxRaid".to_string()]));
    assert_eq!(mock.call_count("wmic"), 0);
    assert_eq!(mock.call_count("excluded"), 0);
    harness.assert_monitor_count("connector", 1).unwrap();

    let host = harness.telemetry_manager.endpoint_host_monitor().unwrap();
    assert_eq!(host.attribute("location"), Some("remote"));
}

#[tokio::test]
async fn configured_connector_is_not_tested() {
    let mock = command_line_mock();
    let harness = TestHarness::builder("srv-01", DeviceKind::Linux)
        .configuration(mock.configuration())
        .extension(mock.clone())
        .connector(ConnectorBuilder::new("Custom").criterion(command_line_criterion("never")).build())
        .configured_connector("Custom")
        .build();

    let detected = harness.detect(1_000).await.unwrap();

    assert_eq!(detected, BTreeSet::from(["Custom".to_string()]));
    assert!(mock.calls().is_empty());
    let status = harness.monitor("connector", "connector_Custom").unwrap();
    assert_eq!(status.get_number_metric(CONNECTOR_STATUS_METRIC_KEY).map(|m| m.value), Some(1.0));
}

#[tokio::test]
async fn snmp_detection_and_protocol_health() {
    let agent = SnmpSimulator::new().with("1.3.6.1.4.1.674.10892.1.300.10.1.8.1", "Dell Inc.");
    let harness = TestHarness::builder("srv-01", DeviceKind::Linux)
        .configuration(Arc::new(SnmpConfiguration::default()))
        .extension(agent)
        .connector(
            ConnectorBuilder::new("DellOpenManage")
                .applies_to(&[DeviceKind::Linux])
                .criterion(snmp_get_next_criterion("1.3.6.1.4.1.674.10892.1"))
                .build(),
        )
        .connector(
            ConnectorBuilder::new("HpInsight")
                .applies_to(&[DeviceKind::Linux])
                .criterion(snmp_get_next_criterion("1.3.6.1.4.1.232"))
                .build(),
        )
        .build();

    let detected = harness.detect(1_000).await.unwrap();
    assert_eq!(detected, BTreeSet::from(["DellOpenManage".to_string()]));

    let checks = harness.check_protocols(1_000).await.unwrap();
    assert_eq!(checks, vec![("snmp".to_string(), Some(true))]);

    let host = harness.telemetry_manager.endpoint_host_monitor().unwrap();
    assert_eq!(host.get_number_metric(&protocol_up_metric_name("snmp")).map(|m| m.value), Some(1.0));
}

#[tokio::test]
async fn sequential_detection_is_bounded_by_job_timeout() {
    let slow = command_line_mock().with_delay(Duration::from_millis(1_500));
    let mut builder = TestHarness::builder("srv-01", DeviceKind::Linux)
        .configuration(slow.configuration())
        .extension(slow.clone())
        .directives(&["+Alpha", "+Beta", "+Gamma"])
        .settings(EngineSettings { job_timeout_secs: 1, ..EngineSettings::default() })
        .sequential();
    for id in ["Alpha", "Beta", "Gamma"] {
        builder = builder.connector(
            ConnectorBuilder::new(id)
                .applies_to(&[DeviceKind::Linux])
                .criterion(command_line_criterion(&format!("check-{id}")))
                .build(),
        );
    }
    let harness = builder.build();

    let started = Instant::now();
    let detected = harness.detect(1_000).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(2_500), "detection took {:?}", started.elapsed());
    assert!(detected.is_empty());
    assert!(slow.max_concurrency() <= 1);
}
