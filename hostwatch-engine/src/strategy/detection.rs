//! Detection: which connectors apply to the host.

use super::{Strategy, StrategyContext};
use crate::config::HostConfiguration;
use crate::connector::criterion::{DeviceTypeCriterion, ProductRequirementsCriterion};
use crate::connector::{ConnectionType, Connector, ConnectorStore, Criterion, CriterionDefinition, CriterionTestResult, CriterionType};
use crate::constants::{
    CONNECTOR_MONITOR_TYPE, CONNECTOR_STATUS_METRIC_KEY, HOST_MONITOR_TYPE, IS_ENDPOINT, MONITOR_ATTRIBUTE_APPLIES_TO_OS,
    MONITOR_ATTRIBUTE_CONNECTOR_ID, MONITOR_ATTRIBUTE_DESCRIPTION, MONITOR_ATTRIBUTE_ID, MONITOR_ATTRIBUTE_LOCATION,
    MONITOR_ATTRIBUTE_NAME, MONITOR_ATTRIBUTE_PARENT_ID, STATE_SET_METRIC_FAILED, STATE_SET_METRIC_OK, STATUS_INFORMATION,
};
use crate::error::EngineError;
use crate::telemetry::{MetricFactory, Monitor};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of one criterion, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct CriterionOutcome {
    pub criterion_type: CriterionType,
    pub result: CriterionTestResult,
}

#[derive(Debug, Clone)]
pub struct ConnectorTestResult {
    pub connector: Arc<Connector>,
    pub outcomes: Vec<CriterionOutcome>,
    pub success: bool,
}

impl ConnectorTestResult {
    pub fn connector_id(&self) -> &str {
        &self.connector.id
    }

    /// `Received Result: <result>. <message>` per criterion, then the conclusion.
    pub fn status_information(&self, hostname: &str) -> String {
        let mut lines: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| o.result.result.is_some() || o.result.message.is_some())
            .map(|o| {
                format!(
                    "Received Result: {}. {}",
                    o.result.result.as_deref().unwrap_or("N/A"),
                    o.result.message.as_deref().unwrap_or("N/A")
                )
            })
            .collect();
        lines.push(format!(
            "Conclusion: Test on {} {}",
            hostname,
            if self.success { "SUCCEEDED" } else { "FAILED" }
        ));
        lines.join("\n")
    }
}

/// Connector ids selected by the host's directives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedConnectors {
    /// Candidates for automatic detection, subject to the automatic filters.
    pub automatic: BTreeSet<String>,
    /// `+id` connectors: tested without automatic filtering.
    pub forced: BTreeSet<String>,
}

/// Applies `id`, `+id`, `!id`, `#tag` and `!#tag` directives to the store.
pub fn stage_connectors(hostname: &str, store: &ConnectorStore, directives: &[String]) -> StagedConnectors {
    let mut staged = StagedConnectors::default();
    if store.is_empty() {
        error!("Hostname {} - No connector available in the store. Detection will stop.", hostname);
        return staged;
    }
    if directives.is_empty() {
        staged.automatic = store.ids().map(str::to_string).collect();
        return staged;
    }

    let has_inclusions = directives.iter().any(|d| !d.trim().starts_with('!'));
    let tagged = |tag: &str, with: bool| -> BTreeSet<String> {
        store.connectors().filter(|c| c.has_tag(tag) == with).map(|c| c.id.clone()).collect()
    };
    let resolve = |id: &str| -> Option<String> {
        let found = store.find_ignore_case(id).map(|c| c.id.clone());
        if found.is_none() {
            warn!(
                "Hostname {} - The connector associated with {} is not present in the store. Detection will skip this connector.",
                hostname,
                id
            );
        }
        found
    };

    let mut excluded = BTreeSet::new();
    for directive in directives.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
        if let Some(tag) = directive.strip_prefix("!#") {
            if !has_inclusions {
                staged.automatic.extend(tagged(tag, false));
            }
            excluded.extend(tagged(tag, true));
        } else if let Some(id) = directive.strip_prefix('!') {
            if !has_inclusions {
                staged.automatic.extend(store.ids().filter(|k| !k.eq_ignore_ascii_case(id)).map(str::to_string));
            }
            excluded.extend(store.find_ignore_case(id).map(|c| c.id.clone()));
        } else if let Some(tag) = directive.strip_prefix('#') {
            staged.automatic.extend(tagged(tag, true));
        } else if let Some(id) = directive.strip_prefix('+') {
            if let Some(id) = resolve(id) {
                excluded.insert(id.clone());
                staged.forced.insert(id);
            }
        } else if let Some(id) = resolve(directive) {
            staged.automatic.insert(id);
        }
    }

    staged.automatic.retain(|id| !excluded.contains(id));
    staged
}

/// Whether automatic detection may consider `connector` on this host.
fn passes_automatic_filters(host: &HostConfiguration, connector: &Connector) -> bool {
    let Some(detection) = connector.detection() else { return false };
    let connection_type = if host.is_localhost() { ConnectionType::Local } else { ConnectionType::Remote };

    !detection.disable_auto_detection
        && detection.applies_to.contains(&host.host_type)
        && detection.connection_types.contains(&connection_type)
}

fn device_type(host: &HostConfiguration, criterion: &DeviceTypeCriterion) -> CriterionTestResult {
    let host_type = host.host_type;
    let accepted = if criterion.keep.is_empty() {
        !criterion.exclude.contains(&host_type)
    } else {
        criterion.keep.contains(&host_type)
    };

    if accepted {
        CriterionTestResult::success(format!("Device type {} is supported", host_type.as_str()), host_type.as_str())
    } else {
        CriterionTestResult::failure(
            format!("Device type {} is not supported by this connector", host_type.as_str()),
            Some(host_type.as_str().to_string()),
        )
    }
}

/// Numeric comparison of dotted versions, missing components read as 0.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| part.chars().take_while(char::is_ascii_digit).collect::<String>().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    (0..a.len().max(b.len()))
        .map(|i| a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0)))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn product_requirements(criterion: &ProductRequirementsCriterion) -> CriterionTestResult {
    match criterion.engine_version.as_deref() {
        Some(required) if compare_versions(required, ENGINE_VERSION) == Ordering::Greater => CriterionTestResult::failure(
            format!("Engine version {ENGINE_VERSION} is older than the required {required}"),
            Some(ENGINE_VERSION.to_string()),
        ),
        _ => CriterionTestResult::success("Engine version requirement met", ENGINE_VERSION),
    }
}

/// Tests one criterion of `connector`. Only fatal errors are returned;
/// any other failure is a failed result.
pub fn process_criterion(
    context: &StrategyContext,
    connector: &Connector,
    criterion: &Criterion,
) -> Result<CriterionTestResult, EngineError> {
    let telemetry_manager = &context.telemetry_manager;
    match &criterion.definition {
        CriterionDefinition::DeviceType(c) => return Ok(device_type(telemetry_manager.host_configuration(), c)),
        CriterionDefinition::ProductRequirements(c) => return Ok(product_requirements(c)),
        _ => {}
    }

    let test = || context.extension_manager.process_criterion(criterion, &connector.id, telemetry_manager);
    let result = if criterion.force_serialization {
        let timeout = telemetry_manager.settings().serialization_timeout();
        telemetry_manager.serialization().serialize(&connector.id, timeout, test).unwrap_or_else(|| {
            error!(
                "Hostname {} - Connector {}: {:?} criterion did not get the serialization lock within {}s",
                telemetry_manager.hostname(),
                connector.id,
                criterion.criterion_type(),
                timeout.as_secs()
            );
            Ok(CriterionTestResult::empty())
        })
    } else {
        test()
    };

    match result {
        Err(e) if !e.is_fatal() => {
            error!(
                "Hostname {} - Connector {}: {:?} criterion failed: {}",
                telemetry_manager.hostname(),
                connector.id,
                criterion.criterion_type(),
                e
            );
            Ok(CriterionTestResult::failure(e.to_string(), None))
        }
        other => other,
    }
}

/// Runs the criteria of `connector` in order and stops at the first failure.
/// A connector without criteria does not match.
pub fn test_connector(context: &StrategyContext, connector: &Arc<Connector>) -> Result<ConnectorTestResult, EngineError> {
    let hostname = context.hostname();
    let mut test_result = ConnectorTestResult { connector: connector.clone(), outcomes: Vec::new(), success: false };

    let criteria = connector.detection().map(|d| d.criteria.as_slice()).unwrap_or_default();
    if criteria.is_empty() {
        warn!(
            "Hostname {} - The connector {} DOES NOT match the platform as it has no criteria to test.",
            hostname,
            connector.id
        );
        return Ok(test_result);
    }

    test_result.success = true;
    for criterion in criteria {
        let result = process_criterion(context, connector, criterion)?;
        let success = result.success;
        test_result.outcomes.push(CriterionOutcome { criterion_type: criterion.criterion_type(), result });
        if !success {
            debug!(
                "Hostname {} - Detected failed criterion for connector {}. Remaining criteria are skipped.",
                hostname,
                connector.id
            );
            test_result.success = false;
            break;
        }
    }

    if test_result.success {
        info!("Hostname {} - Connector {} matches the platform", hostname, connector.id);
    }
    Ok(test_result)
}

/// Creates or refreshes the `connector` monitor of a tested connector.
pub fn record_connector_status(context: &StrategyContext, test_result: &ConnectorTestResult) {
    let telemetry_manager = &context.telemetry_manager;
    let host = telemetry_manager.host_configuration();
    let connector = &test_result.connector;
    let status = if test_result.success { STATE_SET_METRIC_OK } else { STATE_SET_METRIC_FAILED };
    let status_information = test_result.status_information(telemetry_manager.hostname());

    let applies_to: Vec<&str> = connector
        .detection()
        .map(|d| d.applies_to.iter().map(|kind| kind.as_str()).collect())
        .unwrap_or_default();

    let mut store = telemetry_manager.monitors();
    let monitor = connector_monitor(&mut store, &connector.id, &host.host_id, context.strategy_time);
    monitor.add_attribute(MONITOR_ATTRIBUTE_APPLIES_TO_OS, applies_to.join(","));
    if let Some(information) = &connector.connector.information {
        monitor.add_attribute(MONITOR_ATTRIBUTE_DESCRIPTION, information.clone());
    }
    monitor.add_legacy_text_parameter(STATUS_INFORMATION, status_information);

    MetricFactory::new(telemetry_manager.hostname()).collect_state_set_metric(
        monitor,
        CONNECTOR_STATUS_METRIC_KEY,
        status,
        &[STATE_SET_METRIC_OK.to_string(), STATE_SET_METRIC_FAILED.to_string()],
        context.strategy_time,
    );
}

fn connector_monitor<'a>(
    store: &'a mut crate::telemetry::MonitorStore,
    connector_id: &str,
    host_id: &str,
    discovery_time: i64,
) -> &'a mut Monitor {
    let monitor = store.get_or_create(CONNECTOR_MONITOR_TYPE, &format!("{CONNECTOR_MONITOR_TYPE}_{connector_id}"));
    monitor.add_attribute(MONITOR_ATTRIBUTE_ID, connector_id);
    monitor.add_attribute(MONITOR_ATTRIBUTE_NAME, connector_id);
    monitor.add_attribute(MONITOR_ATTRIBUTE_PARENT_ID, host_id);
    monitor.add_attribute(MONITOR_ATTRIBUTE_CONNECTOR_ID, connector_id);
    monitor.discovery_time = Some(discovery_time);
    monitor
}

/// Drops superseded connectors, then last-resort connectors whose monitor
/// type is already discovered by a regular connector.
fn filter_detected(hostname: &str, detected: Vec<ConnectorTestResult>) -> Vec<ConnectorTestResult> {
    let superseded: BTreeSet<String> = detected
        .iter()
        .filter_map(|r| r.connector.detection())
        .flat_map(|d| d.supersedes.iter().map(|s| s.to_ascii_lowercase()))
        .collect();

    let detected: Vec<ConnectorTestResult> = detected
        .into_iter()
        .filter(|r| {
            let keep = !superseded.contains(&r.connector.id.to_ascii_lowercase());
            if !keep {
                info!("Hostname {} - Connector {} is superseded", hostname, r.connector.id);
            }
            keep
        })
        .collect();

    let last_resort_type = |r: &ConnectorTestResult| r.connector.detection().and_then(|d| d.on_last_resort.clone());
    let mut regular: Vec<Arc<Connector>> = detected
        .iter()
        .filter(|r| last_resort_type(r).is_none())
        .map(|r| r.connector.clone())
        .collect();

    let mut kept = Vec::with_capacity(detected.len());
    for result in detected {
        let Some(monitor_type) = last_resort_type(&result) else {
            kept.push(result);
            continue;
        };
        match regular.iter().find(|c| c.discovers(&monitor_type)) {
            Some(winner) => info!(
                "Hostname {} - {} is a \"last resort\" connector and its components are already discovered thanks to connector {}. Connector is therefore discarded.",
                hostname,
                result.connector.id,
                winner.id
            ),
            None => {
                regular.push(result.connector.clone());
                kept.push(result);
            }
        }
    }
    kept
}

pub struct DetectionStrategy {
    context: StrategyContext,
}

impl DetectionStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self { context }
    }

    /// Tests `connectors` on blocking workers, `max_threads` at a time
    /// (one at a time in sequential mode). Results are sorted by id.
    async fn test_all(&self, connectors: Vec<Arc<Connector>>) -> Result<Vec<ConnectorTestResult>, EngineError> {
        let telemetry_manager = &self.context.telemetry_manager;
        let permits = if telemetry_manager.host_configuration().sequential {
            1
        } else {
            telemetry_manager.settings().max_threads.max(1)
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut pool = JoinSet::new();

        for connector in connectors {
            let semaphore = semaphore.clone();
            let context = self.context.clone();
            pool.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Err(EngineError::Cancelled);
                };
                tokio::task::spawn_blocking(move || test_connector(&context, &connector))
                    .await
                    .map_err(|e| EngineError::Join(e.to_string()))?
            });
        }

        let mut results = Vec::new();
        let drain = async {
            while let Some(joined) = pool.join_next().await {
                match joined {
                    Ok(Ok(result)) => results.push(result),
                    Ok(Err(fatal)) if fatal.is_fatal() => return Err(fatal),
                    Ok(Err(e)) => error!("Hostname {} - Connector test aborted: {}", self.context.hostname(), e),
                    Err(e) => error!(
                        "Hostname {} - Connector test aborted: {}",
                        self.context.hostname(),
                        EngineError::Join(e.to_string())
                    ),
                }
            }
            Ok(())
        };

        let timeout = telemetry_manager.settings().job_timeout();
        let outcome = tokio::time::timeout(timeout, drain).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(fatal)) => {
                pool.abort_all();
                return Err(fatal);
            }
            Err(_) => {
                error!(
                    "Hostname {} - Detection: {}. {} connector test(s) abandoned",
                    self.context.hostname(),
                    EngineError::Timeout(timeout.as_secs()),
                    pool.len()
                );
                // A criterion already running on a blocking thread runs to
                // completion; its result is dropped.
                pool.abort_all();
            }
        }

        results.sort_by(|a, b| a.connector.id.cmp(&b.connector.id));
        Ok(results)
    }

    fn create_endpoint_host_monitor(&self) {
        let telemetry_manager = &self.context.telemetry_manager;
        let host = telemetry_manager.host_configuration();
        let location = if host.is_localhost() { "local" } else { "remote" };

        let mut store = telemetry_manager.monitors();
        let monitor = store.get_or_create(HOST_MONITOR_TYPE, &host.host_id);
        monitor.is_endpoint = true;
        monitor.add_attribute(MONITOR_ATTRIBUTE_ID, host.host_id.clone());
        monitor.add_attribute(MONITOR_ATTRIBUTE_NAME, host.hostname.clone());
        monitor.add_attribute(MONITOR_ATTRIBUTE_LOCATION, location);
        monitor.add_attribute(IS_ENDPOINT, "true");
        monitor.discovery_time = Some(self.context.strategy_time);
    }

    fn create_configured_connector_monitor(&self, connector_id: &str) {
        let telemetry_manager = &self.context.telemetry_manager;
        let host_id = telemetry_manager.host_configuration().host_id.clone();

        let mut store = telemetry_manager.monitors();
        let monitor = connector_monitor(&mut store, connector_id, &host_id, self.context.strategy_time);
        MetricFactory::new(telemetry_manager.hostname()).collect_number_metric(
            monitor,
            CONNECTOR_STATUS_METRIC_KEY,
            1.0,
            self.context.strategy_time,
        );
    }
}

impl Strategy for DetectionStrategy {
    type Output = BTreeSet<String>;

    fn name(&self) -> &'static str {
        "detection"
    }

    fn strategy_time(&self) -> i64 {
        self.context.strategy_time
    }

    async fn run(&self) -> Result<BTreeSet<String>, EngineError> {
        let telemetry_manager = &self.context.telemetry_manager;
        let hostname = telemetry_manager.hostname();
        let host = telemetry_manager.host_configuration();
        debug!("Hostname {} - Start detection strategy.", hostname);

        let store = telemetry_manager.connector_store();
        let staged = stage_connectors(hostname, store, &host.connectors);
        let mut results = Vec::new();

        if !staged.forced.is_empty() {
            let forced = staged.forced.iter().filter_map(|id| store.get(id)).collect();
            results.extend(self.test_all(forced).await?);
        }

        if !staged.automatic.is_empty() && host.configured_connector_id.is_none() {
            let candidates: Vec<Arc<Connector>> = staged
                .automatic
                .iter()
                .filter_map(|id| store.get(id))
                .filter(|connector| passes_automatic_filters(host, connector))
                .collect();
            debug!("Hostname {} - {} connector(s) eligible for automatic detection", hostname, candidates.len());

            let detected = self.test_all(candidates).await?.into_iter().filter(|r| r.success).collect();
            results.extend(filter_detected(hostname, detected));
        }

        self.create_endpoint_host_monitor();
        for result in &results {
            record_connector_status(&self.context, result);
        }

        let mut applicable: BTreeSet<String> =
            results.iter().filter(|r| r.success).map(|r| r.connector_id().to_string()).collect();

        if let Some(configured) = &host.configured_connector_id {
            self.create_configured_connector_monitor(configured);
            applicable.insert(configured.clone());
        }

        info!("Hostname {} - Detected connectors: {:?}", hostname, applicable);
        Ok(applicable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorIdentity, Detection, DeviceKind};

    fn connector(id: &str, tags: &[&str]) -> Connector {
        Connector {
            id: id.into(),
            connector: ConnectorIdentity {
                detection: Some(Detection {
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    applies_to: [DeviceKind::Linux].into_iter().collect(),
                    ..Detection::default()
                }),
                ..ConnectorIdentity::default()
            },
            ..Connector::default()
        }
    }

    fn store() -> ConnectorStore {
        [connector("DellOpenManage", &["hardware"]), connector("Linux", &["system"]), connector("IpmiTool", &["hardware"])]
            .into_iter()
            .collect()
    }

    fn directives(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn staging_directives() {
        let store = store();

        let all = stage_connectors("srv-01", &store, &[]);
        assert_eq!(all.automatic.len(), 3);

        let staged = stage_connectors("srv-01", &store, &directives(&["#HARDWARE", "!ipmitool", "+linux", "ghost"]));
        assert_eq!(staged.automatic, set(&["DellOpenManage"]));
        assert_eq!(staged.forced, set(&["Linux"]));

        let exclusions_only = stage_connectors("srv-01", &store, &directives(&["!#system"]));
        assert_eq!(exclusions_only.automatic, set(&["DellOpenManage", "IpmiTool"]));
    }

    #[test]
    fn device_type_keep_wins_over_exclude() {
        let host = HostConfiguration::new("srv-01", DeviceKind::Linux);
        let both = DeviceTypeCriterion { keep: vec![DeviceKind::Linux], exclude: vec![DeviceKind::Linux] };
        assert!(device_type(&host, &both).success);

        let excluded = DeviceTypeCriterion { keep: vec![], exclude: vec![DeviceKind::Linux] };
        assert!(!device_type(&host, &excluded).success);

        assert!(device_type(&host, &DeviceTypeCriterion::default()).success);
    }

    #[test]
    fn version_requirements() {
        assert_eq!(compare_versions("0.1", "0.1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2.10", "1.2.9"), Ordering::Greater);
        assert!(product_requirements(&ProductRequirementsCriterion { engine_version: Some("0.0.1".into()) }).success);
        assert!(!product_requirements(&ProductRequirementsCriterion { engine_version: Some("99.0".into()) }).success);
    }

    #[test]
    fn automatic_filters() {
        let remote = HostConfiguration::new("srv-01", DeviceKind::Linux);
        let local = HostConfiguration::new("localhost", DeviceKind::Linux);
        let mut only_local = connector("LocalOnly", &[]);
        if let Some(detection) = only_local.connector.detection.as_mut() {
            detection.connection_types = vec![ConnectionType::Local];
        }

        assert!(passes_automatic_filters(&remote, &connector("Any", &[])));
        assert!(!passes_automatic_filters(&HostConfiguration::new("srv-01", DeviceKind::Windows), &connector("Any", &[])));
        assert!(!passes_automatic_filters(&remote, &only_local));
        assert!(passes_automatic_filters(&local, &only_local));
    }

    #[test]
    fn status_information_lists_results_then_conclusion() {
        let result = ConnectorTestResult {
            connector: Arc::new(connector("Dell", &[])),
            outcomes: vec![CriterionOutcome {
                criterion_type: CriterionType::SnmpGetNext,
                result: CriterionTestResult::failure("No answer", None),
            }],
            success: false,
        };
        assert_eq!(
            result.status_information("srv-01"),
            "Received Result: N/A. No answer\nConclusion: Test on srv-01 FAILED"
        );
    }

    #[test]
    fn superseded_and_last_resort_connectors_are_dropped() {
        use crate::connector::{JobStage, Mapping, MonitorJob, StandardMonitorJob};

        let mut dell = connector("Dell", &[]);
        if let Some(detection) = dell.connector.detection.as_mut() {
            detection.supersedes = set(&["ipmitool"]);
        }
        dell.monitors.insert(
            "fan",
            MonitorJob::Standard(StandardMonitorJob {
                discovery: Some(JobStage { mapping: Some(Mapping::default()), ..JobStage::default() }),
                collect: None,
            }),
        );
        let mut generic = connector("GenericFans", &[]);
        if let Some(detection) = generic.connector.detection.as_mut() {
            detection.on_last_resort = Some("fan".into());
        }
        let mut generic_disks = connector("GenericDisks", &[]);
        if let Some(detection) = generic_disks.connector.detection.as_mut() {
            detection.on_last_resort = Some("disk".into());
        }

        let detected = [dell, connector("IpmiTool", &[]), generic, generic_disks]
            .into_iter()
            .map(|c| ConnectorTestResult { connector: Arc::new(c), outcomes: Vec::new(), success: true })
            .collect();

        let kept: Vec<String> = filter_detected("srv-01", detected).iter().map(|r| r.connector.id.clone()).collect();
        assert_eq!(kept, vec!["Dell", "GenericDisks"]);
    }
}
