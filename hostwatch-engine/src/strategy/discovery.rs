//! Discovery: creates the monitors of every detected connector from the
//! discovery stage of its monitor jobs.

use super::mapping::MappingProcessor;
use super::sources::{stage_prefix, SourceProcessor};
use super::{detected_connectors, run_connector_jobs, Strategy, StrategyContext};
use crate::collections::OrderedMap;
use crate::connector::Connector;
use crate::constants::{HOST_MONITOR_TYPE, MONITOR_ATTRIBUTE_CONNECTOR_ID, MONITOR_ATTRIBUTE_ID};
use crate::error::EngineError;
use crate::telemetry::{MetricFactory, MonitorStore, Monitor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct DiscoveryStrategy {
    context: StrategyContext,
}

impl DiscoveryStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self { context }
    }
}

impl Strategy for DiscoveryStrategy {
    type Output = ();

    fn name(&self) -> &'static str {
        "discovery"
    }

    fn strategy_time(&self) -> i64 {
        self.context.strategy_time
    }

    async fn run(&self) -> Result<(), EngineError> {
        let connectors = detected_connectors(&self.context.telemetry_manager);
        debug!("Hostname {} - Start discovery of {} connector(s)", self.context.hostname(), connectors.len());

        for connector in &connectors {
            run_connector_jobs(&self.context, connector, discover_monitor_job).await?;
        }

        info!(
            "Hostname {} - Discovery done: {} monitor(s)",
            self.context.hostname(),
            self.context.telemetry_manager.monitors().len()
        );
        Ok(())
    }
}

/// `<connector>_<type>_<key values joined by _>`, whitespace removed.
/// `None` when a key attribute is missing.
pub fn build_monitor_id(
    connector_id: &str,
    monitor_type: &str,
    keys: &[String],
    attributes: &OrderedMap<String>,
) -> Option<String> {
    let values = keys
        .iter()
        .map(|key| attributes.get(key).map(String::as_str))
        .collect::<Option<Vec<&str>>>()?;
    let id = format!("{connector_id}_{monitor_type}_{}", values.join("_"));
    Some(id.chars().filter(|c| !c.is_whitespace()).collect())
}

/// The monitor a discovered row lands on: the endpoint host for the `host`
/// type, else the (type, id) monitor, created when missing.
fn discovered_monitor<'a>(store: &'a mut MonitorStore, monitor_type: &str, id: &str) -> Option<&'a mut Monitor> {
    if monitor_type == HOST_MONITOR_TYPE {
        store.endpoint_host_mut()
    } else {
        Some(store.get_or_create(monitor_type, id))
    }
}

fn discover_monitor_job(
    context: &StrategyContext,
    connector: &Connector,
    monitor_type: &str,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let telemetry_manager = &context.telemetry_manager;
    let hostname = telemetry_manager.hostname();
    let Some(job) = connector.monitors.get(monitor_type) else { return Ok(()) };
    let Some(stage) = job.discovery() else { return Ok(()) };

    let prefix = stage_prefix(monitor_type, "discovery");
    SourceProcessor::new(telemetry_manager, &context.extension_manager, connector, &prefix).run_all(
        monitor_type,
        &stage.sources,
        &stage.execution_order,
        &stage.dependencies,
        cancel,
    )?;

    let Some(mapping) = &stage.mapping else { return Ok(()) };
    let Some(table) = telemetry_manager.source_tables().lookup(&mapping.source, &connector.id, &prefix) else {
        debug!(
            "Hostname {} - Connector {} - {} discovery: no table for mapping source {}",
            hostname,
            connector.id,
            monitor_type,
            mapping.source
        );
        return Ok(());
    };

    let keys = job.keys();
    let factory = MetricFactory::new(hostname);
    let strategy_time = context.strategy_time;

    for (index, row) in table.table.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let processor = MappingProcessor::new(telemetry_manager, mapping, &connector.id, monitor_type, &prefix, strategy_time)
            .with_row(row, index + 1);
        let attributes = processor.interpret_non_context_attributes();
        let metrics = processor.interpret_non_context_metrics();
        let legacy_text_parameters = processor.interpret_legacy_text_parameters();

        let Some(id) = build_monitor_id(&connector.id, monitor_type, &keys, &attributes) else {
            debug!(
                "Hostname {} - Connector {} - {} discovery: row {} lacks a key attribute among {:?}, skipped",
                hostname,
                connector.id,
                monitor_type,
                index + 1,
                keys
            );
            continue;
        };

        let mut store = telemetry_manager.monitors();
        let Some(monitor) = discovered_monitor(&mut store, monitor_type, &id) else {
            debug!("Hostname {} - No endpoint host monitor to attach {} discovery to", hostname, connector.id);
            return Ok(());
        };

        // The endpoint host keeps its own id
        let is_endpoint = monitor.is_endpoint;
        monitor.add_attributes(attributes.iter().filter(|(key, _)| !(is_endpoint && *key == MONITOR_ATTRIBUTE_ID)));
        monitor.add_attribute(MONITOR_ATTRIBUTE_CONNECTOR_ID, connector.id.as_str());
        monitor.discovery_time = Some(strategy_time);
        for (key, value) in legacy_text_parameters.iter() {
            monitor.add_legacy_text_parameter(key, value.as_str());
        }

        factory.collect_monitor_metrics(connector, monitor, &metrics, strategy_time, true);
        let context_metrics = processor.interpret_context_metrics(monitor);
        factory.collect_monitor_metrics(connector, monitor, &context_metrics, strategy_time, false);
    }

    debug!(
        "Hostname {} - Connector {} - {} discovery: {} row(s) processed",
        hostname,
        connector.id,
        monitor_type,
        table.table.len()
    );
    Ok(())
}
