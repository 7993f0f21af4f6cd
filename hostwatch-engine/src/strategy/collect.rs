//! Collect: refreshes the metrics of the monitors created by discovery.

use super::detection::{record_connector_status, test_connector};
use super::mapping::MappingProcessor;
use super::sources::{stage_prefix, SourceProcessor};
use super::{detected_connectors, run_connector_jobs, Strategy, StrategyContext};
use crate::collections::OrderedMap;
use crate::connector::{Collect, Connector, Mapping};
use crate::constants::{present_metric_name, HOST_MONITOR_TYPE};
use crate::error::EngineError;
use crate::source_table::SourceTable;
use crate::telemetry::{MetricFactory, Monitor, MonitorStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct CollectStrategy {
    context: StrategyContext,
}

impl CollectStrategy {
    pub fn new(context: StrategyContext) -> Self {
        Self { context }
    }

    /// Re-runs the detection criteria of a connector before collecting from
    /// it. Connectors without criteria and the configured connector are
    /// trusted as is.
    async fn revalidate(&self, connector: &Arc<Connector>) -> Result<bool, EngineError> {
        let host = self.context.telemetry_manager.host_configuration();
        let has_criteria = connector.detection().is_some_and(|d| !d.criteria.is_empty());
        if !has_criteria || host.configured_connector_id.as_deref() == Some(connector.id.as_str()) {
            return Ok(true);
        }

        let context = self.context.clone();
        let tested = connector.clone();
        let test_result = match tokio::task::spawn_blocking(move || test_connector(&context, &tested)).await {
            Ok(result) => result?,
            Err(e) => {
                error!(
                    "Hostname {} - Connector {}: {}",
                    self.context.hostname(),
                    connector.id,
                    EngineError::Join(e.to_string())
                );
                return Ok(false);
            }
        };

        record_connector_status(&self.context, &test_result);
        Ok(test_result.success)
    }
}

impl Strategy for CollectStrategy {
    type Output = ();

    fn name(&self) -> &'static str {
        "collect"
    }

    fn strategy_time(&self) -> i64 {
        self.context.strategy_time
    }

    /// Metrics collected at discovery keep a current timestamp between
    /// discoveries.
    async fn prepare(&self) -> Result<(), EngineError> {
        let mut store = self.context.telemetry_manager.monitors();
        for monitor in store.iter_mut() {
            for metric in monitor.metrics.values_mut() {
                if metric.reset_metric_time() {
                    metric.set_collect_time(self.context.strategy_time);
                }
            }
        }
        Ok(())
    }

    async fn run(&self) -> Result<(), EngineError> {
        let hostname = self.context.hostname();
        for connector in detected_connectors(&self.context.telemetry_manager) {
            if !self.revalidate(&connector).await? {
                info!(
                    "Hostname {} - Connector {} no longer matches the platform, collect skipped",
                    hostname,
                    connector.id
                );
                continue;
            }
            run_connector_jobs(&self.context, &connector, collect_monitor_job).await?;
        }
        Ok(())
    }

    /// Marks every monitor present at this strategy time.
    async fn post(&self) -> Result<(), EngineError> {
        let factory = MetricFactory::new(self.context.hostname());
        let strategy_time = self.context.strategy_time;
        let mut store = self.context.telemetry_manager.monitors();
        for monitor in store.iter_mut() {
            let name = present_metric_name(&monitor.monitor_type);
            match monitor.get_metric_mut(&name) {
                Some(present) => present.set_collect_time(strategy_time),
                None => factory.collect_number_metric(monitor, &name, 1.0, strategy_time),
            }
        }
        Ok(())
    }
}

fn collect_monitor_job(
    context: &StrategyContext,
    connector: &Connector,
    monitor_type: &str,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let telemetry_manager = &context.telemetry_manager;
    let Some(collect) = connector.monitors.get(monitor_type).and_then(|job| job.collect()) else {
        return Ok(());
    };
    let stage = collect.stage();

    let prefix = stage_prefix(monitor_type, "collect");
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
            "Hostname {} - Connector {} - {} collect: no table for mapping source {}",
            telemetry_manager.hostname(),
            connector.id,
            monitor_type,
            mapping.source
        );
        return Ok(());
    };

    let job = MappingJob { context, connector, monitor_type, mapping, prefix: &prefix };
    match collect {
        Collect::MonoInstance(_) => job.collect_mono_instance(&table),
        Collect::MultiInstance(multi) => job.collect_multi_instance(&table, &multi.keys, cancel)?,
    }
    Ok(())
}

struct Interpreted {
    metrics: OrderedMap<String>,
    legacy_text_parameters: OrderedMap<String>,
}

impl From<&MappingProcessor<'_>> for Interpreted {
    fn from(processor: &MappingProcessor<'_>) -> Self {
        Self {
            metrics: processor.interpret_non_context_metrics(),
            legacy_text_parameters: processor.interpret_legacy_text_parameters(),
        }
    }
}

struct MappingJob<'a> {
    context: &'a StrategyContext,
    connector: &'a Connector,
    monitor_type: &'a str,
    mapping: &'a Mapping,
    prefix: &'a str,
}

impl MappingJob<'_> {
    fn hostname(&self) -> &str {
        self.context.hostname()
    }

    fn processor<'r>(&'r self, row: &'r [String], index: usize) -> MappingProcessor<'r> {
        MappingProcessor::new(
            &self.context.telemetry_manager,
            self.mapping,
            &self.connector.id,
            self.monitor_type,
            self.prefix,
            self.context.strategy_time,
        )
        .with_row(row, index)
    }

    /// Writes the metrics of one mapped row into `monitor`. Non-context values
    /// are interpreted beforehand since `lookup` reads the monitor store.
    fn apply(&self, processor: &MappingProcessor<'_>, interpreted: &Interpreted, monitor: &mut Monitor) {
        let factory = MetricFactory::new(self.hostname());
        let strategy_time = self.context.strategy_time;

        for (key, value) in interpreted.legacy_text_parameters.iter() {
            monitor.add_legacy_text_parameter(key, value.as_str());
        }
        factory.collect_monitor_metrics(self.connector, monitor, &interpreted.metrics, strategy_time, false);
        let context_metrics = processor.interpret_context_metrics(monitor);
        factory.collect_monitor_metrics(self.connector, monitor, &context_metrics, strategy_time, false);
    }

    /// Id of the monitor a mono-instance collect feeds: the endpoint host for
    /// the `host` type, else the monitor of this type owned by the connector.
    fn mono_instance_target(&self, store: &MonitorStore) -> Option<String> {
        if self.monitor_type == HOST_MONITOR_TYPE {
            return store.endpoint_host().map(|host| host.id.clone());
        }
        let mut owned = store
            .find_by_type(self.monitor_type)?
            .values()
            .filter(|monitor| monitor.connector_id() == Some(self.connector.id.as_str()));
        let target = owned.next()?;
        if owned.next().is_some() {
            debug!(
                "Hostname {} - Connector {} - {} collect: several monitors found, feeding {}",
                self.hostname(),
                self.connector.id,
                self.monitor_type,
                target.id
            );
        }
        Some(target.id.clone())
    }

    /// Feeds the first row to the single pre-existing monitor. Without one,
    /// nothing is written.
    fn collect_mono_instance(&self, table: &SourceTable) {
        let Some(monitor_id) = self.mono_instance_target(&self.context.telemetry_manager.monitors()) else {
            debug!(
                "Hostname {} - Connector {} - {} collect: no monitor discovered, skipped",
                self.hostname(),
                self.connector.id,
                self.monitor_type
            );
            return;
        };
        let Some(row) = table.first_row() else {
            debug!(
                "Hostname {} - Connector {} - {} collect: empty table, monitor {} left as is",
                self.hostname(),
                self.connector.id,
                self.monitor_type,
                monitor_id
            );
            return;
        };

        let processor = self.processor(row, 1);
        let interpreted = Interpreted::from(&processor);
        let mut store = self.context.telemetry_manager.monitors();
        if let Some(monitor) = store.find_mut(self.monitor_type, &monitor_id) {
            self.apply(&processor, &interpreted, monitor);
        }
    }

    /// Matches each row to a discovered monitor of the connector through the
    /// key attributes. Unmatched rows are dropped, no monitor is created.
    fn collect_multi_instance(
        &self,
        table: &SourceTable,
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        for (index, row) in table.table.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let processor = self.processor(row, index + 1);
            let attributes = processor.interpret_non_context_attributes();
            let interpreted = Interpreted::from(&processor);

            let mut store = self.context.telemetry_manager.monitors();
            let target = store.find_by_type_mut(self.monitor_type).and_then(|monitors| {
                monitors.values_mut().find(|monitor| {
                    monitor.connector_id() == Some(self.connector.id.as_str()) && monitor.matches_keys(keys, &attributes)
                })
            });

            match target {
                Some(monitor) => self.apply(&processor, &interpreted, monitor),
                None => debug!(
                    "Hostname {} - Connector {} - {} collect: row {} matches no monitor on {:?}, skipped",
                    self.hostname(),
                    self.connector.id,
                    self.monitor_type,
                    index + 1,
                    keys
                ),
            }
        }
        Ok(())
    }
}
