/*!
Test harness for engine scenarios

Wires one host: connector store, extensions, telemetry manager. Strategies
are run at explicit strategy times so that rate and present-status
assertions stay deterministic.
*/

use anyhow::{bail, Result};
use hostwatch_engine::extension::{Configuration, ProtocolExtension};
use hostwatch_engine::strategy::Strategy;
use hostwatch_engine::telemetry::NumberMetric;
use hostwatch_engine::{
    CollectStrategy, Connector, ConnectorStore, DetectionStrategy, DeviceKind, DiscoveryStrategy, EngineSettings,
    ExtensionManager, HostConfiguration, Monitor, ProtocolHealthCheckStrategy, StrategyContext, TelemetryManager,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub struct TestHarnessBuilder {
    host: HostConfiguration,
    connectors: Vec<Connector>,
    extensions: ExtensionManager,
    settings: EngineSettings,
}

impl TestHarnessBuilder {
    pub fn connector(mut self, connector: Connector) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn extension<T: ProtocolExtension + 'static>(mut self, extension: T) -> Self {
        self.extensions.register(extension);
        self
    }

    pub fn configuration(mut self, configuration: Arc<dyn Configuration>) -> Self {
        self.host = self.host.with_configuration(configuration);
        self
    }

    pub fn directives(mut self, directives: &[&str]) -> Self {
        self.host = self.host.with_connectors(directives.iter().copied());
        self
    }

    pub fn configured_connector(mut self, connector_id: &str) -> Self {
        self.host.configured_connector_id = Some(connector_id.to_string());
        self
    }

    pub fn sequential(mut self) -> Self {
        self.host = self.host.with_sequential(true);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> TestHarness {
        env_logger::try_init().ok();

        let connector_store: Arc<ConnectorStore> = Arc::new(self.connectors.into_iter().collect());
        let telemetry_manager =
            Arc::new(TelemetryManager::new(self.host, connector_store.clone()).with_settings(self.settings));
        TestHarness { connector_store, extension_manager: Arc::new(self.extensions), telemetry_manager }
    }
}

/// One monitored host ready to run strategies.
pub struct TestHarness {
    pub connector_store: Arc<ConnectorStore>,
    pub extension_manager: Arc<ExtensionManager>,
    pub telemetry_manager: Arc<TelemetryManager>,
}

impl TestHarness {
    pub fn builder(hostname: &str, host_type: DeviceKind) -> TestHarnessBuilder {
        TestHarnessBuilder {
            host: HostConfiguration::new(hostname, host_type),
            connectors: Vec::new(),
            extensions: ExtensionManager::new(),
            settings: EngineSettings::default(),
        }
    }

    pub fn context(&self, strategy_time: i64) -> StrategyContext {
        StrategyContext::new(self.telemetry_manager.clone(), self.extension_manager.clone(), strategy_time)
    }

    async fn run<S: Strategy>(&self, strategy: S) -> Result<S::Output> {
        Ok(self.telemetry_manager.run_strategy(&strategy).await?)
    }

    pub async fn detect(&self, strategy_time: i64) -> Result<BTreeSet<String>> {
        self.run(DetectionStrategy::new(self.context(strategy_time))).await
    }

    pub async fn discover(&self, strategy_time: i64) -> Result<()> {
        self.run(DiscoveryStrategy::new(self.context(strategy_time))).await
    }

    pub async fn collect(&self, strategy_time: i64) -> Result<()> {
        self.run(CollectStrategy::new(self.context(strategy_time))).await
    }

    pub async fn check_protocols(&self, strategy_time: i64) -> Result<Vec<(String, Option<bool>)>> {
        self.run(ProtocolHealthCheckStrategy::new(self.context(strategy_time))).await
    }

    /// Detection, discovery then collect, all at `strategy_time`.
    pub async fn cycle(&self, strategy_time: i64) -> Result<BTreeSet<String>> {
        let detected = self.detect(strategy_time).await?;
        self.discover(strategy_time).await?;
        self.collect(strategy_time).await?;
        log::info!("Cycle at {strategy_time}: {} connector(s) detected", detected.len());
        Ok(detected)
    }

    pub fn monitors(&self, monitor_type: &str) -> BTreeMap<String, Monitor> {
        self.telemetry_manager.find_monitors_by_type(monitor_type)
    }

    pub fn monitor(&self, monitor_type: &str, id: &str) -> Option<Monitor> {
        self.telemetry_manager.find_monitor_by_type_and_id(monitor_type, id)
    }

    pub fn number_metric(&self, monitor_type: &str, id: &str, name: &str) -> Option<NumberMetric> {
        self.monitor(monitor_type, id)?.get_number_metric(name).cloned()
    }

    pub fn assert_monitor_count(&self, monitor_type: &str, expected: usize) -> Result<()> {
        let actual = self.monitors(monitor_type).len();
        if actual != expected {
            bail!("expected {expected} {monitor_type} monitor(s), found {actual}");
        }
        Ok(())
    }

    pub fn assert_number_metric(&self, monitor_type: &str, id: &str, name: &str, expected: f64) -> Result<()> {
        match self.number_metric(monitor_type, id, name) {
            Some(metric) if metric.value == expected => Ok(()),
            Some(metric) => bail!("{monitor_type}/{id} {name}: expected {expected}, got {}", metric.value),
            None => bail!("{monitor_type}/{id} has no number metric {name}"),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let store = self.telemetry_manager.monitors();
        let mut monitors_by_type = HashMap::new();
        let mut metrics = 0;
        for monitor in store.iter() {
            *monitors_by_type.entry(monitor.monitor_type.clone()).or_insert(0) += 1;
            metrics += monitor.metrics.len();
        }
        TestStats {
            total_monitors: store.len(),
            total_metrics: metrics,
            monitors_by_type,
            source_tables: self.telemetry_manager.source_tables().len(),
        }
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_monitors: usize,
    pub total_metrics: usize,
    pub monitors_by_type: HashMap<String, usize>,
    pub source_tables: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("Telemetry statistics:");
        println!("  Monitors: {}", self.total_monitors);
        for (monitor_type, count) in &self.monitors_by_type {
            println!("    {}: {}", monitor_type, count);
        }
        println!("  Metrics: {}", self.total_metrics);
        println!("  Source tables: {}", self.source_tables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector_builder::{snmp_get_criterion, ConnectorBuilder};
    use crate::mock_extension::MockExtension;
    use hostwatch_engine::connector::CriterionType;

    #[tokio::test]
    async fn detection_creates_host_and_connector_monitors() {
        let snmp = MockExtension::new("snmp").supporting_criteria(&[CriterionType::SnmpGet]);
        let harness = TestHarness::builder("srv-01", DeviceKind::Linux)
            .configuration(snmp.configuration())
            .extension(snmp)
            .connector(
                ConnectorBuilder::new("Generic")
                    .applies_to(&[DeviceKind::Linux])
                    .criterion(snmp_get_criterion("1.3.6.1.2.1.1.1.0"))
                    .build(),
            )
            .build();

        let detected = harness.detect(1_000).await.unwrap();
        assert_eq!(detected, BTreeSet::from(["Generic".to_string()]));
        harness.assert_monitor_count("host", 1).unwrap();
        harness.assert_monitor_count("connector", 1).unwrap();

        let stats = harness.get_stats();
        stats.print();
        assert_eq!(stats.total_monitors, 2);
    }
}
