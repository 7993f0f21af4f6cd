use super::monitor::{Monitor, MonitorStore};
use crate::collections::OrderedMap;
use crate::config::{EngineSettings, HostConfiguration};
use crate::connector::{Connector, ConnectorStore};
use crate::constants::{MONITOR_ATTRIBUTE_ID, MONITOR_ATTRIBUTE_PARENT_ID};
use crate::error::EngineError;
use crate::source_table::SourceTableRegistry;
use crate::state::{new_state, SerializationLocks, Shared};
use crate::strategy::Strategy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Host-scoped aggregate: configuration, connector library, monitor store
/// and per-cycle source tables. One per monitored host, shared behind an
/// `Arc` by the strategies and their worker jobs.
#[derive(Debug)]
pub struct TelemetryManager {
    host_configuration: Arc<HostConfiguration>,
    connector_store: Arc<ConnectorStore>,
    settings: EngineSettings,
    monitors: Shared<MonitorStore>,
    source_tables: Shared<SourceTableRegistry>,
    strategy_time: Mutex<i64>,
    serialization: SerializationLocks,
}

impl TelemetryManager {
    pub fn new(host_configuration: HostConfiguration, connector_store: Arc<ConnectorStore>) -> Self {
        Self {
            host_configuration: Arc::new(host_configuration),
            connector_store,
            settings: EngineSettings::default(),
            monitors: new_state(MonitorStore::new()),
            source_tables: new_state(SourceTableRegistry::new()),
            strategy_time: Mutex::new(0),
            serialization: SerializationLocks::new(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.host_configuration.hostname
    }

    pub fn host_configuration(&self) -> &HostConfiguration {
        &self.host_configuration
    }

    pub fn connector_store(&self) -> &ConnectorStore {
        &self.connector_store
    }

    pub fn connector(&self, connector_id: &str) -> Option<Arc<Connector>> {
        self.connector_store.get(connector_id)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Exclusive access to the monitor store. Keep the guard short: worker
    /// jobs of the same host contend on it.
    pub fn monitors(&self) -> MutexGuard<'_, MonitorStore> {
        self.monitors.lock()
    }

    pub fn source_tables(&self) -> MutexGuard<'_, SourceTableRegistry> {
        self.source_tables.lock()
    }

    pub fn serialization(&self) -> &SerializationLocks {
        &self.serialization
    }

    pub fn strategy_time(&self) -> i64 {
        *self.strategy_time.lock()
    }

    pub fn set_strategy_time(&self, strategy_time: i64) {
        *self.strategy_time.lock() = strategy_time;
    }

    /// Snapshot of the monitors of one type, keyed by id.
    pub fn find_monitors_by_type(&self, monitor_type: &str) -> BTreeMap<String, Monitor> {
        self.monitors().find_by_type(monitor_type).cloned().unwrap_or_default()
    }

    pub fn find_monitor_by_type_and_id(&self, monitor_type: &str, id: &str) -> Option<Monitor> {
        self.monitors().find(monitor_type, id).cloned()
    }

    pub fn endpoint_host_monitor(&self) -> Option<Monitor> {
        self.monitors().endpoint_host().cloned()
    }

    /// Monitor designated by the `parent_id` attribute, looked up among the
    /// monitors of the same connector first.
    pub fn find_parent_monitor(&self, monitor: &Monitor) -> Option<Monitor> {
        let parent_id = monitor.attribute(MONITOR_ATTRIBUTE_PARENT_ID)?;
        let store = self.monitors();
        let same_connector = |m: &&Monitor| m.connector_id() == monitor.connector_id();
        let parent = store
            .iter()
            .filter(same_connector)
            .find(|m| m.id == parent_id || m.attribute(MONITOR_ATTRIBUTE_ID) == Some(parent_id))
            .or_else(|| store.iter().find(|m| m.id == parent_id))
            .cloned();
        parent
    }

    pub fn embedded_files(&self, connector_id: &str) -> OrderedMap<String> {
        self.connector(connector_id).map(|c| c.embedded_files.clone()).unwrap_or_default()
    }

    /// Monitors sorted by type then id.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.monitors())
    }

    /// Runs `prepare`, `run` and `post` of `strategy` at its strategy time.
    /// `post` still runs when `run` fails; the `run` error wins. A failure
    /// is logged here and returned so the caller can stop this host's cycle
    /// without touching other hosts.
    pub async fn run_strategy<S: Strategy>(&self, strategy: &S) -> Result<S::Output, EngineError> {
        self.set_strategy_time(strategy.strategy_time());
        debug!("Hostname {} - Running {} at {}", self.hostname(), strategy.name(), strategy.strategy_time());

        let result = async {
            strategy.prepare().await?;
            let output = strategy.run().await;
            let posted = strategy.post().await;
            let output = output?;
            posted?;
            Ok::<_, EngineError>(output)
        }
        .await;

        if let Err(e) = &result {
            error!("Hostname {} - {} failed: {}", self.hostname(), strategy.name(), e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::DeviceKind;
    use crate::constants::MONITOR_ATTRIBUTE_CONNECTOR_ID;

    fn manager() -> TelemetryManager {
        TelemetryManager::new(HostConfiguration::new("srv-01", DeviceKind::Linux), Arc::new(ConnectorStore::new()))
    }

    #[test]
    fn parent_lookup_prefers_same_connector() {
        let tm = manager();
        {
            let mut store = tm.monitors();
            for (id, connector) in [("enc-dell", "dell"), ("enc-hp", "hp")] {
                let mut enclosure = Monitor::new("enclosure", id);
                enclosure.add_attribute(MONITOR_ATTRIBUTE_CONNECTOR_ID, connector);
                enclosure.add_attribute("id", "1");
                store.add_monitor(enclosure);
            }
        }

        let mut fan = Monitor::new("fan", "fan-1");
        fan.add_attribute(MONITOR_ATTRIBUTE_CONNECTOR_ID, "hp");
        fan.add_attribute(MONITOR_ATTRIBUTE_PARENT_ID, "1");

        assert_eq!(tm.find_parent_monitor(&fan).unwrap().id, "enc-hp");
    }

    #[test]
    fn json_is_sorted_by_type_then_id() {
        let tm = manager();
        tm.monitors().add_monitor(Monitor::new("fan", "b"));
        tm.monitors().add_monitor(Monitor::new("fan", "a"));
        tm.monitors().add_monitor(Monitor::endpoint("host", "srv-01"));

        let json = tm.to_json().unwrap();
        let fan_a = json.find("\"id\": \"a\"").unwrap();
        let fan_b = json.find("\"id\": \"b\"").unwrap();
        let host = json.find("\"id\": \"srv-01\"").unwrap();
        assert!(fan_a < fan_b && fan_b < host);
    }

    struct FailingRun {
        posted: Mutex<u32>,
    }

    impl Strategy for FailingRun {
        type Output = ();

        fn name(&self) -> &'static str {
            "failing"
        }

        fn strategy_time(&self) -> i64 {
            42
        }

        async fn run(&self) -> Result<(), EngineError> {
            Err(EngineError::NoExtensionForSource(crate::connector::SourceType::SnmpTable))
        }

        async fn post(&self) -> Result<(), EngineError> {
            *self.posted.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_runs_after_a_failed_run() {
        let tm = manager();
        let strategy = FailingRun { posted: Mutex::new(0) };

        let err = tm.run_strategy(&strategy).await.unwrap_err();
        assert!(matches!(err, EngineError::NoExtensionForSource(_)));
        assert_eq!(*strategy.posted.lock(), 1);
        assert_eq!(tm.strategy_time(), 42);
    }

    #[test]
    fn snapshots_are_detached_from_the_store() {
        let tm = manager();
        tm.monitors().add_monitor(Monitor::new("disk", "d1"));

        let mut snapshot = tm.find_monitors_by_type("disk");
        snapshot.clear();
        assert_eq!(tm.find_monitors_by_type("disk").len(), 1);
        assert!(tm.find_monitor_by_type_and_id("disk", "d1").is_some());
        assert!(tm.find_monitors_by_type("fan").is_empty());
    }
}
