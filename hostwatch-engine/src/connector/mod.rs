/**
 * CONNECTORS - in-memory model of the declarative connector library
 *
 * ROLE:
 * A connector describes how to detect and monitor one class of hardware or
 * software. It is loaded once, shared read-only between every host through
 * `ConnectorStore`, and identified by its compiled file name.
 *
 * CONTENT:
 * - `connector.detection`: ordered criteria, tags, supersedes, last resort
 * - `beforeAll`: sources executed before any monitor job
 * - `monitors`: ordered map monitor type -> MonitorJob (discovery + collect)
 * - `metrics`: metric definitions (number vs state set)
 * - `embeddedFiles`: text blobs inlined with `${file::name}`
 */
pub mod compute;
pub mod criterion;
pub mod source;
mod store;

pub use compute::Compute;
pub use criterion::{Criterion, CriterionDefinition, CriterionTestResult, CriterionType};
pub use source::{Source, SourceDefinition, SourceType};
pub use store::ConnectorStore;

use crate::collections::OrderedMap;
use crate::constants::MONITOR_ATTRIBUTE_ID;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Linux,
    Windows,
    Network,
    Storage,
    Oob,
    Solaris,
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Linux => "linux",
            DeviceKind::Windows => "windows",
            DeviceKind::Network => "network",
            DeviceKind::Storage => "storage",
            DeviceKind::Oob => "oob",
            DeviceKind::Solaris => "solaris",
            DeviceKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    /// Compiled file name, assigned by the store.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub connector: ConnectorIdentity,
    #[serde(default)]
    pub metrics: OrderedMap<MetricDefinition>,
    #[serde(default)]
    pub before_all: OrderedMap<Source>,
    #[serde(default)]
    pub monitors: OrderedMap<MonitorJob>,
    #[serde(default)]
    pub embedded_files: OrderedMap<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorIdentity {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub information: Option<String>,
    #[serde(default)]
    pub detection: Option<Detection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    #[serde(default = "default_connection_types")]
    pub connection_types: Vec<ConnectionType>,
    #[serde(default)]
    pub disable_auto_detection: bool,
    #[serde(default)]
    pub on_last_resort: Option<String>,
    #[serde(default)]
    pub applies_to: BTreeSet<DeviceKind>,
    #[serde(default)]
    pub supersedes: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            connection_types: default_connection_types(),
            disable_auto_detection: false,
            on_last_resort: None,
            applies_to: BTreeSet::new(),
            supersedes: BTreeSet::new(),
            tags: BTreeSet::new(),
            criteria: Vec::new(),
        }
    }
}

fn default_connection_types() -> Vec<ConnectionType> {
    vec![ConnectionType::Remote, ConnectionType::Local]
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricDefinition {
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub metric_type: MetricKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    UpDownCounter,
    StateSet(Vec<String>),
}

/// Monitor job of one monitor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MonitorJob {
    Standard(StandardMonitorJob),
}

impl Default for MonitorJob {
    fn default() -> Self {
        MonitorJob::Standard(StandardMonitorJob::default())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StandardMonitorJob {
    #[serde(default)]
    pub discovery: Option<JobStage>,
    #[serde(default)]
    pub collect: Option<Collect>,
}

/// Sources, their ordering constraints and the mapping reading their output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStage {
    #[serde(default)]
    pub sources: OrderedMap<Source>,
    #[serde(default)]
    pub execution_order: Vec<String>,
    /// Source key -> keys it must run after, on top of the references
    /// found in the sources themselves.
    #[serde(default)]
    pub dependencies: HashMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub mapping: Option<Mapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Collect {
    MonoInstance(MonoInstanceCollect),
    MultiInstance(MultiInstanceCollect),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonoInstanceCollect {
    #[serde(flatten)]
    pub stage: JobStage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceCollect {
    #[serde(flatten)]
    pub stage: JobStage,
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,
}

pub fn default_keys() -> Vec<String> {
    vec![MONITOR_ATTRIBUTE_ID.to_string()]
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub source: String,
    #[serde(default)]
    pub attributes: OrderedMap<String>,
    #[serde(default)]
    pub metrics: OrderedMap<String>,
    #[serde(default)]
    pub legacy_text_parameters: OrderedMap<String>,
}

impl Collect {
    pub fn stage(&self) -> &JobStage {
        match self {
            Collect::MonoInstance(mono) => &mono.stage,
            Collect::MultiInstance(multi) => &multi.stage,
        }
    }
}

impl MonitorJob {
    pub fn standard(&self) -> &StandardMonitorJob {
        match self {
            MonitorJob::Standard(job) => job,
        }
    }

    pub fn discovery(&self) -> Option<&JobStage> {
        self.standard().discovery.as_ref()
    }

    pub fn collect(&self) -> Option<&Collect> {
        self.standard().collect.as_ref()
    }

    /// Attributes identifying an instance: the multi-instance keys, `id` otherwise.
    pub fn keys(&self) -> Vec<String> {
        match self.collect() {
            Some(Collect::MultiInstance(multi)) if !multi.keys.is_empty() => multi.keys.clone(),
            _ => default_keys(),
        }
    }

    fn stages(&self) -> impl Iterator<Item = &JobStage> {
        self.discovery().into_iter().chain(self.collect().map(Collect::stage))
    }
}

impl Connector {
    pub fn compiled_filename(&self) -> &str {
        &self.id
    }

    pub fn detection(&self) -> Option<&Detection> {
        self.connector.detection.as_ref()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.detection()
            .is_some_and(|d| d.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    }

    /// Every source type this connector may execute.
    pub fn source_types(&self) -> BTreeSet<SourceType> {
        self.before_all
            .values()
            .chain(self.monitors.values().flat_map(|job| job.stages().flat_map(|s| s.sources.values())))
            .map(Source::source_type)
            .collect()
    }

    /// Whether a discovery mapping exists for `monitor_type`.
    pub fn discovers(&self, monitor_type: &str) -> bool {
        self.monitors
            .get(monitor_type)
            .and_then(MonitorJob::discovery)
            .is_some_and(|stage| stage.mapping.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAN_CONNECTOR: &str = r#"
connector:
  displayName: Dell OpenManage
  information: Dell servers through SNMP
  detection:
    appliesTo: [linux, windows, oob]
    tags: [hardware]
    criteria:
      - type: snmpGetNext
        oid: 1.3.6.1.4.1.674.10892.1
metrics:
  hw.status:
    type:
      stateSet: [ok, degraded, failed]
  hw.fan.speed:
    unit: rpm
monitors:
  fan:
    discovery:
      sources:
        fanTable:
          type: snmpTable
          oid: 1.3.6.1.4.1.674.10892.1.700.12.1
          selectColumns: ID,9,11
      mapping:
        source: ${source::fanTable}
        attributes:
          id: $1
    collect:
      type: multiInstance
      keys: [id]
      executionOrder: [fanTable]
      sources:
        fanTable:
          type: snmpTable
          oid: 1.3.6.1.4.1.674.10892.1.700.12.1
          selectColumns: ID,9
      mapping:
        source: ${source::fanTable}
        attributes:
          id: $1
        metrics:
          hw.fan.speed: $2
"#;

    #[test]
    fn parses_a_standard_job() {
        let connector: Connector = serde_yaml::from_str(FAN_CONNECTOR).unwrap();

        assert!(connector.has_tag("HARDWARE"));
        assert!(connector.discovers("fan"));
        assert!(!connector.discovers("cpu"));
        assert_eq!(connector.source_types(), BTreeSet::from([SourceType::SnmpTable]));

        let job = connector.monitors.get("fan").unwrap();
        assert_eq!(job.keys(), vec!["id"]);
        let Some(Collect::MultiInstance(multi)) = job.collect() else { panic!("multi-instance expected") };
        assert_eq!(multi.stage.execution_order, vec!["fanTable"]);
        assert_eq!(multi.stage.mapping.as_ref().unwrap().metrics.get("hw.fan.speed").unwrap(), "$2");

        assert_eq!(
            connector.metrics.get("hw.status").unwrap().metric_type,
            MetricKind::StateSet(vec!["ok".into(), "degraded".into(), "failed".into()])
        );
        assert_eq!(connector.metrics.get("hw.fan.speed").unwrap().metric_type, MetricKind::Gauge);
    }

    #[test]
    fn detection_defaults_to_both_connection_types() {
        let detection: Detection = serde_yaml::from_str("appliesTo: [storage]").unwrap();
        assert_eq!(detection.connection_types, vec![ConnectionType::Remote, ConnectionType::Local]);
        assert!(!detection.disable_auto_detection);
    }
}
