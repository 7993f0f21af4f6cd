/*!
Fluent builders for in-memory connectors

Scenario tests describe connectors in code instead of YAML files: a
`ConnectorBuilder` carries the detection block, a `JobBuilder` one monitor
job and a `StageBuilder` the sources and mapping of one stage. The free
functions build the sources and criteria most scenarios need.
*/

use hostwatch_engine::collections::OrderedMap;
use hostwatch_engine::connector::criterion::{CommandLineCriterion, SnmpCriterion};
use hostwatch_engine::connector::source::{CommandLineSource, SnmpGetSource, SnmpTableSource, StaticSource};
use hostwatch_engine::connector::{
    Collect, Connector, Criterion, CriterionDefinition, Detection, JobStage, Mapping, MetricDefinition, MetricKind,
    MonitorJob, MonoInstanceCollect, MultiInstanceCollect, Source, SourceDefinition, StandardMonitorJob,
};
use hostwatch_engine::DeviceKind;
use std::collections::BTreeSet;

pub struct ConnectorBuilder {
    id: String,
    connector: Connector,
}

impl ConnectorBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut connector = Connector::default();
        connector.id = id.clone();
        connector.connector.display_name = Some(id.clone());
        Self { id, connector }
    }

    fn detection(&mut self) -> &mut Detection {
        self.connector.connector.detection.get_or_insert_with(Detection::default)
    }

    pub fn information(mut self, information: impl Into<String>) -> Self {
        self.connector.connector.information = Some(information.into());
        self
    }

    pub fn applies_to(mut self, kinds: &[DeviceKind]) -> Self {
        self.detection().applies_to = kinds.iter().copied().collect();
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.detection().tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn supersedes(mut self, ids: &[&str]) -> Self {
        self.detection().supersedes = ids.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>();
        self
    }

    pub fn on_last_resort(mut self, monitor_type: impl Into<String>) -> Self {
        self.detection().on_last_resort = Some(monitor_type.into());
        self
    }

    pub fn disable_auto_detection(mut self) -> Self {
        self.detection().disable_auto_detection = true;
        self
    }

    pub fn criterion(mut self, criterion: Criterion) -> Self {
        self.detection().criteria.push(criterion);
        self
    }

    pub fn state_set_metric(mut self, name: &str, states: &[&str]) -> Self {
        self.connector.metrics.insert(
            name,
            MetricDefinition {
                metric_type: MetricKind::StateSet(states.iter().map(|s| s.to_string()).collect()),
                ..MetricDefinition::default()
            },
        );
        self
    }

    pub fn before_all(mut self, key: &str, source: Source) -> Self {
        self.connector.before_all.insert(key, source);
        self
    }

    pub fn embedded_file(mut self, name: &str, content: &str) -> Self {
        self.connector.embedded_files.insert(name, content.to_string());
        self
    }

    pub fn monitor(mut self, monitor_type: &str, job: JobBuilder) -> Self {
        self.connector.monitors.insert(monitor_type, job.build());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn build(self) -> Connector {
        self.connector
    }
}

/// Builder of one standard monitor job.
#[derive(Default)]
pub struct JobBuilder {
    job: StandardMonitorJob,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovery(mut self, stage: StageBuilder) -> Self {
        self.job.discovery = Some(stage.build());
        self
    }

    pub fn mono_instance(mut self, stage: StageBuilder) -> Self {
        self.job.collect = Some(Collect::MonoInstance(MonoInstanceCollect { stage: stage.build() }));
        self
    }

    pub fn multi_instance(mut self, keys: &[&str], stage: StageBuilder) -> Self {
        self.job.collect = Some(Collect::MultiInstance(MultiInstanceCollect {
            stage: stage.build(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }));
        self
    }

    pub fn build(self) -> MonitorJob {
        MonitorJob::Standard(self.job)
    }
}

/// Builder of one job stage: sources, ordering hints and mapping.
#[derive(Default)]
pub struct StageBuilder {
    stage: JobStage,
}

impl StageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, key: &str, source: Source) -> Self {
        self.stage.sources.insert(key, source);
        self
    }

    pub fn execution_order(mut self, keys: &[&str]) -> Self {
        self.stage.execution_order = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, key: &str, prerequisites: &[&str]) -> Self {
        self.stage
            .dependencies
            .entry(key.to_string())
            .or_default()
            .extend(prerequisites.iter().map(|p| p.to_string()));
        self
    }

    /// Mapping reading `source` (a `${source::...}` reference).
    pub fn mapping(mut self, source: &str, attributes: &[(&str, &str)], metrics: &[(&str, &str)]) -> Self {
        self.stage.mapping = Some(Mapping {
            source: source.to_string(),
            attributes: ordered(attributes),
            metrics: ordered(metrics),
            legacy_text_parameters: OrderedMap::new(),
        });
        self
    }

    pub fn legacy_text_parameters(mut self, parameters: &[(&str, &str)]) -> Self {
        if let Some(mapping) = self.stage.mapping.as_mut() {
            mapping.legacy_text_parameters = ordered(parameters);
        }
        self
    }

    pub fn build(self) -> JobStage {
        self.stage
    }
}

fn ordered(pairs: &[(&str, &str)]) -> OrderedMap<String> {
    pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
}

pub fn snmp_get(oid: &str) -> Source {
    Source::new(SourceDefinition::SnmpGet(SnmpGetSource { oid: oid.into() }))
}

pub fn snmp_table(oid: &str, columns: &[&str]) -> Source {
    Source::new(SourceDefinition::SnmpTable(SnmpTableSource {
        oid: oid.into(),
        select_columns: columns.iter().map(|c| c.to_string()).collect(),
    }))
}

pub fn static_source(value: &str) -> Source {
    Source::new(SourceDefinition::Static(StaticSource { value: value.into() }))
}

pub fn command_line(command: &str) -> Source {
    Source::new(SourceDefinition::CommandLine(CommandLineSource {
        command_line: command.into(),
        ..CommandLineSource::default()
    }))
}

/// Same source, flagged for exclusive execution per connector.
pub fn serialized(mut source: Source) -> Source {
    source.force_serialization = true;
    source
}

pub fn snmp_get_criterion(oid: &str) -> Criterion {
    Criterion::new(CriterionDefinition::SnmpGet(SnmpCriterion { oid: oid.into(), expected_result: None }))
}

pub fn snmp_get_next_criterion(oid: &str) -> Criterion {
    Criterion::new(CriterionDefinition::SnmpGetNext(SnmpCriterion { oid: oid.into(), expected_result: None }))
}

pub fn command_line_criterion(command: &str) -> Criterion {
    Criterion::new(CriterionDefinition::CommandLine(CommandLineCriterion {
        command_line: command.into(),
        expected_result: None,
        execute_locally: false,
        timeout: None,
        error_message: None,
    }))
}

pub fn serialized_criterion(mut criterion: Criterion) -> Criterion {
    criterion.force_serialization = true;
    criterion
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_fan_connector() {
        let connector = ConnectorBuilder::new("Dell")
            .applies_to(&[DeviceKind::Linux])
            .criterion(snmp_get_next_criterion("1.3.6.1.4.1.674"))
            .monitor(
                "fan",
                JobBuilder::new().multi_instance(
                    &["id"],
                    StageBuilder::new()
                        .source("fans", snmp_table("1.3.6.1.4.1.674.10892.1.700.12", &["ID", "9"]))
                        .mapping("${source::fans}", &[("id", "$1")], &[("hw.fan.speed", "$2")]),
                ),
            )
            .build();

        assert_eq!(connector.id, "Dell");
        assert!(!connector.has_tag("missing"));
        assert_eq!(connector.detection().map(|d| d.criteria.len()), Some(1));
        let job = connector.monitors.get("fan").unwrap();
        assert_eq!(job.keys(), vec!["id"]);
    }
}
