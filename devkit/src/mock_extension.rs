/*!
Mock protocol extension for engine tests

Answers sources and criteria from canned responses, without any network.
Every call is recorded with its entry/exit instants so that tests can
assert on ordering, short-circuits and overlapping executions.
*/

use hostwatch_engine::connector::{Criterion, CriterionTestResult, CriterionType, Source, SourceType};
use hostwatch_engine::extension::{Configuration, DecryptFn, ProtocolExtension};
use hostwatch_engine::{ExtensionError, SourceTable, TelemetryManager};
use parking_lot::Mutex;
use serde::Deserialize;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generic configuration accepted by [`MockExtension`].
#[derive(Debug, Clone, Deserialize)]
pub struct MockConfiguration {
    #[serde(default)]
    pub configuration_type: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl MockConfiguration {
    pub fn new(configuration_type: impl Into<String>) -> Self {
        Self { configuration_type: configuration_type.into(), hostname: None, password: None }
    }
}

impl Configuration for MockConfiguration {
    fn configuration_type(&self) -> &str {
        &self.configuration_type
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn validate(&self, resource_key: &str) -> Result<(), ExtensionError> {
        if self.configuration_type.is_empty() {
            return Err(ExtensionError::InvalidConfiguration {
                configuration_type: "mock".into(),
                message: format!("no configuration type for {resource_key}"),
            });
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Source,
    Criterion,
}

/// One recorded call. `target` is the first text field of the source or
/// criterion (OID, command line, query).
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub target: String,
    pub connector_id: String,
    pub started: Instant,
    pub finished: Instant,
}

impl RecordedCall {
    pub fn overlaps(&self, other: &RecordedCall) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Recording extension with canned answers, matched on a substring of the
/// source or criterion target. Unmatched sources return an empty table and
/// unmatched criteria the default criterion result. Answers are shared by
/// clones and can be changed between cycles.
#[derive(Clone)]
pub struct MockExtension {
    identifier: String,
    configuration_type: String,
    source_types: Vec<SourceType>,
    criterion_types: Vec<CriterionType>,
    tables: Arc<Mutex<Vec<(String, SourceTable)>>>,
    criteria: Arc<Mutex<Vec<(String, CriterionTestResult)>>>,
    default_criterion: CriterionTestResult,
    protocol_up: Option<bool>,
    delay: Duration,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockExtension {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            configuration_type: identifier.clone(),
            identifier,
            source_types: Vec::new(),
            criterion_types: Vec::new(),
            tables: Arc::new(Mutex::new(Vec::new())),
            criteria: Arc::new(Mutex::new(Vec::new())),
            default_criterion: CriterionTestResult::success("mock criterion passed", "OK"),
            protocol_up: Some(true),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn supporting_sources(mut self, source_types: &[SourceType]) -> Self {
        self.source_types = source_types.to_vec();
        self
    }

    pub fn supporting_criteria(mut self, criterion_types: &[CriterionType]) -> Self {
        self.criterion_types = criterion_types.to_vec();
        self
    }

    pub fn with_configuration_type(mut self, configuration_type: impl Into<String>) -> Self {
        self.configuration_type = configuration_type.into();
        self
    }

    pub fn with_table(self, target: impl Into<String>, csv: &str) -> Self {
        self.set_table(target, csv);
        self
    }

    pub fn with_criterion(self, target: impl Into<String>, result: CriterionTestResult) -> Self {
        self.set_criterion(target, result);
        self
    }

    /// Replaces the answer for sources matching `target`.
    pub fn set_table(&self, target: impl Into<String>, csv: &str) {
        upsert(&mut self.tables.lock(), target.into(), SourceTable::from_csv(csv));
    }

    /// Replaces the answer for criteria matching `target`.
    pub fn set_criterion(&self, target: impl Into<String>, result: CriterionTestResult) {
        upsert(&mut self.criteria.lock(), target.into(), result);
    }

    pub fn with_default_criterion(mut self, result: CriterionTestResult) -> Self {
        self.default_criterion = result;
        self
    }

    pub fn with_protocol_up(mut self, up: Option<bool>) -> Self {
        self.protocol_up = up;
        self
    }

    /// Blocking delay applied to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Configuration this extension accepts, ready for a host.
    pub fn configuration(&self) -> Arc<dyn Configuration> {
        Arc::new(MockConfiguration::new(self.configuration_type.clone()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<RecordedCall> {
        self.calls.lock().iter().filter(|c| c.kind == kind).cloned().collect()
    }

    /// Targets called, in call order.
    pub fn targets(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.target.clone()).collect()
    }

    pub fn call_count(&self, target: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.target.contains(target)).count()
    }

    /// Highest number of calls seen running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
        self.max_active.store(0, Ordering::SeqCst);
    }

    fn record<T>(&self, kind: CallKind, target: String, connector_id: &str, answer: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = answer();

        self.active.fetch_sub(1, Ordering::SeqCst);
        log::debug!("[MOCK {}] {:?} {} for {}", self.identifier, kind, target, connector_id);
        self.calls.lock().push(RecordedCall {
            kind,
            target,
            connector_id: connector_id.to_string(),
            started,
            finished: Instant::now(),
        });
        result
    }
}

impl ProtocolExtension for MockExtension {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn supported_sources(&self) -> &[SourceType] {
        &self.source_types
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &self.criterion_types
    }

    fn is_supported_configuration_type(&self, configuration_type: &str) -> bool {
        configuration_type.eq_ignore_ascii_case(&self.configuration_type)
    }

    fn is_valid_configuration(&self, configuration: &dyn Configuration) -> bool {
        configuration.configuration_type().eq_ignore_ascii_case(&self.configuration_type)
    }

    fn check_protocol(&self, _telemetry_manager: &TelemetryManager) -> Option<bool> {
        self.protocol_up
    }

    fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        _telemetry_manager: &TelemetryManager,
    ) -> Result<SourceTable, ExtensionError> {
        let source_type = source.source_type();
        if !self.source_types.contains(&source_type) {
            return Err(ExtensionError::UnsupportedSource { extension: self.identifier.clone(), source_type });
        }

        let target = source.definition.text_fields().first().map(|t| t.to_string()).unwrap_or_default();
        Ok(self.record(CallKind::Source, target.clone(), connector_id, || {
            self.tables
                .lock()
                .iter()
                .find(|(matcher, _)| target.contains(matcher.as_str()))
                .map(|(_, table)| table.clone())
                .unwrap_or_default()
        }))
    }

    fn process_criterion(
        &self,
        criterion: &Criterion,
        connector_id: &str,
        _telemetry_manager: &TelemetryManager,
    ) -> Result<CriterionTestResult, ExtensionError> {
        let criterion_type = criterion.criterion_type();
        if !self.criterion_types.contains(&criterion_type) {
            return Err(ExtensionError::UnsupportedCriterion { extension: self.identifier.clone(), criterion_type });
        }

        let target = criterion_target(criterion);
        Ok(self.record(CallKind::Criterion, target.clone(), connector_id, || {
            self.criteria
                .lock()
                .iter()
                .find(|(matcher, _)| target.contains(matcher.as_str()))
                .map(|(_, result)| result.clone())
                .unwrap_or_else(|| self.default_criterion.clone())
        }))
    }

    fn build_configuration(
        &self,
        configuration_type: &str,
        raw: &serde_json::Value,
        decrypt: Option<DecryptFn<'_>>,
    ) -> Result<Box<dyn Configuration>, ExtensionError> {
        let mut configuration: MockConfiguration = serde_json::from_value(raw.clone())?;
        configuration.configuration_type = configuration_type.to_string();
        if let (Some(decrypt), Some(password)) = (decrypt, configuration.password.as_deref()) {
            configuration.password = Some(decrypt(password));
        }
        configuration.validate(&self.identifier)?;
        Ok(Box::new(configuration))
    }
}

fn upsert<T>(answers: &mut Vec<(String, T)>, target: String, answer: T) {
    match answers.iter_mut().find(|(matcher, _)| *matcher == target) {
        Some(entry) => entry.1 = answer,
        None => answers.push((target, answer)),
    }
}

/// First text field of a criterion, the way [`RecordedCall::target`] names it.
pub fn criterion_target(criterion: &Criterion) -> String {
    use hostwatch_engine::connector::CriterionDefinition as C;
    match &criterion.definition {
        C::SnmpGet(c) | C::SnmpGetNext(c) => c.oid.clone(),
        C::Wmi(c) | C::Wbem(c) => c.query.clone(),
        C::Http(c) => c.url.clone().or_else(|| c.path.clone()).unwrap_or_default(),
        C::CommandLine(c) => c.command_line.clone(),
        C::Process(c) => c.command_line.clone(),
        C::Service(c) => c.name.clone(),
        C::Sql(c) => c.query.clone(),
        C::SshInteractive(c) => c.steps.join(" "),
        C::Ipmi(_) | C::DeviceType(_) | C::ProductRequirements(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwatch_engine::connector::criterion::SnmpCriterion;
    use hostwatch_engine::connector::source::SnmpGetSource;
    use hostwatch_engine::connector::{CriterionDefinition, SourceDefinition};
    use hostwatch_engine::{ConnectorStore, DeviceKind, HostConfiguration};

    fn manager() -> TelemetryManager {
        TelemetryManager::new(HostConfiguration::new("srv-01", DeviceKind::Linux), Arc::new(ConnectorStore::new()))
    }

    #[test]
    fn canned_answers_and_recording() {
        let mock = MockExtension::new("snmp")
            .supporting_sources(&[SourceType::SnmpGet])
            .supporting_criteria(&[CriterionType::SnmpGet])
            .with_table("1.3.6.1.2.1.1.1", "Dell;PowerEdge")
            .with_criterion("1.3.6.1.4.1.232", CriterionTestResult::failure("no HP agent", None));
        let tm = manager();

        let source = Source::new(SourceDefinition::SnmpGet(SnmpGetSource { oid: "1.3.6.1.2.1.1.1.0".into() }));
        let table = mock.process_source(&source, "dell", &tm).unwrap();
        assert_eq!(table.table, vec![vec!["Dell", "PowerEdge"]]);

        let criterion = Criterion::new(CriterionDefinition::SnmpGet(SnmpCriterion {
            oid: "1.3.6.1.4.1.232.1".into(),
            expected_result: None,
        }));
        assert!(!mock.process_criterion(&criterion, "hp", &tm).unwrap().success);

        assert_eq!(mock.targets(), vec!["1.3.6.1.2.1.1.1.0", "1.3.6.1.4.1.232.1"]);
        assert_eq!(mock.calls_of(CallKind::Criterion)[0].connector_id, "hp");
        assert_eq!(mock.max_concurrency(), 1);
    }

    #[test]
    fn answers_change_for_every_clone() {
        let mock = MockExtension::new("snmp").supporting_sources(&[SourceType::SnmpGet]).with_table("1.3.6.1.2", "a;1");
        let registered = mock.clone();
        let source = Source::new(SourceDefinition::SnmpGet(SnmpGetSource { oid: "1.3.6.1.2.1".into() }));

        mock.set_table("1.3.6.1.2", "b;2");
        let table = registered.process_source(&source, "dell", &manager()).unwrap();
        assert_eq!(table.table, vec![vec!["b", "2"]]);
    }

    #[test]
    fn unsupported_types_are_dispatch_errors() {
        let mock = MockExtension::new("snmp");
        let source = Source::new(SourceDefinition::SnmpGet(SnmpGetSource { oid: "1.3".into() }));
        let err = mock.process_source(&source, "dell", &manager()).unwrap_err();
        assert!(err.is_dispatch_error());
    }

    #[test]
    fn builds_configuration_with_decryption() {
        let mock = MockExtension::new("http");
        let raw = serde_json::json!({ "hostname": "bmc-01", "password": "secret" });
        let reverse = |s: &str| s.chars().rev().collect::<String>();

        let configuration = mock.build_configuration("http", &raw, Some(&reverse)).unwrap();
        let configuration = configuration.as_any().downcast_ref::<MockConfiguration>().unwrap();
        assert_eq!(configuration.password.as_deref(), Some("terces"));
        assert_eq!(configuration.hostname.as_deref(), Some("bmc-01"));
    }
}
