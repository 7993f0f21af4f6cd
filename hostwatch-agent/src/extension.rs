//! Local protocol: command lines run by the agent itself, and process
//! criteria answered from the process table.

use crate::execution::{self, ExecutionResult};
use hostwatch_engine::connector::{
    Criterion, CriterionDefinition, CriterionTestResult, CriterionType, Source, SourceDefinition, SourceType,
};
use hostwatch_engine::extension::{Configuration, DecryptFn, ProtocolExtension};
use hostwatch_engine::macros::replace_host_macros;
use hostwatch_engine::{ExtensionError, SourceTable, TelemetryManager};
use regex::RegexBuilder;
use serde::Deserialize;
use std::any::Any;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

const CONFIGURATION_TYPE: &str = "commandline";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandLineConfiguration {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Configuration for CommandLineConfiguration {
    fn configuration_type(&self) -> &str {
        CONFIGURATION_TYPE
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self, resource_key: &str) -> Result<(), ExtensionError> {
        if self.timeout_secs == Some(0) {
            return Err(ExtensionError::InvalidConfiguration {
                configuration_type: CONFIGURATION_TYPE.into(),
                message: format!("timeout must be positive for {resource_key}"),
            });
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct LocalCommandExtension;

impl LocalCommandExtension {
    pub fn new() -> Self {
        Self
    }

    fn configuration<'a>(&self, telemetry_manager: &'a TelemetryManager) -> Option<&'a CommandLineConfiguration> {
        telemetry_manager
            .host_configuration()
            .configuration(CONFIGURATION_TYPE)?
            .as_any()
            .downcast_ref::<CommandLineConfiguration>()
    }

    /// Runs a command line with macros replaced, bounded by the explicit
    /// timeout, else the configured one, else the default.
    fn run(
        &self,
        command_line: &str,
        timeout_secs: Option<u64>,
        telemetry_manager: &TelemetryManager,
    ) -> anyhow::Result<ExecutionResult> {
        let configuration = self.configuration(telemetry_manager);
        let hostname = configuration
            .and_then(|c| c.hostname.as_deref())
            .unwrap_or_else(|| telemetry_manager.hostname());
        let username = configuration.and_then(|c| c.username.as_deref());
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .or_else(|| configuration.and_then(|c| c.timeout()))
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        execution::execute(&replace_host_macros(command_line, hostname, username, None), timeout)
    }

    fn running_process_matches(pattern: &str) -> Result<bool, regex::Error> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        let mut sys = System::new();
        sys.refresh_processes();
        Ok(sys.processes().values().any(|process| {
            let command_line = process.cmd().join(" ");
            regex.is_match(if command_line.is_empty() { process.name() } else { &command_line })
        }))
    }
}

impl ProtocolExtension for LocalCommandExtension {
    fn identifier(&self) -> &str {
        CONFIGURATION_TYPE
    }

    fn supported_sources(&self) -> &[SourceType] {
        &[SourceType::CommandLine]
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &[CriterionType::CommandLine, CriterionType::Process]
    }

    fn is_supported_configuration_type(&self, configuration_type: &str) -> bool {
        configuration_type.eq_ignore_ascii_case(CONFIGURATION_TYPE)
    }

    fn is_valid_configuration(&self, configuration: &dyn Configuration) -> bool {
        configuration.as_any().is::<CommandLineConfiguration>()
    }

    fn check_protocol(&self, telemetry_manager: &TelemetryManager) -> Option<bool> {
        self.configuration(telemetry_manager)?;
        let command = if cfg!(windows) { "cmd /c echo ok" } else { "echo ok" };
        Some(self.run(command, None, telemetry_manager).is_ok_and(|result| result.success))
    }

    fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<SourceTable, ExtensionError> {
        let SourceDefinition::CommandLine(command) = &source.definition else {
            return Err(ExtensionError::UnsupportedSource {
                extension: CONFIGURATION_TYPE.into(),
                source_type: source.source_type(),
            });
        };

        let result = match self.run(&command.command_line, command.timeout, telemetry_manager) {
            Ok(result) => result,
            Err(e) => {
                warn!("Hostname {} - {} - command line source failed: {:#}", telemetry_manager.hostname(), connector_id, e);
                return Ok(SourceTable::empty());
            }
        };
        debug!(
            "Hostname {} - {} - `{}` exited with {:?} in {}ms",
            telemetry_manager.hostname(),
            connector_id,
            command.command_line,
            result.exit_code,
            result.execution_time_ms
        );

        let columns: Vec<usize> = command.select_columns.iter().filter_map(|c| c.trim().parse().ok()).collect();
        Ok(SourceTable::from_rows(execution::output_to_rows(
            &result.output,
            command.begin_at_line_number,
            command.end_at_line_number,
            command.separators.as_deref(),
            &columns,
        )))
    }

    fn process_criterion(
        &self,
        criterion: &Criterion,
        _connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<CriterionTestResult, ExtensionError> {
        let hostname = telemetry_manager.hostname();
        let result = match &criterion.definition {
            CriterionDefinition::CommandLine(command) => {
                match self.run(&command.command_line, command.timeout, telemetry_manager) {
                    Err(e) => CriterionTestResult::failure(
                        format!("Command line `{}` on {hostname} failed: {e:#}", command.command_line),
                        None,
                    ),
                    Ok(result) => {
                        let output = result.output.trim().to_string();
                        let matched = match command.expected_result.as_deref() {
                            None => result.success,
                            Some(expected) => RegexBuilder::new(expected)
                                .case_insensitive(true)
                                .build()
                                .is_ok_and(|re| re.is_match(&output)),
                        };
                        if matched {
                            CriterionTestResult::success(
                                format!("Command line `{}` on {hostname} succeeded", command.command_line),
                                output,
                            )
                        } else {
                            let message = command.error_message.clone().unwrap_or_else(|| {
                                format!("Command line `{}` on {hostname} did not match", command.command_line)
                            });
                            CriterionTestResult::failure(message, Some(output))
                        }
                    }
                }
            }
            CriterionDefinition::Process(process) => match Self::running_process_matches(&process.command_line) {
                Ok(true) => CriterionTestResult::success(
                    format!("A process matching {} is running on {hostname}", process.command_line),
                    process.command_line.clone(),
                ),
                Ok(false) => CriterionTestResult::failure(
                    format!("No process matching {} on {hostname}", process.command_line),
                    None,
                ),
                Err(e) => CriterionTestResult::failure(format!("Invalid process pattern {}: {e}", process.command_line), None),
            },
            other => {
                return Err(ExtensionError::UnsupportedCriterion {
                    extension: CONFIGURATION_TYPE.into(),
                    criterion_type: other.criterion_type(),
                })
            }
        };
        Ok(result)
    }

    fn build_configuration(
        &self,
        _configuration_type: &str,
        raw: &serde_json::Value,
        decrypt: Option<DecryptFn<'_>>,
    ) -> Result<Box<dyn Configuration>, ExtensionError> {
        let mut configuration: CommandLineConfiguration = serde_json::from_value(raw.clone())?;
        if let (Some(decrypt), Some(username)) = (decrypt, configuration.username.as_mut()) {
            *username = decrypt(username);
        }
        configuration.validate(CONFIGURATION_TYPE)?;
        Ok(Box::new(configuration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwatch_engine::connector::criterion::{CommandLineCriterion, ProcessCriterion};
    use hostwatch_engine::connector::source::CommandLineSource;
    use hostwatch_engine::{ConnectorStore, DeviceKind, HostConfiguration};
    use std::sync::Arc;

    fn manager(configuration: CommandLineConfiguration) -> TelemetryManager {
        let host = HostConfiguration::new("localhost", DeviceKind::Linux).with_configuration(Arc::new(configuration));
        TelemetryManager::new(host, Arc::new(ConnectorStore::new()))
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let raw = serde_json::json!({ "timeout_secs": 0 });
        assert!(LocalCommandExtension::new().build_configuration("commandline", &raw, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_output_becomes_a_table() {
        let tm = manager(CommandLineConfiguration::default());
        let source = Source::new(SourceDefinition::CommandLine(CommandLineSource {
            command_line: "printf 'name;size\\nsda;100\\nsdb;200\\n'".into(),
            begin_at_line_number: Some(2),
            separators: Some(";".into()),
            select_columns: vec!["1".into(), "2".into()],
            ..CommandLineSource::default()
        }));

        let table = LocalCommandExtension::new().process_source(&source, "Local", &tm).unwrap();
        assert_eq!(table.table, vec![vec!["sda", "100"], vec!["sdb", "200"]]);
    }

    #[cfg(unix)]
    #[test]
    fn criterion_matches_expected_output() {
        let tm = manager(CommandLineConfiguration { hostname: Some("srv-01".into()), ..Default::default() });
        let criterion = |expected: &str| {
            Criterion::new(CriterionDefinition::CommandLine(CommandLineCriterion {
                command_line: "echo running on %{HOSTNAME}".into(),
                expected_result: Some(expected.into()),
                execute_locally: true,
                timeout: Some(5),
                error_message: None,
            }))
        };
        let extension = LocalCommandExtension::new();

        let ok = extension.process_criterion(&criterion("srv-01"), "Local", &tm).unwrap();
        assert!(ok.success);
        assert_eq!(ok.result.as_deref(), Some("running on srv-01"));
        assert!(!extension.process_criterion(&criterion("^nothing$"), "Local", &tm).unwrap().success);
    }

    #[test]
    fn invalid_process_pattern_fails_the_criterion() {
        let tm = manager(CommandLineConfiguration::default());
        let criterion = Criterion::new(CriterionDefinition::Process(ProcessCriterion { command_line: "(".into() }));
        let result = LocalCommandExtension::new().process_criterion(&criterion, "Local", &tm).unwrap();
        assert!(!result.success);
    }
}
