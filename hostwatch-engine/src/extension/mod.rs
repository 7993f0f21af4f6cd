/**
 * PROTOCOL EXTENSIONS - single seam between the strategies and the wire
 *
 * ROLE:
 * The engine never speaks SNMP, WMI or SSH itself. Every protocol is an
 * extension declaring the source and criterion types it handles and the
 * configuration types it binds to. `ExtensionManager` is the catalogue the
 * strategies dispatch through.
 *
 * CONTRACT:
 * - protocol failures are values: an empty `SourceTable` or a failed
 *   `CriterionTestResult`, never an error
 * - `Err` is reserved for types the extension does not handle and for
 *   configuration problems
 * - `check_protocol` returns `None` when the host has no configuration for it
 *
 * DISPATCH:
 * - no extension handles the type -> fatal, propagated out of the run
 * - handled but no valid configuration on the host -> `MissingConfiguration`
 *   for a source, failed result for a criterion
 */
use crate::connector::{Criterion, CriterionTestResult, CriterionType, Source, SourceType};
use crate::error::{EngineError, ExtensionError};
use crate::source_table::SourceTable;
use crate::telemetry::TelemetryManager;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Secret decryption hook applied to sensitive configuration fields.
pub type DecryptFn<'a> = &'a dyn Fn(&str) -> String;

/// Typed protocol configuration of a host (credentials, timeouts, ports).
pub trait Configuration: fmt::Debug + Send + Sync {
    /// Tag binding the configuration to an extension (`snmp`, `http`...).
    fn configuration_type(&self) -> &str;

    /// Overrides the host's hostname for this protocol.
    fn hostname(&self) -> Option<&str> {
        None
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn validate(&self, resource_key: &str) -> Result<(), ExtensionError>;

    fn as_any(&self) -> &dyn Any;
}

pub trait ProtocolExtension: Send + Sync {
    fn identifier(&self) -> &str;

    fn supported_sources(&self) -> &[SourceType];

    fn supported_criteria(&self) -> &[CriterionType];

    fn is_supported_configuration_type(&self, configuration_type: &str) -> bool;

    /// Whether `configuration` is one this extension can work with.
    fn is_valid_configuration(&self, configuration: &dyn Configuration) -> bool;

    /// Cheap reachability check.
    fn check_protocol(&self, telemetry_manager: &TelemetryManager) -> Option<bool>;

    fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<SourceTable, ExtensionError>;

    fn process_criterion(
        &self,
        criterion: &Criterion,
        connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<CriterionTestResult, ExtensionError>;

    fn build_configuration(
        &self,
        configuration_type: &str,
        raw: &serde_json::Value,
        decrypt: Option<DecryptFn<'_>>,
    ) -> Result<Box<dyn Configuration>, ExtensionError>;
}

/// Catalogue of the protocol extensions available to the running binary.
#[derive(Default, Clone)]
pub struct ExtensionManager {
    extensions: Vec<Arc<dyn ProtocolExtension>>,
}

impl fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.extensions.iter().map(|e| e.identifier())).finish()
    }
}

impl ExtensionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ProtocolExtension + 'static>(&mut self, extension: T) {
        self.register_arc(Arc::new(extension));
    }

    /// Registers an extension the caller keeps a handle on (test doubles).
    pub fn register_arc(&mut self, extension: Arc<dyn ProtocolExtension>) {
        tracing::debug!("registered protocol extension {}", extension.identifier());
        self.extensions.push(extension);
    }

    pub fn with_extension<T: ProtocolExtension + 'static>(mut self, extension: T) -> Self {
        self.register(extension);
        self
    }

    pub fn extensions(&self) -> &[Arc<dyn ProtocolExtension>] {
        &self.extensions
    }

    pub fn list_extensions(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.identifier().to_string()).collect()
    }

    pub fn find_for_source(&self, source_type: SourceType) -> Option<&Arc<dyn ProtocolExtension>> {
        self.extensions.iter().find(|e| e.supported_sources().contains(&source_type))
    }

    pub fn find_for_criterion(&self, criterion_type: CriterionType) -> Option<&Arc<dyn ProtocolExtension>> {
        self.extensions.iter().find(|e| e.supported_criteria().contains(&criterion_type))
    }

    pub fn find_for_configuration_type(&self, configuration_type: &str) -> Option<&Arc<dyn ProtocolExtension>> {
        self.extensions.iter().find(|e| e.is_supported_configuration_type(configuration_type))
    }

    /// Whether the host carries a configuration `extension` accepts.
    pub fn has_valid_configuration(extension: &dyn ProtocolExtension, telemetry_manager: &TelemetryManager) -> bool {
        telemetry_manager
            .host_configuration()
            .configurations
            .iter()
            .any(|(tag, configuration)| {
                extension.is_supported_configuration_type(tag) && extension.is_valid_configuration(configuration.as_ref())
            })
    }

    pub fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<SourceTable, EngineError> {
        let source_type = source.source_type();
        let extension = self.find_for_source(source_type).ok_or(EngineError::NoExtensionForSource(source_type))?;

        if !Self::has_valid_configuration(extension.as_ref(), telemetry_manager) {
            return Err(EngineError::MissingConfiguration {
                kind: format!("{source_type:?} source"),
                key: extension.identifier().to_string(),
            });
        }

        Ok(extension.process_source(source, connector_id, telemetry_manager)?)
    }

    pub fn process_criterion(
        &self,
        criterion: &Criterion,
        connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<CriterionTestResult, EngineError> {
        let criterion_type = criterion.criterion_type();
        let extension = self
            .find_for_criterion(criterion_type)
            .ok_or(EngineError::NoExtensionForCriterion(criterion_type))?;

        if !Self::has_valid_configuration(extension.as_ref(), telemetry_manager) {
            return Ok(CriterionTestResult::failure(
                format!(
                    "No {} configuration found for {:?} criterion on {}",
                    extension.identifier(),
                    criterion_type,
                    telemetry_manager.hostname()
                ),
                None,
            ));
        }

        Ok(extension.process_criterion(criterion, connector_id, telemetry_manager)?)
    }

    /// Builds a typed configuration through the extension bound to
    /// `configuration_type`.
    pub fn build_configuration(
        &self,
        configuration_type: &str,
        raw: &serde_json::Value,
        decrypt: Option<DecryptFn<'_>>,
    ) -> Result<Box<dyn Configuration>, ExtensionError> {
        let extension = self
            .find_for_configuration_type(configuration_type)
            .ok_or_else(|| ExtensionError::UnsupportedConfigurationType(configuration_type.to_string()))?;
        extension.build_configuration(configuration_type, raw, decrypt)
    }
}
