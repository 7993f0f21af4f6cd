use crate::connector::{CriterionType, SourceType};

/// Errors surfaced by the strategies.
///
/// Configuration errors are confined to the monitor job or connector they
/// belong to. Dispatch errors mean the running binary lacks a protocol a
/// connector references and are propagated out of the strategy run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cyclic source dependency in {job}: [{cycle}]")]
    CyclicDependency { job: String, cycle: String },
    #[error("no configuration for protocol of {kind} '{key}'")]
    MissingConfiguration { kind: String, key: String },
    #[error("connector not found: {0}")]
    UnknownConnector(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("no extension handles source type {0:?}")]
    NoExtensionForSource(SourceType),
    #[error("no extension handles criterion type {0:?}")]
    NoExtensionForCriterion(CriterionType),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error("job cancelled")]
    Cancelled,
    #[error("jobs did not complete within {0}s")]
    Timeout(u64),
    #[error("job panicked or was aborted: {0}")]
    Join(String),
}

impl EngineError {
    /// Programming errors: a handler is missing for a declared type.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::NoExtensionForSource(_) | EngineError::NoExtensionForCriterion(_) => true,
            EngineError::Extension(e) => e.is_dispatch_error(),
            _ => false,
        }
    }
}

/// Errors returned by protocol extensions.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension {extension} cannot process source type {source_type:?}")]
    UnsupportedSource { extension: String, source_type: SourceType },
    #[error("extension {extension} cannot process criterion type {criterion_type:?}")]
    UnsupportedCriterion { extension: String, criterion_type: CriterionType },
    #[error("unsupported configuration type: {0}")]
    UnsupportedConfigurationType(String),
    #[error("invalid {configuration_type} configuration: {message}")]
    InvalidConfiguration { configuration_type: String, message: String },
    #[error("configuration decoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtensionError {
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            ExtensionError::UnsupportedSource { .. } | ExtensionError::UnsupportedCriterion { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dispatch_errors_are_fatal() {
        assert!(EngineError::NoExtensionForSource(SourceType::SnmpTable).is_fatal());
        assert!(EngineError::Extension(ExtensionError::UnsupportedCriterion {
            extension: "snmp".into(),
            criterion_type: CriterionType::Wmi,
        })
        .is_fatal());

        assert!(!EngineError::CyclicDependency { job: "fan".into(), cycle: "a, b".into() }.is_fatal());
        assert!(!EngineError::Timeout(120).is_fatal());
        assert!(!EngineError::Extension(ExtensionError::UnsupportedConfigurationType("ftp".into())).is_fatal());
    }
}
