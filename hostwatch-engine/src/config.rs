use crate::connector::DeviceKind;
use crate::constants::{DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_MAX_THREADS, DEFAULT_SERIALIZATION_TIMEOUT_SECS};
use crate::extension::Configuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

/// Engine-wide tuning, read from `engine.yaml` (or `$HOSTWATCH_ENGINE_CONFIG`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Worker pool size for the non-priority monitor jobs of one connector.
    pub max_threads: usize,
    /// Bound on the wait for the worker pool.
    pub job_timeout_secs: u64,
    /// Bound on the wait for a connector's serialization lock.
    pub serialization_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            serialization_timeout_secs: DEFAULT_SERIALIZATION_TIMEOUT_SECS,
        }
    }
}

impl EngineSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn serialization_timeout(&self) -> Duration {
        Duration::from_secs(self.serialization_timeout_secs)
    }
}

pub async fn load_settings() -> EngineSettings {
    let path = std::env::var("HOSTWATCH_ENGINE_CONFIG").unwrap_or_else(|_| "engine.yaml".into());
    if !Path::new(&path).exists() {
        tracing::debug!("no {path}, using default engine settings");
        return EngineSettings::default();
    }

    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return EngineSettings::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        tracing::warn!("invalid engine settings in {path}: {e}");
        EngineSettings::default()
    })
}

/// Everything the strategies need to know about one monitored host.
#[derive(Debug, Clone)]
pub struct HostConfiguration {
    pub hostname: String,
    pub host_id: String,
    pub host_type: DeviceKind,
    /// Connector directives: `id`, `+id`, `!id`, `#tag`, `!#tag`.
    pub connectors: Vec<String>,
    /// Custom connector attached to the host without detection.
    pub configured_connector_id: Option<String>,
    /// Runs every monitor job of a connector sequentially.
    pub sequential: bool,
    /// Protocol configurations keyed by configuration type (`snmp`, `http`...).
    pub configurations: BTreeMap<String, Arc<dyn Configuration>>,
}

impl HostConfiguration {
    pub fn new(hostname: impl Into<String>, host_type: DeviceKind) -> Self {
        let hostname = hostname.into();
        Self {
            host_id: hostname.clone(),
            hostname,
            host_type,
            connectors: Vec::new(),
            configured_connector_id: None,
            sequential: false,
            configurations: BTreeMap::new(),
        }
    }

    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    pub fn with_connectors<I, S>(mut self, directives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connectors = directives.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_configuration(mut self, configuration: Arc<dyn Configuration>) -> Self {
        self.configurations
            .insert(configuration.configuration_type().to_string(), configuration);
        self
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }

    pub fn configuration(&self, configuration_type: &str) -> Option<&Arc<dyn Configuration>> {
        self.configurations.get(configuration_type)
    }

    pub fn is_localhost(&self) -> bool {
        matches!(self.hostname.to_ascii_lowercase().as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}
