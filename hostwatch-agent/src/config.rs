//! Agent configuration
//!
//! Handles:
//! - connector library location and polling interval
//! - monitored hosts with their connector directives
//! - per-host protocol configurations, built by the registered extensions

use anyhow::{Context, Result};
use hostwatch_engine::{DeviceKind, ExtensionManager, HostConfiguration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_connectors_dir")]
    pub connectors_dir: PathBuf,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub hostname: String,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default = "default_host_type")]
    pub host_type: DeviceKind,
    #[serde(default)]
    pub connectors: Vec<String>,
    #[serde(default)]
    pub configured_connector: Option<String>,
    #[serde(default)]
    pub sequential: bool,
    /// Raw protocol configurations keyed by configuration type.
    #[serde(default)]
    pub configurations: BTreeMap<String, toml::Value>,
}

fn default_connectors_dir() -> PathBuf {
    PathBuf::from("connectors")
}

fn default_interval_secs() -> u64 {
    120
}

fn default_host_type() -> DeviceKind {
    DeviceKind::Linux
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connectors_dir: default_connectors_dir(),
            interval_secs: default_interval_secs(),
            hosts: vec![HostEntry {
                hostname: "localhost".into(),
                host_id: None,
                host_type: default_host_type(),
                connectors: Vec::new(),
                configured_connector: None,
                sequential: false,
                configurations: BTreeMap::from([("commandline".to_string(), toml::Value::Table(Default::default()))]),
            }],
        }
    }
}

impl AgentConfig {
    /// Loads from `--config <path>`, `HOSTWATCH_AGENT_CONFIG` or the OS
    /// config directory, in that order. A missing file yields the default.
    pub async fn load(cli_path: Option<PathBuf>) -> Result<Self> {
        let path = match cli_path.or_else(|| std::env::var_os("HOSTWATCH_AGENT_CONFIG").map(PathBuf::from)) {
            Some(path) => path,
            None => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("no agent configuration at {}, monitoring localhost", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("hostwatch");
        path.push("agent.toml");
        Ok(path)
    }
}

impl HostEntry {
    /// Resolves the host, turning each raw protocol table into a typed
    /// configuration through the extension bound to its type.
    pub fn to_host_configuration(&self, extensions: &ExtensionManager) -> Result<HostConfiguration> {
        let mut host = HostConfiguration::new(&self.hostname, self.host_type)
            .with_connectors(self.connectors.iter().cloned())
            .with_sequential(self.sequential);
        if let Some(host_id) = &self.host_id {
            host = host.with_host_id(host_id);
        }
        host.configured_connector_id = self.configured_connector.clone();

        for (configuration_type, raw) in &self.configurations {
            let raw = serde_json::to_value(raw)?;
            let configuration = extensions
                .build_configuration(configuration_type, &raw, None)
                .with_context(|| format!("{} configuration of {}", configuration_type, self.hostname))?;
            host = host.with_configuration(Arc::from(configuration));
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::LocalCommandExtension;

    const SAMPLE: &str = r#"
connectors_dir = "/opt/hostwatch/connectors"
interval_secs = 60

[[hosts]]
hostname = "srv-01"
host_type = "windows"
connectors = ["+WindowsOS", "!#hardware"]

[hosts.configurations.commandline]
timeout_secs = 5
username = "monitor"
"#;

    #[tokio::test]
    async fn missing_file_monitors_localhost() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("agent.toml")).await.unwrap();
        assert_eq!(config.interval_secs, 120);
        assert_eq!(config.hosts[0].hostname, "localhost");
    }

    #[test]
    fn hosts_resolve_typed_configurations() {
        let config: AgentConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.interval_secs, 60);

        let extensions = ExtensionManager::new().with_extension(LocalCommandExtension::new());
        let host = config.hosts[0].to_host_configuration(&extensions).unwrap();
        assert_eq!(host.host_type, DeviceKind::Windows);
        assert_eq!(host.connectors, vec!["+WindowsOS", "!#hardware"]);
        let commandline = host.configuration("commandline").unwrap();
        assert_eq!(commandline.timeout(), Some(std::time::Duration::from_secs(5)));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut entry = AgentConfig::default().hosts.remove(0);
        entry.configurations.insert("ipmi".into(), toml::Value::Table(Default::default()));
        let extensions = ExtensionManager::new().with_extension(LocalCommandExtension::new());
        assert!(entry.to_host_configuration(&extensions).is_err());
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("hostwatch"));
        assert!(path.to_string_lossy().ends_with("agent.toml"));
    }
}
