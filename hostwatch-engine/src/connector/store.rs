use super::Connector;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Read-only connector library, keyed by compiled file name.
/// Built once by the process root and shared by every host.
#[derive(Debug, Default)]
pub struct ConnectorStore {
    connectors: BTreeMap<String, Arc<Connector>>,
}

impl ConnectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `connector` under `id`, replacing any previous definition.
    pub fn add(&mut self, id: impl Into<String>, mut connector: Connector) {
        let id = id.into();
        connector.id = id.clone();
        self.connectors.insert(id, Arc::new(connector));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connector>> {
        self.connectors.get(id).cloned()
    }

    /// Case-insensitive lookup, used by the connector directives.
    pub fn find_ignore_case(&self, id: &str) -> Option<Arc<Connector>> {
        self.get(id)
            .or_else(|| self.connectors.iter().find(|(k, _)| k.eq_ignore_ascii_case(id)).map(|(_, c)| c.clone()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Arc<Connector>> {
        self.connectors.values()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Loads every `*.yaml` / `*.yml` file of `dir`. The file stem is the
    /// connector id. A file that does not parse fails the whole load.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut store = Self::new();
        let entries = std::fs::read_dir(dir).with_context(|| format!("reading connector directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let is_yaml = matches!(path.extension().and_then(|s| s.to_str()), Some("yaml" | "yml"));
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).filter(|_| is_yaml) else {
                continue;
            };

            let content = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let connector: Connector =
                serde_yaml::from_str(&content).with_context(|| format!("parsing connector {}", path.display()))?;
            tracing::debug!("loaded connector {} ({} monitor jobs)", id, connector.monitors.len());
            store.add(id, connector);
        }

        tracing::info!("{} connectors loaded from {}", store.len(), dir.display());
        Ok(store)
    }
}

impl FromIterator<Connector> for ConnectorStore {
    /// Uses each connector's `id` as key.
    fn from_iter<I: IntoIterator<Item = Connector>>(iter: I) -> Self {
        let mut store = Self::new();
        for connector in iter {
            let id = connector.id.clone();
            store.add(id, connector);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_yaml_files_keyed_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("LinuxProcess.yaml"),
            "connector:\n  displayName: Linux processes\n  detection:\n    appliesTo: [linux]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("Empty.yml"), "{}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a connector").unwrap();

        let store = ConnectorStore::load_dir(dir.path()).unwrap();

        assert_eq!(store.ids().collect::<Vec<_>>(), vec!["Empty", "LinuxProcess"]);
        let linux = store.get("LinuxProcess").unwrap();
        assert_eq!(linux.id, "LinuxProcess");
        assert_eq!(linux.connector.display_name.as_deref(), Some("Linux processes"));
        assert!(store.find_ignore_case("linuxprocess").is_some());
    }

    #[test]
    fn invalid_file_fails_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Broken.yaml"), "monitors: [not, a, map]").unwrap();

        let err = ConnectorStore::load_dir(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Broken.yaml"));
    }
}
