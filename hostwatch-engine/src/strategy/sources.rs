//! Execution of the sources of one job stage.

use super::compute::ComputeProcessor;
use crate::collections::OrderedMap;
use crate::connector::source::TableJoinSource;
use crate::connector::{Connector, Source, SourceDefinition};
use crate::error::EngineError;
use crate::extension::ExtensionManager;
use crate::macros;
use crate::ordering;
use crate::source_table::{csv_to_table, SourceTable};
use crate::constants::TABLE_SEP;
use crate::telemetry::TelemetryManager;
use crate::text_table;
use std::collections::{BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Level};

pub const BEFORE_ALL_PREFIX: &str = "beforeAll";

/// Registry prefix of the sources of a job stage
/// (`monitors.<type>.<stage>.sources`).
pub fn stage_prefix(monitor_type: &str, stage: &str) -> String {
    format!("monitors.{monitor_type}.{stage}.sources")
}

/// Runs sources of one connector within one stage and registers their
/// tables under `<stage_prefix>.<key>`.
pub struct SourceProcessor<'a> {
    telemetry_manager: &'a TelemetryManager,
    extension_manager: &'a ExtensionManager,
    connector: &'a Connector,
    stage_prefix: &'a str,
}

impl<'a> SourceProcessor<'a> {
    pub fn new(
        telemetry_manager: &'a TelemetryManager,
        extension_manager: &'a ExtensionManager,
        connector: &'a Connector,
        stage_prefix: &'a str,
    ) -> Self {
        Self { telemetry_manager, extension_manager, connector, stage_prefix }
    }

    fn hostname(&self) -> &str {
        self.telemetry_manager.hostname()
    }

    fn connector_id(&self) -> &str {
        &self.connector.id
    }

    /// Runs every source of a stage in dependency order.
    ///
    /// A cyclic dependency fails the stage before any source runs. A source
    /// that came back empty while its previous table had rows runs once more.
    pub fn run_all(
        &self,
        job: &str,
        sources: &OrderedMap<Source>,
        execution_order: &[String],
        dependencies: &HashMap<String, BTreeSet<String>>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let order = ordering::resolve_order(job, sources, execution_order, dependencies, self.stage_prefix)?;

        for key in order {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let Some(source) = sources.get(&key) else { continue };
            let path = macros::qualify_path(&key, self.stage_prefix);

            let had_rows = self
                .telemetry_manager
                .source_tables()
                .get(self.connector_id(), &path)
                .is_some_and(|previous| !previous.table.is_empty());

            let mut table = self.process(&key, source)?;
            if table.table.is_empty() && had_rows {
                debug!(
                    "Hostname {} - Source {} of connector {} returned no rows, retrying once",
                    self.hostname(),
                    path,
                    self.connector_id()
                );
                table = self.process(&key, source)?;
            }

            if tracing::enabled!(Level::DEBUG) {
                debug!(
                    "Hostname {} - End of {:?} source [{}] for connector [{}].\nRaw result:\n{}\nTable result:\n{}",
                    self.hostname(),
                    source.source_type(),
                    path,
                    self.connector_id(),
                    table.raw_data.as_deref().unwrap_or_default(),
                    text_table::generate(&table.headers, &table.table)
                );
            }

            self.telemetry_manager.source_tables().put(self.connector_id(), &path, table);
        }
        Ok(())
    }

    /// Executes one source and applies its computes.
    pub fn process(&self, key: &str, source: &Source) -> Result<SourceTable, EngineError> {
        let mut table = if source.definition.is_internal() {
            self.process_internal(key, &source.definition)
        } else {
            self.process_external(key, source)?
        };

        ComputeProcessor::new(self.hostname(), self.connector_id(), key).process_all(&mut table, &source.computes);
        Ok(table)
    }

    fn lookup(&self, value: &str) -> Option<SourceTable> {
        self.telemetry_manager
            .source_tables()
            .lookup(value, self.connector_id(), self.stage_prefix)
    }

    fn lookup_or_empty(&self, key: &str, value: &str) -> SourceTable {
        self.lookup(value).unwrap_or_else(|| {
            debug!(
                "Hostname {} - Source {} of connector {}: {} is not available",
                self.hostname(),
                key,
                self.connector_id(),
                value
            );
            SourceTable::empty()
        })
    }

    fn process_internal(&self, key: &str, definition: &SourceDefinition) -> SourceTable {
        match definition {
            SourceDefinition::Copy(copy) => self.lookup_or_empty(key, &copy.from),
            SourceDefinition::Static(value) => self.lookup_or_empty(key, &value.value),
            SourceDefinition::TableUnion(union) => {
                let rows: Vec<Vec<String>> = union
                    .tables
                    .iter()
                    .filter_map(|table| self.lookup(table))
                    .flat_map(|table| table.table)
                    .collect();
                let mut table = SourceTable::from_rows(rows);
                table.raw_data = Some(table.to_csv());
                table
            }
            SourceDefinition::TableJoin(join) => {
                let (Some(left), Some(right)) = (self.lookup(&join.left_table), self.lookup(&join.right_table)) else {
                    debug!(
                        "Hostname {} - Join {} of connector {}: a table is missing",
                        self.hostname(),
                        key,
                        self.connector_id()
                    );
                    return SourceTable::empty();
                };
                let mut table = SourceTable::from_rows(join_tables(&left.table, &right.table, join));
                table.raw_data = Some(table.to_csv());
                table
            }
            _ => SourceTable::empty(),
        }
    }

    fn process_external(&self, key: &str, source: &Source) -> Result<SourceTable, EngineError> {
        let source = self.resolve_macros(source);

        if !source.force_serialization {
            return self.extension_manager.process_source(&source, self.connector_id(), self.telemetry_manager);
        }

        let timeout = self.telemetry_manager.settings().serialization_timeout();
        match self.telemetry_manager.serialization().serialize(self.connector_id(), timeout, || {
            self.extension_manager.process_source(&source, self.connector_id(), self.telemetry_manager)
        }) {
            Some(result) => result,
            None => {
                error!(
                    "Hostname {} - Source {} of connector {}: serialization lock not acquired within {}s",
                    self.hostname(),
                    key,
                    self.connector_id(),
                    timeout.as_secs()
                );
                Ok(SourceTable::empty())
            }
        }
    }

    /// Copy of `source` with embedded files inlined and source references
    /// replaced with the referenced tables.
    fn resolve_macros(&self, source: &Source) -> Source {
        let mut source = source.clone();
        for field in source.definition.text_fields_mut() {
            let inlined = macros::replace_file_references(field, &self.connector.embedded_files);
            *field = macros::replace_source_references(&inlined, self.stage_prefix, |path| {
                self.telemetry_manager
                    .source_tables()
                    .get(self.connector_id(), path)
                    .map(SourceTable::as_text)
            });
        }
        source
    }
}

/// Rows of `left` extended with the matching rows of `right`. Unmatched left
/// rows take the default right line when one is declared.
fn join_tables(left: &[Vec<String>], right: &[Vec<String>], join: &TableJoinSource) -> Vec<Vec<String>> {
    let ignore_case = join.key_type.as_deref().is_some_and(|t| t.eq_ignore_ascii_case("wbem"));
    let same_key = |a: &str, b: &str| if ignore_case { a.eq_ignore_ascii_case(b) } else { a == b };

    let default_right: Option<Vec<String>> = join
        .default_right_line
        .as_deref()
        .and_then(|line| csv_to_table(line, TABLE_SEP).into_iter().next());

    let mut rows = Vec::new();
    for left_row in left {
        let Some(left_key) = join.left_key_column.checked_sub(1).and_then(|i| left_row.get(i)) else {
            continue;
        };

        let mut matched = false;
        for right_row in right {
            let right_key = join.right_key_column.checked_sub(1).and_then(|i| right_row.get(i));
            if right_key.is_some_and(|k| same_key(left_key, k)) {
                matched = true;
                rows.push(left_row.iter().chain(right_row).cloned().collect());
            }
        }

        if let (false, Some(default)) = (matched, &default_right) {
            rows.push(left_row.iter().chain(default).cloned().collect());
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfiguration;
    use crate::connector::source::{CopySource, StaticSource, TableUnionSource};
    use crate::connector::{ConnectorStore, DeviceKind};
    use std::sync::Arc;

    const PREFIX: &str = "monitors.disk.collect.sources";

    fn join(key_type: Option<&str>, default_right_line: Option<&str>) -> TableJoinSource {
        TableJoinSource {
            left_table: "${source::left}".into(),
            right_table: "${source::right}".into(),
            left_key_column: 1,
            right_key_column: 2,
            default_right_line: default_right_line.map(str::to_string),
            key_type: key_type.map(str::to_string),
        }
    }

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter().map(|r| r.iter().map(|c| c.to_string()).collect()).collect()
    }

    #[test]
    fn join_matches_keys_and_uses_default_line() {
        let left = table(&[&["d1", "500"], &["d2", "250"], &["d3", "100"]]);
        let right = table(&[&["ok", "d1"], &["degraded", "D2"]]);

        assert_eq!(
            join_tables(&left, &right, &join(None, Some("unknown;none"))),
            table(&[&["d1", "500", "ok", "d1"], &["d2", "250", "unknown", "none"], &["d3", "100", "unknown", "none"]])
        );
        assert_eq!(
            join_tables(&left, &right, &join(Some("WBEM"), None)),
            table(&[&["d1", "500", "ok", "d1"], &["d2", "250", "degraded", "D2"]])
        );
    }

    #[test]
    fn internal_sources_read_the_registry() {
        let tm = TelemetryManager::new(
            HostConfiguration::new("srv-01", DeviceKind::Linux),
            Arc::new(ConnectorStore::new()),
        );
        let mut connector = Connector::default();
        connector.id = "dell".into();
        let extensions = ExtensionManager::new();
        let processor = SourceProcessor::new(&tm, &extensions, &connector, PREFIX);

        let mut sources: OrderedMap<Source> = OrderedMap::new();
        sources.insert("a", Source::new(SourceDefinition::Static(StaticSource { value: "d1;500\nd2;250".into() })));
        sources.insert("b", Source::new(SourceDefinition::Static(StaticSource { value: "d3;100".into() })));
        sources.insert(
            "all",
            Source::new(SourceDefinition::TableUnion(TableUnionSource {
                tables: vec!["${source::a}".into(), "${source::b}".into()],
            })),
        );
        sources.insert("copy", Source::new(SourceDefinition::Copy(CopySource { from: "${source::all}".into() })));

        processor
            .run_all("disk", &sources, &["copy".to_string()], &HashMap::new(), &CancellationToken::new())
            .unwrap();

        let registry = tm.source_tables();
        let copy = registry.get("dell", "monitors.disk.collect.sources.copy").unwrap();
        assert_eq!(copy.table.len(), 3);
        assert_eq!(copy.table[2], vec!["d3", "100"]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn cancelled_stage_stops_before_running_sources() {
        let tm = TelemetryManager::new(
            HostConfiguration::new("srv-01", DeviceKind::Linux),
            Arc::new(ConnectorStore::new()),
        );
        let connector = Connector::default();
        let extensions = ExtensionManager::new();
        let processor = SourceProcessor::new(&tm, &extensions, &connector, PREFIX);

        let mut sources: OrderedMap<Source> = OrderedMap::new();
        sources.insert("a", Source::new(SourceDefinition::Static(StaticSource { value: "1".into() })));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = processor.run_all("disk", &sources, &[], &HashMap::new(), &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(tm.source_tables().is_empty());
    }
}
