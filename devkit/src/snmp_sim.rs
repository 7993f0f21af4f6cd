/*!
Simulated SNMP agent

An in-memory MIB answering `snmpGet`/`snmpTable` sources and
`snmpGet`/`snmpGetNext` criteria the way a device would, so that connector
scenarios run end to end without a network.
*/

use hostwatch_engine::connector::{
    Criterion, CriterionDefinition, CriterionTestResult, CriterionType, Source, SourceDefinition, SourceType,
};
use hostwatch_engine::extension::{Configuration, DecryptFn, ProtocolExtension};
use hostwatch_engine::{ExtensionError, SourceTable, TelemetryManager};
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct SnmpConfiguration {
    #[serde(default = "default_community")]
    pub community: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_community() -> String {
    "public".into()
}

fn default_port() -> u16 {
    161
}

impl Default for SnmpConfiguration {
    fn default() -> Self {
        Self { community: default_community(), port: default_port() }
    }
}

impl Configuration for SnmpConfiguration {
    fn configuration_type(&self) -> &str {
        "snmp"
    }

    fn validate(&self, resource_key: &str) -> Result<(), ExtensionError> {
        if self.community.is_empty() {
            return Err(ExtensionError::InvalidConfiguration {
                configuration_type: "snmp".into(),
                message: format!("empty community for {resource_key}"),
            });
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Numeric OID, ordered the way an agent walks it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Oid(Vec<u32>);

impl Oid {
    fn parse(oid: &str) -> Option<Self> {
        oid.trim()
            .trim_start_matches('.')
            .split('.')
            .map(|part| part.parse().ok())
            .collect::<Option<Vec<u32>>>()
            .map(Oid)
    }

    fn starts_with(&self, prefix: &Oid) -> bool {
        self.0.starts_with(&prefix.0)
    }

    fn suffix(&self, prefix: &Oid) -> &[u32] {
        &self.0[prefix.0.len().min(self.0.len())..]
    }
}

impl Ord for Oid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Oid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn join(parts: &[u32]) -> String {
    parts.iter().map(u32::to_string).collect::<Vec<_>>().join(".")
}

/// In-memory agent. Clones share the MIB and the request counter.
#[derive(Clone, Default)]
pub struct SnmpSimulator {
    mib: Arc<RwLock<BTreeMap<Oid, String>>>,
    requests: Arc<AtomicUsize>,
}

impl SnmpSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one varbind. Invalid OIDs are ignored with a warning.
    pub fn set(&self, oid: &str, value: impl Into<String>) -> &Self {
        match Oid::parse(oid) {
            Some(parsed) => {
                self.mib.write().insert(parsed, value.into());
            }
            None => log::warn!("[SNMP SIM] ignoring invalid OID {oid}"),
        }
        self
    }

    pub fn with(self, oid: &str, value: impl Into<String>) -> Self {
        self.set(oid, value);
        self
    }

    /// Fills a conceptual table: `rows` are `(index, [(column, value)])`,
    /// stored under `<table>.1.<column>.<index>`.
    pub fn with_table(self, table_oid: &str, rows: &[(&str, &[(u32, &str)])]) -> Self {
        for (index, columns) in rows {
            for (column, value) in columns.iter() {
                self.set(&format!("{table_oid}.1.{column}.{index}"), *value);
            }
        }
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(AtomicOrdering::SeqCst)
    }

    pub fn get(&self, oid: &str) -> Option<String> {
        self.requests.fetch_add(1, AtomicOrdering::SeqCst);
        let oid = Oid::parse(oid)?;
        self.mib.read().get(&oid).cloned()
    }

    /// First varbind strictly after `oid`, as `(oid, value)`.
    pub fn get_next(&self, oid: &str) -> Option<(String, String)> {
        self.requests.fetch_add(1, AtomicOrdering::SeqCst);
        let oid = Oid::parse(oid)?;
        self.mib
            .read()
            .range(oid.clone()..)
            .find(|(candidate, _)| **candidate != oid)
            .map(|(next, value)| (join(&next.0), value.clone()))
    }

    /// Rows of the conceptual table under `table_oid`. `ID` selects the row
    /// index, a number selects that column. Missing cells are empty.
    pub fn table(&self, table_oid: &str, select_columns: &[String]) -> Vec<Vec<String>> {
        self.requests.fetch_add(1, AtomicOrdering::SeqCst);
        let Some(entry) = Oid::parse(&format!("{}.1", table_oid.trim_end_matches('.'))) else {
            return Vec::new();
        };

        let mib = self.mib.read();
        let mut cells: BTreeMap<Oid, BTreeMap<u32, String>> = BTreeMap::new();
        for (oid, value) in mib.range(entry.clone()..).take_while(|(oid, _)| oid.starts_with(&entry)) {
            let [column, index @ ..] = oid.suffix(&entry) else { continue };
            if index.is_empty() {
                continue;
            }
            cells.entry(Oid(index.to_vec())).or_default().insert(*column, value.clone());
        }

        cells
            .iter()
            .map(|(index, columns)| {
                select_columns
                    .iter()
                    .map(|selected| {
                        if selected.eq_ignore_ascii_case("id") {
                            return join(&index.0);
                        }
                        selected
                            .trim()
                            .parse::<u32>()
                            .ok()
                            .and_then(|column| columns.get(&column).cloned())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect()
    }

    fn matches_expected(expected: Option<&str>, value: &str) -> bool {
        match expected {
            None => true,
            Some(pattern) => Regex::new(&format!("(?i){pattern}")).map_or(false, |re| re.is_match(value)),
        }
    }
}

impl ProtocolExtension for SnmpSimulator {
    fn identifier(&self) -> &str {
        "snmp"
    }

    fn supported_sources(&self) -> &[SourceType] {
        &[SourceType::SnmpGet, SourceType::SnmpTable]
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &[CriterionType::SnmpGet, CriterionType::SnmpGetNext]
    }

    fn is_supported_configuration_type(&self, configuration_type: &str) -> bool {
        configuration_type.eq_ignore_ascii_case("snmp")
    }

    fn is_valid_configuration(&self, configuration: &dyn Configuration) -> bool {
        configuration.as_any().is::<SnmpConfiguration>()
    }

    fn check_protocol(&self, telemetry_manager: &TelemetryManager) -> Option<bool> {
        telemetry_manager.host_configuration().configuration("snmp")?;
        Some(self.get_next("1.3.6.1").is_some())
    }

    fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<SourceTable, ExtensionError> {
        let table = match &source.definition {
            SourceDefinition::SnmpGet(get) => match self.get(&get.oid) {
                Some(value) => SourceTable::from_rows([[value]]),
                None => SourceTable::empty(),
            },
            SourceDefinition::SnmpTable(table) => SourceTable::from_rows(self.table(&table.oid, &table.select_columns)),
            other => {
                return Err(ExtensionError::UnsupportedSource {
                    extension: "snmp".into(),
                    source_type: other.source_type(),
                })
            }
        };
        log::debug!(
            "[SNMP SIM] {} - {}: {} row(s)",
            telemetry_manager.hostname(),
            connector_id,
            table.table.len()
        );
        Ok(table)
    }

    fn process_criterion(
        &self,
        criterion: &Criterion,
        _connector_id: &str,
        telemetry_manager: &TelemetryManager,
    ) -> Result<CriterionTestResult, ExtensionError> {
        let hostname = telemetry_manager.hostname();
        let result = match &criterion.definition {
            CriterionDefinition::SnmpGet(get) => match self.get(&get.oid) {
                Some(value) if Self::matches_expected(get.expected_result.as_deref(), &value) => {
                    CriterionTestResult::success(format!("SNMP Get of {} on {hostname} succeeded", get.oid), value)
                }
                Some(value) => CriterionTestResult::failure(
                    format!("SNMP Get of {} on {hostname} returned an unexpected value", get.oid),
                    Some(value),
                ),
                None => CriterionTestResult::failure(format!("SNMP Get of {} on {hostname} returned nothing", get.oid), None),
            },
            CriterionDefinition::SnmpGetNext(next) => {
                let prefix = Oid::parse(&next.oid);
                match self.get_next(&next.oid) {
                    Some((oid, value))
                        if prefix.as_ref().zip(Oid::parse(&oid)).is_some_and(|(p, o)| o.starts_with(p))
                            && Self::matches_expected(next.expected_result.as_deref(), &value) =>
                    {
                        CriterionTestResult::success(
                            format!("SNMP GetNext of {} on {hostname} succeeded", next.oid),
                            format!("{oid} ASN_OCTET_STR {value}"),
                        )
                    }
                    other => CriterionTestResult::failure(
                        format!("SNMP GetNext of {} on {hostname} found nothing under the OID", next.oid),
                        other.map(|(oid, value)| format!("{oid} ASN_OCTET_STR {value}")),
                    ),
                }
            }
            other => {
                return Err(ExtensionError::UnsupportedCriterion {
                    extension: "snmp".into(),
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
        let mut configuration: SnmpConfiguration = serde_json::from_value(raw.clone())?;
        if let Some(decrypt) = decrypt {
            configuration.community = decrypt(&configuration.community);
        }
        configuration.validate("snmp")?;
        Ok(Box::new(configuration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fans() -> SnmpSimulator {
        SnmpSimulator::new().with_table(
            "1.3.6.1.4.1.674.10892.1.700.12",
            &[("1.1", &[(2, "1"), (9, "4200"), (11, "ok")]), ("1.2", &[(2, "2"), (9, "3900"), (11, "ok")])],
        )
    }

    #[test]
    fn walks_conceptual_tables() {
        let rows = fans().table("1.3.6.1.4.1.674.10892.1.700.12", &["ID".into(), "9".into(), "11".into(), "5".into()]);
        assert_eq!(
            rows,
            vec![vec!["1.1", "4200", "ok", ""], vec!["1.2", "3900", "ok", ""]]
        );
    }

    #[test]
    fn get_next_follows_numeric_order() {
        let sim = SnmpSimulator::new().with("1.3.6.1.2.1.1.10.0", "ten").with("1.3.6.1.2.1.1.9.0", "nine");
        assert_eq!(sim.get_next("1.3.6.1.2.1.1.9.0"), Some(("1.3.6.1.2.1.1.10.0".into(), "ten".into())));
        assert_eq!(sim.get_next("1.3.6.1.2.1.1.10.0"), None);
        assert_eq!(sim.requests(), 2);
    }
}
