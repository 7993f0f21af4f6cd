//! Tables produced by sources and the per-host registry that caches them.

use crate::constants::TABLE_SEP;
use crate::macros;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered rows of ordered string cells. `raw_data` keeps the unparsed
/// payload when the protocol returns one (command output, HTTP body).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceTable {
    pub table: Vec<Vec<String>>,
    #[serde(default)]
    pub raw_data: Option<String>,
    #[serde(default)]
    pub headers: Vec<String>,
}

impl SourceTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows<R, C>(rows: R) -> Self
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            table: rows.into_iter().map(|row| row.into_iter().map(Into::into).collect()).collect(),
            ..Self::default()
        }
    }

    /// Parses `;`-separated cells and `\n`-separated rows. Blank lines are
    /// skipped and trailing empty cells dropped.
    pub fn from_csv(csv: &str) -> Self {
        Self {
            table: csv_to_table(csv, TABLE_SEP),
            raw_data: Some(csv.to_string()),
            headers: Vec::new(),
        }
    }

    pub fn to_csv(&self) -> String {
        table_to_csv(&self.table, TABLE_SEP)
    }

    /// Text form used when the table is inlined in another source: the
    /// raw payload when no rows were parsed.
    pub fn as_text(&self) -> String {
        match (&self.raw_data, self.table.is_empty()) {
            (Some(raw), true) => raw.clone(),
            _ => self.to_csv(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty() && self.raw_data.as_deref().map_or(true, str::is_empty)
    }

    pub fn first_row(&self) -> Option<&Vec<String>> {
        self.table.first()
    }
}

pub fn csv_to_table(csv: &str, separator: &str) -> Vec<Vec<String>> {
    csv.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut cells: Vec<String> = line.split(separator).map(str::to_string).collect();
            while cells.last().is_some_and(String::is_empty) {
                cells.pop();
            }
            cells
        })
        .collect()
}

pub fn table_to_csv(table: &[Vec<String>], separator: &str) -> String {
    table.iter().map(|row| row.join(separator)).collect::<Vec<_>>().join("\n")
}

/// Tables registered during a strategy run, keyed by connector id and full
/// source path (`monitors.fan.collect.sources.fanTable`, `beforeAll.ids`).
/// Entries are overwritten by the next run, which lets a source compare its
/// result with the previous cycle.
#[derive(Debug, Default)]
pub struct SourceTableRegistry {
    tables: HashMap<(String, String), SourceTable>,
}

impl SourceTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, connector_id: &str, path: &str, table: SourceTable) {
        self.tables.insert((connector_id.to_string(), path.to_string()), table);
    }

    pub fn get(&self, connector_id: &str, path: &str) -> Option<&SourceTable> {
        self.tables.get(&(connector_id.to_string(), path.to_string()))
    }

    pub fn remove(&mut self, connector_id: &str, path: &str) -> Option<SourceTable> {
        self.tables.remove(&(connector_id.to_string(), path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Resolves `value` to a table: a whole `${source::...}` reference is
    /// looked up (relative paths against `stage_prefix`), anything else is
    /// parsed as a literal CSV. `None` means a reference to a table that was
    /// never registered.
    pub fn lookup(&self, value: &str, connector_id: &str, stage_prefix: &str) -> Option<SourceTable> {
        if macros::is_source_reference(value) {
            let path = macros::qualify_reference(value, stage_prefix)?;
            self.get(connector_id, &path).cloned()
        } else {
            Some(SourceTable::from_csv(value))
        }
    }
}
