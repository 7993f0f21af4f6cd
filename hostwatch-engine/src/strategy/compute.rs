//! Post-processing of source tables. Every compute keeps the table shape
//! (ordered rows of ordered cells); a row whose column is out of range is
//! left untouched.

use super::columns::{cell, contains_column_references, format_number, replace_column_references, resolve_operand};
use crate::connector::compute::{
    ArithmeticCompute, ConcatCompute, ExtractCompute, KeepColumnsCompute, MatchingLinesCompute, ReplaceCompute,
    SubstringCompute, TranslateCompute,
};
use crate::connector::Compute;
use crate::source_table::SourceTable;
use regex::RegexBuilder;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

pub struct ComputeProcessor<'a> {
    hostname: &'a str,
    connector_id: &'a str,
    source_key: &'a str,
}

impl<'a> ComputeProcessor<'a> {
    pub fn new(hostname: &'a str, connector_id: &'a str, source_key: &'a str) -> Self {
        Self { hostname, connector_id, source_key }
    }

    /// Applies `computes` in declaration order and refreshes `raw_data`.
    pub fn process_all(&self, table: &mut SourceTable, computes: &[Compute]) {
        if computes.is_empty() {
            return;
        }
        for compute in computes {
            self.process(table, compute);
            debug!(
                "Hostname {} - Compute {} applied on {} ({}): {} rows",
                self.hostname,
                compute.name(),
                self.source_key,
                self.connector_id,
                table.table.len()
            );
        }
        table.raw_data = Some(table.to_csv());
    }

    pub fn process(&self, table: &mut SourceTable, compute: &Compute) {
        match compute {
            Compute::Add(c) => self.arithmetic(table, c, |a, b| Some(a + b)),
            Compute::Subtract(c) => self.arithmetic(table, c, |a, b| Some(a - b)),
            Compute::Multiply(c) => self.arithmetic(table, c, |a, b| Some(a * b)),
            Compute::Divide(c) => self.arithmetic(table, c, |a, b| (b != 0.0).then(|| a / b)),
            Compute::And(c) => self.bitwise_and(table, c),
            Compute::Append(c) => self.concat(table, c, false),
            Compute::Prepend(c) => self.concat(table, c, true),
            Compute::DuplicateColumn(c) => duplicate_column(table, c.column),
            Compute::KeepColumns(c) => self.keep_columns(table, c),
            Compute::KeepOnlyMatchingLines(c) => self.matching_lines(table, c, true),
            Compute::ExcludeMatchingLines(c) => self.matching_lines(table, c, false),
            Compute::Replace(c) => replace(table, c),
            Compute::Translate(c) => translate(table, c),
            Compute::Substring(c) => substring(table, c),
            Compute::Extract(c) => extract(table, c),
        }
    }

    fn arithmetic(&self, table: &mut SourceTable, compute: &ArithmeticCompute, op: impl Fn(f64, f64) -> Option<f64>) {
        for row in &mut table.table {
            let Some(operand) = resolve_operand(&compute.value, row) else { continue };
            let Some(current) = cell(row, compute.column) else { continue };

            match (current.trim().parse::<f64>(), operand.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => {
                    if let Some(result) = op(a, b) {
                        row[compute.column - 1] = format_number(result);
                    }
                }
                _ => debug!(
                    "Hostname {} - Cannot compute '{}' with '{}' in {} ({})",
                    self.hostname, current, operand, self.source_key, self.connector_id
                ),
            }
        }
    }

    fn bitwise_and(&self, table: &mut SourceTable, compute: &ArithmeticCompute) {
        for row in &mut table.table {
            let Some(operand) = resolve_operand(&compute.value, row) else { continue };
            let Some(current) = cell(row, compute.column) else { continue };

            if let (Ok(a), Ok(b)) = (current.trim().parse::<i64>(), operand.trim().parse::<i64>()) {
                row[compute.column - 1] = (a & b).to_string();
            }
        }
    }

    fn concat(&self, table: &mut SourceTable, compute: &ConcatCompute, prepend: bool) {
        for row in &mut table.table {
            let value = if contains_column_references(&compute.value) {
                replace_column_references(&compute.value, row)
            } else {
                compute.value.clone()
            };
            let Some(current) = cell(row, compute.column) else { continue };

            row[compute.column - 1] = if prepend { format!("{value}{current}") } else { format!("{current}{value}") };
        }
    }

    fn keep_columns(&self, table: &mut SourceTable, compute: &KeepColumnsCompute) {
        let columns: BTreeSet<usize> = compute
            .column_numbers
            .iter()
            .filter_map(|c| c.trim().parse().ok())
            .filter(|c| *c >= 1)
            .collect();
        if columns.is_empty() {
            warn!(
                "Hostname {} - keepColumns without valid column numbers in {} ({}), the table remains unchanged",
                self.hostname, self.source_key, self.connector_id
            );
            return;
        }

        for row in &mut table.table {
            if columns.iter().any(|c| *c > row.len()) {
                continue;
            }
            *row = columns.iter().map(|c| row[c - 1].clone()).collect();
        }
    }

    fn matching_lines(&self, table: &mut SourceTable, compute: &MatchingLinesCompute, keep: bool) {
        let matcher: Box<dyn Fn(&str) -> bool> = match (&compute.regexp, compute.value_list.is_empty()) {
            (Some(pattern), _) => match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => Box::new(move |value: &str| regex.is_match(value)),
                Err(e) => {
                    warn!(
                        "Hostname {} - Invalid regexp '{}' in {} ({}): {}, the table remains unchanged",
                        self.hostname, pattern, self.source_key, self.connector_id, e
                    );
                    return;
                }
            },
            (None, false) => {
                let values: HashSet<String> = compute.value_list.iter().map(|v| v.to_lowercase()).collect();
                Box::new(move |value: &str| values.contains(&value.to_lowercase()))
            }
            (None, true) => return,
        };

        table.table.retain(|row| match cell(row, compute.column) {
            Some(value) => matcher(value) == keep,
            None => true,
        });
    }
}

fn duplicate_column(table: &mut SourceTable, column: usize) {
    for row in &mut table.table {
        if let Some(value) = cell(row, column).map(str::to_string) {
            row.insert(column, value);
        }
    }
}

fn replace(table: &mut SourceTable, compute: &ReplaceCompute) {
    for row in &mut table.table {
        let (Some(existing), Some(new_value)) =
            (resolve_operand(&compute.existing_value, row), resolve_operand(&compute.new_value, row))
        else {
            continue;
        };
        if existing.is_empty() {
            continue;
        }
        if let Some(current) = cell(row, compute.column) {
            row[compute.column - 1] = current.replace(&existing, &new_value);
        }
    }
}

/// Case-insensitive lookup, falling back to the `default` entry.
fn translate(table: &mut SourceTable, compute: &TranslateCompute) {
    let translations: HashMap<String, &String> =
        compute.translation_table.iter().map(|(k, v)| (k.to_lowercase(), v)).collect();
    let default = translations.get("default").copied();

    for row in &mut table.table {
        let Some(current) = cell(row, compute.column) else { continue };
        if let Some(new_value) = translations.get(&current.to_lowercase()).copied().or(default) {
            row[compute.column - 1] = new_value.clone();
        }
    }
}

/// `start` is 1-based; both operands may be `$n` references.
fn substring(table: &mut SourceTable, compute: &SubstringCompute) {
    for row in &mut table.table {
        let start = resolve_operand(&compute.start, row).and_then(|s| s.trim().parse::<usize>().ok());
        let length = resolve_operand(&compute.length, row).and_then(|s| s.trim().parse::<usize>().ok());
        let (Some(start), Some(length)) = (start, length) else { continue };
        let Some(current) = cell(row, compute.column) else { continue };
        if start == 0 || start > current.chars().count() + 1 {
            continue;
        }

        row[compute.column - 1] = current.chars().skip(start - 1).take(length).collect();
    }
}

/// Splits the cell on any of `sub_separators` (empty tokens skipped) and
/// keeps the `sub_column`th token.
fn extract(table: &mut SourceTable, compute: &ExtractCompute) {
    if compute.sub_separators.is_empty() || compute.sub_column == 0 {
        return;
    }
    for row in &mut table.table {
        let Some(current) = cell(row, compute.column) else { continue };
        let token = current
            .split(|c| compute.sub_separators.contains(c))
            .filter(|t| !t.is_empty())
            .nth(compute.sub_column - 1)
            .unwrap_or_default()
            .to_string();
        row[compute.column - 1] = token;
    }
}
