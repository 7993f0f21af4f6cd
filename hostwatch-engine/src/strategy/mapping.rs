//! Evaluation of a job mapping against one source-table row.
//!
//! Two passes: the non-context pass is a pure function of the row (and of
//! the other monitors, for `lookup`), the context pass needs the monitor
//! being updated because `rate` and `fakeCounter` read its history.

use super::columns::{cell, column_number, format_number, replace_column_references};
use crate::collections::OrderedMap;
use crate::connector::Mapping;
use crate::macros;
use crate::source_table::SourceTable;
use crate::telemetry::{Monitor, TelemetryManager};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

const INDEX_MACRO: &str = "$index";

fn function_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)^\s*([a-z0-9]+)\((.*)\)\s*$").expect("valid function pattern"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Boolean,
    PercentToRatio,
    MegaHertzToHertz,
    MebiByteToByte,
    MegaBitToByte,
    MegaBitToBit,
    MilliVoltToVolt,
    Lookup,
    Rate,
    FakeCounter,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "boolean" => Function::Boolean,
            "percent2ratio" => Function::PercentToRatio,
            "megahertz2hertz" => Function::MegaHertzToHertz,
            "mebibyte2byte" => Function::MebiByteToByte,
            "megabit2byte" => Function::MegaBitToByte,
            "megabit2bit" => Function::MegaBitToBit,
            "millivolt2volt" => Function::MilliVoltToVolt,
            "lookup" => Function::Lookup,
            "rate" => Function::Rate,
            "fakecounter" => Function::FakeCounter,
            _ => return None,
        })
    }

    fn factor(self) -> Option<f64> {
        match self {
            Function::PercentToRatio => Some(0.01),
            Function::MegaHertzToHertz => Some(1_000_000.0),
            Function::MebiByteToByte => Some(1_048_576.0),
            Function::MegaBitToByte => Some(125_000.0),
            Function::MegaBitToBit => Some(1_000_000.0),
            Function::MilliVoltToVolt => Some(0.001),
            _ => None,
        }
    }

    fn is_context(self) -> bool {
        matches!(self, Function::Rate | Function::FakeCounter)
    }
}

/// `name(arg, ...)` split into a known function and its trimmed arguments.
fn parse_function(value: &str) -> Option<(Function, Vec<String>)> {
    let caps = function_pattern().captures(value)?;
    let function = Function::from_name(&caps[1])?;
    let arguments = caps[2]
        .split(',')
        .map(|arg| arg.trim().trim_matches('"').to_string())
        .collect();
    Some((function, arguments))
}

fn is_context_value(value: &str) -> bool {
    parse_function(value).is_some_and(|(function, _)| function.is_context())
}

pub struct MappingProcessor<'a> {
    telemetry_manager: &'a TelemetryManager,
    mapping: &'a Mapping,
    connector_id: &'a str,
    monitor_type: &'a str,
    stage_prefix: &'a str,
    collect_time: i64,
    row: &'a [String],
    index: usize,
}

impl<'a> MappingProcessor<'a> {
    pub fn new(
        telemetry_manager: &'a TelemetryManager,
        mapping: &'a Mapping,
        connector_id: &'a str,
        monitor_type: &'a str,
        stage_prefix: &'a str,
        collect_time: i64,
    ) -> Self {
        Self {
            telemetry_manager,
            mapping,
            connector_id,
            monitor_type,
            stage_prefix,
            collect_time,
            row: &[],
            index: 0,
        }
    }

    /// Points the processor at `row`, the `index`-th (1-based) of its table.
    pub fn with_row(mut self, row: &'a [String], index: usize) -> Self {
        self.row = row;
        self.index = index;
        self
    }

    pub fn interpret_non_context_attributes(&self) -> OrderedMap<String> {
        self.interpret_non_context(&self.mapping.attributes)
    }

    pub fn interpret_non_context_metrics(&self) -> OrderedMap<String> {
        self.interpret_non_context(&self.mapping.metrics)
    }

    pub fn interpret_legacy_text_parameters(&self) -> OrderedMap<String> {
        self.interpret_non_context(&self.mapping.legacy_text_parameters)
    }

    /// Context metrics of `monitor`. Records the raw counter samples the
    /// computations keep between cycles.
    pub fn interpret_context_metrics(&self, monitor: &mut Monitor) -> OrderedMap<String> {
        let mut result = OrderedMap::new();

        for (name, value) in self.mapping.metrics.iter() {
            let Some((function, arguments)) = parse_function(value) else { continue };
            if !function.is_context() {
                continue;
            }

            let Some(raw) = self.number_argument(name, &arguments) else {
                warn!(
                    "Hostname {} - Unable to extract the argument of {} for metric {} on monitor {}. No value will be set",
                    self.hostname(),
                    value,
                    name,
                    monitor.id
                );
                continue;
            };

            let computed = match function {
                Function::Rate => self.rate(monitor, name, raw),
                _ => self.fake_counter(monitor, name, raw),
            };

            match computed {
                Some(v) => {
                    result.insert(name, v.to_string());
                }
                None => debug!(
                    "Hostname {} - Cannot compute {} for monitor {}. Raw value {} at {}",
                    self.hostname(),
                    name,
                    monitor.id,
                    raw,
                    self.collect_time
                ),
            }
        }
        result
    }

    fn hostname(&self) -> &str {
        self.telemetry_manager.hostname()
    }

    fn interpret_non_context(&self, values: &OrderedMap<String>) -> OrderedMap<String> {
        let mut result = OrderedMap::new();
        for (key, value) in values.iter() {
            if is_context_value(value) {
                continue;
            }
            match self.interpret(key, value) {
                Some(v) => {
                    result.insert(key, v);
                }
                None => debug!(
                    "Hostname {} - Connector {} - {} mapping: no value for {} ({})",
                    self.hostname(),
                    self.connector_id,
                    self.monitor_type,
                    key,
                    value
                ),
            }
        }
        result
    }

    fn interpret(&self, key: &str, value: &str) -> Option<String> {
        if !macros::find_source_references(value).is_empty() {
            return Some(self.replace_source_references(value));
        }

        if let Some(column) = column_number(value) {
            return cell(self.row, column).map(str::to_string);
        }

        if let Some((function, arguments)) = parse_function(value) {
            return self.apply(key, function, &arguments);
        }

        Some(self.replace_inline(value))
    }

    fn apply(&self, key: &str, function: Function, arguments: &[String]) -> Option<String> {
        if let Some(factor) = function.factor() {
            return self.number_argument(key, arguments).map(|v| format_number(v * factor));
        }

        match function {
            Function::Boolean => {
                let value = self.argument(arguments.first()?)?;
                let truthy = value.trim() == "1" || value.trim().eq_ignore_ascii_case("true");
                Some(if truthy { "1" } else { "0" }.to_string())
            }
            Function::Lookup => self.lookup(arguments),
            _ => None,
        }
    }

    /// `lookup(type, attribute, lookupAttribute, lookupValue)`: `attribute`
    /// of the first monitor of `type` whose `lookupAttribute` equals
    /// `lookupValue`.
    fn lookup(&self, arguments: &[String]) -> Option<String> {
        let [monitor_type, attribute, lookup_attribute, lookup_value] = arguments else {
            warn!(
                "Hostname {} - Connector {} - lookup expects 4 arguments, got {}",
                self.hostname(),
                self.connector_id,
                arguments.len()
            );
            return None;
        };

        let lookup_value = self.argument(lookup_value)?;
        self.telemetry_manager
            .find_monitors_by_type(monitor_type)
            .values()
            .find(|monitor| monitor.attribute(lookup_attribute) == Some(lookup_value.as_str()))
            .and_then(|monitor| monitor.attribute(attribute).map(str::to_string))
    }

    /// Resolved value of a function argument: a column or an inline template.
    fn argument(&self, argument: &str) -> Option<String> {
        match column_number(argument) {
            Some(column) => cell(self.row, column).map(str::to_string),
            None => Some(self.replace_inline(argument)),
        }
    }

    fn number_argument(&self, key: &str, arguments: &[String]) -> Option<f64> {
        let value = self.argument(arguments.first()?)?;
        match value.trim().parse::<f64>() {
            Ok(number) => Some(number),
            Err(_) => {
                debug!(
                    "Hostname {} - Connector {} - {}: '{}' is not a number",
                    self.hostname(),
                    self.connector_id,
                    key,
                    value
                );
                None
            }
        }
    }

    fn replace_inline(&self, value: &str) -> String {
        let value = value.replace(INDEX_MACRO, &self.index.to_string());
        replace_column_references(&value, self.row)
    }

    fn replace_source_references(&self, value: &str) -> String {
        macros::replace_source_references(value, self.stage_prefix, |path| {
            self.telemetry_manager
                .source_tables()
                .get(self.connector_id, path)
                .map(SourceTable::to_csv)
        })
    }

    /// Per-second rate of a counter between this cycle and the previous one.
    fn rate(&self, monitor: &mut Monitor, name: &str, raw: f64) -> Option<f64> {
        let sample = monitor.record_counter_sample(&format!("{name}.rate_from"), raw, self.collect_time);
        let previous_value = sample.previous_value?;
        let elapsed = (self.collect_time - sample.previous_collect_time?) as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        Some((raw - previous_value) / elapsed)
    }

    /// Integrates a rate over the elapsed time into the counter `name`.
    fn fake_counter(&self, monitor: &mut Monitor, name: &str, raw: f64) -> Option<f64> {
        let previous_time = monitor
            .record_counter_sample(&format!("{name}.fake_counter_from"), raw, self.collect_time)
            .previous_collect_time?;
        let elapsed = (self.collect_time - previous_time) as f64 / 1000.0;
        let delta = raw * elapsed;

        let counter = monitor.get_number_metric(name).map(|m| m.value).unwrap_or_default();
        Some(counter + delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfiguration;
    use crate::connector::{ConnectorStore, DeviceKind};
    use crate::telemetry::MetricFactory;
    use std::sync::Arc;

    const PREFIX: &str = "monitors.fan.collect.sources";

    fn manager() -> TelemetryManager {
        TelemetryManager::new(HostConfiguration::new("srv-01", DeviceKind::Linux), Arc::new(ConnectorStore::new()))
    }

    fn mapping(attributes: &[(&str, &str)], metrics: &[(&str, &str)]) -> Mapping {
        Mapping {
            source: "${source::fans}".into(),
            attributes: attributes.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            metrics: metrics.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            legacy_text_parameters: OrderedMap::new(),
        }
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn columns_literals_and_templates() {
        let tm = manager();
        let mapping = mapping(
            &[("id", "$1"), ("name", "Fan $1 ($index)"), ("vendor", "Dell"), ("serial", "$9")],
            &[],
        );
        let row = row(&["1", "3500"]);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "fan", PREFIX, 0).with_row(&row, 2);

        let attributes = processor.interpret_non_context_attributes();
        assert_eq!(attributes.get("id").map(String::as_str), Some("1"));
        assert_eq!(attributes.get("name").map(String::as_str), Some("Fan 1 (2)"));
        assert_eq!(attributes.get("vendor").map(String::as_str), Some("Dell"));
        assert!(!attributes.contains_key("serial"));
    }

    #[test]
    fn unit_conversions_and_boolean() {
        let tm = manager();
        let mapping = mapping(
            &[],
            &[
                ("hw.fan.speed_ratio", "percent2Ratio($1)"),
                ("hw.cpu.speed", "megaHertz2Hertz($2)"),
                ("hw.memory.limit", "mebiByte2Byte($3)"),
                ("hw.voltage", "milliVolt2Volt($4)"),
                ("hw.status{state=\"present\"}", "boolean($5)"),
                ("hw.network.bandwidth.limit", "megaBit2Byte($6)"),
                ("hw.errors", "percent2Ratio($1"),
            ],
        );
        let row = row(&["50", "2400", "2", "12000", "true", "8"]);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "cpu", PREFIX, 0).with_row(&row, 1);

        let metrics = processor.interpret_non_context_metrics();
        assert_eq!(metrics.get("hw.fan.speed_ratio").map(String::as_str), Some("0.5"));
        assert_eq!(metrics.get("hw.cpu.speed").map(String::as_str), Some("2400000000"));
        assert_eq!(metrics.get("hw.memory.limit").map(String::as_str), Some("2097152"));
        assert_eq!(metrics.get("hw.voltage").map(String::as_str), Some("12"));
        assert_eq!(metrics.get("hw.status{state=\"present\"}").map(String::as_str), Some("1"));
        assert_eq!(metrics.get("hw.network.bandwidth.limit").map(String::as_str), Some("1000000"));
        // not a function call, kept as a literal
        assert_eq!(metrics.get("hw.errors").map(String::as_str), Some("percent2Ratio(50"));
    }

    #[test]
    fn lookup_reads_sibling_monitors() {
        let tm = manager();
        let mut enclosure = Monitor::new("enclosure", "dell_enclosure_1");
        enclosure.add_attribute("serial", "ABC123");
        enclosure.add_attribute("name", "Chassis");
        tm.monitors().add_monitor(enclosure);

        let mapping = mapping(&[("parent_name", "lookup(enclosure, name, serial, $2)")], &[]);
        let row = row(&["1", "ABC123"]);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "fan", PREFIX, 0).with_row(&row, 1);

        assert_eq!(
            processor.interpret_non_context_attributes().get("parent_name").map(String::as_str),
            Some("Chassis")
        );
    }

    #[test]
    fn source_references_are_replaced_with_csv() {
        let tm = manager();
        tm.source_tables()
            .put("dell", "monitors.fan.collect.sources.extra", SourceTable::from_rows([["a", "b"]]));

        let mapping = mapping(&[("info", "extra: ${source::extra}")], &[]);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "fan", PREFIX, 0);

        assert_eq!(
            processor.interpret_non_context_attributes().get("info").map(String::as_str),
            Some("extra: a;b")
        );
    }

    #[test]
    fn rate_needs_two_samples() {
        let tm = manager();
        let mapping = mapping(&[], &[("hw.network.io", "rate($1)")]);
        let mut monitor = Monitor::new("network", "eth0");

        let first = row(&["1000"]);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "network", PREFIX, 10_000).with_row(&first, 1);
        assert!(processor.interpret_non_context_metrics().is_empty());
        assert!(processor.interpret_context_metrics(&mut monitor).is_empty());

        let second = row(&["3000"]);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "network", PREFIX, 20_000).with_row(&second, 1);
        let metrics = processor.interpret_context_metrics(&mut monitor);
        assert_eq!(metrics.get("hw.network.io").map(String::as_str), Some("200"));
        assert!(monitor.metrics.is_empty());
        assert!(monitor.counter_samples.contains_key("hw.network.io.rate_from"));
    }

    #[test]
    fn fake_counter_accumulates_on_previous_counter() {
        let tm = manager();
        let mapping = mapping(&[], &[("hw.energy", "fakeCounter($1)")]);
        let mut monitor = Monitor::new("enclosure", "enc");
        let power = row(&["100"]);

        let processor = MappingProcessor::new(&tm, &mapping, "dell", "enclosure", PREFIX, 0).with_row(&power, 1);
        assert!(processor.interpret_context_metrics(&mut monitor).is_empty());

        let processor = MappingProcessor::new(&tm, &mapping, "dell", "enclosure", PREFIX, 60_000).with_row(&power, 1);
        let metrics = processor.interpret_context_metrics(&mut monitor);
        assert_eq!(metrics.get("hw.energy").map(String::as_str), Some("6000"));

        MetricFactory::new("srv-01").collect_number_metric(&mut monitor, "hw.energy", 6000.0, 60_000);
        let processor = MappingProcessor::new(&tm, &mapping, "dell", "enclosure", PREFIX, 120_000).with_row(&power, 1);
        let metrics = processor.interpret_context_metrics(&mut monitor);
        assert_eq!(metrics.get("hw.energy").map(String::as_str), Some("12000"));
    }
}
